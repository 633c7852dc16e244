//! Batch assembly and tensor collation
//!
//! The per-conversation packers are mapped over a batch of conversations and
//! their outputs concatenated column by column. Output order follows input
//! order, and within a conversation the evaluation boundary order.

use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::conversation::Conversation;
use super::image::ImageSlotResolver;
use super::packing::{pack_for_training, PackingOptions};
use super::splitting::split_for_eval;
use super::tokenizer::ChatTokenizer;
use super::{DataError, ProcessingMode};
use crate::error::Result;

/// Columnar training batch
#[derive(Debug, Clone, Default)]
pub struct TrainingBatch {
    /// Left-padded token ids
    pub input_ids: Vec<Vec<u32>>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<Vec<u32>>,
    /// Positions counted over real tokens
    pub position_ids: Vec<Vec<u32>>,
    /// Loss targets, `-100` where ignored
    pub labels: Vec<Vec<i64>>,
    /// One `(1, 3, H, W)` tensor per example
    pub pixel_values: Vec<Tensor>,
}

/// Columnar evaluation batch
#[derive(Debug, Clone, Default)]
pub struct EvalBatch {
    /// Left-padded prompt ids
    pub input_ids: Vec<Vec<u32>>,
    /// Prompt attention mask
    pub attention_mask: Vec<Vec<u32>>,
    /// Prompt positions
    pub position_ids: Vec<Vec<u32>>,
    /// Left-padded reference ids
    pub output_ids: Vec<Vec<u32>>,
    /// One `(1, 3, H, W)` tensor per example
    pub pixel_values: Vec<Tensor>,
}

/// Stacked training tensors
#[derive(Debug, Clone)]
pub struct TrainingTensors {
    /// `(N, L)` u32
    pub input_ids: Tensor,
    /// `(N, L)` u32
    pub attention_mask: Tensor,
    /// `(N, L)` u32
    pub position_ids: Tensor,
    /// `(N, L)` i64
    pub labels: Tensor,
    /// `(N, 3, H, W)` f32
    pub pixel_values: Tensor,
}

/// Stacked evaluation tensors
#[derive(Debug, Clone)]
pub struct EvalTensors {
    /// `(N, L_in)` u32
    pub input_ids: Tensor,
    /// `(N, L_in)` u32
    pub attention_mask: Tensor,
    /// `(N, L_in)` u32
    pub position_ids: Tensor,
    /// `(N, L_out)` u32
    pub output_ids: Tensor,
    /// `(N, 3, H, W)` f32
    pub pixel_values: Tensor,
}

/// Stack equal-length rows into an `(N, L)` tensor
fn stack_rows<T: candle_core::WithDType>(name: &str, rows: &[Vec<T>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = rows.iter().find(|r| r.len() != width) {
        return Err(DataError::BatchCollationError {
            reason: format!("{} rows have different lengths ({} vs {})", name, row.len(), width),
        }
        .into());
    }

    let flat: Vec<T> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

fn stack_pixels(pixels: &[Tensor], device: &Device) -> Result<Tensor> {
    Ok(Tensor::cat(pixels, 0)?.to_device(device)?)
}

fn ensure_non_empty(len: usize) -> Result<()> {
    if len == 0 {
        return Err(DataError::BatchCollationError {
            reason: "cannot collate an empty batch".to_string(),
        }
        .into());
    }
    Ok(())
}

impl TrainingBatch {
    /// Number of examples
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the batch holds no examples
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Append the columns of another batch
    pub fn extend(&mut self, other: TrainingBatch) {
        self.input_ids.extend(other.input_ids);
        self.attention_mask.extend(other.attention_mask);
        self.position_ids.extend(other.position_ids);
        self.labels.extend(other.labels);
        self.pixel_values.extend(other.pixel_values);
    }

    /// Stack every column into a tensor on `device`
    pub fn to_tensors(&self, device: &Device) -> Result<TrainingTensors> {
        ensure_non_empty(self.len())?;
        Ok(TrainingTensors {
            input_ids: stack_rows("input_ids", &self.input_ids, device)?,
            attention_mask: stack_rows("attention_mask", &self.attention_mask, device)?,
            position_ids: stack_rows("position_ids", &self.position_ids, device)?,
            labels: stack_rows("labels", &self.labels, device)?,
            pixel_values: stack_pixels(&self.pixel_values, device)?,
        })
    }

    /// Write the batch to a `.safetensors` file
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = self.to_tensors(&Device::Cpu)?;
        let map: HashMap<&str, Tensor> = HashMap::from([
            ("input_ids", tensors.input_ids),
            ("attention_mask", tensors.attention_mask),
            ("position_ids", tensors.position_ids),
            ("labels", tensors.labels),
            ("pixel_values", tensors.pixel_values),
        ]);
        candle_core::safetensors::save(&map, path.as_ref())?;
        Ok(())
    }
}

impl EvalBatch {
    /// Number of examples
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the batch holds no examples
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Append the columns of another batch
    pub fn extend(&mut self, other: EvalBatch) {
        self.input_ids.extend(other.input_ids);
        self.attention_mask.extend(other.attention_mask);
        self.position_ids.extend(other.position_ids);
        self.output_ids.extend(other.output_ids);
        self.pixel_values.extend(other.pixel_values);
    }

    /// Stack every column into a tensor on `device`
    pub fn to_tensors(&self, device: &Device) -> Result<EvalTensors> {
        ensure_non_empty(self.len())?;
        Ok(EvalTensors {
            input_ids: stack_rows("input_ids", &self.input_ids, device)?,
            attention_mask: stack_rows("attention_mask", &self.attention_mask, device)?,
            position_ids: stack_rows("position_ids", &self.position_ids, device)?,
            output_ids: stack_rows("output_ids", &self.output_ids, device)?,
            pixel_values: stack_pixels(&self.pixel_values, device)?,
        })
    }

    /// Write the batch to a `.safetensors` file
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = self.to_tensors(&Device::Cpu)?;
        let map: HashMap<&str, Tensor> = HashMap::from([
            ("input_ids", tensors.input_ids),
            ("attention_mask", tensors.attention_mask),
            ("position_ids", tensors.position_ids),
            ("output_ids", tensors.output_ids),
            ("pixel_values", tensors.pixel_values),
        ]);
        candle_core::safetensors::save(&map, path.as_ref())?;
        Ok(())
    }
}

/// Pack every conversation of a batch for training
#[instrument(skip_all, fields(conversations = batch.len()))]
pub fn process_training_batch(
    batch: &[Conversation],
    tokenizer: &dyn ChatTokenizer,
    resolver: &ImageSlotResolver,
    options: &PackingOptions,
) -> Result<TrainingBatch> {
    options.validate()?;
    let mut out = TrainingBatch::default();

    for conversation in batch {
        let packed = pack_for_training(conversation, tokenizer, options)?;
        let pixels = resolver.resolve(conversation)?;

        out.input_ids.push(packed.input_ids);
        out.attention_mask.push(packed.attention_mask);
        out.position_ids.push(packed.position_ids);
        out.labels.push(packed.labels);
        out.pixel_values.push(pixels);
    }

    debug!("Packed {} training examples", out.len());
    Ok(out)
}

/// Split every conversation of a batch into evaluation examples
#[instrument(skip_all, fields(conversations = batch.len()))]
pub fn process_eval_batch(
    batch: &[Conversation],
    tokenizer: &dyn ChatTokenizer,
    resolver: &ImageSlotResolver,
    options: &PackingOptions,
) -> Result<EvalBatch> {
    options.validate()?;
    let mut out = EvalBatch::default();

    for conversation in batch {
        let examples = split_for_eval(conversation, tokenizer, options)?;
        if examples.is_empty() {
            continue;
        }
        let pixels = resolver.resolve(conversation)?;

        for example in examples {
            out.input_ids.push(example.input_ids);
            out.attention_mask.push(example.attention_mask);
            out.position_ids.push(example.position_ids);
            out.output_ids.push(example.output_ids);
            out.pixel_values.push(pixels.clone());
        }
    }

    debug!("Split {} conversations into {} evaluation examples", batch.len(), out.len());
    Ok(out)
}

/// Output of processing a split in either mode
#[derive(Debug, Clone)]
pub enum ProcessedSplit {
    /// Training-mode batch
    Training(TrainingBatch),
    /// Evaluation-mode batch
    Evaluation(EvalBatch),
}

impl ProcessedSplit {
    /// Empty result for `mode`
    pub fn empty(mode: ProcessingMode) -> Self {
        match mode {
            ProcessingMode::Training => ProcessedSplit::Training(TrainingBatch::default()),
            ProcessingMode::Evaluation => ProcessedSplit::Evaluation(EvalBatch::default()),
        }
    }

    /// Mode the batch was produced in
    pub fn mode(&self) -> ProcessingMode {
        match self {
            ProcessedSplit::Training(_) => ProcessingMode::Training,
            ProcessedSplit::Evaluation(_) => ProcessingMode::Evaluation,
        }
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        match self {
            ProcessedSplit::Training(batch) => batch.len(),
            ProcessedSplit::Evaluation(batch) => batch.len(),
        }
    }

    /// Whether the batch holds no examples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append another batch produced in the same mode
    pub fn extend(&mut self, other: ProcessedSplit) -> Result<()> {
        match (self, other) {
            (ProcessedSplit::Training(a), ProcessedSplit::Training(b)) => a.extend(b),
            (ProcessedSplit::Evaluation(a), ProcessedSplit::Evaluation(b)) => a.extend(b),
            _ => {
                return Err(DataError::BatchCollationError {
                    reason: "cannot merge training and evaluation batches".to_string(),
                }
                .into())
            }
        }
        Ok(())
    }

    /// Training batch, if produced in training mode
    pub fn as_training(&self) -> Option<&TrainingBatch> {
        match self {
            ProcessedSplit::Training(batch) => Some(batch),
            ProcessedSplit::Evaluation(_) => None,
        }
    }

    /// Evaluation batch, if produced in evaluation mode
    pub fn as_eval(&self) -> Option<&EvalBatch> {
        match self {
            ProcessedSplit::Training(_) => None,
            ProcessedSplit::Evaluation(batch) => Some(batch),
        }
    }

    /// Write the batch to a `.safetensors` file
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        match self {
            ProcessedSplit::Training(batch) => batch.save_safetensors(path),
            ProcessedSplit::Evaluation(batch) => batch.save_safetensors(path),
        }
    }
}

/// Shared, read-only state for processing batches in either mode
#[derive(Clone)]
pub struct BatchProcessor {
    tokenizer: Arc<dyn ChatTokenizer>,
    resolver: ImageSlotResolver,
    options: PackingOptions,
}

impl BatchProcessor {
    /// Create a new processor
    pub fn new(tokenizer: Arc<dyn ChatTokenizer>, resolver: ImageSlotResolver, options: PackingOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            tokenizer,
            resolver,
            options,
        })
    }

    /// Tokenizer used for rendering
    pub fn tokenizer(&self) -> &Arc<dyn ChatTokenizer> {
        &self.tokenizer
    }

    /// Packing options
    pub fn options(&self) -> &PackingOptions {
        &self.options
    }

    /// Process one batch of conversations
    pub fn process(&self, batch: &[Conversation], mode: ProcessingMode) -> Result<ProcessedSplit> {
        Ok(match mode {
            ProcessingMode::Training => ProcessedSplit::Training(process_training_batch(
                batch,
                self.tokenizer.as_ref(),
                &self.resolver,
                &self.options,
            )?),
            ProcessingMode::Evaluation => ProcessedSplit::Evaluation(process_eval_batch(
                batch,
                self.tokenizer.as_ref(),
                &self.resolver,
                &self.options,
            )?),
        })
    }
}

/// Pads `output_ids` on the right to the longest example in a batch.
///
/// The padded length is rounded up to `pad_to_multiple_of` when set.
#[derive(Debug, Clone)]
pub struct Seq2SeqCollator {
    pad_token_id: u32,
    pad_to_multiple_of: Option<usize>,
    device: Device,
}

impl Seq2SeqCollator {
    /// Create a new collator
    pub fn new(pad_token_id: u32, pad_to_multiple_of: Option<usize>, device: Device) -> Self {
        Self {
            pad_token_id,
            pad_to_multiple_of,
            device,
        }
    }

    /// Padded length for a batch whose longest target has `longest` tokens
    pub fn padded_length(&self, longest: usize) -> usize {
        match self.pad_to_multiple_of {
            Some(multiple) if multiple > 0 => longest.div_ceil(multiple) * multiple,
            _ => longest,
        }
    }

    /// Pad targets and stack the batch
    pub fn collate(&self, batch: &EvalBatch) -> Result<EvalTensors> {
        ensure_non_empty(batch.len())?;

        let longest = batch.output_ids.iter().map(Vec::len).max().unwrap_or(0);
        let target_len = self.padded_length(longest);
        let output_ids: Vec<Vec<u32>> = batch
            .output_ids
            .iter()
            .map(|ids| {
                let mut padded = ids.clone();
                padded.resize(target_len, self.pad_token_id);
                padded
            })
            .collect();

        Ok(EvalTensors {
            input_ids: stack_rows("input_ids", &batch.input_ids, &self.device)?,
            attention_mask: stack_rows("attention_mask", &batch.attention_mask, &self.device)?,
            position_ids: stack_rows("position_ids", &batch.position_ids, &self.device)?,
            output_ids: stack_rows("output_ids", &output_ids, &self.device)?,
            pixel_values: stack_pixels(&batch.pixel_values, &self.device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use crate::data::conversation::Message;
    use crate::tests::mock_data::{mock_resolver, MockTokenizer, EOS, PAD};
    use tempfile::TempDir;

    fn conversations() -> Vec<Conversation> {
        vec![
            Conversation::new(vec![Message::user("q1"), Message::assistant("a1")]).unwrap(),
            Conversation::new(vec![
                Message::user("q2"),
                Message::assistant("a2"),
                Message::user("q3"),
                Message::assistant("a3"),
            ])
            .unwrap(),
        ]
    }

    #[test]
    fn test_training_batch_is_one_per_conversation() {
        let tokenizer = MockTokenizer::new();
        let options = PackingOptions::new(6, 4).unwrap();

        let batch = process_training_batch(&conversations(), &tokenizer, &mock_resolver(4), &options).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.pixel_values.len(), 2);
        assert!(batch.labels.iter().all(|l| l.len() == 10));

        let tensors = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(tensors.input_ids.dims(), &[2, 10]);
        assert_eq!(tensors.labels.dtype(), DType::I64);
        assert_eq!(tensors.pixel_values.dims(), &[2, 3, 4, 4]);
    }

    #[test]
    fn test_eval_batch_preserves_order() {
        let tokenizer = MockTokenizer::new();
        let options = PackingOptions::new(12, 6).unwrap();

        let batch = process_eval_batch(&conversations(), &tokenizer, &mock_resolver(4), &options).unwrap();
        assert_eq!(batch.len(), 3);

        let targets: Vec<u32> = batch
            .output_ids
            .iter()
            .map(|ids| ids[ids.len() - 3])
            .collect();
        let expected: Vec<u32> = ["a1", "a2", "a3"].iter().map(|w| tokenizer.id_of(w)).collect();
        assert_eq!(targets, expected);
        assert!(batch.output_ids.iter().all(|ids| ids.last() == Some(&EOS)));
    }

    #[test]
    fn test_processed_split_rejects_mixed_modes() {
        let mut split = ProcessedSplit::empty(ProcessingMode::Training);
        assert!(split.extend(ProcessedSplit::empty(ProcessingMode::Evaluation)).is_err());
        assert!(split.extend(ProcessedSplit::empty(ProcessingMode::Training)).is_ok());
        assert_eq!(split.mode(), ProcessingMode::Training);
    }

    #[test]
    fn test_seq2seq_collator_rounds_up() {
        let tokenizer = MockTokenizer::new();
        let options = PackingOptions::new(8, 5).unwrap();
        let batch = process_eval_batch(&conversations(), &tokenizer, &mock_resolver(2), &options).unwrap();

        let collator = Seq2SeqCollator::new(PAD, Some(4), Device::Cpu);
        assert_eq!(collator.padded_length(5), 8);
        assert_eq!(collator.padded_length(8), 8);

        let tensors = collator.collate(&batch).unwrap();
        assert_eq!(tensors.output_ids.dims(), &[3, 8]);
        let row = tensors.output_ids.get(0).unwrap().to_vec1::<u32>().unwrap();
        assert_eq!(&row[5..], &[PAD, PAD, PAD]);
    }

    #[test]
    fn test_empty_batch_cannot_be_collated() {
        assert!(TrainingBatch::default().to_tensors(&Device::Cpu).is_err());
        let collator = Seq2SeqCollator::new(PAD, None, Device::Cpu);
        assert!(collator.collate(&EvalBatch::default()).is_err());
    }

    #[test]
    fn test_save_safetensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.safetensors");
        let tokenizer = MockTokenizer::new();
        let options = PackingOptions::new(6, 4).unwrap();

        let batch = process_training_batch(&conversations(), &tokenizer, &mock_resolver(2), &options).unwrap();
        batch.save_safetensors(&path).unwrap();

        let loaded = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded["input_ids"].dims(), &[2, 10]);
        assert_eq!(loaded["pixel_values"].dims(), &[2, 3, 2, 2]);
    }
}
