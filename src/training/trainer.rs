//! Fine-tuning driver
//!
//! The optimisation itself is delegated to a [`ModelTrainer`]. The
//! [`FinetuneRunner`] prepares every split, resolves the resume checkpoint,
//! hands the data to the trainer and scores test-set generations.

use async_trait::async_trait;
use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::checkpoint::{resolve_resume, ResumeDecision, ResumePolicy};
use super::metrics::{compute_metrics, GenerationMetrics};
use crate::config::FinetuningConfig;
use crate::data::{
    BatchProcessor, DataManager, EvalBatch, ProcessedSplit, ProcessingMode, Seq2SeqCollator, Split, TrainingBatch,
};
use crate::error::{Error, Result};

/// Result reported by the trainer after training
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainOutcome {
    /// Last optimisation step
    pub global_step: u64,
    /// Mean training loss
    pub training_loss: f64,
}

/// External model trainer
#[async_trait]
pub trait ModelTrainer: Send {
    /// Exclude the vision tower from optimisation
    async fn freeze_vision(&mut self) -> Result<()>;

    /// Train on `train`, optionally evaluating on `eval`
    async fn train(
        &mut self,
        train: &TrainingBatch,
        eval: Option<&EvalBatch>,
        resume_from: Option<&Path>,
    ) -> Result<TrainOutcome>;

    /// Generate continuations for every prompt of `test`.
    ///
    /// `collator` stacks the batch with `output_ids` padded to the configured
    /// multiple. Returned rows include the prompt tokens.
    async fn predict(&mut self, test: &EvalBatch, collator: &Seq2SeqCollator) -> Result<Vec<Vec<i64>>>;
}

/// Drop the prompt prefix from generated rows
pub fn trim_prompt(generated: &[Vec<i64>], prompt_len: usize) -> Vec<Vec<i64>> {
    generated
        .iter()
        .map(|row| row.get(prompt_len..).map(<[i64]>::to_vec).unwrap_or_default())
        .collect()
}

/// Test-set predictions with their references
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Predictions {
    /// Generated ids with the prompt removed
    pub predictions: Vec<Vec<i64>>,
    /// Reference `output_ids`
    pub labels: Vec<Vec<i64>>,
    /// Scores, when metric computation is enabled
    pub metrics: Option<GenerationMetrics>,
}

/// Summary of a fine-tuning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock end
    pub finished_at: DateTime<Utc>,
    /// Checkpoint step training resumed from
    pub resumed_from: Option<u64>,
    /// Packed training examples
    pub train_examples: usize,
    /// Packed validation examples
    pub eval_examples: usize,
    /// Packed test examples
    pub test_examples: usize,
    /// What the trainer reported
    pub outcome: TrainOutcome,
    /// Test-set generations, if a test split was configured
    pub predictions: Option<Predictions>,
}

/// Drives a fine-tuning run end to end
pub struct FinetuneRunner<T: ModelTrainer> {
    config: FinetuningConfig,
    data: Arc<DataManager>,
    processor: BatchProcessor,
    trainer: T,
}

impl<T: ModelTrainer> FinetuneRunner<T> {
    /// Create a new runner
    pub fn new(config: FinetuningConfig, data: DataManager, processor: BatchProcessor, trainer: T) -> Self {
        Self {
            config,
            data: Arc::new(data),
            processor,
            trainer,
        }
    }

    /// The wrapped trainer
    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    /// Collator for prediction batches, padding `output_ids` to `pad_to_multiple_of`
    pub fn collator(&self) -> Seq2SeqCollator {
        let pad_token_id = self.processor.options().pad_id(self.processor.tokenizer().as_ref());
        Seq2SeqCollator::new(pad_token_id, self.config.training_args.pad_to_multiple_of, Device::Cpu)
    }

    /// Process a split off the async executor
    async fn prepare(&self, split: Split, mode: ProcessingMode) -> Result<Option<ProcessedSplit>> {
        let data = Arc::clone(&self.data);
        let processor = self.processor.clone();
        tokio::task::spawn_blocking(move || data.process_split(split, &processor, mode))
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("Dataset mapping for {} failed: {}", split, e)))?
    }

    async fn prepare_eval(&self, split: Split) -> Result<Option<EvalBatch>> {
        Ok(match self.prepare(split, ProcessingMode::Evaluation).await? {
            Some(ProcessedSplit::Evaluation(batch)) => Some(batch),
            _ => None,
        })
    }

    /// Run training and, when a test split exists, prediction.
    ///
    /// `resume` is parsed with [`ResumePolicy::parse`].
    #[instrument(skip(self))]
    pub async fn run(&mut self, resume: &str) -> Result<RunSummary> {
        let started_at = Utc::now();
        let policy = ResumePolicy::parse(resume)?;

        if self.config.freeze_v {
            info!("Freezing vision tower");
            self.trainer.freeze_vision().await?;
        }

        let train = match self.prepare(Split::Train, ProcessingMode::Training).await? {
            Some(ProcessedSplit::Training(batch)) => batch,
            _ => return Err(Error::config("data_config.train_file is required for training")),
        };

        let eval = if self.config.training_args.do_eval {
            self.prepare_eval(Split::Validation).await?
        } else {
            None
        };
        let test = self.prepare_eval(Split::Test).await?;

        info!(
            "Prepared {} train / {} eval / {} test examples",
            train.len(),
            eval.as_ref().map_or(0, EvalBatch::len),
            test.as_ref().map_or(0, EvalBatch::len)
        );

        let decision = resolve_resume(policy, &self.config.training_args.output_dir)?;
        let outcome = self
            .trainer
            .train(&train, eval.as_ref(), decision.checkpoint_dir())
            .await?;
        info!("Training finished at step {}", outcome.global_step);

        let predictions = match &test {
            Some(test) if !test.is_empty() => Some(self.predict(test).await?),
            Some(_) => {
                warn!("Test split produced no examples; skipping prediction");
                None
            }
            None => None,
        };

        Ok(RunSummary {
            started_at,
            finished_at: Utc::now(),
            resumed_from: match decision {
                ResumeDecision::Resume { step, .. } => Some(step),
                ResumeDecision::Fresh => None,
            },
            train_examples: train.len(),
            eval_examples: eval.as_ref().map_or(0, EvalBatch::len),
            test_examples: test.as_ref().map_or(0, EvalBatch::len),
            outcome,
            predictions,
        })
    }

    async fn predict(&mut self, test: &EvalBatch) -> Result<Predictions> {
        let collator = self.collator();
        let generated = self.trainer.predict(test, &collator).await?;
        if generated.len() != test.len() {
            return Err(Error::trainer(format!(
                "Trainer returned {} generations for {} prompts",
                generated.len(),
                test.len()
            )));
        }

        let predictions = trim_prompt(&generated, self.config.max_input_length);
        let labels: Vec<Vec<i64>> = test
            .output_ids
            .iter()
            .map(|ids| ids.iter().map(|&id| id as i64).collect())
            .collect();

        let metrics = if self.config.training_args.compute_metrics {
            let metrics = compute_metrics(&predictions, &labels, self.processor.tokenizer().as_ref())?;
            info!(
                "rouge-1 {:.4} rouge-2 {:.4} rouge-l {:.4} bleu-4 {:.4}",
                metrics.rouge_1, metrics.rouge_2, metrics.rouge_l, metrics.bleu_4
            );
            Some(metrics)
        } else {
            None
        };

        Ok(Predictions {
            predictions,
            labels,
            metrics,
        })
    }
}
