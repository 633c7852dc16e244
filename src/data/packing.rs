//! Training-mode sequence packing
//!
//! A conversation is rendered message by message and concatenated into one
//! sequence terminated by the end marker. Position ids run across message
//! boundaries. The result is left-padded (or truncated to its most recent
//! tokens) to `max_input_length + max_output_length`, and labels keep only
//! the tokens of loss-included turns.

use serde::{Deserialize, Serialize};

use super::conversation::Conversation;
use super::tokenizer::ChatTokenizer;
use super::IGNORE_INDEX;
use crate::config::FinetuningConfig;
use crate::error::{Error, Result};

/// Which end of an over-long sequence survives truncation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    /// Keep the last `max_len` elements (most recent context)
    KeepSuffix,
    /// Keep the first `max_len` elements
    KeepPrefix,
}

/// Left-pad `seq` to `max_len` with `pad`, truncating when longer.
///
/// The padding amount is computed from the full length, then the sequence is
/// sliced according to `truncation`, the padding prepended, and the result
/// clipped to `max_len`.
pub fn left_pad<T: Clone>(seq: &[T], pad: T, max_len: usize, truncation: Truncation) -> Vec<T> {
    let pad_len = max_len.saturating_sub(seq.len());
    let kept = match truncation {
        Truncation::KeepSuffix => &seq[seq.len().saturating_sub(max_len)..],
        Truncation::KeepPrefix => seq,
    };

    let mut out = Vec::with_capacity(pad_len + kept.len());
    out.resize(pad_len, pad);
    out.extend_from_slice(kept);
    out.truncate(max_len);
    out
}

/// Lengths and special token ids used by both packing policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingOptions {
    /// Prompt budget
    pub max_input_length: usize,
    /// Response budget
    pub max_output_length: usize,
    /// End marker appended after the last turn / each target
    pub eos_token_id: u32,
    /// Token closing an assistant turn
    pub end_of_turn_token_id: u32,
    /// Pad id override; the tokenizer's pad id is used when unset
    pub pad_token_id: Option<u32>,
}

impl PackingOptions {
    /// Create options with the default special token ids
    pub fn new(max_input_length: usize, max_output_length: usize) -> Result<Self> {
        let special = crate::config::SpecialTokens::default();
        let options = Self {
            max_input_length,
            max_output_length,
            eos_token_id: special.eos_token_id,
            end_of_turn_token_id: special.end_of_turn_token_id,
            pad_token_id: special.pad_token_id,
        };
        options.validate()?;
        Ok(options)
    }

    /// Options taken from a fine-tuning configuration
    pub fn from_config(config: &FinetuningConfig) -> Self {
        Self {
            max_input_length: config.max_input_length,
            max_output_length: config.max_output_length,
            eos_token_id: config.special_tokens.eos_token_id,
            end_of_turn_token_id: config.special_tokens.end_of_turn_token_id,
            pad_token_id: config.special_tokens.pad_token_id,
        }
    }

    /// Both budgets must be positive
    pub fn validate(&self) -> Result<()> {
        if self.max_input_length == 0 || self.max_output_length == 0 {
            return Err(Error::invalid_input(format!(
                "max_input_length and max_output_length must be positive, got {} and {}",
                self.max_input_length, self.max_output_length
            )));
        }
        Ok(())
    }

    /// Total length of a packed training example
    pub fn max_length(&self) -> usize {
        self.max_input_length + self.max_output_length
    }

    /// Pad id to use with `tokenizer`
    pub fn pad_id(&self, tokenizer: &dyn ChatTokenizer) -> u32 {
        self.pad_token_id.unwrap_or_else(|| tokenizer.pad_token_id())
    }
}

/// One fixed-length training example (pixels are attached by the batch assembler)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedTrainingExample {
    /// Token ids, length `max_input_length + max_output_length`
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
    /// Positions counted over real tokens
    pub position_ids: Vec<u32>,
    /// Loss targets, `-100` where ignored
    pub labels: Vec<i64>,
}

impl PackedTrainingExample {
    /// Sequence length
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the example holds no tokens
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Pack one conversation for training
pub fn pack_for_training(
    conversation: &Conversation,
    tokenizer: &dyn ChatTokenizer,
    options: &PackingOptions,
) -> Result<PackedTrainingExample> {
    let mut input_ids = Vec::new();
    let mut attention_mask = Vec::new();
    let mut position_ids: Vec<u32> = Vec::new();
    let mut loss_mask = Vec::new();

    for message in conversation.messages() {
        let rendered = tokenizer.render(std::slice::from_ref(message), false)?;
        if rendered.attention_mask.len() != rendered.input_ids.len() {
            return Err(Error::tokenizer(format!(
                "Rendered {} ids but {} attention flags",
                rendered.input_ids.len(),
                rendered.attention_mask.len()
            )));
        }

        let start = position_ids.len() as u32;
        position_ids.extend(start..start + rendered.len() as u32);
        loss_mask.extend(std::iter::repeat(message.role.loss_included()).take(rendered.len()));
        input_ids.extend(rendered.input_ids);
        attention_mask.extend(rendered.attention_mask);
    }

    input_ids.push(options.eos_token_id);
    attention_mask.push(1);
    position_ids.push(position_ids.len() as u32);
    loss_mask.push(true);

    let max_length = options.max_length();
    let pad_id = options.pad_id(tokenizer);

    let input_ids = left_pad(&input_ids, pad_id, max_length, Truncation::KeepSuffix);
    let attention_mask = left_pad(&attention_mask, 0, max_length, Truncation::KeepSuffix);
    let position_ids = left_pad(&position_ids, 0, max_length, Truncation::KeepSuffix);
    let loss_mask = left_pad(&loss_mask, false, max_length, Truncation::KeepSuffix);

    let labels = input_ids
        .iter()
        .zip(&loss_mask)
        .map(|(&id, &keep)| if keep { id as i64 } else { IGNORE_INDEX })
        .collect();

    Ok(PackedTrainingExample {
        input_ids,
        attention_mask,
        position_ids,
        labels,
    })
}
