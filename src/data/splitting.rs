//! Evaluation-mode splitting
//!
//! The whole conversation is rendered once and cut at every end-of-turn
//! token. Each cut yields one example: the prompt is everything up to the
//! cut, the target is the segment since the previous cut followed by the end
//! marker. A conversation with `k` cuts therefore yields `k` examples with
//! progressively longer prompts.

use super::conversation::Conversation;
use super::packing::{left_pad, PackingOptions, Truncation};
use super::tokenizer::ChatTokenizer;
use crate::error::{Error, Result};

/// One evaluation example (pixels are attached by the batch assembler)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedEvalExample {
    /// Prompt ids, length `max_input_length`
    pub input_ids: Vec<u32>,
    /// Prompt attention flags
    pub attention_mask: Vec<u32>,
    /// Prompt position ids
    pub position_ids: Vec<u32>,
    /// Held-out target ids, length `max_output_length`
    pub output_ids: Vec<u32>,
}

/// Offsets at which the rendered sequence is cut.
///
/// Always starts with 0. Every end-of-turn token at index `i` contributes
/// `i + 1`, and the sequence length is appended when the last cut is not
/// already there.
pub fn find_turn_boundaries(input_ids: &[u32], end_of_turn_token_id: u32) -> Vec<usize> {
    let mut boundaries = vec![0];
    boundaries.extend(
        input_ids
            .iter()
            .enumerate()
            .filter(|(_, &id)| id == end_of_turn_token_id)
            .map(|(idx, _)| idx + 1),
    );

    if boundaries.last() != Some(&input_ids.len()) {
        boundaries.push(input_ids.len());
    }
    boundaries
}

/// Split one conversation into evaluation examples
pub fn split_for_eval(
    conversation: &Conversation,
    tokenizer: &dyn ChatTokenizer,
    options: &PackingOptions,
) -> Result<Vec<PackedEvalExample>> {
    let rendered = tokenizer.render(conversation.messages(), false)?;
    if rendered.attention_mask.len() != rendered.input_ids.len() {
        return Err(Error::tokenizer(format!(
            "Rendered {} ids but {} attention flags",
            rendered.input_ids.len(),
            rendered.attention_mask.len()
        )));
    }

    let input_ids = &rendered.input_ids;
    let attention_mask = &rendered.attention_mask;
    let position_ids: Vec<u32> = (0..input_ids.len() as u32).collect();
    let pad_id = options.pad_id(tokenizer);

    let boundaries = find_turn_boundaries(input_ids, options.end_of_turn_token_id);

    let examples = boundaries
        .windows(2)
        .map(|pair| {
            let (prev, curr) = (pair[0], pair[1]);

            let mut target = input_ids[prev..curr].to_vec();
            target.push(options.eos_token_id);

            PackedEvalExample {
                input_ids: left_pad(&input_ids[..curr], pad_id, options.max_input_length, Truncation::KeepSuffix),
                attention_mask: left_pad(&attention_mask[..curr], 0, options.max_input_length, Truncation::KeepSuffix),
                position_ids: left_pad(&position_ids[..curr], 0, options.max_input_length, Truncation::KeepSuffix),
                output_ids: left_pad(&target, pad_id, options.max_output_length, Truncation::KeepPrefix),
            }
        })
        .collect();

    Ok(examples)
}
