//! Data preparation for multimodal supervised fine-tuning
//!
//! This module turns multi-turn, optionally image-bearing conversations into
//! fixed-shape model inputs. Two packing policies are provided:
//!
//! - **Training**: every turn is concatenated into one left-padded sequence and
//!   the loss is restricted to assistant turns (labels use the `-100` sentinel
//!   elsewhere).
//! - **Evaluation / prediction**: a conversation is split at every assistant
//!   turn boundary, producing one progressively longer prompt per boundary with
//!   the held-out turn stored separately as `output_ids`.
//!
//! Every example carries a pixel tensor of identical shape, holding either the
//! processed image of the conversation or a zero placeholder.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod batching;
pub mod conversation;
pub mod datasets;
pub mod image;
pub mod packing;
pub mod splitting;
pub mod tokenizer;

// Re-exports
pub use batching::{
    process_eval_batch, process_training_batch, BatchProcessor, EvalBatch, EvalTensors, ProcessedSplit,
    Seq2SeqCollator, TrainingBatch, TrainingTensors,
};
pub use conversation::{ContentPart, Conversation, Message, MessageContent, Role};
pub use datasets::{DataManager, MAP_BATCH_SIZE};
pub use image::{ClipImageProcessor, FsImageLoader, ImageLoader, ImageProcessor, ImageSlotResolver};
pub use packing::{left_pad, pack_for_training, PackedTrainingExample, PackingOptions, Truncation};
pub use splitting::{find_turn_boundaries, split_for_eval, PackedEvalExample};
pub use tokenizer::{ChatTemplate, ChatTokenizer, RenderedTurn, TemplateTokenizer};

/// Label value that excludes a position from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Dataset split
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    /// Training split
    Train,
    /// Validation split
    Validation,
    /// Test split
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// Packing policy applied to a split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// One packed sequence per conversation with assistant-only loss
    Training,
    /// One example per assistant turn boundary with held-out targets
    Evaluation,
}

impl ProcessingMode {
    /// Default mode for a split: training for the train split, evaluation otherwise
    pub fn for_split(split: Split) -> Self {
        match split {
            Split::Train => ProcessingMode::Training,
            Split::Validation | Split::Test => ProcessingMode::Evaluation,
        }
    }
}

/// Error types for data loading and batch processing
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("Dataset not found: {path}")]
    DatasetNotFound { path: String },

    #[error("Cannot load dataset in the '{format}' format")]
    UnsupportedFormat { format: String },

    /// `index` is the 1-based line number
    #[error("Malformed data at line {index}: {reason}")]
    MalformedData { index: usize, reason: String },

    #[error("Conversation has no messages")]
    EmptyConversation,

    #[error("Batch collation error: {reason}")]
    BatchCollationError { reason: String },
}
