//! Supervised fine-tuning data pipeline for vision-language causal models
//!
//! Multi-turn conversations with an optional image are turned into
//! fixed-shape model inputs. Training examples pack a whole conversation into
//! one left-padded sequence with loss restricted to assistant turns;
//! evaluation examples are cut at every assistant turn with the held-out turn
//! stored as `output_ids`. A driver hands the prepared splits to an external
//! model trainer, handles checkpoint resume and scores generations.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod training;

#[cfg(test)]
mod tests;

// Re-exports
pub use config::{DataConfig, FinetuningConfig, ImageConfig, SpecialTokens};
pub use data::{
    process_eval_batch, process_training_batch, BatchProcessor, Conversation, DataManager, EvalBatch, Message,
    PackingOptions, ProcessedSplit, ProcessingMode, Role, Split, TrainingBatch,
};
pub use error::{Error, Result};
pub use training::{FinetuneRunner, ModelTrainer, ResumeDecision, ResumePolicy, RunSummary};
