//! Training orchestration
//!
//! - **Configuration**: trainer arguments, generation settings and LoRA description
//! - **Checkpoints**: checkpoint discovery and resume policy
//! - **Trainer**: the external model-trainer contract and the run driver
//! - **Metrics**: ROUGE / BLEU scoring of generations

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod trainer;

pub use checkpoint::{latest_checkpoint, list_checkpoints, resolve_resume, ResumeDecision, ResumePolicy};
pub use config::{EvaluationStrategy, GenerationConfig, LoraConfig, TrainingArgs};
pub use metrics::{compute_metrics, GenerationMetrics};
pub use trainer::{trim_prompt, FinetuneRunner, ModelTrainer, Predictions, RunSummary, TrainOutcome};
