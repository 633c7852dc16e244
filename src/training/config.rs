//! Trainer argument structures
//!
//! These mirror the knobs handed to the external model trainer: output
//! location, batch sizes, evaluation cadence, generation settings for
//! predict-with-generate, and an optional LoRA adapter description.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Arguments forwarded to the model trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    /// Directory checkpoints and predictions are written to
    pub output_dir: PathBuf,

    /// Run evaluation on the validation split during training
    pub do_eval: bool,

    /// When evaluation happens
    pub evaluation_strategy: EvaluationStrategy,

    /// Batch size per device for training
    pub per_device_train_batch_size: usize,

    /// Batch size per device for evaluation (defaults to the train batch size)
    pub per_device_eval_batch_size: Option<usize>,

    /// Gradient accumulation steps
    pub gradient_accumulation_steps: usize,

    /// Number of training epochs
    pub num_train_epochs: f64,

    /// Maximum number of steps (overrides epochs if set)
    pub max_steps: Option<usize>,

    /// Base learning rate
    pub learning_rate: f64,

    /// Save frequency (in steps)
    pub save_steps: usize,

    /// Evaluation frequency (in steps)
    pub eval_steps: Option<usize>,

    /// Logging frequency (in steps)
    pub logging_steps: usize,

    /// Seed for reproducibility
    pub seed: u64,

    /// Generate during evaluation/prediction instead of scoring teacher-forced logits
    pub predict_with_generate: bool,

    /// Compute ROUGE/BLEU over predictions
    pub compute_metrics: bool,

    /// Round padded `output_ids` lengths up to a multiple of this value
    pub pad_to_multiple_of: Option<usize>,

    /// Generation settings
    pub generation_config: GenerationConfig,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            do_eval: false,
            evaluation_strategy: EvaluationStrategy::No,
            per_device_train_batch_size: 1,
            per_device_eval_batch_size: None,
            gradient_accumulation_steps: 1,
            num_train_epochs: 1.0,
            max_steps: None,
            learning_rate: 5e-5,
            save_steps: 500,
            eval_steps: None,
            logging_steps: 10,
            seed: 42,
            predict_with_generate: true,
            compute_metrics: false,
            pad_to_multiple_of: None,
            generation_config: GenerationConfig::default(),
        }
    }
}

impl TrainingArgs {
    /// Validate trainer arguments
    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 {
            return Err(Error::config("per_device_train_batch_size must be > 0"));
        }

        if self.per_device_eval_batch_size == Some(0) {
            return Err(Error::config("per_device_eval_batch_size must be > 0"));
        }

        if self.gradient_accumulation_steps == 0 {
            return Err(Error::config("gradient_accumulation_steps must be > 0"));
        }

        if self.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }

        if self.pad_to_multiple_of == Some(0) {
            return Err(Error::config("pad_to_multiple_of must be > 0 when set"));
        }

        self.generation_config.validate()
    }

    /// Effective batch size (batch size * gradient accumulation steps)
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }
}

/// Evaluation cadence
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStrategy {
    /// Never evaluate during training
    #[default]
    No,
    /// Evaluate every `eval_steps`
    Steps,
    /// Evaluate at the end of each epoch
    Epoch,
}

/// Decoding settings used by predict-with-generate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of generated tokens
    pub max_new_tokens: usize,
    /// Sample instead of greedy decoding
    pub do_sample: bool,
    /// Nucleus sampling threshold
    pub top_p: f32,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            do_sample: false,
            top_p: 0.8,
            temperature: 0.8,
        }
    }
}

impl GenerationConfig {
    fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(Error::config("generation_config.max_new_tokens must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::config("generation_config.top_p must be in [0, 1]"));
        }
        if self.temperature <= 0.0 {
            return Err(Error::config("generation_config.temperature must be positive"));
        }
        Ok(())
    }
}

/// LoRA adapter description (PEFT style)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoraConfig {
    /// Adapter type, e.g. `LORA`
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    /// Task type, e.g. `CAUSAL_LM`
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// LoRA rank
    pub r: usize,
    /// Alpha scaling factor
    pub lora_alpha: f32,
    /// Dropout applied to the adapter input
    #[serde(default)]
    pub lora_dropout: f32,
    /// Target modules (e.g., ["query_key_value"])
    #[serde(default)]
    pub target_modules: Vec<String>,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}
