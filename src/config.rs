//! Configuration structures for fine-tuning runs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::data::Split;
use crate::data::ChatTemplate;
use crate::error::{Error, Result};
use crate::training::config::{EvaluationStrategy, LoraConfig, TrainingArgs};

/// Top-level configuration for a supervised fine-tuning run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuningConfig {
    /// Dataset file locations
    pub data_config: DataConfig,
    /// Token budget for the prompt side of an example
    pub max_input_length: usize,
    /// Token budget for the response side of an example
    pub max_output_length: usize,
    /// Freeze the vision tower before training
    #[serde(default, alias = "freezeV")]
    pub freeze_v: bool,
    /// Trainer arguments
    #[serde(default)]
    pub training_args: TrainingArgs,
    /// Optional LoRA adapter description forwarded to the trainer
    #[serde(default)]
    pub peft_config: Option<LoraConfig>,
    /// Special token ids used by the packers
    #[serde(default)]
    pub special_tokens: SpecialTokens,
    /// Image preprocessing settings
    #[serde(default)]
    pub image: ImageConfig,
    /// Chat template used to render turns
    #[serde(default)]
    pub template: ChatTemplate,
}

impl FinetuningConfig {
    /// Load configuration from a YAML or JSON file.
    ///
    /// The file format is chosen by extension (`.json` is JSON, everything
    /// else is parsed as YAML). The loaded config is normalised and validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        let config = config.normalized();
        config.validate()?;
        info!("Loaded fine-tuning configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reconcile evaluation settings with the available splits.
    ///
    /// Evaluation is disabled entirely when it is switched off or when no
    /// validation file is configured. Otherwise the eval batch size falls back
    /// to the train batch size.
    pub fn normalized(mut self) -> Self {
        if !self.training_args.do_eval || self.data_config.val_file.is_none() {
            debug!("Evaluation disabled: do_eval is off or no validation file");
            self.training_args.do_eval = false;
            self.training_args.evaluation_strategy = EvaluationStrategy::No;
            self.data_config.val_file = None;
        } else if self.training_args.per_device_eval_batch_size.is_none() {
            self.training_args.per_device_eval_batch_size =
                Some(self.training_args.per_device_train_batch_size);
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_input_length == 0 {
            return Err(Error::config("max_input_length must be > 0"));
        }

        if self.max_output_length == 0 {
            return Err(Error::config("max_output_length must be > 0"));
        }

        if self.data_config.data_files().is_empty() {
            return Err(Error::config(
                "data_config must name at least one of train_file, val_file, test_file",
            ));
        }

        if self.data_config.num_proc == Some(0) {
            return Err(Error::config("data_config.num_proc must be > 0 when set"));
        }

        if self.special_tokens.eos_token_id == self.special_tokens.end_of_turn_token_id {
            return Err(Error::config(
                "eos_token_id and end_of_turn_token_id must be distinct",
            ));
        }

        self.image.validate()?;
        self.training_args.validate()?;

        Ok(())
    }

    /// Combined length of a packed training example
    pub fn max_length(&self) -> usize {
        self.max_input_length + self.max_output_length
    }
}

/// Dataset file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// Training split file, relative to the data directory
    #[serde(default)]
    pub train_file: Option<PathBuf>,
    /// Validation split file
    #[serde(default)]
    pub val_file: Option<PathBuf>,
    /// Test split file
    #[serde(default)]
    pub test_file: Option<PathBuf>,
    /// Number of dataset mapping workers
    #[serde(default)]
    pub num_proc: Option<usize>,
}

impl DataConfig {
    /// File extension of the dataset, including the leading dot (e.g. `.jsonl`).
    ///
    /// Taken from the train file, or the first configured split when there is
    /// no train file.
    pub fn data_format(&self) -> Option<String> {
        self.data_files()
            .into_values()
            .next()
            .and_then(|path| path.extension().map(|ext| format!(".{}", ext.to_string_lossy())))
    }

    /// Configured split files keyed by split
    pub fn data_files(&self) -> BTreeMap<Split, PathBuf> {
        [
            (Split::Train, &self.train_file),
            (Split::Validation, &self.val_file),
            (Split::Test, &self.test_file),
        ]
        .into_iter()
        .filter_map(|(split, file)| file.clone().map(|f| (split, f)))
        .collect()
    }
}

/// Special token ids consumed by the packers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpecialTokens {
    /// End marker appended after the last turn / each held-out target
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    /// Token that closes an assistant turn in a rendered conversation
    #[serde(default = "default_end_of_turn_token_id")]
    pub end_of_turn_token_id: u32,
    /// Overrides the tokenizer's pad token
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

fn default_eos_token_id() -> u32 {
    59253
}

fn default_end_of_turn_token_id() -> u32 {
    59254
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            eos_token_id: default_eos_token_id(),
            end_of_turn_token_id: default_end_of_turn_token_id(),
            pad_token_id: None,
        }
    }
}

/// Image preprocessing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageConfig {
    /// Square side length images are resized to
    #[serde(default = "default_image_size")]
    pub size: usize,
    /// Per-channel normalisation mean (RGB)
    #[serde(default = "default_image_mean")]
    pub mean: [f32; 3],
    /// Per-channel normalisation standard deviation (RGB)
    #[serde(default = "default_image_std")]
    pub std: [f32; 3],
    /// Factor applied to raw 0-255 pixel values before normalisation
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
}

fn default_image_size() -> usize {
    672
}

#[allow(clippy::excessive_precision)]
fn default_image_mean() -> [f32; 3] {
    [0.48145466, 0.4578275, 0.40821073]
}

#[allow(clippy::excessive_precision)]
fn default_image_std() -> [f32; 3] {
    [0.26862954, 0.26130258, 0.27577711]
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            size: default_image_size(),
            mean: default_image_mean(),
            std: default_image_std(),
            rescale_factor: default_rescale_factor(),
        }
    }
}

/// Subset of a HuggingFace `preprocessor_config.json`
#[derive(Debug, Deserialize)]
struct PreprocessorConfigFile {
    image_size: Option<usize>,
    image_mean: Option<[f32; 3]>,
    image_std: Option<[f32; 3]>,
    rescale_factor: Option<f32>,
}

impl ImageConfig {
    /// Validate image settings
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::config("image.size must be > 0"));
        }
        if u32::try_from(self.size).is_err() {
            return Err(Error::config(format!("image.size {} is too large", self.size)));
        }
        if self.std.iter().any(|&s| s <= 0.0) {
            return Err(Error::config("image.std entries must be positive"));
        }
        Ok(())
    }

    /// Overlay values from `<model_dir>/preprocessor_config.json` when present
    pub fn with_model_dir(mut self, model_dir: impl AsRef<Path>) -> Result<Self> {
        let path = model_dir.as_ref().join("preprocessor_config.json");
        if !path.exists() {
            return Ok(self);
        }

        let file: PreprocessorConfigFile = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        if let Some(size) = file.image_size {
            self.size = size;
        }
        if let Some(mean) = file.image_mean {
            self.mean = mean;
        }
        if let Some(std) = file.image_std {
            self.std = std;
        }
        if let Some(rescale_factor) = file.rescale_factor {
            self.rescale_factor = rescale_factor;
        }
        debug!("Applied image preprocessing settings from {}", path.display());

        self.validate()?;
        Ok(self)
    }
}
