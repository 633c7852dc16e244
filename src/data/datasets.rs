//! Dataset loading and parallel batch mapping
//!
//! Splits are read from JSON Lines files, one conversation record per line.
//! Mapping a split runs the batch procedure over fixed-size chunks on a
//! dedicated worker pool; chunks are independent and results are
//! concatenated in input order.

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use super::batching::{BatchProcessor, ProcessedSplit};
use super::conversation::{Conversation, ConversationRecord};
use super::{DataError, ProcessingMode, Split};
use crate::config::DataConfig;
use crate::error::{Error, Result};

/// Number of conversations handed to one batch-processing call
pub const MAP_BATCH_SIZE: usize = 1000;

/// Supported dataset file extension
const JSONL: &str = ".jsonl";

/// Loaded dataset splits
#[derive(Debug, Clone)]
pub struct DataManager {
    data_dir: PathBuf,
    num_proc: usize,
    batch_size: usize,
    datasets: BTreeMap<Split, Vec<Conversation>>,
}

impl DataManager {
    /// Load every split configured in `config` from `data_dir`
    #[instrument(skip_all, fields(data_dir = %data_dir.as_ref().display()))]
    pub fn new(data_dir: impl AsRef<Path>, config: &DataConfig) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();

        let mut datasets = BTreeMap::new();
        for (split, file) in config.data_files() {
            let format = file
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default();
            if format != JSONL {
                return Err(DataError::UnsupportedFormat { format }.into());
            }

            let conversations = Self::load_jsonl(data_dir.join(&file))?;
            info!("Loaded {} conversations for the {} split", conversations.len(), split);
            datasets.insert(split, conversations);
        }

        Ok(Self {
            data_dir,
            num_proc: config.num_proc.unwrap_or_else(num_cpus::get).max(1),
            batch_size: MAP_BATCH_SIZE,
            datasets,
        })
    }

    /// Override the number of conversations per batch-processing call
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Read conversations from a JSON Lines file.
    ///
    /// Blank lines are skipped. A line that fails to parse is reported with its
    /// 1-based line number.
    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<Conversation>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DataError::DatasetNotFound {
                path: path.to_string_lossy().to_string(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path)?;
        let conversations = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<ConversationRecord>(line)
                    .map(|record| record.messages)
                    .map_err(|e| DataError::MalformedData {
                        index: i + 1,
                        reason: format!("Invalid record: {}", e),
                    })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(conversations)
    }

    /// Directory the splits were read from
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Worker count used for mapping
    pub fn num_proc(&self) -> usize {
        self.num_proc
    }

    /// Conversations of a split
    pub fn get(&self, split: Split) -> Option<&[Conversation]> {
        self.datasets.get(&split).map(Vec::as_slice)
    }

    /// Splits that were loaded
    pub fn splits(&self) -> impl Iterator<Item = Split> + '_ {
        self.datasets.keys().copied()
    }

    /// Map the batch procedure over a split.
    ///
    /// Returns `None` when the split is not configured.
    #[instrument(skip(self, processor))]
    pub fn process_split(
        &self,
        split: Split,
        processor: &BatchProcessor,
        mode: ProcessingMode,
    ) -> Result<Option<ProcessedSplit>> {
        let Some(conversations) = self.get(split) else {
            debug!("No {} split configured", split);
            return Ok(None);
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_proc)
            .thread_name(|i| format!("map-worker-{}", i))
            .build()
            .map_err(|e| Error::config(format!("Failed to build worker pool: {}", e)))?;

        let chunks: Vec<ProcessedSplit> = pool.install(|| {
            conversations
                .par_chunks(self.batch_size)
                .map(|chunk| processor.process(chunk, mode))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut processed = ProcessedSplit::empty(mode);
        for chunk in chunks {
            processed.extend(chunk)?;
        }

        info!(
            "Processed {} split: {} conversations -> {} examples ({} workers)",
            split,
            conversations.len(),
            processed.len(),
            self.num_proc
        );
        Ok(Some(processed))
    }
}
