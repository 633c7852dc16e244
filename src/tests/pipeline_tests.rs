//! End-to-end runs over JSONL files with a recording trainer

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::FinetuningConfig;
use crate::data::{DataManager, EvalBatch, PackingOptions, ProcessingMode, Seq2SeqCollator, Split, TrainingBatch};
use crate::error::{Error, Result};
use crate::tests::mock_data::{mock_processor, record, write_jsonl, MockTokenizer};
use crate::training::{FinetuneRunner, ModelTrainer, TrainOutcome};

/// Trainer that records what it was handed and echoes references as generations
#[derive(Default)]
struct RecordingTrainer {
    frozen: bool,
    train_rows: usize,
    eval_rows: Option<usize>,
    resumed_from: Option<PathBuf>,
    collated_output_width: Option<usize>,
    drop_generation: bool,
}

#[async_trait]
impl ModelTrainer for RecordingTrainer {
    async fn freeze_vision(&mut self) -> Result<()> {
        self.frozen = true;
        Ok(())
    }

    async fn train(
        &mut self,
        train: &TrainingBatch,
        eval: Option<&EvalBatch>,
        resume_from: Option<&Path>,
    ) -> Result<TrainOutcome> {
        self.train_rows = train.len();
        self.eval_rows = eval.map(EvalBatch::len);
        self.resumed_from = resume_from.map(Path::to_path_buf);
        Ok(TrainOutcome {
            global_step: 10,
            training_loss: 0.5,
        })
    }

    async fn predict(&mut self, test: &EvalBatch, collator: &Seq2SeqCollator) -> Result<Vec<Vec<i64>>> {
        let tensors = collator.collate(test)?;
        self.collated_output_width = Some(tensors.output_ids.dims()[1]);

        let mut rows: Vec<Vec<i64>> = test
            .input_ids
            .iter()
            .zip(&test.output_ids)
            .map(|(prompt, output)| prompt.iter().chain(output).map(|&id| id as i64).collect())
            .collect();
        if self.drop_generation {
            rows.pop();
        }
        Ok(rows)
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let train = record(&[("user", "Hi"), ("assistant", "Hello there")]);
        let dev = record(&[("user", "Name a colour"), ("assistant", "Blue")]);
        let test_a = record(&[
            ("system", "Be brief"),
            ("user", "Capital of France?"),
            ("assistant", "Paris is the capital"),
            ("user", "And Italy?"),
            ("assistant", "Rome is the capital"),
        ]);
        let test_b = record(&[("user", "Two plus two?"), ("assistant", "It is four")]);

        write_jsonl(dir.path().join("train.jsonl"), &[&train, &train]);
        write_jsonl(dir.path().join("dev.jsonl"), &[&dev]);
        write_jsonl(dir.path().join("test.jsonl"), &[&test_a, &test_b]);
        Self { dir }
    }

    fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    fn config(&self, do_eval: bool) -> FinetuningConfig {
        self.config_with(do_eval, "")
    }

    fn config_with(&self, do_eval: bool, extra_training_args: &str) -> FinetuningConfig {
        let yaml = format!(
            r#"
data_config:
  train_file: train.jsonl
  val_file: dev.jsonl
  test_file: test.jsonl
  num_proc: 2
max_input_length: 24
max_output_length: 12
freezeV: true
training_args:
  output_dir: {}
  do_eval: {}
  compute_metrics: true
{}"#,
            self.output_dir().display(),
            do_eval,
            extra_training_args
        );
        let config: FinetuningConfig = serde_yaml::from_str(&yaml).unwrap();
        let config = config.normalized();
        config.validate().unwrap();
        config
    }

    fn runner(&self, config: FinetuningConfig, trainer: RecordingTrainer) -> FinetuneRunner<RecordingTrainer> {
        let data = DataManager::new(self.dir.path(), &config.data_config).unwrap();
        let processor = mock_processor(
            Arc::new(MockTokenizer::new()),
            PackingOptions::from_config(&config),
        );
        FinetuneRunner::new(config, data, processor, trainer)
    }
}

#[tokio::test]
async fn test_run_trains_and_scores_test_split() {
    let ws = Workspace::new();
    let mut runner = ws.runner(ws.config(true), RecordingTrainer::default());

    let summary = runner.run("").await.unwrap();
    let trainer = runner.trainer();

    assert!(trainer.frozen);
    assert_eq!(trainer.train_rows, 2);
    assert_eq!(trainer.eval_rows, Some(1));
    assert_eq!(trainer.resumed_from, None);

    assert_eq!(summary.resumed_from, None);
    assert_eq!(summary.train_examples, 2);
    assert_eq!(summary.eval_examples, 1);
    // two exchanges in the first test conversation, one in the second
    assert_eq!(summary.test_examples, 3);
    assert_eq!(summary.outcome.global_step, 10);
    assert!(summary.finished_at >= summary.started_at);

    let predictions = summary.predictions.unwrap();
    assert_eq!(predictions.predictions.len(), 3);
    assert_eq!(predictions.predictions, predictions.labels);
    assert!(predictions.predictions.iter().all(|row| row.len() == 12));

    let metrics = predictions.metrics.unwrap();
    assert!((metrics.rouge_1 - 100.0).abs() < 1e-6);
    assert!((metrics.rouge_l - 100.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_prediction_targets_padded_to_configured_multiple() {
    let ws = Workspace::new();
    let config = ws.config_with(false, "  pad_to_multiple_of: 5\n");
    let mut runner = ws.runner(config, RecordingTrainer::default());

    assert_eq!(runner.collator().padded_length(12), 15);
    runner.run("").await.unwrap();
    assert_eq!(runner.trainer().collated_output_width, Some(15));
}

#[tokio::test]
async fn test_prediction_targets_unpadded_by_default() {
    let ws = Workspace::new();
    let mut runner = ws.runner(ws.config(false), RecordingTrainer::default());

    runner.run("").await.unwrap();
    assert_eq!(runner.trainer().collated_output_width, Some(12));
}

#[tokio::test]
async fn test_run_without_eval_skips_validation() {
    let ws = Workspace::new();
    let mut runner = ws.runner(ws.config(false), RecordingTrainer::default());

    let summary = runner.run("no").await.unwrap();
    assert_eq!(runner.trainer().eval_rows, None);
    assert_eq!(summary.eval_examples, 0);
}

#[tokio::test]
async fn test_run_resumes_from_latest_checkpoint() {
    let ws = Workspace::new();
    for step in [5, 20] {
        std::fs::create_dir_all(ws.output_dir().join(format!("checkpoint-{}", step))).unwrap();
    }
    std::fs::create_dir_all(ws.output_dir().join("checkpoint-30-tmp")).unwrap();

    let mut runner = ws.runner(ws.config(false), RecordingTrainer::default());
    let summary = runner.run("YES").await.unwrap();

    assert_eq!(summary.resumed_from, Some(20));
    assert_eq!(
        runner.trainer().resumed_from.as_deref(),
        Some(ws.output_dir().join("checkpoint-20").as_path())
    );
}

#[tokio::test]
async fn test_run_rejects_unsaved_checkpoint_step() {
    let ws = Workspace::new();
    let mut runner = ws.runner(ws.config(false), RecordingTrainer::default());

    let err = runner.run("7").await.unwrap_err();
    assert!(matches!(err, Error::Checkpoint(_)));
    assert_eq!(runner.trainer().train_rows, 0);
}

#[tokio::test]
async fn test_run_rejects_short_generation_list() {
    let ws = Workspace::new();
    let trainer = RecordingTrainer {
        drop_generation: true,
        ..RecordingTrainer::default()
    };
    let mut runner = ws.runner(ws.config(false), trainer);

    let err = runner.run("").await.unwrap_err();
    assert!(matches!(err, Error::Trainer(_)));
}

#[test]
fn test_process_split_matches_direct_processing() {
    let ws = Workspace::new();
    let config = ws.config(true);
    let data = DataManager::new(ws.dir.path(), &config.data_config)
        .unwrap()
        .with_batch_size(1);
    let processor = mock_processor(
        Arc::new(MockTokenizer::new()),
        PackingOptions::from_config(&config),
    );

    let chunked = data
        .process_split(Split::Test, &processor, ProcessingMode::Evaluation)
        .unwrap()
        .unwrap();
    let direct = processor
        .process(data.get(Split::Test).unwrap(), ProcessingMode::Evaluation)
        .unwrap();

    assert_eq!(chunked.len(), 3);
    assert_eq!(
        chunked.as_eval().unwrap().input_ids,
        direct.as_eval().unwrap().input_ids
    );
    assert_eq!(
        chunked.as_eval().unwrap().output_ids,
        direct.as_eval().unwrap().output_ids
    );
}

#[test]
fn test_prepared_split_saves_safetensors() {
    let ws = Workspace::new();
    let config = ws.config(false);
    let data = DataManager::new(ws.dir.path(), &config.data_config).unwrap();
    let processor = mock_processor(
        Arc::new(MockTokenizer::new()),
        PackingOptions::from_config(&config),
    );

    let train = data
        .process_split(Split::Train, &processor, ProcessingMode::Training)
        .unwrap()
        .unwrap();
    let path = ws.dir.path().join("train.safetensors");
    train.save_safetensors(&path).unwrap();

    let tensors = candle_core::safetensors::load(&path, &candle_core::Device::Cpu).unwrap();
    assert_eq!(tensors["input_ids"].dims(), &[2, 36]);
    assert_eq!(tensors["labels"].dims(), &[2, 36]);
    assert_eq!(tensors["pixel_values"].dims(), &[2, 3, 2, 2]);
}
