use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use vlm_finetune::data::{
    BatchProcessor, ClipImageProcessor, DataManager, FsImageLoader, ImageSlotResolver, PackingOptions,
    ProcessingMode, TemplateTokenizer,
};
use vlm_finetune::logging;
use vlm_finetune::training::{list_checkpoints, resolve_resume, ResumeDecision, ResumePolicy};
use vlm_finetune::FinetuningConfig;

#[derive(Parser)]
#[command(
    name = "vlm-finetune",
    version,
    about = "Prepare multimodal conversations for supervised fine-tuning"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "VLM_FINETUNE_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every configured split and write it as safetensors
    Prepare {
        /// Directory holding the dataset files and images
        data_dir: PathBuf,

        /// Model directory containing tokenizer.json
        model_dir: PathBuf,

        /// Fine-tuning configuration (YAML or JSON)
        config_file: PathBuf,

        /// Output directory for `<split>.safetensors`
        #[arg(long, default_value = "prepared")]
        out: PathBuf,
    },

    /// Show which checkpoint a run would resume from
    Checkpoints {
        /// Fine-tuning configuration (YAML or JSON)
        config_file: PathBuf,

        /// `yes` for the latest checkpoint, a step number, or empty / `no` for a fresh run
        #[arg(default_value = "")]
        resume: String,
    },

    /// Validate and summarise a configuration file
    Config {
        /// Configuration file to validate
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet, cli.json_logs)?;

    match cli.command {
        Commands::Prepare {
            data_dir,
            model_dir,
            config_file,
            out,
        } => prepare(&data_dir, &model_dir, &config_file, &out).await,
        Commands::Checkpoints { config_file, resume } => show_checkpoints(&config_file, &resume),
        Commands::Config { file } => validate_config(&file),
    }
}

fn load_config(path: &Path) -> Result<FinetuningConfig> {
    FinetuningConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn prepare(data_dir: &Path, model_dir: &Path, config_file: &Path, out: &Path) -> Result<()> {
    let config = load_config(config_file)?;

    let tokenizer = TemplateTokenizer::from_model_dir(model_dir, config.template.clone(), &config.special_tokens)
        .context("Failed to load tokenizer")?;
    let image_config = config
        .image
        .clone()
        .with_model_dir(model_dir)
        .context("Failed to read preprocessor_config.json")?;
    let resolver = ImageSlotResolver::new(
        Arc::new(FsImageLoader::with_base_dir(data_dir)),
        Arc::new(ClipImageProcessor::new(image_config)?),
    );
    let processor = BatchProcessor::new(Arc::new(tokenizer), resolver, PackingOptions::from_config(&config))?;

    let manager = Arc::new(DataManager::new(data_dir, &config.data_config).context("Failed to load datasets")?);
    std::fs::create_dir_all(out).with_context(|| format!("Failed to create {}", out.display()))?;

    for split in manager.splits().collect::<Vec<_>>() {
        let mode = ProcessingMode::for_split(split);
        let manager = Arc::clone(&manager);
        let processor = processor.clone();

        let processed = tokio::task::spawn_blocking(move || manager.process_split(split, &processor, mode))
            .await
            .context("Dataset mapping task panicked")?
            .with_context(|| format!("Failed to process the {} split", split))?;

        let Some(processed) = processed else { continue };
        if processed.is_empty() {
            logging::warning(&format!("The {} split produced no examples", split));
            continue;
        }

        let path = out.join(format!("{}.safetensors", split));
        processed
            .save_safetensors(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} examples to {}", processed.len(), path.display());
        logging::success(&format!("{}: {} examples -> {}", split, processed.len(), path.display()));
    }

    Ok(())
}

fn show_checkpoints(config_file: &Path, resume: &str) -> Result<()> {
    let config = load_config(config_file)?;
    let output_dir = &config.training_args.output_dir;

    let steps = list_checkpoints(output_dir)?;
    if steps.is_empty() {
        println!("No checkpoints in {}", output_dir.display());
    } else {
        let steps: Vec<String> = steps.iter().map(u64::to_string).collect();
        println!("Checkpoints in {}: {}", output_dir.display(), steps.join(", "));
    }

    let policy = ResumePolicy::parse(resume)?;
    match resolve_resume(policy, output_dir)? {
        ResumeDecision::Fresh => logging::success("Training would start from scratch"),
        ResumeDecision::Resume { step, path } => {
            logging::success(&format!("Training would resume from step {} ({})", step, path.display()))
        }
    }
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;

    logging::success("Configuration is valid");
    println!("  max_input_length:  {}", config.max_input_length);
    println!("  max_output_length: {}", config.max_output_length);
    for (split, file) in config.data_config.data_files() {
        println!("  {:<10} {}", format!("{}:", split), file.display());
    }
    println!("  do_eval:           {}", config.training_args.do_eval);
    println!("  freeze vision:     {}", config.freeze_v);
    println!("  image size:        {}", config.image.size);
    if let Some(peft) = &config.peft_config {
        println!("  peft:              {} r={} alpha={}", peft.peft_type, peft.r, peft.lora_alpha);
    }
    println!("  output_dir:        {}", config.training_args.output_dir.display());
    Ok(())
}
