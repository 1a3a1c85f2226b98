//! Configuration management for medtune.
//!
//! Settings are layered from several sources:
//! 1. Default configuration (embedded in binary, `config/default.toml`)
//! 2. `medtune.toml` in the working directory, if present
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables (prefixed with `MEDTUNE_`, sections split by `__`)
//! 5. Command-line arguments
//!
//! Later sources override earlier ones.
//!
//! # Environment Variables
//!
//! - `MEDTUNE_TRAINING__NUM_TRAIN_EPOCHS` - number of epochs
//! - `MEDTUNE_MODEL__NAME` - hub id of the base checkpoint
//! - `MEDTUNE_MODEL__HF_TOKEN` - hub token (falls back to `HF_TOKEN`)
//! - `MEDTUNE_LOG_DIR` - enable file logging into this directory

use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::dataset::DatasetConfig;
use crate::device::{DTypeChoice, DeviceChoice};
use crate::lora::LoraConfig;
use crate::runtime::sampling::GenerationConfig;
use crate::smoke_test::SmokeTestConfig;
use crate::tracking::TrackingConfig;
use crate::training::TrainingArguments;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[command(name = "medtune", version, about = "Fine-tune a reasoning model on medical chain-of-thought data with LoRA")]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Base model hub id
    #[arg(long)]
    pub model: Option<String>,

    /// Directory for intermediate checkpoints
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Number of training epochs
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Fraction of the dataset used for training (0.05 for a quick run)
    #[arg(long)]
    pub train_fraction: Option<f64>,

    /// Accelerator to use
    #[arg(long, value_enum)]
    pub device: Option<DeviceChoice>,

    /// Skip the post-training generation check
    #[arg(long)]
    pub skip_smoke_test: bool,

    /// Disable the experiment tracker
    #[arg(long)]
    pub no_tracking: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Base model selection and numeric settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Hub id of the pretrained checkpoint
    pub name: String,
    /// Hub revision (branch, tag or commit)
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Accelerator selection
    #[serde(default)]
    pub device: DeviceChoice,
    /// Weight precision
    #[serde(default)]
    pub dtype: DTypeChoice,
    /// Hub access token
    #[serde(default, skip_serializing)]
    pub hf_token: Option<String>,
}

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub model: ModelSettings,
    pub dataset: DatasetConfig,
    pub lora: LoraConfig,
    pub training: TrainingArguments,
    pub generation: GenerationConfig,
    pub smoke_test: SmokeTestConfig,
    pub tracking: TrackingConfig,
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::with_name("medtune.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MEDTUNE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if let Some(model) = &args.model {
            settings.model.name = model.clone();
        }
        if let Some(dir) = &args.output_dir {
            settings.training.output_dir = dir.clone();
        }
        if let Some(epochs) = args.epochs {
            settings.training.num_train_epochs = epochs;
        }
        if let Some(fraction) = args.train_fraction {
            settings.dataset.train_fraction = fraction;
        }
        if let Some(device) = args.device {
            settings.model.device = device;
        }
        if args.skip_smoke_test {
            settings.smoke_test.enabled = false;
        }
        if args.no_tracking {
            settings.tracking.enabled = false;
        }
        if settings.model.hf_token.is_none() {
            settings.model.hf_token = std::env::var("HF_TOKEN").ok();
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values no run could succeed with
    pub fn validate(&self) -> Result<()> {
        let dataset = &self.dataset;
        if !(dataset.train_fraction > 0.0 && dataset.train_fraction < 1.0) {
            bail!("dataset.train_fraction must be in (0, 1), got {}", dataset.train_fraction);
        }
        if !(dataset.test_fraction > 0.0 && dataset.test_fraction < 1.0) {
            bail!("dataset.test_fraction must be in (0, 1), got {}", dataset.test_fraction);
        }
        if dataset.train_fraction + dataset.test_fraction > 1.0 + f64::EPSILON {
            bail!("dataset.train_fraction + dataset.test_fraction exceeds 1");
        }
        if dataset.max_seq_len < 2 {
            bail!("dataset.max_seq_len must be at least 2");
        }

        self.lora.validate()?;

        let training = &self.training;
        if training.per_device_train_batch_size == 0 {
            bail!("training.per_device_train_batch_size must be positive");
        }
        if training.gradient_accumulation_steps == 0 {
            bail!("training.gradient_accumulation_steps must be positive");
        }
        if training.num_train_epochs == 0 {
            bail!("training.num_train_epochs must be positive");
        }
        if training.logging_steps == 0 {
            bail!("training.logging_steps must be positive");
        }
        if !(0.0..1.0).contains(&training.warmup_ratio) {
            bail!("training.warmup_ratio must be in [0, 1), got {}", training.warmup_ratio);
        }
        if training.max_grad_norm <= 0.0 {
            bail!("training.max_grad_norm must be positive");
        }

        if self.generation.temperature <= 0.0 {
            bail!("generation.temperature must be positive");
        }
        if !(self.generation.top_p > 0.0 && self.generation.top_p <= 1.0) {
            bail!("generation.top_p must be in (0, 1]");
        }

        Ok(())
    }
}

fn default_revision() -> String {
    "main".to_string()
}
