//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! destilar train distill.yaml
//! destilar train distill.yaml --epochs 10 --lr 0.01 --train-dir ./runs
//! destilar test distill.yaml --saltpepper 0.1 --saltpepper 0.2
//! destilar validate distill.yaml
//! destilar info distill.yaml --format json
//! ```

use super::schema::{DistillSpec, Rates};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Destilar: robust knowledge distillation
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "destilar")]
#[command(version)]
#[command(about = "Distil a teacher classifier into an adversarially robust student")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Train a student from YAML configuration
    Train(TrainArgs),

    /// Evaluate restored checkpoints without training
    Test(TestArgs),

    /// Validate a configuration file without training
    Validate(ValidateArgs),

    /// Display information about a configuration
    Info(InfoArgs),
}

/// Arguments for the train command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct TrainArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Override number of epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Override batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Override learning rate
    #[arg(short, long)]
    pub lr: Option<f32>,

    /// Override checkpoint directory
    #[arg(long)]
    pub train_dir: Option<PathBuf>,

    /// Skip the validation round before the first epoch
    #[arg(long)]
    pub no_init_test: bool,

    /// Dry run (validate config but don't train)
    #[arg(long)]
    pub dry_run: bool,

    /// Random seed for reproducibility
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Arguments for the test command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct TestArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Override batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Salt-and-pepper rate to evaluate (repeatable)
    #[arg(long)]
    pub saltpepper: Vec<f32>,
}

/// Arguments for the validate command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct ValidateArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Show detailed validation report
    #[arg(short, long)]
    pub detailed: bool,
}

/// Arguments for the info command
#[derive(Parser, Debug, Clone, PartialEq)]
pub struct InfoArgs {
    /// Path to YAML configuration file
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Output format (text, json, yaml)
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for info command
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            _ => Err(format!(
                "Unknown output format: {}. Valid formats: text, json, yaml",
                s
            )),
        }
    }
}

/// Parse CLI arguments from a string slice (for testing)
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Apply train command overrides to a spec before validation
pub fn apply_overrides(spec: &mut DistillSpec, args: &TrainArgs) {
    if let Some(epochs) = args.epochs {
        spec.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        spec.data.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        spec.optimizer.lr = lr;
    }
    if let Some(train_dir) = &args.train_dir {
        spec.training.train_dir = Some(train_dir.clone());
    }
    if args.no_init_test {
        spec.training.no_init_test = true;
    }
    if let Some(seed) = args.seed {
        spec.training.seed = seed;
    }
}

/// Apply test command overrides to a spec before validation
pub fn apply_test_overrides(spec: &mut DistillSpec, args: &TestArgs) {
    if let Some(batch_size) = args.batch_size {
        spec.data.batch_size = batch_size;
    }
    if !args.saltpepper.is_empty() {
        spec.test.saltpepper = Some(Rates::Many(args.saltpepper.clone()));
    }
}
