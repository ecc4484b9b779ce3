//! Destilar CLI
//!
//! # Usage
//!
//! ```bash
//! # Train from config
//! destilar train distill.yaml
//!
//! # Train with overrides
//! destilar train distill.yaml --epochs 10 --lr 0.01
//!
//! # Evaluate restored checkpoints
//! destilar test distill.yaml --saltpepper 0.1
//!
//! # Validate config
//! destilar validate distill.yaml
//!
//! # Show config info
//! destilar info distill.yaml --format yaml
//! ```

use clap::Parser;
use destilar::config::{
    apply_overrides, apply_test_overrides, load_spec, run_config, Cli, Command, DistillConfig,
    DistillSpec, InfoArgs, OutputFormat, TestArgs, TrainArgs, ValidateArgs,
};
use destilar::io::RunMode;
use destilar::train::RunOutcome;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "destilar=warn"
    } else if cli.verbose {
        "destilar=debug"
    } else {
        "destilar=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Command::Train(args) => run_train(args),
        Command::Test(args) => run_test(args),
        Command::Validate(args) => run_validate(args),
        Command::Info(args) => run_info(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_train(args: TrainArgs) -> Result<(), String> {
    info!("Destilar: training from {}", args.config.display());

    let mut spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;
    apply_overrides(&mut spec, &args);
    let config = DistillConfig::new(spec).map_err(|e| format!("Config error: {e}"))?;

    if args.dry_run {
        info!("Dry run - config validated successfully");
        print_summary(config.spec());
        return Ok(());
    }

    match run_config(config, RunMode::Train).map_err(|e| format!("Training error: {e}"))? {
        RunOutcome::Trained(result) => {
            info!(
                "Training complete: {} epoch(s), stop: {:?}, best accuracy: {}, {:.1} sec",
                result.epochs_run(),
                result.stop,
                result
                    .best_accuracy
                    .map_or_else(|| "n/a".to_string(), |a| format!("{:.2} %", a * 100.0)),
                result.elapsed_secs
            );
            Ok(())
        }
        RunOutcome::Tested(_) => Err("training run produced test reports".to_string()),
    }
}

fn run_test(args: TestArgs) -> Result<(), String> {
    info!("Destilar: testing from {}", args.config.display());

    let mut spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;
    apply_test_overrides(&mut spec, &args);
    let config = DistillConfig::new(spec).map_err(|e| format!("Config error: {e}"))?;

    match run_config(config, RunMode::Test).map_err(|e| format!("Test error: {e}"))? {
        RunOutcome::Tested(reports) => {
            for report in &reports {
                println!(
                    "{}: accuracy {:.2} %; teacher accuracy {:.2} %",
                    report.name,
                    report.accuracy * 100.0,
                    report.teacher_accuracy * 100.0
                );
                for attack in &report.attacks {
                    println!("  {}: accuracy {:.2} %", attack.id, attack.accuracy * 100.0);
                }
            }
            Ok(())
        }
        RunOutcome::Trained(_) => Err("test run produced a training result".to_string()),
    }
}

fn run_validate(args: ValidateArgs) -> Result<(), String> {
    info!("Validating config: {}", args.config.display());

    let spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let config = DistillConfig::new(spec).map_err(|e| format!("Validation failed: {e}"))?;

    info!("Configuration is valid");
    if args.detailed {
        print_summary(config.spec());
    }
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<(), String> {
    let spec = load_spec(&args.config).map_err(|e| format!("Config error: {e}"))?;

    match args.format {
        OutputFormat::Text => print_summary(&spec),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&spec)
                .map_err(|e| format!("JSON serialization error: {e}"))?;
            println!("{json}");
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&spec)
                .map_err(|e| format!("YAML serialization error: {e}"))?;
            println!("{yaml}");
        }
    }
    Ok(())
}

fn print_summary(spec: &DistillSpec) {
    println!("Configuration Summary:");
    println!(
        "  Student: {} (heads: {:?})",
        spec.model.student.namescope, spec.model.student.heads
    );
    println!("  Teacher: {}", spec.model.teacher.namescope);
    for network in &spec.model.additional {
        println!("  Additional: {}", network.namescope);
    }
    println!();
    if let Some(path) = &spec.data.path {
        println!("  Dataset: {}", path.display());
    }
    println!("  Batch size: {}", spec.data.batch_size);
    println!("  Learning rate: {}", spec.optimizer.lr);
    println!("  Optimizer: {:?}", spec.optimizer.kind);
    println!();
    let loss = &spec.distill;
    println!(
        "  Loss: theta {} * task + alpha {} * {} (T = {})",
        loss.theta,
        loss.alpha,
        loss.loss_type.name(),
        loss.temperature
    );
    if loss.self_distill {
        println!("  Self-distillation: enabled");
    }
    println!("  Epochs: {}", spec.training.epochs);
    println!("  Accumulation: {:?}", spec.training.accumulation);
    let ids = |attacks: &[destilar::attack::AttackSpec]| {
        attacks.iter().map(|a| a.id.as_str()).collect::<Vec<_>>().join(", ")
    };
    println!("  Train attacks: [{}]", ids(&spec.attacks.train));
    println!("  Test attacks: [{}]", ids(&spec.attacks.test));
}
