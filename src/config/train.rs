//! Single-command training from YAML configuration

use super::builder::build_trainer;
use super::schema::DistillSpec;
use super::validate::DistillConfig;
use crate::data::InMemoryDataSource;
use crate::error::{Error, Result};
use crate::io::RunMode;
use crate::train::{RunOutcome, TrainResult, ValidationReport};
use std::fs;
use std::path::Path;

/// Parse a YAML spec without validating it
///
/// Command-line overrides are applied to the returned spec before it is
/// validated by [`DistillConfig::new`].
pub fn load_spec<P: AsRef<Path>>(config_path: P) -> Result<DistillSpec> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    serde_yaml::from_str(&yaml_content)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {}", e)))
}

/// Load and validate a YAML configuration
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<DistillConfig> {
    DistillConfig::new(load_spec(config_path)?)
}

/// Open the configured dataset, build every network and run `mode`
pub fn run_config(config: DistillConfig, mode: RunMode) -> Result<RunOutcome> {
    let spec = config.spec();
    let path = spec
        .data
        .path
        .as_ref()
        .ok_or_else(|| Error::ConfigError("data.path is required to run".to_string()))?;
    let mut source = InMemoryDataSource::from_safetensors(path)?
        .with_augment(spec.data.augment)
        .with_pixel_range(spec.data.pixel_range)
        .with_seed(spec.training.seed);
    let (features, classes) = source.input_shape();

    let mut trainer = build_trainer(config, features, classes)?;
    trainer.start(mode, &mut source)
}

/// Train a student from a YAML configuration file
///
/// # Example
///
/// ```no_run
/// use destilar::config::train_from_yaml;
///
/// let result = train_from_yaml("distill.yaml")?;
/// println!("best accuracy: {:?}", result.best_accuracy);
/// # Ok::<(), destilar::Error>(())
/// ```
pub fn train_from_yaml<P: AsRef<Path>>(config_path: P) -> Result<TrainResult> {
    match run_config(load_config(config_path)?, RunMode::Train)? {
        RunOutcome::Trained(result) => Ok(result),
        RunOutcome::Tested(_) => Err(Error::ConfigError(
            "training run produced test reports".to_string(),
        )),
    }
}

/// Evaluate restored checkpoints from a YAML configuration file
pub fn test_from_yaml<P: AsRef<Path>>(config_path: P) -> Result<Vec<ValidationReport>> {
    match run_config(load_config(config_path)?, RunMode::Test)? {
        RunOutcome::Tested(reports) => Ok(reports),
        RunOutcome::Trained(_) => Err(Error::ConfigError(
            "test run produced a training result".to_string(),
        )),
    }
}
