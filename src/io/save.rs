//! Checkpoint saving

use super::checkpoint::Checkpoint;
use super::format::{CheckpointFormat, SaveConfig};
use crate::{Error, Model, Result};
use safetensors::tensor::{Dtype, TensorView};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name used when a checkpoint is addressed by directory
pub const CHECKPOINT_STEM: &str = "checkpoint";

/// Save a checkpoint to a file
///
/// # Example
///
/// ```no_run
/// use destilar::io::{save_checkpoint, Checkpoint, CheckpointFormat, SaveConfig};
/// use destilar::model::LinearClassifier;
///
/// let model = LinearClassifier::new("stu", 784, 10);
/// let ckpt = Checkpoint::from_model(&model, None);
/// save_checkpoint(&ckpt, "student.json", &SaveConfig::new(CheckpointFormat::Json)).unwrap();
/// ```
pub fn save_checkpoint(
    checkpoint: &Checkpoint,
    path: impl AsRef<Path>,
    config: &SaveConfig,
) -> Result<()> {
    let path = path.as_ref();
    match config.format {
        CheckpointFormat::SafeTensors => return save_safetensors(checkpoint, path),
        CheckpointFormat::Json => {
            let data = if config.pretty {
                serde_json::to_string_pretty(checkpoint)
            } else {
                serde_json::to_string(checkpoint)
            }
            .map_err(|e| Error::Serialization(format!("JSON serialization failed: {e}")))?;
            let mut file = File::create(path)?;
            file.write_all(data.as_bytes())?;
        }
        CheckpointFormat::Yaml => {
            let data = serde_yaml::to_string(checkpoint)
                .map_err(|e| Error::Serialization(format!("YAML serialization failed: {e}")))?;
            let mut file = File::create(path)?;
            file.write_all(data.as_bytes())?;
        }
    }
    Ok(())
}

/// Save every parameter of `model` into `dir/checkpoint.<ext>`, creating `dir`
pub fn save_model(
    model: &dyn Model,
    dir: impl AsRef<Path>,
    epoch: Option<usize>,
    config: &SaveConfig,
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{CHECKPOINT_STEM}.{}", config.format.extension()));
    save_checkpoint(&Checkpoint::from_model(model, epoch), &path, config)?;
    Ok(path)
}

fn save_safetensors(checkpoint: &Checkpoint, path: &Path) -> Result<()> {
    let tensor_data: Vec<(&str, Vec<u8>, Vec<usize>)> = checkpoint
        .tensors
        .iter()
        .map(|t| {
            let bytes: Vec<u8> = bytemuck::cast_slice(t.data.as_slice()).to_vec();
            (t.name.as_str(), bytes, t.shape.clone())
        })
        .collect();

    let views = tensor_data
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|e| Error::Serialization(format!("tensor {name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut metadata = checkpoint.metadata.custom.clone();
    metadata.insert("namescope".to_string(), checkpoint.metadata.namescope.clone());
    metadata.insert("created".to_string(), checkpoint.metadata.created.clone());
    if let Some(epoch) = checkpoint.metadata.epoch {
        metadata.insert("epoch".to_string(), epoch.to_string());
    }

    let bytes = safetensors::serialize(views, Some(metadata))
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
}
