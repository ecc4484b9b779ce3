//! Checkpoint loading

use super::checkpoint::{Checkpoint, CheckpointMetadata, NamedTensor};
use super::format::CheckpointFormat;
use super::save::CHECKPOINT_STEM;
use crate::{Error, Result};
use safetensors::tensor::Dtype;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Load a checkpoint from a file or a checkpoint directory
///
/// A directory resolves to the first `checkpoint.<ext>` it contains. The
/// format of a file is detected from its extension.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let path = resolve_path(path.as_ref())?;

    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Serialization(format!("{} has no extension", path.display())))?;
    let format = CheckpointFormat::from_extension(ext)
        .ok_or_else(|| Error::Serialization(format!("Unsupported file extension: {ext}")))?;

    match format {
        CheckpointFormat::SafeTensors => load_safetensors(&path),
        CheckpointFormat::Json => {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Serialization(format!("JSON deserialization failed: {e}")))
        }
        CheckpointFormat::Yaml => {
            let content = std::fs::read_to_string(&path)?;
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Serialization(format!("YAML deserialization failed: {e}")))
        }
    }
}

/// Read every tensor stored at `path`
pub fn read_tensors(path: impl AsRef<Path>) -> Result<Vec<NamedTensor>> {
    Ok(load_checkpoint(path)?.tensors)
}

fn resolve_path(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        if !path.exists() {
            return Err(Error::MissingCheckpoint(format!(
                "{} does not exist",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }
    CheckpointFormat::ALL
        .iter()
        .map(|f| path.join(format!("{CHECKPOINT_STEM}.{}", f.extension())))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            Error::MissingCheckpoint(format!("no checkpoint file in {}", path.display()))
        })
}

fn load_safetensors(path: &Path) -> Result<Checkpoint> {
    let data = std::fs::read(path)?;

    let (_, st_metadata) = safetensors::SafeTensors::read_metadata(&data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
    let mut custom: HashMap<String, String> = st_metadata.metadata().clone().unwrap_or_default();
    let namescope = custom.remove("namescope").unwrap_or_default();
    let created = custom.remove("created").unwrap_or_default();
    let epoch = custom.remove("epoch").and_then(|e| e.parse().ok());

    let safetensors = safetensors::SafeTensors::deserialize(&data)
        .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;

    let mut names = safetensors.names();
    names.sort();
    let tensors = names
        .into_iter()
        .map(|name| {
            let view = safetensors
                .tensor(name)
                .map_err(|e| Error::Serialization(format!("tensor {name}: {e}")))?;
            if view.dtype() != Dtype::F32 {
                return Err(Error::Serialization(format!(
                    "tensor {name} has dtype {:?}, expected F32",
                    view.dtype()
                )));
            }
            // byte buffer is not guaranteed to be 4-aligned
            let values = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            NamedTensor::new(name.to_string(), view.shape().to_vec(), values)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Checkpoint::new(
        CheckpointMetadata {
            namescope,
            epoch,
            created,
            custom,
        },
        tensors,
    ))
}
