//! In-memory checkpoint: named tensors plus metadata

use crate::{Error, Model, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One stored tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::ShapeMismatch {
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self {
            name: name.into(),
            shape,
            data,
        })
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Namescope of the model the tensors were taken from
    pub namescope: String,

    /// Training epoch at save time, if any
    #[serde(default)]
    pub epoch: Option<usize>,

    /// RFC 3339 creation timestamp
    #[serde(default)]
    pub created: String,

    #[serde(default)]
    pub custom: HashMap<String, String>,
}

/// A set of named tensors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub metadata: CheckpointMetadata,
    pub tensors: Vec<NamedTensor>,
}

impl Checkpoint {
    pub fn new(metadata: CheckpointMetadata, tensors: Vec<NamedTensor>) -> Self {
        Self { metadata, tensors }
    }

    /// Snapshot every parameter of a model, buffers included
    pub fn from_model(model: &dyn Model, epoch: Option<usize>) -> Self {
        let tensors = model
            .params()
            .iter()
            .map(|p| NamedTensor {
                name: p.name().to_string(),
                shape: p.shape().to_vec(),
                data: p.data().to_vec(),
            })
            .collect();
        Self {
            metadata: CheckpointMetadata {
                namescope: model.namescope().to_string(),
                epoch,
                created: chrono::Local::now().to_rfc3339(),
                custom: HashMap::new(),
            },
            tensors,
        }
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of stored values
    pub fn num_values(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }
}
