//! Batch data structure

use crate::{Error, Result};
use ndarray::{Array2, Array4};
use serde::{Deserialize, Serialize};

/// Dataset split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "validation"),
        }
    }
}

/// Four parallel arrays sharing the same leading size
#[derive(Clone, Debug)]
pub struct Batch {
    pub clean: Array4<f32>,
    pub augmented: Array4<f32>,
    pub labels: Array2<f32>,
    pub seeds: Array4<f32>,
}

impl Batch {
    /// Create a batch, checking that every array has the same leading size
    pub fn new(
        clean: Array4<f32>,
        augmented: Array4<f32>,
        labels: Array2<f32>,
        seeds: Array4<f32>,
    ) -> Result<Self> {
        let size = clean.dim().0;
        if augmented.dim() != clean.dim() || seeds.dim() != clean.dim() || labels.nrows() != size {
            return Err(Error::ShapeMismatch {
                expected: clean.shape().to_vec(),
                got: vec![augmented.dim().0, labels.nrows(), seeds.dim().0],
            });
        }
        Ok(Self {
            clean,
            augmented,
            labels,
            seeds,
        })
    }

    /// Batch where the augmented and seed images are copies of the clean image
    pub fn from_clean(clean: Array4<f32>, labels: Array2<f32>) -> Result<Self> {
        Self::new(clean.clone(), clean.clone(), labels, clean)
    }

    /// Number of examples
    pub fn size(&self) -> usize {
        self.labels.nrows()
    }

    pub fn num_classes(&self) -> usize {
        self.labels.ncols()
    }
}

/// Flatten `[N, H, W, C]` images into `[N, H * W * C]` rows
pub fn flatten_images(images: &Array4<f32>) -> Array2<f32> {
    let (n, h, w, c) = images.dim();
    let features = h * w * c;
    let mut flat = Array2::zeros((n, features));
    for (mut row, image) in flat.outer_iter_mut().zip(images.outer_iter()) {
        for (dst, &src) in row.iter_mut().zip(image.iter()) {
            *dst = src;
        }
    }
    flat
}
