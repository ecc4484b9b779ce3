//! Data sources

use super::batch::{Batch, Split};
use crate::io::{read_tensors, NamedTensor};
use crate::{Error, Result};
use ndarray::{s, Array2, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Valid pixel intensity range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelRange {
    pub min: f32,
    pub max: f32,
}

impl Default for PixelRange {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 255.0,
        }
    }
}

impl PixelRange {
    pub fn clip(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// Producer of batches for the training core
///
/// `next_batch` blocks until a batch is available. Sources that prefetch on
/// background threads do so behind this interface.
pub trait DataSource {
    /// Begin producing batches
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop producing batches and release resources
    fn stop(&mut self) {}

    /// Number of examples in a split
    fn num_examples(&self, split: Split) -> usize;

    /// Fetch the next batch of `batch_size` examples
    fn next_batch(&mut self, split: Split, batch_size: usize) -> Result<Batch>;

    /// Epoch-boundary synchronization notification
    fn epoch_end(&mut self, _split: Split) {}
}

/// Training-time augmentation applied to the augmented image only
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Augment {
    /// Mirror each image horizontally with probability 0.5
    #[serde(default)]
    pub flip_horizontal: bool,
    /// Add uniform noise in `[-jitter, jitter]` to every pixel
    #[serde(default)]
    pub jitter: f32,
}

impl Augment {
    pub fn is_identity(&self) -> bool {
        !self.flip_horizontal && self.jitter <= 0.0
    }
}

struct SplitData {
    images: Array4<f32>,
    labels: Array2<f32>,
    seeds: Option<Array4<f32>>,
    order: Vec<usize>,
    cursor: usize,
}

impl SplitData {
    fn new(images: Array4<f32>, labels: Array2<f32>, seeds: Option<Array4<f32>>) -> Result<Self> {
        let n = images.dim().0;
        if labels.nrows() != n || seeds.as_ref().is_some_and(|s| s.dim() != images.dim()) {
            return Err(Error::ShapeMismatch {
                expected: images.shape().to_vec(),
                got: vec![labels.nrows(), seeds.as_ref().map_or(n, |s| s.dim().0)],
            });
        }
        Ok(Self {
            images,
            labels,
            seeds,
            order: (0..n).collect(),
            cursor: 0,
        })
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn take(&mut self, batch_size: usize) -> Option<Vec<usize>> {
        if self.cursor + batch_size > self.len() {
            return None;
        }
        let indices = self.order[self.cursor..self.cursor + batch_size].to_vec();
        self.cursor += batch_size;
        Some(indices)
    }
}

/// Data source backed by arrays held in memory
///
/// The training split is reshuffled at every wrap-around; the validation
/// split is always visited in order.
pub struct InMemoryDataSource {
    train: SplitData,
    validation: SplitData,
    augment: Augment,
    range: PixelRange,
    rng: StdRng,
    shuffle: bool,
    started: bool,
}

impl InMemoryDataSource {
    /// Create a source from train and validation arrays
    pub fn new(
        train_images: Array4<f32>,
        train_labels: Array2<f32>,
        val_images: Array4<f32>,
        val_labels: Array2<f32>,
    ) -> Result<Self> {
        if train_labels.ncols() != val_labels.ncols() {
            return Err(Error::DataSource(format!(
                "train has {} classes but validation has {}",
                train_labels.ncols(),
                val_labels.ncols()
            )));
        }
        Ok(Self {
            train: SplitData::new(train_images, train_labels, None)?,
            validation: SplitData::new(val_images, val_labels, None)?,
            augment: Augment::default(),
            range: PixelRange::default(),
            rng: StdRng::seed_from_u64(0),
            shuffle: true,
            started: false,
        })
    }

    /// Load a dataset from a safetensors file
    ///
    /// Expected tensors: `train/images` `[N, H, W, C]`, `train/labels`
    /// `[N, classes]`, `val/images`, `val/labels`, and optionally
    /// `train/seeds` / `val/seeds` holding precomputed adversarial seeds.
    pub fn from_safetensors(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tensors = read_tensors(path)?;
        let find = |name: &str| tensors.iter().find(|t| t.name == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                Error::DataSource(format!("{} has no tensor named '{name}'", path.display()))
            })
        };

        let mut source = Self::new(
            to_images(require("train/images")?)?,
            to_labels(require("train/labels")?)?,
            to_images(require("val/images")?)?,
            to_labels(require("val/labels")?)?,
        )?;
        if let Some(seeds) = find("train/seeds") {
            source = source.with_seeds(Split::Train, to_images(seeds)?)?;
        }
        if let Some(seeds) = find("val/seeds") {
            source = source.with_seeds(Split::Validation, to_images(seeds)?)?;
        }
        tracing::info!(
            path = %path.display(),
            train = source.num_examples(Split::Train),
            validation = source.num_examples(Split::Validation),
            "loaded dataset"
        );
        Ok(source)
    }

    /// Attach precomputed adversarial seed images to a split
    pub fn with_seeds(mut self, split: Split, seeds: Array4<f32>) -> Result<Self> {
        let data = self.split_mut(split);
        if seeds.dim() != data.images.dim() {
            return Err(Error::ShapeMismatch {
                expected: data.images.shape().to_vec(),
                got: seeds.shape().to_vec(),
            });
        }
        data.seeds = Some(seeds);
        Ok(self)
    }

    pub fn with_augment(mut self, augment: Augment) -> Self {
        self.augment = augment;
        self
    }

    pub fn with_pixel_range(mut self, range: PixelRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Visit the training split in storage order
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    pub fn pixel_range(&self) -> PixelRange {
        self.range
    }

    /// Flattened input width and class count of the training split
    pub fn input_shape(&self) -> (usize, usize) {
        let (_, h, w, c) = self.train.images.dim();
        (h * w * c, self.train.labels.ncols())
    }

    fn split_mut(&mut self, split: Split) -> &mut SplitData {
        match split {
            Split::Train => &mut self.train,
            Split::Validation => &mut self.validation,
        }
    }

    fn rewind(&mut self, split: Split) {
        let shuffle = self.shuffle && split == Split::Train;
        let data = match split {
            Split::Train => &mut self.train,
            Split::Validation => &mut self.validation,
        };
        data.cursor = 0;
        if shuffle {
            data.order.shuffle(&mut self.rng);
        }
    }

    fn augment_images(&mut self, images: &Array4<f32>) -> Array4<f32> {
        let mut out = images.clone();
        if self.augment.flip_horizontal {
            for mut image in out.outer_iter_mut() {
                if self.rng.random_bool(0.5) {
                    let flipped = image.slice(s![.., ..;-1, ..]).to_owned();
                    image.assign(&flipped);
                }
            }
        }
        if self.augment.jitter > 0.0 {
            let jitter = self.augment.jitter;
            let range = self.range;
            let rng = &mut self.rng;
            out.mapv_inplace(|v| range.clip(v + rng.random_range(-jitter..=jitter)));
        }
        out
    }
}

impl DataSource for InMemoryDataSource {
    fn start(&mut self) -> Result<()> {
        if !self.started {
            self.rewind(Split::Train);
            self.rewind(Split::Validation);
            self.started = true;
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn num_examples(&self, split: Split) -> usize {
        match split {
            Split::Train => self.train.len(),
            Split::Validation => self.validation.len(),
        }
    }

    fn next_batch(&mut self, split: Split, batch_size: usize) -> Result<Batch> {
        if !self.started {
            return Err(Error::DataSource("data source has not been started".to_string()));
        }
        let available = self.num_examples(split);
        if batch_size == 0 || batch_size > available {
            return Err(Error::DataSource(format!(
                "cannot draw a batch of {batch_size} from the {split} split of {available} examples"
            )));
        }

        let indices = match self.split_mut(split).take(batch_size) {
            Some(indices) => indices,
            None => {
                self.rewind(split);
                self.split_mut(split)
                    .take(batch_size)
                    .ok_or_else(|| Error::DataSource(format!("{split} split exhausted")))?
            }
        };

        let data = self.split_mut(split);
        let clean = data.images.select(Axis(0), &indices);
        let labels = data.labels.select(Axis(0), &indices);
        let seeds = match &data.seeds {
            Some(seeds) => seeds.select(Axis(0), &indices),
            None => clean.clone(),
        };
        let augmented = if split == Split::Train && !self.augment.is_identity() {
            self.augment_images(&clean)
        } else {
            clean.clone()
        };
        Batch::new(clean, augmented, labels, seeds)
    }

    fn epoch_end(&mut self, split: Split) {
        self.rewind(split);
    }
}

/// One-hot encode class indices
pub fn one_hot(classes: &[usize], num_classes: usize) -> Result<Array2<f32>> {
    let mut labels = Array2::zeros((classes.len(), num_classes));
    for (row, &class) in classes.iter().enumerate() {
        if class >= num_classes {
            return Err(Error::InvalidParameter(format!(
                "class {class} out of range for {num_classes} classes"
            )));
        }
        labels[[row, class]] = 1.0;
    }
    Ok(labels)
}

fn to_images(tensor: &NamedTensor) -> Result<Array4<f32>> {
    match tensor.shape.as_slice() {
        &[n, h, w, c] => Array4::from_shape_vec((n, h, w, c), tensor.data.clone())
            .map_err(|e| Error::DataSource(format!("{}: {e}", tensor.name))),
        other => Err(Error::DataSource(format!(
            "{} must be rank 4 [N, H, W, C], got {other:?}",
            tensor.name
        ))),
    }
}

fn to_labels(tensor: &NamedTensor) -> Result<Array2<f32>> {
    match tensor.shape.as_slice() {
        &[n, k] => Array2::from_shape_vec((n, k), tensor.data.clone())
            .map_err(|e| Error::DataSource(format!("{}: {e}", tensor.name))),
        other => Err(Error::DataSource(format!(
            "{} must be rank 2 [N, classes], got {other:?}",
            tensor.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(n_train: usize, n_val: usize) -> InMemoryDataSource {
        let train = Array4::from_shape_fn((n_train, 2, 2, 1), |(i, _, _, _)| i as f32);
        let val = Array4::from_shape_fn((n_val, 2, 2, 1), |(i, _, _, _)| 100.0 + i as f32);
        let train_labels = one_hot(&(0..n_train).map(|i| i % 2).collect::<Vec<_>>(), 2).unwrap();
        let val_labels = one_hot(&(0..n_val).map(|i| i % 2).collect::<Vec<_>>(), 2).unwrap();
        InMemoryDataSource::new(train, train_labels, val, val_labels).unwrap()
    }

    #[test]
    fn test_input_shape() {
        assert_eq!(source(4, 2).input_shape(), (4, 2));
    }

    #[test]
    fn test_requires_start() {
        let mut data = source(4, 4);
        assert!(data.next_batch(Split::Train, 2).is_err());
        data.start().unwrap();
        assert!(data.next_batch(Split::Train, 2).is_ok());
        data.stop();
        assert!(data.next_batch(Split::Train, 2).is_err());
    }

    #[test]
    fn test_validation_is_sequential_and_rewinds() {
        let mut data = source(4, 6);
        data.start().unwrap();
        let first = data.next_batch(Split::Validation, 3).unwrap();
        let second = data.next_batch(Split::Validation, 3).unwrap();
        assert_eq!(first.clean[[0, 0, 0, 0]], 100.0);
        assert_eq!(second.clean[[0, 0, 0, 0]], 103.0);
        data.epoch_end(Split::Validation);
        let again = data.next_batch(Split::Validation, 3).unwrap();
        assert_eq!(again.clean[[0, 0, 0, 0]], 100.0);
    }

    #[test]
    fn test_train_epoch_visits_every_example_once() {
        let mut data = source(8, 2).with_seed(11);
        data.start().unwrap();
        let mut seen: Vec<usize> = (0..4)
            .flat_map(|_| {
                let batch = data.next_batch(Split::Train, 2).unwrap();
                batch.clean.outer_iter().map(|img| img[[0, 0, 0]] as usize).collect::<Vec<_>>()
            })
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let mut data = source(4, 4);
        data.start().unwrap();
        assert!(data.next_batch(Split::Train, 5).is_err());
        assert!(data.next_batch(Split::Train, 0).is_err());
    }

    #[test]
    fn test_seed_defaults_to_clean_and_jitter_only_touches_augmented() {
        let mut data = source(4, 4).with_augment(Augment {
            flip_horizontal: false,
            jitter: 2.0,
        });
        data.start().unwrap();
        let batch = data.next_batch(Split::Train, 4).unwrap();
        assert_eq!(batch.seeds, batch.clean);
        assert!(batch
            .augmented
            .iter()
            .zip(batch.clean.iter())
            .all(|(a, c)| (a - c).abs() <= 2.0 && *a >= 0.0));
        let val = data.next_batch(Split::Validation, 4).unwrap();
        assert_eq!(val.augmented, val.clean);
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        assert!(one_hot(&[0, 2], 2).is_err());
        let labels = one_hot(&[1, 0], 2).unwrap();
        assert_eq!(labels.row(0).to_vec(), vec![0.0, 1.0]);
    }
}
