//! Adversarial variant generation
//!
//! An [`AttackGenerator`] turns a batch of images into one or more perturbed
//! image arrays, each tagged with the identifier of the attack that produced
//! it. The number of arrays depends on the attack configuration and may
//! change from call to call. An array may hold several rows per example
//! (random restarts); rows for example `i` occupy `i * r .. (i + 1) * r`.

mod generator;

pub(crate) use generator::tile_images;
pub use generator::{AttackKind, AttackSpec, VariantGenerator};

use crate::{Error, Model, Result};
use ndarray::{Array2, Array4};

/// Output of one generator call
#[derive(Clone, Debug, Default)]
pub struct GeneratedVariants {
    /// Attack identifier per variant
    pub ids: Vec<String>,
    /// Perturbed images per variant, `[N * r, H, W, C]`
    pub images: Vec<Array4<f32>>,
    /// Soft labels per variant, when the attack blends labels
    pub labels: Vec<Option<Array2<f32>>>,
}

impl GeneratedVariants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a variant that keeps the original labels
    pub fn push(&mut self, id: impl Into<String>, images: Array4<f32>) {
        self.ids.push(id.into());
        self.images.push(images);
        self.labels.push(None);
    }

    /// Append a variant with blended labels
    pub fn push_with_labels(&mut self, id: impl Into<String>, images: Array4<f32>, labels: Array2<f32>) {
        self.ids.push(id.into());
        self.images.push(images);
        self.labels.push(Some(labels));
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Check that ids, images and labels line up
    pub fn check(&self) -> Result<()> {
        if self.ids.len() != self.images.len() || self.labels.len() != self.images.len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.images.len(); 3],
                got: vec![self.ids.len(), self.images.len(), self.labels.len()],
            });
        }
        Ok(())
    }
}

/// Models an attack may target, keyed by identifier
#[derive(Default)]
pub struct AttackTargets<'a> {
    models: Vec<(&'a str, &'a dyn Model)>,
}

impl<'a> AttackTargets<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &'a str, model: &'a dyn Model) -> Self {
        self.models.push((id, model));
        self
    }

    pub fn get(&self, id: &str) -> Result<&'a dyn Model> {
        self.models
            .iter()
            .find(|(name, _)| *name == id)
            .map(|(_, model)| *model)
            .ok_or_else(|| Error::Attack(format!("no attack target named '{id}'")))
    }
}

/// Source of adversarial variants
pub trait AttackGenerator {
    /// Epoch boundary notification
    fn new_epoch(&mut self) {}

    /// Reset per-batch randomness
    fn new_batch(&mut self) {}

    /// Identifiers of the configured attacks, in generation order
    fn attack_ids(&self) -> Vec<String>;

    /// Generate variants of `images` against the model registered as `model_id`
    fn generate_for_model(
        &mut self,
        targets: &AttackTargets<'_>,
        model_id: &str,
        images: &Array4<f32>,
        labels: &Array2<f32>,
        seeds: &Array4<f32>,
    ) -> Result<GeneratedVariants>;
}
