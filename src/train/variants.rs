//! Expansion of generated attack outputs into training variants

use crate::attack::GeneratedVariants;
use crate::data::flatten_images;
use crate::distill::ops::{tile_factor, tile_rows};
use crate::{Error, Result};
use ndarray::{Array2, Array4};

/// One (image, label) pair used for a single training step
#[derive(Clone, Debug)]
pub struct Variant {
    /// Attack identifier, used for metric bookkeeping
    pub id: String,
    /// Perturbed images `[N * k, H, W, C]`
    pub images: Array4<f32>,
    /// Flattened images `[N * k, H * W * C]`
    pub input: Array2<f32>,
    /// Labels aligned with `input`, one-hot or blended
    pub labels: Array2<f32>,
    /// Rows per source example
    pub factor: usize,
}

impl Variant {
    /// `(H, W, C)` of the variant images
    pub fn image_dims(&self) -> (usize, usize, usize) {
        let (_, h, w, c) = self.images.dim();
        (h, w, c)
    }

    pub fn rows(&self) -> usize {
        self.input.nrows()
    }
}

/// Ordered variants produced for one outer batch
#[derive(Clone, Debug, Default)]
pub struct VariantSet {
    variants: Vec<Variant>,
}

impl VariantSet {
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variant> {
        self.variants.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.variants.iter().map(|v| v.id.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a VariantSet {
    type Item = &'a Variant;
    type IntoIter = std::slice::Iter<'a, Variant>;

    fn into_iter(self) -> Self::IntoIter {
        self.variants.iter()
    }
}

/// Turns generator output into a [`VariantSet`] whose labels match each variant
#[derive(Clone, Copy, Debug, Default)]
pub struct VariantExpander;

impl VariantExpander {
    /// Pair every generated image array with its labels.
    ///
    /// Plain variants get the batch labels tiled by the variant's row factor;
    /// blended variants keep the generator's soft labels, which must already
    /// have one row per image.
    pub fn expand(&self, labels: &Array2<f32>, generated: GeneratedVariants) -> Result<VariantSet> {
        generated.check()?;
        if generated.is_empty() {
            return Err(Error::Attack(
                "attack generator returned no variants".to_string(),
            ));
        }

        let batch = labels.nrows();
        let mut variants = Vec::with_capacity(generated.len());
        let parts = generated
            .ids
            .into_iter()
            .zip(generated.images)
            .zip(generated.labels);

        for ((id, images), soft) in parts {
            let rows = images.dim().0;
            let factor = tile_factor(rows, batch)?;
            let labels = match soft {
                Some(soft) if soft.dim() == (rows, labels.ncols()) => soft,
                Some(soft) => {
                    return Err(Error::ShapeMismatch {
                        expected: vec![rows, labels.ncols()],
                        got: soft.shape().to_vec(),
                    })
                }
                None => tile_rows(labels, factor),
            };
            let input = flatten_images(&images);
            variants.push(Variant {
                id,
                images,
                input,
                labels,
                factor,
            });
        }

        Ok(VariantSet { variants })
    }
}
