//! Built-in variant generator

use super::{AttackGenerator, AttackTargets, GeneratedVariants};
use crate::data::{flatten_images, PixelRange};
use crate::distill::ops::{softmax_cross_entropy, tile_factor, tile_rows};
use crate::model::{Model, OutputGrads};
use crate::{Error, Result};
use ndarray::{Array, Array2, Array4, Axis, RemoveAxis, Slice};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

fn default_restarts() -> usize {
    1
}

/// Perturbation procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttackKind {
    /// The input images unchanged
    Clean,
    /// The precomputed adversarial seed images from the data source
    Seed,
    /// Uniform noise in `[-epsilon, epsilon]`, `restarts` draws per example
    UniformNoise {
        epsilon: f32,
        #[serde(default = "default_restarts")]
        restarts: usize,
    },
    /// Fast gradient sign method
    Fgsm { epsilon: f32 },
    /// Projected gradient descent under an L-inf bound
    Pgd {
        epsilon: f32,
        step_size: f32,
        iterations: usize,
        #[serde(default)]
        random_start: bool,
    },
    /// Blend each example with a random partner, labels included
    Mixup { max_weight: f32 },
}

impl AttackKind {
    fn needs_model(&self) -> bool {
        matches!(self, AttackKind::Fgsm { .. } | AttackKind::Pgd { .. })
    }
}

/// One configured attack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackSpec {
    /// Stable identifier used for metric bookkeeping
    pub id: String,
    #[serde(flatten)]
    pub kind: AttackKind,
    /// Model to compute gradients on; defaults to the model being attacked
    #[serde(default)]
    pub target: Option<String>,
}

impl AttackSpec {
    pub fn new(id: impl Into<String>, kind: AttackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            target: None,
        }
    }

    pub fn targeting(mut self, model: impl Into<String>) -> Self {
        self.target = Some(model.into());
        self
    }
}

/// Generator running a fixed list of attacks
///
/// With `merge` set, every variant of a call is interleaved into a single
/// array holding all rows of example `i` before those of example `i + 1`.
pub struct VariantGenerator {
    attacks: Vec<AttackSpec>,
    merge: bool,
    range: PixelRange,
    seed: u64,
    epoch: u64,
    batch: u64,
    rng: StdRng,
}

impl VariantGenerator {
    pub fn new(attacks: Vec<AttackSpec>) -> Self {
        Self {
            attacks,
            merge: false,
            range: PixelRange::default(),
            seed: 0,
            epoch: 0,
            batch: 0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Generator that passes the clean images through unchanged
    pub fn clean() -> Self {
        Self::new(vec![AttackSpec::new("clean", AttackKind::Clean)])
    }

    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_pixel_range(mut self, range: PixelRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn attacks(&self) -> &[AttackSpec] {
        &self.attacks
    }

    fn clip(&self, images: &mut Array4<f32>) {
        let range = self.range;
        images.mapv_inplace(|v| range.clip(v));
    }

    fn uniform_noise(&mut self, images: &Array4<f32>, epsilon: f32, restarts: usize) -> Array4<f32> {
        let restarts = restarts.max(1);
        let mut out = tile_images(images, restarts);
        if epsilon > 0.0 {
            let rng = &mut self.rng;
            out.mapv_inplace(|v| v + rng.random_range(-epsilon..=epsilon));
        }
        self.clip(&mut out);
        out
    }

    fn gradient_sign(
        model: &dyn Model,
        images: &Array4<f32>,
        labels: &Array2<f32>,
    ) -> Result<Array4<f32>> {
        let input = flatten_images(images);
        let output = model.forward(&input)?;
        let (_, grad) = softmax_cross_entropy(labels, &output.logits)?;
        let mut grads = OutputGrads::zeros_like(&output);
        grads.logits = grad;
        let input_grad = model.input_gradient(&input, &grads)?;
        let signs: Vec<f32> = input_grad.iter().map(|g| sign(*g)).collect();
        Array4::from_shape_vec(images.dim(), signs)
            .map_err(|e| Error::Attack(format!("input gradient shape: {e}")))
    }

    fn fgsm(&self, model: &dyn Model, images: &Array4<f32>, labels: &Array2<f32>, epsilon: f32) -> Result<Array4<f32>> {
        let signs = Self::gradient_sign(model, images, labels)?;
        let mut out = images + &(signs * epsilon);
        self.clip(&mut out);
        Ok(out)
    }

    fn pgd(
        &mut self,
        model: &dyn Model,
        images: &Array4<f32>,
        labels: &Array2<f32>,
        epsilon: f32,
        step_size: f32,
        iterations: usize,
        random_start: bool,
    ) -> Result<Array4<f32>> {
        let mut adv = if random_start {
            self.uniform_noise(images, epsilon, 1)
        } else {
            images.clone()
        };
        for _ in 0..iterations {
            let signs = Self::gradient_sign(model, &adv, labels)?;
            adv.scaled_add(step_size, &signs);
            // project back into the epsilon ball around the clean images
            adv.zip_mut_with(images, |a, &x| *a = a.clamp(x - epsilon, x + epsilon));
            self.clip(&mut adv);
        }
        Ok(adv)
    }

    fn mixup(
        &mut self,
        images: &Array4<f32>,
        labels: &Array2<f32>,
        max_weight: f32,
    ) -> (Array4<f32>, Array2<f32>) {
        let n = images.dim().0;
        let mut partners: Vec<usize> = (0..n).collect();
        partners.shuffle(&mut self.rng);

        let mut mixed_images = images.clone();
        let mut mixed_labels = labels.clone();
        for (i, &j) in partners.iter().enumerate() {
            let weight = if max_weight > 0.0 {
                self.rng.random_range(0.0..=max_weight)
            } else {
                0.0
            };
            let partner_image = images.index_axis(Axis(0), j);
            mixed_images
                .index_axis_mut(Axis(0), i)
                .zip_mut_with(&partner_image, |a, &b| *a = (1.0 - weight) * *a + weight * b);
            let partner_label = labels.row(j);
            mixed_labels
                .row_mut(i)
                .zip_mut_with(&partner_label, |a, &b| *a = (1.0 - weight) * *a + weight * b);
        }
        (mixed_images, mixed_labels)
    }

    fn merge_variants(generated: GeneratedVariants, batch: usize, labels: &Array2<f32>) -> Result<GeneratedVariants> {
        if generated.len() <= 1 {
            return Ok(generated);
        }
        let id = generated.ids.join("+");
        let images = interleave(&generated.images, batch)?;
        let mut merged = GeneratedVariants::new();
        if generated.labels.iter().any(Option::is_some) {
            let parts = generated
                .labels
                .iter()
                .zip(&generated.images)
                .map(|(soft, imgs)| match soft {
                    Some(soft) => Ok(soft.clone()),
                    None => Ok(tile_rows(labels, tile_factor(imgs.dim().0, batch)?)),
                })
                .collect::<Result<Vec<_>>>()?;
            merged.push_with_labels(id, images, interleave(&parts, batch)?);
        } else {
            merged.push(id, images);
        }
        Ok(merged)
    }
}

impl AttackGenerator for VariantGenerator {
    fn new_epoch(&mut self) {
        self.epoch += 1;
        self.batch = 0;
    }

    fn new_batch(&mut self) {
        self.batch += 1;
        self.rng = StdRng::seed_from_u64(self.seed ^ (self.epoch << 32) ^ self.batch);
    }

    fn attack_ids(&self) -> Vec<String> {
        self.attacks.iter().map(|a| a.id.clone()).collect()
    }

    fn generate_for_model(
        &mut self,
        targets: &AttackTargets<'_>,
        model_id: &str,
        images: &Array4<f32>,
        labels: &Array2<f32>,
        seeds: &Array4<f32>,
    ) -> Result<GeneratedVariants> {
        let batch = images.dim().0;
        if labels.nrows() != batch || seeds.dim() != images.dim() {
            return Err(Error::ShapeMismatch {
                expected: images.shape().to_vec(),
                got: vec![labels.nrows(), seeds.dim().0],
            });
        }

        let mut generated = GeneratedVariants::new();
        for spec in self.attacks.clone() {
            let model = if spec.kind.needs_model() {
                Some(targets.get(spec.target.as_deref().unwrap_or(model_id))?)
            } else {
                None
            };
            match (spec.kind, model) {
                (AttackKind::Clean, _) => generated.push(spec.id, images.clone()),
                (AttackKind::Seed, _) => generated.push(spec.id, seeds.clone()),
                (AttackKind::UniformNoise { epsilon, restarts }, _) => {
                    let out = self.uniform_noise(images, epsilon, restarts);
                    generated.push(spec.id, out);
                }
                (AttackKind::Fgsm { epsilon }, Some(model)) => {
                    let out = self.fgsm(model, images, labels, epsilon)?;
                    generated.push(spec.id, out);
                }
                (
                    AttackKind::Pgd {
                        epsilon,
                        step_size,
                        iterations,
                        random_start,
                    },
                    Some(model),
                ) => {
                    let out = self.pgd(
                        model,
                        images,
                        labels,
                        epsilon,
                        step_size,
                        iterations,
                        random_start,
                    )?;
                    generated.push(spec.id, out);
                }
                (AttackKind::Mixup { max_weight }, _) => {
                    let (out, soft) = self.mixup(images, labels, max_weight);
                    generated.push_with_labels(spec.id, out, soft);
                }
                (kind, None) => {
                    return Err(Error::Attack(format!("{kind:?} requires a target model")));
                }
            }
        }

        if self.merge {
            generated = Self::merge_variants(generated, batch, labels)?;
        }
        Ok(generated)
    }
}

fn sign(value: f32) -> f32 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Repeat every image `factor` times, keeping copies of one example adjacent
pub(crate) fn tile_images(images: &Array4<f32>, factor: usize) -> Array4<f32> {
    if factor == 1 {
        return images.clone();
    }
    let indices: Vec<usize> = (0..images.dim().0)
        .flat_map(|i| std::iter::repeat_n(i, factor))
        .collect();
    images.select(Axis(0), &indices)
}

/// Interleave parts so that all rows of example `i` precede those of `i + 1`
fn interleave<D: RemoveAxis>(parts: &[Array<f32, D>], batch: usize) -> Result<Array<f32, D>> {
    let factors = parts
        .iter()
        .map(|p| tile_factor(p.len_of(Axis(0)), batch))
        .collect::<Result<Vec<_>>>()?;
    let mut views = Vec::with_capacity(parts.len() * batch);
    for i in 0..batch {
        for (part, &r) in parts.iter().zip(&factors) {
            views.push(part.slice_axis(Axis(0), Slice::from(i * r..(i + 1) * r)));
        }
    }
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| Error::Attack(format!("cannot merge variants: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::one_hot;
    use crate::model::LinearClassifier;

    fn batch() -> (Array4<f32>, Array2<f32>) {
        let images = Array4::from_shape_fn((2, 2, 2, 1), |(i, y, x, _)| 100.0 * i as f32 + (y * 2 + x) as f32 + 10.0);
        (images, one_hot(&[0, 1], 2).unwrap())
    }

    #[test]
    fn test_clean_and_seed_variants() {
        let (images, labels) = batch();
        let seeds = images.mapv(|v| v + 1.0);
        let mut generator = VariantGenerator::new(vec![
            AttackSpec::new("clean", AttackKind::Clean),
            AttackSpec::new("seed", AttackKind::Seed),
        ]);
        let out = generator
            .generate_for_model(&AttackTargets::new(), "stu", &images, &labels, &seeds)
            .unwrap();
        assert_eq!(out.ids, vec!["clean", "seed"]);
        assert_eq!(out.images[0], images);
        assert_eq!(out.images[1], seeds);
        out.check().unwrap();
    }

    #[test]
    fn test_uniform_noise_restarts_are_adjacent_and_bounded() {
        let (images, labels) = batch();
        let mut generator = VariantGenerator::new(vec![AttackSpec::new(
            "noise",
            AttackKind::UniformNoise {
                epsilon: 4.0,
                restarts: 3,
            },
        )])
        .with_seed(9);
        generator.new_batch();
        let out = generator
            .generate_for_model(&AttackTargets::new(), "stu", &images, &labels, &images)
            .unwrap();
        let adv = &out.images[0];
        assert_eq!(adv.dim().0, 6);
        for i in 0..2 {
            for j in 0..3 {
                let diff = &adv.index_axis(Axis(0), i * 3 + j) - &images.index_axis(Axis(0), i);
                assert!(diff.iter().all(|d| d.abs() <= 4.0 + 1e-4));
            }
        }
    }

    #[test]
    fn test_fgsm_needs_registered_target() {
        let (images, labels) = batch();
        let mut generator =
            VariantGenerator::new(vec![AttackSpec::new("fgsm", AttackKind::Fgsm { epsilon: 8.0 })]);
        let result =
            generator.generate_for_model(&AttackTargets::new(), "stu", &images, &labels, &images);
        assert!(result.is_err());
    }

    #[test]
    fn test_fgsm_moves_by_epsilon_and_raises_loss() {
        let (images, labels) = batch();
        let model = LinearClassifier::new("stu", 4, 2).with_seed(3, 0.05);
        let targets = AttackTargets::new().with("stu", &model);
        let mut generator =
            VariantGenerator::new(vec![AttackSpec::new("fgsm", AttackKind::Fgsm { epsilon: 2.0 })]);
        let out = generator
            .generate_for_model(&targets, "stu", &images, &labels, &images)
            .unwrap();
        let adv = &out.images[0];
        assert!(adv
            .iter()
            .zip(images.iter())
            .all(|(a, x)| (a - x).abs() <= 2.0 + 1e-4));

        let loss = |imgs: &Array4<f32>| {
            let logits = model.forward(&flatten_images(imgs)).unwrap().logits;
            softmax_cross_entropy(&labels, &logits).unwrap().0
        };
        assert!(loss(adv) > loss(&images));
    }

    #[test]
    fn test_pgd_stays_in_epsilon_ball() {
        let (images, labels) = batch();
        let model = LinearClassifier::new("tea", 4, 2).with_seed(4, 0.05);
        let targets = AttackTargets::new().with("tea", &model);
        let mut generator = VariantGenerator::new(vec![AttackSpec::new(
            "pgd",
            AttackKind::Pgd {
                epsilon: 3.0,
                step_size: 1.0,
                iterations: 5,
                random_start: true,
            },
        )
        .targeting("tea")]);
        generator.new_batch();
        let out = generator
            .generate_for_model(&targets, "stu", &images, &labels, &images)
            .unwrap();
        assert!(out.images[0]
            .iter()
            .zip(images.iter())
            .all(|(a, x)| (a - x).abs() <= 3.0 + 1e-4));
    }

    #[test]
    fn test_mixup_labels_remain_distributions() {
        let (images, labels) = batch();
        let mut generator =
            VariantGenerator::new(vec![AttackSpec::new("mixup", AttackKind::Mixup { max_weight: 0.5 })]);
        generator.new_batch();
        let out = generator
            .generate_for_model(&AttackTargets::new(), "stu", &images, &labels, &images)
            .unwrap();
        let soft = out.labels[0].as_ref().unwrap();
        for row in soft.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_merge_interleaves_per_example() {
        let (images, labels) = batch();
        let seeds = images.mapv(|v| -v);
        let mut generator = VariantGenerator::new(vec![
            AttackSpec::new("clean", AttackKind::Clean),
            AttackSpec::new("seed", AttackKind::Seed),
        ])
        .with_merge(true)
        .with_pixel_range(PixelRange {
            min: -255.0,
            max: 255.0,
        });
        let out = generator
            .generate_for_model(&AttackTargets::new(), "stu", &images, &labels, &seeds)
            .unwrap();
        assert_eq!(out.ids, vec!["clean+seed"]);
        let merged = &out.images[0];
        assert_eq!(merged.dim().0, 4);
        assert_eq!(merged.index_axis(Axis(0), 1), seeds.index_axis(Axis(0), 0));
        assert_eq!(merged.index_axis(Axis(0), 2), images.index_axis(Axis(0), 1));
    }

    #[test]
    fn test_attack_spec_yaml() {
        let yaml = r#"
- id: fgsm_8
  type: fgsm
  epsilon: 8.0
  target: surrogate
- id: noise
  type: uniform_noise
  epsilon: 4.0
"#;
        let specs: Vec<AttackSpec> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(specs[0].kind, AttackKind::Fgsm { epsilon: 8.0 });
        assert_eq!(specs[0].target.as_deref(), Some("surrogate"));
        assert_eq!(
            specs[1].kind,
            AttackKind::UniformNoise {
                epsilon: 4.0,
                restarts: 1
            }
        );
    }
}
