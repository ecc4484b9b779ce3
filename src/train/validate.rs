//! Clean, corrupted and adversarial validation rounds

use crate::attack::{tile_images, AttackGenerator, AttackTargets};
use crate::data::{flatten_images, salt_and_pepper, DataSource, PixelRange, Split};
use crate::distill::ops::{accuracy, softmax_cross_entropy, tile_factor, tile_rows};
use crate::{Error, Model, Result};
use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

/// Mean statistics of one attack over a validation round
#[derive(Clone, Debug, PartialEq)]
pub struct AttackStats {
    pub id: String,
    pub accuracy: f32,
    pub teacher_accuracy: f32,
    pub loss: f32,
    /// Mean absolute pixel difference to the augmented source images
    pub distance: f32,
}

/// Result of one pass over the validation split
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationReport {
    pub name: String,
    pub accuracy: f32,
    pub teacher_accuracy: f32,
    pub loss: f32,
    pub distance: f32,
    /// Per-attack statistics in first-seen order
    pub attacks: Vec<AttackStats>,
}

impl ValidationReport {
    /// Clean accuracy followed by one accuracy per attack
    ///
    /// This is the feedback vector for the schedule controllers.
    pub fn accuracies(&self) -> Vec<f32> {
        std::iter::once(self.accuracy)
            .chain(self.attacks.iter().map(|a| a.accuracy))
            .collect()
    }

    pub fn attack(&self, id: &str) -> Option<&AttackStats> {
        self.attacks.iter().find(|a| a.id == id)
    }
}

/// What a validation round measures
#[derive(Clone, Copy, Debug)]
pub struct ValidationRound<'a> {
    pub name: &'a str,
    /// Evaluate the configured test attacks
    pub adversarial: bool,
    /// Salt-and-pepper rate applied to the clean images first
    pub saltpepper: Option<f32>,
}

impl<'a> ValidationRound<'a> {
    pub fn clean(name: &'a str) -> Self {
        Self {
            name,
            adversarial: false,
            saltpepper: None,
        }
    }

    pub fn adversarial(name: &'a str) -> Self {
        Self {
            name,
            adversarial: true,
            saltpepper: None,
        }
    }

    pub fn with_saltpepper(mut self, rate: f32) -> Self {
        self.saltpepper = Some(rate);
        self
    }
}

/// Models taking part in a validation round
pub struct ValidationModels<'a> {
    pub student: &'a dyn Model,
    pub teacher: Option<&'a dyn Model>,
    /// Every model an attack may target, the student included
    pub targets: AttackTargets<'a>,
}

/// Running sums for one statistic set
#[derive(Clone, Copy, Debug, Default)]
struct Sums {
    accuracy: f64,
    teacher_accuracy: f64,
    loss: f64,
    distance: f64,
}

impl Sums {
    fn add(&mut self, accuracy: f32, teacher_accuracy: f32, loss: f32, distance: f32) {
        self.accuracy += f64::from(accuracy);
        self.teacher_accuracy += f64::from(teacher_accuracy);
        self.loss += f64::from(loss);
        self.distance += f64::from(distance);
    }

    fn mean(&self, steps: usize) -> [f32; 4] {
        let steps = steps.max(1) as f64;
        [
            (self.accuracy / steps) as f32,
            (self.teacher_accuracy / steps) as f32,
            (self.loss / steps) as f32,
            (self.distance / steps) as f32,
        ]
    }
}

/// Iterates the validation split once per round
pub struct ValidationRunner {
    batch_size: usize,
    range: PixelRange,
    rng: StdRng,
}

impl ValidationRunner {
    pub fn new(batch_size: usize, range: PixelRange) -> Self {
        Self {
            batch_size,
            range,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Seed the salt-and-pepper draws
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn run(
        &mut self,
        round: ValidationRound<'_>,
        source: &mut dyn DataSource,
        models: &ValidationModels<'_>,
        mut attacks: Option<&mut (dyn AttackGenerator + '_)>,
    ) -> Result<ValidationReport> {
        let available = source.num_examples(Split::Validation);
        if available == 0 {
            return Err(Error::DataSource("validation split is empty".to_string()));
        }
        let batch_size = self.batch_size.min(available);
        let steps = available / batch_size;
        let student_id = models.student.namescope();

        let mut clean = Sums::default();
        let mut per_attack: Vec<(String, Sums)> = Vec::new();

        for _ in 0..steps {
            let batch = source.next_batch(Split::Validation, batch_size)?;
            let images = match round.saltpepper {
                Some(rate) => salt_and_pepper(&batch.clean, rate, self.range, &mut self.rng),
                None => batch.clean.clone(),
            };

            let (acc, tea_acc, loss) = evaluate(models, &images, &batch.labels)?;
            clean.add(acc, tea_acc, loss, mean_abs_diff(&images, &batch.clean));

            let generator = match attacks.as_deref_mut() {
                Some(generator) if round.adversarial => generator,
                _ => continue,
            };
            generator.new_batch();
            let generated = generator.generate_for_model(
                &models.targets,
                student_id,
                &batch.augmented,
                &batch.labels,
                &batch.seeds,
            )?;
            generated.check()?;

            let parts = generated
                .ids
                .iter()
                .zip(&generated.images)
                .zip(&generated.labels);
            for ((id, adversarial), soft) in parts {
                let factor = tile_factor(adversarial.dim().0, batch.size())?;
                let labels = match soft {
                    Some(soft) => soft.clone(),
                    None => tile_rows(&batch.labels, factor),
                };
                let (acc, tea_acc, loss) = evaluate(models, adversarial, &labels)?;
                // restarts are compared against the shared source image and averaged once
                let distance = mean_abs_diff(adversarial, &tile_images(&batch.augmented, factor));

                let index = match per_attack.iter().position(|(seen, _)| seen == id) {
                    Some(index) => index,
                    None => {
                        per_attack.push((id.clone(), Sums::default()));
                        per_attack.len() - 1
                    }
                };
                per_attack[index].1.add(acc, tea_acc, loss, distance);
            }
        }
        source.epoch_end(Split::Validation);

        let [accuracy, teacher_accuracy, loss, distance] = clean.mean(steps);
        info!(
            "Test {}: loss: {:.3}; accuracy: {:.2} %; teacher accuracy: {:.2} %; Mean pixel distance: {:.2}",
            round.name,
            loss,
            accuracy * 100.0,
            teacher_accuracy * 100.0,
            distance
        );

        let attacks = per_attack
            .into_iter()
            .map(|(id, sums)| {
                let [accuracy, teacher_accuracy, loss, distance] = sums.mean(steps);
                info!(
                    "test {}: acc: {:.3}; tea_acc: {:.3}; ce_loss: {:.2}; dist: {:.2}",
                    id, accuracy, teacher_accuracy, loss, distance
                );
                AttackStats {
                    id,
                    accuracy,
                    teacher_accuracy,
                    loss,
                    distance,
                }
            })
            .collect();

        Ok(ValidationReport {
            name: round.name.to_string(),
            accuracy,
            teacher_accuracy,
            loss,
            distance,
            attacks,
        })
    }
}

/// Student accuracy, teacher accuracy and student cross-entropy
fn evaluate(
    models: &ValidationModels<'_>,
    images: &Array4<f32>,
    labels: &Array2<f32>,
) -> Result<(f32, f32, f32)> {
    let input = flatten_images(images);
    let logits = models.student.forward(&input)?.logits;
    let (loss, _) = softmax_cross_entropy(labels, &logits)?;
    let teacher_accuracy = match models.teacher {
        Some(teacher) => accuracy(&teacher.forward(&input)?.logits, labels)?,
        None => 0.0,
    };
    Ok((accuracy(&logits, labels)?, teacher_accuracy, loss))
}

fn mean_abs_diff(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    (a - b).mapv(f32::abs).mean().unwrap_or(0.0)
}
