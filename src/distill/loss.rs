//! Temperature-scaled distillation losses

use super::ops::{log_softmax_rows, softmax_jvp, softmax_rows, tile_factor, tile_rows};
use crate::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Numeric form of the distillation term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistillLossKind {
    /// Cross-entropy between the soft teacher distribution and `student / T`
    #[default]
    #[serde(rename = "ce", alias = "softmax_cross_entropy")]
    SoftmaxCrossEntropy,

    /// Squared distance between the soft teacher distribution and `softmax(student / T)`
    Gaussian,

    /// Mean squared error between `teacher / T` and `student / T`
    Mse,
}

impl DistillLossKind {
    pub fn name(&self) -> &'static str {
        match self {
            DistillLossKind::SoftmaxCrossEntropy => "ce",
            DistillLossKind::Gaussian => "gaussian",
            DistillLossKind::Mse => "mse",
        }
    }
}

impl std::str::FromStr for DistillLossKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ce" | "softmax_cross_entropy" => Ok(DistillLossKind::SoftmaxCrossEntropy),
            "gaussian" => Ok(DistillLossKind::Gaussian),
            "mse" => Ok(DistillLossKind::Mse),
            other => Err(Error::ConfigError(format!(
                "Unsupported distillation loss type: {other} (must be one of: ce, gaussian, mse)"
            ))),
        }
    }
}

/// Distillation loss value with its gradient with respect to the student logits
#[derive(Debug, Clone)]
pub struct DistillOutput {
    pub value: f32,
    pub grad: Array2<f32>,
}

/// Knowledge distillation term
///
/// The teacher distribution is computed once per teacher row and broadcast to
/// every student row that shares the same label, so the teacher may run on a
/// single clean copy while the student sees several variants.
///
/// # Example
///
/// ```
/// use destilar::distill::{DistillLoss, DistillLossKind};
/// use ndarray::array;
///
/// let loss_fn = DistillLoss::new(2.0, DistillLossKind::SoftmaxCrossEntropy).unwrap();
/// let teacher = array![[1.5, 1.2, 0.8]];
/// // two student variants for the same example
/// let student = array![[2.0, 1.0, 0.5], [0.1, 0.2, 0.3]];
///
/// let out = loss_fn.forward(&student, &teacher).unwrap();
/// assert!(out.value > 0.0);
/// assert_eq!(out.grad.dim(), (2, 3));
/// ```
#[derive(Debug, Clone)]
pub struct DistillLoss {
    temperature: f32,
    kind: DistillLossKind,
}

impl DistillLoss {
    /// Create a distillation loss; the temperature must be positive
    pub fn new(temperature: f32, kind: DistillLossKind) -> Result<Self> {
        if !(temperature > 0.0) {
            return Err(Error::ConfigError(format!(
                "Temperature must be positive, got {temperature}"
            )));
        }
        Ok(Self { temperature, kind })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn kind(&self) -> DistillLossKind {
        self.kind
    }

    /// Soft teacher distribution `softmax(teacher / T)`
    pub fn soft_targets(&self, teacher_logits: &Array2<f32>) -> Array2<f32> {
        softmax_rows(&(teacher_logits / self.temperature))
    }

    /// Compute the term for `student_logits` (`k * teacher_rows` rows)
    pub fn forward(
        &self,
        student_logits: &Array2<f32>,
        teacher_logits: &Array2<f32>,
    ) -> Result<DistillOutput> {
        if student_logits.ncols() != teacher_logits.ncols() {
            return Err(Error::ShapeMismatch {
                expected: vec![student_logits.nrows(), teacher_logits.ncols()],
                got: student_logits.shape().to_vec(),
            });
        }
        let factor = tile_factor(student_logits.nrows(), teacher_logits.nrows())?;
        let t = self.temperature;
        let rows = student_logits.nrows() as f32;
        let scaled_student = student_logits / t;

        match self.kind {
            DistillLossKind::SoftmaxCrossEntropy => {
                let soft = tile_rows(&self.soft_targets(teacher_logits), factor);
                let log_probs = log_softmax_rows(&scaled_student);
                let value = -(&soft * &log_probs).sum() / rows;
                let grad = (log_probs.mapv(f32::exp) - &soft) / (rows * t);
                Ok(DistillOutput { value, grad })
            }
            DistillLossKind::Gaussian => {
                let soft = tile_rows(&self.soft_targets(teacher_logits), factor);
                let probs = softmax_rows(&scaled_student);
                let diff = &probs - &soft;
                let value = diff.mapv(|d| d * d).sum() / rows;
                let grad = softmax_jvp(&probs, &diff) * (2.0 / (rows * t));
                Ok(DistillOutput { value, grad })
            }
            DistillLossKind::Mse => {
                let scaled_teacher = tile_rows(&(teacher_logits / t), factor);
                let diff = &scaled_student - &scaled_teacher;
                let count = diff.len().max(1) as f32;
                let value = diff.mapv(|d| d * d).sum() / count;
                let grad = diff * (2.0 / (count * t));
                Ok(DistillOutput { value, grad })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distill::ops::entropy_rows;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn numeric_grad(loss: &DistillLoss, student: &Array2<f32>, teacher: &Array2<f32>) -> Array2<f32> {
        let eps = 1e-3;
        Array2::from_shape_fn(student.dim(), |(r, c)| {
            let mut plus = student.clone();
            plus[[r, c]] += eps;
            let mut minus = student.clone();
            minus[[r, c]] -= eps;
            (loss.forward(&plus, teacher).unwrap().value - loss.forward(&minus, teacher).unwrap().value)
                / (2.0 * eps)
        })
    }

    #[test]
    fn test_rejects_non_positive_temperature() {
        assert!(DistillLoss::new(0.0, DistillLossKind::Mse).is_err());
        assert!(DistillLoss::new(-1.0, DistillLossKind::Mse).is_err());
        assert!(DistillLoss::new(f32::NAN, DistillLossKind::Mse).is_err());
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("ce".parse::<DistillLossKind>().unwrap(), DistillLossKind::SoftmaxCrossEntropy);
        assert_eq!("Gaussian".parse::<DistillLossKind>().unwrap(), DistillLossKind::Gaussian);
        assert!("kl".parse::<DistillLossKind>().is_err());
    }

    #[test]
    fn test_gradients_match_finite_difference() {
        let teacher = array![[1.0, -0.5, 0.3], [0.2, 0.9, -1.0]];
        let student = array![[0.3, 0.1, -0.2], [1.0, 0.0, 0.5], [0.0, 0.4, 0.1], [-0.3, 0.2, 0.6]];
        for kind in [DistillLossKind::SoftmaxCrossEntropy, DistillLossKind::Gaussian, DistillLossKind::Mse] {
            let loss = DistillLoss::new(2.0, kind).unwrap();
            let analytic = loss.forward(&student, &teacher).unwrap().grad;
            let numeric = numeric_grad(&loss, &student, &teacher);
            for (a, n) in analytic.iter().zip(numeric.iter()) {
                assert_relative_eq!(a, n, epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_broadcast_requires_integral_factor() {
        let loss = DistillLoss::new(1.0, DistillLossKind::SoftmaxCrossEntropy).unwrap();
        let teacher = array![[1.0, 0.0], [0.0, 1.0]];
        let student = array![[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]];
        assert!(loss.forward(&student, &teacher).is_err());
    }

    #[test]
    fn test_broadcast_equals_explicit_tiling() {
        let loss = DistillLoss::new(1.5, DistillLossKind::Gaussian).unwrap();
        let teacher = array![[2.0, 0.0, 1.0]];
        let student = array![[0.5, 0.5, 0.0], [0.1, 0.2, 0.3]];
        let broadcast = loss.forward(&student, &teacher).unwrap().value;
        let tiled = loss.forward(&student, &tile_rows(&teacher, 2)).unwrap().value;
        assert_relative_eq!(broadcast, tiled, epsilon = 1e-6);
    }

    #[test]
    fn test_mse_zero_for_identical_logits() {
        let loss = DistillLoss::new(3.0, DistillLossKind::Mse).unwrap();
        let logits = array![[1.0, 2.0, 3.0]];
        assert_relative_eq!(loss.forward(&logits, &logits).unwrap().value, 0.0);
    }

    #[test]
    fn test_higher_temperature_increases_teacher_entropy() {
        let teacher = array![[3.0, 1.0, 0.2]];
        let low = DistillLoss::new(1.0, DistillLossKind::SoftmaxCrossEntropy).unwrap();
        let high = DistillLoss::new(4.0, DistillLossKind::SoftmaxCrossEntropy).unwrap();
        let h_low = entropy_rows(&low.soft_targets(&teacher))[0];
        let h_high = entropy_rows(&high.soft_targets(&teacher))[0];
        assert!(h_high > h_low, "entropy {h_high} should exceed {h_low}");
    }
}
