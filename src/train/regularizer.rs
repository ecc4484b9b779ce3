//! Penalties on the input gradient of the task loss
//!
//! Both penalties are functions of `g = d(task loss)/d(input)`. They return
//! their value together with `dR/dg`, which the loss composer hands to
//! [`Model::backward_input_gradient`](crate::Model::backward_input_gradient)
//! to reach the parameters.

use crate::config::{GradNormOrder, GradNormSpec, SmoothnessSpec};
use crate::{Error, Result};
use ndarray::{s, Array2, Array4};

/// Auto-scaling is skipped when the smoothness value is below this
const AUTO_SCALE_EPSILON: f32 = 1e-8;

/// Sum of squared vertical and horizontal finite differences per example
///
/// Returns the value and its gradient with respect to `grad`.
pub fn smoothness(grad: &Array4<f32>) -> (f32, Array4<f32>) {
    let examples = grad.dim().0.max(1) as f32;
    let mut cotangent = Array4::zeros(grad.dim());

    let vertical = &grad.slice(s![.., 1.., .., ..]) - &grad.slice(s![.., ..-1, .., ..]);
    let horizontal = &grad.slice(s![.., .., 1.., ..]) - &grad.slice(s![.., .., ..-1, ..]);
    let value = (vertical.mapv(|d| d * d).sum() + horizontal.mapv(|d| d * d).sum()) / examples;

    let vertical = vertical * (2.0 / examples);
    let horizontal = horizontal * (2.0 / examples);
    {
        let mut lower = cotangent.slice_mut(s![.., 1.., .., ..]);
        lower += &vertical;
    }
    {
        let mut upper = cotangent.slice_mut(s![.., ..-1, .., ..]);
        upper -= &vertical;
    }
    {
        let mut right = cotangent.slice_mut(s![.., .., 1.., ..]);
        right += &horizontal;
    }
    {
        let mut left = cotangent.slice_mut(s![.., .., ..-1, ..]);
        left -= &horizontal;
    }
    (value, cotangent)
}

/// L1 (`sum |g|`) or squared L2 (`sum g^2`) norm per example
pub fn grad_norm(grad: &Array2<f32>, order: GradNormOrder) -> (f32, Array2<f32>) {
    let examples = grad.nrows().max(1) as f32;
    match order {
        GradNormOrder::L1 => (
            grad.mapv(f32::abs).sum() / examples,
            grad.mapv(|g| sign(g) / examples),
        ),
        GradNormOrder::L2 => (
            grad.mapv(|g| g * g).sum() / examples,
            grad.mapv(|g| 2.0 * g / examples),
        ),
    }
}

fn sign(value: f32) -> f32 {
    if value == 0.0 {
        0.0
    } else {
        value.signum()
    }
}

/// Weighted regularizer contributions for one variant
#[derive(Clone, Debug)]
pub struct RegularizerTerms {
    /// Unweighted smoothness value, when enabled
    pub smoothness: Option<f32>,
    /// Unweighted gradient norm, when enabled
    pub grad_norm: Option<f32>,
    /// Weighted sum added to the objective
    pub total: f32,
    /// `dR/dg` of the weighted sum, flattened like the input
    pub cotangent: Array2<f32>,
}

/// Configured input-gradient regularizers
#[derive(Clone, Debug, Default)]
pub struct Regularizers {
    smoothness: Option<SmoothnessSpec>,
    grad_norm: Option<GradNormSpec>,
}

impl Regularizers {
    pub fn new(smoothness: Option<SmoothnessSpec>, grad_norm: Option<GradNormSpec>) -> Self {
        Self {
            smoothness,
            grad_norm,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.smoothness.is_none() && self.grad_norm.is_none()
    }

    /// Metric names contributed, in reporting order
    pub fn metric_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.smoothness.is_some() {
            names.push("grad_smoothness".to_string());
        }
        if self.grad_norm.is_some() {
            names.push("grad_norm".to_string());
        }
        names
    }

    /// Evaluate against the flattened input gradient of images shaped `(H, W, C)`
    ///
    /// `base_loss` is the objective before regularization; it drives the
    /// smoothness auto-scale.
    pub fn evaluate(
        &self,
        grad: &Array2<f32>,
        dims: (usize, usize, usize),
        base_loss: f32,
    ) -> Result<RegularizerTerms> {
        let mut terms = RegularizerTerms {
            smoothness: None,
            grad_norm: None,
            total: 0.0,
            cotangent: Array2::zeros(grad.dim()),
        };

        if let Some(spec) = &self.smoothness {
            let (h, w, c) = dims;
            let images = grad
                .to_owned()
                .into_shape_with_order((grad.nrows(), h, w, c))
                .map_err(|_| Error::ShapeMismatch {
                    expected: vec![grad.nrows(), h * w * c],
                    got: grad.shape().to_vec(),
                })?;
            let (value, cotangent) = smoothness(&images);
            let coef = if spec.auto_scale && value.abs() > AUTO_SCALE_EPSILON {
                spec.coef * base_loss / value
            } else {
                spec.coef
            };
            let cotangent = cotangent
                .into_shape_with_order(grad.dim())
                .map_err(|e| Error::InvalidParameter(e.to_string()))?;
            terms.cotangent.scaled_add(coef, &cotangent);
            terms.total += coef * value;
            terms.smoothness = Some(value);
        }

        if let Some(spec) = &self.grad_norm {
            let (value, cotangent) = grad_norm(grad, spec.order);
            terms.cotangent.scaled_add(spec.coef, &cotangent);
            terms.total += spec.coef * value;
            terms.grad_norm = Some(value);
        }

        Ok(terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_constant_gradient_is_smooth() {
        let grad = Array4::from_elem((2, 3, 3, 1), 0.7);
        let (value, cotangent) = smoothness(&grad);
        assert_eq!(value, 0.0);
        assert!(cotangent.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn test_smoothness_value() {
        // one example, 2x2, one channel: [[0, 1], [2, 3]]
        let grad = Array4::from_shape_vec((1, 2, 2, 1), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let (value, _) = smoothness(&grad);
        // vertical diffs 2, 2; horizontal diffs 1, 1
        assert_relative_eq!(value, 10.0);
    }

    #[test]
    fn test_smoothness_gradient_matches_finite_difference() {
        let data: Vec<f32> = (0..18).map(|i| ((i * 7) % 5) as f32 * 0.3 - 0.4).collect();
        let grad = Array4::from_shape_vec((2, 3, 3, 1), data).unwrap();
        let (_, cotangent) = smoothness(&grad);

        let eps = 1e-2;
        for idx in [(0, 0, 0, 0), (0, 1, 1, 0), (1, 2, 0, 0), (1, 1, 2, 0)] {
            let mut plus = grad.clone();
            plus[idx] += eps;
            let mut minus = grad.clone();
            minus[idx] -= eps;
            let numeric = (smoothness(&plus).0 - smoothness(&minus).0) / (2.0 * eps);
            assert_relative_eq!(cotangent[idx], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_grad_norm_orders() {
        let grad = array![[1.0, -2.0], [0.0, 3.0]];
        let (l1, d1) = grad_norm(&grad, GradNormOrder::L1);
        assert_relative_eq!(l1, 3.0);
        assert_eq!(d1, array![[0.5, -0.5], [0.0, 0.5]]);

        let (l2, d2) = grad_norm(&grad, GradNormOrder::L2);
        assert_relative_eq!(l2, 7.0);
        assert_eq!(d2, array![[1.0, -2.0], [0.0, 3.0]]);
    }

    #[test]
    fn test_auto_scale_matches_base_loss() {
        let regs = Regularizers::new(
            Some(SmoothnessSpec {
                coef: 0.5,
                auto_scale: true,
            }),
            None,
        );
        let grad = array![[0.0, 1.0, 2.0, 3.0]];
        let terms = regs.evaluate(&grad, (2, 2, 1), 4.0).unwrap();
        assert_relative_eq!(terms.smoothness.unwrap(), 10.0);
        assert_relative_eq!(terms.total, 0.5 * 4.0);
    }

    #[test]
    fn test_auto_scale_guarded_near_zero() {
        let regs = Regularizers::new(
            Some(SmoothnessSpec {
                coef: 0.5,
                auto_scale: true,
            }),
            None,
        );
        let grad = Array2::from_elem((1, 4), 1.0);
        let terms = regs.evaluate(&grad, (2, 2, 1), 4.0).unwrap();
        assert_eq!(terms.total, 0.0);
        assert!(terms.total.is_finite());
    }

    #[test]
    fn test_empty_regularizers() {
        let regs = Regularizers::default();
        assert!(regs.is_empty());
        assert!(regs.metric_names().is_empty());
    }
}
