//! Adam optimizer

use super::optimizer::ensure_slots;
use super::Optimizer;
use crate::Param;
use ndarray::Array1;

/// Adam optimizer (Adaptive Moment Estimation)
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u64,
    m: Vec<Option<Array1<f32>>>, // First moment
    v: Vec<Option<Array1<f32>>>, // Second moment
}

impl Adam {
    /// Create a new Adam optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Create Adam with default parameters
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8)
    }
}

/// One bias-corrected Adam moment update; returns the step to subtract
pub(crate) fn adam_moments(
    grad: &Array1<f32>,
    m: &mut Option<Array1<f32>>,
    v: &mut Option<Array1<f32>>,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    lr_t: f32,
) -> Array1<f32> {
    // m_t = β1 * m_{t-1} + (1 - β1) * g
    let m_t = match m.as_ref() {
        Some(m) => m * beta1 + grad * (1.0 - beta1),
        None => grad * (1.0 - beta1),
    };
    // v_t = β2 * v_{t-1} + (1 - β2) * g²
    let grad_sq = grad * grad;
    let v_t = match v.as_ref() {
        Some(v) => v * beta2 + &grad_sq * (1.0 - beta2),
        None => &grad_sq * (1.0 - beta2),
    };
    let update = &m_t / &(v_t.mapv(f32::sqrt) + epsilon) * lr_t;
    *m = Some(m_t);
    *v = Some(v_t);
    update
}

/// Bias-corrected step size for step `t`
pub(crate) fn corrected_lr(lr: f32, beta1: f32, beta2: f32, t: u64) -> f32 {
    let t = t.min(i32::MAX as u64) as i32;
    lr * ((1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t)))
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [Param]) {
        ensure_slots(&mut self.m, params.len());
        ensure_slots(&mut self.v, params.len());
        self.t += 1;
        let lr_t = corrected_lr(self.lr, self.beta1, self.beta2, self.t);

        for (i, param) in params.iter_mut().enumerate() {
            if !param.trainable() {
                continue;
            }
            let Some(grad) = param.grad().cloned() else {
                continue;
            };
            let update = adam_moments(
                &grad,
                &mut self.m[i],
                &mut self.v[i],
                self.beta1,
                self.beta2,
                self.epsilon,
                lr_t,
            );
            *param.data_mut() -= &update;
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &'static str {
        "adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adam_quadratic_convergence() {
        // f(x) = x²
        let mut params = vec![Param::new("m/x", vec![3], vec![5.0, -3.0, 2.0]).unwrap()];
        let mut optimizer = Adam::default_params(0.1);

        for _ in 0..100 {
            let grad = params[0].data().mapv(|x| 2.0 * x);
            params[0].set_grad(grad);
            optimizer.step(&mut params);
        }

        for &val in params[0].data().iter() {
            assert!(val.abs() < 0.5, "Value {} did not converge", val);
        }
    }

    #[test]
    fn test_first_step_magnitude_is_lr() {
        let mut params = vec![Param::new("m/x", vec![1], vec![1.0]).unwrap()];
        params[0].set_grad(ndarray::array![4.0]);
        let mut optimizer = Adam::default_params(0.01);
        optimizer.step(&mut params);
        assert!((params[0].data()[0] - 0.99).abs() < 1e-4);
    }
}
