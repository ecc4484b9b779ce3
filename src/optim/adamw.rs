//! AdamW optimizer (Adam with decoupled Weight decay)

use super::adam::{adam_moments, corrected_lr};
use super::optimizer::ensure_slots;
use super::Optimizer;
use crate::Param;
use ndarray::Array1;

/// AdamW optimizer
///
/// AdamW: θ_t = (1 - lr * λ) * θ_{t-1} - lr_t * m_t / (√v_t + ε)
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    m: Vec<Option<Array1<f32>>>,
    v: Vec<Option<Array1<f32>>>,
}

impl AdamW {
    /// Create a new AdamW optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Create AdamW with default parameters (weight_decay = 0.01)
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [Param]) {
        ensure_slots(&mut self.m, params.len());
        ensure_slots(&mut self.v, params.len());
        self.t += 1;
        let lr_t = corrected_lr(self.lr, self.beta1, self.beta2, self.t);
        let decay = 1.0 - self.lr * self.weight_decay;

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
            let data = param.data_mut();
            *data *= decay;
            *data -= &update;
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &'static str {
        "adamw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::Adam;

    #[test]
    fn test_decay_shrinks_more_than_adam() {
        let start = vec![2.0, -2.0];
        let mut with_decay = vec![Param::new("m/x", vec![2], start.clone()).unwrap()];
        let mut without = vec![Param::new("m/x", vec![2], start).unwrap()];
        let mut adamw = AdamW::new(0.1, 0.9, 0.999, 1e-8, 0.5);
        let mut adam = Adam::default_params(0.1);

        for _ in 0..5 {
            with_decay[0].set_grad(ndarray::array![0.1, -0.1]);
            without[0].set_grad(ndarray::array![0.1, -0.1]);
            adamw.step(&mut with_decay);
            adam.step(&mut without);
        }
        assert!(with_decay[0].data()[0].abs() < without[0].data()[0].abs());
        assert!(with_decay[0].data()[1].abs() < without[0].data()[1].abs());
    }
}
