//! Optimizer trait

use crate::Param;

/// Trait for optimization algorithms
///
/// Optimizer state is keyed by parameter position, so an optimizer must always
/// be stepped with the same parameter slice. Parameters marked non-trainable
/// and parameters without a gradient are skipped.
pub trait Optimizer {
    /// Perform a single optimization step
    fn step(&mut self, params: &mut [Param]);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [Param]) {
        for param in params {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Grow per-parameter state to cover `len` parameters
pub(crate) fn ensure_slots<T>(slots: &mut Vec<Option<T>>, len: usize) {
    if slots.len() < len {
        slots.resize_with(len, || None);
    }
}
