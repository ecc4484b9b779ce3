//! Application of variant gradients to the live parameters

use super::loss::LossReport;
use super::variants::{Variant, VariantSet};
use crate::config::AccumulationMode;
use crate::optim::Optimizer;
use crate::{Error, Model, Result};

/// Applies one outer batch worth of variant gradients
///
/// The optimizer always runs at `base_lr / variants`, so the total parameter
/// displacement per outer batch does not depend on how many variants the
/// attack generator produced. Running statistics update once per variant in
/// both modes.
#[derive(Clone, Debug)]
pub struct GradientAccumulator {
    mode: AccumulationMode,
    updates: usize,
    resets: usize,
}

impl GradientAccumulator {
    pub fn new(mode: AccumulationMode) -> Self {
        Self {
            mode,
            updates: 0,
            resets: 0,
        }
    }

    pub fn mode(&self) -> AccumulationMode {
        self.mode
    }

    /// Optimizer updates applied so far
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Gradient buffer resets so far
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Run `compute` on every variant and apply the resulting gradients
    ///
    /// `compute` must add its gradients to the model's parameter gradients.
    pub fn apply<F>(
        &mut self,
        model: &mut dyn Model,
        optimizer: &mut dyn Optimizer,
        base_lr: f32,
        variants: &VariantSet,
        mut compute: F,
    ) -> Result<Vec<LossReport>>
    where
        F: FnMut(&mut dyn Model, &Variant) -> Result<LossReport>,
    {
        if variants.is_empty() {
            return Err(Error::InvalidParameter(
                "cannot apply an empty variant set".to_string(),
            ));
        }
        optimizer.set_lr(base_lr / variants.len() as f32);

        let mut reports = Vec::with_capacity(variants.len());
        match self.mode {
            AccumulationMode::Direct => {
                for variant in variants {
                    self.reset(model);
                    reports.push(compute(model, variant)?);
                    model.update_running_stats(&variant.input);
                    self.step(model, optimizer);
                }
            }
            AccumulationMode::Accumulate => {
                self.reset(model);
                for variant in variants {
                    reports.push(compute(model, variant)?);
                    model.update_running_stats(&variant.input);
                }
                self.step(model, optimizer);
            }
        }
        Ok(reports)
    }

    fn reset(&mut self, model: &mut dyn Model) {
        model.zero_grad();
        self.resets += 1;
    }

    fn step(&mut self, model: &mut dyn Model, optimizer: &mut dyn Optimizer) {
        optimizer.step(model.params_mut());
        self.updates += 1;
    }
}
