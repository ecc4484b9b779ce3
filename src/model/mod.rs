//! Model collaborators
//!
//! The network architecture itself lives outside the training core. The core
//! talks to models only through the [`Model`] trait: a forward pass over a
//! flattened batch, a backward pass that accumulates parameter gradients and
//! returns the input gradient, and an optional second-order hook used by the
//! input-gradient regularizers.
//!
//! [`LinearClassifier`] is a small reference implementation with exact
//! gradients, used by the CLI and the test-suite.

mod linear;
mod param;

pub use linear::LinearClassifier;
pub use param::Param;

use crate::{Error, Result};
use ndarray::Array2;

/// Output of a named auxiliary head
#[derive(Clone, Debug)]
pub struct HeadOutput {
    /// Stable head name, fixed at model construction
    pub name: String,
    /// Head logits `[rows, classes]`
    pub logits: Array2<f32>,
}

/// Forward pass result
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// Primary logits `[rows, classes]`
    pub logits: Array2<f32>,
    /// Auxiliary heads, in the order reported by [`Model::head_names`]
    pub heads: Vec<HeadOutput>,
}

impl ModelOutput {
    /// Output without auxiliary heads
    pub fn primary(logits: Array2<f32>) -> Self {
        Self {
            logits,
            heads: Vec::new(),
        }
    }

    pub fn head(&self, name: &str) -> Option<&Array2<f32>> {
        self.heads.iter().find(|h| h.name == name).map(|h| &h.logits)
    }
}

/// Upstream gradients for every model output
///
/// `heads[i]` pairs with `ModelOutput::heads[i]`.
#[derive(Clone, Debug)]
pub struct OutputGrads {
    pub logits: Array2<f32>,
    pub heads: Vec<Array2<f32>>,
}

impl OutputGrads {
    /// Zero gradients shaped like `output`
    pub fn zeros_like(output: &ModelOutput) -> Self {
        Self {
            logits: Array2::zeros(output.logits.dim()),
            heads: output
                .heads
                .iter()
                .map(|h| Array2::zeros(h.logits.dim()))
                .collect(),
        }
    }

    /// `self += scale * other`
    pub fn add_scaled(&mut self, other: &OutputGrads, scale: f32) -> Result<()> {
        if self.heads.len() != other.heads.len() || self.logits.dim() != other.logits.dim() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.heads.len(), self.logits.nrows(), self.logits.ncols()],
                got: vec![other.heads.len(), other.logits.nrows(), other.logits.ncols()],
            });
        }
        self.logits.scaled_add(scale, &other.logits);
        for (mine, theirs) in self.heads.iter_mut().zip(&other.heads) {
            mine.scaled_add(scale, theirs);
        }
        Ok(())
    }
}

/// Parameter store and forward/backward provider for one network
pub trait Model {
    /// Variable namescope; every parameter name starts with `"{namescope}/"`
    fn namescope(&self) -> &str;

    /// Names of auxiliary heads exposed for multi-head losses and attack targeting
    fn head_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Forward pass over a flattened batch `[rows, features]`
    fn forward(&self, input: &Array2<f32>) -> Result<ModelOutput>;

    /// Accumulate parameter gradients for the given output gradients and
    /// return the gradient with respect to the input
    fn backward(&mut self, input: &Array2<f32>, grads: &OutputGrads) -> Result<Array2<f32>>;

    /// Gradient with respect to the input only, without touching parameter gradients
    fn input_gradient(&self, input: &Array2<f32>, grads: &OutputGrads) -> Result<Array2<f32>>;

    /// Second-order hook for penalties on the input gradient.
    ///
    /// Given `cotangent = dR/d(input_gradient)`, accumulate the part of
    /// `dR/dparams` that flows through the parameters with `grads` held fixed,
    /// and return `dR/dgrads` so the caller can chain through the loss.
    fn backward_input_gradient(
        &mut self,
        _input: &Array2<f32>,
        _grads: &OutputGrads,
        _cotangent: &Array2<f32>,
    ) -> Result<OutputGrads> {
        Err(Error::Unsupported(format!(
            "model '{}' does not provide second-order input gradients",
            self.namescope()
        )))
    }

    fn params(&self) -> &[Param];

    fn params_mut(&mut self) -> &mut [Param];

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Auxiliary running-statistics update (e.g. normalization moving averages)
    fn update_running_stats(&mut self, _input: &Array2<f32>) {}

    /// External regularization contribution (e.g. weight decay).
    ///
    /// When `accumulate_grad` is set the penalty's gradient is added to the
    /// parameter gradients.
    fn regularization(&mut self, _accumulate_grad: bool) -> f32 {
        0.0
    }

    /// Secondary scheduled scalar (e.g. an activation threshold)
    fn set_threshold(&mut self, _threshold: f32) {}

    /// Zero every parameter gradient
    fn zero_grad(&mut self) {
        for param in self.params_mut() {
            param.zero_grad();
        }
    }
}
