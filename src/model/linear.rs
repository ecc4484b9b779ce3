//! Reference softmax-regression classifier with exact first and second-order gradients

use super::{HeadOutput, Model, ModelOutput, OutputGrads, Param};
use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MOVING_AVERAGE_DECAY: f32 = 0.99;

/// Linear classifier `logits = (x - moving_mean) W^T + b` with optional auxiliary heads
///
/// Parameter layout (all names prefixed by the namescope):
///
/// ```text
/// {scope}/dense/weight          [classes, features]
/// {scope}/dense/bias            [classes]
/// {scope}/{head}/weight         [classes, features]   (one pair per head)
/// {scope}/{head}/bias           [classes]
/// {scope}/input_norm/moving_mean [features]           (frozen, running statistic)
/// ```
///
/// The moving mean is updated once per training variant through
/// [`Model::update_running_stats`] and is treated as a constant by the
/// gradient computations.
#[derive(Clone, Debug)]
pub struct LinearClassifier {
    namescope: String,
    features: usize,
    classes: usize,
    heads: Vec<String>,
    params: Vec<Param>,
    training: bool,
    weight_decay: f32,
}

impl LinearClassifier {
    /// Zero-initialised classifier without auxiliary heads
    pub fn new(namescope: impl Into<String>, features: usize, classes: usize) -> Self {
        Self::with_heads(namescope, features, classes, &[])
    }

    /// Zero-initialised classifier with the given auxiliary heads
    pub fn with_heads(
        namescope: impl Into<String>,
        features: usize,
        classes: usize,
        heads: &[String],
    ) -> Self {
        let namescope = namescope.into();
        let mut params = vec![
            Param::zeros(format!("{namescope}/dense/weight"), vec![classes, features]),
            Param::zeros(format!("{namescope}/dense/bias"), vec![classes]),
        ];
        for head in heads {
            params.push(Param::zeros(
                format!("{namescope}/{head}/weight"),
                vec![classes, features],
            ));
            params.push(Param::zeros(format!("{namescope}/{head}/bias"), vec![classes]));
        }
        params.push(
            Param::zeros(format!("{namescope}/input_norm/moving_mean"), vec![features]).frozen(),
        );

        Self {
            namescope,
            features,
            classes,
            heads: heads.to_vec(),
            params,
            training: true,
            weight_decay: 0.0,
        }
    }

    /// Re-initialise weights uniformly in `[-scale, scale]` from a fixed seed
    pub fn with_seed(mut self, seed: u64, scale: f32) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        for param in self.params.iter_mut().filter(|p| p.name().ends_with("/weight")) {
            param
                .data_mut()
                .mapv_inplace(|_| rng.random_range(-scale..=scale));
        }
        self
    }

    /// L2 weight decay applied to every weight matrix (biases excluded)
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    fn weight_index(output: usize) -> usize {
        2 * output
    }

    fn moving_mean(&self) -> &Array1<f32> {
        self.params[self.params.len() - 1].data()
    }

    fn centered(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.features {
            return Err(Error::ShapeMismatch {
                expected: vec![input.nrows(), self.features],
                got: input.shape().to_vec(),
            });
        }
        Ok(input - self.moving_mean())
    }

    fn check_grads(&self, input: &Array2<f32>, grads: &OutputGrads) -> Result<()> {
        let expected = (input.nrows(), self.classes);
        let shapes_ok = grads.logits.dim() == expected
            && grads.heads.len() == self.heads.len()
            && grads.heads.iter().all(|g| g.dim() == expected);
        if shapes_ok {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: vec![1 + self.heads.len(), expected.0, expected.1],
                got: vec![
                    1 + grads.heads.len(),
                    grads.logits.nrows(),
                    grads.logits.ncols(),
                ],
            })
        }
    }

    /// Output gradients in parameter order: primary first, then heads
    fn ordered<'a>(grads: &'a OutputGrads) -> impl Iterator<Item = (usize, &'a Array2<f32>)> {
        std::iter::once(&grads.logits)
            .chain(grads.heads.iter())
            .enumerate()
    }

    fn logits_for(&self, output: usize, centered: &Array2<f32>) -> Result<Array2<f32>> {
        let idx = Self::weight_index(output);
        let weight = self.params[idx].as_matrix()?;
        let bias = self.params[idx + 1].data();
        Ok(centered.dot(&weight.t()) + bias)
    }
}

impl Model for LinearClassifier {
    fn namescope(&self) -> &str {
        &self.namescope
    }

    fn head_names(&self) -> Vec<String> {
        self.heads.clone()
    }

    fn forward(&self, input: &Array2<f32>) -> Result<ModelOutput> {
        let centered = self.centered(input)?;
        let logits = self.logits_for(0, &centered)?;
        let heads = self
            .heads
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Ok(HeadOutput {
                    name: name.clone(),
                    logits: self.logits_for(i + 1, &centered)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ModelOutput { logits, heads })
    }

    fn backward(&mut self, input: &Array2<f32>, grads: &OutputGrads) -> Result<Array2<f32>> {
        self.check_grads(input, grads)?;
        let centered = self.centered(input)?;
        let mut input_grad = Array2::zeros(input.dim());

        for (output, grad) in Self::ordered(grads) {
            let idx = Self::weight_index(output);
            input_grad += &grad.dot(&self.params[idx].as_matrix()?);
            let weight_grad = grad.t().dot(&centered);
            self.params[idx].accumulate_matrix_grad(&weight_grad)?;
            let bias_grad = grad.sum_axis(Axis(0));
            self.params[idx + 1].accumulate_grad(&bias_grad);
        }

        Ok(input_grad)
    }

    fn input_gradient(&self, input: &Array2<f32>, grads: &OutputGrads) -> Result<Array2<f32>> {
        self.check_grads(input, grads)?;
        let mut input_grad = Array2::zeros(input.dim());
        for (output, grad) in Self::ordered(grads) {
            input_grad += &grad.dot(&self.params[Self::weight_index(output)].as_matrix()?);
        }
        Ok(input_grad)
    }

    fn backward_input_gradient(
        &mut self,
        input: &Array2<f32>,
        grads: &OutputGrads,
        cotangent: &Array2<f32>,
    ) -> Result<OutputGrads> {
        self.check_grads(input, grads)?;
        if cotangent.dim() != input.dim() {
            return Err(Error::ShapeMismatch {
                expected: input.shape().to_vec(),
                got: cotangent.shape().to_vec(),
            });
        }

        // input_gradient = sum_o G_o W_o, so d/dW_o = G_o^T H and d/dG_o = H W_o^T
        let mut upstream = Vec::with_capacity(1 + self.heads.len());
        for (output, grad) in Self::ordered(grads) {
            let idx = Self::weight_index(output);
            let grad_cotangent = cotangent.dot(&self.params[idx].as_matrix()?.t());
            self.params[idx].accumulate_matrix_grad(&grad.t().dot(cotangent))?;
            upstream.push(grad_cotangent);
        }

        let logits = upstream.remove(0);
        Ok(OutputGrads {
            logits,
            heads: upstream,
        })
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Param] {
        &mut self.params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn update_running_stats(&mut self, input: &Array2<f32>) {
        if !self.training || input.nrows() == 0 || input.ncols() != self.features {
            return;
        }
        if let Some(batch_mean) = input.mean_axis(Axis(0)) {
            let last = self.params.len() - 1;
            let mean = self.params[last].data_mut();
            *mean *= MOVING_AVERAGE_DECAY;
            mean.scaled_add(1.0 - MOVING_AVERAGE_DECAY, &batch_mean);
        }
    }

    fn regularization(&mut self, accumulate_grad: bool) -> f32 {
        if self.weight_decay == 0.0 {
            return 0.0;
        }
        let decay = self.weight_decay;
        let mut penalty = 0.0;
        for param in self.params.iter_mut().filter(|p| p.name().ends_with("/weight")) {
            penalty += 0.5 * decay * param.data().mapv(|w| w * w).sum();
            if accumulate_grad {
                let grad = param.data() * decay;
                param.accumulate_grad(&grad);
            }
        }
        penalty
    }
}
