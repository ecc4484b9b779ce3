//! Composition of the training objective from independently toggled terms

use super::regularizer::Regularizers;
use super::variants::Variant;
use crate::config::{LossSpec, MultiHeadSpec};
use crate::distill::ops::{accuracy, softmax_cross_entropy, softmax_jvp, softmax_rows, tile_to};
use crate::distill::DistillLoss;
use crate::model::{ModelOutput, OutputGrads};
use crate::{Error, Model, Result};
use ndarray::Array2;

/// Position of the student accuracy in every metric vector
pub const STUDENT_ACCURACY: usize = 0;
/// Position of the teacher accuracy in every metric vector
pub const TEACHER_ACCURACY: usize = 1;
/// Position of the task loss in every metric vector
pub const TASK_LOSS: usize = 2;

/// Scalar objective and metrics for one variant
#[derive(Clone, Debug, PartialEq)]
pub struct LossReport {
    pub loss: f32,
    /// Ordered like [`LossComposer::metric_names`]
    pub metrics: Vec<f32>,
}

/// Task term with what is needed to differentiate through its gradient
struct TaskTerm {
    value: f32,
    grads: OutputGrads,
    /// Softmax of every output, primary first
    probs: Vec<Array2<f32>>,
    /// `d grads_o / d (p_o - y)` for every output, primary first
    scales: Vec<f32>,
    /// Cross-entropy per configured head
    head_losses: Vec<f32>,
}

impl TaskTerm {
    /// Chain a cotangent on the task gradients back to the logits
    fn chain(&self, upstream: &OutputGrads) -> OutputGrads {
        let through = |i: usize, u: &Array2<f32>| softmax_jvp(&self.probs[i], u) * self.scales[i];
        OutputGrads {
            logits: through(0, &upstream.logits),
            heads: upstream
                .heads
                .iter()
                .enumerate()
                .map(|(i, u)| through(i + 1, u))
                .collect(),
        }
    }
}

/// Builds the scalar objective
///
/// ```text
/// loss = theta * task + alpha * distill + regularizers + model regularization
/// ```
///
/// The distillation term is skipped entirely when `alpha == 0`. The
/// attention-transfer weight is rejected at construction when non-zero.
#[derive(Clone, Debug)]
pub struct LossComposer {
    theta: f32,
    alpha: f32,
    distill: DistillLoss,
    multi_head: Option<MultiHeadSpec>,
    regularizers: Regularizers,
}

impl LossComposer {
    pub fn new(spec: &LossSpec) -> Result<Self> {
        if spec.beta != 0.0 {
            return Err(Error::Unsupported(format!(
                "attention transfer loss (beta = {})",
                spec.beta
            )));
        }
        Ok(Self {
            theta: spec.theta,
            alpha: spec.alpha,
            distill: DistillLoss::new(spec.temperature, spec.loss_type)?,
            multi_head: spec.multi_head.clone(),
            regularizers: Regularizers::new(spec.grad_smoothness.clone(), spec.grad_norm.clone()),
        })
    }

    /// Whether the distillation term is computed
    pub fn distilling(&self) -> bool {
        self.alpha != 0.0
    }

    /// Metric names; the first three positions are fixed
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = ["acc", "tea_acc", "task_loss", "loss", "distillation"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(multi_head) = &self.multi_head {
            names.extend(multi_head.heads.iter().map(|h| format!("{}_loss", h.name)));
        }
        names.extend(self.regularizers.metric_names());
        names
    }

    /// Evaluate the objective on one variant and accumulate its parameter
    /// gradients into `student`
    ///
    /// `teacher_logits` may have fewer rows than the variant; the soft
    /// distribution is broadcast by the integral row ratio.
    pub fn compose(
        &self,
        student: &mut dyn Model,
        variant: &Variant,
        teacher_logits: Option<&Array2<f32>>,
    ) -> Result<LossReport> {
        let labels = &variant.labels;
        let output = student.forward(&variant.input)?;
        let task = self.task_term(&output, labels)?;

        let mut loss = self.theta * task.value;
        let mut grads = OutputGrads::zeros_like(&output);
        grads.add_scaled(&task.grads, self.theta)?;

        let mut distillation = 0.0;
        if self.distilling() {
            let teacher = teacher_logits.ok_or_else(|| {
                Error::ConfigError(
                    "distillation weight is non-zero but no teacher logits were supplied"
                        .to_string(),
                )
            })?;
            let term = self.distill.forward(&output.logits, teacher)?;
            loss += self.alpha * term.value;
            grads.logits.scaled_add(self.alpha, &term.grad);
            distillation = term.value;
        }

        let mut regularizer_metrics = Vec::new();
        if !self.regularizers.is_empty() {
            let input_grad = student.input_gradient(&variant.input, &task.grads)?;
            let terms = self
                .regularizers
                .evaluate(&input_grad, variant.image_dims(), loss)?;
            loss += terms.total;
            let upstream =
                student.backward_input_gradient(&variant.input, &task.grads, &terms.cotangent)?;
            grads.add_scaled(&task.chain(&upstream), 1.0)?;
            regularizer_metrics.extend(terms.smoothness);
            regularizer_metrics.extend(terms.grad_norm);
        }

        student.backward(&variant.input, &grads)?;
        loss += student.regularization(true);

        let teacher_accuracy = match teacher_logits {
            Some(teacher) => accuracy(&tile_to(teacher, labels.nrows())?, labels)?,
            None => 0.0,
        };
        let mut metrics = vec![
            accuracy(&output.logits, labels)?,
            teacher_accuracy,
            task.value,
            loss,
            distillation,
        ];
        metrics.extend(task.head_losses);
        metrics.extend(regularizer_metrics);

        Ok(LossReport { loss, metrics })
    }

    fn task_term(&self, output: &ModelOutput, labels: &Array2<f32>) -> Result<TaskTerm> {
        let rows = output.logits.nrows().max(1) as f32;
        let Some(multi_head) = &self.multi_head else {
            let (value, grad) = softmax_cross_entropy(labels, &output.logits)?;
            let mut grads = OutputGrads::zeros_like(output);
            grads.logits = grad;
            return Ok(TaskTerm {
                value,
                grads,
                probs: self.probs(output),
                scales: std::iter::once(1.0 / rows)
                    .chain(output.heads.iter().map(|_| 0.0))
                    .collect(),
                head_losses: Vec::new(),
            });
        };

        let total_weight = multi_head.primary_weight
            + multi_head.heads.iter().map(|h| h.weight).sum::<f32>();
        let mut grads = OutputGrads::zeros_like(output);
        let mut scales = vec![0.0; 1 + output.heads.len()];

        let (primary, grad) = softmax_cross_entropy(labels, &output.logits)?;
        let weight = multi_head.primary_weight / total_weight;
        grads.logits = grad * weight;
        scales[0] = weight / rows;
        let mut value = weight * primary;

        let mut head_losses = Vec::with_capacity(multi_head.heads.len());
        for head in &multi_head.heads {
            let index = output
                .heads
                .iter()
                .position(|h| h.name == head.name)
                .ok_or_else(|| {
                    Error::ConfigError(format!("model has no output head named '{}'", head.name))
                })?;
            let (head_loss, grad) = softmax_cross_entropy(labels, &output.heads[index].logits)?;
            let weight = head.weight / total_weight;
            grads.heads[index].scaled_add(weight, &grad);
            scales[index + 1] += weight / rows;
            value += weight * head_loss;
            head_losses.push(head_loss);
        }

        Ok(TaskTerm {
            value,
            grads,
            probs: self.probs(output),
            scales,
            head_losses,
        })
    }

    fn probs(&self, output: &ModelOutput) -> Vec<Array2<f32>> {
        std::iter::once(&output.logits)
            .chain(output.heads.iter().map(|h| &h.logits))
            .map(softmax_rows)
            .collect()
    }
}
