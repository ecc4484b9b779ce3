//! Build training components from configuration

use super::schema::{NetworkSpec, OptimSpec, OptimizerKind};
use super::validate::DistillConfig;
use crate::error::Result;
use crate::model::LinearClassifier;
use crate::optim::{Adam, AdamW, Optimizer, SGD};
use crate::train::DistillTrainer;

/// Build optimizer from configuration
pub fn build_optimizer(spec: &OptimSpec) -> Box<dyn Optimizer> {
    match spec.kind {
        OptimizerKind::Sgd { momentum } => Box::new(SGD::new(spec.lr, momentum)),
        OptimizerKind::Adam { beta1, beta2, eps } => {
            Box::new(Adam::new(spec.lr, beta1, beta2, eps))
        }
        OptimizerKind::AdamW {
            beta1,
            beta2,
            eps,
            weight_decay,
        } => Box::new(AdamW::new(spec.lr, beta1, beta2, eps, weight_decay)),
    }
}

/// Build one classifier for `features` inputs and `classes` outputs
pub fn build_network(spec: &NetworkSpec, features: usize, classes: usize) -> LinearClassifier {
    let mut network = LinearClassifier::with_heads(&spec.namescope, features, classes, &spec.heads)
        .with_weight_decay(spec.weight_decay);
    if spec.init_scale > 0.0 {
        network = network.with_seed(spec.seed, spec.init_scale);
    }
    network
}

/// Build a trainer with every network the configuration names
///
/// The teacher is built whenever it is needed for distillation or a teacher
/// checkpoint is given; checkpoints are restored later by
/// [`DistillTrainer::start`].
pub fn build_trainer(
    config: DistillConfig,
    features: usize,
    classes: usize,
) -> Result<DistillTrainer> {
    let spec = config.spec();
    let student = build_network(&spec.model.student, features, classes);
    let optimizer = build_optimizer(&spec.optimizer);
    let teacher = (config.needs_teacher() || spec.checkpoints.teacher.path.is_some())
        .then(|| build_network(&spec.model.teacher, features, classes));
    let additional: Vec<LinearClassifier> = spec
        .model
        .additional
        .iter()
        .map(|network| build_network(network, features, classes))
        .collect();

    let mut trainer = DistillTrainer::new(config, Box::new(student), optimizer)?;
    if let Some(teacher) = teacher {
        trainer = trainer.with_teacher(Box::new(teacher));
    }
    for network in additional {
        trainer = trainer.with_additional(Box::new(network));
    }
    Ok(trainer)
}
