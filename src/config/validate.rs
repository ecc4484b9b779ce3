//! Configuration validation

use super::schema::{DistillSpec, LossSpec, ScheduleSpec, TrainingSpec};
use crate::error::{Error, Result};
use std::collections::HashSet;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Dataset path does not exist: {0}")]
    DataNotFound(String),

    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f32),

    #[error("Invalid batch size: {0} (must be > 0)")]
    InvalidBatchSize(usize),

    #[error("Invalid epochs: {0} (must be > 0)")]
    InvalidEpochs(usize),

    #[error("Invalid {0} interval: must be > 0")]
    InvalidInterval(&'static str),

    #[error("Invalid temperature: {0} (must be > 0.0)")]
    InvalidTemperature(f32),

    #[error("Invalid loss weight {name}: {value} (must be finite and >= 0.0)")]
    InvalidWeight { name: &'static str, value: f32 },

    #[error("Attention transfer is not supported (beta = {0}, must be 0)")]
    AttentionTransfer(f32),

    #[error("Unknown head in multi_head: {0}")]
    UnknownHead(String),

    #[error("Invalid pixel range: [{min}, {max}]")]
    InvalidPixelRange { min: f32, max: f32 },

    #[error("Invalid schedule decay factor: {0} (must be in (0, 1])")]
    InvalidDecayFactor(f32),

    #[error("Duplicate attack id: {0}")]
    DuplicateAttack(String),

    #[error("Attack {attack} targets unknown model {target}")]
    UnknownTarget { attack: String, target: String },

    #[error("Duplicate model namescope: {0}")]
    DuplicateNamescope(String),

    #[error("Checkpoint given for unknown additional model: {0}")]
    UnknownAdditional(String),

    #[error("threshold_schedule needs an initial value")]
    MissingThresholdInitial,

    #[error("Invalid threshold: {0} (must be finite and >= 0.0)")]
    InvalidThreshold(f32),

    #[error("Invalid salt-and-pepper rate: {0} (must be in [0, 1])")]
    InvalidRate(f32),
}

/// Validate a distillation run description
pub fn validate_config(spec: &DistillSpec) -> std::result::Result<(), ValidationError> {
    #[cfg(not(test))]
    if let Some(path) = &spec.data.path {
        if !path.exists() {
            return Err(ValidationError::DataNotFound(path.display().to_string()));
        }
    }

    if spec.data.batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize(spec.data.batch_size));
    }

    let range = spec.data.pixel_range;
    if !(range.min < range.max) {
        return Err(ValidationError::InvalidPixelRange {
            min: range.min,
            max: range.max,
        });
    }

    if !(spec.optimizer.lr > 0.0) {
        return Err(ValidationError::InvalidLearningRate(spec.optimizer.lr));
    }

    validate_loss(spec)?;
    validate_training(&spec.training)?;
    validate_models(spec)?;

    for rate in spec.test.saltpepper_rates() {
        if !(0.0..=1.0).contains(&rate) {
            return Err(ValidationError::InvalidRate(rate));
        }
    }

    Ok(())
}

fn validate_loss(spec: &DistillSpec) -> std::result::Result<(), ValidationError> {
    let LossSpec {
        alpha,
        beta,
        theta,
        temperature,
        ..
    } = spec.distill;

    if !(temperature > 0.0) {
        return Err(ValidationError::InvalidTemperature(temperature));
    }
    if beta != 0.0 {
        return Err(ValidationError::AttentionTransfer(beta));
    }
    for (name, value) in [("alpha", alpha), ("theta", theta)] {
        check_weight(name, value)?;
    }

    if let Some(multi_head) = &spec.distill.multi_head {
        check_weight("primary_weight", multi_head.primary_weight)?;
        for head in &multi_head.heads {
            if !spec.model.student.heads.contains(&head.name) {
                return Err(ValidationError::UnknownHead(head.name.clone()));
            }
            check_weight("head weight", head.weight)?;
        }
        let total = multi_head.primary_weight
            + multi_head.heads.iter().map(|head| head.weight).sum::<f32>();
        if !(total > 0.0) {
            return Err(ValidationError::InvalidWeight {
                name: "multi_head total",
                value: total,
            });
        }
    }
    if let Some(smoothness) = &spec.distill.grad_smoothness {
        check_weight("grad_smoothness", smoothness.coef)?;
    }
    if let Some(grad_norm) = &spec.distill.grad_norm {
        check_weight("grad_norm", grad_norm.coef)?;
    }
    Ok(())
}

fn validate_training(training: &TrainingSpec) -> std::result::Result<(), ValidationError> {
    if training.epochs == 0 {
        return Err(ValidationError::InvalidEpochs(training.epochs));
    }
    if training.test_frequency == 0 {
        return Err(ValidationError::InvalidInterval("test_frequency"));
    }
    if training.save_every == 0 {
        return Err(ValidationError::InvalidInterval("save_every"));
    }
    if training.print_every == 0 {
        return Err(ValidationError::InvalidInterval("print_every"));
    }
    validate_decay(&training.lr_schedule)?;
    if let Some(initial) = training.lr_schedule.initial {
        if !(initial > 0.0) {
            return Err(ValidationError::InvalidLearningRate(initial));
        }
    }
    if let Some(threshold) = &training.threshold_schedule {
        let initial = threshold
            .initial
            .ok_or(ValidationError::MissingThresholdInitial)?;
        if !(initial.is_finite() && initial >= 0.0) {
            return Err(ValidationError::InvalidThreshold(initial));
        }
        validate_decay(threshold)?;
    }
    Ok(())
}

fn validate_decay(schedule: &ScheduleSpec) -> std::result::Result<(), ValidationError> {
    if schedule.patience.is_some() && !(schedule.decay_factor > 0.0 && schedule.decay_factor <= 1.0)
    {
        return Err(ValidationError::InvalidDecayFactor(schedule.decay_factor));
    }
    Ok(())
}

fn validate_models(spec: &DistillSpec) -> std::result::Result<(), ValidationError> {
    let mut scopes = HashSet::new();
    let networks = [&spec.model.student, &spec.model.teacher]
        .into_iter()
        .chain(spec.model.additional.iter());
    for network in networks {
        if !scopes.insert(network.namescope.as_str()) {
            return Err(ValidationError::DuplicateNamescope(network.namescope.clone()));
        }
    }

    for named in &spec.checkpoints.additional {
        if !spec
            .model
            .additional
            .iter()
            .any(|network| network.namescope == named.name)
        {
            return Err(ValidationError::UnknownAdditional(named.name.clone()));
        }
    }

    for attacks in [&spec.attacks.train, &spec.attacks.test] {
        let mut ids = HashSet::new();
        for attack in attacks {
            if !ids.insert(attack.id.as_str()) {
                return Err(ValidationError::DuplicateAttack(attack.id.clone()));
            }
            if let Some(target) = &attack.target {
                if !scopes.contains(target.as_str()) {
                    return Err(ValidationError::UnknownTarget {
                        attack: attack.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_weight(name: &'static str, value: f32) -> std::result::Result<(), ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::InvalidWeight { name, value })
    }
}

/// Validated, immutable run configuration
///
/// Constructed once from a [`DistillSpec`] and shared read-only by every
/// component of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct DistillConfig {
    spec: DistillSpec,
}

impl DistillConfig {
    pub fn new(spec: DistillSpec) -> Result<Self> {
        validate_config(&spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &DistillSpec {
        &self.spec
    }

    pub fn loss(&self) -> &LossSpec {
        &self.spec.distill
    }

    pub fn training(&self) -> &TrainingSpec {
        &self.spec.training
    }

    /// Whether the distillation term is active
    pub fn distilling(&self) -> bool {
        self.spec.distill.alpha != 0.0
    }

    /// Whether a separate teacher network takes part in the run
    pub fn needs_teacher(&self) -> bool {
        self.distilling() && !self.spec.distill.self_distill
    }

    pub fn into_spec(self) -> DistillSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::{AttackKind, AttackSpec};
    use crate::config::schema::{HeadWeight, MultiHeadSpec, NetworkSpec};
    use crate::io::{CheckpointSpec, NamedCheckpointSpec};

    fn create_valid_spec() -> DistillSpec {
        DistillSpec::default()
    }

    #[test]
    fn test_valid_config() {
        let spec = create_valid_spec();
        assert!(validate_config(&spec).is_ok());
    }

    #[test]
    fn test_invalid_batch_size() {
        let mut spec = create_valid_spec();
        spec.data.batch_size = 0;
        let err = validate_config(&spec).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidBatchSize(0)));
    }

    #[test]
    fn test_invalid_learning_rate() {
        let mut spec = create_valid_spec();
        spec.optimizer.lr = 0.0;
        let err = validate_config(&spec).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidLearningRate(_)));

        spec.optimizer.lr = f32::NAN;
        assert!(validate_config(&spec).is_err());
    }

    #[test]
    fn test_invalid_temperature() {
        let mut spec = create_valid_spec();
        spec.distill.temperature = 0.0;
        let err = validate_config(&spec).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTemperature(_)));
    }

    #[test]
    fn test_nonzero_beta_rejected() {
        let mut spec = create_valid_spec();
        spec.distill.beta = 0.5;
        let err = validate_config(&spec).unwrap_err();
        assert!(matches!(err, ValidationError::AttentionTransfer(_)));
    }

    #[test]
    fn test_negative_alpha_rejected() {
        let mut spec = create_valid_spec();
        spec.distill.alpha = -0.1;
        let err = validate_config(&spec).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidWeight { name: "alpha", .. }));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut spec = create_valid_spec();
        spec.training.test_frequency = 0;
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::InvalidInterval("test_frequency")
        ));

        let mut spec = create_valid_spec();
        spec.training.epochs = 0;
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::InvalidEpochs(0)
        ));
    }

    #[test]
    fn test_multi_head_requires_declared_head() {
        let mut spec = create_valid_spec();
        spec.distill.multi_head = Some(MultiHeadSpec {
            primary_weight: 1.0,
            heads: vec![HeadWeight {
                name: "aux".to_string(),
                weight: 0.5,
            }],
        });
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::UnknownHead(_)
        ));

        spec.model.student.heads.push("aux".to_string());
        assert!(validate_config(&spec).is_ok());

        let multi_head = spec.distill.multi_head.as_mut().unwrap();
        multi_head.primary_weight = 0.0;
        multi_head.heads[0].weight = 0.0;
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::InvalidWeight { .. }
        ));
    }

    #[test]
    fn test_decay_factor_checked_only_with_patience() {
        let mut spec = create_valid_spec();
        spec.training.lr_schedule.decay_factor = 2.0;
        assert!(validate_config(&spec).is_ok());

        spec.training.lr_schedule.patience = Some(3);
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::InvalidDecayFactor(_)
        ));
    }

    #[test]
    fn test_threshold_schedule_needs_initial() {
        let mut spec = create_valid_spec();
        spec.training.threshold_schedule = Some(ScheduleSpec::default());
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::MissingThresholdInitial
        ));
    }

    #[test]
    fn test_zero_threshold_accepted() {
        let mut spec = create_valid_spec();
        spec.training.threshold_schedule = Some(ScheduleSpec {
            initial: Some(0.0),
            ..ScheduleSpec::default()
        });
        assert!(validate_config(&spec).is_ok());

        spec.training.threshold_schedule = Some(ScheduleSpec {
            initial: Some(-0.5),
            ..ScheduleSpec::default()
        });
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::InvalidThreshold(v) if v == -0.5
        ));

        spec.training.threshold_schedule = None;
        spec.training.lr_schedule.initial = Some(0.0);
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::InvalidLearningRate(_)
        ));
    }

    #[test]
    fn test_attack_ids_and_targets() {
        let mut spec = create_valid_spec();
        spec.attacks.train = vec![
            AttackSpec::new("a", AttackKind::Clean),
            AttackSpec::new("a", AttackKind::Seed),
        ];
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::DuplicateAttack(_)
        ));

        spec.attacks.train = vec![AttackSpec::new("f", AttackKind::Fgsm { epsilon: 4.0 })
            .targeting("surrogate")];
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::UnknownTarget { .. }
        ));

        spec.model.additional.push(NetworkSpec::named("surrogate"));
        assert!(validate_config(&spec).is_ok());
    }

    #[test]
    fn test_duplicate_namescope_rejected() {
        let mut spec = create_valid_spec();
        spec.model.teacher.namescope = spec.model.student.namescope.clone();
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::DuplicateNamescope(_)
        ));
    }

    #[test]
    fn test_additional_checkpoint_requires_model() {
        let mut spec = create_valid_spec();
        spec.checkpoints.additional.push(NamedCheckpointSpec {
            name: "surrogate".to_string(),
            spec: CheckpointSpec::at("runs/surrogate"),
        });
        assert!(matches!(
            validate_config(&spec).unwrap_err(),
            ValidationError::UnknownAdditional(_)
        ));
    }

    #[test]
    fn test_distill_config_flags() {
        let config = DistillConfig::new(create_valid_spec()).unwrap();
        assert!(config.distilling());
        assert!(config.needs_teacher());

        let mut spec = create_valid_spec();
        spec.distill.self_distill = true;
        let config = DistillConfig::new(spec).unwrap();
        assert!(!config.needs_teacher());

        let mut spec = create_valid_spec();
        spec.distill.alpha = 0.0;
        assert!(!DistillConfig::new(spec).unwrap().distilling());
    }

    #[test]
    fn test_distill_config_rejects_invalid() {
        let mut spec = create_valid_spec();
        spec.data.batch_size = 0;
        assert!(matches!(
            DistillConfig::new(spec),
            Err(Error::ConfigError(_))
        ));
    }
}
