//! YAML schema definitions for declarative distillation configuration

use crate::attack::AttackSpec;
use crate::data::{Augment, PixelRange};
use crate::distill::DistillLossKind;
use crate::io::CheckpointRoles;
use crate::optim::{PlateauSchedule, Reduce};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete distillation run description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistillSpec {
    /// Reference network shapes and namescopes
    #[serde(default)]
    pub model: ModelSpec,

    #[serde(default)]
    pub data: DataSpec,

    #[serde(default)]
    pub optimizer: OptimSpec,

    /// Loss composition
    #[serde(default)]
    pub distill: LossSpec,

    #[serde(default)]
    pub training: TrainingSpec,

    #[serde(default)]
    pub attacks: AttackConfig,

    #[serde(default)]
    pub checkpoints: CheckpointRoles,

    #[serde(default)]
    pub test: TestSpec,
}

/// One network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub namescope: String,

    /// Auxiliary head names, fixed at construction
    #[serde(default)]
    pub heads: Vec<String>,

    #[serde(default)]
    pub weight_decay: f32,

    /// Uniform weight initialisation bound
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,

    #[serde(default)]
    pub seed: u64,
}

impl NetworkSpec {
    pub fn named(namescope: impl Into<String>) -> Self {
        Self {
            namescope: namescope.into(),
            heads: Vec::new(),
            weight_decay: 0.0,
            init_scale: default_init_scale(),
            seed: 0,
        }
    }
}

/// Student, teacher and additional networks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default = "default_student")]
    pub student: NetworkSpec,

    #[serde(default = "default_teacher")]
    pub teacher: NetworkSpec,

    /// Extra networks available as attack targets
    #[serde(default)]
    pub additional: Vec<NetworkSpec>,

    /// Restore the student from a denoiser checkpoint plus a classifier checkpoint
    #[serde(default)]
    pub use_denoiser: bool,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            student: default_student(),
            teacher: default_teacher(),
            additional: Vec::new(),
            use_denoiser: false,
        }
    }
}

/// Dataset configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    /// SafeTensors dataset file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub augment: Augment,

    #[serde(default)]
    pub pixel_range: PixelRange,
}

impl Default for DataSpec {
    fn default() -> Self {
        Self {
            path: None,
            batch_size: default_batch_size(),
            augment: Augment::default(),
            pixel_range: PixelRange::default(),
        }
    }
}

/// Optimizer selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd {
        #[serde(default = "default_momentum")]
        momentum: f32,
    },
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_eps")]
        eps: f32,
    },
    AdamW {
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_eps")]
        eps: f32,
        #[serde(default = "default_weight_decay")]
        weight_decay: f32,
    },
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimSpec {
    /// Base learning rate (the schedule's starting value unless overridden)
    #[serde(default = "default_lr")]
    pub lr: f32,

    #[serde(flatten)]
    pub kind: OptimizerKind,
}

impl Default for OptimSpec {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            kind: OptimizerKind::Sgd {
                momentum: default_momentum(),
            },
        }
    }
}

/// Weight of one auxiliary head in the multi-head task term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadWeight {
    pub name: String,
    pub weight: f32,
}

/// Multi-head task term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHeadSpec {
    #[serde(default = "default_one")]
    pub primary_weight: f32,
    pub heads: Vec<HeadWeight>,
}

/// Gradient-smoothness penalty on the input gradient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothnessSpec {
    pub coef: f32,
    /// Rescale the coefficient by `total loss / smoothness`
    #[serde(default)]
    pub auto_scale: bool,
}

/// Norm order of the gradient-norm penalty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum GradNormOrder {
    L1,
    L2,
}

impl TryFrom<u32> for GradNormOrder {
    type Error = Error;

    fn try_from(order: u32) -> Result<Self, Self::Error> {
        match order {
            1 => Ok(GradNormOrder::L1),
            2 => Ok(GradNormOrder::L2),
            other => Err(Error::ConfigError(format!(
                "Unsupported gradient norm order: {other} (must be 1 or 2)"
            ))),
        }
    }
}

impl From<GradNormOrder> for u32 {
    fn from(order: GradNormOrder) -> Self {
        match order {
            GradNormOrder::L1 => 1,
            GradNormOrder::L2 => 2,
        }
    }
}

/// Gradient-norm penalty on the input gradient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradNormSpec {
    pub coef: f32,
    pub order: GradNormOrder,
}

/// Loss composition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSpec {
    /// Distillation weight
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Attention-transfer weight (must stay zero)
    #[serde(default)]
    pub beta: f32,

    /// Task weight
    #[serde(default = "default_theta")]
    pub theta: f32,

    #[serde(default = "default_one")]
    pub temperature: f32,

    #[serde(default)]
    pub loss_type: DistillLossKind,

    /// Feed the teacher the augmented image instead of the clean one
    #[serde(default)]
    pub use_augmented: bool,

    /// Distill from the student's own clean-input outputs
    #[serde(default)]
    pub self_distill: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_head: Option<MultiHeadSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_smoothness: Option<SmoothnessSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<GradNormSpec>,
}

impl Default for LossSpec {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            beta: 0.0,
            theta: default_theta(),
            temperature: default_one(),
            loss_type: DistillLossKind::default(),
            use_augmented: false,
            self_distill: false,
            multi_head: None,
            grad_smoothness: None,
            grad_norm: None,
        }
    }
}

/// How variant gradients are applied within one outer batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationMode {
    /// One optimizer update per variant
    #[default]
    Direct,
    /// One optimizer update per outer batch from summed variant gradients
    Accumulate,
}

/// Reduce-on-plateau schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Starting value; the learning-rate schedule defaults to `optimizer.lr`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<f32>,

    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,

    /// Stale validation rounds before decaying; none keeps the value constant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patience: Option<usize>,

    #[serde(default = "default_max_decays")]
    pub max_decays: usize,

    #[serde(default)]
    pub min_delta: f32,

    #[serde(default)]
    pub reduce: Reduce,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            initial: None,
            decay_factor: default_decay_factor(),
            patience: None,
            max_decays: default_max_decays(),
            min_delta: 0.0,
            reduce: Reduce::default(),
        }
    }
}

impl ScheduleSpec {
    /// Build the controller, starting from `fallback` when no initial value is set
    pub fn build(&self, fallback: f32) -> PlateauSchedule {
        let mut schedule = PlateauSchedule::new(self.initial.unwrap_or(fallback))
            .with_max_decays(self.max_decays)
            .with_min_delta(self.min_delta)
            .with_reduce(self.reduce);
        if let Some(patience) = self.patience {
            schedule = schedule.with_decay(self.decay_factor, patience);
        }
        schedule
    }
}

/// Training loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSpec {
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Validate every N epochs
    #[serde(default = "default_one_usize")]
    pub test_frequency: usize,

    /// Save a checkpoint every N epochs
    #[serde(default = "default_one_usize")]
    pub save_every: usize,

    /// Log progress every N steps
    #[serde(default = "default_print_every")]
    pub print_every: usize,

    #[serde(default)]
    pub accumulation: AccumulationMode,

    /// Checkpoint directory; nothing is saved without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_dir: Option<PathBuf>,

    /// Skip validation of the loaded models before training
    #[serde(default)]
    pub no_init_test: bool,

    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub lr_schedule: ScheduleSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_schedule: Option<ScheduleSpec>,
}

impl Default for TrainingSpec {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            test_frequency: 1,
            save_every: 1,
            print_every: default_print_every(),
            accumulation: AccumulationMode::default(),
            train_dir: None,
            no_init_test: false,
            seed: 0,
            lr_schedule: ScheduleSpec::default(),
            threshold_schedule: None,
        }
    }
}

/// Training and evaluation attacks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Attacks generating training variants; empty trains on the augmented image only
    #[serde(default)]
    pub train: Vec<AttackSpec>,

    /// Attacks evaluated during validation
    #[serde(default)]
    pub test: Vec<AttackSpec>,

    /// Interleave all training variants into one array
    #[serde(default)]
    pub train_merge: bool,
}

/// One salt-and-pepper rate or several
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rates {
    One(f32),
    Many(Vec<f32>),
}

impl Rates {
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            Rates::One(rate) => vec![*rate],
            Rates::Many(rates) => rates.clone(),
        }
    }
}

/// Test-only mode settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Salt-and-pepper corruption rates evaluated after the adversarial round
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saltpepper: Option<Rates>,
}

impl TestSpec {
    pub fn saltpepper_rates(&self) -> Vec<f32> {
        self.saltpepper.as_ref().map(Rates::to_vec).unwrap_or_default()
    }
}

fn default_student() -> NetworkSpec {
    NetworkSpec::named("stu")
}

fn default_teacher() -> NetworkSpec {
    NetworkSpec::named("tea")
}

fn default_init_scale() -> f32 {
    0.01
}

fn default_batch_size() -> usize {
    100
}

fn default_lr() -> f32 {
    0.1
}

fn default_momentum() -> f32 {
    0.9
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_eps() -> f32 {
    1e-8
}

fn default_weight_decay() -> f32 {
    0.01
}

fn default_alpha() -> f32 {
    0.1
}

fn default_theta() -> f32 {
    0.5
}

fn default_one() -> f32 {
    1.0
}

fn default_one_usize() -> usize {
    1
}

fn default_decay_factor() -> f32 {
    0.1
}

fn default_max_decays() -> usize {
    3
}

fn default_epochs() -> usize {
    50
}

fn default_print_every() -> usize {
    10
}
