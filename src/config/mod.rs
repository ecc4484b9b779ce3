//! Declarative YAML configuration
//!
//! One YAML document describes the networks, dataset, optimizer, loss
//! composition, training loop, attacks and checkpoint roles of a run.
//!
//! # Example
//!
//! ```yaml
//! data:
//!   path: mnist.safetensors
//!   batch_size: 100
//!
//! optimizer:
//!   name: sgd
//!   lr: 0.1
//!   momentum: 0.9
//!
//! distill:
//!   alpha: 0.1
//!   theta: 0.5
//!   temperature: 4.0
//!   loss_type: ce
//!
//! training:
//!   epochs: 50
//!   lr_schedule:
//!     patience: 3
//!     decay_factor: 0.1
//!
//! attacks:
//!   train:
//!     - id: fgsm
//!       type: fgsm
//!       epsilon: 0.3
//!
//! checkpoints:
//!   teacher:
//!     path: runs/teacher
//!     namescope: tea
//! ```

mod builder;
mod cli;
mod schema;
mod train;
mod validate;


pub use builder::{build_network, build_optimizer, build_trainer};
pub use cli::{
    apply_overrides, apply_test_overrides, parse_args, Cli, Command, InfoArgs, OutputFormat,
    TestArgs, TrainArgs, ValidateArgs,
};
pub use schema::{
    AccumulationMode, AttackConfig, DataSpec, DistillSpec, GradNormOrder, GradNormSpec,
    HeadWeight, LossSpec, ModelSpec, MultiHeadSpec, NetworkSpec, OptimSpec, OptimizerKind, Rates,
    ScheduleSpec, SmoothnessSpec, TestSpec, TrainingSpec,
};
pub use train::{load_config, load_spec, run_config, test_from_yaml, train_from_yaml};
pub use validate::{validate_config, DistillConfig, ValidationError};
