//! Adversarial distillation training
//!
//! - **variants**: Expand one batch into per-attack training variants
//! - **loss**: Compose task, distillation and gradient-penalty terms
//! - **accumulate**: Apply optimizer updates per variant or once per batch
//! - **metrics**: Running per-epoch metric means
//! - **validate**: Clean, adversarial and salt-and-pepper evaluation
//! - **trainer**: Epoch loop tying the pieces together
//!
//! # Example
//!
//! ```no_run
//! use destilar::config::load_config;
//! use destilar::data::InMemoryDataSource;
//! use destilar::io::RunMode;
//! use destilar::model::LinearClassifier;
//! use destilar::optim::SGD;
//! use destilar::train::DistillTrainer;
//!
//! let config = load_config("distill.yaml")?;
//! let mut source = InMemoryDataSource::from_safetensors("mnist.safetensors")?;
//! let student = LinearClassifier::new("stu", 784, 10);
//! let teacher = LinearClassifier::new("tea", 784, 10);
//!
//! let mut trainer = DistillTrainer::new(config, Box::new(student), Box::new(SGD::new(0.1, 0.9)))?
//!     .with_teacher(Box::new(teacher));
//! trainer.start(RunMode::Train, &mut source)?;
//! # Ok::<(), destilar::Error>(())
//! ```

mod accumulate;
mod loss;
mod metrics;
mod regularizer;
mod trainer;
mod validate;
mod variants;

pub use accumulate::GradientAccumulator;
pub use loss::{LossComposer, LossReport, STUDENT_ACCURACY, TASK_LOSS, TEACHER_ACCURACY};
pub use metrics::EpochMetrics;
pub use regularizer::{grad_norm, smoothness, RegularizerTerms, Regularizers};
pub use trainer::{DistillTrainer, EpochSummary, RunOutcome, StopReason, TrainResult};
pub use validate::{AttackStats, ValidationModels, ValidationReport, ValidationRound, ValidationRunner};
pub use variants::{Variant, VariantExpander, VariantSet};
