//! # Destilar: Robust Knowledge Distillation
//!
//! Destilar trains a compact student classifier to mimic a larger teacher's
//! output distribution while hardening the student against adversarially
//! perturbed inputs generated on the fly.
//!
//! ## Architecture
//!
//! - **model**: Named parameters and the model collaborator trait
//! - **optim**: Optimizers (SGD, Adam, AdamW) and the plateau schedule controller
//! - **distill**: Temperature-scaled distillation losses and tiling kernels
//! - **data**: Batches, data sources and pixel corruption
//! - **attack**: Adversarial variant generators
//! - **train**: Loss composition, gradient accumulation, validation and the trainer
//! - **io**: Checkpoint saving and namescope-aware restoring
//! - **config**: Declarative YAML configuration and CLI

pub mod attack;
pub mod config;
pub mod data;
pub mod distill;
pub mod io;
pub mod model;
pub mod optim;
pub mod train;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use model::{Model, Param};
