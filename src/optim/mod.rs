//! Optimizers and schedule controllers

mod adam;
mod adamw;
mod optimizer;
mod scheduler;
mod sgd;

pub use adam::Adam;
pub use adamw::AdamW;
pub use optimizer::Optimizer;
pub use scheduler::{PlateauSchedule, Reduce, ScheduleController, ScheduleFeedback};
pub use sgd::SGD;
