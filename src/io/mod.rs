//! Checkpoint I/O
//!
//! Saving and loading named-tensor checkpoints (SafeTensors, JSON, YAML) and
//! restoring model parameters by role with namescope remapping.

mod checkpoint;
mod format;
mod load;
mod loader;
mod save;

#[cfg(test)]
mod tests;

pub use checkpoint::{Checkpoint, CheckpointMetadata, NamedTensor};
pub use format::{CheckpointFormat, SaveConfig};
pub use load::{load_checkpoint, read_tensors};
pub use loader::{
    remap, CheckpointLoader, CheckpointRoles, CheckpointSource, CheckpointSpec,
    NamedCheckpointSpec, RestorePlan, RestoreReport, RoleRequirements, RoleRestore, RunMode,
};
pub use save::{save_checkpoint, save_model};
