//! Knowledge Distillation
//!
//! Temperature-scaled soft targets from a teacher, broadcast across however
//! many student variants share the same example.
//!
//! ## Features
//!
//! - **Three numeric forms**: soft cross-entropy, squared distance between
//!   distributions ("gaussian"), and raw scaled-logit MSE
//! - **Row broadcasting**: teacher and student row counts may differ by an
//!   integral factor
//! - **Kernels**: softmax, tiling and accuracy helpers in [`ops`]
//!
//! ## Example
//!
//! ```
//! use destilar::distill::{ops, DistillLoss, DistillLossKind};
//! use ndarray::array;
//!
//! let labels = array![[1.0, 0.0], [0.0, 1.0]];
//! let tiled = ops::tile_rows(&labels, 3);
//! assert_eq!(tiled.nrows(), 6);
//!
//! let loss = DistillLoss::new(4.0, DistillLossKind::Mse).unwrap();
//! let out = loss.forward(&array![[1.0, 2.0]], &array![[1.0, 2.0]]).unwrap();
//! assert_eq!(out.value, 0.0);
//! ```

mod loss;
pub mod ops;


pub use loss::{DistillLoss, DistillLossKind, DistillOutput};
