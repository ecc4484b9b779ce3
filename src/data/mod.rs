//! Batches and data sources
//!
//! A data source yields four parallel arrays per call: the clean image, an
//! augmented image, the one-hot label and a precomputed adversarial seed
//! image. Images are `[N, H, W, C]`; labels are `[N, classes]`.

mod batch;
mod corrupt;
mod source;

pub use batch::{flatten_images, Batch, Split};
pub use corrupt::salt_and_pepper;
pub use source::{one_hot, Augment, DataSource, InMemoryDataSource, PixelRange};
