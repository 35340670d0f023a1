//! Checksummed progress snapshots.

mod model;
mod store;

pub use model::{Checkpoint, ProgressData};
pub use store::CheckpointStore;
