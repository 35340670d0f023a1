//! Progress tracking, fleet health and the background loops that feed them.

mod progress;
mod status;
mod ticker;

pub use progress::{ProgressMonitor, ProgressSample, ProgressSummary};
pub use status::{
    assess, HealthLevel, HealthSignals, HealthThresholds, QueueStatus, StatusMonitor, SystemHealth,
    WorkerStatus,
};
pub use ticker::spawn_periodic;
