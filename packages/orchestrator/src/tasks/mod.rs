//! Tasks and the ledger that tracks them.

mod ledger;
mod model;

pub use ledger::{CreateTask, TaskLedger, TaskStatistics};
pub use model::{
    BatchTag, ResumeMarker, Task, TaskDefinition, TaskMetadata, TaskPriority, TaskResolution,
    TaskStatus, TaskTransition,
};
