//! Ingestion pipeline
//!
//! Four stages joined by bounded channels: discover, fetch metadata,
//! analyze, persist. The coordinator owns the stages, the shared
//! frontier, the progress counters, and the checkpoint file; all
//! concurrency in the system lives here.

mod checkpoint;
mod coordinator;
mod frontier;
mod status;

pub use checkpoint::{Checkpoint, CheckpointError, CHECKPOINT_SCHEMA_VERSION};
pub use coordinator::{CoordinatorError, PipelineCoordinator, StopNote};
pub use frontier::Frontier;
pub use status::{Counters, RunState, StatusSnapshot};
