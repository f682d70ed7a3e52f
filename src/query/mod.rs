//! Read-only query operations over the completed store
//!
//! Consumed by the HTTP layer, the CLI, and the prediction subsystem.
//! Everything here is non-mutating and safe to run concurrently with an
//! active write pipeline.

mod clusters;
mod facade;

pub use clusters::{label_propagation, Cluster};
pub use facade::{FacadeError, PaperDetail, PaperSummary, ReadFacade, SearchHit};
