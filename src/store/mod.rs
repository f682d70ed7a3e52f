//! Persistent storage: graph store and vector store
//!
//! Two backends behind one writer. The graph store holds paper nodes,
//! citation edges, concepts, and mention edges; the vector store holds
//! per-paper embeddings with a small filterable projection. Writes go
//! graph-first; a vector failure leaves the paper flagged
//! embedding-pending, the system's only permitted (and convergent)
//! inconsistency.

mod sqlite;
mod traits;
mod vector;
mod writer;

pub use sqlite::SqliteGraphStore;
pub use traits::{
    GraphOp, GraphStats, GraphStore, ModelCheck, StoreError, StoreResult, VectorFilter,
    VectorRecord, VectorStore,
};
pub use vector::SqliteVectorStore;
pub use writer::{BatchOutcome, StoreWriter, WriteOp, WriteOutcome};
