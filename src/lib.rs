//! Citegraph: citation-network knowledge base engine
//!
//! Builds a queryable knowledge base of scientific papers from public
//! metadata: seed identifiers fan out through the citation graph, every
//! discovered paper is enriched with LLM-produced summaries, extracted
//! concepts, classified citation edges, and a dense embedding, and the
//! results land in a graph store and a vector store keyed by the same
//! paper id.
//!
//! # Core Concepts
//!
//! - **Papers**: nodes keyed by a stable external identifier
//! - **Citations**: directed edges with intent and position labels
//! - **Concepts**: entities extracted from paper text, linked by mentions
//! - **Runs**: one pipeline invocation from seeds to a terminal state,
//!   checkpointed for resume
//!
//! # Example
//!
//! ```no_run
//! use citegraph::pipeline::PipelineCoordinator;
//! # fn takes(_c: &PipelineCoordinator) {}
//! ```

pub mod analyze;
pub mod cancel;
pub mod client;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod store;

pub use analyze::{Analyzer, Enrichment};
pub use cancel::CancellationToken;
pub use client::{AnalysisProvider, ErrorCounters, MetadataProvider, ProviderError};
pub use config::{ProcessConfig, RunConfig};
pub use model::{CitationEdge, Concept, Paper, PaperId};
pub use pipeline::{PipelineCoordinator, RunState, StatusSnapshot};
pub use query::ReadFacade;
pub use store::{SqliteGraphStore, SqliteVectorStore, StoreWriter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
