//! Shared test harness: stub providers and coordinator wiring
//!
//! Providers are deterministic stand-ins for the external metadata and
//! analysis services, with scripted failure injection. Stores run
//! in-memory.

pub mod stubs;

use citegraph::client::ErrorCounters;
use citegraph::pipeline::PipelineCoordinator;
use citegraph::store::{SqliteGraphStore, SqliteVectorStore, StoreWriter, VectorStore};
use citegraph::{AnalysisProvider, MetadataProvider};
use std::path::PathBuf;
use std::sync::Arc;

pub const TEST_DIM: usize = 8;

/// Everything a pipeline test needs to drive and inspect a run.
pub struct Harness {
    pub coordinator: PipelineCoordinator,
    pub graph: Arc<SqliteGraphStore>,
    pub vector: Arc<dyn VectorStore>,
    pub errors: Arc<ErrorCounters>,
}

impl Harness {
    pub fn new(
        metadata: Arc<dyn MetadataProvider>,
        analysis: Arc<dyn AnalysisProvider>,
        checkpoint: Option<PathBuf>,
    ) -> Self {
        let vector: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::open_in_memory(TEST_DIM).unwrap());
        Self::with_vector(metadata, analysis, checkpoint, vector)
    }

    /// Wire in a custom vector store (for failure injection).
    pub fn with_vector(
        metadata: Arc<dyn MetadataProvider>,
        analysis: Arc<dyn AnalysisProvider>,
        checkpoint: Option<PathBuf>,
        vector: Arc<dyn VectorStore>,
    ) -> Self {
        Self::build(
            metadata,
            analysis,
            checkpoint,
            vector,
            Arc::new(ErrorCounters::new()),
        )
    }

    /// Share the error counters with rate-limiting client decorators so
    /// their retry counts surface in `status()`.
    pub fn build(
        metadata: Arc<dyn MetadataProvider>,
        analysis: Arc<dyn AnalysisProvider>,
        checkpoint: Option<PathBuf>,
        vector: Arc<dyn VectorStore>,
        errors: Arc<ErrorCounters>,
    ) -> Self {
        let graph = Arc::new(SqliteGraphStore::open_in_memory().unwrap());
        let writer = Arc::new(StoreWriter::new(graph.clone(), vector.clone()));
        let coordinator = PipelineCoordinator::new(
            metadata,
            analysis,
            writer,
            errors.clone(),
            checkpoint,
        );
        Self {
            coordinator,
            graph,
            vector,
            errors,
        }
    }

    /// Same stores, fresh coordinator; models a process restart against
    /// persistent storage.
    pub fn restarted(
        &self,
        metadata: Arc<dyn MetadataProvider>,
        analysis: Arc<dyn AnalysisProvider>,
        checkpoint: Option<PathBuf>,
    ) -> Self {
        let writer = Arc::new(StoreWriter::new(self.graph.clone(), self.vector.clone()));
        let errors = Arc::new(ErrorCounters::new());
        let coordinator = PipelineCoordinator::new(
            metadata,
            analysis,
            writer,
            errors.clone(),
            checkpoint,
        );
        Self {
            coordinator,
            graph: self.graph.clone(),
            vector: self.vector.clone(),
            errors,
        }
    }
}

/// Invariant: every id in the vector store has a Paper node in the graph.
pub fn assert_vector_ids_subset_of_graph(harness: &Harness) {
    use citegraph::store::GraphStore;
    let graph_ids: std::collections::HashSet<_> =
        harness.graph.paper_ids().unwrap().into_iter().collect();
    for id in harness.vector.ids().unwrap() {
        assert!(
            graph_ids.contains(&id),
            "vector store id {} has no graph node",
            id
        );
    }
}

/// Invariant: both endpoints of every citation edge exist as papers, and
/// no edge is a self-loop.
pub fn assert_edge_invariants(harness: &Harness) {
    use citegraph::store::GraphStore;
    let graph_ids: std::collections::HashSet<_> =
        harness.graph.paper_ids().unwrap().into_iter().collect();
    for (src, dst) in harness.graph.citation_adjacency().unwrap() {
        assert_ne!(src, dst, "self-loop edge on {}", src);
        assert!(graph_ids.contains(&src), "dangling edge source {}", src);
        assert!(graph_ids.contains(&dst), "dangling edge target {}", dst);
    }
}
