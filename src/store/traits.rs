//! Storage trait definitions

use crate::model::{CitationAttrs, CitationEdge, Concept, ConceptMention, Paper, PaperId};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store busy: {0}")]
    Busy(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("paper not found: {0}")]
    PaperNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        // SQLITE_BUSY is transient and retried by the writer; everything
        // else is a plain database error.
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy)
            | Some(rusqlite::ErrorCode::DatabaseLocked) => Self::Busy(e.to_string()),
            _ => Self::Database(e),
        }
    }
}

impl StoreError {
    /// Stable kind tag used for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::Busy(_) => "store_busy",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::PaperNotFound(_) => "paper_not_found",
            Self::Io(_) => "io",
        }
    }

    /// Errors that can never converge by retrying or deferring: schema
    /// mismatches, and embedding vectors of the wrong length (a
    /// misconfigured model produces them for every paper). Fatal for
    /// the run; everything else is handled per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaMismatch(_) | Self::DimensionMismatch { .. })
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Aggregate counts over the graph store.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct GraphStats {
    pub papers: usize,
    pub stubs: usize,
    pub citations: usize,
    pub concepts: usize,
    pub mentions: usize,
}

/// One mutation in a per-store atomic batch.
#[derive(Debug, Clone)]
pub enum GraphOp {
    UpsertPaper(Paper),
    EnsureStub(PaperId),
    UpsertCitation {
        src: PaperId,
        dst: PaperId,
        attrs: CitationAttrs,
    },
    UpsertMention {
        paper: PaperId,
        mention: ConceptMention,
    },
}

/// Graph backend: paper nodes, citation edges, concepts, mentions.
///
/// Implementations must be thread-safe; all upserts are keyed on the
/// entity's uniqueness key so replays never duplicate.
pub trait GraphStore: Send + Sync {
    /// Create or update a paper node. Incoming `None` attributes never
    /// clear stored values; edges are untouched.
    fn upsert_paper(&self, paper: &Paper) -> StoreResult<()>;

    /// Create an id-only paper node if none exists.
    fn ensure_stub(&self, id: &PaperId) -> StoreResult<()>;

    /// Create or update the (src, dst) citation edge, creating stub
    /// endpoints as needed. Self-loops are rejected by the writer before
    /// reaching the store.
    fn upsert_citation(
        &self,
        src: &PaperId,
        dst: &PaperId,
        attrs: &CitationAttrs,
    ) -> StoreResult<()>;

    /// Upsert a concept node and the mention edge from `paper` to it.
    fn upsert_mention(&self, paper: &PaperId, mention: &ConceptMention) -> StoreResult<()>;

    /// Apply a sequence of mutations in one transaction.
    fn apply_batch(&self, ops: &[GraphOp]) -> StoreResult<()>;

    fn get_paper(&self, id: &PaperId) -> StoreResult<Option<Paper>>;

    /// Every persisted paper id, used to rebuild the visited-set on resume.
    fn paper_ids(&self) -> StoreResult<Vec<PaperId>>;

    fn paper_count(&self) -> StoreResult<usize>;

    /// Page through papers, optionally filtered by category.
    /// `page` is 1-based.
    fn list_papers(
        &self,
        page: usize,
        page_size: usize,
        category: Option<&str>,
    ) -> StoreResult<Vec<Paper>>;

    /// Outgoing citation edges of a paper.
    fn citations_from(&self, id: &PaperId) -> StoreResult<Vec<CitationEdge>>;

    /// Incoming citation edges of a paper.
    fn citations_to(&self, id: &PaperId) -> StoreResult<Vec<CitationEdge>>;

    /// BFS over citation edges (both directions) up to `depth` hops.
    fn neighborhood(
        &self,
        id: &PaperId,
        depth: usize,
    ) -> StoreResult<(Vec<Paper>, Vec<CitationEdge>)>;

    /// Concepts mentioned by a paper.
    fn concepts_of(&self, id: &PaperId) -> StoreResult<Vec<Concept>>;

    /// Full citation edge list as id pairs, exported for clustering.
    fn citation_adjacency(&self) -> StoreResult<Vec<(PaperId, PaperId)>>;

    /// Flag or clear a paper's embedding-pending marker.
    fn mark_embedding_pending(&self, id: &PaperId, pending: bool) -> StoreResult<()>;

    /// Papers persisted to the graph whose embedding never reached the
    /// vector store.
    fn embedding_pending(&self) -> StoreResult<Vec<PaperId>>;

    fn stats(&self) -> StoreResult<GraphStats>;
}

/// Scalar projection stored next to each vector for filtered search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub category: Option<String>,
    pub year: Option<i32>,
}

/// One vector-store row.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: PaperId,
    pub embedding: Vec<f32>,
    pub category: Option<String>,
    pub year: Option<i32>,
}

/// Result of checking the collection-level embedding model id.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelCheck {
    /// Stored model matches the configured one.
    Match,
    /// Collection was empty; the model id is now recorded.
    Initialized,
    /// A different model produced the stored vectors; a re-embed pass is
    /// required before mixing.
    Mismatch { stored: String },
}

/// Vector backend: per-paper dense embeddings keyed by paper id.
pub trait VectorStore: Send + Sync {
    /// Fixed embedding dimension for this deployment.
    fn dimension(&self) -> usize;

    /// Compare (and, when unset, record) the collection's embedding
    /// model id.
    fn ensure_model(&self, model_id: &str) -> StoreResult<ModelCheck>;

    /// Drop all vectors and record a new model id. Used when the
    /// embedding model changes and the collection must be re-embedded.
    fn reset_collection(&self, model_id: &str) -> StoreResult<()>;

    fn upsert(&self, record: &VectorRecord) -> StoreResult<()>;

    fn has(&self, id: &PaperId) -> StoreResult<bool>;

    /// Every paper id present in the collection.
    fn ids(&self) -> StoreResult<Vec<PaperId>>;

    /// k nearest neighbors by cosine similarity, optionally filtered by
    /// the projected attributes. Scores are in [-1, 1], best first.
    fn knn(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> StoreResult<Vec<(PaperId, f32)>>;

    /// Nearest neighbors seeded by a stored paper's own vector.
    /// `None` when the paper has no vector.
    fn knn_by_id(&self, id: &PaperId, k: usize) -> StoreResult<Option<Vec<(PaperId, f32)>>>;

    fn count(&self) -> StoreResult<usize>;
}
