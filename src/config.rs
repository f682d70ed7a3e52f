//! Run and process configuration

use crate::model::PaperId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Worker pool sizes, one per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWorkers {
    pub discover: usize,
    pub fetch: usize,
    pub analyze: usize,
    pub persist: usize,
}

impl Default for StageWorkers {
    fn default() -> Self {
        Self {
            discover: 1,
            fetch: 4,
            analyze: 4,
            persist: 2,
        }
    }
}

/// Bounded-channel capacities between the stages. Producers block when a
/// queue is full; this back-pressure is the only flow control above the
/// rate limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCapacities {
    /// Discover → fetch.
    pub discovered: usize,
    /// Fetch → analyze.
    pub fetched: usize,
    /// Analyze → persist.
    pub analyzed: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            discovered: 64,
            fetched: 32,
            analyzed: 32,
        }
    }
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub seeds: Vec<PaperId>,
    /// BFS depth bound; 0 processes only the seeds.
    pub max_depth: u32,
    /// Total paper bound; `None` is unbounded.
    pub max_papers: Option<usize>,
    /// Cap on neighbors enqueued from any single paper.
    pub max_fanout_per_paper: usize,
    pub analyze_enabled: bool,
    pub embed_enabled: bool,
    /// When false, discovery stops at the seeds' stored records.
    pub use_metadata: bool,
    pub use_full_text: bool,
    /// Also expand through incoming citations, not just references.
    pub expand_citations: bool,
    /// Write a checkpoint after every N discovered-and-enqueued items.
    pub checkpoint_every_n: usize,
    pub workers: StageWorkers,
    pub queues: QueueCapacities,
    /// Restore the frontier from the checkpoint file before starting.
    pub resume: bool,
}

impl RunConfig {
    pub fn from_seeds(seeds: Vec<PaperId>) -> Self {
        Self {
            seeds,
            max_depth: 1,
            max_papers: Some(100),
            max_fanout_per_paper: 50,
            analyze_enabled: true,
            embed_enabled: true,
            use_metadata: true,
            use_full_text: false,
            expand_citations: false,
            checkpoint_every_n: 500,
            workers: StageWorkers::default(),
            queues: QueueCapacities::default(),
            resume: false,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.seeds.is_empty() && !self.resume {
            return Err("at least one seed is required".into());
        }
        if self.max_fanout_per_paper == 0 {
            return Err("max_fanout_per_paper must be positive".into());
        }
        if self.max_papers == Some(0) {
            return Err("max_papers must be positive".into());
        }
        if self.checkpoint_every_n == 0 {
            return Err("checkpoint_every_n must be positive".into());
        }
        let w = &self.workers;
        if w.discover == 0 || w.fetch == 0 || w.analyze == 0 || w.persist == 0 {
            return Err("every stage needs at least one worker".into());
        }
        let q = &self.queues;
        if q.discovered == 0 || q.fetched == 0 || q.analyzed == 0 {
            return Err("queue capacities must be positive".into());
        }
        Ok(())
    }
}

/// Which of the configured analysis endpoints serve as primary and
/// fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSelection {
    pub primary: String,
    pub fallback: Option<String>,
    /// How long the primary may stay overloaded before the fallback
    /// takes over, in seconds.
    pub budget_window_secs: u64,
}

impl Default for AnalysisSelection {
    fn default() -> Self {
        Self {
            primary: "http://localhost:11434".into(),
            fallback: None,
            budget_window_secs: 60,
        }
    }
}

/// Provider endpoints and budgets.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub metadata_base_url: String,
    pub metadata_api_key: Option<String>,
    /// Metadata token-bucket fill rate, requests per second.
    pub metadata_rps: f64,
    pub analysis: AnalysisSelection,
    pub analysis_model: String,
    pub embedding_model: String,
    /// Analysis token-bucket budget, requests per minute.
    pub analysis_rpm: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            metadata_base_url: "https://api.semanticscholar.org/graph/v1".into(),
            metadata_api_key: None,
            metadata_rps: 1.0,
            analysis: AnalysisSelection::default(),
            analysis_model: "llama3.2:8b".into(),
            embedding_model: "nomic-embed-text".into(),
            analysis_rpm: 60.0,
        }
    }
}

// API keys never appear in logs or status output.
impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("metadata_base_url", &self.metadata_base_url)
            .field(
                "metadata_api_key",
                &self.metadata_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("metadata_rps", &self.metadata_rps)
            .field("analysis", &self.analysis)
            .field("analysis_model", &self.analysis_model)
            .field("embedding_model", &self.embedding_model)
            .field("analysis_rpm", &self.analysis_rpm)
            .finish()
    }
}

/// Store locations. Both backends are embedded SQLite files, so the
/// connection surface collapses to paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub graph_path: PathBuf,
    pub vector_store_path: PathBuf,
    /// Embedding dimension D, fixed per deployment.
    pub embedding_dim: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            graph_path: PathBuf::from("citegraph.db"),
            vector_store_path: PathBuf::from("citegraph-vectors.db"),
            embedding_dim: 768,
        }
    }
}

/// Process-level configuration: providers, stores, checkpoint location,
/// log level.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub provider: ProviderConfig,
    pub store: StoreConfig,
    pub checkpoint_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl ProcessConfig {
    /// Overlay recognized environment variables onto the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CITEGRAPH_METADATA_URL") {
            config.provider.metadata_base_url = v;
        }
        if let Ok(v) = std::env::var("CITEGRAPH_METADATA_API_KEY") {
            config.provider.metadata_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("CITEGRAPH_METADATA_RPS") {
            if let Ok(parsed) = v.parse() {
                config.provider.metadata_rps = parsed;
            }
        }
        if let Ok(v) = std::env::var("CITEGRAPH_ANALYSIS_URL") {
            config.provider.analysis.primary = v;
        }
        if let Ok(v) = std::env::var("CITEGRAPH_ANALYSIS_FALLBACK_URL") {
            config.provider.analysis.fallback = Some(v);
        }
        if let Ok(v) = std::env::var("CITEGRAPH_ANALYSIS_MODEL") {
            config.provider.analysis_model = v;
        }
        if let Ok(v) = std::env::var("CITEGRAPH_EMBEDDING_MODEL") {
            config.provider.embedding_model = v;
        }
        if let Ok(v) = std::env::var("CITEGRAPH_ANALYSIS_RPM") {
            if let Ok(parsed) = v.parse() {
                config.provider.analysis_rpm = parsed;
            }
        }
        if let Ok(v) = std::env::var("CITEGRAPH_EMBEDDING_DIM") {
            if let Ok(parsed) = v.parse() {
                config.store.embedding_dim = parsed;
            }
        }
        if let Ok(v) = std::env::var("CITEGRAPH_LOG") {
            config.log_level = Some(v);
        }
        config
    }
}
