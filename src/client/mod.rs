//! Rate-limited provider clients
//!
//! Two external providers back the pipeline: a metadata provider (paper
//! records, citation and reference lists) and an analysis provider (LLM
//! completions and embeddings). Both are reached through the same
//! machinery: a trait per provider, an HTTP implementation, and a
//! rate-limiting decorator that composes a shared token bucket, a retry
//! policy with exponential backoff, and cooperative cancellation.
//!
//! Loosely structured provider responses never leave this module: every
//! boundary parses into a typed record or fails with a typed error.

pub mod analysis;
mod cache;
mod limiter;
pub mod metadata;
pub mod offline;
mod retry;

pub use analysis::{
    AnalysisProvider, CitationLabel, ExtractedConcept, FailoverAnalysis, HttpAnalysisClient,
    RateLimitedAnalysis, SummaryLevel,
};
pub use cache::RequestCache;
pub use limiter::TokenBucket;
pub use offline::OfflineAnalysis;
pub use metadata::{
    CitationRef, HttpMetadataClient, MetadataProvider, Page, PaperRecord, RateLimitedMetadata,
};
pub use retry::RetryPolicy;

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by provider clients.
///
/// Retryable kinds (`RateLimited`, `Unavailable`) are retried inside the
/// rate-limiting decorator; everything else surfaces immediately.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited")]
    RateLimited {
        /// Provider-supplied retry-after hint, honored by the backoff.
        retry_after: Option<Duration>,
    },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider overloaded")]
    Overloaded,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Unavailable(_))
    }

    /// Stable kind tag used for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Overloaded => "overloaded",
            Self::NotFound(_) => "not_found",
            Self::InvalidId(_) => "invalid_id",
            Self::InvalidInput(_) => "invalid_input",
            Self::Malformed(_) => "malformed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Shared error/retry counters, keyed `"{source}.{kind}"`.
///
/// Client decorators record retries tagged by provider; pipeline stages
/// record per-item failures tagged by stage. The run status surfaces the
/// merged view. Cancellation is never counted.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    counts: DashMap<String, u64>,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: &str, kind: &str) {
        if kind == "cancelled" {
            return;
        }
        *self.counts.entry(format!("{}.{}", source, kind)).or_insert(0) += 1;
    }

    pub fn get(&self, source: &str, kind: &str) -> u64 {
        self.counts
            .get(&format!("{}.{}", source, kind))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Ordered snapshot for status serialization.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Unavailable("boom".into()).is_retryable());
        assert!(!ProviderError::Overloaded.is_retryable());
        assert!(!ProviderError::NotFound("x".into()).is_retryable());
        assert!(!ProviderError::Cancelled.is_retryable());
    }

    #[test]
    fn counters_tag_by_source_and_kind() {
        let counters = ErrorCounters::new();
        counters.record("metadata", "rate_limited");
        counters.record("metadata", "rate_limited");
        counters.record("fetch", "not_found");
        assert_eq!(counters.get("metadata", "rate_limited"), 2);
        assert_eq!(counters.get("fetch", "not_found"), 1);
        assert_eq!(counters.snapshot().len(), 2);
    }

    #[test]
    fn cancellation_is_not_counted() {
        let counters = ErrorCounters::new();
        counters.record("analysis", "cancelled");
        assert!(counters.snapshot().is_empty());
    }
}
