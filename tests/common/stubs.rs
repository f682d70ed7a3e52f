//! Deterministic provider stubs with scripted failure injection

use async_trait::async_trait;
use citegraph::cancel::CancellationToken;
use citegraph::client::{
    AnalysisProvider, CitationLabel, CitationRef, ExtractedConcept, MetadataProvider, Page,
    PaperRecord, ProviderError, SummaryLevel,
};
use citegraph::model::{CitationIntent, CitationPosition, ConceptKind, PaperId};
use citegraph::store::{
    ModelCheck, StoreError, StoreResult, VectorFilter, VectorRecord, VectorStore,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted metadata source backed by an in-memory paper graph.
#[derive(Default)]
pub struct StubMetadata {
    papers: Mutex<HashMap<PaperId, PaperRecord>>,
    references: Mutex<HashMap<PaperId, Vec<CitationRef>>>,
    citations: Mutex<HashMap<PaperId, Vec<CitationRef>>>,
    /// Fail this many leading `get_paper` calls with RateLimited.
    fail_first: AtomicUsize,
    /// Fail every `get_paper` call with Unavailable (a dead provider).
    down: std::sync::atomic::AtomicBool,
    /// Artificial latency per `get_paper`, to make runs observable.
    latency: Mutex<Duration>,
    pub paper_calls: AtomicUsize,
}

impl StubMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolvable paper with its outgoing references.
    /// Each reference is `(id, optional citing sentence)`.
    pub fn with_paper(self, id: &str, refs: &[(&str, Option<&str>)]) -> Self {
        let paper_id = PaperId::from(id);
        let record = PaperRecord {
            id: paper_id.clone(),
            title: format!("Paper {}", id),
            abstract_text: Some(format!("Abstract of paper {}.", id)),
            authors: vec!["A. Author".into()],
            categories: vec!["hep-th".into()],
            published_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 15),
            citation_count: Some(10),
            tl_dr: Some(format!("TLDR {}", id)),
        };
        self.papers.lock().unwrap().insert(paper_id.clone(), record);
        let refs = refs
            .iter()
            .map(|(rid, context)| CitationRef {
                id: PaperId::from(*rid),
                context: context.map(|c| c.to_string()),
            })
            .collect();
        self.references.lock().unwrap().insert(paper_id, refs);
        self
    }

    /// Register incoming citations for a paper.
    pub fn with_citations(self, id: &str, citing: &[&str]) -> Self {
        let refs = citing
            .iter()
            .map(|cid| CitationRef {
                id: PaperId::from(*cid),
                context: None,
            })
            .collect();
        self.citations
            .lock()
            .unwrap()
            .insert(PaperId::from(id), refs);
        self
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    pub fn unavailable(self) -> Self {
        self.down.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = latency;
        self
    }
}

#[async_trait]
impl MetadataProvider for StubMetadata {
    async fn get_paper(
        &self,
        id: &PaperId,
        _cancel: &CancellationToken,
    ) -> Result<PaperRecord, ProviderError> {
        self.paper_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("metadata service down".into()));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::RateLimited { retry_after: None });
        }
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.papers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn get_references(
        &self,
        id: &PaperId,
        _cursor: Option<u64>,
        _cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError> {
        let items = self
            .references
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok(Page { items, next: None })
    }

    async fn get_citations(
        &self,
        id: &PaperId,
        _cursor: Option<u64>,
        _cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError> {
        let items = self
            .citations
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok(Page { items, next: None })
    }
}

/// Deterministic analysis provider: embeddings are a hash of the text,
/// summaries and labels follow fixed rules.
pub struct StubAnalysis {
    dimension: usize,
    down: bool,
}

impl StubAnalysis {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            down: false,
        }
    }

    /// Every call fails with Unavailable (a dead provider).
    pub fn unavailable(dimension: usize) -> Self {
        Self {
            dimension,
            down: true,
        }
    }

    fn check_up(&self) -> Result<(), ProviderError> {
        if self.down {
            return Err(ProviderError::Unavailable("analysis service down".into()));
        }
        Ok(())
    }

    fn text_vector(&self, text: &str) -> Vec<f32> {
        let seed: u64 = text
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        (0..self.dimension)
            .map(|i| {
                let h = seed
                    .wrapping_mul(2654435761)
                    .wrapping_add(i as u64 * 40503)
                    % 1000;
                h as f32 / 1000.0 + 0.001
            })
            .collect()
    }
}

#[async_trait]
impl AnalysisProvider for StubAnalysis {
    fn model_id(&self) -> &str {
        "stub-llm-v1"
    }

    fn embedding_model_id(&self) -> &str {
        "stub-embed-v1"
    }

    async fn summarize(
        &self,
        text: &str,
        _level: SummaryLevel,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.check_up()?;
        Ok(format!("Summary: {}", text.chars().take(24).collect::<String>()))
    }

    async fn extract_entities(
        &self,
        text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedConcept>, ProviderError> {
        self.check_up()?;
        // One concept per paper, derived from the text so that distinct
        // papers mention distinct concepts.
        let tag = text
            .split_whitespace()
            .last()
            .unwrap_or("unknown")
            .trim_matches('.')
            .to_string();
        Ok(vec![ExtractedConcept {
            name: format!("concept {}", tag),
            kind: ConceptKind::Method,
            confidence: Some(0.9),
        }])
    }

    async fn classify_citation(
        &self,
        context: &str,
        _cancel: &CancellationToken,
    ) -> Result<CitationLabel, ProviderError> {
        self.check_up()?;
        let intent = if context.contains("method") {
            CitationIntent::Method
        } else if context.contains("extends") {
            CitationIntent::Extension
        } else {
            CitationIntent::Background
        };
        Ok(CitationLabel {
            intent,
            position: CitationPosition::Introduction,
        })
    }

    async fn embed(
        &self,
        text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError> {
        self.check_up()?;
        Ok(self.text_vector(text))
    }
}

/// Vector store decorator that fails the next N upserts.
pub struct FailingVectorStore<V> {
    inner: V,
    fail_next: AtomicUsize,
}

impl<V: VectorStore> FailingVectorStore<V> {
    pub fn new(inner: V, failures: usize) -> Self {
        Self {
            inner,
            fail_next: AtomicUsize::new(failures),
        }
    }
}

impl<V: VectorStore> VectorStore for FailingVectorStore<V> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn ensure_model(&self, model_id: &str) -> StoreResult<ModelCheck> {
        self.inner.ensure_model(model_id)
    }

    fn reset_collection(&self, model_id: &str) -> StoreResult<()> {
        self.inner.reset_collection(model_id)
    }

    fn upsert(&self, record: &VectorRecord) -> StoreResult<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Busy("injected vector failure".into()));
        }
        self.inner.upsert(record)
    }

    fn has(&self, id: &PaperId) -> StoreResult<bool> {
        self.inner.has(id)
    }

    fn ids(&self) -> StoreResult<Vec<PaperId>> {
        self.inner.ids()
    }

    fn knn(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> StoreResult<Vec<(PaperId, f32)>> {
        self.inner.knn(query, k, filter)
    }

    fn knn_by_id(&self, id: &PaperId, k: usize) -> StoreResult<Option<Vec<(PaperId, f32)>>> {
        self.inner.knn_by_id(id, k)
    }

    fn count(&self) -> StoreResult<usize> {
        self.inner.count()
    }
}
