//! Per-paper enrichment
//!
//! Given a metadata-resolved paper, the analyzer produces a summary, an
//! extracted concept set, intent/position labels for each outgoing
//! reference, and a dense embedding. Sub-steps fail independently: a
//! summarization that succeeds is kept even when entity extraction does
//! not, and the resulting partial enrichment is marked so the paper can
//! be re-analyzed on a later run. Sub-steps whose output is already in
//! the store under the current model id are skipped.

use crate::cancel::CancellationToken;
use crate::client::{AnalysisProvider, CitationRef, ProviderError, SummaryLevel};
use crate::model::{CitationAttrs, Concept, ConceptMention, Paper, PaperId};
use async_trait::async_trait;
use std::sync::Arc;

/// Enrichment sub-steps, used to tag partial failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichStep {
    Summary,
    Entities,
    CitationLabels,
    Embedding,
}

impl EnrichStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Entities => "entities",
            Self::CitationLabels => "citation_labels",
            Self::Embedding => "embedding",
        }
    }
}

/// A sub-step that failed while the rest of the enrichment proceeded.
#[derive(Debug, Clone)]
pub struct EnrichmentFailure {
    pub step: EnrichStep,
    pub kind: &'static str,
    /// True when the provider was the problem (rate limited, down, or
    /// overloaded) rather than this paper's input. The coordinator
    /// tracks these against its provider-outage window.
    pub transient: bool,
}

impl EnrichmentFailure {
    fn of(step: EnrichStep, err: &ProviderError) -> Self {
        let transient = matches!(
            err,
            ProviderError::RateLimited { .. }
                | ProviderError::Unavailable(_)
                | ProviderError::Overloaded
        );
        Self {
            step,
            kind: err.kind(),
            transient,
        }
    }
}

/// An outgoing reference with its classified attributes.
#[derive(Debug, Clone)]
pub struct LabeledReference {
    pub dst: PaperId,
    pub attrs: CitationAttrs,
}

/// The bundle produced for one paper.
#[derive(Debug, Clone)]
pub struct Enrichment {
    pub paper: Paper,
    pub references: Vec<LabeledReference>,
    pub mentions: Vec<ConceptMention>,
    pub failures: Vec<EnrichmentFailure>,
    /// Analysis-provider calls issued for this paper (short-circuited
    /// sub-steps issue none).
    pub provider_calls: usize,
}

impl Enrichment {
    /// True if any sub-step failed; such papers are candidates for
    /// re-analysis on a later run.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Pluggable full-text source (PDF parsing lives behind this seam).
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn full_text(&self, id: &PaperId) -> Result<Option<String>, ProviderError>;
}

/// Drives the analysis provider for one paper at a time.
pub struct Analyzer {
    provider: Arc<dyn AnalysisProvider>,
    analyze_enabled: bool,
    embed_enabled: bool,
    use_full_text: bool,
    extractor: Option<Arc<dyn ContentExtractor>>,
}

impl Analyzer {
    pub fn new(provider: Arc<dyn AnalysisProvider>) -> Self {
        Self {
            provider,
            analyze_enabled: true,
            embed_enabled: true,
            use_full_text: false,
            extractor: None,
        }
    }

    pub fn with_flags(mut self, analyze_enabled: bool, embed_enabled: bool) -> Self {
        self.analyze_enabled = analyze_enabled;
        self.embed_enabled = embed_enabled;
        self
    }

    pub fn with_full_text(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.use_full_text = true;
        self.extractor = Some(extractor);
        self
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    /// Enrich one paper. Returns `Err` only on cancellation; every other
    /// sub-step failure is recorded and the rest of the bundle survives.
    pub async fn enrich(
        &self,
        mut paper: Paper,
        references: Vec<CitationRef>,
        existing: Option<&Paper>,
        cancel: &CancellationToken,
    ) -> Result<Enrichment, ProviderError> {
        let mut failures = Vec::new();
        let mut mentions = Vec::new();
        let mut provider_calls = 0usize;
        let model = self.provider.model_id().to_string();

        // Summary
        if self.analyze_enabled {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            if let Some(prior) = existing.filter(|p| {
                p.summary.is_some() && p.summary_model.as_deref() == Some(model.as_str())
            }) {
                paper.summary = prior.summary.clone();
                paper.summary_model = prior.summary_model.clone();
            } else if let Some(abstract_text) = paper.abstract_text.clone() {
                provider_calls += 1;
                match self
                    .provider
                    .summarize(&abstract_text, SummaryLevel::Standard, cancel)
                    .await
                {
                    Ok(summary) => {
                        paper.summary = Some(summary);
                        paper.summary_model = Some(model.clone());
                    }
                    Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                    Err(err) => failures.push(EnrichmentFailure::of(EnrichStep::Summary, &err)),
                }
            }
        }

        // Entities
        if self.analyze_enabled {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            if let Some(text) = self.entity_text(&paper, cancel).await? {
                provider_calls += 1;
                match self.provider.extract_entities(&text, cancel).await {
                    Ok(concepts) => {
                        mentions = concepts
                            .into_iter()
                            .map(|c| {
                                ConceptMention::new(Concept::new(c.name, c.kind), c.confidence)
                            })
                            .collect();
                    }
                    Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                    Err(err) => failures.push(EnrichmentFailure::of(EnrichStep::Entities, &err)),
                }
            }
        }

        // Citation labels
        let mut labeled = Vec::with_capacity(references.len());
        let mut label_failure_recorded = false;
        for reference in references {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let mut attrs = CitationAttrs {
                context: reference.context.clone(),
                ..Default::default()
            };
            if self.analyze_enabled {
                if let Some(context) = &reference.context {
                    provider_calls += 1;
                    match self.provider.classify_citation(context, cancel).await {
                        Ok(label) => {
                            attrs.intent = Some(label.intent);
                            attrs.position = Some(label.position);
                        }
                        Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                        Err(err) => {
                            if !label_failure_recorded {
                                failures.push(EnrichmentFailure::of(
                                    EnrichStep::CitationLabels,
                                    &err,
                                ));
                                label_failure_recorded = true;
                            }
                        }
                    }
                }
            }
            labeled.push(LabeledReference {
                dst: reference.id,
                attrs,
            });
        }

        // Embedding
        if self.embed_enabled {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let embed_model = self.provider.embedding_model_id().to_string();
            let already_current = existing
                .map(|p| p.embedding_model.as_deref() == Some(embed_model.as_str()))
                .unwrap_or(false);
            if already_current {
                paper.embedding_model = Some(embed_model.clone());
            } else if let Some(text) = paper.embed_text() {
                provider_calls += 1;
                match self.provider.embed(&text, cancel).await {
                    Ok(embedding) => {
                        paper.embedding = Some(embedding);
                        paper.embedding_model = Some(embed_model.clone());
                    }
                    Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                    Err(err) => failures.push(EnrichmentFailure::of(EnrichStep::Embedding, &err)),
                }
            }
        }

        Ok(Enrichment {
            paper,
            references: labeled,
            mentions,
            failures,
            provider_calls,
        })
    }

    /// Abstract, extended with full text when the extraction hook is
    /// configured.
    async fn entity_text(
        &self,
        paper: &Paper,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ProviderError> {
        let abstract_text = match &paper.abstract_text {
            Some(a) => a.clone(),
            None => return Ok(None),
        };
        if !self.use_full_text {
            return Ok(Some(abstract_text));
        }
        let extractor = match &self.extractor {
            Some(e) => e,
            None => return Ok(Some(abstract_text)),
        };
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        match extractor.full_text(&paper.id).await {
            Ok(Some(full)) => Ok(Some(format!("{}\n\n{}", abstract_text, full))),
            Ok(None) => Ok(Some(abstract_text)),
            Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
            // Full text is best-effort; the abstract always suffices.
            Err(_) => Ok(Some(abstract_text)),
        }
    }
}
