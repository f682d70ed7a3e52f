//! Analysis provider client
//!
//! LLM completions and embeddings behind one trait: summarization,
//! entity extraction, citation-intent classification, and dense
//! embeddings. The HTTP implementation speaks an Ollama-shaped API;
//! model output is requested as JSON and parsed strictly, so a malformed
//! completion becomes a typed error instead of a half-filled record.

use crate::cancel::CancellationToken;
use crate::client::{
    retry::with_retries, ErrorCounters, ProviderError, RetryPolicy, TokenBucket,
};
use crate::model::{CitationIntent, CitationPosition, ConceptKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How compressed a summary should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLevel {
    Brief,
    Standard,
    Detailed,
}

impl SummaryLevel {
    fn instruction(&self) -> &'static str {
        match self {
            Self::Brief => "Summarize the following paper abstract in one sentence.",
            Self::Standard => {
                "Summarize the following paper abstract in one short paragraph, \
                 covering the problem, the approach, and the main result."
            }
            Self::Detailed => {
                "Summarize the following paper abstract in detail: the problem, \
                 prior work it builds on, the approach, the main results, and \
                 their significance."
            }
        }
    }
}

/// A concept returned by entity extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedConcept {
    pub name: String,
    pub kind: ConceptKind,
    pub confidence: Option<f32>,
}

/// Intent and position labels for one citation context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CitationLabel {
    pub intent: CitationIntent,
    pub position: CitationPosition,
}

/// LLM-backed analysis operations.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Identifier of the underlying completion model; stored alongside
    /// summaries so a model change invalidates them.
    fn model_id(&self) -> &str;

    /// Identifier of the embedding model; recorded at the vector
    /// collection level. Defaults to the completion model id.
    fn embedding_model_id(&self) -> &str {
        self.model_id()
    }

    async fn summarize(
        &self,
        text: &str,
        level: SummaryLevel,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    async fn extract_entities(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedConcept>, ProviderError>;

    async fn classify_citation(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<CitationLabel, ProviderError>;

    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError>;
}

#[async_trait]
impl AnalysisProvider for Arc<dyn AnalysisProvider> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn embedding_model_id(&self) -> &str {
        (**self).embedding_model_id()
    }

    async fn summarize(
        &self,
        text: &str,
        level: SummaryLevel,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        (**self).summarize(text, level, cancel).await
    }

    async fn extract_entities(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedConcept>, ProviderError> {
        (**self).extract_entities(text, cancel).await
    }

    async fn classify_citation(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<CitationLabel, ProviderError> {
        (**self).classify_citation(context, cancel).await
    }

    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>, ProviderError> {
        (**self).embed(text, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Wire schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct WireConcept {
    name: String,
    kind: Option<String>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct WireConceptList {
    #[serde(default)]
    concepts: Vec<WireConcept>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    intent: String,
    position: Option<String>,
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for an Ollama-shaped analysis endpoint.
pub struct HttpAnalysisClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: String,
}

impl HttpAnalysisClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        embedding_model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("citegraph/0.1")
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            embedding_model: embedding_model.into(),
        })
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(ProviderError::Overloaded);
        }
        if status.is_client_error() {
            return Err(ProviderError::InvalidInput(format!("status {}", status)));
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!("status {}", status)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }

    async fn generate(&self, prompt: String, json: bool) -> Result<String, ProviderError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: if json { Some("json") } else { None },
        };
        let response: GenerateResponse = self.post_json("/api/generate", &request).await?;
        Ok(response.response)
    }
}

fn check_text(text: &str) -> Result<(), ProviderError> {
    if text.trim().is_empty() {
        return Err(ProviderError::InvalidInput("empty text".into()));
    }
    Ok(())
}

/// Parse the JSON body of an entity-extraction completion.
fn parse_concepts(body: &str) -> Result<Vec<ExtractedConcept>, ProviderError> {
    let list: WireConceptList =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    Ok(list
        .concepts
        .into_iter()
        .filter(|c| !c.name.trim().is_empty())
        .map(|c| ExtractedConcept {
            name: c.name.trim().to_string(),
            kind: c.kind.as_deref().map(ConceptKind::parse).unwrap_or(ConceptKind::Other),
            confidence: c.confidence.map(|v| v.clamp(0.0, 1.0)),
        })
        .collect())
}

/// Parse the JSON body of a citation-classification completion.
fn parse_label(body: &str) -> Result<CitationLabel, ProviderError> {
    let wire: WireLabel =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    Ok(CitationLabel {
        intent: CitationIntent::parse(&wire.intent),
        position: wire
            .position
            .as_deref()
            .map(CitationPosition::parse)
            .unwrap_or(CitationPosition::Other),
    })
}

#[async_trait]
impl AnalysisProvider for HttpAnalysisClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embedding_model_id(&self) -> &str {
        &self.embedding_model
    }

    async fn summarize(
        &self,
        text: &str,
        level: SummaryLevel,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        check_text(text)?;
        let prompt = format!("{}\n\n{}", level.instruction(), text);
        let summary = self.generate(prompt, false).await?;
        if summary.trim().is_empty() {
            return Err(ProviderError::Malformed("empty summary".into()));
        }
        Ok(summary.trim().to_string())
    }

    async fn extract_entities(
        &self,
        text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedConcept>, ProviderError> {
        check_text(text)?;
        let prompt = format!(
            "Extract the scientific concepts from the following text. Respond with JSON: \
             {{\"concepts\": [{{\"name\": str, \"kind\": one of \
             method|theorem|dataset|equation|constant|conjecture|other, \
             \"confidence\": float}}]}}\n\n{}",
            text
        );
        let body = self.generate(prompt, true).await?;
        parse_concepts(&body)
    }

    async fn classify_citation(
        &self,
        context: &str,
        _cancel: &CancellationToken,
    ) -> Result<CitationLabel, ProviderError> {
        check_text(context)?;
        let prompt = format!(
            "Classify the citation in the following sentence. Respond with JSON: \
             {{\"intent\": one of method|background|result|critique|extension|unknown, \
             \"position\": one of abstract|introduction|methods|results|discussion|other}}\n\n{}",
            context
        );
        let body = self.generate(prompt, true).await?;
        parse_label(&body)
    }

    async fn embed(
        &self,
        text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError> {
        check_text(text)?;
        let request = EmbedRequest {
            model: &self.embedding_model,
            prompt: text.to_string(),
        };
        let response: EmbedResponse = self.post_json("/api/embeddings", &request).await?;
        if response.embedding.is_empty() {
            return Err(ProviderError::Malformed("empty embedding".into()));
        }
        Ok(response.embedding)
    }
}

// ---------------------------------------------------------------------------
// Rate-limiting decorator
// ---------------------------------------------------------------------------

/// Wraps any analysis provider with the shared token bucket, retry
/// policy, and error counters.
pub struct RateLimitedAnalysis<P> {
    inner: P,
    bucket: Arc<TokenBucket>,
    policy: RetryPolicy,
    counters: Arc<ErrorCounters>,
}

impl<P: AnalysisProvider> RateLimitedAnalysis<P> {
    pub fn new(
        inner: P,
        bucket: Arc<TokenBucket>,
        policy: RetryPolicy,
        counters: Arc<ErrorCounters>,
    ) -> Self {
        Self {
            inner,
            bucket,
            policy,
            counters,
        }
    }
}

#[async_trait]
impl<P: AnalysisProvider> AnalysisProvider for RateLimitedAnalysis<P> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn embedding_model_id(&self) -> &str {
        self.inner.embedding_model_id()
    }

    async fn summarize(
        &self,
        text: &str,
        level: SummaryLevel,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        with_retries(
            "analysis",
            &self.policy,
            &self.bucket,
            &self.counters,
            cancel,
            || self.inner.summarize(text, level, cancel),
        )
        .await
    }

    async fn extract_entities(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedConcept>, ProviderError> {
        with_retries(
            "analysis",
            &self.policy,
            &self.bucket,
            &self.counters,
            cancel,
            || self.inner.extract_entities(text, cancel),
        )
        .await
    }

    async fn classify_citation(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<CitationLabel, ProviderError> {
        with_retries(
            "analysis",
            &self.policy,
            &self.bucket,
            &self.counters,
            cancel,
            || self.inner.classify_citation(context, cancel),
        )
        .await
    }

    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError> {
        with_retries(
            "analysis",
            &self.policy,
            &self.bucket,
            &self.counters,
            cancel,
            || self.inner.embed(text, cancel),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Primary/fallback failover
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum FailoverState {
    Primary,
    /// Primary started returning Overloaded at this instant.
    Degrading(Instant),
    /// Routing to the fallback since this instant.
    Fallback(Instant),
}

/// Routes analysis calls to a primary provider, falling back only when
/// the primary has been overloaded for longer than `budget_window`.
///
/// While in fallback, the primary is probed again after each window
/// elapses; a successful probe restores it.
pub struct FailoverAnalysis {
    primary: Arc<dyn AnalysisProvider>,
    fallback: Arc<dyn AnalysisProvider>,
    budget_window: Duration,
    state: Mutex<FailoverState>,
}

impl FailoverAnalysis {
    pub fn new(
        primary: Arc<dyn AnalysisProvider>,
        fallback: Arc<dyn AnalysisProvider>,
        budget_window: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            budget_window,
            state: Mutex::new(FailoverState::Primary),
        }
    }

    /// Decide which provider serves this call.
    fn route(&self) -> Arc<dyn AnalysisProvider> {
        let state = *self.state.lock().unwrap();
        match state {
            FailoverState::Primary | FailoverState::Degrading(_) => self.primary.clone(),
            FailoverState::Fallback(since) => {
                if since.elapsed() > self.budget_window {
                    // Window elapsed: probe the primary again.
                    self.primary.clone()
                } else {
                    self.fallback.clone()
                }
            }
        }
    }

    fn is_primary(&self, chosen: &Arc<dyn AnalysisProvider>) -> bool {
        Arc::ptr_eq(chosen, &self.primary)
    }

    fn note_result(&self, was_primary: bool, result: &Result<(), ()>, overloaded: bool) {
        if !was_primary {
            return;
        }
        let mut state = self.state.lock().unwrap();
        match (*state, result, overloaded) {
            (_, Ok(()), _) => *state = FailoverState::Primary,
            (FailoverState::Primary, Err(()), true) => {
                *state = FailoverState::Degrading(Instant::now());
            }
            (FailoverState::Degrading(since), Err(()), true) => {
                if since.elapsed() > self.budget_window {
                    *state = FailoverState::Fallback(Instant::now());
                }
            }
            (FailoverState::Fallback(_), Err(()), true) => {
                // Failed probe: restart the fallback window.
                *state = FailoverState::Fallback(Instant::now());
            }
            _ => {}
        }
    }

    async fn call<T, F, Fut>(&self, f: F) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn AnalysisProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let chosen = self.route();
        let was_primary = self.is_primary(&chosen);
        let result = f(chosen).await;
        match &result {
            Ok(_) => self.note_result(was_primary, &Ok(()), false),
            Err(e) => self.note_result(
                was_primary,
                &Err(()),
                matches!(e, ProviderError::Overloaded),
            ),
        }
        // A primary Overloaded inside the window surfaces as-is; callers
        // treat it like any other per-item failure until failover engages.
        result
    }
}

#[async_trait]
impl AnalysisProvider for FailoverAnalysis {
    fn model_id(&self) -> &str {
        self.primary.model_id()
    }

    fn embedding_model_id(&self) -> &str {
        self.primary.embedding_model_id()
    }

    async fn summarize(
        &self,
        text: &str,
        level: SummaryLevel,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.call(|p| async move { p.summarize(text, level, cancel).await })
            .await
    }

    async fn extract_entities(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedConcept>, ProviderError> {
        self.call(|p| async move { p.extract_entities(text, cancel).await })
            .await
    }

    async fn classify_citation(
        &self,
        context: &str,
        cancel: &CancellationToken,
    ) -> Result<CitationLabel, ProviderError> {
        self.call(|p| async move { p.classify_citation(context, cancel).await })
            .await
    }

    async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError> {
        self.call(|p| async move { p.embed(text, cancel).await }).await
    }
}
