//! Metadata provider client
//!
//! Fetches paper records, reference lists, and citation lists from a
//! Semantic-Scholar-shaped HTTP API. Responses are parsed into typed
//! records at this boundary; nothing loosely structured escapes.

use crate::cancel::CancellationToken;
use crate::client::{
    retry::with_retries, ErrorCounters, ProviderError, RequestCache, RetryPolicy, TokenBucket,
};
use crate::model::{Paper, PaperId};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A metadata-resolved paper record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: PaperId,
    pub title: String,
    pub abstract_text: Option<String>,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub published_date: Option<NaiveDate>,
    pub citation_count: Option<u64>,
    pub tl_dr: Option<String>,
}

impl PaperRecord {
    /// Fold this record into a paper, creating it if needed.
    pub fn into_paper(self) -> Paper {
        let mut paper = Paper::stub(self.id);
        paper.title = Some(self.title);
        paper.abstract_text = self.abstract_text;
        paper.authors = self.authors;
        paper.categories = self.categories;
        paper.published_date = self.published_date;
        paper.citation_count = self.citation_count;
        paper.tl_dr = self.tl_dr;
        paper
    }
}

/// One entry of a reference or citation list: the other endpoint plus the
/// citing sentence when the provider has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRef {
    pub id: PaperId,
    pub context: Option<String>,
}

/// One page of a cursored listing. `next` is the cursor for the following
/// page, absent on the last one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<u64>,
}

/// Read access to the external paper-metadata source.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn get_paper(
        &self,
        id: &PaperId,
        cancel: &CancellationToken,
    ) -> Result<PaperRecord, ProviderError>;

    /// Outgoing edges: papers this paper cites.
    async fn get_references(
        &self,
        id: &PaperId,
        cursor: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError>;

    /// Incoming edges: papers citing this paper.
    async fn get_citations(
        &self,
        id: &PaperId,
        cursor: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError>;
}

// ---------------------------------------------------------------------------
// Wire schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireAuthor {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTldr {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireExternalIds {
    #[serde(rename = "ArXiv")]
    arxiv: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePaper {
    #[serde(rename = "paperId")]
    paper_id: Option<String>,
    #[serde(rename = "externalIds")]
    external_ids: Option<WireExternalIds>,
    title: Option<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    authors: Vec<WireAuthor>,
    #[serde(rename = "fieldsOfStudy")]
    fields_of_study: Option<Vec<String>>,
    #[serde(rename = "publicationDate")]
    publication_date: Option<String>,
    year: Option<i32>,
    #[serde(rename = "citationCount")]
    citation_count: Option<u64>,
    tldr: Option<WireTldr>,
}

impl WirePaper {
    /// Prefer the arXiv-style id; fall back to the provider's own id.
    fn resolved_id(&self) -> Option<PaperId> {
        self.external_ids
            .as_ref()
            .and_then(|e| e.arxiv.as_ref())
            .map(|s| PaperId::new(s.trim_start_matches("arXiv:")))
            .or_else(|| self.paper_id.as_ref().map(|s| PaperId::new(s.clone())))
    }

    fn into_record(self, fallback_id: &PaperId) -> Result<PaperRecord, ProviderError> {
        let title = self
            .title
            .clone()
            .ok_or_else(|| ProviderError::Malformed("paper record missing title".into()))?;
        let published_date = match &self.publication_date {
            Some(s) => Some(
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| ProviderError::Malformed(format!("bad publicationDate: {}", e)))?,
            ),
            None => self.year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)),
        };
        let id = self.resolved_id().unwrap_or_else(|| fallback_id.clone());
        Ok(PaperRecord {
            id,
            title,
            abstract_text: self.abstract_text,
            authors: self.authors.into_iter().filter_map(|a| a.name).collect(),
            categories: self.fields_of_study.unwrap_or_default(),
            published_date,
            citation_count: self.citation_count,
            tl_dr: self.tldr.and_then(|t| t.text),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireLinkedPaper {
    #[serde(rename = "citedPaper")]
    cited: Option<WirePaper>,
    #[serde(rename = "citingPaper")]
    citing: Option<WirePaper>,
    #[serde(default)]
    contexts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireLinkPage {
    #[serde(default)]
    data: Vec<WireLinkedPaper>,
    next: Option<u64>,
}

const PAPER_FIELDS: &str =
    "paperId,externalIds,title,abstract,authors,fieldsOfStudy,publicationDate,year,citationCount,tldr";
const LINK_FIELDS: &str = "paperId,externalIds,contexts";

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// HTTP client for the metadata provider.
///
/// Issues single requests and parses; rate limiting and retries live in
/// [`RateLimitedMetadata`]. Paper lookups go through an explicit TTL
/// cache keyed by the request fingerprint.
pub struct HttpMetadataClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    page_size: usize,
    cache: RequestCache,
    cache_ttl: Duration,
}

impl HttpMetadataClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("citegraph/0.1")
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            page_size: 100,
            cache: RequestCache::new(2048),
            cache_ttl: Duration::from_secs(3600),
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ProviderError> {
        let mut request = self.http.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(url.to_string()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
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

    fn check_id(id: &PaperId) -> Result<(), ProviderError> {
        if id.as_str().trim().is_empty() {
            return Err(ProviderError::InvalidId(id.to_string()));
        }
        Ok(())
    }

    fn link_page(&self, body: WireLinkPage) -> Page<CitationRef> {
        let items = body
            .data
            .into_iter()
            .filter_map(|entry| {
                let context = entry.contexts.first().cloned();
                let wire = entry.cited.or(entry.citing)?;
                let id = wire.resolved_id()?;
                Some(CitationRef { id, context })
            })
            .collect();
        Page { items, next: body.next }
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataClient {
    async fn get_paper(
        &self,
        id: &PaperId,
        _cancel: &CancellationToken,
    ) -> Result<PaperRecord, ProviderError> {
        Self::check_id(id)?;
        let url = format!("{}/paper/{}?fields={}", self.base_url, id, PAPER_FIELDS);
        let key = format!("paper:{}", id);
        self.cache
            .get_or_compute(&key, self.cache_ttl, async {
                let wire: WirePaper = self.get_json(&url).await?;
                wire.into_record(id)
            })
            .await
    }

    async fn get_references(
        &self,
        id: &PaperId,
        cursor: Option<u64>,
        _cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError> {
        Self::check_id(id)?;
        let url = format!(
            "{}/paper/{}/references?fields={}&offset={}&limit={}",
            self.base_url,
            id,
            LINK_FIELDS,
            cursor.unwrap_or(0),
            self.page_size
        );
        let body: WireLinkPage = self.get_json(&url).await?;
        Ok(self.link_page(body))
    }

    async fn get_citations(
        &self,
        id: &PaperId,
        cursor: Option<u64>,
        _cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError> {
        Self::check_id(id)?;
        let url = format!(
            "{}/paper/{}/citations?fields={}&offset={}&limit={}",
            self.base_url,
            id,
            LINK_FIELDS,
            cursor.unwrap_or(0),
            self.page_size
        );
        let body: WireLinkPage = self.get_json(&url).await?;
        Ok(self.link_page(body))
    }
}

// ---------------------------------------------------------------------------
// Rate-limiting decorator
// ---------------------------------------------------------------------------

/// Wraps any metadata provider with the shared token bucket, retry
/// policy, and error counters.
pub struct RateLimitedMetadata<P> {
    inner: P,
    bucket: Arc<TokenBucket>,
    policy: RetryPolicy,
    counters: Arc<ErrorCounters>,
}

impl<P: MetadataProvider> RateLimitedMetadata<P> {
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
impl<P: MetadataProvider> MetadataProvider for RateLimitedMetadata<P> {
    async fn get_paper(
        &self,
        id: &PaperId,
        cancel: &CancellationToken,
    ) -> Result<PaperRecord, ProviderError> {
        with_retries(
            "metadata",
            &self.policy,
            &self.bucket,
            &self.counters,
            cancel,
            || self.inner.get_paper(id, cancel),
        )
        .await
    }

    async fn get_references(
        &self,
        id: &PaperId,
        cursor: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError> {
        with_retries(
            "metadata",
            &self.policy,
            &self.bucket,
            &self.counters,
            cancel,
            || self.inner.get_references(id, cursor, cancel),
        )
        .await
    }

    async fn get_citations(
        &self,
        id: &PaperId,
        cursor: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Page<CitationRef>, ProviderError> {
        with_retries(
            "metadata",
            &self.policy,
            &self.bucket,
            &self.counters,
            cancel,
            || self.inner.get_citations(id, cursor, cancel),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn wire_paper_prefers_arxiv_id() {
        let wire: WirePaper = serde_json::from_value(serde_json::json!({
            "paperId": "s2-opaque-id",
            "externalIds": {"ArXiv": "2401.00001"},
            "title": "Gauge Fields",
            "abstract": "We study gauge fields.",
            "authors": [{"name": "A. Noether"}],
            "fieldsOfStudy": ["hep-th"],
            "publicationDate": "2024-01-15",
            "citationCount": 12,
            "tldr": {"text": "Short version."}
        }))
        .unwrap();
        let record = wire.into_record(&PaperId::from("fallback")).unwrap();
        assert_eq!(record.id.as_str(), "2401.00001");
        assert_eq!(record.title, "Gauge Fields");
        assert_eq!(record.authors, vec!["A. Noether"]);
        assert_eq!(record.published_date, NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(record.citation_count, Some(12));
        assert_eq!(record.tl_dr.as_deref(), Some("Short version."));
    }

    #[test]
    fn wire_paper_without_title_is_malformed() {
        let wire: WirePaper =
            serde_json::from_value(serde_json::json!({"paperId": "x"})).unwrap();
        let err = wire.into_record(&PaperId::from("x")).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn wire_paper_year_fallback_when_no_date() {
        let wire: WirePaper = serde_json::from_value(serde_json::json!({
            "paperId": "x",
            "title": "Untitled",
            "year": 2019
        }))
        .unwrap();
        let record = wire.into_record(&PaperId::from("x")).unwrap();
        assert_eq!(record.published_date, NaiveDate::from_ymd_opt(2019, 1, 1));
    }

    #[test]
    fn link_page_skips_entries_without_ids() {
        let body: WireLinkPage = serde_json::from_value(serde_json::json!({
            "data": [
                {"citedPaper": {"externalIds": {"ArXiv": "P1"}}, "contexts": ["as shown in [3]"]},
                {"citedPaper": {}},
                {"citingPaper": {"paperId": "s2-77"}}
            ],
            "next": 100
        }))
        .unwrap();
        let client = HttpMetadataClient::new("http://localhost:9", None).unwrap();
        let page = client.link_page(body);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id.as_str(), "P1");
        assert_eq!(page.items[0].context.as_deref(), Some("as shown in [3]"));
        assert_eq!(page.items[1].id.as_str(), "s2-77");
        assert_eq!(page.next, Some(100));
    }

    /// Provider that fails a scripted number of times before succeeding.
    struct FlakyProvider {
        failures: Mutex<u32>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MetadataProvider for FlakyProvider {
        async fn get_paper(
            &self,
            id: &PaperId,
            _cancel: &CancellationToken,
        ) -> Result<PaperRecord, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ProviderError::RateLimited { retry_after: None });
            }
            Ok(PaperRecord {
                id: id.clone(),
                title: "t".into(),
                abstract_text: None,
                authors: vec![],
                categories: vec![],
                published_date: None,
                citation_count: None,
                tl_dr: None,
            })
        }

        async fn get_references(
            &self,
            _id: &PaperId,
            _cursor: Option<u64>,
            _cancel: &CancellationToken,
        ) -> Result<Page<CitationRef>, ProviderError> {
            Ok(Page { items: vec![], next: None })
        }

        async fn get_citations(
            &self,
            _id: &PaperId,
            _cursor: Option<u64>,
            _cancel: &CancellationToken,
        ) -> Result<Page<CitationRef>, ProviderError> {
            Ok(Page { items: vec![], next: None })
        }
    }

    #[tokio::test]
    async fn decorator_retries_rate_limits_and_counts_them() {
        let provider = FlakyProvider {
            failures: Mutex::new(3),
            calls: AtomicU32::new(0),
        };
        let counters = Arc::new(ErrorCounters::new());
        let decorated = RateLimitedMetadata::new(
            provider,
            Arc::new(TokenBucket::new(100.0, 100.0, Duration::from_secs(1))),
            RetryPolicy {
                max_attempts: 10,
                base: Duration::from_millis(1),
                factor: 1.0,
                cap: Duration::from_millis(2),
                jitter: 0.0,
            },
            counters.clone(),
        );

        let cancel = CancellationToken::new();
        let record = decorated
            .get_paper(&PaperId::from("2401.00001"), &cancel)
            .await
            .unwrap();
        assert_eq!(record.id.as_str(), "2401.00001");
        assert_eq!(decorated.inner.calls.load(Ordering::SeqCst), 4);
        assert_eq!(counters.get("metadata", "rate_limited"), 3);
    }
}
