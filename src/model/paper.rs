//! Paper and citation-edge types

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable external identifier for a paper (arXiv-style, e.g. "2401.12345").
///
/// The uniqueness key for papers throughout the system: the graph store,
/// the vector store, and the frontier all key on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaperId(String);

impl PaperId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PaperId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PaperId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A paper node.
///
/// Created the first time an id is observed; every other attribute is
/// optional because metadata resolution and enrichment fill them in later.
/// A paper holding only its id is a stub satisfying an edge endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: PaperId,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub published_date: Option<NaiveDate>,
    pub citation_count: Option<u64>,
    pub tl_dr: Option<String>,
    pub summary: Option<String>,
    /// Model that produced `summary`; a newer model id invalidates it.
    pub summary_model: Option<String>,
    pub embedding: Option<Vec<f32>>,
    /// Model that produced `embedding`.
    pub embedding_model: Option<String>,
}

impl Paper {
    /// A paper carrying only its id, created to satisfy an edge endpoint.
    pub fn stub(id: PaperId) -> Self {
        Self {
            id,
            title: None,
            abstract_text: None,
            authors: Vec::new(),
            categories: Vec::new(),
            published_date: None,
            citation_count: None,
            tl_dr: None,
            summary: None,
            summary_model: None,
            embedding: None,
            embedding_model: None,
        }
    }

    /// True if metadata has never been resolved for this paper.
    pub fn is_stub(&self) -> bool {
        self.title.is_none() && self.abstract_text.is_none()
    }

    /// First category, projected into the vector store for filtering.
    pub fn primary_category(&self) -> Option<&str> {
        self.categories.first().map(|s| s.as_str())
    }

    /// Publication year, projected into the vector store for filtering.
    pub fn year(&self) -> Option<i32> {
        use chrono::Datelike;
        self.published_date.map(|d| d.year())
    }

    /// Text used for the paper's dense embedding: title plus abstract.
    pub fn embed_text(&self) -> Option<String> {
        match (&self.title, &self.abstract_text) {
            (Some(t), Some(a)) => Some(format!("{}\n\n{}", t, a)),
            (Some(t), None) => Some(t.clone()),
            (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        }
    }
}

/// Why a paper cites another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationIntent {
    Method,
    Background,
    Result,
    Critique,
    Extension,
    Unknown,
}

impl CitationIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Background => "background",
            Self::Result => "result",
            Self::Critique => "critique",
            Self::Extension => "extension",
            Self::Unknown => "unknown",
        }
    }

    /// Lenient parse: classifier output that isn't a known label maps to
    /// `Unknown` rather than failing the whole edge.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "method" => Self::Method,
            "background" => Self::Background,
            "result" => Self::Result,
            "critique" => Self::Critique,
            "extension" => Self::Extension,
            _ => Self::Unknown,
        }
    }
}

/// Where in the citing paper the citation appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationPosition {
    Abstract,
    Introduction,
    Methods,
    Results,
    Discussion,
    Other,
}

impl CitationPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abstract => "abstract",
            Self::Introduction => "introduction",
            Self::Methods => "methods",
            Self::Results => "results",
            Self::Discussion => "discussion",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "abstract" => Self::Abstract,
            "introduction" => Self::Introduction,
            "methods" => Self::Methods,
            "results" => Self::Results,
            "discussion" => Self::Discussion,
            _ => Self::Other,
        }
    }
}

/// Attributes carried by a citation upsert.
///
/// All fields are optional: an upsert with `None` never clears an
/// attribute already present on the edge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationAttrs {
    pub intent: Option<CitationIntent>,
    pub position: Option<CitationPosition>,
    pub context: Option<String>,
}

/// A directed citation edge as stored: `src` cites `dst`.
///
/// At most one edge exists per (src, dst) pair; later observations merge
/// attributes but never duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationEdge {
    pub src: PaperId,
    pub dst: PaperId,
    pub intent: CitationIntent,
    pub position: CitationPosition,
    pub context: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_paper_has_only_id() {
        let p = Paper::stub(PaperId::from("2401.00001"));
        assert!(p.is_stub());
        assert!(p.embed_text().is_none());
        assert!(p.primary_category().is_none());
    }

    #[test]
    fn embed_text_joins_title_and_abstract() {
        let mut p = Paper::stub(PaperId::from("p"));
        p.title = Some("A Theorem".into());
        p.abstract_text = Some("We prove it.".into());
        assert_eq!(p.embed_text().unwrap(), "A Theorem\n\nWe prove it.");
        assert!(!p.is_stub());
    }

    #[test]
    fn intent_parse_is_lenient() {
        assert_eq!(CitationIntent::parse("Method"), CitationIntent::Method);
        assert_eq!(CitationIntent::parse(" extension "), CitationIntent::Extension);
        assert_eq!(CitationIntent::parse("novel"), CitationIntent::Unknown);
    }

    #[test]
    fn position_parse_is_lenient() {
        assert_eq!(CitationPosition::parse("Introduction"), CitationPosition::Introduction);
        assert_eq!(CitationPosition::parse("appendix"), CitationPosition::Other);
    }

    #[test]
    fn year_derives_from_published_date() {
        let mut p = Paper::stub(PaperId::from("p"));
        p.published_date = NaiveDate::from_ymd_opt(2024, 1, 15);
        assert_eq!(p.year(), Some(2024));
    }
}
