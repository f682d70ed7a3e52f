//! Concept nodes extracted from paper text

use serde::{Deserialize, Serialize};

/// What kind of scientific entity a concept is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConceptKind {
    Method,
    Theorem,
    Dataset,
    Equation,
    Constant,
    Conjecture,
    Other,
}

impl ConceptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Method => "method",
            Self::Theorem => "theorem",
            Self::Dataset => "dataset",
            Self::Equation => "equation",
            Self::Constant => "constant",
            Self::Conjecture => "conjecture",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "method" | "algorithm" | "framework" => Self::Method,
            "theorem" | "lemma" => Self::Theorem,
            "dataset" => Self::Dataset,
            "equation" => Self::Equation,
            "constant" => Self::Constant,
            "conjecture" => Self::Conjecture,
            _ => Self::Other,
        }
    }
}

/// Normalize a concept name for identity comparison: lowercase with
/// whitespace collapsed to single spaces.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A scientific concept mentioned by papers.
///
/// Uniqueness key: `(normalize_name(name), kind)`. The display name keeps
/// the casing of the first observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub name: String,
    pub kind: ConceptKind,
    pub embedding: Option<Vec<f32>>,
}

impl Concept {
    pub fn new(name: impl Into<String>, kind: ConceptKind) -> Self {
        Self {
            name: name.into(),
            kind,
            embedding: None,
        }
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

/// A concept observed in one paper, with extraction confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMention {
    pub concept: Concept,
    pub confidence: Option<f32>,
}

impl ConceptMention {
    pub fn new(concept: Concept, confidence: Option<f32>) -> Self {
        Self { concept, confidence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  Yang-Mills   Theory "), "yang-mills theory");
        assert_eq!(normalize_name("AdS/CFT"), "ads/cft");
    }

    #[test]
    fn kind_parse_maps_aliases() {
        assert_eq!(ConceptKind::parse("Algorithm"), ConceptKind::Method);
        assert_eq!(ConceptKind::parse("lemma"), ConceptKind::Theorem);
        assert_eq!(ConceptKind::parse("widget"), ConceptKind::Other);
    }

    #[test]
    fn concepts_with_same_normalized_name_share_identity() {
        let a = Concept::new("Monte Carlo", ConceptKind::Method);
        let b = Concept::new("monte  carlo", ConceptKind::Method);
        assert_eq!(a.normalized_name(), b.normalized_name());
    }
}
