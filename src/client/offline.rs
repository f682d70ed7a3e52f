//! Offline analysis provider
//!
//! Heuristic fallback when no LLM endpoint is reachable (or wanted):
//! pattern-based entity extraction, extractive summaries, keyword-cued
//! citation labels, and a deterministic hashed embedding. Quality is
//! deliberately below the LLM path; the point is that an air-gapped run
//! still produces a searchable store with the same shapes.

use crate::cancel::CancellationToken;
use crate::client::{
    AnalysisProvider, CitationLabel, ExtractedConcept, ProviderError, SummaryLevel,
};
use crate::model::{normalize_name, CitationIntent, CitationPosition, ConceptKind};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;

/// Pattern-based analysis provider. Every operation is local and
/// infallible apart from empty input.
pub struct OfflineAnalysis {
    dimension: usize,
    numbered_theorem: Regex,
    named_theorem: Regex,
    named_equation: Regex,
    named_constant: Regex,
}

impl OfflineAnalysis {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            // "Theorem 3.1", "Lemma 2" and friends.
            numbered_theorem: Regex::new(
                r"(?i)(?:Theorem|Lemma|Proposition|Corollary)\s+(\d+(?:\.\d+)*)",
            )
            .unwrap(),
            // "the Atiyah-Singer theorem", "Goldbach conjecture".
            named_theorem: Regex::new(
                r"([A-Z][a-z]+(?:[-\s][A-Z][a-z]+)*)\s+((?i:theorem|lemma|conjecture))",
            )
            .unwrap(),
            // "the Schrödinger equation", "Einstein field equation".
            named_equation: Regex::new(
                r"([A-Z][a-zäöü]+(?:[-\s][A-Z][a-z]+)*)\s+(?i:equations?)",
            )
            .unwrap(),
            named_constant: Regex::new(
                r"(?i)(?:Planck|Boltzmann|fine[- ]structure|gravitational|cosmological)\s+constant",
            )
            .unwrap(),
        }
    }

    fn sentences(text: &str) -> Vec<&str> {
        text.split_inclusive(['.', '!', '?'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn check_text(text: &str) -> Result<(), ProviderError> {
    if text.trim().is_empty() {
        return Err(ProviderError::InvalidInput("empty text".into()));
    }
    Ok(())
}

#[async_trait]
impl AnalysisProvider for OfflineAnalysis {
    fn model_id(&self) -> &str {
        "offline-heuristic-v1"
    }

    fn embedding_model_id(&self) -> &str {
        "offline-hash-v1"
    }

    /// Extractive summary: the leading sentences of the text, one for
    /// brief, three for standard, five for detailed.
    async fn summarize(
        &self,
        text: &str,
        level: SummaryLevel,
        _cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        check_text(text)?;
        let keep = match level {
            SummaryLevel::Brief => 1,
            SummaryLevel::Standard => 3,
            SummaryLevel::Detailed => 5,
        };
        Ok(Self::sentences(text)
            .into_iter()
            .take(keep)
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Pattern-matched theorems, named equations, and physical
    /// constants. Misses anything the patterns do not cover; confidence
    /// reflects that.
    async fn extract_entities(
        &self,
        text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedConcept>, ProviderError> {
        check_text(text)?;
        let mut concepts = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |name: String, kind: ConceptKind, confidence: f32| {
            if seen.insert(format!("{}/{}", normalize_name(&name), kind.as_str())) {
                concepts.push(ExtractedConcept {
                    name,
                    kind,
                    confidence: Some(confidence),
                });
            }
        };

        for m in self.numbered_theorem.captures_iter(text) {
            push(format!("Theorem {}", &m[1]), ConceptKind::Theorem, 0.9);
        }
        for m in self.named_theorem.captures_iter(text) {
            let kind = if m[2].eq_ignore_ascii_case("conjecture") {
                ConceptKind::Conjecture
            } else {
                ConceptKind::Theorem
            };
            push(format!("{} {}", &m[1], m[2].to_lowercase()), kind, 0.85);
        }
        for m in self.named_equation.captures_iter(text) {
            push(format!("{} equation", &m[1]), ConceptKind::Equation, 0.85);
        }
        for m in self.named_constant.find_iter(text) {
            push(m.as_str().to_string(), ConceptKind::Constant, 0.9);
        }
        Ok(concepts)
    }

    /// Keyword cues decide the intent; anything without a cue is
    /// background, matching how human annotators label the bulk of
    /// citations.
    async fn classify_citation(
        &self,
        context: &str,
        _cancel: &CancellationToken,
    ) -> Result<CitationLabel, ProviderError> {
        check_text(context)?;
        let lower = context.to_lowercase();
        let has = |cues: &[&str]| cues.iter().any(|c| lower.contains(c));

        let intent = if has(&["extend", "generaliz", "build on", "builds on"]) {
            CitationIntent::Extension
        } else if has(&["method", "technique", "algorithm", "procedure", "following", "using the"])
        {
            CitationIntent::Method
        } else if has(&["refute", "challenge", "dispute", "contrary to", "disagree"]) {
            CitationIntent::Critique
        } else if has(&["result", "agree", "consistent with", "compare", "reproduce"]) {
            CitationIntent::Result
        } else {
            CitationIntent::Background
        };

        Ok(CitationLabel {
            intent,
            position: CitationPosition::Other,
        })
    }

    /// Deterministic bag-of-words hash embedding: each token bumps a
    /// dimension picked by its hash. Identical texts embed identically;
    /// token overlap yields cosine similarity.
    async fn embed(
        &self,
        text: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<f32>, ProviderError> {
        check_text(text)?;
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
            if token.is_empty() {
                continue;
            }
            let hash = token
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }
        Ok(vector)
    }
}
