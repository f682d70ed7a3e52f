//! Read facade
//!
//! The single read surface over the two stores: paper lookup, paging,
//! semantic and hybrid search, citation neighborhoods, and cluster
//! listing. Query text is embedded once through the analysis provider;
//! everything else is served from the stores.

use super::clusters::{label_propagation, Cluster};
use crate::cancel::CancellationToken;
use crate::client::{AnalysisProvider, ProviderError};
use crate::model::{CitationEdge, Paper, PaperId};
use crate::store::{GraphStore, StoreError, VectorFilter, VectorStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Weight of vector similarity in the hybrid score; the rest is the
/// citation-derived influence term.
const HYBRID_SIMILARITY_WEIGHT: f32 = 0.7;

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Compact paper projection for listings and search results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperSummary {
    pub id: PaperId,
    pub title: Option<String>,
    pub primary_category: Option<String>,
    pub year: Option<i32>,
    pub citation_count: Option<u64>,
    pub tl_dr: Option<String>,
}

impl PaperSummary {
    fn of(paper: &Paper) -> Self {
        Self {
            id: paper.id.clone(),
            title: paper.title.clone(),
            primary_category: paper.primary_category().map(|s| s.to_string()),
            year: paper.year(),
            citation_count: paper.citation_count,
            tl_dr: paper.tl_dr.clone(),
        }
    }
}

/// Full paper view with optional edge lists.
#[derive(Debug, Clone, Serialize)]
pub struct PaperDetail {
    pub paper: Paper,
    pub citations: Vec<CitationEdge>,
    pub references: Vec<CitationEdge>,
}

/// One search result with its score in [0, 1].
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub summary: PaperSummary,
    pub score: f32,
}

/// Read-only operations over the completed store.
pub struct ReadFacade {
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
    analysis: Arc<dyn AnalysisProvider>,
}

impl ReadFacade {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        vector: Arc<dyn VectorStore>,
        analysis: Arc<dyn AnalysisProvider>,
    ) -> Self {
        Self {
            graph,
            vector,
            analysis,
        }
    }

    /// Fetch one paper with its edge lists as requested.
    pub fn get_paper(
        &self,
        id: &PaperId,
        include_citations: bool,
        include_references: bool,
    ) -> Result<Option<PaperDetail>, FacadeError> {
        let paper = match self.graph.get_paper(id)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let citations = if include_citations {
            self.graph.citations_to(id)?
        } else {
            Vec::new()
        };
        let references = if include_references {
            self.graph.citations_from(id)?
        } else {
            Vec::new()
        };
        Ok(Some(PaperDetail {
            paper,
            citations,
            references,
        }))
    }

    /// Page through paper summaries. `page` is 1-based.
    pub fn list_papers(
        &self,
        page: usize,
        page_size: usize,
        category: Option<&str>,
    ) -> Result<Vec<PaperSummary>, FacadeError> {
        let papers = self.graph.list_papers(page, page_size, category)?;
        Ok(papers.iter().map(PaperSummary::of).collect())
    }

    /// Embed the query once, then k-nearest-neighbor over the vector
    /// store. Scores are cosine similarity mapped into [0, 1].
    pub async fn semantic_search(
        &self,
        query_text: &str,
        limit: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<SearchHit>, FacadeError> {
        let cancel = CancellationToken::new();
        let query = self.analysis.embed(query_text, &cancel).await?;
        let hits = self.vector.knn(&query, limit, filter)?;
        self.resolve_hits(hits)
    }

    /// Semantic search re-scored by citation influence: the top 3×limit
    /// candidates by similarity are re-ranked by a convex combination of
    /// similarity and z-normalized citation count, then truncated.
    pub async fn hybrid_search(
        &self,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, FacadeError> {
        let cancel = CancellationToken::new();
        let query = self.analysis.embed(query_text, &cancel).await?;
        let candidates = self.vector.knn(&query, limit.saturating_mul(3), None)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut papers = Vec::with_capacity(candidates.len());
        for (id, score) in &candidates {
            if let Some(paper) = self.graph.get_paper(id)? {
                papers.push((paper, similarity_to_unit(*score)));
            }
        }

        let influence = influence_scores(&papers);
        let mut hits: Vec<SearchHit> = papers
            .iter()
            .map(|(paper, similarity)| {
                let combined = HYBRID_SIMILARITY_WEIGHT * similarity
                    + (1.0 - HYBRID_SIMILARITY_WEIGHT) * influence[&paper.id];
                SearchHit {
                    summary: PaperSummary::of(paper),
                    score: combined.clamp(0.0, 1.0),
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Papers close to a stored paper's embedding. The paper itself is
    /// excluded from the results.
    pub fn similar_papers(
        &self,
        id: &PaperId,
        limit: usize,
    ) -> Result<Vec<SearchHit>, FacadeError> {
        let hits = match self.vector.knn_by_id(id, limit + 1)? {
            Some(hits) => hits,
            None => return Ok(Vec::new()),
        };
        let hits: Vec<(PaperId, f32)> = hits
            .into_iter()
            .filter(|(other, _)| other != id)
            .take(limit)
            .collect();
        self.resolve_hits(hits)
    }

    /// BFS over citation edges up to `depth` hops.
    pub fn citation_neighborhood(
        &self,
        id: &PaperId,
        depth: usize,
    ) -> Result<(Vec<PaperSummary>, Vec<CitationEdge>), FacadeError> {
        let (papers, edges) = self.graph.neighborhood(id, depth)?;
        Ok((papers.iter().map(PaperSummary::of).collect(), edges))
    }

    /// Communities in the citation graph with at least `min_size`
    /// members, labeled by the modal member category.
    pub fn clusters(&self, min_size: usize) -> Result<Vec<Cluster>, FacadeError> {
        let adjacency = self.graph.citation_adjacency()?;
        let mut clusters = label_propagation(&adjacency, min_size);
        for cluster in &mut clusters {
            cluster.label = self.modal_category(&cluster.members)?;
        }
        Ok(clusters)
    }

    fn modal_category(&self, members: &[PaperId]) -> Result<Option<String>, FacadeError> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for id in members {
            if let Some(paper) = self.graph.get_paper(id)? {
                if let Some(category) = paper.primary_category() {
                    *counts.entry(category.to_string()).or_insert(0) += 1;
                }
            }
        }
        Ok(counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(category, _)| category))
    }

    fn resolve_hits(&self, hits: Vec<(PaperId, f32)>) -> Result<Vec<SearchHit>, FacadeError> {
        let mut resolved = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            if let Some(paper) = self.graph.get_paper(&id)? {
                resolved.push(SearchHit {
                    summary: PaperSummary::of(&paper),
                    score: similarity_to_unit(score),
                });
            }
        }
        Ok(resolved)
    }
}

/// Map cosine similarity from [-1, 1] into [0, 1].
fn similarity_to_unit(cosine: f32) -> f32 {
    ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Citation influence per candidate: z-normalize citation counts over
/// the candidate set, then squash through the logistic function so the
/// term is bounded like the similarity it is combined with.
fn influence_scores(papers: &[(Paper, f32)]) -> HashMap<PaperId, f32> {
    let counts: Vec<f32> = papers
        .iter()
        .map(|(p, _)| p.citation_count.unwrap_or(0) as f32)
        .collect();
    let n = counts.len() as f32;
    let mean = counts.iter().sum::<f32>() / n.max(1.0);
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f32>() / n.max(1.0);
    let stddev = variance.sqrt();

    papers
        .iter()
        .zip(counts.iter())
        .map(|((paper, _), count)| {
            let z = if stddev > 0.0 { (count - mean) / stddev } else { 0.0 };
            let squashed = 1.0 / (1.0 + (-z).exp());
            (paper.id.clone(), squashed)
        })
        .collect()
}
