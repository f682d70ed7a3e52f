//! Dual-store writer
//!
//! Coordinates writes across the graph and vector backends. Writes are
//! not a joint transaction: the graph goes first, and a vector failure
//! leaves the paper flagged embedding-pending for a later backfill pass.
//! Every operation is idempotent, so replaying after a crash converges.

use super::traits::{
    GraphOp, GraphStore, StoreError, StoreResult, VectorRecord, VectorStore,
};
use crate::model::{CitationAttrs, ConceptMention, Paper, PaperId};
use std::sync::Arc;

/// How a paper write landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Both stores hold the paper (or it carried no embedding).
    Complete,
    /// Graph persisted; the embedding write failed and was deferred.
    EmbeddingDeferred,
}

/// One mutation in a writer batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Paper(Paper),
    Citation {
        src: PaperId,
        dst: PaperId,
        attrs: CitationAttrs,
    },
    ConceptMentions {
        paper: PaperId,
        mentions: Vec<ConceptMention>,
    },
}

/// Result of a writer batch: which papers had their embedding deferred.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub deferred: Vec<PaperId>,
}

/// Idempotent upserts across the two storage backends.
pub struct StoreWriter {
    graph: Arc<dyn GraphStore>,
    vector: Arc<dyn VectorStore>,
}

impl StoreWriter {
    pub fn new(graph: Arc<dyn GraphStore>, vector: Arc<dyn VectorStore>) -> Self {
        Self { graph, vector }
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn vector(&self) -> &Arc<dyn VectorStore> {
        &self.vector
    }

    /// Upsert a paper node; if it carries an embedding, upsert the vector
    /// under the same id. Graph first, then vector.
    pub fn upsert_paper(&self, paper: &Paper) -> StoreResult<WriteOutcome> {
        self.graph.upsert_paper(paper)?;
        self.write_embedding(paper)
    }

    /// Upsert the (src, dst) citation edge, stubbing missing endpoints.
    /// Self-loops violate the edge invariant and are dropped.
    pub fn upsert_citation(
        &self,
        src: &PaperId,
        dst: &PaperId,
        attrs: &CitationAttrs,
    ) -> StoreResult<()> {
        if src == dst {
            tracing::debug!(paper = %src, "dropping self-citation");
            return Ok(());
        }
        self.graph.upsert_citation(src, dst, attrs)
    }

    /// Upsert each concept, then its mention edge.
    pub fn upsert_concept_mentions(
        &self,
        paper: &PaperId,
        mentions: &[ConceptMention],
    ) -> StoreResult<()> {
        for mention in mentions {
            self.graph.upsert_mention(paper, mention)?;
        }
        Ok(())
    }

    /// Apply a sequence of operations atomically per store: all graph
    /// mutations in one transaction, then the vector writes. A vector
    /// failure defers that paper's embedding instead of failing the batch.
    pub fn batch(&self, ops: &[WriteOp]) -> StoreResult<BatchOutcome> {
        let mut graph_ops = Vec::new();
        let mut embeddings: Vec<&Paper> = Vec::new();

        for op in ops {
            match op {
                WriteOp::Paper(paper) => {
                    graph_ops.push(GraphOp::UpsertPaper(paper.clone()));
                    if paper.embedding.is_some() {
                        embeddings.push(paper);
                    }
                }
                WriteOp::Citation { src, dst, attrs } => {
                    if src == dst {
                        tracing::debug!(paper = %src, "dropping self-citation");
                        continue;
                    }
                    graph_ops.push(GraphOp::UpsertCitation {
                        src: src.clone(),
                        dst: dst.clone(),
                        attrs: attrs.clone(),
                    });
                }
                WriteOp::ConceptMentions { paper, mentions } => {
                    for mention in mentions {
                        graph_ops.push(GraphOp::UpsertMention {
                            paper: paper.clone(),
                            mention: mention.clone(),
                        });
                    }
                }
            }
        }

        self.graph.apply_batch(&graph_ops)?;

        let mut outcome = BatchOutcome::default();
        for paper in embeddings {
            if self.write_embedding(paper)? == WriteOutcome::EmbeddingDeferred {
                outcome.deferred.push(paper.id.clone());
            }
        }
        Ok(outcome)
    }

    /// Papers whose embedding write is still owed to the vector store.
    pub fn pending_embeddings(&self) -> StoreResult<Vec<PaperId>> {
        self.graph.embedding_pending()
    }

    /// Write an already-computed embedding for a paper, clearing its
    /// pending flag on success.
    pub fn fill_embedding(&self, paper: &Paper, embedding: Vec<f32>) -> StoreResult<()> {
        self.vector.upsert(&VectorRecord {
            id: paper.id.clone(),
            embedding,
            category: paper.primary_category().map(|s| s.to_string()),
            year: paper.year(),
        })?;
        self.graph.mark_embedding_pending(&paper.id, false)
    }

    fn write_embedding(&self, paper: &Paper) -> StoreResult<WriteOutcome> {
        let embedding = match &paper.embedding {
            Some(v) => v,
            None => return Ok(WriteOutcome::Complete),
        };

        let record = VectorRecord {
            id: paper.id.clone(),
            embedding: embedding.clone(),
            category: paper.primary_category().map(|s| s.to_string()),
            year: paper.year(),
        };
        match self.vector.upsert(&record) {
            Ok(()) => {
                self.graph.mark_embedding_pending(&paper.id, false)?;
                Ok(WriteOutcome::Complete)
            }
            // A wrong-length vector can never converge; surface it.
            Err(err @ StoreError::DimensionMismatch { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(paper = %paper.id, error = %err, "embedding write deferred");
                self.graph.mark_embedding_pending(&paper.id, true)?;
                Ok(WriteOutcome::EmbeddingDeferred)
            }
        }
    }
}
