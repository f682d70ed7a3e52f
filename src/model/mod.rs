//! Domain types for the paper knowledge base
//!
//! Papers, citation edges, and concepts are identified by stable string
//! keys so the in-memory pipeline never holds cyclic structure; the graph
//! store is the only place where cycles live.

mod concept;
mod paper;

pub use concept::{normalize_name, Concept, ConceptKind, ConceptMention};
pub use paper::{CitationAttrs, CitationEdge, CitationIntent, CitationPosition, Paper, PaperId};
