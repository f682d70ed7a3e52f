//! Community detection over the citation graph
//!
//! The graph store exports its edge list; clustering runs here as
//! synchronous label propagation. Deterministic: nodes are processed in
//! sorted id order and ties break toward the smallest label, so the same
//! graph always yields the same clusters.

use crate::model::PaperId;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One detected community.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Cluster {
    pub id: usize,
    pub members: Vec<PaperId>,
    /// Optional human label, filled by the facade from member categories.
    pub label: Option<String>,
}

const MAX_ROUNDS: usize = 20;

/// Label propagation over the undirected view of the citation edges.
/// Clusters smaller than `min_size` are dropped.
pub fn label_propagation(edges: &[(PaperId, PaperId)], min_size: usize) -> Vec<Cluster> {
    // Sorted adjacency keeps iteration deterministic.
    let mut neighbors: BTreeMap<&PaperId, Vec<&PaperId>> = BTreeMap::new();
    for (src, dst) in edges {
        if src == dst {
            continue;
        }
        neighbors.entry(src).or_default().push(dst);
        neighbors.entry(dst).or_default().push(src);
    }

    let nodes: Vec<&PaperId> = neighbors.keys().cloned().collect();
    let index: HashMap<&PaperId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    let mut labels: Vec<usize> = (0..nodes.len()).collect();

    for _ in 0..MAX_ROUNDS {
        let mut changed = false;
        for (i, node) in nodes.iter().enumerate() {
            let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
            for neighbor in &neighbors[node] {
                let label = labels[index[neighbor]];
                *counts.entry(label).or_insert(0) += 1;
            }
            // Most frequent neighbor label; BTreeMap order breaks ties
            // toward the smallest label.
            if let Some((&best, _)) = counts
                .iter()
                .max_by_key(|(label, count)| (**count, std::cmp::Reverse(**label)))
            {
                if best != labels[i] {
                    labels[i] = best;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Group members by final label.
    let mut groups: BTreeMap<usize, Vec<PaperId>> = BTreeMap::new();
    for (i, node) in nodes.iter().enumerate() {
        groups.entry(labels[i]).or_default().push((*node).clone());
    }

    let mut clusters: Vec<Cluster> = groups
        .into_values()
        .filter(|members| members.len() >= min_size)
        .enumerate()
        .map(|(id, mut members)| {
            members.sort();
            Cluster {
                id,
                members,
                label: None,
            }
        })
        .collect();
    clusters.sort_by_key(|c| std::cmp::Reverse(c.members.len()));
    // Re-number after the size sort so ids are stable.
    for (i, cluster) in clusters.iter_mut().enumerate() {
        cluster.id = i;
    }
    clusters
}
