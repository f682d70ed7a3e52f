//! Discovery frontier
//!
//! Bounded breadth-first expansion of the citation graph from the seed
//! set. The visited-set claims an id the instant it is observed, so two
//! workers discovering the same neighbor agree on exactly one claim; the
//! queue mutex makes the claim-and-enqueue step atomic with respect to
//! the paper-count bound.

use crate::model::PaperId;
use dashmap::DashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

/// The BFS frontier: visited-set plus pending queue.
pub struct Frontier {
    visited: DashSet<PaperId>,
    queue: Mutex<VecDeque<(PaperId, u32)>>,
    max_depth: u32,
    max_papers: Option<usize>,
    max_fanout: usize,
}

impl Frontier {
    pub fn new(max_depth: u32, max_papers: Option<usize>, max_fanout: usize) -> Self {
        Self {
            visited: DashSet::new(),
            queue: Mutex::new(VecDeque::new()),
            max_depth,
            max_papers,
            max_fanout,
        }
    }

    /// Claim the seeds at depth 0. Returns how many were newly claimed.
    pub fn seed(&self, seeds: &[PaperId]) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let mut claimed = 0;
        for seed in seeds {
            if self.at_capacity() {
                break;
            }
            if self.visited.insert(seed.clone()) {
                queue.push_back((seed.clone(), 0));
                claimed += 1;
            }
        }
        claimed
    }

    /// Mark ids as already processed without queueing them. Used on
    /// restart to reload the store's persisted ids.
    pub fn seed_visited<I: IntoIterator<Item = PaperId>>(&self, ids: I) {
        for id in ids {
            self.visited.insert(id);
        }
    }

    /// Restore queue entries from a checkpoint, claiming each id.
    /// Returns how many were restored.
    pub fn restore(&self, entries: Vec<(PaperId, u32)>) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let mut restored = 0;
        for (id, depth) in entries {
            if self.visited.insert(id.clone()) {
                queue.push_back((id, depth));
                restored += 1;
            }
        }
        restored
    }

    /// Pop the next id to process, FIFO. `None` means the queue is
    /// currently empty; the caller decides whether the run is exhausted.
    pub fn next(&self) -> Option<(PaperId, u32)> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Filter and claim neighbors of one paper: unvisited, within the
    /// depth and paper bounds, truncated to the per-paper fan-out cap,
    /// insertion order preserved. Returns how many were enqueued.
    pub fn enqueue_neighbors(&self, parent_depth: u32, neighbors: &[PaperId]) -> usize {
        let depth = parent_depth + 1;
        if depth > self.max_depth {
            return 0;
        }
        let mut queue = self.queue.lock().unwrap();
        let mut enqueued = 0;
        for id in neighbors {
            if enqueued >= self.max_fanout {
                break;
            }
            if self.at_capacity() {
                break;
            }
            if self.visited.insert(id.clone()) {
                queue.push_back((id.clone(), depth));
                enqueued += 1;
            }
        }
        enqueued
    }

    /// Ordered copy of the pending queue, for checkpointing.
    pub fn snapshot_queue(&self) -> Vec<(PaperId, u32)> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn visited_len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_visited(&self, id: &PaperId) -> bool {
        self.visited.contains(id)
    }

    fn at_capacity(&self) -> bool {
        self.max_papers
            .map(|cap| self.visited.len() >= cap)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids(names: &[&str]) -> Vec<PaperId> {
        names.iter().map(|n| PaperId::from(*n)).collect()
    }

    #[test]
    fn seeds_come_out_fifo_at_depth_zero() {
        let frontier = Frontier::new(2, None, 10);
        assert_eq!(frontier.seed(&ids(&["A", "B"])), 2);
        assert_eq!(frontier.next(), Some((PaperId::from("A"), 0)));
        assert_eq!(frontier.next(), Some((PaperId::from("B"), 0)));
        assert_eq!(frontier.next(), None);
    }

    #[test]
    fn duplicate_neighbors_claim_once() {
        let frontier = Frontier::new(2, None, 10);
        frontier.seed(&ids(&["A"]));
        // enqueue_neighbors(p, [q,q,q]) == enqueue_neighbors(p, [q])
        assert_eq!(frontier.enqueue_neighbors(0, &ids(&["Q", "Q", "Q"])), 1);
        assert_eq!(frontier.enqueue_neighbors(0, &ids(&["Q"])), 0);
        assert_eq!(frontier.visited_len(), 2);
    }

    #[test]
    fn depth_bound_stops_expansion() {
        let frontier = Frontier::new(1, None, 10);
        frontier.seed(&ids(&["A"]));
        assert_eq!(frontier.enqueue_neighbors(0, &ids(&["B"])), 1);
        // B is at depth 1 == max_depth; its neighbors are out of bounds.
        assert_eq!(frontier.enqueue_neighbors(1, &ids(&["C"])), 0);
        assert!(!frontier.is_visited(&PaperId::from("C")));
    }

    #[test]
    fn paper_cap_bounds_total_claims() {
        let frontier = Frontier::new(5, Some(3), 10);
        frontier.seed(&ids(&["A"]));
        assert_eq!(frontier.enqueue_neighbors(0, &ids(&["B", "C", "D", "E"])), 2);
        assert_eq!(frontier.visited_len(), 3);
    }

    #[test]
    fn fanout_cap_truncates_per_parent() {
        let frontier = Frontier::new(5, None, 2);
        frontier.seed(&ids(&["A"]));
        assert_eq!(frontier.enqueue_neighbors(0, &ids(&["B", "C", "D"])), 2);
        // A second parent still gets its own fan-out budget.
        assert_eq!(frontier.enqueue_neighbors(0, &ids(&["D", "E"])), 2);
    }

    #[test]
    fn restore_claims_and_preserves_order() {
        let frontier = Frontier::new(5, None, 10);
        frontier.seed_visited(ids(&["done-1", "done-2"]));
        let restored = frontier.restore(vec![
            (PaperId::from("X"), 1),
            (PaperId::from("done-1"), 1),
            (PaperId::from("Y"), 2),
        ]);
        assert_eq!(restored, 2);
        assert_eq!(frontier.next(), Some((PaperId::from("X"), 1)));
        assert_eq!(frontier.next(), Some((PaperId::from("Y"), 2)));
    }

    #[tokio::test]
    async fn concurrent_discovery_of_the_same_id_claims_exactly_once() {
        let frontier = Arc::new(Frontier::new(2, None, 100));
        frontier.seed(&ids(&["A", "B", "C", "D"]));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let frontier = frontier.clone();
            handles.push(tokio::spawn(async move {
                frontier.enqueue_neighbors(0, &[PaperId::from("SHARED")])
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 1, "exactly one worker wins the claim");
        assert!(frontier.is_visited(&PaperId::from("SHARED")));
    }
}
