//! Parked worker requests, matched against incoming and stolen work.

use fabric::Rank;
use std::collections::{HashMap, VecDeque};

/// Per-server table of workers whose `get` is waiting for a task.
/// Requests of one type dispatch longest-parked first; a by-rank index
/// supports targeted dispatch and cancellation.
pub struct RequestQueue {
    by_type: HashMap<i32, VecDeque<Rank>>,
    by_rank: HashMap<Rank, i32>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            by_type: HashMap::new(),
            by_rank: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_rank.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rank.is_empty()
    }

    /// Park `rank` awaiting a task of `work_type`. A worker parks at
    /// most once.
    pub fn add(&mut self, rank: Rank, work_type: i32) {
        debug_assert!(!self.by_rank.contains_key(&rank), "worker parked twice");
        self.by_type.entry(work_type).or_default().push_back(rank);
        self.by_rank.insert(rank, work_type);
        tracing::trace!(rank, work_type, parked = self.len(), "request parked");
    }

    /// Pop the longest-parked worker awaiting `work_type`.
    pub fn match_type(&mut self, work_type: i32) -> Option<Rank> {
        let queue = self.by_type.get_mut(&work_type)?;
        let rank = queue.pop_front()?;
        self.by_rank.remove(&rank);
        Some(rank)
    }

    /// Claim `rank` specifically, when a task targeted at it arrives.
    pub fn match_target(&mut self, rank: Rank, work_type: i32) -> bool {
        if self.by_rank.get(&rank) != Some(&work_type) {
            return false;
        }
        self.by_rank.remove(&rank);
        let queue = self.by_type.get_mut(&work_type).expect("indexes agree");
        queue.retain(|r| *r != rank);
        true
    }

    /// All-or-nothing reservation of `count` workers of `work_type`.
    pub fn parallel_reserve(&mut self, work_type: i32, count: usize) -> Option<Vec<Rank>> {
        let queue = self.by_type.get_mut(&work_type)?;
        if queue.len() < count {
            return None;
        }
        let ranks: Vec<Rank> = queue.drain(..count).collect();
        for rank in &ranks {
            self.by_rank.remove(rank);
        }
        Some(ranks)
    }

    /// Work types with at least one parked worker.
    pub fn types_present(&self) -> Vec<i32> {
        self.by_type
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(t, _)| *t)
            .collect()
    }

    /// Parked workers per type, for idle detection.
    pub fn type_counts(&self, work_types: usize) -> Vec<i64> {
        let mut counts = vec![0i64; work_types];
        for (work_type, queue) in &self.by_type {
            if let Ok(index) = usize::try_from(*work_type) {
                if index < work_types {
                    counts[index] += queue.len() as i64;
                }
            }
        }
        counts
    }

    /// Unpark every worker, for shutdown.
    pub fn drain(&mut self) -> Vec<(Rank, i32)> {
        let drained = std::mem::take(&mut self.by_rank).into_iter().collect();
        self.by_type.clear();
        drained
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn longest_parked_dispatches_first() {
        let mut q = RequestQueue::new();
        q.add(1, 0);
        q.add(2, 0);
        q.add(3, 1);

        assert_eq!(q.match_type(0), Some(1));
        assert_eq!(q.match_type(0), Some(2));
        assert_eq!(q.match_type(0), None);
        assert_eq!(q.match_type(1), Some(3));
    }

    #[test]
    fn targeted_match_claims_a_specific_worker() {
        let mut q = RequestQueue::new();
        q.add(1, 0);
        q.add(2, 0);

        assert!(!q.match_target(2, 1)); // Wrong type.
        assert!(q.match_target(2, 0));
        assert!(!q.match_target(2, 0)); // Already claimed.
        assert_eq!(q.match_type(0), Some(1));
    }

    #[test]
    fn parallel_reserve_is_all_or_nothing() {
        let mut q = RequestQueue::new();
        q.add(1, 0);
        q.add(2, 0);

        assert_eq!(q.parallel_reserve(0, 3), None);
        assert_eq!(q.len(), 2);

        q.add(3, 0);
        q.add(4, 0);
        let ranks = q.parallel_reserve(0, 3).unwrap();
        assert_eq!(ranks, vec![1, 2, 3]);
        // The fourth remains parked.
        assert_eq!(q.len(), 1);
        assert_eq!(q.match_type(0), Some(4));
    }

    #[test]
    fn types_present_reflects_parked_workers() {
        let mut q = RequestQueue::new();
        assert!(q.types_present().is_empty());
        q.add(1, 2);
        assert_eq!(q.types_present(), vec![2]);
        assert_eq!(q.match_type(2), Some(1));
        assert!(q.types_present().is_empty());
    }
}
