//! Priority- and affinity-indexed queues of work units.

use bytes::Bytes;
use fabric::Rank;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Identifier of a work unit, unique within its server.
pub type WorkUnitId = u64;

/// One queued task.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    /// Enqueue order, the FIFO tie-break within equal priority.
    pub seq: u64,
    pub work_type: i32,
    pub priority: i32,
    pub putter: Rank,
    pub answer: Rank,
    /// [`proto::RANK_ANY`] or a specific worker rank.
    pub target: Rank,
    pub parallelism: i32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    priority: i32,
    seq: Reverse<u64>,
    id: WorkUnitId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Highest priority first; within a priority, oldest first.
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The per-server pool of queued work, indexed three ways: by
/// `(type, target)` for targeted tasks, by type in priority order for
/// any-target tasks, and by type for parallel gangs. Index entries are
/// validated against the pool lazily, so removal by steal or dispatch
/// never restructures a heap.
pub struct WorkQueue {
    next_id: WorkUnitId,
    next_seq: u64,
    pool: HashMap<WorkUnitId, WorkUnit>,
    targeted: HashMap<(i32, Rank), BinaryHeap<Entry>>,
    untargeted: HashMap<i32, BinaryHeap<Entry>>,
    parallel: HashMap<i32, Vec<WorkUnitId>>,
}

/// Ingredients of a new work unit; id and seq are assigned on add.
pub struct NewWork {
    pub work_type: i32,
    pub priority: i32,
    pub putter: Rank,
    pub answer: Rank,
    pub target: Rank,
    pub parallelism: i32,
    pub payload: Bytes,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            next_seq: 1,
            pool: HashMap::new(),
            targeted: HashMap::new(),
            untargeted: HashMap::new(),
            parallel: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Insert a work unit, returning its assigned id.
    pub fn add(&mut self, work: NewWork) -> WorkUnitId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        let unit = WorkUnit {
            id,
            seq,
            work_type: work.work_type,
            priority: work.priority,
            putter: work.putter,
            answer: work.answer,
            target: work.target,
            parallelism: work.parallelism,
            payload: work.payload,
        };
        tracing::trace!(
            id,
            work_type = unit.work_type,
            priority = unit.priority,
            target = unit.target,
            parallelism = unit.parallelism,
            "workqueue add"
        );

        let entry = Entry {
            priority: unit.priority,
            seq: Reverse(unit.seq),
            id,
        };
        if unit.parallelism > 1 {
            self.parallel.entry(unit.work_type).or_default().push(id);
        } else if unit.target != proto::RANK_ANY {
            self.targeted
                .entry((unit.work_type, unit.target))
                .or_default()
                .push(entry);
        } else {
            self.untargeted
                .entry(unit.work_type)
                .or_default()
                .push(entry);
        }
        self.pool.insert(id, unit);
        id
    }

    /// Highest-priority unit runnable by `target` for `work_type`,
    /// considering tasks addressed to it and any-target tasks.
    pub fn get(&mut self, target: Rank, work_type: i32) -> Option<WorkUnit> {
        let pool = &self.pool;
        let clean = |heap: &mut BinaryHeap<Entry>| {
            while let Some(head) = heap.peek() {
                if pool.contains_key(&head.id) {
                    return heap.peek().copied();
                }
                heap.pop();
            }
            None
        };

        let targeted_head = self
            .targeted
            .get_mut(&(work_type, target))
            .and_then(clean);
        let untargeted_head = self.untargeted.get_mut(&work_type).and_then(clean);

        let id = match (targeted_head, untargeted_head) {
            (None, None) => return None,
            (Some(t), None) => t.id,
            (None, Some(u)) => u.id,
            (Some(t), Some(u)) => {
                if t >= u {
                    t.id
                } else {
                    u.id
                }
            }
        };
        self.take(id)
    }

    /// Remove a unit from the pool by id. Stale index entries are
    /// skipped on later lookups.
    pub fn take(&mut self, id: WorkUnitId) -> Option<WorkUnit> {
        self.pool.remove(&id)
    }

    /// Parallel units of each type, for gang-reservation attempts.
    /// Returned units stay queued until taken.
    pub fn parallel_candidates(&mut self) -> Vec<(WorkUnitId, i32, i32)> {
        let pool = &self.pool;
        let mut candidates = Vec::new();
        for (_, ids) in self.parallel.iter_mut() {
            ids.retain(|id| pool.contains_key(id));
            candidates.extend(ids.iter().map(|id| {
                let unit = &pool[id];
                (unit.id, unit.work_type, unit.parallelism)
            }));
        }
        candidates
    }

    /// Count of queued any-target single tasks per work type.
    pub fn type_counts(&self, work_types: usize) -> Vec<i64> {
        let mut counts = vec![0i64; work_types];
        for unit in self.pool.values() {
            if unit.target == proto::RANK_ANY && unit.parallelism <= 1 {
                if let Ok(index) = usize::try_from(unit.work_type) {
                    if index < work_types {
                        counts[index] += 1;
                    }
                }
            }
        }
        counts
    }

    /// Select up to `budget` bytes of any-target tasks to donate to a
    /// peer, preferring types for which the peer reports a shortage
    /// relative to this server. At most half of each type's surplus is
    /// given up. Targeted and parallel tasks are never stolen.
    pub fn steal(&mut self, budget: usize, peer_counts: &[i64]) -> Vec<WorkUnit> {
        let my_counts = self.type_counts(peer_counts.len());
        let mut stolen = Vec::new();
        let mut spent = 0usize;

        for (work_type, (mine, theirs)) in my_counts.iter().zip(peer_counts).enumerate() {
            if mine <= theirs {
                continue;
            }
            // Give up half the surplus, rounding up.
            let mut quota = ((mine - theirs) as usize + 1) / 2;
            let Some(heap) = self.untargeted.get_mut(&(work_type as i32)) else {
                continue;
            };
            while quota > 0 && spent < budget {
                let Some(entry) = heap.pop() else { break };
                let Some(unit) = self.pool.remove(&entry.id) else {
                    continue; // Stale entry.
                };
                spent += unit.payload.len();
                quota -= 1;
                stolen.push(unit);
            }
            if spent >= budget {
                break;
            }
        }
        tracing::debug!(count = stolen.len(), bytes = spent, "stole work for peer");
        stolen
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn work(work_type: i32, priority: i32, target: Rank, parallelism: i32) -> NewWork {
        NewWork {
            work_type,
            priority,
            putter: 0,
            answer: proto::RANK_NULL,
            target,
            parallelism,
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn priority_order_with_fifo_tie_break() {
        let mut q = WorkQueue::new();
        q.add(work(0, 1, proto::RANK_ANY, 1));
        let second = q.add(work(0, 5, proto::RANK_ANY, 1));
        let third = q.add(work(0, 5, proto::RANK_ANY, 1));
        q.add(work(0, 3, proto::RANK_ANY, 1));

        assert_eq!(q.get(2, 0).unwrap().id, second);
        assert_eq!(q.get(2, 0).unwrap().id, third);
        assert_eq!(q.get(2, 0).unwrap().priority, 3);
        assert_eq!(q.get(2, 0).unwrap().priority, 1);
        assert!(q.get(2, 0).is_none());
    }

    #[test]
    fn targeted_work_only_reaches_its_target() {
        let mut q = WorkQueue::new();
        let targeted = q.add(work(0, 1, 2, 1));

        assert!(q.get(1, 0).is_none());
        assert_eq!(q.get(2, 0).unwrap().id, targeted);
    }

    #[test]
    fn targeted_beats_untargeted_only_on_priority() {
        let mut q = WorkQueue::new();
        let low_targeted = q.add(work(0, 1, 2, 1));
        let high_any = q.add(work(0, 9, proto::RANK_ANY, 1));

        assert_eq!(q.get(2, 0).unwrap().id, high_any);
        assert_eq!(q.get(2, 0).unwrap().id, low_targeted);
    }

    #[test]
    fn types_are_independent() {
        let mut q = WorkQueue::new();
        q.add(work(1, 1, proto::RANK_ANY, 1));
        assert!(q.get(2, 0).is_none());
        assert!(q.get(2, 1).is_some());
    }

    #[test]
    fn parallel_units_are_not_dispatched_singly() {
        let mut q = WorkQueue::new();
        let gang = q.add(work(0, 9, proto::RANK_ANY, 3));
        assert!(q.get(2, 0).is_none());

        let candidates = q.parallel_candidates();
        assert_eq!(candidates, vec![(gang, 0, 3)]);
        assert!(q.take(gang).is_some());
        assert!(q.parallel_candidates().is_empty());
    }

    #[test]
    fn steal_prefers_types_the_peer_lacks() {
        let mut q = WorkQueue::new();
        for _ in 0..6 {
            q.add(work(0, 1, proto::RANK_ANY, 1));
        }
        q.add(work(1, 1, proto::RANK_ANY, 1));

        // Peer has plenty of type 0 but no type 1... except our surplus
        // of type 0 is what it asks about. Peer counts: [6, 0].
        let stolen = q.steal(usize::MAX, &[6, 0]);
        assert_eq!(stolen.len(), 1);
        assert_eq!(stolen[0].work_type, 1);

        // Now peer reports nothing at all: half of each surplus moves.
        let stolen = q.steal(usize::MAX, &[0, 0]);
        assert_eq!(stolen.len(), 3);
        assert!(stolen.iter().all(|u| u.work_type == 0));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn steal_respects_the_byte_budget() {
        let mut q = WorkQueue::new();
        for _ in 0..10 {
            q.add(work(0, 1, proto::RANK_ANY, 1));
        }
        // Each payload is 7 bytes; a 20-byte budget admits three.
        let stolen = q.steal(20, &[0]);
        assert_eq!(stolen.len(), 3);
    }

    #[test]
    fn stale_entries_are_skipped() {
        let mut q = WorkQueue::new();
        let a = q.add(work(0, 5, proto::RANK_ANY, 1));
        let b = q.add(work(0, 1, proto::RANK_ANY, 1));
        assert!(q.take(a).is_some());
        assert_eq!(q.get(2, 0).unwrap().id, b);
    }
}
