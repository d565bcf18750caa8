/// A process rank. Workers are ranks `0..workers`; servers follow at
/// `workers..workers + servers`.
pub type Rank = i32;

/// The fixed shape of the process set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub workers: usize,
    pub servers: usize,
}

impl Topology {
    pub fn new(workers: usize, servers: usize) -> Self {
        assert!(servers > 0, "a topology requires at least one server");
        assert!(workers > 0, "a topology requires at least one worker");
        Self { workers, servers }
    }

    pub fn size(&self) -> usize {
        self.workers + self.servers
    }

    pub fn is_server(&self, rank: Rank) -> bool {
        rank >= self.workers as Rank && (rank as usize) < self.size()
    }

    pub fn is_worker(&self, rank: Rank) -> bool {
        rank >= 0 && (rank as usize) < self.workers
    }

    /// The first server rank acts as the master for idle detection and
    /// shutdown.
    pub fn master_server(&self) -> Rank {
        self.workers as Rank
    }

    /// The server a rank talks to: workers are assigned by rank-modulo
    /// affinity, servers are their own home.
    pub fn home_server(&self, rank: Rank) -> Rank {
        if self.is_server(rank) {
            rank
        } else {
            self.workers as Rank + rank % self.servers as Rank
        }
    }

    /// The server owning a datum id's shard. Placement depends only on
    /// the id and the server count; negative (system) ids continue the
    /// same pattern.
    pub fn shard_owner(&self, id: i64) -> Rank {
        let offset = (id - 1).rem_euclid(self.servers as i64);
        self.workers as Rank + offset as Rank
    }

    /// Index of a server rank among the servers.
    pub fn server_index(&self, rank: Rank) -> usize {
        debug_assert!(self.is_server(rank));
        rank as usize - self.workers
    }

    /// Index of a worker among the workers served by its home server.
    pub fn worker_index(&self, rank: Rank) -> usize {
        debug_assert!(self.is_worker(rank));
        rank as usize / self.servers
    }

    pub fn server_ranks(&self) -> impl Iterator<Item = Rank> {
        (self.workers..self.size()).map(|r| r as Rank)
    }

    pub fn worker_ranks(&self) -> impl Iterator<Item = Rank> {
        (0..self.workers).map(|r| r as Rank)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn home_servers_are_assigned_by_rank_modulo() {
        let t = Topology::new(4, 2);
        assert_eq!(t.home_server(0), 4);
        assert_eq!(t.home_server(1), 5);
        assert_eq!(t.home_server(2), 4);
        assert_eq!(t.home_server(3), 5);
        assert_eq!(t.home_server(4), 4);
        assert_eq!(t.home_server(5), 5);
    }

    #[test]
    fn shard_placement_is_stable_and_total() {
        let t = Topology::new(3, 3);
        assert_eq!(t.shard_owner(1), 3);
        assert_eq!(t.shard_owner(2), 4);
        assert_eq!(t.shard_owner(3), 5);
        assert_eq!(t.shard_owner(4), 3);
        // System ids continue the same pattern.
        assert_eq!(t.shard_owner(-1), t.shard_owner(-1 + 3));
        for id in -10..10i64 {
            if id == 0 {
                continue;
            }
            let owner = t.shard_owner(id);
            assert!(t.is_server(owner));
            assert_eq!(owner, t.shard_owner(id));
        }
    }

    #[test]
    fn masters_and_indices() {
        let t = Topology::new(5, 3);
        assert_eq!(t.master_server(), 5);
        assert_eq!(t.server_index(6), 1);
        assert_eq!(t.worker_index(4), 1);
    }
}
