use bytes::Bytes;
use codec::{DataType, DatumId};
use proto::Refc;

/// Notification work produced by one store operation.
///
/// The portion addressed to the operation's own datum rides back to the
/// requesting client inside the reply; closes of other datums collected
/// during transitive garbage collection, and reference-count changes
/// against remote shards, are routed by the server after it replies.
#[derive(Debug, Default)]
pub struct Notifications {
    /// Close notifications: for each closed datum, the ranks awaiting it.
    pub closes: Vec<(DatumId, Vec<i32>)>,
    /// Insert notification for the operation's `(id, subscript)`.
    pub insert: Option<(DatumId, Box<[u8]>, Vec<i32>)>,
    /// Reference datums to be assigned the inserted value.
    pub references: Vec<DatumId>,
    /// The inserted value, packed, for reference assignment.
    pub value: Option<(DataType, Bytes)>,
    /// Reference-count changes against datums on other shards.
    pub remote_refcounts: Vec<(DatumId, Refc)>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
            && self.insert.is_none()
            && self.references.is_empty()
            && self.remote_refcounts.is_empty()
    }

    pub(crate) fn push_close(&mut self, id: DatumId, ranks: Vec<i32>) {
        if !ranks.is_empty() {
            self.closes.push((id, ranks));
        }
    }

    pub(crate) fn push_remote(&mut self, id: DatumId, change: Refc) {
        if !change.is_none() {
            self.remote_refcounts.push((id, change));
        }
    }

    /// Split out the close ranks addressed to `id`, leaving the rest for
    /// server-side routing.
    pub fn take_closes_of(&mut self, id: DatumId) -> Vec<i32> {
        let mut taken = Vec::new();
        self.closes.retain_mut(|(close_id, ranks)| {
            if *close_id == id {
                taken.append(ranks);
                false
            } else {
                true
            }
        });
        taken
    }
}
