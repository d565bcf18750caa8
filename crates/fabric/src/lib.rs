//! In-process message fabric connecting workers and servers.
//!
//! The process set is a fixed topology of worker ranks followed by
//! server ranks. Each rank owns an [`Endpoint`]: envelopes sent between
//! a pair of ranks are delivered FIFO, and receipt is tag-selective with
//! an out-of-order stash, so a rank may wait for a particular exchange
//! while deferring unrelated traffic.

mod endpoint;
mod topology;

pub use endpoint::{Endpoint, Envelope};
pub use topology::{Rank, Topology};

use bytes::Bytes;
use proto::Tag;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rank {0} has left the fabric")]
    Disconnected(Rank),
    #[error("rank {0} is out of range for this topology")]
    BadRank(Rank),
    #[error(transparent)]
    Protocol(#[from] proto::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Construct a fabric for `topology`, returning one endpoint per rank,
/// indexed by rank.
pub fn cluster(topology: Topology) -> Vec<Endpoint> {
    let mut senders = Vec::with_capacity(topology.size());
    let mut inboxes = Vec::with_capacity(topology.size());
    for _ in 0..topology.size() {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        inboxes.push(rx);
    }
    let senders = Arc::new(senders);

    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| Endpoint::new(rank as Rank, topology, senders.clone(), inbox))
        .collect()
}

/// A handle that can inject envelopes from outside any rank, used by
/// tests to play the part of an external process.
#[derive(Clone)]
pub struct Injector {
    topology: Topology,
    senders: Arc<Vec<mpsc::UnboundedSender<Envelope>>>,
}

impl Injector {
    pub(crate) fn new(
        topology: Topology,
        senders: Arc<Vec<mpsc::UnboundedSender<Envelope>>>,
    ) -> Self {
        Self { topology, senders }
    }

    pub fn send(&self, from: Rank, to: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        let sender = self
            .senders
            .get(to as usize)
            .ok_or(Error::BadRank(to))?;
        sender
            .send(Envelope { from, tag, payload })
            .map_err(|_| Error::Disconnected(to))
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }
}
