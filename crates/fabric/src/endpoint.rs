use crate::{Error, Injector, Rank, Result, Topology};
use bytes::Bytes;
use proto::Tag;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Rank,
    pub tag: Tag,
    pub payload: Bytes,
}

impl Envelope {
    /// Decode the payload as a wire record.
    pub fn decode<M: prost::Message + Default>(&self, name: &'static str) -> Result<M> {
        Ok(proto::decode(name, &self.payload)?)
    }
}

/// A rank's attachment to the fabric.
///
/// Receipt is tag-selective: [`Endpoint::recv_match`] waits for an
/// envelope matching a source/tag filter while stashing everything else
/// for later, which models a probe across several pending exchanges.
pub struct Endpoint {
    rank: Rank,
    topology: Topology,
    senders: Arc<Vec<mpsc::UnboundedSender<Envelope>>>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    stash: VecDeque<Envelope>,
}

impl Endpoint {
    pub(crate) fn new(
        rank: Rank,
        topology: Topology,
        senders: Arc<Vec<mpsc::UnboundedSender<Envelope>>>,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            rank,
            topology,
            senders,
            inbox,
            stash: VecDeque::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// An injector sharing this endpoint's send side, for tests.
    pub fn injector(&self) -> Injector {
        Injector::new(self.topology, self.senders.clone())
    }

    pub fn send(&self, to: Rank, tag: Tag, payload: Bytes) -> Result<()> {
        tracing::trace!(from = self.rank, to, %tag, len = payload.len(), "send");
        let sender = self.senders.get(to as usize).ok_or(Error::BadRank(to))?;
        sender
            .send(Envelope {
                from: self.rank,
                tag,
                payload,
            })
            .map_err(|_| Error::Disconnected(to))
    }

    /// Encode and send a wire record.
    pub fn send_record<M: prost::Message>(&self, to: Rank, tag: Tag, record: &M) -> Result<()> {
        self.send(to, tag, proto::encode(record))
    }

    /// Receive the next envelope in arrival order, stashed first.
    pub async fn recv(&mut self) -> Result<Envelope> {
        if let Some(envelope) = self.stash.pop_front() {
            return Ok(envelope);
        }
        self.inbox
            .recv()
            .await
            .ok_or(Error::Disconnected(self.rank))
    }

    /// Receive the next envelope matching `from` (if given) and one of
    /// `tags`. Non-matching envelopes are stashed in arrival order and
    /// surface on later receives.
    pub async fn recv_match(&mut self, from: Option<Rank>, tags: &[Tag]) -> Result<Envelope> {
        let matches =
            |e: &Envelope| tags.contains(&e.tag) && from.map(|f| f == e.from).unwrap_or(true);

        if let Some(at) = self.stash.iter().position(&matches) {
            return Ok(self.stash.remove(at).expect("index is in range"));
        }
        loop {
            let envelope = self
                .inbox
                .recv()
                .await
                .ok_or(Error::Disconnected(self.rank))?;
            if matches(&envelope) {
                return Ok(envelope);
            }
            self.stash.push_back(envelope);
        }
    }

    /// Non-blocking probe for a matching envelope.
    pub fn try_recv_match(&mut self, from: Option<Rank>, tags: &[Tag]) -> Option<Envelope> {
        let matches =
            |e: &Envelope| tags.contains(&e.tag) && from.map(|f| f == e.from).unwrap_or(true);

        if let Some(at) = self.stash.iter().position(&matches) {
            return self.stash.remove(at);
        }
        while let Ok(envelope) = self.inbox.try_recv() {
            if matches(&envelope) {
                return Some(envelope);
            }
            self.stash.push_back(envelope);
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (Endpoint, Endpoint) {
        let mut endpoints = crate::cluster(Topology::new(1, 1));
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn send_and_receive_preserves_order() {
        let (a, mut b) = pair();
        a.send(1, Tag::Put, Bytes::from_static(b"one")).unwrap();
        a.send(1, Tag::Put, Bytes::from_static(b"two")).unwrap();

        let first = b.recv().await.unwrap();
        let second = b.recv().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"one");
        assert_eq!(second.payload.as_ref(), b"two");
        assert_eq!(first.from, 0);
    }

    #[tokio::test]
    async fn selective_receive_stashes_unrelated_traffic() {
        let (a, mut b) = pair();
        a.send(1, Tag::Put, Bytes::from_static(b"task")).unwrap();
        a.send(1, Tag::SyncResponse, Bytes::from_static(b"ok"))
            .unwrap();

        // Wait for the sync response first; the put is stashed.
        let sync = b.recv_match(Some(0), &[Tag::SyncResponse]).await.unwrap();
        assert_eq!(sync.payload.as_ref(), b"ok");

        // The stashed put surfaces on the next receive.
        let put = b.recv().await.unwrap();
        assert_eq!(put.tag, Tag::Put);
    }

    #[tokio::test]
    async fn try_recv_is_non_blocking() {
        let (a, mut b) = pair();
        assert!(b.try_recv_match(None, &[Tag::Put]).is_none());

        a.send(1, Tag::Put, Bytes::new()).unwrap();
        // The envelope is already buffered in the channel.
        assert!(b.try_recv_match(None, &[Tag::Put]).is_some());
    }
}
