//! Worker-side stubs for every wire operation.
//!
//! A stub builds the packed request, sends it to the responsible
//! server, and waits for the matched reply. Replies may carry an
//! attached batch of notification work, which the stub applies before
//! returning: close and insert notifications become control tasks put
//! to each subscriber's home server, and resolved references become
//! stores of the inserted value.

use bytes::Bytes;
use codec::{DataType, DatumId, StructRegistry};
use fabric::{Endpoint, Rank};
use proto::{Code, DataCode, Refc, Tag};
use std::collections::VecDeque;
use std::sync::Arc;

pub use store_api::*;
mod store_api;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Fabric(#[from] fabric::Error),
    #[error(transparent)]
    Protocol(#[from] proto::Error),
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error("server reported {0:?}")]
    Data(DataCode),
    #[error("request was rejected")]
    Rejected,
    #[error("the cluster is shutting down")]
    Shutdown,
    #[error("protocol violation: {0}")]
    Violation(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Check a reply's data code, mapping single-assignment violations to
/// [`Error::Rejected`] per the wire contract.
fn check_dc(dc: i32) -> Result<()> {
    match DataCode::try_from(dc) {
        Ok(DataCode::Ok) => Ok(()),
        Ok(DataCode::DoubleWrite) | Ok(DataCode::DoubleDeclare) => Err(Error::Rejected),
        Ok(code) => Err(Error::Data(code)),
        Err(_) => Err(Error::Violation("unknown data code")),
    }
}

/// A task received from the server.
#[derive(Debug)]
pub struct Task {
    pub payload: Bytes,
    pub work_type: i32,
    pub answer: Rank,
    /// Non-empty for parallel tasks: the gang this worker belongs to.
    pub gang: Vec<Rank>,
}

/// Outcome of a blocking or non-blocking get.
#[derive(Debug)]
pub enum GetOutcome {
    Task(Task),
    /// Only from `iget`: no work available right now.
    Nothing,
    Shutdown,
}

/// A worker's connection to the load balancer.
pub struct Client {
    endpoint: Endpoint,
    rank: Rank,
    home: Rank,
    registry: Arc<StructRegistry>,
}

impl Client {
    pub fn new(endpoint: Endpoint, registry: Arc<StructRegistry>) -> Self {
        let topology = endpoint.topology();
        let rank = endpoint.rank();
        assert!(topology.is_worker(rank), "rank {rank} is not a worker");
        Self {
            rank,
            home: topology.home_server(rank),
            endpoint,
            registry,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn registry(&self) -> &Arc<StructRegistry> {
        &self.registry
    }

    fn endpoint(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    /// The server owning a datum's shard.
    fn owner(&self, id: DatumId) -> Rank {
        self.endpoint.topology().shard_owner(id.0)
    }

    // ---- Task operations ----

    /// Submit a task. Small payloads ride inline with the header;
    /// larger ones are shipped in a second frame, possibly redirected
    /// straight to a matched worker.
    pub async fn put(
        &mut self,
        payload: Bytes,
        target: Rank,
        answer: Rank,
        work_type: i32,
        priority: i32,
        parallelism: i32,
    ) -> Result<()> {
        let to_server = if target == proto::RANK_ANY {
            self.home
        } else {
            self.endpoint.topology().home_server(target)
        };
        let inline = payload.len() <= proto::PUT_INLINE_DATA_MAX;
        tracing::debug!(target, work_type, priority, parallelism, inline, "put");

        self.endpoint.send_record(
            to_server,
            Tag::Put,
            &proto::PutRequest {
                work_type,
                priority,
                putter: self.rank,
                answer,
                target,
                parallelism,
                payload_len: payload.len() as i64,
                inline_payload: inline.then(|| payload.clone()),
            },
        )?;

        let reply = self
            .endpoint
            .recv_match(Some(to_server), &[Tag::ResponsePut])
            .await?;
        let resp: proto::PutResponse = reply.decode("put response")?;
        match Code::try_from(resp.code) {
            Ok(Code::Success) => (),
            Ok(Code::Rejected) => return Err(Error::Rejected),
            Ok(Code::Shutdown) => return Err(Error::Shutdown),
            _ => return Err(Error::Violation("put failed")),
        }

        if !inline {
            if resp.payload_dest == proto::RANK_NULL {
                return Err(Error::Violation("no destination for put payload"));
            }
            self.endpoint
                .send(resp.payload_dest, Tag::Work, payload)?;
        }
        Ok(())
    }

    /// Submit a task withheld until the given ids (and subscripts) are
    /// all closed.
    pub async fn put_rule(
        &mut self,
        payload: Bytes,
        target: Rank,
        answer: Rank,
        work_type: i32,
        priority: i32,
        parallelism: i32,
        wait_ids: &[DatumId],
        wait_id_subs: &[(DatumId, &[u8])],
    ) -> Result<()> {
        let to_server = if target == proto::RANK_ANY {
            self.home
        } else {
            self.endpoint.topology().home_server(target)
        };
        let inline = payload.len() <= proto::PUT_INLINE_DATA_MAX;

        self.endpoint.send_record(
            to_server,
            Tag::PutRule,
            &proto::PutRuleRequest {
                put: Some(proto::PutRequest {
                    work_type,
                    priority,
                    putter: self.rank,
                    answer,
                    target,
                    parallelism,
                    payload_len: payload.len() as i64,
                    inline_payload: inline.then(|| payload.clone()),
                }),
                wait_ids: wait_ids.iter().map(|id| id.0).collect(),
                wait_id_subs: wait_id_subs
                    .iter()
                    .map(|(id, sub)| proto::IdSubscript {
                        id: id.0,
                        subscript: Bytes::copy_from_slice(sub),
                    })
                    .collect(),
            },
        )?;

        let reply = self
            .endpoint
            .recv_match(Some(to_server), &[Tag::ResponsePut])
            .await?;
        let resp: proto::PutResponse = reply.decode("put response")?;
        if resp.code != Code::Success as i32 {
            return Err(Error::Violation("put rule failed"));
        }
        if !inline {
            self.endpoint.send(resp.payload_dest, Tag::Work, payload)?;
        }
        Ok(())
    }

    /// Block until a task of `work_type` is dispatched to this worker,
    /// or the cluster shuts down.
    pub async fn get(&mut self, work_type: i32) -> Result<GetOutcome> {
        self.endpoint
            .send_record(self.home, Tag::Get, &proto::GetRequest { work_type })?;
        self.get_response().await
    }

    /// Non-blocking variant: returns [`GetOutcome::Nothing`] when no
    /// task is queued.
    pub async fn iget(&mut self, work_type: i32) -> Result<GetOutcome> {
        self.endpoint
            .send_record(self.home, Tag::Iget, &proto::GetRequest { work_type })?;
        self.get_response().await
    }

    async fn get_response(&mut self) -> Result<GetOutcome> {
        let reply = self
            .endpoint
            .recv_match(None, &[Tag::ResponseGet, Tag::ShutdownWorker])
            .await?;
        if reply.tag == Tag::ShutdownWorker {
            return Ok(GetOutcome::Shutdown);
        }
        let resp: proto::GetResponse = reply.decode("get response")?;
        match Code::try_from(resp.code) {
            Ok(Code::Success) => (),
            Ok(Code::Shutdown) => return Ok(GetOutcome::Shutdown),
            Ok(Code::Nothing) => return Ok(GetOutcome::Nothing),
            _ => return Err(Error::Violation("get failed")),
        }

        let work = self
            .endpoint
            .recv_match(Some(resp.payload_source), &[Tag::Work])
            .await?;

        let gang = if resp.parallelism > 1 {
            let frame = self
                .endpoint
                .recv_match(Some(self.home), &[Tag::ResponseGet])
                .await?;
            let gang: proto::GangRanks = frame.decode("gang ranks")?;
            gang.ranks
        } else {
            Vec::new()
        };

        Ok(GetOutcome::Task(Task {
            payload: work.payload,
            work_type: resp.work_type,
            answer: resp.answer,
            gang,
        }))
    }

    /// Report a fatal application failure to the master server.
    pub fn fail(&mut self, code: i32) -> Result<()> {
        let master = self.endpoint.topology().master_server();
        self.endpoint
            .send_record(master, Tag::Fail, &proto::FailNotice { code })?;
        Ok(())
    }

    // ---- Notification application ----

    /// Receive and apply the notification batch attached to a reply,
    /// when its counts say one follows.
    async fn apply_attached(&mut self, server: Rank, counts: Option<proto::NotifCounts>) -> Result<()> {
        let Some(counts) = counts else { return Ok(()) };
        if counts.total() == 0 {
            return Ok(());
        }
        let frame = self
            .endpoint
            .recv_match(Some(server), &[Tag::Notification])
            .await?;
        let frame: proto::NotificationFrame = frame.decode("notification")?;
        self.apply_notifications(frame).await
    }

    /// Apply notification work: wake subscribers with control tasks and
    /// assign resolved references. Reference assignment may itself
    /// return further batches; the whole chain drains before returning
    /// to the application.
    pub async fn apply_notifications(&mut self, frame: proto::NotificationFrame) -> Result<()> {
        let mut queue = VecDeque::from([frame]);
        while let Some(frame) = queue.pop_front() {
            let id = DatumId(frame.id);
            let subscript = if frame.subscript.is_empty() {
                None
            } else {
                Some(frame.subscript.to_vec())
            };

            for rank in frame.close_notify {
                self.notify(rank, id, None).await?;
            }
            for rank in frame.insert_notify {
                self.notify(rank, id, subscript.as_deref()).await?;
            }

            if !frame.references.is_empty() {
                let value_type = DataType::from_code(frame.value_type as i64)?;
                for reference in frame.references {
                    let follow_up = self
                        .store_packed(
                            DatumId(reference),
                            None,
                            value_type,
                            frame.value.clone(),
                            Refc::WRITE,
                            Refc::READ,
                        )
                        .await?;
                    if let Some(follow_up) = follow_up {
                        queue.push_back(follow_up);
                    }
                }
            }
        }
        Ok(())
    }

    /// Wake one subscriber: a control task of priority one targeted at
    /// its rank.
    async fn notify(&mut self, rank: Rank, id: DatumId, subscript: Option<&[u8]>) -> Result<()> {
        let text = match subscript {
            None => format!("close {}", id.0),
            Some(sub) => format!("close {} {}", id.0, String::from_utf8_lossy(sub)),
        };
        self.put(Bytes::from(text), rank, proto::RANK_NULL, CONTROL_WORK_TYPE, 1, 1)
            .await
    }
}

/// The work type notification tasks are put under.
pub const CONTROL_WORK_TYPE: i32 = 1;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn data_codes_map_to_errors() {
        assert!(check_dc(DataCode::Ok as i32).is_ok());
        assert!(matches!(
            check_dc(DataCode::DoubleWrite as i32),
            Err(Error::Rejected)
        ));
        assert!(matches!(
            check_dc(DataCode::NotFound as i32),
            Err(Error::Data(DataCode::NotFound))
        ));
    }
}
