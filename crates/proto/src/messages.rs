use crate::Error;
use bytes::Bytes;

/// Encode a record for the wire.
pub fn encode<M: prost::Message>(record: &M) -> Bytes {
    Bytes::from(record.encode_to_vec())
}

/// Decode a record, naming it in the error for diagnostics.
pub fn decode<M: prost::Message + Default>(name: &'static str, buf: &[u8]) -> Result<M, Error> {
    M::decode(buf).map_err(|err| Error::Decode(name, err))
}

/// A read/write reference count pair, used both for held counts and for
/// requested changes.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Refc {
    #[prost(int64, tag = "1")]
    pub read: i64,
    #[prost(int64, tag = "2")]
    pub write: i64,
}

impl Refc {
    pub const NONE: Refc = Refc { read: 0, write: 0 };
    pub const READ: Refc = Refc { read: 1, write: 0 };
    pub const WRITE: Refc = Refc { read: 0, write: 1 };
    pub const READ_WRITE: Refc = Refc { read: 1, write: 1 };

    pub fn new(read: i64, write: i64) -> Self {
        Self { read, write }
    }

    pub fn is_none(&self) -> bool {
        self.read == 0 && self.write == 0
    }

    pub fn negate(&self) -> Self {
        Self {
            read: -self.read,
            write: -self.write,
        }
    }
}

/// An `(id, subscript)` pair.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdSubscript {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub subscript: Bytes,
}

/// Counts of follow-up notification work attached to a reply.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct NotifCounts {
    #[prost(int64, tag = "1")]
    pub close_count: i64,
    #[prost(int64, tag = "2")]
    pub insert_count: i64,
    #[prost(int64, tag = "3")]
    pub reference_count: i64,
}

impl NotifCounts {
    pub fn total(&self) -> i64 {
        self.close_count + self.insert_count + self.reference_count
    }
}

/// Notification work riding behind a reply: ranks awaiting a close or an
/// insert, plus reference ids to be assigned the inserted value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotificationFrame {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub subscript: Bytes,
    #[prost(int32, repeated, tag = "3")]
    pub close_notify: Vec<i32>,
    #[prost(int32, repeated, tag = "4")]
    pub insert_notify: Vec<i32>,
    #[prost(int64, repeated, tag = "5")]
    pub references: Vec<i64>,
    #[prost(int32, tag = "6")]
    pub value_type: i32,
    #[prost(bytes = "bytes", tag = "7")]
    pub value: Bytes,
}

impl NotificationFrame {
    pub fn counts(&self) -> NotifCounts {
        NotifCounts {
            close_count: self.close_notify.len() as i64,
            insert_count: self.insert_notify.len() as i64,
            reference_count: self.references.len() as i64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.close_notify.is_empty() && self.insert_notify.is_empty() && self.references.is_empty()
    }
}

// ---- Task operations ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PutRequest {
    #[prost(int32, tag = "1")]
    pub work_type: i32,
    #[prost(int32, tag = "2")]
    pub priority: i32,
    #[prost(int32, tag = "3")]
    pub putter: i32,
    #[prost(int32, tag = "4")]
    pub answer: i32,
    #[prost(int32, tag = "5")]
    pub target: i32,
    #[prost(int32, tag = "6")]
    pub parallelism: i32,
    #[prost(int64, tag = "7")]
    pub payload_len: i64,
    /// Present only when the payload is small enough to ride inline.
    #[prost(bytes = "bytes", optional, tag = "8")]
    pub inline_payload: Option<Bytes>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct PutResponse {
    #[prost(enumeration = "crate::Code", tag = "1")]
    pub code: i32,
    /// Where to ship a non-inline payload: the server, or a redirect
    /// straight to the worker the task was matched with.
    #[prost(int32, tag = "2")]
    pub payload_dest: i32,
}

/// Put-when-ids-close: the task is withheld until every named id (and
/// `(id, subscript)` pair) is closed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PutRuleRequest {
    #[prost(message, optional, tag = "1")]
    pub put: Option<PutRequest>,
    #[prost(int64, repeated, tag = "2")]
    pub wait_ids: Vec<i64>,
    #[prost(message, repeated, tag = "3")]
    pub wait_id_subs: Vec<IdSubscript>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct GetRequest {
    #[prost(int32, tag = "1")]
    pub work_type: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct GetResponse {
    #[prost(enumeration = "crate::Code", tag = "1")]
    pub code: i32,
    #[prost(int64, tag = "2")]
    pub payload_len: i64,
    #[prost(int32, tag = "3")]
    pub answer: i32,
    #[prost(int32, tag = "4")]
    pub work_type: i32,
    /// From whom the payload frame will come (may be a redirect).
    #[prost(int32, tag = "5")]
    pub payload_source: i32,
    /// 1 = single task; > 1 = parallel task, a gang frame follows.
    #[prost(int32, tag = "6")]
    pub parallelism: i32,
}

/// Ranks forming a parallel gang, sent after a parallel get response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GangRanks {
    #[prost(int32, repeated, tag = "1")]
    pub ranks: Vec<i32>,
}

// ---- Data operations ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateSpec {
    /// Zero to have the server mint a fresh id.
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(int32, tag = "3")]
    pub key_type: i32,
    #[prost(int32, tag = "4")]
    pub val_type: i32,
    #[prost(int32, tag = "5")]
    pub struct_type: i32,
    #[prost(int64, tag = "6")]
    pub read_refcount: i64,
    #[prost(int64, tag = "7")]
    pub write_refcount: i64,
    #[prost(bool, tag = "8")]
    pub permanent: bool,
    #[prost(bool, tag = "9")]
    pub release_write_refs: bool,
    #[prost(uint32, tag = "10")]
    pub symbol: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct CreateResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(int64, tag = "2")]
    pub id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MulticreateRequest {
    #[prost(message, repeated, tag = "1")]
    pub specs: Vec<CreateSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MulticreateResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    /// One id per spec, zero where creation failed.
    #[prost(int64, repeated, tag = "2")]
    pub ids: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExistsRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub subscript: Bytes,
    #[prost(message, optional, tag = "3")]
    pub decr: Option<Refc>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct BoolResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(bool, tag = "2")]
    pub result: bool,
}

/// Header for a store; the subscript and payload follow as their own
/// frames on the store subscript and store payload tags.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoreHeader {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(int64, tag = "3")]
    pub subscript_len: i64,
    #[prost(message, optional, tag = "4")]
    pub refcount_decr: Option<Refc>,
    /// Refcounts that readers of the stored value will take on any
    /// referands embedded in it.
    #[prost(message, optional, tag = "5")]
    pub store_refcounts: Option<Refc>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct StoreResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(message, optional, tag = "2")]
    pub notifs: Option<NotifCounts>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetrieveRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub subscript: Bytes,
    #[prost(message, optional, tag = "3")]
    pub decr_self: Option<Refc>,
    #[prost(message, optional, tag = "4")]
    pub incr_referand: Option<Refc>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RetrieveResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
    #[prost(message, optional, tag = "4")]
    pub notifs: Option<NotifCounts>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnumerateRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    /// Negative for "to the end".
    #[prost(int64, tag = "2")]
    pub count: i64,
    #[prost(int64, tag = "3")]
    pub offset: i64,
    #[prost(bool, tag = "4")]
    pub request_subscripts: bool,
    #[prost(bool, tag = "5")]
    pub request_members: bool,
    #[prost(message, optional, tag = "6")]
    pub decr: Option<Refc>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnumerateResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(int64, tag = "2")]
    pub records: i64,
    #[prost(int32, tag = "3")]
    pub key_type: i32,
    #[prost(int32, tag = "4")]
    pub val_type: i32,
    #[prost(bytes = "bytes", tag = "5")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub subscript: Bytes,
    /// Rank to notify; usually the requester itself, but servers
    /// subscribe on their own behalf for put-rules.
    #[prost(int32, tag = "3")]
    pub subscriber: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct SubscribeResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    /// False when the datum was already closed: no notification will
    /// ever arrive.
    #[prost(bool, tag = "2")]
    pub subscribed: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct RefcountIncrRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(message, optional, tag = "2")]
    pub change: Option<Refc>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct RefcountResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(message, optional, tag = "2")]
    pub notifs: Option<NotifCounts>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertAtomicRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub subscript: Bytes,
    #[prost(bool, tag = "3")]
    pub return_value: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertAtomicResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(bool, tag = "2")]
    pub created: bool,
    #[prost(bool, tag = "3")]
    pub value_present: bool,
    #[prost(int32, tag = "4")]
    pub value_type: i32,
    #[prost(bytes = "bytes", optional, tag = "5")]
    pub value: Option<Bytes>,
}

/// Shared by operations that carry only an id.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct IdRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TypeofResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ContainerTypeofResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(int32, tag = "2")]
    pub key_type: i32,
    #[prost(int32, tag = "3")]
    pub val_type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerReferenceRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(bytes = "bytes", tag = "2")]
    pub subscript: Bytes,
    /// The datum to be assigned once the subscript is present.
    #[prost(int64, tag = "3")]
    pub reference: i64,
    #[prost(int32, tag = "4")]
    pub ref_type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerSizeRequest {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(message, optional, tag = "2")]
    pub decr: Option<Refc>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct SizeResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(int64, tag = "2")]
    pub size: i64,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct LockResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(bool, tag = "2")]
    pub acquired: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct DataResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct UniqueResponse {
    #[prost(enumeration = "crate::DataCode", tag = "1")]
    pub dc: i32,
    #[prost(int64, tag = "2")]
    pub id: i64,
}

// ---- Server-to-server traffic ----

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum SyncMode {
    /// A regular cross-shard request follows the accepted sync.
    Request = 0,
    /// The caller wants to steal work.
    Steal = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncRequest {
    #[prost(enumeration = "SyncMode", tag = "1")]
    pub mode: i32,
    #[prost(message, optional, tag = "2")]
    pub steal: Option<StealRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StealRequest {
    #[prost(int64, tag = "1")]
    pub max_memory: i64,
    /// The caller's count of queued work per type.
    #[prost(int64, repeated, tag = "2")]
    pub work_type_counts: Vec<i64>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct SyncResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

/// A work unit in flight between servers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkUnitFrame {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(int32, tag = "2")]
    pub work_type: i32,
    #[prost(int32, tag = "3")]
    pub priority: i32,
    #[prost(int32, tag = "4")]
    pub putter: i32,
    #[prost(int32, tag = "5")]
    pub answer: i32,
    #[prost(int32, tag = "6")]
    pub target: i32,
    #[prost(int32, tag = "7")]
    pub parallelism: i32,
    #[prost(bytes = "bytes", tag = "8")]
    pub payload: Bytes,
}

/// One batch of stolen work. `last` closes the steal exchange.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StealBatch {
    #[prost(message, repeated, tag = "1")]
    pub units: Vec<WorkUnitFrame>,
    #[prost(bool, tag = "2")]
    pub last: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct CheckIdleRequest {
    #[prost(int64, tag = "1")]
    pub attempt: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckIdleResponse {
    #[prost(bool, tag = "1")]
    pub idle: bool,
    /// Types with parked requests, and queued work, per work type.
    #[prost(int64, repeated, tag = "2")]
    pub request_type_counts: Vec<i64>,
    #[prost(int64, repeated, tag = "3")]
    pub work_type_counts: Vec<i64>,
}

/// Broadcast by the master before aborting.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct FailNotice {
    #[prost(int32, tag = "1")]
    pub code: i32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_round_trip_over_the_wire() {
        let put = PutRequest {
            work_type: 2,
            priority: -7,
            putter: 1,
            answer: crate::RANK_NULL,
            target: crate::RANK_ANY,
            parallelism: 3,
            payload_len: 5,
            inline_payload: Some(Bytes::from_static(b"tasks")),
        };
        let decoded: PutRequest = decode("put", &encode(&put)).unwrap();
        assert_eq!(decoded, put);

        let store = StoreHeader {
            id: 42,
            data_type: 1,
            subscript_len: 3,
            refcount_decr: Some(Refc::WRITE),
            store_refcounts: Some(Refc::READ),
        };
        let decoded: StoreHeader = decode("store header", &encode(&store)).unwrap();
        assert_eq!(decoded, store);
    }

    #[test]
    fn notification_counts_total_their_parts() {
        let frame = NotificationFrame {
            id: 9,
            subscript: Bytes::from_static(b"k"),
            close_notify: vec![1, 2],
            insert_notify: vec![3],
            references: vec![10, 11, 12],
            value_type: 1,
            value: Bytes::new(),
        };
        assert_eq!(frame.counts().total(), 6);
        assert!(!frame.is_empty());
        assert!(NotificationFrame::default().is_empty());
    }

    #[test]
    fn refc_helpers() {
        assert!(Refc::NONE.is_none());
        assert!(!Refc::READ.is_none());
        assert_eq!(Refc::READ_WRITE.negate(), Refc::new(-1, -1));
    }
}
