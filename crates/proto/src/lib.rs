//! Wire records exchanged between workers and servers.
//!
//! Every request is a packed record sent under a [`Tag`] and matched 1:1
//! with a reply record. Records are hand-maintained prost messages;
//! payload bytes ride either inline or as a follow-up frame on a
//! dedicated tag, so large transfers never block control traffic.

mod messages;
mod tags;

pub use messages::*;
pub use tags::Tag;

/// Target rank wildcard: any worker may receive the task.
pub const RANK_ANY: i32 = -100;
/// An absent rank.
pub const RANK_NULL: i32 = -200;

/// Payloads at most this long ride inline within a put request.
pub const PUT_INLINE_DATA_MAX: usize = 1024;

/// Maximal subscript length accepted on the wire.
pub const SUBSCRIPT_MAX: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to decode {0} record")]
    Decode(&'static str, #[source] prost::DecodeError),
    #[error("unknown message tag {0}")]
    UnknownTag(i32),
}

/// Outcome of a whole operation, carried in reply records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum Code {
    Success = 0,
    Error = 1,
    /// Rejected, e.g. a double-assignment. The server carries on.
    Rejected = 2,
    /// The cluster is shutting down.
    Shutdown = 3,
    /// No error, but nothing happened (e.g. iget found no work).
    Nothing = 4,
    /// The caller should retry (e.g. lock contention, sync rejection).
    Retry = 5,
    Done = 6,
}

/// Outcome of a data-layer operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum DataCode {
    Ok = 0,
    /// Allocation failed; fatal to the operation, never retried.
    Oom = 1,
    /// The id was declared twice.
    DoubleDeclare = 2,
    /// A single-assignment value was written twice.
    DoubleWrite = 3,
    /// A scalar was read before it was written.
    Unset = 4,
    NotFound = 5,
    SubscriptNotFound = 6,
    /// Malformed number in a payload.
    NumberFormat = 7,
    /// Malformed or invalid input.
    Invalid = 8,
    /// The null id was used as an operand.
    NullId = 9,
    /// Operation applied to the wrong data type.
    WrongType = 10,
    /// A reference count would fall below zero.
    RefcountNegative = 11,
    /// An implementation limit (id exhaustion, buffer size) was hit.
    Limit = 12,
    Unknown = 13,
}

impl DataCode {
    pub fn is_ok(self) -> bool {
        self == DataCode::Ok
    }
}
