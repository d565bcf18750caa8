//! The sharded single-assignment data store.
//!
//! Each server owns one [`Store`]: a disjoint shard of datum ids mapped
//! to typed values with read and write reference counts. Writes close
//! and notify; counts reaching zero garbage-collect, recursively
//! releasing anything the value references. The store is purely local
//! state driven by one thread; cross-shard effects are returned to the
//! caller as [`Notifications`] to route.

mod datum;
mod notify;
mod refcount;
mod ops;

pub use datum::{CreateProps, Datum};
pub use notify::Notifications;
pub use ops::{EnumerateResult, InsertAtomicResult, Store};

use codec::{DataType, DatumId};
use proto::DataCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is already declared")]
    DoubleDeclare(DatumId),
    #[error("{0} is already assigned")]
    DoubleWrite(DatumId),
    #[error("{0} was read before it was written")]
    Unset(DatumId),
    #[error("{0} not found")]
    NotFound(DatumId),
    #[error("{id}[{subscript:?}] not found")]
    SubscriptNotFound { id: DatumId, subscript: String },
    #[error("operation expects {expected} but {id} is {found}")]
    WrongType {
        id: DatumId,
        expected: DataType,
        found: DataType,
    },
    #[error("a refcount of {0} would fall below zero")]
    RefcountNegative(DatumId),
    #[error("the null id is not a valid operand")]
    NullId,
    #[error("invalid operation: {0}")]
    Invalid(&'static str),
    #[error("limit exceeded: {0}")]
    Limit(&'static str),
    #[error(transparent)]
    Codec(codec::Error),
}

impl From<codec::Error> for Error {
    fn from(err: codec::Error) -> Self {
        Error::Codec(err)
    }
}

impl Error {
    /// The wire code reported to clients for this error.
    pub fn code(&self) -> DataCode {
        match self {
            Error::DoubleDeclare(_) => DataCode::DoubleDeclare,
            Error::DoubleWrite(_) => DataCode::DoubleWrite,
            Error::Unset(_) => DataCode::Unset,
            Error::NotFound(_) => DataCode::NotFound,
            Error::SubscriptNotFound { .. } => DataCode::SubscriptNotFound,
            Error::WrongType { .. } => DataCode::WrongType,
            Error::RefcountNegative(_) => DataCode::RefcountNegative,
            Error::NullId => DataCode::NullId,
            Error::Invalid(_) => DataCode::Invalid,
            Error::Limit(_) => DataCode::Limit,
            Error::Codec(err) => match err {
                codec::Error::WrongType { .. } => DataCode::WrongType,
                codec::Error::UnknownType(_) => DataCode::Invalid,
                codec::Error::TooLarge(_) => DataCode::Limit,
                codec::Error::BadString => DataCode::NumberFormat,
                _ => DataCode::Invalid,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Render a subscript for diagnostics.
pub(crate) fn subscript_repr(subscript: &[u8]) -> String {
    String::from_utf8_lossy(subscript).into_owned()
}
