//! Typed value codec for the data store.
//!
//! Every datum payload on the wire and at rest is a self-describing byte
//! buffer produced by [`pack`] and consumed by [`unpack`]. Compound values
//! (containers, multisets, structs) embed their element payloads with
//! padded length prefixes so that nested payloads can be written
//! incrementally and the enclosing length patched in afterwards.

mod pack;
mod slice;
mod value;
pub mod vint;

pub use pack::{pack, pack_entry, packed, unpack, unpack_entry, Reader};
pub use slice::{SliceEntry, SliceReader, SliceWriter};
pub use value::{
    Container, DatumId, Multiset, StructField, StructRegistry, StructType, StructTypeId,
    StructValue, Value,
};

/// The maximal length of a single datum payload (string, blob, etc.).
pub const DATA_MAX: usize = 20 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("truncated payload: need {need} bytes but only {have} remain")]
    Truncated { need: usize, have: usize },
    #[error("type mismatch: expected {expected:?} but payload is {found:?}")]
    WrongType { expected: DataType, found: DataType },
    #[error("unknown data type code {0}")]
    UnknownType(i64),
    #[error("struct type {0} is not registered")]
    UnknownStructType(StructTypeId),
    #[error("struct type {0} has no field {1:?}")]
    UnknownStructField(StructTypeId, String),
    #[error("string payload is not valid UTF-8")]
    BadString,
    #[error("payload of {0} bytes exceeds the {DATA_MAX}-byte limit")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The type of a stored value. Codes are stable and appear in packed
/// payloads and wire headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum DataType {
    #[default]
    Null = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    Blob = 4,
    Container = 5,
    Multiset = 6,
    Struct = 7,
    Ref = 8,
}

impl DataType {
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(DataType::Null),
            1 => Ok(DataType::Integer),
            2 => Ok(DataType::Float),
            3 => Ok(DataType::String),
            4 => Ok(DataType::Blob),
            5 => Ok(DataType::Container),
            6 => Ok(DataType::Multiset),
            7 => Ok(DataType::Struct),
            8 => Ok(DataType::Ref),
            code => Err(Error::UnknownType(code)),
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    /// Compound payloads carry padded length prefixes so they can be
    /// appended incrementally without a second sizing pass.
    pub fn is_compound(self) -> bool {
        matches!(self, DataType::Container | DataType::Multiset | DataType::Struct)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Null => "null",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Blob => "blob",
            DataType::Container => "container",
            DataType::Multiset => "multiset",
            DataType::Struct => "struct",
            DataType::Ref => "ref",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra type information carried by compound declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeExtra {
    None,
    Container { key: DataType, val: DataType },
    Multiset { elem: DataType },
    Struct { struct_type: StructTypeId },
}

impl Default for TypeExtra {
    fn default() -> Self {
        TypeExtra::None
    }
}
