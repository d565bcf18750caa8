use crate::{DataType, Error, Result};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Identifier of a datum in the sharded store.
///
/// Zero is the null id. Positive ids are user data; negative ids are
/// reserved for system use (per-server administrative containers).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DatumId(pub i64);

impl DatumId {
    pub const NULL: DatumId = DatumId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for DatumId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

impl std::fmt::Debug for DatumId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

/// Identifier of a registered struct type.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StructTypeId(pub i32);

impl std::fmt::Display for StructTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "struct{}", self.0)
    }
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Bytes),
    Ref(DatumId),
    Container(Container),
    Multiset(Multiset),
    Struct(StructValue),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Blob(_) => DataType::Blob,
            Value::Ref(_) => DataType::Ref,
            Value::Container(_) => DataType::Container,
            Value::Multiset(_) => DataType::Multiset,
            Value::Struct(_) => DataType::Struct,
        }
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            other => Err(Error::WrongType {
                expected: DataType::Integer,
                found: other.data_type(),
            }),
        }
    }

    pub fn as_ref_id(&self) -> Result<DatumId> {
        match self {
            Value::Ref(id) => Ok(*id),
            other => Err(Error::WrongType {
                expected: DataType::Ref,
                found: other.data_type(),
            }),
        }
    }

    /// Collect the ids of every datum referenced from inside this value:
    /// refs name their target, containers contribute each linked value
    /// (and each key when the key type is ref), multisets each element,
    /// structs each set field. Scalars contribute nothing.
    pub fn referands(&self, out: &mut Vec<DatumId>) {
        match self {
            Value::Null
            | Value::Integer(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Blob(_) => (),
            Value::Ref(id) => out.push(*id),
            Value::Container(c) => {
                for (key, cell) in &c.members {
                    if c.key_type == DataType::Ref {
                        if let Ok(bytes) = <[u8; 8]>::try_from(key.as_ref()) {
                            out.push(DatumId(i64::from_le_bytes(bytes)));
                        }
                    }
                    if let Some(value) = cell {
                        value.referands(out);
                    }
                }
            }
            Value::Multiset(m) => {
                for elem in &m.elems {
                    elem.referands(out);
                }
            }
            Value::Struct(s) => {
                for field in s.fields.iter().flatten() {
                    field.referands(out);
                }
            }
        }
    }
}

/// A typed key/value container. An entry whose cell is `None` was
/// reserved by an atomic insert and not yet linked to a value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Container {
    pub key_type: DataType,
    pub val_type: DataType,
    pub members: BTreeMap<Box<[u8]>, Option<Value>>,
}

impl Container {
    pub fn new(key_type: DataType, val_type: DataType) -> Self {
        Self {
            key_type,
            val_type,
            members: BTreeMap::new(),
        }
    }

    /// Number of linked entries (reserved-but-unlinked cells excluded).
    pub fn linked_len(&self) -> usize {
        self.members.values().filter(|cell| cell.is_some()).count()
    }
}

/// A typed append-only multiset.
#[derive(Debug, Clone, PartialEq)]
pub struct Multiset {
    pub elem_type: DataType,
    pub elems: Vec<Value>,
}

impl Multiset {
    pub fn new(elem_type: DataType) -> Self {
        Self {
            elem_type,
            elems: Vec::new(),
        }
    }
}

/// An instance of a registered struct type. Unset fields are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub struct_type: StructTypeId,
    pub fields: Vec<Option<Value>>,
}

/// One declared field of a struct type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub val_type: DataType,
}

/// A declared struct type: a name plus numbered, typed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

/// Registry of struct types, threaded through the codec and the store.
#[derive(Debug, Default)]
pub struct StructRegistry {
    types: std::collections::HashMap<StructTypeId, StructType>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: StructTypeId, decl: StructType) -> Result<()> {
        if self.types.contains_key(&id) {
            return Err(Error::Malformed("struct type registered twice"));
        }
        self.types.insert(id, decl);
        Ok(())
    }

    pub fn lookup(&self, id: StructTypeId) -> Result<&StructType> {
        self.types.get(&id).ok_or(Error::UnknownStructType(id))
    }

    /// Resolve a textual field subscript to its index within the type.
    pub fn field_index(&self, id: StructTypeId, name: &str) -> Result<usize> {
        let decl = self.lookup(id)?;
        decl.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| Error::UnknownStructField(id, name.to_string()))
    }

    /// Construct an empty instance of the given struct type.
    pub fn instantiate(&self, id: StructTypeId) -> Result<StructValue> {
        let decl = self.lookup(id)?;
        Ok(StructValue {
            struct_type: id,
            fields: vec![None; decl.fields.len()],
        })
    }
}
