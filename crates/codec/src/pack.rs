use crate::{
    vint, Container, DataType, DatumId, Error, Multiset, Result, StructRegistry, StructTypeId,
    StructValue, Value,
};
use bytes::Bytes;

/// Pack `value` into a freshly owned buffer.
pub fn packed(value: &Value) -> Bytes {
    let mut out = Vec::new();
    pack(value, &mut out);
    Bytes::from(out)
}

/// Append the payload of `value` to `out`, without an outer length
/// prefix. The outermost caller chooses whether a prefix is wanted; use
/// [`pack_entry`] to include one.
pub fn pack(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => (),
        Value::Integer(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
        Value::String(s) => {
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Value::Blob(b) => out.extend_from_slice(b),
        Value::Ref(id) => out.extend_from_slice(&id.0.to_le_bytes()),
        Value::Container(c) => pack_container(c, out),
        Value::Multiset(m) => pack_multiset(m, out),
        Value::Struct(s) => pack_struct(s, out),
    }
}

/// Append `value` prefixed with its payload length. Compound values use
/// a padded prefix: the slot is reserved up front, the payload appended
/// incrementally, and the actual length patched in afterwards.
pub fn pack_entry(value: &Value, out: &mut Vec<u8>) {
    if value.data_type().is_compound() {
        let slot = out.len();
        out.resize(slot + vint::MAX_BYTES, 0);
        let start = out.len();
        pack(value, out);
        let length = out.len() - start;
        vint::patch_padded(length as u64, out, slot);
    } else {
        vint::encode(scalar_len(value) as u64, out);
        pack(value, out);
    }
}

fn scalar_len(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Integer(_) | Value::Float(_) | Value::Ref(_) => 8,
        Value::String(s) => s.len() + 1,
        Value::Blob(b) => b.len(),
        Value::Container(_) | Value::Multiset(_) | Value::Struct(_) => {
            unreachable!("compound values use padded prefixes")
        }
    }
}

fn pack_container(c: &Container, out: &mut Vec<u8>) {
    vint::encode(c.key_type.code() as u64, out);
    vint::encode(c.val_type.code() as u64, out);
    vint::encode(c.linked_len() as u64, out);

    for (key, cell) in &c.members {
        // Reserved-but-unlinked cells have no value to emit.
        let Some(value) = cell else { continue };
        vint::encode(key.len() as u64, out);
        out.extend_from_slice(key);
        pack_entry(value, out);
    }
}

fn pack_multiset(m: &Multiset, out: &mut Vec<u8>) {
    vint::encode(m.elem_type.code() as u64, out);
    vint::encode(m.elems.len() as u64, out);
    for elem in &m.elems {
        pack_entry(elem, out);
    }
}

fn pack_struct(s: &StructValue, out: &mut Vec<u8>) {
    vint::encode(s.struct_type.0 as u64, out);
    vint::encode(s.fields.len() as u64, out);
    for field in &s.fields {
        match field {
            None => out.push(0),
            Some(value) => {
                out.push(1);
                pack_entry(value, out);
            }
        }
    }
}

/// Unpack a payload of the given type. Strings and blobs are copied
/// into freshly owned storage. Struct payloads resolve their field
/// types through `registry`.
pub fn unpack(ty: DataType, data: &[u8], registry: &StructRegistry) -> Result<Value> {
    let mut reader = Reader::new(data);
    let value = unpack_inner(ty, &mut reader, data.len(), registry)?;
    if reader.remaining() != 0 {
        return Err(Error::Malformed("trailing bytes after payload"));
    }
    Ok(value)
}

/// Read one length-prefixed entry of the given type from `reader`.
pub fn unpack_entry(ty: DataType, reader: &mut Reader<'_>, registry: &StructRegistry) -> Result<Value> {
    let length = reader.entry_len(ty)?;
    let mut sub = Reader::new(reader.take(length)?);
    unpack_inner(ty, &mut sub, length, registry)
}

fn unpack_inner(
    ty: DataType,
    reader: &mut Reader<'_>,
    length: usize,
    registry: &StructRegistry,
) -> Result<Value> {
    if length > crate::DATA_MAX {
        return Err(Error::TooLarge(length));
    }
    match ty {
        DataType::Null => {
            if length != 0 {
                return Err(Error::Malformed("null payload must be empty"));
            }
            Ok(Value::Null)
        }
        DataType::Integer => Ok(Value::Integer(i64::from_le_bytes(reader.fixed()?))),
        DataType::Float => Ok(Value::Float(f64::from_le_bytes(reader.fixed()?))),
        DataType::Ref => Ok(Value::Ref(DatumId(i64::from_le_bytes(reader.fixed()?)))),
        DataType::String => {
            let bytes = reader.take(length)?;
            let Some((0, contents)) = bytes.split_last() else {
                return Err(Error::Malformed("string payload lacks its terminator"));
            };
            let s = std::str::from_utf8(contents).map_err(|_| Error::BadString)?;
            Ok(Value::String(s.to_string()))
        }
        DataType::Blob => {
            let bytes = reader.take(length)?;
            Ok(Value::Blob(Bytes::copy_from_slice(bytes)))
        }
        DataType::Container => unpack_container(reader, registry),
        DataType::Multiset => unpack_multiset(reader, registry),
        DataType::Struct => unpack_struct(reader, registry),
    }
}

fn unpack_container(reader: &mut Reader<'_>, registry: &StructRegistry) -> Result<Value> {
    let key_type = DataType::from_code(reader.vint()? as i64)?;
    let val_type = DataType::from_code(reader.vint()? as i64)?;
    let entries = reader.vint()? as usize;

    let mut container = Container::new(key_type, val_type);
    for _ in 0..entries {
        let key_len = reader.vint()? as usize;
        let key: Box<[u8]> = reader.take(key_len)?.into();
        let value = unpack_entry(val_type, reader, registry)?;
        container.members.insert(key, Some(value));
    }
    Ok(Value::Container(container))
}

fn unpack_multiset(reader: &mut Reader<'_>, registry: &StructRegistry) -> Result<Value> {
    let elem_type = DataType::from_code(reader.vint()? as i64)?;
    let entries = reader.vint()? as usize;

    let mut multiset = Multiset::new(elem_type);
    for _ in 0..entries {
        multiset.elems.push(unpack_entry(elem_type, reader, registry)?);
    }
    Ok(Value::Multiset(multiset))
}

fn unpack_struct(reader: &mut Reader<'_>, registry: &StructRegistry) -> Result<Value> {
    let struct_type = StructTypeId(reader.vint()? as i32);
    let decl = registry.lookup(struct_type)?;
    let fields = reader.vint()? as usize;

    if fields != decl.fields.len() {
        return Err(Error::Malformed("struct field count does not match its type"));
    }
    let field_types: Vec<DataType> = decl.fields.iter().map(|f| f.val_type).collect();

    let mut value = StructValue {
        struct_type,
        fields: Vec::with_capacity(fields),
    };
    for field_type in field_types {
        match reader.byte()? {
            0 => value.fields.push(None),
            1 => value
                .fields
                .push(Some(unpack_entry(field_type, reader, registry)?)),
            _ => return Err(Error::Malformed("struct field presence byte must be 0 or 1")),
        }
    }
    Ok(Value::Struct(value))
}

/// A cursor over a packed payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn vint(&mut self) -> Result<u64> {
        let (value, used) = vint::decode(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    /// Read an entry length prefix: padded when the entry type is
    /// compound, a plain vint otherwise.
    pub fn entry_len(&mut self, ty: DataType) -> Result<usize> {
        let (value, used) = if ty.is_compound() {
            vint::decode_padded(&self.buf[self.pos..])?
        } else {
            vint::decode(&self.buf[self.pos..])?
        };
        self.pos += used;
        Ok(value as usize)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated {
                need: n,
                have: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        Ok(slice.try_into().expect("take returned N bytes"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::StructField;

    fn registry() -> StructRegistry {
        let mut registry = StructRegistry::new();
        registry
            .register(
                StructTypeId(7),
                crate::StructType {
                    name: "point".to_string(),
                    fields: vec![
                        StructField {
                            name: "x".to_string(),
                            val_type: DataType::Integer,
                        },
                        StructField {
                            name: "y".to_string(),
                            val_type: DataType::Integer,
                        },
                        StructField {
                            name: "label".to_string(),
                            val_type: DataType::String,
                        },
                    ],
                },
            )
            .unwrap();
        registry
    }

    fn round_trip(value: Value) {
        let packed = packed(&value);
        let unpacked = unpack(value.data_type(), &packed, &registry()).unwrap();
        assert_eq!(value, unpacked);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(Value::Null);
        round_trip(Value::Integer(0));
        round_trip(Value::Integer(i64::MIN));
        round_trip(Value::Integer(i64::MAX));
        round_trip(Value::Float(3.25));
        round_trip(Value::Float(f64::MIN_POSITIVE));
        round_trip(Value::String(String::new()));
        round_trip(Value::String("hello, world".to_string()));
        round_trip(Value::Blob(Bytes::from_static(b"\x00\x01\xff")));
        round_trip(Value::Ref(DatumId(42)));
    }

    #[test]
    fn containers_round_trip() {
        let mut c = Container::new(DataType::String, DataType::Integer);
        c.members.insert(b"a".to_vec().into(), Some(Value::Integer(1)));
        c.members.insert(b"b".to_vec().into(), Some(Value::Integer(2)));
        round_trip(Value::Container(c));
    }

    #[test]
    fn nested_compounds_round_trip() {
        let mut inner = Container::new(DataType::String, DataType::String);
        inner
            .members
            .insert(b"k".to_vec().into(), Some(Value::String("v".to_string())));

        let mut outer = Container::new(DataType::String, DataType::Container);
        outer
            .members
            .insert(b"inner".to_vec().into(), Some(Value::Container(inner)));
        round_trip(Value::Container(outer));
    }

    #[test]
    fn unlinked_cells_are_not_emitted() {
        let mut c = Container::new(DataType::String, DataType::Integer);
        c.members.insert(b"linked".to_vec().into(), Some(Value::Integer(9)));
        c.members.insert(b"reserved".to_vec().into(), None);

        let bytes = packed(&Value::Container(c));
        let Value::Container(unpacked) = unpack(DataType::Container, &bytes, &registry()).unwrap()
        else {
            panic!("expected a container")
        };
        assert_eq!(unpacked.members.len(), 1);
        assert!(unpacked.members.contains_key(b"linked".as_slice()));
    }

    #[test]
    fn multisets_round_trip() {
        let mut m = Multiset::new(DataType::String);
        m.elems.push(Value::String("one".to_string()));
        m.elems.push(Value::String("one".to_string()));
        m.elems.push(Value::String("two".to_string()));
        round_trip(Value::Multiset(m));
    }

    #[test]
    fn structs_round_trip() {
        round_trip(Value::Struct(StructValue {
            struct_type: StructTypeId(7),
            fields: vec![
                Some(Value::Integer(3)),
                None,
                Some(Value::String("origin".to_string())),
            ],
        }));
    }

    #[test]
    fn unset_scalar_payloads_are_rejected() {
        assert!(unpack(DataType::Integer, b"abc", &registry()).is_err());
        assert!(unpack(DataType::String, b"no terminator", &registry()).is_err());
        assert!(unpack(DataType::Null, b"x", &registry()).is_err());
    }

    #[test]
    fn referands_cover_every_embedding() {
        let mut c = Container::new(DataType::Ref, DataType::Ref);
        c.members.insert(
            Box::from(11i64.to_le_bytes().as_slice()),
            Some(Value::Ref(DatumId(12))),
        );

        let value = Value::Multiset(Multiset {
            elem_type: DataType::Container,
            elems: vec![Value::Container(c)],
        });

        let mut ids = Vec::new();
        value.referands(&mut ids);
        ids.sort();
        assert_eq!(ids, vec![DatumId(11), DatumId(12)]);
    }
}
