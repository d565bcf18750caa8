//! Encoding of enumeration slices: a linear run of container or
//! multiset entries, with keys and/or values included on request.

use crate::pack::{pack_entry, unpack_entry, Reader};
use crate::{vint, DataType, Result, StructRegistry, Value};

/// Builds the packed payload returned by an enumerate operation.
pub struct SliceWriter {
    include_keys: bool,
    include_vals: bool,
    out: Vec<u8>,
    entries: usize,
}

impl SliceWriter {
    pub fn new(include_keys: bool, include_vals: bool) -> Self {
        Self {
            include_keys,
            include_vals,
            out: Vec::new(),
            entries: 0,
        }
    }

    pub fn push(&mut self, key: &[u8], value: Option<&Value>) {
        if self.include_keys {
            vint::encode(key.len() as u64, &mut self.out);
            self.out.extend_from_slice(key);
        }
        if self.include_vals {
            let value = value.expect("values requested but entry has none");
            pack_entry(value, &mut self.out);
        }
        self.entries += 1;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

/// One decoded slice entry.
#[derive(Debug, PartialEq)]
pub struct SliceEntry {
    pub key: Option<Vec<u8>>,
    pub value: Option<Value>,
}

/// Decodes the payload produced by [`SliceWriter`].
pub struct SliceReader<'a> {
    include_keys: bool,
    include_vals: bool,
    val_type: DataType,
    registry: &'a StructRegistry,
    reader: Reader<'a>,
}

impl<'a> SliceReader<'a> {
    pub fn new(
        data: &'a [u8],
        include_keys: bool,
        include_vals: bool,
        val_type: DataType,
        registry: &'a StructRegistry,
    ) -> Self {
        Self {
            include_keys,
            include_vals,
            val_type,
            registry,
            reader: Reader::new(data),
        }
    }

    pub fn next_entry(&mut self) -> Result<Option<SliceEntry>> {
        if self.reader.remaining() == 0 {
            return Ok(None);
        }
        let key = if self.include_keys {
            let len = self.reader.vint()? as usize;
            Some(self.reader.take(len)?.to_vec())
        } else {
            None
        };
        let value = if self.include_vals {
            Some(unpack_entry(self.val_type, &mut self.reader, self.registry)?)
        } else {
            None
        };
        Ok(Some(SliceEntry { key, value }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_and_values_round_trip() {
        let registry = StructRegistry::new();
        let mut writer = SliceWriter::new(true, true);
        writer.push(b"one", Some(&Value::Integer(1)));
        writer.push(b"two", Some(&Value::Integer(2)));
        assert_eq!(writer.entries(), 2);
        let data = writer.finish();

        let mut reader = SliceReader::new(&data, true, true, DataType::Integer, &registry);
        let first = reader.next_entry().unwrap().unwrap();
        assert_eq!(first.key.as_deref(), Some(b"one".as_slice()));
        assert_eq!(first.value, Some(Value::Integer(1)));
        let second = reader.next_entry().unwrap().unwrap();
        assert_eq!(second.key.as_deref(), Some(b"two".as_slice()));
        assert_eq!(second.value, Some(Value::Integer(2)));
        assert!(reader.next_entry().unwrap().is_none());
    }

    #[test]
    fn keys_only() {
        let registry = StructRegistry::new();
        let mut writer = SliceWriter::new(true, false);
        writer.push(b"k", None);
        let data = writer.finish();

        let mut reader = SliceReader::new(&data, true, false, DataType::Null, &registry);
        let entry = reader.next_entry().unwrap().unwrap();
        assert_eq!(entry.key.as_deref(), Some(b"k".as_slice()));
        assert_eq!(entry.value, None);
    }
}
