//! Checkpoint log file framing.
//!
//! A checkpoint file is organized in fixed-size blocks striped across
//! ranks: rank `r` of `R` owns blocks `r, r + R, r + 2R, ...`, so every
//! rank appends to its own logical stream without coordination. Within
//! a stream, each record is framed as
//!
//! ```text
//! sync(4) crc32(4) vint(rec_len) vint(key_len) key value
//! ```
//!
//! with the CRC covering everything after itself. A record with
//! `rec_len == 0` marks the end of a rank's stream. A CRC or sync
//! mismatch resynchronizes to the next sync marker.
//!
//! This module is a boundary: the store interacts with it only through
//! [`XptWriter::write_record`] and [`XptReader::read_record`].

use std::io::{Read, Seek, SeekFrom, Write};

/// Marks the start of every record.
pub const SYNC_MARKER: u32 = 0x5F1C_0B73;

/// Default size of one striped block.
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("record length field is malformed")]
    BadLength,
    #[error("checkpoint value of {0} bytes exceeds the record limit")]
    TooLarge(usize),
    #[error("no sync marker found before end of stream")]
    NoSync,
}

pub type Result<T> = std::result::Result<T, Error>;

/// One recovered record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Maps a rank's logical stream offset onto the physical file, striding
/// over blocks owned by other ranks.
#[derive(Debug, Clone, Copy)]
struct Striping {
    rank: u64,
    ranks: u64,
    block_size: u64,
}

impl Striping {
    fn physical(&self, logical: u64) -> u64 {
        let block = logical / self.block_size;
        let within = logical % self.block_size;
        (block * self.ranks + self.rank) * self.block_size + within
    }

    /// Bytes remaining in the block containing `logical`.
    fn remaining_in_block(&self, logical: u64) -> u64 {
        self.block_size - (logical % self.block_size)
    }
}

/// Appends one rank's records to a checkpoint file.
pub struct XptWriter<W> {
    inner: W,
    striping: Striping,
    logical: u64,
    finished: bool,
}

impl XptWriter<std::fs::File> {
    pub fn create(path: &std::path::Path, rank: usize, ranks: usize) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self::new(file, rank, ranks, DEFAULT_BLOCK_SIZE))
    }
}

impl<W: Write + Seek> XptWriter<W> {
    pub fn new(inner: W, rank: usize, ranks: usize, block_size: u64) -> Self {
        assert!(ranks > 0 && rank < ranks);
        assert!(block_size >= 64, "blocks must hold at least one small record");
        Self {
            inner,
            striping: Striping {
                rank: rank as u64,
                ranks: ranks as u64,
                block_size,
            },
            logical: 0,
            finished: false,
        }
    }

    /// Append one framed record, returning its logical offset.
    pub fn write_record(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        assert!(!self.finished, "writer already finished");
        if value.len() > codec::DATA_MAX - 1 {
            return Err(Error::TooLarge(value.len()));
        }
        let offset = self.logical;

        let mut key_len_enc = Vec::new();
        codec::vint::encode(key.len() as u64, &mut key_len_enc);
        let rec_len = key_len_enc.len() + key.len() + value.len();
        let mut rec_len_enc = Vec::new();
        codec::vint::encode(rec_len as u64, &mut rec_len_enc);

        let mut crc = flate2::Crc::new();
        crc.update(&rec_len_enc);
        crc.update(&key_len_enc);
        crc.update(key);
        crc.update(value);

        self.put(&SYNC_MARKER.to_le_bytes())?;
        self.put(&crc.sum().to_le_bytes())?;
        self.put(&rec_len_enc)?;
        self.put(&key_len_enc)?;
        self.put(key)?;
        self.put(value)?;
        tracing::trace!(offset, rec_len, "checkpoint record written");
        Ok(offset)
    }

    /// Write the end-of-stream marker and flush.
    pub fn finish(&mut self) -> Result<()> {
        let mut rec_len_enc = Vec::new();
        codec::vint::encode(0, &mut rec_len_enc);
        let mut crc = flate2::Crc::new();
        crc.update(&rec_len_enc);

        self.put(&SYNC_MARKER.to_le_bytes())?;
        self.put(&crc.sum().to_le_bytes())?;
        self.put(&rec_len_enc)?;
        self.inner.flush()?;
        self.finished = true;
        Ok(())
    }

    /// Write bytes at the logical cursor, spilling across the rank's
    /// blocks as they fill.
    fn put(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (self.striping.remaining_in_block(self.logical) as usize).min(data.len());
            self.inner
                .seek(SeekFrom::Start(self.striping.physical(self.logical)))?;
            self.inner.write_all(&data[..take])?;
            self.logical += take as u64;
            data = &data[take..];
        }
        Ok(())
    }
}

/// Reads one rank's records back out of a checkpoint file.
pub struct XptReader<R> {
    inner: R,
    striping: Striping,
    logical: u64,
    end: u64,
}

impl XptReader<std::fs::File> {
    pub fn open(path: &std::path::Path, rank: usize, ranks: usize) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::new(file, rank, ranks, DEFAULT_BLOCK_SIZE)
    }
}

impl<R: Read + Seek> XptReader<R> {
    pub fn new(mut inner: R, rank: usize, ranks: usize, block_size: u64) -> Result<Self> {
        assert!(ranks > 0 && rank < ranks);
        let physical_end = inner.seek(SeekFrom::End(0))?;
        let striping = Striping {
            rank: rank as u64,
            ranks: ranks as u64,
            block_size,
        };
        // Upper bound of the rank's logical stream length.
        let blocks = (physical_end + block_size - 1) / block_size;
        let owned = (blocks + striping.ranks - 1) / striping.ranks;
        let end = owned * block_size;
        Ok(Self {
            inner,
            striping,
            logical: 0,
            end,
        })
    }

    /// Read the next record, skipping damage. Returns `None` at the
    /// end-of-stream marker or when the stream is exhausted.
    pub fn read_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.try_read_record() {
                Ok(done) => return Ok(done),
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(Error::NoSync) => return Ok(None),
                Err(err) => {
                    tracing::warn!(offset = self.logical, %err, "corrupt checkpoint record; resyncing");
                    self.resync()?;
                }
            }
        }
    }

    fn try_read_record(&mut self) -> Result<Option<Record>> {
        let start = self.logical;

        let mut sync = [0u8; 4];
        self.take(&mut sync)?;
        if u32::from_le_bytes(sync) != SYNC_MARKER {
            // Rewind past the bad word so resync scans from here.
            self.logical = start + 1;
            return Err(Error::BadLength);
        }
        let mut crc_stored = [0u8; 4];
        self.take(&mut crc_stored)?;
        let crc_stored = u32::from_le_bytes(crc_stored);

        let (rec_len, rec_len_enc) = self.read_vint()?;
        let mut crc = flate2::Crc::new();
        crc.update(&rec_len_enc);

        if rec_len == 0 {
            return if crc.sum() == crc_stored {
                Ok(None) // End-of-stream marker.
            } else {
                self.logical = start + 1;
                Err(Error::BadLength)
            };
        }

        let mut body = vec![0u8; rec_len as usize];
        self.take(&mut body)?;
        crc.update(&body);
        if crc.sum() != crc_stored {
            self.logical = start + 1;
            return Err(Error::BadLength);
        }

        let (key_len, used) = codec::vint::decode(&body).map_err(|_| Error::BadLength)?;
        let rest = &body[used..];
        if (key_len as usize) > rest.len() {
            self.logical = start + 1;
            return Err(Error::BadLength);
        }
        let (key, value) = rest.split_at(key_len as usize);
        Ok(Some(Record {
            key: key.to_vec(),
            value: value.to_vec(),
        }))
    }

    /// Scan forward for the next sync marker.
    pub fn resync(&mut self) -> Result<()> {
        let mut window = [0u8; 4];
        while self.logical + 4 <= self.end {
            let at = self.logical;
            match self.peek(&mut window, at) {
                Ok(()) if u32::from_le_bytes(window) == SYNC_MARKER => {
                    self.logical = at;
                    tracing::debug!(offset = at, "resynchronized");
                    return Ok(());
                }
                Ok(()) => self.logical = at + 1,
                Err(_) => return Err(Error::NoSync),
            }
        }
        Err(Error::NoSync)
    }

    fn take(&mut self, buf: &mut [u8]) -> Result<()> {
        let at = self.logical;
        self.peek(buf, at)?;
        self.logical = at + buf.len() as u64;
        Ok(())
    }

    fn peek(&mut self, buf: &mut [u8], mut logical: u64) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let take = (self.striping.remaining_in_block(logical) as usize).min(buf.len() - filled);
            self.inner
                .seek(SeekFrom::Start(self.striping.physical(logical)))?;
            self.inner.read_exact(&mut buf[filled..filled + take])?;
            filled += take;
            logical += take as u64;
        }
        Ok(())
    }

    fn read_vint(&mut self) -> Result<(u64, Vec<u8>)> {
        let mut enc = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            self.take(&mut byte)?;
            enc.push(byte[0]);
            if byte[0] & 0x80 == 0 {
                break;
            }
            if enc.len() > codec::vint::MAX_BYTES {
                return Err(Error::BadLength);
            }
        }
        let (value, _) = codec::vint::decode(&enc).map_err(|_| Error::BadLength)?;
        Ok((value, enc))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn round_trip(block_size: u64) {
        let mut file = Cursor::new(Vec::new());
        let mut writer = XptWriter::new(&mut file, 0, 2, block_size);
        writer.write_record(b"alpha", b"one").unwrap();
        writer.write_record(b"beta", &vec![7u8; 300]).unwrap();
        writer.write_record(b"", b"keyless").unwrap();
        writer.finish().unwrap();

        let mut reader = XptReader::new(Cursor::new(file.into_inner()), 0, 2, block_size).unwrap();
        let first = reader.read_record().unwrap().unwrap();
        assert_eq!((first.key.as_slice(), first.value.as_slice()), (b"alpha".as_slice(), b"one".as_slice()));
        let second = reader.read_record().unwrap().unwrap();
        assert_eq!(second.key, b"beta");
        assert_eq!(second.value, vec![7u8; 300]);
        let third = reader.read_record().unwrap().unwrap();
        assert!(third.key.is_empty());
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn records_round_trip() {
        round_trip(DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn records_span_block_boundaries() {
        // Blocks far smaller than the second record force spills.
        round_trip(64);
    }

    #[test]
    fn ranks_stripe_disjoint_blocks() {
        let mut backing = Cursor::new(Vec::new());
        let mut w0 = XptWriter::new(&mut backing, 0, 2, 64);
        w0.write_record(b"rank", b"zero").unwrap();
        w0.finish().unwrap();

        let inner = backing.into_inner();
        let mut backing = Cursor::new(inner);
        let mut w1 = XptWriter::new(&mut backing, 1, 2, 64);
        w1.write_record(b"rank", b"one").unwrap();
        w1.finish().unwrap();

        let bytes = backing.into_inner();
        let mut r0 = XptReader::new(Cursor::new(bytes.clone()), 0, 2, 64).unwrap();
        assert_eq!(r0.read_record().unwrap().unwrap().value, b"zero");
        let mut r1 = XptReader::new(Cursor::new(bytes), 1, 2, 64).unwrap();
        assert_eq!(r1.read_record().unwrap().unwrap().value, b"one");
    }

    #[test]
    fn corruption_resynchronizes_to_the_next_record() {
        let mut file = Cursor::new(Vec::new());
        let mut writer = XptWriter::new(&mut file, 0, 1, 1024);
        writer.write_record(b"good", b"first").unwrap();
        writer.write_record(b"good", b"second").unwrap();
        writer.finish().unwrap();

        let mut bytes = file.into_inner();
        // Damage the first record's value.
        bytes[14] ^= 0xff;

        let mut reader = XptReader::new(Cursor::new(bytes), 0, 1, 1024).unwrap();
        let recovered = reader.read_record().unwrap().unwrap();
        assert_eq!(recovered.value, b"second");
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn files_on_disk_work_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.xpt");
        {
            let mut writer = XptWriter::create(&path, 0, 1).unwrap();
            writer.write_record(b"k", b"v").unwrap();
            writer.finish().unwrap();
        }
        let mut reader = XptReader::open(&path, 0, 1).unwrap();
        let record = reader.read_record().unwrap().unwrap();
        assert_eq!(record.key, b"k");
        assert_eq!(record.value, b"v");
    }
}
