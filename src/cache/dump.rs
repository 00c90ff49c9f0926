//! Dump file format for cache persistence.
//!
//! A dump is a sequence of fixed-shape rows, one per posting:
//! `{word_hash, container_size_at_dump_time, update_time, doc_hash,
//! encoded_posting}`, framed by a small header and trailed by a CRC32 of
//! the row bytes. Restore order is insertion order into the cache and is
//! not required to match dump order. A failed checksum or a truncated row
//! aborts the restore with [`NeritaError::Corruption`], the one fatal
//! startup condition.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{NeritaError, Result};
use crate::index::{DocHash, Posting, WordHash, HASH_LEN};

const DUMP_MAGIC: u32 = 0x4e52_4954; // "NRIT"
const DUMP_VERSION: u16 = 1;

/// One dump row: a single posting together with its cache bookkeeping.
#[derive(Debug, Clone)]
pub struct DumpRow {
    /// Word the posting belongs to.
    pub word: WordHash,

    /// Size of the container at dump time (diagnostic, not replayed).
    pub container_size: u32,

    /// Cache update time of the container, epoch millis.
    pub update_time: u64,

    /// Document hash (redundant with the encoded posting, kept for the
    /// fixed row shape).
    pub doc: DocHash,

    /// The posting itself.
    pub posting: Posting,
}

/// Streaming dump writer.
pub struct DumpWriter {
    writer: BufWriter<File>,
    hasher: crc32fast::Hasher,
    rows: u64,
}

impl DumpWriter {
    /// Create a dump file, truncating any existing one.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_u32::<BigEndian>(DUMP_MAGIC)?;
        writer.write_u16::<BigEndian>(DUMP_VERSION)?;
        writer.write_u64::<BigEndian>(0)?; // row count, patched in finish()
        Ok(DumpWriter {
            writer,
            hasher: crc32fast::Hasher::new(),
            rows: 0,
        })
    }

    /// Append one row.
    pub fn write_row(&mut self, row: &DumpRow) -> Result<()> {
        let encoded = bincode::serialize(&row.posting)
            .map_err(|e| NeritaError::serialization(format!("posting encode: {e}")))?;
        if encoded.len() > u16::MAX as usize {
            return Err(NeritaError::serialization("posting row too large"));
        }

        let mut buf = Vec::with_capacity(HASH_LEN * 2 + 14 + encoded.len());
        buf.extend_from_slice(row.word.as_bytes());
        buf.write_u32::<BigEndian>(row.container_size)?;
        buf.write_u64::<BigEndian>(row.update_time)?;
        buf.extend_from_slice(row.doc.as_bytes());
        buf.write_u16::<BigEndian>(encoded.len() as u16)?;
        buf.extend_from_slice(&encoded);

        self.hasher.update(&buf);
        self.writer.write_all(&buf)?;
        self.rows += 1;
        Ok(())
    }

    /// Write the checksum, patch the row count and close the file.
    /// Returns the number of rows written.
    pub fn finish(self) -> Result<u64> {
        let DumpWriter { mut writer, hasher, rows } = self;
        writer.write_u32::<BigEndian>(hasher.finalize())?;
        writer.flush()?;
        let mut file = writer
            .into_inner()
            .map_err(|e| NeritaError::storage(format!("dump flush: {e}")))?;
        file.seek(SeekFrom::Start(6))?;
        file.write_u64::<BigEndian>(rows)?;
        file.sync_all()?;
        Ok(rows)
    }
}

/// Streaming dump reader; verifies the checksum after the last row.
pub struct DumpReader {
    reader: BufReader<File>,
    hasher: crc32fast::Hasher,
    remaining: u64,
    verified: bool,
}

impl DumpReader {
    /// Open a dump file and validate its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != DUMP_MAGIC {
            return Err(NeritaError::corruption(format!("bad magic {magic:#x}")));
        }
        let version = reader.read_u16::<BigEndian>()?;
        if version != DUMP_VERSION {
            return Err(NeritaError::corruption(format!("unsupported dump version {version}")));
        }
        let remaining = reader.read_u64::<BigEndian>()?;
        Ok(DumpReader {
            reader,
            hasher: crc32fast::Hasher::new(),
            remaining,
            verified: false,
        })
    }

    /// Rows announced by the header.
    pub fn row_count(&self) -> u64 {
        self.remaining
    }

    fn read_row(&mut self) -> Result<DumpRow> {
        let mut fixed = [0u8; HASH_LEN + 12];
        self.reader
            .read_exact(&mut fixed)
            .map_err(|e| NeritaError::corruption(format!("truncated row: {e}")))?;
        let mut word = [0u8; HASH_LEN];
        word.copy_from_slice(&fixed[..HASH_LEN]);
        let mut tail = &fixed[HASH_LEN..];
        let container_size = tail.read_u32::<BigEndian>()?;
        let update_time = tail.read_u64::<BigEndian>()?;

        let mut doc = [0u8; HASH_LEN];
        self.reader
            .read_exact(&mut doc)
            .map_err(|e| NeritaError::corruption(format!("truncated row: {e}")))?;
        let len = self
            .reader
            .read_u16::<BigEndian>()
            .map_err(|e| NeritaError::corruption(format!("truncated row: {e}")))?;
        let mut encoded = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut encoded)
            .map_err(|e| NeritaError::corruption(format!("truncated row: {e}")))?;

        self.hasher.update(&fixed);
        self.hasher.update(&doc);
        self.hasher.update(&(len.to_be_bytes()));
        self.hasher.update(&encoded);

        let posting: Posting = bincode::deserialize(&encoded)
            .map_err(|e| NeritaError::corruption(format!("posting decode: {e}")))?;

        Ok(DumpRow {
            word: WordHash(word),
            container_size,
            update_time,
            doc: DocHash(doc),
            posting,
        })
    }

    fn verify(&mut self) -> Result<()> {
        let expected = self
            .reader
            .read_u32::<BigEndian>()
            .map_err(|e| NeritaError::corruption(format!("missing checksum: {e}")))?;
        let actual = std::mem::take(&mut self.hasher).finalize();
        if expected != actual {
            return Err(NeritaError::corruption(format!(
                "checksum mismatch: stored {expected:#x}, computed {actual:#x}"
            )));
        }
        self.verified = true;
        Ok(())
    }
}

impl Iterator for DumpReader {
    type Item = Result<DumpRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            if !self.verified {
                if let Err(e) = self.verify() {
                    return Some(Err(e));
                }
            }
            return None;
        }
        self.remaining -= 1;
        Some(self.read_row())
    }
}
