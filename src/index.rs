//! The heartbeat index: a fixed-stride mapping from tick to byte offset in
//! the record file.
//!
//! File layout:
//!
//! 1. A 28-byte ASCII header line `sparta_pipeout_version:NNNN\n` with a
//!    zero-padded 4-digit version.
//! 2. `heartbeat: u64` - ticks per bucket, always nonzero.
//! 3. A sequence of `u64` byte offsets. Entry `k` is the offset of the
//!    first record whose `end_tick` falls in bucket `[k·H, (k+1)·H)`.
//! 4. A final sentinel entry holding the byte offset of the last record's
//!    start.
//!
//! Records spanning a heartbeat boundary carry the `CONTINUE` flag and are
//! the only ones allowed to extend past their bucket's upper bound.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{HeaderError, Result};
use crate::record::RECORD_VERSION;

/// ASCII prefix of the index header line.
pub const INDEX_HEADER_PREFIX: &str = "sparta_pipeout_version:";

/// Total byte size of the index header line (prefix + 4 digits + newline).
pub const SIZE_INDEX_HEADER: usize = 28;

/// Byte offset of the first index entry (header + heartbeat).
pub const SIZE_INDEX_PREAMBLE: u64 = SIZE_INDEX_HEADER as u64 + 8;

/// The parsed heartbeat index. Supports open-ended append via [`reload`].
///
/// [`reload`]: HeartbeatIndex::reload
pub struct HeartbeatIndex {
    path: PathBuf,
    version: u32,
    heartbeat: u64,
    /// Per-bucket offsets, sentinel excluded.
    offsets: Vec<u64>,
    /// Byte offset of the last record's start.
    sentinel: u64,
}
impl HeartbeatIndex {
    /// Opens and validates the index file.
    ///
    /// # Errors
    ///
    /// `MissingOrEmpty` for an absent or zero-size file, `BadIndexHeader`
    /// for a mangled header line, `UnsupportedVersion` for any version
    /// other than [`RECORD_VERSION`], `ZeroHeartbeat` when the stride is 0.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let missing = || HeaderError::MissingOrEmpty(path.display().to_string());
        let file = File::open(&path).map_err(|_| missing())?;
        if file.metadata()?.len() == 0 {
            return Err(missing().into());
        }
        let mut reader = BufReader::new(file);

        let mut header = [0u8; SIZE_INDEX_HEADER];
        reader.read_exact(&mut header).map_err(|_| missing())?;
        let version = Self::parse_header_line(&header)?;
        if version != RECORD_VERSION {
            return Err(HeaderError::UnsupportedVersion(version).into());
        }

        let heartbeat = reader.read_u64::<LittleEndian>()?;
        if heartbeat == 0 {
            return Err(HeaderError::ZeroHeartbeat.into());
        }

        let (offsets, sentinel) = Self::read_entries(&mut reader)?;
        Ok(Self {
            path,
            version,
            heartbeat,
            offsets,
            sentinel,
        })
    }

    fn parse_header_line(header: &[u8; SIZE_INDEX_HEADER]) -> Result<u32> {
        let bad = || {
            HeaderError::BadIndexHeader(String::from_utf8_lossy(header).into_owned())
        };
        let prefix = INDEX_HEADER_PREFIX.as_bytes();
        if &header[..prefix.len()] != prefix || header[SIZE_INDEX_HEADER - 1] != b'\n' {
            return Err(bad().into());
        }
        let digits = std::str::from_utf8(&header[prefix.len()..SIZE_INDEX_HEADER - 1])
            .map_err(|_| bad())?;
        digits.parse::<u32>().map_err(|_| bad().into())
    }

    fn read_entries<R: Read>(reader: &mut R) -> Result<(Vec<u64>, u64)> {
        let mut entries = Vec::new();
        loop {
            match reader.read_u64::<LittleEndian>() {
                Ok(offset) => entries.push(offset),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        // The final entry is the sentinel pointing at the last record.
        let sentinel = entries.pop().unwrap_or(0);
        Ok((entries, sentinel))
    }

    /// Re-reads the entry table after the writer appended. The header and
    /// heartbeat are fixed for the lifetime of a database.
    pub fn reload(&mut self) -> Result<()> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(SIZE_INDEX_PREAMBLE))?;
        let (offsets, sentinel) = Self::read_entries(&mut reader)?;
        self.offsets = offsets;
        self.sentinel = sentinel;
        Ok(())
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat
    }

    /// Number of indexed heartbeat buckets.
    #[must_use]
    pub fn num_buckets(&self) -> usize {
        self.offsets.len()
    }

    /// Byte offset of the last record's start.
    #[must_use]
    pub fn sentinel_offset(&self) -> u64 {
        self.sentinel
    }

    /// The heartbeat bucket holding `tick`.
    #[must_use]
    pub fn bucket_of(&self, tick: u64) -> u64 {
        tick / self.heartbeat
    }

    /// Byte offset where bucket `bucket` begins, or `record_file_len` when
    /// the bucket lies past the index's coverage ("scan to end").
    #[must_use]
    pub fn bucket_offset(&self, bucket: u64, record_file_len: u64) -> u64 {
        usize::try_from(bucket)
            .ok()
            .and_then(|b| self.offsets.get(b).copied())
            .unwrap_or(record_file_len)
    }

    /// Byte offset of the first record that can end in `tick`'s bucket.
    #[must_use]
    pub fn offset_for(&self, tick: u64, record_file_len: u64) -> u64 {
        self.bucket_offset(self.bucket_of(tick), record_file_len)
    }

    /// Byte offset one bucket *past* `tick`'s bucket, the exclusive stop
    /// bound for a range scan. Includes the adjacent bucket because records
    /// spanning a single heartbeat boundary are indexed by their end tick.
    #[must_use]
    pub fn end_offset_for(&self, tick: u64, record_file_len: u64) -> u64 {
        self.bucket_offset(self.bucket_of(tick) + 2, record_file_len)
    }
}
