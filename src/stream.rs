//! Byte-level access to the record file and the descriptor sidecars.
//!
//! [`RecordStream`] wraps the record file handle with typed little-endian
//! reads, absolute/relative seeks, and a `reopen` operation that preserves
//! the read position - the mechanism the update loop uses when the upstream
//! writer has appended more bytes.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{HeaderError, ReadError, Result};

/// A positioned reader over the record file.
#[derive(Debug)]
pub struct RecordStream {
    path: PathBuf,
    file: BufReader<File>,
    /// Current byte position. Tracked locally so error paths can report the
    /// offset without touching the handle.
    pos: u64,
}
impl RecordStream {
    /// Opens the record file for reading.
    ///
    /// # Errors
    ///
    /// `HeaderError::MissingOrEmpty` when the file is absent or zero-size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let missing = || HeaderError::MissingOrEmpty(path.display().to_string());
        let file = File::open(&path).map_err(|_| missing())?;
        if file.metadata()?.len() == 0 {
            return Err(missing().into());
        }
        Ok(Self {
            path,
            file: BufReader::new(file),
            pos: 0,
        })
    }

    fn truncated(&self, e: std::io::Error) -> ReadError {
        ReadError::Truncated(e, self.pos)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let v = self
            .file
            .read_u16::<LittleEndian>()
            .map_err(|e| self.truncated(e))?;
        self.pos += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let v = self
            .file
            .read_u32::<LittleEndian>()
            .map_err(|e| self.truncated(e))?;
        self.pos += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let v = self
            .file
            .read_u64::<LittleEndian>()
            .map_err(|e| self.truncated(e))?;
        self.pos += 8;
        Ok(v)
    }

    /// Fills the caller's buffer exactly, or fails with `Truncated`.
    pub fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf).map_err(|e| self.truncated(e))?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Absolute seek.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.pos = offset;
        Ok(())
    }

    /// Relative seek, used to skip over payload remainders.
    pub fn skip(&mut self, delta: i64) -> Result<()> {
        self.file.seek_relative(delta)?;
        self.pos = self.pos.wrapping_add_signed(delta);
        Ok(())
    }

    /// Current byte position.
    #[must_use]
    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Byte size of the record file via a stat query. Sees growth the
    /// current handle may not.
    pub fn byte_len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Closes and reopens the underlying handle, preserving the read
    /// position. Required after the upstream writer has appended: the old
    /// handle's idea of EOF is stale.
    pub fn reopen(&mut self) -> Result<()> {
        let mut file = BufReader::new(File::open(&self.path)?);
        file.seek(SeekFrom::Start(self.pos))?;
        self.file = file;
        Ok(())
    }
}

/// Reads a colon-delimited descriptor file: one content line per schema
/// record, tokenized on `:`, trailing whitespace ignored, blank lines
/// skipped.
///
/// # Errors
///
/// `HeaderError::MissingOrEmpty` when the file is absent or zero-size.
pub fn read_descriptor_lines<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<String>>> {
    let path = path.as_ref();
    let missing = || HeaderError::MissingOrEmpty(path.display().to_string());
    let file = File::open(path).map_err(|_| missing())?;
    if file.metadata()?.len() == 0 {
        return Err(missing().into());
    }
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        lines.push(line.split(':').map(str::to_owned).collect());
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::error::Error;

    fn temp_file(contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn open_rejects_empty_file() {
        let (_dir, path) = temp_file(b"");
        match RecordStream::open(&path) {
            Err(Error::Header(HeaderError::MissingOrEmpty(_))) => {}
            other => panic!("expected MissingOrEmpty, got {other:?}"),
        }
    }

    #[test]
    fn open_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.bin");
        assert!(RecordStream::open(&path).is_err());
    }

    #[test]
    fn typed_reads_and_seeks() -> Result<()> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xBEEFu16.to_le_bytes());
        bytes.extend_from_slice(&0xCAFE_F00Du32.to_le_bytes());
        bytes.extend_from_slice(&42u64.to_le_bytes());
        bytes.extend_from_slice(b"tail");
        let (_dir, path) = temp_file(&bytes);

        let mut stream = RecordStream::open(&path)?;
        assert_eq!(stream.read_u16()?, 0xBEEF);
        assert_eq!(stream.read_u32()?, 0xCAFE_F00D);
        assert_eq!(stream.read_u64()?, 42);
        assert_eq!(stream.tell(), 14);

        let mut buf = [0u8; 4];
        stream.read_exact_buf(&mut buf)?;
        assert_eq!(&buf, b"tail");

        stream.seek_to(2)?;
        assert_eq!(stream.read_u32()?, 0xCAFE_F00D);
        stream.skip(8)?;
        assert_eq!(stream.tell(), 14);
        assert_eq!(stream.byte_len()?, 18);
        Ok(())
    }

    #[test]
    fn short_read_reports_offset() {
        let (_dir, path) = temp_file(&[0u8; 3]);
        let mut stream = RecordStream::open(&path).unwrap();
        stream.read_u16().unwrap();
        match stream.read_u64() {
            Err(Error::Read(ReadError::Truncated(_, offset))) => assert_eq!(offset, 2),
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn reopen_preserves_position_and_sees_growth() -> Result<()> {
        let (_dir, path) = temp_file(&1u64.to_le_bytes());
        let mut stream = RecordStream::open(&path)?;
        assert_eq!(stream.read_u64()?, 1);

        // Simulate an appending writer.
        let mut handle = std::fs::OpenOptions::new().append(true).open(&path)?;
        handle.write_all(&2u64.to_le_bytes())?;
        handle.flush()?;

        assert_eq!(stream.byte_len()?, 16);
        stream.reopen()?;
        assert_eq!(stream.tell(), 8);
        assert_eq!(stream.read_u64()?, 2);
        Ok(())
    }

    #[test]
    fn descriptor_lines_tokenize_on_colons() -> Result<()> {
        let (_dir, path) = temp_file(b"0:100\n1:101  \n\n7:0:42:add\n");
        let lines = read_descriptor_lines(&path)?;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], vec!["0", "100"]);
        assert_eq!(lines[1], vec!["1", "101"]);
        assert_eq!(lines[2], vec!["7", "0", "42", "add"]);
        Ok(())
    }
}
