//!
//! Framed record files
//! -------------------
//! Every on-disk record is `magic(2) | size(4) | payload | crc(2)`, all
//! little-endian, payload being a bincode message. The reader is resilient:
//! on bad magic, an implausible size, a short read, a CRC mismatch or an
//! undecodable payload it backs up to one byte past the failed header and
//! scans forward for the next plausible frame, so one corrupt record costs
//! at most that record.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::error::{Result, StoreError};

pub const RECORD_MAGIC: u16 = 0xDEAD;
pub const MAX_RECORD_SIZE: u32 = 4 * 1024 * 1024;

/// 16-bit payload checksum: the low half of a crc32.
fn payload_crc(payload: &[u8]) -> u16 {
    crc32fast::hash(payload) as u16
}

/// Appends framed records to a file.
pub struct RecordWriter {
    file: File,
}

impl RecordWriter {
    /// Open for appending, creating the file if needed.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(RecordWriter { file })
    }

    /// Create a brand-new file; fails if it already exists. Used by the
    /// indexed-file producer, which must be able to seek back to offset 0.
    pub fn create_new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(RecordWriter { file })
    }

    pub fn write<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let payload = bincode::serialize(msg)?;
        if payload.len() > MAX_RECORD_SIZE as usize {
            return Err(StoreError::InvalidArgument(format!(
                "record of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_RECORD_SIZE
            )));
        }
        self.file.write_all(&RECORD_MAGIC.to_le_bytes())?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.write_all(&payload_crc(&payload).to_le_bytes())?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Push written records to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Reads framed records, resynchronizing past corruption.
pub struct RecordReader {
    file: File,
    len: u64,
    path: String,
}

impl RecordReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(RecordReader {
            file,
            len,
            path: path.as_ref().display().to_string(),
        })
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Yield the next decodable record, or `None` at (effective) EOF.
    pub fn next<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let start = self.file.stream_position().ok()?;
            let magic = self.read_u16()?;
            if magic != RECORD_MAGIC {
                if !self.resync(start + 1) {
                    return None;
                }
                continue;
            }
            let size = self.read_u32()?;
            if size > MAX_RECORD_SIZE || size as u64 >= self.len {
                warn!(target: "tidemark::framing", "implausible record size {size} at {start:#x} in {}", self.path);
                if !self.resync(start + 1) {
                    return None;
                }
                continue;
            }
            let mut payload = vec![0u8; size as usize];
            if self.file.read_exact(&mut payload).is_err() {
                return None;
            }
            let crc = self.read_u16()?;
            if crc != payload_crc(&payload) {
                warn!(target: "tidemark::framing", "crc mismatch at {start:#x} in {}", self.path);
                if !self.resync(start + 1) {
                    return None;
                }
                continue;
            }
            match bincode::deserialize(&payload) {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    warn!(target: "tidemark::framing", "undecodable record at {start:#x} in {}: {e}", self.path);
                    if !self.resync(start + 1) {
                        return None;
                    }
                }
            }
        }
    }

    /// Scan forward from `from` for the next plausible frame header. Leaves
    /// the cursor at the header on success.
    fn resync(&mut self, from: u64) -> bool {
        let mut pos = from;
        loop {
            if self.file.seek(SeekFrom::Start(pos)).is_err() {
                return false;
            }
            let magic = match self.read_u16() {
                Some(m) => m,
                None => return false,
            };
            if magic != RECORD_MAGIC {
                pos += 1;
                continue;
            }
            let size = match self.read_u32() {
                Some(s) => s,
                None => return false,
            };
            if size > MAX_RECORD_SIZE || self.len < 2 || size as u64 >= self.len - 2 {
                pos += 1;
                continue;
            }
            return self.file.seek(SeekFrom::Start(pos)).is_ok();
        }
    }

    fn read_u16(&mut self) -> Option<u16> {
        let mut buf = [0u8; 2];
        self.file.read_exact(&mut buf).ok()?;
        Some(u16::from_le_bytes(buf))
    }

    fn read_u32(&mut self) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.file.read_exact(&mut buf).ok()?;
        Some(u32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Value, ValueStream};
    use crate::variable::Variable;

    fn stream(name: &str, n: u64) -> ValueStream {
        let mut s = ValueStream::new(Variable::new(name));
        for i in 0..n {
            s.values.push(Value::double(1_000 * (i + 1), i as f64));
        }
        s
    }

    #[test]
    fn write_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        let mut writer = RecordWriter::append(&path).unwrap();
        for i in 0..5 {
            writer.write(&stream(&format!("/v/{i}"), 3)).unwrap();
        }
        writer.sync().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(s) = reader.next::<ValueStream>() {
            seen.push(s);
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], stream("/v/0", 3));
        assert_eq!(seen[4], stream("/v/4", 3));
    }

    #[test]
    fn corrupt_payload_skips_one_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        let mut writer = RecordWriter::append(&path).unwrap();
        let mut offsets = Vec::new();
        for i in 0..3 {
            offsets.push(writer.position().unwrap());
            writer.write(&stream(&format!("/v/{i}"), 4)).unwrap();
        }
        writer.sync().unwrap();

        // Flip a byte inside the middle record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = offsets[1] as usize + 16;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(s) = reader.next::<ValueStream>() {
            seen.push(s);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].variable.name(), "/v/0");
        assert_eq!(seen[1].variable.name(), "/v/2");
    }

    #[test]
    fn truncated_tail_stops_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        let mut writer = RecordWriter::append(&path).unwrap();
        writer.write(&stream("/v/full", 4)).unwrap();
        writer.write(&stream("/v/cut", 4)).unwrap();
        writer.sync().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let first: Option<ValueStream> = reader.next();
        assert_eq!(first.unwrap().variable.name(), "/v/full");
        assert!(reader.next::<ValueStream>().is_none());
    }

    #[test]
    fn leading_garbage_resyncs_to_first_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log");
        std::fs::write(&path, b"garbage prefix bytes").unwrap();
        let mut writer = RecordWriter::append(&path).unwrap();
        writer.write(&stream("/v/real", 2)).unwrap();
        writer.sync().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let got: ValueStream = reader.next().unwrap();
        assert_eq!(got.variable.name(), "/v/real");
    }
}
