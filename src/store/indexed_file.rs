//!
//! Indexed store files
//! -------------------
//! Immutable files holding many variables' streams behind a header index.
//! The producer writes a placeholder header first, appends each stream while
//! recording its byte offset, then seeks back and rewrites the finalized
//! header at offset 0 — possible because bincode's fixed-width integers make
//! both header encodings the same length. The finished `.new` file is
//! renamed to `datastore.<max_end_ts>.bin`; nothing ever modifies an
//! existing store file in place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::protocol::{StoreFileHeader, StoreFileHeaderIndex, ValueStream};
use crate::store::framing::{RecordReader, RecordWriter};
use crate::variable::Variable;

pub const STORE_FILE_PREFIX: &str = "datastore.";
pub const STORE_FILE_SUFFIX: &str = ".bin";

/// Whether a directory entry name is an indexed store file.
pub fn is_store_file_name(name: &str) -> bool {
    name.starts_with(STORE_FILE_PREFIX) && name.ends_with(STORE_FILE_SUFFIX)
}

/// Write `streams` as an indexed store file, using `tmp_path` as the
/// transient output, and rename it into place as
/// `datastore.<max_end_ts>.bin` next to it. Fails if `tmp_path` exists.
pub fn write_indexed_file(
    streams: &BTreeMap<String, ValueStream>,
    tmp_path: &Path,
) -> Result<PathBuf> {
    let header = write_streams(streams, tmp_path)?;
    let dir = tmp_path.parent().unwrap_or_else(|| Path::new("."));
    let final_path = dir.join(format!(
        "{STORE_FILE_PREFIX}{}{STORE_FILE_SUFFIX}",
        header.end_timestamp
    ));
    std::fs::rename(tmp_path, &final_path)?;
    Ok(final_path)
}

/// Write `streams` to a sibling `.new` file and atomically rename it over
/// `final_path`. Used by retention, which replaces a store file in place.
pub fn write_replacement(streams: &BTreeMap<String, ValueStream>, final_path: &Path) -> Result<()> {
    let tmp_path = PathBuf::from(format!("{}.new", final_path.display()));
    write_streams(streams, &tmp_path)?;
    std::fs::rename(&tmp_path, final_path)?;
    Ok(())
}

/// Core producer: placeholder header, streams with recorded offsets, then
/// the finalized header rewritten at offset 0.
fn write_streams(
    streams: &BTreeMap<String, ValueStream>,
    tmp_path: &Path,
) -> Result<StoreFileHeader> {
    if streams.is_empty() {
        return Err(StoreError::InvalidArgument(
            "refusing to write an empty store file".into(),
        ));
    }
    let mut header = StoreFileHeader::default();
    for stream in streams.values() {
        header.variables.push(stream.variable.clone());
        header.index.push(StoreFileHeaderIndex {
            variable: stream.variable.clone(),
            offset: 0,
        });
        if let Some(first) = stream.first_timestamp() {
            if header.start_timestamp == 0 || first < header.start_timestamp {
                header.start_timestamp = first;
            }
        }
        if let Some(last) = stream.last_timestamp() {
            header.end_timestamp = header.end_timestamp.max(last);
        }
    }

    let mut writer = RecordWriter::create_new(tmp_path)?;
    writer.write(&header)?;
    for (slot, stream) in streams.values().enumerate() {
        header.index[slot].offset = writer.position()?;
        writer.write(stream)?;
    }
    writer.seek_to(0)?;
    writer.write(&header)?;
    writer.sync()?;
    Ok(header)
}

/// Read handle over one immutable store file.
pub struct IndexedStoreFile {
    path: PathBuf,
    header: StoreFileHeader,
    reader: RecordReader,
}

impl IndexedStoreFile {
    /// Open and validate. A header that cannot be decoded, carries missing
    /// or inverted timestamps, or has an empty index is a fatal open error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = RecordReader::open(&path)?;
        let header: StoreFileHeader = reader.next().ok_or_else(|| {
            StoreError::not_found(format!("unreadable header in {}", path.display()))
        })?;
        if header.start_timestamp == 0
            || header.end_timestamp == 0
            || header.end_timestamp < header.start_timestamp
            || header.index.is_empty()
        {
            return Err(StoreError::not_found(format!(
                "invalid header in {}",
                path.display()
            )));
        }
        debug!(
            target: "tidemark::storefile",
            "opened {} with {} indexed streams",
            path.display(),
            header.index.len()
        );
        Ok(IndexedStoreFile {
            path,
            header,
            reader,
        })
    }

    pub fn header(&self) -> &StoreFileHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every stream whose variable matches `search`: scan the index, seek
    /// to each hit and decode one record, re-verifying the variable before
    /// returning it.
    pub fn get_variable(&mut self, search: &Variable) -> Result<Vec<ValueStream>> {
        let hits: Vec<(Variable, u64)> = self
            .header
            .index
            .iter()
            .filter(|entry| entry.variable.matches(search))
            .map(|entry| (entry.variable.clone(), entry.offset))
            .collect();
        let mut results = Vec::new();
        for (index_var, offset) in hits {
            self.reader.seek_to(offset)?;
            let stream: ValueStream = match self.reader.next() {
                Some(s) => s,
                None => {
                    warn!(
                        target: "tidemark::storefile",
                        "eof reading {} at offset {offset}",
                        self.path.display()
                    );
                    break;
                }
            };
            if stream.variable != index_var {
                warn!(
                    target: "tidemark::storefile",
                    "stream at offset {offset} in {} does not match its index entry",
                    self.path.display()
                );
                continue;
            }
            results.push(stream);
        }
        Ok(results)
    }
}
