//!
//! Storage engine
//! --------------
//! The per-server storage engine: a live in-memory map of variable to
//! stream servicing all queries, backed by the append-only record log for
//! durability and by immutable indexed store files produced when rotated
//! logs are reindexed. On startup the record log is replayed so the live
//! map again covers everything acknowledged but not yet indexed.
//!
//! Submodules:
//! - `framing`: the `magic|size|payload|crc` record frame shared by every
//!   on-disk file.
//! - `record_log`: write-ahead log with rotation and reindexing.
//! - `indexed_file`: immutable indexed store files.
//! - `file_manager`: open-file table and the retention engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::protocol::{now_ms, Value, ValueStream};
use crate::variable::Variable;

pub mod file_manager;
pub mod framing;
pub mod indexed_file;
pub mod record_log;

#[cfg(test)]
mod store_tests;

use record_log::{RecordLog, RecordLogOptions};

/// Tolerated clock drift for incoming timestamps.
const MAX_FUTURE_DRIFT_MS: u64 = 1_000;
/// Data older than this draws a warning but is accepted.
const OLD_DATA_WARN_MS: u64 = 365 * 24 * 3600 * 1_000;

/// Live datastore: the in-memory variable map plus its record log.
pub struct DiskDatastore {
    basedir: PathBuf,
    live: Mutex<HashMap<String, ValueStream>>,
    record_log: Arc<RecordLog>,
}

impl DiskDatastore {
    /// Open the datastore rooted at `basedir`, replaying the record log so
    /// the live map covers every durable-but-unindexed sample.
    pub fn open<P: AsRef<Path>>(basedir: P, options: RecordLogOptions) -> Result<Self> {
        let basedir = basedir.as_ref().to_path_buf();
        std::fs::create_dir_all(&basedir)?;
        let store = DiskDatastore {
            record_log: Arc::new(RecordLog::new(&basedir, options)),
            live: Mutex::new(HashMap::new()),
            basedir,
        };
        store.replay_record_log();
        Ok(store)
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn record_log(&self) -> &Arc<RecordLog> {
        &self.record_log
    }

    fn replay_record_log(&self) {
        let mut points = 0u64;
        let mut streams = 0u64;
        for stream in self.record_log.replay() {
            for value in stream.values {
                self.record_no_log(&stream.variable, value);
                points += 1;
            }
            streams += 1;
        }
        info!(
            target: "tidemark::store",
            "replayed record log: {points} points in {streams} streams"
        );
    }

    fn validate(&self, variable: &Variable, value: &Value, now: u64) -> Result<()> {
        let name = variable.name();
        if !name.starts_with('/') || name.len() < 2 {
            return Err(StoreError::invalid_variable(format!(
                "variable name \"{name}\" must be a /-rooted path"
            )));
        }
        if name.chars().any(|c| c.is_whitespace()) {
            return Err(StoreError::invalid_variable(format!(
                "variable name \"{name}\" contains whitespace"
            )));
        }
        if value.timestamp > now + MAX_FUTURE_DRIFT_MS {
            return Err(StoreError::InvalidArgument(format!(
                "attempt to set a value in the future (t={}, now={now})",
                value.timestamp
            )));
        }
        if now >= OLD_DATA_WARN_MS && value.timestamp < now - OLD_DATA_WARN_MS {
            warn!(target: "tidemark::store", "adding very old data point for {variable}");
        }
        Ok(())
    }

    /// Record one sample: validate, append to the live stream, then hand
    /// the same value to the record log. The sample is visible to reads as
    /// soon as this returns, and durable after the next successful flush.
    pub fn record(&self, variable: &Variable, value: Value) -> Result<()> {
        self.validate(variable, &value, now_ms())?;
        self.record_no_log(variable, value.clone());
        self.record_log.add_value(variable, value)
    }

    /// Append without logging; used by `record` and by replay.
    fn record_no_log(&self, variable: &Variable, value: Value) {
        let mut live = self.live.lock();
        let stream = live
            .entry(variable.to_string())
            .or_insert_with(|| ValueStream::new(variable.clone()));
        // Values are kept sorted by timestamp even if a writer misbehaves.
        match stream.values.last() {
            Some(last) if last.timestamp > value.timestamp => {
                let at = stream
                    .values
                    .partition_point(|v| v.timestamp <= value.timestamp);
                stream.values.insert(at, value);
            }
            _ => stream.values.push(value),
        }
    }

    /// Every stored variable matching `search` (§3 match rules).
    pub fn find_variables(&self, search: &Variable) -> Vec<Variable> {
        let live = self.live.lock();
        let mut out: Vec<Variable> = live
            .values()
            .filter(|s| s.variable.matches(search))
            .map(|s| s.variable.clone())
            .collect();
        out.sort_by_key(|v| v.to_string());
        out
    }

    /// Variables whose formatted form starts with `prefix`.
    pub fn list_variables(&self, prefix: &str) -> Vec<Variable> {
        let live = self.live.lock();
        let mut out: Vec<Variable> = live
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, s)| s.variable.clone())
            .collect();
        out.sort_by_key(|v| v.to_string());
        out
    }

    /// Values of one variable with `start <= ts < end`; `end = 0` means
    /// "now". Returns an empty stream when the variable is absent.
    pub fn get_range(&self, variable: &Variable, start: u64, end: u64) -> ValueStream {
        let end = if end == 0 { now_ms() } else { end };
        let mut out = ValueStream::new(variable.clone());
        let live = self.live.lock();
        if let Some(stream) = live.get(&variable.to_string()) {
            out.values = stream
                .values
                .iter()
                .filter(|v| v.timestamp >= start && v.timestamp < end)
                .cloned()
                .collect();
        }
        out
    }

    /// Merge iterator over every stream matching `search`, yielding values
    /// in non-decreasing timestamp order across streams; ties go to the
    /// earlier stream in the internal list. A finite, one-shot sequence.
    pub fn find(&self, search: &Variable, start: u64, end: u64) -> MergeIterator {
        let mut streams = Vec::new();
        for variable in self.find_variables(search) {
            let stream = self.get_range(&variable, start, end);
            streams.push((Arc::new(variable), stream.values));
        }
        MergeIterator {
            positions: vec![0; streams.len()],
            streams,
        }
    }
}

/// Iterator over multiple streams' values in global timestamp order.
pub struct MergeIterator {
    streams: Vec<(Arc<Variable>, Vec<Value>)>,
    positions: Vec<usize>,
}

impl Iterator for MergeIterator {
    type Item = (Arc<Variable>, Value);

    fn next(&mut self) -> Option<(Arc<Variable>, Value)> {
        let mut best: Option<(usize, u64)> = None;
        for (i, (_, values)) in self.streams.iter().enumerate() {
            if let Some(value) = values.get(self.positions[i]) {
                // Strict less-than keeps ties on the earliest stream.
                if best.map_or(true, |(_, ts)| value.timestamp < ts) {
                    best = Some((i, value.timestamp));
                }
            }
        }
        let (index, _) = best?;
        let value = self.streams[index].1[self.positions[index]].clone();
        self.positions[index] += 1;
        Some((Arc::clone(&self.streams[index].0), value))
    }
}
