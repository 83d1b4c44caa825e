//!
//! Record log
//! ----------
//! Durable append-only log of value streams. Writes are queued in memory
//! and flushed to `<dir>/recordlog` by a 2 s admin task, which also rotates
//! the log once it passes the size threshold (rename to a UTC-stamped
//! sibling) and reindexes rotated logs into immutable store files. The log
//! can be replayed at startup to recover everything recorded but not yet
//! indexed. A crash loses only samples queued after the last flush.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::protocol::{Value, ValueStream};
use crate::store::framing::{RecordReader, RecordWriter};
use crate::store::indexed_file;
use crate::variable::Variable;

pub const DEFAULT_MAX_LOG_SIZE_MB: u64 = 100;
pub const DEFAULT_QUEUE_CAPACITY: usize = 262_144;
const ADMIN_TICK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct RecordLogOptions {
    /// Rotation threshold for the current log file, in bytes.
    pub max_log_size_bytes: u64,
    /// Queued-stream bound; `add` past this fails with `Backpressure`.
    pub queue_capacity: usize,
}

impl Default for RecordLogOptions {
    fn default() -> Self {
        RecordLogOptions {
            max_log_size_bytes: DEFAULT_MAX_LOG_SIZE_MB * 1024 * 1024,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

pub struct RecordLog {
    basedir: PathBuf,
    options: RecordLogOptions,
    queue: Mutex<VecDeque<ValueStream>>,
    /// Serializes file-level operations (flush writes, rotation renames) so
    /// a rotation never slides the file out from under a flush.
    io_lock: Mutex<()>,
    /// Extra files registered for replay only.
    replay_extra: Mutex<Vec<PathBuf>>,
}

impl RecordLog {
    pub fn new<P: AsRef<Path>>(basedir: P, options: RecordLogOptions) -> Self {
        RecordLog {
            basedir: basedir.as_ref().to_path_buf(),
            options,
            queue: Mutex::new(VecDeque::new()),
            io_lock: Mutex::new(()),
            replay_extra: Mutex::new(Vec::new()),
        }
    }

    /// Path of the current write-ahead log.
    pub fn filename(&self) -> PathBuf {
        self.basedir.join("recordlog")
    }

    /// Queued streams not yet flushed to disk.
    pub fn queued_streams(&self) -> usize {
        self.queue.lock().len()
    }

    /// Enqueue a stream for the next flush. A successful return does not
    /// mean the stream is on disk yet.
    pub fn add(&self, stream: ValueStream) -> Result<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.options.queue_capacity {
            return Err(StoreError::Backpressure);
        }
        queue.push_back(stream);
        Ok(())
    }

    /// Enqueue a single value wrapped in a one-point stream.
    pub fn add_value(&self, variable: &Variable, value: Value) -> Result<()> {
        self.add(ValueStream::single(variable.clone(), value))
    }

    /// Register a log file for replay only; it never affects recording.
    pub fn add_log_file<P: AsRef<Path>>(&self, path: P) {
        self.replay_extra.lock().push(path.as_ref().to_path_buf());
    }

    /// Write as many queued streams as possible to the current log file.
    /// Returns whether the queue was emptied; unwritten streams stay queued
    /// for the next tick.
    pub fn flush(&self) -> Result<bool> {
        let pending: Vec<ValueStream> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if pending.is_empty() {
            return Ok(true);
        }
        let _io = self.io_lock.lock();
        let mut writer = match RecordWriter::append(self.filename()) {
            Ok(w) => w,
            Err(e) => {
                error!(target: "tidemark::recordlog", "can't open {}: {e}", self.filename().display());
                self.requeue_front(pending);
                return Ok(false);
            }
        };
        let mut done = 0usize;
        for stream in &pending {
            if let Err(e) = writer.write(stream) {
                error!(target: "tidemark::recordlog", "couldn't write stream to recordlog: {e}");
                break;
            }
            done += 1;
        }
        if let Err(e) = writer.sync() {
            warn!(target: "tidemark::recordlog", "recordlog sync failed: {e}");
        }
        let complete = done == pending.len();
        if !complete {
            self.requeue_front(pending.into_iter().skip(done).collect());
        }
        debug!(
            target: "tidemark::recordlog",
            "flushed {done} streams, {} left queued",
            self.queued_streams()
        );
        Ok(complete)
    }

    fn requeue_front(&self, streams: Vec<ValueStream>) {
        let mut queue = self.queue.lock();
        for stream in streams.into_iter().rev() {
            queue.push_front(stream);
        }
    }

    /// Rename the current log once it exceeds the size threshold and start
    /// a fresh empty one.
    pub fn rotate(&self) -> Result<()> {
        let path = self.filename();
        let size = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.options.max_log_size_bytes {
            return Ok(());
        }
        let _io = self.io_lock.lock();
        let stamp = chrono::Utc::now().format("%Y-%m-%d-%H-%M-%S%.3f");
        let rotated = self.basedir.join(format!("recordlog.{stamp}"));
        if let Err(e) = std::fs::rename(&path, &rotated) {
            warn!(
                target: "tidemark::recordlog",
                "error renaming {} to {}: {e}",
                path.display(),
                rotated.display()
            );
            return Ok(());
        }
        std::fs::File::create(&path)?;
        info!(target: "tidemark::recordlog", "rotated record log to {}", rotated.display());
        Ok(())
    }

    /// Rotated log files awaiting indexing, in timestamp order.
    fn rotated_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.basedir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("recordlog.") && !name.ends_with(".new") {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        files
    }

    /// Reindex every rotated log into an immutable store file. A file that
    /// fails is renamed `failed-<name>` and the pass continues.
    pub fn reindex(&self) -> bool {
        let mut success = true;
        for path in self.rotated_files() {
            if let Err(e) = self.reindex_file(&path) {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let quarantine = self.basedir.join(format!("failed-{name}"));
                error!(
                    target: "tidemark::recordlog",
                    "failed to reindex {}: {e}; renaming to {}",
                    path.display(),
                    quarantine.display()
                );
                if let Err(e) = std::fs::rename(&path, &quarantine) {
                    error!(target: "tidemark::recordlog", "quarantine rename failed: {e}");
                }
                success = false;
            }
        }
        success
    }

    fn reindex_file(&self, path: &Path) -> Result<()> {
        info!(target: "tidemark::recordlog", "reindexing {}", path.display());
        let mut by_variable: BTreeMap<String, ValueStream> = BTreeMap::new();
        let mut reader = RecordReader::open(path)?;
        while let Some(stream) = reader.next::<ValueStream>() {
            let key = stream.variable.to_string();
            if key.is_empty() {
                continue;
            }
            let merged = by_variable
                .entry(key)
                .or_insert_with(|| ValueStream::new(stream.variable.clone()));
            for value in stream.values {
                merged.push_rle(value);
            }
        }
        by_variable.retain(|_, stream| !stream.values.is_empty());
        if by_variable.is_empty() {
            // Nothing decodable; an empty store file would be unreadable.
            std::fs::remove_file(path)?;
            return Ok(());
        }
        let tmp = PathBuf::from(format!("{}.new", path.display()));
        let final_path = indexed_file::write_indexed_file(&by_variable, &tmp)?;
        std::fs::remove_file(path)?;
        info!(
            target: "tidemark::recordlog",
            "created indexed file {} from {} streams",
            final_path.display(),
            by_variable.len()
        );
        Ok(())
    }

    /// One-shot, forward-only replay over rotated files then the current
    /// log. Corrupt regions are skipped by the framed reader.
    pub fn replay(&self) -> Replay {
        let mut files: VecDeque<PathBuf> = self.rotated_files().into();
        files.extend(self.replay_extra.lock().iter().cloned());
        let current = self.filename();
        if current.exists() {
            files.push_back(current);
        }
        Replay {
            files,
            reader: None,
        }
    }

    /// Spawn the flush/rotate/reindex loop. The task observes `shutdown`
    /// between ticks and performs one final flush on the way out.
    pub fn start_admin_task(
        self: &Arc<Self>,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ADMIN_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let tick_log = Arc::clone(&log);
                let done = tokio::task::spawn_blocking(move || {
                    if let Err(e) = tick_log.flush() {
                        error!(target: "tidemark::recordlog", "flush failed: {e}");
                    }
                    if let Err(e) = tick_log.rotate() {
                        error!(target: "tidemark::recordlog", "rotation failed: {e}");
                    }
                    tick_log.reindex();
                })
                .await;
                if done.is_err() {
                    error!(target: "tidemark::recordlog", "admin tick panicked");
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            let final_log = Arc::clone(&log);
            let _ = tokio::task::spawn_blocking(move || final_log.flush()).await;
            info!(target: "tidemark::recordlog", "record log admin task exiting");
        })
    }
}

/// Iterator state for `RecordLog::replay`.
pub struct Replay {
    files: VecDeque<PathBuf>,
    reader: Option<RecordReader>,
}

impl Iterator for Replay {
    type Item = ValueStream;

    fn next(&mut self) -> Option<ValueStream> {
        loop {
            if self.reader.is_none() {
                let path = self.files.pop_front()?;
                match RecordReader::open(&path) {
                    Ok(reader) => {
                        debug!(target: "tidemark::recordlog", "replaying {}", path.display());
                        self.reader = Some(reader);
                    }
                    Err(e) => {
                        warn!(target: "tidemark::recordlog", "can't replay {}: {e}", path.display());
                        continue;
                    }
                }
            }
            match self.reader.as_mut().and_then(|r| r.next::<ValueStream>()) {
                Some(stream) => return Some(stream),
                None => self.reader = None,
            }
        }
    }
}
