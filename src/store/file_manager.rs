//!
//! Store file manager and retention engine
//! ---------------------------------------
//! Owns the open set of indexed store files in the data directory. A 1 s
//! background tick rescans the directory (newly written `datastore.*.bin`
//! files are opened, vanished ones closed) and every N-th tick runs a
//! retention pass: for each file and variable, the first matching policy
//! rule decides KEEP (optionally rewriting the stream through mutations) or
//! DROP; the surviving streams are written to a `.new` sibling that is
//! renamed over the original, and a file whose every variable dropped is
//! unlinked. Retention failures are logged and leave the original in place.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigManager;
use crate::error::Result;
use crate::mutate::apply_mutations;
use crate::protocol::{now_ms, RetentionAction, RetentionPolicy, RetentionPolicyItem, ValueStream};
use crate::store::indexed_file::{self, IndexedStoreFile};
use crate::variable::Variable;

const TICK: Duration = Duration::from_secs(1);

/// First policy item matching `variable` whose `[min_age, max_age)` window
/// contains `age`; `None` means the default applies (DROP).
pub fn policy_for<'a>(
    policy: &'a RetentionPolicy,
    variable: &Variable,
    age: u64,
) -> Option<&'a RetentionPolicyItem> {
    for item in &policy.policies {
        for pattern in &item.variables {
            let pattern = match Variable::parse(pattern) {
                Ok(p) => p,
                Err(e) => {
                    warn!(target: "tidemark::retention", "bad policy pattern \"{pattern}\": {e}");
                    continue;
                }
            };
            if !variable.matches(&pattern) {
                continue;
            }
            if age < item.min_age {
                continue;
            }
            if item.max_age > 0 && age >= item.max_age {
                continue;
            }
            return Some(item);
        }
    }
    None
}

pub struct StoreFileManager {
    datadir: PathBuf,
    files: Mutex<HashMap<String, IndexedStoreFile>>,
}

impl StoreFileManager {
    /// Open every indexed store file already present in `datadir`.
    pub fn new<P: AsRef<Path>>(datadir: P) -> Self {
        let manager = StoreFileManager {
            datadir: datadir.as_ref().to_path_buf(),
            files: Mutex::new(HashMap::new()),
        };
        manager.rescan();
        manager
    }

    pub fn available_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn num_open_files(&self) -> usize {
        self.files.lock().len()
    }

    /// Reconcile the open-file table with the directory: open store files
    /// that appeared, drop handles whose file vanished.
    pub fn rescan(&self) {
        let mut present = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.datadir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if indexed_file::is_store_file_name(&name) {
                    present.push(name);
                }
            }
        }
        let mut files = self.files.lock();
        files.retain(|name, _| present.iter().any(|p| p == name));
        for name in present {
            if files.contains_key(&name) {
                continue;
            }
            match IndexedStoreFile::open(self.datadir.join(&name)) {
                Ok(file) => {
                    debug!(target: "tidemark::filemanager", "opened store file {name}");
                    files.insert(name, file);
                }
                Err(e) => {
                    error!(target: "tidemark::filemanager", "can't open store file {name}: {e}");
                }
            }
        }
    }

    /// Matching streams gathered across every open store file. No
    /// cross-file merging is attempted.
    pub fn get_variable(&self, search: &Variable) -> Vec<ValueStream> {
        let mut results = Vec::new();
        let mut files = self.files.lock();
        for (name, file) in files.iter_mut() {
            match file.get_variable(search) {
                Ok(streams) => results.extend(streams),
                Err(e) => {
                    warn!(target: "tidemark::filemanager", "read of {name} failed: {e}");
                }
            }
        }
        results
    }

    /// Apply the retention policy to every open file. Errors are logged
    /// per file; the original file stays until its replacement is renamed
    /// into place.
    pub fn run_retention(&self, policy: &RetentionPolicy) {
        let now = now_ms();
        info!(target: "tidemark::retention", "running retention policy over {} files", self.num_open_files());
        for name in self.available_files() {
            if let Err(e) = self.apply_retention_to_file(&name, policy, now) {
                error!(target: "tidemark::retention", "retention pass on {name} failed: {e}");
            }
        }
    }

    fn apply_retention_to_file(
        &self,
        name: &str,
        policy: &RetentionPolicy,
        now: u64,
    ) -> Result<()> {
        let mut kept: BTreeMap<String, ValueStream> = BTreeMap::new();
        let mut changed = false;
        {
            let mut files = self.files.lock();
            let file = match files.get_mut(name) {
                Some(f) => f,
                None => return Ok(()),
            };
            let variables = file.header().variables.clone();
            for variable in variables {
                // A labelless search can also surface label-superset
                // streams; decisions key off each stream's own variable, so
                // revisiting one is harmless.
                for stream in file.get_variable(&variable)? {
                    let stream_var = stream.variable.clone();
                    let age = now.saturating_sub(stream.last_timestamp().unwrap_or(now));
                    match policy_for(policy, &stream_var, age) {
                        Some(item) if item.action == RetentionAction::Keep => {
                            if item.mutations.is_empty() {
                                kept.insert(stream_var.to_string(), stream);
                            } else {
                                let rewritten = apply_mutations(&item.mutations, &stream)?;
                                changed = true;
                                if !rewritten.values.is_empty() {
                                    kept.insert(stream_var.to_string(), rewritten);
                                }
                            }
                        }
                        _ => {
                            debug!(
                                target: "tidemark::retention",
                                "dropping {stream_var} (age {age} ms) from {name}"
                            );
                            changed = true;
                        }
                    }
                }
            }
        }
        if !changed {
            return Ok(());
        }
        let path = self.datadir.join(name);
        if kept.is_empty() {
            info!(target: "tidemark::retention", "every variable in {name} dropped, unlinking");
            self.files.lock().remove(name);
            std::fs::remove_file(&path)?;
            return Ok(());
        }
        indexed_file::write_replacement(&kept, &path)?;
        info!(
            target: "tidemark::retention",
            "rewrote {name} with {} surviving streams",
            kept.len()
        );
        let mut files = self.files.lock();
        files.remove(name);
        match IndexedStoreFile::open(&path) {
            Ok(file) => {
                files.insert(name.to_string(), file);
            }
            Err(e) => {
                error!(target: "tidemark::retention", "can't reopen rewritten {name}: {e}");
            }
        }
        Ok(())
    }

    /// Spawn the rescan/retention loop: rescan every second, retention on
    /// every `retention_policy.interval`-th tick.
    pub fn start_background_task(
        self: &Arc<Self>,
        config: Arc<ConfigManager>,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let tick_manager = Arc::clone(&manager);
                let policy = config.current().retention_policy;
                let interval = policy.interval.max(1);
                let run_retention = ticks % interval == 0;
                let joined = tokio::task::spawn_blocking(move || {
                    tick_manager.rescan();
                    if run_retention {
                        tick_manager.run_retention(&policy);
                    }
                })
                .await;
                if joined.is_err() {
                    error!(target: "tidemark::filemanager", "background tick panicked");
                }
                ticks += 1;
            }
            info!(target: "tidemark::filemanager", "file manager background task exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Mutation, MutationKind, Value};

    const DAY_MS: u64 = 24 * 3600 * 1_000;

    fn write_file(dir: &Path, streams: &[ValueStream]) -> PathBuf {
        let mut map = BTreeMap::new();
        for stream in streams {
            map.insert(stream.variable.to_string(), stream.clone());
        }
        indexed_file::write_indexed_file(&map, &dir.join("seed.new")).unwrap()
    }

    fn stream_with_points(var: &str, timestamps: &[u64]) -> ValueStream {
        let variable = Variable::parse(var).unwrap();
        let mut stream = ValueStream::new(variable);
        for (i, &ts) in timestamps.iter().enumerate() {
            stream.values.push(Value::double(ts, i as f64));
        }
        stream
    }

    #[test]
    fn rescan_tracks_appearing_and_vanishing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = StoreFileManager::new(tmp.path());
        assert_eq!(manager.num_open_files(), 0);

        let path = write_file(tmp.path(), &[stream_with_points("/v", &[1_000, 2_000])]);
        manager.rescan();
        assert_eq!(manager.num_open_files(), 1);

        std::fs::remove_file(&path).unwrap();
        manager.rescan();
        assert_eq!(manager.num_open_files(), 0);
    }

    #[test]
    fn default_policy_drops_ancient_data_but_honors_keep_rules() {
        let tmp = tempfile::tempdir().unwrap();
        // One ancient variable and one with the keep label.
        let old_ts = 1_000u64; // ~epoch, i.e. decades old
        write_file(
            tmp.path(),
            &[
                stream_with_points("/junk/var", &[old_ts]),
                stream_with_points("/junk/var{retain=forever}", &[old_ts]),
            ],
        );
        let manager = StoreFileManager::new(tmp.path());
        assert_eq!(manager.num_open_files(), 1);

        let policy = RetentionPolicy {
            interval: 1,
            policies: vec![RetentionPolicyItem {
                variables: vec!["*{retain=forever}".into()],
                action: RetentionAction::Keep,
                min_age: 0,
                max_age: 0,
                mutations: vec![],
            }],
        };
        manager.run_retention(&policy);

        let kept = manager.get_variable(&Variable::parse("/junk/*").unwrap());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].variable.get_label("retain"), Some("forever"));
    }

    #[test]
    fn file_with_everything_dropped_is_unlinked() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), &[stream_with_points("/gone", &[1_000])]);
        let manager = StoreFileManager::new(tmp.path());

        manager.run_retention(&RetentionPolicy {
            interval: 1,
            policies: vec![],
        });
        assert_eq!(manager.num_open_files(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn keep_with_mutations_rewrites_old_region_only() {
        let tmp = tempfile::tempdir().unwrap();
        let now = now_ms();
        // 12 hours of minutely samples, 40 days old.
        let base = now - 40 * DAY_MS;
        let old_points: Vec<u64> = (0..(12 * 60)).map(|i| base + i * 60_000).collect();
        // Recent samples, one day old.
        let fresh_base = now - DAY_MS;
        let fresh_points: Vec<u64> = (0..30).map(|i| fresh_base + i * 60_000).collect();
        let path = write_file(
            tmp.path(),
            &[
                stream_with_points("/m{age=old}", &old_points),
                stream_with_points("/m{age=new}", &fresh_points),
            ],
        );
        let manager = StoreFileManager::new(tmp.path());

        let policy = RetentionPolicy {
            interval: 1,
            policies: vec![
                RetentionPolicyItem {
                    variables: vec!["/m*".into()],
                    action: RetentionAction::Keep,
                    min_age: 30 * DAY_MS,
                    max_age: 0,
                    mutations: vec![Mutation::resample(MutationKind::Average, 3_600_000, DAY_MS)],
                },
                RetentionPolicyItem {
                    variables: vec!["/m*".into()],
                    action: RetentionAction::Keep,
                    min_age: 0,
                    max_age: 30 * DAY_MS,
                    mutations: vec![],
                },
            ],
        };
        manager.run_retention(&policy);

        // The replacement kept the original filename.
        assert!(path.exists());
        let old = manager.get_variable(&Variable::parse("/m{age=old}").unwrap());
        assert_eq!(old.len(), 1);
        assert!(
            old[0].values.len() <= 12,
            "hourly resample left {} samples",
            old[0].values.len()
        );
        let fresh = manager.get_variable(&Variable::parse("/m{age=new}").unwrap());
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].values.len(), fresh_points.len());
    }

    #[test]
    fn first_matching_policy_item_wins() {
        let policy = RetentionPolicy {
            interval: 1,
            policies: vec![
                RetentionPolicyItem {
                    variables: vec!["/a/*".into()],
                    action: RetentionAction::Drop,
                    min_age: 0,
                    max_age: 0,
                    mutations: vec![],
                },
                RetentionPolicyItem {
                    variables: vec!["/a/b".into()],
                    action: RetentionAction::Keep,
                    min_age: 0,
                    max_age: 0,
                    mutations: vec![],
                },
            ],
        };
        let variable = Variable::parse("/a/b").unwrap();
        let item = policy_for(&policy, &variable, 1_000).unwrap();
        assert_eq!(item.action, RetentionAction::Drop);

        // Outside the age window, no rule matches.
        let windowed = RetentionPolicy {
            interval: 1,
            policies: vec![RetentionPolicyItem {
                variables: vec!["/a/b".into()],
                action: RetentionAction::Keep,
                min_age: 1_000,
                max_age: 2_000,
                mutations: vec![],
            }],
        };
        assert!(policy_for(&windowed, &variable, 500).is_none());
        assert!(policy_for(&windowed, &variable, 2_000).is_none());
        assert!(policy_for(&windowed, &variable, 1_500).is_some());
    }
}
