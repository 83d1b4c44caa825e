//!
//! Cluster configuration
//! ---------------------
//! The `StoreConfig` document (peer servers, retention policy, pass
//! interval) lives in a JSON file. A manager object owns the active copy
//! behind a read-write lock, rebuilds the hash ring on every successful
//! load, and notifies registered reload callbacks. A 1 s poll task watches
//! the file's mtime and size and reloads on change; a document that fails
//! to decode is logged and the old config stays active. Configuration is an
//! explicit object threaded into the subsystems that need it, not a
//! process-wide singleton.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::protocol::{now_ms, ServerState, StoreConfig};
use crate::ring::{HashRing, DEFAULT_RING_REPLICAS};

const POLL_TICK: Duration = Duration::from_secs(1);

type ReloadCallback = Box<dyn Fn(&StoreConfig) + Send + Sync>;

pub struct ConfigManager {
    path: Option<PathBuf>,
    state: RwLock<StoreConfig>,
    ring: RwLock<HashRing>,
    callbacks: Mutex<Vec<ReloadCallback>>,
    last_stat: Mutex<Option<(SystemTime, u64)>>,
}

impl ConfigManager {
    /// Manager with no backing file; starts from the default (empty)
    /// config and never reloads.
    pub fn unconfigured() -> Self {
        ConfigManager {
            path: None,
            state: RwLock::new(StoreConfig::default()),
            ring: RwLock::new(HashRing::new(DEFAULT_RING_REPLICAS)),
            callbacks: Mutex::new(Vec::new()),
            last_stat: Mutex::new(None),
        }
    }

    /// Manager backed by a config file. A missing or undecodable file is
    /// logged and leaves the defaults active; it is not fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let mut manager = Self::unconfigured();
        manager.path = Some(path.as_ref().to_path_buf());
        if let Err(e) = manager.reload() {
            warn!(target: "tidemark::config", "initial config load failed: {e}");
        }
        manager
    }

    /// Snapshot of the active config.
    pub fn current(&self) -> StoreConfig {
        self.state.read().clone()
    }

    /// Snapshot of the hash ring built from the configured servers.
    pub fn ring(&self) -> HashRing {
        self.ring.read().clone()
    }

    pub fn add_reload_callback(&self, callback: ReloadCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Re-read the backing file and, if it decodes, swap it in, rebuild
    /// the ring and notify callbacks.
    pub fn reload(&self) -> Result<()> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(()),
        };
        let text = std::fs::read_to_string(path)?;
        if text.len() < 5 {
            warn!(target: "tidemark::config", "empty configuration file, not reading");
            return Ok(());
        }
        let config: StoreConfig = serde_json::from_str(&text)
            .map_err(|e| StoreError::ConfigInvalid(e.to_string()))?;
        self.install(config);
        info!(target: "tidemark::config", "loaded configuration from {}", path.display());
        Ok(())
    }

    /// Swap in a new config (also used when one arrives over the wire).
    pub fn install(&self, config: StoreConfig) {
        {
            let mut ring = self.ring.write();
            ring.clear();
            for server in &config.servers {
                ring.add_node(&server.address);
            }
        }
        *self.state.write() = config;
        let state = self.state.read().clone();
        for callback in self.callbacks.lock().iter() {
            callback(&state);
        }
    }

    pub fn server_state(&self, address: &str) -> ServerState {
        self.state
            .read()
            .server(address)
            .map(|s| s.state)
            .unwrap_or(ServerState::Unknown)
    }

    pub fn set_server_state(&self, address: &str, state: ServerState) {
        let mut config = self.state.write();
        let now = now_ms();
        for server in config.servers.iter_mut() {
            if server.address == address {
                server.state = state;
                server.last_updated = now;
                config.last_update = now;
                return;
            }
        }
    }

    /// Serialize the active config the way the config file stores it.
    pub fn dump(&self) -> Result<String> {
        serde_json::to_string_pretty(&*self.state.read())
            .map_err(|e| StoreError::ConfigInvalid(e.to_string()))
    }

    pub fn write_config_file(&self) -> Result<()> {
        if let Some(path) = &self.path {
            std::fs::write(path, self.dump()?)?;
        }
        Ok(())
    }

    fn stat_changed(&self) -> bool {
        let path = match &self.path {
            Some(p) => p,
            None => return false,
        };
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(_) => return false,
        };
        let stat = (
            meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            meta.len(),
        );
        let mut last = self.last_stat.lock();
        if last.map_or(true, |l| l != stat) {
            *last = Some(stat);
            return true;
        }
        false
    }

    /// Spawn the 1 s file-watch loop. The first tick observes the current
    /// stat without necessarily reloading an unchanged file.
    pub fn start_reload_task(
        self: &Arc<Self>,
        shutdown: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        // Seed the stat cache so an untouched file doesn't trigger a reload.
        let _ = self.stat_changed();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if manager.stat_changed() {
                    debug!(target: "tidemark::config", "config file modified, reloading");
                    if let Err(e) = manager.reload() {
                        warn!(target: "tidemark::config", "config reload failed, keeping previous: {e}");
                    }
                }
            }
            info!(target: "tidemark::config", "configuration reload task exiting");
        })
    }
}
