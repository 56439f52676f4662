//! Configuration holder with hot-reload support.
//!
//! Owns the current snapshot behind a read-write lock. Subscribers register
//! callbacks that are invoked once immediately and again on every change.
//! A polling watcher task reloads the file when its mtime moves. Subscribers
//! are expected to apply only hot-safe fields (heartbeat interval, log
//! level); everything else requires a restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::Config;
use crate::error::Result;

type Subscriber = Box<dyn Fn(&Config) + Send + Sync>;

pub struct ConfigManager {
    config: RwLock<Config>,
    config_path: PathBuf,
    subscribers: parking_lot::Mutex<Vec<Subscriber>>,
    last_modified: parking_lot::Mutex<Option<std::time::SystemTime>>,
}

impl ConfigManager {
    /// Load the file at `path` (or defaults when absent) and wrap it.
    pub fn new(path: PathBuf) -> Result<Arc<Self>> {
        let config = Config::load(&path)?;
        let last_modified = std::fs::metadata(&path)
            .ok()
            .and_then(|m| m.modified().ok());

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            config_path: path,
            subscribers: parking_lot::Mutex::new(Vec::new()),
            last_modified: parking_lot::Mutex::new(last_modified),
        }))
    }

    /// Current snapshot (cloned, callers cannot mutate shared state).
    pub async fn get(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Register a change callback. Invoked once immediately with the current
    /// snapshot, then on every successful reload.
    pub async fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Config) + Send + Sync + 'static,
    {
        let snapshot = self.config.read().await.clone();
        callback(&snapshot);
        self.subscribers.lock().push(Box::new(callback));
    }

    /// Reload configuration from disk, notify subscribers on success.
    pub async fn reload(&self) -> Result<()> {
        let new_config = Config::load(&self.config_path)?;

        {
            let mut config = self.config.write().await;
            *config = new_config.clone();
        }

        if let Ok(meta) = std::fs::metadata(&self.config_path) {
            *self.last_modified.lock() = meta.modified().ok();
        }

        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            sub(&new_config);
        }
        debug!(path = %self.config_path.display(), "config reloaded");
        Ok(())
    }

    /// Spawn the mtime-polling watcher. The handle lives as long as the
    /// owning process wants hot reload.
    pub fn start_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let poll_interval = Duration::from_secs(2);
            loop {
                sleep(poll_interval).await;

                let modified = match std::fs::metadata(&manager.config_path) {
                    Ok(meta) => meta.modified().ok(),
                    Err(_) => continue,
                };
                let Some(modified) = modified else { continue };

                let should_reload = {
                    let last = manager.last_modified.lock();
                    match *last {
                        Some(prev) => modified > prev,
                        None => true,
                    }
                };

                if should_reload {
                    if let Err(e) = manager.reload().await {
                        warn!(error = %e, "config reload failed, keeping previous snapshot");
                    }
                }
            }
        })
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_subscribe_fires_immediately_and_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"[task]\nheartbeat_interval_sec = 10\n")
            .unwrap();

        let manager = ConfigManager::new(path.clone()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen_interval = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            let seen = seen_interval.clone();
            manager
                .subscribe(move |cfg| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    seen.store(cfg.task.heartbeat_interval_sec as usize, Ordering::SeqCst);
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen_interval.load(Ordering::SeqCst), 10);

        std::fs::write(&path, b"[task]\nheartbeat_interval_sec = 25\n").unwrap();
        manager.reload().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(seen_interval.load(Ordering::SeqCst), 25);
        assert_eq!(manager.get().await.task.heartbeat_interval_sec, 25);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, b"[server]\nport = 9100\n").unwrap();

        let manager = ConfigManager::new(path.clone()).unwrap();
        assert_eq!(manager.get().await.server.port, 9100);

        std::fs::write(&path, b"not [valid toml").unwrap();
        assert!(manager.reload().await.is_err());
        assert_eq!(manager.get().await.server.port, 9100);
    }
}
