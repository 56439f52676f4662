//! Agent registration records and the registry that owns them.
//!
//! A record is created at registration and survives disconnects; it is
//! destroyed only by the heartbeat-timeout sweep or administrative
//! removal. The record owns the bounded task queue and log buffer for its
//! agent plus the outbound side of the live session, when one exists.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use opsfabric_core::bus::KvStore;
use opsfabric_core::error::{FabricError, Result};
use opsfabric_core::protocol::{Frame, LogEntry, RegisterRequest, SystemInfo, TaskSpec};

use super::seen::SeenStore;

pub const LOG_BUFFER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
        }
    }
}

struct RecordState {
    name: String,
    labels: HashMap<String, String>,
    system: Option<SystemInfo>,
    last_heartbeat: DateTime<Utc>,
    status: AgentStatus,
}

/// One registered agent.
pub struct AgentRecord {
    pub id: String,
    pub token: String,
    pub host_id: i64,
    state: parking_lot::RwLock<RecordState>,
    running: parking_lot::RwLock<HashSet<String>>,

    task_tx: mpsc::Sender<TaskSpec>,
    task_rx: parking_lot::Mutex<Option<mpsc::Receiver<TaskSpec>>>,
    log_tx: mpsc::Sender<LogEntry>,
    log_rx: parking_lot::Mutex<Option<mpsc::Receiver<LogEntry>>>,
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<Frame>>>,

    /// Reliable-frame dedup for this agent's sessions.
    pub seen: SeenStore,
    log_dropped: AtomicU64,
}

impl AgentRecord {
    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn labels(&self) -> HashMap<String, String> {
        self.state.read().labels.clone()
    }

    pub fn system(&self) -> Option<SystemInfo> {
        self.state.read().system.clone()
    }

    pub fn status(&self) -> AgentStatus {
        self.state.read().status
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.state.read().last_heartbeat
    }

    pub fn update_heartbeat(&self) {
        self.state.write().last_heartbeat = Utc::now();
    }

    /// Alive means "heartbeat within the timeout window", independent of
    /// session state: a briefly-disconnected agent keeps its record (and
    /// id) until the window closes.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        let state = self.state.read();
        Utc::now() - state.last_heartbeat
            < chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(60))
    }

    /// A live session attaches its outbound sender; frames queued here are
    /// written by the session's writer task.
    pub fn attach_session(&self, outbound: mpsc::UnboundedSender<Frame>) {
        let mut state = self.state.write();
        state.status = AgentStatus::Active;
        state.last_heartbeat = Utc::now();
        *self.outbound.lock() = Some(outbound);
    }

    pub fn mark_disconnected(&self) {
        let mut state = self.state.write();
        state.status = AgentStatus::Inactive;
        state.last_heartbeat = Utc::now();
        *self.outbound.lock() = None;
    }

    pub fn is_session_attached(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Sends a frame over the live session, if any.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| FabricError::NotConnected),
            None => Err(FabricError::NotConnected),
        }
    }

    /// Non-blocking enqueue to the bounded task queue.
    pub fn try_queue_task(&self, task: TaskSpec) -> std::result::Result<(), TaskSpec> {
        self.task_tx.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) | mpsc::error::TrySendError::Closed(task) => task,
        })
    }

    pub fn take_task_rx(&self) -> Option<mpsc::Receiver<TaskSpec>> {
        self.task_rx.lock().take()
    }

    pub fn restore_task_rx(&self, rx: mpsc::Receiver<TaskSpec>) {
        *self.task_rx.lock() = Some(rx);
    }

    /// Non-blocking write to the bounded log buffer; overflow is counted.
    pub fn push_log(&self, entry: LogEntry) -> bool {
        match self.log_tx.try_send(entry) {
            Ok(()) => true,
            Err(_) => {
                self.log_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn logs_dropped(&self) -> u64 {
        self.log_dropped.load(Ordering::Relaxed)
    }

    pub fn take_log_rx(&self) -> Option<mpsc::Receiver<LogEntry>> {
        self.log_rx.lock().take()
    }

    pub fn restore_log_rx(&self, rx: mpsc::Receiver<LogEntry>) {
        *self.log_rx.lock() = Some(rx);
    }

    pub fn add_running_task(&self, task_id: &str) {
        if !task_id.is_empty() {
            self.running.write().insert(task_id.to_string());
        }
    }

    pub fn remove_running_task(&self, task_id: &str) {
        self.running.write().remove(task_id);
    }

    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.running.read().contains(task_id)
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.running.read().iter().cloned().collect()
    }
}

struct RegistryInner {
    by_id: HashMap<String, Arc<AgentRecord>>,
    by_token: HashMap<String, String>,
}

/// Owns every registration record. Writes happen only at register/remove.
pub struct Registry {
    inner: parking_lot::RwLock<RegistryInner>,
    kv: Arc<dyn KvStore>,
    max_connections: usize,
    task_queue_size: usize,
    heartbeat_timeout: Duration,
}

impl Registry {
    pub fn new(
        kv: Arc<dyn KvStore>,
        max_connections: usize,
        task_queue_size: usize,
        heartbeat_timeout: Duration,
    ) -> Registry {
        Registry {
            inner: parking_lot::RwLock::new(RegistryInner {
                by_id: HashMap::new(),
                by_token: HashMap::new(),
            }),
            kv,
            max_connections,
            task_queue_size,
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Registers an agent. A known token refreshes the existing record and
    /// keeps its id stable; otherwise a new record with a server-assigned
    /// id (and token, when the agent brought none) is created.
    pub fn register(&self, req: &RegisterRequest) -> Result<Arc<AgentRecord>> {
        let mut inner = self.inner.write();

        if !req.token.is_empty() {
            if let Some(id) = inner.by_token.get(&req.token).cloned() {
                if let Some(record) = inner.by_id.get(&id) {
                    let mut state = record.state.write();
                    state.name = req.name.clone();
                    state.labels = req.labels.clone();
                    state.system = req.system.clone();
                    state.last_heartbeat = Utc::now();
                    drop(state);
                    return Ok(Arc::clone(record));
                }
            }
        }

        if inner.by_id.len() >= self.max_connections {
            return Err(FabricError::ResourceLimit {
                message: "max connections reached".into(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let token = if req.token.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            req.token.clone()
        };

        let (task_tx, task_rx) = mpsc::channel(self.task_queue_size);
        let (log_tx, log_rx) = mpsc::channel(LOG_BUFFER_CAPACITY);

        let record = Arc::new(AgentRecord {
            id: id.clone(),
            token: token.clone(),
            host_id: req.host_id,
            state: parking_lot::RwLock::new(RecordState {
                name: req.name.clone(),
                labels: req.labels.clone(),
                system: req.system.clone(),
                last_heartbeat: Utc::now(),
                status: AgentStatus::Active,
            }),
            running: parking_lot::RwLock::new(HashSet::new()),
            task_tx,
            task_rx: parking_lot::Mutex::new(Some(task_rx)),
            log_tx,
            log_rx: parking_lot::Mutex::new(Some(log_rx)),
            outbound: parking_lot::Mutex::new(None),
            seen: SeenStore::new(Arc::clone(&self.kv), &id),
            log_dropped: AtomicU64::new(0),
        });

        inner.by_id.insert(id.clone(), Arc::clone(&record));
        inner.by_token.insert(token, id.clone());
        info!(agent_id = %id, agent_name = %req.name, "agent registered");
        Ok(record)
    }

    /// Validates a session handshake. Unknown id and bad token are distinct
    /// hard failures so the agent knows to re-register.
    pub fn connect(&self, agent_id: &str, token: &str) -> Result<Arc<AgentRecord>> {
        let record = self.get(agent_id).ok_or_else(|| FabricError::NotFound {
            what: format!("agent {agent_id}"),
        })?;
        if record.token != token {
            return Err(FabricError::PermissionDenied {
                message: "invalid token".into(),
            });
        }
        record.update_heartbeat();
        Ok(record)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentRecord>> {
        self.inner.read().by_id.get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<AgentRecord>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn remove(&self, agent_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner.by_id.remove(agent_id).ok_or_else(|| FabricError::NotFound {
            what: format!("agent {agent_id}"),
        })?;
        inner.by_token.remove(&record.token);
        record.mark_disconnected();
        info!(agent_id, "agent removed");
        Ok(())
    }

    /// Removes records whose last heartbeat is older than the timeout and
    /// returns them so the caller can emit one offline status each.
    pub fn cleanup_inactive(&self) -> Vec<Arc<AgentRecord>> {
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .by_id
            .iter()
            .filter(|(_, r)| !r.is_alive(self.heartbeat_timeout))
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(record) = inner.by_id.remove(&id) {
                inner.by_token.remove(&record.token);
                record.mark_disconnected();
                warn!(agent_id = %id, "removing agent after heartbeat timeout");
                removed.push(record);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfabric_core::bus::MemoryKv;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryKv::new()), 10, 4, Duration::from_secs(60))
    }

    fn request(name: &str, token: &str) -> RegisterRequest {
        RegisterRequest {
            name: name.into(),
            token: token.into(),
            labels: HashMap::new(),
            system: None,
            host_id: 7,
        }
    }

    #[test]
    fn test_register_assigns_id_and_token() {
        let registry = registry();
        let record = registry.register(&request("host-a", "")).unwrap();
        assert!(!record.id.is_empty());
        assert!(!record.token.is_empty());
        assert_eq!(record.status(), AgentStatus::Active);
    }

    #[test]
    fn test_reregister_with_token_keeps_id() {
        let registry = registry();
        let first = registry.register(&request("host-a", "tok-1")).unwrap();
        let second = registry.register(&request("host-a-renamed", "tok-1")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name(), "host-a-renamed");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_connect_validates_token() {
        let registry = registry();
        let record = registry.register(&request("host-a", "tok-1")).unwrap();

        assert!(registry.connect(&record.id, "tok-1").is_ok());
        assert!(matches!(
            registry.connect(&record.id, "wrong"),
            Err(FabricError::PermissionDenied { .. })
        ));
        assert!(matches!(
            registry.connect("no-such-id", "tok-1"),
            Err(FabricError::NotFound { .. })
        ));
    }

    #[test]
    fn test_task_queue_bounded_nonblocking() {
        let registry = registry();
        let record = registry.register(&request("host-a", "")).unwrap();

        let task = |i: usize| TaskSpec {
            id: format!("e_s_1_{i}"),
            name: "t".into(),
            task_type: Default::default(),
            command: "true".into(),
            script_type: String::new(),
            args: vec![],
            env: HashMap::new(),
            timeout_sec: 0,
            work_dir: String::new(),
            run_as: String::new(),
            file_transfer: None,
        };

        for i in 0..4 {
            assert!(record.try_queue_task(task(i)).is_ok());
        }
        // Queue of 4 is full: the fifth is handed back, never blocks.
        assert!(record.try_queue_task(task(4)).is_err());
    }

    #[test]
    fn test_cleanup_removes_stale_records() {
        let registry = Registry::new(
            Arc::new(MemoryKv::new()),
            10,
            4,
            Duration::from_millis(0),
        );
        let record = registry.register(&request("host-a", "")).unwrap();
        // Zero timeout: everything is immediately stale.
        let removed = registry.cleanup_inactive();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, record.id);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_running_task_set() {
        let registry = registry();
        let record = registry.register(&request("host-a", "")).unwrap();
        record.add_running_task("t1");
        assert!(record.is_task_running("t1"));
        record.remove_running_task("t1");
        assert!(!record.is_task_running("t1"));
    }
}
