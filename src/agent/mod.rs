//! The endpoint agent.
//!
//! Registers with the server, keeps the duplex session alive, runs tasks
//! under a concurrency gate, and streams logs and results reliably with
//! the outbox as the only durable fallback.

pub mod control;
pub mod executor;
pub mod script;
pub mod session;
pub mod transfer;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opsfabric_core::config::{Config, ConfigManager};
use opsfabric_core::error::{FabricError, Result};
use opsfabric_core::outbox::FileOutbox;
use opsfabric_core::protocol::{
    Frame, LogEntry, RegisterRequest, RegisterResponse, TaskResult, TaskSpec, TaskStatus, TaskType,
};
use opsfabric_core::system;

use executor::{KillReason, ProcessExecutor, RunningTask};
use session::{derive_http_url, Registrar, SessionClient};
use transfer::TransferExecutor;

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
const COMPLETED_TTL: Duration = Duration::from_secs(600);
const COMPLETED_MAX: usize = 1000;
const DUPLICATE_SKIP_MSG: &str = "task skipped as duplicated (already completed)";

/// Recently-completed task ids, used to reject duplicate dispatches.
struct CompletedLedger {
    entries: HashMap<String, Instant>,
}

impl CompletedLedger {
    fn new() -> CompletedLedger {
        CompletedLedger {
            entries: HashMap::new(),
        }
    }

    fn contains(&mut self, task_id: &str) -> bool {
        let now = Instant::now();
        self.entries.retain(|_, t| now.duration_since(*t) < COMPLETED_TTL);
        self.entries.contains_key(task_id)
    }

    fn insert(&mut self, task_id: String) {
        let now = Instant::now();
        if self.entries.len() >= COMPLETED_MAX {
            self.entries.retain(|_, t| now.duration_since(*t) < COMPLETED_TTL);
            if self.entries.len() >= COMPLETED_MAX {
                if let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, t)| **t)
                    .map(|(id, _)| id.clone())
                {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(task_id, now);
    }
}

pub struct Agent {
    cfg: Arc<ConfigManager>,
    session: Arc<SessionClient>,
    outbox: Arc<FileOutbox>,
    http: reqwest::Client,
    process_executor: ProcessExecutor,
    transfer_executor: TransferExecutor,

    semaphore: Arc<Semaphore>,
    running: parking_lot::RwLock<HashMap<String, Arc<RunningTask>>>,
    /// Single acquire-or-reject gate against duplicate in-flight tasks.
    inflight: parking_lot::Mutex<HashSet<String>>,
    completed: parking_lot::Mutex<CompletedLedger>,

    agent_id: parking_lot::RwLock<String>,
    register_lock: tokio::sync::Mutex<()>,

    heartbeat_interval_sec: AtomicU64,
    heartbeat_failures: AtomicU32,
    max_execution_time_sec: AtomicU64,

    log_tx: mpsc::UnboundedSender<(String, LogEntry)>,
    cancel: CancellationToken,
}

impl Agent {
    pub async fn new(
        cfg: Arc<ConfigManager>,
        cancel: CancellationToken,
    ) -> (Arc<Agent>, mpsc::UnboundedReceiver<Frame>, mpsc::UnboundedReceiver<(String, LogEntry)>) {
        let snapshot = cfg.get().await;

        let outbox_dir = outbox_dir(&snapshot);
        let outbox = Arc::new(FileOutbox::open(
            &sanitize_name(&snapshot.identity.agent_name),
            outbox_dir.as_deref(),
            snapshot.outbox.max_size,
        ));

        let (session, inbound_rx) = SessionClient::new(
            snapshot.connection.server_url.clone(),
            Some(snapshot.connection.backup_url.clone()),
            snapshot.identity.agent_token.clone(),
            Arc::clone(&outbox),
            snapshot.logging.batch_size,
            Duration::from_millis(snapshot.connection.backoff_initial_ms),
            Duration::from_millis(snapshot.connection.backoff_max_ms),
            snapshot.connection.max_retries,
            cancel.child_token(),
        );

        let http = reqwest::Client::new();
        let temp_dir = std::env::temp_dir().join("opsfabric").join("scripts");
        let (log_tx, log_rx) = mpsc::unbounded_channel();

        let agent = Arc::new(Agent {
            session,
            outbox,
            process_executor: ProcessExecutor::new(temp_dir),
            transfer_executor: TransferExecutor::new(
                http.clone(),
                snapshot.resource_limit.bandwidth_limit_mb_s,
            ),
            http,
            semaphore: Arc::new(Semaphore::new(snapshot.task.max_concurrent_tasks)),
            running: parking_lot::RwLock::new(HashMap::new()),
            inflight: parking_lot::Mutex::new(HashSet::new()),
            completed: parking_lot::Mutex::new(CompletedLedger::new()),
            agent_id: parking_lot::RwLock::new(String::new()),
            register_lock: tokio::sync::Mutex::new(()),
            heartbeat_interval_sec: AtomicU64::new(snapshot.task.heartbeat_interval_sec),
            heartbeat_failures: AtomicU32::new(0),
            max_execution_time_sec: AtomicU64::new(snapshot.task.max_execution_time_sec),
            log_tx,
            cfg,
            cancel,
        });
        (agent, inbound_rx, log_rx)
    }

    /// Registers, starts the background loops, and runs the frame dispatch
    /// loop until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Frame>,
        mut log_rx: mpsc::UnboundedReceiver<(String, LogEntry)>,
    ) -> Result<()> {
        self.register().await?;

        // Hot-safe fields only; a Weak keeps the subscriber from pinning
        // the agent alive through the config holder.
        {
            let weak = Arc::downgrade(&self);
            self.cfg
                .subscribe(move |cfg: &Config| {
                    if let Some(agent) = weak.upgrade() {
                        agent
                            .heartbeat_interval_sec
                            .store(cfg.task.heartbeat_interval_sec, Ordering::SeqCst);
                    }
                })
                .await;
        }

        let registrar: Arc<dyn Registrar> = Arc::clone(&self) as Arc<dyn Registrar>;
        tokio::spawn(Arc::clone(&self.session).run_reconnect_loop(registrar));
        self.session.trigger_reconnect();

        let sweeper = self.outbox.start_sweeper();

        {
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.heartbeat_loop().await });
        }
        {
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.monitor_loop().await });
        }
        {
            let agent = Arc::clone(&self);
            tokio::spawn(async move { agent.outbox_flush_loop().await });
        }
        {
            // Forwards per-line log entries as reliable frames.
            let session = Arc::clone(&self.session);
            tokio::spawn(async move {
                while let Some((task_id, entry)) = log_rx.recv().await {
                    session
                        .emit_reliable(Frame::Log {
                            message_id: None,
                            task_id,
                            logs: vec![entry],
                            ts: chrono::Utc::now().timestamp_millis(),
                        })
                        .await;
                }
            });
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch_frame(frame),
                    None => break,
                },
            }
        }

        self.session.disconnect().await;
        sweeper.abort();
        self.outbox.close();
        info!("agent stopped");
        Ok(())
    }

    fn dispatch_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Task { task, .. } => {
                let agent = Arc::clone(self);
                tokio::spawn(async move { agent.execute_task(task).await });
            }
            Frame::TasksBatch { tasks, .. } => {
                for task in tasks {
                    let agent = Arc::clone(self);
                    tokio::spawn(async move { agent.execute_task(task).await });
                }
            }
            Frame::CancelTask { task_id, .. } => self.cancel_task(&task_id),
            Frame::CancelTasksBatch { task_ids, .. } => {
                for task_id in task_ids {
                    self.cancel_task(&task_id);
                }
            }
            Frame::Ack { ack_id } => {
                debug!(ack_id, "ack received");
            }
            Frame::Control { payload } => {
                tokio::spawn(control::handle_control(payload));
            }
            Frame::Upgrade { payload } => {
                tokio::spawn(control::handle_upgrade(payload, self.http.clone()));
            }
            other => {
                debug!(kind = other.type_name(), "ignoring unexpected frame");
            }
        }
    }

    async fn execute_task(self: Arc<Self>, task: TaskSpec) {
        let task_id = task.id.clone();
        info!(task_id, task_type = task.task_type.as_str(), "task received");

        if self.completed.lock().contains(&task_id) {
            warn!(task_id, "skipping duplicate of a recently completed task");
            self.emit_result(synthetic_cancelled(&task_id)).await;
            return;
        }

        // Acquire-or-reject: a second dispatch of an in-flight task is
        // dropped silently so the first execution answers for both.
        if !self.inflight.lock().insert(task_id.clone()) {
            warn!(task_id, "skipping duplicate of an in-flight task");
            return;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
            _ = self.cancel.cancelled() => {
                self.inflight.lock().remove(&task_id);
                return;
            }
        };
        let Ok(_permit) = permit else {
            self.inflight.lock().remove(&task_id);
            return;
        };

        let running = RunningTask::new(task_id.clone());
        self.running.write().insert(task_id.clone(), Arc::clone(&running));

        let log_fn = self.make_log_fn(task_id.clone());
        let result = match task.task_type {
            TaskType::Script => self.process_executor.execute(&task, &running, log_fn).await,
            TaskType::FileTransfer => self.transfer_executor.execute(&task, &running, log_fn).await,
        };

        info!(task_id, status = result.status.as_str(), "task finished");
        self.emit_result(result).await;

        self.running.write().remove(&task_id);
        self.completed.lock().insert(task_id.clone());
        self.inflight.lock().remove(&task_id);
    }

    fn make_log_fn(&self, task_id: String) -> executor::LogFn {
        let tx = self.log_tx.clone();
        Arc::new(move |line: &str, stream: &str| {
            let entry = LogEntry {
                timestamp: chrono::Utc::now().timestamp(),
                level: "info".into(),
                content: line.to_string(),
                stream: stream.to_string(),
                task_id: task_id.clone(),
            };
            let _ = tx.send((task_id.clone(), entry));
        })
    }

    async fn emit_result(&self, result: TaskResult) {
        let task_id = result.task_id.clone();
        self.session
            .emit_reliable(Frame::TaskResult {
                message_id: None,
                task_id,
                result,
                ts: chrono::Utc::now().timestamp_millis(),
            })
            .await;
    }

    fn cancel_task(&self, task_id: &str) {
        info!(task_id, "cancel requested");
        match self.running.read().get(task_id) {
            Some(running) => running.kill(KillReason::Cancelled),
            None => debug!(task_id, "cancel for unknown task"),
        }
    }

    /// Sweeps running tasks; anything past the global ceiling is torn down
    /// and will report as failed.
    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let ceiling = Duration::from_secs(self.max_execution_time_sec.load(Ordering::SeqCst));
            let victims: Vec<Arc<RunningTask>> = self
                .running
                .read()
                .values()
                .filter(|t| t.started_at.elapsed() > ceiling)
                .cloned()
                .collect();
            for victim in victims {
                warn!(
                    task_id = %victim.task_id,
                    runtime_sec = victim.started_at.elapsed().as_secs(),
                    "task exceeded global maximum execution time, terminating"
                );
                victim.kill(KillReason::TimedOut);
            }
        }
    }

    /// Heartbeats every interval; consecutive failures stretch the interval
    /// up to 5x to shed load, reset on the first success.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut last_sent: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let base = self.heartbeat_interval_sec.load(Ordering::SeqCst).max(1);
            let failures = self.heartbeat_failures.load(Ordering::SeqCst) as u64;
            let multiplier = (1 + failures / 3).min(5);
            let interval = Duration::from_secs(base * multiplier);

            if last_sent.is_some_and(|t| t.elapsed() < interval) {
                continue;
            }
            last_sent = Some(Instant::now());

            let frame = Frame::Heartbeat {
                payload: opsfabric_core::protocol::HeartbeatBody {
                    timestamp: chrono::Utc::now().timestamp(),
                    system: Some(system::collect_info()),
                    metrics: Some(system::collect_metrics()),
                },
                ts: chrono::Utc::now().timestamp_millis(),
            };
            match self.session.send(&frame).await {
                Ok(()) => {
                    self.heartbeat_failures.store(0, Ordering::SeqCst);
                }
                Err(e) => {
                    let failures = self.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(error = %e, failures, "heartbeat failed");
                }
            }
        }
    }

    async fn outbox_flush_loop(self: Arc<Self>) {
        let flush_interval = {
            let cfg = self.cfg.get().await;
            Duration::from_millis(cfg.logging.flush_interval_ms.max(50))
        };
        let mut ticker = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.session.is_connected() && !self.outbox.is_empty() {
                self.session.flush_outbox().await;
            }
        }
    }

    /// Registers with the server over HTTP and adopts the returned
    /// identity for the session.
    pub async fn register(&self) -> Result<String> {
        let cfg = self.cfg.get().await;
        let base = derive_http_url(&cfg.connection.server_url);
        let url = format!("{base}/api/agents/register");

        let request = RegisterRequest {
            name: cfg.identity.agent_name.clone(),
            token: cfg.identity.agent_token.clone(),
            labels: cfg.identity.labels.clone(),
            system: Some(system::collect_info()),
            host_id: cfg.identity.host_id,
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FabricError::RequestFailed {
                message: format!("register: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(FabricError::ResponseError {
                message: format!("register status {}", response.status().as_u16()),
            });
        }
        let registered: RegisterResponse =
            response.json().await.map_err(|e| FabricError::ResponseError {
                message: format!("register body: {e}"),
            })?;

        info!(agent_id = %registered.id, ws_url = %registered.ws_url, "registered with server");
        *self.agent_id.write() = registered.id.clone();
        self.session
            .set_identity(&registered.id, &registered.ws_url, &registered.token);
        Ok(registered.id)
    }

    pub fn agent_id(&self) -> String {
        self.agent_id.read().clone()
    }
}

#[async_trait]
impl Registrar for Agent {
    async fn re_register(&self) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(FabricError::internal("shutting down"));
        }
        let _guard = self.register_lock.lock().await;
        self.register().await
    }
}

fn synthetic_cancelled(task_id: &str) -> TaskResult {
    let now = chrono::Utc::now().timestamp();
    TaskResult {
        task_id: task_id.to_string(),
        status: TaskStatus::Cancelled,
        exit_code: -1,
        log: String::new(),
        log_size: 0,
        started_at: now,
        finished_at: now,
        error_msg: DUPLICATE_SKIP_MSG.into(),
        error_code: 0,
    }
}

fn outbox_dir(cfg: &Config) -> Option<PathBuf> {
    if cfg.logging.dir.is_empty() {
        Some(std::env::temp_dir().join("opsfabric"))
    } else {
        Some(PathBuf::from(&cfg.logging.dir))
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_ledger_ttl_and_cap() {
        let mut ledger = CompletedLedger::new();
        ledger.insert("a".into());
        assert!(ledger.contains("a"));
        assert!(!ledger.contains("b"));

        for i in 0..COMPLETED_MAX + 10 {
            ledger.insert(format!("t{i}"));
        }
        assert!(ledger.entries.len() <= COMPLETED_MAX);
    }

    #[test]
    fn test_synthetic_cancelled_shape() {
        let result = synthetic_cancelled("t1");
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.exit_code, -1);
        assert!(result.error_msg.contains("duplicated"));
    }

    #[tokio::test]
    async fn test_duplicate_inflight_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, b"").unwrap();
        let cfg = ConfigManager::new(path).unwrap();
        let (agent, _inbound, _logs) = Agent::new(cfg, CancellationToken::new()).await;

        assert!(agent.inflight.lock().insert("t1".into()));
        // Second dispatch of the same id is rejected by the gate.
        assert!(!agent.inflight.lock().insert("t1".into()));
        agent.inflight.lock().remove("t1");
        assert!(agent.inflight.lock().insert("t1".into()));
    }
}
