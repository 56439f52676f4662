//! Task dispatch and offline replay.
//!
//! Dispatch persists first and pushes second: the pending record is the
//! source of truth until the agent confirms completion, so a dead session,
//! a full queue or an unknown agent all degrade to persist-only success.
//! When an agent (re)connects its pending tasks are replayed with bounded
//! concurrency, skipping anything already in flight or already acked.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use opsfabric_core::error::Result;
use opsfabric_core::protocol::{Frame, TaskSpec};

use super::pending::{PendingStore, PendingTask};
use super::registry::{AgentStatus, Registry};

const REPLAY_CONCURRENCY: usize = 5;
const REPLAY_DEADLINE: Duration = Duration::from_secs(300);

/// How a dispatch request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the live session's task queue.
    Queued,
    /// Persisted for replay (agent unknown, inactive, or queue full).
    Persisted,
}

/// How a cancel request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    SentToSession,
    RemovedFromPending,
    /// No record and no pending entry.
    NotFound,
    /// Agent known but inactive, and no pending entry existed.
    Inactive,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    pending: Arc<PendingStore>,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, pending: Arc<PendingStore>, max_retries: u32) -> Dispatcher {
        Dispatcher {
            registry,
            pending,
            max_retries,
        }
    }

    /// Dispatches one task. Always persists first (best-effort: a degraded
    /// store logs and continues so liveness is preserved), then pushes to
    /// the session when one is active.
    pub async fn dispatch(&self, agent_id: &str, task: TaskSpec) -> Result<DispatchOutcome> {
        if let Err(e) = self.pending.save_pending(agent_id, &task, self.max_retries).await {
            warn!(agent_id, task_id = %task.id, error = %e, "pending persist failed, continuing with push");
        }

        let Some(record) = self.registry.get(agent_id) else {
            info!(agent_id, task_id = %task.id, "agent not registered, task persisted for replay");
            return Ok(DispatchOutcome::Persisted);
        };

        if record.status() != AgentStatus::Active || !record.is_session_attached() {
            info!(agent_id, task_id = %task.id, "agent inactive, task persisted for replay");
            return Ok(DispatchOutcome::Persisted);
        }

        let task_id = task.id.clone();
        match record.try_queue_task(task) {
            Ok(()) => {
                record.add_running_task(&task_id);
                info!(agent_id, task_id, "task dispatched to agent");
                Ok(DispatchOutcome::Queued)
            }
            Err(_task) => {
                warn!(agent_id, task_id, "task queue full, task persisted for replay");
                Ok(DispatchOutcome::Persisted)
            }
        }
    }

    /// Replays pending tasks after a (re)connect. Tasks already running on
    /// the registration or already acked are marked acked and skipped, so a
    /// transient disconnect neither re-queues in-flight work nor re-sends
    /// completed work.
    pub async fn process_pending_for_agent(self: &Arc<Self>, agent_id: &str) -> Result<()> {
        let mut tasks = self.pending.get_agent_pending_tasks(agent_id).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        if self.registry.get(agent_id).is_none() {
            warn!(agent_id, "agent vanished before pending replay");
            return Ok(());
        }

        info!(agent_id, task_count = tasks.len(), "replaying pending tasks");
        // Stable proxy for submission order.
        tasks.sort_by(|a, b| {
            (a.task.task_type, &a.task.id).cmp(&(b.task.task_type, &b.task.id))
        });

        let semaphore = Arc::new(Semaphore::new(REPLAY_CONCURRENCY));
        let mut join_set = JoinSet::new();
        for pending in tasks {
            let dispatcher = Arc::clone(self);
            let agent_id = agent_id.to_string();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else { return };
                dispatcher.replay_one(&agent_id, pending).await;
            });
        }

        let drained = tokio::time::timeout(REPLAY_DEADLINE, async {
            while join_set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(agent_id, "pending replay interrupted by deadline");
            join_set.abort_all();
        }
        Ok(())
    }

    async fn replay_one(&self, agent_id: &str, pending: PendingTask) {
        let task_id = pending.task.id.clone();

        if let Some(record) = self.registry.get(agent_id) {
            if record.is_task_running(&task_id) {
                debug!(agent_id, task_id, "skipping pending task already in flight");
                let _ = self.pending.mark_acked(agent_id, &task_id).await;
                return;
            }
        }
        match self.pending.has_acked(agent_id, &task_id).await {
            Ok(true) => {
                debug!(agent_id, task_id, "skipping pending task already acked");
                let _ = self.pending.mark_acked(agent_id, &task_id).await;
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(agent_id, task_id, error = %e, "ack lookup failed, redispatching"),
        }

        if let Err(e) = self.dispatch(agent_id, pending.task).await {
            warn!(agent_id, task_id, error = %e, "pending task redispatch failed");
            let _ = self.pending.increment_retry(agent_id, &task_id).await;
        }
    }

    /// Cancels a task: live sessions get a cancel frame and the pending
    /// record is removed either way.
    pub async fn cancel(&self, agent_id: &str, task_id: &str) -> CancelOutcome {
        let record = self.registry.get(agent_id);

        let session_active = record
            .as_ref()
            .is_some_and(|r| r.status() == AgentStatus::Active && r.is_session_attached());

        let removed = self
            .pending
            .delete(agent_id, task_id)
            .await
            .unwrap_or_else(|e| {
                warn!(agent_id, task_id, error = %e, "pending delete failed during cancel");
                false
            });

        if session_active {
            let frame = Frame::CancelTask {
                task_id: task_id.to_string(),
                ts: chrono::Utc::now().timestamp_millis(),
            };
            if let Some(record) = &record {
                if record.send_frame(frame).is_ok() {
                    info!(agent_id, task_id, "cancel sent to agent session");
                    return CancelOutcome::SentToSession;
                }
            }
        }

        if removed {
            info!(agent_id, task_id, "task cancelled from pending store");
            CancelOutcome::RemovedFromPending
        } else if record.is_none() {
            CancelOutcome::NotFound
        } else {
            CancelOutcome::Inactive
        }
    }

    pub fn pending_store(&self) -> &Arc<PendingStore> {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfabric_core::bus::MemoryKv;
    use opsfabric_core::protocol::RegisterRequest;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn task(id: &str) -> TaskSpec {
        TaskSpec {
            id: id.into(),
            name: "t".into(),
            task_type: Default::default(),
            command: "echo hi".into(),
            script_type: String::new(),
            args: vec![],
            env: HashMap::new(),
            timeout_sec: 0,
            work_dir: String::new(),
            run_as: String::new(),
            file_transfer: None,
        }
    }

    fn fabric() -> (Arc<Registry>, Arc<Dispatcher>) {
        let kv: Arc<dyn opsfabric_core::bus::KvStore> = Arc::new(MemoryKv::new());
        let registry = Arc::new(Registry::new(
            Arc::clone(&kv),
            100,
            4,
            Duration::from_secs(60),
        ));
        let pending = Arc::new(PendingStore::new(kv, Duration::from_secs(5)));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), pending, 3));
        (registry, dispatcher)
    }

    fn register(registry: &Registry, name: &str) -> Arc<super::super::registry::AgentRecord> {
        registry
            .register(&RegisterRequest {
                name: name.into(),
                token: String::new(),
                labels: HashMap::new(),
                system: None,
                host_id: 1,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_unknown_agent_persists() {
        let (_registry, dispatcher) = fabric();
        let outcome = dispatcher.dispatch("ghost", task("t1")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Persisted);

        let pending = dispatcher
            .pending_store()
            .get_agent_pending_tasks("ghost")
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_session_persists() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");
        // Registered but no live session attached.
        let outcome = dispatcher.dispatch(&record.id, task("t1")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Persisted);
    }

    #[tokio::test]
    async fn test_dispatch_active_queues_and_tracks_running() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        record.attach_session(outbound_tx);

        let outcome = dispatcher.dispatch(&record.id, task("t1")).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Queued);
        assert!(record.is_task_running("t1"));

        let mut rx = record.take_task_rx().unwrap();
        assert_eq!(rx.try_recv().unwrap().id, "t1");
    }

    #[tokio::test]
    async fn test_queue_full_falls_back_to_persist() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        record.attach_session(outbound_tx);

        for i in 0..4 {
            assert_eq!(
                dispatcher.dispatch(&record.id, task(&format!("q{i}"))).await.unwrap(),
                DispatchOutcome::Queued
            );
        }
        assert_eq!(
            dispatcher.dispatch(&record.id, task("overflow")).await.unwrap(),
            DispatchOutcome::Persisted
        );
    }

    #[tokio::test]
    async fn test_replay_delivers_offline_dispatch_once() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");

        // Offline dispatch: persisted only, nothing on the queue.
        dispatcher.dispatch(&record.id, task("t1")).await.unwrap();
        let mut rx = record.take_task_rx().unwrap();
        assert!(rx.try_recv().is_err());
        record.restore_task_rx(rx);

        // Agent comes back.
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        record.attach_session(outbound_tx);
        dispatcher.process_pending_for_agent(&record.id).await.unwrap();

        // Exactly one delivery landed on the queue.
        let mut rx = record.take_task_rx().unwrap();
        assert_eq!(rx.try_recv().unwrap().id, "t1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replay_skips_acked_tasks() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");

        dispatcher.dispatch(&record.id, task("t1")).await.unwrap();
        dispatcher
            .pending_store()
            .mark_acked(&record.id, "t1")
            .await
            .unwrap();

        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        record.attach_session(outbound_tx);
        dispatcher.process_pending_for_agent(&record.id).await.unwrap();

        let mut rx = record.take_task_rx().unwrap();
        assert!(rx.try_recv().is_err(), "acked task must not be re-sent");
    }

    #[tokio::test]
    async fn test_replay_skips_running_tasks() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");

        dispatcher.dispatch(&record.id, task("t1")).await.unwrap();
        record.add_running_task("t1");

        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        record.attach_session(outbound_tx);
        dispatcher.process_pending_for_agent(&record.id).await.unwrap();

        let mut rx = record.take_task_rx().unwrap();
        assert!(rx.try_recv().is_err(), "in-flight task must not be re-queued");
        // The skip recorded an ack so later reconnects stay quiet too.
        assert!(dispatcher
            .pending_store()
            .has_acked(&record.id, "t1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cancel_offline_removes_pending() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");

        dispatcher.dispatch(&record.id, task("t1")).await.unwrap();
        let outcome = dispatcher.cancel(&record.id, "t1").await;
        assert_eq!(outcome, CancelOutcome::RemovedFromPending);

        // Later reconnect must not deliver the cancelled task.
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        record.attach_session(outbound_tx);
        dispatcher.process_pending_for_agent(&record.id).await.unwrap();
        let mut rx = record.take_task_rx().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_unknown_everything() {
        let (_registry, dispatcher) = fabric();
        assert_eq!(dispatcher.cancel("ghost", "t1").await, CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_active_sends_frame() {
        let (registry, dispatcher) = fabric();
        let record = register(&registry, "host-a");
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        record.attach_session(outbound_tx);

        dispatcher.dispatch(&record.id, task("t1")).await.unwrap();
        let outcome = dispatcher.cancel(&record.id, "t1").await;
        assert_eq!(outcome, CancelOutcome::SentToSession);

        // The session got a cancel frame and the pending record is gone.
        let frame = outbound_rx.try_recv().unwrap();
        assert!(matches!(frame, Frame::CancelTask { task_id, .. } if task_id == "t1"));
        assert!(dispatcher
            .pending_store()
            .get_pending(&record.id, "t1")
            .await
            .unwrap()
            .is_none());
    }
}
