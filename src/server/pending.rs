//! Pending-task store and ack ledger.
//!
//! Persists tasks that could not be handed to a live session so they can
//! be replayed when the agent returns, and a durable per-agent set of
//! acked task ids that suppresses re-dispatch of completed work across
//! reconnects. Backed by the narrow [`KvStore`] seam; without a backend it
//! runs memory-only with a warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use opsfabric_core::bus::KvStore;
use opsfabric_core::error::{FabricError, Result};
use opsfabric_core::protocol::TaskSpec;

const PENDING_TTL: Duration = Duration::from_secs(24 * 3600);
const SET_TTL: Duration = Duration::from_secs(48 * 3600);

/// One unresolved task for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTask {
    pub agent_id: String,
    pub task: TaskSpec,
    pub sent_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

pub struct PendingStore {
    kv: Arc<dyn KvStore>,
    op_timeout: Duration,
}

impl PendingStore {
    pub fn new(kv: Arc<dyn KvStore>, op_timeout: Duration) -> PendingStore {
        PendingStore { kv, op_timeout }
    }

    fn pending_key(agent_id: &str, task_id: &str) -> String {
        format!("agent:pending_tasks:{agent_id}:{task_id}")
    }

    fn tasks_key(agent_id: &str) -> String {
        format!("agent:tasks:{agent_id}")
    }

    fn ack_key(agent_id: &str) -> String {
        format!("agent:task_ack:{agent_id}")
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| FabricError::Timeout {
                duration: self.op_timeout,
            })?
    }

    /// Idempotent upsert of a pending record plus the enumeration set entry.
    pub async fn save_pending(&self, agent_id: &str, task: &TaskSpec, max_retries: u32) -> Result<()> {
        let pending = PendingTask {
            agent_id: agent_id.to_string(),
            task: task.clone(),
            sent_at: Utc::now(),
            retry_count: 0,
            max_retries,
        };
        let value = serde_json::to_string(&pending)?;
        let key = Self::pending_key(agent_id, &task.id);
        let tasks_key = Self::tasks_key(agent_id);

        self.bounded(async {
            self.kv.set_with_ttl(&key, &value, PENDING_TTL).await?;
            self.kv.set_add(&tasks_key, &task.id).await?;
            self.kv.expire(&tasks_key, SET_TTL).await?;
            Ok(())
        })
        .await?;

        info!(agent_id, task_id = %task.id, "task saved to pending store");
        Ok(())
    }

    pub async fn get_pending(&self, agent_id: &str, task_id: &str) -> Result<Option<PendingTask>> {
        let key = Self::pending_key(agent_id, task_id);
        let raw = self.bounded(self.kv.get(&key)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    /// All pending tasks for an agent. Ids whose record has expired are
    /// cleaned out of the enumeration set as a side effect.
    pub async fn get_agent_pending_tasks(&self, agent_id: &str) -> Result<Vec<PendingTask>> {
        let tasks_key = Self::tasks_key(agent_id);
        let ids = self.bounded(self.kv.set_members(&tasks_key)).await?;

        let mut tasks = Vec::with_capacity(ids.len());
        for task_id in ids {
            match self.get_pending(agent_id, &task_id).await {
                Ok(Some(pending)) => tasks.push(pending),
                Ok(None) => {
                    let _ = self.kv.set_remove(&tasks_key, &task_id).await;
                }
                Err(e) => {
                    warn!(agent_id, task_id, error = %e, "pending record fetch failed");
                }
            }
        }
        Ok(tasks)
    }

    pub async fn delete(&self, agent_id: &str, task_id: &str) -> Result<bool> {
        let key = Self::pending_key(agent_id, task_id);
        let tasks_key = Self::tasks_key(agent_id);

        self.bounded(async {
            let existed = self.kv.get(&key).await?.is_some();
            self.kv.del(&key).await?;
            self.kv.set_remove(&tasks_key, task_id).await?;
            Ok(existed)
        })
        .await
    }

    pub async fn clear_agent_tasks(&self, agent_id: &str) -> Result<()> {
        let ids = self
            .bounded(self.kv.set_members(&Self::tasks_key(agent_id)))
            .await?;
        for task_id in ids {
            let _ = self.delete(agent_id, &task_id).await;
        }
        self.bounded(self.kv.del(&Self::tasks_key(agent_id))).await?;
        info!(agent_id, "cleared all pending tasks");
        Ok(())
    }

    /// Bumps the retry counter; once `max_retries` is reached the task is
    /// acked (abandoned) to stop further resend.
    pub async fn increment_retry(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let Some(mut pending) = self.get_pending(agent_id, task_id).await? else {
            return Err(FabricError::NotFound {
                what: format!("pending task {task_id}"),
            });
        };
        pending.retry_count += 1;

        if pending.retry_count >= pending.max_retries {
            warn!(
                agent_id,
                task_id,
                retry_count = pending.retry_count,
                "task exceeded max retries, acking to stop resend"
            );
            return self.mark_acked(agent_id, task_id).await;
        }

        let value = serde_json::to_string(&pending)?;
        let key = Self::pending_key(agent_id, task_id);
        self.bounded(self.kv.set_with_ttl(&key, &value, PENDING_TTL))
            .await
    }

    /// Records the ack and removes the pending record.
    pub async fn mark_acked(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let ack_key = Self::ack_key(agent_id);
        self.bounded(async {
            self.kv.set_add(&ack_key, task_id).await?;
            self.kv.expire(&ack_key, SET_TTL).await?;
            Ok(())
        })
        .await?;
        self.delete(agent_id, task_id).await?;
        Ok(())
    }

    pub async fn has_acked(&self, agent_id: &str, task_id: &str) -> Result<bool> {
        if agent_id.is_empty() || task_id.is_empty() {
            return Err(FabricError::invalid_param("agent and task id required"));
        }
        self.bounded(self.kv.set_contains(&Self::ack_key(agent_id), task_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfabric_core::bus::MemoryKv;
    use std::collections::HashMap;

    fn store() -> PendingStore {
        PendingStore::new(Arc::new(MemoryKv::new()), Duration::from_secs(5))
    }

    fn task(id: &str) -> TaskSpec {
        TaskSpec {
            id: id.into(),
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
        }
    }

    #[tokio::test]
    async fn test_save_get_delete() {
        let store = store();
        store.save_pending("a1", &task("t1"), 3).await.unwrap();

        let pending = store.get_pending("a1", "t1").await.unwrap().unwrap();
        assert_eq!(pending.retry_count, 0);
        assert_eq!(pending.max_retries, 3);

        assert!(store.delete("a1", "t1").await.unwrap());
        assert!(store.get_pending("a1", "t1").await.unwrap().is_none());
        // Deleting again reports the record was gone.
        assert!(!store.delete("a1", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_is_idempotent_upsert() {
        let store = store();
        store.save_pending("a1", &task("t1"), 3).await.unwrap();
        store.save_pending("a1", &task("t1"), 3).await.unwrap();
        let tasks = store.get_agent_pending_tasks("a1").await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_enumeration() {
        let store = store();
        store.save_pending("a1", &task("t1"), 3).await.unwrap();
        store.save_pending("a1", &task("t2"), 3).await.unwrap();
        store.save_pending("a2", &task("t3"), 3).await.unwrap();

        let mut ids: Vec<String> = store
            .get_agent_pending_tasks("a1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.task.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_mark_acked_removes_pending() {
        let store = store();
        store.save_pending("a1", &task("t1"), 3).await.unwrap();
        store.mark_acked("a1", "t1").await.unwrap();

        assert!(store.has_acked("a1", "t1").await.unwrap());
        assert!(store.get_pending("a1", "t1").await.unwrap().is_none());
        assert!(store.get_agent_pending_tasks("a1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_acks() {
        let store = store();
        store.save_pending("a1", &task("t1"), 2).await.unwrap();

        store.increment_retry("a1", "t1").await.unwrap();
        assert!(!store.has_acked("a1", "t1").await.unwrap());

        // Second increment hits max_retries and abandons the task.
        store.increment_retry("a1", "t1").await.unwrap();
        assert!(store.has_acked("a1", "t1").await.unwrap());
        assert!(store.get_pending("a1", "t1").await.unwrap().is_none());
    }
}
