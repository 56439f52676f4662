//! Reliable-frame dedup: first-observation ledger per agent.
//!
//! Senders replay un-acked frames, so the same `message_id` can arrive
//! more than once within a session or across a reconnect. `seen` records
//! the first observation with a TTL and reports whether the id was already
//! known, making every downstream effect at-most-once per id.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use opsfabric_core::bus::KvStore;

const SEEN_TTL: Duration = Duration::from_secs(600);

pub struct SeenStore {
    kv: Arc<dyn KvStore>,
    key: String,
    ttl: Duration,
}

impl SeenStore {
    pub fn new(kv: Arc<dyn KvStore>, agent_id: &str) -> SeenStore {
        SeenStore {
            kv,
            key: format!("agent:seen:{agent_id}"),
            ttl: SEEN_TTL,
        }
    }

    /// Returns true when `message_id` was already observed within the TTL;
    /// otherwise records it and returns false. Store failures err toward
    /// processing (a duplicate bus append is preferable to a dropped one).
    pub async fn seen(&self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return false;
        }
        let now = chrono::Utc::now().timestamp();

        match self.kv.hash_get(&self.key, message_id).await {
            Ok(Some(ts)) => {
                if let Ok(ts) = ts.parse::<i64>() {
                    if now - ts < self.ttl.as_secs() as i64 {
                        return true;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "seen-store read failed, treating as unseen");
            }
        }

        if let Err(e) = self.kv.hash_set(&self.key, message_id, &now.to_string()).await {
            warn!(error = %e, "seen-store write failed");
        }
        if let Err(e) = self.kv.expire(&self.key, self.ttl).await {
            warn!(error = %e, "seen-store expire failed");
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfabric_core::bus::MemoryKv;

    #[tokio::test]
    async fn test_first_observation_then_duplicate() {
        let store = SeenStore::new(Arc::new(MemoryKv::new()), "a1");
        assert!(!store.seen("m1").await);
        assert!(store.seen("m1").await);
        assert!(!store.seen("m2").await);
    }

    #[tokio::test]
    async fn test_empty_id_never_seen() {
        let store = SeenStore::new(Arc::new(MemoryKv::new()), "a1");
        assert!(!store.seen("").await);
        assert!(!store.seen("").await);
    }

    #[tokio::test]
    async fn test_agents_isolated() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let a = SeenStore::new(Arc::clone(&kv), "a1");
        let b = SeenStore::new(kv, "a2");
        assert!(!a.seen("m1").await);
        assert!(!b.seen("m1").await);
        assert!(a.seen("m1").await);
    }
}
