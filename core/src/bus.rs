//! Narrow seams to the external event bus and key-value service.
//!
//! The server reaches its durable backends only through these traits so
//! that a missing backend degrades to in-memory mode and tests run without
//! any external service. Stream fields are flat: nested values must be
//! JSON-encoded into strings before they cross this boundary.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::error::Result;

/// One flat record appended to a stream.
pub type FlatFields = Vec<(String, String)>;

/// Append-only named streams with approximate length trimming.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn append(&self, stream: &str, fields: FlatFields, maxlen: Option<usize>) -> Result<()>;

    /// Full scan of a stream, oldest first. Streams are trimmed, so this
    /// is bounded by the stream's maxlen.
    async fn range_scan(&self, stream: &str) -> Result<Vec<FlatFields>>;

    async fn len(&self, stream: &str) -> Result<usize>;
}

/// String, set and TTL operations backing the pending store and ack ledger.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn set_add(&self, key: &str, member: &str) -> Result<()>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// JSON-encodes nested values so every field is a flat string.
pub fn flatten_fields(fields: Vec<(String, serde_json::Value)>) -> FlatFields {
    fields
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    serde_json::to_string(&v).unwrap_or_default()
                }
                other => other.to_string(),
            };
            (k, s)
        })
        .collect()
}

// =============================================================================
// In-memory implementations (degraded mode and tests)
// =============================================================================

#[derive(Default)]
pub struct MemoryBus {
    streams: parking_lot::Mutex<HashMap<String, VecDeque<FlatFields>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<FlatFields> {
        self.streams
            .lock()
            .get(stream)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, stream: &str) -> usize {
        self.streams.lock().get(stream).map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn append(&self, stream: &str, fields: FlatFields, maxlen: Option<usize>) -> Result<()> {
        let mut streams = self.streams.lock();
        let queue = streams.entry(stream.to_string()).or_default();
        queue.push_back(fields);
        if let Some(maxlen) = maxlen {
            while queue.len() > maxlen {
                queue.pop_front();
            }
        }
        Ok(())
    }

    async fn range_scan(&self, stream: &str) -> Result<Vec<FlatFields>> {
        Ok(self.entries(stream))
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        Ok(MemoryBus::len(self, stream))
    }
}

#[derive(Default)]
struct MemoryKvState {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, (HashSet<String>, Option<Instant>)>,
    hashes: HashMap<String, (HashMap<String, String>, Option<Instant>)>,
}

impl MemoryKvState {
    fn gc(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, (_, exp)| exp.map_or(true, |e| e > now));
        self.sets.retain(|_, (_, exp)| exp.map_or(true, |e| e > now));
        self.hashes.retain(|_, (_, exp)| exp.map_or(true, |e| e > now));
    }
}

#[derive(Default)]
pub struct MemoryKv {
    state: parking_lot::Mutex<MemoryKvState>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.gc();
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.gc();
        Ok(state.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.strings.remove(key);
        state.sets.remove(key);
        state.hashes.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.gc();
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .0
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some((set, _)) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.gc();
        Ok(state.sets.get(key).is_some_and(|(s, _)| s.contains(member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.gc();
        Ok(state
            .sets
            .get(key)
            .map(|(s, _)| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.gc();
        Ok(state
            .hashes
            .get(key)
            .and_then(|(h, _)| h.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.gc();
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .0
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let deadline = Some(Instant::now() + ttl);
        if let Some(entry) = state.strings.get_mut(key) {
            entry.1 = deadline;
        }
        if let Some(entry) = state.sets.get_mut(key) {
            entry.1 = deadline;
        }
        if let Some(entry) = state.hashes.get_mut(key) {
            entry.1 = deadline;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bus_maxlen_trim() {
        let bus = MemoryBus::new();
        for i in 0..5 {
            bus.append("s", vec![("i".into(), i.to_string())], Some(3))
                .await
                .unwrap();
        }
        let entries = bus.entries("s");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0][0].1, "2");
    }

    #[tokio::test]
    async fn test_memory_kv_ttl() {
        let kv = MemoryKv::new();
        kv.set_with_ttl("k", "v", Duration::from_millis(20)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_kv_sets() {
        let kv = MemoryKv::new();
        kv.set_add("s", "a").await.unwrap();
        kv.set_add("s", "b").await.unwrap();
        assert!(kv.set_contains("s", "a").await.unwrap());

        kv.set_remove("s", "a").await.unwrap();
        assert!(!kv.set_contains("s", "a").await.unwrap());
        assert_eq!(kv.set_members("s").await.unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_flatten_encodes_nested() {
        let flat = flatten_fields(vec![
            ("plain".into(), serde_json::json!("text")),
            ("num".into(), serde_json::json!(7)),
            ("memory".into(), serde_json::json!({"total": 1, "used": 2})),
        ]);
        assert_eq!(flat[0].1, "text");
        assert_eq!(flat[1].1, "7");
        assert!(flat[2].1.starts_with('{'));
        let parsed: serde_json::Value = serde_json::from_str(&flat[2].1).unwrap();
        assert_eq!(parsed["used"], 2);
    }
}
