//! Per-agent task execution statistics.
//!
//! Counters are updated on every task result and pushed to the stats
//! stream at most once per push interval per agent, plus a final push when
//! the agent disconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use opsfabric_core::bus::{flatten_fields, EventBus};
use opsfabric_core::protocol::TaskStatus;

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_duration_ms: i64,
}

impl TaskStats {
    fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64 * 100.0
        }
    }

    fn avg_duration_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total as f64
        }
    }
}

struct AggregatorState {
    stats: HashMap<String, TaskStats>,
    last_push: HashMap<String, Instant>,
}

pub struct StatsAggregator {
    bus: Arc<dyn EventBus>,
    stream_key: String,
    push_interval: Duration,
    state: parking_lot::Mutex<AggregatorState>,
}

impl StatsAggregator {
    pub fn new(bus: Arc<dyn EventBus>, stream_key: String, push_interval: Duration) -> StatsAggregator {
        StatsAggregator {
            bus,
            stream_key,
            push_interval,
            state: parking_lot::Mutex::new(AggregatorState {
                stats: HashMap::new(),
                last_push: HashMap::new(),
            }),
        }
    }

    pub fn update(&self, agent_id: &str, status: TaskStatus, duration_ms: i64) {
        if agent_id.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let stats = state.stats.entry(agent_id.to_string()).or_default();
        stats.total += 1;
        stats.total_duration_ms += duration_ms;
        match status {
            TaskStatus::Success => stats.success += 1,
            TaskStatus::Failed => stats.failed += 1,
            TaskStatus::Cancelled => stats.cancelled += 1,
            _ => {}
        }
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<TaskStats> {
        self.state.lock().stats.get(agent_id).cloned()
    }

    /// Throttle gate: at most one push per interval per agent.
    pub fn should_push(&self, agent_id: &str) -> bool {
        let state = self.state.lock();
        state
            .last_push
            .get(agent_id)
            .map_or(true, |t| t.elapsed() >= self.push_interval)
    }

    pub async fn push(&self, agent_id: &str) {
        let Some(stats) = self.snapshot(agent_id) else { return };

        let fields = flatten_fields(vec![
            ("agent_id".into(), serde_json::json!(agent_id)),
            ("total".into(), serde_json::json!(stats.total)),
            ("success".into(), serde_json::json!(stats.success)),
            ("failed".into(), serde_json::json!(stats.failed)),
            ("cancelled".into(), serde_json::json!(stats.cancelled)),
            ("avg_duration_ms".into(), serde_json::json!(stats.avg_duration_ms())),
            ("success_rate".into(), serde_json::json!(stats.success_rate())),
            (
                "timestamp".into(),
                serde_json::json!(chrono::Utc::now().timestamp_millis()),
            ),
        ]);

        if let Err(e) = self.bus.append(&self.stream_key, fields, None).await {
            warn!(agent_id, error = %e, "task stats push failed");
            return;
        }
        self.state
            .lock()
            .last_push
            .insert(agent_id.to_string(), Instant::now());
    }

    /// Final push plus local cleanup when the agent disconnects.
    pub async fn on_agent_disconnect(&self, agent_id: &str) {
        self.push(agent_id).await;
        let mut state = self.state.lock();
        state.stats.remove(agent_id);
        state.last_push.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfabric_core::bus::MemoryBus;

    fn aggregator(bus: Arc<MemoryBus>) -> StatsAggregator {
        StatsAggregator::new(bus, "agent_task_stats".into(), Duration::from_secs(30))
    }

    #[test]
    fn test_counters() {
        let agg = aggregator(Arc::new(MemoryBus::new()));
        agg.update("a1", TaskStatus::Success, 100);
        agg.update("a1", TaskStatus::Failed, 300);
        agg.update("a1", TaskStatus::Cancelled, 0);

        let stats = agg.snapshot("a1").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total_duration_ms, 400);
    }

    #[tokio::test]
    async fn test_push_throttled() {
        let bus = Arc::new(MemoryBus::new());
        let agg = aggregator(Arc::clone(&bus));
        agg.update("a1", TaskStatus::Success, 10);

        assert!(agg.should_push("a1"));
        agg.push("a1").await;
        assert!(!agg.should_push("a1"));
        assert_eq!(bus.len("agent_task_stats"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_pushes_and_clears() {
        let bus = Arc::new(MemoryBus::new());
        let agg = aggregator(Arc::clone(&bus));
        agg.update("a1", TaskStatus::Success, 10);

        agg.on_agent_disconnect("a1").await;
        assert_eq!(bus.len("agent_task_stats"), 1);
        assert!(agg.snapshot("a1").is_none());
    }
}
