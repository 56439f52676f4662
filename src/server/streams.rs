//! Event-bus stream writers.
//!
//! Everything the server learns from agents lands on one of four
//! append-only streams: logs, results, status, task stats. Records are
//! flat; nested values (memory, load average) are JSON-encoded strings.
//! The log writer keeps a bounded ring of failed appends and drains it
//! ahead of new entries once the bus recovers.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

use opsfabric_core::bus::{flatten_fields, EventBus, FlatFields};
use opsfabric_core::protocol::{LogEntry, SystemMetrics, TaskResult};
use opsfabric_core::taskid::TaskKey;

const FAILED_RING_CAPACITY: usize = 1000;

// =============================================================================
// Logs
// =============================================================================

pub struct LogStreamWriter {
    bus: Arc<dyn EventBus>,
    key: String,
    failed_ring: parking_lot::Mutex<VecDeque<FlatFields>>,
}

impl LogStreamWriter {
    pub fn new(bus: Arc<dyn EventBus>, key: String) -> LogStreamWriter {
        LogStreamWriter {
            bus,
            key,
            failed_ring: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a batch of log entries annotated with the execution context
    /// parsed from the task id. Entries that fail move into the ring and
    /// are drained ahead of any later batch, so a retry must call
    /// [`Self::flush_buffered`] rather than re-passing the same entries.
    pub async fn push_logs(
        &self,
        agent_id: &str,
        task_id: &str,
        entries: &[LogEntry],
    ) -> opsfabric_core::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let key = TaskKey::parse(task_id).unwrap_or_default();
        let now_ms = chrono::Utc::now().timestamp_millis();

        let records: Vec<FlatFields> = entries
            .iter()
            .map(|entry| {
                let ts = if entry.timestamp > 0 { entry.timestamp } else { now_ms / 1000 };
                let record_task_id = if entry.task_id.is_empty() { task_id } else { &entry.task_id };
                flatten_fields(vec![
                    ("task_id".into(), serde_json::json!(record_task_id)),
                    ("agent_id".into(), serde_json::json!(agent_id)),
                    ("execution_id".into(), serde_json::json!(key.execution_id)),
                    ("host_id".into(), serde_json::json!(key.host_id)),
                    ("content".into(), serde_json::json!(entry.content)),
                    ("stream".into(), serde_json::json!(entry.stream)),
                    ("level".into(), serde_json::json!(entry.level)),
                    ("timestamp".into(), serde_json::json!(ts)),
                ])
            })
            .collect();

        self.append_batch(records).await
    }

    /// Retries only what the ring already holds.
    pub async fn flush_buffered(&self) -> opsfabric_core::Result<()> {
        self.append_batch(Vec::new()).await
    }

    async fn append_batch(&self, new_records: Vec<FlatFields>) -> opsfabric_core::Result<()> {
        let mut batch: Vec<FlatFields> = {
            let mut ring = self.failed_ring.lock();
            ring.drain(..).collect()
        };
        batch.extend(new_records);
        if batch.is_empty() {
            return Ok(());
        }

        let mut failed: Vec<FlatFields> = Vec::new();
        let mut first_err = None;
        for fields in batch {
            if first_err.is_some() {
                failed.push(fields);
                continue;
            }
            if let Err(e) = self.bus.append(&self.key, fields.clone(), None).await {
                failed.push(fields);
                first_err = Some(e);
            }
        }

        if let Some(err) = first_err {
            let mut ring = self.failed_ring.lock();
            for fields in failed {
                if ring.len() >= FAILED_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(fields);
            }
            warn!(buffered = ring.len(), "log append failed, buffered for retry");
            return Err(err);
        }
        Ok(())
    }

    #[cfg(test)]
    fn ring_len(&self) -> usize {
        self.failed_ring.lock().len()
    }
}

// =============================================================================
// Results
// =============================================================================

pub struct ResultStreamWriter {
    bus: Arc<dyn EventBus>,
    key: String,
    maxlen: usize,
}

impl ResultStreamWriter {
    pub fn new(bus: Arc<dyn EventBus>, key: String, maxlen: usize) -> ResultStreamWriter {
        ResultStreamWriter { bus, key, maxlen }
    }

    pub async fn push_result(&self, agent_id: &str, result: &TaskResult) -> opsfabric_core::Result<()> {
        if result.task_id.is_empty() {
            return Err(opsfabric_core::FabricError::invalid_param("result missing task_id"));
        }
        let key = TaskKey::parse(&result.task_id).unwrap_or_default();

        let mut fields = vec![
            ("task_id".into(), serde_json::json!(result.task_id)),
            ("execution_id".into(), serde_json::json!(key.execution_id)),
            ("agent_id".into(), serde_json::json!(agent_id)),
            ("host_id".into(), serde_json::json!(key.host_id)),
            ("status".into(), serde_json::json!(result.status.as_str())),
            ("exit_code".into(), serde_json::json!(result.exit_code)),
            ("error_msg".into(), serde_json::json!(result.error_msg)),
            ("error_code".into(), serde_json::json!(result.error_code)),
            ("started_at".into(), serde_json::json!(result.started_at)),
            ("finished_at".into(), serde_json::json!(result.finished_at)),
            ("log_size".into(), serde_json::json!(result.log_size)),
            (
                "received_at".into(),
                serde_json::json!(chrono::Utc::now().timestamp_millis()),
            ),
        ];

        // Per-execution progress for downstream consumers; this result is
        // counted in before the scan lands it on the stream.
        if !key.execution_id.is_empty() {
            let progress = self
                .calculate_progress(&key.execution_id, key.host_id, result.status.as_str())
                .await;
            fields.extend(progress);
        }

        self.bus
            .append(&self.key, flatten_fields(fields), Some(self.maxlen))
            .await
    }

    /// Aggregates per-host terminal statuses for one execution from the
    /// results already on the stream (plus the result being appended).
    async fn calculate_progress(
        &self,
        execution_id: &str,
        current_host: i64,
        current_status: &str,
    ) -> Vec<(String, serde_json::Value)> {
        let mut hosts: std::collections::HashMap<i64, String> = std::collections::HashMap::new();
        if current_host != 0 {
            hosts.insert(current_host, current_status.to_string());
        }

        if let Ok(entries) = self.bus.range_scan(&self.key).await {
            for entry in entries {
                let mut exec = None;
                let mut host = 0i64;
                let mut status = String::new();
                for (k, v) in &entry {
                    match k.as_str() {
                        "execution_id" => exec = Some(v.clone()),
                        "host_id" => host = v.parse().unwrap_or(0),
                        "status" => status = v.clone(),
                        _ => {}
                    }
                }
                if exec.as_deref() == Some(execution_id) && host != 0 {
                    hosts.entry(host).or_insert(status);
                }
            }
        }

        let total = hosts.len();
        let success = hosts.values().filter(|s| s.as_str() == "success").count();
        let failed = hosts.values().filter(|s| s.as_str() == "failed").count();
        let running = hosts.values().filter(|s| s.as_str() == "running").count();
        let pending = total.saturating_sub(success + failed + running);
        let percent = if total > 0 { success * 100 / total } else { 0 };

        vec![
            ("total_hosts".into(), serde_json::json!(total)),
            ("success_hosts".into(), serde_json::json!(success)),
            ("failed_hosts".into(), serde_json::json!(failed)),
            ("running_hosts".into(), serde_json::json!(running)),
            ("pending_hosts".into(), serde_json::json!(pending)),
            ("progress".into(), serde_json::json!(percent)),
        ]
    }
}

// =============================================================================
// Status
// =============================================================================

pub struct StatusStreamWriter {
    bus: Arc<dyn EventBus>,
    key: String,
}

/// One status record; composite metric fields become JSON strings.
pub struct StatusRecord {
    pub agent_id: String,
    pub agent_name: String,
    pub host_id: i64,
    pub status: String,
    pub last_heartbeat_ms: i64,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub event: Option<String>,
    pub metrics: Option<SystemMetrics>,
}

impl StatusStreamWriter {
    pub fn new(bus: Arc<dyn EventBus>, key: String) -> StatusStreamWriter {
        StatusStreamWriter { bus, key }
    }

    pub async fn push_status(&self, record: StatusRecord) -> opsfabric_core::Result<()> {
        let mut fields = vec![
            ("agent_id".into(), serde_json::json!(record.agent_id)),
            ("agent_name".into(), serde_json::json!(record.agent_name)),
            ("host_id".into(), serde_json::json!(record.host_id)),
            ("status".into(), serde_json::json!(record.status)),
            ("last_heartbeat".into(), serde_json::json!(record.last_heartbeat_ms)),
            (
                "timestamp".into(),
                serde_json::json!(chrono::Utc::now().timestamp_millis()),
            ),
        ];
        if !record.hostname.is_empty() {
            fields.push(("hostname".into(), serde_json::json!(record.hostname)));
        }
        if !record.os.is_empty() {
            fields.push(("os".into(), serde_json::json!(record.os)));
        }
        if !record.arch.is_empty() {
            fields.push(("arch".into(), serde_json::json!(record.arch)));
        }
        if let Some(event) = &record.event {
            fields.push(("event".into(), serde_json::json!(event)));
        }
        if let Some(metrics) = &record.metrics {
            // Scalars stay flat, composites are JSON-encoded by flatten.
            fields.push(("uptime".into(), serde_json::json!(metrics.uptime)));
            fields.push((
                "memory".into(),
                serde_json::json!({
                    "total": metrics.memory_total,
                    "used": metrics.memory_used,
                }),
            ));
            if metrics.load_avg.len() >= 3 {
                fields.push((
                    "load_avg".into(),
                    serde_json::json!({
                        "1m": metrics.load_avg[0],
                        "5m": metrics.load_avg[1],
                        "15m": metrics.load_avg[2],
                    }),
                ));
            }
        }
        self.bus.append(&self.key, flatten_fields(fields), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsfabric_core::bus::MemoryBus;
    use opsfabric_core::protocol::TaskStatus;

    fn entry(content: &str, ts: i64) -> LogEntry {
        LogEntry {
            timestamp: ts,
            level: "info".into(),
            content: content.into(),
            stream: "stdout".into(),
            task_id: String::new(),
        }
    }

    #[tokio::test]
    async fn test_log_records_annotated_with_task_key() {
        let bus = Arc::new(MemoryBus::new());
        let writer = LogStreamWriter::new(Arc::clone(&bus) as Arc<dyn EventBus>, "agent_logs".into());

        writer
            .push_logs("a1", "exec9_step2_42_zz", &[entry("hello", 5)])
            .await
            .unwrap();

        let entries = bus.entries("agent_logs");
        assert_eq!(entries.len(), 1);
        let fields: std::collections::HashMap<_, _> = entries[0].iter().cloned().collect();
        assert_eq!(fields["execution_id"], "exec9");
        assert_eq!(fields["host_id"], "42");
        assert_eq!(fields["content"], "hello");
    }

    #[tokio::test]
    async fn test_result_stream_trimmed() {
        let bus = Arc::new(MemoryBus::new());
        let writer = ResultStreamWriter::new(Arc::clone(&bus) as Arc<dyn EventBus>, "agent_results".into(), 3);

        for i in 0..5 {
            let result = TaskResult {
                task_id: format!("e_s_1_{i}"),
                status: TaskStatus::Success,
                exit_code: 0,
                log: String::new(),
                log_size: 0,
                started_at: 1,
                finished_at: 2,
                error_msg: String::new(),
                error_code: 0,
            };
            writer.push_result("a1", &result).await.unwrap();
        }
        assert_eq!(bus.len("agent_results"), 3);
    }

    #[tokio::test]
    async fn test_result_progress_counts_hosts_per_execution() {
        let bus = Arc::new(MemoryBus::new());
        let writer = ResultStreamWriter::new(Arc::clone(&bus) as Arc<dyn EventBus>, "agent_results".into(), 100);

        let result = |task_id: &str, status: TaskStatus| TaskResult {
            task_id: task_id.into(),
            status,
            exit_code: 0,
            log: String::new(),
            log_size: 0,
            started_at: 1,
            finished_at: 2,
            error_msg: String::new(),
            error_code: 0,
        };

        writer
            .push_result("a1", &result("exec7_step1_1_x", TaskStatus::Success))
            .await
            .unwrap();
        writer
            .push_result("a2", &result("exec7_step1_2_y", TaskStatus::Failed))
            .await
            .unwrap();
        // A different execution does not perturb exec7's counters.
        writer
            .push_result("a3", &result("other_step1_3_z", TaskStatus::Success))
            .await
            .unwrap();

        let entries = bus.entries("agent_results");
        let second: std::collections::HashMap<_, _> = entries[1].iter().cloned().collect();
        assert_eq!(second["total_hosts"], "2");
        assert_eq!(second["success_hosts"], "1");
        assert_eq!(second["failed_hosts"], "1");
        assert_eq!(second["progress"], "50");
    }

    #[tokio::test]
    async fn test_status_composites_json_encoded() {
        let bus = Arc::new(MemoryBus::new());
        let writer = StatusStreamWriter::new(Arc::clone(&bus) as Arc<dyn EventBus>, "agent_status".into());

        writer
            .push_status(StatusRecord {
                agent_id: "a1".into(),
                agent_name: "host-a".into(),
                host_id: 7,
                status: "online".into(),
                last_heartbeat_ms: 123,
                hostname: "host-a".into(),
                os: "linux".into(),
                arch: "x86_64".into(),
                event: None,
                metrics: Some(SystemMetrics {
                    memory_total: 100,
                    memory_used: 40,
                    load_avg: vec![0.5, 0.4, 0.3],
                    uptime: 99,
                }),
            })
            .await
            .unwrap();

        let fields: std::collections::HashMap<_, _> =
            bus.entries("agent_status")[0].iter().cloned().collect();
        // Scalars flat, composites JSON-encoded strings.
        assert_eq!(fields["uptime"], "99");
        let memory: serde_json::Value = serde_json::from_str(&fields["memory"]).unwrap();
        assert_eq!(memory["used"], 40);
        let load: serde_json::Value = serde_json::from_str(&fields["load_avg"]).unwrap();
        assert_eq!(load["1m"], 0.5);
    }

    struct FlakyBus {
        inner: MemoryBus,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl opsfabric_core::bus::EventBus for FlakyBus {
        async fn append(
            &self,
            stream: &str,
            fields: FlatFields,
            maxlen: Option<usize>,
        ) -> opsfabric_core::Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(opsfabric_core::FabricError::network("bus down"));
            }
            self.inner.append(stream, fields, maxlen).await
        }

        async fn range_scan(&self, stream: &str) -> opsfabric_core::Result<Vec<FlatFields>> {
            Ok(self.inner.entries(stream))
        }

        async fn len(&self, stream: &str) -> opsfabric_core::Result<usize> {
            Ok(self.inner.len(stream))
        }
    }

    #[tokio::test]
    async fn test_failed_appends_ring_buffered_then_drained() {
        let flaky = Arc::new(FlakyBus {
            inner: MemoryBus::new(),
            fail: std::sync::atomic::AtomicBool::new(true),
        });
        let flaky_bus: Arc<dyn EventBus> = Arc::clone(&flaky) as Arc<dyn EventBus>;
        let writer = LogStreamWriter::new(flaky_bus, "agent_logs".into());

        // Bus down: entries land in the ring.
        assert!(writer.push_logs("a1", "e_s_1_x", &[entry("one", 1)]).await.is_err());
        assert_eq!(writer.ring_len(), 1);

        // Bus back: the ring drains ahead of the new entry.
        flaky.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        writer.push_logs("a1", "e_s_1_x", &[entry("two", 2)]).await.unwrap();
        assert_eq!(writer.ring_len(), 0);

        let contents: Vec<String> = flaky
            .inner
            .entries("agent_logs")
            .iter()
            .map(|fields| {
                fields
                    .iter()
                    .find(|(k, _)| k == "content")
                    .map(|(_, v)| v.clone())
                    .unwrap()
            })
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
    }
}
