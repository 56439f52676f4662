//! Per-agent log ingest pipeline.
//!
//! Consumes the bounded log buffer, groups entries by task, and flushes a
//! group when it reaches the batch size or on the periodic tick. When the
//! session goes away the remaining groups are drained, sorted by timestamp
//! and pushed with retries under an overall deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opsfabric_core::config::LogStreamConfig;
use opsfabric_core::protocol::LogEntry;

use super::streams::LogStreamWriter;

const DISCONNECT_FLUSH_ATTEMPTS: u32 = 3;
const DISCONNECT_FLUSH_DEADLINE: Duration = Duration::from_secs(30);

pub struct LogPipeline {
    agent_id: String,
    writer: Arc<LogStreamWriter>,
    batch_size: usize,
    buffer_size: usize,
    flush_interval: Duration,
}

impl LogPipeline {
    pub fn new(agent_id: String, writer: Arc<LogStreamWriter>, cfg: &LogStreamConfig) -> LogPipeline {
        LogPipeline {
            agent_id,
            writer,
            batch_size: cfg.batch_size.max(1),
            buffer_size: cfg.buffer_size.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms.max(100)),
        }
    }

    /// Runs until `stop` fires, then drains and flushes what is left.
    pub async fn run(&self, rx: &mut mpsc::Receiver<LogEntry>, stop: CancellationToken) {
        let mut groups: HashMap<String, Vec<LogEntry>> = HashMap::new();
        let mut total_buffered = 0usize;
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                entry = rx.recv() => {
                    let Some(entry) = entry else { break };
                    self.ingest(entry, &mut groups, &mut total_buffered).await;
                }
                _ = ticker.tick() => {
                    self.flush_all(&mut groups, &mut total_buffered).await;
                }
            }
        }

        // Session gone: pick up anything still sitting in the channel.
        while let Ok(entry) = rx.try_recv() {
            let task_id = group_key(&entry);
            groups.entry(task_id).or_default().push(entry);
            total_buffered += 1;
        }
        self.flush_on_disconnect(groups, total_buffered).await;
    }

    async fn ingest(
        &self,
        entry: LogEntry,
        groups: &mut HashMap<String, Vec<LogEntry>>,
        total_buffered: &mut usize,
    ) {
        let task_id = group_key(&entry);

        if *total_buffered >= self.buffer_size && !self.evict_one(groups, total_buffered, &task_id) {
            debug!(agent_id = %self.agent_id, task_id, "log buffer full with no eviction candidate, dropping entry");
            return;
        }

        groups.entry(task_id.clone()).or_default().push(entry);
        *total_buffered += 1;

        let group_len = groups.get(&task_id).map_or(0, Vec::len);
        if group_len >= self.batch_size {
            let entries = groups.remove(&task_id).unwrap_or_default();
            *total_buffered -= entries.len();
            if let Err(e) = self.writer.push_logs(&self.agent_id, &task_id, &entries).await {
                warn!(agent_id = %self.agent_id, task_id, error = %e, "batch log flush failed");
            }
        }
    }

    /// Evicts the oldest entry of the largest group other than the one
    /// currently producing. Returns false when no such victim exists.
    fn evict_one(
        &self,
        groups: &mut HashMap<String, Vec<LogEntry>>,
        total_buffered: &mut usize,
        current_task: &str,
    ) -> bool {
        let victim = groups
            .iter()
            .filter(|(task_id, entries)| task_id.as_str() != current_task && !entries.is_empty())
            .max_by_key(|(_, entries)| entries.len())
            .map(|(task_id, _)| task_id.clone());

        let Some(victim) = victim else { return false };
        if let Some(entries) = groups.get_mut(&victim) {
            entries.remove(0);
            *total_buffered -= 1;
            if entries.is_empty() {
                groups.remove(&victim);
            }
        }
        true
    }

    async fn flush_all(
        &self,
        groups: &mut HashMap<String, Vec<LogEntry>>,
        total_buffered: &mut usize,
    ) {
        for (task_id, entries) in std::mem::take(groups) {
            if entries.is_empty() {
                continue;
            }
            *total_buffered -= entries.len();
            if let Err(e) = self.writer.push_logs(&self.agent_id, &task_id, &entries).await {
                warn!(agent_id = %self.agent_id, task_id, error = %e, "tick log flush failed");
            }
        }
    }

    /// Disconnect path: per-task timestamp ordering, bounded retries, and a
    /// success-rate line for the operator.
    async fn flush_on_disconnect(&self, groups: HashMap<String, Vec<LogEntry>>, total: usize) {
        if groups.is_empty() {
            return;
        }
        info!(
            agent_id = %self.agent_id,
            tasks = groups.len(),
            logs = total,
            "flushing buffered logs on disconnect"
        );

        let deadline = tokio::time::Instant::now() + DISCONNECT_FLUSH_DEADLINE;
        let mut pushed = 0usize;
        let mut failed_tasks = 0usize;

        for (task_id, mut entries) in groups {
            entries.sort_by_key(|e| e.timestamp);

            let mut ok = false;
            for attempt in 1..=DISCONNECT_FLUSH_ATTEMPTS {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                // The first failure moves the entries into the writer's
                // ring; later attempts drain the ring instead of
                // re-passing them, so nothing appends twice.
                let result = if attempt == 1 {
                    self.writer.push_logs(&self.agent_id, &task_id, &entries).await
                } else {
                    self.writer.flush_buffered().await
                };
                match result {
                    Ok(()) => {
                        ok = true;
                        break;
                    }
                    Err(e) => {
                        warn!(agent_id = %self.agent_id, task_id, attempt, error = %e, "disconnect flush attempt failed");
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
            if ok {
                pushed += entries.len();
            } else {
                failed_tasks += 1;
            }
        }

        let rate = if total > 0 {
            pushed as f64 / total as f64 * 100.0
        } else {
            100.0
        };
        info!(
            agent_id = %self.agent_id,
            pushed,
            total,
            failed_tasks,
            success_rate = format!("{rate:.1}%"),
            "disconnect log flush finished"
        );
    }
}

fn group_key(entry: &LogEntry) -> String {
    if entry.task_id.is_empty() {
        "unknown".to_string()
    } else {
        entry.task_id.clone()
    }
}
