//! Durable outbox for frames awaiting send.
//!
//! A bounded in-memory FIFO mirrored to a newline-delimited JSON file so
//! that logs and results produced while the session is down survive an
//! agent restart. The file is rotated by size and rotated files are swept
//! by age. The outbox is the agent's sole durable state.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::protocol::Frame;

const DEFAULT_MAX_SIZE: usize = 2000;
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
const ENTRY_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
const ROTATED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// One persisted line: the frame plus its enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboxRecord {
    frame: Frame,
    /// Unix millis at enqueue.
    created_at: i64,
}

struct OutboxState {
    queue: VecDeque<OutboxRecord>,
    dropped: u64,
}

pub struct FileOutbox {
    state: parking_lot::Mutex<OutboxState>,
    file_path: Option<PathBuf>,
    max_size: usize,
}

impl FileOutbox {
    /// Opens (or creates) the outbox for `agent_id` under `dir`. A directory
    /// that cannot be created degrades to memory-only mode with a warning.
    /// Entries older than 24 hours and corrupt lines are skipped on recovery.
    pub fn open(agent_id: &str, dir: Option<&Path>, max_size: usize) -> FileOutbox {
        let max_size = if max_size == 0 { DEFAULT_MAX_SIZE } else { max_size };

        let file_path = dir.and_then(|dir| {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "outbox dir creation failed, running memory-only");
                return None;
            }
            Some(dir.join(format!("outbox_{agent_id}.ndjson")))
        });

        let mut outbox = FileOutbox {
            state: parking_lot::Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(max_size.min(256)),
                dropped: 0,
            }),
            file_path,
            max_size,
        };
        outbox.recover();

        match &outbox.file_path {
            Some(path) => info!(
                agent_id,
                path = %path.display(),
                recovered = outbox.len(),
                "outbox opened with file persistence"
            ),
            None => warn!(agent_id, "outbox running in memory-only mode"),
        }
        outbox
    }

    /// Appends a frame. Never blocks: on overflow the oldest entry is
    /// dropped and counted.
    pub fn enqueue(&self, frame: Frame) {
        let record = OutboxRecord {
            frame,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        {
            let mut state = self.state.lock();
            if state.queue.len() >= self.max_size {
                state.queue.pop_front();
                state.dropped += 1;
                warn!(dropped = state.dropped, "outbox full, dropped oldest frame");
            }
            state.queue.push_back(record.clone());
        }

        self.append_to_file(&record);
    }

    /// Removes and returns up to `max` frames in enqueue order.
    pub fn drain(&self, max: usize) -> Vec<Frame> {
        let mut state = self.state.lock();
        let n = max.min(state.queue.len());
        let drained: Vec<Frame> = state.queue.drain(..n).map(|r| r.frame).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), remaining = state.queue.len(), "outbox drained");
        }
        drained
    }

    /// Pushes frames back to the head in their original order so a failed
    /// send never reorders the stream.
    pub fn requeue_front(&self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        let now = chrono::Utc::now().timestamp_millis();
        let mut state = self.state.lock();
        for frame in frames.into_iter().rev() {
            state.queue.push_front(OutboxRecord {
                frame,
                created_at: now,
            });
        }
        while state.queue.len() > self.max_size {
            state.queue.pop_back();
            state.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Flushes the in-memory queue back to the file (truncating), leaving
    /// unsent frames for the next start.
    pub fn close(&self) {
        let Some(path) = &self.file_path else { return };
        let state = self.state.lock();

        let file = match OpenOptions::new().write(true).create(true).truncate(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "outbox flush on close failed");
                return;
            }
        };
        let mut writer = std::io::BufWriter::new(file);
        for record in &state.queue {
            if let Ok(line) = serde_json::to_string(record) {
                let _ = writeln!(writer, "{line}");
            }
        }
        let _ = writer.flush();
        info!(count = state.queue.len(), "outbox flushed to file on close");
    }

    /// Removes all frames and the backing file.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.queue.clear();
            state.dropped = 0;
        }
        if let Some(path) = &self.file_path {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Hourly sweep deleting rotated files older than the retention window.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                outbox.sweep_rotated();
            }
        })
    }

    fn append_to_file(&self, record: &OutboxRecord) {
        let Some(path) = &self.file_path else { return };

        if let Err(e) = self.rotate_if_needed(path) {
            warn!(path = %path.display(), error = %e, "outbox rotation check failed");
        }

        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "outbox record serialization failed");
                return;
            }
        };
        let result = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "outbox file append failed");
        }
    }

    fn rotate_if_needed(&self, path: &Path) -> std::io::Result<()> {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if meta.len() < MAX_FILE_SIZE {
            return Ok(());
        }
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let rotated = path.with_extension(format!("ndjson.{stamp}.old"));
        std::fs::rename(path, &rotated)?;
        info!(rotated = %rotated.display(), size = meta.len(), "outbox file rotated");
        Ok(())
    }

    fn sweep_rotated(&self) {
        let Some(path) = &self.file_path else { return };
        let Some(dir) = path.parent() else { return };
        let Some(base) = path.file_stem().and_then(|s| s.to_str()) else { return };

        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "outbox sweep readdir failed");
                return;
            }
        };

        let mut deleted = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(base) && name.ends_with(".old")) {
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|m| m.elapsed().map(|age| age > ROTATED_RETENTION).unwrap_or(false))
                .unwrap_or(false);
            if expired && std::fs::remove_file(entry.path()).is_ok() {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "swept rotated outbox files");
        }
    }

    fn recover(&mut self) {
        let Some(path) = &self.file_path else { return };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "outbox recovery open failed");
                return;
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        let max_age_ms = ENTRY_MAX_AGE.as_millis() as i64;
        let mut recovered = 0usize;
        let mut skipped = 0usize;

        let state = self.state.get_mut();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            if line.is_empty() {
                continue;
            }
            let record: OutboxRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipped corrupt outbox line");
                    skipped += 1;
                    continue;
                }
            };
            if now - record.created_at > max_age_ms {
                skipped += 1;
                continue;
            }
            if state.queue.len() >= self.max_size {
                skipped += 1;
                continue;
            }
            state.queue.push_back(record);
            recovered += 1;
        }

        if recovered > 0 || skipped > 0 {
            info!(recovered, skipped, "outbox recovery finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LogEntry, TaskResult, TaskStatus};

    fn log_frame(task_id: &str, content: &str) -> Frame {
        Frame::Log {
            message_id: Some(format!("m-{content}")),
            task_id: task_id.into(),
            logs: vec![LogEntry {
                timestamp: 1,
                level: "info".into(),
                content: content.into(),
                stream: "stdout".into(),
                task_id: task_id.into(),
            }],
            ts: 1,
        }
    }

    #[test]
    fn test_bounded_drop_head() {
        let outbox = FileOutbox::open("a1", None, 3);
        for i in 0..5 {
            outbox.enqueue(log_frame("t", &i.to_string()));
        }
        assert_eq!(outbox.len(), 3);
        assert_eq!(outbox.dropped(), 2);

        // Oldest two were dropped; order of the rest preserved.
        let drained = outbox.drain(10);
        let ids: Vec<_> = drained.iter().filter_map(|f| f.message_id()).collect();
        assert_eq!(ids, vec!["m-2", "m-3", "m-4"]);
    }

    #[test]
    fn test_drain_and_requeue_preserve_order() {
        let outbox = FileOutbox::open("a1", None, 10);
        for i in 0..4 {
            outbox.enqueue(log_frame("t", &i.to_string()));
        }

        let batch = outbox.drain(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(outbox.len(), 2);

        // Send failed: push the batch back to the head, order intact.
        outbox.requeue_front(batch);
        let all = outbox.drain(10);
        let ids: Vec<_> = all.iter().filter_map(|f| f.message_id()).collect();
        assert_eq!(ids, vec!["m-0", "m-1", "m-2", "m-3"]);
    }

    #[test]
    fn test_recovery_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let outbox = FileOutbox::open("a1", Some(dir.path()), 10);
            outbox.enqueue(log_frame("t", "persisted"));
            outbox.close();
        }

        let outbox = FileOutbox::open("a1", Some(dir.path()), 10);
        assert_eq!(outbox.len(), 1);
        let drained = outbox.drain(1);
        assert_eq!(drained[0].message_id(), Some("m-persisted"));
    }

    #[test]
    fn test_recovery_skips_corrupt_and_stale_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox_a1.ndjson");

        let fresh = OutboxRecord {
            frame: log_frame("t", "fresh"),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let stale = OutboxRecord {
            frame: log_frame("t", "stale"),
            created_at: chrono::Utc::now().timestamp_millis() - 25 * 3600 * 1000,
        };
        let mut f = File::create(&path).unwrap();
        writeln!(f, "{}", serde_json::to_string(&stale).unwrap()).unwrap();
        writeln!(f, "this is not json").unwrap();
        writeln!(f, "{}", serde_json::to_string(&fresh).unwrap()).unwrap();

        let outbox = FileOutbox::open("a1", Some(dir.path()), 10);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.drain(1)[0].message_id(), Some("m-fresh"));
    }

    #[test]
    fn test_close_flush_truncates_sent_frames() {
        let dir = tempfile::tempdir().unwrap();
        {
            let outbox = FileOutbox::open("a1", Some(dir.path()), 10);
            outbox.enqueue(log_frame("t", "sent"));
            outbox.enqueue(Frame::TaskResult {
                message_id: Some("m-result".into()),
                task_id: "t".into(),
                result: TaskResult {
                    task_id: "t".into(),
                    status: TaskStatus::Success,
                    exit_code: 0,
                    log: String::new(),
                    log_size: 0,
                    started_at: 1,
                    finished_at: 2,
                    error_msg: String::new(),
                    error_code: 0,
                },
                ts: 0,
            });
            // First frame was delivered before shutdown.
            let _ = outbox.drain(1);
            outbox.close();
        }

        let outbox = FileOutbox::open("a1", Some(dir.path()), 10);
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.drain(1)[0].message_id(), Some("m-result"));
    }

    #[test]
    fn test_memory_only_mode() {
        // A path that cannot be created degrades to memory-only.
        let bogus = Path::new("/proc/definitely/not/writable");
        let outbox = FileOutbox::open("a1", Some(bogus), 5);
        outbox.enqueue(log_frame("t", "x"));
        assert_eq!(outbox.len(), 1);
        outbox.close();
    }
}
