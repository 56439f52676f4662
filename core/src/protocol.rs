//! Wire protocol for the agent <-> server duplex session.
//!
//! A session is an ordered stream of JSON [`Frame`]s. Each frame type carries
//! exactly one body shape; serde's tagged-enum decoding rejects a frame whose
//! body does not match its `type`. Reliable frames (`log`, `task_result`)
//! carry a sender-assigned `message_id` and must be acknowledged by the
//! recipient with an `ack` whose `ack_id` echoes it. Everything else is
//! fire-and-forget.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One frame on the duplex session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Task {
        task: TaskSpec,
        #[serde(default, skip_serializing_if = "is_zero")]
        ts: i64,
    },
    TasksBatch {
        tasks: Vec<TaskSpec>,
        #[serde(default, skip_serializing_if = "is_zero")]
        ts: i64,
    },
    CancelTask {
        task_id: String,
        #[serde(default, skip_serializing_if = "is_zero")]
        ts: i64,
    },
    CancelTasksBatch {
        task_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "is_zero")]
        ts: i64,
    },
    Heartbeat {
        payload: HeartbeatBody,
        #[serde(default, skip_serializing_if = "is_zero")]
        ts: i64,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        task_id: String,
        logs: Vec<LogEntry>,
        #[serde(default, skip_serializing_if = "is_zero")]
        ts: i64,
    },
    TaskResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        task_id: String,
        result: TaskResult,
        #[serde(default, skip_serializing_if = "is_zero")]
        ts: i64,
    },
    Ack {
        ack_id: String,
    },
    Control {
        payload: ControlBody,
    },
    Upgrade {
        payload: UpgradeBody,
    },
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Frame {
    /// Reliable frames require an ack from the recipient.
    pub fn is_reliable(&self) -> bool {
        matches!(self, Frame::Log { .. } | Frame::TaskResult { .. })
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Frame::Log { message_id, .. } | Frame::TaskResult { message_id, .. } => {
                message_id.as_deref()
            }
            _ => None,
        }
    }

    /// Assigns a message id to a reliable frame that does not have one yet.
    pub fn ensure_message_id(&mut self) {
        match self {
            Frame::Log { message_id, .. } | Frame::TaskResult { message_id, .. } => {
                if message_id.is_none() {
                    *message_id = Some(Uuid::new_v4().to_string());
                }
            }
            _ => {}
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Frame::Task { task, .. } => Some(&task.id),
            Frame::CancelTask { task_id, .. }
            | Frame::Log { task_id, .. }
            | Frame::TaskResult { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Task { .. } => "task",
            Frame::TasksBatch { .. } => "tasks_batch",
            Frame::CancelTask { .. } => "cancel_task",
            Frame::CancelTasksBatch { .. } => "cancel_tasks_batch",
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::Log { .. } => "log",
            Frame::TaskResult { .. } => "task_result",
            Frame::Ack { .. } => "ack",
            Frame::Control { .. } => "control",
            Frame::Upgrade { .. } => "upgrade",
        }
    }

    pub fn ack(message_id: impl Into<String>) -> Self {
        Frame::Ack {
            ack_id: message_id.into(),
        }
    }
}

/// Task categories supported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Script,
    FileTransfer,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Script => "script",
            TaskType::FileTransfer => "file_transfer",
        }
    }
}

/// A task as dispatched by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_sec: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub work_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_as: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_transfer: Option<FileTransferSpec>,
}

/// Artifact download: agent pulls `download_url` and writes `remote_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferSpec {
    pub remote_path: String,
    pub download_url: String,
    /// Bandwidth cap in MB/s, 0 means unlimited.
    #[serde(default)]
    pub bandwidth_limit: u64,
    /// Optional sha256 hex digest of the artifact.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub auth_headers: HashMap<String, String>,
}

/// Terminal status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Execution outcome reported back to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,
    #[serde(default)]
    pub log_size: u64,
    /// Unix seconds.
    pub started_at: i64,
    pub finished_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    #[serde(default)]
    pub error_code: u32,
}

impl TaskResult {
    pub fn duration_ms(&self) -> i64 {
        if self.started_at > 0 && self.finished_at >= self.started_at {
            (self.finished_at - self.started_at) * 1000
        } else {
            0
        }
    }
}

/// One line of task output, batched on the session and on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
}

/// Static host facts reported at registration and with each heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
}

/// Point-in-time host metrics attached to heartbeats. Composite fields are
/// JSON-encoded by the status stream writer because the bus only accepts
/// flat fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_avg: Vec<f64>,
    #[serde(default)]
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatBody {
    /// Sender's unix-seconds clock; advisory only.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SystemMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlBody {
    pub action: ControlAction,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeBody {
    pub target_version: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
}

// =============================================================================
// Registration (HTTP)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
    #[serde(default)]
    pub host_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
    pub name: String,
    pub status: String,
    pub ws_url: String,
    /// Returned once on first registration; the agent's only credential.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let mut frame = Frame::TaskResult {
            message_id: None,
            task_id: "exec1_step1_7_ab12".into(),
            result: TaskResult {
                task_id: "exec1_step1_7_ab12".into(),
                status: TaskStatus::Success,
                exit_code: 0,
                log: "hello\n".into(),
                log_size: 6,
                started_at: 1,
                finished_at: 2,
                error_msg: String::new(),
                error_code: 0,
            },
            ts: 1234,
        };
        frame.ensure_message_id();
        assert!(frame.message_id().is_some());

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"task_result\""));

        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id(), frame.message_id());
        assert!(back.is_reliable());
    }

    #[test]
    fn test_body_shape_validated_against_type() {
        // A cancel frame with a task body instead of task_id must not decode.
        let bad = r#"{"type":"cancel_task","task":{"id":"t1"}}"#;
        assert!(serde_json::from_str::<Frame>(bad).is_err());

        // Unknown type is rejected outright.
        let unknown = r#"{"type":"telemetry","payload":{}}"#;
        assert!(serde_json::from_str::<Frame>(unknown).is_err());
    }

    #[test]
    fn test_fire_and_forget_has_no_message_id() {
        let mut hb = Frame::Heartbeat {
            payload: HeartbeatBody::default(),
            ts: 0,
        };
        hb.ensure_message_id();
        assert!(hb.message_id().is_none());
        assert!(!hb.is_reliable());
    }

    #[test]
    fn test_task_defaults_to_script() {
        let json = r#"{"type":"task","task":{"id":"t1","command":"echo hi"}}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::Task { task, .. } => {
                assert_eq!(task.task_type, TaskType::Script);
                assert_eq!(task.timeout_sec, 0);
            }
            _ => panic!("expected task frame"),
        }
    }

    #[test]
    fn test_ack_echoes_message_id() {
        let ack = Frame::ack("m-1");
        match &ack {
            Frame::Ack { ack_id } => assert_eq!(ack_id, "m-1"),
            _ => panic!("expected ack"),
        }
        assert!(!ack.is_reliable());
    }
}
