//! File-transfer execution: download an artifact URL into place.
//!
//! Downloads to `<remote_path>.tmp`, optionally verifies a sha256 checksum,
//! then renames into place so a partial download never replaces the target.
//! The byte stream is shaped by a token bucket when a bandwidth limit is
//! set, and the GET is retried a few times before giving up.

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use opsfabric_core::error::FabricError;
use opsfabric_core::protocol::{FileTransferSpec, TaskResult, TaskSpec, TaskStatus};
use opsfabric_core::ratelimit::TokenBucket;

use super::executor::{KillReason, RunningTask};

const DOWNLOAD_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-line callback reused from the script path for progress lines.
pub type LogFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub struct TransferExecutor {
    http: reqwest::Client,
    /// Agent-wide cap in MB/s; 0 means unlimited.
    global_limit_mb_s: u64,
}

impl TransferExecutor {
    pub fn new(http: reqwest::Client, global_limit_mb_s: u64) -> TransferExecutor {
        TransferExecutor {
            http,
            global_limit_mb_s,
        }
    }

    /// Runs a transfer task to completion. Never returns Err: failures
    /// become a failed result carrying the transfer error code.
    pub async fn execute(
        &self,
        task: &TaskSpec,
        running: &Arc<RunningTask>,
        log_fn: LogFn,
    ) -> TaskResult {
        let started_at = chrono::Utc::now().timestamp();

        let Some(spec) = &task.file_transfer else {
            return failed(&task.id, started_at, &FabricError::invalid_param("file_transfer body missing"));
        };
        if spec.download_url.is_empty() {
            return failed(&task.id, started_at, &FabricError::invalid_param("download_url required"));
        }
        if spec.remote_path.is_empty() {
            return failed(&task.id, started_at, &FabricError::invalid_param("remote_path required"));
        }

        let deadline = if task.timeout_sec > 0 {
            Duration::from_secs(task.timeout_sec)
        } else {
            Duration::from_secs(300)
        };

        let run = self.download(spec, running, &log_fn);
        let outcome = tokio::select! {
            outcome = run => outcome,
            _ = tokio::time::sleep(deadline) => Err(FabricError::Network {
                message: "download deadline exceeded".into(),
            }),
        };

        match outcome {
            Ok(written) => {
                let msg = format!(
                    "downloaded {written} bytes from {} to {}",
                    spec.download_url, spec.remote_path
                );
                log_fn(&msg, "stdout");
                let log_size = msg.len() as u64;
                TaskResult {
                    task_id: task.id.clone(),
                    status: TaskStatus::Success,
                    exit_code: 0,
                    log: msg,
                    log_size,
                    started_at,
                    finished_at: chrono::Utc::now().timestamp(),
                    error_msg: String::new(),
                    error_code: 0,
                }
            }
            Err(e) => {
                let mut result = failed(&task.id, started_at, &e);
                if running.kill_reason() == Some(KillReason::Cancelled) {
                    result.status = TaskStatus::Cancelled;
                }
                result
            }
        }
    }

    /// Effective cap: the task limit bounded by the agent-wide limit.
    fn effective_limit_mb_s(&self, spec: &FileTransferSpec) -> u64 {
        let task_limit = spec.bandwidth_limit;
        match (task_limit, self.global_limit_mb_s) {
            (0, global) => global,
            (task, 0) => task,
            (task, global) => task.min(global),
        }
    }

    async fn download(
        &self,
        spec: &FileTransferSpec,
        running: &Arc<RunningTask>,
        log_fn: &LogFn,
    ) -> Result<u64, FabricError> {
        let target = Path::new(&spec.remote_path);
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| FabricError::FileWrite {
                        message: format!("create target dir: {e}"),
                    })?;
            }
        }

        let response = self.get_with_retries(spec).await?;

        let limit_mb_s = self.effective_limit_mb_s(spec);
        let bucket = (limit_mb_s > 0).then(|| TokenBucket::new(limit_mb_s * 1024 * 1024));

        let tmp_path = format!("{}.tmp", spec.remote_path);
        let mut tmp = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| FabricError::FileWrite {
                message: format!("create temp file: {e}"),
            })?;

        let mut written: u64 = 0;
        let mut hasher = if spec.checksum.is_empty() {
            None
        } else {
            Some(Sha256::new())
        };
        let mut stream = response.bytes_stream();

        let copy_result: Result<(), FabricError> = async {
            while let Some(chunk) = next_chunk(&mut stream, &running.cancel).await? {
                if let Some(bucket) = &bucket {
                    tokio::select! {
                        _ = bucket.acquire(chunk.len()) => {}
                        _ = running.cancel.cancelled() => {
                            return Err(FabricError::Network { message: "download cancelled".into() });
                        }
                    }
                }
                tmp.write_all(&chunk).await.map_err(|e| FabricError::FileWrite {
                    message: format!("write temp file: {e}"),
                })?;
                if let Some(hasher) = &mut hasher {
                    hasher.update(&chunk);
                }
                written += chunk.len() as u64;
            }
            Ok(())
        }
        .await;

        if let Err(e) = copy_result {
            drop(tmp);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tmp.flush().await.map_err(|e| FabricError::FileWrite {
            message: format!("flush temp file: {e}"),
        })?;
        drop(tmp);

        if let Some(hasher) = hasher {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(&spec.checksum) {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(FabricError::TransferFailed {
                    message: format!("checksum mismatch: expected {}, got {actual}", spec.checksum),
                });
            }
            log_fn("sha256 checksum verified", "stdout");
        }

        tokio::fs::rename(&tmp_path, &spec.remote_path)
            .await
            .map_err(|e| FabricError::FileWrite {
                message: format!("move into place: {e}"),
            })?;

        Ok(written)
    }

    async fn get_with_retries(&self, spec: &FileTransferSpec) -> Result<reqwest::Response, FabricError> {
        let mut last_err = FabricError::network("download not attempted");
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            let mut request = self.http.get(&spec.download_url);
            for (k, v) in &spec.auth_headers {
                request = request.header(k, v);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    last_err = FabricError::ResponseError {
                        message: format!("download status {}", resp.status().as_u16()),
                    };
                }
                Err(e) => {
                    last_err = FabricError::Network {
                        message: e.to_string(),
                    };
                }
            }
            if attempt < DOWNLOAD_ATTEMPTS {
                warn!(attempt, error = %last_err, "download attempt failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        Err(last_err)
    }
}

async fn next_chunk(
    stream: &mut (impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
    cancel: &CancellationToken,
) -> Result<Option<bytes::Bytes>, FabricError> {
    tokio::select! {
        chunk = stream.next() => match chunk {
            None => Ok(None),
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(FabricError::Network { message: e.to_string() }),
        },
        _ = cancel.cancelled() => Err(FabricError::Network { message: "download cancelled".into() }),
    }
}

fn failed(task_id: &str, started_at: i64, err: &FabricError) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        status: TaskStatus::Failed,
        exit_code: -1,
        log: String::new(),
        log_size: 0,
        started_at,
        finished_at: chrono::Utc::now().timestamp(),
        error_msg: err.to_string(),
        error_code: err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn transfer_task(spec: FileTransferSpec) -> TaskSpec {
        TaskSpec {
            id: "exec1_step1_1_ft".into(),
            name: "xfer".into(),
            task_type: opsfabric_core::protocol::TaskType::FileTransfer,
            command: String::new(),
            script_type: String::new(),
            args: vec![],
            env: HashMap::new(),
            timeout_sec: 5,
            work_dir: String::new(),
            run_as: String::new(),
            file_transfer: Some(spec),
        }
    }

    #[test]
    fn test_effective_limit_caps_at_global() {
        let exec = TransferExecutor::new(reqwest::Client::new(), 10);
        let mut spec = FileTransferSpec {
            remote_path: "/tmp/x".into(),
            download_url: "https://example/x".into(),
            bandwidth_limit: 50,
            checksum: String::new(),
            auth_headers: HashMap::new(),
        };
        assert_eq!(exec.effective_limit_mb_s(&spec), 10);
        spec.bandwidth_limit = 4;
        assert_eq!(exec.effective_limit_mb_s(&spec), 4);
        spec.bandwidth_limit = 0;
        assert_eq!(exec.effective_limit_mb_s(&spec), 10);

        let unlimited = TransferExecutor::new(reqwest::Client::new(), 0);
        assert_eq!(unlimited.effective_limit_mb_s(&spec), 0);
    }

    #[tokio::test]
    async fn test_missing_body_fails_with_invalid_param() {
        let exec = TransferExecutor::new(reqwest::Client::new(), 0);
        let running = RunningTask::new("t".into());
        let log_fn: LogFn = Arc::new(|_, _| {});

        let mut task = transfer_task(FileTransferSpec {
            remote_path: String::new(),
            download_url: String::new(),
            bandwidth_limit: 0,
            checksum: String::new(),
            auth_headers: HashMap::new(),
        });
        task.file_transfer = None;

        let result = exec.execute(&task, &running, log_fn).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_code, 1002);
    }

    #[tokio::test]
    async fn test_unreachable_url_yields_network_error() {
        let exec = TransferExecutor::new(reqwest::Client::new(), 0);
        let running = RunningTask::new("t".into());
        let log_fn: LogFn = Arc::new(|_, _| {});

        let dir = tempfile::tempdir().unwrap();
        let task = transfer_task(FileTransferSpec {
            remote_path: dir.path().join("artifact").to_string_lossy().into_owned(),
            // Reserved port on localhost: connection refused immediately.
            download_url: "http://127.0.0.1:1/artifact".into(),
            bandwidth_limit: 0,
            checksum: String::new(),
            auth_headers: HashMap::new(),
        });

        let result = exec.execute(&task, &running, log_fn).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_code >= 2000 && result.error_code < 3000);
    }
}
