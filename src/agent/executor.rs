//! Process execution for script tasks.
//!
//! Spawns the planned invocation, streams stdout/stderr line-by-line into
//! the log callback while accumulating the full log for the result, and
//! enforces per-task timeouts and cancellation. Interrupt is attempted
//! before kill so well-behaved scripts can clean up.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use opsfabric_core::error::FabricError;
use opsfabric_core::protocol::{TaskResult, TaskSpec, TaskStatus};

use super::script;

const LOG_BUFFER_CAP: usize = 512 * 1024;
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);

/// Why a run was torn down before the process finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    Cancelled,
    TimedOut,
}

/// Tracking entry for one in-flight execution. Exists for the whole run,
/// removed on completion regardless of status.
pub struct RunningTask {
    pub task_id: String,
    pub started_at: Instant,
    pub cancel: CancellationToken,
    kill_reason: parking_lot::Mutex<Option<KillReason>>,
}

impl RunningTask {
    pub fn new(task_id: String) -> Arc<RunningTask> {
        Arc::new(RunningTask {
            task_id,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            kill_reason: parking_lot::Mutex::new(None),
        })
    }

    /// Records why the task is being torn down and fires its token. The
    /// first reason wins so a timeout arriving after a cancel (or vice
    /// versa) keeps the original label.
    pub fn kill(&self, reason: KillReason) {
        let mut slot = self.kill_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn kill_reason(&self) -> Option<KillReason> {
        *self.kill_reason.lock()
    }
}

/// Per-line callback: (line, stream).
pub type LogFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub struct ProcessExecutor {
    temp_dir: std::path::PathBuf,
}

impl ProcessExecutor {
    pub fn new(temp_dir: std::path::PathBuf) -> ProcessExecutor {
        ProcessExecutor { temp_dir }
    }

    /// Runs a script task to completion and builds its result. Never
    /// returns Err: every failure becomes a failed result with an error
    /// code.
    pub async fn execute(
        &self,
        task: &TaskSpec,
        running: &Arc<RunningTask>,
        log_fn: LogFn,
    ) -> TaskResult {
        let started_at = chrono::Utc::now().timestamp();

        let invocation = match script::plan_invocation(task, &self.temp_dir) {
            Ok(inv) => inv,
            Err(e) => return failed_result(&task.id, started_at, &e),
        };

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &task.env {
            command.env(k, v);
        }
        if !task.work_dir.is_empty() {
            command.current_dir(&task.work_dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = if e.kind() == std::io::ErrorKind::NotFound {
                    FabricError::CommandNotFound {
                        command: invocation.program.clone(),
                    }
                } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                    FabricError::PermissionDenied {
                        message: e.to_string(),
                    }
                } else {
                    FabricError::ExecutionFailed {
                        message: e.to_string(),
                    }
                };
                return failed_result(&task.id, started_at, &err);
            }
        };

        let buffer = Arc::new(parking_lot::Mutex::new(String::new()));
        let stdout_reader = child.stdout.take().map(|out| {
            spawn_line_reader(out, "stdout", Arc::clone(&buffer), Arc::clone(&log_fn))
        });
        let stderr_reader = child.stderr.take().map(|err| {
            spawn_line_reader(err, "stderr", Arc::clone(&buffer), Arc::clone(&log_fn))
        });

        let outcome = self
            .wait_for_exit(&mut child, task.timeout_sec, running)
            .await;

        if let Some(handle) = stdout_reader {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_reader {
            let _ = handle.await;
        }
        // Keeps the temp script alive until the process is done.
        drop(invocation);

        let finished_at = chrono::Utc::now().timestamp();
        let log = buffer.lock().clone();
        let log_size = log.len() as u64;

        let mut result = TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Failed,
            exit_code: -1,
            log,
            log_size,
            started_at,
            finished_at,
            error_msg: String::new(),
            error_code: 0,
        };

        match outcome {
            ExitOutcome::Completed(code) => {
                result.exit_code = code;
                if code == 0 {
                    result.status = TaskStatus::Success;
                } else {
                    let err = FabricError::ExitCodeNonZero { code };
                    result.error_msg = err.to_string();
                    result.error_code = err.code();
                }
            }
            ExitOutcome::Killed(KillReason::Cancelled) => {
                result.status = TaskStatus::Cancelled;
                result.error_msg = "task cancelled".into();
                result.error_code = FabricError::ProcessKilled.code();
            }
            ExitOutcome::Killed(KillReason::TimedOut) => {
                result.error_msg = "task timed out".into();
                result.error_code = FabricError::ProcessKilled.code();
            }
            ExitOutcome::WaitFailed(message) => {
                result.error_msg = message;
                result.error_code = FabricError::ExecutionFailed {
                    message: String::new(),
                }
                .code();
            }
        }
        result
    }

    async fn wait_for_exit(
        &self,
        child: &mut Child,
        timeout_sec: u64,
        running: &Arc<RunningTask>,
    ) -> ExitOutcome {
        // No per-task timeout means "effectively forever"; the global
        // monitor still bounds the run.
        let deadline = if timeout_sec > 0 {
            Duration::from_secs(timeout_sec)
        } else {
            Duration::from_secs(365 * 24 * 3600)
        };
        let timeout_fut = tokio::time::sleep(deadline);
        tokio::pin!(timeout_fut);

        let interrupted = tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => ExitOutcome::Completed(status.code().unwrap_or(-1)),
                    Err(e) => ExitOutcome::WaitFailed(e.to_string()),
                };
            }
            _ = running.cancel.cancelled() => {
                running.kill_reason().unwrap_or(KillReason::Cancelled)
            }
            _ = &mut timeout_fut => KillReason::TimedOut,
        };

        debug!(task_id = %running.task_id, reason = ?interrupted, "terminating task process");
        terminate(child).await;
        let _ = child.wait().await;
        ExitOutcome::Killed(interrupted)
    }
}

enum ExitOutcome {
    Completed(i32),
    Killed(KillReason),
    WaitFailed(String),
}

/// Interrupt first, kill after a short grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = Command::new("kill")
            .args(["-INT", &pid.to_string()])
            .status()
            .await;
        tokio::time::sleep(INTERRUPT_GRACE).await;
        if child.try_wait().ok().flatten().is_some() {
            return;
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "kill failed, process may already be gone");
    }
}

fn spawn_line_reader<R>(
    pipe: R,
    stream: &'static str,
    buffer: Arc<parking_lot::Mutex<String>>,
    log_fn: LogFn,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            {
                let mut buf = buffer.lock();
                if buf.len() < LOG_BUFFER_CAP {
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
            if !line.is_empty() {
                log_fn(&line, stream);
            }
        }
    })
}

fn failed_result(task_id: &str, started_at: i64, err: &FabricError) -> TaskResult {
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

    fn task(command: &str) -> TaskSpec {
        TaskSpec {
            id: "exec1_step1_1_t".into(),
            name: "test".into(),
            task_type: Default::default(),
            command: command.into(),
            script_type: String::new(),
            args: vec![],
            env: HashMap::new(),
            timeout_sec: 0,
            work_dir: String::new(),
            run_as: String::new(),
            file_transfer: None,
        }
    }

    fn collect_logs() -> (LogFn, Arc<parking_lot::Mutex<Vec<String>>>) {
        let lines = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let log_fn: LogFn = Arc::new(move |line: &str, _stream: &str| {
            sink.lock().push(line.to_string());
        });
        (log_fn, lines)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_success() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let running = RunningTask::new("exec1_step1_1_t".into());
        let (log_fn, lines) = collect_logs();

        let result = executor.execute(&task("echo hello"), &running, log_fn).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert!(result.log.contains("hello"));
        assert_eq!(lines.lock().as_slice(), ["hello"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_maps_error_code() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let running = RunningTask::new("t".into());
        let (log_fn, _) = collect_logs();

        let result = executor.execute(&task("exit 3"), &running, log_fn).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.error_code, 3005);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let running = RunningTask::new("t".into());
        let (log_fn, _) = collect_logs();

        let mut spec = task("sleep 30");
        spec.timeout_sec = 1;
        let started = Instant::now();
        let result = executor.execute(&spec, &running, log_fn).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_code, 3004);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_yields_cancelled_status() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let running = RunningTask::new("t".into());
        let (log_fn, _) = collect_logs();

        let kill_handle = Arc::clone(&running);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            kill_handle.kill(KillReason::Cancelled);
        });

        let result = executor.execute(&task("sleep 30"), &running, log_fn).await;
        assert_eq!(result.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new(dir.path().to_path_buf());
        let running = RunningTask::new("t".into());
        let (log_fn, _) = collect_logs();

        let mut spec = task("");
        spec.args = vec!["definitely-not-a-real-binary-3141".into()];
        let result = executor.execute(&spec, &running, log_fn).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error_code, 3001);
    }
}
