//! Session ingress: WebSocket upgrade, per-connection tasks, and the
//! inbound frame loop.
//!
//! Each live session runs a writer task (draining the record's outbound
//! channel), a task-queue consumer, a log pipeline, and the read loop
//! below. Reliable frames are deduplicated by message id, applied, then
//! acked; fire-and-forget frames are applied directly.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opsfabric_core::error::FabricError;
use opsfabric_core::protocol::{Frame, HeartbeatBody, TaskResult};

use super::pipeline::LogPipeline;
use super::registry::AgentRecord;
use super::ServerState;

const READ_IDLE_DEADLINE: Duration = Duration::from_secs(60);
const HANDSHAKE_PROTOCOL: &str = "agent-token";

pub async fn ws_handler(
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = extract_token(&headers);

    let record = match state.registry.connect(&agent_id, &token) {
        Ok(record) => record,
        Err(FabricError::NotFound { .. }) => {
            return (StatusCode::NOT_FOUND, "agent not found").into_response();
        }
        Err(FabricError::PermissionDenied { .. }) => {
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        Err(e) => {
            warn!(agent_id, error = %e, "session connect failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "connect failed").into_response();
        }
    };

    ws.protocols([HANDSHAKE_PROTOCOL])
        .on_upgrade(move |socket| handle_session(socket, record, state))
}

/// `Sec-WebSocket-Protocol: agent-token,<token>` arrives as a protocol
/// list; the token is whatever follows the marker entry.
fn extract_token(headers: &HeaderMap) -> String {
    let Some(value) = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    else {
        return String::new();
    };
    match value.split_once(',') {
        Some((marker, token)) if marker.trim() == HANDSHAKE_PROTOCOL => token.trim().to_string(),
        _ => value.trim().to_string(),
    }
}

async fn handle_session(socket: WebSocket, record: Arc<AgentRecord>, state: Arc<ServerState>) {
    let agent_id = record.id.clone();
    info!(agent_id, "session connected");

    let (mut sink, mut source) = socket.split();
    let stop = CancellationToken::new();

    // Outbound writer: everything the server sends goes through the
    // record's outbound channel so HTTP handlers can reach the session.
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<Frame>();
    record.attach_session(outbound_tx);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else { continue };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Task-queue consumer: hands queued tasks to the session; a failed
    // hand-off bumps the pending retry counter.
    let queue_consumer = {
        let record = Arc::clone(&record);
        let state = Arc::clone(&state);
        let stop = stop.clone();
        let mut task_rx = record.take_task_rx();
        tokio::spawn(async move {
            let Some(rx) = task_rx.as_mut() else { return None };
            loop {
                let task = tokio::select! {
                    _ = stop.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };
                let task_id = task.id.clone();
                let frame = Frame::Task {
                    task,
                    ts: chrono::Utc::now().timestamp_millis(),
                };
                if let Err(e) = record.send_frame(frame) {
                    warn!(agent_id = %record.id, task_id, error = %e, "task send failed");
                    if let Err(e) = state
                        .dispatcher
                        .pending_store()
                        .increment_retry(&record.id, &task_id)
                        .await
                    {
                        debug!(task_id, error = %e, "pending retry bump failed");
                    }
                }
            }
            task_rx
        })
    };

    // Log ingest pipeline for this connection.
    let log_pipeline = {
        let state = Arc::clone(&state);
        let record = Arc::clone(&record);
        let stop = stop.clone();
        let mut log_rx = record.take_log_rx();
        tokio::spawn(async move {
            let Some(rx) = log_rx.as_mut() else { return None };
            let pipeline = LogPipeline::new(
                record.id.clone(),
                Arc::clone(&state.log_writer),
                &state.cfg.log_stream,
            );
            pipeline.run(rx, stop).await;
            log_rx
        })
    };

    // Replay anything that was dispatched while the agent was away.
    {
        let dispatcher = Arc::clone(&state.dispatcher);
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.process_pending_for_agent(&agent_id).await {
                warn!(agent_id, error = %e, "pending replay failed");
            }
        });
    }

    // Inbound frame loop.
    loop {
        let next = timeout(READ_IDLE_DEADLINE, source.next()).await;
        let message = match next {
            Err(_) => {
                warn!(agent_id, "session idle deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(agent_id, error = %e, "session read error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<Frame>(text.as_str()) {
                Ok(frame) => handle_frame(&state, &record, frame).await,
                Err(e) => warn!(agent_id, error = %e, "dropped undecodable frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown: one offline status record, final stats, buffered logs.
    stop.cancel();
    record.mark_disconnected();

    if let Ok(Some(rx)) = queue_consumer.await.map(|rx| rx) {
        record.restore_task_rx(rx);
    }
    if let Ok(Some(rx)) = log_pipeline.await.map(|rx| rx) {
        record.restore_log_rx(rx);
    }
    writer.abort();

    state.push_status(&record, "offline", Some("disconnected"), None).await;
    state.stats.on_agent_disconnect(&agent_id).await;
    info!(agent_id, "session disconnected");
}

async fn handle_frame(state: &Arc<ServerState>, record: &Arc<AgentRecord>, frame: Frame) {
    match frame {
        Frame::Heartbeat { payload, .. } => {
            record.update_heartbeat();
            handle_heartbeat(state, record, payload).await;
        }
        Frame::TaskResult {
            message_id,
            task_id,
            result,
            ..
        } => {
            handle_task_result(state, record, message_id, task_id, result).await;
        }
        Frame::Log {
            message_id,
            task_id,
            logs,
            ..
        } => {
            handle_logs(state, record, message_id, task_id, logs).await;
        }
        other => {
            debug!(agent_id = %record.id, kind = other.type_name(), "ignoring unexpected frame");
        }
    }
}

async fn handle_heartbeat(state: &Arc<ServerState>, record: &Arc<AgentRecord>, payload: HeartbeatBody) {
    state
        .push_status(record, "online", None, payload.metrics)
        .await;
}

async fn handle_task_result(
    state: &Arc<ServerState>,
    record: &Arc<AgentRecord>,
    message_id: Option<String>,
    task_id: String,
    result: TaskResult,
) {
    let Some(message_id) = message_id else {
        warn!(agent_id = %record.id, task_id, "task_result missing message_id, dropped");
        return;
    };
    if record.seen.seen(&message_id).await {
        send_ack(record, &message_id);
        return;
    }

    if let Err(e) = state.result_writer.push_result(&record.id, &result).await {
        // No ack: the sender's replay will land once the bus recovers.
        warn!(agent_id = %record.id, task_id, error = %e, "result append failed, waiting for replay");
        return;
    }

    // The task is terminal: settle the pending record so reconnects stay
    // quiet, then stop tracking it as running.
    if let Err(e) = state
        .dispatcher
        .pending_store()
        .mark_acked(&record.id, &task_id)
        .await
    {
        debug!(agent_id = %record.id, task_id, error = %e, "pending ack failed");
    }
    record.remove_running_task(&task_id);

    state
        .stats
        .update(&record.id, result.status, result.duration_ms());
    if state.stats.should_push(&record.id) {
        let stats = Arc::clone(&state.stats);
        let agent_id = record.id.clone();
        tokio::spawn(async move { stats.push(&agent_id).await });
    }

    send_ack(record, &message_id);
}

async fn handle_logs(
    state: &Arc<ServerState>,
    record: &Arc<AgentRecord>,
    message_id: Option<String>,
    task_id: String,
    mut logs: Vec<opsfabric_core::protocol::LogEntry>,
) {
    let Some(message_id) = message_id else {
        warn!(agent_id = %record.id, "log frame missing message_id, dropped");
        return;
    };
    if task_id.is_empty() || logs.is_empty() {
        // Nothing to apply; ack so the sender stops replaying.
        send_ack(record, &message_id);
        return;
    }
    if record.seen.seen(&message_id).await {
        send_ack(record, &message_id);
        return;
    }

    let mut dropped = 0usize;
    for mut entry in logs.drain(..) {
        if entry.task_id.is_empty() {
            entry.task_id = task_id.clone();
        }
        if !record.push_log(entry) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        warn!(agent_id = %record.id, task_id, dropped, "log buffer full, entries dropped");
    }

    // Buffered is durable enough for the session contract.
    send_ack(record, &message_id);
}

fn send_ack(record: &Arc<AgentRecord>, message_id: &str) {
    if let Err(e) = record.send_frame(Frame::ack(message_id)) {
        warn!(agent_id = %record.id, message_id, error = %e, "ack send failed");
    }
}
