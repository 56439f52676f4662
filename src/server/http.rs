//! Control-plane HTTP surface.
//!
//! JSON endpoints for registration, dispatch, cancel, control, upgrade and
//! metrics, with optional HMAC request signing on the control-plane group.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use opsfabric_core::auth::verify_signature;
use opsfabric_core::error::FabricError;
use opsfabric_core::protocol::{
    ControlAction, ControlBody, Frame, RegisterRequest, RegisterResponse, TaskSpec, UpgradeBody,
};

use super::dispatch::CancelOutcome;
use super::ServerState;
use crate::agent::control::{run_service_action, upgrade_and_restart, SERVER_SERVICE};

pub fn router(state: Arc<ServerState>) -> Router {
    // Registration and the session endpoint are agent ingress; everything
    // else is control-plane ingress behind the optional signature check.
    let control_plane = Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:id", get(get_agent))
        .route("/api/agents/:id/tasks", post(push_task))
        .route("/api/agents/:id/tasks/batch", post(push_tasks_batch))
        .route("/api/agents/:id/tasks/:task_id/cancel", post(cancel_task))
        .route("/api/agents/:id/tasks/cancel/batch", post(cancel_tasks_batch))
        .route("/api/agents/:id/control", post(agent_control))
        .route("/api/agents/:id/upgrade", post(agent_upgrade))
        .route("/api/self/control", post(self_control))
        .route("/api/self/upgrade", post(self_upgrade))
        .route("/api/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_signature,
        ));

    Router::new()
        .route("/api/agents/register", post(register))
        .route("/ws/agent/:id", get(super::ws::ws_handler))
        .merge(control_plane)
        .with_state(state)
}

fn error_response(status: StatusCode, code: u32, message: String) -> Response {
    (status, Json(json!({ "code": code, "error": message }))).into_response()
}

fn err_of(status: StatusCode, e: &FabricError) -> Response {
    error_response(status, e.code(), e.to_string())
}

// =============================================================================
// Signature middleware
// =============================================================================

async fn require_signature(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let auth = &state.cfg.auth;
    if !auth.require_signature || auth.shared_secret.is_empty() {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let timestamp = header_string(&parts.headers, "x-timestamp");
    let signature = header_string(&parts.headers, "x-signature");

    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::FORBIDDEN, 1002, "failed to read body".into());
        }
    };

    let verdict = verify_signature(
        &auth.shared_secret,
        parts.method.as_str(),
        parts.uri.path(),
        &timestamp,
        &bytes,
        &signature,
        auth.clock_skew_sec,
        chrono::Utc::now().timestamp(),
    );
    if let Err(e) = verdict {
        return err_of(StatusCode::FORBIDDEN, &e);
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

fn header_string(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// =============================================================================
// Registration
// =============================================================================

async fn register(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(mut req): Json<RegisterRequest>,
) -> Response {
    // Token may come in the body or as a bearer header.
    if req.token.trim().is_empty() {
        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            let trimmed = auth.trim();
            req.token = trimmed
                .strip_prefix("Bearer ")
                .or_else(|| trimmed.strip_prefix("bearer "))
                .unwrap_or(trimmed)
                .trim()
                .to_string();
        }
    }
    let first_registration = req.token.is_empty();

    let record = match state.registry.register(&req) {
        Ok(record) => record,
        Err(e @ FabricError::ResourceLimit { .. }) => {
            return err_of(StatusCode::SERVICE_UNAVAILABLE, &e);
        }
        Err(e) => return err_of(StatusCode::INTERNAL_SERVER_ERROR, &e),
    };

    state
        .push_status(&record, "online", Some("registered"), None)
        .await;

    let ws_url = format!(
        "ws://{}:{}/ws/agent/{}",
        state.cfg.server.host, state.cfg.server.port, record.id
    );
    Json(RegisterResponse {
        id: record.id.clone(),
        name: record.name(),
        status: record.status().as_str().to_string(),
        ws_url,
        // The generated credential is handed out exactly once.
        token: if first_registration {
            record.token.clone()
        } else {
            String::new()
        },
    })
    .into_response()
}

// =============================================================================
// Listing and metrics
// =============================================================================

async fn list_agents(State(state): State<Arc<ServerState>>) -> Response {
    let agents: Vec<_> = state
        .registry
        .list()
        .into_iter()
        .map(|r| {
            json!({
                "id": r.id,
                "name": r.name(),
                "status": r.status().as_str(),
                "last_heartbeat": r.last_heartbeat().timestamp_millis(),
            })
        })
        .collect();
    Json(json!({ "agents": agents })).into_response()
}

async fn get_agent(State(state): State<Arc<ServerState>>, Path(id): Path<String>) -> Response {
    let Some(record) = state.registry.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, 1003, "agent not found".into());
    };
    Json(json!({
        "id": record.id,
        "name": record.name(),
        "status": record.status().as_str(),
        "last_heartbeat": record.last_heartbeat().timestamp_millis(),
        "labels": record.labels(),
        "system": record.system(),
        "running_tasks": record.running_tasks(),
    }))
    .into_response()
}

async fn metrics(State(state): State<Arc<ServerState>>) -> Response {
    let agents = state.registry.list();
    let timeout = state.registry.heartbeat_timeout();
    let online = agents.iter().filter(|a| a.is_alive(timeout)).count();
    Json(json!({
        "agents_total": agents.len(),
        "agents_online": online,
        "agents_offline": agents.len() - online,
        "now_unix_ms": chrono::Utc::now().timestamp_millis(),
    }))
    .into_response()
}

// =============================================================================
// Dispatch and cancel
// =============================================================================

async fn push_task(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(task): Json<TaskSpec>,
) -> Response {
    if task.id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, 1002, "task id required".into());
    }
    let task_id = task.id.clone();
    match state.dispatcher.dispatch(&id, task).await {
        Ok(_outcome) => Json(json!({
            "task_id": task_id,
            "agent_id": id,
            "status": "dispatched",
        }))
        .into_response(),
        Err(e) => err_of(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn push_tasks_batch(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(tasks): Json<Vec<TaskSpec>>,
) -> Response {
    if tasks.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, 1002, "tasks array is empty".into());
    }
    let Some(record) = state.registry.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, 1003, "agent not found".into());
    };

    // Same contract as single dispatch, applied per entry: persist first,
    // then one batch frame over the live session.
    for task in &tasks {
        if let Err(e) = state
            .dispatcher
            .pending_store()
            .save_pending(&id, task, state.cfg.pending.max_retries)
            .await
        {
            warn!(agent_id = %id, task_id = %task.id, error = %e, "pending persist failed for batch entry");
        }
    }

    let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let delivered = record
        .send_frame(Frame::TasksBatch {
            tasks: tasks.clone(),
            ts: chrono::Utc::now().timestamp_millis(),
        })
        .is_ok();
    if delivered {
        for task_id in &task_ids {
            record.add_running_task(task_id);
        }
    }
    info!(agent_id = %id, count = task_ids.len(), delivered, "batch tasks accepted");

    Json(json!({
        "task_ids": task_ids,
        "agent_id": id,
        "status": "dispatched",
        "count": task_ids.len(),
    }))
    .into_response()
}

async fn cancel_task(
    State(state): State<Arc<ServerState>>,
    Path((id, task_id)): Path<(String, String)>,
) -> Response {
    match state.dispatcher.cancel(&id, &task_id).await {
        CancelOutcome::SentToSession => Json(json!({
            "task_id": task_id,
            "agent_id": id,
            "status": "cancelled",
            "source": "websocket",
        }))
        .into_response(),
        CancelOutcome::RemovedFromPending => Json(json!({
            "task_id": task_id,
            "agent_id": id,
            "status": "cancelled",
            "source": "pending_store",
        }))
        .into_response(),
        CancelOutcome::NotFound => {
            error_response(StatusCode::NOT_FOUND, 1003, "agent and pending task not found".into())
        }
        CancelOutcome::Inactive => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            2001,
            "agent inactive and task not in pending store".into(),
        ),
    }
}

#[derive(serde::Deserialize)]
struct CancelBatchRequest {
    task_ids: Vec<String>,
}

async fn cancel_tasks_batch(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(req): Json<CancelBatchRequest>,
) -> Response {
    if req.task_ids.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, 1002, "task_ids array is empty".into());
    }
    if state.registry.get(&id).is_none() {
        return error_response(StatusCode::NOT_FOUND, 1003, "agent not found".into());
    }

    let mut results = Vec::with_capacity(req.task_ids.len());
    let mut success = 0usize;
    let mut failed = 0usize;
    for task_id in &req.task_ids {
        match state.dispatcher.cancel(&id, task_id).await {
            CancelOutcome::SentToSession => {
                success += 1;
                results.push(json!({"task_id": task_id, "status": "cancelled", "source": "websocket"}));
            }
            CancelOutcome::RemovedFromPending => {
                success += 1;
                results.push(json!({"task_id": task_id, "status": "cancelled", "source": "pending_store"}));
            }
            _ => {
                failed += 1;
                results.push(json!({"task_id": task_id, "status": "failed"}));
            }
        }
    }

    Json(json!({
        "agent_id": id,
        "task_count": req.task_ids.len(),
        "success_count": success,
        "failed_count": failed,
        "results": results,
    }))
    .into_response()
}

// =============================================================================
// Control and upgrade
// =============================================================================

async fn agent_control(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(body): Json<ControlBody>,
) -> Response {
    let Some(record) = state.registry.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, 1003, "agent not found".into());
    };
    if !record.is_session_attached() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, 2001, "agent is not active".into());
    }

    match record.send_frame(Frame::Control { payload: body }) {
        Ok(()) => Json(json!({"message": "control command sent to agent", "status": "success"}))
            .into_response(),
        Err(e) => err_of(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

fn validate_upgrade(body: &UpgradeBody) -> Result<(), String> {
    if body.target_version.trim().is_empty() {
        return Err("target_version is required".into());
    }
    if body.download_url.trim().is_empty() {
        return Err("download_url is required".into());
    }
    if !body.download_url.starts_with("https://") {
        return Err("download_url must be https".into());
    }
    let has_hash = body.sha256_hash.as_deref().is_some_and(|h| !h.is_empty())
        || body.md5_hash.as_deref().is_some_and(|h| !h.is_empty());
    if !has_hash {
        return Err("md5_hash or sha256_hash is required".into());
    }
    Ok(())
}

async fn agent_upgrade(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(body): Json<UpgradeBody>,
) -> Response {
    if let Err(message) = validate_upgrade(&body) {
        return error_response(StatusCode::BAD_REQUEST, 1002, message);
    }
    let Some(record) = state.registry.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, 1003, "agent not found".into());
    };
    if !record.is_session_attached() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, 2001, "agent is not active".into());
    }

    match record.send_frame(Frame::Upgrade { payload: body }) {
        Ok(()) => Json(json!({"message": "upgrade command sent to agent", "status": "success"}))
            .into_response(),
        Err(e) => err_of(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn self_control(Json(body): Json<ControlBody>) -> Response {
    if body.action != ControlAction::Restart {
        return error_response(
            StatusCode::BAD_REQUEST,
            1002,
            "server only supports restart".into(),
        );
    }
    warn!(reason = %body.reason, "server self-restart requested, restarting in 3 seconds");
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        run_service_action(ControlAction::Restart, SERVER_SERVICE).await;
    });
    Json(json!({"message": "server will restart in 3 seconds", "status": "success"})).into_response()
}

async fn self_upgrade(Json(body): Json<UpgradeBody>) -> Response {
    if let Err(message) = validate_upgrade(&body) {
        return error_response(StatusCode::BAD_REQUEST, 1002, message);
    }
    warn!(target_version = %body.target_version, "server self-upgrade requested");
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        upgrade_and_restart(body, reqwest::Client::new(), SERVER_SERVICE).await;
    });
    Json(json!({"message": "server upgrade started, will restart after download", "status": "success"}))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_upgrade_policy() {
        let base = UpgradeBody {
            target_version: "1.0.0".into(),
            download_url: "https://example/bin".into(),
            md5_hash: None,
            sha256_hash: Some("abc".into()),
        };
        assert!(validate_upgrade(&base).is_ok());

        let mut no_https = base.clone();
        no_https.download_url = "http://example/bin".into();
        assert!(validate_upgrade(&no_https).unwrap_err().contains("https"));

        let mut no_hash = base.clone();
        no_hash.sha256_hash = None;
        assert!(validate_upgrade(&no_hash).unwrap_err().contains("hash"));

        let mut md5_only = base.clone();
        md5_only.sha256_hash = None;
        md5_only.md5_hash = Some("d41d8cd9".into());
        assert!(validate_upgrade(&md5_only).is_ok());

        let mut no_version = base;
        no_version.target_version = String::new();
        assert!(validate_upgrade(&no_version).unwrap_err().contains("target_version"));
    }
}
