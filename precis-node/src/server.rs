//! HTTP routes for peer RPCs and client endpoints.
//!
//! Every handler obtains the node context through the router state. Any
//! inbound peer message refreshes that peer's liveness entry. Client
//! submissions land on the leader directly or are proxied there; a node
//! without a known leader answers 503.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use precis_core::error::Error;
use precis_core::node::{NodeContext, StatusReport};
use precis_core::render;
use precis_core::rpc::{
    ElectionCall, HeartbeatPing, LeaderAnnouncement, OkCall, StepAssignment, StepReply,
    SubmitRequest,
};

pub fn router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        .route("/heartbeat", post(receive_heartbeat))
        .route("/election", post(receive_election))
        .route("/leader", post(receive_leader))
        .route("/ok", post(receive_ok))
        .route("/execute_task", post(execute_task))
        .route("/submit_task", post(submit_task))
        .route("/status", get(status))
        .route("/download/:task_id", get(download))
        .with_state(ctx)
}

async fn receive_heartbeat(
    State(ctx): State<Arc<NodeContext>>,
    Json(ping): Json<HeartbeatPing>,
) -> Json<Value> {
    ctx.liveness.record_seen(ping.node_id);
    Json(json!({"status": "acknowledged"}))
}

async fn receive_election(
    State(ctx): State<Arc<NodeContext>>,
    Json(call): Json<ElectionCall>,
) -> Json<Value> {
    ctx.liveness.record_seen(call.node_id);
    ctx.election.on_election_message(call.node_id, &call.election_id);
    Json(json!({"status": "received"}))
}

async fn receive_leader(
    State(ctx): State<Arc<NodeContext>>,
    Json(announcement): Json<LeaderAnnouncement>,
) -> Json<Value> {
    ctx.liveness.record_seen(announcement.leader_id);
    ctx.election.on_leader_announcement(announcement.leader_id);
    Json(json!({"status": "acknowledged"}))
}

async fn receive_ok(
    State(ctx): State<Arc<NodeContext>>,
    Json(call): Json<OkCall>,
) -> Json<Value> {
    ctx.liveness.record_seen(call.node_id);
    ctx.election.on_ok_message(call.node_id);
    Json(json!({"status": "acknowledged"}))
}

async fn execute_task(
    State(ctx): State<Arc<NodeContext>>,
    Json(assignment): Json<StepAssignment>,
) -> Json<StepReply> {
    Json(ctx.executor.execute(assignment).await)
}

async fn submit_task(
    State(ctx): State<Arc<NodeContext>>,
    Json(request): Json<SubmitRequest>,
) -> (StatusCode, Json<Value>) {
    if ctx.cluster.is_leader() {
        return match ctx.scheduler.submit(request.into()) {
            Ok(task_id) => {
                info!(task = %task_id, "submission accepted");
                (
                    StatusCode::OK,
                    Json(json!({
                        "task_id": task_id,
                        "status": "submitted",
                        "message": format!("Task submitted to leader node {}", ctx.self_id),
                    })),
                )
            }
            Err(Error::QueueFull) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "error", "message": "pending queue is full"})),
            ),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": e.to_string()})),
            ),
        };
    }

    // not the leader: proxy the submission, never queue locally
    let Some(leader) = ctx.cluster.leader() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error", "message": "no leader available"})),
        );
    };
    let Some(addr) = ctx.membership.peer_address(leader) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error", "message": "no leader available"})),
        );
    };
    match ctx.rpc.forward_submission(leader, &addr, &request).await {
        Ok(reply) => (StatusCode::OK, Json(reply)),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "message": format!("failed to forward to leader: {e}"),
            })),
        ),
    }
}

async fn status(State(ctx): State<Arc<NodeContext>>) -> Json<StatusReport> {
    Json(ctx.status())
}

async fn download(
    State(ctx): State<Arc<NodeContext>>,
    Path(task_id): Path<String>,
) -> Response {
    // job ids are short hex strings; anything else cannot name an artifact
    if task_id.is_empty() || !task_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return (StatusCode::NOT_FOUND, "artifact not found").into_response();
    }
    let path = render::artifact_path(&ctx.config.tasks.output_dir, &task_id);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"project_summary_{task_id}.md\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "artifact not found").into_response(),
    }
}
