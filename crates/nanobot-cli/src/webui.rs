use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;

use nanobot_channels::{ChannelRegistry, TelegramChannel, WhatsAppChannel};
use nanobot_config::{config_path, load_config, save_config, Config};
use nanobot_core::AgentLoop;
use nanobot_core::CronService;

/// Everything the API handlers need, shared behind an Arc.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Config,
    pub agent: Arc<AgentLoop>,
    pub cron: Arc<CronService>,
    pub registry: Arc<ChannelRegistry>,
    pub telegram: Option<Arc<TelegramChannel>>,
    pub whatsapp: Option<Arc<WhatsAppChannel>>,
}

/// Serve the gateway HTTP API and the Web UI bundle (SPA fallback).
pub async fn serve(
    state: GatewayState,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let mut router = Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/sessions", get(handle_sessions))
        .route("/api/sessions/{key}", get(handle_session_by_key))
        .route("/api/message", post(handle_message))
        .route("/api/config", get(handle_config_get).put(handle_config_put))
        .route("/api/{*rest}", any(|| async { StatusCode::NOT_FOUND }));

    router = match find_ui_dir() {
        Some(ui_dir) => {
            let spa = ServeDir::new(&ui_dir)
                .fallback(ServeFile::new(ui_dir.join("index.html")));
            router.fallback_service(spa)
        }
        None => router.fallback(|| async { (StatusCode::NOT_FOUND, "Web UI not built") }),
    };
    let router = router.with_state(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Web UI listening on http://{addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn handle_status(State(state): State<GatewayState>) -> Response {
    let mut status = serde_json::json!({
        "workspace": state.config.agents.defaults.workspace,
        "model": state.config.agents.defaults.model,
        "restrictToWorkspace": state.config.tools.restrict_to_workspace,
        "channels": state.registry.enabled_names().await,
        "cron": state.cron.status().await,
    });

    if let Some(telegram) = &state.telegram {
        status["telegram"] = serde_json::to_value(telegram.status().await).unwrap_or_default();
    }
    if let Some(whatsapp) = &state.whatsapp {
        status["whatsapp"] = serde_json::to_value(whatsapp.status().await).unwrap_or_default();
    }

    Json(status).into_response()
}

async fn handle_sessions(State(state): State<GatewayState>) -> Response {
    let sessions = state.agent.sessions().list();
    Json(serde_json::json!({ "sessions": sessions })).into_response()
}

async fn handle_session_by_key(
    State(state): State<GatewayState>,
    Path(key): Path<String>,
) -> Response {
    if key.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let session = state.agent.sessions().get_or_create(&key);
    Json(session).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest {
    #[serde(default)]
    session_key: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    chat_id: String,
}

async fn handle_message(
    State(state): State<GatewayState>,
    Json(mut payload): Json<MessageRequest>,
) -> Response {
    if payload.content.is_empty() {
        return error_response("content is required");
    }
    if payload.session_key.is_empty() {
        payload.session_key = "webui:default".into();
    }
    if payload.channel.is_empty() {
        payload.channel = "webui".into();
    }
    if payload.chat_id.is_empty() {
        payload.chat_id = payload.session_key.clone();
    }

    match state
        .agent
        .process_direct(
            &payload.content,
            &payload.session_key,
            &payload.channel,
            &payload.chat_id,
        )
        .await
    {
        Ok(response) => Json(serde_json::json!({
            "response": response,
            "sessionKey": payload.session_key,
        }))
        .into_response(),
        Err(e) => error_response(&e.to_string()),
    }
}

async fn handle_config_get() -> Response {
    match load_config(&config_path()) {
        Ok(config) => Json(config).into_response(),
        Err(e) => error_response(&e.to_string()),
    }
}

async fn handle_config_put(Json(config): Json<Config>) -> Response {
    if let Err(e) = save_config(&config_path(), &config) {
        return error_response(&e.to_string());
    }
    match load_config(&config_path()) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(&e.to_string()),
    }
}

fn error_response(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Locate the built Web UI bundle next to the executable or the cwd.
fn find_ui_dir() -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            candidates.push(exe_dir.join("webui").join("dist"));
            candidates.push(exe_dir.join("..").join("webui").join("dist"));
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("webui").join("dist"));
    }
    candidates.into_iter().find(|c| c.is_dir())
}
