//! HTTP server: health probe and Telegram webhook receiver (single port).

use crate::channels::{PlatformConnection, TelegramConnection, TelegramUpdate};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

#[derive(Clone)]
pub struct ServerState {
    pub telegram: Arc<TelegramConnection>,
    pub discord: Arc<dyn PlatformConnection>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/telegram/webhook", post(telegram_webhook))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("reading server address")?;
    log::info!("server: listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server exited")?;
    log::info!("server: stopped");
    Ok(())
}

/// GET / returns connection states (for probes).
async fn health_http(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "connections": {
            "telegram": state.telegram.state(),
            "discord": state.discord.state(),
        }
    }))
}

/// POST /telegram/webhook: verifies the optional secret, hands the update to the Telegram stream.
async fn telegram_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(webhook) = state.telegram.webhook() else {
        return StatusCode::NOT_FOUND;
    };
    if let Some(ref expected) = webhook.secret {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN;
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    if state.telegram.deliver_update(update).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
