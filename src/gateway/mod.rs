//! Axum HTTP gateway: chat APIs, Meta webhook ingestion, health.
//!
//! Body limits and a whole-request timeout are mounted on every route. The
//! webhook POST handler only verifies, parses and enqueues — the relay
//! state machine runs in a dedicated worker task fed by an mpsc queue, so
//! the platform always gets its 2xx acknowledgement promptly.

mod handlers;
mod signature;
mod webhook;

pub use signature::{constant_time_eq, verify_meta_signature};
pub use webhook::parse_envelope;

use crate::config::Config;
use crate::dedup::DedupWindow;
use crate::delivery::{DeliveryGateway, MetaDelivery};
use crate::error::RelayError;
use crate::inference::{HttpInferenceClient, InferenceGateway};
use crate::relay::{RelayConfig, RelayEngine};
use crate::store::{Store, TenantStore};
use anyhow::Result;
use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use handlers::{
    handle_chat, handle_health, handle_public_chat, handle_webhook_event, handle_webhook_verify,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
    pub tenants: TenantStore,
    pub verify_token: Arc<str>,
    pub app_secret: Option<Arc<str>>,
    pub events: mpsc::Sender<serde_json::Value>,
}

/// Tenant-authenticated chat request body.
#[derive(serde::Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ApiMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub customer_identifier: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

/// Public chat request body.
#[derive(serde::Deserialize)]
pub struct PublicChatRequest {
    pub message: String,
    #[serde(default)]
    pub customer_identifier: Option<String>,
}

/// Meta verification query params.
#[derive(serde::Deserialize)]
pub struct MetaVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Assemble the router with body-limit and timeout layers.
pub fn router(state: AppState, max_body_bytes: usize, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/chat", post(handle_chat))
        .route("/public/chat/{tenant_id}", post(handle_public_chat))
        .route("/webhooks/meta", get(handle_webhook_verify))
        .route("/webhooks/meta", post(handle_webhook_event))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Drain the webhook queue: dedup on the platform message id, then run the
/// relay. The `seen` gate wraps the whole state machine, so a platform
/// retry never re-debits or re-replies. Failures here have no caller to
/// answer — they are logged and the event is dropped (fail-silent is the
/// platform norm; refunds have already happened inside the engine).
pub fn spawn_webhook_worker(
    engine: Arc<RelayEngine>,
    dedup: Arc<DedupWindow>,
    mut events: mpsc::Receiver<serde_json::Value>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = events.recv().await {
            for event in parse_envelope(&payload) {
                if dedup.seen(&event.message_id) {
                    tracing::debug!(message_id = %event.message_id, "duplicate webhook delivery dropped");
                    continue;
                }

                match engine.handle_inbound(&event).await {
                    Ok(outcome) => {
                        tracing::info!(
                            platform = event.platform.as_str(),
                            sender = %event.sender_id,
                            remaining_balance = outcome.remaining_balance,
                            "webhook exchange delivered"
                        );
                    }
                    Err(
                        err @ (RelayError::TenantNotFound(_) | RelayError::TenantInactive(_)),
                    ) => {
                        tracing::info!("webhook event dropped: {err}");
                    }
                    Err(err) => {
                        tracing::warn!("webhook exchange failed: {err}");
                    }
                }
            }
        }
    })
}

/// Bind and serve.
pub async fn run_gateway(config: &Config) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    run_gateway_with_listener(listener, config).await
}

/// Serve from a pre-bound listener (tests bind port 0 and pass it in).
pub async fn run_gateway_with_listener(
    listener: tokio::net::TcpListener,
    config: &Config,
) -> Result<()> {
    let store = Store::open(&config.database.url).await?;

    let inference: Arc<dyn InferenceGateway> = Arc::new(HttpInferenceClient::new(
        &config.inference.base_url,
        Duration::from_secs(config.inference.timeout_secs),
        config.inference.temperature,
    ));
    let delivery: Arc<dyn DeliveryGateway> = Arc::new(MetaDelivery::new(
        &config.meta.graph_base_url,
        Duration::from_secs(config.meta.send_timeout_secs),
    ));

    let engine = Arc::new(RelayEngine::new(
        store.tenants(),
        store.credits(),
        store.conversations(),
        store.leads(),
        inference,
        delivery,
        RelayConfig {
            chat_cost: config.credits.chat_cost,
            window_limit: config.memory.window_limit,
            default_model: config.inference.default_model.clone(),
        },
    ));

    let dedup = DedupWindow::new(Duration::from_secs(config.dedup.ttl_secs));
    let _sweeper = dedup.spawn_sweeper(Duration::from_secs(config.dedup.sweep_interval_secs));

    let (events_tx, events_rx) = mpsc::channel(256);
    let _worker = spawn_webhook_worker(Arc::clone(&engine), Arc::clone(&dedup), events_rx);

    let state = AppState {
        engine,
        tenants: store.tenants(),
        verify_token: Arc::from(config.meta.verify_token.as_str()),
        app_secret: config.meta.app_secret.as_deref().map(Arc::from),
        events: events_tx,
    };

    tracing::info!("listening on {}", listener.local_addr()?);
    if state.app_secret.is_some() {
        tracing::info!("webhook signature verification enabled");
    }

    let app = router(
        state,
        config.server.max_body_bytes,
        Duration::from_secs(config.server.request_timeout_secs),
    );
    axum::serve(listener, app).await?;

    Ok(())
}
