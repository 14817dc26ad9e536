use crate::error::RelayError;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json},
};

use super::signature::{constant_time_eq, verify_meta_signature};
use super::{AppState, ChatRequest, MetaVerifyQuery, PublicChatRequest};

/// GET /health — always public (no secrets leaked)
pub(super) async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn error_response(err: &RelayError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        RelayError::TenantNotFound(_) => StatusCode::NOT_FOUND,
        RelayError::TenantInactive(_) | RelayError::InsufficientCredit { .. } => {
            StatusCode::FORBIDDEN
        }
        RelayError::InferenceUnavailable(_) | RelayError::DeliveryFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        RelayError::StorageDegraded(_) | RelayError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = serde_json::json!({
        "error": { "kind": err.kind(), "message": err.to_string() }
    });
    (status, Json(body))
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": { "kind": "unauthorized", "message": "valid api key required" }
        })),
    )
}

/// POST /v1/chat — tenant-authenticated chat completion.
///
/// The last `user` message is the new customer message; the server injects
/// its own ledger window, so earlier client-side context is not replayed.
pub(super) async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if bearer.is_empty() {
        return unauthorized();
    }

    let tenant = match state.tenants.find_by_api_key(bearer).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => return unauthorized(),
        Err(error) => return error_response(&RelayError::from(error)),
    };

    let Json(request) = match body {
        Ok(b) => b,
        Err(rejection) => {
            let body = serde_json::json!({
                "error": { "kind": "bad_request", "message": format!("invalid JSON: {rejection}") }
            });
            return (StatusCode::BAD_REQUEST, Json(body));
        }
    };

    let Some(message) = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user" && !m.content.trim().is_empty())
    else {
        let body = serde_json::json!({
            "error": { "kind": "bad_request", "message": "a non-empty user message is required" }
        });
        return (StatusCode::BAD_REQUEST, Json(body));
    };

    let customer_identifier = request.customer_identifier.as_deref().unwrap_or("api");

    match state
        .engine
        .exchange(
            &tenant,
            customer_identifier,
            &message.content,
            request.model.as_deref(),
        )
        .await
    {
        Ok(outcome) => {
            let body = serde_json::json!({
                "reply": outcome.reply,
                "usage": {
                    "debited": outcome.debited,
                    "remaining_balance": outcome.remaining_balance,
                }
            });
            (StatusCode::OK, Json(body))
        }
        Err(err) => {
            tracing::warn!(tenant = %tenant.id, "chat exchange failed: {err}");
            error_response(&err)
        }
    }
}

/// POST /public/chat/{tenant_id} — no login; tenant resolved by path id.
pub(super) async fn handle_public_chat(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    body: Result<Json<PublicChatRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match body {
        Ok(b) => b,
        Err(rejection) => {
            let body = serde_json::json!({
                "error": { "kind": "bad_request", "message": format!("invalid JSON: {rejection}") }
            });
            return (StatusCode::BAD_REQUEST, Json(body));
        }
    };

    if request.message.trim().is_empty() {
        let body = serde_json::json!({
            "error": { "kind": "bad_request", "message": "message must not be empty" }
        });
        return (StatusCode::BAD_REQUEST, Json(body));
    }

    let tenant = match state.tenants.find_by_id(&tenant_id).await {
        Ok(Some(tenant)) => tenant,
        Ok(None) => return error_response(&RelayError::TenantNotFound(tenant_id)),
        Err(error) => return error_response(&RelayError::from(error)),
    };

    let customer_identifier = request
        .customer_identifier
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or("guest");

    match state
        .engine
        .exchange(&tenant, customer_identifier, &request.message, None)
        .await
    {
        Ok(outcome) => {
            let body = serde_json::json!({
                "reply": outcome.reply,
                "remaining_balance": outcome.remaining_balance,
            });
            (StatusCode::OK, Json(body))
        }
        Err(err) => {
            tracing::warn!(tenant = %tenant.id, "public chat exchange failed: {err}");
            error_response(&err)
        }
    }
}

/// GET /webhooks/meta — Meta webhook verification handshake.
pub(super) async fn handle_webhook_verify(
    State(state): State<AppState>,
    Query(params): Query<MetaVerifyQuery>,
) -> impl IntoResponse {
    let token_matches = params
        .verify_token
        .as_deref()
        .is_some_and(|t| constant_time_eq(t, &state.verify_token));

    if params.mode.as_deref() == Some("subscribe") && token_matches {
        if let Some(challenge) = params.challenge {
            tracing::info!("meta webhook verified");
            return (StatusCode::OK, challenge);
        }
        return (StatusCode::BAD_REQUEST, "Missing hub.challenge".to_string());
    }

    tracing::warn!("meta webhook verification failed — token mismatch");
    (StatusCode::FORBIDDEN, "Forbidden".to_string())
}

/// POST /webhooks/meta — inbound events.
///
/// Acknowledges immediately; the envelope is handed to the background
/// worker, which dedups and runs the relay. Meta retries on slow or
/// missing 2xx, so nothing latency-bound happens here.
pub(super) async fn handle_webhook_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(ref app_secret) = state.app_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_meta_signature(app_secret, &body, signature) {
            tracing::warn!(
                "webhook signature verification failed ({})",
                if signature.is_empty() { "missing" } else { "invalid" }
            );
            return (StatusCode::UNAUTHORIZED, "Invalid signature".to_string());
        }
    }

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "Invalid JSON payload".to_string());
    };

    if let Err(error) = state.events.send(payload).await {
        tracing::error!("webhook queue closed, dropping event: {error}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Processing unavailable".to_string(),
        );
    }

    (StatusCode::OK, "EVENT_RECEIVED".to_string())
}
