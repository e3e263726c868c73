//! Axum-based HTTP control plane.
//!
//! Two endpoints, both behind a pre-shared `X-API-Key`:
//! - `POST /chat`: one-shot generation, response returned to the caller.
//! - `POST /notify`: generate a notification body and hand its delivery to
//!   the chat run-loop. The HTTP response does not wait for delivery; the
//!   dispatched action logs its own failure.
//!
//! Request hardening per the usual gateway posture: body size limit and a
//! request timeout.

use crate::channels::Channel;
use crate::dispatch::Dispatcher;
use crate::generator::Generator;
use crate::providers::ChatMessage;
use crate::util::{constant_time_eq, truncate_with_ellipsis};
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB) — prevents memory exhaustion.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s) — prevents slow-loris attacks.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Appended to the persona prompt on the notification path so the model
/// emits only the notification body.
const NOTIFY_TASK_INSTRUCTION: &str = "Using only the information below, write the body of the \
     notification message. Do not include any other text such as greetings or commentary.";

/// Shared state for all gateway handlers.
#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<Generator>,
    pub chat: Arc<dyn Channel>,
    pub dispatcher: Dispatcher,
    pub api_key: Arc<str>,
    pub system_prompt: Arc<str>,
    pub default_notify_channel_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct NotifyBody {
    pub prompt: String,
    pub channel_id: Option<u64>,
}

/// Json extractor that reports every body rejection as 422 with the parse
/// error in the payload, instead of axum's 400/422 split.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(AppJson(value)),
            Err(rejection) => {
                tracing::warn!("Request body rejected: {}", rejection.body_text());
                Err((
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(serde_json::json!({"error": rejection.body_text()})),
                ))
            }
        }
    }
}

/// Verify the pre-shared credential. Comparison is constant-time.
fn require_api_key(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    let presented = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if constant_time_eq(presented, &state.api_key) {
        Ok(())
    } else {
        tracing::warn!("Rejected request with invalid API key");
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid API key"})),
        ))
    }
}

/// POST /chat: one-shot generation for the HTTP caller.
async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: AppJson<ChatBody>,
) -> Response {
    if let Err(e) = require_api_key(&state, &headers) {
        return e.into_response();
    }
    let AppJson(body) = body;

    tracing::info!("/chat: {}", truncate_with_ellipsis(&body.message, 80));

    let history = [ChatMessage::user(body.message)];
    match state.generator.generate(&history, &state.system_prompt).await {
        Ok(text) => Json(serde_json::json!({"response": text})).into_response(),
        Err(e) => {
            tracing::error!("/chat generation failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// POST /notify: generate a notification body, then schedule its delivery
/// on the chat run-loop. Generation happens before the target channel is
/// resolved; a missing channel wastes the generated text, not the caller's
/// intent to be told about it.
async fn handle_notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: AppJson<NotifyBody>,
) -> Response {
    if let Err(e) = require_api_key(&state, &headers) {
        return e.into_response();
    }
    let AppJson(body) = body;

    tracing::info!("/notify: {}", truncate_with_ellipsis(&body.prompt, 80));

    let system_prompt = format!("{}\n\n{}", state.system_prompt, NOTIFY_TASK_INSTRUCTION);
    let history = [ChatMessage::user(body.prompt)];

    let text = match state.generator.generate(&history, &system_prompt).await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("/notify generation failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let Some(channel_id) = body.channel_id.or(state.default_notify_channel_id) else {
        tracing::error!("/notify request without channel_id and no default configured");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Channel ID is not configured"})),
        )
            .into_response();
    };
    let channel_id = channel_id.to_string();

    match state.chat.get_channel(&channel_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::error!("/notify target channel not found: {channel_id}");
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": format!("Channel with ID {channel_id} not found")})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("/notify channel lookup failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    }

    // Delivery must happen on the chat run-loop, never from this handler.
    let chat = Arc::clone(&state.chat);
    let target = channel_id.clone();
    let scheduled = state.dispatcher.schedule(move || async move {
        if let Err(e) = chat.send(&target, &text).await {
            tracing::error!("Notification delivery to channel {target} failed: {e}");
            return Err(e);
        }
        Ok(())
    });

    match scheduled {
        Ok(_handle) => {
            // Fire-and-forget: scheduling succeeded, delivery is the loop's
            // business now.
            tracing::info!("Notification scheduled for channel {channel_id}");
            Json(serde_json::json!({"status": "ok"})).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to schedule notification: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(handle_chat))
        .route("/notify", post(handle_notify))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Run the HTTP gateway.
pub async fn run_gateway(host: &str, port: u16, state: AppState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
