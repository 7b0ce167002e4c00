use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::normalize::{ChatRequest, normalize};
use crate::relay::{RelayOutcome, channel_sink, relay};
use crate::settings::BackendKind;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn chat_ai(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    match read_body(body) {
        Ok(request) => dispatch(&state, BackendKind::Direct, request).await,
        Err(err) => err.into_response(),
    }
}

pub async fn chat_langchain(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    match read_body(body) {
        Ok(request) => dispatch(&state, BackendKind::Agent, request).await,
        Err(err) => err.into_response(),
    }
}

/// Backend is chosen by `settings.framework`.
pub async fn chat(State(state): State<AppState>, body: Result<Bytes, BytesRejection>) -> Response {
    match read_body(body) {
        Ok(request) => {
            let kind = request.settings.backend_kind();
            dispatch(&state, kind, request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Oversized or unreadable bodies are malformed input like any other.
fn read_body(body: Result<Bytes, BytesRejection>) -> AppResult<ChatRequest> {
    let body = body.map_err(|rejection| {
        tracing::debug!(status = %rejection.status(), error = %rejection.body_text(), "request body unreadable");
        AppError::bad_request("body_unreadable", rejection.body_text())
    })?;
    normalize(&body)
}

async fn dispatch(state: &AppState, kind: BackendKind, request: ChatRequest) -> Response {
    metrics::counter!("chat_relay_requests_total", "backend" => kind.as_str()).increment(1);
    tracing::info!(
        backend = kind.as_str(),
        model = %request.settings.model,
        tier = request.settings.tier().as_str(),
        messages = request.messages.len(),
        "chat request accepted"
    );
    let events = state.backends.get(kind).generate(request);
    let (mut sink, response) = channel_sink(state.runtime.stream_buffer);
    tokio::spawn(async move {
        let outcome = relay(events, &mut sink).await;
        metrics::counter!("chat_relay_relay_outcomes_total", "outcome" => outcome.as_str())
            .increment(1);
        match outcome {
            RelayOutcome::Completed => tracing::debug!(backend = kind.as_str(), "relay completed"),
            RelayOutcome::Rejected(error) => tracing::warn!(
                backend = kind.as_str(),
                kind = error.as_str(),
                "relay rejected before streaming"
            ),
            other => tracing::warn!(backend = kind.as_str(), outcome = other.as_str(), "relay ended early"),
        }
    });
    response.into_response().await
}

pub async fn not_found() -> Response {
    (axum::http::StatusCode::NOT_FOUND, "Not found").into_response()
}
