//! HTTP endpoints
//!
//! One-shot recognition, health, and metrics. The one-shot path is bounded
//! by a semaphore: when all permits are taken the request is rejected
//! immediately with a 503 rather than queued.

use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use asr_pipeline::decode_wav;

use crate::metrics;
use crate::state::AppState;
use crate::websocket::ws_handler;

// Slack for multipart framing on top of the payload limit
const UPLOAD_OVERHEAD: usize = 64 * 1024;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let max_body = state.config.limits.max_upload_bytes + UPLOAD_OVERHEAD;

    Router::new()
        .route("/recognize", post(recognize))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn error_response(status: StatusCode, detail: &str) -> Response {
    (status, Json(serde_json::json!({ "detail": detail }))).into_response()
}

/// Error response that also settles the request metrics opened by
/// `session_started`.
fn fail_request(start: Instant, status: StatusCode, detail: &str, error_type: &str) -> Response {
    metrics::observe_error(error_type);
    metrics::observe_request(
        start.elapsed().as_secs_f64(),
        0.0,
        0.0,
        0,
        0,
        0.0,
        0.0,
        "http",
        "failed",
    );
    metrics::session_ended(0.0);
    error_response(status, detail)
}

/// One-shot recognition: multipart WAV upload in, transcript out.
async fn recognize(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    // Concurrent request limiting: reject rather than queue
    let _permit = match state.request_permits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            metrics::observe_error("capacity_exceeded");
            metrics::observe_request(0.0, 0.0, 0.0, 0, 0, 0.0, 0.0, "http", "failed");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity, try again later",
            );
        }
    };

    metrics::session_started();
    let start = Instant::now();

    let data = match first_file_field(&mut multipart).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            return fail_request(start, StatusCode::BAD_REQUEST, "No file uploaded", "empty_file")
        }
        Err(detail) => return fail_request(start, StatusCode::BAD_REQUEST, &detail, "empty_file"),
    };

    if data.is_empty() {
        return fail_request(start, StatusCode::BAD_REQUEST, "Empty file", "empty_file");
    }
    if data.len() > state.config.limits.max_upload_bytes {
        return fail_request(
            start,
            StatusCode::PAYLOAD_TOO_LARGE,
            "File too large",
            "file_too_large",
        );
    }

    let bytes_count = data.len() as u64;
    let sample_rate = state.config.asr.sample_rate;
    let recognizer = state.recognizer.clone();

    // Decode and transcribe off the async executor; both block
    let result = tokio::task::spawn_blocking(move || {
        let preprocess_start = Instant::now();
        let audio = decode_wav(&data, sample_rate)?;
        let preprocess_sec = preprocess_start.elapsed().as_secs_f64();

        let decode_start = Instant::now();
        let text = recognizer.transcribe(&audio.samples, sample_rate)?;
        let decode_sec = decode_start.elapsed().as_secs_f64();

        Ok::<_, asr_pipeline::PipelineError>((text, audio.duration_sec, preprocess_sec, decode_sec))
    })
    .await;

    match result {
        Ok(Ok((text, duration, preprocess_sec, decode_sec))) => {
            let total_sec = start.elapsed().as_secs_f64();

            metrics::observe_ttfr(decode_sec, "http");
            metrics::observe_segment(duration as f64, decode_sec);
            metrics::observe_request(
                total_sec,
                duration as f64,
                decode_sec,
                1,
                bytes_count,
                preprocess_sec,
                0.0,
                "http",
                "success",
            );
            metrics::record_result(&text);
            metrics::session_ended(total_sec);

            (
                StatusCode::OK,
                Json(serde_json::json!({ "text": text, "duration": duration })),
            )
                .into_response()
        }
        Ok(Err(e)) if e.is_invalid_audio() => {
            fail_request(start, StatusCode::BAD_REQUEST, &e.to_string(), "invalid_audio")
        }
        Ok(Err(e)) => fail_request(
            start,
            StatusCode::INTERNAL_SERVER_ERROR,
            &e.to_string(),
            "internal_error",
        ),
        Err(e) => {
            tracing::error!("recognize task failed: {}", e);
            fail_request(
                start,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error",
                "internal_error",
            )
        }
    }
}

/// Read the first file field of a multipart body into memory.
async fn first_file_field(multipart: &mut Multipart) -> Result<Option<Vec<u8>>, String> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| format!("Invalid multipart body: {}", e))?;
    match field {
        Some(field) => {
            let data = field
                .bytes()
                .await
                .map_err(|e| format!("Failed to read upload: {}", e))?;
            Ok(Some(data.to_vec()))
        }
        None => Ok(None),
    }
}

/// Health check: verifies the pool is constructed and reports its shape.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "threads": state.config.asr.num_threads,
        "pool_size": state.recognizer.pool_size(),
    }))
}
