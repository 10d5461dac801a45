//! Observability metrics
//!
//! Process-wide Prometheus metrics behind the `metrics` facade. All metric
//! families and their hot-path label combinations are registered once at
//! install time; observation helpers take `&'static str` labels so the hot
//! path stays allocation-free.

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

// Bucket boundaries per metric family
const TTFR_BUCKETS: &[f64] = &[0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 10.0];
const DECODE_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];
const SEGMENT_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 15.0, 20.0, 30.0];
const RTF_BUCKETS: &[f64] = &[0.05, 0.1, 0.15, 0.2, 0.3, 0.4, 0.5, 0.75, 1.0, 1.5, 2.0];
const REQUEST_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 45.0, 60.0, 90.0, 120.0];
const AUDIO_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0];
const CONNECTION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0];
const SESSION_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0];
const WORDS_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0];
const RMS_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5];

/// Initialize the metrics recorder. Idempotent; returns the handle used by
/// the `/metrics` endpoint.
pub fn init_metrics() -> PrometheusHandle {
    METRICS_HANDLE.get_or_init(install_recorder).clone()
}

/// Get the global metrics handle
pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}

fn install_recorder() -> PrometheusHandle {
    let buckets: &[(&str, &[f64])] = &[
        ("asr_ttfr_seconds", TTFR_BUCKETS),
        ("asr_decode_duration_seconds", DECODE_BUCKETS),
        ("asr_preprocess_duration_seconds", DECODE_BUCKETS),
        ("asr_io_duration_seconds", DECODE_BUCKETS),
        ("asr_segment_duration_seconds", SEGMENT_BUCKETS),
        ("asr_rtf", RTF_BUCKETS),
        ("asr_rtf_decode", RTF_BUCKETS),
        ("asr_segment_rtf", RTF_BUCKETS),
        ("asr_request_duration_seconds", REQUEST_BUCKETS),
        ("asr_audio_duration_seconds", AUDIO_BUCKETS),
        ("asr_connection_duration_seconds", CONNECTION_BUCKETS),
        ("asr_session_duration_seconds", SESSION_BUCKETS),
        ("asr_words_per_request", WORDS_BUCKETS),
        ("asr_audio_rms_level", RMS_BUCKETS),
    ];

    let mut builder = PrometheusBuilder::new();
    for (name, bounds) in buckets {
        builder = builder
            .set_buckets_for_metric(Matcher::Full((*name).to_string()), bounds)
            .expect("static bucket boundaries are non-empty");
    }

    let handle = builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_default_metrics();
    tracing::info!("Prometheus metrics initialized");
    handle
}

/// Register all families and pre-create the hot-path label combinations so
/// observations never pay first-touch registration.
fn register_default_metrics() {
    describe_histogram!("asr_ttfr_seconds", "Time to first result");
    describe_histogram!("asr_rtf", "Real-time factor");
    describe_histogram!("asr_rtf_decode", "Real-time factor for decode only");
    describe_histogram!("asr_request_duration_seconds", "Total request duration");
    describe_histogram!("asr_decode_duration_seconds", "Decode duration per segment");
    describe_histogram!("asr_audio_duration_seconds", "Audio duration per request");
    describe_histogram!("asr_segment_duration_seconds", "Segment duration");
    describe_histogram!("asr_preprocess_duration_seconds", "Preprocessing duration");
    describe_histogram!("asr_io_duration_seconds", "I/O duration");
    describe_histogram!("asr_segment_rtf", "RTF per segment");
    describe_histogram!("asr_connection_duration_seconds", "WebSocket connection duration");
    describe_histogram!("asr_session_duration_seconds", "Session duration");
    describe_histogram!("asr_words_per_request", "Words per recognition request");
    describe_histogram!("asr_audio_rms_level", "RMS level of input audio");

    describe_counter!("asr_requests_total", "Total requests");
    describe_counter!("asr_segments_total", "Total segments processed");
    describe_counter!("asr_errors_total", "Total errors");
    describe_counter!("asr_chunks_total", "Total audio chunks received");
    describe_counter!("asr_bytes_total", "Total bytes received");
    describe_counter!("asr_connections_total", "Total connections");
    describe_counter!("asr_disconnections_total", "Total disconnections");
    describe_counter!("asr_sessions_total", "Total sessions");
    describe_counter!("asr_empty_results_total", "Empty result count");
    describe_counter!("asr_words_total", "Cumulative words");
    describe_counter!("asr_characters_total", "Cumulative characters");
    describe_counter!("asr_silence_segments_total", "Silence segments");
    describe_counter!("asr_low_volume_warnings_total", "Low volume warnings");

    describe_gauge!("asr_active_connections", "Active WebSocket connections");
    describe_gauge!("asr_active_sessions", "Active sessions");
    describe_gauge!("asr_speech_ratio", "Speech vs silence ratio");
    describe_gauge!("asr_current_ttfr_seconds", "Current TTFR");
    describe_gauge!("asr_current_decode_seconds", "Current decode time");
    describe_gauge!("asr_current_rtf", "Current RTF");
    describe_gauge!("asr_current_request_seconds", "Current request duration");
    describe_gauge!("asr_current_audio_seconds", "Current audio duration");
    describe_gauge!("asr_current_preprocess_seconds", "Current preprocess time");
    describe_gauge!("asr_current_io_seconds", "Current I/O duration");

    for mode in ["websocket", "http"] {
        histogram!("asr_ttfr_seconds", "mode" => mode).record(0.0);
        histogram!("asr_rtf", "mode" => mode).record(0.0);
        histogram!("asr_rtf_decode", "mode" => mode).record(0.0);
        for status in ["success", "failed"] {
            counter!("asr_requests_total", "mode" => mode, "status" => status).absolute(0);
            histogram!("asr_request_duration_seconds", "mode" => mode, "status" => status)
                .record(0.0);
        }
    }
    counter!("asr_disconnections_total", "reason" => "normal").absolute(0);
    gauge!("asr_active_connections").set(0.0);
    gauge!("asr_active_sessions").set(0.0);
}

/// Record time to first result
pub fn observe_ttfr(sec: f64, mode: &'static str) {
    histogram!("asr_ttfr_seconds", "mode" => mode).record(sec);
    gauge!("asr_current_ttfr_seconds").set(sec);
}

/// Record one decoded segment
pub fn observe_segment(audio_sec: f64, decode_sec: f64) {
    histogram!("asr_decode_duration_seconds").record(decode_sec);
    histogram!("asr_segment_duration_seconds").record(audio_sec);
    counter!("asr_segments_total").increment(1);
    if audio_sec > 0.0 {
        histogram!("asr_segment_rtf").record(decode_sec / audio_sec);
    }
    gauge!("asr_current_decode_seconds").set(decode_sec);
}

/// Record a completed request (streaming session or one-shot upload)
#[allow(clippy::too_many_arguments)]
pub fn observe_request(
    total_sec: f64,
    audio_sec: f64,
    decode_sec: f64,
    chunk_count: u64,
    bytes_count: u64,
    preprocess_sec: f64,
    io_sec: f64,
    mode: &'static str,
    status: &'static str,
) {
    counter!("asr_requests_total", "mode" => mode, "status" => status).increment(1);
    histogram!("asr_request_duration_seconds", "mode" => mode, "status" => status).record(total_sec);

    histogram!("asr_audio_duration_seconds").record(audio_sec);
    histogram!("asr_preprocess_duration_seconds").record(preprocess_sec);
    histogram!("asr_io_duration_seconds").record(io_sec);

    if audio_sec > 0.0 {
        let rtf = total_sec / audio_sec;
        histogram!("asr_rtf", "mode" => mode).record(rtf);
        histogram!("asr_rtf_decode", "mode" => mode).record(decode_sec / audio_sec);
        gauge!("asr_current_rtf").set(rtf);
    }

    counter!("asr_chunks_total").increment(chunk_count);
    counter!("asr_bytes_total").increment(bytes_count);

    gauge!("asr_current_request_seconds").set(total_sec);
    gauge!("asr_current_audio_seconds").set(audio_sec);
    gauge!("asr_current_preprocess_seconds").set(preprocess_sec);
    gauge!("asr_current_io_seconds").set(io_sec);
}

/// Record an error by type
pub fn observe_error(error_type: &str) {
    counter!("asr_errors_total", "error_type" => error_type.to_string()).increment(1);
}

/// Record a WebSocket connection opening
pub fn connection_opened() {
    counter!("asr_connections_total").increment(1);
    gauge!("asr_active_connections").increment(1.0);
}

/// Record a WebSocket connection closing
pub fn connection_closed(reason: &str, duration_sec: f64) {
    gauge!("asr_active_connections").decrement(1.0);
    counter!("asr_disconnections_total", "reason" => reason.to_string()).increment(1);
    histogram!("asr_connection_duration_seconds").record(duration_sec);
}

/// Record a session starting
pub fn session_started() {
    counter!("asr_sessions_total").increment(1);
    gauge!("asr_active_sessions").increment(1.0);
}

/// Record a session ending
pub fn session_ended(duration_sec: f64) {
    gauge!("asr_active_sessions").decrement(1.0);
    histogram!("asr_session_duration_seconds").record(duration_sec);
}

/// Record transcript statistics; empty text counts as an empty result.
pub fn record_result(text: &str) {
    if text.is_empty() {
        counter!("asr_empty_results_total").increment(1);
        return;
    }

    let word_count = text.split_whitespace().count() as u64;
    counter!("asr_words_total").increment(word_count);
    counter!("asr_characters_total").increment(text.len() as u64);
    histogram!("asr_words_per_request").record(word_count as f64);
}

/// Record the RMS level of an incoming chunk
pub fn record_audio_level(rms: f64) {
    histogram!("asr_audio_rms_level").record(rms);
    if rms < 0.005 {
        counter!("asr_low_volume_warnings_total").increment(1);
    }
}

/// Record a segment that produced no transcript
pub fn record_silence() {
    counter!("asr_silence_segments_total").increment(1);
}

/// Record the per-session speech/silence ratio
pub fn set_speech_ratio(ratio: f64) {
    gauge!("asr_speech_ratio").set(ratio);
}

/// Metrics endpoint handler: Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    match get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}
