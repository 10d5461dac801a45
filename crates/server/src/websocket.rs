//! WebSocket streaming transport
//!
//! Each connection gets a blocking worker task that owns the session and
//! the optional resampler; the async side forwards inbound frames to the
//! worker over a channel and streams outbound messages back to the socket
//! in order. Session calls block on the recognizer pool, so they never run
//! on the async executor.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use asr_pipeline::{PipelineError, Recognizer, StreamResampler, VadConfig, VoiceActivityDetector};

use crate::metrics;
use crate::session::{AsrSession, SessionConfig};
use crate::state::AppState;

/// Optional first text frame declaring the client sample rate
#[derive(Debug, Deserialize)]
struct Handshake {
    sample_rate: u32,
}

/// Commands forwarded from the socket to the session worker
enum SessionCommand {
    SampleRate(u32),
    Audio(Vec<f32>),
    Recognize,
    Reset,
}

/// Handle WebSocket upgrade at `/ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    metrics::connection_opened();
    let connected_at = Instant::now();

    let max_message_bytes = state.config.limits.max_ws_message_bytes;

    let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<SessionCommand>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let recognizer = state.recognizer.clone();
    let vad_config = state.vad_config();
    let session_config = state.session_config();
    let worker = tokio::task::spawn_blocking(move || {
        run_session_worker(recognizer, vad_config, session_config, cmd_rx, out_tx)
    });

    let (mut sender, mut receiver) = socket.split();
    let mut close_reason: &'static str = "normal";
    let mut handshake_done = false;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Worker exited while the connection is still open
                        close_reason = "internal_error";
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::ERROR,
                                reason: "Internal error".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > max_message_bytes {
                            tracing::warn!(
                                bytes = data.len(),
                                limit = max_message_bytes,
                                "WS: message too large"
                            );
                            close_reason = "message_too_large";
                            let _ = sender
                                .send(Message::Close(Some(CloseFrame {
                                    code: close_code::POLICY,
                                    reason: "Message too large".into(),
                                })))
                                .await;
                            break;
                        }
                        if data.len() < 4 || data.len() % 4 != 0 {
                            tracing::warn!(bytes = data.len(), "WS: invalid binary frame size");
                            continue;
                        }
                        // Wire bytes may be unaligned for f32: copy through a
                        // byte-oriented path into an owned buffer
                        let samples = le_bytes_to_f32(&data);
                        if cmd_tx.send(SessionCommand::Audio(samples)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if !handshake_done && text.starts_with('{') {
                            if let Ok(handshake) = serde_json::from_str::<Handshake>(&text) {
                                if !(8_000..=192_000).contains(&handshake.sample_rate) {
                                    tracing::warn!(
                                        rate = handshake.sample_rate,
                                        "WS: invalid sample_rate, ignoring"
                                    );
                                    continue;
                                }
                                handshake_done = true;
                                if cmd_tx.send(SessionCommand::SampleRate(handshake.sample_rate)).is_err() {
                                    break;
                                }
                                continue;
                            }
                            // Not a handshake: fall through to command handling
                        }
                        let command = match text.as_str() {
                            "RECOGNIZE" => SessionCommand::Recognize,
                            "RESET" => SessionCommand::Reset,
                            other => {
                                tracing::warn!(message = other, "WS: unknown text message");
                                continue;
                            }
                        };
                        if cmd_tx.send(command).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WS: receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // Let the worker drain: closing the command channel ends its loop
    drop(cmd_tx);
    while let Some(json) = out_rx.recv().await {
        if sender.send(Message::Text(json)).await.is_err() {
            break;
        }
    }

    match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("WS: session worker failed: {}", e);
            metrics::observe_error("ws_handler_error");
            if close_reason == "normal" {
                close_reason = "internal_error";
            }
        }
        Err(e) => {
            tracing::error!("WS: session worker panicked: {}", e);
            metrics::observe_error("ws_handler_panic");
            close_reason = "internal_error";
        }
    }

    let duration = connected_at.elapsed().as_secs_f64();
    tracing::info!(duration, reason = close_reason, "WS: connection closed");
    metrics::connection_closed(close_reason, duration);
}

/// Blocking per-connection worker: owns the session and resampler, executes
/// commands in arrival order, and pushes serialized messages back.
fn run_session_worker(
    recognizer: Arc<Recognizer>,
    vad_config: VadConfig,
    session_config: SessionConfig,
    cmd_rx: std::sync::mpsc::Receiver<SessionCommand>,
    out_tx: mpsc::UnboundedSender<String>,
) -> Result<(), PipelineError> {
    let target_rate = session_config.sample_rate;
    let vad = VoiceActivityDetector::new(vad_config)?;
    let mut session = AsrSession::new(recognizer, vad, session_config);
    let mut resampler: Option<StreamResampler> = None;

    let result = (|| -> Result<(), PipelineError> {
        while let Ok(command) = cmd_rx.recv() {
            match command {
                SessionCommand::SampleRate(rate) => {
                    if rate != target_rate {
                        resampler = Some(StreamResampler::new(rate, target_rate)?);
                        tracing::info!(from = rate, to = target_rate, "WS: resampling enabled");
                    } else {
                        tracing::debug!(rate, "WS: client sample rate matches target");
                    }
                }
                SessionCommand::Audio(samples) => {
                    let messages = match resampler.as_mut() {
                        Some(rs) => {
                            let resampled = rs.process(&samples)?;
                            session.on_audio(resampled)?
                        }
                        None => session.on_audio(&samples)?,
                    };
                    for msg in messages {
                        if out_tx.send(msg.json.clone()).is_err() {
                            return Ok(());
                        }
                    }
                }
                SessionCommand::Recognize => {
                    // Flush the resampler filter tail before finalizing
                    if let Some(rs) = resampler.as_mut() {
                        let tail = rs.flush()?;
                        if !tail.is_empty() {
                            for msg in session.on_audio(tail)? {
                                if out_tx.send(msg.json.clone()).is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    for msg in session.on_recognize()? {
                        if out_tx.send(msg.json.clone()).is_err() {
                            return Ok(());
                        }
                    }
                }
                SessionCommand::Reset => {
                    session.on_reset();
                    // Flush resets the converter; the tail is discarded, never
                    // routed into the next session
                    if let Some(rs) = resampler.as_mut() {
                        rs.flush()?;
                    }
                }
            }
        }
        Ok(())
    })();

    session.on_close();
    result
}

/// Copy little-endian float32 wire bytes into an owned, aligned buffer.
fn le_bytes_to_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
