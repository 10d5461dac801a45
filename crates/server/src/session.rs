//! Per-connection session state machine
//!
//! Drives chunked audio through resample -> pending -> VAD -> recognizer
//! pool, emits interim/final/done messages, and records timing and counter
//! metrics for the request. The outgoing-message buffer is reused across
//! calls: each call rewrites elements in place, so steady-state operation
//! does not allocate on the status path.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use asr_config::Settings;
use asr_pipeline::{compute_rms, PipelineError, Recognizer, VoiceActivityDetector};

use crate::metrics;

/// Outbound message kind. Advisory for the transport: all three are
/// serialized identically as text frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Interim,
    Final,
    Done,
}

/// Pre-formatted outbound message. The payload string retains its capacity
/// across calls.
#[derive(Debug, Clone)]
pub struct OutMessage {
    pub kind: MessageKind,
    pub json: String,
}

impl OutMessage {
    fn new() -> Self {
        Self {
            kind: MessageKind::Interim,
            json: String::with_capacity(128),
        }
    }
}

/// Session-level configuration, extracted from [`Settings`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub window_size: usize,
    pub min_audio_sec: f32,
    pub max_audio_sec: f32,
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            sample_rate: settings.asr.sample_rate,
            window_size: settings.vad.window_size,
            min_audio_sec: settings.audio.min_audio_sec,
            max_audio_sec: settings.audio.max_audio_sec,
        }
    }
}

/// Per-client streaming recognition session.
///
/// Methods return a view into an internal message buffer; the view is valid
/// until the next call on the same session. The session is confined to one
/// logical owner at a time; it may migrate between threads between calls
/// but is never shared mid-call.
pub struct AsrSession {
    recognizer: Arc<Recognizer>,
    vad: VoiceActivityDetector,
    config: SessionConfig,

    // Reusable message buffer: out_len tracks the logical size, elements
    // beyond it retain their allocations
    out_messages: Vec<OutMessage>,
    out_len: usize,

    // Sub-window accumulator, always shorter than window_size between calls
    pending: Vec<f32>,

    start_ts: Instant,
    first_result_ts: Option<Instant>,
    segments: u32,
    silence_segments: u32,
    decode_sec: f64,
    preprocess_sec: f64,
    audio_samples: usize,
    total_samples_received: usize,
    session_active: bool,
    max_duration_exceeded: bool,
    chunks: u64,
    bytes: u64,
}

impl AsrSession {
    pub fn new(recognizer: Arc<Recognizer>, vad: VoiceActivityDetector, config: SessionConfig) -> Self {
        let mut session = Self {
            recognizer,
            vad,
            out_messages: Vec::with_capacity(4),
            out_len: 0,
            pending: Vec::with_capacity(config.window_size),
            start_ts: Instant::now(),
            first_result_ts: None,
            segments: 0,
            silence_segments: 0,
            decode_sec: 0.0,
            preprocess_sec: 0.0,
            audio_samples: 0,
            total_samples_received: 0,
            session_active: false,
            max_duration_exceeded: false,
            chunks: 0,
            bytes: 0,
            config,
        };
        session.reset_counters();
        session
    }

    // --- Zero-alloc message buffer ---

    fn begin_messages(&mut self) {
        self.out_len = 0;
    }

    fn next_message(&mut self) -> &mut OutMessage {
        if self.out_len >= self.out_messages.len() {
            self.out_messages.push(OutMessage::new());
        }
        let msg = &mut self.out_messages[self.out_len];
        self.out_len += 1;
        msg
    }

    fn current_messages(&self) -> &[OutMessage] {
        &self.out_messages[..self.out_len]
    }

    fn write_interim(&mut self, duration: f32, rms: f32, is_speech: bool) {
        let msg = self.next_message();
        msg.kind = MessageKind::Interim;
        msg.json.clear();
        let _ = write!(
            msg.json,
            r#"{{"type":"interim","duration":{:.1},"rms":{:.4},"is_speech":{}}}"#,
            duration, rms, is_speech
        );
    }

    fn write_final(&mut self, text: &str, duration: f32) {
        let msg = self.next_message();
        msg.kind = MessageKind::Final;
        msg.json.clear();
        msg.json.push_str(r#"{"type":"final","text":""#);
        json_escape_to(&mut msg.json, text);
        let _ = write!(msg.json, r#"","duration":{:.3}}}"#, duration);
    }

    fn write_done(&mut self) {
        let msg = self.next_message();
        msg.kind = MessageKind::Done;
        msg.json.clear();
        msg.json.push_str(r#"{"type":"done"}"#);
    }

    // --- Session lifecycle ---

    fn reset_counters(&mut self) {
        self.start_ts = Instant::now();
        self.first_result_ts = None;
        self.segments = 0;
        self.silence_segments = 0;
        self.decode_sec = 0.0;
        self.preprocess_sec = 0.0;
        self.audio_samples = 0;
        self.total_samples_received = 0;
        self.chunks = 0;
        self.bytes = 0;
        self.max_duration_exceeded = false;
    }

    fn process_vad_segments(&mut self) -> Result<(), PipelineError> {
        while let Some(segment) = self.vad.pop() {
            let audio_sec = segment.samples.len() as f32 / self.config.sample_rate as f32;

            if audio_sec < self.config.min_audio_sec {
                tracing::debug!(audio_sec, "skipping short segment");
                self.silence_segments += 1;
                metrics::record_silence();
                continue;
            }

            let t0 = Instant::now();
            let text = self
                .recognizer
                .transcribe(&segment.samples, self.config.sample_rate)?;
            let seg_decode_sec = t0.elapsed().as_secs_f64();
            self.decode_sec += seg_decode_sec;
            self.audio_samples += segment.samples.len();

            if self.first_result_ts.is_none() {
                let now = Instant::now();
                self.first_result_ts = Some(now);
                let ttfr = now.duration_since(self.start_ts).as_secs_f64();
                metrics::observe_ttfr(ttfr, "websocket");
            }

            metrics::observe_segment(audio_sec as f64, seg_decode_sec);

            if text.is_empty() {
                self.silence_segments += 1;
                metrics::record_silence();
            } else {
                self.segments += 1;
                metrics::record_result(&text);
                self.write_final(&text, audio_sec);
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<(), PipelineError> {
        if !self.pending.is_empty() {
            self.pending.resize(self.config.window_size, 0.0);
            self.vad.accept(&self.pending)?;
            self.pending.clear();
        }
        self.vad.flush();
        Ok(())
    }

    fn finalize_session(&mut self) {
        let total_sec = self.start_ts.elapsed().as_secs_f64();
        let audio_sec = self.audio_samples as f64 / self.config.sample_rate as f64;

        metrics::observe_request(
            total_sec,
            audio_sec,
            self.decode_sec,
            self.chunks,
            self.bytes,
            self.preprocess_sec,
            0.0,
            "websocket",
            "success",
        );

        let total_segments = self.segments + self.silence_segments;
        if total_segments > 0 {
            metrics::set_speech_ratio(self.segments as f64 / total_segments as f64);
        }

        self.write_done();

        if self.session_active {
            metrics::session_ended(total_sec);
            self.session_active = false;
        }

        self.vad.reset();
        self.pending.clear();
        self.reset_counters();
    }

    // --- Public API ---

    /// Process a binary audio chunk. Returns either one or more `Final`
    /// messages, or a single `Interim` carrying `(duration, rms, is_speech)`.
    /// After the `max_audio_sec` auto-finalize has fired, calls are no-ops
    /// until the next reset.
    pub fn on_audio(&mut self, samples: &[f32]) -> Result<&[OutMessage], PipelineError> {
        self.begin_messages();

        if self.max_duration_exceeded {
            return Ok(self.current_messages());
        }

        let preprocess_start = Instant::now();

        // Lazy session start: only count when audio actually arrives
        if !self.session_active {
            self.session_active = true;
            metrics::session_started();
        }

        self.chunks += 1;
        self.total_samples_received += samples.len();
        self.bytes += (samples.len() * std::mem::size_of::<f32>()) as u64;

        let rms = compute_rms(samples);
        metrics::record_audio_level(rms as f64);

        // Accumulate and feed the VAD in window-sized chunks
        let mut offset = 0;
        while offset < samples.len() {
            let remaining_in_window = self.config.window_size - self.pending.len();
            let to_copy = remaining_in_window.min(samples.len() - offset);
            self.pending.extend_from_slice(&samples[offset..offset + to_copy]);
            offset += to_copy;

            if self.pending.len() == self.config.window_size {
                self.vad.accept(&self.pending)?;
                self.pending.clear();
            }
        }

        self.preprocess_sec += preprocess_start.elapsed().as_secs_f64();

        self.process_vad_segments()?;

        if self.out_len == 0 {
            let duration = self.total_samples_received as f32 / self.config.sample_rate as f32;
            self.write_interim(duration, rms, self.vad.is_speech());
        }

        // Auto-finalize once the per-session audio cap is exceeded
        let received_sec = self.total_samples_received as f32 / self.config.sample_rate as f32;
        if received_sec > self.config.max_audio_sec {
            tracing::warn!(
                received_sec,
                limit = self.config.max_audio_sec,
                "max audio duration exceeded, forcing recognize"
            );
            self.flush_pending()?;
            self.process_vad_segments()?;
            self.finalize_session();
            self.max_duration_exceeded = true;
        }

        Ok(self.current_messages())
    }

    /// Finalize the current utterance: pad pending to a full window, flush
    /// the VAD, drain segments, and append `Done`. If the `max_audio_sec`
    /// auto-finalize already fired, the flag is consumed and the call
    /// returns no messages.
    pub fn on_recognize(&mut self) -> Result<&[OutMessage], PipelineError> {
        self.begin_messages();

        if self.max_duration_exceeded {
            self.max_duration_exceeded = false;
            return Ok(self.current_messages());
        }

        self.flush_pending()?;
        self.process_vad_segments()?;
        self.finalize_session();
        Ok(self.current_messages())
    }

    /// Discard pending audio and reset all session state.
    pub fn on_reset(&mut self) {
        self.max_duration_exceeded = false;
        if self.session_active {
            metrics::session_ended(0.0);
            self.session_active = false;
        }
        self.vad.reset();
        self.pending.clear();
        self.reset_counters();
    }

    /// Settle session metrics on connection close. No messages.
    pub fn on_close(&mut self) {
        if self.session_active {
            let elapsed = self.start_ts.elapsed().as_secs_f64();
            metrics::session_ended(elapsed);
            self.session_active = false;
        }
    }
}

/// Escape a string for JSON output, appending directly to `out`
/// (RFC 8259 §7 mandatory escapes).
fn json_escape_to(out: &mut String, s: &str) {
    out.reserve(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
}
