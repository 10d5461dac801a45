//! Audio pipeline for the streaming ASR server
//!
//! This crate provides the stages a chunk of audio passes through:
//! - WAV decode and sample-rate conversion
//! - Voice Activity Detection with hysteresis segmentation
//! - Recognizer pool gating access to the transcription backends

pub mod audio;
pub mod stt;
pub mod vad;

// Audio exports
pub use audio::{compute_rms, decode_wav, AudioData, StreamResampler};

// VAD exports
pub use vad::{EnergyProbe, SpeechProbe, SpeechSegment, VadConfig, VoiceActivityDetector};

// Recognizer exports
pub use stt::{ConformerBackend, Recognizer, RecognizerConfig, SttBackend};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Resample error: {0}")]
    Resample(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("VAD window size mismatch: expected {expected} samples, got {got}")]
    WindowSize { expected: usize, got: usize },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl PipelineError {
    /// True for failures of the WAV decoder or sample-rate converter,
    /// which one-shot clients see as a 400-equivalent.
    pub fn is_invalid_audio(&self) -> bool {
        matches!(self, Self::Audio(_))
    }
}
