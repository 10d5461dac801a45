//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Model file paths
    #[serde(default)]
    pub models: ModelPaths,

    /// Recognizer configuration
    #[serde(default)]
    pub asr: AsrConfig,

    /// Voice activity detection configuration
    #[serde(default)]
    pub vad: VadSettings,

    /// Audio bounds
    #[serde(default)]
    pub audio: AudioConfig,

    /// Request and frame limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and normalize settings.
    ///
    /// Hard violations return [`ConfigError`]; soft violations are clamped
    /// into range with a warning. Auto values (`0`) are resolved here so the
    /// rest of the system never sees them.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port", "must be non-zero"));
        }
        if self.server.threads == 0 {
            self.server.threads = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.server.threads > 256 {
            tracing::warn!("Clamping server.threads {} to 256", self.server.threads);
            self.server.threads = 256;
        }

        if self.asr.sample_rate == 0 {
            return Err(ConfigError::invalid("asr.sample_rate", "must be positive"));
        }
        if !(8_000..=48_000).contains(&self.asr.sample_rate) {
            tracing::warn!(
                "Clamping asr.sample_rate {} to [8000, 48000]",
                self.asr.sample_rate
            );
            self.asr.sample_rate = self.asr.sample_rate.clamp(8_000, 48_000);
        }
        if self.asr.num_threads == 0 || self.asr.num_threads > 128 {
            tracing::warn!("Clamping asr.num_threads {} to [1, 128]", self.asr.num_threads);
            self.asr.num_threads = self.asr.num_threads.clamp(1, 128);
        }
        if self.asr.feature_dim == 0 {
            return Err(ConfigError::invalid("asr.feature_dim", "must be positive"));
        }

        // Pool size: 0 = auto = server threads
        if self.asr.recognizer_pool_size == 0 {
            self.asr.recognizer_pool_size = self.server.threads;
        }
        if self.asr.recognizer_pool_size > 256 {
            tracing::warn!(
                "Clamping asr.recognizer_pool_size {} to 256",
                self.asr.recognizer_pool_size
            );
            self.asr.recognizer_pool_size = 256;
        }

        if self.vad.window_size == 0 {
            return Err(ConfigError::invalid("vad.window_size", "must be positive"));
        }
        if !(64..=4096).contains(&self.vad.window_size) {
            tracing::warn!(
                "Clamping vad.window_size {} to [64, 4096]",
                self.vad.window_size
            );
            self.vad.window_size = self.vad.window_size.clamp(64, 4096);
        }
        if self.vad.context_size >= self.vad.window_size {
            return Err(ConfigError::invalid(
                "vad.context_size",
                format!(
                    "must be in [0, window_size), got {} with window_size {}",
                    self.vad.context_size, self.vad.window_size
                ),
            ));
        }
        if self.vad.threshold <= 0.0 || self.vad.threshold >= 1.0 {
            tracing::warn!("Clamping vad.threshold {} to (0.0, 1.0)", self.vad.threshold);
            self.vad.threshold = self.vad.threshold.clamp(0.01, 0.99);
        }
        if self.vad.min_silence <= 0.0 {
            tracing::warn!("Clamping vad.min_silence {} to 0.01", self.vad.min_silence);
            self.vad.min_silence = 0.01;
        }
        if self.vad.min_speech <= 0.0 {
            tracing::warn!("Clamping vad.min_speech {} to 0.01", self.vad.min_speech);
            self.vad.min_speech = 0.01;
        }
        if self.vad.max_speech <= self.vad.min_speech {
            tracing::warn!(
                "vad.max_speech ({}) must be > vad.min_speech ({}), fixing",
                self.vad.max_speech,
                self.vad.min_speech
            );
            self.vad.max_speech = self.vad.min_speech + 10.0;
        }

        if self.audio.min_audio_sec < 0.0 {
            tracing::warn!("Clamping audio.min_audio_sec {} to 0", self.audio.min_audio_sec);
            self.audio.min_audio_sec = 0.0;
        }
        if self.audio.max_audio_sec <= self.audio.min_audio_sec {
            tracing::warn!(
                "audio.max_audio_sec ({}) must be > audio.min_audio_sec ({}), fixing",
                self.audio.max_audio_sec,
                self.audio.min_audio_sec
            );
            self.audio.max_audio_sec = self.audio.min_audio_sec + 30.0;
        }

        if self.limits.max_upload_bytes == 0 {
            return Err(ConfigError::invalid("limits.max_upload_bytes", "must be positive"));
        }
        if self.limits.max_ws_message_bytes == 0 {
            return Err(ConfigError::invalid(
                "limits.max_ws_message_bytes",
                "must be positive",
            ));
        }

        // Max concurrent one-shot requests: 0 = auto = threads * 2
        if self.limits.max_concurrent_requests == 0 {
            self.limits.max_concurrent_requests = self.server.threads * 2;
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Worker threads (0 = number of cores)
    #[serde(default)]
    pub threads: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8081
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            threads: 0,
        }
    }
}

/// Model file paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPaths {
    /// Directory containing encoder.onnx, ctc_decoder.onnx, tokens.txt
    #[serde(default = "default_asr_dir")]
    pub asr_dir: String,

    /// Silero VAD model path
    #[serde(default = "default_vad_path")]
    pub vad: String,
}

fn default_asr_dir() -> String {
    "models/asr".to_string()
}
fn default_vad_path() -> String {
    "models/silero_vad.onnx".to_string()
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            asr_dir: default_asr_dir(),
            vad: default_vad_path(),
        }
    }
}

/// Recognizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    /// Total inference threads, partitioned across pool slots
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Target sample rate fed to VAD and recognizer
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Mel feature dimension of the acoustic model
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,

    /// Number of recognizer slots (0 = server threads)
    #[serde(default)]
    pub recognizer_pool_size: usize,
}

fn default_num_threads() -> usize {
    4
}
fn default_sample_rate() -> u32 {
    16_000
}
fn default_feature_dim() -> usize {
    64
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            sample_rate: default_sample_rate(),
            feature_dim: default_feature_dim(),
            recognizer_pool_size: 0,
        }
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    /// Speech probability threshold
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,

    /// Seconds of silence that close a segment
    #[serde(default = "default_min_silence")]
    pub min_silence: f32,

    /// Segments shorter than this are discarded
    #[serde(default = "default_min_speech")]
    pub min_speech: f32,

    /// Segments reaching this duration are force-closed
    #[serde(default = "default_max_speech")]
    pub max_speech: f32,

    /// Samples per VAD inference call
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Trailing context carried between calls
    #[serde(default = "default_context_size")]
    pub context_size: usize,
}

fn default_vad_threshold() -> f32 {
    0.5
}
fn default_min_silence() -> f32 {
    0.5
}
fn default_min_speech() -> f32 {
    0.25
}
fn default_max_speech() -> f32 {
    20.0
}
fn default_window_size() -> usize {
    512
}
fn default_context_size() -> usize {
    64
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            threshold: default_vad_threshold(),
            min_silence: default_min_silence(),
            min_speech: default_min_speech(),
            max_speech: default_max_speech(),
            window_size: default_window_size(),
            context_size: default_context_size(),
        }
    }
}

/// Audio bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Segments shorter than this bypass the recognizer
    #[serde(default = "default_min_audio_sec")]
    pub min_audio_sec: f32,

    /// Per-session cap on received audio; exceeding it auto-finalizes
    #[serde(default = "default_max_audio_sec")]
    pub max_audio_sec: f32,
}

fn default_min_audio_sec() -> f32 {
    0.5
}
fn default_max_audio_sec() -> f32 {
    30.0
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            min_audio_sec: default_min_audio_sec(),
            max_audio_sec: default_max_audio_sec(),
        }
    }
}

/// Request and frame limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound on one-shot upload bodies
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Upper bound on a single WebSocket frame
    #[serde(default = "default_max_ws_message_bytes")]
    pub max_ws_message_bytes: usize,

    /// In-flight one-shot requests (0 = threads * 2)
    #[serde(default)]
    pub max_concurrent_requests: usize,
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_max_ws_message_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            max_ws_message_bytes: default_max_ws_message_bytes(),
            max_concurrent_requests: 0,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// Load settings from files and environment.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`ASR` prefix, `__` separator)
/// 2. config/default.yaml
pub fn load_settings() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::with_prefix("ASR").separator("__").try_parsing(true));

    let config = builder.build()?;
    let mut settings: Settings = config.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8081);
        assert_eq!(settings.asr.sample_rate, 16_000);
        assert_eq!(settings.vad.window_size, 512);
        assert_eq!(settings.vad.context_size, 64);
        assert_eq!(settings.limits.max_ws_message_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_validate_resolves_auto_values() {
        let mut settings = Settings::default();
        settings.server.threads = 4;
        settings.validate().unwrap();
        assert_eq!(settings.asr.recognizer_pool_size, 4);
        assert_eq!(settings.limits.max_concurrent_requests, 8);
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut settings = Settings::default();
        settings.server.port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_context_ge_window() {
        let mut settings = Settings::default();
        settings.vad.context_size = settings.vad.window_size;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_clamps_soft_ranges() {
        let mut settings = Settings::default();
        settings.asr.sample_rate = 96_000;
        settings.vad.window_size = 8192;
        settings.vad.threshold = 1.5;
        settings.validate().unwrap();
        assert_eq!(settings.asr.sample_rate, 48_000);
        assert_eq!(settings.vad.window_size, 4096);
        assert!((settings.vad.threshold - 0.99).abs() < f32::EPSILON);
    }

    #[test]
    fn test_validate_fixes_duration_ordering() {
        let mut settings = Settings::default();
        settings.vad.max_speech = 0.1;
        settings.audio.max_audio_sec = 0.1;
        settings.validate().unwrap();
        assert!(settings.vad.max_speech > settings.vad.min_speech);
        assert!(settings.audio.max_audio_sec > settings.audio.min_audio_sec);
    }
}
