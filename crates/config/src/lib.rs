//! Configuration for the streaming ASR server
//!
//! Settings are layered: `config/default.yaml` (optional) first, then
//! environment variables with the `ASR` prefix and `__` separator
//! (e.g. `ASR__VAD__THRESHOLD=0.6`).

mod settings;

pub use settings::{
    load_settings, AsrConfig, AudioConfig, LimitsConfig, ModelPaths, ObservabilityConfig,
    ServerConfig, Settings, VadSettings,
};

use thiserror::Error;

/// Configuration errors, fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
