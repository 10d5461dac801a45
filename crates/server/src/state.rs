//! Application state
//!
//! Shared state across all handlers. The recognizer pool and the metrics
//! registry are the only shared-mutable state crossing connections;
//! everything else is per-connection.

use std::sync::Arc;

use asr_config::Settings;
use asr_pipeline::{Recognizer, VadConfig};
use tokio::sync::Semaphore;

use crate::session::SessionConfig;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration (validated)
    pub config: Arc<Settings>,
    /// Recognizer pool, shared by all connections
    pub recognizer: Arc<Recognizer>,
    /// Admission bound for one-shot requests
    pub request_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Settings, recognizer: Arc<Recognizer>) -> Self {
        let permits = config.limits.max_concurrent_requests.max(1);
        Self {
            config: Arc::new(config),
            recognizer,
            request_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn vad_config(&self) -> VadConfig {
        VadConfig {
            model_path: self.config.models.vad.clone(),
            threshold: self.config.vad.threshold,
            min_silence_duration: self.config.vad.min_silence,
            min_speech_duration: self.config.vad.min_speech,
            max_speech_duration: self.config.vad.max_speech,
            sample_rate: self.config.asr.sample_rate,
            window_size: self.config.vad.window_size,
            context_size: self.config.vad.context_size,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from(&*self.config)
    }
}
