//! Streaming speech-recognition server
//!
//! Provides the per-connection session state machine, the metrics facade,
//! and the WebSocket + one-shot HTTP transports over the pipeline crate.

pub mod http;
pub mod metrics;
pub mod session;
pub mod state;
pub mod websocket;

pub use self::http::create_router;
pub use self::metrics::init_metrics;
pub use self::session::{AsrSession, MessageKind, OutMessage, SessionConfig};
pub use self::state::AppState;

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] asr_config::ConfigError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] asr_pipeline::PipelineError),

    #[error("Startup error: {0}")]
    Startup(String),
}

impl ServerError {
    /// Process exit code: 2 for configuration errors, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}
