// src/error.rs
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the exporter library
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Error type for the exporter library
#[derive(Error, Debug)]
pub enum ExporterError {
    /// The collector ran but had nothing to report
    #[error("collector returned no data")]
    NoData,

    /// The remote platform answered with a non-success status
    #[error("{context}: upstream returned status {status}: {message}")]
    Upstream {
        context: String,
        status: u16,
        message: String,
    },

    /// The HTTP request never produced a response
    #[error("{context}: transport error: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("event subscriptions are not configured")]
    NotConfigured,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("collector did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Exposition error: {0}")]
    Exposition(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ExporterError {
    /// Build an upstream error from a response status and the provider's message
    pub fn upstream(context: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        ExporterError::Upstream {
            context: context.into(),
            status,
            message: message.into(),
        }
    }

    /// Wrap a transport failure with the operation it interrupted
    pub fn transport(context: impl Into<String>, source: reqwest::Error) -> Self {
        ExporterError::Transport {
            context: context.into(),
            source,
        }
    }

    /// Whether this is the "intentionally idle" outcome rather than a failure
    pub fn is_no_data(&self) -> bool {
        matches!(self, ExporterError::NoData)
    }

    /// Whether the platform rejected the credentials
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ExporterError::Upstream { status: 401, .. })
    }
}
