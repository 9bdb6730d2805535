//! Error types for the monitoring crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitoringError {
    /// Configuration rejected at construction time
    #[error("configuration error in `{field}`: {message}")]
    Config { field: &'static str, message: String },

    /// A single sampling pass failed; the sampler logs this and keeps going
    #[error("sampling error: {message}")]
    Sample { message: String },
}

impl MonitoringError {
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }

    pub fn sample(message: impl Into<String>) -> Self {
        Self::Sample {
            message: message.into(),
        }
    }
}
