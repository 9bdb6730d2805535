//! Error types for the headless crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeadlessError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("failed to create page: {0}")]
    PageCreation(String),
    #[error("failed to close page: {0}")]
    PageClose(String),
    #[error("failed to close browser: {0}")]
    BrowserClose(String),
    #[error("failed to query browser pages: {0}")]
    PageQuery(String),
    #[error("configuration error in `{field}`: {message}")]
    Config { field: &'static str, message: String },
    #[error("browser pool has been destroyed")]
    Destroyed,
    #[error("{0}")]
    Other(String),
}

impl HeadlessError {
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }
}
