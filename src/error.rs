// src/error.rs

//! Unified error handling for the harvester.

use std::fmt;

use thiserror::Error;

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream payload or markup could not be parsed
    #[error("Parse error for {context}: {message}")]
    Parse { context: String, message: String },

    /// Upstream API answered with a non-success status
    #[error("API error ({status}) for {endpoint}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Stored collection does not match its manifest
    #[error("Corrupt collection {collection}: {message}")]
    Corrupt { collection: String, message: String },

    /// Loader was configured for a record type it cannot handle
    #[error("{loader} loader does not support record type '{record_type}'")]
    Unsupported { loader: String, record_type: String },

    /// Background loader task panicked or could not be joined
    #[error("Loader task failed: {0}")]
    Task(String),

    /// Work was cancelled by a stop request
    #[error("Interrupted")]
    Interrupted,
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a parse error with context.
    pub fn parse(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a corrupt collection error.
    pub fn corrupt(collection: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::Corrupt {
            collection: collection.to_string(),
            message: message.to_string(),
        }
    }

    /// True when this error is a cancellation that must reach the supervisor.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_is_flagged() {
        assert!(AppError::Interrupted.is_interrupted());
        assert!(!AppError::config("missing").is_interrupted());
    }

    #[test]
    fn test_display_includes_context() {
        let err = AppError::parse("listing page", "missing data-timestamp");
        assert_eq!(
            err.to_string(),
            "Parse error for listing page: missing data-timestamp"
        );
    }
}
