//! Error types for chartdoc.
//!
//! Library crates use [`ChartDocError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all chartdoc operations.
#[derive(Debug, thiserror::Error)]
pub enum ChartDocError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an upstream service.
    #[error("network error: {0}")]
    Network(String),

    /// Markup, XML, or response-shape parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Ledger, cache, or database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Language-model call or answer error.
    #[error("language model error: {0}")]
    Llm(String),

    /// Help-center publishing error.
    #[error("publish error: {0}")]
    Publish(String),

    /// The requested view does not exist in the workbook.
    #[error("view not found: {view}")]
    ViewNotFound { view: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad request, empty key, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ChartDocError>;

impl ChartDocError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Signal that `view` is absent from a workbook.
    pub fn view_not_found(view: impl Into<String>) -> Self {
        Self::ViewNotFound { view: view.into() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = ChartDocError::config("missing OPENAI_API_KEY");
        assert_eq!(err.to_string(), "config error: missing OPENAI_API_KEY");

        let err = ChartDocError::view_not_found("Monthly Output");
        assert_eq!(err.to_string(), "view not found: Monthly Output");
    }
}
