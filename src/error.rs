//! Application-wide error types.
//!
//! This module provides the error hierarchy for failures that are *not* part
//! of normal protocol usage: I/O, storage corruption, unreadable audio.
//! Expected domain failures (unknown song, duplicate playlist, bad
//! credentials...) live next to the component that raises them
//! ([`CatalogError`](crate::catalog::CatalogError),
//! [`AccountError`](crate::accounts::AccountError),
//! [`SessionError`](crate::session::SessionError)) and never become an
//! [`Error`].
//!
//! CLI/main uses `anyhow` for convenient error propagation.

use std::path::PathBuf;

/// Application-wide result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level application error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File or socket I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Catalog (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A backing store exists but cannot be used
    #[error("Storage error for {path}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Audio source could not be opened or read
    #[error("Audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a storage error.
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an audio error.
    pub fn audio(message: impl Into<String>) -> Self {
        Self::Audio(message.into())
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Add context to an error.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error result.
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, serde_json::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Json(e).context(ctx))
    }
}
