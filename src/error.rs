//! Error handling for the download pipeline.
//!
//! Core components return [`DownloadError`], whose variants decide how far an
//! error may travel: per-item errors stop at the item, chat errors stop at the
//! chat, configuration errors stop the run. The outer command layer uses
//! `anyhow` with the context helpers below.

use anyhow::{Context, Result};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Invalid merged settings. Fatal to the run before any chat starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transient network/API fault. Retried at the item level.
    #[error("transport error: {0}")]
    Transport(String),

    /// The chat as a whole cannot be read (permission revoked, deleted, banned).
    #[error("chat is not accessible: {0}")]
    Authorization(String),

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Not a failure: shutdown was requested.
    #[error("interrupted by shutdown request")]
    Interrupted,
}

impl DownloadError {
    pub fn config(msg: impl Into<String>) -> Self {
        DownloadError::Config(msg.into())
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Errors that end the loop for one chat without touching other chats.
    pub fn is_chat_fatal(&self) -> bool {
        matches!(self, DownloadError::Authorization(_))
    }

    /// Errors worth another attempt within the same run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Transport(_))
    }
}

/// Extension trait to add operator-facing context to errors.
pub trait TgErrorContext<T> {
    /// Add context for authorization check.
    fn context_auth_check(self) -> Result<T>;

    /// Add context for reading the configuration file.
    fn context_config_load(self, path: &str) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> TgErrorContext<T>
    for std::result::Result<T, E>
{
    fn context_auth_check(self) -> Result<T> {
        self.context("Failed to check authorization status")
    }

    fn context_config_load(self, path: &str) -> Result<T> {
        self.with_context(|| format!("Failed to load configuration from {}", path))
    }
}
