//! Settings error types.

use thiserror::Error;

/// Failures loading `~/.envbus/settings.json` or validating the result.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read envbus settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("envbus settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value parsed but is unusable (empty address, zero timeout, ...).
    #[error("invalid envbus setting: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
