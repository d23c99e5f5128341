use thiserror::Error;

use crate::classify;

/// Application-wide error types for mailsweep.
///
/// Mirrors the failure taxonomy of the pool: startup failures are retried
/// with backoff, detection and transport failures trigger session rotation,
/// timeouts are recorded without rotation.
#[derive(Error, Debug)]
pub enum AppError {
    /// A session never became ready within the startup budget.
    #[error("session startup failed after {attempts} attempts")]
    StartupFailure { attempts: u32 },

    /// The target service identified and is blocking the automated probe.
    #[error("bot detection: {0}")]
    Detection(String),

    /// Generic automation/network failure while driving a session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The probe exceeded its allotted time.
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// Filesystem failure (profile dirs, result partitions).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Build a transport error, upgrading to [`AppError::Detection`] when the
    /// error text itself carries a known detection marker (e.g. a driver
    /// failing with "no such window" after the portal killed the tab).
    pub fn transport(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify::first_detection_marker("", &message.to_lowercase()) {
            Some(marker) => AppError::Detection(format!("detected_marker:{marker}")),
            None => AppError::Transport(message),
        }
    }

    /// Returns true if this failure was classified as bot detection.
    pub fn is_detection(&self) -> bool {
        matches!(self, AppError::Detection(_))
    }

    /// Returns true if the worker must discard the current session and
    /// retry the task on a fresh one.
    ///
    /// Timeouts deliberately do not rotate: a slow probe does not imply a
    /// compromised session.
    pub fn triggers_rotation(&self) -> bool {
        matches!(self, AppError::Detection(_) | AppError::Transport(_))
    }
}
