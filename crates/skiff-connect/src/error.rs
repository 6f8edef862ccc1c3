//! Connection-level error types.

use skiff_proto::ProtoError;
use thiserror::Error;

/// Errors raised while establishing or using a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport subprocess could not be spawned.
    #[error("failed to spawn transport: {0}")]
    Spawn(std::io::Error),

    /// The handshake with the remote executor failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A protocol-level failure (framing, remote OS error, rejected
    /// field).
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Settings failed validation while resolving defaults.
    #[error(transparent)]
    Settings(#[from] skiff_core::SettingsError),

    /// A remote command exited with a non-zero status while `check`
    /// was requested.
    #[error("command {command:?} failed with exit code {returncode}")]
    CommandFailed {
        /// The executed argv.
        command: Vec<String>,
        /// Captured stdout, if any.
        stdout: Option<Vec<u8>>,
        /// Captured stderr, if any.
        stderr: Option<Vec<u8>>,
        /// The exit code.
        returncode: i32,
    },

    /// A url did not include a scheme.
    #[error("url '{0}' doesn't include a schema")]
    MissingScheme(String),

    /// No connector is registered for the url's scheme.
    #[error("no connector found for schema '{0}'")]
    UnknownScheme(String),

    /// The working directory configured in the defaults is unusable.
    #[error("the selected working directory '{cwd}' {problem}")]
    BadWorkingDirectory {
        /// The configured cwd.
        cwd: String,
        /// What is wrong with it ("doesn't exist", "is not a directory").
        problem: &'static str,
    },

    /// The remote executor payload could not be located.
    #[error(
        "executor binary not found at '{0}'; set SKIFF_EXECUTOR or install skiff-executor next to skiff"
    )]
    MissingExecutor(String),

    /// A controller-side I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// True when this error is the remote's way of saying "no such
    /// file" for a probing request (stat/download on an absent path).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ConnectError::Proto(ProtoError::InvalidField { field, .. }) if field == "path"
        )
    }
}
