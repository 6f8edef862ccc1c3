//! Operation errors.

use skiff_connect::ConnectError;
use thiserror::Error;

/// Errors raised while executing an operation.
#[derive(Debug, Error)]
pub enum OpError {
    /// The operation declared failure (wrong remote object type, no
    /// usable backend, refused update, ...). With `check` enabled
    /// this aborts the script.
    #[error("{0}")]
    Failure(String),

    /// An operation parameter was invalid before anything touched the
    /// remote.
    #[error("{0}")]
    Parameter(String),

    /// Template rendering failed.
    #[error("error while templating {source_name}: {message}")]
    Template {
        /// The template's origin (file or "<inline>").
        source_name: String,
        /// What went wrong.
        message: String,
    },

    /// A connection-level failure, including remote OS errors and
    /// non-zero exits of checked commands.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Settings failed validation.
    #[error(transparent)]
    Settings(#[from] skiff_core::SettingsError),

    /// The operation framework was used incorrectly. Always a bug in
    /// the operation, not in the deploy.
    #[error("operation api misuse: {0}")]
    Api(&'static str),

    /// A controller-side I/O error (reading a local source file).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
