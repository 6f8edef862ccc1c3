//! Locating and packaging the remote executor.
//!
//! No prior installation on the target is assumed: the ssh connector
//! ships the entire `skiff-executor` binary inline as a base64+gzip
//! blob, decoded into a temp file and executed by the remote shell.
//! The controller and target must be the same architecture; for cross
//! setups `SKIFF_EXECUTOR` points at a binary built for the target.

use crate::error::ConnectError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::PathBuf;

/// Environment variable overriding the executor binary location.
pub const EXECUTOR_ENV: &str = "SKIFF_EXECUTOR";

/// Name of the executor binary when located next to the controller.
const EXECUTOR_NAME: &str = "skiff-executor";

/// Finds the executor binary: `$SKIFF_EXECUTOR` if set, otherwise
/// `skiff-executor` in the controller binary's directory.
pub fn executor_path() -> Result<PathBuf, ConnectError> {
    if let Some(path) = std::env::var_os(EXECUTOR_ENV) {
        return Ok(PathBuf::from(path));
    }
    let mut path = std::env::current_exe()?;
    path.set_file_name(EXECUTOR_NAME);
    if path.is_file() {
        Ok(path)
    } else {
        Err(ConnectError::MissingExecutor(
            path.to_string_lossy().into_owned(),
        ))
    }
}

/// Compresses and base64-encodes the executor binary.
pub fn encode_payload(binary: &[u8]) -> Result<String, ConnectError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(binary)?;
    Ok(BASE64.encode(encoder.finish()?))
}

/// Builds the shell command executed on the remote to unpack and run
/// the executor. The base64 alphabet is shell-quote safe.
pub fn bootstrap_command(payload_b64: &str, debug: bool) -> String {
    let debug_flag = if debug { " --debug" } else { "" };
    format!(
        "p=$(mktemp) && echo '{payload_b64}' | base64 -d | gzip -d > \"$p\" && \
         chmod 700 \"$p\" && \"$p\"{debug_flag}; r=$?; rm -f \"$p\"; exit $r"
    )
}
