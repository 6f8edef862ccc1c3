//! Backend registries for the polymorphic package and service
//! operations.
//!
//! The facades probe the remote for known commands in a fixed
//! preference order and dispatch to the first backend whose command
//! exists. The tables are constants populated at compile time; there
//! is no registration at import time.

use crate::context::RunContext;
use crate::error::OpError;
use crate::op::OperationResult;
use crate::system::{PackageParams, ServiceParams};
use crate::{apt, pacman, portage, systemd};

/// A package operation backend.
pub type PackageBackend =
    fn(&mut RunContext<'_>, &PackageParams) -> Result<OperationResult, OpError>;

/// A service operation backend.
pub type ServiceBackend =
    fn(&mut RunContext<'_>, &ServiceParams) -> Result<OperationResult, OpError>;

/// Known package managers, probed in order.
pub const PACKAGE_MANAGERS: &[(&str, PackageBackend)] = &[
    ("pacman", pacman::package),
    ("apt-get", apt::package),
    ("emerge", portage::package),
];

/// Known service managers, probed in order.
pub const SERVICE_MANAGERS: &[(&str, ServiceBackend)] = &[("systemctl", systemd::service)];

/// Finds the first backend whose probe command exists on the remote,
/// using `command -v` through the shell.
pub fn find_command<'t, T>(
    ctx: &mut RunContext<'_>,
    table: &'t [(&'static str, T)],
) -> Result<Option<&'t T>, OpError> {
    for (command, backend) in table {
        let probe = format!("command -v -- {command}");
        let result = ctx.run_unchecked(&["sh", "-c", &probe])?;
        if result.returncode == 0 {
            return Ok(Some(backend));
        }
    }
    Ok(None)
}

/// The probe commands of a table, for error messages.
pub fn searched_commands<T>(table: &[(&'static str, T)]) -> Vec<&'static str> {
    table.iter().map(|(command, _)| *command).collect()
}
