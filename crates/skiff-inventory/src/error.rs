//! Inventory load errors.

use crate::rank::CycleError;
use thiserror::Error;

/// One ambiguous variable assignment: two definers whose relative
/// order the declared dependencies never fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableConflict {
    /// The variable both modules assign.
    pub variable: String,
    /// The earlier definer (group name or file).
    pub first: String,
    /// The later definer.
    pub second: String,
}

/// Errors raised while loading an inventory.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// A declaration file could not be read.
    #[error("failed to read '{path}': {source}")]
    Read {
        /// The offending file.
        path: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A declaration file could not be parsed.
    #[error("failed to parse '{path}': {source}")]
    Parse {
        /// The offending file.
        path: String,
        /// The underlying parse error.
        source: toml::de::Error,
    },

    /// Two host declarations share a name.
    #[error("duplicate host '{0}'")]
    DuplicateHost(String),

    /// Two group declarations share a name.
    #[error("duplicate group '{0}'")]
    DuplicateGroup(String),

    /// A host references a group no declaration defines.
    #[error("unknown group '{group}' used in declaration of host '{host}'")]
    UnknownGroup {
        /// The undefined group.
        group: String,
        /// The referencing host.
        host: String,
    },

    /// A group lists itself in `before` or `after`.
    #[error("group '{0}' must not depend on itself")]
    SelfDependency(String),

    /// The group dependencies contain a cycle.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// Variable assignments with ambiguous evaluation order. All
    /// conflicts found during a load are collected before failing.
    #[error(
        "found conflicting variable assignments from groups with ambiguous evaluation order; \
         insert a group dependency or remove one definition: {}",
        render_conflicts(.0)
    )]
    AmbiguousVariables(Vec<VariableConflict>),

    /// A declaration explicitly named a variable file that is absent.
    #[error("module file '{file}' for '{name}' doesn't exist")]
    MissingModuleFile {
        /// The declared file.
        file: String,
        /// The host or group that declared it.
        name: String,
    },

    /// A url could not be parsed or matched to a connector.
    #[error("invalid host url: {0}")]
    Url(#[from] skiff_connect::ConnectError),
}

fn render_conflicts(conflicts: &[VariableConflict]) -> String {
    conflicts
        .iter()
        .map(|c| {
            format!(
                "definition of '{}' in '{}' conflicts with definition in '{}'",
                c.variable, c.second, c.first
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
