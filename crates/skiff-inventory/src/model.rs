//! The resolved inventory model.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Variables attached to a host or group: an arbitrary TOML table.
pub type Vars = BTreeMap<String, toml::Value>;

/// A fully resolved host.
#[derive(Debug, Clone)]
pub struct Host {
    /// The unique host name.
    pub name: String,
    /// The qualified transport url.
    pub url: String,
    /// All groups this host belongs to, including `all`.
    pub groups: BTreeSet<String>,
    /// The folded variable set (groups in topological order, host
    /// variables on top).
    pub vars: Vars,
    /// Extra ssh options for this host (host variable `ssh_opts`).
    pub ssh_opts: Vec<String>,
    /// For each variable, the ordered list of modules that assigned
    /// it. Useful for inventory introspection.
    pub variable_history: BTreeMap<String, Vec<String>>,
}

/// A resolved group.
#[derive(Debug, Clone)]
pub struct Group {
    /// The unique group name.
    pub name: String,
    /// Groups that load before this one (dependencies).
    pub after: BTreeSet<String>,
    /// Groups that load after this one (dependents).
    pub before: BTreeSet<String>,
    /// The group's own variables.
    pub vars: Vars,
    /// Where the variables came from, for error messages.
    pub origin: String,
}

/// The resolved root of a run: all hosts and groups plus the derived
/// ordering data.
#[derive(Debug, Clone)]
pub struct Inventory {
    /// The directory declaration-relative paths resolve against.
    pub base_dir: PathBuf,
    /// All hosts by name.
    pub hosts: BTreeMap<String, Host>,
    /// Host names in declaration order.
    pub host_order: Vec<String>,
    /// All groups by name (`all` always present).
    pub groups: BTreeMap<String, Group>,
    /// A valid topological order of all groups.
    pub topological_order: Vec<String>,
    /// The earliest position each group may occupy in any valid order.
    pub ranks_min: BTreeMap<String, usize>,
    /// The latest position each group may occupy in any valid order.
    pub ranks_max: BTreeMap<String, usize>,
}

impl Inventory {
    /// Looks up a host by name.
    #[must_use]
    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }
}
