//! Inventory declaration files.
//!
//! The on-disk format is TOML. Hosts and groups accept sugar forms: a
//! bare string is shorthand for a declaration with only the
//! url/name set. All sugar is normalized into the canonical
//! [`HostDecl`]/[`GroupDecl`] records before resolution.

use serde::Deserialize;

/// A declaration of a host in an inventory.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HostDecl {
    /// The url used to connect to this host. Urls without a scheme
    /// are qualified with `ssh://`.
    pub url: String,

    /// The name used to refer to this host. Extracted from the
    /// qualified url by the responsible connector when absent.
    #[serde(default)]
    pub name: Option<String>,

    /// The variable file for this host, relative to the inventory.
    /// Defaults to `{hosts_dir}/{name}.toml`, which is optional; an
    /// explicitly given file must exist.
    #[serde(default)]
    pub file: Option<String>,

    /// The groups this host belongs to. Duplicates are ignored; every
    /// host is always a member of `all`.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// A declaration of a group in an inventory.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GroupDecl {
    /// The name used to refer to this group.
    pub name: String,

    /// The variable file for this group, relative to the inventory.
    /// Defaults to `{groups_dir}/{name}.toml`, which is optional; an
    /// explicitly given file must exist.
    #[serde(default)]
    pub file: Option<String>,

    /// Groups that must be loaded before this one. `all` is an
    /// implicit member for every group but `all` itself.
    #[serde(default)]
    pub after: Vec<String>,

    /// Groups that must be loaded after this one.
    #[serde(default)]
    pub before: Vec<String>,
}

/// Host declaration sugar: a bare url string or a full table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HostSugar {
    /// `"ssh://root@example.com"`
    Url(String),
    /// `{ url = "...", name = "...", groups = [...] }`
    Full(HostDecl),
}

impl HostSugar {
    /// Normalizes into the canonical record.
    #[must_use]
    pub fn into_decl(self) -> HostDecl {
        match self {
            HostSugar::Url(url) => HostDecl {
                url,
                name: None,
                file: None,
                groups: Vec::new(),
            },
            HostSugar::Full(decl) => decl,
        }
    }
}

/// Group declaration sugar: a bare name string or a full table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GroupSugar {
    /// `"desktops"`
    Name(String),
    /// `{ name = "desktops", after = ["archlinux"] }`
    Full(GroupDecl),
}

impl GroupSugar {
    /// Normalizes into the canonical record.
    #[must_use]
    pub fn into_decl(self) -> GroupDecl {
        match self {
            GroupSugar::Name(name) => GroupDecl {
                name,
                file: None,
                after: Vec::new(),
                before: Vec::new(),
            },
            GroupSugar::Full(decl) => decl,
        }
    }
}

fn default_groups_dir() -> String {
    "groups".to_owned()
}

fn default_hosts_dir() -> String {
    "hosts".to_owned()
}

/// The root of an inventory file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryFile {
    /// The declared hosts.
    pub hosts: Vec<HostSugar>,

    /// The declared groups. When omitted, the set of groups mentioned
    /// across hosts is used.
    #[serde(default)]
    pub groups: Option<Vec<GroupSugar>>,

    /// Directory searched for group variable files.
    #[serde(default = "default_groups_dir")]
    pub groups_dir: String,

    /// Directory searched for host variable files.
    #[serde(default = "default_hosts_dir")]
    pub hosts_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sugar_and_full_forms() {
        let inventory: InventoryFile = toml::from_str(
            r#"
            hosts = [
                "local:",
                { url = "ssh://root@web.example.com", name = "web", groups = ["servers"] },
            ]
            groups = [
                "archlinux",
                { name = "servers", after = ["archlinux"] },
            ]
            "#,
        )
        .unwrap();

        let hosts: Vec<HostDecl> = inventory.hosts.into_iter().map(HostSugar::into_decl).collect();
        assert_eq!(hosts[0].url, "local:");
        assert_eq!(hosts[1].name.as_deref(), Some("web"));
        assert_eq!(hosts[1].groups, vec!["servers"]);

        let groups: Vec<GroupDecl> = inventory
            .groups
            .unwrap()
            .into_iter()
            .map(GroupSugar::into_decl)
            .collect();
        assert_eq!(groups[0].name, "archlinux");
        assert_eq!(groups[1].after, vec!["archlinux"]);
    }

    #[test]
    fn test_groups_may_be_omitted() {
        let inventory: InventoryFile = toml::from_str(r#"hosts = ["local:"]"#).unwrap();
        assert!(inventory.groups.is_none());
        assert_eq!(inventory.groups_dir, "groups");
        assert_eq!(inventory.hosts_dir, "hosts");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<InventoryFile, _> = toml::from_str(
            r#"
            hosts = ["local:"]
            bogus = 1
            "#,
        );
        assert!(result.is_err());
    }
}
