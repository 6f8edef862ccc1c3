//! Inventory loading and resolution.
//!
//! The pipeline: normalize declaration sugar, load group variable
//! files, merge `before`/`after` edges symmetrically, reject
//! self-dependencies, rank-sort the dependency graph twice (top-down
//! and bottom-up), then instantiate each host by folding group
//! variables in topological order while watching for assignments whose
//! relative order the graph never fixed.

use crate::decl::{GroupDecl, GroupSugar, HostDecl, HostSugar, InventoryFile};
use crate::error::{InventoryError, VariableConflict};
use crate::model::{Group, Host, Inventory, Vars};
use crate::rank::{rank_sort, transitive_closure, CycleError};
use skiff_connect::extract_hostname;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The name of the synthetic root group.
pub(crate) const ALL_GROUP: &str = "all";

/// Variable injected into the `all` group unless already set; handy
/// in templated config file headers.
const MANAGED_VAR: (&str, &str) = ("skiff_managed", "This file is managed by skiff.");

/// Qualifies a url: anything without a scheme gets `ssh://`.
#[must_use]
pub fn qualify_url(url: &str) -> String {
    if url.contains(':') {
        url.to_owned()
    } else {
        format!("ssh://{url}")
    }
}

/// Loads an inventory from a TOML file.
pub fn load_inventory_file(path: &Path) -> Result<Inventory, InventoryError> {
    let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file: InventoryFile = toml::from_str(&content).map_err(|source| InventoryError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    let base_dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    resolve(file, base_dir, true)
}

/// Synthesizes a one-host ephemeral inventory from a single url, as
/// used for `skiff ssh://root@host deploy.toml`.
pub fn load_single_host(url: &str) -> Result<Inventory, InventoryError> {
    let file = InventoryFile {
        hosts: vec![HostSugar::Url(url.to_owned())],
        groups: Some(Vec::new()),
        groups_dir: "groups".to_owned(),
        hosts_dir: "hosts".to_owned(),
    };
    resolve(file, PathBuf::from("."), false)
}

/// A group declaration unified with the contents of its variable file.
struct GroupData {
    decl: GroupDecl,
    vars: Vars,
    origin: String,
}

fn resolve(
    file: InventoryFile,
    base_dir: PathBuf,
    load_files: bool,
) -> Result<Inventory, InventoryError> {
    // 1. Normalize host declarations: qualify urls, extract names,
    //    reject duplicates.
    let mut host_decls: BTreeMap<String, HostDecl> = BTreeMap::new();
    let mut host_order: Vec<String> = Vec::new();
    for sugar in file.hosts {
        let mut decl = sugar.into_decl();
        decl.url = qualify_url(&decl.url);
        let name = match &decl.name {
            Some(name) => name.clone(),
            None => extract_hostname(&decl.url)?,
        };
        if host_decls.contains_key(&name) {
            return Err(InventoryError::DuplicateHost(name));
        }
        decl.name = Some(name.clone());
        host_order.push(name.clone());
        host_decls.insert(name, decl);
    }

    // 2. Normalize group declarations, synthesizing them from host
    //    membership when omitted, and always injecting `all`.
    let group_sugar = file.groups.unwrap_or_else(|| {
        let mentioned: BTreeSet<String> = host_decls
            .values()
            .flat_map(|h| h.groups.iter().cloned())
            .collect();
        mentioned.into_iter().map(GroupSugar::Name).collect()
    });

    let mut group_data: BTreeMap<String, GroupData> = BTreeMap::new();
    for sugar in group_sugar {
        let decl = sugar.into_decl();
        if group_data.contains_key(&decl.name) {
            return Err(InventoryError::DuplicateGroup(decl.name));
        }
        let name = decl.name.clone();
        group_data.insert(
            name.clone(),
            GroupData {
                decl,
                vars: Vars::new(),
                origin: name,
            },
        );
    }
    group_data.entry(ALL_GROUP.to_owned()).or_insert_with(|| GroupData {
        decl: GroupDecl {
            name: ALL_GROUP.to_owned(),
            file: None,
            after: Vec::new(),
            before: Vec::new(),
        },
        vars: Vars::new(),
        origin: ALL_GROUP.to_owned(),
    });

    // 3. Load group variable files. A file may extend the declared
    //    edges via reserved `before`/`after` keys.
    if load_files {
        let names: Vec<String> = group_data.keys().cloned().collect();
        for name in names {
            let data = group_data.get_mut(&name).expect("group exists");
            let default_path = format!("{}/{name}.toml", file.groups_dir);
            let (path, required) = match &data.decl.file {
                Some(file) => (file.clone(), true),
                None => (default_path, false),
            };
            let full = base_dir.join(&path);
            match load_vars_file(&full, required, &name)? {
                Some(mut vars) => {
                    data.origin = path;
                    data.decl.after.extend(take_str_list(&mut vars, "after"));
                    data.decl.before.extend(take_str_list(&mut vars, "before"));
                    data.vars = vars;
                }
                None => debug!(group = %name, "no variable file"),
            }
        }
    }

    // Give every group but `all` itself an implicit dependency on
    // `all`, making it an ancestor of the whole graph.
    for (name, data) in &mut group_data {
        if name != ALL_GROUP {
            data.decl.after.push(ALL_GROUP.to_owned());
        }
    }

    // `all` carries the managed-files marker unless user defined.
    group_data
        .get_mut(ALL_GROUP)
        .expect("all group exists")
        .vars
        .entry(MANAGED_VAR.0.to_owned())
        .or_insert_with(|| toml::Value::String(MANAGED_VAR.1.to_owned()));

    // 4. Verify every group a host references exists.
    for decl in host_decls.values() {
        for group in &decl.groups {
            if !group_data.contains_key(group) {
                return Err(InventoryError::UnknownGroup {
                    group: group.clone(),
                    host: decl.name.clone().unwrap_or_default(),
                });
            }
        }
    }

    // 5. Merge `before`/`after` edges symmetrically and deduplicate:
    //    if a is in g.before then g is in a.after, and vice versa.
    let names: Vec<String> = group_data.keys().cloned().collect();
    let mut after: BTreeMap<String, BTreeSet<String>> = names
        .iter()
        .map(|n| {
            (
                n.clone(),
                group_data[n].decl.after.iter().cloned().collect(),
            )
        })
        .collect();
    for name in &names {
        for target in &group_data[name].decl.before {
            if let Some(set) = after.get_mut(target) {
                set.insert(name.clone());
            } else {
                return Err(InventoryError::UnknownGroup {
                    group: target.clone(),
                    host: name.clone(),
                });
            }
        }
    }
    // Unknown groups named in `after` are also declaration errors.
    for name in &names {
        for target in &after[name] {
            if !group_data.contains_key(target) {
                return Err(InventoryError::UnknownGroup {
                    group: target.clone(),
                    host: name.clone(),
                });
            }
        }
    }
    let mut before: BTreeMap<String, BTreeSet<String>> =
        names.iter().map(|n| (n.clone(), BTreeSet::new())).collect();
    for name in &names {
        for dep in &after[name] {
            before
                .get_mut(dep)
                .expect("verified above")
                .insert(name.clone());
        }
    }

    // 6. Self-dependencies are always declaration bugs.
    for name in &names {
        if after[name].contains(name) || before[name].contains(name) {
            return Err(InventoryError::SelfDependency(name.clone()));
        }
    }

    // 7. Two-pass rank sort. Predecessors of a group are the groups
    //    it loads after.
    let preds = |g: &str| after[g].iter().cloned().collect::<Vec<_>>();
    let childs = |g: &str| before[g].iter().cloned().collect::<Vec<_>>();
    let ranks_t = rank_sort(&names, &preds, &childs)?;
    let ranks_b = rank_sort(&names, &childs, &preds)?;

    // Any edge that fails to increase the top-down rank is a back
    // edge, which rank_sort itself cannot always see.
    for name in &names {
        for child in &before[name] {
            if ranks_t[child] <= ranks_t[name] {
                return Err(CycleError {
                    vertices: vec![name.clone(), child.clone()],
                }
                .into());
            }
        }
    }

    // Both rankings span the same number of ranks; the longest
    // dependency chain determines it and the dependencies are the
    // same.
    let n_ranks = *ranks_t.values().max().unwrap_or(&0);
    if *ranks_b.values().max().unwrap_or(&0) != n_ranks {
        return Err(CycleError {
            vertices: names.clone(),
        }
        .into());
    }

    let ranks_min = ranks_t;
    let ranks_max: BTreeMap<String, usize> = ranks_b
        .into_iter()
        .map(|(name, rank)| (name, n_ranks - rank))
        .collect();

    let mut topological_order = names.clone();
    topological_order.sort_by_key(|name| (ranks_min[name], name.clone()));

    // 8. Instantiate hosts: fold variables over the transitive
    //    dependency closure in topological order, recording conflicts.
    let mut conflicts: Vec<VariableConflict> = Vec::new();
    let mut hosts: BTreeMap<String, Host> = BTreeMap::new();
    for name in &host_order {
        let decl = &host_decls[name];
        let host = instantiate_host(
            decl,
            &file.hosts_dir,
            &base_dir,
            load_files,
            &group_data,
            &after,
            &topological_order,
            &ranks_min,
            &ranks_max,
            &mut conflicts,
        )?;
        hosts.insert(name.clone(), host);
    }

    if !conflicts.is_empty() {
        // Hosts sharing a group pair report the same conflict; keep
        // each one once.
        let mut seen = BTreeSet::new();
        conflicts.retain(|c| seen.insert((c.variable.clone(), c.first.clone(), c.second.clone())));
        return Err(InventoryError::AmbiguousVariables(conflicts));
    }

    let groups = group_data
        .into_iter()
        .map(|(name, data)| {
            (
                name.clone(),
                Group {
                    name,
                    after: after.remove(&data.decl.name).unwrap_or_default(),
                    before: before.remove(&data.decl.name).unwrap_or_default(),
                    vars: data.vars,
                    origin: data.origin,
                },
            )
        })
        .collect();

    Ok(Inventory {
        base_dir,
        hosts,
        host_order,
        groups,
        topological_order,
        ranks_min,
        ranks_max,
    })
}

#[allow(clippy::too_many_arguments)]
fn instantiate_host(
    decl: &HostDecl,
    hosts_dir: &str,
    base_dir: &Path,
    load_files: bool,
    group_data: &BTreeMap<String, GroupData>,
    after: &BTreeMap<String, BTreeSet<String>>,
    topological_order: &[String],
    ranks_min: &BTreeMap<String, usize>,
    ranks_max: &BTreeMap<String, usize>,
    conflicts: &mut Vec<VariableConflict>,
) -> Result<Host, InventoryError> {
    let name = decl.name.clone().expect("normalized declaration");

    // Every host belongs to `all`.
    let mut groups: BTreeSet<String> = decl.groups.iter().cloned().collect();
    groups.insert(ALL_GROUP.to_owned());

    // All transitive dependencies of the direct groups take part in
    // variable resolution. The merged edge map is authoritative; the
    // raw declarations miss edges contributed via `before`.
    let relevant = transitive_closure(&groups, |g| {
        after
            .get(g)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    });

    let mut vars = Vars::new();
    let mut history: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for group in topological_order.iter().filter(|g| relevant.contains(*g)) {
        let data = &group_data[group];
        for (key, value) in &data.vars {
            // A group may overwrite a variable only when every
            // previous definer is ordered strictly before it; the
            // iteration is already topological, so trouble arises
            // exactly when a previous definer's latest possible rank
            // reaches this group's earliest one.
            if let Some(previous) = history.get(key) {
                for prev in previous {
                    if ranks_max[prev] >= ranks_min[group] {
                        conflicts.push(VariableConflict {
                            variable: key.clone(),
                            first: group_data[prev].origin.clone(),
                            second: data.origin.clone(),
                        });
                    }
                }
            }
            history.entry(key.clone()).or_default().push(group.clone());
            vars.insert(key.clone(), value.clone());
        }
    }

    // Host variables fold on top with the highest priority.
    let mut url = decl.url.clone();
    let mut ssh_opts = Vec::new();
    if load_files {
        let default_path = format!("{hosts_dir}/{name}.toml");
        let (path, required) = match &decl.file {
            Some(file) => (file.clone(), true),
            None => (default_path, false),
        };
        if let Some(mut host_vars) = load_vars_file(&base_dir.join(&path), required, &name)? {
            // Reserved keys steer the connection rather than becoming
            // variables.
            if let Some(toml::Value::String(u)) = host_vars.remove("url") {
                url = qualify_url(&u);
            }
            ssh_opts = take_str_list(&mut host_vars, "ssh_opts");
            for (key, value) in host_vars {
                history.entry(key.clone()).or_default().push(path.clone());
                vars.insert(key, value);
            }
        }
    }

    Ok(Host {
        name,
        url,
        groups,
        vars,
        ssh_opts,
        variable_history: history,
    })
}

/// Reads a TOML variable file into a table. A missing file is fine
/// unless it was named explicitly.
fn load_vars_file(
    path: &Path,
    required: bool,
    owner: &str,
) -> Result<Option<Vars>, InventoryError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if required {
                return Err(InventoryError::MissingModuleFile {
                    file: path.display().to_string(),
                    name: owner.to_owned(),
                });
            }
            return Ok(None);
        }
        Err(source) => {
            return Err(InventoryError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let value: toml::Value = toml::from_str(&content).map_err(|source| InventoryError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    match value {
        toml::Value::Table(table) => Ok(Some(table.into_iter().collect())),
        _ => Ok(Some(Vars::new())),
    }
}

/// Removes a reserved string-list key from a variable table.
fn take_str_list(vars: &mut Vars, key: &str) -> Vec<String> {
    match vars.remove(key) {
        Some(toml::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn load(dir: &TempDir) -> Result<Inventory, InventoryError> {
        load_inventory_file(&dir.path().join("inventory.toml"))
    }

    #[test]
    fn test_qualify_url() {
        assert_eq!(qualify_url("example.com"), "ssh://example.com");
        assert_eq!(qualify_url("root@example.com"), "ssh://root@example.com");
        assert_eq!(qualify_url("ssh://x"), "ssh://x");
        assert_eq!(qualify_url("local:"), "local:");
    }

    #[test]
    fn test_single_host_inventory() {
        let inventory = load_single_host("root@example.com").unwrap();
        assert_eq!(inventory.host_order, vec!["example.com"]);
        let host = inventory.host("example.com").unwrap();
        assert_eq!(host.url, "ssh://root@example.com");
        assert!(host.groups.contains("all"));
        assert_eq!(inventory.topological_order, vec!["all"]);
    }

    #[test]
    fn test_basic_load_with_groups_and_vars() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = [{ url = "local:", groups = ["desktops"] }]
            groups = [{ name = "desktops" }]
            "#,
        );
        write(&dir, "groups/all.toml", "editor = \"vi\"\n");
        write(&dir, "groups/desktops.toml", "editor = \"emacs\"\n");
        write(&dir, "hosts/localhost.toml", "hostname_pretty = \"box\"\n");

        let inventory = load(&dir).unwrap();
        let host = inventory.host("localhost").unwrap();
        // desktops depends on all, so its definition wins unambiguously.
        assert_eq!(host.vars["editor"].as_str(), Some("emacs"));
        assert_eq!(host.vars["hostname_pretty"].as_str(), Some("box"));
        assert_eq!(
            host.variable_history["editor"],
            vec!["all".to_owned(), "desktops".to_owned()]
        );
        // The managed marker is injected on `all`.
        assert!(host.vars["skiff_managed"].as_str().unwrap().contains("skiff"));
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"hosts = ["ssh://a@h", "ssh://b@h"]"#,
        );
        let err = load(&dir).unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateHost(name) if name == "h"));
    }

    #[test]
    fn test_unknown_group_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = [{ url = "local:", groups = ["ghosts"] }]
            groups = []
            "#,
        );
        let err = load(&dir).unwrap_err();
        assert!(matches!(err, InventoryError::UnknownGroup { group, .. } if group == "ghosts"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = ["local:"]
            groups = [{ name = "a", after = ["a"] }]
            "#,
        );
        let err = load(&dir).unwrap_err();
        assert!(matches!(err, InventoryError::SelfDependency(name) if name == "a"));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = ["local:"]
            groups = [
                { name = "a", after = ["b"] },
                { name = "b", after = ["a"] },
            ]
            "#,
        );
        let err = load(&dir).unwrap_err();
        match err {
            InventoryError::Cycle(cycle) => {
                assert!(cycle.vertices.contains(&"a".to_owned()));
                assert!(cycle.vertices.contains(&"b".to_owned()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_before_after_edges_merge() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = [{ url = "local:", groups = ["site"] }]
            groups = [
                { name = "base", before = ["site"] },
                { name = "site" },
            ]
            "#,
        );
        let inventory = load(&dir).unwrap();
        // base declared before=[site], so site.after must contain base.
        assert!(inventory.groups["site"].after.contains("base"));
        assert!(inventory.groups["base"].before.contains("site"));
        let site_pos = inventory
            .topological_order
            .iter()
            .position(|g| g == "site")
            .unwrap();
        let base_pos = inventory
            .topological_order
            .iter()
            .position(|g| g == "base")
            .unwrap();
        assert!(base_pos < site_pos);
        assert_eq!(inventory.topological_order[0], "all");
    }

    #[test]
    fn test_ambiguous_variable_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = [{ url = "local:", groups = ["g1", "g2"] }]
            groups = ["g1", "g2"]
            "#,
        );
        write(&dir, "groups/g1.toml", "foo = 1\n");
        write(&dir, "groups/g2.toml", "foo = 2\n");

        let err = load(&dir).unwrap_err();
        match err {
            InventoryError::AmbiguousVariables(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].variable, "foo");
                let pair = [conflicts[0].first.clone(), conflicts[0].second.clone()];
                assert!(pair.contains(&"groups/g1.toml".to_owned()));
                assert!(pair.contains(&"groups/g2.toml".to_owned()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_chain_ordered_variable_is_allowed() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = [{ url = "local:", groups = ["g1", "g2"] }]
            groups = ["g1", { name = "g2", after = ["g1"] }]
            "#,
        );
        write(&dir, "groups/g1.toml", "foo = 1\n");
        write(&dir, "groups/g2.toml", "foo = 2\n");

        let inventory = load(&dir).unwrap();
        let host = inventory.host("localhost").unwrap();
        assert_eq!(host.vars["foo"].as_integer(), Some(2));
        assert_eq!(
            host.variable_history["foo"],
            vec!["g1".to_owned(), "g2".to_owned()]
        );
    }

    #[test]
    fn test_unrelated_hosts_do_not_see_each_others_groups() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = [
                { url = "ssh://web", groups = ["g1"] },
                { url = "ssh://db", groups = ["g2"] },
            ]
            groups = ["g1", "g2"]
            "#,
        );
        write(&dir, "groups/g1.toml", "foo = 1\n");
        write(&dir, "groups/g2.toml", "foo = 2\n");

        // Both groups define foo, but no host includes both, so no
        // conflict exists.
        let inventory = load(&dir).unwrap();
        assert_eq!(
            inventory.host("web").unwrap().vars["foo"].as_integer(),
            Some(1)
        );
        assert_eq!(
            inventory.host("db").unwrap().vars["foo"].as_integer(),
            Some(2)
        );
    }

    #[test]
    fn test_host_file_overrides_url_and_ssh_opts() {
        let dir = TempDir::new().unwrap();
        write(&dir, "inventory.toml", r#"hosts = ["ssh://web"]"#);
        write(
            &dir,
            "hosts/web.toml",
            r#"
            url = "root@web.internal"
            ssh_opts = ["-p", "2222"]
            role = "frontend"
            "#,
        );
        let inventory = load(&dir).unwrap();
        let host = inventory.host("web").unwrap();
        assert_eq!(host.url, "ssh://root@web.internal");
        assert_eq!(host.ssh_opts, vec!["-p", "2222"]);
        assert_eq!(host.vars["role"].as_str(), Some("frontend"));
    }

    #[test]
    fn test_explicit_missing_module_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"hosts = [{ url = "local:", file = "hosts/special.toml" }]"#,
        );
        let err = load(&dir).unwrap_err();
        assert!(matches!(err, InventoryError::MissingModuleFile { .. }));
    }

    #[test]
    fn test_group_file_extends_edges() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = [{ url = "local:", groups = ["app"] }]
            groups = ["base", "app"]
            "#,
        );
        write(&dir, "groups/app.toml", "after = [\"base\"]\nfoo = 2\n");
        write(&dir, "groups/base.toml", "foo = 1\n");
        let inventory = load(&dir).unwrap();
        assert!(inventory.groups["app"].after.contains("base"));
        assert_eq!(
            inventory.host("localhost").unwrap().vars["foo"].as_integer(),
            Some(2)
        );
    }

    #[test]
    fn test_ranks_min_max_bound_each_other() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "inventory.toml",
            r#"
            hosts = ["local:"]
            groups = ["a", { name = "b", after = ["a"] }, "c"]
            "#,
        );
        let inventory = load(&dir).unwrap();
        for group in inventory.groups.keys() {
            assert!(
                inventory.ranks_min[group] <= inventory.ranks_max[group],
                "group {group}"
            );
        }
        // all is pinned to rank 0 everywhere.
        assert_eq!(inventory.ranks_min["all"], 0);
        assert_eq!(inventory.ranks_max["all"], 0);
        // c is unconstrained between a/b, so its rank range is wide.
        assert!(inventory.ranks_min["c"] < inventory.ranks_max["c"]);
    }
}
