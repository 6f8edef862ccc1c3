//! Top-level run orchestration: load inventories, connect to each
//! selected host, run the deploy script.

use crate::render::ConsoleReporter;
use crate::script::{flatten_vars, ScriptRunner};
use crate::Cli;
use anyhow::{anyhow, bail, Context, Result};
use skiff_connect::{connector_for_url, Connection, ConnectorOptions};
use skiff_inventory::resolve::{load_inventory_file, load_single_host};
use skiff_inventory::{Host, Inventory};
use skiff_ops::{OpFlags, RunContext, VarExpand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads the inventory arguments: either one inventory file, or any
/// number of single-host urls merged into one ephemeral inventory.
fn load_inventories(args: &[String]) -> Result<Inventory> {
    let is_file = |arg: &String| arg.ends_with(".toml");

    if args.iter().any(is_file) {
        if args.len() > 1 {
            bail!("an inventory file must be the only inventory argument");
        }
        return Ok(load_inventory_file(Path::new(&args[0]))?);
    }

    // Merge single-host inventories; duplicates are declaration bugs.
    let mut merged: Option<Inventory> = None;
    for url in args {
        let inventory = load_single_host(url)?;
        match &mut merged {
            None => merged = Some(inventory),
            Some(merged) => {
                for name in inventory.host_order {
                    let host = inventory.hosts[&name].clone();
                    if merged.hosts.insert(name.clone(), host).is_some() {
                        bail!("duplicate host '{name}'");
                    }
                    merged.host_order.push(name);
                }
            }
        }
    }
    merged.ok_or_else(|| anyhow!("no inventory was given"))
}

/// Resolves the `-H` selection against the inventory: deduplicated,
/// sorted, unknown names fatal.
fn select_hosts(inventory: &Inventory, selection: Option<&str>) -> Result<Vec<String>> {
    let mut names: Vec<String> = match selection {
        None => inventory.host_order.clone(),
        Some(csv) => {
            let mut names = Vec::new();
            for name in csv.split(',').filter(|n| !n.is_empty()) {
                if inventory.host(name).is_none() {
                    bail!("unknown host '{name}'");
                }
                if !names.contains(&name.to_owned()) {
                    names.push(name.to_owned());
                }
            }
            names
        }
    };
    names.sort();
    names.dedup();
    Ok(names)
}

fn host_template_vars(host: &Host) -> BTreeMap<String, String> {
    let mut vars = flatten_vars(&host.vars);
    vars.insert("host".to_owned(), host.name.clone());
    vars
}

/// Runs the deploy script on every selected host, serially.
pub fn main_run(cli: &Cli) -> Result<()> {
    let script = cli
        .script
        .as_deref()
        .ok_or_else(|| anyhow!("missing deploy script argument"))?;
    let script_path = PathBuf::from(script);
    let deploy_root = script_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let inventory = load_inventories(&cli.inventory)?;
    let host_names = select_hosts(&inventory, cli.hosts.as_deref())?;

    let mut reporter = ConsoleReporter::new(
        if cli.debug { u8::MAX } else { cli.verbose },
        !cli.no_changes,
        cli.diff,
        cli.dry,
    );
    let engine = VarExpand;
    let flags = OpFlags {
        dry_run: cli.dry,
        diffs: cli.diff,
    };

    for (index, name) in host_names.iter().enumerate() {
        let host = inventory
            .host(name)
            .expect("selection is validated against the inventory");
        reporter.host(&host.name);

        let connector = connector_for_url(
            &host.url,
            ConnectorOptions {
                ssh_opts: host.ssh_opts.clone(),
                debug: cli.debug,
            },
        )?;
        let mut conn = Connection::open(connector)
            .with_context(|| format!("failed to connect to '{}'", host.name))?;
        debug!(host = %host.name, url = %host.url, "connection established");

        let mut ctx = RunContext::new(
            &mut conn,
            &mut reporter,
            &engine,
            flags,
            host_template_vars(host),
            deploy_root.clone(),
        );

        let mut runner = ScriptRunner::new(host_template_vars(host));
        let result = runner.run_script(
            &mut ctx,
            &script_path,
            &toml::value::Table::new(),
            None,
            false,
        );

        // The connection is closed on every exit path; an orphaned
        // transport child is a correctness bug.
        let close_result = conn.close();
        result?;
        close_result?;

        if index + 1 != host_names.len() {
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_single_url_inventories() {
        let inventory = load_inventories(&["root@a".to_owned(), "ssh://b".to_owned()]).unwrap();
        assert_eq!(inventory.host_order, vec!["a", "b"]);
    }

    #[test]
    fn test_load_rejects_mixed_file_and_urls() {
        let err = load_inventories(&["inventory.toml".to_owned(), "root@a".to_owned()])
            .unwrap_err();
        assert!(err.to_string().contains("only inventory argument"));
    }

    #[test]
    fn test_load_inventory_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.toml");
        fs::write(&path, "hosts = [\"local:\"]\n").unwrap();
        let inventory =
            load_inventories(&[path.to_string_lossy().into_owned()]).unwrap();
        assert_eq!(inventory.host_order, vec!["localhost"]);
    }

    #[test]
    fn test_select_hosts_dedupes_and_sorts() {
        let inventory = load_inventories(&["ssh://b".to_owned(), "ssh://a".to_owned()]).unwrap();
        let selected = select_hosts(&inventory, Some("b,a,b")).unwrap();
        assert_eq!(selected, vec!["a", "b"]);
    }

    #[test]
    fn test_select_unknown_host_is_fatal() {
        let inventory = load_inventories(&["ssh://a".to_owned()]).unwrap();
        let err = select_hosts(&inventory, Some("ghost")).unwrap_err();
        assert!(err.to_string().contains("unknown host 'ghost'"));
    }

    #[test]
    fn test_host_template_vars_include_host_name() {
        let inventory = load_inventories(&["ssh://web".to_owned()]).unwrap();
        let vars = host_template_vars(inventory.host("web").unwrap());
        assert_eq!(vars["host"], "web");
        assert!(vars.contains_key("skiff_managed"));
    }
}
