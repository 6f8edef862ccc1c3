//! System-level operations: users, groups, packages and services.

use crate::context::{finalize, RunContext};
use crate::error::OpError;
use crate::op::{Op, OperationResult};
use crate::registry;
use serde::Deserialize;
use skiff_core::state::StateValue;

fn default_true() -> bool {
    true
}

// ---- user ------------------------------------------------------------------

/// Parameters of [`user`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserParams {
    /// The user name.
    pub user: String,
    /// Whether the user should exist. `false` deletes it and ignores
    /// the remaining parameters.
    #[serde(default = "default_true")]
    pub present: bool,
    /// The uid; determined automatically when absent.
    #[serde(default)]
    pub uid: Option<i64>,
    /// The primary group (name or gid); must already exist when
    /// given. Otherwise a same-named group is created on most
    /// systems.
    #[serde(default)]
    pub group: Option<String>,
    /// Supplementary groups.
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    /// Append to the current supplementary groups instead of
    /// replacing them.
    #[serde(default)]
    pub append_groups: bool,
    /// Create as a system user. Existing users are not affected.
    #[serde(default)]
    pub system: bool,
    /// The crypt(3) password hash.
    #[serde(default)]
    pub password_hash: Option<String>,
    /// The home directory. `/dev/null` when a user is created
    /// without one.
    #[serde(default)]
    pub home: Option<String>,
    /// The login shell. `/sbin/nologin` when a user is created
    /// without one.
    #[serde(default)]
    pub shell: Option<String>,
    /// The GECOS comment field.
    #[serde(default)]
    pub comment: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Creates, modifies or deletes a unix user. The home directory is
/// never created; use the directory operation for that.
pub fn user(ctx: &mut RunContext<'_>, params: &UserParams) -> Result<OperationResult, OpError> {
    let mut op = Op::new("user", params.name.clone());
    let outcome = user_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

fn user_inner(
    ctx: &mut RunContext<'_>,
    params: &UserParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    op.desc(ctx, &params.user);

    let current = ctx.conn.query_user_opt(&params.user)?;
    match &current {
        None => op.initial_state([
            ("exists", StateValue::Bool(false)),
            ("uid", StateValue::Nil),
            ("group", StateValue::Nil),
            ("groups", StateValue::List(Vec::new())),
            ("comment", StateValue::Nil),
            ("home", StateValue::Nil),
            ("shell", StateValue::Nil),
            ("password_hash", StateValue::Nil),
        ])?,
        Some(entry) => op.initial_state([
            ("exists", StateValue::Bool(true)),
            ("uid", StateValue::Int(entry.uid)),
            ("group", entry.group.as_str().into()),
            ("groups", sorted(entry.groups.clone()).into()),
            ("comment", entry.gecos.as_str().into()),
            ("home", entry.home.as_str().into()),
            ("shell", entry.shell.as_str().into()),
            ("password_hash", entry.password_hash.as_str().into()),
        ])?,
    }

    // Desired state; an unset parameter means keep-as-is, or the
    // creation default for a new user.
    let target_uid = params.uid.or(current.as_ref().map(|c| c.uid));
    let target_group = params
        .group
        .clone()
        .or_else(|| current.as_ref().map(|c| c.group.clone()));
    let current_groups = current.as_ref().map(|c| c.groups.clone()).unwrap_or_default();
    let target_groups = if params.append_groups {
        let mut union = params.groups.clone().unwrap_or_default();
        union.extend(current_groups);
        sorted(union)
    } else {
        sorted(params.groups.clone().unwrap_or(current_groups))
    };
    let target_password_hash = params
        .password_hash
        .clone()
        .or_else(|| current.as_ref().map(|c| c.password_hash.clone()));
    let target_comment = params
        .comment
        .clone()
        .or_else(|| current.as_ref().map(|c| c.gecos.clone()));
    let target_home = params
        .home
        .clone()
        .or_else(|| current.as_ref().map(|c| c.home.clone()))
        .unwrap_or_else(|| "/dev/null".to_owned());
    let target_shell = params
        .shell
        .clone()
        .or_else(|| current.as_ref().map(|c| c.shell.clone()))
        .unwrap_or_else(|| "/sbin/nologin".to_owned());

    if params.present {
        op.final_state([
            ("exists", StateValue::Bool(true)),
            ("uid", target_uid.into()),
            ("group", target_group.clone().into()),
            ("groups", target_groups.clone().into()),
            ("comment", target_comment.clone().into()),
            ("home", target_home.as_str().into()),
            ("shell", target_shell.as_str().into()),
            ("password_hash", target_password_hash.clone().into()),
        ])?;
    } else {
        op.final_state([
            ("exists", StateValue::Bool(false)),
            ("uid", StateValue::Nil),
            ("group", StateValue::Nil),
            ("groups", StateValue::List(Vec::new())),
            ("comment", StateValue::Nil),
            ("home", StateValue::Nil),
            ("shell", StateValue::Nil),
            ("password_hash", StateValue::Nil),
        ])?;
    }

    if op.unchanged(false)? {
        return op.success(ctx);
    }

    if !ctx.flags.dry_run {
        let uid_str = target_uid.map(|uid| uid.to_string());
        let joined_groups = target_groups.join(",");

        if op.changed("exists")? {
            if params.present {
                let mut argv: Vec<&str> = vec!["useradd"];
                if params.system {
                    argv.push("--system");
                }
                if let Some(uid) = &uid_str {
                    argv.extend(["--uid", uid.as_str()]);
                }
                match &target_group {
                    None => argv.push("--user-group"),
                    Some(group) => argv.extend(["--no-user-group", "--gid", group.as_str()]),
                }
                if !target_groups.is_empty() {
                    argv.extend(["--groups", joined_groups.as_str()]);
                }
                if let Some(comment) = &target_comment {
                    argv.extend(["--comment", comment.as_str()]);
                }
                argv.extend(["--no-create-home", "--home-dir", target_home.as_str()]);
                argv.extend(["--shell", target_shell.as_str()]);
                if let Some(hash) = &target_password_hash {
                    argv.extend(["--password", hash.as_str()]);
                }
                argv.extend(["--", params.user.as_str()]);
                ctx.run(&argv)?;
            } else {
                ctx.run(&["userdel", "--", &params.user])?;
            }
        } else if params.present {
            if op.changed("uid")? {
                if let Some(uid) = &uid_str {
                    ctx.run(&["usermod", "--uid", uid, "--", &params.user])?;
                }
            }
            if op.changed("group")? {
                if let Some(group) = &target_group {
                    ctx.run(&["usermod", "--gid", group, "--", &params.user])?;
                }
            }
            if op.changed("groups")? && !target_groups.is_empty() {
                ctx.run(&["usermod", "--groups", &joined_groups, "--", &params.user])?;
            }
            if op.changed("comment")? {
                if let Some(comment) = &target_comment {
                    ctx.run(&["usermod", "--comment", comment, "--", &params.user])?;
                }
            }
            if op.changed("home")? {
                ctx.run(&["usermod", "--home", &target_home, "--", &params.user])?;
            }
            if op.changed("shell")? {
                ctx.run(&["usermod", "--shell", &target_shell, "--", &params.user])?;
            }
            if op.changed("password_hash")? {
                if let Some(hash) = &target_password_hash {
                    ctx.run(&["usermod", "--password", hash, "--", &params.user])?;
                }
            }
        }
    }

    op.success(ctx)
}

// ---- group -----------------------------------------------------------------

/// Parameters of [`group`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupParams {
    /// The group name.
    pub group: String,
    /// Whether the group should exist.
    #[serde(default = "default_true")]
    pub present: bool,
    /// The gid; determined automatically when absent.
    #[serde(default)]
    pub gid: Option<i64>,
    /// Create as a system group. Existing groups are not affected.
    #[serde(default)]
    pub system: bool,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Creates, modifies or deletes a unix group.
pub fn group(ctx: &mut RunContext<'_>, params: &GroupParams) -> Result<OperationResult, OpError> {
    let mut op = Op::new("group", params.name.clone());
    let outcome = group_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn group_inner(
    ctx: &mut RunContext<'_>,
    params: &GroupParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    op.desc(ctx, &params.group);

    let current = ctx.conn.query_group_opt(&params.group)?;
    match &current {
        None => op.initial_state([
            ("exists", StateValue::Bool(false)),
            ("gid", StateValue::Nil),
        ])?,
        Some(entry) => op.initial_state([
            ("exists", StateValue::Bool(true)),
            ("gid", StateValue::Int(entry.gid)),
        ])?,
    }

    let target_gid = params.gid.or(current.as_ref().map(|c| c.gid));
    if params.present {
        op.final_state([
            ("exists", StateValue::Bool(true)),
            ("gid", target_gid.into()),
        ])?;
    } else {
        op.final_state([
            ("exists", StateValue::Bool(false)),
            ("gid", StateValue::Nil),
        ])?;
    }

    if op.unchanged(false)? {
        return op.success(ctx);
    }

    if !ctx.flags.dry_run {
        let gid_str = target_gid.map(|gid| gid.to_string());
        if op.changed("exists")? {
            if params.present {
                let mut argv: Vec<&str> = vec!["groupadd"];
                if params.system {
                    argv.push("--system");
                }
                if let Some(gid) = &gid_str {
                    argv.extend(["--gid", gid.as_str()]);
                }
                argv.extend(["--", params.group.as_str()]);
                ctx.run(&argv)?;
            } else {
                ctx.run(&["groupdel", "--", &params.group])?;
            }
        } else if params.present && op.changed("gid")? {
            if let Some(gid) = &gid_str {
                ctx.run(&["groupmod", "--gid", gid, "--", &params.group])?;
            }
        }
    }

    op.success(ctx)
}

// ---- package facade --------------------------------------------------------

/// Parameters of [`package`] and its backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageParams {
    /// The packages to install or remove.
    pub packages: Vec<String>,
    /// Whether the packages should be installed.
    #[serde(default = "default_true")]
    pub present: bool,
    /// Extra options passed to the package manager.
    #[serde(default)]
    pub opts: Vec<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Adds or removes system packages, dispatching to the first
/// supported package manager found on the remote.
pub fn package(
    ctx: &mut RunContext<'_>,
    params: &PackageParams,
) -> Result<OperationResult, OpError> {
    match registry::find_command(ctx, registry::PACKAGE_MANAGERS)? {
        Some(backend) => backend(ctx, params),
        None => {
            let mut op = Op::new("package", params.name.clone());
            op.desc(ctx, format!("{:?}", params.packages));
            let message = format!(
                "no supported package manager was found on the remote system; searched commands: {:?}",
                registry::searched_commands(registry::PACKAGE_MANAGERS)
            );
            finalize(ctx, &mut op, Err(OpError::Failure(message)), params.check)
        }
    }
}

/// The shared body of all package backends: probe each package,
/// install or uninstall the ones whose state differs.
pub(crate) fn generic_package(
    ctx: &mut RunContext<'_>,
    op: &mut Op,
    params: &PackageParams,
    is_installed: impl Fn(&mut RunContext<'_>, &str) -> Result<bool, OpError>,
    apply: impl Fn(&mut RunContext<'_>, &str, bool) -> Result<(), OpError>,
) -> Result<OperationResult, OpError> {
    let mut initial = Vec::new();
    for package in &params.packages {
        let installed = is_installed(ctx, package)?;
        initial.push((package.clone(), StateValue::Bool(installed)));
    }
    op.initial_state(initial)?;
    op.final_state(
        params
            .packages
            .iter()
            .map(|p| (p.clone(), StateValue::Bool(params.present))),
    )?;

    if op.unchanged(false)? {
        return op.success(ctx);
    }

    if !ctx.flags.dry_run {
        for package in &params.packages {
            if op.changed(package)? {
                apply(ctx, package, params.present)?;
            }
        }
    }

    op.success(ctx)
}

// ---- service facade --------------------------------------------------------

/// Parameters of [`service`] and its backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceParams {
    /// The unit to manage.
    pub service: String,
    /// The desired state: `started`, `restarted`, `reloaded` or
    /// `stopped`. The current state is kept when absent.
    #[serde(default)]
    pub state: Option<String>,
    /// Whether the unit should start on boot. Kept as-is when
    /// absent.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Manage the calling user's units instead of the system's.
    #[serde(default)]
    pub user_mode: bool,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Manages a system service, dispatching to the first supported init
/// system found on the remote.
pub fn service(
    ctx: &mut RunContext<'_>,
    params: &ServiceParams,
) -> Result<OperationResult, OpError> {
    match registry::find_command(ctx, registry::SERVICE_MANAGERS)? {
        Some(backend) => backend(ctx, params),
        None => {
            let mut op = Op::new("service", params.name.clone());
            op.desc(ctx, &params.service);
            let message = format!(
                "no supported service manager was found on the remote system; searched commands: {:?}",
                registry::searched_commands(registry::SERVICE_MANAGERS)
            );
            finalize(ctx, &mut op, Err(OpError::Failure(message)), params.check)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{packets, scripted_connection};
    use crate::reporter::NullReporter;
    use skiff_proto::Packet;

    fn user_entry(groups: Vec<&str>) -> Packet {
        Packet::UserEntry {
            name: "deploy".into(),
            uid: 1000,
            group: "deploy".into(),
            gid: 1000,
            groups: groups.into_iter().map(str::to_owned).collect(),
            password_hash: "!".into(),
            gecos: String::new(),
            home: "/home/deploy".into(),
            shell: "/bin/sh".into(),
        }
    }

    #[test]
    fn test_user_in_desired_state_is_unchanged() {
        let (mut conn, _) = scripted_connection(vec![user_entry(vec!["wheel"])]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = user(
            &mut ctx,
            &UserParams {
                user: "deploy".into(),
                present: true,
                uid: None,
                group: None,
                groups: None,
                append_groups: false,
                system: false,
                password_hash: None,
                home: None,
                shell: None,
                comment: None,
                name: None,
                check: true,
            },
        )
        .unwrap();
        assert!(!result.changed);
    }

    #[test]
    fn test_user_append_groups_unions_sorted() {
        let (mut conn, requests) = scripted_connection(vec![
            user_entry(vec!["wheel"]),
            packets::completed(0, b""), // usermod --groups
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = user(
            &mut ctx,
            &UserParams {
                user: "deploy".into(),
                present: true,
                uid: None,
                group: None,
                groups: Some(vec!["video".into()]),
                append_groups: true,
                system: false,
                password_hash: None,
                home: None,
                shell: None,
                comment: None,
                name: None,
                check: true,
            },
        )
        .unwrap();
        assert!(result.changed);
        assert_eq!(
            result.final_state["groups"],
            StateValue::from(vec!["video".to_owned(), "wheel".to_owned()])
        );
        let log = requests.borrow();
        match log.last().unwrap() {
            Packet::ProcessRun { command, .. } => {
                assert_eq!(command[0], "usermod");
                assert!(command.contains(&"video,wheel".to_owned()));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_user_delete() {
        let (mut conn, requests) = scripted_connection(vec![
            user_entry(vec![]),
            packets::completed(0, b""), // userdel
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = user(
            &mut ctx,
            &UserParams {
                user: "deploy".into(),
                present: false,
                uid: None,
                group: None,
                groups: None,
                append_groups: false,
                system: false,
                password_hash: None,
                home: None,
                shell: None,
                comment: None,
                name: None,
                check: true,
            },
        )
        .unwrap();
        assert!(result.changed);
        let log = requests.borrow();
        match log.last().unwrap() {
            Packet::ProcessRun { command, .. } => assert_eq!(command[0], "userdel"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_group_create() {
        let (mut conn, requests) = scripted_connection(vec![
            Packet::InvalidField {
                field: "group".into(),
                error_message: "The group does not exist".into(),
            },
            packets::completed(0, b""), // groupadd
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = group(
            &mut ctx,
            &GroupParams {
                group: "media".into(),
                present: true,
                gid: Some(970),
                system: true,
                name: None,
                check: true,
            },
        )
        .unwrap();
        assert!(result.changed);
        let log = requests.borrow();
        match log.last().unwrap() {
            Packet::ProcessRun { command, .. } => {
                assert_eq!(
                    command,
                    &["groupadd", "--system", "--gid", "970", "--", "media"]
                );
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_package_facade_reports_searched_commands() {
        // All probes fail.
        let (mut conn, _) = scripted_connection(vec![
            packets::completed(1, b""),
            packets::completed(1, b""),
            packets::completed(1, b""),
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let err = package(
            &mut ctx,
            &PackageParams {
                packages: vec!["htop".into()],
                present: true,
                opts: Vec::new(),
                name: None,
                check: true,
            },
        )
        .unwrap_err();
        match err {
            OpError::Failure(message) => {
                assert!(message.contains("pacman"));
                assert!(message.contains("apt-get"));
                assert!(message.contains("emerge"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_package_facade_dispatches_to_pacman() {
        let (mut conn, _) = scripted_connection(vec![
            packets::completed(0, b"/usr/bin/pacman\n"), // command -v pacman
            packets::completed(0, b""),                  // pacman -Ql htop (installed)
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = package(
            &mut ctx,
            &PackageParams {
                packages: vec!["htop".into()],
                present: true,
                opts: Vec::new(),
                name: None,
                check: true,
            },
        )
        .unwrap();
        assert!(!result.changed);
    }
}
