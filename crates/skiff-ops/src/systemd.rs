//! The systemd init system backend.

use crate::context::{finalize, RunContext};
use crate::error::OpError;
use crate::op::{Op, OperationResult};
use crate::system::ServiceParams;
use serde::Deserialize;
use skiff_core::state::StateValue;

fn default_true() -> bool {
    true
}

const STATE_ACTIONS: &[(&str, &str)] = &[
    ("started", "start"),
    ("restarted", "restart"),
    ("reloaded", "reload"),
    ("stopped", "stop"),
];

fn systemctl_base<'a>(user_mode: bool) -> Vec<&'a str> {
    if user_mode {
        vec!["systemctl", "--user"]
    } else {
        vec!["systemctl"]
    }
}

/// Reads one `systemctl show` property value.
fn show_property(
    ctx: &mut RunContext<'_>,
    user_mode: bool,
    property: &str,
    unit: &str,
) -> Result<String, OpError> {
    let mut argv = systemctl_base(user_mode);
    argv.extend(["show", "--value", "--property", property, "--", unit]);
    Ok(ctx.run(&argv)?.stdout_trimmed())
}

/// Manages a systemd unit: its active state and whether it starts on
/// boot. Aspects left unset are not touched.
pub fn service(
    ctx: &mut RunContext<'_>,
    params: &ServiceParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("service", params.name.clone());
    let outcome = service_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn service_inner(
    ctx: &mut RunContext<'_>,
    params: &ServiceParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    op.desc(ctx, &params.service);

    let action = match &params.state {
        None => None,
        Some(state) => match STATE_ACTIONS.iter().find(|(name, _)| name == state) {
            Some((_, action)) => Some(*action),
            None => {
                return Err(OpError::Parameter(format!(
                    "invalid target state '{state}'"
                )))
            }
        },
    };

    // Examine current state
    let active = show_property(ctx, params.user_mode, "ActiveState", &params.service)?;
    let current_state = if matches!(active.as_str(), "active" | "activating") {
        "started"
    } else {
        "stopped"
    };
    let unit_file = show_property(ctx, params.user_mode, "UnitFileState", &params.service)?;
    let current_enabled = unit_file == "enabled";

    op.initial_state([
        ("state", current_state.into()),
        ("enabled", StateValue::Bool(current_enabled)),
    ])?;
    op.final_state([
        ("state", params.state.clone().into()),
        ("enabled", params.enabled.into()),
    ])?;

    if op.unchanged(true)? {
        return op.success_with(ctx, true);
    }

    if !ctx.flags.dry_run {
        if op.changed("state")? {
            if let Some(action) = action {
                let mut argv = systemctl_base(params.user_mode);
                argv.extend([action, "--", &params.service]);
                ctx.run(&argv)?;
            }
        }
        if op.changed("enabled")? {
            if let Some(enabled) = params.enabled {
                let mut argv = systemctl_base(params.user_mode);
                argv.extend([if enabled { "enable" } else { "disable" }, "--", &params.service]);
                ctx.run(&argv)?;
            }
        }
    }

    op.success_with(ctx, true)
}

/// Parameters of [`daemon_reload`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonReloadParams {
    /// Reload the calling user's systemd instance instead of the
    /// system's.
    #[serde(default)]
    pub user_mode: bool,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Reloads the systemd daemon so edited unit files take effect.
pub fn daemon_reload(
    ctx: &mut RunContext<'_>,
    params: &DaemonReloadParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("systemctl", params.name.clone());
    let outcome = (|| {
        op.desc(ctx, "daemon-reload");

        // This operation has no observable remote state.
        op.initial_state([("reloaded", StateValue::Bool(false))])?;
        op.final_state([("reloaded", StateValue::Bool(true))])?;

        if !ctx.flags.dry_run {
            let mut argv = systemctl_base(params.user_mode);
            argv.push("daemon-reload");
            ctx.run(&argv)?;
        }

        op.success(ctx)
    })();
    finalize(ctx, &mut op, outcome, params.check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{packets, scripted_connection};
    use crate::reporter::NullReporter;
    use skiff_proto::Packet;

    fn params(state: Option<&str>, enabled: Option<bool>) -> ServiceParams {
        ServiceParams {
            service: "nginx".into(),
            state: state.map(str::to_owned),
            enabled,
            user_mode: false,
            name: None,
            check: true,
        }
    }

    #[test]
    fn test_service_started_and_enabled_is_unchanged() {
        let (mut conn, _) = scripted_connection(vec![
            packets::completed(0, b"active\n"),
            packets::completed(0, b"enabled\n"),
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = service(&mut ctx, &params(Some("started"), Some(true))).unwrap();
        assert!(!result.changed);
    }

    #[test]
    fn test_service_only_enable_ignores_state() {
        // Unit is stopped but only `enabled` is pinned; nothing to do.
        let (mut conn, requests) = scripted_connection(vec![
            packets::completed(0, b"inactive\n"),
            packets::completed(0, b"enabled\n"),
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = service(&mut ctx, &params(None, Some(true))).unwrap();
        assert!(!result.changed);
        // Only the two probes ran.
        assert_eq!(
            requests
                .borrow()
                .iter()
                .filter(|r| matches!(r, Packet::ProcessRun { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn test_service_restart_always_acts() {
        let (mut conn, requests) = scripted_connection(vec![
            packets::completed(0, b"active\n"),
            packets::completed(0, b"enabled\n"),
            packets::completed(0, b""), // systemctl restart
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = service(&mut ctx, &params(Some("restarted"), None)).unwrap();
        assert!(result.changed);
        let log = requests.borrow();
        match log.last().unwrap() {
            Packet::ProcessRun { command, .. } => {
                assert_eq!(command, &["systemctl", "restart", "--", "nginx"]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_service_enable_uses_user_mode() {
        let (mut conn, requests) = scripted_connection(vec![
            packets::completed(0, b"active\n"),
            packets::completed(0, b"disabled\n"),
            packets::completed(0, b""), // systemctl --user enable
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let mut p = params(None, Some(true));
        p.user_mode = true;
        service(&mut ctx, &p).unwrap();
        let log = requests.borrow();
        match log.last().unwrap() {
            Packet::ProcessRun { command, .. } => {
                assert_eq!(command, &["systemctl", "--user", "enable", "--", "nginx"]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_service_invalid_state_is_parameter_error() {
        let (mut conn, _) = scripted_connection(vec![]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);
        let err = service(&mut ctx, &params(Some("paused"), None)).unwrap_err();
        assert!(matches!(err, OpError::Parameter(_)));
    }

    #[test]
    fn test_daemon_reload_runs_systemctl() {
        let (mut conn, requests) = scripted_connection(vec![packets::completed(0, b"")]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = daemon_reload(
            &mut ctx,
            &DaemonReloadParams {
                user_mode: false,
                name: None,
                check: true,
            },
        )
        .unwrap();
        assert!(result.changed);
        let log = requests.borrow();
        match log.last().unwrap() {
            Packet::ProcessRun { command, .. } => {
                assert_eq!(command, &["systemctl", "daemon-reload"]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }
}
