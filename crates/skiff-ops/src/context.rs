//! The per-host run context.
//!
//! Everything an operation needs flows through [`RunContext`]: the
//! open connection, the defaults stack, the run flags, the reporter
//! and the template engine. There is no ambient global state; the
//! script runner owns one context per host and threads it through
//! every call.

use crate::defaults::DefaultsStack;
use crate::error::OpError;
use crate::op::{Op, OperationResult};
use crate::reporter::Reporter;
use crate::template::TemplateEngine;
use skiff_connect::{CompletedCommand, ConnectError, Connection, RunOptions};
use skiff_core::{RemoteSettings, ResolvedSettings};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Run-wide behavior flags, straight from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpFlags {
    /// Probe state but never mutate anything.
    pub dry_run: bool,
    /// Record content diffs for changed files.
    pub diffs: bool,
}

/// The state threaded through every operation of one host's run.
pub struct RunContext<'a> {
    /// The open connection to the host.
    pub conn: &'a mut Connection,
    /// The scoped execution defaults.
    pub defaults: DefaultsStack,
    /// Run-wide flags.
    pub flags: OpFlags,
    /// Where results are rendered.
    pub reporter: &'a mut dyn Reporter,
    /// Renders templates for the template operations.
    pub engine: &'a dyn TemplateEngine,
    /// Template variables: host variables (flattened) overlaid with
    /// the running script's parameters.
    pub template_vars: BTreeMap<String, String>,
    /// Base directory for relative local source paths (the deploy
    /// root).
    pub local_base: PathBuf,
}

impl<'a> RunContext<'a> {
    /// Creates a context for one host run.
    pub fn new(
        conn: &'a mut Connection,
        reporter: &'a mut dyn Reporter,
        engine: &'a dyn TemplateEngine,
        flags: OpFlags,
        template_vars: BTreeMap<String, String>,
        local_base: PathBuf,
    ) -> RunContext<'a> {
        RunContext {
            conn,
            defaults: DefaultsStack::new(),
            flags,
            reporter,
            engine,
            template_vars,
            local_base,
        }
    }

    /// Starts a fresh defaults frame on top of the connection's base
    /// settings, as every script does on entry.
    pub fn enter_script_frame(&mut self) -> Result<(), OpError> {
        let base = self.conn.base_settings().clone();
        let resolved = self.conn.resolve_defaults(&base)?;
        self.defaults.enter_frame(resolved);
        Ok(())
    }

    /// Ends the current script's defaults frame.
    pub fn exit_script_frame(&mut self) {
        self.defaults.exit_frame();
    }

    /// Runs `body` under a defaults scope that overlays the given
    /// overrides on the current defaults. The scope pops on every
    /// exit path; `body` receives the fully resolved settings.
    pub fn with_defaults<T>(
        &mut self,
        overrides: RemoteSettings,
        body: impl FnOnce(&mut RunContext<'a>, &ResolvedSettings) -> Result<T, OpError>,
    ) -> Result<T, OpError> {
        let requested = overrides.canonicalized()?;
        let effective = self
            .conn
            .base_settings()
            .overlay(&self.defaults.current())
            .overlay(&requested);
        let resolved = self.conn.resolve_defaults(&effective)?;
        let attrs = resolved.clone().into_resolved()?;
        self.defaults.push(resolved);
        let result = body(self, &attrs);
        self.defaults.pop();
        result
    }

    /// Runs a remote command under the current defaults, raising on a
    /// non-zero exit.
    pub fn run(&mut self, argv: &[&str]) -> Result<CompletedCommand, OpError> {
        self.run_with(argv, RunOptions::default())
    }

    /// Runs a remote command under the current defaults, returning
    /// the result whatever its exit code.
    pub fn run_unchecked(&mut self, argv: &[&str]) -> Result<CompletedCommand, OpError> {
        self.run_with(
            argv,
            RunOptions {
                check: false,
                ..RunOptions::default()
            },
        )
    }

    /// Runs a remote command with explicit options; unset
    /// identity/umask/cwd fields are filled from the current
    /// defaults.
    pub fn run_with(
        &mut self,
        argv: &[&str],
        opts: RunOptions,
    ) -> Result<CompletedCommand, OpError> {
        let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
        let opts = opts.with_defaults(&self.defaults.current());
        tracing::debug!(?argv, user = ?opts.user, cwd = ?opts.cwd, "running remote command");
        Ok(self.conn.run(&argv, opts)?)
    }
}

/// Applies the finishing policy shared by all operations: a body
/// error becomes a reported failure result, a checked failure becomes
/// an error, and non-zero exits of checked commands get their output
/// dumped for debugging.
pub(crate) fn finalize(
    ctx: &mut RunContext<'_>,
    op: &mut Op,
    outcome: Result<OperationResult, OpError>,
    check: bool,
) -> Result<OperationResult, OpError> {
    match outcome {
        Ok(result) => {
            if !result.success && check {
                return Err(OpError::Failure(
                    result
                        .failure_message
                        .clone()
                        .unwrap_or_else(|| "operation failed".to_owned()),
                ));
            }
            Ok(result)
        }
        Err(OpError::Failure(message)) => {
            let result = op.failure(ctx, message.clone());
            if check {
                Err(OpError::Failure(message))
            } else {
                Ok(result)
            }
        }
        Err(e) => {
            op.failure(ctx, e.to_string());
            if let OpError::Connect(ConnectError::CommandFailed {
                command,
                stdout,
                stderr,
                returncode,
            }) = &e
            {
                ctx.reporter.command_failure_dump(
                    command,
                    stdout.as_deref().unwrap_or_default(),
                    stderr.as_deref().unwrap_or_default(),
                    *returncode,
                );
            }
            Err(e)
        }
    }
}
