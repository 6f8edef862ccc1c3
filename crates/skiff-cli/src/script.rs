//! Deploy scripts and the script runner.
//!
//! A deploy script is a TOML document: an optional display name,
//! optional parameter declarations, and a sequence of operation
//! calls. `${var}` references in string arguments are expanded from
//! the script's parameters overlaid on the host's variables. A
//! `script` operation invokes another script with its own parameters
//! and a fresh defaults frame; the runner keeps a call stack so
//! failures can be attributed to the deploy, not the engine.

use serde::Deserialize;
use skiff_ops::template::expand_str;
use skiff_ops::{files, git, system, systemd, OpError, RunContext};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One entry of the script call stack.
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// The script file as given by the caller.
    pub file: String,
    /// The canonical path, for recursion detection.
    pub real_path: PathBuf,
    /// The index of the operation currently executing.
    pub op_index: Option<usize>,
    /// The kind of the operation currently executing.
    pub op_kind: Option<String>,
}

/// A deploy failure annotated with the script stack at the point of
/// failure.
#[derive(Debug)]
pub struct ScriptStackError {
    frames: Vec<StackFrame>,
    message: String,
}

impl ScriptStackError {
    fn new(frames: &[StackFrame], message: String) -> Self {
        ScriptStackError {
            frames: frames.to_vec(),
            message,
        }
    }

    /// The failure cause.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Renders the stack the way a traceback reads: outermost first.
    pub fn render_stack(&self) -> String {
        let mut out = String::from("Script stack (most recent call last):");
        for frame in &self.frames {
            out.push_str(&format!("\n  File \"{}\"", frame.file));
            if let (Some(index), Some(kind)) = (frame.op_index, &frame.op_kind) {
                out.push_str(&format!(", op {} ({kind})", index + 1));
            }
        }
        out
    }
}

impl fmt::Display for ScriptStackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ScriptStackError {}

/// A parameter declaration in a script header.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamDecl {
    /// Declared type; informational.
    #[serde(rename = "type", default)]
    #[allow(dead_code)]
    type_name: Option<String>,
    /// Default value; a parameter without one is required.
    #[serde(default)]
    default: Option<toml::Value>,
}

/// The root of a deploy script file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptFile {
    /// Display name of the script.
    #[serde(default)]
    name: Option<String>,
    /// Parameter declarations.
    #[serde(default)]
    params: BTreeMap<String, ParamDecl>,
    /// The operation calls, in order.
    #[serde(default)]
    ops: Vec<toml::Value>,
}

/// Renders a TOML scalar for use in `${var}` expansion. Composite
/// values have no string form and are skipped.
fn scalar_to_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}

/// Flattens a variable table into dotted string keys for template
/// expansion.
pub fn flatten_vars(vars: &BTreeMap<String, toml::Value>) -> BTreeMap<String, String> {
    fn walk(prefix: &str, value: &toml::Value, out: &mut BTreeMap<String, String>) {
        if let toml::Value::Table(table) = value {
            for (key, child) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                walk(&path, child, out);
            }
        } else if let Some(s) = scalar_to_string(value) {
            out.insert(prefix.to_owned(), s);
        }
    }
    let mut out = BTreeMap::new();
    for (key, value) in vars {
        walk(key, value, &mut out);
    }
    out
}

/// Expands `${var}` references in every string of a TOML value tree.
fn expand_value(
    source_name: &str,
    value: &toml::Value,
    context: &BTreeMap<String, String>,
) -> Result<toml::Value, OpError> {
    Ok(match value {
        toml::Value::String(s) => toml::Value::String(expand_str(source_name, s, context)?),
        toml::Value::Array(items) => toml::Value::Array(
            items
                .iter()
                .map(|item| expand_value(source_name, item, context))
                .collect::<Result<_, _>>()?,
        ),
        toml::Value::Table(table) => toml::Value::Table(
            table
                .iter()
                .map(|(key, item)| {
                    Ok((key.clone(), expand_value(source_name, item, context)?))
                })
                .collect::<Result<_, OpError>>()?,
        ),
        other => other.clone(),
    })
}

/// A `script` operation: run another deploy script with parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptCallParams {
    /// The script file, relative to the deploy root.
    path: String,
    /// Parameters passed into the script.
    #[serde(default)]
    params: toml::value::Table,
    /// Optional display name.
    #[serde(default)]
    name: Option<String>,
    /// Permit re-entering a script that is already on the call stack.
    #[serde(default)]
    allow_recursion: bool,
}

/// A `defaults` operation: change the remote execution defaults for
/// the remainder of the current script.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsOpParams {
    /// Drop all accumulated overlays of this script instead.
    #[serde(default)]
    reset: bool,
    #[serde(default)]
    as_user: Option<String>,
    #[serde(default)]
    as_group: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    file_mode: Option<String>,
    #[serde(default)]
    dir_mode: Option<String>,
    #[serde(default)]
    umask: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
}

/// The script runner: host variables plus the live call stack.
pub struct ScriptRunner {
    host_vars: BTreeMap<String, String>,
    stack: Vec<StackFrame>,
}

impl ScriptRunner {
    /// Creates a runner for one host.
    pub fn new(host_vars: BTreeMap<String, String>) -> ScriptRunner {
        ScriptRunner {
            host_vars,
            stack: Vec::new(),
        }
    }

    fn fail(&self, message: String) -> ScriptStackError {
        ScriptStackError::new(&self.stack, message)
    }

    /// Loads and runs a script: binds parameters, establishes a
    /// fresh defaults frame, and executes the operations in order.
    pub fn run_script(
        &mut self,
        ctx: &mut RunContext<'_>,
        path: &Path,
        params: &toml::value::Table,
        display: Option<String>,
        allow_recursion: bool,
    ) -> Result<(), ScriptStackError> {
        let real_path = path
            .canonicalize()
            .map_err(|e| self.fail(format!("cannot load script '{}': {e}", path.display())))?;

        if !allow_recursion && self.stack.iter().any(|f| f.real_path == real_path) {
            return Err(self.fail(format!(
                "refusing recursive invocation of '{}' (pass allow_recursion to override)",
                path.display()
            )));
        }

        ctx.reporter
            .script_start(&path.display().to_string(), display.as_deref());
        ctx.reporter.indent();

        let result = self.run_script_frame(ctx, path, &real_path, params, display);

        ctx.reporter.dedent();
        result
    }

    fn run_script_frame(
        &mut self,
        ctx: &mut RunContext<'_>,
        path: &Path,
        real_path: &Path,
        params: &toml::value::Table,
        display: Option<String>,
    ) -> Result<(), ScriptStackError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| self.fail(format!("cannot load script '{}': {e}", path.display())))?;
        let script: ScriptFile = toml::from_str(&content)
            .map_err(|e| self.fail(format!("cannot parse script '{}': {e}", path.display())))?;

        let display = display
            .or(script.name.clone())
            .or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| path.display().to_string());

        // Bind parameters: missing required ones are errors,
        // extraneous ones are ignored.
        let mut bound: BTreeMap<String, toml::Value> = BTreeMap::new();
        for (name, decl) in &script.params {
            match params.get(name).cloned().or_else(|| decl.default.clone()) {
                Some(value) => {
                    bound.insert(name.clone(), value);
                }
                None => {
                    return Err(self.fail(format!(
                        "script '{display}' requires parameter '{name}', but no such parameter was given"
                    )))
                }
            }
        }

        // The script's expansion context: host variables overlaid
        // with its parameters.
        let mut script_vars = self.host_vars.clone();
        for (name, value) in &bound {
            if let Some(s) = scalar_to_string(value) {
                script_vars.insert(name.clone(), s);
            }
        }
        let saved_vars = std::mem::replace(&mut ctx.template_vars, script_vars.clone());

        self.stack.push(StackFrame {
            file: path.display().to_string(),
            real_path: real_path.to_path_buf(),
            op_index: None,
            op_kind: None,
        });

        // Every script starts from the connection's base defaults.
        let result = match ctx.enter_script_frame() {
            Err(e) => Err(self.fail(e.to_string())),
            Ok(()) => {
                let r = self.run_ops(ctx, path, &script.ops, &script_vars);
                ctx.exit_script_frame();
                r
            }
        };

        self.stack.pop();
        ctx.template_vars = saved_vars;
        result
    }

    fn run_ops(
        &mut self,
        ctx: &mut RunContext<'_>,
        path: &Path,
        ops: &[toml::Value],
        script_vars: &BTreeMap<String, String>,
    ) -> Result<(), ScriptStackError> {
        let source_name = path.display().to_string();
        for (index, op_value) in ops.iter().enumerate() {
            let Some(table) = op_value.as_table() else {
                return Err(self.fail(format!("op {} is not a table", index + 1)));
            };
            let Some(kind) = table.get("kind").and_then(toml::Value::as_str) else {
                return Err(self.fail(format!("op {} is missing its 'kind'", index + 1)));
            };
            let kind = kind.to_owned();

            if let Some(frame) = self.stack.last_mut() {
                frame.op_index = Some(index);
                frame.op_kind = Some(kind.clone());
            }

            // Expand variable references, then drop the dispatch key
            // so the parameter tables stay strict. The template text
            // of template_content is the engine's input, not a script
            // argument; it renders later with the call-local context.
            let exempt: &[&str] = if kind == "template_content" {
                &["content"]
            } else {
                &[]
            };
            let mut expanded = toml::value::Table::new();
            for (key, item) in table {
                let item = if exempt.contains(&key.as_str()) {
                    item.clone()
                } else {
                    match expand_value(&source_name, item, script_vars) {
                        Ok(item) => item,
                        Err(e) => return Err(self.fail(e.to_string())),
                    }
                };
                expanded.insert(key.clone(), item);
            }
            let mut table = expanded;
            table.remove("kind");

            self.dispatch(ctx, &kind, table)?;
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        ctx: &mut RunContext<'_>,
        kind: &str,
        table: toml::value::Table,
    ) -> Result<(), ScriptStackError> {
        fn params<T: serde::de::DeserializeOwned>(
            table: toml::value::Table,
        ) -> Result<T, OpError> {
            toml::Value::Table(table)
                .try_into()
                .map_err(|e| OpError::Parameter(e.to_string()))
        }

        // Sub-scripts carry their own stack handling.
        if kind == "script" {
            let call: ScriptCallParams =
                params(table).map_err(|e| self.fail(e.to_string()))?;
            let sub_path = ctx.local_base.join(&call.path);
            return self.run_script(
                ctx,
                &sub_path,
                &call.params,
                call.name.clone(),
                call.allow_recursion,
            );
        }

        let outcome: Result<(), OpError> = (|| match kind {
            "directory" => files::directory(ctx, &params(table)?).map(drop),
            "file" => files::file(ctx, &params(table)?).map(drop),
            "link" => files::link(ctx, &params(table)?).map(drop),
            "upload_content" => files::upload_content(ctx, &params(table)?).map(drop),
            "upload" => files::upload(ctx, &params(table)?).map(drop),
            "upload_dir" => files::upload_dir(ctx, &params(table)?).map(drop),
            "template" => files::template(ctx, &params(table)?).map(drop),
            "template_content" => files::template_content(ctx, &params(table)?).map(drop),
            "line" => files::line(ctx, &params(table)?).map(drop),
            "user" => system::user(ctx, &params(table)?).map(drop),
            "group" => system::group(ctx, &params(table)?).map(drop),
            "package" => system::package(ctx, &params(table)?).map(drop),
            "service" => system::service(ctx, &params(table)?).map(drop),
            "daemon_reload" => systemd::daemon_reload(ctx, &params(table)?).map(drop),
            "git_repo" => git::repo(ctx, &params(table)?).map(drop),
            "defaults" => self.apply_defaults(ctx, params(table)?),
            other => Err(OpError::Parameter(format!(
                "unknown operation kind '{other}'"
            ))),
        })();

        outcome.map_err(|e| self.fail(e.to_string()))
    }

    fn apply_defaults(
        &mut self,
        ctx: &mut RunContext<'_>,
        params: DefaultsOpParams,
    ) -> Result<(), OpError> {
        if params.reset {
            ctx.defaults.reset_frame();
            return Ok(());
        }
        let requested = skiff_core::RemoteSettings {
            as_user: params.as_user,
            as_group: params.as_group,
            owner: params.owner,
            group: params.group,
            file_mode: params.file_mode,
            dir_mode: params.dir_mode,
            umask: params.umask,
            cwd: params.cwd,
        }
        .canonicalized()?;
        let effective = ctx
            .conn
            .base_settings()
            .overlay(&ctx.defaults.current())
            .overlay(&requested);
        let resolved = ctx.conn.resolve_defaults(&effective)?;
        ctx.defaults.push(resolved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_script_file() {
        let script: ScriptFile = toml::from_str(
            r#"
            name = "deploy web"

            [params.site]
            type = "str"
            default = "main"

            [params.port]
            type = "int"

            [[ops]]
            kind = "directory"
            path = "/srv/${site}"
            mode = "755"

            [[ops]]
            kind = "script"
            path = "tasks/nginx.toml"
            params = { site = "${site}" }
            "#,
        )
        .unwrap();
        assert_eq!(script.name.as_deref(), Some("deploy web"));
        assert_eq!(script.ops.len(), 2);
        assert!(script.params["site"].default.is_some());
        assert!(script.params["port"].default.is_none());
    }

    #[test]
    fn test_flatten_vars_dotted_keys() {
        let vars: BTreeMap<String, toml::Value> = toml::from_str(
            r#"
            editor = "vi"
            port = 8080
            enabled = true

            [nginx]
            worker_processes = 4
            "#,
        )
        .unwrap();
        let flat = flatten_vars(&vars);
        assert_eq!(flat["editor"], "vi");
        assert_eq!(flat["port"], "8080");
        assert_eq!(flat["enabled"], "true");
        assert_eq!(flat["nginx.worker_processes"], "4");
    }

    #[test]
    fn test_expand_value_recurses() {
        let context: BTreeMap<String, String> =
            [("site".to_owned(), "blog".to_owned())].into();
        let value: toml::Value = toml::from_str(
            r#"
            path = "/srv/${site}"
            names = ["${site}", "static"]
            count = 3
            "#,
        )
        .unwrap();
        let expanded = expand_value("<test>", &value, &context).unwrap();
        assert_eq!(expanded["path"].as_str(), Some("/srv/blog"));
        assert_eq!(expanded["names"][0].as_str(), Some("blog"));
        assert_eq!(expanded["count"].as_integer(), Some(3));
    }

    #[test]
    fn test_expand_value_undefined_reference() {
        let value: toml::Value = toml::from_str(r#"path = "/srv/${nope}""#).unwrap();
        let err = expand_value("<test>", &value, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    use skiff_connect::{ConnectError, Connection, Connector};
    use skiff_ops::{NullReporter, OpFlags, RunContext, VarExpand};
    use skiff_proto::{Packet, StatType};
    use tempfile::TempDir;

    /// A connector that synthesizes plausible replies for every
    /// probing request, so runner behavior can be driven without a
    /// remote.
    struct AutoConnector;

    impl Connector for AutoConnector {
        fn open(&mut self) -> Result<(), ConnectError> {
            Ok(())
        }

        fn request(&mut self, packet: &Packet) -> Result<Packet, ConnectError> {
            Ok(match packet {
                Packet::ResolveUser { .. } | Packet::ResolveGroup { .. } => {
                    Packet::ResolveResult {
                        value: "root".into(),
                    }
                }
                Packet::Stat { .. } => Packet::StatResult {
                    file_type: StatType::Dir,
                    mode: 0o755,
                    owner: "root".into(),
                    group: "root".into(),
                    size: 0,
                    mtime: 0,
                    ctime: 0,
                    sha512sum: None,
                },
                _ => Packet::Ok,
            })
        }

        fn close(&mut self) -> Result<(), ConnectError> {
            Ok(())
        }

        fn scheme(&self) -> &'static str {
            "auto"
        }
    }

    fn run_in(dir: &TempDir, script: &str, params: toml::value::Table) -> Result<(), String> {
        let path = dir.path().join("deploy.toml");
        std::fs::write(&path, script).unwrap();

        let mut conn = Connection::open(Box::new(AutoConnector)).unwrap();
        let mut reporter = NullReporter;
        let engine = VarExpand;
        let mut ctx = RunContext::new(
            &mut conn,
            &mut reporter,
            &engine,
            OpFlags::default(),
            BTreeMap::new(),
            dir.path().to_path_buf(),
        );
        let mut runner = ScriptRunner::new(BTreeMap::new());
        runner
            .run_script(&mut ctx, &path, &params, None, false)
            .map_err(|e| e.message().to_owned())
    }

    #[test]
    fn test_empty_script_runs() {
        let dir = TempDir::new().unwrap();
        run_in(&dir, "", toml::value::Table::new()).unwrap();
    }

    #[test]
    fn test_missing_required_param() {
        let dir = TempDir::new().unwrap();
        let err = run_in(
            &dir,
            "[params.site]\ntype = \"str\"\n",
            toml::value::Table::new(),
        )
        .unwrap_err();
        assert!(err.contains("requires parameter 'site'"), "{err}");
    }

    #[test]
    fn test_default_satisfies_param_and_extraneous_ignored() {
        let dir = TempDir::new().unwrap();
        let mut params = toml::value::Table::new();
        params.insert("unused".into(), toml::Value::Integer(1));
        run_in(
            &dir,
            "[params.site]\ndefault = \"main\"\n",
            params,
        )
        .unwrap();
    }

    #[test]
    fn test_recursion_rejected() {
        let dir = TempDir::new().unwrap();
        let err = run_in(
            &dir,
            "[[ops]]\nkind = \"script\"\npath = \"deploy.toml\"\n",
            toml::value::Table::new(),
        )
        .unwrap_err();
        assert!(err.contains("recursive"), "{err}");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let dir = TempDir::new().unwrap();
        let err = run_in(
            &dir,
            "[[ops]]\nkind = \"telnet\"\n",
            toml::value::Table::new(),
        )
        .unwrap_err();
        assert!(err.contains("unknown operation kind 'telnet'"), "{err}");
    }

    #[test]
    fn test_stack_error_rendering() {
        let frames = vec![
            StackFrame {
                file: "deploy.toml".into(),
                real_path: PathBuf::from("/x/deploy.toml"),
                op_index: Some(2),
                op_kind: Some("script".into()),
            },
            StackFrame {
                file: "tasks/nginx.toml".into(),
                real_path: PathBuf::from("/x/tasks/nginx.toml"),
                op_index: Some(0),
                op_kind: Some("package".into()),
            },
        ];
        let error = ScriptStackError::new(&frames, "boom".into());
        let rendered = error.render_stack();
        assert!(rendered.starts_with("Script stack (most recent call last):"));
        assert!(rendered.contains("File \"deploy.toml\", op 3 (script)"));
        assert!(rendered.contains("File \"tasks/nginx.toml\", op 1 (package)"));
        assert_eq!(error.message(), "boom");
    }
}
