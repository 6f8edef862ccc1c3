//! Operations on files, directories, links and file content.

use crate::context::{finalize, RunContext};
use crate::error::OpError;
use crate::op::{Op, OperationResult};
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use skiff_core::state::StateValue;
use skiff_core::RemoteSettings;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

fn default_true() -> bool {
    true
}

/// Asserts that a path is non-empty and absolute.
pub(crate) fn check_absolute_path(path: &str) -> Result<(), OpError> {
    if path.is_empty() {
        return Err(OpError::Parameter("path must be non-empty".to_owned()));
    }
    if !path.starts_with('/') {
        return Err(OpError::Parameter("path must be absolute".to_owned()));
    }
    Ok(())
}

/// Appends the basename of `src` when `dest` denotes a directory by
/// its trailing slash.
fn qualify_dest(dest: &str, src: &str) -> String {
    if dest.ends_with('/') {
        let base = Path::new(src)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{dest}{base}")
    } else {
        dest.to_owned()
    }
}

/// Resolves a local source path against the deploy root.
fn local_path(ctx: &RunContext<'_>, src: &str) -> PathBuf {
    let path = Path::new(src);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        ctx.local_base.join(path)
    }
}

// ---- directory -------------------------------------------------------------

/// Parameters of [`directory`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryParams {
    /// The directory path.
    pub path: String,
    /// Whether the directory should exist. `false` deletes it and its
    /// contents.
    #[serde(default = "default_true")]
    pub present: bool,
    /// Update access and modification times of an existing directory.
    #[serde(default)]
    pub touch: bool,
    /// Directory mode; current defaults when absent.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owner; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Manages the state of a directory on the remote host. Fails if the
/// path exists but is not a directory.
pub fn directory(
    ctx: &mut RunContext<'_>,
    params: &DirectoryParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("dir", params.name.clone());
    let outcome = directory_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn directory_inner(
    ctx: &mut RunContext<'_>,
    params: &DirectoryParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    check_absolute_path(&params.path)?;
    op.desc(ctx, &params.path);

    let overrides = RemoteSettings {
        dir_mode: params.mode.clone(),
        owner: params.owner.clone(),
        group: params.group.clone(),
        ..RemoteSettings::default()
    };
    ctx.with_defaults(overrides, |ctx, attrs| {
        if params.present {
            op.final_state([
                ("exists", StateValue::Bool(true)),
                ("mode", attrs.dir_mode.as_str().into()),
                ("owner", attrs.owner.as_str().into()),
                ("group", attrs.group.as_str().into()),
                ("touched", StateValue::Bool(params.touch)),
            ])?;
        } else {
            op.final_state([
                ("exists", StateValue::Bool(false)),
                ("mode", StateValue::Nil),
                ("owner", StateValue::Nil),
                ("group", StateValue::Nil),
                ("touched", StateValue::Bool(false)),
            ])?;
        }

        // Examine current state
        match ctx.conn.stat(&params.path, false, false)? {
            None => op.initial_state([
                ("exists", StateValue::Bool(false)),
                ("mode", StateValue::Nil),
                ("owner", StateValue::Nil),
                ("group", StateValue::Nil),
                ("touched", StateValue::Bool(false)),
            ])?,
            Some(stat) => {
                if stat.file_type != skiff_proto::StatType::Dir {
                    return Ok(op.failure(
                        ctx,
                        format!("path '{}' exists but is not a directory!", params.path),
                    ));
                }
                op.initial_state([
                    ("exists", StateValue::Bool(true)),
                    ("mode", stat.mode.as_str().into()),
                    ("owner", stat.owner.as_str().into()),
                    ("group", stat.group.as_str().into()),
                    ("touched", StateValue::Bool(false)),
                ])?;
            }
        }

        if op.unchanged(false)? {
            return op.success(ctx);
        }

        if !ctx.flags.dry_run {
            if params.present {
                if op.changed("exists")? {
                    ctx.run(&["mkdir", "--", &params.path])?;
                }
                if op.changed("mode")? {
                    ctx.run(&["chmod", &attrs.dir_mode, "--", &params.path])?;
                }
                if op.changed("owner")? || op.changed("group")? {
                    let owner_group = format!("{}:{}", attrs.owner, attrs.group);
                    ctx.run(&["chown", &owner_group, "--", &params.path])?;
                }
                if !op.changed("exists")? && op.changed("touched")? {
                    ctx.run(&["touch", "--", &params.path])?;
                }
            } else if op.changed("exists")? {
                ctx.run(&["rm", "-rf", "--", &params.path])?;
            }
        }

        op.success(ctx)
    })
}

// ---- file ------------------------------------------------------------------

/// Parameters of [`file`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileParams {
    /// The remote file path.
    pub path: String,
    /// Whether the file should exist.
    #[serde(default = "default_true")]
    pub present: bool,
    /// Update access and modification times of an existing file.
    #[serde(default)]
    pub touch: bool,
    /// File mode; current defaults when absent.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owner; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Creates, deletes or updates a file. Fails if the path exists but
/// is not a regular file.
pub fn file(ctx: &mut RunContext<'_>, params: &FileParams) -> Result<OperationResult, OpError> {
    let mut op = Op::new("file", params.name.clone());
    let outcome = file_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn file_inner(
    ctx: &mut RunContext<'_>,
    params: &FileParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    check_absolute_path(&params.path)?;
    op.desc(ctx, &params.path);

    let overrides = RemoteSettings {
        file_mode: params.mode.clone(),
        owner: params.owner.clone(),
        group: params.group.clone(),
        ..RemoteSettings::default()
    };
    ctx.with_defaults(overrides, |ctx, attrs| {
        if params.present {
            op.final_state([
                ("exists", StateValue::Bool(true)),
                ("mode", attrs.file_mode.as_str().into()),
                ("owner", attrs.owner.as_str().into()),
                ("group", attrs.group.as_str().into()),
                ("touched", StateValue::Bool(params.touch)),
            ])?;
        } else {
            op.final_state([
                ("exists", StateValue::Bool(false)),
                ("mode", StateValue::Nil),
                ("owner", StateValue::Nil),
                ("group", StateValue::Nil),
                ("touched", StateValue::Bool(false)),
            ])?;
        }

        match ctx.conn.stat(&params.path, false, false)? {
            None => op.initial_state([
                ("exists", StateValue::Bool(false)),
                ("mode", StateValue::Nil),
                ("owner", StateValue::Nil),
                ("group", StateValue::Nil),
                ("touched", StateValue::Bool(false)),
            ])?,
            Some(stat) => {
                if stat.file_type != skiff_proto::StatType::File {
                    return Ok(op.failure(
                        ctx,
                        format!("path '{}' exists but is not a file!", params.path),
                    ));
                }
                op.initial_state([
                    ("exists", StateValue::Bool(true)),
                    ("mode", stat.mode.as_str().into()),
                    ("owner", stat.owner.as_str().into()),
                    ("group", stat.group.as_str().into()),
                    ("touched", StateValue::Bool(false)),
                ])?;
            }
        }

        if op.unchanged(false)? {
            return op.success(ctx);
        }

        if !ctx.flags.dry_run {
            if params.present {
                if op.changed("exists")? || op.changed("touched")? {
                    ctx.run(&["touch", "--", &params.path])?;
                }
                if op.changed("mode")? {
                    ctx.run(&["chmod", &attrs.file_mode, "--", &params.path])?;
                }
                if op.changed("owner")? || op.changed("group")? {
                    let owner_group = format!("{}:{}", attrs.owner, attrs.group);
                    ctx.run(&["chown", &owner_group, "--", &params.path])?;
                }
            } else if op.changed("exists")? {
                ctx.run(&["rm", "--", &params.path])?;
            }
        }

        op.success(ctx)
    })
}

// ---- link ------------------------------------------------------------------

/// Parameters of [`link`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkParams {
    /// The path of the link itself.
    pub path: String,
    /// The target the link points to.
    pub target: String,
    /// Whether the link should exist.
    #[serde(default = "default_true")]
    pub present: bool,
    /// Update the link's own access and modification times.
    #[serde(default)]
    pub touch: bool,
    /// Owner; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Creates, deletes or updates a symbolic link. Fails if the path
/// exists but is not a link.
pub fn link(ctx: &mut RunContext<'_>, params: &LinkParams) -> Result<OperationResult, OpError> {
    let mut op = Op::new("link", params.name.clone());
    let outcome = link_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn link_inner(
    ctx: &mut RunContext<'_>,
    params: &LinkParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    check_absolute_path(&params.path)?;
    if params.target.is_empty() {
        return Err(OpError::Parameter("link target cannot be empty".to_owned()));
    }
    op.desc(ctx, &params.path);

    let overrides = RemoteSettings {
        owner: params.owner.clone(),
        group: params.group.clone(),
        ..RemoteSettings::default()
    };
    ctx.with_defaults(overrides, |ctx, attrs| {
        if params.present {
            op.final_state([
                ("exists", StateValue::Bool(true)),
                ("target", params.target.as_str().into()),
                ("owner", attrs.owner.as_str().into()),
                ("group", attrs.group.as_str().into()),
                ("touched", StateValue::Bool(params.touch)),
            ])?;
        } else {
            op.final_state([
                ("exists", StateValue::Bool(false)),
                ("target", StateValue::Nil),
                ("owner", StateValue::Nil),
                ("group", StateValue::Nil),
                ("touched", StateValue::Bool(false)),
            ])?;
        }

        match ctx.conn.stat(&params.path, false, false)? {
            None => op.initial_state([
                ("exists", StateValue::Bool(false)),
                ("target", StateValue::Nil),
                ("owner", StateValue::Nil),
                ("group", StateValue::Nil),
                ("touched", StateValue::Bool(false)),
            ])?,
            Some(stat) => {
                if stat.file_type != skiff_proto::StatType::Link {
                    return Ok(op.failure(
                        ctx,
                        format!("path '{}' exists but is not a link!", params.path),
                    ));
                }
                let existing = ctx.run(&["readlink", "-n", &params.path])?;
                op.initial_state([
                    ("exists", StateValue::Bool(true)),
                    (
                        "target",
                        String::from_utf8_lossy(existing.stdout.as_deref().unwrap_or_default())
                            .into_owned()
                            .into(),
                    ),
                    ("owner", stat.owner.as_str().into()),
                    ("group", stat.group.as_str().into()),
                    ("touched", StateValue::Bool(false)),
                ])?;
            }
        }

        if op.unchanged(false)? {
            return op.success(ctx);
        }

        if !ctx.flags.dry_run {
            if params.present {
                if op.changed("target")? {
                    ctx.run(&["ln", "-sf", "--", &params.target, &params.path])?;
                }
                if op.changed("owner")? || op.changed("group")? {
                    let owner_group = format!("{}:{}", attrs.owner, attrs.group);
                    ctx.run(&[
                        "chown",
                        "--no-dereference",
                        &owner_group,
                        "--",
                        &params.path,
                    ])?;
                }
                if !op.changed("exists")? && op.changed("touched")? {
                    ctx.run(&["touch", "--no-dereference", "--", &params.path])?;
                }
            } else if op.changed("exists")? {
                ctx.run(&["rm", "--", &params.path])?;
            }
        }

        op.success(ctx)
    })
}

// ---- content uploads -------------------------------------------------------

/// Saves content to a remote path: the shared tail of the upload and
/// template operations. Uploads when existence or content hash
/// differ, otherwise fixes up metadata with chmod/chown.
fn save_content(
    ctx: &mut RunContext<'_>,
    op: &mut Op,
    content: Vec<u8>,
    dest: &str,
    mode: Option<String>,
    owner: Option<String>,
    group: Option<String>,
) -> Result<OperationResult, OpError> {
    let overrides = RemoteSettings {
        file_mode: mode,
        owner,
        group,
        ..RemoteSettings::default()
    };
    ctx.with_defaults(overrides, |ctx, attrs| {
        let final_sha512 = Sha512::digest(&content).to_vec();
        op.final_state([
            ("exists", StateValue::Bool(true)),
            ("mode", attrs.file_mode.as_str().into()),
            ("owner", attrs.owner.as_str().into()),
            ("group", attrs.group.as_str().into()),
            ("sha512", StateValue::Bytes(final_sha512)),
        ])?;

        match ctx.conn.stat(dest, false, true)? {
            None => op.initial_state([
                ("exists", StateValue::Bool(false)),
                ("mode", StateValue::Nil),
                ("owner", StateValue::Nil),
                ("group", StateValue::Nil),
                ("sha512", StateValue::Nil),
            ])?,
            Some(stat) => {
                if stat.file_type != skiff_proto::StatType::File {
                    return Err(OpError::Failure(format!(
                        "path '{dest}' exists but is not a file!"
                    )));
                }
                op.initial_state([
                    ("exists", StateValue::Bool(true)),
                    ("mode", stat.mode.as_str().into()),
                    ("owner", stat.owner.as_str().into()),
                    ("group", stat.group.as_str().into()),
                    ("sha512", stat.sha512sum.into()),
                ])?;
            }
        }

        if op.unchanged(false)? {
            return op.success(ctx);
        }

        if ctx.flags.diffs {
            let old = ctx.conn.download_or(dest, None)?;
            op.diff(dest, old, Some(content.clone()));
        }

        if !ctx.flags.dry_run {
            if op.changed("exists")? || op.changed("sha512")? {
                ctx.conn.upload(
                    dest,
                    content.clone(),
                    Some(attrs.file_mode.clone()),
                    Some(attrs.owner.clone()),
                    Some(attrs.group.clone()),
                )?;
            } else {
                if op.changed("mode")? {
                    ctx.run(&["chmod", &attrs.file_mode, "--", dest])?;
                }
                if op.changed("owner")? || op.changed("group")? {
                    let owner_group = format!("{}:{}", attrs.owner, attrs.group);
                    ctx.run(&["chown", &owner_group, "--", dest])?;
                }
            }
        }

        op.success(ctx)
    })
}

/// Parameters of [`upload_content`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadContentParams {
    /// The literal content to upload.
    pub content: String,
    /// The remote destination path.
    pub dest: String,
    /// File mode; current defaults when absent.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owner; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Uploads the given content as a file to the remote host.
pub fn upload_content(
    ctx: &mut RunContext<'_>,
    params: &UploadContentParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("upload_content", params.name.clone());
    let outcome = (|| {
        check_absolute_path(&params.dest)?;
        op.desc(ctx, &params.dest);
        save_content(
            ctx,
            &mut op,
            params.content.clone().into_bytes(),
            &params.dest,
            params.mode.clone(),
            params.owner.clone(),
            params.group.clone(),
        )
    })();
    finalize(ctx, &mut op, outcome, params.check)
}

/// Parameters of [`upload`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadParams {
    /// The local file to upload, relative to the deploy root.
    pub src: String,
    /// The remote destination path. A trailing slash appends the
    /// source basename.
    pub dest: String,
    /// File mode; current defaults when absent.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owner; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Uploads a local file to the remote host, overwriting an existing
/// destination.
pub fn upload(ctx: &mut RunContext<'_>, params: &UploadParams) -> Result<OperationResult, OpError> {
    let mut op = Op::new("upload", params.name.clone());
    let outcome = (|| {
        check_absolute_path(&params.dest)?;
        let dest = qualify_dest(&params.dest, &params.src);
        op.desc(ctx, &dest);
        let content = std::fs::read(local_path(ctx, &params.src))?;
        save_content(
            ctx,
            &mut op,
            content,
            &dest,
            params.mode.clone(),
            params.owner.clone(),
            params.group.clone(),
        )
    })();
    finalize(ctx, &mut op, outcome, params.check)
}

/// Parameters of [`upload_dir`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadDirParams {
    /// The local directory to upload, relative to the deploy root.
    pub src: String,
    /// The remote destination. A trailing slash makes the source a
    /// child of this directory, otherwise it becomes this directory.
    pub dest: String,
    /// Mode for created directories; current defaults when absent.
    #[serde(default)]
    pub dir_mode: Option<String>,
    /// Mode for uploaded files; current defaults when absent.
    #[serde(default)]
    pub file_mode: Option<String>,
    /// Owner for everything; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group for everything; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Uploads a directory tree. Unrelated files in an existing
/// destination are left untouched; only regular files and directories
/// are considered.
pub fn upload_dir(
    ctx: &mut RunContext<'_>,
    params: &UploadDirParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("upload_dir", params.name.clone());
    op.nested();
    let outcome = upload_dir_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn upload_dir_inner(
    ctx: &mut RunContext<'_>,
    params: &UploadDirParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    check_absolute_path(&params.dest)?;
    let src = local_path(ctx, &params.src);
    if !src.is_dir() {
        return Err(OpError::Parameter(format!(
            "src '{}' must be a directory",
            params.src
        )));
    }

    let dest = qualify_dest(&params.dest, &params.src);
    op.desc(ctx, &dest);
    ctx.reporter.indent();

    // Collect destination directories and file pairs first, then
    // apply as nested operations.
    let mut dirs: Vec<String> = vec![dest.clone()];
    let mut file_pairs: Vec<(PathBuf, String)> = Vec::new();
    for entry in WalkDir::new(&src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| OpError::Parameter(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(&src)
            .expect("walkdir stays under src");
        let remote = format!("{dest}/{}", rel.to_string_lossy());
        if entry.file_type().is_dir() {
            dirs.push(remote);
        } else if entry.file_type().is_file() {
            file_pairs.push((entry.path().to_path_buf(), remote));
        }
    }

    let mut run = || -> Result<(), OpError> {
        for dir in &dirs {
            let result = directory(
                ctx,
                &DirectoryParams {
                    path: dir.clone(),
                    present: true,
                    touch: false,
                    mode: params.dir_mode.clone(),
                    owner: params.owner.clone(),
                    group: params.group.clone(),
                    name: None,
                    check: true,
                },
            )?;
            op.add_nested_result(dir.clone(), &result)?;
        }
        for (local, remote) in &file_pairs {
            let result = upload(
                ctx,
                &UploadParams {
                    src: local.to_string_lossy().into_owned(),
                    dest: remote.clone(),
                    mode: params.file_mode.clone(),
                    owner: params.owner.clone(),
                    group: params.group.clone(),
                    name: None,
                    check: true,
                },
            )?;
            op.add_nested_result(remote.clone(), &result)?;
        }
        Ok(())
    };
    let result = run();
    ctx.reporter.dedent();
    result?;

    op.success(ctx)
}

// ---- templates -------------------------------------------------------------

/// Parameters of [`template_content`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateContentParams {
    /// The template text.
    pub content: String,
    /// The remote destination path.
    pub dest: String,
    /// Extra template variables, overshadowing host variables.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// File mode; current defaults when absent.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owner; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

fn render_context(
    ctx: &RunContext<'_>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = ctx.template_vars.clone();
    merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Renders the given template text and uploads the result.
pub fn template_content(
    ctx: &mut RunContext<'_>,
    params: &TemplateContentParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("template_content", params.name.clone());
    let outcome = (|| {
        check_absolute_path(&params.dest)?;
        op.desc(ctx, &params.dest);
        let context = render_context(ctx, &params.context);
        let rendered = ctx.engine.render("<inline>", &params.content, &context)?;
        save_content(
            ctx,
            &mut op,
            rendered,
            &params.dest,
            params.mode.clone(),
            params.owner.clone(),
            params.group.clone(),
        )
    })();
    finalize(ctx, &mut op, outcome, params.check)
}

/// Parameters of [`template`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateParams {
    /// The local template file, relative to the deploy root.
    pub src: String,
    /// The remote destination path. A trailing slash appends the
    /// source basename.
    pub dest: String,
    /// Extra template variables, overshadowing host variables.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// File mode; current defaults when absent.
    #[serde(default)]
    pub mode: Option<String>,
    /// Owner; current defaults when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group; current defaults when absent.
    #[serde(default)]
    pub group: Option<String>,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Renders a local template file and uploads the result. Host
/// variables are available in the template; the `context` parameter
/// overshadows them.
pub fn template(
    ctx: &mut RunContext<'_>,
    params: &TemplateParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("template", params.name.clone());
    let outcome = (|| {
        check_absolute_path(&params.dest)?;
        let dest = qualify_dest(&params.dest, &params.src);
        op.desc(ctx, &dest);
        let source = std::fs::read_to_string(local_path(ctx, &params.src))?;
        let context = render_context(ctx, &params.context);
        let rendered = ctx.engine.render(&params.src, &source, &context)?;
        save_content(
            ctx,
            &mut op,
            rendered,
            &dest,
            params.mode.clone(),
            params.owner.clone(),
            params.group.clone(),
        )
    })();
    finalize(ctx, &mut op, outcome, params.check)
}

// ---- line ------------------------------------------------------------------

/// Backup behavior of [`line`]: disabled, enabled with a generated
/// timestamp suffix, or a caller-chosen filename relative to the
/// managed file's directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Backup {
    /// `backup = true` / `backup = false`.
    Toggle(bool),
    /// `backup = "pre-change.bak"`.
    Suffix(String),
}

impl Default for Backup {
    fn default() -> Self {
        Backup::Toggle(false)
    }
}

/// Parameters of [`line`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LineParams {
    /// The file to manage.
    pub path: String,
    /// The line to add or remove. Unused when deleting by regex.
    #[serde(default)]
    pub line: String,
    /// Whether the line should exist in the file.
    #[serde(default = "default_true")]
    pub present: bool,
    /// A regex deciding whether the line exists; a match anywhere in
    /// a line counts. Literal search when absent.
    #[serde(default)]
    pub regex: Option<String>,
    /// Strip both sides before comparing in literal mode.
    #[serde(default = "default_true")]
    pub ignore_whitespace: bool,
    /// Back up the old file before changing it.
    #[serde(default)]
    pub backup: Backup,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Splits content into lines, dropping the empty trailer a final
/// newline produces.
fn split_lines(content: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = content.split(|b| *b == b'\n').collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Manages a single line in a file. New lines are appended at the
/// end; a missing file is created with the current default mode,
/// owner and group.
pub fn line(ctx: &mut RunContext<'_>, params: &LineParams) -> Result<OperationResult, OpError> {
    let mut op = Op::new("line", params.name.clone());
    let outcome = line_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn line_inner(
    ctx: &mut RunContext<'_>,
    params: &LineParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    check_absolute_path(&params.path)?;
    op.desc(ctx, &params.path);

    // Two compilations of the same pattern: one per-line for the
    // removal filter, one multi-line so anchors work when probing the
    // whole file for presence.
    let matcher = match &params.regex {
        Some(pattern) => Some(regex::bytes::Regex::new(pattern).map_err(|e| {
            OpError::Parameter(format!("invalid regex '{pattern}': {e}"))
        })?),
        None => None,
    };
    let presence_matcher = match &params.regex {
        Some(pattern) => Some(
            regex::bytes::Regex::new(&format!("(?m){pattern}"))
                .map_err(|e| OpError::Parameter(format!("invalid regex '{pattern}': {e}")))?,
        ),
        None => None,
    };

    ctx.with_defaults(RemoteSettings::default(), |ctx, attrs| {
        op.final_state([("line_present", StateValue::Bool(params.present))])?;

        let mut orig: Option<Vec<u8>> = None;
        let mut line_present = false;

        match ctx.conn.stat(&params.path, false, false)? {
            None => {}
            Some(stat) => {
                if stat.file_type != skiff_proto::StatType::File {
                    return Ok(op.failure(
                        ctx,
                        format!("path '{}' exists but is not a file!", params.path),
                    ));
                }
                let content = ctx.conn.download(&params.path)?;
                line_present = match &presence_matcher {
                    Some(re) => re.is_match(&content),
                    None => split_lines(&content).iter().any(|l| {
                        if params.ignore_whitespace {
                            l.trim_ascii() == params.line.trim().as_bytes()
                        } else {
                            *l == params.line.as_bytes()
                        }
                    }),
                };
                orig = Some(content);
            }
        }

        op.initial_state([("line_present", StateValue::Bool(line_present))])?;

        if op.unchanged(false)? {
            return op.success(ctx);
        }

        let mut lines: Vec<Vec<u8>> = orig
            .as_deref()
            .map(|c| split_lines(c).into_iter().map(<[u8]>::to_vec).collect())
            .unwrap_or_default();
        if params.present {
            lines.push(params.line.clone().into_bytes());
        } else {
            lines.retain(|l| match &matcher {
                Some(re) => !re.is_match(l),
                None => {
                    if params.ignore_whitespace {
                        l.trim_ascii() != params.line.trim().as_bytes()
                    } else {
                        l.as_slice() != params.line.as_bytes()
                    }
                }
            });
        }
        let mut new_content: Vec<u8> = lines.join(&b'\n');
        new_content.push(b'\n');

        if ctx.flags.diffs {
            op.diff(&params.path, orig.clone(), Some(new_content.clone()));
        }

        if !ctx.flags.dry_run {
            match &orig {
                None => {
                    ctx.conn.upload(
                        &params.path,
                        new_content,
                        Some(attrs.file_mode.clone()),
                        Some(attrs.owner.clone()),
                        Some(attrs.group.clone()),
                    )?;
                }
                Some(_) => {
                    let backup_dest = match &params.backup {
                        Backup::Toggle(false) => None,
                        Backup::Toggle(true) => {
                            let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                            Some(format!("{}.{stamp}.bak", params.path))
                        }
                        Backup::Suffix(suffix) => {
                            let parent = Path::new(&params.path)
                                .parent()
                                .map(|p| p.to_string_lossy().into_owned())
                                .unwrap_or_default();
                            Some(format!("{parent}/{suffix}"))
                        }
                    };
                    if let Some(backup_dest) = backup_dest {
                        ctx.run(&["cp", "-a", "--", &params.path, &backup_dest])?;
                    }
                    ctx.conn.upload(&params.path, new_content, None, None, None)?;
                }
            }
        }

        op.success(ctx)
    })
}
