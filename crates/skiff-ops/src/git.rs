//! Git checkout management.

use crate::context::{finalize, RunContext};
use crate::error::OpError;
use crate::files::check_absolute_path;
use crate::op::{Op, OperationResult};
use serde::Deserialize;
use skiff_core::state::StateValue;
use skiff_proto::StatType;

fn default_true() -> bool {
    true
}

/// Parameters of [`repo`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepoParams {
    /// The url of the git repository.
    pub url: String,
    /// Where the repository should be cloned.
    pub path: String,
    /// A branch or tag to check out; the remote's default branch when
    /// absent.
    #[serde(default)]
    pub branch_or_tag: Option<String>,
    /// Keep an existing clone up to date.
    #[serde(default = "default_true")]
    pub update: bool,
    /// Keep the clone shallow with this many commits; also applies
    /// when pulling.
    #[serde(default)]
    pub depth: Option<u64>,
    /// Pull with `--rebase`.
    #[serde(default = "default_true")]
    pub rebase: bool,
    /// Pull with `--ff-only`.
    #[serde(default)]
    pub ff_only: bool,
    /// Initialize and update submodules after cloning or pulling.
    #[serde(default)]
    pub update_submodules: bool,
    /// Recurse into nested submodules.
    #[serde(default)]
    pub recursive_submodules: bool,
    /// Apply `depth` to submodule updates too.
    #[serde(default)]
    pub shallow_submodules: bool,
    /// Optional operation label.
    #[serde(default)]
    pub name: Option<String>,
    /// Abort the script when this operation fails.
    #[serde(default = "default_true")]
    pub check: bool,
}

/// Clones or updates a git repository and, on request, its
/// submodules.
pub fn repo(ctx: &mut RunContext<'_>, params: &RepoParams) -> Result<OperationResult, OpError> {
    let mut op = Op::new("repo", params.name.clone());
    let outcome = repo_inner(ctx, params, &mut op);
    finalize(ctx, &mut op, outcome, params.check)
}

fn submodule_update(ctx: &mut RunContext<'_>, params: &RepoParams) -> Result<(), OpError> {
    let depth = params.depth.map(|d| d.to_string());
    let mut argv: Vec<&str> = vec!["git", "-C", &params.path, "submodule", "update", "--init"];
    if let (true, Some(depth)) = (params.shallow_submodules, &depth) {
        argv.extend(["--depth", depth.as_str()]);
    }
    if params.recursive_submodules {
        argv.push("--recursive");
    }
    ctx.run(&argv)?;
    Ok(())
}

fn repo_inner(
    ctx: &mut RunContext<'_>,
    params: &RepoParams,
    op: &mut Op,
) -> Result<OperationResult, OpError> {
    check_absolute_path(&params.path)?;
    op.desc(ctx, format!("{} [{}]", params.path, params.url));

    // Examine current state
    let stat_path = ctx.conn.stat(&params.path, false, false)?;
    let mut current_commit: Option<String> = None;
    match &stat_path {
        None => {
            op.initial_state([
                ("initialized", StateValue::Bool(false)),
                ("commit", StateValue::Nil),
            ])?;
        }
        Some(stat) if stat.file_type == StatType::Dir => {
            let git_dir = format!("{}/.git", params.path);
            match ctx.conn.stat(&git_dir, false, false)? {
                None => {
                    return Ok(op.failure(
                        ctx,
                        format!(
                            "directory '{}' already exists but is not a git repository",
                            params.path
                        ),
                    ))
                }
                Some(git_stat) if git_stat.file_type != StatType::Dir => {
                    return Ok(op.failure(
                        ctx,
                        format!(
                            "directory '{}' already exists but doesn't contain a valid .git directory",
                            params.path
                        ),
                    ))
                }
                Some(_) => {}
            }
            let head = ctx.run(&["git", "-C", &params.path, "rev-parse", "HEAD"])?;
            let commit = head.stdout_trimmed();
            current_commit = Some(commit.clone());
            op.initial_state([
                ("initialized", StateValue::Bool(true)),
                ("commit", commit.into()),
            ])?;
        }
        Some(_) => {
            return Ok(op.failure(
                ctx,
                format!("path '{}' exists but is not a directory!", params.path),
            ))
        }
    }

    // An existing clone that must not be updated freezes at its
    // current commit.
    if stat_path.is_some() && !params.update {
        op.final_state([
            ("initialized", StateValue::Bool(true)),
            ("commit", current_commit.into()),
        ])?;
        return op.success(ctx);
    }

    // Check the newest commit available for the requested ref.
    let reference = params.branch_or_tag.as_deref().unwrap_or("HEAD");
    let ls_remote = ctx.run(&["git", "ls-remote", "--exit-code", "--", &params.url, reference])?;
    let newest_commit = ls_remote
        .stdout_trimmed()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_owned();

    op.final_state([
        ("initialized", StateValue::Bool(true)),
        ("commit", newest_commit.into()),
    ])?;

    if op.unchanged(false)? {
        return op.success(ctx);
    }

    if !ctx.flags.dry_run {
        let depth = params.depth.map(|d| d.to_string());
        if stat_path.is_none() {
            // Fresh clone
            let mut argv: Vec<&str> = vec!["git", "clone"];
            if let Some(depth) = &depth {
                argv.extend(["--depth", depth.as_str()]);
            }
            if let Some(reference) = &params.branch_or_tag {
                argv.extend(["--branch", reference.as_str()]);
            }
            argv.extend(["--", params.url.as_str(), params.path.as_str()]);
            ctx.run(&argv)?;

            if params.update_submodules {
                submodule_update(ctx, params)?;
            }
        } else {
            // Refuse to pull when the checkout tracks a different
            // remote; pulling an unrelated repository in place is
            // never what the deploy meant.
            let remote = ctx
                .run(&["git", "-C", &params.path, "config", "--get", "remote.origin.url"])?
                .stdout_trimmed();
            if remote != params.url {
                return Ok(op.failure(
                    ctx,
                    format!(
                        "refusing to update existing git repository with different remote url '{remote}'"
                    ),
                ));
            }

            let mut argv: Vec<&str> = vec!["git", "-C", &params.path, "pull"];
            if let Some(depth) = &depth {
                argv.extend(["--depth", depth.as_str()]);
            }
            if params.rebase {
                argv.push("--rebase");
            }
            if params.ff_only {
                argv.push("--ff-only");
            }
            ctx.run(&argv)?;

            if params.update_submodules {
                submodule_update(ctx, params)?;
            }
        }
    }

    op.success(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{packets, scripted_connection};
    use crate::reporter::NullReporter;
    use skiff_proto::Packet;

    fn params() -> RepoParams {
        RepoParams {
            url: "https://example.com/repo.git".into(),
            path: "/srv/repo".into(),
            branch_or_tag: None,
            update: true,
            depth: None,
            rebase: true,
            ff_only: false,
            update_submodules: false,
            recursive_submodules: false,
            shallow_submodules: false,
            name: None,
            check: true,
        }
    }

    #[test]
    fn test_fresh_clone() {
        let (mut conn, requests) = scripted_connection(vec![
            packets::stat_missing(), // path
            packets::completed(0, b"abc123\trefs/heads/main\n"), // ls-remote
            packets::completed(0, b""), // clone
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = repo(&mut ctx, &params()).unwrap();
        assert!(result.changed);
        assert_eq!(result.final_state["commit"], StateValue::Str("abc123".into()));
        let log = requests.borrow();
        match log.last().unwrap() {
            Packet::ProcessRun { command, .. } => {
                assert_eq!(command[..2], ["git".to_owned(), "clone".to_owned()]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_up_to_date_checkout_is_unchanged() {
        let (mut conn, _) = scripted_connection(vec![
            packets::stat_entry(StatType::Dir, 0o755), // path
            packets::stat_entry(StatType::Dir, 0o755), // .git
            packets::completed(0, b"abc123\n"),        // rev-parse HEAD
            packets::completed(0, b"abc123\trefs/heads/main\n"), // ls-remote
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let result = repo(&mut ctx, &params()).unwrap();
        assert!(!result.changed);
    }

    #[test]
    fn test_no_update_freezes_commit() {
        let (mut conn, requests) = scripted_connection(vec![
            packets::stat_entry(StatType::Dir, 0o755),
            packets::stat_entry(StatType::Dir, 0o755),
            packets::completed(0, b"abc123\n"),
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let mut p = params();
        p.update = false;
        let result = repo(&mut ctx, &p).unwrap();
        assert!(!result.changed);
        // No ls-remote, no pull.
        assert_eq!(
            requests
                .borrow()
                .iter()
                .filter(|r| matches!(r, Packet::ProcessRun { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_refuses_foreign_remote() {
        let (mut conn, _) = scripted_connection(vec![
            packets::stat_entry(StatType::Dir, 0o755),
            packets::stat_entry(StatType::Dir, 0o755),
            packets::completed(0, b"abc123\n"),
            packets::completed(0, b"def456\trefs/heads/main\n"),
            packets::completed(0, b"https://example.com/other.git\n"), // remote.origin.url
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let err = repo(&mut ctx, &params()).unwrap_err();
        assert!(matches!(err, OpError::Failure(msg) if msg.contains("different remote url")));
    }

    #[test]
    fn test_existing_non_repo_directory_fails() {
        let (mut conn, _) = scripted_connection(vec![
            packets::stat_entry(StatType::Dir, 0o755),
            packets::stat_missing(), // no .git
        ]);
        let mut reporter = NullReporter;
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let err = repo(&mut ctx, &params()).unwrap_err();
        assert!(matches!(err, OpError::Failure(msg) if msg.contains("not a git repository")));
    }
}
