//! The pacman package manager backend.

use crate::context::{finalize, RunContext};
use crate::error::OpError;
use crate::op::{Op, OperationResult};
use crate::system::{generic_package, PackageParams};

fn with_opts<'a>(base: &[&'a str], opts: &'a [String], package: &'a str) -> Vec<&'a str> {
    let mut argv: Vec<&str> = base.to_vec();
    argv.extend(opts.iter().map(String::as_str));
    argv.extend(["--", package]);
    argv
}

/// Adds or removes system packages with pacman.
pub fn package(
    ctx: &mut RunContext<'_>,
    params: &PackageParams,
) -> Result<OperationResult, OpError> {
    let mut op = Op::new("package", params.name.clone());
    let outcome = (|| {
        op.desc(ctx, format!("{:?}", params.packages));
        generic_package(
            ctx,
            &mut op,
            params,
            |ctx, package| {
                let argv = with_opts(&["pacman", "-Ql"], &params.opts, package);
                Ok(ctx.run_unchecked(&argv)?.returncode == 0)
            },
            |ctx, package, present| {
                let argv = if present {
                    with_opts(
                        &["pacman", "--color", "always", "--noconfirm", "-S"],
                        &params.opts,
                        package,
                    )
                } else {
                    with_opts(
                        &["pacman", "--color", "always", "--noconfirm", "-Rns"],
                        &params.opts,
                        package,
                    )
                };
                ctx.run(&argv)?;
                Ok(())
            },
        )
    })();
    finalize(ctx, &mut op, outcome, params.check)
}
