//! The apt package manager backend.

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

/// Adds or removes system packages with apt-get.
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
                // dpkg-query exits non-zero for unknown packages and
                // reports "deinstall" states for removed-but-configured
                // ones, so check the status text.
                let argv = with_opts(
                    &["dpkg-query", "--show", "--showformat=${Status}"],
                    &[],
                    package,
                );
                let result = ctx.run_unchecked(&argv)?;
                Ok(result
                    .stdout
                    .as_deref()
                    .is_some_and(|out| out.windows(12).any(|w| w == b"ok installed")))
            },
            |ctx, package, present| {
                let argv = if present {
                    with_opts(&["apt-get", "--yes", "install"], &params.opts, package)
                } else {
                    with_opts(&["apt-get", "--yes", "remove"], &params.opts, package)
                };
                ctx.run(&argv)?;
                Ok(())
            },
        )
    })();
    finalize(ctx, &mut op, outcome, params.check)
}
