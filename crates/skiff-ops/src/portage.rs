//! The portage package manager backend.

use crate::context::{finalize, RunContext};
use crate::error::OpError;
use crate::op::{Op, OperationResult};
use crate::system::{generic_package, PackageParams};

/// Adds or removes system packages with emerge. Removal deselects the
/// package from the world file and depcleans it.
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
                // qlist -I prints the installed atoms matching the
                // package; an empty result means not installed.
                let result = ctx.run_unchecked(&["qlist", "-ICq", "--", package])?;
                Ok(result.stdout.as_deref().is_some_and(|out| {
                    !out.iter().all(u8::is_ascii_whitespace)
                }))
            },
            |ctx, package, present| {
                if present {
                    let mut argv: Vec<&str> = vec!["emerge"];
                    argv.extend(params.opts.iter().map(String::as_str));
                    argv.extend(["--", package]);
                    ctx.run(&argv)?;
                } else {
                    ctx.run(&["emerge", "--deselect", "--", package])?;
                    ctx.run(&["emerge", "--depclean", "--", package])?;
                }
                Ok(())
            },
        )
    })();
    finalize(ctx, &mut op, outcome, params.check)
}
