//! Skiff operations.
//!
//! An operation is an idempotent unit of change. Every operation
//! follows the same skeleton: declare the desired final state, probe
//! the current remote state, return early when nothing differs, apply
//! the minimal mutations (never in dry-run mode), and emit a
//! structured result. The [`op::Op`] handle enforces the bookkeeping;
//! the modules around it are the operation library.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod apt;
pub mod context;
pub mod defaults;
pub mod error;
pub mod files;
pub mod git;
pub mod op;
pub mod pacman;
pub mod portage;
pub mod registry;
pub mod reporter;
pub mod system;
pub mod systemd;
pub mod template;

pub use context::{OpFlags, RunContext};
pub use defaults::DefaultsStack;
pub use error::OpError;
pub use op::{FileDiff, Op, OperationResult};
pub use reporter::{NullReporter, Reporter};
pub use template::{TemplateEngine, VarExpand};
