//! Result reporting.
//!
//! Operations emit an early status line when they start and a result
//! line when they finish. How those lines look (colors, indentation,
//! diffs) is the frontend's business; the operations only talk to
//! this trait.

use crate::op::OperationResult;

/// Sink for operation progress and results.
pub trait Reporter {
    /// Called when a script invocation starts.
    fn script_start(&mut self, path: &str, label: Option<&str>);

    /// Called when an operation starts, before its outcome is known.
    /// `nested` operations produce child output before their own
    /// result line.
    fn operation_early(&mut self, kind: &str, description: &str, label: Option<&str>, nested: bool);

    /// Called exactly once per finished operation.
    fn operation_result(&mut self, result: &OperationResult);

    /// Called when a checked remote command exits non-zero, with the
    /// captured output for debugging.
    fn command_failure_dump(
        &mut self,
        command: &[String],
        stdout: &[u8],
        stderr: &[u8],
        returncode: i32,
    );

    /// Increases the indentation level for nested operations.
    fn indent(&mut self);

    /// Decreases the indentation level.
    fn dedent(&mut self);
}

/// A reporter that swallows everything. Used in tests.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn script_start(&mut self, _path: &str, _label: Option<&str>) {}
    fn operation_early(&mut self, _kind: &str, _description: &str, _label: Option<&str>, _nested: bool) {
    }
    fn operation_result(&mut self, _result: &OperationResult) {}
    fn command_failure_dump(
        &mut self,
        _command: &[String],
        _stdout: &[u8],
        _stderr: &[u8],
        _returncode: i32,
    ) {
    }
    fn indent(&mut self) {}
    fn dedent(&mut self) {}
}
