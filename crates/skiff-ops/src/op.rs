//! The operation handle.
//!
//! [`Op`] tracks one operation's description, initial/final state and
//! content diffs, and turns them into an [`OperationResult`]. The
//! invariants it enforces: both states must be set before success, a
//! nested operation carries no flat state of its own, and both state
//! maps describe the same set of aspects.

use crate::context::RunContext;
use crate::error::OpError;
use skiff_core::state::{StateMap, StateValue};

/// One file content change recorded for `--diff` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// The remote path the change applies to.
    pub path: String,
    /// Previous content, `None` if the file didn't exist.
    pub old: Option<Vec<u8>>,
    /// New content, `None` if the file was deleted.
    pub new: Option<Vec<u8>>,
}

/// The structured outcome of one operation.
#[derive(Debug, Clone)]
pub struct OperationResult {
    /// The operation kind ("dir", "upload", "service", ...).
    pub kind: String,
    /// The optional user-supplied label.
    pub label: Option<String>,
    /// The operation's description (usually the target path).
    pub description: String,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Whether anything changed (initial != final).
    pub changed: bool,
    /// The observed initial state.
    pub initial: StateMap,
    /// The desired (and, on success, reached) final state.
    pub final_state: StateMap,
    /// The failure cause, when `success` is false.
    pub failure_message: Option<String>,
    /// Recorded content diffs.
    pub diffs: Vec<FileDiff>,
    /// Whether this result aggregates nested operations.
    pub nested: bool,
}

/// State tracking for an operation in progress.
#[derive(Debug)]
pub struct Op {
    kind: String,
    label: Option<String>,
    description: String,
    nested: bool,
    initial: Option<StateMap>,
    final_state: Option<StateMap>,
    diffs: Vec<FileDiff>,
}

impl Op {
    /// Creates the handle for one operation invocation.
    #[must_use]
    pub fn new(kind: &str, label: Option<String>) -> Op {
        Op {
            kind: kind.to_owned(),
            label,
            description: "?".to_owned(),
            nested: false,
            initial: None,
            final_state: None,
            diffs: Vec::new(),
        }
    }

    /// Marks this operation as an aggregate of nested operations. It
    /// then accumulates child states instead of flat state.
    pub fn nested(&mut self) {
        self.nested = true;
    }

    /// Sets the description and emits the early status line.
    pub fn desc(&mut self, ctx: &mut RunContext<'_>, description: impl Into<String>) {
        self.description = description.into();
        ctx.reporter.operation_early(
            &self.kind,
            &self.description,
            self.label.as_deref(),
            self.nested,
        );
    }

    /// Declares the observed initial state. May only be set once.
    pub fn initial_state<K, I>(&mut self, entries: I) -> Result<(), OpError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, StateValue)>,
    {
        if self.nested {
            return Err(OpError::Api(
                "an operation that nests other operations cannot have state on its own",
            ));
        }
        if self.initial.is_some() {
            return Err(OpError::Api("an operation's initial state can only be set once"));
        }
        self.initial = Some(entries.into_iter().map(|(k, v)| (k.into(), v)).collect());
        Ok(())
    }

    /// Declares the desired final state. May only be set once.
    pub fn final_state<K, I>(&mut self, entries: I) -> Result<(), OpError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, StateValue)>,
    {
        if self.nested {
            return Err(OpError::Api(
                "an operation that nests other operations cannot have state on its own",
            ));
        }
        if self.final_state.is_some() {
            return Err(OpError::Api("an operation's final state can only be set once"));
        }
        self.final_state = Some(entries.into_iter().map(|(k, v)| (k.into(), v)).collect());
        Ok(())
    }

    /// Adds the initial and final state of a nested operation under
    /// the given key.
    pub fn add_nested_result(
        &mut self,
        key: impl Into<String>,
        result: &OperationResult,
    ) -> Result<(), OpError> {
        if !self.nested {
            return Err(OpError::Api(
                "an operation can only accumulate nested results if it is marked as nested",
            ));
        }
        let key = key.into();
        let initial = self.initial.get_or_insert_with(StateMap::new);
        if initial.contains_key(&key) {
            return Err(OpError::Api("cannot add nested result under an existing key"));
        }
        initial.insert(key.clone(), StateValue::Map(result.initial.clone()));
        self.final_state
            .get_or_insert_with(StateMap::new)
            .insert(key, StateValue::Map(result.final_state.clone()));
        Ok(())
    }

    fn states(&self) -> Result<(&StateMap, &StateMap), OpError> {
        match (&self.initial, &self.final_state) {
            (Some(initial), Some(final_state)) => Ok((initial, final_state)),
            _ => Err(OpError::Api(
                "both initial and final state must be set before they can be compared",
            )),
        }
    }

    /// Whether the initial and final states agree. With `ignore_nil`
    /// only aspects whose final value is set are compared; needed by
    /// operations whose desired aspects are optional.
    pub fn unchanged(&self, ignore_nil: bool) -> Result<bool, OpError> {
        let (initial, final_state) = self.states()?;
        if !ignore_nil {
            return Ok(initial == final_state);
        }
        Ok(final_state
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .all(|(k, v)| initial.get(k) == Some(v)))
    }

    /// Whether a specific aspect will change.
    pub fn changed(&self, key: &str) -> Result<bool, OpError> {
        let (initial, final_state) = self.states()?;
        match (initial.get(key), final_state.get(key)) {
            (Some(a), Some(b)) => Ok(a != b),
            _ => Err(OpError::Api("changed() called for an undeclared aspect")),
        }
    }

    /// Records a content diff. Equal contents are dropped.
    pub fn diff(&mut self, path: impl Into<String>, old: Option<Vec<u8>>, new: Option<Vec<u8>>) {
        if old == new {
            return;
        }
        self.diffs.push(FileDiff {
            path: path.into(),
            old,
            new,
        });
    }

    /// Emits a failure result.
    pub fn failure(
        &mut self,
        ctx: &mut RunContext<'_>,
        message: impl Into<String>,
    ) -> OperationResult {
        let result = OperationResult {
            kind: self.kind.clone(),
            label: self.label.clone(),
            description: self.description.clone(),
            success: false,
            changed: false,
            initial: self.initial.clone().unwrap_or_default(),
            final_state: self.final_state.clone().unwrap_or_default(),
            failure_message: Some(message.into()),
            diffs: self.diffs.clone(),
            nested: self.nested,
        };
        ctx.reporter.operation_result(&result);
        result
    }

    /// Emits a success result. Both states must have the same aspect
    /// keys; `changed` is their disagreement.
    pub fn success(&mut self, ctx: &mut RunContext<'_>) -> Result<OperationResult, OpError> {
        self.success_with(ctx, false)
    }

    /// Like [`Op::success`], but with `ignore_nil` the change
    /// computation skips aspects whose desired value is unset - for
    /// operations whose desired aspects are optional.
    pub fn success_with(
        &mut self,
        ctx: &mut RunContext<'_>,
        ignore_nil: bool,
    ) -> Result<OperationResult, OpError> {
        if self.nested {
            // An aggregate with no children still has a (trivial) state.
            self.initial.get_or_insert_with(StateMap::new);
            self.final_state.get_or_insert_with(StateMap::new);
        }
        let (initial, final_state) = self.states()?;
        if !self.nested && initial.keys().ne(final_state.keys()) {
            return Err(OpError::Api(
                "initial and final state must describe the same set of aspects",
            ));
        }
        let changed = !self.unchanged(ignore_nil)?;
        let result = OperationResult {
            kind: self.kind.clone(),
            label: self.label.clone(),
            description: self.description.clone(),
            success: true,
            changed,
            initial: self.initial.clone().unwrap_or_default(),
            final_state: self.final_state.clone().unwrap_or_default(),
            failure_message: None,
            diffs: self.diffs.clone(),
            nested: self.nested,
        };
        ctx.reporter.operation_result(&result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::scripted_context;

    #[test]
    fn test_changed_per_aspect() {
        let mut op = Op::new("file", None);
        op.initial_state([("exists", StateValue::Bool(false)), ("mode", StateValue::Nil)])
            .unwrap();
        op.final_state([
            ("exists", StateValue::Bool(true)),
            ("mode", StateValue::Nil),
        ])
        .unwrap();
        assert!(op.changed("exists").unwrap());
        assert!(!op.changed("mode").unwrap());
        assert!(!op.unchanged(false).unwrap());
    }

    #[test]
    fn test_unchanged_ignore_nil() {
        let mut op = Op::new("service", None);
        op.initial_state([
            ("state", StateValue::Str("started".into())),
            ("enabled", StateValue::Bool(true)),
        ])
        .unwrap();
        // Desired state only pins `enabled`.
        op.final_state([("state", StateValue::Nil), ("enabled", StateValue::Bool(true))])
            .unwrap();
        assert!(op.unchanged(true).unwrap());
        assert!(!op.unchanged(false).unwrap());
    }

    #[test]
    fn test_double_initial_state_is_api_misuse() {
        let mut op = Op::new("file", None);
        op.initial_state([("exists", StateValue::Bool(false))]).unwrap();
        let err = op
            .initial_state([("exists", StateValue::Bool(false))])
            .unwrap_err();
        assert!(matches!(err, OpError::Api(_)));
    }

    #[test]
    fn test_success_requires_matching_aspects() {
        let (mut conn, mut reporter) = scripted_context(vec![]);
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);
        let mut op = Op::new("file", None);
        op.initial_state([("exists", StateValue::Bool(false))]).unwrap();
        op.final_state([
            ("exists", StateValue::Bool(true)),
            ("mode", StateValue::Str("644".into())),
        ])
        .unwrap();
        let err = op.success(&mut ctx).unwrap_err();
        assert!(matches!(err, OpError::Api(_)));
    }

    #[test]
    fn test_nested_rejects_flat_state() {
        let mut op = Op::new("upload_dir", None);
        op.nested();
        let err = op.initial_state([("exists", StateValue::Bool(true))]).unwrap_err();
        assert!(matches!(err, OpError::Api(_)));
    }

    #[test]
    fn test_nested_aggregation_and_change_detection() {
        let (mut conn, mut reporter) = scripted_context(vec![]);
        let mut ctx = RunContext::for_tests(&mut conn, &mut reporter);

        let child = OperationResult {
            kind: "file".into(),
            label: None,
            description: "/tmp/a".into(),
            success: true,
            changed: true,
            initial: [("exists".to_owned(), StateValue::Bool(false))].into(),
            final_state: [("exists".to_owned(), StateValue::Bool(true))].into(),
            failure_message: None,
            diffs: Vec::new(),
            nested: false,
        };

        let mut op = Op::new("upload_dir", None);
        op.nested();
        op.add_nested_result("/tmp/a", &child).unwrap();
        let result = op.success(&mut ctx).unwrap();
        assert!(result.changed);
        assert!(result.nested);

        // Duplicate keys are rejected.
        let err = op.add_nested_result("/tmp/a", &child).unwrap_err();
        assert!(matches!(err, OpError::Api(_)));
    }

    #[test]
    fn test_diff_drops_equal_content() {
        let mut op = Op::new("line", None);
        op.diff("/tmp/f", Some(b"same".to_vec()), Some(b"same".to_vec()));
        op.diff("/tmp/f", Some(b"old".to_vec()), Some(b"new".to_vec()));
        assert_eq!(op.diffs.len(), 1);
    }
}
