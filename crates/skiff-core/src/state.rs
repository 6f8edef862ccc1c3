//! Observable operation state.
//!
//! Operations describe the remote world as a map from aspect names
//! ("exists", "mode", "sha512", …) to [`StateValue`]s. Comparing the
//! initial and final maps decides whether an operation changed
//! anything at all, and which mutations are required.

use std::collections::BTreeMap;
use std::fmt;

/// A single observable aspect value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue {
    /// No value (absent file, unset attribute).
    Nil,
    /// A boolean aspect such as `exists`.
    Bool(bool),
    /// An integer aspect such as `uid`.
    Int(i64),
    /// A string aspect such as `mode` or `owner`.
    Str(String),
    /// A binary aspect such as a content hash. Displayed as hex.
    Bytes(Vec<u8>),
    /// A list aspect such as supplementary groups.
    List(Vec<StateValue>),
    /// A nested state map (used by operations that aggregate children).
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Returns true when the value is [`StateValue::Nil`].
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, StateValue::Nil)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Nil => write!(f, "None"),
            StateValue::Bool(v) => write!(f, "{v}"),
            StateValue::Int(v) => write!(f, "{v}"),
            StateValue::Str(v) => write!(f, "{v}"),
            StateValue::Bytes(v) => {
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            StateValue::List(v) => {
                write!(f, "[")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            StateValue::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Str(v.to_owned())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Str(v)
    }
}

impl From<Vec<u8>> for StateValue {
    fn from(v: Vec<u8>) -> Self {
        StateValue::Bytes(v)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(StateValue::Nil, Into::into)
    }
}

impl From<Vec<String>> for StateValue {
    fn from(v: Vec<String>) -> Self {
        StateValue::List(v.into_iter().map(StateValue::Str).collect())
    }
}

/// A state map: aspect name to value.
pub type StateMap = BTreeMap<String, StateValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_bytes_as_hex() {
        let v = StateValue::Bytes(vec![0xde, 0xad, 0x00]);
        assert_eq!(v.to_string(), "dead00");
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(StateValue::from(None::<i64>), StateValue::Nil);
        assert_eq!(StateValue::from(Some(7i64)), StateValue::Int(7));
    }

    #[test]
    fn test_list_display() {
        let v = StateValue::from(vec!["wheel".to_owned(), "video".to_owned()]);
        assert_eq!(v.to_string(), "[wheel, video]");
    }
}
