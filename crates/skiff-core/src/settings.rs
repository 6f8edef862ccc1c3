//! Remote execution defaults.
//!
//! A [`RemoteSettings`] value describes how things are executed on a
//! remote host: the user commands run as, the owner and mode of newly
//! created files, the umask, and the working directory. Every field is
//! optional; a `None` field is transparent when settings are layered
//! on top of each other.

use crate::mode::{canonicalize_mode, ModeError};
use std::fmt;
use thiserror::Error;

/// Errors raised while validating or resolving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A mode/umask field failed octal validation.
    #[error("error while resolving settings: {field} is '{value}' but must be octal")]
    InvalidMask {
        /// The settings field name.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// A required field was absent after overlaying all defaults.
    #[error("error while resolving settings: {field} cannot be unset")]
    MissingField {
        /// The settings field name.
        field: &'static str,
    },
}

impl From<(&'static str, ModeError)> for SettingsError {
    fn from((field, e): (&'static str, ModeError)) -> Self {
        SettingsError::InvalidMask {
            field,
            value: e.value,
        }
    }
}

/// Execution defaults for a remote host. See the module docs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSettings {
    /// The user as which commands are run.
    pub as_user: Option<String>,
    /// The group as which commands are run.
    pub as_group: Option<String>,
    /// The owner of newly created files and directories.
    pub owner: Option<String>,
    /// The group of newly created files and directories.
    pub group: Option<String>,
    /// The mode for newly created files, as a canonical octal string.
    pub file_mode: Option<String>,
    /// The mode for newly created directories, as a canonical octal string.
    pub dir_mode: Option<String>,
    /// The umask for executed commands, as a canonical octal string.
    pub umask: Option<String>,
    /// The remote working directory for executed commands.
    pub cwd: Option<String>,
}

impl RemoteSettings {
    /// Overlays `other` on top of `self`. A field is overwritten only
    /// when the new value is present, so `None` fields in `other` are
    /// transparent.
    #[must_use]
    pub fn overlay(&self, other: &RemoteSettings) -> RemoteSettings {
        fn pick(base: &Option<String>, over: &Option<String>) -> Option<String> {
            over.clone().or_else(|| base.clone())
        }
        RemoteSettings {
            as_user: pick(&self.as_user, &other.as_user),
            as_group: pick(&self.as_group, &other.as_group),
            owner: pick(&self.owner, &other.owner),
            group: pick(&self.group, &other.group),
            file_mode: pick(&self.file_mode, &other.file_mode),
            dir_mode: pick(&self.dir_mode, &other.dir_mode),
            umask: pick(&self.umask, &other.umask),
            cwd: pick(&self.cwd, &other.cwd),
        }
    }

    /// Canonicalizes all mode/umask fields, failing fast on values
    /// that are not valid octal strings.
    pub fn canonicalized(&self) -> Result<RemoteSettings, SettingsError> {
        fn canon(
            field: &'static str,
            value: &Option<String>,
        ) -> Result<Option<String>, SettingsError> {
            value
                .as_deref()
                .map(|v| canonicalize_mode(v).map_err(|e| SettingsError::from((field, e))))
                .transpose()
        }
        Ok(RemoteSettings {
            file_mode: canon("file_mode", &self.file_mode)?,
            dir_mode: canon("dir_mode", &self.dir_mode)?,
            umask: canon("umask", &self.umask)?,
            ..self.clone()
        })
    }

    /// Converts into a [`ResolvedSettings`], requiring that every
    /// field which must have a value after full overlaying is present.
    pub fn into_resolved(self) -> Result<ResolvedSettings, SettingsError> {
        fn require(
            field: &'static str,
            value: Option<String>,
        ) -> Result<String, SettingsError> {
            value.ok_or(SettingsError::MissingField { field })
        }
        Ok(ResolvedSettings {
            as_user: require("as_user", self.as_user)?,
            as_group: require("as_group", self.as_group)?,
            owner: require("owner", self.owner)?,
            group: require("group", self.group)?,
            file_mode: require("file_mode", self.file_mode)?,
            dir_mode: require("dir_mode", self.dir_mode)?,
            umask: require("umask", self.umask)?,
            cwd: require("cwd", self.cwd)?,
        })
    }
}

impl fmt::Display for RemoteSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("as_user", &self.as_user),
            ("as_group", &self.as_group),
            ("owner", &self.owner),
            ("group", &self.group),
            ("file_mode", &self.file_mode),
            ("dir_mode", &self.dir_mode),
            ("umask", &self.umask),
            ("cwd", &self.cwd),
        ];
        let set: Vec<String> = fields
            .iter()
            .filter_map(|(n, v)| v.as_ref().map(|v| format!("{n}={v}")))
            .collect();
        write!(f, "RemoteSettings{{{}}}", set.join(","))
    }
}

/// A fully resolved version of [`RemoteSettings`]: every field that
/// operations rely on is guaranteed present. Produced by the
/// connection after overlaying base settings, the defaults stack and
/// operation-local overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    /// The user as which commands are run.
    pub as_user: String,
    /// The group as which commands are run.
    pub as_group: String,
    /// The owner of newly created files and directories.
    pub owner: String,
    /// The group of newly created files and directories.
    pub group: String,
    /// The mode for newly created files.
    pub file_mode: String,
    /// The mode for newly created directories.
    pub dir_mode: String,
    /// The umask for executed commands.
    pub umask: String,
    /// The remote working directory for executed commands.
    pub cwd: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(owner: Option<&str>, file_mode: Option<&str>) -> RemoteSettings {
        RemoteSettings {
            owner: owner.map(str::to_owned),
            file_mode: file_mode.map(str::to_owned),
            ..RemoteSettings::default()
        }
    }

    #[test]
    fn test_overlay_prefers_present_fields() {
        let base = settings(Some("root"), Some("600"));
        let over = settings(None, Some("644"));
        let merged = base.overlay(&over);
        assert_eq!(merged.owner.as_deref(), Some("root"));
        assert_eq!(merged.file_mode.as_deref(), Some("644"));
    }

    #[test]
    fn test_overlay_law_per_field() {
        // overlay(a, b).f == b.f if b.f is set else a.f
        let a = RemoteSettings {
            as_user: Some("alice".into()),
            umask: Some("077".into()),
            ..RemoteSettings::default()
        };
        let b = RemoteSettings {
            as_user: Some("bob".into()),
            cwd: Some("/tmp".into()),
            ..RemoteSettings::default()
        };
        let r = a.overlay(&b);
        assert_eq!(r.as_user.as_deref(), Some("bob"));
        assert_eq!(r.umask.as_deref(), Some("077"));
        assert_eq!(r.cwd.as_deref(), Some("/tmp"));
        assert_eq!(r.owner, None);
    }

    #[test]
    fn test_canonicalized_rejects_bad_mask() {
        let s = settings(None, Some("8xx"));
        let err = s.canonicalized().unwrap_err();
        assert!(err.to_string().contains("file_mode"));
        assert!(err.to_string().contains("octal"));
    }

    #[test]
    fn test_canonicalized_strips_leading_zero() {
        let s = settings(None, Some("0644"));
        assert_eq!(s.canonicalized().unwrap().file_mode.as_deref(), Some("644"));
    }

    #[test]
    fn test_into_resolved_requires_all_fields() {
        let err = settings(Some("root"), None).into_resolved().unwrap_err();
        assert!(matches!(err, SettingsError::MissingField { .. }));
    }

    #[test]
    fn test_display_lists_only_present_fields() {
        let s = settings(Some("root"), Some("644"));
        assert_eq!(s.to_string(), "RemoteSettings{owner=root,file_mode=644}");
    }
}
