//! Skiff core - shared types for the skiff configuration engine.
//!
//! This crate provides the vocabulary used by every other skiff crate:
//! remote execution defaults and their overlay semantics, canonical
//! octal mode handling, operation state values, and the byte-escaping
//! and diffing helpers used to render results.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod escape;
pub mod mode;
pub mod settings;
pub mod state;

pub use mode::{canonicalize_mode, parse_octal, ModeError};
pub use settings::{RemoteSettings, ResolvedSettings, SettingsError};
pub use state::StateValue;
