//! Transport connectors and per-host connections.
//!
//! A [`Connector`](connector::Connector) spawns the transport
//! subprocess (ssh or a local child) and owns the byte pair; a
//! [`Connection`](connection::Connection) wraps a connector with the
//! per-host session state (base settings, identity) and exposes one
//! typed method per executor primitive.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod connection;
pub mod connector;
pub mod error;
pub mod local;
pub mod payload;
pub mod ssh;
mod tunnel;

pub use connection::{CompletedCommand, Connection, GroupEntry, RunOptions, StatEntry, UserEntry};
pub use connector::{connector_for_url, extract_hostname, Connector, ConnectorOptions};
pub use error::ConnectError;
