//! The local connector.

use crate::connector::{Connector, ConnectorOptions};
use crate::error::ConnectError;
use crate::payload;
use crate::tunnel::Tunnel;
use skiff_proto::Packet;
use std::process::Command;

/// A tunnel connector that manages the local machine by spawning the
/// executor directly as a subprocess. Also the workhorse of the test
/// suite.
pub struct LocalConnector {
    opts: ConnectorOptions,
    tunnel: Option<Tunnel>,
}

impl LocalConnector {
    /// Creates a connector for a `local:` url.
    #[must_use]
    pub fn new(_url: &str, opts: ConnectorOptions) -> LocalConnector {
        LocalConnector { opts, tunnel: None }
    }
}

impl Connector for LocalConnector {
    fn open(&mut self) -> Result<(), ConnectError> {
        let mut command = Command::new(payload::executor_path()?);
        if self.opts.debug {
            command.arg("--debug");
        }
        self.tunnel = Some(Tunnel::open(command)?);
        Ok(())
    }

    fn request(&mut self, packet: &Packet) -> Result<Packet, ConnectError> {
        self.tunnel
            .as_mut()
            .ok_or_else(|| ConnectError::Handshake("connection is not open".into()))?
            .request(packet)
    }

    fn close(&mut self) -> Result<(), ConnectError> {
        match self.tunnel.take() {
            Some(mut tunnel) => tunnel.close(),
            None => Ok(()),
        }
    }

    fn scheme(&self) -> &'static str {
        "local"
    }
}

/// Extracts the hostname from a `local:[name]` url; an empty name
/// means `localhost`.
pub(crate) fn extract_hostname(url: &str) -> Result<String, ConnectError> {
    let rest = url
        .strip_prefix("local:")
        .ok_or_else(|| ConnectError::MissingScheme(url.to_owned()))?;
    Ok(if rest.is_empty() {
        "localhost".to_owned()
    } else {
        rest.to_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_hostname_empty() {
        assert_eq!(extract_hostname("local:").unwrap(), "localhost");
    }

    #[test]
    fn test_extract_hostname_named() {
        assert_eq!(extract_hostname("local:buildbox").unwrap(), "buildbox");
    }
}
