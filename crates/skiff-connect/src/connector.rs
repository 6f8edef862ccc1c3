//! The connector interface and scheme registry.
//!
//! A connector is bound to a single host url; the url's scheme selects
//! the implementation. The registry is a constant table populated at
//! program start, so hostname extraction works before any connector is
//! instantiated.

use crate::error::ConnectError;
use crate::{local, ssh};
use skiff_proto::Packet;

/// Options shared by all connector implementations.
#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    /// Extra options inserted into the ssh command line (host var
    /// `ssh_opts`).
    pub ssh_opts: Vec<String>,
    /// Run the remote executor with `--debug`.
    pub debug: bool,
}

/// A transport to one host: spawns the subprocess, performs the
/// handshake, and carries one request/response pair at a time.
pub trait Connector {
    /// Opens the transport and performs the `CheckAlive`/`Ack`
    /// handshake. On failure the subprocess is terminated.
    fn open(&mut self) -> Result<(), ConnectError>;

    /// Sends one request packet and returns its response packet.
    /// `OSError` and `InvalidField` responses surface as errors.
    fn request(&mut self, packet: &Packet) -> Result<Packet, ConnectError>;

    /// Sends `Exit`, closes the controller-side pipe ends, and waits
    /// for the child.
    fn close(&mut self) -> Result<(), ConnectError>;

    /// The scheme this connector serves (for log messages).
    fn scheme(&self) -> &'static str;
}

/// One registry entry: a scheme plus its factory and url parser.
struct ConnectorDef {
    scheme: &'static str,
    make: fn(&str, ConnectorOptions) -> Box<dyn Connector>,
    extract_hostname: fn(&str) -> Result<String, ConnectError>,
}

/// All registered connectors, in resolution order.
const CONNECTORS: &[ConnectorDef] = &[
    ConnectorDef {
        scheme: "ssh",
        make: |url, opts| Box::new(ssh::SshConnector::new(url, opts)),
        extract_hostname: ssh::extract_hostname,
    },
    ConnectorDef {
        scheme: "local",
        make: |url, opts| Box::new(local::LocalConnector::new(url, opts)),
        extract_hostname: local::extract_hostname,
    },
];

fn scheme_of(url: &str) -> Result<&str, ConnectError> {
    url.split(':')
        .next()
        .filter(|_| url.contains(':'))
        .ok_or_else(|| ConnectError::MissingScheme(url.to_owned()))
}

fn def_for(url: &str) -> Result<&'static ConnectorDef, ConnectError> {
    let scheme = scheme_of(url)?;
    CONNECTORS
        .iter()
        .find(|def| def.scheme == scheme)
        .ok_or_else(|| ConnectError::UnknownScheme(scheme.to_owned()))
}

/// Instantiates the connector responsible for the given url.
pub fn connector_for_url(
    url: &str,
    opts: ConnectorOptions,
) -> Result<Box<dyn Connector>, ConnectError> {
    Ok((def_for(url)?.make)(url, opts))
}

/// Extracts the identifying hostname from a url via the connector
/// registered for its scheme. `ssh://user@h:22` yields `h`.
pub fn extract_hostname(url: &str) -> Result<String, ConnectError> {
    (def_for(url)?.extract_hostname)(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_hostname_dispatches_on_scheme() {
        assert_eq!(extract_hostname("ssh://user@h:22").unwrap(), "h");
        assert_eq!(extract_hostname("local:").unwrap(), "localhost");
    }

    #[test]
    fn test_unknown_scheme() {
        let err = extract_hostname("telnet://h").unwrap_err();
        assert!(matches!(err, ConnectError::UnknownScheme(s) if s == "telnet"));
    }

    #[test]
    fn test_missing_scheme() {
        let err = extract_hostname("plainhost").unwrap_err();
        assert!(matches!(err, ConnectError::MissingScheme(_)));
    }

    #[test]
    fn test_connector_for_url() {
        let c = connector_for_url("local:", ConnectorOptions::default()).unwrap();
        assert_eq!(c.scheme(), "local");
        let c = connector_for_url("ssh://root@example.com", ConnectorOptions::default()).unwrap();
        assert_eq!(c.scheme(), "ssh");
    }
}
