//! The ssh connector.

use crate::connector::{Connector, ConnectorOptions};
use crate::error::ConnectError;
use crate::payload;
use crate::tunnel::Tunnel;
use skiff_proto::Packet;
use std::process::Command;

/// A tunnel connector that provides remote access via ssh. The remote
/// executor is bootstrapped inline on every connect (see
/// [`payload`]), so targets need nothing but a shell, `base64` and
/// `gzip`.
pub struct SshConnector {
    url: String,
    opts: ConnectorOptions,
    tunnel: Option<Tunnel>,
}

impl SshConnector {
    /// Creates a connector for the given `ssh://` url.
    #[must_use]
    pub fn new(url: &str, opts: ConnectorOptions) -> SshConnector {
        SshConnector {
            url: url.to_owned(),
            opts,
            tunnel: None,
        }
    }

    /// Constructs the full ssh command that starts a remote executor.
    fn command(&self) -> Result<Command, ConnectError> {
        let binary = std::fs::read(payload::executor_path()?)?;
        let bootstrap = payload::bootstrap_command(&payload::encode_payload(&binary)?, self.opts.debug);

        let mut command = Command::new("ssh");
        command.args(&self.opts.ssh_opts);
        // ssh itself understands the ssh:// url form.
        command.arg(&self.url);
        command.arg(bootstrap);
        Ok(command)
    }
}

impl Connector for SshConnector {
    fn open(&mut self) -> Result<(), ConnectError> {
        let command = self.command()?;
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
        "ssh"
    }
}

/// Extracts the hostname from an `ssh://[user@]host[:port]` url.
pub(crate) fn extract_hostname(url: &str) -> Result<String, ConnectError> {
    let rest = url
        .strip_prefix("ssh://")
        .ok_or_else(|| ConnectError::MissingScheme(url.to_owned()))?;

    // Remaining form: [user@]hostname[:port]
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    let rest = rest.split_once(':').map_or(rest, |(host, _)| host);
    Ok(rest.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_hostname_full_url() {
        assert_eq!(extract_hostname("ssh://user@h:22").unwrap(), "h");
    }

    #[test]
    fn test_extract_hostname_plain() {
        assert_eq!(extract_hostname("ssh://example.com").unwrap(), "example.com");
    }

    #[test]
    fn test_extract_hostname_user_only() {
        assert_eq!(
            extract_hostname("ssh://deploy@web.internal").unwrap(),
            "web.internal"
        );
    }

    #[test]
    fn test_extract_hostname_port_only() {
        assert_eq!(extract_hostname("ssh://web:2222").unwrap(), "web");
    }

    #[test]
    fn test_extract_hostname_wrong_scheme() {
        assert!(extract_hostname("local:").is_err());
    }
}
