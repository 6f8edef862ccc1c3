//! Shared subprocess tunnel.
//!
//! Both connectors spawn some command whose stdin/stdout forward the
//! packet stream to a remote executor; everything after the spawn is
//! identical and lives here.

use crate::error::ConnectError;
use skiff_proto::Packet;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::debug;

/// A running transport subprocess with the codec hooked to its pipes.
pub(crate) struct Tunnel {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl Tunnel {
    /// Spawns the given command and performs the `CheckAlive`/`Ack`
    /// handshake. On any failure before `Ack` the child is terminated.
    pub(crate) fn open(mut command: Command) -> Result<Tunnel, ConnectError> {
        debug!(?command, "spawning transport");
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(ConnectError::Spawn)?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let mut tunnel = Tunnel {
            child,
            stdin,
            stdout,
        };

        match tunnel.request(&Packet::CheckAlive) {
            Ok(Packet::Ack) => Ok(tunnel),
            Ok(other) => {
                tunnel.kill();
                Err(ConnectError::Handshake(format!(
                    "expected Ack, got {}",
                    other.kind()
                )))
            }
            Err(e) => {
                tunnel.kill();
                // A transport that died during the handshake usually
                // left a more useful status than "unexpected EOF".
                match tunnel.child.try_wait() {
                    Ok(Some(status)) => Err(ConnectError::Handshake(format!(
                        "transport exited with {status}"
                    ))),
                    _ => Err(ConnectError::Handshake(e.to_string())),
                }
            }
        }
    }

    /// Sends one request and reads its response. Error replies are
    /// converted by [`Packet::read_response`].
    pub(crate) fn request(&mut self, packet: &Packet) -> Result<Packet, ConnectError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ConnectError::Handshake("connection is closed".into()))?;
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| ConnectError::Handshake("connection is closed".into()))?;
        debug!(kind = packet.kind(), "sending request");
        packet.write_to(stdin)?;
        let response = Packet::read_response(stdout)?;
        debug!(kind = response.kind(), "received response");
        Ok(response)
    }

    /// Sends `Exit`, closes the pipes and waits for the child.
    pub(crate) fn close(&mut self) -> Result<(), ConnectError> {
        if let Some(mut stdin) = self.stdin.take() {
            // The remote may already be gone; Exit is best effort.
            let _ = Packet::Exit.write_to(&mut stdin);
        }
        self.stdout.take();
        self.child.wait()?;
        Ok(())
    }

    fn kill(&mut self) {
        self.stdin.take();
        self.stdout.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // Orphaned children are a correctness bug: make sure the
        // transport is gone on every exit path.
        if self.stdin.is_some() {
            let _ = self.close();
        }
    }
}
