//! Skiff remote executor.
//!
//! The executor is the only thing skiff ever runs on a target host: a
//! self-contained binary, bootstrapped over the transport by the
//! controller, that reads request packets from stdin in a loop and
//! answers each with exactly one response packet on stdout. Standard
//! error is reserved for log lines.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod handlers;
pub mod identity;

use nix::sys::stat::{self, Mode};
use skiff_proto::{Packet, ProtoError};
use std::io::{Read, Write};
use tracing::debug;

/// Exit code used when the packet stream breaks down.
pub const EXIT_PROTOCOL_ERROR: i32 = 3;

/// Serves packets from `input` until `Exit` or EOF.
///
/// Returns the process exit code: 0 after a clean `Exit`,
/// [`EXIT_PROTOCOL_ERROR`] when the stream ends mid-message or an
/// unknown packet id arrives.
pub fn serve<R: Read, W: Write>(input: &mut R, output: &mut W) -> i32 {
    // Nothing the executor creates should ever be world readable by
    // accident.
    stat::umask(Mode::from_bits_truncate(0o077));

    loop {
        debug!("waiting for packet");
        let packet = match Packet::read_from(input) {
            Ok(packet) => packet,
            Err(ProtoError::UnexpectedEof) => {
                eprintln!("Unexpected EOF in data stream. Aborting.");
                return EXIT_PROTOCOL_ERROR;
            }
            Err(e) => {
                eprintln!("{e}. Aborting.");
                return EXIT_PROTOCOL_ERROR;
            }
        };
        debug!(kind = packet.kind(), "received packet");

        let response = match packet {
            Packet::Exit => return 0,
            Packet::CheckAlive => Packet::Ack,
            request => match handlers::handle(request) {
                Ok(response) => response,
                Err(e) => Packet::OsError {
                    errno: i64::from(e.raw_os_error().unwrap_or(0)),
                    strerror: e.kind().to_string(),
                    msg: e.to_string(),
                },
            },
        };

        if let Err(e) = response.write_to(output) {
            eprintln!("{e}. Aborting.");
            return EXIT_PROTOCOL_ERROR;
        }
    }
}
