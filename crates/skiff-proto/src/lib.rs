//! Skiff tunnel protocol.
//!
//! A stdin/stdout based protocol to safely dispatch commands and
//! return their results over any transport that forwards a reliable,
//! ordered byte pair (an ssh session, a local subprocess). The
//! transport provides no framing; all framing lives here.
//!
//! The wire format is the compatibility surface between controller and
//! remote executor versions: big-endian fixed-width integers,
//! `u64`-length-prefixed byte strings, a one-byte present flag for
//! optional fields, and a leading `u32` packet id assigned in
//! registration order. Any change requires a coordinated upgrade of
//! both sides.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod packet;
pub mod wire;

pub use packet::{Packet, StatType};
pub use wire::ProtoError;
