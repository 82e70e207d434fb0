//! Network transport layer for RTSP signaling and media relay.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling, one thread
//!   per connection. Media can be multiplexed on the same connection as
//!   interleaved frames ([`frame`]).
//!
//! - **UDP** ([`udp`]): one RTP and one RTCP socket shared by every session,
//!   used both to receive from UDP recorders and to send to UDP viewers.
//!
//! Sessions write through a [`Link`], so responses and interleaved frames
//! from concurrent fan-out workers never interleave mid-message.

pub mod frame;
pub mod tcp;
pub mod udp;

use std::io;
use std::net::SocketAddr;

pub use tcp::TcpLink;
pub use udp::UdpRelay;

/// Write half of a peer connection, shared by the connection thread and
/// every fan-out worker delivering to that peer.
pub trait Link: Send + Sync {
    fn peer_addr(&self) -> SocketAddr;

    /// Write one complete message (response or interleaved frame).
    fn send(&self, bytes: &[u8]) -> io::Result<()>;

    /// Shut the connection down; pending and later sends fail.
    fn close(&self);
}
