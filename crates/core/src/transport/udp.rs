use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::forwarder::Forwarder;
use crate::pool::PacketPool;
use crate::transport::frame::SubChannel;

const READ_POLL: Duration = Duration::from_millis(100);

/// Shared RTP/RTCP socket pair.
///
/// Inbound datagrams from UDP recorders are handed to the [`Forwarder`];
/// outbound delivery to UDP viewers goes through [`send`](Self::send).
/// This layer is address-only: it does not know about sessions or channels.
pub struct UdpRelay {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    ports: (u16, u16),
}

impl UdpRelay {
    /// Bind the RTP and RTCP sockets.
    pub fn bind(rtp_addr: &str, rtcp_addr: &str) -> Result<Self> {
        let rtp = UdpSocket::bind(rtp_addr)?;
        let rtcp = UdpSocket::bind(rtcp_addr)?;
        rtp.set_read_timeout(Some(READ_POLL))?;
        rtcp.set_read_timeout(Some(READ_POLL))?;
        let ports = (rtp.local_addr()?.port(), rtcp.local_addr()?.port());
        tracing::info!(rtp_port = ports.0, rtcp_port = ports.1, "UDP relay bound");
        Ok(Self { rtp, rtcp, ports })
    }

    /// Local (RTP, RTCP) ports, advertised as `server_port`.
    pub fn ports(&self) -> (u16, u16) {
        self.ports
    }

    fn socket(&self, sub: SubChannel) -> &UdpSocket {
        match sub {
            SubChannel::Rtp => &self.rtp,
            SubChannel::Rtcp => &self.rtcp,
        }
    }

    /// Send one datagram from the socket matching `sub`.
    pub fn send(&self, sub: SubChannel, payload: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket(sub).send_to(payload, addr)
    }

    /// Start one reader thread per socket. Readers exit once `running`
    /// is cleared, within one poll interval.
    pub fn spawn_readers(
        self: &Arc<Self>,
        forwarder: Arc<Forwarder>,
        pool: PacketPool,
        running: Arc<AtomicBool>,
    ) -> Vec<JoinHandle<()>> {
        [SubChannel::Rtp, SubChannel::Rtcp]
            .into_iter()
            .map(|sub| {
                let relay = Arc::clone(self);
                let forwarder = Arc::clone(&forwarder);
                let pool = pool.clone();
                let running = Arc::clone(&running);
                thread::spawn(move || relay.read_loop(sub, &forwarder, &pool, &running))
            })
            .collect()
    }

    fn read_loop(&self, sub: SubChannel, forwarder: &Forwarder, pool: &PacketPool, running: &AtomicBool) {
        let socket = self.socket(sub);
        while running.load(Ordering::SeqCst) {
            let mut package = pool.acquire();
            match socket.recv_from(package.buffer_mut()) {
                Ok((len, from)) => {
                    package.set_len(len);
                    package.channel = sub.index();
                    forwarder.forward(package, from);
                }
                Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    pool.release(package);
                }
                Err(e) => {
                    pool.release(package);
                    if running.load(Ordering::SeqCst) {
                        tracing::warn!(?sub, error = %e, "UDP receive error");
                    }
                }
            }
        }
        tracing::debug!(?sub, "UDP reader exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_pair_and_sends() {
        let relay = UdpRelay::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        let (rtp, rtcp) = relay.ports();
        assert_ne!(rtp, 0);
        assert_ne!(rtcp, 0);

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        relay
            .send(SubChannel::Rtcp, b"rtcp", peer.local_addr().unwrap())
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"rtcp");
        assert_eq!(from.port(), rtcp);
    }
}
