//! RTSP session management (RFC 2326 §3, §12.37, Appendix A).
//!
//! A session is the server-side state of one peer: its id (returned in the
//! `Session` header), its position in the state machine, and the media it
//! negotiated with SETUP. One session exists per control connection; it is
//! created on the first request and destroyed on TEARDOWN or disconnect.
//!
//! ## Session lifecycle
//!
//! ```text
//! SETUP (all medias covered) -> Ready
//! RECORD                     -> Recording   (from Ready / Recording)
//! PLAY                       -> Playing     (from Ready / Playing)
//! PAUSE                      -> Ready
//! TEARDOWN                   -> Init, connection closed
//! ```
//!
//! A session's media set is homogeneous: either every media is interleaved
//! on the control connection or every media uses UDP port pairs.

pub mod pool;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngExt;

use crate::error::MethodError;
use crate::pool::Package;
use crate::protocol::sdp::Description;
use crate::transport::frame::{self, SubChannel};
use crate::transport::{Link, UdpRelay};
pub use pool::SessionPool;
pub use transport::TransportHeader;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No SETUP has covered the channel's media yet.
    #[default]
    Init,
    /// Every media of the description has been set up.
    Ready,
    /// Receiving media from the channel.
    Playing,
    /// Sending media into the channel as its producer.
    Recording,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "INIT",
            SessionState::Ready => "READY",
            SessionState::Playing => "PLAYING",
            SessionState::Recording => "RECORDING",
        };
        f.write_str(s)
    }
}

/// Where a media's packets travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaRoute {
    /// Interleaved channel pair on the control connection.
    Interleaved { rtp: u8, rtcp: u8 },
    /// Client UDP port pair.
    Udp { rtp: u16, rtcp: u16 },
}

/// One negotiated stream within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    /// Control id, matching an `a=control` entry of the description.
    pub control: String,
    /// Negotiated with `mode=record`.
    pub record: bool,
    /// Position of the control id in the channel description.
    pub ordinal: usize,
    pub route: MediaRoute,
}

impl Media {
    /// Build from a validated `Transport` header.
    pub fn from_transport(control: &str, ordinal: usize, transport: &TransportHeader) -> Option<Self> {
        let route = if transport.is_interleaved() {
            let (rtp, rtcp) = transport.interleaved?;
            MediaRoute::Interleaved { rtp, rtcp }
        } else {
            let (rtp, rtcp) = transport.client_port?;
            MediaRoute::Udp { rtp, rtcp }
        };
        Some(Media {
            control: control.to_string(),
            record: transport.record,
            ordinal,
            route,
        })
    }

    pub fn is_interleaved(&self) -> bool {
        matches!(self.route, MediaRoute::Interleaved { .. })
    }
}

/// Direction a session is about to stream in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Record,
    Play,
}

/// Mutable part of a session; reused through the [`SessionPool`].
#[derive(Debug, Default)]
pub(crate) struct SessionInner {
    state: SessionState,
    medias: HashMap<String, Media>,
    interleaved: bool,
    channel: Option<String>,
}

impl SessionInner {
    pub(crate) fn clear(&mut self) {
        self.state = SessionState::Init;
        self.medias.clear();
        self.interleaved = false;
        self.channel = None;
    }

    fn media_by_ordinal(&self, ordinal: usize) -> Option<&Media> {
        self.medias.values().find(|m| m.ordinal == ordinal)
    }
}

/// Where one package goes for a given session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Frame(u8),
    Datagram(SubChannel, u16),
}

/// Read-only view of a session, for the admin query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub addr: SocketAddr,
    pub interleaved: bool,
    pub state: SessionState,
}

/// A single RTSP session.
///
/// Interior mutability via a session-local `Mutex` lets the connection
/// thread and fan-out workers share it.
pub struct Session {
    id: String,
    link: Arc<dyn Link>,
    relay: Option<Arc<UdpRelay>>,
    inner: Mutex<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.link.peer_addr())
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl Session {
    /// Create a session with a fresh random id.
    pub fn new(link: Arc<dyn Link>, relay: Option<Arc<UdpRelay>>) -> Self {
        Self::from_parts(link, relay, SessionInner::default())
    }

    pub(crate) fn from_parts(link: Arc<dyn Link>, relay: Option<Arc<UdpRelay>>, inner: SessionInner) -> Self {
        Session {
            id: format!("{:016X}", rand::rng().random::<u64>()),
            link,
            relay,
            inner: Mutex::new(inner),
        }
    }

    pub(crate) fn into_inner(self) -> SessionInner {
        self.inner.into_inner()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.link.peer_addr()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn is_recording(&self) -> bool {
        self.state() == SessionState::Recording
    }

    /// Session-wide framing, fixed by RECORD or PLAY.
    pub fn interleaved(&self) -> bool {
        self.inner.lock().interleaved
    }

    /// Name of the channel this session addressed first.
    pub fn channel_name(&self) -> Option<String> {
        self.inner.lock().channel.clone()
    }

    /// Bind the session to a channel. Fails if it is bound to another one.
    pub fn bind_channel(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        match &inner.channel {
            Some(current) => current == name,
            None => {
                inner.channel = Some(name.to_string());
                true
            }
        }
    }

    /// Negotiated media, ordered by ordinal.
    pub fn medias(&self) -> Vec<Media> {
        let mut medias: Vec<Media> = self.inner.lock().medias.values().cloned().collect();
        medias.sort_by_key(|m| m.ordinal);
        medias
    }

    /// Register one SETUP'd media.
    ///
    /// Returns `true` when this call moved the session from INIT to READY,
    /// i.e. it completed coverage of the description.
    pub fn add_media(&self, media: Media, description: &Description) -> Result<bool, MethodError> {
        let mut inner = self.inner.lock();

        let mixed = inner
            .medias
            .values()
            .any(|m| m.control != media.control && m.is_interleaved() != media.is_interleaved());
        if mixed {
            return Err(MethodError::UnsupportedTransport(
                "cannot mix interleaved and UDP media in one session".to_string(),
            ));
        }

        tracing::debug!(
            session_id = %self.id,
            control = %media.control,
            ordinal = media.ordinal,
            record = media.record,
            route = ?media.route,
            "media registered"
        );
        inner.medias.insert(media.control.clone(), media);

        let covered = description.controls().all(|c| inner.medias.contains_key(c));
        if covered && inner.state == SessionState::Init {
            inner.state = SessionState::Ready;
            tracing::debug!(session_id = %self.id, "session ready");
            return Ok(true);
        }
        Ok(false)
    }

    /// Check every media of the description is registered for `direction`
    /// and uses one framing. Returns that framing (`true` = interleaved).
    pub fn check_media(&self, description: &Description, direction: Direction) -> Result<bool, MethodError> {
        let inner = self.inner.lock();
        let invalid = |reason: &str| {
            tracing::debug!(session_id = %self.id, ?direction, reason, "media check failed");
            MethodError::InvalidState {
                method: match direction {
                    Direction::Record => "RECORD".to_string(),
                    Direction::Play => "PLAY".to_string(),
                },
                state: inner.state,
            }
        };

        let mut interleaved = None;
        for control in description.controls() {
            let media = inner.medias.get(control).ok_or_else(|| invalid("media not set up"))?;
            if media.record != (direction == Direction::Record) {
                return Err(invalid("media negotiated for the other direction"));
            }
            match interleaved {
                None => interleaved = Some(media.is_interleaved()),
                Some(i) if i != media.is_interleaved() => return Err(invalid("mixed framing")),
                Some(_) => {}
            }
        }
        interleaved.ok_or_else(|| invalid("no media"))
    }

    /// Enter RECORDING or PLAYING with the given framing.
    pub fn start(&self, direction: Direction, interleaved: bool) {
        let mut inner = self.inner.lock();
        let state = match direction {
            Direction::Record => SessionState::Recording,
            Direction::Play => SessionState::Playing,
        };
        tracing::debug!(session_id = %self.id, old_state = %inner.state, new_state = %state, interleaved, "state transition");
        inner.interleaved = interleaved;
        inner.state = state;
    }

    /// PAUSE: back to READY, keeping the negotiated media.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Playing | SessionState::Recording) {
            tracing::debug!(session_id = %self.id, old_state = %inner.state, "paused");
            inner.state = SessionState::Ready;
        }
    }

    /// TEARDOWN: drop all media and return to INIT.
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    /// Ordinal of the media an inbound interleaved channel belongs to.
    pub fn ordinal_for_channel(&self, channel: u8) -> usize {
        let inner = self.inner.lock();
        inner
            .medias
            .values()
            .find_map(|m| match m.route {
                MediaRoute::Interleaved { rtp, rtcp } if channel == rtp || channel == rtcp => Some(m.ordinal),
                _ => None,
            })
            .unwrap_or_else(|| frame::split_channel(channel).0)
    }

    /// Ordinal of the recorded UDP media whose client port is `port`.
    pub fn ordinal_for_port(&self, port: u16) -> Option<usize> {
        let inner = self.inner.lock();
        inner.medias.values().find_map(|m| match m.route {
            MediaRoute::Udp { rtp, rtcp } if m.record && (port == rtp || port == rtcp) => Some(m.ordinal),
            _ => None,
        })
    }

    /// Deliver one package to this peer, converting framing as needed.
    pub fn forward(&self, package: &Package) -> io::Result<()> {
        let target = {
            let inner = self.inner.lock();
            resolve_target(&inner, package)
        };

        match target {
            Some(Target::Frame(channel)) => {
                let bytes = frame::encode_frame(channel, package.payload()).map_err(io::Error::other)?;
                self.link.send(&bytes)
            }
            Some(Target::Datagram(sub, port)) => {
                let relay = self
                    .relay
                    .as_ref()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no UDP relay"))?;
                let addr = SocketAddr::new(self.peer_addr().ip(), port);
                relay.send(sub, package.payload(), addr).map(|_| ())
            }
            None => {
                tracing::trace!(session_id = %self.id, order = package.order, "no media for package");
                Ok(())
            }
        }
    }

    /// Write a complete control message to the peer.
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.link.send(bytes)
    }

    pub fn close(&self) {
        self.link.close();
    }

    /// `Session` response header value per RFC 2326 §12.37.
    pub fn header_value(&self, timeout_secs: u64) -> String {
        format!("{};timeout={}", self.id, timeout_secs)
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        SessionInfo {
            id: self.id.clone(),
            addr: self.link.peer_addr(),
            interleaved: inner.interleaved,
            state: inner.state,
        }
    }
}

/// Map a package's (ordinal, sub-channel) onto a session's own media.
///
/// - interleaved → interleaved: remapped to the session's pair for the
///   ordinal, else the producer's channel unchanged;
/// - UDP → interleaved: the session's pair, else `2*ordinal + sub`;
/// - any → UDP: the client port of the media with that ordinal.
fn resolve_target(inner: &SessionInner, package: &Package) -> Option<Target> {
    let sub = SubChannel::from_parity(package.channel);
    let media = inner.media_by_ordinal(package.order);

    if inner.interleaved {
        let channel = match media.map(|m| m.route) {
            Some(MediaRoute::Interleaved { rtp, rtcp }) => match sub {
                SubChannel::Rtp => rtp,
                SubChannel::Rtcp => rtcp,
            },
            _ if package.interleaved => package.channel,
            _ => frame::join_channel(package.order, sub)?,
        };
        return Some(Target::Frame(channel));
    }

    match media?.route {
        MediaRoute::Udp { rtp, rtcp } => Some(Target::Datagram(
            sub,
            match sub {
                SubChannel::Rtp => rtp,
                SubChannel::Rtcp => rtcp,
            },
        )),
        MediaRoute::Interleaved { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketPool;
    use crate::transport::testing::MemoryLink;

    const TWO_TRACKS: &[u8] = b"v=0\r\nm=video 0 RTP/AVP 96\r\na=control:t1\r\nm=audio 0 RTP/AVP 97\r\na=control:t2\r\n";

    fn session() -> (Arc<MemoryLink>, Session) {
        let link = Arc::new(MemoryLink::new("10.0.0.2:40000"));
        let session = Session::new(link.clone(), None);
        (link, session)
    }

    fn tcp(control: &str, ordinal: usize, record: bool) -> Media {
        let mode = if record { ";mode=record" } else { "" };
        let header = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}{mode}",
            2 * ordinal,
            2 * ordinal + 1
        );
        Media::from_transport(control, ordinal, &TransportHeader::parse(&header).unwrap()).unwrap()
    }

    fn udp(control: &str, ordinal: usize, port: u16) -> Media {
        let header = format!("RTP/AVP;unicast;client_port={}-{}", port, port + 1);
        Media::from_transport(control, ordinal, &TransportHeader::parse(&header).unwrap()).unwrap()
    }

    #[test]
    fn ready_exactly_once_for_any_setup_order() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        for order in [["t1", "t2"], ["t2", "t1"]] {
            let (_, s) = session();
            let mut transitions = 0;
            for control in order {
                let ordinal = desc.ordinal_of(control).unwrap();
                if s.add_media(tcp(control, ordinal, false), &desc).unwrap() {
                    transitions += 1;
                }
            }
            // Re-SETUP of a covered media does not transition again.
            if s.add_media(tcp("t1", 0, false), &desc).unwrap() {
                transitions += 1;
            }
            assert_eq!(transitions, 1);
            assert_eq!(s.state(), SessionState::Ready);
        }
    }

    #[test]
    fn partial_setup_stays_init() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        let (_, s) = session();
        assert!(!s.add_media(tcp("t1", 0, false), &desc).unwrap());
        assert_eq!(s.state(), SessionState::Init);
    }

    #[test]
    fn mixing_framing_is_rejected() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        let (_, s) = session();
        s.add_media(tcp("t1", 0, false), &desc).unwrap();
        let err = s.add_media(udp("t2", 1, 5000), &desc).unwrap_err();
        assert!(matches!(err, MethodError::UnsupportedTransport(_)));
        assert_eq!(s.medias().len(), 1);
    }

    #[test]
    fn check_media_requires_direction() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        let (_, s) = session();
        s.add_media(tcp("t1", 0, true), &desc).unwrap();
        s.add_media(tcp("t2", 1, true), &desc).unwrap();
        assert_eq!(s.check_media(&desc, Direction::Record), Ok(true));
        assert!(matches!(
            s.check_media(&desc, Direction::Play),
            Err(MethodError::InvalidState { .. })
        ));
    }

    #[test]
    fn start_pause_reset() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        let (_, s) = session();
        s.add_media(udp("t1", 0, 5000), &desc).unwrap();
        s.add_media(udp("t2", 1, 5002), &desc).unwrap();
        s.start(Direction::Play, false);
        assert!(s.is_playing());
        s.pause();
        assert_eq!(s.state(), SessionState::Ready);
        s.reset();
        assert_eq!(s.state(), SessionState::Init);
        assert!(s.medias().is_empty());
    }

    #[test]
    fn forwards_interleaved_to_negotiated_channel() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        let (link, s) = session();
        // Viewer put the audio track on 6-7.
        let audio = Media::from_transport(
            "t2",
            1,
            &TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=6-7").unwrap(),
        )
        .unwrap();
        s.add_media(tcp("t1", 0, false), &desc).unwrap();
        s.add_media(audio, &desc).unwrap();
        s.start(Direction::Play, true);

        let pool = PacketPool::new(4);
        let mut p = pool.acquire();
        p.buffer_mut()[..3].copy_from_slice(b"abc");
        p.set_len(3);
        p.interleaved = true;
        p.channel = 3;
        p.order = 1;
        s.forward(&p).unwrap();

        assert_eq!(link.frames(), vec![(7, b"abc".to_vec())]);
    }

    #[test]
    fn forwards_datagram_as_interleaved() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        let (link, s) = session();
        s.add_media(tcp("t1", 0, false), &desc).unwrap();
        s.add_media(tcp("t2", 1, false), &desc).unwrap();
        s.start(Direction::Play, true);

        let pool = PacketPool::new(4);
        let mut p = pool.acquire();
        p.set_len(4);
        p.channel = SubChannel::Rtcp.index();
        p.order = 1;
        s.forward(&p).unwrap();

        assert_eq!(link.frames(), vec![(3, vec![0, 0, 0, 0])]);
    }

    #[test]
    fn ordinal_lookup_for_ingress() {
        let desc = Description::parse(TWO_TRACKS).unwrap();
        let (_, s) = session();
        s.add_media(udp("t1", 0, 6000), &desc).unwrap();
        s.add_media(udp("t2", 1, 6002), &desc).unwrap();
        assert_eq!(s.ordinal_for_port(6003), None);
        assert_eq!(s.ordinal_for_channel(5), 2);

        let (_, r) = session();
        let mut m = udp("t2", 1, 6002);
        m.record = true;
        r.add_media(m, &desc).unwrap();
        assert_eq!(r.ordinal_for_port(6003), Some(1));
        assert_eq!(r.ordinal_for_port(6000), None);
    }

    #[test]
    fn header_value_includes_timeout() {
        let (_, s) = session();
        assert_eq!(s.header_value(60), format!("{};timeout=60", s.id()));
        assert_eq!(s.id().len(), 16);
    }
}
