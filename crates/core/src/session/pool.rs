use std::sync::Arc;

use parking_lot::Mutex;

use super::{Session, SessionInner};
use crate::transport::{Link, UdpRelay};

/// Free list of session state, reused across connections.
///
/// Every entry is cleared on release, so a reused session never carries
/// media, state or a channel binding from its previous owner. Each
/// acquired session gets a fresh id.
#[derive(Clone)]
pub struct SessionPool {
    free: Arc<Mutex<Vec<SessionInner>>>,
    capacity: usize,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    pub fn acquire(&self, link: Arc<dyn Link>, relay: Option<Arc<UdpRelay>>) -> Arc<Session> {
        let inner = self.free.lock().pop().unwrap_or_default();
        let session = Arc::new(Session::from_parts(link, relay, inner));
        tracing::debug!(session_id = %session.id(), peer = %session.peer_addr(), "session created");
        session
    }

    /// Return a session. A session still referenced elsewhere is reset and
    /// dropped instead of reused. Returns whether it went back to the pool.
    pub fn release(&self, session: Arc<Session>) -> bool {
        let id = session.id().to_string();
        match Arc::try_unwrap(session) {
            Ok(session) => {
                let mut inner = session.into_inner();
                inner.clear();
                let mut free = self.free.lock();
                let reused = free.len() < self.capacity;
                if reused {
                    free.push(inner);
                }
                tracing::debug!(session_id = %id, reused, "session released");
                reused
            }
            Err(session) => {
                session.reset();
                tracing::debug!(session_id = %id, "session still referenced, dropped");
                false
            }
        }
    }

    /// Number of idle entries.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sdp::Description;
    use crate::session::{Direction, Media, SessionState, TransportHeader};
    use crate::transport::testing::MemoryLink;

    fn link() -> Arc<MemoryLink> {
        Arc::new(MemoryLink::new("10.0.0.2:40000"))
    }

    #[test]
    fn reused_session_starts_clean() {
        let pool = SessionPool::new(4);
        let session = pool.acquire(link(), None);
        let first_id = session.id().to_string();

        let desc = Description::parse(b"v=0\r\nm=video 0 RTP/AVP 96\r\na=control:t1\r\n").unwrap();
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        session.bind_channel("cam1");
        session.add_media(Media::from_transport("t1", 0, &th).unwrap(), &desc).unwrap();
        session.start(Direction::Play, true);

        assert!(pool.release(session));
        assert_eq!(pool.idle(), 1);

        let session = pool.acquire(link(), None);
        assert_eq!(pool.idle(), 0);
        assert_ne!(session.id(), first_id);
        assert_eq!(session.state(), SessionState::Init);
        assert!(session.medias().is_empty());
        assert!(!session.interleaved());
        assert_eq!(session.channel_name(), None);
    }

    #[test]
    fn referenced_session_is_not_reused() {
        let pool = SessionPool::new(4);
        let session = pool.acquire(link(), None);
        let held = Arc::clone(&session);
        assert!(!pool.release(session));
        assert_eq!(pool.idle(), 0);
        assert_eq!(held.state(), SessionState::Init);
    }
}
