use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::RelayError;
use crate::protocol::dispatch::{Dispatcher, Flow};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, StatusCode};
use crate::session::{Session, SessionPool, SessionState};
use crate::transport::frame::{self, MAX_PACKET_SIZE};
use crate::transport::{Link, UdpRelay};

/// Write half of an RTSP connection.
///
/// Responses from the connection thread and interleaved frames from
/// delivery workers are serialized by the mutex, so each message reaches
/// the wire whole.
pub struct TcpLink {
    stream: Mutex<TcpStream>,
    control: TcpStream,
    peer: SocketAddr,
}

impl TcpLink {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        let control = stream.try_clone()?;
        Ok(Self {
            stream: Mutex::new(stream),
            control,
            peer,
        })
    }
}

impl Link for TcpLink {
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(bytes)?;
        stream.flush()
    }

    fn close(&self) {
        // Shutting down through the clone unblocks a writer holding the lock.
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

/// State shared by every connection thread.
pub struct ConnectionContext {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: SessionPool,
    pub relay: Option<Arc<UdpRelay>>,
    pub write_timeout: Option<Duration>,
}

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(listener: TcpListener, context: Arc<ConnectionContext>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let context = Arc::clone(&context);
                let running = Arc::clone(&running);
                thread::spawn(move || {
                    Connection::handle(stream, context, &running);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
///
/// The session is created on the first request and destroyed when the loop
/// ends, whatever the reason.
struct Connection {
    reader: BufReader<TcpStream>,
    link: Arc<TcpLink>,
    session: Option<Arc<Session>>,
    context: Arc<ConnectionContext>,
    peer_addr: SocketAddr,
    read_timeout: Option<Duration>,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, context: Arc<ConnectionContext>, running: &AtomicBool) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        if let Err(e) = stream.set_write_timeout(context.write_timeout) {
            tracing::warn!(%peer_addr, error = %e, "failed to set write timeout");
        }
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let link = match TcpLink::new(stream, peer_addr) {
            Ok(link) => Arc::new(link),
            Err(_) => return,
        };

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            link,
            session: None,
            context,
            peer_addr,
            read_timeout: None,
        };

        let reason = conn.run(running);
        conn.cleanup();

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Request/response loop, with interleaved ingest while recording.
    /// Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        while running.load(Ordering::SeqCst) {
            self.apply_read_timeout();

            if let Some(session) = self.recording_interleaved()
                && let Err(reason) = self.ingest(&session)
            {
                return reason;
            }

            let request = match self.read_request() {
                Ok(Some(request)) => request,
                Ok(None) => return "connection closed by client",
                Err(e) => return self.reject(&e),
            };

            tracing::debug!(
                peer = %self.peer_addr,
                method = %request.method,
                uri = %request.uri,
                "request"
            );

            let session = self.session();
            let reply = self.context.dispatcher.route(&request, &session);

            tracing::debug!(
                peer = %self.peer_addr,
                session_id = %session.id(),
                status = reply.response.status.code(),
                "response"
            );

            if session.send(&reply.response.encode()).is_err() {
                return "write error";
            }
            if reply.flow == Flow::Close {
                return "teardown";
            }
        }

        "server shutting down"
    }

    fn session(&mut self) -> Arc<Session> {
        let context = &self.context;
        let link = &self.link;
        Arc::clone(self.session.get_or_insert_with(|| {
            context.sessions.acquire(Arc::clone(link) as Arc<dyn Link>, context.relay.clone())
        }))
    }

    fn recording_interleaved(&self) -> Option<Arc<Session>> {
        self.session
            .as_ref()
            .filter(|s| s.is_recording() && s.interleaved())
            .cloned()
    }

    /// The idle timeout applies unless the session streams over UDP.
    fn apply_read_timeout(&mut self) {
        let streaming_udp = self.session.as_ref().is_some_and(|s| {
            matches!(s.state(), SessionState::Playing | SessionState::Recording) && !s.interleaved()
        });
        let timeout = Some(self.context.dispatcher.session_timeout())
            .filter(|t| !streaming_udp && !t.is_zero());
        if timeout == self.read_timeout {
            return;
        }
        if let Err(e) = self.reader.get_ref().set_read_timeout(timeout) {
            tracing::warn!(peer = %self.peer_addr, error = %e, "failed to set read timeout");
            return;
        }
        self.read_timeout = timeout;
    }

    /// Push interleaved frames into the session's channel until end of
    /// stream. `Ok` means the next bytes are a request (or EOF).
    fn ingest(&mut self, session: &Session) -> Result<(), &'static str> {
        let registry = self.context.dispatcher.registry();
        let Some(channel) = session.channel_name().and_then(|name| registry.get(&name)) else {
            return Ok(());
        };
        let pool = registry.pool();
        tracing::debug!(session_id = %session.id(), channel = %channel.name(), "interleaved ingest started");

        loop {
            let mut package = pool.acquire();
            match frame::read_frame(&mut self.reader, package.buffer_mut()) {
                Ok(Some(header)) => {
                    package.set_len(header.len);
                    package.interleaved = true;
                    package.channel = header.channel;
                    package.order = session.ordinal_for_channel(header.channel);
                    if channel.push(package).is_err() {
                        return Err("channel closed");
                    }
                }
                Ok(None) => {
                    pool.release(package);
                    tracing::debug!(session_id = %session.id(), "interleaved ingest ended");
                    return Ok(());
                }
                Err(e) => {
                    pool.release(package);
                    return Err(self.read_failure(&e));
                }
            }
        }
    }

    /// Next request, discarding interleaved frames that arrive outside
    /// RECORD (RTCP from viewers, or media from a paused recorder).
    fn read_request(&mut self) -> crate::Result<Option<Request>> {
        let mut scratch = [0u8; MAX_PACKET_SIZE];
        loop {
            let lead = match self.reader.fill_buf() {
                Ok(buf) => buf.first().copied(),
                Err(e) => return Err(RelayError::Io(e)),
            };
            match lead {
                None => return Ok(None),
                Some(frame::MAGIC) => {
                    frame::read_frame(&mut self.reader, &mut scratch)?;
                }
                Some(_) => return Request::read_from(&mut self.reader),
            }
        }
    }

    /// Best-effort error response for a malformed request. Returns the
    /// disconnect reason.
    fn reject(&self, error: &RelayError) -> &'static str {
        let status = match error {
            RelayError::Parse { .. } => Some(StatusCode::BadRequest),
            RelayError::UnsupportedVersion(_) => Some(StatusCode::VersionNotSupported),
            _ => None,
        };
        match status {
            Some(status) => {
                tracing::warn!(peer = %self.peer_addr, error = %error, "malformed request");
                let _ = self.link.send(&Response::new(status).encode());
                "malformed request"
            }
            None => self.read_failure(error),
        }
    }

    fn read_failure(&self, error: &RelayError) -> &'static str {
        match error {
            RelayError::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                "session timed out"
            }
            RelayError::Io(_) => "read error",
            RelayError::Truncated => "connection closed mid-message",
            _ => {
                tracing::warn!(peer = %self.peer_addr, error = %error, "malformed interleaved frame");
                "malformed frame"
            }
        }
    }

    /// Unregister the session from every channel, return it to the pool
    /// and close the socket.
    fn cleanup(&mut self) {
        if let Some(session) = self.session.take() {
            let removed = self.context.dispatcher.registry().teardown(&session);
            tracing::debug!(peer = %self.peer_addr, session_id = %session.id(), removed, "session cleaned up");
            self.context.sessions.release(session);
        }
        self.link.close();
    }
}
