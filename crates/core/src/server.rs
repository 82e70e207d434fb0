use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::channel::{ChannelConfig, ChannelInfo};
use crate::error::{RelayError, Result};
use crate::forwarder::Forwarder;
use crate::pool::PacketPool;
use crate::protocol::dispatch::Dispatcher;
use crate::registry::Registry;
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, SessionPool};
use crate::transport::UdpRelay;
use crate::transport::tcp::{self, ConnectionContext};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listener address.
    pub bind_addr: String,
    /// Shared RTP socket address. `None` disables UDP transport.
    pub rtp_addr: Option<String>,
    /// Shared RTCP socket address.
    pub rtcp_addr: Option<String>,
    /// Channel created at startup and served for targets naming none.
    pub default_channel: Option<String>,
    /// Idle timeout of a control connection, advertised in `Session`.
    pub session_timeout: Duration,
    pub channel_queue_depth: usize,
    pub subscriber_queue_depth: usize,
    pub forwarder_queue_depth: usize,
    /// Forwarder workers exit after this long without datagrams.
    pub forwarder_idle_timeout: Duration,
    /// Idle packet buffers retained.
    pub packet_pool_capacity: usize,
    /// Idle sessions retained for reuse.
    pub session_pool_capacity: usize,
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8554".to_string(),
            rtp_addr: Some("0.0.0.0:8000".to_string()),
            rtcp_addr: Some("0.0.0.0:8001".to_string()),
            default_channel: Some("live".to_string()),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            channel_queue_depth: 64,
            subscriber_queue_depth: 256,
            forwarder_queue_depth: 64,
            forwarder_idle_timeout: Duration::from_secs(30),
            packet_pool_capacity: 1024,
            session_pool_capacity: 64,
            write_timeout: Some(Duration::from_secs(5)),
        }
    }
}

struct Running {
    registry: Registry,
    forwarder: Option<Arc<Forwarder>>,
    relay: Option<Arc<UdpRelay>>,
    local_addr: SocketAddr,
}

/// RTSP relay server.
///
/// Owns the channel registry, the UDP relay sockets and the forwarder.
/// Delegates TCP connection handling to [`transport::tcp`](crate::transport::tcp)
/// and datagram routing to [`Forwarder`].
pub struct Server {
    config: ServerConfig,
    running: Arc<AtomicBool>,
    state: Option<Running>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            state: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        let config = &self.config;

        let pool = PacketPool::new(config.packet_pool_capacity);
        let registry = Registry::new(
            ChannelConfig {
                queue_depth: config.channel_queue_depth,
                subscriber_queue_depth: config.subscriber_queue_depth,
            },
            pool.clone(),
            config.default_channel.as_deref(),
        );

        let relay = match (&config.rtp_addr, &config.rtcp_addr) {
            (Some(rtp), Some(rtcp)) => Some(Arc::new(UdpRelay::bind(rtp, rtcp)?)),
            _ => None,
        };

        let listener = TcpListener::bind(&config.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);

        let forwarder = relay.as_ref().map(|relay| {
            let forwarder = Arc::new(Forwarder::new(
                registry.clone(),
                config.forwarder_queue_depth,
                config.forwarder_idle_timeout,
            ));
            relay.spawn_readers(Arc::clone(&forwarder), pool.clone(), Arc::clone(&self.running));
            forwarder
        });

        let dispatcher = Dispatcher::with_default_handlers(registry.clone(), relay.clone(), config.session_timeout);
        let context = Arc::new(ConnectionContext {
            dispatcher: Arc::new(dispatcher),
            sessions: SessionPool::new(config.session_pool_capacity),
            relay: relay.clone(),
            write_timeout: config.write_timeout,
        });

        tracing::info!(addr = %local_addr, udp = relay.is_some(), "RTSP relay listening");

        let running = Arc::clone(&self.running);
        thread::spawn(move || {
            tcp::accept_loop(listener, context, running);
        });

        self.state = Some(Running {
            registry,
            forwarder,
            relay,
            local_addr,
        });
        Ok(())
    }

    /// Stop accepting connections and datagrams. Established connections end
    /// at their next request.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(forwarder) = self.state.as_ref().and_then(|s| s.forwarder.as_ref()) {
            forwarder.shutdown();
        }
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the RTSP listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.state.as_ref().map(|s| s.local_addr).ok_or(RelayError::NotStarted)
    }

    /// Local (RTP, RTCP) ports of the UDP relay, if enabled.
    pub fn relay_ports(&self) -> Option<(u16, u16)> {
        self.state.as_ref()?.relay.as_ref().map(|r| r.ports())
    }

    pub fn registry(&self) -> Result<&Registry> {
        self.state.as_ref().map(|s| &s.registry).ok_or(RelayError::NotStarted)
    }

    /// Producer and subscribers of every channel.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.state
            .as_ref()
            .map(|s| s.registry.snapshot())
            .unwrap_or_default()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
