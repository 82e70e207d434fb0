//! Named live feeds and their fan-out engine.
//!
//! A [`Channel`] has at most one producer and any number of subscribers.
//! Packages pushed by the producer's connection (or by the UDP forwarder)
//! enter a bounded input queue; one consume thread per channel hands a
//! [`SharedPackage`] to every PLAYING subscriber's delivery worker.
//!
//! Each subscriber owns a worker thread and a bounded outbox, so its packets
//! arrive in push order and a slow subscriber only loses its own packets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;

use crate::error::{RelayError, Result};
use crate::pool::{Package, PacketPool, SharedPackage};
use crate::protocol::sdp::Description;
use crate::session::{Session, SessionInfo};

/// Queue depths for one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Packages buffered between the producer and the consume loop.
    pub queue_depth: usize,
    /// Packages buffered per subscriber before dropping.
    pub subscriber_queue_depth: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            queue_depth: 64,
            subscriber_queue_depth: 256,
        }
    }
}

struct Subscriber {
    session: Arc<Session>,
    outbox: SyncSender<Arc<SharedPackage>>,
    active: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl Subscriber {
    fn spawn(channel: &str, session: Arc<Session>, depth: usize) -> Self {
        let (outbox, inbox) = mpsc::sync_channel(depth);
        let active = Arc::new(AtomicBool::new(true));
        let worker = {
            let session = Arc::clone(&session);
            let active = Arc::clone(&active);
            let channel = channel.to_string();
            thread::spawn(move || deliver(&channel, &session, inbox, &active))
        };
        Self {
            session,
            outbox,
            active,
            worker,
        }
    }

    /// Stop delivery and wait for the worker to drain.
    fn stop(self) {
        self.active.store(false, Ordering::SeqCst);
        drop(self.outbox);
        if self.worker.join().is_err() {
            tracing::warn!(session_id = %self.session.id(), "delivery worker panicked");
        }
    }
}

#[derive(Default)]
struct ChannelState {
    description: Option<Arc<Description>>,
    raw: Option<Arc<[u8]>>,
    producer: Option<Arc<Session>>,
    subscribers: HashMap<String, Subscriber>,
}

impl ChannelState {
    fn locked_by_other(&self, session: &Session) -> bool {
        self.producer.as_ref().is_some_and(|p| p.id() != session.id())
    }
}

/// Read-only view of a channel, for the admin query.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub producer: Option<SessionInfo>,
    pub subscribers: Vec<SessionInfo>,
    pub has_description: bool,
}

/// A named live feed.
pub struct Channel {
    name: String,
    state: Arc<RwLock<ChannelState>>,
    input: SyncSender<Package>,
    pool: PacketPool,
    config: ChannelConfig,
}

impl Channel {
    /// Create a channel and start its consume thread. The thread exits when
    /// the channel is dropped.
    pub fn new(name: &str, config: ChannelConfig, pool: PacketPool) -> Self {
        let (input, queue) = mpsc::sync_channel(config.queue_depth);
        let state = Arc::new(RwLock::new(ChannelState::default()));

        {
            let name = name.to_string();
            let state = Arc::clone(&state);
            let pool = pool.clone();
            thread::spawn(move || fan_out(&name, &state, queue, &pool));
        }

        tracing::info!(channel = %name, "channel created");
        Self {
            name: name.to_string(),
            state,
            input,
            pool,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install a new description. Succeeds only if `session` holds or can
    /// take the producer lock; on success it holds it.
    pub fn set_description(&self, session: &Arc<Session>, description: Description, raw: &[u8]) -> bool {
        let mut state = self.state.write();
        if state.locked_by_other(session) {
            return false;
        }
        state.producer = Some(Arc::clone(session));
        state.description = Some(Arc::new(description));
        state.raw = Some(Arc::from(raw));
        tracing::info!(channel = %self.name, session_id = %session.id(), "description set");
        true
    }

    /// Claim the producer lock. Idempotent for the holder.
    pub fn claim_producer(&self, session: &Arc<Session>) -> bool {
        let mut state = self.state.write();
        if state.locked_by_other(session) {
            return false;
        }
        if state.producer.is_none() {
            tracing::info!(channel = %self.name, session_id = %session.id(), "producer attached");
        }
        state.producer = Some(Arc::clone(session));
        true
    }

    pub fn producer(&self) -> Option<Arc<Session>> {
        self.state.read().producer.clone()
    }

    pub fn producer_id(&self) -> Option<String> {
        self.state.read().producer.as_ref().map(|p| p.id().to_string())
    }

    pub fn description(&self) -> Option<Arc<Description>> {
        self.state.read().description.clone()
    }

    /// Description bytes exactly as announced.
    pub fn raw_description(&self) -> Option<Arc<[u8]>> {
        self.state.read().raw.clone()
    }

    /// Register a subscriber. Subscribing twice keeps the existing worker.
    pub fn subscribe(&self, session: &Arc<Session>) {
        let mut state = self.state.write();
        if state.subscribers.contains_key(session.id()) {
            return;
        }
        let subscriber = Subscriber::spawn(&self.name, Arc::clone(session), self.config.subscriber_queue_depth);
        state.subscribers.insert(session.id().to_string(), subscriber);
        tracing::info!(
            channel = %self.name,
            session_id = %session.id(),
            subscribers = state.subscribers.len(),
            "subscriber added"
        );
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.state.read().subscribers.contains_key(session_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    /// No producer and no subscribers.
    pub fn is_vacant(&self) -> bool {
        let state = self.state.read();
        state.producer.is_none() && state.subscribers.is_empty()
    }

    /// Remove `session` as subscriber and as producer. Safe to call any
    /// number of times; returns whether anything was removed.
    ///
    /// Returns only after the session's delivery worker has exited.
    pub fn teardown(&self, session: &Session) -> bool {
        let (subscriber, was_producer) = {
            let mut state = self.state.write();
            let subscriber = state.subscribers.remove(session.id());
            let was_producer = state.producer.as_ref().is_some_and(|p| p.id() == session.id());
            if was_producer {
                state.producer = None;
                state.description = None;
                state.raw = None;
            }
            (subscriber, was_producer)
        };

        if was_producer {
            tracing::info!(channel = %self.name, session_id = %session.id(), "producer released");
        }
        let removed = subscriber.is_some();
        if let Some(subscriber) = subscriber {
            subscriber.stop();
            tracing::info!(channel = %self.name, session_id = %session.id(), "subscriber removed");
        }
        removed || was_producer
    }

    /// Queue one package for fan-out, blocking while the queue is full.
    pub fn push(&self, package: Package) -> Result<()> {
        self.input
            .send(package)
            .map_err(|_| RelayError::ChannelClosed(self.name.clone()))
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn info(&self) -> ChannelInfo {
        let state = self.state.read();
        let mut subscribers: Vec<SessionInfo> = state.subscribers.values().map(|s| s.session.info()).collect();
        subscribers.sort_by(|a, b| a.id.cmp(&b.id));
        ChannelInfo {
            name: self.name.clone(),
            producer: state.producer.as_ref().map(|p| p.info()),
            subscribers,
            has_description: state.description.is_some(),
        }
    }

    /// Producer whose peer IP matches, for resolving UDP sources.
    pub(crate) fn producer_at(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let state = self.state.read();
        state
            .producer
            .as_ref()
            .filter(|p| p.peer_addr().ip() == addr.ip())
            .cloned()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let subscribers: Vec<Subscriber> = self.state.write().subscribers.drain().map(|(_, s)| s).collect();
        for subscriber in subscribers {
            subscriber.stop();
        }
        tracing::debug!(channel = %self.name, "channel dropped");
    }
}

fn fan_out(name: &str, state: &RwLock<ChannelState>, queue: Receiver<Package>, pool: &PacketPool) {
    for package in queue {
        let shared = SharedPackage::new(package, pool.clone());
        let state = state.read();
        for (id, subscriber) in &state.subscribers {
            if !subscriber.session.is_playing() {
                continue;
            }
            match subscriber.outbox.try_send(Arc::clone(&shared)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(channel = %name, session_id = %id, "subscriber queue full, dropping package");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
    tracing::debug!(channel = %name, "fan-out loop exited");
}

fn deliver(channel: &str, session: &Session, inbox: Receiver<Arc<SharedPackage>>, active: &AtomicBool) {
    for shared in inbox {
        if !active.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(e) = session.forward(shared.package()) {
            tracing::debug!(channel, session_id = %session.id(), error = %e, "delivery failed");
        }
    }
}
