//! Routing of inbound UDP datagrams to channels.
//!
//! UDP recorders send RTP/RTCP to the shared relay sockets, so the only
//! thing identifying a datagram is its source address. The forwarder keeps
//! one worker per source address; the worker resolves the channel whose
//! producer negotiated that address (peer IP and a recorded client port),
//! caches the result, and pushes each datagram into that channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::pool::{Package, PacketPool};
use crate::registry::Registry;
use crate::session::Session;

type Workers = Arc<Mutex<HashMap<SocketAddr, SyncSender<Package>>>>;

pub struct Forwarder {
    registry: Registry,
    workers: Workers,
    queue_depth: usize,
    idle_timeout: Duration,
}

impl Forwarder {
    pub fn new(registry: Registry, queue_depth: usize, idle_timeout: Duration) -> Self {
        Self {
            registry,
            workers: Arc::new(Mutex::new(HashMap::new())),
            queue_depth,
            idle_timeout,
        }
    }

    /// Hand one datagram to the worker for `from`, spawning it if needed.
    /// Drops the datagram when that worker is backlogged.
    pub fn forward(&self, package: Package, from: SocketAddr) {
        let mut workers = self.workers.lock();
        let sender = workers.entry(from).or_insert_with(|| self.spawn(from));
        let package = match sender.try_send(package) {
            Ok(()) => return,
            Err(TrySendError::Full(package)) => {
                tracing::trace!(%from, "forwarder queue full, dropping datagram");
                self.registry.pool().release(package);
                return;
            }
            Err(TrySendError::Disconnected(package)) => package,
        };

        // The worker died without retiring itself; replace it.
        let sender = self.spawn(from);
        if let Err(TrySendError::Full(package) | TrySendError::Disconnected(package)) = sender.try_send(package) {
            self.registry.pool().release(package);
        }
        workers.insert(from, sender);
    }

    /// Number of live source workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop every worker. Later datagrams spawn new ones.
    pub fn shutdown(&self) {
        self.workers.lock().clear();
    }

    fn spawn(&self, from: SocketAddr) -> SyncSender<Package> {
        let (sender, queue) = mpsc::sync_channel(self.queue_depth);
        let worker = SourceWorker {
            from,
            registry: self.registry.clone(),
            workers: Arc::clone(&self.workers),
            route: None,
        };
        let idle_timeout = self.idle_timeout;
        thread::spawn(move || worker.run(queue, idle_timeout));
        tracing::debug!(%from, "forwarder worker started");
        sender
    }
}

struct SourceWorker {
    from: SocketAddr,
    registry: Registry,
    workers: Workers,
    route: Option<Arc<Channel>>,
}

impl SourceWorker {
    fn run(mut self, queue: Receiver<Package>, idle_timeout: Duration) {
        loop {
            match queue.recv_timeout(idle_timeout) {
                Ok(package) => self.handle(package),
                Err(RecvTimeoutError::Timeout) => {
                    // Retire under the map lock so no datagram is queued
                    // to a worker that is going away.
                    let mut workers = self.workers.lock();
                    match queue.try_recv() {
                        Ok(package) => {
                            drop(workers);
                            self.handle(package);
                        }
                        Err(_) => {
                            workers.remove(&self.from);
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!(from = %self.from, "forwarder worker exited");
    }

    fn handle(&mut self, mut package: Package) {
        let Some((channel, producer, ordinal)) = self.resolve() else {
            tracing::trace!(from = %self.from, "no producer for datagram source");
            self.registry.pool().release(package);
            return;
        };
        if !producer.is_recording() {
            self.registry.pool().release(package);
            return;
        }

        package.interleaved = false;
        package.order = ordinal;
        if let Err(e) = channel.push(package) {
            tracing::debug!(from = %self.from, error = %e, "push failed");
        }
    }

    /// Cached route, re-validated against the channel's current producer.
    fn resolve(&mut self) -> Option<(Arc<Channel>, Arc<Session>, usize)> {
        let port = self.from.port();
        if let Some(channel) = &self.route {
            if let Some(producer) = channel.producer_at(&self.from)
                && let Some(ordinal) = producer.ordinal_for_port(port)
            {
                return Some((Arc::clone(channel), producer, ordinal));
            }
            tracing::debug!(from = %self.from, channel = %channel.name(), "cached route is stale");
            self.route = None;
        }

        for channel in self.registry.channels() {
            if let Some(producer) = channel.producer_at(&self.from)
                && let Some(ordinal) = producer.ordinal_for_port(port)
            {
                tracing::debug!(from = %self.from, channel = %channel.name(), ordinal, "datagram source resolved");
                self.route = Some(Arc::clone(&channel));
                return Some((channel, producer, ordinal));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::channel::ChannelConfig;
    use crate::protocol::sdp::Description;
    use crate::session::{Direction, Media, TransportHeader};
    use crate::transport::testing::MemoryLink;

    const ONE_TRACK: &[u8] = b"v=0\r\nm=video 0 RTP/AVP 96\r\na=control:t1\r\n";

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn udp_session(peer: &str, port: u16, direction: Direction) -> (Arc<MemoryLink>, Arc<Session>) {
        let link = Arc::new(MemoryLink::new(peer));
        let session = Arc::new(Session::new(link.clone(), None));
        let mode = if direction == Direction::Record { ";mode=record" } else { "" };
        let th = TransportHeader::parse(&format!("RTP/AVP;unicast;client_port={}-{}{mode}", port, port + 1)).unwrap();
        let desc = Description::parse(ONE_TRACK).unwrap();
        session.add_media(Media::from_transport("t1", 0, &th).unwrap(), &desc).unwrap();
        (link, session)
    }

    #[test]
    fn routes_recorded_source_to_channel() {
        let pool = PacketPool::new(8);
        let registry = Registry::new(ChannelConfig::default(), pool.clone(), None);
        let channel = registry.get_or_create("cam1");

        let (_, producer) = udp_session("10.0.0.2:40000", 6000, Direction::Record);
        channel.claim_producer(&producer);
        producer.start(Direction::Record, false);

        // An interleaved viewer sees the datagram on 2*ordinal + sub.
        let link = Arc::new(MemoryLink::new("10.0.0.9:40000"));
        let viewer = Arc::new(Session::new(link.clone(), None));
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        let desc = Description::parse(ONE_TRACK).unwrap();
        viewer.add_media(Media::from_transport("t1", 0, &th).unwrap(), &desc).unwrap();
        viewer.start(Direction::Play, true);
        channel.subscribe(&viewer);

        let forwarder = Forwarder::new(registry, 8, Duration::from_secs(5));
        let mut p = pool.acquire();
        p.buffer_mut()[..2].copy_from_slice(b"hi");
        p.set_len(2);
        p.channel = 1;
        forwarder.forward(p, "10.0.0.2:6001".parse().unwrap());

        wait_for(|| !link.frames().is_empty());
        assert_eq!(link.frames(), vec![(1, b"hi".to_vec())]);
        assert_eq!(forwarder.worker_count(), 1);
    }

    #[test]
    fn unknown_source_is_dropped() {
        let pool = PacketPool::new(8);
        let registry = Registry::new(ChannelConfig::default(), pool.clone(), Some("live"));
        let forwarder = Forwarder::new(registry, 8, Duration::from_secs(5));

        let mut p = pool.acquire();
        p.set_len(4);
        forwarder.forward(p, "10.0.0.7:6000".parse().unwrap());
        wait_for(|| pool.idle() == 1);
    }

    #[test]
    fn idle_worker_retires() {
        let registry = Registry::new(ChannelConfig::default(), PacketPool::new(8), None);
        let forwarder = Forwarder::new(registry.clone(), 8, Duration::from_millis(20));
        forwarder.forward(registry.pool().acquire(), "10.0.0.7:6000".parse().unwrap());
        assert_eq!(forwarder.worker_count(), 1);
        wait_for(|| forwarder.worker_count() == 0);

        // A new datagram from the same source starts a fresh worker.
        forwarder.forward(registry.pool().acquire(), "10.0.0.7:6000".parse().unwrap());
        assert!(forwarder.worker_count() <= 1);
    }
}
