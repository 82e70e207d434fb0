//! Reusable packet buffers.
//!
//! Every media frame entering the relay is copied once into a pooled
//! [`Package`]. The fan-out loop shares it between subscribers through a
//! [`SharedPackage`]: its reference count is the completion join, and the
//! buffer goes back to the pool when the last delivery drops its handle.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::frame::MAX_PACKET_SIZE;

/// One media frame on its way through the relay.
#[derive(Debug)]
pub struct Package {
    data: Box<[u8]>,
    len: usize,
    /// Arrived as an interleaved frame (otherwise as a UDP datagram).
    pub interleaved: bool,
    /// Interleaved channel for interleaved packages, 0 (RTP) or 1 (RTCP)
    /// for datagrams.
    pub channel: u8,
    /// Media ordinal within the producer's description.
    pub order: usize,
}

impl Package {
    fn empty() -> Self {
        Package {
            data: Box::new([]),
            len: 0,
            interleaved: false,
            channel: 0,
            order: 0,
        }
    }

    fn new() -> Self {
        Package {
            data: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
            len: 0,
            interleaved: false,
            channel: 0,
            order: 0,
        }
    }

    /// Valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whole backing buffer, for reading a frame or datagram into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    fn clear(&mut self) {
        self.len = 0;
        self.interleaved = false;
        self.channel = 0;
        self.order = 0;
    }
}

/// Concurrent free list of [`Package`]s.
///
/// Cloning is cheap; clones share the same free list.
#[derive(Clone)]
pub struct PacketPool {
    free: Arc<Mutex<Vec<Package>>>,
    capacity: usize,
}

impl PacketPool {
    /// `capacity` bounds how many idle buffers are retained.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    /// Take a zeroed package, allocating if the free list is empty.
    pub fn acquire(&self) -> Package {
        self.free.lock().pop().unwrap_or_else(Package::new)
    }

    /// Return a package. It is cleared before it can be handed out again.
    pub fn release(&self, mut package: Package) {
        package.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(package);
        }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// A package shared by every delivery of one fan-out round.
pub struct SharedPackage {
    package: Package,
    pool: PacketPool,
}

impl SharedPackage {
    pub fn new(package: Package, pool: PacketPool) -> Arc<Self> {
        Arc::new(Self {
            package,
            pool,
        })
    }

    pub fn package(&self) -> &Package {
        &self.package
    }
}

impl Drop for SharedPackage {
    fn drop(&mut self) {
        let package = std::mem::replace(&mut self.package, Package::empty());
        self.pool.release(package);
    }
}
