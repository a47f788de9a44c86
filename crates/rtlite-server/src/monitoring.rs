//! Broadcast monitoring and server counters.
//!
//! `ServerStats` is updated by workers on the hot path with relaxed atomics
//! and read by the metrics endpoint. It also serves as the process-global
//! monitoring collaborator the registries report broadcasts to.

use std::sync::atomic::{AtomicU64, Ordering};

use rtlite_core::message::Message;

/// Observer for message fanout.
pub trait Monitoring: Send + Sync {
    /// Called once per broadcast with the local subscriber count of the
    /// target name, before any bytes are written.
    fn on_broadcast(&self, message: &Message, subscriber_count: usize);
}

/// Global server counters.
pub struct ServerStats {
    /// Frames parsed from clients.
    pub msgs_received: AtomicU64,
    /// Frames queued to clients.
    pub msgs_sent: AtomicU64,
    /// Bytes read from client sockets.
    pub bytes_received: AtomicU64,
    /// Bytes written to client sockets.
    pub bytes_sent: AtomicU64,
    /// Broadcasts submitted to registries.
    pub broadcasts: AtomicU64,
    /// Sum of local subscriber counts over all broadcasts.
    pub broadcast_receivers: AtomicU64,
    /// Connections accepted since start.
    pub connections_total: AtomicU64,
    /// Currently connected clients.
    pub clients_connected: AtomicU64,
    /// Frames dropped on slow-client backpressure.
    pub msgs_dropped: AtomicU64,
}

impl ServerStats {
    pub const fn new() -> Self {
        Self {
            msgs_received: AtomicU64::new(0),
            msgs_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            broadcast_receivers: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            clients_connected: AtomicU64::new(0),
            msgs_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn add_msgs_received(&self, n: u64) {
        self.msgs_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_msgs_sent(&self, n: u64) {
        self.msgs_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_msgs_dropped(&self, n: u64) {
        self.msgs_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients_connected.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Monitoring for ServerStats {
    fn on_broadcast(&self, _message: &Message, subscriber_count: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.broadcast_receivers
            .fetch_add(subscriber_count as u64, Ordering::Relaxed);
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
