//! Connection seam between the subscription registries and the socket layer.
//!
//! Registries hold non-owning `Arc<dyn Connection>` handles and never touch
//! sockets directly. The trait is implemented by `ClientWriteHandle` for real
//! clients and by mocks in tests.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rtlite_core::message::{Message, RegistryTopic};

/// Process-unique connection identity.
///
/// Registries compare connections by id, never by pointer, so identity
/// survives cloning of the `Arc` handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capabilities a subscription registry needs from a client connection.
pub trait Connection: Send + Sync {
    /// Unique id of this connection.
    fn id(&self) -> ConnectionId;

    /// Username from the handshake (`anonymous` until one is presented).
    fn user(&self) -> Arc<str>;

    /// Encode and queue a single message for this connection.
    fn send_message(&self, message: &Message);

    /// Queue the acknowledgement of `request`.
    fn send_ack(&self, request: &Message);

    /// Queue pre-encoded frame bytes, shared across a fanout.
    ///
    /// `no_delay` requests an immediate flush instead of waiting for the
    /// next write-readiness cycle; coalescing policy belongs to the write
    /// layer, not the caller.
    fn send_built_message(&self, frame: &Bytes, no_delay: bool);

    /// Register interest in this connection's close. Called by a registry
    /// when the connection acquires its first subscription; at most one
    /// registration per registry topic is held.
    fn on_close(&self, topic: RegistryTopic);

    /// Drop a close registration. Called when an explicit unsubscribe
    /// clears the connection's last subscription in that registry.
    fn remove_on_close(&self, topic: RegistryTopic);
}
