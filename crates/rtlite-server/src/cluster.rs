//! Replicated subscription presence.
//!
//! One `StateRegistry` exists per cluster-state topic and tracks which
//! servers currently hold at least one subscriber per name. Locally it
//! ref-counts subscribers so gossip goes out only on 0↔1 edges; listener
//! callbacks fire only on cluster-wide 0↔k edges, aggregated over all
//! servers.
//!
//! The cluster transport itself is a collaborator behind a trait; the
//! built-in `LoopbackTransport` serves single-node deployments and tests.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use rtlite_core::message::Message;

/// Cross-node messaging used by registries and state gossip.
pub trait ClusterTransport: Send + Sync {
    /// Forward a broadcast to peer nodes.
    fn send(&self, message: &Message);

    /// Announce that this node gained its first subscriber for `name`.
    fn send_state_add(&self, state_topic: &str, name: &str);

    /// Announce that this node lost its last subscriber for `name`.
    fn send_state_remove(&self, state_topic: &str, name: &str);
}

/// Single-node transport: there are no peers, so everything is a no-op.
pub struct LoopbackTransport;

impl ClusterTransport for LoopbackTransport {
    fn send(&self, _message: &Message) {}
    fn send_state_add(&self, _state_topic: &str, _name: &str) {}
    fn send_state_remove(&self, _state_topic: &str, _name: &str) {}
}

/// Observer of cluster-wide presence edges.
pub trait StateListener: Send + Sync {
    /// `name` gained its first subscriber anywhere in the cluster.
    fn on_add(&self, name: &str);

    /// `name` lost its last subscriber everywhere in the cluster.
    fn on_remove(&self, name: &str);
}

/// Presence registry for one cluster-state topic.
pub struct StateRegistry {
    state_topic: &'static str,
    server_name: Arc<str>,
    transport: Arc<dyn ClusterTransport>,
    /// Local subscriber ref-count per name.
    local: AHashMap<Arc<str>, u32>,
    /// Servers holding at least one subscriber, per name.
    servers: AHashMap<Arc<str>, AHashSet<Arc<str>>>,
    listeners: Vec<Arc<dyn StateListener>>,
    ready: bool,
    ready_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl StateRegistry {
    pub fn new(
        state_topic: &'static str,
        server_name: Arc<str>,
        transport: Arc<dyn ClusterTransport>,
        ready: bool,
    ) -> Self {
        Self {
            state_topic,
            server_name,
            transport,
            local: AHashMap::new(),
            servers: AHashMap::new(),
            listeners: Vec::new(),
            ready,
            ready_callbacks: Vec::new(),
        }
    }

    /// Register one local subscriber for `name`. Gossip and the cluster-wide
    /// add edge fire only when the local count crosses 0→1 (and, for the
    /// edge, no other server already holds the name).
    pub fn add(&mut self, name: &str) {
        if let Some(count) = self.local.get_mut(name) {
            *count += 1;
            return;
        }
        let key: Arc<str> = Arc::from(name);
        self.local.insert(key.clone(), 1);
        self.transport.send_state_add(self.state_topic, name);
        self.server_joined(self.server_name.clone(), key);
    }

    /// Drop one local subscriber for `name`.
    pub fn remove(&mut self, name: &str) {
        let Some(count) = self.local.get_mut(name) else {
            log::error!(
                "{}: remove for {:?} without a matching add",
                self.state_topic,
                name
            );
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        let (key, _) = self.local.remove_entry(name).unwrap();
        self.transport.send_state_remove(self.state_topic, name);
        self.server_left(&self.server_name.clone(), &key);
    }

    /// Ingest a peer's add announcement.
    pub fn apply_remote_add(&mut self, server: &str, name: &str) {
        self.server_joined(Arc::from(server), Arc::from(name));
    }

    /// Ingest a peer's remove announcement.
    pub fn apply_remote_remove(&mut self, server: &str, name: &str) {
        self.server_left(server, name);
    }

    /// Whether any server in the cluster holds a subscriber for `name`.
    pub fn has(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    /// All names with at least one subscriber anywhere.
    pub fn get_all(&self) -> Vec<Arc<str>> {
        self.servers.keys().cloned().collect()
    }

    /// Servers currently holding at least one subscriber for `name`.
    pub fn get_all_servers(&self, name: &str) -> Vec<Arc<str>> {
        self.servers
            .get(name)
            .map(|servers| servers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Local subscriber count for `name`.
    pub fn local_count(&self, name: &str) -> u32 {
        self.local.get(name).copied().unwrap_or(0)
    }

    /// Subscribe to cluster-wide 0↔k edges.
    pub fn add_listener(&mut self, listener: Arc<dyn StateListener>) {
        self.listeners.push(listener);
    }

    /// Invoke `callback` once initial cluster state is synchronised;
    /// immediately if it already is.
    pub fn when_ready(&mut self, callback: Box<dyn FnOnce() + Send>) {
        if self.ready {
            callback();
        } else {
            self.ready_callbacks.push(callback);
        }
    }

    /// Mark initial synchronisation complete and drain queued callbacks.
    pub fn set_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        for callback in self.ready_callbacks.drain(..) {
            callback();
        }
    }

    fn server_joined(&mut self, server: Arc<str>, name: Arc<str>) {
        let servers = self.servers.entry(name.clone()).or_default();
        let was_empty = servers.is_empty();
        if servers.insert(server) && was_empty {
            for listener in &self.listeners {
                listener.on_add(&name);
            }
        }
    }

    fn server_left(&mut self, server: &str, name: &str) {
        let Some(servers) = self.servers.get_mut(name) else {
            return;
        };
        if !servers.remove(server) {
            return;
        }
        if servers.is_empty() {
            let (key, _) = self.servers.remove_entry(name).unwrap();
            for listener in &self.listeners {
                listener.on_remove(&key);
            }
        }
    }
}
