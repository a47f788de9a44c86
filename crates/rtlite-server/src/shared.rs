//! State shared across all worker threads.
//!
//! One subscription registry per logical topic, each behind its own RwLock
//! so all operations on an instance are serialised. Registries that share a
//! cluster-state topic share one state registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use rtlite_core::message::{RegistryTopic, REGISTRY_TOPICS};

use crate::cluster::{ClusterTransport, StateRegistry};
use crate::connection::ConnectionId;
use crate::monitoring::{Monitoring, ServerStats};
use crate::registry::SubscriptionRegistry;

pub struct SharedState {
    registries: AHashMap<RegistryTopic, RwLock<SubscriptionRegistry>>,
    states: AHashMap<&'static str, Arc<Mutex<StateRegistry>>>,
    pub stats: Arc<ServerStats>,
    pub transport: Arc<dyn ClusterTransport>,
    pub server_name: Arc<str>,
    next_connection_id: AtomicU64,
}

impl SharedState {
    pub fn new(server_name: Arc<str>, transport: Arc<dyn ClusterTransport>) -> Self {
        let stats = Arc::new(ServerStats::new());
        let monitoring: Arc<dyn Monitoring> = stats.clone();

        let mut states: AHashMap<&'static str, Arc<Mutex<StateRegistry>>> = AHashMap::new();
        for topic in REGISTRY_TOPICS {
            states.entry(topic.state_topic()).or_insert_with(|| {
                // A transport that syncs from peers flips readiness after
                // the initial exchange; the loopback case is ready at once.
                Arc::new(Mutex::new(StateRegistry::new(
                    topic.state_topic(),
                    server_name.clone(),
                    transport.clone(),
                    true,
                )))
            });
        }

        let registries = REGISTRY_TOPICS
            .iter()
            .map(|&topic| {
                let state = states
                    .get(topic.state_topic())
                    .expect("state registry exists for every topic")
                    .clone();
                (
                    topic,
                    RwLock::new(SubscriptionRegistry::new(
                        topic,
                        state,
                        transport.clone(),
                        monitoring.clone(),
                        server_name.clone(),
                    )),
                )
            })
            .collect();

        Self {
            registries,
            states,
            stats,
            transport,
            server_name,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self, topic: RegistryTopic) -> &RwLock<SubscriptionRegistry> {
        self.registries
            .get(&topic)
            .expect("registry exists for every topic")
    }

    pub fn state(&self, state_topic: &str) -> Option<&Arc<Mutex<StateRegistry>>> {
        self.states.get(state_topic)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Local name counts per registry, for the metrics endpoint.
    pub fn subscription_counts(&self) -> Vec<(&'static str, usize)> {
        REGISTRY_TOPICS
            .iter()
            .map(|&topic| (topic.label(), self.registry(topic).read().local_name_count()))
            .collect()
    }
}

pub type SharedStateHandle = Arc<SharedState>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LoopbackTransport;

    #[test]
    fn test_every_topic_has_a_registry() {
        let shared = SharedState::new(Arc::from("node-a"), Arc::new(LoopbackTransport));
        for topic in REGISTRY_TOPICS {
            assert_eq!(shared.registry(topic).read().topic(), topic);
        }
        assert_eq!(shared.subscription_counts().len(), REGISTRY_TOPICS.len());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let shared = SharedState::new(Arc::from("node-a"), Arc::new(LoopbackTransport));
        let a = shared.next_connection_id();
        let b = shared.next_connection_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_registries_are_shared_by_state_topic() {
        let shared = SharedState::new(Arc::from("node-a"), Arc::new(LoopbackTransport));
        assert!(shared.state("record-subscriptions").is_some());
        assert!(shared.state("no-such-topic").is_none());
    }
}
