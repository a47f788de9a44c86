//! Per-topic subscription registry.
//!
//! Maps subscription names to the local connections interested in them and
//! keeps the reverse index from connection to held names. Fanout renders a
//! message once and writes the shared bytes to every subscriber except the
//! sender. Local presence per name is mirrored into the cluster state
//! registry, whose cluster-wide 0↔k edges feed the subscription listener.
//!
//! All operations on one registry instance are serialised by the caller
//! (each instance lives behind a single `RwLock` in `SharedState`).

use std::fmt;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::{debug, error, log_enabled, warn, Level};
use parking_lot::Mutex;
use rtlite_core::message::{Action, Message, RegistryTopic};

use crate::cluster::{ClusterTransport, StateListener, StateRegistry};
use crate::connection::{Connection, ConnectionId};
use crate::message_encoder::MessageEncoder;
use crate::monitoring::Monitoring;

/// The four rebindable action slots of a registry.
///
/// Defaults come from the registry topic; the listen-pattern registries use
/// LISTEN/UNLISTEN in place of SUBSCRIBE/UNSUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionBinding {
    pub subscribe: Action,
    pub unsubscribe: Action,
    pub multiple_subscriptions: Action,
    pub not_subscribed: Action,
}

impl ActionBinding {
    pub fn for_topic(topic: RegistryTopic) -> Self {
        Self {
            subscribe: topic.subscribe_action(),
            unsubscribe: topic.unsubscribe_action(),
            multiple_subscriptions: Action::MultipleSubscriptions,
            not_subscribed: Action::NotSubscribed,
        }
    }
}

/// Registry misuse by a higher-level subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// `set_action` was called with something other than the four canonical
    /// slot names.
    UnknownActionSlot(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnknownActionSlot(slot) => {
                write!(f, "unknown action slot: {:?}", slot)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Upstream observer of subscription lifecycle.
///
/// The per-subscription callbacks fire for every local change; the
/// first/last callbacks fire on cluster-wide edges aggregated over all
/// servers.
pub trait SubscriptionListener: Send + Sync {
    fn on_subscription_made(&self, name: &str, connection: &Arc<dyn Connection>);
    fn on_subscription_removed(&self, name: &str, connection: &Arc<dyn Connection>);
    fn on_first_subscription_made(&self, name: &str);
    fn on_last_subscription_removed(&self, name: &str);
}

/// Adapter wiring cluster-state edges to the subscription listener.
struct EdgeForwarder {
    listener: Arc<dyn SubscriptionListener>,
}

impl StateListener for EdgeForwarder {
    fn on_add(&self, name: &str) {
        self.listener.on_first_subscription_made(name);
    }

    fn on_remove(&self, name: &str) {
        self.listener.on_last_subscription_removed(name);
    }
}

/// One subscription name and its local subscribers.
///
/// Subscribers are held in insertion order; a fanout observes them in that
/// order. The entry is removed as soon as the socket list drains.
struct Subscription {
    name: Arc<str>,
    sockets: Vec<Arc<dyn Connection>>,
}

impl Subscription {
    fn has_socket(&self, id: ConnectionId) -> bool {
        self.sockets.iter().any(|socket| socket.id() == id)
    }
}

/// Subscription registry for one logical topic.
pub struct SubscriptionRegistry {
    topic: RegistryTopic,
    actions: ActionBinding,
    by_name: AHashMap<Arc<str>, Subscription>,
    /// Reverse index: the names each connection currently holds.
    by_connection: AHashMap<ConnectionId, AHashSet<Arc<str>>>,
    state: Arc<Mutex<StateRegistry>>,
    transport: Arc<dyn ClusterTransport>,
    monitoring: Arc<dyn Monitoring>,
    listener: Option<Arc<dyn SubscriptionListener>>,
    server_name: Arc<str>,
}

impl SubscriptionRegistry {
    pub fn new(
        topic: RegistryTopic,
        state: Arc<Mutex<StateRegistry>>,
        transport: Arc<dyn ClusterTransport>,
        monitoring: Arc<dyn Monitoring>,
        server_name: Arc<str>,
    ) -> Self {
        Self {
            topic,
            actions: ActionBinding::for_topic(topic),
            by_name: AHashMap::new(),
            by_connection: AHashMap::new(),
            state,
            transport,
            monitoring,
            listener: None,
            server_name,
        }
    }

    pub fn topic(&self) -> RegistryTopic {
        self.topic
    }

    pub fn actions(&self) -> &ActionBinding {
        &self.actions
    }

    /// Subscribe `connection` to `name`.
    ///
    /// A duplicate subscribe is reported to the connection and otherwise
    /// ignored; it never mutates the indexes. `silent` suppresses the ack,
    /// not the duplicate reply.
    pub fn subscribe(
        &mut self,
        name: &str,
        request: &Message,
        connection: &Arc<dyn Connection>,
        silent: bool,
    ) {
        if self
            .by_name
            .get(name)
            .is_some_and(|sub| sub.has_socket(connection.id()))
        {
            let reply =
                self.protocol_reply(self.actions.multiple_subscriptions, request.action, name);
            connection.send_message(&reply);
            if log_enabled!(Level::Warn) {
                warn!(
                    "{} repeat subscription to {}:{}",
                    connection.user(),
                    self.topic.label(),
                    name
                );
            }
            return;
        }

        let key = match self.by_name.get_mut(name) {
            Some(subscription) => {
                subscription.sockets.push(connection.clone());
                subscription.name.clone()
            }
            None => {
                let key: Arc<str> = Arc::from(name);
                self.by_name.insert(
                    key.clone(),
                    Subscription {
                        name: key.clone(),
                        sockets: vec![connection.clone()],
                    },
                );
                key
            }
        };

        let topic = self.topic;
        let held = self
            .by_connection
            .entry(connection.id())
            .or_insert_with(|| {
                // First subscription for this connection: register for close.
                connection.on_close(topic);
                AHashSet::new()
            });
        held.insert(key.clone());

        // The state registry ref-counts internally, so every local
        // subscriber is reported.
        self.state.lock().add(&key);

        if let Some(listener) = &self.listener {
            listener.on_subscription_made(&key, connection);
        }

        if !silent {
            connection.send_ack(request);
            if log_enabled!(Level::Debug) {
                debug!(
                    "{} subscribed to {}:{}",
                    connection.user(),
                    self.topic.label(),
                    key
                );
            }
        }
    }

    /// Unsubscribe `connection` from `name`.
    ///
    /// Unknown names and names the connection never held are reported with
    /// NOT_SUBSCRIBED (unless `silent`) and leave the indexes untouched.
    pub fn unsubscribe(
        &mut self,
        name: &str,
        request: &Message,
        connection: &Arc<dyn Connection>,
        silent: bool,
    ) {
        let removed = match self.by_name.get_mut(name) {
            Some(subscription) => {
                let before = subscription.sockets.len();
                subscription
                    .sockets
                    .retain(|socket| socket.id() != connection.id());
                subscription.sockets.len() != before
            }
            None => false,
        };

        if !removed {
            if !silent {
                let reply =
                    self.protocol_reply(self.actions.not_subscribed, request.action, name);
                connection.send_message(&reply);
                if log_enabled!(Level::Warn) {
                    warn!(
                        "{} is not subscribed to {}:{}",
                        connection.user(),
                        self.topic.label(),
                        name
                    );
                }
            }
            return;
        }

        self.remove_socket(name, connection, true);

        if !silent {
            connection.send_ack(request);
            if log_enabled!(Level::Debug) {
                debug!(
                    "{} unsubscribed from {}:{}",
                    connection.user(),
                    self.topic.label(),
                    name
                );
            }
        }
    }

    /// Subscribe to every name in a bulk request. The per-name subscribes
    /// are silent; one ack carries the bulk correlation id.
    pub fn subscribe_bulk(
        &mut self,
        request: &Message,
        connection: &Arc<dyn Connection>,
        silent: bool,
    ) {
        for name in &request.names {
            self.subscribe(name, request, connection, true);
        }
        if !silent {
            connection.send_ack(request);
        }
    }

    /// Bulk counterpart of `unsubscribe`.
    pub fn unsubscribe_bulk(
        &mut self,
        request: &Message,
        connection: &Arc<dyn Connection>,
        silent: bool,
    ) {
        for name in &request.names {
            self.unsubscribe(name, request, connection, true);
        }
        if !silent {
            connection.send_ack(request);
        }
    }

    /// Cleanup for a closing connection. Runs the unsubscribe post-removal
    /// logic for every held name; the reverse index entry is taken upfront
    /// so the loop iterates a snapshot.
    pub fn on_socket_close(&mut self, connection: &Arc<dyn Connection>) {
        let Some(held) = self.by_connection.remove(&connection.id()) else {
            error!("A socket has an illegal registered close callback");
            return;
        };

        for name in held {
            let removed = match self.by_name.get_mut(&*name) {
                Some(subscription) => {
                    let before = subscription.sockets.len();
                    subscription
                        .sockets
                        .retain(|socket| socket.id() != connection.id());
                    subscription.sockets.len() != before
                }
                None => false,
            };
            if removed {
                self.remove_socket(&name, connection, false);
            }
        }
    }

    /// Broadcast `message` to every local subscriber of `name` except the
    /// sender. A non-null sender means the message originated locally and is
    /// forwarded to the cluster first (unless suppressed); a null sender
    /// marks a message that arrived from the cluster bus.
    pub fn send_to_subscribers(
        &self,
        name: &str,
        message: &Message,
        no_delay: bool,
        sender: Option<&Arc<dyn Connection>>,
        suppress_remote: bool,
    ) {
        if sender.is_some() && !suppress_remote {
            self.transport.send(message);
        }

        let Some(subscription) = self.by_name.get(name) else {
            return;
        };

        self.monitoring
            .on_broadcast(message, subscription.sockets.len());

        let sender_id = sender.map(|socket| socket.id());
        let mut encoder = MessageEncoder::new(message);
        for socket in &subscription.sockets {
            if Some(socket.id()) == sender_id {
                continue;
            }
            socket.send_built_message(&encoder.frame(), no_delay);
        }
    }

    /// Local subscribers of `name`, in fanout order.
    pub fn get_local_subscribers(&self, name: &str) -> &[Arc<dyn Connection>] {
        self.by_name
            .get(name)
            .map(|subscription| subscription.sockets.as_slice())
            .unwrap_or_default()
    }

    pub fn has_local_subscribers(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Number of names with at least one local subscriber.
    pub fn local_name_count(&self) -> usize {
        self.by_name.len()
    }

    /// All names with at least one subscriber anywhere in the cluster.
    pub fn get_names(&self) -> Vec<Arc<str>> {
        self.state.lock().get_all()
    }

    /// Whether any server holds a subscriber for `name`.
    pub fn has_name(&self, name: &str) -> bool {
        self.state.lock().has(name)
    }

    pub fn get_all_servers(&self, name: &str) -> Vec<Arc<str>> {
        self.state.lock().get_all_servers(name)
    }

    /// `get_all_servers` minus this server.
    pub fn get_all_remote_servers(&self, name: &str) -> Vec<Arc<str>> {
        let mut servers = self.state.lock().get_all_servers(name);
        servers.retain(|server| **server != *self.server_name);
        servers
    }

    /// Run `callback` once the cluster state backing this registry has
    /// synchronised.
    pub fn when_ready(&self, callback: Box<dyn FnOnce() + Send>) {
        self.state.lock().when_ready(callback);
    }

    /// Rebind one of the four canonical action slots. Unknown slot names
    /// are rejected.
    pub fn set_action(&mut self, slot: &str, action: Action) -> Result<(), RegistryError> {
        match slot.to_ascii_uppercase().as_str() {
            "SUBSCRIBE" => self.actions.subscribe = action,
            "UNSUBSCRIBE" => self.actions.unsubscribe = action,
            "MULTIPLE_SUBSCRIPTIONS" => self.actions.multiple_subscriptions = action,
            "NOT_SUBSCRIBED" => self.actions.not_subscribed = action,
            other => return Err(RegistryError::UnknownActionSlot(other.to_string())),
        }
        Ok(())
    }

    /// Install the lifecycle listener and wire the cluster-wide edges to
    /// its first/last callbacks.
    pub fn set_subscription_listener(&mut self, listener: Arc<dyn SubscriptionListener>) {
        self.state.lock().add_listener(Arc::new(EdgeForwarder {
            listener: listener.clone(),
        }));
        self.listener = Some(listener);
    }

    /// Post-removal bookkeeping shared by unsubscribe and the close path.
    /// The socket must already be gone from the subscription's socket list;
    /// the empty check therefore observes the post-removal state.
    fn remove_socket(
        &mut self,
        name: &str,
        connection: &Arc<dyn Connection>,
        update_connection_index: bool,
    ) {
        let now_empty = self
            .by_name
            .get(name)
            .is_some_and(|subscription| subscription.sockets.is_empty());
        let key = if now_empty {
            self.by_name.remove_entry(name).map(|(key, _)| key)
        } else {
            self.by_name
                .get(name)
                .map(|subscription| subscription.name.clone())
        };
        let Some(key) = key else {
            return;
        };

        if let Some(listener) = &self.listener {
            listener.on_subscription_removed(&key, connection);
        }

        self.state.lock().remove(&key);

        if update_connection_index {
            if let Some(held) = self.by_connection.get_mut(&connection.id()) {
                held.remove(&key);
                if held.is_empty() {
                    self.by_connection.remove(&connection.id());
                    // Last subscription cleared by an explicit unsubscribe:
                    // drop the close registration. The close path never
                    // reaches here.
                    connection.remove_on_close(self.topic);
                }
            }
        }
    }

    fn protocol_reply(&self, action: Action, original: Action, name: &str) -> Message {
        Message {
            topic: self.topic.wire_topic(),
            action,
            original_action: Some(original),
            name: name.to_string(),
            names: Vec::new(),
            correlation_id: None,
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtlite_core::message::Topic;

    #[derive(Default)]
    struct RecordingTransport {
        sends: Mutex<Vec<Message>>,
        adds: Mutex<Vec<String>>,
        removes: Mutex<Vec<String>>,
    }

    impl ClusterTransport for RecordingTransport {
        fn send(&self, message: &Message) {
            self.sends.lock().push(message.clone());
        }
        fn send_state_add(&self, _state_topic: &str, name: &str) {
            self.adds.lock().push(name.to_string());
        }
        fn send_state_remove(&self, _state_topic: &str, name: &str) {
            self.removes.lock().push(name.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingMonitoring {
        broadcasts: Mutex<Vec<(String, usize)>>,
    }

    impl Monitoring for RecordingMonitoring {
        fn on_broadcast(&self, message: &Message, subscriber_count: usize) {
            self.broadcasts
                .lock()
                .push((message.name.clone(), subscriber_count));
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        made: Mutex<Vec<(String, ConnectionId)>>,
        removed: Mutex<Vec<(String, ConnectionId)>>,
        first: Mutex<Vec<String>>,
        last: Mutex<Vec<String>>,
    }

    impl SubscriptionListener for RecordingListener {
        fn on_subscription_made(&self, name: &str, connection: &Arc<dyn Connection>) {
            self.made.lock().push((name.to_string(), connection.id()));
        }
        fn on_subscription_removed(&self, name: &str, connection: &Arc<dyn Connection>) {
            self.removed.lock().push((name.to_string(), connection.id()));
        }
        fn on_first_subscription_made(&self, name: &str) {
            self.first.lock().push(name.to_string());
        }
        fn on_last_subscription_removed(&self, name: &str) {
            self.last.lock().push(name.to_string());
        }
    }

    struct MockConnection {
        id: ConnectionId,
        user: Arc<str>,
        sent: Mutex<Vec<Message>>,
        acks: Mutex<Vec<Message>>,
        frames: Mutex<Vec<Bytes>>,
        close_hooks: Mutex<AHashSet<RegistryTopic>>,
    }

    impl MockConnection {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId(id),
                user: Arc::from(format!("user-{}", id).as_str()),
                sent: Mutex::new(Vec::new()),
                acks: Mutex::new(Vec::new()),
                frames: Mutex::new(Vec::new()),
                close_hooks: Mutex::new(AHashSet::new()),
            })
        }
    }

    impl Connection for MockConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }
        fn user(&self) -> Arc<str> {
            self.user.clone()
        }
        fn send_message(&self, message: &Message) {
            self.sent.lock().push(message.clone());
        }
        fn send_ack(&self, request: &Message) {
            self.acks.lock().push(Message::ack(request));
        }
        fn send_built_message(&self, frame: &Bytes, _no_delay: bool) {
            self.frames.lock().push(frame.clone());
        }
        fn on_close(&self, topic: RegistryTopic) {
            self.close_hooks.lock().insert(topic);
        }
        fn remove_on_close(&self, topic: RegistryTopic) {
            self.close_hooks.lock().remove(&topic);
        }
    }

    fn as_conn(mock: &Arc<MockConnection>) -> Arc<dyn Connection> {
        mock.clone()
    }

    struct Fixture {
        registry: SubscriptionRegistry,
        transport: Arc<RecordingTransport>,
        monitoring: Arc<RecordingMonitoring>,
        state: Arc<Mutex<StateRegistry>>,
    }

    fn fixture(topic: RegistryTopic) -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let monitoring = Arc::new(RecordingMonitoring::default());
        let state = Arc::new(Mutex::new(StateRegistry::new(
            topic.state_topic(),
            Arc::from("node-a"),
            transport.clone(),
            true,
        )));
        let registry = SubscriptionRegistry::new(
            topic,
            state.clone(),
            transport.clone(),
            monitoring.clone(),
            Arc::from("node-a"),
        );
        Fixture {
            registry,
            transport,
            monitoring,
            state,
        }
    }

    fn subscribe_req(name: &str) -> Message {
        Message::new(Topic::Event, Action::Subscribe, name)
    }

    fn unsubscribe_req(name: &str) -> Message {
        Message::new(Topic::Event, Action::Unsubscribe, name)
    }

    fn check_invariants(fx: &Fixture, conns: &[Arc<MockConnection>]) {
        for (name, subscription) in &fx.registry.by_name {
            // No subscription survives with an empty socket set.
            assert!(!subscription.sockets.is_empty(), "empty entry for {}", name);
            for socket in &subscription.sockets {
                let held = fx
                    .registry
                    .by_connection
                    .get(&socket.id())
                    .expect("socket without reverse index entry");
                assert!(held.contains(name));
            }
            // Bridge net count equals the local subscriber count.
            assert_eq!(
                fx.state.lock().local_count(name),
                subscription.sockets.len() as u32
            );
        }
        for (id, held) in &fx.registry.by_connection {
            assert!(!held.is_empty());
            for name in held {
                let subscription = fx.registry.by_name.get(name).expect("dangling name");
                assert!(subscription.has_socket(*id));
            }
        }
        // Reverse index entry ⇔ registered close hook.
        for conn in conns {
            assert_eq!(
                fx.registry.by_connection.contains_key(&conn.id()),
                conn.close_hooks.lock().contains(&fx.registry.topic)
            );
        }
    }

    #[test]
    fn test_subscribe_acks_and_indexes() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("weather", &subscribe_req("weather"), &as_conn(&c1), false);

        assert_eq!(c1.acks.lock().len(), 1);
        assert_eq!(c1.acks.lock()[0].original_action, Some(Action::Subscribe));
        assert!(fx.registry.has_local_subscribers("weather"));
        assert_eq!(fx.registry.get_local_subscribers("weather").len(), 1);
        assert_eq!(*fx.transport.adds.lock(), vec!["weather"]);
        check_invariants(&fx, &[c1]);
    }

    #[test]
    fn test_silent_subscribe_skips_ack() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("weather", &subscribe_req("weather"), &as_conn(&c1), true);
        assert!(c1.acks.lock().is_empty());
        assert!(fx.registry.has_local_subscribers("weather"));
    }

    #[test]
    fn test_duplicate_subscribe_is_reported_and_ignored() {
        // Scenario S3.
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);

        let sent = c1.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::MultipleSubscriptions);
        assert_eq!(sent[0].original_action, Some(Action::Subscribe));
        assert_eq!(sent[0].name, "x");
        assert_eq!(sent[0].topic, Topic::Event);
        drop(sent);

        // No second ack, no index change, exactly one bridge add.
        assert_eq!(c1.acks.lock().len(), 1);
        assert_eq!(fx.registry.get_local_subscribers("x").len(), 1);
        assert_eq!(*fx.transport.adds.lock(), vec!["x"]);
        check_invariants(&fx, &[c1]);
    }

    #[test]
    fn test_unsubscribe_unknown_name_is_reported() {
        // Scenario S4.
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .unsubscribe("y", &unsubscribe_req("y"), &as_conn(&c1), false);

        let sent = c1.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::NotSubscribed);
        assert_eq!(sent[0].original_action, Some(Action::Unsubscribe));
        assert_eq!(sent[0].name, "y");
        drop(sent);

        assert!(c1.acks.lock().is_empty());
        assert!(fx.registry.by_name.is_empty());
        assert!(fx.registry.by_connection.is_empty());
    }

    #[test]
    fn test_silent_unsubscribe_of_unknown_name_is_quiet() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .unsubscribe("y", &unsubscribe_req("y"), &as_conn(&c1), true);
        assert!(c1.sent.lock().is_empty());
        assert!(c1.acks.lock().is_empty());
    }

    #[test]
    fn test_unsubscribe_by_non_subscriber_leaves_others_intact() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        let c2 = MockConnection::new(2);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        fx.registry
            .unsubscribe("x", &unsubscribe_req("x"), &as_conn(&c2), false);

        assert_eq!(c2.sent.lock()[0].action, Action::NotSubscribed);
        assert_eq!(fx.registry.get_local_subscribers("x").len(), 1);
        check_invariants(&fx, &[c1, c2]);
    }

    #[test]
    fn test_subscribe_unsubscribe_round_trip_restores_empty_state() {
        // Invariant 7: including close hook removal.
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        assert!(c1.close_hooks.lock().contains(&RegistryTopic::Event));

        fx.registry
            .unsubscribe("x", &unsubscribe_req("x"), &as_conn(&c1), false);
        assert!(fx.registry.by_name.is_empty());
        assert!(fx.registry.by_connection.is_empty());
        assert!(c1.close_hooks.lock().is_empty());
        assert_eq!(*fx.transport.removes.lock(), vec!["x"]);
        assert_eq!(c1.acks.lock().len(), 2);
    }

    #[test]
    fn test_close_hook_survives_while_other_subscriptions_remain() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("a", &subscribe_req("a"), &as_conn(&c1), false);
        fx.registry
            .subscribe("b", &subscribe_req("b"), &as_conn(&c1), false);

        fx.registry
            .unsubscribe("a", &unsubscribe_req("a"), &as_conn(&c1), false);
        assert!(c1.close_hooks.lock().contains(&RegistryTopic::Event));

        fx.registry
            .unsubscribe("b", &unsubscribe_req("b"), &as_conn(&c1), false);
        assert!(c1.close_hooks.lock().is_empty());
        check_invariants(&fx, &[c1]);
    }

    #[test]
    fn test_fanout_excludes_sender() {
        // Scenario S1.
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        let c2 = MockConnection::new(2);
        let c3 = MockConnection::new(3);
        for c in [&c1, &c2, &c3] {
            fx.registry
                .subscribe("room/1", &subscribe_req("room/1"), &as_conn(c), false);
        }

        let message = Message::emit(Topic::Event, "room/1", Bytes::from_static(b"hi"));
        fx.registry
            .send_to_subscribers("room/1", &message, false, Some(&as_conn(&c2)), false);

        assert_eq!(fx.transport.sends.lock().len(), 1);
        assert_eq!(
            *fx.monitoring.broadcasts.lock(),
            vec![("room/1".to_string(), 3)]
        );

        let expected = Bytes::from(message.to_frame());
        assert_eq!(*c1.frames.lock(), vec![expected.clone()]);
        assert_eq!(*c3.frames.lock(), vec![expected]);
        assert!(c2.frames.lock().is_empty());
    }

    #[test]
    fn test_fanout_shares_one_encoded_frame() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        let c2 = MockConnection::new(2);
        for c in [&c1, &c2] {
            fx.registry
                .subscribe("room/1", &subscribe_req("room/1"), &as_conn(c), false);
        }

        let message = Message::emit(Topic::Event, "room/1", Bytes::from_static(b"payload"));
        fx.registry
            .send_to_subscribers("room/1", &message, false, None, false);

        let f1 = c1.frames.lock()[0].clone();
        let f2 = c2.frames.lock()[0].clone();
        assert_eq!(f1.as_ptr(), f2.as_ptr());
    }

    #[test]
    fn test_cluster_origin_message_is_not_reforwarded() {
        // Scenario S2.
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("room/1", &subscribe_req("room/1"), &as_conn(&c1), false);

        let message = Message::emit(Topic::Event, "room/1", Bytes::from_static(b"hi"));
        fx.registry
            .send_to_subscribers("room/1", &message, false, None, false);

        assert!(fx.transport.sends.lock().is_empty());
        assert_eq!(c1.frames.lock().len(), 1);
    }

    #[test]
    fn test_suppress_remote_skips_cluster_forwarding() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("room/1", &subscribe_req("room/1"), &as_conn(&c1), false);

        let message = Message::emit(Topic::Event, "room/1", Bytes::from_static(b"hi"));
        let sender = as_conn(&c1);
        fx.registry
            .send_to_subscribers("room/1", &message, false, Some(&sender), true);
        assert!(fx.transport.sends.lock().is_empty());
    }

    #[test]
    fn test_fanout_to_unknown_name_is_a_noop() {
        let fx = fixture(RegistryTopic::Event);
        let message = Message::emit(Topic::Event, "nobody", Bytes::from_static(b"hi"));
        fx.registry
            .send_to_subscribers("nobody", &message, false, None, false);
        assert!(fx.monitoring.broadcasts.lock().is_empty());
    }

    #[test]
    fn test_close_cascade_removes_everything() {
        // Scenario S5.
        let mut fx = fixture(RegistryTopic::Event);
        let listener = Arc::new(RecordingListener::default());
        fx.registry.set_subscription_listener(listener.clone());

        let c1 = MockConnection::new(1);
        for name in ["a", "b", "c"] {
            fx.registry
                .subscribe(name, &subscribe_req(name), &as_conn(&c1), false);
        }

        // The connection layer drains the hook set before invoking us.
        c1.close_hooks.lock().clear();
        fx.registry.on_socket_close(&as_conn(&c1));

        let mut removed: Vec<String> = listener
            .removed
            .lock()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        removed.sort();
        assert_eq!(removed, vec!["a", "b", "c"]);

        let mut bridge_removes = fx.transport.removes.lock().clone();
        bridge_removes.sort();
        assert_eq!(bridge_removes, vec!["a", "b", "c"]);

        assert!(fx.registry.by_connection.is_empty());
        assert!(fx.registry.by_name.is_empty());
        check_invariants(&fx, &[c1]);
    }

    #[test]
    fn test_close_cascade_spares_other_subscribers() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        let c2 = MockConnection::new(2);
        fx.registry
            .subscribe("a", &subscribe_req("a"), &as_conn(&c1), false);
        fx.registry
            .subscribe("a", &subscribe_req("a"), &as_conn(&c2), false);

        c1.close_hooks.lock().clear();
        fx.registry.on_socket_close(&as_conn(&c1));

        assert_eq!(fx.registry.get_local_subscribers("a").len(), 1);
        assert_eq!(fx.registry.get_local_subscribers("a")[0].id(), c2.id());
        assert_eq!(fx.state.lock().local_count("a"), 1);
        check_invariants(&fx, &[c1, c2]);
    }

    #[test]
    fn test_close_without_index_entry_is_tolerated() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry.on_socket_close(&as_conn(&c1));
        assert!(fx.registry.by_name.is_empty());
    }

    #[test]
    fn test_lifecycle_listener_per_subscription_callbacks() {
        let mut fx = fixture(RegistryTopic::Event);
        let listener = Arc::new(RecordingListener::default());
        fx.registry.set_subscription_listener(listener.clone());

        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        fx.registry
            .unsubscribe("x", &unsubscribe_req("x"), &as_conn(&c1), false);

        assert_eq!(*listener.made.lock(), vec![("x".to_string(), c1.id())]);
        assert_eq!(*listener.removed.lock(), vec![("x".to_string(), c1.id())]);
    }

    #[test]
    fn test_first_and_last_fire_on_cluster_edges_only() {
        let mut fx = fixture(RegistryTopic::Event);
        let listener = Arc::new(RecordingListener::default());
        fx.registry.set_subscription_listener(listener.clone());

        let c1 = MockConnection::new(1);
        let c2 = MockConnection::new(2);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c2), false);
        assert_eq!(*listener.first.lock(), vec!["x"]);

        fx.registry
            .unsubscribe("x", &unsubscribe_req("x"), &as_conn(&c1), false);
        assert!(listener.last.lock().is_empty());
        fx.registry
            .unsubscribe("x", &unsubscribe_req("x"), &as_conn(&c2), false);
        assert_eq!(*listener.last.lock(), vec!["x"]);
    }

    #[test]
    fn test_first_suppressed_when_remote_server_already_holds_name() {
        let mut fx = fixture(RegistryTopic::Event);
        let listener = Arc::new(RecordingListener::default());
        fx.registry.set_subscription_listener(listener.clone());

        fx.state.lock().apply_remote_add("node-b", "x");
        assert_eq!(*listener.first.lock(), vec!["x"]);

        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        assert_eq!(listener.first.lock().len(), 1);

        fx.registry
            .unsubscribe("x", &unsubscribe_req("x"), &as_conn(&c1), false);
        assert!(listener.last.lock().is_empty());

        fx.state.lock().apply_remote_remove("node-b", "x");
        assert_eq!(*listener.last.lock(), vec!["x"]);
    }

    #[test]
    fn test_bulk_subscribe_sends_single_ack() {
        // Scenario S6.
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        let request = Message::bulk(
            Topic::Event,
            Action::SubscribeBulk,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            "k",
        );
        fx.registry.subscribe_bulk(&request, &as_conn(&c1), false);

        let acks = c1.acks.lock();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].correlation_id.as_deref(), Some("k"));
        assert_eq!(acks[0].original_action, Some(Action::SubscribeBulk));
        drop(acks);

        for name in ["a", "b", "c"] {
            assert!(fx.registry.has_local_subscribers(name));
        }
        check_invariants(&fx, &[c1]);
    }

    #[test]
    fn test_bulk_subscribe_still_reports_duplicates() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("b", &subscribe_req("b"), &as_conn(&c1), false);

        let request = Message::bulk(
            Topic::Event,
            Action::SubscribeBulk,
            vec!["a".to_string(), "b".to_string()],
            "k",
        );
        fx.registry.subscribe_bulk(&request, &as_conn(&c1), false);

        let sent = c1.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].action, Action::MultipleSubscriptions);
        assert_eq!(sent[0].name, "b");
    }

    #[test]
    fn test_bulk_unsubscribe_is_quiet_about_unknown_names() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("a", &subscribe_req("a"), &as_conn(&c1), false);

        let request = Message::bulk(
            Topic::Event,
            Action::UnsubscribeBulk,
            vec!["a".to_string(), "ghost".to_string()],
            "k",
        );
        fx.registry.unsubscribe_bulk(&request, &as_conn(&c1), false);

        assert!(c1.sent.lock().is_empty());
        assert_eq!(c1.acks.lock().len(), 2); // initial subscribe + bulk
        assert!(!fx.registry.has_local_subscribers("a"));
    }

    #[test]
    fn test_set_action_rebinds_reply_codes() {
        let mut fx = fixture(RegistryTopic::Event);
        fx.registry
            .set_action("multiple_subscriptions", Action::Error)
            .unwrap();

        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        assert_eq!(c1.sent.lock()[0].action, Action::Error);
    }

    #[test]
    fn test_set_action_rejects_unknown_slots() {
        let mut fx = fixture(RegistryTopic::Event);
        let err = fx.registry.set_action("bogus", Action::Error).unwrap_err();
        assert_eq!(err, RegistryError::UnknownActionSlot("BOGUS".to_string()));
    }

    #[test]
    fn test_listen_registry_defaults_to_listen_actions() {
        let fx = fixture(RegistryTopic::EventListenPatterns);
        assert_eq!(fx.registry.actions().subscribe, Action::Listen);
        assert_eq!(fx.registry.actions().unsubscribe, Action::Unlisten);
    }

    #[test]
    fn test_remote_servers_exclude_self() {
        let mut fx = fixture(RegistryTopic::Event);
        let c1 = MockConnection::new(1);
        fx.registry
            .subscribe("x", &subscribe_req("x"), &as_conn(&c1), false);
        fx.state.lock().apply_remote_add("node-b", "x");

        let mut all: Vec<String> = fx
            .registry
            .get_all_servers("x")
            .iter()
            .map(|s| s.to_string())
            .collect();
        all.sort();
        assert_eq!(all, vec!["node-a", "node-b"]);

        let remote: Vec<String> = fx
            .registry
            .get_all_remote_servers("x")
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(remote, vec!["node-b"]);

        assert!(fx.registry.has_name("x"));
        assert_eq!(fx.registry.get_names().len(), 1);
    }

    #[test]
    fn test_when_ready_runs_through_state_registry() {
        let fx = fixture(RegistryTopic::Event);
        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();
        fx.registry.when_ready(Box::new(move || *flag.lock() = true));
        assert!(*fired.lock());
    }

    // Deterministic xorshift so failures reproduce.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn below(&mut self, bound: u64) -> u64 {
            self.next() % bound
        }
    }

    #[test]
    fn test_random_sequences_preserve_invariants() {
        let names = ["a", "b", "c", "d", "e"];
        let mut rng = Rng(0x5eed_cafe);
        let mut fx = fixture(RegistryTopic::Event);
        let mut next_id = 1u64;
        let mut conns: Vec<Arc<MockConnection>> = (0..4)
            .map(|_| {
                let c = MockConnection::new(next_id);
                next_id += 1;
                c
            })
            .collect();

        for _ in 0..2000 {
            let name = names[rng.below(names.len() as u64) as usize];
            let slot = rng.below(conns.len() as u64) as usize;
            match rng.below(10) {
                0..=4 => {
                    let silent = rng.below(2) == 0;
                    fx.registry.subscribe(
                        name,
                        &subscribe_req(name),
                        &as_conn(&conns[slot]),
                        silent,
                    );
                }
                5..=8 => {
                    let silent = rng.below(2) == 0;
                    fx.registry.unsubscribe(
                        name,
                        &unsubscribe_req(name),
                        &as_conn(&conns[slot]),
                        silent,
                    );
                }
                _ => {
                    // Close: the connection layer drains the hook set and
                    // invokes the registry once if a hook was registered.
                    let conn = conns[slot].clone();
                    let had_hook = conn
                        .close_hooks
                        .lock()
                        .remove(&RegistryTopic::Event);
                    if had_hook {
                        fx.registry.on_socket_close(&as_conn(&conn));
                    }
                    conns[slot] = MockConnection::new(next_id);
                    next_id += 1;
                }
            }
            check_invariants(&fx, &conns);
        }
    }
}
