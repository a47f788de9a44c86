//! Worker event loop.
//!
//! Each worker owns a set of client connections and runs a single-threaded
//! mio poll loop: frames in, registry dispatch, buffered writes out. All
//! registry operations from this worker are serialised through the
//! per-registry locks in `SharedState`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;

use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use rtlite_core::error::Error;
use rtlite_core::message::{Action, Message, RegistryTopic, Topic, REGISTRY_TOPICS};

use crate::client::{Client, ClientState};
use crate::client_handle::ClientWriteHandle;
use crate::config::Config;
use crate::connection::Connection;
use crate::shared::SharedStateHandle;

/// Token reserved for the cross-thread waker.
const WAKER: Token = Token(0);

/// Channel capacity for messages from the acceptor.
const CHANNEL_CAPACITY: usize = 1024;

/// Message from the server thread to a worker.
pub enum WorkerMsg {
    NewConnection { stream: TcpStream, addr: SocketAddr },
    Shutdown,
}

/// Handle the server keeps per worker.
pub struct WorkerHandle {
    pub sender: Sender<WorkerMsg>,
    pub waker: Arc<Waker>,
    pub thread: thread::JoinHandle<()>,
}

/// The base (non-listen) registry for a wire topic.
fn base_registry(topic: Topic) -> Option<RegistryTopic> {
    match topic {
        Topic::Record => Some(RegistryTopic::Record),
        Topic::Event => Some(RegistryTopic::Event),
        Topic::Rpc => Some(RegistryTopic::Rpc),
        Topic::Presence => Some(RegistryTopic::Presence),
        Topic::Monitoring => Some(RegistryTopic::Monitoring),
        Topic::Connection => None,
    }
}

pub struct Worker {
    id: usize,
    poll: Poll,
    epoll_fd: i32,
    receiver: Receiver<WorkerMsg>,
    shared: SharedStateHandle,
    config: Arc<Config>,
    clients: AHashMap<Token, Client>,
    next_token: usize,
    frame_buf: Vec<Message>,
}

impl Worker {
    /// Spawn a worker thread and return its handle.
    pub fn spawn(
        id: usize,
        shared: SharedStateHandle,
        config: Arc<Config>,
    ) -> io::Result<WorkerHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (sender, receiver) = bounded(CHANNEL_CAPACITY);
        let epoll_fd = poll.as_raw_fd();

        let worker = Worker {
            id,
            poll,
            epoll_fd,
            receiver,
            shared,
            config,
            clients: AHashMap::new(),
            next_token: WAKER.0 + 1,
            frame_buf: Vec::new(),
        };

        let thread = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || worker.run())?;

        Ok(WorkerHandle {
            sender,
            waker,
            thread,
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        info!("worker {} started", self.id);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("worker {} poll error: {}", self.id, e);
                return;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    while let Ok(msg) = self.receiver.try_recv() {
                        match msg {
                            WorkerMsg::NewConnection { stream, addr } => {
                                self.accept_connection(stream, addr);
                            }
                            WorkerMsg::Shutdown => {
                                info!("worker {} shutting down", self.id);
                                return;
                            }
                        }
                    }
                    continue;
                }

                if event.is_readable() {
                    self.handle_readable(token);
                }
                if event.is_writable() {
                    self.handle_writable(token);
                }
            }
        }
    }

    fn accept_connection(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            error!("worker {} failed to register {}: {}", self.id, addr, e);
            return;
        }

        let id = self.shared.next_connection_id();
        let handle = Arc::new(ClientWriteHandle::new(
            id,
            self.id,
            self.epoll_fd,
            stream.as_raw_fd(),
            token,
            self.shared.stats.clone(),
        ));
        self.clients
            .insert(token, Client::new(token, stream, addr, handle));
        self.shared.stats.client_connected();
        debug!("worker {} accepted {} as {}", self.id, addr, id);
    }

    fn handle_readable(&mut self, token: Token) {
        let mut messages = std::mem::take(&mut self.frame_buf);
        messages.clear();

        let max_frame = self.config.limits.max_message_size;
        let read_result = match self.clients.get_mut(&token) {
            Some(client) => client.read_frames(max_frame, &mut messages),
            None => {
                self.frame_buf = messages;
                return;
            }
        };

        match read_result {
            Ok((bytes, closed)) => {
                self.shared.stats.add_bytes_received(bytes as u64);
                for message in messages.drain(..) {
                    self.dispatch(token, message);
                }
                if closed {
                    self.close_client(token);
                }
            }
            Err(Error::Protocol(e)) => {
                warn!("worker {} protocol error: {}", self.id, e);
                if let Some(client) = self.clients.get_mut(&token) {
                    client.state = ClientState::Disconnecting;
                    client
                        .handle
                        .send_message(&Message::new(Topic::Connection, Action::Error, e.to_string()));
                    let _ = client.handle.flush(&mut client.stream);
                }
                self.close_client(token);
            }
            Err(Error::Io(e)) => {
                debug!("worker {} read error: {}", self.id, e);
                self.close_client(token);
            }
        }

        self.frame_buf = messages;
    }

    fn handle_writable(&mut self, token: Token) {
        let result = match self.clients.get_mut(&token) {
            Some(client) => client.handle.flush(&mut client.stream),
            None => return,
        };
        if let Err(e) = result {
            debug!("worker {} flush error: {}", self.id, e);
            self.close_client(token);
        }
    }

    fn dispatch(&mut self, token: Token, message: Message) {
        self.shared.stats.add_msgs_received(1);

        let conn: Arc<dyn Connection> = {
            let Some(client) = self.clients.get_mut(&token) else {
                return;
            };
            if message.action == Action::Hello {
                client.handle.set_username(&message.name);
                client.state = ClientState::Connected;
                client.handle.send_ack(&message);
                debug!("worker {} client identified as {}", self.id, message.name);
                return;
            }
            client.handle.clone()
        };

        match message.action {
            Action::SubscribeBulk | Action::UnsubscribeBulk => {
                let Some(topic) = base_registry(message.topic) else {
                    self.send_error(&conn, "bulk subscription not supported for this topic");
                    return;
                };
                let registry = self.shared.registry(topic);
                if message.action == Action::SubscribeBulk {
                    registry.write().subscribe_bulk(&message, &conn, false);
                } else {
                    registry.write().unsubscribe_bulk(&message, &conn, false);
                }
            }
            Action::Emit => {
                if message.topic != Topic::Event || message.name.is_empty() {
                    self.send_error(&conn, "emit requires an event name");
                    return;
                }
                self.shared
                    .registry(RegistryTopic::Event)
                    .read()
                    .send_to_subscribers(&message.name, &message, false, Some(&conn), false);
            }
            Action::Subscribe | Action::Unsubscribe | Action::Listen | Action::Unlisten => {
                if message.name.is_empty() {
                    self.send_error(&conn, "subscription name must not be empty");
                    return;
                }
                match self.resolve_registry(message.topic, message.action) {
                    Some((topic, subscribe)) => {
                        let registry = self.shared.registry(topic);
                        if subscribe {
                            registry
                                .write()
                                .subscribe(&message.name, &message, &conn, false);
                        } else {
                            registry
                                .write()
                                .unsubscribe(&message.name, &message, &conn, false);
                        }
                    }
                    None => self.send_error(&conn, "action not supported for this topic"),
                }
            }
            // Acks from clients have nothing to confirm on the server side.
            Action::Ack => {}
            _ => self.send_error(&conn, "unexpected action"),
        }
    }

    /// Find the registry whose current action binding claims this action.
    /// Bindings are consulted at dispatch time so a rebound registry keeps
    /// receiving its traffic.
    fn resolve_registry(&self, topic: Topic, action: Action) -> Option<(RegistryTopic, bool)> {
        for registry_topic in REGISTRY_TOPICS {
            if registry_topic.wire_topic() != topic {
                continue;
            }
            let actions = *self.shared.registry(registry_topic).read().actions();
            if actions.subscribe == action {
                return Some((registry_topic, true));
            }
            if actions.unsubscribe == action {
                return Some((registry_topic, false));
            }
        }
        None
    }

    fn send_error(&self, conn: &Arc<dyn Connection>, text: &str) {
        conn.send_message(&Message::new(Topic::Connection, Action::Error, text));
    }

    fn close_client(&mut self, token: Token) {
        let Some(mut client) = self.clients.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut client.stream);

        // Fire each registered close hook exactly once. Draining the set
        // first means the registries run with the hooks already gone, so
        // nothing can re-enter the close path.
        let conn: Arc<dyn Connection> = client.handle.clone();
        for topic in client.handle.take_close_hooks() {
            self.shared.registry(topic).write().on_socket_close(&conn);
        }

        self.shared.stats.client_disconnected();
        debug!(
            "worker {} closed connection {} ({})",
            self.id,
            client.handle.id(),
            client.remote_addr
        );
    }
}
