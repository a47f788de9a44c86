//! Server front-end: accepts connections and distributes them to workers.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use rtlite_core::error::Result;

use crate::cluster::LoopbackTransport;
use crate::config::Config;
use crate::metrics_http;
use crate::shared::{SharedState, SharedStateHandle};
use crate::worker::{Worker, WorkerHandle, WorkerMsg};

/// Token for the listener socket.
const LISTENER: Token = Token(0);

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    next_worker: usize,
    shared: SharedStateHandle,
    config: Arc<Config>,
}

impl Server {
    /// Bind the listener and spawn `num_workers` worker threads.
    pub fn new(addr: SocketAddr, num_workers: usize, config: Arc<Config>) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        info!("rtlite listening on {}", addr);

        let server_name: Arc<str> = Arc::from(config.cluster.server_name.as_str());
        // The cluster transport is an integration seam; standalone nodes
        // run on the loopback implementation.
        let shared: SharedStateHandle =
            Arc::new(SharedState::new(server_name, Arc::new(LoopbackTransport)));

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            workers.push(Worker::spawn(id, shared.clone(), config.clone())?);
        }

        if config.metrics.enabled {
            metrics_http::start_metrics_server(
                config.metrics.bind,
                shared.clone(),
                Instant::now(),
            );
        }

        Ok(Self {
            poll,
            listener,
            workers,
            next_worker: 0,
            shared,
            config,
        })
    }

    pub fn shared(&self) -> &SharedStateHandle {
        &self.shared
    }

    /// Run the accept loop. Never returns under normal operation.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_pending();
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.dispatch_connection(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch_connection(&mut self, stream: mio::net::TcpStream, addr: SocketAddr) {
        let connected = self.shared.stats.clients_connected.load(Ordering::Relaxed);
        if connected >= self.config.limits.max_connections as u64 {
            warn!("rejecting {}: connection limit reached", addr);
            drop(stream);
            return;
        }

        // Round-robin over workers.
        let worker = &self.workers[self.next_worker];
        self.next_worker = (self.next_worker + 1) % self.workers.len();

        if worker
            .sender
            .send(WorkerMsg::NewConnection { stream, addr })
            .is_err()
        {
            error!("worker channel closed, dropping connection from {}", addr);
            return;
        }
        if let Err(e) = worker.waker.wake() {
            error!("failed to wake worker: {}", e);
        }
    }
}
