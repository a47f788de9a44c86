//! Cross-thread client write handle.
//!
//! Any thread holding the handle can queue frames into the client's output
//! buffer and wake the owning worker via epoll_ctl, which is thread-safe.
//! Registries address clients exclusively through this handle's
//! `Connection` impl.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use bytes::Bytes;
use mio::Token;
use parking_lot::Mutex;
use rtlite_core::message::{Message, RegistryTopic};

use crate::connection::{Connection, ConnectionId};
use crate::monitoring::ServerStats;
use crate::write_buffer::WriteBuffer;

// Thread-local buffer for frame encoding (avoids allocation per frame).
thread_local! {
    static ENCODE_BUF: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

/// Shared write handle for one client connection.
pub struct ClientWriteHandle {
    /// Mutex-protected output buffer.
    write_buf: Mutex<WriteBuffer>,
    /// Avoids redundant epoll_ctl calls when write interest is unchanged.
    ready_for_writing: AtomicBool,
    /// Username from the handshake.
    username: Mutex<Arc<str>>,
    /// Registries that registered for this connection's close.
    close_hooks: Mutex<AHashSet<RegistryTopic>>,
    id: ConnectionId,
    /// The epoll fd of the owning worker's Poll.
    epoll_fd: RawFd,
    /// The client's socket fd.
    socket_fd: RawFd,
    token: Token,
    worker_id: usize,
    stats: Arc<ServerStats>,
}

impl ClientWriteHandle {
    pub fn new(
        id: ConnectionId,
        worker_id: usize,
        epoll_fd: RawFd,
        socket_fd: RawFd,
        token: Token,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            write_buf: Mutex::new(WriteBuffer::new()),
            ready_for_writing: AtomicBool::new(false),
            username: Mutex::new(Arc::from("anonymous")),
            close_hooks: Mutex::new(AHashSet::new()),
            id,
            epoll_fd,
            socket_fd,
            token,
            worker_id,
            stats,
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn set_username(&self, name: &str) {
        *self.username.lock() = Arc::from(name);
    }

    /// Drain the registered close hooks. Called exactly once by the owning
    /// worker when the socket closes; the registries are then invoked with
    /// the hook set already empty, so the close path cannot re-enter.
    pub fn take_close_hooks(&self) -> Vec<RegistryTopic> {
        self.close_hooks.lock().drain().collect()
    }

    /// Queue raw bytes. `force_wake` bypasses the interest fast path so the
    /// worker flushes on the next poll even if write interest was already
    /// set.
    fn queue_bytes(&self, bytes: &[u8], force_wake: bool) {
        let result = self.write_buf.lock().write_bytes(bytes);
        match result {
            Ok(()) => {
                self.stats.add_msgs_sent(1);
                if force_wake {
                    self.update_write_interest(true);
                } else {
                    self.set_ready_for_writing(true);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.stats.add_msgs_dropped(1);
                log::debug!("dropping frame for slow client {}", self.id);
            }
            Err(e) => {
                self.stats.add_msgs_dropped(1);
                log::debug!("dropping frame for client {}: {}", self.id, e);
            }
        }
    }

    /// Flush the write buffer to the socket. Called by the owning worker
    /// only. Returns Ok(true) when fully drained, Ok(false) when the socket
    /// would block or was closed.
    pub fn flush(&self, socket: &mut impl io::Write) -> io::Result<bool> {
        loop {
            let mut buf = self.write_buf.lock();
            if buf.is_empty() {
                // Clear the flag while holding the lock; a concurrent
                // writer will set it again after we release.
                self.set_ready_for_writing(false);
                return Ok(true);
            }

            let slices = buf.as_io_slices();
            match socket.write_vectored(&slices) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    buf.consume(n);
                    self.stats.add_bytes_sent(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[inline]
    fn set_ready_for_writing(&self, val: bool) {
        // Cheap load first so unchanged state skips the epoll_ctl syscall.
        if self.ready_for_writing.load(Ordering::Relaxed) == val {
            return;
        }
        if self.ready_for_writing.swap(val, Ordering::Release) == val {
            return;
        }
        self.update_write_interest(val);
    }

    fn update_write_interest(&self, val: bool) {
        self.ready_for_writing.store(val, Ordering::Release);

        let events = if val {
            (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32
        } else {
            (libc::EPOLLIN | libc::EPOLLET) as u32
        };

        let mut ev = libc::epoll_event {
            events,
            u64: self.token.0 as u64,
        };

        // epoll_ctl is thread-safe.
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, self.socket_fd, &mut ev);
        }
    }
}

impl Connection for ClientWriteHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn user(&self) -> Arc<str> {
        self.username.lock().clone()
    }

    fn send_message(&self, message: &Message) {
        ENCODE_BUF.with(|buf| {
            let mut tmp = buf.borrow_mut();
            tmp.clear();
            message.encode(&mut tmp);
            self.queue_bytes(&tmp, false);
        });
    }

    fn send_ack(&self, request: &Message) {
        self.send_message(&Message::ack(request));
    }

    fn send_built_message(&self, frame: &Bytes, no_delay: bool) {
        self.queue_bytes(frame, no_delay);
    }

    fn on_close(&self, topic: RegistryTopic) {
        self.close_hooks.lock().insert(topic);
    }

    fn remove_on_close(&self, topic: RegistryTopic) {
        self.close_hooks.lock().remove(&topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtlite_core::message::{Action, Topic};

    // Dummy fds: epoll_ctl fails silently, which is fine for buffer tests.
    fn handle() -> ClientWriteHandle {
        ClientWriteHandle::new(
            ConnectionId(1),
            0,
            -1,
            -1,
            Token(7),
            Arc::new(ServerStats::new()),
        )
    }

    #[test]
    fn test_send_message_then_flush() {
        let h = handle();
        let msg = Message::new(Topic::Event, Action::Subscribe, "a");
        h.send_message(&msg);

        let mut out = Vec::new();
        assert!(h.flush(&mut out).unwrap());
        assert_eq!(out, msg.to_frame());
    }

    #[test]
    fn test_send_built_message_writes_raw_frame() {
        let h = handle();
        let msg = Message::new(Topic::Rpc, Action::Unsubscribe, "m");
        let frame = Bytes::from(msg.to_frame());
        h.send_built_message(&frame, false);
        h.send_built_message(&frame, true);

        let mut out = Vec::new();
        assert!(h.flush(&mut out).unwrap());
        assert_eq!(out.len(), frame.len() * 2);
    }

    #[test]
    fn test_send_ack_encodes_ack_frame() {
        let h = handle();
        let request = Message::new(Topic::Event, Action::Subscribe, "a");
        h.send_ack(&request);

        let mut out = Vec::new();
        assert!(h.flush(&mut out).unwrap());
        assert_eq!(out, Message::ack(&request).to_frame());
    }

    #[test]
    fn test_username_defaults_to_anonymous() {
        let h = handle();
        assert_eq!(&*h.user(), "anonymous");
        h.set_username("alice");
        assert_eq!(&*h.user(), "alice");
    }

    #[test]
    fn test_close_hook_registration() {
        let h = handle();
        h.on_close(RegistryTopic::Event);
        h.on_close(RegistryTopic::Record);
        h.remove_on_close(RegistryTopic::Record);

        let hooks = h.take_close_hooks();
        assert_eq!(hooks, vec![RegistryTopic::Event]);
        assert!(h.take_close_hooks().is_empty());
    }
}
