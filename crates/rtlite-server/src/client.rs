//! Per-client state and read-path framing.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::TcpStream;
use mio::Token;
use rtlite_core::error::{Error, ProtocolError, Result};
use rtlite_core::message::{Message, FRAME_SEPARATOR};

use crate::client_handle::ClientWriteHandle;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No handshake seen yet; treated as anonymous until one arrives.
    Connecting,
    /// Handshake processed.
    Connected,
    /// Being torn down.
    Disconnecting,
}

/// Per-client socket state owned by one worker.
pub struct Client {
    pub token: Token,
    pub stream: TcpStream,
    pub remote_addr: SocketAddr,
    pub state: ClientState,
    /// Shared write handle; registries hold clones of this.
    pub handle: Arc<ClientWriteHandle>,
    /// Bytes received but not yet terminated by a frame separator.
    read_buf: Vec<u8>,
}

impl Client {
    pub fn new(
        token: Token,
        stream: TcpStream,
        remote_addr: SocketAddr,
        handle: Arc<ClientWriteHandle>,
    ) -> Self {
        Self {
            token,
            stream,
            remote_addr,
            state: ClientState::Connecting,
            handle,
            read_buf: Vec::new(),
        }
    }

    /// Read everything the socket has, split it into frames, and parse
    /// them into `out`.
    ///
    /// Returns the number of bytes read and whether the peer closed the
    /// connection. A malformed frame or an over-long partial frame is a
    /// protocol error; the caller tears the connection down.
    pub fn read_frames(
        &mut self,
        max_frame: usize,
        out: &mut Vec<Message>,
    ) -> Result<(usize, bool)> {
        let mut chunk = [0u8; 8192];
        let mut total = 0usize;
        let mut closed = false;

        // Edge-triggered readiness: drain the socket completely.
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let mut start = 0;
        while let Some(pos) = self.read_buf[start..]
            .iter()
            .position(|&b| b == FRAME_SEPARATOR)
        {
            let frame = &self.read_buf[start..start + pos];
            if frame.len() > max_frame {
                return Err(Error::Protocol(ProtocolError::FrameTooLarge {
                    size: frame.len(),
                    max: max_frame,
                }));
            }
            if !frame.is_empty() {
                out.push(Message::parse(frame)?);
            }
            start += pos + 1;
        }
        self.read_buf.drain(..start);

        // Bound the unterminated remainder too, or a client could grow the
        // buffer forever without ever sending a separator.
        if self.read_buf.len() > max_frame {
            return Err(Error::Protocol(ProtocolError::FrameTooLarge {
                size: self.read_buf.len(),
                max: max_frame,
            }));
        }

        Ok((total, closed))
    }
}
