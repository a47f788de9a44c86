//! Encode-once frame factory for fanout.
//!
//! A broadcast renders its wire bytes at most once; every subscriber shares
//! the same `Bytes` buffer. Encoding is a pure function of the message, so
//! the cached representation is valid for all connections.

use bytes::Bytes;
use rtlite_core::message::Message;

/// Lazily encoded frame for a single message.
pub struct MessageEncoder<'a> {
    message: &'a Message,
    cache: Option<Bytes>,
}

impl<'a> MessageEncoder<'a> {
    #[inline]
    pub fn new(message: &'a Message) -> Self {
        Self {
            message,
            cache: None,
        }
    }

    /// The encoded frame, built on first use.
    #[inline]
    pub fn frame(&mut self) -> Bytes {
        if let Some(ref frame) = self.cache {
            return frame.clone();
        }
        let frame = Bytes::from(self.message.to_frame());
        self.cache = Some(frame.clone());
        frame
    }
}
