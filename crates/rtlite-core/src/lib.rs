//! rtlite-core - Core protocol types for the rtlite realtime server.
//!
//! This crate provides the fundamental types for rtlite frame
//! encoding/decoding, shared between the server and client crates.

pub mod error;
pub mod message;

pub use error::{Error, ProtocolError, Result};
pub use message::*;
