//! Minimal WebSocket server for JSON messages.
//!
//! The protocol core lives in [`net::handshake`] (upgrade negotiation) and
//! [`net::framing`] (frame codec); the rest of the crate moves bytes between
//! sockets and that core.

pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod observe;

pub use config::Config;
pub use error::{ConfigError, ProtocolError, ServerError};
