//! Diagnostic hook the session reports into.

use std::net::SocketAddr;

use log::{debug, info, warn};
use simd_json::OwnedValue;

use crate::error::ProtocolError;
use crate::net::handshake::Subprotocol;

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame received.
    Peer,
    /// Plain HTTP response sent.
    Served,
    /// Rejected or dropped on a protocol error.
    Protocol(ProtocolError),
    /// Socket hit EOF or an I/O error.
    Transport,
}

/// Every method defaults to doing nothing.
pub trait Observer {
    fn handshake_completed(&mut self, _peer: SocketAddr, _subprotocol: Option<Subprotocol>) {}

    fn handshake_rejected(&mut self, _peer: SocketAddr, _err: &ProtocolError) {}

    fn message_received(&mut self, _peer: SocketAddr, _message: &OwnedValue) {}

    /// A frame failed to decode or its reply failed to encode; the connection stays up.
    /// `header` holds up to the first 16 bytes of the offending frame, if any.
    fn frame_dropped(&mut self, _peer: SocketAddr, _err: &ProtocolError, _header: &[u8]) {}

    fn connection_closed(&mut self, _peer: SocketAddr, _reason: &CloseReason) {}
}

/// Writes every event to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn handshake_completed(&mut self, peer: SocketAddr, subprotocol: Option<Subprotocol>) {
        info!(
            "{peer}: websocket open (subprotocol: {})",
            subprotocol.map_or("none", Subprotocol::name)
        );
    }

    fn handshake_rejected(&mut self, peer: SocketAddr, err: &ProtocolError) {
        warn!("{peer}: handshake rejected: {err}");
    }

    fn message_received(&mut self, peer: SocketAddr, message: &OwnedValue) {
        match simd_json::to_string(message) {
            Ok(text) => info!("{peer}: received {text}"),
            Err(_) => info!("{peer}: received {message:?}"),
        }
    }

    fn frame_dropped(&mut self, peer: SocketAddr, err: &ProtocolError, header: &[u8]) {
        warn!("{peer}: dropped frame [{}]: {err}", hex::encode(header));
    }

    fn connection_closed(&mut self, peer: SocketAddr, reason: &CloseReason) {
        match reason {
            CloseReason::Peer => info!("{peer}: closed by peer"),
            CloseReason::Served => debug!("{peer}: response served"),
            CloseReason::Protocol(err) => warn!("{peer}: closed on protocol error: {err}"),
            CloseReason::Transport => debug!("{peer}: connection dropped"),
        }
    }
}
