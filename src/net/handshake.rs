//! HTTP Upgrade negotiation: request validation, accept key and subprotocol choice.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest;

use crate::error::ProtocolError;
use crate::net::http::Request;

/// GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const STATUS_LINE: &str = "HTTP/1.1 101 Web Socket Protocol Handshake";

/// Subprotocols this server knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subprotocol {
    Json,
}

impl Subprotocol {
    pub const ALL: &'static [Subprotocol] = &[Subprotocol::Json];

    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
        }
    }

    /// Exact, case-sensitive match against the wire token.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub upgrade: String,
    pub sec_websocket_key: String,
    /// Client preference order, empty tokens dropped.
    pub requested_subprotocols: Vec<String>,
}

impl UpgradeRequest {
    /// Pulls the upgrade headers out of a parsed request.
    pub fn from_request(req: &Request) -> Result<Self, ProtocolError> {
        let upgrade = req
            .header("upgrade")
            .filter(|v| v.eq_ignore_ascii_case("websocket"))
            .ok_or(ProtocolError::NotAWebSocketUpgrade)?;
        let key = req
            .header("sec-websocket-key")
            .filter(|v| !v.is_empty())
            .ok_or(ProtocolError::NotAWebSocketUpgrade)?;

        Ok(Self {
            upgrade: upgrade.to_string(),
            sec_websocket_key: key.to_string(),
            requested_subprotocols: req
                .header("sec-websocket-protocol")
                .map(parse_protocol_list)
                .unwrap_or_default(),
        })
    }
}

fn parse_protocol_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub status_line: &'static str,
    pub accept_value: String,
    pub accepted_subprotocol: Option<Subprotocol>,
}

impl HandshakeResponse {
    /// Header block to write before switching the socket to frames.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "{}\r\n\
             Upgrade: WebSocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            self.status_line, self.accept_value
        );
        if let Some(protocol) = self.accepted_subprotocol {
            out.push_str("Sec-Websocket-Protocol: ");
            out.push_str(protocol.name());
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// `base64(SHA-1(key ++ GUID))` over the raw bytes of the key.
pub fn accept_value(key: &str) -> String {
    let mut input = Vec::with_capacity(key.len() + WS_GUID.len());
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(WS_GUID.as_bytes());
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &input);
    BASE64.encode(hash.as_ref())
}

/// First requested subprotocol, in client order, that `supported` contains.
pub fn negotiate_subprotocol(requested: &[String], supported: &[Subprotocol]) -> Option<Subprotocol> {
    requested
        .iter()
        .filter_map(|name| Subprotocol::from_name(name))
        .find(|p| supported.contains(p))
}

/// Answers a validated upgrade request.
pub fn negotiate(req: &UpgradeRequest, supported: &[Subprotocol]) -> HandshakeResponse {
    HandshakeResponse {
        status_line: STATUS_LINE,
        accept_value: accept_value(&req.sec_websocket_key),
        accepted_subprotocol: negotiate_subprotocol(&req.requested_subprotocols, supported),
    }
}
