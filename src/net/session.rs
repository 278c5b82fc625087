//! Protocol state of one connection, independent of the socket.
//!
//! The server feeds it whatever the socket yields and writes out whatever it
//! appends to the output buffer.

use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::config::Config;
use crate::error::ProtocolError;
use crate::net::accumulator::FrameAccumulator;
use crate::net::framing::{decode_frame, encode_text_frame, Decoded, MaskPolicy, Opcode};
use crate::net::handshake::{negotiate, UpgradeRequest};
use crate::net::http::{error_response, head_len, Request, MAX_HEAD_LEN};
use crate::net::static_files;
use crate::observe::{CloseReason, Observer};

/// Sent once after a successful handshake.
pub const GREETING: &str = "Hello from the server!";

#[derive(Serialize)]
struct Greeting<'a> {
    message: &'a str,
}

/// What the server should do with the connection after a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush pending output, then close.
    Close(CloseReason),
}

#[derive(Debug)]
enum Phase {
    ReadingHead(Vec<u8>),
    Open(FrameAccumulator),
    Closed,
}

#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    config: Arc<Config>,
    phase: Phase,
}

/// Decode failures that only cost the current frame.
fn drops_frame_only(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::InvalidPayload(_) | ProtocolError::UnmaskedFrame
    )
}

fn frame_prefix(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(16)]
}

impl Session {
    pub fn new(peer: SocketAddr, config: Arc<Config>) -> Self {
        Self {
            peer,
            config,
            phase: Phase::ReadingHead(Vec::new()),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// True once the handshake has completed and until the session closes.
    pub fn is_websocket(&self) -> bool {
        matches!(self.phase, Phase::Open(_))
    }

    /// Feeds bytes read from the socket; anything to send is appended to `out`.
    pub fn on_bytes(&mut self, input: &[u8], out: &mut Vec<u8>, obs: &mut dyn Observer) -> Flow {
        let flow = match &mut self.phase {
            Phase::ReadingHead(head) => {
                head.extend_from_slice(input);
                match head_len(head) {
                    Some(len) if len <= MAX_HEAD_LEN => {
                        let rest = head.split_off(len);
                        let head = std::mem::take(head);
                        self.on_request(&head, &rest, out, obs)
                    }
                    None if head.len() <= MAX_HEAD_LEN => Flow::Continue,
                    _ => self.reject(
                        ProtocolError::RequestHeadTooLarge {
                            limit: MAX_HEAD_LEN,
                        },
                        out,
                        obs,
                    ),
                }
            }
            Phase::Open(_) => self.on_frames(input, out, obs),
            // Already closing; late bytes are discarded.
            Phase::Closed => Flow::Continue,
        };

        if let Flow::Close(reason) = &flow {
            self.phase = Phase::Closed;
            obs.connection_closed(self.peer, reason);
        }
        flow
    }

    /// The socket reached EOF or failed.
    pub fn on_eof(&mut self, obs: &mut dyn Observer) {
        if !matches!(self.phase, Phase::Closed) {
            self.phase = Phase::Closed;
            obs.connection_closed(self.peer, &CloseReason::Transport);
        }
    }

    fn reject(&mut self, err: ProtocolError, out: &mut Vec<u8>, obs: &mut dyn Observer) -> Flow {
        out.extend_from_slice(&error_response(&err));
        obs.handshake_rejected(self.peer, &err);
        Flow::Close(CloseReason::Protocol(err))
    }

    fn on_request(
        &mut self,
        head: &[u8],
        rest: &[u8],
        out: &mut Vec<u8>,
        obs: &mut dyn Observer,
    ) -> Flow {
        let req = match Request::parse(head) {
            Ok(req) => req,
            Err(e) => return self.reject(e, out, obs),
        };
        debug!("{}: {} {}", self.peer, req.method, req.path);

        if req.header("upgrade").is_none() {
            out.extend_from_slice(&static_files::serve(&self.config.static_root, &req));
            return Flow::Close(CloseReason::Served);
        }

        let upgrade = match UpgradeRequest::from_request(&req) {
            Ok(upgrade) => upgrade,
            Err(e) => return self.reject(e, out, obs),
        };
        let response = negotiate(&upgrade, &self.config.subprotocols);
        out.extend_from_slice(&response.to_bytes());
        obs.handshake_completed(self.peer, response.accepted_subprotocol);

        match encode_text_frame(&Greeting { message: GREETING }) {
            Ok(frame) => out.extend_from_slice(&frame),
            Err(e) => obs.frame_dropped(self.peer, &e, &[]),
        }

        self.phase = Phase::Open(FrameAccumulator::new());
        if rest.is_empty() {
            Flow::Continue
        } else {
            self.on_frames(rest, out, obs)
        }
    }

    fn on_frames(&mut self, input: &[u8], out: &mut Vec<u8>, obs: &mut dyn Observer) -> Flow {
        let Self {
            peer,
            config,
            phase,
        } = self;
        let Phase::Open(frames) = phase else {
            return Flow::Continue;
        };
        frames.push(input);

        loop {
            let frame = match frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Flow::Continue,
                Err(e) => {
                    obs.frame_dropped(*peer, &e, frame_prefix(frames.pending()));
                    return Flow::Close(CloseReason::Protocol(e));
                }
            };

            match handle_frame(*peer, config.mask_policy, &frame, out, obs) {
                Ok(()) => {}
                Err(ProtocolError::ConnectionClosedByPeer) => return Flow::Close(CloseReason::Peer),
                Err(e) if drops_frame_only(&e) => {
                    obs.frame_dropped(*peer, &e, frame_prefix(&frame));
                }
                Err(e) => {
                    obs.frame_dropped(*peer, &e, frame_prefix(&frame));
                    return Flow::Close(CloseReason::Protocol(e));
                }
            }
        }
    }
}

/// Decodes one frame and echoes any message back.
fn handle_frame(
    peer: SocketAddr,
    policy: MaskPolicy,
    frame: &[u8],
    out: &mut Vec<u8>,
    obs: &mut dyn Observer,
) -> Result<(), ProtocolError> {
    match decode_frame(frame, policy)? {
        Decoded::Message(message) => {
            obs.message_received(peer, &message);
            match encode_text_frame(&message) {
                Ok(reply) => out.extend_from_slice(&reply),
                Err(e) => obs.frame_dropped(peer, &e, &[]),
            }
            Ok(())
        }
        Decoded::Ignored => {
            debug!("{peer}: ignoring {:?} frame", Opcode::from_bits(frame[0]));
            Ok(())
        }
        Decoded::Closed => Err(ProtocolError::ConnectionClosedByPeer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::encode_client_frame;
    use crate::net::handshake::Subprotocol;
    use simd_json::OwnedValue;

    const UPGRADE: &str = "GET / HTTP/1.1\r\n\
        Host: localhost:3210\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Protocol: json, xml\r\n\
        \r\n";

    const KEY: [u8; 4] = [0xa1, 0xb2, 0xc3, 0xd4];

    #[derive(Debug, PartialEq)]
    enum Event {
        Open(Option<Subprotocol>),
        Rejected(ProtocolError),
        Message(OwnedValue),
        Dropped(ProtocolError),
        Closed(CloseReason),
    }

    #[derive(Default)]
    struct Recorder(Vec<Event>);

    impl Observer for Recorder {
        fn handshake_completed(&mut self, _: SocketAddr, subprotocol: Option<Subprotocol>) {
            self.0.push(Event::Open(subprotocol));
        }
        fn handshake_rejected(&mut self, _: SocketAddr, err: &ProtocolError) {
            self.0.push(Event::Rejected(err.clone()));
        }
        fn message_received(&mut self, _: SocketAddr, message: &OwnedValue) {
            self.0.push(Event::Message(message.clone()));
        }
        fn frame_dropped(&mut self, _: SocketAddr, err: &ProtocolError, _: &[u8]) {
            self.0.push(Event::Dropped(err.clone()));
        }
        fn connection_closed(&mut self, _: SocketAddr, reason: &CloseReason) {
            self.0.push(Event::Closed(reason.clone()));
        }
    }

    fn session(config: Config) -> Session {
        Session::new("127.0.0.1:50000".parse().unwrap(), Arc::new(config))
    }

    fn json(text: &str) -> OwnedValue {
        let mut bytes = text.as_bytes().to_vec();
        simd_json::to_owned_value(&mut bytes).unwrap()
    }

    /// Performs the handshake and returns the output after the 101 header block.
    fn open(s: &mut Session, obs: &mut Recorder) -> Vec<u8> {
        let mut out = Vec::new();
        assert_eq!(s.on_bytes(UPGRADE.as_bytes(), &mut out, obs), Flow::Continue);
        let end = head_len(&out).unwrap();
        out.split_off(end)
    }

    #[test]
    fn handshake_then_greeting() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        let mut out = Vec::new();

        // Head arrives in two pieces.
        let (a, b) = UPGRADE.as_bytes().split_at(20);
        assert_eq!(s.on_bytes(a, &mut out, &mut obs), Flow::Continue);
        assert!(out.is_empty());
        assert_eq!(s.on_bytes(b, &mut out, &mut obs), Flow::Continue);
        assert!(s.is_websocket());

        let end = head_len(&out).unwrap();
        let head = std::str::from_utf8(&out[..end]).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(head.contains("Sec-Websocket-Protocol: json\r\n"));

        let greeting = decode_frame(&out[end..], MaskPolicy::Optional).unwrap();
        assert_eq!(greeting, Decoded::Message(json(r#"{"message":"Hello from the server!"}"#)));
        assert_eq!(obs.0, [Event::Open(Some(Subprotocol::Json))]);
    }

    #[test]
    fn echoes_messages_in_order() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);

        let first = encode_client_frame(Opcode::Text, br#"{"message":"Hello from the client!"}"#, Some(KEY));
        let second = encode_client_frame(Opcode::Text, b"[1,2]", Some(KEY));
        let mut input = [first, second].concat();
        let tail = input.split_off(input.len() - 3);

        let mut out = Vec::new();
        assert_eq!(s.on_bytes(&input, &mut out, &mut obs), Flow::Continue);
        assert_eq!(s.on_bytes(&tail, &mut out, &mut obs), Flow::Continue);

        let mut frames = FrameAccumulator::new();
        frames.push(&out);
        let replies: Vec<Decoded> = std::iter::from_fn(|| frames.next_frame().unwrap())
            .map(|f| decode_frame(&f, MaskPolicy::Optional).unwrap())
            .collect();
        assert_eq!(
            replies,
            [
                Decoded::Message(json(r#"{"message":"Hello from the client!"}"#)),
                Decoded::Message(json("[1,2]")),
            ]
        );
        assert_eq!(obs.0.len(), 3);
    }

    #[test]
    fn frames_sent_with_the_head_are_processed() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        let mut input = UPGRADE.as_bytes().to_vec();
        input.extend(encode_client_frame(Opcode::Text, b"7", Some(KEY)));

        let mut out = Vec::new();
        assert_eq!(s.on_bytes(&input, &mut out, &mut obs), Flow::Continue);
        assert_eq!(obs.0.last(), Some(&Event::Message(json("7"))));
    }

    #[test]
    fn invalid_payload_keeps_connection() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);

        let mut out = Vec::new();
        let bad = encode_client_frame(Opcode::Text, b"{not json", Some(KEY));
        assert_eq!(s.on_bytes(&bad, &mut out, &mut obs), Flow::Continue);
        assert!(out.is_empty());
        assert!(matches!(obs.0.last(), Some(Event::Dropped(ProtocolError::InvalidPayload(_)))));

        let good = encode_client_frame(Opcode::Text, b"null", Some(KEY));
        assert_eq!(s.on_bytes(&good, &mut out, &mut obs), Flow::Continue);
        assert_eq!(out, [0x81, 0x04, b'n', b'u', b'l', b'l']);
    }

    #[test]
    fn binary_frames_produce_nothing() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);
        let events = obs.0.len();

        let mut out = Vec::new();
        let binary = encode_client_frame(Opcode::Binary, &[0, 159, 146, 150], Some(KEY));
        assert_eq!(s.on_bytes(&binary, &mut out, &mut obs), Flow::Continue);
        assert!(out.is_empty());
        assert_eq!(obs.0.len(), events);
    }

    #[test]
    fn close_frame_ends_session() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);

        let mut out = Vec::new();
        let mut input = encode_client_frame(Opcode::Close, &[0x03, 0xE8], Some(KEY));
        // Nothing after the close frame is read.
        input.extend(encode_client_frame(Opcode::Text, b"1", Some(KEY)));
        assert_eq!(s.on_bytes(&input, &mut out, &mut obs), Flow::Close(CloseReason::Peer));
        assert!(out.is_empty());
        assert!(!s.is_websocket());
        assert_eq!(obs.0.last(), Some(&Event::Closed(CloseReason::Peer)));

        // EOF afterwards is not reported twice.
        s.on_eof(&mut obs);
        assert_eq!(obs.0.iter().filter(|e| matches!(e, Event::Closed(_))).count(), 1);
    }

    #[test]
    fn oversized_length_closes_connection() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);

        let mut out = Vec::new();
        let flow = s.on_bytes(&[0x81, 0x80 | 127, 0, 0], &mut out, &mut obs);
        let err = ProtocolError::PayloadTooLarge { limit: crate::net::framing::MAX_PAYLOAD_LEN };
        assert_eq!(flow, Flow::Close(CloseReason::Protocol(err.clone())));
        assert!(obs.0.contains(&Event::Dropped(err)));
    }

    #[test]
    fn close_with_oversized_length_is_a_peer_close() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);

        let mut out = Vec::new();
        let flow = s.on_bytes(&[0x88, 0xFF], &mut out, &mut obs);
        assert_eq!(flow, Flow::Close(CloseReason::Peer));
        assert!(out.is_empty());
        assert!(!obs.0.iter().any(|e| matches!(e, Event::Dropped(_))));
    }

    #[test]
    fn unmasked_frames_respect_policy() {
        let unmasked = encode_client_frame(Opcode::Text, b"1", None);

        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);
        let mut out = Vec::new();
        s.on_bytes(&unmasked, &mut out, &mut obs);
        assert_eq!(obs.0.last(), Some(&Event::Message(json("1"))));

        let mut s = session(Config {
            mask_policy: MaskPolicy::Required,
            ..Config::default()
        });
        let mut obs = Recorder::default();
        open(&mut s, &mut obs);
        let mut out = Vec::new();
        assert_eq!(s.on_bytes(&unmasked, &mut out, &mut obs), Flow::Continue);
        assert!(out.is_empty());
        assert_eq!(obs.0.last(), Some(&Event::Dropped(ProtocolError::UnmaskedFrame)));
    }

    #[test]
    fn no_subprotocol_when_none_configured() {
        let mut s = session(Config {
            subprotocols: Vec::new(),
            ..Config::default()
        });
        let mut obs = Recorder::default();
        let mut out = Vec::new();
        s.on_bytes(UPGRADE.as_bytes(), &mut out, &mut obs);
        let text = String::from_utf8_lossy(&out).to_ascii_lowercase();
        assert!(!text.contains("sec-websocket-protocol"));
        assert_eq!(obs.0, [Event::Open(None)]);
    }

    #[test]
    fn non_websocket_upgrade_gets_400() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        let mut out = Vec::new();
        let head = UPGRADE.replace("Upgrade: websocket", "Upgrade: h2c");

        let flow = s.on_bytes(head.as_bytes(), &mut out, &mut obs);
        assert_eq!(flow, Flow::Close(CloseReason::Protocol(ProtocolError::NotAWebSocketUpgrade)));
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(obs.0[0], Event::Rejected(ProtocolError::NotAWebSocketUpgrade));
    }

    #[test]
    fn oversized_head_gets_431() {
        let mut s = session(Config::default());
        let mut obs = Recorder::default();
        let mut out = Vec::new();
        let mut head = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        head.resize(MAX_HEAD_LEN + 1, b'a');

        let flow = s.on_bytes(&head, &mut out, &mut obs);
        assert!(matches!(
            flow,
            Flow::Close(CloseReason::Protocol(ProtocolError::RequestHeadTooLarge { .. }))
        ));
        assert!(out.starts_with(b"HTTP/1.1 431 "));
    }

    #[test]
    fn plain_request_is_served_and_closed() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), "hi").unwrap();

        let mut s = session(Config {
            static_root: root.path().to_path_buf(),
            ..Config::default()
        });
        let mut obs = Recorder::default();
        let mut out = Vec::new();
        let flow = s.on_bytes(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &mut out, &mut obs);
        assert_eq!(flow, Flow::Close(CloseReason::Served));
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with(b"\r\n\r\nhi"));
    }
}
