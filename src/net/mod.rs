//! WebSocket protocol layer and the plumbing that carries it.
//!
//! `handshake` and `framing` hold the protocol; `accumulator` turns a byte
//! stream into frames; `session` ties them to one connection; `server`,
//! `tcp_opt`, `http` and `static_files` are transport.

pub mod accumulator;
pub mod framing;
pub mod handshake;
pub mod http;
pub mod mask;
pub mod server;
pub mod session;
pub mod static_files;
pub mod tcp_opt;
