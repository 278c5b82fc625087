//! Per-connection reassembly of frames from arbitrarily sized reads.
//!
//! Bytes are appended as the socket yields them; a frame is only split off once
//! `2 + extension + mask + payload_length` bytes are buffered.

use crate::error::ProtocolError;
use crate::net::framing::{base_length, BaseLength, Opcode};
use crate::net::mask::read_u16_be;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for the two fixed header bytes.
    AwaitingHeader,
    /// Waiting for the 2-byte extended length.
    AwaitingExtension { masked: bool },
    /// Header and length known, waiting for the 4-byte key.
    AwaitingMask { header_len: usize, payload_len: usize },
    /// Waiting until `frame_len` bytes are buffered.
    AwaitingPayload { frame_len: usize },
}

#[derive(Debug)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    state: ReadState,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            state: ReadState::AwaitingHeader,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// An error leaves the stream unsynchronised; the connection has to go.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            match self.state {
                ReadState::AwaitingHeader => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    let masked = self.buf[1] & 0x80 != 0;
                    let base = match base_length(self.buf[1]) {
                        Ok(base) => base,
                        // A close ends the stream whatever its length says.
                        Err(_) if Opcode::from_bits(self.buf[0]) == Opcode::Close => {
                            let rest = self.buf.split_off(2);
                            return Ok(Some(std::mem::replace(&mut self.buf, rest)));
                        }
                        Err(e) => return Err(e),
                    };
                    self.state = match base {
                        BaseLength::Direct(payload_len) => ReadState::AwaitingMask {
                            header_len: 2,
                            payload_len,
                        },
                        BaseLength::Extended16 => ReadState::AwaitingExtension { masked },
                    };
                    if !masked {
                        self.skip_mask();
                    }
                }
                ReadState::AwaitingExtension { masked } => {
                    let Some(payload_len) = read_u16_be(&self.buf, 2) else {
                        return Ok(None);
                    };
                    self.state = ReadState::AwaitingMask {
                        header_len: 4,
                        payload_len: payload_len as usize,
                    };
                    if !masked {
                        self.skip_mask();
                    }
                }
                ReadState::AwaitingMask {
                    header_len,
                    payload_len,
                } => {
                    if self.buf.len() < header_len + 4 {
                        return Ok(None);
                    }
                    self.state = ReadState::AwaitingPayload {
                        frame_len: header_len + 4 + payload_len,
                    };
                }
                ReadState::AwaitingPayload { frame_len } => {
                    if self.buf.len() < frame_len {
                        return Ok(None);
                    }
                    let rest = self.buf.split_off(frame_len);
                    let frame = std::mem::replace(&mut self.buf, rest);
                    self.state = ReadState::AwaitingHeader;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Unmasked frames go straight from the length to the payload.
    fn skip_mask(&mut self) {
        if let ReadState::AwaitingMask {
            header_len,
            payload_len,
        } = self.state
        {
            self.state = ReadState::AwaitingPayload {
                frame_len: header_len + payload_len,
            };
        }
    }
}
