use arrayvec::ArrayVec;
use log::debug;
use serde::Serialize;
use simd_json::OwnedValue;

use crate::error::ProtocolError;
use crate::net::mask::{apply_mask, read_mask_key, read_u16_be, MaskKey};

/// Largest payload the 16-bit extended length can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Base length value announcing a 2-byte extended length.
pub const LEN_EXT16: u8 = 126;
/// Base length value announcing an 8-byte extended length (unsupported).
pub const LEN_EXT64: u8 = 127;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any of the reserved values 0x3-0x7 and 0xB-0xF.
    Reserved(u8),
}

impl Opcode {
    /// Reads the opcode from the low nibble of the first header byte.
    pub fn from_bits(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(bits) => bits & 0x0F,
        }
    }
}

/// Whether inbound frames must carry a masking key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskPolicy {
    /// Accept masked and unmasked frames alike.
    #[default]
    Optional,
    /// Reject unmasked frames with [`ProtocolError::UnmaskedFrame`].
    Required,
}

/// One decoded wire frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub masking_key: Option<MaskKey>,
    pub payload_length: usize,
    pub payload: Vec<u8>,
}

/// Result of decoding a single frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A text frame carrying a JSON value.
    Message(OwnedValue),
    /// Binary, ping, pong, continuation or reserved frame. Nothing to deliver.
    Ignored,
    /// The peer sent a close frame.
    Closed,
}

/// Payload length as announced by the 7-bit base length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BaseLength {
    Direct(usize),
    Extended16,
}

/// Interprets the second header byte's length bits.
///
/// The 64-bit form is refused here so no caller ever reads its 8 extension bytes.
pub(crate) fn base_length(second_byte: u8) -> Result<BaseLength, ProtocolError> {
    match second_byte & 0x7F {
        LEN_EXT16 => Ok(BaseLength::Extended16),
        LEN_EXT64 => Err(ProtocolError::PayloadTooLarge {
            limit: MAX_PAYLOAD_LEN,
        }),
        len => Ok(BaseLength::Direct(len as usize)),
    }
}

impl Frame {
    /// Parses a frame from a buffer holding at least one complete frame.
    /// Bytes past the end of the frame are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < 2 {
            return Err(ProtocolError::IncompleteFrame {
                needed: 2,
                available: buf.len(),
            });
        }

        let first_byte = buf[0];
        let second_byte = buf[1];

        let fin = first_byte & FIN_BIT != 0;
        let opcode = Opcode::from_bits(first_byte);
        let masked = second_byte & MASK_BIT != 0;

        let mut header_len = 2;
        let payload_length = match base_length(second_byte)? {
            BaseLength::Direct(len) => len,
            BaseLength::Extended16 => {
                let len = read_u16_be(buf, 2).ok_or(ProtocolError::IncompleteFrame {
                    needed: 4,
                    available: buf.len(),
                })?;
                header_len += 2;
                len as usize
            }
        };

        let masking_key = if masked {
            let key = read_mask_key(buf, header_len).ok_or(ProtocolError::IncompleteFrame {
                needed: header_len + 4,
                available: buf.len(),
            })?;
            header_len += 4;
            Some(key)
        } else {
            None
        };

        let total_len = header_len + payload_length;
        if buf.len() < total_len {
            return Err(ProtocolError::IncompleteFrame {
                needed: total_len,
                available: buf.len(),
            });
        }

        let mut payload = buf[header_len..total_len].to_vec();
        if let Some(key) = masking_key {
            apply_mask(&mut payload, key);
        }

        Ok(Self {
            fin,
            opcode,
            masked,
            masking_key,
            payload_length,
            payload,
        })
    }
}

/// Decodes one complete frame into an application message.
///
/// Close frames yield [`Decoded::Closed`] and non-text frames yield
/// [`Decoded::Ignored`] as soon as the opcode is known, whatever follows.
/// Text payloads must be UTF-8 JSON.
pub fn decode_frame(buf: &[u8], policy: MaskPolicy) -> Result<Decoded, ProtocolError> {
    let first_byte = *buf.first().ok_or(ProtocolError::IncompleteFrame {
        needed: 2,
        available: 0,
    })?;

    match Opcode::from_bits(first_byte) {
        Opcode::Close => return Ok(Decoded::Closed),
        Opcode::Text => {}
        _ => return Ok(Decoded::Ignored),
    }

    let frame = Frame::parse(buf)?;
    if policy == MaskPolicy::Required && !frame.masked {
        return Err(ProtocolError::UnmaskedFrame);
    }
    if !frame.fin {
        // No reassembly: the fragment is decoded on its own.
        debug!("text frame without FIN ({} bytes)", frame.payload_length);
    }

    parse_json(frame.payload).map(Decoded::Message)
}

fn parse_json(mut payload: Vec<u8>) -> Result<OwnedValue, ProtocolError> {
    if let Err(e) = std::str::from_utf8(&payload) {
        return Err(ProtocolError::InvalidPayload(format!("not UTF-8: {e}")));
    }
    simd_json::to_owned_value(&mut payload)
        .map_err(|e| ProtocolError::InvalidPayload(format!("not JSON: {e}")))
}

/// Builds the header of an unmasked, final frame.
pub fn frame_header(opcode: Opcode, payload_len: usize) -> Result<ArrayVec<u8, 4>, ProtocolError> {
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            limit: MAX_PAYLOAD_LEN,
        });
    }

    let mut header = ArrayVec::new();
    header.push(FIN_BIT | opcode.bits());
    if payload_len < LEN_EXT16 as usize {
        header.push(payload_len as u8);
    } else {
        header.push(LEN_EXT16);
        header.extend((payload_len as u16).to_be_bytes());
    }
    Ok(header)
}

/// Appends an unmasked text frame carrying `payload` to `dst`.
/// Returns the number of bytes written; nothing is written on error.
pub fn write_text_frame(payload: &[u8], dst: &mut Vec<u8>) -> Result<usize, ProtocolError> {
    let header = frame_header(Opcode::Text, payload.len())?;
    dst.reserve(header.len() + payload.len());
    dst.extend_from_slice(&header);
    dst.extend_from_slice(payload);
    Ok(header.len() + payload.len())
}

/// Serializes `value` to JSON and wraps it in a single server-to-client text frame.
pub fn encode_text_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        simd_json::to_vec(value).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    let mut out = Vec::with_capacity(payload.len() + 4);
    write_text_frame(&payload, &mut out)?;
    Ok(out)
}

/// Builds a client-to-server frame, masked when `key` is given.
#[cfg(test)]
pub(crate) fn encode_client_frame(opcode: Opcode, payload: &[u8], key: Option<MaskKey>) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(FIN_BIT | opcode.bits());
    let mask_bit = if key.is_some() { MASK_BIT } else { 0 };
    if payload.len() < LEN_EXT16 as usize {
        out.push(mask_bit | payload.len() as u8);
    } else {
        out.push(mask_bit | LEN_EXT16);
        out.extend((payload.len() as u16).to_be_bytes());
    }
    let mut body = payload.to_vec();
    if let Some(key) = key {
        out.extend(key);
        apply_mask(&mut body, key);
    }
    out.extend(body);
    out
}
