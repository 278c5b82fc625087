//! Byte-order and masking helpers shared by the decoder, encoder and accumulator.

/// 4-byte masking key, in wire order (most-significant byte first).
pub type MaskKey = [u8; 4];

/// XORs `payload` in place with `key`, byte `i` against `key[i % 4]`.
///
/// Applying the same key twice restores the original bytes.
pub fn apply_mask(payload: &mut [u8], key: MaskKey) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Reads a big-endian u16 at `offset`, or `None` if the buffer is too short.
pub fn read_u16_be(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads a masking key at `offset`, or `None` if the buffer is too short.
pub fn read_mask_key(buf: &[u8], offset: usize) -> Option<MaskKey> {
    let bytes = buf.get(offset..offset + 4)?;
    Some([bytes[0], bytes[1], bytes[2], bytes[3]])
}
