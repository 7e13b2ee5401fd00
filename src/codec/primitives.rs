//! Big-endian primitives shared by the header and option codecs.

/// Minimal-length big-endian encoding of an option uint. Zero encodes as no bytes.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Inverse of [`encode_uint`]. Only the last four bytes count if more are present.
pub fn decode_uint(bytes: &[u8]) -> u32 {
    let tail = &bytes[bytes.len().saturating_sub(4)..];
    tail.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

pub fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn read_u8(buf: &[u8], at: usize) -> Option<u8> {
    buf.get(at).copied()
}
