use std::io::{Result, Write};

use crate::error::FormatError;

/// Types that can be written in CoAP wire format
pub trait WireEncode {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()>;

    /// Encode into a fresh buffer. Fails when the message cannot be framed,
    /// e.g. a token over 8 bytes or an option value too long for the length field.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// Types that can be parsed from a whole CoAP datagram
pub trait WireDecode: Sized {
    fn decode(buf: &[u8]) -> std::result::Result<Self, FormatError>;
}
