use crate::error::FormatError;
use crate::message::{COAP_VERSION, MAX_TOKEN_LENGTH, MessageType};

use super::primitives::{read_u8, read_u16};

/// The 4-byte fixed header: `Ver | T | TKL`, `Code`, `Message ID`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapHeader {
    pub version: u8,
    pub message_type: MessageType,
    pub token_length: u8,
    pub code: u8,
    pub message_id: u16,
}

impl CoapHeader {
    pub const HEADER_LENGTH: usize = 4;

    pub fn new(message_type: MessageType, token_length: u8, code: u8, message_id: u16) -> Self {
        CoapHeader {
            version: COAP_VERSION,
            message_type,
            token_length,
            code,
            message_id,
        }
    }

    pub fn serialize(&self) -> [u8; 4] {
        let mut buffer = [0u8; 4];

        // Version (2 bits), Type (2 bits), Token Length (4 bits)
        buffer[0] = (self.version & 0b11) << 6
            | (self.message_type as u8) << 4
            | (self.token_length & 0x0F);

        buffer[1] = self.code;
        buffer[2..4].copy_from_slice(&self.message_id.to_be_bytes());

        buffer
    }

    /// Rejects version != 1 and token length > 8
    pub fn deserialize(buffer: &[u8]) -> Result<Self, FormatError> {
        let first = read_u8(buffer, 0).ok_or(FormatError::UnexpectedEnd)?;
        let code = read_u8(buffer, 1).ok_or(FormatError::UnexpectedEnd)?;
        let message_id = read_u16(buffer, 2).ok_or(FormatError::UnexpectedEnd)?;

        let version = first >> 6;
        if version != COAP_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let token_length = first & 0x0F;
        if token_length as usize > MAX_TOKEN_LENGTH {
            return Err(FormatError::InvalidTokenLength(token_length));
        }

        Ok(CoapHeader {
            version,
            message_type: MessageType::from_bits(first >> 4),
            token_length,
            code,
            message_id,
        })
    }
}
