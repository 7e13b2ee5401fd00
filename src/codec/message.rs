use std::io::{Error, ErrorKind, Result, Write};

use log::debug;

use crate::error::FormatError;
use crate::message::{COAP_VERSION, CoapMessage, CoapOption, Code, MAX_TOKEN_LENGTH, MessageType, OptionKind};

use super::header::CoapHeader;
use super::options::{OptionItem, OptionReader, PAYLOAD_MARKER, write_options};
use super::traits::{WireDecode, WireEncode};

impl WireEncode for CoapMessage {
    fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        if self.token.len() > MAX_TOKEN_LENGTH {
            return Err(Error::new(ErrorKind::InvalidInput, "token longer than 8 bytes"));
        }

        let mut header = CoapHeader::new(
            self.message_type,
            self.token.len() as u8,
            self.code.as_u8(),
            self.message_id,
        );
        header.version = self.version;

        writer.write_all(&header.serialize())?;
        writer.write_all(&self.token)?;
        write_options(writer, self.options())?;

        if !self.payload.is_empty() {
            writer.write_all(&[PAYLOAD_MARKER])?;
            writer.write_all(&self.payload)?;
        }
        Ok(())
    }
}

impl WireDecode for CoapMessage {
    fn decode(buf: &[u8]) -> std::result::Result<Self, FormatError> {
        let header = CoapHeader::deserialize(buf)?;
        let code = Code::from_u8(header.code).ok_or(FormatError::UnknownCode(header.code))?;

        let mut msg = CoapMessage::new(header.message_type, code, header.message_id);
        msg.version = COAP_VERSION;

        let token_end = CoapHeader::HEADER_LENGTH + header.token_length as usize;
        let token = buf
            .get(CoapHeader::HEADER_LENGTH..token_end)
            .ok_or(FormatError::UnexpectedEnd)?;
        msg.token = token.to_vec();

        let mut reader = OptionReader::new(buf, token_end);
        while let Some(item) = reader.next_item()? {
            match item {
                OptionItem::Option(option) => accept_option(&mut msg, option),
                OptionItem::PayloadMarker(start) => {
                    msg.payload = buf[start..].to_vec();
                    break;
                }
            }
        }

        Ok(msg)
    }
}

/// Feed a parsed option into the message. Rejected or unrecognised critical
/// options in a CON message flag it invalid; parsing continues either way.
fn accept_option(msg: &mut CoapMessage, option: CoapOption) {
    let poisons = option.is_critical() && msg.message_type == MessageType::Confirmable;
    match option.kind() {
        Some(OptionKind::Fencepost) => {}
        Some(kind) => {
            let number = option.number;
            if !msg.add_option(option) {
                debug!(target: "Codec", "Rejected option {} ({}) in mid={}", kind.name(), number, msg.message_id);
                if poisons {
                    msg.mark_invalid();
                }
            }
        }
        None => {
            debug!(target: "Codec", "Unrecognised option {} in mid={}", option.number, msg.message_id);
            if poisons {
                msg.mark_invalid();
            }
            msg.add_option(option);
        }
    }
}
