//! Option framing: one byte `delta << 4 | length`, each nibble extended by
//! one byte (nibble 13, base 13) or two big-endian bytes (nibble 14, base 269).
//! A delta nibble of 15 is the payload marker.

use std::io::{Error, ErrorKind, Result, Write};

use crate::error::FormatError;
use crate::message::CoapOption;

use super::primitives::{read_u8, read_u16};

pub const PAYLOAD_MARKER: u8 = 0xFF;

const ONE_BYTE_NIBBLE: u8 = 13;
const TWO_BYTE_NIBBLE: u8 = 14;
const MARKER_NIBBLE: u8 = 15;

const ONE_BYTE_BASE: u32 = 13;
const TWO_BYTE_BASE: u32 = 269;
const MAX_EXTENDED: u32 = TWO_BYTE_BASE + u16::MAX as u32;

/// Nibble plus extension bytes for `value`
fn split_extended(value: u32) -> Result<(u8, Vec<u8>)> {
    if value < ONE_BYTE_BASE {
        Ok((value as u8, Vec::new()))
    } else if value < TWO_BYTE_BASE {
        Ok((ONE_BYTE_NIBBLE, vec![(value - ONE_BYTE_BASE) as u8]))
    } else if value <= MAX_EXTENDED {
        let ext = (value - TWO_BYTE_BASE) as u16;
        Ok((TWO_BYTE_NIBBLE, ext.to_be_bytes().to_vec()))
    } else {
        Err(Error::new(ErrorKind::InvalidInput, "option delta or length too large"))
    }
}

/// Read the real value of a delta or length nibble, advancing `pos` past extension bytes
fn read_extended(buf: &[u8], pos: &mut usize, nibble: u8) -> std::result::Result<u32, FormatError> {
    match nibble {
        ONE_BYTE_NIBBLE => {
            let ext = read_u8(buf, *pos).ok_or(FormatError::UnexpectedEnd)?;
            *pos += 1;
            Ok(ONE_BYTE_BASE + u32::from(ext))
        }
        TWO_BYTE_NIBBLE => {
            let ext = read_u16(buf, *pos).ok_or(FormatError::UnexpectedEnd)?;
            *pos += 2;
            Ok(TWO_BYTE_BASE + u32::from(ext))
        }
        MARKER_NIBBLE => Err(FormatError::ReservedLengthNibble),
        n => Ok(u32::from(n)),
    }
}

/// Write `options` sorted by number, re-deriving every delta
pub fn write_options<W: Write>(writer: &mut W, options: &[CoapOption]) -> Result<()> {
    let mut sorted: Vec<&CoapOption> = options.iter().collect();
    sorted.sort_by_key(|o| o.number);

    let mut last_number = 0u16;
    for option in sorted {
        let delta = u32::from(option.number - last_number);
        let (delta_nibble, delta_ext) = split_extended(delta)?;
        let (len_nibble, len_ext) = split_extended(option.value.len() as u32)?;

        writer.write_all(&[(delta_nibble << 4) | len_nibble])?;
        writer.write_all(&delta_ext)?;
        writer.write_all(&len_ext)?;
        writer.write_all(&option.value)?;

        last_number = option.number;
    }
    Ok(())
}

/// Outcome of reading from an option position
#[derive(Debug, PartialEq, Eq)]
pub enum OptionItem {
    Option(CoapOption),
    /// Payload marker seen; holds the payload start offset
    PayloadMarker(usize),
}

/// Cursor over the option section of a datagram
pub struct OptionReader<'a> {
    buf: &'a [u8],
    pos: usize,
    number: u32,
}

impl<'a> OptionReader<'a> {
    pub fn new(buf: &'a [u8], start: usize) -> Self {
        OptionReader { buf, pos: start, number: 0 }
    }

    /// Next option or marker; `Ok(None)` once the buffer is consumed
    pub fn next_item(&mut self) -> std::result::Result<Option<OptionItem>, FormatError> {
        let Some(byte) = read_u8(self.buf, self.pos) else {
            return Ok(None);
        };
        self.pos += 1;

        let delta_nibble = byte >> 4;
        let len_nibble = byte & 0x0F;
        if delta_nibble == MARKER_NIBBLE {
            if self.pos >= self.buf.len() {
                return Err(FormatError::EmptyPayload);
            }
            return Ok(Some(OptionItem::PayloadMarker(self.pos)));
        }

        let delta = read_extended(self.buf, &mut self.pos, delta_nibble)?;
        let length = read_extended(self.buf, &mut self.pos, len_nibble)? as usize;

        self.number += delta;
        if self.number > u32::from(u16::MAX) {
            return Err(FormatError::OptionNumberOverflow(self.number));
        }

        let value = self
            .buf
            .get(self.pos..self.pos + length)
            .ok_or(FormatError::UnexpectedEnd)?;
        self.pos += length;

        Ok(Some(OptionItem::Option(CoapOption::new(self.number as u16, value.to_vec()))))
    }
}
