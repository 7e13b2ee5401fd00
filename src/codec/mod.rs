//! # CoAP Wire Codec
//!
//! Converts between UDP datagram bytes and [`CoapMessage`](crate::message::CoapMessage).
//!
//! ## Key Types
//!
//! - [`CoapHeader`] - 4-byte fixed header (version, type, token length, code, message id)
//! - [`WireEncode`] / [`WireDecode`] - whole-message encoding and parsing
//! - [`OptionReader`] - delta/length option framing with 13/14 extensions and the payload marker
//! - [`MessageIdManager`] - thread-safe message id and token generation
//!
//! ## Example
//!
//! ```ignore
//! use coap_gateway::codec::{WireDecode, WireEncode};
//!
//! let bytes = request.to_bytes()?;
//! let parsed = CoapMessage::decode(&bytes)?;
//! ```

pub mod header;
pub mod message;
pub mod options;
pub mod primitives;
pub mod session;
pub mod traits;

pub use header::CoapHeader;
pub use options::{OptionItem, OptionReader, PAYLOAD_MARKER};
pub use session::MessageIdManager;
pub use traits::{WireDecode, WireEncode};
