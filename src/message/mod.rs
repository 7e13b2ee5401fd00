//! # CoAP Message Model
//!
//! In-memory representation of CoAP requests and responses and the validity
//! rules for their options.
//!
//! ## Key Types
//!
//! - [`CoapMessage`] - header fields, ordered options, payload and peer address
//! - [`OptionKind`] - table-driven option definitions (number, multiplicity per role, value kind)
//! - [`Code`] / [`Method`] / [`ResponseCode`] - the code byte
//! - [`BlockOption`] - Block1/Block2 `(NUM, M, SZX)` triple
//! - [`CoapUri`] - URI rebuilt from the Uri-* options of a request

pub mod block;
pub mod code;
pub mod option;

pub use block::{BlockOption, MAX_SZX};
pub use code::{Code, Method, ResponseCode};
pub use option::{CoapOption, Multiplicity, OptionKind, Role, ValueKind, is_critical};

use std::fmt;
use std::net::SocketAddr;

pub const COAP_VERSION: u8 = 1;
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Message type bits of the fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> MessageType {
        match bits & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        }
    }
}

/// Media types used in Content-Type and Accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MediaType {
    TextPlain = 0,
    LinkFormat = 40,
    Xml = 41,
    OctetStream = 42,
    Exi = 47,
    Json = 50,
}

impl MediaType {
    pub fn from_u32(value: u32) -> Option<MediaType> {
        match value {
            0 => Some(MediaType::TextPlain),
            40 => Some(MediaType::LinkFormat),
            41 => Some(MediaType::Xml),
            42 => Some(MediaType::OctetStream),
            47 => Some(MediaType::Exi),
            50 => Some(MediaType::Json),
            _ => None,
        }
    }
}

/// URI rebuilt from Uri-Host, Uri-Port, Uri-Path and Uri-Query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    pub host: String,
    pub port: u16,
    /// Uri-Path segments joined by `/`, without a leading slash
    pub path: String,
    pub query: Option<String>,
}

impl fmt::Display for CoapUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coap://{}:{}/{}", self.host, self.port, self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub version: u8,
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    options: Vec<CoapOption>,
    pub payload: Vec<u8>,
    pub peer_address: Option<SocketAddr>,
    valid_options: bool,
}

impl CoapMessage {
    pub fn new(message_type: MessageType, code: Code, message_id: u16) -> Self {
        CoapMessage {
            version: COAP_VERSION,
            message_type,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
            peer_address: None,
            valid_options: true,
        }
    }

    pub fn request(message_type: MessageType, method: Method, message_id: u16) -> Self {
        CoapMessage::new(message_type, Code::Request(method), message_id)
    }

    pub fn response(message_type: MessageType, code: ResponseCode, message_id: u16) -> Self {
        CoapMessage::new(message_type, Code::Response(code), message_id)
    }

    /// Empty ACK for `msg`, echoing its message id
    pub fn empty_ack(msg: &CoapMessage) -> Self {
        let mut ack = CoapMessage::new(MessageType::Acknowledgement, Code::Empty, msg.message_id);
        ack.peer_address = msg.peer_address;
        ack
    }

    /// Empty RST for `msg`, echoing its message id
    pub fn reset(msg: &CoapMessage) -> Self {
        let mut rst = CoapMessage::new(MessageType::Reset, Code::Empty, msg.message_id);
        rst.peer_address = msg.peer_address;
        rst
    }

    /// Build a response to `request`. Piggy-backed in an ACK for CON requests,
    /// otherwise a NON carrying `message_id`.
    pub fn response_to(request: &CoapMessage, code: ResponseCode, message_id: u16) -> Self {
        let (message_type, mid) = match request.message_type {
            MessageType::Confirmable => (MessageType::Acknowledgement, request.message_id),
            _ => (MessageType::NonConfirmable, message_id),
        };
        let mut response = CoapMessage::response(message_type, code, mid);
        response.token = request.token.clone();
        response.peer_address = request.peer_address;
        response
    }

    pub fn role(&self) -> Role {
        if self.code.is_request() { Role::Request } else { Role::Response }
    }

    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    pub fn is_response(&self) -> bool {
        !self.code.is_request()
    }

    pub fn is_empty(&self) -> bool {
        self.code == Code::Empty
    }

    pub fn method(&self) -> Option<Method> {
        match self.code {
            Code::Request(m) => Some(m),
            _ => None,
        }
    }

    pub fn response_code(&self) -> Option<ResponseCode> {
        match self.code {
            Code::Response(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_confirmable(&self) -> bool {
        self.message_type == MessageType::Confirmable
    }

    pub fn set_token(&mut self, token: &[u8]) -> bool {
        if token.len() > MAX_TOKEN_LENGTH {
            return false;
        }
        self.token = token.to_vec();
        true
    }

    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// False once an unrecognised critical option arrived in a CON message
    pub fn valid_options(&self) -> bool {
        self.valid_options
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.valid_options = false;
    }

    /// Insert `option` keeping options sorted by number (stable for equal numbers).
    /// Returns false and leaves the message unchanged if the multiplicity rule of
    /// the option for this message's role forbids it or the value is malformed.
    pub fn add_option(&mut self, option: CoapOption) -> bool {
        let Some(kind) = option.kind() else {
            self.insert_sorted(option);
            return true;
        };
        if !kind.validate(&option.value) {
            return false;
        }
        match kind.multiplicity(self.role()) {
            Multiplicity::None => return false,
            Multiplicity::Once if self.has_option(kind) => return false,
            _ => {}
        }
        if kind == OptionKind::ProxyUri {
            self.options.retain(|o| {
                !matches!(
                    o.kind(),
                    Some(OptionKind::UriHost | OptionKind::UriPort | OptionKind::UriPath | OptionKind::UriQuery)
                )
            });
        }
        self.insert_sorted(option);
        true
    }

    fn insert_sorted(&mut self, option: CoapOption) {
        let idx = self.options.partition_point(|o| o.number <= option.number);
        self.options.insert(idx, option);
    }

    /// Remove at most one option equal to `option`
    pub fn remove_option(&mut self, option: &CoapOption) -> bool {
        match self.options.iter().position(|o| o == option) {
            Some(idx) => {
                self.options.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Remove every option of `kind`, returning how many were dropped
    pub fn remove_options(&mut self, kind: OptionKind) -> usize {
        let before = self.options.len();
        self.options.retain(|o| o.kind() != Some(kind));
        before - self.options.len()
    }

    pub fn has_option(&self, kind: OptionKind) -> bool {
        self.options.iter().any(|o| o.kind() == Some(kind))
    }

    pub fn option(&self, kind: OptionKind) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.kind() == Some(kind))
    }

    pub fn options_of(&self, kind: OptionKind) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.kind() == Some(kind))
    }

    pub fn option_count(&self, kind: OptionKind) -> usize {
        self.options_of(kind).count()
    }

    /// All options except Token, Max-Age and ETag
    pub fn options_for_matching(&self) -> Vec<CoapOption> {
        self.options
            .iter()
            .filter(|o| {
                !matches!(
                    o.kind(),
                    Some(OptionKind::Token | OptionKind::MaxAge | OptionKind::ETag)
                )
            })
            .cloned()
            .collect()
    }

    /// None until both Uri-Host and Uri-Port are present
    pub fn get_uri_from_request(&self) -> Option<CoapUri> {
        let host = self.option(OptionKind::UriHost)?.as_str()?.to_string();
        let port = self.option(OptionKind::UriPort)?.as_uint() as u16;
        let path = self
            .options_of(OptionKind::UriPath)
            .filter_map(|o| o.as_str())
            .collect::<Vec<_>>()
            .join("/");
        let queries: Vec<&str> = self
            .options_of(OptionKind::UriQuery)
            .filter_map(|o| o.as_str())
            .collect();
        let query = if queries.is_empty() { None } else { Some(queries.join("&")) };
        Some(CoapUri { host, port, path, query })
    }

    /// Uri-Path segments as an absolute path, `/` when there are none
    pub fn uri_path(&self) -> String {
        let segments: Vec<&str> = self
            .options_of(OptionKind::UriPath)
            .filter_map(|o| o.as_str())
            .collect();
        format!("/{}", segments.join("/"))
    }

    /// Add Uri-Path and Uri-Query options for `path` (`a/b?x=1&y=2`)
    pub fn set_uri_path(&mut self, path: &str) -> bool {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !self.add_option(CoapOption::string(OptionKind::UriPath, segment)) {
                return false;
            }
        }
        for q in query.into_iter().flat_map(|q| q.split('&')).filter(|s| !s.is_empty()) {
            if !self.add_option(CoapOption::string(OptionKind::UriQuery, q)) {
                return false;
            }
        }
        true
    }

    pub fn content_type(&self) -> Option<u32> {
        self.option(OptionKind::ContentType).map(|o| o.as_uint())
    }

    pub fn set_content_type(&mut self, media: MediaType) -> bool {
        self.remove_options(OptionKind::ContentType);
        self.add_option(CoapOption::uint(OptionKind::ContentType, media as u32))
    }

    pub fn observe(&self) -> Option<u32> {
        self.option(OptionKind::Observe).map(|o| o.as_uint())
    }

    pub fn block1(&self) -> Option<BlockOption> {
        self.option(OptionKind::Block1).map(|o| BlockOption::from_value(o.as_uint()))
    }

    pub fn block2(&self) -> Option<BlockOption> {
        self.option(OptionKind::Block2).map(|o| BlockOption::from_value(o.as_uint()))
    }

    /// Replace any Block1/Block2 option with `block`
    pub fn set_block(&mut self, kind: OptionKind, block: BlockOption) -> bool {
        if !matches!(kind, OptionKind::Block1 | OptionKind::Block2) {
            return false;
        }
        self.remove_options(kind);
        self.add_option(CoapOption::uint(kind, block.to_value()))
    }
}

impl fmt::Display for CoapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} mid={} token=",
            self.message_type.short_name(),
            self.code,
            self.message_id
        )?;
        for b in &self.token {
            write!(f, "{:02x}", b)?;
        }
        for option in &self.options {
            write!(f, " [{}]", option)?;
        }
        if !self.payload.is_empty() {
            write!(f, " payload={}B", self.payload.len())?;
        }
        Ok(())
    }
}
