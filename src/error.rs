//! Error types for the CoAP gateway

use thiserror::Error;

/// Malformed datagram. Raised by the wire codec; the receive loop logs and drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Buffer ended before the header, token or an option was complete
    #[error("unexpected end of datagram")]
    UnexpectedEnd,

    /// Version bits were not 1
    #[error("unsupported CoAP version {0}")]
    UnsupportedVersion(u8),

    /// Token length nibble above 8
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),

    /// Option length nibble was 15
    #[error("reserved option length nibble")]
    ReservedLengthNibble,

    /// Payload marker present but no payload bytes followed
    #[error("payload marker without payload")]
    EmptyPayload,

    /// Code byte is neither empty, a method nor a known response code
    #[error("unknown message code {0}")]
    UnknownCode(u8),

    /// Accumulated option number no longer fits 16 bits
    #[error("option number {0} out of range")]
    OptionNumberOverflow(u32),
}

/// Caller-facing error. Every variant maps onto a CoAP-response-code-like integer.
#[derive(Debug, Error)]
pub enum CoapError {
    /// Host name could not be resolved to a socket address (5.02)
    #[error("cannot resolve {0}")]
    AddressResolution(String),

    /// Path or URI could not be turned into options (4.00)
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// Operation expects a request (5.00)
    #[error("message is not a request")]
    NotARequest,

    /// Operation expects a response (5.00)
    #[error("message is not a response")]
    NotAResponse,

    /// Message has no peer address to send to (5.00)
    #[error("message has no peer address")]
    MissingPeer,

    /// No resource or handler can serve the request (4.05)
    #[error("no matching action for {0}")]
    NoMatchingAction(String),

    /// Socket level failure (5.00)
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Datagram could not be parsed (4.00)
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Configuration invalid (5.00)
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration JSON could not be parsed (5.00)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The service was stopped (5.03)
    #[error("service stopped")]
    Stopped,

    /// No response arrived in time, or retransmissions were exhausted (5.04)
    #[error("request timed out")]
    Timeout,

    /// Peer answered with a reset (5.00)
    #[error("request reset by peer")]
    Reset,

    /// An equivalent request to the same peer is still outstanding (5.03)
    #[error("service busy")]
    Busy,
}

impl CoapError {
    /// Response-code-like value: class in the top three bits, detail in the low five.
    pub fn code(&self) -> u8 {
        match self {
            CoapError::AddressResolution(_) => 162,
            CoapError::InvalidUri(_) | CoapError::Format(_) => 128,
            CoapError::NoMatchingAction(_) => 133,
            CoapError::Stopped | CoapError::Busy => 163,
            CoapError::Timeout => 164,
            _ => 160,
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, CoapError>;
