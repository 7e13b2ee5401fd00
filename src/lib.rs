pub mod codec;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod message;
pub mod runtime;
pub mod sd;
pub mod transport;

pub use codec::{MessageIdManager, WireDecode, WireEncode};
pub use endpoint::{
    CoapEndpoint, CoapResource, LocalEndpoint, ObservationFailure, Observer, RemoteEndpoint, RequestHandler,
    ResponseListener,
};
pub use error::{CoapError, FormatError, Result};
pub use message::{BlockOption, CoapMessage, CoapOption, Code, MediaType, MessageType, Method, OptionKind, ResponseCode};
pub use runtime::{CoapService, GatewayConfig};
pub use sd::{DirectoryUpdate, KnownDevice, LinkFormatDirectory};
pub use transport::{CoapTransport, UdpTransport};
