use std::fmt;
use std::net::SocketAddr;

use crate::message::CoapMessage;

/// A resource as advertised in CoRE link-format.
///
/// `uri` always carries a leading `/`. `origin` is the endpoint the resource
/// lives on; `None` for resources exposed by the local endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoapResource {
    pub uri: String,
    /// `rt`
    pub resource_type: Option<String>,
    /// `if`
    pub interface_description: Option<String>,
    /// `sz`
    pub maximum_size: Option<u32>,
    pub title: Option<String>,
    /// `title*`
    pub title_asterisk: Option<String>,
    /// `rel`
    pub relation_type: Option<String>,
    pub anchor: Option<String>,
    /// `ct`
    pub content_type: Option<u32>,
    /// `ins`
    pub instance: Option<String>,
    pub key: Option<String>,
    /// `obs`
    pub observable: bool,
    pub origin: Option<SocketAddr>,
}

impl CoapResource {
    pub fn new(uri: &str) -> Self {
        CoapResource {
            uri: normalize_uri(uri),
            ..Default::default()
        }
    }

    pub fn with_origin(uri: &str, origin: SocketAddr) -> Self {
        CoapResource {
            origin: Some(origin),
            ..CoapResource::new(uri)
        }
    }

    pub fn resource_type(mut self, rt: &str) -> Self {
        self.resource_type = Some(rt.to_string());
        self
    }

    pub fn interface_description(mut self, iface: &str) -> Self {
        self.interface_description = Some(iface.to_string());
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn content_type(mut self, ct: u32) -> Self {
        self.content_type = Some(ct);
        self
    }

    pub fn observable(mut self, observable: bool) -> Self {
        self.observable = observable;
        self
    }
}

impl fmt::Display for CoapResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(origin) => write!(f, "coap://{}{}", origin, self.uri),
            None => write!(f, "{}", self.uri),
        }
    }
}

/// Path with exactly one leading `/` and no trailing one (`/` stays `/`)
pub fn normalize_uri(uri: &str) -> String {
    let trimmed = uri.trim().trim_start_matches('/').trim_end_matches('/');
    format!("/{}", trimmed)
}

/// Serves requests for one local resource.
///
/// Called on the receive thread. `response` arrives pre-built as `2.05 Content`
/// carrying the request's token; the handler sets code, options and payload.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &CoapMessage, response: &mut CoapMessage);
}

impl<F> RequestHandler for F
where
    F: Fn(&CoapMessage, &mut CoapMessage) + Send + Sync,
{
    fn handle(&self, request: &CoapMessage, response: &mut CoapMessage) {
        self(request, response)
    }
}
