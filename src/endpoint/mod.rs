//! # Endpoint & Transaction Layer
//!
//! The local endpoint is the single point through which outbound requests and
//! responses are sent and inbound datagrams are dispatched.
//!
//! ## Key Types
//!
//! - [`LocalEndpoint`] - the gateway itself: resource registry, transaction table,
//!   duplicate cache, observation routes and lazily created remote endpoints
//! - [`RemoteEndpoint`] - a peer with its discovered resources and observation relationships
//! - [`ResponseListener`] - per-request callbacks
//! - [`Observer`] - per-resource notification callbacks
//! - [`RequestHandler`] - serves requests for a local resource
//!
//! ## Threading
//!
//! `handle_datagram` runs on the receive thread. Retransmission and expiry run
//! on the scheduler thread. Listener and observer callbacks run on the callback
//! pool, keyed by token, so callbacks of one exchange keep their order.

pub mod dedup;
pub mod observe;
pub mod remote;
pub mod resource;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use dedup::{ExchangeCache, RequestLookup};
pub use observe::{ObservationFailure, ObservationRelationship, ObservationState, Observer};
pub use remote::RemoteEndpoint;
pub use resource::{CoapResource, RequestHandler, normalize_uri};
pub use transaction::{ResponseListener, TransactionState};

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::codec::{MessageIdManager, WireDecode, WireEncode};
use crate::error::{CoapError, Result};
use crate::logging::dump_packet;
use crate::message::{
    BlockOption, CoapMessage, CoapOption, Code, MAX_SZX, MediaType, MessageType, Method, OptionKind,
    ResponseCode,
};
use crate::runtime::config::GatewayConfig;
use crate::runtime::threadpool::CallbackPool;
use crate::runtime::timer::{Scheduler, TaskHandle};
use crate::sd::link_format::to_link_format;
use crate::transport::CoapTransport;

use transaction::{Transaction, TransactionTable};

pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

/// Common view of local and remote endpoints
pub trait CoapEndpoint: Send + Sync {
    fn address(&self) -> SocketAddr;

    fn resources(&self) -> Vec<CoapResource>;

    fn resource(&self, uri: &str) -> Option<CoapResource>;
}

/// Tunables of the local endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSettings {
    /// Largest block size exponent, clamped to 0..=6
    pub max_szx: u8,
    pub ack_timeout: Duration,
    pub max_retransmit: u32,
    pub exchange_lifetime: Duration,
    pub serialize_requests: bool,
}

impl EndpointSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        EndpointSettings {
            max_szx: config.max_block_szx.min(MAX_SZX),
            ack_timeout: config.transmission.ack_timeout(),
            max_retransmit: config.transmission.max_retransmit,
            exchange_lifetime: config.transmission.exchange_lifetime(),
            serialize_requests: config.serialize_requests,
        }
    }
}

impl Default for EndpointSettings {
    fn default() -> Self {
        EndpointSettings::from_config(&GatewayConfig::default())
    }
}

struct LocalResource {
    resource: CoapResource,
    handler: Option<Arc<dyn RequestHandler>>,
}

pub struct LocalEndpoint {
    this: Weak<LocalEndpoint>,
    address: SocketAddr,
    transport: Arc<dyn CoapTransport>,
    scheduler: Arc<Scheduler>,
    callbacks: Arc<CallbackPool>,
    ids: MessageIdManager,
    settings: EndpointSettings,
    resources: RwLock<BTreeMap<String, LocalResource>>,
    transactions: Mutex<TransactionTable>,
    exchanges: Mutex<ExchangeCache>,
    remotes: Mutex<HashMap<SocketAddr, Arc<RemoteEndpoint>>>,
    /// Observation token -> (peer, resource uri)
    routes: Mutex<HashMap<Vec<u8>, (SocketAddr, String)>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn encode(msg: &CoapMessage) -> Result<Vec<u8>> {
    Ok(msg.to_bytes()?)
}

impl LocalEndpoint {
    pub fn new(
        transport: Arc<dyn CoapTransport>,
        scheduler: Arc<Scheduler>,
        callbacks: Arc<CallbackPool>,
        mut settings: EndpointSettings,
    ) -> Result<Arc<Self>> {
        settings.max_szx = settings.max_szx.min(MAX_SZX);
        let address = transport.local_addr()?;
        let lifetime = settings.exchange_lifetime;
        Ok(Arc::new_cyclic(|this| LocalEndpoint {
            this: this.clone(),
            address,
            transport,
            scheduler,
            callbacks,
            ids: MessageIdManager::new(),
            settings,
            resources: RwLock::new(BTreeMap::new()),
            transactions: Mutex::new(TransactionTable::new()),
            exchanges: Mutex::new(ExchangeCache::new(lifetime)),
            remotes: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
        }))
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    pub fn max_szx(&self) -> u8 {
        self.settings.max_szx
    }

    /// Block option for an outgoing request, `szx` clamped to the endpoint maximum
    pub fn block_option(&self, num: u32, more: bool, szx: u8) -> BlockOption {
        BlockOption::new(num, more, szx.min(self.settings.max_szx))
    }

    pub fn next_message_id(&self) -> u16 {
        self.ids.next_message_id()
    }

    pub fn pending_transactions(&self) -> usize {
        guard(&self.transactions).len()
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<Vec<u8>, (SocketAddr, String)>> {
        guard(&self.routes)
    }

    /// Expose `resource` locally. Without a handler requests get 4.05.
    pub fn add_resource(&self, mut resource: CoapResource, handler: Option<Arc<dyn RequestHandler>>) {
        resource.uri = normalize_uri(&resource.uri);
        resource.origin = None;
        debug!(target: "Endpoint", "Adding local resource {}", resource.uri);
        let mut resources = self.resources.write().unwrap_or_else(|e| e.into_inner());
        resources.insert(resource.uri.clone(), LocalResource { resource, handler });
    }

    pub fn remove_resource(&self, resource: &CoapResource) -> bool {
        let mut resources = self.resources.write().unwrap_or_else(|e| e.into_inner());
        resources.remove(&normalize_uri(&resource.uri)).is_some()
    }

    /// Remote endpoint for `address`, created on first use
    pub fn remote(&self, address: SocketAddr) -> Arc<RemoteEndpoint> {
        let mut remotes = guard(&self.remotes);
        remotes
            .entry(address)
            .or_insert_with(|| {
                debug!(target: "Endpoint", "New remote endpoint {}", address);
                Arc::new(RemoteEndpoint::new(address))
            })
            .clone()
    }

    pub fn known_remote(&self, address: SocketAddr) -> Option<Arc<RemoteEndpoint>> {
        guard(&self.remotes).get(&address).cloned()
    }

    pub fn remotes(&self) -> Vec<Arc<RemoteEndpoint>> {
        let mut remotes: Vec<_> = guard(&self.remotes).values().cloned().collect();
        remotes.sort_by_key(|r| r.address());
        remotes
    }

    /// Resolve `host:port`, preferring the address family of the local socket
    pub fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| CoapError::AddressResolution(format!("{}:{} ({})", host, port, e)))?
            .collect();
        candidates
            .iter()
            .find(|a| a.is_ipv4() == self.address.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| CoapError::AddressResolution(format!("{}:{}", host, port)))
    }

    /// Build a request carrying Uri-Host, Uri-Port and the Uri-Path/Uri-Query of `path`
    pub fn create_request(
        &self,
        method: Method,
        host: &str,
        port: u16,
        path: &str,
        message_type: MessageType,
        payload: Option<Vec<u8>>,
    ) -> Result<CoapMessage> {
        if !matches!(message_type, MessageType::Confirmable | MessageType::NonConfirmable) {
            return Err(CoapError::NotARequest);
        }
        let peer = self.resolve(host, port)?;
        let mut request = CoapMessage::request(message_type, method, self.ids.next_message_id());
        request.token = self.ids.next_token();
        request.peer_address = Some(peer);
        let valid = request.add_option(CoapOption::string(OptionKind::UriHost, host))
            && request.add_option(CoapOption::uint(OptionKind::UriPort, u32::from(port)))
            && request.set_uri_path(path);
        if !valid {
            return Err(CoapError::InvalidUri(format!("coap://{}:{}/{}", host, port, path.trim_start_matches('/'))));
        }
        if let Some(payload) = payload {
            request.payload = payload;
        }
        Ok(request)
    }

    /// Send a request. CON requests are retransmitted until acknowledged.
    pub fn send_request(&self, request: CoapMessage, listener: Option<Arc<dyn ResponseListener>>) -> Result<()> {
        self.start_transaction(request, listener, false)
    }

    /// Send a request whose responses may come from any peer (multicast
    /// discovery). The transaction stays open for the exchange lifetime.
    pub fn send_group_request(&self, request: CoapMessage, listener: Option<Arc<dyn ResponseListener>>) -> Result<()> {
        self.start_transaction(request, listener, true)
    }

    fn start_transaction(
        &self,
        mut request: CoapMessage,
        listener: Option<Arc<dyn ResponseListener>>,
        multicast: bool,
    ) -> Result<()> {
        let method = request.method().ok_or(CoapError::NotARequest)?;
        let peer = request.peer_address.ok_or(CoapError::MissingPeer)?;
        if request.token.is_empty() {
            request.token = self.ids.next_token();
        }
        let bytes = encode(&request)?;
        let mid = request.message_id;

        let serial = {
            let mut table = guard(&self.transactions);
            if self.settings.serialize_requests
                && table.has_equivalent(peer, method, &request.options_for_matching())
            {
                drop(table);
                debug!(target: "Endpoint", "Busy: equivalent request to {} outstanding", peer);
                if let Some(listener) = listener {
                    let token = request.token.clone();
                    self.deliver(&token, move || listener.service_busy(&request));
                }
                return Ok(());
            }
            self.track(&mut table, request.clone(), bytes.clone(), peer, listener, multicast)
        };

        if let Err(e) = self.send_raw(&bytes, peer) {
            guard(&self.transactions).remove_if_serial(mid, serial);
            return Err(e);
        }
        debug!(target: "Endpoint", "Sent {} to {}", request, peer);
        Ok(())
    }

    /// Insert a transaction in state Sent and arm its timers
    fn track(
        &self,
        table: &mut TransactionTable,
        message: CoapMessage,
        bytes: Vec<u8>,
        peer: SocketAddr,
        listener: Option<Arc<dyn ResponseListener>>,
        multicast: bool,
    ) -> u64 {
        let mid = message.message_id;
        let confirmable = message.is_confirmable();
        let mut tx = Transaction::new(message, bytes, peer, listener, self.settings.ack_timeout, multicast);
        tx.state = TransactionState::Sent;
        let serial = table.insert(tx);
        let retransmit = confirmable.then(|| self.schedule_retransmission(mid, serial, self.settings.ack_timeout));
        let expiry = self.schedule_expiry(mid, serial);
        if let Some(tx) = table.get_mut(mid) {
            tx.retransmit_timer = retransmit;
            tx.expiry_timer = Some(expiry);
        }
        serial
    }

    /// Send a response. A CON response is retransmitted until the peer ACKs it.
    pub fn send_response(&self, response: CoapMessage) -> Result<()> {
        if response.is_request() {
            return Err(CoapError::NotAResponse);
        }
        let peer = response.peer_address.ok_or(CoapError::MissingPeer)?;
        let bytes = encode(&response)?;
        if response.is_confirmable() {
            let mut table = guard(&self.transactions);
            self.track(&mut table, response.clone(), bytes.clone(), peer, None, false);
        }
        self.send_raw(&bytes, peer)?;
        debug!(target: "Endpoint", "Sent {} to {}", response, peer);
        Ok(())
    }

    fn send_raw(&self, bytes: &[u8], peer: SocketAddr) -> Result<()> {
        dump_packet("TX", peer, bytes);
        self.transport.send(bytes, peer)?;
        Ok(())
    }

    fn send_quietly(&self, msg: &CoapMessage, peer: SocketAddr) {
        if let Err(e) = encode(msg).and_then(|bytes| self.send_raw(&bytes, peer)) {
            warn!(target: "Endpoint", "Failed to send {} to {}: {}", msg, peer, e);
        }
    }

    fn schedule_retransmission(&self, mid: u16, serial: u64, delay: Duration) -> TaskHandle {
        let this = self.this.clone();
        self.scheduler.schedule(delay, move || {
            if let Some(endpoint) = this.upgrade() {
                endpoint.retransmit(mid, serial);
            }
        })
    }

    fn schedule_expiry(&self, mid: u16, serial: u64) -> TaskHandle {
        let this = self.this.clone();
        self.scheduler.schedule(self.settings.exchange_lifetime, move || {
            if let Some(endpoint) = this.upgrade() {
                if guard(&endpoint.transactions).remove_if_serial(mid, serial).is_some() {
                    debug!(target: "Endpoint", "Transaction mid={} expired", mid);
                }
            }
        })
    }

    fn retransmit(&self, mid: u16, serial: u64) {
        let mut table = guard(&self.transactions);
        let exhausted = match table.get_mut(mid) {
            Some(tx) if tx.serial == serial && tx.state.awaiting_ack() => {
                tx.retransmissions >= self.settings.max_retransmit
            }
            _ => return,
        };

        if exhausted {
            let Some(mut tx) = table.remove(mid) else { return };
            drop(table);
            tx.state = TransactionState::MaxRetransmissionsReached;
            warn!(target: "Endpoint", "No answer from {} for mid={} after {} retransmissions", tx.peer, mid, tx.retransmissions);
            if let Some(listener) = tx.listener {
                let request = tx.message;
                let token = request.token.clone();
                self.deliver(&token, move || listener.maximum_retransmissions_reached(&request));
            }
            return;
        }

        let Some(tx) = table.get_mut(mid) else { return };
        tx.retransmissions += 1;
        tx.timeout *= 2;
        tx.state = TransactionState::Retransmitting(tx.retransmissions);
        let (bytes, peer, timeout, attempt) = (tx.bytes.clone(), tx.peer, tx.timeout, tx.retransmissions);
        tx.retransmit_timer = Some(self.schedule_retransmission(mid, serial, timeout));
        drop(table);

        debug!(target: "Endpoint", "Retransmitting mid={} to {} (attempt {})", mid, peer, attempt);
        if let Err(e) = self.send_raw(&bytes, peer) {
            warn!(target: "Endpoint", "Retransmission of mid={} failed: {}", mid, e);
        }
    }

    fn deliver<F>(&self, token: &[u8], job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.callbacks.execute(job, Some(token.to_vec())) {
            debug!(target: "Endpoint", "Callback pool stopped, dropping callback");
        }
    }

    /// Observe `path` on `host:port`. The first observer of a resource triggers
    /// a CON GET with an Observe option; later observers join the existing relationship.
    pub fn create_observation_relationship(
        &self,
        host: &str,
        port: u16,
        path: &str,
        observer: Arc<dyn Observer>,
    ) -> Result<CoapResource> {
        let peer = self.resolve(host, port)?;
        let uri = normalize_uri(path);
        let remote = self.remote(peer);
        let known = remote.resource(&uri);

        let (resource, token) = {
            let mut observations = remote.observations();
            if let Some(rel) = observations.get_mut(&uri) {
                rel.add_observer(observer);
                debug!(target: "Endpoint", "Joined observation of {} ({} observers)", rel.resource(), rel.observer_count());
                return Ok(rel.resource().clone());
            }
            let resource = known.unwrap_or_else(|| CoapResource::with_origin(&uri, peer));
            let token = self.ids.next_token();
            let mut rel = ObservationRelationship::new(resource.clone(), token.clone());
            rel.add_observer(observer);
            observations.insert(uri.clone(), rel);
            (resource, token)
        };
        self.routes().insert(token.clone(), (peer, uri.clone()));

        let mut request = match self.create_request(Method::Get, host, port, &uri, MessageType::Confirmable, None) {
            Ok(request) => request,
            Err(e) => {
                self.drop_relationship(&remote, &uri, &token);
                return Err(e);
            }
        };
        request.token = token.clone();
        request.add_option(CoapOption::uint(OptionKind::Observe, 0));

        let listener = Arc::new(ObservationListener {
            endpoint: self.this.clone(),
            remote: Arc::clone(&remote),
            uri: uri.clone(),
        });
        if let Err(e) = self.send_request(request, Some(listener)) {
            self.drop_relationship(&remote, &uri, &token);
            return Err(e);
        }
        info!(target: "Endpoint", "Observing {}", resource);
        Ok(resource)
    }

    /// Deregister `observer`. Returns true when no observers remain, in which
    /// case the relationship is dropped and later notifications are reset.
    pub fn terminate_observation_relationship(&self, resource: &CoapResource, observer: &Arc<dyn Observer>) -> bool {
        let Some(origin) = resource.origin else { return false };
        let Some(remote) = self.known_remote(origin) else { return false };
        let uri = normalize_uri(&resource.uri);

        let token = {
            let mut observations = remote.observations();
            let Some(rel) = observations.get_mut(&uri) else { return false };
            rel.remove_observer(observer);
            if !rel.is_empty() {
                return false;
            }
            let token = rel.token().to_vec();
            observations.remove(&uri);
            token
        };
        self.routes().remove(&token);
        info!(target: "Endpoint", "Stopped observing {}", resource);
        true
    }

    fn drop_relationship(&self, remote: &RemoteEndpoint, uri: &str, token: &[u8]) -> Option<ObservationRelationship> {
        let removed = {
            let mut observations = remote.observations();
            match observations.get(uri) {
                Some(rel) if rel.token() == token => observations.remove(uri),
                _ => None,
            }
        };
        self.routes().remove(token);
        removed
    }

    fn establish_observation(&self, remote: &RemoteEndpoint, uri: &str, token: &[u8], response: &CoapMessage) {
        let delivery = {
            let mut observations = remote.observations();
            match observations.get_mut(uri) {
                Some(rel) if rel.token() == token => {
                    rel.establish();
                    Some((rel.resource().clone(), rel.observers()))
                }
                _ => None,
            }
        };
        match delivery {
            Some((resource, observers)) => {
                info!(target: "Endpoint", "Observation of {} established", resource);
                for observer in observers {
                    observer.notification_received(&resource, response);
                }
            }
            None => debug!(target: "Endpoint", "Observation of {} ended before it was established", uri),
        }
    }

    fn fail_observation(&self, remote: &RemoteEndpoint, uri: &str, token: &[u8], reason: ObservationFailure) {
        if let Some(rel) = self.drop_relationship(remote, uri, token) {
            warn!(target: "Endpoint", "Observation of {} failed: {:?}", rel.resource(), reason);
            let resource = rel.resource().clone();
            let observers = rel.observers();
            self.deliver(token, move || {
                for observer in observers {
                    observer.observation_failed(&resource, reason);
                }
            });
        }
    }

    /// Fan a notification out to the observers of its token. False if no
    /// relationship uses the token.
    fn route_notification(&self, msg: &CoapMessage, peer: SocketAddr) -> bool {
        let route = self.routes().get(&msg.token).cloned();
        let Some((origin, uri)) = route else { return false };
        if origin != peer {
            return false;
        }
        let Some(remote) = self.known_remote(origin) else { return false };
        if !remote.observes(&uri, &msg.token) {
            return false;
        }
        if let Some(code) = msg.response_code().filter(|c| !c.is_success()) {
            self.fail_observation(&remote, &uri, &msg.token, ObservationFailure::ErrorResponse(code));
            return true;
        }

        let notification = msg.clone();
        self.deliver(&msg.token, move || {
            // Resolved on the worker so a pending relationship is established first
            if let Some((resource, observers)) = remote.established_observers(&uri, &notification.token) {
                for observer in observers {
                    observer.notification_received(&resource, &notification);
                }
            }
        });
        true
    }

    /// Dispatch one datagram received on the unicast socket
    pub fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        self.dispatch(data, peer, false);
    }

    /// Dispatch one datagram received on the multicast group. Error responses
    /// and resets are suppressed.
    pub fn handle_group_datagram(&self, data: &[u8], peer: SocketAddr) {
        self.dispatch(data, peer, true);
    }

    fn dispatch(&self, data: &[u8], peer: SocketAddr, via_group: bool) {
        dump_packet("RX", peer, data);
        let mut msg = match CoapMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target: "Endpoint", "Dropping malformed datagram from {}: {}", peer, e);
                return;
            }
        };
        msg.peer_address = Some(peer);
        debug!(target: "Endpoint", "Received {} from {}", msg, peer);

        if msg.is_confirmable() && !msg.valid_options() {
            debug!(target: "Endpoint", "Rejecting mid={} from {}: invalid options", msg.message_id, peer);
            if !via_group {
                self.send_quietly(&CoapMessage::reset(&msg), peer);
            }
            return;
        }

        if msg.is_request() && self.is_own_group_request(&msg, peer) {
            debug!(target: "Endpoint", "Ignoring own group request mid={} looped back from {}", msg.message_id, peer);
            return;
        }

        if msg.is_request() {
            self.handle_request(msg, peer, via_group);
        } else {
            match msg.message_type {
                MessageType::Acknowledgement | MessageType::Reset => self.match_by_message_id(msg, peer),
                // Empty CON is a ping
                _ if msg.is_empty() => {
                    if msg.is_confirmable() && !via_group {
                        self.send_quietly(&CoapMessage::reset(&msg), peer);
                    }
                }
                _ => self.handle_separate_response(msg, peer),
            }
        }
    }

    /// A group request we sent ourselves, received again through multicast
    /// loopback. The source address may be any local interface, so it is
    /// matched by port, token and message id against open group transactions.
    fn is_own_group_request(&self, msg: &CoapMessage, peer: SocketAddr) -> bool {
        if peer.port() != self.address.port() || msg.token.is_empty() {
            return false;
        }
        let mut table = guard(&self.transactions);
        let Some(mid) = table.mid_for_token(&msg.token) else { return false };
        mid == msg.message_id
            && table
                .get_mut(mid)
                .is_some_and(|tx| tx.multicast && tx.message.is_request())
    }

    fn handle_request(&self, request: CoapMessage, peer: SocketAddr, via_group: bool) {
        let now = Instant::now();
        if let RequestLookup::Duplicate(reply) = guard(&self.exchanges).lookup_request(peer, &request, now) {
            debug!(target: "Endpoint", "Duplicate request mid={} from {}", request.message_id, peer);
            if let Some(bytes) = reply {
                if let Err(e) = self.send_raw(&bytes, peer) {
                    warn!(target: "Endpoint", "Failed to replay reply to {}: {}", peer, e);
                }
            }
            return;
        }

        let response = self.serve(&request);
        let suppressed = via_group && !response.response_code().is_some_and(|c| c.is_success());
        let reply = if suppressed {
            None
        } else {
            match encode(&response) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(target: "Endpoint", "Cannot encode response to {}: {}", peer, e);
                    None
                }
            }
        };
        guard(&self.exchanges).store_reply(peer, &request, reply.clone(), now);

        if let Some(bytes) = reply {
            debug!(target: "Endpoint", "Answering {} with {}", peer, response);
            if let Err(e) = self.send_raw(&bytes, peer) {
                warn!(target: "Endpoint", "Failed to answer {}: {}", peer, e);
            }
        }
    }

    fn serve(&self, request: &CoapMessage) -> CoapMessage {
        let mut response = CoapMessage::response_to(request, ResponseCode::Content, self.ids.next_message_id());
        let path = request.uri_path();

        if path == WELL_KNOWN_CORE {
            match request.method() {
                Some(Method::Get) => self.serve_well_known_core(request, &mut response),
                _ => response.code = Code::Response(ResponseCode::MethodNotAllowed),
            }
            return response;
        }

        let handler = {
            let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
            match resources.get(&path) {
                None => Err(ResponseCode::NotFound),
                Some(local) => local.handler.clone().ok_or(ResponseCode::MethodNotAllowed),
            }
        };
        match handler {
            Ok(handler) => {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler.handle(request, &mut response)
                }));
                if outcome.is_err() {
                    warn!(target: "Endpoint", "Handler for {} panicked", path);
                    response = CoapMessage::response_to(request, ResponseCode::InternalServerError, response.message_id);
                }
            }
            Err(code) => response.code = Code::Response(code),
        }
        response
    }

    fn serve_well_known_core(&self, request: &CoapMessage, response: &mut CoapMessage) {
        let body = to_link_format(&self.resources()).into_bytes();
        let max_szx = self.settings.max_szx;
        let requested = request.block2();

        let szx = requested.map(|b| b.szx.min(max_szx)).unwrap_or(max_szx);
        let num = match requested {
            Some(b) if b.szx > szx => b.num << (b.szx - szx),
            Some(b) => b.num,
            None => 0,
        };
        let block = BlockOption::new(num, false, szx);

        if requested.is_none() && body.len() <= block.size() {
            response.set_content_type(MediaType::LinkFormat);
            response.payload = body;
            return;
        }
        if num > 0 && block.offset() >= body.len() {
            response.code = Code::Response(ResponseCode::BadOption);
            return;
        }
        let (chunk, more) = block.slice(&body);
        response.set_content_type(MediaType::LinkFormat);
        response.set_block(OptionKind::Block2, BlockOption::new(num, more, szx));
        response.payload = chunk.to_vec();
    }

    fn match_by_message_id(&self, msg: CoapMessage, peer: SocketAddr) {
        let mid = msg.message_id;
        let mut table = guard(&self.transactions);
        let Some(tx) = table.get_mut(mid) else {
            debug!(target: "Endpoint", "Unmatched {} from {}", msg, peer);
            return;
        };
        if !tx.accepts_from(peer) || !tx.state.awaiting_ack() {
            debug!(target: "Endpoint", "Ignoring {} from {} in state {:?}", msg, peer, tx.state);
            return;
        }

        if msg.message_type == MessageType::Reset {
            let Some(mut tx) = table.remove(mid) else { return };
            drop(table);
            tx.state = TransactionState::Reset;
            debug!(target: "Endpoint", "mid={} reset by {}", mid, peer);
            if let Some(listener) = tx.listener {
                let request = tx.message;
                let token = request.token.clone();
                self.deliver(&token, move || listener.reset_response_received(&request, &msg));
            }
            return;
        }

        if msg.is_empty() {
            if !tx.message.is_request() {
                // Our CON response was acknowledged
                tx.state = TransactionState::Done;
                table.remove(mid);
                return;
            }
            tx.state = TransactionState::AckedEmpty;
            if let Some(timer) = tx.retransmit_timer.take() {
                timer.cancel();
            }
            let listener = tx.listener.clone();
            let request = tx.message.clone();
            drop(table);
            if let Some(listener) = listener {
                let token = request.token.clone();
                self.deliver(&token, move || listener.empty_ack_received(&request, &msg));
            }
            return;
        }

        if msg.token != tx.message.token {
            debug!(target: "Endpoint", "Piggy-backed response mid={} carries a foreign token", mid);
            return;
        }
        tx.state = TransactionState::ResponseReceived;
        let Some(mut tx) = table.remove(mid) else { return };
        drop(table);
        tx.state = TransactionState::Done;
        if let Some(listener) = tx.listener {
            let request = tx.message;
            let token = request.token.clone();
            self.deliver(&token, move || listener.piggybacked_response_received(&request, &msg));
        }
    }

    fn handle_separate_response(&self, msg: CoapMessage, peer: SocketAddr) {
        if guard(&self.exchanges).check_response(peer, msg.message_id, Instant::now()) {
            debug!(target: "Endpoint", "Duplicate response mid={} from {}", msg.message_id, peer);
            if msg.is_confirmable() {
                self.send_quietly(&CoapMessage::empty_ack(&msg), peer);
            }
            return;
        }

        let matched = {
            let mut table = guard(&self.transactions);
            let mid = table.mid_for_token(&msg.token);
            match mid.and_then(|mid| table.get_mut(mid).map(|tx| (mid, tx.accepts_from(peer), tx.multicast))) {
                Some((_, false, _)) | None => None,
                Some((mid, true, true)) => table.get_mut(mid).map(|tx| (tx.message.clone(), tx.listener.clone())),
                Some((mid, true, false)) => table.remove(mid).map(|mut tx| {
                    tx.state = TransactionState::Done;
                    (tx.message, tx.listener)
                }),
            }
        };

        if let Some((request, listener)) = matched {
            if msg.is_confirmable() {
                self.send_quietly(&CoapMessage::empty_ack(&msg), peer);
            }
            if let Some(listener) = listener {
                let token = request.token.clone();
                self.deliver(&token, move || listener.separate_response_received(&request, &msg));
            }
            return;
        }

        if self.route_notification(&msg, peer) {
            if msg.is_confirmable() {
                self.send_quietly(&CoapMessage::empty_ack(&msg), peer);
            }
            return;
        }

        if msg.is_confirmable() {
            debug!(target: "Endpoint", "Resetting unexpected {} from {}", msg, peer);
            self.send_quietly(&CoapMessage::reset(&msg), peer);
        } else {
            debug!(target: "Endpoint", "Dropping unexpected {} from {}", msg, peer);
        }
    }

    /// Drop transactions, observations, remote endpoints and local resources
    pub fn shutdown(&self) {
        let dropped = guard(&self.transactions).clear();
        self.routes().clear();
        guard(&self.exchanges).clear();
        let remotes: Vec<_> = guard(&self.remotes).drain().map(|(_, r)| r).collect();
        for remote in &remotes {
            remote.observations().clear();
        }
        self.resources.write().unwrap_or_else(|e| e.into_inner()).clear();
        debug!(
            target: "Endpoint",
            "Endpoint {} shut down ({} open transactions, {} remotes dropped)",
            self.address,
            dropped.len(),
            remotes.len()
        );
    }
}

impl CoapEndpoint for LocalEndpoint {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn resources(&self) -> Vec<CoapResource> {
        let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
        resources.values().map(|local| local.resource.clone()).collect()
    }

    fn resource(&self, uri: &str) -> Option<CoapResource> {
        let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
        resources.get(&normalize_uri(uri)).map(|local| local.resource.clone())
    }
}

/// Drives one observation relationship through its subscription GET
struct ObservationListener {
    endpoint: Weak<LocalEndpoint>,
    remote: Arc<RemoteEndpoint>,
    uri: String,
}

impl ObservationListener {
    fn response(&self, request: &CoapMessage, response: &CoapMessage) {
        let Some(endpoint) = self.endpoint.upgrade() else { return };
        match response.response_code() {
            Some(code) if code.is_success() => {
                endpoint.establish_observation(&self.remote, &self.uri, &request.token, response)
            }
            Some(code) => endpoint.fail_observation(
                &self.remote,
                &self.uri,
                &request.token,
                ObservationFailure::ErrorResponse(code),
            ),
            None => {}
        }
    }

    fn failed(&self, request: &CoapMessage, reason: ObservationFailure) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.fail_observation(&self.remote, &self.uri, &request.token, reason);
        }
    }
}

impl ResponseListener for ObservationListener {
    fn piggybacked_response_received(&self, request: &CoapMessage, response: &CoapMessage) {
        self.response(request, response);
    }

    fn separate_response_received(&self, request: &CoapMessage, response: &CoapMessage) {
        self.response(request, response);
    }

    fn reset_response_received(&self, request: &CoapMessage, _reset: &CoapMessage) {
        self.failed(request, ObservationFailure::Reset);
    }

    fn maximum_retransmissions_reached(&self, request: &CoapMessage) {
        self.failed(request, ObservationFailure::Unreachable);
    }

    fn service_busy(&self, request: &CoapMessage) {
        self.failed(request, ObservationFailure::Busy);
    }
}
