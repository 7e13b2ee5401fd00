//! # Gateway Runtime Module
//!
//! Startup, teardown and the caller-facing API of the CoAP gateway.
//!
//! ## Key Types
//!
//! - [`CoapService`] - owns sockets, receive loops, scheduler, callback pool,
//!   the local endpoint and the discovery directory
//! - [`GatewayConfig`] - bind address, discovery and transmission settings
//! - [`Scheduler`] - cancellable timer tasks (retransmission, expiry, discovery)
//! - [`CallbackPool`] - worker threads delivering listener and observer callbacks
//!
//! ## Lifecycle
//!
//! 1. Build a configuration: `GatewayConfig::load("gateway.json")` or `GatewayConfig::default()`
//! 2. Start: `CoapService::start(config)`
//! 3. Expose resources, send requests, observe remote resources
//! 4. Stop: `service.stop()` (also run on drop)
//!
//! ## Example
//!
//! ```ignore
//! let service = CoapService::start(GatewayConfig::default())?;
//! service.add_resource(CoapResource::new("/temp").resource_type("temperature-c"));
//! let request = service.create_get_request("10.0.0.7", 5683, "/sensors/temp", MessageType::Confirmable)?;
//! service.send_request(request, Some(listener))?;
//! ```

pub mod config;
pub mod threadpool;
pub mod timer;

pub use config::{DiscoveryConfig, GatewayConfig, TransmissionConfig};
pub use threadpool::CallbackPool;
pub use timer::{Scheduler, TaskHandle};

use log::{debug, info, warn};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::endpoint::{
    CoapEndpoint, CoapResource, EndpointSettings, LocalEndpoint, Observer, RequestHandler, ResponseListener,
};
use crate::error::{CoapError, Result};
use crate::message::{CoapMessage, MessageType, Method};
use crate::sd::{KnownDevice, LinkFormatDirectory, ResourceDiscovery};
use crate::transport::{CoapTransport, UdpTransport};

/// Receive buffer size; large enough for a 1024-byte block plus header and options
pub const MAX_DATAGRAM_SIZE: usize = 1500;

pub struct CoapService {
    transport: Arc<UdpTransport>,
    group_transport: Option<Arc<UdpTransport>>,
    scheduler: Arc<Scheduler>,
    callbacks: Arc<CallbackPool>,
    endpoint: Arc<LocalEndpoint>,
    directory: Arc<LinkFormatDirectory>,
    discovery: Arc<ResourceDiscovery>,
    running: Arc<AtomicBool>,
    receivers: Mutex<Vec<JoinHandle<()>>>,
}

impl CoapService {
    /// Bind the sockets, start the receive loops and, if configured, periodic discovery
    pub fn start(config: GatewayConfig) -> Result<Arc<Self>> {
        let bind_addr = config.bind_socket_addr()?;
        let discovery_target = config.discovery_socket_addr()?;
        let interface = config.discovery_interface()?;

        let transport = Arc::new(UdpTransport::new(bind_addr)?);
        if is_ipv4_multicast(discovery_target) {
            if let Err(e) = transport.set_multicast_if_v4(&interface) {
                warn!(target: "Service", "Cannot select multicast interface {}: {}", interface, e);
            }
        }

        let group_transport = if config.discovery.join_multicast {
            let IpAddr::V4(group) = discovery_target.ip() else {
                return Err(CoapError::Config(format!("{} is not an IPv4 multicast group", discovery_target)));
            };
            let group_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), discovery_target.port());
            Some(Arc::new(UdpTransport::new_multicast(group_bind, group, interface)?))
        } else {
            None
        };

        let scheduler = Arc::new(Scheduler::new()?);
        let callbacks = Arc::new(CallbackPool::new(config.callback_threads)?);
        let endpoint = LocalEndpoint::new(
            transport.clone(),
            Arc::clone(&scheduler),
            Arc::clone(&callbacks),
            EndpointSettings::from_config(&config),
        )?;
        let directory = Arc::new(LinkFormatDirectory::new());
        let discovery = ResourceDiscovery::new(Arc::clone(&endpoint), Arc::clone(&directory), discovery_target);
        let running = Arc::new(AtomicBool::new(true));

        let mut receivers = vec![spawn_receiver(
            "coap-receive",
            transport.clone(),
            Arc::clone(&endpoint),
            Arc::clone(&running),
            false,
        )?];
        if let Some(group) = &group_transport {
            receivers.push(spawn_receiver(
                "coap-multicast",
                group.clone(),
                Arc::clone(&endpoint),
                Arc::clone(&running),
                true,
            )?);
        }

        if let Some(interval) = config.discovery_interval() {
            discovery.start(&scheduler, interval);
        }

        info!(target: "Service", "CoAP gateway listening on {}", endpoint.address());
        Ok(Arc::new(CoapService {
            transport,
            group_transport,
            scheduler,
            callbacks,
            endpoint,
            directory,
            discovery,
            running,
            receivers: Mutex::new(receivers),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.address()
    }

    pub fn endpoint(&self) -> &Arc<LocalEndpoint> {
        &self.endpoint
    }

    pub fn directory(&self) -> &Arc<LinkFormatDirectory> {
        &self.directory
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() { Ok(()) } else { Err(CoapError::Stopped) }
    }

    pub fn create_request(
        &self,
        method: Method,
        host: &str,
        port: u16,
        path: &str,
        message_type: MessageType,
        payload: Option<Vec<u8>>,
    ) -> Result<CoapMessage> {
        self.endpoint.create_request(method, host, port, path, message_type, payload)
    }

    pub fn create_get_request(&self, host: &str, port: u16, path: &str, message_type: MessageType) -> Result<CoapMessage> {
        self.create_request(Method::Get, host, port, path, message_type, None)
    }

    pub fn create_post_request(
        &self,
        host: &str,
        port: u16,
        path: &str,
        message_type: MessageType,
        payload: Option<Vec<u8>>,
    ) -> Result<CoapMessage> {
        self.create_request(Method::Post, host, port, path, message_type, payload)
    }

    pub fn create_put_request(
        &self,
        host: &str,
        port: u16,
        path: &str,
        message_type: MessageType,
        payload: Option<Vec<u8>>,
    ) -> Result<CoapMessage> {
        self.create_request(Method::Put, host, port, path, message_type, payload)
    }

    pub fn create_delete_request(&self, host: &str, port: u16, path: &str, message_type: MessageType) -> Result<CoapMessage> {
        self.create_request(Method::Delete, host, port, path, message_type, None)
    }

    pub fn send_request(&self, request: CoapMessage, listener: Option<Arc<dyn ResponseListener>>) -> Result<()> {
        self.ensure_running()?;
        self.endpoint.send_request(request, listener)
    }

    pub fn send_response(&self, response: CoapMessage) -> Result<()> {
        self.ensure_running()?;
        self.endpoint.send_response(response)
    }

    /// Send `request` and wait for its response.
    ///
    /// Resolves with the piggy-backed or separate response. A reset yields
    /// `CoapError::Reset`, exhausted retransmissions or `timeout` yield `CoapError::Timeout`.
    pub async fn request(&self, request: CoapMessage, timeout: Duration) -> Result<CoapMessage> {
        let (sender, receiver) = oneshot::channel();
        let slot = Arc::new(ResponseSlot { sender: Mutex::new(Some(sender)) });
        self.send_request(request, Some(slot))?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoapError::Stopped),
            Err(_) => Err(CoapError::Timeout),
        }
    }

    pub fn create_observation_relationship(
        &self,
        host: &str,
        port: u16,
        path: &str,
        observer: Arc<dyn Observer>,
    ) -> Result<CoapResource> {
        self.ensure_running()?;
        self.endpoint.create_observation_relationship(host, port, path, observer)
    }

    pub fn terminate_observation_relationship(&self, resource: &CoapResource, observer: &Arc<dyn Observer>) -> bool {
        self.endpoint.terminate_observation_relationship(resource, observer)
    }

    /// Advertise `resource` in `/.well-known/core`; requests to it get 4.05
    pub fn add_resource(&self, resource: CoapResource) {
        self.endpoint.add_resource(resource, None);
    }

    pub fn add_resource_with_handler(&self, resource: CoapResource, handler: Arc<dyn RequestHandler>) {
        self.endpoint.add_resource(resource, Some(handler));
    }

    pub fn remove_resource(&self, resource: &CoapResource) -> bool {
        self.endpoint.remove_resource(resource)
    }

    pub fn get_known_devices(&self) -> Vec<KnownDevice> {
        self.directory.known_devices()
    }

    /// Send one discovery request outside the periodic schedule
    pub fn discover_now(&self) -> Result<()> {
        self.ensure_running()?;
        self.discovery.discover_now()
    }

    /// Close sockets, stop timers, drop endpoint state, then release the callback workers
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(target: "Service", "Stopping CoAP gateway on {}", self.endpoint.address());

        self.transport.close();
        if let Some(group) = &self.group_transport {
            group.close();
        }
        let receivers: Vec<JoinHandle<()>> = self.receivers.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
        for handle in receivers {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(target: "Service", "Receive loop panicked");
            }
        }

        self.discovery.stop();
        self.scheduler.shutdown();

        self.endpoint.shutdown();
        self.directory.clear();

        self.callbacks.shutdown();
        debug!(target: "Service", "CoAP gateway stopped");
    }
}

impl Drop for CoapService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_ipv4_multicast(addr: SocketAddr) -> bool {
    matches!(addr.ip(), IpAddr::V4(ip) if ip.is_multicast())
}

fn spawn_receiver(
    name: &str,
    transport: Arc<UdpTransport>,
    endpoint: Arc<LocalEndpoint>,
    running: Arc<AtomicBool>,
    group: bool,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || receive_loop(transport.as_ref(), &endpoint, &running, group))?;
    Ok(handle)
}

fn receive_loop(transport: &dyn CoapTransport, endpoint: &LocalEndpoint, running: &AtomicBool, group: bool) {
    debug!(target: "Service", "Receive loop started (group: {})", group);
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::Relaxed) {
        match transport.receive(&mut buf) {
            Ok((size, peer)) => {
                if group {
                    endpoint.handle_group_datagram(&buf[..size], peer);
                } else {
                    endpoint.handle_datagram(&buf[..size], peer);
                }
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(_) if transport.is_closed() => break,
            Err(e) => {
                warn!(target: "Service", "RX error: {}", e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!(target: "Service", "Receive loop stopped (group: {})", group);
}

/// Completes the future of `CoapService::request`
struct ResponseSlot {
    sender: Mutex<Option<oneshot::Sender<Result<CoapMessage>>>>,
}

impl ResponseSlot {
    fn complete(&self, result: Result<CoapMessage>) {
        if let Some(sender) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = sender.send(result);
        }
    }
}

impl ResponseListener for ResponseSlot {
    fn piggybacked_response_received(&self, _request: &CoapMessage, response: &CoapMessage) {
        self.complete(Ok(response.clone()));
    }

    fn separate_response_received(&self, _request: &CoapMessage, response: &CoapMessage) {
        self.complete(Ok(response.clone()));
    }

    fn reset_response_received(&self, _request: &CoapMessage, _reset: &CoapMessage) {
        self.complete(Err(CoapError::Reset));
    }

    fn maximum_retransmissions_reached(&self, _request: &CoapMessage) {
        self.complete(Err(CoapError::Timeout));
    }

    fn service_busy(&self, _request: &CoapMessage) {
        self.complete(Err(CoapError::Busy));
    }
}
