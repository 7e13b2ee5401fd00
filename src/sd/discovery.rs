use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};

use crate::endpoint::{CoapEndpoint, LocalEndpoint, ResponseListener, WELL_KNOWN_CORE};
use crate::error::Result;
use crate::message::{CoapMessage, MediaType, MessageType, Method, OptionKind};
use crate::runtime::timer::{Scheduler, TaskHandle};

use super::directory::LinkFormatDirectory;
use super::link_format::parse_link_format;

/// Periodically asks the discovery address for `/.well-known/core` and feeds
/// the answers into the directory and the remote endpoints.
pub struct ResourceDiscovery {
    endpoint: Arc<LocalEndpoint>,
    directory: Arc<LinkFormatDirectory>,
    target: SocketAddr,
    task: Mutex<Option<TaskHandle>>,
    partial: Arc<Mutex<HashMap<SocketAddr, Vec<u8>>>>,
}

impl ResourceDiscovery {
    pub fn new(endpoint: Arc<LocalEndpoint>, directory: Arc<LinkFormatDirectory>, target: SocketAddr) -> Arc<Self> {
        Arc::new(ResourceDiscovery {
            endpoint,
            directory,
            target,
            task: Mutex::new(None),
            partial: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Send a discovery request now and then every `interval`
    pub fn start(self: &Arc<Self>, scheduler: &Scheduler, interval: Duration) {
        let this = Arc::downgrade(self);
        let handle = scheduler.schedule_repeating(Duration::ZERO, interval, move || {
            if let Some(discovery) = this.upgrade() {
                if let Err(e) = discovery.discover_now() {
                    warn!(target: "Discovery", "Discovery request to {} failed: {}", discovery.target, e);
                }
            }
        });
        info!(target: "Discovery", "Discovering {} every {:?}", self.target, interval);
        if let Some(old) = self.task().replace(handle) {
            old.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| t.is_pending())
    }

    /// NON GET `/.well-known/core` to the discovery address
    pub fn discover_now(&self) -> Result<()> {
        let mut request = CoapMessage::request(MessageType::NonConfirmable, Method::Get, self.endpoint.next_message_id());
        request.peer_address = Some(self.target);
        request.set_uri_path(WELL_KNOWN_CORE);
        request.set_content_type(MediaType::LinkFormat);

        let listener = DiscoveryListener {
            endpoint: Arc::downgrade(&self.endpoint),
            directory: Arc::clone(&self.directory),
            partial: Arc::clone(&self.partial),
        };
        debug!(target: "Discovery", "Sending discovery request to {}", self.target);
        self.endpoint.send_group_request(request, Some(Arc::new(listener)))
    }

    pub fn stop(&self) {
        if let Some(task) = self.task().take() {
            task.cancel();
            debug!(target: "Discovery", "Discovery of {} stopped", self.target);
        }
        self.partial.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn task(&self) -> std::sync::MutexGuard<'_, Option<TaskHandle>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handles discovery answers, following Block2 continuations per peer
#[derive(Clone)]
struct DiscoveryListener {
    endpoint: Weak<LocalEndpoint>,
    directory: Arc<LinkFormatDirectory>,
    partial: Arc<Mutex<HashMap<SocketAddr, Vec<u8>>>>,
}

impl DiscoveryListener {
    fn on_response(&self, response: &CoapMessage) {
        let Some(peer) = response.peer_address else { return };
        let Some(endpoint) = self.endpoint.upgrade() else { return };
        if peer == endpoint.address() {
            return;
        }
        match response.response_code() {
            Some(code) if code.is_success() => {}
            code => {
                debug!(target: "Discovery", "{} answered discovery with {:?}", peer, code);
                self.partial.lock().unwrap_or_else(|e| e.into_inner()).remove(&peer);
                return;
            }
        }

        let body = match response.block2() {
            Some(block) => {
                let mut partial = self.partial.lock().unwrap_or_else(|e| e.into_inner());
                let buffer = partial.entry(peer).or_default();
                if block.num == 0 {
                    buffer.clear();
                }
                if buffer.len() != block.offset() {
                    debug!(target: "Discovery", "Out of order block {} from {}, dropping", block.num, peer);
                    partial.remove(&peer);
                    return;
                }
                buffer.extend_from_slice(&response.payload);
                if block.more {
                    let received = buffer.len();
                    drop(partial);
                    self.request_next_block(&endpoint, peer, received, block.szx);
                    return;
                }
                partial.remove(&peer).unwrap_or_default()
            }
            None => response.payload.clone(),
        };

        self.complete(&endpoint, peer, &body);
    }

    /// Ask for the block starting at `received` bytes. The peer's block size is
    /// clamped to ours, so the block number is counted in the clamped size.
    fn request_next_block(&self, endpoint: &LocalEndpoint, peer: SocketAddr, received: usize, szx: u8) {
        let size = endpoint.block_option(0, false, szx);
        let block = endpoint.block_option((received / size.size()) as u32, false, size.szx);
        let mut request = CoapMessage::request(MessageType::Confirmable, Method::Get, endpoint.next_message_id());
        request.peer_address = Some(peer);
        request.set_uri_path(WELL_KNOWN_CORE);
        request.set_block(OptionKind::Block2, block);
        debug!(target: "Discovery", "Requesting block {} (szx {}) of {} from {}", block.num, block.szx, WELL_KNOWN_CORE, peer);
        if let Err(e) = endpoint.send_request(request, Some(Arc::new(self.clone()))) {
            warn!(target: "Discovery", "Block request to {} failed: {}", peer, e);
            self.partial.lock().unwrap_or_else(|e| e.into_inner()).remove(&peer);
        }
    }

    fn complete(&self, endpoint: &LocalEndpoint, peer: SocketAddr, body: &[u8]) {
        let resources = parse_link_format(&String::from_utf8_lossy(body));
        let update = self.directory.update(peer, resources.clone());
        endpoint.remote(peer).set_resources(resources);
        if update.is_empty() {
            debug!(target: "Discovery", "No changes at {}", peer);
        } else {
            info!(
                target: "Discovery",
                "{}: added {:?}, removed {:?}, changed {:?}",
                peer, update.added, update.removed, update.changed
            );
        }
    }
}

impl ResponseListener for DiscoveryListener {
    fn piggybacked_response_received(&self, _request: &CoapMessage, response: &CoapMessage) {
        self.on_response(response);
    }

    fn separate_response_received(&self, _request: &CoapMessage, response: &CoapMessage) {
        self.on_response(response);
    }

    fn maximum_retransmissions_reached(&self, request: &CoapMessage) {
        if let Some(peer) = request.peer_address {
            warn!(target: "Discovery", "{} stopped answering block requests", peer);
            self.partial.lock().unwrap_or_else(|e| e.into_inner()).remove(&peer);
        }
    }
}
