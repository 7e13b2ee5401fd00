use std::sync::Arc;

use crate::message::{CoapMessage, ResponseCode};

use super::resource::CoapResource;

/// Receives notifications for an observed remote resource.
pub trait Observer: Send + Sync {
    fn notification_received(&self, resource: &CoapResource, notification: &CoapMessage);

    /// The relationship could not be established or was torn down by the peer
    fn observation_failed(&self, _resource: &CoapResource, _reason: ObservationFailure) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationFailure {
    /// Peer answered with an error code
    ErrorResponse(ResponseCode),
    /// Peer answered with RST
    Reset,
    /// Retransmissions exhausted
    Unreachable,
    /// An equivalent request was still outstanding
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationState {
    /// Subscription GET sent, no success response yet
    Pending,
    Established,
}

/// One observed resource and everyone interested in it
pub struct ObservationRelationship {
    resource: CoapResource,
    token: Vec<u8>,
    state: ObservationState,
    observers: Vec<Arc<dyn Observer>>,
}

impl ObservationRelationship {
    pub fn new(resource: CoapResource, token: Vec<u8>) -> Self {
        ObservationRelationship {
            resource,
            token,
            state: ObservationState::Pending,
            observers: Vec::new(),
        }
    }

    pub fn resource(&self) -> &CoapResource {
        &self.resource
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn state(&self) -> ObservationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ObservationState::Established
    }

    pub(crate) fn establish(&mut self) {
        self.state = ObservationState::Established;
    }

    /// Returns false if `observer` is already registered
    pub fn add_observer(&mut self, observer: Arc<dyn Observer>) -> bool {
        if self.observers.iter().any(|o| same_observer(o, &observer)) {
            return false;
        }
        self.observers.push(observer);
        true
    }

    pub fn remove_observer(&mut self, observer: &Arc<dyn Observer>) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| !same_observer(o, observer));
        self.observers.len() != before
    }

    pub fn observers(&self) -> Vec<Arc<dyn Observer>> {
        self.observers.clone()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// Identity comparison that ignores vtable pointers
pub fn same_observer(a: &Arc<dyn Observer>, b: &Arc<dyn Observer>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
