use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::CoapEndpoint;
use super::observe::{ObservationRelationship, Observer};
use super::resource::{CoapResource, normalize_uri};

/// A peer the gateway has talked to. Created on first contact and kept until
/// the service stops; owns the peer's discovered resources and the
/// observation relationships towards it.
pub struct RemoteEndpoint {
    address: SocketAddr,
    resources: RwLock<BTreeMap<String, CoapResource>>,
    observations: Mutex<HashMap<String, ObservationRelationship>>,
}

impl RemoteEndpoint {
    pub fn new(address: SocketAddr) -> Self {
        RemoteEndpoint {
            address,
            resources: RwLock::new(BTreeMap::new()),
            observations: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the discovered resource set
    pub fn set_resources(&self, resources: Vec<CoapResource>) {
        let mut map = self.resources.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
        for mut resource in resources {
            resource.origin = Some(self.address);
            map.insert(resource.uri.clone(), resource);
        }
    }

    /// URIs currently observed on this peer
    pub fn observed_resources(&self) -> Vec<CoapResource> {
        let mut observed: Vec<CoapResource> = self
            .observations()
            .values()
            .map(|rel| rel.resource().clone())
            .collect();
        observed.sort_by(|a, b| a.uri.cmp(&b.uri));
        observed
    }

    pub fn observer_count(&self, uri: &str) -> usize {
        self.observations()
            .get(&normalize_uri(uri))
            .map(|rel| rel.observer_count())
            .unwrap_or(0)
    }

    pub(crate) fn observations(&self) -> MutexGuard<'_, HashMap<String, ObservationRelationship>> {
        self.observations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The relationship for `uri` exists and was created with `token`
    pub(crate) fn observes(&self, uri: &str, token: &[u8]) -> bool {
        self.observations()
            .get(uri)
            .map(|rel| rel.token() == token)
            .unwrap_or(false)
    }

    /// Observers of `uri` if the relationship is established and still carries `token`
    pub(crate) fn established_observers(&self, uri: &str, token: &[u8]) -> Option<(CoapResource, Vec<Arc<dyn Observer>>)> {
        let observations = self.observations();
        let rel = observations.get(uri)?;
        if rel.token() != token || !rel.is_established() {
            return None;
        }
        Some((rel.resource().clone(), rel.observers()))
    }
}

impl CoapEndpoint for RemoteEndpoint {
    fn address(&self) -> SocketAddr {
        self.address
    }

    fn resources(&self) -> Vec<CoapResource> {
        let map = self.resources.read().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }

    fn resource(&self, uri: &str) -> Option<CoapResource> {
        let map = self.resources.read().unwrap_or_else(|e| e.into_inner());
        map.get(&normalize_uri(uri)).cloned()
    }
}
