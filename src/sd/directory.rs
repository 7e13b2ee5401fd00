use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::RwLock;

use crate::endpoint::resource::CoapResource;

/// A device that answered discovery, with the resources it advertised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownDevice {
    pub address: SocketAddr,
    pub resources: Vec<CoapResource>,
}

/// Difference between two snapshots of one device, URIs sorted
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirectoryUpdate {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl DirectoryUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Resources discovered per device.
///
/// Each discovery answer replaces the device's previous snapshot.
pub struct LinkFormatDirectory {
    devices: RwLock<HashMap<SocketAddr, BTreeMap<String, CoapResource>>>,
}

impl Default for LinkFormatDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkFormatDirectory {
    pub fn new() -> Self {
        LinkFormatDirectory { devices: RwLock::new(HashMap::new()) }
    }

    /// Replace the snapshot of `device`, stamping every resource with its origin
    pub fn update(&self, device: SocketAddr, resources: Vec<CoapResource>) -> DirectoryUpdate {
        let snapshot: BTreeMap<String, CoapResource> = resources
            .into_iter()
            .map(|mut r| {
                r.origin = Some(device);
                (r.uri.clone(), r)
            })
            .collect();

        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let previous = devices.remove(&device).unwrap_or_default();

        let mut update = DirectoryUpdate::default();
        for (uri, resource) in &snapshot {
            match previous.get(uri) {
                None => update.added.push(uri.clone()),
                Some(old) if old != resource => update.changed.push(uri.clone()),
                Some(_) => {}
            }
        }
        update.removed = previous
            .keys()
            .filter(|uri| !snapshot.contains_key(*uri))
            .cloned()
            .collect();

        devices.insert(device, snapshot);
        update
    }

    /// All devices ordered by address
    pub fn known_devices(&self) -> Vec<KnownDevice> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut known: Vec<KnownDevice> = devices
            .iter()
            .map(|(address, resources)| KnownDevice {
                address: *address,
                resources: resources.values().cloned().collect(),
            })
            .collect();
        known.sort_by_key(|d| d.address);
        known
    }

    pub fn resources_of(&self, device: SocketAddr) -> Option<Vec<CoapResource>> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.get(&device).map(|r| r.values().cloned().collect())
    }

    pub fn remove_device(&self, device: SocketAddr) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.remove(&device).is_some()
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.devices.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
