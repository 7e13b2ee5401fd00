use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoapError, Result};
use crate::message::MAX_SZX;

/// Periodic resource discovery settings
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// Multicast or unicast address the discovery GET is sent to
    #[serde(default = "default_discovery_address")]
    pub address: String,
    #[serde(default = "default_coap_port")]
    pub port: u16,
    /// Seconds between discovery requests, 0 disables discovery
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
    /// Join the discovery group to answer other peers' `/.well-known/core` queries
    #[serde(default)]
    pub join_multicast: bool,
    /// Interface used for group membership and outgoing multicast
    #[serde(default = "default_interface")]
    pub interface: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            address: default_discovery_address(),
            port: default_coap_port(),
            interval_secs: default_discovery_interval(),
            join_multicast: false,
            interface: default_interface(),
        }
    }
}

/// Retransmission timing. All values in milliseconds unless noted.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransmissionConfig {
    /// Initial ACK timeout, doubled after every retransmission (default: 2000)
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    /// Retransmissions before giving up (default: 4)
    #[serde(default = "default_max_retransmit")]
    pub max_retransmit: u32,
    /// Lifetime of duplicate-cache entries and idle transactions (default: 247000)
    #[serde(default = "default_exchange_lifetime")]
    pub exchange_lifetime_ms: u64,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        TransmissionConfig {
            ack_timeout_ms: default_ack_timeout(),
            max_retransmit: default_max_retransmit(),
            exchange_lifetime_ms: default_exchange_lifetime(),
        }
    }
}

impl TransmissionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn exchange_lifetime(&self) -> Duration {
        Duration::from_millis(self.exchange_lifetime_ms)
    }
}

/// Gateway configuration. Built by the caller (file, environment or defaults)
/// and handed to the service; the core never reads files itself.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_coap_port")]
    pub bind_port: u16,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Largest block size exponent offered in Block1/Block2 (clamped to 0..=6)
    #[serde(default = "default_max_block_szx")]
    pub max_block_szx: u8,
    #[serde(default)]
    pub transmission: TransmissionConfig,
    /// Worker threads delivering listener callbacks
    #[serde(default = "default_callback_threads")]
    pub callback_threads: usize,
    /// Refuse a second outstanding request to the same peer and resource with `service_busy`
    #[serde(default)]
    pub serialize_requests: bool,
}

fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_coap_port() -> u16 { 5683 }
fn default_discovery_address() -> String { "224.0.1.187".to_string() }
fn default_discovery_interval() -> u64 { 60 }
fn default_interface() -> String { "0.0.0.0".to_string() }
fn default_max_block_szx() -> u8 { MAX_SZX }
fn default_ack_timeout() -> u64 { 2000 }
fn default_max_retransmit() -> u32 { 4 }
fn default_exchange_lifetime() -> u64 { 247_000 }
fn default_callback_threads() -> usize { 2 }

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            bind_address: default_bind_address(),
            bind_port: default_coap_port(),
            discovery: DiscoveryConfig::default(),
            max_block_szx: default_max_block_szx(),
            transmission: TransmissionConfig::default(),
            callback_threads: default_callback_threads(),
            serialize_requests: false,
        }
    }
}

impl GatewayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let config: GatewayConfig = serde_json::from_reader(BufReader::new(file))?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn bind_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|_| CoapError::Config(format!("invalid bind address '{}'", self.bind_address)))?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }

    pub fn discovery_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.discovery.address.parse().map_err(|_| {
            CoapError::Config(format!("invalid discovery address '{}'", self.discovery.address))
        })?;
        Ok(SocketAddr::new(ip, self.discovery.port))
    }

    pub fn discovery_interface(&self) -> Result<Ipv4Addr> {
        self.discovery.interface.parse().map_err(|_| {
            CoapError::Config(format!("invalid discovery interface '{}'", self.discovery.interface))
        })
    }

    pub fn discovery_interval(&self) -> Option<Duration> {
        match self.discovery.interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GatewayConfig::from_json("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.bind_port, 5683);
        assert_eq!(config.max_block_szx, 6);
        assert_eq!(config.discovery_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_partial_document() {
        let config = GatewayConfig::from_json(
            r#"{
                "bind_address": "127.0.0.1",
                "bind_port": 0,
                "max_block_szx": 9,
                "discovery": { "address": "127.0.0.1", "port": 6000, "interval_secs": 0 },
                "transmission": { "ack_timeout_ms": 50 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.bind_socket_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.discovery_socket_addr().unwrap(), "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.discovery_interval(), None);
        assert_eq!(config.transmission.ack_timeout(), Duration::from_millis(50));
        assert_eq!(config.transmission.max_retransmit, 4);
        // Clamping is the endpoint's job; the raw value is kept
        assert_eq!(config.max_block_szx, 9);
    }

    #[test]
    fn test_invalid_addresses_are_config_errors() {
        let mut config = GatewayConfig::default();
        config.bind_address = "not-an-ip".into();
        assert!(matches!(config.bind_socket_addr(), Err(CoapError::Config(_))));
        config.discovery.interface = "::1".into();
        assert!(matches!(config.discovery_interface(), Err(CoapError::Config(_))));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(GatewayConfig::from_json("{ nope"), Err(CoapError::Json(_))));
    }
}
