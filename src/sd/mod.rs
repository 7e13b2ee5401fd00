//! # Resource Discovery Module
//!
//! CoRE link-format handling and the directory of resources advertised by peers.
//!
//! ## Key Types
//!
//! - [`ResourceDiscovery`] - periodic NON GET of `/.well-known/core` to the discovery address
//! - [`LinkFormatDirectory`] - per-device resource snapshots with diff updates
//! - [`parse_link_format`] / [`to_link_format`] - the `<uri>;attr=value,...` text format

pub mod directory;
pub mod discovery;
pub mod link_format;

pub use directory::{DirectoryUpdate, KnownDevice, LinkFormatDirectory};
pub use discovery::ResourceDiscovery;
pub use link_format::{parse_link_format, to_link_format};
