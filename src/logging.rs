//! Logging setup.
//!
//! Library code logs through the `log` macros with `target:` set to the component
//! (`"Codec"`, `"Endpoint"`, `"Discovery"`, `"Service"`, `"Transport"`, `"Scheduler"`).
//! Binaries call [`init`] once to print those records as `[LEVEL] [component] message`.

use log::LevelFilter;
use std::io::Write;

/// Install the console logger at `info`, overridable through `RUST_LOG`.
pub fn init() {
    init_with_level(LevelFilter::Info);
}

/// Install the console logger. Later calls are ignored.
pub fn init_with_level(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            let level_str = match record.level() {
                log::Level::Error => "ERROR",
                log::Level::Warn => "WARN ",
                log::Level::Info => "INFO ",
                log::Level::Debug => "DEBUG",
                log::Level::Trace => "TRACE",
            };
            writeln!(buf, "[{}] [{}] {}", level_str, record.target(), record.args())
        })
        .try_init();
}

/// Hex dump of a datagram, logged at trace when the `packet-dump` feature is on
#[cfg(feature = "packet-dump")]
pub fn dump_packet(direction: &str, peer: std::net::SocketAddr, data: &[u8]) {
    let hex: Vec<String> = data.iter().map(|b| format!("{:02x}", b)).collect();
    log::trace!(target: "Transport", "{} {} ({} bytes): {}", direction, peer, data.len(), hex.join(" "));
}

#[cfg(not(feature = "packet-dump"))]
#[inline]
pub fn dump_packet(_direction: &str, _peer: std::net::SocketAddr, _data: &[u8]) {}
