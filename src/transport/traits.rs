use std::io::Result;
use std::net::SocketAddr;

/// Datagram channel the endpoint sends and receives CoAP messages on.
/// Object-safe so tests and alternative sockets can be plugged in.
pub trait CoapTransport: Send + Sync {
    /// Send one datagram to `destination`.
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<usize>;

    /// Receive one datagram. Returns `ErrorKind::WouldBlock`/`TimedOut` when the
    /// poll interval elapsed without traffic.
    fn receive(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Refuse further sends and make `receive` return `NotConnected`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
