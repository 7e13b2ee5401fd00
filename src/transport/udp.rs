use super::traits::CoapTransport;
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Error, ErrorKind, Result};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long a blocking receive waits before giving the loop a chance to see `close`
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct UdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(DEFAULT_POLL_INTERVAL))?;
        Ok(UdpTransport { socket, closed: AtomicBool::new(false) })
    }

    /// Bind with SO_REUSEADDR so several processes on one host can share the
    /// discovery port, then join `group` on `interface`.
    pub fn new_multicast(bind_addr: SocketAddr, group: Ipv4Addr, interface: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_multicast_loop_v4(true)?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(DEFAULT_POLL_INTERVAL))?;
        debug!(target: "Transport", "Joined multicast group {} on {}", group, interface);
        Ok(UdpTransport { socket, closed: AtomicBool::new(false) })
    }

    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        self.socket.set_read_timeout(Some(timeout))
    }

    pub fn set_multicast_if_v4(&self, interface: &Ipv4Addr) -> Result<()> {
        let socket = socket2::SockRef::from(&self.socket);
        socket.set_multicast_if_v4(interface)
    }
}

impl CoapTransport for UdpTransport {
    fn send(&self, data: &[u8], destination: SocketAddr) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::NotConnected, "transport closed"));
        }
        self.socket.send_to(data, destination)
    }

    fn receive(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::NotConnected, "transport closed"));
        }
        self.socket.recv_from(buffer)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_send_receive() {
        let a = UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap();
        b.set_read_timeout(Duration::from_secs(2)).unwrap();

        a.send(b"ping", b.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let (len, src) = b.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(src, a.local_addr().unwrap());
    }

    #[test]
    fn test_receive_times_out() {
        let a = UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let err = a.receive(&mut buf).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
    }

    #[test]
    fn test_closed_transport_refuses_io() {
        let a = UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap();
        let dest = a.local_addr().unwrap();
        a.close();
        assert!(a.is_closed());
        assert_eq!(a.send(b"x", dest).unwrap_err().kind(), ErrorKind::NotConnected);
        let mut buf = [0u8; 4];
        assert_eq!(a.receive(&mut buf).unwrap_err().kind(), ErrorKind::NotConnected);
    }
}
