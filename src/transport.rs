use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Non-blocking datagram transport the engine runs over. The tick loop
/// polls; implementations must never block in either direction.
pub trait Transport {
    fn send_to(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize>;

    /// Returns one pending datagram, or `None` when nothing is queued.
    fn poll_recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>>;

    fn local_port(&self) -> io::Result<u16>;
}

/// The standard UDP transport: a non-blocking socket bound to all IPv4
/// interfaces.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_nonblocking(true)?;
        Ok(UdpTransport { socket })
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(payload, SocketAddr::V4(dest))
    }

    fn poll_recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
        match self.socket.recv_from(buf) {
            Ok((amount, SocketAddr::V4(src))) => Ok(Some((amount, src))),
            // IPv4-only engine; anything else is dropped
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}
