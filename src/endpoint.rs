use mio::net::UdpSocket;
use std::io;
use std::net::{self, IpAddr, SocketAddr};

/// A non-blocking datagram endpoint. Would-block is reported as `Ok(None)`,
/// distinct from hard I/O errors; datagram boundaries are preserved.
pub struct Endpoint {
    socket: UdpSocket,
}

impl Endpoint {
    /// Binds to `ip`, on an ephemeral port when `port` is `None`.
    pub fn bind(ip: IpAddr, port: Option<u16>) -> io::Result<Endpoint> {
        let socket = net::UdpSocket::bind((ip, port.unwrap_or(0)))?;
        socket.set_nonblocking(true)?;
        Ok(Endpoint {
            socket: UdpSocket::from_socket(socket)?,
        })
    }

    pub fn send_to(&self, bytes: &[u8], peer: &SocketAddr) -> io::Result<Option<usize>> {
        match self.socket.send_to(bytes, peer) {
            Ok(amt) => Ok(Some(amt)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((amt, src)) => Ok(Some((amt, src))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The pollable socket, for readiness registration.
    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_socket_reports_would_block() {
        let ep = Endpoint::bind(IpAddr::from([127, 0, 0, 1]), None).unwrap();
        let mut buf = [0; 16];
        assert!(ep.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn loopback_round_trip() {
        let a = Endpoint::bind(IpAddr::from([127, 0, 0, 1]), None).unwrap();
        let b = Endpoint::bind(IpAddr::from([127, 0, 0, 1]), None).unwrap();
        let b_addr = b.local_addr().unwrap();

        assert_eq!(a.send_to(b"ping", &b_addr).unwrap(), Some(4));

        let mut buf = [0; 16];
        // the datagram may take a moment to surface on a non-blocking socket
        for _ in 0..100 {
            if let Some((amt, src)) = b.recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..amt], b"ping");
                assert_eq!(src, a.local_addr().unwrap());
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("datagram never arrived");
    }
}
