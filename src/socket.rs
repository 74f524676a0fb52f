use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};

/// Bind a nonblocking IPv4 UDP socket and hand it to tokio.
///
/// Traversal is IPv4-only, so every socket in the crate goes through here.
pub(crate) fn bind_udp(addr: SocketAddrV4) -> io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    tokio::net::UdpSocket::from_std(socket.into())
}

pub(crate) fn bind_udp_port(port: u16) -> io::Result<tokio::net::UdpSocket> {
    bind_udp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
}
