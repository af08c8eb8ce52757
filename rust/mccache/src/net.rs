//! Multicast socket construction and local address discovery.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use mccache_config::McCacheConfig;

/// The socket the sender multicasts from.  Bound to an ephemeral port; only
/// the hop limit matters on this side.
pub(crate) fn sender_socket(config: &McCacheConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(config.multicast_hops)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// The socket the listener receives group traffic on.  Reuse-address so
/// several peers can share one host, which is how the loss-injection tests
/// run a whole cluster on one machine.
pub(crate) fn listener_socket(config: &McCacheConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.multicast_port).into())?;
    socket.join_multicast_v4(&config.group(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// The addresses this process answers to, used to ignore our own multicast
/// loopback.  The routing-table trick (connect a throwaway datagram socket
/// and read its local address) needs no hostname lookup and sends nothing.
pub(crate) fn local_addresses(config: &McCacheConfig) -> (Ipv4Addr, HashSet<Ipv4Addr>) {
    let mut addresses = HashSet::from([Ipv4Addr::LOCALHOST]);
    let probe = SocketAddrV4::new(config.group(), config.multicast_port);
    let primary = StdUdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect(probe)?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST);
    addresses.insert(primary);
    (primary, addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses_always_cover_loopback() {
        let (primary, addresses) = local_addresses(&McCacheConfig::default());
        assert!(addresses.contains(&Ipv4Addr::LOCALHOST));
        assert!(addresses.contains(&primary));
    }
}
