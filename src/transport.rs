use crate::iface::NetInterface;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::FutureExt;
use futures_util::StreamExt;
use hickory_proto::op::Message;
use mockall::automock;
use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::net::SocketAddrV6;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;

const MAX_DATAGRAM_SIZE: usize = 65536;

/// IP traffic the transport binds for. Records of the other family may
/// still arrive inside datagrams of the selected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVariant {
    V4,
    V6,
    #[default]
    Both,
}

impl IpVariant {
    fn wants_v4(self) -> bool {
        matches!(self, Self::V4 | Self::Both)
    }

    fn wants_v6(self) -> bool {
        matches!(self, Self::V6 | Self::Both)
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no multicast group could be joined on any interface")]
    NoUsableInterface,

    #[error("network I/O failed")]
    Io(#[from] std::io::Error),
}

/// A datagram decoded off the wire, tagged with the interface it arrived on.
#[derive(Debug)]
pub(crate) struct InboundMessage {
    pub message: Message,
    pub interface_index: u32,
    pub source: SocketAddr,
}

/// The send half of the transport as the engines see it.
#[automock]
pub(crate) trait MdnsSender {
    /// Sends to the mDNS group on one interface, or on every joined
    /// interface when `interface_index` is 0.
    fn send_multicast(&self, packet: Arc<[u8]>, interface_index: u32) -> BoxFuture<'static, ()>;

    /// Replies directly to a querier, choosing the socket family by the
    /// destination address.
    fn send_unicast(
        &self,
        packet: Arc<[u8]>,
        to: SocketAddr,
        interface_index: u32,
    ) -> BoxFuture<'static, ()>;
}

#[derive(Debug)]
struct GroupSocket {
    io: Arc<UdpSocket>,
    interface_index: u32,
    is_v6: bool,
}

/// UDP endpoints joined to the mDNS groups, one socket per interface and
/// IP family. Binding the outgoing multicast interface per socket at
/// construction keeps sends stateless, and the socket a datagram arrives
/// on identifies the receiving interface.
#[derive(Debug)]
pub(crate) struct MulticastTransport {
    sockets: Vec<GroupSocket>,
}

impl MulticastTransport {
    pub fn new(interfaces: &[NetInterface], variant: IpVariant) -> Result<Self, TransportError> {
        let mut sockets = Vec::new();
        for interface in interfaces {
            if variant.wants_v4() {
                match Self::join_v4(interface) {
                    Ok(io) => sockets.push(GroupSocket {
                        io: Arc::new(io),
                        interface_index: interface.index,
                        is_v6: false,
                    }),
                    Err(e) => log::debug!(
                        "Skipping IPv4 multicast on interface {}: {}",
                        interface.name,
                        e
                    ),
                }
            }
            if variant.wants_v6() {
                match Self::join_v6(interface) {
                    Ok(io) => sockets.push(GroupSocket {
                        io: Arc::new(io),
                        interface_index: interface.index,
                        is_v6: true,
                    }),
                    Err(e) => log::debug!(
                        "Skipping IPv6 multicast on interface {}: {}",
                        interface.name,
                        e
                    ),
                }
            }
        }
        if sockets.is_empty() {
            return Err(TransportError::NoUsableInterface);
        }
        Ok(Self { sockets })
    }

    fn join_v4(interface: &NetInterface) -> std::io::Result<UdpSocket> {
        let local = *interface.v4.first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no IPv4 address")
        })?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, crate::MDNS_PORT).into())?;
        socket.join_multicast_v4(&crate::MDNS_GROUP_V4, &local)?;
        socket.set_multicast_if_v4(&local)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_ttl_v4(255)?;
        socket.set_nonblocking(true)?;
        log::info!(
            "Joined {} on interface {} via {}",
            crate::MDNS_GROUP_V4,
            interface.name,
            local
        );
        UdpSocket::from_std(socket.into())
    }

    fn join_v6(interface: &NetInterface) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_only_v6(true)?;
        socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, crate::MDNS_PORT, 0, 0).into())?;
        socket.join_multicast_v6(&crate::MDNS_GROUP_V6, interface.index)?;
        socket.set_multicast_if_v6(interface.index)?;
        socket.set_multicast_loop_v6(true)?;
        socket.set_multicast_hops_v6(255)?;
        socket.set_nonblocking(true)?;
        log::info!(
            "Joined {} on interface {}",
            crate::MDNS_GROUP_V6,
            interface.name
        );
        UdpSocket::from_std(socket.into())
    }

    pub async fn multicast(&self, packet: &[u8], interface_index: u32) {
        let matching = self
            .sockets
            .iter()
            .filter(|s| interface_index == 0 || s.interface_index == interface_index);
        for socket in matching {
            let group: SocketAddr = if socket.is_v6 {
                (crate::MDNS_GROUP_V6, crate::MDNS_PORT).into()
            } else {
                (crate::MDNS_GROUP_V4, crate::MDNS_PORT).into()
            };
            if let Err(e) = socket.io.send_to(packet, group).await {
                log::debug!(
                    "Failed to send a multicast datagram on interface {}: {}",
                    socket.interface_index,
                    e
                );
            }
        }
    }

    pub async fn unicast(&self, packet: &[u8], to: SocketAddr, interface_index: u32) {
        let family_matches = |s: &&GroupSocket| s.is_v6 == to.is_ipv6();
        let socket = self
            .sockets
            .iter()
            .filter(family_matches)
            .find(|s| interface_index == 0 || s.interface_index == interface_index)
            .or_else(|| self.sockets.iter().find(family_matches));
        match socket {
            Some(socket) => {
                if let Err(e) = socket.io.send_to(packet, to).await {
                    log::debug!("Failed to send a unicast reply to {}: {}", to, e);
                }
            }
            None => log::debug!("No socket available for a unicast reply to {}", to),
        }
    }

    /// All joined sockets fused into one stream of decoded messages.
    /// Undecodable datagrams and transient receive errors are logged and
    /// skipped.
    pub fn receive(&self) -> BoxStream<'static, InboundMessage> {
        let streams: Vec<_> = self
            .sockets
            .iter()
            .map(|s| Self::receive_on(s.io.clone(), s.interface_index))
            .collect();
        futures_util::stream::select_all(streams).boxed()
    }

    fn receive_on(
        socket: Arc<UdpSocket>,
        interface_index: u32,
    ) -> BoxStream<'static, InboundMessage> {
        futures_util::stream::unfold(socket, move |socket| async move {
            loop {
                let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
                match socket.recv_from(&mut buffer).await {
                    Ok((size, source)) => match Message::from_vec(&buffer[..size]) {
                        Ok(message) => {
                            let inbound = InboundMessage {
                                message,
                                interface_index,
                                source,
                            };
                            return Some((inbound, socket));
                        }
                        Err(e) => {
                            log::debug!("Dropping an undecodable datagram from {}: {}", source, e)
                        }
                    },
                    Err(e) => log::debug!(
                        "Receive failed on interface {}: {}",
                        interface_index,
                        e
                    ),
                }
            }
        })
        .boxed()
    }
}

impl MdnsSender for Arc<MulticastTransport> {
    fn send_multicast(&self, packet: Arc<[u8]>, interface_index: u32) -> BoxFuture<'static, ()> {
        let transport = self.clone();
        async move { transport.multicast(&packet, interface_index).await }.boxed()
    }

    fn send_unicast(
        &self,
        packet: Arc<[u8]>,
        to: SocketAddr,
        interface_index: u32,
    ) -> BoxFuture<'static, ()> {
        let transport = self.clone();
        async move { transport.unicast(&packet, to, interface_index).await }.boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_interface_means_no_transport() {
        crate::test::init();

        let e = MulticastTransport::new(&[], IpVariant::Both).unwrap_err();
        assert!(matches!(e, TransportError::NoUsableInterface));
    }

    #[test]
    fn v4_join_needs_a_v4_address() {
        crate::test::init();

        let interface = NetInterface {
            index: 1,
            name: "v6only".to_string(),
            ..NetInterface::default()
        };
        let e = MulticastTransport::new(&[interface], IpVariant::V4).unwrap_err();
        assert!(matches!(e, TransportError::NoUsableInterface));
    }
}
