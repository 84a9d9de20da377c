mod iface;
mod resolver;
mod responder;
mod service;
mod transport;

use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

pub use iface::multicast_interfaces;
pub use iface::NetInterface;
pub use resolver::browse;
pub use resolver::lookup;
pub use resolver::ResolveError;
pub use resolver::ResolverOptions;
pub use responder::register;
pub use responder::register_proxy;
pub use responder::RegisterError;
pub use responder::Responder;
pub use responder::ResponderOptions;
pub use service::ServiceEntry;
pub use service::DEFAULT_TTL;
pub use transport::IpVariant;
pub use transport::TransportError;

/// IPv4 multicast group reserved for mDNS (RFC 6762 section 3).
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// IPv6 link-local multicast group reserved for mDNS (RFC 6762 section 3).
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// UDP port shared by mDNS queriers and responders.
pub const MDNS_PORT: u16 = 5353;
