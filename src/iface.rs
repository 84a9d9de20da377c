use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// A network interface together with the unicast addresses configured on it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetInterface {
    /// OS interface index, used to address multicast joins and sends.
    pub index: u32,
    pub name: String,
    pub v4: Vec<Ipv4Addr>,
    pub v6_global: Vec<Ipv6Addr>,
    pub v6_link_local: Vec<Ipv6Addr>,
}

impl NetInterface {
    /// Addresses eligible for A/AAAA records on this interface: loopback is
    /// never advertised, and link-local IPv6 is only used when the
    /// interface has no global unicast IPv6 address.
    pub fn addrs(&self) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
        let v6 = if self.v6_global.is_empty() {
            self.v6_link_local.clone()
        } else {
            self.v6_global.clone()
        };
        (self.v4.clone(), v6)
    }
}

/// Enumerates the interfaces that are candidates for mDNS traffic.
///
/// Interfaces whose only addresses are loopback are reported too; joining
/// the multicast group on them simply fails and gets skipped downstream.
pub fn multicast_interfaces() -> std::io::Result<Vec<NetInterface>> {
    let mut by_name: BTreeMap<String, NetInterface> = BTreeMap::new();
    for candidate in if_addrs::get_if_addrs()? {
        if skip_interface(&candidate.name) {
            continue;
        }
        let entry = by_name
            .entry(candidate.name.clone())
            .or_insert_with(|| NetInterface {
                index: candidate.index.unwrap_or(0),
                name: candidate.name.clone(),
                ..NetInterface::default()
            });
        let ip = candidate.ip();
        if ip.is_loopback() {
            continue;
        }
        match ip {
            IpAddr::V4(v4) => {
                if !entry.v4.contains(&v4) {
                    entry.v4.push(v4);
                }
            }
            IpAddr::V6(v6) if is_link_local_v6(&v6) => {
                if !entry.v6_link_local.contains(&v6) {
                    entry.v6_link_local.push(v6);
                }
            }
            IpAddr::V6(v6) if v6.is_multicast() || v6.is_unspecified() => {}
            IpAddr::V6(v6) => {
                if !entry.v6_global.contains(&v6) {
                    entry.v6_global.push(v6);
                }
            }
        }
    }
    Ok(by_name.into_values().collect())
}

#[cfg(windows)]
fn skip_interface(name: &str) -> bool {
    // Multicast sends on this adapter fail spuriously.
    name == "Teredo Tunneling Pseudo-Interface"
}

#[cfg(not(windows))]
fn skip_interface(_name: &str) -> bool {
    false
}

fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}
