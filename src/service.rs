use hickory_proto::error::ProtoError;
use hickory_proto::rr::Name;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::time::SystemTime;

/// Default record TTL for PTR/SRV/TXT announcements (RFC 6762 section 10).
pub const DEFAULT_TTL: u32 = 3200;

/// A/AAAA records are announced with a short TTL so listeners pick up
/// address changes quickly (RFC 6762 section 10).
pub(crate) const HOST_RECORD_TTL: u32 = 120;

/// A single DNS-SD service instance, either published by a responder or
/// assembled by a resolver from the records of one datagram.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceEntry {
    /// Human-readable instance label, e.g. `"MyPrinter"`.
    pub instance: String,
    /// Service type, e.g. `"_ipp._tcp"`.
    pub service: String,
    /// Subtype labels without the `_sub` suffix.
    pub subtypes: Vec<String>,
    /// Trailing domain, `"local"` unless overridden.
    pub domain: String,
    /// Fully qualified host name, trailing dot canonical.
    pub hostname: String,
    pub port: u16,
    /// Raw TXT strings in insertion order.
    pub text: Vec<String>,
    pub addr_v4: Vec<Ipv4Addr>,
    pub addr_v6: Vec<Ipv6Addr>,
    pub ttl: u32,
    /// Wall-clock staleness deadline, set by the resolver only.
    pub expiry: Option<SystemTime>,
    /// Last observed cache-flush bit on a defining record, resolver only.
    pub cache_flush: bool,
}

impl ServiceEntry {
    pub fn new(instance: &str, service: &str, domain: &str) -> Self {
        let domain = trim_dot(domain);
        Self {
            instance: trim_dot(instance).to_string(),
            service: trim_dot(service).to_string(),
            domain: if domain.is_empty() {
                "local".to_string()
            } else {
                domain.to_string()
            },
            ttl: DEFAULT_TTL,
            ..Self::default()
        }
    }

    /// `"<service>.<domain>."`, the PTR owner for browsing.
    pub fn service_name(&self) -> String {
        format!("{}.{}.", self.service, self.domain)
    }

    /// `"<instance>.<service>.<domain>."`, the owner of SRV and TXT.
    pub fn service_instance_name(&self) -> String {
        format!("{}.{}", self.instance, self.service_name())
    }

    /// `"_services._dns-sd._udp.<domain>."` for service type enumeration
    /// (RFC 6763 section 9).
    pub fn service_type_name(&self) -> String {
        format!("_services._dns-sd._udp.{}.", self.domain)
    }

    /// One `"<subtype>._sub.<service>.<domain>."` per configured subtype.
    pub fn subtype_names(&self) -> Vec<String> {
        self.subtypes
            .iter()
            .map(|s| format!("{}._sub.{}", s, self.service_name()))
            .collect()
    }

    /// The TXT strings as they go on the wire: every string split into
    /// chunks of at most 255 bytes, and an empty set represented as one
    /// zero-length string so the TXT record exists (RFC 6763 section 6.1).
    pub fn txt_records(&self) -> Vec<String> {
        txt_records(&self.text)
    }

    pub(crate) fn push_addr_v4(&mut self, addr: Ipv4Addr) {
        if !self.addr_v4.contains(&addr) {
            self.addr_v4.push(addr);
        }
    }

    pub(crate) fn push_addr_v6(&mut self, addr: Ipv6Addr) {
        if !self.addr_v6.contains(&addr) {
            self.addr_v6.push(addr);
        }
    }
}

/// The entry's derived names parsed once, so engines compare and compose
/// wire names without re-parsing on every datagram.
#[derive(Debug, Clone)]
pub(crate) struct ServiceNames {
    pub service: Name,
    pub instance: Name,
    pub service_type: Name,
    pub host: Name,
    pub subtypes: Vec<Name>,
}

impl ServiceNames {
    pub fn for_entry(entry: &ServiceEntry) -> Result<Self, ProtoError> {
        Ok(Self {
            service: Name::from_utf8(entry.service_name())?,
            instance: Name::from_utf8(entry.service_instance_name())?,
            service_type: Name::from_utf8(entry.service_type_name())?,
            host: Name::from_utf8(&entry.hostname)?,
            subtypes: entry
                .subtype_names()
                .iter()
                .map(|n| Name::from_utf8(n))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Splits a `"<service>,<sub1>,<sub2>"` argument into the service type and
/// its subtype labels.
pub(crate) fn parse_subtypes(service: &str) -> (String, Vec<String>) {
    let mut parts = service.split(',').map(str::to_string);
    let service = parts.next().unwrap_or_default();
    (service, parts.collect())
}

pub(crate) fn trim_dot(s: &str) -> &str {
    s.trim_matches('.')
}

/// Appends the domain to a host name that lacks it and makes the trailing
/// dot canonical.
pub(crate) fn qualify_hostname(host: &str, domain: &str) -> String {
    let host = trim_dot(host);
    let domain = trim_dot(domain);
    if host.to_ascii_lowercase().ends_with(&domain.to_ascii_lowercase()) {
        format!("{}.", host)
    } else {
        format!("{}.{}.", host, domain)
    }
}

pub(crate) fn txt_records(text: &[String]) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    text.iter().flat_map(|s| chunks(s, 255)).collect()
}

/// Splits a string into pieces of at most `size` bytes, cutting only at
/// character boundaries.
fn chunks(s: &str, size: usize) -> Vec<String> {
    if s.len() <= size {
        return vec![s.to_string()];
    }
    let mut out = Vec::with_capacity(s.len() / size + 1);
    let mut start = 0;
    let mut end = 0;
    for (index, character) in s.char_indices() {
        if index + character.len_utf8() - start > size {
            out.push(s[start..end].to_string());
            start = end;
        }
        end = index + character.len_utf8();
    }
    out.push(s[start..].to_string());
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derived_names() {
        let entry = ServiceEntry::new("Printer", "_ipp._tcp", "local");
        assert_eq!(entry.service_name(), "_ipp._tcp.local.");
        assert_eq!(entry.service_instance_name(), "Printer._ipp._tcp.local.");
        assert_eq!(entry.service_type_name(), "_services._dns-sd._udp.local.");
    }

    #[test]
    fn subtype_names() {
        let mut entry = ServiceEntry::new("Printer", "_ipp._tcp", "local");
        entry.subtypes = vec!["_color".to_string()];
        assert_eq!(entry.subtype_names(), vec!["_color._sub._ipp._tcp.local."]);
    }

    #[test]
    fn dots_are_trimmed_and_domain_defaults() {
        let entry = ServiceEntry::new("Printer.", "_ipp._tcp.", "");
        assert_eq!(entry.domain, "local");
        assert_eq!(entry.service_instance_name(), "Printer._ipp._tcp.local.");
    }

    #[test]
    fn parse_subtypes_splits_on_commas() {
        let (service, subtypes) = parse_subtypes("_ipp._tcp,_color,_duplex");
        assert_eq!(service, "_ipp._tcp");
        assert_eq!(subtypes, vec!["_color", "_duplex"]);

        let (service, subtypes) = parse_subtypes("_ipp._tcp");
        assert_eq!(service, "_ipp._tcp");
        assert!(subtypes.is_empty());
    }

    #[test]
    fn qualify_hostname_appends_missing_domain() {
        assert_eq!(qualify_hostname("printer", "local"), "printer.local.");
        assert_eq!(qualify_hostname("printer.local", "local"), "printer.local.");
        assert_eq!(qualify_hostname("printer.local.", "local."), "printer.local.");
    }

    #[test]
    fn empty_txt_is_one_empty_string() {
        assert_eq!(txt_records(&[]), vec![String::new()]);
    }

    #[test]
    fn long_txt_values_are_chunked() {
        let value = "x".repeat(600);
        let records = txt_records(&[value]);
        assert_eq!(
            records.iter().map(String::len).collect::<Vec<_>>(),
            vec![255, 255, 90]
        );
    }

    #[test]
    fn chunking_respects_character_boundaries() {
        let value = "é".repeat(200);
        for chunk in txt_records(&[value.clone()]) {
            assert!(chunk.len() <= 255);
        }
        assert_eq!(txt_records(&[value.clone()]).concat(), value);
    }

    #[test]
    fn addresses_deduplicate_by_value() {
        let mut entry = ServiceEntry::new("Printer", "_ipp._tcp", "local");
        entry.push_addr_v4("192.168.1.2".parse().unwrap());
        entry.push_addr_v4("192.168.1.2".parse().unwrap());
        assert_eq!(entry.addr_v4.len(), 1);
    }
}
