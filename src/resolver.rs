use crate::iface;
use crate::iface::NetInterface;
use crate::service;
use crate::service::ServiceEntry;
use crate::transport::InboundMessage;
use crate::transport::IpVariant;
use crate::transport::MdnsSender;
use crate::transport::MulticastTransport;
use crate::transport::TransportError;
use futures_util::stream::BoxStream;
use futures_util::FutureExt;
use futures_util::Stream;
use futures_util::StreamExt;
use futures_util::TryFutureExt;
use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use hickory_proto::op::Query;
use hickory_proto::rr::Name;
use hickory_proto::rr::RData;
use hickory_proto::rr::Record;
use hickory_proto::rr::RecordType;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use thiserror::Error;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
const INITIAL_QUERY_INTERVAL: Duration = Duration::from_secs(4);
const MAX_QUERY_INTERVAL: Duration = Duration::from_secs(60);

/// A delivered entry is repeated only when its expiry moves meaningfully
/// forward, so the same records arriving on several sockets collapse into
/// one delivery.
const REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct ResolverOptions {
    pub ip_variant: IpVariant,
    /// Interfaces to join; empty means every multicast-capable interface.
    pub interfaces: Vec<NetInterface>,
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("missing service name")]
    MissingService,

    #[error("service names do not form valid DNS names")]
    InvalidName(#[from] ProtoError),

    #[error("failed to enumerate network interfaces")]
    Interfaces(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode the query")]
    Pack(#[source] ProtoError),

    #[error("cancelled before any entry was resolved")]
    Cancelled,
}

/// Browses for every instance of a service type. Entries are yielded as
/// they are assembled from inbound records; the stream runs until `cancel`
/// fires or it is dropped.
pub fn browse(
    service: &str,
    domain: &str,
    options: ResolverOptions,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<ServiceEntry, ResolveError>> + Send {
    resolve(LookupParams::new("", service, domain, true), options, cancel)
}

/// Looks up one specific instance of a service type. The periodic query
/// stops after the first delivery; if `cancel` fires before anything was
/// resolved, the stream ends with [`ResolveError::Cancelled`].
pub fn lookup(
    instance: &str,
    service: &str,
    domain: &str,
    options: ResolverOptions,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<ServiceEntry, ResolveError>> + Send {
    resolve(
        LookupParams::new(instance, service, domain, false),
        options,
        cancel,
    )
}

fn resolve(
    params: Result<LookupParams, ResolveError>,
    options: ResolverOptions,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<ServiceEntry, ResolveError>> + Send {
    async move {
        let params = params?;
        let interfaces = if options.interfaces.is_empty() {
            iface::multicast_interfaces().map_err(ResolveError::Interfaces)?
        } else {
            options.interfaces
        };
        let transport = Arc::new(MulticastTransport::new(&interfaces, options.ip_variant)?);
        let inbound = transport.receive();
        Ok(run(params, transport, inbound, cancel))
    }
    .try_flatten_stream()
}

fn run(
    params: LookupParams,
    sender: impl MdnsSender + Send + Sync + 'static,
    inbound: BoxStream<'static, InboundMessage>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<ServiceEntry, ResolveError>> + Send {
    let stop_probing = CancellationToken::new();
    let delivered = Arc::new(AtomicBool::new(false));
    let fuser = Fuser::new(params.clone(), stop_probing.clone(), delivered.clone());
    let ticks = IntervalStream::new(interval_at(
        Instant::now() + CLEANUP_INTERVAL,
        CLEANUP_INTERVAL,
    ))
    .map(|_| Event::Cleanup);
    let events = futures_util::stream::select(inbound.map(Event::Inbound), ticks);
    let deliveries = events
        .scan(fuser, |fuser, event| {
            futures_util::future::ready(Some(fuser.handle(event)))
        })
        .flat_map(futures_util::stream::iter)
        .map(Ok);
    let queries = send_queries(sender, params.clone(), stop_probing, cancel.clone());
    let browsing = params.browsing;
    with_queries(queries, deliveries)
        .take_until(cancel.cancelled_owned())
        .chain(
            futures_util::stream::once(async move {
                if !browsing && !delivered.load(Ordering::Relaxed) {
                    Some(Err(ResolveError::Cancelled))
                } else {
                    None
                }
            })
            .filter_map(futures_util::future::ready),
        )
}

/// Runs the delivery stream while the periodic query task drives the
/// network in the background; a query failure surfaces as a stream error.
fn with_queries<F, S>(
    queries: F,
    deliveries: S,
) -> impl Stream<Item = Result<ServiceEntry, ResolveError>> + Send
where
    F: Future<Output = Result<(), ResolveError>> + Send + 'static,
    S: Stream<Item = Result<ServiceEntry, ResolveError>> + Send + 'static,
{
    let surfaced = queries
        .into_stream()
        .filter_map(|outcome| futures_util::future::ready(outcome.err().map(Err)));
    futures_util::stream::select(deliveries, surfaced)
}

/// Sends the query immediately and then keeps re-querying at exponentially
/// increasing jittered intervals, capped at one minute, until a matching
/// entry was resolved or the caller cancels.
async fn send_queries(
    sender: impl MdnsSender,
    params: LookupParams,
    stop_probing: CancellationToken,
    cancel: CancellationToken,
) -> Result<(), ResolveError> {
    let packet: Arc<[u8]> = compose_query(&params)
        .to_vec()
        .map_err(ResolveError::Pack)?
        .into();
    let mut interval = INITIAL_QUERY_INTERVAL;
    loop {
        sender.send_multicast(packet.clone(), 0).await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_probing.cancelled() => return Ok(()),
            _ = cancel.cancelled() => return Ok(()),
        }
        if interval < MAX_QUERY_INTERVAL {
            let jitter =
                Duration::from_millis(rand::thread_rng().gen_range(0..interval.as_millis() as u64));
            interval = (interval + jitter + interval / 2).min(MAX_QUERY_INTERVAL);
        }
    }
}

fn compose_query(params: &LookupParams) -> Message {
    let mut message = Message::new();
    message.set_recursion_desired(false);
    match (&params.instance, &params.subtype) {
        (Some(instance), _) => {
            message.add_query(Query::query(instance.clone(), RecordType::SRV));
            message.add_query(Query::query(instance.clone(), RecordType::TXT));
            message.add_query(Query::query(instance.clone(), RecordType::ANY));
        }
        (None, Some(subtype)) => {
            message.add_query(Query::query(subtype.clone(), RecordType::PTR));
        }
        (None, None) => {
            message.add_query(Query::query(params.service.clone(), RecordType::PTR));
        }
    }
    message
}

#[derive(Clone, Debug)]
struct LookupParams {
    /// Browsing PTR owner, `"<service>.<domain>."`.
    service: Name,
    /// SRV/TXT owner when looking up one instance.
    instance: Option<Name>,
    /// First subtype name when browsing a subtype.
    subtype: Option<Name>,
    service_label: String,
    domain: String,
    browsing: bool,
}

impl LookupParams {
    fn new(
        instance: &str,
        service: &str,
        domain: &str,
        browsing: bool,
    ) -> Result<Self, ResolveError> {
        let (service_label, subtypes) = service::parse_subtypes(service);
        let entry = ServiceEntry::new(instance, &service_label, domain);
        if entry.service.is_empty() {
            return Err(ResolveError::MissingService);
        }
        let service_name = Name::from_utf8(entry.service_name())?;
        let instance_name = if entry.instance.is_empty() {
            None
        } else {
            Some(Name::from_utf8(entry.service_instance_name())?)
        };
        let subtype = match subtypes.first() {
            Some(subtype) => Some(Name::from_utf8(format!(
                "{}._sub.{}",
                service::trim_dot(subtype),
                entry.service_name()
            ))?),
            None => None,
        };
        Ok(Self {
            service: service_name,
            instance: instance_name,
            subtype,
            service_label: entry.service,
            domain: entry.domain,
            browsing,
        })
    }
}

enum Event {
    Inbound(InboundMessage),
    Cleanup,
}

/// Assembles the records of each datagram into service entries and decides
/// which of them the subscriber has not seen yet.
struct Fuser {
    params: LookupParams,
    sent: HashMap<Name, ServiceEntry>,
    stop_probing: CancellationToken,
    delivered: Arc<AtomicBool>,
}

impl Fuser {
    fn new(
        params: LookupParams,
        stop_probing: CancellationToken,
        delivered: Arc<AtomicBool>,
    ) -> Self {
        Self {
            params,
            sent: HashMap::new(),
            stop_probing,
            delivered,
        }
    }

    fn handle(&mut self, event: Event) -> Vec<ServiceEntry> {
        match event {
            Event::Inbound(inbound) => self.fuse(inbound.message),
            Event::Cleanup => {
                let now = SystemTime::now();
                self.sent.retain(|_, entry| entry.expiry.is_some_and(|e| e > now));
                Vec::new()
            }
        }
    }

    fn fuse(&mut self, message: Message) -> Vec<ServiceEntry> {
        let now = SystemTime::now();
        let mut entries: HashMap<Name, ServiceEntry> = HashMap::new();
        let sections: Vec<&Record> = message
            .answers()
            .iter()
            .chain(message.name_servers().iter())
            .chain(message.additionals().iter())
            .collect();

        for record in &sections {
            let ttl = Duration::from_secs(record.ttl().into());
            let flush = record.mdns_cache_flush();
            match record.data() {
                Some(RData::PTR(ptr)) => {
                    if *record.name() != self.params.service {
                        continue;
                    }
                    if let Some(instance) = &self.params.instance {
                        if *instance != ptr.0 {
                            continue;
                        }
                    }
                    let entry = self.entry_for(&mut entries, &ptr.0);
                    entry.expiry = Some(now + ttl);
                    entry.cache_flush = flush;
                }
                Some(RData::SRV(srv)) => {
                    if !self.matches_instance(record.name()) {
                        continue;
                    }
                    let entry = self.entry_for(&mut entries, record.name());
                    entry.hostname = srv.target().to_string();
                    entry.port = srv.port();
                    entry.expiry = Some(now + ttl);
                    entry.cache_flush = flush;
                }
                Some(RData::TXT(txt)) => {
                    if !self.matches_instance(record.name()) {
                        continue;
                    }
                    let entry = self.entry_for(&mut entries, record.name());
                    entry.text = txt
                        .txt_data()
                        .iter()
                        .map(|s| String::from_utf8_lossy(s).into_owned())
                        .collect();
                    entry.expiry = Some(now + ttl);
                    entry.cache_flush = flush;
                }
                _ => {}
            }
        }

        // Second pass: address records bind by host name, which the SRV
        // records of this datagram have set by now.
        for record in &sections {
            match record.data() {
                Some(RData::A(a)) => {
                    for entry in entries.values_mut() {
                        if host_matches(&entry.hostname, record.name()) {
                            entry.push_addr_v4(a.0);
                        }
                    }
                }
                Some(RData::AAAA(aaaa)) => {
                    for entry in entries.values_mut() {
                        if host_matches(&entry.hostname, record.name()) {
                            entry.push_addr_v6(aaaa.0);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut out = Vec::new();
        for (key, entry) in entries {
            let Some(expiry) = entry.expiry else {
                continue;
            };
            if expiry <= now {
                self.sent.remove(&key);
                continue;
            }
            // Without an SRV there is no host and no port to connect to.
            if entry.hostname.is_empty() || entry.port == 0 {
                continue;
            }
            if let Some(previous) = self.sent.get(&key) {
                let refreshed = previous
                    .expiry
                    .is_none_or(|prior| expiry >= prior + REFRESH_THRESHOLD);
                if !refreshed && !entry.cache_flush {
                    continue;
                }
            }
            if !self.params.browsing {
                self.stop_probing.cancel();
            }
            self.delivered.store(true, Ordering::Relaxed);
            self.sent.insert(key, entry.clone());
            out.push(entry);
        }
        out
    }

    fn entry_for<'a>(
        &self,
        entries: &'a mut HashMap<Name, ServiceEntry>,
        key: &Name,
    ) -> &'a mut ServiceEntry {
        entries.entry(key.clone()).or_insert_with(|| {
            let instance = key
                .iter()
                .next()
                .map(|label| String::from_utf8_lossy(label).into_owned())
                .unwrap_or_default();
            ServiceEntry::new(&instance, &self.params.service_label, &self.params.domain)
        })
    }

    fn matches_instance(&self, owner: &Name) -> bool {
        match &self.params.instance {
            Some(instance) => instance == owner,
            None => self.params.service.zone_of(owner),
        }
    }
}

fn host_matches(hostname: &str, name: &Name) -> bool {
    !hostname.is_empty() && name.to_string().eq_ignore_ascii_case(hostname)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::MockMdnsSender;
    use hickory_proto::rr::rdata;
    use std::net::Ipv4Addr;

    fn browse_params() -> LookupParams {
        LookupParams::new("", "_ipp._tcp", "local", true).unwrap()
    }

    fn lookup_params() -> LookupParams {
        LookupParams::new("Printer", "_ipp._tcp", "local", false).unwrap()
    }

    fn new_fuser(params: LookupParams) -> Fuser {
        Fuser::new(
            params,
            CancellationToken::new(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn name(value: &str) -> Name {
        Name::from_utf8(value).unwrap()
    }

    fn record(owner: &str, ttl: u32, flush: bool, rdata: RData) -> Record {
        let mut record = Record::from_rdata(name(owner), ttl, rdata);
        record.set_mdns_cache_flush(flush);
        record
    }

    fn full_datagram(instance: &str, ttl: u32, flush: bool) -> Message {
        let owner = format!("{}._ipp._tcp.local.", instance);
        let mut message = Message::new();
        message.add_answer(record(
            "_ipp._tcp.local.",
            ttl,
            false,
            RData::PTR(rdata::PTR(name(&owner))),
        ));
        message.add_answer(record(
            &owner,
            ttl,
            flush,
            RData::SRV(rdata::SRV::new(0, 0, 631, name("printhost.local."))),
        ));
        message.add_answer(record(
            &owner,
            ttl,
            flush,
            RData::TXT(rdata::TXT::new(vec!["rp=ipp/print".to_string()])),
        ));
        message.add_additional(record(
            "printhost.local.",
            120,
            flush,
            RData::A(rdata::A::from("192.168.1.2".parse::<Ipv4Addr>().unwrap())),
        ));
        message
    }

    #[test]
    fn one_datagram_yields_one_complete_entry() {
        crate::test::init();

        let mut fuser = new_fuser(browse_params());

        // When
        let delivered = fuser.fuse(full_datagram("Printer", 3200, false));

        // Then
        assert_eq!(delivered.len(), 1);
        let entry = &delivered[0];
        assert_eq!(entry.instance, "Printer");
        assert_eq!(entry.service, "_ipp._tcp");
        assert_eq!(entry.domain, "local");
        assert_eq!(entry.hostname, "printhost.local.");
        assert_eq!(entry.port, 631);
        assert_eq!(entry.text, vec!["rp=ipp/print".to_string()]);
        assert_eq!(entry.addr_v4, vec!["192.168.1.2".parse::<Ipv4Addr>().unwrap()]);
        assert!(entry.expiry.is_some());
    }

    #[test]
    fn addresses_bind_no_matter_where_they_appear() {
        crate::test::init();

        let owner = "Printer._ipp._tcp.local.";
        let mut message = Message::new();
        message.add_answer(record(
            "printhost.local.",
            120,
            false,
            RData::A(rdata::A::from("192.168.1.2".parse::<Ipv4Addr>().unwrap())),
        ));
        message.add_answer(record(
            owner,
            3200,
            false,
            RData::SRV(rdata::SRV::new(0, 0, 631, name("printhost.local."))),
        ));

        // When
        let delivered = new_fuser(browse_params()).fuse(message);

        // Then
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].addr_v4,
            vec!["192.168.1.2".parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[test]
    fn lookup_ignores_other_instances() {
        crate::test::init();

        let mut fuser = new_fuser(lookup_params());

        // When, Then
        assert!(fuser.fuse(full_datagram("Other", 3200, false)).is_empty());
        assert_eq!(fuser.fuse(full_datagram("Printer", 3200, false)).len(), 1);
    }

    #[test]
    fn a_pointer_alone_is_not_deliverable() {
        crate::test::init();

        let mut message = Message::new();
        message.add_answer(record(
            "_ipp._tcp.local.",
            3200,
            false,
            RData::PTR(rdata::PTR(name("Printer._ipp._tcp.local."))),
        ));

        // When, Then
        assert!(new_fuser(browse_params()).fuse(message).is_empty());
    }

    #[test]
    fn duplicate_datagrams_deliver_once() {
        crate::test::init();

        let mut fuser = new_fuser(browse_params());

        // When, Then
        assert_eq!(fuser.fuse(full_datagram("Printer", 3200, false)).len(), 1);
        assert!(fuser.fuse(full_datagram("Printer", 3200, false)).is_empty());
    }

    #[test]
    fn cache_flush_forces_redelivery() {
        crate::test::init();

        let mut fuser = new_fuser(browse_params());

        // When, Then
        assert_eq!(fuser.fuse(full_datagram("Printer", 3200, false)).len(), 1);
        assert_eq!(fuser.fuse(full_datagram("Printer", 3200, true)).len(), 1);
    }

    #[test]
    fn goodbye_evicts_the_delivered_entry() {
        crate::test::init();

        let mut fuser = new_fuser(browse_params());
        assert_eq!(fuser.fuse(full_datagram("Printer", 3200, false)).len(), 1);

        // When: a goodbye with TTL 0 arrives.
        assert!(fuser.fuse(full_datagram("Printer", 0, false)).is_empty());

        // Then: the instance may be delivered anew.
        assert_eq!(fuser.fuse(full_datagram("Printer", 3200, false)).len(), 1);
    }

    #[test]
    fn cleanup_evicts_expired_deliveries() {
        crate::test::init();

        let mut fuser = new_fuser(browse_params());
        let mut stale = ServiceEntry::new("Printer", "_ipp._tcp", "local");
        stale.expiry = Some(SystemTime::now() - Duration::from_secs(1));
        fuser
            .sent
            .insert(name("Printer._ipp._tcp.local."), stale);

        // When
        let delivered = fuser.handle(Event::Cleanup);

        // Then
        assert!(delivered.is_empty());
        assert!(fuser.sent.is_empty());
    }

    #[test]
    fn first_lookup_delivery_stops_the_probing() {
        crate::test::init();

        let stop_probing = CancellationToken::new();
        let mut fuser = Fuser::new(
            lookup_params(),
            stop_probing.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        // When
        fuser.fuse(full_datagram("Printer", 3200, false));

        // Then
        assert!(stop_probing.is_cancelled());
    }

    #[test]
    fn browsing_never_stops_the_probing() {
        crate::test::init();

        let stop_probing = CancellationToken::new();
        let mut fuser = Fuser::new(
            browse_params(),
            stop_probing.clone(),
            Arc::new(AtomicBool::new(false)),
        );

        // When
        fuser.fuse(full_datagram("Printer", 3200, false));

        // Then
        assert!(!stop_probing.is_cancelled());
    }

    #[test]
    fn instance_lookup_asks_for_srv_txt_and_any() {
        let query = compose_query(&lookup_params());

        let queries = query.queries();
        assert_eq!(queries.len(), 3);
        let expected = name("Printer._ipp._tcp.local.");
        for question in queries {
            assert_eq!(*question.name(), expected);
        }
        let types: Vec<_> = queries.iter().map(Query::query_type).collect();
        assert_eq!(types, vec![RecordType::SRV, RecordType::TXT, RecordType::ANY]);
        assert!(!query.recursion_desired());
    }

    #[test]
    fn browse_asks_for_the_service_pointer() {
        let query = compose_query(&browse_params());

        let queries = query.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(*queries[0].name(), name("_ipp._tcp.local."));
        assert_eq!(queries[0].query_type(), RecordType::PTR);
    }

    #[test]
    fn subtype_browse_asks_for_the_subtype_pointer() {
        let params = LookupParams::new("", "_ipp._tcp,_color", "local", true).unwrap();

        let query = compose_query(&params);

        let queries = query.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(*queries[0].name(), name("_color._sub._ipp._tcp.local."));
        assert_eq!(queries[0].query_type(), RecordType::PTR);
    }

    #[test]
    fn empty_service_is_rejected() {
        let e = LookupParams::new("", "", "local", true).unwrap_err();
        assert!(matches!(e, ResolveError::MissingService));
    }

    #[tokio::test]
    async fn the_first_query_goes_out_immediately() {
        crate::test::init();

        let mut sender = MockMdnsSender::new();
        sender
            .expect_send_multicast()
            .withf(|packet, interface_index| {
                *interface_index == 0 && Message::from_vec(packet).unwrap().queries().len() == 1
            })
            .times(1)
            .returning(|_, _| async {}.boxed());
        let stop_probing = CancellationToken::new();
        stop_probing.cancel();

        // When
        let outcome = send_queries(
            sender,
            browse_params(),
            stop_probing,
            CancellationToken::new(),
        )
        .await;

        // Then
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn a_cancelled_lookup_reports_the_missing_entry() {
        crate::test::init();

        let mut sender = MockMdnsSender::new();
        sender
            .expect_send_multicast()
            .returning(|_, _| async {}.boxed());
        let cancel = CancellationToken::new();
        cancel.cancel();

        // When
        let items: Vec<_> = run(
            lookup_params(),
            sender,
            futures_util::stream::pending::<InboundMessage>().boxed(),
            cancel,
        )
        .collect()
        .await;

        // Then
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ResolveError::Cancelled)));
    }

    #[tokio::test]
    async fn a_cancelled_browse_ends_quietly() {
        crate::test::init();

        let mut sender = MockMdnsSender::new();
        sender
            .expect_send_multicast()
            .returning(|_, _| async {}.boxed());
        let cancel = CancellationToken::new();
        cancel.cancel();

        // When
        let items: Vec<_> = run(
            browse_params(),
            sender,
            futures_util::stream::pending::<InboundMessage>().boxed(),
            cancel,
        )
        .collect()
        .await;

        // Then
        assert!(items.is_empty());
    }
}
