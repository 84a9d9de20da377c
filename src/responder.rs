use crate::iface;
use crate::iface::NetInterface;
use crate::service;
use crate::service::ServiceEntry;
use crate::service::ServiceNames;
use crate::service::HOST_RECORD_TTL;
use crate::transport::InboundMessage;
use crate::transport::IpVariant;
use crate::transport::MdnsSender;
use crate::transport::MulticastTransport;
use crate::transport::TransportError;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use hickory_proto::error::ProtoError;
use hickory_proto::op::Message;
use hickory_proto::op::MessageType;
use hickory_proto::op::Query;
use hickory_proto::rr::rdata;
use hickory_proto::rr::Name;
use hickory_proto::rr::RData;
use hickory_proto::rr::Record;
use hickory_proto::rr::RecordType;
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PROBE_COUNT: u32 = 3;
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ResponderOptions {
    /// TTL of the PTR/SRV/TXT records, in seconds.
    pub ttl: u32,
    /// How many unsolicited announcements to send after probing,
    /// RFC 6762 section 8.3 allows 2 through 8.
    pub announce_repetitions: u32,
}

impl Default for ResponderOptions {
    fn default() -> Self {
        Self {
            ttl: service::DEFAULT_TTL,
            announce_repetitions: 2,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("missing service instance name")]
    MissingInstance,

    #[error("missing service name")]
    MissingService,

    #[error("missing port")]
    MissingPort,

    #[error("missing host name")]
    MissingHost,

    #[error("failed to parse the given IP address `{0}`")]
    InvalidIp(String),

    #[error("announce repetitions must be within 2..=8, got {0}")]
    InvalidAnnounceRepetitions(u32),

    #[error("service names do not form valid DNS names")]
    InvalidName(#[from] ProtoError),

    #[error("could not determine the host name")]
    Hostname(#[source] std::io::Error),

    #[error("could not determine any host IP address")]
    NoHostAddresses,

    #[error("failed to enumerate network interfaces")]
    Interfaces(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Publishes a service instance, taking the host name and addresses from
/// the operating system. The responder probes, announces, and keeps
/// answering queries until [`Responder::shutdown`].
pub async fn register(
    instance: &str,
    service: &str,
    domain: &str,
    port: u16,
    text: Vec<String>,
    interfaces: Vec<NetInterface>,
    options: ResponderOptions,
) -> Result<Responder, RegisterError> {
    let mut entry = new_entry(instance, service, domain, port, text, &options)?;
    let host = hostname::get().map_err(RegisterError::Hostname)?;
    entry.hostname = service::qualify_hostname(&host.to_string_lossy(), &entry.domain);
    let interfaces = select_interfaces(interfaces)?;
    for interface in &interfaces {
        let (v4, v6) = interface.addrs();
        v4.into_iter().for_each(|a| entry.push_addr_v4(a));
        v6.into_iter().for_each(|a| entry.push_addr_v6(a));
    }
    if entry.addr_v4.is_empty() && entry.addr_v6.is_empty() {
        return Err(RegisterError::NoHostAddresses);
    }
    start(entry, interfaces, options)
}

/// Publishes a service instance on behalf of another host, using the given
/// host name and addresses instead of introspecting the local ones.
#[allow(clippy::too_many_arguments)]
pub async fn register_proxy(
    instance: &str,
    service: &str,
    domain: &str,
    port: u16,
    host: &str,
    ips: Vec<String>,
    text: Vec<String>,
    interfaces: Vec<NetInterface>,
    options: ResponderOptions,
) -> Result<Responder, RegisterError> {
    let mut entry = new_entry(instance, service, domain, port, text, &options)?;
    if service::trim_dot(host).is_empty() {
        return Err(RegisterError::MissingHost);
    }
    entry.hostname = service::qualify_hostname(host, &entry.domain);
    for ip in ips {
        match ip.parse() {
            Ok(IpAddr::V4(a)) => entry.push_addr_v4(a),
            Ok(IpAddr::V6(a)) => entry.push_addr_v6(a),
            Err(_) => return Err(RegisterError::InvalidIp(ip)),
        }
    }
    let interfaces = select_interfaces(interfaces)?;
    start(entry, interfaces, options)
}

fn new_entry(
    instance: &str,
    service: &str,
    domain: &str,
    port: u16,
    text: Vec<String>,
    options: &ResponderOptions,
) -> Result<ServiceEntry, RegisterError> {
    if !(2..=8).contains(&options.announce_repetitions) {
        return Err(RegisterError::InvalidAnnounceRepetitions(
            options.announce_repetitions,
        ));
    }
    let (service, subtypes) = service::parse_subtypes(service);
    let mut entry = ServiceEntry::new(instance, &service, domain);
    entry.subtypes = subtypes;
    entry.port = port;
    entry.text = text;
    entry.ttl = options.ttl;
    if entry.instance.is_empty() {
        return Err(RegisterError::MissingInstance);
    }
    if entry.service.is_empty() {
        return Err(RegisterError::MissingService);
    }
    if entry.port == 0 {
        return Err(RegisterError::MissingPort);
    }
    Ok(entry)
}

fn select_interfaces(interfaces: Vec<NetInterface>) -> Result<Vec<NetInterface>, RegisterError> {
    if interfaces.is_empty() {
        iface::multicast_interfaces().map_err(RegisterError::Interfaces)
    } else {
        Ok(interfaces)
    }
}

fn start(
    entry: ServiceEntry,
    interfaces: Vec<NetInterface>,
    options: ResponderOptions,
) -> Result<Responder, RegisterError> {
    let names = ServiceNames::for_entry(&entry)?;
    let transport = Arc::new(MulticastTransport::new(&interfaces, IpVariant::Both)?);
    let inbound = transport.receive();
    let engine = Arc::new(Engine {
        text: Mutex::new(entry.text.clone()),
        ttl: entry.ttl,
        announce_repetitions: options.announce_repetitions,
        entry,
        names,
        interfaces,
        sender: Box::new(transport),
        cancel: CancellationToken::new(),
    });
    Ok(Responder::launch(engine, inbound))
}

/// Handle of a published service. Dropping it stops the workers without a
/// goodbye; call [`Responder::shutdown`] to retire the instance cleanly.
pub struct Responder {
    engine: Arc<Engine>,
    workers: tokio::sync::Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

impl Responder {
    fn launch(engine: Arc<Engine>, inbound: BoxStream<'static, InboundMessage>) -> Self {
        let receiver = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let cancelled = engine.cancel.clone().cancelled_owned();
                inbound
                    .take_until(cancelled)
                    .for_each(|packet| {
                        let engine = engine.clone();
                        async move { engine.handle_inbound(packet).await }
                    })
                    .await;
            })
        };
        let prober = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.probe_and_announce().await })
        };
        Self {
            engine,
            workers: tokio::sync::Mutex::new(Some(vec![receiver, prober])),
        }
    }

    /// Replaces the TXT payload and announces the change immediately.
    pub async fn set_text(&self, text: Vec<String>) {
        self.engine.set_text(text).await;
    }

    /// Sends a goodbye with TTL 0 for every record of the instance, closes
    /// the sockets and waits for the workers. Safe to call more than once.
    pub async fn shutdown(&self) {
        let workers = self.workers.lock().await.take();
        let Some(workers) = workers else {
            return;
        };
        self.engine.send_goodbye().await;
        self.engine.cancel.cancel();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.engine.cancel.cancel();
    }
}

struct Engine {
    entry: ServiceEntry,
    /// The only mutable piece of the published entry, snapshotted into
    /// every outgoing TXT record.
    text: Mutex<Vec<String>>,
    names: ServiceNames,
    ttl: u32,
    announce_repetitions: u32,
    interfaces: Vec<NetInterface>,
    sender: Box<dyn MdnsSender + Send + Sync>,
    cancel: CancellationToken,
}

impl Engine {
    async fn handle_inbound(&self, inbound: InboundMessage) {
        let InboundMessage {
            message,
            interface_index,
            source,
        } = inbound;
        // A non-empty authority section means a peer is probing; probe
        // tiebreaking is not answered here.
        if !message.name_servers().is_empty() {
            return;
        }
        for question in message.queries() {
            let mut response = Message::new();
            response.set_id(message.id());
            response.set_message_type(MessageType::Response);
            response.set_authoritative(true);
            response.set_recursion_desired(false);
            self.handle_question(question, &mut response, &message, interface_index);
            if response.answers().is_empty() {
                continue;
            }
            let packet = match pack(&response) {
                Ok(packet) => packet,
                Err(e) => {
                    log::error!("Failed to encode a response: {}", e);
                    continue;
                }
            };
            if question.mdns_unicast_response() {
                self.sender
                    .send_unicast(packet, source, interface_index)
                    .await;
            } else {
                self.sender.send_multicast(packet, interface_index).await;
            }
        }
    }

    fn handle_question(
        &self,
        question: &Query,
        response: &mut Message,
        query: &Message,
        interface_index: u32,
    ) {
        let name = question.name();
        if *name == self.names.service_type {
            self.compose_service_type_answer(response);
        } else if *name == self.names.service {
            self.compose_browsing_answers(response, interface_index);
        } else if *name == self.names.instance {
            self.compose_lookup_answers(response, self.ttl, interface_index, false);
            return;
        } else if self.names.subtypes.iter().any(|subtype| subtype == name) {
            self.compose_browsing_answers(response, interface_index);
        } else {
            return;
        }
        if is_known_answer(response, query) {
            response.take_answers();
        }
    }

    /// RFC 6763 section 9: a PTR from the service type enumeration name to
    /// the service name.
    fn compose_service_type_answer(&self, response: &mut Message) {
        response.add_answer(record(
            self.names.service_type.clone(),
            self.ttl,
            false,
            RData::PTR(rdata::PTR(self.names.service.clone())),
        ));
    }

    fn compose_browsing_answers(&self, response: &mut Message, interface_index: u32) {
        response.add_answer(self.ptr_record(self.ttl));
        response.add_additional(self.srv_record(self.ttl, false));
        response.add_additional(self.txt_record(self.ttl, false));
        for host in self.host_records(self.ttl, interface_index, false) {
            response.add_additional(host);
        }
    }

    /// The SRV and TXT defining the instance always ask listeners to flush
    /// older cache entries (RFC 6762 section 10.2); `flush` governs the
    /// accompanying address records.
    fn compose_lookup_answers(
        &self,
        response: &mut Message,
        ttl: u32,
        interface_index: u32,
        flush: bool,
    ) {
        response.add_answer(self.srv_record(ttl, true));
        response.add_answer(self.txt_record(ttl, true));
        response.add_answer(self.ptr_record(ttl));
        response.add_answer(record(
            self.names.service_type.clone(),
            ttl,
            false,
            RData::PTR(rdata::PTR(self.names.service.clone())),
        ));
        for subtype in &self.names.subtypes {
            response.add_answer(record(
                subtype.clone(),
                ttl,
                false,
                RData::PTR(rdata::PTR(self.names.instance.clone())),
            ));
        }
        for host in self.host_records(ttl, interface_index, flush) {
            if flush {
                response.add_answer(host);
            } else {
                response.add_additional(host);
            }
        }
    }

    fn ptr_record(&self, ttl: u32) -> Record {
        record(
            self.names.service.clone(),
            ttl,
            false,
            RData::PTR(rdata::PTR(self.names.instance.clone())),
        )
    }

    fn srv_record(&self, ttl: u32, flush: bool) -> Record {
        record(
            self.names.instance.clone(),
            ttl,
            flush,
            RData::SRV(rdata::SRV::new(0, 0, self.entry.port, self.names.host.clone())),
        )
    }

    fn txt_record(&self, ttl: u32, flush: bool) -> Record {
        let text = service::txt_records(&self.text_snapshot());
        record(
            self.names.instance.clone(),
            ttl,
            flush,
            RData::TXT(rdata::TXT::new(text)),
        )
    }

    /// One A or AAAA per published address; when the entry carries none,
    /// the addresses of the receiving interface are used instead. The TTL
    /// is clamped to 120 s for live records (RFC 6762 section 10).
    fn host_records(&self, ttl: u32, interface_index: u32, flush: bool) -> Vec<Record> {
        let mut v4 = self.entry.addr_v4.clone();
        let mut v6 = self.entry.addr_v6.clone();
        if v4.is_empty() && v6.is_empty() {
            if let Some(interface) = self
                .interfaces
                .iter()
                .find(|i| i.index == interface_index)
            {
                (v4, v6) = interface.addrs();
            }
        }
        let ttl = if ttl > 0 { HOST_RECORD_TTL } else { 0 };
        let mut records = Vec::with_capacity(v4.len() + v6.len());
        for addr in v4 {
            records.push(record(
                self.names.host.clone(),
                ttl,
                flush,
                RData::A(rdata::A::from(addr)),
            ));
        }
        for addr in v6 {
            records.push(record(
                self.names.host.clone(),
                ttl,
                flush,
                RData::AAAA(rdata::AAAA::from(addr)),
            ));
        }
        records
    }

    /// The probe query: a question for the instance name with the proposed
    /// SRV and TXT in the authority section for tiebreaking
    /// (RFC 6762 section 8.1).
    fn compose_probe(&self) -> Message {
        let mut message = Message::new();
        message.set_recursion_desired(false);
        message.add_query(Query::query(self.names.instance.clone(), RecordType::PTR));
        message.add_name_server(self.srv_record(self.ttl, false));
        message.add_name_server(self.txt_record(self.ttl, false));
        message
    }

    fn compose_announcement(&self, interface_index: u32) -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_authoritative(true);
        self.compose_lookup_answers(&mut message, self.ttl, interface_index, true);
        message
    }

    async fn probe_and_announce(&self) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
        if !self.sleep_unless_cancelled(jitter).await {
            return;
        }
        match pack(&self.compose_probe()) {
            Ok(packet) => {
                for _ in 0..PROBE_COUNT {
                    self.sender.send_multicast(packet.clone(), 0).await;
                    if !self.sleep_unless_cancelled(PROBE_INTERVAL).await {
                        return;
                    }
                }
            }
            Err(e) => log::error!("Failed to encode the probe query: {}", e),
        }
        // RFC 6762 section 8.3: at least two unsolicited responses, one
        // second apart, the interval doubling with every response sent.
        let mut pause = Duration::from_secs(1);
        for _ in 0..self.announce_repetitions {
            for interface in &self.interfaces {
                self.send_response(self.compose_announcement(interface.index), interface.index)
                    .await;
            }
            if !self.sleep_unless_cancelled(pause).await {
                return;
            }
            pause *= 2;
        }
    }

    async fn set_text(&self, text: Vec<String>) {
        *self
            .text
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = text;
        self.announce_text().await;
    }

    async fn announce_text(&self) {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_authoritative(true);
        self.compose_browsing_answers(&mut message, 0);
        self.send_response(message, 0).await;
    }

    async fn send_goodbye(&self) {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_authoritative(true);
        self.compose_lookup_answers(&mut message, 0, 0, true);
        self.send_response(message, 0).await;
    }

    async fn send_response(&self, message: Message, interface_index: u32) {
        match pack(&message) {
            Ok(packet) => self.sender.send_multicast(packet, interface_index).await,
            Err(e) => log::error!("Failed to encode an outgoing message: {}", e),
        }
    }

    fn text_snapshot(&self) -> Vec<String> {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

fn record(name: Name, ttl: u32, flush: bool, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_mdns_cache_flush(flush);
    record
}

/// RFC 6762 section 7.1, known-answer suppression: a PTR answer the querier
/// already holds with at least half its TTL left need not be repeated.
fn is_known_answer(response: &Message, query: &Message) -> bool {
    let Some(answer) = response.answers().first() else {
        return false;
    };
    let Some(RData::PTR(expected)) = answer.data() else {
        return false;
    };
    query.answers().iter().any(|known| match known.data() {
        Some(RData::PTR(ptr)) => ptr.0 == expected.0 && known.ttl() >= answer.ttl() / 2,
        _ => false,
    })
}

fn pack(message: &Message) -> Result<Arc<[u8]>, ProtoError> {
    Ok(message.to_vec()?.into())
}
