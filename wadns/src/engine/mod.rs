#[cfg(test)]
mod engine_test;

pub(crate) mod hostname;
pub(crate) mod llq;
pub(crate) mod nat;
pub(crate) mod query;
pub(crate) mod register;
pub(crate) mod service;
pub(crate) mod stream;
pub(crate) mod zone;

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, trace, warn};
use rand::Rng;

use crate::auth::CredentialStore;
use crate::config::{self, EngineConfig};
use crate::message::name::Name;
use crate::message::resource::a::AResource;
use crate::message::resource::aaaa::AaaaResource;
use crate::message::resource::ptr::PtrResource;
use crate::message::resource::srv::SrvResource;
use crate::message::resource::txt::TxtResource;
use crate::message::resource::{OpaqueResource, Resource, ResourceBody, ResourceHeader};
use crate::message::{DNSCLASS_INET, DnsType, Message, OPCODE_QUERY, OPCODE_UPDATE};
use crate::natpmp;
use crate::servers::{ServerId, ServerRegistry};
use shared::error::{Error, Result};
use shared::{StreamId, TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol};

/// Handle for a unicast question (one-shot or long-lived).
pub type QueryId = u64;

/// Handle for a standalone record registration.
pub type RecordId = u64;

/// Handle for a service record set registration.
pub type ServiceId = u64;

/// Handle for a NAT traversal operation.
pub type NatId = u64;

pub(crate) type ZoneId = u64;

/// How the answers in a delivered response are to be applied by the record
/// cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AnswerKind {
    /// Ordinary one-shot answer.
    Plain,
    /// LLQ event: flush stale records for the question, then trust the
    /// answers as authoritative increments.
    LlqEvent,
    /// Full resynchronization: the answers are the entire current truth.
    LlqFull,
}

/// Terminal and intermediate registration outcomes surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegStatus {
    /// The unit is registered with the authoritative server.
    Registered,
    /// The unit has been withdrawn; its memory may be released.
    Released,
    /// Terminal failure.
    Failed(Error),
}

/// Which port-mapping protocol a NAT operation asks for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NatKind {
    /// External-address discovery only.
    AddressOnly,
    MapUdp,
    MapTcp,
}

impl NatKind {
    pub(crate) fn opcode(&self) -> Option<u8> {
        match self {
            NatKind::AddressOnly => None,
            NatKind::MapUdp => Some(natpmp::NATOP_MAP_UDP),
            NatKind::MapTcp => Some(natpmp::NATOP_MAP_TCP),
        }
    }
}

/// Effective outcome of a NAT operation, as delivered to its owner.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NatResult {
    Ok,
    /// The discovered external address is itself a private address.
    DoubleNat,
    PortMappingDisabled,
    PortMappingUnsupported,
    NetworkFailure,
}

/// State snapshot delivered whenever a NAT operation's externally visible
/// address, port or result changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatUpdate {
    pub op: NatId,
    pub external_address: Ipv4Addr,
    pub external_port: u16,
    /// Remaining mapping lifetime in seconds; zero when unmapped.
    pub lifetime: u32,
    pub result: NatResult,
}

/// Events drained by the host after [`Engine::handle_read`] /
/// [`Engine::handle_timeout`].
#[derive(Debug)]
pub enum Event {
    /// Open a stream connection to `peer` and report back through
    /// [`Engine::stream_established`] / [`Engine::stream_error`].
    StreamConnect {
        stream: StreamId,
        peer: SocketAddr,
        tls: bool,
    },
    /// Tear down a stream connection.
    StreamClose { stream: StreamId },
    /// A response for a question, with application semantics per `kind`.
    Answer {
        query: QueryId,
        kind: AnswerKind,
        message: BytesMut,
    },
    /// No usable server exists for the question; cache a negative answer.
    NegativeAnswer { query: QueryId, ttl: u32 },
    RecordStatus { record: RecordId, status: RegStatus },
    ServiceStatus {
        service: ServiceId,
        status: RegStatus,
    },
    /// Status change of a dynamic hostname's address registration.
    HostnameStatus { name: Name, status: RegStatus },
    Nat(NatUpdate),
}

/// Record data for registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rdata {
    A(Ipv4Addr),
    Aaaa([u8; 16]),
    Txt(Vec<String>),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
    Ptr(Name),
    Raw { typ: DnsType, data: Vec<u8> },
}

impl Rdata {
    pub fn rtype(&self) -> DnsType {
        match self {
            Rdata::A(_) => DnsType::A,
            Rdata::Aaaa(_) => DnsType::Aaaa,
            Rdata::Txt(_) => DnsType::Txt,
            Rdata::Srv { .. } => DnsType::Srv,
            Rdata::Ptr(_) => DnsType::Ptr,
            Rdata::Raw { typ, .. } => *typ,
        }
    }

    pub(crate) fn to_body(&self) -> Box<dyn ResourceBody> {
        match self {
            Rdata::A(ip) => Box::new(AResource { a: ip.octets() }),
            Rdata::Aaaa(b) => Box::new(AaaaResource { aaaa: *b }),
            Rdata::Txt(txt) => Box::new(TxtResource {
                txt: txt.clone(),
                length: 0,
            }),
            Rdata::Srv {
                priority,
                weight,
                port,
                target,
            } => Box::new(SrvResource {
                priority: *priority,
                weight: *weight,
                port: *port,
                target: target.clone(),
            }),
            Rdata::Ptr(name) => Box::new(PtrResource { ptr: name.clone() }),
            Rdata::Raw { typ, data } => Box::new(OpaqueResource {
                typ: *typ,
                data: data.clone(),
            }),
        }
    }

    pub(crate) fn to_resource(&self, name: Name) -> Resource {
        Resource {
            header: ResourceHeader {
                name,
                typ: self.rtype(),
                class: DNSCLASS_INET,
                ..Default::default()
            },
            body: Some(self.to_body()),
        }
    }
}

// Long-lived query session state (embedded per question).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum LlqState {
    InitialRequest,
    SecondaryRequest,
    Established,
    Poll,
}

// Registration unit state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RegState {
    Unregistered,
    FetchingZoneData,
    NoTarget,
    NatMap,
    Pending,
    Registered,
    Refresh,
    UpdatePending,
    DeregPending,
    DeregDeferred,
    /// Extra record queued behind its service set.
    ExtraQueued,
}

pub(crate) struct UnicastQuestion {
    pub(crate) id: QueryId,
    pub(crate) name: Name,
    pub(crate) qtype: DnsType,
    pub(crate) long_lived: bool,

    // Credential binding, re-resolved on credential-store changes.
    pub(crate) auth: Option<Name>,
    pub(crate) private: bool,

    // Scheduling. `interval` of None parks the question until a
    // configuration change.
    pub(crate) msg_id: u16,
    pub(crate) last_send: Instant,
    pub(crate) interval: Option<Duration>,
    pub(crate) unanswered: u32,
    pub(crate) server: Option<ServerId>,

    // LLQ session.
    pub(crate) state: LlqState,
    pub(crate) llq_id: u64,
    pub(crate) req_lease: u32,
    pub(crate) expire: Option<Instant>,
    pub(crate) ntries: u32,
    pub(crate) serv_addr: Option<SocketAddr>,
    pub(crate) serv_lookup_failed: bool,
    pub(crate) nta: Option<ZoneId>,
    pub(crate) stream: Option<StreamId>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ZoneService {
    Update,
    Query,
    Llq,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ZoneOwner {
    Question(QueryId),
    Record(RecordId),
    Service(ServiceId),
}

#[derive(Debug, Clone)]
pub(crate) struct ZoneData {
    pub(crate) zone: Name,
    pub(crate) host: Option<Name>,
    pub(crate) port: u16,
    pub(crate) addr: Option<Ipv4Addr>,
    pub(crate) private: bool,
}

// One outstanding chained SOA/SRV/A discovery. Exactly one query is in
// flight per descriptor at any time.
pub(crate) struct ZoneQuery {
    pub(crate) id: ZoneId,
    pub(crate) child: Name,
    pub(crate) current_soa: Name,
    pub(crate) service: ZoneService,
    pub(crate) private: bool,
    pub(crate) owner: ZoneOwner,

    pub(crate) qname: Name,
    pub(crate) qtype: DnsType,
    pub(crate) msg_id: u16,
    pub(crate) server: Option<ServerId>,
    pub(crate) last_send: Instant,
    pub(crate) interval: Duration,
    pub(crate) unanswered: u32,

    pub(crate) zone: Option<Name>,
    pub(crate) host: Option<Name>,
    pub(crate) port: u16,
    pub(crate) addr: Option<Ipv4Addr>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum NatOwner {
    Caller,
    Llq,
    Service(ServiceId),
    Hostname,
}

pub(crate) struct NatOp {
    pub(crate) id: NatId,
    pub(crate) kind: NatKind,
    pub(crate) internal_port: u16,
    pub(crate) requested_port: u16,
    pub(crate) lease: u32,
    pub(crate) owner: NatOwner,

    pub(crate) expiry: Option<Instant>,
    pub(crate) retry_interval: Duration,
    pub(crate) retry_at: Instant,
    pub(crate) last_gateway_err: u16,
    pub(crate) forced_result: Option<NatResult>,

    // Last-notified snapshot; `None` means the owner has never been told
    // anything.
    pub(crate) last_addr: Option<Ipv4Addr>,
    pub(crate) last_port: Option<u16>,
    pub(crate) last_result: Option<NatResult>,
    pub(crate) lifetime: u32,
}

pub(crate) struct RecordReg {
    pub(crate) id: RecordId,
    pub(crate) name: Name,
    pub(crate) rdata: Rdata,
    pub(crate) ttl: u32,
    pub(crate) state: RegState,

    pub(crate) zone: Option<Name>,
    pub(crate) update_server: Option<SocketAddr>,
    pub(crate) private: bool,
    pub(crate) use_lease: bool,
    pub(crate) expire: Option<Instant>,

    pub(crate) last_attempt: Instant,
    pub(crate) interval: Duration,
    pub(crate) msg_id: u16,
    pub(crate) nta: Option<ZoneId>,
    pub(crate) stream: Option<StreamId>,

    // Rdata lifecycle for in-place updates.
    pub(crate) queued_rdata: Option<Rdata>,
    pub(crate) in_flight_rdata: Option<Rdata>,

    /// Extra record owned by a service set.
    pub(crate) parent_service: Option<ServiceId>,
    /// Internal registration driven by the dynamic-hostname list.
    pub(crate) hostname_owner: Option<Name>,
}

pub(crate) struct ServiceReg {
    pub(crate) id: ServiceId,
    pub(crate) srv_name: Name,
    pub(crate) ptr_name: Name,
    pub(crate) port: u16,
    pub(crate) txt: Vec<String>,
    pub(crate) ttl: u32,
    pub(crate) state: RegState,

    /// Current SRV target; empty while unresolved.
    pub(crate) srv_target: Option<Name>,
    /// Auto-select the target from the hostname list and NAT-map the port.
    pub(crate) auto_target: bool,
    /// External port once a NAT mapping is in place.
    pub(crate) mapped_port: Option<u16>,

    pub(crate) zone: Option<Name>,
    pub(crate) update_server: Option<SocketAddr>,
    pub(crate) private: bool,
    pub(crate) use_lease: bool,
    pub(crate) expire: Option<Instant>,

    pub(crate) last_attempt: Instant,
    pub(crate) interval: Duration,
    pub(crate) msg_id: u16,
    pub(crate) nta: Option<ZoneId>,
    pub(crate) stream: Option<StreamId>,
    pub(crate) nat: Option<NatId>,

    pub(crate) extras: Vec<RecordId>,

    pub(crate) txt_queued: Option<Vec<String>>,
    pub(crate) txt_in_flight: Option<Vec<String>>,

    pub(crate) test_self_conflict: bool,
    pub(crate) srv_changed: bool,
    pub(crate) srv_update_deferred: bool,
    pub(crate) callback_deferred: bool,
    pub(crate) deferred_status: Option<RegStatus>,
}

pub(crate) struct HostnameEntry {
    pub(crate) fqdn: Name,
    pub(crate) record: Option<RecordId>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StreamOwner {
    Question(QueryId),
    Record(RecordId),
    Service(ServiceId),
}

pub(crate) struct StreamConn {
    pub(crate) id: StreamId,
    pub(crate) peer: SocketAddr,
    pub(crate) tls: bool,
    pub(crate) owner: StreamOwner,
    /// Framed request to transmit as soon as the connection is up.
    pub(crate) pending: Option<Vec<u8>>,
    pub(crate) decoder: shared::tcp_framing::TcpFrameDecoder,
    pub(crate) established: bool,
    pub(crate) replies: u32,
    pub(crate) local_addr: SocketAddr,
}

/// Sans-I/O wide-area DNS engine.
///
/// All state mutation happens inside `handle_*` calls made by the host event
/// loop; outbound packets and events accumulate in queues drained through
/// `poll_write` / [`Engine::poll_event`]. The engine never blocks and never
/// touches a socket.
pub struct Engine {
    pub(crate) config: EngineConfig,

    pub(crate) servers: ServerRegistry,
    pub(crate) auth: CredentialStore,
    pub(crate) questions: HashMap<QueryId, UnicastQuestion>,
    pub(crate) zones: HashMap<ZoneId, ZoneQuery>,
    pub(crate) records: HashMap<RecordId, RecordReg>,
    pub(crate) services: HashMap<ServiceId, ServiceReg>,
    pub(crate) streams: HashMap<StreamId, StreamConn>,
    pub(crate) hostnames: Vec<HostnameEntry>,
    pub(crate) search_domains: Vec<Name>,

    // NAT traversal bookkeeping. The operation list is append-only ordered.
    pub(crate) nat_ops: Vec<NatOp>,
    pub(crate) external_address: Option<Ipv4Addr>,
    pub(crate) retry_get_addr: Option<Instant>,
    pub(crate) retry_interval_get_addr: Duration,
    pub(crate) last_upseconds: Option<u32>,
    pub(crate) last_nat_reply_local: Option<Instant>,
    pub(crate) last_map_result: u16,
    pub(crate) last_addr_err: u16,
    /// Engine-owned mapping for the LLQ event port.
    pub(crate) llq_nat: Option<NatId>,
    /// Engine-owned address discovery for the dynamic hostname list.
    pub(crate) hostname_nat: Option<NatId>,

    pub(crate) transmits: VecDeque<TaggedBytesMut>,
    pub(crate) events: VecDeque<Event>,

    pub(crate) suppress_port53_until: Option<Instant>,
    pub(crate) next_target_update: Option<Instant>,
    pub(crate) sleeping: bool,
    pub(crate) closed: bool,

    next_id: u64,
    next_stream: u64,
    next_msg_id: u16,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config,
            servers: ServerRegistry::new(),
            auth: CredentialStore::new(),
            questions: HashMap::new(),
            zones: HashMap::new(),
            records: HashMap::new(),
            services: HashMap::new(),
            streams: HashMap::new(),
            hostnames: Vec::new(),
            search_domains: Vec::new(),
            nat_ops: Vec::new(),
            external_address: None,
            retry_get_addr: None,
            retry_interval_get_addr: config::NATMAP_INIT_RETRY,
            last_upseconds: None,
            last_nat_reply_local: None,
            last_map_result: 0,
            last_addr_err: 0,
            llq_nat: None,
            hostname_nat: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            suppress_port53_until: None,
            next_target_update: None,
            sleeping: false,
            closed: false,
            next_id: 0,
            next_stream: 0,
            next_msg_id: rand::random::<u16>().max(1),
        }
    }

    // ---- identity helpers ----

    pub(crate) fn next_handle(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn new_message_id(&mut self) -> u16 {
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
        self.next_msg_id
    }

    pub(crate) fn new_stream_id(&mut self) -> StreamId {
        self.next_stream += 1;
        StreamId(self.next_stream)
    }

    // ---- address helpers ----

    /// Whether the advertised address needs NAT traversal to be reachable.
    pub(crate) fn behind_nat(&self) -> bool {
        self.config
            .advertised_v4
            .as_ref()
            .is_some_and(config::is_rfc1918)
    }

    /// A non-private advertised address is itself the external address.
    pub(crate) fn have_routable(&self) -> bool {
        self.config
            .advertised_v4
            .is_some_and(|a| !a.is_unspecified() && !config::is_rfc1918(&a))
    }

    pub(crate) fn local_ctx(&self) -> SocketAddr {
        let ip = self
            .config
            .advertised_v4
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, 0)
    }

    // ---- transmit helpers ----

    pub(crate) fn send_udp(&mut self, to: SocketAddr, raw: Vec<u8>, now: Instant) {
        trace!("queueing {} bytes to {} (UDP)", raw.len(), to);
        self.transmits.push_back(TransportMessage {
            now,
            transport: TransportContext {
                local_addr: self.local_ctx(),
                peer_addr: to,
                transport_protocol: TransportProtocol::UDP,
                stream: None,
            },
            message: BytesMut::from(&raw[..]),
        });
    }

    pub(crate) fn send_on_stream(&mut self, stream: StreamId, raw: &[u8], now: Instant) {
        let Some(conn) = self.streams.get(&stream) else {
            warn!("send_on_stream: unknown stream {stream:?}");
            return;
        };
        let framed = shared::tcp_framing::frame_packet(raw);
        trace!(
            "queueing {} bytes to {} ({:?})",
            framed.len(),
            conn.peer,
            stream
        );
        self.transmits.push_back(TransportMessage {
            now,
            transport: TransportContext {
                local_addr: conn.local_addr,
                peer_addr: conn.peer,
                transport_protocol: if conn.tls {
                    TransportProtocol::TLS
                } else {
                    TransportProtocol::TCP
                },
                stream: Some(stream),
            },
            message: BytesMut::from(&framed[..]),
        });
    }

    // ---- time helpers ----

    /// `base` plus a uniform random amount below `spread`.
    pub(crate) fn jittered(base: Duration, spread: Duration) -> Duration {
        let ms = spread.as_millis() as u64;
        if ms == 0 {
            base
        } else {
            base + Duration::from_millis(rand::rng().random_range(0..ms))
        }
    }

    /// Signs `raw` when a credential binding exists for `name`.
    pub(crate) fn sign_if_bound(&mut self, raw: &mut Vec<u8>, name: &Name, now: Instant) {
        if let Some(info) = self.auth.lookup(name, now) {
            let key = info.key.clone();
            let now_secs = unix_seconds();
            if let Err(err) = crate::message::tsig::sign_message(raw, &key, now_secs) {
                warn!("TSIG signing failed for {name}: {err}");
            }
        }
    }

    // ---- inbound dispatch ----

    pub(crate) fn handle_dns_message(
        &mut self,
        raw: &[u8],
        from: SocketAddr,
        via: TransportContext,
        now: Instant,
    ) {
        let mut msg = Message::default();
        if let Err(err) = msg.unpack(raw) {
            debug!("dropping unparseable DNS message from {from}: {err}");
            return;
        }
        if !msg.header.response {
            trace!("ignoring non-response message from {from}");
            return;
        }

        match msg.header.op_code {
            OPCODE_QUERY => {
                if self.handle_probe_response(&msg, from, now) {
                    return;
                }
                if self.handle_llq_response(&msg, raw, from, now) {
                    return;
                }
                if self.handle_zone_response(&msg, now) {
                    return;
                }
                self.handle_query_response(&msg, raw, via, now);
            }
            OPCODE_UPDATE => {
                self.handle_update_reply(&msg, now);
            }
            op => trace!("ignoring response with opcode {op} from {from}"),
        }
    }
}

pub(crate) fn unix_seconds() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---- public API surface ----

impl Engine {
    /// Adds (or refreshes) a DNS server supplied by the platform.
    pub fn add_dns_server(
        &mut self,
        interface: u32,
        addr: SocketAddr,
        domain: &str,
        now: Instant,
    ) -> Result<()> {
        let domain = Name::new(domain)?;
        self.servers.add_server(interface, addr, domain, now);
        // A fresh server may unpark questions that had nowhere to go.
        self.unpark_questions(now);
        Ok(())
    }

    /// Starts a configuration replay of the server table; servers not
    /// re-added before [`Engine::end_server_config`] are dropped.
    pub fn begin_server_config(&mut self) {
        self.servers.mark_all_for_delete();
    }

    pub fn end_server_config(&mut self, now: Instant) {
        self.servers.sweep_deleted();
        self.rebind_questions(now);
    }

    /// Installs TSIG credentials for a domain suffix and re-evaluates every
    /// question's credential binding.
    pub fn set_secret(
        &mut self,
        domain: &str,
        key_name: &str,
        b64_key: &str,
        requires_tls: bool,
        now: Instant,
    ) -> Result<()> {
        let domain = Name::new(domain)?;
        let key_name = Name::new(key_name)?;
        self.auth.set_secret(domain, key_name, b64_key, requires_tls)?;
        self.rebind_questions(now);
        Ok(())
    }

    /// Schedules removal of a domain's credentials.
    pub fn delete_secret(&mut self, domain: &str, now: Instant) -> Result<()> {
        let domain = Name::new(domain)?;
        self.auth.delete_secret(&domain, now)
    }

    /// Records a search domain for the host's enumeration logic; the list
    /// is ordered and deduplicated.
    pub fn add_search_domain(&mut self, domain: &str) -> Result<()> {
        let domain = Name::new(domain)?;
        if !self.search_domains.contains(&domain) {
            self.search_domains.push(domain);
        }
        Ok(())
    }

    pub fn search_domains(&self) -> impl Iterator<Item = &Name> {
        self.search_domains.iter()
    }

    /// Updates the primary interface facts. An address change re-evaluates
    /// service targets and NAT state.
    pub fn set_primary_interface(
        &mut self,
        advertised_v4: Option<Ipv4Addr>,
        router: Option<Ipv4Addr>,
        now: Instant,
    ) {
        let changed =
            self.config.advertised_v4 != advertised_v4 || self.config.router != router;
        self.config.advertised_v4 = advertised_v4;
        self.config.router = router;
        if changed {
            self.external_address = None;
            self.recreate_nat_mappings(now);
            if !self.nat_ops.is_empty() {
                self.retry_get_addr = Some(now);
                self.retry_interval_get_addr = config::NATMAP_INIT_RETRY;
            }
            self.next_target_update = Some(now);
            self.refresh_hostname_records(now);
        }
    }
}

impl sansio::Protocol<TaggedBytesMut, (), ()> for Engine {
    type Rout = ();
    type Wout = TaggedBytesMut;
    type Eout = Event;
    type Error = Error;
    type Time = Instant;

    /// Feeds one received UDP datagram into the engine. NAT-PMP replies and
    /// announcements are recognized by source/destination port; everything
    /// else is treated as DNS. Stream payloads go through
    /// [`Engine::stream_input`] instead.
    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let from = msg.transport.peer_addr;
        let now = msg.now;

        let from_router = self
            .config
            .router
            .is_some_and(|r| from.ip() == IpAddr::V4(r));
        if (from_router && from.port() == natpmp::NATPMP_PORT)
            || msg.transport.local_addr.port() == natpmp::NATPMP_ANNOUNCEMENT_PORT
        {
            self.handle_natpmp_packet(&msg.message, now);
            return Ok(());
        }

        self.handle_dns_message(&msg.message, from, msg.transport, now);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    /// Next outbound packet, tagged with its transport context. Stream
    /// payloads carry their [`StreamId`] and are already length-prefixed.
    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.transmits.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.events.pop_front()
    }

    /// One scheduler pass: walks every table, fires whatever is due and
    /// recomputes internal timers. Never blocks; all I/O is queued.
    fn handle_timeout(&mut self, now: Self::Time) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }

        // Deferred service target re-evaluation comes first so freshly
        // computed targets are acted upon in the same pass.
        if let Some(t) = self.next_target_update
            && t <= now
        {
            self.next_target_update = None;
            self.update_service_targets(now);
        }

        self.check_nat_mappings(now);

        if let Some(t) = self.suppress_port53_until
            && t <= now
        {
            self.suppress_port53_until = None;
        }

        self.check_record_registrations(now);
        self.check_service_registrations(now);
        self.servers.reset_expired_penalties(now);
        self.check_questions(now);
        self.check_zone_queries(now);
        self.purge_credentials(now);

        Ok(())
    }

    /// Earliest instant at which [`Engine::handle_timeout`] has work to do.
    fn poll_timeout(&mut self) -> Option<Self::Time> {
        let mut next: Option<Instant> = None;
        let mut fold = |t: Option<Instant>| {
            if let Some(t) = t
                && next.is_none_or(|n| t < n)
            {
                next = Some(t);
            }
        };

        fold(self.next_target_update);
        fold(self.suppress_port53_until);
        fold(self.servers.next_penalty_expiry());
        fold(self.nat_poll_timeout());

        for q in self.questions.values() {
            if let Some(interval) = q.interval {
                fold(Some(q.last_send + interval));
            }
        }
        for z in self.zones.values() {
            fold(Some(z.last_send + z.interval));
        }
        for r in self.records.values() {
            if registration_scheduled(r.state) {
                fold(Some(r.last_attempt + r.interval));
            }
        }
        for s in self.services.values() {
            if registration_scheduled(s.state) {
                fold(Some(s.last_attempt + s.interval));
            }
        }

        next
    }

    /// Shuts the engine down, dropping all state and queues.
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.questions.clear();
        self.zones.clear();
        self.records.clear();
        self.services.clear();
        self.streams.clear();
        self.nat_ops.clear();
        self.hostnames.clear();
        self.transmits.clear();
        self.events.clear();
        Ok(())
    }
}

pub(crate) fn registration_scheduled(state: RegState) -> bool {
    matches!(
        state,
        RegState::FetchingZoneData
            | RegState::Pending
            | RegState::DeregPending
            | RegState::UpdatePending
            | RegState::DeregDeferred
            | RegState::Refresh
            | RegState::Registered
    )
}
