use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use sansio::Protocol;

use super::*;
use crate::config::EngineConfig;
use crate::message::resource::a::AResource;
use crate::message::resource::opt::{
    DnsOption, LLQ_OP_EVENT, LlqData, OptResource,
};
use crate::message::resource::soa::SoaResource;
use crate::message::resource::srv::SrvResource;
use crate::message::{
    DNSCLASS_INET, DnsClass, DnsType, Header, Message, Name, Question, Resource, ResourceHeader,
};
use crate::natpmp;
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};

const SERVER: &str = "10.0.0.1:53";
const ROUTER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

fn public_engine() -> Engine {
    Engine::new(EngineConfig::default().with_advertised_v4(Ipv4Addr::new(203, 0, 113, 5)))
}

fn natted_engine() -> Engine {
    Engine::new(
        EngineConfig::default()
            .with_advertised_v4(Ipv4Addr::new(192, 168, 1, 10))
            .with_router(ROUTER),
    )
}

fn drain_writes(e: &mut Engine) -> Vec<TaggedBytesMut> {
    let mut out = vec![];
    while let Some(w) = e.poll_write() {
        out.push(w);
    }
    out
}

fn drain_events(e: &mut Engine) -> Vec<Event> {
    let mut out = vec![];
    while let Some(ev) = e.poll_event() {
        out.push(ev);
    }
    out
}

fn parse(raw: &[u8]) -> Message {
    let mut msg = Message::default();
    msg.unpack(raw).expect("parseable transmit");
    msg
}

fn deliver(e: &mut Engine, from: SocketAddr, raw: Vec<u8>, now: Instant) {
    e.handle_read(TaggedBytesMut {
        now,
        transport: TransportContext {
            local_addr: "0.0.0.0:0".parse().unwrap(),
            peer_addr: from,
            transport_protocol: TransportProtocol::UDP,
            stream: None,
        },
        message: BytesMut::from(&raw[..]),
    })
    .unwrap();
}

fn answer(name: &str, body: Box<dyn crate::message::ResourceBody>) -> Resource {
    Resource {
        header: ResourceHeader {
            name: Name::new(name).unwrap(),
            class: DNSCLASS_INET,
            ttl: 3600,
            ..Default::default()
        },
        body: Some(body),
    }
}

fn response_to(query: &Message, answers: Vec<Resource>) -> Vec<u8> {
    let mut msg = Message {
        header: Header {
            id: query.header.id,
            response: true,
            authoritative: true,
            ..Default::default()
        },
        questions: query.questions.clone(),
        answers,
        ..Default::default()
    };
    msg.pack().unwrap()
}

#[test]
fn test_one_shot_query_answer() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let qid = e
        .start_query("host.example.com.", DnsType::A, false, now)
        .unwrap();

    e.handle_timeout(now).unwrap();
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].transport.peer_addr, SERVER.parse().unwrap());
    let query = parse(&writes[0].message);
    assert_eq!(query.questions[0].name.data, "host.example.com.");
    assert_eq!(query.questions[0].typ, DnsType::A);

    let reply = response_to(
        &query,
        vec![answer("host.example.com.", Box::new(AResource { a: [192, 0, 2, 7] }))],
    );
    deliver(&mut e, SERVER.parse().unwrap(), reply, now);

    let events = drain_events(&mut e);
    assert!(matches!(
        events.as_slice(),
        [Event::Answer {
            query,
            kind: AnswerKind::Plain,
            ..
        }] if *query == qid
    ));
    // One-shot questions complete on the first answer.
    assert!(e.questions.is_empty());
}

#[test]
fn test_ptr_question_probes_relay_first() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    // A PTR question that is not a vanilla reverse lookup requires the
    // canary probe first.
    e.start_query("_ftp._tcp.example.com.", DnsType::Ptr, false, now)
        .unwrap();

    e.handle_timeout(now).unwrap();
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    let probe = parse(&writes[0].message);
    assert_eq!(
        probe.questions[0].name.data,
        super::query::RELAY_TEST_QUESTION
    );
    assert_eq!(probe.questions[0].typ, DnsType::Ptr);

    // A positive answer to the canary is the defective-relay fingerprint.
    let reply = response_to(
        &probe,
        vec![answer(
            super::query::RELAY_TEST_QUESTION,
            Box::new(AResource { a: [1, 2, 3, 4] }),
        )],
    );
    deliver(&mut e, SERVER.parse().unwrap(), reply, now);
    assert_eq!(
        e.servers.iter().next().unwrap().test_state,
        crate::servers::TestState::Failed
    );

    // With the only server disabled, the question goes negative.
    let later = now + Duration::from_secs(10);
    e.handle_timeout(later).unwrap();
    let events = drain_events(&mut e);
    assert!(
        events
            .iter()
            .any(|ev| matches!(ev, Event::NegativeAnswer { ttl: 60, .. }))
    );
}

#[test]
fn test_probe_pass_unblocks_question() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    e.start_query("_ftp._tcp.example.com.", DnsType::Ptr, false, now)
        .unwrap();

    e.handle_timeout(now).unwrap();
    let probe = parse(&drain_writes(&mut e)[0].message);

    // Empty answer (NXDOMAIN-ish) passes the probe.
    let reply = response_to(&probe, vec![]);
    deliver(&mut e, SERVER.parse().unwrap(), reply, now);
    assert_eq!(
        e.servers.iter().next().unwrap().test_state,
        crate::servers::TestState::Passed
    );

    // The real PTR query goes out next.
    let later = now + Duration::from_secs(2);
    e.handle_timeout(later).unwrap();
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    let real = parse(&writes[0].message);
    assert_eq!(real.questions[0].name.data, "_ftp._tcp.example.com.");
}

#[test]
fn test_zone_chain_soa_walk_to_update() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let server: SocketAddr = SERVER.parse().unwrap();

    e.register_record(
        "host.sub.example.com.",
        Rdata::A(Ipv4Addr::new(203, 0, 113, 5)),
        120,
        now,
    )
    .unwrap();

    // Step 1: SOA at the full name; answer empty, so the resolver strips
    // one label and retries.
    let q1 = parse(&drain_writes(&mut e)[0].message);
    assert_eq!(q1.questions[0].typ, DnsType::Soa);
    assert_eq!(q1.questions[0].name.data, "host.sub.example.com.");
    deliver(&mut e, server, response_to(&q1, vec![]), now);

    let q2 = parse(&drain_writes(&mut e)[0].message);
    assert_eq!(q2.questions[0].typ, DnsType::Soa);
    assert_eq!(q2.questions[0].name.data, "sub.example.com.");

    // Step 2: SOA answered at the apex; the update SRV lookup follows.
    let soa = answer(
        "example.com.",
        Box::new(SoaResource {
            ns: Name::new("ns1.example.com.").unwrap(),
            mbox: Name::new("admin.example.com.").unwrap(),
            serial: 1,
            refresh: 900,
            retry: 300,
            expire: 604800,
            min_ttl: 60,
        }),
    );
    deliver(&mut e, server, response_to(&q2, vec![soa]), now);

    let q3 = parse(&drain_writes(&mut e)[0].message);
    assert_eq!(q3.questions[0].typ, DnsType::Srv);
    assert_eq!(q3.questions[0].name.data, "_dns-update._udp.example.com.");

    // Step 3: SRV names the update endpoint; its address lookup follows.
    let srv = answer(
        "_dns-update._udp.example.com.",
        Box::new(SrvResource {
            priority: 0,
            weight: 0,
            port: 53,
            target: Name::new("ns1.example.com.").unwrap(),
        }),
    );
    deliver(&mut e, server, response_to(&q3, vec![srv]), now);

    let q4 = parse(&drain_writes(&mut e)[0].message);
    assert_eq!(q4.questions[0].typ, DnsType::A);
    assert_eq!(q4.questions[0].name.data, "ns1.example.com.");

    let a = answer("ns1.example.com.", Box::new(AResource { a: [10, 0, 0, 9] }));
    deliver(&mut e, server, response_to(&q4, vec![a]), now);

    // No outstanding chained query remains, and the registration's update
    // goes straight to the discovered endpoint.
    assert!(e.zones.is_empty());
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].transport.peer_addr,
        "10.0.0.9:53".parse().unwrap()
    );
    let update = parse(&writes[0].message);
    assert_eq!(update.header.op_code, crate::message::OPCODE_UPDATE);
    assert_eq!(update.questions[0].typ, DnsType::Soa);
    assert_eq!(update.questions[0].name.data, "example.com.");
    // Delete-then-add semantics for the RRset, plus the lease option.
    assert_eq!(update.authorities.len(), 2);
    assert_eq!(update.update_lease_option(), Some(7200));
}

#[test]
fn test_zone_chain_root_failure_is_no_such_name() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let server: SocketAddr = SERVER.parse().unwrap();

    e.register_record("host.example.", Rdata::A(Ipv4Addr::new(203, 0, 113, 5)), 120, now)
        .unwrap();

    // Empty SOA answers all the way to the root.
    for _ in 0..3 {
        let writes = drain_writes(&mut e);
        if writes.is_empty() {
            break;
        }
        let q = parse(&writes[0].message);
        deliver(&mut e, server, response_to(&q, vec![]), now);
    }
    assert!(e.zones.is_empty());
    // The record is still waiting for zone data; nothing was sent.
    let rr = e.records.values().next().unwrap();
    assert_eq!(rr.state, RegState::FetchingZoneData);
    assert!(rr.update_server.is_none());
}

#[test]
fn test_nat_map_and_unmap_on_stop() {
    let now = Instant::now();
    let mut e = natted_engine();
    let op = e
        .start_nat_operation(NatKind::MapUdp, 5000, 5000, 7200, now)
        .unwrap();

    e.handle_timeout(now).unwrap();
    let writes = drain_writes(&mut e);
    let router_addr: SocketAddr = SocketAddr::new(IpAddr::V4(ROUTER), natpmp::NATPMP_PORT);
    // Address discovery plus the mapping request, both to the gateway.
    assert!(writes.iter().all(|w| w.transport.peer_addr == router_addr));
    assert!(writes.iter().any(|w| w.message.len() == 2));
    assert!(writes.iter().any(|w| w.message.len() == 12));

    // Gateway grants the mapping and reports the external address.
    let mut addr_reply = vec![0, 0x80, 0, 0, 0, 0, 0, 60];
    addr_reply.extend_from_slice(&[203, 0, 113, 80]);
    deliver(&mut e, router_addr, addr_reply, now);

    let mut map_reply = vec![0, 0x81, 0, 0, 0, 0, 0, 61];
    map_reply.extend_from_slice(&5000u16.to_be_bytes());
    map_reply.extend_from_slice(&61000u16.to_be_bytes());
    map_reply.extend_from_slice(&7200u32.to_be_bytes());
    deliver(&mut e, router_addr, map_reply, now);

    e.handle_timeout(now + Duration::from_millis(10)).unwrap();
    let events = drain_events(&mut e);
    let update = events
        .iter()
        .find_map(|ev| match ev {
            Event::Nat(u) if u.op == op => Some(u.clone()),
            _ => None,
        })
        .expect("NAT update delivered");
    assert_eq!(update.external_address, Ipv4Addr::new(203, 0, 113, 80));
    assert_eq!(update.external_port, 61000);
    assert_eq!(update.result, NatResult::Ok);
    assert!(update.lifetime > 0);

    // Stopping the only mapping for this protocol+port sends lease 0.
    drain_writes(&mut e);
    e.stop_nat_operation(op, now).unwrap();
    assert!(e.nat_ops.is_empty());
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    let pkt = &writes[0].message;
    assert_eq!(pkt[1], natpmp::NATOP_MAP_UDP);
    assert_eq!(&pkt[8..12], &[0, 0, 0, 0]); // requested lease 0
}

#[test]
fn test_nat_double_nat_classification() {
    let now = Instant::now();
    let mut e = natted_engine();
    let op = e
        .start_nat_operation(NatKind::AddressOnly, 0, 0, 0, now)
        .unwrap();
    e.handle_timeout(now).unwrap();
    drain_writes(&mut e);

    // The gateway's "external" address is itself private: double NAT.
    let router_addr = SocketAddr::new(IpAddr::V4(ROUTER), natpmp::NATPMP_PORT);
    let mut addr_reply = vec![0, 0x80, 0, 0, 0, 0, 0, 9];
    addr_reply.extend_from_slice(&[10, 1, 1, 1]);
    deliver(&mut e, router_addr, addr_reply, now);

    e.handle_timeout(now + Duration::from_millis(10)).unwrap();
    let events = drain_events(&mut e);
    let update = events
        .iter()
        .find_map(|ev| match ev {
            Event::Nat(u) if u.op == op => Some(u.clone()),
            _ => None,
        })
        .expect("NAT update delivered");
    assert_eq!(update.result, NatResult::DoubleNat);
}

#[test]
fn test_nat_gateway_reboot_forces_remap() {
    let now = Instant::now();
    let mut e = natted_engine();
    e.start_nat_operation(NatKind::MapUdp, 5000, 5000, 7200, now)
        .unwrap();
    e.handle_timeout(now).unwrap();
    drain_writes(&mut e);

    let router_addr = SocketAddr::new(IpAddr::V4(ROUTER), natpmp::NATPMP_PORT);
    let mut map_reply = vec![0, 0x81, 0, 0];
    map_reply.extend_from_slice(&10_000u32.to_be_bytes()); // uptime
    map_reply.extend_from_slice(&5000u16.to_be_bytes());
    map_reply.extend_from_slice(&61000u16.to_be_bytes());
    map_reply.extend_from_slice(&7200u32.to_be_bytes());
    deliver(&mut e, router_addr, map_reply.clone(), now);
    assert!(e.nat_ops[0].expiry.is_some());

    // Later an announcement carries an uptime that ran backwards: the
    // gateway rebooted and forgot the mapping.
    let later = now + Duration::from_secs(30);
    let mut rebooted = vec![0, 0x80, 0, 0];
    rebooted.extend_from_slice(&5u32.to_be_bytes());
    rebooted.extend_from_slice(&[203, 0, 113, 80]);
    deliver(&mut e, router_addr, rebooted, later);
    assert!(e.nat_ops[0].expiry.is_none());

    // The next scheduler pass re-sends the mapping request immediately.
    e.handle_timeout(later + Duration::from_millis(1)).unwrap();
    let writes = drain_writes(&mut e);
    assert!(writes.iter().any(|w| w.message.len() == 12));
}

fn llq_event_packet(name: &str, session: u64, nonce: u16) -> Vec<u8> {
    let mut msg = Message {
        header: Header {
            id: nonce,
            response: true,
            ..Default::default()
        },
        questions: vec![Question {
            name: Name::new(name).unwrap(),
            typ: DnsType::Ptr,
            class: DNSCLASS_INET,
        }],
        additionals: vec![Resource {
            header: ResourceHeader {
                name: Name::root(),
                typ: DnsType::Opt,
                class: DnsClass(1440),
                ..Default::default()
            },
            body: Some(Box::new(OptResource {
                options: vec![DnsOption::Llq(LlqData {
                    vers: 1,
                    op: LLQ_OP_EVENT,
                    err: 0,
                    id: session,
                    lease: 7200,
                })],
                length: 0,
            })),
        }],
        ..Default::default()
    };
    msg.pack().unwrap()
}

#[test]
fn test_llq_event_is_acked_and_idempotent() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let server: SocketAddr = "10.0.0.2:5352".parse().unwrap();
    let qid = e
        .start_query("_ftp._tcp.example.com.", DnsType::Ptr, true, now)
        .unwrap();

    // Put the session into Established directly.
    let expire = now + Duration::from_secs(7200);
    {
        let q = e.questions.get_mut(&qid).unwrap();
        q.state = LlqState::Established;
        q.llq_id = 0x1122334455667788;
        q.serv_addr = Some(server);
        q.req_lease = 7200;
        q.expire = Some(expire);
        q.interval = Some(Duration::from_secs(3600));
        q.last_send = now;
    }

    let pkt = llq_event_packet("_ftp._tcp.example.com.", 0x1122334455667788, 0xABCD);
    deliver(&mut e, server, pkt.clone(), now);

    // Acked in place, answers delivered as authoritative increments.
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].transport.peer_addr, server);
    let ack = parse(&writes[0].message);
    assert_eq!(ack.header.id, 0xABCD);
    assert!(ack.header.response);
    assert_eq!(ack.llq_option().unwrap().op, LLQ_OP_EVENT);
    let events = drain_events(&mut e);
    assert!(matches!(
        events.as_slice(),
        [Event::Answer {
            kind: AnswerKind::LlqEvent,
            ..
        }]
    ));

    // Redelivering the same event packet changes nothing about the session
    // and is acked again.
    deliver(&mut e, server, pkt, now);
    assert_eq!(drain_writes(&mut e).len(), 1);
    let q = e.questions.get(&qid).unwrap();
    assert_eq!(q.req_lease, 7200);
    assert_eq!(q.expire, Some(expire));
    assert_eq!(q.state, LlqState::Established);
}

#[test]
fn test_llq_refresh_reply_renews_lease() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let server: SocketAddr = "10.0.0.2:5352".parse().unwrap();
    let qid = e
        .start_query("_ftp._tcp.example.com.", DnsType::Ptr, true, now)
        .unwrap();
    {
        let q = e.questions.get_mut(&qid).unwrap();
        q.state = LlqState::Established;
        q.llq_id = 7;
        q.serv_addr = Some(server);
        q.req_lease = 7200;
        q.expire = Some(now + Duration::from_secs(2));
        q.interval = Some(Duration::from_millis(1));
        q.last_send = now - Duration::from_secs(1);
    }

    // Refresh fires.
    e.handle_timeout(now).unwrap();
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    let refresh = parse(&writes[0].message);
    let opt = refresh.llq_option().unwrap();
    assert_eq!(opt.op, crate::message::resource::opt::LLQ_OP_REFRESH);
    assert_eq!(opt.id, 7);

    // Confirmation (additionals only, no answers) renews lease and expiry.
    let mut reply = Message {
        header: Header {
            id: refresh.header.id,
            response: true,
            ..Default::default()
        },
        questions: refresh.questions.clone(),
        additionals: vec![Resource {
            header: ResourceHeader {
                name: Name::root(),
                typ: DnsType::Opt,
                class: DnsClass(1440),
                ..Default::default()
            },
            body: Some(Box::new(OptResource {
                options: vec![DnsOption::Llq(LlqData {
                    vers: 1,
                    op: crate::message::resource::opt::LLQ_OP_REFRESH,
                    err: 0,
                    id: 7,
                    lease: 3600,
                })],
                length: 0,
            })),
        }],
        ..Default::default()
    };
    deliver(&mut e, server, reply.pack().unwrap(), now);

    let q = e.questions.get(&qid).unwrap();
    assert_eq!(q.req_lease, 3600);
    assert!(q.expire.unwrap() > now + Duration::from_secs(3000));
    assert_eq!(q.ntries, 0);
    // No caller-visible answer event for a bare refresh confirmation.
    assert!(drain_events(&mut e).is_empty());
}

#[test]
fn test_llq_poll_answer_restarts_handshake() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let qid = e
        .start_query("_ftp._tcp.example.com.", DnsType::Ptr, true, now)
        .unwrap();
    {
        let q = e.questions.get_mut(&qid).unwrap();
        q.state = LlqState::Poll;
        q.interval = Some(Duration::from_secs(1));
        q.last_send = now;
    }
    let msg_id = e.questions.get(&qid).unwrap().msg_id;

    let query = Message::query(msg_id, Name::new("_ftp._tcp.example.com.").unwrap(), DnsType::Ptr);
    let reply = response_to(&query, vec![]);
    deliver(&mut e, SERVER.parse().unwrap(), reply, now);

    let q = e.questions.get(&qid).unwrap();
    assert_eq!(q.state, LlqState::InitialRequest);
    assert!(q.serv_addr.is_none());
    let events = drain_events(&mut e);
    // Poll answers are the entire current truth.
    assert!(matches!(
        events.as_slice(),
        [Event::Answer {
            kind: AnswerKind::LlqFull,
            ..
        }]
    ));
}

#[test]
fn test_service_target_transitions() {
    let now = Instant::now();
    let mut e = natted_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();

    let sid = e
        .register_service(
            "My Files._ftp._tcp.example.com.",
            21,
            vec!["path=/".into()],
            120,
            None,
            now,
        )
        .unwrap();
    drain_writes(&mut e);

    // Without a target the set parks in NoTarget.
    {
        let s = e.services.get_mut(&sid).unwrap();
        s.state = RegState::NoTarget;
        s.update_server = None;
        s.nta = None;
    }
    e.zones.clear();

    // A dynamic hostname becomes available (registered address record).
    e.hostnames.push(HostnameEntry {
        fqdn: Name::new("myhost.example.com.").unwrap(),
        record: None,
    });
    let rid = e
        .register_record("myhost.example.com.", Rdata::A(Ipv4Addr::new(203, 0, 113, 9)), 120, now)
        .unwrap();
    e.records.get_mut(&rid).unwrap().state = RegState::Registered;
    e.hostnames[0].record = Some(rid);

    // Target present, no zone data: the set moves to FetchingZoneData.
    e.update_service_targets(now);
    assert_eq!(e.services[&sid].state, RegState::FetchingZoneData);

    // Zone data arrives naming a public update server while our own
    // address is private: NAT mapping comes before the registration.
    let zd = ZoneData {
        zone: Name::new("example.com.").unwrap(),
        host: Some(Name::new("ns1.example.com.").unwrap()),
        port: 53,
        addr: Some(Ipv4Addr::new(198, 51, 100, 4)),
        private: false,
    };
    e.service_got_zone_data(sid, Ok(zd), now);
    assert_eq!(e.services[&sid].state, RegState::NatMap);
    assert!(e.services[&sid].nat.is_some());
}

#[test]
fn test_service_registration_message_shape() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();

    let sid = e
        .register_service(
            "My Files._ftp._tcp.example.com.",
            21,
            vec!["path=/".into()],
            120,
            Some("fileserver.example.com."),
            now,
        )
        .unwrap();
    drain_writes(&mut e);

    let zd = ZoneData {
        zone: Name::new("example.com.").unwrap(),
        host: Some(Name::new("ns1.example.com.").unwrap()),
        port: 53,
        addr: Some(Ipv4Addr::new(198, 51, 100, 4)),
        private: false,
    };
    e.service_got_zone_data(sid, Ok(zd), now);
    assert_eq!(e.services[&sid].state, RegState::Pending);

    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    let update = parse(&writes[0].message);
    assert_eq!(update.header.op_code, crate::message::OPCODE_UPDATE);
    // delete-all, PTR, TXT, SRV.
    assert_eq!(update.authorities.len(), 4);
    let srv = update
        .authorities
        .iter()
        .find(|r| r.header.typ == DnsType::Srv)
        .expect("SRV present");
    let body = srv
        .body
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<SrvResource>()
        .unwrap();
    assert_eq!(body.port, 21);
    assert_eq!(body.target.data, "fileserver.example.com.");
    assert!(
        update
            .authorities
            .iter()
            .any(|r| r.header.typ == DnsType::Ptr)
    );
    assert!(
        update
            .authorities
            .iter()
            .any(|r| r.header.typ == DnsType::Txt)
    );
}

#[test]
fn test_name_conflict_triggers_self_conflict_probe() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let sid = e
        .register_service(
            "My Files._ftp._tcp.example.com.",
            21,
            vec![],
            120,
            Some("fileserver.example.com."),
            now,
        )
        .unwrap();
    drain_writes(&mut e);
    let zd = ZoneData {
        zone: Name::new("example.com.").unwrap(),
        host: Some(Name::new("ns1.example.com.").unwrap()),
        port: 53,
        addr: Some(Ipv4Addr::new(198, 51, 100, 4)),
        private: false,
    };
    e.service_got_zone_data(sid, Ok(zd), now);
    let first = parse(&drain_writes(&mut e)[0].message);

    // Server reports a name conflict (YXDOMAIN): one self-conflict probe
    // goes out before surfacing the failure.
    let mut conflict = Message {
        header: Header {
            id: first.header.id,
            response: true,
            op_code: crate::message::OPCODE_UPDATE,
            rcode: crate::message::RCode::YxDomain,
            ..Default::default()
        },
        ..Default::default()
    };
    deliver(&mut e, "198.51.100.4:53".parse().unwrap(), conflict.pack().unwrap(), now);

    assert!(e.services[&sid].test_self_conflict);
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    let probe = parse(&writes[0].message);
    // The probe carries the prerequisite (SRV exists with our value).
    assert_eq!(probe.answers.len(), 1);
    assert_eq!(probe.answers[0].header.typ, DnsType::Srv);

    // The prerequisite fails: the records are someone else's.
    let mut failed = Message {
        header: Header {
            id: probe.header.id,
            response: true,
            op_code: crate::message::OPCODE_UPDATE,
            rcode: crate::message::RCode::NxRrset,
            ..Default::default()
        },
        ..Default::default()
    };
    deliver(&mut e, "198.51.100.4:53".parse().unwrap(), failed.pack().unwrap(), now);

    let events = drain_events(&mut e);
    assert!(events.iter().any(|ev| matches!(
        ev,
        Event::ServiceStatus {
            status: RegStatus::Failed(shared::error::Error::ErrNameConflict),
            ..
        }
    )));
}

#[test]
fn test_update_reply_lease_schedules_refresh() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let rid = e
        .register_record("host.example.com.", Rdata::A(Ipv4Addr::new(203, 0, 113, 5)), 120, now)
        .unwrap();
    drain_writes(&mut e);
    let zd = ZoneData {
        zone: Name::new("example.com.").unwrap(),
        host: Some(Name::new("ns1.example.com.").unwrap()),
        port: 53,
        addr: Some(Ipv4Addr::new(198, 51, 100, 4)),
        private: false,
    };
    e.record_got_zone_data(rid, Ok(zd), now);
    let update = parse(&drain_writes(&mut e)[0].message);

    // Success reply granting a 1000-second lease.
    let mut reply = Message {
        header: Header {
            id: update.header.id,
            response: true,
            op_code: crate::message::OPCODE_UPDATE,
            ..Default::default()
        },
        ..Default::default()
    };
    reply.additionals.push(Resource {
        header: ResourceHeader {
            name: Name::root(),
            typ: DnsType::Opt,
            class: DnsClass(1440),
            ..Default::default()
        },
        body: Some(Box::new(OptResource {
            options: vec![DnsOption::UpdateLease(1000)],
            length: 0,
        })),
    });
    deliver(&mut e, "198.51.100.4:53".parse().unwrap(), reply.pack().unwrap(), now);

    let rr = e.records.get(&rid).unwrap();
    assert_eq!(rr.state, RegState::Registered);
    assert!(rr.expire.is_some());
    // Refresh scheduled at roughly half the lease.
    assert!(rr.interval >= Duration::from_secs(450));
    assert!(rr.interval <= Duration::from_secs(650));
    let events = drain_events(&mut e);
    assert!(events.iter().any(|ev| matches!(
        ev,
        Event::RecordStatus {
            status: RegStatus::Registered,
            ..
        }
    )));
}

#[test]
fn test_registration_backoff_monotone_and_bounded() {
    let mut last = Instant::now();
    let mut interval = Duration::from_secs(3);
    let mut expire = None;

    let mut prev = Duration::ZERO;
    for i in 1..40 {
        let now = last + interval; // full interval elapsed each time
        set_record_retry_probe(&mut last, &mut interval, &mut expire, now);
        assert!(
            interval + Duration::from_millis(1) >= prev,
            "interval shrank at step {i}: {prev:?} -> {interval:?}"
        );
        assert!(interval >= Duration::from_secs(3));
        assert!(interval <= Duration::from_secs(30 * 60 + 95)); // cap + jitter slack
        prev = interval.min(Duration::from_secs(30 * 60));
    }
}

fn set_record_retry_probe(
    last: &mut Instant,
    interval: &mut Duration,
    expire: &mut Option<Instant>,
    now: Instant,
) {
    super::register::set_record_retry(last, interval, expire, false, now);
}

#[test]
fn test_sleep_withdraws_and_parks_registrations() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    let rid = e
        .register_record("host.example.com.", Rdata::A(Ipv4Addr::new(203, 0, 113, 5)), 120, now)
        .unwrap();
    drain_writes(&mut e);
    {
        let rr = e.records.get_mut(&rid).unwrap();
        rr.state = RegState::Registered;
        rr.zone = Some(Name::new("example.com.").unwrap());
        rr.update_server = Some("198.51.100.4:53".parse().unwrap());
        rr.nta = None;
    }
    e.zones.clear();

    e.sleep(now);
    // A deregistration went out, and the record parked in Refresh with the
    // long sleep delay.
    let writes = drain_writes(&mut e);
    assert_eq!(writes.len(), 1);
    let msg = parse(&writes[0].message);
    assert_eq!(msg.header.op_code, crate::message::OPCODE_UPDATE);
    assert_eq!(msg.authorities[0].header.class, crate::message::DNSCLASS_NONE);
    let rr = e.records.get(&rid).unwrap();
    assert_eq!(rr.state, RegState::Refresh);
    assert_eq!(rr.interval, Duration::from_secs(300));
}

#[test]
fn test_engine_close_clears_state() {
    let now = Instant::now();
    let mut e = public_engine();
    e.add_dns_server(0, SERVER.parse().unwrap(), "", now).unwrap();
    e.start_query("a.example.com.", DnsType::A, false, now).unwrap();
    e.close().unwrap();
    assert!(e.poll_write().is_none());
    assert!(e.poll_event().is_none());
    assert!(e.handle_timeout(now).is_err());
}
