//! Zone resolver: chained one-shot SOA/SRV/A lookups that locate the
//! authoritative update, query or LLQ endpoint for a name.
//!
//! State lives entirely in the [`ZoneQuery`](super::ZoneQuery) descriptor;
//! each step cancels the previous one implicitly because only the current
//! step's message id is matched. Discovery never runs over the private
//! transport: finding the encrypted endpoint requires a cleartext query, and
//! SOA lookups are never private as a rule.

use std::net::Ipv4Addr;
use std::time::Instant;

use log::{debug, info, warn};

use super::{Engine, StreamOwner, ZoneData, ZoneId, ZoneOwner, ZoneQuery, ZoneService};
use crate::config::{
    INIT_UCAST_POLL_INTERVAL, INITIAL_QUESTION_INTERVAL, MAX_UCAST_UNANSWERED_QUERIES,
    QUESTION_INTERVAL_STEP,
};
use crate::message::resource::a::AResource;
use crate::message::resource::srv::SrvResource;
use crate::message::{DnsType, Message, Name};
use shared::error::{Error, Result};

/// SRV owner prefix advertising each zone service, cleartext and private.
fn service_type(service: ZoneService, private: bool) -> Option<&'static str> {
    match (service, private) {
        (ZoneService::Update, false) => Some("_dns-update._udp"),
        (ZoneService::Update, true) => Some("_dns-update-tls._tcp"),
        (ZoneService::Query, false) => None,
        (ZoneService::Query, true) => Some("_dns-query-tls._tcp"),
        (ZoneService::Llq, false) => Some("_dns-llq._udp"),
        (ZoneService::Llq, true) => Some("_dns-llq-tls._tcp"),
    }
}

impl Engine {
    /// Kicks off zone discovery for `name`. The returned handle is owned by
    /// the caller; cancelling before completion must null the caller's
    /// stored handle first.
    pub(crate) fn start_zone_query(
        &mut self,
        name: &Name,
        service: ZoneService,
        private: bool,
        owner: ZoneOwner,
        now: Instant,
    ) -> ZoneId {
        let id = self.next_handle();
        debug!("zone discovery for {name} ({service:?}, private={private})");
        self.zones.insert(
            id,
            ZoneQuery {
                id,
                child: name.clone(),
                current_soa: name.clone(),
                service,
                private,
                owner,
                qname: name.clone(),
                qtype: DnsType::Soa,
                msg_id: 0,
                server: None,
                last_send: now,
                interval: INITIAL_QUESTION_INTERVAL,
                unanswered: 0,
                zone: None,
                host: None,
                port: 0,
                addr: None,
            },
        );
        self.send_zone_step(id, now);
        id
    }

    /// Cancels an outstanding discovery. The caller has already nulled its
    /// stored handle, so a late response cannot be misdelivered.
    pub(crate) fn cancel_zone_query(&mut self, zid: ZoneId) {
        self.zones.remove(&zid);
    }

    fn send_zone_step(&mut self, zid: ZoneId, now: Instant) {
        let msg_id = self.new_message_id();
        let Some(z) = self.zones.get_mut(&zid) else {
            return;
        };
        z.msg_id = msg_id;
        z.last_send = now;
        let qname = z.qname.clone();
        let qtype = z.qtype;

        if z.server.is_none() {
            z.server = self.servers.select(&qname, now);
        }
        let Some(z) = self.zones.get(&zid) else {
            return;
        };
        let Some(server) = z.server.and_then(|sid| self.servers.get(sid)) else {
            info!("zone discovery for {}: no usable DNS server", z.child);
            self.complete_zone_query(zid, Err(Error::ErrNoServer), now);
            return;
        };
        let to = server.addr;

        let mut msg = Message::query(msg_id, qname, qtype);
        match msg.pack() {
            Ok(raw) => self.send_udp(to, raw, now),
            Err(err) => {
                warn!("failed to build zone query: {err}");
                self.complete_zone_query(zid, Err(err), now);
            }
        }
    }

    /// Retransmits due zone steps, rotating servers after repeated silence.
    pub(crate) fn check_zone_queries(&mut self, now: Instant) {
        let ids: Vec<ZoneId> = self.zones.keys().copied().collect();
        for zid in ids {
            let Some(z) = self.zones.get_mut(&zid) else {
                continue;
            };
            if now < z.last_send + z.interval {
                continue;
            }
            z.unanswered += 1;
            let mut next = z.interval * QUESTION_INTERVAL_STEP;
            if next > INIT_UCAST_POLL_INTERVAL * QUESTION_INTERVAL_STEP * 2 {
                next = INIT_UCAST_POLL_INTERVAL * QUESTION_INTERVAL_STEP * 2;
            }
            z.interval = next;
            if z.unanswered >= MAX_UCAST_UNANSWERED_QUERIES {
                if let Some(sid) = z.server.take() {
                    self.servers.penalize(sid, now);
                }
                if let Some(z) = self.zones.get_mut(&zid) {
                    z.unanswered = 0;
                }
            }
            self.send_zone_step(zid, now);
        }
    }

    /// Routes a standard-query response into the matching discovery chain.
    /// Returns true when the message belonged to one.
    pub(crate) fn handle_zone_response(&mut self, msg: &Message, now: Instant) -> bool {
        let Some(zid) = self
            .zones
            .values()
            .find(|z| z.msg_id == msg.header.id)
            .map(|z| z.id)
        else {
            return false;
        };

        let Some(z) = self.zones.get_mut(&zid) else {
            return false;
        };
        z.unanswered = 0;

        match z.qtype {
            DnsType::Soa => {
                if let Some(r) = msg.answer_of_type(DnsType::Soa) {
                    // The answer's owner name is the zone apex.
                    let apex = r.header.name.clone();
                    debug!("zone discovery: SOA at {apex}");
                    z.zone = Some(apex.clone());
                    let private = z.private;
                    let service = z.service;
                    match service_type(service, private) {
                        Some(prefix) => match apex.prepend(prefix) {
                            Ok(srv_name) => {
                                z.qname = srv_name;
                                z.qtype = DnsType::Srv;
                                z.interval = INITIAL_QUESTION_INTERVAL;
                                self.send_zone_step(zid, now);
                            }
                            Err(err) => self.complete_zone_query(zid, Err(err), now),
                        },
                        None => {
                            // Plain query service advertises nothing;
                            // completing without a host means "query in the
                            // clear".
                            z.qname = apex;
                            z.qtype = DnsType::Srv;
                            z.interval = INITIAL_QUESTION_INTERVAL;
                            self.send_zone_step(zid, now);
                        }
                    }
                } else if let Some(parent) = z.current_soa.parent().filter(|p| !p.is_root()) {
                    // No SOA here; walk one label toward the root. The root
                    // itself is never asked.
                    z.current_soa = parent.clone();
                    z.qname = parent;
                    z.interval = INITIAL_QUESTION_INTERVAL;
                    self.send_zone_step(zid, now);
                } else {
                    info!(
                        "zone discovery recursed to root of {} without finding SOA",
                        z.child
                    );
                    self.complete_zone_query(zid, Err(Error::ErrNoSuchName), now);
                }
            }
            DnsType::Srv => {
                let srv = msg.answer_of_type(DnsType::Srv).and_then(|r| {
                    r.body
                        .as_ref()?
                        .as_any()
                        .downcast_ref::<SrvResource>()
                        .map(|b| (b.target.clone(), b.port))
                });
                if let Some((target, port)) = srv {
                    debug!("zone discovery: SRV target {target}:{port}");
                    z.host = Some(target.clone());
                    z.port = port;
                    z.qname = target;
                    z.qtype = DnsType::A;
                    z.interval = INITIAL_QUESTION_INTERVAL;
                    self.send_zone_step(zid, now);
                } else {
                    // No service advertised; the caller decides fallback.
                    z.private = false;
                    z.host = None;
                    z.port = 0;
                    z.addr = None;
                    self.finish_zone_query(zid, now);
                }
            }
            DnsType::A => {
                let addr = msg.answer_of_type(DnsType::A).and_then(|r| {
                    r.body
                        .as_ref()?
                        .as_any()
                        .downcast_ref::<AResource>()
                        .map(|b| Ipv4Addr::from(b.a))
                });
                z.addr = Some(addr.unwrap_or(Ipv4Addr::UNSPECIFIED));
                self.finish_zone_query(zid, now);
            }
            _ => {}
        }
        true
    }

    fn finish_zone_query(&mut self, zid: ZoneId, now: Instant) {
        let Some(z) = self.zones.get(&zid) else {
            return;
        };
        let Some(zone) = z.zone.clone() else {
            self.complete_zone_query(zid, Err(Error::ErrNoSuchName), now);
            return;
        };
        let data = ZoneData {
            zone,
            host: z.host.clone(),
            port: z.port,
            addr: z.addr,
            private: z.private,
        };
        self.complete_zone_query(zid, Ok(data), now);
    }

    fn complete_zone_query(&mut self, zid: ZoneId, result: Result<ZoneData>, now: Instant) {
        let Some(z) = self.zones.remove(&zid) else {
            return;
        };
        debug!(
            "zone discovery for {} complete: {:?}",
            z.child,
            result.as_ref().map(|d| d.zone.clone())
        );
        match z.owner {
            ZoneOwner::Question(qid) => {
                // A polling question stays in polling: its discovery only
                // locates the encrypted endpoint for the next poll, never a
                // new subscription.
                let polling = self
                    .questions
                    .get(&qid)
                    .is_some_and(|q| q.state == super::LlqState::Poll);
                if z.service == ZoneService::Llq && !polling {
                    self.llq_got_zone_data(qid, result, now);
                } else {
                    self.private_query_got_zone_data(qid, result, now);
                }
            }
            ZoneOwner::Record(rid) => self.record_got_zone_data(rid, result, now),
            ZoneOwner::Service(sid) => self.service_got_zone_data(sid, result, now),
        }
    }

    /// Completion of encrypted-query endpoint discovery for a plain private
    /// question.
    pub(crate) fn private_query_got_zone_data(
        &mut self,
        qid: super::QueryId,
        result: Result<ZoneData>,
        now: Instant,
    ) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        q.nta = None;

        let zd = match result {
            Ok(zd) if zd.port != 0 && zd.addr.is_some_and(|a| !a.is_unspecified()) => zd,
            other => {
                info!(
                    "private query endpoint discovery for {} failed: {:?}",
                    q.name,
                    other.err()
                );
                return;
            }
        };

        if !zd.private {
            // No encrypted endpoint advertised: retry in the clear.
            debug!("private endpoint lookup empty; retrying {} plainly", q.name);
            q.auth = None;
            q.private = false;
            q.interval = Some(INITIAL_QUESTION_INTERVAL);
            q.last_send = now - INITIAL_QUESTION_INTERVAL;
            return;
        }
        if q.auth.is_none() {
            warn!("no credentials for private question {}", q.name);
            return;
        }

        let msg_id = self.new_message_id();
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        q.msg_id = msg_id;
        let mut msg = Message::query(msg_id, q.name.clone(), q.qtype);
        let name = q.name.clone();
        let addr = zd.addr.expect("checked");
        let raw = match msg.pack() {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to build private query: {err}");
                return;
            }
        };
        let mut raw = raw;
        self.sign_if_bound(&mut raw, &name, now);

        if let Some(q) = self.questions.get_mut(&qid)
            && let Some(old) = q.stream.take()
        {
            self.dispose_stream(old);
        }
        let peer = std::net::SocketAddr::new(std::net::IpAddr::V4(addr), zd.port);
        let stream = self.open_stream(peer, true, StreamOwner::Question(qid), Some(raw), now);
        if let Some(q) = self.questions.get_mut(&qid) {
            q.stream = Some(stream);
        }
    }
}
