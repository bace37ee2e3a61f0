//! Long-lived query engine: per-question setup handshake, renewal, event
//! acknowledgment, and the degraded polling mode.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, info, trace, warn};

use super::{
    AnswerKind, Engine, Event, LlqState, NatKind, NatOwner, QueryId, StreamOwner, ZoneData,
    ZoneOwner, ZoneService,
};
use crate::config::{
    INIT_UCAST_POLL_INTERVAL, LLQ_DEF_LEASE, LLQ_INIT_RESEND, LLQ_MAX_TRIES, LLQ_POLL_INTERVAL,
    MULTICAST_DNS_PORT, NATMAP_DEFAULT_LEASE, STREAM_CONNECT_RETRY,
};
use crate::message::resource::opt::{
    DnsOption, LLQ_OP_EVENT, LLQ_OP_REFRESH, LLQ_OP_SETUP, LlqData, OptResource,
};
use crate::message::resource::{Resource, ResourceHeader};
use crate::message::{DnsClass, DnsType, Message, Name, RCode};
use shared::error::{Error, Result};

/// Builds a question-plus-LLQ-option message. `response` distinguishes the
/// event acknowledgment (which echoes the server's message id).
pub(crate) fn llq_message(
    msg_id: u16,
    name: Name,
    qtype: DnsType,
    llq: LlqData,
    response: bool,
) -> Result<Vec<u8>> {
    let mut msg = Message::query(msg_id, name, qtype);
    msg.header.response = response;
    msg.additionals.push(Resource {
        header: ResourceHeader {
            name: Name::root(),
            typ: DnsType::Opt,
            class: DnsClass(1440),
            ..Default::default()
        },
        body: Some(Box::new(OptResource {
            options: vec![DnsOption::Llq(llq)],
            length: 0,
        })),
    });
    msg.pack()
}

impl Engine {
    // ---- event-port plumbing ----

    /// Starts the engine-owned UDP mapping for the LLQ event port the first
    /// time a long-lived question appears behind a NAT.
    pub(crate) fn ensure_llq_nat(&mut self, now: Instant) {
        if !self.behind_nat() || self.llq_nat.is_some() {
            return;
        }
        debug!("starting LLQ event-port mapping");
        match self.start_nat_op_internal(
            NatKind::MapUdp,
            MULTICAST_DNS_PORT,
            MULTICAST_DNS_PORT,
            NATMAP_DEFAULT_LEASE,
            NatOwner::Llq,
            now,
        ) {
            Ok(id) => self.llq_nat = Some(id),
            Err(err) => warn!("failed to start LLQ event-port mapping: {err}"),
        }
    }

    /// Stops the event-port mapping once no long-lived question remains.
    pub(crate) fn maybe_stop_llq_nat(&mut self, now: Instant) {
        if self.questions.values().any(|q| q.long_lived) {
            return;
        }
        if let Some(id) = self.llq_nat.take() {
            debug!("stopping LLQ event-port mapping");
            let _ = self.stop_nat_op_internal(id, now);
        }
    }

    /// Current LLQ inbound-event capability: whether NAT state is known,
    /// and which external port events can reach.
    pub(crate) fn llq_nat_state(&self) -> (bool, u16) {
        if self.have_routable() {
            return (true, MULTICAST_DNS_PORT);
        }
        if let Some(id) = self.llq_nat
            && let Some(op) = self.nat_ops.iter().find(|o| o.id == id)
        {
            return match op.last_result {
                None => (false, 0),
                Some(_) => (true, op.last_port.unwrap_or(0)),
            };
        }
        (false, 0)
    }

    /// UDP port the server should deliver event packets to when the
    /// session runs over a stream: the mapped external port behind a NAT,
    /// the well-known port otherwise.
    pub(crate) fn llq_event_port(&self) -> u16 {
        if self.behind_nat() {
            self.llq_nat_state().1
        } else {
            MULTICAST_DNS_PORT
        }
    }

    // ---- handshake ----

    pub(crate) fn start_llq_handshake(&mut self, qid: QueryId, now: Instant) {
        let (nat_ready, event_port) = self.llq_nat_state();
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };

        if !nat_ready {
            // NAT state unknown; look again later.
            info!("LLQ {}: waiting for NAT state", q.name);
            q.interval = Some(Self::jittered(LLQ_POLL_INTERVAL, LLQ_POLL_INTERVAL / 10));
            q.last_send = now;
            return;
        }
        if event_port == 0 {
            // Cannot receive inbound event packets; degrade to polling.
            info!("LLQ {}: cannot receive inbound packets, polling", q.name);
            self.start_llq_polling(qid, now);
            return;
        }

        if q.serv_addr.is_none() {
            debug!("LLQ {}: discovering LLQ service endpoint", q.name);
            q.interval = Some(Self::jittered(LLQ_POLL_INTERVAL, LLQ_POLL_INTERVAL / 10));
            q.last_send = now;
            let name = q.name.clone();
            let private = q.private;
            if let Some(zid) = q.nta.take() {
                self.cancel_zone_query(zid);
            }
            let zid = self.start_zone_query(
                &name,
                ZoneService::Llq,
                private,
                ZoneOwner::Question(qid),
                now,
            );
            if let Some(q) = self.questions.get_mut(&qid) {
                q.nta = Some(zid);
            }
            return;
        }

        if q.auth.is_some() && q.private {
            // Private transport: open the stream now and skip straight to
            // the secondary request; the four-way handshake collapses to
            // two steps over TLS.
            let serv = q.serv_addr.expect("checked above");
            if let Some(old) = q.stream.take() {
                info!("LLQ {}: disposing existing stream", q.name);
                self.dispose_stream(old);
            }
            let stream = self.open_stream(serv, true, StreamOwner::Question(qid), None, now);
            if let Some(q) = self.questions.get_mut(&qid) {
                q.stream = Some(stream);
                q.state = LlqState::SecondaryRequest;
                q.req_lease = LLQ_DEF_LEASE;
                q.interval = Some(STREAM_CONNECT_RETRY);
                q.last_send = now;
                q.ntries = 0;
            }
            return;
        }

        // Public UDP handshake.
        if q.ntries >= LLQ_MAX_TRIES {
            warn!("LLQ {}: {} failed attempts, polling", q.name, LLQ_MAX_TRIES);
            self.start_llq_polling(qid, now);
            return;
        }
        q.ntries += 1;

        let llq = LlqData {
            vers: crate::config::LLQ_VERS,
            op: LLQ_OP_SETUP,
            err: 0,
            id: 0,
            lease: LLQ_DEF_LEASE,
        };
        let (msg_id, name, qtype, serv) = (q.msg_id, q.name.clone(), q.qtype, q.serv_addr);
        q.state = LlqState::InitialRequest;
        q.req_lease = LLQ_DEF_LEASE;
        q.interval = Some(LLQ_INIT_RESEND);
        q.last_send = now;

        match llq_message(msg_id, name, qtype, llq, false) {
            Ok(raw) => {
                if let Some(serv) = serv {
                    self.send_udp(serv, raw, now);
                }
            }
            Err(err) => {
                warn!("failed to build LLQ setup: {err}");
                self.start_llq_polling(qid, now);
            }
        }
    }

    /// Sends (or retransmits) the challenge response. `llq` is None on a
    /// timer-driven retransmission.
    pub(crate) fn send_challenge_response(
        &mut self,
        qid: QueryId,
        llq: Option<LlqData>,
        now: Instant,
    ) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        q.ntries += 1;
        if q.ntries > LLQ_MAX_TRIES {
            warn!(
                "LLQ {}: {} failed challenge attempts, polling",
                q.name, LLQ_MAX_TRIES
            );
            self.start_llq_polling(qid, now);
            return;
        }

        let llq = llq.unwrap_or(LlqData {
            vers: crate::config::LLQ_VERS,
            op: LLQ_OP_SETUP,
            err: 0,
            id: q.llq_id,
            lease: q.req_lease,
        });

        let stream = q.stream;
        let ntries = q.ntries;
        q.last_send = now;
        q.interval = Some(if stream.is_some() {
            STREAM_CONNECT_RETRY
        } else {
            LLQ_INIT_RESEND * ntries
        });

        let (msg_id, name, qtype, serv) = (q.msg_id, q.name.clone(), q.qtype, q.serv_addr);
        let raw = match llq_message(msg_id, name, qtype, llq, false) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to build challenge response: {err}");
                self.start_llq_polling(qid, now);
                return;
            }
        };

        match stream {
            Some(sid) if self.streams.get(&sid).is_some_and(|c| c.established) => {
                self.send_on_stream(sid, &raw, now);
            }
            Some(_) => {
                // Stream still connecting; the retransmit timer covers a
                // stalled connect.
                trace!("challenge response deferred until stream establishes");
            }
            None => {
                if let Some(serv) = serv {
                    self.send_udp(serv, raw, now);
                }
            }
        }
    }

    fn set_llq_timer(&mut self, qid: QueryId, llq: &LlqData, now: Instant) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        let lease = std::time::Duration::from_secs(llq.lease as u64);
        q.req_lease = llq.lease;
        q.last_send = now;
        q.expire = Some(now + lease);
        q.interval = Some(Self::jittered(lease / 2, lease / 10));
    }

    fn recv_setup_response(&mut self, qid: QueryId, rcode: RCode, llq: &LlqData, now: Instant) {
        if rcode != RCode::Success && rcode != RCode::NameError {
            warn!("LLQ setup response with rcode {rcode}");
            return;
        }
        if llq.op != LLQ_OP_SETUP {
            warn!("LLQ setup response with bad op {}", llq.op);
            return;
        }
        if llq.vers != crate::config::LLQ_VERS {
            warn!("LLQ setup response with bad version {}", llq.vers);
            return;
        }

        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        match q.state {
            LlqState::InitialRequest => {
                if llq.err != 0 {
                    warn!("LLQ setup error {} from server", llq.err);
                    self.start_llq_polling(qid, now);
                    return;
                }
                // Cache the granted lease in case setup never finishes.
                q.req_lease = llq.lease;
                q.expire = Some(now + std::time::Duration::from_secs(llq.lease as u64));
                q.state = LlqState::SecondaryRequest;
                q.llq_id = llq.id;
                q.ntries = 0;
                self.send_challenge_response(qid, Some(*llq), now);
            }
            LlqState::SecondaryRequest => {
                // For the private two-step handshake the session id arrives
                // here, not in a challenge.
                if q.auth.is_some() {
                    debug!("private LLQ secondary: adopting session id {:016x}", llq.id);
                    q.llq_id = llq.id;
                }
                if llq.err != 0 {
                    warn!("LLQ secondary error {} from server", llq.err);
                    self.start_llq_polling(qid, now);
                    return;
                }
                if q.llq_id != llq.id {
                    // Rare with packet loss and reordering.
                    debug!("LLQ session id changed, discarding");
                    return;
                }
                q.state = LlqState::Established;
                q.ntries = 0;
                self.set_llq_timer(qid, llq, now);
            }
            _ => {}
        }
    }

    pub(crate) fn send_llq_refresh(&mut self, qid: QueryId, now: Instant) {
        let event_port = self.llq_event_port();
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };

        if q.req_lease != 0
            && ((q.state == LlqState::Established && q.ntries >= LLQ_MAX_TRIES)
                || q.expire.is_some_and(|e| e <= now))
        {
            warn!("unable to refresh LLQ {}, polling", q.name);
            self.start_llq_polling(qid, now);
            return;
        }

        let llq = LlqData {
            vers: crate::config::LLQ_VERS,
            op: LLQ_OP_REFRESH,
            // Over a stream, tell the server which UDP port takes the
            // subsequent event packets.
            err: if q.stream.is_some() { event_port } else { 0 },
            id: q.llq_id,
            lease: q.req_lease,
        };
        let (msg_id, name, qtype, serv) = (q.msg_id, q.name.clone(), q.qtype, q.serv_addr);
        let private = q.auth.is_some() && q.private;
        let stream = q.stream;
        q.ntries += 1;
        q.last_send = now;

        let mut raw = match llq_message(msg_id, name.clone(), qtype, llq, false) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to build LLQ refresh for {name}: {err}");
                return;
            }
        };
        self.sign_if_bound(&mut raw, &name, now);

        match stream {
            Some(sid) if self.streams.get(&sid).is_some_and(|c| c.established) => {
                self.send_on_stream(sid, &raw, now);
            }
            Some(_) => trace!("LLQ refresh deferred until stream establishes"),
            None if private => {
                if let Some(serv) = serv {
                    info!("LLQ {name}: setting up new TLS session for refresh");
                    let stream =
                        self.open_stream(serv, true, StreamOwner::Question(qid), Some(raw), now);
                    if let Some(q) = self.questions.get_mut(&qid) {
                        q.stream = Some(stream);
                    }
                }
            }
            None => {
                if let Some(serv) = serv {
                    self.send_udp(serv, raw, now);
                }
            }
        }
    }

    /// Enters the degraded polling mode. This is terminal: only an explicit
    /// caller action (network change, poll answer) leaves it.
    pub(crate) fn start_llq_polling(&mut self, qid: QueryId, now: Instant) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        debug!("LLQ {}: polling", q.name);
        q.state = LlqState::Poll;
        q.interval = Some(INIT_UCAST_POLL_INTERVAL);
        // Poll as soon as the scheduler runs.
        q.last_send = now - INIT_UCAST_POLL_INTERVAL;
    }

    /// Routes an incoming standard-query response through the LLQ state
    /// machines. Returns true when the packet belonged to an LLQ session.
    pub(crate) fn handle_llq_response(
        &mut self,
        msg: &Message,
        raw: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> bool {
        if msg.questions.is_empty() {
            return false;
        }
        let pktq = msg.questions[0].clone();
        let opt = msg.llq_option();

        let candidates: Vec<QueryId> = self
            .questions
            .values()
            .filter(|q| {
                q.long_lived
                    && q.qtype == pktq.typ
                    && q.name.data.eq_ignore_ascii_case(&pktq.name.data)
            })
            .map(|q| q.id)
            .collect();

        for qid in candidates {
            let Some(q) = self.questions.get(&qid) else {
                continue;
            };

            // A poll answer promotes the question back to the handshake and
            // carries the entire current truth.
            if q.state == LlqState::Poll && msg.header.id == q.msg_id {
                debug!("LLQ {}: poll response, restarting handshake", q.name);
                let q = self.questions.get_mut(&qid).expect("present");
                q.state = LlqState::InitialRequest;
                q.serv_addr = None;
                q.ntries = 0;
                q.interval = Some(Self::jittered(LLQ_POLL_INTERVAL, LLQ_POLL_INTERVAL / 10));
                q.last_send = now;
                self.events.push_back(Event::Answer {
                    query: qid,
                    kind: AnswerKind::LlqFull,
                    message: BytesMut::from(raw),
                });
                return true;
            }

            // Unsolicited event packets carry the server-chosen nonce, so
            // they match on the session id instead of the message id.
            if let Some(opt) = opt
                && q.state == LlqState::Established
                && opt.op == LLQ_OP_EVENT
                && opt.id == q.llq_id
            {
                trace!("LLQ {}: event packet, acking", q.name);
                let ack = llq_message(msg.header.id, q.name.clone(), q.qtype, opt, true);
                match ack {
                    Ok(ack) => self.send_udp(from, ack, now),
                    Err(err) => warn!("failed to build LLQ ack: {err}"),
                }
                self.events.push_back(Event::Answer {
                    query: qid,
                    kind: AnswerKind::LlqEvent,
                    message: BytesMut::from(raw),
                });
                return true;
            }

            if let Some(opt) = opt
                && msg.header.id == q.msg_id
            {
                // Refresh confirmation: additionals only, no answers.
                if q.state == LlqState::Established
                    && opt.op == LLQ_OP_REFRESH
                    && opt.id == q.llq_id
                    && !msg.additionals.is_empty()
                    && msg.answers.is_empty()
                {
                    if opt.err != 0 {
                        warn!("LLQ refresh reply carried error {}", opt.err);
                    } else {
                        self.set_llq_timer(qid, &opt, now);
                        if let Some(q) = self.questions.get_mut(&qid) {
                            q.ntries = 0;
                        }
                    }
                    return true;
                }

                if (q.state == LlqState::InitialRequest
                    || q.state == LlqState::SecondaryRequest)
                    && q.serv_addr == Some(from)
                {
                    let oldstate = q.state;
                    self.recv_setup_response(qid, msg.header.rcode, &opt, now);
                    // The challenge packet (no answers) says nothing about
                    // the cache; the ack+answers packet is the whole truth.
                    if oldstate == LlqState::SecondaryRequest {
                        self.events.push_back(Event::Answer {
                            query: qid,
                            kind: AnswerKind::LlqFull,
                            message: BytesMut::from(raw),
                        });
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Completion of the LLQ-service zone discovery for a question.
    pub(crate) fn llq_got_zone_data(
        &mut self,
        qid: QueryId,
        result: Result<ZoneData>,
        now: Instant,
    ) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        q.nta = None;
        q.serv_addr = None;

        match result {
            Ok(zd) if zd.port != 0 && zd.addr.is_some_and(|a| !a.is_unspecified()) => {
                let addr = zd.addr.expect("checked");
                q.serv_addr = Some(SocketAddr::new(IpAddr::V4(addr), zd.port));
                if zd.private {
                    let name = q.name.clone();
                    let info = self.auth.lookup(&name, now).map(|i| i.domain.clone());
                    let q = self.questions.get_mut(&qid).expect("present");
                    q.auth = info;
                    q.private = true;
                } else {
                    q.auth = None;
                    q.private = false;
                }
                let q = self.questions.get_mut(&qid).expect("present");
                q.ntries = 0;
                debug!("LLQ {}: endpoint {:?}", q.name, q.serv_addr);
                self.start_llq_handshake(qid, now);
            }
            result => {
                if matches!(result, Err(Error::ErrNoSuchName)) {
                    q.serv_lookup_failed = true;
                }
                self.start_llq_polling(qid, now);
            }
        }
    }

    /// NAT state for the event port changed: re-kick pending handshakes.
    pub(crate) fn llq_nat_changed(&mut self, now: Instant) {
        for q in self.questions.values_mut() {
            if q.long_lived && q.state == LlqState::InitialRequest {
                if let Some(interval) = q.interval {
                    q.last_send = now - interval;
                }
            }
        }
    }
}
