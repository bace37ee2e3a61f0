//! Unicast question scheduling: send/retry with backoff, server selection
//! and penalties, defective-relay probing, and the no-server negative path.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, info, trace, warn};

use super::{AnswerKind, Engine, Event, LlqState, QueryId, StreamOwner, UnicastQuestion, ZoneService};
use crate::config::{
    INIT_UCAST_POLL_INTERVAL, INITIAL_QUESTION_INTERVAL, LLQ_DEF_LEASE, LLQ_POLL_INTERVAL,
    MAX_UCAST_POLL_INTERVAL, MAX_UCAST_UNANSWERED_QUERIES, NEGATIVE_ANSWER_TTL,
    PORT53_SUPPRESSION_WINDOW, QUESTION_INTERVAL_STEP, UNICAST_DNS_PORT,
};
use crate::message::name::Name;
use crate::message::{DnsType, Message};
use crate::servers::TestState;
use shared::error::{Error, Result};
use shared::TransportContext;

/// The canary name: a legal query that black-holes at any properly
/// configured server, but that defective home-gateway DNS relays answer
/// positively, giving themselves away.
pub(crate) const RELAY_TEST_QUESTION: &str =
    "1.0.0.127.dnsbugtest.1.0.0.127.in-addr.arpa.";

/// Whether a question may skip the canary probe: anything with credentials
/// (sent directly to the authoritative server over TLS), any non-PTR query,
/// and vanilla `a.b.c.d.in-addr.arpa.` reverse lookups.
pub(crate) fn no_test_query(name: &Name, qtype: DnsType, private: bool) -> bool {
    if private {
        return true;
    }
    if qtype != DnsType::Ptr {
        return true;
    }
    let labels: Vec<&str> = name.labels().collect();
    if labels.len() < 6 {
        return false;
    }
    for label in &labels[..4] {
        let ok = label.len() <= 3 && !label.is_empty() && label.parse::<u16>().is_ok_and(|v| v <= 255);
        if !ok {
            return false;
        }
    }
    labels[4].eq_ignore_ascii_case("in-addr") && labels[5].eq_ignore_ascii_case("arpa")
}

impl Engine {
    /// Starts a unicast question. Long-lived questions maintain an LLQ
    /// subscription; one-shot questions complete on the first answer.
    pub fn start_query(
        &mut self,
        name: &str,
        qtype: DnsType,
        long_lived: bool,
        now: Instant,
    ) -> Result<QueryId> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let name = Name::new(name)?;
        let id = self.next_handle();
        let msg_id = self.new_message_id();
        let server = self.servers.select(&name, now);
        let (auth, private) = if qtype == DnsType::Soa {
            (None, false)
        } else {
            match self.auth.lookup(&name, now) {
                Some(info) => (Some(info.domain.clone()), info.requires_tls),
                None => (None, false),
            }
        };

        debug!("start_query: {name} ({qtype}) long_lived={long_lived} server={server:?}");
        self.questions.insert(
            id,
            UnicastQuestion {
                id,
                name,
                qtype,
                long_lived,
                auth,
                private,
                msg_id,
                last_send: now - INITIAL_QUESTION_INTERVAL,
                interval: Some(INITIAL_QUESTION_INTERVAL),
                unanswered: 0,
                server,
                state: LlqState::InitialRequest,
                llq_id: 0,
                req_lease: LLQ_DEF_LEASE,
                expire: None,
                ntries: 0,
                serv_addr: None,
                serv_lookup_failed: false,
                nta: None,
                stream: None,
            },
        );

        if long_lived {
            self.ensure_llq_nat(now);
        }
        Ok(id)
    }

    /// Stops a question, cancelling its zone discovery and stream first so
    /// late completions cannot touch the dead question.
    pub fn stop_query(&mut self, id: QueryId, now: Instant) -> Result<()> {
        let mut q = self.questions.remove(&id).ok_or(Error::ErrNoSuchQuestion)?;
        if let Some(zid) = q.nta.take() {
            self.cancel_zone_query(zid);
        }
        if let Some(stream) = q.stream.take() {
            self.dispose_stream(stream);
        }
        if q.long_lived {
            self.maybe_stop_llq_nat(now);
        }
        Ok(())
    }

    pub(crate) fn check_questions(&mut self, now: Instant) {
        let ids: Vec<QueryId> = self.questions.keys().copied().collect();
        for qid in ids {
            self.check_question(qid, now);
        }
    }

    fn check_question(&mut self, qid: QueryId, now: Instant) {
        let Some(q) = self.questions.get(&qid) else {
            return;
        };
        let Some(interval) = q.interval else {
            return;
        };
        let mut sendtime = q.last_send + interval;
        // Never let a standard query slip inside the probe suppression
        // window.
        if !q.long_lived
            && let Some(s) = self.suppress_port53_until
            && sendtime < s
        {
            sendtime = s;
        }
        if now < sendtime {
            return;
        }

        if q.long_lived {
            match q.state {
                LlqState::InitialRequest => self.start_llq_handshake(qid, now),
                LlqState::SecondaryRequest => self.send_challenge_response(qid, None, now),
                LlqState::Established => self.send_llq_refresh(qid, now),
                LlqState::Poll => {}
            }
        }

        // Re-check: the handshake may have demoted the question to polling,
        // in which case it proceeds through the plain-query path below.
        let Some(q) = self.questions.get(&qid) else {
            return;
        };
        if q.long_lived && q.state != LlqState::Poll {
            return;
        }

        if q.unanswered >= MAX_UCAST_UNANSWERED_QUERIES {
            self.penalize_server(qid, true, now);
        }

        self.send_plain_query(qid, now);
    }

    fn send_plain_query(&mut self, qid: QueryId, now: Instant) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        // Drop a binding to a server that has since been disabled or
        // penalized; selection skips such servers.
        if let Some(sid) = q.server
            && self
                .servers
                .get(sid)
                .is_none_or(|s| !s.test_state.usable() || s.penalized(now))
        {
            q.server = None;
        }
        if q.server.is_none() {
            q.server = self.servers.select(&q.name, now);
        }
        let Some(q) = self.questions.get(&qid) else {
            return;
        };
        let q_msg_id = q.msg_id;
        let q_name = q.name.clone();
        let q_qtype = q.qtype;
        let q_server = q.server;
        let q_long_lived = q.long_lived;
        let private = q.private;
        let discovery_idle = q.nta.is_none() && q.stream.is_none();

        let server = q_server.and_then(|sid| self.servers.get(sid)).cloned();
        let Some(server) = server else {
            self.answer_negatively(qid, now);
            return;
        };

        let skip_test = no_test_query(&q_name, q_qtype, private);

        if private {
            // Private queries first need the encrypted query endpoint for
            // the zone; discovery itself always runs in the clear.
            if discovery_idle {
                let service = if q_long_lived {
                    ZoneService::Llq
                } else {
                    ZoneService::Query
                };
                let zid = self.start_zone_query(
                    &q_name,
                    service,
                    true,
                    super::ZoneOwner::Question(qid),
                    now,
                );
                if let Some(q) = self.questions.get_mut(&qid) {
                    q.nta = Some(zid);
                }
            }
            self.advance_question_interval(qid, now, true);
            return;
        }

        let mut raw = None;
        if server.test_state != TestState::Untested || skip_test {
            let mut msg = Message::query(q_msg_id, q_name.clone(), q_qtype);
            match msg.pack() {
                Ok(r) => raw = Some(r),
                Err(err) => {
                    warn!("failed to build query for {q_name}: {err}");
                    return;
                }
            }
        } else if server.may_probe(now) {
            // Canary first: if this server is a defective relay, find out
            // with a harmless probe before risking the real PTR query.
            info!("sending relay test query to {}", server.addr);
            let mid = self.new_message_id();
            let probe = Name::new(RELAY_TEST_QUESTION).expect("static name");
            let mut msg = Message::query(mid, probe, DnsType::Ptr);
            match msg.pack() {
                Ok(r) => {
                    raw = Some(r);
                    if let Some(sid) = q_server
                        && let Some(s) = self.servers.get_mut(sid)
                    {
                        s.last_test = Some(now);
                        s.test_id = mid;
                    }
                    if let Some(q) = self.questions.get_mut(&qid) {
                        q.interval = Some(INIT_UCAST_POLL_INTERVAL / QUESTION_INTERVAL_STEP);
                    }
                }
                Err(err) => warn!("failed to build relay test query: {err}"),
            }
        }

        if let Some(raw) = raw {
            self.send_udp(server.addr, raw, now);
            if server.addr.port() == UNICAST_DNS_PORT {
                self.suppress_port53_until = Some(now + PORT53_SUPPRESSION_WINDOW);
            }
        }

        self.advance_question_interval(qid, now, false);
    }

    fn advance_question_interval(&mut self, qid: QueryId, now: Instant, private: bool) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        let Some(interval) = q.interval else {
            return;
        };
        let mut next = interval * QUESTION_INTERVAL_STEP;
        if next > MAX_UCAST_POLL_INTERVAL {
            next = MAX_UCAST_POLL_INTERVAL;
        }
        if q.long_lived && q.state == LlqState::Poll {
            // Degraded mode: poll on the long interval with jitter.
            next = Self::jittered(LLQ_POLL_INTERVAL, LLQ_POLL_INTERVAL / 10);
        } else if private {
            // Private questions wait for zone discovery plus a stream; do
            // not retransmit on the fast schedule.
            if next < INIT_UCAST_POLL_INTERVAL {
                next = INIT_UCAST_POLL_INTERVAL;
            }
            if next > LLQ_POLL_INTERVAL {
                next = LLQ_POLL_INTERVAL;
            }
        }
        q.interval = Some(next);
        q.unanswered += 1;
        q.last_send = now;
    }

    /// No usable server: purge/insert a negative cache entry through the
    /// boundary and park the question until configuration changes.
    fn answer_negatively(&mut self, qid: QueryId, _now: Instant) {
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        info!("no usable DNS server for {} ({})", q.name, q.qtype);
        q.interval = None;
        q.unanswered = 0;
        self.events.push_back(Event::NegativeAnswer {
            query: qid,
            ttl: NEGATIVE_ANSWER_TTL,
        });
    }

    /// Applies the server-rotation policy after failures: penalize (PTR
    /// exempt), re-select, and when a rotation happened on a counted
    /// failure pull the already-doubled retry interval back one step.
    pub(crate) fn penalize_server(&mut self, qid: QueryId, query_failed: bool, now: Instant) {
        let Some(q) = self.questions.get(&qid) else {
            return;
        };
        let orig = q.server;
        let qtype = q.qtype;
        if let Some(sid) = orig {
            if self.config.strict_server_ordering {
                debug!("strict server ordering: not penalizing");
            } else if qtype == DnsType::Ptr {
                debug!("not penalizing server for PTR question");
            } else {
                self.servers.penalize(sid, now);
            }
        }

        let name = q.name.clone();
        let new = self.servers.select(&name, now);
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        q.server = new;
        if new != orig
            && query_failed
            && let Some(interval) = q.interval
        {
            // The failure path already multiplied the interval; rotating to
            // a fresh server undoes one step so the new server is not
            // punished for its predecessor.
            let reduced = (interval / QUESTION_INTERVAL_STEP).max(INITIAL_QUESTION_INTERVAL);
            q.interval = Some(reduced);
        }
        q.unanswered = 0;
    }

    /// Handles a reply to the canary probe. Returns true when the message
    /// was the probe answer (handled), regardless of verdict.
    pub(crate) fn handle_probe_response(
        &mut self,
        msg: &Message,
        from: SocketAddr,
        now: Instant,
    ) -> bool {
        if msg.questions.len() != 1 {
            return false;
        }
        let pktq = &msg.questions[0];
        if pktq.typ != DnsType::Ptr {
            return false;
        }
        let probe = Name::new(RELAY_TEST_QUESTION).expect("static name");
        if !pktq.name.data.eq_ignore_ascii_case(&probe.data) {
            return false;
        }

        // A positive answer to this nonsense query is the fingerprint of a
        // defective relay; an error or empty answer is a pass.
        let result = if msg.header.rcode == crate::message::RCode::Success
            && !msg.answers.is_empty()
        {
            TestState::Failed
        } else {
            TestState::Passed
        };

        let mut passed_sid = None;
        if let Some(s) = self.servers.find_probe_target(from, msg.header.id) {
            s.test_state = result;
            match result {
                TestState::Passed => {
                    info!("DNS server {} passed relay test", s.addr);
                    passed_sid = Some(s.sid);
                }
                _ => warn!(
                    "wide-area service discovery disabled for defective DNS relay {}",
                    s.addr
                ),
            }
        }

        // A pass unblocks the questions that were waiting on the verdict.
        if let Some(sid) = passed_sid {
            for q in self.questions.values_mut() {
                if q.server == Some(sid) && !no_test_query(&q.name, q.qtype, q.private) {
                    let interval = INIT_UCAST_POLL_INTERVAL / QUESTION_INTERVAL_STEP;
                    q.interval = Some(interval);
                    q.unanswered = 0;
                    q.last_send = now - interval;
                }
            }
        }
        true
    }

    /// Delivers a plain query response to the matching one-shot question.
    pub(crate) fn handle_query_response(
        &mut self,
        msg: &Message,
        raw: &[u8],
        via: TransportContext,
        now: Instant,
    ) {
        let mut matched = None;
        for q in self.questions.values() {
            if q.msg_id == msg.header.id && !q.long_lived {
                matched = Some(q.id);
                break;
            }
        }
        let Some(qid) = matched else {
            trace!("response id {} matches no active question", msg.header.id);
            return;
        };

        // Truncated UDP answer: retry the question over a stream to the
        // same server.
        if msg.header.truncated && !via.transport_protocol.is_stream() {
            let q = &self.questions[&qid];
            if q.stream.is_none() {
                debug!("truncated response for {}; retrying over TCP", q.name);
                let mut query = Message::query(q.msg_id, q.name.clone(), q.qtype);
                if let Ok(qraw) = query.pack() {
                    let stream = self.open_stream(
                        via.peer_addr,
                        false,
                        StreamOwner::Question(qid),
                        Some(qraw),
                        now,
                    );
                    if let Some(q) = self.questions.get_mut(&qid) {
                        q.stream = Some(stream);
                    }
                }
            }
            return;
        }

        if let Some(q) = self.questions.get_mut(&qid) {
            q.unanswered = 0;
        }
        self.events.push_back(Event::Answer {
            query: qid,
            kind: AnswerKind::Plain,
            message: BytesMut::from(raw),
        });
        // One-shot questions complete on the first answer.
        let _ = self.stop_query(qid, now);
    }

    /// Re-resolves every question's credential binding, after credential
    /// additions, purges, and configuration replays.
    pub(crate) fn rebind_questions(&mut self, now: Instant) {
        let ids: Vec<QueryId> = self.questions.keys().copied().collect();
        for qid in ids {
            let Some(q) = self.questions.get(&qid) else {
                continue;
            };
            let (auth, private) = if q.qtype == DnsType::Soa {
                (None, false)
            } else {
                match self.auth.lookup(&q.name, now) {
                    Some(info) => (Some(info.domain.clone()), info.requires_tls),
                    None => (None, false),
                }
            };
            if let Some(q) = self.questions.get_mut(&qid)
                && (q.auth != auth || q.private != private)
            {
                debug!(
                    "rebinding credentials for {}: {:?} -> {:?}",
                    q.name, q.auth, auth
                );
                q.auth = auth;
                q.private = private;
            }
        }
    }

    /// Wakes questions parked for lack of a server.
    pub(crate) fn unpark_questions(&mut self, now: Instant) {
        for q in self.questions.values_mut() {
            if q.interval.is_none() {
                q.interval = Some(INITIAL_QUESTION_INTERVAL);
                q.last_send = now - INITIAL_QUESTION_INTERVAL;
                q.server = None;
            }
        }
    }

    /// Lazily purges expired credentials, keeping any with a live encrypted
    /// transport, then rebinds questions.
    pub(crate) fn purge_credentials(&mut self, now: Instant) {
        let tls_names: Vec<Name> = self
            .streams
            .values()
            .filter(|c| c.tls)
            .filter_map(|c| match c.owner {
                StreamOwner::Question(qid) => self.questions.get(&qid).map(|q| q.name.clone()),
                StreamOwner::Record(rid) => self.records.get(&rid).map(|r| r.name.clone()),
                StreamOwner::Service(sid) => self.services.get(&sid).map(|s| s.srv_name.clone()),
            })
            .collect();
        let purged = self
            .auth
            .purge_expired(now, |domain| tls_names.iter().any(|n| n.ends_with(domain)));
        if !purged.is_empty() {
            self.rebind_questions(now);
        }
    }
}
