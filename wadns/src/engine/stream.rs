//! Stream transport layer: host-opened TCP/TLS connections carrying
//! length-prefixed DNS messages, with single-owner discipline.
//!
//! The engine asks for connections via [`Event::StreamConnect`] and learns
//! their fate through [`Engine::stream_established`] / [`Engine::stream_input`] /
//! [`Engine::stream_error`]. Every connection has exactly one owner — a
//! question, a record, or a service set — whose back-pointer is cleared
//! before the connection is dropped.

use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, trace, warn};

use super::{Engine, Event, LlqState, StreamConn, StreamOwner};
use crate::config::{
    LLQ_DEF_LEASE, LLQ_POLL_INTERVAL, LLQ_STREAM_INTERVAL_FLOOR, LLQ_VERS,
    INITIAL_QUESTION_INTERVAL, MAX_UCAST_POLL_INTERVAL, QUESTION_INTERVAL_STEP,
};
use crate::message::Message;
use crate::message::resource::opt::{LLQ_OP_SETUP, LlqData};
use shared::tcp_framing::TcpFrameDecoder;
use shared::{StreamId, TransportContext, TransportProtocol};

impl Engine {
    pub(crate) fn open_stream(
        &mut self,
        peer: SocketAddr,
        tls: bool,
        owner: StreamOwner,
        pending: Option<Vec<u8>>,
        _now: Instant,
    ) -> StreamId {
        let id = self.new_stream_id();
        debug!("requesting stream {id:?} to {peer} (tls={tls}) for {owner:?}");
        let local_addr = self.local_ctx();
        self.streams.insert(
            id,
            StreamConn {
                id,
                peer,
                tls,
                owner,
                pending,
                decoder: TcpFrameDecoder::new(),
                established: false,
                replies: 0,
                local_addr,
            },
        );
        self.events.push_back(Event::StreamConnect {
            stream: id,
            peer,
            tls,
        });
        id
    }

    /// Drops a connection. Callers clear the owner's back-pointer first so
    /// the teardown cannot be observed through a stale handle.
    pub(crate) fn dispose_stream(&mut self, id: StreamId) {
        if self.streams.remove(&id).is_some() {
            self.events.push_back(Event::StreamClose { stream: id });
        }
    }

    /// The host finished connecting: the owner's pending message goes out,
    /// or is composed now for an LLQ setup, and the owner's retry floor is
    /// raised so an open stream is not raced by a reconnect.
    pub fn stream_established(&mut self, id: StreamId, local_addr: SocketAddr, now: Instant) {
        let Some(conn) = self.streams.get_mut(&id) else {
            return;
        };
        conn.established = true;
        conn.local_addr = local_addr;
        let owner = conn.owner;
        let pending = conn.pending.take();

        if let Some(raw) = pending {
            self.send_on_stream(id, &raw, now);
        } else if let StreamOwner::Question(qid) = owner {
            self.send_question_on_established_stream(qid, id, now);
        }

        if let StreamOwner::Question(qid) = owner
            && let Some(q) = self.questions.get_mut(&qid)
        {
            q.last_send = now;
            if q.interval.is_none_or(|i| i < LLQ_STREAM_INTERVAL_FLOOR) {
                q.interval = Some(LLQ_STREAM_INTERVAL_FLOOR);
            }
        }
    }

    // With the connection up and nothing buffered, the question composes
    // its message here: the shortened LLQ setup for a pending private
    // subscription, a plain (signed) query otherwise.
    fn send_question_on_established_stream(&mut self, qid: super::QueryId, id: StreamId, now: Instant) {
        let event_port = self.llq_event_port();
        let Some(q) = self.questions.get_mut(&qid) else {
            return;
        };
        let raw = if q.long_lived && q.state != LlqState::Poll && event_port != 0 {
            // Reset tries so connect failures don't count against the
            // challenge-response attempt cap.
            q.ntries = 0;
            let llq = LlqData {
                vers: LLQ_VERS,
                op: LLQ_OP_SETUP,
                // Over a stream, the error field carries the UDP port for
                // event delivery.
                err: event_port,
                id: 0,
                lease: LLQ_DEF_LEASE,
            };
            super::llq::llq_message(q.msg_id, q.name.clone(), q.qtype, llq, false)
        } else {
            Message::query(q.msg_id, q.name.clone(), q.qtype).pack()
        };
        let name = self.questions.get(&qid).map(|q| q.name.clone());
        match (raw, name) {
            (Ok(mut raw), Some(name)) => {
                self.sign_if_bound(&mut raw, &name, now);
                self.send_on_stream(id, &raw, now);
            }
            (Err(err), _) => warn!("failed to compose stream question: {err}"),
            _ => {}
        }
    }

    /// Feeds received stream bytes into the connection's framing decoder
    /// and dispatches every complete message. Non-long-lived owners (and a
    /// sleeping engine) give the connection up after the first reply; an
    /// established LLQ keeps it open for refreshes.
    pub fn stream_input(&mut self, id: StreamId, data: &[u8], now: Instant) {
        if let Some(conn) = self.streams.get_mut(&id) {
            conn.decoder.extend_from_slice(data);
        } else {
            return;
        }

        loop {
            let (frame, peer, tls, owner, local_addr) = {
                let Some(conn) = self.streams.get_mut(&id) else {
                    return;
                };
                match conn.decoder.next_packet() {
                    Ok(Some(frame)) => {
                        conn.replies += 1;
                        (frame, conn.peer, conn.tls, conn.owner, conn.local_addr)
                    }
                    Ok(None) => return,
                    Err(err) => {
                        // Garbled framing is a protocol failure, not a
                        // transient connect problem.
                        warn!("stream {id:?} framing error: {err}");
                        self.stream_failed(id, true, now);
                        return;
                    }
                }
            };

            let keep = !self.sleeping
                && matches!(owner, StreamOwner::Question(qid)
                    if self.questions.get(&qid).is_some_and(|q| q.long_lived));
            if !keep {
                // Dispose before dispatching so nothing re-observes the
                // connection through the owner.
                self.clear_stream_backpointer(id, owner);
                self.dispose_stream(id);
            }

            let ctx = TransportContext {
                local_addr,
                peer_addr: peer,
                transport_protocol: if tls {
                    TransportProtocol::TLS
                } else {
                    TransportProtocol::TCP
                },
                stream: Some(id),
            };
            self.handle_dns_message(&frame, peer, ctx, now);

            if !keep {
                return;
            }
        }
    }

    /// The host reports a connection failure (connect refused, reset, TLS
    /// failure). Read-side protocol failures arrive via the framing
    /// decoder instead and are treated as persistent.
    pub fn stream_error(&mut self, id: StreamId, now: Instant) {
        self.stream_failed(id, false, now);
    }

    fn clear_stream_backpointer(&mut self, id: StreamId, owner: StreamOwner) {
        match owner {
            StreamOwner::Question(qid) => {
                if let Some(q) = self.questions.get_mut(&qid)
                    && q.stream == Some(id)
                {
                    q.stream = None;
                }
            }
            StreamOwner::Record(rid) => {
                if let Some(r) = self.records.get_mut(&rid)
                    && r.stream == Some(id)
                {
                    r.stream = None;
                }
            }
            StreamOwner::Service(sid) => {
                if let Some(s) = self.services.get_mut(&sid)
                    && s.stream == Some(id)
                {
                    s.stream = None;
                }
            }
        }
    }

    fn stream_failed(&mut self, id: StreamId, persistent: bool, now: Instant) {
        let Some(conn) = self.streams.remove(&id) else {
            return;
        };
        self.events.push_back(Event::StreamClose { stream: id });
        trace!(
            "stream {id:?} to {} failed (established={}, persistent={persistent})",
            conn.peer, conn.established
        );

        // Owner back-pointer first, then backoff adjustments.
        self.clear_stream_backpointer(id, conn.owner);

        match conn.owner {
            StreamOwner::Question(qid) => {
                let Some(q) = self.questions.get_mut(&qid) else {
                    return;
                };
                if q.long_lived {
                    if !conn.established {
                        // The request never went out; retry quickly with
                        // exponential backoff tracked in ntries.
                        q.ntries += 1;
                        let mut interval = INITIAL_QUESTION_INTERVAL;
                        for _ in 0..q.ntries {
                            interval *= QUESTION_INTERVAL_STEP;
                            if interval >= LLQ_POLL_INTERVAL {
                                interval = LLQ_POLL_INTERVAL;
                                break;
                            }
                        }
                        warn!(
                            "stream connection for LLQ {} failed {} times, retrying in {:?}",
                            q.name, q.ntries, interval
                        );
                        q.interval = Some(interval);
                        q.last_send = now;
                    } else if q
                        .interval
                        .is_some_and(|i| q.last_send + i > now + LLQ_POLL_INTERVAL)
                    {
                        // Never wait longer than the poll interval after an
                        // error.
                        q.interval = Some(LLQ_POLL_INTERVAL);
                        q.last_send = now;
                    }
                    // The next attempt must redo transport setup.
                    if q.state == LlqState::SecondaryRequest {
                        q.state = LlqState::InitialRequest;
                    }
                    if persistent && q.state != LlqState::Poll {
                        self.start_llq_polling(qid, now);
                    }
                } else {
                    q.interval = Some(MAX_UCAST_POLL_INTERVAL);
                    q.last_send = now;
                }
            }
            StreamOwner::Record(rid) => {
                if let Some(r) = self.records.get_mut(&rid) {
                    super::register::set_record_retry(
                        &mut r.last_attempt,
                        &mut r.interval,
                        &mut r.expire,
                        false,
                        now,
                    );
                }
            }
            StreamOwner::Service(sid) => {
                if let Some(s) = self.services.get_mut(&sid) {
                    super::register::set_record_retry(
                        &mut s.last_attempt,
                        &mut s.interval,
                        &mut s.expire,
                        false,
                        now,
                    );
                }
            }
        }

        if matches!(conn.owner, StreamOwner::Record(_) | StreamOwner::Service(_)) {
            // Lost reply for a registration unit: the retry timer set above
            // re-drives the send.
            if persistent {
                debug!("persistent stream failure for a registration; backing off");
            }
        }
    }
}
