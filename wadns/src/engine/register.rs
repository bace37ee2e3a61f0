//! Record registration engine: publish, update and withdraw individual
//! records against the discovered update server, with retry backoff and
//! lease-based refresh.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{
    Engine, Event, Rdata, RecordId, RecordReg, RegState, RegStatus, StreamOwner, ZoneData,
    ZoneOwner, ZoneService, registration_scheduled,
};
use crate::config::{
    DEFAULT_UPDATE_LEASE, INIT_UCAST_POLL_INTERVAL, MAX_UPDATE_RETRY_INTERVAL, STREAM_RETRY_FLOOR,
    UNICAST_DNS_PORT, ZONE_WAIT_INTERVAL,
};
use crate::message::tsig::extract_tsig_error;
use crate::message::update::UpdateBuilder;
use crate::message::{Message, Name, RCode};
use shared::error::{Error, Result};

/// Exponential retry for registration units: double once at least half the
/// previous interval has elapsed, floor at the unicast poll interval, cap
/// at thirty minutes, light jitter. With a lease in force, the next attempt
/// is the refresh at half the remaining lease instead.
pub(crate) fn set_record_retry(
    last_attempt: &mut Instant,
    interval: &mut Duration,
    expire: &mut Option<Instant>,
    transient: bool,
    now: Instant,
) {
    let elapsed = now.saturating_duration_since(*last_attempt);
    *last_attempt = now;

    if let Some(exp) = *expire
        && exp > now + Duration::from_secs(1)
    {
        let remaining = exp - now;
        *interval = Engine::jittered(remaining / 2, remaining / 10);
        return;
    }
    *expire = None;

    if *interval / 2 <= elapsed {
        *interval *= 2;
    }
    if *interval < INIT_UCAST_POLL_INTERVAL || transient {
        *interval = INIT_UCAST_POLL_INTERVAL;
    }
    *interval = Engine::jittered(*interval, *interval / 20);
    if *interval > MAX_UPDATE_RETRY_INTERVAL {
        *interval = MAX_UPDATE_RETRY_INTERVAL;
    }
}

/// Classifies an update reply per its rcode, digging TSIG errors out of the
/// additionals when the server hides them behind NOTAUTH or FORMERR.
pub(crate) fn check_update_result(msg: &Message) -> Result<()> {
    match msg.header.rcode {
        RCode::Success => Ok(()),
        RCode::YxDomain => Err(Error::ErrNameConflict),
        RCode::Refused => Err(Error::ErrRefused),
        RCode::NxRrset => Err(Error::ErrNoSuchRecord),
        RCode::NotAuth | RCode::FormatError => Err(extract_tsig_error(msg).unwrap_or(Error::ErrUnknown)),
        rcode => {
            warn!("update failed with rcode {rcode}");
            Err(Error::ErrUnknown)
        }
    }
}

impl Engine {
    /// Registers a record for dynamic update; discovery of the update
    /// server starts immediately.
    pub fn register_record(
        &mut self,
        name: &str,
        rdata: Rdata,
        ttl: u32,
        now: Instant,
    ) -> Result<RecordId> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let name = Name::new(name)?;
        let id = self.next_handle();
        self.records.insert(
            id,
            RecordReg {
                id,
                name: name.clone(),
                rdata,
                ttl,
                state: RegState::FetchingZoneData,
                zone: None,
                update_server: None,
                private: false,
                use_lease: true,
                expire: None,
                last_attempt: now,
                interval: ZONE_WAIT_INTERVAL,
                msg_id: 0,
                nta: None,
                stream: None,
                queued_rdata: None,
                in_flight_rdata: None,
                parent_service: None,
                hostname_owner: None,
            },
        );
        debug!("register_record: {name}");
        self.start_record_zone_query(id, now);
        Ok(id)
    }

    pub(crate) fn start_record_zone_query(&mut self, rid: RecordId, now: Instant) {
        let Some(rr) = self.records.get(&rid) else {
            return;
        };
        let name = rr.name.clone();
        let private = self
            .auth
            .lookup(&name, now)
            .is_some_and(|info| info.requires_tls);
        let zid = self.start_zone_query(&name, ZoneService::Update, private, ZoneOwner::Record(rid), now);
        if let Some(rr) = self.records.get_mut(&rid) {
            rr.nta = Some(zid);
        }
    }

    pub(crate) fn record_got_zone_data(
        &mut self,
        rid: RecordId,
        result: Result<ZoneData>,
        now: Instant,
    ) {
        let Some(rr) = self.records.get_mut(&rid) else {
            debug!("zone data for a record no longer in the table, discarding");
            return;
        };
        rr.nta = None;
        // Assume a lease until the server proves otherwise.
        rr.use_lease = true;

        let zd = match result {
            Ok(zd) => zd,
            Err(err) => {
                if err != Error::ErrNoSuchName {
                    warn!("zone discovery for {} failed: {err}", rr.name);
                }
                return;
            }
        };

        // Refuse updates aimed at the root zone; a claimed zone deeper than
        // the record's own name is nonsense.
        if zd.zone.is_root() {
            info!("no name server claims responsibility for {}", rr.name);
            return;
        }
        if zd.zone.label_count() > rr.name.label_count() || !rr.name.ends_with(&zd.zone) {
            warn!("zone {} does not contain {}", zd.zone, rr.name);
            return;
        }
        let Some(addr) = zd.addr.filter(|a| !a.is_unspecified()) else {
            info!("no dynamic-update service found for {}", rr.name);
            return;
        };
        if zd.port == 0 {
            info!("no dynamic-update service found for {}", rr.name);
            return;
        }

        rr.zone = Some(zd.zone.clone());
        rr.update_server = Some(std::net::SocketAddr::new(addr.into(), zd.port));
        rr.private = zd.private;
        // After doubling, the first retry lands ten seconds out.
        rr.interval = ZONE_WAIT_INTERVAL;

        self.send_record_registration(rid, now);
    }

    pub(crate) fn send_record_registration(&mut self, rid: RecordId, now: Instant) {
        let msg_id = self.new_message_id();
        let Some(rr) = self.records.get_mut(&rid) else {
            return;
        };
        let Some(server) = rr.update_server else {
            // Zone data still outstanding.
            rr.last_attempt = now;
            if rr.interval < ZONE_WAIT_INTERVAL {
                rr.interval = ZONE_WAIT_INTERVAL;
            }
            return;
        };
        rr.msg_id = msg_id;
        let zone = rr.zone.clone().unwrap_or_else(Name::root);
        let name = rr.name.clone();

        let mut b = UpdateBuilder::new(msg_id, zone);
        if rr.state == RegState::UpdatePending
            && let Some(new_rdata) = rr.in_flight_rdata.clone()
        {
            // Swap the data in place: delete the registered value, add the
            // new one.
            b.delete_record(rr.rdata.to_resource(name.clone()));
            b.add_record(new_rdata.to_resource(name.clone()), rr.ttl);
        } else {
            b.delete_rrset(name.clone(), rr.rdata.rtype());
            b.add_record(rr.rdata.to_resource(name.clone()), rr.ttl);
        }
        if rr.use_lease {
            b.lease(DEFAULT_UPDATE_LEASE);
        }

        let mut msg = b.finish();
        let raw = match msg.pack() {
            Ok(raw) => raw,
            Err(err) => {
                // Structural build failure: abandon permanently rather than
                // leave an unreachable registration dangling.
                warn!("abandoning registration of {name}: {err}");
                self.abandon_record(rid, Error::ErrMsgBuild);
                return;
            }
        };
        let mut raw = raw;
        self.sign_if_bound(&mut raw, &name, now);

        let private = self.records.get(&rid).is_some_and(|r| r.private);
        if private {
            if let Some(rr) = self.records.get_mut(&rid)
                && let Some(old) = rr.stream.take()
            {
                info!("disposing existing stream for {name}");
                self.dispose_stream(old);
            }
            let stream = self.open_stream(server, true, StreamOwner::Record(rid), Some(raw), now);
            if let Some(rr) = self.records.get_mut(&rid) {
                rr.stream = Some(stream);
                if rr.interval < STREAM_RETRY_FLOOR {
                    rr.interval = STREAM_RETRY_FLOOR;
                }
            }
        } else {
            self.send_udp(server, raw, now);
        }

        if let Some(rr) = self.records.get_mut(&rid) {
            set_record_retry(
                &mut rr.last_attempt,
                &mut rr.interval,
                &mut rr.expire,
                false,
                now,
            );
            if !matches!(
                rr.state,
                RegState::Refresh | RegState::DeregDeferred | RegState::UpdatePending
            ) {
                rr.state = RegState::Pending;
            }
        }
    }

    pub(crate) fn send_record_deregistration(&mut self, rid: RecordId, now: Instant) {
        let msg_id = self.new_message_id();
        let Some(rr) = self.records.get_mut(&rid) else {
            return;
        };
        let Some(server) = rr.update_server else {
            rr.last_attempt = now;
            if rr.interval < ZONE_WAIT_INTERVAL {
                rr.interval = ZONE_WAIT_INTERVAL;
            }
            return;
        };
        rr.msg_id = msg_id;
        let zone = rr.zone.clone().unwrap_or_else(Name::root);
        let name = rr.name.clone();

        let mut b = UpdateBuilder::new(msg_id, zone);
        b.delete_record(rr.rdata.to_resource(name.clone()));
        let mut msg = b.finish();
        let raw = match msg.pack() {
            Ok(raw) => raw,
            Err(err) => {
                warn!("could not construct deregistration for {name}: {err}");
                if rr.state == RegState::DeregPending {
                    self.complete_record_dereg(rid, Some(Error::ErrMsgBuild));
                }
                return;
            }
        };
        let mut raw = raw;
        self.sign_if_bound(&mut raw, &name, now);

        // No active registration remains once the withdrawal is on the
        // wire.
        if let Some(rr) = self.records.get_mut(&rid) {
            rr.expire = None;
        }

        let private = self.records.get(&rid).is_some_and(|r| r.private);
        if private {
            if let Some(rr) = self.records.get_mut(&rid)
                && let Some(old) = rr.stream.take()
            {
                self.dispose_stream(old);
            }
            let stream = self.open_stream(server, true, StreamOwner::Record(rid), Some(raw), now);
            if let Some(rr) = self.records.get_mut(&rid) {
                rr.stream = Some(stream);
                if rr.interval < STREAM_RETRY_FLOOR {
                    rr.interval = STREAM_RETRY_FLOOR;
                }
                set_record_retry(
                    &mut rr.last_attempt,
                    &mut rr.interval,
                    &mut rr.expire,
                    false,
                    now,
                );
            }
        } else {
            self.send_udp(server, raw, now);
            // Over UDP the withdrawal is fire-and-forget.
            let state = self.records.get(&rid).map(|r| r.state);
            if state == Some(RegState::DeregPending) {
                self.complete_record_dereg(rid, None);
            }
        }
    }

    /// Withdraws a record registration.
    pub fn deregister_record(&mut self, rid: RecordId, now: Instant) -> Result<()> {
        let Some(rr) = self.records.get_mut(&rid) else {
            return Err(Error::ErrNoSuchRegistration);
        };
        match rr.state {
            RegState::NatMap => Ok(()),
            RegState::ExtraQueued => {
                // Never reached the wire.
                self.complete_record_dereg(rid, None);
                Ok(())
            }
            RegState::Unregistered | RegState::DeregDeferred | RegState::NoTarget => Ok(()),
            RegState::FetchingZoneData => {
                if let Some(zid) = rr.nta.take() {
                    self.cancel_zone_query(zid);
                }
                self.complete_record_dereg(rid, None);
                Ok(())
            }
            RegState::Refresh
            | RegState::Pending
            | RegState::UpdatePending
            | RegState::Registered
            | RegState::DeregPending => {
                rr.state = RegState::DeregPending;
                self.send_record_deregistration(rid, now);
                Ok(())
            }
        }
    }

    /// Replaces a record's data: applied directly before first send, queued
    /// behind an in-flight update, or sent as an in-place update when
    /// registered.
    pub fn update_record(&mut self, rid: RecordId, new_rdata: Rdata, now: Instant) -> Result<()> {
        let Some(rr) = self.records.get_mut(&rid) else {
            return Err(Error::ErrNoSuchRegistration);
        };
        if new_rdata.rtype() != rr.rdata.rtype() {
            return Err(Error::ErrBadParameter);
        }
        match rr.state {
            RegState::DeregPending | RegState::DeregDeferred | RegState::Unregistered => {
                Err(Error::ErrNoSuchRegistration)
            }
            RegState::FetchingZoneData
            | RegState::NatMap
            | RegState::ExtraQueued
            | RegState::NoTarget => {
                // Nothing sent yet; swap the data directly.
                rr.rdata = new_rdata;
                Ok(())
            }
            RegState::Pending | RegState::Refresh | RegState::UpdatePending => {
                // Update in flight: queue, replacing any earlier queued
                // value.
                rr.queued_rdata = Some(new_rdata);
                Ok(())
            }
            RegState::Registered => {
                rr.in_flight_rdata = Some(new_rdata);
                rr.state = RegState::UpdatePending;
                self.send_record_registration(rid, now);
                Ok(())
            }
        }
    }

    /// Processes a matched dynamic-update reply for a record.
    pub(crate) fn handle_record_update_reply(
        &mut self,
        rid: RecordId,
        err: Result<()>,
        now: Instant,
    ) {
        if self.sleeping {
            // The withdrawal on the way to sleep needs no further action.
            return;
        }
        let Some(rr) = self.records.get_mut(&rid) else {
            return;
        };
        info!(
            "update reply for {} in state {:?}: {:?}",
            rr.name, rr.state, err
        );
        set_record_retry(
            &mut rr.last_attempt,
            &mut rr.interval,
            &mut rr.expire,
            false,
            now,
        );

        let mut invoke_callback = true;

        if rr.state == RegState::UpdatePending {
            if let Err(ref e) = err {
                warn!("record update failed for {}: {e}", rr.name);
            }
            rr.state = RegState::Registered;
            if let Some(new_rdata) = rr.in_flight_rdata.take() {
                rr.rdata = new_rdata;
            }
        }

        if rr.state == RegState::DeregPending {
            if let Err(ref e) = err {
                warn!("deregistration of {} failed: {e}", rr.name);
            }
            self.complete_record_dereg(rid, None);
            return;
        }

        if rr.state == RegState::DeregDeferred {
            if let Err(ref e) = err {
                warn!(
                    "deferred deregistration of {} after registration error {e}",
                    rr.name
                );
            }
            rr.state = RegState::Registered;
            let _ = self.deregister_record(rid, now);
            return;
        }

        let Some(rr) = self.records.get_mut(&rid) else {
            return;
        };
        if rr.state == RegState::Pending || rr.state == RegState::Refresh {
            match err {
                Ok(()) => {
                    if rr.state == RegState::Refresh {
                        invoke_callback = false;
                    }
                    rr.state = RegState::Registered;
                }
                Err(Error::ErrUnknown)
                    if rr.use_lease
                        && rr
                            .update_server
                            .is_some_and(|s| s.port() == UNICAST_DNS_PORT) =>
                {
                    // Legacy servers reject the lease option with a generic
                    // error; retry exactly once without it.
                    info!("retrying update of {} without lease option", rr.name);
                    rr.use_lease = false;
                    self.send_record_registration(rid, now);
                    return;
                }
                Err(e) => {
                    warn!("registration of {} failed: {e}", rr.name);
                    return;
                }
            }
        }

        let Some(rr) = self.records.get_mut(&rid) else {
            return;
        };
        if rr.state == RegState::Unregistered {
            warn!("update reply for unregistered record {}", rr.name);
            return;
        }

        if rr.queued_rdata.is_some() && rr.state == RegState::Registered {
            rr.state = RegState::UpdatePending;
            rr.in_flight_rdata = rr.queued_rdata.take();
            self.send_record_registration(rid, now);
            return;
        }

        if invoke_callback {
            self.emit_record_status(rid, RegStatus::Registered);
        }
    }

    /// Terminal failure: unlink the record and surface the error rather
    /// than leave a dangling, unreachable registration.
    pub(crate) fn abandon_record(&mut self, rid: RecordId, err: Error) {
        if let Some(rr) = self.records.get_mut(&rid) {
            rr.state = RegState::Unregistered;
            if let Some(zid) = rr.nta.take() {
                self.cancel_zone_query(zid);
            }
        }
        self.emit_record_status(rid, RegStatus::Failed(err));
        self.unlink_record(rid);
    }

    /// Withdrawal complete: tell the owner the memory may be released.
    pub(crate) fn complete_record_dereg(&mut self, rid: RecordId, err: Option<Error>) {
        if let Some(rr) = self.records.get_mut(&rid) {
            rr.state = RegState::Unregistered;
        }
        match err {
            Some(e) => self.emit_record_status(rid, RegStatus::Failed(e)),
            None => self.emit_record_status(rid, RegStatus::Released),
        }
        self.unlink_record(rid);
    }

    fn unlink_record(&mut self, rid: RecordId) {
        if let Some(rr) = self.records.remove(&rid) {
            if let Some(stream) = rr.stream {
                self.dispose_stream(stream);
            }
            if let Some(sid) = rr.parent_service
                && let Some(s) = self.services.get_mut(&sid)
            {
                s.extras.retain(|e| *e != rid);
            }
        }
    }

    fn emit_record_status(&mut self, rid: RecordId, status: RegStatus) {
        let Some(rr) = self.records.get(&rid) else {
            return;
        };
        if let Some(host) = rr.hostname_owner.clone() {
            self.events.push_back(Event::HostnameStatus { name: host, status });
        } else if rr.parent_service.is_none() {
            self.events.push_back(Event::RecordStatus {
                record: rid,
                status,
            });
        }
    }

    /// Scheduler walk over the record table.
    pub(crate) fn check_record_registrations(&mut self, now: Instant) {
        let ids: Vec<RecordId> = self.records.keys().copied().collect();
        for rid in ids {
            let Some(rr) = self.records.get_mut(&rid) else {
                continue;
            };
            if !registration_scheduled(rr.state) {
                continue;
            }
            if now < rr.last_attempt + rr.interval {
                continue;
            }
            if let Some(stream) = rr.stream.take() {
                self.dispose_stream(stream);
            }
            let Some(rr) = self.records.get_mut(&rid) else {
                continue;
            };
            match rr.state {
                RegState::FetchingZoneData => {
                    if let Some(zid) = rr.nta.take() {
                        self.cancel_zone_query(zid);
                    }
                    self.start_record_zone_query(rid, now);
                    if let Some(rr) = self.records.get_mut(&rid) {
                        set_record_retry(
                            &mut rr.last_attempt,
                            &mut rr.interval,
                            &mut rr.expire,
                            false,
                            now,
                        );
                    }
                }
                RegState::DeregPending => self.send_record_deregistration(rid, now),
                _ => self.send_record_registration(rid, now),
            }
        }
    }

    /// Dispatches a dynamic-update reply by message id: service sets first
    /// (in creation order), then standalone records. A granted lease sets
    /// the unit's expiry so the refresh fires at half-life.
    pub(crate) fn handle_update_reply(&mut self, msg: &Message, now: Instant) {
        let err = check_update_result(msg);
        let lease = msg.update_lease_option();
        let expire = lease.map(|l| now + Duration::from_secs(l as u64));

        let service = self
            .services
            .values()
            .find(|s| s.msg_id == msg.header.id)
            .map(|s| s.id);
        if let Some(sid) = service {
            if let Some(s) = self.services.get_mut(&sid)
                && err.is_ok()
                && s.use_lease
                && let Some(expire) = expire
                && (s.expire.is_none_or(|e| e >= expire) || s.state != RegState::UpdatePending)
            {
                s.expire = Some(expire);
            }
            self.handle_service_update_reply(sid, err, now);
            return;
        }

        let record = self
            .records
            .values()
            .find(|r| r.msg_id == msg.header.id)
            .map(|r| r.id);
        if let Some(rid) = record {
            if let Some(r) = self.records.get_mut(&rid)
                && err.is_ok()
                && r.use_lease
                && let Some(expire) = expire
                && (r.expire.is_none_or(|e| e >= expire) || r.state != RegState::UpdatePending)
            {
                r.expire = Some(expire);
            }
            self.handle_record_update_reply(rid, err, now);
            return;
        }

        debug!(
            "update reply id {} matches no active registration",
            msg.header.id
        );
    }

    /// Sleep: withdraw established registrations and park them far enough
    /// out that wake (or cancellation) happens first.
    pub fn sleep(&mut self, now: Instant) {
        self.sleeping = true;
        let ids: Vec<RecordId> = self.records.keys().copied().collect();
        for rid in ids {
            let Some(rr) = self.records.get_mut(&rid) else {
                continue;
            };
            if matches!(rr.state, RegState::Registered | RegState::Refresh) {
                rr.state = RegState::Refresh;
                self.send_record_deregistration(rid, now);
                if let Some(rr) = self.records.get_mut(&rid) {
                    rr.state = RegState::Refresh;
                    rr.last_attempt = now;
                    rr.interval = crate::config::SLEEP_RETRY_DELAY;
                    rr.expire = None;
                }
            }
        }
        self.sleep_services(now);
    }

    /// Wake: bring timers forward and re-evaluate every service target from
    /// scratch.
    pub fn wake(&mut self, now: Instant) {
        self.sleeping = false;
        for rr in self.records.values_mut() {
            if rr.state == RegState::Refresh {
                rr.last_attempt = now - rr.interval;
            }
        }
        self.next_target_update = Some(now);
    }
}
