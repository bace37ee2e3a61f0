//! Service record set registration: one SRV + TXT + PTR (plus extras)
//! published as a unit, with NAT-mapped auto targets and the
//! deregister-then-reregister cycle on target changes.

use std::time::Instant;

use log::{debug, info, warn};

use super::register::set_record_retry;
use super::{
    Engine, Event, NatKind, NatOwner, Rdata, RecordId, RegState, RegStatus, ServiceId, ServiceReg,
    StreamOwner, ZoneData, ZoneOwner, ZoneService,
};
use crate::config::{
    self, DEFAULT_UPDATE_LEASE, NATMAP_DEFAULT_LEASE, STREAM_RETRY_FLOOR, UNICAST_DNS_PORT,
    ZONE_WAIT_INTERVAL,
};
use crate::message::update::UpdateBuilder;
use crate::message::Name;
use shared::error::{Error, Result};

// What the reply handler decided to do after the state switch.
enum Followup {
    None,
    Resend,
    DeregNow,
    StopNatUnregister,
}

impl Engine {
    /// Registers a service record set. `target` of None auto-selects the
    /// SRV target from the dynamic hostname list and NAT-maps the port when
    /// reachability demands it.
    pub fn register_service(
        &mut self,
        instance: &str,
        port: u16,
        txt: Vec<String>,
        ttl: u32,
        target: Option<&str>,
        now: Instant,
    ) -> Result<ServiceId> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let srv_name = Name::new(instance)?;
        let ptr_name = srv_name.parent().ok_or(Error::ErrBadParameter)?;
        if ptr_name.is_root() {
            return Err(Error::ErrBadParameter);
        }
        let (auto_target, srv_target) = match target {
            Some(t) => (false, Some(Name::new(t)?)),
            None => (true, None),
        };

        let id = self.next_handle();
        self.services.insert(
            id,
            ServiceReg {
                id,
                srv_name: srv_name.clone(),
                ptr_name,
                port,
                txt,
                ttl,
                state: RegState::FetchingZoneData,
                srv_target,
                auto_target,
                mapped_port: None,
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
                nat: None,
                extras: Vec::new(),
                txt_queued: None,
                txt_in_flight: None,
                test_self_conflict: false,
                srv_changed: false,
                srv_update_deferred: false,
                callback_deferred: false,
                deferred_status: None,
            },
        );
        debug!("register_service: {srv_name}");
        self.start_service_zone_query(id, now);
        Ok(id)
    }

    fn start_service_zone_query(&mut self, sid: ServiceId, now: Instant) {
        let Some(s) = self.services.get(&sid) else {
            return;
        };
        let name = s.srv_name.clone();
        let private = self
            .auth
            .lookup(&name, now)
            .is_some_and(|info| info.requires_tls);
        let zid = self.start_zone_query(
            &name,
            ZoneService::Update,
            private,
            ZoneOwner::Service(sid),
            now,
        );
        if let Some(s) = self.services.get_mut(&sid) {
            s.nta = Some(zid);
        }
    }

    /// Attaches an extra record to a registered service set. It registers
    /// once the set does and is withdrawn with it.
    pub fn add_service_extra(
        &mut self,
        sid: ServiceId,
        name: &str,
        rdata: Rdata,
        ttl: u32,
        now: Instant,
    ) -> Result<RecordId> {
        let name = Name::new(name)?;
        let Some(s) = self.services.get(&sid) else {
            return Err(Error::ErrNoSuchRegistration);
        };
        let ready = s.state == RegState::Registered;
        let zone = s.zone.clone();
        let server = s.update_server;
        let private = s.private;
        let use_lease = s.use_lease;

        let rid = self.next_handle();
        self.records.insert(
            rid,
            super::RecordReg {
                id: rid,
                name,
                rdata,
                ttl,
                state: RegState::ExtraQueued,
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
                parent_service: Some(sid),
                hostname_owner: None,
            },
        );
        if let Some(s) = self.services.get_mut(&sid) {
            s.extras.push(rid);
        }

        if ready {
            let rr = self.records.get_mut(&rid).expect("just inserted");
            rr.zone = zone;
            rr.update_server = server;
            rr.private = private;
            rr.use_lease = use_lease;
            rr.state = RegState::Pending;
            self.send_record_registration(rid, now);
        }
        Ok(rid)
    }

    /// Replaces the service's TXT data without touching SRV/PTR: applied
    /// directly before first send, queued behind an in-flight operation, or
    /// pushed through `UpdatePending` when registered.
    pub fn update_service_txt(
        &mut self,
        sid: ServiceId,
        txt: Vec<String>,
        now: Instant,
    ) -> Result<()> {
        let Some(s) = self.services.get_mut(&sid) else {
            return Err(Error::ErrNoSuchRegistration);
        };
        match s.state {
            RegState::DeregPending | RegState::DeregDeferred | RegState::Unregistered => {
                Err(Error::ErrNoSuchRegistration)
            }
            RegState::FetchingZoneData
            | RegState::NatMap
            | RegState::ExtraQueued
            | RegState::NoTarget => {
                s.txt = txt;
                Ok(())
            }
            RegState::Pending | RegState::Refresh | RegState::UpdatePending => {
                s.txt_queued = Some(txt);
                Ok(())
            }
            RegState::Registered => {
                s.txt_in_flight = Some(txt);
                s.state = RegState::UpdatePending;
                self.send_service_registration(sid, now);
                Ok(())
            }
        }
    }

    /// Withdraws the service set. A withdrawal requested while an update is
    /// in flight defers until the reply lands.
    pub fn deregister_service(&mut self, sid: ServiceId, now: Instant) -> Result<()> {
        let Some(s) = self.services.get_mut(&sid) else {
            return Err(Error::ErrNoSuchRegistration);
        };
        // Never re-register with a new target following deregistration.
        s.srv_changed = false;
        s.srv_update_deferred = false;
        if let Some(zid) = s.nta.take() {
            self.cancel_zone_query(zid);
        }
        let Some(s) = self.services.get_mut(&sid) else {
            return Err(Error::ErrNoSuchRegistration);
        };
        if let Some(nid) = s.nat.take() {
            let _ = self.stop_nat_op_internal(nid, now);
        }

        let Some(s) = self.services.get_mut(&sid) else {
            return Err(Error::ErrNoSuchRegistration);
        };
        match s.state {
            RegState::Unregistered => Err(Error::ErrNoSuchRegistration),
            RegState::DeregPending | RegState::DeregDeferred => {
                debug!("double deregistration of service {}", s.srv_name);
                Ok(())
            }
            RegState::NatMap | RegState::NoTarget | RegState::ExtraQueued => {
                // Nothing on the wire yet.
                self.events.push_back(Event::ServiceStatus {
                    service: sid,
                    status: RegStatus::Released,
                });
                self.unlink_service(sid);
                Ok(())
            }
            RegState::Pending | RegState::UpdatePending => {
                // Update in flight; withdraw once the reply arrives.
                s.state = RegState::DeregDeferred;
                Ok(())
            }
            RegState::Refresh | RegState::FetchingZoneData | RegState::Registered => {
                self.send_service_deregistration(sid, now);
                Ok(())
            }
        }
    }

    pub(crate) fn service_got_zone_data(
        &mut self,
        sid: ServiceId,
        result: Result<ZoneData>,
        now: Instant,
    ) {
        let Some(s) = self.services.get_mut(&sid) else {
            return;
        };
        s.nta = None;
        s.use_lease = true;

        let zd = match result {
            Ok(zd) => zd,
            Err(_) => return,
        };
        let Some(addr) = zd.addr.filter(|a| !a.is_unspecified()) else {
            return;
        };
        if zd.port == 0 {
            return;
        }

        let update_server = std::net::SocketAddr::new(addr.into(), zd.port);
        s.zone = Some(zd.zone);
        s.update_server = Some(update_server);
        s.private = zd.private;
        s.last_attempt = now;
        s.interval = ZONE_WAIT_INTERVAL;
        let port = s.port;
        let auto_target = s.auto_target;

        // A service with a real port, on a private host, registering with a
        // public server, needs the port mapped before the SRV goes out.
        let needs_map =
            port != 0 && auto_target && self.behind_nat() && !config::is_rfc1918(&addr);
        if needs_map {
            let Some(s) = self.services.get_mut(&sid) else {
                return;
            };
            s.state = RegState::NatMap;
            debug!("service {} entering NAT mapping", s.srv_name);
            self.start_srv_nat_map(sid, now);
        } else {
            self.send_service_registration(sid, now);
        }
    }

    pub(crate) fn start_srv_nat_map(&mut self, sid: ServiceId, now: Instant) {
        let Some(s) = self.services.get(&sid) else {
            return;
        };
        let proto = s.ptr_name.labels().nth(1).map(|l| l.to_ascii_lowercase());
        let kind = match proto.as_deref() {
            Some("_tcp") => NatKind::MapTcp,
            Some("_udp") => NatKind::MapUdp,
            _ => {
                warn!(
                    "cannot determine transport protocol of service {}",
                    s.srv_name
                );
                return;
            }
        };
        let port = s.port;
        if let Some(s) = self.services.get_mut(&sid)
            && let Some(old) = s.nat.take()
        {
            let _ = self.stop_nat_op_internal(old, now);
        }
        match self.start_nat_op_internal(
            kind,
            port,
            port,
            NATMAP_DEFAULT_LEASE,
            NatOwner::Service(sid),
            now,
        ) {
            Ok(nid) => {
                if let Some(s) = self.services.get_mut(&sid) {
                    s.nat = Some(nid);
                }
            }
            Err(err) => warn!("failed to start service port mapping: {err}"),
        }
    }

    /// The service's port mapping produced a result; proceed with (or
    /// re-resolve for) the registration.
    pub(crate) fn complete_srv_nat_map(&mut self, sid: ServiceId, lease: u32, now: Instant) {
        if lease == 0 {
            return;
        }
        let Some(s) = self.services.get(&sid) else {
            return;
        };
        if s.update_server.is_some() {
            self.send_service_registration(sid, now);
        } else {
            // Mapping outlived the zone data; refetch it.
            let Some(s) = self.services.get_mut(&sid) else {
                return;
            };
            s.state = RegState::FetchingZoneData;
            if let Some(zid) = s.nta.take() {
                self.cancel_zone_query(zid);
            }
            self.start_service_zone_query(sid, now);
        }
    }

    pub(crate) fn send_service_registration(&mut self, sid: ServiceId, now: Instant) {
        let msg_id = self.new_message_id();
        let Some(s) = self.services.get_mut(&sid) else {
            return;
        };
        let Some(server) = s.update_server else {
            s.last_attempt = now;
            if s.interval < ZONE_WAIT_INTERVAL {
                s.interval = ZONE_WAIT_INTERVAL;
            }
            return;
        };
        if s.state == RegState::Registered {
            s.state = RegState::Refresh;
        }
        s.msg_id = msg_id;

        let srv_name = s.srv_name.clone();
        let ptr_name = s.ptr_name.clone();
        let zone = s.zone.clone().unwrap_or_else(Name::root);
        let state = s.state;
        let ttl = s.ttl;
        let use_lease = s.use_lease;
        let self_conflict = s.test_self_conflict;
        let auto_target = s.auto_target;
        let stored_target = s.srv_target.clone();
        let txt = s.txt.clone();
        let txt_in_flight = s.txt_in_flight.clone();
        let private = s.private;
        // Replace the port with the NAT mapping when one is in place.
        let port = match (auto_target, s.mapped_port) {
            (true, Some(mapped)) if mapped != 0 => mapped,
            _ => s.port,
        };

        let target = if auto_target {
            self.get_service_target(&srv_name)
        } else {
            stored_target.clone()
        };
        let Some(target) = target.filter(|t| !t.is_root() && !t.data.is_empty()) else {
            debug!("no target for service {srv_name}");
            if let Some(s) = self.services.get_mut(&sid) {
                s.state = RegState::NoTarget;
            }
            return;
        };
        if stored_target.as_ref() != Some(&target)
            && let Some(s) = self.services.get_mut(&sid)
        {
            s.srv_target = Some(target.clone());
        }

        let mut b = UpdateBuilder::new(msg_id, zone);
        let srv_rdata = Rdata::Srv {
            priority: 0,
            weight: 0,
            port,
            target: target.clone(),
        };
        if self_conflict {
            // Prerequisite: the SRV must already hold our value, proving the
            // earlier conflict was a stale echo of our own registration;
            // drop any stale TXT alongside.
            b.prereq_record_exists(srv_rdata.to_resource(srv_name.clone()));
            b.delete_rrset(srv_name.clone(), crate::message::DnsType::Txt);
        } else if state != RegState::Refresh && state != RegState::UpdatePending {
            // Until value-independent conflict detection exists, overwrite
            // whatever stale state the name holds.
            b.delete_all_rrsets(srv_name.clone());
        }

        b.add_record(
            Rdata::Ptr(srv_name.clone()).to_resource(ptr_name.clone()),
            ttl,
        );

        if state == RegState::UpdatePending
            && let Some(new_txt) = txt_in_flight
        {
            b.delete_record(Rdata::Txt(txt.clone()).to_resource(srv_name.clone()));
            b.add_record(Rdata::Txt(new_txt).to_resource(srv_name.clone()), ttl);
        } else {
            b.add_record(Rdata::Txt(txt.clone()).to_resource(srv_name.clone()), ttl);
        }

        b.add_record(srv_rdata.to_resource(srv_name.clone()), ttl);

        if use_lease {
            b.lease(DEFAULT_UPDATE_LEASE);
        }

        let mut msg = b.finish();
        let mut raw = match msg.pack() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    "error formatting message, permanently abandoning service registration {srv_name}"
                );
                self.abandon_service(sid, err);
                return;
            }
        };
        self.sign_if_bound(&mut raw, &srv_name, now);

        if let Some(s) = self.services.get_mut(&sid)
            && !matches!(
                s.state,
                RegState::Refresh | RegState::DeregDeferred | RegState::UpdatePending
            )
        {
            s.state = RegState::Pending;
        }

        if private {
            if let Some(s) = self.services.get_mut(&sid)
                && let Some(old) = s.stream.take()
            {
                info!("disposing existing stream for {srv_name}");
                self.dispose_stream(old);
            }
            let stream = self.open_stream(server, true, StreamOwner::Service(sid), Some(raw), now);
            if let Some(s) = self.services.get_mut(&sid) {
                s.stream = Some(stream);
                if s.interval < STREAM_RETRY_FLOOR {
                    s.interval = STREAM_RETRY_FLOOR;
                }
            }
        } else {
            self.send_udp(server, raw, now);
        }

        if let Some(s) = self.services.get_mut(&sid) {
            set_record_retry(
                &mut s.last_attempt,
                &mut s.interval,
                &mut s.expire,
                false,
                now,
            );
        }
    }

    pub(crate) fn send_service_deregistration(&mut self, sid: ServiceId, now: Instant) {
        let msg_id = self.new_message_id();
        let Some(s) = self.services.get_mut(&sid) else {
            return;
        };
        let Some(server) = s.update_server else {
            s.last_attempt = now;
            if s.interval < ZONE_WAIT_INTERVAL {
                s.interval = ZONE_WAIT_INTERVAL;
            }
            return;
        };
        s.msg_id = msg_id;
        let srv_name = s.srv_name.clone();
        let ptr_name = s.ptr_name.clone();
        let zone = s.zone.clone().unwrap_or_else(Name::root);
        let private = s.private;

        let mut b = UpdateBuilder::new(msg_id, zone);
        // Deletes SRV, TXT and any extras at the instance name, then the
        // pointer that advertises it.
        b.delete_all_rrsets(srv_name.clone());
        b.delete_record(Rdata::Ptr(srv_name.clone()).to_resource(ptr_name));

        let mut msg = b.finish();
        let mut raw = match msg.pack() {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    "error formatting message, permanently abandoning service registration {srv_name}"
                );
                self.abandon_service(sid, err);
                return;
            }
        };
        self.sign_if_bound(&mut raw, &srv_name, now);

        if let Some(s) = self.services.get_mut(&sid) {
            s.state = RegState::DeregPending;
            s.expire = None;
        }

        if private {
            if let Some(s) = self.services.get_mut(&sid)
                && let Some(old) = s.stream.take()
            {
                self.dispose_stream(old);
            }
            let stream = self.open_stream(server, true, StreamOwner::Service(sid), Some(raw), now);
            if let Some(s) = self.services.get_mut(&sid) {
                s.stream = Some(stream);
                if s.interval < STREAM_RETRY_FLOOR {
                    s.interval = STREAM_RETRY_FLOOR;
                }
            }
        } else {
            self.send_udp(server, raw, now);
        }

        if let Some(s) = self.services.get_mut(&sid) {
            set_record_retry(
                &mut s.last_attempt,
                &mut s.interval,
                &mut s.expire,
                false,
                now,
            );
        }
    }

    /// Processes a matched dynamic-update reply for a service set.
    pub(crate) fn handle_service_update_reply(
        &mut self,
        sid: ServiceId,
        err: Result<()>,
        now: Instant,
    ) {
        let Some(s) = self.services.get_mut(&sid) else {
            return;
        };
        debug!(
            "service update reply for {} in state {:?}: {:?}",
            s.srv_name, s.state, err
        );
        set_record_retry(
            &mut s.last_attempt,
            &mut s.interval,
            &mut s.expire,
            false,
            now,
        );

        let mut err = err;
        let mut invoke = false;
        let mut status = match &err {
            Ok(()) => RegStatus::Registered,
            Err(e) => RegStatus::Failed(e.clone()),
        };
        let mut followup = Followup::None;

        match s.state {
            RegState::Pending => {
                if matches!(err, Err(Error::ErrNameConflict)) && !s.test_self_conflict {
                    s.test_self_conflict = true;
                    debug!("checking for self-conflict of service {}", s.srv_name);
                    followup = Followup::Resend;
                } else if s.test_self_conflict {
                    s.test_self_conflict = false;
                    if matches!(err, Err(Error::ErrNoSuchRecord)) {
                        // The prerequisite was not met: the existing records
                        // are someone else's, a genuine conflict.
                        err = Err(Error::ErrNameConflict);
                    }
                    match &err {
                        Ok(()) => {
                            s.state = RegState::Registered;
                            status = RegStatus::Registered;
                        }
                        Err(e) => status = RegStatus::Failed(e.clone()),
                    }
                    invoke = true;
                } else if s.use_lease
                    && matches!(err, Err(Error::ErrUnknown))
                    && s.update_server.is_some_and(|u| u.port() == UNICAST_DNS_PORT)
                {
                    info!("re-trying update of service {} without lease", s.srv_name);
                    s.use_lease = false;
                    followup = Followup::Resend;
                } else {
                    match &err {
                        Ok(()) => s.state = RegState::Registered,
                        Err(e) => warn!("error {e} for registration of {}", s.srv_name),
                    }
                    invoke = true;
                }
            }
            RegState::Refresh => match &err {
                Ok(()) => s.state = RegState::Registered,
                Err(e) => {
                    warn!("error {e} for refresh of {}", s.srv_name);
                    invoke = true;
                }
            },
            RegState::DeregPending => {
                if let Err(e) = &err {
                    warn!("error {e} for deregistration of {}", s.srv_name);
                }
                if s.srv_changed {
                    // NoTarget picks up the new target or NAT state.
                    s.state = RegState::NoTarget;
                } else {
                    status = RegStatus::Released;
                    invoke = true;
                    s.state = RegState::Unregistered;
                    followup = Followup::StopNatUnregister;
                }
            }
            RegState::DeregDeferred => {
                if err.is_err() {
                    debug!(
                        "error received prior to deferred deregistration of {}",
                        s.srv_name
                    );
                    status = RegStatus::Released;
                    invoke = true;
                    s.state = RegState::Unregistered;
                } else {
                    debug!("performing deferred deregistration of {}", s.srv_name);
                    s.state = RegState::Registered;
                    followup = Followup::DeregNow;
                }
            }
            RegState::UpdatePending => {
                if err.is_err() {
                    warn!("error updating TXT record for {}", s.srv_name);
                    invoke = true;
                } else {
                    s.state = RegState::Registered;
                    if let Some(txt) = s.txt_in_flight.take() {
                        s.txt = txt;
                    }
                }
            }
            // Sleep-path withdrawal; no further action required.
            RegState::NoTarget => return,
            other => {
                warn!(
                    "service update reply for {} in unexpected state {:?}",
                    s.srv_name, other
                );
                err = Err(Error::ErrUnknown);
                status = RegStatus::Failed(Error::ErrUnknown);
                invoke = true;
            }
        }

        match followup {
            Followup::Resend => {
                self.send_service_registration(sid, now);
                return;
            }
            Followup::DeregNow => {
                self.send_service_deregistration(sid, now);
                return;
            }
            Followup::StopNatUnregister => {
                if let Some(s) = self.services.get_mut(&sid)
                    && let Some(nid) = s.nat.take()
                {
                    let _ = self.stop_nat_op_internal(nid, now);
                }
            }
            Followup::None => {}
        }

        // Deferred target/NAT changes get applied once the in-flight
        // operation has settled.
        let Some(s) = self.services.get_mut(&sid) else {
            return;
        };
        if (s.srv_changed || s.srv_update_deferred)
            && matches!(s.state, RegState::NoTarget | RegState::Registered)
        {
            if invoke {
                s.callback_deferred = true;
                s.deferred_status = Some(status);
            }
            s.srv_changed = false;
            s.srv_update_deferred = false;
            self.update_srv(sid, now);
            return;
        }

        // Extra records queued behind the set register once the set is up,
        // or are dropped when it failed.
        let extras = s.extras.clone();
        let parent_ok = s.state == RegState::Registered && err.is_ok();
        let zone = s.zone.clone();
        let server = s.update_server;
        let use_lease = s.use_lease;
        let private = s.private;
        for rid in extras {
            let Some(rr) = self.records.get_mut(&rid) else {
                continue;
            };
            if rr.state != RegState::ExtraQueued {
                continue;
            }
            if parent_ok {
                rr.zone = zone.clone();
                rr.update_server = server;
                rr.use_lease = use_lease;
                rr.private = private;
                rr.state = RegState::Pending;
                self.send_record_registration(rid, now);
            } else if err.is_err() {
                rr.state = RegState::Unregistered;
                self.records.remove(&rid);
                if let Some(s) = self.services.get_mut(&sid) {
                    s.extras.retain(|e| *e != rid);
                }
            }
        }

        let Some(s) = self.services.get_mut(&sid) else {
            return;
        };
        if s.state == RegState::Unregistered {
            self.events.push_back(Event::ServiceStatus {
                service: sid,
                status,
            });
            self.unlink_service(sid);
            return;
        }

        if s.txt_queued.is_some() && s.state == RegState::Registered {
            if invoke {
                s.callback_deferred = true;
                s.deferred_status = Some(status);
            }
            s.state = RegState::UpdatePending;
            s.txt_in_flight = s.txt_queued.take();
            self.send_service_registration(sid, now);
            return;
        }

        if invoke {
            self.events.push_back(Event::ServiceStatus {
                service: sid,
                status,
            });
        } else if s.callback_deferred {
            s.callback_deferred = false;
            let deferred = s.deferred_status.take().unwrap_or(RegStatus::Registered);
            self.events.push_back(Event::ServiceStatus {
                service: sid,
                status: deferred,
            });
        }
    }

    /// Structural failure building the message: unlink and surface the
    /// error; this is deliberate abandonment, never retried.
    pub(crate) fn abandon_service(&mut self, sid: ServiceId, err: Error) {
        self.events.push_back(Event::ServiceStatus {
            service: sid,
            status: RegStatus::Failed(err),
        });
        self.unlink_service(sid);
    }

    fn unlink_service(&mut self, sid: ServiceId) {
        let Some(mut s) = self.services.remove(&sid) else {
            return;
        };
        if let Some(stream) = s.stream.take() {
            self.dispose_stream(stream);
        }
        if let Some(zid) = s.nta.take() {
            self.cancel_zone_query(zid);
        }
        for rid in s.extras.drain(..) {
            self.records.remove(&rid);
        }
    }

    /// Re-evaluates one service against its current target and NAT needs.
    pub(crate) fn update_srv(&mut self, sid: ServiceId, now: Instant) {
        let Some(s) = self.services.get(&sid) else {
            return;
        };
        let srv_name = s.srv_name.clone();
        let auto_target = s.auto_target;
        let stored_target = s.srv_target.clone();
        let state = s.state;
        let have_zone = s.update_server.is_some();
        let update_server_public = s
            .update_server
            .map(|u| match u.ip() {
                std::net::IpAddr::V4(v4) => !config::is_rfc1918(&v4),
                std::net::IpAddr::V6(_) => true,
            })
            .unwrap_or(false);
        let port = s.port;
        let were_behind_nat = s.nat.is_some();
        let requested_port = s
            .nat
            .and_then(|nid| self.nat_ops.iter().find(|o| o.id == nid))
            .map(|o| o.requested_port);

        let new_target = if auto_target {
            self.get_service_target(&srv_name)
        } else {
            stored_target.clone()
        };

        let target_changed = (new_target.is_some() && state == RegState::NoTarget)
            || new_target != stored_target;
        let now_need_natmap =
            auto_target && port != 0 && self.behind_nat() && update_server_public;
        let port_was_mapped = requested_port.is_some_and(|p| p != port);
        let nat_changed = (!were_behind_nat && now_need_natmap)
            || (!now_need_natmap && port_was_mapped);

        if !target_changed && !nat_changed {
            return;
        }
        debug!(
            "update_srv {srv_name}: target_changed={target_changed} nat_changed={nat_changed} state={state:?}"
        );

        match state {
            RegState::FetchingZoneData
            | RegState::DeregPending
            | RegState::DeregDeferred
            | RegState::Unregistered
            | RegState::NatMap
            | RegState::ExtraQueued => {
                // Not yet on the wire (it will pick up current facts when it
                // goes out) or already being withdrawn.
            }
            RegState::Pending | RegState::Refresh | RegState::UpdatePending => {
                // Let the in-flight operation complete before acting.
                if let Some(s) = self.services.get_mut(&sid) {
                    s.srv_update_deferred = true;
                }
            }
            RegState::NoTarget => {
                if new_target.is_some() {
                    if !have_zone {
                        let Some(s) = self.services.get_mut(&sid) else {
                            return;
                        };
                        s.state = RegState::FetchingZoneData;
                        if let Some(zid) = s.nta.take() {
                            self.cancel_zone_query(zid);
                        }
                        self.start_service_zone_query(sid, now);
                    } else {
                        if were_behind_nat && (nat_changed || !now_need_natmap) {
                            if let Some(s) = self.services.get_mut(&sid)
                                && let Some(nid) = s.nat.take()
                            {
                                let _ = self.stop_nat_op_internal(nid, now);
                            }
                        }
                        if nat_changed && now_need_natmap {
                            if let Some(s) = self.services.get_mut(&sid) {
                                s.state = RegState::NatMap;
                            }
                            self.start_srv_nat_map(sid, now);
                        } else {
                            self.send_service_registration(sid, now);
                        }
                    }
                }
            }
            RegState::Registered => {
                // Target or NAT changed under an established registration:
                // withdraw, then NoTarget picks up the new facts.
                let Some(s) = self.services.get_mut(&sid) else {
                    return;
                };
                for rid in s.extras.clone() {
                    if let Some(rr) = self.records.get_mut(&rid) {
                        rr.state = RegState::ExtraQueued;
                    }
                }
                let Some(s) = self.services.get_mut(&sid) else {
                    return;
                };
                s.srv_changed = true;
                self.send_service_deregistration(sid, now);
            }
        }
    }

    /// Walks every service set re-evaluating targets; driven by the
    /// scheduler's deferred target re-evaluation step.
    pub(crate) fn update_service_targets(&mut self, now: Instant) {
        if self.sleeping {
            return;
        }
        let ids: Vec<ServiceId> = self.services.keys().copied().collect();
        for sid in ids {
            self.update_srv(sid, now);
        }
    }

    /// Scheduler walk over the service table.
    pub(crate) fn check_service_registrations(&mut self, now: Instant) {
        let ids: Vec<ServiceId> = self.services.keys().copied().collect();
        for sid in ids {
            let Some(s) = self.services.get_mut(&sid) else {
                continue;
            };
            if !super::registration_scheduled(s.state) {
                continue;
            }
            if now < s.last_attempt + s.interval {
                continue;
            }
            if let Some(stream) = s.stream.take() {
                self.dispose_stream(stream);
            }
            let Some(s) = self.services.get_mut(&sid) else {
                continue;
            };
            match s.state {
                RegState::FetchingZoneData => {
                    if let Some(zid) = s.nta.take() {
                        self.cancel_zone_query(zid);
                    }
                    self.start_service_zone_query(sid, now);
                    if let Some(s) = self.services.get_mut(&sid) {
                        set_record_retry(
                            &mut s.last_attempt,
                            &mut s.interval,
                            &mut s.expire,
                            false,
                            now,
                        );
                    }
                }
                RegState::DeregPending => self.send_service_deregistration(sid, now),
                _ => self.send_service_registration(sid, now),
            }
        }
    }

    /// Sleep-path handling for services: withdraw and park in `NoTarget`
    /// with the zone data cleared; wake re-resolves from scratch.
    pub(crate) fn sleep_services(&mut self, now: Instant) {
        let ids: Vec<ServiceId> = self.services.keys().copied().collect();
        for sid in ids {
            let Some(s) = self.services.get_mut(&sid) else {
                continue;
            };
            if let Some(zid) = s.nta.take() {
                self.cancel_zone_query(zid);
            }
            let Some(s) = self.services.get_mut(&sid) else {
                continue;
            };
            if let Some(nid) = s.nat.take() {
                let _ = self.stop_nat_op_internal(nid, now);
            }

            let Some(s) = self.services.get_mut(&sid) else {
                continue;
            };
            if s.state == RegState::UpdatePending {
                // Act as if the update succeeded; the name is about to be
                // withdrawn anyway.
                s.state = RegState::Registered;
                if let Some(txt) = s.txt_in_flight.take() {
                    s.txt = txt;
                }
            }

            let withdrawn = matches!(s.state, RegState::Registered | RegState::Refresh);
            if withdrawn {
                self.send_service_deregistration(sid, now);
            }

            if let Some(s) = self.services.get_mut(&sid) {
                s.state = RegState::NoTarget;
                s.srv_target = None;
                s.update_server = None;
                s.mapped_port = None;
                s.interval = ZONE_WAIT_INTERVAL;
            }
        }
    }
}
