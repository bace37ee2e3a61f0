//! NAT traversal manager: external-address discovery and port mappings via
//! NAT-PMP, with renewal at half-lease, gateway reboot detection, and
//! change-only notification of operation owners.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{Engine, Event, NatId, NatKind, NatOp, NatOwner, NatResult, NatUpdate};
use crate::config::{self, NATMAP_INIT_RETRY, NATMAP_MAX_RETRY_INTERVAL, NATMAP_MIN_RETRY_INTERVAL};
use crate::natpmp::{
    self, NATERR_NONE, NATERR_OPCODE, NATERR_REFUSED, NATMAP_LEASE_LIMIT, NATPMP_PORT, Reply,
};
use shared::error::{Error, Result};

impl Engine {
    /// Starts a NAT traversal operation on behalf of the caller. Results
    /// arrive as [`Event::Nat`] whenever address, port or outcome changes.
    pub fn start_nat_operation(
        &mut self,
        kind: NatKind,
        internal_port: u16,
        requested_port: u16,
        lease: u32,
        now: Instant,
    ) -> Result<NatId> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        self.start_nat_op_internal(kind, internal_port, requested_port, lease, NatOwner::Caller, now)
    }

    /// Stops a caller-owned NAT operation, un-mapping when it held the only
    /// mapping for its protocol and internal port.
    pub fn stop_nat_operation(&mut self, id: NatId, now: Instant) -> Result<()> {
        self.stop_nat_op_internal(id, now)
    }

    pub(crate) fn start_nat_op_internal(
        &mut self,
        kind: NatKind,
        internal_port: u16,
        requested_port: u16,
        lease: u32,
        owner: NatOwner,
        now: Instant,
    ) -> Result<NatId> {
        let lease = if lease == 0 {
            config::NATMAP_DEFAULT_LEASE
        } else {
            lease
        };

        // Append-only ordering matters for duplicate diagnostics.
        if kind != NatKind::AddressOnly {
            for op in &self.nat_ops {
                if op.kind == kind && op.internal_port == internal_port {
                    warn!(
                        "created port mapping request ({kind:?} port {internal_port}) duplicates existing request {}",
                        op.id
                    );
                }
            }
        }

        // The first active operation kicks off address discovery.
        if self.nat_ops.is_empty() {
            self.retry_get_addr = Some(now);
            self.retry_interval_get_addr = NATMAP_INIT_RETRY;
        }

        let id = self.next_handle();
        debug!(
            "start NAT operation {id}: {kind:?} internal {internal_port} requested {requested_port} lease {lease}"
        );
        self.nat_ops.push(NatOp {
            id,
            kind,
            internal_port,
            requested_port,
            lease,
            owner,
            expiry: None,
            retry_interval: NATMAP_INIT_RETRY,
            retry_at: now,
            last_gateway_err: 0,
            forced_result: None,
            last_addr: None,
            last_port: None,
            last_result: None,
            lifetime: 0,
        });
        Ok(id)
    }

    pub(crate) fn stop_nat_op_internal(&mut self, id: NatId, now: Instant) -> Result<()> {
        let pos = self
            .nat_ops
            .iter()
            .position(|o| o.id == id)
            .ok_or(Error::ErrNoSuchNatOperation)?;
        let op = self.nat_ops.remove(pos);
        debug!(
            "stop NAT operation {id}: {:?} internal {}",
            op.kind, op.internal_port
        );

        let mut unmap = op.kind != NatKind::AddressOnly;
        if unmap {
            for p in &self.nat_ops {
                if p.kind == op.kind && p.internal_port == op.internal_port {
                    // Another live operation still wants this mapping.
                    warn!(
                        "removed port mapping request duplicates existing request {}",
                        p.id
                    );
                    unmap = false;
                }
            }
        }

        if op.expiry.is_some()
            && unmap
            && let Some(opcode) = op.kind.opcode()
        {
            self.send_nat_packet(natpmp::map_request(opcode, op.internal_port, 0, 0), now);
        }
        // A legacy (UPnP) traversal strategy would also tear down any
        // half-open discovery exchange here; that strategy lives with the
        // host.
        Ok(())
    }

    fn router_private(&self) -> Option<Ipv4Addr> {
        self.config
            .router
            .filter(|r| !r.is_unspecified() && config::is_rfc1918(r))
    }

    fn send_nat_packet(&mut self, pkt: Vec<u8>, now: Instant) {
        if let Some(router) = self.router_private() {
            self.send_udp(SocketAddr::new(router.into(), NATPMP_PORT), pkt, now);
        }
    }

    /// Marks every mapping expired and due immediately, forcing a full
    /// re-map; used after gateway reboots and address changes.
    pub(crate) fn recreate_nat_mappings(&mut self, now: Instant) {
        for op in &mut self.nat_ops {
            op.expiry = None;
            op.retry_interval = NATMAP_INIT_RETRY;
            op.retry_at = now;
        }
    }

    fn handle_address_reply(&mut self, err: u16, addr: Ipv4Addr, now: Instant) {
        let mut err = err;
        let mut addr = addr;
        if err != 0 {
            if err != self.last_addr_err {
                warn!("error getting external address: {err}");
            }
            addr = Ipv4Addr::UNSPECIFIED;
        } else {
            info!("received external IP address {addr} from NAT");
            if config::is_rfc1918(&addr) {
                warn!(
                    "double NAT (external gateway address {addr} is itself a private address)"
                );
            }
            if addr.is_unspecified() {
                // Some routers pathologically report success with the zero
                // address.
                err = natpmp::NATERR_NETFAIL;
            }
        }

        let current = self.external_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        if current != addr || self.external_address.is_none() {
            self.external_address = Some(addr);
            self.recreate_nat_mappings(now);
        }

        if err == 0 {
            // Success: back off to the maximum (steady-state keep-alive).
            self.retry_interval_get_addr = NATMAP_MAX_RETRY_INTERVAL;
        } else if self.last_addr_err == 0 {
            // Failure after success: retry quickly, then back off again.
            self.retry_interval_get_addr = NATMAP_INIT_RETRY;
        }
        self.retry_get_addr = Some(now + self.retry_interval_get_addr);
        self.last_addr_err = err;
    }

    fn set_next_renewal(op: &mut NatOp, now: Instant) {
        let Some(expiry) = op.expiry else {
            return;
        };
        let mut interval = expiry.saturating_duration_since(now) / 2;
        if interval < NATMAP_MIN_RETRY_INTERVAL {
            interval = NATMAP_MIN_RETRY_INTERVAL;
        }
        op.retry_interval = interval;
        op.retry_at = now + interval;
    }

    fn handle_port_map_reply(
        &mut self,
        idx: usize,
        err: u16,
        extport: u16,
        lease: u32,
        now: Instant,
    ) {
        let op = &mut self.nat_ops[idx];
        op.last_gateway_err = err;
        op.forced_result = None;

        if err != 0 || lease == 0 || extport == 0 {
            info!(
                "port map reply for {:?} internal {}: external {} lease {} error {}",
                op.kind, op.internal_port, extport, lease, err
            );
            op.retry_interval = NATMAP_MAX_RETRY_INTERVAL;
            op.retry_at = now + NATMAP_MAX_RETRY_INTERVAL;
            if err == NATERR_REFUSED {
                op.forced_result = Some(NatResult::PortMappingDisabled);
            } else if err > NATERR_NONE && err <= NATERR_OPCODE {
                op.forced_result = Some(NatResult::PortMappingUnsupported);
            } else if err != 0 {
                op.forced_result = Some(NatResult::NetworkFailure);
            }
        } else {
            let lease = lease.min(NATMAP_LEASE_LIMIT);
            op.expiry = Some(now + Duration::from_secs(lease as u64));
            if op.requested_port != extport {
                info!(
                    "port map reply for {:?} internal {}: requested {} changed to {}",
                    op.kind, op.internal_port, op.requested_port, extport
                );
            }
            op.requested_port = extport;
            // Mapping granted; renew at the halfway point.
            Self::set_next_renewal(op, now);
        }
    }

    /// Processes one NAT-PMP packet: solicited reply or unsolicited
    /// announcement (both carry the gateway's uptime, both feed the same
    /// address-change and reboot logic).
    pub(crate) fn handle_natpmp_packet(&mut self, pkt: &[u8], now: Instant) {
        let reply = match natpmp::parse_reply(pkt) {
            Ok(r) => r,
            Err(err) => {
                debug!("dropping NAT-PMP packet: {err}");
                return;
            }
        };

        // Compare the gateway's self-reported uptime against the last
        // observation adjusted for locally elapsed time: subtract 12.5% for
        // slow gateway clocks and allow a two-second rounding margin. An
        // apparent decrease means the gateway rebooted and forgot our
        // mappings.
        let ups = reply.upseconds();
        if let (Some(last_ups), Some(last_local)) = (self.last_upseconds, self.last_nat_reply_local)
        {
            let nat_elapsed = ups.wrapping_sub(last_ups);
            let our_elapsed = now.saturating_duration_since(last_local).as_secs() as u32;
            if ups < last_ups || nat_elapsed + 2 < our_elapsed - our_elapsed / 8 {
                warn!("NAT gateway rebooted");
                self.recreate_nat_mappings(now);
            }
        }
        self.last_upseconds = Some(ups);
        self.last_nat_reply_local = Some(now);

        match reply {
            Reply::Addr { err, addr, .. } => self.handle_address_reply(err, addr, now),
            Reply::Map {
                opcode,
                err,
                internal_port,
                external_port,
                lease,
                ..
            } => {
                // Some gateways omit the internal port in replies, so the
                // most recent mapping error is also tracked globally.
                self.last_map_result = err;
                let kind = if opcode == natpmp::NATOP_MAP_TCP {
                    NatKind::MapTcp
                } else {
                    NatKind::MapUdp
                };
                for idx in 0..self.nat_ops.len() {
                    if self.nat_ops[idx].kind == kind
                        && self.nat_ops[idx].internal_port == internal_port
                    {
                        self.handle_port_map_reply(idx, err, external_port, lease, now);
                    }
                }
            }
        }
    }

    /// Scheduler step: drives address requests, mapping sends/renewals, and
    /// change-only owner notification.
    pub(crate) fn check_nat_mappings(&mut self, now: Instant) {
        let have_routable = self.have_routable();
        if have_routable {
            // Our own address and port are effectively external.
            self.external_address = self.config.advertised_v4;
        }

        if !self.nat_ops.is_empty()
            && self.router_private().is_some()
            && let Some(t) = self.retry_get_addr
            && t <= now
        {
            self.send_nat_packet(natpmp::addr_request(), now);
            if self.retry_interval_get_addr < NATMAP_INIT_RETRY {
                self.retry_interval_get_addr = NATMAP_INIT_RETRY;
            } else if self.retry_interval_get_addr < NATMAP_MAX_RETRY_INTERVAL / 2 {
                self.retry_interval_get_addr *= 2;
            } else {
                self.retry_interval_get_addr = NATMAP_MAX_RETRY_INTERVAL;
            }
            // Advance the timer even when the packet could not go out, so a
            // router-less configuration does not spin.
            self.retry_get_addr = Some(now + self.retry_interval_get_addr);
        }

        let mut notifications: Vec<(NatOwner, NatUpdate, u32)> = Vec::new();

        for idx in 0..self.nat_ops.len() {
            // Phase 1: mapping sends and renewals.
            let mut to_send: Option<Vec<u8>> = None;
            {
                let op = &mut self.nat_ops[idx];
                if have_routable {
                    op.expiry = None;
                    op.last_gateway_err = 0;
                    op.forced_result = None;
                } else if let Some(opcode) = op.kind.opcode()
                    && op.retry_at <= now
                {
                    if let Some(exp) = op.expiry
                        && exp <= now
                    {
                        // Mapping expired while we slept on it.
                        op.expiry = None;
                        op.retry_interval = NATMAP_INIT_RETRY;
                    }
                    to_send = Some(natpmp::map_request(
                        opcode,
                        op.internal_port,
                        op.requested_port,
                        op.lease,
                    ));
                }
            }
            if let Some(pkt) = to_send {
                self.send_nat_packet(pkt, now);
                let op = &mut self.nat_ops[idx];
                if op.expiry.is_some() {
                    Self::set_next_renewal(op, now);
                } else {
                    // No mapping yet: exponential backoff.
                    if op.retry_interval < NATMAP_INIT_RETRY {
                        op.retry_interval = NATMAP_INIT_RETRY;
                    } else if op.retry_interval < NATMAP_MAX_RETRY_INTERVAL / 2 {
                        op.retry_interval *= 2;
                    } else {
                        op.retry_interval = NATMAP_MAX_RETRY_INTERVAL;
                    }
                    op.retry_at = now + op.retry_interval;
                }
            }

            // Phase 2: notify the owner when (1) an external address is
            // known or discovery has failed repeatedly, (2) the operation
            // has an answer or has retried long enough, and (3) any of
            // address/port/result changed since the last notification.
            let ext_known = self
                .external_address
                .is_some_and(|a| !a.is_unspecified());
            let discovery_struggling = self.retry_interval_get_addr > NATMAP_INIT_RETRY * 8;
            if !(ext_known || discovery_struggling) {
                continue;
            }

            let ext_addr = self.external_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
            let op = &mut self.nat_ops[idx];
            let effective = if let Some(forced) = op.forced_result {
                forced
            } else if op.last_gateway_err != 0 {
                NatResult::NetworkFailure
            } else if config::is_rfc1918(&ext_addr) {
                NatResult::DoubleNat
            } else {
                NatResult::Ok
            };
            let ext_port = if have_routable {
                op.internal_port
            } else if !ext_addr.is_unspecified() && op.expiry.is_some() {
                op.requested_port
            } else {
                0
            };
            let gate = op.kind == NatKind::AddressOnly
                || have_routable
                || op.expiry.is_some()
                || op.retry_interval > NATMAP_INIT_RETRY * 8;
            if !gate {
                continue;
            }
            let changed = op.last_addr != Some(ext_addr)
                || op.last_port != Some(ext_port)
                || op.last_result != Some(effective);
            if !changed {
                continue;
            }

            op.last_addr = Some(ext_addr);
            op.last_port = Some(ext_port);
            op.lifetime = match (op.expiry, ext_port) {
                (Some(exp), p) if p != 0 => exp.saturating_duration_since(now).as_secs() as u32,
                _ => 0,
            };
            op.last_result = Some(effective);

            notifications.push((
                op.owner,
                NatUpdate {
                    op: op.id,
                    external_address: ext_addr,
                    external_port: ext_port,
                    lifetime: op.lifetime,
                    result: effective,
                },
                op.lease,
            ));
        }

        for (owner, update, lease) in notifications {
            match owner {
                NatOwner::Caller => self.events.push_back(Event::Nat(update)),
                NatOwner::Llq => self.llq_nat_changed(now),
                NatOwner::Service(sid) => {
                    if let Some(s) = self.services.get_mut(&sid) {
                        s.mapped_port =
                            (update.external_port != 0).then_some(update.external_port);
                    }
                    self.complete_srv_nat_map(sid, lease, now);
                }
                NatOwner::Hostname => self.hostname_nat_update(&update, now),
            }
        }
    }

    /// Earliest pending NAT timer.
    pub(crate) fn nat_poll_timeout(&self) -> Option<Instant> {
        if self.nat_ops.is_empty() || self.router_private().is_none() {
            return None;
        }
        let mut next = self.retry_get_addr;
        if !self.have_routable() {
            for op in &self.nat_ops {
                if op.kind != NatKind::AddressOnly
                    && next.is_none_or(|n| op.retry_at < n)
                {
                    next = Some(op.retry_at);
                }
            }
        }
        next
    }
}
