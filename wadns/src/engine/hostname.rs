//! Dynamic hostname registry: each added name keeps an address record
//! registered with its zone's update server, tracking the NAT-discovered
//! external address when the host sits behind a gateway. Auto-target
//! services pick their SRV target from this list.

use std::net::Ipv4Addr;
use std::time::Instant;

use log::{debug, info, warn};

use super::{Engine, HostnameEntry, NatKind, NatOwner, NatUpdate, Rdata, RegState};
use crate::config;
use crate::message::Name;
use shared::error::{Error, Result};

/// TTL for dynamic hostname address records.
const HOSTNAME_TTL: u32 = 120;

impl Engine {
    /// Adds a dynamic hostname; its address record is registered as soon as
    /// a usable address is known (immediately, or once NAT discovery
    /// reports the external address).
    pub fn add_dyn_hostname(&mut self, fqdn: &str, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrEngineClosed);
        }
        let fqdn = Name::new(fqdn)?;
        if self.hostnames.iter().any(|h| h.fqdn == fqdn) {
            return Err(Error::ErrAlreadyRegistered);
        }
        info!("add_dyn_hostname: {fqdn}");
        self.hostnames.push(HostnameEntry {
            fqdn: fqdn.clone(),
            record: None,
        });

        if self.behind_nat() && self.hostname_nat.is_none() {
            match self.start_nat_op_internal(
                NatKind::AddressOnly,
                0,
                0,
                0,
                NatOwner::Hostname,
                now,
            ) {
                Ok(id) => self.hostname_nat = Some(id),
                Err(err) => warn!("failed to start address discovery: {err}"),
            }
        }

        self.advertise_hostname(&fqdn, now);
        // The new name may be a better target for auto-target services.
        self.next_target_update = Some(now);
        Ok(())
    }

    /// Removes a dynamic hostname, withdrawing its address record.
    pub fn remove_dyn_hostname(&mut self, fqdn: &str, now: Instant) -> Result<()> {
        let fqdn = Name::new(fqdn)?;
        let pos = self
            .hostnames
            .iter()
            .position(|h| h.fqdn == fqdn)
            .ok_or(Error::ErrNoSuchName)?;
        let entry = self.hostnames.remove(pos);
        info!("remove_dyn_hostname: {fqdn}");
        if let Some(rid) = entry.record {
            let _ = self.deregister_record(rid, now);
        }
        if self.hostnames.is_empty()
            && let Some(id) = self.hostname_nat.take()
        {
            let _ = self.stop_nat_op_internal(id, now);
        }
        self.next_target_update = Some(now);
        Ok(())
    }

    /// The address a hostname record should carry right now: the publicly
    /// visible external address behind a NAT, the advertised address
    /// otherwise. None while unknown.
    fn hostname_address(&self) -> Option<Ipv4Addr> {
        if self.behind_nat() {
            self.external_address
                .filter(|a| !a.is_unspecified() && !config::is_rfc1918(a))
        } else {
            self.config.advertised_v4.filter(|a| !a.is_unspecified())
        }
    }

    fn advertise_hostname(&mut self, fqdn: &Name, now: Instant) {
        let Some(addr) = self.hostname_address() else {
            debug!("hostname {fqdn}: no usable address yet");
            return;
        };
        let has_record = self
            .hostnames
            .iter()
            .find(|h| h.fqdn == *fqdn)
            .is_some_and(|h| h.record.is_some());
        if has_record {
            return;
        }
        match self.register_record(&fqdn.data, Rdata::A(addr), HOSTNAME_TTL, now) {
            Ok(rid) => {
                if let Some(r) = self.records.get_mut(&rid) {
                    r.hostname_owner = Some(fqdn.clone());
                }
                if let Some(h) = self.hostnames.iter_mut().find(|h| h.fqdn == *fqdn) {
                    h.record = Some(rid);
                }
            }
            Err(err) => warn!("failed to register hostname {fqdn}: {err}"),
        }
    }

    /// NAT address discovery produced (or changed) the external address.
    pub(crate) fn hostname_nat_update(&mut self, update: &NatUpdate, now: Instant) {
        debug!(
            "hostname address discovery: {} ({:?})",
            update.external_address, update.result
        );
        self.refresh_hostname_records(now);
    }

    /// Re-registers or updates every hostname record against the current
    /// address facts.
    pub(crate) fn refresh_hostname_records(&mut self, now: Instant) {
        let Some(addr) = self.hostname_address() else {
            return;
        };
        let entries: Vec<(Name, Option<super::RecordId>)> = self
            .hostnames
            .iter()
            .map(|h| (h.fqdn.clone(), h.record))
            .collect();
        for (fqdn, record) in entries {
            match record {
                None => self.advertise_hostname(&fqdn, now),
                Some(rid) => {
                    let stale = self
                        .records
                        .get(&rid)
                        .is_some_and(|r| r.rdata != Rdata::A(addr));
                    if stale {
                        debug!("hostname {fqdn}: address changed to {addr}");
                        let _ = self.update_record(rid, Rdata::A(addr), now);
                    }
                }
            }
        }
        self.next_target_update = Some(now);
    }

    /// Picks the best SRV target for a service: among registered (or
    /// refreshing) dynamic hostnames, the one sharing the longest label
    /// suffix with the service name.
    pub(crate) fn get_service_target(&self, srv_name: &Name) -> Option<Name> {
        let srv_labels: Vec<&str> = srv_name.labels().collect();
        let mut best = 0usize;
        let mut best_name: Option<Name> = None;

        for h in &self.hostnames {
            let usable = h
                .record
                .and_then(|rid| self.records.get(&rid))
                .is_some_and(|r| matches!(r.state, RegState::Registered | RegState::Refresh));
            if !usable {
                continue;
            }
            let host_labels: Vec<&str> = h.fqdn.labels().collect();
            let limit = host_labels.len().min(srv_labels.len());
            for x in ((best + 1)..=limit).rev() {
                let srv_tail = &srv_labels[srv_labels.len() - x..];
                let host_tail = &host_labels[host_labels.len() - x..];
                if srv_tail
                    .iter()
                    .zip(host_tail.iter())
                    .all(|(a, b)| a.eq_ignore_ascii_case(b))
                {
                    best = x;
                    best_name = Some(h.fqdn.clone());
                    break;
                }
            }
        }
        best_name
    }
}
