//! Unicast DNS server registry: configured resolvers with health and
//! penalty tracking.
//!
//! Identity of an entry is the (interface, address, port, domain-suffix)
//! tuple. Re-registration moves an entry to the list tail so the platform's
//! preferred ordering survives configuration replays; entries absent from a
//! replay are swept.

use std::net::SocketAddr;
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::{DNSSERVER_PENALTY_TIME, DNSSERVER_PROBE_SPACING};
use crate::message::Name;

/// Relay health, driven by the canary probe.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TestState {
    #[default]
    Untested,
    Passed,
    /// Positive canary answer: defective relay, never used again.
    Failed,
    Disabled,
}

impl TestState {
    /// Whether the server may serve queries at all.
    pub fn usable(&self) -> bool {
        matches!(self, TestState::Untested | TestState::Passed)
    }
}

/// Stable handle for one registry entry; list positions shift as entries
/// are re-appended, handles do not.
pub type ServerId = u64;

/// One configured resolver.
#[derive(Debug, Clone)]
pub struct DnsServer {
    pub(crate) sid: ServerId,
    pub interface: u32,
    pub addr: SocketAddr,
    pub domain: Name,
    pub test_state: TestState,
    /// Pending-delete marker used during configuration replays.
    pub(crate) flag_delete: bool,
    /// Transaction id of the in-flight canary probe.
    pub(crate) test_id: u16,
    pub(crate) last_test: Option<Instant>,
    pub(crate) penalty_until: Option<Instant>,
}

impl DnsServer {
    pub(crate) fn penalized(&self, now: Instant) -> bool {
        self.penalty_until.is_some_and(|t| t > now)
    }

    /// Rate limit between canary probes of one server.
    pub(crate) fn may_probe(&self, now: Instant) -> bool {
        self.last_test
            .is_none_or(|t| now.duration_since(t) >= DNSSERVER_PROBE_SPACING)
    }
}

/// The server table. Order is platform order and is preserved.
#[derive(Default)]
pub struct ServerRegistry {
    list: Vec<DnsServer>,
    next_sid: ServerId,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a server, always re-appending so platform ordering is kept,
    /// and resets any penalty. Returns the entry's stable handle.
    pub fn add_server(
        &mut self,
        interface: u32,
        addr: SocketAddr,
        domain: Name,
        _now: Instant,
    ) -> ServerId {
        info!("add_server: {addr} for {domain}");
        let existing = self.list.iter().position(|s| {
            s.interface == interface
                && s.addr == addr
                && s.domain == domain
                && s.test_state != TestState::Disabled
        });
        let mut server = match existing {
            Some(i) => {
                let mut s = self.list.remove(i);
                if !s.flag_delete {
                    debug!("add_server: {addr} for {domain} registered more than once");
                }
                s.flag_delete = false;
                s
            }
            None => {
                self.next_sid += 1;
                DnsServer {
                    sid: self.next_sid,
                    interface,
                    addr,
                    domain,
                    test_state: TestState::Untested,
                    flag_delete: false,
                    test_id: 0,
                    last_test: None,
                    penalty_until: None,
                }
            }
        };
        server.penalty_until = None;
        let sid = server.sid;
        self.list.push(server);
        sid
    }

    /// Begins a configuration replay: every entry becomes pending-delete
    /// until re-added.
    pub fn mark_all_for_delete(&mut self) {
        for s in &mut self.list {
            s.flag_delete = true;
        }
    }

    /// Ends a configuration replay, dropping entries not re-added.
    pub fn sweep_deleted(&mut self) {
        self.list.retain(|s| {
            if s.flag_delete {
                info!("sweeping DNS server {} for {}", s.addr, s.domain);
            }
            !s.flag_delete
        });
    }

    /// Picks the best server for `name`: among usable, unpenalized entries
    /// whose domain is a suffix of `name`, the one with the most specific
    /// suffix; platform order breaks ties.
    pub fn select(&self, name: &Name, now: Instant) -> Option<ServerId> {
        let mut best: Option<(usize, ServerId)> = None; // (labels, sid)
        for s in &self.list {
            if s.flag_delete || !s.test_state.usable() || s.penalized(now) {
                continue;
            }
            if !name.ends_with(&s.domain) {
                continue;
            }
            let score = s.domain.label_count();
            if best.is_none_or(|(b, _)| score > b) {
                best = Some((score, s.sid));
            }
        }
        best.map(|(_, sid)| sid)
    }

    /// Puts a server in the penalty box for the standard window.
    pub fn penalize(&mut self, sid: ServerId, now: Instant) {
        if let Some(s) = self.get_mut(sid) {
            warn!(
                "penalizing DNS server {} for {:?}",
                s.addr, DNSSERVER_PENALTY_TIME
            );
            s.penalty_until = Some(now + DNSSERVER_PENALTY_TIME);
        }
    }

    /// Clears penalties whose window has elapsed.
    pub fn reset_expired_penalties(&mut self, now: Instant) {
        for s in &mut self.list {
            if let Some(t) = s.penalty_until
                && t <= now
            {
                info!("DNS server {} out of penalty box", s.addr);
                s.penalty_until = None;
            }
        }
    }

    /// Earliest pending penalty expiry, for scheduling.
    pub fn next_penalty_expiry(&self) -> Option<Instant> {
        self.list.iter().filter_map(|s| s.penalty_until).min()
    }

    /// Finds the server a probe reply came from, matching by source address
    /// or by the probe's transaction id.
    pub fn find_probe_target(&mut self, from: SocketAddr, msg_id: u16) -> Option<&mut DnsServer> {
        self.list.iter_mut().find(|s| {
            s.addr == from || (s.test_state == TestState::Untested && s.test_id == msg_id)
        })
    }

    pub fn get(&self, sid: ServerId) -> Option<&DnsServer> {
        self.list.iter().find(|s| s.sid == sid)
    }

    pub fn get_mut(&mut self, sid: ServerId) -> Option<&mut DnsServer> {
        self.list.iter_mut().find(|s| s.sid == sid)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DnsServer> {
        self.list.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:53").parse().unwrap()
    }

    #[test]
    fn test_add_server_reappends_to_tail() {
        let now = Instant::now();
        let mut reg = ServerRegistry::new();
        reg.add_server(0, addr(1), Name::root(), now);
        reg.add_server(0, addr(2), Name::root(), now);
        reg.add_server(0, addr(1), Name::root(), now);
        assert_eq!(reg.len(), 2);
        // Re-registration moved .1 behind .2.
        let order: Vec<_> = reg.iter().map(|s| s.addr).collect();
        assert_eq!(order, vec![addr(2), addr(1)]);
    }

    #[test]
    fn test_select_prefers_most_specific_suffix() {
        let now = Instant::now();
        let mut reg = ServerRegistry::new();
        reg.add_server(0, addr(1), Name::root(), now);
        reg.add_server(0, addr(2), Name::new("example.com.").unwrap(), now);
        let i = reg
            .select(&Name::new("host.example.com.").unwrap(), now)
            .unwrap();
        assert_eq!(reg.get(i).unwrap().addr, addr(2));
        let i = reg.select(&Name::new("host.other.org.").unwrap(), now).unwrap();
        assert_eq!(reg.get(i).unwrap().addr, addr(1));
    }

    #[test]
    fn test_penalty_skips_server_until_reset() {
        let now = Instant::now();
        let mut reg = ServerRegistry::new();
        reg.add_server(0, addr(1), Name::root(), now);
        reg.add_server(0, addr(2), Name::root(), now);

        let first = reg.select(&Name::new("x.example.com.").unwrap(), now).unwrap();
        reg.penalize(first, now);
        let second = reg.select(&Name::new("x.example.com.").unwrap(), now).unwrap();
        assert_ne!(first, second);

        // All penalized: no server.
        reg.penalize(second, now);
        assert!(reg.select(&Name::new("x.example.com.").unwrap(), now).is_none());

        // Window elapses.
        let later = now + DNSSERVER_PENALTY_TIME + Duration::from_secs(1);
        reg.reset_expired_penalties(later);
        assert!(reg.select(&Name::new("x.example.com.").unwrap(), later).is_some());
    }

    #[test]
    fn test_config_replay_sweeps_absent_servers() {
        let now = Instant::now();
        let mut reg = ServerRegistry::new();
        reg.add_server(0, addr(1), Name::root(), now);
        reg.add_server(0, addr(2), Name::root(), now);

        reg.mark_all_for_delete();
        reg.add_server(0, addr(2), Name::root(), now);
        reg.sweep_deleted();

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.iter().next().unwrap().addr, addr(2));
    }

    #[test]
    fn test_failed_server_not_selected() {
        let now = Instant::now();
        let mut reg = ServerRegistry::new();
        let sid = reg.add_server(0, addr(1), Name::root(), now);
        reg.get_mut(sid).unwrap().test_state = TestState::Failed;
        assert!(reg.select(&Name::new("x.example.com.").unwrap(), now).is_none());
    }
}
