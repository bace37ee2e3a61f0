//! Engine configuration.
//!
//! [`EngineConfig`] carries the host-supplied network facts the engine cannot
//! discover itself (advertised address, default router) plus a small number
//! of policy knobs. Timing constants live here as well so every component
//! draws them from one place.

use std::net::Ipv4Addr;
use std::time::Duration;

// Unicast question scheduling.

/// First retransmit interval for a unicast question.
pub(crate) const INITIAL_QUESTION_INTERVAL: Duration = Duration::from_secs(1);

/// Question retransmit intervals grow by this factor per send.
pub(crate) const QUESTION_INTERVAL_STEP: u32 = 3;

/// Floor for unicast polling and registration retries (3 seconds).
pub(crate) const INIT_UCAST_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Cap for plain unicast question retries (60 minutes).
pub(crate) const MAX_UCAST_POLL_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Unanswered sends before the question's server is penalized.
pub(crate) const MAX_UCAST_UNANSWERED_QUERIES: u32 = 2;

/// How long a penalized server is skipped during selection.
pub(crate) const DNSSERVER_PENALTY_TIME: Duration = Duration::from_secs(60);

/// Minimum spacing between canary probes of one server.
pub(crate) const DNSSERVER_PROBE_SPACING: Duration = Duration::from_secs(3);

/// Window after an outbound port-53 query during which further standard
/// queries are held back.
pub(crate) const PORT53_SUPPRESSION_WINDOW: Duration = Duration::from_millis(10);

/// TTL used for the synthesized negative answer when no server is usable.
pub(crate) const NEGATIVE_ANSWER_TTL: u32 = 60;

// Long-lived queries.

/// LLQ protocol version.
pub(crate) const LLQ_VERS: u16 = 1;

/// Default LLQ lease requested from the server (2 hours).
pub(crate) const LLQ_DEF_LEASE: u32 = 7200;

/// Attempt cap for each LLQ handshake step.
pub(crate) const LLQ_MAX_TRIES: u32 = 3;

/// Base resend delay for an unacknowledged LLQ packet; grows per attempt.
pub(crate) const LLQ_INIT_RESEND: Duration = Duration::from_secs(2);

/// Poll interval in degraded (non-push) mode, before jitter.
pub(crate) const LLQ_POLL_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Once a stream is up, never schedule a faster LLQ retry than this.
pub(crate) const LLQ_STREAM_INTERVAL_FLOOR: Duration = Duration::from_secs(256);

// NAT traversal.

/// First NAT-PMP retry (250 ms), doubling from there.
pub(crate) const NATMAP_INIT_RETRY: Duration = Duration::from_millis(250);

/// NAT-PMP retry/keep-alive ceiling (15 minutes).
pub(crate) const NATMAP_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Floor for mapping renewal scheduling.
pub(crate) const NATMAP_MIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Mapping lease requested when the caller does not specify one (2 hours).
pub(crate) const NATMAP_DEFAULT_LEASE: u32 = 60 * 60 * 2;

// Registrations.

/// Lease carried in the update-lease option of dynamic updates (2 hours).
pub(crate) const DEFAULT_UPDATE_LEASE: u32 = 7200;

/// Registration retry ceiling (30 minutes).
pub(crate) const MAX_UPDATE_RETRY_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Interval while waiting for zone data to show up.
pub(crate) const ZONE_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum retry once a stream connection is established for an update.
pub(crate) const STREAM_RETRY_FLOOR: Duration = Duration::from_secs(30);

/// Retry after a stream connect attempt failed outright.
pub(crate) const STREAM_CONNECT_RETRY: Duration = Duration::from_secs(5);

/// Delay registrations are parked at when the host goes to sleep.
pub(crate) const SLEEP_RETRY_DELAY: Duration = Duration::from_secs(300);

// Well-known ports.

/// Conventional unicast DNS port.
pub(crate) const UNICAST_DNS_PORT: u16 = 53;

/// Multicast DNS port, used as the LLQ event port on routable addresses.
pub(crate) const MULTICAST_DNS_PORT: u16 = 5353;

/// Engine configuration.
///
/// ```rust
/// use std::net::Ipv4Addr;
/// use wadns::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_advertised_v4(Ipv4Addr::new(192, 168, 1, 40))
///     .with_router(Ipv4Addr::new(192, 168, 1, 1));
/// ```
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// Primary IPv4 address this host advertises. A private (RFC 1918)
    /// address here makes the engine reach for NAT traversal.
    pub advertised_v4: Option<Ipv4Addr>,

    /// Default gateway. NAT-PMP requests go here; none means no traversal.
    pub router: Option<Ipv4Addr>,

    /// Preserve strict platform ordering of DNS servers instead of
    /// penalty-based rotation.
    pub strict_server_ordering: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised IPv4 address.
    pub fn with_advertised_v4(mut self, addr: Ipv4Addr) -> Self {
        self.advertised_v4 = Some(addr);
        self
    }

    /// Set the default router address.
    pub fn with_router(mut self, router: Ipv4Addr) -> Self {
        self.router = Some(router);
        self
    }

    /// Preserve the platform-supplied server order strictly.
    pub fn with_strict_server_ordering(mut self, strict: bool) -> Self {
        self.strict_server_ordering = strict;
        self
    }
}

/// RFC 1918 private address test, used for NAT decisions throughout.
pub(crate) fn is_rfc1918(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10 || (o[0] == 172 && (o[1] & 0xF0) == 16) || (o[0] == 192 && o[1] == 168)
}
