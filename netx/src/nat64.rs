//! NAT64 prefix discovery and caching
//!
//! On an IPv6-only network, a NAT64 gateway reaches the IPv4 internet on behalf of its clients
//! through a `/96` prefix: the IPv6 address `prefix ++ a.b.c.d` stands for the IPv4 host
//! `a.b.c.d`. A DNS64 resolver answers AAAA queries for IPv4-only names with such synthesized
//! addresses, so resolving the reserved name `ipv4only.arpa` (RFC 7050) reveals the prefix.
//!
//! [`PrefixCache`] holds the last discovered prefix for lock-free reads from the dial path, and a
//! single background task re-probes it when asked to.

use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwapOption;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::{Config, RefreshMode},
    BoxFuture,
};

/// The top 96 bits of a NAT64 `/96` prefix
///
/// Never all zeros: that would be the IPv4-mapped range, which means no NAT64 is available.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Nat64Prefix([u8; 12]);

impl Nat64Prefix {
    /// The well-known prefix `64:ff9b::/96` (RFC 6052)
    pub const WELL_KNOWN: Self = Self([0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0]);

    /// Construct a prefix, rejecting the all-zero value
    pub fn new(octets: [u8; 12]) -> Option<Self> {
        if octets.iter().all(|&b| b == 0) {
            return None;
        }
        Some(Self(octets))
    }

    /// Take the prefix from the top 96 bits of a synthesized address
    ///
    /// Returns `None` for IPv4-mapped addresses and for an all-zero prefix.
    pub fn from_synthesized(addr: Ipv6Addr) -> Option<Self> {
        if addr.to_ipv4_mapped().is_some() {
            return None;
        }
        let octets = addr.octets();
        let mut prefix = [0; 12];
        prefix.copy_from_slice(&octets[..12]);
        Self::new(prefix)
    }

    /// The prefix bytes
    pub fn octets(&self) -> [u8; 12] {
        self.0
    }

    /// Embed `ip` in the low 32 bits of an address under this prefix
    pub fn synthesize(&self, ip: Ipv4Addr) -> Ipv6Addr {
        let mut octets = [0; 16];
        octets[..12].copy_from_slice(&self.0);
        octets[12..].copy_from_slice(&ip.octets());
        Ipv6Addr::from(octets)
    }

    /// Recover the IPv4 address embedded in `addr`, if `addr` is under this prefix
    pub fn extract(&self, addr: Ipv6Addr) -> Option<Ipv4Addr> {
        let octets = addr.octets();
        if octets[..12] != self.0 {
            return None;
        }
        Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    }
}

impl fmt::Debug for Nat64Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nat64Prefix({self})")
    }
}

impl fmt::Display for Nat64Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/96", self.synthesize(Ipv4Addr::UNSPECIFIED))
    }
}

/// A discovered prefix together with when it was fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixRecord {
    /// The prefix itself
    pub prefix: Nat64Prefix,
    /// When the probe that found it completed
    pub fetched_at: Instant,
    /// When it stops being used if no probe confirms it again
    pub expires_at: Option<Instant>,
}

impl PrefixRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expiry| now < expiry)
    }
}

/// Name lookup used by the NAT64 probe
pub trait LookupIp: Send + Sync + 'static {
    /// Resolve `host` to all of its addresses
    fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

impl<F> LookupIp for F
where
    F: Fn(&str) -> BoxFuture<'static, io::Result<Vec<IpAddr>>> + Send + Sync + 'static,
{
    fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        self(host)
    }
}

/// Looks names up with the platform resolver
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemLookup;

impl LookupIp for SystemLookup {
    fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, 0)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        })
    }
}

/// Cache of the current NAT64 prefix, refreshed by a background probe task
pub struct PrefixCache {
    current: ArcSwapOption<PrefixRecord>,
    lookup: Box<dyn LookupIp>,
    probe_host: String,
    min_query_interval: Duration,
    refresh_mode: RefreshMode,
    prefix_ttl: Option<Duration>,
    /// Serializes probes
    probing: Mutex<()>,
    refresh_tx: mpsc::Sender<()>,
    refresh_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl PrefixCache {
    /// Create an empty cache that probes with the system resolver
    pub fn new(config: &Config) -> Self {
        Self::with_lookup(config, SystemLookup)
    }

    /// Create an empty cache that probes with `lookup`
    pub fn with_lookup(config: &Config, lookup: impl LookupIp) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        Self {
            current: ArcSwapOption::empty(),
            lookup: Box::new(lookup),
            probe_host: config.nat64_probe_host.clone(),
            min_query_interval: config.min_query_interval,
            refresh_mode: config.refresh_mode,
            prefix_ttl: config.prefix_ttl,
            probing: Mutex::new(()),
            refresh_tx,
            refresh_rx: std::sync::Mutex::new(Some(refresh_rx)),
        }
    }

    /// The current prefix, if one is known and still live
    ///
    /// Never performs I/O and never waits on a running probe.
    pub fn get(&self) -> Option<Nat64Prefix> {
        self.record().map(|record| record.prefix)
    }

    /// The current prefix record, if one is known and still live
    pub fn record(&self) -> Option<Arc<PrefixRecord>> {
        self.current
            .load_full()
            .filter(|record| record.is_live(Instant::now()))
    }

    /// Ask the background task to probe again
    ///
    /// Returns immediately. Requests made while one is already pending are dropped, so a burst
    /// of requests results in a single probe.
    pub fn request_refresh(&self) {
        match self.refresh_tx.try_send(()) {
            Ok(()) => debug!("requested NAT64 prefix refresh"),
            Err(mpsc::error::TrySendError::Full(())) => trace!("NAT64 prefix refresh already pending"),
            Err(mpsc::error::TrySendError::Closed(())) => {
                trace!("NAT64 prefix refresher not running")
            }
        }
    }

    /// Run one discovery probe and store its outcome
    ///
    /// Only one probe runs at a time; concurrent callers wait for the running one and then probe
    /// again. A failed lookup keeps the previous record. A lookup that yields no usable prefix
    /// clears it.
    pub async fn probe(&self) -> Option<Nat64Prefix> {
        let _probing = self.probing.lock().await;
        trace!(host = %self.probe_host, "probing for NAT64 prefix");
        let ips = match self.lookup.lookup_ip(&self.probe_host).await {
            Ok(ips) => ips,
            Err(e) => {
                debug!(host = %self.probe_host, "NAT64 prefix lookup failed: {e}");
                return self.get();
            }
        };
        let found = ips.into_iter().find_map(|ip| match ip {
            IpAddr::V6(v6) => Nat64Prefix::from_synthesized(v6),
            IpAddr::V4(_) => None,
        });
        let now = Instant::now();
        self.current.store(found.map(|prefix| {
            Arc::new(PrefixRecord {
                prefix,
                fetched_at: now,
                expires_at: self.expiry(now),
            })
        }));
        found
    }

    /// Start the background refresher on the current Tokio runtime
    ///
    /// The task probes immediately, then again whenever a refresh is requested (or the period
    /// elapses, in [`RefreshMode::Periodic`]), never more often than the minimum query interval.
    /// Returns `None` if a refresher was already started for this cache.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let rx = self
            .refresh_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        debug!("enabling NAT64 auto-discovery");
        Some(tokio::spawn(Arc::clone(self).run(rx, shutdown)))
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<()>, shutdown: CancellationToken) {
        let mut prior = None;
        loop {
            let next = self.probe().await;
            if next != prior {
                match next {
                    Some(prefix) => debug!(?prior, %prefix, "NAT64 prefix changed"),
                    None => debug!(?prior, "NAT64 prefix cleared"),
                }
                prior = next;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.min_query_interval) => {}
            }

            let period = match self.refresh_mode {
                RefreshMode::OnDemand => None,
                RefreshMode::Periodic(period) => {
                    Some(period.saturating_sub(self.min_query_interval))
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = rx.recv() => {
                    if signal.is_none() {
                        warn!("NAT64 refresh channel closed");
                        break;
                    }
                }
                _ = sleep_opt(period) => {}
            }
        }
        debug!("NAT64 prefix refresher stopped");
    }

    /// When a record fetched at `now` stops being used; `None` if it never expires
    fn expiry(&self, now: Instant) -> Option<Instant> {
        self.prefix_ttl.and_then(|ttl| now.checked_add(ttl))
    }

    #[cfg(test)]
    pub(crate) fn set(&self, prefix: Option<Nat64Prefix>) {
        let now = Instant::now();
        self.current.store(prefix.map(|prefix| {
            Arc::new(PrefixRecord {
                prefix,
                fetched_at: now,
                expires_at: self.expiry(now),
            })
        }));
    }
}

impl fmt::Debug for PrefixCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixCache")
            .field("current", &self.current.load_full())
            // lookup not debug
            .field("probe_host", &self.probe_host)
            .field("min_query_interval", &self.min_query_interval)
            .field("refresh_mode", &self.refresh_mode)
            .field("prefix_ttl", &self.prefix_ttl)
            .finish_non_exhaustive()
    }
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every lookup with a fixed set of addresses and counts the calls
    #[derive(Clone)]
    struct FixedLookup {
        answer: Arc<std::sync::Mutex<io::Result<Vec<IpAddr>>>>,
        calls: Arc<AtomicUsize>,
    }

    impl FixedLookup {
        fn new(ips: &[&str]) -> Self {
            Self {
                answer: Arc::new(std::sync::Mutex::new(Ok(parse(ips)))),
                calls: Arc::default(),
            }
        }

        fn answer(&self, answer: io::Result<Vec<IpAddr>>) {
            *self.answer.lock().unwrap() = answer;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LookupIp for FixedLookup {
        fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
            assert_eq!(host, "ipv4only.arpa");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = match &*self.answer.lock().unwrap() {
                Ok(ips) => Ok(ips.clone()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            Box::pin(async move { answer })
        }
    }

    fn parse(ips: &[&str]) -> Vec<IpAddr> {
        ips.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    fn cache(lookup: &FixedLookup) -> Arc<PrefixCache> {
        Arc::new(PrefixCache::with_lookup(&Config::default(), lookup.clone()))
    }

    #[test]
    fn rejects_zero_prefix() {
        assert_eq!(Nat64Prefix::new([0; 12]), None);
        assert!(Nat64Prefix::from_synthesized("::ffff:192.0.0.170".parse().unwrap()).is_none());
        assert!(Nat64Prefix::from_synthesized("::c000:aa".parse().unwrap()).is_none());
        assert_eq!(
            Nat64Prefix::from_synthesized("64:ff9b::c000:aa".parse().unwrap()),
            Some(Nat64Prefix::WELL_KNOWN)
        );
        assert_eq!(Nat64Prefix::WELL_KNOWN.to_string(), "64:ff9b::/96");
    }

    #[test]
    fn extract_only_matches_own_prefix() {
        let other = Nat64Prefix::new([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let addr = other.synthesize(Ipv4Addr::new(8, 8, 4, 4));
        assert_eq!(other.extract(addr), Some(Ipv4Addr::new(8, 8, 4, 4)));
        assert_eq!(Nat64Prefix::WELL_KNOWN.extract(addr), None);
    }

    #[tokio::test]
    async fn probe_takes_first_synthesized_address() {
        let lookup = FixedLookup::new(&["192.0.0.170", "::ffff:192.0.0.171", "64:ff9b::c000:aa"]);
        let cache = cache(&lookup);
        assert_eq!(cache.get(), None);
        assert_eq!(cache.probe().await, Some(Nat64Prefix::WELL_KNOWN));
        assert_eq!(cache.get(), Some(Nat64Prefix::WELL_KNOWN));
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn zero_prefix_is_absent() {
        let lookup = FixedLookup::new(&["::c000:aa"]);
        let cache = cache(&lookup);
        cache.set(Some(Nat64Prefix::WELL_KNOWN));
        assert_eq!(cache.probe().await, None);
        assert_eq!(cache.get(), None);
    }

    #[tokio::test]
    async fn ipv4_only_answer_clears_prefix() {
        let lookup = FixedLookup::new(&["64:ff9b::c000:aa"]);
        let cache = cache(&lookup);
        cache.probe().await;
        assert!(cache.get().is_some());

        lookup.answer(Ok(parse(&["192.0.0.170", "192.0.0.171"])));
        cache.probe().await;
        assert_eq!(cache.get(), None);
    }

    #[tokio::test]
    async fn failed_lookup_keeps_prefix() {
        let lookup = FixedLookup::new(&["64:ff9b::c000:aa"]);
        let cache = cache(&lookup);
        cache.probe().await;

        lookup.answer(Err(io::Error::from(io::ErrorKind::TimedOut)));
        assert_eq!(cache.probe().await, Some(Nat64Prefix::WELL_KNOWN));
        assert_eq!(cache.get(), Some(Nat64Prefix::WELL_KNOWN));
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_expires_after_ttl() {
        let lookup = FixedLookup::new(&["64:ff9b::c000:aa"]);
        let mut config = Config::default();
        config.prefix_ttl(Some(Duration::from_secs(30))).unwrap();
        let cache = PrefixCache::with_lookup(&config, lookup.clone());
        cache.probe().await;
        let record = cache.record().unwrap();
        assert_eq!(record.expires_at, Some(record.fetched_at + Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(), None);
    }

    #[tokio::test]
    async fn huge_ttl_never_expires() {
        let lookup = FixedLookup::new(&["64:ff9b::c000:aa"]);
        let mut config = Config::default();
        config.prefix_ttl(Some(Duration::MAX)).unwrap();
        let cache = PrefixCache::with_lookup(&config, lookup.clone());
        assert_eq!(cache.probe().await, Some(Nat64Prefix::WELL_KNOWN));
        assert_eq!(cache.record().unwrap().expires_at, None);
        assert_eq!(cache.get(), Some(Nat64Prefix::WELL_KNOWN));
    }

    /// Takes a while to answer and tracks how many lookups overlap
    #[derive(Clone, Default)]
    struct SlowLookup {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl LookupIp for SlowLookup {
        fn lookup_ip<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(active, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(parse(&["64:ff9b::c000:aa"]))
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn probes_never_overlap() {
        let lookup = SlowLookup::default();
        let cache = Arc::new(PrefixCache::with_lookup(&Config::default(), lookup.clone()));
        let tasks = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.probe().await })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Some(Nat64Prefix::WELL_KNOWN));
        }
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 8);
        assert_eq!(lookup.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_requests_are_coalesced() {
        let lookup = FixedLookup::new(&["64:ff9b::c000:aa"]);
        let cache = cache(&lookup);
        let shutdown = CancellationToken::new();
        let task = cache.spawn(shutdown.clone()).unwrap();
        assert!(cache.spawn(shutdown.clone()).is_none());

        // Initial probe
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lookup.calls(), 1);
        assert_eq!(cache.get(), Some(Nat64Prefix::WELL_KNOWN));

        // A storm of requests while the refresher sits out the minimum interval
        for _ in 0..100 {
            cache.request_refresh();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lookup.calls(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(lookup.calls(), 2);

        // Nothing pending: the refresher stays idle
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lookup.calls(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_mode_reprobes() {
        let lookup = FixedLookup::new(&["64:ff9b::c000:aa"]);
        let mut config = Config::default();
        config
            .refresh_mode(RefreshMode::Periodic(Duration::from_secs(30)))
            .unwrap();
        let cache = Arc::new(PrefixCache::with_lookup(&config, lookup.clone()));
        let shutdown = CancellationToken::new();
        let task = cache.spawn(shutdown.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lookup.calls(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(lookup.calls(), 2);

        lookup.answer(Ok(Vec::new()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(lookup.calls(), 3);
        assert_eq!(cache.get(), None);

        shutdown.cancel();
        task.await.unwrap();
    }
}
