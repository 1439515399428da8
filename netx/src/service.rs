use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::{Config, RetryPolicy},
    conn::Conn,
    dialer::ContextDialer,
    error::is_unreachable,
    nat64::{LookupIp, Nat64Prefix, PrefixCache},
    ops::{Dial, DialUdp, ListenUdp, Registry, ResolveTcp, ResolveUdp},
    translate::Translator,
    BoxFuture, Context, Network,
};

/// Entry point for dialing, listening and resolving through swappable implementations
///
/// A `Netx` owns the [`Registry`] of network operations and the [`PrefixCache`] used to reach
/// IPv4 destinations from IPv6-only networks. Construct one at startup and share it; every
/// method takes `&self`.
///
/// Dials to literal, public IPv4 addresses are rewritten under the discovered NAT64 prefix once
/// auto-discovery has been enabled with [`Netx::enable_nat64_auto_discovery`]. Until then no
/// prefix is known and addresses pass through untouched.
pub struct Netx {
    config: Config,
    registry: Registry,
    cache: Arc<PrefixCache>,
    translator: Translator,
    refresher: Mutex<Option<Refresher>>,
}

#[derive(Debug)]
struct Refresher {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Netx {
    /// Create a `Netx` using the platform implementations and resolver
    pub fn new(config: Config) -> Self {
        let cache = Arc::new(PrefixCache::new(&config));
        Self::with_cache(config, cache)
    }

    /// Create a `Netx` whose NAT64 probe resolves names with `lookup`
    pub fn with_lookup(config: Config, lookup: impl LookupIp) -> Self {
        let cache = Arc::new(PrefixCache::with_lookup(&config, lookup));
        Self::with_cache(config, cache)
    }

    fn with_cache(config: Config, cache: Arc<PrefixCache>) -> Self {
        Self {
            config,
            registry: Registry::new(),
            translator: Translator::new(cache.clone()),
            cache,
            refresher: Mutex::new(None),
        }
    }

    /// Start discovering the NAT64 prefix in the background
    ///
    /// Must be called from within a Tokio runtime. Only the first call has an effect; it returns
    /// `true` if this call started the refresher.
    pub fn enable_nat64_auto_discovery(&self) -> bool {
        let mut refresher = self.refresher();
        if refresher.is_some() {
            return false;
        }
        let shutdown = CancellationToken::new();
        let Some(task) = self.cache.spawn(shutdown.clone()) else {
            return false;
        };
        *refresher = Some(Refresher { shutdown, task });
        true
    }

    /// Stop the NAT64 prefix refresher, waiting for it to exit
    ///
    /// The cached prefix is kept. Auto-discovery cannot be re-enabled afterwards.
    pub async fn shutdown(&self) {
        let refresher = self.refresher().take();
        if let Some(Refresher { shutdown, task }) = refresher {
            shutdown.cancel();
            if let Err(e) = task.await {
                debug!("NAT64 prefix refresher ended abnormally: {e}");
            }
        }
    }

    /// The prefix dials are currently translated with
    pub fn nat64_prefix(&self) -> Option<Nat64Prefix> {
        self.cache.get()
    }

    /// The NAT64 prefix cache
    pub fn prefix_cache(&self) -> &Arc<PrefixCache> {
        &self.cache
    }

    /// The registry of network operations
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Dial `addr` over `network` using the configured default timeout
    pub async fn dial(&self, network: Network, addr: &str) -> io::Result<Conn> {
        self.dial_timeout(network, addr, self.config.default_dial_timeout)
            .await
    }

    /// Dial `addr` over `network`, giving up after `timeout`
    pub async fn dial_timeout(
        &self,
        network: Network,
        addr: &str,
        timeout: Duration,
    ) -> io::Result<Conn> {
        let guard = Context::background().with_timeout(timeout).guard();
        self.dial_context(guard.context(), network, addr).await
    }

    /// Dial `addr` over `network` within `ctx`
    ///
    /// Literal public IPv4 addresses dialed over `tcp` or `udp` are translated under the current
    /// NAT64 prefix first; family-qualified networks are never translated. If the dial fails
    /// because the destination is unreachable, a prefix refresh is requested, since the host may
    /// have moved onto or off a NAT64 network. With [`RetryPolicy::RetryOnce`] the dial is then
    /// retried against a freshly translated address.
    pub async fn dial_context(
        &self,
        ctx: &Context,
        network: Network,
        addr: &str,
    ) -> io::Result<Conn> {
        let translated = self.translator.translate(network, addr);
        let err = match self.attempt(ctx, network, &translated).await {
            Ok(conn) => return Ok(conn),
            Err(e) => e,
        };
        if !is_unreachable(&err) {
            return Err(err);
        }

        debug!(%network, %addr, %translated, "destination unreachable: {err}");
        self.cache.request_refresh();
        match self.config.retry_policy {
            RetryPolicy::RefreshOnly => Err(err),
            RetryPolicy::RetryOnce => {
                let translated = self.translator.translate(network, addr);
                trace!(%network, %addr, %translated, "retrying dial");
                self.attempt(ctx, network, &translated).await
            }
        }
    }

    async fn attempt(&self, ctx: &Context, network: Network, addr: &str) -> io::Result<Conn> {
        ctx.run(self.registry.dial(network, addr)).await
    }

    /// Create a UDP socket connected to `remote`
    ///
    /// Not subject to NAT64 translation.
    pub fn dial_udp(
        &self,
        network: Network,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> io::Result<UdpSocket> {
        self.registry.dial_udp(network, local, remote)
    }

    /// Create a UDP socket listening on `local`
    pub fn listen_udp(&self, network: Network, local: Option<SocketAddr>) -> io::Result<UdpSocket> {
        self.registry.listen_udp(network, local)
    }

    /// Resolve a TCP `host:port`
    ///
    /// Not subject to NAT64 translation.
    pub async fn resolve(&self, network: Network, addr: &str) -> io::Result<SocketAddr> {
        self.registry.resolve_tcp(network, addr).await
    }

    /// Resolve a UDP `host:port`
    ///
    /// Not subject to NAT64 translation.
    pub async fn resolve_udp(&self, network: Network, addr: &str) -> io::Result<SocketAddr> {
        self.registry.resolve_udp(network, addr).await
    }

    /// Replace the stream dialer
    pub fn override_dial(&self, dial: impl Dial) {
        self.registry.override_dial(dial);
    }

    /// Replace the connected UDP socket factory
    pub fn override_dial_udp(&self, dial_udp: impl DialUdp) {
        self.registry.override_dial_udp(dial_udp);
    }

    /// Replace the listening UDP socket factory
    pub fn override_listen_udp(&self, listen_udp: impl ListenUdp) {
        self.registry.override_listen_udp(listen_udp);
    }

    /// Replace the TCP resolver
    pub fn override_resolve(&self, resolve: impl ResolveTcp) {
        self.registry.override_resolve_tcp(resolve);
    }

    /// Replace the UDP resolver
    pub fn override_resolve_udp(&self, resolve: impl ResolveUdp) {
        self.registry.override_resolve_udp(resolve);
    }

    /// Restore every network operation to its platform implementation
    pub fn reset(&self) {
        self.registry.reset();
    }

    fn refresher(&self) -> std::sync::MutexGuard<'_, Option<Refresher>> {
        self.refresher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Netx {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl ContextDialer for Netx {
    fn dial_context<'a>(
        &'a self,
        ctx: &'a Context,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<Conn>> {
        Box::pin(Self::dial_context(self, ctx, network, addr))
    }
}

impl Drop for Netx {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher().take() {
            refresher.shutdown.cancel();
        }
    }
}

impl fmt::Debug for Netx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netx")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
