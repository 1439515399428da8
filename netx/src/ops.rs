use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use arc_swap::ArcSwap;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use crate::{
    conn::Conn,
    network::{unsupported_network, Family, Network},
    translate::split_host_port,
    BoxFuture,
};

/// Establishes stream connections
pub trait Dial: Send + Sync + 'static {
    /// Connect to `addr` over `network`
    ///
    /// Dropping the returned future must abort the attempt.
    fn dial<'a>(&'a self, network: Network, addr: &'a str) -> BoxFuture<'a, io::Result<Conn>>;
}

/// Creates connected UDP sockets
pub trait DialUdp: Send + Sync + 'static {
    /// Create a UDP socket bound to `local`, or an ephemeral port, and connected to `remote`
    ///
    /// Must be called from within a Tokio runtime.
    fn dial_udp(
        &self,
        network: Network,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> io::Result<UdpSocket>;
}

/// Creates listening UDP sockets
pub trait ListenUdp: Send + Sync + 'static {
    /// Create a UDP socket bound to `local`, or an ephemeral port
    ///
    /// Must be called from within a Tokio runtime.
    fn listen_udp(&self, network: Network, local: Option<SocketAddr>) -> io::Result<UdpSocket>;
}

/// Resolves `host:port` strings for TCP
pub trait ResolveTcp: Send + Sync + 'static {
    /// Resolve `addr` to a single endpoint usable with `network`
    fn resolve_tcp<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<SocketAddr>>;
}

/// Resolves `host:port` strings for UDP
pub trait ResolveUdp: Send + Sync + 'static {
    /// Resolve `addr` to a single endpoint usable with `network`
    fn resolve_udp<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<SocketAddr>>;
}

impl<F> Dial for F
where
    F: Fn(Network, &str) -> BoxFuture<'static, io::Result<Conn>> + Send + Sync + 'static,
{
    fn dial<'a>(&'a self, network: Network, addr: &'a str) -> BoxFuture<'a, io::Result<Conn>> {
        self(network, addr)
    }
}

impl<F> DialUdp for F
where
    F: Fn(Network, Option<SocketAddr>, SocketAddr) -> io::Result<UdpSocket>
        + Send
        + Sync
        + 'static,
{
    fn dial_udp(
        &self,
        network: Network,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> io::Result<UdpSocket> {
        self(network, local, remote)
    }
}

impl<F> ListenUdp for F
where
    F: Fn(Network, Option<SocketAddr>) -> io::Result<UdpSocket> + Send + Sync + 'static,
{
    fn listen_udp(&self, network: Network, local: Option<SocketAddr>) -> io::Result<UdpSocket> {
        self(network, local)
    }
}

impl<F> ResolveTcp for F
where
    F: Fn(Network, &str) -> BoxFuture<'static, io::Result<SocketAddr>> + Send + Sync + 'static,
{
    fn resolve_tcp<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<SocketAddr>> {
        self(network, addr)
    }
}

impl<F> ResolveUdp for F
where
    F: Fn(Network, &str) -> BoxFuture<'static, io::Result<SocketAddr>> + Send + Sync + 'static,
{
    fn resolve_udp<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<SocketAddr>> {
        self(network, addr)
    }
}

/// The current implementation of every overridable network operation
///
/// Each slot always holds an implementation: the platform defaults are installed on
/// construction and by [`Registry::reset`]. Overrides take effect for calls made after they
/// return; calls already in flight finish against the implementation they started with.
pub struct Registry {
    dial: ArcSwap<Box<dyn Dial>>,
    dial_udp: ArcSwap<Box<dyn DialUdp>>,
    listen_udp: ArcSwap<Box<dyn ListenUdp>>,
    resolve_tcp: ArcSwap<Box<dyn ResolveTcp>>,
    resolve_udp: ArcSwap<Box<dyn ResolveUdp>>,
}

impl Registry {
    /// Create a registry holding the platform implementations
    pub fn new() -> Self {
        Self {
            dial: ArcSwap::from_pointee(Box::new(SystemNet) as Box<dyn Dial>),
            dial_udp: ArcSwap::from_pointee(Box::new(SystemNet) as Box<dyn DialUdp>),
            listen_udp: ArcSwap::from_pointee(Box::new(SystemNet) as Box<dyn ListenUdp>),
            resolve_tcp: ArcSwap::from_pointee(Box::new(SystemNet) as Box<dyn ResolveTcp>),
            resolve_udp: ArcSwap::from_pointee(Box::new(SystemNet) as Box<dyn ResolveUdp>),
        }
    }

    /// Replace the stream dialer
    pub fn override_dial(&self, dial: impl Dial) {
        debug!("overriding dial");
        self.dial.store(Arc::new(Box::new(dial) as Box<dyn Dial>));
    }

    /// Replace the connected UDP socket factory
    pub fn override_dial_udp(&self, dial_udp: impl DialUdp) {
        debug!("overriding dial_udp");
        self.dial_udp.store(Arc::new(Box::new(dial_udp) as Box<dyn DialUdp>));
    }

    /// Replace the listening UDP socket factory
    pub fn override_listen_udp(&self, listen_udp: impl ListenUdp) {
        debug!("overriding listen_udp");
        self.listen_udp
            .store(Arc::new(Box::new(listen_udp) as Box<dyn ListenUdp>));
    }

    /// Replace the TCP address resolver
    pub fn override_resolve_tcp(&self, resolve: impl ResolveTcp) {
        debug!("overriding resolve_tcp");
        self.resolve_tcp
            .store(Arc::new(Box::new(resolve) as Box<dyn ResolveTcp>));
    }

    /// Replace the UDP address resolver
    pub fn override_resolve_udp(&self, resolve: impl ResolveUdp) {
        debug!("overriding resolve_udp");
        self.resolve_udp
            .store(Arc::new(Box::new(resolve) as Box<dyn ResolveUdp>));
    }

    /// Restore every operation to its platform implementation
    pub fn reset(&self) {
        debug!("resetting network operations to platform defaults");
        self.dial.store(Arc::new(Box::new(SystemNet) as Box<dyn Dial>));
        self.dial_udp.store(Arc::new(Box::new(SystemNet) as Box<dyn DialUdp>));
        self.listen_udp.store(Arc::new(Box::new(SystemNet) as Box<dyn ListenUdp>));
        self.resolve_tcp.store(Arc::new(Box::new(SystemNet) as Box<dyn ResolveTcp>));
        self.resolve_udp.store(Arc::new(Box::new(SystemNet) as Box<dyn ResolveUdp>));
    }

    /// Dial with the current stream dialer
    pub async fn dial(&self, network: Network, addr: &str) -> io::Result<Conn> {
        let dial = self.dial.load_full();
        dial.dial(network, addr).await
    }

    /// Create a connected UDP socket with the current factory
    pub fn dial_udp(
        &self,
        network: Network,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> io::Result<UdpSocket> {
        self.dial_udp.load().dial_udp(network, local, remote)
    }

    /// Create a listening UDP socket with the current factory
    pub fn listen_udp(&self, network: Network, local: Option<SocketAddr>) -> io::Result<UdpSocket> {
        self.listen_udp.load().listen_udp(network, local)
    }

    /// Resolve with the current TCP resolver
    pub async fn resolve_tcp(&self, network: Network, addr: &str) -> io::Result<SocketAddr> {
        let resolve = self.resolve_tcp.load_full();
        resolve.resolve_tcp(network, addr).await
    }

    /// Resolve with the current UDP resolver
    pub async fn resolve_udp(&self, network: Network, addr: &str) -> io::Result<SocketAddr> {
        let resolve = self.resolve_udp.load_full();
        resolve.resolve_udp(network, addr).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Operations are not debug
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

/// The platform's networking stack
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemNet;

impl Dial for SystemNet {
    fn dial<'a>(&'a self, network: Network, addr: &'a str) -> BoxFuture<'a, io::Result<Conn>> {
        Box::pin(async move {
            if !network.is_tcp() {
                return Err(unsupported_network(network, "dial"));
            }
            let mut last_err = None;
            for target in lookup(network, addr).await? {
                trace!(%network, %target, "connecting");
                match TcpStream::connect(target).await {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        return Ok(Box::new(stream) as Conn);
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| no_suitable_address(network, addr)))
        })
    }
}

impl DialUdp for SystemNet {
    fn dial_udp(
        &self,
        network: Network,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> io::Result<UdpSocket> {
        if !network.is_udp() || !network.accepts(remote.ip()) {
            return Err(unsupported_network(network, "dial_udp"));
        }
        let local = local.unwrap_or_else(|| unspecified(family_of(remote.ip())));
        let socket = bind_udp(network, local)?;
        socket.connect(&socket2::SockAddr::from(remote))?;
        UdpSocket::from_std(socket.into())
    }
}

impl ListenUdp for SystemNet {
    fn listen_udp(&self, network: Network, local: Option<SocketAddr>) -> io::Result<UdpSocket> {
        if !network.is_udp() {
            return Err(unsupported_network(network, "listen_udp"));
        }
        let socket = match (local, network.family()) {
            (Some(local), _) => bind_udp(network, local)?,
            (None, Some(family)) => bind_udp(network, unspecified(family))?,
            // Dual-stack where the host supports IPv6
            (None, None) => match bind_udp(network, unspecified(Family::V6)) {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("dual-stack UDP bind failed, falling back to IPv4: {e}");
                    bind_udp(network, unspecified(Family::V4))?
                }
            },
        };
        UdpSocket::from_std(socket.into())
    }
}

impl ResolveTcp for SystemNet {
    fn resolve_tcp<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<SocketAddr>> {
        Box::pin(async move {
            if !network.is_tcp() {
                return Err(unsupported_network(network, "resolve_tcp"));
            }
            resolve(network, addr).await
        })
    }
}

impl ResolveUdp for SystemNet {
    fn resolve_udp<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<SocketAddr>> {
        Box::pin(async move {
            if !network.is_udp() {
                return Err(unsupported_network(network, "resolve_udp"));
            }
            resolve(network, addr).await
        })
    }
}

async fn resolve(network: Network, addr: &str) -> io::Result<SocketAddr> {
    let candidates = lookup(network, addr).await?;
    network
        .select(candidates, |addr| addr.ip())
        .ok_or_else(|| no_suitable_address(network, addr))
}

/// Resolve `addr` to every endpoint usable with `network`, in resolver order
async fn lookup(network: Network, addr: &str) -> io::Result<Vec<SocketAddr>> {
    let (host, port) = split_host_port(addr).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address {addr:?}: missing port in address"),
        )
    })?;
    let port = port.parse::<u16>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address {addr:?}: invalid port"),
        )
    })?;

    let candidates = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![SocketAddr::new(ip, port)]
    } else if is_localhost(host) {
        // RFC 6761: never send localhost names to the resolver
        match network.family() {
            Some(Family::V6) => vec![SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port)],
            Some(Family::V4) => vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)],
            None => vec![
                SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port),
                SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port),
            ],
        }
    } else {
        tokio::net::lookup_host((host, port)).await?.collect()
    };

    let candidates = candidates
        .into_iter()
        .filter(|candidate| network.accepts(candidate.ip()))
        .collect::<Vec<_>>();
    if candidates.is_empty() {
        return Err(no_suitable_address(network, addr));
    }
    Ok(candidates)
}

fn is_localhost(host: &str) -> bool {
    let host = host.strip_suffix('.').unwrap_or(host);
    host.eq_ignore_ascii_case("localhost")
        || host
            .len()
            .checked_sub(".localhost".len())
            .and_then(|at| host.get(at..))
            .is_some_and(|tail| tail.eq_ignore_ascii_case(".localhost"))
}

fn bind_udp(network: Network, local: SocketAddr) -> io::Result<socket2::Socket> {
    if !network.accepts(local.ip()) {
        return Err(unsupported_network(network, "bind"));
    }
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(local),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if local.is_ipv6() {
        socket.set_only_v6(network.family() == Some(Family::V6))?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(local))?;
    Ok(socket)
}

fn family_of(ip: IpAddr) -> Family {
    match ip {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}

fn unspecified(family: Family) -> SocketAddr {
    match family {
        Family::V6 => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        Family::V4 => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
    }
}

fn no_suitable_address(network: Network, addr: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{network} {addr}: no suitable address found"),
    )
}
