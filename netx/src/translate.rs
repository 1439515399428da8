use std::{net::Ipv4Addr, sync::Arc};

use tracing::trace;

use crate::{
    nat64::{Nat64Prefix, PrefixCache},
    Network,
};

/// Rewrites IPv4 dial targets into NAT64-synthesized IPv6 addresses
///
/// Cloning is cheap; clones read the same [`PrefixCache`].
#[derive(Debug, Clone)]
pub struct Translator {
    cache: Arc<PrefixCache>,
}

impl Translator {
    /// Translate against the prefix currently held by `cache`
    pub fn new(cache: Arc<PrefixCache>) -> Self {
        Self { cache }
    }

    /// Translate a dial to `addr` over `network` using the cached prefix
    ///
    /// Family-qualified networks (`tcp4`, `tcp6`, ...) are dialed as-is, as the caller asked for
    /// a specific family. Otherwise see [`translate`] for the rules. Never blocks and never fails.
    pub fn translate(&self, network: Network, addr: &str) -> String {
        if network.family().is_some() {
            return addr.to_owned();
        }
        translate(addr, self.cache.get())
    }
}

/// Apply a NAT64 prefix to a `host:port` dial target
///
/// Returns `addr` unchanged unless all of the following hold: it splits into host and port, the
/// host is an IPv4 literal, the literal is not a private or reserved address, and a prefix is
/// given. Otherwise the result is the synthesized IPv6 address joined with the original port.
pub fn translate(addr: &str, prefix: Option<Nat64Prefix>) -> String {
    let Some((host, port)) = split_host_port(addr) else {
        return addr.to_owned();
    };
    let Ok(ip) = host.parse::<Ipv4Addr>() else {
        return addr.to_owned();
    };
    if is_private(ip) {
        return addr.to_owned();
    }
    let Some(prefix) = prefix else {
        return addr.to_owned();
    };
    let translated = join_host_port(&prefix.synthesize(ip).to_string(), port);
    trace!(%addr, %translated, "applied NAT64 prefix");
    translated
}

/// Split `host:port` or `[host]:port` into its parts
///
/// Follows the platform convention: a host containing `:` must be bracketed, and brackets are
/// only allowed around the whole host.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let colon = addr.rfind(':')?;
    let (host, port) = (&addr[..colon], &addr[colon + 1..]);
    let host = match host.strip_prefix('[') {
        Some(rest) => rest.strip_suffix(']')?,
        None => host,
    };
    if host.contains(['[', ']']) || port.contains(['[', ']']) {
        return None;
    }
    if !addr.starts_with('[') && host.contains(':') {
        return None;
    }
    Some((host, port))
}

/// Join a host and port, bracketing hosts that contain `:`
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Whether `ip` belongs to a private, local or otherwise reserved range
///
/// NAT64 gateways only translate to the public IPv4 internet, so these destinations are always
/// dialed as-is.
pub fn is_private(ip: Ipv4Addr) -> bool {
    let bits = u32::from(ip);
    RESERVED_V4.iter().any(|&(network, len)| {
        let mask = u32::MAX << (32 - len);
        bits & mask == u32::from(network) & mask
    })
}

const RESERVED_V4: [(Ipv4Addr, u32); 15] = [
    (Ipv4Addr::new(0, 0, 0, 0), 8),        // "this" network
    (Ipv4Addr::new(10, 0, 0, 0), 8),       // RFC 1918
    (Ipv4Addr::new(100, 64, 0, 0), 10),    // carrier-grade NAT
    (Ipv4Addr::new(127, 0, 0, 0), 8),      // loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16),   // link-local
    (Ipv4Addr::new(172, 16, 0, 0), 12),    // RFC 1918
    (Ipv4Addr::new(192, 0, 0, 0), 24),     // IETF protocol assignments
    (Ipv4Addr::new(192, 0, 2, 0), 24),     // TEST-NET-1
    (Ipv4Addr::new(192, 88, 99, 0), 24),   // 6to4 relay anycast
    (Ipv4Addr::new(192, 168, 0, 0), 16),   // RFC 1918
    (Ipv4Addr::new(198, 18, 0, 0), 15),    // benchmarking
    (Ipv4Addr::new(198, 51, 100, 0), 24),  // TEST-NET-2
    (Ipv4Addr::new(203, 0, 113, 0), 24),   // TEST-NET-3
    (Ipv4Addr::new(224, 0, 0, 0), 4),      // multicast
    (Ipv4Addr::new(240, 0, 0, 0), 4),      // reserved, including broadcast
];
