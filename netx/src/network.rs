use std::{fmt, io, net::IpAddr, str::FromStr};

use thiserror::Error;

/// Transport and address family requested by a caller
///
/// Mirrors the network strings accepted by the platform dial and resolve primitives. The
/// family-qualified kinds (`tcp4`, `udp6`, ...) restrict resolution to a single address family,
/// while the unqualified kinds prefer IPv4 results when a name resolves to both.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Network {
    /// TCP over either address family
    Tcp,
    /// TCP over IPv4 only
    Tcp4,
    /// TCP over IPv6 only
    Tcp6,
    /// UDP over either address family
    Udp,
    /// UDP over IPv4 only
    Udp4,
    /// UDP over IPv6 only
    Udp6,
}

/// Address family selected by a [`Network`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl Network {
    /// Whether this is one of the TCP kinds
    pub fn is_tcp(self) -> bool {
        matches!(self, Self::Tcp | Self::Tcp4 | Self::Tcp6)
    }

    /// Whether this is one of the UDP kinds
    pub fn is_udp(self) -> bool {
        !self.is_tcp()
    }

    /// The address family this network is restricted to, if any
    pub fn family(self) -> Option<Family> {
        match self {
            Self::Tcp | Self::Udp => None,
            Self::Tcp4 | Self::Udp4 => Some(Family::V4),
            Self::Tcp6 | Self::Udp6 => Some(Family::V6),
        }
    }

    /// Whether `ip` may be used as an endpoint for this network
    pub fn accepts(self, ip: IpAddr) -> bool {
        match self.family() {
            None => true,
            Some(Family::V4) => ip.is_ipv4(),
            Some(Family::V6) => ip.is_ipv6(),
        }
    }

    /// Pick the address to use out of a resolver's answer
    ///
    /// Family-qualified networks only accept addresses of their family. Unqualified networks
    /// prefer the first IPv4 address and fall back to the first address of any family, as local
    /// servers rarely listen on IPv6 unless asked to.
    pub fn select<I, T>(self, candidates: I, ip_of: impl Fn(&T) -> IpAddr) -> Option<T>
    where
        I: IntoIterator<Item = T>,
    {
        let mut fallback = None;
        for candidate in candidates {
            let ip = ip_of(&candidate);
            match self.family() {
                Some(_) if self.accepts(ip) => return Some(candidate),
                Some(_) => {}
                None if ip.is_ipv4() => return Some(candidate),
                None => {
                    if fallback.is_none() {
                        fallback = Some(candidate);
                    }
                }
            }
        }
        fallback
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "tcp" => Self::Tcp,
            "tcp4" => Self::Tcp4,
            "tcp6" => Self::Tcp6,
            "udp" => Self::Udp,
            "udp4" => Self::Udp4,
            "udp6" => Self::Udp6,
            _ => return Err(UnknownNetwork(s.to_owned())),
        })
    }
}

impl TryFrom<&str> for Network {
    type Error = UnknownNetwork;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A network string that isn't one of `tcp`, `tcp4`, `tcp6`, `udp`, `udp4` or `udp6`
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown network {0:?}")]
pub struct UnknownNetwork(pub String);

impl From<UnknownNetwork> for io::Error {
    fn from(e: UnknownNetwork) -> Self {
        Self::new(io::ErrorKind::InvalidInput, e)
    }
}

/// Error returned when an operation is invoked with a network of the wrong transport
pub(crate) fn unsupported_network(network: Network, op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{op}: unsupported network {network}"),
    )
}
