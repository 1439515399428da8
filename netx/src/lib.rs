//! Swappable network primitives with NAT64 traversal
//!
//! This crate sits between application code and the platform's dial, listen and resolve
//! primitives. Every operation goes through a [`Registry`] whose implementations can be replaced
//! at runtime, which makes it possible to intercept, tunnel or fake network access without
//! touching call sites. The entry point is [`Netx`].
//!
//! # NAT64
//!
//! On an IPv6-only network, IPv4 hosts are reachable through a NAT64 gateway at addresses
//! synthesized from a `/96` prefix. Such networks advertise the prefix through DNS64, which
//! [`Netx::enable_nat64_auto_discovery`] queries in the background. Once a prefix is known, dials
//! to literal public IPv4 addresses are rewritten to the matching IPv6 address; hostnames are
//! left to the resolver, which already synthesizes addresses on such networks.
//!
//! A dial that fails with an unreachable error triggers a fresh probe, as the host may have just
//! joined or left a NAT64 network. Probes are debounced and never run more often than the
//! configured minimum interval.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

use std::{future::Future, pin::Pin};

mod config;
mod conn;
mod context;
mod dialer;
mod error;
pub mod nat64;
mod network;
mod ops;
mod service;
mod translate;

pub use crate::config::{
    Config, RefreshMode, RetryPolicy, DEFAULT_DIAL_TIMEOUT, MIN_NAT64_QUERY_INTERVAL,
    NAT64_PROBE_HOST,
};
pub use crate::conn::{walk_wrapped, AsyncConn, Conn};
pub use crate::context::{Context, ContextGuard};
pub use crate::dialer::{ContextDialer, DialerExt};
pub use crate::error::{is_timeout, is_unreachable, ConfigError};
pub use crate::nat64::{Nat64Prefix, PrefixCache};
pub use crate::network::{Family, Network, UnknownNetwork};
pub use crate::ops::{Dial, DialUdp, ListenUdp, Registry, ResolveTcp, ResolveUdp, SystemNet};
pub use crate::service::Netx;
pub use crate::translate::{is_private, join_host_port, split_host_port, translate, Translator};


/// Boxed future returned by the pluggable operation traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
