use std::{io, time::Duration};

use thiserror::Error;

/// Whether `err` means the destination could not be routed to
///
/// This is the signal used to request a NAT64 prefix refresh: the host may have just joined or
/// left a network that only reaches IPv4 destinations through a NAT64 gateway.
pub fn is_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable
    )
}

/// Whether `err` is the result of an operation running out of time
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

/// Errors in the configuration of a [`Netx`](crate::Netx)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive was zero
    #[error("{name} must be greater than zero")]
    ZeroDuration {
        /// The offending parameter
        name: &'static str,
    },
    /// The periodic refresh interval is shorter than the minimum query interval
    #[error("refresh period {period:?} is shorter than the minimum query interval {min:?}")]
    PeriodBelowMinimum {
        /// Configured refresh period
        period: Duration,
        /// Configured minimum query interval
        min: Duration,
    },
    /// The NAT64 probe host is empty
    #[error("NAT64 probe host must not be empty")]
    EmptyProbeHost,
}
