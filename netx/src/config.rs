use std::time::Duration;

use crate::ConfigError;

/// Dial timeout used by [`Netx::dial`](crate::Netx::dial)
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Reserved name whose A records are synthesized into AAAA records by a DNS64 resolver (RFC 7050)
pub const NAT64_PROBE_HOST: &str = "ipv4only.arpa";

/// Floor on the interval between two NAT64 prefix probes
pub const MIN_NAT64_QUERY_INTERVAL: Duration = Duration::from_secs(10);

/// When the NAT64 prefix refresher runs a probe
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RefreshMode {
    /// Probe once at startup, then only when a refresh is requested
    OnDemand,
    /// Probe when a refresh is requested, and at least once per period otherwise
    Periodic(Duration),
}

/// What a dial does after failing with an unreachable error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetryPolicy {
    /// Request a prefix refresh and return the error; the refreshed prefix serves later dials
    RefreshOnly,
    /// Request a prefix refresh, then retry once against a freshly translated address
    RetryOnce,
}

/// Parameters governing dialing and NAT64 prefix discovery
///
/// Default values should be suitable for most applications.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) default_dial_timeout: Duration,
    pub(crate) nat64_probe_host: String,
    pub(crate) min_query_interval: Duration,
    pub(crate) refresh_mode: RefreshMode,
    pub(crate) prefix_ttl: Option<Duration>,
    pub(crate) retry_policy: RetryPolicy,
}

impl Config {
    /// Timeout applied by [`Netx::dial`](crate::Netx::dial)
    ///
    /// Defaults to one minute.
    pub fn default_dial_timeout(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "default_dial_timeout",
            });
        }
        self.default_dial_timeout = value;
        Ok(self)
    }

    /// Name resolved to discover the NAT64 prefix
    ///
    /// Defaults to `ipv4only.arpa`. Only worth changing in tests or on networks that publish a
    /// different well-known name.
    pub fn nat64_probe_host(&mut self, host: impl Into<String>) -> Result<&mut Self, ConfigError> {
        let host = host.into();
        if host.is_empty() {
            return Err(ConfigError::EmptyProbeHost);
        }
        self.nat64_probe_host = host;
        Ok(self)
    }

    /// Minimum time between two NAT64 prefix probes
    ///
    /// Defaults to 10 seconds. Bounds DNS load when dials keep failing as unreachable.
    pub fn min_query_interval(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "min_query_interval",
            });
        }
        if let RefreshMode::Periodic(period) = self.refresh_mode {
            if period < value {
                return Err(ConfigError::PeriodBelowMinimum { period, min: value });
            }
        }
        self.min_query_interval = value;
        Ok(self)
    }

    /// When the prefix refresher probes
    ///
    /// Defaults to [`RefreshMode::OnDemand`].
    pub fn refresh_mode(&mut self, mode: RefreshMode) -> Result<&mut Self, ConfigError> {
        if let RefreshMode::Periodic(period) = mode {
            if period < self.min_query_interval {
                return Err(ConfigError::PeriodBelowMinimum {
                    period,
                    min: self.min_query_interval,
                });
            }
        }
        self.refresh_mode = mode;
        Ok(self)
    }

    /// How long a discovered prefix stays usable without a successful re-probe
    ///
    /// Defaults to `None`, keeping a prefix until a probe replaces or clears it.
    pub fn prefix_ttl(&mut self, value: Option<Duration>) -> Result<&mut Self, ConfigError> {
        if value.is_some_and(|ttl| ttl.is_zero()) {
            return Err(ConfigError::ZeroDuration { name: "prefix_ttl" });
        }
        self.prefix_ttl = value;
        Ok(self)
    }

    /// Behavior after a dial fails with an unreachable error
    ///
    /// Defaults to [`RetryPolicy::RefreshOnly`].
    pub fn retry_policy(&mut self, policy: RetryPolicy) -> &mut Self {
        self.retry_policy = policy;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_dial_timeout: DEFAULT_DIAL_TIMEOUT,
            nat64_probe_host: NAT64_PROBE_HOST.to_owned(),
            min_query_interval: MIN_NAT64_QUERY_INTERVAL,
            refresh_mode: RefreshMode::OnDemand,
            prefix_ttl: None,
            retry_policy: RetryPolicy::RefreshOnly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_durations() {
        let mut config = Config::default();
        assert_eq!(
            config.min_query_interval(Duration::ZERO).unwrap_err(),
            ConfigError::ZeroDuration {
                name: "min_query_interval"
            }
        );
        assert!(config.default_dial_timeout(Duration::ZERO).is_err());
        assert!(config.prefix_ttl(Some(Duration::ZERO)).is_err());
        assert!(config.prefix_ttl(None).is_ok());
    }

    #[test]
    fn periodic_mode_respects_floor() {
        let mut config = Config::default();
        assert!(config
            .refresh_mode(RefreshMode::Periodic(Duration::from_secs(5)))
            .is_err());
        config
            .refresh_mode(RefreshMode::Periodic(Duration::from_secs(30)))
            .unwrap();
        assert!(config.min_query_interval(Duration::from_secs(60)).is_err());
        assert_eq!(config.min_query_interval, MIN_NAT64_QUERY_INTERVAL);
    }

    #[test]
    fn chained_setters() {
        let mut config = Config::default();
        config
            .retry_policy(RetryPolicy::RetryOnce)
            .nat64_probe_host("probe.test")
            .unwrap()
            .min_query_interval(Duration::from_secs(1))
            .unwrap();
        assert_eq!(config.retry_policy, RetryPolicy::RetryOnce);
        assert_eq!(config.nat64_probe_host, "probe.test");
        assert!(config.nat64_probe_host("").is_err());
    }
}
