use std::{collections::BTreeSet, net::SocketAddr, num::NonZeroUsize, str::FromStr, time::Duration};

use thiserror::Error;

pub const MAX_CONCURRENT_RECONCILES: &str = "ORC_MAX_CONCURRENT_RECONCILES";
pub const SCOPE_CACHE_SIZE: &str = "ORC_SCOPE_CACHE_SIZE";
pub const BIND_ADDRESS: &str = "ORC_BIND_ADDRESS";
pub const ENABLED_CONTROLLERS: &str = "ORC_ENABLED_CONTROLLERS";
pub const DEFAULT_POLL_SECONDS: &str = "ORC_DEFAULT_POLL_SECONDS";

const DEFAULT_SCOPE_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(size) => size,
    None => panic!("scope cache size must be non-zero"),
};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Operator settings, read once at startup
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Upper bound on concurrent reconciles per controller
    pub max_concurrent_reconciles: u16,

    /// Number of authenticated cloud sessions kept in the scope cache
    pub scope_cache_size: NonZeroUsize,

    /// Address of the metrics and diagnostics server
    pub bind_address: SocketAddr,

    /// Controllers to start. `None` starts every controller.
    pub enabled_controllers: Option<BTreeSet<String>>,

    /// Interval used when polling OpenStack for a resource to appear or become ready
    pub default_poll_period: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 10,
            scope_cache_size: DEFAULT_SCOPE_CACHE_SIZE,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enabled_controllers: None,
            default_poll_period: Duration::from_secs(15),
        }
    }
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults for unset keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrent_reconciles = match lookup(MAX_CONCURRENT_RECONCILES) {
            Some(v) => parse::<u16>(MAX_CONCURRENT_RECONCILES, &v).and_then(|n| {
                if n == 0 {
                    Err(invalid(MAX_CONCURRENT_RECONCILES, &v, "must be at least 1"))
                } else {
                    Ok(n)
                }
            })?,
            None => defaults.max_concurrent_reconciles,
        };

        let scope_cache_size = match lookup(SCOPE_CACHE_SIZE) {
            Some(v) => parse::<NonZeroUsize>(SCOPE_CACHE_SIZE, &v)?,
            None => defaults.scope_cache_size,
        };

        let bind_address = match lookup(BIND_ADDRESS) {
            Some(v) => parse::<SocketAddr>(BIND_ADDRESS, &v)?,
            None => defaults.bind_address,
        };

        let enabled_controllers = lookup(ENABLED_CONTROLLERS)
            .map(|v| {
                v.split(',')
                    .map(|c| c.trim().to_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect::<BTreeSet<_>>()
            })
            .filter(|set| !set.is_empty());

        let default_poll_period = match lookup(DEFAULT_POLL_SECONDS) {
            Some(v) => {
                let secs = parse::<u64>(DEFAULT_POLL_SECONDS, &v)?;
                if secs == 0 {
                    return Err(invalid(DEFAULT_POLL_SECONDS, &v, "must be at least 1"));
                }
                Duration::from_secs(secs)
            }
            None => defaults.default_poll_period,
        };

        Ok(Self {
            max_concurrent_reconciles,
            scope_cache_size,
            bind_address,
            enabled_controllers,
            default_poll_period,
        })
    }

    pub fn controller_enabled(&self, name: &str) -> bool {
        match &self.enabled_controllers {
            Some(enabled) => enabled.contains(name),
            None => true,
        }
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| invalid(key, value, &e.to_string()))
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_keys_use_defaults() {
        let config = OperatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.max_concurrent_reconciles, 10);
        assert_eq!(config.scope_cache_size.get(), 10);
        assert!(config.controller_enabled("network"));
    }

    #[test]
    fn enabled_controllers_are_normalised() {
        let config = OperatorConfig::from_lookup(lookup(&[
            (ENABLED_CONTROLLERS, " Network, subnet,,"),
            (DEFAULT_POLL_SECONDS, "5"),
        ]))
        .unwrap();
        assert!(config.controller_enabled("network"));
        assert!(config.controller_enabled("subnet"));
        assert!(!config.controller_enabled("server"));
        assert_eq!(config.default_poll_period, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = OperatorConfig::from_lookup(lookup(&[(MAX_CONCURRENT_RECONCILES, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == MAX_CONCURRENT_RECONCILES));

        let err = OperatorConfig::from_lookup(lookup(&[(BIND_ADDRESS, "localhost")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == BIND_ADDRESS));

        assert!(OperatorConfig::from_lookup(lookup(&[(SCOPE_CACHE_SIZE, "0")])).is_err());
    }
}
