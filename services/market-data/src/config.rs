//! Service configuration from environment variables
//!
//! Credentials are required; everything else has a default. Values that
//! are present but unparsable are errors, never silently defaulted.

use std::env;
use std::time::Duration;

use thiserror::Error;
use types::ids::Symbol;
use types::interval::Interval;

use crate::backpressure::DropPolicy;
use crate::cache::CacheConfig;
use crate::dispatcher::DispatcherConfig;
use crate::feed::FeedCredentials;

pub const DEFAULT_ENDPOINT: &str = "wss://stream.example.invalid/ws";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime configuration of the market data service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub credentials: FeedCredentials,
    pub ticker_max_age: Duration,
    pub sweep_interval: Duration,
    pub sweep_max_age: Duration,
    pub update_channel_capacity: usize,
    pub consumer_queue_capacity: usize,
    pub consumer_drop_policy: DropPolicy,
    /// Subscribed at startup by the binary.
    pub symbols: Vec<Symbol>,
    pub short_intervals: Vec<Interval>,
    pub long_intervals: Vec<Interval>,
}

impl ServiceConfig {
    /// Config with the given credentials and defaults elsewhere.
    pub fn with_credentials(credentials: FeedCredentials) -> Self {
        Self {
            credentials,
            ticker_max_age: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            sweep_max_age: Duration::from_secs(86_400),
            update_channel_capacity: 4096,
            consumer_queue_capacity: 1000,
            consumer_drop_policy: DropPolicy::DropOldest,
            symbols: Vec::new(),
            short_intervals: vec![Interval::M1, Interval::M5, Interval::M15],
            long_intervals: vec![Interval::H1, Interval::H4, Interval::D1],
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let credentials = FeedCredentials {
            api_key: var("MD_FEED_API_KEY").ok_or(ConfigError::Missing("MD_FEED_API_KEY"))?,
            api_secret: var("MD_FEED_API_SECRET")
                .ok_or(ConfigError::Missing("MD_FEED_API_SECRET"))?,
            endpoint: var("MD_FEED_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
        };
        let mut config = Self::with_credentials(credentials);

        if let Some(secs) = parse_u64(var("MD_TICKER_MAX_AGE_SECS"), "MD_TICKER_MAX_AGE_SECS")? {
            config.ticker_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(var("MD_SWEEP_INTERVAL_SECS"), "MD_SWEEP_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(invalid("MD_SWEEP_INTERVAL_SECS", "0", "must be positive"));
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(var("MD_SWEEP_MAX_AGE_SECS"), "MD_SWEEP_MAX_AGE_SECS")? {
            config.sweep_max_age = Duration::from_secs(secs);
        }
        if let Some(n) = parse_capacity(var("MD_UPDATE_CHANNEL_CAPACITY"), "MD_UPDATE_CHANNEL_CAPACITY")? {
            config.update_channel_capacity = n;
        }
        if let Some(n) = parse_capacity(var("MD_CONSUMER_QUEUE_CAPACITY"), "MD_CONSUMER_QUEUE_CAPACITY")? {
            config.consumer_queue_capacity = n;
        }
        if let Some(raw) = var("MD_CONSUMER_DROP_POLICY") {
            config.consumer_drop_policy = DropPolicy::parse(&raw).ok_or_else(|| {
                invalid("MD_CONSUMER_DROP_POLICY", &raw, "expected disconnect or drop_oldest")
            })?;
        }
        if let Some(raw) = var("MD_SYMBOLS") {
            config.symbols = parse_symbols(&raw)?;
        }
        if let Some(raw) = var("MD_SHORT_INTERVALS") {
            config.short_intervals = parse_intervals(&raw, "MD_SHORT_INTERVALS")?;
        }
        if let Some(raw) = var("MD_LONG_INTERVALS") {
            config.long_intervals = parse_intervals(&raw, "MD_LONG_INTERVALS")?;
        }

        Ok(config)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            update_channel_capacity: self.update_channel_capacity,
            ticker_max_age: self.ticker_max_age,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.consumer_queue_capacity,
            drop_policy: self.consumer_drop_policy,
        }
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_u64(raw: Option<String>, name: &'static str) -> Result<Option<u64>, ConfigError> {
    raw.map(|s| s.parse::<u64>().map_err(|e| invalid(name, &s, e.to_string())))
        .transpose()
}

fn parse_capacity(raw: Option<String>, name: &'static str) -> Result<Option<usize>, ConfigError> {
    match parse_u64(raw, name)? {
        Some(0) => Err(invalid(name, "0", "must be positive")),
        Some(n) => Ok(Some(n as usize)),
        None => Ok(None),
    }
}

fn parse_symbols(raw: &str) -> Result<Vec<Symbol>, ConfigError> {
    let mut symbols = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let symbol = Symbol::try_new(part)
            .ok_or_else(|| invalid("MD_SYMBOLS", part, "not an alphanumeric symbol"))?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    Ok(symbols)
}

fn parse_intervals(raw: &str, name: &'static str) -> Result<Vec<Interval>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<Interval>().map_err(|e| invalid(name, p, e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const CREDS: [(&str, &str); 2] = [("MD_FEED_API_KEY", "key"), ("MD_FEED_API_SECRET", "secret")];

    #[test]
    fn test_defaults_with_credentials() {
        let config = ServiceConfig::from_lookup(lookup(&CREDS)).unwrap();
        assert_eq!(config.credentials.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.ticker_max_age, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.consumer_drop_policy, DropPolicy::DropOldest);
        assert!(config.symbols.is_empty());
        assert_eq!(config.long_intervals, vec![Interval::H1, Interval::H4, Interval::D1]);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = ServiceConfig::from_lookup(lookup(&[("MD_FEED_API_KEY", "key")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("MD_FEED_API_SECRET"));

        let blank = ServiceConfig::from_lookup(lookup(&[
            ("MD_FEED_API_KEY", "   "),
            ("MD_FEED_API_SECRET", "secret"),
        ]))
        .unwrap_err();
        assert_eq!(blank, ConfigError::Missing("MD_FEED_API_KEY"));
    }

    #[test]
    fn test_overrides_parsed() {
        let mut vars = CREDS.to_vec();
        vars.extend([
            ("MD_TICKER_MAX_AGE_SECS", "30"),
            ("MD_CONSUMER_DROP_POLICY", "disconnect"),
            ("MD_SYMBOLS", "btcusdt, ETHUSDT,,btcusdt"),
            ("MD_SHORT_INTERVALS", "1s,3m"),
        ]);
        let config = ServiceConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.ticker_max_age, Duration::from_secs(30));
        assert_eq!(config.consumer_drop_policy, DropPolicy::Disconnect);
        assert_eq!(
            config.symbols,
            vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")]
        );
        assert_eq!(config.short_intervals, vec![Interval::S1, Interval::M3]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (name, value) in [
            ("MD_TICKER_MAX_AGE_SECS", "soon"),
            ("MD_CONSUMER_QUEUE_CAPACITY", "0"),
            ("MD_CONSUMER_DROP_POLICY", "block"),
            ("MD_SYMBOLS", "BTC-USDT"),
            ("MD_LONG_INTERVALS", "1h,2d"),
        ] {
            let mut vars = CREDS.to_vec();
            vars.push((name, value));
            let err = ServiceConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: n, .. } if n == name),
                "{name} accepted {value}"
            );
        }
    }
}
