use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::*;
use crate::model::Ms;

/// Server settings, read from `DESKHOLD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub hold_ttl: Duration,
    pub reap_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            hold_ttl: Duration::from_millis(DEFAULT_HOLD_TTL_MS as u64),
            reap_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset or unparseable values keep their
    /// defaults; the hold TTL is clamped to what the store accepts.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(&format!("DESKHOLD_{key}"));
        let parsed = |key: &str| get(key).and_then(|v| parse_logged::<u64>(key, &v));

        let hold_ttl_ms = parsed("HOLD_TTL_SECS")
            .map(|s| (s as Ms).saturating_mul(1000).clamp(MIN_HOLD_TTL_MS, MAX_HOLD_TTL_MS))
            .unwrap_or(DEFAULT_HOLD_TTL_MS);

        Self {
            bind: get("BIND").unwrap_or(d.bind),
            port: get("PORT").and_then(|v| parse_logged("PORT", &v)).unwrap_or(d.port),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: get("MAX_CONNECTIONS")
                .and_then(|v| parse_logged("MAX_CONNECTIONS", &v))
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed("COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: get("METRICS_PORT").and_then(|v| parse_logged("METRICS_PORT", &v)),
            hold_ttl: Duration::from_millis(hold_ttl_ms as u64),
            reap_interval: parsed("REAP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.reap_interval),
        }
    }

    pub fn hold_ttl_ms(&self) -> Ms {
        self.hold_ttl.as_millis() as Ms
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_logged<T: FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!("ignoring DESKHOLD_{key}={value:?}: not a valid value");
    }
    parsed
}

/// Booking-flow knobs used on the client side of the store. Slot interval,
/// buffer and rates come from each space's settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingPolicy {
    pub horizon_days: u32,
    /// Quiet period before an advisory conflict check is sent.
    pub debounce: Duration,
    pub request_timeout: Duration,
    pub max_alternatives: usize,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            horizon_days: MAX_HORIZON_DAYS,
            debounce: Duration::from_millis(300),
            request_timeout: Duration::from_secs(5),
            max_alternatives: MAX_ALTERNATIVES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Config::from_lookup(|_| None), Config::default());
        assert_eq!(Config::default().listen_addr(), "0.0.0.0:7433");
    }

    #[test]
    fn reads_prefixed_keys() {
        let config = Config::from_lookup(lookup(&[
            ("DESKHOLD_PORT", "9000"),
            ("DESKHOLD_BIND", "127.0.0.1"),
            ("DESKHOLD_DATA_DIR", "/var/lib/deskhold"),
            ("DESKHOLD_MAX_CONNECTIONS", "8"),
            ("DESKHOLD_METRICS_PORT", "9100"),
            ("DESKHOLD_HOLD_TTL_SECS", "600"),
            ("DESKHOLD_REAP_INTERVAL_SECS", "1"),
        ]));
        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/deskhold"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.hold_ttl_ms(), 600_000);
        assert_eq!(config.reap_interval, Duration::from_secs(1));
    }

    #[test]
    fn bad_values_fall_back_and_ttl_is_clamped() {
        let config = Config::from_lookup(lookup(&[
            ("DESKHOLD_PORT", "not-a-port"),
            ("DESKHOLD_MAX_CONNECTIONS", "0"),
            ("DESKHOLD_HOLD_TTL_SECS", "5"),
        ]));
        assert_eq!(config.port, 7433);
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.hold_ttl_ms(), MIN_HOLD_TTL_MS);

        let config = Config::from_lookup(lookup(&[("DESKHOLD_HOLD_TTL_SECS", "86400")]));
        assert_eq!(config.hold_ttl_ms(), MAX_HOLD_TTL_MS);
    }

    #[test]
    fn policy_defaults() {
        let policy = BookingPolicy::default();
        assert_eq!(policy.debounce, Duration::from_millis(300));
        assert_eq!(policy.horizon_days, 365);
        assert_eq!(policy.max_alternatives, 5);
    }
}
