//! Configuration for replica placement.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::allocator::{RebalancingOptions, DEFAULT_REBALANCE_THRESHOLD};

/// Replica placement configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Maximum queued ranges per store.
    pub queue_max_size: usize,

    /// Pause between processed ranges. Zero processes greedily.
    pub timer_interval: Duration,

    /// How long a published store descriptor stays in the feed.
    pub store_ttl: Duration,

    /// A store silent for this long is considered dead.
    pub time_until_store_dead: Duration,

    /// How often the store pool checks for silent stores.
    pub store_sweep_interval: Duration,

    /// Load-based rebalancing knobs.
    pub rebalancing: RebalancingOptions,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            queue_max_size: rangekeep_queue::DEFAULT_MAX_SIZE,
            timer_interval: Duration::ZERO,
            store_ttl: Duration::from_secs(10),
            time_until_store_dead: Duration::from_secs(5 * 60),
            store_sweep_interval: Duration::from_secs(1),
            rebalancing: RebalancingOptions::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ReplicationConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let queue_max_size =
            parse_or(&lookup, "RANGEKEEP_QUEUE_MAX_SIZE", defaults.queue_max_size)?;
        if queue_max_size == 0 {
            bail!("RANGEKEEP_QUEUE_MAX_SIZE must be at least 1");
        }

        let timer_interval = Duration::from_millis(parse_or(
            &lookup,
            "RANGEKEEP_TIMER_INTERVAL_MS",
            defaults.timer_interval.as_millis() as u64,
        )?);

        let store_ttl = Duration::from_secs(parse_or(
            &lookup,
            "RANGEKEEP_STORE_TTL_SECS",
            defaults.store_ttl.as_secs(),
        )?);

        let time_until_store_dead = Duration::from_secs(parse_or(
            &lookup,
            "RANGEKEEP_TIME_UNTIL_STORE_DEAD_SECS",
            defaults.time_until_store_dead.as_secs(),
        )?);

        let store_sweep_interval = Duration::from_millis(parse_or(
            &lookup,
            "RANGEKEEP_STORE_SWEEP_INTERVAL_MS",
            defaults.store_sweep_interval.as_millis() as u64,
        )?);
        if store_sweep_interval.is_zero() {
            bail!("RANGEKEEP_STORE_SWEEP_INTERVAL_MS must be positive");
        }

        let threshold = parse_or(
            &lookup,
            "RANGEKEEP_REBALANCE_THRESHOLD",
            DEFAULT_REBALANCE_THRESHOLD,
        )?;
        if !(0.0..1.0).contains(&threshold) {
            bail!("RANGEKEEP_REBALANCE_THRESHOLD must be in [0, 1), got {threshold}");
        }

        let rebalancing = RebalancingOptions {
            allow_rebalance: parse_or(
                &lookup,
                "RANGEKEEP_ALLOW_REBALANCE",
                defaults.rebalancing.allow_rebalance,
            )?,
            deterministic: parse_or(
                &lookup,
                "RANGEKEEP_DETERMINISTIC_REBALANCE",
                defaults.rebalancing.deterministic,
            )?,
            threshold,
        };

        let log_level = lookup("RANGEKEEP_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            queue_max_size,
            timer_interval,
            store_ttl,
            time_until_store_dead,
            store_sweep_interval,
            rebalancing,
            log_level,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ReplicationConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ReplicationConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.queue_max_size, 100);
        assert!(config.timer_interval.is_zero());
        assert_eq!(config.time_until_store_dead, Duration::from_secs(300));
        assert!(config.rebalancing.allow_rebalance);
        assert!(!config.rebalancing.deterministic);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("RANGEKEEP_QUEUE_MAX_SIZE", "25"),
            ("RANGEKEEP_TIMER_INTERVAL_MS", "50"),
            ("RANGEKEEP_ALLOW_REBALANCE", "false"),
            ("RANGEKEEP_REBALANCE_THRESHOLD", "0.2"),
            ("RANGEKEEP_LOG_LEVEL", "debug"),
        ])
        .unwrap();

        assert_eq!(config.queue_max_size, 25);
        assert_eq!(config.timer_interval, Duration::from_millis(50));
        assert!(!config.rebalancing.allow_rebalance);
        assert!((config.rebalancing.threshold - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(load(&[("RANGEKEEP_QUEUE_MAX_SIZE", "lots")]).is_err());
        assert!(load(&[("RANGEKEEP_QUEUE_MAX_SIZE", "0")]).is_err());
        assert!(load(&[("RANGEKEEP_REBALANCE_THRESHOLD", "1.5")]).is_err());
        assert!(load(&[("RANGEKEEP_STORE_SWEEP_INTERVAL_MS", "0")]).is_err());
    }
}
