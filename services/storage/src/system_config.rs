//! Zone configuration lookup.
//!
//! Zones are attached to key boundaries: a zone applies from its start key up
//! to the next boundary. A range whose span crosses a boundary must be split
//! before its replication policy is well defined.

use std::collections::BTreeMap;
use std::ops::Bound;

use rangekeep_queue::SplitPolicy;

use crate::error::PolicyError;
use crate::replica::Replica;
use crate::types::{Key, ZoneConfig};

/// In-memory system configuration.
#[derive(Debug, Clone, Default)]
pub struct SystemConfig {
    zones: BTreeMap<Key, ZoneConfig>,
    default_zone: Option<ZoneConfig>,
}

impl SystemConfig {
    /// A config with no zones and no default.
    pub fn new() -> Self {
        Self::default()
    }

    /// A config where every key uses `zone`.
    pub fn with_default_zone(zone: ZoneConfig) -> Self {
        Self {
            zones: BTreeMap::new(),
            default_zone: Some(zone),
        }
    }

    /// Apply `zone` from `start_key` up to the next boundary.
    pub fn with_zone(mut self, start_key: impl Into<Key>, zone: ZoneConfig) -> Self {
        self.zones.insert(start_key.into(), zone);
        self
    }

    /// The zone governing `key`.
    pub fn zone_for_key(&self, key: &[u8]) -> Result<ZoneConfig, PolicyError> {
        self.zones
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, zone)| zone)
            .or(self.default_zone.as_ref())
            .cloned()
            .ok_or_else(|| PolicyError::NoZoneForKey { key: key.to_vec() })
    }

    /// Zone boundaries strictly inside `(start, end)`.
    ///
    /// A non-empty result means the span must be split at these keys.
    pub fn compute_split_keys(&self, start: &[u8], end: &[u8]) -> Vec<Key> {
        if start >= end {
            return Vec::new();
        }
        self.zones
            .range::<[u8], _>((Bound::Excluded(start), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl SplitPolicy<Replica> for SystemConfig {
    fn needs_split(&self, replica: &Replica) -> bool {
        let desc = replica.desc();
        !self
            .compute_split_keys(&desc.start_key, &desc.end_key)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SystemConfig {
        SystemConfig::with_default_zone(ZoneConfig::with_replication_factor(3))
            .with_zone(b"m".to_vec(), ZoneConfig::with_replication_factor(5))
            .with_zone(b"t".to_vec(), ZoneConfig::with_replication_factor(1))
    }

    #[test]
    fn test_zone_for_key() {
        let cfg = config();
        assert_eq!(cfg.zone_for_key(b"a").unwrap().replication_factor(), 3);
        assert_eq!(cfg.zone_for_key(b"m").unwrap().replication_factor(), 5);
        assert_eq!(cfg.zone_for_key(b"p").unwrap().replication_factor(), 5);
        assert_eq!(cfg.zone_for_key(b"z").unwrap().replication_factor(), 1);
    }

    #[test]
    fn test_zone_lookup_without_default() {
        let cfg =
            SystemConfig::new().with_zone(b"m".to_vec(), ZoneConfig::with_replication_factor(3));
        assert_eq!(
            cfg.zone_for_key(b"a"),
            Err(PolicyError::NoZoneForKey { key: b"a".to_vec() })
        );
        assert!(cfg.zone_for_key(b"n").is_ok());
    }

    #[test]
    fn test_compute_split_keys() {
        let cfg = config();
        assert!(cfg.compute_split_keys(b"a", b"m").is_empty());
        assert!(cfg.compute_split_keys(b"m", b"t").is_empty());
        assert_eq!(cfg.compute_split_keys(b"a", b"n"), vec![b"m".to_vec()]);
        assert_eq!(
            cfg.compute_split_keys(b"a", b"z"),
            vec![b"m".to_vec(), b"t".to_vec()]
        );
        assert!(cfg.compute_split_keys(b"z", b"a").is_empty());
    }
}
