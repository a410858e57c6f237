use std::time::Duration;

use serde::{Deserialize, Serialize};

use nidb_index::DEFAULT_MAX_INDEXES;
use nidb_query::QueryStrategy;
use nidb_queue::DEFAULT_BATCH_WRITE;

use crate::error::{RelayError, RelayResult};

/// Engine options. Every field is optional when deserialized; missing
/// fields keep their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay between the end of one flush and the start of the next.
    pub write_interval_ms: u64,
    /// Maximum events written per flush.
    pub batch_write: usize,
    /// Capacity of the index cache, in whole indexes.
    pub cache_indexes: usize,
    /// Period of the prune timer.
    pub prune_interval_ms: u64,
    /// Size the pruner trims the store down to.
    pub max_events: usize,
    /// How long a subscription's catch-up may run before EOSE is forced.
    pub base_eose_timeout_ms: u64,
    pub query_strategy: QueryStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_interval_ms: 100,
            batch_write: DEFAULT_BATCH_WRITE,
            cache_indexes: DEFAULT_MAX_INDEXES,
            prune_interval_ms: 60_000,
            max_events: 10_000,
            base_eose_timeout_ms: 4400,
            query_strategy: QueryStrategy::SetBased,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document holding any subset of the fields.
    pub fn from_toml_str(source: &str) -> RelayResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> RelayResult<()> {
        if self.batch_write == 0 {
            return Err(RelayError::Config("batch_write must be at least 1".into()));
        }
        if self.write_interval_ms == 0 {
            return Err(RelayError::Config("write_interval_ms must be at least 1".into()));
        }
        if self.prune_interval_ms == 0 {
            return Err(RelayError::Config("prune_interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_query_strategy(mut self, strategy: QueryStrategy) -> Self {
        self.query_strategy = strategy;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_base_eose_timeout(mut self, timeout: Duration) -> Self {
        self.base_eose_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn base_eose_timeout(&self) -> Duration {
        Duration::from_millis(self.base_eose_timeout_ms)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.write_interval(), Duration::from_millis(100));
        assert_eq!(c.batch_write, 1000);
        assert_eq!(c.cache_indexes, 1000);
        assert_eq!(c.prune_interval(), Duration::from_secs(60));
        assert_eq!(c.max_events, 10_000);
        assert_eq!(c.base_eose_timeout(), Duration::from_millis(4400));
        assert_eq!(c.query_strategy, QueryStrategy::SetBased);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = EngineConfig::from_toml_str(
            r#"
            max_events = 50
            query_strategy = "cursor_merge"
            "#,
        )
        .unwrap();
        assert_eq!(c.max_events, 50);
        assert_eq!(c.query_strategy, QueryStrategy::CursorMerge);
        assert_eq!(c.batch_write, 1000);
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("batch_write = 0"),
            Err(RelayError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("max_events = \"lots\""),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn zero_intervals_fail_validation() {
        let c = EngineConfig {
            prune_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(c.validate(), Err(RelayError::Config(_))));
        let c = EngineConfig {
            write_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(c.validate(), Err(RelayError::Config(_))));
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn toml_roundtrip() {
        let c = EngineConfig::default().with_base_eose_timeout(Duration::from_millis(250));
        let text = toml::to_string(&c).unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), c);
    }
}
