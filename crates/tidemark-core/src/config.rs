//! Engine configuration.

use crate::context::Environment;
use std::time::Duration;

/// Default ceiling on simultaneously running migrations.
pub const DEFAULT_MAX_CONCURRENT_MIGRATIONS: usize = 5;

/// Ceiling used for production deployments.
pub const PRODUCTION_MAX_CONCURRENT_MIGRATIONS: usize = 1;

/// Default time to wait for a new table to become active, in seconds.
pub const DEFAULT_TABLE_ACTIVE_TIMEOUT_SECS: u64 = 300;

/// Default interval between table status polls, in seconds.
pub const DEFAULT_TABLE_POLL_INTERVAL_SECS: u64 = 2;

/// Default per-step duration estimate for plans, in seconds.
pub const DEFAULT_STEP_ESTIMATE_SECS: u64 = 60;

/// Default number of items requested per scan page.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Default number of finished migrations kept in memory for status queries.
pub const DEFAULT_FINISHED_RETENTION: usize = 64;

/// Default table holding migration history.
pub const DEFAULT_HISTORY_TABLE: &str = "tidemark_migration_history";

/// Default table holding in-flight markers.
pub const DEFAULT_IN_FLIGHT_TABLE: &str = "tidemark_migrations_in_flight";

/// Migration engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of migrations in `running` status at once.
    pub max_concurrent_migrations: usize,

    /// Region recorded in contexts and history.
    pub region: String,

    /// Table storing one history record per finished migration.
    pub history_table: String,

    /// Table storing markers for migrations that have not finished.
    pub in_flight_table: String,

    /// How long `createTable` waits for the table to become active.
    pub table_active_timeout: Duration,

    /// Interval between table status polls.
    pub table_poll_interval: Duration,

    /// Estimate used by plans when an operation carries none.
    pub default_step_estimate: Duration,

    /// Items requested per scan page by data operations.
    pub scan_page_size: usize,

    /// Finished migrations kept in memory with their full results. Older ones
    /// are served from history.
    pub finished_retention: usize,
}

impl EngineConfig {
    /// Create a configuration with defaults for the given region.
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            max_concurrent_migrations: DEFAULT_MAX_CONCURRENT_MIGRATIONS,
            region: region.into(),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            in_flight_table: DEFAULT_IN_FLIGHT_TABLE.to_string(),
            table_active_timeout: Duration::from_secs(DEFAULT_TABLE_ACTIVE_TIMEOUT_SECS),
            table_poll_interval: Duration::from_secs(DEFAULT_TABLE_POLL_INTERVAL_SECS),
            default_step_estimate: Duration::from_secs(DEFAULT_STEP_ESTIMATE_SECS),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }

    /// Defaults tuned for an environment. Production allows one migration at a time.
    pub fn for_environment(environment: Environment) -> Self {
        let config = Self::default();
        if environment.is_production() {
            config.with_max_concurrent_migrations(PRODUCTION_MAX_CONCURRENT_MIGRATIONS)
        } else {
            config
        }
    }

    /// Set the concurrency ceiling.
    pub fn with_max_concurrent_migrations(mut self, max: usize) -> Self {
        self.max_concurrent_migrations = max;
        self
    }

    /// Set the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the history table name.
    pub fn with_history_table(mut self, table: impl Into<String>) -> Self {
        self.history_table = table.into();
        self
    }

    /// Set the in-flight marker table name.
    pub fn with_in_flight_table(mut self, table: impl Into<String>) -> Self {
        self.in_flight_table = table.into();
        self
    }

    /// Set the table activation timeout.
    pub fn with_table_active_timeout(mut self, timeout: Duration) -> Self {
        self.table_active_timeout = timeout;
        self
    }

    /// Set the table status poll interval.
    pub fn with_table_poll_interval(mut self, interval: Duration) -> Self {
        self.table_poll_interval = interval;
        self
    }

    /// Set the fallback step estimate.
    pub fn with_default_step_estimate(mut self, estimate: Duration) -> Self {
        self.default_step_estimate = estimate;
        self
    }

    /// Set the scan page size.
    pub fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size.max(1);
        self
    }

    /// Set how many finished migrations stay in memory.
    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_migrations, 5);
        assert_eq!(config.table_active_timeout, Duration::from_secs(300));
        assert_eq!(config.table_poll_interval, Duration::from_secs(2));
        assert_eq!(config.scan_page_size, 100);
        assert_eq!(config.finished_retention, 64);
        assert_eq!(config.region, "local");
    }

    #[test]
    fn test_production_ceiling() {
        let config = EngineConfig::for_environment(Environment::Production);
        assert_eq!(config.max_concurrent_migrations, 1);
        let config = EngineConfig::for_environment(Environment::Staging);
        assert_eq!(config.max_concurrent_migrations, 5);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new("eu-west-1")
            .with_max_concurrent_migrations(2)
            .with_scan_page_size(0)
            .with_history_table("history");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.max_concurrent_migrations, 2);
        assert_eq!(config.scan_page_size, 1);
        assert_eq!(config.history_table, "history");
    }
}
