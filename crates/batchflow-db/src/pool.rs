//! PostgreSQL pool settings for the batch store.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use batchflow_core::{Error, Result};

/// A run holds one connection per worker plus the progress writer.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Pool settings.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `DATABASE_MAX_CONNECTIONS` | `10` | Upper bound on open connections |
/// | `DATABASE_MIN_CONNECTIONS` | `1` | Connections kept open when idle |
/// | `DATABASE_ACQUIRE_TIMEOUT_SECS` | `30` | Wait for a free connection |
/// | `DATABASE_IDLE_TIMEOUT_SECS` | `600` | Close connections idle this long |
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Never above `max_connections`.
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from a variable lookup; unparsable values fall back to defaults.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());

        let max_connections = number("DATABASE_MAX_CONNECTIONS")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.max_connections);
        let min_connections = number("DATABASE_MIN_CONNECTIONS")
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.min_connections);

        Self {
            max_connections,
            min_connections,
            acquire_timeout: number("DATABASE_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: number("DATABASE_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
        }
        .normalized()
    }

    /// Room for `workers` concurrent item writes and the progress writer.
    pub fn with_workers(mut self, workers: usize) -> Self {
        let needed = u32::try_from(workers.saturating_add(1)).unwrap_or(u32::MAX);
        self.max_connections = self.max_connections.max(needed);
        self
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self.normalized()
    }

    fn normalized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }
}

/// Open a pool to `database_url`.
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "database",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Batch store pool ready"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_reads_every_setting() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DATABASE_MAX_CONNECTIONS", "20"),
            ("DATABASE_MIN_CONNECTIONS", "4"),
            ("DATABASE_ACQUIRE_TIMEOUT_SECS", "5"),
            ("DATABASE_IDLE_TIMEOUT_SECS", "60"),
        ]));

        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 4);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_ignores_garbage_and_clamps_min() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DATABASE_MAX_CONNECTIONS", "2"),
            ("DATABASE_MIN_CONNECTIONS", "8"),
            ("DATABASE_ACQUIRE_TIMEOUT_SECS", "soon"),
        ]));

        assert_eq!(config.max_connections, 2);
        assert_eq!(config.min_connections, 2);
        assert_eq!(
            config.acquire_timeout,
            Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS)
        );

        let zero = PoolConfig::from_lookup(lookup(&[("DATABASE_MAX_CONNECTIONS", "0")]));
        assert_eq!(zero.max_connections, 1);
    }

    #[test]
    fn test_with_workers_only_grows_the_pool() {
        let config = PoolConfig::default().with_max_connections(4).with_workers(8);
        assert_eq!(config.max_connections, 9);

        let config = PoolConfig::default().with_workers(2);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
