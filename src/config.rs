use std::env;
use std::time::Duration;

use crate::infrastructure::health::HealthPolicyConfig;
use crate::infrastructure::migration::MigrationOptions;
use crate::infrastructure::query::QueryOptions;

/// Library configuration assembled from `SHARDIS_*` environment variables,
/// falling back to the documented defaults.
#[derive(Debug, Clone)]
pub struct ShardisConfig {
    pub health: HealthPolicyConfig,
    pub query: QueryOptions,
    pub migration: MigrationOptions,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ShardisConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let health_defaults = HealthPolicyConfig::default();
        let health = HealthPolicyConfig {
            probe_interval: Duration::from_millis(env_u64(
                "SHARDIS_PROBE_INTERVAL_MS",
                health_defaults.probe_interval.as_millis() as u64,
            )),
            probe_timeout: Duration::from_millis(env_u64(
                "SHARDIS_PROBE_TIMEOUT_MS",
                health_defaults.probe_timeout.as_millis() as u64,
            )),
            unhealthy_threshold: env_u64(
                "SHARDIS_UNHEALTHY_THRESHOLD",
                health_defaults.unhealthy_threshold as u64,
            ) as u32,
            healthy_threshold: env_u64(
                "SHARDIS_HEALTHY_THRESHOLD",
                health_defaults.healthy_threshold as u64,
            ) as u32,
            cooldown_period: Duration::from_millis(env_u64(
                "SHARDIS_COOLDOWN_PERIOD_MS",
                health_defaults.cooldown_period.as_millis() as u64,
            )),
            reactive_tracking_enabled: env_bool(
                "SHARDIS_REACTIVE_TRACKING",
                health_defaults.reactive_tracking_enabled,
            ),
        };

        let query_defaults = QueryOptions::default();
        let query = QueryOptions {
            concurrency: env::var("SHARDIS_QUERY_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok()),
            channel_capacity: Some(env_usize(
                "SHARDIS_QUERY_CHANNEL_CAPACITY",
                query_defaults.channel_capacity.unwrap_or(256),
            )),
            dispose_session_per_query: env_bool(
                "SHARDIS_DISPOSE_SESSION_PER_QUERY",
                query_defaults.dispose_session_per_query,
            ),
            ..query_defaults
        };

        let migration_defaults = MigrationOptions::default();
        let migration = MigrationOptions {
            copy_concurrency: env_usize(
                "SHARDIS_COPY_CONCURRENCY",
                migration_defaults.copy_concurrency,
            ),
            verify_concurrency: env_usize(
                "SHARDIS_VERIFY_CONCURRENCY",
                migration_defaults.verify_concurrency,
            ),
            swap_batch_size: env_usize(
                "SHARDIS_SWAP_BATCH_SIZE",
                migration_defaults.swap_batch_size,
            ),
            max_retries: env_u64("SHARDIS_MAX_RETRIES", migration_defaults.max_retries as u64)
                as u32,
            retry_base_delay: Duration::from_millis(env_u64(
                "SHARDIS_RETRY_BASE_DELAY_MS",
                migration_defaults.retry_base_delay.as_millis() as u64,
            )),
            interleave_copy_and_verify: env_bool(
                "SHARDIS_INTERLEAVE_COPY_AND_VERIFY",
                migration_defaults.interleave_copy_and_verify,
            ),
            force_swap_on_verification_failure: env_bool(
                "SHARDIS_FORCE_SWAP_ON_VERIFICATION_FAILURE",
                migration_defaults.force_swap_on_verification_failure,
            ),
            ..migration_defaults
        };

        Ok(Self {
            health,
            query,
            migration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = ShardisConfig::from_env().unwrap();
        assert_eq!(config.health.unhealthy_threshold, 3);
        assert_eq!(config.health.healthy_threshold, 2);
        assert_eq!(config.migration.max_retries, 3);
        assert!(config.query.dispose_session_per_query);
    }
}
