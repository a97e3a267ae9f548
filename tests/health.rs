use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use shardis::infrastructure::health::{
    HealthPolicy, HealthPolicyConfig, HealthProbe, ShardAvailabilityRequirement,
    ShardHealthStatus,
};
use shardis::{Shard, ShardId};

/// Probe failing the first `failures` attempts per shard, succeeding after
struct FlakyProbe {
    failures: u64,
    attempts: AtomicU64,
}

#[async_trait]
impl HealthProbe for FlakyProbe {
    async fn probe(&self, _shard: &Shard) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            anyhow::bail!("probe failed (attempt {})", attempt);
        }
        Ok(())
    }
}

/// Probe that never returns within any reasonable timeout
struct HangingProbe;

#[async_trait]
impl HealthProbe for HangingProbe {
    async fn probe(&self, _shard: &Shard) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

fn one_shard() -> Vec<Shard> {
    vec![Shard::new("s1", "mem://s1")]
}

#[tokio::test]
async fn shard_trips_unhealthy_then_recovers_through_scheduler() {
    let config = HealthPolicyConfig {
        probe_interval: Duration::from_millis(10),
        probe_timeout: Duration::from_millis(100),
        unhealthy_threshold: 3,
        healthy_threshold: 2,
        cooldown_period: Duration::from_millis(0),
        reactive_tracking_enabled: false,
    };
    let probe = Arc::new(FlakyProbe {
        failures: 3,
        attempts: AtomicU64::new(0),
    });
    let policy = HealthPolicy::new(one_shard(), probe, config);
    policy.start().await;

    // Wait until the three failures have tripped the shard
    let id = ShardId::new("s1");
    let mut tripped = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !policy.is_healthy(&id).await {
            tripped = true;
            break;
        }
    }
    assert!(tripped, "shard never tripped unhealthy");

    // Successive successes bring it back
    let mut recovered = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if policy.is_healthy(&id).await {
            recovered = true;
            break;
        }
    }
    assert!(recovered, "shard never recovered");

    let report = policy.report(&id).await.unwrap();
    assert_eq!(report.status, ShardHealthStatus::Healthy);
    policy.shutdown().await;
}

#[tokio::test]
async fn probe_timeout_counts_as_failure() {
    let config = HealthPolicyConfig {
        probe_interval: Duration::from_millis(10),
        probe_timeout: Duration::from_millis(5),
        unhealthy_threshold: 2,
        healthy_threshold: 2,
        cooldown_period: Duration::from_millis(0),
        reactive_tracking_enabled: false,
    };
    let policy = HealthPolicy::new(one_shard(), Arc::new(HangingProbe), config);
    policy.start().await;

    let id = ShardId::new("s1");
    let mut tripped = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !policy.is_healthy(&id).await {
            tripped = true;
            break;
        }
    }
    policy.shutdown().await;
    assert!(tripped, "timeouts never tripped the shard");

    let report = policy.report(&id).await.unwrap();
    assert!(report.last_error.is_some());
}

#[tokio::test]
async fn dynamic_shard_registration() {
    let config = HealthPolicyConfig {
        probe_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let probe = Arc::new(FlakyProbe {
        failures: 0,
        attempts: AtomicU64::new(0),
    });
    let policy = HealthPolicy::new(Vec::new(), probe, config);
    policy.start().await;

    policy.add_shard(Shard::new("late", "mem://late")).await;
    let id = ShardId::new("late");
    let mut probed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(report) = policy.report(&id).await {
            if report.status == ShardHealthStatus::Healthy {
                probed = true;
                break;
            }
        }
    }
    assert!(probed, "late shard never probed healthy");

    policy.remove_shard(&id).await;
    assert!(policy.report(&id).await.is_none());
    policy.shutdown().await;
}

#[tokio::test]
async fn snapshot_lists_all_shards_sorted() {
    let shards = vec![
        Shard::new("s2", "mem://s2"),
        Shard::new("s1", "mem://s1"),
        Shard::new("s3", "mem://s3"),
    ];
    let probe = Arc::new(FlakyProbe {
        failures: 0,
        attempts: AtomicU64::new(0),
    });
    let policy = HealthPolicy::new(shards, probe, HealthPolicyConfig::default());
    policy
        .set_status(&ShardId::new("s2"), ShardHealthStatus::Unhealthy)
        .await;

    let snapshot = policy.snapshot().await;
    let ids: Vec<&str> = snapshot.iter().map(|r| r.shard_id.value()).collect();
    assert_eq!(ids, vec!["s1", "s2", "s3"]);
    assert_eq!(snapshot[1].status, ShardHealthStatus::Unhealthy);
    assert_eq!(snapshot[0].status, ShardHealthStatus::Unknown);
}

#[tokio::test]
async fn requirement_predicates_cover_bounds() {
    use ShardAvailabilityRequirement::*;
    assert!(BestEffort.is_satisfied(5, 0));
    assert!(AllShards.is_satisfied(0, 0));
    assert!(!AllShards.is_satisfied(4, 3));
    assert!(AtLeast(0).is_satisfied(3, 0));
    assert!(!AtLeast(4).is_satisfied(3, 3));
    // Exactly at the percentage boundary is satisfied
    assert!(ShardAvailabilityRequirement::at_least_percentage(1.0).is_satisfied(3, 3));
    assert!(!ShardAvailabilityRequirement::at_least_percentage(1.0).is_satisfied(3, 2));
    assert!(ShardAvailabilityRequirement::at_least_percentage(0.5).is_satisfied(2, 1));
}

#[tokio::test]
async fn reactive_hooks_update_state_when_enabled() {
    let config = HealthPolicyConfig {
        reactive_tracking_enabled: true,
        unhealthy_threshold: 2,
        healthy_threshold: 1,
        cooldown_period: Duration::from_millis(0),
        ..Default::default()
    };
    let probe = Arc::new(FlakyProbe {
        failures: 0,
        attempts: AtomicU64::new(0),
    });
    let policy = HealthPolicy::new(one_shard(), probe, config);
    let id = ShardId::new("s1");

    policy.record_failure(&id, "io reset").await;
    assert!(policy.is_healthy(&id).await);
    policy.record_failure(&id, "io reset").await;
    assert!(!policy.is_healthy(&id).await);

    policy.record_success(&id).await;
    assert!(policy.is_healthy(&id).await);
}
