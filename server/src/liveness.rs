//! Liveness supervisor.
//!
//! Periodically scans the registry and evicts connections whose last
//! liveness proof is older than the stale threshold. Staleness is computed
//! on demand from `last_liveness_at`; nothing stores a "stale" flag.
//! Eviction closes the transport and unregisters, without telling peers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::registry::Registry;
use crate::types::ConnectionId;

#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    /// How often the sweep runs.
    pub period: Duration,
    /// Maximum silence before eviction.
    pub stale_threshold: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10 * 60),
            stale_threshold: Duration::from_secs(10 * 60),
        }
    }
}

/// Spawn the periodic sweep. It stops when `shutdown` is cancelled.
pub fn spawn_liveness_supervisor(
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    policy: LivenessPolicy,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(policy.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nothing can be stale yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("liveness supervisor stopped");
                    return;
                }
                _ = interval.tick() => {
                    sweep(&registry, clock.now_ms(), policy.stale_threshold);
                }
            }
        }
    })
}

/// One pass over the registry at time `now`. Returns the evicted ids.
///
/// A connection is evicted when `now - last_liveness_at > stale_threshold`.
pub fn sweep(registry: &Registry, now: i64, stale_threshold: Duration) -> Vec<ConnectionId> {
    let threshold_ms = i64::try_from(stale_threshold.as_millis()).unwrap_or(i64::MAX);
    let cutoff = now.saturating_sub(threshold_ms);

    let mut evicted = Vec::new();
    for conn in registry.snapshot() {
        if conn.last_liveness_at >= cutoff {
            continue;
        }
        // Re-checked under the registry lock: a proof that arrived since the
        // snapshot wins.
        let Some(conn) = registry.remove_if_stale(conn.id, cutoff) else {
            continue;
        };
        warn!(
            connection_id = %conn.id,
            silent_ms = now - conn.last_liveness_at,
            "stale connection evicted"
        );
        conn.close();
        evicted.push(conn.id);
    }

    if !evicted.is_empty() {
        info!(
            count = evicted.len(),
            remaining = registry.count(),
            "liveness sweep evicted connections"
        );
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, MemoryCatalog};
    use crate::clock::ManualClock;
    use crate::gateway::Gateway;
    use crate::types::{ClientMessage, ProbeMsg};
    use uuid::Uuid;

    const THRESHOLD: Duration = Duration::from_secs(600);
    const THRESHOLD_MS: i64 = 600_000;

    #[test]
    fn test_eviction_boundary() {
        let registry = Registry::new();
        let t0 = 50_000;
        let id = Uuid::new_v4();
        let handle = registry.register(id, t0).unwrap();

        // Just inside the window, and exactly at it: kept.
        assert!(sweep(&registry, t0 + THRESHOLD_MS - 1, THRESHOLD).is_empty());
        assert!(sweep(&registry, t0 + THRESHOLD_MS, THRESHOLD).is_empty());
        assert!(!handle.closed.is_cancelled());

        // Just past it: evicted and closed.
        assert_eq!(sweep(&registry, t0 + THRESHOLD_MS + 1, THRESHOLD), vec![id]);
        assert!(handle.closed.is_cancelled());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_sweep_evicts_only_stale() {
        let registry = Registry::new();
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let stale_handle = registry.register(stale, 0).unwrap();
        let fresh_handle = registry.register(fresh, 0).unwrap();
        registry.touch(fresh, 500_000);

        let evicted = sweep(&registry, THRESHOLD_MS + 1, THRESHOLD);
        assert_eq!(evicted, vec![stale]);
        assert!(stale_handle.closed.is_cancelled());
        assert!(!fresh_handle.closed.is_cancelled());
        assert!(registry.get(fresh).is_some());
    }

    #[test]
    fn test_sweep_continues_past_dead_transports() {
        let registry = Registry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        // Transport already gone for `a`.
        drop(registry.register(a, 0).unwrap());
        let b_handle = registry.register(b, 1).unwrap();

        let evicted = sweep(&registry, THRESHOLD_MS + 10, THRESHOLD);
        assert_eq!(evicted, vec![a, b]);
        assert!(b_handle.closed.is_cancelled());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_silent_client_is_evicted_through_gateway() {
        let clock = Arc::new(ManualClock::new(0));
        let gateway = Gateway::new(
            Arc::new(MemoryCatalog::new()) as Arc<dyn Catalog>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let c1 = gateway.connect().await.unwrap();

        clock.set(THRESHOLD_MS + 1);
        let evicted = sweep(gateway.registry(), clock.now_ms(), THRESHOLD);

        assert_eq!(evicted, vec![c1.id]);
        assert!(c1.closed.is_cancelled());
        assert!(gateway.registry().get(c1.id).is_none());

        // A late proof cannot resurrect it.
        let ack = gateway
            .handle(c1.id, None, ClientMessage::LivenessProbe(ProbeMsg { timestamp: 1 }))
            .await;
        assert!(ack.success);
        assert!(gateway.registry().get(c1.id).is_none());
    }

    #[tokio::test]
    async fn test_probe_keeps_connection_fresh() {
        let clock = Arc::new(ManualClock::new(0));
        let gateway = Gateway::new(
            Arc::new(MemoryCatalog::new()) as Arc<dyn Catalog>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let c1 = gateway.connect().await.unwrap();

        clock.set(THRESHOLD_MS - 1);
        gateway
            .handle(c1.id, None, ClientMessage::LivenessProbe(ProbeMsg { timestamp: 7 }))
            .await;
        clock.set(THRESHOLD_MS + 1);

        assert!(sweep(gateway.registry(), clock.now_ms(), THRESHOLD).is_empty());
        assert!(!c1.closed.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_runs_periodically_and_stops() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = Arc::new(Registry::new());
        let handle = registry.register(Uuid::new_v4(), 0).unwrap();
        let shutdown = CancellationToken::new();
        let policy = LivenessPolicy {
            period: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(30),
        };

        let task = spawn_liveness_supervisor(
            Arc::clone(&registry),
            Arc::clone(&clock) as Arc<dyn Clock>,
            policy,
            shutdown.clone(),
        );

        clock.set(31_000);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.closed.is_cancelled());
        assert_eq!(registry.count(), 0);

        shutdown.cancel();
        task.await.unwrap();
    }
}
