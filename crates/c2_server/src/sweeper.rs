//! Periodic liveness sweep. `Registry::list()` remains the
//! authoritative, lazily-computed source of truth for `IsActive`; this
//! task exists only to log transitions and drive the `agents_active`
//! gauge without waiting for an operator to poll.

use crate::metrics::Metrics;
use crate::registry::Registry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(registry: Arc<Registry>, metrics: Arc<Metrics>, mut shutdown: tokio::sync::watch::Receiver<()>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    let was_active: DashMap<String, bool> = DashMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let agents = registry.list();
                for info in &agents {
                    let active = registry
                        .get(&info.agent_id)
                        .map(|a| a.is_active())
                        .unwrap_or(false);
                    let prev = was_active.insert(info.agent_id.clone(), active);
                    if prev != Some(active) {
                        if active {
                            tracing::info!(agent_id = %info.agent_id, "agent became active");
                        } else {
                            tracing::info!(agent_id = %info.agent_id, "agent became inactive");
                        }
                    }
                }
                metrics.update_active_agents(registry.active_count() as i64);
            }
            _ = shutdown.changed() => {
                tracing::info!("liveness sweeper shutting down");
                break;
            }
        }
    }
}
