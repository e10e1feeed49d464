// ABOUTME: Expiry machinery: one-shot per-instance timers and the periodic safety-net sweep
// ABOUTME: Timers are guard-checked on fire, never cancelled; superseded timers are no-ops

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;

/// Arm a one-shot timer that fires at `expires_at` and performs the
/// guarded expiry. Re-arming on restart supersedes earlier timers through
/// the guard check alone: the stale timer wakes, observes a record that
/// is no longer running-and-overdue, and does nothing.
pub fn arm_expiry_timer(
    orchestrator: Arc<Orchestrator>,
    instance_id: String,
    expires_at: DateTime<Utc>,
) {
    tokio::spawn(async move {
        let remaining = (expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(
            "Expiry timer armed for {} ({}s remaining)",
            instance_id,
            remaining.as_secs()
        );
        // Pad for wall-clock vs monotonic drift so the guard's expiry
        // comparison already holds when the timer wakes.
        time::sleep(remaining + Duration::from_millis(250)).await;

        match orchestrator.expire_instance(&instance_id).await {
            Ok(true) => info!("Expiry timer reclaimed instance {}", instance_id),
            Ok(false) => debug!("Expiry timer for {} was superseded", instance_id),
            Err(e) => warn!("Expiry timer for {} failed: {}", instance_id, e),
        }
    });
}

/// Periodic sweep backing up the per-instance timers, for instances whose
/// timer was lost to a process restart or whose teardown failed.
pub struct ExpirySweeper {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ExpirySweeper {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the sweep task
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return; // Already running
        }
        *running = true;
        drop(running);

        let orchestrator = self.orchestrator.clone();
        let interval = self.interval;
        let running_flag = self.running.clone();

        tokio::spawn(async move {
            info!("Expiry sweeper started");

            loop {
                if !*running_flag.read().await {
                    info!("Expiry sweeper stopped");
                    break;
                }

                let reclaimed = orchestrator.cleanup_expired().await;
                if reclaimed > 0 {
                    debug!("Sweep pass reclaimed {} instance(s)", reclaimed);
                }

                time::sleep(interval).await;
            }
        });
    }

    /// Stop the sweep task
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}
