//! Periodic status sweep.
//!
//! Crash detection is passive: nothing watches forwarders or Caddy between
//! calls. The sweeper re-reads every record on an interval so persisted
//! statuses converge even when nobody is asking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::reconciler::{Reconciler, SweepReport};

/// Runs [`Reconciler::sweep`] on an interval until shutdown.
pub struct Sweeper {
    reconciler: Arc<Reconciler>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.interval.as_secs(),
            "Starting status sweep loop"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single sweep and log the outcome.
    pub async fn sweep_once(&self) -> SweepReport {
        let report = self.reconciler.sweep().await;
        for error in &report.errors {
            warn!(error = %error, "Sweep incomplete");
        }
        if report.corrected > 0 {
            info!(
                routes = report.routes_checked,
                relays = report.relays_checked,
                corrected = report.corrected,
                "Sweep corrected drifted statuses"
            );
        } else {
            debug!(
                routes = report.routes_checked,
                relays = report.relays_checked,
                "Sweep found no drift"
            );
        }
        report
    }
}
