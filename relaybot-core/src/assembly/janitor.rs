//! Janitor: periodic sweep that retires bursts stuck past twice the ceiling.
//!
//! This is a safety net for checks that never fired, not the normal
//! completion path. Retired bursts are discarded, not dispatched.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::registry::AssemblyRegistry;

pub struct JanitorTask {
    registry: Arc<AssemblyRegistry>,
    interval: Duration,
    max_age: Duration,
}

impl JanitorTask {
    pub fn new(registry: Arc<AssemblyRegistry>, interval: Duration, max_age: Duration) -> Self {
        Self {
            registry,
            interval,
            max_age,
        }
    }

    /// Run one sweep now. Returns the number of bursts retired.
    pub fn sweep_once(&self) -> usize {
        let retired = self.registry.sweep_expired(Instant::now(), self.max_age);
        for user in &retired {
            tracing::warn!(user = %user, "retired stuck burst");
        }
        if !retired.is_empty() {
            tracing::info!(count = retired.len(), "janitor sweep retired bursts");
        }
        retired.len()
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn(self, runtime: &Handle, cancel: CancellationToken) -> JoinHandle<()> {
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("janitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once();
                    }
                }
            }
        })
    }
}
