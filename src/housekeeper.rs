//! C5: periodic sweep over broker state (spec.md §4.5).
//!
//! Grounded on `publisher.rs`'s `Tasks::run_task` interval-tick loop: a
//! single `tokio::time::interval` driving a batch of maintenance work each
//! tick, running until cancelled. Unlike the per-lease expiry timers in
//! `broker.rs` (which give an individual lease low-latency, exact-deadline
//! redelivery), the Housekeeper is a coarse safety net — the named tasks are
//! explicitly listed in spec.md §4.5: orphan lease sweep, retention
//! enforcement, ack-id GC, and capacity warnings. A panic or error in one
//! tick's work must never stop future ticks.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct HousekeeperConfig {
    pub interval: Duration,
    pub ack_id_gc_age: Duration,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            ack_id_gc_age: Broker::default_ack_id_gc_age(),
        }
    }
}

/// Owns the background sweep task. `spawn` starts it; `stop` cancels it and
/// waits for the current tick to finish.
pub struct Housekeeper {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn spawn(broker: Broker, config: HousekeeperConfig) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        Self::run_once(&broker, &config);
                    }
                }
            }
            tracing::trace!("housekeeper stopped");
        });
        Self {
            cancel,
            task: Some(task),
        }
    }

    fn run_once(broker: &Broker, config: &HousekeeperConfig) {
        broker.sweep_orphan_leases();
        broker.enforce_retention_all();
        broker.gc_ack_ids(config.ack_id_gc_age);
        broker.warn_on_capacity();
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
