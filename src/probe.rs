//! Periodic liveness probe timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// One firing of a [`ProbeLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTick {
    /// Identifies the loop that fired, so ticks from a cancelled loop that are
    /// still queued can be told apart.
    pub generation: u64,
    pub seq: u64,
}

/// An owned, cancellable periodic timer.
///
/// Fires immediately, then once per period, by sending a [`ProbeTick`] to the
/// owner. The timer stops when cancelled or dropped, or when the owner stops
/// listening.
#[derive(Debug)]
pub struct ProbeLoop {
    generation: u64,
    task: JoinHandle<()>,
}

impl ProbeLoop {
    pub fn start(
        generation: u64,
        period: Duration,
        ticks: mpsc::UnboundedSender<ProbeTick>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut seq = 0;
            loop {
                interval.tick().await;
                if ticks.send(ProbeTick { generation, seq }).is_err() {
                    break;
                }
                seq += 1;
            }
        });

        Self { generation, task }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ProbeLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}
