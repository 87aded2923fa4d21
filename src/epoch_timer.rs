use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::trace;
use crate::ids::Epoch;

/// A periodic tick source shared by all connections of an engine. It publishes the number of
///  the current epoch; subscribers await changes, so a slow subscriber sees skipped epoch
///  numbers rather than a backlog of ticks.
///
/// Dropping the timer stops it, which terminates all subscribers' `changed()` with an error.
pub struct EpochTimer {
    epochs: watch::Receiver<Epoch>,
    handle: JoinHandle<()>,
}

impl EpochTimer {
    pub fn start(epoch_duration: Duration) -> EpochTimer {
        let (sender, epochs) = watch::channel(Epoch::ZERO);

        let handle = tokio::spawn(async move {
            let mut ticks = time::interval_at(Instant::now() + epoch_duration, epoch_duration);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut epoch = Epoch::ZERO;
            loop {
                ticks.tick().await;
                epoch = epoch.next();
                trace!("epoch {}", epoch);
                sender.send_replace(epoch);
            }
        });

        EpochTimer { epochs, handle }
    }

    /// The returned receiver treats the current epoch as seen, so its first `changed()`
    ///  completes with the next tick.
    pub fn subscribe(&self) -> watch::Receiver<Epoch> {
        let mut epochs = self.epochs.clone();
        epochs.borrow_and_update();
        epochs
    }

    pub fn current(&self) -> Epoch {
        *self.epochs.borrow()
    }

    /// Stops ticking. Subscribers see no further epochs, and their `changed()` fails once the
    ///  timer task has terminated.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for EpochTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
