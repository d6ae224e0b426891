//! Cancellable timer for the feeder's poll interval.

use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How a [`InterruptibleSleep::sleep`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The full duration elapsed.
    TimedOut,
    /// [`InterruptibleSleep::wakeup`] cut the sleep short.
    Woken,
    /// [`InterruptibleSleep::stop`] was called; no further sleeps will block.
    Stopped,
}

/// A sleep that other tasks can interrupt or end for good.
///
/// A wakeup issued while nobody is sleeping is remembered and ends the next
/// sleep immediately, so a wakeup racing the end of a cycle is never lost.
#[derive(Debug, Default)]
pub struct InterruptibleSleep {
    notify: Notify,
    stopped: CancellationToken,
}

impl InterruptibleSleep {
    /// Creates a sleep that has not been stopped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `duration` unless woken or stopped first.
    pub async fn sleep(&self, duration: Duration) -> Wake {
        if self.stopped.is_cancelled() {
            return Wake::Stopped;
        }

        tokio::select! {
            biased;
            () = self.stopped.cancelled() => Wake::Stopped,
            () = self.notify.notified() => Wake::Woken,
            () = tokio::time::sleep(duration) => Wake::TimedOut,
        }
    }

    /// Ends the current sleep early.
    pub fn wakeup(&self) {
        self.notify.notify_one();
    }

    /// Ends the current sleep and makes every later sleep return at once.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}
