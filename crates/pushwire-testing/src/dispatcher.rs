//! Dispatcher double for feeder tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use pushwire_core::{Notification, NotificationId};
use pushwire_delivery::{gateway::BoxFuture, Dispatcher};

/// Dispatcher reporting a fixed queue size and recording every handoff.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    queued: AtomicUsize,
    batches: Mutex<Vec<Vec<NotificationId>>>,
}

impl RecordingDispatcher {
    /// Creates a dispatcher reporting `queued` notifications in its queues.
    pub fn with_queue_size(queued: usize) -> Self {
        Self { queued: AtomicUsize::new(queued), ..Self::default() }
    }

    /// Changes the reported queue size.
    pub fn set_queue_size(&self, queued: usize) {
        self.queued.store(queued, Ordering::SeqCst);
    }

    /// Every batch handed over so far.
    pub fn batches(&self) -> Vec<Vec<NotificationId>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn enqueue(&self, notifications: Vec<Notification>) -> BoxFuture<'_, ()> {
        let ids = notifications.iter().map(|n| n.id).collect();
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).push(ids);
        Box::pin(async {})
    }

    fn cumulative_queue_size(&self) -> BoxFuture<'_, usize> {
        let queued = self.queued.load(Ordering::SeqCst);
        Box::pin(async move { queued })
    }
}
