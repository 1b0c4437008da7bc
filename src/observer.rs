// src/observer.rs

//! Observer registration for the download queue.
//!
//! The queue never owns its observer. It keeps a weak pointer plus an
//! explicit interest flag, and checks both before every callback: dropping
//! the [`Subscription`] (or the observer itself) turns delivery into a no-op.

use crate::models::DownloadInfo;
use crate::transfer::TransferError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Lifecycle callbacks pushed by the queue. Every method has an empty
/// default so observers implement only what they need.
pub trait QueueObserver: Send + Sync {
    fn on_download_started(&self, _download: &DownloadInfo) {}

    fn on_download_removed(&self, _download: &DownloadInfo) {}

    /// `total_expected` is `None` while any member's size is unknown.
    fn on_combined_progress(&self, _bytes_downloaded: u64, _total_expected: Option<u64>) {}

    fn on_download_finished(&self, _download: &DownloadInfo, _destination: &Path) {}

    /// Terminal failure, including user cancellation
    /// (see [`TransferError::is_cancellation`]).
    fn on_download_failed(&self, _session_id: u64, _error: &TransferError) {}

    fn on_queue_empty_changed(&self, _is_empty: bool) {}
}

/// The queue's side of a registration.
pub(crate) struct ObserverHandle {
    observer: Weak<dyn QueueObserver>,
    interested: Arc<AtomicBool>,
}

impl ObserverHandle {
    /// Runs `deliver` only while the registration is live and the observer
    /// still exists.
    pub(crate) fn notify(&self, deliver: impl FnOnce(&dyn QueueObserver)) {
        if !self.interested.load(Ordering::Acquire) {
            return;
        }
        if let Some(observer) = self.observer.upgrade() {
            deliver(observer.as_ref());
        }
    }
}

/// Caller's side of a registration. Dropping it stops delivery.
#[must_use = "dropping the subscription unregisters the observer"]
pub struct Subscription {
    interested: Arc<AtomicBool>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.interested.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.interested.store(false, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub(crate) fn register<O>(observer: &Arc<O>) -> (ObserverHandle, Subscription)
where
    O: QueueObserver + 'static,
{
    let observer: Arc<dyn QueueObserver> = observer.clone();
    let interested = Arc::new(AtomicBool::new(true));
    let handle = ObserverHandle {
        observer: Arc::downgrade(&observer),
        interested: interested.clone(),
    };
    (handle, Subscription { interested })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    impl QueueObserver for Counter {
        fn on_queue_empty_changed(&self, _is_empty: bool) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dropped_subscription_stops_delivery() {
        let counter = Arc::new(Counter::default());
        let (handle, subscription) = register(&counter);

        handle.notify(|o| o.on_queue_empty_changed(true));
        drop(subscription);
        handle.notify(|o| o.on_queue_empty_changed(false));

        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_observer_is_a_no_op() {
        let counter = Arc::new(Counter::default());
        let (handle, _subscription) = register(&counter);
        drop(counter);
        handle.notify(|o| o.on_queue_empty_changed(true));
    }

    #[test]
    fn registration_does_not_keep_observer_alive() {
        let counter = Arc::new(Counter::default());
        let (_handle, _subscription) = register(&counter);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
