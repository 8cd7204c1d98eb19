//! Live fan-out of new readings to dashboard subscribers
//!
//! Explicit observer registry: each subscriber is a pair of callbacks plus a
//! cancellation flag shared with its `Subscription` handle. Delivery is
//! synchronous and in subscription order. There is no replay; catch-up data is
//! supplied by the scheduler at subscribe time.
//!
//! `publish` moves the subscriber list out of the registry before invoking any
//! callback, so callbacks (and other threads) may subscribe or cancel while a
//! publish is running. A cancelled subscriber is skipped by the in-flight publish
//! and pruned when the list is put back.

use crate::domain::Reading;
use crate::services::error::{PollError, SubscriptionId};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

type NextFn = Box<dyn FnMut(&Reading) -> anyhow::Result<()> + Send>;
type ErrorFn = Box<dyn FnMut(&PollError) + Send>;

struct Subscriber {
    id: SubscriptionId,
    on_next: NextFn,
    on_error: ErrorFn,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    subscribers: Vec<Subscriber>,
    next_id: SubscriptionId,
}

#[derive(Default)]
struct Shared {
    registry: Mutex<Registry>,
    /// Live (not cancelled) subscriptions, including ones checked out by a publish
    active: AtomicUsize,
}

impl Shared {
    /// Flip a subscription to cancelled. Returns false if it already was.
    fn retire(&self, flag: &AtomicBool) -> bool {
        if flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.active.fetch_sub(1, Ordering::AcqRel);
        true
    }
}

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Handle for one live registration
///
/// Cloning shares the same registration. `cancel` is idempotent.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    cancelled: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl Subscription {
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Remove this subscriber. Takes effect no later than the next publish.
    pub fn cancel(&self) {
        let Some(shared) = self.shared.upgrade() else {
            self.cancelled.store(true, Ordering::Release);
            return;
        };
        if !shared.retire(&self.cancelled) {
            return;
        }
        shared.registry.lock().subscribers.retain(|s| s.id != self.id);
        debug!(subscription = self.id, remaining = shared.active.load(Ordering::Acquire), "subscription_cancelled");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Default)]
pub struct LiveBroadcaster {
    shared: Arc<Shared>,
    /// Serializes publishers; only the scheduler publishes in practice
    publishing: Mutex<()>,
}

impl LiveBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer
    ///
    /// `on_next` receives every reading published from now on. If it returns an
    /// error or panics, `on_error` is called once and the subscriber is dropped.
    /// Callbacks run on the publishing task and must not block.
    pub fn subscribe<N, E>(&self, on_next: N, on_error: E) -> Subscription
    where
        N: FnMut(&Reading) -> anyhow::Result<()> + Send + 'static,
        E: FnMut(&PollError) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut registry = self.shared.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push(Subscriber {
            id,
            on_next: Box::new(on_next),
            on_error: Box::new(on_error),
            cancelled: cancelled.clone(),
        });
        let active = self.shared.active.fetch_add(1, Ordering::AcqRel) + 1;
        drop(registry);

        debug!(subscription = id, active, "subscription_added");
        Subscription { id, cancelled, shared: Arc::downgrade(&self.shared) }
    }

    /// Deliver `reading` to every live subscriber in subscription order
    pub fn publish(&self, reading: &Reading) -> PublishReport {
        let _turn = self.publishing.lock();
        let mut batch = std::mem::take(&mut self.shared.registry.lock().subscribers);
        let mut report = PublishReport::default();

        for sub in batch.iter_mut() {
            if sub.cancelled.load(Ordering::Acquire) {
                continue;
            }

            let reason = match catch_unwind(AssertUnwindSafe(|| (sub.on_next)(reading))) {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(&*panic),
            };

            report.failed += 1;
            self.shared.retire(&sub.cancelled);
            let err = PollError::SubscriberFailed { id: sub.id, reason };
            warn!(subscription = sub.id, error = %err, "subscriber_failed");
            if catch_unwind(AssertUnwindSafe(|| (sub.on_error)(&err))).is_err() {
                warn!(subscription = sub.id, "subscriber_error_callback_panicked");
            }
        }

        batch.retain(|s| !s.cancelled.load(Ordering::Acquire));
        let mut registry = self.shared.registry.lock();
        // Anything registered while callbacks ran goes after the existing subscribers
        batch.append(&mut registry.subscribers);
        batch.retain(|s| !s.cancelled.load(Ordering::Acquire));
        registry.subscribers = batch;

        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Drop every subscription; handles report cancelled afterwards
    pub fn close(&self) -> usize {
        let _turn = self.publishing.lock();
        let subscribers = std::mem::take(&mut self.shared.registry.lock().subscribers);
        let closed = subscribers.iter().filter(|s| self.shared.retire(&s.cancelled)).count();
        debug!(closed, "broadcaster_closed");
        closed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "subscriber panicked".to_string()
    }
}
