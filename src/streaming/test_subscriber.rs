use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::error::StreamError;
use super::flux::Flux;
use super::signal::Signal;
use super::subscription::{lock, Subscriber, Subscription, UNBOUNDED};

struct Record<T> {
    signals: Mutex<Vec<Signal<T>>>,
    subscription: Mutex<Option<Subscription>>,
    violations: Mutex<Vec<String>>,
    requested: AtomicU64,
    delivered: AtomicU64,
    subscribed: AtomicBool,
    terminated: AtomicBool,
}

impl<T> Record<T> {
    fn violation(&self, message: impl Into<String>) {
        lock(&self.violations).push(message.into());
    }

    fn add_request(&self, n: u64) {
        let _ = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            });
    }
}

/// Recording subscriber for tests.
///
/// Records every signal and checks the subscriber side of the protocol:
/// a single `on_subscribe`, no signal after a terminal one, and never more
/// items than requested.
pub struct TestSubscriber<T> {
    record: Arc<Record<T>>,
    initial_request: u64,
}

/// Inspection and control handle paired with a [`TestSubscriber`].
pub struct TestProbe<T> {
    record: Arc<Record<T>>,
}

impl<T> Clone for TestProbe<T> {
    fn clone(&self) -> Self {
        TestProbe {
            record: self.record.clone(),
        }
    }
}

impl<T: Send + 'static> TestSubscriber<T> {
    pub fn new(initial_request: u64) -> (Self, TestProbe<T>) {
        let record = Arc::new(Record {
            signals: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            violations: Mutex::new(Vec::new()),
            requested: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            subscribed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        let probe = TestProbe {
            record: record.clone(),
        };
        (
            TestSubscriber {
                record,
                initial_request,
            },
            probe,
        )
    }

    /// Subscribes a new recorder to `flux`, requesting `initial_request`
    /// items from `on_subscribe` (nothing if zero).
    pub fn subscribe(flux: &Flux<T>, initial_request: u64) -> TestProbe<T> {
        let (subscriber, probe) = Self::new(initial_request);
        flux.subscribe(subscriber);
        probe
    }
}

impl<T: Send> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        if self.record.subscribed.swap(true, Ordering::AcqRel) {
            self.record.violation("on_subscribe called more than once");
            subscription.cancel();
            return;
        }
        *lock(&self.record.subscription) = Some(subscription.clone());
        if self.initial_request > 0 {
            self.record.add_request(self.initial_request);
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, item: T) {
        if self.record.terminated.load(Ordering::Acquire) {
            self.record.violation("on_next after a terminal signal");
        }
        let delivered = self.record.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        let requested = self.record.requested.load(Ordering::Acquire);
        if requested != UNBOUNDED && delivered > requested {
            self.record.violation(format!(
                "delivered {} items with only {} requested",
                delivered, requested
            ));
        }
        lock(&self.record.signals).push(Signal::Next(item));
    }

    fn on_error(&mut self, error: StreamError) {
        if self.record.terminated.swap(true, Ordering::AcqRel) {
            self.record.violation("on_error after a terminal signal");
        }
        lock(&self.record.signals).push(Signal::Error(error));
    }

    fn on_complete(&mut self) {
        if self.record.terminated.swap(true, Ordering::AcqRel) {
            self.record.violation("on_complete after a terminal signal");
        }
        lock(&self.record.signals).push(Signal::Complete);
    }
}

impl<T> TestProbe<T> {
    pub fn request(&self, n: u64) {
        let subscription = lock(&self.record.subscription).clone();
        if let Some(subscription) = subscription {
            if n > 0 {
                self.record.add_request(n);
            }
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        let subscription = lock(&self.record.subscription).clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.record.subscribed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.record.signals)
            .iter()
            .any(|signal| matches!(signal, Signal::Complete))
    }

    pub fn is_terminated(&self) -> bool {
        self.record.terminated.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<StreamError> {
        lock(&self.record.signals)
            .iter()
            .find_map(|signal| signal.as_error().cloned())
    }

    pub fn item_count(&self) -> usize {
        lock(&self.record.signals)
            .iter()
            .filter(|signal| matches!(signal, Signal::Next(_)))
            .count()
    }

    /// Total demand issued so far, saturating at `u64::MAX`.
    pub fn requested(&self) -> u64 {
        self.record.requested.load(Ordering::Acquire)
    }

    /// Protocol violations observed so far.
    pub fn violations(&self) -> Vec<String> {
        lock(&self.record.violations).clone()
    }

    /// Removes and returns the recorded items, leaving terminal signals in place.
    pub fn take_items(&self) -> Vec<T> {
        let mut signals = lock(&self.record.signals);
        let mut items = Vec::new();
        let mut kept = Vec::new();
        for signal in signals.drain(..) {
            match signal {
                Signal::Next(item) => items.push(item),
                other => kept.push(other),
            }
        }
        *signals = kept;
        items
    }
}

impl<T: Clone> TestProbe<T> {
    pub fn signals(&self) -> Vec<Signal<T>> {
        lock(&self.record.signals).clone()
    }

    pub fn items(&self) -> Vec<T> {
        lock(&self.record.signals)
            .iter()
            .filter_map(|signal| signal.as_next().cloned())
            .collect()
    }
}
