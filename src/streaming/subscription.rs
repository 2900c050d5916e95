use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::warn;

use super::error::StreamError;
use super::signal::Signal;

/// Demand of `u64::MAX` is unbounded and never decremented.
pub const UNBOUNDED: u64 = u64::MAX;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outstanding demand and cancellation flag of one subscription.
///
/// `request` increments and emission decrements the same atomic counter, so
/// the subscription context and the emission context never lose an update.
/// The counter never goes below zero and is frozen once cancelled.
#[derive(Debug, Default)]
pub struct Demand {
    requested: AtomicU64,
    cancelled: AtomicBool,
}

impl Demand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to the outstanding demand, saturating at [`UNBOUNDED`].
    /// Returns the previous value.
    pub fn add(&self, n: u64) -> u64 {
        if self.is_cancelled() {
            return self.available();
        }
        self.requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            })
            .unwrap_or_else(|current| current)
    }

    pub fn available(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    pub fn is_unbounded(&self) -> bool {
        self.available() == UNBOUNDED
    }

    /// Takes one unit of demand, returning false when none is outstanding.
    pub fn try_consume(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match current {
                0 => None,
                UNBOUNDED => Some(UNBOUNDED),
                n => Some(n - 1),
            })
            .is_ok()
    }

    /// Marks the demand cancelled. Returns true only for the first call.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// The producer side of a subscription: what happens on `request` and `cancel`.
pub trait Upstream: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

struct NoUpstream;

impl Upstream for NoUpstream {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

/// Handle a subscriber uses to control production rate.
#[derive(Clone)]
pub struct Subscription {
    upstream: Arc<dyn Upstream>,
}

impl Subscription {
    pub fn new<U: Upstream + 'static>(upstream: Arc<U>) -> Self {
        Subscription { upstream }
    }

    /// A subscription that ignores requests, for streams that are already terminated.
    pub fn empty() -> Self {
        Subscription {
            upstream: Arc::new(NoUpstream),
        }
    }

    /// Adds `n` to the outstanding demand. `request(0)` is ignored.
    pub fn request(&self, n: u64) {
        if n == 0 {
            warn!(operator = "subscription"; "Ignoring request(0)");
            return;
        }
        self.upstream.request(n);
    }

    /// Stops further delivery. Idempotent.
    pub fn cancel(&self) {
        self.upstream.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Consumer side of the stream contract.
///
/// `on_subscribe` is called exactly once, before any other method. After
/// `on_error` or `on_complete` no further method is called.
pub trait Subscriber<T>: Send {
    fn on_subscribe(&mut self, subscription: Subscription);
    fn on_next(&mut self, item: T);
    fn on_error(&mut self, error: StreamError);
    fn on_complete(&mut self);

    fn on_signal(&mut self, signal: Signal<T>) {
        match signal {
            Signal::Next(item) => self.on_next(item),
            Signal::Error(error) => self.on_error(error),
            Signal::Complete => self.on_complete(),
        }
    }
}

pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

impl<T> Subscriber<T> for BoxSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        (**self).on_subscribe(subscription)
    }

    fn on_next(&mut self, item: T) {
        (**self).on_next(item)
    }

    fn on_error(&mut self, error: StreamError) {
        (**self).on_error(error)
    }

    fn on_complete(&mut self) {
        (**self).on_complete()
    }
}

/// Holds the current upstream subscription of an operator that may switch
/// upstreams (inner streams, retries, fallbacks) or receive its upstream
/// after downstream has already requested.
///
/// Tracks requested minus produced so a newly set upstream is asked for
/// exactly the demand that is still outstanding.
#[derive(Default)]
pub(crate) struct Arbiter {
    current: Mutex<Option<Subscription>>,
    outstanding: Demand,
}

impl Arbiter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, subscription: Subscription) {
        let pending = {
            let mut current = lock(&self.current);
            if self.outstanding.is_cancelled() {
                None
            } else {
                *current = Some(subscription.clone());
                Some(self.outstanding.available())
            }
        };
        match pending {
            None => subscription.cancel(),
            Some(0) => {}
            Some(n) => subscription.request(n),
        }
    }

    /// Demand recorded under the same lock that `set` installs upstreams
    /// with, so each request is either replayed by `set` or forwarded here.
    pub(crate) fn request(&self, n: u64) {
        if n == 0 || self.outstanding.is_cancelled() {
            return;
        }
        let current = {
            let current = lock(&self.current);
            self.outstanding.add(n);
            current.clone()
        };
        if let Some(current) = current {
            current.request(n);
        }
    }

    pub(crate) fn produced(&self) {
        self.outstanding.try_consume();
    }

    pub(crate) fn cancel(&self) {
        let current = {
            let mut current = lock(&self.current);
            if !self.outstanding.cancel() {
                return;
            }
            current.take()
        };
        if let Some(current) = current {
            current.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        requested: AtomicU64,
        cancels: AtomicUsize,
    }

    impl Upstream for Recorder {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_demand_is_additive_and_never_negative() {
        let demand = Demand::new();
        demand.add(2);
        demand.add(3);
        assert_eq!(demand.available(), 5);
        for _ in 0..5 {
            assert!(demand.try_consume());
        }
        assert!(!demand.try_consume());
        assert_eq!(demand.available(), 0);
    }

    #[test]
    fn test_unbounded_demand_is_not_decremented() {
        let demand = Demand::new();
        demand.add(10);
        demand.add(UNBOUNDED);
        assert!(demand.is_unbounded());
        assert!(demand.try_consume());
        assert!(demand.is_unbounded());
    }

    #[test]
    fn test_cancel_freezes_demand() {
        let demand = Demand::new();
        demand.add(3);
        assert!(demand.cancel());
        assert!(!demand.cancel());
        demand.add(4);
        assert_eq!(demand.available(), 3);
        assert!(!demand.try_consume());
    }

    #[test]
    fn test_request_zero_is_ignored() {
        let recorder = Arc::new(Recorder::default());
        let subscription = Subscription::new(recorder.clone());
        subscription.request(0);
        subscription.request(4);
        assert_eq!(recorder.requested.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_arbiter_replays_outstanding_demand_to_new_upstream() {
        let arbiter = Arbiter::new();
        arbiter.request(5);
        let first = Arc::new(Recorder::default());
        arbiter.set(Subscription::new(first.clone()));
        assert_eq!(first.requested.load(Ordering::SeqCst), 5);

        arbiter.produced();
        arbiter.produced();
        let second = Arc::new(Recorder::default());
        arbiter.set(Subscription::new(second.clone()));
        assert_eq!(second.requested.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_arbiter_requests_race_with_set_exactly_once() {
        for _ in 0..50 {
            let arbiter = Arc::new(Arbiter::new());
            let requester = arbiter.clone();
            let worker = std::thread::spawn(move || {
                for _ in 0..500 {
                    requester.request(1);
                }
            });
            let upstream = Arc::new(Recorder::default());
            arbiter.set(Subscription::new(upstream.clone()));
            worker.join().expect("requester thread panicked");
            assert_eq!(upstream.requested.load(Ordering::SeqCst), 500);
        }
    }

    #[test]
    fn test_arbiter_cancels_late_upstream() {
        let arbiter = Arbiter::new();
        arbiter.cancel();
        let late = Arc::new(Recorder::default());
        arbiter.set(Subscription::new(late.clone()));
        assert_eq!(late.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(late.requested.load(Ordering::SeqCst), 0);
    }
}
