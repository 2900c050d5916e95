use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use super::error::StreamError;
use super::flux::{Flux, Publisher};
use super::outlet::Outlet;
use super::scheduler::Scheduler;
use super::subscription::{
    lock, Arbiter, BoxSubscriber, Subscriber, Subscription, Upstream, UNBOUNDED,
};
use crate::config::RetryConfig;

type Selector<T> = Arc<dyn Fn(StreamError) -> Flux<T> + Send + Sync>;

struct ResumePublisher<T> {
    source: Flux<T>,
    selector: Selector<T>,
}

struct ResumeState<T> {
    outlet: Arc<Outlet<T>>,
    upstream: Arbiter,
}

impl<T: Send + 'static> Upstream for ResumeState<T> {
    fn request(&self, n: u64) {
        self.outlet.request(n);
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.outlet.cancel();
        self.upstream.cancel();
    }
}

impl<T: Send + 'static> Publisher<T> for ResumePublisher<T> {
    fn subscribe(&self, downstream: BoxSubscriber<T>) {
        let state = Arc::new(ResumeState {
            outlet: Outlet::unbounded(),
            upstream: Arbiter::new(),
        });
        state
            .outlet
            .attach(downstream, Subscription::new(state.clone()));
        self.source.subscribe(ResumeSubscriber {
            state,
            selector: Some(self.selector.clone()),
        });
    }
}

/// Subscribes to the source first and, after its error, to the fallback.
/// The fallback's own error is delivered as is.
struct ResumeSubscriber<T> {
    state: Arc<ResumeState<T>>,
    selector: Option<Selector<T>>,
}

impl<T: Send + 'static> Subscriber<T> for ResumeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.upstream.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.state.upstream.produced();
        self.state.outlet.push(item);
    }

    fn on_error(&mut self, error: StreamError) {
        match self.selector.take() {
            Some(selector) if !self.state.outlet.is_closed() => {
                debug!(operator = "on_error_resume"; "Switching to fallback after: {}", error);
                selector(error).subscribe(ResumeSubscriber {
                    state: self.state.clone(),
                    selector: None,
                });
            }
            _ => self.state.outlet.error(error),
        }
    }

    fn on_complete(&mut self) {
        self.state.outlet.complete();
    }
}

struct MapErrorPublisher<T> {
    source: Flux<T>,
    mapper: Arc<dyn Fn(StreamError) -> StreamError + Send + Sync>,
}

impl<T: Send + 'static> Publisher<T> for MapErrorPublisher<T> {
    fn subscribe(&self, downstream: BoxSubscriber<T>) {
        self.source.subscribe(MapErrorSubscriber {
            downstream,
            mapper: self.mapper.clone(),
        });
    }
}

struct MapErrorSubscriber<T> {
    downstream: BoxSubscriber<T>,
    mapper: Arc<dyn Fn(StreamError) -> StreamError + Send + Sync>,
}

impl<T> Subscriber<T> for MapErrorSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: StreamError) {
        self.downstream.on_error((self.mapper)(error));
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

type Trigger<U> = Arc<dyn Fn(Flux<StreamError>) -> Flux<U> + Send + Sync>;

struct RetryWhenPublisher<T, U> {
    source: Flux<T>,
    trigger: Trigger<U>,
}

/// Per-subscription state of `retry_when`.
///
/// Each attempt error is parked and pushed into the companion stream handed
/// to the trigger. The trigger's output (the control stream) decides: an item
/// resubscribes, an error ends the stream with that error, and completion
/// resubscribes once more if an error is parked and lets later errors through.
struct RetryState<T> {
    source: Flux<T>,
    outlet: Arc<Outlet<T>>,
    attempt: Arbiter,
    errors: Arc<Outlet<StreamError>>,
    control: Arbiter,
    control_done: AtomicBool,
    parked: Mutex<Option<StreamError>>,
    wip: AtomicUsize,
    attempts: AtomicU32,
    done: AtomicBool,
}

impl<T: Send + 'static> RetryState<T> {
    fn resubscribe(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            if !self.done.load(Ordering::Acquire) && !self.outlet.is_closed() {
                let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(operator = "retry_when"; "Subscribing to source, attempt {}", attempt);
                self.source.subscribe(AttemptSubscriber {
                    state: self.clone(),
                });
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.control.cancel();
        self.errors.cancel();
    }
}

impl<T: Send + 'static> Upstream for RetryState<T> {
    fn request(&self, n: u64) {
        self.outlet.request(n);
        self.attempt.request(n);
    }

    fn cancel(&self) {
        self.outlet.cancel();
        self.attempt.cancel();
        self.finish();
    }
}

impl<T: Send + 'static, U: Send + 'static> Publisher<T> for RetryWhenPublisher<T, U> {
    fn subscribe(&self, downstream: BoxSubscriber<T>) {
        let state = Arc::new(RetryState {
            source: self.source.clone(),
            outlet: Outlet::unbounded(),
            attempt: Arbiter::new(),
            errors: Outlet::unbounded(),
            control: Arbiter::new(),
            control_done: AtomicBool::new(false),
            parked: Mutex::new(None),
            wip: AtomicUsize::new(0),
            attempts: AtomicU32::new(0),
            done: AtomicBool::new(false),
        });
        state
            .outlet
            .attach(downstream, Subscription::new(state.clone()));
        let companion = Flux::from_publisher(CompanionPublisher {
            errors: state.errors.clone(),
            taken: AtomicBool::new(false),
        });
        (self.trigger)(companion).subscribe(ControlSubscriber {
            state: state.clone(),
        });
        state.resubscribe();
    }
}

struct AttemptSubscriber<T> {
    state: Arc<RetryState<T>>,
}

impl<T: Send + 'static> Subscriber<T> for AttemptSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.attempt.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.state.attempt.produced();
        self.state.outlet.push(item);
    }

    fn on_error(&mut self, error: StreamError) {
        if self.state.done.load(Ordering::Acquire) {
            return;
        }
        if self.state.control_done.load(Ordering::Acquire) {
            self.state.finish();
            self.state.outlet.error(error);
            return;
        }
        *lock(&self.state.parked) = Some(error.clone());
        self.state.errors.push(error);
    }

    fn on_complete(&mut self) {
        self.state.finish();
        self.state.outlet.complete();
    }
}

struct ControlSubscriber<T> {
    state: Arc<RetryState<T>>,
}

impl<T: Send + 'static, U> Subscriber<U> for ControlSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.control.set(subscription);
        self.state.control.request(UNBOUNDED);
    }

    fn on_next(&mut self, _signal: U) {
        let parked = lock(&self.state.parked).take();
        if parked.is_some() {
            self.state.resubscribe();
        }
    }

    fn on_error(&mut self, error: StreamError) {
        if self.state.done.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(operator = "retry_when"; "Control stream failed, giving up: {}", error);
        self.state.attempt.cancel();
        self.state.errors.cancel();
        self.state.outlet.error(error);
    }

    fn on_complete(&mut self) {
        self.state.control_done.store(true, Ordering::Release);
        let parked = lock(&self.state.parked).take();
        if parked.is_some() {
            self.state.resubscribe();
        }
    }
}

/// The stream of attempt errors handed to a `retry_when` trigger. It accepts
/// a single subscriber.
struct CompanionPublisher {
    errors: Arc<Outlet<StreamError>>,
    taken: AtomicBool,
}

impl Publisher<StreamError> for CompanionPublisher {
    fn subscribe(&self, subscriber: BoxSubscriber<StreamError>) {
        if self.taken.swap(true, Ordering::AcqRel) {
            Flux::error(StreamError::illegal_state(
                "the retry companion stream accepts only one subscriber",
            ))
            .subscribe_boxed(subscriber);
            return;
        }
        self.errors
            .attach(subscriber, Subscription::new(self.errors.clone()));
    }
}

impl<T: Send + 'static> Flux<T> {
    /// On error, switches to the stream returned by `selector`.
    pub fn on_error_resume<F>(self, selector: F) -> Flux<T>
    where
        F: Fn(StreamError) -> Flux<T> + Send + Sync + 'static,
    {
        Flux::from_publisher(ResumePublisher {
            source: self,
            selector: Arc::new(selector),
        })
    }

    /// On error, emits `value` and completes.
    pub fn on_error_return(self, value: T) -> Flux<T>
    where
        T: Clone + Sync,
    {
        self.on_error_resume(move |_| Flux::just(value.clone()))
    }

    /// Rewrites the terminal error. The stream still ends in error.
    pub fn on_error_map<F>(self, mapper: F) -> Flux<T>
    where
        F: Fn(StreamError) -> StreamError + Send + Sync + 'static,
    {
        Flux::from_publisher(MapErrorPublisher {
            source: self,
            mapper: Arc::new(mapper),
        })
    }

    /// Resubscribes to the source as directed by a control stream.
    ///
    /// `trigger` is called once per subscription with the stream of errors
    /// raised by the source and returns the control stream. Each item of the
    /// control stream resubscribes; its error becomes the stream's error.
    pub fn retry_when<U, F>(self, trigger: F) -> Flux<T>
    where
        U: Send + 'static,
        F: Fn(Flux<StreamError>) -> Flux<U> + Send + Sync + 'static,
    {
        Flux::from_publisher(RetryWhenPublisher {
            source: self,
            trigger: Arc::new(trigger),
        })
    }

    /// Resubscribes up to `max_retries` times, then fails with
    /// [`StreamError::RetryExhausted`] wrapping the last error.
    pub fn retry(self, max_retries: u32) -> Flux<T> {
        self.retry_when(move |errors| {
            errors.index().concat_map(move |(attempt, error)| {
                if attempt < u64::from(max_retries) {
                    Flux::just(attempt)
                } else {
                    Flux::error(StreamError::retry_exhausted(max_retries + 1, error))
                }
            })
        })
    }

    /// Bounded retry where `max_attempts` counts the first subscription too.
    pub fn retry_with(self, config: &RetryConfig) -> Flux<T> {
        self.retry(config.max_attempts.saturating_sub(1))
    }

    /// Like [`Flux::retry`] but waits `base_delay * 2^n` before the n-th retry.
    pub fn retry_backoff(
        self,
        max_retries: u32,
        base_delay: Duration,
        scheduler: Arc<dyn Scheduler>,
    ) -> Flux<T> {
        self.retry_when(move |errors| {
            let scheduler = scheduler.clone();
            errors.index().concat_map(move |(attempt, error)| {
                if attempt < u64::from(max_retries) {
                    let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
                    let delay = base_delay.saturating_mul(factor);
                    debug!(operator = "retry_backoff"; "Retry {} in {:?}", attempt + 1, delay);
                    Flux::timer(delay, scheduler.clone())
                } else {
                    Flux::error(StreamError::retry_exhausted(max_retries + 1, error))
                }
            })
        })
    }
}
