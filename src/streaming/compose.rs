use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use super::error::StreamError;
use super::flux::{Flux, Publisher};
use super::outlet::Outlet;
use super::subscription::{lock, Arbiter, BoxSubscriber, Subscriber, Subscription, Upstream};

struct ConcatMapPublisher<T, U> {
    source: Flux<T>,
    mapper: Arc<dyn Fn(T) -> Flux<U> + Send + Sync>,
}

#[derive(Default)]
struct ConcatPhase {
    inner_active: bool,
    outer_done: bool,
}

/// Shared state of one `concat_map` subscription. The outer upstream is
/// asked for one item at a time and only after the previous inner stream
/// has completed.
struct ConcatState<T, U> {
    outlet: Arc<Outlet<U>>,
    outer: Arbiter,
    inner: Arbiter,
    phase: Mutex<ConcatPhase>,
    mapper: Arc<dyn Fn(T) -> Flux<U> + Send + Sync>,
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for ConcatMapPublisher<T, U> {
    fn subscribe(&self, downstream: BoxSubscriber<U>) {
        let state = Arc::new(ConcatState {
            outlet: Outlet::unbounded(),
            outer: Arbiter::new(),
            inner: Arbiter::new(),
            phase: Mutex::new(ConcatPhase::default()),
            mapper: self.mapper.clone(),
        });
        state
            .outlet
            .attach(downstream, Subscription::new(state.clone()));
        state.outer.request(1);
        self.source.subscribe(ConcatOuter { state });
    }
}

impl<T: Send + 'static, U: Send + 'static> ConcatState<T, U> {
    fn fail(&self, error: StreamError) {
        self.outlet.fail(error);
        self.outer.cancel();
        self.inner.cancel();
    }

    fn inner_complete(&self) {
        let finished = {
            let mut phase = lock(&self.phase);
            phase.inner_active = false;
            phase.outer_done
        };
        if finished {
            self.outlet.complete();
        } else {
            self.outer.request(1);
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> Upstream for ConcatState<T, U> {
    fn request(&self, n: u64) {
        self.outlet.request(n);
        self.inner.request(n);
    }

    fn cancel(&self) {
        self.outlet.cancel();
        self.outer.cancel();
        self.inner.cancel();
    }
}

struct ConcatOuter<T, U> {
    state: Arc<ConcatState<T, U>>,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<T> for ConcatOuter<T, U> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.outer.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        if self.state.outlet.is_closed() {
            return;
        }
        lock(&self.state.phase).inner_active = true;
        let inner = (self.state.mapper)(item);
        inner.subscribe(ConcatInner {
            state: self.state.clone(),
        });
    }

    fn on_error(&mut self, error: StreamError) {
        self.state.fail(error);
    }

    fn on_complete(&mut self) {
        let finished = {
            let mut phase = lock(&self.state.phase);
            phase.outer_done = true;
            !phase.inner_active
        };
        if finished {
            self.state.outlet.complete();
        }
    }
}

struct ConcatInner<T, U> {
    state: Arc<ConcatState<T, U>>,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<U> for ConcatInner<T, U> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.inner.set(subscription);
    }

    fn on_next(&mut self, item: U) {
        self.state.inner.produced();
        self.state.outlet.push(item);
    }

    fn on_error(&mut self, error: StreamError) {
        self.state.fail(error);
    }

    fn on_complete(&mut self) {
        self.state.inner_complete();
    }
}

struct MergePublisher<T> {
    sources: Vec<Flux<T>>,
}

struct MergeState<T> {
    outlet: Arc<Outlet<T>>,
    upstreams: Vec<Arbiter>,
    remaining: AtomicUsize,
}

impl<T: Send + 'static> MergeState<T> {
    fn cancel_upstreams(&self) {
        for upstream in &self.upstreams {
            upstream.cancel();
        }
    }
}

impl<T: Send + 'static> Upstream for MergeState<T> {
    fn request(&self, n: u64) {
        self.outlet.request(n);
        for upstream in &self.upstreams {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        self.outlet.cancel();
        self.cancel_upstreams();
    }
}

impl<T: Send + 'static> Publisher<T> for MergePublisher<T> {
    fn subscribe(&self, downstream: BoxSubscriber<T>) {
        let state = Arc::new(MergeState {
            outlet: Outlet::unbounded(),
            upstreams: self.sources.iter().map(|_| Arbiter::new()).collect(),
            remaining: AtomicUsize::new(self.sources.len()),
        });
        state
            .outlet
            .attach(downstream, Subscription::new(state.clone()));
        for (index, source) in self.sources.iter().enumerate() {
            source.subscribe(MergeSubscriber {
                state: state.clone(),
                index,
            });
        }
    }
}

struct MergeSubscriber<T> {
    state: Arc<MergeState<T>>,
    index: usize,
}

impl<T: Send + 'static> Subscriber<T> for MergeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.upstreams[self.index].set(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.state.outlet.push(item);
    }

    fn on_error(&mut self, error: StreamError) {
        debug!(operator = "merge"; "Source {} failed, cancelling the others", self.index);
        self.state.outlet.fail(error);
        self.state.cancel_upstreams();
    }

    fn on_complete(&mut self) {
        if self.state.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.outlet.complete();
        }
    }
}

struct ZipQueues<T, U> {
    left: VecDeque<T>,
    right: VecDeque<U>,
    left_done: bool,
    right_done: bool,
    finished: bool,
}

impl<T, U> ZipQueues<T, U> {
    fn exhausted(&self) -> bool {
        (self.left_done && self.left.is_empty()) || (self.right_done && self.right.is_empty())
    }
}

type Combiner<T, U, R> = Arc<dyn Fn(T, U) -> R + Send + Sync>;

struct ZipPublisher<T, U, R> {
    left: Flux<T>,
    right: Flux<U>,
    combiner: Combiner<T, U, R>,
}

struct ZipState<T, U, R> {
    outlet: Arc<Outlet<R>>,
    left: Arbiter,
    right: Arbiter,
    queues: Mutex<ZipQueues<T, U>>,
    combiner: Combiner<T, U, R>,
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

impl<T, U, R> ZipState<T, U, R>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
{
    /// Pairs whatever is buffered on both sides and decides whether either
    /// side has run dry for good.
    fn settle(&self, queues: &mut ZipQueues<T, U>) -> bool {
        while !queues.left.is_empty() && !queues.right.is_empty() {
            if let (Some(left), Some(right)) = (queues.left.pop_front(), queues.right.pop_front()) {
                self.outlet.enqueue((self.combiner)(left, right));
            }
        }
        if queues.exhausted() && !queues.finished {
            queues.finished = true;
            return true;
        }
        false
    }

    fn after_settle(&self, finished: bool) {
        self.outlet.flush();
        if finished {
            self.outlet.complete();
            self.left.cancel();
            self.right.cancel();
        }
    }

    fn complete_side(&self, side: Side) {
        let finished = {
            let mut queues = lock(&self.queues);
            if queues.finished {
                return;
            }
            match side {
                Side::Left => queues.left_done = true,
                Side::Right => queues.right_done = true,
            }
            self.settle(&mut queues)
        };
        self.after_settle(finished);
    }

    fn fail(&self, error: StreamError) {
        lock(&self.queues).finished = true;
        self.outlet.fail(error);
        self.left.cancel();
        self.right.cancel();
    }
}

impl<T, U, R> Upstream for ZipState<T, U, R>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
{
    fn request(&self, n: u64) {
        self.outlet.request(n);
        self.left.request(n);
        self.right.request(n);
    }

    fn cancel(&self) {
        self.outlet.cancel();
        self.left.cancel();
        self.right.cancel();
    }
}

impl<T, U, R> Publisher<R> for ZipPublisher<T, U, R>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, downstream: BoxSubscriber<R>) {
        let state = Arc::new(ZipState {
            outlet: Outlet::unbounded(),
            left: Arbiter::new(),
            right: Arbiter::new(),
            queues: Mutex::new(ZipQueues {
                left: VecDeque::new(),
                right: VecDeque::new(),
                left_done: false,
                right_done: false,
                finished: false,
            }),
            combiner: self.combiner.clone(),
        });
        state
            .outlet
            .attach(downstream, Subscription::new(state.clone()));
        self.left.subscribe(ZipLeft {
            state: state.clone(),
        });
        self.right.subscribe(ZipRight { state });
    }
}

struct ZipLeft<T, U, R> {
    state: Arc<ZipState<T, U, R>>,
}

impl<T, U, R> Subscriber<T> for ZipLeft<T, U, R>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.left.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        let finished = {
            let mut queues = lock(&self.state.queues);
            if queues.finished {
                return;
            }
            queues.left.push_back(item);
            self.state.settle(&mut queues)
        };
        self.state.after_settle(finished);
    }

    fn on_error(&mut self, error: StreamError) {
        self.state.fail(error);
    }

    fn on_complete(&mut self) {
        self.state.complete_side(Side::Left);
    }
}

struct ZipRight<T, U, R> {
    state: Arc<ZipState<T, U, R>>,
}

impl<T, U, R> Subscriber<U> for ZipRight<T, U, R>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.right.set(subscription);
    }

    fn on_next(&mut self, item: U) {
        let finished = {
            let mut queues = lock(&self.state.queues);
            if queues.finished {
                return;
            }
            queues.right.push_back(item);
            self.state.settle(&mut queues)
        };
        self.state.after_settle(finished);
    }

    fn on_error(&mut self, error: StreamError) {
        self.state.fail(error);
    }

    fn on_complete(&mut self) {
        self.state.complete_side(Side::Right);
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Maps each item to an inner stream and concatenates the inner streams
    /// in order. Only one inner stream is subscribed at a time.
    pub fn concat_map<U, F>(self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        Flux::from_publisher(ConcatMapPublisher {
            source: self,
            mapper: Arc::new(mapper),
        })
    }

    /// Sequential flat map; same as [`Flux::concat_map`].
    pub fn flat_map<U, F>(self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Flux<U> + Send + Sync + 'static,
    {
        self.concat_map(mapper)
    }

    /// Interleaves all sources in arrival order. Completes once every source
    /// has completed; the first error cancels the rest.
    pub fn merge(sources: Vec<Flux<T>>) -> Flux<T> {
        if sources.is_empty() {
            return Flux::empty();
        }
        Flux::from_publisher(MergePublisher { sources })
    }

    pub fn merge_with(self, other: Flux<T>) -> Flux<T> {
        Flux::merge(vec![self, other])
    }

    /// Combines items of both streams by position. Completes as soon as one
    /// side has completed and has no unpaired items left.
    pub fn zip_with<U, R, F>(self, other: Flux<U>, combiner: F) -> Flux<R>
    where
        U: Send + 'static,
        R: Send + 'static,
        F: Fn(T, U) -> R + Send + Sync + 'static,
    {
        Flux::from_publisher(ZipPublisher {
            left: self,
            right: other,
            combiner: Arc::new(combiner),
        })
    }

    pub fn zip<U: Send + 'static>(self, other: Flux<U>) -> Flux<(T, U)> {
        self.zip_with(other, |left, right| (left, right))
    }
}
