use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info};

use super::error::{StreamError, StreamResult};
use super::flux::{Flux, Publisher};
use super::subscription::{BoxSubscriber, Subscriber, Subscription, Upstream};

/// Per-subscription element handler. `Ok(None)` drops the element and asks
/// upstream for a replacement so downstream demand is still met.
type Handler<T, U> = Box<dyn FnMut(T) -> StreamResult<Option<U>> + Send>;
type HandlerFactory<T, U> = Arc<dyn Fn() -> Handler<T, U> + Send + Sync>;

struct TransformPublisher<T, U> {
    source: Flux<T>,
    operator: &'static str,
    factory: HandlerFactory<T, U>,
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for TransformPublisher<T, U> {
    fn subscribe(&self, downstream: BoxSubscriber<U>) {
        self.source.subscribe(TransformSubscriber {
            downstream,
            operator: self.operator,
            handler: (self.factory)(),
            upstream: None,
            done: false,
        });
    }
}

struct TransformSubscriber<T, U> {
    downstream: BoxSubscriber<U>,
    operator: &'static str,
    handler: Handler<T, U>,
    upstream: Option<Subscription>,
    done: bool,
}

impl<T, U> Subscriber<T> for TransformSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        match (self.handler)(item) {
            Ok(Some(output)) => self.downstream.on_next(output),
            Ok(None) => {
                if let Some(upstream) = &self.upstream {
                    upstream.request(1);
                }
            }
            Err(error) => {
                debug!(operator = self.operator; "Handler failed, cancelling upstream: {}", error);
                self.done = true;
                if let Some(upstream) = self.upstream.take() {
                    upstream.cancel();
                }
                self.downstream.on_error(error);
            }
        }
    }

    fn on_error(&mut self, error: StreamError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.downstream.on_complete();
        }
    }
}

struct TakePublisher<T> {
    source: Flux<T>,
    limit: u64,
}

impl<T: Send + 'static> Publisher<T> for TakePublisher<T> {
    fn subscribe(&self, downstream: BoxSubscriber<T>) {
        self.source.subscribe(TakeSubscriber {
            downstream,
            remaining: self.limit,
            upstream: None,
            done: false,
        });
    }
}

struct TakeSubscriber<T> {
    downstream: BoxSubscriber<T>,
    remaining: u64,
    upstream: Option<Subscription>,
    done: bool,
}

impl<T> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        if self.remaining == 0 {
            subscription.cancel();
            self.done = true;
            self.downstream.on_subscribe(Subscription::empty());
            self.downstream.on_complete();
            return;
        }
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        self.remaining -= 1;
        self.downstream.on_next(item);
        if self.remaining == 0 && !self.done {
            self.done = true;
            if let Some(upstream) = self.upstream.take() {
                upstream.cancel();
            }
            self.downstream.on_complete();
        }
    }

    fn on_error(&mut self, error: StreamError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.downstream.on_complete();
        }
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Side-effect callbacks observed by [`PeekPublisher`].
struct Hooks<T> {
    on_subscribe: Option<Callback>,
    on_next: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&StreamError) + Send + Sync>>,
    on_complete: Option<Callback>,
    on_request: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    on_cancel: Option<Callback>,
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Hooks {
            on_subscribe: None,
            on_next: None,
            on_error: None,
            on_complete: None,
            on_request: None,
            on_cancel: None,
        }
    }
}

impl<T> Clone for Hooks<T> {
    fn clone(&self) -> Self {
        Hooks {
            on_subscribe: self.on_subscribe.clone(),
            on_next: self.on_next.clone(),
            on_error: self.on_error.clone(),
            on_complete: self.on_complete.clone(),
            on_request: self.on_request.clone(),
            on_cancel: self.on_cancel.clone(),
        }
    }
}

struct PeekPublisher<T> {
    source: Flux<T>,
    hooks: Hooks<T>,
}

impl<T: Send + 'static> Publisher<T> for PeekPublisher<T> {
    fn subscribe(&self, downstream: BoxSubscriber<T>) {
        self.source.subscribe(PeekSubscriber {
            downstream,
            hooks: self.hooks.clone(),
        });
    }
}

struct PeekSubscriber<T> {
    downstream: BoxSubscriber<T>,
    hooks: Hooks<T>,
}

struct PeekUpstream {
    upstream: Subscription,
    on_request: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    on_cancel: Option<Callback>,
    cancelled: AtomicBool,
}

impl Upstream for PeekUpstream {
    fn request(&self, n: u64) {
        if let Some(hook) = &self.on_request {
            hook(n);
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hook) = &self.on_cancel {
            hook();
        }
        self.upstream.cancel();
    }
}

impl<T> Subscriber<T> for PeekSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        if let Some(hook) = &self.hooks.on_subscribe {
            hook();
        }
        let subscription = if self.hooks.on_request.is_some() || self.hooks.on_cancel.is_some() {
            Subscription::new(Arc::new(PeekUpstream {
                upstream: subscription,
                on_request: self.hooks.on_request.clone(),
                on_cancel: self.hooks.on_cancel.clone(),
                cancelled: AtomicBool::new(false),
            }))
        } else {
            subscription
        };
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        if let Some(hook) = &self.hooks.on_next {
            hook(&item);
        }
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: StreamError) {
        if let Some(hook) = &self.hooks.on_error {
            hook(&error);
        }
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        if let Some(hook) = &self.hooks.on_complete {
            hook();
        }
        self.downstream.on_complete();
    }
}

impl<T: Send + 'static> Flux<T> {
    fn transform<U, F>(self, operator: &'static str, factory: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn() -> Handler<T, U> + Send + Sync + 'static,
    {
        Flux::from_publisher(TransformPublisher {
            source: self,
            operator,
            factory: Arc::new(factory),
        })
    }

    fn peek(self, hooks: Hooks<T>) -> Flux<T> {
        Flux::from_publisher(PeekPublisher {
            source: self,
            hooks,
        })
    }

    /// Transforms every item one to one.
    pub fn map<U, F>(self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        self.transform("map", move || {
            let mapper = mapper.clone();
            Box::new(move |item: T| Ok(Some(mapper(item))))
        })
    }

    /// Like `map` with a fallible function. An `Err` cancels upstream and
    /// terminates the stream with that error.
    pub fn try_map<U, F>(self, mapper: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> StreamResult<U> + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        self.transform("try_map", move || {
            let mapper = mapper.clone();
            Box::new(move |item: T| mapper(item).map(Some))
        })
    }

    /// Keeps items matching `predicate`. Each dropped item is replaced by a
    /// `request(1)` upstream.
    pub fn filter<P>(self, predicate: P) -> Flux<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        self.transform("filter", move || {
            let predicate = predicate.clone();
            Box::new(move |item: T| Ok(predicate(&item).then_some(item)))
        })
    }

    /// Suppresses items whose key was already seen in this subscription.
    ///
    /// Every distinct key is remembered until the subscription ends, so memory
    /// grows with the number of distinct keys.
    pub fn distinct_by<K, F>(self, key_fn: F) -> Flux<T>
    where
        K: Eq + Hash + Send + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        let key_fn = Arc::new(key_fn);
        self.transform("distinct", move || {
            let key_fn = key_fn.clone();
            let mut seen = HashSet::new();
            Box::new(move |item: T| Ok(seen.insert(key_fn(&item)).then_some(item)))
        })
    }

    pub fn distinct(self) -> Flux<T>
    where
        T: Eq + Hash + Clone,
    {
        self.distinct_by(T::clone)
    }

    /// Pairs each item with its zero-based position.
    pub fn index(self) -> Flux<(u64, T)> {
        self.transform("index", || {
            let mut position = 0u64;
            Box::new(move |item: T| {
                let indexed = (position, item);
                position += 1;
                Ok(Some(indexed))
            })
        })
    }

    /// Pairs each item with the wall-clock time it passed through.
    pub fn timestamp(self) -> Flux<(SystemTime, T)> {
        self.transform("timestamp", || {
            Box::new(|item: T| Ok(Some((SystemTime::now(), item))))
        })
    }

    /// Emits at most `limit` items, then cancels upstream and completes.
    pub fn take(self, limit: u64) -> Flux<T> {
        Flux::from_publisher(TakePublisher {
            source: self,
            limit,
        })
    }

    pub fn do_on_next<F>(self, hook: F) -> Flux<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.peek(Hooks {
            on_next: Some(Arc::new(hook)),
            ..Hooks::default()
        })
    }

    pub fn do_on_error<F>(self, hook: F) -> Flux<T>
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.peek(Hooks {
            on_error: Some(Arc::new(hook)),
            ..Hooks::default()
        })
    }

    pub fn do_on_complete<F>(self, hook: F) -> Flux<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.peek(Hooks {
            on_complete: Some(Arc::new(hook)),
            ..Hooks::default()
        })
    }

    pub fn do_on_subscribe<F>(self, hook: F) -> Flux<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.peek(Hooks {
            on_subscribe: Some(Arc::new(hook)),
            ..Hooks::default()
        })
    }

    /// Observes every `request(n)` made by downstream.
    pub fn do_on_request<F>(self, hook: F) -> Flux<T>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.peek(Hooks {
            on_request: Some(Arc::new(hook)),
            ..Hooks::default()
        })
    }

    pub fn do_on_cancel<F>(self, hook: F) -> Flux<T>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.peek(Hooks {
            on_cancel: Some(Arc::new(hook)),
            ..Hooks::default()
        })
    }

    /// Logs every signal, request and cancel at `info` level under `category`.
    pub fn log(self, category: impl Into<String>) -> Flux<T>
    where
        T: Debug,
    {
        let category: Arc<str> = Arc::from(category.into());
        let (subscribed, next, error, complete, request, cancel) = (
            category.clone(),
            category.clone(),
            category.clone(),
            category.clone(),
            category.clone(),
            category,
        );
        self.peek(Hooks {
            on_subscribe: Some(Arc::new(move || {
                info!(target: &*subscribed, "| onSubscribe()");
            })),
            on_next: Some(Arc::new(move |item: &T| {
                info!(target: &*next, "| onNext({:?})", item);
            })),
            on_error: Some(Arc::new(move |e: &StreamError| {
                info!(target: &*error, "| onError({})", e);
            })),
            on_complete: Some(Arc::new(move || {
                info!(target: &*complete, "| onComplete()");
            })),
            on_request: Some(Arc::new(move |n: u64| {
                info!(target: &*request, "| request({})", n);
            })),
            on_cancel: Some(Arc::new(move || {
                info!(target: &*cancel, "| cancel()");
            })),
        })
    }
}
