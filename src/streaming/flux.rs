use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::error::StreamError;
use super::subscription::{lock, BoxSubscriber, Subscriber, Subscription, Upstream, UNBOUNDED};

/// Anything that can be subscribed to.
///
/// Implementations call `on_subscribe` on the subscriber before any other
/// signal, and do so from inside their own delivery guard so a request
/// issued from `on_subscribe` is served after it returns.
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: BoxSubscriber<T>);
}

/// A composable stream of `T`.
///
/// Operators wrap one `Flux` inside another; nothing runs until a subscriber
/// requests. Cloning is cheap and every subscription to a cold `Flux`
/// restarts production from scratch.
pub struct Flux<T> {
    publisher: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Flux {
            publisher: self.publisher.clone(),
        }
    }
}

impl<T> fmt::Debug for Flux<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flux").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Flux<T> {
    pub fn from_publisher<P: Publisher<T> + 'static>(publisher: P) -> Self {
        Flux {
            publisher: Arc::new(publisher),
        }
    }

    pub fn subscribe<S: Subscriber<T> + 'static>(&self, subscriber: S) {
        self.publisher.subscribe(Box::new(subscriber));
    }

    pub fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>) {
        self.publisher.subscribe(subscriber);
    }

    /// Subscribes with callbacks and an unbounded initial request.
    ///
    /// The returned subscription can be used to cancel early, including
    /// before a deferred upstream has called `on_subscribe`.
    pub fn subscribe_with<N, E, C>(&self, on_next: N, on_error: E, on_complete: C) -> Subscription
    where
        N: FnMut(T) + Send + 'static,
        E: FnMut(StreamError) + Send + 'static,
        C: FnMut() + Send + 'static,
    {
        let handle = Arc::new(LambdaHandle::default());
        self.subscribe(LambdaSubscriber {
            on_next,
            on_error,
            on_complete,
            handle: handle.clone(),
        });
        Subscription::new(handle)
    }
}

#[derive(Default)]
struct LambdaHandle {
    upstream: Mutex<Option<Subscription>>,
    cancelled: AtomicBool,
}

impl Upstream for LambdaHandle {
    fn request(&self, n: u64) {
        let upstream = lock(&self.upstream).clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let upstream = lock(&self.upstream).clone();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct LambdaSubscriber<N, E, C> {
    on_next: N,
    on_error: E,
    on_complete: C,
    handle: Arc<LambdaHandle>,
}

impl<T, N, E, C> Subscriber<T> for LambdaSubscriber<N, E, C>
where
    N: FnMut(T) + Send,
    E: FnMut(StreamError) + Send,
    C: FnMut() + Send,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        *lock(&self.handle.upstream) = Some(subscription.clone());
        if self.handle.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
        } else {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&mut self, item: T) {
        (self.on_next)(item);
    }

    fn on_error(&mut self, error: StreamError) {
        (self.on_error)(error);
    }

    fn on_complete(&mut self) {
        (self.on_complete)();
    }
}
