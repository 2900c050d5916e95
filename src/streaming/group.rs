use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use super::error::StreamError;
use super::flux::{Flux, Publisher};
use super::outlet::Outlet;
use super::subscription::{
    lock, Arbiter, BoxSubscriber, Subscriber, Subscription, Upstream, UNBOUNDED,
};

/// One keyed partition produced by [`Flux::group_by`].
///
/// The inner stream accepts a single subscriber. Items for the key are
/// buffered until that subscriber requests them.
pub struct GroupedFlux<K, T> {
    key: K,
    flux: Flux<T>,
}

impl<K, T> GroupedFlux<K, T> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn flux(&self) -> Flux<T> {
        self.flux.clone()
    }

    pub fn into_flux(self) -> Flux<T> {
        self.flux
    }
}

impl<K: fmt::Debug, T> fmt::Debug for GroupedFlux<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupedFlux").field("key", &self.key).finish()
    }
}

struct GroupChannel<T> {
    outlet: Arc<Outlet<T>>,
    subscribed: AtomicBool,
    cancelled: AtomicBool,
}

type KeyFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;

struct GroupByPublisher<T, K> {
    source: Flux<T>,
    key_fn: KeyFn<T, K>,
}

struct GroupState<T, K> {
    outlet: Arc<Outlet<GroupedFlux<K, T>>>,
    upstream: Arbiter,
    groups: Mutex<HashMap<K, Arc<GroupChannel<T>>>>,
    requested: AtomicBool,
    outer_cancelled: AtomicBool,
    active: AtomicUsize,
}

impl<T, K> GroupState<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn group_cancelled(&self) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.outer_cancelled.load(Ordering::Acquire) {
            debug!(operator = "group_by"; "Last group cancelled, cancelling upstream");
            self.upstream.cancel();
        }
    }

    fn drain_groups(&self) -> Vec<Arc<GroupChannel<T>>> {
        lock(&self.groups).drain().map(|(_, channel)| channel).collect()
    }
}

impl<T, K> Upstream for GroupState<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.outlet.request(n);
        if !self.requested.swap(true, Ordering::AcqRel) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn cancel(&self) {
        self.outer_cancelled.store(true, Ordering::Release);
        self.outlet.cancel();
        if self.active.load(Ordering::Acquire) == 0 {
            self.upstream.cancel();
        }
    }
}

impl<T, K> Publisher<GroupedFlux<K, T>> for GroupByPublisher<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn subscribe(&self, downstream: BoxSubscriber<GroupedFlux<K, T>>) {
        let state = Arc::new(GroupState {
            outlet: Outlet::unbounded(),
            upstream: Arbiter::new(),
            groups: Mutex::new(HashMap::new()),
            requested: AtomicBool::new(false),
            outer_cancelled: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        });
        state
            .outlet
            .attach(downstream, Subscription::new(state.clone()));
        self.source.subscribe(GroupBySubscriber {
            state,
            key_fn: self.key_fn.clone(),
        });
    }
}

struct GroupBySubscriber<T, K> {
    state: Arc<GroupState<T, K>>,
    key_fn: KeyFn<T, K>,
}

impl<T, K> GroupBySubscriber<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn open_group(&self, key: K) -> (Arc<GroupChannel<T>>, GroupedFlux<K, T>) {
        let channel = Arc::new(GroupChannel {
            outlet: Outlet::unbounded(),
            subscribed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        let grouped = GroupedFlux {
            key,
            flux: Flux::from_publisher(GroupPublisher {
                channel: channel.clone(),
                parent: self.state.clone(),
            }),
        };
        (channel, grouped)
    }
}

impl<T, K> Subscriber<T> for GroupBySubscriber<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.upstream.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        let key = (self.key_fn)(&item);
        let (channel, opened) = {
            let mut groups = lock(&self.state.groups);
            match groups.get(&key) {
                Some(channel) => (channel.clone(), None),
                None => {
                    if self.state.outer_cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    let (channel, grouped) = self.open_group(key.clone());
                    groups.insert(key, channel.clone());
                    self.state.active.fetch_add(1, Ordering::AcqRel);
                    (channel, Some(grouped))
                }
            }
        };
        if let Some(grouped) = opened {
            debug!(operator = "group_by"; "Opened group {}", self.state.active.load(Ordering::Acquire));
            self.state.outlet.push(grouped);
        }
        if !channel.cancelled.load(Ordering::Acquire) {
            channel.outlet.push(item);
        }
    }

    fn on_error(&mut self, error: StreamError) {
        for channel in self.state.drain_groups() {
            channel.outlet.fail(error.clone());
        }
        self.state.outlet.fail(error);
    }

    fn on_complete(&mut self) {
        for channel in self.state.drain_groups() {
            channel.outlet.complete();
        }
        self.state.outlet.complete();
    }
}

struct GroupPublisher<T, K> {
    channel: Arc<GroupChannel<T>>,
    parent: Arc<GroupState<T, K>>,
}

impl<T, K> Publisher<T> for GroupPublisher<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        if self.channel.subscribed.swap(true, Ordering::AcqRel) {
            Flux::error(StreamError::illegal_state(
                "a group accepts only one subscriber",
            ))
            .subscribe_boxed(subscriber);
            return;
        }
        let handle = Arc::new(GroupHandle {
            channel: self.channel.clone(),
            parent: self.parent.clone(),
        });
        self.channel
            .outlet
            .attach(subscriber, Subscription::new(handle));
    }
}

struct GroupHandle<T, K> {
    channel: Arc<GroupChannel<T>>,
    parent: Arc<GroupState<T, K>>,
}

impl<T, K> Upstream for GroupHandle<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn request(&self, n: u64) {
        self.channel.outlet.request(n);
    }

    fn cancel(&self) {
        self.channel.outlet.cancel();
        if !self.channel.cancelled.swap(true, Ordering::AcqRel) {
            self.parent.group_cancelled();
        }
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Splits the stream into one sub-stream per key, in order of first
    /// appearance. Sub-streams complete when the source completes.
    ///
    /// The source is consumed without bound once the outer stream is first
    /// requested; each group buffers until its subscriber asks for items.
    pub fn group_by<K, F>(self, key_fn: F) -> Flux<GroupedFlux<K, T>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Flux::from_publisher(GroupByPublisher {
            source: self,
            key_fn: Arc::new(key_fn),
        })
    }
}
