use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use super::error::StreamError;
use super::flux::{Flux, Publisher};
use super::outlet::Outlet;
use super::subscription::{
    lock, Arbiter, BoxSubscriber, Demand, Subscriber, Subscription, Upstream, UNBOUNDED,
};
use crate::config::HubConfig;

/// Hot, reference-counted view of a cold source.
///
/// The source is subscribed once enough subscribers have joined (the
/// minimum applies to the first connection only) and cancelled when the
/// last subscriber leaves. Every item is delivered to the subscribers that
/// have outstanding demand at the moment it arrives; the others miss it.
/// The hub asks the source for the largest outstanding demand among its
/// subscribers, so the slowest subscriber never holds back the fastest.
///
/// After the source terminates the hub forgets its subscribers, and the
/// next subscriber starts a fresh connection.
pub struct BroadcastHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for BroadcastHub<T> {
    fn clone(&self) -> Self {
        BroadcastHub {
            inner: self.inner.clone(),
        }
    }
}

struct Member<T> {
    id: u64,
    outlet: Arc<Outlet<T>>,
    demand: Demand,
}

struct Connection {
    id: u64,
    upstream: Arbiter,
}

struct HubState<T> {
    members: Vec<Arc<Member<T>>>,
    connection: Option<Arc<Connection>>,
    /// Requested from the current connection and not yet received.
    outstanding: u64,
    activated: bool,
    next_member: u64,
}

struct HubInner<T> {
    source: Flux<T>,
    min_subscribers: usize,
    state: Mutex<HubState<T>>,
    connections: AtomicU64,
}

impl<T: Clone + Send + 'static> HubInner<T> {
    /// Opens a connection if none is active and the subscriber threshold is met.
    fn open_connection(&self, state: &mut HubState<T>, force: bool) -> Option<Arc<Connection>> {
        if state.connection.is_some() {
            return None;
        }
        let threshold = if state.activated { 1 } else { self.min_subscribers };
        if !force && state.members.len() < threshold {
            return None;
        }
        let id = self.connections.fetch_add(1, Ordering::AcqRel) + 1;
        let connection = Arc::new(Connection {
            id,
            upstream: Arbiter::new(),
        });
        state.connection = Some(connection.clone());
        state.outstanding = 0;
        state.activated = true;
        Some(connection)
    }

    fn start(self: &Arc<Self>, connection: Arc<Connection>) {
        debug!(operator = "hub"; "Connecting to source (connection {})", connection.id);
        self.source.subscribe(HubSubscriber {
            hub: self.clone(),
            connection: connection.id,
        });
        self.replenish();
    }

    fn current(&self, state: &HubState<T>, connection: u64) -> Option<Arc<Connection>> {
        state
            .connection
            .as_ref()
            .filter(|current| current.id == connection)
            .cloned()
    }

    /// Tops up the source request to the largest demand among subscribers.
    fn replenish(&self) {
        let top_up = {
            let mut state = lock(&self.state);
            let Some(connection) = state.connection.clone() else {
                return;
            };
            let wanted = state
                .members
                .iter()
                .map(|member| member.demand.available())
                .max()
                .unwrap_or(0);
            if wanted <= state.outstanding {
                return;
            }
            let extra = if wanted == UNBOUNDED {
                UNBOUNDED
            } else {
                wanted - state.outstanding
            };
            state.outstanding = wanted;
            (connection, extra)
        };
        let (connection, extra) = top_up;
        connection.upstream.request(extra);
    }

    fn remove(&self, member: u64) {
        let disconnected = {
            let mut state = lock(&self.state);
            let before = state.members.len();
            state.members.retain(|m| m.id != member);
            if state.members.len() < before && state.members.is_empty() {
                state.connection.take()
            } else {
                None
            }
        };
        if let Some(connection) = disconnected {
            debug!(operator = "hub"; "Last subscriber left, disconnecting (connection {})", connection.id);
            connection.upstream.cancel();
        }
    }

    /// Clears the member set for a terminated connection and returns it.
    fn terminate(&self, connection: u64) -> Vec<Arc<Member<T>>> {
        let mut state = lock(&self.state);
        if self.current(&state, connection).is_none() {
            return Vec::new();
        }
        state.connection = None;
        std::mem::take(&mut state.members)
    }
}

struct HubPublisher<T> {
    hub: Arc<HubInner<T>>,
}

impl<T: Clone + Send + 'static> Publisher<T> for HubPublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let member = {
            let mut state = lock(&self.hub.state);
            state.next_member += 1;
            Arc::new(Member {
                id: state.next_member,
                outlet: Outlet::unbounded(),
                demand: Demand::new(),
            })
        };
        member.outlet.attach(
            subscriber,
            Subscription::new(Arc::new(MemberHandle {
                hub: self.hub.clone(),
                member: member.clone(),
            })),
        );
        let connection = {
            let mut state = lock(&self.hub.state);
            if member.outlet.is_cancelled() {
                return;
            }
            state.members.push(member);
            self.hub.open_connection(&mut state, false)
        };
        match connection {
            Some(connection) => self.hub.start(connection),
            None => self.hub.replenish(),
        }
    }
}

struct MemberHandle<T> {
    hub: Arc<HubInner<T>>,
    member: Arc<Member<T>>,
}

impl<T: Clone + Send + 'static> Upstream for MemberHandle<T> {
    fn request(&self, n: u64) {
        self.member.demand.add(n);
        self.member.outlet.request(n);
        self.hub.replenish();
    }

    fn cancel(&self) {
        self.member.outlet.cancel();
        if self.member.demand.cancel() {
            self.hub.remove(self.member.id);
        }
    }
}

struct HubSubscriber<T> {
    hub: Arc<HubInner<T>>,
    connection: u64,
}

impl<T: Clone + Send + 'static> Subscriber<T> for HubSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        let current = {
            let state = lock(&self.hub.state);
            self.hub.current(&state, self.connection)
        };
        match current {
            Some(connection) => connection.upstream.set(subscription),
            None => subscription.cancel(),
        }
    }

    fn on_next(&mut self, item: T) {
        let (targets, missed) = {
            let mut state = lock(&self.hub.state);
            if self.hub.current(&state, self.connection).is_none() {
                return;
            }
            if state.outstanding != UNBOUNDED {
                state.outstanding = state.outstanding.saturating_sub(1);
            }
            let targets: Vec<Arc<Member<T>>> = state
                .members
                .iter()
                .filter(|member| member.demand.try_consume())
                .cloned()
                .collect();
            let missed = state.members.len() - targets.len();
            (targets, missed)
        };
        if missed > 0 {
            trace!(operator = "hub"; "{} subscriber(s) without demand missed an item", missed);
        }
        for member in targets {
            member.outlet.push(item.clone());
        }
        self.hub.replenish();
    }

    fn on_error(&mut self, error: StreamError) {
        let members = self.hub.terminate(self.connection);
        debug!(operator = "hub"; "Source failed, releasing {} subscriber(s)", members.len());
        for member in members {
            member.outlet.error(error.clone());
        }
    }

    fn on_complete(&mut self) {
        let members = self.hub.terminate(self.connection);
        debug!(operator = "hub"; "Source completed, releasing {} subscriber(s)", members.len());
        for member in members {
            member.outlet.complete();
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastHub<T> {
    /// Wraps `source`. The first connection waits for `min_subscribers`
    /// subscribers (at least one).
    pub fn new(source: Flux<T>, min_subscribers: usize) -> Self {
        BroadcastHub {
            inner: Arc::new(HubInner {
                source,
                min_subscribers: min_subscribers.max(1),
                state: Mutex::new(HubState {
                    members: Vec::new(),
                    connection: None,
                    outstanding: 0,
                    activated: false,
                    next_member: 0,
                }),
                connections: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_config(source: Flux<T>, config: &HubConfig) -> Self {
        Self::new(source, config.min_subscribers)
    }

    /// The hot stream. Each subscription joins the hub.
    pub fn flux(&self) -> Flux<T> {
        Flux::from_publisher(HubPublisher {
            hub: self.inner.clone(),
        })
    }

    pub fn subscribe<S: Subscriber<T> + 'static>(&self, subscriber: S) {
        self.flux().subscribe(subscriber);
    }

    /// Connects to the source now, ignoring the subscriber threshold.
    /// Returns false if a connection was already active.
    pub fn connect(&self) -> bool {
        let connection = {
            let mut state = lock(&self.inner.state);
            self.inner.open_connection(&mut state, true)
        };
        match connection {
            Some(connection) => {
                self.inner.start(connection);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).members.len()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).connection.is_some()
    }

    /// How many times the source has been subscribed.
    pub fn connection_count(&self) -> u64 {
        self.inner.connections.load(Ordering::Acquire)
    }
}

impl<T: Clone + Send + 'static> Flux<T> {
    pub fn broadcast(self, min_subscribers: usize) -> BroadcastHub<T> {
        BroadcastHub::new(self, min_subscribers)
    }

    pub fn broadcast_with(self, config: &HubConfig) -> BroadcastHub<T> {
        BroadcastHub::with_config(self, config)
    }

    /// Hot stream that connects on the first subscriber and disconnects
    /// when the last one leaves.
    pub fn share(self) -> Flux<T> {
        self.broadcast(1).flux()
    }
}
