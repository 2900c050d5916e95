use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use super::error::StreamError;
use super::subscription::{lock, BoxSubscriber, Demand, Subscription, Upstream};
use crate::config::BufferPolicy;

enum Slot<T> {
    Pending,
    Active(BoxSubscriber<T>),
    Done,
}

enum Terminal {
    Complete,
    /// Delivered once buffered items are drained.
    Error(StreamError),
    /// Delivered ahead of buffered items, which are discarded.
    Fail(StreamError),
}

type CancelHook = Box<dyn FnOnce() + Send>;

/// Demand-gated, serialized delivery point for one downstream subscriber.
///
/// Producers push from any thread; a work-in-progress counter elects a single
/// drainer at a time, so signals reach the subscriber strictly one after the
/// other and a subscriber that calls back into `request` or `cancel` from
/// inside `on_next` never re-enters delivery. No lock is held while the
/// subscriber runs.
pub(crate) struct Outlet<T> {
    incoming: Mutex<Option<(BoxSubscriber<T>, Subscription)>>,
    slot: Mutex<Slot<T>>,
    queue: Mutex<VecDeque<T>>,
    terminal: Mutex<Option<Terminal>>,
    closed: AtomicBool,
    demand: Demand,
    wip: AtomicUsize,
    buffer: BufferPolicy,
    cancel_hooks: Mutex<Vec<CancelHook>>,
}

impl<T: Send + 'static> Outlet<T> {
    pub(crate) fn new(buffer: BufferPolicy) -> Arc<Self> {
        Arc::new(Outlet {
            incoming: Mutex::new(None),
            slot: Mutex::new(Slot::Pending),
            queue: Mutex::new(VecDeque::new()),
            terminal: Mutex::new(None),
            closed: AtomicBool::new(false),
            demand: Demand::new(),
            wip: AtomicUsize::new(0),
            buffer,
            cancel_hooks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn unbounded() -> Arc<Self> {
        Self::new(BufferPolicy::Unbounded)
    }

    /// Hands the outlet its subscriber. `on_subscribe` runs inside the drain
    /// loop, so requests issued from it are picked up afterwards.
    pub(crate) fn attach(&self, subscriber: BoxSubscriber<T>, subscription: Subscription) {
        *lock(&self.incoming) = Some((subscriber, subscription));
        self.drain();
    }

    pub(crate) fn push(&self, item: T) -> bool {
        let accepted = self.enqueue(item);
        self.drain();
        accepted
    }

    /// Buffers an item without delivering it. Callers follow up with `flush`
    /// once they have released their own locks.
    pub(crate) fn enqueue(&self, item: T) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut queue = lock(&self.queue);
        match self.buffer {
            BufferPolicy::Unbounded => {}
            BufferPolicy::DropOldest(capacity) => {
                if queue.len() >= capacity {
                    queue.pop_front();
                    warn!(operator = "outlet"; "Buffer full ({}), dropped oldest item", capacity);
                }
            }
            BufferPolicy::DropLatest(capacity) => {
                if queue.len() >= capacity {
                    warn!(operator = "outlet"; "Buffer full ({}), dropped latest item", capacity);
                    return false;
                }
            }
        }
        queue.push_back(item);
        true
    }

    pub(crate) fn flush(&self) {
        self.drain();
    }

    pub(crate) fn complete(&self) {
        self.terminate(Terminal::Complete);
    }

    pub(crate) fn error(&self, error: StreamError) {
        self.terminate(Terminal::Error(error));
    }

    pub(crate) fn fail(&self, error: StreamError) {
        self.terminate(Terminal::Fail(error));
    }

    pub(crate) fn request(&self, n: u64) {
        self.demand.add(n);
        self.drain();
    }

    pub(crate) fn cancel(&self) {
        if self.demand.cancel() {
            let hooks = std::mem::take(&mut *lock(&self.cancel_hooks));
            for hook in hooks {
                hook();
            }
        }
        self.drain();
    }

    /// Runs `hook` once when the outlet is cancelled, or right away if it already was.
    pub(crate) fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        if self.demand.is_cancelled() {
            hook();
            return;
        }
        lock(&self.cancel_hooks).push(Box::new(hook));
        if self.demand.is_cancelled() {
            let hooks = std::mem::take(&mut *lock(&self.cancel_hooks));
            for hook in hooks {
                hook();
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.demand.is_cancelled()
    }

    /// True once cancelled or once a terminal signal has been accepted.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.demand.is_cancelled()
    }

    pub(crate) fn requested(&self) -> u64 {
        self.demand.available()
    }

    /// Demand not yet covered by buffered items.
    pub(crate) fn room(&self) -> u64 {
        let queued = lock(&self.queue).len() as u64;
        self.demand.available().saturating_sub(queued)
    }

    fn terminate(&self, terminal: Terminal) {
        {
            let mut slot = lock(&self.terminal);
            if slot.is_some() || self.is_closed() {
                return;
            }
            *slot = Some(terminal);
            self.closed.store(true, Ordering::Release);
        }
        self.drain();
    }

    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            self.deliver();
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn deliver(&self) {
        let current = std::mem::replace(&mut *lock(&self.slot), Slot::Done);
        let mut subscriber = match current {
            Slot::Active(subscriber) => subscriber,
            Slot::Done => return,
            Slot::Pending => {
                let incoming = lock(&self.incoming).take();
                match incoming {
                    Some((mut subscriber, subscription)) => {
                        subscriber.on_subscribe(subscription);
                        subscriber
                    }
                    None => {
                        *lock(&self.slot) = Slot::Pending;
                        return;
                    }
                }
            }
        };

        loop {
            if self.demand.is_cancelled() {
                lock(&self.queue).clear();
                return;
            }

            let failure = {
                let mut terminal = lock(&self.terminal);
                match terminal.take() {
                    Some(Terminal::Fail(error)) => Some(error),
                    other => {
                        *terminal = other;
                        None
                    }
                }
            };
            if let Some(error) = failure {
                lock(&self.queue).clear();
                subscriber.on_error(error);
                return;
            }

            if self.demand.available() > 0 {
                let next = lock(&self.queue).pop_front();
                if let Some(item) = next {
                    self.demand.try_consume();
                    subscriber.on_next(item);
                    continue;
                }
            }

            if lock(&self.queue).is_empty() {
                let terminal = lock(&self.terminal).take();
                match terminal {
                    Some(Terminal::Complete) => {
                        subscriber.on_complete();
                        return;
                    }
                    Some(Terminal::Error(error)) | Some(Terminal::Fail(error)) => {
                        subscriber.on_error(error);
                        return;
                    }
                    None => {}
                }
            }
            break;
        }

        *lock(&self.slot) = Slot::Active(subscriber);
    }
}

impl<T: Send + 'static> Upstream for Outlet<T> {
    fn request(&self, n: u64) {
        Outlet::request(self, n);
    }

    fn cancel(&self) {
        Outlet::cancel(self);
    }
}
