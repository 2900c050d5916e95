use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};
use tokio::runtime::Handle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::error::{StreamError, StreamResult};
use super::flux::{Flux, Publisher};
use super::outlet::Outlet;
use super::subscription::{lock, Arbiter, BoxSubscriber, Subscriber, Subscription, Upstream};

/// Shortest period accepted for repeating tasks.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

pub type Task = Box<dyn FnOnce() + Send>;
pub type RepeatingTask = Box<dyn FnMut() + Send>;

/// Cancels a scheduled task. A task that has not started yet will not run;
/// a repeating task stops before its next run.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Runs deferred and periodic work for time-based streams.
#[cfg_attr(test, mockall::automock)]
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, task: Task) -> TaskHandle;

    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle;
}

/// Scheduler backed by a tokio runtime. Tasks run on the runtime's workers.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        TokioScheduler { handle }
    }

    /// Uses the runtime of the calling context.
    pub fn current() -> StreamResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| StreamError::illegal_state(format!("no tokio runtime: {}", e)))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let guard = handle.clone();
        self.handle.spawn(async move {
            time::sleep(delay).await;
            if !guard.is_cancelled() {
                task();
            }
        });
        handle
    }

    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut task: RepeatingTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let guard = handle.clone();
        let period = period.max(MIN_PERIOD);
        self.handle.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if guard.is_cancelled() {
                    break;
                }
                task();
            }
        });
        handle
    }
}

enum Scheduled {
    Once(Task),
    Repeating(RepeatingTask, Duration),
}

struct Entry {
    task: Scheduled,
    handle: TaskHandle,
}

#[derive(Default)]
struct VirtualClock {
    now: Duration,
    sequence: u64,
    queue: BTreeMap<(Duration, u64), Entry>,
}

impl VirtualClock {
    fn insert(&mut self, at: Duration, entry: Entry) {
        self.sequence += 1;
        self.queue.insert((at, self.sequence), entry);
    }
}

/// Deterministic scheduler driven by [`VirtualScheduler::advance_by`].
///
/// Tasks due at the same instant run in the order they were scheduled.
#[derive(Default)]
pub struct VirtualScheduler {
    clock: Mutex<VirtualClock>,
}

impl VirtualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        lock(&self.clock).now
    }

    /// Number of tasks still waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.clock)
            .queue
            .values()
            .filter(|entry| !entry.handle.is_cancelled())
            .count()
    }

    /// Moves virtual time forward, running every task that falls due,
    /// including tasks scheduled by the tasks themselves.
    pub fn advance_by(&self, duration: Duration) {
        let target = lock(&self.clock).now + duration;
        loop {
            let due = {
                let mut clock = lock(&self.clock);
                let next = clock.queue.keys().next().copied();
                match next {
                    Some(key) if key.0 <= target => {
                        clock.now = key.0;
                        clock.queue.remove(&key).map(|entry| (key.0, entry))
                    }
                    _ => None,
                }
            };
            let Some((at, Entry { task, handle })) = due else {
                break;
            };
            if handle.is_cancelled() {
                continue;
            }
            match task {
                Scheduled::Once(task) => task(),
                Scheduled::Repeating(mut task, period) => {
                    task();
                    if !handle.is_cancelled() {
                        lock(&self.clock).insert(
                            at + period,
                            Entry {
                                task: Scheduled::Repeating(task, period),
                                handle,
                            },
                        );
                    }
                }
            }
        }
        lock(&self.clock).now = target;
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut clock = lock(&self.clock);
        let at = clock.now + delay;
        clock.insert(
            at,
            Entry {
                task: Scheduled::Once(task),
                handle: handle.clone(),
            },
        );
        handle
    }

    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let mut clock = lock(&self.clock);
        let at = clock.now + initial_delay;
        clock.insert(
            at,
            Entry {
                task: Scheduled::Repeating(task, period.max(MIN_PERIOD)),
                handle: handle.clone(),
            },
        );
        handle
    }
}

struct DelayedPublisher<T> {
    value: T,
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for DelayedPublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let outlet = Outlet::unbounded();
        outlet.attach(subscriber, Subscription::new(outlet.clone()));
        let emitter = outlet.clone();
        let value = self.value.clone();
        let task = self.scheduler.schedule_after(
            self.delay,
            Box::new(move || {
                emitter.push(value);
                emitter.complete();
            }),
        );
        outlet.on_cancel(move || task.cancel());
    }
}

struct IntervalPublisher {
    period: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl Publisher<u64> for IntervalPublisher {
    fn subscribe(&self, subscriber: BoxSubscriber<u64>) {
        let outlet = Outlet::unbounded();
        outlet.attach(subscriber, Subscription::new(outlet.clone()));
        let emitter = outlet.clone();
        let mut tick = 0u64;
        let task = self.scheduler.schedule_repeating(
            self.period,
            self.period,
            Box::new(move || {
                if emitter.room() > 0 {
                    emitter.push(tick);
                } else {
                    trace!(operator = "interval"; "No demand, dropping tick {}", tick);
                }
                tick += 1;
            }),
        );
        outlet.on_cancel(move || task.cancel());
    }
}

struct SubscribeOnPublisher<T> {
    source: Flux<T>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> Publisher<T> for SubscribeOnPublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let source = self.source.clone();
        self.scheduler.schedule_after(
            Duration::ZERO,
            Box::new(move || source.subscribe_boxed(subscriber)),
        );
    }
}

struct PublishOnPublisher<T> {
    source: Flux<T>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> Publisher<T> for PublishOnPublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let outlet = Outlet::unbounded();
        let upstream = Arc::new(Arbiter::new());
        let control = Arc::new(PublishOnControl {
            outlet: outlet.clone(),
            upstream: upstream.clone(),
            scheduler: self.scheduler.clone(),
        });
        outlet.attach(subscriber, Subscription::new(control));
        self.source.subscribe(PublishOnSubscriber {
            outlet,
            upstream,
            scheduler: self.scheduler.clone(),
        });
    }
}

/// Downstream side of `publish_on`: demand reaches the outlet through the
/// scheduler so the drain that follows runs there too.
struct PublishOnControl<T> {
    outlet: Arc<Outlet<T>>,
    upstream: Arc<Arbiter>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> Upstream for PublishOnControl<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
        let outlet = self.outlet.clone();
        self.scheduler
            .schedule_after(Duration::ZERO, Box::new(move || outlet.request(n)));
    }

    fn cancel(&self) {
        self.outlet.cancel();
        self.upstream.cancel();
    }
}

struct PublishOnSubscriber<T> {
    outlet: Arc<Outlet<T>>,
    upstream: Arc<Arbiter>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T: Send + 'static> PublishOnSubscriber<T> {
    fn hand_off(&self, step: impl FnOnce(&Outlet<T>) + Send + 'static) {
        let outlet = self.outlet.clone();
        self.scheduler
            .schedule_after(Duration::ZERO, Box::new(move || step(&*outlet)));
    }
}

impl<T: Send + 'static> Subscriber<T> for PublishOnSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.upstream.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        self.upstream.produced();
        if self.outlet.enqueue(item) {
            self.hand_off(Outlet::flush);
        }
    }

    fn on_error(&mut self, error: StreamError) {
        self.hand_off(move |outlet| outlet.error(error));
    }

    fn on_complete(&mut self) {
        self.hand_off(Outlet::complete);
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Emits `value` once `delay` has elapsed, then completes.
    pub fn delayed(value: T, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flux<T>
    where
        T: Clone + Sync,
    {
        Flux::from_publisher(DelayedPublisher {
            value,
            delay,
            scheduler,
        })
    }

    /// Delays each item by `delay`, one item at a time.
    pub fn delay_elements(self, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flux<T>
    where
        T: Clone + Sync,
    {
        self.concat_map(move |item| Flux::delayed(item, delay, scheduler.clone()))
    }

    /// Performs the subscription itself on `scheduler`.
    pub fn subscribe_on(self, scheduler: Arc<dyn Scheduler>) -> Flux<T> {
        debug!(operator = "subscribe_on"; "Deferring subscription to scheduler");
        Flux::from_publisher(SubscribeOnPublisher {
            source: self,
            scheduler,
        })
    }

    /// Delivers every signal from `scheduler` instead of the producing
    /// context. Items keep their order and wait in a buffer until delivered.
    pub fn publish_on(self, scheduler: Arc<dyn Scheduler>) -> Flux<T> {
        debug!(operator = "publish_on"; "Moving delivery to scheduler");
        Flux::from_publisher(PublishOnPublisher {
            source: self,
            scheduler,
        })
    }
}

impl Flux<u64> {
    /// Emits `0` after `delay`, then completes.
    pub fn timer(delay: Duration, scheduler: Arc<dyn Scheduler>) -> Flux<u64> {
        Flux::delayed(0, delay, scheduler)
    }

    /// Emits an increasing counter every `period`. Ticks that find no
    /// outstanding demand are dropped.
    pub fn interval(period: Duration, scheduler: Arc<dyn Scheduler>) -> Flux<u64> {
        Flux::from_publisher(IntervalPublisher { period, scheduler })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::signal::Signal;
    use crate::streaming::test_subscriber::TestSubscriber;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_virtual_scheduler_orders_by_due_time() {
        let scheduler = VirtualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("late", 30), ("early", 10), ("tie", 10)] {
            let order = order.clone();
            scheduler.schedule_after(
                Duration::from_millis(delay),
                Box::new(move || lock(&order).push(label)),
            );
        }
        scheduler.advance_by(Duration::from_millis(20));
        assert_eq!(*lock(&order), vec!["early", "tie"]);
        assert_eq!(scheduler.pending(), 1);
        scheduler.advance_by(Duration::from_millis(20));
        assert_eq!(*lock(&order), vec!["early", "tie", "late"]);
        assert_eq!(scheduler.now(), Duration::from_millis(40));
    }

    #[test]
    fn test_cancelled_repeating_task_stops() {
        let scheduler = VirtualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = scheduler.schedule_repeating(
            Duration::from_millis(5),
            Duration::from_millis(5),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        scheduler.advance_by(Duration::from_millis(12));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        handle.cancel();
        scheduler.advance_by(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_delayed_waits_for_virtual_time() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let flux = Flux::delayed("probe", Duration::from_millis(100), scheduler.clone());
        let probe = TestSubscriber::subscribe(&flux, 1);
        scheduler.advance_by(Duration::from_millis(99));
        assert!(probe.items().is_empty());
        scheduler.advance_by(Duration::from_millis(1));
        assert_eq!(probe.items(), vec!["probe"]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_interval_drops_ticks_without_demand() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let probe = TestSubscriber::subscribe(
            &Flux::interval(Duration::from_millis(10), scheduler.clone()),
            2,
        );
        scheduler.advance_by(Duration::from_millis(40));
        assert_eq!(probe.items(), vec![0, 1]);
        probe.request(1);
        scheduler.advance_by(Duration::from_millis(10));
        assert_eq!(probe.items(), vec![0, 1, 4]);
        probe.cancel();
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_mock_scheduler_receives_requested_delay() {
        let mut scheduler = MockScheduler::new();
        scheduler
            .expect_schedule_after()
            .withf(|delay, _| *delay == Duration::from_millis(250))
            .times(1)
            .returning(|_, task| {
                task();
                TaskHandle::new()
            });
        let flux = Flux::timer(Duration::from_millis(250), Arc::new(scheduler));
        let probe = TestSubscriber::subscribe(&flux, 1);
        assert_eq!(probe.items(), vec![0]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_delay_elements_spaces_items() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let flux = Flux::range(1, 3).delay_elements(Duration::from_millis(10), scheduler.clone());
        let probe = TestSubscriber::subscribe(&flux, u64::MAX);
        scheduler.advance_by(Duration::from_millis(15));
        assert_eq!(probe.items(), vec![1]);
        scheduler.advance_by(Duration::from_millis(15));
        assert_eq!(probe.items(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_subscribe_on_defers_subscription() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let flux = Flux::range(0, 3).subscribe_on(scheduler.clone());
        let observed = TestSubscriber::subscribe(&flux, u64::MAX);
        assert!(!observed.is_subscribed());
        assert_eq!(scheduler.pending(), 1);

        scheduler.advance_by(Duration::ZERO);
        assert!(observed.is_subscribed());
        assert_eq!(observed.items(), vec![0, 1, 2]);
        assert!(observed.is_complete());
    }

    #[test]
    fn test_publish_on_delivers_from_scheduler() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let flux = Flux::range(0, 3).publish_on(scheduler.clone());
        let observed = TestSubscriber::subscribe(&flux, 2);
        assert!(observed.is_subscribed());
        assert!(observed.items().is_empty());

        scheduler.advance_by(Duration::ZERO);
        assert_eq!(observed.items(), vec![0, 1]);
        assert!(!observed.is_terminated());

        observed.request(1);
        assert_eq!(observed.items(), vec![0, 1]);
        scheduler.advance_by(Duration::ZERO);
        assert_eq!(observed.items(), vec![0, 1, 2]);
        assert!(observed.is_complete());
        assert!(observed.violations().is_empty());
    }

    #[test]
    fn test_publish_on_keeps_error_after_items() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let flux = Flux::range(0, 2)
            .concat_map(|n| {
                if n == 1 {
                    Flux::error(StreamError::upstream("sensor lost"))
                } else {
                    Flux::just(n)
                }
            })
            .publish_on(scheduler.clone());
        let observed = TestSubscriber::subscribe(&flux, u64::MAX);
        assert!(observed.signals().is_empty());
        scheduler.advance_by(Duration::ZERO);
        assert_eq!(
            observed.signals(),
            vec![
                Signal::Next(0),
                Signal::Error(StreamError::upstream("sensor lost")),
            ]
        );
    }

    #[test]
    fn test_publish_on_cancel_stops_delivery() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let flux = Flux::range(0, 3).publish_on(scheduler.clone());
        let observed = TestSubscriber::subscribe(&flux, u64::MAX);
        observed.cancel();
        scheduler.advance_by(Duration::ZERO);
        assert!(observed.signals().is_empty());
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_delayed_value() {
        let scheduler = Arc::new(TokioScheduler::current().expect("inside a runtime"));
        let probe = TestSubscriber::subscribe(
            &Flux::delayed(42, Duration::from_millis(10), scheduler),
            1,
        );
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.items(), vec![42]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_tokio_scheduler_needs_runtime() {
        assert!(matches!(
            TokioScheduler::current(),
            Err(StreamError::IllegalState { .. })
        ));
    }
}
