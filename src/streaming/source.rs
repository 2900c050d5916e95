use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::error::{StreamError, StreamResult};
use super::flux::{Flux, Publisher};
use super::outlet::Outlet;
use super::subscription::{lock, BoxSubscriber, Subscription, Upstream};
use crate::config::{BufferPolicy, CreateConfig};

/// Emission handle passed to a `generate` step.
///
/// A step may call `next` at most once, may call `complete` or `error` to
/// end the stream, and may also do nothing, in which case it runs again.
pub struct GenerateSink<T> {
    item: Option<T>,
    completed: bool,
    error: Option<StreamError>,
}

impl<T> GenerateSink<T> {
    fn new() -> Self {
        GenerateSink {
            item: None,
            completed: false,
            error: None,
        }
    }

    pub fn next(&mut self, item: T) {
        if self.item.is_some() {
            if self.error.is_none() {
                self.error = Some(StreamError::illegal_state(
                    "generator called next more than once in a single step",
                ));
            }
            return;
        }
        self.item = Some(item);
    }

    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn error(&mut self, error: StreamError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

type Seed<S> = Arc<dyn Fn() -> S + Send + Sync>;
type Step<S, T> = Arc<dyn Fn(S, &mut GenerateSink<T>) -> StreamResult<S> + Send + Sync>;

struct GeneratePublisher<S, T> {
    seed: Seed<S>,
    step: Step<S, T>,
}

/// Per-subscription generator. The state is owned here and only touched
/// inside `produce`, which a work-in-progress counter keeps single-threaded.
struct Generator<S, T> {
    outlet: Arc<Outlet<T>>,
    state: Mutex<Option<S>>,
    step: Step<S, T>,
    wip: AtomicUsize,
    attached: AtomicBool,
    done: AtomicBool,
}

impl<S, T> Publisher<T> for GeneratePublisher<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let generator = Arc::new(Generator {
            outlet: Outlet::unbounded(),
            state: Mutex::new(Some((self.seed)())),
            step: self.step.clone(),
            wip: AtomicUsize::new(0),
            attached: AtomicBool::new(false),
            done: AtomicBool::new(false),
        });
        generator
            .outlet
            .attach(subscriber, Subscription::new(generator.clone()));
        generator.attached.store(true, Ordering::Release);
        generator.produce();
    }
}

impl<S, T> Generator<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn produce(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            while !self.done.load(Ordering::Acquire)
                && !self.outlet.is_cancelled()
                && self.outlet.room() > 0
            {
                let Some(state) = lock(&self.state).take() else {
                    break;
                };
                let mut sink = GenerateSink::new();
                match (self.step)(state, &mut sink) {
                    Ok(next_state) => *lock(&self.state) = Some(next_state),
                    Err(error) => sink.error(error),
                }
                let GenerateSink {
                    item,
                    completed,
                    error,
                } = sink;
                if let Some(item) = item {
                    self.outlet.push(item);
                }
                if let Some(error) = error {
                    self.done.store(true, Ordering::Release);
                    self.outlet.error(error);
                } else if completed {
                    self.done.store(true, Ordering::Release);
                    self.outlet.complete();
                }
            }
            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                break;
            }
        }
    }
}

impl<S, T> Upstream for Generator<S, T>
where
    S: Send + 'static,
    T: Send + 'static,
{
    fn request(&self, n: u64) {
        self.outlet.request(n);
        if self.attached.load(Ordering::Acquire) {
            self.produce();
        }
    }

    fn cancel(&self) {
        self.outlet.cancel();
    }
}

/// Emission handle passed to a `create` callback.
///
/// It may be moved to other threads and used at any time; emissions beyond
/// outstanding demand are buffered according to the source's [`BufferPolicy`].
pub struct FluxSink<T> {
    outlet: Arc<Outlet<T>>,
}

impl<T> Clone for FluxSink<T> {
    fn clone(&self) -> Self {
        FluxSink {
            outlet: self.outlet.clone(),
        }
    }
}

impl<T: Send + 'static> FluxSink<T> {
    /// Emits an item. Returns false if it was dropped because the stream is
    /// cancelled, already terminated, or its buffer is full.
    pub fn next(&self, item: T) -> bool {
        self.outlet.push(item)
    }

    pub fn complete(&self) {
        self.outlet.complete();
    }

    pub fn error(&self, error: StreamError) {
        self.outlet.error(error);
    }

    pub fn is_cancelled(&self) -> bool {
        self.outlet.is_cancelled()
    }

    /// Outstanding downstream demand.
    pub fn requested(&self) -> u64 {
        self.outlet.requested()
    }

    /// Registers cleanup for when downstream cancels.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        self.outlet.on_cancel(hook);
    }
}

type Emitter<T> = Arc<dyn Fn(FluxSink<T>) + Send + Sync>;

struct CreatePublisher<T> {
    emitter: Emitter<T>,
    buffer: BufferPolicy,
}

impl<T: Send + 'static> Publisher<T> for CreatePublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let outlet = Outlet::new(self.buffer);
        outlet.attach(subscriber, Subscription::new(outlet.clone()));
        (self.emitter)(FluxSink { outlet });
    }
}

enum Fixed {
    Empty,
    Error(StreamError),
    Never,
}

struct FixedPublisher<T> {
    kind: Fixed,
    _item: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Publisher<T> for FixedPublisher<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let outlet = Outlet::unbounded();
        outlet.attach(subscriber, Subscription::new(outlet.clone()));
        match &self.kind {
            Fixed::Empty => outlet.complete(),
            Fixed::Error(error) => outlet.error(error.clone()),
            Fixed::Never => {}
        }
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Creates a pull-based source from a per-subscription state machine.
    ///
    /// # Arguments
    /// * `seed` - produces the initial state, once per subscription
    /// * `step` - runs once per unit of granted demand with the current state
    ///   and returns the next one; an `Err` terminates the stream with that error
    ///
    /// No step runs after the stream completes or errors.
    pub fn generate<S, I, F>(seed: I, step: F) -> Self
    where
        S: Send + 'static,
        I: Fn() -> S + Send + Sync + 'static,
        F: Fn(S, &mut GenerateSink<T>) -> StreamResult<S> + Send + Sync + 'static,
    {
        Flux::from_publisher(GeneratePublisher {
            seed: Arc::new(seed),
            step: Arc::new(step),
        })
    }

    /// Creates a push-based source. `emitter` is called once per subscription
    /// with a [`FluxSink`] that external code drives; excess emissions are
    /// buffered without bound.
    pub fn create<F>(emitter: F) -> Self
    where
        F: Fn(FluxSink<T>) + Send + Sync + 'static,
    {
        Self::create_with(BufferPolicy::Unbounded, emitter)
    }

    /// Like [`Flux::create`] with an explicit buffering policy.
    pub fn create_with<F>(buffer: BufferPolicy, emitter: F) -> Self
    where
        F: Fn(FluxSink<T>) + Send + Sync + 'static,
    {
        Flux::from_publisher(CreatePublisher {
            emitter: Arc::new(emitter),
            buffer,
        })
    }

    /// Like [`Flux::create`], buffering as the `[create]` section says.
    pub fn create_from_config<F>(config: &CreateConfig, emitter: F) -> Self
    where
        F: Fn(FluxSink<T>) + Send + Sync + 'static,
    {
        Self::create_with(config.buffer, emitter)
    }

    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Flux::generate(
            move || items.clone().into_iter().peekable(),
            |mut iter, sink| {
                match iter.next() {
                    Some(item) => {
                        sink.next(item);
                        if iter.peek().is_none() {
                            sink.complete();
                        }
                    }
                    None => sink.complete(),
                }
                Ok(iter)
            },
        )
    }

    pub fn just(item: T) -> Self
    where
        T: Clone + Sync,
    {
        Flux::from_iter(vec![item])
    }

    pub fn empty() -> Self {
        Flux::from_publisher(FixedPublisher {
            kind: Fixed::Empty,
            _item: PhantomData,
        })
    }

    pub fn error(error: StreamError) -> Self {
        Flux::from_publisher(FixedPublisher {
            kind: Fixed::Error(error),
            _item: PhantomData,
        })
    }

    /// A stream that never signals anything after `on_subscribe`.
    pub fn never() -> Self {
        Flux::from_publisher(FixedPublisher {
            kind: Fixed::Never,
            _item: PhantomData,
        })
    }
}

impl Flux<i64> {
    /// Emits `count` consecutive integers starting at `start`.
    pub fn range(start: i64, count: u64) -> Self {
        if count == 0 {
            return Flux::empty();
        }
        Flux::generate(
            move || (start, count),
            |(next, remaining), sink| {
                sink.next(next);
                if remaining == 1 {
                    sink.complete();
                }
                Ok((next.wrapping_add(1), remaining - 1))
            },
        )
    }
}
