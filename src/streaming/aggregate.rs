use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::StreamError;
use super::flux::{Flux, Publisher};
use super::outlet::Outlet;
use super::subscription::{Arbiter, BoxSubscriber, Subscriber, Subscription, Upstream, UNBOUNDED};

/// Outcome of folding one item into an accumulator.
enum Fold<A> {
    Continue(A),
    /// The result is known; upstream is cancelled and the value emitted.
    Done(A),
}

type Init<A> = Arc<dyn Fn() -> A + Send + Sync>;
type Step<A, T> = Arc<dyn Fn(A, T) -> Fold<A> + Send + Sync>;
type Finish<A, R> = Arc<dyn Fn(A) -> Option<R> + Send + Sync>;

struct AggregatePublisher<T, A, R> {
    source: Flux<T>,
    init: Init<A>,
    step: Step<A, T>,
    finish: Finish<A, R>,
}

struct AggregateState<R> {
    outlet: Arc<Outlet<R>>,
    upstream: Arbiter,
    requested: AtomicBool,
}

impl<R: Send + 'static> Upstream for AggregateState<R> {
    fn request(&self, n: u64) {
        self.outlet.request(n);
        if !self.requested.swap(true, Ordering::AcqRel) {
            self.upstream.request(UNBOUNDED);
        }
    }

    fn cancel(&self) {
        self.outlet.cancel();
        self.upstream.cancel();
    }
}

impl<T, A, R> Publisher<R> for AggregatePublisher<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    fn subscribe(&self, downstream: BoxSubscriber<R>) {
        let state = Arc::new(AggregateState {
            outlet: Outlet::unbounded(),
            upstream: Arbiter::new(),
            requested: AtomicBool::new(false),
        });
        state
            .outlet
            .attach(downstream, Subscription::new(state.clone()));
        self.source.subscribe(AggregateSubscriber {
            state,
            acc: Some((self.init)()),
            step: self.step.clone(),
            finish: self.finish.clone(),
        });
    }
}

struct AggregateSubscriber<T, A, R> {
    state: Arc<AggregateState<R>>,
    acc: Option<A>,
    step: Step<A, T>,
    finish: Finish<A, R>,
}

impl<T, A, R> AggregateSubscriber<T, A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn emit(&mut self) {
        if let Some(acc) = self.acc.take() {
            if let Some(result) = (self.finish)(acc) {
                self.state.outlet.push(result);
            }
            self.state.outlet.complete();
        }
    }
}

impl<T, A, R> Subscriber<T> for AggregateSubscriber<T, A, R>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.state.upstream.set(subscription);
    }

    fn on_next(&mut self, item: T) {
        let Some(acc) = self.acc.take() else {
            return;
        };
        match (self.step)(acc, item) {
            Fold::Continue(acc) => self.acc = Some(acc),
            Fold::Done(acc) => {
                self.acc = Some(acc);
                self.state.upstream.cancel();
                self.emit();
            }
        }
    }

    fn on_error(&mut self, error: StreamError) {
        if self.acc.take().is_some() {
            self.state.outlet.error(error);
        }
    }

    fn on_complete(&mut self) {
        self.emit();
    }
}

impl<T: Send + 'static> Flux<T> {
    fn aggregate<A, R>(self, init: Init<A>, step: Step<A, T>, finish: Finish<A, R>) -> Flux<R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        Flux::from_publisher(AggregatePublisher {
            source: self,
            init,
            step,
            finish,
        })
    }

    /// Combines all items pairwise with `reducer` and emits the result when
    /// the source completes. An empty source completes without a value.
    pub fn reduce<F>(self, reducer: F) -> Flux<T>
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        self.aggregate::<Option<T>, T>(
            Arc::new(|| None),
            Arc::new(move |acc: Option<T>, item: T| {
                Fold::Continue(Some(match acc {
                    Some(acc) => reducer(acc, item),
                    None => item,
                }))
            }),
            Arc::new(|acc: Option<T>| acc),
        )
    }

    /// Folds all items into `initial` and emits the result on completion.
    pub fn fold<A, F>(self, initial: A, folder: F) -> Flux<A>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        self.aggregate::<A, A>(
            Arc::new(move || initial.clone()),
            Arc::new(move |acc: A, item: T| Fold::Continue(folder(acc, item))),
            Arc::new(|acc: A| Some(acc)),
        )
    }

    pub fn count(self) -> Flux<u64> {
        self.fold(0u64, |count, _| count + 1)
    }

    pub fn collect_list(self) -> Flux<Vec<T>> {
        self.aggregate::<Vec<T>, Vec<T>>(
            Arc::new(Vec::<T>::new),
            Arc::new(|mut items: Vec<T>, item: T| {
                items.push(item);
                Fold::Continue(items)
            }),
            Arc::new(|items: Vec<T>| Some(items)),
        )
    }

    /// Emits true as soon as an item matches, cancelling the source.
    pub fn any<P>(self, predicate: P) -> Flux<bool>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.aggregate::<bool, bool>(
            Arc::new(|| false),
            Arc::new(move |_: bool, item: T| {
                if predicate(&item) {
                    Fold::Done(true)
                } else {
                    Fold::Continue(false)
                }
            }),
            Arc::new(|verdict: bool| Some(verdict)),
        )
    }

    /// Emits false as soon as an item fails the predicate, cancelling the source.
    pub fn all<P>(self, predicate: P) -> Flux<bool>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.aggregate::<bool, bool>(
            Arc::new(|| true),
            Arc::new(move |_: bool, item: T| {
                if predicate(&item) {
                    Fold::Continue(true)
                } else {
                    Fold::Done(false)
                }
            }),
            Arc::new(|verdict: bool| Some(verdict)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::test_subscriber::TestSubscriber;

    #[test]
    fn test_reduce_sums() {
        let probe = TestSubscriber::subscribe(&Flux::range(1, 4).reduce(|a, b| a + b), 1);
        assert_eq!(probe.items(), vec![10]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_reduce_of_empty_completes_without_value() {
        let probe = TestSubscriber::subscribe(&Flux::<i64>::empty().reduce(|a, b| a + b), 1);
        assert!(probe.items().is_empty());
        assert!(probe.is_complete());
    }

    #[test]
    fn test_count_and_collect() {
        let count = TestSubscriber::subscribe(&Flux::range(0, 7).count(), 1);
        assert_eq!(count.items(), vec![7]);
        let list = TestSubscriber::subscribe(&Flux::range(0, 3).collect_list(), 1);
        assert_eq!(list.items(), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_any_short_circuits_infinite_source() {
        let flux = Flux::generate(|| 0u64, |n, sink| {
            sink.next(n);
            Ok(n + 1)
        })
        .any(|n| *n == 5);
        let probe = TestSubscriber::subscribe(&flux, 1);
        assert_eq!(probe.items(), vec![true]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_all_on_mixed_values() {
        let probe = TestSubscriber::subscribe(&Flux::range(0, 5).all(|n| *n < 3), 1);
        assert_eq!(probe.items(), vec![false]);
    }

    #[test]
    fn test_aggregate_error_propagates() {
        let flux = Flux::<i64>::error(StreamError::upstream("lost")).count();
        let probe = TestSubscriber::subscribe(&flux, 1);
        assert_eq!(probe.error(), Some(StreamError::upstream("lost")));
    }
}
