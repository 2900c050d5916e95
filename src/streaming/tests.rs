/// End-to-end pipeline tests for the streaming module
use super::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn basket() -> Vec<&'static str> {
    vec!["kiwi", "orange", "lemon", "orange", "lemon", "kiwi"]
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = count.clone();
    (count, move || {
        hook.fetch_add(1, Ordering::SeqCst);
    })
}

#[cfg(test)]
mod source_tests {
    use super::*;

    #[test]
    fn test_generate_stops_stepping_after_complete() {
        const K: u32 = 5;
        let steps = Arc::new(AtomicUsize::new(0));
        let seen = steps.clone();
        let flux = Flux::generate(
            || 0u32,
            move |state, sink| {
                seen.fetch_add(1, Ordering::SeqCst);
                if state == K {
                    sink.complete();
                } else {
                    sink.next(state);
                }
                Ok(state + 1)
            },
        );

        let probe = TestSubscriber::subscribe(&flux, 100);
        assert_eq!(probe.items(), vec![0, 1, 2, 3, 4]);
        assert!(probe.is_complete());
        assert_eq!(steps.load(Ordering::SeqCst), K as usize + 1);

        probe.request(10);
        assert_eq!(steps.load(Ordering::SeqCst), K as usize + 1);
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn test_generate_follows_demand() {
        let probe = TestSubscriber::subscribe(&Flux::range(0, 1_000), 2);
        assert_eq!(probe.items(), vec![0, 1]);
        probe.request(3);
        assert_eq!(probe.items(), vec![0, 1, 2, 3, 4]);
        assert!(!probe.is_terminated());
    }

    #[test]
    fn test_generate_fault_terminates() {
        let flux = Flux::generate(
            || 0i64,
            |state, sink| {
                if state == 2 {
                    return Err(StreamError::generator("sensor unplugged"));
                }
                sink.next(state);
                Ok(state + 1)
            },
        );
        let probe = TestSubscriber::subscribe(&flux, UNBOUNDED);
        assert_eq!(probe.items(), vec![0, 1]);
        assert_eq!(probe.error(), Some(StreamError::generator("sensor unplugged")));
    }

    #[test]
    fn test_create_buffers_until_requested() {
        let sinks = Arc::new(Mutex::new(Vec::new()));
        let registry = sinks.clone();
        let flux = Flux::create(move |sink| registry.lock().unwrap().push(sink));

        let probe = TestSubscriber::subscribe(&flux, 0);
        let sink: FluxSink<i32> = sinks.lock().unwrap()[0].clone();
        for item in 1..=3 {
            assert!(sink.next(item));
        }
        assert_eq!(probe.item_count(), 0);

        probe.request(2);
        assert_eq!(probe.items(), vec![1, 2]);
        sink.complete();
        assert!(!probe.is_complete());
        probe.request(1);
        assert_eq!(probe.items(), vec![1, 2, 3]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_create_drop_oldest_keeps_newest_items() {
        let sinks = Arc::new(Mutex::new(Vec::new()));
        let registry = sinks.clone();
        let flux = Flux::create_with(crate::config::BufferPolicy::DropOldest(2), move |sink| {
            registry.lock().unwrap().push(sink)
        });

        let probe = TestSubscriber::subscribe(&flux, 0);
        let sink: FluxSink<i32> = sinks.lock().unwrap()[0].clone();
        for item in 1..=4 {
            sink.next(item);
        }
        probe.request(10);
        assert_eq!(probe.items(), vec![3, 4]);
    }

    #[test]
    fn test_create_from_config_uses_buffer_policy() {
        let config = crate::config::RivuletConfig::from_toml_str(
            "[create]\nbuffer = { drop_latest = 2 }\n",
        )
        .unwrap();
        let sinks = Arc::new(Mutex::new(Vec::new()));
        let registry = sinks.clone();
        let flux = Flux::create_from_config(&config.create, move |sink| {
            registry.lock().unwrap().push(sink)
        });

        let observed = TestSubscriber::subscribe(&flux, 0);
        let sink: FluxSink<i32> = sinks.lock().unwrap()[0].clone();
        assert!(sink.next(1));
        assert!(sink.next(2));
        assert!(!sink.next(3));
        observed.request(10);
        assert_eq!(observed.items(), vec![1, 2]);
    }

    #[test]
    fn test_create_sink_reports_cancellation() {
        let sinks = Arc::new(Mutex::new(Vec::new()));
        let registry = sinks.clone();
        let flux = Flux::create(move |sink| registry.lock().unwrap().push(sink));
        let (cleanups, cleanup) = counter();

        let probe = TestSubscriber::subscribe(&flux, 1);
        let sink: FluxSink<i32> = sinks.lock().unwrap()[0].clone();
        sink.on_cancel(cleanup);
        probe.cancel();
        assert!(sink.is_cancelled());
        assert!(!sink.next(1));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod flow_tests {
    use super::*;

    #[test]
    fn test_filter_compensates_demand() {
        let requested = Arc::new(AtomicU64::new(0));
        let total = requested.clone();
        let flux = Flux::range(0, 100)
            .do_on_request(move |n| {
                total.fetch_add(n, Ordering::SeqCst);
            })
            .filter(|n: &i64| n % 3 == 0);

        let probe = TestSubscriber::subscribe(&flux, 4);
        assert_eq!(probe.items(), vec![0, 3, 6, 9]);
        // Ten upstream items were needed for four matches.
        assert!(requested.load(Ordering::SeqCst) >= 10);
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn test_distinct_keeps_first_seen_order() {
        let flux = Flux::from_iter(basket()).distinct();
        let probe = TestSubscriber::subscribe(&flux, UNBOUNDED);
        assert_eq!(probe.items(), vec!["kiwi", "orange", "lemon"]);
        assert!(probe.is_complete());
    }

    #[test]
    fn test_map_fault_cancels_source() {
        let (cancels, on_cancel) = counter();
        let flux = Flux::range(0, 10)
            .do_on_cancel(on_cancel)
            .try_map(|n: i64| {
                if n == 2 {
                    Err(StreamError::transform("reading out of range"))
                } else {
                    Ok(n * 10)
                }
            });
        let probe = TestSubscriber::subscribe(&flux, UNBOUNDED);
        assert_eq!(probe.items(), vec![0, 10]);
        assert_eq!(probe.error(), Some(StreamError::transform("reading out of range")));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod compose_tests {
    use super::*;

    #[test]
    fn test_zip_stops_at_shorter_side() {
        let words = Flux::from_iter(vec!["a", "bc", "def", "wxyz"]);
        let numbers = Flux::from_iter(vec![1, 2]);
        let probe = TestSubscriber::subscribe(&words.zip(numbers), UNBOUNDED);
        assert_eq!(
            probe.signals(),
            vec![
                Signal::Next(("a", 1)),
                Signal::Next(("bc", 2)),
                Signal::Complete,
            ]
        );
    }

    #[test]
    fn test_flat_map_never_outruns_demand() {
        let flux = Flux::range(1, 3).flat_map(|n: i64| Flux::range(0, n as u64));
        let probe = TestSubscriber::subscribe(&flux, 2);
        assert_eq!(probe.items(), vec![0, 0]);
        probe.request(10);
        assert_eq!(probe.items(), vec![0, 0, 1, 0, 1, 2]);
        assert!(probe.is_complete());
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn test_merge_error_cancels_other_sources() {
        let (cancels, on_cancel) = counter();
        let healthy = Flux::<i64>::never().do_on_cancel(on_cancel);
        let broken = Flux::error(StreamError::upstream("probe offline"));
        let probe = TestSubscriber::subscribe(&healthy.merge_with(broken), UNBOUNDED);
        assert_eq!(probe.error(), Some(StreamError::upstream("probe offline")));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod group_tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct FruitInfo {
        distinct: Vec<&'static str>,
        counts: HashMap<String, u64>,
    }

    impl FruitInfo {
        fn new(distinct: Vec<&'static str>, counts: &[(&str, u64)]) -> Self {
            FruitInfo {
                distinct,
                counts: counts
                    .iter()
                    .map(|(fruit, count)| (fruit.to_string(), *count))
                    .collect(),
            }
        }
    }

    fn baskets() -> Vec<Vec<&'static str>> {
        vec![
            basket(),
            vec!["banana", "lemon", "lemon", "kiwi"],
            vec!["strawberry", "orange", "lemon", "grape", "strawberry"],
        ]
    }

    fn expected() -> Vec<FruitInfo> {
        vec![
            FruitInfo::new(
                vec!["kiwi", "orange", "lemon"],
                &[("kiwi", 2), ("orange", 2), ("lemon", 2)],
            ),
            FruitInfo::new(
                vec!["banana", "lemon", "kiwi"],
                &[("banana", 1), ("lemon", 2), ("kiwi", 1)],
            ),
            FruitInfo::new(
                vec!["strawberry", "orange", "lemon", "grape"],
                &[("strawberry", 2), ("orange", 1), ("lemon", 1), ("grape", 1)],
            ),
        ]
    }

    /// One single-entry map per group, merged with later entries winning.
    fn count_by_fruit(fruits: Flux<&'static str>) -> Flux<HashMap<String, u64>> {
        fruits
            .group_by(|fruit: &&'static str| fruit.to_string())
            .concat_map(|group: GroupedFlux<String, &'static str>| {
                let key = group.key().clone();
                group
                    .into_flux()
                    .count()
                    .map(move |count: u64| HashMap::from([(key.clone(), count)]))
            })
            .reduce(|mut merged, current| {
                merged.extend(current);
                merged
            })
    }

    fn fruit_info(distinct: Flux<&'static str>, counted: Flux<&'static str>) -> Flux<FruitInfo> {
        distinct
            .distinct()
            .collect_list()
            .zip_with(count_by_fruit(counted), |distinct, counts| FruitInfo {
                distinct,
                counts,
            })
    }

    #[test]
    fn test_group_by_count_reduced_into_map() {
        let observed = TestSubscriber::subscribe(&count_by_fruit(Flux::from_iter(basket())), UNBOUNDED);
        let expected: HashMap<String, u64> = [("kiwi", 2), ("orange", 2), ("lemon", 2)]
            .into_iter()
            .map(|(fruit, count)| (fruit.to_string(), count))
            .collect();
        assert_eq!(
            observed.signals(),
            vec![Signal::Next(expected), Signal::Complete]
        );
    }

    #[test]
    fn test_reduce_keeps_latest_entry_per_key() {
        let flux = Flux::from_iter(vec![("lemon", 1u64), ("kiwi", 4), ("lemon", 3)])
            .map(|(fruit, count)| HashMap::from([(fruit.to_string(), count)]))
            .reduce(|mut merged, current| {
                merged.extend(current);
                merged
            });
        let observed = TestSubscriber::subscribe(&flux, UNBOUNDED);
        let merged = observed.items().pop().unwrap_or_default();
        assert_eq!(merged.get("lemon"), Some(&3));
        assert_eq!(merged.get("kiwi"), Some(&4));
        assert!(observed.is_complete());
    }

    #[test]
    fn test_fruit_info_per_basket() {
        let flux = Flux::from_iter(baskets()).concat_map(|basket: Vec<&'static str>| {
            fruit_info(Flux::from_iter(basket.clone()), Flux::from_iter(basket))
        });
        let observed = TestSubscriber::subscribe(&flux, UNBOUNDED);
        let mut expected: Vec<Signal<FruitInfo>> =
            expected().into_iter().map(Signal::Next).collect();
        expected.push(Signal::Complete);
        assert_eq!(observed.signals(), expected);
        assert!(observed.violations().is_empty());
    }

    #[test]
    fn test_fruit_info_from_shared_basket() {
        let flux = Flux::from_iter(baskets()).concat_map(|basket: Vec<&'static str>| {
            let source = Flux::from_iter(basket).broadcast(2).flux();
            fruit_info(source.clone(), source)
        });
        let observed = TestSubscriber::subscribe(&flux, UNBOUNDED);
        let mut expected: Vec<Signal<FruitInfo>> =
            expected().into_iter().map(Signal::Next).collect();
        expected.push(Signal::Complete);
        assert_eq!(observed.signals(), expected);
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;

    #[test]
    fn test_on_error_return_substitutes_and_completes() {
        let flux = Flux::from_iter(vec!["a", "bc", "def", "wxyz"])
            .try_map(|word: &str| {
                if word.len() == 3 {
                    Err(StreamError::transform(format!("bad length: {}", word)))
                } else {
                    Ok(word.to_string())
                }
            })
            .on_error_return("-2".to_string());

        let probe = TestSubscriber::subscribe(&flux, UNBOUNDED);
        assert_eq!(
            probe.signals(),
            vec![
                Signal::Next("a".to_string()),
                Signal::Next("bc".to_string()),
                Signal::Next("-2".to_string()),
                Signal::Complete,
            ]
        );
    }

    #[test]
    fn test_retry_when_delivers_companion_error() {
        let (attempts, on_subscribe) = counter();
        let flux = Flux::<i64>::error(StreamError::upstream("flaky"))
            .do_on_subscribe(on_subscribe)
            .retry_when(|errors| {
                errors
                    .index()
                    .concat_map(|(attempt, _): (u64, StreamError)| {
                        if attempt < 2 {
                            Flux::just(attempt)
                        } else {
                            Flux::error(StreamError::upstream("companion error"))
                        }
                    })
            });

        let probe = TestSubscriber::subscribe(&flux, UNBOUNDED);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(probe.error(), Some(StreamError::upstream("companion error")));
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn test_retry_backoff_waits_between_attempts() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let (attempts, on_subscribe) = counter();
        let flux = Flux::<i64>::error(StreamError::upstream("flaky"))
            .do_on_subscribe(on_subscribe)
            .retry_backoff(2, Duration::from_millis(10), scheduler.clone());

        let probe = TestSubscriber::subscribe(&flux, UNBOUNDED);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        scheduler.advance_by(Duration::from_millis(10));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        scheduler.advance_by(Duration::from_millis(19));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        scheduler.advance_by(Duration::from_millis(1));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            probe.error(),
            Some(StreamError::retry_exhausted(
                3,
                StreamError::upstream("flaky")
            ))
        );
    }
}

#[cfg(test)]
mod hub_tests {
    use super::*;

    #[test]
    fn test_source_idle_without_subscribers() {
        let (connects, on_subscribe) = counter();
        let hub = Flux::<i64>::never().do_on_subscribe(on_subscribe).broadcast(1);
        assert!(!hub.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 0);

        let _probe = TestSubscriber::subscribe(&hub.flux(), 1);
        assert!(hub.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_last_cancel_disconnects_once() {
        let (disconnects, on_cancel) = counter();
        let hub = Flux::<i64>::never().do_on_cancel(on_cancel).broadcast(1);
        let first = TestSubscriber::subscribe(&hub.flux(), 1);
        let second = TestSubscriber::subscribe(&hub.flux(), 1);
        assert_eq!(hub.connection_count(), 1);

        first.cancel();
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        second.cancel();
        second.cancel();
        first.cancel();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!hub.is_connected());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_min_subscribers_gate_first_connection() {
        let hub = Flux::<i64>::never().broadcast(2);
        let first = TestSubscriber::subscribe(&hub.flux(), 1);
        assert!(!hub.is_connected());
        let second = TestSubscriber::subscribe(&hub.flux(), 1);
        assert!(hub.is_connected());

        // Reconnection after everyone left needs a single subscriber.
        first.cancel();
        second.cancel();
        let _third = TestSubscriber::subscribe(&hub.flux(), 1);
        assert!(hub.is_connected());
        assert_eq!(hub.connection_count(), 2);
    }

    #[test]
    fn test_shared_interval_fans_out() {
        let scheduler = Arc::new(VirtualScheduler::new());
        let ticks = Flux::interval(Duration::from_millis(10), scheduler.clone()).share();
        let slow = TestSubscriber::subscribe(&ticks, 2);
        let fast = TestSubscriber::subscribe(&ticks, UNBOUNDED);

        scheduler.advance_by(Duration::from_millis(50));
        assert_eq!(slow.items(), vec![0, 1]);
        assert_eq!(fast.items(), vec![0, 1, 2, 3, 4]);

        slow.cancel();
        fast.cancel();
        assert_eq!(scheduler.pending(), 0);
    }
}

#[cfg(test)]
mod demand_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn delivered_never_exceeds_requested(
            length in 0u64..40,
            requests in proptest::collection::vec(1u64..6, 0..12),
        ) {
            let flux = Flux::range(0, length)
                .filter(|n: &i64| n % 2 == 0)
                .concat_map(|n: i64| Flux::range(n, 2))
                .map(|n: i64| n * 10);
            let probe = TestSubscriber::subscribe(&flux, 0);
            for n in requests {
                probe.request(n);
                prop_assert!(probe.item_count() as u64 <= probe.requested());
            }
            prop_assert!(probe.violations().is_empty());
        }
    }
}
