use log::{debug, warn};
use tokio::sync::mpsc;

use super::error::{ForwardError, SinkError, StreamError};
use super::flux::Flux;
use super::signal::Signal;
use super::subscription::{Subscriber, Subscription};
use crate::config::SinkConfig;

/// Asynchronous consumer at the edge of a pipeline, such as a network
/// connection pushing events to a remote client.
#[trait_variant::make(SignalSink: Send)]
pub trait LocalSignalSink<T> {
    /// Accepts one item. An error stops forwarding and cancels the stream.
    async fn send(&mut self, item: T) -> Result<(), SinkError>;

    /// Called once when the stream ends, with its outcome.
    async fn finish(&mut self, outcome: Result<(), StreamError>);
}

enum Event<T> {
    Subscribed(Subscription),
    Signal(Signal<T>),
}

struct ChannelSubscriber<T> {
    events: mpsc::UnboundedSender<Event<T>>,
}

impl<T: Send> Subscriber<T> for ChannelSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        if let Err(mpsc::error::SendError(Event::Subscribed(subscription))) =
            self.events.send(Event::Subscribed(subscription))
        {
            subscription.cancel();
        }
    }

    fn on_next(&mut self, item: T) {
        let _ = self.events.send(Event::Signal(Signal::Next(item)));
    }

    fn on_error(&mut self, error: StreamError) {
        let _ = self.events.send(Event::Signal(Signal::Error(error)));
    }

    fn on_complete(&mut self) {
        let _ = self.events.send(Event::Signal(Signal::Complete));
    }
}

/// Cancels the stream if forwarding is abandoned before it terminates.
struct CancelOnDrop {
    subscription: Option<Subscription>,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.subscription = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

/// Subscribes to `flux` and feeds its items into `sink`, requesting
/// `batch_size` items at a time. Returns the number of items delivered.
///
/// If the returned future is dropped early the subscription is cancelled.
pub async fn forward<T, S>(flux: &Flux<T>, sink: &mut S, batch_size: u64) -> Result<u64, ForwardError>
where
    T: Send + 'static,
    S: SignalSink<T>,
{
    let batch = batch_size.max(1);
    let (events, mut inbox) = mpsc::unbounded_channel();
    flux.subscribe(ChannelSubscriber { events });

    let mut guard = CancelOnDrop { subscription: None };
    let mut delivered = 0u64;
    let mut in_batch = 0u64;

    while let Some(event) = inbox.recv().await {
        match event {
            Event::Subscribed(subscription) => {
                subscription.request(batch);
                guard.subscription = Some(subscription);
            }
            Event::Signal(Signal::Next(item)) => {
                if let Err(err) = sink.send(item).await {
                    warn!(operator = "forward"; "Sink failed after {} item(s), cancelling: {}", delivered, err);
                    return Err(ForwardError::Sink(err));
                }
                delivered += 1;
                in_batch += 1;
                if in_batch == batch {
                    in_batch = 0;
                    if let Some(subscription) = &guard.subscription {
                        subscription.request(batch);
                    }
                }
            }
            Event::Signal(Signal::Error(error)) => {
                guard.disarm();
                sink.finish(Err(error.clone())).await;
                return Err(ForwardError::Stream(error));
            }
            Event::Signal(Signal::Complete) => {
                guard.disarm();
                debug!(operator = "forward"; "Stream completed after {} item(s)", delivered);
                sink.finish(Ok(())).await;
                return Ok(delivered);
            }
        }
    }

    guard.disarm();
    Err(ForwardError::Stream(StreamError::illegal_state(
        "stream was dropped without a terminal signal",
    )))
}

/// [`forward`] with the batch size taken from configuration.
pub async fn forward_with<T, S>(
    flux: &Flux<T>,
    sink: &mut S,
    config: &SinkConfig,
) -> Result<u64, ForwardError>
where
    T: Send + 'static,
    S: SignalSink<T>,
{
    forward(flux, sink, config.batch_size).await
}
