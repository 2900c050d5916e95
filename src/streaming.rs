//! Demand-driven reactive streams.
//!
//! A [`Flux`] is a cold description of a stream; nothing runs until a
//! [`Subscriber`] subscribes and requests items through its
//! [`Subscription`]. Operators are methods on `Flux` grouped by concern in
//! the submodules below.
pub mod aggregate;
pub mod compose;
pub mod error;
pub mod flow;
pub mod flux;
pub mod group;
pub mod hub;
mod outlet;
pub mod recovery;
pub mod scheduler;
pub mod signal;
pub mod sink;
pub mod source;
pub mod subscription;
pub mod test_subscriber;

pub use error::{ForwardError, SinkError, StreamError, StreamResult};
pub use flux::{Flux, Publisher};
pub use group::GroupedFlux;
pub use hub::BroadcastHub;
pub use scheduler::{Scheduler, TaskHandle, TokioScheduler, VirtualScheduler};
pub use signal::Signal;
pub use sink::{forward, forward_with, LocalSignalSink, SignalSink};
pub use source::{FluxSink, GenerateSink};
pub use subscription::{Subscriber, Subscription, UNBOUNDED};
pub use test_subscriber::{TestProbe, TestSubscriber};

#[cfg(test)]
mod tests;
