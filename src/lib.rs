pub mod config;
pub mod streaming;

pub use streaming::{BroadcastHub, Flux, Signal, StreamError, Subscriber, Subscription};
