use std::f64::consts::PI;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use env_logger::{Builder, Env};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rivulet::config::RivuletConfig;
use rivulet::streaming::{
    forward_with, Flux, Scheduler, SignalSink, SinkError, StreamError, TokioScheduler,
};

const RUN_FOR: Duration = Duration::from_secs(5);

/// One reading from the simulated probe, in degrees Celsius.
#[derive(Debug, Clone, Copy)]
struct Temperature(f64);

struct Probe {
    rng: Mutex<StdRng>,
}

impl Probe {
    fn new() -> Self {
        Probe {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Gaussian reading around 16 degrees with a spread of 10.
    fn read(&self) -> Temperature {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        let gaussian = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        Temperature(16.0 + gaussian * 10.0)
    }

    fn next_delay(&self) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_millis(rng.gen_range(0..500))
    }
}

/// Endless stream of readings, each arriving after a random pause.
fn temperature_stream(probe: Arc<Probe>, scheduler: Arc<dyn Scheduler>) -> Flux<Temperature> {
    Flux::range(0, i64::MAX as u64).concat_map(move |_| {
        let probe = probe.clone();
        let delay = probe.next_delay();
        Flux::delayed((), delay, scheduler.clone()).map(move |_| probe.read())
    })
}

struct LoggingClient {
    name: &'static str,
}

impl SignalSink<Temperature> for LoggingClient {
    async fn send(&mut self, item: Temperature) -> Result<(), SinkError> {
        info!(client = self.name; "Temperature: {:.1} C", item.0);
        Ok(())
    }

    async fn finish(&mut self, outcome: Result<(), StreamError>) {
        match outcome {
            Ok(()) => info!(client = self.name; "Stream completed"),
            Err(err) => warn!(client = self.name; "Stream failed: {}", err),
        }
    }
}

fn get_loggings() {
    let env = Env::default().filter_or("RIVULET_LOG", "info");
    Builder::from_env(env).init()
}

fn load_config() -> Result<RivuletConfig, Box<dyn std::error::Error>> {
    match std::env::var("RIVULET_CONFIG") {
        Ok(path) => Ok(RivuletConfig::load_from_file(path)?),
        Err(_) => Ok(RivuletConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    get_loggings();
    let config = load_config()?;

    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current()?);
    let hub = temperature_stream(Arc::new(Probe::new()), scheduler).broadcast_with(&config.hub);

    let mut first = LoggingClient { name: "first" };
    let mut second = LoggingClient { name: "second" };
    let first_feed = hub.flux();
    let second_feed = hub.flux();

    let clients = async {
        tokio::join!(
            forward_with(&first_feed, &mut first, &config.sink),
            forward_with(&second_feed, &mut second, &config.sink),
        )
    };
    if tokio::time::timeout(RUN_FOR, clients).await.is_err() {
        info!("Stopping clients after {:?}", RUN_FOR);
    }
    info!(
        "Hub connected {} time(s), {} subscriber(s) left",
        hub.connection_count(),
        hub.subscriber_count()
    );
    Ok(())
}
