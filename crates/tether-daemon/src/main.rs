//! Tether daemon entry point.
//!
//! Runs a local stack against an in-memory peer of the opposite role joined
//! by a simulated pipe, and drives both from one cooperative loop with
//! signal handling and periodic status logging.

mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tether_common::config::{Port0Mode, StackConfig};
use tether_common::time::{
    time_to_duration, time_to_f64, CounterSource, MonotonicClock, SystemCounter, TimeSource,
    TIME_HOUR,
};
use tether_stack::simulated::{SimulatedLayers, SimulatedPipe};
use tether_stack::{
    Evm, LowerLevel, PubSub, SharedEventManager, SharedPubSub, SharedTimeSync, Stack,
    TimeSyncRegistry,
};
use tracing::{debug, info, warn};

use crate::signals::SignalHandler;

/// Epoch of the simulated peer's clock, so the client has an offset to learn.
const PEER_EPOCH: i64 = TIME_HOUR;

/// Tether daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "tether-daemon",
    about = "Tether daemon - runs a link stack against an in-memory peer",
    version,
    long_about = None
)]
struct Args {
    /// Path to a stack configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Role of the local stack (client or server); overrides the config file.
    #[arg(long, short = 'm')]
    mode: Option<Port0Mode>,

    /// Maximum loop iterations to run (0 = infinite).
    #[arg(long, default_value = "0")]
    max_iterations: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tether daemon");

    let mut config = load_config(&args)?;
    if let Some(mode) = args.mode {
        config.port0.mode = mode;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        mode = %config.port0.mode,
        topic_prefix = %config.port0.topic_prefix,
        tx_timeout = ?config.link.tx_timeout,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    run_daemon(&config, &signal_handler, args.max_iterations)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "tether_daemon={},tether_stack={},tether_common={}",
        level, level, level
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TETHER_CONFIG_PATH` environment variable
/// 3. `/etc/tether/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<StackConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return StackConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    if let Ok(env_path) = std::env::var("TETHER_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from TETHER_CONFIG_PATH");
            return StackConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from TETHER_CONFIG_PATH={:?}", env_path)
            });
        }
        warn!(
            path = %env_path,
            "TETHER_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/tether/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config from file");
            return StackConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {:?}", config_path));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(StackConfig::default())
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One end of the in-memory link.
struct Endpoint {
    name: &'static str,
    topic_prefix: String,
    stack: Stack,
    pubsub: SharedPubSub,
}

/// Local stack, its simulated peer and the client's time engine.
struct Session {
    local: Endpoint,
    peer: Endpoint,
    timesync: SharedTimeSync,
    // Publishes `timesync` as the current engine.
    registry: TimeSyncRegistry,
}

impl Session {
    fn build(config: &StackConfig) -> Result<Self> {
        let mode = config.port0.mode;
        let counter: Arc<dyn CounterSource> = Arc::new(SystemCounter::new());
        let registry = TimeSyncRegistry::new();
        let timesync = registry.create(counter.clone());
        let (local_end, peer_end) = SimulatedPipe::pair();

        let local_clock: Arc<dyn TimeSource> = Arc::new(MonotonicClock::new());
        let local = Self::endpoint(
            "local",
            config,
            mode,
            &config.port0.topic_prefix,
            local_clock,
            Box::new(local_end),
            counter.clone(),
            (mode == Port0Mode::Client).then(|| timesync.clone()),
        )?;

        let peer_mode = mode.peer();
        let peer_clock: Arc<dyn TimeSource> = Arc::new(MonotonicClock::with_epoch(PEER_EPOCH));
        let peer = Self::endpoint(
            "peer",
            config,
            peer_mode,
            "peer/",
            peer_clock,
            Box::new(peer_end),
            counter,
            (peer_mode == Port0Mode::Client).then(|| timesync.clone()),
        )?;

        Ok(Self {
            local,
            peer,
            timesync,
            registry,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn endpoint(
        name: &'static str,
        config: &StackConfig,
        mode: Port0Mode,
        topic_prefix: &str,
        clock: Arc<dyn TimeSource>,
        lower: Box<dyn LowerLevel>,
        counter: Arc<dyn CounterSource>,
        timesync: Option<SharedTimeSync>,
    ) -> Result<Endpoint> {
        let mut factory = SimulatedLayers::new(config, counter);
        if let Some(timesync) = timesync {
            factory = factory.with_timesync(timesync);
        }
        let evm: SharedEventManager = Arc::new(Evm::new(clock));
        let pubsub: SharedPubSub = Arc::new(Mutex::new(PubSub::new()));
        let stack = Stack::initialize(
            &mut factory,
            &config.link,
            mode,
            topic_prefix,
            evm,
            lower,
            pubsub.clone(),
        )
        .with_context(|| format!("Failed to initialize {name} stack in {mode} mode"))?;
        debug!(name, %mode, "Endpoint ready");
        Ok(Endpoint {
            name,
            topic_prefix: topic_prefix.to_string(),
            stack,
            pubsub,
        })
    }

    fn interval_next(&self) -> i64 {
        self.local
            .stack
            .interval_next()
            .min(self.peer.stack.interval_next())
    }

    fn process(&mut self) {
        self.local.stack.process();
        self.peer.stack.process();
    }

    fn log_status(&self, iterations: u64) {
        for endpoint in [&self.local, &self.peer] {
            let Some(status) = endpoint.stack.link_status() else {
                continue;
            };
            info!(
                endpoint = endpoint.name,
                mode = %endpoint.stack.mode(),
                connected = status.connected,
                tx_frames = status.stats.tx_frames,
                rx_frames = status.stats.rx_frames,
                retransmissions = status.stats.retransmissions,
                resets = status.stats.resets,
                topics = lock(&endpoint.pubsub).len(),
                "Link status"
            );
        }

        let synced_time = self.registry.time();
        let engine = lock(&self.timesync);
        let stats = engine.stats();
        info!(
            iterations,
            calibrated = engine.is_calibrated(),
            accepted = stats.accepted,
            rejected = stats.rejected,
            last_offset_s = stats.last_offset.map(time_to_f64),
            offset_range_s = stats.offset_range().map(time_to_f64),
            round_trip_s = stats.last_round_trip.map(time_to_f64),
            synced_time_s = synced_time.map(time_to_f64),
            "Time sync status"
        );
    }

    fn publish_heartbeat(&self, iterations: u64) {
        let topic = format!("{}daemon/iterations", self.local.topic_prefix);
        lock(&self.local.pubsub).publish(&topic, iterations);
    }

    fn shutdown(&mut self) {
        self.local.stack.finalize();
        self.peer.stack.finalize();
        self.registry.deregister(&self.timesync);
    }
}

/// Main daemon run loop.
fn run_daemon(
    config: &StackConfig,
    signal_handler: &SignalHandler,
    max_iterations: u64,
) -> Result<()> {
    let mut session = Session::build(config)?;
    let max_sleep = config.driver.max_sleep;
    let status_interval = config.driver.status_interval;
    let started = Instant::now();
    let mut last_status = Instant::now();
    let mut iterations = 0u64;

    info!(?max_sleep, ?status_interval, "Entering driver loop");

    loop {
        signal_handler.poll();
        if signal_handler.shutdown_requested() {
            info!("Shutdown signal received, stopping driver loop");
            break;
        }
        if signal_handler.take_reload_request() {
            info!("Reload signal received (config reload not yet implemented)");
        }

        let wait = time_to_duration(session.interval_next()).min(max_sleep);
        if wait > Duration::ZERO {
            std::thread::sleep(wait);
        }
        session.process();

        iterations += 1;
        if max_iterations > 0 && iterations >= max_iterations {
            info!(iterations, "Maximum iteration count reached");
            break;
        }

        if last_status.elapsed() >= status_interval {
            last_status = Instant::now();
            session.publish_heartbeat(iterations);
            session.log_status(iterations);
        }
    }

    info!("Shutting down...");
    session.log_status(iterations);
    session.shutdown();

    info!(
        iterations,
        signals = signal_handler.state().signal_count(),
        uptime_secs = started.elapsed().as_secs(),
        "Daemon shutdown complete"
    );

    Ok(())
}
