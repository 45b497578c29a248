// CLI entry point for the Huddle coordinator.
//
// Starts the UDP coordinator that hands out session relays. Relays are
// spawned on demand, one per session, on OS-assigned TCP ports. See
// `coordinator.rs` for request handling and `relay.rs` for the relays.
//
// Usage:
//   coordinator [OPTIONS]
//     --host <HOST>               UDP bind address (default: 127.0.0.1)
//     --port <PORT>               UDP port (default: 5000)
//     --relay-host <HOST>         Interface relays bind to (default: 127.0.0.1)
//     --advertise-host <HOST>     Host handed to clients instead of the bound IP
//     --read-buffer <BYTES>       Max bytes per relayed chunk (default: 1024)
//     --outbound-queue <CHUNKS>   Per-peer backlog before disconnect (default: 64)
//     --keep-empty-sessions       Never tear down sessions whose last peer left
//     --log-level <LEVEL>         Default log filter when RUST_LOG is unset

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use huddle_relay::config::{
    CoordinatorConfig, DEFAULT_COORDINATOR_PORT, DEFAULT_OUTBOUND_QUEUE_CAPACITY,
    DEFAULT_READ_BUFFER_SIZE, RelayConfig,
};
use huddle_relay::coordinator::start_coordinator;
use huddle_relay::logging::init_logging;
use tracing::{error, info};

/// Huddle session coordinator.
#[derive(Parser, Debug)]
#[command(name = "coordinator", version, about)]
struct Args {
    /// UDP bind address for coordinator requests
    #[arg(long, default_value = "127.0.0.1", env = "HUDDLE_HOST")]
    host: String,

    /// UDP port for coordinator requests
    #[arg(long, default_value_t = DEFAULT_COORDINATOR_PORT, env = "HUDDLE_PORT")]
    port: u16,

    /// Interface session relays bind their TCP listeners to
    #[arg(long, default_value = "127.0.0.1", env = "HUDDLE_RELAY_HOST")]
    relay_host: String,

    /// Host published to clients in place of the relay's bound IP
    #[arg(long, env = "HUDDLE_ADVERTISE_HOST")]
    advertise_host: Option<String>,

    /// Maximum bytes read from a participant at once
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER_SIZE)]
    read_buffer: usize,

    /// Chunks a participant may fall behind before being disconnected
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_QUEUE_CAPACITY)]
    outbound_queue: usize,

    /// Keep sessions registered after their last participant leaves
    #[arg(long)]
    keep_empty_sessions: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", env = "HUDDLE_LOG")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> CoordinatorConfig {
        CoordinatorConfig {
            host: self.host,
            port: self.port,
            advertise_host: self.advertise_host,
            reap_empty_sessions: !self.keep_empty_sessions,
            relay: RelayConfig {
                host: self.relay_host,
                read_buffer_size: self.read_buffer,
                outbound_queue_capacity: self.outbound_queue,
                ..RelayConfig::default()
            },
            ..CoordinatorConfig::default()
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let handle = match start_coordinator(args.into_config()) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start coordinator");
            return ExitCode::FAILURE;
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    }) {
        error!(error = %e, "failed to install Ctrl+C handler");
        handle.stop();
        return ExitCode::FAILURE;
    }

    info!(addr = %handle.addr(), "press Ctrl+C to stop");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down the coordinator");
    handle.stop();
    ExitCode::SUCCESS
}
