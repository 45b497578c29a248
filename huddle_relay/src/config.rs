// Configuration for the coordinator and the relays it spawns.
//
// Both structs carry `Default`s that reproduce the stock deployment: a
// coordinator on UDP 127.0.0.1:5000 handing out relays on 127.0.0.1 with
// OS-assigned ports. The binaries build these from command-line arguments
// (see `main.rs`); tests construct them directly with port 0 everywhere.

use std::time::Duration;

/// Default UDP port for the coordinator.
pub const DEFAULT_COORDINATOR_PORT: u16 = 5000;

/// Default size of a relay's per-connection read buffer, in bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Default per-connection outbound queue depth, in chunks.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Settings for a single session relay.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Interface the relay's TCP listener binds to.
    pub host: String,
    /// Listen port; 0 lets the OS pick an ephemeral port.
    pub port: u16,
    /// Upper bound on one read from a participant, and so on one relayed chunk.
    pub read_buffer_size: usize,
    /// Chunks a participant may fall behind before it is disconnected.
    pub outbound_queue_capacity: usize,
    /// How often the non-blocking accept loop re-checks for new connections
    /// and for a stop request.
    pub accept_poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            accept_poll_interval: Duration::from_millis(25),
        }
    }
}

/// Settings for the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Interface the coordinator's UDP socket binds to.
    pub host: String,
    /// UDP port; 0 lets the OS pick one.
    pub port: u16,
    /// Host published to clients instead of the relay's bound IP. Needed when
    /// relays bind a wildcard address such as `0.0.0.0`.
    pub advertise_host: Option<String>,
    /// Remove a session and stop its relay once its last participant leaves.
    pub reap_empty_sessions: bool,
    /// Read timeout on the UDP socket; bounds how long `stop` waits.
    pub poll_interval: Duration,
    /// Template for every relay the coordinator starts.
    pub relay: RelayConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_COORDINATOR_PORT,
            advertise_host: None,
            reap_empty_sessions: true,
            poll_interval: Duration::from_millis(100),
            relay: RelayConfig::default(),
        }
    }
}
