// Test-only participant for end-to-end coordinator + relay tests.
//
// Wraps the real `CoordinatorClient` and `RelayConnection` (from
// `huddle_relay::client`) with a synchronous, panicking API so scenarios read
// as a script: start a coordinator, have participants start/join sessions,
// send bytes, and assert on what arrives.
//
// The only test-specific code here is the timeouts and polling helpers. All
// networking goes through the same code paths as the `chat` binary.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use huddle_protocol::{RelayEndpoint, SessionId};
use huddle_relay::client::{CoordinatorClient, RelayConnection};
use huddle_relay::config::{CoordinatorConfig, RelayConfig};
use huddle_relay::coordinator::{CoordinatorHandle, start_coordinator};

/// Default timeout for blocking operations.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long `assert_silent` listens before concluding nothing was sent.
const SILENCE_WINDOW: Duration = Duration::from_millis(150);

/// Coordinator config for tests: every port OS-assigned, fast accept polling.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        port: 0,
        poll_interval: Duration::from_millis(20),
        relay: RelayConfig {
            accept_poll_interval: POLL_INTERVAL,
            ..RelayConfig::default()
        },
        ..CoordinatorConfig::default()
    }
}

/// Start a coordinator with `test_config()` on a random port.
pub fn start_test_coordinator() -> CoordinatorHandle {
    start_coordinator(test_config()).expect("start_coordinator failed")
}

/// Poll `condition` until it holds, panicking after `IO_TIMEOUT`.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < IO_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// Block until the relay for `session_id` has exactly `expected` connections.
pub fn wait_for_participants(handle: &CoordinatorHandle, session_id: SessionId, expected: usize) {
    let relay = handle
        .registry()
        .lookup_session(session_id)
        .expect("session not registered");
    wait_until(&format!("{expected} participants in session {session_id}"), || {
        relay.connection_count() == expected
    });
}

/// A chat participant driven synchronously from a test.
pub struct TestParticipant {
    client: CoordinatorClient,
    connection: Option<RelayConnection>,
    pub endpoint: Option<RelayEndpoint>,
}

impl TestParticipant {
    pub fn new(coordinator: SocketAddr) -> Self {
        Self {
            client: CoordinatorClient::new(coordinator).with_timeout(IO_TIMEOUT),
            connection: None,
            endpoint: None,
        }
    }

    pub fn client(&self) -> &CoordinatorClient {
        &self.client
    }

    /// Create a session and connect to its relay.
    pub fn start(&mut self) -> SessionId {
        let (session_id, endpoint) = self.client.start_session().expect("start_session failed");
        self.connect(endpoint);
        session_id
    }

    /// Join an existing session and connect to its relay.
    pub fn join(&mut self, session_id: SessionId) {
        let endpoint = self
            .client
            .join_session(session_id)
            .expect("join_session failed");
        self.connect(endpoint);
    }

    fn connect(&mut self, endpoint: RelayEndpoint) {
        let connection = RelayConnection::connect(&endpoint).expect("relay connect failed");
        connection
            .set_read_timeout(Some(IO_TIMEOUT))
            .expect("set_read_timeout failed");
        self.connection = Some(connection);
        self.endpoint = Some(endpoint);
    }

    fn connection(&mut self) -> &mut RelayConnection {
        self.connection.as_mut().expect("participant is not connected")
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.connection().send(bytes).expect("send failed");
    }

    /// Read exactly `len` bytes, however the relay chunked them.
    pub fn recv_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.connection().recv_exact(&mut buf).expect("recv_exact failed");
        buf
    }

    /// Assert nothing arrives within a short window.
    pub fn assert_silent(&mut self) {
        let connection = self.connection();
        connection
            .set_read_timeout(Some(SILENCE_WINDOW))
            .expect("set_read_timeout failed");
        let mut buf = [0u8; 256];
        match connection.recv(&mut buf) {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => panic!("unexpected error while listening: {e}"),
            Ok(n) => panic!("expected silence, got {n} bytes: {:?}", &buf[..n]),
        }
        connection
            .set_read_timeout(Some(IO_TIMEOUT))
            .expect("set_read_timeout failed");
    }

    /// Close the relay connection.
    pub fn leave(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}
