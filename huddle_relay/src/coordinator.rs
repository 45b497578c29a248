// UDP front door: decode requests, drive the registry, start relays.
//
// Architecture: a single coordinator thread owns the UDP socket and handles
// one datagram at a time. Each request produces exactly one response, sent to
// the source address of the request, so the coordinator keeps no per-client
// state.
//
// - `start`: the registry assigns the next id and spawns the session's relay
//   under its lock; the coordinator then waits on the relay's readiness slot
//   (outside the lock) before reading the bound address. A relay that fails
//   to bind is removed again and the client gets an error response.
// - `join`: registry lookup; unknown ids get `{"error":"Session not found"}`.
// - Anything that does not decode gets `{"error":"invalid request: ..."}`, so
//   a client never waits on a reply that will not come.
//
// The socket has a read timeout (`poll_interval`) so the loop can notice
// `CoordinatorHandle::stop`, mirroring the relay's non-blocking accept loop.
//
// Teardown: with `reap_empty_sessions` on, every relay gets a hook that removes
// its session from the registry (if it is still empty under the registry lock)
// and stops the relay. The hook holds only a `Weak` to the registry.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use huddle_protocol::{
    CoordinatorRequest, CoordinatorResponse, MAX_DATAGRAM_SIZE, RelayEndpoint, SessionId, decode,
    encode,
};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::registry::SessionRegistry;
use crate::relay::{TeardownHook, spawn_relay};

/// Longest decode error text echoed back to a client, in characters. Serde
/// quotes the offending input, so the detail is capped to keep the reply
/// within one datagram.
const MAX_ERROR_DETAIL: usize = 256;

/// Sent when a response cannot be encoded, so the client still gets a reply.
const FALLBACK_ERROR: &str = "internal error: response could not be encoded";

/// Request handling, independent of the socket that feeds it.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<SessionRegistry>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Decode one datagram and produce its response.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) -> CoordinatorResponse {
        match decode::<CoordinatorRequest>(bytes) {
            Ok(request) => {
                debug!(%from, ?request, "received request");
                self.handle_request(request)
            }
            Err(e) => {
                warn!(%from, error = %e, "rejecting malformed request");
                let detail: String = e.to_string().chars().take(MAX_ERROR_DETAIL).collect();
                CoordinatorResponse::error(format!("invalid request: {detail}"))
            }
        }
    }

    pub fn handle_request(&self, request: CoordinatorRequest) -> CoordinatorResponse {
        match request {
            CoordinatorRequest::Start => self.start_session(),
            CoordinatorRequest::Join { session_id } => self.join_session(session_id),
        }
    }

    fn start_session(&self) -> CoordinatorResponse {
        let created = self
            .registry
            .create_session(|id| spawn_relay(id, &self.config.relay, self.teardown_hook()));
        let (session_id, relay) = match created {
            Ok(created) => created,
            Err(e) => {
                warn!(error = %e, "could not start relay");
                return CoordinatorResponse::error(format!("failed to start relay: {e}"));
            }
        };

        match relay.wait_ready() {
            Ok(addr) => {
                let endpoint = self.endpoint_for(addr);
                info!(session = %session_id, %endpoint, "started chat session");
                CoordinatorResponse::started(session_id, endpoint)
            }
            Err(e) => {
                self.registry.remove_session(session_id);
                relay.stop();
                warn!(session = %session_id, error = %e, "relay failed to start, session discarded");
                CoordinatorResponse::error(format!("failed to start relay: {e}"))
            }
        }
    }

    fn join_session(&self, session_id: SessionId) -> CoordinatorResponse {
        let Some(relay) = self.registry.lookup_session(session_id) else {
            info!(session = %session_id, "join for unknown session");
            return CoordinatorResponse::session_not_found();
        };

        match relay.wait_ready() {
            Ok(addr) => {
                let endpoint = self.endpoint_for(addr);
                info!(session = %session_id, %endpoint, "client joining session");
                CoordinatorResponse::joined(endpoint)
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "registered relay is not usable");
                CoordinatorResponse::error(format!("relay unavailable: {e}"))
            }
        }
    }

    /// The address published to clients for a relay bound on `addr`.
    fn endpoint_for(&self, addr: SocketAddr) -> RelayEndpoint {
        match &self.config.advertise_host {
            Some(host) => RelayEndpoint::new(host.clone(), addr.port()),
            None => RelayEndpoint::from(addr),
        }
    }

    fn teardown_hook(&self) -> Option<TeardownHook> {
        if !self.config.reap_empty_sessions {
            return None;
        }
        let registry: Weak<SessionRegistry> = Arc::downgrade(&self.registry);
        Some(Arc::new(move |session_id: SessionId| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed =
                registry.remove_session_if(session_id, |relay| relay.connection_count() == 0);
            if let Some(relay) = removed {
                relay.stop();
                info!(session = %session_id, "session torn down after last participant left");
            }
        }))
    }

    /// Stop every registered relay and empty the registry.
    pub fn shutdown(&self) {
        for (session_id, relay) in self.registry.drain() {
            relay.stop();
            debug!(session = %session_id, "relay stopped");
        }
    }
}

/// Handle returned by `start_coordinator` to control the running service.
pub struct CoordinatorHandle {
    addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// The bound UDP address (useful when port 0 was requested).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.coordinator.registry()
    }

    /// Stop the request loop, then stop every relay.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.coordinator.shutdown();
        info!(addr = %self.addr, "coordinator stopped");
    }
}

/// Bind the coordinator's UDP socket and serve requests on a background
/// thread.
pub fn start_coordinator(config: CoordinatorConfig) -> Result<CoordinatorHandle, CoordinatorError> {
    let socket = UdpSocket::bind((config.host.as_str(), config.port)).map_err(|source| {
        CoordinatorError::Bind {
            addr: format!("{}:{}", config.host, config.port),
            source,
        }
    })?;
    let addr = socket.local_addr()?;
    socket.set_read_timeout(Some(config.poll_interval))?;

    let coordinator = Arc::new(Coordinator::new(config));
    let keep_running = Arc::new(AtomicBool::new(true));

    let thread_coordinator = Arc::clone(&coordinator);
    let thread_keep_running = Arc::clone(&keep_running);
    let thread = thread::Builder::new()
        .name("huddle-coordinator".into())
        .spawn(move || run_coordinator(&socket, &thread_coordinator, &thread_keep_running))?;

    info!(%addr, "coordinator running");
    Ok(CoordinatorHandle {
        addr,
        coordinator,
        keep_running,
        thread: Some(thread),
    })
}

/// Main request loop. Runs until `keep_running` is set to false.
fn run_coordinator(socket: &UdpSocket, coordinator: &Coordinator, keep_running: &AtomicBool) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while keep_running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let response = coordinator.handle_datagram(&buf[..len], from);
                send_response(socket, &response, from);
            }
            Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!(error = %e, "error receiving coordinator request");
            }
        }
    }
}

fn send_response(socket: &UdpSocket, response: &CoordinatorResponse, to: SocketAddr) {
    let payload = match encode(response).or_else(|e| {
        warn!(%to, error = %e, "could not encode response, sending fallback error");
        encode(&CoordinatorResponse::error(FALLBACK_ERROR))
    }) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%to, error = %e, "could not encode fallback response");
            return;
        }
    };
    if let Err(e) = socket.send_to(&payload, to) {
        warn!(%to, error = %e, "could not send response");
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::config::RelayConfig;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            port: 0,
            relay: RelayConfig {
                accept_poll_interval: Duration::from_millis(5),
                ..RelayConfig::default()
            },
            ..CoordinatorConfig::default()
        }
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out: {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn started(response: CoordinatorResponse) -> (SessionId, RelayEndpoint) {
        match response {
            CoordinatorResponse::Started {
                session_id,
                host,
                port,
            } => (session_id, RelayEndpoint::new(host, port)),
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[test]
    fn start_returns_first_session_with_connectable_relay() {
        let coordinator = Coordinator::new(test_config());
        let (id, endpoint) = started(coordinator.handle_request(CoordinatorRequest::Start));

        assert_eq!(id, SessionId(1));
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_ne!(endpoint.port, 0);
        TcpStream::connect(endpoint.resolve().unwrap()).unwrap();
        coordinator.shutdown();
    }

    #[test]
    fn join_unknown_session_is_not_found() {
        let coordinator = Coordinator::new(test_config());
        let response = coordinator.handle_request(CoordinatorRequest::Join {
            session_id: SessionId(99),
        });
        assert_eq!(response, CoordinatorResponse::session_not_found());
        assert_eq!(response.endpoint(), None);
    }

    #[test]
    fn join_returns_same_endpoint_every_time() {
        let coordinator = Coordinator::new(test_config());
        let (id, endpoint) = started(coordinator.handle_request(CoordinatorRequest::Start));

        for _ in 0..3 {
            let response = coordinator.handle_request(CoordinatorRequest::Join { session_id: id });
            assert_eq!(response, CoordinatorResponse::joined(endpoint.clone()));
        }
        coordinator.shutdown();
    }

    #[test]
    fn malformed_datagram_gets_error_response() {
        let coordinator = Coordinator::new(test_config());
        let cases: [&[u8]; 4] = [
            b"not json",
            br#"{"action":"leave"}"#,
            br#"{"action":"join"}"#,
            b"",
        ];
        for bytes in cases {
            match coordinator.handle_datagram(bytes, client_addr()) {
                CoordinatorResponse::Error { error } => {
                    assert!(error.starts_with("invalid request"), "{error}");
                }
                other => panic!("expected Error, got {other:?}"),
            }
        }
        assert_eq!(coordinator.registry().session_count(), 0);
    }

    #[test]
    fn oversized_action_error_fits_one_datagram() {
        let coordinator = Coordinator::new(test_config());
        let request = format!(r#"{{"action":"{}"}}"#, "x".repeat(990));
        assert!(request.len() <= MAX_DATAGRAM_SIZE);

        let response = coordinator.handle_datagram(request.as_bytes(), client_addr());
        match &response {
            CoordinatorResponse::Error { error } => {
                assert!(error.starts_with("invalid request"), "{error}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(encode(&response).unwrap().len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn non_integer_session_id_is_invalid_request() {
        let coordinator = Coordinator::new(test_config());
        let cases: [&[u8]; 3] = [
            br#"{"action":"join","session_id":"1"}"#,
            br#"{"action":"join","session_id":-1}"#,
            br#"{"action":"join","session_id":1.5}"#,
        ];
        for bytes in cases {
            match coordinator.handle_datagram(bytes, client_addr()) {
                CoordinatorResponse::Error { error } => {
                    assert!(error.starts_with("invalid request"), "{error}");
                }
                other => panic!("expected Error, got {other:?}"),
            }
        }
    }

    #[test]
    fn datagram_start_and_join_decode() {
        let coordinator = Coordinator::new(test_config());
        let response = coordinator.handle_datagram(br#"{"action":"start"}"#, client_addr());
        let (id, _) = started(response);

        let body = serde_json::to_vec(&json!({ "action": "join", "session_id": id.0 })).unwrap();
        let joined = coordinator.handle_datagram(&body, client_addr());
        assert!(matches!(joined, CoordinatorResponse::Joined { .. }));
        coordinator.shutdown();
    }

    #[test]
    fn advertise_host_overrides_bound_ip() {
        let config = CoordinatorConfig {
            advertise_host: Some("chat.example.net".into()),
            ..test_config()
        };
        let coordinator = Coordinator::new(config);
        let (_, endpoint) = started(coordinator.handle_request(CoordinatorRequest::Start));
        assert_eq!(endpoint.host, "chat.example.net");
        assert_ne!(endpoint.port, 0);
        coordinator.shutdown();
    }

    #[test]
    fn relay_bind_failure_fails_only_that_session() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.relay.port = taken.local_addr().unwrap().port();
        let coordinator = Coordinator::new(config);

        match coordinator.handle_request(CoordinatorRequest::Start) {
            CoordinatorResponse::Error { error } => {
                assert!(error.starts_with("failed to start relay"), "{error}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert_eq!(coordinator.registry().session_count(), 0);

        // The consumed id is not handed out to anyone.
        let response = coordinator.handle_request(CoordinatorRequest::Join {
            session_id: SessionId(1),
        });
        assert_eq!(response, CoordinatorResponse::session_not_found());
    }

    #[test]
    fn last_participant_leaving_tears_session_down() {
        let coordinator = Coordinator::new(test_config());
        let (id, endpoint) = started(coordinator.handle_request(CoordinatorRequest::Start));
        let relay = coordinator.registry().lookup_session(id).unwrap();

        let stream = TcpStream::connect(endpoint.resolve().unwrap()).unwrap();
        wait_until("participant admitted", || relay.connection_count() == 1);

        drop(stream);
        wait_until("session removed", || {
            coordinator.registry().lookup_session(id).is_none()
        });
        wait_until("relay stopped", || !relay.is_running());

        let response = coordinator.handle_request(CoordinatorRequest::Join { session_id: id });
        assert_eq!(response, CoordinatorResponse::session_not_found());

        // The next session gets a fresh id.
        let (next, _) = started(coordinator.handle_request(CoordinatorRequest::Start));
        assert_eq!(next, SessionId(2));
        coordinator.shutdown();
    }

    #[test]
    fn keep_empty_sessions_when_reaping_disabled() {
        let config = CoordinatorConfig {
            reap_empty_sessions: false,
            ..test_config()
        };
        let coordinator = Coordinator::new(config);
        let (id, endpoint) = started(coordinator.handle_request(CoordinatorRequest::Start));
        let relay = coordinator.registry().lookup_session(id).unwrap();

        let stream = TcpStream::connect(endpoint.resolve().unwrap()).unwrap();
        wait_until("participant admitted", || relay.connection_count() == 1);
        drop(stream);
        wait_until("participant removed", || relay.connection_count() == 0);

        let response = coordinator.handle_request(CoordinatorRequest::Join { session_id: id });
        assert_eq!(response, CoordinatorResponse::joined(endpoint));
        coordinator.shutdown();
    }

    #[test]
    fn start_coordinator_serves_udp() {
        let handle = start_coordinator(test_config()).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        socket
            .send_to(br#"{"action":"join","session_id":99}"#, handle.addr())
            .unwrap();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value, json!({ "error": "Session not found" }));

        handle.stop();
    }

    #[test]
    fn oversized_malformed_request_still_gets_reply() {
        let handle = start_coordinator(test_config()).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let request = format!(r#"{{"action":"{}"}}"#, "x".repeat(990));
        socket.send_to(request.as_bytes(), handle.addr()).unwrap();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        let error = value["error"].as_str().unwrap();
        assert!(error.starts_with("invalid request"), "{error}");

        handle.stop();
    }

    #[test]
    fn coordinator_bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = CoordinatorConfig {
            port: taken.local_addr().unwrap().port(),
            ..test_config()
        };
        let err = start_coordinator(config).err().unwrap();
        assert!(matches!(err, CoordinatorError::Bind { .. }), "{err:?}");
    }
}
