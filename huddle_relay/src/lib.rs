// huddle_relay: session coordinator and per-session byte relays.
//
// A coordinator listens on UDP for `start`/`join` requests (see
// `huddle_protocol`). `start` creates a session and spawns a relay for it on
// an ephemeral TCP port; `join` looks an existing session up. Either way the
// client gets back a relay address, connects to it directly, and from then on
// the relay copies every byte one participant sends to every other
// participant in the session. The coordinator never sees chat traffic.
//
// Module overview:
// - `registry.rs`:    `SessionRegistry`: id assignment and the
//                     `SessionId → RelayHandle` map under one lock.
// - `session.rs`:     `Session`: one session's connection set, bounded
//                     per-connection outbound queues, and `broadcast`.
// - `relay.rs`:       Relay thread: bind + readiness, accept loop, reader
//                     threads, teardown hook.
// - `coordinator.rs`: UDP request loop and request handling.
// - `client.rs`:      `CoordinatorClient` and `RelayConnection` for callers
//                     on the other side of both protocols.
// - `config.rs`:      `CoordinatorConfig` / `RelayConfig` with defaults.
// - `error.rs`:       Error enums for each surface.
// - `logging.rs`:     `tracing` subscriber setup for the binaries.
//
// Everything runs on std threads and blocking sockets: one thread for the
// coordinator, one per relay, and a reader and a writer per connection.
//
// Binaries: `coordinator` (`main.rs`) runs the service; `chat`
// (`bin/chat.rs`) is an interactive terminal client.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod registry;
pub mod relay;
pub mod session;

pub use client::{CoordinatorClient, RelayConnection};
pub use config::{CoordinatorConfig, RelayConfig};
pub use coordinator::{Coordinator, CoordinatorHandle, start_coordinator};
pub use error::{ClientError, CoordinatorError, RelayError};
pub use registry::SessionRegistry;
pub use relay::{RelayHandle, TeardownHook, spawn_relay};
