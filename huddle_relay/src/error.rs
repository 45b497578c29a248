// Error types for the relay, coordinator, and client halves of the crate.
//
// Each surface gets its own enum so callers match only on the failures that
// surface can produce. Transport failures inside a running relay (accept,
// per-connection read/write) never reach these types: they are logged and
// handled locally, see `relay.rs` and `session.rs`.

use std::io;
use std::sync::Arc;

use huddle_protocol::DatagramError;
use thiserror::Error;

/// Failures starting a session relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("relay thread exited before reporting its address")]
    NotReady,

    #[error("failed to spawn relay thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Failures starting the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("failed to bind coordinator on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures seen by a client talking to the coordinator or a relay.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("coordinator did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Datagram(#[from] DatagramError),

    #[error("coordinator rejected request: {0}")]
    Rejected(String),

    #[error("unexpected coordinator response: {0}")]
    UnexpectedResponse(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
