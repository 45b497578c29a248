// Coordinator request/response messages.
//
// Two enums define the full coordinator vocabulary:
// - `CoordinatorRequest`: sent by clients, discriminated by an `action` field
//   (`{"action":"start"}`, `{"action":"join","session_id":N}`).
// - `CoordinatorResponse`: sent back to the datagram's source address. The
//   variants are distinguished by shape rather than a tag, matching the wire
//   format clients already parse (`session_id`+`host`+`port`, `host`+`port`,
//   or `error`).
//
// Relay traffic has no message types at all: the relay forwards raw bytes,
// so nothing here describes what participants say to each other.

use serde::{Deserialize, Serialize};

use crate::types::{RelayEndpoint, SessionId};

/// Error text returned for a `join` on an unknown session.
pub const SESSION_NOT_FOUND: &str = "Session not found";

/// Requests sent by a client to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CoordinatorRequest {
    /// Create a new session and start its relay.
    Start,
    /// Look up the relay of an existing session.
    Join { session_id: SessionId },
}

/// Responses sent by the coordinator.
///
/// Variant order matters for deserialization: `Started` must be tried before
/// `Joined`, since a `Started` document is a superset of a `Joined` one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordinatorResponse {
    Started {
        session_id: SessionId,
        host: String,
        port: u16,
    },
    Joined {
        host: String,
        port: u16,
    },
    Error {
        error: String,
    },
}

impl CoordinatorResponse {
    pub fn started(session_id: SessionId, endpoint: RelayEndpoint) -> Self {
        Self::Started {
            session_id,
            host: endpoint.host,
            port: endpoint.port,
        }
    }

    pub fn joined(endpoint: RelayEndpoint) -> Self {
        Self::Joined {
            host: endpoint.host,
            port: endpoint.port,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn session_not_found() -> Self {
        Self::error(SESSION_NOT_FOUND)
    }

    /// The relay address carried by a success response.
    pub fn endpoint(&self) -> Option<RelayEndpoint> {
        match self {
            Self::Started { host, port, .. } | Self::Joined { host, port } => {
                Some(RelayEndpoint::new(host.clone(), *port))
            }
            Self::Error { .. } => None,
        }
    }
}
