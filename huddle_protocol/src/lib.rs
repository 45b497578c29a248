// huddle_protocol: wire protocol for the Huddle coordinator.
//
// This crate defines the request/response messages and the datagram codec
// used between chat clients and the coordinator (`huddle_relay`). It is shared
// by both sides and has no networking code of its own.
//
// Module overview:
// - `types.rs`:     `SessionId` and `RelayEndpoint`.
// - `message.rs`:   `CoordinatorRequest` / `CoordinatorResponse`.
// - `datagram.rs`:  One-JSON-document-per-datagram codec with a hard
//                   `MAX_DATAGRAM_SIZE` bound.
//
// Design decisions:
// - **JSON over UDP.** One request, one response, no connection state. The
//   response goes to the request's source address.
// - **No relay message types.** Relays forward raw bytes without framing;
//   anything participants need to delimit is their own protocol.

pub mod datagram;
pub mod message;
pub mod types;

pub use datagram::{DatagramError, MAX_DATAGRAM_SIZE, decode, encode};
pub use message::{CoordinatorRequest, CoordinatorResponse, SESSION_NOT_FOUND};
pub use types::{RelayEndpoint, SessionId};
