// Client side of both protocols.
//
// - `CoordinatorClient` sends one request datagram and blocks for the one
//   response. It binds a fresh ephemeral UDP socket per request, so replies
//   can never be confused between requests. There is no timeout unless one is
//   configured with `with_timeout`.
// - `RelayConnection` is a thin wrapper over the TCP stream to a relay. What
//   goes over it is opaque: `send` writes bytes verbatim and `recv` returns
//   whatever one read produced, with no framing in either direction.
//   `spawn_receiver` moves reads onto a background thread and delivers chunks
//   through an `mpsc` channel, which is what the interactive `chat` binary uses
//   to print incoming text while it blocks on stdin.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use huddle_protocol::{
    CoordinatorRequest, CoordinatorResponse, MAX_DATAGRAM_SIZE, RelayEndpoint, SessionId, decode,
    encode,
};

use crate::config::DEFAULT_READ_BUFFER_SIZE;
use crate::error::{ClientError, ClientResult};

/// Request/response client for the coordinator.
#[derive(Clone, Debug)]
pub struct CoordinatorClient {
    coordinator: SocketAddr,
    timeout: Option<Duration>,
}

impl CoordinatorClient {
    pub fn new(coordinator: SocketAddr) -> Self {
        Self {
            coordinator,
            timeout: None,
        }
    }

    /// Give up on a response after `timeout` instead of waiting forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send one request and wait for one response.
    pub fn request(&self, request: &CoordinatorRequest) -> ClientResult<CoordinatorResponse> {
        let payload = encode(request)?;
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let len = self.exchange(&payload, &mut buf)?;
        Ok(decode(&buf[..len])?)
    }

    /// Send a raw datagram and return the raw reply. Used to probe the
    /// coordinator with payloads `CoordinatorRequest` cannot express.
    pub fn exchange(&self, payload: &[u8], reply: &mut [u8]) -> ClientResult<usize> {
        let local = if self.coordinator.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local)?;
        socket.set_read_timeout(self.timeout)?;
        socket.send_to(payload, self.coordinator)?;

        match socket.recv_from(reply) {
            Ok((len, _)) => Ok(len),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Err(ClientError::Timeout(self.timeout.unwrap_or_default()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Create a session. Returns its id and relay address.
    pub fn start_session(&self) -> ClientResult<(SessionId, RelayEndpoint)> {
        match self.request(&CoordinatorRequest::Start)? {
            CoordinatorResponse::Started {
                session_id,
                host,
                port,
            } => Ok((session_id, RelayEndpoint::new(host, port))),
            CoordinatorResponse::Error { error } => Err(ClientError::Rejected(error)),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Look up an existing session's relay address.
    pub fn join_session(&self, session_id: SessionId) -> ClientResult<RelayEndpoint> {
        match self.request(&CoordinatorRequest::Join { session_id })? {
            CoordinatorResponse::Joined { host, port } => Ok(RelayEndpoint::new(host, port)),
            CoordinatorResponse::Error { error } => Err(ClientError::Rejected(error)),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

/// An open byte stream to a session relay.
pub struct RelayConnection {
    stream: TcpStream,
}

impl RelayConnection {
    pub fn connect(endpoint: &RelayEndpoint) -> ClientResult<Self> {
        let addr = endpoint.resolve()?;
        let stream = TcpStream::connect(addr)?;
        Ok(Self { stream })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Write `bytes` to the relay verbatim.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Read whatever is available, up to `buf.len()` bytes. `Ok(0)` means the
    /// relay closed the connection.
    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    /// Read exactly `buf.len()` bytes, across as many chunks as it takes.
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf)
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }

    /// Read on a background thread and deliver each chunk through the
    /// returned channel. The channel closes when the connection does.
    pub fn spawn_receiver(&self) -> io::Result<Receiver<Vec<u8>>> {
        let stream = self.stream.try_clone()?;
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("huddle-receiver".into())
            .spawn(move || receiver_loop(stream, tx))?;
        Ok(rx)
    }

    /// Shut down both directions. Any receiver thread sees end-of-stream.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Receiver thread: read chunks in a loop, push to channel.
fn receiver_loop(mut stream: TcpStream, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; DEFAULT_READ_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break; // Caller dropped the receiver
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
}
