// Connection set and fan-out for one relay session.
//
// `Session` is the data structure that `relay.rs` drives: the accept loop
// adds connections, each connection's reader thread broadcasts what it reads
// and removes itself when its stream ends. The relay wraps it in a
// `parking_lot::Mutex`, one per session, so sessions never contend with each
// other.
//
// Outbound I/O never happens under that lock. Every connection owns a bounded
// outbound queue (`mpsc::sync_channel`) drained by its own writer thread;
// `broadcast` only does `try_send`s. A peer whose queue is full has fallen
// `outbound_queue_capacity` chunks behind and is disconnected: its socket is
// shut down, which its reader thread observes as end-of-stream, and that
// thread removes it from the set. Nothing else removes connections.
//
// Chunks are shared as `Arc<[u8]>`, so a broadcast allocates once no matter
// how many peers receive it.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;

use huddle_protocol::SessionId;
use tracing::{debug, warn};

/// Relay-local connection number, unique within one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One relayed chunk, shared by every outbound queue it is placed on.
pub type Chunk = Arc<[u8]>;

/// What happened to each peer during one `broadcast`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the chunk was queued for.
    pub queued: usize,
    /// Peers disconnected by this broadcast because their queue was full.
    pub evicted: usize,
    /// Peers whose writer has already stopped; skipped.
    pub unreachable: usize,
}

/// The live connections of one session.
pub struct Session {
    id: SessionId,
    peers: BTreeMap<ConnectionId, Peer>,
    next_connection_id: u64,
    outbound_queue_capacity: usize,
    had_participants: bool,
    closed: bool,
}

struct Peer {
    addr: SocketAddr,
    /// Handle used only to shut the socket down.
    stream: TcpStream,
    outbound: SyncSender<Chunk>,
    evicted: bool,
}

impl Session {
    pub fn new(id: SessionId, outbound_queue_capacity: usize) -> Self {
        Self {
            id,
            peers: BTreeMap::new(),
            next_connection_id: 0,
            outbound_queue_capacity: outbound_queue_capacity.max(1),
            had_participants: false,
            closed: false,
        }
    }

    /// Register an accepted stream and start its writer thread. The caller
    /// keeps `stream` for reading; the session holds its own clones.
    ///
    /// Fails with `ConnectionAborted` once `close_all` has run, so a stream
    /// accepted while the relay is stopping is never admitted.
    pub fn add_connection(&mut self, stream: &TcpStream) -> io::Result<ConnectionId> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session is closed",
            ));
        }
        let addr = stream.peer_addr()?;
        let handle = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let (tx, rx) = mpsc::sync_channel(self.outbound_queue_capacity);

        thread::Builder::new()
            .name(format!("huddle-writer-{}-{}", self.id, self.next_connection_id))
            .spawn(move || writer_loop(writer, rx))?;

        Ok(self.insert_peer(addr, handle, tx))
    }

    fn insert_peer(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
        outbound: SyncSender<Chunk>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        self.had_participants = true;
        self.peers.insert(
            id,
            Peer {
                addr,
                stream,
                outbound,
                evicted: false,
            },
        );
        id
    }

    /// Drop a connection from the set. Its writer thread finishes whatever is
    /// still queued and exits. Returns false if the connection was not present.
    pub fn remove_connection(&mut self, id: ConnectionId) -> bool {
        self.peers.remove(&id).is_some()
    }

    /// Queue `payload` for every connection except `from`.
    pub fn broadcast(&mut self, from: ConnectionId, payload: &[u8]) -> BroadcastReport {
        let chunk: Chunk = Arc::from(payload);
        let mut report = BroadcastReport::default();

        for (id, peer) in self.peers.iter_mut() {
            if *id == from || peer.evicted {
                continue;
            }
            match peer.outbound.try_send(Arc::clone(&chunk)) {
                Ok(()) => report.queued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        session = %self.id,
                        conn = %id,
                        peer = %peer.addr,
                        capacity = self.outbound_queue_capacity,
                        "outbound queue full, disconnecting slow peer"
                    );
                    peer.evicted = true;
                    let _ = peer.stream.shutdown(Shutdown::Both);
                    report.evicted += 1;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!(session = %self.id, conn = %id, "peer writer gone, skipping");
                    report.unreachable += 1;
                }
            }
        }

        report
    }

    /// Shut down every open connection and refuse new ones. Reader threads
    /// observe the shutdown and remove their connections as usual.
    pub fn close_all(&mut self) {
        self.closed = true;
        for peer in self.peers.values() {
            let _ = peer.stream.shutdown(Shutdown::Both);
        }
    }

    /// Returns the number of connections in the set.
    pub fn connection_count(&self) -> usize {
        self.peers.len()
    }

    /// True once any connection has ever been admitted.
    pub fn had_participants(&self) -> bool {
        self.had_participants
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }
}

/// Writer thread: drain one connection's outbound queue onto its socket.
/// Exits when the queue's sender is dropped or a write fails.
fn writer_loop(mut stream: TcpStream, outbound: Receiver<Chunk>) {
    for chunk in outbound {
        if let Err(e) = stream.write_all(&chunk) {
            debug!(error = %e, "write to peer failed");
            // Wake the reader so the connection is removed promptly.
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;

    /// Create a TCP pair: (client_stream, server_stream) on localhost.
    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (client, server)
    }

    fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Assert nothing arrives on `stream` within a short window.
    fn assert_nothing_received(stream: &mut TcpStream) {
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Err(e) => assert!(
                matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ),
                "unexpected error: {e}"
            ),
            Ok(n) => panic!("expected silence, got {n} bytes"),
        }
    }

    #[test]
    fn add_connection_assigns_sequential_ids() {
        let (_c1, s1) = tcp_pair();
        let (_c2, s2) = tcp_pair();
        let mut session = Session::new(SessionId(1), 8);
        assert!(!session.had_participants());

        let a = session.add_connection(&s1).unwrap();
        let b = session.add_connection(&s2).unwrap();

        assert_eq!(a, ConnectionId(0));
        assert_eq!(b, ConnectionId(1));
        assert_eq!(session.connection_count(), 2);
        assert_eq!(session.connection_ids(), vec![a, b]);
        assert!(session.had_participants());
    }

    #[test]
    fn broadcast_reaches_everyone_but_the_sender() {
        let (mut ca, sa) = tcp_pair();
        let (mut cb, sb) = tcp_pair();
        let (mut cc, sc) = tcp_pair();
        let mut session = Session::new(SessionId(1), 8);
        let a = session.add_connection(&sa).unwrap();
        session.add_connection(&sb).unwrap();
        session.add_connection(&sc).unwrap();

        let report = session.broadcast(a, b"hello");
        assert_eq!(
            report,
            BroadcastReport {
                queued: 2,
                ..Default::default()
            }
        );

        assert_eq!(read_n(&mut cb, 5), b"hello");
        assert_eq!(read_n(&mut cc, 5), b"hello");
        assert_nothing_received(&mut ca);
    }

    #[test]
    fn removed_connection_no_longer_receives() {
        let (_ca, sa) = tcp_pair();
        let (mut cb, sb) = tcp_pair();
        let (mut cc, sc) = tcp_pair();
        let mut session = Session::new(SessionId(1), 8);
        let a = session.add_connection(&sa).unwrap();
        session.add_connection(&sb).unwrap();
        let c = session.add_connection(&sc).unwrap();

        assert!(session.remove_connection(c));
        assert!(!session.remove_connection(c));
        assert_eq!(session.connection_count(), 2);

        let report = session.broadcast(a, b"after");
        assert_eq!(report.queued, 1);
        assert_eq!(read_n(&mut cb, 5), b"after");
        assert_nothing_received(&mut cc);
    }

    #[test]
    fn broadcasts_preserve_order_per_peer() {
        let (_ca, sa) = tcp_pair();
        let (_cb, sb) = tcp_pair();
        let (mut cc, sc) = tcp_pair();
        let mut session = Session::new(SessionId(1), 8);
        let a = session.add_connection(&sa).unwrap();
        let b = session.add_connection(&sb).unwrap();
        session.add_connection(&sc).unwrap();

        session.broadcast(a, b"one-");
        session.broadcast(b, b"two-");
        session.broadcast(a, b"three");

        assert_eq!(read_n(&mut cc, 13), b"one-two-three");
    }

    #[test]
    fn full_queue_disconnects_slow_peer() {
        let (_ca, sa) = tcp_pair();
        let (mut cb, sb) = tcp_pair();
        let (mut slow_client, slow_server) = tcp_pair();
        let mut session = Session::new(SessionId(1), 1);
        let a = session.add_connection(&sa).unwrap();
        session.add_connection(&sb).unwrap();

        // A peer with no writer thread: its queue fills after one chunk.
        let (tx, _stalled_rx) = mpsc::sync_channel(1);
        let addr = slow_server.peer_addr().unwrap();
        session.insert_peer(addr, slow_server, tx);

        let first = session.broadcast(a, b"x");
        assert_eq!(first.queued, 2);
        assert_eq!(first.evicted, 0);

        let second = session.broadcast(a, b"y");
        assert_eq!(second.queued, 1);
        assert_eq!(second.evicted, 1);

        // Evicted peers are skipped, not re-evicted.
        let third = session.broadcast(a, b"z");
        assert_eq!(third.queued, 1);
        assert_eq!(third.evicted, 0);

        // The slow peer sees its socket closed; the healthy one got everything.
        let mut buf = [0u8; 4];
        assert_eq!(slow_client.read(&mut buf).unwrap(), 0);
        assert_eq!(read_n(&mut cb, 3), b"xyz");

        // Eviction alone does not shrink the set; the reader thread does that.
        assert_eq!(session.connection_count(), 3);
    }

    #[test]
    fn peer_with_stopped_writer_is_skipped() {
        let (_ca, sa) = tcp_pair();
        let (_cb, sb) = tcp_pair();
        let mut session = Session::new(SessionId(1), 4);
        let a = session.add_connection(&sa).unwrap();

        let (tx, rx) = mpsc::sync_channel(4);
        drop(rx);
        let addr = sb.peer_addr().unwrap();
        session.insert_peer(addr, sb, tx);

        let report = session.broadcast(a, b"hi");
        assert_eq!(report.unreachable, 1);
        assert_eq!(report.queued, 0);
    }

    #[test]
    fn close_all_shuts_every_stream() {
        let (mut ca, sa) = tcp_pair();
        let (mut cb, sb) = tcp_pair();
        let mut session = Session::new(SessionId(1), 4);
        session.add_connection(&sa).unwrap();
        session.add_connection(&sb).unwrap();

        session.close_all();

        let mut buf = [0u8; 4];
        assert_eq!(ca.read(&mut buf).unwrap(), 0);
        assert_eq!(cb.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn closed_session_refuses_new_connections() {
        let (_ca, sa) = tcp_pair();
        let (_cb, sb) = tcp_pair();
        let mut session = Session::new(SessionId(1), 4);
        session.add_connection(&sa).unwrap();

        session.close_all();

        let err = session.add_connection(&sb).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(session.connection_count(), 1);
    }
}
