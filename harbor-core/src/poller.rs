//! Non-blocking socket multiplexer.
//!
//! The poller owns every socket: listeners and per-connection streams with
//! their raw send buffers. The service holds connections only by id and
//! consumes [`SocketEvent`]s. Back-pressure is enforced here: once a
//! connection's send buffer sits at its high-water mark, further sends
//! return `WouldBlock` until a drain event ([`SocketEvent::Writable`]) is
//! emitted.
//!
//! Ids are allocated from one process-wide counter, so session ids are
//! unique across services. Token 0 is reserved for the cross-thread waker.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{trace, warn};

use crate::error::{CoreResult, Error};

const WAKER_TOKEN: Token = Token(0);
const READ_CHUNK: usize = 16 * 1024;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

fn next_endpoint_id() -> u64 {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side.
    Local,
    /// Peer closed the connection.
    Peer,
    /// Malformed frame; the codec rejected the byte stream.
    Protocol,
    /// Transport failure, with the diagnostic kind.
    Io(io::ErrorKind),
}

#[derive(Debug)]
pub enum SocketEvent {
    Accepted {
        listener: u64,
        session: u64,
        peer: SocketAddr,
    },
    /// An outbound connect completed.
    Connected { session: u64 },
    Readable { session: u64, bytes: Bytes },
    /// The send buffer fully drained; back-pressured senders may retry.
    Writable { session: u64 },
    Closed { session: u64, reason: CloseReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
    /// Close requested with linger; flush then close.
    Closing,
}

struct Conn {
    stream: TcpStream,
    send_buf: BytesMut,
    state: ConnState,
}

pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listeners: HashMap<u64, TcpListener>,
    conns: HashMap<u64, Conn>,
    high_water: usize,
    /// Events produced outside `poll` (e.g. immediate closes).
    pending: Vec<SocketEvent>,
}

impl Poller {
    pub fn new(high_water: usize) -> CoreResult<Self> {
        let poll = Poll::new().map_err(io_internal)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(io_internal)?;
        Ok(Poller {
            poll,
            events: Events::with_capacity(1024),
            waker: Arc::new(waker),
            listeners: HashMap::new(),
            conns: HashMap::new(),
            high_water,
            pending: Vec::new(),
        })
    }

    /// Handle other threads use to interrupt a blocked `poll`.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn listen(&mut self, addr: SocketAddr) -> CoreResult<u64> {
        let mut listener = TcpListener::bind(addr)
            .map_err(|e| Error::Arg(format!("bind {addr}: {e}")))?;
        let id = next_endpoint_id();
        self.poll
            .registry()
            .register(&mut listener, Token(id as usize), Interest::READABLE)
            .map_err(io_internal)?;
        self.listeners.insert(id, listener);
        Ok(id)
    }

    /// Actual bound address of a listener (useful with port 0).
    pub fn listen_addr(&self, listener: u64) -> Option<SocketAddr> {
        self.listeners.get(&listener).and_then(|l| l.local_addr().ok())
    }

    pub fn connect(&mut self, addr: SocketAddr) -> CoreResult<u64> {
        let mut stream = TcpStream::connect(addr)
            .map_err(|e| Error::Arg(format!("connect {addr}: {e}")))?;
        let id = next_endpoint_id();
        self.poll
            .registry()
            .register(
                &mut stream,
                Token(id as usize),
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(io_internal)?;
        self.conns.insert(
            id,
            Conn {
                stream,
                send_buf: BytesMut::new(),
                state: ConnState::Connecting,
            },
        );
        Ok(id)
    }

    /// Queues `bytes` on the session's send buffer and flushes as much as
    /// the socket accepts. `WouldBlock` means the buffer already sits at
    /// its high-water mark; retry after the next drain event.
    pub fn send(&mut self, session: u64, bytes: &[u8]) -> CoreResult<()> {
        let conn = self
            .conns
            .get_mut(&session)
            .ok_or_else(|| Error::Closed(format!("session {session}")))?;
        if conn.state == ConnState::Closing {
            return Err(Error::Closed(format!("session {session} is closing")));
        }
        if conn.send_buf.len() >= self.high_water {
            return Err(Error::WouldBlock);
        }
        conn.send_buf.extend_from_slice(bytes);

        if conn.state == ConnState::Connected {
            if let Err(kind) = flush(conn) {
                self.drop_conn(session, CloseReason::Io(kind));
                return Err(Error::Closed(format!("session {session}")));
            }
        }
        self.update_interest(session);
        Ok(())
    }

    /// Closes a session. With `linger` the send buffer is flushed first;
    /// without, buffered bytes are discarded.
    pub fn close(&mut self, session: u64, linger: bool) -> CoreResult<()> {
        let conn = self
            .conns
            .get_mut(&session)
            .ok_or_else(|| Error::NotFound(format!("session {session}")))?;
        if linger && !conn.send_buf.is_empty() && conn.state == ConnState::Connected {
            conn.state = ConnState::Closing;
            self.update_interest(session);
            return Ok(());
        }
        self.drop_conn(session, CloseReason::Local);
        Ok(())
    }

    /// Closes a session because its byte stream failed framing.
    pub fn close_protocol(&mut self, session: u64) {
        if self.conns.contains_key(&session) {
            self.drop_conn(session, CloseReason::Protocol);
        }
    }

    pub fn has_session(&self, session: u64) -> bool {
        self.conns.contains_key(&session)
    }

    /// Waits up to `timeout` for readiness and appends resulting events to
    /// `out`. Returns the number of events appended.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<SocketEvent>) -> CoreResult<usize> {
        let before = out.len();
        out.append(&mut self.pending);

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(io_internal(e)),
        }

        let tokens: Vec<usize> = self.events.iter().map(|ev| ev.token().0).collect();
        for token in tokens {
            if Token(token) == WAKER_TOKEN {
                continue;
            }
            let id = token as u64;
            if self.listeners.contains_key(&id) {
                self.accept_ready(id, out);
            } else if self.conns.contains_key(&id) {
                self.conn_ready(id, out);
            }
        }
        Ok(out.len() - before)
    }

    fn accept_ready(&mut self, listener_id: u64, out: &mut Vec<SocketEvent>) {
        loop {
            let accepted = match self.listeners.get_mut(&listener_id) {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((mut stream, peer)) => {
                    let id = next_endpoint_id();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(id as usize),
                        Interest::READABLE,
                    ) {
                        warn!("register accepted stream from {peer} failed: {e}");
                        continue;
                    }
                    self.conns.insert(
                        id,
                        Conn {
                            stream,
                            send_buf: BytesMut::new(),
                            state: ConnState::Connected,
                        },
                    );
                    out.push(SocketEvent::Accepted {
                        listener: listener_id,
                        session: id,
                        peer,
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept on listener {listener_id} failed: {e}");
                    return;
                }
            }
        }
    }

    fn conn_ready(&mut self, id: u64, out: &mut Vec<SocketEvent>) {
        // Writable side first: connect completion and buffered flush.
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.state == ConnState::Connecting {
            match conn.stream.take_error() {
                Ok(None) => {
                    if conn.stream.peer_addr().is_ok() {
                        conn.state = ConnState::Connected;
                        out.push(SocketEvent::Connected { session: id });
                    }
                }
                Ok(Some(e)) | Err(e) => {
                    self.drop_conn_into(id, CloseReason::Io(e.kind()), out);
                    return;
                }
            }
        }

        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let had_backlog = !conn.send_buf.is_empty();
        if conn.state != ConnState::Connecting {
            if let Err(kind) = flush(conn) {
                self.drop_conn_into(id, CloseReason::Io(kind), out);
                return;
            }
        }
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if had_backlog && conn.send_buf.is_empty() {
            if conn.state == ConnState::Closing {
                self.drop_conn_into(id, CloseReason::Local, out);
                return;
            }
            out.push(SocketEvent::Writable { session: id });
        }

        // Readable side.
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        let mut received = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];
        let closed = loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => break Some(CloseReason::Peer),
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(CloseReason::Io(e.kind())),
            }
        };
        if !received.is_empty() {
            trace!("session {id} read {} bytes", received.len());
            out.push(SocketEvent::Readable {
                session: id,
                bytes: received.freeze(),
            });
        }
        match closed {
            Some(reason) => self.drop_conn_into(id, reason, out),
            None => self.update_interest(id),
        }
    }

    fn update_interest(&mut self, id: u64) {
        if let Some(conn) = self.conns.get_mut(&id) {
            let interest = if conn.send_buf.is_empty() && conn.state == ConnState::Connected {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut conn.stream, Token(id as usize), interest)
            {
                warn!("reregister session {id} failed: {e}");
            }
        }
    }

    fn drop_conn(&mut self, id: u64, reason: CloseReason) {
        let mut events = Vec::new();
        self.drop_conn_into(id, reason, &mut events);
        self.pending.append(&mut events);
    }

    fn drop_conn_into(&mut self, id: u64, reason: CloseReason, out: &mut Vec<SocketEvent>) {
        if let Some(mut conn) = self.conns.remove(&id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            out.push(SocketEvent::Closed {
                session: id,
                reason,
            });
        }
    }
}

/// Writes as much of the send buffer as the socket accepts right now.
fn flush(conn: &mut Conn) -> Result<(), io::ErrorKind> {
    while !conn.send_buf.is_empty() {
        match conn.stream.write(&conn.send_buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero),
            Ok(n) => conn.send_buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.kind()),
        }
    }
    Ok(())
}

fn io_internal(e: io::Error) -> Error {
    Error::Internal(format!("poller io: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn poll_until<F>(poller: &mut Poller, out: &mut Vec<SocketEvent>, mut done: F)
    where
        F: FnMut(&[SocketEvent]) -> bool,
    {
        for _ in 0..200 {
            poller
                .poll(Some(Duration::from_millis(10)), out)
                .unwrap();
            if done(out) {
                return;
            }
        }
        panic!("condition not reached; events: {out:?}");
    }

    #[test]
    fn accept_read_write_roundtrip() {
        let mut server = Poller::new(64 * 1024).unwrap();
        let mut client = Poller::new(64 * 1024).unwrap();
        let listener = server.listen(localhost()).unwrap();
        let addr = server.listen_addr(listener).unwrap();

        let out_session = client.connect(addr).unwrap();
        let mut client_events = Vec::new();
        poll_until(&mut client, &mut client_events, |evs| {
            evs.iter()
                .any(|e| matches!(e, SocketEvent::Connected { .. }))
        });

        let mut server_events = Vec::new();
        poll_until(&mut server, &mut server_events, |evs| {
            evs.iter()
                .any(|e| matches!(e, SocketEvent::Accepted { .. }))
        });
        let in_session = server_events
            .iter()
            .find_map(|e| match e {
                SocketEvent::Accepted { session, .. } => Some(*session),
                _ => None,
            })
            .unwrap();
        assert_ne!(in_session, out_session, "ids are process-unique");

        client.send(out_session, b"ping").unwrap();
        server_events.clear();
        poll_until(&mut server, &mut server_events, |evs| {
            evs.iter()
                .any(|e| matches!(e, SocketEvent::Readable { .. }))
        });
        let bytes = server_events
            .iter()
            .find_map(|e| match e {
                SocketEvent::Readable { bytes, .. } => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(&bytes[..], b"ping");
    }

    #[test]
    fn peer_close_emits_closed() {
        let mut server = Poller::new(1024).unwrap();
        let listener = server.listen(localhost()).unwrap();
        let addr = server.listen_addr(listener).unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let mut events = Vec::new();
        poll_until(&mut server, &mut events, |evs| {
            evs.iter()
                .any(|e| matches!(e, SocketEvent::Accepted { .. }))
        });
        drop(client);
        events.clear();
        poll_until(&mut server, &mut events, |evs| {
            evs.iter().any(|e| {
                matches!(
                    e,
                    SocketEvent::Closed {
                        reason: CloseReason::Peer,
                        ..
                    }
                )
            })
        });
    }

    #[test]
    fn send_to_unknown_session_is_closed_error() {
        let mut poller = Poller::new(1024).unwrap();
        assert_eq!(poller.send(9999, b"x").unwrap_err().kind(), Kind::Closed);
    }

    #[test]
    fn high_water_mark_reports_would_block() {
        let mut server = Poller::new(1024).unwrap();
        let listener = server.listen(localhost()).unwrap();
        let addr = server.listen_addr(listener).unwrap();

        // Connect but never read, so the kernel buffers fill and our
        // userspace send buffer backs up.
        let mut client = Poller::new(16).unwrap();
        let session = client.connect(addr).unwrap();
        let mut events = Vec::new();
        poll_until(&mut client, &mut events, |evs| {
            evs.iter()
                .any(|e| matches!(e, SocketEvent::Connected { .. }))
        });
        let mut server_events = Vec::new();
        poll_until(&mut server, &mut server_events, |evs| {
            evs.iter()
                .any(|e| matches!(e, SocketEvent::Accepted { .. }))
        });

        let chunk = vec![0u8; 64 * 1024];
        let mut hit_high_water = false;
        for _ in 0..1024 {
            match client.send(session, &chunk) {
                Ok(()) => {}
                Err(e) => {
                    assert_eq!(e.kind(), Kind::WouldBlock);
                    hit_high_water = true;
                    break;
                }
            }
        }
        assert!(hit_high_water, "send buffer never reached high water");

        // Once the peer drains, a Writable event arrives and sends succeed
        // again.
        let mut drained = false;
        for _ in 0..500 {
            let mut server_events = Vec::new();
            server
                .poll(Some(Duration::from_millis(5)), &mut server_events)
                .unwrap();
            let mut client_events = Vec::new();
            client
                .poll(Some(Duration::from_millis(5)), &mut client_events)
                .unwrap();
            if client_events
                .iter()
                .any(|e| matches!(e, SocketEvent::Writable { .. }))
            {
                drained = true;
                break;
            }
        }
        assert!(drained, "drain event never arrived");
        client.send(session, b"after-drain").unwrap();
    }
}
