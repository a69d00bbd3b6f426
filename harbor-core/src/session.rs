//! Per-connection framing state, owned by the service loop.
//!
//! The poller owns the socket; this is the service-side record: receive
//! accumulation, the outbound serial counter, and a linear state machine.
//! The loop structure guarantees at most one in-flight decode per session.

use std::net::SocketAddr;

use bytes::BytesMut;

use crate::codec::{CodecChain, DecodeOutcome};
use crate::error::{CoreResult, Error};
use crate::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

pub struct Session {
    id: u64,
    peer: Option<SocketAddr>,
    state: SessionState,
    recv: BytesMut,
    last_serial: u64,
}

impl Session {
    pub(crate) fn accepted(id: u64, peer: SocketAddr) -> Self {
        Session {
            id,
            peer: Some(peer),
            state: SessionState::Connected,
            recv: BytesMut::new(),
            last_serial: 0,
        }
    }

    pub(crate) fn connecting(id: u64) -> Self {
        Session {
            id,
            peer: None,
            state: SessionState::Connecting,
            recv: BytesMut::new(),
            last_serial: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transitions are linear and monotonic; moving backwards is a logic
    /// error and is ignored in release builds.
    pub(crate) fn advance(&mut self, state: SessionState) {
        debug_assert!(state >= self.state, "session state moved backwards");
        if state > self.state {
            self.state = state;
        }
    }

    /// Serial for the next outbound packet on this session. Monotonic,
    /// assigned at enqueue time.
    pub(crate) fn next_serial(&mut self) -> u64 {
        self.last_serial += 1;
        self.last_serial
    }

    /// Feeds received bytes through the codec, appending every completed
    /// packet to `out`. A malformed frame poisons the whole session.
    pub(crate) fn ingest(
        &mut self,
        bytes: &[u8],
        codec: &CodecChain,
        out: &mut Vec<Packet>,
    ) -> CoreResult<()> {
        self.recv.extend_from_slice(bytes);
        loop {
            match codec.decode(&mut self.recv) {
                DecodeOutcome::Ready(mut packet) => {
                    packet.session_id = self.id;
                    out.push(packet);
                }
                DecodeOutcome::NeedMore => return Ok(()),
                DecodeOutcome::Malformed => {
                    return Err(Error::Protocol(format!(
                        "session {} sent a malformed frame",
                        self.id
                    )))
                }
            }
        }
    }
}
