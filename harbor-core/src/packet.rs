//! Framed application message.

use std::ops::BitOr;

use bytes::Bytes;

/// Bit flags carried on the wire in a u16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    pub const RELIABLE: PacketFlags = PacketFlags(1 << 0);
    pub const BROADCAST: PacketFlags = PacketFlags(1 << 1);
    pub const ONEWAY: PacketFlags = PacketFlags(1 << 2);
    /// Sender wants a reply carrying the same serial.
    pub const EXPECT_REPLY: PacketFlags = PacketFlags(1 << 3);
    /// A handler error on this packet also closes the session.
    pub const CLOSE_ON_ERROR: PacketFlags = PacketFlags(1 << 4);

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        PacketFlags(bits)
    }

    pub const fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PacketFlags {
    type Output = PacketFlags;

    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// One application message.
///
/// `serial` is assigned by the sending service at enqueue time and is
/// monotonic per session; replies echo the request's serial. `session_id`
/// is loop-local routing state and never leaves the process.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub opcode: u32,
    pub serial: u64,
    pub status: i32,
    pub flags: PacketFlags,
    pub session_id: u64,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(opcode: u32, payload: impl Into<Bytes>) -> Self {
        Packet {
            opcode,
            serial: 0,
            status: 0,
            flags: PacketFlags::empty(),
            session_id: 0,
            payload: payload.into(),
        }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builds a reply to `req`: same opcode and serial, routed back to the
    /// originating session.
    pub fn reply_to(req: &Packet, status: i32, payload: impl Into<Bytes>) -> Self {
        Packet {
            opcode: req.opcode,
            serial: req.serial,
            status,
            flags: PacketFlags::empty(),
            session_id: req.session_id,
            payload: payload.into(),
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.flags.contains(PacketFlags::EXPECT_REPLY)
    }

    pub fn close_on_error(&self) -> bool {
        self.flags.contains(PacketFlags::CLOSE_ON_ERROR)
    }
}
