//! Packet codec stack.
//!
//! The outermost transform is the frame codec: a 4-byte big-endian length
//! prefix covering everything after itself, then the fixed packet header,
//! then the payload. Inside the frame an ordered chain of payload layers
//! applies: decoding runs the chain in configured order, encoding in
//! reverse. Layers are looked up by name from a [`LayerRegistry`] when a
//! service's `codec_chain` config is built.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreResult, Error};
use crate::packet::{Packet, PacketFlags};

/// opcode u32 + serial u64 + status i32 + flags u16.
pub const HEADER_LEN: usize = 18;

pub const DEFAULT_MAX_PACKET: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome<T> {
    Ready(T),
    NeedMore,
    Malformed,
}

/// One pluggable payload transform (compression, masking, ...).
pub trait CodecLayer: Send {
    fn name(&self) -> &'static str;

    fn encode(&self, input: Bytes) -> CoreResult<Bytes>;

    fn decode(&self, input: Bytes) -> DecodeOutcome<Bytes>;
}

/// No-op layer; the default chain for services that configure none.
pub struct IdentityLayer;

impl CodecLayer for IdentityLayer {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encode(&self, input: Bytes) -> CoreResult<Bytes> {
        Ok(input)
    }

    fn decode(&self, input: Bytes) -> DecodeOutcome<Bytes> {
        DecodeOutcome::Ready(input)
    }
}

/// Length-prefixed wire framing with a packet-size ceiling.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_packet: usize,
}

impl FrameCodec {
    pub fn new(max_packet: usize) -> Self {
        FrameCodec { max_packet }
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    pub fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> CoreResult<()> {
        self.encode_with(packet, &packet.payload, dst)
    }

    /// Frames `packet` with an already layer-transformed `payload`.
    fn encode_with(&self, packet: &Packet, payload: &[u8], dst: &mut BytesMut) -> CoreResult<()> {
        let len = HEADER_LEN + payload.len();
        if len > self.max_packet {
            return Err(Error::Protocol(format!(
                "packet length {len} exceeds max {}",
                self.max_packet
            )));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u32(packet.opcode);
        dst.put_u64(packet.serial);
        dst.put_i32(packet.status);
        dst.put_u16(packet.flags.bits());
        dst.put_slice(payload);
        Ok(())
    }

    /// Consumes at most one frame from `src`. `session_id` on the returned
    /// packet is left for the caller to fill in.
    pub fn decode(&self, src: &mut BytesMut) -> DecodeOutcome<Packet> {
        if src.len() < 4 {
            return DecodeOutcome::NeedMore;
        }
        let len = u32::from_be_bytes(src[..4].try_into().expect("4 bytes")) as usize;
        if len < HEADER_LEN || len > self.max_packet {
            return DecodeOutcome::Malformed;
        }
        if src.len() < 4 + len {
            return DecodeOutcome::NeedMore;
        }
        src.advance(4);
        let opcode = src.get_u32();
        let serial = src.get_u64();
        let status = src.get_i32();
        let flags = PacketFlags::from_bits(src.get_u16());
        let payload = src.split_to(len - HEADER_LEN).freeze();
        DecodeOutcome::Ready(Packet {
            opcode,
            serial,
            status,
            flags,
            session_id: 0,
            payload,
        })
    }
}

/// Frame codec plus the service's ordered payload layers.
pub struct CodecChain {
    frame: FrameCodec,
    layers: Vec<Box<dyn CodecLayer>>,
}

impl std::fmt::Debug for CodecChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecChain")
            .field("frame", &self.frame)
            .field("layers", &self.layers.iter().map(|l| l.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl CodecChain {
    pub fn new(frame: FrameCodec) -> Self {
        CodecChain {
            frame,
            layers: Vec::new(),
        }
    }

    pub fn push_layer(&mut self, layer: Box<dyn CodecLayer>) {
        self.layers.push(layer);
    }

    pub fn max_packet(&self) -> usize {
        self.frame.max_packet()
    }

    pub fn encode(&self, packet: &Packet, dst: &mut BytesMut) -> CoreResult<()> {
        let mut payload = packet.payload.clone();
        for layer in self.layers.iter().rev() {
            payload = layer.encode(payload)?;
        }
        self.frame.encode_with(packet, &payload, dst)
    }

    pub fn decode(&self, src: &mut BytesMut) -> DecodeOutcome<Packet> {
        let mut packet = match self.frame.decode(src) {
            DecodeOutcome::Ready(packet) => packet,
            DecodeOutcome::NeedMore => return DecodeOutcome::NeedMore,
            DecodeOutcome::Malformed => return DecodeOutcome::Malformed,
        };
        for layer in &self.layers {
            match layer.decode(packet.payload) {
                DecodeOutcome::Ready(payload) => packet.payload = payload,
                // The frame is complete; a layer asking for more bytes can
                // never be satisfied.
                DecodeOutcome::NeedMore | DecodeOutcome::Malformed => {
                    return DecodeOutcome::Malformed
                }
            }
        }
        DecodeOutcome::Ready(packet)
    }
}

type LayerFactory = Box<dyn Fn() -> Box<dyn CodecLayer> + Send + Sync>;

/// Name-keyed layer factories; `codec_chain` config entries resolve here.
pub struct LayerRegistry {
    factories: HashMap<String, LayerFactory>,
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerRegistry {
    pub fn new() -> Self {
        let mut registry = LayerRegistry {
            factories: HashMap::new(),
        };
        registry
            .register("identity", || Box::new(IdentityLayer) as Box<dyn CodecLayer>)
            .expect("fresh registry");
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> CoreResult<()>
    where
        F: Fn() -> Box<dyn CodecLayer> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::Repeat(format!("codec layer '{name}'")));
        }
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn build_chain(&self, names: &[String], frame: FrameCodec) -> CoreResult<CodecChain> {
        let mut chain = CodecChain::new(frame);
        for name in names {
            let factory = self
                .factories
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("codec layer '{name}'")))?;
            chain.push_layer(factory());
        }
        Ok(chain)
    }
}
