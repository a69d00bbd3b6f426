//! Single-byte XOR payload masking.
//!
//! A deliberately small codec layer: enough to exercise the layer chain
//! (encode applies layers in reverse, decode forward) without pulling in a
//! real cipher.

use bytes::Bytes;
use harbor_core::{CodecLayer, CoreResult, DecodeOutcome, LayerRegistry};

pub struct MaskingLayer {
    key: u8,
}

impl MaskingLayer {
    pub fn new(key: u8) -> Self {
        MaskingLayer { key }
    }

    /// Registers this layer under `"masking"` so configs can name it in
    /// `codec_chain`.
    pub fn register(registry: &mut LayerRegistry, key: u8) -> CoreResult<()> {
        registry.register("masking", move || {
            Box::new(MaskingLayer::new(key)) as Box<dyn CodecLayer>
        })
    }
}

impl CodecLayer for MaskingLayer {
    fn name(&self) -> &'static str {
        "masking"
    }

    fn encode(&self, input: Bytes) -> CoreResult<Bytes> {
        Ok(input.iter().map(|b| b ^ self.key).collect())
    }

    fn decode(&self, input: Bytes) -> DecodeOutcome<Bytes> {
        DecodeOutcome::Ready(input.iter().map(|b| b ^ self.key).collect())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use harbor_core::{CodecChain, FrameCodec, Packet};

    use super::*;

    #[test]
    fn masked_roundtrip() {
        let mut chain = CodecChain::new(FrameCodec::new(1024));
        chain.push_layer(Box::new(MaskingLayer::new(0x5A)));

        let packet = Packet::new(1, "secret");
        let mut wire = BytesMut::new();
        chain.encode(&packet, &mut wire).unwrap();
        // Payload is masked on the wire.
        assert_ne!(&wire[wire.len() - 6..], b"secret");

        match chain.decode(&mut wire) {
            DecodeOutcome::Ready(decoded) => assert_eq!(&decoded.payload[..], b"secret"),
            other => panic!("{other:?}"),
        }
    }
}
