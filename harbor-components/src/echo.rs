//! Replies to a configured opcode with the request's own payload.

use harbor_core::{
    Component, CoreResult, HandlerOutcome, Packet, ServiceContext,
};

#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub opcode: u32,
}

impl Default for EchoConfig {
    fn default() -> Self {
        EchoConfig { opcode: 0x10 }
    }
}

pub struct EchoComponent {
    opcode: u32,
}

impl EchoComponent {
    pub fn new(config: EchoConfig) -> Self {
        EchoComponent {
            opcode: config.opcode,
        }
    }
}

impl Default for EchoComponent {
    fn default() -> Self {
        Self::new(EchoConfig::default())
    }
}

impl Component for EchoComponent {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        ctx.register_handler(self.opcode)
    }

    fn on_packet(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        packet: &Packet,
    ) -> CoreResult<HandlerOutcome> {
        ctx.reply(packet, 0, packet.payload.clone())?;
        tracing::debug!(
            "echoed {} byte(s) on session {}",
            packet.payload.len(),
            packet.session_id
        );
        Ok(HandlerOutcome::Handled)
    }
}
