//! End-to-end scenarios over loopback sockets: services run on their own
//! threads under a [`ServiceManager`], clients are plain blocking TCP.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use harbor_core::{
    CloseReason, CodecChain, Component, CoreResult, Envelope, FrameCodec, HandlerOutcome,
    LayerRegistry, ManagerConfig, Packet, PacketFlags, ServiceBuilder, ServiceConfig,
    ServiceContext, ServiceManager, Variant,
};

fn manager() -> ServiceManager {
    ServiceManager::new(ManagerConfig::default(), LayerRegistry::new())
}

fn listener_config(name: &str) -> ServiceConfig {
    let mut config = ServiceConfig::new(name);
    config.listen_addr = Some("127.0.0.1:0".into());
    config
}

fn codec() -> CodecChain {
    CodecChain::new(FrameCodec::new(16 * 1024 * 1024))
}

fn frame(packet: &Packet) -> Vec<u8> {
    let mut wire = BytesMut::new();
    codec().encode(packet, &mut wire).unwrap();
    wire.to_vec()
}

fn read_frame(stream: &mut TcpStream) -> Packet {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).unwrap();
    let body_len = u32::from_be_bytes(len) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).unwrap();

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&body);
    match codec().decode(&mut buf) {
        harbor_core::DecodeOutcome::Ready(packet) => packet,
        other => panic!("bad reply frame: {other:?}"),
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

struct Echo;

impl Component for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        ctx.register_handler(0x10)
    }

    fn on_packet(
        &mut self,
        ctx: &mut ServiceContext<'_>,
        packet: &Packet,
    ) -> CoreResult<HandlerOutcome> {
        ctx.reply(packet, 0, packet.payload.clone())?;
        Ok(HandlerOutcome::Handled)
    }
}

#[test]
fn echo_roundtrip_preserves_serial_and_payload() {
    let manager = manager();
    let handle = manager
        .create(ServiceBuilder::new(listener_config("echo")).component(Echo))
        .unwrap();
    let addr = handle.listen_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut request = Packet::new(0x10, "hello").with_flags(PacketFlags::EXPECT_REPLY);
    request.serial = 42;
    client.write_all(&frame(&request)).unwrap();

    let reply = read_frame(&mut client);
    assert_eq!(reply.opcode, 0x10);
    assert_eq!(reply.serial, 42);
    assert_eq!(reply.status, 0);
    assert_eq!(&reply.payload[..], b"hello");

    manager.stop_all().err().unwrap();
}

struct OrderRecorder {
    seen: Arc<Mutex<Vec<u8>>>,
}

impl Component for OrderRecorder {
    fn name(&self) -> &str {
        "order"
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        ctx.register_handler(0x20)
    }

    fn on_packet(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        packet: &Packet,
    ) -> CoreResult<HandlerOutcome> {
        self.seen.lock().unwrap().push(packet.payload[0]);
        Ok(HandlerOutcome::Handled)
    }
}

#[test]
fn packets_dispatch_in_receive_order_per_session() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let manager = manager();
    let handle = manager
        .create(
            ServiceBuilder::new(listener_config("ordered")).component(OrderRecorder {
                seen: seen.clone(),
            }),
        )
        .unwrap();

    let mut client = TcpStream::connect(handle.listen_addr().unwrap()).unwrap();
    let mut wire = Vec::new();
    for i in 0u8..20 {
        wire.extend_from_slice(&frame(&Packet::new(0x20, vec![i])));
    }
    client.write_all(&wire).unwrap();

    wait_for("all packets", || seen.lock().unwrap().len() == 20);
    assert_eq!(*seen.lock().unwrap(), (0u8..20).collect::<Vec<u8>>());
    manager.stop_all().err().unwrap();
}

struct PingSender {
    target: String,
}

impl Component for PingSender {
    fn name(&self) -> &str {
        "ping-sender"
    }

    fn on_update(&mut self, ctx: &mut ServiceContext<'_>, _dt_ms: u64) {
        let payload: Variant = [("seq".to_string(), Variant::Int(42))].into_iter().collect();
        let _ = ctx.post_to_named(&self.target, Envelope::new("ping", payload));
    }
}

struct PingReceiver {
    got: Arc<Mutex<Option<(String, i64, Option<u64>)>>>,
}

impl Component for PingReceiver {
    fn name(&self) -> &str {
        "ping-receiver"
    }

    fn on_message(&mut self, _ctx: &mut ServiceContext<'_>, env: &Envelope) {
        let seq = env.payload.get("seq").as_int().unwrap_or(-1);
        *self.got.lock().unwrap() = Some((env.tag.clone(), seq, env.from));
    }
}

#[test]
fn cross_service_envelope_arrives_intact() {
    let got = Arc::new(Mutex::new(None));
    let manager = manager();
    let receiver = manager
        .create(
            ServiceBuilder::new(ServiceConfig::new("s2")).component(PingReceiver {
                got: got.clone(),
            }),
        )
        .unwrap();
    let sender = manager
        .create(ServiceBuilder::new(ServiceConfig::new("s1")).component(PingSender {
            target: "s2".into(),
        }))
        .unwrap();

    wait_for("cross-service ping", || got.lock().unwrap().is_some());
    let (tag, seq, from) = got.lock().unwrap().clone().unwrap();
    assert_eq!(tag, "ping");
    assert_eq!(seq, 42);
    assert_eq!(from, Some(sender.id()));
    assert_ne!(sender.id(), receiver.id());

    manager.stop_all().err().unwrap();
}

struct StrictHandler {
    handled: Arc<AtomicBool>,
    closed: Arc<Mutex<Option<CloseReason>>>,
}

impl Component for StrictHandler {
    fn name(&self) -> &str {
        "strict"
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        ctx.register_handler(0x30)
    }

    fn on_packet(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _packet: &Packet,
    ) -> CoreResult<HandlerOutcome> {
        self.handled.store(true, Ordering::SeqCst);
        Ok(HandlerOutcome::Handled)
    }

    fn on_session_close(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        _session: u64,
        reason: CloseReason,
    ) {
        *self.closed.lock().unwrap() = Some(reason);
    }
}

#[test]
fn malformed_frame_closes_session_without_dispatch() {
    let handled = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(Mutex::new(None));
    let manager = manager();
    let handle = manager
        .create(
            ServiceBuilder::new(listener_config("strict")).component(StrictHandler {
                handled: handled.clone(),
                closed: closed.clone(),
            }),
        )
        .unwrap();

    let mut client = TcpStream::connect(handle.listen_addr().unwrap()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // Length says 4, but a valid frame needs at least the 18-byte header.
    client.write_all(&[0, 0, 0, 4, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

    wait_for("protocol close", || closed.lock().unwrap().is_some());
    assert_eq!(*closed.lock().unwrap(), Some(CloseReason::Protocol));
    assert!(!handled.load(Ordering::SeqCst), "no handler may run");

    // The server side hangs up on us.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    manager.stop_all().err().unwrap();
}

struct EnvelopeCounter {
    count: Arc<AtomicUsize>,
}

impl Component for EnvelopeCounter {
    fn name(&self) -> &str {
        "counter"
    }

    fn on_message(&mut self, _ctx: &mut ServiceContext<'_>, _env: &Envelope) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn high_fps_service_still_drains_its_queue() {
    let count = Arc::new(AtomicUsize::new(0));
    let mut config = ServiceConfig::new("fast");
    config.fps = 1000;
    let manager = manager();
    let handle = manager
        .create(ServiceBuilder::new(config).component(EnvelopeCounter {
            count: count.clone(),
        }))
        .unwrap();

    for _ in 0..50 {
        handle.post(Envelope::new("tick", Variant::Null)).unwrap();
    }
    wait_for("all envelopes", || count.load(Ordering::SeqCst) == 50);
    manager.stop_all().err().unwrap();
}

struct FpsWatcher {
    observed: Arc<AtomicUsize>,
}

impl Component for FpsWatcher {
    fn name(&self) -> &str {
        "fps-watcher"
    }

    fn on_config_reload(&mut self, ctx: &mut ServiceContext<'_>) {
        self.observed
            .store(ctx.config().fps as usize, Ordering::SeqCst);
    }
}

#[test]
fn config_reload_notifies_components() {
    let observed = Arc::new(AtomicUsize::new(0));
    let manager = manager();
    let handle = manager
        .create(ServiceBuilder::new(ServiceConfig::new("reloadable")).component(FpsWatcher {
            observed: observed.clone(),
        }))
        .unwrap();

    let mut updated = ServiceConfig::new("reloadable");
    updated.fps = 120;
    manager.reload(handle.id(), updated).unwrap();

    wait_for("reload notification", || {
        observed.load(Ordering::SeqCst) == 120
    });
    manager.stop_all().err().unwrap();
}
