//! The service runtime: a single-threaded cooperative loop that multiplexes
//! cross-thread messages, socket readiness, timers, and component ticks.
//!
//! # Tick structure
//!
//! Each frame, in order: drain the message queue (bounded by
//! `frame_drain_cap`), wait on the poller for at most
//! `min(remaining frame, next timer due)`, route socket events through the
//! dispatch pipeline, tick the timer wheel, run component updates, and drain
//! the tick's auto-release pool frame. [`Service::run`] then sleeps off the
//! rest of the frame budget, or yields when already over it.
//!
//! # Dispatch
//!
//! Inbound packets run pre-filters (which may short-circuit), then the
//! opcode's handler, then post-filters (always). A panicking handler is
//! caught at the dispatch boundary, logged with the packet's metadata, and
//! treated as an error outcome.
//!
//! # State machine
//!
//! `Created → Starting → Running → Stopping → Stopped`, strictly forward.
//! Only `Created → Starting` (via [`Service::start`]) and
//! `Running → Stopping` (via a stop message or [`ServiceContext::stop_service`])
//! are externally triggerable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use mio::Waker;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecChain, FrameCodec, LayerRegistry};
use crate::component::{Component, ComponentRegistry, HandlerOutcome};
use crate::config::ServiceConfig;
use crate::error::{AnyResult, CoreResult, Error, Kind};
use crate::mq::{Envelope, MessageQueue, MessageSender, ServiceId};
use crate::object::pool::AutoReleasePool;
use crate::object::Retained;
use crate::packet::Packet;
use crate::poller::{Poller, SocketEvent};
use crate::session::{Session, SessionState};
use crate::timer::{TimerId, TimerWheel};

mod context;

pub use context::{DispatchOutcome, FilterAction, PostFilter, PreFilter, ServiceContext};

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Everything a service's queue can carry.
#[derive(Debug)]
pub(crate) enum LoopMessage {
    User(Envelope),
    Stop,
    ConfigReload(ServiceConfig),
    /// Send request from another thread; the loop assigns the serial.
    SendPacket { session: u64, packet: Packet },
    CloseSession { session: u64 },
}

/// Cheap cross-thread handle to a running service: its queue plus the waker
/// that interrupts a blocked poll.
#[derive(Clone)]
pub struct ServiceHandle {
    id: ServiceId,
    name: String,
    listen_addr: Option<SocketAddr>,
    sender: MessageSender<LoopMessage>,
    waker: Arc<Waker>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("listen_addr", &self.listen_addr)
            .finish()
    }
}

impl ServiceHandle {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound listener address, once the service started with one.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Hands an envelope into the service loop.
    pub fn post(&self, env: Envelope) -> CoreResult<()> {
        self.send(LoopMessage::User(env))
    }

    /// Queues a packet send on the loop thread. Delivery is best-effort:
    /// failures past this point are logged by the loop, not reported back.
    pub fn send_packet(&self, session: u64, packet: Packet) -> CoreResult<()> {
        self.send(LoopMessage::SendPacket { session, packet })
    }

    /// Asks the loop to close a session gracefully.
    pub fn close_session(&self, session: u64) -> CoreResult<()> {
        self.send(LoopMessage::CloseSession { session })
    }

    pub(crate) fn send(&self, msg: LoopMessage) -> CoreResult<()> {
        self.sender.push(msg)?;
        if let Err(e) = self.waker.wake() {
            warn!("wake service '{}' failed: {e}", self.name);
        }
        Ok(())
    }
}

/// Shared service directory used for cross-service posting.
#[derive(Default)]
pub(crate) struct Routes {
    inner: RwLock<RouteMap>,
}

#[derive(Default)]
struct RouteMap {
    by_id: HashMap<ServiceId, ServiceHandle>,
    by_name: HashMap<String, ServiceId>,
}

impl Routes {
    pub(crate) fn insert(&self, handle: ServiceHandle) {
        let mut map = self.lock_mut();
        map.by_name.insert(handle.name.clone(), handle.id);
        map.by_id.insert(handle.id, handle);
    }

    pub(crate) fn remove(&self, id: ServiceId) -> Option<ServiceHandle> {
        let mut map = self.lock_mut();
        let handle = map.by_id.remove(&id)?;
        map.by_name.remove(&handle.name);
        Some(handle)
    }

    pub(crate) fn get_by_id(&self, id: ServiceId) -> Option<ServiceHandle> {
        self.lock().by_id.get(&id).cloned()
    }

    pub(crate) fn get_by_name(&self, name: &str) -> Option<ServiceHandle> {
        let map = self.lock();
        let id = map.by_name.get(name)?;
        map.by_id.get(id).cloned()
    }

    pub(crate) fn ids_in_order(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.lock().by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn post_by_id(&self, id: ServiceId, msg: LoopMessage) -> CoreResult<()> {
        match self.get_by_id(id) {
            Some(handle) => handle.send(msg),
            None => Err(Error::NotFound(format!("service {id}"))),
        }
    }

    pub(crate) fn post_by_name(&self, name: &str, msg: LoopMessage) -> CoreResult<()> {
        match self.get_by_name(name) {
            Some(handle) => handle.send(msg),
            None => Err(Error::NotFound(format!("service '{name}'"))),
        }
    }

    fn lock(&self) -> std::sync::RwLockReadGuard<'_, RouteMap> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_mut(&self) -> std::sync::RwLockWriteGuard<'_, RouteMap> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Mutable loop internals, split from the component registry so callbacks
/// can borrow both at once.
pub(crate) struct LoopCore {
    pub(crate) id: ServiceId,
    pub(crate) name: String,
    pub(crate) config: ServiceConfig,
    pub(crate) state: ServiceState,
    pub(crate) wheel: TimerWheel,
    pub(crate) mq: MessageQueue<LoopMessage>,
    pub(crate) poller: Poller,
    pub(crate) codec: CodecChain,
    pub(crate) sessions: HashMap<u64, Session>,
    pub(crate) handlers: HashMap<u32, usize>,
    pub(crate) pre_filters: Vec<PreFilter>,
    pub(crate) post_filters: Vec<PostFilter>,
    pub(crate) fired_timers: Rc<RefCell<Vec<(usize, TimerId)>>>,
    pub(crate) routes: Option<Arc<Routes>>,
    pub(crate) listeners: Vec<u64>,
    pub(crate) in_init: bool,
    pub(crate) stop_requested: bool,
    epoch: Instant,
    last_update_ms: u64,
}

/// Declarative service description; crosses into the service thread and is
/// assembled there.
pub struct ServiceBuilder {
    config: ServiceConfig,
    components: Vec<(Box<dyn Component + Send>, std::any::TypeId)>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        ServiceBuilder {
            config,
            components: Vec::new(),
        }
    }

    pub fn component<C: Component + Send>(mut self, comp: C) -> Self {
        self.components
            .push((Box::new(comp), std::any::TypeId::of::<C>()));
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Assembles the service on the calling thread. The loop then belongs
    /// to this thread: drive it with [`Service::start`] + [`Service::run`]
    /// (or [`Service::tick`] directly).
    pub fn build(self, layers: &LayerRegistry) -> AnyResult<Service> {
        Service::assemble(self.config, self.components, layers, None)
    }

    pub(crate) fn build_with_routes(
        self,
        layers: &LayerRegistry,
        routes: Arc<Routes>,
    ) -> AnyResult<Service> {
        Service::assemble(self.config, self.components, layers, Some(routes))
    }
}

pub struct Service {
    core: LoopCore,
    registry: ComponentRegistry,
}

impl Service {
    fn assemble(
        config: ServiceConfig,
        components: Vec<(Box<dyn Component + Send>, std::any::TypeId)>,
        layers: &LayerRegistry,
        routes: Option<Arc<Routes>>,
    ) -> AnyResult<Self> {
        config.validate()?;
        let codec = layers.build_chain(&config.codec_chain, FrameCodec::new(config.max_packet))?;
        let poller = Poller::new(config.max_session_send_buf)?;
        let mut registry = ComponentRegistry::new();
        for (comp, type_id) in components {
            registry.register_boxed(comp, type_id)?;
        }
        let name = config.name.clone();
        Ok(Service {
            core: LoopCore {
                id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
                name,
                config,
                state: ServiceState::Created,
                wheel: TimerWheel::new(),
                mq: MessageQueue::new(),
                poller,
                codec,
                sessions: HashMap::new(),
                handlers: HashMap::new(),
                pre_filters: Vec::new(),
                post_filters: Vec::new(),
                fired_timers: Rc::new(RefCell::new(Vec::new())),
                routes,
                listeners: Vec::new(),
                in_init: false,
                stop_requested: false,
                epoch: Instant::now(),
                last_update_ms: 0,
            },
            registry,
        })
    }

    pub fn id(&self) -> ServiceId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> ServiceState {
        self.core.state
    }

    /// Bound address of the service's listener, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .listeners
            .first()
            .and_then(|id| self.core.poller.listen_addr(*id))
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            id: self.core.id,
            name: self.core.name.clone(),
            listen_addr: self.local_addr(),
            sender: self.core.mq.sender(),
            waker: self.core.poller.waker(),
        }
    }

    /// Registers one more component. Append-only: allowed while `Created`
    /// or `Starting`, rejected once the loop runs.
    pub fn register_component<C: Component>(&mut self, comp: C) -> CoreResult<()> {
        match self.core.state {
            ServiceState::Created | ServiceState::Starting => self
                .registry
                .register_boxed(Box::new(comp), std::any::TypeId::of::<C>()),
            state => Err(Error::State(format!(
                "component registration while {state:?}"
            ))),
        }
    }

    fn now_ms(&self) -> u64 {
        self.core.epoch.elapsed().as_millis() as u64
    }

    /// Opens the listener, connects configured peers, then initialises and
    /// starts every component in registration order.
    pub fn start(&mut self) -> AnyResult<()> {
        if self.core.state != ServiceState::Created {
            return Err(Error::State(format!(
                "service '{}' cannot start from {:?}",
                self.core.name, self.core.state
            ))
            .record()
            .into());
        }
        self.core.state = ServiceState::Starting;
        info!(
            "service '{}' starting with {} component(s)",
            self.core.name,
            self.registry.len()
        );

        if let Err(e) = self.open_endpoints() {
            error!("service '{}' endpoint setup failed: {e}", self.core.name);
            self.core.state = ServiceState::Stopped;
            return Err(e.record().into());
        }

        self.core.in_init = true;
        for index in 0..self.registry.len() {
            let result = self.run_component(index, |comp, ctx| comp.on_init(ctx));
            match result {
                Ok(Ok(())) => self.registry.slot(index).inited.set(true),
                Ok(Err(e)) | Err(e) => {
                    error!(
                        "component '{}' init failed: {e}",
                        self.registry.name_of(index).unwrap_or("?")
                    );
                    self.core.in_init = false;
                    self.teardown_failed_start();
                    return Err(e.record().into());
                }
            }
        }
        self.core.in_init = false;

        for index in 0..self.registry.len() {
            let result = self.run_component(index, |comp, ctx| comp.on_start(ctx));
            match result {
                Ok(Ok(())) => self.registry.slot(index).started.set(true),
                Ok(Err(e)) | Err(e) => {
                    error!(
                        "component '{}' start failed: {e}",
                        self.registry.name_of(index).unwrap_or("?")
                    );
                    self.teardown_failed_start();
                    return Err(e.record().into());
                }
            }
        }

        self.core.state = ServiceState::Running;
        info!(
            "service '{}' running at {} fps",
            self.core.name, self.core.config.fps
        );
        Ok(())
    }

    fn open_endpoints(&mut self) -> CoreResult<()> {
        if let Some(addr) = self.core.config.listen_addr.clone() {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| Error::Arg(format!("listen_addr '{addr}': {e}")))?;
            let listener = self.core.poller.listen(addr)?;
            self.core.listeners.push(listener);
            info!(
                "service '{}' listening on {}",
                self.core.name,
                self.core.poller.listen_addr(listener).unwrap_or(addr)
            );
        }
        for peer in self.core.config.connect_peers.clone() {
            let addr: SocketAddr = peer
                .parse()
                .map_err(|e| Error::Arg(format!("connect peer '{peer}': {e}")))?;
            let session = self.core.poller.connect(addr)?;
            self.core
                .sessions
                .insert(session, Session::connecting(session));
            debug!("service '{}' connecting to {addr}", self.core.name);
        }
        Ok(())
    }

    /// One frame of the loop. Returns false once the service has stopped.
    pub fn tick(&mut self) -> bool {
        match self.core.state {
            ServiceState::Running => {}
            ServiceState::Stopping => {
                self.shutdown();
                return false;
            }
            _ => return false,
        }
        let frame_start = Instant::now();
        let frame_ms = self.core.config.frame_interval_ms().max(1);
        let pool = AutoReleasePool::new();

        // Cross-thread messages first, bounded per tick.
        let mut messages = Vec::new();
        self.core
            .mq
            .drain_up_to(self.core.config.frame_drain_cap, &mut messages);
        for msg in messages {
            self.handle_loop_message(msg);
        }

        if self.core.state == ServiceState::Running {
            // Wait for I/O no longer than the frame or the nearest timer.
            let now = self.now_ms();
            let budget = frame_ms.saturating_sub(frame_start.elapsed().as_millis() as u64);
            let timer_wait = self
                .core
                .wheel
                .next_due()
                .map(|due| due.saturating_sub(now))
                .unwrap_or(budget);
            let timeout = budget.min(timer_wait);

            let mut events = Vec::new();
            if let Err(e) = self
                .core
                .poller
                .poll(Some(Duration::from_millis(timeout)), &mut events)
            {
                error!("service '{}' poll failed: {e}", self.core.name);
            }
            for event in events {
                self.handle_socket_event(event);
            }

            let now = self.now_ms();
            self.core.wheel.tick(now);
            let fired: Vec<(usize, TimerId)> =
                self.core.fired_timers.borrow_mut().drain(..).collect();
            for (index, timer) in fired {
                if self.registry.slot(index).started.get() {
                    if let Err(e) = self.run_component(index, |comp, ctx| comp.on_timer(ctx, timer))
                    {
                        warn!("timer callback skipped: {e}");
                    }
                }
            }

            let dt = now.saturating_sub(self.core.last_update_ms);
            self.core.last_update_ms = now;
            self.each_started(|comp, ctx| comp.on_update(ctx, dt));
        }

        // End-of-tick drain point for everything auto-released this frame.
        drop(pool);

        if self.core.stop_requested {
            self.core.stop_requested = false;
            if self.core.state == ServiceState::Running {
                self.core.state = ServiceState::Stopping;
            }
        }
        if self.core.state == ServiceState::Stopping {
            self.shutdown();
            return false;
        }
        true
    }

    /// Drives the loop until the service stops, honouring the frame rate.
    pub fn run(&mut self) {
        let frame = Duration::from_millis(self.core.config.frame_interval_ms().max(1));
        loop {
            let frame_start = Instant::now();
            if !self.tick() {
                break;
            }
            match frame.checked_sub(frame_start.elapsed()) {
                Some(rest) => std::thread::sleep(rest),
                None => std::thread::yield_now(),
            }
        }
    }

    fn handle_loop_message(&mut self, msg: LoopMessage) {
        match msg {
            LoopMessage::Stop => {
                if self.core.state == ServiceState::Running {
                    self.core.state = ServiceState::Stopping;
                }
            }
            LoopMessage::User(env) => {
                debug!(
                    "service '{}' envelope '{}' from {:?}",
                    self.core.name, env.tag, env.from
                );
                self.each_started(|comp, ctx| comp.on_message(ctx, &env));
            }
            LoopMessage::ConfigReload(config) => {
                info!("service '{}' config reloaded", self.core.name);
                self.core.config = config;
                self.each_started(|comp, ctx| comp.on_config_reload(ctx));
            }
            LoopMessage::SendPacket { session, packet } => {
                let now = self.now_ms();
                let mut ctx = ServiceContext {
                    core: &mut self.core,
                    registry: &self.registry,
                    now_ms: now,
                    current: None,
                };
                if let Err(e) = ctx.send_packet(session, packet) {
                    warn!("queued send on session {session} failed: {e}");
                }
            }
            LoopMessage::CloseSession { session } => {
                self.close_after_dispatch(session);
            }
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Accepted { session, peer, .. } => {
                info!(
                    "service '{}' accepted session {session} from {peer}",
                    self.core.name
                );
                self.core
                    .sessions
                    .insert(session, Session::accepted(session, peer));
                self.each_started(|comp, ctx| comp.on_session_open(ctx, session));
            }
            SocketEvent::Connected { session } => {
                if let Some(entry) = self.core.sessions.get_mut(&session) {
                    entry.advance(SessionState::Connected);
                }
                debug!("service '{}' session {session} connected", self.core.name);
                self.each_started(|comp, ctx| comp.on_session_open(ctx, session));
            }
            SocketEvent::Readable { session, bytes } => {
                let mut packets = Vec::new();
                let result = match self.core.sessions.get_mut(&session) {
                    Some(entry) => entry.ingest(&bytes, &self.core.codec, &mut packets),
                    None => Ok(()),
                };
                // Frames decoded before a malformed one still dispatch.
                for packet in packets {
                    self.dispatch(packet);
                }
                if let Err(e) = result {
                    warn!("service '{}': {e}", self.core.name);
                    if let Some(entry) = self.core.sessions.get_mut(&session) {
                        entry.advance(SessionState::Closing);
                    }
                    self.core.poller.close_protocol(session);
                }
            }
            SocketEvent::Writable { session } => {
                self.each_started(|comp, ctx| comp.on_session_writable(ctx, session));
            }
            SocketEvent::Closed { session, reason } => {
                if let Some(mut entry) = self.core.sessions.remove(&session) {
                    entry.advance(SessionState::Closed);
                }
                info!(
                    "service '{}' session {session} closed: {reason:?}",
                    self.core.name
                );
                self.each_started(|comp, ctx| comp.on_session_close(ctx, session, reason));
            }
        }
    }

    /// Pre-filters → handler → post-filters, then the outcome's side
    /// effects (close, error reply).
    fn dispatch(&mut self, packet: Packet) {
        // The packet rides a pool-backed handle: it is enlisted in the
        // tick's frame below, so handlers may keep borrowing its payload
        // until the end-of-tick drain point.
        let packet = Retained::new(packet);
        let now = self.now_ms();

        let mut pre = std::mem::take(&mut self.core.pre_filters);
        let mut skipped = false;
        for filter in pre.iter_mut() {
            let mut ctx = ServiceContext {
                core: &mut self.core,
                registry: &self.registry,
                now_ms: now,
                current: None,
            };
            if filter(&mut ctx, &packet) == FilterAction::Skip {
                skipped = true;
                break;
            }
        }
        let added = std::mem::replace(&mut self.core.pre_filters, pre);
        self.core.pre_filters.extend(added);

        let outcome = if skipped {
            DispatchOutcome::Skipped
        } else {
            match self.core.handlers.get(&packet.opcode).copied() {
                Some(index) => self.invoke_handler(index, &packet),
                None => {
                    debug!(
                        "service '{}' no handler for opcode {:#x}",
                        self.core.name, packet.opcode
                    );
                    DispatchOutcome::Unhandled
                }
            }
        };

        let mut post = std::mem::take(&mut self.core.post_filters);
        for filter in post.iter_mut() {
            let mut ctx = ServiceContext {
                core: &mut self.core,
                registry: &self.registry,
                now_ms: now,
                current: None,
            };
            filter(&mut ctx, &packet, outcome);
        }
        let added = std::mem::replace(&mut self.core.post_filters, post);
        self.core.post_filters.extend(added);

        match outcome {
            DispatchOutcome::CloseSession => self.close_after_dispatch(packet.session_id),
            DispatchOutcome::Error => {
                if packet.expects_reply() {
                    let mut ctx = ServiceContext {
                        core: &mut self.core,
                        registry: &self.registry,
                        now_ms: now,
                        current: None,
                    };
                    if let Err(e) = ctx.reply(&packet, Kind::Internal.code(), Vec::new()) {
                        warn!("error reply on session {} failed: {e}", packet.session_id);
                    }
                }
                if packet.close_on_error() {
                    self.close_after_dispatch(packet.session_id);
                }
            }
            _ => {}
        }

        // Deferred teardown: the tick's frame releases the packet when it
        // drains. Without an active frame the handle just drops here.
        let _ = packet.autorelease();
    }

    fn invoke_handler(&mut self, index: usize, packet: &Packet) -> DispatchOutcome {
        let now = self.now_ms();
        let mut comp = match self.registry.borrow_mut(index) {
            Ok(comp) => comp,
            Err(e) => {
                error!("handler unavailable: {e}");
                return DispatchOutcome::Error;
            }
        };
        let mut ctx = ServiceContext {
            core: &mut self.core,
            registry: &self.registry,
            now_ms: now,
            current: Some(index),
        };
        match catch_unwind(AssertUnwindSafe(|| comp.on_packet(&mut ctx, packet))) {
            Ok(Ok(HandlerOutcome::Handled)) => DispatchOutcome::Handled,
            Ok(Ok(HandlerOutcome::Unhandled)) => DispatchOutcome::Unhandled,
            Ok(Ok(HandlerOutcome::CloseSession)) => DispatchOutcome::CloseSession,
            Ok(Err(e)) => {
                error!(
                    "handler error: opcode {:#x} serial {} session {}: {e}",
                    packet.opcode, packet.serial, packet.session_id
                );
                DispatchOutcome::Error
            }
            Err(_) => {
                error!(
                    "handler panicked: opcode {:#x} serial {} session {}",
                    packet.opcode, packet.serial, packet.session_id
                );
                DispatchOutcome::Error
            }
        }
    }

    fn close_after_dispatch(&mut self, session: u64) {
        if let Some(entry) = self.core.sessions.get_mut(&session) {
            entry.advance(SessionState::Closing);
        }
        if let Err(e) = self.core.poller.close(session, true) {
            debug!("close session {session}: {e}");
        }
    }

    /// Stopping sequence: drain the queue, stop components in reverse,
    /// close sessions, destroy components in reverse.
    fn shutdown(&mut self) {
        self.core.state = ServiceState::Stopping;
        info!("service '{}' stopping", self.core.name);

        let mut messages = Vec::new();
        while self.core.mq.drain_up_to(64, &mut messages) > 0 {}
        for msg in messages {
            if let LoopMessage::User(env) = msg {
                self.each_started(|comp, ctx| comp.on_message(ctx, &env));
            }
        }

        for index in (0..self.registry.len()).rev() {
            if self.registry.slot(index).started.get() {
                if let Err(e) = self.run_component(index, |comp, ctx| comp.on_stop(ctx)) {
                    warn!("component stop skipped: {e}");
                }
                self.registry.slot(index).started.set(false);
            }
        }

        let sessions: Vec<u64> = self.core.sessions.keys().copied().collect();
        for session in sessions {
            let _ = self.core.poller.close(session, false);
        }
        self.core.sessions.clear();

        for index in (0..self.registry.len()).rev() {
            if self.registry.slot(index).inited.get() {
                if let Ok(mut comp) = self.registry.borrow_mut(index) {
                    comp.on_destroy();
                }
                self.registry.slot(index).inited.set(false);
            }
        }

        self.core.state = ServiceState::Stopped;
        info!("service '{}' stopped", self.core.name);
    }

    /// Rolls back a failed start: stop whatever started, destroy whatever
    /// initialised, both in reverse order.
    fn teardown_failed_start(&mut self) {
        for index in (0..self.registry.len()).rev() {
            if self.registry.slot(index).started.get() {
                let _ = self.run_component(index, |comp, ctx| comp.on_stop(ctx));
                self.registry.slot(index).started.set(false);
            }
        }
        for index in (0..self.registry.len()).rev() {
            if self.registry.slot(index).inited.get() {
                if let Ok(mut comp) = self.registry.borrow_mut(index) {
                    comp.on_destroy();
                }
                self.registry.slot(index).inited.set(false);
            }
        }
        self.core.state = ServiceState::Stopped;
    }

    fn run_component<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut dyn Component, &mut ServiceContext<'_>) -> R,
    ) -> CoreResult<R> {
        let now = self.now_ms();
        let mut comp = self.registry.borrow_mut(index)?;
        let mut ctx = ServiceContext {
            core: &mut self.core,
            registry: &self.registry,
            now_ms: now,
            current: Some(index),
        };
        Ok(f(&mut **comp, &mut ctx))
    }

    fn each_started(&mut self, mut f: impl FnMut(&mut dyn Component, &mut ServiceContext<'_>)) {
        for index in 0..self.registry.len() {
            if !self.registry.slot(index).started.get() {
                continue;
            }
            if let Err(e) = self.run_component(index, |comp, ctx| f(comp, ctx)) {
                warn!("component callback skipped: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::variant::Variant;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Tracer {
        name: &'static str,
        log: Log,
        fail_start: bool,
    }

    impl Tracer {
        fn new(name: &'static str, log: &Log) -> Self {
            Tracer {
                name,
                log: log.clone(),
                fail_start: false,
            }
        }

        fn note(&self, what: &str) {
            self.log.borrow_mut().push(format!("{}:{what}", self.name));
        }
    }

    impl Component for Tracer {
        fn name(&self) -> &str {
            self.name
        }

        fn on_init(&mut self, _ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
            self.note("init");
            Ok(())
        }

        fn on_start(&mut self, _ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
            if self.fail_start {
                return Err(Error::Internal("boom".into()));
            }
            self.note("start");
            Ok(())
        }

        fn on_stop(&mut self, _ctx: &mut ServiceContext<'_>) {
            self.note("stop");
        }

        fn on_destroy(&mut self) {
            self.note("destroy");
        }

        fn on_message(&mut self, _ctx: &mut ServiceContext<'_>, env: &Envelope) {
            self.note(&format!("msg:{}:{}", env.tag, env.payload.get("seq").as_int().unwrap_or(-1)));
        }
    }

    fn service_with(components: Vec<Tracer>) -> Service {
        let config = ServiceConfig::new("test");
        let mut service = ServiceBuilder::new(config)
            .build(&LayerRegistry::new())
            .unwrap();
        for comp in components {
            service.register_component(comp).unwrap();
        }
        service
    }

    #[test]
    fn lifecycle_runs_forward_and_stops_in_reverse() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut service = service_with(vec![
            Tracer::new("a", &log),
            Tracer::new("b", &log),
            Tracer::new("c", &log),
        ]);
        service.start().unwrap();
        assert_eq!(service.state(), ServiceState::Running);

        service.handle().send(LoopMessage::Stop).unwrap();
        while service.tick() {}
        assert_eq!(service.state(), ServiceState::Stopped);

        assert_eq!(
            *log.borrow(),
            vec![
                "a:init", "b:init", "c:init", "a:start", "b:start", "c:start", "c:stop", "b:stop",
                "a:stop", "c:destroy", "b:destroy", "a:destroy",
            ]
        );
    }

    #[test]
    fn failed_start_rolls_back_in_reverse() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut bad = Tracer::new("b", &log);
        bad.fail_start = true;
        let mut service = service_with(vec![Tracer::new("a", &log), bad]);
        assert!(service.start().is_err());
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(
            *log.borrow(),
            vec!["a:init", "b:init", "a:start", "a:stop", "b:destroy", "a:destroy"]
        );
    }

    #[test]
    fn registration_rejected_while_running() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut service = service_with(vec![Tracer::new("a", &log)]);
        service.start().unwrap();
        let err = service
            .register_component(Tracer::new("late", &log))
            .unwrap_err();
        assert_eq!(err.kind(), Kind::State);
    }

    #[test]
    fn envelopes_reach_components_in_order() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let mut service = service_with(vec![Tracer::new("a", &log)]);
        service.start().unwrap();

        let handle = service.handle();
        let env = Envelope::new(
            "ping",
            [("seq".to_string(), Variant::Int(42))].into_iter().collect(),
        );
        handle.post(env).unwrap();
        service.tick();
        assert!(log.borrow().contains(&"a:msg:ping:42".to_string()));
    }

    struct TimerComp {
        log: Log,
        armed: Option<TimerId>,
    }

    impl Component for TimerComp {
        fn name(&self) -> &str {
            "ticker"
        }

        fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
            self.armed = Some(ctx.schedule(5, None)?);
            Ok(())
        }

        fn on_timer(&mut self, ctx: &mut ServiceContext<'_>, timer: TimerId) {
            assert_eq!(Some(timer), self.armed);
            self.log.borrow_mut().push(format!("fired@{}", ctx.now_ms()));
            ctx.stop_service();
        }
    }

    #[test]
    fn component_timer_fires_and_can_stop_the_service() {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let config = ServiceConfig::new("timers");
        let mut service = ServiceBuilder::new(config)
            .build(&LayerRegistry::new())
            .unwrap();
        service
            .register_component(TimerComp {
                log: log.clone(),
                armed: None,
            })
            .unwrap();
        service.start().unwrap();

        for _ in 0..100 {
            if !service.tick() {
                break;
            }
        }
        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(log.borrow().len(), 1);
    }

    struct InitCaller {
        outcome: Rc<RefCell<Option<Kind>>>,
    }

    impl Component for InitCaller {
        fn name(&self) -> &str {
            "init-caller"
        }

        fn on_init(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
            let err = ctx
                .call_method("anything", "anything", &Variant::Null)
                .unwrap_err();
            *self.outcome.borrow_mut() = Some(err.kind());
            Ok(())
        }
    }

    #[test]
    fn method_calls_forbidden_during_init() {
        let outcome = Rc::new(RefCell::new(None));
        let config = ServiceConfig::new("strict");
        let mut service = ServiceBuilder::new(config)
            .build(&LayerRegistry::new())
            .unwrap();
        service
            .register_component(InitCaller {
                outcome: outcome.clone(),
            })
            .unwrap();
        service.start().unwrap();
        assert_eq!(*outcome.borrow(), Some(Kind::State));
    }
}
