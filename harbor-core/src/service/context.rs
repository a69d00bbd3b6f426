//! The view component callbacks get of their owning service.
//!
//! A context borrows the loop's internals for the duration of one callback;
//! everything a component may do mid-callback (arm timers, send packets,
//! call sibling components, post cross-service messages) goes through here.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::component::Method;
use crate::error::{CoreResult, Error};
use crate::mq::{Envelope, ServiceId};
use crate::packet::Packet;
use crate::session::SessionState;
use crate::timer::{TimerFire, TimerId};
use crate::variant::Variant;
use crate::component::{Component, ComponentRegistry};
use crate::config::ServiceConfig;

use super::{LoopCore, LoopMessage, ServiceState};

/// What a pre-filter decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Continue,
    /// Short-circuit: skip the handler, still run post-filters.
    Skip,
}

/// Final disposition of one inbound packet, as seen by post-filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Unhandled,
    /// A pre-filter short-circuited.
    Skipped,
    CloseSession,
    Error,
}

pub type PreFilter = Box<dyn FnMut(&mut ServiceContext<'_>, &Packet) -> FilterAction>;
pub type PostFilter = Box<dyn FnMut(&mut ServiceContext<'_>, &Packet, DispatchOutcome)>;

pub struct ServiceContext<'a> {
    pub(crate) core: &'a mut LoopCore,
    pub(crate) registry: &'a ComponentRegistry,
    pub(crate) now_ms: u64,
    /// Index of the component whose callback is executing, if any.
    pub(crate) current: Option<usize>,
}

impl ServiceContext<'_> {
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn service_id(&self) -> ServiceId {
        self.core.id
    }

    pub fn service_name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> ServiceState {
        self.core.state
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.core.config
    }

    // ---- timers ----

    /// Arms a timer delivered back to the calling component through
    /// [`Component::on_timer`]. With a period the timer repeats until
    /// cancelled.
    pub fn schedule(&mut self, delay_ms: u64, period_ms: Option<u64>) -> CoreResult<TimerId> {
        let index = self
            .current
            .ok_or_else(|| Error::State("no component is executing".into()))?;
        let fired = self.core.fired_timers.clone();
        let id = self.core.wheel.schedule(delay_ms, period_ms, move |tctx| {
            fired.borrow_mut().push((index, tctx.id));
            TimerFire::Rearm
        });
        Ok(id)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.core.wheel.cancel(id)
    }

    // ---- sessions and packets ----

    /// Encodes and queues `packet` on a session. A zero serial is replaced
    /// with the session's next outbound serial; the effective serial is
    /// returned so callers can correlate replies.
    pub fn send_packet(&mut self, session: u64, mut packet: Packet) -> CoreResult<u64> {
        let entry = self
            .core
            .sessions
            .get_mut(&session)
            .ok_or_else(|| Error::Closed(format!("session {session}")))?;
        if entry.state() > SessionState::Connected {
            return Err(Error::Closed(format!("session {session}")));
        }
        if packet.serial == 0 {
            packet.serial = entry.next_serial();
        }
        packet.session_id = session;
        let mut wire = BytesMut::new();
        self.core.codec.encode(&packet, &mut wire)?;
        self.core.poller.send(session, &wire)?;
        Ok(packet.serial)
    }

    /// Replies to a request, echoing its serial and opcode.
    pub fn reply(&mut self, req: &Packet, status: i32, payload: impl Into<Bytes>) -> CoreResult<()> {
        let reply = Packet::reply_to(req, status, payload);
        self.send_packet(req.session_id, reply)?;
        Ok(())
    }

    /// Closes a session gracefully: buffered bytes flush first.
    pub fn close_session(&mut self, session: u64) -> CoreResult<()> {
        if let Some(entry) = self.core.sessions.get_mut(&session) {
            entry.advance(SessionState::Closing);
        }
        self.core.poller.close(session, true)
    }

    pub fn session_state(&self, session: u64) -> Option<SessionState> {
        self.core.sessions.get(&session).map(|s| s.state())
    }

    // ---- components ----

    /// Late-bound call into another component's method table. Forbidden
    /// while components are initialising; order init-time dependencies by
    /// registration instead.
    pub fn call_method(&self, component: &str, method: &str, arg: &Variant) -> CoreResult<Variant> {
        if self.core.in_init {
            return Err(Error::State(
                "method calls are forbidden during component init".into(),
            ));
        }
        self.registry.call_method(component, method, arg)
    }

    /// Runs `f` against a sibling component by type.
    pub fn with_component<C: Component, R>(&self, f: impl FnOnce(&C) -> R) -> CoreResult<R> {
        self.registry.with(f)
    }

    pub fn component_method_names(&self, component: &str) -> CoreResult<Vec<String>> {
        self.registry.method_names(component)
    }

    // ---- registration (Starting only) ----

    /// Routes packets with `opcode` to the calling component's `on_packet`.
    pub fn register_handler(&mut self, opcode: u32) -> CoreResult<()> {
        self.check_starting("handler registration")?;
        let index = self
            .current
            .ok_or_else(|| Error::State("no component is executing".into()))?;
        if self.core.handlers.contains_key(&opcode) {
            return Err(Error::Repeat(format!("handler for opcode {opcode:#x}")));
        }
        self.core.handlers.insert(opcode, index);
        debug!(
            "component '{}' handles opcode {opcode:#x}",
            self.registry.name_of(index).unwrap_or("?")
        );
        Ok(())
    }

    /// Adds a method to the calling component's method table.
    pub fn add_method(&mut self, name: impl Into<String>, method: Method) -> CoreResult<()> {
        self.check_starting("method registration")?;
        let index = self
            .current
            .ok_or_else(|| Error::State("no component is executing".into()))?;
        self.registry.add_method(index, name, method)
    }

    pub fn add_pre_filter(&mut self, filter: PreFilter) -> CoreResult<()> {
        self.check_starting("filter registration")?;
        self.core.pre_filters.push(filter);
        Ok(())
    }

    pub fn add_post_filter(&mut self, filter: PostFilter) -> CoreResult<()> {
        self.check_starting("filter registration")?;
        self.core.post_filters.push(filter);
        Ok(())
    }

    fn check_starting(&self, what: &str) -> CoreResult<()> {
        match self.core.state {
            ServiceState::Created | ServiceState::Starting => Ok(()),
            state => Err(Error::State(format!("{what} while {state:?}"))),
        }
    }

    // ---- cross-service ----

    /// Posts an envelope to another service's queue by id.
    pub fn post_to_service(&self, target: ServiceId, mut env: Envelope) -> CoreResult<()> {
        env.from = Some(self.core.id);
        match &self.core.routes {
            Some(routes) => routes.post_by_id(target, LoopMessage::User(env)),
            None => Err(Error::NotFound(format!("service {target}"))),
        }
    }

    /// Posts an envelope to another service's queue by name.
    pub fn post_to_named(&self, target: &str, mut env: Envelope) -> CoreResult<()> {
        env.from = Some(self.core.id);
        match &self.core.routes {
            Some(routes) => routes.post_by_name(target, LoopMessage::User(env)),
            None => Err(Error::NotFound(format!("service '{target}'"))),
        }
    }

    /// Requests a graceful stop; the loop winds down after the current tick.
    pub fn stop_service(&mut self) {
        self.core.stop_requested = true;
    }
}
