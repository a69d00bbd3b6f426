//! Periodic liveness beat with a late-bound `ping` method.
//!
//! Other components (or script bindings) can read the beat counter without
//! a typed dependency: `call_method("heartbeat", "ping", _)` returns the
//! number of beats so far.

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use harbor_core::{Component, CoreResult, ServiceContext, TimerId, Variant};

pub struct HeartbeatComponent {
    interval_ms: u64,
    timer: Option<TimerId>,
    beats: Arc<AtomicU64>,
}

impl HeartbeatComponent {
    pub fn new(interval_ms: u64) -> Self {
        HeartbeatComponent {
            interval_ms: interval_ms.max(1),
            timer: None,
            beats: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

impl Component for HeartbeatComponent {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        let beats = self.beats.clone();
        ctx.add_method(
            "ping",
            Rc::new(move |_arg| Ok(Variant::Int(beats.load(Ordering::Relaxed) as i64))),
        )?;
        self.timer = Some(ctx.schedule(self.interval_ms, Some(self.interval_ms))?);
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ServiceContext<'_>, _timer: TimerId) {
        let beat = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!("service '{}' beat {beat}", ctx.service_name());
    }

    fn on_stop(&mut self, ctx: &mut ServiceContext<'_>) {
        if let Some(timer) = self.timer.take() {
            ctx.cancel_timer(timer);
        }
    }
}
