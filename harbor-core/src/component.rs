//! Components: named plugin units inside a service.
//!
//! Lifecycle is `on_init` → `on_start` → (updates, packets, messages,
//! timers) → `on_stop` → `on_destroy`. Components init in registration
//! order and stop in reverse. Registration is append-only while the service
//! is `Created`/`Starting`; the registry is immutable once the loop runs.
//!
//! Besides the typed trait surface, every component carries an optional
//! method table for late-bound calls: name → `fn(&Variant) -> Variant`,
//! reachable from other components (and the C-ABI) via
//! `call_method(component, method, arg)`.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{CoreResult, Error};
use crate::mq::Envelope;
use crate::packet::Packet;
use crate::poller::CloseReason;
use crate::service::ServiceContext;
use crate::timer::TimerId;
use crate::variant::Variant;

/// What a packet handler did with the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled,
    Unhandled,
    /// Handled, and the session should be closed afterwards.
    CloseSession,
}

#[allow(unused_variables)]
pub trait Component: Any {
    /// Unique within the owning service; must be non-empty.
    fn name(&self) -> &str;

    /// Called in registration order before the service starts. Looking up
    /// other components' methods here is forbidden; init-time dependencies
    /// are expressed by registration order instead.
    fn on_init(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    /// Called in registration order after every component initialised.
    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    /// Called once per tick in registration order.
    fn on_update(&mut self, ctx: &mut ServiceContext<'_>, dt_ms: u64) {}

    /// Called in reverse registration order while the service stops.
    fn on_stop(&mut self, ctx: &mut ServiceContext<'_>) {}

    /// Last callback; the component is dropped right after.
    fn on_destroy(&mut self) {}

    /// Inbound packet on an opcode this component subscribed to.
    fn on_packet(&mut self, ctx: &mut ServiceContext<'_>, packet: &Packet) -> CoreResult<HandlerOutcome> {
        Ok(HandlerOutcome::Unhandled)
    }

    /// Envelope drained from the service's message queue.
    fn on_message(&mut self, ctx: &mut ServiceContext<'_>, env: &Envelope) {}

    /// A timer armed through [`ServiceContext::schedule`] fired.
    fn on_timer(&mut self, ctx: &mut ServiceContext<'_>, timer: TimerId) {}

    fn on_session_open(&mut self, ctx: &mut ServiceContext<'_>, session: u64) {}

    /// The session's send buffer drained; back-pressured sends may retry.
    fn on_session_writable(&mut self, ctx: &mut ServiceContext<'_>, session: u64) {}

    fn on_session_close(&mut self, ctx: &mut ServiceContext<'_>, session: u64, reason: CloseReason) {}

    /// Notification only; components re-read whatever config they cached.
    fn on_config_reload(&mut self, ctx: &mut ServiceContext<'_>) {}
}

pub type Method = Rc<dyn Fn(&Variant) -> CoreResult<Variant>>;

/// Below this size lookups scan the insertion-ordered list; beyond it they
/// hit the hash map. Small tables stay cache-friendly, large ones stay O(1).
const LINEAR_SCAN_MAX: usize = 30;

#[derive(Default)]
pub struct ComponentMethods {
    list: Vec<(String, Method)>,
    map: HashMap<String, Method>,
}

impl ComponentMethods {
    pub fn add(&mut self, name: impl Into<String>, method: Method) -> CoreResult<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Arg("empty method name".into()));
        }
        if self.map.contains_key(&name) {
            return Err(Error::Repeat(format!("method '{name}'")));
        }
        self.map.insert(name.clone(), method.clone());
        self.list.push((name, method));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Method> {
        if self.list.len() <= LINEAR_SCAN_MAX {
            self.list
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, m)| m)
        } else {
            self.map.get(name)
        }
    }

    pub fn call(&self, name: &str, arg: &Variant) -> CoreResult<Variant> {
        match self.get(name) {
            Some(method) => method(arg),
            None => Err(Error::NotFound(format!("method '{name}'"))),
        }
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.list.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

pub(crate) struct ComponentSlot {
    pub(crate) name: String,
    pub(crate) comp: RefCell<Box<dyn Component>>,
    pub(crate) methods: RefCell<ComponentMethods>,
    pub(crate) inited: Cell<bool>,
    pub(crate) started: Cell<bool>,
}

/// Ordered component directory of one service.
#[derive(Default)]
pub struct ComponentRegistry {
    slots: Vec<ComponentSlot>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Component>(&mut self, comp: C) -> CoreResult<()> {
        let type_id = TypeId::of::<C>();
        self.register_boxed(Box::new(comp), type_id)
    }

    pub(crate) fn register_boxed(
        &mut self,
        comp: Box<dyn Component>,
        type_id: TypeId,
    ) -> CoreResult<()> {
        let name = comp.name().to_owned();
        if name.is_empty() {
            return Err(Error::Arg("empty component name".into()));
        }
        if self.by_name.contains_key(&name) {
            return Err(Error::Repeat(format!("component '{name}'")));
        }
        let index = self.slots.len();
        self.by_name.insert(name.clone(), index);
        // First registration wins for type lookup; later instances of the
        // same type remain reachable by name.
        self.by_type.entry(type_id).or_insert(index);
        self.slots.push(ComponentSlot {
            name,
            comp: RefCell::new(comp),
            methods: RefCell::new(ComponentMethods::default()),
            inited: Cell::new(false),
            started: Cell::new(false),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn index_of<C: Component>(&self) -> Option<usize> {
        self.by_type.get(&TypeId::of::<C>()).copied()
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.slots.get(index).map(|s| s.name.as_str())
    }

    /// Runs `f` against the typed component. Fails with `NotFound` when no
    /// component of that type exists and `State` when it is currently
    /// executing a callback.
    pub fn with<C: Component, R>(&self, f: impl FnOnce(&C) -> R) -> CoreResult<R> {
        let index = self
            .index_of::<C>()
            .ok_or_else(|| Error::NotFound(format!("component type {}", std::any::type_name::<C>())))?;
        let slot = &self.slots[index];
        let comp = slot
            .comp
            .try_borrow()
            .map_err(|_| Error::State(format!("component '{}' is busy", slot.name)))?;
        let any: &dyn Any = &**comp;
        let typed = any
            .downcast_ref::<C>()
            .ok_or_else(|| Error::Internal("component type index out of sync".into()))?;
        Ok(f(typed))
    }

    pub(crate) fn slot(&self, index: usize) -> &ComponentSlot {
        &self.slots[index]
    }

    pub(crate) fn borrow_mut(&self, index: usize) -> CoreResult<RefMut<'_, Box<dyn Component>>> {
        let slot = &self.slots[index];
        slot.comp
            .try_borrow_mut()
            .map_err(|_| Error::State(format!("component '{}' is busy", slot.name)))
    }

    /// Late-bound inter-component call.
    pub fn call_method(&self, component: &str, method: &str, arg: &Variant) -> CoreResult<Variant> {
        let index = self
            .index_of_name(component)
            .ok_or_else(|| Error::NotFound(format!("component '{component}'")))?;
        let methods = self.slots[index].methods.borrow();
        methods.call(method, arg)
    }

    pub(crate) fn add_method(
        &self,
        index: usize,
        name: impl Into<String>,
        method: Method,
    ) -> CoreResult<()> {
        self.slots[index].methods.borrow_mut().add(name, method)
    }

    /// Method names registered by `component`, in registration order.
    pub fn method_names(&self, component: &str) -> CoreResult<Vec<String>> {
        let index = self
            .index_of_name(component)
            .ok_or_else(|| Error::NotFound(format!("component '{component}'")))?;
        Ok(self.slots[index]
            .methods
            .borrow()
            .names()
            .map(str::to_owned)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    struct Probe {
        name: &'static str,
    }

    impl Component for Probe {
        fn name(&self) -> &str {
            self.name
        }
    }

    struct Other;

    impl Component for Other {
        fn name(&self) -> &str {
            "other"
        }
    }

    fn table_of(n: usize) -> ComponentMethods {
        let mut methods = ComponentMethods::default();
        for i in 0..n {
            let value = i as i64;
            methods
                .add(format!("m{i}"), Rc::new(move |_arg| Ok(Variant::Int(value))))
                .unwrap();
        }
        methods
    }

    #[test]
    fn method_lookup_identical_at_linear_scan_boundary() {
        // 30 entries scan the list, 31 hit the map; results must agree.
        let small = table_of(30);
        let large = table_of(31);
        for i in 0..30 {
            let name = format!("m{i}");
            let a = small.call(&name, &Variant::Null).unwrap();
            let b = large.call(&name, &Variant::Null).unwrap();
            assert_eq!(a, b);
        }
        assert_eq!(
            small.call("missing", &Variant::Null).unwrap_err().kind(),
            Kind::NotFound
        );
        assert_eq!(
            large.call("missing", &Variant::Null).unwrap_err().kind(),
            Kind::NotFound
        );
        assert_eq!(large.call("m30", &Variant::Null).unwrap(), Variant::Int(30));
    }

    #[test]
    fn duplicate_and_empty_method_names_rejected() {
        let mut methods = ComponentMethods::default();
        methods.add("ping", Rc::new(|_| Ok(Variant::Null))).unwrap();
        assert_eq!(
            methods
                .add("ping", Rc::new(|_| Ok(Variant::Null)))
                .unwrap_err()
                .kind(),
            Kind::Repeat
        );
        assert_eq!(
            methods
                .add("", Rc::new(|_| Ok(Variant::Null)))
                .unwrap_err()
                .kind(),
            Kind::Arg
        );
    }

    #[test]
    fn registry_lookup_by_name_and_type() {
        let mut registry = ComponentRegistry::new();
        registry.register(Probe { name: "a" }).unwrap();
        registry.register(Other).unwrap();

        assert_eq!(registry.index_of_name("a"), Some(0));
        assert_eq!(registry.index_of_name("other"), Some(1));
        assert_eq!(registry.index_of::<Other>(), Some(1));
        assert_eq!(registry.index_of_name("zzz"), None);
        registry.with::<Probe, _>(|p| assert_eq!(p.name, "a")).unwrap();
    }

    #[test]
    fn duplicate_component_name_rejected() {
        let mut registry = ComponentRegistry::new();
        registry.register(Probe { name: "a" }).unwrap();
        let err = registry.register(Probe { name: "a" }).unwrap_err();
        assert_eq!(err.kind(), Kind::Repeat);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn call_method_routes_through_registry() {
        let mut registry = ComponentRegistry::new();
        registry.register(Probe { name: "calc" }).unwrap();
        let index = registry.index_of_name("calc").unwrap();
        registry
            .add_method(index, "double", Rc::new(|arg| {
                Ok(Variant::Int(arg.as_int().unwrap_or(0) * 2))
            }))
            .unwrap();

        let result = registry
            .call_method("calc", "double", &Variant::Int(21))
            .unwrap();
        assert_eq!(result, Variant::Int(42));

        assert_eq!(
            registry
                .call_method("nope", "double", &Variant::Null)
                .unwrap_err()
                .kind(),
            Kind::NotFound
        );
        assert_eq!(
            registry
                .call_method("calc", "nope", &Variant::Null)
                .unwrap_err()
                .kind(),
            Kind::NotFound
        );
        assert_eq!(registry.method_names("calc").unwrap(), vec!["double"]);
    }
}
