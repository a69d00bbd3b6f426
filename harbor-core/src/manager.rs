//! Process-wide service directory.
//!
//! The manager spawns one named thread per service, hands each a
//! [`ServiceBuilder`] to assemble in-thread, and keeps a directory of
//! [`ServiceHandle`]s keyed by id and name behind a single read-write lock.
//! Cross-service [`ServiceManager::post_message`] is a thin wrapper over the
//! target's queue. Stopping joins the service thread, so a service's
//! components have fully stopped before any `stop_*` call returns.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use tracing::{error, info};

use crate::codec::LayerRegistry;
use crate::config::{ManagerConfig, ServiceConfig};
use crate::error::{AnyResult, CoreResult, Error};
use crate::mq::{Envelope, ServiceId};
use crate::service::{LoopMessage, Routes, ServiceBuilder, ServiceHandle};

/// Per-service outcomes of a fleet-wide stop, in stop order.
pub struct ServiceStopResults(Vec<AnyResult<()>>);

impl ServiceStopResults {
    /// First failure, if any.
    pub fn err(self) -> AnyResult<()> {
        for result in self.0 {
            result?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Directory {
    threads: HashMap<ServiceId, JoinHandle<()>>,
    /// Creation order; services stop in reverse.
    order: Vec<ServiceId>,
}

pub struct ServiceManager {
    config: ManagerConfig,
    layers: Arc<LayerRegistry>,
    routes: Arc<Routes>,
    directory: RwLock<Directory>,
    fatal: Arc<AtomicBool>,
}

impl ServiceManager {
    pub fn new(config: ManagerConfig, layers: LayerRegistry) -> Self {
        ServiceManager {
            config,
            layers: Arc::new(layers),
            routes: Arc::new(Routes::default()),
            directory: RwLock::new(Directory::default()),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawns a service on its own thread and waits until it either runs or
    /// fails to start.
    pub fn create(&self, builder: ServiceBuilder) -> AnyResult<ServiceHandle> {
        let name = builder.config().name.clone();
        if self.routes.get_by_name(&name).is_some() {
            return Err(Error::Repeat(format!("service '{name}'")).record().into());
        }

        let (init_tx, init_rx) = crossbeam_channel::bounded::<AnyResult<ServiceHandle>>(1);
        let layers = self.layers.clone();
        let routes = self.routes.clone();
        let fatal = self.fatal.clone();
        let abort_on_fatal = self.config.abort_on_service_fatal;

        let thread = std::thread::Builder::new()
            .name(format!("harbor-{name}"))
            .spawn(move || {
                let mut service = match builder.build_with_routes(&layers, routes.clone()) {
                    Ok(service) => service,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = service.start() {
                    let _ = init_tx.send(Err(e));
                    return;
                }
                let id = service.id();
                let _ = init_tx.send(Ok(service.handle()));

                let outcome = catch_unwind(AssertUnwindSafe(|| service.run()));
                routes.remove(id);
                if let Err(panic) = outcome {
                    let detail = panic_message(&panic);
                    error!("service thread died: {detail}");
                    fatal.store(true, Ordering::SeqCst);
                    if abort_on_fatal {
                        error!("abort_on_service_fatal is set, tearing the process down");
                        std::process::exit(2);
                    }
                }
            })
            .map_err(|e| Error::Internal(format!("spawn service thread: {e}")))?;

        match init_rx.recv() {
            Ok(Ok(handle)) => {
                self.routes.insert(handle.clone());
                let mut dir = self.dir_mut();
                dir.order.push(handle.id());
                dir.threads.insert(handle.id(), thread);
                info!("service '{}' created with id {}", handle.name(), handle.id());
                Ok(handle)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                // The thread died before reporting; surface the panic.
                let _ = thread.join();
                Err(Error::Internal(format!("service '{name}' died during startup")).into())
            }
        }
    }

    pub fn get_by_id(&self, id: ServiceId) -> Option<ServiceHandle> {
        self.routes.get_by_id(id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<ServiceHandle> {
        self.routes.get_by_name(name)
    }

    /// Hands an envelope into the target service's queue.
    pub fn post_message(&self, target: ServiceId, env: Envelope) -> CoreResult<()> {
        self.routes.post_by_id(target, LoopMessage::User(env))
    }

    /// Swaps the target's config snapshot and notifies its components.
    pub fn reload(&self, target: ServiceId, config: ServiceConfig) -> CoreResult<()> {
        config.validate()?;
        self.routes.post_by_id(target, LoopMessage::ConfigReload(config))
    }

    /// Stops one service and joins its thread; when this returns, the
    /// service's components have stopped.
    pub fn stop_by_id(&self, id: ServiceId) -> AnyResult<()> {
        let handle = self.routes.remove(id);
        let thread = self.dir_mut().threads.remove(&id);
        if handle.is_none() && thread.is_none() {
            return Err(Error::NotFound(format!("service {id}")).record().into());
        }
        if let Some(handle) = handle {
            // A service that already stopped by itself has dropped its
            // queue; that is not an error here.
            let _ = handle.send(LoopMessage::Stop);
        }
        if let Some(thread) = thread {
            thread
                .join()
                .map_err(|panic| Error::Internal(panic_message(&panic)))?;
        }
        Ok(())
    }

    pub fn stop_by_name(&self, name: &str) -> AnyResult<()> {
        match self.routes.get_by_name(name) {
            Some(handle) => self.stop_by_id(handle.id()),
            None => Err(Error::NotFound(format!("service '{name}'")).record().into()),
        }
    }

    /// Stops every service in reverse creation order.
    pub fn stop_all(&self) -> ServiceStopResults {
        let order: Vec<ServiceId> = {
            let mut dir = self.dir_mut();
            let order = std::mem::take(&mut dir.order);
            order
        };
        let mut results = Vec::with_capacity(order.len());
        for id in order.into_iter().rev() {
            match self.stop_by_id(id) {
                Ok(()) => results.push(Ok(())),
                Err(e) => {
                    // Self-stopped services are gone already; that's fine.
                    if self.routes.get_by_id(id).is_none()
                        && !self.dir_mut().threads.contains_key(&id)
                    {
                        results.push(Ok(()));
                    } else {
                        results.push(Err(e));
                    }
                }
            }
        }
        ServiceStopResults(results)
    }

    /// Whether any service thread has died of a panic.
    pub fn fatal_occurred(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        self.routes.ids_in_order()
    }

    fn dir_mut(&self) -> std::sync::RwLockWriteGuard<'_, Directory> {
        self.directory.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}
