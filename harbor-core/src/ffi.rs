//! C-ABI façade for language bindings.
//!
//! Handles are plain integers: a staged-service handle before start, the
//! real service id after. Strings are UTF-8 and NUL-terminated. Fallible
//! functions return 0 on success and a non-zero error code otherwise; the
//! code and message of the most recent failure are kept per thread and
//! retrievable via [`harbor_get_last_error`] /
//! [`harbor_get_last_error_message`].

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;

use crate::component::{Component, HandlerOutcome};
use crate::config::ServiceConfig;
use crate::error::{set_last_error, take_last_error, CoreResult, Error};
use crate::manager::ServiceManager;
use crate::packet::Packet;
use crate::service::{ServiceBuilder, ServiceContext};

/// Process-wide façade state: the manager plus services staged but not yet
/// started.
pub struct App {
    manager: Arc<ServiceManager>,
    staged: Mutex<HashMap<u64, ServiceBuilder>>,
    next_staged: AtomicU64,
}

static APP: OnceLock<App> = OnceLock::new();

/// Installs the global app context consumed by the C ABI. Returns false if
/// one was already installed.
pub fn install_app(manager: Arc<ServiceManager>) -> bool {
    APP.set(App {
        manager,
        staged: Mutex::new(HashMap::new()),
        next_staged: AtomicU64::new(1),
    })
    .is_ok()
}

type PacketCallback =
    extern "C" fn(opcode: u32, payload: *const u8, len: usize, user: *mut c_void) -> i32;

/// Caller-supplied context pointer. The caller guarantees it is valid for
/// the component's lifetime and safe to use from the service thread.
struct UserPtr(*mut c_void);

unsafe impl Send for UserPtr {}

struct FfiComponent {
    name: String,
    opcode: u32,
    callback: PacketCallback,
    user: UserPtr,
}

impl Component for FfiComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, ctx: &mut ServiceContext<'_>) -> CoreResult<()> {
        ctx.register_handler(self.opcode)
    }

    fn on_packet(
        &mut self,
        _ctx: &mut ServiceContext<'_>,
        packet: &Packet,
    ) -> CoreResult<HandlerOutcome> {
        let status = (self.callback)(
            packet.opcode,
            packet.payload.as_ptr(),
            packet.payload.len(),
            self.user.0,
        );
        if status == 0 {
            Ok(HandlerOutcome::Handled)
        } else {
            Err(Error::Internal(format!(
                "bound handler returned status {status}"
            )))
        }
    }
}

fn fail(e: Error) -> c_int {
    let code = e.kind().code();
    let _ = e.record();
    code
}

fn app_or_err(app: *const App) -> Result<&'static App, Error> {
    if app.is_null() {
        return Err(Error::State("app context not installed".into()));
    }
    // The only way to obtain a non-null App pointer is harbor_app_get,
    // which hands out the 'static OnceLock value.
    Ok(unsafe { &*app })
}

unsafe fn cstr<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, Error> {
    if ptr.is_null() {
        return Err(Error::Arg(format!("{what} is null")));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| Error::Arg(format!("{what} is not valid UTF-8")))
}

/// Returns the installed app context, or null when none is installed.
#[no_mangle]
pub extern "C" fn harbor_app_get() -> *const App {
    match APP.get() {
        Some(app) => app as *const App,
        None => std::ptr::null(),
    }
}

/// Stages a new service. Returns a staged handle, or 0 on error.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated UTF-8 string; `listen_addr` may be
/// null or a valid NUL-terminated `host:port` string.
#[no_mangle]
pub unsafe extern "C" fn harbor_service_create(
    app: *const App,
    name: *const c_char,
    listen_addr: *const c_char,
) -> u64 {
    let result = (|| {
        let app = app_or_err(app)?;
        let name = cstr(name, "service name")?;
        let mut config = ServiceConfig::new(name);
        if !listen_addr.is_null() {
            config.listen_addr = Some(cstr(listen_addr, "listen addr")?.to_owned());
        }
        config.validate()?;
        let staged = app.next_staged.fetch_add(1, Ordering::Relaxed);
        app.staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(staged, ServiceBuilder::new(config));
        Ok(staged)
    })();
    match result {
        Ok(staged) => staged,
        Err(e) => {
            let _ = fail(e);
            0
        }
    }
}

/// Adds a packet-handling component to a staged service. `callback` runs on
/// the service thread for every packet with `opcode`; a zero return means
/// handled.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated UTF-8 string. `user` must stay
/// valid until the service stops and be safe to use from the service
/// thread.
#[no_mangle]
pub unsafe extern "C" fn harbor_service_register_component(
    app: *const App,
    staged: u64,
    name: *const c_char,
    opcode: u32,
    callback: PacketCallback,
    user: *mut c_void,
) -> c_int {
    let result = (|| {
        let app = app_or_err(app)?;
        let name = cstr(name, "component name")?;
        let mut map = app.staged.lock().unwrap_or_else(|e| e.into_inner());
        let builder = map
            .remove(&staged)
            .ok_or_else(|| Error::NotFound(format!("staged service {staged}")))?;
        let builder = builder.component(FfiComponent {
            name: name.to_owned(),
            opcode,
            callback,
            user: UserPtr(user),
        });
        map.insert(staged, builder);
        Ok(())
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Starts a staged service. Returns the running service's id, or 0 on
/// error.
#[no_mangle]
pub extern "C" fn harbor_service_start(app: *const App, staged: u64) -> u64 {
    let result = (|| {
        let app = app_or_err(app)?;
        let builder = app
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&staged)
            .ok_or_else(|| Error::NotFound(format!("staged service {staged}")))?;
        app.manager
            .create(builder)
            .map_err(|e| Error::Internal(e.to_string()))
    })();
    match result {
        Ok(handle) => handle.id(),
        Err(e) => {
            let _ = fail(e);
            0
        }
    }
}

/// Queues a packet on one of the service's sessions.
///
/// # Safety
///
/// `payload` must point to `len` readable bytes (may be null when `len` is
/// 0).
#[no_mangle]
pub unsafe extern "C" fn harbor_service_send_packet(
    app: *const App,
    service: u64,
    session: u64,
    opcode: u32,
    payload: *const u8,
    len: usize,
) -> c_int {
    let result = (|| {
        let app = app_or_err(app)?;
        let handle = app
            .manager
            .get_by_id(service)
            .ok_or_else(|| Error::NotFound(format!("service {service}")))?;
        let payload = if len == 0 {
            Bytes::new()
        } else if payload.is_null() {
            return Err(Error::Arg("payload is null".into()));
        } else {
            Bytes::copy_from_slice(std::slice::from_raw_parts(payload, len))
        };
        handle.send_packet(session, Packet::new(opcode, payload))
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Closes one of the service's sessions gracefully.
#[no_mangle]
pub extern "C" fn harbor_session_close(app: *const App, service: u64, session: u64) -> c_int {
    let result = (|| {
        let app = app_or_err(app)?;
        let handle = app
            .manager
            .get_by_id(service)
            .ok_or_else(|| Error::NotFound(format!("service {service}")))?;
        handle.close_session(session)
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Stops a service and waits for its components to stop.
#[no_mangle]
pub extern "C" fn harbor_service_stop(app: *const App, service: u64) -> c_int {
    let result = (|| {
        let app = app_or_err(app)?;
        app.manager
            .stop_by_id(service)
            .map_err(|e| Error::Internal(e.to_string()))
    })();
    match result {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Writes a line into the host's structured log. Levels: 0 trace, 1 debug,
/// 2 info, 3 warn, anything else error.
///
/// # Safety
///
/// `message` must be a valid NUL-terminated UTF-8 string.
#[no_mangle]
pub unsafe extern "C" fn harbor_log_write(level: c_int, message: *const c_char) {
    let message = match cstr(message, "log message") {
        Ok(m) => m,
        Err(_) => return,
    };
    match level {
        0 => tracing::trace!(target: "bindings", "{message}"),
        1 => tracing::debug!(target: "bindings", "{message}"),
        2 => tracing::info!(target: "bindings", "{message}"),
        3 => tracing::warn!(target: "bindings", "{message}"),
        _ => tracing::error!(target: "bindings", "{message}"),
    }
}

/// Error code of the calling thread's most recent failure, clearing it.
/// Returns 0 when no error is pending.
#[no_mangle]
pub extern "C" fn harbor_get_last_error() -> c_int {
    match take_last_error() {
        Some((kind, message)) => {
            // Keep the pair available for the message getter.
            set_last_error(kind, message);
            kind.code()
        }
        None => 0,
    }
}

/// Copies the last error message (NUL-terminated, possibly truncated) into
/// `buf`. Returns the number of bytes written excluding the terminator.
///
/// # Safety
///
/// `buf` must point to `cap` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn harbor_get_last_error_message(buf: *mut c_char, cap: usize) -> usize {
    if buf.is_null() || cap == 0 {
        return 0;
    }
    let message = match take_last_error() {
        Some((_, message)) => message,
        None => return 0,
    };
    let bytes = message.as_bytes();
    let n = bytes.len().min(cap - 1);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, n);
    *buf.add(n) = 0;
    n
}
