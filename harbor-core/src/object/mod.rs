//! Reference-counted object substrate.
//!
//! Two release paths coexist, mirroring the runtime's disposal rules:
//!
//! - The owning path: [`Retained<T>`] is an explicit handle; `clone` retains,
//!   drop releases, the last release frees the allocation. Retain/release are
//!   atomic (`Relaxed` increment, `Release` decrement with an `Acquire` fence
//!   on the final drop), so a handle may be moved or cloned across threads
//!   when `T: Send + Sync`.
//! - The deferred path: [`Retained::autorelease`] transfers the handle into
//!   the calling thread's top [`pool::AutoReleasePool`] frame without
//!   touching the refcount. The frame's drain at a loop boundary drops the
//!   handle, and that drop is the one release for the enlistment.
//!
//! Enlisting never changes which thread owns the pool entry: a handle
//! auto-released on thread A drains on thread A.

use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, Ordering};

use crate::error::Error;

pub mod pool;

struct Header {
    refs: AtomicI32,
    auto_refs: AtomicU32,
}

struct Inner<T> {
    header: Header,
    value: T,
}

/// Owning handle to a refcounted value.
pub struct Retained<T> {
    ptr: NonNull<Inner<T>>,
    /// True only for the handle a pool frame owns.
    enlisted: bool,
}

unsafe impl<T: Send + Sync> Send for Retained<T> {}
unsafe impl<T: Send + Sync> Sync for Retained<T> {}

impl<T> Retained<T> {
    pub fn new(value: T) -> Self {
        let inner = Box::new(Inner {
            header: Header {
                refs: AtomicI32::new(1),
                auto_refs: AtomicU32::new(0),
            },
            value,
        });
        Retained {
            ptr: NonNull::from(Box::leak(inner)),
            enlisted: false,
        }
    }

    fn header(&self) -> &Header {
        unsafe { &self.ptr.as_ref().header }
    }

    /// Current strong count. Diagnostic only; racy under concurrent clones.
    pub fn ref_count(&self) -> i32 {
        self.header().refs.load(Ordering::Relaxed)
    }

    /// How many pool enlistments are outstanding for this value.
    pub fn auto_count(&self) -> u32 {
        self.header().auto_refs.load(Ordering::Relaxed)
    }
}

/// Rejected enlistment: no pool frame is active on the calling thread.
/// Carries the handle back, so the caller still owns the object; a frame is
/// never created implicitly.
pub struct NoActivePool<T>(Retained<T>);

impl<T> NoActivePool<T> {
    pub fn into_inner(self) -> Retained<T> {
        self.0
    }
}

impl<T> std::fmt::Debug for NoActivePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no active auto-release pool")
    }
}

impl<T> From<NoActivePool<T>> for Error {
    fn from(_: NoActivePool<T>) -> Error {
        Error::State("no active auto-release pool".into())
    }
}

impl<T: 'static> Retained<T> {
    /// Transfers this handle into the calling thread's top pool frame. The
    /// refcount is untouched; the frame's drain drops the handle and that
    /// drop performs the release.
    pub fn autorelease(mut self) -> Result<(), NoActivePool<T>> {
        self.header().auto_refs.fetch_add(1, Ordering::Relaxed);
        self.enlisted = true;
        match pool::enlist(Box::new(self)) {
            Ok(()) => Ok(()),
            Err(entry) => {
                let mut handle = *entry
                    .downcast::<Retained<T>>()
                    .expect("entry was boxed above");
                handle.header().auto_refs.fetch_sub(1, Ordering::Relaxed);
                handle.enlisted = false;
                Err(NoActivePool(handle))
            }
        }
    }
}

impl<T> Clone for Retained<T> {
    fn clone(&self) -> Self {
        let prev = self.header().refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "retain on a dead object");
        Retained {
            ptr: self.ptr,
            enlisted: false,
        }
    }
}

impl<T> Drop for Retained<T> {
    fn drop(&mut self) {
        if self.enlisted {
            self.header().auto_refs.fetch_sub(1, Ordering::Relaxed);
        }
        if self.header().refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe { drop(Box::from_raw(self.ptr.as_ptr())) };
        }
    }
}

impl<T> Deref for Retained<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Retained<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retained")
            .field("refs", &self.ref_count())
            .field("auto_refs", &self.auto_count())
            .field("value", &**self)
            .finish()
    }
}
