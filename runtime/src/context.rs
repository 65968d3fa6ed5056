// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reference-counted context object.
//!
//! A [`Context`] is the handle embedders hold: it owns the pool registry and
//! the optional loader slot, and it is the anchor of the stable ABI. The
//! layout contract is deliberately tiny: the **first word** of the context
//! header is the reference count, the second is a pointer to the
//! [`vtable`](crate::abi::ContextVTable) whose **first slot** is
//! `check_version`. Everything else about the representation is opaque, so a
//! consumer built against an older version can always reject a newer layout
//! before touching it.
//!
//! Reference counting follows the usual manual-`Arc` protocol: increments
//! are relaxed (a new reference can only be created from an existing one),
//! the final decrement releases, and destruction starts with an acquire
//! fence so it observes everything that happened before every earlier
//! release.

use crate::abi;
use crate::error::Error;
use crate::pool::{Pool, PoolConfig};
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::RwLock;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering, fence};

/// A semantic version triple, `#[repr(C)]` for the ABI.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(C)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether an implementation of version `self` satisfies a consumer
    /// requiring `required`, under semver rules.
    #[must_use]
    pub fn satisfies(self, required: Version) -> bool {
        self.major == required.major && (self.minor, self.patch) >= (required.minor, required.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The version of the context ABI implemented by this crate.
pub const VERSION: Version = Version::new(0, 1, 0);

/// The ABI-stable head of a context allocation.
#[repr(C)]
pub struct ContextHeader {
    /// The first word of the context: its reference count.
    pub(crate) refcount: AtomicUsize,
    pub(crate) vtable: &'static abi::ContextVTable,
}

#[repr(C)]
pub(crate) struct ContextInner {
    /// Must stay the first field so a `*const ContextHeader` is a valid
    /// `*const ContextInner` for the implementation side.
    pub(crate) header: ContextHeader,
    pub(crate) data: ContextData,
}

pub(crate) struct ContextData {
    /// Pools created through this context. Only queryable pools are listed.
    pools: RwLock<Vec<Pool>>,
    /// Slot for an external module loader subsystem; the runtime only stores
    /// the pointer.
    loader: AtomicPtr<c_void>,
}

/// A reference-counted handle to a context. See the [module docs](self).
pub struct Context {
    ptr: NonNull<ContextInner>,
}

// Safety: all context state is behind locks or atomics.
unsafe impl Send for Context {}
// Safety: see above.
unsafe impl Sync for Context {}

// === impl Context ===

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a fresh context with a reference count of one.
    #[must_use]
    pub fn new() -> Self {
        let inner = Box::new(ContextInner {
            header: ContextHeader {
                refcount: AtomicUsize::new(1),
                vtable: &abi::CONTEXT_VTABLE,
            },
            data: ContextData {
                pools: RwLock::new(Vec::new()),
                loader: AtomicPtr::new(std::ptr::null_mut()),
            },
        });
        Self {
            ptr: NonNull::from(Box::leak(inner)),
        }
    }

    fn inner(&self) -> &ContextInner {
        // Safety: the reference count keeps the allocation alive as long as
        // any `Context` handle exists.
        unsafe { self.ptr.as_ref() }
    }

    /// The ABI header of this context, to hand to external consumers. The
    /// pointer is valid for as long as the reference count stays above zero.
    #[must_use]
    pub fn header(&self) -> *const ContextHeader {
        &raw const self.inner().header
    }

    /// Reconstructs a handle from an ABI header pointer, taking over one
    /// reference.
    ///
    /// # Safety
    ///
    /// `header` must point to a live context created by this crate, and the
    /// caller must own one reference to it (which this call consumes).
    #[must_use]
    pub unsafe fn from_header(header: *const ContextHeader) -> Self {
        Self {
            // Safety: ContextHeader is the first field of ContextInner.
            ptr: unsafe { NonNull::new_unchecked(header.cast_mut().cast::<ContextInner>()) },
        }
    }

    /// Checks that this context's implemented ABI version satisfies
    /// `required`.
    ///
    /// # Errors
    ///
    /// [`Error::VersionNotSupported`] when it does not.
    pub fn check_version(&self, required: Version) -> Result<(), Error> {
        if VERSION.satisfies(required) {
            Ok(())
        } else {
            Err(Error::VersionNotSupported)
        }
    }

    /// Creates a pool and, when it is queryable, registers it with this
    /// context.
    ///
    /// # Errors
    ///
    /// See [`Pool::new`].
    pub fn create_pool(&self, config: PoolConfig) -> Result<Pool, Error> {
        let pool = Pool::new(config)?;
        if pool.is_queryable() {
            self.inner().data.pools.write().unwrap().push(pool.clone());
        }
        Ok(pool)
    }

    /// The queryable pools created through this context.
    #[must_use]
    pub fn query_pools(&self) -> Vec<Pool> {
        self.inner().data.pools.read().unwrap().clone()
    }

    /// Looks a queryable pool up by label.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no pool carries the label.
    pub fn find_pool(&self, label: &str) -> Result<Pool, Error> {
        self.inner()
            .data
            .pools
            .read()
            .unwrap()
            .iter()
            .find(|pool| pool.label() == Some(label))
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Stores the external loader subsystem pointer, returning the previous
    /// one. The runtime never dereferences it.
    pub fn set_loader(&self, loader: *mut c_void) -> *mut c_void {
        self.inner().data.loader.swap(loader, Ordering::AcqRel)
    }

    /// The external loader subsystem pointer, if one was registered.
    #[must_use]
    pub fn loader(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.inner().data.loader.load(Ordering::Acquire))
    }

    /// The current reference count; for diagnostics and tests.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.inner().header.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_raw(header: *const ContextHeader) {
        // Safety: callers hold a reference, so the header is live.
        let refcount = unsafe { &(*header).refcount };
        refcount.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) unsafe fn release_raw(header: *const ContextHeader) {
        // Safety: callers hold the reference being released.
        let refcount = unsafe { &(*header).refcount };
        if refcount.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // Synchronize with every preceding release decrement before running
        // destruction.
        fence(Ordering::Acquire);
        // Safety: the count reached zero exactly once; we own the allocation.
        // Dropping the pools joins their outstanding work; none of that can
        // re-enter acquire/release on this context.
        drop(unsafe { Box::from_raw(header.cast_mut().cast::<ContextInner>()) });
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Context::acquire_raw(self.header());
        Self { ptr: self.ptr }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Safety: this handle owns one reference.
        unsafe { Context::release_raw(self.header()) };
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("version", &VERSION)
            .field("refcount", &self.refcount())
            .field("pools", &self.inner().data.pools.read().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_rules() {
        let v = Version::new(1, 2, 3);
        assert!(v.satisfies(Version::new(1, 2, 3)));
        assert!(v.satisfies(Version::new(1, 1, 9)));
        assert!(v.satisfies(Version::new(1, 2, 0)));
        assert!(!v.satisfies(Version::new(1, 2, 4)));
        assert!(!v.satisfies(Version::new(1, 3, 0)));
        assert!(!v.satisfies(Version::new(0, 2, 3)));
        assert!(!v.satisfies(Version::new(2, 0, 0)));
    }

    #[test]
    fn check_version_surfaces_mismatch() {
        let ctx = Context::new();
        assert_eq!(ctx.check_version(VERSION), Ok(()));
        assert_eq!(
            ctx.check_version(Version::new(VERSION.major + 1, 0, 0)),
            Err(Error::VersionNotSupported)
        );
    }

    #[test]
    fn refcount_balance() {
        let ctx = Context::new();
        assert_eq!(ctx.refcount(), 1);

        let clone = ctx.clone();
        assert_eq!(ctx.refcount(), 2);

        drop(clone);
        assert_eq!(ctx.refcount(), 1);
    }

    #[test]
    fn contexts_are_independent() {
        let a = Context::new();
        let b = Context::new();

        let pool = a
            .create_pool(crate::PoolConfig {
                label: Some("a-pool".into()),
                worker_count: 1,
                ..crate::PoolConfig::default()
            })
            .unwrap();

        assert_eq!(a.query_pools().len(), 1);
        assert!(b.query_pools().is_empty());
        assert!(b.find_pool("a-pool").is_err());
        assert_eq!(a.find_pool("a-pool").unwrap().label(), pool.label());
    }

    #[test]
    fn loader_slot_round_trip() {
        let ctx = Context::new();
        assert!(ctx.loader().is_none());

        let mut marker = 7_u32;
        let ptr = std::ptr::from_mut(&mut marker).cast::<c_void>();
        assert!(ctx.set_loader(ptr).is_null());
        assert_eq!(ctx.loader().unwrap().as_ptr(), ptr);
    }
}
