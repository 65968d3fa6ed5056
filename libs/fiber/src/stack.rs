// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guard-paged fiber stacks and per-size-class stack pooling.

use crate::StackPointer;
use std::fmt;
use std::io::Error;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Minimum size of a stack, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Largest stack this crate will map.
pub const MAX_STACK_SIZE: usize = 256 * 1024 * 1024;

/// An owned, page-aligned stack with one guard page below it.
pub struct Stack {
    top: StackPointer,
    mmap_len: usize,
    usable: usize,
}

// Safety: a `Stack` is a plain region of memory; ownership may move between
// threads as long as at most one context executes on it at a time, which is
// the owner's responsibility.
unsafe impl Send for Stack {}

impl Stack {
    /// Maps a new stack which has at least the given usable capacity.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error if `mmap` or `mprotect` fail.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let size = size
            .checked_add(page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);
        let mmap_len = size + page_size;

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping with no fixed address requirement.
        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here. If the mprotect call fails then this
            // will be dropped and the memory unmapped.
            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
                usable: size,
            };

            // Make everything except the guard page writable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Returns the highest address (start address) of the stack.
    #[must_use]
    pub fn top(&self) -> StackPointer {
        self.top
    }

    /// Returns the lowest usable address of the stack (the byte just above the
    /// guard page).
    #[must_use]
    pub fn limit(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.usable).unwrap()
    }

    /// The usable capacity of this stack in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.usable
    }

    /// Releases the stack's physical pages back to the OS while keeping the
    /// mapping itself. The stack stays valid; its pages fault back in zeroed
    /// on next use.
    pub fn decommit(&mut self) {
        let base = self.top.get() - self.usable;
        // Safety: `base..top` is a private anonymous mapping owned by us and
        // no context is currently executing on it (`&mut self`).
        unsafe {
            libc::madvise(base as *mut libc::c_void, self.usable, libc::MADV_DONTNEED);
        }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let mmap = self.top.get() - self.mmap_len;
        // Safety: we own the mapping and no context may be executing on a
        // stack that is being dropped.
        let ret = unsafe { libc::munmap(mmap as *mut libc::c_void, self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("top", &format_args!("{:#x}", self.top))
            .field("size", &self.usable)
            .finish()
    }
}

fn page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) has no preconditions.
    #[expect(clippy::cast_sign_loss, reason = "page size is never negative")]
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Configuration of one stack size class in a [`StackPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackClass {
    /// Usable stack size of this class in bytes.
    pub size: usize,
    /// Number of stacks mapped eagerly when the pool is constructed.
    pub preallocated: usize,
    /// Maximum number of decommitted stacks kept cached.
    pub cold: usize,
    /// Maximum number of ready-to-use stacks kept cached.
    pub hot: usize,
    /// Upper bound on concurrently live stacks of this class.
    pub max_allocated: usize,
}

impl StackClass {
    /// A class of `size`-byte stacks with small caching defaults.
    #[must_use]
    pub const fn with_size(size: usize) -> Self {
        Self {
            size,
            preallocated: 0,
            cold: 8,
            hot: 4,
            max_allocated: usize::MAX,
        }
    }
}

/// Errors returned by [`StackPool::allocate`].
#[derive(Debug)]
pub enum StackAllocError {
    /// The class's `max_allocated` limit has been reached.
    Exhausted,
    /// No configured class can satisfy the requested size.
    TooLarge,
    /// The OS refused to map a new stack.
    Os(Error),
}

impl fmt::Display for StackAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackAllocError::Exhausted => f.write_str("stack class exhausted"),
            StackAllocError::TooLarge => f.write_str("requested stack size too large"),
            StackAllocError::Os(err) => write!(f, "failed to map stack: {err}"),
        }
    }
}

impl core::error::Error for StackAllocError {}

struct ClassPool {
    config: StackClass,
    hot: Mutex<Vec<Stack>>,
    cold: Mutex<Vec<Stack>>,
    /// Stacks currently live in this class, cached or handed out.
    allocated: AtomicUsize,
}

/// A pool of stacks, cached per size class.
///
/// `allocate` rounds the requested size up to the smallest configured class
/// and reuses a cached stack when one is available: hot stacks are handed out
/// as-is, cold stacks have been decommitted and fault their pages back in on
/// use. Returned [`PooledStack`]s recycle themselves into their class on drop.
#[derive(Clone)]
pub struct StackPool {
    // sorted by class size, ascending
    classes: Arc<[Arc<ClassPool>]>,
    default_size: usize,
}

// === impl StackPool ===

impl StackPool {
    /// Constructs a pool from the given size classes, mapping each class's
    /// `preallocated` stacks eagerly. `default_size` selects the class used by
    /// [`StackPool::allocate_default`].
    ///
    /// # Errors
    ///
    /// Returns an OS error if preallocation fails, [`StackAllocError::TooLarge`]
    /// if a class size exceeds [`MAX_STACK_SIZE`] or `default_size` matches no
    /// class.
    pub fn new(
        classes: impl IntoIterator<Item = StackClass>,
        default_size: usize,
    ) -> Result<Self, StackAllocError> {
        let mut classes: Vec<StackClass> = classes.into_iter().collect();
        classes.sort_by_key(|c| c.size);
        classes.dedup_by_key(|c| c.size);

        let mut pools = Vec::with_capacity(classes.len());
        for config in classes {
            if config.size > MAX_STACK_SIZE {
                return Err(StackAllocError::TooLarge);
            }

            let mut hot = Vec::new();
            for _ in 0..config.preallocated {
                hot.push(Stack::new(config.size).map_err(StackAllocError::Os)?);
            }

            pools.push(Arc::new(ClassPool {
                allocated: AtomicUsize::new(hot.len()),
                hot: Mutex::new(hot),
                cold: Mutex::new(Vec::new()),
                config,
            }));
        }

        let pool = Self {
            classes: pools.into(),
            default_size,
        };

        if pool.class_for(default_size).is_none() {
            return Err(StackAllocError::TooLarge);
        }

        Ok(pool)
    }

    /// Allocates a stack of at least `size` usable bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`StackAllocError::TooLarge`] when no class fits,
    /// [`StackAllocError::Exhausted`] when the class is at its
    /// `max_allocated` cap, or an OS error if mapping fails.
    pub fn allocate(&self, size: usize) -> Result<PooledStack, StackAllocError> {
        let class = self.class_for(size).ok_or(StackAllocError::TooLarge)?;

        if let Some(stack) = class.hot.lock().unwrap().pop() {
            return Ok(PooledStack::new(stack, Arc::clone(class)));
        }
        if let Some(stack) = class.cold.lock().unwrap().pop() {
            return Ok(PooledStack::new(stack, Arc::clone(class)));
        }

        // Map a new stack, respecting the class's cap on live stacks.
        let mut allocated = class.allocated.load(Ordering::Relaxed);
        loop {
            if allocated >= class.config.max_allocated {
                return Err(StackAllocError::Exhausted);
            }
            match class.allocated.compare_exchange_weak(
                allocated,
                allocated + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => allocated = actual,
            }
        }

        match Stack::new(class.config.size) {
            Ok(stack) => Ok(PooledStack::new(stack, Arc::clone(class))),
            Err(err) => {
                class.allocated.fetch_sub(1, Ordering::Relaxed);
                Err(StackAllocError::Os(err))
            }
        }
    }

    /// Allocates a stack of the pool's default size class.
    ///
    /// # Errors
    ///
    /// See [`StackPool::allocate`].
    pub fn allocate_default(&self) -> Result<PooledStack, StackAllocError> {
        self.allocate(self.default_size)
    }

    /// The usable size of the pool's default stack class.
    #[must_use]
    pub fn default_size(&self) -> usize {
        self.default_size
    }

    fn class_for(&self, size: usize) -> Option<&Arc<ClassPool>> {
        let size = size.max(MIN_STACK_SIZE);
        self.classes.iter().find(|class| class.config.size >= size)
    }
}

impl fmt::Debug for StackPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackPool")
            .field("classes", &self.classes.len())
            .field("default_size", &self.default_size)
            .finish()
    }
}

/// A stack borrowed from a [`StackPool`]; recycles itself into its size class
/// when dropped.
pub struct PooledStack {
    stack: Option<Stack>,
    class: Arc<ClassPool>,
}

// === impl PooledStack ===

impl PooledStack {
    fn new(stack: Stack, class: Arc<ClassPool>) -> Self {
        Self {
            stack: Some(stack),
            class,
        }
    }

    #[must_use]
    pub fn top(&self) -> StackPointer {
        self.stack.as_ref().unwrap().top()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.stack.as_ref().unwrap().size()
    }
}

impl Drop for PooledStack {
    fn drop(&mut self) {
        let Some(mut stack) = self.stack.take() else {
            return;
        };

        {
            let mut hot = self.class.hot.lock().unwrap();
            if hot.len() < self.class.config.hot {
                hot.push(stack);
                return;
            }
        }

        {
            let mut cold = self.class.cold.lock().unwrap();
            if cold.len() < self.class.config.cold {
                stack.decommit();
                cold.push(stack);
                return;
            }
        }

        // Both caches are full; unmap.
        drop(stack);
        self.class.allocated.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for PooledStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStack")
            .field("stack", &self.stack)
            .field("class_size", &self.class.config.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_bounds() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        assert!(stack.size() >= MIN_STACK_SIZE);
        assert_eq!(stack.top().get() - stack.limit().get(), stack.size());
        assert_eq!(stack.top().get() % 16, 0);
    }

    #[test]
    fn stack_is_writable() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        // touch the first and last usable bytes
        // Safety: the region between limit and top is mapped read-write.
        unsafe {
            ((stack.top().get() - 8) as *mut u64).write(0xdead_beef);
            (stack.limit().get() as *mut u8).write(1);
        }
    }

    #[test]
    fn pool_reuses_stacks() {
        let pool = StackPool::new([StackClass::with_size(64 * 1024)], 64 * 1024).unwrap();

        let stack = pool.allocate(16 * 1024).unwrap();
        let top = stack.top();
        drop(stack);

        // the recycled stack comes back hot
        let stack = pool.allocate(64 * 1024).unwrap();
        assert_eq!(stack.top(), top);
    }

    #[test]
    fn pool_respects_max_allocated() {
        let pool = StackPool::new(
            [StackClass {
                size: 64 * 1024,
                preallocated: 0,
                cold: 0,
                hot: 0,
                max_allocated: 2,
            }],
            64 * 1024,
        )
        .unwrap();

        let a = pool.allocate_default().unwrap();
        let _b = pool.allocate_default().unwrap();
        assert!(matches!(
            pool.allocate_default(),
            Err(StackAllocError::Exhausted)
        ));

        // hot/cold are zero, so dropping unmaps and frees up the budget
        drop(a);
        let _c = pool.allocate_default().unwrap();
    }

    #[test]
    fn pool_picks_smallest_fitting_class() {
        let pool = StackPool::new(
            [
                StackClass::with_size(64 * 1024),
                StackClass::with_size(1024 * 1024),
            ],
            64 * 1024,
        )
        .unwrap();

        assert_eq!(pool.allocate(32 * 1024).unwrap().size(), 64 * 1024);
        assert_eq!(pool.allocate(256 * 1024).unwrap().size(), 1024 * 1024);
        assert!(matches!(
            pool.allocate(4 * 1024 * 1024),
            Err(StackAllocError::TooLarge)
        ));
    }

    #[test]
    fn decommitted_stacks_come_back_zeroed_or_valid() {
        let pool = StackPool::new(
            [StackClass {
                size: 64 * 1024,
                preallocated: 1,
                cold: 1,
                hot: 0,
                max_allocated: 4,
            }],
            64 * 1024,
        )
        .unwrap();

        let stack = pool.allocate_default().unwrap();
        // Safety: the usable region is mapped read-write.
        unsafe { ((stack.top().get() - 8) as *mut u64).write(42) };
        drop(stack);

        // comes back via the cold cache; must still be usable
        let stack = pool.allocate_default().unwrap();
        // Safety: as above.
        unsafe { ((stack.top().get() - 8) as *mut u64).write(43) };
    }
}
