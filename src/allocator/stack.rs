//! Raw fiber stacks.
//!
//! A stack is a page-aligned mapping laid out as
//!
//! ```text
//! low                                                      high
//! [ guard page (PROT_NONE) | usable stack ...... | StackHeader ]
//! ```
//!
//! The header at the top carries a magic marker and a pointer to the fiber
//! currently running on the stack, so a debugger scanning pool chunks can
//! enumerate live fibers.

use corosensei::stack::{Stack, StackPointer};
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

#[cfg(not(unix))]
compile_error!("fiber stacks are only implemented for unix targets");

/// "FIBERSTK" in ASCII.
pub const STACK_MAGIC: u64 = 0x4649_4245_5253_544b;

/// Bytes reserved at the top of each stack for [`StackHeader`].
pub(crate) const HEADER_RESERVE: usize = 64;

#[repr(C)]
pub(crate) struct StackHeader {
    magic: u64,
    entity: AtomicPtr<()>,
}

/// Where a stack's memory came from, so it is released to the same place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackOrigin {
    /// Carved out of a pool chunk; goes back to the pool.
    Pool,
    /// A dedicated mapping; unmapped on release.
    System,
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    };
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// One fiber stack. Has no `Drop`: memory is released explicitly through the
/// pool so that pool stacks are never unmapped individually.
pub struct FiberStack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
    origin: StackOrigin,
}

// SAFETY: the stack is plain memory exclusively owned by this value.
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Maps a dedicated stack with `usable` bytes plus an optional guard page.
    pub fn allocate_system(usable: usize, guard_page: bool) -> Option<FiberStack> {
        let page = page_size();
        let usable = round_up(usable, page);
        let guard = if guard_page { page } else { 0 };
        let len = usable + guard;
        // SAFETY: anonymous private mapping, no aliasing.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }
        let start = NonNull::new(base.cast::<u8>())?;
        // SAFETY: `start` is a fresh mapping of `len` bytes.
        let stack = unsafe { Self::from_raw_parts(start, len, guard, StackOrigin::System) };
        if guard != 0 && !stack.protect_guard() {
            // SAFETY: mapping created above and not shared.
            unsafe { libc::munmap(base, len) };
            return None;
        }
        Some(stack)
    }

    /// Wraps a slot carved out of a larger mapping and stamps its header.
    ///
    /// # Safety
    /// `base..base+len` must be mapped read/write (apart from the guard) and
    /// owned by the caller.
    pub(crate) unsafe fn from_raw_parts(
        base: NonNull<u8>,
        len: usize,
        guard: usize,
        origin: StackOrigin,
    ) -> FiberStack {
        let stack = FiberStack {
            base,
            len,
            guard,
            origin,
        };
        // SAFETY: the header lies inside the writable part of the slot.
        unsafe {
            stack.header_ptr().write(StackHeader {
                magic: STACK_MAGIC,
                entity: AtomicPtr::new(ptr::null_mut()),
            });
        }
        stack
    }

    pub(crate) fn protect_guard(&self) -> bool {
        if self.guard == 0 {
            return true;
        }
        // SAFETY: the guard page is the first page of our own mapping.
        unsafe { libc::mprotect(self.base.as_ptr().cast(), self.guard, libc::PROT_NONE) == 0 }
    }

    /// Unmaps a system stack.
    ///
    /// # Safety
    /// Must only be called for `StackOrigin::System` stacks nobody runs on.
    pub(crate) unsafe fn unmap(self) {
        debug_assert_eq!(self.origin, StackOrigin::System);
        // SAFETY: guaranteed by the caller.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }

    pub fn origin(&self) -> StackOrigin {
        self.origin
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize + self.guard
    }

    /// One past the highest address of the slot.
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }

    pub fn usable_size(&self) -> usize {
        self.len - self.guard - HEADER_RESERVE
    }

    fn header_ptr(&self) -> *mut StackHeader {
        (self.top() - HEADER_RESERVE) as *mut StackHeader
    }

    fn header(&self) -> &StackHeader {
        // SAFETY: written in `from_raw_parts`, lives as long as the mapping.
        unsafe { &*self.header_ptr() }
    }

    pub fn magic(&self) -> u64 {
        self.header().magic
    }

    /// Records (or clears, with null) the fiber running on this stack.
    pub(crate) fn set_owner(&self, entity: *const ()) {
        self.header().entity.store(entity as *mut (), Ordering::Release);
    }

    pub fn owner(&self) -> *const () {
        self.header().entity.load(Ordering::Acquire)
    }
}

// SAFETY: `base()` and `limit()` describe memory owned by this stack for its
// whole lifetime, and the header reserve keeps the coroutine away from the
// marker.
unsafe impl Stack for FiberStack {
    fn base(&self) -> StackPointer {
        // SAFETY: mappings never start at address zero.
        unsafe { NonZeroUsize::new_unchecked(self.top() - HEADER_RESERVE) }
    }

    fn limit(&self) -> StackPointer {
        // SAFETY: as above.
        unsafe { NonZeroUsize::new_unchecked(self.bottom()) }
    }
}
