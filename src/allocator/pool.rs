//! Hierarchical stack pool.
//!
//! Allocation goes thread-local cache → sharded global pool → new pool chunk
//! → dedicated system mapping. Chunks are mapped in one piece and aligned to
//! [`CHUNK_ALIGNMENT`], so every pooled stack lives inside a few large,
//! easy-to-find regions. Once `limit` stacks have been carved, further demand
//! is served by the system allocator and those stacks are unmapped on release.

use super::stack::{FiberStack, StackOrigin, page_size, round_up};
use crate::error::warn_every_second;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

const SHARDS: usize = 8;
/// Stacks moved between a thread cache and a shard at a time.
const TRANSFER_BATCH: usize = 32;
/// A thread cache holding more than this returns a batch to its shard.
const LOCAL_HIGH_WATER: usize = 2 * TRANSFER_BATCH;
/// Pool chunks start on this boundary.
pub const CHUNK_ALIGNMENT: usize = 4 * 1024 * 1024;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);
static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

struct Chunk {
    base: *mut libc::c_void,
    len: usize,
}

// SAFETY: the chunk record is only an address range.
unsafe impl Send for Chunk {}

/// Pool of fiber stacks shared by every worker of one runtime.
pub struct StackPool {
    id: usize,
    usable: usize,
    guard: usize,
    limit: usize,
    shards: Box<[CachePadded<Mutex<Vec<FiberStack>>>]>,
    chunks: Mutex<Vec<Chunk>>,
    created: AtomicUsize,
    outstanding: AtomicUsize,
}

struct LocalCache {
    pool_id: usize,
    pool: Weak<StackPool>,
    stacks: Vec<FiberStack>,
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let stacks = std::mem::take(&mut self.stacks);
            pool.shard().lock().extend(stacks);
        }
    }
}

thread_local! {
    static LOCAL_CACHES: RefCell<Vec<LocalCache>> = const { RefCell::new(Vec::new()) };
    static SHARD_HINT: Cell<usize> = const { Cell::new(usize::MAX) };
}

impl StackPool {
    /// `stack_size` usable bytes per stack, at most `limit` pooled stacks.
    pub fn new(stack_size: usize, guard_page: bool, limit: usize) -> Arc<StackPool> {
        let page = page_size();
        let shards = (0..SHARDS)
            .map(|_| CachePadded::new(Mutex::new(Vec::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(StackPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            usable: round_up(stack_size, page),
            guard: if guard_page { page } else { 0 },
            limit,
            shards,
            chunks: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Returns a stack, or `None` if even the system allocator failed.
    pub fn allocate(self: &Arc<Self>) -> Option<FiberStack> {
        let stack = self
            .with_local(|cache| {
                if cache.stacks.is_empty() {
                    cache.stacks = self.refill();
                }
                cache.stacks.pop()
            })
            .or_else(|| {
                warn_every_second!(
                    created = self.created.load(Ordering::Relaxed),
                    limit = self.limit,
                    "stack pool exhausted, falling back to system allocation"
                );
                FiberStack::allocate_system(self.usable, self.guard != 0)
            })?;
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Some(stack)
    }

    /// Releases a stack to wherever it came from.
    pub fn deallocate(self: &Arc<Self>, stack: FiberStack) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        stack.set_owner(ptr::null());
        match stack.origin() {
            // SAFETY: nothing runs on a stack handed back to us.
            StackOrigin::System => unsafe { stack.unmap() },
            StackOrigin::Pool => {
                let overflow = self.with_local(|cache| {
                    cache.stacks.push(stack);
                    if cache.stacks.len() > LOCAL_HIGH_WATER {
                        let keep = cache.stacks.len() - TRANSFER_BATCH;
                        Some(cache.stacks.split_off(keep))
                    } else {
                        None
                    }
                });
                if let Some(batch) = overflow {
                    self.shard().lock().extend(batch);
                }
            }
        }
    }

    /// Stacks handed out and not yet returned, of either origin.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Pool stacks carved so far (never exceeds the limit).
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn stack_size(&self) -> usize {
        self.usable
    }

    fn with_local<R>(self: &Arc<Self>, f: impl FnOnce(&mut LocalCache) -> R) -> R {
        LOCAL_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            caches.retain(|c| c.pool.strong_count() > 0);
            let index = match caches.iter().position(|c| c.pool_id == self.id) {
                Some(index) => index,
                None => {
                    caches.push(LocalCache {
                        pool_id: self.id,
                        pool: Arc::downgrade(self),
                        stacks: Vec::new(),
                    });
                    caches.len() - 1
                }
            };
            f(&mut caches[index])
        })
    }

    fn shard_index(&self) -> usize {
        SHARD_HINT.with(|hint| {
            if hint.get() == usize::MAX {
                hint.set(NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS);
            }
            hint.get()
        })
    }

    fn shard(&self) -> &Mutex<Vec<FiberStack>> {
        &self.shards[self.shard_index()]
    }

    /// Pulls a batch from our shard, then from any other shard, then grows.
    fn refill(&self) -> Vec<FiberStack> {
        let home = self.shard_index();
        for offset in 0..SHARDS {
            let shard = &self.shards[(home + offset) % SHARDS];
            let mut stacks = if offset == 0 {
                shard.lock()
            } else {
                match shard.try_lock() {
                    Some(guard) => guard,
                    None => continue,
                }
            };
            if !stacks.is_empty() {
                let keep = stacks.len().saturating_sub(TRANSFER_BATCH);
                return stacks.split_off(keep);
            }
        }
        self.grow()
    }

    /// Maps a new chunk of up to `TRANSFER_BATCH` stacks.
    fn grow(&self) -> Vec<FiberStack> {
        let mut chunks = self.chunks.lock();
        let created = self.created.load(Ordering::Relaxed);
        let count = TRANSFER_BATCH.min(self.limit.saturating_sub(created));
        if count == 0 {
            return Vec::new();
        }
        let slot = self.usable + self.guard;
        let len = slot * count;
        let Some(base) = map_aligned(len, CHUNK_ALIGNMENT) else {
            return Vec::new();
        };
        chunks.push(Chunk {
            base: base.as_ptr().cast(),
            len,
        });
        self.created.store(created + count, Ordering::Relaxed);
        tracing::debug!(pool = self.id, count, total = created + count, "stack pool grew");

        // SAFETY: `base` is the chunk just mapped, `count` slots long.
        unsafe { self.carve(base, count, FiberStack::protect_guard) }
    }

    /// Splits a chunk into stacks. Slots whose guard page cannot be protected
    /// are left unused; `allocate` falls back to the system once none remain.
    ///
    /// # Safety
    /// `base` must start a fresh read/write mapping of `count` slots.
    unsafe fn carve(
        &self,
        base: NonNull<u8>,
        count: usize,
        mut protect: impl FnMut(&FiberStack) -> bool,
    ) -> Vec<FiberStack> {
        let slot = self.usable + self.guard;
        (0..count)
            .filter_map(|i| {
                // SAFETY: slot `i` lies inside the chunk, guaranteed by the caller.
                let stack = unsafe {
                    let slot_base = NonNull::new_unchecked(base.as_ptr().add(i * slot));
                    FiberStack::from_raw_parts(slot_base, slot, self.guard, StackOrigin::Pool)
                };
                if protect(&stack) {
                    Some(stack)
                } else {
                    warn_every_second!(pool = self.id, slot = i, "failed to protect stack guard page, slot skipped");
                    None
                }
            })
            .collect()
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        let outstanding = self.outstanding.load(Ordering::Relaxed);
        if outstanding != 0 {
            tracing::debug!(outstanding, "stack pool dropped with live stacks, leaking chunks");
            return;
        }
        for chunk in self.chunks.get_mut().drain(..) {
            // SAFETY: no stack of this chunk is in use any more.
            unsafe { libc::munmap(chunk.base, chunk.len) };
        }
    }
}

/// Maps `len` bytes starting on an `align` boundary by over-mapping and
/// trimming both ends.
fn map_aligned(len: usize, align: usize) -> Option<NonNull<u8>> {
    let reserve = len + align;
    // SAFETY: anonymous private mapping.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            reserve,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    let start = raw as usize;
    let aligned = round_up(start, align);
    let head = aligned - start;
    let tail = reserve - head - len;
    // SAFETY: trimming pages of the mapping created above.
    unsafe {
        if head != 0 {
            libc::munmap(raw, head);
        }
        if tail != 0 {
            libc::munmap((aligned + len) as *mut libc::c_void, tail);
        }
    }
    NonNull::new(aligned as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::stack::STACK_MAGIC;

    #[test]
    fn test_round_trip_returns_to_baseline() {
        let pool = StackPool::new(32 * 1024, true, 256);
        for _ in 0..3 {
            let stacks: Vec<_> = (0..100).map(|_| pool.allocate().unwrap()).collect();
            assert_eq!(pool.outstanding(), 100);
            for stack in stacks {
                pool.deallocate(stack);
            }
            assert_eq!(pool.outstanding(), 0);
        }
        assert!(pool.created() <= 256);
    }

    #[test]
    fn test_live_stacks_do_not_overlap() {
        let pool = StackPool::new(16 * 1024, true, 64);
        let stacks: Vec<_> = (0..80).map(|_| pool.allocate().unwrap()).collect();
        let mut ranges: Vec<_> = stacks.iter().map(|s| (s.bottom(), s.top())).collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping stacks {:?}", pair);
        }
        for stack in &stacks {
            assert_eq!(stack.magic(), STACK_MAGIC);
        }
        for stack in stacks {
            pool.deallocate(stack);
        }
    }

    #[test]
    fn test_limit_falls_back_to_system() {
        let pool = StackPool::new(16 * 1024, false, 0);
        let stack = pool.allocate().unwrap();
        assert_eq!(stack.origin(), StackOrigin::System);
        assert_eq!(pool.created(), 0);
        pool.deallocate(stack);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_chunks_are_aligned() {
        let pool = StackPool::new(16 * 1024, true, 8);
        let stack = pool.allocate().unwrap();
        assert_eq!(stack.origin(), StackOrigin::Pool);
        let chunk_base = pool.chunks.lock()[0].base as usize;
        assert_eq!(chunk_base % CHUNK_ALIGNMENT, 0);
        pool.deallocate(stack);
    }

    #[test]
    fn test_unguarded_slots_are_not_handed_out() {
        let pool = StackPool::new(16 * 1024, true, 8);
        let slot = pool.usable + pool.guard;
        let base = map_aligned(slot * 4, CHUNK_ALIGNMENT).expect("mmap failed");

        let skipped = unsafe { pool.carve(base, 4, |_| false) };
        assert!(skipped.is_empty());
        let mut calls = 0;
        let some = unsafe {
            pool.carve(base, 4, |stack| {
                calls += 1;
                calls % 2 == 0 && stack.protect_guard()
            })
        };
        assert_eq!(some.len(), 2);
        assert!(some.iter().all(|stack| stack.origin() == StackOrigin::Pool));

        drop(some);
        unsafe { libc::munmap(base.as_ptr().cast(), slot * 4) };
    }

    #[test]
    fn test_cache_spills_across_threads() {
        let pool = StackPool::new(16 * 1024, false, 512);
        let stacks: Vec<_> = (0..200).map(|_| pool.allocate().unwrap()).collect();
        let remote = pool.clone();
        std::thread::spawn(move || {
            for stack in stacks {
                remote.deallocate(stack);
            }
        })
        .join()
        .unwrap();
        assert_eq!(pool.outstanding(), 0);
        // Stacks returned on the other thread are reused instead of carving more.
        let created = pool.created();
        let again: Vec<_> = (0..50).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.created(), created);
        for stack in again {
            pool.deallocate(stack);
        }
    }
}
