// Copyright 2025-2026 CEMAXECUTER LLC

//! Reference-counted buffer arena.
//!
//! Every pipeline stage exchanges sample and spectrum data through arena
//! buffers addressed by [`Handle`]s. A handle is a slab index plus a
//! generation counter, so a handle that outlives its buffer is rejected at
//! the API boundary instead of reading recycled memory.
//!
//! Ownership is explicit: [`Arena::allocate`] hands back a [`Buffer`] guard
//! holding one reference. Cloning the guard retains, dropping it releases,
//! and the backing memory is freed the moment the count reaches zero.
//! The raw [`Arena::retain`] / [`Arena::release`] pair is also exposed for
//! callers that pass bare handles around.

use std::fmt;
use std::mem;
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use num_complex::Complex64;

/// Errors reported by the arena.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("arena exhausted: cannot allocate {requested} bytes ({in_use} of {limit} in use)")]
    Exhausted {
        requested: usize,
        in_use: usize,
        limit: usize,
    },
    #[error("invalid buffer handle {0}")]
    InvalidHandle(Handle),
}

/// Generations stay below 2^31 so a packed handle is never negative.
const GENERATION_MASK: u32 = 0x7fff_ffff;

/// Opaque reference to an arena entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slab slot this handle points at.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a non-negative integer (generation in the high word).
    pub fn to_raw(self) -> i64 {
        (((self.generation & GENERATION_MASK) as i64) << 32) | self.index as i64
    }

    /// Unpack a raw value; negative values mean "no buffer".
    pub fn from_raw(raw: i64) -> Option<Handle> {
        if raw < 0 {
            return None;
        }
        Some(Handle {
            index: (raw & 0xffff_ffff) as u32,
            generation: ((raw >> 32) as u32) & GENERATION_MASK,
        })
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Plain-old-data element types a buffer region can be viewed as.
///
/// # Safety
///
/// Implementors must accept every bit pattern and have an alignment of at
/// most 8 bytes (the alignment of the backing storage).
pub unsafe trait Element: Copy + Send + Sync + 'static {}

unsafe impl Element for u8 {}
unsafe impl Element for i8 {}
unsafe impl Element for u16 {}
unsafe impl Element for i16 {}
unsafe impl Element for u32 {}
unsafe impl Element for i32 {}
unsafe impl Element for f32 {}
unsafe impl Element for f64 {}
unsafe impl Element for Complex64 {}

/// Backing memory for one entry, stored as 8-byte words so every
/// [`Element`] view is correctly aligned.
struct Region {
    words: Box<[u64]>,
    extent: usize,
}

impl Region {
    fn zeroed(extent: usize) -> Option<Region> {
        let count = extent.div_ceil(mem::size_of::<u64>());
        let mut words: Vec<u64> = Vec::new();
        words.try_reserve_exact(count).ok()?;
        words.resize(count, 0);
        Some(Region {
            words: words.into_boxed_slice(),
            extent,
        })
    }

    fn view<T: Element>(&self) -> &[T] {
        let len = self.extent / mem::size_of::<T>();
        // SAFETY: the storage holds at least `extent` initialised bytes, is
        // 8-byte aligned, and `T` accepts any bit pattern.
        unsafe { slice::from_raw_parts(self.words.as_ptr() as *const T, len) }
    }

    fn view_mut<T: Element>(&mut self) -> &mut [T] {
        let len = self.extent / mem::size_of::<T>();
        // SAFETY: as in `view`; the exclusive borrow guarantees uniqueness.
        unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut T, len) }
    }
}

struct Entry {
    region: Arc<RwLock<Region>>,
    /// Copy of the region size so slab queries never touch the region lock
    extent: usize,
    granularity: usize,
    refs: usize,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Slab {
    slots: Vec<Slot>,
    free: Vec<u32>,
    bytes_in_use: usize,
    live: usize,
}

impl Slab {
    fn entry(&self, handle: Handle) -> Result<&Entry, ArenaError> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(ArenaError::InvalidHandle(handle))
    }

    fn entry_mut(&mut self, handle: Handle) -> Result<&mut Entry, ArenaError> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(ArenaError::InvalidHandle(handle))
    }
}

/// Thread-safe pool of reference-counted memory regions.
///
/// The slab (handles, counts) sits behind a single mutex; each region has
/// its own read/write lock so a worker touching one buffer never blocks the
/// rest of the pipeline for longer than a slab lookup.
pub struct Arena {
    slab: Mutex<Slab>,
    limit: usize,
}

impl Arena {
    /// Create an arena with no allocation limit.
    pub fn new() -> Arc<Arena> {
        Self::with_limit(usize::MAX)
    }

    /// Create an arena that refuses to hold more than `limit` bytes at once.
    pub fn with_limit(limit: usize) -> Arc<Arena> {
        Arc::new(Arena {
            slab: Mutex::new(Slab::default()),
            limit,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slab> {
        self.slab.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a zero-filled region of `count * elem_size` bytes with a
    /// reference count of one.
    pub fn allocate(
        self: &Arc<Self>,
        count: usize,
        elem_size: usize,
    ) -> Result<Buffer, ArenaError> {
        let handle = self.allocate_raw(count, elem_size)?;
        Ok(Buffer {
            arena: Arc::clone(self),
            handle,
        })
    }

    /// Allocate room for `count` values of `T`.
    pub fn allocate_for<T: Element>(self: &Arc<Self>, count: usize) -> Result<Buffer, ArenaError> {
        self.allocate(count, mem::size_of::<T>())
    }

    /// Allocation path for FFT input/output: `count` complex doubles laid
    /// out as the transform expects.
    pub fn allocate_complex(self: &Arc<Self>, count: usize) -> Result<Buffer, ArenaError> {
        self.allocate_for::<Complex64>(count)
    }

    /// Allocate and return the bare handle. The caller owns one reference
    /// and must eventually [`release`](Arena::release) it.
    pub fn allocate_raw(&self, count: usize, elem_size: usize) -> Result<Handle, ArenaError> {
        let mut slab = self.lock();
        let extent = count.saturating_mul(elem_size);

        let exhausted = ArenaError::Exhausted {
            requested: extent,
            in_use: slab.bytes_in_use,
            limit: self.limit,
        };
        if extent > self.limit.saturating_sub(slab.bytes_in_use) {
            log::error!("{}", exhausted);
            return Err(exhausted);
        }
        let region = match Region::zeroed(extent) {
            Some(region) => region,
            None => {
                log::error!("{}", exhausted);
                return Err(exhausted);
            }
        };

        let entry = Entry {
            region: Arc::new(RwLock::new(region)),
            extent,
            granularity: elem_size,
            refs: 1,
        };

        let index = match slab.free.pop() {
            Some(index) => index,
            None => {
                slab.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (slab.slots.len() - 1) as u32
            }
        };
        let slot = &mut slab.slots[index as usize];
        slot.entry = Some(entry);
        let handle = Handle {
            index,
            generation: slot.generation,
        };

        slab.bytes_in_use += extent;
        slab.live += 1;
        Ok(handle)
    }

    /// Add a reference. Returns the new count.
    pub fn retain(&self, handle: Handle) -> Result<usize, ArenaError> {
        let mut slab = self.lock();
        let entry = slab.entry_mut(handle)?;
        entry.refs += 1;
        Ok(entry.refs)
    }

    /// Drop a reference. Returns the remaining count; at zero the region is
    /// freed and the handle stops resolving.
    pub fn release(&self, handle: Handle) -> Result<usize, ArenaError> {
        let mut slab = self.lock();
        let entry = slab.entry_mut(handle)?;
        entry.refs -= 1;
        let remaining = entry.refs;
        if remaining == 0 {
            let slot = &mut slab.slots[handle.index()];
            let freed = slot.entry.take();
            slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
            let extent = freed.map(|e| e.extent).unwrap_or(0);
            slab.bytes_in_use -= extent;
            slab.free.push(handle.index);
            slab.live -= 1;
        }
        Ok(remaining)
    }

    /// Size of the region in bytes.
    pub fn extent_bytes(&self, handle: Handle) -> Result<usize, ArenaError> {
        let slab = self.lock();
        Ok(slab.entry(handle)?.extent)
    }

    /// Element size the region was allocated with.
    pub fn granularity(&self, handle: Handle) -> Result<usize, ArenaError> {
        let slab = self.lock();
        Ok(slab.entry(handle)?.granularity)
    }

    /// Current reference count, or `None` once the handle is dead.
    pub fn refcount(&self, handle: Handle) -> Option<usize> {
        self.lock().entry(handle).ok().map(|e| e.refs)
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        self.lock().entry(handle).is_ok()
    }

    /// Number of entries currently alive.
    pub fn live_buffers(&self) -> usize {
        self.lock().live
    }

    pub fn bytes_in_use(&self) -> usize {
        self.lock().bytes_in_use
    }

    fn region(&self, handle: Handle) -> Result<Arc<RwLock<Region>>, ArenaError> {
        let slab = self.lock();
        Ok(Arc::clone(&slab.entry(handle)?.region))
    }

    /// Run `f` over a typed, read-only view of the region.
    pub fn read<T: Element, R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&[T]) -> R,
    ) -> Result<R, ArenaError> {
        let region = self.region(handle)?;
        let guard = read_lock(&region);
        Ok(f(guard.view::<T>()))
    }

    /// Run `f` over a typed, writable view of the region.
    pub fn write<T: Element, R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut [T]) -> R,
    ) -> Result<R, ArenaError> {
        let region = self.region(handle)?;
        let mut guard = region.write().unwrap_or_else(PoisonError::into_inner);
        Ok(f(guard.view_mut::<T>()))
    }
}

fn read_lock(region: &RwLock<Region>) -> std::sync::RwLockReadGuard<'_, Region> {
    region.read().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slab = self.lock();
        f.debug_struct("Arena")
            .field("live", &slab.live)
            .field("bytes_in_use", &slab.bytes_in_use)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Owning reference to one arena entry.
///
/// Holding a `Buffer` keeps the entry alive. `clone()` retains, `drop()`
/// releases, so every acquisition is paired with a release on all exit
/// paths.
pub struct Buffer {
    arena: Arc<Arena>,
    handle: Handle,
}

impl Buffer {
    /// Take over one reference the caller already owns on `handle`.
    pub fn adopt(arena: &Arc<Arena>, handle: Handle) -> Result<Buffer, ArenaError> {
        if !arena.is_valid(handle) {
            return Err(ArenaError::InvalidHandle(handle));
        }
        Ok(Buffer {
            arena: Arc::clone(arena),
            handle,
        })
    }

    /// Give up the guard without releasing; the caller now owns the reference.
    pub fn into_raw(self) -> Handle {
        let handle = self.handle;
        mem::forget(self);
        handle
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub fn extent_bytes(&self) -> usize {
        self.arena.extent_bytes(self.handle).unwrap_or(0)
    }

    pub fn granularity(&self) -> usize {
        self.arena.granularity(self.handle).unwrap_or(0)
    }

    /// Number of whole `T` values the region holds.
    pub fn len_of<T: Element>(&self) -> usize {
        self.extent_bytes() / mem::size_of::<T>()
    }

    pub fn refcount(&self) -> usize {
        self.arena.refcount(self.handle).unwrap_or(0)
    }

    pub fn read<T: Element, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R, ArenaError> {
        self.arena.read(self.handle, f)
    }

    pub fn write<T: Element, R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R, ArenaError> {
        self.arena.write(self.handle, f)
    }

    /// Copy the region out as a vector of `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ArenaError> {
        self.read(|values: &[T]| values.to_vec())
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        if let Err(e) = self.arena.retain(self.handle) {
            log::error!("retain failed: {}", e);
        }
        Buffer {
            arena: Arc::clone(&self.arena),
            handle: self.handle,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Err(e) = self.arena.release(self.handle) {
            log::error!("release failed: {}", e);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_allocate_zeroed() {
        let arena = Arena::new();
        let buf = arena.allocate(16, 4).unwrap();
        assert_eq!(buf.extent_bytes(), 64);
        assert_eq!(buf.granularity(), 4);
        assert_eq!(buf.refcount(), 1);
        let values: Vec<f32> = buf.to_vec().unwrap();
        assert_eq!(values.len(), 16);
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_retain_release_preserves_contents() {
        let arena = Arena::new();
        let buf = arena.allocate_for::<f64>(4).unwrap();
        buf.write(|v: &mut [f64]| v.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]))
            .unwrap();

        let h = buf.handle();
        assert_eq!(arena.retain(h).unwrap(), 2);
        assert_eq!(arena.release(h).unwrap(), 1);
        assert_eq!(buf.to_vec::<f64>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_nth_release_invalidates() {
        let arena = Arena::new();
        let h = arena.allocate_raw(8, 1).unwrap();
        for _ in 0..3 {
            arena.retain(h).unwrap();
        }
        for expected in (1..=3).rev() {
            assert_eq!(arena.release(h).unwrap(), expected);
            assert!(arena.is_valid(h));
        }
        assert_eq!(arena.release(h).unwrap(), 0);
        assert!(!arena.is_valid(h));
        assert_eq!(arena.release(h), Err(ArenaError::InvalidHandle(h)));
        assert_eq!(arena.live_buffers(), 0);
        assert_eq!(arena.bytes_in_use(), 0);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let arena = Arena::new();
        let first = arena.allocate_raw(4, 4).unwrap();
        arena.release(first).unwrap();

        let second = arena.allocate_raw(4, 4).unwrap();
        assert_eq!(first.index(), second.index(), "slot should be recycled");
        assert_ne!(first.generation(), second.generation());
        assert!(arena.read(first, |_: &[f32]| ()).is_err());
        assert!(arena.read(second, |_: &[f32]| ()).is_ok());
        arena.release(second).unwrap();
    }

    #[test]
    fn test_guard_clone_and_drop() {
        let arena = Arena::new();
        let buf = arena.allocate(10, 2).unwrap();
        let h = buf.handle();
        let copy = buf.clone();
        assert_eq!(arena.refcount(h), Some(2));
        drop(buf);
        assert_eq!(arena.refcount(h), Some(1));
        drop(copy);
        assert_eq!(arena.refcount(h), None);
    }

    #[test]
    fn test_exhaustion_leaves_counts_consistent() {
        let arena = Arena::with_limit(100);
        let a = arena.allocate(10, 8).unwrap();
        let err = arena.allocate(10, 8).unwrap_err();
        assert!(matches!(err, ArenaError::Exhausted { requested: 80, in_use: 80, limit: 100 }));
        assert_eq!(arena.live_buffers(), 1);
        assert_eq!(a.refcount(), 1);
        drop(a);
        assert!(arena.allocate(10, 8).is_ok());
    }

    #[test]
    fn test_typed_views_share_bytes() {
        let arena = Arena::new();
        let buf = arena.allocate_complex(2).unwrap();
        assert_eq!(buf.extent_bytes(), 32);
        buf.write(|c: &mut [Complex64]| c[1] = Complex64::new(3.0, -4.0))
            .unwrap();
        let doubles: Vec<f64> = buf.to_vec().unwrap();
        assert_eq!(doubles, vec![0.0, 0.0, 3.0, -4.0]);
        assert_eq!(buf.len_of::<u8>(), 32);
        assert_eq!(buf.len_of::<i16>(), 16);
    }

    #[test]
    fn test_raw_handle_round_trip() {
        let arena = Arena::new();
        let buf = arena.allocate(1, 1).unwrap();
        let raw = buf.handle().to_raw();
        assert!(raw >= 0);
        assert_eq!(Handle::from_raw(raw), Some(buf.handle()));
        assert_eq!(Handle::from_raw(-1), None);
    }

    #[test]
    fn test_into_raw_and_adopt() {
        let arena = Arena::new();
        let h = arena.allocate(4, 4).unwrap().into_raw();
        assert_eq!(arena.refcount(h), Some(1));
        let adopted = Buffer::adopt(&arena, h).unwrap();
        drop(adopted);
        assert!(!arena.is_valid(h));
        assert!(Buffer::adopt(&arena, h).is_err());
    }

    #[test]
    fn test_concurrent_retain_release() {
        let arena = Arena::new();
        let buf = arena.allocate(64, 8).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let local = buf.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let extra = local.clone();
                        drop(extra);
                    }
                    drop(local);
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(buf.refcount(), 1);
        assert_eq!(arena.live_buffers(), 1);
    }

    #[test]
    fn test_extent_query_during_nested_write() {
        use std::sync::mpsc;
        use std::time::Duration;

        let arena = Arena::new();
        let input = arena.allocate(64, 8).unwrap();
        let output = arena.allocate(64, 8).unwrap();
        let input_handle = input.handle();

        let (done_tx, done_rx) = mpsc::channel();
        let writer_done = done_tx.clone();
        let writer = thread::spawn(move || {
            input
                .write(|_: &mut [u8]| {
                    thread::sleep(Duration::from_millis(200));
                    output.write(|_: &mut [u8]| ()).unwrap();
                })
                .unwrap();
            writer_done.send("writer").unwrap();
        });

        let query_arena = arena.clone();
        let query = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let extent = query_arena.extent_bytes(input_handle).unwrap();
            done_tx.send("query").unwrap();
            extent
        });

        for _ in 0..2 {
            assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
        }
        writer.join().unwrap();
        assert_eq!(query.join().unwrap(), 512);
    }

    #[test]
    fn test_release_while_other_region_locked() {
        use std::sync::mpsc;
        use std::time::Duration;

        let arena = Arena::new();
        let held = arena.allocate(16, 4).unwrap();
        let h = arena.allocate_raw(16, 4).unwrap();

        let (tx, rx) = mpsc::channel();
        let releaser = arena.clone();
        let reader = thread::spawn(move || {
            arena
                .write(h, |_: &mut [f32]| {
                    thread::sleep(Duration::from_millis(200));
                    held.extent_bytes()
                })
                .unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        thread::spawn(move || {
            tx.send(releaser.release(h)).unwrap();
        });

        let remaining = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert_eq!(remaining, Ok(0));
        assert_eq!(reader.join().unwrap(), 64);
    }

    #[test]
    fn test_generation_wraps_within_raw_range() {
        let arena = Arena::new();
        let first = arena.allocate_raw(4, 4).unwrap();
        arena.lock().slots[first.index()].generation = GENERATION_MASK;
        let last = Handle {
            index: first.index,
            generation: GENERATION_MASK,
        };
        assert_eq!(Handle::from_raw(last.to_raw()), Some(last));
        assert_eq!(arena.release(last).unwrap(), 0);

        let next = arena.allocate_raw(4, 4).unwrap();
        assert_eq!(next.index(), first.index());
        assert_eq!(next.generation(), 0);
        assert!(next.to_raw() >= 0);
        assert_eq!(Handle::from_raw(next.to_raw()), Some(next));
        assert!(arena.is_valid(Handle::from_raw(next.to_raw()).unwrap()));
        arena.release(next).unwrap();
    }
}
