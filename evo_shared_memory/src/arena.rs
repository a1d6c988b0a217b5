//! The HAL arena: one shared segment, two allocation regions.
//!
//! ```text
//!  0        64                    brk            top                 size
//!  ┌────────┬─────────────────────┬───────────────┬───────────────────┐
//!  │ header │ heap (grows up)     │      gap      │ realtime (grows   │
//!  │        │ descriptors,strings │               │ down) pin/signal/ │
//!  │        │ alloc + free        │               │ param storage     │
//!  └────────┴─────────────────────┴───────────────┴───────────────────┘
//! ```
//!
//! Every reference stored inside the segment is a [`ShmOff`], a byte offset
//! from the segment base. Offset 0 is the header and doubles as null.
//!
//! The realtime region is never freed piecemeal: storage handed out from it
//! stays valid for the lifetime of the segment, so realtime code holding an
//! offset can never observe reclaimed memory. The heap supports free and
//! borrows from the gap when it runs out.
//!
//! All allocator entry points take an [`ArenaGuard`], the RAII guard of the
//! segment-wide mutex.

use crate::error::{ShmError, ShmResult};
use crate::mutex::{ShmMutex, ShmMutexGuard};
use crate::platform::get_current_pid;
use crate::segment::Segment;
use evo::shm::consts::EVO_HAL_MAGIC;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

/// Offset from the segment base.
pub type ShmOff = u32;

/// The null offset.
pub const SHM_NULL: ShmOff = 0;

/// Guard proving the arena mutex is held.
pub type ArenaGuard<'a> = ShmMutexGuard<'a>;

const STATE_READY: u32 = 1;

/// Attach waits this long for a creator to finish initialization.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);

/// Arena header at offset 0: 64 bytes, cache-line aligned.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ArenaHeader {
    /// Magic bytes: `EVO_HAL_MAGIC`.
    pub magic: [u8; 8],
    /// Layout tag supplied by the creator; attachers must match it.
    pub layout_version: u32,
    /// Segment size in bytes.
    pub size: u32,
    /// Set to ready once the creator finished initialization.
    pub state: AtomicU32,
    /// Number of attached arena handles.
    pub attached: AtomicU32,
    /// The HAL mutex.
    pub mutex: ShmMutex,
    /// First heap offset.
    pub heap_start: u32,
    /// End of the heap region.
    pub heap_brk: AtomicU32,
    /// First free heap block, address ordered.
    pub free_head: AtomicU32,
    /// Lowest offset used by the realtime region.
    pub rt_top: AtomicU32,
    /// Bytes of heap in allocated blocks, headers included.
    pub heap_used: AtomicU32,
    /// Offset of the user root record.
    pub root: AtomicU32,
    /// Pid of the creating process.
    pub creator_pid: u32,
    _reserved: u32,
}

const_assert_eq!(core::mem::size_of::<ArenaHeader>(), 64);
const_assert_eq!(core::mem::align_of::<ArenaHeader>(), 64);

/// Allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Segment size
    pub size: usize,
    /// Bytes claimed by the heap
    pub heap_size: usize,
    /// Heap bytes in allocated blocks
    pub heap_used: usize,
    /// Heap bytes on the free list
    pub heap_free: usize,
    /// Bytes handed out by the realtime allocator
    pub rt_used: usize,
    /// Unclaimed bytes between heap and realtime region
    pub gap: usize,
}

/// A mapped, initialized arena.
pub struct Arena {
    seg: Segment,
    // Sinks for out-of-range value accesses, so a corrupt offset never
    // dereferences outside the mapping.
    scratch64: AtomicU64,
    scratch32: AtomicU32,
    // Whether this handle is counted in `attached`.
    counted: bool,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.seg.name())
            .field("size", &self.seg.len())
            .finish()
    }
}

impl Arena {
    /// Map and initialize a private anonymous arena.
    pub fn anonymous(size: usize, layout_version: u32) -> ShmResult<Self> {
        let mut arena = Self::wrap(Segment::anonymous(size)?);
        arena.initialize(layout_version);
        Ok(arena)
    }

    /// Create and initialize a named arena.
    pub fn create(name: &str, size: usize, layout_version: u32) -> ShmResult<Self> {
        let mut arena = Self::wrap(Segment::create(name, size)?);
        arena.initialize(layout_version);
        info!("Created HAL arena '{}' ({} bytes)", name, size);
        Ok(arena)
    }

    /// Attach to an initialized named arena.
    pub fn attach(name: &str, layout_version: u32) -> ShmResult<Self> {
        let mut arena = Self::wrap(Segment::attach(name)?);
        arena.wait_ready(name)?;
        let header = arena.header();
        if header.magic != EVO_HAL_MAGIC {
            return Err(ShmError::NotInitialized {
                name: name.to_string(),
            });
        }
        if header.layout_version != layout_version {
            error!(
                "Arena '{}' layout {:#010x} does not match {:#010x}",
                name, header.layout_version, layout_version
            );
            return Err(ShmError::VersionMismatch {
                expected: layout_version,
                found: header.layout_version,
            });
        }
        if header.size as usize != arena.seg.len() {
            return Err(ShmError::InvalidSize {
                size: header.size as usize,
            });
        }
        let count = header.attached.fetch_add(1, Ordering::AcqRel) + 1;
        arena.counted = true;
        info!("Attached HAL arena '{}' ({} handles)", name, count);
        Ok(arena)
    }

    /// Attach to `name`, creating it if it does not exist.
    ///
    /// Returns the arena and whether this call created it.
    pub fn open(name: &str, size: usize, layout_version: u32) -> ShmResult<(Self, bool)> {
        match Self::create(name, size, layout_version) {
            Ok(arena) => Ok((arena, true)),
            Err(ShmError::AlreadyExists { .. }) => Ok((Self::attach(name, layout_version)?, false)),
            Err(e) => Err(e),
        }
    }

    fn wrap(seg: Segment) -> Self {
        Self {
            seg,
            scratch64: AtomicU64::new(0),
            scratch32: AtomicU32::new(0),
            counted: false,
        }
    }

    fn initialize(&mut self, layout_version: u32) {
        let size = self.seg.len() as u32;
        let heap_start = core::mem::size_of::<ArenaHeader>() as u32;
        let header = ArenaHeader {
            magic: EVO_HAL_MAGIC,
            layout_version,
            size,
            state: AtomicU32::new(0),
            attached: AtomicU32::new(1),
            mutex: ShmMutex::new(),
            heap_start,
            heap_brk: AtomicU32::new(heap_start),
            free_head: AtomicU32::new(SHM_NULL),
            rt_top: AtomicU32::new(size),
            heap_used: AtomicU32::new(0),
            root: AtomicU32::new(SHM_NULL),
            creator_pid: get_current_pid(),
            _reserved: 0,
        };
        // Nobody else can see the segment until state turns ready
        unsafe { (self.seg.base() as *mut ArenaHeader).write(header) };
        self.header().state.store(STATE_READY, Ordering::Release);
        self.counted = true;
        debug!("Arena initialized: {} bytes, layout {:#010x}", size, layout_version);
    }

    fn wait_ready(&self, name: &str) -> ShmResult<()> {
        let deadline = std::time::Instant::now() + ATTACH_TIMEOUT;
        while self.header().state.load(Ordering::Acquire) != STATE_READY {
            if std::time::Instant::now() >= deadline {
                return Err(ShmError::NotInitialized {
                    name: name.to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Arena header.
    #[inline]
    pub fn header(&self) -> &ArenaHeader {
        unsafe { &*(self.seg.base() as *const ArenaHeader) }
    }

    /// Segment name, `None` for anonymous arenas.
    pub fn name(&self) -> Option<&str> {
        self.seg.name()
    }

    /// Segment size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.seg.len()
    }

    /// Acquire the HAL mutex.
    pub fn lock(&self) -> ArenaGuard<'_> {
        self.header().mutex.lock()
    }

    /// Acquire the HAL mutex if free.
    pub fn try_lock(&self) -> Option<ArenaGuard<'_>> {
        self.header().mutex.try_lock()
    }

    // ─── Offset translation ─────────────────────────────────────────

    /// True if `[off, off + len)` lies inside the segment and `off` is not null.
    #[inline]
    pub fn contains(&self, off: ShmOff, len: usize) -> bool {
        off != SHM_NULL
            && (off as usize)
                .checked_add(len)
                .is_some_and(|end| end <= self.seg.len())
    }

    /// Local pointer for `off`. Does not check bounds.
    #[inline]
    pub fn ptr<T>(&self, off: ShmOff) -> *mut T {
        self.seg.base().wrapping_add(off as usize) as *mut T
    }

    /// Offset of a local pointer, if it points into the segment.
    pub fn off_of<T>(&self, p: *const T) -> Option<ShmOff> {
        let base = self.seg.base() as usize;
        let addr = p as usize;
        (addr > base && addr < base + self.seg.len()).then(|| (addr - base) as ShmOff)
    }

    /// Reference to the `T` stored at `off`.
    ///
    /// # Safety
    ///
    /// A properly aligned, initialized `T` must live at `off`, and any
    /// field mutated concurrently must be atomic.
    #[inline]
    pub unsafe fn get<T>(&self, off: ShmOff) -> &T {
        debug_assert!(self.contains(off, core::mem::size_of::<T>()));
        debug_assert_eq!(off as usize % core::mem::align_of::<T>(), 0);
        unsafe { &*self.ptr::<T>(off) }
    }

    /// 8-byte value word at `off`.
    ///
    /// Out-of-range or misaligned offsets resolve to a process-local scratch
    /// word instead of faulting.
    #[inline]
    pub fn value(&self, off: ShmOff) -> &AtomicU64 {
        if self.contains(off, 8) && off % 8 == 0 {
            unsafe { &*self.ptr::<AtomicU64>(off) }
        } else {
            &self.scratch64
        }
    }

    /// 4-byte slot word at `off`, with the same fallback as [`Arena::value`].
    #[inline]
    pub fn slot(&self, off: ShmOff) -> &AtomicU32 {
        if self.contains(off, 4) && off % 4 == 0 {
            unsafe { &*self.ptr::<AtomicU32>(off) }
        } else {
            &self.scratch32
        }
    }

    // ─── Realtime region ────────────────────────────────────────────

    /// Allocate `size` bytes from the top of the segment.
    ///
    /// `align` must be 1, 2, 4 or 8. The memory is zeroed and is never
    /// returned to the arena.
    pub fn alloc_rt(&self, g: &ArenaGuard<'_>, size: usize, align: usize) -> ShmResult<ShmOff> {
        debug_assert!(g.guards(&self.header().mutex));
        let align = match align {
            1 | 2 | 4 | 8 => align as u32,
            _ => 8,
        };
        let header = self.header();
        let top = header.rt_top.load(Ordering::Relaxed);
        let brk = header.heap_brk.load(Ordering::Relaxed);
        let available = top.saturating_sub(brk) as usize;
        let size32 = u32::try_from(size).map_err(|_| ShmError::OutOfMemory {
            requested: size,
            available,
        })?;
        let new_top = match top.checked_sub(size32) {
            Some(t) => t & !(align - 1),
            None => 0,
        };
        if size == 0 || new_top < brk {
            return Err(ShmError::OutOfMemory {
                requested: size,
                available,
            });
        }
        unsafe { std::ptr::write_bytes(self.ptr::<u8>(new_top), 0, size) };
        header.rt_top.store(new_top, Ordering::Relaxed);
        Ok(new_top)
    }

    /// Allocate one zeroed 8-byte value word from the realtime region.
    pub fn alloc_value(&self, g: &ArenaGuard<'_>) -> ShmResult<ShmOff> {
        self.alloc_rt(g, 8, 8)
    }

    /// Allocate one zeroed 4-byte slot word from the realtime region.
    pub fn alloc_slot(&self, g: &ArenaGuard<'_>) -> ShmResult<ShmOff> {
        self.alloc_rt(g, 4, 4)
    }

    // ─── Strings ────────────────────────────────────────────────────

    /// Copy `s` into the heap. Layout: `u32` length, then the bytes.
    pub fn alloc_str(&self, g: &ArenaGuard<'_>, s: &str) -> ShmResult<ShmOff> {
        let off = self.heap_alloc(g, 4 + s.len())?;
        unsafe {
            (self.ptr::<u32>(off)).write(s.len() as u32);
            std::ptr::copy_nonoverlapping(s.as_ptr(), self.ptr::<u8>(off + 4), s.len());
        }
        Ok(off)
    }

    /// String stored at `off` by [`Arena::alloc_str`]; empty if invalid.
    pub fn str_at(&self, off: ShmOff) -> &str {
        if !self.contains(off, 4) || off % 4 != 0 {
            return "";
        }
        let len = unsafe { self.ptr::<u32>(off).read() } as usize;
        if !self.contains(off + 4, len) {
            return "";
        }
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr::<u8>(off + 4), len) };
        std::str::from_utf8(bytes).unwrap_or("")
    }

    // ─── Root & statistics ──────────────────────────────────────────

    /// Offset of the root record, null until set.
    pub fn root(&self) -> ShmOff {
        self.header().root.load(Ordering::Acquire)
    }

    /// Publish the root record.
    pub fn set_root(&self, _g: &ArenaGuard<'_>, off: ShmOff) {
        self.header().root.store(off, Ordering::Release);
    }

    /// Number of attached handles.
    pub fn attached(&self) -> u32 {
        self.header().attached.load(Ordering::Acquire)
    }

    /// Allocation statistics.
    pub fn stats(&self, _g: &ArenaGuard<'_>) -> ArenaStats {
        let header = self.header();
        let brk = header.heap_brk.load(Ordering::Relaxed) as usize;
        let top = header.rt_top.load(Ordering::Relaxed) as usize;
        ArenaStats {
            size: self.size(),
            heap_size: brk - header.heap_start as usize,
            heap_used: header.heap_used.load(Ordering::Relaxed) as usize,
            heap_free: self.heap_free_bytes(),
            rt_used: self.size() - top,
            gap: top - brk,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        let remaining = self.header().attached.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            if let Some(name) = self.seg.name() {
                info!("Last handle of HAL arena '{}' detached, removing it", name);
            }
            if let Err(e) = self.seg.unlink() {
                error!("Failed to remove arena segment: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo::shm::consts::SHM_MIN_SIZE;

    #[test]
    fn test_header_layout() {
        assert_eq!(core::mem::size_of::<ArenaHeader>(), 64);
    }

    #[test]
    fn test_initial_state() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 7).unwrap();
        let h = arena.header();
        assert_eq!(h.magic, EVO_HAL_MAGIC);
        assert_eq!(h.layout_version, 7);
        assert_eq!(h.attached.load(Ordering::Relaxed), 1);
        let g = arena.lock();
        let stats = arena.stats(&g);
        assert_eq!(stats.rt_used, 0);
        assert_eq!(stats.heap_size, 0);
        assert_eq!(stats.gap, SHM_MIN_SIZE - 64);
    }

    #[test]
    fn test_rt_alloc_is_top_down_and_aligned() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 1).unwrap();
        let g = arena.lock();
        let a = arena.alloc_rt(&g, 1, 1).unwrap();
        let b = arena.alloc_rt(&g, 8, 8).unwrap();
        let c = arena.alloc_rt(&g, 2, 2).unwrap();
        assert_eq!(a as usize, SHM_MIN_SIZE - 1);
        assert!(b < a && b % 8 == 0);
        assert!(c < b && c % 2 == 0);
    }

    #[test]
    fn test_rt_alloc_out_of_memory() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 1).unwrap();
        let g = arena.lock();
        let err = arena.alloc_rt(&g, SHM_MIN_SIZE, 8).unwrap_err();
        assert!(matches!(err, ShmError::OutOfMemory { .. }));
        // Nothing was consumed by the failed request
        assert_eq!(arena.stats(&g).rt_used, 0);
    }

    #[test]
    fn test_strings() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 1).unwrap();
        let g = arena.lock();
        let off = arena.alloc_str(&g, "motion.spindle-speed").unwrap();
        assert_eq!(arena.str_at(off), "motion.spindle-speed");
        assert_eq!(arena.str_at(SHM_NULL), "");
    }

    #[test]
    fn test_value_words() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 1).unwrap();
        let g = arena.lock();
        let v = arena.alloc_value(&g).unwrap();
        arena.value(v).store(42, Ordering::Relaxed);
        assert_eq!(arena.value(v).load(Ordering::Relaxed), 42);
        // Bad offsets hit the scratch word, not the segment
        arena.value(u32::MAX - 3).store(9, Ordering::Relaxed);
        assert_eq!(arena.value(v).load(Ordering::Relaxed), 42);
    }

    #[test]
    fn test_offset_translation() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 1).unwrap();
        let p = arena.ptr::<u8>(128);
        assert_eq!(arena.off_of(p), Some(128));
        assert_eq!(arena.off_of(std::ptr::null::<u8>()), None);
        assert!(arena.contains(128, 8));
        assert!(!arena.contains(SHM_MIN_SIZE as u32 - 4, 8));
    }
}
