//! General-purpose heap at the bottom of the arena.
//!
//! First-fit allocator over an address-ordered free list. Every block
//! carries an 8-byte header; allocated blocks are tagged so double frees
//! and stray offsets are rejected instead of corrupting the list. Adjacent
//! free blocks are merged on free.
//!
//! When no free block fits, the heap claims another chunk from the gap
//! below the realtime region. Allocation never returns a partial block.

use crate::arena::{Arena, ArenaGuard, SHM_NULL, ShmOff};
use crate::error::{ShmError, ShmResult};
use evo::shm::consts::HEAP_GROW_CHUNK;
use std::sync::atomic::Ordering;
use tracing::trace;

/// Header of every heap block.
#[repr(C)]
struct BlockHeader {
    /// Block size including this header, multiple of 8.
    size: u32,
    /// `ALLOC_TAG` while allocated, next free block while free.
    tag: u32,
}

const BLOCK_HEADER: u32 = core::mem::size_of::<BlockHeader>() as u32;
const ALLOC_TAG: u32 = 0xA110_C8ED;
const MIN_BLOCK: u32 = 16;

#[inline]
const fn round8(n: u32) -> u32 {
    (n + 7) & !7
}

impl Arena {
    #[inline]
    fn block(&self, off: ShmOff) -> &mut BlockHeader {
        // Heap blocks are only touched under the arena mutex
        unsafe { &mut *self.ptr::<BlockHeader>(off) }
    }

    /// Allocate `size` zeroed bytes from the heap, 8-byte aligned.
    pub fn heap_alloc(&self, g: &ArenaGuard<'_>, size: usize) -> ShmResult<ShmOff> {
        debug_assert!(g.guards(&self.header().mutex));
        let need = u32::try_from(size)
            .ok()
            .and_then(|s| s.checked_add(BLOCK_HEADER + 7))
            .map(|s| round8(s - 7).max(MIN_BLOCK))
            .ok_or(ShmError::OutOfMemory {
                requested: size,
                available: 0,
            })?;

        if let Some(off) = self.take_free(need) {
            return Ok(off);
        }
        self.grow(need)?;
        self.take_free(need).ok_or(ShmError::OutOfMemory {
            requested: size,
            available: 0,
        })
    }

    /// Return a block obtained from [`Arena::heap_alloc`] or
    /// [`Arena::alloc_str`].
    pub fn heap_free(&self, g: &ArenaGuard<'_>, off: ShmOff) -> ShmResult<()> {
        debug_assert!(g.guards(&self.header().mutex));
        let header = self.header();
        let start = header.heap_start + BLOCK_HEADER;
        let brk = header.heap_brk.load(Ordering::Relaxed);
        if off < start || off >= brk || off % 8 != 0 {
            return Err(ShmError::InvalidOffset { offset: off });
        }
        let blk_off = off - BLOCK_HEADER;
        let blk = self.block(blk_off);
        if blk.tag != ALLOC_TAG {
            return Err(ShmError::InvalidOffset { offset: off });
        }
        header.heap_used.fetch_sub(blk.size, Ordering::Relaxed);
        trace!("heap free {:#x} ({} bytes)", off, blk.size);
        self.insert_free(blk_off);
        Ok(())
    }

    fn take_free(&self, need: u32) -> Option<ShmOff> {
        let header = self.header();
        let mut prev = SHM_NULL;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        while cur != SHM_NULL {
            let blk = self.block(cur);
            let next = blk.tag;
            if blk.size >= need {
                let replacement = if blk.size - need >= MIN_BLOCK {
                    let rest = cur + need;
                    let rest_blk = self.block(rest);
                    rest_blk.size = blk.size - need;
                    rest_blk.tag = next;
                    blk.size = need;
                    rest
                } else {
                    next
                };
                if prev == SHM_NULL {
                    header.free_head.store(replacement, Ordering::Relaxed);
                } else {
                    self.block(prev).tag = replacement;
                }
                blk.tag = ALLOC_TAG;
                header.heap_used.fetch_add(blk.size, Ordering::Relaxed);
                let payload = cur + BLOCK_HEADER;
                unsafe {
                    std::ptr::write_bytes(
                        self.ptr::<u8>(payload),
                        0,
                        (blk.size - BLOCK_HEADER) as usize,
                    )
                };
                trace!("heap alloc {:#x} ({} bytes)", payload, blk.size);
                return Some(payload);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Claim a chunk of at least `need` bytes from the gap.
    fn grow(&self, need: u32) -> ShmResult<()> {
        let header = self.header();
        let brk = header.heap_brk.load(Ordering::Relaxed);
        let top = header.rt_top.load(Ordering::Relaxed);
        let gap = top.saturating_sub(brk);
        let chunk = need.max(HEAP_GROW_CHUNK as u32).min(gap);
        if chunk < need {
            return Err(ShmError::OutOfMemory {
                requested: need as usize,
                available: gap as usize,
            });
        }
        let chunk = chunk & !7;
        let blk = self.block(brk);
        blk.size = chunk;
        blk.tag = SHM_NULL;
        header.heap_brk.store(brk + chunk, Ordering::Relaxed);
        trace!("heap grew by {} bytes to {:#x}", chunk, brk + chunk);
        self.insert_free(brk);
        Ok(())
    }

    fn insert_free(&self, off: ShmOff) {
        let header = self.header();
        let mut prev = SHM_NULL;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        while cur != SHM_NULL && cur < off {
            prev = cur;
            cur = self.block(cur).tag;
        }

        let blk = self.block(off);
        blk.tag = cur;
        if cur != SHM_NULL && off + blk.size == cur {
            let next = self.block(cur);
            blk.size += next.size;
            blk.tag = next.tag;
        }

        if prev == SHM_NULL {
            header.free_head.store(off, Ordering::Relaxed);
        } else {
            let p = self.block(prev);
            if prev + p.size == off {
                p.size += blk.size;
                p.tag = blk.tag;
            } else {
                p.tag = off;
            }
        }
    }

    pub(crate) fn heap_free_bytes(&self) -> usize {
        let mut total = 0usize;
        let mut cur = self.header().free_head.load(Ordering::Relaxed);
        while cur != SHM_NULL {
            let blk = self.block(cur);
            total += blk.size as usize;
            cur = blk.tag;
        }
        total
    }
}
