//! Position-independent intrusive doubly linked list.
//!
//! Links store segment offsets, never pointers, so a list built by one
//! process is walkable by every other process mapping the same segment.
//! Lists are circular with a sentinel head; an empty head points at itself.
//! A [`DListLink`] must be the first field of any structure threaded onto
//! a list, so the offset of the link is the offset of the structure.
//!
//! Mutation requires the arena lock; the guard parameter enforces that.

use crate::arena::{Arena, ArenaGuard, ShmOff};
use std::sync::atomic::{AtomicU32, Ordering};

/// Link embedded at the start of every listed structure.
#[repr(C)]
#[derive(Debug, Default)]
pub struct DListLink {
    next: AtomicU32,
    prev: AtomicU32,
}

impl DListLink {
    /// An unlinked link. Call [`dlist_init`] before use as a head.
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            prev: AtomicU32::new(0),
        }
    }

    /// Offset of the next element.
    #[inline]
    pub fn next(&self) -> ShmOff {
        self.next.load(Ordering::Acquire)
    }

    /// Offset of the previous element.
    #[inline]
    pub fn prev(&self) -> ShmOff {
        self.prev.load(Ordering::Acquire)
    }
}

#[inline]
fn link(arena: &Arena, off: ShmOff) -> &DListLink {
    // Every listed structure starts with a DListLink
    unsafe { arena.get::<DListLink>(off) }
}

/// Make `head` an empty list (or detach a lone element).
pub fn dlist_init(arena: &Arena, _g: &ArenaGuard<'_>, head: ShmOff) {
    let l = link(arena, head);
    l.next.store(head, Ordering::Release);
    l.prev.store(head, Ordering::Release);
}

/// True if `head` has no elements.
pub fn dlist_is_empty(arena: &Arena, head: ShmOff) -> bool {
    link(arena, head).next() == head
}

/// Insert `new` directly after `at`.
pub fn dlist_insert_after(arena: &Arena, _g: &ArenaGuard<'_>, at: ShmOff, new: ShmOff) {
    let at_l = link(arena, at);
    let next = at_l.next();
    let new_l = link(arena, new);
    new_l.next.store(next, Ordering::Relaxed);
    new_l.prev.store(at, Ordering::Relaxed);
    link(arena, next).prev.store(new, Ordering::Release);
    at_l.next.store(new, Ordering::Release);
}

/// Insert `new` directly before `at`. With `at` a head, appends.
pub fn dlist_insert_before(arena: &Arena, g: &ArenaGuard<'_>, at: ShmOff, new: ShmOff) {
    let prev = link(arena, at).prev();
    dlist_insert_after(arena, g, prev, new);
}

/// Unlink `off` from whatever list it is on and leave it self-linked.
pub fn dlist_remove(arena: &Arena, g: &ArenaGuard<'_>, off: ShmOff) {
    let l = link(arena, off);
    let (next, prev) = (l.next(), l.prev());
    if next != 0 && prev != 0 {
        link(arena, prev).next.store(next, Ordering::Release);
        link(arena, next).prev.store(prev, Ordering::Release);
    }
    dlist_init(arena, g, off);
}

/// Iterate element offsets of the list at `head`, front to back.
///
/// The iterator steps past an element before yielding it, so removing the
/// yielded element is safe.
pub fn dlist_iter(arena: &Arena, head: ShmOff) -> DListIter<'_> {
    DListIter {
        arena,
        head,
        cur: link(arena, head).next(),
    }
}

/// Number of elements on the list at `head`.
pub fn dlist_len(arena: &Arena, head: ShmOff) -> usize {
    dlist_iter(arena, head).count()
}

/// Iterator returned by [`dlist_iter`].
pub struct DListIter<'a> {
    arena: &'a Arena,
    head: ShmOff,
    cur: ShmOff,
}

impl Iterator for DListIter<'_> {
    type Item = ShmOff;

    fn next(&mut self) -> Option<ShmOff> {
        if self.cur == self.head || self.cur == 0 {
            return None;
        }
        let item = self.cur;
        self.cur = link(self.arena, item).next();
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo::shm::consts::SHM_MIN_SIZE;

    fn node(arena: &Arena, g: &ArenaGuard<'_>) -> ShmOff {
        let off = arena.heap_alloc(g, 16).unwrap();
        dlist_init(arena, g, off);
        off
    }

    #[test]
    fn test_insert_and_iterate() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 1).unwrap();
        let g = arena.lock();
        let head = node(&arena, &g);
        assert!(dlist_is_empty(&arena, head));

        let a = node(&arena, &g);
        let b = node(&arena, &g);
        let c = node(&arena, &g);
        dlist_insert_before(&arena, &g, head, a); // append
        dlist_insert_before(&arena, &g, head, c); // append
        dlist_insert_after(&arena, &g, a, b);

        let order: Vec<_> = dlist_iter(&arena, head).collect();
        assert_eq!(order, vec![a, b, c]);
        assert_eq!(dlist_len(&arena, head), 3);
    }

    #[test]
    fn test_remove_while_iterating() {
        let arena = Arena::anonymous(SHM_MIN_SIZE, 1).unwrap();
        let g = arena.lock();
        let head = node(&arena, &g);
        let items: Vec<_> = (0..4).map(|_| node(&arena, &g)).collect();
        for &i in &items {
            dlist_insert_before(&arena, &g, head, i);
        }

        for off in dlist_iter(&arena, head) {
            dlist_remove(&arena, &g, off);
        }
        assert!(dlist_is_empty(&arena, head));
        // Removed elements are self-linked
        assert_eq!(link(&arena, items[0]).next(), items[0]);
    }
}
