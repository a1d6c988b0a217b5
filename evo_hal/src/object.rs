//! Common header of every registry object.
//!
//! Each descriptor stored in the arena is `#[repr(C)]` and starts with an
//! [`ObjectHeader`], whose first field is the registry list link. That makes
//! the offset of the header, the link and the descriptor the same value.

use bitflags::bitflags;
use evo_common::hal::types::ObjectType;
use evo_shared_memory::{DListLink, ShmOff};
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// Per-object state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// Object is live; cleared by invalidation
        const VALID = 1;
        /// Issue a read barrier before calling this function
        const RMB = 2;
        /// Issue a write barrier after calling this function
        const WMB = 4;
    }
}

/// Header shared by all descriptors.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct ObjectHeader {
    pub(crate) link: DListLink,
    name: AtomicU32,
    // Name before the first alias, null when not aliased
    orig_name: AtomicU32,
    id: u32,
    owner_id: u32,
    kind: u32,
    refcnt: AtomicU32,
    flags: AtomicU32,
    _pad: u32,
}

impl ObjectHeader {
    pub(crate) fn new(kind: ObjectType, id: u32, owner_id: u32, name: ShmOff) -> Self {
        Self {
            link: DListLink::new(),
            name: AtomicU32::new(name),
            orig_name: AtomicU32::new(0),
            id,
            owner_id,
            kind: kind as u32,
            refcnt: AtomicU32::new(0),
            flags: AtomicU32::new(ObjectFlags::VALID.bits()),
            _pad: 0,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub(crate) fn owner_id(&self) -> u32 {
        self.owner_id
    }

    #[inline]
    pub(crate) fn kind(&self) -> Option<ObjectType> {
        ObjectType::from_u32(self.kind)
    }

    #[inline]
    pub(crate) fn name_off(&self) -> ShmOff {
        self.name.load(Ordering::Acquire)
    }

    pub(crate) fn set_name_off(&self, off: ShmOff) {
        self.name.store(off, Ordering::Release);
    }

    pub(crate) fn orig_name_off(&self) -> ShmOff {
        self.orig_name.load(Ordering::Acquire)
    }

    pub(crate) fn set_orig_name_off(&self, off: ShmOff) {
        self.orig_name.store(off, Ordering::Release);
    }

    #[inline]
    pub(crate) fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    pub(crate) fn incref(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement, saturating at zero. Returns the new count.
    pub(crate) fn decref(&self) -> u32 {
        match self
            .refcnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => 0,
        }
    }

    #[inline]
    pub(crate) fn flags(&self) -> ObjectFlags {
        ObjectFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ObjectFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.flags().contains(ObjectFlags::VALID)
    }
}

/// A descriptor type stored in the registry.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with an [`ObjectHeader`] as first
/// field, and hold only plain integers or atomics.
pub(crate) unsafe trait Descriptor: Sized {
    const KIND: ObjectType;

    fn header(&self) -> &ObjectHeader;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_is_valid_and_unreferenced() {
        let h = ObjectHeader::new(ObjectType::Signal, 7, 0, 128);
        assert!(h.is_valid());
        assert_eq!(h.kind(), Some(ObjectType::Signal));
        assert_eq!(h.refcnt(), 0);
        assert_eq!(h.name_off(), 128);
    }

    #[test]
    fn test_decref_saturates() {
        let h = ObjectHeader::new(ObjectType::Group, 1, 0, 64);
        assert_eq!(h.incref(), 1);
        assert_eq!(h.decref(), 0);
        assert_eq!(h.decref(), 0);
        assert_eq!(h.refcnt(), 0);
    }

    #[test]
    fn test_flags() {
        let h = ObjectHeader::new(ObjectType::Funct, 1, 0, 64);
        h.set_flags(ObjectFlags::RMB | ObjectFlags::WMB);
        h.clear_flags(ObjectFlags::VALID);
        assert!(!h.is_valid());
        assert!(h.flags().contains(ObjectFlags::RMB));
    }
}
