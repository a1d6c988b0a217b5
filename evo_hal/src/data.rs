//! Root record of the HAL segment.
//!
//! Published as the arena root by whichever process creates the segment.
//! Holds the registry list head, the id counter, global switches and the
//! epsilon table used by change detection.

use crate::component::CompDesc;
use crate::funct::FunctDesc;
use crate::group::{GroupDesc, MemberDesc};
use crate::instance::InstDesc;
use crate::object::ObjectHeader;
use crate::param::ParamDesc;
use crate::pin::PinDesc;
use crate::signal::SignalDesc;
use crate::thread::{FunctEntry, ThreadDesc};
use evo_common::hal::consts::MAX_EPSILON;
use evo_common::hal::lock::LockLevel;
use evo_shared_memory::{DListLink, combine_version, struct_version_hash};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Layout tag of every structure this crate stores in the arena.
pub(crate) const HAL_LAYOUT_VERSION: u32 = {
    let mut v = 0x4841_4c31; // "HAL1"
    v = combine_version(v, struct_version_hash::<HalData>());
    v = combine_version(v, struct_version_hash::<ObjectHeader>());
    v = combine_version(v, struct_version_hash::<CompDesc>());
    v = combine_version(v, struct_version_hash::<InstDesc>());
    v = combine_version(v, struct_version_hash::<PinDesc>());
    v = combine_version(v, struct_version_hash::<SignalDesc>());
    v = combine_version(v, struct_version_hash::<ParamDesc>());
    v = combine_version(v, struct_version_hash::<FunctDesc>());
    v = combine_version(v, struct_version_hash::<ThreadDesc>());
    v = combine_version(v, struct_version_hash::<FunctEntry>());
    v = combine_version(v, struct_version_hash::<GroupDesc>());
    v = combine_version(v, struct_version_hash::<MemberDesc>());
    v
};

#[repr(C)]
pub(crate) struct HalData {
    /// Head of the name-ordered registry list; must stay the first field.
    pub(crate) objects: DListLink,
    pub(crate) next_id: AtomicU32,
    pub(crate) lock_level: AtomicU32,
    pub(crate) threads_running: AtomicU32,
    pub(crate) hal_lib_id: AtomicU32,
    /// Nanoseconds, 0 until the first thread or configuration fixes it
    pub(crate) base_period: AtomicU64,
    pub(crate) epsilon: [AtomicU64; MAX_EPSILON],
}

impl HalData {
    pub(crate) fn new(epsilon: &[f64; MAX_EPSILON], base_period: u64) -> Self {
        Self {
            objects: DListLink::new(),
            next_id: AtomicU32::new(1),
            lock_level: AtomicU32::new(0),
            threads_running: AtomicU32::new(0),
            hal_lib_id: AtomicU32::new(0),
            base_period: AtomicU64::new(base_period),
            epsilon: epsilon.map(|e| AtomicU64::new(e.to_bits())),
        }
    }

    /// Hand out the next object id. Ids are never reused.
    pub(crate) fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn lock_level(&self) -> LockLevel {
        LockLevel::from_bits_truncate(self.lock_level.load(Ordering::Acquire))
    }

    pub(crate) fn set_lock_level(&self, level: LockLevel) {
        self.lock_level.store(level.bits(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn threads_running(&self) -> bool {
        self.threads_running.load(Ordering::Acquire) != 0
    }

    pub(crate) fn set_threads_running(&self, running: bool) {
        self.threads_running.store(running as u32, Ordering::Release);
    }

    #[inline]
    pub(crate) fn epsilon(&self, index: usize) -> f64 {
        self.epsilon
            .get(index)
            .map(|e| f64::from_bits(e.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    pub(crate) fn set_epsilon(&self, index: usize, value: f64) {
        if let Some(slot) = self.epsilon.get(index) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_common::hal::consts::DEFAULT_EPSILON;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let data = HalData::new(&[DEFAULT_EPSILON; MAX_EPSILON], 0);
        assert_eq!(data.next_id(), 1);
        assert_eq!(data.next_id(), 2);
    }

    #[test]
    fn test_epsilon_table() {
        let data = HalData::new(&[0.5; MAX_EPSILON], 0);
        assert_eq!(data.epsilon(0), 0.5);
        data.set_epsilon(1, 0.01);
        assert_eq!(data.epsilon(1), 0.01);
        assert_eq!(data.epsilon(MAX_EPSILON), 0.0);
    }

    #[test]
    fn test_root_starts_with_list_head() {
        assert_eq!(std::mem::offset_of!(HalData, objects), 0);
        assert_ne!(HAL_LAYOUT_VERSION, 0);
    }
}
