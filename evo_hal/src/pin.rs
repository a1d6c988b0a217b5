//! Pins: typed, directional connection points owned by components.
//!
//! A pin does not hold its value. The owner allocates a 4-byte *slot*
//! word in the arena and reads and writes the pin through it; the slot
//! holds the offset of the current value word:
//!
//! ```text
//!   unlinked:  slot ──► dummy value word (private to the pin)
//!   linked:    slot ──► signal value word (shared by every linked pin)
//! ```
//!
//! Linking and unlinking only retarget the slot, so owner code never needs
//! to know whether the pin is connected.

use crate::context::Hal;
use crate::error::recording;
use crate::object::{Descriptor, ObjectHeader};
use crate::registry::Selector;
use evo_common::hal::consts::MAX_EPSILON;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{HalType, HalValue, ObjectType, PinDir};
use evo_shared_memory::{Arena, ArenaGuard, SHM_NULL, ShmOff};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

#[repr(C)]
pub(crate) struct PinDesc {
    pub(crate) hdr: ObjectHeader,
    ty: u32,
    dir: u32,
    slot: ShmOff,
    dummy: ShmOff,
    signal: AtomicU32,
    eps_index: AtomicU32,
}

unsafe impl Descriptor for PinDesc {
    const KIND: ObjectType = ObjectType::Pin;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl PinDesc {
    pub(crate) fn ty(&self) -> HalType {
        HalType::from_u32(self.ty).unwrap_or(HalType::Bit)
    }

    pub(crate) fn dir(&self) -> PinDir {
        PinDir::from_u32(self.dir).unwrap_or(PinDir::In)
    }

    pub(crate) fn slot(&self) -> ShmOff {
        self.slot
    }

    pub(crate) fn dummy(&self) -> ShmOff {
        self.dummy
    }

    /// Offset of the linked signal, null when unlinked.
    pub(crate) fn signal(&self) -> ShmOff {
        self.signal.load(Ordering::Acquire)
    }

    pub(crate) fn set_signal(&self, sig: ShmOff) {
        self.signal.store(sig, Ordering::Release);
    }

    pub(crate) fn eps_index(&self) -> usize {
        self.eps_index.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn ptr(&self) -> PinPtr {
        PinPtr {
            slot: self.slot,
            ty: self.ty(),
        }
    }
}

/// Owner-side handle of a pin: the slot word plus the pin's type.
///
/// All accessors are lock-free and safe to call from realtime code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinPtr {
    slot: ShmOff,
    ty: HalType,
}

impl PinPtr {
    pub(crate) fn from_slot(slot: ShmOff, ty: HalType) -> Self {
        Self { slot, ty }
    }

    /// Offset of the slot word.
    pub fn slot(&self) -> ShmOff {
        self.slot
    }

    /// Pin type.
    pub fn ty(&self) -> HalType {
        self.ty
    }

    #[inline]
    fn word<'a>(&self, arena: &'a Arena) -> &'a AtomicU64 {
        arena.value(arena.slot(self.slot).load(Ordering::Acquire))
    }

    /// Current value.
    #[inline]
    pub fn get(&self, arena: &Arena) -> HalValue {
        HalValue::from_bits(self.ty, self.word(arena).load(Ordering::Relaxed))
    }

    /// Store `value`. A value of another type is ignored.
    #[inline]
    pub fn set(&self, arena: &Arena, value: HalValue) {
        debug_assert_eq!(value.ty(), self.ty);
        if value.ty() == self.ty {
            self.word(arena).store(value.to_bits(), Ordering::Relaxed);
        }
    }

    /// Value as bool (nonzero is true).
    #[inline]
    pub fn get_bit(&self, arena: &Arena) -> bool {
        self.word(arena).load(Ordering::Relaxed) & 1 != 0
    }

    /// Store a bit.
    #[inline]
    pub fn set_bit(&self, arena: &Arena, v: bool) {
        self.set(arena, HalValue::Bit(v));
    }

    /// Value as float.
    #[inline]
    pub fn get_float(&self, arena: &Arena) -> f64 {
        self.get(arena).as_f64()
    }

    /// Store a float.
    #[inline]
    pub fn set_float(&self, arena: &Arena, v: f64) {
        self.set(arena, HalValue::Float(v));
    }

    /// Value as s32.
    #[inline]
    pub fn get_s32(&self, arena: &Arena) -> i32 {
        self.word(arena).load(Ordering::Relaxed) as u32 as i32
    }

    /// Store an s32.
    #[inline]
    pub fn set_s32(&self, arena: &Arena, v: i32) {
        self.set(arena, HalValue::S32(v));
    }

    /// Value as u32.
    #[inline]
    pub fn get_u32(&self, arena: &Arena) -> u32 {
        self.word(arena).load(Ordering::Relaxed) as u32
    }

    /// Store a u32.
    #[inline]
    pub fn set_u32(&self, arena: &Arena, v: u32) {
        self.set(arena, HalValue::U32(v));
    }
}

/// Snapshot of a pin.
#[derive(Debug, Clone, PartialEq)]
pub struct PinInfo {
    /// Pin id
    pub id: u32,
    /// Current name
    pub name: String,
    /// Owning component or instance id
    pub owner_id: u32,
    /// Pin type
    pub ty: HalType,
    /// Pin direction
    pub dir: PinDir,
    /// Current value
    pub value: HalValue,
    /// Linked signal name
    pub signal: Option<String>,
    /// Epsilon table index used by change detection
    pub eps_index: usize,
}

impl Hal {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_pin(
        &self,
        g: &ArenaGuard<'_>,
        name: &str,
        ty: HalType,
        dir: PinDir,
        slot: ShmOff,
        owner_id: u32,
        internal: bool,
    ) -> HalResult<ShmOff> {
        self.check_lock(LockLevel::LOAD, "creating pins")?;
        self.check_name(ObjectType::Pin, name)?;
        self.check_unique(g, ObjectType::Pin, name, owner_id)?;
        self.check_owner(g, owner_id, internal)?;
        if !self.arena().contains(slot, 4) || slot % 4 != 0 {
            return Err(HalError::Invalid(format!(
                "data slot of pin '{name}' is not in shared memory"
            )));
        }
        let dummy = self.arena().alloc_value(g)?;
        let off = self.create_object(g, name, owner_id, |hdr| PinDesc {
            hdr,
            ty: ty as u32,
            dir: dir as u32,
            slot,
            dummy,
            signal: AtomicU32::new(SHM_NULL),
            eps_index: AtomicU32::new(0),
        })?;
        self.arena().slot(slot).store(dummy, Ordering::Release);
        debug!("Pin '{}' {} {} created", name, ty, dir);
        Ok(off)
    }

    /// Allocate a slot and create a pin behind it.
    pub(crate) fn new_pin_locked(
        &self,
        g: &ArenaGuard<'_>,
        owner_id: u32,
        name: &str,
        ty: HalType,
        dir: PinDir,
        internal: bool,
    ) -> HalResult<PinPtr> {
        // Fail duplicates before consuming realtime storage
        self.check_unique(g, ObjectType::Pin, name, owner_id)?;
        let slot = self.arena().alloc_slot(g)?;
        let off = self.create_pin(g, name, ty, dir, slot, owner_id, internal)?;
        Ok(self.desc::<PinDesc>(off).ptr())
    }

    pub(crate) fn pin_value_at(&self, off: ShmOff) -> HalValue {
        self.desc::<PinDesc>(off).ptr().get(self.arena())
    }

    fn pin_info_at(&self, off: ShmOff) -> PinInfo {
        let pin = self.desc::<PinDesc>(off);
        let sig = pin.signal();
        PinInfo {
            id: pin.hdr.id(),
            name: self.name_of(off).to_string(),
            owner_id: pin.hdr.owner_id(),
            ty: pin.ty(),
            dir: pin.dir(),
            value: self.pin_value_at(off),
            signal: (sig != SHM_NULL).then(|| self.name_of(sig).to_string()),
            eps_index: pin.eps_index(),
        }
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Create a pin from raw type and direction tags.
    pub fn pin_new_raw(&self, name: &str, ty: u32, dir: u32, slot: ShmOff, owner_id: u32) -> HalResult<u32> {
        recording(|| {
            let ty = HalType::from_u32(ty)
                .ok_or_else(|| HalError::Invalid(format!("pin '{name}': unsupported type {ty}")))?;
            let dir = PinDir::from_u32(dir).ok_or_else(|| {
                HalError::Invalid(format!("pin '{name}': unsupported direction {dir}"))
            })?;
            let g = self.guard()?;
            let off = self.create_pin(&g, name, ty, dir, slot, owner_id, false)?;
            Ok(self.header(off).id())
        })
    }

    /// Create a pin whose owner reads and writes through `slot`.
    ///
    /// `slot` must be a 4-byte aligned word inside the segment, typically
    /// from [`Hal::malloc`] or instance storage.
    pub fn pin_new(&self, name: &str, ty: HalType, dir: PinDir, slot: ShmOff, owner_id: u32) -> HalResult<u32> {
        self.pin_new_raw(name, ty as u32, dir as u32, slot, owner_id)
    }

    /// Create a pin with a freshly allocated slot and return its handle.
    pub fn new_pin(&self, owner_id: u32, name: &str, ty: HalType, dir: PinDir) -> HalResult<PinPtr> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::LOAD, "creating pins")?;
            self.check_owner(&g, owner_id, false)?;
            self.new_pin_locked(&g, owner_id, name, ty, dir, false)
        })
    }

    /// Handle of existing pin `name`.
    pub fn pin_ptr(&self, name: &str) -> HalResult<PinPtr> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.desc::<PinDesc>(self.require(&g, ObjectType::Pin, name)?).ptr())
        })
    }

    /// Rename pin `name` to `alias`, or with `None` restore its original
    /// name.
    pub fn pin_alias(&self, name: &str, alias: Option<&str>) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Pin, name)?;
            self.rename_object(&g, off, alias)
        })
    }

    /// Current value of pin `name`.
    pub fn pin_value(&self, name: &str) -> HalResult<HalValue> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.pin_value_at(self.require(&g, ObjectType::Pin, name)?))
        })
    }

    /// Set an unlinked input pin's private value.
    pub fn pin_set(&self, name: &str, value: HalValue) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Pin, name)?;
            let pin = self.desc::<PinDesc>(off);
            if pin.dir() == PinDir::Out {
                return Err(HalError::Invalid(format!("pin '{name}' is an output")));
            }
            if pin.signal() != SHM_NULL {
                return Err(HalError::Invalid(format!(
                    "pin '{name}' is linked to signal '{}'",
                    self.name_of(pin.signal())
                )));
            }
            if value.ty() != pin.ty() {
                return Err(HalError::Invalid(format!(
                    "pin '{name}' is {}, value is {}",
                    pin.ty(),
                    value.ty()
                )));
            }
            self.arena()
                .value(pin.dummy())
                .store(value.to_bits(), Ordering::Relaxed);
            Ok(())
        })
    }

    /// Choose which epsilon table entry change detection uses for a pin.
    pub fn set_pin_epsilon(&self, name: &str, index: usize) -> HalResult<()> {
        recording(|| {
            if index >= MAX_EPSILON {
                return Err(HalError::Invalid(format!(
                    "epsilon index {index} out of range 0..{MAX_EPSILON}"
                )));
            }
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Pin, name)?;
            self.desc::<PinDesc>(off)
                .eps_index
                .store(index as u32, Ordering::Relaxed);
            Ok(())
        })
    }

    /// Snapshot of pin `name`.
    pub fn pin_info(&self, name: &str) -> HalResult<PinInfo> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.pin_info_at(self.require(&g, ObjectType::Pin, name)?))
        })
    }

    /// Snapshots of every pin whose name starts with `prefix`.
    pub fn pins(&self, prefix: &str) -> HalResult<Vec<PinInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Pin).prefix(prefix))
                .into_iter()
                .map(|off| self.pin_info_at(off))
                .collect())
        })
    }

    /// Pins linked to the signal at `sig`.
    pub(crate) fn pins_of_signal(&self, g: &ArenaGuard<'_>, sig: ShmOff) -> Vec<ShmOff> {
        self.collect(g, &Selector::of(ObjectType::Pin))
            .into_iter()
            .filter(|&off| self.desc::<PinDesc>(off).signal() == sig)
            .collect()
    }
}
