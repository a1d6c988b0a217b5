//! Parameters: named tuning values owned by components.
//!
//! Unlike pins a parameter is never linked; its value word is fixed at
//! creation. Read-only parameters are written by their owner only.

use crate::context::Hal;
use crate::error::recording;
use crate::object::{Descriptor, ObjectHeader};
use crate::registry::Selector;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{HalType, HalValue, ObjectType, ParamDir};
use evo_shared_memory::{Arena, ArenaGuard, ShmOff};
use std::sync::atomic::Ordering;
use tracing::debug;

#[repr(C)]
pub(crate) struct ParamDesc {
    pub(crate) hdr: ObjectHeader,
    ty: u32,
    dir: u32,
    data: ShmOff,
    _pad: u32,
}

unsafe impl Descriptor for ParamDesc {
    const KIND: ObjectType = ObjectType::Param;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl ParamDesc {
    pub(crate) fn ty(&self) -> HalType {
        HalType::from_u32(self.ty).unwrap_or(HalType::Bit)
    }

    pub(crate) fn dir(&self) -> ParamDir {
        ParamDir::from_u32(self.dir).unwrap_or(ParamDir::Ro)
    }
}

/// Owner-side handle of a parameter's value word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamPtr {
    data: ShmOff,
    ty: HalType,
}

impl ParamPtr {
    /// Offset of the value word.
    pub fn data(&self) -> ShmOff {
        self.data
    }

    /// Current value.
    #[inline]
    pub fn get(&self, arena: &Arena) -> HalValue {
        HalValue::from_bits(self.ty, arena.value(self.data).load(Ordering::Relaxed))
    }

    /// Store `value`; a value of another type is ignored.
    #[inline]
    pub fn set(&self, arena: &Arena, value: HalValue) {
        debug_assert_eq!(value.ty(), self.ty);
        if value.ty() == self.ty {
            arena.value(self.data).store(value.to_bits(), Ordering::Relaxed);
        }
    }
}

/// Snapshot of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    /// Parameter id
    pub id: u32,
    /// Current name
    pub name: String,
    /// Owning component or instance id
    pub owner_id: u32,
    /// Parameter type
    pub ty: HalType,
    /// Access direction
    pub dir: ParamDir,
    /// Current value
    pub value: HalValue,
}

impl Hal {
    fn create_param(
        &self,
        g: &ArenaGuard<'_>,
        name: &str,
        ty: HalType,
        dir: ParamDir,
        data: ShmOff,
        owner_id: u32,
    ) -> HalResult<ShmOff> {
        self.check_lock(LockLevel::LOAD, "creating parameters")?;
        self.check_name(ObjectType::Param, name)?;
        self.check_unique(g, ObjectType::Param, name, owner_id)?;
        self.check_owner(g, owner_id, false)?;
        if !self.arena().contains(data, 8) || data % 8 != 0 {
            return Err(HalError::Invalid(format!(
                "value word of parameter '{name}' is not in shared memory"
            )));
        }
        let off = self.create_object(g, name, owner_id, |hdr| ParamDesc {
            hdr,
            ty: ty as u32,
            dir: dir as u32,
            data,
            _pad: 0,
        })?;
        debug!("Parameter '{}' {} {} created", name, ty, dir);
        Ok(off)
    }

    fn param_value_at(&self, off: ShmOff) -> HalValue {
        let p = self.desc::<ParamDesc>(off);
        HalValue::from_bits(p.ty(), self.arena().value(p.data).load(Ordering::Relaxed))
    }

    fn param_info_at(&self, off: ShmOff) -> ParamInfo {
        let p = self.desc::<ParamDesc>(off);
        ParamInfo {
            id: p.hdr.id(),
            name: self.name_of(off).to_string(),
            owner_id: p.hdr.owner_id(),
            ty: p.ty(),
            dir: p.dir(),
            value: self.param_value_at(off),
        }
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Create a parameter from raw type and direction tags.
    pub fn param_new_raw(&self, name: &str, ty: u32, dir: u32, data: ShmOff, owner_id: u32) -> HalResult<u32> {
        recording(|| {
            let ty = HalType::from_u32(ty).ok_or_else(|| {
                HalError::Invalid(format!("parameter '{name}': unsupported type {ty}"))
            })?;
            let dir = ParamDir::from_u32(dir).ok_or_else(|| {
                HalError::Invalid(format!("parameter '{name}': unsupported direction {dir}"))
            })?;
            let g = self.guard()?;
            let off = self.create_param(&g, name, ty, dir, data, owner_id)?;
            Ok(self.header(off).id())
        })
    }

    /// Create a parameter stored in the 8-byte word at `data`.
    pub fn param_new(&self, name: &str, ty: HalType, dir: ParamDir, data: ShmOff, owner_id: u32) -> HalResult<u32> {
        self.param_new_raw(name, ty as u32, dir as u32, data, owner_id)
    }

    /// Create a parameter with freshly allocated storage.
    pub fn new_param(&self, owner_id: u32, name: &str, ty: HalType, dir: ParamDir) -> HalResult<ParamPtr> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::LOAD, "creating parameters")?;
            self.check_owner(&g, owner_id, false)?;
            self.check_unique(&g, ObjectType::Param, name, owner_id)?;
            let data = self.arena().alloc_value(&g)?;
            self.create_param(&g, name, ty, dir, data, owner_id)?;
            Ok(ParamPtr { data, ty })
        })
    }

    /// Set parameter `name`. Refused for read-only parameters and under
    /// the `PARAMS` lock.
    pub fn param_set(&self, name: &str, value: HalValue) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::PARAMS, "setting parameters")?;
            let off = self.require(&g, ObjectType::Param, name)?;
            let p = self.desc::<ParamDesc>(off);
            if p.dir() == ParamDir::Ro {
                return Err(HalError::Invalid(format!("parameter '{name}' is read-only")));
            }
            if value.ty() != p.ty() {
                return Err(HalError::Invalid(format!(
                    "parameter '{name}' is {}, value is {}",
                    p.ty(),
                    value.ty()
                )));
            }
            self.arena()
                .value(p.data)
                .store(value.to_bits(), Ordering::Relaxed);
            Ok(())
        })
    }

    /// Current value of parameter `name`.
    pub fn param_get(&self, name: &str) -> HalResult<HalValue> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.param_value_at(self.require(&g, ObjectType::Param, name)?))
        })
    }

    /// Rename parameter `name` to `alias`, or restore its original name.
    pub fn param_alias(&self, name: &str, alias: Option<&str>) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Param, name)?;
            self.rename_object(&g, off, alias)
        })
    }

    /// Snapshot of parameter `name`.
    pub fn param_info(&self, name: &str) -> HalResult<ParamInfo> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.param_info_at(self.require(&g, ObjectType::Param, name)?))
        })
    }

    /// Snapshots of every parameter whose name starts with `prefix`.
    pub fn params(&self, prefix: &str) -> HalResult<Vec<ParamInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Param).prefix(prefix))
                .into_iter()
                .map(|off| self.param_info_at(off))
                .collect())
        })
    }
}
