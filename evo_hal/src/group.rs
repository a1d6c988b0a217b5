//! Groups: named sets of signals and nested groups watched for changes.
//!
//! A member is a registry object owned by its group and named after its
//! target. Creating a member takes a reference on the target, so a signal
//! or group that belongs to a group cannot be deleted until the member is
//! removed.
//!
//! ```text
//!   group "status"  (userarg1, flags = userarg2)
//!    ├─ member "spindle.speed"   ─► signal      MEMBER_MONITOR_CHANGE, eps 1
//!    └─ member "axis"            ─► group "axis" ─► …
//! ```

use crate::context::Hal;
use crate::error::recording;
use crate::object::{Descriptor, ObjectHeader};
use crate::registry::Selector;
use evo_common::hal::consts::{GROUP_MONITOR_ALL_MEMBERS, GROUP_REPORT_ON_CHANGE, MAX_EPSILON};
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::types::ObjectType;
use evo_shared_memory::{ArenaGuard, SHM_NULL, ShmOff};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

#[repr(C)]
pub(crate) struct GroupDesc {
    pub(crate) hdr: ObjectHeader,
    userarg1: AtomicU32,
    userarg2: AtomicU32,
}

unsafe impl Descriptor for GroupDesc {
    const KIND: ObjectType = ObjectType::Group;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl GroupDesc {
    pub(crate) fn userarg1(&self) -> u32 {
        self.userarg1.load(Ordering::Relaxed)
    }

    /// Group flags (`GROUP_REPORT_ON_CHANGE`, `GROUP_MONITOR_ALL_MEMBERS`).
    pub(crate) fn flags(&self) -> u32 {
        self.userarg2.load(Ordering::Relaxed)
    }
}

#[repr(C)]
pub(crate) struct MemberDesc {
    pub(crate) hdr: ObjectHeader,
    /// Target signal, null for a nested group
    pub(crate) sig: ShmOff,
    /// Target group, null for a signal
    pub(crate) group: ShmOff,
    pub(crate) flags: u32,
    pub(crate) eps_index: u32,
}

unsafe impl Descriptor for MemberDesc {
    const KIND: ObjectType = ObjectType::Member;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl MemberDesc {
    fn target(&self) -> ShmOff {
        if self.sig != SHM_NULL { self.sig } else { self.group }
    }
}

/// Snapshot of one group member.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    /// Target name
    pub name: String,
    /// `Signal` or `Group`
    pub kind: ObjectType,
    /// Member flags
    pub flags: u32,
    /// Epsilon table index used for float signals
    pub eps_index: usize,
}

/// Snapshot of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    /// Group id
    pub id: u32,
    /// Group name
    pub name: String,
    /// Free-form user argument
    pub userarg1: u32,
    /// Group flags
    pub flags: u32,
    /// References held by compiled views and parent groups
    pub refcnt: u32,
    /// Members in name order
    pub members: Vec<MemberInfo>,
}

impl GroupInfo {
    /// Only changed members are reported.
    pub fn report_on_change(&self) -> bool {
        self.flags & GROUP_REPORT_ON_CHANGE != 0
    }

    /// Every member is monitored regardless of its own flags.
    pub fn monitor_all(&self) -> bool {
        self.flags & GROUP_MONITOR_ALL_MEMBERS != 0
    }
}

impl Hal {
    /// Member offsets of the group with id `group_id`.
    pub(crate) fn members_of(&self, g: &ArenaGuard<'_>, group_id: u32) -> Vec<ShmOff> {
        self.collect(g, &Selector::of(ObjectType::Member).owner(group_id))
    }

    fn group_info_at(&self, g: &ArenaGuard<'_>, off: ShmOff) -> GroupInfo {
        let grp = self.desc::<GroupDesc>(off);
        GroupInfo {
            id: grp.hdr.id(),
            name: self.name_of(off).to_string(),
            userarg1: grp.userarg1(),
            flags: grp.flags(),
            refcnt: grp.hdr.refcnt(),
            members: self
                .members_of(g, grp.hdr.id())
                .into_iter()
                .map(|m| {
                    let mem = self.desc::<MemberDesc>(m);
                    MemberInfo {
                        name: self.name_of(m).to_string(),
                        kind: if mem.sig != SHM_NULL {
                            ObjectType::Signal
                        } else {
                            ObjectType::Group
                        },
                        flags: mem.flags,
                        eps_index: mem.eps_index as usize,
                    }
                })
                .collect(),
        }
    }

    fn free_member(&self, g: &ArenaGuard<'_>, off: ShmOff) -> HalResult<()> {
        let target = self.desc::<MemberDesc>(off).target();
        self.header(target).decref();
        self.free_object(g, off)
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Create group `name`. `arg2` carries the group flags.
    pub fn group_new(&self, name: &str, arg1: u32, arg2: u32) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            let off = self.create_object(&g, name, 0, |hdr| GroupDesc {
                hdr,
                userarg1: AtomicU32::new(arg1),
                userarg2: AtomicU32::new(arg2),
            })?;
            info!("Group '{}' created (arg1={}, flags={:#x})", name, arg1, arg2);
            Ok(self.header(off).id())
        })
    }

    /// Delete group `name` and its members. `Busy` while it is compiled
    /// or nested in another group.
    pub fn group_delete(&self, name: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Group, name)?;
            let hdr = self.header(off);
            if hdr.refcnt() > 0 {
                return Err(HalError::Busy(format!(
                    "group '{name}' has {} reference(s)",
                    hdr.refcnt()
                )));
            }
            for m in self.members_of(&g, hdr.id()) {
                self.free_member(&g, m)?;
            }
            self.free_object(&g, off)?;
            info!("Group '{}' deleted", name);
            Ok(())
        })
    }

    /// Add `member` (a signal, or else a group) to `group`.
    pub fn member_new(&self, group: &str, member: &str, flags: u32, eps_index: usize) -> HalResult<u32> {
        recording(|| {
            if eps_index >= MAX_EPSILON {
                return Err(HalError::Invalid(format!(
                    "epsilon index {eps_index} out of range 0..{MAX_EPSILON}"
                )));
            }
            if group == member {
                return Err(HalError::Invalid(format!("group '{group}' cannot contain itself")));
            }
            let g = self.guard()?;
            let grp = self.require(&g, ObjectType::Group, group)?;
            let group_id = self.header(grp).id();
            let (sig, nested) = match self.find(&g, ObjectType::Signal, member) {
                Some(s) => (s, SHM_NULL),
                None => match self.find(&g, ObjectType::Group, member) {
                    Some(n) => (SHM_NULL, n),
                    None => {
                        return Err(HalError::Invalid(format!(
                            "member '{member}' is neither a signal nor a group"
                        )));
                    }
                },
            };
            let off = self.create_object(&g, member, group_id, |hdr| MemberDesc {
                hdr,
                sig,
                group: nested,
                flags,
                eps_index: eps_index as u32,
            })?;
            self.header(if sig != SHM_NULL { sig } else { nested }).incref();
            debug!("Member '{}' added to group '{}'", member, group);
            Ok(self.header(off).id())
        })
    }

    /// Remove `member` from `group`.
    pub fn member_delete(&self, group: &str, member: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let grp = self.require(&g, ObjectType::Group, group)?;
            let off = self
                .find_member(&g, self.header(grp).id(), member)
                .ok_or_else(|| HalError::not_found(ObjectType::Member, format!("{group}/{member}")))?;
            self.free_member(&g, off)?;
            debug!("Member '{}' removed from group '{}'", member, group);
            Ok(())
        })
    }

    /// Set entry `index` of the shared epsilon table.
    pub fn set_epsilon(&self, index: usize, value: f64) -> HalResult<()> {
        recording(|| {
            if index >= MAX_EPSILON {
                return Err(HalError::Invalid(format!(
                    "epsilon index {index} out of range 0..{MAX_EPSILON}"
                )));
            }
            if !(value.is_finite() && value >= 0.0) {
                return Err(HalError::Invalid(format!("epsilon {value} must be finite and >= 0")));
            }
            let _g = self.guard()?;
            self.data().set_epsilon(index, value);
            Ok(())
        })
    }

    /// Entry `index` of the shared epsilon table.
    pub fn epsilon(&self, index: usize) -> HalResult<f64> {
        if index >= MAX_EPSILON {
            return Err(HalError::Invalid(format!(
                "epsilon index {index} out of range 0..{MAX_EPSILON}"
            )));
        }
        Ok(self.data().epsilon(index))
    }

    /// Take a reference on group `name`.
    pub fn ref_group(&self, name: &str) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.header(self.require(&g, ObjectType::Group, name)?).incref())
        })
    }

    /// Drop a reference on group `name`, typically the one taken by
    /// [`Hal::compile_group`].
    pub fn unref_group(&self, name: &str) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require_retained(&g, ObjectType::Group, name)?;
            self.decref_id(&g, ObjectType::Group, self.header(off).id())
        })
    }

    /// Snapshot of group `name`.
    pub fn group_info(&self, name: &str) -> HalResult<GroupInfo> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Group, name)?;
            Ok(self.group_info_at(&g, off))
        })
    }

    /// Snapshots of every group.
    pub fn groups(&self) -> HalResult<Vec<GroupInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Group))
                .into_iter()
                .map(|off| self.group_info_at(&g, off))
                .collect())
        })
    }
}
