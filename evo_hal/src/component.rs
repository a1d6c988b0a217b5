//! Components: the unit of ownership for pins, parameters and functions.
//!
//! ```text
//!   init ──► Initializing ──ready──► Ready                (RT / user)
//!                         └─ready──► Unbound ⇄ Bound      (remote)
//! ```
//!
//! Pins and parameters can only be added to a component while it is
//! initializing. Exiting a component tears down everything it owns:
//! instances first, then functions, pins and parameters.

use crate::context::Hal;
use crate::error::recording;
use crate::instance::InstanceHooks;
use crate::object::{Descriptor, ObjectHeader};
use crate::registry::Selector;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{CompState, CompType, ObjectType};
use evo_shared_memory::platform::get_current_pid;
use evo_shared_memory::{ArenaGuard, ShmOff};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, info};

#[repr(C)]
pub(crate) struct CompDesc {
    pub(crate) hdr: ObjectHeader,
    kind: u32,
    state: AtomicU32,
    pid: AtomicU32,
    instantiable: AtomicU32,
}

unsafe impl Descriptor for CompDesc {
    const KIND: ObjectType = ObjectType::Component;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl CompDesc {
    pub(crate) fn kind(&self) -> CompType {
        CompType::from_u32(self.kind).unwrap_or(CompType::User)
    }

    pub(crate) fn state(&self) -> CompState {
        CompState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(CompState::Initializing)
    }

    pub(crate) fn set_state(&self, state: CompState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }
}

/// Snapshot of a component.
#[derive(Debug, Clone, PartialEq)]
pub struct CompInfo {
    /// Component id
    pub id: u32,
    /// Component name
    pub name: String,
    /// Component kind
    pub kind: CompType,
    /// Lifecycle state
    pub state: CompState,
    /// Owning (user) or acquiring (remote) process, 0 if none
    pub pid: u32,
    /// True if it can create instances
    pub instantiable: bool,
}

impl Hal {
    pub(crate) fn create_component(&self, g: &ArenaGuard<'_>, name: &str, kind: CompType) -> HalResult<u32> {
        if kind != CompType::HalLib {
            self.check_lock(LockLevel::LOAD, "loading components")?;
        }
        let pid = match kind {
            CompType::User => get_current_pid(),
            _ => 0,
        };
        let off = self.create_object(g, name, 0, |hdr| CompDesc {
            hdr,
            kind: kind as u32,
            state: AtomicU32::new(CompState::Initializing as u32),
            pid: AtomicU32::new(pid),
            instantiable: AtomicU32::new(0),
        })?;
        let id = self.header(off).id();
        info!("Component '{}' ({}) initialized with id {}", name, kind, id);
        Ok(id)
    }

    /// Component descriptor for `comp_id`.
    pub(crate) fn comp_by_id(&self, g: &ArenaGuard<'_>, comp_id: u32) -> HalResult<ShmOff> {
        self.find_by_id(g, comp_id)
            .filter(|&off| self.header(off).kind() == Some(ObjectType::Component))
            .ok_or_else(|| HalError::not_found(ObjectType::Component, comp_id.to_string()))
    }

    /// Validate that `owner_id` may own new pins, parameters or functions.
    ///
    /// `internal` skips the initializing-state check for objects the HAL
    /// creates on behalf of a ready owner.
    pub(crate) fn check_owner(&self, g: &ArenaGuard<'_>, owner_id: u32, internal: bool) -> HalResult<()> {
        let off = self
            .find_by_id(g, owner_id)
            .ok_or_else(|| HalError::not_found(ObjectType::Component, owner_id.to_string()))?;
        match self.header(off).kind() {
            Some(ObjectType::Component) => {
                let comp = self.desc::<CompDesc>(off);
                if !internal && comp.state() != CompState::Initializing {
                    return Err(HalError::Invalid(format!(
                        "component '{}' is already {}",
                        self.name_of(off),
                        comp.state()
                    )));
                }
                Ok(())
            }
            Some(ObjectType::Instance) => {
                let comp_id = self.header(off).owner_id();
                if self.comp_by_id(g, comp_id).is_err() {
                    error!(
                        "BUG: instance '{}' refers to missing component {}",
                        self.name_of(off),
                        comp_id
                    );
                    return Err(HalError::not_found(ObjectType::Component, comp_id.to_string()));
                }
                Ok(())
            }
            _ => Err(HalError::Invalid(format!(
                "object {owner_id} cannot own pins, parameters or functions"
            ))),
        }
    }

    /// Free every function, pin and parameter directly owned by `owner_id`,
    /// in that order.
    pub(crate) fn delete_owned(&self, g: &ArenaGuard<'_>, owner_id: u32) -> HalResult<()> {
        for off in self.collect(g, &Selector::of(ObjectType::Funct).owner(owner_id)) {
            self.free_funct(g, off)?;
        }
        self.delete_owned_pins_and_params(g, owner_id)
    }

    pub(crate) fn delete_owned_pins_and_params(&self, g: &ArenaGuard<'_>, owner_id: u32) -> HalResult<()> {
        for off in self.collect(g, &Selector::of(ObjectType::Pin).owner(owner_id)) {
            self.unlink_locked(g, off)?;
            self.retire(g, off)?;
        }
        for off in self.collect(g, &Selector::of(ObjectType::Param).owner(owner_id)) {
            self.retire(g, off)?;
        }
        Ok(())
    }

    fn comp_info_at(&self, off: ShmOff) -> CompInfo {
        let comp = self.desc::<CompDesc>(off);
        CompInfo {
            id: comp.hdr.id(),
            name: self.name_of(off).to_string(),
            kind: comp.kind(),
            state: comp.state(),
            pid: comp.pid(),
            instantiable: comp.instantiable.load(Ordering::Acquire) != 0,
        }
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Register a user component owned by this process.
    pub fn init(&self, name: &str) -> HalResult<u32> {
        self.init_comp(name, CompType::User)
    }

    /// Register a component of `kind`.
    pub fn init_comp(&self, name: &str, kind: CompType) -> HalResult<u32> {
        recording(|| {
            if kind == CompType::HalLib {
                return Err(HalError::Invalid(
                    "the library component is created by the HAL itself".into(),
                ));
            }
            let g = self.guard()?;
            self.create_component(&g, name, kind)
        })
    }

    /// Register a component that creates instances through `hooks`.
    ///
    /// The hooks live in this process; [`Hal::new_instance`] must be called
    /// from here too.
    pub fn init_instantiable(&self, name: &str, kind: CompType, hooks: InstanceHooks) -> HalResult<u32> {
        let id = self.init_comp(name, kind)?;
        {
            let g = self.guard()?;
            let off = self.comp_by_id(&g, id)?;
            self.desc::<CompDesc>(off)
                .instantiable
                .store(1, Ordering::Release);
        }
        self.local().hooks.insert(id, hooks);
        Ok(id)
    }

    /// Mark a component fully initialized.
    pub fn ready(&self, comp_id: u32) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.comp_by_id(&g, comp_id)?;
            let comp = self.desc::<CompDesc>(off);
            if comp.state() != CompState::Initializing {
                return Err(HalError::Invalid(format!(
                    "component '{}' already ready",
                    self.name_of(off)
                )));
            }
            let next = match comp.kind() {
                CompType::Remote => CompState::Unbound,
                _ => CompState::Ready,
            };
            comp.set_state(next);
            info!("Component '{}' is {}", self.name_of(off), next);
            Ok(())
        })
    }

    /// Remove a component and everything it owns.
    pub fn exit(&self, comp_id: u32) -> HalResult<()> {
        recording(|| {
            if comp_id == self.hal_lib_id() {
                return Err(HalError::Permission(
                    "the library component cannot exit".into(),
                ));
            }
            let instances: Vec<u32> = {
                let g = self.guard()?;
                self.comp_by_id(&g, comp_id)?;
                self.collect(&g, &Selector::of(ObjectType::Instance).owner(comp_id))
                    .into_iter()
                    .map(|off| self.header(off).id())
                    .collect()
            };
            for inst in instances {
                self.delete_instance_by_id(inst)?;
            }

            let g = self.guard()?;
            let off = self.comp_by_id(&g, comp_id)?;
            let name = self.name_of(off).to_string();
            self.delete_owned(&g, comp_id)?;
            self.local().hooks.remove(&comp_id);
            self.retire(&g, off)?;
            info!("Component '{}' exited", name);
            Ok(())
        })
    }

    /// Id of component `name`.
    pub fn comp_id(&self, name: &str) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.header(self.require(&g, ObjectType::Component, name)?).id())
        })
    }

    /// Snapshot of component `name`.
    pub fn comp_info(&self, name: &str) -> HalResult<CompInfo> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.comp_info_at(self.require(&g, ObjectType::Component, name)?))
        })
    }

    /// Snapshots of every component.
    pub fn components(&self) -> HalResult<Vec<CompInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Component))
                .into_iter()
                .map(|off| self.comp_info_at(off))
                .collect())
        })
    }

    fn remote_transition(&self, name: &str, from: CompState, to: CompState) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Component, name)?;
            let comp = self.desc::<CompDesc>(off);
            if comp.kind() != CompType::Remote {
                return Err(HalError::Invalid(format!("component '{name}' is not remote")));
            }
            if comp.state() != from {
                return Err(HalError::Invalid(format!(
                    "component '{name}' is {}, expected {from}",
                    comp.state()
                )));
            }
            comp.set_state(to);
            debug!("Remote component '{}' {} -> {}", name, from, to);
            Ok(())
        })
    }

    /// Attach a peer to a remote component.
    pub fn bind(&self, name: &str) -> HalResult<()> {
        self.remote_transition(name, CompState::Unbound, CompState::Bound)
    }

    /// Detach the peer of a remote component.
    pub fn unbind(&self, name: &str) -> HalResult<()> {
        self.remote_transition(name, CompState::Bound, CompState::Unbound)
    }

    /// Claim a remote component for this process. `Busy` if claimed.
    pub fn acquire(&self, name: &str) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Component, name)?;
            let comp = self.desc::<CompDesc>(off);
            if comp.kind() != CompType::Remote {
                return Err(HalError::Invalid(format!("component '{name}' is not remote")));
            }
            let pid = get_current_pid();
            comp.pid
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|owner| {
                    HalError::Busy(format!("component '{name}' already acquired by pid {owner}"))
                })?;
            Ok(comp.hdr.id())
        })
    }

    /// Release a remote component claimed with [`Hal::acquire`].
    pub fn release(&self, name: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Component, name)?;
            let comp = self.desc::<CompDesc>(off);
            if comp.kind() != CompType::Remote {
                return Err(HalError::Invalid(format!("component '{name}' is not remote")));
            }
            comp.pid.store(0, Ordering::Release);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_common::hal::types::{HalType, PinDir};

    #[test]
    fn test_lifecycle_and_pin_window() {
        let hal = Hal::anonymous().unwrap();
        let comp = hal.init("motion").unwrap();
        assert_eq!(hal.comp_info("motion").unwrap().state, CompState::Initializing);
        hal.new_pin(comp, "motion.enable", HalType::Bit, PinDir::In).unwrap();
        hal.ready(comp).unwrap();
        assert!(matches!(hal.ready(comp), Err(HalError::Invalid(_))));
        // No new pins after ready
        assert!(matches!(
            hal.new_pin(comp, "motion.late", HalType::Bit, PinDir::In),
            Err(HalError::Invalid(_))
        ));
    }

    #[test]
    fn test_orphaned_instance_is_not_found() {
        let hal = Hal::anonymous().unwrap();
        let comp = hal.init("ghost").unwrap();
        let inst = hal.inst_create(comp, "ghost.0", 0).unwrap();
        hal.new_pin(inst.id, "ghost.0.in", HalType::Bit, PinDir::In).unwrap();

        // Free the component behind the cascade's back
        {
            let g = hal.guard().unwrap();
            let off = hal.comp_by_id(&g, comp).unwrap();
            hal.free_object(&g, off).unwrap();
        }
        assert!(matches!(
            hal.new_pin(inst.id, "ghost.0.out", HalType::Bit, PinDir::Out),
            Err(HalError::NotFound { kind: ObjectType::Component, .. })
        ));
        let owned = hal
            .count(&Selector::of(ObjectType::Pin).owning_comp(comp))
            .unwrap();
        assert_eq!(owned, 0);
        assert_eq!(hal.pins("ghost.").unwrap().len(), 1);
    }

    #[test]
    fn test_remote_bind_cycle() {
        let hal = Hal::anonymous().unwrap();
        let id = hal.init_comp("remote", CompType::Remote).unwrap();
        assert!(hal.bind("remote").is_err());
        hal.ready(id).unwrap();
        assert_eq!(hal.comp_info("remote").unwrap().state, CompState::Unbound);
        hal.bind("remote").unwrap();
        assert!(hal.bind("remote").is_err());
        hal.unbind("remote").unwrap();

        hal.acquire("remote").unwrap();
        assert!(matches!(hal.acquire("remote"), Err(HalError::Busy(_))));
        hal.release("remote").unwrap();
        hal.acquire("remote").unwrap();
    }

    #[test]
    fn test_load_lock_blocks_init() {
        let hal = Hal::anonymous().unwrap();
        hal.set_lock_level(LockLevel::LOAD).unwrap();
        assert!(matches!(hal.init("late"), Err(HalError::Permission(_))));
    }

    #[test]
    fn test_library_component_is_protected() {
        let hal = Hal::anonymous().unwrap();
        let lib = hal.hal_lib_id();
        assert!(matches!(hal.exit(lib), Err(HalError::Permission(_))));
        assert!(hal.init_comp("other_lib", CompType::HalLib).is_err());
    }

    #[test]
    fn test_exit_removes_owned_objects() {
        let hal = Hal::anonymous().unwrap();
        let comp = hal.init("io").unwrap();
        hal.new_pin(comp, "io.in-0", HalType::Bit, PinDir::In).unwrap();
        hal.new_param(comp, "io.debounce", HalType::U32, evo_common::hal::types::ParamDir::Rw)
            .unwrap();
        hal.ready(comp).unwrap();
        hal.exit(comp).unwrap();
        assert_eq!(hal.count(&Selector::of(ObjectType::Pin).prefix("io.")).unwrap(), 0);
        assert_eq!(hal.count(&Selector::of(ObjectType::Param).prefix("io.")).unwrap(), 0);
        assert!(hal.comp_id("io").is_err());
    }
}
