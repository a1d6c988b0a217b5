//! Named instances of instantiable components.
//!
//! An instance owns pins, parameters and functions like a component does,
//! plus an optional block of realtime storage. Instances are created by
//! the component's constructor and torn down by its destructor; both run
//! in the process that registered the component, with the HAL mutex
//! released.

use crate::context::Hal;
use crate::error::recording;
use crate::object::{Descriptor, ObjectHeader};
use crate::registry::Selector;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::ObjectType;
use evo_shared_memory::{ArenaGuard, SHM_NULL, ShmOff};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[repr(C)]
pub(crate) struct InstDesc {
    pub(crate) hdr: ObjectHeader,
    data: ShmOff,
    size: u32,
}

unsafe impl Descriptor for InstDesc {
    const KIND: ObjectType = ObjectType::Instance;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

/// What a constructor is asked to build.
#[derive(Debug)]
pub struct InstanceRequest<'a> {
    /// Id of the instantiable component
    pub comp_id: u32,
    /// Component name
    pub comp: &'a str,
    /// Requested instance name
    pub name: &'a str,
    /// Extra arguments
    pub args: &'a [String],
}

/// Snapshot of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    /// Instance id
    pub id: u32,
    /// Owning component id
    pub comp_id: u32,
    /// Instance name
    pub name: String,
    /// Realtime storage, null if none was requested
    pub data: ShmOff,
    /// Size of the storage in bytes
    pub size: usize,
}

/// Instance constructor. Must call [`Hal::inst_create`] with the
/// requested name before returning success.
pub type Constructor = Arc<dyn Fn(&Hal, &InstanceRequest<'_>) -> HalResult<()> + Send + Sync>;

/// Instance destructor, called before the instance's pins and
/// parameters are removed.
pub type Destructor = Arc<dyn Fn(&Hal, &InstanceInfo) + Send + Sync>;

/// Constructor and optional destructor of an instantiable component.
#[derive(Clone)]
pub struct InstanceHooks {
    pub(crate) ctor: Constructor,
    pub(crate) dtor: Option<Destructor>,
}

impl InstanceHooks {
    /// Hooks with only a constructor.
    pub fn new<F>(ctor: F) -> Self
    where
        F: Fn(&Hal, &InstanceRequest<'_>) -> HalResult<()> + Send + Sync + 'static,
    {
        Self {
            ctor: Arc::new(ctor),
            dtor: None,
        }
    }

    /// Add a destructor.
    pub fn with_destructor<F>(mut self, dtor: F) -> Self
    where
        F: Fn(&Hal, &InstanceInfo) + Send + Sync + 'static,
    {
        self.dtor = Some(Arc::new(dtor));
        self
    }
}

impl Hal {
    fn inst_info_at(&self, off: ShmOff) -> InstanceInfo {
        let inst = self.desc::<InstDesc>(off);
        InstanceInfo {
            id: inst.hdr.id(),
            comp_id: inst.hdr.owner_id(),
            name: self.name_of(off).to_string(),
            data: inst.data,
            size: inst.size as usize,
        }
    }

    fn inst_by_id(&self, g: &ArenaGuard<'_>, id: u32) -> Option<ShmOff> {
        self.find_by_id(g, id)
            .filter(|&off| self.header(off).kind() == Some(ObjectType::Instance))
    }

    /// Tear down one instance: functions, destructor, pins, parameters.
    pub(crate) fn delete_instance_by_id(&self, id: u32) -> HalResult<()> {
        let (info, dtor) = {
            let g = self.guard()?;
            let off = self
                .inst_by_id(&g, id)
                .ok_or_else(|| HalError::not_found(ObjectType::Instance, id.to_string()))?;
            let info = self.inst_info_at(off);
            for funct in self.collect(&g, &Selector::of(ObjectType::Funct).owner(id)) {
                self.free_funct(&g, funct)?;
            }
            let dtor = self
                .local()
                .hooks
                .get(&info.comp_id)
                .and_then(|h| h.dtor.clone());
            (info, dtor)
        };

        if let Some(dtor) = dtor {
            debug!("Calling destructor of instance '{}'", info.name);
            dtor(self, &info);
        }

        let g = self.guard()?;
        let Some(off) = self.inst_by_id(&g, id) else {
            warn!("Instance '{}' vanished during its destructor", info.name);
            return Ok(());
        };
        self.delete_owned_pins_and_params(&g, id)?;
        self.retire(&g, off)?;
        info!("Instance '{}' deleted", info.name);
        Ok(())
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Register instance `name` of component `comp_id`, with `size` bytes
    /// of zeroed realtime storage.
    pub fn inst_create(&self, comp_id: u32, name: &str, size: usize) -> HalResult<InstanceInfo> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::LOAD, "creating instances")?;
            self.comp_by_id(&g, comp_id)?;
            self.check_name(ObjectType::Instance, name)?;
            self.check_unique(&g, ObjectType::Instance, name, comp_id)?;
            let data = if size > 0 {
                self.arena().alloc_rt(&g, size, 8)?
            } else {
                SHM_NULL
            };
            let size32 = u32::try_from(size)
                .map_err(|_| HalError::NoMemory(format!("instance '{name}'")))?;
            let off = self.create_object(&g, name, comp_id, |hdr| InstDesc {
                hdr,
                data,
                size: size32,
            })?;
            info!("Instance '{}' created ({} bytes)", name, size);
            Ok(self.inst_info_at(off))
        })
    }

    /// Delete instance `name`.
    pub fn inst_delete(&self, name: &str) -> HalResult<()> {
        recording(|| {
            let id = {
                let g = self.guard()?;
                self.header(self.require(&g, ObjectType::Instance, name)?).id()
            };
            self.delete_instance_by_id(id)
        })
    }

    /// Ask instantiable component `comp` to build instance `name`.
    ///
    /// The constructor runs with the HAL mutex released. If it fails, any
    /// instance it left behind is deleted again.
    pub fn new_instance(&self, comp: &str, name: &str, args: &[String]) -> HalResult<InstanceInfo> {
        recording(|| {
            let comp_id = {
                let g = self.guard()?;
                let off = self.require(&g, ObjectType::Component, comp)?;
                self.check_unique(&g, ObjectType::Instance, name, 0)?;
                self.header(off).id()
            };
            let ctor = self
                .local()
                .hooks
                .get(&comp_id)
                .map(|h| Arc::clone(&h.ctor))
                .ok_or_else(|| {
                    HalError::Invalid(format!(
                        "component '{comp}' has no constructor in this process"
                    ))
                })?;

            let request = InstanceRequest {
                comp_id,
                comp,
                name,
                args,
            };
            debug!("Calling constructor of '{}' for '{}'", comp, name);
            let result = ctor(self, &request);

            let created = {
                let g = self.guard()?;
                self.find(&g, ObjectType::Instance, name)
                    .filter(|&off| self.header(off).owner_id() == comp_id)
                    .map(|off| self.inst_info_at(off))
            };
            match (result, created) {
                (Ok(()), Some(info)) => Ok(info),
                (Ok(()), None) => Err(HalError::Invalid(format!(
                    "constructor of '{comp}' did not create instance '{name}'"
                ))),
                (Err(e), leftover) => {
                    if let Some(info) = leftover {
                        self.delete_instance_by_id(info.id)?;
                    }
                    Err(e)
                }
            }
        })
    }

    /// Snapshot of instance `name`.
    pub fn instance_info(&self, name: &str) -> HalResult<InstanceInfo> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.inst_info_at(self.require(&g, ObjectType::Instance, name)?))
        })
    }

    /// Snapshots of every instance of component `comp_id`.
    pub fn instances(&self, comp_id: u32) -> HalResult<Vec<InstanceInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Instance).owner(comp_id))
                .into_iter()
                .map(|off| self.inst_info_at(off))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_common::hal::types::{CompType, HalType, PinDir};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_hooks(dtor_calls: Arc<AtomicUsize>) -> InstanceHooks {
        InstanceHooks::new(|hal, req| {
            let inst = hal.inst_create(req.comp_id, req.name, 16)?;
            hal.new_pin(inst.id, &format!("{}.out", req.name), HalType::S32, PinDir::Out)?;
            Ok(())
        })
        .with_destructor(move |_, _| {
            dtor_calls.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_new_instance_runs_constructor() {
        let hal = Hal::anonymous().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let comp = hal
            .init_instantiable("counter", CompType::Realtime, counter_hooks(calls.clone()))
            .unwrap();
        hal.ready(comp).unwrap();

        let inst = hal.new_instance("counter", "c0", &[]).unwrap();
        assert_eq!(inst.comp_id, comp);
        assert_ne!(inst.data, SHM_NULL);
        assert!(hal.pin_info("c0.out").is_ok());

        hal.inst_delete("c0").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(hal.pin_info("c0.out").is_err());
    }

    #[test]
    fn test_constructor_must_create_instance() {
        let hal = Hal::anonymous().unwrap();
        let comp = hal
            .init_instantiable("lazy", CompType::User, InstanceHooks::new(|_, _| Ok(())))
            .unwrap();
        hal.ready(comp).unwrap();
        assert!(matches!(
            hal.new_instance("lazy", "l0", &[]),
            Err(HalError::Invalid(_))
        ));
    }

    #[test]
    fn test_failed_constructor_cleans_up() {
        let hal = Hal::anonymous().unwrap();
        let hooks = InstanceHooks::new(|hal, req| {
            hal.inst_create(req.comp_id, req.name, 0)?;
            Err(HalError::Invalid(format!("bad args {:?}", req.args)))
        });
        let comp = hal.init_instantiable("picky", CompType::User, hooks).unwrap();
        hal.ready(comp).unwrap();
        assert!(hal.new_instance("picky", "p0", &["x".into()]).is_err());
        assert!(hal.instance_info("p0").is_err());
    }

    #[test]
    fn test_exit_runs_destructors() {
        let hal = Hal::anonymous().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let comp = hal
            .init_instantiable("multi", CompType::Realtime, counter_hooks(calls.clone()))
            .unwrap();
        hal.ready(comp).unwrap();
        hal.new_instance("multi", "m0", &[]).unwrap();
        hal.new_instance("multi", "m1", &[]).unwrap();
        assert_eq!(hal.instances(comp).unwrap().len(), 2);

        hal.exit(comp).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(hal.instance_info("m1").is_err());
    }
}
