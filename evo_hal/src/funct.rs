//! Functions: realtime callables exported by components.
//!
//! The descriptor lives in the segment so every process can list and wire
//! functions; the callable itself stays in the exporting process. Three
//! calling conventions exist:
//!
//! | Kind     | Receives                         | Attachable |
//! |----------|----------------------------------|------------|
//! | `Legacy` | arena and thread period (ns)     | yes        |
//! | `Thread` | [`FunctArgs`] with timing data   | yes        |
//! | `User`   | argument vector, by name         | no         |
//!
//! Attachable functions get `<name>.time`, `<name>.tmax` and
//! `<name>.tmax-increased` pins, owned by the function's owner.

use crate::context::Hal;
use crate::error::recording;
use crate::object::{Descriptor, ObjectFlags, ObjectHeader};
use crate::pin::{PinDesc, PinPtr};
use crate::registry::Selector;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{FunctType, HalType, ObjectType, PinDir};
use evo_shared_memory::{Arena, ArenaGuard, SHM_NULL, ShmOff};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[repr(C)]
pub(crate) struct FunctDesc {
    pub(crate) hdr: ObjectHeader,
    kind: u32,
    uses_fp: u32,
    reentrant: u32,
    users: AtomicU32,
    time: ShmOff,
    tmax: ShmOff,
    tmax_inc: ShmOff,
    _pad: u32,
}

unsafe impl Descriptor for FunctDesc {
    const KIND: ObjectType = ObjectType::Funct;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl FunctDesc {
    pub(crate) fn kind(&self) -> FunctType {
        FunctType::from_u32(self.kind).unwrap_or(FunctType::User)
    }

    pub(crate) fn uses_fp(&self) -> bool {
        self.uses_fp != 0
    }

    pub(crate) fn reentrant(&self) -> bool {
        self.reentrant != 0
    }

    pub(crate) fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    pub(crate) fn add_user(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_user(&self) {
        let _ = self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Instrumentation pin handles: time, tmax, tmax-increased.
    pub(crate) fn stat_pins(&self) -> Option<(PinPtr, PinPtr, PinPtr)> {
        (self.time != SHM_NULL).then(|| {
            (
                PinPtr::from_slot(self.time, HalType::S32),
                PinPtr::from_slot(self.tmax, HalType::S32),
                PinPtr::from_slot(self.tmax_inc, HalType::Bit),
            )
        })
    }
}

/// Per-invocation data handed to [`FunctCall::Thread`] functions.
#[derive(Debug)]
pub struct FunctArgs<'a> {
    /// Segment the function's pins live in
    pub arena: &'a Arena,
    /// Thread period in nanoseconds
    pub period: i64,
    /// When the current thread cycle started
    pub thread_start: Instant,
    /// When this function was entered
    pub funct_start: Instant,
    /// Calling thread
    pub thread: &'a str,
    /// This function
    pub funct: &'a str,
    /// Cycle counter of the calling thread
    pub cycle: u64,
}

/// Process-local callable behind a function descriptor.
#[derive(Clone)]
pub enum FunctCall {
    /// Called with the arena and the thread period in nanoseconds
    Legacy(Arc<dyn Fn(&Arena, i64) + Send + Sync>),
    /// Called with per-invocation metadata
    Thread(Arc<dyn Fn(&FunctArgs<'_>) + Send + Sync>),
    /// Called by name with an argument vector
    User(Arc<dyn Fn(&[String]) -> HalResult<i32> + Send + Sync>),
}

impl FunctCall {
    /// Calling convention of this callable.
    pub fn kind(&self) -> FunctType {
        match self {
            Self::Legacy(_) => FunctType::Legacy,
            Self::Thread(_) => FunctType::Thread,
            Self::User(_) => FunctType::User,
        }
    }
}

impl std::fmt::Debug for FunctCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FunctCall::{}", self.kind())
    }
}

/// Everything needed to export a function.
#[derive(Debug, Clone)]
pub struct FunctSpec {
    name: String,
    owner_id: u32,
    call: FunctCall,
    uses_fp: bool,
    reentrant: bool,
}

impl FunctSpec {
    fn new(name: impl Into<String>, owner_id: u32, call: FunctCall) -> Self {
        Self {
            name: name.into(),
            owner_id,
            call,
            uses_fp: true,
            reentrant: false,
        }
    }

    /// A function called with the thread period.
    pub fn legacy<F>(name: impl Into<String>, owner_id: u32, f: F) -> Self
    where
        F: Fn(&Arena, i64) + Send + Sync + 'static,
    {
        Self::new(name, owner_id, FunctCall::Legacy(Arc::new(f)))
    }

    /// A function called with [`FunctArgs`].
    pub fn thread<F>(name: impl Into<String>, owner_id: u32, f: F) -> Self
    where
        F: Fn(&FunctArgs<'_>) + Send + Sync + 'static,
    {
        Self::new(name, owner_id, FunctCall::Thread(Arc::new(f)))
    }

    /// A function invoked by name through [`Hal::call_user_funct`].
    pub fn user<F>(name: impl Into<String>, owner_id: u32, f: F) -> Self
    where
        F: Fn(&[String]) -> HalResult<i32> + Send + Sync + 'static,
    {
        Self::new(name, owner_id, FunctCall::User(Arc::new(f)))
    }

    /// Whether the function uses floating point (default true).
    pub fn uses_fp(mut self, fp: bool) -> Self {
        self.uses_fp = fp;
        self
    }

    /// Whether the function may sit on several threads at once.
    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }
}

/// Snapshot of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctInfo {
    /// Function id
    pub id: u32,
    /// Function name
    pub name: String,
    /// Owning component or instance id
    pub owner_id: u32,
    /// Calling convention
    pub kind: FunctType,
    /// Needs a floating point thread
    pub uses_fp: bool,
    /// May be attached to more than one thread
    pub reentrant: bool,
    /// Number of thread entries calling it
    pub users: u32,
    /// True if the exporting process is this one
    pub local: bool,
}

const STAT_PINS: [(&str, HalType); 3] = [
    ("time", HalType::S32),
    ("tmax", HalType::S32),
    ("tmax-increased", HalType::Bit),
];

impl Hal {
    fn funct_info_at(&self, off: ShmOff) -> FunctInfo {
        let f = self.desc::<FunctDesc>(off);
        FunctInfo {
            id: f.hdr.id(),
            name: self.name_of(off).to_string(),
            owner_id: f.hdr.owner_id(),
            kind: f.kind(),
            uses_fp: f.uses_fp(),
            reentrant: f.reentrant(),
            users: f.users(),
            local: self.local().functs.contains_key(&f.hdr.id()),
        }
    }

    /// Create the instrumentation pins of function `name`, all or none.
    fn create_stat_pins(&self, g: &ArenaGuard<'_>, name: &str, owner_id: u32) -> HalResult<[PinPtr; 3]> {
        for (suffix, _) in STAT_PINS {
            self.check_unique(g, ObjectType::Pin, &format!("{name}.{suffix}"), owner_id)?;
        }
        let mut made: Vec<PinPtr> = Vec::with_capacity(STAT_PINS.len());
        for (suffix, ty) in STAT_PINS {
            let pin_name = format!("{name}.{suffix}");
            match self.new_pin_locked(g, owner_id, &pin_name, ty, PinDir::Out, true) {
                Ok(p) => made.push(p),
                Err(e) => {
                    for p in &made {
                        self.remove_pin_by_slot(g, owner_id, p.slot())?;
                    }
                    return Err(e);
                }
            }
        }
        Ok([made[0], made[1], made[2]])
    }

    /// Remove the pin of `owner_id` whose slot is `slot`.
    pub(crate) fn remove_pin_by_slot(&self, g: &ArenaGuard<'_>, owner_id: u32, slot: ShmOff) -> HalResult<()> {
        let found = self
            .collect(g, &Selector::of(ObjectType::Pin).owner(owner_id))
            .into_iter()
            .find(|&off| self.desc::<PinDesc>(off).slot() == slot);
        if let Some(off) = found {
            self.unlink_locked(g, off)?;
            self.retire(g, off)?;
        }
        Ok(())
    }

    /// Detach a function from every thread, then delete it and its pins.
    pub(crate) fn free_funct(&self, g: &ArenaGuard<'_>, off: ShmOff) -> HalResult<()> {
        for thread in self.collect(g, &Selector::of(ObjectType::Thread)) {
            if self.detach_funct(g, thread, off)? > 0 {
                self.refresh_plan(g, thread);
            }
        }
        let f = self.desc::<FunctDesc>(off);
        let (id, owner) = (f.hdr.id(), f.hdr.owner_id());
        let slots = [f.time, f.tmax, f.tmax_inc];
        let name = self.name_of(off).to_string();
        self.local().functs.remove(&id);
        if slots[0] != SHM_NULL {
            for slot in slots {
                self.remove_pin_by_slot(g, owner, slot)?;
            }
        }
        self.retire(g, off)?;
        debug!("Function '{}' deleted", name);
        Ok(())
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Export a function. The callable stays in this process; only this
    /// process can attach it to its threads.
    pub fn export_funct(&self, spec: FunctSpec) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::LOAD, "exporting functions")?;
            let FunctSpec {
                name,
                owner_id,
                call,
                uses_fp,
                reentrant,
            } = spec;
            self.check_owner(&g, owner_id, false)?;
            self.check_name(ObjectType::Funct, &name)?;
            self.check_unique(&g, ObjectType::Funct, &name, owner_id)?;

            let kind = call.kind();
            let slots = if kind == FunctType::User {
                [SHM_NULL; 3]
            } else {
                self.create_stat_pins(&g, &name, owner_id)?
                    .map(|p| p.slot())
            };
            let created = self.create_object(&g, &name, owner_id, |hdr| FunctDesc {
                hdr,
                kind: kind as u32,
                uses_fp: uses_fp as u32,
                reentrant: reentrant as u32,
                users: AtomicU32::new(0),
                time: slots[0],
                tmax: slots[1],
                tmax_inc: slots[2],
                _pad: 0,
            });
            let off = match created {
                Ok(off) => off,
                Err(e) => {
                    if slots[0] != SHM_NULL {
                        for slot in slots {
                            self.remove_pin_by_slot(&g, owner_id, slot)?;
                        }
                    }
                    return Err(e);
                }
            };
            let id = self.header(off).id();
            self.local().functs.insert(id, call);
            info!("Function '{}' ({}) exported", name, kind);
            Ok(id)
        })
    }

    /// Request memory barriers around every call of function `name`.
    pub fn set_funct_barriers(&self, name: &str, rmb: bool, wmb: bool) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Funct, name)?;
            let hdr = self.header(off);
            for (flag, on) in [(ObjectFlags::RMB, rmb), (ObjectFlags::WMB, wmb)] {
                if on {
                    hdr.set_flags(flag);
                } else {
                    hdr.clear_flags(flag);
                }
            }
            let threads: Vec<ShmOff> = self
                .collect(&g, &Selector::of(ObjectType::Thread))
                .into_iter()
                .filter(|&t| self.thread_calls(t, off))
                .collect();
            for t in threads {
                self.refresh_plan(&g, t);
            }
            Ok(())
        })
    }

    /// Invoke user function `name` with `args` and pass its return code
    /// through. The HAL mutex is not held during the call.
    pub fn call_user_funct(&self, name: &str, args: &[String]) -> HalResult<i32> {
        recording(|| {
            let call = {
                let g = self.guard()?;
                let off = self.require(&g, ObjectType::Funct, name)?;
                let f = self.desc::<FunctDesc>(off);
                if f.kind() != FunctType::User {
                    return Err(HalError::Invalid(format!(
                        "function '{name}' is a {} function, not a user function",
                        f.kind()
                    )));
                }
                self.local().functs.get(&f.hdr.id()).cloned()
            };
            match call {
                Some(FunctCall::User(f)) => {
                    debug!("Calling user function '{}' with {:?}", name, args);
                    f(args)
                }
                _ => Err(HalError::Permission(format!(
                    "function '{name}' was exported by another process"
                ))),
            }
        })
    }

    /// Snapshot of function `name`.
    pub fn funct_info(&self, name: &str) -> HalResult<FunctInfo> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.funct_info_at(self.require(&g, ObjectType::Funct, name)?))
        })
    }

    /// Snapshots of every function whose name starts with `prefix`.
    pub fn functs(&self, prefix: &str) -> HalResult<Vec<FunctInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Funct).prefix(prefix))
                .into_iter()
                .map(|off| self.funct_info_at(off))
                .collect())
        })
    }
}
