//! Compiled groups: flattened, change-tracking views of a group.
//!
//! Compiling resolves nested groups once, so matching and reporting never
//! touch the registry or the HAL mutex. The compiled view holds a
//! reference on its group; dropping the view does not release it, call
//! [`CompiledGroup::release`] or [`Hal::unref_group`] for that.
//!
//! # Usage
//!
//! ```rust
//! use evo_hal::{Hal, ReportEvent};
//! use evo_common::prelude::*;
//!
//! # fn main() -> HalResult<()> {
//! let hal = Hal::anonymous()?;
//! hal.signal_new("x", HalType::Float)?;
//! hal.group_new("watch", 0, GROUP_REPORT_ON_CHANGE)?;
//! hal.member_new("watch", "x", MEMBER_MONITOR_CHANGE, 0)?;
//!
//! let mut cg = hal.compile_group("watch")?;
//! hal.signal_set("x", HalValue::Float(1.0))?;
//! if cg.match_changes() > 0 {
//!     cg.report(false, |ev| {
//!         if let ReportEvent::Member { name, value, .. } = ev {
//!             println!("{name} = {value}");
//!         }
//!         Ok::<(), HalError>(())
//!     })?;
//! }
//! cg.release(&hal)?;
//! # Ok(())
//! # }
//! ```

use crate::context::Hal;
use crate::data::HalData;
use crate::error::recording;
use crate::group::{GroupDesc, MemberDesc};
use crate::signal::SignalDesc;
use evo_common::hal::consts::{
    GROUP_MONITOR_ALL_MEMBERS, GROUP_REPORT_ON_CHANGE, MAX_NESTED_GROUPS, MEMBER_MONITOR_CHANGE,
};
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::types::{HalType, HalValue, ObjectType};
use evo_shared_memory::{Arena, ArenaGuard, SHM_NULL, ShmOff};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::debug;

/// One step of a change report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportEvent<'a> {
    /// Start of a report
    Begin {
        /// Group or component name
        name: &'a str,
    },
    /// A reported signal or pin
    Member {
        /// Signal or pin name
        name: &'a str,
        /// Current value
        value: HalValue,
        /// Whether the last match saw it change
        changed: bool,
    },
    /// End of a report
    End {
        /// Group or component name
        name: &'a str,
        /// Number of `Member` events sent
        reported: usize,
    },
}

/// Value word watched by a compiled view.
#[derive(Debug, Clone)]
pub(crate) struct Watched {
    pub(crate) name: String,
    pub(crate) ty: HalType,
    pub(crate) eps_index: usize,
    pub(crate) monitored: bool,
}

/// Changed-detection core shared by compiled groups and components.
#[derive(Debug)]
pub(crate) struct Tracker {
    arena: Arc<Arena>,
    root: ShmOff,
    pub(crate) items: Vec<Watched>,
    monitored: Vec<usize>,
    tracking: Vec<u64>,
    changed: Vec<bool>,
}

impl Tracker {
    /// `read` resolves an item index to its current value word.
    pub(crate) fn new(arena: Arc<Arena>, root: ShmOff, items: Vec<Watched>, read: impl Fn(&Arena, usize) -> u64) -> Self {
        let monitored: Vec<usize> = items
            .iter()
            .enumerate()
            .filter_map(|(i, w)| w.monitored.then_some(i))
            .collect();
        let tracking = monitored.iter().map(|&i| read(&*arena, i)).collect();
        let changed = vec![false; items.len()];
        Self {
            arena,
            root,
            items,
            monitored,
            tracking,
            changed,
        }
    }

    pub(crate) fn monitored(&self) -> usize {
        self.monitored.len()
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    fn epsilon(&self, index: usize) -> f64 {
        // Root record lives as long as the segment this Arc keeps mapped
        unsafe { self.arena.get::<HalData>(self.root) }.epsilon(index)
    }

    pub(crate) fn match_changes(&mut self, read: impl Fn(&Arena, usize) -> u64) -> usize {
        if self.monitored.is_empty() {
            return 1;
        }
        self.changed.fill(false);
        let mut n = 0;
        for (k, &i) in self.monitored.iter().enumerate() {
            let item = &self.items[i];
            let cur = read(&*self.arena, i);
            let old = self.tracking[k];
            let differs = match item.ty {
                HalType::Float => {
                    (f64::from_bits(cur) - f64::from_bits(old)).abs() > self.epsilon(item.eps_index)
                }
                HalType::Bit => (cur & 1) != (old & 1),
                HalType::S32 | HalType::U32 => cur as u32 != old as u32,
            };
            if differs {
                self.tracking[k] = cur;
                self.changed[i] = true;
                n += 1;
            }
        }
        n
    }

    pub(crate) fn report<E, F>(&mut self, name: &str, all: bool, read: impl Fn(&Arena, usize) -> u64, mut cb: F) -> Result<usize, E>
    where
        F: FnMut(ReportEvent<'_>) -> Result<(), E>,
    {
        cb(ReportEvent::Begin { name })?;
        let mut reported = 0;
        for (i, item) in self.items.iter().enumerate() {
            if !(all || self.changed[i]) {
                continue;
            }
            cb(ReportEvent::Member {
                name: &item.name,
                value: HalValue::from_bits(item.ty, read(&*self.arena, i)),
                changed: self.changed[i],
            })?;
            reported += 1;
        }
        cb(ReportEvent::End { name, reported })?;
        Ok(reported)
    }
}

/// Flattened view of a group's signals.
#[derive(Debug)]
pub struct CompiledGroup {
    name: String,
    group_id: u32,
    userarg1: u32,
    flags: u32,
    data: Vec<ShmOff>,
    tracker: Tracker,
}

impl CompiledGroup {
    fn read(data: &[ShmOff]) -> impl Fn(&Arena, usize) -> u64 + '_ {
        move |arena: &Arena, i: usize| arena.value(data[i]).load(Ordering::Relaxed)
    }

    /// Name of the compiled group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the compiled group.
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// The group's first user argument.
    pub fn userarg1(&self) -> u32 {
        self.userarg1
    }

    /// Number of signals after flattening.
    pub fn members(&self) -> usize {
        self.data.len()
    }

    /// Number of signals watched for changes.
    pub fn monitored(&self) -> usize {
        self.tracker.monitored()
    }

    /// Compare every monitored signal with its tracked value.
    ///
    /// Returns the number of changed signals, or 1 when nothing is
    /// monitored so unconditional reporting still fires.
    pub fn match_changes(&mut self) -> usize {
        self.tracker.match_changes(Self::read(&self.data))
    }

    /// Report members to `cb`, framed by `Begin` and `End`.
    ///
    /// Groups flagged `GROUP_REPORT_ON_CHANGE` with monitored members only
    /// report members the last [`CompiledGroup::match_changes`] saw change,
    /// unless `force_all`. An error from `cb` aborts the report.
    pub fn report<E, F>(&mut self, force_all: bool, cb: F) -> Result<usize, E>
    where
        F: FnMut(ReportEvent<'_>) -> Result<(), E>,
    {
        let on_change = self.flags & GROUP_REPORT_ON_CHANGE != 0;
        let all = force_all || !(on_change && self.tracker.monitored() > 0);
        self.tracker
            .report(&self.name, all, Self::read(&self.data), cb)
    }
    /// Free the view and drop the reference [`Hal::compile_group`] took.
    pub fn release(self, hal: &Hal) -> HalResult<u32> {
        recording(|| {
            let g = hal.guard()?;
            hal.decref_id(&g, ObjectType::Group, self.group_id)
        })
    }
}

type NestStack = heapless::Vec<ShmOff, MAX_NESTED_GROUPS>;

impl Hal {
    fn nesting_error(&self, stack: &NestStack, next: ShmOff) -> HalError {
        let chain: Vec<&str> = stack
            .iter()
            .chain(std::iter::once(&next))
            .map(|&off| self.name_of(off))
            .collect();
        HalError::NestingTooDeep {
            stack: chain.join(" -> "),
        }
    }

    fn flatten(
        &self,
        g: &ArenaGuard<'_>,
        group: ShmOff,
        monitor_all: bool,
        stack: &mut NestStack,
        out: &mut Vec<(Watched, ShmOff)>,
    ) -> HalResult<()> {
        if stack.push(group).is_err() {
            return Err(self.nesting_error(stack, group));
        }
        for m in self.members_of(g, self.header(group).id()) {
            let mem = self.desc::<MemberDesc>(m);
            if mem.sig != SHM_NULL {
                let sig = self.desc::<SignalDesc>(mem.sig);
                out.push((
                    Watched {
                        name: self.name_of(mem.sig).to_string(),
                        ty: sig.ty(),
                        eps_index: mem.eps_index as usize,
                        monitored: monitor_all || mem.flags & MEMBER_MONITOR_CHANGE != 0,
                    },
                    sig.data(),
                ));
            } else if mem.group != SHM_NULL {
                self.flatten(g, mem.group, monitor_all, stack, out)?;
            }
        }
        stack.pop();
        Ok(())
    }

    /// Compile group `name` into a change-tracking view and take a
    /// reference on the group.
    pub fn compile_group(&self, name: &str) -> HalResult<CompiledGroup> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Group, name)?;
            let grp = self.desc::<GroupDesc>(off);
            let monitor_all = grp.flags() & GROUP_MONITOR_ALL_MEMBERS != 0;

            let mut flat = Vec::new();
            self.flatten(&g, off, monitor_all, &mut NestStack::new(), &mut flat)?;
            let (items, data): (Vec<Watched>, Vec<ShmOff>) = flat.into_iter().unzip();
            let tracker = Tracker::new(self.arena_arc(), self.root(), items, CompiledGroup::read(&data));
            grp.hdr.incref();
            debug!(
                "Compiled group '{}': {} member(s), {} monitored",
                name,
                data.len(),
                tracker.monitored()
            );
            Ok(CompiledGroup {
                name: name.to_string(),
                group_id: grp.hdr.id(),
                userarg1: grp.userarg1(),
                flags: grp.flags(),
                data,
                tracker,
            })
        })
    }
}
