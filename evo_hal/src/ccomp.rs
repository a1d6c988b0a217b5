//! Compiled components: change tracking over every pin of a component.
//!
//! A lighter alternative to groups for reporting a whole component. The
//! view covers the component's own pins and those of its instances, reads
//! each pin through its slot (so later linking is followed) and uses the
//! pin's epsilon index for floats. Compiling references the component;
//! drop it with [`CompiledComp::release`] or [`Hal::unref_component`].

use crate::cgroup::{ReportEvent, Tracker, Watched};
use crate::context::Hal;
use crate::error::recording;
use crate::pin::{PinDesc, PinPtr};
use crate::registry::Selector;
use evo_common::hal::error::HalResult;
use evo_common::hal::types::{HalValue, ObjectType};
use evo_shared_memory::Arena;
use tracing::debug;

/// Change-tracking view of one component's pins.
#[derive(Debug)]
pub struct CompiledComp {
    name: String,
    comp_id: u32,
    pins: Vec<PinPtr>,
    tracker: Tracker,
}

impl CompiledComp {
    fn read(pins: &[PinPtr]) -> impl Fn(&Arena, usize) -> u64 + '_ {
        move |arena: &Arena, i: usize| pins[i].get(arena).to_bits()
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component id.
    pub fn comp_id(&self) -> u32 {
        self.comp_id
    }

    /// Number of pins covered.
    pub fn pins(&self) -> usize {
        self.pins.len()
    }

    /// Compare every pin with its tracked value; returns the number
    /// changed, or 1 for a component without pins.
    pub fn match_changes(&mut self) -> usize {
        self.tracker.match_changes(Self::read(&self.pins))
    }

    /// Report pins the last match saw change, or all with
    /// `force_all`, framed by `Begin` and `End`.
    pub fn report<E, F>(&mut self, force_all: bool, cb: F) -> Result<usize, E>
    where
        F: FnMut(ReportEvent<'_>) -> Result<(), E>,
    {
        let all = force_all || self.tracker.monitored() == 0;
        self.tracker.report(&self.name, all, Self::read(&self.pins), cb)
    }

    /// Current value of the `i`th pin in name order.
    pub fn value(&self, i: usize) -> Option<HalValue> {
        self.pins.get(i).map(|p| p.get(self.tracker.arena()))
    }
    /// Free the view and drop the reference [`Hal::compile_component`]
    /// took, even if the component has exited since.
    pub fn release(self, hal: &Hal) -> HalResult<u32> {
        recording(|| {
            let g = hal.guard()?;
            hal.decref_id(&g, ObjectType::Component, self.comp_id)
        })
    }
}

impl Hal {
    /// Compile every pin of component `name` into a change-tracking view
    /// and take a reference on the component.
    pub fn compile_component(&self, name: &str) -> HalResult<CompiledComp> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Component, name)?;
            let comp_id = self.header(off).id();
            let (items, pins): (Vec<Watched>, Vec<PinPtr>) = self
                .collect(&g, &Selector::of(ObjectType::Pin).owning_comp(comp_id))
                .into_iter()
                .map(|p| {
                    let pin = self.desc::<PinDesc>(p);
                    (
                        Watched {
                            name: self.name_of(p).to_string(),
                            ty: pin.ty(),
                            eps_index: pin.eps_index(),
                            monitored: true,
                        },
                        pin.ptr(),
                    )
                })
                .unzip();
            let tracker = Tracker::new(self.arena_arc(), self.root(), items, CompiledComp::read(&pins));
            self.header(off).incref();
            debug!("Compiled component '{}': {} pin(s)", name, pins.len());
            Ok(CompiledComp {
                name: name.to_string(),
                comp_id,
                pins,
                tracker,
            })
        })
    }

    /// Drop the reference taken by [`Hal::compile_component`].
    pub fn unref_component(&self, name: &str) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require_retained(&g, ObjectType::Component, name)?;
            self.decref_id(&g, ObjectType::Component, self.header(off).id())
        })
    }
}
