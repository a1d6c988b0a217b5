//! Signals and pin linking.
//!
//! A signal is a named value word plus counters of the pins linked to it.
//! Linking rules:
//!
//! | pin dir | refused when                         | counter |
//! |---------|--------------------------------------|---------|
//! | In      | never                                | readers |
//! | Out     | signal has a writer or a bidir pin   | writers |
//! | Io      | signal has a writer                  | bidirs  |
//!
//! The first pin linked to an otherwise unconnected signal seeds the
//! signal with the pin's current value, so connecting a live output does
//! not glitch it to zero. Unlinking copies the signal value back into the
//! pin's dummy word for the same reason.

use crate::context::Hal;
use crate::error::recording;
use crate::object::{Descriptor, ObjectHeader};
use crate::pin::PinDesc;
use crate::registry::Selector;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{HalType, HalValue, ObjectType, PinDir};
use evo_shared_memory::{ArenaGuard, SHM_NULL, ShmOff};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

#[repr(C)]
pub(crate) struct SignalDesc {
    pub(crate) hdr: ObjectHeader,
    ty: u32,
    data: ShmOff,
    readers: AtomicU32,
    writers: AtomicU32,
    bidirs: AtomicU32,
    _pad: u32,
}

unsafe impl Descriptor for SignalDesc {
    const KIND: ObjectType = ObjectType::Signal;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl SignalDesc {
    pub(crate) fn ty(&self) -> HalType {
        HalType::from_u32(self.ty).unwrap_or(HalType::Bit)
    }

    /// Offset of the value word.
    pub(crate) fn data(&self) -> ShmOff {
        self.data
    }

    pub(crate) fn readers(&self) -> u32 {
        self.readers.load(Ordering::Acquire)
    }

    pub(crate) fn writers(&self) -> u32 {
        self.writers.load(Ordering::Acquire)
    }

    pub(crate) fn bidirs(&self) -> u32 {
        self.bidirs.load(Ordering::Acquire)
    }

    fn counter(&self, dir: PinDir) -> &AtomicU32 {
        match dir {
            PinDir::In => &self.readers,
            PinDir::Out => &self.writers,
            PinDir::Io => &self.bidirs,
        }
    }
}

/// Snapshot of a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalInfo {
    /// Signal id
    pub id: u32,
    /// Signal name
    pub name: String,
    /// Signal type
    pub ty: HalType,
    /// Current value
    pub value: HalValue,
    /// Linked input pins
    pub readers: u32,
    /// Linked output pins
    pub writers: u32,
    /// Linked bidirectional pins
    pub bidirs: u32,
    /// Names of linked pins
    pub pins: Vec<String>,
}

impl Hal {
    pub(crate) fn signal_value_at(&self, off: ShmOff) -> HalValue {
        let sig = self.desc::<SignalDesc>(off);
        HalValue::from_bits(
            sig.ty(),
            self.arena().value(sig.data()).load(Ordering::Relaxed),
        )
    }

    fn signal_info_at(&self, g: &ArenaGuard<'_>, off: ShmOff) -> SignalInfo {
        let sig = self.desc::<SignalDesc>(off);
        SignalInfo {
            id: sig.hdr.id(),
            name: self.name_of(off).to_string(),
            ty: sig.ty(),
            value: self.signal_value_at(off),
            readers: sig.readers(),
            writers: sig.writers(),
            bidirs: sig.bidirs(),
            pins: self
                .pins_of_signal(g, off)
                .into_iter()
                .map(|p| self.name_of(p).to_string())
                .collect(),
        }
    }

    pub(crate) fn link_locked(&self, _g: &ArenaGuard<'_>, pin_off: ShmOff, sig_off: ShmOff) -> HalResult<()> {
        let pin = self.desc::<PinDesc>(pin_off);
        let sig = self.desc::<SignalDesc>(sig_off);
        let (pin_name, sig_name) = (self.name_of(pin_off), self.name_of(sig_off));

        match pin.signal() {
            cur if cur == sig_off => return Ok(()),
            SHM_NULL => {}
            other => {
                return Err(HalError::Invalid(format!(
                    "pin '{pin_name}' is already linked to '{}'",
                    self.name_of(other)
                )));
            }
        }
        if pin.ty() != sig.ty() {
            return Err(HalError::Invalid(format!(
                "type mismatch: pin '{pin_name}' is {}, signal '{sig_name}' is {}",
                pin.ty(),
                sig.ty()
            )));
        }
        match pin.dir() {
            PinDir::Out if sig.writers() > 0 || sig.bidirs() > 0 => {
                return Err(HalError::Invalid(format!(
                    "signal '{sig_name}' already has a writer"
                )));
            }
            PinDir::Io if sig.writers() > 0 => {
                return Err(HalError::Invalid(format!(
                    "signal '{sig_name}' already has an output writer"
                )));
            }
            _ => {}
        }

        let arena = self.arena();
        if sig.readers() + sig.writers() + sig.bidirs() == 0 {
            let current = arena.value(pin.dummy()).load(Ordering::Relaxed);
            arena.value(sig.data()).store(current, Ordering::Relaxed);
        }
        arena.slot(pin.slot()).store(sig.data(), Ordering::Release);
        pin.set_signal(sig_off);
        sig.counter(pin.dir()).fetch_add(1, Ordering::AcqRel);
        debug!("Linked pin '{}' to signal '{}'", pin_name, sig_name);
        Ok(())
    }

    /// Detach the pin at `pin_off` from its signal, if any.
    pub(crate) fn unlink_locked(&self, _g: &ArenaGuard<'_>, pin_off: ShmOff) -> HalResult<()> {
        let pin = self.desc::<PinDesc>(pin_off);
        let sig_off = pin.signal();
        if sig_off == SHM_NULL {
            return Ok(());
        }
        let sig = self.desc::<SignalDesc>(sig_off);
        let arena = self.arena();
        let current = arena.value(sig.data()).load(Ordering::Relaxed);
        arena.value(pin.dummy()).store(current, Ordering::Relaxed);
        arena.slot(pin.slot()).store(pin.dummy(), Ordering::Release);
        pin.set_signal(SHM_NULL);
        let _ = sig
            .counter(pin.dir())
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        debug!(
            "Unlinked pin '{}' from signal '{}'",
            self.name_of(pin_off),
            self.name_of(sig_off)
        );
        Ok(())
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Create signal `name` of type `ty`, initialized to zero.
    pub fn signal_new(&self, name: &str, ty: HalType) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "creating signals")?;
            self.check_name(ObjectType::Signal, name)?;
            self.check_unique(&g, ObjectType::Signal, name, 0)?;
            let data = self.arena().alloc_value(&g)?;
            let off = self.create_object(&g, name, 0, |hdr| SignalDesc {
                hdr,
                ty: ty as u32,
                data,
                readers: AtomicU32::new(0),
                writers: AtomicU32::new(0),
                bidirs: AtomicU32::new(0),
                _pad: 0,
            })?;
            debug!("Signal '{}' {} created", name, ty);
            Ok(self.header(off).id())
        })
    }

    /// Create a signal from a raw type tag.
    pub fn signal_new_raw(&self, name: &str, ty: u32) -> HalResult<u32> {
        match HalType::from_u32(ty) {
            Some(ty) => self.signal_new(name, ty),
            None => recording(|| {
                Err(HalError::Invalid(format!(
                    "signal '{name}': unsupported type {ty}"
                )))
            }),
        }
    }

    /// Delete signal `name`, unlinking all its pins first.
    ///
    /// `Busy` while a group member or other holder references it.
    pub fn signal_delete(&self, name: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "deleting signals")?;
            let off = self.require(&g, ObjectType::Signal, name)?;
            if self.header(off).refcnt() > 0 {
                return Err(HalError::Busy(format!(
                    "signal '{name}' is referenced by {} group member(s)",
                    self.header(off).refcnt()
                )));
            }
            for pin in self.pins_of_signal(&g, off) {
                self.unlink_locked(&g, pin)?;
            }
            self.free_object(&g, off)?;
            debug!("Signal '{}' deleted", name);
            Ok(())
        })
    }

    /// Link pin `pin` to signal `signal`. Linking again to the same signal
    /// is a no-op.
    pub fn link(&self, pin: &str, signal: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "linking pins")?;
            let pin_off = self.require(&g, ObjectType::Pin, pin)?;
            let sig_off = self.require(&g, ObjectType::Signal, signal)?;
            self.link_locked(&g, pin_off, sig_off)
        })
    }

    /// Unlink pin `pin`. Unlinking an unlinked pin is a no-op.
    pub fn unlink(&self, pin: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "unlinking pins")?;
            let pin_off = self.require(&g, ObjectType::Pin, pin)?;
            self.unlink_locked(&g, pin_off)
        })
    }

    /// Current value of signal `name`.
    pub fn signal_get(&self, name: &str) -> HalResult<HalValue> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.signal_value_at(self.require(&g, ObjectType::Signal, name)?))
        })
    }

    /// Set signal `name`. Refused when an output pin drives it.
    pub fn signal_set(&self, name: &str, value: HalValue) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Signal, name)?;
            let sig = self.desc::<SignalDesc>(off);
            if sig.writers() > 0 {
                return Err(HalError::Invalid(format!(
                    "signal '{name}' is driven by an output pin"
                )));
            }
            if value.ty() != sig.ty() {
                return Err(HalError::Invalid(format!(
                    "signal '{name}' is {}, value is {}",
                    sig.ty(),
                    value.ty()
                )));
            }
            self.arena()
                .value(sig.data())
                .store(value.to_bits(), Ordering::Relaxed);
            Ok(())
        })
    }

    /// Snapshot of signal `name`.
    pub fn signal_info(&self, name: &str) -> HalResult<SignalInfo> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, ObjectType::Signal, name)?;
            Ok(self.signal_info_at(&g, off))
        })
    }

    /// Snapshots of every signal whose name starts with `prefix`.
    pub fn signals(&self, prefix: &str) -> HalResult<Vec<SignalInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Signal).prefix(prefix))
                .into_iter()
                .map(|off| self.signal_info_at(&g, off))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::PinPtr;

    struct Rig {
        hal: Hal,
        out: PinPtr,
        out2: PinPtr,
        input: PinPtr,
    }

    fn rig(ty: HalType) -> Rig {
        let hal = Hal::anonymous().unwrap();
        let c = hal.init("rig").unwrap();
        let out = hal.new_pin(c, "rig.out", ty, PinDir::Out).unwrap();
        let out2 = hal.new_pin(c, "rig.out2", ty, PinDir::Out).unwrap();
        let input = hal.new_pin(c, "rig.in", ty, PinDir::In).unwrap();
        hal.new_pin(c, "rig.io", ty, PinDir::Io).unwrap();
        hal.ready(c).unwrap();
        Rig {
            hal,
            out,
            out2,
            input,
        }
    }

    #[test]
    fn test_first_link_seeds_signal() {
        let r = rig(HalType::Float);
        r.out.set_float(r.hal.arena(), 3.5);
        r.hal.signal_new("sig", HalType::Float).unwrap();
        r.hal.link("rig.out", "sig").unwrap();
        assert_eq!(r.hal.signal_get("sig").unwrap(), HalValue::Float(3.5));

        r.hal.link("rig.in", "sig").unwrap();
        assert_eq!(r.input.get_float(r.hal.arena()), 3.5);
        r.out.set_float(r.hal.arena(), 7.0);
        assert_eq!(r.input.get_float(r.hal.arena()), 7.0);
    }

    #[test]
    fn test_second_writer_rejected() {
        let r = rig(HalType::Bit);
        r.hal.signal_new("sig", HalType::Bit).unwrap();
        r.hal.link("rig.out", "sig").unwrap();
        assert!(matches!(r.hal.link("rig.out2", "sig"), Err(HalError::Invalid(_))));
        assert!(matches!(r.hal.link("rig.io", "sig"), Err(HalError::Invalid(_))));
        // Relinking to the same signal is fine
        r.hal.link("rig.out", "sig").unwrap();
        assert_eq!(r.hal.signal_info("sig").unwrap().writers, 1);
    }

    #[test]
    fn test_output_refused_after_bidir() {
        let r = rig(HalType::S32);
        r.hal.signal_new("bus", HalType::S32).unwrap();
        r.hal.link("rig.io", "bus").unwrap();
        assert!(r.hal.link("rig.out", "bus").is_err());
        r.hal.link("rig.in", "bus").unwrap();
        let info = r.hal.signal_info("bus").unwrap();
        assert_eq!((info.readers, info.writers, info.bidirs), (1, 0, 1));
        assert_eq!(info.pins, ["rig.in", "rig.io"]);
    }

    #[test]
    fn test_type_mismatch_and_relink_rejected() {
        let r = rig(HalType::U32);
        r.hal.signal_new("a", HalType::U32).unwrap();
        r.hal.signal_new("b", HalType::U32).unwrap();
        r.hal.signal_new("f", HalType::Float).unwrap();
        assert!(r.hal.link("rig.in", "f").is_err());
        r.hal.link("rig.in", "a").unwrap();
        assert!(r.hal.link("rig.in", "b").is_err());
    }

    #[test]
    fn test_unlink_keeps_last_value() {
        let r = rig(HalType::S32);
        r.hal.signal_new("sig", HalType::S32).unwrap();
        r.hal.link("rig.in", "sig").unwrap();
        r.hal.signal_set("sig", HalValue::S32(-12)).unwrap();
        r.hal.unlink("rig.in").unwrap();
        assert_eq!(r.input.get_s32(r.hal.arena()), -12);
        r.hal.signal_set("sig", HalValue::S32(5)).unwrap();
        assert_eq!(r.input.get_s32(r.hal.arena()), -12);
        r.hal.unlink("rig.in").unwrap();
        assert_eq!(r.hal.signal_info("sig").unwrap().readers, 0);
    }

    #[test]
    fn test_set_refused_with_writer() {
        let r = rig(HalType::Bit);
        r.hal.signal_new("sig", HalType::Bit).unwrap();
        r.hal.signal_set("sig", HalValue::Bit(true)).unwrap();
        r.hal.link("rig.out2", "sig").unwrap();
        assert!(r.hal.signal_set("sig", HalValue::Bit(false)).is_err());
        assert!(!r.out2.get_bit(r.hal.arena()));
    }

    #[test]
    fn test_delete_unlinks_pins() {
        let r = rig(HalType::Float);
        r.hal.signal_new("sig", HalType::Float).unwrap();
        r.hal.link("rig.in", "sig").unwrap();
        r.hal.signal_set("sig", HalValue::Float(1.25)).unwrap();
        r.hal.signal_delete("sig").unwrap();
        assert_eq!(r.hal.pin_info("rig.in").unwrap().signal, None);
        assert_eq!(r.input.get_float(r.hal.arena()), 1.25);
    }

    #[test]
    fn test_config_lock_blocks_linking() {
        let r = rig(HalType::Bit);
        r.hal.signal_new("sig", HalType::Bit).unwrap();
        r.hal.set_lock_level(LockLevel::CONFIG).unwrap();
        assert!(matches!(r.hal.link("rig.in", "sig"), Err(HalError::Permission(_))));
        assert!(matches!(r.hal.signal_new("s2", HalType::Bit), Err(HalError::Permission(_))));
    }

    #[test]
    fn test_unsupported_signal_type() {
        let hal = Hal::anonymous().unwrap();
        assert!(matches!(hal.signal_new_raw("s", 0), Err(HalError::Invalid(_))));
    }
}
