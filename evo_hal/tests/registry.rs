//! Registry integration tests: uniqueness, iteration, references, sweep.

use evo_common::prelude::*;
use evo_hal::{Cursor, Hal, Selector, Visit};

#[test]
fn test_names_are_unique_per_type() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    hal.signal_new("feed", HalType::Float)?;
    assert!(matches!(
        hal.signal_new("feed", HalType::Bit),
        Err(HalError::Exists { kind: ObjectType::Signal, .. })
    ));

    // Same name, different type of object
    hal.group_new("feed", 0, 0)?;

    hal.signal_delete("feed")?;
    hal.signal_new("feed", HalType::Bit)?;
    assert_eq!(hal.signal_info("feed")?.ty, HalType::Bit);
    Ok(())
}

#[test]
fn test_selector_filters_and_stops() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let comp = hal.init("axis")?;
    for n in ["axis.pos", "axis.vel", "axis.acc"] {
        hal.new_pin(comp, n, HalType::Float, PinDir::Out)?;
    }
    hal.signal_new("axis.cmd", HalType::Float)?;

    assert_eq!(hal.count(&Selector::of(ObjectType::Pin).owner(comp))?, 3);
    assert_eq!(hal.count(&Selector::all().prefix("axis."))?, 4);

    let mut first = None;
    let visited = hal.foreach(&Selector::of(ObjectType::Pin).owner(comp), |obj| {
        first = Some(obj.name.clone());
        Visit::Stop
    })?;
    assert_eq!(visited, 1);
    assert_eq!(first.as_deref(), Some("axis.acc"));

    let err = hal
        .foreach(&Selector::of(ObjectType::Pin), |_| {
            Visit::Fail(HalError::Invalid("stop here".into()))
        })
        .unwrap_err();
    assert_eq!(err, HalError::Invalid("stop here".into()));
    Ok(())
}

#[test]
fn test_cursor_survives_deletion_between_steps() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    for n in ["a", "b", "c", "d"] {
        hal.signal_new(n, HalType::U32)?;
    }
    let mut cursor = Cursor::new(Selector::of(ObjectType::Signal));
    let mut seen = Vec::new();
    while let Some(obj) = hal.next_object(&mut cursor)? {
        if obj.name == "b" {
            hal.signal_delete("c")?;
        }
        seen.push(obj.name);
    }
    assert_eq!(seen, ["a", "b", "d"]);
    Ok(())
}

#[test]
fn test_sweep_never_frees_referenced_objects() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    hal.signal_new("held", HalType::S32)?;
    hal.group_new("grp", 0, 0)?;
    hal.member_new("grp", "held", MEMBER_MONITOR_CHANGE, 0)?;

    assert!(matches!(hal.signal_delete("held"), Err(HalError::Busy(_))));

    hal.invalidate(ObjectType::Signal, "held")?;
    assert!(hal.lookup(ObjectType::Signal, "held").is_err());
    assert_eq!(hal.sweep()?, 0);
    assert_eq!(hal.count(&Selector::of(ObjectType::Signal).with_invalid())?, 1);

    hal.member_delete("grp", "held")?;
    assert_eq!(hal.sweep()?, 1);
    assert_eq!(hal.count(&Selector::of(ObjectType::Signal).with_invalid())?, 0);
    Ok(())
}

#[test]
fn test_last_error_is_recorded() {
    let hal = Hal::anonymous().unwrap();
    let before = evo_hal::error_count(false);
    let err = hal.pin_info("no.such.pin").unwrap_err();
    assert_eq!(err.errno(), -libc::ENOENT);
    assert!(evo_hal::error_count(false) > before);
    assert!(evo_hal::last_error().is_some());
}

fn retired(hal: &Hal, kind: ObjectType) -> usize {
    hal.list(&Selector::of(kind).with_invalid())
        .unwrap()
        .into_iter()
        .filter(|o| !o.valid)
        .count()
}

#[test]
fn test_exited_component_is_swept_once_unreferenced() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let c = hal.init("leak")?;
    hal.new_pin(c, "leak.out", HalType::U32, PinDir::Out)?;
    hal.ready(c)?;

    let cc = hal.compile_component("leak")?;
    hal.exit(c)?;
    assert!(hal.comp_info("leak").is_err());
    assert_eq!(retired(&hal, ObjectType::Component), 1);
    assert_eq!(hal.sweep()?, 0);

    drop(cc);
    assert_eq!(hal.unref_component("leak")?, 0);
    assert_eq!(hal.sweep()?, 1);
    assert_eq!(retired(&hal, ObjectType::Component), 0);
    Ok(())
}

#[test]
fn test_compiled_view_release_survives_exit_and_reuse() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let old = hal.init("drv")?;
    hal.ready(old)?;
    let cc = hal.compile_component("drv")?;
    hal.exit(old)?;

    // A new component may take the retired name
    let new = hal.init("drv")?;
    hal.ready(new)?;
    assert_eq!(cc.release(&hal)?, 0);
    assert_eq!(hal.lookup(ObjectType::Component, "drv")?.id, new);
    assert_eq!(hal.sweep()?, 1);
    assert_eq!(retired(&hal, ObjectType::Component), 0);

    hal.group_new("g", 0, 0)?;
    let cg = hal.compile_group("g")?;
    assert_eq!(cg.release(&hal)?, 0);
    hal.group_delete("g")?;
    Ok(())
}

#[test]
fn test_decref_reaches_invalidated_objects() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    hal.signal_new("s", HalType::Float)?;
    hal.incref(ObjectType::Signal, "s")?;
    hal.invalidate(ObjectType::Signal, "s")?;
    assert_eq!(hal.sweep()?, 0);

    assert_eq!(hal.decref(ObjectType::Signal, "s")?, 0);
    assert_eq!(hal.sweep()?, 1);
    assert_eq!(hal.count(&Selector::of(ObjectType::Signal).with_invalid())?, 0);
    Ok(())
}
