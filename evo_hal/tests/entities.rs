//! Entity model integration tests: linking rules, value continuity and
//! ownership cascades.

use evo_common::prelude::*;
use evo_hal::{FunctSpec, Hal, InstanceHooks, Selector};

fn count(hal: &Hal, kind: ObjectType) -> usize {
    hal.count(&Selector::of(kind)).unwrap()
}

#[test]
fn test_single_writer_per_signal() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let c = hal.init("drv")?;
    hal.new_pin(c, "drv.out0", HalType::Bit, PinDir::Out)?;
    hal.new_pin(c, "drv.out1", HalType::Bit, PinDir::Out)?;
    hal.new_pin(c, "drv.io", HalType::Bit, PinDir::Io)?;
    hal.new_pin(c, "drv.in", HalType::Float, PinDir::In)?;
    hal.ready(c)?;
    hal.signal_new("enable", HalType::Bit)?;
    hal.signal_new("other", HalType::Bit)?;

    hal.link("drv.out0", "enable")?;
    assert!(matches!(hal.link("drv.out1", "enable"), Err(HalError::Invalid(_))));
    assert!(hal.link("drv.io", "enable").is_err());
    assert_eq!(hal.signal_info("enable")?.writers, 1);
    assert_eq!(hal.pin_info("drv.out1")?.signal, None);

    // Idempotent relink, refused move
    hal.link("drv.out0", "enable")?;
    assert_eq!(hal.signal_info("enable")?.writers, 1);
    assert!(hal.link("drv.out0", "other").is_err());

    // Type mismatch
    assert!(hal.link("drv.in", "other").is_err());
    Ok(())
}

#[test]
fn test_value_survives_unlink_and_relink() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let c = hal.init("enc")?;
    let counts = hal.new_pin(c, "enc.counts", HalType::S32, PinDir::Out)?;
    hal.ready(c)?;

    counts.set_s32(hal.arena(), -12);
    hal.signal_new("first", HalType::S32)?;
    hal.link("enc.counts", "first")?;
    assert_eq!(hal.signal_get("first")?, HalValue::S32(-12));

    counts.set_s32(hal.arena(), 40);
    assert_eq!(hal.signal_get("first")?, HalValue::S32(40));
    hal.unlink("enc.counts")?;
    assert_eq!(counts.get_s32(hal.arena()), 40);

    hal.signal_new("second", HalType::S32)?;
    hal.link("enc.counts", "second")?;
    assert_eq!(hal.signal_get("second")?, HalValue::S32(40));
    assert_eq!(hal.signal_get("first")?, HalValue::S32(40));
    Ok(())
}

#[test]
fn test_signal_writes_respect_writers() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let c = hal.init("w")?;
    hal.new_pin(c, "w.out", HalType::U32, PinDir::Out)?;
    hal.new_pin(c, "w.in", HalType::U32, PinDir::In)?;
    hal.ready(c)?;
    hal.signal_new("v", HalType::U32)?;

    hal.link("w.in", "v")?;
    hal.signal_set("v", HalValue::U32(5))?;
    assert_eq!(hal.pin_value("w.in")?, HalValue::U32(5));
    assert!(hal.pin_set("w.in", HalValue::U32(1)).is_err());

    hal.link("w.out", "v")?;
    assert!(hal.signal_set("v", HalValue::U32(6)).is_err());
    assert!(hal.signal_set("v", HalValue::Bit(true)).is_err());
    Ok(())
}

#[test]
fn test_params_obey_direction_and_lock() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let c = hal.init("pid")?;
    let gain = hal.new_param(c, "pid.gain", HalType::Float, ParamDir::Rw)?;
    hal.new_param(c, "pid.errors", HalType::U32, ParamDir::Ro)?;
    hal.ready(c)?;

    hal.param_set("pid.gain", HalValue::Float(0.75))?;
    assert_eq!(gain.get(hal.arena()), HalValue::Float(0.75));
    assert!(matches!(
        hal.param_set("pid.errors", HalValue::U32(1)),
        Err(HalError::Invalid(_))
    ));

    hal.set_lock_level(LockLevel::PARAMS)?;
    assert!(matches!(
        hal.param_set("pid.gain", HalValue::Float(1.0)),
        Err(HalError::Permission(_))
    ));
    hal.set_lock_level(LockLevel::NONE)?;

    hal.param_alias("pid.gain", Some("kp"))?;
    assert_eq!(hal.param_get("kp")?, HalValue::Float(0.75));
    hal.param_alias("kp", None)?;
    assert!(hal.param_get("pid.gain").is_ok());
    Ok(())
}

#[test]
fn test_exit_removes_exactly_the_owned_set() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let keep = hal.init("keep")?;
    hal.new_pin(keep, "keep.in", HalType::Float, PinDir::In)?;
    hal.new_param(keep, "keep.p", HalType::S32, ParamDir::Rw)?;
    hal.ready(keep)?;

    let hooks = InstanceHooks::new(|hal, req| {
        let inst = hal.inst_create(req.comp_id, req.name, 16)?;
        hal.new_pin(inst.id, &format!("{}.q", req.name), HalType::Bit, PinDir::Out)?;
        hal.new_param(inst.id, &format!("{}.delay", req.name), HalType::U32, ParamDir::Rw)?;
        Ok(())
    });
    let gone = hal.init_instantiable("gone", CompType::Realtime, hooks)?;
    hal.new_pin(gone, "gone.out", HalType::Float, PinDir::Out)?;
    hal.export_funct(FunctSpec::legacy("gone.update", gone, |_, _| {}))?;
    hal.ready(gone)?;
    hal.new_instance("gone", "gone.0", &[])?;
    hal.new_instance("gone", "gone.1", &[])?;

    hal.signal_new("wire", HalType::Float)?;
    hal.link("gone.out", "wire")?;
    hal.link("keep.in", "wire")?;

    let pins = count(&hal, ObjectType::Pin);
    let params = count(&hal, ObjectType::Param);
    let functs = count(&hal, ObjectType::Funct);

    hal.exit(gone)?;

    // gone.out, two instance pins and the function's three stat pins
    assert_eq!(pins - count(&hal, ObjectType::Pin), 6);
    assert_eq!(params - count(&hal, ObjectType::Param), 2);
    assert_eq!(functs - count(&hal, ObjectType::Funct), 1);
    assert_eq!(count(&hal, ObjectType::Instance), 0);
    assert!(hal.comp_info("gone").is_err());

    let wire = hal.signal_info("wire")?;
    assert_eq!(wire.writers, 0);
    assert_eq!(wire.pins, ["keep.in"]);
    assert!(hal.pin_info("keep.in").is_ok());
    Ok(())
}

#[test]
fn test_ready_components_accept_no_new_pins() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let c = hal.init("late")?;
    hal.ready(c)?;
    assert!(hal.new_pin(c, "late.x", HalType::Bit, PinDir::In).is_err());
    assert!(matches!(hal.ready(c), Err(HalError::Invalid(_))));
    Ok(())
}
