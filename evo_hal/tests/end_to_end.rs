//! End-to-end scenario: wire a component to itself through a signal, then
//! observe the value freeze on the unlinked input.

use evo_common::prelude::*;
use evo_hal::Hal;
use evo_shared_memory::segment::segment_path;
use std::io::Write;

#[test]
fn test_loopback_through_signal_then_unlink() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let a = hal.init("A")?;
    let out = hal.new_pin(a, "A.out", HalType::Float, PinDir::Out)?;
    let input = hal.new_pin(a, "A.in", HalType::Float, PinDir::In)?;
    hal.ready(a)?;

    hal.signal_new("s", HalType::Float)?;
    hal.link("A.out", "s")?;
    hal.link("A.in", "s")?;

    out.set_float(hal.arena(), 3.5);
    assert_eq!(input.get_float(hal.arena()), 3.5);

    hal.unlink("A.in")?;
    out.set_float(hal.arena(), 7.0);
    assert_eq!(input.get_float(hal.arena()), 3.5);
    assert_eq!(hal.signal_get("s")?, HalValue::Float(7.0));

    hal.exit(a)?;
    assert_eq!(hal.signal_info("s")?.pins.len(), 0);
    Ok(())
}

#[test]
fn test_two_handles_share_one_named_segment() -> HalResult<()> {
    let name = format!("evo_hal_e2e_{}", std::process::id());
    let mut config = HalConfig::default();
    config.segment.name = Some(name.clone());

    let first = Hal::open(config.clone())?;
    let c = first.init("producer")?;
    let out = first.new_pin(c, "producer.value", HalType::U32, PinDir::Out)?;
    first.ready(c)?;
    first.signal_new("shared", HalType::U32)?;
    first.link("producer.value", "shared")?;

    let second = Hal::open(config)?;
    out.set_u32(first.arena(), 99);
    assert_eq!(second.signal_get("shared")?, HalValue::U32(99));
    assert_eq!(second.comp_info("producer")?.id, c);

    drop(second);
    drop(first);
    assert!(!segment_path(&name).exists());
    Ok(())
}

#[test]
fn test_config_file_drives_open() -> Result<(), Box<dyn std::error::Error>> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        r#"
[scheduler]
mode = "manual"
base_period_ns = 500000

[change_detection]
epsilon = [0.5, 0.25]
"#
    )?;
    let config = evo_common::config::load_hal_config(file.path())?;
    let hal = Hal::open(config)?;

    assert_eq!(hal.epsilon(0)?, 0.5);
    assert_eq!(hal.epsilon(1)?, 0.25);
    assert_eq!(hal.epsilon(2)?, DEFAULT_EPSILON);

    hal.create_thread("servo", evo_hal::ThreadOptions::new(1_200_000))?;
    assert_eq!(hal.thread_info("servo")?.period_ns, 1_000_000);
    Ok(())
}
