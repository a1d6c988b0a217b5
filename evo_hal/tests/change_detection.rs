//! Change-detection integration tests: epsilon matching, nested groups,
//! report framing and compiled components.

use evo_common::prelude::*;
use evo_hal::{Hal, ReportEvent};

fn reported(events: &mut Vec<String>) -> impl FnMut(ReportEvent<'_>) -> Result<(), HalError> + '_ {
    move |ev| {
        events.push(match ev {
            ReportEvent::Begin { name } => format!("begin {name}"),
            ReportEvent::Member { name, value, changed } => {
                format!("{name}={value}{}", if changed { "*" } else { "" })
            }
            ReportEvent::End { name, reported } => format!("end {name} {reported}"),
        });
        Ok(())
    }
}

#[test]
fn test_float_member_respects_epsilon() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    hal.set_epsilon(1, 0.01)?;
    hal.signal_new("temp", HalType::Float)?;
    hal.group_new("g", 0, GROUP_REPORT_ON_CHANGE)?;
    hal.member_new("g", "temp", MEMBER_MONITOR_CHANGE, 1)?;
    let mut cg = hal.compile_group("g")?;

    for (value, expect) in [(0.005, 0), (0.0101, 1), (0.015, 0), (-0.5, 1), (-0.5, 0)] {
        hal.signal_set("temp", HalValue::Float(value))?;
        assert_eq!(cg.match_changes(), expect, "value {value}");
    }
    Ok(())
}

#[test]
fn test_nested_groups_flatten_with_top_level_flags() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    for (n, ty) in [("x", HalType::S32), ("y", HalType::S32), ("flag", HalType::Bit)] {
        hal.signal_new(n, ty)?;
    }
    hal.group_new("inner", 0, 0)?;
    hal.member_new("inner", "x", 0, 0)?;
    hal.member_new("inner", "y", 0, 0)?;
    hal.group_new("outer", 7, GROUP_MONITOR_ALL_MEMBERS | GROUP_REPORT_ON_CHANGE)?;
    hal.member_new("outer", "flag", 0, 0)?;
    hal.member_new("outer", "inner", 0, 0)?;

    assert!(matches!(hal.group_delete("inner"), Err(HalError::Busy(_))));

    let mut cg = hal.compile_group("outer")?;
    assert_eq!(cg.userarg1(), 7);
    assert_eq!(cg.members(), 3);
    assert_eq!(cg.monitored(), 3);

    hal.signal_set("y", HalValue::S32(-1))?;
    assert_eq!(cg.match_changes(), 1);
    let mut events = Vec::new();
    assert_eq!(cg.report(false, reported(&mut events))?, 1);
    assert_eq!(events, ["begin outer", "y=-1*", "end outer 1"]);

    // A quiet poll clears the changed marks
    assert_eq!(cg.match_changes(), 0);
    let mut events = Vec::new();
    cg.report(false, reported(&mut events))?;
    assert_eq!(events, ["begin outer", "end outer 0"]);

    assert!(matches!(hal.group_delete("outer"), Err(HalError::Busy(_))));
    drop(cg);
    hal.unref_group("outer")?;
    hal.group_delete("outer")?;
    hal.group_delete("inner")?;
    Ok(())
}

#[test]
fn test_changed_marks_follow_the_last_poll() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    hal.signal_new("a", HalType::S32)?;
    hal.group_new("g", 0, GROUP_REPORT_ON_CHANGE)?;
    hal.member_new("g", "a", MEMBER_MONITOR_CHANGE, 0)?;
    let mut cg = hal.compile_group("g")?;

    hal.signal_set("a", HalValue::S32(1))?;
    assert_eq!(cg.match_changes(), 1);
    assert_eq!(cg.match_changes(), 0);

    let mut events = Vec::new();
    assert_eq!(cg.report(false, reported(&mut events))?, 0);
    assert_eq!(events, ["begin g", "end g 0"]);

    // Forced reports carry the flag of the last poll only
    let mut events = Vec::new();
    cg.report(true, reported(&mut events))?;
    assert_eq!(events, ["begin g", "a=1", "end g 1"]);

    // Reporting does not consume the marks
    hal.signal_set("a", HalValue::S32(2))?;
    assert_eq!(cg.match_changes(), 1);
    for _ in 0..2 {
        let mut events = Vec::new();
        cg.report(false, reported(&mut events))?;
        assert_eq!(events, ["begin g", "a=2*", "end g 1"]);
    }
    Ok(())
}

#[test]
fn test_cycles_hit_the_nesting_limit() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    hal.group_new("ping", 0, 0)?;
    hal.group_new("pong", 0, 0)?;
    hal.member_new("ping", "pong", 0, 0)?;
    hal.member_new("pong", "ping", 0, 0)?;

    match hal.compile_group("ping") {
        Err(HalError::NestingTooDeep { stack }) => {
            assert!(stack.starts_with("ping -> pong -> ping"));
        }
        other => panic!("expected nesting error, got {other:?}"),
    }
    assert_eq!(hal.group_info("ping")?.refcnt, 1);
    Ok(())
}

#[test]
fn test_unmonitored_group_always_matches() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    hal.signal_new("a", HalType::U32)?;
    hal.group_new("log", 0, GROUP_REPORT_ON_CHANGE)?;
    hal.member_new("log", "a", 0, 0)?;
    let mut cg = hal.compile_group("log")?;

    assert_eq!(cg.match_changes(), 1);
    let mut events = Vec::new();
    cg.report(false, reported(&mut events))?;
    assert_eq!(events, ["begin log", "a=0", "end log 1"]);
    Ok(())
}

#[test]
fn test_compiled_component_reports_changed_pins() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    let c = hal.init("io")?;
    let din = hal.new_pin(c, "io.din", HalType::Bit, PinDir::Out)?;
    let count = hal.new_pin(c, "io.count", HalType::U32, PinDir::Out)?;
    hal.ready(c)?;

    let mut cc = hal.compile_component("io")?;
    assert_eq!(cc.pins(), 2);
    din.set_bit(hal.arena(), true);
    count.set_u32(hal.arena(), 3);
    assert_eq!(cc.match_changes(), 2);

    let mut events = Vec::new();
    cc.report(false, reported(&mut events))?;
    assert_eq!(events, ["begin io", "io.count=3*", "io.din=TRUE*", "end io 2"]);

    assert!(hal.exit(c).is_ok());
    assert!(hal.comp_info("io").is_err());
    drop(cc);
    Ok(())
}
