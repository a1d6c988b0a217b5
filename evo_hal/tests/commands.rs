//! Command interpreter integration tests.

use evo_common::prelude::*;
use evo_hal::{FunctSpec, Hal, Interpreter};

/// A component with a float output, a float input, a parameter and two
/// functions, as a loaded driver would leave it.
fn machine(hal: &Hal) -> HalResult<()> {
    let c = hal.init("mill")?;
    hal.new_pin(c, "mill.pos-fb", HalType::Float, PinDir::Out)?;
    hal.new_pin(c, "mill.pos-cmd", HalType::Float, PinDir::In)?;
    hal.new_param(c, "mill.scale", HalType::Float, ParamDir::Rw)?;
    hal.export_funct(FunctSpec::legacy("mill.read", c, |_, _| {}))?;
    hal.export_funct(FunctSpec::legacy("mill.write", c, |_, _| {}))?;
    hal.export_funct(FunctSpec::user("mill.home", c, |args| Ok(args.len() as i32)))?;
    hal.ready(c)
}

#[test]
fn test_script_wires_a_machine() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    machine(&hal)?;
    let cmd = Interpreter::new(&hal);
    let script = r#"
        # wiring
        newsig cmd float
        net pos mill.pos-fb
        linkps mill.pos-cmd cmd
        sets cmd 12.5
        setp mill.scale 1000

        newthread servo 1000000 fp
        addf mill.read servo
        addf mill.write servo
        start
        runonce servo
    "#;
    assert_eq!(cmd.run_script(script, false, |_| {})?, 0);

    assert_eq!(cmd.execute("getp mill.pos-cmd")?, "12.5");
    assert_eq!(cmd.execute("getp mill.scale")?, "1000");
    assert_eq!(hal.signal_info("pos")?.writers, 1);
    assert_eq!(hal.thread_info("servo")?.functs, ["mill.read", "mill.write"]);

    let threads = cmd.execute("show thread")?;
    assert!(threads.contains("servo"));
    assert!(threads.contains("mill.write"));
    assert!(cmd.execute("show pin mill.")?.contains("== cmd"));
    assert!(cmd.execute("status")?.contains("threads: running"));

    cmd.execute("stop")?;
    cmd.execute("delf mill.write servo")?;
    cmd.execute("delthread servo")?;
    assert!(hal.threads()?.is_empty());
    Ok(())
}

#[test]
fn test_errors_pass_through_as_errno() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    machine(&hal)?;
    let cmd = Interpreter::new(&hal);
    let errno = |line: &str| cmd.execute(line).unwrap_err().errno();

    assert_eq!(errno("newsig x quaternion"), -libc::EINVAL);
    assert_eq!(errno("delsig missing"), -libc::ENOENT);
    cmd.execute("newsig x bit")?;
    assert_eq!(errno("newsig x bit"), -libc::EEXIST);
    assert_eq!(errno("linkps mill.pos-cmd x"), -libc::EINVAL);
    assert_eq!(errno("newthread t 1000000 turbo"), -libc::EINVAL);
    cmd.execute("lock params")?;
    assert_eq!(errno("setp mill.scale 2"), -libc::EPERM);
    cmd.execute("unlock params")?;
    cmd.execute("setp mill.scale 2")?;
    assert_eq!(errno("addf mill.home nowhere"), -libc::ENOENT);
    Ok(())
}

#[test]
fn test_call_and_group_commands() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    machine(&hal)?;
    let cmd = Interpreter::new(&hal);
    assert_eq!(cmd.execute("call mill.home x y z")?, "3");

    cmd.execute("newsig a s32")?;
    cmd.execute("newg watch 0 1")?;
    cmd.execute(&format!("newm watch a {MEMBER_MONITOR_CHANGE} 2"))?;
    let info = hal.group_info("watch")?;
    assert!(info.report_on_change());
    assert_eq!(info.members[0].eps_index, 2);
    assert!(cmd.execute("show group")?.contains("watch"));

    cmd.execute("delm watch a")?;
    cmd.execute("delg watch")?;
    cmd.execute("delsig a")?;
    assert_eq!(cmd.execute("sweep")?, "0");
    Ok(())
}

#[test]
fn test_alias_commands() -> HalResult<()> {
    let hal = Hal::anonymous()?;
    machine(&hal)?;
    let cmd = Interpreter::new(&hal);
    cmd.execute("alias pin mill.pos-cmd x-cmd")?;
    cmd.execute("setp x-cmd 4")?;
    assert_eq!(cmd.execute("getp x-cmd")?, "4");
    cmd.execute("unalias pin x-cmd")?;
    assert_eq!(cmd.execute("getp mill.pos-cmd")?, "4");
    assert!(cmd.execute("alias signal cmd c").is_err());
    Ok(())
}
