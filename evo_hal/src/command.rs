//! Textual command interpreter behind `evo_halcmd`.
//!
//! Every command maps onto one or a few [`Hal`] calls and returns its
//! textual result. Errors are returned unchanged, so
//! [`HalError::errno`](evo_common::hal::error::HalError::errno) is the
//! command's return code.
//!
//! ```text
//!   newsig <sig> <type>            delsig <sig>
//!   sets <sig> <value>             gets <sig>
//!   linkps <pin> <sig>             unlinkp <pin>
//!   net <sig> [=>|<=|<=>] <pin>... setp <pin|param> <value>
//!   getp <pin|param>               alias <pin|param> <name> <alias>
//!   unalias <pin|param> <name>     newthread <name> <period-ns> [fp|nofp] [cpu=N]
//!   delthread <name>               addf <funct> <thread> [pos]
//!   delf <funct> <thread>          start | stop
//!   lock [level]                   unlock [level]
//!   call <funct> [args...]         runonce <thread>
//!   newg <group> [arg1] [arg2]     delg <group>
//!   newm <group> <member> [flags] [eps]
//!   delm <group> <member>          epsilon [index [value]]
//!   sweep                          status
//!   show [comp|pin|sig|param|funct|thread|group|all] [prefix]
//!   dump                           (JSON snapshot)
//! ```
//!
//! `#` starts a comment; blank lines are accepted and do nothing.
//!
//! # Usage
//!
//! ```rust,no_run
//! use evo_hal::{Hal, Interpreter};
//!
//! let hal = Hal::anonymous()?;
//! let cmd = Interpreter::new(&hal);
//! cmd.execute("newsig speed float")?;
//! cmd.execute("sets speed 2.5")?;
//! assert_eq!(cmd.execute("gets speed")?, "2.5");
//! # Ok::<(), evo_common::hal::error::HalError>(())
//! ```

use crate::context::Hal;
use crate::registry::Selector;
use crate::thread::ThreadOptions;
use evo_common::hal::consts::MAX_EPSILON;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{HalType, HalValue, ObjectType};
use serde_json::{Value, json};
use std::fmt::Write;
use tracing::{debug, error};

/// Executes textual commands against one [`Hal`] handle.
#[derive(Debug)]
pub struct Interpreter<'h> {
    hal: &'h Hal,
}

/// Positional argument `i`, or an `Invalid` error naming it.
fn arg<'a>(args: &[&'a str], i: usize, what: &str) -> HalResult<&'a str> {
    args.get(i)
        .copied()
        .ok_or_else(|| HalError::Invalid(format!("missing {what}")))
}

fn parse_num<T: std::str::FromStr>(s: &str, what: &str) -> HalResult<T> {
    s.parse()
        .map_err(|_| HalError::Invalid(format!("{what} '{s}' is not a number")))
}

fn lock_level(s: Option<&str>) -> HalResult<LockLevel> {
    let s = s.unwrap_or("all");
    LockLevel::parse(s).ok_or_else(|| HalError::Invalid(format!("unknown lock level '{s}'")))
}

fn lock_names(level: LockLevel) -> String {
    if level.is_empty() {
        return "none".into();
    }
    level
        .iter_names()
        .map(|(n, _)| n.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

fn value_json(v: HalValue) -> Value {
    match v {
        HalValue::Bit(b) => json!(b),
        HalValue::Float(f) => json!(f),
        HalValue::S32(i) => json!(i),
        HalValue::U32(u) => json!(u),
    }
}

impl<'h> Interpreter<'h> {
    /// Interpreter bound to `hal`.
    pub fn new(hal: &'h Hal) -> Self {
        Self { hal }
    }

    /// Execute one command line.
    pub fn execute(&self, line: &str) -> HalResult<String> {
        let line = line.split('#').next().unwrap_or("");
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = words.split_first() else {
            return Ok(String::new());
        };
        debug!("halcmd: {}", line.trim());
        let hal = self.hal;
        match cmd {
            "newsig" => {
                let ty = HalType::parse(arg(args, 1, "signal type")?)?;
                hal.signal_new(arg(args, 0, "signal name")?, ty)?;
                Ok(String::new())
            }
            "delsig" => hal.signal_delete(arg(args, 0, "signal name")?).map(|_| String::new()),
            "sets" => {
                let name = arg(args, 0, "signal name")?;
                let ty = hal.signal_info(name)?.ty;
                hal.signal_set(name, HalValue::parse(ty, arg(args, 1, "value")?)?)?;
                Ok(String::new())
            }
            "gets" => Ok(hal.signal_get(arg(args, 0, "signal name")?)?.to_string()),
            "linkps" => {
                hal.link(arg(args, 0, "pin name")?, arg(args, 1, "signal name")?)?;
                Ok(String::new())
            }
            "net" => self.net(args),
            "unlinkp" => hal.unlink(arg(args, 0, "pin name")?).map(|_| String::new()),
            "setp" => self.setp(arg(args, 0, "pin or parameter name")?, arg(args, 1, "value")?),
            "getp" => self.getp(arg(args, 0, "pin or parameter name")?),
            "alias" => {
                let alias = arg(args, 2, "alias")?;
                self.alias(arg(args, 0, "object type")?, arg(args, 1, "name")?, Some(alias))
            }
            "unalias" => self.alias(arg(args, 0, "object type")?, arg(args, 1, "name")?, None),
            "newthread" => self.newthread(args),
            "delthread" => hal.delete_thread(arg(args, 0, "thread name")?).map(|_| String::new()),
            "addf" => {
                let pos = match args.get(2) {
                    Some(p) => parse_num(p, "position")?,
                    None => -1,
                };
                hal.add_funct(arg(args, 0, "function name")?, arg(args, 1, "thread name")?, pos)?;
                Ok(String::new())
            }
            "delf" => {
                hal.del_funct(arg(args, 0, "function name")?, arg(args, 1, "thread name")?)?;
                Ok(String::new())
            }
            "start" => hal.start_threads().map(|_| String::new()),
            "stop" => hal.stop_threads().map(|_| String::new()),
            "lock" => {
                let level = hal.lock_level() | lock_level(args.first().copied())?;
                hal.set_lock_level(level)?;
                Ok(String::new())
            }
            "unlock" => {
                let level = hal.lock_level() - lock_level(args.first().copied())?;
                hal.set_lock_level(level)?;
                Ok(String::new())
            }
            "call" => {
                let name = arg(args, 0, "function name")?;
                let rest: Vec<String> = args[1..].iter().map(|s| s.to_string()).collect();
                Ok(hal.call_user_funct(name, &rest)?.to_string())
            }
            "runonce" => hal.run_thread_once(arg(args, 0, "thread name")?).map(|_| String::new()),
            "newg" => {
                let arg1 = args.get(1).map(|s| parse_num(s, "arg1")).transpose()?;
                let arg2 = args.get(2).map(|s| parse_num(s, "arg2")).transpose()?;
                hal.group_new(arg(args, 0, "group name")?, arg1.unwrap_or(0), arg2.unwrap_or(0))?;
                Ok(String::new())
            }
            "delg" => hal.group_delete(arg(args, 0, "group name")?).map(|_| String::new()),
            "newm" => {
                let flags = args.get(2).map(|s| parse_num(s, "flags")).transpose()?;
                let eps = args.get(3).map(|s| parse_num(s, "epsilon index")).transpose()?;
                hal.member_new(
                    arg(args, 0, "group name")?,
                    arg(args, 1, "member name")?,
                    flags.unwrap_or(0),
                    eps.unwrap_or(0),
                )?;
                Ok(String::new())
            }
            "delm" => {
                hal.member_delete(arg(args, 0, "group name")?, arg(args, 1, "member name")?)?;
                Ok(String::new())
            }
            "epsilon" => self.epsilon(args),
            "sweep" => Ok(hal.sweep()?.to_string()),
            "show" => self.show(args.first().copied().unwrap_or("all"), args.get(1).copied().unwrap_or("")),
            "status" => self.status(),
            "dump" => self.dump(),
            other => Err(HalError::Invalid(format!("unknown command '{other}'"))),
        }
    }

    /// Execute every line of `script`, handing non-empty results to `out`.
    ///
    /// Stops at the first failing line unless `keep_going` is set; returns
    /// the number of failed lines.
    pub fn run_script<F>(&self, script: &str, keep_going: bool, mut out: F) -> HalResult<usize>
    where
        F: FnMut(&str),
    {
        let mut failed = 0;
        for (n, line) in script.lines().enumerate() {
            match self.execute(line) {
                Ok(s) if s.is_empty() => {}
                Ok(s) => out(&s),
                Err(e) => {
                    error!("line {}: {}: {}", n + 1, line.trim(), e);
                    if !keep_going {
                        return Err(e);
                    }
                    failed += 1;
                }
            }
        }
        Ok(failed)
    }

    // ─── Commands ───────────────────────────────────────────────────

    fn exists(&self, kind: ObjectType, name: &str) -> HalResult<bool> {
        Ok(self.hal.count(&Selector::of(kind).named(name))? > 0)
    }

    fn net(&self, args: &[&str]) -> HalResult<String> {
        let sig = arg(args, 0, "signal name")?;
        let pins: Vec<&str> = args[1..]
            .iter()
            .copied()
            .filter(|w| !matches!(*w, "=>" | "<=" | "<=>"))
            .collect();
        let first = arg(&pins, 0, "pin name")?;
        if !self.exists(ObjectType::Signal, sig)? {
            let ty = self.hal.pin_info(first)?.ty;
            self.hal.signal_new(sig, ty)?;
        }
        for pin in pins {
            self.hal.link(pin, sig)?;
        }
        Ok(String::new())
    }

    fn setp(&self, name: &str, value: &str) -> HalResult<String> {
        if self.exists(ObjectType::Param, name)? {
            let ty = self.hal.param_info(name)?.ty;
            self.hal.param_set(name, HalValue::parse(ty, value)?)?;
        } else {
            let ty = self.hal.pin_info(name)?.ty;
            self.hal.pin_set(name, HalValue::parse(ty, value)?)?;
        }
        Ok(String::new())
    }

    fn getp(&self, name: &str) -> HalResult<String> {
        let v = if self.exists(ObjectType::Param, name)? {
            self.hal.param_get(name)?
        } else {
            self.hal.pin_value(name)?
        };
        Ok(v.to_string())
    }

    fn alias(&self, kind: &str, name: &str, alias: Option<&str>) -> HalResult<String> {
        match kind {
            "pin" => self.hal.pin_alias(name, alias)?,
            "param" => self.hal.param_alias(name, alias)?,
            other => {
                return Err(HalError::Invalid(format!(
                    "alias type must be 'pin' or 'param', not '{other}'"
                )));
            }
        }
        Ok(String::new())
    }

    fn newthread(&self, args: &[&str]) -> HalResult<String> {
        let name = arg(args, 0, "thread name")?;
        let mut opts = ThreadOptions::new(parse_num(arg(args, 1, "period")?, "period")?);
        for opt in &args[2..] {
            match *opt {
                "fp" => opts = opts.fp(true),
                "nofp" => opts = opts.fp(false),
                o => match o.strip_prefix("cpu=") {
                    Some(cpu) => opts = opts.cpu(parse_num(cpu, "cpu")?),
                    None => return Err(HalError::Invalid(format!("unknown thread option '{o}'"))),
                },
            }
        }
        self.hal.create_thread(name, opts)?;
        Ok(String::new())
    }

    fn epsilon(&self, args: &[&str]) -> HalResult<String> {
        match args {
            [] => {
                let mut out = String::new();
                for i in 0..MAX_EPSILON {
                    let _ = writeln!(out, "{i}: {}", self.hal.epsilon(i)?);
                }
                Ok(out.trim_end().to_string())
            }
            [i] => Ok(self.hal.epsilon(parse_num(i, "epsilon index")?)?.to_string()),
            [i, v, ..] => {
                self.hal
                    .set_epsilon(parse_num(i, "epsilon index")?, parse_num(v, "epsilon")?)?;
                Ok(String::new())
            }
        }
    }

    fn show(&self, what: &str, prefix: &str) -> HalResult<String> {
        let hal = self.hal;
        let all = what == "all";
        let mut out = String::new();
        if all || what == "comp" {
            out.push_str("Components:\n");
            for c in hal.components()? {
                let _ = writeln!(out, "  {:>4}  {:<8} {:<10} {}", c.id, c.kind, c.state, c.name);
                for i in hal.instances(c.id)? {
                    let _ = writeln!(out, "          instance {:>4} {} ({} bytes)", i.id, i.name, i.size);
                }
            }
        }
        if all || what == "pin" {
            out.push_str("Pins:\n");
            for p in hal.pins(prefix)? {
                let link = p.signal.map(|s| format!(" == {s}")).unwrap_or_default();
                let _ = writeln!(out, "  {:>4}  {:<5} {:<3} {:>12}  {}{}", p.owner_id, p.ty, p.dir, p.value, p.name, link);
            }
        }
        if all || what == "sig" {
            out.push_str("Signals:\n");
            for s in hal.signals(prefix)? {
                let _ = writeln!(out, "  {:<5} {:>12}  {}", s.ty, s.value, s.name);
                for p in &s.pins {
                    let _ = writeln!(out, "                      <== {p}");
                }
            }
        }
        if all || what == "param" {
            out.push_str("Parameters:\n");
            for p in hal.params(prefix)? {
                let _ = writeln!(out, "  {:>4}  {:<5} {:<2} {:>12}  {}", p.owner_id, p.ty, p.dir, p.value, p.name);
            }
        }
        if all || what == "funct" {
            out.push_str("Functions:\n");
            for f in hal.functs(prefix)? {
                let _ = writeln!(
                    out,
                    "  {:>4}  {:<6} {:<3} users={} {}",
                    f.owner_id,
                    f.kind,
                    if f.uses_fp { "fp" } else { "" },
                    f.users,
                    f.name
                );
            }
        }
        if all || what == "thread" {
            out.push_str("Threads:\n");
            for t in hal.threads()? {
                let _ = writeln!(
                    out,
                    "  {:>10} ns  prio {:>2}  {:<3} {} (cycles={}, tmax={})",
                    t.period_ns,
                    t.priority,
                    if t.uses_fp { "fp" } else { "" },
                    t.name,
                    t.cycles,
                    t.tmax
                );
                for (n, f) in t.functs.iter().enumerate() {
                    let _ = writeln!(out, "        {:>3} {}", n + 1, f);
                }
            }
        }
        if all || what == "group" {
            out.push_str("Groups:\n");
            for g in hal.groups()? {
                let _ = writeln!(out, "  {:>4}  flags={:#x} refs={} {}", g.id, g.flags, g.refcnt, g.name);
                for m in &g.members {
                    let _ = writeln!(out, "        {:<6} flags={:#x} eps={} {}", m.kind, m.flags, m.eps_index, m.name);
                }
            }
        }
        if out.is_empty() {
            return Err(HalError::Invalid(format!("unknown show category '{what}'")));
        }
        Ok(out.trim_end().to_string())
    }

    fn status(&self) -> HalResult<String> {
        let stats = self.hal.stats()?;
        Ok(format!(
            "lock: {}\nthreads: {}\nsegment: {} bytes (heap {} used / {} free, rt {}, gap {})\nerrors: {}",
            lock_names(self.hal.lock_level()),
            if self.hal.threads_running() { "running" } else { "stopped" },
            stats.size,
            stats.heap_used,
            stats.heap_free,
            stats.rt_used,
            stats.gap,
            crate::error::error_count(false),
        ))
    }

    fn dump(&self) -> HalResult<String> {
        let hal = self.hal;
        let comps: Vec<Value> = hal
            .components()?
            .into_iter()
            .map(|c| {
                json!({
                    "id": c.id, "name": c.name, "type": c.kind.to_string(),
                    "state": c.state.to_string(), "pid": c.pid
                })
            })
            .collect();
        let pins: Vec<Value> = hal
            .pins("")?
            .into_iter()
            .map(|p| {
                json!({
                    "name": p.name, "owner": p.owner_id, "type": p.ty.as_str(),
                    "dir": p.dir.to_string(), "value": value_json(p.value), "signal": p.signal
                })
            })
            .collect();
        let signals: Vec<Value> = hal
            .signals("")?
            .into_iter()
            .map(|s| json!({"name": s.name, "type": s.ty.as_str(), "value": value_json(s.value), "pins": s.pins}))
            .collect();
        let params: Vec<Value> = hal
            .params("")?
            .into_iter()
            .map(|p| {
                json!({
                    "name": p.name, "owner": p.owner_id, "type": p.ty.as_str(),
                    "dir": p.dir.to_string(), "value": value_json(p.value)
                })
            })
            .collect();
        let threads: Vec<Value> = hal
            .threads()?
            .into_iter()
            .map(|t| {
                json!({
                    "name": t.name, "period_ns": t.period_ns, "priority": t.priority,
                    "uses_fp": t.uses_fp, "functs": t.functs, "cycles": t.cycles
                })
            })
            .collect();
        let groups: Vec<Value> = hal
            .groups()?
            .into_iter()
            .map(|g| {
                let members: Vec<&str> = g.members.iter().map(|m| m.name.as_str()).collect();
                json!({"name": g.name, "flags": g.flags, "refcnt": g.refcnt, "members": members})
            })
            .collect();
        let doc = json!({
            "lock": lock_names(hal.lock_level()),
            "threads_running": hal.threads_running(),
            "components": comps,
            "pins": pins,
            "signals": signals,
            "params": params,
            "threads": threads,
            "groups": groups,
        });
        serde_json::to_string_pretty(&doc).map_err(|e| HalError::Fault(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_common::hal::types::PinDir;

    #[test]
    fn test_signal_commands() {
        let hal = Hal::anonymous().unwrap();
        let cmd = Interpreter::new(&hal);
        cmd.execute("newsig speed float  # comment").unwrap();
        cmd.execute("sets speed 1.25").unwrap();
        assert_eq!(cmd.execute("gets speed").unwrap(), "1.25");
        assert_eq!(cmd.execute("   ").unwrap(), "");
        assert_eq!(
            cmd.execute("sets speed fast").unwrap_err().errno(),
            -libc::EINVAL
        );
        assert_eq!(cmd.execute("gets nope").unwrap_err().errno(), -libc::ENOENT);
        assert_eq!(cmd.execute("frobnicate").unwrap_err().errno(), -libc::EINVAL);
    }

    #[test]
    fn test_net_creates_signal_from_pin_type() {
        let hal = Hal::anonymous().unwrap();
        let c = hal.init("m").unwrap();
        hal.new_pin(c, "m.out", HalType::U32, PinDir::Out).unwrap();
        hal.new_pin(c, "m.in", HalType::U32, PinDir::In).unwrap();
        hal.ready(c).unwrap();
        let cmd = Interpreter::new(&hal);
        cmd.execute("net count m.out => m.in").unwrap();
        let info = hal.signal_info("count").unwrap();
        assert_eq!(info.ty, HalType::U32);
        assert_eq!(info.writers, 1);
        assert_eq!(info.readers, 1);
    }

    #[test]
    fn test_lock_and_unlock() {
        let hal = Hal::anonymous().unwrap();
        let cmd = Interpreter::new(&hal);
        cmd.execute("lock params").unwrap();
        assert_eq!(hal.lock_level(), LockLevel::PARAMS);
        cmd.execute("lock load").unwrap();
        assert!(cmd.execute("status").unwrap().contains("lock: load,params"));
        cmd.execute("unlock").unwrap();
        assert_eq!(hal.lock_level(), LockLevel::NONE);
        assert!(cmd.execute("lock sideways").is_err());
    }

    #[test]
    fn test_epsilon_and_dump() {
        let hal = Hal::anonymous().unwrap();
        let cmd = Interpreter::new(&hal);
        cmd.execute("epsilon 1 0.5").unwrap();
        assert_eq!(cmd.execute("epsilon 1").unwrap(), "0.5");
        assert_eq!(cmd.execute("epsilon").unwrap().lines().count(), MAX_EPSILON);
        cmd.execute("newsig s bit").unwrap();
        let doc: Value = serde_json::from_str(&cmd.execute("dump").unwrap()).unwrap();
        assert_eq!(doc["signals"][0]["name"], "s");
        assert_eq!(doc["signals"][0]["value"], false);
    }

    #[test]
    fn test_script_keep_going() {
        let hal = Hal::anonymous().unwrap();
        let cmd = Interpreter::new(&hal);
        let script = "newsig a s32\nnewsig a s32\nsets a -3\ngets a\n";
        assert!(cmd.run_script(script, false, |_| {}).is_err());

        let hal = Hal::anonymous().unwrap();
        let cmd = Interpreter::new(&hal);
        let mut seen = Vec::new();
        let failed = cmd
            .run_script(script, true, |s| seen.push(s.to_string()))
            .unwrap();
        assert_eq!(failed, 1);
        assert_eq!(seen, ["-3"]);
    }
}
