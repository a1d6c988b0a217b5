//! Threads: periodic tasks running ordered lists of functions.
//!
//! ```text
//!  ThreadDesc (segment)                ThreadRuntime (this process)
//!   ├─ funct_list ─► FunctEntry ─► …    ├─ plan: ArcSwap<ThreadPlan>   ◄─ rebuilt on addf/delf
//!   ├─ period / priority / fp / cpu     ├─ in_cycle + epoch            ◄─ quiesce after swap
//!   └─ stats (cycles, mean, m2)         └─ task: OS thread (realtime mode only)
//! ```
//!
//! The realtime path never takes the HAL mutex. Every change to a
//! thread's function list publishes a fresh plan snapshot and then waits
//! until the task has left any cycle still running the old one, so no
//! function runs after it has been detached.
//!
//! In [`SchedulerMode::Manual`] no OS thread is started; cycles run on
//! demand through [`Hal::run_thread_once`].

use crate::context::{Hal, RtScope};
use crate::data::HalData;
use crate::error::recording;
use crate::funct::{FunctArgs, FunctCall, FunctDesc};
use crate::object::{Descriptor, ObjectFlags, ObjectHeader};
use crate::pin::PinPtr;
use crate::registry::Selector;
use arc_swap::ArcSwap;
use evo_common::hal::config::SchedulerMode;
use evo_common::hal::consts::{PRIO_HIGHEST, PRIO_LOWEST};
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{FunctType, HalType, ObjectType, PinDir};
use evo_shared_memory::dlist::{
    dlist_init, dlist_insert_after, dlist_insert_before, dlist_iter, dlist_remove,
};
use evo_shared_memory::platform::{pin_to_cpu, set_fifo_priority};
use evo_shared_memory::{Arena, ArenaGuard, DListLink, SHM_NULL, ShmOff};
use parking_lot::Mutex;
use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ─── Shared descriptors ─────────────────────────────────────────────

#[repr(C)]
pub(crate) struct ThreadDesc {
    pub(crate) hdr: ObjectHeader,
    funct_list: DListLink,
    period: u64,
    priority: u32,
    uses_fp: u32,
    cpu: i32,
    time: ShmOff,
    tmax: ShmOff,
    curr_period: ShmOff,
    cycles: AtomicU64,
    mean: AtomicU64,
    m2: AtomicU64,
}

unsafe impl Descriptor for ThreadDesc {
    const KIND: ObjectType = ObjectType::Thread;

    fn header(&self) -> &ObjectHeader {
        &self.hdr
    }
}

impl ThreadDesc {
    fn cpu(&self) -> Option<usize> {
        usize::try_from(self.cpu).ok()
    }

    /// Fold one measured period into the running mean and variance.
    fn record_period(&self, period_ns: f64) {
        let n = self.cycles.load(Ordering::Relaxed) + 1;
        let mean = f64::from_bits(self.mean.load(Ordering::Relaxed));
        let m2 = f64::from_bits(self.m2.load(Ordering::Relaxed));
        let delta = period_ns - mean;
        let mean = mean + delta / n as f64;
        let m2 = m2 + delta * (period_ns - mean);
        self.mean.store(mean.to_bits(), Ordering::Relaxed);
        self.m2.store(m2.to_bits(), Ordering::Relaxed);
        self.cycles.store(n, Ordering::Relaxed);
    }

    fn variance(&self) -> f64 {
        let n = self.cycles.load(Ordering::Relaxed);
        if n < 2 {
            return 0.0;
        }
        f64::from_bits(self.m2.load(Ordering::Relaxed)) / (n - 1) as f64
    }
}

/// One slot of a thread's function list.
#[repr(C)]
pub(crate) struct FunctEntry {
    link: DListLink,
    funct: ShmOff,
    flags: u32,
}

// ─── Process-local runtime ──────────────────────────────────────────

struct PlanEntry {
    name: String,
    call: FunctCall,
    rmb: bool,
    wmb: bool,
    pins: Option<(PinPtr, PinPtr, PinPtr)>,
}

/// Immutable snapshot of what a thread calls each cycle.
#[derive(Default)]
pub(crate) struct ThreadPlan {
    entries: Vec<PlanEntry>,
}

pub(crate) struct ThreadRuntime {
    name: String,
    arena: Arc<Arena>,
    root: ShmOff,
    desc: ShmOff,
    period_ns: u64,
    time: PinPtr,
    tmax: PinPtr,
    curr_period: PinPtr,
    plan: ArcSwap<ThreadPlan>,
    in_cycle: AtomicBool,
    epoch: AtomicU64,
    stop: AtomicBool,
    origin: Instant,
    last_start: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn saturate_ns(d: Duration) -> i32 {
    i32::try_from(d.as_nanos()).unwrap_or(i32::MAX)
}

impl ThreadRuntime {
    fn thread_desc(&self) -> &ThreadDesc {
        // Freed only after shutdown() has stopped every cycle
        unsafe { self.arena.get::<ThreadDesc>(self.desc) }
    }

    fn hal_data(&self) -> &HalData {
        unsafe { self.arena.get::<HalData>(self.root) }
    }

    /// Run one cycle. Returns false once the runtime has been shut down.
    pub(crate) fn run_cycle(&self) -> bool {
        self.in_cycle.store(true, Ordering::SeqCst);
        if self.stop.load(Ordering::SeqCst) {
            self.in_cycle.store(false, Ordering::SeqCst);
            return false;
        }
        let _rt = RtScope::enter();
        let arena = &*self.arena;
        let start = Instant::now();
        let now_ns = u64::try_from(start.duration_since(self.origin).as_nanos()).unwrap_or(u64::MAX);
        let prev = self.last_start.swap(now_ns.max(1), Ordering::Relaxed);
        let desc = self.thread_desc();
        if prev != 0 {
            let measured = now_ns.saturating_sub(prev);
            self.curr_period
                .set_s32(arena, i32::try_from(measured).unwrap_or(i32::MAX));
            desc.record_period(measured as f64);
        }

        if self.hal_data().threads_running() {
            let plan = self.plan.load();
            let cycle = desc.cycles.load(Ordering::Relaxed);
            for entry in &plan.entries {
                if entry.rmb {
                    fence(Ordering::Acquire);
                }
                let funct_start = Instant::now();
                match &entry.call {
                    FunctCall::Legacy(f) => f(arena, self.period_ns as i64),
                    FunctCall::Thread(f) => f(&FunctArgs {
                        arena,
                        period: self.period_ns as i64,
                        thread_start: start,
                        funct_start,
                        thread: &self.name,
                        funct: &entry.name,
                        cycle,
                    }),
                    FunctCall::User(_) => {}
                }
                let took = saturate_ns(funct_start.elapsed());
                if let Some((time, tmax, increased)) = &entry.pins {
                    time.set_s32(arena, took);
                    let grew = took > tmax.get_s32(arena);
                    if grew {
                        tmax.set_s32(arena, took);
                    }
                    increased.set_bit(arena, grew);
                }
                if entry.wmb {
                    fence(Ordering::Release);
                }
            }
            let took = saturate_ns(start.elapsed());
            self.time.set_s32(arena, took);
            if took > self.tmax.get_s32(arena) {
                self.tmax.set_s32(arena, took);
            }
        }

        self.in_cycle.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Publish a new plan and wait until no cycle uses the old one.
    pub(crate) fn install(&self, plan: ThreadPlan) {
        self.plan.store(Arc::new(plan));
        self.quiesce();
    }

    fn quiesce(&self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        while self.in_cycle.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch {
            std::thread::sleep(Duration::from_micros(20));
        }
    }

    /// Stop the task, if any, and wait for the last cycle to finish.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            if handle.join().is_err() {
                warn!("Task of thread '{}' panicked", self.name);
            }
        }
        while self.in_cycle.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_micros(20));
        }
        debug!("Thread '{}' stopped", self.name);
    }

    fn spawn(self: &Arc<Self>, priority: u32, cpu: Option<usize>) -> HalResult<()> {
        let rt = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || rt.task_loop(priority, cpu))
            .map_err(|e| HalError::Fault(format!("cannot start thread '{}': {e}", self.name)))?;
        *self.task.lock() = Some(handle);
        Ok(())
    }

    fn task_loop(&self, priority: u32, cpu: Option<usize>) {
        if let Some(cpu) = cpu {
            if let Err(e) = pin_to_cpu(cpu) {
                warn!("Thread '{}': cannot pin to CPU {}: {}", self.name, cpu, e);
            }
        }
        if let Err(e) = set_fifo_priority(priority) {
            warn!(
                "Thread '{}': SCHED_FIFO priority {} unavailable ({}), running best-effort",
                self.name, priority, e
            );
        }
        info!(
            "Thread '{}' task started (period={}ns, priority={})",
            self.name, self.period_ns, priority
        );

        let period = Duration::from_nanos(self.period_ns);
        let mut next = Instant::now();
        let mut overruns: u64 = 0;
        while self.run_cycle() {
            next += period;
            let now = Instant::now();
            if now < next {
                std::thread::sleep(next - now);
            } else {
                overruns += 1;
                if overruns <= 10 || overruns % 1000 == 0 {
                    warn!(
                        "Thread '{}' overrun #{}: behind schedule by {:?}",
                        self.name,
                        overruns,
                        now - next
                    );
                }
                next = now;
            }
        }
    }
}

// ─── Options and snapshots ──────────────────────────────────────────

/// Parameters of a new thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadOptions {
    /// Requested period in nanoseconds, rounded to a multiple of the base
    pub period_ns: u64,
    /// Whether functions using floating point may run on it
    pub uses_fp: bool,
    /// CPU to pin the task to
    pub cpu: Option<usize>,
}

impl ThreadOptions {
    /// Floating point thread with `period_ns`, not pinned.
    pub fn new(period_ns: u64) -> Self {
        Self {
            period_ns,
            uses_fp: true,
            cpu: None,
        }
    }

    /// Set floating point support.
    pub fn fp(mut self, uses_fp: bool) -> Self {
        self.uses_fp = uses_fp;
        self
    }

    /// Pin the task to `cpu`.
    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }
}

/// Snapshot of a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadInfo {
    /// Thread id
    pub id: u32,
    /// Thread name
    pub name: String,
    /// Period in nanoseconds
    pub period_ns: u64,
    /// Scheduling priority
    pub priority: u32,
    /// Floating point support
    pub uses_fp: bool,
    /// Pinned CPU
    pub cpu: Option<usize>,
    /// Attached functions in execution order
    pub functs: Vec<String>,
    /// Cycles measured so far
    pub cycles: u64,
    /// Mean measured period in nanoseconds
    pub mean_period_ns: f64,
    /// Variance of the measured period
    pub period_variance: f64,
    /// Runtime of the last cycle in nanoseconds
    pub time: i32,
    /// Longest cycle runtime in nanoseconds
    pub tmax: i32,
}

const THREAD_PINS: [&str; 3] = ["time", "tmax", "curr-period"];

impl Hal {
    fn funct_list(&self, thread_off: ShmOff) -> ShmOff {
        thread_off + offset_of!(ThreadDesc, funct_list) as ShmOff
    }

    fn entry(&self, off: ShmOff) -> &FunctEntry {
        // Entries are heap blocks written by add_funct
        unsafe { self.arena().get::<FunctEntry>(off) }
    }

    fn thread_info_at(&self, off: ShmOff) -> ThreadInfo {
        let t = self.desc::<ThreadDesc>(off);
        let arena = self.arena();
        ThreadInfo {
            id: t.hdr.id(),
            name: self.name_of(off).to_string(),
            period_ns: t.period,
            priority: t.priority,
            uses_fp: t.uses_fp != 0,
            cpu: t.cpu(),
            functs: dlist_iter(arena, self.funct_list(off))
                .map(|e| self.name_of(self.entry(e).funct).to_string())
                .collect(),
            cycles: t.cycles.load(Ordering::Relaxed),
            mean_period_ns: f64::from_bits(t.mean.load(Ordering::Relaxed)),
            period_variance: t.variance(),
            time: PinPtr::from_slot(t.time, HalType::S32).get_s32(arena),
            tmax: PinPtr::from_slot(t.tmax, HalType::S32).get_s32(arena),
        }
    }

    /// True if thread `thread_off` has an entry for `funct_off`.
    pub(crate) fn thread_calls(&self, thread_off: ShmOff, funct_off: ShmOff) -> bool {
        dlist_iter(self.arena(), self.funct_list(thread_off)).any(|e| self.entry(e).funct == funct_off)
    }

    /// Remove every entry of `funct_off` from a thread's list, freeing the
    /// entries. Returns how many were removed.
    pub(crate) fn detach_funct(&self, g: &ArenaGuard<'_>, thread_off: ShmOff, funct_off: ShmOff) -> HalResult<usize> {
        let arena = self.arena();
        let mut removed = 0;
        for e in dlist_iter(arena, self.funct_list(thread_off)) {
            if self.entry(e).funct != funct_off {
                continue;
            }
            dlist_remove(arena, g, e);
            arena.heap_free(g, e)?;
            self.desc::<FunctDesc>(funct_off).drop_user();
            removed += 1;
        }
        Ok(removed)
    }

    fn build_plan(&self, thread_off: ShmOff) -> ThreadPlan {
        let local = self.local();
        let mut entries = Vec::new();
        for e in dlist_iter(self.arena(), self.funct_list(thread_off)) {
            let entry = self.entry(e);
            let f = self.desc::<FunctDesc>(entry.funct);
            let Some(call) = local.functs.get(&f.hdr.id()) else {
                warn!(
                    "Function '{}' has no callable in this process, skipped",
                    self.name_of(entry.funct)
                );
                continue;
            };
            let flags = ObjectFlags::from_bits_truncate(entry.flags) | f.hdr.flags();
            entries.push(PlanEntry {
                name: self.name_of(entry.funct).to_string(),
                call: call.clone(),
                rmb: flags.contains(ObjectFlags::RMB),
                wmb: flags.contains(ObjectFlags::WMB),
                pins: f.stat_pins(),
            });
        }
        ThreadPlan { entries }
    }

    /// Rebuild the plan of `thread_off` and wait for the task to adopt it.
    pub(crate) fn refresh_plan(&self, _g: &ArenaGuard<'_>, thread_off: ShmOff) {
        let id = self.header(thread_off).id();
        let rt = self.local().threads.get(&id).cloned();
        if let Some(rt) = rt {
            rt.install(self.build_plan(thread_off));
        }
    }

    /// Remove the thread instrumentation pins, owned by the library.
    fn remove_thread_pins(&self, g: &ArenaGuard<'_>, t: &ThreadDesc) -> HalResult<()> {
        let lib = self.hal_lib_id();
        for slot in [t.time, t.tmax, t.curr_period] {
            self.remove_pin_by_slot(g, lib, slot)?;
        }
        Ok(())
    }

    // ─── Public API ─────────────────────────────────────────────────

    /// Create thread `name`.
    ///
    /// The first thread fixes the base period unless the configuration
    /// already did. Periods are rounded to a multiple of the base and may
    /// not be shorter than the fastest existing thread. Priorities are
    /// handed out in decreasing order of creation.
    pub fn create_thread(&self, name: &str, opts: ThreadOptions) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "creating threads")?;
            self.check_name(ObjectType::Thread, name)?;
            self.check_unique(&g, ObjectType::Thread, name, 0)?;
            if opts.period_ns == 0 {
                return Err(HalError::Invalid(format!("thread '{name}': period must be positive")));
            }

            let existing: Vec<&ThreadDesc> = self
                .collect(&g, &Selector::of(ObjectType::Thread))
                .into_iter()
                .map(|off| self.desc::<ThreadDesc>(off))
                .collect();
            let data = self.data();
            let mut base = data.base_period.load(Ordering::Acquire);
            let sets_base = base == 0;
            if sets_base {
                base = opts.period_ns;
            }
            let multiple = (opts.period_ns + base / 2) / base;
            if multiple == 0 {
                return Err(HalError::Invalid(format!(
                    "thread '{name}': period {}ns is shorter than the base period {base}ns",
                    opts.period_ns
                )));
            }
            let period = multiple * base;
            if let Some(fastest) = existing.iter().map(|t| t.period).min() {
                if period < fastest {
                    return Err(HalError::Invalid(format!(
                        "thread '{name}': period {period}ns is shorter than the fastest thread ({fastest}ns)"
                    )));
                }
            }
            let priority = match existing.iter().map(|t| t.priority).min() {
                None => PRIO_HIGHEST,
                Some(lowest) if lowest > PRIO_LOWEST => lowest - 1,
                Some(_) => {
                    return Err(HalError::Invalid(format!(
                        "thread '{name}': no priority levels left"
                    )));
                }
            };

            let lib = self.hal_lib_id();
            for suffix in THREAD_PINS {
                self.check_unique(&g, ObjectType::Pin, &format!("{name}.{suffix}"), lib)?;
            }
            let mut slots = [SHM_NULL; 3];
            let made = slots.iter_mut().zip(THREAD_PINS).try_for_each(|(slot, suffix)| {
                let pin = format!("{name}.{suffix}");
                *slot = self
                    .new_pin_locked(&g, lib, &pin, HalType::S32, PinDir::Out, true)?
                    .slot();
                Ok::<(), HalError>(())
            });
            let drop_slots = |slots: &[ShmOff]| -> HalResult<()> {
                for &slot in slots.iter().filter(|&&s| s != SHM_NULL) {
                    self.remove_pin_by_slot(&g, lib, slot)?;
                }
                Ok(())
            };
            if let Err(e) = made {
                drop_slots(&slots)?;
                return Err(e);
            }
            let cpu = opts.cpu.and_then(|c| i32::try_from(c).ok()).unwrap_or(-1);
            let created = self.create_object(&g, name, 0, |hdr| ThreadDesc {
                hdr,
                funct_list: DListLink::new(),
                period,
                priority,
                uses_fp: opts.uses_fp as u32,
                cpu,
                time: slots[0],
                tmax: slots[1],
                curr_period: slots[2],
                cycles: AtomicU64::new(0),
                mean: AtomicU64::new(0),
                m2: AtomicU64::new(0),
            });
            let off = match created {
                Ok(off) => off,
                Err(e) => {
                    drop_slots(&slots)?;
                    return Err(e);
                }
            };
            dlist_init(self.arena(), &g, self.funct_list(off));
            let id = self.header(off).id();

            let rt = Arc::new(ThreadRuntime {
                name: name.to_string(),
                arena: self.arena_arc(),
                root: self.root(),
                desc: off,
                period_ns: period,
                time: PinPtr::from_slot(slots[0], HalType::S32),
                tmax: PinPtr::from_slot(slots[1], HalType::S32),
                curr_period: PinPtr::from_slot(slots[2], HalType::S32),
                plan: ArcSwap::from_pointee(ThreadPlan::default()),
                in_cycle: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                stop: AtomicBool::new(false),
                origin: Instant::now(),
                last_start: AtomicU64::new(0),
                task: Mutex::new(None),
            });
            if self.config().scheduler.mode == SchedulerMode::Realtime {
                if let Err(e) = rt.spawn(priority, opts.cpu) {
                    self.remove_thread_pins(&g, self.desc::<ThreadDesc>(off))?;
                    self.retire(&g, off)?;
                    return Err(e);
                }
            }
            if sets_base {
                data.base_period.store(base, Ordering::Release);
                info!("Base period set to {}ns by thread '{}'", base, name);
            }
            self.local().threads.insert(id, rt);
            info!(
                "Thread '{}' created: period={}ns priority={} fp={}",
                name, period, priority, opts.uses_fp
            );
            Ok(id)
        })
    }

    /// Delete thread `name`.
    ///
    /// Turns the global run switch off, stops the task, then frees the
    /// function entries and the instrumentation pins.
    pub fn delete_thread(&self, name: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "deleting threads")?;
            let off = self.require(&g, ObjectType::Thread, name)?;
            let t = self.desc::<ThreadDesc>(off);
            self.data().set_threads_running(false);
            let rt = self.local().threads.remove(&t.hdr.id());
            if let Some(rt) = rt {
                rt.shutdown();
            }
            let arena = self.arena();
            for e in dlist_iter(arena, self.funct_list(off)) {
                self.desc::<FunctDesc>(self.entry(e).funct).drop_user();
                dlist_remove(arena, &g, e);
                arena.heap_free(&g, e)?;
            }
            self.remove_thread_pins(&g, t)?;
            self.retire(&g, off)?;
            info!("Thread '{}' deleted", name);
            Ok(())
        })
    }

    /// Attach function `funct` to thread `thread` at `pos`.
    pub fn add_funct(&self, funct: &str, thread: &str, pos: i32) -> HalResult<()> {
        self.add_funct_with(funct, thread, pos, false, false)
    }

    /// Attach `funct` to `thread` at `pos`, with optional barriers.
    ///
    /// Positions count from 1: positive from the head, negative from the
    /// tail, so `1` inserts first and `-1` appends.
    pub fn add_funct_with(&self, funct: &str, thread: &str, pos: i32, rmb: bool, wmb: bool) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "adding functions to threads")?;
            if pos == 0 {
                return Err(HalError::Invalid("function position 0 is not valid".into()));
            }
            let f_off = self.require(&g, ObjectType::Funct, funct)?;
            let t_off = self.require(&g, ObjectType::Thread, thread)?;
            let f = self.desc::<FunctDesc>(f_off);
            let t = self.desc::<ThreadDesc>(t_off);
            if f.kind() == FunctType::User {
                return Err(HalError::Invalid(format!(
                    "user function '{funct}' cannot run in a thread"
                )));
            }
            if !self.local().functs.contains_key(&f.hdr.id()) {
                return Err(HalError::Permission(format!(
                    "function '{funct}' was exported by another process"
                )));
            }
            if f.users() > 0 && !f.reentrant() {
                return Err(HalError::Invalid(format!(
                    "function '{funct}' is already in use and not reentrant"
                )));
            }
            if f.uses_fp() && t.uses_fp == 0 {
                return Err(HalError::Invalid(format!(
                    "function '{funct}' needs floating point, thread '{thread}' has none"
                )));
            }

            let arena = self.arena();
            let head = self.funct_list(t_off);
            let steps = pos.unsigned_abs() - 1;
            let mut at = head;
            for _ in 0..steps {
                let link = unsafe { arena.get::<DListLink>(at) };
                at = if pos > 0 { link.next() } else { link.prev() };
                if at == head {
                    return Err(HalError::Invalid(format!(
                        "position {pos} is beyond the {} function(s) of thread '{thread}'",
                        dlist_iter(arena, head).count()
                    )));
                }
            }

            let mut flags = ObjectFlags::empty();
            flags.set(ObjectFlags::RMB, rmb);
            flags.set(ObjectFlags::WMB, wmb);
            let e = arena.heap_alloc(&g, std::mem::size_of::<FunctEntry>())?;
            // Zeroed block just allocated under the mutex
            unsafe {
                arena.ptr::<FunctEntry>(e).write(FunctEntry {
                    link: DListLink::new(),
                    funct: f_off,
                    flags: flags.bits(),
                })
            };
            dlist_init(arena, &g, e);
            if pos > 0 {
                dlist_insert_after(arena, &g, at, e);
            } else {
                dlist_insert_before(arena, &g, at, e);
            }
            f.add_user();
            self.refresh_plan(&g, t_off);
            debug!("Function '{}' added to thread '{}' at {}", funct, thread, pos);
            Ok(())
        })
    }

    /// Detach function `funct` from thread `thread`.
    pub fn del_funct(&self, funct: &str, thread: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            self.check_lock(LockLevel::CONFIG, "removing functions from threads")?;
            let f_off = self.require(&g, ObjectType::Funct, funct)?;
            let t_off = self.require(&g, ObjectType::Thread, thread)?;
            if self.detach_funct(&g, t_off, f_off)? == 0 {
                return Err(HalError::Invalid(format!(
                    "function '{funct}' is not attached to thread '{thread}'"
                )));
            }
            self.refresh_plan(&g, t_off);
            debug!("Function '{}' removed from thread '{}'", funct, thread);
            Ok(())
        })
    }

    /// Turn the global run switch on.
    pub fn start_threads(&self) -> HalResult<()> {
        recording(|| {
            let _g = self.guard()?;
            self.check_lock(LockLevel::RUN, "starting threads")?;
            self.data().set_threads_running(true);
            info!("Realtime threads started");
            Ok(())
        })
    }

    /// Turn the global run switch off. Threads keep ticking idle.
    pub fn stop_threads(&self) -> HalResult<()> {
        recording(|| {
            let _g = self.guard()?;
            self.check_lock(LockLevel::RUN, "stopping threads")?;
            self.data().set_threads_running(false);
            info!("Realtime threads stopped");
            Ok(())
        })
    }

    /// True while the global run switch is on.
    pub fn threads_running(&self) -> bool {
        self.data().threads_running()
    }

    /// Run one cycle of thread `name` on the calling OS thread.
    pub fn run_thread_once(&self, name: &str) -> HalResult<()> {
        recording(|| {
            let rt = {
                let g = self.guard()?;
                let off = self.require(&g, ObjectType::Thread, name)?;
                let id = self.header(off).id();
                self.local().threads.get(&id).cloned()
            };
            let rt = rt.ok_or_else(|| {
                HalError::Permission(format!("thread '{name}' belongs to another process"))
            })?;
            if rt.task.lock().is_some() {
                return Err(HalError::Busy(format!("thread '{name}' runs its own task")));
            }
            rt.run_cycle();
            Ok(())
        })
    }

    /// Snapshot of thread `name`.
    pub fn thread_info(&self, name: &str) -> HalResult<ThreadInfo> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.thread_info_at(self.require(&g, ObjectType::Thread, name)?))
        })
    }

    /// Snapshots of every thread.
    pub fn threads(&self) -> HalResult<Vec<ThreadInfo>> {
        recording(|| {
            let g = self.guard()?;
            Ok(self
                .collect(&g, &Selector::of(ObjectType::Thread))
                .into_iter()
                .map(|off| self.thread_info_at(off))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funct::FunctSpec;
    use std::sync::atomic::AtomicUsize;

    const MS: u64 = 1_000_000;

    fn counting(hal: &Hal, comp: u32, name: &str, calls: &Arc<AtomicUsize>) {
        let c = calls.clone();
        hal.export_funct(FunctSpec::legacy(name, comp, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }

    #[test]
    fn test_first_thread_sets_base_and_rounds() {
        let hal = Hal::anonymous().unwrap();
        hal.create_thread("base", ThreadOptions::new(MS)).unwrap();
        hal.create_thread("slow", ThreadOptions::new(3 * MS + 300_000)).unwrap();
        assert_eq!(hal.thread_info("slow").unwrap().period_ns, 3 * MS);
        assert!(matches!(
            hal.create_thread("tiny", ThreadOptions::new(100_000)),
            Err(HalError::Invalid(_))
        ));
    }

    #[test]
    fn test_priorities_decrease() {
        let hal = Hal::anonymous().unwrap();
        hal.create_thread("t1", ThreadOptions::new(MS)).unwrap();
        hal.create_thread("t2", ThreadOptions::new(2 * MS)).unwrap();
        hal.create_thread("t3", ThreadOptions::new(4 * MS)).unwrap();
        let p: Vec<u32> = ["t1", "t2", "t3"]
            .iter()
            .map(|t| hal.thread_info(t).unwrap().priority)
            .collect();
        assert_eq!(p[0], PRIO_HIGHEST);
        assert!(p[0] > p[1] && p[1] > p[2]);
    }

    #[test]
    fn test_thread_pins_owned_by_library() {
        let hal = Hal::anonymous().unwrap();
        hal.create_thread("servo", ThreadOptions::new(MS)).unwrap();
        for pin in ["servo.time", "servo.tmax", "servo.curr-period"] {
            assert_eq!(hal.pin_info(pin).unwrap().owner_id, hal.hal_lib_id());
        }
        hal.delete_thread("servo").unwrap();
        assert!(hal.pins("servo.").unwrap().is_empty());
    }

    #[test]
    fn test_position_rules() {
        let hal = Hal::anonymous().unwrap();
        let c = hal.init("ord").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        for f in ["ord.a", "ord.b", "ord.c", "ord.d"] {
            counting(&hal, c, f, &calls);
        }
        hal.create_thread("th", ThreadOptions::new(MS)).unwrap();
        assert!(matches!(hal.add_funct("ord.a", "th", 0), Err(HalError::Invalid(_))));
        assert!(hal.add_funct("ord.a", "th", 2).is_err());
        hal.add_funct("ord.a", "th", 1).unwrap();
        hal.add_funct("ord.b", "th", 2).unwrap();
        hal.add_funct("ord.c", "th", -1).unwrap();
        hal.add_funct("ord.d", "th", -3).unwrap();
        assert_eq!(
            hal.thread_info("th").unwrap().functs,
            ["ord.a", "ord.d", "ord.b", "ord.c"]
        );
    }

    #[test]
    fn test_reentrancy_and_fp_checks() {
        let hal = Hal::anonymous().unwrap();
        let c = hal.init("chk").unwrap();
        hal.export_funct(FunctSpec::legacy("chk.once", c, |_, _| {}).uses_fp(false))
            .unwrap();
        hal.export_funct(FunctSpec::legacy("chk.fp", c, |_, _| {})).unwrap();
        hal.export_funct(FunctSpec::user("chk.user", c, |_| Ok(0))).unwrap();
        hal.create_thread("fast", ThreadOptions::new(MS).fp(false)).unwrap();
        hal.create_thread("slow", ThreadOptions::new(2 * MS)).unwrap();

        hal.add_funct("chk.once", "fast", 1).unwrap();
        assert!(hal.add_funct("chk.once", "slow", 1).is_err());
        assert!(hal.add_funct("chk.fp", "fast", 1).is_err());
        hal.add_funct("chk.fp", "slow", 1).unwrap();
        assert!(hal.add_funct("chk.user", "slow", 1).is_err());
        assert_eq!(hal.funct_info("chk.once").unwrap().users, 1);
        hal.del_funct("chk.once", "fast").unwrap();
        assert_eq!(hal.funct_info("chk.once").unwrap().users, 0);
        assert!(hal.del_funct("chk.once", "fast").is_err());
    }

    #[test]
    fn test_idle_until_started() {
        let hal = Hal::anonymous().unwrap();
        let c = hal.init("idle").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        counting(&hal, c, "idle.f", &calls);
        hal.create_thread("th", ThreadOptions::new(MS)).unwrap();
        hal.add_funct("idle.f", "th", 1).unwrap();

        hal.run_thread_once("th").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        hal.start_threads().unwrap();
        hal.run_thread_once("th").unwrap();
        hal.run_thread_once("th").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(hal.thread_info("th").unwrap().cycles >= 2);
    }

    #[test]
    fn test_run_lock_blocks_start() {
        let hal = Hal::anonymous().unwrap();
        hal.set_lock_level(LockLevel::RUN).unwrap();
        assert!(matches!(hal.start_threads(), Err(HalError::Permission(_))));
    }

    #[test]
    fn test_functions_cannot_touch_registry() {
        let hal = Hal::anonymous().unwrap();
        let c = hal.init("bad").unwrap();
        let seen = Arc::new(Mutex::new(None));
        let (h, s) = (hal.clone(), seen.clone());
        hal.export_funct(FunctSpec::thread("bad.f", c, move |_| {
            *s.lock() = Some(h.signal_new("bad.sig", HalType::Bit));
        }))
        .unwrap();
        hal.create_thread("th", ThreadOptions::new(MS)).unwrap();
        hal.add_funct("bad.f", "th", 1).unwrap();
        hal.start_threads().unwrap();
        hal.run_thread_once("th").unwrap();
        assert!(matches!(
            seen.lock().take(),
            Some(Err(HalError::Permission(_)))
        ));
        // Break the Hal -> callable -> Hal cycle
        hal.delete_thread("th").unwrap();
        hal.ready(c).unwrap();
        hal.exit(c).unwrap();
    }

    #[test]
    fn test_delete_thread_stops_calls() {
        let hal = Hal::anonymous().unwrap();
        let c = hal.init("del").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        counting(&hal, c, "del.f", &calls);
        hal.create_thread("th", ThreadOptions::new(MS)).unwrap();
        hal.add_funct("del.f", "th", 1).unwrap();
        hal.start_threads().unwrap();
        hal.delete_thread("th").unwrap();
        assert!(!hal.threads_running());
        assert_eq!(hal.funct_info("del.f").unwrap().users, 0);
        assert!(hal.run_thread_once("th").is_err());
    }
}
