//! The [`Hal`] handle: one process's attachment to a HAL segment.
//!
//! ```text
//!  Hal (Clone, Arc)
//!   └─ HalInner
//!       ├─ arena: Arc<Arena>        shared segment, shared with thread tasks
//!       ├─ root:  ShmOff            HalData (registry head, switches, epsilon)
//!       ├─ config: HalConfig
//!       └─ local: Mutex<LocalTables>
//!            ├─ functs   id -> callable      (never shared across processes)
//!            ├─ hooks    comp id -> ctor/dtor
//!            └─ threads  id -> ThreadRuntime (plan snapshot + task)
//! ```
//!
//! Lock order: the arena mutex is always taken before the local tables
//! mutex, and no callback is ever invoked while either is held.

use crate::data::{HAL_LAYOUT_VERSION, HalData};
use crate::error::{Recorded, recording};
use crate::funct::FunctCall;
use crate::instance::InstanceHooks;
use crate::object::{Descriptor, ObjectHeader};
use crate::thread::ThreadRuntime;
use evo_common::hal::config::HalConfig;
use evo_common::hal::consts::HAL_LIB_NAME;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::lock::LockLevel;
use evo_common::hal::types::{CompState, CompType};
use evo_shared_memory::dlist::dlist_init;
use evo_shared_memory::{Arena, ArenaGuard, ArenaStats, SHM_NULL, ShmOff};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long an attaching process waits for the creator to publish the root.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(2);

thread_local! {
    static RT_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current OS thread as executing realtime functions.
pub(crate) struct RtScope {
    prev: bool,
}

impl RtScope {
    pub(crate) fn enter() -> Self {
        Self {
            prev: RT_CONTEXT.with(|c| c.replace(true)),
        }
    }
}

impl Drop for RtScope {
    fn drop(&mut self) {
        RT_CONTEXT.with(|c| c.set(self.prev));
    }
}

/// True while the current thread runs a realtime function.
pub fn in_rt_context() -> bool {
    RT_CONTEXT.with(|c| c.get())
}

/// Process-local state that cannot live in the shared segment.
#[derive(Default)]
pub(crate) struct LocalTables {
    pub(crate) functs: HashMap<u32, FunctCall>,
    pub(crate) hooks: HashMap<u32, InstanceHooks>,
    pub(crate) threads: HashMap<u32, Arc<ThreadRuntime>>,
}

pub(crate) struct HalInner {
    pub(crate) arena: Arc<Arena>,
    pub(crate) root: ShmOff,
    pub(crate) config: HalConfig,
    pub(crate) local: Mutex<LocalTables>,
}

impl Drop for HalInner {
    fn drop(&mut self) {
        let threads: Vec<_> = self.local.get_mut().threads.drain().map(|(_, t)| t).collect();
        for rt in threads {
            rt.shutdown();
        }
        debug!("HAL handle released");
    }
}

/// Handle to an attached HAL segment.
///
/// Cheap to clone; all clones share the same attachment and process-local
/// tables. The segment is detached when the last clone is dropped.
#[derive(Clone)]
pub struct Hal {
    pub(crate) inner: Arc<HalInner>,
}

impl std::fmt::Debug for Hal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hal")
            .field("segment", &self.inner.arena.name())
            .field("root", &self.inner.root)
            .finish()
    }
}

impl Hal {
    // ─── Attach ─────────────────────────────────────────────────────

    /// Attach to the segment described by `config`, creating and
    /// initializing it if this is the first process.
    pub fn open(config: HalConfig) -> HalResult<Self> {
        Self::open_inner(config).recorded()
    }

    /// Open a private, anonymous segment with default settings.
    pub fn anonymous() -> HalResult<Self> {
        Self::open(HalConfig::default())
    }

    fn open_inner(config: HalConfig) -> HalResult<Self> {
        config
            .validate()
            .map_err(|e| HalError::Invalid(e.to_string()))?;
        let size = config.segment.size;
        let (arena, created) = match &config.segment.name {
            Some(name) => Arena::open(name, size, HAL_LAYOUT_VERSION)?,
            None => (Arena::anonymous(size, HAL_LAYOUT_VERSION)?, true),
        };
        let arena = Arc::new(arena);

        if created {
            Self::bootstrap(arena, config)
        } else {
            let root = wait_for_root(&arena)?;
            info!(
                "Attached to HAL segment '{}'",
                arena.name().unwrap_or("anonymous")
            );
            Ok(Self::wrap(arena, root, config))
        }
    }

    fn wrap(arena: Arc<Arena>, root: ShmOff, config: HalConfig) -> Self {
        Self {
            inner: Arc::new(HalInner {
                arena,
                root,
                config,
                local: Mutex::new(LocalTables::default()),
            }),
        }
    }

    /// Lay out the root record and the library component of a new segment.
    fn bootstrap(arena: Arc<Arena>, config: HalConfig) -> HalResult<Self> {
        let arena_ref = Arc::clone(&arena);
        let g = arena_ref.lock();
        let root = arena.heap_alloc(&g, std::mem::size_of::<HalData>())?;
        let data = HalData::new(&config.epsilon_table(), config.scheduler.base_period_ns);
        // Fresh, zeroed block owned by this call
        unsafe { arena.ptr::<HalData>(root).write(data) };
        dlist_init(&arena, &g, root);

        let hal = Self::wrap(arena, root, config);
        let lib_id = hal.create_component(&g, HAL_LIB_NAME, CompType::HalLib)?;
        let lib = hal.find_by_id(&g, lib_id).ok_or_else(|| {
            HalError::Fault(format!("bootstrap component '{HAL_LIB_NAME}' vanished"))
        })?;
        hal.desc::<crate::component::CompDesc>(lib).set_state(CompState::Ready);
        hal.data().hal_lib_id.store(lib_id, Ordering::Release);

        hal.arena().set_root(&g, root);
        drop(g);
        info!(
            "Initialized HAL segment '{}' ({} bytes)",
            hal.arena().name().unwrap_or("anonymous"),
            hal.arena().size()
        );
        Ok(hal)
    }

    // ─── Accessors ──────────────────────────────────────────────────

    /// The underlying arena.
    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.inner.arena
    }

    pub(crate) fn arena_arc(&self) -> Arc<Arena> {
        Arc::clone(&self.inner.arena)
    }

    /// Configuration this handle was opened with.
    pub fn config(&self) -> &HalConfig {
        &self.inner.config
    }

    #[inline]
    pub(crate) fn data(&self) -> &HalData {
        // Root is written once at bootstrap and never moves
        unsafe { self.inner.arena.get::<HalData>(self.inner.root) }
    }

    #[inline]
    pub(crate) fn root(&self) -> ShmOff {
        self.inner.root
    }

    #[inline]
    pub(crate) fn header(&self, off: ShmOff) -> &ObjectHeader {
        // Offsets handed around inside the crate come from the registry
        unsafe { self.inner.arena.get::<ObjectHeader>(off) }
    }

    #[inline]
    pub(crate) fn desc<T: Descriptor>(&self, off: ShmOff) -> &T {
        debug_assert_eq!(self.header(off).kind(), Some(T::KIND));
        unsafe { self.inner.arena.get::<T>(off) }
    }

    pub(crate) fn local(&self) -> parking_lot::MutexGuard<'_, LocalTables> {
        self.inner.local.lock()
    }

    /// Take the HAL mutex. Refused from realtime context.
    pub(crate) fn guard(&self) -> HalResult<ArenaGuard<'_>> {
        if in_rt_context() {
            return Err(HalError::Permission(
                "HAL mutex requested from realtime context".into(),
            ));
        }
        Ok(self.inner.arena.lock())
    }

    /// Fail with `Permission` if any of `level` is currently locked.
    pub(crate) fn check_lock(&self, level: LockLevel, what: &str) -> HalResult<()> {
        if self.data().lock_level().intersects(level) {
            return Err(HalError::Permission(format!(
                "{what} blocked by lock level {:?}",
                self.data().lock_level()
            )));
        }
        Ok(())
    }

    /// Id of the library component that owns thread pins.
    pub(crate) fn hal_lib_id(&self) -> u32 {
        self.data().hal_lib_id.load(Ordering::Acquire)
    }

    // ─── Global operations ──────────────────────────────────────────

    /// Current lock level.
    pub fn lock_level(&self) -> LockLevel {
        self.data().lock_level()
    }

    /// Replace the lock level.
    pub fn set_lock_level(&self, level: LockLevel) -> HalResult<()> {
        let _g = self.guard().recorded()?;
        self.data().set_lock_level(level);
        info!("HAL lock level set to {:?}", level);
        Ok(())
    }

    /// Allocate `size` zeroed bytes of realtime storage, 8-byte aligned.
    ///
    /// The storage lives as long as the segment and is never freed.
    pub fn malloc(&self, size: usize) -> HalResult<ShmOff> {
        recording(|| {
            let g = self.guard()?;
            Ok(self.arena().alloc_rt(&g, size, 8)?)
        })
    }

    /// Arena allocation statistics.
    pub fn stats(&self) -> HalResult<ArenaStats> {
        let g = self.guard().recorded()?;
        Ok(self.arena().stats(&g))
    }
}

fn wait_for_root(arena: &Arena) -> HalResult<ShmOff> {
    let deadline = Instant::now() + BOOTSTRAP_TIMEOUT;
    loop {
        let root = arena.root();
        if root != SHM_NULL {
            return Ok(root);
        }
        if Instant::now() >= deadline {
            warn!("HAL segment has no root record after {:?}", BOOTSTRAP_TIMEOUT);
            return Err(HalError::Shm("segment was never bootstrapped".into()));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
