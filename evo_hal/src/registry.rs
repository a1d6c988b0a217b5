//! The object registry: one name-ordered list of every HAL object.
//!
//! Objects of all types live on the same intrusive list rooted in the
//! segment's root record, ordered by name so listings come out sorted.
//! Names are unique per type; members are unique per owning group.
//!
//! # Lifecycle
//!
//! ```text
//!   create ──► VALID ──free──► (gone)               refcnt == 0
//!                │
//!                └─invalidate──► !VALID ──sweep──► (gone)
//! ```
//!
//! Explicit deletion of a referenced object fails with `Busy`. Cascading
//! deletion (component exit) invalidates referenced objects instead and
//! leaves them for [`Hal::sweep`].
//!
//! # Usage
//!
//! ```rust
//! use evo_hal::{Hal, Selector, Visit};
//! use evo_common::prelude::*;
//!
//! # fn main() -> HalResult<()> {
//! let hal = Hal::anonymous()?;
//! hal.signal_new("spindle.speed", HalType::Float)?;
//! hal.signal_new("spindle.at-speed", HalType::Bit)?;
//!
//! let mut names = Vec::new();
//! hal.foreach(&Selector::of(ObjectType::Signal).prefix("spindle."), |obj| {
//!     names.push(obj.name.clone());
//!     Visit::Continue
//! })?;
//! assert_eq!(names, ["spindle.at-speed", "spindle.speed"]);
//! # Ok(())
//! # }
//! ```

use crate::context::Hal;
use crate::error::{Recorded, recording};
use crate::object::{Descriptor, ObjectHeader};
use evo_common::hal::consts::HAL_NAME_LEN;
use evo_common::hal::error::{HalError, HalResult};
use evo_common::hal::types::ObjectType;
use evo_shared_memory::dlist::{DListIter, dlist_init, dlist_insert_before, dlist_iter, dlist_remove};
use evo_shared_memory::{ArenaGuard, SHM_NULL, ShmOff};
use tracing::{debug, error, trace};

// ─── Selection ──────────────────────────────────────────────────────

/// Filter applied during registry iteration. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct Selector<'a> {
    /// Object type
    pub kind: Option<ObjectType>,
    /// Exact id
    pub id: Option<u32>,
    /// Direct owner id
    pub owner_id: Option<u32>,
    /// Owning component id, resolved through instances
    pub owning_comp: Option<u32>,
    /// Exact name
    pub name: Option<&'a str>,
    /// Name prefix
    pub prefix: Option<&'a str>,
    /// Also visit invalidated objects
    pub include_invalid: bool,
}

impl<'a> Selector<'a> {
    /// Everything of type `kind`.
    pub fn of(kind: ObjectType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Everything, any type.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to an exact name.
    pub fn named(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Restrict to names starting with `prefix`.
    pub fn prefix(mut self, prefix: &'a str) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Restrict to one id.
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Restrict to objects directly owned by `owner_id`.
    pub fn owner(mut self, owner_id: u32) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    /// Restrict to objects owned by component `comp_id`, directly or
    /// through one of its instances.
    pub fn owning_comp(mut self, comp_id: u32) -> Self {
        self.owning_comp = Some(comp_id);
        self
    }

    /// Also match invalidated objects.
    pub fn with_invalid(mut self) -> Self {
        self.include_invalid = true;
        self
    }
}

/// Visitor verdict.
#[derive(Debug)]
pub enum Visit {
    /// Keep going
    Continue,
    /// Stop successfully after this object
    Stop,
    /// Stop and fail the iteration with this error
    Fail(HalError),
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    /// Unique id
    pub id: u32,
    /// Owner id, 0 for unowned objects
    pub owner_id: u32,
    /// Object type
    pub kind: ObjectType,
    /// Current (possibly aliased) name
    pub name: String,
    /// Reference count
    pub refcnt: u32,
    /// False once invalidated
    pub valid: bool,
}

/// Resumable iteration state for [`Hal::next_object`].
///
/// The registry lock is only held during each step, so objects may come
/// and go between steps; the cursor resumes after the last returned name.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    sel: Selector<'a>,
    last: Option<(String, u32)>,
}

impl<'a> Cursor<'a> {
    /// Cursor positioned before the first match of `sel`.
    pub fn new(sel: Selector<'a>) -> Self {
        Self { sel, last: None }
    }

    /// Rewind to the start.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

// ─── Internal registry primitives ───────────────────────────────────

impl Hal {
    pub(crate) fn objects(&self) -> DListIter<'_> {
        dlist_iter(self.arena(), self.root())
    }

    #[inline]
    pub(crate) fn name_of(&self, off: ShmOff) -> &str {
        self.arena().str_at(self.header(off).name_off())
    }

    pub(crate) fn check_name(&self, kind: ObjectType, name: &str) -> HalResult<()> {
        if name.is_empty() {
            return Err(HalError::Invalid(format!("{kind} name is empty")));
        }
        if name.len() > HAL_NAME_LEN {
            return Err(HalError::Invalid(format!(
                "{kind} name '{name}' is longer than {HAL_NAME_LEN}"
            )));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(HalError::Invalid(format!(
                "{kind} name '{name}' contains whitespace"
            )));
        }
        Ok(())
    }

    /// Live object of `kind` named `name`.
    pub(crate) fn find(&self, _g: &ArenaGuard<'_>, kind: ObjectType, name: &str) -> Option<ShmOff> {
        for off in self.objects() {
            let n = self.name_of(off);
            if n > name {
                break;
            }
            let hdr = self.header(off);
            if n == name && hdr.kind() == Some(kind) && hdr.is_valid() {
                return Some(off);
            }
        }
        None
    }

    /// Like [`Hal::find`], failing with `NotFound`.
    pub(crate) fn require(&self, g: &ArenaGuard<'_>, kind: ObjectType, name: &str) -> HalResult<ShmOff> {
        self.find(g, kind, name)
            .ok_or_else(|| HalError::not_found(kind, name))
    }

    /// Object of `kind` named `name` that can still drop a reference: the
    /// live one, else an invalidated one that is still referenced.
    pub(crate) fn require_retained(&self, g: &ArenaGuard<'_>, kind: ObjectType, name: &str) -> HalResult<ShmOff> {
        if let Some(off) = self.find(g, kind, name) {
            return Ok(off);
        }
        self.objects()
            .find(|&off| {
                let hdr = self.header(off);
                hdr.kind() == Some(kind)
                    && !hdr.is_valid()
                    && hdr.refcnt() > 0
                    && self.name_of(off) == name
            })
            .ok_or_else(|| HalError::not_found(kind, name))
    }

    /// Drop one reference on object `id`, live or invalidated.
    pub(crate) fn decref_id(&self, _g: &ArenaGuard<'_>, kind: ObjectType, id: u32) -> HalResult<u32> {
        let off = self
            .find_id_unlocked(id)
            .filter(|&off| self.header(off).kind() == Some(kind))
            .ok_or_else(|| HalError::not_found(kind, id.to_string()))?;
        let hdr = self.header(off);
        let left = hdr.decref();
        if !hdr.is_valid() && left == 0 {
            debug!("Last reference on retired '{}' dropped", self.name_of(off));
        }
        Ok(left)
    }

    /// Live member `name` of group `group_id`.
    pub(crate) fn find_member(&self, _g: &ArenaGuard<'_>, group_id: u32, name: &str) -> Option<ShmOff> {
        self.objects().find(|&off| {
            let hdr = self.header(off);
            hdr.kind() == Some(ObjectType::Member)
                && hdr.owner_id() == group_id
                && hdr.is_valid()
                && self.name_of(off) == name
        })
    }

    /// Live object with `id`, any type.
    pub(crate) fn find_by_id(&self, _g: &ArenaGuard<'_>, id: u32) -> Option<ShmOff> {
        self.objects().find(|&off| {
            let hdr = self.header(off);
            hdr.id() == id && hdr.is_valid()
        })
    }

    fn find_id_unlocked(&self, id: u32) -> Option<ShmOff> {
        self.objects().find(|&off| self.header(off).id() == id)
    }

    /// Component that ultimately owns `hdr`, resolving instance owners.
    pub(crate) fn owning_comp_of(&self, hdr: &ObjectHeader) -> Option<u32> {
        if hdr.owner_id() == 0 {
            return None;
        }
        let owner = self.find_id_unlocked(hdr.owner_id())?;
        let owner_hdr = self.header(owner);
        match owner_hdr.kind() {
            Some(ObjectType::Component) => Some(owner_hdr.id()),
            Some(ObjectType::Instance) => {
                let comp_id = owner_hdr.owner_id();
                let comp = self
                    .find_id_unlocked(comp_id)
                    .filter(|&c| self.header(c).kind() == Some(ObjectType::Component));
                if comp.is_none() {
                    error!(
                        "BUG: instance '{}' refers to missing component {}",
                        self.name_of(owner),
                        comp_id
                    );
                }
                comp.map(|_| comp_id)
            }
            _ => None,
        }
    }

    fn matches(&self, sel: &Selector<'_>, off: ShmOff, hdr: &ObjectHeader) -> bool {
        if !sel.include_invalid && !hdr.is_valid() {
            return false;
        }
        if sel.kind.is_some_and(|k| hdr.kind() != Some(k)) {
            return false;
        }
        if sel.id.is_some_and(|id| hdr.id() != id) {
            return false;
        }
        if sel.owner_id.is_some_and(|o| hdr.owner_id() != o) {
            return false;
        }
        if sel.name.is_some_and(|n| self.name_of(off) != n) {
            return false;
        }
        if sel.prefix.is_some_and(|p| !self.name_of(off).starts_with(p)) {
            return false;
        }
        if let Some(comp) = sel.owning_comp {
            if self.owning_comp_of(hdr) != Some(comp) {
                return false;
            }
        }
        true
    }

    /// Visit every object matching `sel` while the mutex is held.
    ///
    /// Returns the number of objects visited. The visitor may remove the
    /// object it is handed.
    pub(crate) fn foreach_locked<F>(&self, _g: &ArenaGuard<'_>, sel: &Selector<'_>, mut visit: F) -> HalResult<usize>
    where
        F: FnMut(ShmOff, &ObjectHeader) -> Visit,
    {
        let mut count = 0;
        for off in self.objects() {
            let hdr = self.header(off);
            if !self.matches(sel, off, hdr) {
                continue;
            }
            count += 1;
            match visit(off, hdr) {
                Visit::Continue => {}
                Visit::Stop => break,
                Visit::Fail(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Offsets of every object matching `sel`.
    pub(crate) fn collect(&self, g: &ArenaGuard<'_>, sel: &Selector<'_>) -> Vec<ShmOff> {
        let mut out = Vec::new();
        // The collecting visitor never fails
        let _ = self.foreach_locked(g, sel, |off, _| {
            out.push(off);
            Visit::Continue
        });
        out
    }

    pub(crate) fn summary(&self, off: ShmOff) -> ObjectSummary {
        let hdr = self.header(off);
        ObjectSummary {
            id: hdr.id(),
            owner_id: hdr.owner_id(),
            kind: hdr.kind().unwrap_or(ObjectType::Pin),
            name: self.name_of(off).to_string(),
            refcnt: hdr.refcnt(),
            valid: hdr.is_valid(),
        }
    }

    /// Allocate, name and link a new descriptor.
    ///
    /// `build` receives the finished header and returns the descriptor to
    /// store. Fails with `Exists` when the name is taken.
    pub(crate) fn create_object<T, F>(&self, g: &ArenaGuard<'_>, name: &str, owner_id: u32, build: F) -> HalResult<ShmOff>
    where
        T: Descriptor,
        F: FnOnce(ObjectHeader) -> T,
    {
        self.check_name(T::KIND, name)?;
        self.check_unique(g, T::KIND, name, owner_id)?;

        let arena = self.arena();
        let off = arena.heap_alloc(g, std::mem::size_of::<T>())?;
        let name_off = match arena.alloc_str(g, name) {
            Ok(n) => n,
            Err(e) => {
                arena.heap_free(g, off)?;
                return Err(e.into());
            }
        };
        let id = self.data().next_id();
        let desc = build(ObjectHeader::new(T::KIND, id, owner_id, name_off));
        // Zeroed block just allocated under the mutex
        unsafe { arena.ptr::<T>(off).write(desc) };
        dlist_init(arena, g, off);
        self.insert_sorted(g, off);
        trace!("Created {} '{}' (id {})", T::KIND, name, id);
        Ok(off)
    }

    pub(crate) fn check_unique(&self, g: &ArenaGuard<'_>, kind: ObjectType, name: &str, owner_id: u32) -> HalResult<()> {
        let taken = match kind {
            ObjectType::Member => self.find_member(g, owner_id, name).is_some(),
            _ => self.find(g, kind, name).is_some(),
        };
        if taken {
            return Err(HalError::exists(kind, name));
        }
        Ok(())
    }

    fn insert_sorted(&self, g: &ArenaGuard<'_>, off: ShmOff) {
        let name = self.name_of(off);
        let at = self
            .objects()
            .find(|&o| o != off && self.name_of(o) > name)
            .unwrap_or(self.root());
        dlist_insert_before(self.arena(), g, at, off);
    }

    /// Give `off` a new name, or restore its original name with `None`.
    pub(crate) fn rename_object(&self, g: &ArenaGuard<'_>, off: ShmOff, alias: Option<&str>) -> HalResult<()> {
        let arena = self.arena();
        let hdr = self.header(off);
        let kind = hdr.kind().unwrap_or(ObjectType::Pin);
        match alias {
            Some(alias) => {
                self.check_name(kind, alias)?;
                self.check_unique(g, kind, alias, hdr.owner_id())?;
                let new_off = arena.alloc_str(g, alias)?;
                let old = hdr.name_off();
                if hdr.orig_name_off() == SHM_NULL {
                    hdr.set_orig_name_off(old);
                } else {
                    arena.heap_free(g, old)?;
                }
                hdr.set_name_off(new_off);
            }
            None => {
                let orig = hdr.orig_name_off();
                if orig == SHM_NULL {
                    return Ok(());
                }
                let orig_name = arena.str_at(orig).to_string();
                self.check_unique(g, kind, &orig_name, hdr.owner_id())?;
                let old = hdr.name_off();
                hdr.set_name_off(orig);
                hdr.set_orig_name_off(SHM_NULL);
                arena.heap_free(g, old)?;
            }
        }
        dlist_remove(arena, g, off);
        self.insert_sorted(g, off);
        Ok(())
    }

    /// Unlink and release a descriptor. `Busy` while referenced.
    pub(crate) fn free_object(&self, g: &ArenaGuard<'_>, off: ShmOff) -> HalResult<()> {
        let hdr = self.header(off);
        if hdr.refcnt() > 0 {
            return Err(HalError::Busy(format!(
                "{} '{}' has {} reference(s)",
                hdr.kind().map(|k| k.as_str()).unwrap_or("object"),
                self.name_of(off),
                hdr.refcnt()
            )));
        }
        trace!("Freeing {:?} '{}'", hdr.kind(), self.name_of(off));
        let arena = self.arena();
        let name = hdr.name_off();
        let orig = hdr.orig_name_off();
        dlist_remove(arena, g, off);
        arena.heap_free(g, name)?;
        if orig != SHM_NULL {
            arena.heap_free(g, orig)?;
        }
        arena.heap_free(g, off)?;
        Ok(())
    }

    /// Free `off` now if unreferenced, otherwise invalidate it for sweep.
    pub(crate) fn retire(&self, g: &ArenaGuard<'_>, off: ShmOff) -> HalResult<()> {
        let hdr = self.header(off);
        if hdr.refcnt() > 0 {
            debug!(
                "'{}' still has {} reference(s), deferring to sweep",
                self.name_of(off),
                hdr.refcnt()
            );
            hdr.clear_flags(crate::object::ObjectFlags::VALID);
            return Ok(());
        }
        self.free_object(g, off)
    }
}

// ─── Public registry API ────────────────────────────────────────────

impl Hal {
    /// Visit every object matching `sel` in name order.
    ///
    /// Returns how many objects were visited, including one that stopped
    /// the iteration. A [`Visit::Fail`] aborts with that error.
    pub fn foreach<F>(&self, sel: &Selector<'_>, mut visit: F) -> HalResult<usize>
    where
        F: FnMut(&ObjectSummary) -> Visit,
    {
        recording(|| {
            let g = self.guard()?;
            self.foreach_locked(&g, sel, |off, _| visit(&self.summary(off)))
        })
    }

    /// All objects matching `sel`.
    pub fn list(&self, sel: &Selector<'_>) -> HalResult<Vec<ObjectSummary>> {
        let g = self.guard().recorded()?;
        Ok(self
            .collect(&g, sel)
            .into_iter()
            .map(|off| self.summary(off))
            .collect())
    }

    /// Number of objects matching `sel`.
    pub fn count(&self, sel: &Selector<'_>) -> HalResult<usize> {
        self.foreach(sel, |_| Visit::Continue)
    }

    /// Look up one live object by type and name.
    pub fn lookup(&self, kind: ObjectType, name: &str) -> HalResult<ObjectSummary> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, kind, name)?;
            Ok(self.summary(off))
        })
    }

    /// Advance `cursor` to the next matching object.
    pub fn next_object(&self, cursor: &mut Cursor<'_>) -> HalResult<Option<ObjectSummary>> {
        let _g = self.guard().recorded()?;
        let last = cursor.last.clone();
        let mut resumed = last.is_none();
        for off in self.objects() {
            let hdr = self.header(off);
            if let (false, Some((last_name, last_id))) = (resumed, &last) {
                if hdr.id() == *last_id {
                    resumed = true;
                    continue;
                }
                if self.name_of(off) <= last_name.as_str() {
                    continue;
                }
                resumed = true;
            }
            if self.matches(&cursor.sel, off, hdr) {
                let summary = self.summary(off);
                cursor.last = Some((summary.name.clone(), summary.id));
                return Ok(Some(summary));
            }
        }
        Ok(None)
    }

    /// Take a reference on an object, blocking its explicit deletion.
    pub fn incref(&self, kind: ObjectType, name: &str) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, kind, name)?;
            Ok(self.header(off).incref())
        })
    }

    /// Drop a reference taken with [`Hal::incref`].
    ///
    /// Also reaches an object invalidated while referenced, so the next
    /// [`Hal::sweep`] can reclaim it.
    pub fn decref(&self, kind: ObjectType, name: &str) -> HalResult<u32> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require_retained(&g, kind, name)?;
            self.decref_id(&g, kind, self.header(off).id())
        })
    }

    /// Mark an object invalid. It disappears from lookups and is freed by
    /// the next [`Hal::sweep`] once unreferenced.
    pub fn invalidate(&self, kind: ObjectType, name: &str) -> HalResult<()> {
        recording(|| {
            let g = self.guard()?;
            let off = self.require(&g, kind, name)?;
            self.header(off)
                .clear_flags(crate::object::ObjectFlags::VALID);
            debug!("Invalidated {} '{}'", kind, name);
            Ok(())
        })
    }

    /// Free every invalidated, unreferenced object. Returns how many were
    /// freed.
    ///
    /// Runs entirely under the HAL mutex, so no other traversal can be in
    /// progress.
    pub fn sweep(&self) -> HalResult<usize> {
        recording(|| {
            let g = self.guard()?;
            let mut freed = 0;
            for off in self.objects() {
                let hdr = self.header(off);
                if !hdr.is_valid() && hdr.refcnt() == 0 {
                    self.free_object(&g, off)?;
                    freed += 1;
                }
            }
            if freed > 0 {
                debug!("Sweep freed {} object(s)", freed);
            }
            Ok(freed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_common::hal::types::HalType;

    fn hal_with_signals(names: &[&str]) -> Hal {
        let hal = Hal::anonymous().unwrap();
        for n in names {
            hal.signal_new(n, HalType::Float).unwrap();
        }
        hal
    }

    #[test]
    fn test_objects_iterate_in_name_order() {
        let hal = hal_with_signals(&["c", "a", "b"]);
        let names: Vec<_> = hal
            .list(&Selector::of(ObjectType::Signal))
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_name_rejected_per_type() {
        let hal = hal_with_signals(&["x"]);
        assert!(matches!(
            hal.signal_new("x", HalType::Bit),
            Err(HalError::Exists { .. })
        ));
        // Same name, different type is fine
        hal.group_new("x", 0, 0).unwrap();
    }

    #[test]
    fn test_bad_names_rejected() {
        let hal = Hal::anonymous().unwrap();
        assert!(matches!(hal.signal_new("", HalType::Bit), Err(HalError::Invalid(_))));
        let long = "n".repeat(HAL_NAME_LEN + 1);
        assert!(matches!(hal.signal_new(&long, HalType::Bit), Err(HalError::Invalid(_))));
    }

    #[test]
    fn test_foreach_stop_and_fail() {
        let hal = hal_with_signals(&["a", "b", "c"]);
        let sel = Selector::of(ObjectType::Signal);
        let visited = hal.foreach(&sel, |_| Visit::Stop).unwrap();
        assert_eq!(visited, 1);
        let err = hal
            .foreach(&sel, |o| {
                if o.name == "b" {
                    Visit::Fail(HalError::Invalid("stop at b".into()))
                } else {
                    Visit::Continue
                }
            })
            .unwrap_err();
        assert!(matches!(err, HalError::Invalid(_)));
    }

    #[test]
    fn test_cursor_resumes_after_deletion() {
        let hal = hal_with_signals(&["a", "b", "c"]);
        let mut cursor = Cursor::new(Selector::of(ObjectType::Signal));
        let first = hal.next_object(&mut cursor).unwrap().unwrap();
        assert_eq!(first.name, "a");
        hal.signal_delete("a").unwrap();
        let second = hal.next_object(&mut cursor).unwrap().unwrap();
        assert_eq!(second.name, "b");
        assert_eq!(hal.next_object(&mut cursor).unwrap().unwrap().name, "c");
        assert!(hal.next_object(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_invalidate_then_sweep() {
        let hal = hal_with_signals(&["s"]);
        hal.incref(ObjectType::Signal, "s").unwrap();
        hal.invalidate(ObjectType::Signal, "s").unwrap();
        assert!(hal.lookup(ObjectType::Signal, "s").is_err());
        assert_eq!(hal.count(&Selector::of(ObjectType::Signal).with_invalid()).unwrap(), 1);

        // Still referenced: sweep leaves it
        assert_eq!(hal.sweep().unwrap(), 0);

        // The name still reaches the retired object to drop the reference
        assert_eq!(hal.decref(ObjectType::Signal, "s").unwrap(), 0);
        assert!(hal.decref(ObjectType::Signal, "s").is_err());
        assert_eq!(hal.sweep().unwrap(), 1);
        assert_eq!(hal.count(&Selector::of(ObjectType::Signal).with_invalid()).unwrap(), 0);
    }
}
