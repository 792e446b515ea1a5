//! Handle table
//!
//! Maps the small integer ids native code holds to managed objects. The
//! table owns the id -> object mapping only; objects stay owned by the
//! runtime and are kept alive by the table's reference while a handle is
//! open.
//!
//! Ids below [`RESERVED_HANDLES`] are immutable: they hold the well-known
//! singletons, closing them is a no-op and duplicating them yields the same
//! id. Dynamic ids start at [`RESERVED_HANDLES`].
//!
//! Using a released id (resolve, close, dup) is a contract violation and
//! panics. At the `extern "C"` boundary that aborts the process.

use std::cell::Cell;

use super::abi::MAX_HANDLE_ID;
use crate::vm::ObjRef;

/// First dynamically allocated id.
pub const RESERVED_HANDLES: u32 = 256;

struct Slot {
    object: Option<ObjRef>,
    /// Bumped on every release so scope records can detect reuse.
    generation: u32,
}

/// Marks the start of a trampoline frame. See [`HandleTable::open_scope`].
#[derive(Debug)]
#[must_use = "a scope must be closed"]
pub struct ScopeMark {
    depth: usize,
    log_len: usize,
}

pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Live dynamic handles.
    live: usize,
    /// Open scope count.
    scope_depth: usize,
    /// (id, generation) of every allocation made while a scope is open.
    scope_log: Vec<(u32, u32)>,
    total_allocated: u64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        let slots = (0..RESERVED_HANDLES)
            .map(|_| Slot {
                object: None,
                generation: 0,
            })
            .collect();
        Self {
            slots,
            free: Vec::new(),
            live: 0,
            scope_depth: 0,
            scope_log: Vec::new(),
            total_allocated: 0,
        }
    }

    /// Populates one of the reserved ids. Done once at context setup.
    pub fn install_reserved(&mut self, id: u32, object: ObjRef) {
        assert!(id != 0 && id < RESERVED_HANDLES, "{} is not a reserved id", id);
        let slot = &mut self.slots[id as usize];
        assert!(slot.object.is_none(), "reserved handle {} installed twice", id);
        slot.object = Some(object);
    }

    /// Opens a new handle for `object`.
    ///
    /// Every call yields a distinct handle even for the same object.
    pub fn alloc(&mut self, object: ObjRef) -> u32 {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.slots.len() as u32;
                assert!(id <= MAX_HANDLE_ID, "handle table exhausted");
                self.slots.push(Slot {
                    object: None,
                    generation: 0,
                });
                id
            }
        };
        let slot = &mut self.slots[id as usize];
        debug_assert!(slot.object.is_none());
        slot.object = Some(object);
        self.live += 1;
        self.total_allocated += 1;
        if self.scope_depth > 0 {
            self.scope_log.push((id, slot.generation));
        }
        id
    }

    pub fn try_resolve(&self, id: u32) -> Option<&ObjRef> {
        self.slots.get(id as usize).and_then(|s| s.object.as_ref())
    }

    /// O(1) lookup. Panics on a null, released or never-issued id.
    pub fn resolve(&self, id: u32) -> ObjRef {
        match self.try_resolve(id) {
            Some(obj) => obj.clone(),
            None => panic!("invalid handle {}", id),
        }
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.try_resolve(id).is_some()
    }

    pub fn is_reserved(id: u32) -> bool {
        id < RESERVED_HANDLES
    }

    /// Releases a handle. Reserved ids are ignored.
    ///
    /// Panics on double release.
    pub fn release(&mut self, id: u32) {
        if Self::is_reserved(id) {
            return;
        }
        let slot = match self.slots.get_mut(id as usize) {
            Some(slot) if slot.object.is_some() => slot,
            _ => panic!("double release of handle {}", id),
        };
        slot.object = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        self.free.push(id);
    }

    /// A second, independently releasable handle to the same object.
    pub fn dup(&mut self, id: u32) -> u32 {
        if Self::is_reserved(id) {
            return id;
        }
        let object = self.resolve(id);
        self.alloc(object)
    }

    pub fn generation(&self, id: u32) -> Option<u32> {
        self.slots.get(id as usize).map(|s| s.generation)
    }

    /// Live dynamic handles.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// Starts recording allocations for a trampoline frame.
    pub fn open_scope(&mut self) -> ScopeMark {
        self.scope_depth += 1;
        ScopeMark {
            depth: self.scope_depth,
            log_len: self.scope_log.len(),
        }
    }

    /// Ends a frame: every handle allocated since `mark` that is still open
    /// (and not reused since) is released. Returns how many were released.
    ///
    /// Scopes must be closed innermost first.
    pub fn close_scope(&mut self, mark: ScopeMark) -> usize {
        assert_eq!(
            mark.depth, self.scope_depth,
            "handle scopes closed out of order"
        );
        self.scope_depth -= 1;
        let records: Vec<(u32, u32)> = self.scope_log.drain(mark.log_len..).collect();
        let mut released = 0;
        for (id, generation) in records {
            let slot = &self.slots[id as usize];
            if slot.object.is_some() && slot.generation == generation {
                self.release(id);
                released += 1;
            }
        }
        released
    }
}

/// Managed-side wrapper that acquires a native id on first use.
///
/// Once closed, `is_native` reports false again and `to_native` would hand
/// out a fresh id.
pub struct ManagedHandle {
    delegate: ObjRef,
    id: Cell<Option<u32>>,
}

impl ManagedHandle {
    pub fn new(delegate: ObjRef) -> Self {
        Self {
            delegate,
            id: Cell::new(None),
        }
    }

    pub fn delegate(&self) -> &ObjRef {
        &self.delegate
    }

    pub fn is_native(&self) -> bool {
        self.id.get().is_some()
    }

    pub fn id(&self) -> Option<u32> {
        self.id.get()
    }

    pub fn to_native(&self, table: &mut HandleTable) -> u32 {
        match self.id.get() {
            Some(id) => id,
            None => {
                let id = table.alloc(self.delegate.clone());
                self.id.set(Some(id));
                id
            }
        }
    }

    pub fn close(&self, table: &mut HandleTable) {
        if let Some(id) = self.id.take() {
            table.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;
    use proptest::prelude::*;
    use std::rc::Rc;

    #[test]
    fn test_alloc_resolve_release() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let obj = vm.new_str("x");
        let id = table.alloc(obj.clone());
        assert!(id >= RESERVED_HANDLES);
        assert!(Rc::ptr_eq(&table.resolve(id), &obj));
        assert_eq!(table.live_count(), 1);
        table.release(id);
        assert_eq!(table.live_count(), 0);
        assert!(!table.is_live(id));
    }

    #[test]
    fn test_alloc_is_distinct_per_call() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let obj = vm.new_int(1);
        let a = table.alloc(obj.clone());
        let b = table.alloc(obj);
        assert_ne!(a, b);
        table.release(a);
        assert!(table.is_live(b));
    }

    #[test]
    fn test_released_ids_are_reused() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let id = table.alloc(vm.none());
        let generation = table.generation(id).unwrap();
        table.release(id);
        let again = table.alloc(vm.none());
        assert_eq!(id, again);
        assert_ne!(table.generation(again).unwrap(), generation);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_panics() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let id = table.alloc(vm.none());
        table.release(id);
        table.release(id);
    }

    #[test]
    #[should_panic(expected = "invalid handle")]
    fn test_resolve_released_panics() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let id = table.alloc(vm.none());
        table.release(id);
        table.resolve(id);
    }

    #[test]
    fn test_reserved_ids_are_immutable() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        table.install_reserved(1, vm.none());
        assert_eq!(table.dup(1), 1);
        table.release(1);
        table.release(1);
        assert!(table.is_live(1));
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_dup_is_independent() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let obj = vm.new_list(vec![]);
        let a = table.alloc(obj.clone());
        let b = table.dup(a);
        assert_ne!(a, b);
        table.release(a);
        assert!(Rc::ptr_eq(&table.resolve(b), &obj));
    }

    #[test]
    fn test_scope_releases_leftovers() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let outside = table.alloc(vm.none());
        let mark = table.open_scope();
        let closed = table.alloc(vm.new_int(1));
        let leaked = table.alloc(vm.new_int(2));
        table.release(closed);
        // Reusing `closed`'s id must not make the scope release it.
        let reused = {
            let inner = table.open_scope();
            let reused = table.alloc(vm.new_int(3));
            assert_eq!(table.close_scope(inner), 1);
            reused
        };
        assert!(!table.is_live(reused));
        assert_eq!(table.close_scope(mark), 1);
        assert!(!table.is_live(leaked));
        assert!(table.is_live(outside));
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_managed_handle_lifecycle() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let handle = ManagedHandle::new(vm.new_str("s"));
        assert!(!handle.is_native());
        let id = handle.to_native(&mut table);
        assert_eq!(handle.to_native(&mut table), id);
        assert!(handle.is_native());
        handle.close(&mut table);
        assert!(!handle.is_native());
        assert_eq!(table.live_count(), 0);
        handle.close(&mut table);
    }

    proptest! {
        #[test]
        fn prop_resolve_returns_allocated(count in 1usize..64, release_mask in any::<u64>()) {
            let vm = Vm::new();
            let mut table = HandleTable::new();
            let objects: Vec<_> = (0..count).map(|i| vm.new_int(i as i128)).collect();
            let ids: Vec<u32> = objects.iter().map(|o| table.alloc(o.clone())).collect();
            for (i, id) in ids.iter().enumerate() {
                if release_mask & (1 << i) != 0 {
                    table.release(*id);
                }
            }
            for (i, id) in ids.iter().enumerate() {
                if release_mask & (1 << i) == 0 {
                    prop_assert!(Rc::ptr_eq(&table.resolve(*id), &objects[i]));
                } else {
                    prop_assert!(!table.is_live(*id));
                }
            }
            let expected = (0..count).filter(|i| release_mask & (1 << i) == 0).count();
            prop_assert_eq!(table.live_count(), expected);
        }
    }
}
