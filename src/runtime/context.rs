//! Bridge context
//!
//! One `BridgeContext` per managed runtime instance. It owns the handle
//! table, the well-known and persistent global tables, the native argument
//! stack and the native backend state. All of it is confined to the thread
//! owning the runtime: objects are `Rc`-based, so the context is neither
//! `Send` nor `Sync`.

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::rc::{Rc, Weak};

use serde::Serialize;

use super::abi::{BoxedWord, WordKind};
use super::arg_stack::{ArgRegion, ArgStack};
use super::globals::{GlobalHandles, GlobalStorage, WellKnown};
use super::handles::HandleTable;
use super::signature::{CONTEXT_MEMBER_COUNT, ContextMember};
use super::stubs::AbiContext;
use super::trampoline::{CallConvention, NativeMethod, Receiver};
use crate::backend::debug::{DebugHandles, DebugLeak};
use crate::backend::{BackendError, NativeBackend};
use crate::config::BridgeConfig;
use crate::vm::{BuiltinType, ObjRef, Object, PendingError, Vm};

pub struct BridgeContext {
    vm: Rc<Vm>,
    config: BridgeConfig,
    handles: RefCell<HandleTable>,
    globals: GlobalHandles,
    persistent: RefCell<GlobalStorage>,
    /// Allocated on first use.
    arg_stack: RefCell<Option<ArgStack>>,
    backend: RefCell<NativeBackend>,
    debug: RefCell<DebugHandles>,
    /// Caught exceptions saved across foreign calls, innermost last.
    saved_caught: RefCell<Vec<Option<PendingError>>>,
    upcalls: RefCell<[u64; CONTEXT_MEMBER_COUNT]>,
    foreign_depth: Cell<usize>,
    this: Weak<BridgeContext>,
    /// Loaded extension code, kept mapped until the context is dropped.
    /// Methods reach their code only through a live context.
    extension_code: RefCell<Vec<Box<dyn Any>>>,
}

/// Per-entry call counts.
#[derive(Debug, Clone, Serialize)]
pub struct UpcallStats {
    pub total: u64,
    pub entries: BTreeMap<&'static str, u64>,
}

impl BridgeContext {
    pub fn new(vm: Rc<Vm>, config: BridgeConfig) -> Rc<Self> {
        let mut handles = HandleTable::new();
        let globals = GlobalHandles::install(&vm, &mut handles);
        Rc::new_cyclic(|this| Self {
            vm,
            config,
            handles: RefCell::new(handles),
            globals,
            persistent: RefCell::new(GlobalStorage::new()),
            arg_stack: RefCell::new(None),
            backend: RefCell::new(NativeBackend::new()),
            debug: RefCell::new(DebugHandles::new()),
            saved_caught: RefCell::new(Vec::new()),
            upcalls: RefCell::new([0; CONTEXT_MEMBER_COUNT]),
            foreign_depth: Cell::new(0),
            this: this.clone(),
            extension_code: RefCell::new(Vec::new()),
        })
    }

    /// Recovers the context behind a native context pointer.
    ///
    /// # Safety
    /// `abi` must be a context handed out by this crate whose owning
    /// `BridgeContext` is still alive.
    pub unsafe fn from_abi<'a>(abi: *const AbiContext) -> &'a BridgeContext {
        assert!(!abi.is_null(), "null context pointer");
        unsafe { &*((*abi).owner() as *const BridgeContext) }
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn globals(&self) -> &GlobalHandles {
        &self.globals
    }

    pub fn well_known(&self, which: WellKnown) -> ObjRef {
        self.globals.get(which).clone()
    }

    pub fn handles(&self) -> Ref<'_, HandleTable> {
        self.handles.borrow()
    }

    pub fn handles_mut(&self) -> RefMut<'_, HandleTable> {
        self.handles.borrow_mut()
    }

    pub(crate) fn persistent_mut(&self) -> RefMut<'_, GlobalStorage> {
        self.persistent.borrow_mut()
    }

    /// Keeps `code` alive as long as this context.
    pub fn retain_extension_code(&self, code: Box<dyn Any>) {
        self.extension_code.borrow_mut().push(code);
    }

    pub(crate) fn debug_handles(&self) -> RefMut<'_, DebugHandles> {
        self.debug.borrow_mut()
    }

    pub(crate) fn weak(&self) -> Weak<BridgeContext> {
        self.this.clone()
    }

    // =========================================================================
    // Boxing
    // =========================================================================

    /// Word for `obj`: inline primitive when the fast path allows it, the
    /// reserved id for value singletons, a fresh handle otherwise.
    pub fn box_object(&self, obj: &ObjRef) -> BoxedWord {
        if self.config.boxing_fast_path {
            match &**obj {
                Object::Int(i) => {
                    if let Ok(small) = i32::try_from(*i) {
                        return BoxedWord::int(small);
                    }
                }
                Object::Float(d) => return BoxedWord::double(*d),
                _ => {}
            }
        }
        if let Some(word) = self.globals.singleton_word(obj) {
            return word;
        }
        self.new_handle(obj.clone())
    }

    /// Integers outside `i32` always get a handle to an int object.
    pub fn box_long(&self, i: i64) -> BoxedWord {
        if self.config.boxing_fast_path {
            if let Some(word) = BoxedWord::try_int(i) {
                return word;
            }
        }
        self.new_handle(self.vm.new_int(i as i128))
    }

    pub fn box_double(&self, d: f64) -> BoxedWord {
        if self.config.boxing_fast_path {
            BoxedWord::double(d)
        } else {
            self.new_handle(self.vm.new_float(d))
        }
    }

    pub fn new_handle(&self, obj: ObjRef) -> BoxedWord {
        BoxedWord::handle(self.handles.borrow_mut().alloc(obj))
    }

    /// Object behind a word. Primitives become fresh managed objects; null
    /// yields None. Panics on a stale handle or an invalid word.
    pub fn materialize(&self, word: BoxedWord) -> Option<ObjRef> {
        match word.kind() {
            WordKind::Null => None,
            WordKind::Handle(id) => Some(self.handles.borrow().resolve(id)),
            WordKind::Int(i) => Some(self.vm.new_int(i as i128)),
            WordKind::Double(d) => Some(self.vm.new_float(d)),
            WordKind::Invalid(bits) => panic!("invalid boxed word 0x{:016x}", bits),
        }
    }

    /// Releases the handle behind `word`; primitives, null and reserved ids
    /// are ignored.
    pub fn close_word(&self, word: BoxedWord) {
        match word.kind() {
            WordKind::Handle(id) => self.handles.borrow_mut().release(id),
            WordKind::Invalid(bits) => panic!("close of invalid boxed word 0x{:016x}", bits),
            _ => {}
        }
    }

    pub fn dup_word(&self, word: BoxedWord) -> BoxedWord {
        match word.kind() {
            WordKind::Handle(id) => BoxedWord::handle(self.handles.borrow_mut().dup(id)),
            WordKind::Invalid(bits) => panic!("dup of invalid boxed word 0x{:016x}", bits),
            _ => word,
        }
    }

    // =========================================================================
    // Native argument stack
    // =========================================================================

    pub(crate) fn push_args(&self, words: &[u64]) -> Result<ArgRegion, PendingError> {
        let mut slot = self.arg_stack.borrow_mut();
        let stack = slot.get_or_insert_with(|| {
            log::debug!(
                "allocating native argument stack ({} words)",
                self.config.arg_stack_words
            );
            ArgStack::new(self.config.arg_stack_words)
        });
        stack.push(words).ok_or_else(|| {
            self.vm.new_error(
                BuiltinType::SystemError,
                format!(
                    "overflow on native argument stack (requested={}, remaining={})",
                    words.len(),
                    stack.remaining()
                ),
            )
        })
    }

    pub(crate) fn pop_args(&self, region: ArgRegion) {
        match self.arg_stack.borrow_mut().as_mut() {
            Some(stack) => stack.free(region),
            None => panic!("argument region freed before the stack exists"),
        }
    }

    pub fn arg_stack_depth(&self) -> usize {
        self.arg_stack
            .borrow()
            .as_ref()
            .map(ArgStack::depth)
            .unwrap_or(0)
    }

    // =========================================================================
    // Foreign calls
    // =========================================================================

    /// Saves the caught exception before control leaves for native code.
    pub(crate) fn enter_foreign_call(&self) {
        self.saved_caught
            .borrow_mut()
            .push(self.vm.caught_exception());
        self.foreign_depth.set(self.foreign_depth.get() + 1);
    }

    pub(crate) fn exit_foreign_call(&self) {
        let saved = self.saved_caught.borrow_mut().pop().flatten();
        self.vm.set_caught_exception(saved);
        self.foreign_depth.set(self.foreign_depth.get() - 1);
    }

    /// Nesting depth of native calls currently on the stack.
    pub fn foreign_depth(&self) -> usize {
        self.foreign_depth.get()
    }

    // =========================================================================
    // Native backend
    // =========================================================================

    /// The universal native context, promoting this context on first use.
    pub fn abi_context(&self) -> Result<*mut AbiContext, BackendError> {
        let owner = self as *const BridgeContext as *const c_void;
        self.backend
            .borrow_mut()
            .universal(owner, &self.globals, &self.config)
    }

    /// The debug native context; handles opened through it are tracked.
    pub fn debug_abi_context(&self) -> Result<*mut AbiContext, BackendError> {
        let owner = self as *const BridgeContext as *const c_void;
        self.backend
            .borrow_mut()
            .debug(owner, &self.globals, &self.config)
    }

    /// Context passed to native functions by trampolines.
    pub fn call_context(&self) -> Result<*mut AbiContext, BackendError> {
        if self.config.debug_handles {
            self.debug_abi_context()
        } else {
            self.abi_context()
        }
    }

    pub fn is_native(&self) -> bool {
        self.backend.borrow().is_native()
    }

    /// Handles opened through the debug context and never closed.
    pub fn debug_leaks(&self) -> Vec<DebugLeak> {
        self.debug.borrow().leaks(&self.handles.borrow())
    }

    // =========================================================================
    // Callables
    // =========================================================================

    /// Wraps a native function pointer as a managed callable.
    pub fn create_method(
        &self,
        name: &str,
        convention: CallConvention,
        func: *const c_void,
    ) -> ObjRef {
        self.vm.new_function(Rc::new(NativeMethod::new(
            self.weak(),
            name,
            convention,
            func,
            Receiver::None,
        )))
    }

    /// Like [`create_method`](Self::create_method) with `bound_self` passed
    /// as the first argument of every call.
    pub fn create_bound_method(
        &self,
        name: &str,
        convention: CallConvention,
        func: *const c_void,
        bound_self: ObjRef,
    ) -> ObjRef {
        self.vm.new_function(Rc::new(NativeMethod::new(
            self.weak(),
            name,
            convention,
            func,
            Receiver::Bound(bound_self),
        )))
    }

    /// Method of `module`, which is passed as `self` while it is alive.
    pub fn create_module_method(
        &self,
        name: &str,
        convention: CallConvention,
        func: *const c_void,
        module: &ObjRef,
    ) -> ObjRef {
        self.vm.new_function(Rc::new(NativeMethod::new(
            self.weak(),
            name,
            convention,
            func,
            Receiver::Module(Rc::downgrade(module)),
        )))
    }

    // =========================================================================
    // Upcall tracing
    // =========================================================================

    pub(crate) fn count_upcall(&self, member: ContextMember) {
        if self.config.trace_upcalls {
            log::trace!("upcall {}", member);
            self.upcalls.borrow_mut()[member as usize] += 1;
        }
    }

    pub fn upcall_stats(&self) -> UpcallStats {
        let counts = self.upcalls.borrow();
        let entries: BTreeMap<&'static str, u64> = ContextMember::ALL
            .iter()
            .zip(counts.iter())
            .filter(|(_, n)| **n > 0)
            .map(|(m, n)| (m.name(), *n))
            .collect();
        UpcallStats {
            total: counts.iter().sum(),
            entries,
        }
    }

    pub fn upcall_stats_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.upcall_stats())
    }
}
