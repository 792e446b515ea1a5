//! Native context table and ABI entry points
//!
//! Extension code receives a pointer to an [`AbiContext`] and calls the
//! bridge only through its function table. The calling convention is:
//! - The context pointer is always the first argument
//! - Objects travel as boxed words (u64)
//! - Errors are signalled by the entry's sentinel; the exception itself
//!   stays in the runtime and is queried with `err_occurred`
//!
//! Table slots are in [`ContextMember`] order. New slots are appended.

use std::ffi::c_void;

use libc::{c_char, c_int, ssize_t};

use super::abi_version::ABI_VERSION;
use super::context::BridgeContext;
use super::dispatch::{self, CallOrigin};
use super::globals::GLOBAL_COUNT;
use super::signature::ContextMember;
use crate::vm::BuiltinType;

pub const MODE_UNIVERSAL: u32 = 0;
pub const MODE_DEBUG: u32 = 1;

/// The context every native function receives.
#[repr(C)]
pub struct AbiContext {
    pub name: *const c_char,
    pub abi_version: u32,
    /// [`MODE_UNIVERSAL`] or [`MODE_DEBUG`].
    pub mode: u32,
    owner: *const c_void,
    /// Well-known handles in `WellKnown` order.
    pub handles: [u64; GLOBAL_COUNT],
    pub funcs: AbiFunctions,
}

impl AbiContext {
    pub fn new(name: &'static [u8], mode: u32, owner: *const c_void, handles: [u64; GLOBAL_COUNT]) -> Self {
        debug_assert_eq!(name.last(), Some(&0), "context name must be NUL-terminated");
        Self {
            name: name.as_ptr() as *const c_char,
            abi_version: ABI_VERSION,
            mode,
            owner,
            handles,
            funcs: FUNCTIONS,
        }
    }

    pub(crate) fn owner(&self) -> *const c_void {
        self.owner
    }

    pub fn origin(&self) -> CallOrigin {
        if self.mode == MODE_DEBUG {
            CallOrigin::Debug
        } else {
            CallOrigin::Universal
        }
    }
}

/// A method exported by an extension module.
#[repr(C)]
pub struct MethodDef {
    pub name: *const c_char,
    /// A `CallConvention` value.
    pub convention: c_int,
    pub func: *const c_void,
    pub doc: *const c_char,
}

/// Argument of `module_create`.
#[repr(C)]
pub struct ModuleDef {
    pub name: *const c_char,
    pub doc: *const c_char,
    pub methods: *const MethodDef,
    pub method_count: ssize_t,
}

// Definitions are immutable data; extensions declare them as statics.
unsafe impl Sync for MethodDef {}
unsafe impl Sync for ModuleDef {}

type Ctx = *mut AbiContext;

/// Function table, one slot per [`ContextMember`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AbiFunctions {
    pub dup: extern "C" fn(Ctx, u64) -> u64,
    pub close: extern "C" fn(Ctx, u64),
    pub bulk_close: extern "C" fn(Ctx, *const u64, ssize_t),
    pub long_from_long: extern "C" fn(Ctx, i64) -> u64,
    pub long_from_unsigned_long: extern "C" fn(Ctx, u64) -> u64,
    pub long_as_long: extern "C" fn(Ctx, u64) -> i64,
    pub long_as_double: extern "C" fn(Ctx, u64) -> f64,
    pub float_from_double: extern "C" fn(Ctx, f64) -> u64,
    pub float_as_double: extern "C" fn(Ctx, u64) -> f64,
    pub bool_from_long: extern "C" fn(Ctx, i64) -> u64,
    pub unicode_from_string: extern "C" fn(Ctx, *const c_char) -> u64,
    pub unicode_get_length: extern "C" fn(Ctx, u64) -> ssize_t,
    pub get_attr: extern "C" fn(Ctx, u64, u64) -> u64,
    pub get_attr_s: extern "C" fn(Ctx, u64, *const c_char) -> u64,
    pub set_attr: extern "C" fn(Ctx, u64, u64, u64) -> c_int,
    pub set_attr_s: extern "C" fn(Ctx, u64, *const c_char, u64) -> c_int,
    pub has_attr_s: extern "C" fn(Ctx, u64, *const c_char) -> c_int,
    pub get_item: extern "C" fn(Ctx, u64, u64) -> u64,
    pub get_item_i: extern "C" fn(Ctx, u64, ssize_t) -> u64,
    pub set_item: extern "C" fn(Ctx, u64, u64, u64) -> c_int,
    pub length: extern "C" fn(Ctx, u64) -> ssize_t,
    pub call_tuple_dict: extern "C" fn(Ctx, u64, u64, u64) -> u64,
    pub type_check: extern "C" fn(Ctx, u64, u64) -> c_int,
    pub type_: extern "C" fn(Ctx, u64) -> u64,
    pub is: extern "C" fn(Ctx, u64, u64) -> c_int,
    pub is_true: extern "C" fn(Ctx, u64) -> c_int,
    pub repr: extern "C" fn(Ctx, u64) -> u64,
    pub err_set_string: extern "C" fn(Ctx, u64, *const c_char),
    pub err_set_object: extern "C" fn(Ctx, u64, u64),
    pub err_occurred: extern "C" fn(Ctx) -> c_int,
    pub err_exception_matches: extern "C" fn(Ctx, u64) -> c_int,
    pub err_clear: extern "C" fn(Ctx),
    pub err_no_memory: extern "C" fn(Ctx) -> u64,
    pub tuple_from_array: extern "C" fn(Ctx, *const u64, ssize_t) -> u64,
    pub list_new: extern "C" fn(Ctx, ssize_t) -> u64,
    pub list_append: extern "C" fn(Ctx, u64, u64) -> c_int,
    pub dict_new: extern "C" fn(Ctx) -> u64,
    pub number_check: extern "C" fn(Ctx, u64) -> c_int,
    pub list_check: extern "C" fn(Ctx, u64) -> c_int,
    pub global_store: extern "C" fn(Ctx, *mut u64, u64),
    pub global_load: extern "C" fn(Ctx, u64) -> u64,
    pub module_create: extern "C" fn(Ctx, *const ModuleDef) -> u64,
}

pub static FUNCTIONS: AbiFunctions = AbiFunctions {
    dup: ctx_dup,
    close: ctx_close,
    bulk_close: ctx_bulk_close,
    long_from_long: ctx_long_from_long,
    long_from_unsigned_long: ctx_long_from_unsigned_long,
    long_as_long: ctx_long_as_long,
    long_as_double: ctx_long_as_double,
    float_from_double: ctx_float_from_double,
    float_as_double: ctx_float_as_double,
    bool_from_long: ctx_bool_from_long,
    unicode_from_string: ctx_unicode_from_string,
    unicode_get_length: ctx_unicode_get_length,
    get_attr: ctx_get_attr,
    get_attr_s: ctx_get_attr_s,
    set_attr: ctx_set_attr,
    set_attr_s: ctx_set_attr_s,
    has_attr_s: ctx_has_attr_s,
    get_item: ctx_get_item,
    get_item_i: ctx_get_item_i,
    set_item: ctx_set_item,
    length: ctx_length,
    call_tuple_dict: ctx_call_tuple_dict,
    type_check: ctx_type_check,
    type_: ctx_type,
    is: ctx_is,
    is_true: ctx_is_true,
    repr: ctx_repr,
    err_set_string: ctx_err_set_string,
    err_set_object: ctx_err_set_object,
    err_occurred: ctx_err_occurred,
    err_exception_matches: ctx_err_exception_matches,
    err_clear: ctx_err_clear,
    err_no_memory: ctx_err_no_memory,
    tuple_from_array: ctx_tuple_from_array,
    list_new: ctx_list_new,
    list_append: ctx_list_append,
    dict_new: ctx_dict_new,
    number_check: ctx_number_check,
    list_check: ctx_list_check,
    global_store: ctx_global_store,
    global_load: ctx_global_load,
    module_create: ctx_module_create,
};

fn upcall(ctx: Ctx, member: ContextMember, args: &[u64]) -> u64 {
    assert!(!ctx.is_null(), "{} called with a null context", member);
    let abi = unsafe { &*ctx };
    let bridge = unsafe { BridgeContext::from_abi(abi) };
    dispatch::invoke_from(bridge, member, args, abi.origin())
}

#[inline]
fn ptr_word<T>(p: *const T) -> u64 {
    p as usize as u64
}

// =========================================================================
// Handle Stubs
// =========================================================================

extern "C" fn ctx_dup(ctx: Ctx, h: u64) -> u64 {
    upcall(ctx, ContextMember::Dup, &[h])
}

extern "C" fn ctx_close(ctx: Ctx, h: u64) {
    upcall(ctx, ContextMember::Close, &[h]);
}

extern "C" fn ctx_bulk_close(ctx: Ctx, hs: *const u64, n: ssize_t) {
    upcall(ctx, ContextMember::BulkClose, &[ptr_word(hs), n as u64]);
}

// =========================================================================
// Number Stubs
// =========================================================================

extern "C" fn ctx_long_from_long(ctx: Ctx, v: i64) -> u64 {
    upcall(ctx, ContextMember::LongFromLong, &[v as u64])
}

extern "C" fn ctx_long_from_unsigned_long(ctx: Ctx, v: u64) -> u64 {
    upcall(ctx, ContextMember::LongFromUnsignedLong, &[v])
}

extern "C" fn ctx_long_as_long(ctx: Ctx, h: u64) -> i64 {
    upcall(ctx, ContextMember::LongAsLong, &[h]) as i64
}

extern "C" fn ctx_long_as_double(ctx: Ctx, h: u64) -> f64 {
    f64::from_bits(upcall(ctx, ContextMember::LongAsDouble, &[h]))
}

extern "C" fn ctx_float_from_double(ctx: Ctx, v: f64) -> u64 {
    upcall(ctx, ContextMember::FloatFromDouble, &[v.to_bits()])
}

extern "C" fn ctx_float_as_double(ctx: Ctx, h: u64) -> f64 {
    f64::from_bits(upcall(ctx, ContextMember::FloatAsDouble, &[h]))
}

extern "C" fn ctx_bool_from_long(ctx: Ctx, v: i64) -> u64 {
    upcall(ctx, ContextMember::BoolFromLong, &[v as u64])
}

// =========================================================================
// String Stubs
// =========================================================================

extern "C" fn ctx_unicode_from_string(ctx: Ctx, s: *const c_char) -> u64 {
    upcall(ctx, ContextMember::UnicodeFromString, &[ptr_word(s)])
}

extern "C" fn ctx_unicode_get_length(ctx: Ctx, h: u64) -> ssize_t {
    upcall(ctx, ContextMember::UnicodeGetLength, &[h]) as ssize_t
}

// =========================================================================
// Object Protocol Stubs
// =========================================================================

extern "C" fn ctx_get_attr(ctx: Ctx, obj: u64, name: u64) -> u64 {
    upcall(ctx, ContextMember::GetAttr, &[obj, name])
}

extern "C" fn ctx_get_attr_s(ctx: Ctx, obj: u64, name: *const c_char) -> u64 {
    upcall(ctx, ContextMember::GetAttrS, &[obj, ptr_word(name)])
}

extern "C" fn ctx_set_attr(ctx: Ctx, obj: u64, name: u64, value: u64) -> c_int {
    upcall(ctx, ContextMember::SetAttr, &[obj, name, value]) as c_int
}

extern "C" fn ctx_set_attr_s(ctx: Ctx, obj: u64, name: *const c_char, value: u64) -> c_int {
    upcall(ctx, ContextMember::SetAttrS, &[obj, ptr_word(name), value]) as c_int
}

extern "C" fn ctx_has_attr_s(ctx: Ctx, obj: u64, name: *const c_char) -> c_int {
    upcall(ctx, ContextMember::HasAttrS, &[obj, ptr_word(name)]) as c_int
}

extern "C" fn ctx_get_item(ctx: Ctx, obj: u64, key: u64) -> u64 {
    upcall(ctx, ContextMember::GetItem, &[obj, key])
}

extern "C" fn ctx_get_item_i(ctx: Ctx, obj: u64, idx: ssize_t) -> u64 {
    upcall(ctx, ContextMember::GetItemI, &[obj, idx as u64])
}

extern "C" fn ctx_set_item(ctx: Ctx, obj: u64, key: u64, value: u64) -> c_int {
    upcall(ctx, ContextMember::SetItem, &[obj, key, value]) as c_int
}

extern "C" fn ctx_length(ctx: Ctx, obj: u64) -> ssize_t {
    upcall(ctx, ContextMember::Length, &[obj]) as ssize_t
}

extern "C" fn ctx_call_tuple_dict(ctx: Ctx, callable: u64, args: u64, kw: u64) -> u64 {
    upcall(ctx, ContextMember::CallTupleDict, &[callable, args, kw])
}

extern "C" fn ctx_type_check(ctx: Ctx, obj: u64, ty: u64) -> c_int {
    upcall(ctx, ContextMember::TypeCheck, &[obj, ty]) as c_int
}

extern "C" fn ctx_type(ctx: Ctx, obj: u64) -> u64 {
    upcall(ctx, ContextMember::Type, &[obj])
}

extern "C" fn ctx_is(ctx: Ctx, a: u64, b: u64) -> c_int {
    upcall(ctx, ContextMember::Is, &[a, b]) as c_int
}

extern "C" fn ctx_is_true(ctx: Ctx, obj: u64) -> c_int {
    upcall(ctx, ContextMember::IsTrue, &[obj]) as c_int
}

extern "C" fn ctx_repr(ctx: Ctx, obj: u64) -> u64 {
    upcall(ctx, ContextMember::Repr, &[obj])
}

// =========================================================================
// Exception Stubs
// =========================================================================

extern "C" fn ctx_err_set_string(ctx: Ctx, ty: u64, msg: *const c_char) {
    upcall(ctx, ContextMember::ErrSetString, &[ty, ptr_word(msg)]);
}

extern "C" fn ctx_err_set_object(ctx: Ctx, ty: u64, value: u64) {
    upcall(ctx, ContextMember::ErrSetObject, &[ty, value]);
}

extern "C" fn ctx_err_occurred(ctx: Ctx) -> c_int {
    upcall(ctx, ContextMember::ErrOccurred, &[]) as c_int
}

extern "C" fn ctx_err_exception_matches(ctx: Ctx, ty: u64) -> c_int {
    upcall(ctx, ContextMember::ErrExceptionMatches, &[ty]) as c_int
}

extern "C" fn ctx_err_clear(ctx: Ctx) {
    upcall(ctx, ContextMember::ErrClear, &[]);
}

extern "C" fn ctx_err_no_memory(ctx: Ctx) -> u64 {
    upcall(ctx, ContextMember::ErrNoMemory, &[])
}

// =========================================================================
// Container Stubs
// =========================================================================

extern "C" fn ctx_tuple_from_array(ctx: Ctx, items: *const u64, n: ssize_t) -> u64 {
    upcall(ctx, ContextMember::TupleFromArray, &[ptr_word(items), n as u64])
}

extern "C" fn ctx_list_new(ctx: Ctx, len: ssize_t) -> u64 {
    upcall(ctx, ContextMember::ListNew, &[len as u64])
}

extern "C" fn ctx_list_append(ctx: Ctx, list: u64, item: u64) -> c_int {
    upcall(ctx, ContextMember::ListAppend, &[list, item]) as c_int
}

extern "C" fn ctx_dict_new(ctx: Ctx) -> u64 {
    upcall(ctx, ContextMember::DictNew, &[])
}

extern "C" fn ctx_number_check(ctx: Ctx, obj: u64) -> c_int {
    upcall(ctx, ContextMember::NumberCheck, &[obj]) as c_int
}

extern "C" fn ctx_list_check(ctx: Ctx, obj: u64) -> c_int {
    upcall(ctx, ContextMember::ListCheck, &[obj]) as c_int
}

// =========================================================================
// Global and Module Stubs
// =========================================================================

extern "C" fn ctx_global_store(ctx: Ctx, global: *mut u64, h: u64) {
    upcall(ctx, ContextMember::GlobalStore, &[ptr_word(global), h]);
}

extern "C" fn ctx_global_load(ctx: Ctx, global: u64) -> u64 {
    upcall(ctx, ContextMember::GlobalLoad, &[global])
}

extern "C" fn ctx_module_create(ctx: Ctx, def: *const ModuleDef) -> u64 {
    upcall(ctx, ContextMember::ModuleCreate, &[ptr_word(def)])
}

/// Invokes an entry point by ordinal with boxed arguments.
///
/// For callers that bind to the table generically instead of through the
/// typed slots. An unknown ordinal or a wrong argument count raises
/// `SystemError` and returns 0.
#[unsafe(no_mangle)]
pub extern "C" fn extbridge_invoke(
    ctx: *mut AbiContext,
    ordinal: u32,
    args: *const u64,
    nargs: usize,
) -> u64 {
    assert!(!ctx.is_null(), "extbridge_invoke called with a null context");
    let abi = unsafe { &*ctx };
    let bridge = unsafe { BridgeContext::from_abi(abi) };
    let member = match ContextMember::from_ordinal(ordinal) {
        Some(m) if m.signature().params.len() == nargs => m,
        Some(m) => {
            bridge.vm().set_current_exception(Some(bridge.vm().new_error(
                BuiltinType::SystemError,
                format!("{} takes {} arguments ({} given)", m, m.signature().params.len(), nargs),
            )));
            return 0;
        }
        None => {
            bridge.vm().set_current_exception(Some(bridge.vm().new_error(
                BuiltinType::SystemError,
                format!("unknown context function ordinal {}", ordinal),
            )));
            return 0;
        }
    };
    let args = if nargs == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(args, nargs) }
    };
    dispatch::invoke_from(bridge, member, args, abi.origin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::runtime::abi::BoxedWord;
    use crate::vm::Vm;
    use std::rc::Rc;

    #[test]
    fn test_invoke_by_ordinal() {
        let ctx = BridgeContext::new(Rc::new(Vm::new()), BridgeConfig::default());
        let abi = ctx.abi_context().unwrap();
        let args = [41u64];
        let raw = extbridge_invoke(abi, ContextMember::LongFromLong.ordinal(), args.as_ptr(), 1);
        assert_eq!(raw, BoxedWord::int(41).to_bits());
        let dict = extbridge_invoke(abi, ContextMember::DictNew.ordinal(), std::ptr::null(), 0);
        assert!(BoxedWord::from_bits(dict).is_handle());
    }

    #[test]
    fn test_invoke_rejects_bad_calls() {
        let ctx = BridgeContext::new(Rc::new(Vm::new()), BridgeConfig::default());
        let abi = ctx.abi_context().unwrap();
        assert_eq!(extbridge_invoke(abi, 9999, std::ptr::null(), 0), 0);
        let err = ctx.vm().take_current_exception().unwrap();
        assert!(err.message().contains("unknown context function ordinal 9999"));

        assert_eq!(extbridge_invoke(abi, ContextMember::Dup.ordinal(), std::ptr::null(), 0), 0);
        let err = ctx.vm().take_current_exception().unwrap();
        assert_eq!(err.type_name(), "SystemError");
        assert!(err.message().contains("ctx_Dup takes 1 arguments"));
    }

    #[test]
    fn test_typed_slots_reach_the_owner() {
        let ctx = BridgeContext::new(Rc::new(Vm::new()), BridgeConfig::default());
        let abi = ctx.abi_context().unwrap();
        let funcs = unsafe { (*abi).funcs };
        let s = (funcs.unicode_from_string)(abi, c"four".as_ptr());
        assert_eq!((funcs.unicode_get_length)(abi, s), 4);
        assert_eq!(ctx.handles().live_count(), 1);
        (funcs.close)(abi, s);
        assert_eq!(ctx.handles().live_count(), 0);
        assert_eq!((funcs.float_as_double)(abi, (funcs.float_from_double)(abi, 2.5)), 2.5);
    }
}
