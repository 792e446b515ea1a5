//! Context function implementations
//!
//! One function per [`ContextMember`]. Arguments arrive decoded according
//! to the member's signature, so accessors like `args[0].object()` cannot
//! fail for a well-formed table.

use std::ffi::{CStr, c_char};

use super::abi::{BoxedWord, WordKind};
use super::context::BridgeContext;
use super::dispatch::{ArgValue, ContextFn, CtxResult, RetValue};
use super::globals::WellKnown;
use super::signature::ContextMember;
use super::stubs::{MethodDef, ModuleDef};
use super::trampoline::CallConvention;
use crate::vm::{BuiltinType, ObjRef, Object, PendingError};

pub fn implementation(member: ContextMember) -> ContextFn {
    use ContextMember as M;
    match member {
        M::Dup => ctx_dup,
        M::Close => ctx_close,
        M::BulkClose => ctx_bulk_close,
        M::LongFromLong => ctx_long_from_long,
        M::LongFromUnsignedLong => ctx_long_from_unsigned_long,
        M::LongAsLong => ctx_long_as_long,
        M::LongAsDouble => ctx_long_as_double,
        M::FloatFromDouble => ctx_float_from_double,
        M::FloatAsDouble => ctx_float_as_double,
        M::BoolFromLong => ctx_bool_from_long,
        M::UnicodeFromString => ctx_unicode_from_string,
        M::UnicodeGetLength => ctx_unicode_get_length,
        M::GetAttr => ctx_get_attr,
        M::GetAttrS => ctx_get_attr_s,
        M::SetAttr => ctx_set_attr,
        M::SetAttrS => ctx_set_attr_s,
        M::HasAttrS => ctx_has_attr_s,
        M::GetItem => ctx_get_item,
        M::GetItemI => ctx_get_item_i,
        M::SetItem => ctx_set_item,
        M::Length => ctx_length,
        M::CallTupleDict => ctx_call_tuple_dict,
        M::TypeCheck => ctx_type_check,
        M::Type => ctx_type,
        M::Is => ctx_is,
        M::IsTrue => ctx_is_true,
        M::Repr => ctx_repr,
        M::ErrSetString => ctx_err_set_string,
        M::ErrSetObject => ctx_err_set_object,
        M::ErrOccurred => ctx_err_occurred,
        M::ErrExceptionMatches => ctx_err_exception_matches,
        M::ErrClear => ctx_err_clear,
        M::ErrNoMemory => ctx_err_no_memory,
        M::TupleFromArray => ctx_tuple_from_array,
        M::ListNew => ctx_list_new,
        M::ListAppend => ctx_list_append,
        M::DictNew => ctx_dict_new,
        M::NumberCheck => ctx_number_check,
        M::ListCheck => ctx_list_check,
        M::GlobalStore => ctx_global_store,
        M::GlobalLoad => ctx_global_load,
        M::ModuleCreate => ctx_module_create,
    }
}

fn system_error(ctx: &BridgeContext, message: impl Into<String>) -> PendingError {
    ctx.vm().new_error(BuiltinType::SystemError, message)
}

fn int_result(b: bool) -> RetValue {
    RetValue::Int(b as i32)
}

/// Reads `count` boxed words from a native array.
fn read_words(
    ctx: &BridgeContext,
    ptr: *const u64,
    count: isize,
) -> Result<Vec<BoxedWord>, PendingError> {
    if count < 0 {
        return Err(system_error(ctx, format!("negative array length {}", count)));
    }
    if count == 0 {
        return Ok(Vec::new());
    }
    if ptr.is_null() {
        return Err(system_error(ctx, "NULL array passed with non-zero length"));
    }
    let words = unsafe { std::slice::from_raw_parts(ptr, count as usize) };
    Ok(words.iter().map(|w| BoxedWord::from_bits(*w)).collect())
}

fn require_str<'a>(ctx: &BridgeContext, obj: &'a ObjRef, what: &str) -> Result<&'a str, PendingError> {
    obj.as_str().ok_or_else(|| {
        ctx.vm().new_error(
            BuiltinType::TypeError,
            format!("{} must be string, not '{}'", what, ctx.vm().type_name(obj)),
        )
    })
}

// =========================================================================
// Handles
// =========================================================================

fn ctx_dup(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Word(ctx.dup_word(args[0].word())))
}

fn ctx_close(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    ctx.close_word(args[0].word());
    Ok(RetValue::Void)
}

fn ctx_bulk_close(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    for word in read_words(ctx, args[0].ptr() as *const u64, args[1].size())? {
        ctx.close_word(word);
    }
    Ok(RetValue::Void)
}

// =========================================================================
// Numbers
// =========================================================================

fn ctx_long_from_long(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Word(ctx.box_long(args[0].long())))
}

fn ctx_long_from_unsigned_long(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let u = args[0].unsigned_long();
    match i64::try_from(u) {
        Ok(i) => Ok(RetValue::Word(ctx.box_long(i))),
        Err(_) => Ok(RetValue::Word(ctx.new_handle(ctx.vm().new_int(u as i128)))),
    }
}

fn ctx_long_as_long(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let word = args[0].word();
    if let Some(i) = word.as_int() {
        return Ok(RetValue::Long(i as i64));
    }
    let obj = require_object(ctx, word, ContextMember::LongAsLong)?;
    Ok(RetValue::Long(ctx.vm().as_i64(&obj)?))
}

fn ctx_long_as_double(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let word = args[0].word();
    if let Some(i) = word.as_int() {
        return Ok(RetValue::Double(i as f64));
    }
    let obj = require_object(ctx, word, ContextMember::LongAsDouble)?;
    match &*obj {
        Object::Int(_) | Object::Bool(_) => Ok(RetValue::Double(ctx.vm().as_f64(&obj)?)),
        _ => Err(ctx.vm().new_error(
            BuiltinType::TypeError,
            format!("an integer is required (got type {})", ctx.vm().type_name(&obj)),
        )),
    }
}

fn ctx_float_from_double(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Word(ctx.box_double(args[0].double())))
}

fn ctx_float_as_double(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let word = args[0].word();
    match word.kind() {
        WordKind::Double(d) => Ok(RetValue::Double(d)),
        WordKind::Int(i) => Ok(RetValue::Double(i as f64)),
        _ => {
            let obj = require_object(ctx, word, ContextMember::FloatAsDouble)?;
            Ok(RetValue::Double(ctx.vm().as_f64(&obj)?))
        }
    }
}

fn ctx_bool_from_long(_ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let which = if args[0].long() != 0 {
        WellKnown::True
    } else {
        WellKnown::False
    };
    Ok(RetValue::Word(which.word()))
}

fn require_object(
    ctx: &BridgeContext,
    word: BoxedWord,
    member: ContextMember,
) -> Result<ObjRef, PendingError> {
    ctx.materialize(word)
        .ok_or_else(|| system_error(ctx, format!("{}: NULL handle passed as argument 0", member)))
}

// =========================================================================
// Strings
// =========================================================================

fn ctx_unicode_from_string(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Object(ctx.vm().new_str(args[0].str())))
}

fn ctx_unicode_get_length(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let s = require_str(ctx, args[0].object(), "argument")?;
    Ok(RetValue::Size(s.chars().count() as isize))
}

// =========================================================================
// Object protocol
// =========================================================================

fn ctx_get_attr(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let name = require_str(ctx, args[1].object(), "attribute name")?;
    Ok(RetValue::Object(ctx.vm().get_attr(args[0].object(), name)?))
}

fn ctx_get_attr_s(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Object(ctx.vm().get_attr(args[0].object(), args[1].str())?))
}

fn ctx_set_attr(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let name = require_str(ctx, args[1].object(), "attribute name")?;
    ctx.vm()
        .set_attr(args[0].object(), name, args[2].object().clone())?;
    Ok(RetValue::Int(0))
}

fn ctx_set_attr_s(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    ctx.vm()
        .set_attr(args[0].object(), args[1].str(), args[2].object().clone())?;
    Ok(RetValue::Int(0))
}

fn ctx_has_attr_s(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(int_result(ctx.vm().has_attr(args[0].object(), args[1].str())))
}

fn ctx_get_item(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Object(
        ctx.vm().get_item(args[0].object(), args[1].object())?,
    ))
}

fn ctx_get_item_i(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let key = ctx.vm().new_int(args[1].size() as i128);
    Ok(RetValue::Object(ctx.vm().get_item(args[0].object(), &key)?))
}

fn ctx_set_item(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    ctx.vm()
        .set_item(args[0].object(), args[1].object(), args[2].object().clone())?;
    Ok(RetValue::Int(0))
}

fn ctx_length(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Size(ctx.vm().length(args[0].object())? as isize))
}

fn ctx_call_tuple_dict(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let vm = ctx.vm();
    let positional = match args[1].opt_object().map(|o| &**o) {
        None => Vec::new(),
        Some(Object::Tuple(items)) => items.clone(),
        Some(_) => {
            return Err(vm.new_error(
                BuiltinType::TypeError,
                "ctx_CallTupleDict requires args to be a tuple or NULL",
            ));
        }
    };
    let mut keywords = Vec::new();
    match args[2].opt_object().map(|o| &**o) {
        None => {}
        Some(Object::Dict(entries)) => {
            for (k, v) in entries.borrow().iter() {
                let key = require_str(ctx, k, "keywords")?;
                keywords.push((key.to_string(), v.clone()));
            }
        }
        Some(_) => {
            return Err(vm.new_error(
                BuiltinType::TypeError,
                "ctx_CallTupleDict requires kw to be a dict or NULL",
            ));
        }
    }
    Ok(RetValue::Object(vm.call(args[0].object(), &positional, &keywords)?))
}

fn ctx_type_check(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let word = args[0].word();
    let class = args[1].object();
    let vm = ctx.vm();
    let inline_type = match word.kind() {
        WordKind::Int(_) => Some(BuiltinType::Int),
        WordKind::Double(_) => Some(BuiltinType::Float),
        _ => None,
    };
    let matches = match inline_type {
        Some(ty) => vm.is_subtype(&vm.builtin_type(ty), class),
        None => {
            let obj = require_object(ctx, word, ContextMember::TypeCheck)?;
            vm.is_instance(&obj, class)
        }
    };
    Ok(int_result(matches))
}

fn ctx_type(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let word = args[0].word();
    match word.kind() {
        WordKind::Int(_) => Ok(RetValue::Word(WellKnown::LongType.word())),
        WordKind::Double(_) => Ok(RetValue::Word(WellKnown::FloatType.word())),
        _ => {
            let obj = require_object(ctx, word, ContextMember::Type)?;
            Ok(RetValue::Object(ctx.vm().class_of(&obj)))
        }
    }
}

fn ctx_is(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let (a, b) = (args[0].word(), args[1].word());
    if a == b {
        return Ok(int_result(true));
    }
    let same = match (a.as_handle(), b.as_handle()) {
        (Some(x), Some(y)) => {
            let handles = ctx.handles();
            std::rc::Rc::ptr_eq(&handles.resolve(x), &handles.resolve(y))
        }
        _ => false,
    };
    Ok(int_result(same))
}

fn ctx_is_true(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    Ok(int_result(ctx.vm().is_true(args[0].object())?))
}

fn ctx_repr(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let vm = ctx.vm();
    Ok(RetValue::Object(vm.new_str(vm.repr(args[0].object()))))
}

// =========================================================================
// Exceptions
// =========================================================================

fn require_exception_class(ctx: &BridgeContext, class: &ObjRef) -> Result<(), PendingError> {
    if ctx.vm().is_exception_class(class) {
        Ok(())
    } else {
        Err(system_error(
            ctx,
            format!(
                "exception {} not a BaseException subclass",
                ctx.vm().repr(class)
            ),
        ))
    }
}

fn ctx_err_set_string(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let class = args[0].object();
    require_exception_class(ctx, class)?;
    let exc = ctx.vm().new_exception(class.clone(), args[1].str());
    Err(PendingError::from_exception(exc))
}

fn ctx_err_set_object(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let vm = ctx.vm();
    let class = args[0].object();
    require_exception_class(ctx, class)?;
    let exc = match args[1].opt_object() {
        Some(value) if value.as_exception().is_some() && vm.is_instance(value, class) => {
            value.clone()
        }
        Some(value) => vm.new_exception(class.clone(), vm.str_of(value)),
        None => vm.new_exception(class.clone(), ""),
    };
    Err(PendingError::from_exception(exc))
}

fn ctx_err_occurred(ctx: &BridgeContext, _args: &[ArgValue]) -> CtxResult {
    Ok(int_result(ctx.vm().has_current_exception()))
}

fn ctx_err_exception_matches(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let vm = ctx.vm();
    let matches = vm
        .current_exception()
        .map(|err| vm.exception_matches(&err, args[0].object()))
        .unwrap_or(false);
    Ok(int_result(matches))
}

fn ctx_err_clear(ctx: &BridgeContext, _args: &[ArgValue]) -> CtxResult {
    ctx.vm().set_current_exception(None);
    Ok(RetValue::Void)
}

fn ctx_err_no_memory(ctx: &BridgeContext, _args: &[ArgValue]) -> CtxResult {
    Err(ctx.vm().new_error(BuiltinType::MemoryError, ""))
}

// =========================================================================
// Containers
// =========================================================================

fn ctx_tuple_from_array(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let words = read_words(ctx, args[0].ptr() as *const u64, args[1].size())?;
    let mut items = Vec::with_capacity(words.len());
    for (i, word) in words.into_iter().enumerate() {
        match ctx.materialize(word) {
            Some(obj) => items.push(obj),
            None => {
                return Err(system_error(
                    ctx,
                    format!("ctx_Tuple_FromArray: NULL handle at index {}", i),
                ));
            }
        }
    }
    Ok(RetValue::Object(ctx.vm().new_tuple(items)))
}

fn ctx_list_new(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let len = args[0].size();
    if len < 0 {
        return Err(system_error(ctx, format!("negative list size {}", len)));
    }
    let vm = ctx.vm();
    Ok(RetValue::Object(vm.new_list(vec![vm.none(); len as usize])))
}

fn ctx_list_append(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    ctx.vm()
        .list_append(args[0].object(), args[1].object().clone())?;
    Ok(RetValue::Int(0))
}

fn ctx_dict_new(ctx: &BridgeContext, _args: &[ArgValue]) -> CtxResult {
    Ok(RetValue::Object(ctx.vm().new_dict()))
}

fn ctx_number_check(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let word = args[0].word();
    if word.is_primitive() {
        return Ok(int_result(true));
    }
    let obj = require_object(ctx, word, ContextMember::NumberCheck)?;
    Ok(int_result(ctx.vm().is_number(&obj)))
}

fn ctx_list_check(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let word = args[0].word();
    if !word.is_handle() {
        return Ok(int_result(false));
    }
    let obj = require_object(ctx, word, ContextMember::ListCheck)?;
    let list_type = ctx.well_known(WellKnown::ListType);
    Ok(int_result(ctx.vm().is_instance(&obj, &list_type)))
}

// =========================================================================
// Persistent globals
// =========================================================================

fn ctx_global_store(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let slot = args[0].ptr() as *mut u64;
    if slot.is_null() {
        return Err(system_error(ctx, "ctx_Global_Store: NULL global pointer"));
    }
    let value = args[1].word();
    let previous = BoxedWord::from_bits(unsafe { *slot });
    let stored = match value.kind() {
        WordKind::Handle(id) => {
            let obj = ctx.handles().resolve(id);
            ctx.persistent_mut().store(previous, obj)
        }
        WordKind::Invalid(bits) => panic!("ctx_Global_Store: invalid boxed word 0x{:016x}", bits),
        _ => value,
    };
    unsafe { *slot = stored.to_bits() };
    Ok(RetValue::Void)
}

fn ctx_global_load(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let global = args[0].word();
    if !global.is_handle() {
        return Ok(RetValue::Word(global));
    }
    let obj = ctx.persistent_mut().load(global);
    match obj {
        Some(obj) => Ok(RetValue::Object(obj)),
        None => Err(system_error(
            ctx,
            format!("ctx_Global_Load: unknown global {:?}", global),
        )),
    }
}

// =========================================================================
// Modules
// =========================================================================

unsafe fn c_str_field(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

fn ctx_module_create(ctx: &BridgeContext, args: &[ArgValue]) -> CtxResult {
    let def = args[0].ptr() as *const ModuleDef;
    if def.is_null() {
        return Err(system_error(ctx, "ctx_Module_Create: NULL module definition"));
    }
    let def = unsafe { &*def };
    let vm = ctx.vm();
    let name = unsafe { c_str_field(def.name) }
        .ok_or_else(|| system_error(ctx, "ctx_Module_Create: module without a name"))?;
    let module = vm.new_module(name.clone());
    if let Some(doc) = unsafe { c_str_field(def.doc) } {
        vm.set_attr(&module, "__doc__", vm.new_str(doc))?;
    }

    let methods: &[MethodDef] = if def.method_count <= 0 || def.methods.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(def.methods, def.method_count as usize) }
    };
    for method in methods {
        let method_name = unsafe { c_str_field(method.name) }.ok_or_else(|| {
            system_error(ctx, format!("module {}: method without a name", name))
        })?;
        let convention = CallConvention::from_raw(method.convention).ok_or_else(|| {
            system_error(
                ctx,
                format!(
                    "module {}: unsupported calling convention {} for {}",
                    name, method.convention, method_name
                ),
            )
        })?;
        let func = ctx.create_module_method(&method_name, convention, method.func, &module);
        if let Some(doc) = unsafe { c_str_field(method.doc) } {
            log::trace!("{}.{}: {}", name, method_name, doc);
        }
        vm.set_attr(&module, &method_name, func)?;
    }
    log::debug!("created module {} with {} methods", name, methods.len());
    Ok(RetValue::Object(module))
}
