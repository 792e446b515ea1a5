//! Context function dispatch
//!
//! Every ABI entry point funnels through [`invoke`]: raw argument words are
//! decoded according to the entry's signature, the implementation runs,
//! and the result is encoded back. A managed exception never crosses into
//! native code as a value. It is stored into the runtime's
//! current-exception slot and the entry returns its error sentinel.

use std::ffi::{CStr, c_char, c_void};

use super::abi::BoxedWord;
use super::check;
use super::context::BridgeContext;
use super::ctx_funcs;
use super::handles::HandleTable;
use super::signature::{AbiType, ContextMember, ContextSignature, ErrorPolicy};
use crate::vm::{BuiltinType, ObjRef, PendingError};

/// A decoded argument.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Object(ObjRef),
    /// Null passed for an `OptHandle` parameter.
    Null,
    Word(BoxedWord),
    Long(i64),
    UnsignedLong(u64),
    Int(i32),
    Size(isize),
    Double(f64),
    Str(String),
    Ptr(*mut c_void),
}

/// An undecoded result.
#[derive(Debug, Clone)]
pub enum RetValue {
    Object(ObjRef),
    /// Already boxed (fast paths, reserved ids, duplicated handles).
    Word(BoxedWord),
    Long(i64),
    Int(i32),
    Size(isize),
    Double(f64),
    Void,
}

pub type CtxResult = Result<RetValue, PendingError>;

pub type ContextFn = fn(&BridgeContext, &[ArgValue]) -> CtxResult;

/// One dispatch table entry.
#[derive(Clone, Copy)]
pub struct ContextFunction {
    pub name: &'static str,
    pub signature: ContextSignature,
    pub imp: ContextFn,
}

impl ContextFunction {
    pub fn of(member: ContextMember) -> Self {
        Self {
            name: member.name(),
            signature: member.signature(),
            imp: ctx_funcs::implementation(member),
        }
    }
}

/// Which native context a call arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    Universal,
    Debug,
}

/// Invokes one ABI entry point given boxed arguments.
pub fn invoke(ctx: &BridgeContext, member: ContextMember, args: &[u64]) -> u64 {
    invoke_from(ctx, member, args, CallOrigin::Universal)
}

pub fn invoke_from(
    ctx: &BridgeContext,
    member: ContextMember,
    args: &[u64],
    origin: CallOrigin,
) -> u64 {
    ctx.count_upcall(member);
    let result = invoke_function(ctx, &ContextFunction::of(member), args);
    if origin == CallOrigin::Debug && member.signature().ret == AbiType::Handle {
        let opened = BoxedWord::from_bits(result)
            .as_handle()
            .filter(|id| !HandleTable::is_reserved(*id));
        if let Some(id) = opened {
            let generation = ctx.handles().generation(id);
            if let Some(generation) = generation {
                ctx.debug_handles().record(id, generation, member.name());
            }
        }
    }
    result
}

/// Dispatch core, usable with entries outside the ABI table.
pub fn invoke_function(ctx: &BridgeContext, f: &ContextFunction, args: &[u64]) -> u64 {
    assert_eq!(
        args.len(),
        f.signature.params.len(),
        "{} called with {} arguments",
        f.name,
        args.len()
    );
    let vm = ctx.vm();
    let pending_before = vm.has_current_exception();

    let result = decode_args(ctx, f, args).and_then(|decoded| (f.imp)(ctx, &decoded));
    match result {
        Ok(value) => {
            if f.signature.policy == ErrorPolicy::Checked
                && !pending_before
                && vm.has_current_exception()
            {
                if let Some(stray) = vm.take_current_exception() {
                    let err = check::result_with_error_set(vm, f.name, stray);
                    vm.set_current_exception(Some(err));
                    return error_sentinel(f.signature.ret);
                }
            }
            encode_result(ctx, f.name, f.signature.ret, value)
        }
        Err(err) => {
            log::trace!("{} raised {}", f.name, err);
            vm.set_current_exception(Some(err));
            error_sentinel(f.signature.ret)
        }
    }
}

/// Word returned to native code when an entry raises.
pub fn error_sentinel(ret: AbiType) -> u64 {
    match ret {
        AbiType::Long | AbiType::UnsignedLong | AbiType::Int | AbiType::SizeT => (-1i64) as u64,
        AbiType::Double => (-1.0f64).to_bits(),
        _ => 0,
    }
}

fn decode_args(
    ctx: &BridgeContext,
    f: &ContextFunction,
    args: &[u64],
) -> Result<Vec<ArgValue>, PendingError> {
    f.signature
        .params
        .iter()
        .zip(args)
        .enumerate()
        .map(|(i, (ty, raw))| decode_arg(ctx, f.name, i, *ty, *raw))
        .collect()
}

fn decode_arg(
    ctx: &BridgeContext,
    name: &str,
    index: usize,
    ty: AbiType,
    raw: u64,
) -> Result<ArgValue, PendingError> {
    let word = BoxedWord::from_bits(raw);
    Ok(match ty {
        AbiType::Handle => match ctx.materialize(word) {
            Some(obj) => ArgValue::Object(obj),
            None => {
                return Err(ctx.vm().new_error(
                    BuiltinType::SystemError,
                    format!("{}: NULL handle passed as argument {}", name, index),
                ));
            }
        },
        AbiType::OptHandle => ctx
            .materialize(word)
            .map(ArgValue::Object)
            .unwrap_or(ArgValue::Null),
        AbiType::RawHandle => ArgValue::Word(word),
        AbiType::Long => ArgValue::Long(raw as i64),
        AbiType::UnsignedLong => ArgValue::UnsignedLong(raw),
        AbiType::Int => ArgValue::Int(raw as i64 as i32),
        AbiType::SizeT => ArgValue::Size(raw as i64 as isize),
        AbiType::Double => ArgValue::Double(f64::from_bits(raw)),
        AbiType::CharPtr => ArgValue::Str(read_c_string(ctx, name, index, raw as usize)?),
        AbiType::VoidPtr | AbiType::HandleArray => ArgValue::Ptr(raw as usize as *mut c_void),
        AbiType::Void => panic!("{}: void parameter", name),
    })
}

fn read_c_string(
    ctx: &BridgeContext,
    name: &str,
    index: usize,
    addr: usize,
) -> Result<String, PendingError> {
    let ptr = addr as *const c_char;
    if ptr.is_null() {
        return Err(ctx.vm().new_error(
            BuiltinType::SystemError,
            format!("{}: NULL string passed as argument {}", name, index),
        ));
    }
    let bytes = unsafe { CStr::from_ptr(ptr) };
    bytes.to_str().map(str::to_string).map_err(|e| {
        ctx.vm().new_error(
            BuiltinType::ValueError,
            format!("{}: argument {} is not valid UTF-8: {}", name, index, e),
        )
    })
}

fn encode_result(ctx: &BridgeContext, name: &str, ret: AbiType, value: RetValue) -> u64 {
    match (ret, value) {
        (AbiType::Handle, RetValue::Object(obj)) => ctx.box_object(&obj).to_bits(),
        (AbiType::Handle, RetValue::Word(word)) => word.to_bits(),
        (AbiType::Long | AbiType::UnsignedLong, RetValue::Long(i)) => i as u64,
        (AbiType::Int, RetValue::Int(i)) => i as i64 as u64,
        (AbiType::SizeT, RetValue::Size(s)) => s as i64 as u64,
        (AbiType::Double, RetValue::Double(d)) => d.to_bits(),
        (AbiType::Void, RetValue::Void) => 0,
        (ret, value) => panic!("{} returned {:?} for declared {:?}", name, value, ret),
    }
}

// =========================================================================
// Argument accessors
// =========================================================================

impl ArgValue {
    pub fn object(&self) -> &ObjRef {
        match self {
            ArgValue::Object(obj) => obj,
            other => panic!("expected object argument, got {:?}", other),
        }
    }

    pub fn opt_object(&self) -> Option<&ObjRef> {
        match self {
            ArgValue::Object(obj) => Some(obj),
            ArgValue::Null => None,
            other => panic!("expected optional object argument, got {:?}", other),
        }
    }

    pub fn word(&self) -> BoxedWord {
        match self {
            ArgValue::Word(w) => *w,
            other => panic!("expected raw word argument, got {:?}", other),
        }
    }

    pub fn long(&self) -> i64 {
        match self {
            ArgValue::Long(i) => *i,
            other => panic!("expected long argument, got {:?}", other),
        }
    }

    pub fn unsigned_long(&self) -> u64 {
        match self {
            ArgValue::UnsignedLong(u) => *u,
            other => panic!("expected unsigned long argument, got {:?}", other),
        }
    }

    pub fn size(&self) -> isize {
        match self {
            ArgValue::Size(s) => *s,
            other => panic!("expected size argument, got {:?}", other),
        }
    }

    pub fn double(&self) -> f64 {
        match self {
            ArgValue::Double(d) => *d,
            other => panic!("expected double argument, got {:?}", other),
        }
    }

    pub fn str(&self) -> &str {
        match self {
            ArgValue::Str(s) => s,
            other => panic!("expected string argument, got {:?}", other),
        }
    }

    pub fn ptr(&self) -> *mut c_void {
        match self {
            ArgValue::Ptr(p) => *p,
            other => panic!("expected pointer argument, got {:?}", other),
        }
    }
}
