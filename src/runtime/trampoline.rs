//! Invocation trampolines
//!
//! A native function pointer plus a calling convention becomes a managed
//! callable ([`NativeMethod`]). Every call runs the same frame:
//!
//! 1. Enter: check the pointer, promote the context, open a handle scope
//! 2. Convert-In: open handles for the arguments, stage varargs
//! 3. Invoke: save the caught exception, call native code, restore it
//! 4. Check-Result: apply the result policy, convert the result back
//! 5. Close-Handles: release argument handles, free staged words
//! 6. Exit: close the scope, releasing any handle native code leaked
//!
//! Conventions differ only in how arguments are laid out and how the raw
//! result is turned into an object.

use std::ffi::c_void;
use std::rc::Weak;

use libc::{c_int, ssize_t};

use super::abi::BoxedWord;
use super::arg_stack::ArgRegion;
use super::check::{ResultKind, check_function_result};
use super::context::BridgeContext;
use super::handles::ManagedHandle;
use super::stubs::AbiContext;
use crate::vm::{BuiltinType, Callable, ObjRef, Object, PendingError, Vm};

/// Calling conventions of native functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CallConvention {
    /// `(self, const u64 *args, ssize_t nargs) -> word`
    VarArgs = 1,
    /// `(self, const u64 *args, ssize_t nargs, word kw) -> word`
    Keywords = 2,
    /// `(self) -> word`
    NoArgs = 3,
    /// `(self, arg) -> word`
    O = 4,
    /// `(x) -> word`
    Unary = 6,
    /// `(x, y) -> word`
    Binary = 7,
    /// `(x, y, z) -> word`; `z` defaults to None
    Ternary = 8,
    /// `(x) -> int`, result is a bool
    Inquiry = 9,
    /// `(x) -> ssize_t`
    LenFunc = 10,
    /// `(x, ssize_t) -> word`
    SsizeArgFunc = 11,
    /// `(x, ssize_t, ssize_t) -> word`
    SsizeSsizeArgFunc = 12,
    /// `(x, ssize_t, v) -> int`, result is None
    SsizeObjArgProc = 13,
    /// `(x, k, v) -> int`, result is None
    ObjObjArgProc = 15,
    /// `(x) -> word`
    Repr = 21,
    /// `(self, const u64 *args, ssize_t nargs, word kw) -> int`, result is None
    InitProc = 28,
    /// `(x, y) -> int`, result is a bool
    ObjObjProc = 31,
    /// Binary slot called with the operands swapped.
    ReverseBinary = 1001,
    /// `() -> word`, module initialization
    ModuleInit = 1002,
}

/// How native arguments are built from managed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgShape {
    /// No managed arguments.
    Empty,
    /// Exactly `n` objects; the last one optional (None) if `optional_last`.
    Objects { count: usize, optional_last: bool },
    /// The first two objects swapped.
    Swapped,
    /// Self plus a staged argument array and its length.
    VarArgs { keywords: bool },
    /// One object followed by `sizes` ssize_t values and `trailing` objects.
    Sized { sizes: usize, trailing: usize },
}

/// What the native function returns and how it becomes an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultShape {
    Handle,
    IntToBool,
    IntToNone,
    SsizeToInt,
}

impl CallConvention {
    pub const ALL: [CallConvention; 18] = [
        CallConvention::VarArgs,
        CallConvention::Keywords,
        CallConvention::NoArgs,
        CallConvention::O,
        CallConvention::Unary,
        CallConvention::Binary,
        CallConvention::Ternary,
        CallConvention::Inquiry,
        CallConvention::LenFunc,
        CallConvention::SsizeArgFunc,
        CallConvention::SsizeSsizeArgFunc,
        CallConvention::SsizeObjArgProc,
        CallConvention::ObjObjArgProc,
        CallConvention::Repr,
        CallConvention::InitProc,
        CallConvention::ObjObjProc,
        CallConvention::ReverseBinary,
        CallConvention::ModuleInit,
    ];

    pub fn from_raw(value: c_int) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as i32 == value)
    }

    fn arg_shape(self) -> ArgShape {
        use CallConvention::*;
        match self {
            ModuleInit => ArgShape::Empty,
            NoArgs | Unary | Repr | Inquiry | LenFunc => ArgShape::Objects {
                count: 1,
                optional_last: false,
            },
            O | Binary | ObjObjProc => ArgShape::Objects {
                count: 2,
                optional_last: false,
            },
            Ternary => ArgShape::Objects {
                count: 3,
                optional_last: true,
            },
            ObjObjArgProc => ArgShape::Objects {
                count: 3,
                optional_last: false,
            },
            ReverseBinary => ArgShape::Swapped,
            VarArgs => ArgShape::VarArgs { keywords: false },
            Keywords | InitProc => ArgShape::VarArgs { keywords: true },
            SsizeArgFunc => ArgShape::Sized {
                sizes: 1,
                trailing: 0,
            },
            SsizeSsizeArgFunc => ArgShape::Sized {
                sizes: 2,
                trailing: 0,
            },
            SsizeObjArgProc => ArgShape::Sized {
                sizes: 1,
                trailing: 1,
            },
        }
    }

    fn result_shape(self) -> ResultShape {
        use CallConvention::*;
        match self {
            Inquiry | ObjObjProc => ResultShape::IntToBool,
            InitProc | SsizeObjArgProc | ObjObjArgProc => ResultShape::IntToNone,
            LenFunc => ResultShape::SsizeToInt,
            _ => ResultShape::Handle,
        }
    }

    pub fn accepts_keywords(self) -> bool {
        matches!(self, CallConvention::Keywords | CallConvention::InitProc)
    }
}

/// What a [`NativeMethod`] passes ahead of the caller's arguments.
pub enum Receiver {
    None,
    Bound(ObjRef),
    /// The defining module. Weak because the module's attrs own the method.
    Module(Weak<Object>),
}

/// A native function exposed as a managed callable.
pub struct NativeMethod {
    context: Weak<BridgeContext>,
    name: String,
    convention: CallConvention,
    func: *const c_void,
    receiver: Receiver,
}

impl NativeMethod {
    pub fn new(
        context: Weak<BridgeContext>,
        name: &str,
        convention: CallConvention,
        func: *const c_void,
        receiver: Receiver,
    ) -> Self {
        Self {
            context,
            name: name.to_string(),
            convention,
            func,
            receiver,
        }
    }

    pub fn convention(&self) -> CallConvention {
        self.convention
    }
}

impl Callable for NativeMethod {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        vm: &Vm,
        args: &[ObjRef],
        kwargs: &[(String, ObjRef)],
    ) -> Result<ObjRef, PendingError> {
        let Some(ctx) = self.context.upgrade() else {
            return Err(vm.new_error(
                BuiltinType::RuntimeError,
                format!("{}: native extension context is gone", self.name),
            ));
        };
        let bound = match &self.receiver {
            Receiver::None => {
                return invoke_native(&ctx, &self.name, self.convention, self.func, args, kwargs);
            }
            Receiver::Bound(obj) => obj.clone(),
            Receiver::Module(module) => module.upgrade().ok_or_else(|| {
                vm.new_error(
                    BuiltinType::RuntimeError,
                    format!("{}: defining module is gone", self.name),
                )
            })?,
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(bound);
        full.extend_from_slice(args);
        invoke_native(&ctx, &self.name, self.convention, self.func, &full, kwargs)
    }
}

/// Calls a native function through the trampoline frame.
pub fn invoke_native(
    ctx: &BridgeContext,
    name: &str,
    convention: CallConvention,
    func: *const c_void,
    args: &[ObjRef],
    kwargs: &[(String, ObjRef)],
) -> Result<ObjRef, PendingError> {
    let vm = ctx.vm();
    if func.is_null() {
        return Err(vm.new_error(
            BuiltinType::TypeError,
            format!("calling native function {} failed: function pointer is NULL", name),
        ));
    }
    let abi = ctx.call_context().map_err(|e| e.into_pending(vm))?;

    let scope = ctx.handles_mut().open_scope();
    let mut frame = CallFrame::default();
    let outcome = run_frame(ctx, name, convention, func, abi, args, kwargs, &mut frame);
    frame.close(ctx);
    let leaked = ctx.handles_mut().close_scope(scope);
    if leaked > 0 {
        if ctx.config().debug_handles {
            log::warn!("{} leaked {} handle(s); closed at frame exit", name, leaked);
            ctx.debug_handles().add_swept(name, leaked);
        } else {
            log::debug!("{}: closed {} leftover handle(s) at frame exit", name, leaked);
        }
    }
    outcome
}

/// Resources Convert-In acquired for one call.
#[derive(Default)]
struct CallFrame {
    handles: Vec<ManagedHandle>,
    region: Option<ArgRegion>,
}

impl CallFrame {
    fn open(&mut self, ctx: &BridgeContext, obj: &ObjRef) -> u64 {
        let handle = ManagedHandle::new(obj.clone());
        let word = if let Some(w) = ctx.globals().singleton_word(obj) {
            w
        } else {
            BoxedWord::handle(handle.to_native(&mut ctx.handles_mut()))
        };
        self.handles.push(handle);
        word.to_bits()
    }

    fn close(self, ctx: &BridgeContext) {
        if let Some(region) = self.region {
            ctx.pop_args(region);
        }
        let mut table = ctx.handles_mut();
        for handle in &self.handles {
            handle.close(&mut table);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_frame(
    ctx: &BridgeContext,
    name: &str,
    convention: CallConvention,
    func: *const c_void,
    abi: *mut AbiContext,
    args: &[ObjRef],
    kwargs: &[(String, ObjRef)],
    frame: &mut CallFrame,
) -> Result<ObjRef, PendingError> {
    let vm = ctx.vm();
    if !kwargs.is_empty() && !convention.accepts_keywords() {
        return Err(vm.new_error(
            BuiltinType::TypeError,
            format!("{}() takes no keyword arguments", name),
        ));
    }

    let native_args = convert_in(ctx, name, convention, args, kwargs, frame)?;
    let shape = convention.result_shape();

    ctx.enter_foreign_call();
    let raw = unsafe { call_native(func, abi, &native_args, shape) };
    ctx.exit_foreign_call();

    let Some(raw) = raw else {
        return Err(vm.new_error(
            BuiltinType::TypeError,
            format!(
                "calling native function {} failed: {} arguments not supported",
                name,
                native_args.len()
            ),
        ));
    };
    check_result(ctx, name, shape, raw)
}

fn arity_error(vm: &Vm, name: &str, expected: &str, given: usize) -> PendingError {
    vm.new_error(
        BuiltinType::TypeError,
        format!("{}() takes {} ({} given)", name, expected, given),
    )
}

fn convert_in(
    ctx: &BridgeContext,
    name: &str,
    convention: CallConvention,
    args: &[ObjRef],
    kwargs: &[(String, ObjRef)],
    frame: &mut CallFrame,
) -> Result<Vec<u64>, PendingError> {
    let vm = ctx.vm();
    match convention.arg_shape() {
        ArgShape::Empty => {
            if !args.is_empty() {
                return Err(arity_error(vm, name, "no arguments", args.len()));
            }
            Ok(Vec::new())
        }
        ArgShape::Objects {
            count,
            optional_last,
        } => {
            let min = if optional_last { count - 1 } else { count };
            if args.len() < min || args.len() > count {
                let expected = if optional_last {
                    format!("{} or {} arguments", min, count)
                } else {
                    format!("exactly {} argument(s)", count)
                };
                return Err(arity_error(vm, name, &expected, args.len()));
            }
            let mut words: Vec<u64> = args.iter().map(|a| frame.open(ctx, a)).collect();
            if words.len() < count {
                words.push(frame.open(ctx, &vm.none()));
            }
            Ok(words)
        }
        ArgShape::Swapped => {
            if args.len() != 2 {
                return Err(arity_error(vm, name, "exactly 2 arguments", args.len()));
            }
            Ok(vec![frame.open(ctx, &args[1]), frame.open(ctx, &args[0])])
        }
        ArgShape::VarArgs { keywords } => {
            let Some((self_obj, rest)) = args.split_first() else {
                return Err(arity_error(vm, name, "at least 1 argument", 0));
            };
            let self_word = frame.open(ctx, self_obj);
            let staged: Vec<u64> = rest.iter().map(|a| frame.open(ctx, a)).collect();
            let region = ctx.push_args(&staged)?;
            let (ptr, len) = (region.as_ptr(), region.len());
            frame.region = Some(region);
            let mut words = vec![self_word, ptr as usize as u64, len as u64];
            if keywords {
                let kw = if kwargs.is_empty() {
                    BoxedWord::NULL.to_bits()
                } else {
                    let dict = vm.new_dict();
                    for (k, v) in kwargs {
                        vm.set_item(&dict, &vm.new_str(k.clone()), v.clone())?;
                    }
                    frame.open(ctx, &dict)
                };
                words.push(kw);
            }
            Ok(words)
        }
        ArgShape::Sized { sizes, trailing } => {
            let expected = 1 + sizes + trailing;
            if args.len() != expected {
                return Err(arity_error(
                    vm,
                    name,
                    &format!("exactly {} arguments", expected),
                    args.len(),
                ));
            }
            let mut words = vec![frame.open(ctx, &args[0])];
            for arg in &args[1..=sizes] {
                let n = vm.as_i64(arg)?;
                words.push(n as ssize_t as u64);
            }
            for arg in &args[1 + sizes..] {
                words.push(frame.open(ctx, arg));
            }
            Ok(words)
        }
    }
}

fn check_result(
    ctx: &BridgeContext,
    name: &str,
    shape: ResultShape,
    raw: i64,
) -> Result<ObjRef, PendingError> {
    let vm = ctx.vm();
    match shape {
        ResultShape::Handle => {
            let word = BoxedWord::from_bits(raw as u64);
            let obj = ctx.materialize(word);
            if obj.is_some() {
                // The returned handle is owned by the caller, i.e. by us.
                ctx.close_word(word);
            }
            check_function_result(vm, name, obj.is_none(), ResultKind::Handle)?;
            Ok(obj.unwrap_or_else(|| vm.none()))
        }
        ResultShape::IntToBool | ResultShape::IntToNone | ResultShape::SsizeToInt => {
            check_function_result(vm, name, raw == -1, ResultKind::Primitive)?;
            Ok(match shape {
                ResultShape::IntToBool => vm.bool_obj(raw != 0),
                ResultShape::SsizeToInt => vm.new_int(raw as i128),
                _ => vm.none(),
            })
        }
    }
}

macro_rules! define_native_caller {
    ($name:ident, $ret:ty) => {
        /// Calls `f` with the context and up to four argument words.
        ///
        /// Returns None for unsupported arities.
        unsafe fn $name(f: *const c_void, ctx: *mut AbiContext, a: &[u64]) -> Option<$ret> {
            use std::mem::transmute;
            type P = *const c_void;
            type C = *mut AbiContext;
            let result = unsafe {
                match a.len() {
                    0 => transmute::<P, extern "C" fn(C) -> $ret>(f)(ctx),
                    1 => transmute::<P, extern "C" fn(C, u64) -> $ret>(f)(ctx, a[0]),
                    2 => transmute::<P, extern "C" fn(C, u64, u64) -> $ret>(f)(ctx, a[0], a[1]),
                    3 => transmute::<P, extern "C" fn(C, u64, u64, u64) -> $ret>(f)(
                        ctx, a[0], a[1], a[2],
                    ),
                    4 => transmute::<P, extern "C" fn(C, u64, u64, u64, u64) -> $ret>(f)(
                        ctx, a[0], a[1], a[2], a[3],
                    ),
                    _ => return None,
                }
            };
            Some(result)
        }
    };
}

define_native_caller!(call_word, u64);
define_native_caller!(call_int, c_int);
define_native_caller!(call_ssize, ssize_t);

/// Calls native code and widens the result to i64.
///
/// # Safety
/// `f` must point to a function whose signature matches `shape` and the
/// number of words in `args`.
unsafe fn call_native(
    f: *const c_void,
    ctx: *mut AbiContext,
    args: &[u64],
    shape: ResultShape,
) -> Option<i64> {
    unsafe {
        match shape {
            ResultShape::Handle => call_word(f, ctx, args).map(|w| w as i64),
            ResultShape::IntToBool | ResultShape::IntToNone => {
                call_int(f, ctx, args).map(|i| i as i64)
            }
            ResultShape::SsizeToInt => call_ssize(f, ctx, args).map(|s| s as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convention_values() {
        assert_eq!(CallConvention::VarArgs as i32, 1);
        assert_eq!(CallConvention::O as i32, 4);
        assert_eq!(CallConvention::ObjObjArgProc as i32, 15);
        assert_eq!(CallConvention::Repr as i32, 21);
        assert_eq!(CallConvention::InitProc as i32, 28);
        assert_eq!(CallConvention::ObjObjProc as i32, 31);
        for c in CallConvention::ALL {
            assert_eq!(CallConvention::from_raw(c as i32), Some(c));
        }
        assert_eq!(CallConvention::from_raw(5), None);
    }

    #[test]
    fn test_native_arity_fits_callers() {
        for c in CallConvention::ALL {
            let words = match c.arg_shape() {
                ArgShape::Empty => 0,
                ArgShape::Objects { count, .. } => count,
                ArgShape::Swapped => 2,
                ArgShape::VarArgs { keywords } => 3 + keywords as usize,
                ArgShape::Sized { sizes, trailing } => 1 + sizes + trailing,
            };
            assert!(words <= 4, "{:?} needs {} words", c, words);
        }
    }

    #[test]
    fn test_result_shapes() {
        assert_eq!(CallConvention::Inquiry.result_shape(), ResultShape::IntToBool);
        assert_eq!(CallConvention::InitProc.result_shape(), ResultShape::IntToNone);
        assert_eq!(CallConvention::LenFunc.result_shape(), ResultShape::SsizeToInt);
        assert_eq!(CallConvention::VarArgs.result_shape(), ResultShape::Handle);
    }
}
