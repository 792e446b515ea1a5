//! Object bridge runtime
//!
//! The primitives native extensions see, and the machinery behind them:
//! - Word encoding shared with native code (abi.rs)
//! - Handle table and scopes (handles.rs), well-known handles (globals.rs)
//! - Context function table and dispatch (signature.rs, dispatch.rs, ctx_funcs.rs)
//! - Extern "C" stubs native code calls through (stubs.rs)
//! - Invocation trampolines and result checks (trampoline.rs, check.rs)
//!
//! Managed code never sees a handle: objects cross into native code as
//! boxed words and come back as objects.

pub mod abi;
#[cfg(test)]
mod abi_tests;
pub mod abi_version;
pub mod arg_stack;
pub mod check;
pub mod context;
pub mod ctx_funcs;
pub mod dispatch;
pub mod globals;
pub mod handles;
pub mod signature;
pub mod stubs;
pub mod trampoline;

pub use abi::{BoxedWord, WordKind};
pub use abi_version::ABI_VERSION;
pub use context::BridgeContext;
pub use dispatch::{ArgValue, CallOrigin, ContextFunction, RetValue, invoke, invoke_function};
pub use globals::WellKnown;
pub use handles::{HandleTable, ManagedHandle};
pub use signature::{AbiType, ContextMember, ErrorPolicy};
pub use trampoline::{CallConvention, NativeMethod, invoke_native};
