//! Native backend bridge
//!
//! Everything that hands native code a pointer lives here:
//! - `mod.rs` - promotion of a bridge context to native (the `AbiContext`)
//! - `debug.rs` - handle tracking for the debug context
//! - `loader.rs` - loading extension libraries and running their init
//!
//! Promotion is lazy and one-way: the first native call allocates the
//! native context and it stays until the bridge context is dropped.

pub mod debug;
#[cfg(feature = "native-loader")]
pub mod loader;

use std::ffi::c_void;
use std::ptr::NonNull;

use thiserror::Error;

use crate::config::BridgeConfig;
use crate::runtime::abi_version::{ABI_NAME, DEBUG_ABI_NAME};
use crate::runtime::globals::GlobalHandles;
use crate::runtime::stubs::{AbiContext, MODE_DEBUG, MODE_UNIVERSAL};
use crate::vm::{BuiltinType, PendingError, Vm};

/// Errors of the native backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("native access is not allowed for this context")]
    NativeAccessDenied,
    #[error("debug mode is not available: {0}")]
    DebugUnavailable(String),
    #[error("failed to load extension {path}: {reason}")]
    LoadFailed { path: String, reason: String },
    #[error("extension {path} does not export {symbol}")]
    MissingEntryPoint { path: String, symbol: String },
    #[error("ABI version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("initialization of extension {name} failed: {error}")]
    InitFailed { name: String, error: PendingError },
}

impl BackendError {
    /// Converts into the managed exception raised for this failure.
    ///
    /// Loading failures become `ImportError`; a failed init re-raises the
    /// extension's own exception.
    pub fn into_pending(self, vm: &Vm) -> PendingError {
        match self {
            BackendError::InitFailed { error, .. } => error,
            BackendError::NativeAccessDenied | BackendError::DebugUnavailable(_) => {
                vm.new_error(BuiltinType::RuntimeError, self.to_string())
            }
            _ => vm.new_error(BuiltinType::ImportError, self.to_string()),
        }
    }
}

/// Native contexts of one bridge context.
#[derive(Default)]
pub struct NativeBackend {
    universal: Option<NonNull<AbiContext>>,
    debug: Option<NonNull<AbiContext>>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_native(&self) -> bool {
        self.universal.is_some()
    }

    pub fn has_debug(&self) -> bool {
        self.debug.is_some()
    }

    /// The universal context, allocating it on first use.
    pub fn universal(
        &mut self,
        owner: *const c_void,
        globals: &GlobalHandles,
        config: &BridgeConfig,
    ) -> Result<*mut AbiContext, BackendError> {
        if let Some(ptr) = self.universal {
            return Ok(ptr.as_ptr());
        }
        if !config.allow_native_access {
            return Err(BackendError::NativeAccessDenied);
        }
        log::debug!("promoting bridge context to native");
        let ptr = allocate(AbiContext::new(ABI_NAME, MODE_UNIVERSAL, owner, globals.words()));
        self.universal = Some(ptr);
        Ok(ptr.as_ptr())
    }

    /// The debug context. Promotes the universal context first.
    pub fn debug(
        &mut self,
        owner: *const c_void,
        globals: &GlobalHandles,
        config: &BridgeConfig,
    ) -> Result<*mut AbiContext, BackendError> {
        if let Some(ptr) = self.debug {
            return Ok(ptr.as_ptr());
        }
        if let Err(err) = self.universal(owner, globals, config) {
            return Err(BackendError::DebugUnavailable(err.to_string()));
        }
        log::debug!("initializing debug context");
        let ptr = allocate(AbiContext::new(DEBUG_ABI_NAME, MODE_DEBUG, owner, globals.words()));
        self.debug = Some(ptr);
        Ok(ptr.as_ptr())
    }
}

fn allocate(ctx: AbiContext) -> NonNull<AbiContext> {
    NonNull::from(Box::leak(Box::new(ctx)))
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        for ptr in [self.universal.take(), self.debug.take()].into_iter().flatten() {
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::abi_version::ABI_VERSION;
    use crate::runtime::handles::HandleTable;

    fn globals(vm: &Vm) -> GlobalHandles {
        GlobalHandles::install(vm, &mut HandleTable::new())
    }

    #[test]
    fn test_promotion_is_lazy_and_stable() {
        let vm = Vm::new();
        let globals = globals(&vm);
        let mut backend = NativeBackend::new();
        assert!(!backend.is_native());
        let config = BridgeConfig::default();
        let a = backend.universal(std::ptr::null(), &globals, &config).unwrap();
        let b = backend.universal(std::ptr::null(), &globals, &config).unwrap();
        assert_eq!(a, b);
        assert!(backend.is_native());
        let ctx = unsafe { &*a };
        assert_eq!(ctx.abi_version, ABI_VERSION);
        assert_eq!(ctx.mode, MODE_UNIVERSAL);
        assert_eq!(ctx.handles, globals.words());
    }

    #[test]
    fn test_debug_context_is_separate() {
        let vm = Vm::new();
        let globals = globals(&vm);
        let mut backend = NativeBackend::new();
        let config = BridgeConfig::default();
        let debug = backend.debug(std::ptr::null(), &globals, &config).unwrap();
        let universal = backend.universal(std::ptr::null(), &globals, &config).unwrap();
        assert_ne!(debug, universal);
        assert_eq!(unsafe { (*debug).mode }, MODE_DEBUG);
        assert!(backend.has_debug());
    }

    #[test]
    fn test_denied_without_native_access() {
        let vm = Vm::new();
        let globals = globals(&vm);
        let mut backend = NativeBackend::new();
        let config = BridgeConfig {
            allow_native_access: false,
            ..BridgeConfig::default()
        };
        assert!(matches!(
            backend.universal(std::ptr::null(), &globals, &config),
            Err(BackendError::NativeAccessDenied)
        ));
        assert!(matches!(
            backend.debug(std::ptr::null(), &globals, &config),
            Err(BackendError::DebugUnavailable(_))
        ));
        assert!(!backend.is_native());
    }

    #[test]
    fn test_into_pending() {
        let vm = Vm::new();
        let err = BackendError::LoadFailed {
            path: "libnope.so".into(),
            reason: "not found".into(),
        }
        .into_pending(&vm);
        assert_eq!(err.type_name(), "ImportError");
        assert!(err.message().contains("libnope.so"));

        let err = BackendError::NativeAccessDenied.into_pending(&vm);
        assert_eq!(err.type_name(), "RuntimeError");
    }
}
