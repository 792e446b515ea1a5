//! Extension loader.
//!
//! An extension is a shared library exporting `extbridge_init_<name>`, a
//! module-init function run through the trampoline like any other native
//! call. If it also exports `extbridge_abi_version` (a `u32` getter) the
//! version must match ours.
//!
//! Once the init symbol resolves, the library is handed to the context and
//! stays mapped until the context is dropped. Dropping the loader only
//! forgets the module cache.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use libloading::Library;

use super::BackendError;
use crate::runtime::abi_version::{ABI_VERSION, VERSION_SYMBOL, init_symbol};
use crate::runtime::context::BridgeContext;
use crate::runtime::trampoline::{CallConvention, invoke_native};
use crate::vm::ObjRef;

/// Where extension entry points are resolved from.
pub trait SymbolSource {
    fn lookup(&self, symbol: &str) -> Option<*const c_void>;
}

impl SymbolSource for Library {
    fn lookup(&self, symbol: &str) -> Option<*const c_void> {
        unsafe { self.get::<*const c_void>(symbol.as_bytes()) }
            .ok()
            .map(|s| *s)
    }
}

struct LoadedExtension {
    name: String,
    path: PathBuf,
    module: ObjRef,
}

/// Loads extensions and caches their modules by name.
pub struct ExtensionLoader {
    loaded: Vec<LoadedExtension>,
}

impl ExtensionLoader {
    pub fn new() -> Self {
        Self { loaded: Vec::new() }
    }

    /// Loads `path` and runs the init function of module `name`.
    ///
    /// Loading the same name twice returns the cached module.
    pub fn load(&mut self, ctx: &BridgeContext, path: &Path, name: &str) -> Result<ObjRef, BackendError> {
        if let Some(module) = self.get(name) {
            return Ok(module);
        }
        log::debug!("loading extension {} from {}", name, path.display());

        let lib = unsafe { Library::new(path) }.map_err(|e| BackendError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.load_from(ctx, lib, path, name)
    }

    /// Initializes module `name` from an already opened `source`.
    ///
    /// On success or init failure `source` is retained by `ctx`; on a
    /// version or entry point error it is dropped before any extension
    /// code besides the version getter ran.
    pub fn load_from<S: SymbolSource + 'static>(
        &mut self,
        ctx: &BridgeContext,
        source: S,
        path: &Path,
        name: &str,
    ) -> Result<ObjRef, BackendError> {
        if let Some(module) = self.get(name) {
            return Ok(module);
        }
        let display = path.display().to_string();

        match source.lookup(VERSION_SYMBOL) {
            Some(getter) if !getter.is_null() => {
                let getter: extern "C" fn() -> u32 = unsafe { std::mem::transmute(getter) };
                let found = getter();
                if found != ABI_VERSION {
                    return Err(BackendError::VersionMismatch {
                        expected: ABI_VERSION,
                        found,
                    });
                }
            }
            _ => log::debug!("{} does not export {}, skipping version check", display, VERSION_SYMBOL),
        }

        let symbol = init_symbol(name);
        let init = source.lookup(&symbol).ok_or_else(|| BackendError::MissingEntryPoint {
            path: display.clone(),
            symbol: symbol.clone(),
        })?;

        // Init may hand out methods pointing into `source` even when it fails.
        ctx.retain_extension_code(Box::new(source));
        let module = invoke_native(ctx, &symbol, CallConvention::ModuleInit, init, &[], &[]).map_err(|error| {
            BackendError::InitFailed {
                name: name.to_string(),
                error,
            }
        })?;
        log::info!("loaded extension {} ({})", name, display);

        self.loaded.push(LoadedExtension {
            name: name.to_string(),
            path: path.to_path_buf(),
            module: module.clone(),
        });
        Ok(module)
    }

    pub fn get(&self, name: &str) -> Option<ObjRef> {
        self.loaded.iter().find(|e| e.name == name).map(|e| e.module.clone())
    }

    /// Names and paths of loaded extensions, in load order.
    pub fn loaded_extensions(&self) -> Vec<(&str, &Path)> {
        self.loaded.iter().map(|e| (e.name.as_str(), e.path.as_path())).collect()
    }
}

impl Default for ExtensionLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::runtime::globals::WellKnown;
    use crate::runtime::stubs::{AbiContext, MethodDef, ModuleDef};
    use crate::vm::Vm;
    use libc::{c_int, ssize_t};
    use std::cell::Cell;
    use std::rc::Rc;

    type Ctx = *mut AbiContext;

    /// In-memory stand-in for a shared library.
    struct FakeLibrary {
        symbols: Vec<(String, *const c_void)>,
        dropped: Rc<Cell<bool>>,
    }

    impl FakeLibrary {
        fn new(symbols: &[(&str, *const c_void)]) -> (Self, Rc<Cell<bool>>) {
            let dropped = Rc::new(Cell::new(false));
            let lib = Self {
                symbols: symbols.iter().map(|(n, p)| (n.to_string(), *p)).collect(),
                dropped: dropped.clone(),
            };
            (lib, dropped)
        }
    }

    impl SymbolSource for FakeLibrary {
        fn lookup(&self, symbol: &str) -> Option<*const c_void> {
            self.symbols.iter().find(|(n, _)| n == symbol).map(|(_, p)| *p)
        }
    }

    impl Drop for FakeLibrary {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    extern "C" fn current_version() -> u32 {
        ABI_VERSION
    }

    extern "C" fn future_version() -> u32 {
        ABI_VERSION + 1
    }

    extern "C" fn answer(ctx: Ctx, _module: u64) -> u64 {
        (unsafe { &(*ctx).funcs }.long_from_long)(ctx, 42)
    }

    extern "C" fn init_answer(ctx: Ctx) -> u64 {
        let methods = [MethodDef {
            name: c"get".as_ptr(),
            convention: CallConvention::NoArgs as c_int,
            func: answer as *const c_void,
            doc: std::ptr::null(),
        }];
        let def = ModuleDef {
            name: c"answer".as_ptr(),
            doc: std::ptr::null(),
            methods: methods.as_ptr(),
            method_count: methods.len() as ssize_t,
        };
        (unsafe { &(*ctx).funcs }.module_create)(ctx, &def)
    }

    /// Returns NULL with a ValueError set.
    extern "C" fn init_failing(ctx: Ctx) -> u64 {
        let value_error = unsafe { (*ctx).handles[WellKnown::ValueError as usize] };
        (unsafe { &(*ctx).funcs }.err_set_string)(ctx, value_error, c"init refused".as_ptr());
        0
    }

    fn context() -> Rc<BridgeContext> {
        BridgeContext::new(Rc::new(Vm::new()), BridgeConfig::default())
    }

    fn path() -> &'static Path {
        Path::new("/virtual/libanswer.so")
    }

    #[test]
    fn test_missing_library() {
        let ctx = context();
        let mut loader = ExtensionLoader::new();
        let err = loader
            .load(&ctx, Path::new("/nonexistent/libnothing.so"), "nothing")
            .unwrap_err();
        assert!(matches!(err, BackendError::LoadFailed { .. }));
        assert_eq!(err.into_pending(ctx.vm()).type_name(), "ImportError");
        assert!(loader.loaded_extensions().is_empty());
        assert!(loader.get("nothing").is_none());
    }

    #[test]
    fn test_load_and_cache() {
        let ctx = context();
        let mut loader = ExtensionLoader::new();
        let (lib, _) = FakeLibrary::new(&[
            (VERSION_SYMBOL, current_version as *const c_void),
            ("extbridge_init_answer", init_answer as *const c_void),
        ]);
        let module = loader.load_from(&ctx, lib, path(), "answer").unwrap();
        let vm = ctx.vm();
        let get = vm.get_attr(&module, "get").unwrap();
        assert_eq!(vm.as_i64(&vm.call(&get, &[], &[]).unwrap()).unwrap(), 42);

        let (again, _) = FakeLibrary::new(&[]);
        let cached = loader.load_from(&ctx, again, path(), "answer").unwrap();
        assert!(Rc::ptr_eq(&module, &cached));
        assert_eq!(loader.loaded_extensions(), vec![("answer", path())]);
    }

    #[test]
    fn test_version_mismatch() {
        let ctx = context();
        let (lib, dropped) = FakeLibrary::new(&[
            (VERSION_SYMBOL, future_version as *const c_void),
            ("extbridge_init_answer", init_answer as *const c_void),
        ]);
        let err = ExtensionLoader::new().load_from(&ctx, lib, path(), "answer").unwrap_err();
        match &err {
            BackendError::VersionMismatch { expected, found } => {
                assert_eq!(*expected, ABI_VERSION);
                assert_eq!(*found, ABI_VERSION + 1);
            }
            other => panic!("expected VersionMismatch, got {:?}", other),
        }
        assert!(dropped.get());
        assert_eq!(err.into_pending(ctx.vm()).type_name(), "ImportError");
    }

    #[test]
    fn test_missing_entry_point() {
        let ctx = context();
        let (lib, dropped) = FakeLibrary::new(&[("extbridge_init_other", init_answer as *const c_void)]);
        let err = ExtensionLoader::new().load_from(&ctx, lib, path(), "answer").unwrap_err();
        match &err {
            BackendError::MissingEntryPoint { symbol, .. } => assert_eq!(symbol, "extbridge_init_answer"),
            other => panic!("expected MissingEntryPoint, got {:?}", other),
        }
        assert!(dropped.get());
    }

    #[test]
    fn test_init_failed() {
        let ctx = context();
        let mut loader = ExtensionLoader::new();
        let (lib, _) = FakeLibrary::new(&[("extbridge_init_answer", init_failing as *const c_void)]);
        let err = loader.load_from(&ctx, lib, path(), "answer").unwrap_err();
        match &err {
            BackendError::InitFailed { name, error } => {
                assert_eq!(name, "answer");
                assert_eq!(error.type_name(), "ValueError");
                assert_eq!(error.message(), "init refused");
            }
            other => panic!("expected InitFailed, got {:?}", other),
        }
        let pending = err.into_pending(ctx.vm());
        assert_eq!(pending.message(), "init refused");
        assert!(loader.get("answer").is_none());
    }

    #[test]
    fn test_code_outlives_loader() {
        let vm = Rc::new(Vm::new());
        let ctx = BridgeContext::new(vm.clone(), BridgeConfig::default());
        let (lib, dropped) = FakeLibrary::new(&[("extbridge_init_answer", init_answer as *const c_void)]);
        let module = {
            let mut loader = ExtensionLoader::new();
            loader.load_from(&ctx, lib, path(), "answer").unwrap()
        };
        assert!(!dropped.get());
        let get = vm.get_attr(&module, "get").unwrap();
        assert_eq!(vm.as_i64(&vm.call(&get, &[], &[]).unwrap()).unwrap(), 42);

        drop(ctx);
        assert!(dropped.get());
        let err = vm.call(&get, &[], &[]).unwrap_err();
        assert_eq!(err.type_name(), "RuntimeError");
    }
}
