//! ABI identity shared with extension libraries.

/// Bumped whenever the context table changes incompatibly. Appending new
/// entry points does not require a bump.
pub const ABI_VERSION: u32 = 1;

/// NUL-terminated name stored in every native context.
pub const ABI_NAME: &[u8] = b"extbridge-universal\0";

/// NUL-terminated name of the debug context.
pub const DEBUG_ABI_NAME: &[u8] = b"extbridge-debug\0";

/// Symbol an extension may export to declare the ABI version it was built
/// against: `extern "C" fn() -> u32`.
pub const VERSION_SYMBOL: &str = "extbridge_abi_version";

/// Prefix of the module init symbol; the module name follows.
pub const INIT_SYMBOL_PREFIX: &str = "extbridge_init_";

pub fn init_symbol(module_name: &str) -> String {
    format!("{}{}", INIT_SYMBOL_PREFIX, module_name)
}
