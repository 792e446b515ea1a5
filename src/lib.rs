//! extbridge: an object bridge for native extensions.
//!
//! Native code never touches managed objects directly. It holds handles
//! (or boxed words) and calls back into the bridge context for every
//! operation; the bridge calls native code through trampolines that
//! convert arguments, check results and clean up leaked handles.

pub mod backend;
pub mod config;
pub mod runtime;
pub mod vm;


pub use config::{BridgeConfig, ConfigError};
pub use runtime::{BridgeContext, BoxedWord, CallConvention};
pub use vm::{ObjRef, PendingError, Vm};
