//! Result checking for calls into native code
//!
//! A native function signals failure with an error sentinel (null handle or
//! -1) and must have raised an exception when it does. The four
//! combinations of "result indicates error" and "exception pending" map to:
//!
//! | error | pending | outcome |
//! |-------|---------|---------|
//! | no    | no      | success |
//! | yes   | yes     | the pending exception, slot cleared |
//! | yes   | no      | `SystemError` "returned NULL without setting an error" |
//! | no    | yes     | `SystemError` "returned a result with an error set", caused by the stray exception |

use crate::vm::{BuiltinType, PendingError, Vm};

/// Which sentinel the checked function uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Null handle on error.
    Handle,
    /// -1 on error.
    Primitive,
}

pub fn check_function_result(
    vm: &Vm,
    name: &str,
    indicates_error: bool,
    kind: ResultKind,
) -> Result<(), PendingError> {
    match (indicates_error, vm.take_current_exception()) {
        (false, None) => Ok(()),
        (true, Some(err)) => Err(err),
        (true, None) => {
            let what = match kind {
                ResultKind::Handle => "NULL",
                ResultKind::Primitive => "-1",
            };
            Err(vm.new_error(
                BuiltinType::SystemError,
                format!("{} returned {} without setting an error", name, what),
            ))
        }
        (false, Some(stray)) => Err(result_with_error_set(vm, name, stray)),
    }
}

pub fn result_with_error_set(vm: &Vm, name: &str, stray: PendingError) -> PendingError {
    log::warn!("{} returned a result with an error set ({})", name, stray);
    vm.new_error(
        BuiltinType::SystemError,
        format!("{} returned a result with an error set", name),
    )
    .with_cause(stray)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success() {
        let vm = Vm::new();
        assert!(check_function_result(&vm, "f", false, ResultKind::Handle).is_ok());
    }

    #[test]
    fn test_error_with_exception_reraises() {
        let vm = Vm::new();
        vm.set_current_exception(Some(vm.new_error(BuiltinType::KeyError, "k")));
        let err = check_function_result(&vm, "f", true, ResultKind::Handle).unwrap_err();
        assert_eq!(err.type_name(), "KeyError");
        assert!(!vm.has_current_exception());
    }

    #[test]
    fn test_error_without_exception() {
        let vm = Vm::new();
        let err = check_function_result(&vm, "f", true, ResultKind::Handle).unwrap_err();
        assert_eq!(err.type_name(), "SystemError");
        assert_eq!(err.message(), "f returned NULL without setting an error");

        let err = check_function_result(&vm, "g", true, ResultKind::Primitive).unwrap_err();
        assert_eq!(err.message(), "g returned -1 without setting an error");
    }

    #[test]
    fn test_result_with_error_set() {
        let vm = Vm::new();
        vm.set_current_exception(Some(vm.new_error(BuiltinType::ValueError, "stray")));
        let err = check_function_result(&vm, "f", false, ResultKind::Primitive).unwrap_err();
        assert_eq!(err.type_name(), "SystemError");
        assert_eq!(err.message(), "f returned a result with an error set");
        let cause = err.cause().unwrap();
        assert_eq!(cause.type_name(), "ValueError");
        assert!(!vm.has_current_exception());
    }
}
