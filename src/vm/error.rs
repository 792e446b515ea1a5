//! Managed exceptions as Rust errors.

use std::fmt;

use super::value::{ObjRef, Object};

/// A managed exception propagating through Rust code.
///
/// The wrapped object is always an [`Object::Exception`]. Once a
/// `PendingError` reaches the ABI edge it is stored into the runtime's
/// current-exception slot and native code only sees the error sentinel.
#[derive(Clone)]
pub struct PendingError {
    exception: ObjRef,
}

impl PendingError {
    pub fn from_exception(exception: ObjRef) -> Self {
        debug_assert!(
            exception.as_exception().is_some(),
            "PendingError must wrap an exception object"
        );
        Self { exception }
    }

    pub fn exception(&self) -> &ObjRef {
        &self.exception
    }

    pub fn class(&self) -> Option<&ObjRef> {
        self.exception.as_exception().map(|e| &e.class)
    }

    pub fn type_name(&self) -> String {
        self.class()
            .and_then(|c| c.as_type())
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    pub fn message(&self) -> &str {
        self.exception
            .as_exception()
            .map(|e| e.message.as_str())
            .unwrap_or("")
    }

    pub fn cause(&self) -> Option<PendingError> {
        let exc = self.exception.as_exception()?;
        let cause = exc.cause.borrow().clone()?;
        Some(PendingError::from_exception(cause))
    }

    /// Chains `cause` as the explicit cause of this exception.
    pub fn with_cause(self, cause: PendingError) -> Self {
        if let Object::Exception(exc) = &*self.exception {
            *exc.cause.borrow_mut() = Some(cause.exception);
        }
        self
    }
}

impl fmt::Display for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message().is_empty() {
            write!(f, "{}", self.type_name())
        } else {
            write!(f, "{}: {}", self.type_name(), self.message())
        }
    }
}

impl fmt::Debug for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingError({})", self)?;
        if let Some(cause) = self.cause() {
            write!(f, " caused by {:?}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for PendingError {}

#[cfg(test)]
mod tests {
    use crate::vm::Vm;
    use crate::vm::value::BuiltinType;

    #[test]
    fn test_display() {
        let vm = Vm::new();
        let err = vm.new_error(BuiltinType::ValueError, "bad value");
        assert_eq!(err.type_name(), "ValueError");
        assert_eq!(err.to_string(), "ValueError: bad value");
        assert_eq!(vm.new_error(BuiltinType::TypeError, "").to_string(), "TypeError");
    }

    #[test]
    fn test_cause_chain() {
        let vm = Vm::new();
        let inner = vm.new_error(BuiltinType::ValueError, "inner");
        let outer = vm.new_error(BuiltinType::RuntimeError, "outer").with_cause(inner);
        let cause = outer.cause().unwrap();
        assert_eq!(cause.message(), "inner");
        assert!(cause.cause().is_none());
        assert!(format!("{:?}", outer).contains("caused by PendingError(ValueError: inner)"));
    }
}
