// Managed object representation. Objects are reference counted and shared;
// the containers that the object protocol allows to mutate (lists, dicts,
// attribute maps) use interior mutability.
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::Vm;
use super::error::PendingError;

pub type ObjRef = Rc<Object>;

/// Attribute storage. Maps are small, so a vector of pairs is enough.
pub type AttrMap = Vec<(String, ObjRef)>;

pub type BuiltinFn = fn(&Vm, &[ObjRef]) -> Result<ObjRef, PendingError>;

/// Anything the runtime can call.
pub trait Callable {
    fn name(&self) -> &str;

    fn call(
        &self,
        vm: &Vm,
        args: &[ObjRef],
        kwargs: &[(String, ObjRef)],
    ) -> Result<ObjRef, PendingError>;
}

pub enum Object {
    None,
    NotImplemented,
    Ellipsis,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Tuple(Vec<ObjRef>),
    List(RefCell<Vec<ObjRef>>),
    Dict(RefCell<Vec<(ObjRef, ObjRef)>>),
    Type(TypeObject),
    Exception(ExceptionObject),
    Instance(Instance),
    Module(Module),
    Function(Rc<dyn Callable>),
}

pub struct TypeObject {
    pub name: String,
    pub base: Option<ObjRef>,
    /// Set for the types the runtime creates itself.
    pub builtin: Option<BuiltinType>,
    pub attrs: RefCell<AttrMap>,
}

pub struct ExceptionObject {
    pub class: ObjRef,
    pub message: String,
    pub cause: RefCell<Option<ObjRef>>,
}

pub struct Instance {
    pub class: ObjRef,
    pub attrs: RefCell<AttrMap>,
}

pub struct Module {
    pub name: String,
    pub attrs: RefCell<AttrMap>,
}

/// Types created by [`Vm::new`], in creation order. Bases always precede
/// their subclasses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BuiltinType {
    Object = 0,
    Type,
    NoneType,
    Int,
    Bool,
    Float,
    Str,
    Tuple,
    List,
    Dict,
    Module,
    Function,
    BaseException,
    Exception,
    StopIteration,
    ArithmeticError,
    LookupError,
    IndexError,
    KeyError,
    AttributeError,
    TypeError,
    ValueError,
    OverflowError,
    ZeroDivisionError,
    RuntimeError,
    NotImplementedError,
    SystemError,
    MemoryError,
    ImportError,
}

impl BuiltinType {
    pub const ALL: [BuiltinType; 29] = [
        BuiltinType::Object,
        BuiltinType::Type,
        BuiltinType::NoneType,
        BuiltinType::Int,
        BuiltinType::Bool,
        BuiltinType::Float,
        BuiltinType::Str,
        BuiltinType::Tuple,
        BuiltinType::List,
        BuiltinType::Dict,
        BuiltinType::Module,
        BuiltinType::Function,
        BuiltinType::BaseException,
        BuiltinType::Exception,
        BuiltinType::StopIteration,
        BuiltinType::ArithmeticError,
        BuiltinType::LookupError,
        BuiltinType::IndexError,
        BuiltinType::KeyError,
        BuiltinType::AttributeError,
        BuiltinType::TypeError,
        BuiltinType::ValueError,
        BuiltinType::OverflowError,
        BuiltinType::ZeroDivisionError,
        BuiltinType::RuntimeError,
        BuiltinType::NotImplementedError,
        BuiltinType::SystemError,
        BuiltinType::MemoryError,
        BuiltinType::ImportError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinType::Object => "object",
            BuiltinType::Type => "type",
            BuiltinType::NoneType => "NoneType",
            BuiltinType::Bool => "bool",
            BuiltinType::Int => "int",
            BuiltinType::Float => "float",
            BuiltinType::Str => "str",
            BuiltinType::Tuple => "tuple",
            BuiltinType::List => "list",
            BuiltinType::Dict => "dict",
            BuiltinType::Module => "module",
            BuiltinType::Function => "builtin_function_or_method",
            BuiltinType::BaseException => "BaseException",
            BuiltinType::Exception => "Exception",
            BuiltinType::StopIteration => "StopIteration",
            BuiltinType::ArithmeticError => "ArithmeticError",
            BuiltinType::LookupError => "LookupError",
            BuiltinType::IndexError => "IndexError",
            BuiltinType::KeyError => "KeyError",
            BuiltinType::AttributeError => "AttributeError",
            BuiltinType::TypeError => "TypeError",
            BuiltinType::ValueError => "ValueError",
            BuiltinType::OverflowError => "OverflowError",
            BuiltinType::ZeroDivisionError => "ZeroDivisionError",
            BuiltinType::RuntimeError => "RuntimeError",
            BuiltinType::NotImplementedError => "NotImplementedError",
            BuiltinType::SystemError => "SystemError",
            BuiltinType::MemoryError => "MemoryError",
            BuiltinType::ImportError => "ImportError",
        }
    }

    pub fn base(self) -> Option<BuiltinType> {
        use BuiltinType::*;
        match self {
            Object => None,
            Bool => Some(Int),
            BaseException => Some(Object),
            Exception => Some(BaseException),
            StopIteration | ArithmeticError | LookupError | AttributeError | TypeError
            | ValueError | RuntimeError | SystemError | MemoryError | ImportError => {
                Some(Exception)
            }
            IndexError | KeyError => Some(LookupError),
            OverflowError | ZeroDivisionError => Some(ArithmeticError),
            NotImplementedError => Some(RuntimeError),
            _ => Some(Object),
        }
    }

    pub fn is_exception(self) -> bool {
        (self as u8) >= (BuiltinType::BaseException as u8)
    }
}

impl Object {
    pub fn as_type(&self) -> Option<&TypeObject> {
        match self {
            Object::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_exception(&self) -> Option<&ExceptionObject> {
        match self {
            Object::Exception(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Attribute map for objects that carry one.
    pub fn attrs(&self) -> Option<&RefCell<AttrMap>> {
        match self {
            Object::Type(t) => Some(&t.attrs),
            Object::Instance(i) => Some(&i.attrs),
            Object::Module(m) => Some(&m.attrs),
            _ => None,
        }
    }
}

pub(crate) fn lookup_attr(attrs: &RefCell<AttrMap>, name: &str) -> Option<ObjRef> {
    attrs
        .borrow()
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

pub(crate) fn store_attr(attrs: &RefCell<AttrMap>, name: &str, value: ObjRef) {
    let mut attrs = attrs.borrow_mut();
    match attrs.iter_mut().find(|(k, _)| k == name) {
        Some(slot) => slot.1 = value,
        None => attrs.push((name.to_string(), value)),
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::None => write!(f, "None"),
            Object::NotImplemented => write!(f, "NotImplemented"),
            Object::Ellipsis => write!(f, "Ellipsis"),
            Object::Bool(b) => write!(f, "Bool({})", b),
            Object::Int(i) => write!(f, "Int({})", i),
            Object::Float(d) => write!(f, "Float({})", d),
            Object::Str(s) => write!(f, "Str({:?})", s),
            Object::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Object::List(items) => f.debug_tuple("List").field(&*items.borrow()).finish(),
            Object::Dict(items) => write!(f, "Dict(len={})", items.borrow().len()),
            Object::Type(t) => write!(f, "Type({})", t.name),
            Object::Exception(e) => write!(f, "Exception({:?})", e.message),
            Object::Instance(_) => write!(f, "Instance"),
            Object::Module(m) => write!(f, "Module({})", m.name),
            Object::Function(c) => write!(f, "Function({})", c.name()),
        }
    }
}

/// A runtime-provided function.
pub struct BuiltinFunction {
    pub name: String,
    pub func: BuiltinFn,
}

impl Callable for BuiltinFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        vm: &Vm,
        args: &[ObjRef],
        kwargs: &[(String, ObjRef)],
    ) -> Result<ObjRef, PendingError> {
        if !kwargs.is_empty() {
            return Err(vm.new_error(
                BuiltinType::TypeError,
                format!("{}() takes no keyword arguments", self.name),
            ));
        }
        (self.func)(vm, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_bases_precede_subclasses() {
        for ty in BuiltinType::ALL {
            if let Some(base) = ty.base() {
                assert!((base as u8) < (ty as u8), "{} before {}", base.name(), ty.name());
            }
        }
    }

    #[test]
    fn test_exception_kinds() {
        assert!(BuiltinType::KeyError.is_exception());
        assert!(BuiltinType::BaseException.is_exception());
        assert!(!BuiltinType::Dict.is_exception());
        assert_eq!(BuiltinType::ALL.len(), BuiltinType::ImportError as usize + 1);
        for (i, ty) in BuiltinType::ALL.iter().enumerate() {
            assert_eq!(*ty as usize, i, "{} out of place", ty.name());
        }
    }

    #[test]
    fn test_store_attr_replaces() {
        let attrs = RefCell::new(AttrMap::new());
        store_attr(&attrs, "x", Rc::new(Object::Int(1)));
        store_attr(&attrs, "x", Rc::new(Object::Int(2)));
        assert_eq!(attrs.borrow().len(), 1);
        assert!(matches!(*lookup_attr(&attrs, "x").unwrap(), Object::Int(2)));
        assert!(lookup_attr(&attrs, "y").is_none());
    }
}
