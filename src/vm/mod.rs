//! Minimal managed runtime
//!
//! The bridge needs a concrete managed runtime to talk to: object creation,
//! the attribute/item/call protocol, type queries and the two exception
//! slots (current and caught). This module provides exactly that surface
//! and nothing resembling a language implementation.

pub mod error;
pub mod value;

use std::cell::RefCell;
use std::rc::Rc;

pub use error::PendingError;
pub use value::{
    BuiltinFn, BuiltinFunction, BuiltinType, Callable, ExceptionObject, Instance, Module, ObjRef,
    Object, TypeObject,
};

use value::{lookup_attr, store_attr};

pub type VmResult<T> = Result<T, PendingError>;

pub struct Vm {
    types: Vec<ObjRef>,
    none: ObjRef,
    true_obj: ObjRef,
    false_obj: ObjRef,
    not_implemented: ObjRef,
    ellipsis: ObjRef,
    /// Exception raised and not yet handled.
    current_exception: RefCell<Option<PendingError>>,
    /// Exception being handled by an enclosing handler, if any.
    caught_exception: RefCell<Option<PendingError>>,
}

impl Vm {
    pub fn new() -> Self {
        let mut types: Vec<ObjRef> = Vec::with_capacity(BuiltinType::ALL.len());
        for ty in BuiltinType::ALL {
            let base = ty.base().map(|b| types[b as usize].clone());
            types.push(Rc::new(Object::Type(TypeObject {
                name: ty.name().to_string(),
                base,
                builtin: Some(ty),
                attrs: RefCell::new(Vec::new()),
            })));
        }

        Self {
            types,
            none: Rc::new(Object::None),
            true_obj: Rc::new(Object::Bool(true)),
            false_obj: Rc::new(Object::Bool(false)),
            not_implemented: Rc::new(Object::NotImplemented),
            ellipsis: Rc::new(Object::Ellipsis),
            current_exception: RefCell::new(None),
            caught_exception: RefCell::new(None),
        }
    }

    // =========================================================================
    // Singletons and constructors
    // =========================================================================

    pub fn none(&self) -> ObjRef {
        self.none.clone()
    }

    pub fn bool_obj(&self, b: bool) -> ObjRef {
        if b {
            self.true_obj.clone()
        } else {
            self.false_obj.clone()
        }
    }

    pub fn not_implemented(&self) -> ObjRef {
        self.not_implemented.clone()
    }

    pub fn ellipsis(&self) -> ObjRef {
        self.ellipsis.clone()
    }

    pub fn builtin_type(&self, ty: BuiltinType) -> ObjRef {
        self.types[ty as usize].clone()
    }

    pub fn new_int(&self, i: i128) -> ObjRef {
        Rc::new(Object::Int(i))
    }

    pub fn new_float(&self, d: f64) -> ObjRef {
        Rc::new(Object::Float(d))
    }

    pub fn new_str(&self, s: impl Into<String>) -> ObjRef {
        Rc::new(Object::Str(s.into()))
    }

    pub fn new_tuple(&self, items: Vec<ObjRef>) -> ObjRef {
        Rc::new(Object::Tuple(items))
    }

    pub fn new_list(&self, items: Vec<ObjRef>) -> ObjRef {
        Rc::new(Object::List(RefCell::new(items)))
    }

    pub fn new_dict(&self) -> ObjRef {
        Rc::new(Object::Dict(RefCell::new(Vec::new())))
    }

    pub fn new_module(&self, name: impl Into<String>) -> ObjRef {
        Rc::new(Object::Module(Module {
            name: name.into(),
            attrs: RefCell::new(Vec::new()),
        }))
    }

    /// Creates a user-level class deriving from `base` (or `object`).
    pub fn new_type(&self, name: impl Into<String>, base: Option<ObjRef>) -> ObjRef {
        Rc::new(Object::Type(TypeObject {
            name: name.into(),
            base: Some(base.unwrap_or_else(|| self.builtin_type(BuiltinType::Object))),
            builtin: None,
            attrs: RefCell::new(Vec::new()),
        }))
    }

    pub fn new_function(&self, callable: Rc<dyn Callable>) -> ObjRef {
        Rc::new(Object::Function(callable))
    }

    pub fn new_builtin(&self, name: impl Into<String>, func: BuiltinFn) -> ObjRef {
        self.new_function(Rc::new(BuiltinFunction {
            name: name.into(),
            func,
        }))
    }

    pub fn new_exception(&self, class: ObjRef, message: impl Into<String>) -> ObjRef {
        Rc::new(Object::Exception(ExceptionObject {
            class,
            message: message.into(),
            cause: RefCell::new(None),
        }))
    }

    /// Builds a pending error of one of the builtin exception types.
    pub fn new_error(&self, ty: BuiltinType, message: impl Into<String>) -> PendingError {
        debug_assert!(ty.is_exception());
        PendingError::from_exception(self.new_exception(self.builtin_type(ty), message))
    }

    // =========================================================================
    // Exception slots
    // =========================================================================

    pub fn has_current_exception(&self) -> bool {
        self.current_exception.borrow().is_some()
    }

    pub fn current_exception(&self) -> Option<PendingError> {
        self.current_exception.borrow().clone()
    }

    pub fn set_current_exception(&self, err: Option<PendingError>) {
        *self.current_exception.borrow_mut() = err;
    }

    pub fn take_current_exception(&self) -> Option<PendingError> {
        self.current_exception.borrow_mut().take()
    }

    pub fn caught_exception(&self) -> Option<PendingError> {
        self.caught_exception.borrow().clone()
    }

    pub fn set_caught_exception(&self, err: Option<PendingError>) {
        *self.caught_exception.borrow_mut() = err;
    }

    /// `matcher` is an exception class or a tuple of them.
    pub fn exception_matches(&self, err: &PendingError, matcher: &ObjRef) -> bool {
        let Some(class) = err.class() else {
            return false;
        };
        match &**matcher {
            Object::Tuple(items) => items.iter().any(|m| self.is_subtype(class, m)),
            Object::Type(_) => self.is_subtype(class, matcher),
            _ => false,
        }
    }

    // =========================================================================
    // Type queries
    // =========================================================================

    pub fn class_of(&self, obj: &ObjRef) -> ObjRef {
        let builtin = match &**obj {
            Object::None => BuiltinType::NoneType,
            Object::NotImplemented | Object::Ellipsis => BuiltinType::Object,
            Object::Bool(_) => BuiltinType::Bool,
            Object::Int(_) => BuiltinType::Int,
            Object::Float(_) => BuiltinType::Float,
            Object::Str(_) => BuiltinType::Str,
            Object::Tuple(_) => BuiltinType::Tuple,
            Object::List(_) => BuiltinType::List,
            Object::Dict(_) => BuiltinType::Dict,
            Object::Type(_) => BuiltinType::Type,
            Object::Module(_) => BuiltinType::Module,
            Object::Function(_) => BuiltinType::Function,
            Object::Exception(e) => return e.class.clone(),
            Object::Instance(i) => return i.class.clone(),
        };
        self.builtin_type(builtin)
    }

    pub fn type_name(&self, obj: &ObjRef) -> String {
        self.class_of(obj)
            .as_type()
            .map(|t| t.name.clone())
            .unwrap_or_default()
    }

    pub fn is_subtype(&self, sub: &ObjRef, sup: &ObjRef) -> bool {
        let mut cur = Some(sub.clone());
        while let Some(ty) = cur {
            if Rc::ptr_eq(&ty, sup) {
                return true;
            }
            cur = ty.as_type().and_then(|t| t.base.clone());
        }
        false
    }

    pub fn is_instance(&self, obj: &ObjRef, class: &ObjRef) -> bool {
        self.is_subtype(&self.class_of(obj), class)
    }

    pub fn is_exception_class(&self, obj: &ObjRef) -> bool {
        obj.as_type().is_some()
            && self.is_subtype(obj, &self.builtin_type(BuiltinType::BaseException))
    }

    // =========================================================================
    // Object protocol
    // =========================================================================

    pub fn get_attr(&self, obj: &ObjRef, name: &str) -> VmResult<ObjRef> {
        if let Some(attrs) = obj.attrs() {
            if let Some(v) = lookup_attr(attrs, name) {
                return Ok(v);
            }
        }
        // Instances and classes fall back to the class chain.
        let mut cur = match &**obj {
            Object::Type(t) => t.base.clone(),
            _ => Some(self.class_of(obj)),
        };
        while let Some(ty) = cur {
            if let Some(v) = ty.attrs().and_then(|a| lookup_attr(a, name)) {
                return Ok(v);
            }
            cur = ty.as_type().and_then(|t| t.base.clone());
        }
        if name == "__name__" {
            match &**obj {
                Object::Type(t) => return Ok(self.new_str(t.name.clone())),
                Object::Module(m) => return Ok(self.new_str(m.name.clone())),
                Object::Function(c) => return Ok(self.new_str(c.name())),
                _ => {}
            }
        }
        Err(self.new_error(
            BuiltinType::AttributeError,
            format!("'{}' object has no attribute '{}'", self.type_name(obj), name),
        ))
    }

    pub fn set_attr(&self, obj: &ObjRef, name: &str, value: ObjRef) -> VmResult<()> {
        match &**obj {
            Object::Type(t) if t.builtin.is_some() => Err(self.new_error(
                BuiltinType::TypeError,
                format!("cannot set '{}' attribute of immutable type '{}'", name, t.name),
            )),
            _ => match obj.attrs() {
                Some(attrs) => {
                    store_attr(attrs, name, value);
                    Ok(())
                }
                None => Err(self.new_error(
                    BuiltinType::AttributeError,
                    format!(
                        "'{}' object has no attribute '{}'",
                        self.type_name(obj),
                        name
                    ),
                )),
            },
        }
    }

    pub fn has_attr(&self, obj: &ObjRef, name: &str) -> bool {
        self.get_attr(obj, name).is_ok()
    }

    pub fn get_item(&self, obj: &ObjRef, key: &ObjRef) -> VmResult<ObjRef> {
        match &**obj {
            Object::Tuple(items) => {
                let idx = self.sequence_index(key, items.len(), "tuple")?;
                Ok(items[idx].clone())
            }
            Object::List(items) => {
                let items = items.borrow();
                let idx = self.sequence_index(key, items.len(), "list")?;
                Ok(items[idx].clone())
            }
            Object::Str(s) => {
                let len = s.chars().count();
                let idx = self.sequence_index(key, len, "string")?;
                Ok(self.new_str(s.chars().nth(idx).map(String::from).unwrap_or_default()))
            }
            Object::Dict(entries) => entries
                .borrow()
                .iter()
                .find(|(k, _)| self.eq(k, key))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| self.new_error(BuiltinType::KeyError, self.repr(key))),
            _ => Err(self.new_error(
                BuiltinType::TypeError,
                format!("'{}' object is not subscriptable", self.type_name(obj)),
            )),
        }
    }

    pub fn set_item(&self, obj: &ObjRef, key: &ObjRef, value: ObjRef) -> VmResult<()> {
        match &**obj {
            Object::List(items) => {
                let mut items = items.borrow_mut();
                let idx = self.sequence_index(key, items.len(), "list assignment")?;
                items[idx] = value;
                Ok(())
            }
            Object::Dict(entries) => {
                let mut entries = entries.borrow_mut();
                match entries.iter_mut().find(|(k, _)| self.eq(k, key)) {
                    Some(slot) => slot.1 = value,
                    None => entries.push((key.clone(), value)),
                }
                Ok(())
            }
            _ => Err(self.new_error(
                BuiltinType::TypeError,
                format!(
                    "'{}' object does not support item assignment",
                    self.type_name(obj)
                ),
            )),
        }
    }

    fn sequence_index(&self, key: &ObjRef, len: usize, what: &str) -> VmResult<usize> {
        let raw = match &**key {
            Object::Int(i) => *i,
            Object::Bool(b) => *b as i128,
            _ => {
                return Err(self.new_error(
                    BuiltinType::TypeError,
                    format!(
                        "{} indices must be integers, not {}",
                        what,
                        self.type_name(key)
                    ),
                ));
            }
        };
        let idx = if raw < 0 { raw + len as i128 } else { raw };
        if idx < 0 || idx >= len as i128 {
            return Err(self.new_error(
                BuiltinType::IndexError,
                format!("{} index out of range", what),
            ));
        }
        Ok(idx as usize)
    }

    pub fn length(&self, obj: &ObjRef) -> VmResult<usize> {
        match &**obj {
            Object::Str(s) => Ok(s.chars().count()),
            Object::Tuple(items) => Ok(items.len()),
            Object::List(items) => Ok(items.borrow().len()),
            Object::Dict(entries) => Ok(entries.borrow().len()),
            _ => Err(self.new_error(
                BuiltinType::TypeError,
                format!("object of type '{}' has no len()", self.type_name(obj)),
            )),
        }
    }

    pub fn list_append(&self, list: &ObjRef, item: ObjRef) -> VmResult<()> {
        match &**list {
            Object::List(items) => {
                items.borrow_mut().push(item);
                Ok(())
            }
            _ => Err(self.new_error(
                BuiltinType::SystemError,
                format!("bad argument: expected list, got {}", self.type_name(list)),
            )),
        }
    }

    pub fn call(
        &self,
        callable: &ObjRef,
        args: &[ObjRef],
        kwargs: &[(String, ObjRef)],
    ) -> VmResult<ObjRef> {
        match &**callable {
            Object::Function(f) => f.call(self, args, kwargs),
            Object::Type(_) if self.is_exception_class(callable) => {
                let message = match args.first() {
                    Some(arg) => self.str_of(arg),
                    None => String::new(),
                };
                Ok(self.new_exception(callable.clone(), message))
            }
            Object::Type(t) if t.builtin.is_none() => {
                let instance = Rc::new(Object::Instance(Instance {
                    class: callable.clone(),
                    attrs: RefCell::new(Vec::new()),
                }));
                if let Ok(init) = self.get_attr(callable, "__init__") {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(instance.clone());
                    full.extend_from_slice(args);
                    self.call(&init, &full, kwargs)?;
                }
                Ok(instance)
            }
            _ => Err(self.new_error(
                BuiltinType::TypeError,
                format!("'{}' object is not callable", self.type_name(callable)),
            )),
        }
    }

    pub fn is_true(&self, obj: &ObjRef) -> VmResult<bool> {
        Ok(match &**obj {
            Object::None => false,
            Object::Bool(b) => *b,
            Object::Int(i) => *i != 0,
            Object::Float(d) => *d != 0.0,
            Object::Str(s) => !s.is_empty(),
            Object::Tuple(items) => !items.is_empty(),
            Object::List(items) => !items.borrow().is_empty(),
            Object::Dict(entries) => !entries.borrow().is_empty(),
            _ => true,
        })
    }

    /// Value equality for primitives and sequences, identity otherwise.
    pub fn eq(&self, a: &ObjRef, b: &ObjRef) -> bool {
        if Rc::ptr_eq(a, b) {
            return true;
        }
        match (&**a, &**b) {
            (Object::Str(x), Object::Str(y)) => x == y,
            (Object::Tuple(x), Object::Tuple(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(p, q)| self.eq(p, q))
            }
            _ => match (numeric_value(a), numeric_value(b)) {
                (Some(Numeric::Int(x)), Some(Numeric::Int(y))) => x == y,
                (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
                _ => false,
            },
        }
    }

    pub fn repr(&self, obj: &ObjRef) -> String {
        match &**obj {
            Object::None => "None".to_string(),
            Object::NotImplemented => "NotImplemented".to_string(),
            Object::Ellipsis => "Ellipsis".to_string(),
            Object::Bool(true) => "True".to_string(),
            Object::Bool(false) => "False".to_string(),
            Object::Int(i) => i.to_string(),
            Object::Float(d) => format_float(*d),
            Object::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Object::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(|i| self.repr(i)).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Object::List(items) => {
                let parts: Vec<String> = items.borrow().iter().map(|i| self.repr(i)).collect();
                format!("[{}]", parts.join(", "))
            }
            Object::Dict(entries) => {
                let parts: Vec<String> = entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.repr(k), self.repr(v)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Object::Type(t) => format!("<class '{}'>", t.name),
            Object::Exception(e) => {
                let name = e.class.as_type().map(|t| t.name.as_str()).unwrap_or("?");
                format!("{}({})", name, self.repr(&self.new_str(e.message.clone())))
            }
            Object::Instance(i) => {
                let name = i.class.as_type().map(|t| t.name.as_str()).unwrap_or("?");
                format!("<{} object>", name)
            }
            Object::Module(m) => format!("<module '{}'>", m.name),
            Object::Function(c) => format!("<built-in function {}>", c.name()),
        }
    }

    /// `str()` of an object: strings are returned unquoted.
    pub fn str_of(&self, obj: &ObjRef) -> String {
        match &**obj {
            Object::Str(s) => s.clone(),
            Object::Exception(e) => e.message.clone(),
            _ => self.repr(obj),
        }
    }

    // =========================================================================
    // Numeric conversions
    // =========================================================================

    pub fn as_i64(&self, obj: &ObjRef) -> VmResult<i64> {
        match numeric_value(obj) {
            Some(Numeric::Int(i)) => i64::try_from(i).map_err(|_| {
                self.new_error(
                    BuiltinType::OverflowError,
                    "Python int too large to convert to C long",
                )
            }),
            _ => Err(self.new_error(
                BuiltinType::TypeError,
                format!(
                    "an integer is required (got type {})",
                    self.type_name(obj)
                ),
            )),
        }
    }

    pub fn as_f64(&self, obj: &ObjRef) -> VmResult<f64> {
        match numeric_value(obj) {
            Some(n) => Ok(n.as_f64()),
            None => Err(self.new_error(
                BuiltinType::TypeError,
                format!("must be real number, not {}", self.type_name(obj)),
            )),
        }
    }

    pub fn is_number(&self, obj: &ObjRef) -> bool {
        numeric_value(obj).is_some()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum Numeric {
    Int(i128),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(i) => i as f64,
            Numeric::Float(d) => d,
        }
    }
}

fn numeric_value(obj: &ObjRef) -> Option<Numeric> {
    match &**obj {
        Object::Int(i) => Some(Numeric::Int(*i)),
        Object::Bool(b) => Some(Numeric::Int(*b as i128)),
        Object::Float(d) => Some(Numeric::Float(*d)),
        _ => None,
    }
}

fn format_float(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d.is_infinite() {
        let s = if d > 0.0 { "inf" } else { "-inf" };
        s.to_string()
    } else if d == d.trunc() && d.abs() < 1e16 {
        format!("{:.1}", d)
    } else {
        format!("{}", d)
    }
}
