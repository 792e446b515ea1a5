//! Well-known handles and persistent globals
//!
//! Well-known objects occupy the reserved ids `1..=GLOBAL_COUNT` in fixed
//! order. Native code reads them from the context table instead of asking
//! for them, so the order is part of the ABI.
//!
//! Persistent globals are the one way native code may keep an object
//! beyond a call: a separate id space whose entries survive frame exit.

use std::rc::Rc;

use super::abi::{BoxedWord, MAX_HANDLE_ID};
use super::handles::HandleTable;
use crate::vm::{BuiltinType, ObjRef, Vm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WellKnown {
    None = 0,
    True,
    False,
    NotImplemented,
    Ellipsis,
    BaseException,
    Exception,
    StopIteration,
    IndexError,
    KeyError,
    OverflowError,
    RuntimeError,
    SystemError,
    TypeError,
    ValueError,
    ZeroDivisionError,
    AttributeError,
    MemoryError,
    ImportError,
    BaseObjectType,
    TypeType,
    BoolType,
    LongType,
    FloatType,
    UnicodeType,
    TupleType,
    ListType,
    DictType,
}

pub const GLOBAL_COUNT: usize = 28;

impl WellKnown {
    pub const ALL: [WellKnown; GLOBAL_COUNT] = [
        WellKnown::None,
        WellKnown::True,
        WellKnown::False,
        WellKnown::NotImplemented,
        WellKnown::Ellipsis,
        WellKnown::BaseException,
        WellKnown::Exception,
        WellKnown::StopIteration,
        WellKnown::IndexError,
        WellKnown::KeyError,
        WellKnown::OverflowError,
        WellKnown::RuntimeError,
        WellKnown::SystemError,
        WellKnown::TypeError,
        WellKnown::ValueError,
        WellKnown::ZeroDivisionError,
        WellKnown::AttributeError,
        WellKnown::MemoryError,
        WellKnown::ImportError,
        WellKnown::BaseObjectType,
        WellKnown::TypeType,
        WellKnown::BoolType,
        WellKnown::LongType,
        WellKnown::FloatType,
        WellKnown::UnicodeType,
        WellKnown::TupleType,
        WellKnown::ListType,
        WellKnown::DictType,
    ];

    /// Reserved handle id of this object.
    #[inline]
    pub const fn id(self) -> u32 {
        self as u32 + 1
    }

    #[inline]
    pub fn word(self) -> BoxedWord {
        BoxedWord::handle(self.id())
    }

    fn object(self, vm: &Vm) -> ObjRef {
        let ty = match self {
            WellKnown::None => return vm.none(),
            WellKnown::True => return vm.bool_obj(true),
            WellKnown::False => return vm.bool_obj(false),
            WellKnown::NotImplemented => return vm.not_implemented(),
            WellKnown::Ellipsis => return vm.ellipsis(),
            WellKnown::BaseException => BuiltinType::BaseException,
            WellKnown::Exception => BuiltinType::Exception,
            WellKnown::StopIteration => BuiltinType::StopIteration,
            WellKnown::IndexError => BuiltinType::IndexError,
            WellKnown::KeyError => BuiltinType::KeyError,
            WellKnown::OverflowError => BuiltinType::OverflowError,
            WellKnown::RuntimeError => BuiltinType::RuntimeError,
            WellKnown::SystemError => BuiltinType::SystemError,
            WellKnown::TypeError => BuiltinType::TypeError,
            WellKnown::ValueError => BuiltinType::ValueError,
            WellKnown::ZeroDivisionError => BuiltinType::ZeroDivisionError,
            WellKnown::AttributeError => BuiltinType::AttributeError,
            WellKnown::MemoryError => BuiltinType::MemoryError,
            WellKnown::ImportError => BuiltinType::ImportError,
            WellKnown::BaseObjectType => BuiltinType::Object,
            WellKnown::TypeType => BuiltinType::Type,
            WellKnown::BoolType => BuiltinType::Bool,
            WellKnown::LongType => BuiltinType::Int,
            WellKnown::FloatType => BuiltinType::Float,
            WellKnown::UnicodeType => BuiltinType::Str,
            WellKnown::TupleType => BuiltinType::Tuple,
            WellKnown::ListType => BuiltinType::List,
            WellKnown::DictType => BuiltinType::Dict,
        };
        vm.builtin_type(ty)
    }
}

/// The populated well-known table of one context.
pub struct GlobalHandles {
    objects: Vec<ObjRef>,
}

impl GlobalHandles {
    /// Installs every well-known object into its reserved slot.
    pub fn install(vm: &Vm, table: &mut HandleTable) -> Self {
        let objects: Vec<ObjRef> = WellKnown::ALL.iter().map(|w| w.object(vm)).collect();
        for (w, obj) in WellKnown::ALL.iter().zip(&objects) {
            table.install_reserved(w.id(), obj.clone());
        }
        Self { objects }
    }

    pub fn get(&self, which: WellKnown) -> &ObjRef {
        &self.objects[which as usize]
    }

    /// The reserved word for `obj` if it is one of the value singletons.
    pub fn singleton_word(&self, obj: &ObjRef) -> Option<BoxedWord> {
        const SINGLETONS: [WellKnown; 5] = [
            WellKnown::None,
            WellKnown::True,
            WellKnown::False,
            WellKnown::NotImplemented,
            WellKnown::Ellipsis,
        ];
        SINGLETONS
            .iter()
            .find(|w| Rc::ptr_eq(self.get(**w), obj))
            .map(|w| w.word())
    }

    /// Raw words in table order, as laid out in the native context.
    pub fn words(&self) -> [u64; GLOBAL_COUNT] {
        let mut words = [0u64; GLOBAL_COUNT];
        for (slot, w) in words.iter_mut().zip(WellKnown::ALL) {
            *slot = w.word().to_bits();
        }
        words
    }
}

/// Id space of persistent globals. Ids start at 1 and share the handle
/// word encoding, so a stored global is indistinguishable from a handle
/// word to native code.
///
/// Slots live as long as the owning context. A global is never released
/// on its own, not even when the module that created it is freed, because
/// native code may still hold the word in static storage. Storing into an
/// existing global replaces its object and drops the old one.
#[derive(Default)]
pub struct GlobalStorage {
    slots: Vec<ObjRef>,
}

impl GlobalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `obj`, reusing `previous` if it already names a global.
    pub fn store(&mut self, previous: BoxedWord, obj: ObjRef) -> BoxedWord {
        if let Some(id) = previous.as_handle() {
            if let Some(slot) = self.slots.get_mut(id as usize - 1) {
                *slot = obj;
                return previous;
            }
        }
        self.slots.push(obj);
        let id = self.slots.len() as u32;
        assert!(id <= MAX_HANDLE_ID, "global storage exhausted");
        BoxedWord::handle(id)
    }

    pub fn load(&self, global: BoxedWord) -> Option<ObjRef> {
        let id = global.as_handle()?;
        self.slots.get(id as usize - 1).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::handles::RESERVED_HANDLES;

    #[test]
    fn test_well_known_ids_are_reserved() {
        for (i, w) in WellKnown::ALL.iter().enumerate() {
            assert_eq!(*w as usize, i);
            assert!(w.id() >= 1 && w.id() < RESERVED_HANDLES);
        }
    }

    #[test]
    fn test_install_populates_table() {
        let vm = Vm::new();
        let mut table = HandleTable::new();
        let globals = GlobalHandles::install(&vm, &mut table);
        let none = table.resolve(WellKnown::None.id());
        assert!(Rc::ptr_eq(&none, &vm.none()));
        let key_error = table.resolve(WellKnown::KeyError.id());
        assert!(Rc::ptr_eq(&key_error, &vm.builtin_type(BuiltinType::KeyError)));
        assert_eq!(globals.singleton_word(&vm.bool_obj(false)), Some(WellKnown::False.word()));
        assert_eq!(globals.singleton_word(&vm.new_int(0)), None);
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_global_storage_reuses_slot() {
        let vm = Vm::new();
        let mut storage = GlobalStorage::new();
        let g = storage.store(BoxedWord::NULL, vm.new_str("a"));
        let again = storage.store(g, vm.new_str("b"));
        assert_eq!(g, again);
        assert_eq!(storage.len(), 1);
        let loaded = storage.load(g).unwrap();
        assert_eq!(loaded.as_str(), Some("b"));
        assert!(storage.load(BoxedWord::int(3)).is_none());
    }
}
