//! ABI Compatibility Tests
//!
//! These tests pin everything compiled extensions depend on: the version,
//! the word encodings, the well-known handle ids and the layout of the
//! context function table. Any change to the ABI should fail here.

mod tests {
    use crate::runtime::ABI_VERSION;
    use crate::runtime::abi_version::{ABI_NAME, DEBUG_ABI_NAME, INIT_SYMBOL_PREFIX, VERSION_SYMBOL, init_symbol};

    #[test]
    fn test_abi_version() {
        assert_eq!(ABI_VERSION, 1, "ABI version must be 1");
    }

    #[test]
    fn test_abi_names() {
        assert_eq!(ABI_NAME, b"extbridge-universal\0");
        assert_eq!(DEBUG_ABI_NAME, b"extbridge-debug\0");
    }

    #[test]
    fn test_symbol_names() {
        assert_eq!(VERSION_SYMBOL, "extbridge_abi_version");
        assert_eq!(INIT_SYMBOL_PREFIX, "extbridge_init_");
        assert_eq!(init_symbol("spam"), "extbridge_init_spam");
    }
}

mod value_encoding_tests {
    use crate::runtime::abi::{BoxedWord, MAX_HANDLE_ID};

    /// These values are hardcoded in compiled extensions.
    #[test]
    fn test_word_encodings() {
        assert_eq!(BoxedWord::NULL.to_bits(), 0);
        assert_eq!(BoxedWord::handle(1).to_bits(), 1);
        assert_eq!(BoxedWord::handle(MAX_HANDLE_ID).to_bits(), 0x7FFF_FFFF);
        assert_eq!(BoxedWord::int(0).to_bits(), 0x0001_0000_0000_0000);
        assert_eq!(BoxedWord::int(-1).to_bits(), 0x0001_0000_FFFF_FFFF);
        assert_eq!(BoxedWord::int(i32::MIN).to_bits(), 0x0001_0000_8000_0000);
        assert_eq!(BoxedWord::double(0.0).to_bits(), 0x0007_0000_0000_0000);
        assert_eq!(BoxedWord::double(1.0).to_bits(), 0x3FF0_0000_0000_0000 + 0x0007_0000_0000_0000);
    }

    #[test]
    fn test_nan_is_canonical() {
        let quiet = BoxedWord::double(f64::NAN);
        let other = BoxedWord::double(f64::from_bits(0xFFF8_0000_0000_0001));
        assert_eq!(quiet, other);
        assert_eq!(quiet.to_bits(), 0x7FF8_0000_0000_0000 + 0x0007_0000_0000_0000);
    }

    #[test]
    fn test_kinds_do_not_overlap() {
        // Largest negative double lands just below the top of the word space.
        let neg = BoxedWord::double(f64::NEG_INFINITY).to_bits();
        assert!(neg > 0x0007_0000_0000_0000);
        assert!(BoxedWord::from_bits(neg).is_double());
        assert!(!BoxedWord::from_bits(0x8000_0000).is_valid());
        assert!(!BoxedWord::from_bits(0x0002_0000_0000_0000).is_valid());
    }
}

mod layout_tests {
    use std::mem::{offset_of, size_of};

    use crate::runtime::globals::{GLOBAL_COUNT, WellKnown};
    use crate::runtime::signature::{CONTEXT_MEMBER_COUNT, ContextMember};
    use crate::runtime::stubs::{AbiContext, AbiFunctions, MethodDef, ModuleDef};

    const PTR: usize = size_of::<usize>();

    #[test]
    fn test_well_known_ids() {
        assert_eq!(GLOBAL_COUNT, 28);
        assert_eq!(WellKnown::None.id(), 1);
        assert_eq!(WellKnown::True.id(), 2);
        assert_eq!(WellKnown::False.id(), 3);
        assert_eq!(WellKnown::BaseException.id(), 6);
        assert_eq!(WellKnown::SystemError.id(), 13);
        assert_eq!(WellKnown::TypeType.id(), 21);
        assert_eq!(WellKnown::DictType.id(), 28);
    }

    #[test]
    fn test_function_table_size() {
        assert_eq!(CONTEXT_MEMBER_COUNT, 42);
        assert_eq!(size_of::<AbiFunctions>(), CONTEXT_MEMBER_COUNT * PTR);
    }

    /// Slot `n` of the table is ordinal `n`.
    #[test]
    fn test_function_table_order() {
        let offsets = [
            (ContextMember::Dup, offset_of!(AbiFunctions, dup)),
            (ContextMember::Close, offset_of!(AbiFunctions, close)),
            (ContextMember::BulkClose, offset_of!(AbiFunctions, bulk_close)),
            (ContextMember::LongFromLong, offset_of!(AbiFunctions, long_from_long)),
            (ContextMember::LongFromUnsignedLong, offset_of!(AbiFunctions, long_from_unsigned_long)),
            (ContextMember::LongAsLong, offset_of!(AbiFunctions, long_as_long)),
            (ContextMember::LongAsDouble, offset_of!(AbiFunctions, long_as_double)),
            (ContextMember::FloatFromDouble, offset_of!(AbiFunctions, float_from_double)),
            (ContextMember::FloatAsDouble, offset_of!(AbiFunctions, float_as_double)),
            (ContextMember::BoolFromLong, offset_of!(AbiFunctions, bool_from_long)),
            (ContextMember::UnicodeFromString, offset_of!(AbiFunctions, unicode_from_string)),
            (ContextMember::UnicodeGetLength, offset_of!(AbiFunctions, unicode_get_length)),
            (ContextMember::GetAttr, offset_of!(AbiFunctions, get_attr)),
            (ContextMember::GetAttrS, offset_of!(AbiFunctions, get_attr_s)),
            (ContextMember::SetAttr, offset_of!(AbiFunctions, set_attr)),
            (ContextMember::SetAttrS, offset_of!(AbiFunctions, set_attr_s)),
            (ContextMember::HasAttrS, offset_of!(AbiFunctions, has_attr_s)),
            (ContextMember::GetItem, offset_of!(AbiFunctions, get_item)),
            (ContextMember::GetItemI, offset_of!(AbiFunctions, get_item_i)),
            (ContextMember::SetItem, offset_of!(AbiFunctions, set_item)),
            (ContextMember::Length, offset_of!(AbiFunctions, length)),
            (ContextMember::CallTupleDict, offset_of!(AbiFunctions, call_tuple_dict)),
            (ContextMember::TypeCheck, offset_of!(AbiFunctions, type_check)),
            (ContextMember::Type, offset_of!(AbiFunctions, type_)),
            (ContextMember::Is, offset_of!(AbiFunctions, is)),
            (ContextMember::IsTrue, offset_of!(AbiFunctions, is_true)),
            (ContextMember::Repr, offset_of!(AbiFunctions, repr)),
            (ContextMember::ErrSetString, offset_of!(AbiFunctions, err_set_string)),
            (ContextMember::ErrSetObject, offset_of!(AbiFunctions, err_set_object)),
            (ContextMember::ErrOccurred, offset_of!(AbiFunctions, err_occurred)),
            (ContextMember::ErrExceptionMatches, offset_of!(AbiFunctions, err_exception_matches)),
            (ContextMember::ErrClear, offset_of!(AbiFunctions, err_clear)),
            (ContextMember::ErrNoMemory, offset_of!(AbiFunctions, err_no_memory)),
            (ContextMember::TupleFromArray, offset_of!(AbiFunctions, tuple_from_array)),
            (ContextMember::ListNew, offset_of!(AbiFunctions, list_new)),
            (ContextMember::ListAppend, offset_of!(AbiFunctions, list_append)),
            (ContextMember::DictNew, offset_of!(AbiFunctions, dict_new)),
            (ContextMember::NumberCheck, offset_of!(AbiFunctions, number_check)),
            (ContextMember::ListCheck, offset_of!(AbiFunctions, list_check)),
            (ContextMember::GlobalStore, offset_of!(AbiFunctions, global_store)),
            (ContextMember::GlobalLoad, offset_of!(AbiFunctions, global_load)),
            (ContextMember::ModuleCreate, offset_of!(AbiFunctions, module_create)),
        ];
        assert_eq!(offsets.len(), CONTEXT_MEMBER_COUNT);
        for (member, offset) in offsets {
            assert_eq!(
                offset,
                member.ordinal() as usize * PTR,
                "{} is out of place in the function table",
                member.name()
            );
        }
    }

    #[test]
    fn test_context_header_layout() {
        assert_eq!(offset_of!(AbiContext, name), 0);
        assert_eq!(offset_of!(AbiContext, abi_version), PTR);
        assert_eq!(offset_of!(AbiContext, mode), PTR + 4);
        let handles = offset_of!(AbiContext, handles);
        assert!(handles > offset_of!(AbiContext, mode));
        assert_eq!(offset_of!(AbiContext, funcs), handles + GLOBAL_COUNT * 8);
    }

    #[test]
    fn test_module_def_layout() {
        assert_eq!(offset_of!(MethodDef, name), 0);
        assert_eq!(offset_of!(MethodDef, convention), PTR);
        assert_eq!(offset_of!(MethodDef, func), 2 * PTR);
        assert_eq!(offset_of!(MethodDef, doc), 3 * PTR);
        assert_eq!(offset_of!(ModuleDef, methods), 2 * PTR);
        assert_eq!(offset_of!(ModuleDef, method_count), 3 * PTR);
    }
}
