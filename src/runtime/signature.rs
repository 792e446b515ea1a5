//! Context function signatures
//!
//! Every ABI entry point has a fixed ordinal (its position in the native
//! function table), a name used in error messages and statistics, and a
//! signature the dispatcher uses to decode raw argument words.

/// How one argument or result word is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiType {
    /// Boxed word resolved to an object; null is rejected.
    Handle,
    /// Boxed word resolved to an object; null passes through.
    OptHandle,
    /// Boxed word passed through undecoded (fast paths).
    RawHandle,
    Long,
    UnsignedLong,
    Int,
    SizeT,
    /// f64 passed as its bits.
    Double,
    /// NUL-terminated UTF-8.
    CharPtr,
    VoidPtr,
    /// Pointer to an array of boxed words.
    HandleArray,
    Void,
}

/// What the dispatcher checks after a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// A new pending exception after success is a contract violation.
    Checked,
    /// The entry inspects or manipulates the exception state itself.
    Passive,
}

#[derive(Debug, Clone, Copy)]
pub struct ContextSignature {
    pub params: &'static [AbiType],
    pub ret: AbiType,
    pub policy: ErrorPolicy,
}

impl ContextSignature {
    const fn checked(params: &'static [AbiType], ret: AbiType) -> Self {
        Self {
            params,
            ret,
            policy: ErrorPolicy::Checked,
        }
    }

    const fn passive(params: &'static [AbiType], ret: AbiType) -> Self {
        Self {
            params,
            ret,
            policy: ErrorPolicy::Passive,
        }
    }
}

macro_rules! context_members {
    ($($member:ident => $name:literal),* $(,)?) => {
        /// ABI entry points in table order. New members are appended only.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum ContextMember {
            $($member,)*
        }

        impl ContextMember {
            pub const ALL: &'static [ContextMember] = &[$(ContextMember::$member,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(ContextMember::$member => $name,)*
                }
            }
        }
    };
}

context_members! {
    Dup => "ctx_Dup",
    Close => "ctx_Close",
    BulkClose => "ctx_BulkClose",
    LongFromLong => "ctx_Long_FromLong",
    LongFromUnsignedLong => "ctx_Long_FromUnsignedLong",
    LongAsLong => "ctx_Long_AsLong",
    LongAsDouble => "ctx_Long_AsDouble",
    FloatFromDouble => "ctx_Float_FromDouble",
    FloatAsDouble => "ctx_Float_AsDouble",
    BoolFromLong => "ctx_Bool_FromLong",
    UnicodeFromString => "ctx_Unicode_FromString",
    UnicodeGetLength => "ctx_Unicode_GetLength",
    GetAttr => "ctx_GetAttr",
    GetAttrS => "ctx_GetAttr_s",
    SetAttr => "ctx_SetAttr",
    SetAttrS => "ctx_SetAttr_s",
    HasAttrS => "ctx_HasAttr_s",
    GetItem => "ctx_GetItem",
    GetItemI => "ctx_GetItem_i",
    SetItem => "ctx_SetItem",
    Length => "ctx_Length",
    CallTupleDict => "ctx_CallTupleDict",
    TypeCheck => "ctx_TypeCheck",
    Type => "ctx_Type",
    Is => "ctx_Is",
    IsTrue => "ctx_IsTrue",
    Repr => "ctx_Repr",
    ErrSetString => "ctx_Err_SetString",
    ErrSetObject => "ctx_Err_SetObject",
    ErrOccurred => "ctx_Err_Occurred",
    ErrExceptionMatches => "ctx_Err_ExceptionMatches",
    ErrClear => "ctx_Err_Clear",
    ErrNoMemory => "ctx_Err_NoMemory",
    TupleFromArray => "ctx_Tuple_FromArray",
    ListNew => "ctx_List_New",
    ListAppend => "ctx_List_Append",
    DictNew => "ctx_Dict_New",
    NumberCheck => "ctx_Number_Check",
    ListCheck => "ctx_List_Check",
    GlobalStore => "ctx_Global_Store",
    GlobalLoad => "ctx_Global_Load",
    ModuleCreate => "ctx_Module_Create",
}

pub const CONTEXT_MEMBER_COUNT: usize = ContextMember::ALL.len();

impl ContextMember {
    #[inline]
    pub const fn ordinal(self) -> u32 {
        self as u32
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn signature(self) -> ContextSignature {
        use AbiType::*;
        use ContextMember as M;
        match self {
            M::Dup => ContextSignature::passive(&[RawHandle], Handle),
            M::Close => ContextSignature::passive(&[RawHandle], Void),
            M::BulkClose => ContextSignature::passive(&[HandleArray, SizeT], Void),
            M::LongFromLong => ContextSignature::checked(&[Long], Handle),
            M::LongFromUnsignedLong => ContextSignature::checked(&[UnsignedLong], Handle),
            M::LongAsLong => ContextSignature::checked(&[RawHandle], Long),
            M::LongAsDouble => ContextSignature::checked(&[RawHandle], Double),
            M::FloatFromDouble => ContextSignature::checked(&[Double], Handle),
            M::FloatAsDouble => ContextSignature::checked(&[RawHandle], Double),
            M::BoolFromLong => ContextSignature::checked(&[Long], Handle),
            M::UnicodeFromString => ContextSignature::checked(&[CharPtr], Handle),
            M::UnicodeGetLength => ContextSignature::checked(&[Handle], SizeT),
            M::GetAttr => ContextSignature::checked(&[Handle, Handle], Handle),
            M::GetAttrS => ContextSignature::checked(&[Handle, CharPtr], Handle),
            M::SetAttr => ContextSignature::checked(&[Handle, Handle, Handle], Int),
            M::SetAttrS => ContextSignature::checked(&[Handle, CharPtr, Handle], Int),
            M::HasAttrS => ContextSignature::checked(&[Handle, CharPtr], Int),
            M::GetItem => ContextSignature::checked(&[Handle, Handle], Handle),
            M::GetItemI => ContextSignature::checked(&[Handle, SizeT], Handle),
            M::SetItem => ContextSignature::checked(&[Handle, Handle, Handle], Int),
            M::Length => ContextSignature::checked(&[Handle], SizeT),
            M::CallTupleDict => {
                ContextSignature::checked(&[Handle, OptHandle, OptHandle], Handle)
            }
            M::TypeCheck => ContextSignature::checked(&[RawHandle, Handle], Int),
            M::Type => ContextSignature::checked(&[RawHandle], Handle),
            M::Is => ContextSignature::checked(&[RawHandle, RawHandle], Int),
            M::IsTrue => ContextSignature::checked(&[Handle], Int),
            M::Repr => ContextSignature::checked(&[Handle], Handle),
            M::ErrSetString => ContextSignature::passive(&[Handle, CharPtr], Void),
            M::ErrSetObject => ContextSignature::passive(&[Handle, OptHandle], Void),
            M::ErrOccurred => ContextSignature::passive(&[], Int),
            M::ErrExceptionMatches => ContextSignature::passive(&[Handle], Int),
            M::ErrClear => ContextSignature::passive(&[], Void),
            M::ErrNoMemory => ContextSignature::passive(&[], Handle),
            M::TupleFromArray => ContextSignature::checked(&[HandleArray, SizeT], Handle),
            M::ListNew => ContextSignature::checked(&[SizeT], Handle),
            M::ListAppend => ContextSignature::checked(&[Handle, Handle], Int),
            M::DictNew => ContextSignature::checked(&[], Handle),
            M::NumberCheck => ContextSignature::checked(&[RawHandle], Int),
            M::ListCheck => ContextSignature::checked(&[RawHandle], Int),
            M::GlobalStore => ContextSignature::passive(&[VoidPtr, RawHandle], Void),
            M::GlobalLoad => ContextSignature::checked(&[RawHandle], Handle),
            M::ModuleCreate => ContextSignature::checked(&[VoidPtr], Handle),
        }
    }
}

impl std::fmt::Display for ContextMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_match_positions() {
        for (i, member) in ContextMember::ALL.iter().enumerate() {
            assert_eq!(member.ordinal() as usize, i);
            assert_eq!(ContextMember::from_ordinal(i as u32), Some(*member));
        }
        assert_eq!(ContextMember::from_ordinal(CONTEXT_MEMBER_COUNT as u32), None);
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<&str> = ContextMember::ALL.iter().map(|m| m.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CONTEXT_MEMBER_COUNT);
    }

    #[test]
    fn test_void_param_never_declared() {
        for member in ContextMember::ALL {
            assert!(!member.signature().params.contains(&AbiType::Void), "{}", member);
        }
    }
}
