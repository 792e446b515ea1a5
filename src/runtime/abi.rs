//! Tagged-word representation for values crossing the native ABI
//!
//! Every value handed to or received from extension code is a single
//! 64-bit word. Small integers and doubles travel inline; everything else
//! travels as a handle id that indexes the context's handle table.
//!
//! Layout:
//! - Null handle: `0`
//! - Handle: `1 ..= 0x7FFF_FFFF` (the id itself)
//! - Small int: `0x0001_0000_xxxx_xxxx` (low 32 bits are the i32)
//! - Double: `f64::to_bits(d) + 0x0007_0000_0000_0000`
//!
//! Doubles are shifted up by `DOUBLE_OFFSET` so that every double word is
//! at least `0x0007_0000_0000_0000`. NaNs are canonicalized first, which
//! keeps the sum from wrapping. Anything outside these ranges is invalid.

/// Largest id a handle word may carry.
pub const MAX_HANDLE_ID: u32 = 0x7FFF_FFFF;

/// Offset added to the raw bits of a double.
const DOUBLE_OFFSET: u64 = 0x0007_0000_0000_0000;

/// Everything above the small int payload. Must equal `TAG_INT` exactly.
const INT_TAG_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Tag of a small int word.
const TAG_INT: u64 = 0x0001_0000_0000_0000;

/// Mask for the small int payload.
const INT_PAYLOAD_MASK: u64 = 0x0000_0000_FFFF_FFFF;

/// The quiet NaN all NaNs are folded into.
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// A boxed value as seen by native code.
///
/// `Copy` and one register wide. Only the handle kind needs the handle
/// table to interpret; every other kind decodes from the bits alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BoxedWord {
    bits: u64,
}

/// Decoded view of a [`BoxedWord`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WordKind {
    Null,
    Handle(u32),
    Int(i32),
    Double(f64),
    Invalid(u64),
}

impl BoxedWord {
    pub const NULL: BoxedWord = BoxedWord { bits: 0 };

    // =========================================================================
    // Constructors
    // =========================================================================

    #[inline]
    pub const fn null() -> Self {
        Self::NULL
    }

    /// Box an i32 inline.
    #[inline]
    pub const fn int(i: i32) -> Self {
        Self {
            bits: TAG_INT | (i as u32 as u64),
        }
    }

    /// Box an i64 inline if it fits in 32 bits.
    #[inline]
    pub fn try_int(i: i64) -> Option<Self> {
        i32::try_from(i).ok().map(Self::int)
    }

    /// Box a double inline. NaN payloads are not preserved.
    #[inline]
    pub fn double(d: f64) -> Self {
        let raw = if d.is_nan() { CANONICAL_NAN } else { d.to_bits() };
        Self {
            bits: raw + DOUBLE_OFFSET,
        }
    }

    /// Box a handle id.
    #[inline]
    pub fn handle(id: u32) -> Self {
        debug_assert!(id != 0 && id <= MAX_HANDLE_ID, "handle id {} out of range", id);
        Self { bits: id as u64 }
    }

    /// Create from raw bits (as received from native code).
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Get the raw bits (for handing to native code).
    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.bits
    }

    // =========================================================================
    // Type Checking
    // =========================================================================

    #[inline]
    pub const fn is_null(self) -> bool {
        self.bits == 0
    }

    #[inline]
    pub const fn is_handle(self) -> bool {
        self.bits != 0 && self.bits <= MAX_HANDLE_ID as u64
    }

    #[inline]
    pub const fn is_int(self) -> bool {
        (self.bits & INT_TAG_MASK) == TAG_INT
    }

    #[inline]
    pub const fn is_double(self) -> bool {
        self.bits >= DOUBLE_OFFSET
    }

    /// Inline primitive (int or double); needs no handle table.
    #[inline]
    pub const fn is_primitive(self) -> bool {
        self.is_int() || self.is_double()
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.is_null() || self.is_handle() || self.is_int() || self.is_double()
    }

    // =========================================================================
    // Value Extraction
    // =========================================================================

    #[inline]
    pub fn as_int(self) -> Option<i32> {
        if self.is_int() {
            Some(self.as_int_unchecked())
        } else {
            None
        }
    }

    /// Only meaningful if `is_int()` returns true.
    #[inline]
    pub const fn as_int_unchecked(self) -> i32 {
        (self.bits & INT_PAYLOAD_MASK) as u32 as i32
    }

    #[inline]
    pub fn as_double(self) -> Option<f64> {
        if self.is_double() {
            Some(self.as_double_unchecked())
        } else {
            None
        }
    }

    /// Only meaningful if `is_double()` returns true.
    #[inline]
    pub fn as_double_unchecked(self) -> f64 {
        f64::from_bits(self.bits - DOUBLE_OFFSET)
    }

    #[inline]
    pub fn as_handle(self) -> Option<u32> {
        if self.is_handle() {
            Some(self.bits as u32)
        } else {
            None
        }
    }

    pub fn kind(self) -> WordKind {
        if self.is_null() {
            WordKind::Null
        } else if self.is_handle() {
            WordKind::Handle(self.bits as u32)
        } else if self.is_int() {
            WordKind::Int(self.as_int_unchecked())
        } else if self.is_double() {
            WordKind::Double(self.as_double_unchecked())
        } else {
            WordKind::Invalid(self.bits)
        }
    }
}

impl std::fmt::Debug for BoxedWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            WordKind::Null => write!(f, "Null"),
            WordKind::Handle(id) => write!(f, "Handle({})", id),
            WordKind::Int(i) => write!(f, "Int({})", i),
            WordKind::Double(d) => write!(f, "Double({})", d),
            WordKind::Invalid(bits) => write!(f, "Invalid(0x{:016x})", bits),
        }
    }
}

impl Default for BoxedWord {
    fn default() -> Self {
        Self::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_double_roundtrip() {
        let values = [
            0.0,
            -0.0,
            1.0,
            -1.0,
            3.14159,
            f64::MAX,
            f64::MIN,
            f64::MIN_POSITIVE,
            f64::INFINITY,
            f64::NEG_INFINITY,
        ];
        for d in values {
            let w = BoxedWord::double(d);
            assert!(w.is_double(), "Expected double for {}", d);
            assert!(!w.is_int() && !w.is_handle() && !w.is_null());
            assert_eq!(w.as_double().map(f64::to_bits), Some(d.to_bits()));
        }
    }

    #[test]
    fn test_nan_is_canonical() {
        let a = BoxedWord::double(f64::NAN);
        let b = BoxedWord::double(f64::from_bits(0xFFF8_0000_0000_1234));
        assert_eq!(a, b);
        assert!(a.as_double().unwrap().is_nan());
    }

    #[test]
    fn test_int_extremes() {
        for i in [0, 1, -1, i32::MAX, i32::MIN] {
            let w = BoxedWord::int(i);
            assert!(w.is_int());
            assert!(!w.is_double() && !w.is_handle());
            assert_eq!(w.as_int(), Some(i));
        }
        assert!(BoxedWord::try_int(i32::MAX as i64 + 1).is_none());
        assert!(BoxedWord::try_int(i32::MIN as i64 - 1).is_none());
        assert_eq!(BoxedWord::try_int(-7).and_then(BoxedWord::as_int), Some(-7));
    }

    #[test]
    fn test_null_and_handles() {
        assert!(BoxedWord::null().is_null());
        assert!(!BoxedWord::null().is_handle());
        assert_eq!(BoxedWord::handle(1).as_handle(), Some(1));
        assert_eq!(BoxedWord::handle(MAX_HANDLE_ID).as_handle(), Some(MAX_HANDLE_ID));
        assert_eq!(BoxedWord::int(5).as_handle(), None);
    }

    #[test]
    fn test_invalid_words() {
        let gaps = [
            MAX_HANDLE_ID as u64 + 1,
            0x0000_FFFF_FFFF_FFFF,
            0x0001_0001_0000_0000,
            DOUBLE_OFFSET - 1,
        ];
        for bits in gaps {
            let w = BoxedWord::from_bits(bits);
            assert!(!w.is_valid(), "0x{:016x} should be invalid", bits);
            assert_eq!(w.kind(), WordKind::Invalid(bits));
        }
    }

    #[test]
    fn test_int_tag_needs_zero_padding() {
        for bits in [0x0001_0001_0000_0000u64, 0x0001_8000_0000_0001, 0x0001_0000_0001_0000 | (1 << 40)] {
            let w = BoxedWord::from_bits(bits);
            assert!(!w.is_int(), "0x{:016x}", bits);
            assert_eq!(w.as_int(), None);
        }
        assert_eq!(BoxedWord::from_bits(0x0001_0000_FFFF_FFFF).as_int(), Some(-1));
    }

    proptest! {
        #[test]
        fn prop_int_roundtrip(i in any::<i32>()) {
            let w = BoxedWord::int(i);
            prop_assert_eq!(w.kind(), WordKind::Int(i));
        }

        #[test]
        fn prop_double_roundtrip(d in any::<f64>()) {
            let w = BoxedWord::double(d);
            prop_assert!(w.is_double());
            let back = w.as_double().unwrap();
            if d.is_nan() {
                prop_assert!(back.is_nan());
            } else {
                prop_assert_eq!(back.to_bits(), d.to_bits());
            }
        }

        #[test]
        fn prop_handle_roundtrip(id in 1u32..=MAX_HANDLE_ID) {
            prop_assert_eq!(BoxedWord::handle(id).kind(), WordKind::Handle(id));
        }

        #[test]
        fn prop_tags_exclusive(bits in any::<u64>()) {
            let w = BoxedWord::from_bits(bits);
            let hits = [w.is_null(), w.is_handle(), w.is_int(), w.is_double()]
                .iter()
                .filter(|b| **b)
                .count();
            prop_assert!(hits <= 1);
        }
    }
}
