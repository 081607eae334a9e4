//! NaN-boxed value representation
//!
//! Every Charly value is a single 64-bit word. Valid doubles (finite values,
//! the two infinities and one canonical quiet NaN) are stored as themselves;
//! every other value lives inside the payload of a quiet-NaN pattern:
//!
//! ```text
//! S[Exponent---][Mantissa--------------------------------------------]
//! -11111111111 1TTT <-------------- 48 payload bits ---------------->
//!              ^
//!              quiet bit
//! ```
//!
//! The three type bits select the immediate kind:
//!
//! | TTT | kind                                            |
//! |-----|-------------------------------------------------|
//! | 000 | canonical NaN                                   |
//! | 001 | false                                           |
//! | 010 | true                                            |
//! | 011 | null                                            |
//! | 100 | integer (48-bit two's complement)               |
//! | 101 | symbol (48-bit hash)                            |
//! | 110 | packed string (exactly 6 bytes)                 |
//! | 111 | inline string (0-5 bytes + length byte)         |
//!
//! A set sign bit on top of the quiet-NaN pattern marks a heap handle; the
//! payload is a 48-bit arena-slot index resolved through the heap, never a
//! native address, so the encoding is portable across address layouts.
//!
//! Short-string payloads are packed endian-aware so that a byte slice
//! borrowed from the value itself reads the string front to back.

use crate::heap::CellRef;
use std::fmt;

/// Largest integer an immediate value can hold
pub const MAX_INT: i64 = (1 << 47) - 1;
/// Smallest integer an immediate value can hold
pub const MIN_INT: i64 = -(1 << 47);
/// Maximum byte length of an inline string
pub const MAX_ISTRING_LEN: usize = 5;
/// Exact byte length of a packed string
pub const PSTRING_LEN: usize = 6;

const MASK_SIGN: u64 = 0x8000_0000_0000_0000;
const MASK_EXPONENT: u64 = 0x7FF0_0000_0000_0000;
const MASK_QUIET: u64 = 0x0008_0000_0000_0000;
const MASK_SIGNATURE: u64 = 0xFFFF_0000_0000_0000;
const MASK_PAYLOAD: u64 = 0x0000_FFFF_FFFF_FFFF;
const MASK_INT_SIGN: u64 = 0x0000_8000_0000_0000;

const BITS_NAN: u64 = MASK_EXPONENT | MASK_QUIET;

const ITYPE_FALSE: u64 = 0x0001_0000_0000_0000;
const ITYPE_TRUE: u64 = 0x0002_0000_0000_0000;
const ITYPE_NULL: u64 = 0x0003_0000_0000_0000;
const ITYPE_INTEGER: u64 = 0x0004_0000_0000_0000;
const ITYPE_SYMBOL: u64 = 0x0005_0000_0000_0000;
const ITYPE_PSTRING: u64 = 0x0006_0000_0000_0000;
const ITYPE_ISTRING: u64 = 0x0007_0000_0000_0000;

const BITS_FALSE: u64 = BITS_NAN | ITYPE_FALSE;
const BITS_TRUE: u64 = BITS_NAN | ITYPE_TRUE;
const BITS_NULL: u64 = BITS_NAN | ITYPE_NULL;

const SIGNATURE_POINTER: u64 = MASK_SIGN | BITS_NAN;
const SIGNATURE_INTEGER: u64 = BITS_NAN | ITYPE_INTEGER;
const SIGNATURE_SYMBOL: u64 = BITS_NAN | ITYPE_SYMBOL;
const SIGNATURE_PSTRING: u64 = BITS_NAN | ITYPE_PSTRING;
const SIGNATURE_ISTRING: u64 = BITS_NAN | ITYPE_ISTRING;

/// A NaN-boxed Charly value
///
/// Equality and hashing are bitwise; use [`Value::strict_equals`] for the
/// numeric comparison the language exposes (which normalises signed zero and
/// treats NaN per IEEE).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    // ========================================================================
    // Constructors
    // ========================================================================

    /// The null value
    #[inline]
    pub const fn null() -> Self {
        Value(BITS_NULL)
    }

    /// A boolean value
    #[inline]
    pub const fn boolean(b: bool) -> Self {
        Value(if b { BITS_TRUE } else { BITS_FALSE })
    }

    /// The canonical NaN
    #[inline]
    pub const fn nan() -> Self {
        Value(BITS_NAN)
    }

    /// An immediate integer
    ///
    /// Truncates silently to 48 bits; use [`Value::number`] for the
    /// range-checked constructor that promotes to a double.
    #[inline]
    pub const fn integer(value: i64) -> Self {
        Value(SIGNATURE_INTEGER | (value as u64 & MASK_PAYLOAD))
    }

    /// An immediate double
    ///
    /// Any NaN input collapses to the canonical NaN so that no pointer-lookalike
    /// bit pattern can enter through arithmetic. Infinities are stored directly.
    #[inline]
    pub fn double(value: f64) -> Self {
        if value.is_nan() {
            Value(BITS_NAN)
        } else {
            Value(value.to_bits())
        }
    }

    /// A number from an i64, promoting to a double outside the safe range
    #[inline]
    pub fn number(value: i64) -> Self {
        if value > MAX_INT || value < MIN_INT {
            Value::double(value as f64)
        } else {
            Value::integer(value)
        }
    }

    /// A symbol from its 48-bit hash payload
    #[inline]
    pub const fn symbol(hash: u64) -> Self {
        Value(SIGNATURE_SYMBOL | (hash & MASK_PAYLOAD))
    }

    /// A heap handle
    #[inline]
    pub const fn cell(cell: CellRef) -> Self {
        Value(SIGNATURE_POINTER | (cell.raw() & MASK_PAYLOAD))
    }

    /// An immediate string of at most 6 bytes
    ///
    /// Returns `None` when the byte sequence is too long; the caller falls
    /// back to a heap string.
    pub fn immediate_string(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            PSTRING_LEN => {
                let mut bits = SIGNATURE_PSTRING;
                for (i, &b) in bytes.iter().enumerate() {
                    bits |= (b as u64) << pstring_shift(i);
                }
                Some(Value(bits))
            }
            len if len <= MAX_ISTRING_LEN => {
                let mut bits = SIGNATURE_ISTRING | ((len as u64) << 40);
                for (i, &b) in bytes.iter().enumerate() {
                    bits |= (b as u64) << istring_shift(i);
                }
                Some(Value(bits))
            }
            _ => None,
        }
    }

    // ========================================================================
    // Predicates
    // ========================================================================

    /// Check for null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == BITS_NULL
    }

    /// Check for false
    #[inline]
    pub const fn is_false(self) -> bool {
        self.0 == BITS_FALSE
    }

    /// Check for true
    #[inline]
    pub const fn is_true(self) -> bool {
        self.0 == BITS_TRUE
    }

    /// Check for a boolean
    #[inline]
    pub const fn is_boolean(self) -> bool {
        self.is_false() || self.is_true()
    }

    /// Check for a double
    ///
    /// True for finite values, both infinities and the canonical NaN.
    #[inline]
    pub const fn is_double(self) -> bool {
        // Finite, infinite (exponent saturated but mantissa clear), or the
        // canonical NaN. Every boxed value carries the quiet bit plus extra
        // payload, so it fails all three arms.
        (self.0 & MASK_EXPONENT) != MASK_EXPONENT
            || (self.0 & !MASK_SIGN) == MASK_EXPONENT
            || self.0 == BITS_NAN
    }

    /// Check for the canonical NaN
    #[inline]
    pub const fn is_nan(self) -> bool {
        self.0 == BITS_NAN
    }

    /// Check for an immediate integer
    #[inline]
    pub const fn is_integer(self) -> bool {
        (self.0 & MASK_SIGNATURE) == SIGNATURE_INTEGER
    }

    /// Check for any numeric value
    #[inline]
    pub const fn is_numeric(self) -> bool {
        self.is_integer() || self.is_double()
    }

    /// Check for a symbol
    #[inline]
    pub const fn is_symbol(self) -> bool {
        (self.0 & MASK_SIGNATURE) == SIGNATURE_SYMBOL
    }

    /// Check for a packed string
    #[inline]
    pub const fn is_pstring(self) -> bool {
        (self.0 & MASK_SIGNATURE) == SIGNATURE_PSTRING
    }

    /// Check for an inline string
    #[inline]
    pub const fn is_istring(self) -> bool {
        (self.0 & MASK_SIGNATURE) == SIGNATURE_ISTRING
    }

    /// Check for either immediate string form
    #[inline]
    pub const fn is_immediate_string(self) -> bool {
        self.is_pstring() || self.is_istring()
    }

    /// Check for a heap handle
    #[inline]
    pub const fn is_cell(self) -> bool {
        (self.0 & MASK_SIGNATURE) == SIGNATURE_POINTER
    }

    // ========================================================================
    // Extractors
    // ========================================================================

    /// Extract an integer
    ///
    /// Callers must establish `is_integer` first; the payload is
    /// sign-extended from bit 47.
    #[inline]
    pub const fn as_integer(self) -> i64 {
        let payload = self.0 & MASK_PAYLOAD;
        if payload & MASK_INT_SIGN != 0 {
            (payload | MASK_SIGNATURE) as i64
        } else {
            payload as i64
        }
    }

    /// Extract a double; callers must establish `is_double` first
    #[inline]
    pub fn as_double(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Extract a boolean; callers must establish `is_boolean` first
    #[inline]
    pub const fn as_boolean(self) -> bool {
        self.0 == BITS_TRUE
    }

    /// Extract a symbol hash; callers must establish `is_symbol` first
    #[inline]
    pub const fn as_symbol(self) -> u64 {
        self.0 & MASK_PAYLOAD
    }

    /// Extract a heap handle; callers must establish `is_cell` first
    #[inline]
    pub const fn as_cell(self) -> CellRef {
        CellRef::new(self.0 & MASK_PAYLOAD)
    }

    /// Extract any numeric value as a double
    ///
    /// Returns the canonical NaN for non-numeric values.
    #[inline]
    pub fn to_double(self) -> f64 {
        if self.is_integer() {
            self.as_integer() as f64
        } else if self.is_double() {
            self.as_double()
        } else {
            f64::NAN
        }
    }

    /// Extract any numeric value as an i64 (truncating doubles toward zero)
    ///
    /// Returns 0 for non-numeric values.
    #[inline]
    pub fn to_int(self) -> i64 {
        if self.is_integer() {
            self.as_integer()
        } else if self.is_double() {
            let d = self.as_double();
            if d.is_finite() {
                d as i64
            } else {
                0
            }
        } else {
            0
        }
    }

    /// Extract any numeric value as an i32 for shift/bitwise operations
    #[inline]
    pub fn to_int32(self) -> i32 {
        self.to_int() as i32
    }

    /// Byte length of an immediate string
    #[inline]
    pub const fn immediate_string_len(self) -> usize {
        if self.is_pstring() {
            PSTRING_LEN
        } else if self.is_istring() {
            ((self.0 >> 40) & 0xFF) as usize
        } else {
            0
        }
    }

    /// Borrow the bytes of an immediate string from the value itself
    ///
    /// The payload is packed so the bytes are contiguous and in order at a
    /// fixed offset inside the word, which makes this borrow possible for
    /// both short-string forms.
    pub fn immediate_string_bytes(&self) -> Option<&[u8]> {
        let len = if self.is_pstring() {
            PSTRING_LEN
        } else if self.is_istring() {
            self.immediate_string_len()
        } else {
            return None;
        };

        #[cfg(target_endian = "little")]
        let start = 0usize;
        #[cfg(target_endian = "big")]
        let start = if self.is_pstring() { 2 } else { 3 };

        let base = self as *const Value as *const u8;
        // The slice stays within the 8 bytes of `self` for every valid length.
        Some(unsafe { std::slice::from_raw_parts(base.add(start), len) })
    }

    /// Raw bit pattern
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild a value from a raw bit pattern
    #[inline]
    pub const fn from_raw(bits: u64) -> Self {
        Value(bits)
    }

    // ========================================================================
    // Semantics
    // ========================================================================

    /// Truthiness of immediate values
    ///
    /// False for: false, null, integer zero, ±0.0 and NaN. Heap handles are
    /// truthy here; the machine layers the finished-generator case on top.
    pub fn is_truthy_immediate(self) -> bool {
        if self.is_false() || self.is_null() {
            false
        } else if self.is_integer() {
            self.as_integer() != 0
        } else if self.is_double() {
            let d = self.as_double();
            !(d == 0.0 || d.is_nan())
        } else {
            true
        }
    }

    /// Numeric-aware equality
    ///
    /// Mixed int/double operands compare as doubles; NaN is unequal to
    /// everything including itself and signed zeros are equal. Everything
    /// else compares bitwise.
    pub fn strict_equals(self, other: Value) -> bool {
        if self.is_numeric() && other.is_numeric() {
            if self.is_integer() && other.is_integer() {
                self.as_integer() == other.as_integer()
            } else {
                self.to_double() == other.to_double()
            }
        } else {
            self.0 == other.0
        }
    }

    /// Type name of the immediate kind (heap handles report "pointer")
    pub const fn immediate_type_name(self) -> &'static str {
        if self.is_cell() {
            "pointer"
        } else if self.is_double() {
            "float"
        } else if self.is_integer() {
            "integer"
        } else if self.is_null() {
            "null"
        } else if self.is_immediate_string() {
            "string"
        } else if self.is_boolean() {
            "boolean"
        } else if self.is_symbol() {
            "symbol"
        } else {
            "unknown"
        }
    }
}

#[cfg(target_endian = "little")]
#[inline]
const fn pstring_shift(i: usize) -> u64 {
    (8 * i) as u64
}

#[cfg(target_endian = "big")]
#[inline]
const fn pstring_shift(i: usize) -> u64 {
    (8 * (5 - i)) as u64
}

#[cfg(target_endian = "little")]
#[inline]
const fn istring_shift(i: usize) -> u64 {
    (8 * i) as u64
}

#[cfg(target_endian = "big")]
#[inline]
const fn istring_shift(i: usize) -> u64 {
    (8 * (4 - i)) as u64
}

// ============================================================================
// Numeric operations
// ============================================================================

/// Add two numeric values
///
/// Int + int stays an int while the result fits the safe range; any other
/// numeric pairing promotes to a double. Non-numeric operands yield `None`.
pub fn add(left: Value, right: Value) -> Option<Value> {
    binary_numeric(left, right, i64::checked_add, |a, b| a + b)
}

/// Subtract two numeric values
pub fn sub(left: Value, right: Value) -> Option<Value> {
    binary_numeric(left, right, i64::checked_sub, |a, b| a - b)
}

/// Multiply two numeric values
pub fn mul(left: Value, right: Value) -> Option<Value> {
    binary_numeric(left, right, i64::checked_mul, |a, b| a * b)
}

/// Divide two numeric values; division always promotes to a double
pub fn div(left: Value, right: Value) -> Option<Value> {
    if !left.is_numeric() || !right.is_numeric() {
        return None;
    }
    Some(Value::double(left.to_double() / right.to_double()))
}

/// Remainder of two numeric values
///
/// Int % int uses the truncated integer remainder with `x % 0` mapped to the
/// canonical NaN; mixed operands use the floating remainder.
pub fn modulo(left: Value, right: Value) -> Option<Value> {
    if !left.is_numeric() || !right.is_numeric() {
        return None;
    }
    if left.is_integer() && right.is_integer() {
        let divisor = right.as_integer();
        if divisor == 0 {
            return Some(Value::nan());
        }
        return Some(Value::number(left.as_integer() % divisor));
    }
    Some(Value::double(left.to_double() % right.to_double()))
}

/// Exponentiation; integer operands round-trip through the range check
pub fn pow(left: Value, right: Value) -> Option<Value> {
    if !left.is_numeric() || !right.is_numeric() {
        return None;
    }
    let result = left.to_double().powf(right.to_double());
    if left.is_integer() && right.is_integer() && result.is_finite() && result.fract() == 0.0 {
        return Some(Value::number(result as i64));
    }
    Some(Value::double(result))
}

/// Unary minus
pub fn negate(value: Value) -> Option<Value> {
    if value.is_integer() {
        Some(Value::number(-value.as_integer()))
    } else if value.is_double() {
        Some(Value::double(-value.as_double()))
    } else {
        None
    }
}

fn binary_numeric(
    left: Value,
    right: Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Value> {
    if !left.is_numeric() || !right.is_numeric() {
        return None;
    }
    if left.is_integer() && right.is_integer() {
        let a = left.as_integer();
        let b = right.as_integer();
        if let Some(result) = int_op(a, b) {
            if (MIN_INT..=MAX_INT).contains(&result) {
                return Some(Value::integer(result));
            }
        }
        return Some(Value::double(float_op(a as f64, b as f64)));
    }
    Some(Value::double(float_op(left.to_double(), right.to_double())))
}

/// Numeric ordering comparison; NaN is unordered (every comparison false)
pub fn compare(left: Value, right: Value) -> Option<std::cmp::Ordering> {
    if !left.is_numeric() || !right.is_numeric() {
        return None;
    }
    if left.is_integer() && right.is_integer() {
        return Some(left.as_integer().cmp(&right.as_integer()));
    }
    left.to_double().partial_cmp(&right.to_double())
}

/// 32-bit shift left; negative shift counts clamp to zero
pub fn shl(left: Value, right: Value) -> Value {
    let amount = right.to_int32().max(0) as u32 % 32;
    Value::number((left.to_int32().wrapping_shl(amount)) as i64)
}

/// 32-bit arithmetic shift right; negative shift counts clamp to zero
pub fn shr(left: Value, right: Value) -> Value {
    let amount = right.to_int32().max(0) as u32 % 32;
    Value::number((left.to_int32().wrapping_shr(amount)) as i64)
}

/// 32-bit bitwise and
pub fn band(left: Value, right: Value) -> Value {
    Value::number((left.to_int32() & right.to_int32()) as i64)
}

/// 32-bit bitwise or
pub fn bor(left: Value, right: Value) -> Value {
    Value::number((left.to_int32() | right.to_int32()) as i64)
}

/// 32-bit bitwise xor
pub fn bxor(left: Value, right: Value) -> Value {
    Value::number((left.to_int32() ^ right.to_int32()) as i64)
}

/// 32-bit bitwise not
pub fn bnot(value: Value) -> Value {
    Value::number((!value.to_int32()) as i64)
}

// ============================================================================
// Formatting
// ============================================================================

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else if self.is_boolean() {
            write!(f, "{}", self.as_boolean())
        } else if self.is_integer() {
            write!(f, "int({})", self.as_integer())
        } else if self.is_double() {
            write!(f, "float({})", self.as_double())
        } else if self.is_symbol() {
            write!(f, "sym({:#x})", self.as_symbol())
        } else if self.is_immediate_string() {
            let bytes = self.immediate_string_bytes().unwrap();
            write!(f, "str({:?})", String::from_utf8_lossy(bytes))
        } else if self.is_cell() {
            write!(f, "cell({})", self.as_cell().raw())
        } else {
            write!(f, "value({:#x})", self.0)
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}
