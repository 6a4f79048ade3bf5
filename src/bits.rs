//! Small bit-twiddling helpers used throughout the encoder and allocator.

/// True if `val` can be encoded as a sign-extended 8-bit immediate.
#[inline]
pub fn fits_i8(val: i64) -> bool {
    val >= i64::from(i8::MIN) && val <= i64::from(i8::MAX)
}

/// True if `val` can be encoded as a sign-extended 16-bit immediate.
#[inline]
pub fn fits_i16(val: i64) -> bool {
    val >= i64::from(i16::MIN) && val <= i64::from(i16::MAX)
}

/// True if `val` can be encoded as a sign-extended 32-bit immediate.
#[inline]
pub fn fits_i32(val: i64) -> bool {
    val >= i64::from(i32::MIN) && val <= i64::from(i32::MAX)
}

/// True if `val` is a power of two.
#[inline]
pub fn is_pow2(val: u64) -> bool {
    val != 0 && (val & (val - 1)) == 0
}

/// Integer log2; `val` must be nonzero.
#[inline]
pub fn log2i(val: u64) -> u32 {
    debug_assert!(val != 0);
    u64::BITS - 1 - val.leading_zeros()
}

/// Smallest operand width (8, 16, 32 or 64) that can hold `val` as a signed
/// quantity.
pub fn encode_size(val: i64) -> u32 {
    if fits_i8(val) {
        8
    } else if fits_i16(val) {
        16
    } else if fits_i32(val) {
        32
    } else {
        64
    }
}

/// Smallest operand width that can hold `val` as an unsigned quantity.
pub fn encode_size_unsigned(val: u64) -> u32 {
    if val <= u64::from(u8::MAX) {
        8
    } else if val <= u64::from(u16::MAX) {
        16
    } else if val <= u64::from(u32::MAX) {
        32
    } else {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits() {
        assert!(fits_i8(0));
        assert!(fits_i8(127));
        assert!(!fits_i8(128));
        assert!(fits_i8(-128));
        assert!(!fits_i8(-129));
    }

    #[test]
    fn sizes() {
        assert_eq!(encode_size(127), 8);
        assert_eq!(encode_size(128), 16);
        assert_eq!(encode_size_unsigned(128), 8);
        assert_eq!(encode_size(0x8000_0000), 64);
        assert_eq!(encode_size(0x7fff_ffff), 32);
        assert_eq!(encode_size_unsigned(0x8000_0000), 32);
    }

    #[test]
    fn pow2() {
        assert!(!is_pow2(0));
        assert!(!is_pow2(255));
        assert!(!is_pow2(1020));
        assert!(!is_pow2(779_632));

        assert!(is_pow2(1));
        assert!(is_pow2(2));
        assert!(is_pow2(32));
        assert!(is_pow2(4096));
        assert!(is_pow2(65536));
        assert!(is_pow2(2_097_152));
        assert!(is_pow2(274_877_906_944));
    }

    #[test]
    fn log2() {
        for shift in 1..16 {
            assert_eq!(log2i(1 << shift), shift);
        }
    }
}
