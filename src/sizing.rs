//! Bit-twiddling helpers for capacity computation, ported from the `pma.c`
//! this crate was distilled from (`last_bit_set`, `floor_lg`, `ceil_lg`,
//! `hyperceil`, `ceil_div`).

/// 1-based index of the most significant set bit of `x`, or `0` for `x == 0`.
pub(crate) fn last_bit_set(x: u64) -> u32 {
    u64::BITS - x.leading_zeros()
}

/// `floor(log2(x))`. `x` must be nonzero.
pub(crate) fn floor_lg(x: u64) -> u32 {
    debug_assert!(x > 0);
    last_bit_set(x) - 1
}

/// `ceil(log2(x))`. `x` must be nonzero.
pub(crate) fn ceil_lg(x: u64) -> u32 {
    debug_assert!(x > 0);
    last_bit_set(x - 1)
}

/// Smallest power of two not less than `x`.
pub(crate) fn hyperceil(x: u64) -> u64 {
    1u64 << ceil_lg(x)
}

/// `ceil(x / y)`. `x` must be nonzero.
pub(crate) fn ceil_div(x: u64, y: u64) -> u64 {
    debug_assert!(x > 0);
    1 + ((x - 1) / y)
}
