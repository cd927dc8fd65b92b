//! Bit-exact tuning constants shared by the sizing, rebalance, and slot
//! modules.

/// Upper density threshold at the leaves (height 0).
pub(crate) const T0: f64 = 1.00;
/// Upper density threshold at the root.
pub(crate) const TH: f64 = 0.75;
/// Lower density threshold at the leaves (height 0).
pub(crate) const P0: f64 = 0.25;
/// Lower density threshold at the root.
pub(crate) const PH: f64 = 0.50;

/// `1 / P0`. Scales computed capacity to guarantee room for future growth.
pub(crate) const MAX_SPARSENESS: u64 = 4;

/// Largest representable capacity. 8 bits are reserved above this so that
/// `spread`'s fixed-point arithmetic (`capacity << 8`) never overflows a u64.
pub(crate) const MAX_SIZE: u64 = (1u64 << 56) - 1;
