//! The one domain error a packed memory array can raise.

use std::fmt;

/// Raised when growing the array would require a capacity beyond
/// [`crate::consts::MAX_SIZE`]. In the source this was a bare `assert`; the
/// crate keeps the fatal outcome (there is no sensible way to keep running
/// with a larger-than-representable array) but names the cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub(crate) attempted: u64,
}

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packed memory array capacity {} exceeds MAX_SIZE ({})",
            self.attempted,
            crate::consts::MAX_SIZE
        )
    }
}

impl std::error::Error for CapacityExceeded {}
