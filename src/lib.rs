//! A packed memory array: an ordered key→value container that keeps its
//! elements sorted in a single backing array while tolerating gaps between
//! them, so a local insert or delete only has to shift elements within a
//! small window instead of the whole array.
//!
//! The array is organised as an implicit balanced tree of windows, doubling
//! in size with each level: a [`Pma`] amortises insert/delete cost to
//! `O(log^2 n)` by rebalancing (pack + spread) the smallest enclosing
//! window whose density falls back within bounds, and only reallocates the
//! whole array when every level up to the root is out of bounds.
//!
//! Each array cell publishes its contents through a small lock-free marker
//! protocol, so concurrent readers and writers can share a single [`Pma`]
//! behind nothing heavier than a `RwLock` used purely to coordinate full
//! resizes, plus a `Mutex` serialising mutators against each other.
//!
//! ```
//! use isld_pma::Pma;
//!
//! let pma = Pma::create();
//! assert!(pma.insert(5, 50));
//! assert!(!pma.insert(5, 99)); // duplicate key, rejected
//! let (found, index) = pma.find(5);
//! assert!(found);
//! assert_eq!(pma.get(index as usize), Some((5, 50)));
//! ```

mod array;
pub(crate) mod consts;
mod error;
mod pma;
mod rebalance;
mod sizing;
mod slot;

pub use error::CapacityExceeded;
pub use pma::Pma;
