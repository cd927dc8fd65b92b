//! The packed memory array itself: ties the slot protocol (L1), array
//! engine (L2), and rebalance policy (L3) together behind a single resize
//! coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::array;
use crate::consts::{MAX_SIZE, MAX_SPARSENESS, P0, PH, T0, TH};
use crate::error::CapacityExceeded;
use crate::rebalance;
use crate::sizing::{ceil_div, ceil_lg, floor_lg, hyperceil};
use crate::slot::{Op, Slot};

/// An ordered, gap-tolerant key→value container. Keys are 64-bit and must
/// be nonzero (`0` is the empty-slot sentinel); duplicate keys are
/// rejected. See the crate root docs for the algorithm this implements.
pub struct Pma {
    inner: RwLock<Inner>,
    /// Serialises only the duplicate-check-and-write step of `insert`/
    /// `delete` against each other — *not* the rebalance that follows.
    /// Duplicate detection and the triggering write are not single-slot
    /// operations (a find across the whole array plus a shift), so the
    /// per-slot marker protocol alone cannot make two concurrent
    /// `insert(same_key)` calls mutually exclusive; this lock covers
    /// exactly that narrow window and nothing more. Once a mutator's
    /// write has landed, the `rebalance` (pack/spread) it triggers runs
    /// without holding `mutate`: pack/spread only ever relocate elements
    /// that are already uniquely present, coordinating purely through the
    /// per-slot marker protocol (§4.1), so two mutators' rebalances — or
    /// a rebalance racing a `find`/`get` — interleave safely without it.
    /// `find`/`get` never take this lock at all and stay fully concurrent
    /// with whichever mutator currently holds it, via the shared read
    /// lock on `inner` below.
    mutate: Mutex<()>,
}

struct Inner {
    slots: Box<[Slot]>,
    /// Element count. Lives inside the `RwLock`-guarded descriptor but is
    /// itself atomic: concurrent inserters hold only a *shared* read lock
    /// on `Inner` and must still coordinate their own increments.
    n: AtomicU64,
    m: u64,
    s: u32,
    num_segments: u64,
    h: u32,
    delta_t: f64,
    delta_p: f64,
}

impl Inner {
    fn rebalance(&self, i: i64) -> bool {
        rebalance::rebalance(&self.slots, i, self.s, self.h, self.delta_t, self.delta_p)
    }
}

/// What the `mutate`-locked phase of `insert` accomplished.
enum InsertStep {
    Duplicate,
    /// The write landed at this index; rebalancing still needs to run.
    Landed(i64),
    /// No empty slot in either direction; nothing was written.
    Full,
}

/// What the `mutate`-locked phase of `delete` accomplished.
enum DeleteStep {
    Absent,
    /// The slot was cleared at this index; rebalancing still needs to run.
    Cleared(i64),
}

impl Pma {
    /// Creates an empty array with the source's initial geometry:
    /// capacity 16, segment size 4.
    pub fn create() -> Self {
        let s = MAX_SPARSENESS as u32;
        let m = 1u64 << s;
        let (h, delta_t, delta_p) = level_geometry(m / s as u64);
        let slots = (0..m).map(|_| Slot::new()).collect::<Vec<_>>().into_boxed_slice();

        Pma {
            inner: RwLock::new(Inner {
                slots,
                n: AtomicU64::new(0),
                m,
                s,
                num_segments: m / s as u64,
                h,
                delta_t,
                delta_p,
            }),
            mutate: Mutex::new(()),
        }
    }

    /// Builds a new array from an already-sorted, duplicate-free sequence
    /// of `(key, val)` pairs. Panics if `sorted` is empty (spec.md §6:
    /// `n > 0` required).
    pub fn from_array(sorted: &[(u64, u64)]) -> Self {
        assert!(!sorted.is_empty(), "from_array requires a nonempty sequence");
        debug_assert!(
            sorted.windows(2).all(|w| w[0].0 < w[1].0),
            "from_array requires strictly ascending, duplicate-free keys"
        );
        debug_assert!(sorted.iter().all(|&(k, _)| k != 0), "key 0 is reserved as the empty sentinel");

        let n = sorted.len() as u64;
        let (s, num_segments, m) = compute_capacity(n).unwrap_or_else(|e| panic!("{e}"));
        let (h, delta_t, delta_p) = level_geometry(num_segments);

        let mut slots: Vec<Slot> = Vec::with_capacity(m as usize);
        for &(k, v) in sorted {
            slots.push(Slot::new_with(k, v));
        }
        slots.resize_with(m as usize, Slot::new);
        let slots = slots.into_boxed_slice();

        array::spread(&slots, 0, m as usize, n as usize);

        Pma {
            inner: RwLock::new(Inner {
                slots,
                n: AtomicU64::new(n),
                m,
                s,
                num_segments,
                h,
                delta_t,
                delta_p,
            }),
            mutate: Mutex::new(()),
        }
    }

    /// Looks up `key`. Returns `(true, index)` on a match, or
    /// `(false, predecessor_index)` on a miss (`-1` if there is no
    /// predecessor).
    pub fn find(&self, key: u64) -> (bool, i64) {
        assert!(key != 0, "key 0 is reserved as the empty sentinel");
        let guard = self.inner.read().unwrap();
        array::find(&guard.slots, key)
    }

    /// Inserts `key, val`. Returns `false` without changing any state if
    /// `key` is already present.
    pub fn insert(&self, key: u64, val: u64) -> bool {
        assert!(key != 0, "key 0 is reserved as the empty sentinel");
        loop {
            // Held across the whole iteration, not just the `mutate`
            // section below: `landed`/`index` are positions in *this*
            // `guard`'s array, so a resize must not swap the backing
            // storage out from under us before we get to rebalance.
            let guard = self.inner.read().unwrap();

            let step = {
                let _mutator = self.mutate.lock().unwrap();
                let (found, predecessor) = array::find(&guard.slots, key);
                if found {
                    InsertStep::Duplicate
                } else {
                    match array::insert_after(&guard.slots, predecessor, key, val) {
                        Some(landed) => {
                            guard.n.fetch_add(1, Ordering::AcqRel);
                            InsertStep::Landed(landed)
                        }
                        None => InsertStep::Full,
                    }
                }
            };

            match step {
                InsertStep::Duplicate => return false,
                InsertStep::Full => {
                    drop(guard);
                    self.resize();
                }
                InsertStep::Landed(landed) => {
                    let needs_resize = guard.rebalance(landed);
                    drop(guard);
                    if needs_resize {
                        self.resize();
                    }
                    return true;
                }
            }
        }
    }

    /// Deletes `key`. Returns `false` without changing any state if `key`
    /// is absent.
    pub fn delete(&self, key: u64) -> bool {
        assert!(key != 0, "key 0 is reserved as the empty sentinel");
        let guard = self.inner.read().unwrap();

        let step = {
            let _mutator = self.mutate.lock().unwrap();
            let (found, index) = array::find(&guard.slots, key);
            if !found {
                DeleteStep::Absent
            } else {
                guard.slots[index as usize].transition(Op::Clear, 0, 0);
                guard.n.fetch_sub(1, Ordering::AcqRel);
                DeleteStep::Cleared(index)
            }
        };

        match step {
            DeleteStep::Absent => false,
            DeleteStep::Cleared(index) => {
                let needs_resize = guard.rebalance(index);
                drop(guard);
                if needs_resize {
                    self.resize();
                }
                true
            }
        }
    }

    /// Positional access. Returns `None` if the slot at `i` is empty.
    /// Panics if `i` is out of bounds (spec.md §7: caller contract
    /// violation, fatal).
    pub fn get(&self, i: usize) -> Option<(u64, u64)> {
        let guard = self.inner.read().unwrap();
        assert!(i < guard.slots.len(), "index {i} out of bounds (capacity {})", guard.slots.len());
        let slot = &guard.slots[i];
        if slot.is_empty() {
            None
        } else {
            Some(slot.committed())
        }
    }

    /// Number of elements currently stored.
    pub fn count(&self) -> u64 {
        self.inner.read().unwrap().n.load(Ordering::Acquire)
    }

    /// Total capacity (always a power of two).
    pub fn capacity(&self) -> u64 {
        self.inner.read().unwrap().m
    }

    /// Packs the whole array, recomputes capacity for the current element
    /// count, reallocates, and spreads evenly. Takes the exclusive write
    /// lock: this is the single coordinator spec.md §9 calls for so that
    /// concurrent readers/writers never observe a half-rebuilt array.
    fn resize(&self) {
        let mut guard = self.inner.write().unwrap();
        let n = guard.n.load(Ordering::Acquire);
        let old_m = guard.slots.len();

        array::pack(&guard.slots, 0, old_m);

        let (s, num_segments, m) = compute_capacity(n).unwrap_or_else(|e| panic!("{e}"));
        let (h, delta_t, delta_p) = level_geometry(num_segments);

        let mut new_slots: Vec<Slot> = Vec::with_capacity(m as usize);
        for idx in 0..m {
            if idx < n {
                let (k, v) = guard.slots[idx as usize].committed();
                new_slots.push(Slot::new_with(k, v));
            } else {
                new_slots.push(Slot::new());
            }
        }
        let new_slots = new_slots.into_boxed_slice();
        array::spread(&new_slots, 0, m as usize, n as usize);

        guard.slots = new_slots;
        guard.m = m;
        guard.s = s;
        guard.num_segments = num_segments;
        guard.h = h;
        guard.delta_t = delta_t;
        guard.delta_p = delta_p;
    }
}

/// `h`, `delta_t`, `delta_p` for a descriptor with `num_segments` segments.
fn level_geometry(num_segments: u64) -> (u32, f64, f64) {
    let h = floor_lg(num_segments) + 1;
    let delta_t = (T0 - TH) / h as f64;
    let delta_p = (PH - P0) / h as f64;
    (h, delta_t, delta_p)
}

/// Computes `(s, num_segments, m)` for `n` elements, scaled by
/// `MAX_SPARSENESS` so the array always has room to grow before the next
/// resize (spec.md §4.7).
fn compute_capacity(n: u64) -> Result<(u32, u64, u64), CapacityExceeded> {
    let mut s = ceil_lg(n.max(2));
    let mut num_segments = hyperceil(ceil_div(n, s as u64));
    s = ceil_div(n, num_segments) as u32;
    let mut m = s as u64 * num_segments;

    m *= MAX_SPARSENESS;
    s *= MAX_SPARSENESS as u32;

    if m > MAX_SIZE {
        return Err(CapacityExceeded { attempted: m });
    }
    debug_assert!(m > n);
    Ok((s, num_segments, m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_has_source_initial_geometry() {
        let pma = Pma::create();
        assert_eq!(pma.capacity(), 16);
        assert_eq!(pma.count(), 0);
    }

    #[test]
    fn insert_find_roundtrip() {
        let pma = Pma::create();
        assert!(pma.insert(5, 50));
        assert!(pma.insert(3, 30));
        assert!(pma.insert(7, 70));
        assert_eq!(pma.count(), 3);

        let (found, idx) = pma.find(5);
        assert!(found);
        assert_eq!(pma.get(idx as usize), Some((5, 50)));

        let (found, idx) = pma.find(3);
        assert!(found);
        assert_eq!(pma.get(idx as usize), Some((3, 30)));
    }

    #[test]
    fn keys_stay_sorted_in_slot_order() {
        let pma = Pma::create();
        pma.insert(5, 50);
        pma.insert(3, 30);
        pma.insert(7, 70);

        let keys: Vec<u64> = (0..pma.capacity() as usize)
            .filter_map(|i| pma.get(i))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![3, 5, 7]);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let pma = Pma::create();
        assert!(pma.insert(1, 10));
        assert!(!pma.insert(1, 20));
        assert_eq!(pma.count(), 1);
        assert_eq!(pma.get(pma.find(1).1 as usize), Some((1, 10)));
    }

    #[test]
    fn delete_removes_key() {
        let pma = Pma::create();
        pma.insert(10, 100);
        pma.insert(20, 200);
        assert!(pma.delete(10));
        assert_eq!(pma.find(10).0, false);
        assert_eq!(pma.find(20), (true, pma.find(20).1));
        assert!(!pma.delete(10));
    }

    #[test]
    fn insert_past_initial_capacity_triggers_resize() {
        let pma = Pma::create();
        for key in 1..=30u64 {
            assert!(pma.insert(key, key * 10));
        }
        assert_eq!(pma.count(), 30);
        assert!(pma.capacity() >= 64);

        let keys: Vec<u64> = (0..pma.capacity() as usize)
            .filter_map(|i| pma.get(i))
            .map(|(k, _)| k)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 30);
    }

    #[test]
    fn from_array_spreads_across_capacity() {
        let pma = Pma::from_array(&[(1, 1), (2, 2), (3, 3)]);
        assert_eq!(pma.get(0), Some((1, 1)));
        assert_eq!(pma.get(pma.capacity() as usize - 1), None);
        assert_eq!(pma.count(), 3);
    }

    #[test]
    fn deletes_shrink_capacity_back_down_eventually() {
        let pma = Pma::create();
        for key in 1..=30u64 {
            pma.insert(key, key);
        }
        let grown_capacity = pma.capacity();
        for key in 1..=28u64 {
            pma.delete(key);
        }
        assert_eq!(pma.count(), 2);
        assert!(pma.capacity() <= grown_capacity);
    }

    #[test]
    #[should_panic(expected = "sentinel")]
    fn insert_zero_key_panics() {
        let pma = Pma::create();
        pma.insert(0, 1);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn get_out_of_bounds_panics() {
        let pma = Pma::create();
        let _ = pma.get(1000);
    }

    #[test]
    fn concurrent_disjoint_ranges_reach_full_count() {
        use std::sync::Arc;
        use std::thread;

        let pma = Arc::new(Pma::create());
        let a = Arc::clone(&pma);
        let b = Arc::clone(&pma);

        let t1 = thread::spawn(move || {
            for key in 1..1000u64 {
                assert!(a.insert(key, key));
            }
        });
        let t2 = thread::spawn(move || {
            for key in 1001..2000u64 {
                assert!(b.insert(key, key));
            }
        });
        t1.join().unwrap();
        t2.join().unwrap();

        // key 1000 itself was never inserted by either range.
        assert_eq!(pma.count(), 1998);

        let keys: Vec<u64> = (0..pma.capacity() as usize).filter_map(|i| pma.get(i)).map(|(k, _)| k).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 1998);
    }

    #[test]
    fn concurrent_duplicate_insert_exactly_one_wins() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        use std::thread;

        let pma = Arc::new(Pma::create());
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pma = Arc::clone(&pma);
            let wins = Arc::clone(&wins);
            handles.push(thread::spawn(move || {
                if pma.insert(42, 420) {
                    wins.fetch_add(1, Ordering::AcqRel);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::Acquire), 1);
        assert_eq!(pma.count(), 1);
        let (found, idx) = pma.find(42);
        assert!(found);
        assert_eq!(pma.get(idx as usize), Some((42, 420)));
    }

    /// Exhaustively explores scheduling interleavings (within the iteration
    /// budget) of disjoint-key concurrent inserts, mirroring
    /// `nblfq::tests::shuttle_test_mpmc`. Kept to a handful of keys per
    /// thread: shuttle's state-space search cost grows quickly with thread
    /// count and op count, unlike the larger plain-`std::thread` scenario
    /// above which samples one interleaving at much greater scale.
    #[test]
    fn shuttle_test_disjoint_inserts() {
        use std::sync::Arc;

        use shuttle::thread;

        shuttle::check_random(
            || {
                let pma = Arc::new(Pma::create());
                let a = Arc::clone(&pma);
                let b = Arc::clone(&pma);

                let t1 = thread::spawn(move || {
                    for key in 1..=3u64 {
                        assert!(a.insert(key, key));
                    }
                });
                let t2 = thread::spawn(move || {
                    for key in 101..=103u64 {
                        assert!(b.insert(key, key));
                    }
                });
                t1.join().unwrap();
                t2.join().unwrap();

                assert_eq!(pma.count(), 6);
                let keys: Vec<u64> =
                    (0..pma.capacity() as usize).filter_map(|i| pma.get(i)).map(|(k, _)| k).collect();
                let mut sorted = keys.clone();
                sorted.sort();
                assert_eq!(keys, sorted);
            },
            50,
        );
    }

    /// Exhaustively explores interleavings of two threads racing to insert
    /// the same key, checking exactly one wins (spec.md §8's "concurrent
    /// insert of the same key from two threads" property) across schedules
    /// a single sampled run could miss.
    #[test]
    fn shuttle_test_duplicate_insert_race() {
        use std::sync::Arc;

        use shuttle::sync::atomic::{AtomicUsize, Ordering as ShuttleOrdering};
        use shuttle::thread;

        shuttle::check_random(
            || {
                let pma = Arc::new(Pma::create());
                let wins = Arc::new(AtomicUsize::new(0));

                let mut handles = Vec::new();
                for _ in 0..3 {
                    let pma = Arc::clone(&pma);
                    let wins = Arc::clone(&wins);
                    handles.push(thread::spawn(move || {
                        if pma.insert(7, 70) {
                            wins.fetch_add(1, ShuttleOrdering::AcqRel);
                        }
                    }));
                }
                for h in handles {
                    h.join().unwrap();
                }

                assert_eq!(wins.load(ShuttleOrdering::Acquire), 1);
                assert_eq!(pma.count(), 1);
            },
            50,
        );
    }
}
