//! Per-cell atomic transition protocol (L1).
//!
//! Each [`Slot`] is a small lock-free state machine: `key`/`val`/`version`
//! are the *published* contents, and `marker` is the in-flight operation a
//! mutator claims before publishing a change. The marker's
//! `{operation, version}` pair is packed into one `AtomicU64` — that packed
//! word is the actual compare-and-swap target, and a successful CAS on it is
//! the linearisation point for the slot. The marker's carried payload
//! (`marker_key`, `marker_val` — what a stalled operation intends to write)
//! rides along in plain atomics staged *before* the marker CAS claims the
//! slot, so any thread that observes a non-quiescent marker already sees a
//! matching payload and can *help* by republishing it instead of waiting.
//!
//! See `SPEC_FULL.md` §3 for why this shape was chosen over a literal
//! wide-CAS translation of the source's `marker_t`.

use std::sync::atomic::{AtomicU64, Ordering};

/// A slot's in-flight operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum Op {
    /// Quiescent: no operation in flight.
    None = 0,
    /// A value is being written or moved in.
    Shift = 1,
    /// The slot is being emptied (pack/spread source side, or delete).
    Clear = 2,
}

impl Op {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => Op::None,
            1 => Op::Shift,
            2 => Op::Clear,
            other => unreachable!("invalid marker operation tag {other}"),
        }
    }
}

const OP_BITS: u32 = 2;

fn pack_marker(op: Op, version: u64) -> u64 {
    (version << OP_BITS) | op as u64
}

fn unpack_marker(bits: u64) -> (Op, u64) {
    (Op::from_bits(bits & 0b11), bits >> OP_BITS)
}

/// One element slot of the backing array.
pub(crate) struct Slot {
    key: AtomicU64,
    val: AtomicU64,
    /// Published version. Quiescent iff `version == marker`'s version.
    version: AtomicU64,
    /// Packed `(operation, version)` — the actual CAS target.
    marker: AtomicU64,
    /// Payload a claimed-but-not-yet-quiesced marker intends to publish.
    marker_key: AtomicU64,
    marker_val: AtomicU64,
}

impl Slot {
    /// A freshly created, quiescent, empty slot.
    pub(crate) fn new() -> Self {
        Self {
            key: AtomicU64::new(0),
            val: AtomicU64::new(0),
            version: AtomicU64::new(0),
            marker: AtomicU64::new(pack_marker(Op::None, 0)),
            marker_key: AtomicU64::new(0),
            marker_val: AtomicU64::new(0),
        }
    }

    /// A quiescent slot pre-populated with `key, val`. Only valid to use
    /// while no other thread can observe the slot yet (initial
    /// construction, or rebuilding behind the resize coordinator's
    /// exclusive lock) — it bypasses the marker protocol entirely.
    pub(crate) fn new_with(key: u64, val: u64) -> Self {
        Self {
            key: AtomicU64::new(key),
            val: AtomicU64::new(val),
            version: AtomicU64::new(0),
            marker: AtomicU64::new(pack_marker(Op::None, 0)),
            marker_key: AtomicU64::new(key),
            marker_val: AtomicU64::new(val),
        }
    }

    /// A slot is empty iff its published key is the sentinel `0`.
    pub(crate) fn is_empty(&self) -> bool {
        self.read().0 == 0
    }

    /// The published `(key, val)` pair, empty or not.
    pub(crate) fn committed(&self) -> (u64, u64) {
        self.read()
    }

    /// Reads `(key, val)`, honoring spec.md §4.1's observer contract: if a
    /// mutation is mid-flight (`version < marker.version`), help it to
    /// completion rather than trust `key`/`val` directly, and retry if the
    /// marker moves out from under the read. Without the retry, a reader
    /// could land between `publish`'s `key` store and its `val` store and
    /// return a torn pair — e.g. a newly-shifted-in key paired with the
    /// slot's previous val.
    fn read(&self) -> (u64, u64) {
        loop {
            let marker_bits = self.marker.load(Ordering::Acquire);
            let (marker_op, marker_version) = unpack_marker(marker_bits);
            let slot_version = self.version.load(Ordering::Acquire);

            if slot_version < marker_version {
                debug_assert_ne!(marker_op, Op::None);
                self.help(marker_version);
                continue;
            }

            let key = self.key.load(Ordering::Acquire);
            let val = self.val.load(Ordering::Acquire);

            // The marker was quiescent when we read it, but `key`/`val`
            // are two independent loads: if some other thread claimed and
            // published a whole new transition in between, re-check and
            // retry rather than return a pair straddling two versions.
            if self.marker.load(Ordering::Acquire) == marker_bits {
                return (key, val);
            }
        }
    }

    /// Transition the slot to publish `(key, val)` under operation `op`.
    ///
    /// Implements spec.md §4.1 steps 1-4: observe-and-help until quiescent,
    /// claim the marker via CAS, publish, then quiesce. Blocks only in the
    /// sense of retrying on a losing CAS — any retry is preceded by some
    /// other thread's CAS having succeeded, so the slot as a whole always
    /// makes progress.
    pub(crate) fn transition(&self, op: Op, key: u64, val: u64) {
        loop {
            let marker_bits = self.marker.load(Ordering::Acquire);
            let (marker_op, marker_version) = unpack_marker(marker_bits);
            let slot_version = self.version.load(Ordering::Acquire);

            if slot_version < marker_version {
                debug_assert_ne!(marker_op, Op::None);
                self.help(marker_version);
                continue;
            }

            debug_assert_eq!(marker_op, Op::None, "quiescent slot must carry Op::None");
            let claimed_version = marker_version + 1;

            // Stage the payload *before* claiming the marker. Any other
            // thread that observes the claim (a non-`None` marker at
            // `claimed_version`) must see a payload that already matches
            // it — staging after the CAS leaves a window where a helper
            // reads the *previous* operation's stale `marker_key`/
            // `marker_val` and republishes the wrong pair under the new
            // version.
            self.marker_key.store(key, Ordering::Release);
            self.marker_val.store(val, Ordering::Release);

            let new_marker_bits = pack_marker(op, claimed_version);
            if self
                .marker
                .compare_exchange(marker_bits, new_marker_bits, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            self.publish(key, val, claimed_version);
            return;
        }
    }

    /// Republish a stalled operation's intended payload. Idempotent: the
    /// marker's payload never changes between claim and quiesce, so
    /// applying it twice (original owner and a helper both racing to
    /// publish) leaves identical observable state.
    fn help(&self, marker_version: u64) {
        let key = self.marker_key.load(Ordering::Acquire);
        let val = self.marker_val.load(Ordering::Acquire);
        self.publish(key, val, marker_version);
    }

    /// Write `(key, val)` to the published fields and quiesce at `version`.
    fn publish(&self, key: u64, val: u64, version: u64) {
        self.key.store(key, Ordering::Release);
        self.val.store(val, Ordering::Release);
        self.marker.store(pack_marker(Op::None, version), Ordering::Release);
        self.version.store(version, Ordering::Release);
    }
}
