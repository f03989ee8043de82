//! The allocation state of a single value.
//!
//! A [Lifetime] records where a value is defined and used, the conservative interval over which
//! it is live, how many uses of it remain (overall and per region), and where it currently lives.
//! The allocator creates one per referenced [SymIdx] before its walk, mutates it throughout the
//! walk, and afterwards retains it only for debugging.

use crate::ir::{RegionIdx, RegionTree, SlotIdx, SymIdx};
use smallvec::SmallVec;
use std::fmt;

/// Where a lifetime is in the allocator's walk. A lifetime moves from `Unseen` to `Active` when
/// it starts and from `Active` to `Retired` when it ends; if it is evicted it becomes `Spilled`
/// for the rest of its life, though it may temporarily have a copy in a register
/// (`SecondChance`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LtState<R> {
    Unseen,
    /// The value's home is this register.
    Active(R),
    /// The value's home is its stack slot, but a copy is also in this register.
    SecondChance(R),
    /// The value's home is its stack slot (or, for a constant, nowhere: it is re-materialised
    /// on demand).
    Spilled,
    Retired,
}

/// The properties of a [Lifetime] that are orthogonal to its [LtState].
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LtFlag {
    /// The value is a constant: it can be re-materialised rather than reloaded.
    CheapSpill = 1 << 0,
    /// The value must live on the stack.
    DontAllocate = 1 << 1,
    /// The value is never used after being defined.
    DeadStore = 1 << 2,
    /// The value has been saved around at least one helper call.
    OpHelperSpilled = 1 << 3,
    /// The value was spilled while still being defined: later definitions must also store to its
    /// stack slot.
    NeedsStoreCompensation = 1 << 4,
    /// The value is live around at least one loop back edge, so it cannot be fully spilled inside
    /// that loop.
    CannotSpill = 1 << 5,
    IsFloat = 1 << 6,
    /// The value is defined by an instruction that writes a single byte.
    NeedsByteReg = 1 << 7,
}

/// A bitfield of [LtFlag]s.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct LtFlags(u8);

impl LtFlags {
    pub(crate) const fn new() -> Self {
        Self(0)
    }

    /// Return the current [LtFlags] extended with `flag`.
    pub(crate) const fn with(self, flag: LtFlag) -> Self {
        Self(self.0 | flag as u8)
    }

    pub(crate) fn set(&mut self, flag: LtFlag) {
        self.0 |= flag as u8;
    }

    pub(crate) const fn has(&self, flag: LtFlag) -> bool {
        self.0 & flag as u8 != 0
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Lifetime<R> {
    pub(crate) sym: SymIdx,
    /// The positions of instructions defining this value, in program order.
    pub(crate) defs: SmallVec<[usize; 2]>,
    /// The positions of instructions using this value, in program order.
    pub(crate) uses: SmallVec<[usize; 4]>,
    /// The first position at which this value is live.
    pub(crate) start: usize,
    /// The last position at which this value is live.
    pub(crate) end: usize,
    /// How many uses remain.
    use_count: u32,
    /// A staged decrement to `use_count` not yet committed by
    /// [Lifetime::apply_use_count_adjust].
    use_count_adjust: u32,
    /// How many uses remain in each region (including uses in nested regions). Allocated on first
    /// use: `None` means "nothing has ever been attributed to a region".
    region_use_counts: Option<Box<[u32]>>,
    pub(crate) live_across_calls: bool,
    pub(crate) live_across_user_calls: bool,
    pub(crate) slot: Option<SlotIdx>,
    pub(crate) state: LtState<R>,
    pub(crate) flags: LtFlags,
    /// If [LtFlag::CheapSpill] is set, the constant value.
    pub(crate) const_val: Option<i64>,
    /// The position at which this value was last brought into a register.
    pub(crate) last_alloc_start: Option<usize>,
}

impl<R: Copy> Lifetime<R> {
    pub(crate) fn new(sym: SymIdx) -> Self {
        Self {
            sym,
            defs: SmallVec::new(),
            uses: SmallVec::new(),
            start: usize::MAX,
            end: 0,
            use_count: 0,
            use_count_adjust: 0,
            region_use_counts: None,
            live_across_calls: false,
            live_across_user_calls: false,
            slot: None,
            state: LtState::Unseen,
            flags: LtFlags::new(),
            const_val: None,
            last_alloc_start: None,
        }
    }

    /// Is this lifetime live anywhere?
    pub(crate) fn is_live(&self) -> bool {
        self.start <= self.end
    }

    /// Extend this lifetime so that it includes `pos`.
    pub(crate) fn extend_to(&mut self, pos: usize) {
        self.start = self.start.min(pos);
        self.end = self.end.max(pos);
    }

    /// The register holding this value, if any.
    pub(crate) fn reg(&self) -> Option<R> {
        match self.state {
            LtState::Active(r) | LtState::SecondChance(r) => Some(r),
            LtState::Unseen | LtState::Spilled | LtState::Retired => None,
        }
    }

    pub(crate) fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Add `delta` uses. If `region` is `Some`, the uses are also attributed to that region and
    /// every region enclosing it.
    pub(crate) fn add_to_use_count(
        &mut self,
        delta: u32,
        region: Option<RegionIdx>,
        regions: &RegionTree,
    ) {
        let sym = self.sym;
        self.use_count = self
            .use_count
            .checked_add(delta)
            .unwrap_or_else(|| panic!("use count overflow for %{sym}"));
        if let Some(region) = region {
            let counts = self
                .region_use_counts
                .get_or_insert_with(|| vec![0; regions.len()].into_boxed_slice());
            for r in regions.ancestors(region) {
                let c = &mut counts[usize::from(r)];
                *c = c
                    .checked_add(delta)
                    .unwrap_or_else(|| panic!("region use count overflow for %{sym}"));
            }
        }
    }

    /// Remove `delta` uses, from `region` and every region enclosing it too if `region` is
    /// `Some`.
    ///
    /// # Panics
    ///
    /// If more uses are removed than were added.
    pub(crate) fn sub_from_use_count(
        &mut self,
        delta: u32,
        region: Option<RegionIdx>,
        regions: &RegionTree,
    ) {
        let sym = self.sym;
        self.use_count = self
            .use_count
            .checked_sub(delta)
            .unwrap_or_else(|| panic!("use count underflow for %{sym}"));
        if let Some(region) = region {
            if delta == 0 {
                return;
            }
            let counts = self
                .region_use_counts
                .as_mut()
                .unwrap_or_else(|| panic!("region use count underflow for %{sym}"));
            for r in regions.ancestors(region) {
                let c = &mut counts[usize::from(r)];
                *c = c
                    .checked_sub(delta)
                    .unwrap_or_else(|| panic!("region use count underflow for %{sym}"));
            }
        }
    }

    /// How many uses remain in `region`? If nothing has been attributed to regions, this is the
    /// overall use count.
    pub(crate) fn region_use_count(&self, region: RegionIdx) -> u32 {
        match &self.region_use_counts {
            Some(counts) => counts[usize::from(region)],
            None => self.use_count,
        }
    }

    /// Stage a decrement of `delta` uses, to be committed by [Self::apply_use_count_adjust].
    pub(crate) fn add_to_use_count_adjust(&mut self, delta: u32) {
        self.use_count_adjust += delta;
    }

    /// Commit the staged decrement: it is always subtracted from the overall count, but only from
    /// the region counts if `region` is `Some`.
    pub(crate) fn apply_use_count_adjust(&mut self, region: Option<RegionIdx>, regions: &RegionTree) {
        let delta = std::mem::take(&mut self.use_count_adjust);
        self.sub_from_use_count(delta, region, regions);
    }

    pub(crate) fn pending_use_count_adjust(&self) -> u32 {
        self.use_count_adjust
    }
}

impl<R: fmt::Display + Copy> fmt::Display for Lifetime<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}: [{}, {}]", self.sym, self.start, self.end)?;
        match self.state {
            LtState::Unseen => write!(f, " unseen")?,
            LtState::Active(r) => write!(f, " {r}")?,
            LtState::SecondChance(r) => write!(f, " {r} (second chance)")?,
            LtState::Spilled => write!(f, " spilled")?,
            LtState::Retired => write!(f, " retired")?,
        }
        if let Some(s) = self.slot {
            write!(f, " s{s}")?;
        }
        if self.live_across_user_calls {
            write!(f, " crosses-user-calls")?;
        } else if self.live_across_calls {
            write!(f, " crosses-calls")?;
        }
        Ok(())
    }
}
