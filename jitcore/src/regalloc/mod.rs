//! A linear scan register allocator.
//!
//! The allocator walks the instruction list once, forwards, maintaining for every value a
//! [Lifetime] whose [LtState] says where the value currently lives. At each instruction it:
//!
//!   1. retires lifetimes that ended before this instruction;
//!   2. makes sure every value the instruction reads is in a register, reloading (or
//!      re-materialising) values that have been spilled;
//!   3. frees the registers of values that die at this instruction;
//!   4. gives a home to every lifetime that starts at this instruction, evicting another lifetime
//!      if there is no free register;
//!   5. rewrites the instruction's operands to name registers, and emits it surrounded by whatever
//!      the above needed (reloads and saves before, stores and restores after).
//!
//! Lifetimes are single conservative intervals, so a value's home register never changes while
//! it is live: the only thing that happens to a home is that it is given up, once, when the value
//! is spilled. When that happens, a store is retroactively inserted after every definition of the
//! value seen so far, and every later definition writes through to the stack slot. Since a value
//! live around a loop back edge cannot be spilled inside the loop (it is "pinned"), every
//! instruction sees each value in the same place on every incoming path. The one exception is a
//! reloaded value kept in a register for later uses (a "second chance" copy): such copies are
//! forgotten at every label.
//!
//! Calls get special treatment: arguments are moved into the ABI's argument registers as a
//! parallel move; values in caller-saved registers that live across the call are spilled (for
//! calls to user code) or saved and restored around the call (for calls to helpers, or if the
//! value is pinned); and the location of every value named by a lazy bailout annotation is
//! recorded.

mod analyse;
#[cfg(any(debug_assertions, test))]
pub(crate) mod checker;
mod lifetime;
mod moves;

use crate::{
    arch::{RegClass, RegMask, RegSet, RegT},
    config::Config,
    errors::CompilationError,
    ir::{
        BailoutIdx, CallKind, Func, Inst, LoadKind, OpRole, Operand, RecoveryLoc, RegionIdx,
        SlotIdx, StoreKind, SymIdx,
    },
    log::stats::{Counter, Counters},
};
use analyse::{analyse, Analysis};
use lifetime::{Lifetime, LtFlag, LtState};
use moves::{sequentialise, RegMove};
use smallvec::SmallVec;
use std::mem;
use typed_index_collections::TiVec;

/// What, beyond the rewritten [Func], allocation produces.
#[derive(Debug)]
pub(crate) struct Allocation<R> {
    /// The callee-saved registers the allocated code writes to, in [RegT::regidx] order.
    pub(crate) callee_saved: Vec<R>,
    pub(crate) counters: Counters,
}

/// Allocate registers for `func`, which must be well-formed. On success `func`'s instructions
/// have been rewritten to use registers and the location of every value named by a bailout
/// annotation has been recorded.
pub(crate) fn allocate<R: RegT>(
    func: &mut Func<R>,
    regset: &RegSet<R>,
    cfg: &Config,
) -> Result<Allocation<R>, CompilationError> {
    let analysis = analyse(func, cfg)?;
    let mut ls = LinearScan::new(func, regset, cfg, analysis);
    ls.run()?;
    let Finished {
        insts,
        regions,
        num_slots,
        bailout_locs,
        alloc,
    } = ls.finish()?;
    func.set_allocated(insts, regions, num_slots);
    for (b, locs) in bailout_locs {
        func.bailout_mut(b).locs = locs;
    }
    Ok(alloc)
}

/// The eviction preference of a value: lower keys are evicted first. In order: second chance
/// copies, then constants, then everything else; then fewest remaining uses in the current
/// region; then shortest remaining extent; then least recently brought into a register.
type SpillKey = (u8, u32, usize, usize);

/// The allocator's state for the instruction currently being processed.
struct InstState<R> {
    pos: usize,
    region: RegionIdx,
    /// The values this instruction defines.
    defs: SmallVec<[SymIdx; 1]>,
    /// Registers holding values this instruction reads: they can't be handed to another value
    /// this instruction reads.
    use_locked: RegMask,
    /// The register each value this instruction reads is in.
    use_regs: SmallVec<[(SymIdx, R); 4]>,
    /// Registers saved before, and restored after, this instruction.
    saved: RegMask,
    before: Vec<Inst<R>>,
    after: Vec<Inst<R>>,
    restores: Vec<Inst<R>>,
}

impl<R> InstState<R> {
    fn new(pos: usize, region: RegionIdx) -> Self {
        Self {
            pos,
            region,
            defs: SmallVec::new(),
            use_locked: RegMask::new(),
            use_regs: SmallVec::new(),
            saved: RegMask::new(),
            before: Vec::new(),
            after: Vec::new(),
            restores: Vec::new(),
        }
    }
}

struct Finished<R> {
    insts: Vec<Inst<R>>,
    regions: Vec<RegionIdx>,
    num_slots: usize,
    bailout_locs: Vec<(BailoutIdx, Vec<RecoveryLoc<R>>)>,
    alloc: Allocation<R>,
}

struct LinearScan<'a, R: RegT> {
    func: &'a Func<R>,
    regset: &'a RegSet<R>,
    cfg: &'a Config,
    lts: TiVec<SymIdx, Lifetime<R>>,
    by_start: Vec<SymIdx>,
    /// The index in `by_start` of the first lifetime that starts after the last instruction
    /// processed.
    next_start: usize,
    backedges: Vec<(usize, usize)>,
    /// The value (home or second chance copy) in each register, indexed by [RegT::regidx].
    reg_owner: Vec<Option<SymIdx>>,
    /// Lifetimes that have started and not yet been retired.
    live: Vec<SymIdx>,
    out: Vec<Inst<R>>,
    out_regions: Vec<RegionIdx>,
    /// For each value: the index in `out` of every instruction that defined it into a register,
    /// and that register.
    def_outs: TiVec<SymIdx, SmallVec<[(usize, R); 2]>>,
    /// Spill stores to insert after the instruction at a given index in `out`.
    retro_stores: Vec<(usize, Inst<R>)>,
    num_slots: usize,
    callee_used: RegMask,
    bailout_locs: Vec<(BailoutIdx, Vec<RecoveryLoc<R>>)>,
    counters: Counters,
    cur: InstState<R>,
}

impl<'a, R: RegT> LinearScan<'a, R> {
    fn new(
        func: &'a Func<R>,
        regset: &'a RegSet<R>,
        cfg: &'a Config,
        analysis: Analysis<R>,
    ) -> Self {
        let Analysis {
            lts,
            by_start,
            backedges,
            ..
        } = analysis;
        let def_outs = TiVec::from(vec![SmallVec::new(); lts.len()]);
        Self {
            func,
            regset,
            cfg,
            lts,
            by_start,
            next_start: 0,
            backedges,
            reg_owner: vec![None; R::COUNT],
            live: Vec::new(),
            out: Vec::new(),
            out_regions: Vec::new(),
            def_outs,
            retro_stores: Vec::new(),
            num_slots: 0,
            callee_used: RegMask::new(),
            bailout_locs: Vec::new(),
            counters: Counters::new(),
            cur: InstState::new(0, RegionIdx::root()),
        }
    }

    fn run(&mut self) -> Result<(), CompilationError> {
        let func = self.func;
        self.out.try_reserve(func.insts().len())?;
        self.out_regions.try_reserve(func.insts().len())?;
        for (pos, inst) in func.insts().iter().enumerate() {
            let region = func.inst_region(pos);
            self.cur = InstState::new(pos, region);
            inst.for_each_def(|s| self.cur.defs.push(s));
            inst.for_each_use(|s| self.lts[s].add_to_use_count_adjust(1));
            self.expire(pos);
            if let Inst::Label(_) = inst {
                self.drop_copies();
            }
            // Lifetimes which are live here before being defined (e.g. parameters).
            self.start_lifetimes(false, None)?;
            match inst {
                Inst::Param { dst, .. } => self.param(inst, dst.sym())?,
                Inst::Call {
                    kind,
                    addr,
                    args,
                    ret,
                    bailout,
                } => self.call(*kind, *addr, args, ret.map(|x| x.sym()), *bailout)?,
                Inst::Ret(Some(x)) => self.ret(x.sym())?,
                _ => self.generic(inst)?,
            }
            let region = self.cfg.region_use_counts.then_some(region);
            inst.for_each_use(|s| self.lts[s].apply_use_count_adjust(region, func.regions()));
            while let Some(s) = self.by_start.get(self.next_start) {
                if self.lts[*s].start > pos {
                    break;
                }
                self.next_start += 1;
            }
        }
        debug_assert!(self
            .lts
            .iter()
            .all(|lt| lt.use_count() == 0 && lt.pending_use_count_adjust() == 0));
        Ok(())
    }

    /// Splice the retroactive stores into the output.
    fn finish(mut self) -> Result<Finished<R>, CompilationError> {
        // The sort is stable, so stores after the same instruction stay in the order they were
        // created in.
        self.retro_stores.sort_by_key(|(i, _)| *i);
        let n = self.out.len() + self.retro_stores.len();
        let mut insts = Vec::new();
        insts.try_reserve_exact(n)?;
        let mut regions = Vec::new();
        regions.try_reserve_exact(n)?;
        let mut retro = self.retro_stores.into_iter().peekable();
        for (i, (inst, region)) in self.out.into_iter().zip(self.out_regions).enumerate() {
            insts.push(inst);
            regions.push(region);
            while let Some((_, st)) = retro.next_if(|(j, _)| *j == i) {
                insts.push(st);
                regions.push(region);
            }
        }
        Ok(Finished {
            insts,
            regions,
            num_slots: self.num_slots,
            bailout_locs: self.bailout_locs,
            alloc: Allocation {
                callee_saved: self.callee_used.iter().collect(),
                counters: self.counters,
            },
        })
    }

    fn class(&self, s: SymIdx) -> RegClass {
        self.func.sym(s).ty.class()
    }

    /// Retire every lifetime that ended before `pos`.
    fn expire(&mut self, pos: usize) {
        let Self {
            live,
            lts,
            reg_owner,
            ..
        } = self;
        live.retain(|s| {
            let lt = &mut lts[*s];
            if lt.end >= pos && lt.state != LtState::Retired {
                return true;
            }
            if let Some(r) = lt.reg() {
                reg_owner[r.regidx()] = None;
            }
            lt.state = LtState::Retired;
            false
        });
    }

    /// Forget every second chance copy: used at labels, where we can't know which copies are
    /// present on every incoming path.
    fn drop_copies(&mut self) {
        for i in 0..R::COUNT {
            if let Some(s) = self.reg_owner[i] {
                if let LtState::SecondChance(r) = self.lts[s].state {
                    self.drop_copy(r);
                }
            }
        }
    }

    fn drop_copy(&mut self, r: R) {
        if let Some(s) = self.reg_owner[r.regidx()].take() {
            debug_assert_eq!(self.lts[s].state, LtState::SecondChance(r));
            self.lts[s].state = LtState::Spilled;
        }
    }

    fn note_reg(&mut self, r: R) {
        if !r.is_caller_saved() {
            self.callee_used.set(r);
        }
    }

    fn assign(&mut self, s: SymIdx, r: R) {
        debug_assert!(self.reg_owner[r.regidx()].is_none());
        self.reg_owner[r.regidx()] = Some(s);
        let lt = &mut self.lts[s];
        lt.state = LtState::Active(r);
        lt.last_alloc_start = Some(self.cur.pos);
        self.note_reg(r);
    }

    /// Return `s`'s stack slot, allocating one if necessary.
    fn slot_for(&mut self, s: SymIdx) -> Result<SlotIdx, CompilationError> {
        if let Some(slot) = self.lts[s].slot {
            return Ok(slot);
        }
        let slot = SlotIdx::new(self.num_slots)?;
        self.num_slots += 1;
        self.lts[s].slot = Some(slot);
        Ok(slot)
    }

    /// Is `s` live around a back edge of a loop that the current instruction is in? If so, it
    /// can't be spilled here: the loop header has already been emitted expecting `s` in its
    /// register.
    fn is_pinned(&self, s: SymIdx) -> bool {
        let lt = &self.lts[s];
        let pos = self.cur.pos;
        lt.flags.has(LtFlag::CannotSpill)
            && self
                .backedges
                .iter()
                .any(|(l, q)| lt.start <= *l && *l < pos && pos <= *q && *q <= lt.end)
    }

    /// `s`'s eviction preference, or `None` if it can't be evicted.
    fn spill_key(&self, s: SymIdx) -> Option<SpillKey> {
        let lt = &self.lts[s];
        let pos = self.cur.pos;
        let tier = match lt.state {
            LtState::SecondChance(_) => 0,
            _ if self.is_pinned(s) => return None,
            _ if lt.flags.has(LtFlag::CheapSpill) => 1,
            _ => 2,
        };
        Some((
            tier,
            lt.region_use_count(self.cur.region),
            lt.end.saturating_sub(pos),
            lt.last_alloc_start.unwrap_or(pos),
        ))
    }

    /// Find a free register of class `class`, not in `exclude`. If `prefer_callee` callee-saved
    /// registers are tried first, otherwise caller-saved registers are.
    fn free_reg(
        &self,
        class: RegClass,
        need_byte: bool,
        prefer_callee: bool,
        exclude: RegMask,
    ) -> Option<R> {
        let ok = |r: &R| {
            self.reg_owner[r.regidx()].is_none()
                && !exclude.is_set(*r)
                && (!need_byte || r.is_byte_addressable())
        };
        self.regset
            .alloc_order(class)
            .filter(|r| r.is_caller_saved() != prefer_callee)
            .find(ok)
            .or_else(|| self.regset.alloc_order(class).find(ok))
    }

    fn pick_victim(&self, class: RegClass, need_byte: bool, exclude: RegMask) -> Option<(R, SpillKey)> {
        self.regset
            .alloc_order(class)
            .filter(|r| !exclude.is_set(*r) && (!need_byte || r.is_byte_addressable()))
            .filter_map(|r| {
                let s = self.reg_owner[r.regidx()]?;
                self.spill_key(s).map(|k| (r, k))
            })
            .min_by_key(|(r, k)| (*k, r.regidx()))
    }

    /// Move `s` out of its register for the rest of its life.
    fn spill(&mut self, s: SymIdx) -> Result<(), CompilationError> {
        let state = self.lts[s].state;
        let r = match state {
            LtState::SecondChance(r) => {
                self.drop_copy(r);
                return Ok(());
            }
            LtState::Active(r) => r,
            x => {
                return Err(CompilationError::InternalError(format!(
                    "can't spill %{s} in state {x:?}"
                )))
            }
        };
        self.reg_owner[r.regidx()] = None;
        self.lts[s].state = LtState::Spilled;
        if !self.lts[s].flags.has(LtFlag::CheapSpill) {
            let slot = self.slot_for(s)?;
            for (i, src) in &self.def_outs[s] {
                self.retro_stores.push((
                    *i,
                    Inst::Store {
                        kind: StoreKind::Spill,
                        sym: s,
                        src: *src,
                        slot,
                    },
                ));
            }
            self.lts[s].flags.set(LtFlag::NeedsStoreCompensation);
        }
        self.counters.inc(Counter::Spill);
        Ok(())
    }

    /// Preserve the value in `r` around the current instruction, freeing `r` for the instruction
    /// to use as a temporary.
    fn save_around(&mut self, r: R) -> Result<(), CompilationError> {
        let s = self.reg_owner[r.regidx()].ok_or_else(|| {
            CompilationError::InternalError(format!("can't save unoccupied register {r}"))
        })?;
        let slot = self.slot_for(s)?;
        self.cur.before.push(Inst::Store {
            kind: StoreKind::Save,
            sym: s,
            src: r,
            slot,
        });
        self.cur.restores.push(Inst::Load {
            kind: LoadKind::Restore,
            sym: s,
            slot,
            dst: r,
        });
        self.cur.saved.set(r);
        self.counters.inc(Counter::Save);
        Ok(())
    }

    /// Get a register of class `class` for use by the current instruction only. If `for_def` the
    /// register will only be written, so it may be one that the instruction also reads or saves;
    /// otherwise `need_byte` is only a preference. Returns the register and whether it's now
    /// unoccupied, in which case the value put in it can stay there after the instruction.
    fn get_reg(
        &mut self,
        class: RegClass,
        need_byte: bool,
        prefer_callee: bool,
        for_def: bool,
        allow_save: bool,
    ) -> Result<(R, bool), CompilationError> {
        let saved = self.cur.saved;
        let exclude = if for_def {
            saved
        } else {
            saved.union(self.cur.use_locked)
        };
        let free = self
            .free_reg(class, need_byte, prefer_callee, exclude)
            .or_else(|| {
                (!for_def)
                    .then(|| self.free_reg(class, false, prefer_callee, exclude))
                    .flatten()
            });
        if let Some(r) = free {
            self.note_reg(r);
            return Ok((r, true));
        }
        let need_byte = need_byte && for_def;
        let byte_ok = |r: &R| !need_byte || r.is_byte_addressable();
        if for_def {
            // A saved register is free until its restore, which comes after the def's store.
            if let Some(r) = self
                .regset
                .alloc_order(class)
                .find(|r| saved.is_set(*r) && byte_ok(r))
            {
                return Ok((r, false));
            }
        } else {
            // The register of a value this instruction overwrites without reading.
            let borrowed = self
                .cur
                .defs
                .iter()
                .filter_map(|d| self.lts[*d].reg())
                .find(|r| r.class() == class && !exclude.is_set(*r));
            if let Some(r) = borrowed {
                return Ok((r, false));
            }
        }
        if let Some((r, _)) = self.pick_victim(class, need_byte, exclude) {
            self.spill(self.reg_owner[r.regidx()].unwrap_or_else(|| unreachable!()))?;
            self.note_reg(r);
            return Ok((r, true));
        }
        if allow_save {
            // Everything left is pinned.
            let cand = self.regset.alloc_order(class).find(|r| {
                !exclude.is_set(*r)
                    && byte_ok(r)
                    && matches!(self.reg_owner[r.regidx()], Some(s) if !self.cur.defs.contains(&s))
            });
            if let Some(r) = cand {
                self.save_around(r)?;
                self.note_reg(r);
                return Ok((r, false));
            }
        } else if !for_def {
            // Nothing after a terminator can restore a saved register, but the scratch register
            // is never allocated.
            let scratch = self.regset.scratch(class);
            if !self.cur.use_locked.is_set(scratch) {
                return Ok((scratch, false));
            }
        }
        Err(CompilationError::InternalError(format!(
            "{}: no {class} register available at instruction {}",
            self.func.name, self.cur.pos
        )))
    }

    /// Queue the instructions which put the spilled value `s` into `r`.
    fn fetch(&mut self, s: SymIdx, r: R) -> Result<(), CompilationError> {
        let lt = &self.lts[s];
        let remat = lt.const_val.filter(|_| lt.flags.has(LtFlag::CheapSpill));
        match (remat, lt.slot) {
            (Some(val), _) => {
                self.cur.before.push(Inst::Remat { sym: s, dst: r, val });
                self.counters.inc(Counter::Remat);
            }
            (None, Some(slot)) => {
                self.cur.before.push(Inst::Load {
                    kind: LoadKind::Reload,
                    sym: s,
                    slot,
                    dst: r,
                });
                self.counters.inc(Counter::Reload);
            }
            (None, None) => {
                return Err(CompilationError::InternalError(format!(
                    "%{s} has neither a register nor a stack slot at instruction {}",
                    self.cur.pos
                )))
            }
        }
        Ok(())
    }

    fn lock_use(&mut self, s: SymIdx, r: R) {
        self.cur.use_locked.set(r);
        self.cur.use_regs.push((s, r));
    }

    /// Make sure every value in `uses`, all read by the current instruction, is in a register.
    /// Values already in registers are locked first, so fetching the others can't displace them.
    fn use_regs(&mut self, uses: &[SymIdx], allow_save: bool) -> Result<(), CompilationError> {
        for s in uses {
            if self.cur.use_regs.iter().any(|(x, _)| x == s) {
                continue;
            }
            if let Some(r) = self.lts[*s].reg() {
                self.lock_use(*s, r);
            }
        }
        for s in uses {
            self.use_reg(*s, allow_save)?;
        }
        Ok(())
    }

    /// Make sure the value `s`, read by the current instruction, is in a register.
    fn use_reg(&mut self, s: SymIdx, allow_save: bool) -> Result<R, CompilationError> {
        if let Some((_, r)) = self.cur.use_regs.iter().find(|(x, _)| *x == s) {
            return Ok(*r);
        }
        let pos = self.cur.pos;
        let state = self.lts[s].state;
        let r = match state {
            LtState::Active(r) | LtState::SecondChance(r) => r,
            LtState::Spilled => {
                let lt = &self.lts[s];
                let keep = self.cfg.second_chance
                    && !lt.flags.has(LtFlag::DontAllocate)
                    && lt.end > pos;
                let need_byte = lt.flags.has(LtFlag::NeedsByteReg);
                let prefer_callee = keep && lt.live_across_calls;
                let class = self.class(s);
                let (r, free) =
                    self.get_reg(class, keep && need_byte, prefer_callee, false, allow_save)?;
                self.fetch(s, r)?;
                // A saved or borrowed register goes back to its owner after this instruction.
                if keep && free && (!need_byte || r.is_byte_addressable()) {
                    self.reg_owner[r.regidx()] = Some(s);
                    self.lts[s].state = LtState::SecondChance(r);
                    self.counters.inc(Counter::SecondChance);
                }
                self.lts[s].last_alloc_start = Some(pos);
                r
            }
            LtState::Unseen | LtState::Retired => {
                return Err(CompilationError::InternalError(format!(
                    "%{s} is not live at instruction {pos}"
                )))
            }
        };
        self.lock_use(s, r);
        Ok(r)
    }

    /// Free the registers of values read by the current instruction which are not needed
    /// afterwards.
    fn free_dying(&mut self, uses: &[SymIdx]) {
        for s in uses {
            let lt = &mut self.lts[*s];
            if lt.end > self.cur.pos || self.cur.defs.contains(s) || lt.state == LtState::Retired {
                continue;
            }
            if let Some(r) = lt.reg() {
                self.reg_owner[r.regidx()] = None;
            }
            lt.state = LtState::Retired;
        }
    }

    /// Give a home to every not-yet-seen lifetime starting at the current instruction that is
    /// (if `defined`) or isn't (if `!defined`) defined by it.
    fn start_lifetimes(&mut self, defined: bool, prefer: Option<R>) -> Result<(), CompilationError> {
        let pos = self.cur.pos;
        let starting = self.by_start[self.next_start..]
            .iter()
            .take_while(|s| self.lts[**s].start == pos)
            .filter(|s| {
                self.lts[**s].state == LtState::Unseen && self.cur.defs.contains(s) == defined
            })
            .copied()
            .collect::<SmallVec<[SymIdx; 4]>>();
        for s in starting {
            self.alloc_home(s, prefer)?;
        }
        Ok(())
    }

    fn alloc_home(&mut self, s: SymIdx, prefer: Option<R>) -> Result<(), CompilationError> {
        let func = self.func;
        self.live.push(s);
        let lt = &self.lts[s];
        let class = self.class(s);

        if let Some(Inst::Param { idx, .. }) = lt.defs.first().map(|d| &func.insts()[*d]) {
            let arg = *self
                .regset
                .args(class)
                .get(usize::from(*idx))
                .ok_or_else(|| {
                    CompilationError::LimitExceeded(format!(
                        "{}: {class} param {idx} is not passed in a register",
                        func.name
                    ))
                })?;
            if self.reg_owner[arg.regidx()].is_some() {
                return Err(CompilationError::InternalError(format!(
                    "%{s}: argument register {arg} already in use"
                )));
            }
            self.assign(s, arg);
            return Ok(());
        }

        if lt.flags.has(LtFlag::DontAllocate) {
            self.lts[s].state = LtState::Spilled;
            self.slot_for(s)?;
            return Ok(());
        }

        let need_byte = lt.flags.has(LtFlag::NeedsByteReg);
        let prefer_callee = lt.live_across_calls;
        if let Some(r) = prefer {
            if !prefer_callee
                && self.reg_owner[r.regidx()].is_none()
                && !self.cur.saved.is_set(r)
                && (!need_byte || r.is_byte_addressable())
            {
                self.assign(s, r);
                return Ok(());
            }
        }
        if let Some(r) = self.free_reg(class, need_byte, prefer_callee, self.cur.saved) {
            self.assign(s, r);
            return Ok(());
        }
        let victim = self.pick_victim(
            class,
            need_byte,
            self.cur.saved.union(self.cur.use_locked),
        );
        match (victim, self.spill_key(s)) {
            (Some((r, theirs)), Some(ours)) if theirs <= ours => {
                self.spill(self.reg_owner[r.regidx()].unwrap_or_else(|| unreachable!()))?;
                self.assign(s, r);
            }
            _ => {
                // Either nothing can be evicted, or `s` is itself the best candidate for
                // eviction: it goes straight to the stack.
                if !self.lts[s].flags.has(LtFlag::CheapSpill) {
                    self.slot_for(s)?;
                }
                let lt = &mut self.lts[s];
                lt.state = LtState::Spilled;
                lt.flags.set(LtFlag::NeedsStoreCompensation);
                self.counters.inc(Counter::ImmediateSpill);
            }
        }
        Ok(())
    }

    /// Return the register the current instruction should write `s` to, queueing a write-through
    /// store if `s` has been spilled. Returns `None` if the instruction can be omitted entirely.
    fn def_reg(&mut self, s: SymIdx, inst: &Inst<R>) -> Result<Option<R>, CompilationError> {
        let lt = &self.lts[s];
        let cheap = lt.flags.has(LtFlag::CheapSpill);
        let state = lt.state;
        match state {
            LtState::Active(r) => Ok(Some(r)),
            LtState::SecondChance(r) => {
                if !cheap {
                    let slot = self.slot_for(s)?;
                    self.cur.after.push(Inst::Store {
                        kind: StoreKind::Spill,
                        sym: s,
                        src: r,
                        slot,
                    });
                }
                Ok(Some(r))
            }
            LtState::Spilled => {
                if cheap && matches!(inst, Inst::Const { .. }) {
                    // Every use will re-materialise the constant.
                    return Ok(None);
                }
                let need_byte = lt.flags.has(LtFlag::NeedsByteReg);
                let (r, _) = self.get_reg(self.class(s), need_byte, false, true, true)?;
                let slot = self.slot_for(s)?;
                self.cur.after.push(Inst::Store {
                    kind: StoreKind::Spill,
                    sym: s,
                    src: r,
                    slot,
                });
                Ok(Some(r))
            }
            LtState::Unseen | LtState::Retired => Err(CompilationError::InternalError(format!(
                "%{s} is not live at its definition at instruction {}",
                self.cur.pos
            ))),
        }
    }

    /// Return a copy of `inst` with its uses in the registers recorded by [Self::use_reg] and its
    /// def in `def`.
    fn rewrite(&self, inst: &Inst<R>, def: Option<R>) -> Result<Inst<R>, CompilationError> {
        let mut new = inst.clone();
        let mut missing = None;
        new.for_each_operand_mut(|op, role| {
            let s = op.sym();
            let r = match role {
                OpRole::Use => self
                    .cur
                    .use_regs
                    .iter()
                    .find(|(x, _)| *x == s)
                    .map(|(_, r)| *r),
                OpRole::Def => def,
            };
            match r {
                Some(r) => *op = Operand::Reg(s, r),
                None => missing = Some(s),
            }
        });
        match missing {
            Some(s) => Err(CompilationError::InternalError(format!(
                "%{s} has no register at instruction {}",
                self.cur.pos
            ))),
            None => Ok(new),
        }
    }

    /// Emit the current instruction (if any) along with everything queued before and after it,
    /// returning the index in `out` of the instruction.
    fn flush(&mut self, inst: Option<Inst<R>>) -> Option<usize> {
        let region = self.cur.region;
        let mut push = |x| {
            self.out.push(x);
            self.out_regions.push(region);
            self.out.len() - 1
        };
        for x in mem::take(&mut self.cur.before) {
            push(x);
        }
        let idx = inst.map(&mut push);
        for x in mem::take(&mut self.cur.after)
            .into_iter()
            .chain(mem::take(&mut self.cur.restores))
        {
            push(x);
        }
        idx
    }

    /// Record that the instruction at `idx` in `out` defined `s` into `r`, if `r` is `s`'s home.
    fn note_def(&mut self, s: SymIdx, idx: usize, r: R) {
        if self.lts[s].state == LtState::Active(r) {
            self.def_outs[s].push((idx, r));
        }
    }

    fn generic(&mut self, inst: &Inst<R>) -> Result<(), CompilationError> {
        // A restore after a terminator would never execute.
        let allow_save = !inst.is_terminator();
        let mut uses = SmallVec::<[SymIdx; 3]>::new();
        inst.for_each_use(|s| uses.push(s));
        self.use_regs(&uses, allow_save)?;
        self.free_dying(&uses);
        self.start_lifetimes(true, None)?;

        let mut def = None;
        for s in self.cur.defs.clone() {
            match self.def_reg(s, inst)? {
                Some(r) => def = Some((s, r)),
                None => {
                    self.flush(None);
                    return Ok(());
                }
            }
        }
        let new = self.rewrite(inst, def.map(|(_, r)| r))?;
        let idx = self.flush(Some(new));
        if let (Some((s, r)), Some(idx)) = (def, idx) {
            self.note_def(s, idx, r);
        }
        Ok(())
    }

    fn param(&mut self, inst: &Inst<R>, s: SymIdx) -> Result<(), CompilationError> {
        self.start_lifetimes(true, None)?;
        let arg = match self.lts[s].state {
            LtState::Active(r) => r,
            x => {
                return Err(CompilationError::InternalError(format!(
                    "param %{s} in state {x:?}"
                )))
            }
        };
        let new = self.rewrite(inst, Some(arg))?;
        let lt = &self.lts[s];
        if lt.flags.has(LtFlag::DontAllocate) {
            let slot = self.slot_for(s)?;
            self.cur.after.push(Inst::Store {
                kind: StoreKind::Spill,
                sym: s,
                src: arg,
                slot,
            });
            self.reg_owner[arg.regidx()] = None;
            self.lts[s].state = LtState::Spilled;
        } else if lt.live_across_calls {
            // Argument registers are all caller-saved: move the value somewhere that survives
            // calls if we can.
            let need_byte = lt.flags.has(LtFlag::NeedsByteReg);
            let callee = self
                .regset
                .alloc_order(self.class(s))
                .find(|r| {
                    !r.is_caller_saved()
                        && self.reg_owner[r.regidx()].is_none()
                        && (!need_byte || r.is_byte_addressable())
                });
            if let Some(cs) = callee {
                self.cur.after.push(Inst::Copy {
                    sym: s,
                    src: arg,
                    dst: cs,
                });
                self.counters.inc(Counter::Copy);
                self.reg_owner[arg.regidx()] = None;
                self.assign(s, cs);
                // The value is in the argument register immediately after the param instruction.
                if let Some(idx) = self.flush(Some(new)) {
                    self.def_outs[s].push((idx, arg));
                }
                return Ok(());
            }
        }
        if let Some(idx) = self.flush(Some(new)) {
            self.note_def(s, idx, arg);
        }
        Ok(())
    }

    fn ret(&mut self, s: SymIdx) -> Result<(), CompilationError> {
        let ret_reg = self.regset.ret(self.class(s));
        match self.lts[s].state {
            LtState::Active(r) | LtState::SecondChance(r) => {
                if r != ret_reg {
                    self.cur.before.push(Inst::Copy {
                        sym: s,
                        src: r,
                        dst: ret_reg,
                    });
                    self.counters.inc(Counter::Copy);
                }
            }
            // Nothing is live after a return, so the return register is free.
            LtState::Spilled => self.fetch(s, ret_reg)?,
            LtState::Unseen | LtState::Retired => {
                return Err(CompilationError::InternalError(format!(
                    "%{s} is not live at instruction {}",
                    self.cur.pos
                )))
            }
        }
        self.flush(Some(Inst::Ret(Some(Operand::Reg(s, ret_reg)))));
        Ok(())
    }

    /// Where can `s` be found at the return address of the current call?
    fn recovery_loc(&self, s: SymIdx) -> Result<RecoveryLoc<R>, CompilationError> {
        let lt = &self.lts[s];
        let no_loc = || {
            CompilationError::InternalError(format!(
                "%{s} has no location at bailout at instruction {}",
                self.cur.pos
            ))
        };
        match lt.state {
            LtState::Active(r) | LtState::SecondChance(r) if self.cur.saved.is_set(r) => {
                lt.slot.map(RecoveryLoc::Stack).ok_or_else(no_loc)
            }
            LtState::Active(r) | LtState::SecondChance(r) if !r.is_caller_saved() => {
                Ok(RecoveryLoc::Reg(r))
            }
            LtState::Spilled | LtState::SecondChance(_) if lt.flags.has(LtFlag::CheapSpill) => {
                lt.const_val.map(RecoveryLoc::Const).ok_or_else(no_loc)
            }
            LtState::Spilled | LtState::SecondChance(_) => {
                lt.slot.map(RecoveryLoc::Stack).ok_or_else(no_loc)
            }
            LtState::Active(_) | LtState::Unseen | LtState::Retired => Err(no_loc()),
        }
    }

    fn call(
        &mut self,
        kind: CallKind,
        addr: u64,
        args: &[Operand<R>],
        ret: Option<SymIdx>,
        bailout: Option<BailoutIdx>,
    ) -> Result<(), CompilationError> {
        let pos = self.cur.pos;
        let func = self.func;
        let regset = self.regset;

        // Get every argument into a register, and work out which argument register it needs to
        // end up in.
        let arg_syms = args.iter().map(|a| a.sym()).collect::<SmallVec<[_; 4]>>();
        self.use_regs(&arg_syms, true)?;
        let mut moves = SmallVec::<[RegMove<R>; 4]>::new();
        let mut nargs = [0usize; 2];
        for a in args {
            let s = a.sym();
            let src = self.use_reg(s, true)?;
            let class = src.class();
            let n = &mut nargs[usize::from(class == RegClass::Float)];
            let dst = *regset.args(class).get(*n).ok_or_else(|| {
                CompilationError::LimitExceeded(format!(
                    "{}: call at instruction {pos} has more than {} {class} arguments",
                    func.name,
                    regset.args(class).len()
                ))
            })?;
            *n += 1;
            moves.push(RegMove { sym: s, src, dst });
        }

        // Get values that outlive the call out of caller-saved registers. This must happen before
        // the argument moves, which may overwrite those registers.
        for i in 0..R::COUNT {
            let r = R::from_regidx(i);
            if !r.is_caller_saved() || self.cur.saved.is_set(r) {
                continue;
            }
            let Some(s) = self.reg_owner[i] else { continue };
            if self.lts[s].end <= pos || Some(s) == ret {
                continue;
            }
            let state = self.lts[s].state;
            match state {
                LtState::SecondChance(_) => self.drop_copy(r),
                _ if kind == CallKind::Helper || self.is_pinned(s) => {
                    self.save_around(r)?;
                    if kind == CallKind::Helper {
                        self.lts[s].flags.set(LtFlag::OpHelperSpilled);
                    }
                }
                _ => self.spill(s)?,
            }
        }

        for m in sequentialise(&moves, |c| regset.scratch(c)) {
            self.cur.before.push(Inst::Copy {
                sym: m.sym,
                src: m.src,
                dst: m.dst,
            });
            self.counters.inc(Counter::Copy);
        }

        // The call clobbers every caller-saved register not being saved around it: anything left
        // in them dies here.
        for i in 0..R::COUNT {
            let r = R::from_regidx(i);
            if !r.is_caller_saved() || self.cur.saved.is_set(r) {
                continue;
            }
            if let Some(s) = self.reg_owner[i] {
                if Some(s) != ret {
                    debug_assert!(self.lts[s].end <= pos);
                    self.reg_owner[i] = None;
                    self.lts[s].state = LtState::Retired;
                }
            }
        }
        self.free_dying(&arg_syms);

        if let Some(b) = bailout {
            let live = &func.bailout(b).live;
            let mut locs = Vec::with_capacity(live.len());
            for s in live {
                locs.push(self.recovery_loc(*s)?);
            }
            self.bailout_locs.push((b, locs));
        }

        // The return value.
        self.cur.use_locked = RegMask::new();
        let mut ret_op = None;
        if let Some(s) = ret {
            let ret_reg = regset.ret(self.class(s));
            self.start_lifetimes(true, Some(ret_reg))?;
            if let LtState::SecondChance(r) = self.lts[s].state {
                self.drop_copy(r);
            }
            match self.lts[s].state {
                LtState::Active(h) => {
                    if h != ret_reg {
                        self.cur.after.push(Inst::Copy {
                            sym: s,
                            src: ret_reg,
                            dst: h,
                        });
                        self.counters.inc(Counter::Copy);
                    }
                }
                LtState::Spilled => {
                    let slot = self.slot_for(s)?;
                    self.cur.after.push(Inst::Store {
                        kind: StoreKind::Spill,
                        sym: s,
                        src: ret_reg,
                        slot,
                    });
                }
                x => {
                    return Err(CompilationError::InternalError(format!(
                        "call result %{s} in state {x:?}"
                    )))
                }
            }
            ret_op = Some((s, ret_reg));
        }

        let new = Inst::Call {
            kind,
            addr,
            args: moves.iter().map(|m| Operand::Reg(m.sym, m.dst)).collect(),
            ret: ret_op.map(|(s, r)| Operand::Reg(s, r)),
            bailout,
        };
        let idx = self.flush(Some(new));
        if let (Some((s, ret_reg)), Some(idx)) = (ret_op, idx) {
            if let LtState::Active(_) = self.lts[s].state {
                self.def_outs[s].push((idx, ret_reg));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::ir::{parser::str_to_func, Ty};
    use fm::{FMBuilder, FMatcher};
    use lazy_static::lazy_static;
    use proptest::prelude::*;
    use regex::Regex;
    use strum::{Display, EnumCount, FromRepr};

    /// A small register file, so that tests can easily run out of registers.
    #[derive(Copy, Clone, Debug, Display, EnumCount, Eq, FromRepr, PartialEq)]
    #[strum(serialize_all = "lowercase")]
    #[repr(u8)]
    pub(crate) enum TestReg {
        /// Caller-saved, byte addressable.
        GPR0,
        /// Caller-saved, byte addressable.
        GPR1,
        GPR2,
        GPR3,
        /// Scratch.
        GPRS,
        FP0,
        FP1,
        /// Scratch.
        FPS,
    }

    impl RegT for TestReg {
        const COUNT: usize = <TestReg as EnumCount>::COUNT;

        fn regidx(&self) -> usize {
            *self as usize
        }

        fn from_regidx(idx: usize) -> Self {
            u8::try_from(idx)
                .ok()
                .and_then(TestReg::from_repr)
                .unwrap_or_else(|| panic!("bad register index {idx}"))
        }

        fn class(&self) -> RegClass {
            match self {
                TestReg::FP0 | TestReg::FP1 | TestReg::FPS => RegClass::Float,
                _ => RegClass::Int,
            }
        }

        fn is_caller_saved(&self) -> bool {
            !matches!(self, TestReg::GPR2 | TestReg::GPR3)
        }

        fn is_byte_addressable(&self) -> bool {
            matches!(self, TestReg::GPR0 | TestReg::GPR1)
        }

        fn from_str(s: &str) -> Option<Self> {
            (0..<TestReg as RegT>::COUNT)
                .map(Self::from_regidx)
                .find(|r| r.to_string() == s)
        }
    }

    pub(crate) fn test_regset() -> RegSet<TestReg> {
        RegSet::new(
            vec![
                TestReg::GPR0,
                TestReg::GPR1,
                TestReg::GPR2,
                TestReg::GPR3,
                TestReg::FP0,
                TestReg::FP1,
            ],
            vec![TestReg::GPR0, TestReg::GPR1],
            vec![TestReg::FP0],
            (TestReg::GPR0, TestReg::FP0),
            (TestReg::GPRS, TestReg::FPS),
        )
    }

    lazy_static! {
        static ref PTN_RE: Regex = Regex::new(r"\{\{.+?\}\}").unwrap();
        static ref PTN_RE_IGNORE: Regex = Regex::new(r"\{\{_}\}").unwrap();
        static ref TEXT_RE: Regex = Regex::new(r"[a-zA-Z0-9\._]+").unwrap();
    }

    fn fmatcher(ptn: &str) -> FMatcher<'_> {
        FMBuilder::new(ptn)
            .unwrap()
            .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
            .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
            .build()
            .unwrap()
    }

    /// Allocate `s` with `cfg`, check the result with the allocation checker, and return it.
    fn alloc_with(s: &str, cfg: &Config) -> (Func<TestReg>, Allocation<TestReg>) {
        let mut f = str_to_func::<TestReg>(s);
        f.assert_well_formed().unwrap();
        let regset = test_regset();
        let a = allocate(&mut f, &regset, cfg).unwrap_or_else(|e| panic!("{e}"));
        if let Err(e) = checker::check(&f, &regset) {
            panic!("{e}\n{f}");
        }
        (f, a)
    }

    /// Allocate `s` and check that the result matches one of `ptns`.
    fn build_and_test(s: &str, cfg: &Config, ptns: &[&str]) -> Allocation<TestReg> {
        let (f, a) = alloc_with(s, cfg);
        let out = f.to_string();
        let mut failures = Vec::with_capacity(ptns.len());
        for ptn in ptns {
            match fmatcher(ptn).matches(&out) {
                Ok(_) => return a,
                Err(e) => failures.push(format!("{e}")),
            }
        }
        panic!("{}", failures.join("\n\n"));
    }

    fn count(a: &Allocation<TestReg>, c: Counter) -> u64 {
        a.counters.get(c)
    }

    #[test]
    fn no_spills() {
        let a = build_and_test(
            "
              %0: int = param 0
              %1: int = param 1
              %2: int = add %0, %1
              ret %2
            ",
            &Config::default(),
            &["
              ...
              %0:gpr0 = param 0
              %1:gpr1 = param 1
              %2:gpr0 = add %0:gpr0, %1:gpr1
              ret %2:gpr0
            "],
        );
        assert_eq!(count(&a, Counter::Spill), 0);
        assert_eq!(count(&a, Counter::Copy), 0);
        assert!(a.callee_saved.is_empty());
    }

    #[test]
    fn dying_registers_are_reused() {
        build_and_test(
            "
              %0: int = param 0
              %1: int = param 1
              %2: int = sub %1, %0
              %3: int = add %2, %1
              ret %3
            ",
            &Config::default(),
            &["
              ...
              %2:gpr0 = sub %1:gpr1, %0:gpr0
              %3:gpr0 = add %2:gpr0, %1:gpr1
              ret %3:gpr0
            "],
        );
    }

    #[test]
    fn spill() {
        // Five integer values are simultaneously live, but there are only four registers.
        let a = build_and_test(
            "
              %0: int = param 0
              %1: int = param 1
              %2: int = add %0, %1
              %3: int = add %1, %0
              %4: int = add %2, %3
              %5: int = add %4, %0
              %6: int = add %5, %1
              %7: int = add %6, %2
              %8: int = add %7, %3
              %9: int = add %8, %4
              ret %9
            ",
            &Config::default(),
            &["
              ...
              %0:gpr0 = param 0
              spill %0 gpr0 -> s0
              %1:gpr1 = param 1
              spill %1 gpr1 -> s1
              %2:gpr2 = add %0:gpr0, %1:gpr1
              spill %2 gpr2 -> s2
              %3:gpr3 = add %1:gpr1, %0:gpr0
              %4:gpr0 = add %2:gpr2, %3:gpr3
              reload %0 s0 -> gpr1
              %5:gpr1 = add %4:gpr0, %0:gpr1
              reload %1 s1 -> gpr2
              %6:gpr1 = add %5:gpr1, %1:gpr2
              reload %2 s2 -> gpr2
              %7:gpr1 = add %6:gpr1, %2:gpr2
              %8:gpr1 = add %7:gpr1, %3:gpr3
              %9:gpr0 = add %8:gpr1, %4:gpr0
              ret %9:gpr0
            "],
        );
        assert_eq!(count(&a, Counter::Spill), 3);
        assert_eq!(count(&a, Counter::Reload), 3);
        assert_eq!(a.callee_saved, [TestReg::GPR2, TestReg::GPR3]);
    }

    #[test]
    fn second_chance() {
        // %0 is evicted, then read twice in a row: the first reload is kept in a register for
        // the second read.
        let src = "
              %0: int = param 0
              %1: int = param 1
              %2: int = add %0, %1
              %3: int = add %0, %1
              %4: int = add %2, %3
              %5: int = add %4, %0
              %5 = add %5, %0
              %5 = add %5, %1
              %5 = add %5, %2
              %5 = add %5, %3
              %5 = add %5, %1
              %5 = add %5, %2
              %5 = add %5, %3
              ret %5
            ";
        let a = build_and_test(
            src,
            &Config::default(),
            &["
              ...
              reload %0 s1 -> gpr1
              %5:gpr0 = add %4:gpr0, %0:gpr1
              %5:gpr0 = add %5:gpr0, %0:gpr1
              ...
            "],
        );
        assert_eq!(count(&a, Counter::SecondChance), 2);
        assert_eq!(count(&a, Counter::Reload), 3);

        let cfg = Config::default().with_opts("no-second-chance").unwrap();
        let (_, b) = alloc_with(src, &cfg);
        assert_eq!(count(&b, Counter::SecondChance), 0);
        assert_eq!(count(&b, Counter::Reload), 5);
    }

    #[test]
    fn remat() {
        // When the constant %2 is evicted it is re-materialised rather than reloaded.
        let a = build_and_test(
            "
              %0: int = param 0
              %1: int = param 1
              %2: int = const 77
              %3: int = add %0, %1
              %4: int = add %1, %0
              %5: int = add %3, %4
              %6: int = add %5, %0
              %7: int = add %6, %1
              %8: int = add %7, %2
              ret %8
            ",
            &Config::default(),
            &["
              ...
              %2:gpr2 = const 77
              ...
              remat %2 {{r}} = 77
              %8:{{_}} = add %7:{{_}}, %2:{{r}}
              ...
            "],
        );
        assert_eq!(count(&a, Counter::Remat), 1);
        assert_eq!(count(&a, Counter::Reload), 0);
        assert_eq!(count(&a, Counter::Spill), 1);
    }

    #[test]
    fn elided_constant() {
        // %4 is a constant which is the best eviction candidate at its own definition: it never
        // occupies a register until it is re-materialised at its use.
        let (f, a) = alloc_with(
            "
              %0: int = param 0
              %1: int = param 1
              %2: int = add %0, %1
              %3: int = add %1, %0
              %4: int = const 8
              %5: int = add %2, %3
              %5 = add %5, %0
              %5 = add %5, %1
              %5 = add %5, %4
              ret %5
            ",
            &Config::default(),
        );
        let out = f.to_string();
        assert!(!out.contains("const 8"), "{out}");
        assert!(out.contains("remat %4 gpr0 = 8"), "{out}");
        assert_eq!(count(&a, Counter::ImmediateSpill), 1);
    }

    #[test]
    fn dont_allocate() {
        build_and_test(
            "
              %0: int noalloc = param 0
              %1: int noalloc = const 3
              %2: int = add %0, %1
              ret %2
            ",
            &Config::default(),
            &["
              ...
              %0:gpr0 = param 0
              spill %0 gpr0 -> s0
              %1:{{r1}} = const 3
              spill %1 {{r1}} -> s1
              reload %0 s0 -> {{r2}}
              reload %1 s1 -> {{r3}}
              %2:{{_}} = add %0:{{r2}}, %1:{{r3}}
              ...
            "],
        );
    }

    #[test]
    fn callee_saved_across_calls() {
        let a = build_and_test(
            "
              %0: int = param 0
              %1: int = const 5
              %2: int = call user 0x1234(%1)
              %3: int = add %0, %2
              ret %3
            ",
            &Config::default(),
            &["
              ...
              %0:gpr0 = param 0
              copy %0 gpr0 -> gpr2
              %1:gpr0 = const 5
              %2:gpr0 = call user 0x1234(%1:gpr0)
              %3:gpr0 = add %0:gpr2, %2:gpr0
              ret %3:gpr0
            "],
        );
        assert_eq!(a.callee_saved, [TestReg::GPR2]);
        assert_eq!(count(&a, Counter::Spill), 0);
    }

    #[test]
    fn user_call_spills() {
        // With only two callee-saved registers, two of the four values that live across the
        // call must be spilled.
        let a = build_and_test(
            "
              %0: int = param 0
              %1: int = param 1
              %2: int = add %0, %1
              %3: int = add %1, %0
              %4: int = call user 0x10()
              %5: int = add %0, %1
              %6: int = add %5, %2
              %7: int = add %6, %3
              %8: int = add %7, %4
              ret %8
            ",
            &Config::default(),
            &["
              ...
              %2:gpr0 = add %0:gpr2, %1:gpr3
              spill %2 gpr0 -> s0
              %3:gpr1 = add %1:gpr3, %0:gpr2
              spill %3 gpr1 -> s1
              %4:gpr0 = call user 0x10()
              ...
              reload %2 s0 -> {{_}}
              ...
              reload %3 s1 -> {{_}}
              ...
            "],
        );
        assert_eq!(count(&a, Counter::Spill), 2);
        assert_eq!(count(&a, Counter::Save), 0);
        assert_eq!(a.callee_saved, [TestReg::GPR2, TestReg::GPR3]);
    }

    #[test]
    fn helper_call_saves() {
        // There are no callee-saved float registers, so floats live across a helper call are
        // saved and restored around it.
        let a = build_and_test(
            "
              %0: float = param 0
              %1: float = const 1.5
              %2: float = fadd %0, %1
              %3: int = call helper 0x20()
              %4: float = fadd %2, %0
              ret %4
            ",
            &Config::default(),
            &["
              ...
              save %0 fp0 -> s0
              save %2 fp1 -> s1
              %3:gpr0 = call helper 0x20()
              restore %0 s0 -> fp0
              restore %2 s1 -> fp1
              %4:fp0 = fadd %2:fp1, %0:fp0
              ret %4:fp0
            "],
        );
        assert_eq!(count(&a, Counter::Save), 2);
        assert_eq!(count(&a, Counter::Spill), 0);
    }

    #[test]
    fn helper_call_args_and_result() {
        let a = build_and_test(
            "
              %0: int = param 0
              %1: int = param 1
              %2: int = call helper 0x30(%1, %0)
              ret %2
            ",
            &Config::default(),
            &["
              ...
              copy %1 gpr1 -> gprs
              copy %0 gpr0 -> gpr1
              copy %1 gprs -> gpr0
              %2:gpr0 = call helper 0x30(%1:gpr0, %0:gpr1)
              ret %2:gpr0
            "],
        );
        // A swap needs the scratch register: three copies.
        assert_eq!(count(&a, Counter::Copy), 3);
    }

    #[test]
    fn loop_with_call() {
        // %2 is live around the back edge and passed to a user call in the loop: it can't be
        // spilled there, so it is saved around the call.
        build_and_test(
            "
              region 1: loop parent 0
              %0: int = param 0
              %1: int = const 1
              %2: int = const 0
              l0:
              @1 %2 = add %2, %1
              @1 %3: int = call user 0x40(%2)
              @1 cmp %2, %0
              @1 jcc lt l0
              ret %2
            ",
            &Config::default(),
            &["
              ...
              copy %0 gpr0 -> gpr2
              %1:gpr3 = const 1
              %2:gpr0 = const 0
              l0:
              @1 %2:gpr0 = add %2:gpr0, %1:gpr3
              @1 save %2 gpr0 -> s0
              @1 %3:gpr0 = call user 0x40(%2:gpr0)
              @1 copy %3 gpr0 -> gpr1
              @1 restore %2 s0 -> gpr0
              @1 cmp %2:gpr0, %0:gpr2
              @1 jcc lt l0
              ret %2:gpr0
            "],
        );
    }

    #[test]
    fn pinned_values_are_saved() {
        // Four integers live around the loop's back edge occupy every register. The call in the
        // loop can't spill the pinned caller-saved ones, so they are saved around it instead, and
        // the call's unused result goes straight to the stack.
        let a = build_and_test(
            "
              region 1: loop parent 0
              %0: int = param 0
              %1: int = param 1
              %2: int = add %0, %1
              %3: int = add %1, %0
              l0:
              @1 %0 = add %0, %1
              @1 %4: int = call user 0x50()
              @1 %1 = add %1, %2
              @1 %2 = add %2, %3
              @1 cmp %0, %3
              @1 jcc lt l0
              %5: int = add %0, %1
              %5 = add %5, %2
              %5 = add %5, %3
              ret %5
            ",
            &Config::default(),
            &["
              ...
              @1 save %2 gpr0 -> s0
              @1 save %3 gpr1 -> s1
              @1 %4:gpr0 = call user 0x50()
              @1 spill %4 gpr0 -> s2
              @1 restore %2 s0 -> gpr0
              @1 restore %3 s1 -> gpr1
              ...
            "],
        );
        assert_eq!(count(&a, Counter::Save), 2);
        assert_eq!(count(&a, Counter::Spill), 0);
        assert_eq!(count(&a, Counter::ImmediateSpill), 1);
    }

    #[test]
    fn setcc_byte_register() {
        let a = build_and_test(
            "
              %0: int = param 0
              %1: int = const 5
              %2: int = call user 0x60()
              cmp %0, %1
              %3: int = set lt
              %4: int = add %3, %2
              %5: int = add %4, %0
              ret %5
            ",
            &Config::default(),
            &["
              ...
              %2:gpr0 = call user 0x60()
              cmp %0:gpr2, %1:gpr3
              %3:gpr1 = set lt
              ...
            "],
        );
        assert_eq!(count(&a, Counter::ImmediateSpill), 0);
    }

    #[test]
    fn bailout_locations() {
        let (f, _) = alloc_with(
            "
              %0: int = param 0
              %1: int = param 1
              %2: float = param 0
              %3: int = const 9
              %4: int noalloc = const 4
              %5: int = call user 0x70() [bailout 42: %0 %2 %3 %4]
              %6: int = add %0, %5
              %6 = add %6, %1
              %7: float = fadd %2, %2
              ret %6
            ",
            &Config::default(),
        );
        let b = f.bailout(crate::ir::BailoutIdx::from(0));
        assert_eq!(b.id, 42);
        assert_eq!(b.locs.len(), 4);
        // %0 moved to a callee-saved register; %2 is a float and there are no callee-saved float
        // registers; %3 is a constant that was evicted from a caller-saved register; %4 lives on
        // the stack.
        assert_eq!(b.locs[0], RecoveryLoc::Reg(TestReg::GPR2));
        assert!(matches!(b.locs[1], RecoveryLoc::Stack(_)));
        assert_eq!(b.locs[2], RecoveryLoc::Const(9));
        assert!(matches!(b.locs[3], RecoveryLoc::Stack(_)));
        assert_ne!(b.locs[1], b.locs[3]);
    }

    #[test]
    fn too_many_args() {
        let mut f = str_to_func::<TestReg>(
            "
              %0: int = param 0
              %1: int = call user 0x80(%0, %0, %0)
              ret %1
            ",
        );
        match allocate(&mut f, &test_regset(), &Config::default()) {
            Err(CompilationError::LimitExceeded(e)) => assert!(e.contains("more than 2 int")),
            x => panic!("{x:?}"),
        }

        let mut f = str_to_func::<TestReg>(
            "
              %0: float = param 1
              ret %0
            ",
        );
        assert!(matches!(
            allocate(&mut f, &test_regset(), &Config::default()),
            Err(CompilationError::LimitExceeded(_))
        ));
    }

    #[test]
    fn branches() {
        build_and_test(
            "
              %0: int = param 0
              %1: int = const 0
              %2: int = const 1
              cmp %0, %1
              jcc eq l0
              %3: int = add %0, %2
              jmp l1
              l0:
              %3 = sub %0, %2
              l1:
              ret %3
            ",
            &Config::default(),
            &["
              ...
              %3:gpr1 = add %0:gpr0, %2:gpr2
              jmp l1
              l0:
              %3:gpr1 = sub %0:gpr0, %2:gpr2
              l1:
              copy %3 gpr1 -> gpr0
              ret %3:gpr0
            "],
        );
    }

    #[test]
    fn switch() {
        build_and_test(
            "
              %0: int = param 0
              %1: int = const 10
              switch %0 [l0, l1, l0]
              l0:
              ret %1
              l1:
              %2: int = add %1, %0
              ret %2
            ",
            &Config::default(),
            &["
              ...
              switch %0:gpr0 [l0, l1, l0]
              l0:
              copy %1 gpr1 -> gpr0
              ret %1:gpr0
              l1:
              %2:gpr0 = add %1:gpr1, %0:gpr0
              ret %2:gpr0
            "],
        );
    }

    #[test]
    fn region_use_counts() {
        // When %4 needs a register inside the loop, %2 has no uses left in the loop but %3 does.
        // With region use counts %2 is evicted; without, %3 is, since it has fewer uses overall.
        let src = "
              region 1: loop parent 0
              %0: int = param 0
              %1: int = param 1
              l0:
              @1 %2: int = add %0, %1
              @1 %3: int = add %0, %0
              @1 %4: int = add %0, %1
              @1 %5: int = add %4, %3
              @1 %0 = add %0, %5
              @1 cmp %0, %1
              @1 jcc lt l0
              %6: int = add %2, %2
              %6 = add %6, %2
              ret %6
            ";
        build_and_test(
            src,
            &Config::default(),
            &["
              ...
              @1 %2:gpr2 = add %0:gpr0, %1:gpr1
              @1 spill %2 gpr2 -> s0
              @1 %3:gpr3 = add %0:gpr0, %0:gpr0
              @1 %4:gpr2 = add %0:gpr0, %1:gpr1
              ...
            "],
        );
        build_and_test(
            src,
            &Config::default().with_opts("no-region-use-counts").unwrap(),
            &["
              ...
              @1 %3:gpr3 = add %0:gpr0, %0:gpr0
              @1 spill %3 gpr3 -> s0
              @1 %4:gpr3 = add %0:gpr0, %1:gpr1
              ...
            "],
        );
    }

    #[test]
    fn floats() {
        build_and_test(
            "
              %0: float = param 0
              %1: float = const 2.0
              %2: float = fmul %0, %1
              ret %2
            ",
            &Config::default(),
            &["
              ...
              %0:fp0 = param 0
              %1:fp1 = const 2.0
              %2:fp0 = fmul %0:fp0, %1:fp1
              ret %2:fp0
            "],
        );
    }

    #[test]
    fn copies_never_outlive_saves() {
        // Both floats are pinned in the loop, so each read of the constant %5 borrows the other
        // float's register. The restore that follows overwrites the constant, so it can't be kept
        // there for the next read.
        let a = build_and_test(
            "
              region 1: loop parent 0
              %0: float = param 0
              %1: int = param 0
              %2: int = param 1
              %3: int = const 1
              %4: float = fadd %0, %0
              %5: float = const 2.5
              l0:
              @1 %0 = fadd %0, %5
              @1 %4 = fadd %4, %5
              @1 %1 = add %1, %3
              @1 cmp %1, %2
              @1 jcc lt l0
              %6: float = fadd %0, %4
              %6 = fadd %6, %5
              ret %6
            ",
            &Config::default(),
            &["
              ...
              l0:
              @1 save %4 fp1 -> s0
              @1 remat %5 fp1 = {{_}}
              @1 %0:fp0 = fadd %0:fp0, %5:fp1
              @1 restore %4 s0 -> fp1
              @1 save %0 fp0 -> s1
              @1 remat %5 fp0 = {{_}}
              @1 %4:fp1 = fadd %4:fp1, %5:fp0
              @1 restore %0 s1 -> fp0
              ...
            "],
        );
        assert_eq!(count(&a, Counter::Save), 2);
        assert_eq!(count(&a, Counter::SecondChance), 0);
    }

    #[test]
    fn def_when_every_register_is_read() {
        // Both float registers hold values the instruction reads and which outlive it, and the
        // result lives on the stack: the result is written over the cheaper of the two.
        let a = build_and_test(
            "
              %0: float = param 0
              %1: float = const 3.5
              %2: float noalloc = fadd %0, %1
              %3: float = fadd %0, %1
              %3 = fadd %3, %2
              ret %3
            ",
            &Config::default(),
            &["
              ...
              %0:fp0 = param 0
              %1:fp1 = const 3.5
              %2:fp1 = fadd %0:fp0, %1:fp1
              spill %2 fp1 -> s0
              remat %1 fp1 = {{_}}
              %3:fp0 = fadd %0:fp0, %1:fp1
              reload %2 s0 -> fp1
              %3:fp0 = fadd %3:fp0, %2:fp1
              ret %3:fp0
            "],
        );
        assert_eq!(count(&a, Counter::Spill), 1);
    }

    #[test]
    fn switch_on_scratch() {
        // Every integer register is pinned by the loop, so the spilled switch index is loaded into
        // the scratch register: nothing after the switch could restore a saved register.
        build_and_test(
            "
              region 1: loop parent 0
              %0: int = param 0
              %1: int = param 1
              %2: int = add %0, %1
              %3: int = add %1, %0
              %4: int noalloc = const 1
              l0:
              @1 %0 = add %0, %1
              @1 %1 = add %1, %2
              @1 %2 = add %2, %3
              @1 %3 = add %3, %0
              @1 switch %4 [l1, l2]
              @1 l1:
              @1 cmp %0, %1
              @1 jcc lt l0
              @1 jmp l2
              l2:
              %0 = add %0, %1
              %0 = add %0, %2
              %0 = add %0, %3
              ret %0
            ",
            &Config::default(),
            &["
              ...
              @1 reload %4 {{_}} -> gprs
              @1 switch %4:gprs [l1, l2]
              ...
            "],
        );
    }

    /// Writes out a random well-formed function with loops, branches, calls, and bailouts, making
    /// each choice by consuming the next value from `tape`.
    struct FuncGen<'a> {
        tape: &'a [u32],
        next: usize,
        tys: Vec<Ty>,
        noalloc: Vec<bool>,
        /// Which values are defined on every path to the current point.
        defined: Vec<bool>,
        lines: Vec<String>,
        /// The parent of every loop region, in region order.
        loops: Vec<usize>,
        labels: usize,
        bailouts: usize,
        budget: usize,
    }

    impl<'a> FuncGen<'a> {
        const INTS: usize = 8;
        const FLOATS: usize = 4;

        fn new(tape: &'a [u32]) -> Self {
            let mut g = Self {
                tape,
                next: 0,
                tys: Vec::new(),
                noalloc: Vec::new(),
                defined: Vec::new(),
                lines: Vec::new(),
                loops: Vec::new(),
                labels: 0,
                bailouts: 0,
                budget: 0,
            };
            for i in 0..Self::INTS + Self::FLOATS {
                g.tys.push(if i < Self::INTS { Ty::Int } else { Ty::Float });
                let noalloc = g.choose(6) == 0;
                g.noalloc.push(noalloc);
                g.defined.push(false);
            }
            g.budget = 8 + g.choose(24);
            g
        }

        fn choose(&mut self, n: usize) -> usize {
            let x = self.tape[self.next % self.tape.len()];
            self.next += 1;
            usize::try_from(x).unwrap() % n
        }

        fn emit(&mut self, region: usize, s: String) {
            if region == 0 {
                self.lines.push(s);
            } else {
                self.lines.push(format!("@{region} {s}"));
            }
        }

        fn new_label(&mut self) -> String {
            self.labels += 1;
            format!("l{}", self.labels - 1)
        }

        fn any_of(&mut self, ty: Ty) -> usize {
            match ty {
                Ty::Int => self.choose(Self::INTS),
                Ty::Float => Self::INTS + self.choose(Self::FLOATS),
            }
        }

        fn konst(&mut self, region: usize, d: usize) {
            let val = match self.tys[d] {
                Ty::Int => ["0", "1", "-7", "4096", "1099511627776"][self.choose(5)],
                Ty::Float => ["0.0", "1.5", "-2.25"][self.choose(3)],
            };
            self.emit(region, format!("%{d} = const {val}"));
            self.defined[d] = true;
        }

        /// A value of type `ty` that can be read here, defining one if there are none.
        fn operand(&mut self, region: usize, ty: Ty) -> usize {
            let cands = (0..self.tys.len())
                .filter(|i| self.defined[*i] && self.tys[*i] == ty)
                .collect::<Vec<_>>();
            if cands.is_empty() {
                let d = self.any_of(ty);
                self.konst(region, d);
                d
            } else {
                cands[self.choose(cands.len())]
            }
        }

        fn inst(&mut self, region: usize) {
            match self.choose(8) {
                0 => {
                    let ty = [Ty::Int, Ty::Float][self.choose(2)];
                    let d = self.any_of(ty);
                    self.konst(region, d);
                }
                1 | 2 => {
                    let (a, b) = (self.operand(region, Ty::Int), self.operand(region, Ty::Int));
                    let op = ["add", "sub", "mul", "and", "or", "xor"][self.choose(6)];
                    let d = self.any_of(Ty::Int);
                    self.emit(region, format!("%{d} = {op} %{a}, %{b}"));
                    self.defined[d] = true;
                }
                3 => {
                    let (a, b) = (
                        self.operand(region, Ty::Float),
                        self.operand(region, Ty::Float),
                    );
                    let op = ["fadd", "fsub", "fmul", "fdiv"][self.choose(4)];
                    let d = self.any_of(Ty::Float);
                    self.emit(region, format!("%{d} = {op} %{a}, %{b}"));
                    self.defined[d] = true;
                }
                4 => {
                    let ty = [Ty::Int, Ty::Float][self.choose(2)];
                    let a = self.operand(region, ty);
                    let d = self.any_of(ty);
                    self.emit(region, format!("%{d} = mov %{a}"));
                    self.defined[d] = true;
                }
                5 => {
                    let (a, b) = (self.operand(region, Ty::Int), self.operand(region, Ty::Int));
                    let cond = ["eq", "lt", "ae"][self.choose(3)];
                    let d = self.any_of(Ty::Int);
                    self.emit(region, format!("cmp %{a}, %{b}"));
                    self.emit(region, format!("%{d} = set {cond}"));
                    self.defined[d] = true;
                }
                _ => self.call(region),
            }
        }

        fn call(&mut self, region: usize) {
            let mut args = Vec::new();
            for _ in 0..self.choose(3) {
                args.push(self.operand(region, Ty::Int));
            }
            if self.choose(2) == 0 {
                let x = self.operand(region, Ty::Float);
                let at = self.choose(args.len() + 1);
                args.insert(at, x);
            }
            let kind = ["user", "helper"][self.choose(2)];
            let ret = match self.choose(3) {
                0 => None,
                1 => Some(self.any_of(Ty::Int)),
                _ => Some(self.any_of(Ty::Float)),
            };
            let args = args
                .iter()
                .map(|x| format!("%{x}"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut call = format!("call {kind} 0x{:x}({args})", 0x1000 + 0x10 * self.choose(16));
            if self.choose(2) == 0 {
                let mut live = Vec::new();
                for s in 0..self.tys.len() {
                    if self.defined[s] && Some(s) != ret && self.choose(3) == 0 {
                        live.push(format!("%{s}"));
                    }
                }
                if !live.is_empty() {
                    self.bailouts += 1;
                    call.push_str(&format!(" [bailout {}: {}]", self.bailouts, live.join(" ")));
                }
            }
            match ret {
                Some(d) => {
                    self.emit(region, format!("%{d} = {call}"));
                    self.defined[d] = true;
                }
                None => self.emit(region, call),
            }
        }

        /// A do-while loop in a new region.
        fn looop(&mut self, region: usize, depth: usize) {
            self.loops.push(region);
            let inner = self.loops.len();
            let head = self.new_label();
            self.emit(region, format!("{head}:"));
            self.block(inner, depth + 1);
            let (a, b) = (self.operand(inner, Ty::Int), self.operand(inner, Ty::Int));
            self.emit(inner, format!("cmp %{a}, %{b}"));
            self.emit(inner, format!("jcc lt {head}"));
        }

        fn diamond(&mut self, region: usize, depth: usize) {
            let (a, b) = (self.operand(region, Ty::Int), self.operand(region, Ty::Int));
            let (other, join) = (self.new_label(), self.new_label());
            self.emit(region, format!("cmp %{a}, %{b}"));
            self.emit(region, format!("jcc eq {other}"));
            let before = self.defined.clone();
            self.block(region, depth + 1);
            self.emit(region, format!("jmp {join}"));
            let then = std::mem::replace(&mut self.defined, before);
            self.emit(region, format!("{other}:"));
            self.block(region, depth + 1);
            self.emit(region, format!("{join}:"));
            for (x, y) in self.defined.iter_mut().zip(then) {
                *x &= y;
            }
        }

        fn switch(&mut self, region: usize, depth: usize) {
            let idx = self.operand(region, Ty::Int);
            let mut cases = Vec::new();
            for _ in 0..1 + self.choose(3) {
                cases.push(self.new_label());
            }
            let end = self.new_label();
            let mut table = cases.clone();
            for _ in 0..self.choose(3) {
                let x = cases[self.choose(cases.len())].clone();
                let at = self.choose(table.len() + 1);
                table.insert(at, x);
            }
            self.emit(region, format!("switch %{idx} [{}]", table.join(", ")));
            let before = self.defined.clone();
            let mut joined = vec![true; before.len()];
            for c in &cases {
                self.defined = before.clone();
                self.emit(region, format!("{c}:"));
                self.block(region, depth + 1);
                self.emit(region, format!("jmp {end}"));
                for (x, y) in joined.iter_mut().zip(&self.defined) {
                    *x &= *y;
                }
            }
            self.defined = joined;
            self.emit(region, format!("{end}:"));
        }

        fn block(&mut self, region: usize, depth: usize) {
            for _ in 0..1 + self.choose(4) {
                if self.budget == 0 {
                    return;
                }
                self.budget -= 1;
                match self.choose(10) {
                    0 if depth < 2 => self.looop(region, depth),
                    1 if depth < 2 => self.diamond(region, depth),
                    2 if depth < 2 => self.switch(region, depth),
                    _ => self.inst(region),
                }
            }
        }

        fn func(mut self) -> String {
            for i in 0..self.choose(3) {
                self.emit(0, format!("%{i} = param {i}"));
                self.defined[i] = true;
            }
            if self.choose(2) == 0 {
                self.emit(0, format!("%{} = param 0", Self::INTS));
                self.defined[Self::INTS] = true;
            }
            while self.budget > 0 {
                self.block(0, 0);
            }
            match self.choose(3) {
                0 => self.emit(0, "ret".into()),
                1 => {
                    let x = self.operand(0, Ty::Int);
                    self.emit(0, format!("ret %{x}"));
                }
                _ => {
                    let x = self.operand(0, Ty::Float);
                    self.emit(0, format!("ret %{x}"));
                }
            }
            let mut out = Vec::new();
            for (i, (ty, noalloc)) in self.tys.iter().zip(&self.noalloc).enumerate() {
                let noalloc = if *noalloc { " noalloc" } else { "" };
                out.push(format!("decl %{i}: {ty}{noalloc}"));
            }
            for (i, parent) in self.loops.iter().enumerate() {
                out.push(format!("region {}: loop parent {parent}", i + 1));
            }
            out.append(&mut self.lines);
            out.join("\n")
        }
    }

    /// Allocate `src` with `regset` under each allocator configuration, checking every result.
    fn alloc_and_check<R: RegT>(src: &str, regset: &RegSet<R>) {
        let cfgs = [
            Config::default(),
            Config::default().with_opts("no-second-chance").unwrap(),
            Config::default().with_opts("no-region-use-counts").unwrap(),
        ];
        for cfg in &cfgs {
            let mut f = str_to_func::<R>(src);
            f.assert_well_formed()
                .unwrap_or_else(|e| panic!("{e}\n{src}"));
            allocate(&mut f, regset, cfg).unwrap_or_else(|e| panic!("{e}\n{src}"));
            if let Err(e) = checker::check(&f, regset) {
                panic!("{e}\n{src}\n{f}");
            }
        }
    }

    #[test]
    fn random_funcs_smoke() {
        // The generator reaches every kind of construct from a short tape.
        let src = FuncGen::new(&[3, 0, 1, 2, 5, 7, 9, 4, 6, 8, 10, 11]).func();
        assert!(src.contains("ret"));
        alloc_and_check(&src, &test_regset());
    }

    proptest! {
        #[test]
        fn random_funcs(tape in prop::collection::vec(any::<u32>(), 1..256)) {
            let src = FuncGen::new(&tape).func();
            alloc_and_check(&src, &test_regset());
            alloc_and_check(&src, &crate::arch::x64::register_set());
        }
    }
}
