//! Analyse a function before allocation.
//!
//! This computes, for every [SymIdx], a single conservative live interval: the instruction list is
//! split into basic blocks, a standard backwards liveness analysis is run over them, and each
//! value's interval is then widened to cover every block boundary at which the value is live. It
//! also records everything else the allocator needs to know up front: where the calls and loop
//! back edges are, which values cross calls, and each value's [LtFlags].
//!
//! Values named by a lazy bailout annotation are treated as being used by the annotated call and
//! as being live immediately after it (so that they can be found at the call's return address),
//! but those uses are not counted in use counts.

use super::lifetime::{Lifetime, LtFlag};
use crate::{
    arch::{RegClass, RegT},
    config::Config,
    errors::CompilationError,
    ir::{CallKind, Func, Inst, LabelIdx, SymIdx},
};
use smallvec::SmallVec;
use typed_index_collections::TiVec;
use vob::Vob;

pub(crate) struct Analysis<R> {
    pub(crate) lts: TiVec<SymIdx, Lifetime<R>>,
    /// Every live lifetime, sorted by start position (ties broken by [SymIdx]).
    pub(crate) by_start: Vec<SymIdx>,
    /// Every loop back edge as a `(label position, branch position)` pair, where the label
    /// position is `<=` the branch position. Sorted by branch position.
    pub(crate) backedges: Vec<(usize, usize)>,
    /// The position of every call, in ascending order.
    pub(crate) calls: Vec<usize>,
}

/// The position of each label in `func`.
pub(super) fn label_positions<R: RegT>(func: &Func<R>) -> TiVec<LabelIdx, usize> {
    let mut label_pos = TiVec::<LabelIdx, usize>::from(vec![0; func.num_labels()]);
    for (pos, inst) in func.insts().iter().enumerate() {
        if let Inst::Label(l) = inst {
            label_pos[*l] = pos;
        }
    }
    label_pos
}

/// The basic blocks of a function.
pub(super) struct Blocks {
    /// The position of the first instruction of each block, in ascending order.
    pub(super) starts: Vec<usize>,
    /// The successors of each block.
    pub(super) succs: Vec<SmallVec<[usize; 2]>>,
}

impl Blocks {
    pub(super) fn new<R: RegT>(func: &Func<R>, label_pos: &TiVec<LabelIdx, usize>) -> Self {
        let insts = func.insts();
        let mut starts = vec![0];
        for (pos, inst) in insts.iter().enumerate() {
            let new_block = match inst {
                Inst::Label(_) => Some(pos),
                Inst::Jcc { .. } => Some(pos + 1),
                x if x.is_terminator() => Some(pos + 1),
                _ => None,
            };
            if let Some(x) = new_block {
                if x < insts.len() && starts.last() != Some(&x) {
                    starts.push(x);
                }
            }
        }

        let block_of = |pos: usize| starts.partition_point(|x| *x <= pos) - 1;
        let mut succs = Vec::with_capacity(starts.len());
        for b in 0..starts.len() {
            let last = starts.get(b + 1).map(|x| x - 1).unwrap_or(insts.len() - 1);
            let mut s = SmallVec::new();
            let next = (b + 1 < starts.len()).then_some(b + 1);
            match &insts[last] {
                Inst::Jmp(l) => s.push(block_of(label_pos[*l])),
                Inst::Jcc { tgt, .. } => {
                    s.push(block_of(label_pos[*tgt]));
                    s.extend(next);
                }
                Inst::Switch { table, .. } => {
                    for l in func.jump_table(*table) {
                        let x = block_of(label_pos[*l]);
                        if !s.contains(&x) {
                            s.push(x);
                        }
                    }
                }
                Inst::Ret(_) => (),
                _ => s.extend(next),
            }
            succs.push(s);
        }
        Self { starts, succs }
    }

    pub(super) fn len(&self) -> usize {
        self.starts.len()
    }

    /// The positions of the instructions in block `b`.
    pub(super) fn range(&self, b: usize, ninsts: usize) -> std::ops::Range<usize> {
        self.starts[b]..self.starts.get(b + 1).copied().unwrap_or(ninsts)
    }
}

/// Call `f` for every value read by `inst`, including the values named by a call's bailout
/// annotation.
fn for_each_live_use<R: RegT, F: FnMut(SymIdx)>(func: &Func<R>, inst: &Inst<R>, mut f: F) {
    inst.for_each_use(&mut f);
    if let Inst::Call {
        bailout: Some(b), ..
    } = inst
    {
        for s in &func.bailout(*b).live {
            f(*s);
        }
    }
}

pub(crate) fn analyse<R: RegT>(
    func: &Func<R>,
    cfg: &Config,
) -> Result<Analysis<R>, CompilationError> {
    let insts = func.insts();
    let nsyms = func.syms_len();

    let label_pos = label_positions(func);
    let blocks = Blocks::new(func, &label_pos);

    // Per-block liveness.
    let mut gen = Vec::with_capacity(blocks.len());
    let mut kill = Vec::with_capacity(blocks.len());
    for b in 0..blocks.len() {
        let mut g = Vob::from_elem(false, nsyms);
        let mut k = Vob::from_elem(false, nsyms);
        for inst in &insts[blocks.range(b, insts.len())] {
            for_each_live_use(func, inst, |s| {
                if !k[usize::from(s)] {
                    g.set(usize::from(s), true);
                }
            });
            inst.for_each_def(|s| {
                k.set(usize::from(s), true);
            });
        }
        gen.push(g);
        kill.push(k);
    }

    let mut live_in = vec![Vob::from_elem(false, nsyms); blocks.len()];
    let mut live_out = vec![Vob::from_elem(false, nsyms); blocks.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..blocks.len()).rev() {
            let mut out = Vob::from_elem(false, nsyms);
            for succ in &blocks.succs[b] {
                for s in live_in[*succ].iter_set_bits(..) {
                    out.set(s, true);
                }
            }
            let mut inn = gen[b].clone();
            for s in out.iter_set_bits(..) {
                if !kill[b][s] {
                    inn.set(s, true);
                }
            }
            if inn != live_in[b] {
                live_in[b] = inn;
                changed = true;
            }
            live_out[b] = out;
        }
    }

    if let Some(s) = live_in[0].iter_set_bits(..).next() {
        return Err(CompilationError::General(format!(
            "{}: %{s} may be used before it is defined",
            func.name
        )));
    }

    // Intervals, defs, uses, and use counts.
    let mut lts = TiVec::<SymIdx, Lifetime<R>>::new();
    lts.raw.try_reserve_exact(nsyms)?;
    for i in 0..nsyms {
        lts.push(Lifetime::new(SymIdx::from(i)));
    }
    let mut calls = Vec::new();
    let mut backedges = Vec::new();
    for (pos, inst) in insts.iter().enumerate() {
        let region = cfg.region_use_counts.then(|| func.inst_region(pos));
        inst.for_each_use(|s| {
            let lt = &mut lts[s];
            lt.extend_to(pos);
            if lt.uses.last() != Some(&pos) {
                lt.uses.push(pos);
            }
            lt.add_to_use_count(1, region, func.regions());
        });
        inst.for_each_def(|s| {
            let lt = &mut lts[s];
            lt.extend_to(pos);
            lt.defs.push(pos);
        });
        match inst {
            Inst::Call { bailout, .. } => {
                calls.push(pos);
                if let Some(b) = bailout {
                    for s in &func.bailout(*b).live {
                        lts[*s].extend_to(pos + 1);
                    }
                }
            }
            Inst::Param { dst, .. } => {
                // Parameters arrive in registers at function entry, so they occupy those registers
                // from the very start.
                lts[dst.sym()].extend_to(0);
            }
            _ => (),
        }
        let mut backedge = |l: &LabelIdx| {
            if label_pos[*l] <= pos && !backedges.contains(&(label_pos[*l], pos)) {
                backedges.push((label_pos[*l], pos));
            }
        };
        match inst {
            Inst::Jmp(l) | Inst::Jcc { tgt: l, .. } => backedge(l),
            Inst::Switch { table, .. } => func.jump_table(*table).iter().for_each(backedge),
            _ => (),
        }
    }

    for b in 0..blocks.len() {
        let r = blocks.range(b, insts.len());
        for s in live_in[b].iter_set_bits(..) {
            lts[SymIdx::from(s)].extend_to(r.start);
        }
        for s in live_out[b].iter_set_bits(..) {
            lts[SymIdx::from(s)].extend_to(r.end - 1);
        }
    }

    // Flags and call crossing.
    for lt in lts.iter_mut() {
        if !lt.is_live() {
            continue;
        }
        let sym = func.sym(lt.sym);
        if sym.ty.class() == RegClass::Float {
            lt.flags.set(LtFlag::IsFloat);
        }
        if sym.dont_allocate {
            lt.flags.set(LtFlag::DontAllocate);
        }
        if lt.uses.is_empty() && lt.end == *lt.defs.last().unwrap_or(&lt.end) {
            lt.flags.set(LtFlag::DeadStore);
        }
        let mut const_val = None;
        let mut all_const = !lt.defs.is_empty();
        for d in &lt.defs {
            match &insts[*d] {
                Inst::Const { val, .. } if const_val.is_none() || const_val == Some(*val) => {
                    const_val = Some(*val)
                }
                Inst::SetCc { .. } => {
                    lt.flags.set(LtFlag::NeedsByteReg);
                    all_const = false;
                }
                _ => all_const = false,
            }
        }
        if all_const && !sym.dont_allocate {
            lt.flags.set(LtFlag::CheapSpill);
            lt.const_val = const_val;
        }
        if backedges
            .iter()
            .any(|(l, q)| lt.start <= *l && *q <= lt.end)
        {
            lt.flags.set(LtFlag::CannotSpill);
        }
        let first = calls.partition_point(|c| *c < lt.start);
        for c in calls[first..].iter().take_while(|c| **c < lt.end) {
            if let Inst::Call { kind, ret, .. } = &insts[*c] {
                if ret.map(|x| x.sym()) == Some(lt.sym) {
                    continue;
                }
                lt.live_across_calls = true;
                if *kind == CallKind::User {
                    lt.live_across_user_calls = true;
                }
            }
        }
    }

    let mut by_start = lts
        .iter()
        .filter(|lt| lt.is_live())
        .map(|lt| lt.sym)
        .collect::<Vec<_>>();
    by_start.sort_by_key(|s| (lts[*s].start, *s));
    backedges.sort_by_key(|(_, q)| *q);

    Ok(Analysis {
        lts,
        by_start,
        backedges,
        calls,
    })
}
