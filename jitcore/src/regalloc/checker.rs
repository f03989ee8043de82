//! Check the output of register allocation.
//!
//! This is independent of the allocator: it abstractly executes the allocated function, tracking
//! for every register and stack slot which value, if any, the location is known to hold. Where
//! control flow merges, a location keeps its value only if every incoming path agrees. Every
//! register operand must then hold the value it names, every reload must read a slot holding
//! the value being reloaded, and calls and returns must respect the [RegSet]'s conventions.
//!
//! A save and its restore only preserve whatever a register holds, so they are not checked
//! themselves: a register saved on a path where its value is not yet defined is fine, as long as
//! nothing reads it.

use super::analyse::{label_positions, Blocks};
use crate::{
    arch::{RegClass, RegSet, RegT},
    errors::CompilationError,
    ir::{Func, Inst, LoadKind, OpRole, Operand, RecoveryLoc, StoreKind, SymIdx},
};

#[derive(Clone, Debug, PartialEq)]
struct State {
    regs: Vec<Option<SymIdx>>,
    slots: Vec<Option<SymIdx>>,
}

impl State {
    fn new(nregs: usize, nslots: usize) -> Self {
        Self {
            regs: vec![None; nregs],
            slots: vec![None; nslots],
        }
    }

    /// Forget everything `other` doesn't agree with. Returns `true` if `self` changed.
    fn meet(&mut self, other: &State) -> bool {
        let mut changed = false;
        for (x, y) in self
            .regs
            .iter_mut()
            .zip(&other.regs)
            .chain(self.slots.iter_mut().zip(&other.slots))
        {
            if x.is_some() && x != y {
                *x = None;
                changed = true;
            }
        }
        changed
    }

    /// `s` has been given a new value in `r`: every other copy is stale.
    fn def<R: RegT>(&mut self, s: SymIdx, r: R) {
        for x in self.regs.iter_mut().chain(self.slots.iter_mut()) {
            if *x == Some(s) {
                *x = None;
            }
        }
        self.regs[r.regidx()] = Some(s);
    }
}

struct Checker<'a, R: RegT> {
    func: &'a Func<R>,
    regset: &'a RegSet<R>,
}

pub(crate) fn check<R: RegT>(func: &Func<R>, regset: &RegSet<R>) -> Result<(), CompilationError> {
    if !func.is_allocated() {
        return Err(CompilationError::InternalError(format!(
            "{}: function has not been allocated",
            func.name
        )));
    }
    let insts = func.insts();
    if insts.is_empty() {
        return Ok(());
    }
    let blocks = Blocks::new(func, &label_positions(func));
    let ck = Checker { func, regset };

    // States only ever lose information as the iteration proceeds, so an error found on any
    // iteration would also be found at the fixed point.
    let mut ins: Vec<Option<State>> = vec![None; blocks.len()];
    ins[0] = Some(State::new(R::COUNT, func.num_slots()));
    let mut changed = true;
    while changed {
        changed = false;
        for b in 0..blocks.len() {
            let Some(mut st) = ins[b].clone() else {
                continue;
            };
            for pos in blocks.range(b, insts.len()) {
                ck.step(pos, &mut st)?;
            }
            for succ in &blocks.succs[b] {
                match ins[*succ].as_mut() {
                    Some(x) => changed |= x.meet(&st),
                    None => {
                        ins[*succ] = Some(st.clone());
                        changed = true;
                    }
                }
            }
        }
    }
    Ok(())
}

impl<R: RegT> Checker<'_, R> {
    fn err(&self, pos: usize, msg: String) -> CompilationError {
        CompilationError::InternalError(format!(
            "{}: instruction {pos} ({}): {msg}",
            self.func.name,
            self.func.display_inst(pos)
        ))
    }

    fn class(&self, s: SymIdx) -> RegClass {
        self.func.sym(s).ty.class()
    }

    fn holds(&self, pos: usize, st: &State, s: SymIdx, r: R) -> Result<(), CompilationError> {
        if r.class() != self.class(s) {
            return Err(self.err(pos, format!("%{s} is in a {} register", r.class())));
        }
        match st.regs[r.regidx()] {
            Some(x) if x == s => Ok(()),
            Some(x) => Err(self.err(pos, format!("{r} holds %{x}, not %{s}"))),
            None => Err(self.err(pos, format!("{r} does not hold %{s}"))),
        }
    }

    fn slot_holds(
        &self,
        pos: usize,
        st: &State,
        s: SymIdx,
        slot: usize,
    ) -> Result<(), CompilationError> {
        match st.slots.get(slot) {
            Some(Some(x)) if *x == s => Ok(()),
            Some(_) => Err(self.err(pos, format!("s{slot} does not hold %{s}"))),
            None => Err(self.err(pos, format!("s{slot} is out of range"))),
        }
    }

    /// Check every use of `inst`, then apply its defs.
    fn operands(&self, pos: usize, inst: &Inst<R>, st: &mut State) -> Result<(), CompilationError> {
        let mut ops = Vec::new();
        inst.for_each_operand(|op, role| ops.push((*op, role)));
        for (op, role) in ops {
            let Operand::Reg(s, r) = op else {
                return Err(self.err(pos, format!("%{} has not been allocated", op.sym())));
            };
            match role {
                OpRole::Use => self.holds(pos, st, s, r)?,
                OpRole::Def => {
                    if r.class() != self.class(s) {
                        return Err(self.err(pos, format!("%{s} defined into {r}")));
                    }
                    st.def(s, r);
                }
            }
        }
        Ok(())
    }

    fn step(&self, pos: usize, st: &mut State) -> Result<(), CompilationError> {
        let inst = &self.func.insts()[pos];
        match inst {
            Inst::Param { dst, idx } => {
                let s = dst.sym();
                let expected = self.regset.args(self.class(s)).get(usize::from(*idx));
                if let Operand::Reg(_, r) = dst {
                    if expected != Some(r) {
                        return Err(self.err(pos, "param not in its argument register".into()));
                    }
                }
                self.operands(pos, inst, st)
            }
            Inst::Call { args, ret, bailout, .. } => {
                let mut nargs = [0usize; 2];
                for a in args {
                    let Operand::Reg(s, r) = a else {
                        return Err(self.err(pos, format!("%{} has not been allocated", a.sym())));
                    };
                    self.holds(pos, st, *s, *r)?;
                    let n = &mut nargs[usize::from(r.class() == RegClass::Float)];
                    if self.regset.args(r.class()).get(*n) != Some(r) {
                        return Err(self.err(pos, format!("%{s} passed in {r}")));
                    }
                    *n += 1;
                }
                for (i, x) in st.regs.iter_mut().enumerate() {
                    if R::from_regidx(i).is_caller_saved() {
                        *x = None;
                    }
                }
                if let Some(b) = bailout {
                    let b = self.func.bailout(*b);
                    if b.locs.len() != b.live.len() {
                        return Err(self.err(pos, "bailout locations not recorded".into()));
                    }
                    for (s, loc) in b.live.iter().zip(&b.locs) {
                        match loc {
                            RecoveryLoc::Reg(r) => self.holds(pos, st, *s, *r)?,
                            RecoveryLoc::Stack(slot) => {
                                self.slot_holds(pos, st, *s, usize::from(*slot))?
                            }
                            RecoveryLoc::Const(_) => (),
                        }
                    }
                }
                if let Some(x) = ret {
                    let Operand::Reg(s, r) = x else {
                        return Err(self.err(pos, format!("%{} has not been allocated", x.sym())));
                    };
                    if *r != self.regset.ret(self.class(*s)) {
                        return Err(self.err(pos, format!("result %{s} in {r}")));
                    }
                    st.def(*s, *r);
                }
                Ok(())
            }
            Inst::Ret(Some(Operand::Reg(s, r))) if *r != self.regset.ret(self.class(*s)) => {
                Err(self.err(pos, format!("returning %{s} in {r}")))
            }
            Inst::Store {
                kind,
                sym,
                src,
                slot,
            } => {
                let val = match kind {
                    StoreKind::Spill => {
                        self.holds(pos, st, *sym, *src)?;
                        Some(*sym)
                    }
                    StoreKind::Save => st.regs[src.regidx()],
                };
                let slot = usize::from(*slot);
                match st.slots.get_mut(slot) {
                    Some(x) => {
                        *x = val;
                        Ok(())
                    }
                    None => Err(self.err(pos, format!("s{slot} is out of range"))),
                }
            }
            Inst::Load {
                kind,
                sym,
                slot,
                dst,
            } => {
                let slot = usize::from(*slot);
                let val = match kind {
                    LoadKind::Reload => {
                        self.slot_holds(pos, st, *sym, slot)?;
                        Some(*sym)
                    }
                    LoadKind::Restore => *st
                        .slots
                        .get(slot)
                        .ok_or_else(|| self.err(pos, format!("s{slot} is out of range")))?,
                };
                st.regs[dst.regidx()] = val;
                Ok(())
            }
            Inst::Remat { sym, dst, .. } => {
                st.regs[dst.regidx()] = Some(*sym);
                Ok(())
            }
            Inst::Copy { sym, src, dst } => {
                self.holds(pos, st, *sym, *src)?;
                st.regs[dst.regidx()] = Some(*sym);
                Ok(())
            }
            _ => self.operands(pos, inst, st),
        }
    }
}
