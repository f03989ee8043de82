//! Check that a [Func] handed to us by the instruction selection layer is well-formed.
//!
//! The allocator and encoder assume, without further checking, that:
//!
//!   * every operand refers to a declared [Sym] of the right type for the instruction;
//!   * every label is defined exactly once, and every branch and jump table targets a defined
//!     label;
//!   * `param` instructions form a contiguous prefix of the function;
//!   * control never falls off the end of the function;
//!   * inlinee markers are balanced;
//!   * every instruction is in an existing region.
//!
//! Allocator-inserted instructions and allocated operands are rejected: a [Func] can only be
//! allocated once.

use super::{Func, Inst, LabelIdx, Operand, Ty};
use crate::{arch::RegT, errors::CompilationError};
use vob::Vob;

impl<R: RegT> Func<R> {
    pub(crate) fn assert_well_formed(&self) -> Result<(), CompilationError> {
        let err = |pos: usize, msg: String| {
            CompilationError::General(format!("{}: instruction {pos}: {msg}", self.name))
        };

        if self.is_allocated() {
            return Err(CompilationError::General(format!(
                "{}: function has already been allocated",
                self.name
            )));
        }

        let mut defined = Vob::from_elem(false, self.num_labels());
        let mut param_syms = Vob::from_elem(false, self.syms_len());
        let mut param_idxs = Vec::new();
        let mut in_params = true;
        let mut inlinee_depth = 0usize;
        for (pos, inst) in self.insts().iter().enumerate() {
            if self.regions().get(self.inst_region(pos)).is_none() {
                return Err(err(pos, "region does not exist".into()));
            }
            if inst.is_alloc_inserted() {
                return Err(err(pos, "allocator instruction in input".into()));
            }

            let mut bad_operand = None;
            inst.for_each_operand(|op, _| match op {
                Operand::Sym(s) if usize::from(*s) < self.syms_len() => (),
                Operand::Sym(s) => bad_operand = Some(format!("%{s} is not declared")),
                Operand::Reg(s, _) => bad_operand = Some(format!("%{s} is already allocated")),
            });
            if let Some(msg) = bad_operand {
                return Err(err(pos, msg));
            }

            let ty = |op: &Operand<R>| self.sym(op.sym()).ty;
            let check_label = |l: &LabelIdx| {
                if usize::from(*l) < self.num_labels() {
                    Ok(())
                } else {
                    Err(err(pos, format!("label l{l} does not exist")))
                }
            };
            match inst {
                Inst::Param { dst, idx } => {
                    if !in_params {
                        return Err(err(pos, "param after the start of the function".into()));
                    }
                    let s = usize::from(dst.sym());
                    if param_syms[s] {
                        return Err(err(pos, format!("%{s} is more than one param")));
                    }
                    param_syms.set(s, true);
                    if param_idxs.contains(&(ty(dst), *idx)) {
                        return Err(err(pos, format!("{} param {idx} defined twice", ty(dst))));
                    }
                    param_idxs.push((ty(dst), *idx));
                }
                Inst::Label(l) => {
                    check_label(l)?;
                    if defined[usize::from(*l)] {
                        return Err(err(pos, format!("label l{l} defined twice")));
                    }
                    defined.set(usize::from(*l), true);
                }
                Inst::BinOp { dst, lhs, rhs, .. } => {
                    if [dst, lhs, rhs].iter().any(|x| ty(x) != Ty::Int) {
                        return Err(err(pos, "integer operation on float values".into()));
                    }
                }
                Inst::FBinOp { dst, lhs, rhs, .. } => {
                    if [dst, lhs, rhs].iter().any(|x| ty(x) != Ty::Float) {
                        return Err(err(pos, "float operation on integer values".into()));
                    }
                }
                Inst::Mov { dst, src } => {
                    if ty(dst) != ty(src) {
                        return Err(err(pos, "mov between different types".into()));
                    }
                }
                Inst::Cmp { lhs, rhs } => {
                    if ty(lhs) != ty(rhs) {
                        return Err(err(pos, "cmp between different types".into()));
                    }
                }
                Inst::SetCc { dst, .. } | Inst::Switch { idx: dst, .. } => {
                    if ty(dst) != Ty::Int {
                        return Err(err(pos, "expected an integer value".into()));
                    }
                }
                Inst::Jmp(l) | Inst::Jcc { tgt: l, .. } => check_label(l)?,
                Inst::InlineeStart(_) => inlinee_depth += 1,
                Inst::InlineeEnd => {
                    inlinee_depth = inlinee_depth
                        .checked_sub(1)
                        .ok_or_else(|| err(pos, "unbalanced inlinee_end".into()))?;
                }
                Inst::Call { bailout, ret, .. } => {
                    if let Some(b) = bailout {
                        if usize::from(*b) >= self.bailouts_len() {
                            return Err(err(pos, format!("bailout {b} does not exist")));
                        }
                        if let Some(r) = ret {
                            if self.bailout(*b).live.contains(&r.sym()) {
                                return Err(err(
                                    pos,
                                    format!("bailout {b} needs %{}, which the call defines", r.sym()),
                                ));
                            }
                        }
                        if let Some(s) = self
                            .bailout(*b)
                            .live
                            .iter()
                            .find(|s| usize::from(**s) >= self.syms_len())
                        {
                            return Err(err(pos, format!("%{s} is not declared")));
                        }
                    }
                }
                _ => (),
            }
            if let Inst::Switch { table, .. } = inst {
                if usize::from(*table) >= self.jump_tables_len() {
                    return Err(err(pos, format!("jump table {table} does not exist")));
                }
                if self.jump_table(*table).is_empty() {
                    return Err(err(pos, "empty jump table".into()));
                }
                for l in self.jump_table(*table) {
                    check_label(l)?;
                }
            }
            if !matches!(inst, Inst::Param { .. }) {
                in_params = false;
            }
        }

        if let Some(l) = defined.iter_unset_bits(..).next() {
            return Err(CompilationError::General(format!(
                "{}: label l{l} is never defined",
                self.name
            )));
        }
        if inlinee_depth != 0 {
            return Err(CompilationError::General(format!(
                "{}: unbalanced inlinee_start",
                self.name
            )));
        }
        match self.insts().last() {
            Some(x) if x.is_terminator() => Ok(()),
            _ => Err(CompilationError::General(format!(
                "{}: control falls off the end of the function",
                self.name
            ))),
        }
    }
}
