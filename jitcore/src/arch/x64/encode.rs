//! Encode allocated instructions as x64 machine code.
//!
//! Straight-line instructions are assembled with dynasm. Branches, the jump table base, and nops
//! change size (or are patched) during layout, so we encode them by hand.
//!
//! R10, R11, and XMM15 are never allocated: R11 and XMM15 are also the allocator's scratch
//! registers, but the allocator only uses them inside a sequence of copies or as the index of a
//! `switch`, so the instructions below can freely use them as temporaries. Jump table dispatch is
//! the one exception: it must read its index before writing R11.

use super::Reg;
use crate::{
    encode::{frame::Frame, EncodeTable},
    errors::CompilationError,
    ir::{BinOp, Cond, FBinOp, Func, Inst, Operand},
};
use dynasmrt::{dynasm, x64::X64Relocation, DynasmApi, VecAssembler};

type Asm = VecAssembler<X64Relocation>;

/// An integer temporary.
const TMP: Reg = Reg::R11;
/// A second integer temporary, only used by jump table dispatch to hold the table's address.
const TMP2: Reg = Reg::R10;
/// A floating point temporary.
const TMP_FP: Reg = Reg::XMM15;

/// The x64 [EncodeTable].
#[derive(Debug, Default)]
pub struct X64Encoder;

impl X64Encoder {
    pub fn new() -> Self {
        Self
    }
}

/// The low nibble of the opcode of `jcc`/`setcc` for `cond`.
fn cc(cond: Cond) -> u8 {
    match cond {
        Cond::Below => 0x2,
        Cond::AboveEq => 0x3,
        Cond::Eq => 0x4,
        Cond::Ne => 0x5,
        Cond::BelowEq => 0x6,
        Cond::Above => 0x7,
        Cond::Lt => 0xC,
        Cond::Ge => 0xD,
        Cond::Le => 0xE,
        Cond::Gt => 0xF,
    }
}

/// Move the bytes assembled in `asm` onto the end of `buf`.
fn finish(asm: Asm, buf: &mut Vec<u8>) -> Result<(), CompilationError> {
    let bytes = asm
        .finalize()
        .map_err(|e| CompilationError::InternalError(e.to_string()))?;
    buf.try_reserve(bytes.len())?;
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn mov(asm: &mut Asm, dst: Reg, src: Reg) {
    if dst == src {
        return;
    }
    if dst.is_fp() {
        dynasm!(asm; movsd Rx(dst.code()), Rx(src.code()));
    } else {
        dynasm!(asm; mov Rq(dst.code()), Rq(src.code()));
    }
}

/// Load the constant `val` (for floating point registers, the bit pattern of an `f64`) into
/// `reg`. Flags are left untouched.
fn load_const(asm: &mut Asm, reg: Reg, val: i64) {
    if reg.is_fp() {
        if val == 0 {
            dynasm!(asm; xorps Rx(reg.code()), Rx(reg.code()));
        } else {
            dynasm!(asm
                ; mov Rq(TMP.code()), QWORD val
                ; movq Rx(reg.code()), Rq(TMP.code())
            );
        }
    } else {
        match i32::try_from(val) {
            Ok(v) => dynasm!(asm; mov Rq(reg.code()), v),
            Err(_) => dynasm!(asm; mov Rq(reg.code()), QWORD val),
        }
    }
}

fn store(asm: &mut Asm, off: i32, src: Reg) {
    if src.is_fp() {
        dynasm!(asm; movsd QWORD [rbp - off], Rx(src.code()));
    } else {
        dynasm!(asm; mov QWORD [rbp - off], Rq(src.code()));
    }
}

fn load(asm: &mut Asm, dst: Reg, off: i32) {
    if dst.is_fp() {
        dynasm!(asm; movsd Rx(dst.code()), QWORD [rbp - off]);
    } else {
        dynasm!(asm; mov Rq(dst.code()), QWORD [rbp - off]);
    }
}

/// `lhs = lhs op rhs`.
fn binop(asm: &mut Asm, op: BinOp, lhs: Reg, rhs: Reg) {
    let (l, r) = (lhs.code(), rhs.code());
    match op {
        BinOp::Add => dynasm!(asm; add Rq(l), Rq(r)),
        BinOp::Sub => dynasm!(asm; sub Rq(l), Rq(r)),
        BinOp::Mul => dynasm!(asm; imul Rq(l), Rq(r)),
        BinOp::And => dynasm!(asm; and Rq(l), Rq(r)),
        BinOp::Or => dynasm!(asm; or Rq(l), Rq(r)),
        BinOp::Xor => dynasm!(asm; xor Rq(l), Rq(r)),
    }
}

/// `lhs = lhs op rhs`.
fn fbinop(asm: &mut Asm, op: FBinOp, lhs: Reg, rhs: Reg) {
    let (l, r) = (lhs.code(), rhs.code());
    match op {
        FBinOp::Add => dynasm!(asm; addsd Rx(l), Rx(r)),
        FBinOp::Sub => dynasm!(asm; subsd Rx(l), Rx(r)),
        FBinOp::Mul => dynasm!(asm; mulsd Rx(l), Rx(r)),
        FBinOp::Div => dynasm!(asm; divsd Rx(l), Rx(r)),
    }
}

/// Encode the three-address `dst = lhs op rhs` with the two-address `op`, which computes
/// `x = x op y`.
fn three_addr<F>(asm: &mut Asm, dst: Reg, lhs: Reg, rhs: Reg, commutative: bool, tmp: Reg, op: F)
where
    F: Fn(&mut Asm, Reg, Reg),
{
    if dst == lhs {
        op(asm, dst, rhs);
    } else if dst == rhs {
        if commutative {
            op(asm, dst, lhs);
        } else {
            mov(asm, tmp, lhs);
            op(asm, tmp, rhs);
            mov(asm, dst, tmp);
        }
    } else {
        mov(asm, dst, lhs);
        op(asm, dst, rhs);
    }
}

fn setcc(asm: &mut Asm, cond: Cond, dst: Reg) {
    let d = dst.code();
    match cond {
        Cond::Eq => dynasm!(asm; sete Rb(d)),
        Cond::Ne => dynasm!(asm; setne Rb(d)),
        Cond::Lt => dynasm!(asm; setl Rb(d)),
        Cond::Le => dynasm!(asm; setle Rb(d)),
        Cond::Gt => dynasm!(asm; setg Rb(d)),
        Cond::Ge => dynasm!(asm; setge Rb(d)),
        Cond::Below => dynasm!(asm; setb Rb(d)),
        Cond::BelowEq => dynasm!(asm; setbe Rb(d)),
        Cond::Above => dynasm!(asm; seta Rb(d)),
        Cond::AboveEq => dynasm!(asm; setae Rb(d)),
    }
    dynasm!(asm; movzx Rd(d), Rb(d));
}

fn reg(func: &Func<Reg>, op: &Operand<Reg>) -> Result<Reg, CompilationError> {
    match op {
        Operand::Reg(_, r) => Ok(*r),
        Operand::Sym(s) => Err(CompilationError::InternalError(format!(
            "{}: %{s} has not been allocated",
            func.name
        ))),
    }
}

impl EncodeTable<Reg> for X64Encoder {
    fn prologue(&self, frame: &Frame<Reg>, buf: &mut Vec<u8>) -> Result<(), CompilationError> {
        let mut asm = Asm::new(0);
        dynasm!(asm
            ; push rbp
            ; mov rbp, rsp
        );
        let size = frame.size();
        if size > 0 {
            dynasm!(asm; sub rsp, size);
        }
        for (r, off) in frame.callee_saves() {
            store(&mut asm, *off, *r);
        }
        finish(asm, buf)
    }

    fn inst(
        &self,
        func: &Func<Reg>,
        inst: &Inst<Reg>,
        frame: &Frame<Reg>,
        buf: &mut Vec<u8>,
    ) -> Result<(), CompilationError> {
        let mut asm = Asm::new(0);
        match inst {
            // Parameters arrive in the registers the allocator expects them in.
            Inst::Param { .. } => (),
            Inst::Const { dst, val } => load_const(&mut asm, reg(func, dst)?, *val),
            Inst::Mov { dst, src } => mov(&mut asm, reg(func, dst)?, reg(func, src)?),
            Inst::BinOp { op, dst, lhs, rhs } => three_addr(
                &mut asm,
                reg(func, dst)?,
                reg(func, lhs)?,
                reg(func, rhs)?,
                op.is_commutative(),
                TMP,
                |asm, x, y| binop(asm, *op, x, y),
            ),
            Inst::FBinOp { op, dst, lhs, rhs } => three_addr(
                &mut asm,
                reg(func, dst)?,
                reg(func, lhs)?,
                reg(func, rhs)?,
                op.is_commutative(),
                TMP_FP,
                |asm, x, y| fbinop(asm, *op, x, y),
            ),
            Inst::Cmp { lhs, rhs } => {
                let (l, r) = (reg(func, lhs)?, reg(func, rhs)?);
                if l.is_fp() {
                    dynasm!(asm; ucomisd Rx(l.code()), Rx(r.code()));
                } else {
                    dynasm!(asm; cmp Rq(l.code()), Rq(r.code()));
                }
            }
            Inst::SetCc { cond, dst } => setcc(&mut asm, *cond, reg(func, dst)?),
            Inst::Call { addr, .. } => {
                let addr = addr.cast_signed();
                dynasm!(asm
                    ; mov Rq(TMP.code()), QWORD addr
                    ; call Rq(TMP.code())
                );
            }
            Inst::Ret(_) => {
                for (r, off) in frame.callee_saves() {
                    load(&mut asm, *r, *off);
                }
                dynasm!(asm
                    ; mov rsp, rbp
                    ; pop rbp
                    ; ret
                );
            }
            Inst::Store { src, slot, .. } => store(&mut asm, frame.slot_off(*slot), *src),
            Inst::Load { slot, dst, .. } => load(&mut asm, *dst, frame.slot_off(*slot)),
            Inst::Remat { dst, val, .. } => load_const(&mut asm, *dst, *val),
            Inst::Copy { src, dst, .. } => mov(&mut asm, *dst, *src),
            Inst::Label(_)
            | Inst::Jmp(_)
            | Inst::Jcc { .. }
            | Inst::Switch { .. }
            | Inst::Stmt(_)
            | Inst::InlineeStart(_)
            | Inst::InlineeEnd => {
                return Err(CompilationError::InternalError(format!(
                    "{}: cannot encode '{}' as a single instruction",
                    func.name,
                    inst_name(inst)
                )))
            }
        }
        finish(asm, buf)
    }

    fn branch_len(&self, cond: Option<Cond>, short: bool) -> usize {
        match (cond, short) {
            (_, true) => 2,
            (None, false) => 5,
            (Some(_), false) => 6,
        }
    }

    fn branch(&self, cond: Option<Cond>, short: bool, disp: i32, buf: &mut Vec<u8>) {
        match (cond, short) {
            (None, true) => buf.push(0xEB),
            (Some(c), true) => buf.push(0x70 | cc(c)),
            (None, false) => buf.push(0xE9),
            (Some(c), false) => buf.extend([0x0F, 0x80 | cc(c)]),
        }
        if short {
            // Layout guarantees that short branches are in range.
            buf.push(disp as i8 as u8);
        } else {
            buf.extend(disp.to_le_bytes());
        }
    }

    fn table_base(&self, buf: &mut Vec<u8>) {
        // lea r10, [rip + disp32]
        buf.extend([0x4C, 0x8D, 0x15]);
    }

    fn table_jump(&self, idx: Reg, buf: &mut Vec<u8>) -> Result<(), CompilationError> {
        let mut asm = Asm::new(0);
        dynasm!(asm
            ; mov Rq(TMP.code()), QWORD [Rq(TMP2.code()) + Rq(idx.code()) * 8]
            ; add Rq(TMP.code()), Rq(TMP2.code())
            ; jmp Rq(TMP.code())
        );
        finish(asm, buf)
    }

    fn nops(&self, mut n: usize, buf: &mut Vec<u8>) {
        // From https://en.wikipedia.org/wiki/NOP_(code)
        while n > 0 {
            let bytes: &[u8] = match n {
                1 => &[0x90],
                2 => &[0x66, 0x90],
                3 => &[0x0F, 0x1F, 0x00],
                4 => &[0x0F, 0x1F, 0x40, 0x00],
                5 => &[0x0F, 0x1F, 0x44, 0x00, 0x00],
                6 => &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
                7 => &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
                8 => &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
                _ => &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            };
            buf.extend_from_slice(bytes);
            n -= bytes.len();
        }
    }
}

fn inst_name(inst: &Inst<Reg>) -> &'static str {
    match inst {
        Inst::Label(_) => "label",
        Inst::Jmp(_) => "jmp",
        Inst::Jcc { .. } => "jcc",
        Inst::Switch { .. } => "switch",
        Inst::Stmt(_) => "stmt",
        Inst::InlineeStart(_) => "inlinee_start",
        Inst::InlineeEnd => "inlinee_end",
        _ => "instruction",
    }
}
