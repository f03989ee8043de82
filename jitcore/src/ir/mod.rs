//! The instruction list consumed by the register allocator and the encoder.
//!
//! A [Func] is handed to us by the instruction selection layer. It consists of:
//!
//!   * A list of symbolic values ([Sym]s). A [Sym] is typed (integer or float) and may be defined
//!     any number of times: the IR is *not* in SSA form.
//!   * A linear list of instructions ([Inst]s) whose operands refer to [Sym]s. Each instruction
//!     is in exactly one region.
//!   * A [RegionTree] describing the loop and scope nesting of the function.
//!   * Labels, jump tables, and lazy bailout annotations referenced by instructions.
//!
//! Register allocation rewrites the instruction list in place: every [Operand::Sym] becomes an
//! [Operand::Reg], and spill, reload, save, restore, remat, and copy instructions are inserted.
//! Allocated and unallocated instructions share a type so that both can be printed and parsed
//! in the same textual format, which is used extensively in tests:
//!
//! ```text
//! decl %0: int
//! decl %1: int noalloc
//! %0 = param 0
//! l0:
//! @1 %1 = add %1, %0
//! @1 cmp %1, %0
//! @1 jcc lt l0
//! ret %1
//! ```
//!
//! where `@1` denotes the region of an instruction (instructions without a prefix are in the root
//! region).

use crate::{
    arch::{RegClass, RegT},
    errors::CompilationError,
};
use smallvec::SmallVec;
use std::fmt;
use strum::{Display, EnumString};
use typed_index_collections::TiVec;

fn index_overflow(typ: &str) -> CompilationError {
    CompilationError::LimitExceeded(format!("index overflow: {typ}"))
}

// Generate an index type backed by the unsigned integer type `$ty`. Conversion from `usize` is
// unchecked (so that the type can key a [TiVec]): `new` is the checked equivalent.
macro_rules! index_type {
    ($(#[$attr:meta])* $struct:ident($ty:ty)) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $struct($ty);

        #[allow(dead_code)]
        impl $struct {
            /// Create an instance of `$struct`, failing if `v` exceeds the underlying type's
            /// bounds.
            pub fn new(v: usize) -> Result<Self, CompilationError> {
                <$ty>::try_from(v)
                    .map_err(|_| index_overflow(stringify!($struct)))
                    .map(Self)
            }
        }

        impl From<usize> for $struct {
            fn from(v: usize) -> Self {
                debug_assert!(<$ty>::try_from(v).is_ok());
                Self(v as $ty)
            }
        }

        impl From<$struct> for usize {
            fn from(s: $struct) -> usize {
                s.0 as usize
            }
        }

        impl fmt::Display for $struct {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                write!(f, "{}", self.0)
            }
        }
    };
}

pub mod region;
pub(crate) mod well_formed;
#[cfg(test)]
pub(crate) mod parser;

pub use region::{RegionIdx, RegionKind, RegionTree};

index_type!(
    /// An index into [Func]'s symbolic values.
    SymIdx(u32)
);
index_type!(
    /// A branch target.
    LabelIdx(u32)
);
index_type!(
    /// A stack slot. Slots are 8 bytes wide.
    SlotIdx(u32)
);
index_type!(
    /// An index into [Func]'s jump tables.
    JumpTableIdx(u16)
);
index_type!(
    /// An index into [Func]'s lazy bailout annotations.
    BailoutIdx(u32)
);

/// The identity of an inlined function. Opaque to us: it is passed through to the inline frame
/// map.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Ty {
    Int,
    Float,
}

impl Ty {
    pub fn class(&self) -> RegClass {
        match self {
            Ty::Int => RegClass::Int,
            Ty::Float => RegClass::Float,
        }
    }
}

/// A symbolic value.
#[derive(Clone, Debug, PartialEq)]
pub struct Sym {
    pub ty: Ty,
    /// This value must live on the stack for its whole life (e.g. because its address is taken).
    pub dont_allocate: bool,
}

impl Sym {
    pub fn new(ty: Ty) -> Self {
        Self {
            ty,
            dont_allocate: false,
        }
    }

    pub fn dont_allocate(mut self) -> Self {
        self.dont_allocate = true;
        self
    }
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand<R> {
    /// A value not yet assigned a location.
    Sym(SymIdx),
    /// A value in register `R`: only present after register allocation.
    Reg(SymIdx, R),
}

impl<R: RegT> Operand<R> {
    pub fn sym(&self) -> SymIdx {
        match self {
            Operand::Sym(s) | Operand::Reg(s, _) => *s,
        }
    }

    /// The register of this operand.
    ///
    /// # Panics
    ///
    /// If this operand has not been allocated.
    pub fn reg(&self) -> R {
        match self {
            Operand::Reg(_, r) => *r,
            Operand::Sym(s) => panic!("%{s} has not been allocated"),
        }
    }
}

impl<R: RegT> fmt::Display for Operand<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Sym(s) => write!(f, "%{s}"),
            Operand::Reg(s, r) => write!(f, "%{s}:{r}"),
        }
    }
}

#[derive(Copy, Clone, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub fn is_commutative(&self) -> bool {
        !matches!(self, BinOp::Sub)
    }
}

#[derive(Copy, Clone, Debug, Display, EnumString, Eq, PartialEq)]
pub enum FBinOp {
    #[strum(serialize = "fadd")]
    Add,
    #[strum(serialize = "fsub")]
    Sub,
    #[strum(serialize = "fmul")]
    Mul,
    #[strum(serialize = "fdiv")]
    Div,
}

impl FBinOp {
    pub fn is_commutative(&self) -> bool {
        matches!(self, FBinOp::Add | FBinOp::Mul)
    }
}

/// A condition tested by [Inst::Jcc] and [Inst::SetCc]. `Below`/`Above` and friends are the
/// unsigned (and floating point) comparisons.
#[derive(Copy, Clone, Debug, Display, EnumString, Eq, PartialEq)]
pub enum Cond {
    #[strum(serialize = "eq")]
    Eq,
    #[strum(serialize = "ne")]
    Ne,
    #[strum(serialize = "lt")]
    Lt,
    #[strum(serialize = "le")]
    Le,
    #[strum(serialize = "gt")]
    Gt,
    #[strum(serialize = "ge")]
    Ge,
    #[strum(serialize = "b")]
    Below,
    #[strum(serialize = "be")]
    BelowEq,
    #[strum(serialize = "a")]
    Above,
    #[strum(serialize = "ae")]
    AboveEq,
}

/// What sort of function a call invokes.
#[derive(Copy, Clone, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum CallKind {
    /// A call to arbitrary code, which may itself call back into the VM. Values live across such
    /// calls are moved out of caller-saved registers for the rest of their lives.
    User,
    /// A call to an out-of-line helper. Values live across such calls only vacate caller-saved
    /// registers for the duration of the call.
    Helper,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreKind {
    /// Move a value to its stack slot for the rest of its life.
    Spill,
    /// Temporarily preserve a value that will be restored shortly afterwards.
    Save,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadKind {
    /// Bring a spilled value back into a register.
    Reload,
    /// The counterpart of [StoreKind::Save].
    Restore,
}

/// An instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst<R> {
    /// Define `dst` as the `idx`th argument of `dst`'s class. Must only appear, contiguously, at
    /// the very start of a function.
    Param { dst: Operand<R>, idx: u16 },
    Label(LabelIdx),
    /// Load a constant. For float values `val` is the bit pattern of an `f64`.
    Const { dst: Operand<R>, val: i64 },
    Mov { dst: Operand<R>, src: Operand<R> },
    BinOp {
        op: BinOp,
        dst: Operand<R>,
        lhs: Operand<R>,
        rhs: Operand<R>,
    },
    FBinOp {
        op: FBinOp,
        dst: Operand<R>,
        lhs: Operand<R>,
        rhs: Operand<R>,
    },
    Cmp { lhs: Operand<R>, rhs: Operand<R> },
    SetCc { cond: Cond, dst: Operand<R> },
    Jmp(LabelIdx),
    Jcc { cond: Cond, tgt: LabelIdx },
    /// Jump to the `idx`th label of `table`. `idx` must be in range.
    Switch { idx: Operand<R>, table: JumpTableIdx },
    Call {
        kind: CallKind,
        addr: u64,
        args: SmallVec<[Operand<R>; 4]>,
        ret: Option<Operand<R>>,
        /// If set, this call is a lazy bailout point.
        bailout: Option<BailoutIdx>,
    },
    Ret(Option<Operand<R>>),
    /// A statement boundary.
    Stmt(u32),
    InlineeStart(FuncId),
    InlineeEnd,
    Store {
        kind: StoreKind,
        sym: SymIdx,
        src: R,
        slot: SlotIdx,
    },
    Load {
        kind: LoadKind,
        sym: SymIdx,
        slot: SlotIdx,
        dst: R,
    },
    /// Re-materialise the constant `val` of `sym` into `dst`.
    Remat { sym: SymIdx, dst: R, val: i64 },
    Copy { sym: SymIdx, src: R, dst: R },
}

/// Is an operand read or written?
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpRole {
    Use,
    Def,
}

impl<R: RegT> Inst<R> {
    /// Call `f` for every [Operand] of this instruction. Uses are always visited before defs.
    pub fn for_each_operand<F>(&self, mut f: F)
    where
        F: FnMut(&Operand<R>, OpRole),
    {
        match self {
            Inst::Param { dst, .. } | Inst::Const { dst, .. } | Inst::SetCc { dst, .. } => {
                f(dst, OpRole::Def)
            }
            Inst::Mov { dst, src } => {
                f(src, OpRole::Use);
                f(dst, OpRole::Def);
            }
            Inst::BinOp { dst, lhs, rhs, .. } | Inst::FBinOp { dst, lhs, rhs, .. } => {
                f(lhs, OpRole::Use);
                f(rhs, OpRole::Use);
                f(dst, OpRole::Def);
            }
            Inst::Cmp { lhs, rhs } => {
                f(lhs, OpRole::Use);
                f(rhs, OpRole::Use);
            }
            Inst::Switch { idx, .. } => f(idx, OpRole::Use),
            Inst::Call { args, ret, .. } => {
                for x in args {
                    f(x, OpRole::Use);
                }
                if let Some(x) = ret {
                    f(x, OpRole::Def);
                }
            }
            Inst::Ret(Some(x)) => f(x, OpRole::Use),
            Inst::Label(_)
            | Inst::Jmp(_)
            | Inst::Jcc { .. }
            | Inst::Ret(None)
            | Inst::Stmt(_)
            | Inst::InlineeStart(_)
            | Inst::InlineeEnd
            | Inst::Store { .. }
            | Inst::Load { .. }
            | Inst::Remat { .. }
            | Inst::Copy { .. } => (),
        }
    }

    /// Call `f` for every [Operand] of this instruction, allowing it to be altered. Uses are
    /// always visited before defs.
    pub fn for_each_operand_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Operand<R>, OpRole),
    {
        match self {
            Inst::Param { dst, .. } | Inst::Const { dst, .. } | Inst::SetCc { dst, .. } => {
                f(dst, OpRole::Def)
            }
            Inst::Mov { dst, src } => {
                f(src, OpRole::Use);
                f(dst, OpRole::Def);
            }
            Inst::BinOp { dst, lhs, rhs, .. } | Inst::FBinOp { dst, lhs, rhs, .. } => {
                f(lhs, OpRole::Use);
                f(rhs, OpRole::Use);
                f(dst, OpRole::Def);
            }
            Inst::Cmp { lhs, rhs } => {
                f(lhs, OpRole::Use);
                f(rhs, OpRole::Use);
            }
            Inst::Switch { idx, .. } => f(idx, OpRole::Use),
            Inst::Call { args, ret, .. } => {
                for x in args {
                    f(x, OpRole::Use);
                }
                if let Some(x) = ret {
                    f(x, OpRole::Def);
                }
            }
            Inst::Ret(Some(x)) => f(x, OpRole::Use),
            Inst::Label(_)
            | Inst::Jmp(_)
            | Inst::Jcc { .. }
            | Inst::Ret(None)
            | Inst::Stmt(_)
            | Inst::InlineeStart(_)
            | Inst::InlineeEnd
            | Inst::Store { .. }
            | Inst::Load { .. }
            | Inst::Remat { .. }
            | Inst::Copy { .. } => (),
        }
    }

    /// Call `f` for every value this instruction reads. A value read twice is passed twice.
    pub fn for_each_use<F: FnMut(SymIdx)>(&self, mut f: F) {
        self.for_each_operand(|op, role| {
            if role == OpRole::Use {
                f(op.sym())
            }
        });
    }

    /// Call `f` for every value this instruction writes.
    pub fn for_each_def<F: FnMut(SymIdx)>(&self, mut f: F) {
        self.for_each_operand(|op, role| {
            if role == OpRole::Def {
                f(op.sym())
            }
        });
    }

    /// Does control never continue to the next instruction?
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Jmp(_) | Inst::Switch { .. } | Inst::Ret(_))
    }

    /// Was this instruction inserted by the register allocator?
    pub fn is_alloc_inserted(&self) -> bool {
        matches!(
            self,
            Inst::Store { .. } | Inst::Load { .. } | Inst::Remat { .. } | Inst::Copy { .. }
        )
    }
}

/// A location from which a value can be recovered at a lazy bailout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryLoc<R> {
    /// A callee-saved register.
    Reg(R),
    Stack(SlotIdx),
    Const(i64),
}

impl<R: RegT> fmt::Display for RecoveryLoc<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryLoc::Reg(r) => write!(f, "{r}"),
            RecoveryLoc::Stack(s) => write!(f, "s{s}"),
            RecoveryLoc::Const(v) => write!(f, "#{v}"),
        }
    }
}

/// A lazy bailout annotation.
#[derive(Clone, Debug, PartialEq)]
pub struct Bailout<R> {
    /// The identifier the runtime uses to find the unoptimised code to resume in.
    pub id: u32,
    /// The values needed to resume execution. They are kept alive until the end of the annotated
    /// call.
    pub live: SmallVec<[SymIdx; 4]>,
    /// Where each of `live` can be found after the call: filled in by register allocation.
    pub locs: Vec<RecoveryLoc<R>>,
}

/// A function being compiled.
#[derive(Clone, Debug)]
pub struct Func<R> {
    pub name: String,
    syms: TiVec<SymIdx, Sym>,
    insts: Vec<Inst<R>>,
    /// The region of each instruction in `insts`.
    inst_regions: Vec<RegionIdx>,
    regions: RegionTree,
    num_labels: usize,
    jump_tables: TiVec<JumpTableIdx, Vec<LabelIdx>>,
    bailouts: TiVec<BailoutIdx, Bailout<R>>,
    /// How many stack slots does this function need? Only meaningful after allocation.
    num_slots: usize,
    allocated: bool,
}

impl<R: RegT> Func<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            syms: TiVec::new(),
            insts: Vec::new(),
            inst_regions: Vec::new(),
            regions: RegionTree::new(),
            num_labels: 0,
            jump_tables: TiVec::new(),
            bailouts: TiVec::new(),
            num_slots: 0,
            allocated: false,
        }
    }

    pub fn push_sym(&mut self, sym: Sym) -> Result<SymIdx, CompilationError> {
        SymIdx::new(self.syms.len())?;
        self.syms.raw.try_reserve(1)?;
        Ok(self.syms.push_and_get_key(sym))
    }

    pub fn sym(&self, idx: SymIdx) -> &Sym {
        &self.syms[idx]
    }

    pub fn syms_len(&self) -> usize {
        self.syms.len()
    }

    pub fn new_label(&mut self) -> Result<LabelIdx, CompilationError> {
        let l = LabelIdx::new(self.num_labels)?;
        self.num_labels += 1;
        Ok(l)
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn push_region(
        &mut self,
        parent: RegionIdx,
        kind: RegionKind,
    ) -> Result<RegionIdx, CompilationError> {
        self.regions.push(parent, kind)
    }

    pub fn regions(&self) -> &RegionTree {
        &self.regions
    }

    pub fn push_jump_table(
        &mut self,
        labels: Vec<LabelIdx>,
    ) -> Result<JumpTableIdx, CompilationError> {
        JumpTableIdx::new(self.jump_tables.len())?;
        self.jump_tables.raw.try_reserve(1)?;
        Ok(self.jump_tables.push_and_get_key(labels))
    }

    pub fn jump_table(&self, idx: JumpTableIdx) -> &[LabelIdx] {
        &self.jump_tables[idx]
    }

    pub fn jump_tables_len(&self) -> usize {
        self.jump_tables.len()
    }

    pub fn push_bailout<I>(&mut self, id: u32, live: I) -> Result<BailoutIdx, CompilationError>
    where
        I: IntoIterator<Item = SymIdx>,
    {
        BailoutIdx::new(self.bailouts.len())?;
        self.bailouts.raw.try_reserve(1)?;
        Ok(self.bailouts.push_and_get_key(Bailout {
            id,
            live: live.into_iter().collect(),
            locs: Vec::new(),
        }))
    }

    pub fn bailout(&self, idx: BailoutIdx) -> &Bailout<R> {
        &self.bailouts[idx]
    }

    pub(crate) fn bailout_mut(&mut self, idx: BailoutIdx) -> &mut Bailout<R> {
        &mut self.bailouts[idx]
    }

    pub fn bailouts_len(&self) -> usize {
        self.bailouts.len()
    }

    /// Append `inst`, in region `region`, to the end of the instruction list.
    pub fn push_inst(&mut self, region: RegionIdx, inst: Inst<R>) -> Result<(), CompilationError> {
        self.insts.try_reserve(1)?;
        self.inst_regions.try_reserve(1)?;
        self.insts.push(inst);
        self.inst_regions.push(region);
        Ok(())
    }

    pub fn insts(&self) -> &[Inst<R>] {
        &self.insts
    }

    pub fn inst_region(&self, pos: usize) -> RegionIdx {
        self.inst_regions[pos]
    }

    /// Take the instruction list (and the region of each instruction) out of this function.
    #[cfg(test)]
    pub(crate) fn take_insts(&mut self) -> (Vec<Inst<R>>, Vec<RegionIdx>) {
        (
            std::mem::take(&mut self.insts),
            std::mem::take(&mut self.inst_regions),
        )
    }

    /// Install the allocated instruction list.
    pub(crate) fn set_allocated(
        &mut self,
        insts: Vec<Inst<R>>,
        inst_regions: Vec<RegionIdx>,
        num_slots: usize,
    ) {
        debug_assert_eq!(insts.len(), inst_regions.len());
        self.insts = insts;
        self.inst_regions = inst_regions;
        self.num_slots = num_slots;
        self.allocated = true;
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Return a struct that implements [fmt::Display] for the instruction at `pos`.
    pub fn display_inst(&self, pos: usize) -> DisplayableInst<'_, R> {
        DisplayableInst {
            func: self,
            inst: &self.insts[pos],
        }
    }
}

impl<R: RegT> fmt::Display for Func<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "func {}", self.name)?;
        for (ridx, r) in self.regions.iter().skip(1) {
            match r.parent() {
                Some(p) => writeln!(f, "region {ridx}: {} parent {p}", r.kind())?,
                None => unreachable!(),
            }
        }
        for (sidx, sym) in self.syms.iter_enumerated() {
            write!(f, "decl %{sidx}: {}", sym.ty)?;
            if sym.dont_allocate {
                write!(f, " noalloc")?;
            }
            writeln!(f)?;
        }
        for (pos, rg) in self.inst_regions.iter().enumerate() {
            if *rg != RegionIdx::root() {
                write!(f, "@{rg} ")?;
            }
            writeln!(f, "{}", self.display_inst(pos))?;
        }
        Ok(())
    }
}

pub struct DisplayableInst<'a, R> {
    func: &'a Func<R>,
    inst: &'a Inst<R>,
}

impl<R: RegT> fmt::Display for DisplayableInst<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<R: RegT>(ops: &[Operand<R>]) -> String {
            ops.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        }

        match self.inst {
            Inst::Param { dst, idx } => write!(f, "{dst} = param {idx}"),
            Inst::Label(l) => write!(f, "l{l}:"),
            Inst::Const { dst, val } => match self.func.sym(dst.sym()).ty {
                Ty::Int => write!(f, "{dst} = const {val}"),
                Ty::Float => write!(f, "{dst} = const {:?}", f64::from_bits(*val as u64)),
            },
            Inst::Mov { dst, src } => write!(f, "{dst} = mov {src}"),
            Inst::BinOp { op, dst, lhs, rhs } => write!(f, "{dst} = {op} {lhs}, {rhs}"),
            Inst::FBinOp { op, dst, lhs, rhs } => write!(f, "{dst} = {op} {lhs}, {rhs}"),
            Inst::Cmp { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            Inst::SetCc { cond, dst } => write!(f, "{dst} = set {cond}"),
            Inst::Jmp(l) => write!(f, "jmp l{l}"),
            Inst::Jcc { cond, tgt } => write!(f, "jcc {cond} l{tgt}"),
            Inst::Switch { idx, table } => {
                let tgts = self
                    .func
                    .jump_table(*table)
                    .iter()
                    .map(|l| format!("l{l}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "switch {idx} [{tgts}]")
            }
            Inst::Call {
                kind,
                addr,
                args,
                ret,
                bailout,
            } => {
                if let Some(x) = ret {
                    write!(f, "{x} = ")?;
                }
                write!(f, "call {kind} {addr:#x}({})", join(args))?;
                if let Some(bidx) = bailout {
                    let b = self.func.bailout(*bidx);
                    let live = b
                        .live
                        .iter()
                        .enumerate()
                        .map(|(i, s)| match b.locs.get(i) {
                            Some(loc) => format!("%{s}={loc}"),
                            None => format!("%{s}"),
                        })
                        .collect::<Vec<_>>()
                        .join(" ");
                    write!(f, " [bailout {}: {live}]", b.id)?;
                }
                Ok(())
            }
            Inst::Ret(Some(x)) => write!(f, "ret {x}"),
            Inst::Ret(None) => write!(f, "ret"),
            Inst::Stmt(x) => write!(f, "stmt {x}"),
            Inst::InlineeStart(x) => write!(f, "inlinee_start {x}"),
            Inst::InlineeEnd => write!(f, "inlinee_end"),
            Inst::Store {
                kind,
                sym,
                src,
                slot,
            } => {
                let kind = match kind {
                    StoreKind::Spill => "spill",
                    StoreKind::Save => "save",
                };
                write!(f, "{kind} %{sym} {src} -> s{slot}")
            }
            Inst::Load {
                kind,
                sym,
                slot,
                dst,
            } => {
                let kind = match kind {
                    LoadKind::Reload => "reload",
                    LoadKind::Restore => "restore",
                };
                write!(f, "{kind} %{sym} s{slot} -> {dst}")
            }
            Inst::Remat { sym, dst, val } => write!(f, "remat %{sym} {dst} = {val}"),
            Inst::Copy { sym, src, dst } => write!(f, "copy %{sym} {src} -> {dst}"),
        }
    }
}
