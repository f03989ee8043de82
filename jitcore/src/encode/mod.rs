//! Lower an allocated [Func] to a relocatable machine code buffer and its side tables.
//!
//! Encoding happens in three steps:
//!
//!   1. The instruction list is turned into a list of [Item]s: runs of bytes whose encoding never
//!      changes; things whose size or contents depend on where code ends up (branches, alignment
//!      padding, jump table displacements); and zero-sized markers (labels, statement boundaries,
//!      inlinee boundaries, bailout points).
//!   2. Layout gives every item an offset. If enabled, branches are then optimistically shortened
//!      and the layout recomputed: any branch which no longer reaches its target is individually
//!      reverted to its long form and never tried again. This repeats until nothing changes.
//!   3. The buffer is emitted, followed by the jump tables. A CRC32 of the buffer is accumulated
//!      as it is emitted and compared against one computed over the finished buffer.
//!
//! The architecture specific parts of encoding are provided by an [EncodeTable].

pub mod frame;

use crate::{
    arch::RegT,
    config::Config,
    errors::CompilationError,
    ir::{
        BailoutIdx, Cond, Func, FuncId, Inst, JumpTableIdx, LabelIdx, Operand, RecoveryLoc, SymIdx,
    },
    log::stats::{Counter, Counters},
};
use flate2::Crc;
use frame::Frame;
use indexmap::IndexMap;
use std::{error::Error, marker::PhantomData};
use typed_index_collections::TiVec;
use vob::Vob;

/// The architecture specific half of the encoder.
pub trait EncodeTable<R: RegT> {
    /// Encode the function entry sequence for `frame` onto the end of `buf`.
    fn prologue(&self, frame: &Frame<R>, buf: &mut Vec<u8>) -> Result<(), CompilationError>;

    /// Encode `inst` onto the end of `buf`. `inst` is never a label, branch, switch, or marker.
    /// Returns (including the frame teardown) must be encoded in full.
    fn inst(
        &self,
        func: &Func<R>,
        inst: &Inst<R>,
        frame: &Frame<R>,
        buf: &mut Vec<u8>,
    ) -> Result<(), CompilationError>;

    /// The length in bytes of an unconditional (`cond == None`) or conditional branch.
    fn branch_len(&self, cond: Option<Cond>, short: bool) -> usize;

    /// Encode a branch whose target is `disp` bytes from the end of the branch. If `short` is
    /// true, `disp` is guaranteed to fit in an `i8`.
    fn branch(&self, cond: Option<Cond>, short: bool, disp: i32, buf: &mut Vec<u8>);

    /// Encode the start of an instruction which loads the address of a jump table. The encoder
    /// appends a 32-bit displacement from the end of the instruction to the table.
    fn table_base(&self, buf: &mut Vec<u8>);

    /// Jump to the `idx`th entry of the table whose address [EncodeTable::table_base] loaded.
    /// Each entry is a 64-bit offset from the start of the table. `idx` may be the integer scratch
    /// register, so neither this nor [EncodeTable::table_base] may clobber it before reading it.
    fn table_jump(&self, idx: R, buf: &mut Vec<u8>) -> Result<(), CompilationError>;

    /// Encode exactly `n` bytes of no-ops.
    fn nops(&self, n: usize, buf: &mut Vec<u8>);
}

/// Where a value can be found when a lazy bailout is taken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BailoutLoc<R> {
    /// A callee-saved register.
    Reg(R),
    /// The frame pointer minus this offset.
    Frame(i32),
    Const(i64),
}

/// A lazy bailout point.
#[derive(Clone, Debug, PartialEq)]
pub struct BailoutRecord<R> {
    /// The offset of the end of the call: i.e. the return address, relative to the start of the
    /// buffer.
    pub off: usize,
    pub id: u32,
    /// Each value needed to resume execution and where it can be found.
    pub live: Vec<(SymIdx, BailoutLoc<R>)>,
}

/// The code of an inlined function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InlineFrame {
    pub func: FuncId,
    pub start: usize,
    pub end: usize,
    /// How many inline frames enclose this one.
    pub depth: usize,
}

/// A jump table entry which must be updated if the buffer is split or moved relative to its
/// tables.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JumpTableReloc {
    /// The offset of the 64-bit entry.
    pub off: usize,
    /// The offset of the start of the table the entry is in.
    pub table_off: usize,
    /// The offset the entry jumps to.
    pub target: usize,
}

/// An encoded function.
#[derive(Clone, Debug)]
pub struct EncodedFunc<R> {
    /// The code, followed by the jump tables.
    pub code: Vec<u8>,
    /// The length of the code: jump tables start at the next 8 byte boundary.
    pub code_len: usize,
    pub label_offs: TiVec<LabelIdx, usize>,
    /// `(offset, statement)` pairs in ascending offset order. Empty unless
    /// [Config::track_statements] is set.
    pub stmt_map: Vec<(usize, u32)>,
    /// In order of start offset.
    pub inline_frames: Vec<InlineFrame>,
    pub relocs: Vec<JumpTableReloc>,
    /// In order of offset.
    pub bailouts: Vec<BailoutRecord<R>>,
    /// The CRC32 of `code`.
    pub checksum: u32,
}

impl<R: RegT> EncodedFunc<R> {
    /// Does `code` still match `checksum`?
    pub fn verify_checksum(&self) -> bool {
        let mut crc = Crc::new();
        crc.update(&self.code);
        crc.sum() == self.checksum
    }

    /// Disassemble the code (not including jump tables), annotated with labels and side table
    /// entries. If `with_offs` is true, each instruction is prefixed by its offset.
    pub fn disassemble(&self, with_offs: bool) -> Result<String, Box<dyn Error>> {
        let mut comments: IndexMap<usize, Vec<String>> = IndexMap::new();
        for (l, off) in self.label_offs.iter_enumerated() {
            comments.entry(*off).or_default().push(format!("l{l}:"));
        }
        for (off, stmt) in &self.stmt_map {
            comments.entry(*off).or_default().push(format!("stmt {stmt}"));
        }
        for fr in &self.inline_frames {
            comments
                .entry(fr.start)
                .or_default()
                .push(format!("inlinee_start {}", fr.func));
            comments
                .entry(fr.end)
                .or_default()
                .push(format!("inlinee_end {}", fr.func));
        }
        for b in &self.bailouts {
            let live = b
                .live
                .iter()
                .map(|(s, loc)| match loc {
                    BailoutLoc::Reg(r) => format!("%{s}={r}"),
                    BailoutLoc::Frame(off) => format!("%{s}=[fp-{off:#x}]"),
                    BailoutLoc::Const(v) => format!("%{s}=#{v}"),
                })
                .collect::<Vec<_>>()
                .join(" ");
            comments
                .entry(b.off)
                .or_default()
                .push(format!("bailout {}: {live}", b.id));
        }

        let mut out = Vec::new();
        let fmt = zydis::Formatter::intel();
        let dec = zydis::Decoder::new64();
        for insn_info in dec.decode_all::<zydis::VisibleOperands>(&self.code[..self.code_len], 0) {
            let (ip, _raw_bytes, insn) = insn_info?;
            let off = usize::try_from(ip)?;
            if let Some(lines) = comments.get(&off) {
                for line in lines {
                    out.push(format!("; {line}"));
                }
            }
            let istr = fmt.format(Some(ip), &insn)?;
            if with_offs {
                out.push(format!("{off:08x}: {istr}"));
            } else {
                out.push(istr);
            }
        }
        for r in &self.relocs {
            out.push(format!(
                "; table {:#x} entry {:#x}: {:#x}",
                r.table_off, r.off, r.target
            ));
        }
        Ok(out.join("\n"))
    }
}

/// A unit of layout.
#[derive(Debug)]
enum Item {
    Bytes(Vec<u8>),
    /// Pad with no-ops to a multiple of this many bytes.
    Align(usize),
    Label(LabelIdx),
    /// A branch. `idx` is this branch's index into [LayoutState::short].
    Branch {
        cond: Option<Cond>,
        tgt: LabelIdx,
        idx: usize,
    },
    /// The 32-bit displacement from the end of this item to a jump table.
    TableDisp(JumpTableIdx),
    Stmt(u32),
    InlineeStart(FuncId),
    InlineeEnd,
    Bailout(BailoutIdx),
}

/// Labels which are the target of a later branch.
fn loop_headers<R: RegT>(func: &Func<R>) -> Vob {
    let mut seen = Vob::from_elem(false, func.num_labels());
    let mut headers = Vob::from_elem(false, func.num_labels());
    let mut backedge = |l: &LabelIdx, seen: &Vob| {
        if seen[usize::from(*l)] {
            headers.set(usize::from(*l), true);
        }
    };
    for inst in func.insts() {
        match inst {
            Inst::Label(l) => {
                seen.set(usize::from(*l), true);
            }
            Inst::Jmp(l) | Inst::Jcc { tgt: l, .. } => backedge(l, &seen),
            Inst::Switch { table, .. } => {
                for l in func.jump_table(*table) {
                    backedge(l, &seen);
                }
            }
            _ => (),
        }
    }
    headers
}

struct ItemsBuilder<'a, R: RegT, E: EncodeTable<R>> {
    func: &'a Func<R>,
    table: &'a E,
    frame: &'a Frame<R>,
    items: Vec<Item>,
    num_branches: usize,
}

impl<'a, R: RegT, E: EncodeTable<R>> ItemsBuilder<'a, R, E> {
    fn push(&mut self, item: Item) -> Result<(), CompilationError> {
        self.items.try_reserve(1)?;
        self.items.push(item);
        Ok(())
    }

    /// The byte buffer at the end of the item list.
    fn bytes(&mut self) -> Result<&mut Vec<u8>, CompilationError> {
        if !matches!(self.items.last(), Some(Item::Bytes(_))) {
            self.push(Item::Bytes(Vec::new()))?;
        }
        match self.items.last_mut() {
            Some(Item::Bytes(b)) => Ok(b),
            _ => unreachable!(),
        }
    }

    fn branch(&mut self, cond: Option<Cond>, tgt: LabelIdx) -> Result<(), CompilationError> {
        let idx = self.num_branches;
        self.num_branches += 1;
        self.push(Item::Branch { cond, tgt, idx })
    }

    fn build(mut self, cfg: &Config) -> Result<(Vec<Item>, usize), CompilationError> {
        let (func, table, frame) = (self.func, self.table, self.frame);
        let headers = loop_headers(func);
        let align = usize::try_from(cfg.loop_align)
            .map_err(|_| CompilationError::LimitExceeded("loop alignment".into()))?;

        table.prologue(frame, self.bytes()?)?;
        for inst in func.insts() {
            match inst {
                Inst::Label(l) => {
                    if align > 1 && headers[usize::from(*l)] {
                        self.push(Item::Align(align))?;
                    }
                    self.push(Item::Label(*l))?;
                }
                Inst::Jmp(l) => self.branch(None, *l)?,
                Inst::Jcc { cond, tgt } => self.branch(Some(*cond), *tgt)?,
                Inst::Switch { idx, table: t } => {
                    let idx = match idx {
                        Operand::Reg(_, r) => *r,
                        Operand::Sym(_) => {
                            return Err(CompilationError::InternalError(format!(
                                "{}: switch on unallocated %{}",
                                func.name,
                                idx.sym()
                            )))
                        }
                    };
                    table.table_base(self.bytes()?);
                    self.push(Item::TableDisp(*t))?;
                    table.table_jump(idx, self.bytes()?)?;
                }
                Inst::Stmt(x) => {
                    if cfg.track_statements {
                        self.push(Item::Stmt(*x))?;
                    }
                }
                Inst::InlineeStart(f) => self.push(Item::InlineeStart(*f))?,
                Inst::InlineeEnd => self.push(Item::InlineeEnd)?,
                Inst::Call { bailout, .. } => {
                    table.inst(func, inst, frame, self.bytes()?)?;
                    if let Some(b) = bailout {
                        self.push(Item::Bailout(*b))?;
                    }
                }
                _ => table.inst(func, inst, frame, self.bytes()?)?,
            }
        }
        Ok((self.items, self.num_branches))
    }
}

/// `to - from`, if it fits in an `i64`.
fn delta(to: usize, from: usize) -> Option<i64> {
    if to >= from {
        i64::try_from(to - from).ok()
    } else {
        i64::try_from(from - to).ok().map(|x| -x)
    }
}

/// Everything layout computes. Cheap to copy, so that speculative changes can be checkpointed.
#[derive(Clone, Debug, PartialEq)]
struct LayoutState {
    /// The offset of each item.
    offs: Vec<usize>,
    label_offs: TiVec<LabelIdx, usize>,
    /// Which branches are in their short form.
    short: Vob,
    /// Branches which were shortened, but then didn't reach their target: they stay long.
    long_only: Vob,
    /// The length of the code.
    len: usize,
    /// How many bytes of alignment padding there are.
    padding: usize,
}

struct Layout<'a, R: RegT, E: EncodeTable<R>> {
    table: &'a E,
    items: &'a [Item],
    state: LayoutState,
    phantom: PhantomData<R>,
}

impl<'a, R: RegT, E: EncodeTable<R>> Layout<'a, R, E> {
    fn new(table: &'a E, items: &'a [Item], num_branches: usize, num_labels: usize) -> Self {
        let mut l = Self {
            table,
            items,
            state: LayoutState {
                offs: vec![0; items.len()],
                label_offs: TiVec::from(vec![0; num_labels]),
                short: Vob::from_elem(false, num_branches),
                long_only: Vob::from_elem(false, num_branches),
                len: 0,
                padding: 0,
            },
            phantom: PhantomData,
        };
        l.relayout();
        l
    }

    /// The size of `item` if it starts at `off`.
    fn size(&self, item: &Item, off: usize) -> usize {
        match item {
            Item::Bytes(b) => b.len(),
            Item::Align(n) => off.next_multiple_of(*n) - off,
            Item::Branch { cond, idx, .. } => self.table.branch_len(*cond, self.state.short[*idx]),
            Item::TableDisp(_) => 4,
            Item::Label(_)
            | Item::Stmt(_)
            | Item::InlineeStart(_)
            | Item::InlineeEnd
            | Item::Bailout(_) => 0,
        }
    }

    /// Recompute every offset from the current branch forms.
    fn relayout(&mut self) {
        let mut off = 0;
        let mut padding = 0;
        for (i, item) in self.items.iter().enumerate() {
            self.state.offs[i] = off;
            let size = self.size(item, off);
            match item {
                Item::Label(l) => self.state.label_offs[*l] = off,
                Item::Align(_) => padding += size,
                _ => (),
            }
            off += size;
        }
        self.state.len = off;
        self.state.padding = padding;
    }

    /// The displacement from the end of the item at `i`, which must be a branch, to its target.
    fn disp(&self, i: usize) -> Option<i64> {
        match &self.items[i] {
            Item::Branch { tgt, .. } => {
                let end = self.state.offs[i] + self.size(&self.items[i], self.state.offs[i]);
                delta(self.state.label_offs[*tgt], end)
            }
            _ => None,
        }
    }

    fn reaches_short(&self, i: usize) -> bool {
        self.disp(i).is_some_and(|x| i8::try_from(x).is_ok())
    }

    /// Shorten as many branches as possible, returning how many branches are short. Calling this
    /// again changes nothing.
    fn shorten(&mut self) -> usize {
        loop {
            let checkpoint = self.state.clone();
            for (i, item) in self.items.iter().enumerate() {
                if let Item::Branch { idx, .. } = item {
                    if !self.state.short[*idx]
                        && !self.state.long_only[*idx]
                        && self.reaches_short(i)
                    {
                        self.state.short.set(*idx, true);
                    }
                }
            }
            self.relayout();
            // Branches mostly get closer to their targets as others shrink, but a label's
            // alignment padding can grow.
            let mut missed = Vec::new();
            for (i, item) in self.items.iter().enumerate() {
                if let Item::Branch { idx, .. } = item {
                    if self.state.short[*idx] && !self.reaches_short(i) {
                        missed.push(*idx);
                    }
                }
            }
            if missed.is_empty() {
                if self.state.short == checkpoint.short {
                    break;
                }
                continue;
            }
            self.state = checkpoint;
            for idx in missed {
                self.state.short.set(idx, false);
                self.state.long_only.set(idx, true);
            }
            self.relayout();
        }
        self.state.short.iter_set_bits(..).count()
    }
}

/// Encode the allocated function `func`. `callee_saved` are the callee-saved registers the
/// allocated code writes to.
pub(crate) fn encode<R: RegT, E: EncodeTable<R>>(
    func: &Func<R>,
    callee_saved: &[R],
    table: &E,
    cfg: &Config,
    counters: &mut Counters,
) -> Result<EncodedFunc<R>, CompilationError> {
    if !func.is_allocated() {
        return Err(CompilationError::InternalError(format!(
            "{}: function has not been allocated",
            func.name
        )));
    }
    let frame = Frame::new(callee_saved, func.num_slots())?;
    let (items, num_branches) = ItemsBuilder {
        func,
        table,
        frame: &frame,
        items: Vec::new(),
        num_branches: 0,
    }
    .build(cfg)?;
    let mut layout = Layout::new(table, &items, num_branches, func.num_labels());
    if cfg.shorten_branches {
        let n = layout.shorten();
        counters.add(Counter::BranchShortened, u64::try_from(n).unwrap_or(u64::MAX));
    }
    counters.add(
        Counter::PaddingBytes,
        u64::try_from(layout.state.padding).unwrap_or(u64::MAX),
    );
    emit(func, &frame, &layout)
}

#[cfg(test)]
thread_local! {
    /// An offset at which [emit] flips a bit after patching, before the code is checked.
    static CORRUPT_AT: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

fn emit<R: RegT, E: EncodeTable<R>>(
    func: &Func<R>,
    frame: &Frame<R>,
    layout: &Layout<'_, R, E>,
) -> Result<EncodedFunc<R>, CompilationError> {
    let err = |msg: String| CompilationError::InternalError(format!("{}: {msg}", func.name));
    let st = &layout.state;

    let tables_off = st.len.next_multiple_of(8);
    let mut table_offs = Vec::with_capacity(func.jump_tables_len());
    let mut len = tables_off;
    for t in 0..func.jump_tables_len() {
        table_offs.push(len);
        len += func.jump_table(JumpTableIdx::from(t)).len() * 8;
    }

    // Branches and jump table displacements are encoded into `patches` and written over
    // placeholders once every item is in place. The checksum is accumulated from the encodings
    // themselves, and only compared with the finished buffer at the end.
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    let mut crc = Crc::new();
    let mut patches = Vec::new();
    let mut stmt_map = Vec::new();
    let mut inline_frames = Vec::new();
    let mut open_frames = Vec::new();
    let mut bailouts = Vec::new();
    for (i, item) in layout.items.iter().enumerate() {
        let start = buf.len();
        if start != st.offs[i] {
            return Err(err(format!(
                "item {i} emitted at {start:#x} but laid out at {:#x}",
                st.offs[i]
            )));
        }
        match item {
            Item::Bytes(b) => {
                buf.extend_from_slice(b);
                crc.update(b);
            }
            Item::Align(_) => {
                layout.table.nops(layout.size(item, start), &mut buf);
                crc.update(&buf[start..]);
            }
            Item::Label(_) => (),
            Item::Branch { cond, idx, .. } => {
                let short = st.short[*idx];
                let disp = layout
                    .disp(i)
                    .and_then(|x| i32::try_from(x).ok())
                    .filter(|x| !short || i8::try_from(*x).is_ok())
                    .ok_or_else(|| err(format!("branch at {start:#x} out of range")))?;
                let mut enc = Vec::new();
                layout.table.branch(*cond, short, disp, &mut enc);
                if enc.len() != layout.size(item, start) {
                    return Err(err(format!(
                        "branch at {start:#x} is {} bytes but was laid out as {}",
                        enc.len(),
                        layout.size(item, start)
                    )));
                }
                crc.update(&enc);
                buf.resize(start + enc.len(), 0);
                patches.push((start, enc));
            }
            Item::TableDisp(t) => {
                let disp = delta(table_offs[usize::from(*t)], start + 4)
                    .and_then(|x| i32::try_from(x).ok())
                    .ok_or_else(|| {
                        CompilationError::LimitExceeded("jump table out of range".into())
                    })?;
                let enc = disp.to_le_bytes().to_vec();
                crc.update(&enc);
                buf.resize(start + enc.len(), 0);
                patches.push((start, enc));
            }
            Item::Stmt(x) => stmt_map.push((start, *x)),
            Item::InlineeStart(f) => {
                open_frames.push(inline_frames.len());
                inline_frames.push(InlineFrame {
                    func: *f,
                    start,
                    end: start,
                    depth: open_frames.len() - 1,
                });
            }
            Item::InlineeEnd => {
                let j = open_frames
                    .pop()
                    .ok_or_else(|| err("unbalanced inlinee_end".into()))?;
                inline_frames[j].end = start;
            }
            Item::Bailout(b) => {
                let b = func.bailout(*b);
                if b.locs.len() != b.live.len() {
                    return Err(err(format!(
                        "bailout {} has no recovery locations",
                        b.id
                    )));
                }
                let live = b
                    .live
                    .iter()
                    .zip(&b.locs)
                    .map(|(s, loc)| {
                        let loc = match loc {
                            RecoveryLoc::Reg(r) => BailoutLoc::Reg(*r),
                            RecoveryLoc::Stack(slot) => BailoutLoc::Frame(frame.slot_off(*slot)),
                            RecoveryLoc::Const(v) => BailoutLoc::Const(*v),
                        };
                        (*s, loc)
                    })
                    .collect();
                bailouts.push(BailoutRecord {
                    off: start,
                    id: b.id,
                    live,
                });
            }
        }
    }
    if buf.len() != st.len {
        return Err(err(format!(
            "code is {:#x} bytes but was laid out as {:#x}",
            buf.len(),
            st.len
        )));
    }
    let code_len = buf.len();
    for (off, enc) in &patches {
        buf[*off..*off + enc.len()].copy_from_slice(enc);
    }

    crc.update(&[0; 8][..tables_off - code_len]);
    buf.resize(tables_off, 0);
    let mut relocs = Vec::new();
    for (t, table_off) in table_offs.iter().enumerate() {
        for l in func.jump_table(JumpTableIdx::from(t)) {
            let off = buf.len();
            let target = st.label_offs[*l];
            let entry = delta(target, *table_off)
                .ok_or_else(|| CompilationError::LimitExceeded("jump table entry".into()))?;
            crc.update(&entry.to_le_bytes());
            buf.extend(entry.to_le_bytes());
            relocs.push(JumpTableReloc {
                off,
                table_off: *table_off,
                target,
            });
        }
    }

    #[cfg(test)]
    CORRUPT_AT.with(|c| {
        if let Some(b) = c.take().and_then(|off| buf.get_mut(off)) {
            *b ^= 0x01;
        }
    });

    let checksum = crc.sum();
    let mut check = Crc::new();
    check.update(&buf);
    if check.sum() != checksum {
        return Err(err("checksum mismatch".into()));
    }

    bailouts.sort_by_key(|b| b.off);
    Ok(EncodedFunc {
        code: buf,
        code_len,
        label_offs: st.label_offs.clone(),
        stmt_map,
        inline_frames,
        relocs,
        bailouts,
        checksum,
    })
}
