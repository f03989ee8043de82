//! A parser for the textual form of [Func]s (see the [super] module docs), so that tests can be
//! written concisely. Both unallocated and allocated instructions can be parsed. Parse errors
//! panic: this module only exists for testing.

use super::{
    BinOp, CallKind, Cond, FBinOp, Func, FuncId, Inst, LabelIdx, LoadKind, Operand, RegionIdx,
    RegionKind, SlotIdx, StoreKind, Sym, SymIdx, Ty,
};
use crate::arch::RegT;
use lazy_static::lazy_static;
use regex::Regex;
use smallvec::SmallVec;
use std::str::FromStr;

lazy_static! {
    static ref DECL_RE: Regex = Regex::new(r"^decl (%\d+): (int|float)( noalloc)?$").unwrap();
    static ref REGION_RE: Regex =
        Regex::new(r"^region (\d+): (loop|scope) parent (\d+)$").unwrap();
    static ref REGION_PREFIX_RE: Regex = Regex::new(r"^@(\d+)\s+(.*)$").unwrap();
    static ref LABEL_RE: Regex = Regex::new(r"^l(\d+):$").unwrap();
    static ref DEF_RE: Regex =
        Regex::new(r"^(%\d+(?::[a-z0-9]+)?)(?:: (int|float)( noalloc)?)? = (.*)$").unwrap();
    static ref OPERAND_RE: Regex = Regex::new(r"^%(\d+)(?::([a-z0-9]+))?$").unwrap();
    static ref BINOP_RE: Regex = Regex::new(r"^([a-z]+) (\S+), (\S+)$").unwrap();
    static ref CALL_RE: Regex = Regex::new(
        r"^call (user|helper) (0x[0-9a-fA-F]+|\d+)\(([^)]*)\)(?: \[bailout (\d+):([^\]]*)\])?$"
    )
    .unwrap();
    static ref SWITCH_RE: Regex = Regex::new(r"^switch (\S+) \[([^\]]*)\]$").unwrap();
    static ref STORE_RE: Regex =
        Regex::new(r"^(spill|save) %(\d+) ([a-z0-9]+) -> s(\d+)$").unwrap();
    static ref LOAD_RE: Regex =
        Regex::new(r"^(reload|restore) %(\d+) s(\d+) -> ([a-z0-9]+)$").unwrap();
    static ref REMAT_RE: Regex = Regex::new(r"^remat %(\d+) ([a-z0-9]+) = (-?\d+)$").unwrap();
    static ref COPY_RE: Regex =
        Regex::new(r"^copy %(\d+) ([a-z0-9]+) -> ([a-z0-9]+)$").unwrap();
}

/// Parse `s` into a [Func].
///
/// # Panics
///
/// If `s` is not a valid textual [Func].
pub(crate) fn str_to_func<R: RegT>(s: &str) -> Func<R> {
    let mut p = Parser {
        func: Func::new("test"),
        allocated: false,
        num_slots: 0,
    };
    for (i, line) in s.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") || line.starts_with("func ") {
            continue;
        }
        p.line(line)
            .unwrap_or_else(|e| panic!("line {}: {line}: {e}", i + 1));
    }
    if p.allocated {
        let (insts, regions) = p.func.take_insts();
        p.func.set_allocated(insts, regions, p.num_slots);
    }
    p.func
}

struct Parser<R: RegT> {
    func: Func<R>,
    allocated: bool,
    num_slots: usize,
}

impl<R: RegT> Parser<R> {
    fn line(&mut self, line: &str) -> Result<(), String> {
        if let Some(caps) = DECL_RE.captures(line) {
            self.def_sym(&caps[1], Some(&caps[2]), caps.get(3).is_some())?;
            return Ok(());
        }
        if let Some(caps) = REGION_RE.captures(line) {
            let idx = caps[1].parse::<usize>().map_err(|e| e.to_string())?;
            if idx != self.func.regions().len() {
                return Err(format!("region {idx} declared out of order"));
            }
            let kind = match &caps[2] {
                "loop" => RegionKind::Loop,
                _ => RegionKind::Scope,
            };
            let parent = RegionIdx::new(caps[3].parse::<usize>().map_err(|e| e.to_string())?)
                .map_err(|e| e.to_string())?;
            self.func
                .push_region(parent, kind)
                .map_err(|e| e.to_string())?;
            return Ok(());
        }

        let (region, line) = match REGION_PREFIX_RE.captures(line) {
            Some(caps) => (
                RegionIdx::new(caps[1].parse::<usize>().map_err(|e| e.to_string())?)
                    .map_err(|e| e.to_string())?,
                caps.get(2).unwrap().as_str(),
            ),
            None => (RegionIdx::root(), line),
        };
        let inst = self.inst(line)?;
        self.func.push_inst(region, inst).map_err(|e| e.to_string())
    }

    fn inst(&mut self, line: &str) -> Result<Inst<R>, String> {
        if let Some(caps) = LABEL_RE.captures(line) {
            return Ok(Inst::Label(self.label(&format!("l{}", &caps[1]))?));
        }
        if let Some(caps) = DEF_RE.captures(line) {
            let dst = self.def_sym(
                &caps[1],
                caps.get(2).map(|x| x.as_str()),
                caps.get(3).is_some(),
            )?;
            return self.def_inst(dst, &caps[4]);
        }
        if line.starts_with("call ") {
            return self.call(None, line);
        }
        if let Some(caps) = SWITCH_RE.captures(line) {
            let idx = self.operand(&caps[1])?;
            let labels = caps[2]
                .split(',')
                .map(|x| self.label(x.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            let table = self
                .func
                .push_jump_table(labels)
                .map_err(|e| e.to_string())?;
            return Ok(Inst::Switch { idx, table });
        }
        if let Some(caps) = STORE_RE.captures(line) {
            self.allocated = true;
            let kind = match &caps[1] {
                "spill" => StoreKind::Spill,
                _ => StoreKind::Save,
            };
            return Ok(Inst::Store {
                kind,
                sym: self.sym_idx(&caps[2])?,
                src: self.reg(&caps[3])?,
                slot: self.slot(&caps[4])?,
            });
        }
        if let Some(caps) = LOAD_RE.captures(line) {
            self.allocated = true;
            let kind = match &caps[1] {
                "reload" => LoadKind::Reload,
                _ => LoadKind::Restore,
            };
            return Ok(Inst::Load {
                kind,
                sym: self.sym_idx(&caps[2])?,
                slot: self.slot(&caps[3])?,
                dst: self.reg(&caps[4])?,
            });
        }
        if let Some(caps) = REMAT_RE.captures(line) {
            self.allocated = true;
            return Ok(Inst::Remat {
                sym: self.sym_idx(&caps[1])?,
                dst: self.reg(&caps[2])?,
                val: caps[3].parse::<i64>().map_err(|e| e.to_string())?,
            });
        }
        if let Some(caps) = COPY_RE.captures(line) {
            self.allocated = true;
            return Ok(Inst::Copy {
                sym: self.sym_idx(&caps[1])?,
                src: self.reg(&caps[2])?,
                dst: self.reg(&caps[3])?,
            });
        }

        let toks = line.split_whitespace().collect::<Vec<_>>();
        match toks.as_slice() {
            ["cmp", ..] => {
                let (lhs, rhs) = self.pair(line.trim_start_matches("cmp").trim())?;
                Ok(Inst::Cmp { lhs, rhs })
            }
            ["jmp", l] => Ok(Inst::Jmp(self.label(l)?)),
            ["jcc", cond, l] => Ok(Inst::Jcc {
                cond: Cond::from_str(cond).map_err(|e| e.to_string())?,
                tgt: self.label(l)?,
            }),
            ["ret"] => Ok(Inst::Ret(None)),
            ["ret", x] => Ok(Inst::Ret(Some(self.operand(x)?))),
            ["stmt", x] => Ok(Inst::Stmt(x.parse::<u32>().map_err(|e| e.to_string())?)),
            ["inlinee_start", x] => Ok(Inst::InlineeStart(FuncId(
                x.parse::<u32>().map_err(|e| e.to_string())?,
            ))),
            ["inlinee_end"] => Ok(Inst::InlineeEnd),
            _ => Err("unknown instruction".into()),
        }
    }

    /// Parse the right hand side of an instruction which defines `dst`.
    fn def_inst(&mut self, dst: Operand<R>, rhs: &str) -> Result<Inst<R>, String> {
        if rhs.starts_with("call ") {
            return self.call(Some(dst), rhs);
        }
        if let Some(caps) = BINOP_RE.captures(rhs) {
            let lhs = self.operand(&caps[2])?;
            let rhs = self.operand(&caps[3])?;
            if let Ok(op) = BinOp::from_str(&caps[1]) {
                return Ok(Inst::BinOp { op, dst, lhs, rhs });
            }
            if let Ok(op) = FBinOp::from_str(&caps[1]) {
                return Ok(Inst::FBinOp { op, dst, lhs, rhs });
            }
            return Err(format!("unknown binary operation '{}'", &caps[1]));
        }
        let toks = rhs.split_whitespace().collect::<Vec<_>>();
        match toks.as_slice() {
            ["param", idx] => Ok(Inst::Param {
                dst,
                idx: idx.parse::<u16>().map_err(|e| e.to_string())?,
            }),
            ["const", v] => {
                let val = match self.func.sym(dst.sym()).ty {
                    Ty::Int => v.parse::<i64>().map_err(|e| e.to_string())?,
                    Ty::Float => v.parse::<f64>().map_err(|e| e.to_string())?.to_bits() as i64,
                };
                Ok(Inst::Const { dst, val })
            }
            ["mov", src] => Ok(Inst::Mov {
                dst,
                src: self.operand(src)?,
            }),
            ["set", cond] => Ok(Inst::SetCc {
                cond: Cond::from_str(cond).map_err(|e| e.to_string())?,
                dst,
            }),
            _ => Err("unknown instruction".into()),
        }
    }

    fn call(&mut self, ret: Option<Operand<R>>, s: &str) -> Result<Inst<R>, String> {
        let caps = CALL_RE
            .captures(s)
            .ok_or_else(|| "malformed call".to_string())?;
        let kind = CallKind::from_str(&caps[1]).map_err(|e| e.to_string())?;
        let addr = match caps[2].strip_prefix("0x") {
            Some(x) => u64::from_str_radix(x, 16),
            None => caps[2].parse::<u64>(),
        }
        .map_err(|e| e.to_string())?;
        let args = caps[3]
            .split(',')
            .map(|x| x.trim())
            .filter(|x| !x.is_empty())
            .map(|x| self.operand(x))
            .collect::<Result<SmallVec<_>, _>>()?;
        let bailout = match caps.get(4) {
            Some(id) => {
                let id = id.as_str().parse::<u32>().map_err(|e| e.to_string())?;
                let live = caps[5]
                    .split_whitespace()
                    .map(|x| self.sym_idx(x.split('=').next().unwrap().trim_start_matches('%')))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(
                    self.func
                        .push_bailout(id, live)
                        .map_err(|e| e.to_string())?,
                )
            }
            None => None,
        };
        Ok(Inst::Call {
            kind,
            addr,
            args,
            ret,
            bailout,
        })
    }

    fn pair(&mut self, s: &str) -> Result<(Operand<R>, Operand<R>), String> {
        match s.split(',').map(|x| x.trim()).collect::<Vec<_>>().as_slice() {
            [lhs, rhs] => Ok((self.operand(lhs)?, self.operand(rhs)?)),
            _ => Err(format!("expected two operands in '{s}'")),
        }
    }

    /// Parse a use of an already declared value.
    fn operand(&mut self, s: &str) -> Result<Operand<R>, String> {
        let caps = OPERAND_RE
            .captures(s)
            .ok_or_else(|| format!("malformed operand '{s}'"))?;
        let sym = self.sym_idx(&caps[1])?;
        match caps.get(2) {
            Some(r) => {
                self.allocated = true;
                Ok(Operand::Reg(sym, self.reg(r.as_str())?))
            }
            None => Ok(Operand::Sym(sym)),
        }
    }

    /// Parse a value being defined, declaring it if `ty` is specified.
    fn def_sym(&mut self, s: &str, ty: Option<&str>, noalloc: bool) -> Result<Operand<R>, String> {
        let caps = OPERAND_RE
            .captures(s)
            .ok_or_else(|| format!("malformed operand '{s}'"))?;
        let n = caps[1].parse::<usize>().map_err(|e| e.to_string())?;
        if let Some(ty) = ty {
            let ty = Ty::from_str(ty).map_err(|e| e.to_string())?;
            if n == self.func.syms_len() {
                let sym = if noalloc {
                    Sym::new(ty).dont_allocate()
                } else {
                    Sym::new(ty)
                };
                self.func.push_sym(sym).map_err(|e| e.to_string())?;
            } else if n > self.func.syms_len() {
                return Err(format!("%{n} declared out of order"));
            } else if self.func.sym(SymIdx::from(n)).ty != ty {
                return Err(format!("%{n} redeclared with a different type"));
            }
        }
        self.operand(s)
    }

    fn sym_idx(&self, s: &str) -> Result<SymIdx, String> {
        let n = s
            .trim_start_matches('%')
            .parse::<usize>()
            .map_err(|e| e.to_string())?;
        if n >= self.func.syms_len() {
            return Err(format!("%{n} has not been declared"));
        }
        Ok(SymIdx::from(n))
    }

    fn label(&mut self, s: &str) -> Result<LabelIdx, String> {
        let n = s
            .strip_prefix('l')
            .ok_or_else(|| format!("malformed label '{s}'"))?
            .parse::<usize>()
            .map_err(|e| e.to_string())?;
        while self.func.num_labels() <= n {
            self.func.new_label().map_err(|e| e.to_string())?;
        }
        Ok(LabelIdx::from(n))
    }

    fn slot(&mut self, s: &str) -> Result<SlotIdx, String> {
        let n = s.parse::<usize>().map_err(|e| e.to_string())?;
        self.num_slots = self.num_slots.max(n + 1);
        SlotIdx::new(n).map_err(|e| e.to_string())
    }

    fn reg(&self, s: &str) -> Result<R, String> {
        R::from_str(s).ok_or_else(|| format!("unknown register '{s}'"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::x64::Reg;

    #[test]
    fn display_reparse() {
        let src = "
          region 1: loop parent 0
          %0: int = param 0
          %1: float = const 1.5
          %2: int noalloc = const -3
          l0:
          @1 %0 = add %0, %2
          @1 %1 = fmul %1, %1
          @1 cmp %0, %2
          @1 jcc ge l0
          %3: int = call user 0x1000(%0, %0) [bailout 7: %1 %2]
          %4: int = set lt
          switch %3 [l1, l2]
          l1:
          stmt 4
          inlinee_start 9
          inlinee_end
          ret %4
          l2:
          ret
        ";
        let f = str_to_func::<Reg>(src);
        let s1 = f.to_string();
        let s2 = str_to_func::<Reg>(&s1).to_string();
        assert_eq!(s1, s2);
        assert!(s1.contains("decl %2: int noalloc"));
        assert!(s1.contains("@1 jcc ge l0"));
        assert!(s1.contains("%1 = const 1.5"));
        assert!(s1.contains("%3 = call user 0x1000(%0, %0) [bailout 7: %1 %2]"));
        assert!(s1.contains("switch %3 [l1, l2]"));
        assert!(!f.is_allocated());
    }

    #[test]
    fn allocated() {
        let f = str_to_func::<Reg>(
            "
          decl %0: int
          %0:rdi = param 0
          spill %0 rdi -> s2
          reload %0 s2 -> rax
          remat %0 rcx = 5
          copy %0 rax -> rdx
          ret %0:rax
        ",
        );
        assert!(f.is_allocated());
        assert_eq!(f.num_slots(), 3);
        assert_eq!(f.display_inst(2).to_string(), "reload %0 s2 -> rax");
        assert_eq!(f.display_inst(5).to_string(), "ret %0:rax");
    }
}
