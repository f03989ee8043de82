//! The x64 (System V ABI) registers.

use super::{RegClass, RegSet, RegT};
use strum::{EnumCount, FromRepr};

pub mod encode;

#[derive(Clone, Copy, Debug, EnumCount, Eq, FromRepr, Hash, PartialEq)]
// If the `repr` changes from `u8`, the `as` in the `Reg::regidx()` function will also need
// updating.
#[repr(u8)]
pub enum Reg {
    // The values we assign in this `enum` are irrelevant semantically, though if they're not
    // consecutive, per-register state will necessarily waste space. RSP and RBP are not
    // represented: they are the stack and frame pointers and are never allocated.
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,

    XMM0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

impl Reg {
    /// Is this a floating point register?
    pub fn is_fp(&self) -> bool {
        *self as u8 >= Reg::XMM0 as u8
    }

    /// Is this a general purpose register?
    pub fn is_gp(&self) -> bool {
        !self.is_fp()
    }

    /// The hardware encoding of this register (i.e. what dynasm's `Rq(...)` and `Rx(...)`
    /// expect).
    pub fn code(&self) -> u8 {
        match self {
            Reg::RAX => 0,
            Reg::RCX => 1,
            Reg::RDX => 2,
            Reg::RBX => 3,
            Reg::RSI => 6,
            Reg::RDI => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
            x => *x as u8 - Reg::XMM0 as u8,
        }
    }
}

impl RegT for Reg {
    const COUNT: usize = <Reg as EnumCount>::COUNT;

    fn regidx(&self) -> usize {
        *self as usize
    }

    fn from_regidx(idx: usize) -> Self {
        u8::try_from(idx)
            .ok()
            .and_then(Reg::from_repr)
            .unwrap_or_else(|| panic!("register index {idx} out of range"))
    }

    fn class(&self) -> RegClass {
        if self.is_fp() {
            RegClass::Float
        } else {
            RegClass::Int
        }
    }

    fn is_caller_saved(&self) -> bool {
        matches!(
            self,
            Reg::RAX
                | Reg::RDI
                | Reg::RSI
                | Reg::RDX
                | Reg::RCX
                | Reg::R8
                | Reg::R9
                | Reg::R10
                | Reg::R11
        ) || self.is_fp()
    }

    fn is_byte_addressable(&self) -> bool {
        // With a REX prefix, the low byte of every general purpose register is addressable.
        self.is_gp()
    }

    #[cfg(test)]
    fn from_str(s: &str) -> Option<Self> {
        (0..<Reg as EnumCount>::COUNT)
            .map(<Reg as RegT>::from_regidx)
            .find(|r| r.to_string() == s.to_lowercase())
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reg::RAX => "rax",
            Reg::RCX => "rcx",
            Reg::RDX => "rdx",
            Reg::RBX => "rbx",
            Reg::RSI => "rsi",
            Reg::RDI => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
            Reg::XMM0 => "xmm0",
            Reg::XMM1 => "xmm1",
            Reg::XMM2 => "xmm2",
            Reg::XMM3 => "xmm3",
            Reg::XMM4 => "xmm4",
            Reg::XMM5 => "xmm5",
            Reg::XMM6 => "xmm6",
            Reg::XMM7 => "xmm7",
            Reg::XMM8 => "xmm8",
            Reg::XMM9 => "xmm9",
            Reg::XMM10 => "xmm10",
            Reg::XMM11 => "xmm11",
            Reg::XMM12 => "xmm12",
            Reg::XMM13 => "xmm13",
            Reg::XMM14 => "xmm14",
            Reg::XMM15 => "xmm15",
        };
        write!(f, "{s}")
    }
}

/// The System V register table.
///
/// Caller-saved registers come first in the allocation order so that short lived values do not
/// force callee-saved registers to be preserved in the prologue. R10 and R11 are never allocated:
/// the encoder uses them as temporaries (R11 is also the allocator's integer scratch register), as
/// is XMM15 for floating point values.
pub fn register_set() -> RegSet<Reg> {
    RegSet::new(
        vec![
            Reg::RAX,
            Reg::RCX,
            Reg::RDX,
            Reg::RSI,
            Reg::RDI,
            Reg::R8,
            Reg::R9,
            Reg::RBX,
            Reg::R12,
            Reg::R13,
            Reg::R14,
            Reg::R15,
            Reg::XMM0,
            Reg::XMM1,
            Reg::XMM2,
            Reg::XMM3,
            Reg::XMM4,
            Reg::XMM5,
            Reg::XMM6,
            Reg::XMM7,
            Reg::XMM8,
            Reg::XMM9,
            Reg::XMM10,
            Reg::XMM11,
            Reg::XMM12,
            Reg::XMM13,
            Reg::XMM14,
        ],
        vec![Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9],
        vec![
            Reg::XMM0,
            Reg::XMM1,
            Reg::XMM2,
            Reg::XMM3,
            Reg::XMM4,
            Reg::XMM5,
            Reg::XMM6,
            Reg::XMM7,
        ],
        (Reg::RAX, Reg::XMM0),
        (Reg::R11, Reg::XMM15),
    )
}
