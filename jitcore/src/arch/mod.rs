//! The architecture parameters of the allocator and encoder.
//!
//! Nothing in the allocator hardcodes a register: it sees registers only through [RegT] (what
//! class a register is in and which subsets it belongs to) and [RegSet] (the per-architecture
//! table of allocatable, argument, return, and scratch registers).

use std::fmt;

pub mod x64;

/// The two classes of register. A value of one class can never live in a register of the other.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum RegClass {
    Int,
    Float,
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegClass::Int => write!(f, "int"),
            RegClass::Float => write!(f, "float"),
        }
    }
}

/// A physical register.
pub trait RegT:
    Copy + Clone + fmt::Debug + fmt::Display + Eq + PartialEq + Send + Sync + 'static
{
    /// The number of registers: [RegT::regidx] must return a value in `0..COUNT`. At most 64.
    const COUNT: usize;

    /// A dense index for this register, suitable for indexing per-register state.
    fn regidx(&self) -> usize;

    /// The inverse of [RegT::regidx].
    ///
    /// # Panics
    ///
    /// If `idx >= Self::COUNT`.
    fn from_regidx(idx: usize) -> Self;

    fn class(&self) -> RegClass;

    /// Is this register clobbered by a call?
    fn is_caller_saved(&self) -> bool;

    /// Can this register be written by instructions which produce a single byte (e.g. `setcc`)?
    fn is_byte_addressable(&self) -> bool;

    /// Parse a register name as produced by [fmt::Display].
    #[cfg(test)]
    fn from_str(s: &str) -> Option<Self>;
}

/// A set of registers, represented as a bitfield indexed by [RegT::regidx].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct RegMask(u64);

impl RegMask {
    pub(crate) const fn new() -> Self {
        Self(0)
    }

    pub(crate) fn set<R: RegT>(&mut self, r: R) {
        self.0 |= 1 << r.regidx();
    }

    pub(crate) fn is_set<R: RegT>(&self, r: R) -> bool {
        self.0 & (1 << r.regidx()) != 0
    }

    pub(crate) const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterate over the registers in this set in [RegT::regidx] order.
    pub(crate) fn iter<R: RegT>(&self) -> impl Iterator<Item = R> {
        let bits = self.0;
        (0..R::COUNT)
            .filter(move |i| bits & (1 << i) != 0)
            .map(R::from_regidx)
    }
}

/// The per-architecture register table handed to the allocator.
#[derive(Clone, Debug)]
pub struct RegSet<R: RegT> {
    /// Allocatable registers in order of preference.
    alloc_order: Vec<R>,
    int_args: Vec<R>,
    float_args: Vec<R>,
    int_ret: R,
    float_ret: R,
    /// Registers that are never allocated and which the allocator may use to break move cycles.
    int_scratch: R,
    float_scratch: R,
}

impl<R: RegT> RegSet<R> {
    /// Create a new register table.
    ///
    /// # Panics
    ///
    /// If the table is inconsistent: a scratch register that is also allocatable, an argument or
    /// return register in the wrong class, or an argument register which is not allocatable.
    pub fn new(
        alloc_order: Vec<R>,
        int_args: Vec<R>,
        float_args: Vec<R>,
        (int_ret, float_ret): (R, R),
        (int_scratch, float_scratch): (R, R),
    ) -> Self {
        assert!(R::COUNT <= 64);
        assert_eq!(int_scratch.class(), RegClass::Int);
        assert_eq!(float_scratch.class(), RegClass::Float);
        assert!(!alloc_order.contains(&int_scratch) && !alloc_order.contains(&float_scratch));
        assert_eq!(int_ret.class(), RegClass::Int);
        assert_eq!(float_ret.class(), RegClass::Float);
        for (args, class) in [(&int_args, RegClass::Int), (&float_args, RegClass::Float)] {
            for r in args {
                assert_eq!(r.class(), class);
                assert!(alloc_order.contains(r));
                assert!(r.is_caller_saved());
            }
        }
        assert!(alloc_order.contains(&int_ret) && alloc_order.contains(&float_ret));
        Self {
            alloc_order,
            int_args,
            float_args,
            int_ret,
            float_ret,
            int_scratch,
            float_scratch,
        }
    }

    /// The allocatable registers of class `class` in order of preference.
    pub fn alloc_order(&self, class: RegClass) -> impl Iterator<Item = R> + '_ {
        self.alloc_order
            .iter()
            .copied()
            .filter(move |r| r.class() == class)
    }

    /// The registers used to pass arguments of class `class`.
    pub fn args(&self, class: RegClass) -> &[R] {
        match class {
            RegClass::Int => &self.int_args,
            RegClass::Float => &self.float_args,
        }
    }

    pub fn ret(&self, class: RegClass) -> R {
        match class {
            RegClass::Int => self.int_ret,
            RegClass::Float => self.float_ret,
        }
    }

    pub fn scratch(&self, class: RegClass) -> R {
        match class {
            RegClass::Int => self.int_scratch,
            RegClass::Float => self.float_scratch,
        }
    }

    /// The callee-saved registers we might allocate.
    pub fn callee_saved(&self) -> impl Iterator<Item = R> + '_ {
        self.alloc_order
            .iter()
            .copied()
            .filter(|r| !r.is_caller_saved())
    }
}
