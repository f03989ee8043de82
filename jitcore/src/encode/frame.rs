//! Stack frame layout.
//!
//! A frame looks like this (the stack grows downwards; offsets are relative to the frame
//! pointer):
//!
//! ```text
//!   +8   return address
//!    0   saved frame pointer
//!   -8   first saved callee-saved register
//!   ...
//!   -8*(n+1)   stack slot 0
//!   ...
//!   -size      (padding so that size is a multiple of 16)
//! ```

use crate::{arch::RegT, errors::CompilationError, ir::SlotIdx};

/// An abstract stack pointer that only ever grows: its value is also the size of the stack
/// built so far. The pointer grows upwards even though the machine stack grows downwards.
#[derive(Debug, Default)]
struct AbstractStack(usize);

impl AbstractStack {
    /// Grow the stack by `nbytes`, returning the new stack pointer.
    fn grow(&mut self, nbytes: usize) -> usize {
        self.0 += nbytes;
        self.0
    }

    /// Round the stack pointer up to a multiple of `to`, returning the new stack pointer.
    fn align(&mut self, to: usize) -> usize {
        self.0 = self.0.next_multiple_of(to);
        self.0
    }
}

/// The size of a stack slot and of a saved register.
const WORD: usize = 8;
/// The alignment of the stack at a call.
const STACK_ALIGN: usize = 16;

#[derive(Clone, Debug, PartialEq)]
pub struct Frame<R> {
    /// Each callee-saved register we must preserve and the offset below the frame pointer at which
    /// it is saved.
    callee_saves: Vec<(R, i32)>,
    /// The offset below the frame pointer of the word before slot 0.
    slots_base: i32,
    num_slots: usize,
    /// The number of bytes to subtract from the stack pointer in the prologue.
    size: i32,
}

impl<R: RegT> Frame<R> {
    pub fn new(callee_saved: &[R], num_slots: usize) -> Result<Self, CompilationError> {
        let to_i32 = |x: usize| {
            i32::try_from(x).map_err(|_| CompilationError::LimitExceeded("frame too big".into()))
        };
        let mut stack = AbstractStack::default();
        let mut callee_saves = Vec::with_capacity(callee_saved.len());
        for r in callee_saved {
            callee_saves.push((*r, to_i32(stack.grow(WORD))?));
        }
        let slots_base = to_i32(stack.0)?;
        let slots_bytes = num_slots
            .checked_mul(WORD)
            .ok_or_else(|| CompilationError::LimitExceeded("too many stack slots".into()))?;
        stack.grow(slots_bytes);
        let size = to_i32(stack.align(STACK_ALIGN))?;
        Ok(Self {
            callee_saves,
            slots_base,
            num_slots,
            size,
        })
    }

    /// The offset below the frame pointer of `slot`.
    ///
    /// # Panics
    ///
    /// If `slot` is not in this frame.
    pub fn slot_off(&self, slot: SlotIdx) -> i32 {
        let slot = usize::from(slot);
        assert!(slot < self.num_slots);
        // Cannot overflow: `new` checked that all slots fit in `size`.
        self.slots_base + i32::try_from((slot + 1) * WORD).unwrap()
    }

    pub fn callee_saves(&self) -> &[(R, i32)] {
        &self.callee_saves
    }

    pub fn size(&self) -> i32 {
        self.size
    }
}
