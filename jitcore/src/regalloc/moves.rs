//! Sequentialise a set of register moves that must appear to happen simultaneously (e.g. moving
//! call arguments into the ABI's argument registers).

use crate::{
    arch::{RegClass, RegMask, RegT},
    ir::SymIdx,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RegMove<R> {
    pub(crate) sym: SymIdx,
    pub(crate) src: R,
    pub(crate) dst: R,
}

/// Order `moves` such that no move overwrites a register that a later move reads. No two moves
/// may have the same destination, but a source may be read by more than one move. Moves whose
/// source and destination are the same are dropped.
///
/// When the remaining moves only form cycles, the source of one of them is first copied into the
/// scratch register of its class (`scratch`) and every move reading that source is rewritten to
/// read the scratch register instead, which breaks the cycle. The scratch registers must not be
/// the source or destination of any move.
pub(crate) fn sequentialise<R, F>(moves: &[RegMove<R>], scratch: F) -> Vec<RegMove<R>>
where
    R: RegT,
    F: Fn(RegClass) -> R,
{
    let mut pending = moves
        .iter()
        .filter(|m| m.src != m.dst)
        .copied()
        .collect::<Vec<_>>();
    debug_assert!(pending.iter().all(|m| m.src.class() == m.dst.class()));
    debug_assert!({
        let mut dsts = RegMask::new();
        pending.iter().all(|m| {
            let fresh = !dsts.is_set(m.dst);
            dsts.set(m.dst);
            fresh
        })
    });
    let mut ordered = Vec::with_capacity(pending.len() + 1);
    while !pending.is_empty() {
        let mut read = RegMask::new();
        for m in &pending {
            read.set(m.src);
        }
        match pending.iter().position(|m| !read.is_set(m.dst)) {
            Some(i) => ordered.push(pending.remove(i)),
            None => {
                // Every remaining destination is still to be read: there is at least one cycle.
                let RegMove { sym, src, .. } = pending[0];
                let tmp = scratch(src.class());
                debug_assert!(pending.iter().all(|m| m.src != tmp && m.dst != tmp));
                ordered.push(RegMove { sym, src, dst: tmp });
                for m in pending.iter_mut().filter(|m| m.src == src) {
                    m.src = tmp;
                }
            }
        }
    }
    ordered
}
