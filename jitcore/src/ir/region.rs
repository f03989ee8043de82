//! Loop and scope nesting.
//!
//! Regions form a tree stored in an arena: a region refers to its parent by [RegionIdx], never by
//! reference. The root region always exists and has index 0, so per-region arrays have
//! `RegionTree::len()` entries (one per non-root region, plus the root). Regions are built by the
//! IR producer and never change afterwards.

use super::index_overflow;
use crate::errors::CompilationError;
use std::fmt;
use typed_index_collections::TiVec;

index_type!(
    /// An index into a [RegionTree].
    RegionIdx(u16)
);

impl RegionIdx {
    pub fn root() -> Self {
        RegionIdx(0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// The body of the function.
    Root,
    Loop,
    Scope,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Root => write!(f, "root"),
            RegionKind::Loop => write!(f, "loop"),
            RegionKind::Scope => write!(f, "scope"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Region {
    parent: Option<RegionIdx>,
    kind: RegionKind,
    /// How many loops (including this region) enclose this region?
    loop_depth: u16,
}

impl Region {
    pub fn parent(&self) -> Option<RegionIdx> {
        self.parent
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn loop_depth(&self) -> u16 {
        self.loop_depth
    }
}

#[derive(Clone, Debug)]
pub struct RegionTree {
    regions: TiVec<RegionIdx, Region>,
}

impl RegionTree {
    /// Create a tree containing only the root region.
    pub fn new() -> Self {
        let mut regions = TiVec::new();
        regions.push(Region {
            parent: None,
            kind: RegionKind::Root,
            loop_depth: 0,
        });
        Self { regions }
    }

    /// Add a new region as a child of `parent`.
    pub fn push(
        &mut self,
        parent: RegionIdx,
        kind: RegionKind,
    ) -> Result<RegionIdx, CompilationError> {
        if kind == RegionKind::Root {
            return Err(CompilationError::General(
                "only one root region may exist".into(),
            ));
        }
        let p = self.regions.get(parent).ok_or_else(|| {
            CompilationError::General(format!("region parent {parent} does not exist"))
        })?;
        let loop_depth = p.loop_depth + u16::from(kind == RegionKind::Loop);
        RegionIdx::new(self.regions.len())?;
        self.regions.raw.try_reserve(1)?;
        Ok(self.regions.push_and_get_key(Region {
            parent: Some(parent),
            kind,
            loop_depth,
        }))
    }

    /// The number of regions, including the root.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, idx: RegionIdx) -> Option<&Region> {
        self.regions.get(idx)
    }

    pub fn parent(&self, idx: RegionIdx) -> Option<RegionIdx> {
        self.regions[idx].parent
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionIdx, &Region)> {
        self.regions.iter_enumerated()
    }

    /// Iterate over `idx` and then each of its ancestors, ending with the root.
    pub fn ancestors(&self, idx: RegionIdx) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: Some(idx),
        }
    }

    /// The innermost loop region containing `idx` (which may be `idx` itself).
    pub fn enclosing_loop(&self, idx: RegionIdx) -> Option<RegionIdx> {
        self.ancestors(idx)
            .find(|r| self.regions[*r].kind == RegionKind::Loop)
    }
}

impl Default for RegionTree {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Ancestors<'a> {
    tree: &'a RegionTree,
    next: Option<RegionIdx>,
}

impl Iterator for Ancestors<'_> {
    type Item = RegionIdx;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = self.tree.regions[cur].parent;
        Some(cur)
    }
}
