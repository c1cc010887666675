// Reads are the pending demands on a value. Every event that consumes a value adds one read
// to the value's chain (and to its own read list); the head of the chain is the next demand
// the allocator must satisfy, and a value whose chain holds no valid read is dead. Three
// kinds exist. A single read carries the location mask an operation accepts and, optionally,
// the value its result will become (so a target can be chosen that satisfies both). A multi
// read stands for a fork: each successor path appends its own first read, and the driver
// switches the value onto the right one when it visits that path. A stub read stands in at a
// junction for a predecessor that has not been compiled yet and is later pointed at the live
// read found there, or invalidated.

//! Pending demands on values: single, fan-out and stub reads.

use crate::core::error::{CompileError, CompileResult};
use crate::core::site::SiteMask;
use crate::core::value::ValueId;
use crate::ir::event::EventId;
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

/// Index of a read in the per-compile read table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadId(pub(crate) u32);

#[derive(Debug, Clone)]
pub enum ReadKind {
    Single {
        mask: SiteMask,
        /// Value that will take over the site this read is satisfied from.
        successor: Option<ValueId>,
        next: Option<ReadId>,
    },
    Multi {
        /// First reads of each successor path, pruned as they become invalid.
        reads: Vec<ReadId>,
        /// One slot per successor path, filled as paths append their first read.
        targets: Vec<Option<ReadId>>,
        first_target: usize,
        visited: bool,
    },
    Stub {
        next: Option<ReadId>,
        /// The live read found when the junction was reached from another predecessor.
        read: Option<ReadId>,
        visited: bool,
        valid: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ReadData {
    pub value: ValueId,
    pub event: Option<EventId>,
    pub kind: ReadKind,
}

/// All reads created during one compilation.
pub struct ReadTable<'a> {
    reads: BumpVec<'a, ReadData>,
}

impl<'a> ReadTable<'a> {
    pub fn new_in(arena: &'a Bump) -> Self {
        Self {
            reads: BumpVec::new_in(arena),
        }
    }

    fn push(&mut self, value: ValueId, kind: ReadKind) -> ReadId {
        self.reads.push(ReadData {
            value,
            event: None,
            kind,
        });
        ReadId(self.reads.len() as u32 - 1)
    }

    pub fn single(&mut self, value: ValueId, mask: SiteMask, successor: Option<ValueId>) -> ReadId {
        self.push(
            value,
            ReadKind::Single {
                mask,
                successor,
                next: None,
            },
        )
    }

    pub fn multi(&mut self, value: ValueId) -> ReadId {
        self.push(
            value,
            ReadKind::Multi {
                reads: Vec::new(),
                targets: Vec::new(),
                first_target: 0,
                visited: false,
            },
        )
    }

    pub fn stub(&mut self, value: ValueId) -> ReadId {
        self.push(
            value,
            ReadKind::Stub {
                next: None,
                read: None,
                visited: false,
                valid: true,
            },
        )
    }

    pub fn get(&self, id: ReadId) -> &ReadData {
        &self.reads[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ReadId) -> &mut ReadData {
        &mut self.reads[id.0 as usize]
    }

    pub fn value(&self, id: ReadId) -> ValueId {
        self.get(id).value
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Narrow `mask` by what this read (and, for forks, every live successor path) accepts.
    /// Returns whether the read is still valid.
    pub fn intersect(&mut self, id: ReadId, mask: &mut SiteMask, depth: u32) -> bool {
        match &mut self.get_mut(id).kind {
            ReadKind::Single { mask: own, .. } => {
                *mask = mask.intersect(*own);
                true
            }
            ReadKind::Multi { reads, visited, .. } => {
                // deeply nested forks would make this quadratic; one level is enough
                if depth > 0 {
                    return !reads.is_empty();
                }
                if *visited {
                    return false;
                }
                *visited = true;
                let candidates = reads.clone();
                let mut kept = Vec::with_capacity(candidates.len());
                for r in candidates {
                    if self.intersect(r, mask, depth + 1) {
                        kept.push(r);
                    }
                }
                let result = !kept.is_empty();
                if let ReadKind::Multi { reads, visited, .. } = &mut self.get_mut(id).kind {
                    *reads = kept;
                    *visited = false;
                }
                result
            }
            ReadKind::Stub {
                read,
                visited,
                valid,
                ..
            } => {
                if *visited {
                    return *valid;
                }
                let Some(target) = *read else {
                    return *valid;
                };
                *visited = true;
                let still_valid = self.intersect(target, mask, depth);
                if let ReadKind::Stub {
                    read,
                    visited,
                    valid,
                    ..
                } = &mut self.get_mut(id).kind
                {
                    if !still_valid {
                        *read = None;
                    }
                    *visited = false;
                    *valid
                } else {
                    false
                }
            }
        }
    }

    /// Whether the read still stands for a future use.
    pub fn valid(&mut self, id: ReadId) -> bool {
        match &mut self.get_mut(id).kind {
            ReadKind::Single { .. } => true,
            ReadKind::Stub { valid, .. } => *valid,
            ReadKind::Multi { reads, visited, .. } => {
                if *visited {
                    return false;
                }
                *visited = true;
                let candidates = reads.clone();
                let mut kept = Vec::with_capacity(candidates.len());
                for r in candidates {
                    if self.valid(r) {
                        kept.push(r);
                    }
                }
                let result = !kept.is_empty();
                if let ReadKind::Multi { reads, visited, .. } = &mut self.get_mut(id).kind {
                    *reads = kept;
                    *visited = false;
                }
                result
            }
        }
    }

    pub fn successor(&self, id: ReadId) -> Option<ValueId> {
        match self.get(id).kind {
            ReadKind::Single { successor, .. } => successor,
            _ => None,
        }
    }

    /// Next read in the value's chain.
    pub fn next(&self, id: ReadId) -> CompileResult<Option<ReadId>> {
        match self.get(id).kind {
            ReadKind::Single { next, .. } | ReadKind::Stub { next, .. } => Ok(next),
            ReadKind::Multi { .. } => Err(CompileError::invariant(format!(
                "fan-out read {:?} consumed without choosing a path",
                id
            ))),
        }
    }

    /// Link `next` after `id` in the value's chain.
    pub fn append(&mut self, id: ReadId, next_read: ReadId) -> CompileResult<()> {
        match &mut self.get_mut(id).kind {
            ReadKind::Single { next, .. } | ReadKind::Stub { next, .. } => {
                if next.is_some() {
                    return Err(CompileError::invariant(format!(
                        "read {:?} already has a successor",
                        id
                    )));
                }
                *next = Some(next_read);
                Ok(())
            }
            ReadKind::Multi { reads, targets, .. } => {
                reads.push(next_read);
                match targets.last_mut() {
                    Some(slot) => {
                        *slot = Some(next_read);
                        Ok(())
                    }
                    None => Err(CompileError::invariant(format!(
                        "fan-out read {:?} has no path to append to",
                        id
                    ))),
                }
            }
        }
    }

    /// Open a new successor path on a fan-out read.
    pub fn allocate_target(&mut self, id: ReadId) {
        if let ReadKind::Multi { targets, .. } = &mut self.get_mut(id).kind {
            targets.push(None);
        }
    }

    /// Take the first read of the next successor path, in path creation order.
    pub fn next_target(&mut self, id: ReadId) -> Option<ReadId> {
        match &mut self.get_mut(id).kind {
            ReadKind::Multi {
                targets,
                first_target,
                ..
            } => {
                let read = targets.get(*first_target).copied().flatten();
                *first_target += 1;
                read
            }
            _ => None,
        }
    }

    /// Point a stub at the read that was live when its junction was reached again.
    pub fn set_stub_target(&mut self, id: ReadId, target: ReadId) {
        if let ReadKind::Stub { read, .. } = &mut self.get_mut(id).kind {
            *read = Some(target);
        }
    }

    pub fn stub_target(&self, id: ReadId) -> Option<ReadId> {
        match self.get(id).kind {
            ReadKind::Stub { read, .. } => read,
            _ => None,
        }
    }

    pub fn invalidate_stub(&mut self, id: ReadId) {
        if let ReadKind::Stub { valid, .. } = &mut self.get_mut(id).kind {
            *valid = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::site::FrameSlot;

    #[test]
    fn test_single_read_intersects_mask() {
        let arena = Bump::new();
        let mut table = ReadTable::new_in(&arena);
        let r = table.single(ValueId(0), SiteMask::new(0b0100, 0b0011, FrameSlot::None), None);

        let mut mask = SiteMask::any();
        assert!(table.intersect(r, &mut mask, 0));
        assert_eq!(mask.type_mask, 0b0100);
        assert_eq!(mask.register_mask, 0b0011);
        assert!(table.valid(r));
    }

    #[test]
    fn test_multi_read_targets_follow_paths() {
        let arena = Bump::new();
        let mut table = ReadTable::new_in(&arena);
        let v = ValueId(0);
        let fork = table.multi(v);

        table.allocate_target(fork);
        let first = table.single(v, SiteMask::fixed_register(1), None);
        table.append(fork, first).unwrap();

        table.allocate_target(fork);
        let second = table.single(v, SiteMask::fixed_register(2), None);
        table.append(fork, second).unwrap();

        let mut mask = SiteMask::any();
        assert!(table.intersect(fork, &mut mask, 0));
        // both paths constrain the mask
        assert_eq!(mask.register_mask, 0);

        assert_eq!(table.next_target(fork), Some(first));
        assert_eq!(table.next_target(fork), Some(second));
        assert!(table.next(fork).is_err());
    }

    #[test]
    fn test_stub_read_invalidation() {
        let arena = Bump::new();
        let mut table = ReadTable::new_in(&arena);
        let v = ValueId(3);
        let stub = table.stub(v);
        assert!(table.valid(stub));

        let live = table.single(v, SiteMask::fixed_register(5), None);
        table.set_stub_target(stub, live);
        let mut mask = SiteMask::any();
        assert!(table.intersect(stub, &mut mask, 0));
        assert_eq!(mask.register_mask, 1 << 5);

        table.invalidate_stub(stub);
        assert!(!table.valid(stub));

        // a fan-out read whose only path is an invalid stub is itself invalid
        let fork = table.multi(v);
        table.allocate_target(fork);
        table.append(fork, stub).unwrap();
        assert!(!table.valid(fork));
    }
}
