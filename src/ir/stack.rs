//! Persistent abstract operand stack and copy-on-write locals.
//!
//! Stack nodes are immutable once pushed and share their tails, so an event can remember
//! the stack it saw by keeping a single node id. Locals are whole arrays that are copied
//! before every store; events keep the id of the array that was current when they were
//! appended.

use crate::core::value::ValueId;
use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalsId(pub(crate) u32);

#[derive(Debug, Clone, Copy)]
pub struct StackNode {
    /// Depth of this slot; the bottom slot has index 0.
    pub index: u32,
    /// `None` for the empty high half of a two-word value or a slot pushed without a value.
    pub value: Option<ValueId>,
    pub next: Option<StackId>,
}

/// One live slot of the abstract frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameElement {
    pub value: Option<ValueId>,
    /// Locals first, then stack slots, in one index space.
    pub local_index: u32,
}

pub struct Frames<'a> {
    stacks: BumpVec<'a, StackNode>,
    locals: BumpVec<'a, Vec<Option<ValueId>>>,
    local_footprint: u32,
}

impl<'a> Frames<'a> {
    pub fn new_in(arena: &'a Bump) -> Self {
        Self {
            stacks: BumpVec::new_in(arena),
            locals: BumpVec::new_in(arena),
            local_footprint: 0,
        }
    }

    /// Size the locals and return the initial, empty locals array.
    pub fn init(&mut self, local_footprint: u32) -> LocalsId {
        self.local_footprint = local_footprint;
        self.new_locals(vec![None; local_footprint as usize])
    }

    pub fn local_footprint(&self) -> u32 {
        self.local_footprint
    }

    pub fn push(&mut self, value: Option<ValueId>, next: Option<StackId>) -> StackId {
        let index = next.map(|n| self.node(n).index + 1).unwrap_or(0);
        self.stacks.push(StackNode { index, value, next });
        StackId(self.stacks.len() as u32 - 1)
    }

    pub fn node(&self, id: StackId) -> &StackNode {
        &self.stacks[id.0 as usize]
    }

    pub fn new_locals(&mut self, slots: Vec<Option<ValueId>>) -> LocalsId {
        self.locals.push(slots);
        LocalsId(self.locals.len() as u32 - 1)
    }

    /// Copy `locals` into a fresh array that can be modified without affecting earlier events.
    pub fn copy_locals(&mut self, locals: LocalsId) -> LocalsId {
        let slots = self.locals(locals).to_vec();
        self.new_locals(slots)
    }

    pub fn locals(&self, id: LocalsId) -> &[Option<ValueId>] {
        &self.locals[id.0 as usize]
    }

    pub fn set_local(&mut self, id: LocalsId, index: u32, value: Option<ValueId>) {
        self.locals[id.0 as usize][index as usize] = value;
    }

    /// Slot count of the frame described by `stack`.
    pub fn frame_footprint(&self, stack: Option<StackId>) -> u32 {
        self.local_footprint + stack.map(|s| self.node(s).index + 1).unwrap_or(0)
    }

    /// Stack slots from the top down, then locals from the highest index down.
    pub fn elements(
        &self,
        stack: Option<StackId>,
        locals: LocalsId,
        include_empty: bool,
    ) -> Vec<FrameElement> {
        let mut elements = Vec::new();
        let mut cursor = stack;
        while let Some(id) = cursor {
            let node = self.node(id);
            if include_empty || node.value.is_some() {
                elements.push(FrameElement {
                    value: node.value,
                    local_index: node.index + self.local_footprint,
                });
            }
            cursor = node.next;
        }
        for (index, value) in self.locals(locals).iter().enumerate().rev() {
            if include_empty || value.is_some() {
                elements.push(FrameElement {
                    value: *value,
                    local_index: index as u32,
                });
            }
        }
        elements
    }

    /// Values of every occupied slot, in frame order.
    pub fn values(&self, stack: Option<StackId>, locals: LocalsId) -> Vec<ValueId> {
        self.elements(stack, locals, false)
            .into_iter()
            .filter_map(|e| e.value)
            .collect()
    }
}
