// Events are the IR operations, appended in front-end call order and compiled in that same
// order by the driver. Each event records the abstract stack and locals it saw when it was
// appended, the reads it consumes (in creation order), code promises bound when it finishes,
// and its place in the control-flow graph as predecessor and successor links. A link carries
// the fork state that was current when it was created (so a successor path knows which fan-out
// reads to switch onto) and, for links created by visiting an already-started instruction, the
// stub reads that keep the values of a not-yet-compiled predecessor alive. Junction tables and
// snapshots are filled in by the driver; everything else is fixed at append time.

//! Event kinds, control-flow links and fork state.

use crate::core::promise::PromiseId;
use crate::core::read::ReadId;
use crate::core::site::Site;
use crate::core::value::ValueId;
use crate::frame_map::TraceId;
use crate::ir::stack::{LocalsId, StackId};
use crate::target::{BinaryOperation, Operation, TernaryOperation, UnaryOperation};
use std::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) u32);

/// Opaque handle to a saved abstract state, returned by `Compiler::save_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForkStateId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JunctionTableId(pub(crate) u32);

/// Handle to a subroutine started with `Compiler::start_subroutine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubroutineId(pub(crate) u32);

/// Call modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CallFlags(u32);

impl CallFlags {
    pub const NONE: CallFlags = CallFlags(0);
    /// Emit an aligned call so the call site can be patched atomically.
    pub const ALIGNED: CallFlags = CallFlags(1);
    /// The callee never returns.
    pub const NO_RETURN: CallFlags = CallFlags(1 << 1);
    /// Replace the current frame instead of pushing a return address.
    pub const TAIL_JUMP: CallFlags = CallFlags(1 << 2);
    /// The target may be out of reach of a short call.
    pub const LONG_JUMP_OR_CALL: CallFlags = CallFlags(1 << 3);

    pub fn contains(self, other: CallFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CallFlags {
    type Output = CallFlags;

    fn bitor(self, rhs: CallFlags) -> CallFlags {
        CallFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct CallEvent {
    pub address: ValueId,
    pub flags: CallFlags,
    pub trace: Option<TraceId>,
    pub result: ValueId,
    pub result_size: u32,
    pub return_address_surrogate: Option<ValueId>,
    pub frame_pointer_surrogate: Option<ValueId>,
    /// Frame slots at or above this index survive the call.
    pub pop_index: u32,
    pub stack_argument_index: u32,
    pub stack_argument_footprint: u32,
    /// Whether the call replaces the frame.
    pub tail: bool,
}

#[derive(Debug, Clone)]
pub struct MoveEvent {
    pub op: BinaryOperation,
    pub src_size: u32,
    pub src_select_size: u32,
    pub src: ValueId,
    pub dst_size: u32,
    pub dst: ValueId,
}

/// `result = second op first`.
#[derive(Debug, Clone)]
pub struct CombineEvent {
    pub op: TernaryOperation,
    pub first_size: u32,
    pub first: ValueId,
    pub second_size: u32,
    pub second: ValueId,
    pub result_size: u32,
    pub result: ValueId,
}

#[derive(Debug, Clone)]
pub struct TranslateEvent {
    pub op: BinaryOperation,
    pub value_size: u32,
    pub value: ValueId,
    pub result_size: u32,
    pub result: ValueId,
}

/// Jump to `address` when `second op first` holds.
#[derive(Debug, Clone)]
pub struct BranchEvent {
    pub op: TernaryOperation,
    pub size: u32,
    pub first: ValueId,
    pub second: ValueId,
    pub address: ValueId,
}

#[derive(Debug, Clone)]
pub struct MemoryEvent {
    pub base: ValueId,
    pub displacement: i32,
    pub index: Option<ValueId>,
    pub scale: u8,
    pub result: ValueId,
}

#[derive(Debug, Clone)]
pub struct BoundsCheckEvent {
    pub object: ValueId,
    pub length_offset: u32,
    pub index: ValueId,
    pub handler: i64,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    Call(CallEvent),
    Return {
        size: u32,
        value: Option<ValueId>,
    },
    Move(MoveEvent),
    Combine(CombineEvent),
    Translate(TranslateEvent),
    Branch(BranchEvent),
    Jump {
        op: UnaryOperation,
        address: ValueId,
        exit: bool,
        clean_locals: bool,
    },
    Memory(MemoryEvent),
    BoundsCheck(BoundsCheckEvent),
    Barrier(Operation),
    FrameSite {
        value: ValueId,
        index: u32,
    },
    Buddy {
        original: ValueId,
        buddy: ValueId,
    },
    SaveLocals,
    Dummy,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Call(_) => "call",
            EventKind::Return { .. } => "return",
            EventKind::Move(_) => "move",
            EventKind::Combine(_) => "combine",
            EventKind::Translate(_) => "translate",
            EventKind::Branch(_) => "branch",
            EventKind::Jump { .. } => "jump",
            EventKind::Memory(_) => "memory",
            EventKind::BoundsCheck(_) => "bounds-check",
            EventKind::Barrier(_) => "barrier",
            EventKind::FrameSite { .. } => "frame-site",
            EventKind::Buddy { .. } => "buddy",
            EventKind::SaveLocals => "save-locals",
            EventKind::Dummy => "dummy",
        }
    }

    /// Branches resolve their successors' sites before emitting, since the jump itself
    /// leaves no room for moves afterwards.
    pub fn is_branch(&self) -> bool {
        matches!(self, EventKind::Branch(_) | EventKind::Jump { .. })
    }
}

/// Saved location state of one value at a fork.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub value: ValueId,
    pub buddy: ValueId,
    pub sites: Vec<Site>,
}

#[derive(Debug, Clone)]
pub struct EventData {
    pub kind: EventKind,
    pub next: Option<EventId>,
    pub stack_before: Option<StackId>,
    pub locals_before: LocalsId,
    pub stack_after: Option<StackId>,
    pub locals_after: Option<LocalsId>,
    /// Code promises bound once the event has been emitted.
    pub promises: Vec<PromiseId>,
    /// Reads this event consumes, in creation order.
    pub reads: Vec<ReadId>,
    pub junction_sites: Option<JunctionTableId>,
    pub snapshots: Vec<Snapshot>,
    /// Oldest first.
    pub predecessors: Vec<LinkId>,
    /// Oldest first.
    pub successors: Vec<LinkId>,
    /// Links to already-compiled instructions, visited after this event is emitted.
    pub visit_links: Vec<LinkId>,
    pub logical_ip: i32,
}

impl EventData {
    pub fn new(kind: EventKind, stack: Option<StackId>, locals: LocalsId, logical_ip: i32) -> Self {
        Self {
            kind,
            next: None,
            stack_before: stack,
            locals_before: locals,
            stack_after: None,
            locals_after: None,
            promises: Vec::new(),
            reads: Vec::new(),
            junction_sites: None,
            snapshots: Vec::new(),
            predecessors: Vec::new(),
            successors: Vec::new(),
            visit_links: Vec::new(),
            logical_ip,
        }
    }

    pub fn locals_after_or_before(&self) -> LocalsId {
        self.locals_after.unwrap_or(self.locals_before)
    }
}

/// A control-flow edge.
#[derive(Debug, Clone)]
pub struct Link {
    pub predecessor: EventId,
    pub successor: EventId,
    pub fork_state: Option<ForkStateId>,
    /// Stub reads per frame slot, for edges into already-compiled instructions.
    pub junction_state: Vec<Option<(ValueId, ReadId)>>,
}

/// Abstract state captured by `save_state`, plus the fan-out reads created for it.
#[derive(Debug, Clone)]
pub struct ForkState {
    pub stack: Option<StackId>,
    pub locals: LocalsId,
    pub saved: Vec<ValueId>,
    pub predecessor: Option<EventId>,
    pub logical_ip: i32,
    pub elements: Vec<(ValueId, ReadId)>,
}

#[derive(Debug, Clone, Default)]
pub struct SubroutineState {
    /// State at the return point, used to link each call site's continuation.
    pub fork_state: Option<ForkStateId>,
}

/// Bookkeeping for one bytecode instruction.
#[derive(Debug, Clone)]
pub struct LogicalInstruction {
    pub index: i32,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    /// Abstract state on entry.
    pub stack: Option<StackId>,
    pub locals: LocalsId,
    pub subroutine: Option<SubroutineId>,
    /// Whether the instruction's start has been bound in the emitter.
    pub bound: bool,
}

impl LogicalInstruction {
    pub fn new(index: i32, stack: Option<StackId>, locals: LocalsId) -> Self {
        Self {
            index,
            first_event: None,
            last_event: None,
            stack,
            locals,
            subroutine: None,
            bound: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_flags() {
        let flags = CallFlags::ALIGNED | CallFlags::TAIL_JUMP;
        assert!(flags.contains(CallFlags::TAIL_JUMP));
        assert!(flags.contains(CallFlags::ALIGNED));
        assert!(!flags.contains(CallFlags::NO_RETURN));
        assert!(CallFlags::NONE.contains(CallFlags::NONE));
    }

    #[test]
    fn test_branch_classification() {
        let jump = EventKind::Jump {
            op: UnaryOperation::Jump,
            address: ValueId(0),
            exit: false,
            clean_locals: false,
        };
        assert!(jump.is_branch());
        assert!(!EventKind::Dummy.is_branch());
        assert_eq!(EventKind::SaveLocals.name(), "save-locals");
    }
}
