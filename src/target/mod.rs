// This module defines the seams between the machine-independent core and a concrete target.
// Architecture answers planning queries (which operand kinds and registers an operation can
// take, whether it needs a runtime helper, which registers it clobbers) and reports ABI facts
// (argument registers, frame header and footer sizes, reserved registers). Assembler is the
// emitter: it receives operations with explicit sizes and fully placed operands, binds code
// targets, and finishes into machine code plus the offsets needed for the second, patching
// phase of promise resolution. ScratchRegisters is the callback through which an emitter
// borrows a temporary register from the allocator while it expands one operation.

//! Architecture planning and emitter interfaces.

pub mod operation;

pub use operation::{AnyOperation, BinaryOperation, Operation, TernaryOperation, UnaryOperation};

use crate::core::error::CompileResult;
use crate::core::promise::{CodeTarget, PromiseId};
use hashbrown::HashMap;

/// Bytes per machine word.
pub const WORD: u32 = 8;

/// Operand kinds, in the bit order used by type masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperandType {
    Constant = 0,
    Address = 1,
    Register = 2,
    Memory = 3,
}

impl OperandType {
    pub const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// Type mask accepting every operand kind.
pub const ANY_TYPE: u8 = 0b1111;

/// Feasible operand kinds and registers for one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandMask {
    pub type_mask: u8,
    pub register_mask: u64,
}

impl OperandMask {
    pub const fn new(type_mask: u8, register_mask: u64) -> Self {
        Self {
            type_mask,
            register_mask,
        }
    }

    pub const fn any() -> Self {
        Self::new(ANY_TYPE, u64::MAX)
    }
}

/// Plan for an operation with a single operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnaryPlan {
    pub mask: OperandMask,
    pub thunk: bool,
}

/// Source plan for a binary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryPlan {
    pub a: OperandMask,
    pub thunk: bool,
}

/// Source plan for a ternary operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TernaryPlan {
    pub a: OperandMask,
    pub b: OperandMask,
    pub thunk: bool,
}

/// Constraints for a word move into a destination of a given kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    /// Sources the emitter can move from directly.
    pub src: OperandMask,
    /// Intermediate location for sources outside `src`; a zero type mask means none.
    pub tmp: OperandMask,
}

/// Target facts and planning queries.
pub trait Architecture {
    fn general_register_mask(&self) -> u64;
    fn float_register_mask(&self) -> u64;
    /// Registers are numbered `0..register_count()`.
    fn register_count(&self) -> u32;
    fn reserved(&self, register: u8) -> bool;
    fn stack(&self) -> u8;
    fn thread(&self) -> u8;
    fn return_low(&self) -> u8;

    fn argument_register_count(&self) -> u32;
    fn argument_register(&self, index: u32) -> u8;
    /// Words of stack occupied by `footprint` argument words.
    fn argument_footprint(&self, footprint: u32) -> u32;
    fn stack_alignment_in_words(&self) -> u32;
    fn align_frame_size(&self, words: u32) -> u32;

    fn frame_header_size(&self) -> u32;
    fn frame_footer_size(&self) -> u32;
    fn frame_return_address_size(&self) -> u32;
    fn return_address_offset(&self) -> i32;
    fn frame_pointer_offset(&self) -> i32;

    /// Whether the result of `op` always lands where its last source was.
    fn always_condensed_binary(&self, op: BinaryOperation) -> bool;
    fn always_condensed_ternary(&self, op: TernaryOperation) -> bool;

    fn plan_unary(&self, op: UnaryOperation, size: u32) -> UnaryPlan;
    fn plan_source_binary(&self, op: BinaryOperation, a_size: u32, b_size: u32) -> BinaryPlan;
    fn plan_destination_binary(
        &self,
        op: BinaryOperation,
        a_size: u32,
        a: OperandMask,
        b_size: u32,
    ) -> OperandMask;
    fn plan_move(&self, size: u32, dst: OperandMask) -> MovePlan;
    fn plan_source_ternary(
        &self,
        op: TernaryOperation,
        a_size: u32,
        b_size: u32,
        c_size: u32,
    ) -> TernaryPlan;
    fn plan_destination_ternary(
        &self,
        op: TernaryOperation,
        a_size: u32,
        a: OperandMask,
        b_size: u32,
        b: OperandMask,
        c_size: u32,
    ) -> OperandMask;
    /// Registers overwritten by `op` beyond its operands.
    fn clobbers_ternary(&self, _op: TernaryOperation, _size: u32) -> u64 {
        0
    }
}

/// Immediate operand encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    /// Known value.
    Immediate(i64),
    /// A code position in this method; emitted pc-relative.
    Label(CodeTarget),
    /// Value known only after resolution; emitted as a patchable word.
    Deferred(PromiseId),
}

/// A fully placed operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(u8),
    Memory {
        base: u8,
        offset: i32,
        index: Option<u8>,
        scale: u8,
    },
    Constant(Constant),
    Address(Constant),
}

impl Operand {
    pub fn operand_type(&self) -> OperandType {
        match self {
            Operand::Register(_) => OperandType::Register,
            Operand::Memory { .. } => OperandType::Memory,
            Operand::Constant(_) => OperandType::Constant,
            Operand::Address(_) => OperandType::Address,
        }
    }

    pub fn memory(base: u8, offset: i32) -> Self {
        Operand::Memory {
            base,
            offset,
            index: None,
            scale: 1,
        }
    }

    pub fn immediate(value: i64) -> Self {
        Operand::Constant(Constant::Immediate(value))
    }
}

/// Allocator callback for temporaries an emitter needs while expanding one operation.
pub trait ScratchRegisters {
    /// Borrow a register from `mask`; it stays reserved until released.
    fn acquire_temporary(&mut self, mask: u64) -> CompileResult<u8>;
    fn release_temporary(&mut self, register: u8);
}

/// A word that must be overwritten with a promise's value after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub offset: u32,
    pub promise: PromiseId,
}

/// Output of the first emission phase.
#[derive(Debug, Clone, Default)]
pub struct MachineCode {
    pub bytes: Vec<u8>,
    pub targets: HashMap<CodeTarget, u32>,
    pub patches: Vec<Patch>,
}

/// The per-architecture instruction emitter.
pub trait Assembler {
    fn apply0(&mut self, op: Operation) -> CompileResult<()>;
    fn apply1(&mut self, op: UnaryOperation, size: u32, a: Operand) -> CompileResult<()>;
    fn apply2(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()>;
    #[allow(clippy::too_many_arguments)]
    fn apply3(
        &mut self,
        op: TernaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        c_size: u32,
        c: Operand,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()>;

    /// Branch to `handler` when the stack pointer crosses the limit stored in the thread.
    fn check_stack_overflow(&mut self, handler: i64, stack_limit_offset: u32)
        -> CompileResult<()>;
    fn allocate_frame(&mut self, footprint: u32) -> CompileResult<()>;
    fn adjust_frame(&mut self, difference: u32) -> CompileResult<()>;
    fn pop_frame_for_tail_call(
        &mut self,
        footprint: u32,
        offset: i32,
        return_address_surrogate: Option<u8>,
        frame_pointer_surrogate: Option<u8>,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()>;
    fn pop_frame_and_pop_arguments_and_return(
        &mut self,
        footprint: u32,
        argument_footprint: u32,
    ) -> CompileResult<()>;

    /// Bind `target` to the current position.
    fn bind(&mut self, target: CodeTarget) -> CompileResult<()>;
    /// Called after every event; emitters may flush per-event state.
    fn end_event(&mut self) {}
    /// Lay out the code and report bound offsets and patch sites.
    fn finish(&mut self) -> CompileResult<MachineCode>;
}

/// Runtime helpers used when an operation needs a thunk.
pub trait RuntimeHelpers {
    /// Address of the helper for `op`. Ternary helpers receive `(a, b)` and return `b op a`;
    /// float-comparison helpers return a negative, zero or positive integer.
    fn thunk(&self, op: AnyOperation, size: u32, result_size: u32) -> i64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_type_bits() {
        assert_eq!(OperandType::Constant.bit(), 1);
        assert_eq!(OperandType::Memory.bit(), 8);
        assert_eq!(
            Operand::memory(4, 16).operand_type(),
            OperandType::Memory
        );
        assert_eq!(Operand::immediate(3).operand_type(), OperandType::Constant);
    }
}
