// Planning queries and ABI facts for x86-64 under the System V calling convention. The frame
// keeps rbp as a frame pointer, so the header is the return address plus the saved rbp and
// the stack stays 16-byte aligned at every call. Integer operations take their second operand
// in a register and overwrite it (the result is always condensed onto it). Division is pinned
// to rax with rdx clobbered, variable shift counts live in rcx, and float operations work on
// SSE registers. Float remainder, minimum and maximum have no short inline form and go
// through runtime helpers.

//! x86-64 architecture description.

use super::*;
use crate::target::{
    Architecture, BinaryOperation, BinaryPlan, MovePlan, OperandMask, OperandType,
    TernaryOperation, TernaryPlan, UnaryOperation, UnaryPlan, ANY_TYPE,
};

const ARGUMENT_REGISTERS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const STACK_ALIGNMENT_IN_WORDS: u32 = 2;
const FRAME_HEADER_SIZE: u32 = 2;

const REGISTER: u8 = OperandType::Register.bit();
const MEMORY: u8 = OperandType::Memory.bit();
const CONSTANT: u8 = OperandType::Constant.bit();
const ADDRESS: u8 = OperandType::Address.bit();

fn pad(words: u32, alignment: u32) -> u32 {
    words.div_ceil(alignment) * alignment
}

/// The x86-64 target description.
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Architecture;

impl X64Architecture {
    pub fn new() -> Self {
        Self
    }
}

impl Architecture for X64Architecture {
    fn general_register_mask(&self) -> u64 {
        GENERAL_REGISTER_MASK
    }

    fn float_register_mask(&self) -> u64 {
        FLOAT_REGISTER_MASK
    }

    fn register_count(&self) -> u32 {
        32
    }

    fn reserved(&self, register: u8) -> bool {
        matches!(register, RSP | RBP | THREAD | SCRATCH)
    }

    fn stack(&self) -> u8 {
        RSP
    }

    fn thread(&self) -> u8 {
        THREAD
    }

    fn return_low(&self) -> u8 {
        RAX
    }

    fn argument_register_count(&self) -> u32 {
        ARGUMENT_REGISTERS.len() as u32
    }

    fn argument_register(&self, index: u32) -> u8 {
        ARGUMENT_REGISTERS[index as usize % ARGUMENT_REGISTERS.len()]
    }

    fn argument_footprint(&self, footprint: u32) -> u32 {
        pad(footprint, STACK_ALIGNMENT_IN_WORDS).max(STACK_ALIGNMENT_IN_WORDS)
    }

    fn stack_alignment_in_words(&self) -> u32 {
        STACK_ALIGNMENT_IN_WORDS
    }

    fn align_frame_size(&self, words: u32) -> u32 {
        pad(words + FRAME_HEADER_SIZE, STACK_ALIGNMENT_IN_WORDS) - FRAME_HEADER_SIZE
    }

    fn frame_header_size(&self) -> u32 {
        FRAME_HEADER_SIZE
    }

    fn frame_footer_size(&self) -> u32 {
        0
    }

    fn frame_return_address_size(&self) -> u32 {
        1
    }

    fn return_address_offset(&self) -> i32 {
        0
    }

    fn frame_pointer_offset(&self) -> i32 {
        -1
    }

    fn always_condensed_binary(&self, _op: BinaryOperation) -> bool {
        false
    }

    fn always_condensed_ternary(&self, _op: TernaryOperation) -> bool {
        true
    }

    fn plan_unary(&self, _op: UnaryOperation, _size: u32) -> UnaryPlan {
        UnaryPlan {
            mask: OperandMask::new(REGISTER | MEMORY | CONSTANT, GENERAL_REGISTER_MASK),
            thunk: false,
        }
    }

    fn plan_source_binary(&self, op: BinaryOperation, _a_size: u32, _b_size: u32) -> BinaryPlan {
        use BinaryOperation::*;
        let a = match op {
            Move => OperandMask::any(),
            MoveLow | MoveHigh | MoveZ | Int2Float => {
                OperandMask::new(REGISTER | MEMORY, GENERAL_REGISTER_MASK)
            }
            Negate | Absolute => OperandMask::new(REGISTER, GENERAL_REGISTER_MASK),
            FloatNegate | FloatAbsolute | Float2Float | Float2Int | FloatSquareRoot => {
                OperandMask::new(REGISTER | MEMORY, FLOAT_REGISTER_MASK)
            }
        };
        BinaryPlan { a, thunk: false }
    }

    fn plan_destination_binary(
        &self,
        op: BinaryOperation,
        _a_size: u32,
        a: OperandMask,
        _b_size: u32,
    ) -> OperandMask {
        use BinaryOperation::*;
        match op {
            Move => {
                if a.type_mask & (MEMORY | ADDRESS) != 0 {
                    OperandMask::new(REGISTER, u64::MAX)
                } else {
                    OperandMask::new(REGISTER | MEMORY, u64::MAX)
                }
            }
            MoveLow | MoveHigh | MoveZ | Negate | Absolute | Float2Int => {
                OperandMask::new(REGISTER, GENERAL_REGISTER_MASK)
            }
            FloatNegate | FloatAbsolute | Float2Float | Int2Float | FloatSquareRoot => {
                OperandMask::new(REGISTER, FLOAT_REGISTER_MASK)
            }
        }
    }

    fn plan_move(&self, _size: u32, dst: OperandMask) -> MovePlan {
        if dst.type_mask & MEMORY != 0 {
            MovePlan {
                src: OperandMask::new(REGISTER | CONSTANT, u64::MAX),
                tmp: OperandMask::new(REGISTER, GENERAL_REGISTER_MASK),
            }
        } else {
            MovePlan {
                src: OperandMask::new(ANY_TYPE, u64::MAX),
                tmp: OperandMask::new(0, 0),
            }
        }
    }

    fn plan_source_ternary(
        &self,
        op: TernaryOperation,
        _a_size: u32,
        _b_size: u32,
        _c_size: u32,
    ) -> TernaryPlan {
        use TernaryOperation::*;
        let general = OperandMask::new(REGISTER, GENERAL_REGISTER_MASK);
        let float = OperandMask::new(REGISTER, FLOAT_REGISTER_MASK);
        let (a, b, thunk) = match op {
            Add | Subtract | Multiply | And | Or | Xor => (
                OperandMask::new(REGISTER | MEMORY | CONSTANT, GENERAL_REGISTER_MASK),
                general,
                false,
            ),
            Divide | Remainder => (
                OperandMask::new(
                    REGISTER,
                    GENERAL_REGISTER_MASK & !(1 << RAX) & !(1 << RDX),
                ),
                OperandMask::new(REGISTER, 1 << RAX),
                false,
            ),
            ShiftLeft | ShiftRight | UnsignedShiftRight => (
                OperandMask::new(REGISTER | CONSTANT, 1 << RCX),
                OperandMask::new(REGISTER, GENERAL_REGISTER_MASK & !(1 << RCX)),
                false,
            ),
            FloatAdd | FloatSubtract | FloatMultiply | FloatDivide => (
                OperandMask::new(REGISTER | MEMORY, FLOAT_REGISTER_MASK),
                float,
                false,
            ),
            FloatRemainder | FloatMax | FloatMin => {
                (OperandMask::any(), OperandMask::any(), true)
            }
            JumpIfLess | JumpIfGreater | JumpIfLessOrEqual | JumpIfGreaterOrEqual
            | JumpIfEqual | JumpIfNotEqual => (
                OperandMask::new(REGISTER | CONSTANT, GENERAL_REGISTER_MASK),
                OperandMask::new(REGISTER | MEMORY, GENERAL_REGISTER_MASK),
                false,
            ),
            _ => (
                OperandMask::new(REGISTER | MEMORY, FLOAT_REGISTER_MASK),
                float,
                false,
            ),
        };
        TernaryPlan { a, b, thunk }
    }

    fn plan_destination_ternary(
        &self,
        op: TernaryOperation,
        _a_size: u32,
        _a: OperandMask,
        _b_size: u32,
        _b: OperandMask,
        _c_size: u32,
    ) -> OperandMask {
        use TernaryOperation::*;
        if op.is_branch() {
            return OperandMask::new(CONSTANT, 0);
        }
        match op {
            Divide | Remainder => OperandMask::new(REGISTER, 1 << RAX),
            ShiftLeft | ShiftRight | UnsignedShiftRight => {
                OperandMask::new(REGISTER, GENERAL_REGISTER_MASK & !(1 << RCX))
            }
            FloatAdd | FloatSubtract | FloatMultiply | FloatDivide | FloatRemainder
            | FloatMax | FloatMin => OperandMask::new(REGISTER, FLOAT_REGISTER_MASK),
            _ => OperandMask::new(REGISTER, GENERAL_REGISTER_MASK),
        }
    }

    fn clobbers_ternary(&self, op: TernaryOperation, _size: u32) -> u64 {
        match op {
            TernaryOperation::Divide | TernaryOperation::Remainder => 1 << RDX,
            _ => 0,
        }
    }
}
