//! Operation vocabulary shared by the allocator and the emitters.
//!
//! Operations are grouped by arity the way emitters consume them: nullary operations take no
//! operand, unary operations take an address or target, binary operations read one operand
//! and write another, ternary operations combine two operands into a third (or, for the
//! conditional jumps, compare two operands and branch to the third).

use std::fmt;

/// Nullary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Return,
    LoadBarrier,
    StoreStoreBarrier,
    StoreLoadBarrier,
    Trap,
}

/// Operations taking a single address or target operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperation {
    Call,
    LongCall,
    AlignedCall,
    AlignedLongCall,
    Jump,
    LongJump,
    AlignedJump,
    AlignedLongJump,
}

impl UnaryOperation {
    pub fn is_call(self) -> bool {
        matches!(
            self,
            UnaryOperation::Call
                | UnaryOperation::LongCall
                | UnaryOperation::AlignedCall
                | UnaryOperation::AlignedLongCall
        )
    }
}

/// Operations reading operand `a` and writing operand `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperation {
    Move,
    MoveLow,
    MoveHigh,
    MoveZ,
    Negate,
    FloatNegate,
    Float2Float,
    Float2Int,
    Int2Float,
    FloatSquareRoot,
    FloatAbsolute,
    Absolute,
}

/// Operations computing `c = b op a`, or jumping to `c` when `b op a` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOperation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
    And,
    Or,
    Xor,
    FloatAdd,
    FloatSubtract,
    FloatMultiply,
    FloatDivide,
    FloatRemainder,
    FloatMax,
    FloatMin,
    JumpIfLess,
    JumpIfGreater,
    JumpIfLessOrEqual,
    JumpIfGreaterOrEqual,
    JumpIfEqual,
    JumpIfNotEqual,
    JumpIfFloatEqual,
    JumpIfFloatNotEqual,
    JumpIfFloatLess,
    JumpIfFloatGreater,
    JumpIfFloatLessOrEqual,
    JumpIfFloatGreaterOrEqual,
    JumpIfFloatLessOrUnordered,
    JumpIfFloatGreaterOrUnordered,
    JumpIfFloatLessOrEqualOrUnordered,
    JumpIfFloatGreaterOrEqualOrUnordered,
}

impl TernaryOperation {
    /// Conditional jumps are ternary operations whose third operand is the target.
    pub fn is_branch(self) -> bool {
        self as u8 >= TernaryOperation::JumpIfLess as u8
    }

    pub fn is_float_branch(self) -> bool {
        self as u8 >= TernaryOperation::JumpIfFloatEqual as u8
    }

    /// Integer comparison used after a float-comparison helper returned -1, 0 or 1
    /// (unordered compares as the tie-breaking side of the original predicate).
    pub fn thunk_branch(self) -> Option<TernaryOperation> {
        use TernaryOperation::*;
        Some(match self {
            JumpIfFloatEqual => JumpIfEqual,
            JumpIfFloatNotEqual => JumpIfNotEqual,
            JumpIfFloatLess | JumpIfFloatLessOrUnordered => JumpIfLess,
            JumpIfFloatGreater | JumpIfFloatGreaterOrUnordered => JumpIfGreater,
            JumpIfFloatLessOrEqual | JumpIfFloatLessOrEqualOrUnordered => JumpIfLessOrEqual,
            JumpIfFloatGreaterOrEqual | JumpIfFloatGreaterOrEqualOrUnordered => {
                JumpIfGreaterOrEqual
            }
            _ => return None,
        })
    }

    /// Evaluate an integer branch on two known operands. Like every ternary operation the
    /// comparison reads `second op first`.
    pub fn should_jump(self, size: u32, first: i64, second: i64) -> Option<bool> {
        use TernaryOperation::*;
        let (a, b) = if size == 8 {
            (second, first)
        } else {
            (second as i32 as i64, first as i32 as i64)
        };
        Some(match self {
            JumpIfEqual => a == b,
            JumpIfNotEqual => a != b,
            JumpIfLess => a < b,
            JumpIfGreater => a > b,
            JumpIfLessOrEqual => a <= b,
            JumpIfGreaterOrEqual => a >= b,
            _ => return None,
        })
    }
}

/// Any operation, used where helpers and condensing rules are looked up uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyOperation {
    Nullary(Operation),
    Unary(UnaryOperation),
    Binary(BinaryOperation),
    Ternary(TernaryOperation),
}

impl fmt::Display for AnyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyOperation::Nullary(op) => write!(f, "{:?}", op),
            AnyOperation::Unary(op) => write!(f, "{:?}", op),
            AnyOperation::Binary(op) => write!(f, "{:?}", op),
            AnyOperation::Ternary(op) => write!(f, "{:?}", op),
        }
    }
}
