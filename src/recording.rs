//! An emitter that records the operations it receives instead of encoding them.
//!
//! Every operation occupies sixteen bytes of zeroed output, so code targets and patch sites
//! still get distinct, predictable offsets. Deferred constants report a patch eight bytes
//! into their instruction. Front ends use it to check what the core asked for without
//! decoding machine code.

use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::CodeTarget;
use crate::target::{
    Assembler, BinaryOperation, Constant, MachineCode, Operand, Operation, Patch,
    ScratchRegisters, TernaryOperation, UnaryOperation,
};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Bytes per recorded instruction.
pub const RECORD_SIZE: u32 = 16;

/// One call the core made on the emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Nullary(Operation),
    Unary {
        op: UnaryOperation,
        size: u32,
        a: Operand,
    },
    Binary {
        op: BinaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
    },
    Ternary {
        op: TernaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        c_size: u32,
        c: Operand,
    },
    StackCheck {
        handler: i64,
        stack_limit_offset: u32,
    },
    AllocateFrame(u32),
    AdjustFrame(u32),
    PopFrameForTailCall {
        footprint: u32,
        offset: i32,
        return_address_surrogate: Option<u8>,
        frame_pointer_surrogate: Option<u8>,
    },
    Return {
        footprint: u32,
        argument_footprint: u32,
    },
    Bind(CodeTarget),
}

pub type RecordLog = Rc<RefCell<Vec<Recorded>>>;

pub struct RecordingAssembler {
    log: RecordLog,
    instructions: u32,
    targets: HashMap<CodeTarget, u32>,
    patches: Vec<Patch>,
}

impl Default for RecordingAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingAssembler {
    pub fn new() -> Self {
        Self::with_log(Self::new_log())
    }

    pub fn new_log() -> RecordLog {
        Rc::new(RefCell::new(Vec::new()))
    }

    /// Record into a log the caller keeps a handle to.
    pub fn with_log(log: RecordLog) -> Self {
        Self {
            log,
            instructions: 0,
            targets: HashMap::new(),
            patches: Vec::new(),
        }
    }

    pub fn log(&self) -> RecordLog {
        self.log.clone()
    }

    fn record(&mut self, entry: Recorded, operands: &[Operand]) {
        let offset = self.instructions * RECORD_SIZE;
        let deferred = operands.iter().find_map(|operand| match operand {
            Operand::Constant(Constant::Deferred(p)) | Operand::Address(Constant::Deferred(p)) => {
                Some(*p)
            }
            _ => None,
        });
        if let Some(promise) = deferred {
            self.patches.push(Patch {
                offset: offset + RECORD_SIZE / 2,
                promise,
            });
        }
        self.instructions += 1;
        self.log.borrow_mut().push(entry);
    }
}

impl Assembler for RecordingAssembler {
    fn apply0(&mut self, op: Operation) -> CompileResult<()> {
        self.record(Recorded::Nullary(op), &[]);
        Ok(())
    }

    fn apply1(&mut self, op: UnaryOperation, size: u32, a: Operand) -> CompileResult<()> {
        self.record(Recorded::Unary { op, size, a }, &[a]);
        Ok(())
    }

    fn apply2(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        _scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        self.record(
            Recorded::Binary {
                op,
                a_size,
                a,
                b_size,
                b,
            },
            &[a, b],
        );
        Ok(())
    }

    fn apply3(
        &mut self,
        op: TernaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        c_size: u32,
        c: Operand,
        _scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        self.record(
            Recorded::Ternary {
                op,
                a_size,
                a,
                b_size,
                b,
                c_size,
                c,
            },
            &[a, b, c],
        );
        Ok(())
    }

    fn check_stack_overflow(
        &mut self,
        handler: i64,
        stack_limit_offset: u32,
    ) -> CompileResult<()> {
        self.record(
            Recorded::StackCheck {
                handler,
                stack_limit_offset,
            },
            &[],
        );
        Ok(())
    }

    fn allocate_frame(&mut self, footprint: u32) -> CompileResult<()> {
        self.record(Recorded::AllocateFrame(footprint), &[]);
        Ok(())
    }

    fn adjust_frame(&mut self, difference: u32) -> CompileResult<()> {
        self.record(Recorded::AdjustFrame(difference), &[]);
        Ok(())
    }

    fn pop_frame_for_tail_call(
        &mut self,
        footprint: u32,
        offset: i32,
        return_address_surrogate: Option<u8>,
        frame_pointer_surrogate: Option<u8>,
        _scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        self.record(
            Recorded::PopFrameForTailCall {
                footprint,
                offset,
                return_address_surrogate,
                frame_pointer_surrogate,
            },
            &[],
        );
        Ok(())
    }

    fn pop_frame_and_pop_arguments_and_return(
        &mut self,
        footprint: u32,
        argument_footprint: u32,
    ) -> CompileResult<()> {
        self.record(
            Recorded::Return {
                footprint,
                argument_footprint,
            },
            &[],
        );
        Ok(())
    }

    fn bind(&mut self, target: CodeTarget) -> CompileResult<()> {
        let offset = self.instructions * RECORD_SIZE;
        if self.targets.insert(target, offset).is_some() {
            return Err(CompileError::emission(format!("{:?} bound twice", target)));
        }
        self.log.borrow_mut().push(Recorded::Bind(target));
        Ok(())
    }

    fn finish(&mut self) -> CompileResult<MachineCode> {
        log::debug!(
            "recorded {} instructions, {} deferred constants",
            self.instructions,
            self.patches.len()
        );
        Ok(MachineCode {
            bytes: vec![0; (self.instructions * RECORD_SIZE) as usize],
            targets: self.targets.clone(),
            patches: self.patches.clone(),
        })
    }
}
