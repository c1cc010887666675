// This module provides the x86-64 emitter on top of the iced-x86 code assembler. X64Assembler
// receives operations with fully placed operands and expands each into one or a few machine
// instructions: register and memory moves with sign or zero extension, two-address integer
// and SSE arithmetic (copying the second operand into the destination first when the
// allocator placed them apart), rax/rdx division, cl shifts, compares followed by condition
// jumps (float compares also test the parity flag for unordered operands), and calls or jumps
// through registers, memory, labels or absolute addresses. Absolute addresses are reached
// through r11, which the architecture keeps out of allocation. Every code target gets one
// iced label; targets bound at the same position share a label because iced accepts only one
// label per instruction. Constants whose value is known only after layout are emitted as a
// ten-byte `mov r64, imm64` whose immediate is reported as a patch site. Finishing runs the
// block encoder with instruction offsets enabled so labels and patches map to byte offsets.

//! x86-64 instruction emission using iced-x86.

use super::{is_float_register, GENERAL_REGISTER_MASK, RAX, RBP, RBX, RDX, RSP, SCRATCH};
use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::{CodeTarget, PromiseId};
use crate::target::{
    Assembler, BinaryOperation, Constant, MachineCode, Operand, Operation, Patch,
    ScratchRegisters, TernaryOperation, UnaryOperation, WORD,
};
use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Code, IcedError, Instruction, MemoryOperand, Register};
use log::trace;

/// Build an instruction from its code and operands and append it.
macro_rules! emit {
    ($asm:expr, $code:expr, $op0:expr $(,)?) => {
        $asm.emit(Instruction::with1($code, $op0).map_err(iced_error)?)
    };
    ($asm:expr, $code:expr, $op0:expr, $op1:expr $(,)?) => {
        $asm.emit(Instruction::with2($code, $op0, $op1).map_err(iced_error)?)
    };
}

const GP64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GP32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GP16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GP8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const XMM: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

/// Label-addressed forms need the code assembler's typed registers.
const ASM64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

fn iced_error(e: IcedError) -> CompileError {
    CompileError::emission(e.to_string())
}

fn gp(register: u8, size: u32) -> CompileResult<Register> {
    let table = match size {
        1 => &GP8,
        2 => &GP16,
        4 => &GP32,
        _ => &GP64,
    };
    table
        .get(register as usize)
        .copied()
        .ok_or_else(|| CompileError::InvalidOperand {
            reason: format!("register {} is not a general purpose register", register),
        })
}

fn gp64(register: u8) -> CompileResult<Register> {
    gp(register, 8)
}

/// Registers narrower than a word are written through their 32-bit form.
fn gp_at_least_32(register: u8, size: u32) -> CompileResult<Register> {
    gp(register, size.max(4))
}

fn xmm(register: u8) -> CompileResult<Register> {
    if !is_float_register(register) {
        return Err(CompileError::InvalidOperand {
            reason: format!("register {} is not an SSE register", register),
        });
    }
    Ok(XMM[(register - 16) as usize])
}

fn memory(base: u8, offset: i32, index: Option<u8>, scale: u8) -> CompileResult<MemoryOperand> {
    let index = match index {
        Some(i) => gp64(i)?,
        None => Register::None,
    };
    Ok(MemoryOperand::with_base_index_scale_displ_size(
        gp64(base)?,
        index,
        scale as u32,
        offset as i64,
        1,
    ))
}

fn fits_i32(value: i64) -> bool {
    value as i32 as i64 == value
}

/// Source of a two-address integer instruction.
#[derive(Debug, Clone, Copy)]
enum Source {
    Register(Register),
    Memory(MemoryOperand),
    Immediate(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    Below,
    Above,
    BelowOrEqual,
    AboveOrEqual,
    Parity,
}

/// Where a condition jump goes: the branch target, or past the whole sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Target,
    Skip,
}

fn branch_conditions(op: TernaryOperation) -> CompileResult<&'static [(Exit, Condition)]> {
    use Condition::*;
    use Exit::*;
    use TernaryOperation::*;
    Ok(match op {
        JumpIfLess => &[(Target, Less)],
        JumpIfGreater => &[(Target, Greater)],
        JumpIfLessOrEqual => &[(Target, LessOrEqual)],
        JumpIfGreaterOrEqual => &[(Target, GreaterOrEqual)],
        JumpIfEqual => &[(Target, Equal)],
        JumpIfNotEqual => &[(Target, NotEqual)],
        JumpIfFloatEqual => &[(Skip, Parity), (Target, Equal)],
        JumpIfFloatNotEqual => &[(Target, NotEqual), (Target, Parity)],
        JumpIfFloatLess => &[(Skip, Parity), (Target, Below)],
        JumpIfFloatGreater => &[(Target, Above)],
        JumpIfFloatLessOrEqual => &[(Skip, Parity), (Target, BelowOrEqual)],
        JumpIfFloatGreaterOrEqual => &[(Target, AboveOrEqual)],
        JumpIfFloatLessOrUnordered => &[(Target, Below)],
        JumpIfFloatGreaterOrUnordered => &[(Target, Above), (Target, Parity)],
        JumpIfFloatLessOrEqualOrUnordered => &[(Target, BelowOrEqual)],
        JumpIfFloatGreaterOrEqualOrUnordered => &[(Target, AboveOrEqual), (Target, Parity)],
        _ => {
            return Err(CompileError::InvalidOperand {
                reason: format!("{:?} is not a branch", op),
            })
        }
    })
}

/// x86-64 emitter.
pub struct X64Assembler {
    asm: CodeAssembler,
    labels: HashMap<CodeTarget, CodeLabel>,
    bound: HashSet<CodeTarget>,
    /// Label placed at the current position with no instruction after it yet.
    pending: Option<CodeLabel>,
    /// Instruction index of every deferred `mov r64, imm64`.
    patches: Vec<(usize, PromiseId)>,
    tail_calls: bool,
}

impl X64Assembler {
    pub fn new() -> CompileResult<Self> {
        Ok(Self {
            asm: CodeAssembler::new(64).map_err(iced_error)?,
            labels: HashMap::new(),
            bound: HashSet::new(),
            pending: None,
            patches: Vec::new(),
            tail_calls: false,
        })
    }

    /// Pop caller-pushed arguments on return, matching callers that compile tail calls.
    pub fn with_tail_calls(mut self, enabled: bool) -> Self {
        self.tail_calls = enabled;
        self
    }

    fn emit(&mut self, instruction: Instruction) -> CompileResult<()> {
        self.asm.add_instruction(instruction).map_err(iced_error)?;
        self.pending = None;
        Ok(())
    }

    /// Run a label-addressed code assembler method.
    fn code(
        &mut self,
        f: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    ) -> CompileResult<()> {
        f(&mut self.asm).map_err(iced_error)?;
        self.pending = None;
        Ok(())
    }

    fn label(&mut self, target: CodeTarget) -> CodeLabel {
        if let Some(label) = self.labels.get(&target) {
            return *label;
        }
        let label = self.asm.create_label();
        self.labels.insert(target, label);
        label
    }

    /// Place `label` here, padding with a nop if another label already sits here.
    fn place(&mut self, label: &mut CodeLabel) -> CompileResult<()> {
        if self.pending.is_some() {
            self.emit(Instruction::with(Code::Nopd))?;
        }
        self.asm.set_label(label).map_err(iced_error)?;
        self.pending = Some(*label);
        Ok(())
    }

    fn jump_if(&mut self, condition: Condition, label: CodeLabel) -> CompileResult<()> {
        use Condition::*;
        self.code(|asm| match condition {
            Equal => asm.je(label),
            NotEqual => asm.jne(label),
            Less => asm.jl(label),
            Greater => asm.jg(label),
            LessOrEqual => asm.jle(label),
            GreaterOrEqual => asm.jge(label),
            Below => asm.jb(label),
            Above => asm.ja(label),
            BelowOrEqual => asm.jbe(label),
            AboveOrEqual => asm.jae(label),
            Parity => asm.jp(label),
        })
    }

    /// Load a constant into a general register.
    fn load_constant(&mut self, register: u8, constant: Constant) -> CompileResult<()> {
        let r = gp64(register)?;
        match constant {
            Constant::Immediate(v) if fits_i32(v) => {
                emit!(self, Code::Mov_rm64_imm32, r, v as i32)
            }
            Constant::Immediate(v) => emit!(self, Code::Mov_r64_imm64, r, v),
            Constant::Label(target) => {
                let label = self.label(target);
                let dst = ASM64[register as usize];
                self.code(|asm| asm.lea(dst, ptr(label)))
            }
            Constant::Deferred(promise) => {
                self.patches.push((self.asm.instructions().len(), promise));
                emit!(self, Code::Mov_r64_imm64, r, 0i64)
            }
        }
    }

    fn call_or_jump(&mut self, call: bool, target: Operand) -> CompileResult<()> {
        let (via_register, via_memory) = if call {
            (Code::Call_rm64, Code::Call_rm64)
        } else {
            (Code::Jmp_rm64, Code::Jmp_rm64)
        };
        match target {
            Operand::Register(r) => emit!(self, via_register, gp64(r)?),
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => emit!(self, via_memory, memory(base, offset, index, scale)?),
            Operand::Constant(Constant::Label(t)) => {
                let label = self.label(t);
                if call {
                    self.code(|asm| asm.call(label))
                } else {
                    self.code(|asm| asm.jmp(label))
                }
            }
            Operand::Constant(constant) => {
                self.load_constant(SCRATCH, constant)?;
                emit!(self, via_register, gp64(SCRATCH)?)
            }
            Operand::Address(_) => Err(CompileError::InvalidOperand {
                reason: "calls and jumps cannot go through an address operand".into(),
            }),
        }
    }

    /// Resolve the first operand of an integer instruction, materializing constants that do
    /// not fit an immediate field. Returns the borrowed temporary, if any.
    fn integer_source(
        &mut self,
        size: u32,
        a: Operand,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<(Source, Option<u8>)> {
        match a {
            Operand::Register(r) => Ok((Source::Register(gp_at_least_32(r, size)?), None)),
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => Ok((Source::Memory(memory(base, offset, index, scale)?), None)),
            Operand::Constant(Constant::Immediate(v)) if size <= 4 || fits_i32(v) => {
                Ok((Source::Immediate(v as i32), None))
            }
            Operand::Constant(constant) => {
                let tmp = scratch.acquire_temporary(GENERAL_REGISTER_MASK)?;
                if let Err(err) = self.load_constant(tmp, constant) {
                    scratch.release_temporary(tmp);
                    return Err(err);
                }
                Ok((Source::Register(gp_at_least_32(tmp, size)?), Some(tmp)))
            }
            Operand::Address(_) => Err(CompileError::InvalidOperand {
                reason: "address operands cannot feed arithmetic".into(),
            }),
        }
    }

    /// `dst op= src` for the two-address integer forms, given the (r, rm) and (rm, imm32)
    /// encodings of each width.
    fn integer_op(
        &mut self,
        size: u32,
        codes: [(Code, Code); 2],
        dst: Register,
        src: Source,
    ) -> CompileResult<()> {
        let (rm, imm) = if size == 8 { codes[1] } else { codes[0] };
        match src {
            Source::Register(r) => emit!(self, rm, dst, r),
            Source::Memory(m) => emit!(self, rm, dst, m),
            Source::Immediate(v) => emit!(self, imm, dst, v),
        }
    }

    fn copy_register(&mut self, size: u32, from: u8, to: u8) -> CompileResult<()> {
        if from == to {
            return Ok(());
        }
        match (is_float_register(from), is_float_register(to)) {
            (false, false) => {
                let code = if size == 8 { Code::Mov_r64_rm64 } else { Code::Mov_r32_rm32 };
                emit!(self, code, gp_at_least_32(to, size)?, gp_at_least_32(from, size)?)
            }
            (true, true) => emit!(self, Code::Movaps_xmm_xmmm128, xmm(to)?, xmm(from)?),
            (false, true) => {
                if size == 8 {
                    emit!(self, Code::Movq_xmm_rm64, xmm(to)?, gp64(from)?)
                } else {
                    emit!(self, Code::Movd_xmm_rm32, xmm(to)?, gp(from, 4)?)
                }
            }
            (true, false) => {
                if size == 8 {
                    emit!(self, Code::Movq_rm64_xmm, gp64(to)?, xmm(from)?)
                } else {
                    emit!(self, Code::Movd_rm32_xmm, gp(to, 4)?, xmm(from)?)
                }
            }
        }
    }

    /// Sign-extending or truncating register move from `a_size` to `b_size` bytes.
    fn move_register(&mut self, a_size: u32, a: u8, b_size: u32, b: u8) -> CompileResult<()> {
        if is_float_register(a) || is_float_register(b) || a_size >= b_size {
            return self.copy_register(b_size.min(a_size).max(4), a, b);
        }
        let code = match (a_size, b_size) {
            (1, 8) => Code::Movsx_r64_rm8,
            (2, 8) => Code::Movsx_r64_rm16,
            (4, 8) => Code::Movsxd_r64_rm32,
            (1, _) => Code::Movsx_r32_rm8,
            (2, _) => Code::Movsx_r32_rm16,
            _ => return self.copy_register(4, a, b),
        };
        emit!(self, code, gp_at_least_32(b, b_size)?, gp(a, a_size)?)
    }

    fn load(&mut self, a_size: u32, m: MemoryOperand, b_size: u32, b: u8) -> CompileResult<()> {
        if is_float_register(b) {
            let code = if a_size == 4 {
                Code::Movss_xmm_xmmm32
            } else {
                Code::Movsd_xmm_xmmm64
            };
            return emit!(self, code, xmm(b)?, m);
        }
        let wide = b_size == 8;
        let code = match a_size {
            1 if wide => Code::Movsx_r64_rm8,
            1 => Code::Movsx_r32_rm8,
            2 if wide => Code::Movsx_r64_rm16,
            2 => Code::Movsx_r32_rm16,
            4 if wide => Code::Movsxd_r64_rm32,
            8 if wide => Code::Mov_r64_rm64,
            _ => Code::Mov_r32_rm32,
        };
        emit!(self, code, gp_at_least_32(b, b_size)?, m)
    }

    fn store(&mut self, a: u8, b_size: u32, m: MemoryOperand) -> CompileResult<()> {
        if is_float_register(a) {
            let code = if b_size == 4 {
                Code::Movss_xmmm32_xmm
            } else {
                Code::Movsd_xmmm64_xmm
            };
            return emit!(self, code, m, xmm(a)?);
        }
        let code = match b_size {
            1 => Code::Mov_rm8_r8,
            2 => Code::Mov_rm16_r16,
            4 => Code::Mov_rm32_r32,
            _ => Code::Mov_rm64_r64,
        };
        emit!(self, code, m, gp(a, b_size)?)
    }

    fn store_immediate(&mut self, value: i64, b_size: u32, m: MemoryOperand) -> CompileResult<()> {
        match b_size {
            1 => emit!(self, Code::Mov_rm8_imm8, m, value as i8 as i32),
            2 => emit!(self, Code::Mov_rm16_imm16, m, value as i16 as i32),
            4 => emit!(self, Code::Mov_rm32_imm32, m, value as i32),
            _ => emit!(self, Code::Mov_rm64_imm32, m, value as i32),
        }
    }

    fn with_temporary<T>(
        &mut self,
        scratch: &mut dyn ScratchRegisters,
        f: impl FnOnce(&mut Self, u8) -> CompileResult<T>,
    ) -> CompileResult<T> {
        let tmp = scratch.acquire_temporary(GENERAL_REGISTER_MASK)?;
        let result = f(self, tmp);
        scratch.release_temporary(tmp);
        result
    }

    fn move_operands(
        &mut self,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        match (a, b) {
            (Operand::Register(x), Operand::Register(y)) => {
                self.move_register(a_size, x, b_size, y)
            }
            (
                Operand::Memory {
                    base,
                    offset,
                    index,
                    scale,
                },
                Operand::Register(y),
            ) => self.load(a_size, memory(base, offset, index, scale)?, b_size, y),
            (
                Operand::Register(x),
                Operand::Memory {
                    base,
                    offset,
                    index,
                    scale,
                },
            ) => self.store(x, b_size, memory(base, offset, index, scale)?),
            (Operand::Constant(c), Operand::Register(y)) => {
                if is_float_register(y) {
                    self.with_temporary(scratch, |s, tmp| {
                        s.load_constant(tmp, c)?;
                        s.copy_register(b_size.max(4), tmp, y)
                    })
                } else if let (Constant::Immediate(v), true) = (c, b_size <= 4) {
                    emit!(self, Code::Mov_r32_imm32, gp(y, 4)?, v as i32)
                } else {
                    self.load_constant(y, c)
                }
            }
            (
                Operand::Constant(c),
                Operand::Memory {
                    base,
                    offset,
                    index,
                    scale,
                },
            ) => {
                let m = memory(base, offset, index, scale)?;
                match c {
                    Constant::Immediate(v) if b_size <= 4 || fits_i32(v) => {
                        self.store_immediate(v, b_size, m)
                    }
                    _ => self.with_temporary(scratch, |s, tmp| {
                        s.load_constant(tmp, c)?;
                        s.store(tmp, b_size, m)
                    }),
                }
            }
            (Operand::Address(c), Operand::Register(y)) => {
                if is_float_register(y) {
                    self.with_temporary(scratch, |s, tmp| {
                        s.load_constant(tmp, c)?;
                        s.load(a_size, memory(tmp, 0, None, 1)?, b_size, y)
                    })
                } else {
                    self.load_constant(y, c)?;
                    self.load(a_size, memory(y, 0, None, 1)?, b_size, y)
                }
            }
            (Operand::Memory { .. } | Operand::Address(_), Operand::Memory { .. }) => self
                .with_temporary(scratch, |s, tmp| {
                    s.move_operands(a_size, a, WORD, Operand::Register(tmp), &mut NoScratch)?;
                    s.move_operands(WORD, Operand::Register(tmp), b_size, b, &mut NoScratch)
                }),
            (_, b) => Err(CompileError::InvalidOperand {
                reason: format!("cannot move into {:?}", b),
            }),
        }
    }

    fn move_zero_extend(&mut self, a_size: u32, a: Operand, b: u8) -> CompileResult<()> {
        let (code, dst, src_size) = match a_size {
            1 => (Code::Movzx_r32_rm8, gp(b, 4)?, 1),
            2 => (Code::Movzx_r32_rm16, gp(b, 4)?, 2),
            8 => (Code::Mov_r64_rm64, gp64(b)?, 8),
            // writing a 32-bit register clears the upper half
            _ => (Code::Mov_r32_rm32, gp(b, 4)?, 4),
        };
        match a {
            Operand::Register(r) => {
                if a_size == 8 && r == b {
                    return Ok(());
                }
                emit!(self, code, dst, gp(r, src_size)?)
            }
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => emit!(self, code, dst, memory(base, offset, index, scale)?),
            other => Err(CompileError::InvalidOperand {
                reason: format!("cannot zero-extend {:?}", other),
            }),
        }
    }

    fn float_source(&self, a: Operand) -> CompileResult<Source> {
        match a {
            Operand::Register(r) => Ok(Source::Register(xmm(r)?)),
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => Ok(Source::Memory(memory(base, offset, index, scale)?)),
            other => Err(CompileError::InvalidOperand {
                reason: format!("{:?} is not a float operand", other),
            }),
        }
    }

    fn emit_float(&mut self, code: Code, dst: Register, src: Source) -> CompileResult<()> {
        match src {
            Source::Register(r) => emit!(self, code, dst, r),
            Source::Memory(m) => emit!(self, code, dst, m),
            Source::Immediate(_) => Err(CompileError::InvalidOperand {
                reason: "SSE instructions take no immediate".into(),
            }),
        }
    }

    /// Flip or clear the sign bit by way of a general register.
    fn float_sign(
        &mut self,
        clear: bool,
        size: u32,
        a: Operand,
        b: u8,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        let wide = size == 8;
        let code = match (clear, wide) {
            (false, true) => Code::Btc_rm64_imm8,
            (false, false) => Code::Btc_rm32_imm8,
            (true, true) => Code::Btr_rm64_imm8,
            (true, false) => Code::Btr_rm32_imm8,
        };
        let bit: i32 = if wide { 63 } else { 31 };
        self.with_temporary(scratch, |s, tmp| {
            s.move_operands(size, a, size, Operand::Register(tmp), &mut NoScratch)?;
            emit!(s, code, gp(tmp, if wide { 8 } else { 4 })?, bit)?;
            s.copy_register(if wide { 8 } else { 4 }, tmp, b)
        })
    }

    fn branch(
        &mut self,
        op: TernaryOperation,
        size: u32,
        a: Operand,
        b: Operand,
        c: Operand,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        if op.is_float_branch() {
            let code = if size == 4 {
                Code::Ucomiss_xmm_xmmm32
            } else {
                Code::Ucomisd_xmm_xmmm64
            };
            let Operand::Register(second) = b else {
                return Err(CompileError::InvalidOperand {
                    reason: format!("{:?} needs its second operand in a register", op),
                });
            };
            let src = self.float_source(a)?;
            self.emit_float(code, xmm(second)?, src)?;
        } else {
            let (src, tmp) = self.integer_source(size, a, scratch)?;
            let compared = self.compare(size, src, b);
            if let Some(tmp) = tmp {
                scratch.release_temporary(tmp);
            }
            compared?;
        }

        let (mut target, far) = match c {
            Operand::Constant(Constant::Label(t)) => (self.label(t), None),
            Operand::Constant(constant) => (self.asm.create_label(), Some(constant)),
            other => {
                return Err(CompileError::InvalidOperand {
                    reason: format!("branch target {:?} must be a constant", other),
                })
            }
        };
        let conditions = branch_conditions(op)?;
        let needs_skip = far.is_some() || conditions.iter().any(|(exit, _)| *exit == Exit::Skip);
        let mut skip = self.asm.create_label();
        for &(exit, condition) in conditions {
            let label = match exit {
                Exit::Target => target,
                Exit::Skip => skip,
            };
            self.jump_if(condition, label)?;
        }
        if let Some(constant) = far {
            self.code(|asm| asm.jmp(skip))?;
            self.place(&mut target)?;
            self.load_constant(SCRATCH, constant)?;
            emit!(self, Code::Jmp_rm64, gp64(SCRATCH)?)?;
        }
        if needs_skip {
            self.place(&mut skip)?;
        }
        Ok(())
    }

    /// `cmp b, a`: flags reflect `b - a`.
    fn compare(&mut self, size: u32, a: Source, b: Operand) -> CompileResult<()> {
        let wide = size == 8;
        match b {
            Operand::Register(r) => {
                let (rm, imm) = if wide {
                    (Code::Cmp_r64_rm64, Code::Cmp_rm64_imm32)
                } else {
                    (Code::Cmp_r32_rm32, Code::Cmp_rm32_imm32)
                };
                self.integer_op(size, [(rm, imm), (rm, imm)], gp_at_least_32(r, size)?, a)
            }
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => {
                let m = memory(base, offset, index, scale)?;
                match a {
                    Source::Register(r) => {
                        let code = if wide { Code::Cmp_rm64_r64 } else { Code::Cmp_rm32_r32 };
                        emit!(self, code, m, r)
                    }
                    Source::Immediate(v) => {
                        let code = if wide {
                            Code::Cmp_rm64_imm32
                        } else {
                            Code::Cmp_rm32_imm32
                        };
                        emit!(self, code, m, v)
                    }
                    Source::Memory(_) => Err(CompileError::InvalidOperand {
                        reason: "compare of two memory operands".into(),
                    }),
                }
            }
            other => Err(CompileError::InvalidOperand {
                reason: format!("cannot compare against {:?}", other),
            }),
        }
    }

    fn combine(
        &mut self,
        op: TernaryOperation,
        size: u32,
        a: Operand,
        b: u8,
        c: u8,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        use TernaryOperation::*;
        match op {
            Divide | Remainder => {
                if b != RAX || c != RAX {
                    return Err(CompileError::InvalidOperand {
                        reason: format!("{:?} works on rax, got {} and {}", op, b, c),
                    });
                }
                let Operand::Register(divisor) = a else {
                    return Err(CompileError::InvalidOperand {
                        reason: format!("{:?} needs a register divisor", op),
                    });
                };
                if size == 8 {
                    self.emit(Instruction::with(Code::Cqo))?;
                    emit!(self, Code::Idiv_rm64, gp64(divisor)?)?;
                } else {
                    self.emit(Instruction::with(Code::Cdq))?;
                    emit!(self, Code::Idiv_rm32, gp(divisor, 4)?)?;
                }
                if op == Remainder {
                    self.copy_register(size.max(4), RDX, RAX)?;
                }
                Ok(())
            }
            ShiftLeft | ShiftRight | UnsignedShiftRight => {
                self.copy_register(size.max(4), b, c)?;
                let wide = size == 8;
                let (by_cl, by_imm) = match (op, wide) {
                    (ShiftLeft, true) => (Code::Shl_rm64_CL, Code::Shl_rm64_imm8),
                    (ShiftLeft, false) => (Code::Shl_rm32_CL, Code::Shl_rm32_imm8),
                    (ShiftRight, true) => (Code::Sar_rm64_CL, Code::Sar_rm64_imm8),
                    (ShiftRight, false) => (Code::Sar_rm32_CL, Code::Sar_rm32_imm8),
                    (_, true) => (Code::Shr_rm64_CL, Code::Shr_rm64_imm8),
                    (_, false) => (Code::Shr_rm32_CL, Code::Shr_rm32_imm8),
                };
                let dst = gp_at_least_32(c, size)?;
                match a {
                    Operand::Register(_) => emit!(self, by_cl, dst, Register::CL),
                    Operand::Constant(Constant::Immediate(v)) => {
                        let bits = if wide { 63 } else { 31 };
                        emit!(self, by_imm, dst, (v & bits) as i32)
                    }
                    other => Err(CompileError::InvalidOperand {
                        reason: format!("shift count {:?} must be rcx or an immediate", other),
                    }),
                }
            }
            Multiply => {
                let (src, tmp) = self.integer_source(size, a, scratch)?;
                let result = match src {
                    Source::Immediate(v) => {
                        let code = if size == 8 {
                            Code::Imul_r64_rm64_imm32
                        } else {
                            Code::Imul_r32_rm32_imm32
                        };
                        Instruction::with3(
                            code,
                            gp_at_least_32(c, size)?,
                            gp_at_least_32(b, size)?,
                            v,
                        )
                        .map_err(iced_error)
                        .and_then(|i| self.emit(i))
                    }
                    src => self.copy_register(size.max(4), b, c).and_then(|_| {
                        self.integer_op(
                            size,
                            [
                                (Code::Imul_r32_rm32, Code::Imul_r32_rm32_imm32),
                                (Code::Imul_r64_rm64, Code::Imul_r64_rm64_imm32),
                            ],
                            gp_at_least_32(c, size)?,
                            src,
                        )
                    }),
                };
                if let Some(tmp) = tmp {
                    scratch.release_temporary(tmp);
                }
                result
            }
            Add | Subtract | And | Or | Xor => {
                let codes = match op {
                    Add => [
                        (Code::Add_r32_rm32, Code::Add_rm32_imm32),
                        (Code::Add_r64_rm64, Code::Add_rm64_imm32),
                    ],
                    Subtract => [
                        (Code::Sub_r32_rm32, Code::Sub_rm32_imm32),
                        (Code::Sub_r64_rm64, Code::Sub_rm64_imm32),
                    ],
                    And => [
                        (Code::And_r32_rm32, Code::And_rm32_imm32),
                        (Code::And_r64_rm64, Code::And_rm64_imm32),
                    ],
                    Or => [
                        (Code::Or_r32_rm32, Code::Or_rm32_imm32),
                        (Code::Or_r64_rm64, Code::Or_rm64_imm32),
                    ],
                    _ => [
                        (Code::Xor_r32_rm32, Code::Xor_rm32_imm32),
                        (Code::Xor_r64_rm64, Code::Xor_rm64_imm32),
                    ],
                };
                let (src, tmp) = self.integer_source(size, a, scratch)?;
                let result = self
                    .copy_register(size.max(4), b, c)
                    .and_then(|_| self.integer_op(size, codes, gp_at_least_32(c, size)?, src));
                if let Some(tmp) = tmp {
                    scratch.release_temporary(tmp);
                }
                result
            }
            FloatAdd | FloatSubtract | FloatMultiply | FloatDivide => {
                let single = size == 4;
                let code = match (op, single) {
                    (FloatAdd, false) => Code::Addsd_xmm_xmmm64,
                    (FloatAdd, true) => Code::Addss_xmm_xmmm32,
                    (FloatSubtract, false) => Code::Subsd_xmm_xmmm64,
                    (FloatSubtract, true) => Code::Subss_xmm_xmmm32,
                    (FloatMultiply, false) => Code::Mulsd_xmm_xmmm64,
                    (FloatMultiply, true) => Code::Mulss_xmm_xmmm32,
                    (_, false) => Code::Divsd_xmm_xmmm64,
                    (_, true) => Code::Divss_xmm_xmmm32,
                };
                let src = self.float_source(a)?;
                self.copy_register(size, b, c)?;
                self.emit_float(code, xmm(c)?, src)
            }
            other => Err(CompileError::InvalidOperand {
                reason: format!("{:?} has no inline x86-64 form", other),
            }),
        }
    }

    /// Move the return address, reload rbp and drop the frame so that `offset` words of
    /// the caller's argument area are reused by the tail-called method.
    fn pop_frame_with_offset(
        &mut self,
        footprint: u32,
        offset: i32,
        return_address_surrogate: Option<u8>,
        frame_pointer_surrogate: Option<u8>,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        let word = WORD as i64;
        let footprint = footprint as i64;
        let offset_words = offset as i64;
        let base_size = 1;
        let to_i32 = |v: i64| {
            i32::try_from(v).map_err(|_| CompileError::InvalidOperand {
                reason: format!("frame offset {} out of range", v),
            })
        };

        let return_address_src = to_i32((footprint + base_size) * word)?;
        let return_address_dst = to_i32((footprint - offset_words + base_size) * word)?;
        self.with_temporary(scratch, |s, tmp| {
            s.load(8, memory(RSP, return_address_src, None, 1)?, 8, tmp)?;
            s.store(tmp, 8, memory(RSP, return_address_dst, None, 1)?)
        })?;
        self.load(8, memory(RSP, to_i32(footprint * word)?, None, 1)?, 8, RBP)?;
        emit!(self, Code::Add_rm64_imm32, gp64(RSP)?, return_address_dst)?;

        if let Some(r) = return_address_surrogate {
            self.store(r, 8, memory(RSP, to_i32(offset_words * word)?, None, 1)?)?;
        }
        if let Some(r) = frame_pointer_surrogate {
            self.store(r, 8, memory(RSP, to_i32((offset_words - 1) * word)?, None, 1)?)?;
        }
        Ok(())
    }

    fn pop_frame(&mut self) -> CompileResult<()> {
        emit!(self, Code::Mov_r64_rm64, gp64(RSP)?, gp64(RBP)?)?;
        emit!(self, Code::Pop_r64, gp64(RBP)?)
    }
}

/// Scratch source for nested moves that never need a temporary of their own.
struct NoScratch;

impl ScratchRegisters for NoScratch {
    fn acquire_temporary(&mut self, mask: u64) -> CompileResult<u8> {
        Err(CompileError::ScratchUnavailable {
            reason: format!("nested move wanted a temporary from {:#x}", mask),
        })
    }

    fn release_temporary(&mut self, _register: u8) {}
}

impl Assembler for X64Assembler {
    fn apply0(&mut self, op: Operation) -> CompileResult<()> {
        match op {
            Operation::Return => self.emit(Instruction::with(Code::Retnq)),
            Operation::StoreLoadBarrier => self.emit(Instruction::with(Code::Mfence)),
            // x86-64 orders loads and stores on its own
            Operation::LoadBarrier | Operation::StoreStoreBarrier => Ok(()),
            Operation::Trap => self.emit(Instruction::with(Code::Int3)),
        }
    }

    fn apply1(&mut self, op: UnaryOperation, _size: u32, a: Operand) -> CompileResult<()> {
        self.call_or_jump(op.is_call(), a)
    }

    fn apply2(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        use BinaryOperation::*;
        trace!("{:?} {:?}:{} -> {:?}:{}", op, a, a_size, b, b_size);
        if matches!(op, Move | MoveLow) {
            return self.move_operands(a_size, a, b_size, b, scratch);
        }
        let Operand::Register(dst) = b else {
            return Err(CompileError::InvalidOperand {
                reason: format!("{:?} needs a register destination, got {:?}", op, b),
            });
        };
        match op {
            MoveZ => self.move_zero_extend(a_size, a, dst),
            MoveHigh => match a {
                Operand::Register(src) => {
                    self.copy_register(8, src, dst)?;
                    emit!(self, Code::Shr_rm64_imm8, gp64(dst)?, 32i32)
                }
                Operand::Memory {
                    base,
                    offset,
                    index,
                    scale,
                } => self.load(4, memory(base, offset + 4, index, scale)?, 4, dst),
                other => Err(CompileError::InvalidOperand {
                    reason: format!("cannot take the high word of {:?}", other),
                }),
            },
            Negate => {
                let Operand::Register(src) = a else {
                    return Err(CompileError::InvalidOperand {
                        reason: format!("negate of {:?}", a),
                    });
                };
                self.copy_register(b_size.max(4), src, dst)?;
                let code = if b_size == 8 { Code::Neg_rm64 } else { Code::Neg_rm32 };
                emit!(self, code, gp_at_least_32(dst, b_size)?)
            }
            Absolute => {
                let Operand::Register(src) = a else {
                    return Err(CompileError::InvalidOperand {
                        reason: format!("absolute value of {:?}", a),
                    });
                };
                let wide = b_size == 8;
                let (neg, cmovs, cmovns) = if wide {
                    (Code::Neg_rm64, Code::Cmovs_r64_rm64, Code::Cmovns_r64_rm64)
                } else {
                    (Code::Neg_rm32, Code::Cmovs_r32_rm32, Code::Cmovns_r32_rm32)
                };
                let size = if wide { 8 } else { 4 };
                if src != dst {
                    self.copy_register(size, src, dst)?;
                    emit!(self, neg, gp(dst, size)?)?;
                    emit!(self, cmovs, gp(dst, size)?, gp(src, size)?)
                } else {
                    self.with_temporary(scratch, |s, tmp| {
                        s.copy_register(size, dst, tmp)?;
                        emit!(s, neg, gp(tmp, size)?)?;
                        emit!(s, cmovns, gp(dst, size)?, gp(tmp, size)?)
                    })
                }
            }
            FloatNegate => self.float_sign(false, a_size, a, dst, scratch),
            FloatAbsolute => self.float_sign(true, a_size, a, dst, scratch),
            Float2Float | FloatSquareRoot => {
                let code = match (op, a_size, b_size) {
                    (Float2Float, 4, 8) => Code::Cvtss2sd_xmm_xmmm32,
                    (Float2Float, 8, 4) => Code::Cvtsd2ss_xmm_xmmm64,
                    (Float2Float, 4, _) => Code::Movss_xmm_xmmm32,
                    (Float2Float, _, _) => Code::Movsd_xmm_xmmm64,
                    (_, 4, _) => Code::Sqrtss_xmm_xmmm32,
                    _ => Code::Sqrtsd_xmm_xmmm64,
                };
                let src = self.float_source(a)?;
                self.emit_float(code, xmm(dst)?, src)
            }
            Float2Int => {
                let code = match (a_size, b_size) {
                    (4, 8) => Code::Cvttss2si_r64_xmmm32,
                    (4, _) => Code::Cvttss2si_r32_xmmm32,
                    (_, 8) => Code::Cvttsd2si_r64_xmmm64,
                    _ => Code::Cvttsd2si_r32_xmmm64,
                };
                let src = self.float_source(a)?;
                self.emit_float(code, gp_at_least_32(dst, b_size)?, src)
            }
            Int2Float => {
                let code = match (a_size, b_size) {
                    (8, 4) => Code::Cvtsi2ss_xmm_rm64,
                    (_, 4) => Code::Cvtsi2ss_xmm_rm32,
                    (8, _) => Code::Cvtsi2sd_xmm_rm64,
                    _ => Code::Cvtsi2sd_xmm_rm32,
                };
                let src = match a {
                    Operand::Register(r) => {
                        Source::Register(if a_size == 8 { gp64(r)? } else { gp(r, 4)? })
                    }
                    Operand::Memory {
                        base,
                        offset,
                        index,
                        scale,
                    } => Source::Memory(memory(base, offset, index, scale)?),
                    other => {
                        return Err(CompileError::InvalidOperand {
                            reason: format!("cannot convert {:?} to float", other),
                        })
                    }
                };
                self.emit_float(code, xmm(dst)?, src)
            }
            Move | MoveLow => self.move_operands(a_size, a, b_size, b, scratch),
        }
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
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        trace!("{:?} {:?}:{} {:?}:{} -> {:?}:{}", op, a, a_size, b, b_size, c, c_size);
        if op.is_branch() {
            return self.branch(op, a_size, a, b, c, scratch);
        }
        match (b, c) {
            (Operand::Register(b), Operand::Register(c)) => {
                self.combine(op, c_size, a, b, c, scratch)
            }
            _ => Err(CompileError::InvalidOperand {
                reason: format!("{:?} needs register operands, got {:?} and {:?}", op, b, c),
            }),
        }
    }

    fn check_stack_overflow(
        &mut self,
        handler: i64,
        stack_limit_offset: u32,
    ) -> CompileResult<()> {
        let limit = memory(RBX, stack_limit_offset as i32, None, 1)?;
        emit!(self, Code::Cmp_r64_rm64, gp64(RSP)?, limit)?;
        let mut ok = self.asm.create_label();
        self.jump_if(Condition::Above, ok)?;
        self.load_constant(SCRATCH, Constant::Immediate(handler))?;
        emit!(self, Code::Jmp_rm64, gp64(SCRATCH)?)?;
        self.place(&mut ok)
    }

    fn allocate_frame(&mut self, footprint: u32) -> CompileResult<()> {
        emit!(self, Code::Push_r64, gp64(RBP)?)?;
        emit!(self, Code::Mov_r64_rm64, gp64(RBP)?, gp64(RSP)?)?;
        self.adjust_frame(footprint)
    }

    fn adjust_frame(&mut self, difference: u32) -> CompileResult<()> {
        if difference == 0 {
            return Ok(());
        }
        let bytes = (difference * WORD) as i32;
        emit!(self, Code::Sub_rm64_imm32, gp64(RSP)?, bytes)
    }

    fn pop_frame_for_tail_call(
        &mut self,
        footprint: u32,
        offset: i32,
        return_address_surrogate: Option<u8>,
        frame_pointer_surrogate: Option<u8>,
        scratch: &mut dyn ScratchRegisters,
    ) -> CompileResult<()> {
        if offset == 0 {
            return self.pop_frame();
        }
        self.pop_frame_with_offset(
            footprint,
            offset,
            return_address_surrogate,
            frame_pointer_surrogate,
            scratch,
        )
    }

    fn pop_frame_and_pop_arguments_and_return(
        &mut self,
        _footprint: u32,
        argument_footprint: u32,
    ) -> CompileResult<()> {
        self.pop_frame()?;
        let alignment = 2;
        if self.tail_calls && argument_footprint > alignment {
            let return_address = gp64(super::RCX)?;
            emit!(self, Code::Pop_r64, return_address)?;
            let bytes = ((argument_footprint - alignment) * WORD) as i32;
            emit!(self, Code::Add_rm64_imm32, gp64(RSP)?, bytes)?;
            emit!(self, Code::Jmp_rm64, return_address)
        } else {
            self.emit(Instruction::with(Code::Retnq))
        }
    }

    fn bind(&mut self, target: CodeTarget) -> CompileResult<()> {
        if !self.bound.insert(target) {
            return Err(CompileError::emission(format!("{:?} bound twice", target)));
        }
        match (self.labels.get(&target).copied(), self.pending) {
            (None, Some(here)) => {
                self.labels.insert(target, here);
            }
            (existing, _) => {
                let mut label = existing.unwrap_or_else(|| self.asm.create_label());
                self.place(&mut label)?;
                self.labels.insert(target, label);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> CompileResult<MachineCode> {
        if let Some(target) = self.labels.keys().find(|t| !self.bound.contains(*t)) {
            return Err(CompileError::Unresolved {
                reason: format!("{:?} is jumped to but never bound", target),
            });
        }
        if self.pending.is_some() {
            // a label at the very end still needs an instruction to attach to
            self.emit(Instruction::with(Code::Int3))?;
        }

        let result = self
            .asm
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(iced_error)?;
        let offsets = &result.inner.new_instruction_offsets;

        let mut targets = HashMap::with_capacity(self.labels.len());
        for (target, label) in &self.labels {
            let ip = result.label_ip(label).map_err(iced_error)?;
            targets.insert(*target, ip as u32);
        }
        let mut patches = Vec::with_capacity(self.patches.len());
        for &(index, promise) in &self.patches {
            let offset = offsets.get(index).copied().ok_or_else(|| {
                CompileError::emission(format!("no offset for instruction {}", index))
            })?;
            // REX.W and the opcode byte precede the immediate
            patches.push(Patch {
                offset: offset + 2,
                promise,
            });
        }
        Ok(MachineCode {
            bytes: result.inner.code_buffer.clone(),
            targets,
            patches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::promise::PromiseId;
    use crate::x64::{RCX, RDI, RSI, XMM0, XMM1};
    use iced_x86::{Decoder, DecoderOptions};

    struct FixedScratch(Vec<u8>);

    impl ScratchRegisters for FixedScratch {
        fn acquire_temporary(&mut self, _mask: u64) -> CompileResult<u8> {
            self.0.pop().ok_or_else(|| CompileError::ScratchUnavailable {
                reason: "test pool empty".into(),
            })
        }

        fn release_temporary(&mut self, register: u8) {
            self.0.push(register);
        }
    }

    fn codes(bytes: &[u8]) -> Vec<Code> {
        let mut decoder = Decoder::with_ip(64, bytes, 0, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            out.push(decoder.decode().code());
        }
        out
    }

    #[test]
    fn test_prologue_and_return() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        asm.allocate_frame(2).unwrap();
        asm.apply2(
            BinaryOperation::Move,
            8,
            Operand::immediate(42),
            8,
            Operand::Register(RAX),
            &mut FixedScratch(vec![]),
        )
        .unwrap();
        asm.pop_frame_and_pop_arguments_and_return(2, 2).unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(
            codes(&code.bytes),
            vec![
                Code::Push_r64,
                Code::Mov_r64_rm64,
                Code::Sub_rm64_imm32,
                Code::Mov_rm64_imm32,
                Code::Mov_r64_rm64,
                Code::Pop_r64,
                Code::Retnq,
            ]
        );
    }

    #[test]
    fn test_tail_call_return_pops_stack_arguments() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap().with_tail_calls(true);
        asm.allocate_frame(3).unwrap();
        asm.adjust_frame(1).unwrap();
        asm.pop_frame_and_pop_arguments_and_return(4, 4).unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(
            codes(&code.bytes),
            vec![
                Code::Push_r64,
                Code::Mov_r64_rm64,
                Code::Sub_rm64_imm32,
                Code::Sub_rm64_imm32,
                Code::Mov_r64_rm64,
                Code::Pop_r64,
                Code::Pop_r64,
                Code::Add_rm64_imm32,
                Code::Jmp_rm64,
            ]
        );
    }

    #[test]
    fn test_targets_at_one_position_share_an_offset() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        let promise = CodeTarget::Promise(PromiseId(0));
        asm.bind(CodeTarget::Ip(0)).unwrap();
        asm.bind(promise).unwrap();
        asm.apply0(Operation::Trap).unwrap();
        asm.bind(CodeTarget::Ip(1)).unwrap();
        asm.apply1(
            UnaryOperation::Jump,
            8,
            Operand::Constant(Constant::Label(CodeTarget::Ip(0))),
        )
        .unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(code.targets[&CodeTarget::Ip(0)], 0);
        assert_eq!(code.targets[&promise], 0);
        assert_eq!(code.targets[&CodeTarget::Ip(1)], 1);
        assert!(asm.bind(CodeTarget::Ip(1)).is_err());
    }

    #[test]
    fn test_forward_label_sharing_a_position_gets_padding() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        asm.apply1(
            UnaryOperation::Jump,
            8,
            Operand::Constant(Constant::Label(CodeTarget::Ip(3))),
        )
        .unwrap();
        asm.bind(CodeTarget::Ip(2)).unwrap();
        asm.bind(CodeTarget::Ip(3)).unwrap();
        asm.apply0(Operation::Return).unwrap();
        let code = asm.finish().unwrap();
        let two = code.targets[&CodeTarget::Ip(2)];
        let three = code.targets[&CodeTarget::Ip(3)];
        assert_eq!(three, two + 1);
        assert_eq!(code.bytes[two as usize], 0x90);
    }

    #[test]
    fn test_deferred_constant_reports_patch_site() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        asm.apply0(Operation::Trap).unwrap();
        asm.apply2(
            BinaryOperation::Move,
            8,
            Operand::Constant(Constant::Deferred(PromiseId(5))),
            8,
            Operand::Register(RCX),
            &mut FixedScratch(vec![]),
        )
        .unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(code.patches.len(), 1);
        assert_eq!(code.patches[0].offset, 3);
        assert_eq!(code.patches[0].promise, PromiseId(5));
        // int3, then REX.W and mov rcx, imm64
        assert_eq!(&code.bytes[..3], &[0xCC, 0x48, 0xB9]);
        assert_eq!(code.bytes.len(), 11);
    }

    #[test]
    fn test_unbound_label_is_reported() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        asm.apply1(
            UnaryOperation::Call,
            8,
            Operand::Constant(Constant::Label(CodeTarget::Ip(9))),
        )
        .unwrap();
        assert!(matches!(
            asm.finish(),
            Err(CompileError::Unresolved { .. })
        ));
    }

    #[test]
    fn test_division_and_remainder() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        let mut scratch = FixedScratch(vec![]);
        for op in [TernaryOperation::Divide, TernaryOperation::Remainder] {
            asm.apply3(
                op,
                8,
                Operand::Register(RCX),
                8,
                Operand::Register(RAX),
                8,
                Operand::Register(RAX),
                &mut scratch,
            )
            .unwrap();
        }
        let code = asm.finish().unwrap();
        assert_eq!(
            codes(&code.bytes),
            vec![
                Code::Cqo,
                Code::Idiv_rm64,
                Code::Cqo,
                Code::Idiv_rm64,
                Code::Mov_r64_rm64,
            ]
        );
    }

    #[test]
    fn test_combine_copies_second_operand_first() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        let mut scratch = FixedScratch(vec![]);
        asm.apply3(
            TernaryOperation::Subtract,
            4,
            Operand::immediate(3),
            4,
            Operand::Register(RSI),
            4,
            Operand::Register(RDI),
            &mut scratch,
        )
        .unwrap();
        asm.apply3(
            TernaryOperation::Multiply,
            8,
            Operand::immediate(10),
            8,
            Operand::Register(RSI),
            8,
            Operand::Register(RDI),
            &mut scratch,
        )
        .unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(
            codes(&code.bytes),
            vec![
                Code::Mov_r32_rm32,
                Code::Sub_rm32_imm32,
                Code::Imul_r64_rm64_imm32,
            ]
        );
    }

    #[test]
    fn test_wide_constant_goes_through_temporary() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        let mut scratch = FixedScratch(vec![RDX]);
        asm.apply3(
            TernaryOperation::Add,
            8,
            Operand::immediate(1 << 40),
            8,
            Operand::Register(RSI),
            8,
            Operand::Register(RSI),
            &mut scratch,
        )
        .unwrap();
        assert_eq!(scratch.0, vec![RDX]);
        let code = asm.finish().unwrap();
        assert_eq!(
            codes(&code.bytes),
            vec![Code::Mov_r64_imm64, Code::Add_r64_rm64]
        );
    }

    #[test]
    fn test_float_equality_skips_unordered() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        let target = CodeTarget::Ip(1);
        asm.apply3(
            TernaryOperation::JumpIfFloatEqual,
            8,
            Operand::Register(XMM1),
            8,
            Operand::Register(XMM0),
            8,
            Operand::Constant(Constant::Label(target)),
            &mut FixedScratch(vec![]),
        )
        .unwrap();
        asm.bind(target).unwrap();
        asm.apply0(Operation::Return).unwrap();
        let code = asm.finish().unwrap();
        let decoded = codes(&code.bytes);
        assert_eq!(decoded[0], Code::Ucomisd_xmm_xmmm64);
        assert!(matches!(decoded[1], Code::Jp_rel8_64 | Code::Jp_rel32_64));
        assert!(matches!(decoded[2], Code::Je_rel8_64 | Code::Je_rel32_64));
        assert_eq!(*decoded.last().unwrap(), Code::Retnq);
    }

    #[test]
    fn test_branch_to_absolute_address() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        asm.apply3(
            TernaryOperation::JumpIfLess,
            4,
            Operand::immediate(0),
            4,
            Operand::Register(RSI),
            8,
            Operand::immediate(0x1000),
            &mut FixedScratch(vec![]),
        )
        .unwrap();
        let code = asm.finish().unwrap();
        let decoded = codes(&code.bytes);
        assert_eq!(decoded[0], Code::Cmp_rm32_imm32);
        assert!(decoded.contains(&Code::Jmp_rm64));
    }

    #[test]
    fn test_float_negate_uses_general_temporary() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut asm = X64Assembler::new().unwrap();
        asm.apply2(
            BinaryOperation::FloatNegate,
            8,
            Operand::Register(XMM0),
            8,
            Operand::Register(XMM1),
            &mut FixedScratch(vec![RDX]),
        )
        .unwrap();
        let code = asm.finish().unwrap();
        assert_eq!(
            codes(&code.bytes),
            vec![Code::Movq_rm64_xmm, Code::Btc_rm64_imm8, Code::Movq_xmm_rm64]
        );
    }
}
