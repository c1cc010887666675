//! Methods compiled onto the x86-64 description and then run by a small interpreter over the
//! recording emitter's log, so tests check the values a method computes rather than the exact
//! instructions it was given.
//!
//! The interpreter follows the x86-64 conventions the core plans for: a call clobbers every
//! caller-saved register, and a division or remainder clobbers `rdx`. Clobbered registers
//! are filled with a poison word, so a value the allocator forgot to move shows up as a wrong
//! result.

use bumpalo::Bump;
use hashbrown::HashMap;
use jitcore::core::promise::CodeTarget;
use jitcore::target::{BinaryOperation, Constant, Operand, TernaryOperation, UnaryOperation};
use jitcore::x64::{R10, R11, R8, R9, RAX, RBP, RCX, RDI, RDX, RSI, RSP};
use jitcore::{
    CallFlags, CompilationSession, CompileResult, Compiler, CompilerConfig, Recorded,
    RecordingAssembler, ValueType, X64Architecture,
};

const POISON: i64 = 0x5a5a_5a5a_5a5a_5a5a;
const LABEL_BASE: i64 = 0x7e00_0000_0000;
const STACK_TOP: i64 = 0x10_0000;
const CALLEE: i64 = 0x4000_0000;

const ARGUMENT_REGISTERS: [u8; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const CALLER_SAVED: [u8; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];

type Callee = fn(&[i64]) -> i64;

/// A compiled method and where its parameters live relative to the stack pointer.
struct Compiled {
    log: Vec<Recorded>,
    parameter_offsets: Vec<i32>,
}

fn compile(build: impl FnOnce(&mut Compiler<'_>) -> CompileResult<()>) -> Compiled {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X64Architecture::new();
    let log = RecordingAssembler::new_log();
    let mut c = Compiler::new(
        &arch,
        Box::new(RecordingAssembler::with_log(log.clone())),
        CompilerConfig::default(),
        &session,
    );
    build(&mut c).expect("build");
    c.compile(None, 0).expect("compile");

    let ctx = c.context();
    let parameter_offsets = (0..ctx.parameter_footprint)
        .map(|p| ctx.geometry.frame_index_to_offset(ctx.frame_index(p)))
        .collect();
    c.finish(0x1000).expect("finish");
    let log = log.borrow().clone();
    Compiled {
        log,
        parameter_offsets,
    }
}

struct Machine<'l> {
    log: &'l [Recorded],
    labels: HashMap<CodeTarget, usize>,
    registers: [i64; 16],
    memory: HashMap<i64, i64>,
    parameters: Vec<(i32, i64)>,
    callees: HashMap<i64, Callee>,
}

fn truncate(value: i64, size: u32) -> i64 {
    match size {
        1 => value as i8 as i64,
        2 => value as i16 as i64,
        4 => value as i32 as i64,
        _ => value,
    }
}

fn zero_extend(value: i64, size: u32) -> i64 {
    match size {
        1 => value as u8 as i64,
        2 => value as u16 as i64,
        4 => value as u32 as i64,
        _ => value,
    }
}

impl<'l> Machine<'l> {
    fn new(compiled: &'l Compiled) -> Self {
        let labels = compiled
            .log
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match r {
                Recorded::Bind(target) => Some((*target, i)),
                _ => None,
            })
            .collect();
        let mut registers = [POISON; 16];
        registers[RSP as usize] = STACK_TOP;
        registers[RBP as usize] = STACK_TOP;
        Self {
            log: &compiled.log,
            labels,
            registers,
            memory: HashMap::new(),
            parameters: Vec::new(),
            callees: HashMap::new(),
        }
    }

    fn with_register(mut self, register: u8, value: i64) -> Self {
        self.registers[register as usize] = value;
        self
    }

    fn with_parameters(mut self, compiled: &Compiled, values: &[i64]) -> Self {
        self.parameters = compiled
            .parameter_offsets
            .iter()
            .copied()
            .zip(values.iter().copied())
            .collect();
        self
    }

    fn with_callee(mut self, address: i64, callee: Callee) -> Self {
        self.callees.insert(address, callee);
        self
    }

    fn constant(&self, constant: Constant) -> i64 {
        match constant {
            Constant::Immediate(value) => value,
            Constant::Label(target) => {
                let position = self.labels.get(&target).unwrap_or_else(|| {
                    panic!("{:?} is never bound", target);
                });
                LABEL_BASE + *position as i64
            }
            Constant::Deferred(p) => panic!("deferred constant {:?} in straight-line code", p),
        }
    }

    fn address(&self, base: u8, offset: i32, index: Option<u8>, scale: u8) -> i64 {
        let index = index.map_or(0, |i| self.registers[i as usize] * scale as i64);
        self.registers[base as usize] + offset as i64 + index
    }

    fn read(&self, operand: Operand, size: u32) -> i64 {
        let raw = match operand {
            Operand::Register(r) => self.registers[r as usize],
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => {
                let address = self.address(base, offset, index, scale);
                *self.memory.get(&address).unwrap_or_else(|| {
                    panic!("read of unwritten memory at {:#x}", address);
                })
            }
            Operand::Constant(c) | Operand::Address(c) => self.constant(c),
        };
        truncate(raw, size)
    }

    fn write(&mut self, operand: Operand, value: i64) {
        match operand {
            Operand::Register(r) => self.registers[r as usize] = value,
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => {
                let address = self.address(base, offset, index, scale);
                self.memory.insert(address, value);
            }
            other => panic!("write to {:?}", other),
        }
    }

    fn push(&mut self, value: i64) {
        self.registers[RSP as usize] -= 8;
        let top = self.registers[RSP as usize];
        self.memory.insert(top, value);
    }

    fn jump(&self, target: i64) -> usize {
        assert!(target >= LABEL_BASE, "jump to non-code address {:#x}", target);
        (target - LABEL_BASE) as usize
    }

    fn call(&mut self, target: i64) {
        let callee = *self.callees.get(&target).unwrap_or_else(|| {
            panic!("call to unknown address {:#x}", target);
        });
        let arguments: Vec<i64> = ARGUMENT_REGISTERS
            .iter()
            .map(|&r| self.registers[r as usize])
            .collect();
        let result = callee(&arguments);
        for r in CALLER_SAVED {
            self.registers[r as usize] = POISON;
        }
        self.registers[RAX as usize] = result;
    }

    fn binary(&mut self, op: BinaryOperation, a_size: u32, a: Operand, b: Operand) {
        let value = self.read(a, a_size);
        let result = match op {
            BinaryOperation::Move => value,
            BinaryOperation::MoveZ => zero_extend(value, a_size),
            BinaryOperation::Negate => value.wrapping_neg(),
            BinaryOperation::Absolute => value.wrapping_abs(),
            other => panic!("{:?} is not interpreted", other),
        };
        self.write(b, result);
    }

    fn compare(op: TernaryOperation, b: i64, a: i64) -> bool {
        match op {
            TernaryOperation::JumpIfLess => b < a,
            TernaryOperation::JumpIfGreater => b > a,
            TernaryOperation::JumpIfLessOrEqual => b <= a,
            TernaryOperation::JumpIfGreaterOrEqual => b >= a,
            TernaryOperation::JumpIfEqual => b == a,
            TernaryOperation::JumpIfNotEqual => b != a,
            other => panic!("{:?} is not interpreted", other),
        }
    }

    fn combine(op: TernaryOperation, b: i64, a: i64) -> i64 {
        match op {
            TernaryOperation::Add => b.wrapping_add(a),
            TernaryOperation::Subtract => b.wrapping_sub(a),
            TernaryOperation::Multiply => b.wrapping_mul(a),
            TernaryOperation::Divide => b.wrapping_div(a),
            TernaryOperation::Remainder => b.wrapping_rem(a),
            TernaryOperation::ShiftLeft => b.wrapping_shl(a as u32 & 63),
            TernaryOperation::ShiftRight => b.wrapping_shr(a as u32 & 63),
            TernaryOperation::UnsignedShiftRight => ((b as u64) >> (a as u32 & 63)) as i64,
            TernaryOperation::And => b & a,
            TernaryOperation::Or => b | a,
            TernaryOperation::Xor => b ^ a,
            other => panic!("{:?} is not interpreted", other),
        }
    }

    /// Run from the first recorded operation to the method's return; the result is `rax`.
    fn run(mut self) -> i64 {
        let mut pc = 0;
        let mut steps = 0;
        while pc < self.log.len() {
            steps += 1;
            assert!(steps < 100_000, "no return after {} steps", steps);
            let entry = self.log[pc].clone();
            pc += 1;
            match entry {
                Recorded::AllocateFrame(words) => {
                    let frame_pointer = self.registers[RBP as usize];
                    self.push(frame_pointer);
                    self.registers[RBP as usize] = self.registers[RSP as usize];
                    self.registers[RSP as usize] -= words as i64 * 8;
                    let base = self.registers[RSP as usize];
                    for (offset, value) in self.parameters.clone() {
                        self.memory.insert(base + offset as i64, value);
                    }
                }
                Recorded::AdjustFrame(words) => self.registers[RSP as usize] -= words as i64 * 8,
                Recorded::Bind(_) | Recorded::Nullary(_) | Recorded::StackCheck { .. } => {}
                Recorded::Return { .. } => return self.registers[RAX as usize],
                Recorded::Unary { op, size, a } => {
                    let target = self.read(a, size);
                    match op {
                        UnaryOperation::Call
                        | UnaryOperation::LongCall
                        | UnaryOperation::AlignedCall
                        | UnaryOperation::AlignedLongCall => self.call(target),
                        _ => pc = self.jump(target),
                    }
                }
                Recorded::Binary {
                    op, a_size, a, b, ..
                } => self.binary(op, a_size, a, b),
                Recorded::Ternary {
                    op,
                    a_size,
                    a,
                    b_size,
                    b,
                    c_size,
                    c,
                } => {
                    let a = self.read(a, a_size);
                    let b = self.read(b, b_size);
                    if op.is_branch() {
                        if Self::compare(op, b, a) {
                            pc = self.jump(self.read(c, c_size));
                        }
                        continue;
                    }
                    let result = truncate(Self::combine(op, b, a), c_size);
                    self.write(c, result);
                    let divides = matches!(
                        op,
                        TernaryOperation::Divide | TernaryOperation::Remainder
                    );
                    if divides && c != Operand::Register(RDX) {
                        self.registers[RDX as usize] = POISON;
                    }
                }
                other => panic!("{:?} is not interpreted", other),
            }
        }
        panic!("ran off the end of the method");
    }
}

/// `x = 100`, then `x + i` for every `i < count`, then the sum of all of them.
fn build_sum_of_offsets(c: &mut Compiler<'_>, count: i64) -> CompileResult<()> {
    c.init(1, 0, 0, 16);
    c.start_logical_ip(0)?;
    let zero = c.constant(0, ValueType::General);
    let hundred = c.constant(100, ValueType::General);
    let x = c.add(8, zero, hundred)?;
    let mut terms = Vec::new();
    for i in 0..count {
        let k = c.constant(i, ValueType::General);
        terms.push(c.add(8, k, x)?);
    }
    let mut sum = terms[0];
    for &t in &terms[1..] {
        sum = c.add(8, t, sum)?;
    }
    c.return_(8, Some(sum))
}

#[test]
fn test_sums_survive_register_pressure() {
    let _ = env_logger::builder().is_test(true).try_init();
    // eight values fit in registers; fourteen and twenty do not
    for count in [8, 14, 20] {
        let compiled = compile(|c| build_sum_of_offsets(c, count));
        let expected = 100 * count + count * (count - 1) / 2;
        assert_eq!(Machine::new(&compiled).run(), expected, "{} terms", count);
    }
}

#[test]
fn test_register_arguments_swap_without_loss() {
    let _ = env_logger::builder().is_test(true).try_init();
    let compiled = compile(|c| {
        c.init(1, 0, 0, 2);
        c.start_logical_ip(0)?;
        let a = c.register(RDI);
        let b = c.register(RSI);
        let callee = c.constant(CALLEE, ValueType::General);
        let result = c.call(
            callee,
            CallFlags::NONE,
            None,
            8,
            ValueType::General,
            &[b, a],
        )?;
        c.return_(8, Some(result))
    });
    let result = Machine::new(&compiled)
        .with_register(RDI, 7)
        .with_register(RSI, 5)
        .with_callee(CALLEE, |args| args[0] * 10 + args[1])
        .run();
    assert_eq!(result, 57);
}

#[test]
fn test_division_and_shift_keep_values_in_their_registers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let compiled = compile(|c| {
        c.init(1, 0, 0, 4);
        c.start_logical_ip(0)?;
        let d = c.register(RDX);
        let k = c.register(RCX);
        let n = c.register(RDI);
        let m = c.register(RSI);
        let q = c.div(8, m, n)?;
        let r = c.rem(8, m, n)?;
        let s = c.shl(8, m, d)?;
        let t = c.add(8, q, r)?;
        let t = c.add(8, t, s)?;
        let t = c.add(8, t, d)?;
        let t = c.add(8, t, k)?;
        c.return_(8, Some(t))
    });
    let result = Machine::new(&compiled)
        .with_register(RDX, 7)
        .with_register(RCX, 2)
        .with_register(RDI, 100)
        .with_register(RSI, 3)
        .run();
    // 100 / 3 + 100 % 3 + (7 << 3) + 7 + 2
    assert_eq!(result, 33 + 1 + 56 + 7 + 2);
}

#[test]
fn test_subroutine_returns_to_its_caller() {
    let _ = env_logger::builder().is_test(true).try_init();
    // 0: jsr 2    1: iload 2; ireturn    2: astore 1    3: iinc; istore 2    4: ret 1
    let compiled = compile(|c| {
        c.init(5, 1, 3, 4);
        c.init_local(1, 0, ValueType::General)?;

        c.start_logical_ip(0)?;
        let resume = c.machine_ip(1);
        let return_address = c.address(resume);
        c.push(1, return_address)?;
        let entry = c.machine_ip(2);
        let entry = c.promise_constant(entry, ValueType::General);
        c.jmp(entry)?;

        let subroutine = c.start_subroutine();
        c.start_logical_ip(2)?;
        let address = c.pop(1)?;
        c.store_local(1, address, 1)?;
        c.start_logical_ip(3)?;
        let x = c.load_local(1, 0)?;
        let one = c.constant(1, ValueType::General);
        let y = c.add(4, one, x)?;
        c.store_local(1, y, 2)?;
        c.start_logical_ip(4)?;
        let address = c.load_local(1, 1)?;
        c.return_from_subroutine(subroutine, address)?;

        c.link_subroutine(subroutine)?;
        c.start_logical_ip(1)?;
        let y = c.load_local(1, 2)?;
        c.return_(4, Some(y))
    });
    let result = Machine::new(&compiled)
        .with_parameters(&compiled, &[41])
        .run();
    assert_eq!(result, 42);
}

#[test]
fn test_handler_locals_are_read_from_their_slots() {
    let _ = env_logger::builder().is_test(true).try_init();
    // 0: if x != 0 goto 2    1: return x + 1    2: (handler entry) return x
    let compiled = compile(|c| {
        c.init(3, 1, 1, 2);
        c.init_local(1, 0, ValueType::General)?;

        c.start_logical_ip(0)?;
        let x = c.load_local(1, 0)?;
        let zero = c.constant(0, ValueType::General);
        let handler = c.machine_ip(2);
        let handler = c.promise_constant(handler, ValueType::General);
        c.jump_if_not_equal(4, zero, x, handler)?;
        let state = c.save_state()?;

        c.start_logical_ip(1)?;
        let one = c.constant(1, ValueType::General);
        let y = c.add(4, one, x)?;
        c.return_(4, Some(y))?;

        c.restore_state(state)?;
        c.init_locals_from_logical_ip(0)?;
        c.start_logical_ip(2)?;
        let z = c.load_local(1, 0)?;
        assert_ne!(z, x);
        c.return_(4, Some(z))
    });
    for (x, expected) in [(9, 9), (0, 1), (-3, -3)] {
        let result = Machine::new(&compiled)
            .with_parameters(&compiled, &[x])
            .run();
        assert_eq!(result, expected, "x = {}", x);
    }
}
