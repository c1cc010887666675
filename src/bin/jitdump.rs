//! Compile a sample method through the façade and dump the result.
//!
//! By default the method goes through the x86-64 emitter and the code is disassembled;
//! `--trace` swaps in the recording emitter and prints the operations the core issued
//! instead. The frame-map table and session statistics follow, and `--output` wraps the code
//! into an ELF relocatable object with one text symbol.

use std::path::PathBuf;

use bumpalo::Bump;
use clap::{Parser, ValueEnum};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use jitcore::{
    AnyOperation, Architecture, Assembler, CallFlags, CompilationSession, CompileResult,
    CompiledMethod, Compiler, CompilerConfig, FrameMapTable, RecordingAssembler,
    RuntimeHelpers, ValueType, X64Architecture, X64Assembler,
};
use log::debug;
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

const CALLEE: i64 = 0x4000_0000;
const BOUNDS_HANDLER: i64 = 0x4000_1000;
const FLOAT_REMAINDER_HELPER: i64 = 0x4000_2000;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Sample {
    /// `return a + b` with both operands in argument registers
    Add,
    /// `y = x == 0 ? 2 : 1; return y`
    Diamond,
    /// count up to the first parameter
    Loop,
    /// call out with an object reference live across the call
    Call,
    /// bounds-checked int array load
    Bounds,
    /// float remainder through a runtime helper
    Frem,
}

#[derive(Parser, Debug)]
#[command(
    name = "jitdump",
    about = "Compile a sample method with the JIT core and dump its code and frame maps."
)]
struct Args {
    /// Sample method to compile
    #[arg(value_enum)]
    sample: Sample,

    /// Print the recorded emitter operations instead of x86-64 code
    #[arg(long, action = clap::ArgAction::SetTrue)]
    trace: bool,

    /// Compile tail calls and pop caller arguments on return
    #[arg(long, action = clap::ArgAction::SetTrue)]
    tail_calls: bool,

    /// Address the code is laid out at
    #[arg(long, value_name = "ADDRESS", default_value_t = 0x10000)]
    base: u64,

    /// Write the code into an ELF relocatable object at this path
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Log every read and junction decision at trace level
    #[arg(long, action = clap::ArgAction::SetTrue)]
    trace_allocator: bool,

    /// Print session statistics
    #[arg(long, action = clap::ArgAction::SetTrue)]
    stats: bool,
}

struct Helpers;

impl RuntimeHelpers for Helpers {
    fn thunk(&self, op: AnyOperation, _size: u32, _result_size: u32) -> i64 {
        debug!("helper requested for {}", op);
        FLOAT_REMAINDER_HELPER
    }
}

fn aligned_frame(arch: &dyn Architecture, locals: u32, parameters: u32, max_stack: u32) -> u32 {
    arch.align_frame_size(locals - parameters + max_stack)
}

fn build_add(c: &mut Compiler<'_>, arch: &dyn Architecture) -> CompileResult<()> {
    c.init(1, 0, 0, aligned_frame(arch, 0, 0, 0));
    c.start_logical_ip(0)?;
    let a = c.register(jitcore::x64::RDI);
    let b = c.register(jitcore::x64::RSI);
    let sum = c.add(8, a, b)?;
    c.return_(8, Some(sum))
}

fn build_diamond(c: &mut Compiler<'_>, arch: &dyn Architecture) -> CompileResult<()> {
    c.init(5, 1, 2, aligned_frame(arch, 2, 1, 0));
    c.init_local(1, 0, ValueType::General)?;

    c.start_logical_ip(0)?;
    let x = c.load_local(1, 0)?;
    let zero = c.constant(0, ValueType::General);
    let target = c.machine_ip(3);
    let target = c.promise_constant(target, ValueType::General);
    c.jump_if_equal(4, zero, x, target)?;
    let state = c.save_state()?;

    c.start_logical_ip(3)?;
    let two = c.constant(2, ValueType::General);
    c.store_local(1, two, 1)?;
    c.start_logical_ip(4)?;
    let y = c.load_local(1, 1)?;
    c.return_(4, Some(y))?;

    c.restore_state(state)?;
    c.start_logical_ip(1)?;
    let one = c.constant(1, ValueType::General);
    c.store_local(1, one, 1)?;
    c.start_logical_ip(2)?;
    let join = c.machine_ip(4);
    let join = c.promise_constant(join, ValueType::General);
    c.jmp(join)?;
    c.visit_logical_ip(4)
}

fn build_loop(c: &mut Compiler<'_>, arch: &dyn Architecture) -> CompileResult<()> {
    c.init(5, 1, 2, aligned_frame(arch, 2, 1, 0));
    c.init_local(1, 0, ValueType::General)?;

    c.start_logical_ip(0)?;
    let zero = c.constant(0, ValueType::General);
    c.store_local(1, zero, 1)?;

    c.start_logical_ip(1)?;
    let n = c.load_local(1, 0)?;
    let i = c.load_local(1, 1)?;
    let exit = c.machine_ip(4);
    let exit = c.promise_constant(exit, ValueType::General);
    c.jump_if_greater_or_equal(4, n, i, exit)?;
    let state = c.save_state()?;

    c.start_logical_ip(4)?;
    let i = c.load_local(1, 1)?;
    c.return_(4, Some(i))?;

    c.restore_state(state)?;
    c.start_logical_ip(2)?;
    let i = c.load_local(1, 1)?;
    let one = c.constant(1, ValueType::General);
    let next = c.add(4, i, one)?;
    c.store_local(1, next, 1)?;
    c.start_logical_ip(3)?;
    let header = c.machine_ip(1);
    let header = c.promise_constant(header, ValueType::General);
    c.jmp(header)?;
    c.visit_logical_ip(1)
}

fn build_call(c: &mut Compiler<'_>, arch: &dyn Architecture) -> CompileResult<()> {
    c.init(1, 1, 1, aligned_frame(arch, 1, 1, 1));
    c.init_frame_maps(1);
    c.init_local(1, 0, ValueType::General)?;

    c.start_logical_ip(0)?;
    c.frame_maps_mut().mark(0);
    let object = c.load_local(1, 0)?;
    let trace = c.frame_maps_mut().trace(0);
    let callee = c.constant(CALLEE, ValueType::General);
    let result = c.call(
        callee,
        CallFlags::NONE,
        Some(trace),
        8,
        ValueType::General,
        &[object],
    )?;
    c.return_(8, Some(result))
}

fn build_bounds(c: &mut Compiler<'_>, arch: &dyn Architecture) -> CompileResult<()> {
    c.init(1, 2, 2, aligned_frame(arch, 2, 2, 0));
    c.init_local(1, 0, ValueType::General)?;
    c.init_local(1, 1, ValueType::General)?;

    c.start_logical_ip(0)?;
    let array = c.load_local(1, 0)?;
    let index = c.load_local(1, 1)?;
    c.check_bounds(array, 8, index, BOUNDS_HANDLER)?;
    let element = c.memory(array, ValueType::General, 16, Some(index), 4)?;
    let value = c.load(4, 4, element, 8)?;
    c.return_(8, Some(value))
}

fn build_frem(c: &mut Compiler<'_>, arch: &dyn Architecture) -> CompileResult<()> {
    c.init(1, 0, 0, aligned_frame(arch, 0, 0, 0));
    c.start_logical_ip(0)?;
    let a = c.constant(f64::to_bits(1.5) as i64, ValueType::Float);
    let b = c.constant(f64::to_bits(7.0) as i64, ValueType::Float);
    let r = c.frem(8, a, b)?;
    c.return_(8, Some(r))
}

fn compile_sample<'a>(
    sample: Sample,
    arch: &'a X64Architecture,
    assembler: Box<dyn Assembler + 'a>,
    config: CompilerConfig,
    session: &'a CompilationSession<'a>,
    base: i64,
) -> CompileResult<CompiledMethod> {
    let mut c = Compiler::new(arch, assembler, config, session).with_helpers(&Helpers);
    match sample {
        Sample::Add => build_add(&mut c, arch)?,
        Sample::Diamond => build_diamond(&mut c, arch)?,
        Sample::Loop => build_loop(&mut c, arch)?,
        Sample::Call => build_call(&mut c, arch)?,
        Sample::Bounds => build_bounds(&mut c, arch)?,
        Sample::Frem => build_frem(&mut c, arch)?,
    }
    c.compile(None, 0)?;
    c.finish(base)
}

fn print_disassembly(method: &CompiledMethod) {
    let mut decoder = Decoder::with_ip(
        64,
        method.instructions(),
        method.base as u64,
        DecoderOptions::NONE,
    );
    let mut formatter = IntelFormatter::new();
    let mut text = String::new();
    let mut instruction = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        text.clear();
        formatter.format(&instruction, &mut text);
        println!("{:016X}  {}", instruction.ip(), text);
    }
    if !method.pool().is_empty() {
        println!("constant pool: {} bytes at +{:#x}", method.pool().len(), method.pool_offset);
    }
}

fn print_frame_maps(table: &FrameMapTable) {
    println!("frame maps ({} slots):", table.map_size());
    match table {
        FrameMapTable::Flat(flat) => {
            for &offset in &flat.offsets {
                let roots = table.roots(offset, &|_| None).unwrap_or_default();
                let bits: String = roots.iter().map(|&r| if r { '1' } else { '0' }).collect();
                println!("  +{:#06x}  {}", offset, bits);
            }
        }
        FrameMapTable::Paths(paths) => {
            for entry in &paths.entries {
                println!(
                    "  +{:#06x}  base {} path {:?}",
                    entry.offset, entry.base, entry.path
                );
            }
        }
    }
}

fn write_object(
    path: &PathBuf,
    name: &str,
    method: &CompiledMethod,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut obj = Object::new(
        BinaryFormat::Elf,
        object::Architecture::X86_64,
        Endianness::Little,
    );
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &method.code, 16);
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: offset,
        size: method.code_size as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    let bytes = obj.write()?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X64Architecture::new();
    let config = CompilerConfig::default()
        .with_tail_calls(args.tail_calls)
        .with_tracing(args.trace_allocator, args.trace_allocator);
    let base = args.base as i64;

    let method = if args.trace {
        let log = RecordingAssembler::new_log();
        let assembler = Box::new(RecordingAssembler::with_log(log.clone()));
        let method = compile_sample(args.sample, &arch, assembler, config, &session, base)?;
        for (i, record) in log.borrow().iter().enumerate() {
            println!("{:4}  {:?}", i, record);
        }
        method
    } else {
        let assembler = Box::new(X64Assembler::new()?.with_tail_calls(args.tail_calls));
        let method = compile_sample(args.sample, &arch, assembler, config, &session, base)?;
        print_disassembly(&method);
        method
    };

    print_frame_maps(&method.frame_maps);
    if args.stats {
        print!("{}", session.stats());
    }

    if let Some(path) = &args.output {
        let name = format!("{:?}", args.sample).to_lowercase();
        write_object(path, &name, &method)?;
        println!("wrote {} ({} code bytes)", path.display(), method.code_size);
    }
    Ok(())
}
