//! Methods compiled all the way to x86-64 machine code and decoded back with iced-x86.

use bumpalo::Bump;
use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic};
use jitcore::x64::{RAX, RDI};
use jitcore::{
    CallFlags, CompilationSession, CompileResult, CompiledMethod, Compiler, CompilerConfig,
    FrameMapTable, ValueType, X64Architecture, X64Assembler,
};

const BASE: i64 = 0x10000;
const CALLEE: i64 = 0x4000_0000;
const BOUNDS_HANDLER: i64 = 0x4000_1000;

fn compile(
    config: CompilerConfig,
    build: impl FnOnce(&mut Compiler<'_>) -> CompileResult<()>,
) -> CompiledMethod {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X64Architecture::new();
    let assembler = X64Assembler::new()
        .expect("assembler")
        .with_tail_calls(config.tail_calls);
    let mut c = Compiler::new(&arch, Box::new(assembler), config, &session);
    build(&mut c).expect("build");
    c.compile(None, 0).expect("compile");
    c.finish(BASE).expect("finish")
}

fn decode(method: &CompiledMethod) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(
        64,
        method.instructions(),
        method.base as u64,
        DecoderOptions::NONE,
    );
    let instructions: Vec<Instruction> = decoder.iter().collect();
    assert!(
        instructions.iter().all(|i| !i.is_invalid()),
        "undecodable bytes in {:02x?}",
        method.instructions()
    );
    instructions
}

fn mnemonics(instructions: &[Instruction]) -> Vec<Mnemonic> {
    instructions
        .iter()
        .map(|i| i.mnemonic())
        .filter(|&m| m != Mnemonic::Int3 && m != Mnemonic::Nop)
        .collect()
}

fn branch_target(c: &mut Compiler<'_>, ip: u32) -> jitcore::ValueId {
    let target = c.machine_ip(ip);
    c.promise_constant(target, ValueType::General)
}

#[test]
fn test_add_prologue_and_epilogue() {
    let _ = env_logger::builder().is_test(true).try_init();
    let method = compile(CompilerConfig::default(), |c| {
        c.init(1, 0, 0, 0);
        c.start_logical_ip(0)?;
        let a = c.register(RDI);
        let b = c.register(RAX);
        let sum = c.add(8, a, b)?;
        c.return_(8, Some(sum))
    });
    let code = decode(&method);
    assert_eq!(
        mnemonics(&code),
        vec![
            Mnemonic::Push,
            Mnemonic::Mov,
            Mnemonic::Add,
            Mnemonic::Mov,
            Mnemonic::Pop,
            Mnemonic::Ret
        ]
    );
    assert!(method.pool().is_empty());
    assert!(method.frame_maps.is_empty());
}

#[test]
fn test_empty_frame_has_no_stack_adjustment() {
    let _ = env_logger::builder().is_test(true).try_init();
    let method = compile(CompilerConfig::default(), |c| {
        c.init(1, 0, 0, 0);
        c.start_logical_ip(0)?;
        c.return_(0, None)
    });
    let code = mnemonics(&decode(&method));
    assert_eq!(&code[..2], &[Mnemonic::Push, Mnemonic::Mov]);
    assert!(!code.contains(&Mnemonic::Sub));
    assert_eq!(code.last(), Some(&Mnemonic::Ret));
}

#[test]
fn test_loop_jumps_backwards() {
    let _ = env_logger::builder().is_test(true).try_init();
    let method = compile(CompilerConfig::default(), |c| {
        c.init(5, 1, 2, 2);
        c.init_local(1, 0, ValueType::General)?;

        c.start_logical_ip(0)?;
        let zero = c.constant(0, ValueType::General);
        c.store_local(1, zero, 1)?;

        c.start_logical_ip(1)?;
        let n = c.load_local(1, 0)?;
        let i = c.load_local(1, 1)?;
        let exit = branch_target(c, 4);
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
        let header = branch_target(c, 1);
        c.jmp(header)?;
        c.visit_logical_ip(1)
    });
    let code = decode(&method);
    let start = method.base as u64;
    let end = start + method.code_size as u64;

    let back_edge = code
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Jmp)
        .expect("loop jump");
    assert!(back_edge.near_branch_target() < back_edge.ip());
    assert!(back_edge.near_branch_target() >= start);

    let exit = code
        .iter()
        .find(|i| i.flow_control() == FlowControl::ConditionalBranch)
        .expect("loop exit test");
    assert!((start..end).contains(&exit.near_branch_target()));
    assert_eq!(
        code.iter().filter(|i| i.mnemonic() == Mnemonic::Ret).count(),
        1
    );
}

#[test]
fn test_bounds_check_calls_handler_out_of_line() {
    let _ = env_logger::builder().is_test(true).try_init();
    let method = compile(CompilerConfig::default(), |c| {
        c.init(1, 2, 2, 2);
        c.init_local(1, 0, ValueType::General)?;
        c.init_local(1, 1, ValueType::General)?;

        c.start_logical_ip(0)?;
        let array = c.load_local(1, 0)?;
        let index = c.load_local(1, 1)?;
        c.check_bounds(array, 8, index, BOUNDS_HANDLER)?;
        let element = c.memory(array, ValueType::General, 16, Some(index), 4)?;
        let value = c.load(4, 4, element, 8)?;
        c.return_(8, Some(value))
    });
    let code = decode(&method);
    let names = mnemonics(&code);
    assert!(names.contains(&Mnemonic::Cmp));
    assert!(names.contains(&Mnemonic::Call));
    assert!(code
        .iter()
        .any(|i| i.flow_control() == FlowControl::ConditionalBranch));
    // the element load sign-extends four bytes into the result register
    assert!(names.contains(&Mnemonic::Movsxd));
}

#[test]
fn test_call_site_gets_frame_map() {
    let _ = env_logger::builder().is_test(true).try_init();
    let method = compile(CompilerConfig::default(), |c| {
        c.init(1, 1, 1, 2);
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
    });
    let code = decode(&method);
    let call = code
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Call)
        .expect("call");
    let return_offset = (call.next_ip() - method.base as u64) as i32;

    let FrameMapTable::Flat(table) = &method.frame_maps else {
        panic!("expected a flat table, got {:?}", method.frame_maps);
    };
    assert_eq!(table.offsets, vec![return_offset]);
    assert_eq!(
        method.frame_maps.roots(return_offset, &|_| None),
        Some(vec![true, false])
    );
}

#[test]
fn test_conversions_and_barriers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let method = compile(CompilerConfig::default(), |c| {
        c.init(1, 0, 0, 0);
        c.start_logical_ip(0)?;
        let pointer = c.register(RDI);
        let field = c.memory(pointer, ValueType::General, 0, None, 1)?;
        let short = c.loadz(2, 2, field, 8)?;
        c.load_barrier()?;
        c.store_store_barrier()?;
        c.store_load_barrier()?;
        let wide = c.i2f(8, 8, short)?;
        let root = c.fsqrt(8, wide)?;
        let back = c.f2i(8, 8, root)?;
        c.return_(8, Some(back))
    });
    let names = mnemonics(&decode(&method));
    for expected in [
        Mnemonic::Movzx,
        Mnemonic::Mfence,
        Mnemonic::Cvtsi2sd,
        Mnemonic::Sqrtsd,
        Mnemonic::Cvttsd2si,
    ] {
        assert!(names.contains(&expected), "{:?} missing from {:?}", expected, names);
    }
    // only the full fence is needed on x86-64
    assert_eq!(names.iter().filter(|&&m| m == Mnemonic::Mfence).count(), 1);
}
