//! End-to-end scenarios through the façade, checked against what the recording emitter saw.
//!
//! Each method is built the way a bytecode front end would drive the core, compiled onto the
//! x86-64 description and emitted into a [`RecordingAssembler`] whose log the test keeps.

use bumpalo::Bump;
use jitcore::core::site::Site;
use jitcore::core::promise::CodeTarget;
use jitcore::recording::RecordLog;
use jitcore::target::{
    AnyOperation, BinaryOperation, Constant, Operand, TernaryOperation, UnaryOperation,
};
use jitcore::x64::{RAX, RDI, RSI};
use jitcore::{
    Architecture, CompilationSession, CompileError, CompileResult, Compiler, CompilerConfig,
    Recorded, RecordingAssembler, RuntimeHelpers, SessionStats, ValueType, X64Architecture,
};

const FLOAT_REMAINDER_HELPER: i64 = 0x7000_0000;

struct Helpers;

impl RuntimeHelpers for Helpers {
    fn thunk(&self, op: AnyOperation, _size: u32, _result_size: u32) -> i64 {
        assert_eq!(op, AnyOperation::Ternary(TernaryOperation::FloatRemainder));
        FLOAT_REMAINDER_HELPER
    }
}

/// What a finished compile left behind.
struct Outcome {
    log: Vec<Recorded>,
    stats: SessionStats,
    junction_tables: Vec<Vec<Option<Site>>>,
    all_released: bool,
    total_frame_size: u32,
}

fn compile_with(
    helpers: Option<&dyn RuntimeHelpers>,
    build: impl FnOnce(&mut Compiler<'_>) -> CompileResult<()>,
) -> CompileResult<Outcome> {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X64Architecture::new();
    let log: RecordLog = RecordingAssembler::new_log();
    let mut c = Compiler::new(
        &arch,
        Box::new(RecordingAssembler::with_log(log.clone())),
        CompilerConfig::default(),
        &session,
    );
    if let Some(helpers) = helpers {
        c = c.with_helpers(helpers);
    }
    build(&mut c)?;
    c.compile(None, 0)?;

    let ctx = c.context();
    let outcome = Outcome {
        log: log.borrow().clone(),
        stats: session.stats(),
        junction_tables: ctx.junction_tables.iter().cloned().collect(),
        all_released: ctx.resources.all_released(),
        total_frame_size: ctx.total_frame_size(),
    };
    c.finish(0x1000)?;
    Ok(outcome)
}

fn compile(build: impl FnOnce(&mut Compiler<'_>) -> CompileResult<()>) -> Outcome {
    match compile_with(None, build) {
        Ok(outcome) => outcome,
        Err(err) => panic!("compile failed: {}", err),
    }
}

fn position(log: &[Recorded], entry: &Recorded) -> usize {
    log.iter()
        .position(|r| r == entry)
        .unwrap_or_else(|| panic!("{:?} not recorded in {:#?}", entry, log))
}

fn moves_between(log: &[Recorded], start: usize, end: usize) -> Vec<&Recorded> {
    log[start..end]
        .iter()
        .filter(|r| {
            matches!(
                r,
                Recorded::Binary {
                    op: BinaryOperation::Move,
                    ..
                }
            )
        })
        .collect()
}

fn branch_target(c: &mut Compiler<'_>, ip: u32) -> jitcore::ValueId {
    let target = c.machine_ip(ip);
    c.promise_constant(target, ValueType::General)
}

/// `x == 0 ? 2 + x : 1 + x`, the taken side compiled first.
fn build_diamond(c: &mut Compiler<'_>) -> CompileResult<()> {
    c.init(5, 1, 2, 2);
    c.init_local(1, 0, ValueType::General)?;

    c.start_logical_ip(0)?;
    let x = c.load_local(1, 0)?;
    let zero = c.constant(0, ValueType::General);
    let taken = branch_target(c, 3);
    c.jump_if_equal(4, zero, x, taken)?;
    let state = c.save_state()?;

    c.start_logical_ip(3)?;
    let two = c.constant(2, ValueType::General);
    let y = c.add(4, two, x)?;
    c.store_local(1, y, 1)?;
    c.start_logical_ip(4)?;
    let y = c.load_local(1, 1)?;
    c.return_(4, Some(y))?;

    c.restore_state(state)?;
    c.start_logical_ip(1)?;
    let one = c.constant(1, ValueType::General);
    let y = c.add(4, one, x)?;
    c.store_local(1, y, 1)?;
    c.start_logical_ip(2)?;
    let join = branch_target(c, 4);
    c.jmp(join)?;
    c.visit_logical_ip(4)
}

/// The same method with the fall-through side compiled first.
fn build_diamond_fallthrough_first(c: &mut Compiler<'_>) -> CompileResult<()> {
    c.init(5, 1, 2, 2);
    c.init_local(1, 0, ValueType::General)?;

    c.start_logical_ip(0)?;
    let x = c.load_local(1, 0)?;
    let zero = c.constant(0, ValueType::General);
    let taken = branch_target(c, 3);
    c.jump_if_equal(4, zero, x, taken)?;
    let state = c.save_state()?;

    c.start_logical_ip(1)?;
    let one = c.constant(1, ValueType::General);
    let y = c.add(4, one, x)?;
    c.store_local(1, y, 1)?;
    c.start_logical_ip(2)?;
    let join = branch_target(c, 4);
    c.jmp(join)?;
    c.start_logical_ip(4)?;
    let y = c.load_local(1, 1)?;
    c.return_(4, Some(y))?;

    c.restore_state(state)?;
    c.start_logical_ip(3)?;
    let two = c.constant(2, ValueType::General);
    let y = c.add(4, two, x)?;
    c.store_local(1, y, 1)?;
    c.visit_logical_ip(4)
}

/// `i = 0; while i < n { i += 1 }; return i`.
fn build_loop(c: &mut Compiler<'_>) -> CompileResult<()> {
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
}

fn build_frem(c: &mut Compiler<'_>) -> CompileResult<()> {
    c.init(1, 0, 0, 0);
    c.start_logical_ip(0)?;
    let a = c.constant(f64::to_bits(1.5) as i64, ValueType::Float);
    let b = c.constant(f64::to_bits(7.0) as i64, ValueType::Float);
    let r = c.frem(8, a, b)?;
    c.return_(8, Some(r))
}

#[test]
fn test_add_in_place_needs_no_moves() {
    let _ = env_logger::builder().is_test(true).try_init();
    let out = compile(|c| {
        c.init(1, 0, 0, 0);
        c.start_logical_ip(0)?;
        let a = c.register(RDI);
        let b = c.register(RAX);
        let sum = c.add(8, a, b)?;
        c.return_(8, Some(sum))
    });

    assert_eq!(out.log.first(), Some(&Recorded::AllocateFrame(0)));
    assert!(matches!(out.log.last(), Some(Recorded::Return { .. })));
    assert!(out.log.contains(&Recorded::Bind(CodeTarget::Ip(0))));
    assert!(out.log.contains(&Recorded::Ternary {
        op: TernaryOperation::Add,
        a_size: 8,
        a: Operand::Register(RDI),
        b_size: 8,
        b: Operand::Register(RAX),
        c_size: 8,
        c: Operand::Register(RAX),
    }));
    assert!(!out
        .log
        .iter()
        .any(|r| matches!(r, Recorded::Binary { .. })));
    assert_eq!(out.stats.moves_inserted, 0);
    assert_eq!(out.stats.frame_spills, 0);
}

#[test]
fn test_zero_frame_method_allocates_header_only() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arch = X64Architecture::new();
    let out = compile(|c| {
        c.init(1, 0, 0, 0);
        c.start_logical_ip(0)?;
        c.return_(0, None)
    });
    assert_eq!(out.log.first(), Some(&Recorded::AllocateFrame(0)));
    assert_eq!(
        out.total_frame_size,
        arch.frame_header_size() + arch.argument_footprint(0)
    );
}

#[test]
fn test_diamond_join_needs_no_edge_moves() {
    let _ = env_logger::builder().is_test(true).try_init();
    let out = compile(build_diamond);
    let log = &out.log;

    let taken = position(log, &Recorded::Bind(CodeTarget::Ip(3)));
    let join = position(log, &Recorded::Bind(CodeTarget::Ip(4)));
    let taken_add = taken
        + log[taken..]
            .iter()
            .position(|r| {
                matches!(
                    r,
                    Recorded::Ternary {
                        op: TernaryOperation::Add,
                        ..
                    }
                )
            })
            .expect("add on the taken side");
    let edge_a = moves_between(log, taken_add + 1, join).len();

    let fallthrough_end = position(log, &Recorded::Bind(CodeTarget::Ip(2)));
    let jump = fallthrough_end
        + log[fallthrough_end..]
            .iter()
            .position(|r| {
                matches!(
                    r,
                    Recorded::Unary {
                        op: UnaryOperation::Jump,
                        ..
                    }
                )
            })
            .expect("jump back to the join");
    let edge_b = moves_between(log, fallthrough_end, jump).len();

    assert_eq!(edge_a, 0, "{:#?}", log);
    assert!(edge_a + edge_b <= 1, "{:#?}", log);
    assert_eq!(
        out.junction_tables,
        vec![vec![None, Some(Site::free_register(1 << RAX))]]
    );
    assert!(out.all_released);
}

#[test]
fn test_join_sites_ignore_successor_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let taken_first = compile(build_diamond);
    let fallthrough_first = compile(build_diamond_fallthrough_first);
    assert_eq!(taken_first.junction_tables.len(), 1);
    assert_eq!(
        taken_first.junction_tables,
        fallthrough_first.junction_tables
    );
}

#[test]
fn test_loop_back_edge_reconciles_with_one_move() {
    let _ = env_logger::builder().is_test(true).try_init();
    let out = compile(build_loop);
    let log = &out.log;

    let latch = position(log, &Recorded::Bind(CodeTarget::Ip(3)));
    let jump = latch
        + log[latch..]
            .iter()
            .position(|r| {
                matches!(
                    r,
                    Recorded::Unary {
                        op: UnaryOperation::Jump,
                        ..
                    }
                )
            })
            .expect("back-edge jump");
    let moves = moves_between(log, latch, jump);
    assert_eq!(moves.len(), 1, "{:#?}", log);
    match moves[0] {
        Recorded::Binary {
            a: Operand::Register(from),
            b: Operand::Register(to),
            ..
        } => assert_ne!(from, to),
        other => panic!("expected a register move, got {:?}", other),
    }

    // two values live at the header, so resolution settles within three passes
    assert!(out.stats.max_junction_passes <= 3);
    assert!(out.stats.junctions_resolved >= 1);
    assert!(out.all_released);
}

#[test]
fn test_float_remainder_calls_helper() {
    let _ = env_logger::builder().is_test(true).try_init();
    let out = match compile_with(Some(&Helpers), build_frem) {
        Ok(out) => out,
        Err(err) => panic!("compile failed: {}", err),
    };
    let log = &out.log;

    assert!(log.contains(&Recorded::Unary {
        op: UnaryOperation::Call,
        size: 8,
        a: Operand::Constant(Constant::Immediate(FLOAT_REMAINDER_HELPER)),
    }));
    assert!(!log.iter().any(|r| matches!(
        r,
        Recorded::Ternary {
            op: TernaryOperation::FloatRemainder,
            ..
        }
    )));
    for register in [RDI, RSI] {
        assert!(
            log.iter().any(|r| matches!(
                r,
                Recorded::Binary { b: Operand::Register(to), .. } if *to == register
            )),
            "no argument move into {} in {:#?}",
            register,
            log
        );
    }
    assert_eq!(out.stats.thunk_calls, 1);
}

#[test]
fn test_float_remainder_without_helpers_fails() {
    let _ = env_logger::builder().is_test(true).try_init();
    let result = compile_with(None, build_frem);
    assert!(matches!(result, Err(CompileError::InvalidOperand { .. })));
}

#[test]
fn test_session_counts_every_method() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X64Architecture::new();
    for build in [build_diamond, build_loop] {
        let mut c = Compiler::new(
            &arch,
            Box::new(RecordingAssembler::new()),
            CompilerConfig::default(),
            &session,
        );
        build(&mut c).expect("build");
        c.compile(None, 0).expect("compile");
        assert!(c.context().resources.all_released());
        c.finish(0x2000).expect("finish");
    }
    let stats = session.stats();
    assert_eq!(stats.methods_compiled, 2);
    assert!(stats.total_code_size >= stats.largest_method_size);
    assert!(stats.events_compiled > 0);
}

#[test]
fn test_stack_call_places_arguments_in_frame() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut top_after_call = Some(0);
    let out = compile(|c| {
        c.init(1, 0, 0, 2);
        c.start_logical_ip(0)?;
        let a = c.constant(1, ValueType::General);
        let b = c.constant(2, ValueType::General);
        c.push(1, a)?;
        c.push(1, b)?;
        let callee = c.constant(0x4000_0000, ValueType::General);
        let result = c.stack_call(
            callee,
            jitcore::CallFlags::NONE,
            None,
            8,
            ValueType::General,
            2,
        )?;
        c.popped(2)?;
        top_after_call = c.top_of_stack();
        c.return_(8, Some(result))
    });
    assert_eq!(top_after_call, None);

    let call = out
        .log
        .iter()
        .position(|r| matches!(r, Recorded::Unary { op: UnaryOperation::Call, .. }))
        .expect("call");
    let stores = out.log[..call]
        .iter()
        .filter(|r| matches!(r, Recorded::Binary { b: Operand::Memory { .. }, .. }))
        .count();
    assert!(stores >= 2, "{:#?}", out.log);
    assert!(out.all_released);
}
