//! Frame-map solving driven through the façade.

use bumpalo::Bump;
use jitcore::{
    CallFlags, CompilationSession, CompileResult, Compiler, CompilerConfig, FrameMapTable,
    RecordingAssembler, ValueType, X64Architecture,
};

const CALLEE: i64 = 0x4000_0000;

/// Two calls; slot 0 holds a reference across the first, slot 1 across both.
fn build(c: &mut Compiler<'_>) -> CompileResult<()> {
    c.init(2, 2, 2, 2);
    c.init_frame_maps(1);
    c.init_local(1, 0, ValueType::General)?;
    c.init_local(1, 1, ValueType::General)?;

    c.start_logical_ip(0)?;
    c.frame_maps_mut().mark(0);
    c.frame_maps_mut().mark(1);
    let object = c.load_local(1, 0)?;
    let trace = c.frame_maps_mut().trace(0);
    let callee = c.constant(CALLEE, ValueType::General);
    c.call(
        callee,
        CallFlags::NONE,
        Some(trace),
        8,
        ValueType::General,
        &[object],
    )?;

    c.start_logical_ip(1)?;
    c.frame_maps_mut().clear(0);
    let object = c.load_local(1, 1)?;
    let trace = c.frame_maps_mut().trace(1);
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

fn compile(presolve: bool) -> FrameMapTable {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X64Architecture::new();
    let mut c = Compiler::new(
        &arch,
        Box::new(RecordingAssembler::new()),
        CompilerConfig::default(),
        &session,
    );
    build(&mut c).expect("build");
    c.compile(None, 0).expect("compile");
    if presolve {
        let config = c.context().config.clone();
        c.frame_maps_mut().solve(&config).expect("solve");
    }
    c.finish(0x1000).expect("finish").frame_maps
}

#[test]
fn test_roots_follow_marks_and_clears() {
    let _ = env_logger::builder().is_test(true).try_init();
    let table = compile(false);
    let FrameMapTable::Flat(flat) = &table else {
        panic!("expected a flat table, got {:?}", table);
    };
    assert_eq!(flat.offsets.len(), 2);
    assert!(flat.offsets[0] < flat.offsets[1]);

    let first = table.roots(flat.offsets[0], &|_| None).expect("first map");
    let second = table.roots(flat.offsets[1], &|_| None).expect("second map");
    assert_eq!(first, vec![true, true, false]);
    assert_eq!(second, vec![false, true, false]);
}

#[test]
fn test_solving_again_changes_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let once = compile(false);
    let twice = compile(true);
    assert_eq!(once, twice);
    assert_eq!(once.encode(), twice.encode());
}
