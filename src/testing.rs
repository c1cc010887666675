//! Test fixtures shared by the unit tests.

use crate::core::config::CompilerConfig;
use crate::core::session::CompilationSession;
use crate::ir::context::Context;
use crate::recording::RecordingAssembler;
use crate::target::Assembler;
use crate::x64::X64Architecture;
use bumpalo::Bump;

/// Run `f` on a fresh x86-64 context that records emitted operations.
pub(crate) fn context_fixture<R>(
    f: impl FnOnce(&mut Context<'_>, &CompilationSession<'_>) -> R,
) -> R {
    context_fixture_with(RecordingAssembler::new(), f)
}

pub(crate) fn context_fixture_with<R>(
    assembler: impl Assembler + 'static,
    f: impl FnOnce(&mut Context<'_>, &CompilationSession<'_>) -> R,
) -> R {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X64Architecture::new();
    let mut ctx = Context::new(
        &arch,
        Box::new(assembler),
        CompilerConfig::default(),
        &session,
    );
    f(&mut ctx, &session)
}
