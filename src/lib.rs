//! jitcore - machine-independent JIT code generation core.
//!
//! The core turns a stream of abstract operations from a bytecode front end into machine code
//! through a per-architecture emitter. Values move between registers, frame slots, constants
//! and absolute addresses as the operations consume them; control-flow forks and merges are
//! reconciled so every path agrees on where each live value is, and a side log of GC root
//! slots is solved into per-call-site frame maps.
//!
//! # Primary Usage
//!
//! ```ignore
//! use jitcore::{CompilationSession, Compiler, CompilerConfig, ValueType};
//! use jitcore::x64::{X64Architecture, X64Assembler};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let arch = X64Architecture::new();
//! let mut c = Compiler::new(
//!     &arch,
//!     Box::new(X64Assembler::new()?),
//!     CompilerConfig::default(),
//!     &session,
//! );
//! c.init(1, 0, 0, 0);
//! c.start_logical_ip(0)?;
//! let one = c.constant(1, ValueType::General);
//! c.return_(8, Some(one))?;
//! c.compile(None, 0)?;
//! let method = c.finish(0x1000)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - session, configuration, errors, promises, sites, resources, values and reads
//! - [`ir`] - events, abstract frames and the per-compile context
//! - [`regalloc`] - target selection, inserted moves, junction and fork reconciliation
//! - [`codegen`] - event construction and emission
//! - [`compiler`] - the façade driven by the front end
//! - [`frame_map`] - GC root log, solver and tables
//! - [`target`] - planning and emitter interfaces
//! - [`x64`] - x86-64 description and `iced-x86` emitter
//! - [`recording`] - an emitter that records what it is asked to emit

pub mod codegen;
pub mod compiler;
pub mod core;
pub mod frame_map;
pub mod ir;
pub mod recording;
pub mod regalloc;
pub mod target;
pub mod x64;

#[cfg(test)]
mod testing;

pub use crate::compiler::{CompiledMethod, Compiler};
pub use crate::core::{
    CompilationSession, CompileError, CompileResult, CompilerConfig, PromiseId, SessionStats,
    ValueId, ValueType,
};
pub use crate::frame_map::{FrameMapLog, FrameMapTable, TraceId};
pub use crate::ir::event::{CallFlags, ForkStateId, SubroutineId};
pub use crate::recording::{Recorded, RecordingAssembler};
pub use crate::target::{AnyOperation, Architecture, Assembler, RuntimeHelpers};
pub use crate::x64::{X64Architecture, X64Assembler};
