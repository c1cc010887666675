//! Intermediate representation: events, abstract frames and the per-compile context.
//!
//! Events are appended by the façade and compiled in order by the driver. The context owns
//! every table; values, reads and sites are referenced by id.

pub mod context;
pub mod event;
pub mod stack;
pub mod values;

pub use context::{Context, HandledTrace};
pub use event::{
    CallFlags, EventId, EventKind, ForkStateId, LinkId, LogicalInstruction, SubroutineId,
};
pub use stack::{FrameElement, Frames, LocalsId, StackId};
