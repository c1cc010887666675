// This module holds the machine-independent building blocks shared by the allocator, the
// event layer and the façade: the compilation session (arena plus statistics), configuration,
// the error taxonomy, lazily resolved promises, and the operand model itself. The operand
// model has four layers. A value is a logical operand; a site is a place a value can live
// right now; a resource is the register or frame slot a site occupies; and a read is a
// pending demand on a value that tells the allocator where the value will be needed next.
// Everything is indexed by small copyable ids into per-compile tables that live in the
// session arena, so there is no shared ownership and no reference cycles even though values
// alias each other through buddy rings.

//! Core infrastructure for the code generation pipeline.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Compilation statistics (events, moves, steals, spills, fixed-point passes)
//!
//! ## Operand Model (`value`, `site`, `resource`, `read`)
//! - Values with buddy rings and candidate site lists
//! - Sites with copy costs and location masks
//! - Register and frame-slot resources with freeze and reference counts
//! - Single, fan-out and stub reads
//!
//! ## Promises (`promise`)
//! - Resolved constants, machine IPs, code positions and pool slots
//! - Listener-based deferred resolution

pub mod config;
pub mod error;
pub mod promise;
pub mod read;
pub mod resource;
pub mod session;
pub mod site;
pub mod value;

pub use config::CompilerConfig;
pub use error::{CompileError, CompileResult};
pub use promise::{CodeLayout, CodeTarget, PromiseId, PromiseKind, PromiseTable};
pub use read::{ReadId, ReadKind, ReadTable};
pub use resource::{ResourceId, ResourceTable};
pub use session::{CompilationSession, SessionStats};
pub use site::{FrameGeometry, FrameSlot, Site, SiteId, SiteMask};
pub use value::{ValueId, ValueType};
