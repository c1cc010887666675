// The register and frame-slot allocator. It has no pass of its own: the driver calls into it
// while compiling each event, and it works directly on the per-compile Context tables. Target
// selection prices registers and frame slots; the move layer copies a value into a chosen
// site when none of its current sites satisfies a read; the site layer acquires and releases
// resources (stealing from other values when needed); the junction layer reconciles layouts
// where control flow splits and merges.

//! Site selection, inserted moves and control-flow reconciliation.

pub mod junction;
pub mod moves;
pub mod scratch;
pub mod sites;
pub mod target;

pub use junction::FrozenSites;
pub use target::{Accept, Target};
