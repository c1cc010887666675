// Code generation turns the event list into emitter calls. `append` builds events and their
// reads while the front end drives the façade (including the rewrite of unencodable
// operations into helper calls), `events` holds the per-kind emission logic, `apply` converts
// sites into operands and forwards operations to the emitter, and `driver` is the single
// linear pass that reconciles locations at control-flow edges and emits every event in order.

//! Event construction, per-event emission and the emission driver.

pub mod append;
pub mod apply;
pub mod driver;
pub mod events;
