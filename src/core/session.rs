// This module provides arena-based session management for one or more method compilations.
// CompilationSession owns a reference to the bumpalo arena that backs every IR table of a
// compile (values, sites, reads, events, links, junction tables) so that nothing is freed
// individually and everything shares the session lifetime. The session also accumulates
// SessionStats: events compiled per kind, moves inserted by the allocator, register steals,
// frame spills, thunk calls, and the pass counts of the junction and frame-map fixed points.
// Statistics live behind a RefCell so the allocator can record them through a shared
// reference while it holds mutable borrows of its own tables.

//! Arena-based compilation session management.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// Arena-based compilation session.
///
/// All IR produced while compiling a method is allocated in the session arena and dropped
/// together with it.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Record that a method finished compiling.
    pub fn record_method_compiled(&self, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.methods_compiled += 1;
        stats.total_code_size += code_size;
        stats.largest_method_size = stats.largest_method_size.max(code_size);
    }

    /// Record an event compilation.
    pub fn record_event_compiled(&self, kind: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.events_compiled += 1;
        *stats.event_counts.entry(kind).or_insert(0) += 1;
    }

    /// Record a move inserted by the allocator.
    pub fn record_move_inserted(&self) {
        self.stats.borrow_mut().moves_inserted += 1;
    }

    /// Record a register or frame slot taken from another value.
    pub fn record_steal(&self) {
        self.stats.borrow_mut().steals += 1;
    }

    /// Record a value placed in a frame slot instead of a register.
    pub fn record_frame_spill(&self) {
        self.stats.borrow_mut().frame_spills += 1;
    }

    /// Record an operation rewritten into a helper call.
    pub fn record_thunk_call(&self) {
        self.stats.borrow_mut().thunk_calls += 1;
    }

    /// Record the number of passes a junction needed.
    pub fn record_junction_passes(&self, passes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.junctions_resolved += 1;
        stats.max_junction_passes = stats.max_junction_passes.max(passes);
    }

    /// Record the number of frame-map passes.
    pub fn record_frame_map_passes(&self, passes: usize) {
        self.stats.borrow_mut().frame_map_passes = passes;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of methods compiled.
    pub methods_compiled: usize,

    /// Total machine code emitted (bytes).
    pub total_code_size: usize,

    /// Largest method emitted (bytes).
    pub largest_method_size: usize,

    /// Number of events compiled.
    pub events_compiled: usize,

    /// Count of each event kind compiled.
    pub event_counts: HashMap<&'static str, usize>,

    /// Moves inserted by the allocator.
    pub moves_inserted: usize,

    /// Resources taken from another value.
    pub steals: usize,

    /// Values placed in frame slots.
    pub frame_spills: usize,

    /// Operations rewritten into helper calls.
    pub thunk_calls: usize,

    /// Junctions resolved.
    pub junctions_resolved: usize,

    /// Largest number of passes a single junction needed.
    pub max_junction_passes: usize,

    /// Passes of the last frame-map solve.
    pub frame_map_passes: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Methods compiled: {}", self.methods_compiled)?;
        writeln!(f, "  Events compiled: {}", self.events_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Moves inserted: {}", self.moves_inserted)?;
        writeln!(f, "  Steals: {}", self.steals)?;
        writeln!(f, "  Frame spills: {}", self.frame_spills)?;
        writeln!(f, "  Thunk calls: {}", self.thunk_calls)?;
        writeln!(
            f,
            "  Junctions resolved: {} (max {} passes)",
            self.junctions_resolved, self.max_junction_passes
        )?;
        writeln!(f, "  Frame-map passes: {}", self.frame_map_passes)?;

        if !self.event_counts.is_empty() {
            writeln!(f, "  Event breakdown:")?;
            let mut sorted: Vec<_> = self.event_counts.iter().collect();
            sorted.sort_by_key(|(kind, count)| (std::cmp::Reverse(**count), **kind));

            for (kind, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", kind, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.methods_compiled, 0);
        assert_eq!(stats.events_compiled, 0);
        assert_eq!(stats.moves_inserted, 0);
    }

    #[test]
    fn test_stats_are_a_snapshot() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let before = session.stats();
        session.record_steal();
        session.record_frame_map_passes(3);
        assert_eq!(before.steals, 0);
        assert_eq!(session.stats().steals, 1);
        assert_eq!(session.stats().frame_map_passes, 3);
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_method_compiled(64);
        session.record_method_compiled(16);
        session.record_event_compiled("Combine");
        session.record_event_compiled("Return");
        session.record_event_compiled("Combine");
        session.record_move_inserted();
        session.record_junction_passes(1);
        session.record_junction_passes(2);

        let stats = session.stats();
        assert_eq!(stats.methods_compiled, 2);
        assert_eq!(stats.total_code_size, 80);
        assert_eq!(stats.largest_method_size, 64);
        assert_eq!(stats.events_compiled, 3);
        assert_eq!(stats.event_counts["Combine"], 2);
        assert_eq!(stats.max_junction_passes, 2);

        let output = format!("{}", stats);
        assert!(output.contains("Compilation Session Statistics:"));
        assert!(output.contains("Combine: 2"));
    }
}
