// Compiler configuration. The allocator keeps a small number of general registers in reserve
// while it relocates a value whose register is being stolen and while it resolves junction
// tables; both reserves are configurable here together with tail-call support, frame pointer
// usage and the optional cap on frame-map passes. Debug toggles only widen `trace!` output.

//! Tunables for one compilation.

/// Per-compilation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// General registers kept free while relocating the owner of a stolen register.
    pub steal_register_reserve: u32,
    /// General registers kept free while choosing junction sites.
    pub resolve_register_reserve: u32,
    /// Honor `CallFlags::TAIL_JUMP` by popping the frame before the jump.
    pub tail_calls: bool,
    /// Keep the frame pointer slot reserved.
    pub use_frame_pointer: bool,
    /// Optional cap below the computed frame-map pass bound.
    pub max_frame_map_passes: Option<usize>,
    /// Trace read creation and consumption.
    pub trace_reads: bool,
    /// Trace junction and snapshot decisions.
    pub trace_junctions: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            steal_register_reserve: 2,
            resolve_register_reserve: 2,
            tail_calls: false,
            use_frame_pointer: true,
            max_frame_map_passes: None,
            trace_reads: false,
            trace_junctions: false,
        }
    }
}

impl CompilerConfig {
    pub fn with_tail_calls(mut self, enabled: bool) -> Self {
        self.tail_calls = enabled;
        self
    }

    pub fn with_max_frame_map_passes(mut self, passes: usize) -> Self {
        self.max_frame_map_passes = Some(passes);
        self
    }

    pub fn with_tracing(mut self, reads: bool, junctions: bool) -> Self {
        self.trace_reads = reads;
        self.trace_junctions = junctions;
        self
    }

    pub fn with_reserves(mut self, steal: u32, resolve: u32) -> Self {
        self.steal_register_reserve = steal;
        self.resolve_register_reserve = resolve;
        self
    }
}
