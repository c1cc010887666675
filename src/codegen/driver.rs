// The linear emission pass. Events are compiled once, in append order. Entering an event
// first reconciles locations with its control-flow predecessors: the oldest predecessor link
// is followed to switch fan-out reads onto this path, and then either the junction table is
// applied (several predecessors) or the fork snapshots are restored (a single predecessor
// that branches elsewhere too). Sources are chosen for every read, the event emits its code,
// and site tables for any junction after it are settled either before emission (branches,
// which leave no room for moves afterwards) or after it. Code promises attached to the event
// are bound last.

//! The emission driver.

use crate::core::error::CompileResult;
use crate::core::promise::CodeTarget;
use crate::ir::context::Context;
use crate::ir::event::EventId;
use crate::regalloc::FrozenSites;
use log::{debug, trace};

impl<'a> Context<'a> {
    /// Emit the whole method. With a `stack_overflow_handler` the prologue first checks the
    /// stack limit stored at `stack_limit_offset` in the thread.
    pub fn compile(
        &mut self,
        stack_overflow_handler: Option<i64>,
        stack_limit_offset: u32,
    ) -> CompileResult<()> {
        self.begin(stack_overflow_handler, stack_limit_offset)?;
        let mut cursor = self.first_event;
        while let Some(e) = cursor {
            self.compile_one(e)?;
            cursor = self.event(e).next;
        }
        Ok(())
    }

    fn begin(
        &mut self,
        stack_overflow_handler: Option<i64>,
        stack_limit_offset: u32,
    ) -> CompileResult<()> {
        self.ensure_event()?;

        if let Some(handler) = stack_overflow_handler {
            self.with_assembler(|asm, _| asm.check_stack_overflow(handler, stack_limit_offset))?;
        }
        let footprint = self.aligned_frame_size;
        self.with_assembler(|asm, _| asm.allocate_frame(footprint))?;
        self.acquire_register_values()?;

        debug!(
            "compiling {} events, frame {} words",
            self.events.len(),
            self.total_frame_size()
        );
        Ok(())
    }

    /// Claim the registers of values created in a fixed register that are still read.
    fn acquire_register_values(&mut self) -> CompileResult<()> {
        for (v, s) in std::mem::take(&mut self.register_values) {
            if self.is_live(v) && self.value(v).sites.contains(&s) {
                trace!("{:?} starts in {:?}", v, self.site(s));
                self.acquire_site(v, s)?;
            }
        }
        Ok(())
    }

    fn bind_instruction_start(&mut self, e: EventId) -> CompileResult<()> {
        let ip = self.event(e).logical_ip;
        if ip < 0 {
            return Ok(());
        }
        let instruction = self.logical_mut(ip)?;
        if instruction.bound {
            return Ok(());
        }
        instruction.bound = true;
        self.bind(CodeTarget::Ip(ip as u32))
    }

    fn enter(&mut self, e: EventId) -> CompileResult<()> {
        let predecessors = self.event(e).predecessors.clone();
        let (Some(&oldest), Some(&newest)) = (predecessors.first(), predecessors.last()) else {
            return Ok(());
        };
        self.visit(oldest)?;

        let first = self.link(newest).predecessor;
        if predecessors.len() > 1 {
            for &link in &predecessors[1..] {
                self.update_junction_reads(link);
            }
            if let Some(table) = self.event(first).junction_sites {
                if self.config.trace_junctions {
                    trace!("{:?} takes junction table {:?}", e, table);
                }
                self.set_sites(e, table)?;
            }
            self.remove_buddies();
        } else if self.event(first).successors.len() > 1 {
            let snapshots = self.event(first).snapshots.clone();
            self.restore_snapshots(e, &snapshots)?;
        }
        Ok(())
    }

    fn compile_one(&mut self, e: EventId) -> CompileResult<()> {
        trace!(
            "compile {} at {} with {} preds {} succs",
            self.event(e).kind.name(),
            self.event(e).logical_ip,
            self.event(e).predecessors.len(),
            self.event(e).successors.len()
        );

        self.stack = self.event(e).stack_before;
        self.locals = self.event(e).locals_before;
        self.bind_instruction_start(e)?;
        self.enter(e)?;

        let mut frozen = FrozenSites::new();
        let branch = self.event(e).kind.is_branch();
        let has_successors = !self.event(e).successors.is_empty();

        if branch && has_successors {
            if let Err(err) = self.populate_site_tables(e, &mut frozen) {
                self.thaw_all(&mut frozen);
                return Err(err);
            }
        }
        let sourced = self.populate_sources(e);
        if branch && has_successors {
            self.capture_branch_snapshots(e);
        }
        self.thaw_all(&mut frozen);
        sourced?;

        self.compile_event(e)?;

        if !branch && has_successors {
            let populated = self.populate_site_tables(e, &mut frozen);
            self.capture_branch_snapshots(e);
            self.thaw_all(&mut frozen);
            populated?;
        }

        let links = std::mem::take(&mut self.event_mut(e).visit_links);
        for link in links {
            self.visit(link)?;
        }

        let promises = self.event(e).promises.clone();
        for p in promises {
            self.bind(CodeTarget::Promise(p))?;
        }
        self.with_assembler(|asm, _| {
            asm.end_event();
            Ok(())
        })?;
        let name = self.event(e).kind.name();
        self.session.record_event_compiled(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::Compiler;
    use crate::core::config::CompilerConfig;
    use crate::core::error::CompileResult;
    use crate::core::session::CompilationSession;
    use crate::core::value::{ValueId, ValueType};
    use crate::recording::RecordingAssembler;
    use crate::x64::{X64Architecture, RCX, RDI, RDX, RSI};
    use bumpalo::Bump;

    /// `x = 100`, then `x + i` for every `i < count`, then the sum of all of them. More values
    /// are live at once than there are registers.
    fn build_pressure(c: &mut Compiler<'_>, count: i64) -> CompileResult<()> {
        c.init(1, 0, 0, 16);
        c.start_logical_ip(0)?;
        let zero = c.constant(0, ValueType::General);
        let hundred = c.constant(100, ValueType::General);
        let x = c.add(8, zero, hundred)?;
        let mut terms = Vec::new();
        for i in 0..count {
            let k = c.constant(i, ValueType::General);
            terms.push(c.add(8, k, x)?);
        }
        let mut sum = terms[0];
        for &t in &terms[1..] {
            sum = c.add(8, t, sum)?;
        }
        c.return_(8, Some(sum))
    }

    /// Division and a shift while other live values sit in the registers they need.
    fn build_fixed_registers(c: &mut Compiler<'_>) -> CompileResult<()> {
        c.init(1, 0, 0, 4);
        c.start_logical_ip(0)?;
        let d = c.register(RDX);
        let k = c.register(RCX);
        let n = c.register(RDI);
        let m = c.register(RSI);
        let q = c.div(8, m, n)?;
        let r = c.rem(8, m, n)?;
        let s = c.shl(8, m, d)?;
        let t = c.add(8, q, r)?;
        let t = c.add(8, t, s)?;
        let t = c.add(8, t, d)?;
        let t = c.add(8, t, k)?;
        c.return_(8, Some(t))
    }

    /// Compile event by event and report every value that was placed, is still read later,
    /// and holds no site after some event.
    fn homeless_values(build: impl FnOnce(&mut Compiler<'_>) -> CompileResult<()>) -> Vec<String> {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let arch = X64Architecture::new();
        let mut c = Compiler::new(
            &arch,
            Box::new(RecordingAssembler::new()),
            CompilerConfig::default(),
            &session,
        );
        build(&mut c).unwrap();

        let ctx = c.context_mut();
        ctx.begin(None, 0).unwrap();
        let mut placed = vec![false; ctx.values.len()];
        let mut lost = Vec::new();
        let mut cursor = ctx.first_event;
        while let Some(e) = cursor {
            ctx.compile_one(e).unwrap();
            for (i, was_placed) in placed.iter_mut().enumerate() {
                let v = ValueId(i as u32);
                if ctx.has_site(v) {
                    *was_placed = true;
                } else if *was_placed && ctx.is_live(v) {
                    lost.push(format!("{:?} after {}", v, ctx.event(e).kind.name()));
                }
            }
            cursor = ctx.event(e).next;
        }
        lost
    }

    #[test]
    fn test_live_values_keep_a_site_under_register_pressure() {
        let _ = env_logger::builder().is_test(true).try_init();
        let lost = homeless_values(|c| build_pressure(c, 20));
        assert!(lost.is_empty(), "values lost their last site: {:?}", lost);
    }

    #[test]
    fn test_live_values_keep_a_site_across_clobbers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let lost = homeless_values(build_fixed_registers);
        assert!(lost.is_empty(), "values lost their last site: {:?}", lost);
    }

    #[test]
    fn test_register_values_own_their_register() {
        let _ = env_logger::builder().is_test(true).try_init();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let arch = X64Architecture::new();
        let mut c = Compiler::new(
            &arch,
            Box::new(RecordingAssembler::new()),
            CompilerConfig::default(),
            &session,
        );
        c.init(1, 0, 0, 0);
        c.start_logical_ip(0).unwrap();
        let a = c.register(RDI);
        let unread = c.register(RSI);
        let one = c.constant(1, ValueType::General);
        let sum = c.add(8, one, a).unwrap();
        c.return_(8, Some(sum)).unwrap();

        let ctx = c.context_mut();
        ctx.begin(None, 0).unwrap();
        let owner = |r: u8| ctx.resources.get(crate::core::resource::ResourceId::Register(r)).owner;
        assert_eq!(owner(RDI).map(|(v, _)| v), Some(a));
        // a value nobody reads does not pin its register
        assert_eq!(owner(RSI), None);
        assert_eq!(ctx.value(unread).sites.len(), 1);
    }
}
