// The per-compile context. One Context exists for each compiled method and owns every table
// the allocator works on: values, sites, reads, events, links, fork states, junction tables
// and the register/frame resource table. All IR tables are arena-backed vectors indexed by
// small ids, which keeps buddy rings and event links free of shared ownership. The context
// also carries the construction-time state the façade mutates (current abstract stack and
// locals, the last appended event, the pending fork state) and the frame arithmetic shared by
// every layer.
//
// The emitter lives here too, boxed and temporarily taken out while it runs so it can call
// back into the context for scratch registers.

//! Per-compile state and frame arithmetic.

use crate::core::config::CompilerConfig;
use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::{PromiseId, PromiseTable};
use crate::core::read::{ReadId, ReadTable};
use crate::core::resource::ResourceTable;
use crate::core::session::CompilationSession;
use crate::core::site::{FrameGeometry, Site, SiteId, SiteMask};
use crate::core::value::{ValueData, ValueId, ValueType};
use crate::frame_map::TraceId;
use crate::ir::event::{
    EventData, EventId, EventKind, ForkState, ForkStateId, JunctionTableId, Link, LinkId,
    LogicalInstruction, SubroutineId, SubroutineState,
};
use crate::ir::stack::{FrameElement, Frames, LocalsId, StackId};
use crate::target::{Architecture, Assembler, RuntimeHelpers};
use bumpalo::collections::Vec as BumpVec;
use log::trace;

/// A call's return address, recorded for the frame-map builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandledTrace {
    pub trace: TraceId,
    pub address: PromiseId,
    pub argument_index: u32,
}

pub struct Context<'a> {
    pub arch: &'a dyn Architecture,
    pub config: CompilerConfig,
    pub session: &'a CompilationSession<'a>,
    pub(crate) assembler: Option<Box<dyn Assembler + 'a>>,
    /// Helper addresses for operations the target cannot encode inline.
    pub helpers: Option<&'a dyn RuntimeHelpers>,

    pub values: BumpVec<'a, ValueData>,
    pub sites: BumpVec<'a, Site>,
    pub reads: ReadTable<'a>,
    pub events: BumpVec<'a, EventData>,
    pub links: BumpVec<'a, Link>,
    pub frames: Frames<'a>,
    pub fork_states: BumpVec<'a, ForkState>,
    pub subroutines: BumpVec<'a, SubroutineState>,
    pub junction_tables: BumpVec<'a, Vec<Option<Site>>>,
    /// Indexed by `ip + 1`; slot 0 is the method prologue.
    pub logical_code: Vec<Option<LogicalInstruction>>,
    pub promises: PromiseTable,
    pub resources: ResourceTable,
    pub geometry: FrameGeometry,

    pub stack: Option<StackId>,
    pub locals: LocalsId,
    pub saved: Vec<ValueId>,
    pub predecessor: Option<EventId>,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub fork_state: Option<ForkStateId>,
    pub subroutine: Option<SubroutineId>,
    pub logical_ip: i32,

    pub logical_code_length: u32,
    pub parameter_footprint: u32,
    pub local_footprint: u32,
    pub aligned_frame_size: u32,

    pub constant_pool: Vec<PromiseId>,
    pub handled_traces: Vec<HandledTrace>,
    /// Values created in a fixed register, acquired when emission starts.
    pub register_values: Vec<(ValueId, SiteId)>,
}

impl<'a> Context<'a> {
    pub fn new(
        arch: &'a dyn Architecture,
        assembler: Box<dyn Assembler + 'a>,
        config: CompilerConfig,
        session: &'a CompilationSession<'a>,
    ) -> Self {
        let arena = session.arena();
        let mut frames = Frames::new_in(arena);
        let locals = frames.init(0);
        let resources = ResourceTable::new(
            arch.register_count(),
            arch.general_register_mask(),
            |r| arch.reserved(r),
        );
        Self {
            arch,
            config,
            session,
            assembler: Some(assembler),
            helpers: None,
            values: BumpVec::new_in(arena),
            sites: BumpVec::new_in(arena),
            reads: ReadTable::new_in(arena),
            events: BumpVec::new_in(arena),
            links: BumpVec::new_in(arena),
            frames,
            fork_states: BumpVec::new_in(arena),
            subroutines: BumpVec::new_in(arena),
            junction_tables: BumpVec::new_in(arena),
            logical_code: Vec::new(),
            promises: PromiseTable::new(),
            resources,
            geometry: FrameGeometry {
                stack: arch.stack(),
                footer: arch.frame_footer_size(),
            },
            stack: None,
            locals,
            saved: Vec::new(),
            predecessor: None,
            first_event: None,
            last_event: None,
            fork_state: None,
            subroutine: None,
            logical_ip: -1,
            logical_code_length: 0,
            parameter_footprint: 0,
            local_footprint: 0,
            aligned_frame_size: 0,
            constant_pool: Vec::new(),
            handled_traces: Vec::new(),
            register_values: Vec::new(),
        }
    }

    /// Size the frame and the instruction table for one method.
    pub fn init(
        &mut self,
        logical_code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        aligned_frame_size: u32,
    ) {
        self.logical_code_length = logical_code_length;
        self.parameter_footprint = parameter_footprint;
        self.local_footprint = local_footprint;
        self.aligned_frame_size = aligned_frame_size;

        let base = self.frame_base() as i64;
        let mut reserved = vec![(base + self.arch.return_address_offset() as i64) as u32];
        if self.config.use_frame_pointer {
            reserved.push((base + self.arch.frame_pointer_offset() as i64) as u32);
        }
        self.resources.init_frame(self.total_frame_size(), &reserved);

        self.locals = self.frames.init(local_footprint);
        self.stack = None;
        self.logical_code = vec![None; logical_code_length as usize + 1];
        self.logical_code[0] = Some(LogicalInstruction::new(-1, None, self.locals));
        self.logical_ip = -1;

        log::debug!(
            "init: {} instructions, {} parameter words, {} locals, frame {} (total {})",
            logical_code_length,
            parameter_footprint,
            local_footprint,
            aligned_frame_size,
            self.total_frame_size()
        );
    }

    // -- frame arithmetic --------------------------------------------------

    pub fn total_frame_size(&self) -> u32 {
        self.aligned_frame_size
            + self.arch.frame_header_size()
            + self.arch.argument_footprint(self.parameter_footprint)
    }

    /// Frame slot of logical slot `index` (parameters, then locals, then stack).
    pub fn frame_index(&self, index: u32) -> u32 {
        let raw =
            self.aligned_frame_size as i64 + self.parameter_footprint as i64 - index as i64 - 1;
        let adjusted = if index < self.parameter_footprint {
            raw + self.arch.frame_header_size() as i64
        } else {
            raw - self.arch.frame_footer_size() as i64
        };
        adjusted as u32
    }

    pub fn frame_base(&self) -> u32 {
        self.aligned_frame_size + self.arch.frame_header_size()
            - self.arch.frame_return_address_size()
            - self.arch.frame_footer_size()
    }

    pub fn frame_footprint(&self, stack: Option<StackId>) -> u32 {
        self.frames.frame_footprint(stack)
    }

    pub fn frame_elements(
        &self,
        stack: Option<StackId>,
        locals: LocalsId,
        include_empty: bool,
    ) -> Vec<FrameElement> {
        self.frames.elements(stack, locals, include_empty)
    }

    // -- tables ------------------------------------------------------------

    pub fn value(&self, id: ValueId) -> &ValueData {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut ValueData {
        &mut self.values[id.index()]
    }

    pub fn new_value(&mut self, value_type: ValueType) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData::new(id, value_type));
        id
    }

    /// A value that starts out in `site`. Register sites are acquired once emission starts,
    /// so nothing placed before the value is read can reuse the register.
    pub fn new_value_at(&mut self, value_type: ValueType, site: Site) -> ValueId {
        let id = self.new_value(value_type);
        let s = self.new_site(site);
        self.value_mut(id).sites.push(s);
        if matches!(site, Site::Register { .. }) {
            self.register_values.push((id, s));
        }
        id
    }

    pub fn new_site(&mut self, site: Site) -> SiteId {
        self.sites.push(site);
        SiteId(self.sites.len() as u32 - 1)
    }

    pub fn site(&self, id: SiteId) -> Site {
        self.sites[id.0 as usize]
    }

    pub fn site_mut(&mut self, id: SiteId) -> &mut Site {
        &mut self.sites[id.0 as usize]
    }

    pub fn event(&self, id: EventId) -> &EventData {
        &self.events[id.0 as usize]
    }

    pub fn event_mut(&mut self, id: EventId) -> &mut EventData {
        &mut self.events[id.0 as usize]
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0 as usize]
    }

    pub fn link_mut(&mut self, id: LinkId) -> &mut Link {
        &mut self.links[id.0 as usize]
    }

    pub fn fork_state(&self, id: ForkStateId) -> &ForkState {
        &self.fork_states[id.0 as usize]
    }

    pub fn junction_table(&self, id: JunctionTableId) -> &[Option<Site>] {
        &self.junction_tables[id.0 as usize]
    }

    pub fn junction_table_mut(&mut self, id: JunctionTableId) -> &mut Vec<Option<Site>> {
        &mut self.junction_tables[id.0 as usize]
    }

    pub fn new_junction_table(&mut self, size: u32) -> JunctionTableId {
        self.junction_tables.push(vec![None; size as usize]);
        JunctionTableId(self.junction_tables.len() as u32 - 1)
    }

    pub fn new_subroutine(&mut self) -> SubroutineId {
        self.subroutines.push(SubroutineState::default());
        SubroutineId(self.subroutines.len() as u32 - 1)
    }

    pub fn logical(&self, ip: i32) -> CompileResult<&LogicalInstruction> {
        self.logical_code
            .get((ip + 1) as usize)
            .and_then(|i| i.as_ref())
            .ok_or_else(|| {
                CompileError::invariant(format!("logical instruction {} not started", ip))
            })
    }

    pub fn logical_mut(&mut self, ip: i32) -> CompileResult<&mut LogicalInstruction> {
        self.logical_code
            .get_mut((ip + 1) as usize)
            .and_then(|i| i.as_mut())
            .ok_or_else(|| {
                CompileError::invariant(format!("logical instruction {} not started", ip))
            })
    }

    pub fn is_started(&self, ip: u32) -> bool {
        matches!(self.logical_code.get(ip as usize + 1), Some(Some(_)))
    }

    // -- reads -------------------------------------------------------------

    /// Link `read` into the read list of `event` and onto the end of `value`'s chain.
    pub fn add_read(
        &mut self,
        event: Option<EventId>,
        value: ValueId,
        read: ReadId,
    ) -> CompileResult<()> {
        if self.config.trace_reads {
            trace!("add read {:?} to {:?} for {:?}", read, value, event);
        }
        if let Some(e) = event {
            self.reads.get_mut(read).event = Some(e);
            self.event_mut(e).reads.push(read);
        }
        match self.value(value).last_read {
            Some(last) => self.reads.append(last, read)?,
            None => self.value_mut(value).reads = Some(read),
        }
        self.value_mut(value).last_read = Some(read);
        Ok(())
    }

    pub fn add_single_read(
        &mut self,
        event: EventId,
        value: ValueId,
        mask: SiteMask,
        successor: Option<ValueId>,
    ) -> CompileResult<ReadId> {
        let read = self.reads.single(value, mask, successor);
        self.add_read(Some(event), value, read)?;
        Ok(read)
    }

    // -- event list --------------------------------------------------------

    /// A new, unlinked event seeing the current abstract state.
    pub fn create_event(&mut self, kind: EventKind) -> EventId {
        self.events
            .push(EventData::new(kind, self.stack, self.locals, self.logical_ip));
        EventId(self.events.len() as u32 - 1)
    }

    /// Link `e` after the last event and after the current predecessor.
    pub fn append(&mut self, e: EventId) -> CompileResult<()> {
        let (first_event, entry_stack, entry_locals) = {
            let li = self.logical(self.logical_ip)?;
            (li.first_event, li.stack, li.locals)
        };
        // the first event of an instruction must see the instruction's entry state
        if first_event.is_none() && (self.stack != entry_stack || self.locals != entry_locals) {
            self.append_dummy()?;
        }
        self.link_event(e)
    }

    fn link_event(&mut self, e: EventId) -> CompileResult<()> {
        trace!(
            "append {} at {}",
            self.event(e).kind.name(),
            self.event(e).logical_ip
        );
        match self.last_event {
            Some(last) => self.event_mut(last).next = Some(e),
            None => self.first_event = Some(e),
        }
        self.last_event = Some(e);

        if let Some(p) = self.predecessor {
            let fork_state = self.fork_state;
            self.new_link(p, e, fork_state);
        }
        self.fork_state = None;
        self.predecessor = Some(e);

        let li = self.logical_mut(self.event(e).logical_ip)?;
        if li.first_event.is_none() {
            li.first_event = Some(e);
        }
        li.last_event = Some(e);
        Ok(())
    }

    pub fn new_link(
        &mut self,
        predecessor: EventId,
        successor: EventId,
        fork_state: Option<ForkStateId>,
    ) -> LinkId {
        self.links.push(Link {
            predecessor,
            successor,
            fork_state,
            junction_state: Vec::new(),
        });
        let link = LinkId(self.links.len() as u32 - 1);
        self.event_mut(successor).predecessors.push(link);
        self.event_mut(predecessor).successors.push(link);
        link
    }

    /// Append an empty event carrying the current instruction's entry state.
    pub fn append_dummy(&mut self) -> CompileResult<()> {
        let (stack, locals) = (self.stack, self.locals);
        let (entry_stack, entry_locals) = {
            let li = self.logical(self.logical_ip)?;
            (li.stack, li.locals)
        };
        self.stack = entry_stack;
        self.locals = entry_locals;
        let e = self.create_event(EventKind::Dummy);
        let result = self.link_event(e);
        self.stack = stack;
        self.locals = locals;
        result
    }

    /// Append a dummy if the current instruction has no event yet.
    pub fn ensure_event(&mut self) -> CompileResult<()> {
        if self.logical(self.logical_ip)?.last_event.is_none() {
            self.append_dummy()?;
        }
        Ok(())
    }

    /// Run `f` with the emitter, which may call back into this context for scratch registers.
    pub fn with_assembler<T>(
        &mut self,
        f: impl FnOnce(&mut dyn Assembler, &mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        let mut assembler = self
            .assembler
            .take()
            .ok_or_else(|| CompileError::invariant("emitter re-entered"))?;
        let result = f(assembler.as_mut(), self);
        self.assembler = Some(assembler);
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::context_fixture;

    #[test]
    fn test_frame_index_layout() {
        let _ = env_logger::builder().is_test(true).try_init();
        context_fixture(|ctx, _| {
            ctx.init(1, 2, 4, 2);
            assert_eq!(ctx.total_frame_size(), 6);
            // parameters sit above the header, locals below it
            assert_eq!(ctx.frame_index(0), 5);
            assert_eq!(ctx.frame_index(1), 4);
            assert_eq!(ctx.frame_index(2), 1);
            assert_eq!(ctx.frame_index(3), 0);
            assert_eq!(ctx.resources.frame_count(), 6);
        });
    }
}
