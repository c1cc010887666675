//! Per-event emission.
//!
//! By the time an event is compiled the driver has chosen a source site for each of its reads
//! (`ValueData::source`). Emission places results, issues the operation and then consumes the
//! event's reads, which may free the sites of values that died here.

use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::CodeTarget;
use crate::core::resource::ResourceId;
use crate::core::site::{Site, SiteId, SiteMask};
use crate::core::value::{ValueId, ValueType};
use crate::ir::context::{Context, HandledTrace};
use crate::ir::event::{
    BoundsCheckEvent, BranchEvent, CallEvent, CallFlags, CombineEvent, EventId, EventKind,
    MemoryEvent, MoveEvent, TranslateEvent,
};
use crate::regalloc::Accept;
use crate::target::{
    BinaryOperation, Constant, Operand, OperandMask, OperandType, TernaryOperation,
    UnaryOperation, WORD,
};
use log::trace;

impl<'a> Context<'a> {
    pub fn compile_event(&mut self, e: EventId) -> CompileResult<()> {
        let kind = self.event(e).kind.clone();
        match kind {
            EventKind::Call(call) => self.compile_call(e, call),
            EventKind::Return { .. } => self.compile_return(e),
            EventKind::Move(m) => self.compile_move(e, m),
            EventKind::Combine(c) => self.compile_combine(e, c),
            EventKind::Translate(t) => self.compile_translate(e, t),
            EventKind::Branch(b) => self.compile_branch(e, b),
            EventKind::Jump {
                op,
                address,
                clean_locals,
                ..
            } => self.compile_jump(e, op, address, clean_locals),
            EventKind::Memory(m) => self.compile_memory(e, m),
            EventKind::BoundsCheck(b) => self.compile_bounds_check(e, b),
            EventKind::Barrier(op) => self.apply0(op),
            EventKind::FrameSite { value, index } => {
                if self.is_live(value) {
                    let s = self.new_site(Site::frame(&self.geometry, index));
                    self.add_site(value, s)?;
                }
                Ok(())
            }
            EventKind::Buddy { original, buddy } => {
                self.add_buddy(original, buddy);
                self.pop_read(Some(e), original)
            }
            EventKind::SaveLocals => self.pop_all_reads(e),
            EventKind::Dummy => Ok(()),
        }
    }

    fn source_operand(&self, v: ValueId) -> CompileResult<Operand> {
        self.operand(self.source(v)?)
    }

    fn surrogate_register(&mut self, v: Option<ValueId>) -> CompileResult<Option<u8>> {
        let Some(v) = v else { return Ok(None) };
        let s = self.source(v)?;
        let register = self.site(s).register_number().ok_or_else(|| {
            CompileError::invariant(format!("tail-call surrogate {:?} is not in a register", v))
        })?;
        self.freeze_site(s);
        Ok(Some(register))
    }

    fn thaw_surrogate(&mut self, v: Option<ValueId>) -> CompileResult<()> {
        if let Some(v) = v {
            let s = self.source(v)?;
            self.thaw_site(s);
        }
        Ok(())
    }

    fn compile_call(&mut self, e: EventId, call: CallEvent) -> CompileResult<()> {
        let flags = call.flags;
        let aligned = flags.contains(CallFlags::ALIGNED);
        let long = flags.contains(CallFlags::LONG_JUMP_OR_CALL);
        let op = match (call.tail, long, aligned) {
            (true, true, true) => UnaryOperation::AlignedLongJump,
            (true, true, false) => UnaryOperation::LongJump,
            (true, false, true) => UnaryOperation::AlignedJump,
            (true, false, false) => UnaryOperation::Jump,
            (false, true, true) => UnaryOperation::AlignedLongCall,
            (false, true, false) => UnaryOperation::LongCall,
            (false, false, true) => UnaryOperation::AlignedCall,
            (false, false, false) => UnaryOperation::Call,
        };

        if call.tail {
            let return_address = self.surrogate_register(call.return_address_surrogate)?;
            let frame_pointer = self.surrogate_register(call.frame_pointer_surrogate)?;
            let offset = self.arch.argument_footprint(call.stack_argument_footprint) as i32
                - self.arch.argument_footprint(self.parameter_footprint) as i32;
            trace!("tail call pops the frame with offset {}", offset);
            self.with_assembler(|asm, ctx| {
                let footprint = ctx.aligned_frame_size;
                asm.pop_frame_for_tail_call(footprint, offset, return_address, frame_pointer, ctx)
            })?;
        }

        let address = self.source_operand(call.address)?;
        self.apply1(op, WORD, address)?;

        if let Some(trace) = call.trace {
            let promise = self.code_promise();
            self.bind(CodeTarget::Promise(promise))?;
            self.handled_traces.push(HandledTrace {
                trace,
                address: promise,
                argument_index: call.stack_argument_index,
            });
        }

        if call.tail {
            self.thaw_surrogate(call.return_address_surrogate)?;
            self.thaw_surrogate(call.frame_pointer_surrogate)?;
        } else if self.config.tail_calls {
            let footprint = self.arch.argument_footprint(call.stack_argument_footprint);
            let alignment = self.arch.stack_alignment_in_words();
            if footprint > alignment {
                self.with_assembler(|asm, _| asm.adjust_frame(footprint - alignment))?;
            }
        }

        let (stack, locals) = {
            let event = self.event(e);
            (event.stack_before, event.locals_before)
        };
        self.clean_event(e, stack, locals, call.pop_index)?;

        if call.result_size > 0 && self.is_live(call.result) {
            let s = self.new_site(Site::register(self.arch.return_low()));
            self.add_site(call.result, s)?;
        }
        Ok(())
    }

    fn compile_return(&mut self, e: EventId) -> CompileResult<()> {
        self.pop_all_reads(e)?;
        if !self.unreachable(e) {
            let arguments = self.arch.argument_footprint(self.parameter_footprint);
            self.with_assembler(|asm, ctx| {
                asm.pop_frame_and_pop_arguments_and_return(ctx.aligned_frame_size, arguments)
            })?;
        }
        Ok(())
    }

    fn compile_move(&mut self, e: EventId, m: MoveEvent) -> CompileResult<()> {
        let src = self.site(self.source(m.src)?);
        let dst_mask = SiteMask::from_operand(self.arch.plan_destination_binary(
            m.op,
            m.src_select_size,
            OperandMask::new(src.operand_type().bit(), src.register_mask()),
            m.dst_size,
        ));

        if m.src_select_size >= WORD && m.dst_size >= WORD && m.src_select_size >= m.dst_size {
            if self.value(m.dst).target.is_some() {
                self.move_into(BinaryOperation::Move, WORD, m.src, WORD, m.dst, dst_mask)?;
            } else if self.is_live(m.dst) {
                // a full-width copy is an alias: no code, just a buddy
                if let Some(read) = self.live(m.src) {
                    let found = self
                        .pick_source_site(read, None, None, false, true, Accept::Match)
                        .map(|(s, _)| s);
                    let volatile = found.map_or(true, |s| self.site(s).is_volatile(&self.geometry));
                    if volatile {
                        self.maybe_move(read, false, 0)?;
                    }
                }
                self.add_buddy(m.src, m.dst);
                let source = self.source(m.src)?;
                if self.site(source).is_volatile(&self.geometry) {
                    self.remove_site(m.src, source);
                }
            }
        } else {
            self.move_into(
                m.op,
                m.src_select_size,
                m.src,
                m.dst_size,
                m.dst,
                dst_mask,
            )?;
        }
        self.pop_all_reads(e)
    }

    /// Copy `src` into the destination its next read (or fixed target) wants, going through a
    /// temporary register when the destination cannot take the source directly.
    #[allow(clippy::too_many_arguments)]
    fn move_into(
        &mut self,
        op: BinaryOperation,
        src_select_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
        dst_mask: SiteMask,
    ) -> CompileResult<()> {
        let read = self.live(dst);
        let is_store = read.is_none();
        let target = match (self.value(dst).target, read) {
            (Some(t), _) => t,
            (None, None) => return Ok(()),
            (None, Some(read)) => self.pick_target_site(read, false, 0, None)?,
        };

        let source = self.source(src)?;
        let mut cost = self.site(source).copy_cost(Some(&self.site(target)));
        if src_select_size < dst_size {
            cost = 1;
        }

        if cost != 0 {
            let target_kind = self.site(target).operand_type();
            let source_kind = self.site(source).operand_type();
            let use_temporary = (target_kind == OperandType::Memory
                && source_kind == OperandType::Memory)
                || (src_select_size < dst_size && target_kind != OperandType::Register);

            self.freeze_site(source);
            let added = self.add_site(dst, target);
            self.thaw_site(source);
            added?;

            self.freeze_site(target);
            let result = if self.site(target).matches(&dst_mask, &self.geometry) && !use_temporary
            {
                self.freeze_site(source);
                let applied = self.apply2_sites(
                    op,
                    src_select_size.min(dst_size),
                    source,
                    dst_size,
                    target,
                );
                self.thaw_site(source);
                applied
            } else {
                self.move_through_temporary(
                    op,
                    src_select_size,
                    src,
                    source,
                    dst_size,
                    dst,
                    target,
                    dst_mask,
                    use_temporary || is_store,
                    is_store,
                )
            };
            self.thaw_site(target);
            result?;
        }

        if is_store {
            self.remove_site(dst, target);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn move_through_temporary(
        &mut self,
        op: BinaryOperation,
        src_select_size: u32,
        src: ValueId,
        source: SiteId,
        dst_size: u32,
        dst: ValueId,
        target: SiteId,
        dst_mask: SiteMask,
        copy_to_target: bool,
        is_store: bool,
    ) -> CompileResult<()> {
        self.remove_site(dst, target);

        let plan = self.arch.plan_source_binary(op, dst_size, dst_size);
        let mut src_registers = plan.a.register_mask;
        if self.value(src).value_type == ValueType::General {
            src_registers &= self.arch.general_register_mask();
        }
        let tmp = self.new_site(Site::free_register(dst_mask.register_mask & src_registers));
        trace!("move of {:?} staged through a temporary", src);

        self.freeze_site(source);
        let added = self.add_site(dst, tmp);
        if added.is_err() {
            self.thaw_site(source);
            return added;
        }
        self.freeze_site(tmp);
        let applied = self.apply2_sites(op, src_select_size, source, dst_size, tmp);
        self.thaw_site(tmp);
        self.thaw_site(source);
        applied?;

        if copy_to_target {
            self.add_site(dst, target)?;
            self.freeze_site(tmp);
            let applied = self.apply2_sites(BinaryOperation::Move, dst_size, tmp, dst_size, target);
            self.thaw_site(tmp);
            applied?;
            if is_store {
                self.remove_site(dst, tmp);
            }
        }
        Ok(())
    }

    /// Where the result of an operation on `value` goes: `value`'s own site when the result
    /// may overwrite it, otherwise a fresh target for `result`. The site is returned frozen.
    fn result_target(
        &mut self,
        value: ValueId,
        result: ValueId,
        mask: SiteMask,
    ) -> CompileResult<SiteId> {
        let next = self.live_next(value)?;
        let source = self.source(value)?;
        let site = self.site(source);
        let (owner, s) = if site.matches(&mask, &self.geometry)
            && (next.is_none() || site.lone_match(&mask, &self.geometry))
        {
            if let Some(next) = next {
                if self.unique_site(value, source) {
                    // the operand is still needed later; copy it out before it is overwritten
                    self.freeze_site(source);
                    let moved = self.maybe_move(next, false, 0);
                    self.thaw_site(source);
                    moved?;
                }
            }
            (value, source)
        } else {
            // the operand is read after the result is placed, so its site must stay put
            self.freeze_site(source);
            let read = self.reads.single(result, mask, Some(result));
            let placed = self
                .pick_target_site(read, true, 0, None)
                .and_then(|s| self.add_site(result, s).map(|_| s));
            self.thaw_site(source);
            (result, placed?)
        };
        self.remove_site(owner, s);
        self.freeze_site(s);
        Ok(s)
    }

    fn operand_mask(&self, v: ValueId) -> CompileResult<OperandMask> {
        let site = self.site(self.source(v)?);
        Ok(OperandMask::new(site.operand_type().bit(), site.register_mask()))
    }

    fn compile_combine(&mut self, e: EventId, c: CombineEvent) -> CompileResult<()> {
        let first = self.source(c.first)?;
        self.freeze_site(first);

        let clobbered = self.arch.clobbers_ternary(c.op, c.result_size);
        let second = self.source(c.second)?;
        self.freeze_site(second);
        let claimed = self.claim_registers(clobbered);
        self.thaw_site(second);
        let clobber_sites = match claimed {
            Ok(sites) => sites,
            Err(err) => {
                self.thaw_site(first);
                return Err(err);
            }
        };

        let mask = SiteMask::from_operand(self.arch.plan_destination_ternary(
            c.op,
            c.first_size,
            self.operand_mask(c.first)?,
            c.second_size,
            self.operand_mask(c.second)?,
            c.result_size,
        ));
        let low = match self.result_target(c.second, c.result, mask) {
            Ok(low) => low,
            Err(err) => {
                self.release_registers(clobber_sites);
                self.thaw_site(first);
                return Err(err);
            }
        };

        // placing the result may have moved either operand
        let a = self.source_operand(c.first)?;
        let b = self.source_operand(c.second)?;
        let target = self.operand(low)?;
        let applied = self.apply3(c.op, c.first_size, a, c.second_size, b, c.result_size, target);

        self.release_registers(clobber_sites);
        self.thaw_site(first);
        applied?;
        self.pop_all_reads(e)?;
        self.thaw_site(low);
        if self.is_live(c.result) {
            self.add_site(c.result, low)?;
        }
        Ok(())
    }

    /// Take and freeze every register in `mask` for the duration of one operation, moving
    /// whatever lives there elsewhere first.
    fn claim_registers(&mut self, mask: u64) -> CompileResult<Vec<SiteId>> {
        let mut claimed = Vec::new();
        for register in 0..self.arch.register_count() as u8 {
            if mask & (1 << register) == 0 {
                continue;
            }
            let id = ResourceId::Register(register);
            if self.resources.get(id).owner.is_some() {
                self.steal(id, None)?;
            }
            let s = self.new_site(Site::register(register));
            self.freeze_site(s);
            claimed.push(s);
        }
        Ok(claimed)
    }

    fn release_registers(&mut self, claimed: Vec<SiteId>) {
        for s in claimed {
            self.thaw_site(s);
        }
    }

    fn compile_translate(&mut self, e: EventId, t: TranslateEvent) -> CompileResult<()> {
        let mask = SiteMask::from_operand(self.arch.plan_destination_binary(
            t.op,
            t.value_size,
            self.operand_mask(t.value)?,
            t.result_size,
        ));
        let low = self.result_target(t.value, t.result, mask)?;
        let a = self.source_operand(t.value)?;
        let target = self.operand(low)?;
        self.apply2(t.op, t.value_size, a, t.result_size, target)?;
        self.pop_all_reads(e)?;
        self.thaw_site(low);
        if self.is_live(t.result) {
            self.add_site(t.result, low)?;
        }
        Ok(())
    }

    fn constant_value(&self, v: ValueId) -> Option<i64> {
        self.find_constant(v).and_then(|p| self.promises.value(p))
    }

    fn compile_branch(&mut self, e: EventId, b: BranchEvent) -> CompileResult<()> {
        if !self.unreachable(e) {
            let folded = match (self.constant_value(b.first), self.constant_value(b.second)) {
                (Some(first), Some(second)) => Some(b.op.should_jump(b.size, first, second)),
                _ => None,
            };
            match folded {
                Some(Some(true)) => {
                    let address = self.source_operand(b.address)?;
                    self.apply1(UnaryOperation::Jump, WORD, address)?;
                }
                Some(Some(false)) => trace!("branch at {:?} never taken", e),
                _ => {
                    let sites = [
                        self.source(b.first)?,
                        self.source(b.second)?,
                        self.source(b.address)?,
                    ];
                    for s in sites {
                        self.freeze_site(s);
                    }
                    let operands = (
                        self.operand(sites[0]),
                        self.operand(sites[1]),
                        self.operand(sites[2]),
                    );
                    let applied = match operands {
                        (Ok(a), Ok(c), Ok(target)) => {
                            self.apply3(b.op, b.size, a, b.size, c, WORD, target)
                        }
                        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => Err(err),
                    };
                    for s in sites {
                        self.thaw_site(s);
                    }
                    applied?;
                }
            }
        }
        self.pop_all_reads(e)
    }

    fn compile_jump(
        &mut self,
        e: EventId,
        op: UnaryOperation,
        address: ValueId,
        clean_locals: bool,
    ) -> CompileResult<()> {
        if !self.unreachable(e) {
            let address = self.source_operand(address)?;
            self.apply1(op, WORD, address)?;
        }
        self.pop_all_reads(e)?;
        if clean_locals {
            for v in self.frames.values(None, self.locals) {
                self.clean_value(v, 0);
            }
        }
        Ok(())
    }

    fn compile_memory(&mut self, e: EventId, m: MemoryEvent) -> CompileResult<()> {
        let mut displacement = m.displacement;
        let mut scale = m.scale;
        let mut index_register = None;
        if let Some(index) = m.index {
            match self.constant_value(index) {
                Some(value) => {
                    let offset = (value as i32).wrapping_mul(scale as i32);
                    displacement = displacement.wrapping_add(offset);
                    scale = 1;
                }
                None => {
                    let s = self.source(index)?;
                    index_register = Some(self.site(s).register_number().ok_or_else(|| {
                        CompileError::invariant(format!(
                            "memory index {:?} is not in a register",
                            index
                        ))
                    })?);
                }
            }
        }
        let base_site = self.source(m.base)?;
        let base = self.site(base_site).register_number().ok_or_else(|| {
            CompileError::invariant(format!("memory base {:?} is not in a register", m.base))
        })?;

        self.pop_read(Some(e), m.base)?;
        if let (Some(index), Some(register)) = (m.index, index_register) {
            // the index arrives as a 32-bit int; widen it in place
            self.apply2(
                BinaryOperation::Move,
                4,
                Operand::Register(register),
                WORD,
                Operand::Register(register),
            )?;
            self.pop_read(Some(e), index)?;
        } else if let Some(index) = m.index {
            self.pop_read(Some(e), index)?;
        }

        let site = self.new_site(Site::memory(base, displacement, index_register, scale));
        self.value_mut(m.result).target = Some(site);
        self.add_site(m.result, site)
    }

    fn compile_bounds_check(&mut self, e: EventId, b: BoundsCheckEvent) -> CompileResult<()> {
        let handler = Operand::immediate(b.handler);
        let constant = self.constant_value(b.index);

        if let Some(index) = constant.filter(|&i| i < 0) {
            trace!("bounds check with constant index {} always fails", index);
            self.apply1(UnaryOperation::Call, WORD, handler)?;
        } else {
            let out_of_bounds = match constant {
                Some(_) => None,
                None => {
                    let p = self.code_promise();
                    let index = self.source_operand(b.index)?;
                    self.apply3(
                        TernaryOperation::JumpIfLess,
                        4,
                        Operand::immediate(0),
                        4,
                        index,
                        WORD,
                        Operand::Constant(Constant::Label(CodeTarget::Promise(p))),
                    )?;
                    Some(p)
                }
            };

            let object = self.site(self.source(b.object)?);
            let base = object.register_number().ok_or_else(|| {
                CompileError::invariant(format!(
                    "bounds-checked object {:?} is not in a register",
                    b.object
                ))
            })?;
            let length = Operand::memory(base, b.length_offset as i32);
            let next = self.code_promise();

            let index_site = self.source(b.index)?;
            self.freeze_site(index_site);
            let index = self.operand(index_site);
            let applied = index.and_then(|index| {
                self.apply3(
                    TernaryOperation::JumpIfGreater,
                    4,
                    index,
                    4,
                    length,
                    WORD,
                    Operand::Constant(Constant::Label(CodeTarget::Promise(next))),
                )
            });
            self.thaw_site(index_site);
            applied?;

            if let Some(p) = out_of_bounds {
                self.bind(CodeTarget::Promise(p))?;
            }
            self.apply1(UnaryOperation::Call, WORD, handler)?;
            self.bind(CodeTarget::Promise(next))?;
        }

        self.pop_read(Some(e), b.object)?;
        self.pop_read(Some(e), b.index)
    }
}
