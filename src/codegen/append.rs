// Event construction. Every append_* function creates an event against the current abstract
// state, attaches the reads the operation will consume (with the location masks the
// architecture's planning queries allow) and links the event after the last one. Operations
// the architecture cannot encode inline are rewritten here, before any event exists, into a
// call to the runtime helper the client supplies; the rest of the pipeline never sees them.
//
// Calls carry most of the bookkeeping: register arguments are pinned to the calling
// convention's registers, stack arguments to the outgoing argument slots (or, for tail calls,
// to the caller's incoming slots), every other stack value and local must be in its home
// slot across the call, and the call records which slots survive it.

//! Appending events and the helper-call rewrite.

use crate::core::error::{CompileError, CompileResult};
use crate::core::site::{FrameSlot, Site, SiteMask};
use crate::core::value::{ValueId, ValueType};
use crate::frame_map::TraceId;
use crate::ir::context::Context;
use crate::ir::event::{
    BoundsCheckEvent, BranchEvent, CallEvent, CallFlags, CombineEvent, EventId, EventKind,
    MemoryEvent, MoveEvent, TranslateEvent,
};
use crate::target::{
    AnyOperation, BinaryOperation, Operation, OperandType, TernaryOperation, UnaryOperation,
    ANY_TYPE, WORD,
};
use log::{debug, trace};

impl<'a> Context<'a> {
    /// General registers only.
    pub fn general_register_mask(&self) -> SiteMask {
        SiteMask::new(
            OperandType::Register.bit(),
            self.arch.general_register_mask(),
            FrameSlot::None,
        )
    }

    /// General registers or a constant.
    pub fn general_register_or_constant_mask(&self) -> SiteMask {
        SiteMask::new(
            OperandType::Register.bit() | OperandType::Constant.bit(),
            self.arch.general_register_mask(),
            FrameSlot::None,
        )
    }

    fn with_call<T>(&mut self, e: EventId, f: impl FnOnce(&mut CallEvent) -> T) -> Option<T> {
        match &mut self.event_mut(e).kind {
            EventKind::Call(call) => Some(f(call)),
            _ => None,
        }
    }

    /// Append a call. `arguments` go to argument registers and then outgoing stack slots,
    /// first argument first; `stack_argument_footprint` words on top of the abstract stack
    /// are passed in place instead.
    #[allow(clippy::too_many_arguments)]
    pub fn append_call(
        &mut self,
        address: ValueId,
        flags: CallFlags,
        trace: Option<TraceId>,
        result: ValueId,
        result_size: u32,
        arguments: &[ValueId],
        stack_argument_footprint: u32,
    ) -> CompileResult<()> {
        if !arguments.is_empty()
            && (flags.contains(CallFlags::TAIL_JUMP) || stack_argument_footprint != 0)
        {
            return Err(CompileError::InvalidOperand {
                reason: "explicit call arguments cannot be combined with stack arguments"
                    .to_string(),
            });
        }
        let tail = self.config.tail_calls && flags.contains(CallFlags::TAIL_JUMP);
        let e = self.create_event(EventKind::Call(CallEvent {
            address,
            flags,
            trace,
            result,
            result_size,
            return_address_surrogate: None,
            frame_pointer_surrogate: None,
            pop_index: 0,
            stack_argument_index: 0,
            stack_argument_footprint,
            tail,
        }));

        let mut register_mask = self.arch.general_register_mask();
        let register_count = self.arch.argument_register_count();
        for (index, &argument) in arguments.iter().enumerate() {
            let index = index as u32;
            let mask = if index < register_count {
                let register = self.arch.argument_register(index);
                register_mask &= !(1 << register);
                trace!("argument {} of {:?} in register {}", index, e, register);
                SiteMask::fixed_register(register)
            } else {
                SiteMask::new(
                    OperandType::Memory.bit(),
                    0,
                    FrameSlot::Index(index - register_count),
                )
            };
            self.add_single_read(e, argument, mask, None)?;
        }

        let op = if flags.contains(CallFlags::ALIGNED) {
            UnaryOperation::AlignedCall
        } else {
            UnaryOperation::Call
        };
        let plan = self.arch.plan_unary(op, WORD);
        let address_mask = SiteMask::new(
            plan.mask.type_mask,
            plan.mask.register_mask & register_mask,
            FrameSlot::Any,
        );
        self.add_single_read(e, address, address_mask, None)?;

        let mut cursor = self.event(e).stack_before;
        if stack_argument_footprint > 0 {
            let mut slots = vec![None; stack_argument_footprint as usize];
            let mut i = slots.len();
            while i > 0 {
                i -= 1;
                let node = *self.frames.node(cursor.ok_or_else(|| {
                    CompileError::invariant(format!(
                        "call passes {} stack words on a shallower stack",
                        stack_argument_footprint
                    ))
                })?);
                cursor = node.next;
                let below = cursor.map(|s| *self.frames.node(s));
                // a two-word argument: the value sits on top of its empty high slot
                if i >= 1 && (node.value.is_none() || below.is_some_and(|b| b.value.is_none())) {
                    slots[i] = below.and_then(|b| b.value);
                    i -= 1;
                    cursor = below.and_then(|b| b.next);
                }
                slots[i] = node.value;
            }

            let (return_address_index, frame_pointer_index, frame_offset) = if tail {
                let base = self.frame_base() as i64;
                let frame_pointer = self
                    .config
                    .use_frame_pointer
                    .then(|| base + self.arch.frame_pointer_offset() as i64);
                (
                    Some(base + self.arch.return_address_offset() as i64),
                    frame_pointer,
                    self.total_frame_size() as i64
                        - self.arch.argument_footprint(stack_argument_footprint) as i64,
                )
            } else {
                (None, None, 0)
            };

            for (i, slot) in slots.into_iter().enumerate() {
                let Some(v) = slot else { continue };
                let frame_index = i as i64 + frame_offset;
                if Some(frame_index) == return_address_index {
                    self.with_call(e, |call| call.return_address_surrogate = Some(v));
                    let mask = self.general_register_mask();
                    self.add_single_read(e, v, mask, None)?;
                } else if Some(frame_index) == frame_pointer_index {
                    self.with_call(e, |call| call.frame_pointer_surrogate = Some(v));
                    let mask = self.general_register_mask();
                    self.add_single_read(e, v, mask, None)?;
                } else {
                    let index = u32::try_from(frame_index).map_err(|_| {
                        CompileError::invariant(format!(
                            "stack argument at frame index {}",
                            frame_index
                        ))
                    })?;
                    self.add_single_read(e, v, SiteMask::fixed_frame(index), None)?;
                }
            }
        }

        if !tail {
            let stack_before = self.event(e).stack_before;
            let depth = stack_before.map(|s| self.frames.node(s).index + 1).unwrap_or(0);
            let stack_argument_index = self.local_footprint + depth - stack_argument_footprint;
            let pop_index = (self.aligned_frame_size + self.parameter_footprint) as i64
                - self.arch.frame_footer_size() as i64
                - stack_argument_index as i64;
            let pop_index = u32::try_from(pop_index).map_err(|_| {
                CompileError::invariant(format!("negative pop index {} for {:?}", pop_index, e))
            })?;
            self.with_call(e, |call| {
                call.stack_argument_index = stack_argument_index;
                call.pop_index = pop_index;
            });

            // everything else on the stack lives in its home slot across the call
            while let Some(id) = cursor {
                let node = *self.frames.node(id);
                if let Some(v) = node.value {
                    let index = self.frame_index(node.index + self.local_footprint);
                    self.add_single_read(e, v, SiteMask::fixed_frame(index), None)?;
                }
                cursor = node.next;
            }
            self.add_save_locals_reads(e)?;
        }

        self.append(e)
    }

    fn add_save_locals_reads(&mut self, e: EventId) -> CompileResult<()> {
        let locals = self.event(e).locals_before;
        let values: Vec<(u32, ValueId)> = self
            .frames
            .locals(locals)
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i as u32, v)))
            .collect();
        for (index, v) in values {
            let slot = self.frame_index(index);
            self.add_single_read(e, v, SiteMask::fixed_frame(slot), None)?;
        }
        Ok(())
    }

    /// Rewrite an operation into a call to its runtime helper.
    fn append_helper_call(
        &mut self,
        op: AnyOperation,
        size: u32,
        result_size: u32,
        arguments: &[ValueId],
        result: ValueId,
    ) -> CompileResult<()> {
        let helpers = self.helpers.ok_or_else(|| CompileError::InvalidOperand {
            reason: format!("{} needs a runtime helper but none is configured", op),
        })?;
        let address = helpers.thunk(op, size, result_size);
        debug!("{} at ip {} calls helper {:#x}", op, self.logical_ip, address);
        self.session.record_thunk_call();
        let promise = self.promises.resolved(address);
        let callee = self.new_value_at(ValueType::General, Site::Constant(promise));
        self.append_call(
            callee,
            CallFlags::NONE,
            None,
            result,
            result_size,
            arguments,
            0,
        )
    }

    pub fn append_return(&mut self, size: u32, value: Option<ValueId>) -> CompileResult<()> {
        let e = self.create_event(EventKind::Return { size, value });
        if let Some(v) = value {
            let register = self.arch.return_low();
            self.add_single_read(e, v, SiteMask::fixed_register(register), None)?;
        }
        self.append(e)
    }

    pub fn append_move(
        &mut self,
        op: BinaryOperation,
        src_size: u32,
        src_select_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
    ) -> CompileResult<()> {
        let plan = self.arch.plan_source_binary(op, src_select_size, dst_size);
        if plan.thunk {
            return Err(CompileError::InvalidOperand {
                reason: format!("{:?} of {} bytes cannot be emitted inline", op, src_select_size),
            });
        }
        let e = self.create_event(EventKind::Move(MoveEvent {
            op,
            src_size,
            src_select_size,
            src,
            dst_size,
            dst,
        }));
        // a move that keeps every bit can leave the result where the source is
        let noop = src_select_size >= dst_size;
        self.add_single_read(e, src, SiteMask::from_operand(plan.a), noop.then_some(dst))?;
        self.append(e)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_combine(
        &mut self,
        op: TernaryOperation,
        first_size: u32,
        first: ValueId,
        second_size: u32,
        second: ValueId,
        result_size: u32,
        result: ValueId,
    ) -> CompileResult<()> {
        let plan = self
            .arch
            .plan_source_ternary(op, first_size, second_size, result_size);
        if plan.thunk {
            return self.append_helper_call(
                AnyOperation::Ternary(op),
                first_size,
                result_size,
                &[first, second],
                result,
            );
        }
        let e = self.create_event(EventKind::Combine(CombineEvent {
            op,
            first_size,
            first,
            second_size,
            second,
            result_size,
            result,
        }));
        let condensed = self.arch.always_condensed_ternary(op);
        self.add_single_read(e, first, SiteMask::from_operand(plan.a), None)?;
        self.add_single_read(
            e,
            second,
            SiteMask::from_operand(plan.b),
            condensed.then_some(result),
        )?;
        self.append(e)
    }

    pub fn append_translate(
        &mut self,
        op: BinaryOperation,
        value_size: u32,
        value: ValueId,
        result_size: u32,
        result: ValueId,
    ) -> CompileResult<()> {
        let plan = self.arch.plan_source_binary(op, value_size, result_size);
        if plan.thunk {
            return self.append_helper_call(
                AnyOperation::Binary(op),
                value_size,
                result_size,
                &[value],
                result,
            );
        }
        let e = self.create_event(EventKind::Translate(TranslateEvent {
            op,
            value_size,
            value,
            result_size,
            result,
        }));
        let condensed = self.arch.always_condensed_binary(op);
        self.add_single_read(
            e,
            value,
            SiteMask::from_operand(plan.a),
            condensed.then_some(result),
        )?;
        self.append(e)
    }

    pub fn append_branch(
        &mut self,
        op: TernaryOperation,
        size: u32,
        first: ValueId,
        second: ValueId,
        address: ValueId,
    ) -> CompileResult<()> {
        let plan = self.arch.plan_source_ternary(op, size, size, WORD);
        if plan.thunk {
            let compare = op.thunk_branch().ok_or_else(|| CompileError::InvalidOperand {
                reason: format!("{:?} has no integer form to branch on", op),
            })?;
            let result = self.new_value(ValueType::General);
            self.append_helper_call(AnyOperation::Ternary(op), size, 4, &[first, second], result)?;
            let zero = self.promises.resolved(0);
            let zero = self.new_value_at(ValueType::General, Site::Constant(zero));
            return self.append_branch(compare, 4, zero, result, address);
        }

        let e = self.create_event(EventKind::Branch(BranchEvent {
            op,
            size,
            first,
            second,
            address,
        }));
        self.add_single_read(e, first, SiteMask::from_operand(plan.a), None)?;
        self.add_single_read(e, second, SiteMask::from_operand(plan.b), None)?;
        let any = crate::target::OperandMask::any();
        let address_mask = self
            .arch
            .plan_destination_ternary(op, size, any, size, any, WORD);
        self.add_single_read(e, address, SiteMask::from_operand(address_mask), None)?;
        self.append(e)
    }

    pub fn append_jump(
        &mut self,
        op: UnaryOperation,
        address: ValueId,
        exit: bool,
        clean_locals: bool,
    ) -> CompileResult<()> {
        let plan = self.arch.plan_unary(op, WORD);
        if plan.thunk {
            return Err(CompileError::InvalidOperand {
                reason: format!("{:?} cannot be emitted inline", op),
            });
        }
        let e = self.create_event(EventKind::Jump {
            op,
            address,
            exit,
            clean_locals,
        });
        self.add_single_read(e, address, SiteMask::from_operand(plan.mask), None)?;
        self.append(e)
    }

    pub fn append_memory(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    ) -> CompileResult<()> {
        let e = self.create_event(EventKind::Memory(MemoryEvent {
            base,
            displacement,
            index,
            scale,
            result,
        }));
        let mask = self.general_register_mask();
        self.add_single_read(e, base, mask, None)?;
        if let Some(index) = index {
            let mask = self.general_register_or_constant_mask();
            self.add_single_read(e, index, mask, None)?;
        }
        self.append(e)
    }

    pub fn append_bounds_check(
        &mut self,
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    ) -> CompileResult<()> {
        let e = self.create_event(EventKind::BoundsCheck(BoundsCheckEvent {
            object,
            length_offset,
            index,
            handler,
        }));
        let mask = self.general_register_mask();
        self.add_single_read(e, object, mask, None)?;
        let mask = self.general_register_or_constant_mask();
        self.add_single_read(e, index, mask, None)?;
        self.append(e)
    }

    pub fn append_barrier(&mut self, op: Operation) -> CompileResult<()> {
        let e = self.create_event(EventKind::Barrier(op));
        self.append(e)
    }

    pub fn append_frame_site(&mut self, value: ValueId, index: u32) -> CompileResult<()> {
        let e = self.create_event(EventKind::FrameSite { value, index });
        self.append(e)
    }

    pub fn append_buddy(&mut self, original: ValueId, buddy: ValueId) -> CompileResult<()> {
        let e = self.create_event(EventKind::Buddy { original, buddy });
        let any = SiteMask::new(ANY_TYPE, u64::MAX, FrameSlot::Any);
        self.add_single_read(e, original, any, Some(buddy))?;
        self.append(e)
    }

    /// Force every local into its home slot.
    pub fn append_save_locals(&mut self) -> CompileResult<()> {
        let e = self.create_event(EventKind::SaveLocals);
        self.add_save_locals_reads(e)?;
        self.append(e)
    }
}
