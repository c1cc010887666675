// The façade the bytecode front end drives. It owns one Context and one frame-map log per
// method and translates each front-end call into abstract stack and locals updates plus
// appended events. Control flow is described with logical instruction boundaries: starting an
// instruction records its entry state, visiting an already-started instruction links the
// current event to it, and fork states let the front end return to a branch point and
// continue down another successor. Subroutines reuse the fork machinery: the state at the
// return jump is saved and restored at every call site's continuation.
//
// Two-word values on this 64-bit core occupy two slots with the high slot left empty: on the
// operand stack the empty slot sits below the value, among the locals the value lives at the
// higher index.
//
// Once emission is done, `finish` runs the two-phase resolution: the emitter lays out the
// code, every promise is resolved against the final base address, absolute words are patched
// in, the constant pool is appended and the frame maps are solved into their table.

//! The compiler façade.

use crate::core::config::CompilerConfig;
use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::{CodeLayout, PromiseId, PromiseKind};
use crate::core::session::CompilationSession;
use crate::core::site::Site;
use crate::core::value::{ValueId, ValueType};
use crate::frame_map::{FrameMapLog, FrameMapTable, TraceId};
use crate::ir::context::Context;
use crate::ir::event::{CallFlags, ForkState, ForkStateId, LogicalInstruction, SubroutineId};
use crate::ir::stack::StackNode;
use crate::target::{
    Architecture, Assembler, BinaryOperation, Operation, RuntimeHelpers, TernaryOperation,
    UnaryOperation, WORD,
};
use log::{debug, trace};

/// Machine code, constant pool and root maps of one method.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    /// Code followed by the word-aligned constant pool.
    pub code: Vec<u8>,
    pub code_size: usize,
    pub pool_offset: usize,
    pub base: i64,
    pub frame_maps: FrameMapTable,
}

impl CompiledMethod {
    pub fn instructions(&self) -> &[u8] {
        &self.code[..self.code_size]
    }

    pub fn pool(&self) -> &[u8] {
        &self.code[self.pool_offset..]
    }
}

pub struct Compiler<'a> {
    ctx: Context<'a>,
    frame_maps: FrameMapLog,
}

macro_rules! combine {
    ($(#[$doc:meta])* $name:ident, $op:ident) => {
        $(#[$doc])*
        pub fn $name(&mut self, size: u32, a: ValueId, b: ValueId) -> CompileResult<ValueId> {
            let value_type = self.ctx.value(a).value_type;
            self.combine(TernaryOperation::$op, size, a, size, b, size, value_type)
        }
    };
}

macro_rules! float_combine {
    ($name:ident, $op:ident) => {
        pub fn $name(&mut self, size: u32, a: ValueId, b: ValueId) -> CompileResult<ValueId> {
            self.combine(TernaryOperation::$op, size, a, size, b, size, ValueType::Float)
        }
    };
}

macro_rules! shift {
    ($name:ident, $op:ident) => {
        /// Shift `b` by the count in `a`.
        pub fn $name(&mut self, size: u32, a: ValueId, b: ValueId) -> CompileResult<ValueId> {
            let value_type = self.ctx.value(b).value_type;
            self.combine(TernaryOperation::$op, WORD, a, size, b, size, value_type)
        }
    };
}

macro_rules! translate {
    ($name:ident, $op:ident) => {
        pub fn $name(&mut self, size: u32, a: ValueId) -> CompileResult<ValueId> {
            let value_type = self.ctx.value(a).value_type;
            self.translate(BinaryOperation::$op, size, a, size, value_type)
        }
    };
}

macro_rules! branch {
    ($($name:ident => $op:ident,)*) => {
        $(
            pub fn $name(
                &mut self,
                size: u32,
                a: ValueId,
                b: ValueId,
                address: ValueId,
            ) -> CompileResult<()> {
                self.ctx.append_branch(TernaryOperation::$op, size, a, b, address)
            }
        )*
    };
}

impl<'a> Compiler<'a> {
    pub fn new(
        arch: &'a dyn Architecture,
        assembler: Box<dyn Assembler + 'a>,
        config: CompilerConfig,
        session: &'a CompilationSession<'a>,
    ) -> Self {
        Self {
            ctx: Context::new(arch, assembler, config, session),
            frame_maps: FrameMapLog::new(0, 0),
        }
    }

    /// Route operations the target cannot encode to `helpers`.
    pub fn with_helpers(mut self, helpers: &'a dyn RuntimeHelpers) -> Self {
        self.ctx.helpers = Some(helpers);
        self
    }

    pub fn context(&self) -> &Context<'a> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context<'a> {
        &mut self.ctx
    }

    pub fn frame_maps(&self) -> &FrameMapLog {
        &self.frame_maps
    }

    /// The root log the front end records marks, clears, handlers and subroutines in.
    pub fn frame_maps_mut(&mut self) -> &mut FrameMapLog {
        &mut self.frame_maps
    }

    pub fn init(
        &mut self,
        code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        aligned_frame_size: u32,
    ) {
        self.ctx.init(
            code_length,
            parameter_footprint,
            local_footprint,
            aligned_frame_size,
        );
        self.frame_maps = FrameMapLog::new(code_length, local_footprint);
    }

    /// Size root maps for `max_stack` operand slots above the locals. Call right after
    /// [`Self::init`], before the first instruction starts.
    pub fn init_frame_maps(&mut self, max_stack: u32) {
        self.frame_maps = FrameMapLog::new(
            self.ctx.logical_code_length,
            self.ctx.local_footprint + max_stack,
        );
    }

    // -- instruction boundaries ----------------------------------------------

    fn record_successor_state(&mut self) {
        if let Some(p) = self.ctx.predecessor {
            let (stack, locals) = (self.ctx.stack, self.ctx.locals);
            let event = self.ctx.event_mut(p);
            event.stack_after = stack;
            event.locals_after = Some(locals);
        }
    }

    /// Continue into instruction `ip`, which has already been compiled.
    pub fn visit_logical_ip(&mut self, ip: u32) -> CompileResult<()> {
        self.ctx.ensure_event()?;
        let (target, subroutine) = {
            let li = self.ctx.logical(ip as i32)?;
            (li.first_event, li.subroutine)
        };
        let target = target.ok_or_else(|| {
            CompileError::invariant(format!("instruction {} has no events to link to", ip))
        })?;

        if let Some(p) = self.ctx.predecessor {
            self.record_successor_state();
            let fork_state = self.ctx.fork_state;
            let link = self.ctx.new_link(p, target, fork_state);
            let last = self.ctx.last_event.ok_or_else(|| CompileError::invariant("no last event"))?;
            self.ctx.event_mut(last).visit_links.push(link);
            trace!("link {:?} -> {:?} at ip {}", p, target, ip);
            self.ctx.populate_junction_reads(link)?;
        }

        if let Some(current) = self.ctx.subroutine.take() {
            let inherited = subroutine.and_then(|s| self.ctx.subroutines[s.0 as usize].fork_state);
            self.ctx.subroutines[current.0 as usize].fork_state = inherited;
        }
        self.ctx.fork_state = None;
        self.frame_maps.visit(ip)?;
        Ok(())
    }

    /// Begin instruction `ip`; it sees the current stack and locals on entry.
    pub fn start_logical_ip(&mut self, ip: u32) -> CompileResult<()> {
        if ip >= self.ctx.logical_code_length {
            return Err(CompileError::invariant(format!(
                "instruction {} outside the method",
                ip
            )));
        }
        if self.ctx.is_started(ip) {
            return Err(CompileError::invariant(format!("instruction {} started twice", ip)));
        }
        self.ctx.ensure_event()?;
        self.record_successor_state();

        let mut instruction = LogicalInstruction::new(ip as i32, self.ctx.stack, self.ctx.locals);
        let subroutine = self.ctx.subroutine.take();
        instruction.subroutine = subroutine;
        self.ctx.logical_code[ip as usize + 1] = Some(instruction);
        self.ctx.logical_ip = ip as i32;

        if subroutine.is_some() {
            // other call sites may have initialized more locals than this one
            self.ctx.locals = self.ctx.frames.copy_locals(self.ctx.locals);
            for index in 0..self.ctx.local_footprint {
                if self.ctx.frames.locals(self.ctx.locals)[index as usize].is_none() {
                    self.init_local(1, index, ValueType::General)?;
                }
            }
        }
        self.frame_maps.visit(ip)?;
        Ok(())
    }

    /// Promise for the machine address instruction `ip` starts at.
    pub fn machine_ip(&mut self, ip: u32) -> PromiseId {
        self.ctx.promises.create(PromiseKind::MachineIp(ip))
    }

    // -- fork states -----------------------------------------------------------

    fn capture_state(&mut self) -> CompileResult<ForkStateId> {
        self.ctx.ensure_event()?;
        let saved = std::mem::take(&mut self.ctx.saved);
        let mut state = ForkState {
            stack: self.ctx.stack,
            locals: self.ctx.locals,
            saved: saved.clone(),
            predecessor: self.ctx.predecessor,
            logical_ip: self.ctx.logical_ip,
            elements: Vec::new(),
        };

        if state.predecessor.is_some() {
            let mut values: Vec<ValueId> = self
                .ctx
                .frame_elements(state.stack, state.locals, false)
                .into_iter()
                .filter_map(|e| e.value)
                .collect();
            values.extend(saved);
            for v in values {
                let read = self.ctx.reads.multi(v);
                self.ctx.add_read(None, v, read)?;
                state.elements.push((v, read));
            }
        }

        let has_predecessor = state.predecessor.is_some();
        self.ctx.fork_states.push(state);
        let id = ForkStateId(self.ctx.fork_states.len() as u32 - 1);
        if has_predecessor {
            self.ctx.fork_state = Some(id);
        }
        Ok(id)
    }

    /// Snapshot the abstract state at a branch point. Every live value gets a fan-out read
    /// so each successor can pick its own location.
    pub fn save_state(&mut self) -> CompileResult<ForkStateId> {
        let state = self.capture_state()?;
        self.restore_state(state)?;
        Ok(state)
    }

    /// Return to a branch point saved with [`Self::save_state`].
    pub fn restore_state(&mut self, state: ForkStateId) -> CompileResult<()> {
        self.ctx.ensure_event()?;
        let (stack, locals, predecessor, logical_ip) = {
            let s = self.ctx.fork_state(state);
            (s.stack, s.locals, s.predecessor, s.logical_ip)
        };
        self.ctx.stack = stack;
        self.ctx.locals = locals;
        self.ctx.predecessor = predecessor;
        self.ctx.logical_ip = logical_ip;

        if predecessor.is_some() {
            self.ctx.fork_state = Some(state);
            let elements = self.ctx.fork_state(state).elements.clone();
            for (v, read) in elements {
                self.ctx.value_mut(v).last_read = Some(read);
                self.ctx.reads.allocate_target(read);
            }
        }
        Ok(())
    }

    // -- subroutines -----------------------------------------------------------

    /// The next started instruction is a subroutine entry.
    pub fn start_subroutine(&mut self) -> SubroutineId {
        let id = self.ctx.new_subroutine();
        self.ctx.subroutine = Some(id);
        id
    }

    /// Leave the subroutine through the return address held in `address`.
    pub fn return_from_subroutine(
        &mut self,
        subroutine: SubroutineId,
        address: ValueId,
    ) -> CompileResult<()> {
        self.ctx.append_save_locals()?;
        self.ctx
            .append_jump(UnaryOperation::Jump, address, false, true)?;
        let state = self.capture_state()?;
        self.ctx.subroutines[subroutine.0 as usize].fork_state = Some(state);
        Ok(())
    }

    /// Continue after a call to `subroutine` with the state at its return.
    pub fn link_subroutine(&mut self, subroutine: SubroutineId) -> CompileResult<()> {
        let state = self.ctx.subroutines[subroutine.0 as usize]
            .fork_state
            .ok_or_else(|| CompileError::invariant("subroutine linked before it returned"))?;
        self.restore_state(state)
    }

    // -- constant pool ---------------------------------------------------------

    pub fn pool_append(&mut self, value: i64) -> PromiseId {
        let value = self.ctx.promises.resolved(value);
        self.pool_append_promise(value)
    }

    /// Add a pool word holding `value`; returns the promise of the word's address.
    pub fn pool_append_promise(&mut self, value: PromiseId) -> PromiseId {
        let slot = self.ctx.constant_pool.len() as u32;
        self.ctx.constant_pool.push(value);
        self.ctx.promises.create(PromiseKind::Pool(slot))
    }

    pub fn pool_size(&self) -> u32 {
        self.ctx.constant_pool.len() as u32 * WORD
    }

    // -- operands --------------------------------------------------------------

    pub fn constant(&mut self, value: i64, value_type: ValueType) -> ValueId {
        let promise = self.ctx.promises.resolved(value);
        self.promise_constant(promise, value_type)
    }

    pub fn promise_constant(&mut self, value: PromiseId, value_type: ValueType) -> ValueId {
        self.ctx.new_value_at(value_type, Site::Constant(value))
    }

    pub fn address(&mut self, address: PromiseId) -> ValueId {
        self.ctx.new_value_at(ValueType::General, Site::Address(address))
    }

    /// The word at `[base + displacement + index * scale]`.
    pub fn memory(
        &mut self,
        base: ValueId,
        value_type: ValueType,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
    ) -> CompileResult<ValueId> {
        let result = self.ctx.new_value(value_type);
        self.ctx
            .append_memory(base, displacement, index, scale, result)?;
        Ok(result)
    }

    /// The current contents of register `number`.
    pub fn register(&mut self, number: u8) -> ValueId {
        let value_type = if self.ctx.arch.float_register_mask() & (1 << number) != 0 {
            ValueType::Float
        } else {
            ValueType::General
        };
        self.ctx.new_value_at(value_type, Site::register(number))
    }

    // -- operand stack ---------------------------------------------------------

    fn top(&self) -> CompileResult<StackNode> {
        self.ctx
            .stack
            .map(|s| *self.ctx.frames.node(s))
            .ok_or_else(|| CompileError::invariant("operand stack is empty"))
    }

    fn maybe_buddy(&mut self, v: ValueId) -> CompileResult<ValueId> {
        if self.ctx.value(v).home.is_none() {
            return Ok(v);
        }
        let value_type = self.ctx.value(v).value_type;
        let buddy = self.ctx.new_value(value_type);
        self.ctx.append_buddy(v, buddy)?;
        Ok(buddy)
    }

    fn push_word(&mut self, v: Option<ValueId>) -> CompileResult<Option<ValueId>> {
        let v = match v {
            Some(v) => Some(self.maybe_buddy(v)?),
            None => None,
        };
        let s = self.ctx.frames.push(v, self.ctx.stack);
        if let Some(v) = v {
            let index = self.ctx.frames.node(s).index + self.ctx.local_footprint;
            self.ctx.value_mut(v).home = Some(self.ctx.frame_index(index));
        }
        self.ctx.stack = Some(s);
        Ok(v)
    }

    fn pop_word(&mut self) -> CompileResult<StackNode> {
        let top = self.top()?;
        if let Some(v) = top.value {
            if self.ctx.value(v).home.is_none() {
                return Err(CompileError::invariant(format!("{:?} popped without a home", v)));
            }
        }
        self.ctx.stack = top.next;
        Ok(top)
    }

    /// Push a fresh slot the front end fills through memory.
    pub fn push_slot(&mut self, value_type: ValueType) -> ValueId {
        let v = self.ctx.new_value(value_type);
        let s = self.ctx.frames.push(Some(v), self.ctx.stack);
        let index = self.ctx.frames.node(s).index + self.ctx.local_footprint;
        self.ctx.value_mut(v).home = Some(self.ctx.frame_index(index));
        self.ctx.stack = Some(s);
        v
    }

    /// Push `v` occupying `footprint` slots (1 or 2).
    pub fn push(&mut self, footprint: u32, v: ValueId) -> CompileResult<()> {
        match footprint {
            1 => {}
            2 => {
                self.push_word(None)?;
            }
            _ => {
                return Err(CompileError::InvalidOperand {
                    reason: format!("footprint {} is not one or two words", footprint),
                })
            }
        }
        self.push_word(Some(v))?;
        Ok(())
    }

    /// Keep `v` alive across the next saved state without putting it on the stack.
    pub fn save(&mut self, v: ValueId) {
        self.ctx.saved.push(v);
    }

    pub fn pop(&mut self, footprint: u32) -> CompileResult<ValueId> {
        let top = self.top()?;
        for _ in 0..footprint.max(1) {
            self.pop_word()?;
        }
        top.value
            .ok_or_else(|| CompileError::invariant("popped an empty stack slot"))
    }

    /// A value a stack call left on the operand stack.
    pub fn pushed(&mut self) -> CompileResult<ValueId> {
        let v = self.ctx.new_value(ValueType::General);
        let index = self.ctx.stack.map_or(0, |s| self.ctx.frames.node(s).index + 1);
        let home = self.ctx.frame_index(index + self.ctx.local_footprint);
        self.ctx.append_frame_site(v, home)?;
        let s = self.ctx.frames.push(Some(v), self.ctx.stack);
        self.ctx.value_mut(v).home = Some(home);
        self.ctx.stack = Some(s);
        Ok(v)
    }

    /// Drop `footprint` slots a stack call consumed.
    pub fn popped(&mut self, footprint: u32) -> CompileResult<()> {
        for _ in 0..footprint {
            self.pop_word()?;
        }
        Ok(())
    }

    pub fn top_of_stack(&self) -> Option<u32> {
        self.ctx.stack.map(|s| self.ctx.frames.node(s).index)
    }

    /// The value `index` slots below the top.
    pub fn peek(&self, _footprint: u32, index: u32) -> CompileResult<ValueId> {
        let mut cursor = self.ctx.stack;
        for _ in 0..index {
            cursor = cursor.and_then(|s| self.ctx.frames.node(s).next);
        }
        cursor
            .and_then(|s| self.ctx.frames.node(s).value)
            .ok_or_else(|| CompileError::invariant(format!("no value {} slots down", index)))
    }

    // -- calls -----------------------------------------------------------------

    /// Call `address` with `arguments` placed per the calling convention.
    #[allow(clippy::too_many_arguments)]
    pub fn call(
        &mut self,
        address: ValueId,
        flags: CallFlags,
        trace: Option<TraceId>,
        result_size: u32,
        result_type: ValueType,
        arguments: &[ValueId],
    ) -> CompileResult<ValueId> {
        let result = self.ctx.new_value(result_type);
        self.ctx
            .append_call(address, flags, trace, result, result_size, arguments, 0)?;
        Ok(result)
    }

    /// Call `address` with the top `argument_footprint` stack words as arguments.
    pub fn stack_call(
        &mut self,
        address: ValueId,
        flags: CallFlags,
        trace: Option<TraceId>,
        result_size: u32,
        result_type: ValueType,
        argument_footprint: u32,
    ) -> CompileResult<ValueId> {
        let result = self.ctx.new_value(result_type);
        self.ctx.append_call(
            address,
            flags,
            trace,
            result,
            result_size,
            &[],
            argument_footprint,
        )?;
        Ok(result)
    }

    pub fn return_(&mut self, size: u32, value: Option<ValueId>) -> CompileResult<()> {
        self.ctx.append_return(size, value)
    }

    // -- locals ----------------------------------------------------------------

    fn local_slot(&self, footprint: u32, index: u32) -> CompileResult<u32> {
        if index + footprint > self.ctx.local_footprint {
            return Err(CompileError::InvalidOperand {
                reason: format!("local {} out of {} slots", index, self.ctx.local_footprint),
            });
        }
        Ok(if footprint > 1 { index + 1 } else { index })
    }

    /// Declare local `index` initialized by the caller, e.g. a parameter.
    pub fn init_local(
        &mut self,
        footprint: u32,
        index: u32,
        value_type: ValueType,
    ) -> CompileResult<ValueId> {
        let slot = self.local_slot(footprint, index)?;
        let v = self.ctx.new_value(value_type);
        let home = self.ctx.frame_index(slot);
        self.ctx.append_frame_site(v, home)?;
        self.ctx.frames.set_local(self.ctx.locals, slot, Some(v));
        self.ctx.value_mut(v).home = Some(home);
        Ok(v)
    }

    /// Fresh values for every local live on entry to instruction `ip`, as at a handler entry.
    pub fn init_locals_from_logical_ip(&mut self, ip: u32) -> CompileResult<()> {
        self.ctx.locals = self
            .ctx
            .frames
            .new_locals(vec![None; self.ctx.local_footprint as usize]);
        let first = self.ctx.logical(ip as i32)?.first_event.ok_or_else(|| {
            CompileError::invariant(format!("instruction {} has no events", ip))
        })?;
        let entry = self.ctx.event(first).locals_before;
        let live: Vec<(u32, ValueType)> = self
            .ctx
            .frames
            .locals(entry)
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i as u32, self.ctx.value(v).value_type)))
            .collect();
        for (index, value_type) in live {
            self.init_local(1, index, value_type)?;
        }
        Ok(())
    }

    pub fn store_local(&mut self, footprint: u32, v: ValueId, index: u32) -> CompileResult<()> {
        let slot = self.local_slot(footprint, index)?;
        self.ctx.locals = self.ctx.frames.copy_locals(self.ctx.locals);
        if footprint > 1 {
            self.ctx.frames.set_local(self.ctx.locals, index, None);
        }
        let v = self.maybe_buddy(v)?;
        self.ctx.frames.set_local(self.ctx.locals, slot, Some(v));
        self.ctx.value_mut(v).home = Some(self.ctx.frame_index(slot));
        Ok(())
    }

    pub fn load_local(&self, footprint: u32, index: u32) -> CompileResult<ValueId> {
        let slot = self.local_slot(footprint, index)?;
        self.ctx.frames.locals(self.ctx.locals)[slot as usize].ok_or_else(|| {
            CompileError::invariant(format!("local {} read before it is set", index))
        })
    }

    pub fn save_locals(&mut self) -> CompileResult<()> {
        self.ctx.append_save_locals()
    }

    // -- memory ------------------------------------------------------------------

    /// Call `handler` unless `0 <= index < [object + length_offset]`.
    pub fn check_bounds(
        &mut self,
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    ) -> CompileResult<()> {
        self.ctx
            .append_bounds_check(object, length_offset, index, handler)
    }

    pub fn store(
        &mut self,
        src_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
    ) -> CompileResult<()> {
        self.ctx
            .append_move(BinaryOperation::Move, src_size, src_size, src, dst_size, dst)
    }

    fn load_with(
        &mut self,
        op: BinaryOperation,
        src_size: u32,
        src_select_size: u32,
        src: ValueId,
        dst_size: u32,
    ) -> CompileResult<ValueId> {
        let value_type = self.ctx.value(src).value_type;
        let dst = self.ctx.new_value(value_type);
        self.ctx
            .append_move(op, src_size, src_select_size, src, dst_size, dst)?;
        Ok(dst)
    }

    /// Sign-extending load of the low `src_select_size` bytes of `src`.
    pub fn load(
        &mut self,
        src_size: u32,
        src_select_size: u32,
        src: ValueId,
        dst_size: u32,
    ) -> CompileResult<ValueId> {
        self.load_with(BinaryOperation::Move, src_size, src_select_size, src, dst_size)
    }

    /// Zero-extending load.
    pub fn loadz(
        &mut self,
        src_size: u32,
        src_select_size: u32,
        src: ValueId,
        dst_size: u32,
    ) -> CompileResult<ValueId> {
        self.load_with(BinaryOperation::MoveZ, src_size, src_select_size, src, dst_size)
    }

    // -- control flow ----------------------------------------------------------

    branch! {
        jump_if_less => JumpIfLess,
        jump_if_greater => JumpIfGreater,
        jump_if_less_or_equal => JumpIfLessOrEqual,
        jump_if_greater_or_equal => JumpIfGreaterOrEqual,
        jump_if_equal => JumpIfEqual,
        jump_if_not_equal => JumpIfNotEqual,
        jump_if_float_equal => JumpIfFloatEqual,
        jump_if_float_not_equal => JumpIfFloatNotEqual,
        jump_if_float_less => JumpIfFloatLess,
        jump_if_float_greater => JumpIfFloatGreater,
        jump_if_float_less_or_equal => JumpIfFloatLessOrEqual,
        jump_if_float_greater_or_equal => JumpIfFloatGreaterOrEqual,
        jump_if_float_less_or_unordered => JumpIfFloatLessOrUnordered,
        jump_if_float_greater_or_unordered => JumpIfFloatGreaterOrUnordered,
        jump_if_float_less_or_equal_or_unordered => JumpIfFloatLessOrEqualOrUnordered,
        jump_if_float_greater_or_equal_or_unordered => JumpIfFloatGreaterOrEqualOrUnordered,
    }

    pub fn jmp(&mut self, address: ValueId) -> CompileResult<()> {
        self.ctx
            .append_jump(UnaryOperation::Jump, address, false, false)
    }

    /// Jump that leaves the method; nothing after it is reachable by fall-through.
    pub fn exit(&mut self, address: ValueId) -> CompileResult<()> {
        self.ctx
            .append_jump(UnaryOperation::Jump, address, true, false)
    }

    // -- arithmetic ------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn combine(
        &mut self,
        op: TernaryOperation,
        a_size: u32,
        a: ValueId,
        b_size: u32,
        b: ValueId,
        result_size: u32,
        result_type: ValueType,
    ) -> CompileResult<ValueId> {
        let result = self.ctx.new_value(result_type);
        self.ctx
            .append_combine(op, a_size, a, b_size, b, result_size, result)?;
        Ok(result)
    }

    fn translate(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: ValueId,
        result_size: u32,
        result_type: ValueType,
    ) -> CompileResult<ValueId> {
        let result = self.ctx.new_value(result_type);
        self.ctx
            .append_translate(op, a_size, a, result_size, result)?;
        Ok(result)
    }

    combine!(add, Add);
    combine!(
        /// `b - a`.
        sub,
        Subtract
    );
    combine!(mul, Multiply);
    combine!(
        /// `b / a`.
        div,
        Divide
    );
    combine!(rem, Remainder);
    combine!(and, And);
    combine!(or, Or);
    combine!(xor, Xor);
    float_combine!(fadd, FloatAdd);
    float_combine!(fsub, FloatSubtract);
    float_combine!(fmul, FloatMultiply);
    float_combine!(fdiv, FloatDivide);
    float_combine!(frem, FloatRemainder);
    shift!(shl, ShiftLeft);
    shift!(shr, ShiftRight);
    shift!(ushr, UnsignedShiftRight);

    translate!(neg, Negate);
    translate!(fneg, FloatNegate);
    translate!(abs, Absolute);
    translate!(fabs, FloatAbsolute);
    translate!(fsqrt, FloatSquareRoot);

    pub fn f2f(&mut self, a_size: u32, result_size: u32, a: ValueId) -> CompileResult<ValueId> {
        self.translate(BinaryOperation::Float2Float, a_size, a, result_size, ValueType::Float)
    }

    pub fn f2i(&mut self, a_size: u32, result_size: u32, a: ValueId) -> CompileResult<ValueId> {
        self.translate(BinaryOperation::Float2Int, a_size, a, result_size, ValueType::General)
    }

    pub fn i2f(&mut self, a_size: u32, result_size: u32, a: ValueId) -> CompileResult<ValueId> {
        self.translate(BinaryOperation::Int2Float, a_size, a, result_size, ValueType::Float)
    }

    // -- barriers --------------------------------------------------------------

    pub fn load_barrier(&mut self) -> CompileResult<()> {
        self.ctx.append_barrier(Operation::LoadBarrier)
    }

    pub fn store_store_barrier(&mut self) -> CompileResult<()> {
        self.ctx.append_barrier(Operation::StoreStoreBarrier)
    }

    pub fn store_load_barrier(&mut self) -> CompileResult<()> {
        self.ctx.append_barrier(Operation::StoreLoadBarrier)
    }

    // -- emission ----------------------------------------------------------------

    /// Allocate and emit every appended event.
    pub fn compile(
        &mut self,
        stack_overflow_handler: Option<i64>,
        stack_limit_offset: u32,
    ) -> CompileResult<()> {
        self.ctx.compile(stack_overflow_handler, stack_limit_offset)
    }

    /// Lay the code out at `base`, resolve and patch every promise, append the constant pool
    /// and solve the frame maps.
    pub fn finish(mut self, base: i64) -> CompileResult<CompiledMethod> {
        let machine = self.ctx.with_assembler(|asm, _| asm.finish())?;
        let layout = CodeLayout {
            base,
            code_size: machine.bytes.len(),
            targets: machine.targets,
        };
        self.ctx.promises.resolve_all(&layout)?;

        let code_size = layout.code_size;
        let pool_offset = layout.pool_offset();
        let mut code = machine.bytes;
        code.resize(pool_offset + self.pool_size() as usize, 0);

        for patch in &machine.patches {
            let value = self.resolved(patch.promise)?;
            let at = patch.offset as usize;
            let word = code.get_mut(at..at + 8).ok_or_else(|| {
                CompileError::invariant(format!("patch at {} outside the code", at))
            })?;
            word.copy_from_slice(&value.to_le_bytes());
        }
        for (slot, &promise) in self.ctx.constant_pool.iter().enumerate() {
            let value = self.resolved(promise)?;
            let at = pool_offset + slot * WORD as usize;
            code[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }

        for handled in &self.ctx.handled_traces {
            self.frame_maps
                .handle_trace(handled.trace, handled.address, handled.argument_index);
        }
        let passes = self.frame_maps.solve(&self.ctx.config)?;
        self.ctx.session.record_frame_map_passes(passes);
        let frame_maps = self.frame_maps.build_table(&self.ctx.promises, base)?;

        debug!(
            "finished method at {:#x}: {} code bytes, {} pool words, {} patches, {} frame maps",
            base,
            code_size,
            self.ctx.constant_pool.len(),
            machine.patches.len(),
            frame_maps.len()
        );
        self.ctx.session.record_method_compiled(code_size);
        Ok(CompiledMethod {
            code,
            code_size,
            pool_offset,
            base,
            frame_maps,
        })
    }

    fn resolved(&self, promise: PromiseId) -> CompileResult<i64> {
        self.ctx
            .promises
            .value(promise)
            .ok_or_else(|| CompileError::Unresolved {
                reason: format!("{:?} has no value after layout", promise),
            })
    }
}
