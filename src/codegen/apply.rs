//! Turning sites into emitter operands and forwarding operations to the emitter.

use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::{CodeTarget, PromiseId, PromiseKind};
use crate::core::site::{Site, SiteId};
use crate::core::value::ValueId;
use crate::ir::context::Context;
use crate::target::{
    BinaryOperation, Constant, Operand, Operation, TernaryOperation, UnaryOperation,
};

impl<'a> Context<'a> {
    /// Immediate encoding of a promise.
    pub fn constant_of(&self, p: PromiseId) -> Constant {
        match self.promises.kind(p) {
            PromiseKind::Resolved(v) => Constant::Immediate(v),
            PromiseKind::MachineIp(ip) => Constant::Label(CodeTarget::Ip(ip)),
            PromiseKind::Code => Constant::Label(CodeTarget::Promise(p)),
            PromiseKind::Pool(_) => Constant::Deferred(p),
        }
    }

    pub fn operand(&self, s: SiteId) -> CompileResult<Operand> {
        Ok(match self.site(s) {
            Site::Constant(p) => Operand::Constant(self.constant_of(p)),
            Site::Address(p) => Operand::Address(self.constant_of(p)),
            Site::Register {
                number: Some(n), ..
            } => Operand::Register(n),
            Site::Register { mask, number: None } => {
                return Err(CompileError::InvalidOperand {
                    reason: format!(
                        "register site {:?} with mask {:#x} was never acquired",
                        s, mask
                    ),
                })
            }
            Site::Memory {
                base,
                offset,
                index,
                scale,
                ..
            } => Operand::Memory {
                base,
                offset,
                index,
                scale,
            },
        })
    }

    /// A new code promise, resolved to wherever it is later bound.
    pub fn code_promise(&mut self) -> PromiseId {
        self.promises.create(PromiseKind::Code)
    }

    pub fn bind(&mut self, target: CodeTarget) -> CompileResult<()> {
        self.with_assembler(|asm, _| asm.bind(target))
    }

    pub fn apply0(&mut self, op: Operation) -> CompileResult<()> {
        self.with_assembler(|asm, _| asm.apply0(op))
    }

    pub fn apply1(&mut self, op: UnaryOperation, size: u32, a: Operand) -> CompileResult<()> {
        self.with_assembler(|asm, _| asm.apply1(op, size, a))
    }

    pub fn apply2(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
    ) -> CompileResult<()> {
        self.with_assembler(|asm, ctx| asm.apply2(op, a_size, a, b_size, b, ctx))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn apply3(
        &mut self,
        op: TernaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        c_size: u32,
        c: Operand,
    ) -> CompileResult<()> {
        self.with_assembler(|asm, ctx| asm.apply3(op, a_size, a, b_size, b, c_size, c, ctx))
    }

    /// [`Context::apply2`] on two sites.
    pub fn apply2_sites(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: SiteId,
        b_size: u32,
        b: SiteId,
    ) -> CompileResult<()> {
        let a = self.operand(a)?;
        let b = self.operand(b)?;
        self.apply2(op, a_size, a, b_size, b)
    }

    /// The site the driver chose for `v`'s current read.
    pub fn source(&self, v: ValueId) -> CompileResult<SiteId> {
        self.value(v)
            .source
            .ok_or_else(|| CompileError::invariant(format!("{:?} has no source site", v)))
    }
}

#[cfg(test)]
mod tests {
    use crate::recording::{Recorded, RecordingAssembler};
    use crate::testing::context_fixture;
    use crate::core::site::Site;
    use crate::target::{BinaryOperation, Constant, Operand};

    #[test]
    fn test_operand_conversion() {
        let _ = env_logger::builder().is_test(true).try_init();
        context_fixture(|ctx, _| {
            let seven = ctx.promises.resolved(7);
            let c = ctx.new_site(Site::Constant(seven));
            assert_eq!(
                ctx.operand(c).unwrap(),
                Operand::Constant(Constant::Immediate(7))
            );

            let pending = ctx.new_site(Site::free_register(0b110));
            assert!(ctx.operand(pending).is_err());

            let frame = ctx.new_site(Site::frame(&ctx.geometry, 2));
            assert_eq!(
                ctx.operand(frame).unwrap(),
                Operand::memory(ctx.geometry.stack, 16)
            );
        });
    }

    #[test]
    fn test_apply_reaches_emitter() {
        let _ = env_logger::builder().is_test(true).try_init();
        let log = RecordingAssembler::new_log();
        crate::testing::context_fixture_with(RecordingAssembler::with_log(log.clone()), |ctx, _| {
            ctx.apply2(
                BinaryOperation::Move,
                8,
                Operand::immediate(1),
                8,
                Operand::Register(0),
            )
            .unwrap();
        });
        assert!(matches!(
            log.borrow().first(),
            Some(Recorded::Binary {
                op: BinaryOperation::Move,
                ..
            })
        ));
    }
}
