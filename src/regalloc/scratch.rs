//! Scratch registers handed to the emitter while it expands one operation.

use crate::core::error::{CompileError, CompileResult};
use crate::core::resource::{target_cost, ResourceId};
use crate::ir::context::Context;
use crate::target::ScratchRegisters;
use log::trace;

impl<'a> ScratchRegisters for Context<'a> {
    fn acquire_temporary(&mut self, mask: u64) -> CompileResult<u8> {
        let target = self.pick_register_target(None, mask, None);
        if target.cost >= target_cost::IMPOSSIBLE {
            return Err(CompileError::ScratchUnavailable {
                reason: format!("every register in {:#x} is frozen or reserved", mask),
            });
        }
        let register = target.index as u8;
        let id = ResourceId::Register(register);

        // the emitter is mid-instruction, so the owner can only give the register up if it
        // keeps another location
        if let Some((owner, site)) = self.resources.get(id).owner {
            if self.unique_site(owner, site) && self.is_live(owner) {
                return Err(CompileError::ScratchUnavailable {
                    reason: format!("register {} holds the only copy of {:?}", register, owner),
                });
            }
            self.session.record_steal();
            self.remove_site(owner, site);
        }

        trace!("scratch register {} acquired", register);
        self.resources.increment(id);
        Ok(register)
    }

    fn release_temporary(&mut self, register: u8) {
        trace!("scratch register {} released", register);
        self.resources.decrement(ResourceId::Register(register));
    }
}
