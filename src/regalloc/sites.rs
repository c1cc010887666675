//! Site-to-resource bookkeeping: acquire, release, freeze, thaw and stealing.

use crate::core::error::{CompileError, CompileResult};
use crate::core::resource::{target_cost, ResourceId};
use crate::core::site::{Site, SiteId};
use crate::core::value::ValueId;
use crate::ir::context::Context;
use log::trace;

/// Registers a memory site references without owning them.
fn memory_registers(base: u8, index: Option<u8>) -> Vec<ResourceId> {
    std::iter::once(ResourceId::Register(base))
        .chain(index.map(ResourceId::Register))
        .collect()
}

impl<'a> Context<'a> {
    fn stack_frame_resource(&self, s: Site) -> Option<ResourceId> {
        match s {
            Site::Memory { base, offset, .. } if base == self.geometry.stack => Some(
                ResourceId::Frame(self.geometry.offset_to_frame_index(offset)),
            ),
            _ => None,
        }
    }

    pub fn acquire_site(&mut self, v: ValueId, s: SiteId) -> CompileResult<()> {
        match self.site(s) {
            Site::Constant(_) | Site::Address(_) => Ok(()),
            Site::Register { mask, number } => {
                let n = match number {
                    Some(n) => n,
                    None => {
                        let target = self.pick_register_target(Some(v), mask, None);
                        if target.cost >= target_cost::IMPOSSIBLE {
                            return Err(CompileError::ImpossibleTarget {
                                reason: format!("no register in {:#x} for {:?}", mask, v),
                            });
                        }
                        target.index as u8
                    }
                };
                self.acquire_resource(ResourceId::Register(n), v, s)?;
                if let Site::Register { number, .. } = self.site_mut(s) {
                    *number = Some(n);
                }
                Ok(())
            }
            Site::Memory {
                base, index, ..
            } => {
                for r in memory_registers(base, index) {
                    self.resources.increment(r);
                }
                if let Some(frame) = self.stack_frame_resource(self.site(s)) {
                    self.acquire_resource(frame, v, s)?;
                }
                if let Site::Memory { acquired, .. } = self.site_mut(s) {
                    *acquired = true;
                }
                Ok(())
            }
        }
    }

    pub fn release_site(&mut self, v: ValueId, s: SiteId) {
        match self.site(s) {
            Site::Constant(_) | Site::Address(_) => {}
            Site::Register { number, .. } => {
                if let Some(n) = number {
                    self.release_resource(ResourceId::Register(n), v, s);
                }
            }
            Site::Memory {
                base,
                index,
                acquired,
                ..
            } => {
                if !acquired {
                    return;
                }
                if let Some(frame) = self.stack_frame_resource(self.site(s)) {
                    self.release_resource(frame, v, s);
                }
                for r in memory_registers(base, index) {
                    self.resources.decrement(r);
                }
                if let Site::Memory { acquired, .. } = self.site_mut(s) {
                    *acquired = false;
                }
            }
        }
    }

    pub fn freeze_site(&mut self, s: SiteId) {
        match self.site(s) {
            Site::Register {
                number: Some(n), ..
            } => self.resources.freeze(ResourceId::Register(n)),
            site @ Site::Memory { base, index, .. } => match self.stack_frame_resource(site) {
                Some(frame) => self.resources.freeze(frame),
                None => {
                    for r in memory_registers(base, index) {
                        self.resources.increment(r);
                    }
                }
            },
            _ => {}
        }
    }

    pub fn thaw_site(&mut self, s: SiteId) {
        match self.site(s) {
            Site::Register {
                number: Some(n), ..
            } => self.resources.thaw(ResourceId::Register(n)),
            site @ Site::Memory { base, index, .. } => match self.stack_frame_resource(site) {
                Some(frame) => self.resources.thaw(frame),
                None => {
                    for r in memory_registers(base, index) {
                        self.resources.decrement(r);
                    }
                }
            },
            _ => {}
        }
    }

    pub fn site_frozen(&self, s: SiteId) -> bool {
        match self.site(s) {
            Site::Register {
                number: Some(n), ..
            } => self.resources.get(ResourceId::Register(n)).freeze_count > 0,
            site @ Site::Memory { .. } => self
                .stack_frame_resource(site)
                .is_some_and(|frame| self.resources.get(frame).freeze_count > 0),
            _ => false,
        }
    }

    fn acquire_resource(&mut self, id: ResourceId, v: ValueId, s: SiteId) -> CompileResult<()> {
        if self.resources.get(id).reserved {
            return Ok(());
        }
        if self.resources.get(id).owner.is_some() {
            self.steal(id, Some(v))?;
        }
        trace!("{:?} acquires {:?}", v, id);
        self.resources.get_mut(id).owner = Some((v, s));
        Ok(())
    }

    fn release_resource(&mut self, id: ResourceId, v: ValueId, s: SiteId) {
        let resource = self.resources.get_mut(id);
        if resource.reserved {
            return;
        }
        if resource.owner == Some((v, s)) || resource.owner.map(|(_, site)| site) == Some(s) {
            resource.owner = None;
        }
    }

    /// Take `id` away from its owner, first moving the owner elsewhere when this is its last
    /// location and the thief is not an alias of it.
    pub fn steal(&mut self, id: ResourceId, thief: Option<ValueId>) -> CompileResult<()> {
        let Some((owner, site)) = self.resources.get(id).owner else {
            return Ok(());
        };
        trace!("{:?} steals {:?} from {:?}", thief, id, owner);
        self.session.record_steal();
        let aliased = thief.is_some_and(|t| self.buddies(t, owner));
        if !aliased && self.unique_site(owner, site) {
            if let Some(read) = self.live(owner) {
                self.freeze_site(site);
                let moved = self.maybe_move(read, false, self.config.steal_register_reserve);
                self.thaw_site(site);
                let moved = moved?;
                // an operand already sourced from the stolen site is read from its new home
                if self.value(owner).source == Some(site) {
                    self.value_mut(owner).source = Some(moved);
                }
            }
        }
        self.remove_site(owner, site);
        Ok(())
    }
}
