// Target selection. Given a read, pick the cheapest register or frame slot that satisfies the
// read (and, when possible, the read of the value the result turns into), preferring in order
// a free register, the value's home slot, any free frame slot. Every candidate is priced by
// the resource it occupies: unavailable resources are impossible, resources owned by another
// value carry a steal penalty (higher when the owner would lose its last site), and a move
// cost calculator adds the price of an indirect move when the value has no site the emitter
// could copy from directly. Source selection works on the sites a value already holds and
// ranks them by copy cost.

//! Cost model and target/source selection.

use crate::core::error::{CompileError, CompileResult};
use crate::core::read::ReadId;
use crate::core::resource::{target_cost, ResourceId};
use crate::core::site::{FrameSlot, Site, SiteId, SiteMask};
use crate::core::value::{ValueId, ValueType};
use crate::ir::context::Context;
use crate::target::{OperandMask, OperandType, ANY_TYPE, WORD};
use log::trace;

/// A chosen register or frame slot with its cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub index: u32,
    pub kind: OperandType,
    pub cost: u32,
}

impl Target {
    pub const IMPOSSIBLE: Target = Target {
        index: 0,
        kind: OperandType::Register,
        cost: target_cost::IMPOSSIBLE,
    };

    fn keep_cheaper(&mut self, other: Target) {
        if other.cost < self.cost {
            *self = other;
        }
    }
}

/// Which held sites a source search accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    /// Any site matching the mask.
    Match,
    /// Unfrozen matches that can be committed to a junction table: registers while enough
    /// remain free, frame slots only when they are the value's home.
    Resolve,
}

impl<'a> Context<'a> {
    /// Extra cost of reaching `dst` from the sites `value` holds now.
    fn move_cost(&self, value: ValueId, dst: &SiteMask) -> u32 {
        let plan = self
            .arch
            .plan_move(WORD, OperandMask::new(dst.type_mask, dst.register_mask));
        let src = SiteMask::from_operand(plan.src);
        let direct = self.ring_sites(value, true).into_iter().any(|(_, s)| {
            let site = self.site(s);
            site.matches(&src, &self.geometry) || site.matches(dst, &self.geometry)
        });
        if direct {
            0
        } else {
            target_cost::INDIRECT_MOVE
        }
    }

    fn resource_cost(
        &self,
        v: Option<ValueId>,
        id: ResourceId,
        mask: &SiteMask,
        calc: Option<ValueId>,
    ) -> u32 {
        let resource = self.resources.get(id);
        if resource.unavailable() {
            return target_cost::IMPOSSIBLE;
        }
        let base = calc.map(|value| self.move_cost(value, mask)).unwrap_or(0);
        match resource.owner {
            None => base,
            Some((owner, _)) if v.is_some_and(|v| self.buddies(owner, v)) => base,
            Some((owner, site)) if self.unique_site(owner, site) => {
                base + target_cost::STEAL_UNIQUE
            }
            Some(_) => base + target_cost::STEAL,
        }
    }

    fn register_cost(&self, v: Option<ValueId>, register: u8, calc: Option<ValueId>) -> u32 {
        let mask = SiteMask::fixed_register(register);
        self.resource_cost(v, ResourceId::Register(register), &mask, calc)
            + target_cost::MINIMUM_REGISTER
    }

    /// Cheapest register in `mask`. General registers are scanned from the top, float
    /// registers from the bottom; a single-register mask returns that register at any cost.
    pub fn pick_register_target(
        &self,
        v: Option<ValueId>,
        mask: u64,
        calc: Option<ValueId>,
    ) -> Target {
        let count = self.arch.register_count() as u8;
        let general = self.arch.general_register_mask();
        let float = self.arch.float_register_mask();
        let order = (0..count)
            .rev()
            .filter(|r| general & (1 << r) != 0)
            .chain((0..count).filter(|r| float & (1 << r) != 0));

        let mut best = Target::IMPOSSIBLE;
        for r in order {
            if mask & (1 << r) == 0 {
                continue;
            }
            let mine = Target {
                index: r as u32,
                kind: OperandType::Register,
                cost: self.register_cost(v, r, calc),
            };
            if 1u64 << r == mask {
                return mine;
            }
            best.keep_cheaper(mine);
        }
        best
    }

    fn frame_cost(&self, v: ValueId, index: u32, calc: Option<ValueId>) -> u32 {
        if index >= self.resources.frame_count() {
            return target_cost::IMPOSSIBLE;
        }
        let mask = SiteMask::fixed_frame(index);
        self.resource_cost(Some(v), ResourceId::Frame(index), &mask, calc)
            + target_cost::MINIMUM_FRAME
    }

    fn frame_target(&self, v: ValueId, index: u32, calc: Option<ValueId>) -> Target {
        Target {
            index,
            kind: OperandType::Memory,
            cost: self.frame_cost(v, index, calc),
        }
    }

    /// Cheapest home slot of any member of `v`'s ring.
    pub fn pick_frame_target(&self, v: ValueId, calc: Option<ValueId>) -> Target {
        let mut best = Target::IMPOSSIBLE;
        for member in self.ring(v) {
            if let Some(home) = self.value(member).home {
                let mine = self.frame_target(v, home, calc);
                if mine.cost == target_cost::MINIMUM_FRAME {
                    return mine;
                }
                best.keep_cheaper(mine);
            }
        }
        best
    }

    /// Cheapest slot anywhere in the frame.
    pub fn pick_any_frame_target(&self, v: ValueId, calc: Option<ValueId>) -> Target {
        let mut best = Target::IMPOSSIBLE;
        for index in 0..self.total_frame_size() {
            let mine = self.frame_target(v, index, calc);
            if mine.cost == target_cost::MINIMUM_FRAME {
                return mine;
            }
            best.keep_cheaper(mine);
        }
        best
    }

    fn pick_masked_target(
        &self,
        v: ValueId,
        mask: &SiteMask,
        register_penalty: u32,
        mut best: Target,
        calc: Option<ValueId>,
    ) -> Target {
        if mask.accepts(OperandType::Register) {
            let mut mine = self.pick_register_target(Some(v), mask.register_mask, calc);
            mine.cost += register_penalty;
            if mine.cost == target_cost::MINIMUM_REGISTER {
                return mine;
            }
            best.keep_cheaper(mine);
        }
        if mask.accepts(OperandType::Memory) {
            let mine = match mask.frame {
                FrameSlot::Index(index) => Some(self.frame_target(v, index, calc)),
                FrameSlot::Any => Some(self.pick_frame_target(v, calc)),
                FrameSlot::None => None,
            };
            if let Some(mine) = mine {
                if mine.cost == target_cost::MINIMUM_FRAME {
                    return mine;
                }
                best.keep_cheaper(mine);
            }
        }
        best
    }

    /// Choose where the value of `read` should go.
    ///
    /// With `intersect_read` the result must satisfy the read; otherwise the read is only a
    /// preference and any register or frame slot may be returned.
    pub fn pick_target(
        &mut self,
        read: ReadId,
        intersect_read: bool,
        register_reserve: u32,
        calc: Option<ValueId>,
    ) -> CompileResult<Target> {
        let value = self.reads.value(read);
        let register_penalty = if self.resources.available_general_registers() > register_reserve
        {
            0
        } else {
            target_cost::LOW_REGISTER
        };
        let is_float = self.value(value).value_type == ValueType::Float;
        let register_mask = if is_float {
            u64::MAX
        } else {
            self.arch.general_register_mask()
        };

        let mut mask = SiteMask::new(ANY_TYPE, register_mask, FrameSlot::Any);
        self.reads.intersect(read, &mut mask, 0);
        if is_float {
            let float_mask = mask.register_mask & self.arch.float_register_mask();
            if float_mask != 0 {
                mask.register_mask = float_mask;
            }
        }

        let mut best = Target::IMPOSSIBLE;
        if let Some(successor) = self.reads.successor(read) {
            if let Some(next) = self.live(successor) {
                let mut intersection = mask;
                if self.reads.intersect(next, &mut intersection, 0) {
                    best = self.pick_masked_target(
                        value,
                        &intersection,
                        register_penalty,
                        best,
                        calc,
                    );
                    if best.cost <= target_cost::MINIMUM_FRAME {
                        return Ok(best);
                    }
                }
            }
        }

        best = self.pick_masked_target(value, &mask, register_penalty, best, calc);
        if best.cost <= target_cost::MINIMUM_FRAME {
            return Ok(best);
        }

        if intersect_read {
            if best.cost >= target_cost::IMPOSSIBLE {
                return Err(CompileError::ImpossibleTarget {
                    reason: format!(
                        "{:?} needs type mask {:#06b} registers {:#x} frame {:?}",
                        value, mask.type_mask, mask.register_mask, mask.frame
                    ),
                });
            }
            return Ok(best);
        }

        let mut mine = self.pick_register_target(Some(value), register_mask, calc);
        mine.cost += register_penalty;
        if mine.cost == target_cost::MINIMUM_REGISTER {
            return Ok(mine);
        }
        best.keep_cheaper(mine);

        let mine = self.pick_frame_target(value, calc);
        if mine.cost == target_cost::MINIMUM_FRAME {
            return Ok(mine);
        }
        best.keep_cheaper(mine);

        if best.cost >= target_cost::STEAL_UNIQUE
            && self.resources.available_general_registers() == 0
        {
            // memory-to-memory moves need a free register, so settle for any free slot
            best = self.pick_any_frame_target(value, calc);
        } else if best.cost >= target_cost::STEAL {
            // every candidate displaces another value; an empty slot displaces nothing
            best.keep_cheaper(self.pick_any_frame_target(value, calc));
        }

        if best.cost >= target_cost::IMPOSSIBLE {
            return Err(CompileError::ImpossibleTarget {
                reason: format!("no register or frame slot left for {:?}", value),
            });
        }
        Ok(best)
    }

    /// Like [`Context::pick_target`], materialized as a fresh, unacquired site.
    pub fn pick_target_site(
        &mut self,
        read: ReadId,
        intersect_read: bool,
        register_reserve: u32,
        calc: Option<ValueId>,
    ) -> CompileResult<SiteId> {
        let target = self.pick_target(read, intersect_read, register_reserve, calc)?;
        trace!(
            "picked {:?} {} (cost {}) for {:?}",
            target.kind,
            target.index,
            target.cost,
            self.reads.value(read)
        );
        let site = match target.kind {
            OperandType::Memory => {
                self.session.record_frame_spill();
                Site::frame(&self.geometry, target.index)
            }
            _ => Site::register(target.index as u8),
        };
        Ok(self.new_site(site))
    }

    fn accepts_source(&self, accept: Accept, value: ValueId, s: SiteId) -> bool {
        match accept {
            Accept::Match => true,
            Accept::Resolve => {
                if self.site_frozen(s) {
                    return false;
                }
                match self.site(s) {
                    Site::Register { .. } => {
                        self.resources.available_general_registers()
                            > self.config.resolve_register_reserve
                    }
                    site => site
                        .frame_index(&self.geometry)
                        .is_some_and(|index| self.is_home(value, index)),
                }
            }
        }
    }

    /// The held site of `read`'s value that is cheapest to copy to `target`, among those
    /// matching `extra_mask` (and the read itself when `intersect_read` is set).
    pub fn pick_source_site(
        &mut self,
        read: ReadId,
        target: Option<Site>,
        extra_mask: Option<SiteMask>,
        intersect_read: bool,
        include_buddies: bool,
        accept: Accept,
    ) -> Option<(SiteId, u32)> {
        let value = self.reads.value(read);
        let mut mask = SiteMask::any();
        if let Some(extra) = extra_mask {
            mask = mask.intersect(extra);
        }
        if intersect_read {
            self.reads.intersect(read, &mut mask, 0);
        }

        let mut best: Option<(SiteId, u32)> = None;
        for (_, s) in self.ring_sites(value, include_buddies) {
            let site = self.site(s);
            if !site.matches(&mask, &self.geometry) || !self.accepts_source(accept, value, s) {
                continue;
            }
            let cost = site.copy_cost(target.as_ref());
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((s, cost));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use crate::core::resource::target_cost;
    use crate::core::site::{FrameSlot, Site, SiteMask};
    use crate::core::value::ValueType;
    use crate::target::{OperandType, ScratchRegisters, ANY_TYPE};
    use crate::testing::context_fixture;
    use crate::x64::{R14, R15, RSP};

    #[test]
    fn test_register_targets_scan_from_the_top() {
        let _ = env_logger::builder().is_test(true).try_init();
        context_fixture(|ctx, _| {
            ctx.init(1, 0, 0, 0);
            let general = ctx.arch.general_register_mask();
            let first = ctx.pick_register_target(None, general, None);
            assert_eq!(first.index, R15 as u32);
            assert_eq!(first.cost, target_cost::MINIMUM_REGISTER);

            let v = ctx.new_value(ValueType::General);
            let s = ctx.new_site(Site::register(R15));
            ctx.add_site(v, s).unwrap();
            assert_eq!(ctx.pick_register_target(None, general, None).index, R14 as u32);

            // a lone register is returned even when taking it means a steal
            let forced = ctx.pick_register_target(None, 1 << R15, None);
            assert_eq!(forced.index, R15 as u32);
            assert_eq!(forced.cost, target_cost::STEAL_UNIQUE);

            let reserved = ctx.pick_register_target(None, 1 << RSP, None);
            assert_eq!(reserved.cost, target_cost::IMPOSSIBLE);
        });
    }

    #[test]
    fn test_scratch_register_steals_from_dead_value() {
        let _ = env_logger::builder().is_test(true).try_init();
        context_fixture(|ctx, session| {
            ctx.init(1, 0, 0, 0);
            let v = ctx.new_value(ValueType::General);
            let s = ctx.new_site(Site::register(R15));
            ctx.add_site(v, s).unwrap();

            let register = ctx.acquire_temporary(1 << R15).unwrap();
            assert_eq!(register, R15);
            assert!(ctx.value(v).sites.is_empty());
            assert_eq!(session.stats().steals, 1);
            assert!(!ctx.resources.all_released());

            ctx.release_temporary(register);
            assert!(ctx.resources.all_released());
            assert!(ctx.acquire_temporary(1 << RSP).is_err());
        });
    }

    #[test]
    fn test_full_register_file_spills_to_a_free_slot() {
        let _ = env_logger::builder().is_test(true).try_init();
        context_fixture(|ctx, _| {
            ctx.init(1, 0, 0, 2);
            let general = ctx.arch.general_register_mask();
            for r in 0..16u8 {
                if general & (1 << r) == 0 || ctx.arch.reserved(r) {
                    continue;
                }
                let owner = ctx.new_value(ValueType::General);
                let s = ctx.new_site(Site::register(r));
                ctx.add_site(owner, s).unwrap();
            }

            let v = ctx.new_value(ValueType::General);
            let mask = SiteMask::new(ANY_TYPE, general, FrameSlot::Any);
            let read = ctx.reads.single(v, mask, None);
            let reserve = ctx.config.steal_register_reserve;
            let target = ctx.pick_target(read, false, reserve, None).unwrap();
            // every register would displace its owner's only copy
            assert_eq!(target.kind, OperandType::Memory);
            assert_eq!(target.cost, target_cost::MINIMUM_FRAME);
        });
    }
}
