//! Inserted moves: satisfying a read from the sites a value already holds, or copying the
//! value somewhere that does.

use crate::core::error::{CompileError, CompileResult};
use crate::core::read::ReadId;
use crate::core::site::{copy_cost, SiteId, SiteMask};
use crate::core::value::ValueId;
use crate::ir::context::Context;
use crate::regalloc::target::Accept;
use crate::target::{BinaryOperation, OperandMask, WORD};
use log::trace;

impl<'a> Context<'a> {
    /// Make sure `read`'s value has a site chosen for the read, copying it there when none
    /// of its current sites is already that location. Returns the site to read from.
    pub fn maybe_move(
        &mut self,
        read: ReadId,
        intersect_read: bool,
        register_reserve: u32,
    ) -> CompileResult<SiteId> {
        let value = self.reads.value(read);
        let dst = self.pick_target_site(read, intersect_read, register_reserve, Some(value))?;
        let dst_site = self.site(dst);
        let plan = self.arch.plan_move(
            WORD,
            OperandMask::new(dst_site.operand_type().bit(), dst_site.register_mask()),
        );
        let src_mask = SiteMask::from_operand(plan.src);

        let mut best: Option<(SiteId, u32)> = None;
        for (_, s) in self.ring_sites(value, true) {
            let site = self.site(s);
            let mut cost = site.copy_cost(Some(&dst_site));
            if cost == 0 {
                best = Some((s, 0));
                break;
            }
            if !site.matches(&src_mask, &self.geometry) {
                cost += copy_cost::PENALTY;
            }
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((s, cost));
            }
        }
        let (mut src, cost) = best.ok_or_else(|| {
            CompileError::invariant(format!("{:?} has no site to move from", value))
        })?;
        if cost == 0 {
            return Ok(src);
        }

        trace!(
            "move {:?} from {:?} to {:?}",
            value,
            self.site(src),
            dst_site
        );
        self.freeze_site(src);
        let added = self.add_site(value, dst);
        self.thaw_site(src);
        added?;

        if !self.site(src).matches(&src_mask, &self.geometry) {
            self.freeze_site(src);
            self.freeze_site(dst);
            let tmp_read = self
                .reads
                .single(value, SiteMask::from_operand(plan.tmp), Some(value));
            let staged = self.stage_through_temporary(value, src, tmp_read);
            self.thaw_site(dst);
            self.thaw_site(src);
            src = staged?;
        }

        self.move_value(value, src, dst)?;
        Ok(dst)
    }

    fn stage_through_temporary(
        &mut self,
        value: ValueId,
        src: SiteId,
        tmp_read: ReadId,
    ) -> CompileResult<SiteId> {
        let tmp = self.pick_target_site(tmp_read, true, 0, None)?;
        self.add_site(value, tmp)?;
        self.move_value(value, src, tmp)?;
        Ok(tmp)
    }

    /// [`Context::maybe_move`] for a value and a mask rather than a pending read.
    pub fn maybe_move_value(
        &mut self,
        v: ValueId,
        mask: SiteMask,
        intersect_mask: bool,
        register_reserve: u32,
    ) -> CompileResult<SiteId> {
        let read = self.reads.single(v, mask, Some(v));
        self.maybe_move(read, intersect_mask, register_reserve)
    }

    /// A held site satisfying `read`, or a new one reached by a move.
    pub fn pick_site_or_move(
        &mut self,
        read: ReadId,
        intersect_read: bool,
        register_reserve: u32,
    ) -> CompileResult<SiteId> {
        match self.pick_source_site(read, None, None, intersect_read, true, Accept::Match) {
            Some((s, _)) => Ok(s),
            None => self.maybe_move(read, intersect_read, register_reserve),
        }
    }

    pub fn pick_site_or_move_value(
        &mut self,
        v: ValueId,
        mask: SiteMask,
        intersect_mask: bool,
        register_reserve: u32,
    ) -> CompileResult<SiteId> {
        let read = self.reads.single(v, mask, Some(v));
        self.pick_site_or_move(read, intersect_mask, register_reserve)
    }

    /// Emit a word move of `v` between two of its sites.
    pub fn move_value(&mut self, v: ValueId, src: SiteId, dst: SiteId) -> CompileResult<()> {
        trace!("emit move of {:?}: {:?} -> {:?}", v, self.site(src), self.site(dst));
        self.session.record_move_inserted();
        self.freeze_site(src);
        self.freeze_site(dst);
        let result = self.apply2_sites(BinaryOperation::Move, WORD, src, WORD, dst);
        self.thaw_site(dst);
        self.thaw_site(src);
        result
    }

    /// Where the driver reads `read`'s value from for the event being compiled, or `None`
    /// when the value has no location at all yet.
    pub fn read_source(&mut self, read: ReadId) -> CompileResult<Option<SiteId>> {
        let v = self.reads.value(read);
        if !self.has_site(v) {
            return Ok(None);
        }
        self.pick_site_or_move(read, true, 0).map(Some)
    }
}
