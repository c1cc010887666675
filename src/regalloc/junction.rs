// Fork and junction reconciliation. A junction is an event with several predecessors; all of
// them must leave every live frame slot in the same place, recorded in a junction site table
// shared by every predecessor of the merge region. The first predecessor compiled proposes the
// table (preferring sites it already holds, then moving to a cheap common target); later
// predecessors move their values into the table sites. A fork is an event with several
// successors; each successor starts from a snapshot of the sites and buddy rings captured
// when the fork was compiled, so one path's allocation never leaks into another's.
//
// Links into instructions that were already compiled carry stub reads, which keep the values
// of the not-yet-visited predecessor alive until the driver knows which read they stand for.

//! Junction site tables, fork snapshots and link visiting.

use crate::core::error::{CompileError, CompileResult};
use crate::core::site::{FrameSlot, Site, SiteId, SiteMask};
use crate::core::value::{ValueId, ValueType};
use crate::ir::context::Context;
use crate::ir::event::{EventId, JunctionTableId, LinkId, Snapshot};
use crate::ir::stack::FrameElement;
use crate::regalloc::target::Accept;
use crate::target::OperandType;
use log::{debug, trace};

/// Sites frozen while an event's site tables are being resolved.
pub type FrozenSites = Vec<SiteId>;

impl<'a> Context<'a> {
    fn freeze_into(&mut self, frozen: &mut FrozenSites, s: SiteId) {
        self.freeze_site(s);
        frozen.push(s);
    }

    pub fn thaw_all(&mut self, frozen: &mut FrozenSites) {
        while let Some(s) = frozen.pop() {
            self.thaw_site(s);
        }
    }

    fn table_entry(&self, table: JunctionTableId, local_index: u32) -> Option<Site> {
        self.junction_table(table)
            .get(local_index as usize)
            .copied()
            .flatten()
    }

    fn resolve_mask(&self) -> SiteMask {
        SiteMask::new(
            OperandType::Register.bit() | OperandType::Memory.bit(),
            self.arch.general_register_mask(),
            FrameSlot::Any,
        )
    }

    /// Give the first junction after `e` a fresh table and share it with every predecessor
    /// of the merge region.
    fn propagate_junction_sites(&mut self, e: EventId) {
        let successors: Vec<EventId> = self
            .event(e)
            .successors
            .iter()
            .rev()
            .map(|&l| self.link(l).successor)
            .collect();
        let Some(junction) = successors
            .into_iter()
            .find(|&s| self.event(s).predecessors.len() > 1)
        else {
            return;
        };

        let table = self.new_junction_table(self.frame_footprint(self.event(e).stack_after));
        let mut pending = vec![junction];
        while let Some(s) = pending.pop() {
            let predecessors: Vec<EventId> = self
                .event(s)
                .predecessors
                .iter()
                .map(|&l| self.link(l).predecessor)
                .collect();
            for p in predecessors {
                if self.event(p).junction_sites.is_none() {
                    self.event_mut(p).junction_sites = Some(table);
                    pending.extend(
                        self.event(p)
                            .successors
                            .iter()
                            .map(|&l| self.link(l).successor),
                    );
                }
            }
        }
        if self.config.trace_junctions {
            trace!("junction table {:?} propagated from {:?}", table, e);
        }
    }

    /// Move every live value after `e` into the site an earlier predecessor chose. Returns
    /// whether every live slot already had a table entry.
    fn resolve_original_sites(
        &mut self,
        e: EventId,
        frozen: &mut FrozenSites,
        table: JunctionTableId,
    ) -> CompileResult<bool> {
        let (stack, locals) = {
            let event = self.event(e);
            (event.stack_after, event.locals_after_or_before())
        };
        let elements = self.frame_elements(stack, locals, true);
        let bound = elements.len() + 1;

        let mut passes = 0;
        let complete = loop {
            passes += 1;
            if passes > bound {
                return Err(CompileError::FixedPointExceeded {
                    bound,
                    reason: format!("junction sites after {:?}", e),
                });
            }

            let mut complete = true;
            let mut pending_frozen = Vec::new();
            for element in &elements {
                let live = match element.value {
                    Some(v) => self.live(v).map(|_| v),
                    None => None,
                };
                let entry = self.table_entry(table, element.local_index);
                match (live, entry) {
                    (Some(v), Some(site)) => {
                        if self.config.trace_junctions {
                            trace!(
                                "resolve original {:?} for {:?} slot {}",
                                site,
                                v,
                                element.local_index
                            );
                        }
                        let mask = site.mask(&self.geometry);
                        let target = self.pick_site_or_move_value(
                            v,
                            mask,
                            true,
                            self.config.resolve_register_reserve,
                        )?;
                        self.freeze_into(&mut pending_frozen, target);
                    }
                    (Some(_), None) => complete = false,
                    (None, Some(site)) => {
                        // evict whatever occupies the slot so incoming edges find it free
                        let dummy = self.new_value(ValueType::General);
                        let s = self.new_site(site.copy());
                        self.add_site(dummy, s)?;
                        self.remove_site(dummy, s);
                        self.freeze_into(&mut pending_frozen, s);
                    }
                    (None, None) => {}
                }
            }

            if self.table_settled(&elements, table) {
                frozen.extend(pending_frozen);
                break complete;
            }
            self.thaw_all(&mut pending_frozen);
        };

        self.session.record_junction_passes(passes);
        Ok(complete)
    }

    /// Whether every live value holds the site its table entry names.
    fn table_settled(
        &mut self,
        elements: &[FrameElement],
        table: JunctionTableId,
    ) -> bool {
        for element in elements {
            let Some(v) = element.value else { continue };
            let Some(site) = self.table_entry(table, element.local_index) else {
                continue;
            };
            if !self.is_live(v) {
                continue;
            }
            let mask = site.mask(&self.geometry);
            let held = self
                .ring_sites(v, true)
                .into_iter()
                .any(|(_, s)| self.site(s).matches(&mask, &self.geometry));
            if !held {
                return false;
            }
        }
        true
    }

    /// Fill empty entries from sites the values already hold. Returns whether every live
    /// slot got an entry.
    fn resolve_source_sites(
        &mut self,
        e: EventId,
        frozen: &mut FrozenSites,
        table: &mut [Option<Site>],
    ) -> bool {
        let (stack, locals) = {
            let event = self.event(e);
            (event.stack_after, event.locals_after_or_before())
        };
        let mask = self.resolve_mask();
        let mut complete = true;
        for element in self.frame_elements(stack, locals, false) {
            let Some(v) = element.value else { continue };
            let Some(read) = self.live(v) else { continue };
            let slot = element.local_index as usize;
            if table.get(slot).map_or(true, |entry| entry.is_some()) {
                continue;
            }
            match self.pick_source_site(read, None, Some(mask), true, false, Accept::Resolve) {
                Some((s, _)) => {
                    if self.config.trace_junctions {
                        trace!("resolve source {:?} for {:?} slot {}", self.site(s), v, slot);
                    }
                    self.freeze_into(frozen, s);
                    table[slot] = Some(self.site(s).copy());
                }
                None => complete = false,
            }
        }
        complete
    }

    /// Fill the remaining entries, moving values where no held site qualifies.
    fn resolve_target_sites(
        &mut self,
        e: EventId,
        frozen: &mut FrozenSites,
        table: &mut [Option<Site>],
    ) -> CompileResult<()> {
        let (stack, locals) = {
            let event = self.event(e);
            (event.stack_after, event.locals_after_or_before())
        };
        let mask = self.resolve_mask();
        for element in self.frame_elements(stack, locals, false) {
            let Some(v) = element.value else { continue };
            let Some(read) = self.live(v) else { continue };
            let slot = element.local_index as usize;
            if table.get(slot).map_or(true, |entry| entry.is_some()) {
                continue;
            }
            let source =
                self.pick_source_site(read, None, Some(mask), false, true, Accept::Resolve);
            let s = match source {
                Some((s, _)) => s,
                None => {
                    self.maybe_move_value(v, mask, false, self.config.resolve_register_reserve)?
                }
            };
            self.freeze_into(frozen, s);
            table[slot] = Some(self.site(s).copy());
            if self.config.trace_junctions {
                trace!("resolve target {:?} for {:?} slot {}", table[slot], v, slot);
            }
        }
        Ok(())
    }

    fn resolve_junction_sites(
        &mut self,
        e: EventId,
        frozen: &mut FrozenSites,
    ) -> CompileResult<()> {
        let mut complete = match self.event(e).junction_sites {
            Some(table) => self.resolve_original_sites(e, frozen, table)?,
            None => {
                self.propagate_junction_sites(e);
                false
            }
        };

        if let Some(id) = self.event(e).junction_sites {
            if !complete {
                let mut table = self.junction_table(id).to_vec();
                complete = self.resolve_source_sites(e, frozen, &mut table);
                if !complete {
                    self.resolve_target_sites(e, frozen, &mut table)?;
                }
                *self.junction_table_mut(id) = table;
            }
            debug!(
                "junction table {:?} resolved at ip {}: {:?}",
                id,
                self.event(e).logical_ip,
                self.junction_table(id)
            );
        }
        Ok(())
    }

    /// At a fork without a junction table, pin every live value to one site so all
    /// successors start from the same layout.
    fn resolve_branch_sites(&mut self, e: EventId, frozen: &mut FrozenSites) -> CompileResult<()> {
        let event = self.event(e);
        if event.successors.len() > 1 && event.junction_sites.is_none() {
            let footprint = self.frame_footprint(event.stack_after);
            let mut table = vec![None; footprint as usize];
            if !self.resolve_source_sites(e, frozen, &mut table) {
                self.resolve_target_sites(e, frozen, &mut table)?;
            }
        }
        Ok(())
    }

    pub fn populate_site_tables(
        &mut self,
        e: EventId,
        frozen: &mut FrozenSites,
    ) -> CompileResult<()> {
        self.resolve_junction_sites(e, frozen)?;
        self.resolve_branch_sites(e, frozen)
    }

    fn make_snapshots(&self, v: ValueId, snapshots: &mut Vec<Snapshot>) {
        for member in self.ring(v) {
            let data = self.value(member);
            snapshots.push(Snapshot {
                value: member,
                buddy: data.buddy,
                sites: data.sites.iter().map(|&s| self.site(s).copy()).collect(),
            });
        }
    }

    /// Record the sites and rings of every value a fork's successors may see.
    pub fn capture_branch_snapshots(&mut self, e: EventId) {
        let event = self.event(e);
        if event.successors.len() <= 1 {
            return;
        }
        let (stack, locals) = (event.stack_after, event.locals_after_or_before());
        let saved = event
            .successors
            .last()
            .and_then(|&l| self.link(l).fork_state)
            .map(|f| self.fork_state(f).saved.clone())
            .unwrap_or_default();

        let mut snapshots = Vec::new();
        for v in self.frames.values(stack, locals) {
            self.make_snapshots(v, &mut snapshots);
        }
        for v in saved {
            self.make_snapshots(v, &mut snapshots);
        }
        if self.config.trace_junctions {
            trace!("captured {} snapshots at {:?}", snapshots.len(), e);
        }
        self.event_mut(e).snapshots.extend(snapshots);
    }

    /// Drop every site of the frame values `e` sees, and of anything else still owning a
    /// resource.
    fn reset_frame(&mut self, e: EventId) {
        let (stack, locals) = {
            let event = self.event(e);
            (event.stack_before, event.locals_before)
        };
        for v in self.frames.values(stack, locals) {
            self.clear_sites(v);
        }
        loop {
            let Some((id, (owner, _))) = self.resources.owned().next() else {
                break;
            };
            self.clear_sites(owner);
            // an owner that no longer lists the site must not pin the resource
            self.resources.get_mut(id).owner = None;
        }
    }

    /// Enter a junction: every live frame value takes exactly its table site.
    pub fn set_sites(&mut self, e: EventId, table: JunctionTableId) -> CompileResult<()> {
        self.reset_frame(e);
        let (stack, locals) = {
            let event = self.event(e);
            (event.stack_before, event.locals_before)
        };
        for element in self.frame_elements(stack, locals, false) {
            let Some(v) = element.value else { continue };
            let Some(site) = self.table_entry(table, element.local_index) else {
                if self.config.trace_junctions {
                    trace!("no table site for {:?} slot {}", v, element.local_index);
                }
                continue;
            };
            if self.is_live(v) {
                let s = self.new_site(site.copy());
                self.add_site(v, s)?;
            }
        }
        Ok(())
    }

    /// Break every buddy ring of the current frame values.
    pub fn remove_buddies(&mut self) {
        for v in self.frames.values(self.stack, self.locals) {
            self.remove_buddy(v);
        }
    }

    /// Enter one successor of a fork: rings and sites go back to what they were when the
    /// fork was compiled.
    pub fn restore_snapshots(&mut self, e: EventId, snapshots: &[Snapshot]) -> CompileResult<()> {
        trace!("restore {} snapshots into {:?}", snapshots.len(), e);
        for snapshot in snapshots {
            self.unlink(snapshot.value);
        }
        for snapshot in snapshots {
            self.value_mut(snapshot.value).buddy = snapshot.buddy;
        }
        self.reset_frame(e);
        for snapshot in snapshots.iter().rev() {
            let v = snapshot.value;
            if self.is_live(v) && !snapshot.sites.is_empty() && self.value(v).sites.is_empty() {
                for site in snapshot.sites.iter().rev() {
                    let s = self.new_site(site.copy());
                    self.add_site(v, s)?;
                }
            }
        }
        Ok(())
    }

    /// Choose and freeze a source site for every read of `e`.
    pub fn populate_sources(&mut self, e: EventId) -> CompileResult<()> {
        let reads = self.event(e).reads.clone();
        let mut frozen = FrozenSites::new();
        let mut result = Ok(());
        for read in reads {
            let v = self.reads.value(read);
            match self.read_source(read) {
                Ok(source) => {
                    self.value_mut(v).source = source;
                    if let Some(s) = source {
                        if self.config.trace_reads {
                            trace!("freeze source {:?} for {:?}", self.site(s), v);
                        }
                        self.freeze_into(&mut frozen, s);
                    }
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        self.thaw_all(&mut frozen);
        result
    }

    /// Keep the current frame values alive across an edge into an already-compiled
    /// instruction.
    pub fn populate_junction_reads(&mut self, link: LinkId) -> CompileResult<()> {
        let footprint = self.frame_footprint(self.stack) as usize;
        let mut state = vec![None; footprint];
        for element in self.frame_elements(self.stack, self.locals, false) {
            let Some(v) = element.value else { continue };
            let stub = self.reads.stub(v);
            self.add_read(None, v, stub)?;
            state[element.local_index as usize] = Some((v, stub));
        }
        self.link_mut(link).junction_state = state;
        Ok(())
    }

    /// Point each stub of `link` at the read now live for its slot; stubs with no such read
    /// become invalid.
    pub fn update_junction_reads(&mut self, link: LinkId) {
        let state = self.link(link).junction_state.clone();
        for element in self.frame_elements(self.stack, self.locals, false) {
            let Some(v) = element.value else { continue };
            let Some(Some((_, stub))) = state.get(element.local_index as usize) else {
                continue;
            };
            if self.reads.stub_target(*stub).is_none() {
                if let Some(read) = self.live(v) {
                    self.reads.set_stub_target(*stub, read);
                }
            }
        }
        for (_, stub) in state.into_iter().flatten() {
            if self.reads.stub_target(stub).is_none() {
                if self.config.trace_reads {
                    trace!("stub read {:?} invalid", stub);
                }
                self.reads.invalidate_stub(stub);
            }
        }
    }

    /// Follow `link`: switch fan-out reads onto its path and consume its stub reads.
    pub fn visit(&mut self, link: LinkId) -> CompileResult<()> {
        if let Some(fork) = self.link(link).fork_state {
            let elements = self.fork_state(fork).elements.clone();
            for (v, multi) in elements {
                let next = self.reads.next_target(multi);
                self.value_mut(v).reads = next;
                if !self.is_live(v) {
                    self.clear_sites(v);
                }
            }
        }
        let junction_state = self.link(link).junction_state.clone();
        for (v, stub) in junction_state.into_iter().flatten() {
            if self.value(v).reads == Some(stub) {
                self.pop_read(None, v)?;
            }
        }
        Ok(())
    }
}
