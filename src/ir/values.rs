//! Buddy rings, site lists and read chains.
//!
//! Every query here walks the whole buddy ring: a value is live when any member still has a
//! valid read, and a site held by any member is a site of all of them.

use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::PromiseId;
use crate::core::read::ReadId;
use crate::core::site::{Site, SiteId};
use crate::core::value::ValueId;
use crate::ir::context::Context;
use crate::ir::event::{EventId, EventKind};
use crate::ir::stack::{LocalsId, StackId};
use log::trace;

impl<'a> Context<'a> {
    /// Members of `v`'s ring, starting with `v`.
    pub fn ring(&self, v: ValueId) -> Vec<ValueId> {
        let mut members = vec![v];
        let mut p = self.value(v).buddy;
        while p != v {
            members.push(p);
            p = self.value(p).buddy;
        }
        members
    }

    pub fn buddies(&self, a: ValueId, b: ValueId) -> bool {
        a == b || self.ring(a).contains(&b)
    }

    /// Every `(owner, site)` pair of `v`, and of its buddies when asked.
    pub fn ring_sites(&self, v: ValueId, include_buddies: bool) -> Vec<(ValueId, SiteId)> {
        let members = if include_buddies { self.ring(v) } else { vec![v] };
        members
            .into_iter()
            .flat_map(|m| self.value(m).sites.iter().map(move |&s| (m, s)))
            .collect()
    }

    pub fn has_site(&self, v: ValueId) -> bool {
        self.ring(v).iter().any(|&m| !self.value(m).sites.is_empty())
    }

    /// Whether `s` is the only site of the whole ring.
    pub fn unique_site(&self, v: ValueId, s: SiteId) -> bool {
        let sites = self.ring_sites(v, true);
        sites.len() == 1 && sites[0].1 == s
    }

    /// Whether `frame_index` is the home slot of any member of `v`'s ring.
    pub fn is_home(&self, v: ValueId, frame_index: u32) -> bool {
        self.ring(v)
            .iter()
            .any(|&m| self.value(m).home == Some(frame_index))
    }

    pub fn find_constant(&self, v: ValueId) -> Option<PromiseId> {
        self.ring_sites(v, true)
            .into_iter()
            .find_map(|(_, s)| match self.site(s) {
                Site::Constant(p) => Some(p),
                _ => None,
            })
    }

    pub fn read_valid(&mut self, read: Option<ReadId>) -> bool {
        match read {
            Some(r) => self.reads.valid(r),
            None => false,
        }
    }

    /// The next valid read of any ring member.
    pub fn live(&mut self, v: ValueId) -> Option<ReadId> {
        for m in self.ring(v) {
            let reads = self.value(m).reads;
            if self.read_valid(reads) {
                return reads;
            }
        }
        None
    }

    pub fn is_live(&mut self, v: ValueId) -> bool {
        self.live(v).is_some()
    }

    /// The read that follows `v`'s current one, or the next valid read of a buddy.
    pub fn live_next(&mut self, v: ValueId) -> CompileResult<Option<ReadId>> {
        if let Some(current) = self.value(v).reads {
            let next = self.reads.next(current)?;
            if self.read_valid(next) {
                return Ok(next);
            }
        }
        for m in self.ring(v).into_iter().skip(1) {
            let reads = self.value(m).reads;
            if self.read_valid(reads) {
                return Ok(reads);
            }
        }
        Ok(None)
    }

    /// Give `v` the site `s`, acquiring its resource, unless `v` already holds it.
    pub fn add_site(&mut self, v: ValueId, s: SiteId) -> CompileResult<()> {
        if self.value(v).sites.contains(&s) {
            return Ok(());
        }
        trace!("add site {:?} to {:?}", self.site(s), v);
        self.acquire_site(v, s)?;
        self.value_mut(v).sites.insert(0, s);
        Ok(())
    }

    fn detach_site(&mut self, owner: ValueId, s: SiteId) {
        self.release_site(owner, s);
        self.value_mut(owner).sites.retain(|&x| x != s);
    }

    /// Remove `s` from whichever ring member holds it.
    pub fn remove_site(&mut self, v: ValueId, s: SiteId) {
        for (owner, site) in self.ring_sites(v, true) {
            if site == s {
                trace!("remove site {:?} from {:?}", self.site(s), owner);
                self.detach_site(owner, s);
                return;
            }
        }
    }

    pub fn clear_sites(&mut self, v: ValueId) {
        for (owner, site) in self.ring_sites(v, true) {
            self.detach_site(owner, site);
        }
    }

    /// Consume the head read of `v`, which must belong to `e` (or to no event).
    pub fn pop_read(&mut self, e: Option<EventId>, v: ValueId) -> CompileResult<()> {
        let head = self.value(v).reads.ok_or_else(|| {
            CompileError::invariant(format!("{:?} has no read to pop for {:?}", v, e))
        })?;
        let owner = self.reads.get(head).event;
        if owner != e {
            return Err(CompileError::invariant(format!(
                "read {:?} of {:?} belongs to {:?}, popped by {:?}",
                head, v, owner, e
            )));
        }
        if self.config.trace_reads {
            trace!("pop read {:?} from {:?}", head, v);
        }
        let next = self.reads.next(head)?;
        self.value_mut(v).reads = next;
        if !self.read_valid(next) {
            if self.is_live(v) {
                self.dead_buddy(v)?;
            } else {
                self.clear_sites(v);
            }
        }
        Ok(())
    }

    pub(crate) fn unlink(&mut self, v: ValueId) -> ValueId {
        let next = self.value(v).buddy;
        if next == v {
            return v;
        }
        self.value_mut(v).buddy = v;
        let mut p = next;
        while self.value(p).buddy != v {
            p = self.value(p).buddy;
        }
        self.value_mut(p).buddy = next;
        next
    }

    /// `v` has no reads left but its buddies do; hand its sites to them.
    fn dead_buddy(&mut self, v: ValueId) -> CompileResult<()> {
        trace!("dead buddy {:?}", v);
        let next = self.unlink(v);
        let sites = std::mem::take(&mut self.value_mut(v).sites);
        for s in sites.into_iter().rev() {
            self.release_site(v, s);
            // the resource was just released, so this cannot steal
            self.acquire_site(next, s)?;
            self.value_mut(next).sites.insert(0, s);
        }
        Ok(())
    }

    /// Make `buddy` an alias of `original`.
    pub fn add_buddy(&mut self, original: ValueId, buddy: ValueId) {
        trace!("add buddy {:?} to {:?}", buddy, original);
        self.value_mut(buddy).buddy = original;
        let mut p = original;
        while self.value(p).buddy != original {
            p = self.value(p).buddy;
        }
        self.value_mut(p).buddy = buddy;
    }

    /// Take `v` out of its ring, dropping the sites of whichever side is dead.
    pub fn remove_buddy(&mut self, v: ValueId) {
        if self.value(v).buddy == v {
            return;
        }
        let next = self.unlink(v);
        if !self.is_live(next) {
            self.clear_sites(next);
        }
        if !self.is_live(v) {
            self.clear_sites(v);
        }
    }

    /// Drop every site of `v` except frame slots at or above `pop_index`.
    pub fn clean_value(&mut self, v: ValueId, pop_index: u32) {
        for (owner, s) in self.ring_sites(v, true) {
            let keep = self
                .site(s)
                .frame_index(&self.geometry)
                .is_some_and(|i| i >= pop_index);
            if !keep {
                self.detach_site(owner, s);
            }
        }
    }

    /// Clean every frame value, then consume every read of `e`.
    pub fn clean_event(
        &mut self,
        e: EventId,
        stack: Option<StackId>,
        locals: LocalsId,
        pop_index: u32,
    ) -> CompileResult<()> {
        for v in self.frames.values(stack, locals) {
            self.clean_value(v, pop_index);
        }
        self.pop_all_reads(e)
    }

    pub fn pop_all_reads(&mut self, e: EventId) -> CompileResult<()> {
        let reads = self.event(e).reads.clone();
        for r in reads {
            let v = self.reads.value(r);
            self.pop_read(Some(e), v)?;
        }
        Ok(())
    }

    /// Whether control can never fall into `e`.
    pub fn unreachable(&self, e: EventId) -> bool {
        let preds = &self.event(e).predecessors;
        !preds.is_empty()
            && preds
                .iter()
                .all(|&l| self.all_exits(self.link(l).predecessor))
    }

    pub fn all_exits(&self, e: EventId) -> bool {
        match &self.event(e).kind {
            EventKind::Call(call) => call.tail,
            EventKind::Jump { exit, .. } => *exit || self.unreachable(e),
            _ => false,
        }
    }
}
