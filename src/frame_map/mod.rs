// Frame maps tell the collector which stack and local slots hold object references at every
// call return address. The front end records a side log while it builds the IR: which slot
// became a reference or stopped being one, which instruction starts where, where nested
// contexts (branch targets, exception handlers) begin and end, where calls leave a trace, and
// where subroutines are entered and left. Solving replays that log. A running bitmap tracks
// the roots; instructions reached more than once keep a table that is intersected with every
// incoming bitmap; handlers start from the intersection of the maps of every trace in their
// range. Because a handler or a later visit can clear a bit in a map that was already used,
// the replay repeats until nothing changes. Intersection only ever clears bits, so the number
// of passes is bounded by the number of bits that can still be cleared.
//
// Subroutines can be reached from several call sites. Each distinct chain of call sites is a
// path with its own instruction tables, and traces inside a subroutine keep one map per path.

//! GC root maps: the side log, its fixed-point solver and the resulting tables.

pub mod table;

pub use table::{FlatTable, FrameMapTable, PathRecord, PathTable, TableEntry};

use crate::core::config::CompilerConfig;
use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::{PromiseId, PromiseTable};
use log::{debug, trace};

/// Handle to a trace point, created before the call it belongs to is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathId(pub(crate) u32);

/// One entry of the side log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEntry {
    PushContext,
    PopContext,
    Ip(u32),
    Mark(u32),
    Clear(u32),
    PushExceptionHandler { start: u32, end: u32 },
    Trace(TraceId),
    /// Entry into a subroutine; replay continues at `resume` once the body has been solved.
    PushSubroutine { call: CallSiteId, resume: usize },
    PopSubroutine,
}

/// A fixed-size bitmap of frame slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootMap {
    words: Vec<u64>,
}

impl RootMap {
    pub fn empty(bits: u32) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64) as usize],
        }
    }

    pub fn full(bits: u32) -> Self {
        Self {
            words: vec![u64::MAX; bits.div_ceil(64) as usize],
        }
    }

    pub fn get(&self, index: u32) -> bool {
        self.words
            .get(index as usize / 64)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    pub fn set(&mut self, index: u32) {
        if let Some(w) = self.words.get_mut(index as usize / 64) {
            *w |= 1 << (index % 64);
        }
    }

    pub fn clear(&mut self, index: u32) {
        if let Some(w) = self.words.get_mut(index as usize / 64) {
            *w &= !(1 << (index % 64));
        }
    }

    /// `self &= other`; returns whether any bit changed.
    pub fn intersect(&mut self, other: &RootMap) -> bool {
        let mut changed = false;
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            let next = *w & o;
            changed |= next != *w;
            *w = next;
        }
        changed
    }
}

/// Roots at one call's return address.
#[derive(Debug, Clone)]
pub struct TraceElement {
    pub ip: u32,
    pub map: RootMap,
    watched: bool,
    /// Return-address promise and the first slot past the caller's own frame.
    address: Option<(PromiseId, u32)>,
    paths: Vec<PathTrace>,
}

#[derive(Debug, Clone)]
struct PathTrace {
    path: PathId,
    map: RootMap,
    watched: bool,
}

#[derive(Debug, Clone)]
struct Region {
    ip: u32,
    /// Log index of the first entry of the body.
    log_index: usize,
    stack_next: Option<RegionId>,
    calls: Vec<CallSiteId>,
    /// Frame slot holding the return address while the body runs.
    stack_index: u32,
}

#[derive(Debug, Clone)]
struct CallSite {
    region: RegionId,
    return_address: PromiseId,
    paths: Vec<PathId>,
}

#[derive(Debug, Clone)]
struct Path {
    call: CallSiteId,
    stack_next: Option<PathId>,
    tables: Vec<RootMap>,
}

/// Returned by [`FrameMapLog::start_subroutine`], consumed by
/// [`FrameMapLog::end_subroutine`].
#[derive(Debug)]
#[must_use]
pub struct PendingSubroutine {
    entry: usize,
    region: RegionId,
}

/// The side log for one method and the state of its solver.
pub struct FrameMapLog {
    map_size: u32,
    visits: Vec<u16>,
    log: Vec<LogEntry>,
    traces: Vec<TraceElement>,
    regions: Vec<Region>,
    region_at: Vec<Option<RegionId>>,
    calls: Vec<CallSite>,
    paths: Vec<Path>,
    tables: Vec<RootMap>,
    current_region: Option<RegionId>,
    dirty: bool,
}

impl FrameMapLog {
    /// `map_size` is the number of tracked slots: locals plus the maximum stack depth.
    pub fn new(code_length: u32, map_size: u32) -> Self {
        Self {
            map_size,
            visits: vec![0; code_length as usize],
            log: Vec::new(),
            traces: Vec::new(),
            regions: Vec::new(),
            region_at: vec![None; code_length as usize],
            calls: Vec::new(),
            paths: Vec::new(),
            tables: vec![RootMap::full(map_size); code_length as usize],
            current_region: None,
            dirty: false,
        }
    }

    pub fn map_size(&self) -> u32 {
        self.map_size
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn visit_count(&self, ip: u32) -> u16 {
        self.visits.get(ip as usize).copied().unwrap_or(0)
    }

    pub fn trace_element(&self, id: TraceId) -> &TraceElement {
        &self.traces[id.0 as usize]
    }

    pub fn push_context(&mut self) {
        self.log.push(LogEntry::PushContext);
    }

    pub fn pop_context(&mut self) {
        self.log.push(LogEntry::PopContext);
    }

    /// Record that control reaches `ip`. Returns true the first time, when the instruction
    /// must be compiled rather than linked to.
    pub fn visit(&mut self, ip: u32) -> CompileResult<bool> {
        let count = self.visits.get_mut(ip as usize).ok_or_else(|| {
            CompileError::invariant(format!("instruction {} outside the method", ip))
        })?;
        let first = *count == 0;
        *count = count.saturating_add(1);
        if first {
            self.region_at[ip as usize] = self.current_region;
        }
        self.log.push(LogEntry::Ip(ip));
        Ok(first)
    }

    /// Slot `index` now holds an object reference.
    pub fn mark(&mut self, index: u32) {
        self.log.push(LogEntry::Mark(index));
    }

    /// Slot `index` no longer holds an object reference.
    pub fn clear(&mut self, index: u32) {
        self.log.push(LogEntry::Clear(index));
    }

    /// Open a handler context covering `[start, end)`; close it with [`Self::pop_context`].
    pub fn push_exception_handler(&mut self, start: u32, end: u32) {
        self.log.push(LogEntry::PushExceptionHandler { start, end });
    }

    /// Open a trace point for a call made at `ip`.
    pub fn trace(&mut self, ip: u32) -> TraceId {
        let id = TraceId(self.traces.len() as u32);
        self.traces.push(TraceElement {
            ip,
            map: RootMap::empty(self.map_size),
            watched: false,
            address: None,
            paths: Vec::new(),
        });
        self.log.push(LogEntry::Trace(id));
        id
    }

    /// Attach the call's return address; only the first report counts.
    pub fn handle_trace(&mut self, id: TraceId, address: PromiseId, argument_index: u32) {
        let element = &mut self.traces[id.0 as usize];
        if element.address.is_none() {
            element.address = Some((address, argument_index));
        }
    }

    /// Enter the subroutine at `ip` from a call site returning to `return_address`.
    pub fn start_subroutine(&mut self, ip: u32, return_address: PromiseId) -> PendingSubroutine {
        let region = match self.regions.iter().position(|r| r.ip == ip) {
            Some(index) => RegionId(index as u32),
            None => {
                self.regions.push(Region {
                    ip,
                    log_index: self.log.len() + 1,
                    stack_next: self.current_region,
                    calls: Vec::new(),
                    stack_index: 0,
                });
                RegionId(self.regions.len() as u32 - 1)
            }
        };
        self.current_region = Some(region);

        let call = CallSiteId(self.calls.len() as u32);
        self.calls.push(CallSite {
            region,
            return_address,
            paths: Vec::new(),
        });
        self.regions[region.0 as usize].calls.push(call);

        let entry = self.log.len();
        self.log.push(LogEntry::PushSubroutine { call, resume: 0 });
        PendingSubroutine { entry, region }
    }

    /// The current subroutine returns through the address kept in frame slot `stack_index`.
    pub fn return_from_subroutine(&mut self, stack_index: u32) {
        if let Some(region) = self.current_region {
            self.regions[region.0 as usize].stack_index = stack_index;
        }
    }

    pub fn end_subroutine(&mut self, pending: PendingSubroutine) {
        self.log.push(LogEntry::PopSubroutine);
        let resume = self.log.len();
        if let Some(LogEntry::PushSubroutine { resume: r, .. }) = self.log.get_mut(pending.entry) {
            *r = resume;
        }
        self.current_region = self.regions[pending.region.0 as usize].stack_next;
    }

    fn pass_bound(&self, config: &CompilerConfig) -> usize {
        let path_traces: usize = self.traces.iter().map(|t| t.paths.len()).sum();
        let tables = self.tables.len() * (1 + self.paths.len());
        let bound = 1 + self.map_size as usize * (tables + self.traces.len() + path_traces);
        match config.max_frame_map_passes {
            Some(cap) => bound.min(cap),
            None => bound,
        }
    }

    /// Replay the log until every map is stable. Returns the number of passes.
    pub fn solve(&mut self, config: &CompilerConfig) -> CompileResult<usize> {
        let mut passes = 0;
        loop {
            self.dirty = false;
            self.calculate(None, 0, None, None);
            passes += 1;
            if !self.dirty {
                break;
            }
            let bound = self.pass_bound(config);
            if passes >= bound {
                return Err(CompileError::FixedPointExceeded {
                    bound,
                    reason: format!(
                        "{} traces over {} slots still changing",
                        self.traces.len(),
                        self.map_size
                    ),
                });
            }
        }
        debug!(
            "frame maps stable after {} passes ({} traces, {} paths)",
            passes,
            self.traces.len(),
            self.paths.len()
        );
        Ok(passes)
    }

    /// Start a handler's roots from the maps of every trace in `[start, end)`.
    fn try_catch_roots(&mut self, path: Option<PathId>, start: u32, end: u32) -> RootMap {
        let mut roots = RootMap::full(self.map_size);
        for element in self.traces.iter_mut() {
            if element.ip < start || element.ip >= end {
                continue;
            }
            let map = match path {
                None => {
                    element.watched = true;
                    Some(&element.map)
                }
                Some(p) => element.paths.iter_mut().find(|t| t.path == p).map(|t| {
                    t.watched = true;
                    &t.map
                }),
            };
            if let Some(map) = map {
                roots.intersect(map);
            }
        }
        roots
    }

    fn table_mut(&mut self, path: Option<PathId>, ip: u32) -> &mut RootMap {
        match path {
            Some(p) => &mut self.paths[p.0 as usize].tables[ip as usize],
            None => &mut self.tables[ip as usize],
        }
    }

    fn find_or_create_path(&mut self, call: CallSiteId, outer: Option<PathId>) -> PathId {
        let existing = self.calls[call.0 as usize]
            .paths
            .iter()
            .copied()
            .find(|p| self.paths[p.0 as usize].stack_next == outer);
        if let Some(p) = existing {
            return p;
        }
        let id = PathId(self.paths.len() as u32);
        self.paths.push(Path {
            call,
            stack_next: outer,
            tables: vec![RootMap::full(self.map_size); self.tables.len()],
        });
        self.calls[call.0 as usize].paths.push(id);
        trace!("new subroutine path {:?} for call {:?}", id, call);
        id
    }

    fn record_trace(&mut self, id: TraceId, path: Option<PathId>, roots: &RootMap) {
        let element = &mut self.traces[id.0 as usize];
        let (map, watched) = match path {
            None => (&mut element.map, element.watched),
            Some(p) => {
                let index = match element.paths.iter().position(|t| t.path == p) {
                    Some(index) => index,
                    None => {
                        element.paths.push(PathTrace {
                            path: p,
                            map: RootMap::empty(self.map_size),
                            watched: false,
                        });
                        element.paths.len() - 1
                    }
                };
                let t = &mut element.paths[index];
                (&mut t.map, t.watched)
            }
        };
        let changed = watched && *map != *roots;
        map.clone_from(roots);
        if changed {
            trace!("watched trace {:?} changed", id);
            self.dirty = true;
        }
    }

    /// Replay from `index` until the enclosing context closes. Returns the index to resume
    /// at, or `None` when a subroutine body ended.
    fn calculate(
        &mut self,
        initial: Option<&RootMap>,
        mut index: usize,
        path: Option<PathId>,
        mut result: Option<&mut RootMap>,
    ) -> Option<usize> {
        let mut roots = initial
            .cloned()
            .unwrap_or_else(|| RootMap::empty(self.map_size));
        let mut ip: Option<u32> = None;
        let length = self.log.len();
        let mut next = Some(length);

        while index < length {
            let entry = self.log[index];
            index += 1;
            match entry {
                LogEntry::PushContext => {
                    match self.calculate(Some(&roots), index, path, result.as_deref_mut()) {
                        Some(i) => index = i,
                        None => {
                            next = None;
                            break;
                        }
                    }
                }
                LogEntry::PopContext => {
                    next = Some(index);
                    break;
                }
                LogEntry::Ip(at) => {
                    ip = Some(at);
                    let tail = index == length || self.log[index] == LogEntry::PopContext;
                    let revisited = self.visits[at as usize] > 1;
                    let table = self.table_mut(path, at);
                    if revisited {
                        let changed = table.intersect(&roots);
                        roots.intersect(table);
                        if changed && tail {
                            trace!("roots at ip {} changed after use", at);
                            self.dirty = true;
                        }
                    } else {
                        table.clone_from(&roots);
                    }
                }
                LogEntry::Mark(i) => roots.set(i),
                LogEntry::Clear(i) => roots.clear(i),
                LogEntry::PushExceptionHandler { start, end } => {
                    let resume = index;
                    let region = self.region_at.get(start as usize).copied().flatten();
                    match region {
                        Some(region) => {
                            let paths: Vec<PathId> = self.regions[region.0 as usize]
                                .calls
                                .iter()
                                .flat_map(|c| self.calls[c.0 as usize].paths.clone())
                                .collect();
                            for p in paths {
                                let handler_roots = self.try_catch_roots(Some(p), start, end);
                                let calculated =
                                    self.calculate(Some(&handler_roots), resume, Some(p), None);
                                if let Some(i) = calculated {
                                    index = i;
                                }
                            }
                        }
                        None => {
                            let handler_roots = self.try_catch_roots(None, start, end);
                            let calculated =
                                self.calculate(Some(&handler_roots), resume, None, None);
                            if let Some(i) = calculated {
                                index = i;
                            }
                        }
                    }
                }
                LogEntry::Trace(id) => self.record_trace(id, path, &roots),
                LogEntry::PushSubroutine { call, resume } => {
                    index = resume;
                    let inner = self.find_or_create_path(call, path);
                    let region = self.calls[call.0 as usize].region;
                    let body = self.regions[region.0 as usize].log_index;
                    let mut subroutine_roots = RootMap::full(self.map_size);
                    self.calculate(Some(&roots), body, Some(inner), Some(&mut subroutine_roots));
                    roots.intersect(&subroutine_roots);
                }
                LogEntry::PopSubroutine => {
                    next = None;
                    break;
                }
            }
        }

        if let (Some(out), Some(_)) = (result, ip) {
            out.clone_from(&roots);
        }
        next
    }

    /// Lay the solved maps out as a table keyed by offsets from `base`.
    pub fn build_table(&self, promises: &PromiseTable, base: i64) -> CompileResult<FrameMapTable> {
        table::build(self, promises, base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve(log: &mut FrameMapLog) -> usize {
        log.solve(&CompilerConfig::default()).unwrap()
    }

    #[test]
    fn test_root_map_bits() {
        let mut map = RootMap::empty(70);
        map.set(3);
        map.set(69);
        assert!(map.get(3) && map.get(69));
        assert!(!map.get(4));
        map.clear(3);
        assert!(!map.get(3));

        let mut full = RootMap::full(70);
        assert!(full.intersect(&map));
        assert!(!full.intersect(&map));
        assert!(full.get(69) && !full.get(0));
    }

    #[test]
    fn test_straight_line_trace() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut log = FrameMapLog::new(4, 3);
        assert!(log.visit(0).unwrap());
        log.mark(0);
        log.mark(2);
        let t = log.trace(0);
        log.clear(2);
        assert!(log.visit(1).unwrap());
        let u = log.trace(1);

        assert_eq!(solve(&mut log), 1);
        let first = &log.trace_element(t).map;
        assert!(first.get(0) && first.get(2) && !first.get(1));
        let second = &log.trace_element(u).map;
        assert!(second.get(0) && !second.get(2));
    }

    #[test]
    fn test_join_intersects_paths() {
        let _ = env_logger::builder().is_test(true).try_init();
        // 0: branch to 2; fall through to 1 which clears slot 1; 2 joins
        let mut log = FrameMapLog::new(3, 2);
        log.visit(0).unwrap();
        log.mark(0);
        log.mark(1);

        log.push_context();
        assert!(log.visit(2).unwrap());
        let t = log.trace(2);
        log.pop_context();

        log.visit(1).unwrap();
        log.clear(1);
        assert!(!log.visit(2).unwrap());

        let passes = solve(&mut log);
        // the second arrival at 2 cleared slot 1 after the trace had been recorded
        assert_eq!(passes, 2);
        let map = &log.trace_element(t).map;
        assert!(map.get(0));
        assert!(!map.get(1));
        assert_eq!(log.visit_count(2), 2);
    }

    #[test]
    fn test_handler_uses_roots_common_to_range() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut log = FrameMapLog::new(6, 2);
        log.visit(0).unwrap();
        log.mark(0);
        log.mark(1);
        log.trace(0);
        log.visit(1).unwrap();
        log.clear(1);
        log.trace(1);

        log.push_exception_handler(0, 2);
        log.visit(5).unwrap();
        let handler = log.trace(5);
        log.pop_context();

        solve(&mut log);
        let map = &log.trace_element(handler).map;
        assert!(map.get(0));
        assert!(!map.get(1));
    }

    #[test]
    fn test_solving_is_idempotent() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut log = FrameMapLog::new(3, 2);
        log.visit(0).unwrap();
        log.mark(0);
        log.push_context();
        log.visit(2).unwrap();
        let t = log.trace(2);
        log.pop_context();
        log.visit(1).unwrap();
        log.clear(0);
        log.visit(2).unwrap();

        solve(&mut log);
        let before = log.trace_element(t).map.clone();
        assert_eq!(solve(&mut log), 1);
        assert_eq!(log.trace_element(t).map, before);
    }

    #[test]
    fn test_subroutine_paths_keep_separate_maps() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut promises = PromiseTable::new();
        let first_return = promises.resolved(0x10);
        let second_return = promises.resolved(0x20);

        let mut log = FrameMapLog::new(8, 2);
        log.visit(0).unwrap();
        log.mark(0);
        let pending = log.start_subroutine(6, first_return);
        log.visit(6).unwrap();
        let inner = log.trace(6);
        log.return_from_subroutine(1);
        log.end_subroutine(pending);

        log.visit(1).unwrap();
        log.clear(0);
        let pending = log.start_subroutine(6, second_return);
        log.visit(6).unwrap();
        log.end_subroutine(pending);

        solve(&mut log);
        let element = log.trace_element(inner);
        assert_eq!(element.paths.len(), 2);
        let maps: Vec<bool> = element.paths.iter().map(|p| p.map.get(0)).collect();
        assert_eq!(maps, vec![true, false]);
    }

    #[test]
    fn test_pass_cap_is_enforced() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut log = FrameMapLog::new(3, 2);
        log.visit(0).unwrap();
        log.mark(1);
        log.push_context();
        log.visit(2).unwrap();
        log.trace(2);
        log.pop_context();
        log.visit(1).unwrap();
        log.clear(1);
        log.visit(2).unwrap();

        let config = CompilerConfig::default().with_max_frame_map_passes(1);
        assert!(matches!(
            log.solve(&config),
            Err(CompileError::FixedPointExceeded { bound: 1, .. })
        ));
    }
}
