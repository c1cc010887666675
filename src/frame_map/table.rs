//! Frame-map tables as the collector's stack walker reads them.
//!
//! Methods without subroutines get a flat table: return-address offsets sorted ascending, and
//! one packed bitmap per offset. Otherwise every entry also names the innermost subroutine
//! path record; the walker reads the return address each record's frame slot holds, finds its
//! position among the record's call sites and combines the positions of the whole chain into
//! an index among the entry's bitmaps.

use super::{FrameMapLog, PathId, RegionId, RootMap};
use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::{PromiseId, PromiseTable};
use hashbrown::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatTable {
    pub map_size: u32,
    /// Return-address offsets from the code start, ascending.
    pub offsets: Vec<i32>,
    /// Bitmap `i` starts at bit `i * map_size`.
    pub bits: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub offset: i32,
    /// First bit of this entry's bitmaps.
    pub base: u32,
    /// Innermost path record, for entries inside subroutines.
    pub path: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    /// Frame slot holding the subroutine's return address.
    pub stack_index: u32,
    /// Offsets of every call site's return address, ascending.
    pub return_addresses: Vec<i32>,
    /// Record of the enclosing subroutine.
    pub next: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTable {
    pub map_size: u32,
    pub entries: Vec<TableEntry>,
    pub bits: Vec<u32>,
    pub paths: Vec<PathRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameMapTable {
    Flat(FlatTable),
    Paths(PathTable),
}

fn get_bit(bits: &[u32], index: u32) -> bool {
    bits.get(index as usize / 32)
        .is_some_and(|w| w & (1 << (index % 32)) != 0)
}

fn set_bit(bits: &mut [u32], index: u32, value: bool) {
    if let Some(w) = bits.get_mut(index as usize / 32) {
        if value {
            *w |= 1 << (index % 32);
        } else {
            *w &= !(1 << (index % 32));
        }
    }
}

/// Only the slots below the call's own arguments are reported.
fn copy_map(bits: &mut [u32], start: u32, map: &RootMap, map_size: u32, argument_index: u32) {
    for j in 0..argument_index.min(map_size) {
        set_bit(bits, start + j, map.get(j));
    }
}

fn unpack(bits: &[u32], start: u32, map_size: u32) -> Vec<bool> {
    (0..map_size).map(|j| get_bit(bits, start + j)).collect()
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

impl FrameMapTable {
    pub fn map_size(&self) -> u32 {
        match self {
            FrameMapTable::Flat(t) => t.map_size,
            FrameMapTable::Paths(t) => t.map_size,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FrameMapTable::Flat(t) => t.offsets.len(),
            FrameMapTable::Paths(t) => t.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Roots at return-address `offset`. `stack` yields the return-address offset stored in
    /// a frame slot and is only consulted inside subroutines.
    pub fn roots(&self, offset: i32, stack: &dyn Fn(u32) -> Option<i32>) -> Option<Vec<bool>> {
        match self {
            FrameMapTable::Flat(t) => {
                let i = t.offsets.binary_search(&offset).ok()?;
                Some(unpack(&t.bits, i as u32 * t.map_size, t.map_size))
            }
            FrameMapTable::Paths(t) => {
                let i = t.entries.binary_search_by_key(&offset, |e| e.offset).ok()?;
                let entry = t.entries[i];
                let index = match entry.path {
                    Some(p) => t.path_index(p, stack)?,
                    None => 0,
                };
                Some(unpack(&t.bits, entry.base + index * t.map_size, t.map_size))
            }
        }
    }

    /// Little-endian serialization.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            FrameMapTable::Flat(t) => {
                push_u32(&mut out, 0);
                push_u32(&mut out, t.map_size);
                push_u32(&mut out, t.offsets.len() as u32);
                for &offset in &t.offsets {
                    out.extend_from_slice(&offset.to_le_bytes());
                }
                for &word in &t.bits {
                    push_u32(&mut out, word);
                }
            }
            FrameMapTable::Paths(t) => {
                push_u32(&mut out, 1);
                push_u32(&mut out, t.map_size);
                push_u32(&mut out, t.entries.len() as u32);
                for e in &t.entries {
                    out.extend_from_slice(&e.offset.to_le_bytes());
                    push_u32(&mut out, e.base);
                    push_u32(&mut out, e.path.map_or(0, |p| p + 1));
                }
                push_u32(&mut out, t.bits.len() as u32);
                for &word in &t.bits {
                    push_u32(&mut out, word);
                }
                for record in &t.paths {
                    push_u32(&mut out, record.stack_index);
                    push_u32(&mut out, record.return_addresses.len() as u32);
                    push_u32(&mut out, record.next.map_or(0, |n| n + 1));
                    for &address in &record.return_addresses {
                        out.extend_from_slice(&address.to_le_bytes());
                    }
                }
            }
        }
        out
    }
}

impl PathTable {
    fn path_index(&self, record: u32, stack: &dyn Fn(u32) -> Option<i32>) -> Option<u32> {
        let record = self.paths.get(record as usize)?;
        let address = stack(record.stack_index)?;
        let position = record.return_addresses.iter().position(|&a| a == address)? as u32;
        let outer = match record.next {
            Some(next) => self.path_index(next, stack)?,
            None => 0,
        };
        Some(position + record.return_addresses.len() as u32 * outer)
    }
}

fn code_offset(promises: &PromiseTable, p: PromiseId, base: i64) -> CompileResult<i32> {
    let value = promises.value(p).ok_or_else(|| CompileError::Unresolved {
        reason: format!("frame-map address {:?} was never resolved", p),
    })?;
    i32::try_from(value - base).map_err(|_| CompileError::Unresolved {
        reason: format!("frame-map address {:#x} is outside the method", value),
    })
}

struct Builder<'l> {
    log: &'l FrameMapLog,
    promises: &'l PromiseTable,
    base: i64,
    records: HashMap<RegionId, u32>,
    paths: Vec<PathRecord>,
}

impl Builder<'_> {
    fn record_for(&mut self, region: RegionId) -> CompileResult<u32> {
        if let Some(&record) = self.records.get(&region) {
            return Ok(record);
        }
        let data = &self.log.regions[region.0 as usize];
        let next = match data.stack_next {
            Some(outer) => Some(self.record_for(outer)?),
            None => None,
        };
        let mut return_addresses = data
            .calls
            .iter()
            .map(|c| {
                let return_address = self.log.calls[c.0 as usize].return_address;
                code_offset(self.promises, return_address, self.base)
            })
            .collect::<CompileResult<Vec<_>>>()?;
        return_addresses.sort_unstable();

        let record = self.paths.len() as u32;
        self.paths.push(PathRecord {
            stack_index: data.stack_index,
            return_addresses,
            next,
        });
        self.records.insert(region, record);
        Ok(record)
    }

    /// Return addresses of a path, outermost call first.
    fn path_key(&self, path: PathId) -> CompileResult<Vec<i32>> {
        let mut key = Vec::new();
        let mut cursor = Some(path);
        while let Some(p) = cursor {
            let data = &self.log.paths[p.0 as usize];
            let call = &self.log.calls[data.call.0 as usize];
            key.push(code_offset(self.promises, call.return_address, self.base)?);
            cursor = data.stack_next;
        }
        key.reverse();
        Ok(key)
    }
}

pub(super) fn build(
    log: &FrameMapLog,
    promises: &PromiseTable,
    base: i64,
) -> CompileResult<FrameMapTable> {
    let map_size = log.map_size;
    let mut elements = Vec::new();
    for element in &log.traces {
        if let Some((address, argument_index)) = element.address {
            elements.push((code_offset(promises, address, base)?, argument_index, element));
        }
    }
    elements.sort_by_key(|(offset, _, _)| *offset);

    if elements.iter().all(|(_, _, e)| e.paths.is_empty()) {
        let total = elements.len() as u32 * map_size;
        let mut bits = vec![0u32; total.div_ceil(32) as usize];
        for (i, (_, argument_index, element)) in elements.iter().enumerate() {
            copy_map(&mut bits, i as u32 * map_size, &element.map, map_size, *argument_index);
        }
        return Ok(FrameMapTable::Flat(FlatTable {
            map_size,
            offsets: elements.iter().map(|(offset, _, _)| *offset).collect(),
            bits,
        }));
    }

    let mut builder = Builder {
        log,
        promises,
        base,
        records: HashMap::new(),
        paths: Vec::new(),
    };
    let map_count: usize = elements
        .iter()
        .map(|(_, _, e)| e.paths.len().max(1))
        .sum();
    let mut bits = vec![0u32; (map_count as u32 * map_size).div_ceil(32) as usize];
    let mut entries = Vec::with_capacity(elements.len());
    let mut next_map = 0u32;

    for (offset, argument_index, element) in &elements {
        let map_base = next_map;
        let path = match element.paths.first() {
            Some(first) => {
                let region = log.calls[log.paths[first.path.0 as usize].call.0 as usize].region;
                let record = builder.record_for(region)?;

                let mut keyed = element
                    .paths
                    .iter()
                    .map(|t| Ok((builder.path_key(t.path)?, t)))
                    .collect::<CompileResult<Vec<_>>>()?;
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                for (_, t) in keyed {
                    copy_map(&mut bits, next_map, &t.map, map_size, *argument_index);
                    next_map += map_size;
                }
                Some(record)
            }
            None => {
                copy_map(&mut bits, next_map, &element.map, map_size, *argument_index);
                next_map += map_size;
                None
            }
        };
        entries.push(TableEntry {
            offset: *offset,
            base: map_base,
            path,
        });
    }

    Ok(FrameMapTable::Paths(PathTable {
        map_size,
        entries,
        bits,
        paths: builder.paths,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CompilerConfig;

    fn straight_line(promises: &mut PromiseTable) -> FrameMapLog {
        let mut log = FrameMapLog::new(2, 3);
        log.visit(0).unwrap();
        log.mark(0);
        log.mark(1);
        let late = log.trace(0);
        log.visit(1).unwrap();
        log.clear(1);
        let early = log.trace(1);

        // the second call is laid out first
        let late_address = promises.resolved(0x1040);
        let early_address = promises.resolved(0x1010);
        log.handle_trace(late, late_address, 3);
        log.handle_trace(early, early_address, 1);
        log
    }

    #[test]
    fn test_flat_table_sorted_by_offset() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut promises = PromiseTable::new();
        let mut log = straight_line(&mut promises);
        log.solve(&CompilerConfig::default()).unwrap();
        let table = log.build_table(&promises, 0x1000).unwrap();

        let FrameMapTable::Flat(flat) = &table else {
            panic!("expected a flat table");
        };
        assert_eq!(flat.offsets, vec![0x10, 0x40]);

        let none = |_: u32| None::<i32>;
        // only slots below the argument index are reported
        assert_eq!(table.roots(0x10, &none), Some(vec![true, false, false]));
        assert_eq!(table.roots(0x40, &none), Some(vec![true, true, false]));
        assert_eq!(table.roots(0x20, &none), None);
    }

    #[test]
    fn test_encoding_is_stable() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut promises = PromiseTable::new();
        let mut log = straight_line(&mut promises);
        let config = CompilerConfig::default();
        log.solve(&config).unwrap();
        let first = log.build_table(&promises, 0x1000).unwrap().encode();
        log.solve(&config).unwrap();
        let second = log.build_table(&promises, 0x1000).unwrap().encode();
        assert_eq!(first, second);
        assert_eq!(&first[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_path_table_selects_map_by_return_address() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut promises = PromiseTable::new();
        let first_return = promises.resolved(0x2008);
        let second_return = promises.resolved(0x2030);
        let call_address = promises.resolved(0x2050);

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
        log.handle_trace(inner, call_address, 2);

        log.solve(&CompilerConfig::default()).unwrap();
        let table = log.build_table(&promises, 0x2000).unwrap();
        let FrameMapTable::Paths(paths) = &table else {
            panic!("expected a path table");
        };
        assert_eq!(paths.paths.len(), 1);
        assert_eq!(paths.paths[0].return_addresses, vec![0x08, 0x30]);
        assert_eq!(paths.paths[0].stack_index, 1);

        let from_first = |slot: u32| (slot == 1).then_some(0x08_i32);
        let from_second = |slot: u32| (slot == 1).then_some(0x30_i32);
        assert_eq!(table.roots(0x50, &from_first), Some(vec![true, false]));
        assert_eq!(table.roots(0x50, &from_second), Some(vec![false, false]));
        assert_eq!(&table.encode()[..4], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_unresolved_address_is_reported() {
        let mut promises = PromiseTable::new();
        let mut log = FrameMapLog::new(1, 1);
        log.visit(0).unwrap();
        let t = log.trace(0);
        let pending = promises.create(crate::core::promise::PromiseKind::Code);
        log.handle_trace(t, pending, 1);
        log.solve(&CompilerConfig::default()).unwrap();
        assert!(matches!(
            log.build_table(&promises, 0),
            Err(CompileError::Unresolved { .. })
        ));
    }
}
