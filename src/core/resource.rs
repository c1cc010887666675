//! Physical registers and frame slots.
//!
//! A resource is owned by at most one value (through one of its sites) at a time. Reference
//! counts cover shared, non-exclusive use such as the base register of a memory operand;
//! freeze counts forbid stealing while an operation is being emitted. The table tracks how
//! many general registers are still usable so target selection can penalize scarcity.

use crate::core::site::SiteId;
use crate::core::value::ValueId;

/// Target-selection costs.
pub mod target_cost {
    pub const MINIMUM_REGISTER: u32 = 0;
    pub const MINIMUM_FRAME: u32 = 1;
    pub const STEAL: u32 = 2;
    pub const STEAL_UNIQUE: u32 = 4;
    pub const INDIRECT_MOVE: u32 = 4;
    pub const LOW_REGISTER: u32 = 10;
    pub const IMPOSSIBLE: u32 = 20;
}

/// A register or a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Register(u8),
    Frame(u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resource {
    pub owner: Option<(ValueId, SiteId)>,
    pub freeze_count: u32,
    pub reference_count: u32,
    pub reserved: bool,
}

impl Resource {
    /// Whether nothing may take this resource right now.
    pub fn unavailable(&self) -> bool {
        self.reserved || self.freeze_count > 0 || self.reference_count > 0
    }
}

/// Register and frame-slot resources of one compilation.
#[derive(Debug, Clone)]
pub struct ResourceTable {
    registers: Vec<Resource>,
    frames: Vec<Resource>,
    general_mask: u64,
    available_general: u32,
}

impl ResourceTable {
    pub fn new(register_count: u32, general_mask: u64, reserved: impl Fn(u8) -> bool) -> Self {
        let mut available_general = 0;
        let registers = (0..register_count as u8)
            .map(|r| {
                let reserved = reserved(r);
                if !reserved && general_mask & (1 << r) != 0 {
                    available_general += 1;
                }
                Resource {
                    reserved,
                    ..Resource::default()
                }
            })
            .collect();
        Self {
            registers,
            frames: Vec::new(),
            general_mask,
            available_general,
        }
    }

    /// Size the frame table; `reserved` lists slots nothing may be placed in.
    pub fn init_frame(&mut self, slots: u32, reserved: &[u32]) {
        self.frames = vec![Resource::default(); slots as usize];
        for &slot in reserved {
            if let Some(r) = self.frames.get_mut(slot as usize) {
                r.reserved = true;
            }
        }
    }

    pub fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn available_general_registers(&self) -> u32 {
        self.available_general
    }

    pub fn get(&self, id: ResourceId) -> &Resource {
        match id {
            ResourceId::Register(r) => &self.registers[r as usize],
            ResourceId::Frame(f) => &self.frames[f as usize],
        }
    }

    pub fn get_mut(&mut self, id: ResourceId) -> &mut Resource {
        match id {
            ResourceId::Register(r) => &mut self.registers[r as usize],
            ResourceId::Frame(f) => &mut self.frames[f as usize],
        }
    }

    fn is_general(&self, id: ResourceId) -> bool {
        matches!(id, ResourceId::Register(r) if self.general_mask & (1 << r) != 0)
    }

    pub fn increment(&mut self, id: ResourceId) {
        let general = self.is_general(id);
        let r = self.get_mut(id);
        if r.reserved {
            return;
        }
        r.reference_count += 1;
        if r.reference_count == 1 && general {
            self.available_general -= 1;
        }
    }

    pub fn decrement(&mut self, id: ResourceId) {
        let general = self.is_general(id);
        let r = self.get_mut(id);
        if r.reserved {
            return;
        }
        debug_assert!(r.reference_count > 0, "unbalanced decrement of {:?}", id);
        r.reference_count = r.reference_count.saturating_sub(1);
        if r.reference_count == 0 && general {
            self.available_general += 1;
        }
    }

    pub fn freeze(&mut self, id: ResourceId) {
        let general = self.is_general(id);
        let r = self.get_mut(id);
        if r.reserved {
            return;
        }
        r.freeze_count += 1;
        if r.freeze_count == 1 && general {
            self.available_general -= 1;
        }
    }

    pub fn thaw(&mut self, id: ResourceId) {
        let general = self.is_general(id);
        let r = self.get_mut(id);
        if r.reserved {
            return;
        }
        debug_assert!(r.freeze_count > 0, "unbalanced thaw of {:?}", id);
        r.freeze_count = r.freeze_count.saturating_sub(1);
        if r.freeze_count == 0 && general {
            self.available_general += 1;
        }
    }

    /// Frame slots and registers with a current owner.
    pub fn owned(&self) -> impl Iterator<Item = (ResourceId, (ValueId, SiteId))> + '_ {
        let registers = self
            .registers
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.owner.map(|o| (ResourceId::Register(i as u8), o)));
        let frames = self
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.owner.map(|o| (ResourceId::Frame(i as u32), o)));
        registers.chain(frames)
    }

    /// Whether any resource is still frozen or referenced.
    pub fn all_released(&self) -> bool {
        self.registers
            .iter()
            .chain(self.frames.iter())
            .all(|r| r.reserved || (r.freeze_count == 0 && r.reference_count == 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ResourceTable {
        // four general registers, register 3 reserved, two float registers
        ResourceTable::new(6, 0b001111, |r| r == 3)
    }

    #[test]
    fn test_available_count_tracks_freeze_and_references() {
        let mut t = table();
        assert_eq!(t.available_general_registers(), 3);

        t.freeze(ResourceId::Register(0));
        t.freeze(ResourceId::Register(0));
        assert_eq!(t.available_general_registers(), 2);
        t.thaw(ResourceId::Register(0));
        assert_eq!(t.available_general_registers(), 2);
        t.thaw(ResourceId::Register(0));
        assert_eq!(t.available_general_registers(), 3);

        t.increment(ResourceId::Register(1));
        assert_eq!(t.available_general_registers(), 2);
        t.decrement(ResourceId::Register(1));
        assert_eq!(t.available_general_registers(), 3);

        // float registers and reserved registers do not count
        t.freeze(ResourceId::Register(4));
        t.freeze(ResourceId::Register(3));
        assert_eq!(t.available_general_registers(), 3);
        assert!(!t.all_released());
    }

    #[test]
    fn test_reserved_frame_slots() {
        let mut t = table();
        t.init_frame(4, &[2, 3]);
        assert_eq!(t.frame_count(), 4);
        assert!(t.get(ResourceId::Frame(2)).unavailable());
        assert!(!t.get(ResourceId::Frame(1)).unavailable());
        assert!(t.all_released());
    }
}
