// Sites are candidate physical locations for a value: a constant, an absolute address, a
// register (possibly not yet chosen, only constrained by a mask) or a memory operand, of
// which frame slots are the stack-pointer based special case. A site is not owned by the
// resource it occupies; it acquires and releases the resource when it is added to or removed
// from a value. This module holds the pure parts: the tagged site kinds, location masks and
// their intersection, matching against masks and the copy cost model used to rank sources.

//! Candidate locations and location masks.

use crate::core::promise::PromiseId;
use crate::target::{OperandMask, OperandType, ANY_TYPE, WORD};

/// Index of a site in the per-compile site table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub(crate) u32);

/// Cost of copying a value from one kind of site.
pub mod copy_cost {
    pub const REGISTER: u32 = 1;
    pub const ADDRESS: u32 = 2;
    pub const CONSTANT: u32 = 3;
    pub const MEMORY: u32 = 4;
    /// Added to a source that cannot feed the destination directly.
    pub const PENALTY: u32 = 10;
}

/// Frame-slot constraint of a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSlot {
    /// Any frame slot is acceptable.
    Any,
    /// No frame slot is acceptable.
    None,
    Index(u32),
}

impl FrameSlot {
    fn intersect(self, other: FrameSlot) -> FrameSlot {
        match (self, other) {
            (FrameSlot::None, _) | (_, FrameSlot::None) => FrameSlot::None,
            (FrameSlot::Any, o) | (o, FrameSlot::Any) => o,
            (FrameSlot::Index(a), FrameSlot::Index(b)) if a == b => FrameSlot::Index(a),
            _ => FrameSlot::None,
        }
    }
}

/// Acceptable locations for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteMask {
    pub type_mask: u8,
    pub register_mask: u64,
    pub frame: FrameSlot,
}

impl SiteMask {
    pub const fn new(type_mask: u8, register_mask: u64, frame: FrameSlot) -> Self {
        Self {
            type_mask,
            register_mask,
            frame,
        }
    }

    pub const fn any() -> Self {
        Self::new(ANY_TYPE, u64::MAX, FrameSlot::Any)
    }

    pub fn from_operand(mask: OperandMask) -> Self {
        Self::new(mask.type_mask, mask.register_mask, FrameSlot::Any)
    }

    pub fn fixed_register(register: u8) -> Self {
        Self::new(OperandType::Register.bit(), 1 << register, FrameSlot::None)
    }

    pub fn fixed_frame(index: u32) -> Self {
        Self::new(OperandType::Memory.bit(), 0, FrameSlot::Index(index))
    }

    pub fn intersect(self, other: SiteMask) -> SiteMask {
        SiteMask {
            type_mask: self.type_mask & other.type_mask,
            register_mask: self.register_mask & other.register_mask,
            frame: self.frame.intersect(other.frame),
        }
    }

    pub fn accepts(&self, kind: OperandType) -> bool {
        self.type_mask & kind.bit() != 0
    }
}

/// Stack-pointer and frame-footer facts needed to relate memory sites to frame slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub stack: u8,
    pub footer: u32,
}

impl FrameGeometry {
    pub fn frame_index_to_offset(&self, index: u32) -> i32 {
        ((index + self.footer) * WORD) as i32
    }

    pub fn offset_to_frame_index(&self, offset: i32) -> u32 {
        (offset as u32 / WORD) - self.footer
    }
}

/// A candidate location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Constant(PromiseId),
    Address(PromiseId),
    Register {
        mask: u64,
        number: Option<u8>,
    },
    Memory {
        base: u8,
        offset: i32,
        index: Option<u8>,
        scale: u8,
        acquired: bool,
    },
}

impl Site {
    pub fn register(number: u8) -> Self {
        Site::Register {
            mask: 1 << number,
            number: Some(number),
        }
    }

    pub fn free_register(mask: u64) -> Self {
        Site::Register { mask, number: None }
    }

    pub fn memory(base: u8, offset: i32, index: Option<u8>, scale: u8) -> Self {
        Site::Memory {
            base,
            offset,
            index,
            scale,
            acquired: false,
        }
    }

    pub fn frame(geometry: &FrameGeometry, index: u32) -> Self {
        Site::memory(geometry.stack, geometry.frame_index_to_offset(index), None, 1)
    }

    pub fn operand_type(&self) -> OperandType {
        match self {
            Site::Constant(_) => OperandType::Constant,
            Site::Address(_) => OperandType::Address,
            Site::Register { .. } => OperandType::Register,
            Site::Memory { .. } => OperandType::Memory,
        }
    }

    /// Single-bit mask of the chosen register, or zero.
    pub fn register_mask(&self) -> u64 {
        match self {
            Site::Register {
                number: Some(n), ..
            } => 1 << n,
            _ => 0,
        }
    }

    pub fn register_number(&self) -> Option<u8> {
        match self {
            Site::Register { number, .. } => *number,
            _ => None,
        }
    }

    /// Frame slot of a stack-based memory site.
    pub fn frame_index(&self, geometry: &FrameGeometry) -> Option<u32> {
        match *self {
            Site::Memory {
                base,
                offset,
                index: None,
                ..
            } if base == geometry.stack => Some(geometry.offset_to_frame_index(offset)),
            _ => None,
        }
    }

    /// Memory not based on the stack pointer may change behind the allocator's back.
    pub fn is_volatile(&self, geometry: &FrameGeometry) -> bool {
        matches!(self, Site::Memory { base, .. } if *base != geometry.stack)
    }

    pub fn copy_cost(&self, other: Option<&Site>) -> u32 {
        match self {
            Site::Constant(promise) => match other {
                Some(Site::Constant(p)) if p == promise => 0,
                _ => copy_cost::CONSTANT,
            },
            Site::Address(promise) => match other {
                Some(Site::Address(p)) if p == promise => 0,
                _ => copy_cost::ADDRESS,
            },
            Site::Register { number, .. } => match (number, other) {
                (Some(n), Some(Site::Register { mask, .. })) if mask & (1 << n) != 0 => 0,
                _ => copy_cost::REGISTER,
            },
            Site::Memory {
                base,
                offset,
                index,
                scale,
                ..
            } => match other {
                Some(Site::Memory {
                    base: b,
                    offset: o,
                    index: i,
                    scale: s,
                    ..
                }) if b == base && o == offset && i == index && s == scale => 0,
                _ => copy_cost::MEMORY,
            },
        }
    }

    pub fn matches(&self, mask: &SiteMask, geometry: &FrameGeometry) -> bool {
        match self {
            Site::Constant(_) => mask.accepts(OperandType::Constant),
            Site::Address(_) => mask.accepts(OperandType::Address),
            Site::Register { number, .. } => match number {
                Some(n) => {
                    mask.accepts(OperandType::Register) && mask.register_mask & (1 << n) != 0
                }
                None => false,
            },
            Site::Memory { base, offset, .. } => {
                if !mask.accepts(OperandType::Memory) {
                    return false;
                }
                match mask.frame {
                    FrameSlot::Any => true,
                    FrameSlot::None => false,
                    FrameSlot::Index(i) => {
                        *base == geometry.stack && *offset == geometry.frame_index_to_offset(i)
                    }
                }
            }
        }
    }

    /// Whether this site is the only location `mask` admits.
    pub fn lone_match(&self, mask: &SiteMask, geometry: &FrameGeometry) -> bool {
        match self {
            Site::Constant(_) => true,
            Site::Address(_) => false,
            Site::Register { number, .. } => match number {
                Some(n) => mask.register_mask == 1 << n,
                None => false,
            },
            Site::Memory { base, .. } => {
                *base == geometry.stack && mask.frame != FrameSlot::Any
            }
        }
    }

    /// The most precise mask this site satisfies.
    pub fn mask(&self, geometry: &FrameGeometry) -> SiteMask {
        match self {
            Site::Constant(_) => SiteMask::new(OperandType::Constant.bit(), 0, FrameSlot::None),
            Site::Address(_) => SiteMask::new(OperandType::Address.bit(), 0, FrameSlot::None),
            Site::Register { mask, number } => {
                let registers = number.map(|n| 1u64 << n).unwrap_or(*mask);
                SiteMask::new(OperandType::Register.bit(), registers, FrameSlot::None)
            }
            Site::Memory { .. } => match self.frame_index(geometry) {
                Some(i) => SiteMask::new(OperandType::Memory.bit(), 0, FrameSlot::Index(i)),
                None => SiteMask::new(OperandType::Memory.bit(), 0, FrameSlot::Any),
            },
        }
    }

    /// A fresh, unacquired site for the same location.
    pub fn copy(&self) -> Site {
        match *self {
            Site::Register {
                number: Some(n), ..
            } => Site::free_register(1 << n),
            Site::Memory {
                base,
                offset,
                index,
                scale,
                ..
            } => Site::memory(base, offset, index, scale),
            other => other,
        }
    }
}
