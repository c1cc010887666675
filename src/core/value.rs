//! Logical operands.
//!
//! A value owns a list of sites and a chain of pending reads. Values that are bit-identical
//! without a copy form a circular buddy ring: they share liveness, and a value stays live as
//! long as any member of its ring still has a valid read.

use crate::core::read::ReadId;
use crate::core::site::SiteId;

/// Index of a value in the per-compile value table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Register class of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    General,
    Float,
}

#[derive(Debug, Clone)]
pub struct ValueData {
    /// Head of the pending read chain.
    pub reads: Option<ReadId>,
    /// Tail of the read chain, where new reads are appended.
    pub last_read: Option<ReadId>,
    /// Owned sites, most recently added first.
    pub sites: Vec<SiteId>,
    /// Site chosen for the current event's read.
    pub source: Option<SiteId>,
    /// Preferred destination, if fixed at creation.
    pub target: Option<SiteId>,
    /// Next member of the buddy ring; a lone value points at itself.
    pub buddy: ValueId,
    /// Frame slot backing this value once it is a stack slot or local.
    pub home: Option<u32>,
    pub value_type: ValueType,
}

impl ValueData {
    pub fn new(id: ValueId, value_type: ValueType) -> Self {
        Self {
            reads: None,
            last_read: None,
            sites: Vec::new(),
            source: None,
            target: None,
            buddy: id,
            home: None,
            value_type,
        }
    }
}
