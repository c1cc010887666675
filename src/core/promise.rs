// Promises are lazily resolved integers: mostly future machine addresses that only become
// known once emission has finished and the code has a base address. A promise is either
// resolved up front (a plain constant), tied to the machine address of a logical instruction,
// tied to a code position bound inside or at the end of an event, or tied to a constant-pool
// entry. Unresolved promises accept listeners which fire exactly once when the compiler
// resolves the whole table after layout.

//! Lazily resolved integers with deferred listeners.

use crate::core::error::{CompileError, CompileResult};
use hashbrown::HashMap;

/// Index of a promise in the per-compile promise table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub(crate) u32);

/// A position in the emitted code that emitters bind labels to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CodeTarget {
    /// Start of a logical instruction.
    Ip(u32),
    /// A point bound for a code promise.
    Promise(PromiseId),
}

/// How a promise obtains its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseKind {
    Resolved(i64),
    /// Machine address of a logical instruction.
    MachineIp(u32),
    /// Machine address of the code position bound as `CodeTarget::Promise(self)`.
    Code,
    /// Address of a constant-pool slot.
    Pool(u32),
}

/// Layout facts needed to resolve code-relative promises.
#[derive(Debug, Clone)]
pub struct CodeLayout {
    pub base: i64,
    pub code_size: usize,
    pub targets: HashMap<CodeTarget, u32>,
}

impl CodeLayout {
    /// Offset of the first constant-pool slot; the pool follows the code, word aligned.
    pub fn pool_offset(&self) -> usize {
        (self.code_size + 7) & !7
    }
}

type Listener = Box<dyn FnMut(i64)>;

struct Promise {
    kind: PromiseKind,
    value: Option<i64>,
    listeners: Vec<Listener>,
}

/// All promises created during one compilation.
#[derive(Default)]
pub struct PromiseTable {
    promises: Vec<Promise>,
}

impl PromiseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, kind: PromiseKind) -> PromiseId {
        let value = match kind {
            PromiseKind::Resolved(v) => Some(v),
            _ => None,
        };
        self.promises.push(Promise {
            kind,
            value,
            listeners: Vec::new(),
        });
        PromiseId(self.promises.len() as u32 - 1)
    }

    pub fn resolved(&mut self, value: i64) -> PromiseId {
        self.create(PromiseKind::Resolved(value))
    }

    pub fn kind(&self, id: PromiseId) -> PromiseKind {
        self.promises[id.0 as usize].kind
    }

    pub fn is_resolved(&self, id: PromiseId) -> bool {
        self.promises[id.0 as usize].value.is_some()
    }

    pub fn value(&self, id: PromiseId) -> Option<i64> {
        self.promises[id.0 as usize].value
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }

    /// Run `listener` with the value of `id`, now if it is known, otherwise on resolution.
    pub fn listen(&mut self, id: PromiseId, mut listener: impl FnMut(i64) + 'static) {
        let promise = &mut self.promises[id.0 as usize];
        match promise.value {
            Some(value) => listener(value),
            None => promise.listeners.push(Box::new(listener)),
        }
    }

    /// Resolve every code-relative promise against `layout` and fire pending listeners.
    pub fn resolve_all(&mut self, layout: &CodeLayout) -> CompileResult<()> {
        for (index, promise) in self.promises.iter_mut().enumerate() {
            if promise.value.is_some() {
                continue;
            }
            let offset = match promise.kind {
                PromiseKind::Resolved(v) => v,
                PromiseKind::MachineIp(ip) => lookup(layout, CodeTarget::Ip(ip))?,
                PromiseKind::Code => {
                    lookup(layout, CodeTarget::Promise(PromiseId(index as u32)))?
                }
                PromiseKind::Pool(slot) => (layout.pool_offset() + slot as usize * 8) as i64,
            };
            let value = layout.base + offset;
            promise.value = Some(value);
            for mut listener in promise.listeners.drain(..) {
                listener(value);
            }
        }
        Ok(())
    }
}

fn lookup(layout: &CodeLayout, target: CodeTarget) -> CompileResult<i64> {
    layout
        .targets
        .get(&target)
        .map(|&offset| offset as i64)
        .ok_or_else(|| CompileError::Unresolved {
            reason: format!("{:?} was never bound", target),
        })
}
