//! Pooled per-operation contexts
//!
//! Each in-flight read or write owns one slot in an [`OpContextPool`]. The slot
//! holds the caller's completion callback and context until the completion path
//! resolves it. Slots are addressed by a [`ContextToken`] (slot index plus a
//! generation counter) which packs into the single integer [`IoHandle`] that
//! crosses the native driver boundary. A stale or duplicated handle never
//! matches a live slot, so a context is resolved at most once.
//!
//! The pool grows on demand and never fails to hand out a slot. Released slots
//! are reset and recycled through a lock-free free list.

use std::time::Instant;

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use crate::device::traits::{IoCallbackContext, IoCompletionCallback, IoOperation};

/// Opaque per-operation handle echoed back by native drivers
pub type IoHandle = u64;

/// Identity of one acquired pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken {
    index: u32,
    generation: u32,
}

impl ContextToken {
    /// Slot index
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation at acquire time
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into an integer handle: generation in the high 32 bits
    #[inline]
    pub const fn into_handle(self) -> IoHandle {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack an integer handle
    #[inline]
    pub const fn from_handle(handle: IoHandle) -> Self {
        Self {
            index: handle as u32,
            generation: (handle >> 32) as u32,
        }
    }
}

/// A resolved operation, taken out of its slot by the completion path.
pub struct ResolvedOp {
    /// The caller's completion callback
    pub callback: IoCompletionCallback,
    /// The caller's opaque context
    pub context: IoCallbackContext,
    /// Operation type
    pub operation: IoOperation,
    /// When the operation was initialized
    pub submitted_at: Instant,
}

struct PendingOp {
    callback: IoCompletionCallback,
    context: IoCallbackContext,
    operation: IoOperation,
    submitted_at: Instant,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    in_use: bool,
    op: Option<PendingOp>,
}

/// Concurrent, growable pool of operation contexts.
#[derive(Default)]
pub struct OpContextPool {
    slots: RwLock<Vec<Mutex<Slot>>>,
    free: SegQueue<u32>,
}

impl OpContextPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with `count` slots allocated up front
    pub fn with_capacity(count: usize) -> Self {
        let pool = Self::new();
        {
            let mut slots = pool.slots.write();
            slots.reserve(count);
            for index in 0..count {
                slots.push(Mutex::new(Slot::default()));
                pool.free.push(index as u32);
            }
        }
        pool
    }

    /// Check out an empty slot. Never blocks on other slots and never fails.
    pub fn acquire(&self) -> ContextToken {
        if let Some(index) = self.free.pop() {
            let slots = self.slots.read();
            let mut slot = slots[index as usize].lock();
            debug_assert!(!slot.in_use && slot.op.is_none());
            slot.generation = slot.generation.wrapping_add(1);
            slot.in_use = true;
            return ContextToken {
                index,
                generation: slot.generation,
            };
        }

        let mut slots = self.slots.write();
        let index = u32::try_from(slots.len()).unwrap_or(u32::MAX);
        slots.push(Mutex::new(Slot {
            generation: 0,
            in_use: true,
            op: None,
        }));
        ContextToken {
            index,
            generation: 0,
        }
    }

    /// Fill an acquired slot. Must be called exactly once per acquire, before
    /// the handle is handed to a backend.
    pub fn init(
        &self,
        token: ContextToken,
        operation: IoOperation,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) {
        let slots = self.slots.read();
        let Some(slot) = slots.get(token.index as usize) else {
            debug_assert!(false, "init on unknown slot {}", token.index);
            return;
        };
        let mut slot = slot.lock();
        debug_assert!(slot.in_use && slot.generation == token.generation);
        debug_assert!(slot.op.is_none(), "slot initialized twice");
        slot.op = Some(PendingOp {
            callback,
            context,
            operation,
            submitted_at: Instant::now(),
        });
    }

    /// Take the callback and context out of a live slot.
    ///
    /// Returns `None` if the token is stale or the slot was already resolved.
    /// The slot stays checked out until [`release`](Self::release).
    pub fn take(&self, token: ContextToken) -> Option<ResolvedOp> {
        let slots = self.slots.read();
        let mut slot = slots.get(token.index as usize)?.lock();
        if !slot.in_use || slot.generation != token.generation {
            return None;
        }
        slot.op.take().map(|op| ResolvedOp {
            callback: op.callback,
            context: op.context,
            operation: op.operation,
            submitted_at: op.submitted_at,
        })
    }

    /// Reset a slot and return it to the free list.
    ///
    /// Returns `false` (and does nothing) for a stale token or a slot that is not
    /// checked out.
    pub fn release(&self, token: ContextToken) -> bool {
        let slots = self.slots.read();
        let Some(slot) = slots.get(token.index as usize) else {
            return false;
        };
        let mut slot = slot.lock();
        if !slot.in_use || slot.generation != token.generation {
            return false;
        }
        slot.op = None;
        slot.in_use = false;
        drop(slot);
        self.free.push(token.index);
        true
    }

    /// Whether the slot behind `token` currently holds a callback
    pub fn is_initialized(&self, token: ContextToken) -> bool {
        let slots = self.slots.read();
        slots.get(token.index as usize).is_some_and(|slot| {
            let slot = slot.lock();
            slot.in_use && slot.generation == token.generation && slot.op.is_some()
        })
    }

    /// Total slots allocated so far
    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }

    /// Slots ready for reuse
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Slots currently checked out
    pub fn outstanding(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }
}
