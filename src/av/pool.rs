//! Recycling arena for packets and frames.
//!
//! A [`BufferPool`] hands out [`Pooled`] handles. The arena behind it is the
//! only state shared between stages; it sits behind a single mutex that is
//! held just long enough to pop or push a slot. Resetting a buffer and
//! allocating a fresh one both happen outside the lock.
//!
//! Ownership follows the handle: a buffer goes back to the arena exactly once,
//! when its handle is released or dropped, so use-after-release cannot be
//! expressed. The arena still tracks slot liveness and asserts on it in debug
//! builds.

use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Buffers that can be reset before they are handed out again.
pub trait Recycle {
    fn recycle(&mut self);
}

struct Arena<T> {
    free: Vec<(u32, Box<T>)>,
    live: Vec<bool>,
    live_count: usize,
    capacity: Option<usize>,
}

/// A shared arena of reusable `T` buffers.
pub struct BufferPool<T: Recycle + Default> {
    arena: Arc<Mutex<Arena<T>>>,
}

impl<T: Recycle + Default> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
        }
    }
}

impl<T: Recycle + Default> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Recycle + Default> BufferPool<T> {
    /// An unbounded pool.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// A pool refusing to hand out more than `capacity` live buffers.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            arena: Arc::new(Mutex::new(Arena {
                free: Vec::new(),
                live: Vec::new(),
                live_count: 0,
                capacity,
            })),
        }
    }

    /// Takes a buffer from the arena, or grows it. Never blocks on other
    /// holders; fails with `NoMemory` once the capacity is reached.
    pub fn alloc(&self) -> Result<Pooled<T>> {
        let reused = {
            let mut arena = self.arena.lock();
            if let Some(capacity) = arena.capacity {
                if arena.live_count >= capacity {
                    return Err(PipelineError::NoMemory(format!(
                        "buffer pool exhausted ({} live)",
                        arena.live_count
                    )));
                }
            }

            let (slot, value) = match arena.free.pop() {
                Some((slot, value)) => (slot, Some(value)),
                None => {
                    let slot = arena.live.len() as u32;
                    arena.live.push(false);
                    (slot, None)
                }
            };
            debug_assert!(!arena.live[slot as usize], "slot {} handed out twice", slot);
            arena.live[slot as usize] = true;
            arena.live_count += 1;
            (slot, value)
        };

        let (slot, value) = reused;
        let value = value.unwrap_or_else(|| Box::new(T::default()));
        Ok(Pooled {
            value: Some(value),
            slot,
            arena: Some(Arc::clone(&self.arena)),
        })
    }

    /// Number of buffers currently handed out.
    pub fn live(&self) -> usize {
        self.arena.lock().live_count
    }

    /// Number of recycled buffers waiting for reuse.
    pub fn idle(&self) -> usize {
        self.arena.lock().free.len()
    }
}

/// Exclusive handle to a pooled buffer.
pub struct Pooled<T: Recycle + Default> {
    value: Option<Box<T>>,
    slot: u32,
    arena: Option<Arc<Mutex<Arena<T>>>>,
}

impl<T: Recycle + Default> Pooled<T> {
    /// Wraps a value that does not belong to any pool.
    pub fn detached(value: T) -> Self {
        Self {
            value: Some(Box::new(value)),
            slot: u32::MAX,
            arena: None,
        }
    }

    /// Arena slot backing this handle, `None` for detached values.
    pub fn slot(&self) -> Option<u32> {
        self.arena.as_ref().map(|_| self.slot)
    }

    pub fn is_pooled(&self) -> bool {
        self.arena.is_some()
    }

    /// Returns the buffer to its arena.
    pub fn release(self) {
        drop(self)
    }

    /// Copies the contents into a detached handle and releases this one.
    pub fn into_detached(self) -> Self
    where
        T: Clone,
    {
        let copy = T::clone(&self);
        drop(self);
        Pooled::detached(copy)
    }
}

impl<T: Recycle + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.value {
            Some(ref value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T: Recycle + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.value {
            Some(ref mut value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T: Recycle + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        let (Some(mut value), Some(arena)) = (self.value.take(), self.arena.take()) else {
            return;
        };
        value.recycle();

        let mut arena = arena.lock();
        let slot = self.slot as usize;
        debug_assert!(arena.live[slot], "slot {} released twice", slot);
        arena.live[slot] = false;
        arena.live_count -= 1;
        arena.free.push((self.slot, value));
    }
}

impl<T: Recycle + Default + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("slot", &self.slot())
            .field("value", &**self)
            .finish()
    }
}
