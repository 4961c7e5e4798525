// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed object pool with generation-checked handles.
//!
//! Slots are recycled through a free list; each recycle bumps the slot
//! generation, so a handle kept past [`Pool::remove`] resolves to `None`
//! instead of aliasing the slot's next tenant. Slots store `Arc<T>` so a
//! resolved reference stays valid while locks are dropped and reacquired.

use std::sync::Arc;

use parking_lot::Mutex;

/// Stable reference to a pooled object: slot index plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index within the pool.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation the slot had when this handle was issued.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct PoolInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    outstanding: usize,
}

/// Arena of `Arc<T>` values addressed by [`Handle`].
pub struct Pool<T> {
    inner: Mutex<PoolInner<T>>,
}

impl<T> Pool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
                outstanding: 0,
            }),
        }
    }

    /// Construct a value that knows its own handle and insert it.
    pub fn insert_with(&self, build: impl FnOnce(Handle) -> T) -> (Handle, Arc<T>) {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let handle = Handle {
            index,
            generation: inner.slots[index as usize].generation,
        };
        let value = Arc::new(build(handle));
        inner.slots[index as usize].value = Some(Arc::clone(&value));
        inner.outstanding += 1;
        (handle, value)
    }

    /// Resolve a handle, if it is still current.
    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    /// Remove a value, bumping the slot generation so stale handles fail.
    pub fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        inner.outstanding -= 1;
        Some(value)
    }

    /// Number of live values.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}
