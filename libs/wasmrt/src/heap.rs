// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocation strategies for the engine's large buffers (code pages and
//! linear memory).
//!
//! A [`Heap`] only does the accounting: it decides whether a request of a
//! given size may be served and tracks how many bytes are in use. The
//! engine pairs every buffer with a [`Grant`] that returns its bytes to the
//! heap when dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A region handed out by a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: usize,
    pub len: usize,
}

pub trait Heap: fmt::Debug + Send + Sync {
    /// Reserves `len` bytes, returning `None` if the heap is exhausted.
    fn allocate(&self, len: usize) -> Option<Block>;

    /// Resizes `block` to `new_len` bytes. The returned block may live at a
    /// different offset.
    fn reallocate(&self, block: Block, new_len: usize) -> Option<Block>;

    fn free(&self, block: Block);

    /// Number of bytes currently handed out.
    fn in_use(&self) -> usize;
}

/// Unbounded heap backed by the global allocator.
#[derive(Debug, Default)]
pub struct SystemHeap {
    in_use: AtomicUsize,
}

impl SystemHeap {
    pub const fn new() -> Self {
        Self {
            in_use: AtomicUsize::new(0),
        }
    }
}

impl Heap for SystemHeap {
    fn allocate(&self, len: usize) -> Option<Block> {
        self.in_use.fetch_add(len, Ordering::Relaxed);
        Some(Block { offset: 0, len })
    }

    fn reallocate(&self, block: Block, new_len: usize) -> Option<Block> {
        self.in_use.fetch_add(new_len, Ordering::Relaxed);
        self.in_use.fetch_sub(block.len, Ordering::Relaxed);
        Some(Block { offset: 0, len: new_len })
    }

    fn free(&self, block: Block) {
        self.in_use.fetch_sub(block.len, Ordering::Relaxed);
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

/// A fixed size bump allocator.
///
/// Only the most recently allocated block can be freed or grown in place.
/// Freeing any other block leaves its space unusable until everything above
/// it has been freed, and growing any other block moves it to the top.
#[derive(Debug)]
pub struct FixedArena {
    capacity: usize,
    align: usize,
    state: spin::Mutex<ArenaState>,
}

#[derive(Debug, Default)]
struct ArenaState {
    top: usize,
    last: Option<Block>,
    in_use: usize,
}

// ===== impl FixedArena =====

impl FixedArena {
    pub const DEFAULT_ALIGN: usize = 8;

    pub fn new(capacity: usize) -> Self {
        Self::with_align(capacity, Self::DEFAULT_ALIGN)
    }

    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    pub fn with_align(capacity: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "arena alignment must be a power of two");
        Self {
            capacity,
            align,
            state: spin::Mutex::new(ArenaState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current bump pointer.
    pub fn top(&self) -> usize {
        self.state.lock().top
    }

    fn end_of(&self, offset: usize, len: usize) -> Option<usize> {
        let end = offset.checked_add(len)?.checked_next_multiple_of(self.align)?;
        (end <= self.capacity).then_some(end)
    }
}

impl Heap for FixedArena {
    fn allocate(&self, len: usize) -> Option<Block> {
        let mut state = self.state.lock();

        let offset = state.top;
        let Some(end) = self.end_of(offset, len) else {
            tracing::warn!(
                "fixed arena exhausted: requested {len} bytes, {} of {} in use",
                state.top,
                self.capacity
            );
            return None;
        };

        let block = Block { offset, len };
        state.top = end;
        state.last = Some(block);
        state.in_use += len;
        Some(block)
    }

    fn reallocate(&self, block: Block, new_len: usize) -> Option<Block> {
        {
            let mut state = self.state.lock();
            if state.last == Some(block) {
                let end = self.end_of(block.offset, new_len)?;
                let grown = Block {
                    offset: block.offset,
                    len: new_len,
                };
                state.top = end;
                state.last = Some(grown);
                state.in_use = state.in_use - block.len + new_len;
                return Some(grown);
            }
        }

        let moved = self.allocate(new_len)?;
        self.free(block);
        Some(moved)
    }

    fn free(&self, block: Block) {
        let mut state = self.state.lock();
        state.in_use -= block.len;
        if state.last == Some(block) {
            state.top = block.offset;
            state.last = None;
        }
    }

    fn in_use(&self) -> usize {
        self.state.lock().in_use
    }
}

/// Bytes reserved from a [`Heap`], returned when dropped.
#[derive(Debug)]
pub(crate) struct Grant {
    heap: Arc<dyn Heap>,
    block: Block,
}

impl Grant {
    pub fn new(heap: &Arc<dyn Heap>, len: usize) -> Option<Self> {
        let block = heap.allocate(len)?;
        Some(Self {
            heap: heap.clone(),
            block,
        })
    }

    pub fn resize(&mut self, new_len: usize) -> bool {
        match self.heap.reallocate(self.block, new_len) {
            Some(block) => {
                self.block = block;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.block.len
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        self.heap.free(self.block);
    }
}

/// Allocates a vector with exactly `capacity` slots, reporting failure
/// instead of aborting.
pub(crate) fn try_vec_with_capacity<T>(capacity: usize) -> Option<Vec<T>> {
    let mut vec = Vec::new();
    vec.try_reserve_exact(capacity).ok()?;
    Some(vec)
}
