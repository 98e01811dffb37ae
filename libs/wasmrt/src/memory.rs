// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::environment::Environment;
use crate::heap::{Grant, Heap};
use crate::runtime::RuntimeId;
use crate::trap::Trap;
use crate::{Error, Result};

/// Size of a linear memory page in bytes.
pub const WASM_PAGE_SIZE: usize = 0x10000;
/// Largest number of pages a 32-bit linear memory can have.
pub const MAX_PAGES: u32 = 0x10000;

/// Bookkeeping that travels with the linear memory into compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeader {
    /// Committed bytes.
    pub length: usize,
    pub runtime: RuntimeId,
    /// Upper bound of the live slot stack, in slots.
    pub max_stack: usize,
}

/// A runtime's page granular linear memory.
///
/// The committed size is always a whole number of pages, only ever grows and
/// new pages are zeroed.
#[derive(Debug)]
pub struct LinearMemory {
    header: MemoryHeader,
    bytes: Vec<u8>,
    num_pages: u32,
    max_pages: u32,
    limit: Option<usize>,
    /// Set once the memory has been sized, even to zero pages.
    allocated: bool,
    heap: Arc<dyn Heap>,
    grant: Option<Grant>,
}

// ===== impl LinearMemory =====

impl LinearMemory {
    pub(crate) fn new(env: &Environment, runtime: RuntimeId, max_stack: usize) -> Self {
        Self {
            header: MemoryHeader {
                length: 0,
                runtime,
                max_stack,
            },
            bytes: Vec::new(),
            num_pages: 0,
            max_pages: env.config().default_max_memory_pages,
            limit: env.config().memory_limit,
            allocated: false,
            heap: env.heap().clone(),
            grant: None,
        }
    }

    pub fn header(&self) -> &MemoryHeader {
        &self.header
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the memory was ever sized. A module that imports its memory
    /// leaves it unallocated.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub(crate) fn set_max_pages(&mut self, max_pages: u32) {
        self.max_pages = max_pages.min(MAX_PAGES);
    }

    /// Grows the memory to `num_pages` pages. Requests at or below the
    /// current size leave the memory untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WasmMemoryOverflow`] if `num_pages` exceeds the
    /// maximum and [`Error::MallocFailed`] if the bytes cannot be allocated.
    pub fn grow_to(&mut self, num_pages: u32) -> Result<()> {
        if num_pages > self.max_pages {
            tracing::debug!(
                "cannot grow memory to {num_pages} pages, maximum is {}",
                self.max_pages
            );
            return Err(Error::WasmMemoryOverflow);
        }
        self.allocated = true;
        if num_pages <= self.num_pages {
            return Ok(());
        }

        let mut num_bytes = usize::try_from(num_pages)
            .ok()
            .and_then(|pages| pages.checked_mul(WASM_PAGE_SIZE))
            .ok_or(Error::WasmMemoryOverflow)?;

        if let Some(limit) = self.limit {
            let limit = limit - limit % WASM_PAGE_SIZE;
            if num_bytes > limit {
                tracing::warn!("memory limited to {limit} bytes");
                num_bytes = limit;
            }
        }
        if num_bytes <= self.bytes.len() {
            return Ok(());
        }

        if let Some(grant) = &mut self.grant {
            if !grant.resize(num_bytes) {
                return Err(Error::MallocFailed);
            }
        } else {
            self.grant = Some(Grant::new(&self.heap, num_bytes).ok_or(Error::MallocFailed)?);
        }
        self.bytes
            .try_reserve_exact(num_bytes - self.bytes.len())
            .map_err(|_| Error::MallocFailed)?;
        self.bytes.resize(num_bytes, 0);

        self.num_pages = u32::try_from(num_bytes / WASM_PAGE_SIZE).unwrap_or(MAX_PAGES);
        self.header.length = num_bytes;

        tracing::trace!("linear memory grown to {} pages", self.num_pages);
        Ok(())
    }

    /// # Errors
    ///
    /// Traps with [`Trap::MemoryOutOfBounds`] if the range is not committed.
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(Error::Trap(Trap::MemoryOutOfBounds))
    }

    /// # Errors
    ///
    /// Traps with [`Trap::MemoryOutOfBounds`] if the range is not committed.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        offset
            .checked_add(data.len())
            .and_then(|end| self.bytes.get_mut(offset..end))
            .ok_or(Error::Trap(Trap::MemoryOutOfBounds))?
            .copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::heap::FixedArena;

    fn memory(env: &Environment) -> LinearMemory {
        LinearMemory::new(env, RuntimeId(0), 16)
    }

    #[test]
    fn grows_zeroed() {
        let env = Environment::new();
        let mut mem = memory(&env);
        assert!(mem.is_empty());
        assert!(!mem.is_allocated());

        mem.grow_to(1).unwrap();
        assert!(mem.is_allocated());
        assert_eq!(mem.len(), WASM_PAGE_SIZE);
        mem.write(10, &[1, 2, 3]).unwrap();

        mem.grow_to(3).unwrap();
        assert_eq!(mem.header().length, 3 * WASM_PAGE_SIZE);
        assert_eq!(mem.read(10, 3).unwrap(), &[1, 2, 3]);
        assert!(mem.as_slice()[WASM_PAGE_SIZE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn never_shrinks() {
        let env = Environment::new();
        let mut mem = memory(&env);
        mem.grow_to(2).unwrap();
        mem.grow_to(1).unwrap();
        assert_eq!(mem.num_pages(), 2);
        assert_eq!(mem.len(), 2 * WASM_PAGE_SIZE);
    }

    #[test]
    fn respects_maximum() {
        let env = Environment::new();
        let mut mem = memory(&env);
        mem.set_max_pages(2);
        assert_eq!(mem.grow_to(3), Err(Error::WasmMemoryOverflow));
        assert!(mem.is_empty());
    }

    #[test]
    fn memory_limit_clamps() {
        let env = Environment::builder()
            .config(Config {
                memory_limit: Some(WASM_PAGE_SIZE + 100),
                ..Config::default()
            })
            .build();
        let mut mem = memory(&env);
        mem.grow_to(4).unwrap();
        assert_eq!(mem.num_pages(), 1);
        assert_eq!(mem.len(), WASM_PAGE_SIZE);
    }

    #[test]
    fn exhausted_heap() {
        let env = Environment::builder()
            .heap(Arc::new(FixedArena::new(WASM_PAGE_SIZE)))
            .build();
        let mut mem = memory(&env);
        mem.grow_to(1).unwrap();
        assert_eq!(mem.grow_to(2), Err(Error::MallocFailed));
        assert_eq!(mem.num_pages(), 1);
    }

    #[test]
    fn zero_pages_is_allocated() {
        let env = Environment::new();
        let mut mem = memory(&env);
        mem.grow_to(0).unwrap();
        assert!(mem.is_allocated());
        assert!(mem.is_empty());
    }

    #[test]
    fn out_of_bounds() {
        let env = Environment::new();
        let mut mem = memory(&env);
        mem.grow_to(1).unwrap();
        assert_eq!(
            mem.read(WASM_PAGE_SIZE - 1, 2),
            Err(Error::Trap(Trap::MemoryOutOfBounds))
        );
        assert!(mem.write(usize::MAX, &[0]).is_err());
    }
}
