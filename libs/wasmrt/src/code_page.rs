// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Code pages hold the compiled instruction sequences ("lines") of functions.
//!
//! Pages are pooled on two levels. Each runtime keeps its pages in a slab
//! with two free lists threaded through the pages' `next` indices: `open`
//! (still room for more code) and `full` (below the free line threshold).
//! When a runtime is torn down its pages are reset and handed to the
//! environment's shared pool as one batch, from where the next runtime picks
//! them up before any new page is allocated.

use alloc::vec::Vec;
use core::fmt;

use static_assertions::const_assert;
use wasmtime_slab::{Id, Slab};

use crate::backend::NativeFunction;
use crate::environment::Environment;
use crate::heap::{Grant, try_vec_with_capacity};
use crate::{Error, Result};

pub type PageId = Id;

/// An engine level opcode stored in a code line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Calls the native function stored in the next line.
    pub const CALL_RAW: Opcode = Opcode(0xff00);
    /// Calls the native function stored in the next line, passing the
    /// cookie stored in the line after it.
    pub const CALL_RAW_EX: Opcode = Opcode(0xff01);
}

/// One slot of compiled code.
#[derive(Clone, Copy)]
pub enum Line {
    Op(Opcode),
    Native(NativeFunction),
    Imm(u64),
}

const_assert!(size_of::<Line>() <= 16);

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Op(op) => write!(f, "Op({:#06x})", op.0),
            Line::Native(func) => write!(f, "Native({:#x})", *func as usize),
            Line::Imm(imm) => write!(f, "Imm({imm:#x})"),
        }
    }
}

/// Address of a line: a page of the owning runtime and a line index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRef {
    pub page: PageId,
    pub line: u32,
}

impl CodeRef {
    #[must_use]
    pub fn offset(self, lines: u32) -> Self {
        Self {
            page: self.page,
            line: self.line + lines,
        }
    }
}

pub struct CodePage {
    lines: Vec<Line>,
    capacity: usize,
    usage: u32,
    sequence: u32,
    next: Option<PageId>,
    _grant: Grant,
}

// ===== impl CodePage =====

impl CodePage {
    /// Allocates a page with room for at least `min_lines` lines, rounded up
    /// to whole multiples of `align_bytes`.
    pub(crate) fn new(env: &Environment, min_lines: usize, sequence: u32) -> Result<Self> {
        let align = env.config().code_page_align_bytes.max(size_of::<Line>());
        let capacity = min_lines
            .checked_mul(size_of::<Line>())
            .and_then(|bytes| bytes.checked_next_multiple_of(align))
            .ok_or(Error::MallocFailedCodePage)?
            / size_of::<Line>();

        let grant = Grant::new(env.heap(), capacity * size_of::<Line>())
            .ok_or(Error::MallocFailedCodePage)?;
        let lines = try_vec_with_capacity(capacity).ok_or(Error::MallocFailedCodePage)?;

        tracing::trace!("new code page #{sequence} with {capacity} lines");

        Ok(Self {
            lines,
            capacity,
            usage: 0,
            sequence,
            next: None,
            _grant: grant,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_free_lines(&self) -> usize {
        self.capacity - self.lines.len()
    }

    /// Index of the next line that will be emitted.
    pub fn pc(&self) -> u32 {
        u32::try_from(self.lines.len()).unwrap_or(u32::MAX)
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn usage_count(&self) -> u32 {
        self.usage
    }

    pub fn line(&self, index: u32) -> Option<Line> {
        self.lines.get(usize::try_from(index).ok()?).copied()
    }

    pub(crate) fn emit(&mut self, line: Line) -> Result<u32> {
        if self.num_free_lines() == 0 {
            return Err(Error::CodePageOverflow);
        }
        let pc = self.pc();
        self.lines.push(line);
        Ok(pc)
    }

    pub(crate) fn patch(&mut self, index: u32, line: Line) -> Result<()> {
        let slot = usize::try_from(index)
            .ok()
            .and_then(|index| self.lines.get_mut(index))
            .ok_or(Error::InvalidCodeRef)?;
        *slot = line;
        Ok(())
    }

    /// Drops all emitted code, readying the page for another runtime.
    pub(crate) fn reset(&mut self) {
        self.lines.clear();
        self.usage = 0;
        self.next = None;
    }
}

impl fmt::Debug for CodePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodePage")
            .field("sequence", &self.sequence)
            .field("capacity", &self.capacity)
            .field("used", &self.lines.len())
            .field("usage", &self.usage)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// Unlinks and returns the first page on the list starting at `head` that has
/// at least `min_lines` free lines.
fn take_with_capacity(
    pages: &mut Slab<CodePage>,
    head: &mut Option<PageId>,
    min_lines: usize,
) -> Option<PageId> {
    let mut prev: Option<PageId> = None;
    let mut cursor = *head;

    while let Some(id) = cursor {
        let page = pages.get_mut(id)?;
        let next = page.next;

        if page.num_free_lines() >= min_lines {
            page.next = None;
            match prev.and_then(|prev| pages.get_mut(prev)) {
                Some(prev) => prev.next = next,
                None => *head = next,
            }
            return Some(id);
        }

        prev = cursor;
        cursor = next;
    }

    None
}

fn push_front(pages: &mut Slab<CodePage>, head: &mut Option<PageId>, id: PageId) {
    if let Some(page) = pages.get_mut(id) {
        page.next = head.replace(id);
    }
}

/// The environment wide pool of released, reset pages.
///
/// Pages arrive in batches, one per torn down runtime, and batches are kept
/// newest first so recently used pages are handed out again first.
#[derive(Debug)]
pub(crate) struct PagePool {
    batches: Vec<Vec<CodePage>>,
    len: usize,
}

impl PagePool {
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            len: 0,
        }
    }

    pub fn take(&mut self, min_lines: usize) -> Option<CodePage> {
        let (batch_index, batch) = self
            .batches
            .iter_mut()
            .enumerate()
            .rev()
            .find(|(_, batch)| batch.iter().any(|page| page.num_free_lines() >= min_lines))?;
        let page_index = batch
            .iter()
            .rposition(|page| page.num_free_lines() >= min_lines)?;
        let page = batch.swap_remove(page_index);

        if batch.is_empty() {
            self.batches.remove(batch_index);
        }
        self.len -= 1;
        Some(page)
    }

    /// Puts a batch of reset pages in front of the pool.
    pub fn splice(&mut self, pages: Vec<CodePage>) {
        debug_assert!(
            pages
                .iter()
                .all(|page| page.num_free_lines() == page.capacity())
        );
        if pages.is_empty() {
            return;
        }
        self.len += pages.len();
        self.batches.push(pages);
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// The per-runtime page allocator.
#[derive(Debug)]
pub(crate) struct CodePages {
    env: Environment,
    pages: Slab<CodePage>,
    open: Option<PageId>,
    full: Option<PageId>,
    num_open: usize,
    num_full: usize,
    num_active: usize,
    num_total: usize,
}

// ===== impl CodePages =====

impl CodePages {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            pages: Slab::new(),
            open: None,
            full: None,
            num_open: 0,
            num_full: 0,
            num_active: 0,
            num_total: 0,
        }
    }

    /// Acquires a page with the default minimum of free lines.
    pub fn acquire(&mut self) -> Result<PageId> {
        self.acquire_with_capacity(self.env.config().code_page_free_lines_threshold)
    }

    /// Acquires a page with at least `min_lines` free lines: first from this
    /// runtime's open list, then from the environment's pool, and finally by
    /// allocating a new page.
    pub fn acquire_with_capacity(&mut self, min_lines: usize) -> Result<PageId> {
        let id = if let Some(id) = take_with_capacity(&mut self.pages, &mut self.open, min_lines)
        {
            self.num_open -= 1;
            id
        } else {
            let page = self.env.acquire_code_page(min_lines)?;
            self.num_total += 1;
            self.pages.alloc(page)
        };

        let page = self.pages.get_mut(id).ok_or(Error::InvalidCodeRef)?;
        debug_assert_eq!(page.usage, 0, "handed out a page that is still in use");
        page.usage += 1;
        self.num_active += 1;

        tracing::trace!(
            "acquired code page #{} ({} free lines)",
            page.sequence,
            page.num_free_lines()
        );
        self.check_invariant();
        Ok(id)
    }

    /// Returns a page to the open or full list depending on its free lines.
    pub fn release(&mut self, id: PageId) {
        let threshold = self.env.config().code_page_free_lines_threshold;

        let Some(page) = self.pages.get_mut(id) else {
            tracing::warn!("attempted to release unknown code page {id:?}");
            return;
        };
        if page.usage == 0 {
            tracing::warn!("code page #{} released twice", page.sequence);
            return;
        }
        page.usage -= 1;

        if page.num_free_lines() < threshold {
            tracing::trace!("code page #{} is full", page.sequence);
            push_front(&mut self.pages, &mut self.full, id);
            self.num_full += 1;
        } else {
            tracing::trace!("code page #{} is open", page.sequence);
            push_front(&mut self.pages, &mut self.open, id);
            self.num_open += 1;
        }
        self.num_active -= 1;

        self.check_invariant();
    }

    pub fn get(&self, id: PageId) -> Option<&CodePage> {
        self.pages.get(id)
    }

    pub fn get_mut(&mut self, id: PageId) -> Option<&mut CodePage> {
        self.pages.get_mut(id)
    }

    pub fn line(&self, at: CodeRef) -> Option<Line> {
        self.pages.get(at.page)?.line(at.line)
    }

    pub fn num_open(&self) -> usize {
        self.num_open
    }

    pub fn num_full(&self) -> usize {
        self.num_full
    }

    pub fn num_active(&self) -> usize {
        self.num_active
    }

    pub fn num_total(&self) -> usize {
        self.num_total
    }

    fn check_invariant(&self) {
        debug_assert_eq!(
            self.num_open + self.num_full + self.num_active,
            self.num_total,
            "code page accounting out of sync"
        );
    }

    fn drain_list(&mut self, mut head: Option<PageId>, out: &mut Vec<CodePage>) {
        while let Some(id) = head {
            let mut page = self.pages.dealloc(id);
            head = page.next;
            page.reset();
            out.push(page);
        }
    }
}

impl Drop for CodePages {
    fn drop(&mut self) {
        debug_assert_eq!(self.num_active, 0, "runtime torn down with active code pages");

        let mut released = Vec::with_capacity(self.num_open + self.num_full);
        let open = self.open.take();
        self.drain_list(open, &mut released);
        let full = self.full.take();
        self.drain_list(full, &mut released);

        tracing::debug!(
            "returning {} code pages to the environment",
            released.len()
        );
        self.env.recycle_code_pages(released);
        self.num_total -= self.num_open + self.num_full;
        self.num_open = 0;
        self.num_full = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_patch() {
        let env = Environment::new();
        let mut page = CodePage::new(&env, 4, 0).unwrap();
        let cap = page.capacity();
        assert!(cap >= 4);

        assert_eq!(page.emit(Line::Imm(1)).unwrap(), 0);
        assert_eq!(page.emit(Line::Op(Opcode::CALL_RAW)).unwrap(), 1);
        assert_eq!(page.num_free_lines(), cap - 2);

        page.patch(0, Line::Imm(7)).unwrap();
        assert!(matches!(page.line(0), Some(Line::Imm(7))));
        assert!(page.patch(5, Line::Imm(0)).is_err());

        page.reset();
        assert_eq!(page.num_free_lines(), cap);
    }

    #[test]
    fn page_overflow() {
        let env = Environment::builder()
            .config(crate::Config {
                code_page_align_bytes: 0,
                ..crate::Config::default()
            })
            .build();
        let mut page = CodePage::new(&env, 2, 0).unwrap();
        assert_eq!(page.capacity(), 2);
        page.emit(Line::Imm(0)).unwrap();
        page.emit(Line::Imm(0)).unwrap();
        assert_eq!(page.emit(Line::Imm(0)), Err(Error::CodePageOverflow));
    }

    #[test]
    fn reuse_open_page() {
        let env = Environment::new();
        let mut pages = CodePages::new(env.clone());

        let a = pages.acquire().unwrap();
        pages.release(a);
        assert_eq!(pages.num_open(), 1);

        let b = pages.acquire().unwrap();
        assert_eq!(a, b);
        assert_eq!(pages.num_total(), 1);
        pages.release(b);

        // double release is ignored
        pages.release(b);
        assert_eq!(pages.num_open(), 1);
        assert_eq!(pages.num_active(), 0);
    }

    #[test]
    fn full_pages_are_not_reused() {
        let env = Environment::builder()
            .config(crate::Config {
                code_page_align_bytes: 0,
                ..crate::Config::default()
            })
            .build();
        let mut pages = CodePages::new(env.clone());

        let id = pages.acquire_with_capacity(6).unwrap();
        let page = pages.get_mut(id).unwrap();
        for _ in 0..3 {
            page.emit(Line::Imm(0)).unwrap();
        }
        pages.release(id);
        assert_eq!(pages.num_full(), 1);

        let other = pages.acquire().unwrap();
        assert_ne!(other, id);
        assert_eq!(pages.num_total(), 2);
        pages.release(other);

        drop(pages);
        assert_eq!(env.num_released_code_pages(), 2);
    }

    #[test]
    fn pool_prefers_the_newest_batch() {
        let env = Environment::builder()
            .config(crate::Config {
                code_page_align_bytes: 0,
                ..crate::Config::default()
            })
            .build();
        let page = |lines, sequence| CodePage::new(&env, lines, sequence).unwrap();

        let mut pool = PagePool::new();
        pool.splice(alloc::vec![page(4, 0), page(8, 1)]);
        pool.splice(alloc::vec![page(4, 2)]);
        pool.splice(Vec::new());
        assert_eq!(pool.len(), 3);

        assert_eq!(pool.take(4).map(|page| page.sequence()), Some(2));
        assert_eq!(pool.take(6).map(|page| page.sequence()), Some(1));
        assert!(pool.take(6).is_none());
        assert_eq!(pool.take(1).map(|page| page.sequence()), Some(0));
        assert_eq!(pool.len(), 0);
    }
}
