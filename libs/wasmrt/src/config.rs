// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::memory::MAX_PAGES;
use crate::reader::MAX_SANE_UTF8_LENGTH;
use crate::types::MAX_SANE_FUNCTION_ARGS;

/// Tunables shared by an environment and every runtime it spawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Code pages are sized in multiples of this many bytes.
    pub code_page_align_bytes: usize,
    /// A released page with fewer free lines than this goes on the full list.
    /// Also the minimum capacity of pages acquired for compilation.
    pub code_page_free_lines_threshold: usize,
    pub max_sane_function_args: usize,
    pub max_sane_utf8_length: u32,
    /// Memory ceiling for modules that do not declare a maximum.
    pub default_max_memory_pages: u32,
    /// Optional hard cap on linear memory bytes per runtime.
    pub memory_limit: Option<usize>,
    /// Slots of the scratch stack used to evaluate constant expressions.
    pub const_expr_stack_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            code_page_align_bytes: 32 * 1024,
            code_page_free_lines_threshold: 5,
            max_sane_function_args: MAX_SANE_FUNCTION_ARGS,
            max_sane_utf8_length: MAX_SANE_UTF8_LENGTH,
            default_max_memory_pages: MAX_PAGES,
            memory_limit: None,
            const_expr_stack_slots: 4000,
        }
    }
}
