// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::backend::{Compiler, Executor, NativeExecutor, NoYield, UnsupportedCompiler, YieldHook};
use crate::code_page::{CodePage, PagePool};
use crate::config::Config;
use crate::heap::{Heap, SystemHeap};
use crate::runtime::RuntimeId;
use crate::type_registry::TypeRegistry;
use crate::types::FuncType;

/// State shared by all runtimes spawned from it: the interned function types,
/// the pool of released code pages, the allocation strategy and the compiler
/// and executor capabilities.
///
/// Cloning an `Environment` is cheap and yields a handle to the same state.
/// The shared state is torn down when the last handle (including the ones
/// held by runtimes) is dropped.
#[derive(Debug, Clone)]
pub struct Environment(Arc<EnvironmentInner>);

#[derive(Debug)]
struct EnvironmentInner {
    config: Config,
    types: spin::Mutex<TypeRegistry>,
    pages: spin::Mutex<PagePool>,
    heap: Arc<dyn Heap>,
    compiler: Box<dyn Compiler>,
    executor: Box<dyn Executor>,
    yield_hook: Box<dyn YieldHook>,
    next_runtime_id: AtomicU32,
    next_page_sequence: AtomicU32,
}

// ===== impl Environment =====

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Environment {
        Self::builder().build()
    }

    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    pub fn same(lhs: &Environment, rhs: &Environment) -> bool {
        Arc::ptr_eq(&lhs.0, &rhs.0)
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn heap(&self) -> &Arc<dyn Heap> {
        &self.0.heap
    }

    pub fn compiler(&self) -> &dyn Compiler {
        self.0.compiler.as_ref()
    }

    pub fn executor(&self) -> &dyn Executor {
        self.0.executor.as_ref()
    }

    /// Gives the host a chance to run other cooperative work.
    ///
    /// # Errors
    ///
    /// Propagates whatever the installed [`YieldHook`] reports.
    pub fn yield_now(&self) -> crate::Result<()> {
        self.0.yield_hook.on_yield()
    }

    /// Returns the canonical instance of `ty`, interning it if it is new.
    pub fn intern_func_type(&self, ty: FuncType) -> Arc<FuncType> {
        self.0.types.lock().intern(ty)
    }

    /// Parses a textual signature and interns the resulting type.
    ///
    /// # Errors
    ///
    /// See [`FuncType::from_signature`].
    pub fn parse_signature(&self, signature: &str) -> crate::Result<Arc<FuncType>> {
        let ty = FuncType::from_signature_with_limit(
            signature,
            self.0.config.max_sane_function_args,
        )?;
        Ok(self.intern_func_type(ty))
    }

    pub fn num_func_types(&self) -> usize {
        self.0.types.lock().len()
    }

    /// Number of reset code pages waiting in the shared pool.
    pub fn num_released_code_pages(&self) -> usize {
        self.0.pages.lock().len()
    }

    /// Takes a page with at least `min_lines` free lines from the shared pool
    /// or allocates a new one.
    pub(crate) fn acquire_code_page(&self, min_lines: usize) -> crate::Result<CodePage> {
        if let Some(page) = self.0.pages.lock().take(min_lines) {
            tracing::trace!("recycled code page #{}", page.sequence());
            return Ok(page);
        }

        let sequence = self.0.next_page_sequence.fetch_add(1, Ordering::Relaxed);
        CodePage::new(self, min_lines, sequence)
    }

    pub(crate) fn recycle_code_pages(&self, pages: Vec<CodePage>) {
        self.0.pages.lock().splice(pages);
    }

    pub(crate) fn next_runtime_id(&self) -> RuntimeId {
        RuntimeId(self.0.next_runtime_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    config: Config,
    heap: Option<Arc<dyn Heap>>,
    compiler: Option<Box<dyn Compiler>>,
    executor: Option<Box<dyn Executor>>,
    yield_hook: Option<Box<dyn YieldHook>>,
}

// ===== impl EnvironmentBuilder =====

impl EnvironmentBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the allocation strategy for code pages and linear memory.
    /// Defaults to [`SystemHeap`].
    #[must_use]
    pub fn heap(mut self, heap: Arc<dyn Heap>) -> Self {
        self.heap = Some(heap);
        self
    }

    #[must_use]
    pub fn compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Some(Box::new(compiler));
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: impl Executor + 'static) -> Self {
        self.executor = Some(Box::new(executor));
        self
    }

    #[must_use]
    pub fn yield_hook(mut self, hook: impl YieldHook + 'static) -> Self {
        self.yield_hook = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Environment {
        Environment(Arc::new(EnvironmentInner {
            config: self.config,
            types: spin::Mutex::new(TypeRegistry::default()),
            pages: spin::Mutex::new(PagePool::new()),
            heap: self.heap.unwrap_or_else(|| Arc::new(SystemHeap::new())),
            compiler: self
                .compiler
                .unwrap_or_else(|| Box::new(UnsupportedCompiler)),
            executor: self.executor.unwrap_or_else(|| Box::new(NativeExecutor)),
            yield_hook: self.yield_hook.unwrap_or_else(|| Box::new(NoYield)),
            next_runtime_id: AtomicU32::new(0),
            next_page_sequence: AtomicU32::new(0),
        }))
    }
}
