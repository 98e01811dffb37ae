// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;
use core::panic::Location;

use cranelift_entity::PrimaryMap;

use crate::backend::{CompileContext, Slot};
use crate::code_page::{CodePages, CodeRef};
use crate::environment::Environment;
use crate::error::ErrorInfo;
use crate::heap::try_vec_with_capacity;
use crate::indices::{FuncIndex, GlobalIndex, ModuleIndex};
use crate::memory::{LinearMemory, MemoryHeader};
use crate::module::Module;
use crate::values::Val;
use crate::{Error, Result};

/// Identifies a runtime within its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeId(pub(crate) u32);

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime#{}", self.0)
    }
}

/// A function of a module loaded into a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncRef {
    pub module: ModuleIndex,
    pub func: FuncIndex,
}

/// An execution context: one slot stack, one linear memory, the modules
/// loaded into it and the code pages their compiled code lives in.
///
/// Dropping a runtime frees its modules, then hands its code pages back to
/// the environment's pool, then frees the memory and the stack.
pub struct Runtime {
    // fields drop in declaration order
    pub(crate) modules: PrimaryMap<ModuleIndex, Module>,
    pub(crate) code: CodePages,
    pub(crate) memory: LinearMemory,
    pub(crate) stack: Box<[Slot]>,
    pub(crate) env: Environment,
    id: RuntimeId,
    error: ErrorInfo,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("modules", &self.modules.len())
            .field("code", &self.code)
            .field("memory", &self.memory)
            .field("stack_slots", &self.stack.len())
            .finish_non_exhaustive()
    }
}

// ===== impl Runtime =====

impl Runtime {
    /// Creates a runtime with a slot stack of `stack_bytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MallocFailed`] if the stack cannot be allocated.
    pub fn new(env: &Environment, stack_bytes: usize) -> Result<Self> {
        Self::with_stack_slots(env, stack_bytes / size_of::<Slot>())
    }

    /// A throwaway runtime sharing `env`, used to evaluate constant
    /// expressions.
    pub(crate) fn scratch(env: &Environment, slots: usize) -> Result<Self> {
        Self::with_stack_slots(env, slots)
    }

    fn with_stack_slots(env: &Environment, slots: usize) -> Result<Self> {
        let mut stack = try_vec_with_capacity(slots).ok_or(Error::MallocFailed)?;
        stack.resize(slots, 0);

        let id = env.next_runtime_id();
        tracing::debug!("created {id} with {slots} stack slots");

        Ok(Self {
            modules: PrimaryMap::new(),
            code: CodePages::new(env.clone()),
            memory: LinearMemory::new(env, id, slots),
            stack: stack.into_boxed_slice(),
            env: env.clone(),
            id,
            error: ErrorInfo::default(),
        })
    }

    pub fn id(&self) -> RuntimeId {
        self.id
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn module(&self, index: ModuleIndex) -> Option<&Module> {
        self.modules.get(index)
    }

    /// Loaded modules, most recently loaded first.
    pub fn modules(&self) -> impl Iterator<Item = (ModuleIndex, &Module)> {
        self.modules.iter().rev()
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn num_stack_slots(&self) -> usize {
        self.stack.len()
    }

    /// Bytes of linear memory `index`. Only memory 0 exists and it is
    /// reported as absent until it has a nonzero size.
    pub fn memory(&self, index: u32) -> Option<&[u8]> {
        (index == 0 && !self.memory.is_empty()).then(|| self.memory.as_slice())
    }

    pub fn memory_mut(&mut self, index: u32) -> Option<&mut [u8]> {
        (index == 0 && !self.memory.is_empty()).then(|| self.memory.as_mut_slice())
    }

    pub fn linear_memory(&self) -> &LinearMemory {
        &self.memory
    }

    pub fn memory_header(&self) -> &MemoryHeader {
        self.memory.header()
    }

    /// Grows linear memory to `num_pages` pages.
    ///
    /// # Errors
    ///
    /// See [`LinearMemory::grow_to`].
    #[track_caller]
    pub fn grow_memory(&mut self, num_pages: u32) -> Result<()> {
        let res = self.memory.grow_to(num_pages);
        if let Err(err) = &res {
            self.record_error(err, None, None, String::new());
        }
        res
    }

    pub fn num_code_pages(&self) -> usize {
        self.code.num_total()
    }

    pub fn num_active_code_pages(&self) -> usize {
        self.code.num_active()
    }

    pub fn num_open_code_pages(&self) -> usize {
        self.code.num_open()
    }

    pub fn num_full_code_pages(&self) -> usize {
        self.code.num_full()
    }

    /// Current value of a global of a loaded module.
    pub fn global(&self, module: ModuleIndex, index: GlobalIndex) -> Option<Val> {
        Some(self.modules.get(module)?.global(index)?.value())
    }

    /// Table 0 of a loaded module.
    pub fn table(&self, module: ModuleIndex) -> Option<&[Option<FuncIndex>]> {
        Some(self.modules.get(module)?.table())
    }

    /// The record of the most recent failure.
    pub fn error_info(&self) -> &ErrorInfo {
        &self.error
    }

    /// Returns the record of the most recent failure and resets it.
    pub fn take_error_info(&mut self) -> ErrorInfo {
        core::mem::take(&mut self.error)
    }

    pub fn reset_error_info(&mut self) {
        self.error = ErrorInfo::default();
    }

    #[track_caller]
    pub(crate) fn record_error(
        &mut self,
        error: &Error,
        module: Option<String>,
        function: Option<String>,
        message: String,
    ) {
        let location = Location::caller();
        tracing::debug!("{}: {error} ({location})", self.id);

        self.error = ErrorInfo {
            error: Some(error.clone()),
            runtime: Some(self.id),
            module,
            function,
            location: Some(location),
            message,
        };
    }

    /// Makes sure `func` of a loaded module has code, compiling it if
    /// necessary.
    pub(crate) fn ensure_compiled(&mut self, func: FuncRef) -> Result<CodeRef> {
        let module = self
            .modules
            .get(func.module)
            .ok_or(Error::FunctionLookupFailed)?;
        let entry = compile_function(&self.env, &mut self.code, module, func.func)?;
        self.record_compiled(func.module, [(func.func, entry)]);
        Ok(entry)
    }

    /// Stores entries of functions compiled on behalf of `module`.
    pub(crate) fn record_compiled(
        &mut self,
        module: ModuleIndex,
        compiled: impl IntoIterator<Item = (FuncIndex, CodeRef)>,
    ) {
        let Some(module) = self.modules.get_mut(module) else {
            return;
        };
        for (func, entry) in compiled {
            if let Some(function) = module.functions.get_mut(func) {
                function.set_compiled(entry);
            }
        }
    }
}

/// Compiles `func` into a fresh code page of `code`, or returns its entry if
/// it already has code.
pub(crate) fn compile_function(
    env: &Environment,
    code: &mut CodePages,
    module: &Module,
    func: FuncIndex,
) -> Result<CodeRef> {
    let function = module
        .function(func)
        .ok_or(Error::FunctionIndexOutOfRange)?;
    if let Some(entry) = function.compiled() {
        return Ok(entry);
    }
    if function.is_import() {
        tracing::debug!("import {} is not linked", module.describe(func));
        return Err(Error::MissingCompiledCode);
    }

    let page = code.acquire()?;
    let mut cx = match CompileContext::new(code, module, page) {
        Ok(cx) => cx,
        Err(err) => {
            code.release(page);
            return Err(err);
        }
    };

    let res = env.compiler().compile_function(&mut cx, func);
    let (entry, last_page) = (cx.entry(), cx.page());
    code.release(last_page);
    res?;

    tracing::trace!("compiled {} at {entry:?}", module.describe(func));
    Ok(entry)
}
