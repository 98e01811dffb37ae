// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The seams between the engine and the code it runs.
//!
//! Turning function bodies into code lines is the job of a [`Compiler`];
//! running those lines is the job of an [`Executor`]. The engine itself only
//! knows how to emit and run the call-native sequences the linker installs
//! for imported functions, which is what [`NativeExecutor`] does.

use core::fmt;

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::code_page::{CodePages, CodeRef, Line, Opcode, PageId};
use crate::environment::Environment;
use crate::indices::FuncIndex;
use crate::memory::LinearMemory;
use crate::module::Module;
use crate::runtime::compile_function;
use crate::trap::Trap;
use crate::types::ValType;
use crate::values::Val;
use crate::{Error, Result};

/// One uniformly sized slot of the argument/locals stack.
pub type Slot = u64;

/// A host function linked to an import.
pub type NativeFunction = fn(&mut NativeFrame<'_>) -> Result<()>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CallFlags: u32 {
        /// The call runs a module's start function.
        const START = 1 << 0;
        /// The call evaluates a constant initializer on a scratch runtime.
        const CONST_EXPR = 1 << 1;
    }
}

pub trait Compiler: fmt::Debug + Send + Sync {
    /// Emits the code for `func` starting at `cx.entry()`.
    ///
    /// # Errors
    ///
    /// Reports whatever prevents the function from being compiled.
    fn compile_function(&self, cx: &mut CompileContext<'_>, func: FuncIndex) -> Result<()>;

    /// Emits code evaluating the constant expression at the start of `expr`
    /// and leaving a value of type `ty` in slot 0. Returns the number of
    /// bytes the expression occupied, including its `end` opcode.
    ///
    /// # Errors
    ///
    /// Reports malformed or unsupported expressions.
    fn compile_const_expr(
        &self,
        cx: &mut CompileContext<'_>,
        expr: &[u8],
        ty: ValType,
    ) -> Result<usize>;
}

pub trait Executor: fmt::Debug + Send + Sync {
    /// Runs the code starting at `entry`. Arguments are in the stack slots
    /// starting at 0 and the result, if any, is expected in slot 0.
    ///
    /// # Errors
    ///
    /// Propagates traps and errors raised by the executed code.
    fn execute(&self, cx: &mut ExecContext<'_>, entry: CodeRef) -> Result<()>;
}

/// Hook the host can use to interleave engine execution with other
/// cooperative work.
pub trait YieldHook: fmt::Debug + Send + Sync {
    /// # Errors
    ///
    /// An error aborts the running call.
    fn on_yield(&self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoYield;

impl YieldHook for NoYield {
    fn on_yield(&self) -> Result<()> {
        Ok(())
    }
}

/// The compiler installed when the host supplies none: only linked imports
/// can be called.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedCompiler;

impl Compiler for UnsupportedCompiler {
    fn compile_function(&self, _cx: &mut CompileContext<'_>, _func: FuncIndex) -> Result<()> {
        Err(Error::MissingCompiledCode)
    }

    fn compile_const_expr(
        &self,
        _cx: &mut CompileContext<'_>,
        _expr: &[u8],
        _ty: ValType,
    ) -> Result<usize> {
        Err(Error::MissingCompiledCode)
    }
}

/// Runs call-native sequences and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeExecutor;

impl NativeExecutor {
    /// Runs the call-native sequence at `at` with the native function seeing
    /// the stack from slot `sp` on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownOpcode`] if `at` does not start a call-native
    /// sequence and propagates errors of the native function.
    pub fn call_native_at(cx: &mut ExecContext<'_>, at: CodeRef, sp: usize) -> Result<()> {
        let cookie = match cx.fetch(at)? {
            Line::Op(Opcode::CALL_RAW) => None,
            Line::Op(Opcode::CALL_RAW_EX) => match cx.fetch(at.offset(2))? {
                Line::Imm(cookie) => Some(cookie),
                _ => return Err(Error::InvalidCodeRef),
            },
            Line::Op(op) => return Err(Error::UnknownOpcode(op.0)),
            _ => return Err(Error::InvalidCodeRef),
        };
        let Line::Native(func) = cx.fetch(at.offset(1))? else {
            return Err(Error::InvalidCodeRef);
        };

        cx.call_native(func, sp, cookie)
    }
}

impl Executor for NativeExecutor {
    fn execute(&self, cx: &mut ExecContext<'_>, entry: CodeRef) -> Result<()> {
        Self::call_native_at(cx, entry, 0)
    }
}

/// Where a [`Compiler`] writes its output.
pub struct CompileContext<'a> {
    code: &'a mut CodePages,
    module: &'a Module,
    page: PageId,
    entry: CodeRef,
}

// ===== impl CompileContext =====

impl<'a> CompileContext<'a> {
    pub(crate) fn new(code: &'a mut CodePages, module: &'a Module, page: PageId) -> Result<Self> {
        let pc = code.get(page).ok_or(Error::InvalidCodeRef)?.pc();
        Ok(Self {
            code,
            module,
            page,
            entry: CodeRef { page, line: pc },
        })
    }

    pub fn module(&self) -> &'a Module {
        self.module
    }

    /// Where the emitted code starts.
    pub fn entry(&self) -> CodeRef {
        self.entry
    }

    /// Where the next emitted line goes.
    pub fn pc(&self) -> CodeRef {
        CodeRef {
            page: self.page,
            line: self.code.get(self.page).map_or(0, |page| page.pc()),
        }
    }

    pub fn num_free_lines(&self) -> usize {
        self.code.get(self.page).map_or(0, |page| page.num_free_lines())
    }

    /// # Errors
    ///
    /// Returns [`Error::CodePageOverflow`] if the current page is full; use
    /// [`CompileContext::switch_page`] to continue on a fresh one.
    pub fn emit(&mut self, line: Line) -> Result<CodeRef> {
        let page = self.code.get_mut(self.page).ok_or(Error::InvalidCodeRef)?;
        let line_index = page.emit(line)?;
        Ok(CodeRef {
            page: self.page,
            line: line_index,
        })
    }

    /// Overwrites an already emitted line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCodeRef`] if nothing was emitted at `at`.
    pub fn patch(&mut self, at: CodeRef, line: Line) -> Result<()> {
        self.code
            .get_mut(at.page)
            .ok_or(Error::InvalidCodeRef)?
            .patch(at.line, line)
    }

    /// Releases the current page and continues on one with at least
    /// `min_lines` free lines. Bridging the two pages is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MallocFailedCodePage`] if no page can be acquired.
    pub fn switch_page(&mut self, min_lines: usize) -> Result<CodeRef> {
        let next = self.code.acquire_with_capacity(min_lines)?;
        self.code.release(self.page);
        self.page = next;
        Ok(self.pc())
    }

    pub(crate) fn page(&self) -> PageId {
        self.page
    }
}

/// What an [`Executor`] runs against.
pub struct ExecContext<'a> {
    env: &'a Environment,
    code: &'a mut CodePages,
    module: Option<&'a Module>,
    stack: &'a mut [Slot],
    memory: &'a mut LinearMemory,
    flags: CallFlags,
    /// Functions compiled while running, handed back to the module afterwards.
    compiled: HashMap<FuncIndex, CodeRef>,
}

// ===== impl ExecContext =====

impl<'a> ExecContext<'a> {
    pub(crate) fn new(
        env: &'a Environment,
        code: &'a mut CodePages,
        module: Option<&'a Module>,
        stack: &'a mut [Slot],
        memory: &'a mut LinearMemory,
        flags: CallFlags,
    ) -> Self {
        Self {
            env,
            code,
            module,
            stack,
            memory,
            flags,
            compiled: HashMap::new(),
        }
    }

    pub(crate) fn into_compiled(self) -> HashMap<FuncIndex, CodeRef> {
        self.compiled
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidCodeRef`] if `at` does not address an emitted
    /// line of this runtime.
    pub fn fetch(&self, at: CodeRef) -> Result<Line> {
        self.code.line(at).ok_or(Error::InvalidCodeRef)
    }

    /// The module the running code belongs to, if known.
    pub fn module(&self) -> Option<&'a Module> {
        self.module
    }

    /// Entry of function `func` of the running module, compiling it on first
    /// use. Executors call this before transferring control to a callee.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FunctionLookupFailed`] without a running module,
    /// [`Error::MissingCompiledCode`] for imports that were never linked and
    /// propagates compilation errors.
    pub fn ensure_compiled(&mut self, func: FuncIndex) -> Result<CodeRef> {
        let module = self.module.ok_or(Error::FunctionLookupFailed)?;
        if let Some(entry) = self.compiled.get(&func) {
            return Ok(*entry);
        }

        let entry = compile_function(self.env, self.code, module, func)?;
        if module.function(func).and_then(|f| f.compiled()).is_none() {
            self.compiled.insert(func, entry);
        }
        Ok(entry)
    }

    pub fn stack(&mut self) -> &mut [Slot] {
        &mut *self.stack
    }

    pub fn memory(&mut self) -> &mut LinearMemory {
        &mut *self.memory
    }

    pub fn flags(&self) -> CallFlags {
        self.flags
    }

    /// # Errors
    ///
    /// Propagates the environment's [`YieldHook`].
    pub fn yield_now(&self) -> Result<()> {
        self.env.yield_now()
    }

    /// Calls `func` with its frame starting at stack slot `sp`.
    ///
    /// # Errors
    ///
    /// Traps with [`Trap::StackOverflow`] if `sp` is past the stack and
    /// propagates errors of `func`.
    pub fn call_native(&mut self, func: NativeFunction, sp: usize, cookie: Option<u64>) -> Result<()> {
        let stack = self
            .stack
            .get_mut(sp..)
            .ok_or(Error::Trap(Trap::StackOverflow))?;
        let mut frame = NativeFrame {
            stack,
            memory: &mut *self.memory,
            cookie,
        };
        func(&mut frame)
    }
}

/// The view a [`NativeFunction`] gets of the engine: its argument slots, the
/// linear memory and the cookie it was linked with.
///
/// Arguments occupy slots `0..n` and the return value goes to slot 0.
pub struct NativeFrame<'a> {
    stack: &'a mut [Slot],
    memory: &'a mut LinearMemory,
    cookie: Option<u64>,
}

// ===== impl NativeFrame =====

impl NativeFrame<'_> {
    pub fn cookie(&self) -> Option<u64> {
        self.cookie
    }

    pub fn memory(&self) -> &LinearMemory {
        &*self.memory
    }

    pub fn memory_mut(&mut self) -> &mut LinearMemory {
        &mut *self.memory
    }

    /// # Errors
    ///
    /// Traps with [`Trap::StackOverflow`] for slots past the stack.
    pub fn slot(&self, index: usize) -> Result<Slot> {
        self.stack
            .get(index)
            .copied()
            .ok_or(Error::Trap(Trap::StackOverflow))
    }

    /// # Errors
    ///
    /// Traps with [`Trap::StackOverflow`] for slots past the stack.
    pub fn set_slot(&mut self, index: usize, value: Slot) -> Result<()> {
        *self
            .stack
            .get_mut(index)
            .ok_or(Error::Trap(Trap::StackOverflow))? = value;
        Ok(())
    }

    /// Reads argument `index` as a value of type `ty`.
    ///
    /// # Errors
    ///
    /// Traps with [`Trap::StackOverflow`] for slots past the stack.
    pub fn arg(&self, index: usize, ty: ValType) -> Result<Val> {
        Ok(Val::from_slot(ty, self.slot(index)?))
    }

    /// # Errors
    ///
    /// Traps with [`Trap::StackOverflow`] if the stack is empty.
    pub fn set_result(&mut self, val: Val) -> Result<()> {
        self.set_slot(0, val.to_slot())
    }
}
