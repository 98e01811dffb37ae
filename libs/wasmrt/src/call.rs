// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::string::String;
use alloc::sync::Arc;

use crate::backend::{CallFlags, ExecContext};
use crate::code_page::CodeRef;
use crate::instantiate::module_name;
use crate::memory::WASM_PAGE_SIZE;
use crate::runtime::{FuncRef, Runtime};
use crate::trap::Trap;
use crate::types::FuncType;
use crate::values::Val;
use crate::{Error, Result};

/// Entry points with this name take no arguments from the caller.
const START_ENTRY: &str = "_start";

/// Upper bound, exclusive, on the bytes of one [`Runtime::call_main`]
/// argument including its NUL terminator.
pub const MAX_MAIN_ARG_LENGTH: usize = 4000;

// ===== impl Runtime =====

impl Runtime {
    /// Calls `func` with arguments given as decimal text, one per declared
    /// parameter, and returns its result.
    ///
    /// A function named `_start` is called without arguments whatever `args`
    /// holds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCompiledCode`] if `func` has no code,
    /// [`Error::ArgumentCountMismatch`], [`Error::InvalidArgument`] for text
    /// that does not parse as its parameter type and whatever the executed
    /// code raised.
    #[track_caller]
    pub fn call(&mut self, func: FuncRef, args: &[&str]) -> Result<Option<Val>> {
        let res = self.invoke(func, args, CallFlags::empty());
        if let Err(err) = &res {
            let (module, function) = self
                .modules
                .get(func.module)
                .map(|module| (module_name(module), Some(module.describe(func.func))))
                .unwrap_or_default();
            self.record_error(err, module, function, String::new());
        }
        res
    }

    /// Calls `func` the way a command entry point expects: `args` are copied
    /// into linear memory as NUL terminated strings behind a table of `u32`
    /// pointers, and the function receives the argument count in slot 0 and
    /// the table offset in slot 1.
    ///
    /// The strings are placed in pages grown past the current end of linear
    /// memory. Without arguments the stack is passed as is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCompiledCode`] if `func` has no code,
    /// [`Error::InsaneArgumentLength`] for strings of [`MAX_MAIN_ARG_LENGTH`]
    /// bytes or more (counting the terminator), [`Error::WasmMemoryOverflow`]
    /// if memory cannot grow to hold them and whatever the executed code
    /// raised.
    #[track_caller]
    pub fn call_main(&mut self, func: FuncRef, args: &[&str]) -> Result<Option<Val>> {
        let res = self.invoke_main(func, args);
        if let Err(err) = &res {
            let (module, function) = self
                .modules
                .get(func.module)
                .map(|module| (module_name(module), Some(module.describe(func.func))))
                .unwrap_or_default();
            self.record_error(err, module, function, String::new());
        }
        res
    }

    fn invoke_main(&mut self, func: FuncRef, args: &[&str]) -> Result<Option<Val>> {
        let (entry, ty) = self.entry_point(func)?;

        if !args.is_empty() {
            let argc = u32::try_from(args.len()).map_err(|_| Error::InsaneArgumentCount)?;
            if self.stack.len() < 2 {
                return Err(Error::Trap(Trap::StackOverflow));
            }
            let argv = self.copy_main_args(args)?;

            let [argc_slot, argv_slot, ..] = &mut *self.stack else {
                return Err(Error::Trap(Trap::StackOverflow));
            };
            *argc_slot = u64::from(argc);
            *argv_slot = u64::from(argv);
        }

        tracing::trace!(
            "calling main {} with {} arguments",
            self.modules
                .get(func.module)
                .map(|module| module.describe(func.func))
                .unwrap_or_default(),
            args.len()
        );
        self.run(func, entry, &ty, CallFlags::empty())
    }

    /// Writes the pointer table and strings of `args` past the current end of
    /// linear memory and returns the offset of the table.
    fn copy_main_args(&mut self, args: &[&str]) -> Result<u32> {
        let mut len = args.len() * size_of::<u32>();
        for arg in args {
            let arg_len = arg.len() + 1;
            if arg_len >= MAX_MAIN_ARG_LENGTH {
                return Err(Error::InsaneArgumentLength);
            }
            len += arg_len;
        }

        let base = self.memory.len();
        let end = base.checked_add(len).ok_or(Error::WasmMemoryOverflow)?;
        let num_pages = u32::try_from(end.div_ceil(WASM_PAGE_SIZE))
            .map_err(|_| Error::WasmMemoryOverflow)?;
        self.memory.grow_to(num_pages)?;
        if self.memory.len() < end {
            // clamped by the memory limit
            return Err(Error::WasmMemoryOverflow);
        }

        let table = u32::try_from(base).map_err(|_| Error::WasmMemoryOverflow)?;
        let mut pointer = base;
        let mut string = base + args.len() * size_of::<u32>();
        for arg in args {
            let offset = u32::try_from(string).map_err(|_| Error::WasmMemoryOverflow)?;
            self.memory.write(pointer, &offset.to_le_bytes())?;
            self.memory.write(string, arg.as_bytes())?;
            self.memory.write(string + arg.len(), &[0])?;

            pointer += size_of::<u32>();
            string += arg.len() + 1;
        }

        Ok(table)
    }

    pub(crate) fn invoke(
        &mut self,
        func: FuncRef,
        args: &[&str],
        flags: CallFlags,
    ) -> Result<Option<Val>> {
        let (entry, ty) = self.entry_point(func)?;

        let is_start_entry = self
            .modules
            .get(func.module)
            .and_then(|module| module.function(func.func))
            .is_some_and(|function| function.name() == Some(START_ENTRY));
        let args = if is_start_entry {
            &[][..]
        } else {
            if args.len() != ty.num_params() {
                return Err(Error::ArgumentCountMismatch);
            }
            args
        };

        tracing::trace!(
            "calling {} {ty} with {args:?}",
            self.modules
                .get(func.module)
                .map(|module| module.describe(func.func))
                .unwrap_or_default()
        );

        let stack = &mut self.stack;
        if ty.num_params() > stack.len() {
            return Err(Error::Trap(Trap::StackOverflow));
        }
        stack[..ty.num_params()].fill(0);
        for ((slot, param), text) in stack.iter_mut().zip(ty.params()).zip(args) {
            *slot = Val::parse(*param, text)?.to_slot();
        }

        self.run(func, entry, &ty, flags)
    }

    fn entry_point(&self, func: FuncRef) -> Result<(CodeRef, Arc<FuncType>)> {
        let function = self
            .modules
            .get(func.module)
            .ok_or(Error::FunctionLookupFailed)?
            .function(func.func)
            .ok_or(Error::FunctionIndexOutOfRange)?;
        let entry = function.compiled().ok_or(Error::MissingCompiledCode)?;
        Ok((entry, function.ty().clone()))
    }

    /// Executes `entry` on the current stack and reads the result of `ty`
    /// from slot 0.
    fn run(
        &mut self,
        func: FuncRef,
        entry: CodeRef,
        ty: &FuncType,
        flags: CallFlags,
    ) -> Result<Option<Val>> {
        let module = self
            .modules
            .get(func.module)
            .ok_or(Error::FunctionLookupFailed)?;
        let mut cx = ExecContext::new(
            &self.env,
            &mut self.code,
            Some(module),
            &mut self.stack,
            &mut self.memory,
            flags,
        );
        let res = self.env.executor().execute(&mut cx, entry);
        let compiled = cx.into_compiled();
        self.record_compiled(func.module, compiled);
        res?;

        let Some(result) = ty.result() else {
            return Ok(None);
        };
        let slot = self
            .stack
            .first()
            .copied()
            .ok_or(Error::Trap(Trap::StackOverflow))?;
        let val = Val::from_slot(result, slot);

        tracing::trace!("result {val}");
        Ok(Some(val))
    }
}
