// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resolution of imported functions to host functions, and lookup of
//! functions by name.

use alloc::format;
use alloc::string::String;

use crate::backend::NativeFunction;
use crate::code_page::{CodePages, CodeRef, Line, Opcode};
use crate::environment::Environment;
use crate::indices::ModuleIndex;
use crate::instantiate::module_name;
use crate::module::Function;
use crate::runtime::{FuncRef, Runtime};
use crate::{Error, Result};

/// Matches any import module name.
pub const WILDCARD_MODULE: &str = "*";

#[derive(Clone, Copy)]
enum LinkStrategy {
    Raw(NativeFunction),
    RawWithCookie(NativeFunction, u64),
}

// ===== impl LinkStrategy =====

impl LinkStrategy {
    fn num_lines(self) -> usize {
        match self {
            LinkStrategy::Raw(_) => 2,
            LinkStrategy::RawWithCookie(..) => 3,
        }
    }

    /// Emits the call-native sequence into a page of `code`.
    fn install(self, code: &mut CodePages) -> Result<CodeRef> {
        let id = code.acquire_with_capacity(self.num_lines())?;

        let res = code.get_mut(id).ok_or(Error::InvalidCodeRef).and_then(|page| {
            let entry = CodeRef {
                page: id,
                line: page.pc(),
            };
            match self {
                LinkStrategy::Raw(func) => {
                    page.emit(Line::Op(Opcode::CALL_RAW))?;
                    page.emit(Line::Native(func))?;
                }
                LinkStrategy::RawWithCookie(func, cookie) => {
                    page.emit(Line::Op(Opcode::CALL_RAW_EX))?;
                    page.emit(Line::Native(func))?;
                    page.emit(Line::Imm(cookie))?;
                }
            }
            Ok(entry)
        });

        code.release(id);
        res
    }
}

/// Checks that `signature` describes the type `func` was declared with.
fn validate_signature(env: &Environment, func: &Function, signature: &str) -> Result<()> {
    let ty = env.parse_signature(signature)?;
    if *ty != **func.ty() {
        tracing::warn!(
            "function signature mismatch: expected {}, found {}",
            func.ty(),
            ty
        );
        return Err(Error::SignatureMismatch);
    }
    Ok(())
}

// ===== impl Runtime =====

impl Runtime {
    /// Links `func` to every import of module `module` named `field` whose
    /// import module is `module_name`, or any module if `module_name` is
    /// [`WILDCARD_MODULE`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureMismatch`] if `signature` disagrees with a
    /// matching import's type and [`Error::FunctionLookupFailed`] if nothing
    /// matches.
    #[track_caller]
    pub fn link_raw_function(
        &mut self,
        module: ModuleIndex,
        module_name: &str,
        field: &str,
        signature: &str,
        func: NativeFunction,
    ) -> Result<()> {
        let res = self.find_and_link(
            module,
            module_name,
            field,
            signature,
            LinkStrategy::Raw(func),
            false,
        );
        self.record_link_error(res, module, module_name, field)
    }

    /// Links `func` to the first matching import like
    /// [`Runtime::link_raw_function`]. `cookie` is handed to `func` on every
    /// call through [`NativeFrame::cookie`](crate::NativeFrame::cookie).
    ///
    /// # Errors
    ///
    /// See [`Runtime::link_raw_function`].
    #[track_caller]
    pub fn link_raw_function_ex(
        &mut self,
        module: ModuleIndex,
        module_name: &str,
        field: &str,
        signature: &str,
        func: NativeFunction,
        cookie: u64,
    ) -> Result<()> {
        let res = self.find_and_link(
            module,
            module_name,
            field,
            signature,
            LinkStrategy::RawWithCookie(func, cookie),
            true,
        );
        self.record_link_error(res, module, module_name, field)
    }

    fn find_and_link(
        &mut self,
        module: ModuleIndex,
        module_name: &str,
        field: &str,
        signature: &str,
        strategy: LinkStrategy,
        first_only: bool,
    ) -> Result<()> {
        let Some(target) = self.modules.get_mut(module) else {
            return Err(Error::FunctionLookupFailed);
        };

        let wildcard = module_name == WILDCARD_MODULE;
        let mut linked = false;

        for (index, function) in target.functions.iter_mut() {
            let Some(import) = function.import() else {
                continue;
            };
            let module_matches = wildcard || import.module == module_name;
            if import.field != field || !module_matches {
                continue;
            }

            validate_signature(&self.env, function, signature)?;
            let entry = strategy.install(&mut self.code)?;
            function.set_compiled(entry);
            linked = true;

            tracing::debug!(
                "linked {}.{} (function {}) to a host function",
                import_module_of(function),
                field,
                index.as_u32()
            );
            if first_only {
                break;
            }
        }

        if linked {
            Ok(())
        } else {
            Err(Error::FunctionLookupFailed)
        }
    }

    #[track_caller]
    fn record_link_error(
        &mut self,
        res: Result<()>,
        module: ModuleIndex,
        import_module: &str,
        field: &str,
    ) -> Result<()> {
        if let Err(err) = &res {
            let name = self.modules.get(module).and_then(module_name);
            let message = format!("{import_module}.{field}");
            self.record_error(err, name, Some(String::from(field)), message);
        }
        res
    }

    /// Looks up a function by its display name, most recently loaded module
    /// first, and compiles it if it has no code yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoModulesLoaded`] for an empty runtime,
    /// [`Error::FunctionLookupFailed`] if no function has that name and
    /// compilation errors.
    #[track_caller]
    pub fn find_function(&mut self, name: &str) -> Result<FuncRef> {
        let res = self.find_function_inner(name);
        if let Err(err) = &res {
            let module = self.modules().next().and_then(|(_, module)| module_name(module));
            self.record_error(err, module, Some(String::from(name)), format!("'{name}'"));
        }
        res
    }

    fn find_function_inner(&mut self, name: &str) -> Result<FuncRef> {
        if self.modules.is_empty() {
            return Err(Error::NoModulesLoaded);
        }

        let func = self
            .modules()
            .find_map(|(module, m)| m.find_function(name).map(|func| FuncRef { module, func }))
            .ok_or(Error::FunctionLookupFailed)?;

        self.ensure_compiled(func)?;
        Ok(func)
    }
}

fn import_module_of(function: &Function) -> &str {
    function.import().map_or("", |import| import.module.as_str())
}
