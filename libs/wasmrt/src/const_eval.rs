// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Evaluation of constant initializer expressions.
//!
//! Constant expressions run through the same compile-then-execute path as
//! ordinary functions, on a scratch runtime that shares the environment of
//! the module being instantiated.

use crate::backend::{CallFlags, CompileContext, ExecContext};
use crate::environment::Environment;
use crate::module::Module;
use crate::runtime::Runtime;
use crate::types::ValType;
use crate::{Error, Result};

/// Evaluates the constant expression at the start of `expr`, returning its
/// raw slot value and the number of bytes it occupied.
pub(crate) fn evaluate(
    env: &Environment,
    module: &Module,
    expr: &[u8],
    ty: ValType,
) -> Result<(u64, usize)> {
    let mut scratch = Runtime::scratch(env, env.config().const_expr_stack_slots)?;
    scratch.evaluate_const_expr(module, expr, ty)
}

// ===== impl Runtime =====

impl Runtime {
    fn evaluate_const_expr(
        &mut self,
        module: &Module,
        expr: &[u8],
        ty: ValType,
    ) -> Result<(u64, usize)> {
        let page = self
            .code
            .acquire()
            .map_err(|_| Error::MallocFailedCodePage)?;

        let (res, last_page) = match CompileContext::new(&mut self.code, module, page) {
            Ok(mut cx) => {
                let res = self
                    .env
                    .compiler()
                    .compile_const_expr(&mut cx, expr, ty)
                    .map(|consumed| (cx.entry(), consumed));
                (res, cx.page())
            }
            Err(err) => (Err(err), page),
        };

        let res = res.and_then(|(entry, consumed)| {
            let mut cx = ExecContext::new(
                &self.env,
                &mut self.code,
                Some(module),
                &mut self.stack,
                &mut self.memory,
                CallFlags::CONST_EXPR,
            );
            self.env.executor().execute(&mut cx, entry)?;
            Ok(consumed)
        });
        self.code.release(last_page);
        let consumed = res?;

        let slot = self.stack.first().copied().ok_or(Error::MallocFailed)?;
        let value = if ty.is_64bit() {
            slot
        } else {
            slot & u64::from(u32::MAX)
        };

        tracing::trace!("constant expression evaluated to {value:#x} ({ty})");
        Ok((value, consumed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_a_compiler() {
        let env = Environment::new();
        let module = Module::default();
        let expr = crate::const_i32(7).unwrap();

        assert_eq!(
            evaluate(&env, &module, &expr, ValType::I32),
            Err(Error::MissingCompiledCode)
        );
        // the scratch runtime gave its page back
        assert_eq!(env.num_released_code_pages(), 1);
    }
}
