// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use leb128::Leb128Write;

use super::{DataSegment, FuncName, Function, Global, Import, MemoryInfo, Module};
use crate::environment::Environment;
use crate::indices::{FuncIndex, GlobalIndex, TypeIndex};
use crate::types::{FuncType, ValType};
use crate::{Error, Result};

const END: u8 = 0x0b;

/// `i32.const value; end`
///
/// # Errors
///
/// Returns [`Error::MallocFailed`] if the expression cannot be allocated.
pub fn const_i32(value: i32) -> Result<Vec<u8>> {
    const_i64_op(0x41, i64::from(value))
}

/// `i64.const value; end`
///
/// # Errors
///
/// Returns [`Error::MallocFailed`] if the expression cannot be allocated.
pub fn const_i64(value: i64) -> Result<Vec<u8>> {
    const_i64_op(0x42, value)
}

/// `global.get index; end`
///
/// # Errors
///
/// Returns [`Error::MallocFailed`] if the expression cannot be allocated.
pub fn const_global_get(index: GlobalIndex) -> Result<Vec<u8>> {
    let mut expr = vec![0x23];
    expr.write_uleb128(u64::from(index.as_u32()))?;
    expr.write_byte(END)?;
    Ok(expr)
}

fn const_i64_op(op: u8, value: i64) -> Result<Vec<u8>> {
    let mut expr = vec![op];
    expr.write_sleb128(value)?;
    expr.write_byte(END)?;
    Ok(expr)
}

/// Assembles a [`Module`] piece by piece, the same shape the binary decoder
/// produces.
#[derive(Debug)]
pub struct ModuleBuilder {
    env: Environment,
    module: Module,
}

// ===== impl ModuleBuilder =====

impl ModuleBuilder {
    pub fn new(env: &Environment) -> Self {
        Self {
            env: env.clone(),
            module: Module::default(),
        }
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.module.set_name(name);
        self
    }

    pub(crate) fn push_type(&mut self, ty: FuncType) -> TypeIndex {
        let ty = self.env.intern_func_type(ty);
        self.module.types.push(ty)
    }

    /// Declares a function type from its textual signature. A module holds
    /// each type once, so declaring it again returns the first index.
    ///
    /// # Errors
    ///
    /// Returns signature parse errors.
    pub fn func_type(&mut self, signature: &str) -> Result<TypeIndex> {
        let ty = self.env.parse_signature(signature)?;
        Ok(self.type_index(&ty))
    }

    fn type_index(&mut self, ty: &Arc<FuncType>) -> TypeIndex {
        let existing = self
            .module
            .types
            .iter()
            .find_map(|(index, other)| Arc::ptr_eq(other, ty).then_some(index));
        match existing {
            Some(index) => index,
            None => self.module.types.push(ty.clone()),
        }
    }

    pub(crate) fn type_at(&self, index: u32) -> Result<Arc<FuncType>> {
        self.module
            .types
            .get(TypeIndex::from_u32(index))
            .cloned()
            .ok_or(Error::InvalidTypeId)
    }

    pub(crate) fn push_function(&mut self, func: Function) -> FuncIndex {
        self.module.functions.push(func)
    }

    pub(crate) fn function_mut(&mut self, index: FuncIndex) -> Result<&mut Function> {
        self.module
            .functions
            .get_mut(index)
            .ok_or(Error::FunctionIndexOutOfRange)
    }

    /// Declares an imported function with a textual signature.
    ///
    /// # Errors
    ///
    /// Returns signature parse errors.
    pub fn import_function(
        &mut self,
        module: &str,
        field: &str,
        signature: &str,
    ) -> Result<FuncIndex> {
        let ty = self.env.parse_signature(signature)?;
        self.type_index(&ty);
        Ok(self.push_function(Function::imported(
            ty,
            Import {
                module: module.to_owned(),
                field: field.to_owned(),
            },
        )))
    }

    /// Defines a function from its instruction bytes (excluding the local
    /// declarations).
    ///
    /// # Errors
    ///
    /// Returns signature parse errors.
    pub fn function(&mut self, signature: &str, num_locals: u32, body: &[u8]) -> Result<FuncIndex> {
        let ty = self.env.parse_signature(signature)?;
        self.type_index(&ty);
        let mut func = Function::defined(ty);
        func.set_body(num_locals, body.into());
        Ok(self.push_function(func))
    }

    /// Exports `func` under `name`. A function keeps the first name it gets.
    pub fn export(&mut self, func: FuncIndex, name: &str) -> &mut Self {
        if let Some(func) = self.module.functions.get_mut(func) {
            func.set_name_if_anonymous(name.to_owned());
        }
        self
    }

    pub fn global(&mut self, ty: ValType, mutable: bool, init_expr: &[u8]) -> GlobalIndex {
        self.module.globals.push(Global {
            ty,
            mutable,
            init: Some(init_expr.into()),
            import: None,
            value: 0,
        })
    }

    pub fn import_global(
        &mut self,
        module: &str,
        field: &str,
        ty: ValType,
        mutable: bool,
    ) -> GlobalIndex {
        self.module.globals.push(Global {
            ty,
            mutable,
            init: None,
            import: Some(Import {
                module: module.to_owned(),
                field: field.to_owned(),
            }),
            value: 0,
        })
    }

    pub fn memory(&mut self, initial_pages: u32, max_pages: Option<u32>) -> &mut Self {
        self.module.memory = Some(MemoryInfo {
            initial_pages,
            max_pages,
        });
        self
    }

    pub fn import_memory(&mut self, module: &str, field: &str) -> &mut Self {
        self.module.memory_import = Some(Import {
            module: module.to_owned(),
            field: field.to_owned(),
        });
        self
    }

    pub fn data(&mut self, offset_expr: &[u8], bytes: &[u8]) -> &mut Self {
        self.data_segment(0, offset_expr.into(), bytes.into());
        self
    }

    pub(crate) fn data_segment(&mut self, memory_index: u32, offset_expr: Box<[u8]>, bytes: Box<[u8]>) {
        self.module.data_segments.push(DataSegment {
            memory_index,
            offset_expr,
            bytes,
        });
    }

    /// Appends an element segment placing `funcs` into table `table_index`
    /// at the offset computed by `offset_expr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MallocFailed`] if the encoded segment cannot grow.
    pub fn elements(&mut self, table_index: u32, offset_expr: &[u8], funcs: &[u32]) -> Result<&mut Self> {
        let count = u32::try_from(funcs.len()).map_err(|_| Error::TableOverflow)?;

        let section = &mut self.module.elements;
        section.bytes.write_uleb128(u64::from(table_index))?;
        section.bytes.extend_from_slice(offset_expr);
        section.bytes.write_uleb128(u64::from(count))?;
        for func in funcs {
            section.bytes.write_uleb128(u64::from(*func))?;
        }
        section.count += 1;

        Ok(self)
    }

    /// Installs an already encoded element section body.
    pub(crate) fn raw_elements(&mut self, count: u32, bytes: &[u8]) {
        self.module.elements.count = count;
        self.module.elements.bytes = bytes.to_vec();
    }

    pub(crate) fn push_global(&mut self, global: Global) -> GlobalIndex {
        self.module.globals.push(global)
    }

    pub fn start(&mut self, func: FuncIndex) -> &mut Self {
        self.module.start = Some(func);
        self
    }

    pub(crate) fn has_start(&self) -> bool {
        self.module.start.is_some()
    }

    pub fn build(self) -> Module {
        debug_assert!(
            self.module
                .functions
                .values()
                .all(|f| f.is_import() || f.name != FuncName::ImportField)
        );
        self.module
    }
}
