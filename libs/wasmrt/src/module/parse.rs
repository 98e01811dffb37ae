// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Decoding of the WebAssembly binary format into a [`Module`].

use alloc::vec::Vec;

use smallvec::SmallVec;

use super::{Function, Global, Import, Module, ModuleBuilder};
use crate::environment::Environment;
use crate::indices::FuncIndex;
use crate::reader::BinaryReader;
use crate::types::{FuncType, ValType};
use crate::{Error, Result};

const WASM_MAGIC: u32 = 0x6d73_6100;
const WASM_VERSION: u32 = 1;

const SECTION_CUSTOM: u8 = 0;
const SECTION_TYPE: u8 = 1;
const SECTION_IMPORT: u8 = 2;
const SECTION_FUNCTION: u8 = 3;
const SECTION_TABLE: u8 = 4;
const SECTION_MEMORY: u8 = 5;
const SECTION_GLOBAL: u8 = 6;
const SECTION_EXPORT: u8 = 7;
const SECTION_START: u8 = 8;
const SECTION_ELEMENT: u8 = 9;
const SECTION_CODE: u8 = 10;
const SECTION_DATA: u8 = 11;
const SECTION_DATA_COUNT: u8 = 12;

const EXTERNAL_FUNCTION: u8 = 0;
const EXTERNAL_TABLE: u8 = 1;
const EXTERNAL_MEMORY: u8 = 2;
const EXTERNAL_GLOBAL: u8 = 3;

const FUNC_FORM: i8 = -0x20;
const NAME_SUBSECTION_FUNCTIONS: u8 = 1;

struct Parser {
    builder: ModuleBuilder,
    max_utf8: u32,
    /// Defined (non-imported) functions in declaration order, waiting for
    /// their bodies.
    defined: Vec<FuncIndex>,
}

// ===== impl Module =====

impl Module {
    /// Decodes a module from its binary representation. Function types are
    /// interned in `env`.
    ///
    /// The decoder checks structure, not validity: function bodies are kept
    /// as raw bytes for the compiler to deal with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadMagic`] or [`Error::BadVersion`] for foreign
    /// input, [`Error::SectionOverrun`] when a section's contents disagree
    /// with its declared size and the reader's errors for truncated or
    /// malformed encodings.
    pub fn parse(env: &Environment, bytes: &[u8]) -> Result<Module> {
        let mut reader = BinaryReader::new(bytes);

        if reader.read_u32()? != WASM_MAGIC {
            return Err(Error::BadMagic);
        }
        let version = reader.read_u32()?;
        if version != WASM_VERSION {
            return Err(Error::BadVersion(version));
        }

        let mut parser = Parser {
            builder: ModuleBuilder::new(env),
            max_utf8: env.config().max_sane_utf8_length,
            defined: Vec::new(),
        };

        while !reader.is_empty() {
            let id = reader.read_u8()?;
            let size = reader.read_var_u32()?;
            let size = usize::try_from(size).map_err(|_| Error::WasmUnderrun)?;
            let mut section = BinaryReader::new(reader.read_bytes(size)?);

            tracing::trace!("section {id} ({size} bytes)");
            parser.section(id, &mut section)?;

            if !section.is_empty() {
                tracing::debug!(
                    "section {id} has {} trailing bytes",
                    section.remaining_bytes().len()
                );
                return Err(Error::SectionOverrun);
            }
        }

        Ok(parser.builder.build())
    }
}

// ===== impl Parser =====

impl Parser {
    fn section(&mut self, id: u8, section: &mut BinaryReader<'_>) -> Result<()> {
        match id {
            SECTION_CUSTOM => self.custom_section(section),
            SECTION_TYPE => self.type_section(section),
            SECTION_IMPORT => self.import_section(section),
            SECTION_FUNCTION => self.function_section(section),
            SECTION_TABLE => skip_rest(section),
            SECTION_MEMORY => self.memory_section(section),
            SECTION_GLOBAL => self.global_section(section),
            SECTION_EXPORT => self.export_section(section),
            SECTION_START => self.start_section(section),
            SECTION_ELEMENT => {
                let count = section.read_var_u32()?;
                self.builder.raw_elements(count, section.remaining_bytes());
                skip_rest(section)
            }
            SECTION_CODE => self.code_section(section),
            SECTION_DATA => self.data_section(section),
            SECTION_DATA_COUNT => section.read_var_u32().map(|_| ()),
            _ => Err(Error::UnknownSection(id)),
        }
    }

    fn type_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        for _ in 0..count {
            let form = section.read_var_i7()?;
            if form != FUNC_FORM {
                return Err(Error::MalformedFunctionSignature);
            }

            let num_params = section.read_var_u32()?;
            let mut params: SmallVec<[ValType; 8]> = SmallVec::new();
            for _ in 0..num_params {
                params.push(ValType::from_wasm_byte(section.read_u8()?)?);
            }

            let result = match section.read_var_u32()? {
                0 => None,
                1 => Some(ValType::from_wasm_byte(section.read_u8()?)?),
                _ => return Err(Error::TooManyResults),
            };

            self.builder.push_type(FuncType::new(result, params));
        }
        Ok(())
    }

    fn import_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        for _ in 0..count {
            let import = Import {
                module: section.read_utf8(self.max_utf8)?,
                field: section.read_utf8(self.max_utf8)?,
            };

            match section.read_u8()? {
                EXTERNAL_FUNCTION => {
                    let ty = self.builder.type_at(section.read_var_u32()?)?;
                    self.builder.push_function(Function::imported(ty, import));
                }
                EXTERNAL_TABLE => {
                    let _elem_type = section.read_u8()?;
                    read_limits(section)?;
                }
                EXTERNAL_MEMORY => {
                    let (initial, max) = read_limits(section)?;
                    self.builder
                        .memory(initial, max)
                        .import_memory(&import.module, &import.field);
                }
                EXTERNAL_GLOBAL => {
                    let ty = ValType::from_wasm_byte(section.read_u8()?)?;
                    let mutable = section.read_var_u7()? != 0;
                    self.builder.push_global(Global {
                        ty,
                        mutable,
                        init: None,
                        import: Some(import),
                        value: 0,
                    });
                }
                kind => return Err(Error::InvalidExternalKind(kind)),
            }
        }
        Ok(())
    }

    fn function_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        for _ in 0..count {
            let ty = self.builder.type_at(section.read_var_u32()?)?;
            let index = self.builder.push_function(Function::defined(ty));
            self.defined.push(index);
        }
        Ok(())
    }

    fn memory_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        for i in 0..count {
            let (initial, max) = read_limits(section)?;
            if i == 0 {
                self.builder.memory(initial, max);
            }
        }
        Ok(())
    }

    fn global_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        for _ in 0..count {
            let ty = ValType::from_wasm_byte(section.read_u8()?)?;
            let mutable = section.read_var_u7()? != 0;
            let init = read_const_expr(section)?;
            self.builder.push_global(Global {
                ty,
                mutable,
                init: Some(init.into()),
                import: None,
                value: 0,
            });
        }
        Ok(())
    }

    fn export_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        for _ in 0..count {
            let name = section.read_utf8(self.max_utf8)?;
            let kind = section.read_u8()?;
            let index = section.read_var_u32()?;

            match kind {
                EXTERNAL_FUNCTION => {
                    self.builder
                        .function_mut(FuncIndex::from_u32(index))?
                        .set_name_if_anonymous(name);
                }
                EXTERNAL_TABLE | EXTERNAL_MEMORY | EXTERNAL_GLOBAL => {}
                kind => return Err(Error::InvalidExternalKind(kind)),
            }
        }
        Ok(())
    }

    fn start_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let index = section.read_var_u32()?;
        let func = FuncIndex::from_u32(index);
        self.builder.function_mut(func)?;
        if self.builder.has_start() {
            tracing::warn!("duplicate start section");
        }
        self.builder.start(func);
        Ok(())
    }

    fn code_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        if usize::try_from(count).ok() != Some(self.defined.len()) {
            tracing::debug!(
                "{count} bodies for {} defined functions",
                self.defined.len()
            );
            return Err(Error::FunctionCountMismatch);
        }

        for index in core::mem::take(&mut self.defined) {
            let size = section.read_var_u32()?;
            let size = usize::try_from(size).map_err(|_| Error::WasmUnderrun)?;
            let mut body = BinaryReader::new(section.read_bytes(size)?);

            let mut num_locals = 0u32;
            let num_groups = body.read_var_u32()?;
            for _ in 0..num_groups {
                let n = body.read_var_u32()?;
                ValType::from_wasm_byte(body.read_u8()?)?;
                num_locals = num_locals.saturating_add(n);
            }

            self.builder
                .function_mut(index)?
                .set_body(num_locals, body.remaining_bytes().into());
        }
        Ok(())
    }

    fn data_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let count = section.read_var_u32()?;
        for _ in 0..count {
            let memory_index = section.read_var_u32()?;
            let offset_expr = read_const_expr(section)?;
            let len = section.read_var_u32()?;
            let len = usize::try_from(len).map_err(|_| Error::WasmUnderrun)?;
            let bytes = section.read_bytes(len)?;
            self.builder
                .data_segment(memory_index, offset_expr.into(), bytes.into());
        }
        Ok(())
    }

    fn custom_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        let name = section.read_utf8(self.max_utf8)?;
        if name == "name" {
            self.name_section(section)?;
        } else {
            tracing::trace!("skipping custom section {name:?}");
        }
        skip_rest(section)
    }

    /// Applies the function names subsection to functions that have no
    /// name yet.
    fn name_section(&mut self, section: &mut BinaryReader<'_>) -> Result<()> {
        while !section.is_empty() {
            let id = section.read_u8()?;
            let size = section.read_var_u32()?;
            let size = usize::try_from(size).map_err(|_| Error::WasmUnderrun)?;
            let mut subsection = BinaryReader::new(section.read_bytes(size)?);

            if id != NAME_SUBSECTION_FUNCTIONS {
                continue;
            }

            let count = subsection.read_var_u32()?;
            for _ in 0..count {
                let index = subsection.read_var_u32()?;
                let name = subsection.read_utf8(self.max_utf8)?;
                match self.builder.function_mut(FuncIndex::from_u32(index)) {
                    Ok(func) => func.set_name_if_anonymous(name),
                    Err(_) => tracing::debug!("name for unknown function {index}"),
                }
            }
        }
        Ok(())
    }
}

fn skip_rest(section: &mut BinaryReader<'_>) -> Result<()> {
    section.skip(section.remaining_bytes().len())
}

/// Reads resizable limits, returning the initial size and optional maximum.
fn read_limits(reader: &mut BinaryReader<'_>) -> Result<(u32, Option<u32>)> {
    let flags = reader.read_var_u32()?;
    let initial = reader.read_var_u32()?;
    let max = if flags & 1 != 0 {
        Some(reader.read_var_u32()?)
    } else {
        None
    };
    Ok((initial, max))
}

/// Returns the bytes of the constant expression at the reader's position,
/// up to and including its `end` opcode.
fn read_const_expr<'a>(reader: &mut BinaryReader<'a>) -> Result<&'a [u8]> {
    let start = reader.remaining_bytes();
    skip_const_expr(reader)?;
    let len = start.len() - reader.remaining_bytes().len();
    Ok(&start[..len])
}

fn skip_const_expr(reader: &mut BinaryReader<'_>) -> Result<()> {
    loop {
        match reader.read_u8()? {
            0x0b => return Ok(()),
            // i32.const
            0x41 => {
                reader.read_var_i32()?;
            }
            // i64.const
            0x42 => {
                reader.read_var_i64()?;
            }
            // f32.const
            0x43 => reader.skip(4)?,
            // f64.const
            0x44 => reader.skip(8)?,
            // global.get, ref.func
            0x23 | 0xd2 => {
                reader.read_var_u32()?;
            }
            // ref.null
            0xd0 => {
                reader.read_u8()?;
            }
            // extended constant arithmetic
            0x6a..=0x6c | 0x7c..=0x7e => {}
            op => return Err(Error::InvalidConstExpr(op)),
        }
    }
}
