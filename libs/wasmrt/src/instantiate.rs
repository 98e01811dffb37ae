// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;

use crate::backend::CallFlags;
use crate::const_eval;
use crate::indices::{FuncIndex, ModuleIndex};
use crate::module::{MemoryInfo, Module};
use crate::reader::BinaryReader;
use crate::runtime::{FuncRef, Runtime};
use crate::types::ValType;
use crate::{Error, Result};

/// A failed [`Runtime::load_module`].
///
/// If the failure happened before the module was linked into the runtime,
/// the module is handed back (detached from the runtime). A module whose
/// start function failed stays linked and is identified by
/// [`LoadError::linked`] instead.
#[derive(Debug)]
pub struct LoadError {
    error: Error,
    module: Option<Box<Module>>,
    linked: Option<ModuleIndex>,
}

// ===== impl LoadError =====

impl LoadError {
    fn detached(error: Error, module: Module) -> Self {
        Self {
            error,
            module: Some(Box::new(module)),
            linked: None,
        }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The module, if it was not linked.
    pub fn into_module(self) -> Option<Module> {
        self.module.map(|module| *module)
    }

    /// Where the module was linked, if its start function failed.
    pub fn linked(&self) -> Option<ModuleIndex> {
        self.linked
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl core::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        err.error
    }
}

// ===== impl Runtime =====

impl Runtime {
    /// Instantiates `module` into this runtime: sizes linear memory,
    /// initializes globals, applies data and element segments, links the
    /// module and finally runs its start function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleAlreadyLinked`] for modules that belong to a
    /// runtime and whatever error aborted one of the phases. Side effects of
    /// the phases that ran before the failure, such as grown memory, are not
    /// undone.
    #[track_caller]
    pub fn load_module(&mut self, mut module: Module) -> Result<ModuleIndex, LoadError> {
        if let Some(owner) = module.runtime {
            tracing::debug!("module {:?} is already linked to {owner}", module.name());
            let error = Error::ModuleAlreadyLinked;
            self.record_error(&error, module_name(&module), None, String::new());
            return Err(LoadError::detached(error, module));
        }

        module.runtime = Some(self.id());
        if let Err(error) = self.initialize(&mut module) {
            module.runtime = None;
            self.record_error(&error, module_name(&module), None, String::new());
            return Err(LoadError::detached(error, module));
        }

        let start = module.start();
        let index = self.modules.push(module);
        tracing::debug!("linked module {index:?} into {}", self.id());

        if let Some(start) = start {
            if let Err(error) = self.run_start(index, start) {
                let (module, function) = self
                    .modules
                    .get(index)
                    .map(|module| (module_name(module), Some(module.describe(start))))
                    .unwrap_or_default();
                self.record_error(&error, module, function, String::from("start function failed"));
                return Err(LoadError {
                    error,
                    module: None,
                    linked: Some(index),
                });
            }
        }

        Ok(index)
    }

    fn initialize(&mut self, module: &mut Module) -> Result<()> {
        self.init_memory(module)?;
        self.init_globals(module)?;
        self.init_data_segments(module)?;
        self.init_elements(module)?;
        Ok(())
    }

    fn init_memory(&mut self, module: &Module) -> Result<()> {
        if module.is_memory_imported() {
            tracing::debug!("memory is imported, leaving it unallocated");
            return Ok(());
        }

        let info = module.memory().unwrap_or(MemoryInfo {
            initial_pages: 0,
            max_pages: None,
        });
        let max_pages = match info.max_pages {
            Some(max) if max > 0 => max,
            _ => self.env.config().default_max_memory_pages,
        };

        tracing::debug!(
            "initializing memory: {} pages, maximum {max_pages}",
            info.initial_pages
        );
        self.memory.set_max_pages(max_pages);
        self.memory.grow_to(info.initial_pages)
    }

    fn init_globals(&mut self, module: &mut Module) -> Result<()> {
        for index in module.globals.keys() {
            let global = &module.globals[index];
            let Some(expr) = global.init_expr() else {
                tracing::warn!("importing global {}", index.as_u32());
                continue;
            };

            tracing::debug!("initializing global {}", index.as_u32());
            let (value, _) = const_eval::evaluate(&self.env, module, expr, global.ty())?;
            module.globals[index].set_raw_value(value);
        }
        Ok(())
    }

    fn init_data_segments(&mut self, module: &Module) -> Result<()> {
        for (i, segment) in module.data_segments().iter().enumerate() {
            let (offset, _) =
                const_eval::evaluate(&self.env, module, segment.offset_expr(), ValType::I32)?;
            let offset = usize::try_from(offset).map_err(|_| Error::DataSegmentOverflow)?;

            tracing::debug!(
                "loading data segment {i}: {} bytes at offset {offset}",
                segment.bytes().len()
            );

            if !self.memory.is_allocated() {
                return Err(Error::UnallocatedMemory);
            }
            match offset.checked_add(segment.bytes().len()) {
                Some(end) if end <= self.memory.len() => {}
                _ => return Err(Error::DataSegmentOverflow),
            }
            self.memory
                .write(offset, segment.bytes())
                .map_err(|_| Error::DataSegmentOverflow)?;
        }
        Ok(())
    }

    fn init_elements(&mut self, module: &mut Module) -> Result<()> {
        let bytes = module.elements.bytes.clone();
        let mut reader = BinaryReader::new(&bytes);
        let num_functions = u32::try_from(module.num_functions()).unwrap_or(u32::MAX);

        for _ in 0..module.elements.count {
            if reader.read_var_u32()? != 0 {
                return Err(Error::ElementTableIndex);
            }

            let (offset, consumed) =
                const_eval::evaluate(&self.env, module, reader.remaining_bytes(), ValType::I32)?;
            reader.skip(consumed)?;
            // the low 32 bits hold the i32 offset
            let offset = u32::try_from(offset).map_err(|_| Error::TableOverflow)?;

            let count = reader.read_var_u32()?;
            let end = offset.wrapping_add(count);
            // TODO: empty segments report an overflow and large offsets wrap,
            // switch to a checked add.
            if end <= offset {
                return Err(Error::TableOverflow);
            }

            let end = usize::try_from(end).map_err(|_| Error::TableOverflow)?;
            let offset = usize::try_from(offset).map_err(|_| Error::TableOverflow)?;
            let table = &mut module.table0;
            if table.len() < end {
                table
                    .try_reserve_exact(end - table.len())
                    .map_err(|_| Error::MallocFailed)?;
                table.resize(end, None);
            }
            tracing::debug!("element segment fills table slots {offset}..{end}");

            for slot in &mut table[offset..end] {
                let func = reader.read_var_u32()?;
                if func >= num_functions {
                    return Err(Error::FunctionIndexOutOfRange);
                }
                *slot = Some(FuncIndex::from_u32(func));
            }
        }
        Ok(())
    }

    fn run_start(&mut self, module: ModuleIndex, func: FuncIndex) -> Result<()> {
        let func = FuncRef { module, func };
        self.ensure_compiled(func)?;
        self.invoke(func, &[], CallFlags::START).map(|_| ())
    }
}

pub(crate) fn module_name(module: &Module) -> Option<String> {
    module.name().map(String::from)
}
