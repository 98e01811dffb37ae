// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod builder;
mod parse;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cranelift_entity::PrimaryMap;

pub use builder::{ModuleBuilder, const_global_get, const_i32, const_i64};

use crate::code_page::CodeRef;
use crate::indices::{FuncIndex, GlobalIndex, TypeIndex};
use crate::runtime::RuntimeId;
use crate::types::{FuncType, ValType};
use crate::values::Val;

/// The module and field name an import is resolved by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
}

/// A function's display name. Imported functions without an export name are
/// known by their import field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FuncName {
    Anonymous,
    Owned(String),
    ImportField,
}

#[derive(Debug, Clone)]
pub struct Function {
    ty: Arc<FuncType>,
    import: Option<Import>,
    name: FuncName,
    compiled: Option<CodeRef>,
    num_locals: u32,
    body: Option<Box<[u8]>>,
    constants: Vec<u64>,
}

// ===== impl Function =====

impl Function {
    pub(crate) fn imported(ty: Arc<FuncType>, import: Import) -> Self {
        Self {
            ty,
            import: Some(import),
            name: FuncName::ImportField,
            compiled: None,
            num_locals: 0,
            body: None,
            constants: Vec::new(),
        }
    }

    pub(crate) fn defined(ty: Arc<FuncType>) -> Self {
        Self {
            ty,
            import: None,
            name: FuncName::Anonymous,
            compiled: None,
            num_locals: 0,
            body: None,
            constants: Vec::new(),
        }
    }

    pub fn ty(&self) -> &Arc<FuncType> {
        &self.ty
    }

    pub fn import(&self) -> Option<&Import> {
        self.import.as_ref()
    }

    pub fn is_import(&self) -> bool {
        self.import.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        match &self.name {
            FuncName::Anonymous => None,
            FuncName::Owned(name) => Some(name),
            FuncName::ImportField => self.import.as_ref().map(|import| import.field.as_str()),
        }
    }

    /// Gives the function a display name unless it already has one.
    pub(crate) fn set_name_if_anonymous(&mut self, name: String) {
        if self.name == FuncName::Anonymous {
            self.name = FuncName::Owned(name);
        }
    }

    /// Entry point of the compiled or linked code.
    pub fn compiled(&self) -> Option<CodeRef> {
        self.compiled
    }

    pub(crate) fn set_compiled(&mut self, entry: CodeRef) {
        self.compiled = Some(entry);
    }

    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    /// The body's instruction bytes, after the local declarations.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub(crate) fn set_body(&mut self, num_locals: u32, body: Box<[u8]>) {
        self.num_locals = num_locals;
        self.body = Some(body);
    }

    /// Constants a compiler chose to keep out of line.
    pub fn constants(&self) -> &[u64] {
        &self.constants
    }

    pub fn set_constants(&mut self, constants: Vec<u64>) {
        self.constants = constants;
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    ty: ValType,
    mutable: bool,
    init: Option<Box<[u8]>>,
    import: Option<Import>,
    value: u64,
}

// ===== impl Global =====

impl Global {
    pub fn ty(&self) -> ValType {
        self.ty
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// The constant initializer expression, `None` for imported globals.
    pub fn init_expr(&self) -> Option<&[u8]> {
        self.init.as_deref()
    }

    pub fn import(&self) -> Option<&Import> {
        self.import.as_ref()
    }

    pub fn value(&self) -> Val {
        Val::from_slot(self.ty, self.value)
    }

    pub(crate) fn set_raw_value(&mut self, value: u64) {
        self.value = value;
    }
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub(crate) memory_index: u32,
    pub(crate) offset_expr: Box<[u8]>,
    pub(crate) bytes: Box<[u8]>,
}

impl DataSegment {
    pub fn memory_index(&self) -> u32 {
        self.memory_index
    }

    pub fn offset_expr(&self) -> &[u8] {
        &self.offset_expr
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The element section, kept in its encoded form and decoded at
/// instantiation time.
#[derive(Debug, Clone, Default)]
pub(crate) struct ElementSection {
    pub count: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub initial_pages: u32,
    pub max_pages: Option<u32>,
}

/// A decoded module, ready to be loaded into a runtime.
///
/// A module is owned by at most one runtime at a time. Cloning a module that
/// was never loaded yields an independent module that can be loaded into
/// another runtime; a clone of a loaded module is still considered linked.
#[derive(Debug, Clone, Default)]
pub struct Module {
    name: Option<String>,
    pub(crate) runtime: Option<RuntimeId>,
    types: PrimaryMap<TypeIndex, Arc<FuncType>>,
    pub(crate) functions: PrimaryMap<FuncIndex, Function>,
    pub(crate) globals: PrimaryMap<GlobalIndex, Global>,
    pub(crate) data_segments: Vec<DataSegment>,
    pub(crate) elements: ElementSection,
    pub(crate) table0: Vec<Option<FuncIndex>>,
    memory: Option<MemoryInfo>,
    memory_import: Option<Import>,
    start: Option<FuncIndex>,
}

// ===== impl Module =====

impl Module {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// The runtime this module is loaded into.
    pub fn runtime(&self) -> Option<RuntimeId> {
        self.runtime
    }

    pub fn is_linked(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn func_types(&self) -> impl ExactSizeIterator<Item = &Arc<FuncType>> {
        self.types.values()
    }

    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn function(&self, index: FuncIndex) -> Option<&Function> {
        self.functions.get(index)
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncIndex, &Function)> {
        self.functions.iter()
    }

    /// First function whose display name is `name`.
    pub fn find_function(&self, name: &str) -> Option<FuncIndex> {
        self.functions
            .iter()
            .find(|(_, func)| func.name() == Some(name))
            .map(|(index, _)| index)
    }

    pub fn num_globals(&self) -> usize {
        self.globals.len()
    }

    pub fn global(&self, index: GlobalIndex) -> Option<&Global> {
        self.globals.get(index)
    }

    pub fn data_segments(&self) -> &[DataSegment] {
        &self.data_segments
    }

    pub fn num_element_segments(&self) -> u32 {
        self.elements.count
    }

    /// Table 0, populated by the element segments at instantiation.
    pub fn table(&self) -> &[Option<FuncIndex>] {
        &self.table0
    }

    pub fn memory(&self) -> Option<MemoryInfo> {
        self.memory
    }

    pub fn memory_import(&self) -> Option<&Import> {
        self.memory_import.as_ref()
    }

    pub fn is_memory_imported(&self) -> bool {
        self.memory_import.is_some()
    }

    pub fn start(&self) -> Option<FuncIndex> {
        self.start
    }

    /// Name of `func` for diagnostics.
    pub(crate) fn describe(&self, func: FuncIndex) -> String {
        use alloc::string::ToString;

        match self.function(func).and_then(Function::name) {
            Some(name) => name.to_string(),
            None => alloc::format!("<function {}>", func.as_u32()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Environment;

    #[test]
    fn import_names_alias_field() {
        let env = Environment::new();
        let mut builder = ModuleBuilder::new(&env);
        let f = builder.import_function("env", "print", "v(i)").unwrap();
        let module = builder.build();

        let func = module.function(f).unwrap();
        assert_eq!(func.name(), Some("print"));
        assert!(func.is_import());
        assert_eq!(module.find_function("print"), Some(f));
    }

    #[test]
    fn first_name_wins() {
        let env = Environment::new();
        let mut builder = ModuleBuilder::new(&env);
        let f = builder.function("i()", 0, &[0x41, 0x01, 0x0b]).unwrap();
        builder.export(f, "one");
        builder.export(f, "uno");
        let module = builder.build();

        assert_eq!(module.function(f).unwrap().name(), Some("one"));
        assert_eq!(module.find_function("uno"), None);
    }
}
