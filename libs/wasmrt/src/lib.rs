// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime and linking layer of an embeddable WebAssembly engine.
//!
//! An [`Environment`] holds what runtimes share: interned function types,
//! a pool of reusable code pages and the [`Compiler`] and [`Executor`]
//! capabilities that turn function bodies into code and run it. A
//! [`Runtime`] owns a slot stack, a linear memory and the modules loaded
//! into it.
//!
//! ```
//! use wasmrt::{Environment, ModuleBuilder, NativeFrame, Runtime, Val, ValType};
//!
//! fn double(frame: &mut NativeFrame<'_>) -> wasmrt::Result<()> {
//!     let x = frame.arg(0, ValType::I32)?.i32().unwrap_or_default();
//!     frame.set_result(Val::I32(x * 2))
//! }
//!
//! let env = Environment::new();
//! let mut builder = ModuleBuilder::new(&env);
//! builder.import_function("env", "double", "i(i)")?;
//!
//! let mut runtime = Runtime::new(&env, 64 * 1024)?;
//! let module = runtime.load_module(builder.build())?;
//! runtime.link_raw_function(module, "env", "double", "i(i)", double)?;
//!
//! let double = runtime.find_function("double")?;
//! assert_eq!(runtime.call(double, &["21"])?, Some(Val::I32(42)));
//! # Ok::<(), wasmrt::Error>(())
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod backend;
mod call;
mod code_page;
mod config;
mod const_eval;
mod environment;
mod error;
mod heap;
mod indices;
mod instantiate;
mod linker;
mod memory;
mod module;
mod reader;
mod runtime;
mod trap;
mod type_registry;
mod types;
mod values;

pub use backend::{
    CallFlags, CompileContext, Compiler, ExecContext, Executor, NativeExecutor, NativeFrame,
    NativeFunction, NoYield, Slot, UnsupportedCompiler, YieldHook,
};
pub use call::MAX_MAIN_ARG_LENGTH;
pub use code_page::{CodePage, CodeRef, Line, Opcode, PageId};
pub use config::Config;
pub use environment::{Environment, EnvironmentBuilder};
pub use error::{Error, ErrorInfo};
pub use heap::{Block, FixedArena, Heap, SystemHeap};
pub use indices::{FuncIndex, GlobalIndex, ModuleIndex, TypeIndex};
pub use instantiate::LoadError;
pub use linker::WILDCARD_MODULE;
pub use memory::{LinearMemory, MAX_PAGES, MemoryHeader, WASM_PAGE_SIZE};
pub use module::{
    DataSegment, Function, Global, Import, MemoryInfo, Module, ModuleBuilder, const_global_get,
    const_i32, const_i64,
};
pub use reader::{BinaryReader, MAX_SANE_UTF8_LENGTH};
pub use runtime::{FuncRef, Runtime, RuntimeId};
pub use trap::Trap;
pub use types::{FuncType, MAX_SANE_FUNCTION_ARGS, ValType};
pub use values::Val;

pub type Result<T, E = Error> = core::result::Result<T, E>;
