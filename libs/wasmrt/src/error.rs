// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::string::String;
use core::fmt;
use core::panic::Location;

use crate::runtime::RuntimeId;
use crate::trap::Trap;

#[derive(Debug, Clone, PartialEq, Eq, onlyerror::Error)]
pub enum Error {
    // binary reading
    #[error("unexpected end of wasm bytes")]
    WasmUnderrun,
    #[error("LEB encoded value overflow")]
    LebOverflow,
    #[error("missing or oversized UTF-8 string")]
    MissingUtf8,
    #[error("invalid UTF-8 string")]
    InvalidUtf8(#[from] core::str::Utf8Error),

    // signatures and types
    #[error("malformed function signature")]
    MalformedFunctionSignature,
    #[error("function signature is missing a return type")]
    MissingReturnType,
    #[error("malformed function signature; too many return types")]
    TooManyReturnTypes,
    #[error("insane argument count")]
    InsaneArgumentCount,
    #[error("unknown argument type char {0:?}")]
    UnknownArgumentTypeChar(char),
    #[error("invalid type id")]
    InvalidTypeId,

    // allocation
    #[error("memory allocation failed")]
    MallocFailed,
    #[error("memory allocation failed when acquiring a new code page")]
    MallocFailedCodePage,
    #[error("code page has no free lines left")]
    CodePageOverflow,
    #[error("runtime ran out of memory")]
    WasmMemoryOverflow,
    #[error("unallocated linear memory")]
    UnallocatedMemory,

    // instantiation
    #[error("attempting to use module that is already linked to a runtime")]
    ModuleAlreadyLinked,
    #[error("data segment overflowing linear memory")]
    DataSegmentOverflow,
    #[error("element table index must be zero for MVP")]
    ElementTableIndex,
    #[error("table overflow")]
    TableOverflow,
    #[error("function index out of range")]
    FunctionIndexOutOfRange,

    // linking and calling
    #[error("function lookup failed")]
    FunctionLookupFailed,
    #[error("function signature mismatch")]
    SignatureMismatch,
    #[error("no modules loaded")]
    NoModulesLoaded,
    #[error("argument count mismatch")]
    ArgumentCountMismatch,
    #[error("insane argument string length")]
    InsaneArgumentLength,
    /// Kept for hosts matching on the full error set. Parameter types are a
    /// closed [`ValType`](crate::ValType), so the engine never raises it.
    #[error("unknown argument type")]
    UnknownArgumentType,
    /// Never raised by the engine, see [`Error::UnknownArgumentType`].
    #[error("unknown return type")]
    UnknownReturnType,
    #[error("argument {0:?} does not parse as its declared type")]
    InvalidArgument(String),
    #[error("function hasn't been compiled")]
    MissingCompiledCode,
    #[error("code reference outside of any allocated code page")]
    InvalidCodeRef,
    #[error("unknown opcode {0:#06X}")]
    UnknownOpcode(u16),
    #[error("{0}")]
    Trap(#[from] Trap),

    // module decoding
    #[error("invalid magic number")]
    BadMagic,
    #[error("incompatible version {0}")]
    BadVersion(u32),
    #[error("unknown section {0}")]
    UnknownSection(u8),
    #[error("section size mismatch")]
    SectionOverrun,
    #[error("invalid value type {0:#X}")]
    InvalidValueType(u8),
    #[error("invalid external kind {0:#X}")]
    InvalidExternalKind(u8),
    #[error("invalid constant expression opcode {0:#04X}")]
    InvalidConstExpr(u8),
    #[error("multiple return values are not supported")]
    TooManyResults,
    #[error("function and code section counts differ")]
    FunctionCountMismatch,
}

impl From<leb128::Error> for Error {
    fn from(err: leb128::Error) -> Self {
        match err {
            leb128::Error::UnexpectedEof => Error::WasmUnderrun,
            leb128::Error::Overflow => Error::LebOverflow,
            leb128::Error::NotEnoughSpace => Error::MallocFailed,
        }
    }
}

/// Extended information about the most recent failing runtime operation.
///
/// Recorded by the [`Runtime`](crate::Runtime) whenever one of its public
/// operations fails and kept until the host takes or resets it.
#[derive(Debug, Clone, Default)]
pub struct ErrorInfo {
    pub error: Option<Error>,
    pub runtime: Option<RuntimeId>,
    pub module: Option<String>,
    pub function: Option<String>,
    pub location: Option<&'static Location<'static>>,
    pub message: String,
}

// ===== impl ErrorInfo =====

impl ErrorInfo {
    pub fn is_empty(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(error) = &self.error else {
            return f.write_str("no error");
        };

        write!(f, "{error}")?;
        if let Some(module) = &self.module {
            write!(f, " in module {module:?}")?;
        }
        if let Some(function) = &self.function {
            write!(f, " function {function:?}")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(location) = self.location {
            write!(f, " ({location})")?;
        }
        Ok(())
    }
}
