// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::string::String;
use core::fmt;

/// A fault raised by executing code, be it compiled wasm or a linked host
/// function. Executors report traps through [`Error::Trap`](crate::Error::Trap).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// An `unreachable` instruction ran.
    UnreachableCodeReached,
    /// A load or store touched bytes past the committed linear memory.
    MemoryOutOfBounds,
    /// A frame did not fit the runtime's slot stack.
    StackOverflow,
    /// Signed division of the minimum value by -1, or a float to int
    /// conversion out of range.
    IntegerOverflow,
    IntegerDivisionByZero,
    /// A `call_indirect` index past the end of table 0.
    TableOutOfBounds,
    /// A `call_indirect` through an empty table slot.
    IndirectCallToNull,
    /// A `call_indirect` whose callee has a different type.
    BadSignature,
    /// Raised by a host function, with its own message.
    Host(String),
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Trap::UnreachableCodeReached => "[trap] unreachable executed",
            Trap::MemoryOutOfBounds => "[trap] out of bounds memory access",
            Trap::StackOverflow => "[trap] stack overflow",
            Trap::IntegerOverflow => "[trap] integer overflow",
            Trap::IntegerDivisionByZero => "[trap] integer divide by zero",
            Trap::TableOutOfBounds => "[trap] undefined element",
            Trap::IndirectCallToNull => "[trap] uninitialized element",
            Trap::BadSignature => "[trap] indirect call type mismatch",
            Trap::Host(msg) => return write!(f, "[trap] {msg}"),
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Trap {}
