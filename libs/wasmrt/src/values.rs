// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::borrow::ToOwned;
use core::fmt;

use crate::Error;
use crate::backend::Slot;
use crate::types::ValType;

/// A value crossing the boundary between the host and compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Val {
    /// A 32-bit integer.
    I32(i32),

    /// A 64-bit integer.
    I64(i64),

    /// A 32-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f32::from_bits` to create an `f32` value.
    F32(u32),

    /// A 64-bit float.
    ///
    /// Note that the raw bits of the float are stored here, and you can use
    /// `f64::from_bits` to create an `f64` value.
    F64(u64),
}

// ===== impl Val =====

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    /// Reads a value of type `ty` from a stack slot. 32-bit values live in the
    /// low half of the slot.
    pub fn from_slot(ty: ValType, slot: Slot) -> Self {
        let [a, b, c, d, ..] = slot.to_le_bytes();
        let low = [a, b, c, d];
        match ty {
            ValType::I32 => Val::I32(i32::from_le_bytes(low)),
            ValType::I64 => Val::I64(i64::from_le_bytes(slot.to_le_bytes())),
            ValType::F32 => Val::F32(u32::from_le_bytes(low)),
            ValType::F64 => Val::F64(slot),
        }
    }

    /// Encodes the value into a stack slot, zero extending 32-bit values.
    pub fn to_slot(self) -> Slot {
        match self {
            Val::I32(v) => Slot::from(u32::from_le_bytes(v.to_le_bytes())),
            Val::I64(v) => Slot::from_le_bytes(v.to_le_bytes()),
            Val::F32(bits) => Slot::from(bits),
            Val::F64(bits) => bits,
        }
    }

    /// Parses decimal text as a value of type `ty`.
    ///
    /// Integers may be given signed or unsigned (`-1` and `4294967295` are
    /// the same `i32`), floats in any notation `core` understands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the text does not parse.
    pub fn parse(ty: ValType, text: &str) -> crate::Result<Self> {
        let text = text.trim();
        let invalid = || Error::InvalidArgument(text.to_owned());

        match ty {
            ValType::I32 => text
                .parse::<i32>()
                .or_else(|_| text.parse::<u32>().map(|v| i32::from_le_bytes(v.to_le_bytes())))
                .map(Val::I32)
                .map_err(|_| invalid()),
            ValType::I64 => text
                .parse::<i64>()
                .or_else(|_| text.parse::<u64>().map(|v| i64::from_le_bytes(v.to_le_bytes())))
                .map(Val::I64)
                .map_err(|_| invalid()),
            ValType::F32 => text
                .parse::<f32>()
                .map(|v| Val::F32(v.to_bits()))
                .map_err(|_| invalid()),
            ValType::F64 => text
                .parse::<f64>()
                .map(|v| Val::F64(v.to_bits()))
                .map_err(|_| invalid()),
        }
    }

    pub fn i32(&self) -> Option<i32> {
        if let Val::I32(v) = self { Some(*v) } else { None }
    }

    pub fn i64(&self) -> Option<i64> {
        if let Val::I64(v) = self { Some(*v) } else { None }
    }

    pub fn f32(&self) -> Option<f32> {
        if let Val::F32(bits) = self { Some(f32::from_bits(*bits)) } else { None }
    }

    pub fn f64(&self) -> Option<f64> {
        if let Val::F64(bits) = self { Some(f64::from_bits(*bits)) } else { None }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::I32(v) => write!(f, "{v}:i32"),
            Val::I64(v) => write!(f, "{v}:i64"),
            Val::F32(bits) => write!(f, "{}:f32", f32::from_bits(*bits)),
            Val::F64(bits) => write!(f, "{}:f64", f64::from_bits(*bits)),
        }
    }
}
