// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use smallvec::SmallVec;

use crate::Error;

/// Largest argument count a textual signature may describe.
pub const MAX_SANE_FUNCTION_ARGS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

// ===== impl ValType =====

impl ValType {
    /// Decodes a value type from its binary encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValueType`] for anything but the four numeric
    /// types.
    pub fn from_wasm_byte(byte: u8) -> crate::Result<Self> {
        match byte {
            0x7f => Ok(ValType::I32),
            0x7e => Ok(ValType::I64),
            0x7d => Ok(ValType::F32),
            0x7c => Ok(ValType::F64),
            _ => Err(Error::InvalidValueType(byte)),
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, ValType::I64 | ValType::F64)
    }

    pub fn byte_size(self) -> usize {
        if self.is_64bit() { 8 } else { 4 }
    }

    pub fn signature_char(self) -> char {
        match self {
            ValType::I32 => 'i',
            ValType::I64 => 'I',
            ValType::F32 => 'f',
            ValType::F64 => 'F',
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => f.write_str("i32"),
            ValType::I64 => f.write_str("i64"),
            ValType::F32 => f.write_str("f32"),
            ValType::F64 => f.write_str("f64"),
        }
    }
}

/// Maps a signature character to a type. `Ok(None)` means void.
fn type_from_signature_char(c: char) -> crate::Result<Option<ValType>> {
    match c {
        'v' => Ok(None),
        'i' | '*' => Ok(Some(ValType::I32)),
        'I' => Ok(Some(ValType::I64)),
        'f' => Ok(Some(ValType::F32)),
        'F' => Ok(Some(ValType::F64)),
        _ => Err(Error::UnknownArgumentTypeChar(c)),
    }
}

/// A function signature: an optional return type and the argument types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    result: Option<ValType>,
    params: SmallVec<[ValType; 8]>,
}

// ===== impl FuncType =====

impl FuncType {
    pub fn new(result: Option<ValType>, params: impl IntoIterator<Item = ValType>) -> Self {
        Self {
            result,
            params: params.into_iter().collect(),
        }
    }

    /// Parses a compact signature such as `"I(iI)"`: one return type
    /// character followed by the argument type characters in parentheses.
    ///
    /// Spaces are ignored anywhere, `v` stands for no return value and `*`
    /// (pointer) is read as `i32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedFunctionSignature`] for signatures shorter
    /// than three characters or with more arguments than characters,
    /// [`Error::InsaneArgumentCount`] when the text is too long,
    /// [`Error::UnknownArgumentTypeChar`] for unknown type characters,
    /// [`Error::TooManyReturnTypes`] and [`Error::MissingReturnType`].
    pub fn from_signature(signature: &str) -> crate::Result<Self> {
        Self::from_signature_with_limit(signature, MAX_SANE_FUNCTION_ARGS)
    }

    pub(crate) fn from_signature_with_limit(
        signature: &str,
        max_sane_args: usize,
    ) -> crate::Result<Self> {
        let Some(max_args) = signature.len().checked_sub(3) else {
            return Err(Error::MalformedFunctionSignature);
        };
        if max_args > max_sane_args {
            return Err(Error::InsaneArgumentCount);
        }

        let mut result = None;
        let mut has_return = false;
        let mut parsing_args = false;
        let mut params = SmallVec::new();

        for c in signature.chars() {
            match c {
                '(' if !has_return => break,
                '(' => {
                    parsing_args = true;
                    continue;
                }
                ' ' => continue,
                ')' => break,
                _ => {}
            }

            let ty = type_from_signature_char(c)?;
            if parsing_args {
                if params.len() >= max_args {
                    return Err(Error::MalformedFunctionSignature);
                }
                // `v` is meaningless as an argument type
                params.push(ty.ok_or(Error::MalformedFunctionSignature)?);
            } else {
                if has_return {
                    return Err(Error::TooManyReturnTypes);
                }
                has_return = true;
                result = ty;
            }
        }

        if !has_return {
            return Err(Error::MissingReturnType);
        }

        Ok(Self { result, params })
    }

    pub fn result(&self) -> Option<ValType> {
        self.result
    }

    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

/// Renders the type back in signature form, e.g. `I(iI)`.
impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write;

        f.write_char(self.result.map_or('v', ValType::signature_char))?;
        f.write_char('(')?;
        for param in &self.params {
            f.write_char(param.signature_char())?;
        }
        f.write_char(')')
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn malformed() {
        assert_eq!(
            FuncType::from_signature(""),
            Err(Error::MalformedFunctionSignature)
        );
        assert_eq!(
            FuncType::from_signature("()"),
            Err(Error::MalformedFunctionSignature)
        );
    }

    #[test]
    fn void_without_args() {
        let ty = FuncType::from_signature(" v () ").unwrap();
        assert_eq!(ty.result(), None);
        assert_eq!(ty.num_params(), 0);
    }

    #[test]
    fn mixed_args() {
        let ty = FuncType::from_signature("f(IiF)").unwrap();
        assert_eq!(ty.result(), Some(ValType::F32));
        assert_eq!(ty.params(), &[ValType::I64, ValType::I32, ValType::F64]);

        let spaced = FuncType::from_signature("f(I i F)").unwrap();
        assert_eq!(ty, spaced);
    }

    #[test]
    fn pointer_is_i32() {
        let ty = FuncType::from_signature("*(**)").unwrap();
        assert_eq!(ty, FuncType::new(Some(ValType::I32), [ValType::I32; 2]));
    }

    #[test]
    fn missing_return_type() {
        assert_eq!(
            FuncType::from_signature("(ii)"),
            Err(Error::MissingReturnType)
        );
    }

    #[test]
    fn too_many_return_types() {
        assert_eq!(
            FuncType::from_signature("iI(i)"),
            Err(Error::TooManyReturnTypes)
        );
    }

    #[test]
    fn unknown_char() {
        assert_eq!(
            FuncType::from_signature("i(x)"),
            Err(Error::UnknownArgumentTypeChar('x'))
        );
    }

    #[test]
    fn missing_closing_paren() {
        // three argument chars but only room for two
        assert_eq!(
            FuncType::from_signature("v(iii"),
            Err(Error::MalformedFunctionSignature)
        );
    }

    #[test]
    fn insane_argument_count() {
        let sig = "v(".to_string() + &"i".repeat(MAX_SANE_FUNCTION_ARGS + 1) + ")";
        assert_eq!(
            FuncType::from_signature(&sig),
            Err(Error::InsaneArgumentCount)
        );
    }

    #[test]
    fn display_roundtrips() {
        for sig in ["I(I)", "v()", "f(iIfF)"] {
            assert_eq!(FuncType::from_signature(sig).unwrap().to_string(), sig);
        }
    }
}
