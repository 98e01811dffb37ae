// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounds checked decoding of the primitives the binary module format is made
//! of: fixed width little endian numbers, LEB128 varints and length prefixed
//! UTF-8 strings.
//!
//! Every read either advances the cursor and returns the decoded value or
//! fails without moving the cursor.

use alloc::string::String;
use alloc::vec::Vec;

use leb128::Leb128Read;

use crate::Error;

/// Largest UTF-8 string the reader accepts unless configured otherwise.
pub const MAX_SANE_UTF8_LENGTH: u32 = 2000;

#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        self.bytes.get(self.pos..).unwrap_or_default()
    }

    /// Moves the cursor forward by `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than `len` bytes remain.
    pub fn skip(&mut self, len: usize) -> crate::Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than `len` bytes remain.
    pub fn ensure_bytes(&self, len: usize) -> crate::Result<()> {
        match self.pos.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(Error::WasmUnderrun),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> crate::Result<&'a [u8]> {
        self.ensure_bytes(len)?;
        let bytes = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> crate::Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] at the end of input.
    pub fn read_u8(&mut self) -> crate::Result<u8> {
        self.read_array::<1>().map(|[b]| b)
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than 2 bytes remain.
    pub fn read_u16(&mut self) -> crate::Result<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than 4 bytes remain.
    pub fn read_u32(&mut self) -> crate::Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than 8 bytes remain.
    pub fn read_u64(&mut self) -> crate::Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than 4 bytes remain.
    pub fn read_f32(&mut self) -> crate::Result<f32> {
        self.read_u32().map(f32::from_bits)
    }

    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if fewer than 8 bytes remain.
    pub fn read_f64(&mut self) -> crate::Result<f64> {
        self.read_u64().map(f64::from_bits)
    }

    /// Reads an unsigned LEB128 value of at most `max_bits` bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if the input ends before the terminal
    /// byte and [`Error::LebOverflow`] if the encoding exceeds `max_bits`.
    pub fn read_leb_unsigned(&mut self, max_bits: u32) -> crate::Result<u64> {
        let mut rest = self.remaining_bytes();
        let before = rest.len();
        let value = rest.read_uleb128_bounded(max_bits)?;
        self.pos += before - rest.len();
        Ok(value)
    }

    /// Reads a signed LEB128 value of at most `max_bits` bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WasmUnderrun`] if the input ends before the terminal
    /// byte and [`Error::LebOverflow`] if the encoding exceeds `max_bits`.
    pub fn read_leb_signed(&mut self, max_bits: u32) -> crate::Result<i64> {
        let mut rest = self.remaining_bytes();
        let before = rest.len();
        let value = rest.read_sleb128_bounded(max_bits)?;
        self.pos += before - rest.len();
        Ok(value)
    }

    /// # Errors
    ///
    /// See [`BinaryReader::read_leb_unsigned`].
    pub fn read_var_u7(&mut self) -> crate::Result<u8> {
        self.read_narrow_unsigned(7)
    }

    /// # Errors
    ///
    /// See [`BinaryReader::read_leb_signed`].
    pub fn read_var_i7(&mut self) -> crate::Result<i8> {
        self.read_narrow_signed(7)
    }

    /// # Errors
    ///
    /// See [`BinaryReader::read_leb_unsigned`].
    pub fn read_var_u32(&mut self) -> crate::Result<u32> {
        self.read_narrow_unsigned(32)
    }

    /// # Errors
    ///
    /// See [`BinaryReader::read_leb_signed`].
    pub fn read_var_i32(&mut self) -> crate::Result<i32> {
        self.read_narrow_signed(32)
    }

    /// # Errors
    ///
    /// See [`BinaryReader::read_leb_unsigned`].
    pub fn read_var_u64(&mut self) -> crate::Result<u64> {
        self.read_leb_unsigned(64)
    }

    /// # Errors
    ///
    /// See [`BinaryReader::read_leb_signed`].
    pub fn read_var_i64(&mut self) -> crate::Result<i64> {
        self.read_leb_signed(64)
    }

    // Values whose last group carries bits beyond the target width are
    // rejected rather than truncated.
    fn read_narrow_unsigned<T: TryFrom<u64>>(&mut self, max_bits: u32) -> crate::Result<T> {
        let start = self.pos;
        let value = self.read_leb_unsigned(max_bits)?;
        T::try_from(value).map_err(|_| {
            self.pos = start;
            Error::LebOverflow
        })
    }

    fn read_narrow_signed<T: TryFrom<i64>>(&mut self, max_bits: u32) -> crate::Result<T> {
        let start = self.pos;
        let value = self.read_leb_signed(max_bits)?;
        T::try_from(value).map_err(|_| {
            self.pos = start;
            Error::LebOverflow
        })
    }

    /// Reads a length prefixed UTF-8 string of at most `max_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingUtf8`] if the length exceeds `max_len`,
    /// [`Error::WasmUnderrun`] if the payload is truncated,
    /// [`Error::InvalidUtf8`] if the payload is not UTF-8 and
    /// [`Error::MallocFailed`] if the copy cannot be allocated.
    pub fn read_utf8(&mut self, max_len: u32) -> crate::Result<String> {
        let start = self.pos;
        let res = self.read_utf8_inner(max_len);
        if res.is_err() {
            self.pos = start;
        }
        res
    }

    fn read_utf8_inner(&mut self, max_len: u32) -> crate::Result<String> {
        let len = self.read_var_u32()?;
        if len > max_len {
            return Err(Error::MissingUtf8);
        }
        let len = usize::try_from(len).map_err(|_| Error::MissingUtf8)?;
        let bytes = self.read_bytes(len)?;
        let s = core::str::from_utf8(bytes)?;

        let mut out = Vec::new();
        out.try_reserve_exact(len).map_err(|_| Error::MallocFailed)?;
        out.extend_from_slice(s.as_bytes());
        // the bytes were validated above
        String::from_utf8(out).map_err(|e| Error::InvalidUtf8(e.utf8_error()))
    }
}
