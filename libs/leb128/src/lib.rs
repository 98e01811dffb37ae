// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Read and write "Little Endian Base 128" (LEB128) variable length integers
//! as used by the WebAssembly binary format.
//!
//! Reads are bounded by a maximum bit width: decoding stops with
//! [`Error::Overflow`] as soon as the accumulated shift reaches the width
//! while the continuation bit is still set. A failed read never advances the
//! input.
//!
//! ```
//! use leb128::{Leb128Read, Leb128Write};
//!
//! let mut buf = [0; 16];
//! {
//!     let mut writable = &mut buf[..];
//!     writable.write_sleb128(-12345).expect("Should write number");
//! }
//!
//! let mut readable = &buf[..];
//! let val = readable.read_sleb128_bounded(32).expect("Should read number");
//! assert_eq!(val, -12345);
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::mem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum Error {
    /// The input ended before the terminating byte.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// The encoding is longer than the requested bit width allows.
    #[error("integer representation too long")]
    Overflow,
    /// The output buffer is too small.
    #[error("not enough space in output buffer")]
    NotEnoughSpace,
}
pub type Result<T> = core::result::Result<T, Error>;

pub trait Leb128Read {
    #[doc(hidden)]
    fn read_byte(&mut self) -> Result<u8>;

    /// Reads an unsigned integer of at most `max_bits` bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedEof`] when the input runs out and
    /// [`Error::Overflow`] when the encoding exceeds `max_bits`.
    fn read_uleb128_bounded(&mut self, max_bits: u32) -> Result<u64>;

    /// Reads a signed integer of at most `max_bits` bits, sign extending the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedEof`] when the input runs out and
    /// [`Error::Overflow`] when the encoding exceeds `max_bits`.
    fn read_sleb128_bounded(&mut self, max_bits: u32) -> Result<i64>;

    /// # Errors
    ///
    /// See [`Leb128Read::read_uleb128_bounded`].
    fn read_uleb128(&mut self) -> Result<u64> {
        self.read_uleb128_bounded(64)
    }

    /// # Errors
    ///
    /// See [`Leb128Read::read_sleb128_bounded`].
    fn read_sleb128(&mut self) -> Result<i64> {
        self.read_sleb128_bounded(64)
    }
}

impl Leb128Read for &[u8] {
    fn read_byte(&mut self) -> Result<u8> {
        let (byte, rest) = self.split_first().ok_or(Error::UnexpectedEof)?;
        *self = rest;
        Ok(*byte)
    }

    fn read_uleb128_bounded(&mut self, max_bits: u32) -> Result<u64> {
        let (value, _, rest) = decode(self, max_bits)?;
        *self = rest;
        Ok(value)
    }

    fn read_sleb128_bounded(&mut self, max_bits: u32) -> Result<i64> {
        let (mut value, byte, rest) = decode(self, max_bits)?;
        let shift = encoded_bits(self.len() - rest.len());
        if shift < 64 && byte & SIGN_BIT == SIGN_BIT {
            // Sign extend the result.
            value |= !0 << shift;
        }
        *self = rest;
        Ok(i64::from_ne_bytes(value.to_ne_bytes()))
    }
}

/// Decodes 7-bit groups until a terminal byte, returning the raw value, the
/// terminal byte and the remaining input.
fn decode(input: &[u8], max_bits: u32) -> Result<(u64, u8, &[u8])> {
    let mut rest = input;
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = rest.read_byte()?;
        value |= u64::from(low_bits_of_byte(byte)) << shift;
        shift += 7;

        if byte & CONTINUATION_BIT == 0 {
            return Ok((value, byte, rest));
        }
        if shift >= max_bits {
            return Err(Error::Overflow);
        }
    }
}

#[inline]
fn encoded_bits(num_bytes: usize) -> u32 {
    u32::try_from(num_bytes).map_or(u32::MAX, |n| n.saturating_mul(7))
}

pub trait Leb128Write {
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSpace`] when the output is full.
    fn write_byte(&mut self, val: u8) -> Result<()>;

    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSpace`] when the output is full.
    fn write_uleb128(&mut self, mut val: u64) -> Result<usize> {
        let mut bytes_written = 0;
        loop {
            let mut byte = low_bits_of_u64(val);
            val >>= 7;
            if val != 0 {
                // More bytes to come, so set the continuation bit.
                byte |= CONTINUATION_BIT;
            }

            self.write_byte(byte)?;
            bytes_written += 1;

            if val == 0 {
                return Ok(bytes_written);
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSpace`] when the output is full.
    fn write_sleb128(&mut self, mut val: i64) -> Result<usize> {
        let mut bytes_written = 0;
        loop {
            let mut byte = val.to_le_bytes()[0];
            // Keep the sign bit for testing
            val >>= 6;
            let done = val == 0 || val == -1;
            if done {
                byte &= !CONTINUATION_BIT;
            } else {
                // Remove the sign bit
                val >>= 1;
                // More bytes to come, so set the continuation bit.
                byte |= CONTINUATION_BIT;
            }

            self.write_byte(byte)?;
            bytes_written += 1;

            if done {
                return Ok(bytes_written);
            }
        }
    }
}

impl Leb128Write for &mut [u8] {
    #[inline]
    fn write_byte(&mut self, val: u8) -> Result<()> {
        let (a, b) = mem::take(self)
            .split_first_mut()
            .ok_or(Error::NotEnoughSpace)?;
        *a = val;
        *self = b;
        Ok(())
    }
}

impl Leb128Write for Vec<u8> {
    #[inline]
    fn write_byte(&mut self, val: u8) -> Result<()> {
        self.try_reserve(1).map_err(|_| Error::NotEnoughSpace)?;
        self.push(val);
        Ok(())
    }
}

const CONTINUATION_BIT: u8 = 1 << 7;
const SIGN_BIT: u8 = 1 << 6;

#[inline]
fn low_bits_of_byte(byte: u8) -> u8 {
    byte & !CONTINUATION_BIT
}

#[inline]
fn low_bits_of_u64(val: u64) -> u8 {
    low_bits_of_byte(val.to_le_bytes()[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_bits_of_byte() {
        for i in 0..127 {
            assert_eq!(i, low_bits_of_byte(i));
            assert_eq!(i, low_bits_of_byte(i | CONTINUATION_BIT));
        }
    }

    #[test]
    fn test_low_bits_of_u64() {
        for i in 0u64..127 {
            assert_eq!(i as u8, low_bits_of_u64(1 << 16 | i));
            assert_eq!(
                i as u8,
                low_bits_of_u64(i << 16 | i | (CONTINUATION_BIT as u64))
            );
        }
    }

    // Examples from the DWARF 4 standard, section 7.6, figure 22.
    #[test]
    fn test_read_unsigned() {
        let cases: &[(&[u8], u64)] = &[
            (&[2], 2),
            (&[127], 127),
            (&[CONTINUATION_BIT, 1], 128),
            (&[1 | CONTINUATION_BIT, 1], 129),
            (&[2 | CONTINUATION_BIT, 1], 130),
            (&[57 | CONTINUATION_BIT, 100], 12857),
        ];
        for (buf, expected) in cases {
            let mut readable = *buf;
            assert_eq!(*expected, readable.read_uleb128().unwrap());
            assert!(readable.is_empty());
        }
    }

    // Examples from the DWARF 4 standard, section 7.6, figure 23.
    #[test]
    fn test_read_signed() {
        let cases: &[(&[u8], i64)] = &[
            (&[2], 2),
            (&[0x7e], -2),
            (&[127 | CONTINUATION_BIT, 0], 127),
            (&[1 | CONTINUATION_BIT, 0x7f], -127),
            (&[CONTINUATION_BIT, 1], 128),
            (&[CONTINUATION_BIT, 0x7f], -128),
            (&[1 | CONTINUATION_BIT, 1], 129),
            (&[0x7f | CONTINUATION_BIT, 0x7e], -129),
        ];
        for (buf, expected) in cases {
            let mut readable = *buf;
            assert_eq!(*expected, readable.read_sleb128().unwrap());
        }
    }

    #[test]
    fn test_read_signed_63_bits() {
        let buf = [
            CONTINUATION_BIT,
            CONTINUATION_BIT,
            CONTINUATION_BIT,
            CONTINUATION_BIT,
            CONTINUATION_BIT,
            CONTINUATION_BIT,
            CONTINUATION_BIT,
            CONTINUATION_BIT,
            0x40,
        ];
        let mut readable = &buf[..];
        assert_eq!(-0x4000000000000000, readable.read_sleb128().unwrap());
    }

    #[test]
    fn test_read_not_enough_data() {
        let buf = [CONTINUATION_BIT];
        let mut readable = &buf[..];
        assert_eq!(readable.read_uleb128(), Err(Error::UnexpectedEof));
        assert_eq!(readable.read_sleb128(), Err(Error::UnexpectedEof));
        // a failed read leaves the input untouched
        assert_eq!(readable.len(), 1);
    }

    #[test]
    fn test_read_bounded_overflow() {
        // seven bit values fit into a single byte
        let buf = [0x80, 0x01];
        let mut readable = &buf[..];
        assert_eq!(readable.read_uleb128_bounded(7), Err(Error::Overflow));

        // five bytes are enough for 32 bits, a sixth one is not allowed
        let buf = [0xff, 0xff, 0xff, 0xff, 0x0f];
        let mut readable = &buf[..];
        assert_eq!(readable.read_uleb128_bounded(32), Ok(u64::from(u32::MAX)));

        let buf = [0xff, 0xff, 0xff, 0xff, 0x8f, 0x00];
        let mut readable = &buf[..];
        assert_eq!(readable.read_uleb128_bounded(32), Err(Error::Overflow));
        assert_eq!(readable.len(), 6);
    }

    #[test]
    fn test_read_unsigned_overflow() {
        let buf = [2u8 | CONTINUATION_BIT; 11];
        let mut readable = &buf[..];
        assert_eq!(readable.read_uleb128(), Err(Error::Overflow));
    }

    #[test]
    fn test_write_not_enough_space() {
        let mut buf = [0; 1];
        let mut writable = &mut buf[..];
        assert_eq!(writable.write_uleb128(128), Err(Error::NotEnoughSpace));

        let mut buf = [0; 1];
        let mut writable = &mut buf[..];
        assert_eq!(writable.write_sleb128(128), Err(Error::NotEnoughSpace));
    }

    #[test]
    fn test_write_vec() {
        let mut buf = Vec::new();
        assert_eq!(buf.write_uleb128(624485), Ok(3));
        assert_eq!(buf, [0xe5, 0x8e, 0x26]);
    }

    proptest::proptest! {
        #[test]
        fn dogfood_unsigned(i: u64) {
            let mut buf = Vec::new();
            buf.write_uleb128(i).unwrap();

            let mut readable = &buf[..];
            proptest::prop_assert_eq!(readable.read_uleb128(), Ok(i));
            proptest::prop_assert!(readable.is_empty());
        }

        #[test]
        fn dogfood_signed(i: i64) {
            let mut buf = Vec::new();
            buf.write_sleb128(i).unwrap();

            let mut readable = &buf[..];
            proptest::prop_assert_eq!(readable.read_sleb128(), Ok(i));
        }

        #[test]
        fn dogfood_u32(i: u32) {
            let mut buf = Vec::new();
            buf.write_uleb128(u64::from(i)).unwrap();

            let mut readable = &buf[..];
            proptest::prop_assert_eq!(readable.read_uleb128_bounded(32), Ok(u64::from(i)));
        }

        #[test]
        fn dogfood_i32(i: i32) {
            let mut buf = Vec::new();
            buf.write_sleb128(i64::from(i)).unwrap();

            let mut readable = &buf[..];
            proptest::prop_assert_eq!(readable.read_sleb128_bounded(32), Ok(i64::from(i)));
        }

        #[test]
        fn truncated_input_is_eof(i in 128u64.., cut in 1usize..10) {
            let mut buf = Vec::new();
            let len = buf.write_uleb128(i).unwrap();
            let cut = cut.min(len - 1);

            let mut readable = &buf[..len - cut];
            proptest::prop_assert_eq!(readable.read_uleb128(), Err(Error::UnexpectedEof));
        }
    }
}
