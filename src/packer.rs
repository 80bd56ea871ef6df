// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bit-level output assembly for FLAC frames
//!
//! [`BitPacker`] accumulates arbitrary-width fields into a growable
//! buffer of 32-bit words with zero waste, and hands the result back
//! as a big-endian byte buffer with running CRC-8/CRC-16 support.
//! It is the single sink every frame and subframe field is written
//! through, so a frame's checksums are guaranteed to cover exactly
//! the bytes emitted.

use crate::Error;
use crate::crc;

/// A bit-level packer of FLAC frame fields
///
/// Completed 32-bit words live in an internal buffer while up to 31
/// pending bits sit right-justified in an accumulator, so the total
/// emitted bit count is always `words × 32 + pending`.  The buffer
/// grows monotonically and is cleared, not freed, between frames.
///
/// Every write returns a [`Result`]; a failed write means the current
/// frame must be abandoned, not that the stream is corrupt.
///
/// # Example
///
/// ```
/// use flac_encode::BitPacker;
///
/// let mut w = BitPacker::new();
/// w.write_unsigned(0b101, 3).unwrap();
/// w.write_unsigned(0b01010, 5).unwrap();
/// assert_eq!(w.bytes().unwrap(), &[0b101_01010]);
/// ```
#[derive(Default)]
pub struct BitPacker {
    // complete big-endian words
    buffer: Vec<u32>,
    // 0-31 pending bits, right-justified
    accumulator: u32,
    // number of pending bits in the accumulator
    bits: u32,
    // byte view assembled on demand
    byte_cache: Vec<u8>,
}

impl BitPacker {
    /// The maximum size of the packed output, in bytes (2²⁴)
    ///
    /// Frame and metadata block lengths are 24-bit fields,
    /// so no packed block may grow beyond this.
    pub const MAX_BYTES: usize = 1 << 24;

    const MAX_WORDS: usize = Self::MAX_BYTES / 4;

    // initial capacity and growth rounding, in words
    const DEFAULT_CAPACITY: usize = 4096;
    const INCREMENT: usize = 1024;

    /// Returns a new, empty packer
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(Self::DEFAULT_CAPACITY),
            accumulator: 0,
            bits: 0,
            byte_cache: Vec::new(),
        }
    }

    /// Empties the packer for reuse while keeping its capacity
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.byte_cache.clear();
        self.accumulator = 0;
        self.bits = 0;
    }

    /// Returns the total number of bits written so far
    pub fn bit_count(&self) -> u64 {
        self.buffer.len() as u64 * 32 + u64::from(self.bits)
    }

    /// Whether the bits written so far end on a whole byte
    pub fn is_byte_aligned(&self) -> bool {
        self.bits % 8 == 0
    }

    // ensures capacity for `bits_to_add` more bits,
    // rounding any new allocation up to the growth increment
    fn grow(&mut self, bits_to_add: u64) -> Result<(), Error> {
        let total_words = (self.bit_count() + bits_to_add).div_ceil(32);
        if total_words > Self::MAX_WORDS as u64 {
            return Err(Error::BufferFull);
        }
        let total_words = total_words as usize;
        if total_words > self.buffer.capacity() {
            let target = total_words
                .next_multiple_of(Self::INCREMENT)
                .min(Self::MAX_WORDS);
            self.buffer.reserve_exact(target - self.buffer.len());
        }
        Ok(())
    }

    // appends 1-32 bits whose unused upper bits are zero;
    // capacity must already be grown
    fn push_bits(&mut self, value: u32, bits: u32) {
        debug_assert!((1..=32).contains(&bits));
        debug_assert!(bits == 32 || value >> bits == 0);

        let room = 32 - self.bits;
        if bits < room {
            self.accumulator = (self.accumulator << bits) | value;
            self.bits += bits;
        } else if room == 32 {
            // full word, empty accumulator
            self.buffer.push(value);
        } else {
            // the value straddles a word boundary
            let spill = bits - room;
            self.buffer
                .push((self.accumulator << room) | (value >> spill));
            self.accumulator = value & ((1 << spill) - 1);
            self.bits = spill;
        }
    }

    // appends any number of zero bits; capacity must already be grown
    fn push_zeroes(&mut self, mut bits: u64) {
        if self.bits > 0 {
            let pad = u64::from(32 - self.bits).min(bits) as u32;
            self.accumulator <<= pad;
            self.bits += pad;
            bits -= u64::from(pad);
            if self.bits == 32 {
                self.buffer.push(self.accumulator);
                self.accumulator = 0;
                self.bits = 0;
            }
        }
        while bits >= 32 {
            self.buffer.push(0);
            bits -= 32;
        }
        self.bits += bits as u32;
    }

    /// Writes the low `bits` bits of an unsigned value
    ///
    /// # Errors
    ///
    /// Returns an error if `bits` is larger than 32, if any bit
    /// above `bits` is set, or if growth would exceed
    /// [`MAX_BYTES`](Self::MAX_BYTES).
    pub fn write_unsigned(&mut self, value: u32, bits: u32) -> Result<(), Error> {
        if bits > 32 || (bits < 32 && value >> bits != 0) {
            return Err(Error::InvalidWidth);
        }
        if bits == 0 {
            return Ok(());
        }
        self.grow(bits.into())?;
        self.push_bits(value, bits);
        Ok(())
    }

    /// Writes a signed value as `bits` bits of two's complement
    ///
    /// # Errors
    ///
    /// Returns an error if `bits` is 0 or larger than 32, if the
    /// value does not fit the width, or on failed growth.
    pub fn write_signed(&mut self, value: i32, bits: u32) -> Result<(), Error> {
        if bits == 0 || bits > 32 {
            return Err(Error::InvalidWidth);
        }
        if bits < 32 {
            let limit = 1i64 << (bits - 1);
            if i64::from(value) >= limit || i64::from(value) < -limit {
                return Err(Error::InvalidWidth);
            }
        }
        self.grow(bits.into())?;
        self.push_bits(value as u32 & low_mask(bits), bits);
        Ok(())
    }

    /// Writes the low `bits` bits of an unsigned value, up to 64 wide
    ///
    /// Widths above 32 are split into two word-sized writes.
    ///
    /// # Errors
    ///
    /// Same conditions as [`write_unsigned`](Self::write_unsigned).
    pub fn write_unsigned64(&mut self, value: u64, bits: u32) -> Result<(), Error> {
        if bits > 64 || (bits < 64 && value >> bits != 0) {
            return Err(Error::InvalidWidth);
        }
        if bits <= 32 {
            self.write_unsigned(value as u32, bits)
        } else {
            self.grow(bits.into())?;
            self.push_bits((value >> 32) as u32, bits - 32);
            self.push_bits(value as u32, 32);
            Ok(())
        }
    }

    /// Writes a signed value as `bits` bits of two's complement, up to 64 wide
    ///
    /// # Errors
    ///
    /// Same conditions as [`write_signed`](Self::write_signed).
    pub fn write_signed64(&mut self, value: i64, bits: u32) -> Result<(), Error> {
        if bits == 0 || bits > 64 {
            return Err(Error::InvalidWidth);
        }
        if bits <= 32 {
            i32::try_from(value)
                .map_err(|_| Error::InvalidWidth)
                .and_then(|value| self.write_signed(value, bits))
        } else {
            if bits < 64 {
                let limit = 1i128 << (bits - 1);
                if i128::from(value) >= limit || i128::from(value) < -limit {
                    return Err(Error::InvalidWidth);
                }
            }
            let masked = value as u64 & low_mask64(bits);
            self.grow(bits.into())?;
            self.push_bits((masked >> 32) as u32, bits - 32);
            self.push_bits(masked as u32, 32);
            Ok(())
        }
    }

    /// Writes `value` zero bits followed by a single one bit
    ///
    /// # Errors
    ///
    /// Returns an error on failed growth.
    pub fn write_unary(&mut self, value: u32) -> Result<(), Error> {
        if value < 32 {
            self.write_unsigned(1, value + 1)
        } else {
            self.write_zeroes(value.into())?;
            self.write_unsigned(1, 1)
        }
    }

    /// Writes any number of zero bits
    ///
    /// # Errors
    ///
    /// Returns an error on failed growth.
    pub fn write_zeroes(&mut self, bits: u64) -> Result<(), Error> {
        self.grow(bits)?;
        self.push_zeroes(bits);
        Ok(())
    }

    /// Writes a whole block of bytes
    ///
    /// # Errors
    ///
    /// Returns an error on failed growth.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.grow(bytes.len() as u64 * 8)?;
        for byte in bytes {
            self.push_bits((*byte).into(), 8);
        }
        Ok(())
    }

    /// Pads the output with zero bits to the next byte boundary
    ///
    /// A no-op when the output is already byte-aligned,
    /// so calling it twice in a row is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error on failed growth.
    pub fn byte_align(&mut self) -> Result<(), Error> {
        match self.bits % 8 {
            0 => Ok(()),
            partial => self.write_zeroes(u64::from(8 - partial)),
        }
    }

    /// Writes a frame or sample number as a UTF-8-style varint
    ///
    /// # Errors
    ///
    /// Returns an error if the value needs more than 31 significant
    /// bits, or on failed growth.
    pub fn write_utf8_32(&mut self, value: u32) -> Result<(), Error> {
        if value & 0x8000_0000 != 0 {
            return Err(Error::InvalidFrameNumber);
        }
        self.write_utf8(value.into())
    }

    /// Writes a sample number as a UTF-8-style varint
    ///
    /// # Errors
    ///
    /// Returns an error if the value needs more than 36 significant
    /// bits, or on failed growth.
    pub fn write_utf8_64(&mut self, value: u64) -> Result<(), Error> {
        if value >= 1 << 36 {
            return Err(Error::InvalidFrameNumber);
        }
        self.write_utf8(value)
    }

    fn write_utf8(&mut self, value: u64) -> Result<(), Error> {
        let continuations: u32 = match value {
            0x0..0x80 => return self.write_unsigned(value as u32, 8),
            0x80..0x800 => 1,
            0x800..0x1_0000 => 2,
            0x1_0000..0x20_0000 => 3,
            0x20_0000..0x400_0000 => 4,
            0x400_0000..0x8000_0000 => 5,
            _ => 6,
        };

        // `continuations + 1` one bits, a zero bit,
        // then the topmost payload bits
        let prefix = (0xFEu32 << (6 - continuations)) & 0xFF;
        self.write_unsigned(prefix | (value >> (6 * continuations)) as u32, 8)?;

        for chunk in (0..continuations).rev() {
            self.write_unsigned(0x80 | ((value >> (6 * chunk)) as u32 & 0x3F), 8)?;
        }
        Ok(())
    }

    /// Rice-codes a block of signed values with one parameter
    ///
    /// Each value is zig-zag folded to unsigned, its high bits written
    /// in unary and its low `parameter` bits written raw.  Symbols
    /// regularly straddle word boundaries, so this manages the
    /// accumulator directly instead of going through the byte-by-byte
    /// entry points; it is the hottest path in the encoder.
    ///
    /// # Errors
    ///
    /// Returns an error if `parameter` is larger than 30
    /// or on failed growth.
    pub fn write_rice_signed_block(&mut self, values: &[i32], parameter: u32) -> Result<(), Error> {
        if parameter > 30 {
            return Err(Error::InvalidWidth);
        }

        let stop = 1u32 << parameter;
        let mask = stop - 1;

        for value in values {
            let folded = ((*value as u32) << 1) ^ ((value >> 31) as u32);
            let high = u64::from(folded >> parameter);

            self.grow(high + u64::from(parameter) + 1)?;
            if high > 0 {
                self.push_zeroes(high);
            }
            self.push_bits(stop | (folded & mask), parameter + 1);
        }
        Ok(())
    }

    /// Returns everything written so far as a big-endian byte buffer
    ///
    /// Pending accumulator bits are flushed into the view without
    /// being disturbed, so repeated calls return the same bytes.
    /// The view is invalidated by any subsequent write.
    ///
    /// # Errors
    ///
    /// Returns an error if the bit count is not a whole
    /// number of bytes.
    pub fn bytes(&mut self) -> Result<&[u8], Error> {
        if !self.is_byte_aligned() {
            return Err(Error::NotByteAligned);
        }

        self.byte_cache.clear();
        self.byte_cache
            .reserve(self.buffer.len() * 4 + (self.bits / 8) as usize);
        for word in &self.buffer {
            self.byte_cache.extend_from_slice(&word.to_be_bytes());
        }
        let mut pending = self.bits;
        while pending > 0 {
            pending -= 8;
            self.byte_cache.push((self.accumulator >> pending) as u8);
        }
        Ok(&self.byte_cache)
    }

    /// Returns the CRC-8 of everything written so far
    ///
    /// # Errors
    ///
    /// Returns an error if the bit count is not a whole
    /// number of bytes.
    pub fn crc8(&mut self) -> Result<u8, Error> {
        Ok(crc::crc8(self.bytes()?))
    }

    /// Returns the CRC-16 of everything written so far
    ///
    /// # Errors
    ///
    /// Returns an error if the bit count is not a whole
    /// number of bytes.
    pub fn crc16(&mut self) -> Result<u16, Error> {
        Ok(crc::crc16(self.bytes()?))
    }
}

fn low_mask(bits: u32) -> u32 {
    match bits {
        32 => u32::MAX,
        bits => (1 << bits) - 1,
    }
}

fn low_mask64(bits: u32) -> u64 {
    match bits {
        64 => u64::MAX,
        bits => (1 << bits) - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitstream_io::{BigEndian, BitRead, BitReader};

    #[test]
    fn bit_packing() {
        let mut w = BitPacker::new();
        w.write_unsigned(0x3FFE, 14).unwrap();
        w.write_unsigned(0, 1).unwrap();
        w.write_unsigned(1, 1).unwrap();
        w.write_signed(-2, 8).unwrap();
        assert_eq!(w.bit_count(), 24);
        assert_eq!(w.bytes().unwrap(), &[0xFF, 0xF9, 0xFE]);
    }

    #[test]
    fn word_straddling() {
        // a 24-bit and a 16-bit write span the first word boundary
        let mut w = BitPacker::new();
        w.write_unsigned(0xABCDEF, 24).unwrap();
        w.write_unsigned(0x1234, 16).unwrap();
        w.write_unsigned64(0xDEADBEEF55, 40).unwrap();
        assert_eq!(
            w.bytes().unwrap(),
            &[0xAB, 0xCD, 0xEF, 0x12, 0x34, 0xDE, 0xAD, 0xBE, 0xEF, 0x55]
        );
    }

    #[test]
    fn rejects_wide_values() {
        let mut w = BitPacker::new();
        assert!(matches!(w.write_unsigned(4, 2), Err(Error::InvalidWidth)));
        assert!(matches!(w.write_unsigned(0, 33), Err(Error::InvalidWidth)));
        assert!(matches!(w.write_signed(2, 2), Err(Error::InvalidWidth)));
        assert!(matches!(w.write_signed(-3, 2), Err(Error::InvalidWidth)));
        assert!(matches!(
            w.write_unsigned64(1 << 40, 40),
            Err(Error::InvalidWidth)
        ));
        // nothing was committed by the failures
        assert_eq!(w.bit_count(), 0);

        assert!(w.write_signed(-2, 2).is_ok());
        assert!(w.write_signed(1, 2).is_ok());
    }

    #[test]
    fn unary() {
        let mut w = BitPacker::new();
        w.write_unary(0).unwrap();
        w.write_unary(3).unwrap();
        w.write_unary(2).unwrap();
        // 1 0001 001 -> 0b10001001
        w.write_zeroes(56).unwrap();
        assert_eq!(w.bytes().unwrap()[0], 0b1000_1001);

        // the bulk path beyond 32 zeroes
        let mut w = BitPacker::new();
        w.write_unary(71).unwrap();
        assert_eq!(w.bit_count(), 72);
        assert_eq!(w.bytes().unwrap(), &[0, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn alignment_is_idempotent() {
        let mut w = BitPacker::new();
        w.write_unsigned(1, 3).unwrap();
        w.byte_align().unwrap();
        assert_eq!(w.bit_count(), 8);
        w.byte_align().unwrap();
        assert_eq!(w.bit_count(), 8);
        assert!(w.is_byte_aligned());
    }

    #[test]
    fn unaligned_views_rejected() {
        let mut w = BitPacker::new();
        w.write_unsigned(1, 3).unwrap();
        assert!(matches!(w.bytes(), Err(Error::NotByteAligned)));
        w.byte_align().unwrap();
        assert_eq!(w.bytes().unwrap(), &[0b0010_0000]);
    }

    #[test]
    fn views_are_idempotent() {
        let mut w = BitPacker::new();
        w.write_bytes(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(w.bytes().unwrap().to_vec(), w.bytes().unwrap());
        assert_eq!(w.bit_count(), 48);

        // pending bits survive the flush and later writes continue them
        w.write_unsigned(0xAB, 8).unwrap();
        assert_eq!(w.bytes().unwrap(), &[1, 2, 3, 4, 5, 6, 0xAB]);
    }

    #[test]
    fn utf8_encoding() {
        fn utf8_bytes(value: u64) -> Vec<u8> {
            let mut w = BitPacker::new();
            w.write_utf8_64(value).unwrap();
            w.bytes().unwrap().to_vec()
        }

        assert_eq!(utf8_bytes(0), &[0x00]);
        assert_eq!(utf8_bytes(0x7F), &[0x7F]);
        assert_eq!(utf8_bytes(0x80), &[0xC2, 0x80]);
        assert_eq!(utf8_bytes(0x7FF), &[0xDF, 0xBF]);
        assert_eq!(utf8_bytes(0x800), &[0xE0, 0xA0, 0x80]);
        assert_eq!(utf8_bytes(0xFFFF), &[0xEF, 0xBF, 0xBF]);
        assert_eq!(utf8_bytes(0x1_0000), &[0xF0, 0x90, 0x80, 0x80]);
        // 36 significant bits use the longest, 7-byte form
        assert_eq!(
            utf8_bytes((1 << 36) - 1),
            &[0xFE, 0xBF, 0xBF, 0xBF, 0xBF, 0xBF, 0xBF]
        );

        let mut w = BitPacker::new();
        assert!(matches!(
            w.write_utf8_32(1 << 31),
            Err(Error::InvalidFrameNumber)
        ));
        assert!(matches!(
            w.write_utf8_64(1 << 36),
            Err(Error::InvalidFrameNumber)
        ));
    }

    #[test]
    fn rice_block() {
        // residual [2, -1, 2, -1, 2] folds to [4, 1, 4, 1, 4];
        // with parameter 2 each symbol is (folded >> 2) unary zeroes
        // plus 1 stop bit plus 2 low bits: 4+3+4+3+4 = 18 bits total
        let mut w = BitPacker::new();
        w.write_rice_signed_block(&[2, -1, 2, -1, 2], 2).unwrap();
        assert_eq!(w.bit_count(), 18);

        // 0100 101 0100 101 0100 + six pad bits
        w.byte_align().unwrap();
        assert_eq!(w.bytes().unwrap(), &[0b0100_1010, 0b1001_0101, 0b0000_0000]);
    }

    #[test]
    fn rice_block_decodes() {
        let values = [0, -1, 1, -64, 64, 1000, -1000, 100_000, -100_000];

        for parameter in 0..=30 {
            let mut w = BitPacker::new();
            w.write_rice_signed_block(&values, parameter).unwrap();
            w.byte_align().unwrap();

            let bytes = w.bytes().unwrap();
            let mut r = BitReader::endian(bytes, BigEndian);
            for value in values {
                let high = r.read_unary::<1>().unwrap();
                let low = r.read_var::<u32>(parameter).unwrap();
                let folded = (u64::from(high) << parameter) | u64::from(low);
                let signed = (folded >> 1) as i32 ^ -((folded & 1) as i32);
                assert_eq!(signed, value, "parameter {parameter}");
            }
        }
    }

    #[test]
    fn growth_ceiling() {
        let mut w = BitPacker::new();
        w.write_bytes(&[0xA5; 16]).unwrap();

        // filling up to the ceiling is fine
        w.write_zeroes((BitPacker::MAX_BYTES as u64 - 16) * 8).unwrap();
        assert_eq!(w.bit_count(), BitPacker::MAX_BYTES as u64 * 8);

        // one more bit is not, and prior contents are unharmed
        assert!(matches!(w.write_unsigned(0, 1), Err(Error::BufferFull)));
        assert!(matches!(w.write_zeroes(1), Err(Error::BufferFull)));
        assert_eq!(w.bit_count(), BitPacker::MAX_BYTES as u64 * 8);
        assert_eq!(&w.bytes().unwrap()[0..16], &[0xA5; 16]);
    }

    #[test]
    fn clearing_retains_capacity() {
        let mut w = BitPacker::new();
        w.write_bytes(&[1; 9000]).unwrap();
        let capacity = w.buffer.capacity();

        w.clear();
        assert_eq!(w.bit_count(), 0);
        assert_eq!(w.bytes().unwrap(), &[] as &[u8]);
        assert_eq!(w.buffer.capacity(), capacity);
    }

    #[test]
    fn crc_tracks_current_contents() {
        let mut w = BitPacker::new();
        w.write_bytes(&[0xFF, 0xF8, 0x69, 0x18]).unwrap();
        let before = w.crc8().unwrap();

        w.write_unsigned(0x42, 8).unwrap();
        let after = w.crc8().unwrap();
        assert_ne!(before, after);

        // the checksum is over the exact current byte view
        assert_eq!(after, crate::crc::crc8(&[0xFF, 0xF8, 0x69, 0x18, 0x42]));
        assert_eq!(w.crc16().unwrap(), crate::crc::crc16(w.bytes().unwrap()));
    }
}
