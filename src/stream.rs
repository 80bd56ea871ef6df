// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For handling common FLAC stream items
//!
//! The frame header packs its block size, sample rate and
//! bits-per-sample as lookup-table "hint" codes covering the common
//! exact values, with escapes to raw 8- or 16-bit values written
//! after the frame number when a value has no code of its own.
//! The header ends with a CRC-8 over every byte emitted so far,
//! sync code included.

use crate::Error;
use crate::packer::BitPacker;
use bitstream_io::{BitRead, FromBitStreamWith};

/// Stream-wide parameters a frame header may defer to
///
/// A header can encode "same as the stream" for its sample rate and
/// bits-per-sample rather than spelling them out; readers resolve
/// those codes against these values.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamDefaults {
    /// Sample rate, in Hz
    pub sample_rate: u32,
    /// Bits-per-sample, from 4 to 32
    pub bits_per_sample: u32,
}

/// How a frame's channels are stored
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelAssignment {
    /// 1 to 8 channels, each stored independently
    Independent(u8),
    /// The left channel, then the difference of left and right
    LeftSide,
    /// The difference of left and right, then the right channel
    SideRight,
    /// The average of both channels, then their difference
    MidSide,
}

impl ChannelAssignment {
    /// Total number of channels in the frame
    pub fn channel_count(self) -> u8 {
        match self {
            Self::Independent(channels) => channels,
            Self::LeftSide | Self::SideRight | Self::MidSide => 2,
        }
    }

    fn code(self) -> u32 {
        match self {
            Self::Independent(channels) => u32::from(channels) - 1,
            Self::LeftSide => 0b1000,
            Self::SideRight => 0b1001,
            Self::MidSide => 0b1010,
        }
    }
}

/// A frame's position in the stream
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameNumbering {
    /// Frame count, for fixed-block-size streams
    Frame(u32),
    /// First sample's offset, for variable-block-size streams
    Sample(u64),
}

/// A running frame counter with a checked increment
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct FrameNumber(u32);

impl FrameNumber {
    /// The largest encodable frame number (a 31-bit varint)
    pub const MAX: u32 = (1 << 31) - 1;

    /// The current frame number
    pub fn get(self) -> u32 {
        self.0
    }

    /// Advances to the next frame
    ///
    /// # Errors
    ///
    /// Returns an error once the count outgrows its varint encoding.
    pub fn try_increment(&mut self) -> Result<(), Error> {
        match self.0.checked_add(1).filter(|n| *n <= Self::MAX) {
            Some(next) => {
                self.0 = next;
                Ok(())
            }
            None => Err(Error::InvalidFrameNumber),
        }
    }
}

/// A FLAC frame header
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    /// Block size, in samples
    pub block_size: u16,
    /// Sample rate, in Hz
    pub sample_rate: u32,
    /// How the channels are stored
    pub channel_assignment: ChannelAssignment,
    /// Bits-per-sample, before any stereo decorrelation
    pub bits_per_sample: u32,
    /// The frame or sample number
    pub numbering: FrameNumbering,
}

// an 8- or 16-bit raw value written after the frame number
// when no hint code matches
enum Escape {
    Bits8(u32),
    Bits16(u32),
}

fn block_size_code(block_size: u16) -> (u32, Option<Escape>) {
    debug_assert!(block_size >= 1);
    match block_size {
        192 => (0b0001, None),
        576 => (0b0010, None),
        1152 => (0b0011, None),
        2304 => (0b0100, None),
        4608 => (0b0101, None),
        256 => (0b1000, None),
        512 => (0b1001, None),
        1024 => (0b1010, None),
        2048 => (0b1011, None),
        4096 => (0b1100, None),
        8192 => (0b1101, None),
        16384 => (0b1110, None),
        32768 => (0b1111, None),
        size @ ..=256 => (0b0110, Some(Escape::Bits8(u32::from(size) - 1))),
        size => (0b0111, Some(Escape::Bits16(u32::from(size) - 1))),
    }
}

fn sample_rate_code(sample_rate: u32) -> (u32, Option<Escape>) {
    match sample_rate {
        88200 => (0b0001, None),
        176400 => (0b0010, None),
        192000 => (0b0011, None),
        8000 => (0b0100, None),
        16000 => (0b0101, None),
        22050 => (0b0110, None),
        24000 => (0b0111, None),
        32000 => (0b1000, None),
        44100 => (0b1001, None),
        48000 => (0b1010, None),
        96000 => (0b1011, None),
        rate if rate % 1000 == 0 && rate / 1000 <= 0xFF => {
            (0b1100, Some(Escape::Bits8(rate / 1000)))
        }
        rate if rate <= 0xFFFF => (0b1101, Some(Escape::Bits16(rate))),
        rate if rate % 10 == 0 && rate / 10 <= 0xFFFF => (0b1110, Some(Escape::Bits16(rate / 10))),
        // not representable in a header; readers fall back
        // to the stream-wide value
        _ => (0b0000, None),
    }
}

fn bits_per_sample_code(bits_per_sample: u32) -> u32 {
    match bits_per_sample {
        8 => 0b001,
        12 => 0b010,
        16 => 0b100,
        20 => 0b101,
        24 => 0b110,
        32 => 0b111,
        _ => 0b000,
    }
}

fn utf8_length(value: u64) -> usize {
    match value {
        0x0..0x80 => 1,
        0x80..0x800 => 2,
        0x800..0x1_0000 => 3,
        0x1_0000..0x20_0000 => 4,
        0x20_0000..0x400_0000 => 5,
        0x400_0000..0x8000_0000 => 6,
        _ => 7,
    }
}

impl FrameHeader {
    /// Writes the header through the packer
    ///
    /// The header must be the first thing written to the packer,
    /// because its trailing CRC-8 is taken from the packer's own
    /// byte view and has to cover exactly the header's bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame or sample number has outgrown
    /// its varint encoding, or if the packer runs out of room.
    pub fn write(&self, packer: &mut BitPacker) -> Result<(), Error> {
        debug_assert_eq!(packer.bit_count(), 0);

        packer.write_unsigned(0b11111111111110, 14)?;
        packer.write_unsigned(0, 1)?; // reserved
        packer.write_unsigned(
            matches!(self.numbering, FrameNumbering::Sample(_)).into(),
            1,
        )?;

        let (block_size, block_size_escape) = block_size_code(self.block_size);
        packer.write_unsigned(block_size, 4)?;
        let (sample_rate, sample_rate_escape) = sample_rate_code(self.sample_rate);
        packer.write_unsigned(sample_rate, 4)?;
        packer.write_unsigned(self.channel_assignment.code(), 4)?;
        packer.write_unsigned(bits_per_sample_code(self.bits_per_sample), 3)?;
        packer.write_unsigned(0, 1)?; // reserved

        match self.numbering {
            FrameNumbering::Frame(number) => packer.write_utf8_32(number)?,
            FrameNumbering::Sample(number) => packer.write_utf8_64(number)?,
        }

        for escape in [block_size_escape, sample_rate_escape].into_iter().flatten() {
            match escape {
                Escape::Bits8(value) => packer.write_unsigned(value, 8)?,
                Escape::Bits16(value) => packer.write_unsigned(value, 16)?,
            }
        }

        let crc = packer.crc8()?;
        packer.write_unsigned(crc.into(), 8)
    }

    // the header's total length in bytes, CRC included
    pub(crate) fn byte_length(&self) -> usize {
        let escape_bytes = |escape: &Option<Escape>| match escape {
            None => 0,
            Some(Escape::Bits8(_)) => 1,
            Some(Escape::Bits16(_)) => 2,
        };

        4 + utf8_length(match self.numbering {
            FrameNumbering::Frame(number) => number.into(),
            FrameNumbering::Sample(number) => number,
        }) + escape_bytes(&block_size_code(self.block_size).1)
            + escape_bytes(&sample_rate_code(self.sample_rate).1)
            + 1
    }
}

fn read_utf8<R: BitRead + ?Sized>(r: &mut R) -> Result<u64, Error> {
    match r.read_unary::<0>()? {
        0 => Ok(r.read::<7, u64>()?),
        1 => Err(Error::InvalidFrameNumber),
        bytes @ 2..=7 => {
            let mut value: u64 = r.read_var(7 - bytes)?;
            for _ in 1..bytes {
                match r.read::<2, u8>()? {
                    0b10 => {
                        value = value << 6 | r.read::<6, u64>()?;
                    }
                    _ => return Err(Error::InvalidFrameNumber),
                }
            }
            Ok(value)
        }
        _ => Err(Error::InvalidFrameNumber),
    }
}

impl FromBitStreamWith<'_> for FrameHeader {
    type Error = Error;
    type Context = StreamDefaults;

    fn from_reader<R: BitRead + ?Sized>(
        r: &mut R,
        defaults: &StreamDefaults,
    ) -> Result<Self, Self::Error> {
        if r.read::<15, u16>()? != 0b111111111111100 {
            return Err(Error::InvalidSyncCode);
        }
        let blocking_strategy = r.read_bit()?;
        let encoded_block_size = r.read::<4, u8>()?;
        let encoded_sample_rate = r.read::<4, u8>()?;
        let encoded_channels = r.read::<4, u8>()?;
        let encoded_bps = r.read::<3, u8>()?;
        r.skip(1)?;
        let number = read_utf8(r)?;

        Ok(Self {
            numbering: if blocking_strategy {
                FrameNumbering::Sample(number)
            } else {
                FrameNumbering::Frame(
                    u32::try_from(number)
                        .ok()
                        .filter(|n| *n <= FrameNumber::MAX)
                        .ok_or(Error::InvalidFrameNumber)?,
                )
            },
            block_size: match encoded_block_size {
                0b0000 => return Err(Error::InvalidBlockSize),
                0b0001 => 192,
                v @ 0b0010..=0b0101 => 144 * (1 << v),
                0b0110 => r.read::<8, u16>()? + 1,
                0b0111 => r.read::<16, u16>()? + 1,
                v @ 0b1000..=0b1111 => 1 << v,
                _ => unreachable!(), // 4-bit field
            },
            sample_rate: match encoded_sample_rate {
                0b0000 => defaults.sample_rate,
                0b0001 => 88200,
                0b0010 => 176400,
                0b0011 => 192000,
                0b0100 => 8000,
                0b0101 => 16000,
                0b0110 => 22050,
                0b0111 => 24000,
                0b1000 => 32000,
                0b1001 => 44100,
                0b1010 => 48000,
                0b1011 => 96000,
                0b1100 => r.read::<8, u32>()? * 1000,
                0b1101 => r.read::<16, _>()?,
                0b1110 => r.read::<16, u32>()? * 10,
                0b1111 => return Err(Error::InvalidSampleRate),
                _ => unreachable!(), // 4-bit field
            },
            channel_assignment: match encoded_channels {
                c @ 0b0000..=0b0111 => ChannelAssignment::Independent(c + 1),
                0b1000 => ChannelAssignment::LeftSide,
                0b1001 => ChannelAssignment::SideRight,
                0b1010 => ChannelAssignment::MidSide,
                0b1011..=0b1111 => return Err(Error::InvalidChannels),
                _ => unreachable!(), // 4-bit field
            },
            bits_per_sample: match encoded_bps {
                0b000 => defaults.bits_per_sample,
                0b001 => 8,
                0b010 => 12,
                0b011 => return Err(Error::InvalidBitsPerSample),
                0b100 => 16,
                0b101 => 20,
                0b110 => 24,
                0b111 => 32,
                _ => unreachable!(), // 3-bit field
            },
        })
    }
}
