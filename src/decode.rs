// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For reading FLAC frames back to PCM samples
//!
//! This is the decode side needed to prove that encoded frames
//! reconstruct their input exactly: one whole frame at a time is
//! parsed, its subframes and residuals undone, and both of its
//! checksums verified.  Stream-level concerns such as metadata and
//! seeking live outside this crate.

use crate::Error;
use crate::crc;
use crate::lpc::QuantizedParameters;
use crate::stream::{ChannelAssignment, FrameHeader};
use crate::subframe;
use bitstream_io::{BigEndian, BitRead, BitReader, SignedBitCount};

pub use crate::stream::StreamDefaults;

/// One decoded frame
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DecodedFrame {
    /// The frame's header
    pub header: FrameHeader,
    /// Decoded samples, one buffer per channel
    pub channels: Vec<Vec<i32>>,
}

/// Reads one whole FLAC frame from its packed bytes
///
/// `frame` must hold exactly one frame, CRC-16 included.  Both the
/// header CRC-8 and the frame CRC-16 are verified, stereo
/// decorrelation is undone, and the returned channels hold the
/// original PCM samples.
///
/// # Errors
///
/// Returns an error if either checksum fails or any frame or
/// subframe field is invalid.
pub fn read_frame(frame: &[u8], defaults: &StreamDefaults) -> Result<DecodedFrame, Error> {
    // a valid frame followed by its own CRC-16 folds to zero
    if frame.len() < 2 || crc::crc16(frame) != 0 {
        return Err(Error::Crc16Mismatch);
    }

    let mut r = BitReader::endian(frame, BigEndian);
    let header = r.parse_with::<FrameHeader>(defaults)?;

    // likewise the header including its own CRC-8
    let header_length = header.byte_length();
    if frame.len() < header_length || crc::crc8(&frame[..header_length]) != 0 {
        return Err(Error::Crc8Mismatch);
    }
    r.skip(8)?; // the CRC-8 byte itself

    let block_size = usize::from(header.block_size);
    let bits_per_sample = header.bits_per_sample;

    let mut channels = Vec::with_capacity(header.channel_assignment.channel_count().into());
    for channel in 0..header.channel_assignment.channel_count() {
        // decorrelated difference channels carry one extra bit
        let difference = match header.channel_assignment {
            ChannelAssignment::Independent(_) => false,
            ChannelAssignment::LeftSide | ChannelAssignment::MidSide => channel == 1,
            ChannelAssignment::SideRight => channel == 0,
        };
        channels.push(read_subframe(
            &mut r,
            block_size,
            bits_per_sample + u32::from(difference),
        )?);
    }

    match header.channel_assignment {
        ChannelAssignment::Independent(_) => {}
        ChannelAssignment::LeftSide => {
            let [left, side] = &mut channels[..] else {
                unreachable!(); // two channels by construction
            };
            for (s, l) in side.iter_mut().zip(left.iter()) {
                *s = l.wrapping_sub(*s);
            }
        }
        ChannelAssignment::SideRight => {
            let [side, right] = &mut channels[..] else {
                unreachable!();
            };
            for (s, r) in side.iter_mut().zip(right.iter()) {
                *s = r.wrapping_add(*s);
            }
        }
        ChannelAssignment::MidSide => {
            let [mid, side] = &mut channels[..] else {
                unreachable!();
            };
            for (m, s) in mid.iter_mut().zip(side.iter_mut()) {
                // the side channel's low bit restores the averaged-away
                // bit of left + right
                let sum = (*m << 1) | (*s & 1);
                *m = sum.wrapping_add(*s) >> 1;
                *s = sum.wrapping_sub(*s) >> 1;
            }
        }
    }

    Ok(DecodedFrame { header, channels })
}

fn read_subframe<R: BitRead + ?Sized>(
    r: &mut R,
    block_size: usize,
    bits_per_sample: u32,
) -> Result<Vec<i32>, Error> {
    if r.read::<1, u8>()? != 0 {
        return Err(Error::InvalidSubframeHeader);
    }
    let type_code = r.read::<6, u8>()?;
    let wasted = match r.read_bit()? {
        true => r.read_unary::<1>()? + 1,
        false => 0,
    };

    let sample_bits = bits_per_sample
        .checked_sub(wasted)
        .filter(|bits| *bits > 0)
        .ok_or(Error::ExcessiveWastedBits)?;
    let count: SignedBitCount<32> = sample_bits
        .try_into()
        .map_err(|_| Error::InvalidBitsPerSample)?;

    let mut samples = match type_code {
        0b000000 => {
            let value: i32 = r.read_signed_counted(count)?;
            vec![value; block_size]
        }
        0b000001 => {
            let mut samples = Vec::with_capacity(block_size);
            for _ in 0..block_size {
                samples.push(r.read_signed_counted(count)?);
            }
            samples
        }
        code @ 0b001000..=0b001100 => {
            let order = usize::from(code & 0b000111);
            if order > block_size {
                return Err(Error::InvalidSubframeHeader);
            }
            let mut samples = Vec::with_capacity(block_size);
            for _ in 0..order {
                samples.push(r.read_signed_counted(count)?);
            }
            let residual = read_residual(r, block_size, order)?;
            samples.resize(block_size, 0);
            subframe::restore_fixed(&residual, order, &mut samples);
            samples
        }
        code @ 0b100000..=0b111111 => {
            let order = usize::from((code & 0b011111) + 1);
            if order > block_size {
                return Err(Error::InvalidSubframeHeader);
            }
            let mut samples = Vec::with_capacity(block_size);
            for _ in 0..order {
                samples.push(r.read_signed_counted(count)?);
            }

            let precision = match r.read::<4, u32>()? {
                0b1111 => return Err(Error::InvalidPrecision),
                precision => precision + 1,
            };
            let precision_count: SignedBitCount<32> = precision
                .try_into()
                .map_err(|_| Error::InvalidPrecision)?;
            let shift: i32 = r.read::<5, i32>()?;

            let mut coefficients = Vec::with_capacity(order);
            for _ in 0..order {
                coefficients.push(r.read_signed_counted(precision_count)?);
            }
            let parameters = QuantizedParameters::new(&coefficients, precision, shift)?;

            let residual = read_residual(r, block_size, order)?;
            samples.resize(block_size, 0);
            parameters.restore_signal_wide(&residual, &mut samples);
            samples
        }
        _ => return Err(Error::InvalidSubframeHeader),
    };

    if wasted > 0 {
        for sample in &mut samples {
            *sample <<= wasted;
        }
    }
    Ok(samples)
}

fn read_residual<R: BitRead + ?Sized>(
    r: &mut R,
    block_size: usize,
    predictor_order: usize,
) -> Result<Vec<i32>, Error> {
    let (parameter_bits, escape_code) = match r.read::<2, u8>()? {
        0b00 => (4, 0b1111),
        0b01 => (5, 0b11111),
        _ => return Err(Error::InvalidCodingMethod),
    };

    let order = r.read::<4, u32>()?;
    let partitions = 1usize << order;
    if block_size % partitions != 0 {
        return Err(Error::InvalidPartitionOrder);
    }
    let partition_samples = block_size >> order;
    let first_count = partition_samples
        .checked_sub(predictor_order)
        .ok_or(Error::InvalidPartitionOrder)?;

    let mut residual = Vec::with_capacity(block_size - predictor_order);
    for partition in 0..partitions {
        let count = match partition {
            0 => first_count,
            _ => partition_samples,
        };
        let parameter: u32 = r.read_var(parameter_bits)?;

        if parameter == escape_code {
            match r.read::<5, u32>()? {
                // a zero-width partition is all zero residuals
                0 => residual.resize(residual.len() + count, 0),
                raw_bits => {
                    let raw_count: SignedBitCount<32> = raw_bits
                        .try_into()
                        .map_err(|_| Error::InvalidCodingMethod)?;
                    for _ in 0..count {
                        residual.push(r.read_signed_counted(raw_count)?);
                    }
                }
            }
        } else {
            for _ in 0..count {
                let high = r.read_unary::<1>()?;
                let low: u32 = r.read_var(parameter)?;
                let folded = u64::from(high) << parameter | u64::from(low);
                residual.push((folded >> 1) as i32 ^ -((folded & 1) as i32));
            }
        }
    }
    Ok(residual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packer::BitPacker;
    use crate::rice::{self, Partition};

    fn written_residual(residual: &[i32], block_size: usize, bits_per_sample: u32) -> Vec<u8> {
        let (method, _) = rice::plan(residual, 0, block_size, 4, bits_per_sample);
        let mut packer = BitPacker::new();
        rice::write(&mut packer, residual, 0, block_size, &method).unwrap();
        packer.byte_align().unwrap();
        packer.bytes().unwrap().to_vec()
    }

    #[test]
    fn rice_partitions_read_back() {
        let mut rng = fastrand::Rng::with_seed(0xC0DE);
        let residual = (0..256).map(|_| rng.i32(-400..400)).collect::<Vec<i32>>();

        let bytes = written_residual(&residual, 256, 16);
        let mut r = BitReader::endian(bytes.as_slice(), BigEndian);
        assert_eq!(read_residual(&mut r, 256, 0).unwrap(), residual);
    }

    #[test]
    fn escaped_partitions_read_back() {
        // a quiet half and a half far past the 4-bit parameter cap,
        // which only the escape path can store compactly
        let mut residual = vec![0i32; 64];
        for (i, r) in residual.iter_mut().enumerate().skip(32) {
            *r = (i as i32 - 48) * 40000;
        }

        let (method, _) = rice::plan(&residual, 0, 64, 1, 16);
        assert!(
            method
                .layout()
                .partitions
                .iter()
                .any(|p| matches!(p, Partition::Escape { .. }))
        );

        let mut packer = BitPacker::new();
        rice::write(&mut packer, &residual, 0, 64, &method).unwrap();
        packer.byte_align().unwrap();
        let bytes = packer.bytes().unwrap();
        let mut r = BitReader::endian(bytes, BigEndian);
        assert_eq!(read_residual(&mut r, 64, 0).unwrap(), residual);
    }

    #[test]
    fn invalid_coding_methods_are_rejected() {
        let mut packer = BitPacker::new();
        packer.write_unsigned(0b10, 2).unwrap();
        packer.write_unsigned(0, 4).unwrap();
        packer.byte_align().unwrap();

        let bytes = packer.bytes().unwrap();
        let mut r = BitReader::endian(bytes, BigEndian);
        assert!(matches!(
            read_residual(&mut r, 16, 0),
            Err(Error::InvalidCodingMethod)
        ));
    }
}
