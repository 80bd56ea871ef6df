// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For encoding PCM sample blocks to FLAC frames
//!
//! [`FrameEncoder`] turns one block of per-channel samples at a time
//! into a complete FLAC frame: header, one subframe per channel,
//! byte-alignment padding and the trailing CRC-16.  Stereo blocks are
//! also tried in the left/side, right/side and mid/side decorrelated
//! forms and the cheapest assignment wins.
//!
//! The encoder owns a single [`BitPacker`] and reuses it from frame
//! to frame, so a returned frame's bytes must be copied out before
//! the next call.

use crate::Error;
use crate::lpc::Window;
use crate::packer::BitPacker;
use crate::rice::MAX_SUBSET_PARTITION_ORDER;
use crate::stream::{ChannelAssignment, FrameHeader, FrameNumber, FrameNumbering};
use crate::subframe::{self, SubframePlan};

/// FLAC encoding options
#[derive(Debug, Clone)]
pub struct EncodingOptions {
    block_size: u16,
    max_lpc_order: usize,
    qlp_precision: u32,
    max_partition_order: u32,
    window: Window,
    stereo_decorrelation: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_lpc_order: 8,
            qlp_precision: 0,
            max_partition_order: 5,
            window: Window::default(),
            stereo_decorrelation: true,
        }
    }
}

impl EncodingOptions {
    /// Assigns a new block size to the options
    ///
    /// # Errors
    ///
    /// Returns an error if the block size is 0.
    pub fn block_size(self, block_size: u16) -> Result<Self, Error> {
        match block_size {
            0 => Err(Error::InvalidBlockSize),
            block_size => Ok(Self { block_size, ..self }),
        }
    }

    /// Assigns a new maximum LPC order, 0 disabling LPC entirely
    ///
    /// # Errors
    ///
    /// Returns an error if the order is above the format's
    /// maximum of 32.
    pub fn max_lpc_order(self, max_lpc_order: usize) -> Result<Self, Error> {
        match max_lpc_order {
            0..=crate::lpc::MAX_LPC_ORDER => Ok(Self {
                max_lpc_order,
                ..self
            }),
            _ => Err(Error::InvalidLpcOrder),
        }
    }

    /// Assigns a coefficient precision, 0 choosing one automatically
    ///
    /// # Errors
    ///
    /// Returns an error if the precision is outside the 5 to 15
    /// bit range.
    pub fn qlp_precision(self, qlp_precision: u32) -> Result<Self, Error> {
        match qlp_precision {
            0 | crate::lpc::MIN_QLP_PRECISION..=crate::lpc::MAX_QLP_PRECISION => Ok(Self {
                qlp_precision,
                ..self
            }),
            _ => Err(Error::InvalidPrecision),
        }
    }

    /// Assigns a new maximum residual partition order
    ///
    /// # Errors
    ///
    /// Returns an error if the order is above the streamable
    /// subset's maximum of 8.
    pub fn max_partition_order(self, max_partition_order: u32) -> Result<Self, Error> {
        match max_partition_order {
            0..=MAX_SUBSET_PARTITION_ORDER => Ok(Self {
                max_partition_order,
                ..self
            }),
            _ => Err(Error::InvalidPartitionOrder),
        }
    }

    /// Assigns a new analysis window
    pub fn window(self, window: Window) -> Self {
        Self { window, ..self }
    }

    /// Enables or disables stereo decorrelation
    pub fn stereo_decorrelation(self, stereo_decorrelation: bool) -> Self {
        Self {
            stereo_decorrelation,
            ..self
        }
    }
}

/// A FLAC frame encoder
///
/// Encodes one block of samples per call and hands back the packed
/// frame bytes.  All per-frame state lives in buffers owned by this
/// encoder and reset between frames, so one encoder per thread
/// encodes frames with no shared state at all.
pub struct FrameEncoder {
    options: EncodingOptions,
    sample_rate: u32,
    bits_per_sample: u32,
    channels: u8,
    frame_number: FrameNumber,
    packer: BitPacker,
    window: Vec<f64>,
}

impl FrameEncoder {
    /// Creates a new encoder with the given stream parameters
    ///
    /// `sample_rate` must be between 1 and 1048575 Hz,
    /// `bits_per_sample` between 4 and 32, and `channels`
    /// between 1 and 8.
    ///
    /// # Errors
    ///
    /// Returns an error if any stream parameter is out of range.
    pub fn new(
        options: EncodingOptions,
        sample_rate: u32,
        bits_per_sample: u32,
        channels: u8,
    ) -> Result<Self, Error> {
        if !(1..1 << 20).contains(&sample_rate) {
            return Err(Error::InvalidSampleRate);
        }
        if !(4..=32).contains(&bits_per_sample) {
            return Err(Error::InvalidBitsPerSample);
        }
        if !(1..=8).contains(&channels) {
            return Err(Error::ExcessiveChannels);
        }

        Ok(Self {
            options,
            sample_rate,
            bits_per_sample,
            channels,
            frame_number: FrameNumber::default(),
            packer: BitPacker::new(),
            window: Vec::new(),
        })
    }

    /// The number of frames encoded so far
    pub fn frames_encoded(&self) -> u32 {
        self.frame_number.get()
    }

    /// Encodes one block of per-channel samples as a FLAC frame
    ///
    /// Every channel must hold the same number of samples; a short
    /// final block is fine.  The returned bytes are only valid until
    /// the next call, since the encoder's buffer is reused.
    ///
    /// # Errors
    ///
    /// Returns an error if the channels do not match the stream
    /// parameters, if the block size is out of range, or if the
    /// frame outgrows the packer.  A failed frame writes nothing
    /// usable; the caller must not emit its bytes.
    pub fn encode_frame(&mut self, channels: &[&[i32]]) -> Result<&[u8], Error> {
        if channels.len() != usize::from(self.channels) {
            return Err(Error::ChannelsMismatch);
        }
        let block_size = channels[0].len();
        if channels.iter().any(|c| c.len() != block_size) {
            return Err(Error::ChannelsMismatch);
        }
        let block_size = match u16::try_from(block_size) {
            Ok(block_size @ 1..) => block_size,
            _ => return Err(Error::InvalidBlockSize),
        };

        if self.window.len() != channels[0].len() {
            self.window = self.options.window.coefficients(channels[0].len());
        }

        let (channel_assignment, plans) = self.plan_channels(channels);

        self.packer.clear();

        FrameHeader {
            block_size,
            sample_rate: self.sample_rate,
            channel_assignment,
            bits_per_sample: self.bits_per_sample,
            numbering: FrameNumbering::Frame(self.frame_number.get()),
        }
        .write(&mut self.packer)?;

        for plan in &plans {
            subframe::write_subframe(&mut self.packer, plan)?;
        }

        self.packer.byte_align()?;
        let crc16 = self.packer.crc16()?;
        self.packer.write_unsigned(crc16.into(), 16)?;

        self.frame_number.try_increment()?;
        self.packer.bytes()
    }

    fn plan_subframe(&self, samples: &[i32], bits_per_sample: u32) -> SubframePlan {
        subframe::plan_subframe(
            samples,
            bits_per_sample,
            &self.window,
            self.options.max_lpc_order,
            self.options.qlp_precision,
            self.options.max_partition_order,
        )
    }

    fn plan_channels(&self, channels: &[&[i32]]) -> (ChannelAssignment, Vec<SubframePlan>) {
        let bits_per_sample = self.bits_per_sample;

        // a 32-bit side channel would need 33-bit samples
        if let ([left, right], true) = (
            channels,
            self.options.stereo_decorrelation && bits_per_sample < 32,
        ) {
            let mid = left
                .iter()
                .zip(right.iter())
                .map(|(l, r)| (l + r) >> 1)
                .collect::<Vec<i32>>();
            let side = left
                .iter()
                .zip(right.iter())
                .map(|(l, r)| l - r)
                .collect::<Vec<i32>>();

            let left_plan = self.plan_subframe(left, bits_per_sample);
            let right_plan = self.plan_subframe(right, bits_per_sample);
            let mid_plan = self.plan_subframe(&mid, bits_per_sample);
            let side_plan = self.plan_subframe(&side, bits_per_sample + 1);

            let independent = left_plan.bits() + right_plan.bits();
            let left_side = left_plan.bits() + side_plan.bits();
            let side_right = side_plan.bits() + right_plan.bits();
            let mid_side = mid_plan.bits() + side_plan.bits();

            let cheapest = independent.min(left_side).min(side_right).min(mid_side);
            if cheapest == independent {
                (
                    ChannelAssignment::Independent(2),
                    vec![left_plan, right_plan],
                )
            } else if cheapest == mid_side {
                (ChannelAssignment::MidSide, vec![mid_plan, side_plan])
            } else if cheapest == left_side {
                (ChannelAssignment::LeftSide, vec![left_plan, side_plan])
            } else {
                (ChannelAssignment::SideRight, vec![side_plan, right_plan])
            }
        } else {
            (
                ChannelAssignment::Independent(channels.len() as u8),
                channels
                    .iter()
                    .map(|c| self.plan_subframe(c, bits_per_sample))
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(length: usize, period: f64, amplitude: f64) -> Vec<i32> {
        (0..length)
            .map(|i| (amplitude * (i as f64 / period).sin()) as i32)
            .collect()
    }

    #[test]
    fn rejects_bad_stream_parameters() {
        let options = EncodingOptions::default;
        assert!(matches!(
            FrameEncoder::new(options(), 0, 16, 2),
            Err(Error::InvalidSampleRate)
        ));
        assert!(matches!(
            FrameEncoder::new(options(), 44100, 3, 2),
            Err(Error::InvalidBitsPerSample)
        ));
        assert!(matches!(
            FrameEncoder::new(options(), 44100, 16, 9),
            Err(Error::ExcessiveChannels)
        ));
        assert!(matches!(
            options().block_size(0),
            Err(Error::InvalidBlockSize)
        ));
        assert!(matches!(
            options().max_lpc_order(33),
            Err(Error::InvalidLpcOrder)
        ));
        assert!(matches!(
            options().max_partition_order(9),
            Err(Error::InvalidPartitionOrder)
        ));
        assert!(matches!(
            options().qlp_precision(16),
            Err(Error::InvalidPrecision)
        ));
    }

    #[test]
    fn rejects_mismatched_channels() {
        let mut encoder =
            FrameEncoder::new(EncodingOptions::default(), 44100, 16, 2).unwrap();

        assert!(matches!(
            encoder.encode_frame(&[&[0i32; 64]]),
            Err(Error::ChannelsMismatch)
        ));
        assert!(matches!(
            encoder.encode_frame(&[&[0i32; 64], &[0i32; 63]]),
            Err(Error::ChannelsMismatch)
        ));
        assert!(matches!(
            encoder.encode_frame(&[&[] as &[i32], &[]]),
            Err(Error::InvalidBlockSize)
        ));
    }

    #[test]
    fn frames_are_self_checking() {
        let left = sine(4096, 23.0, 9000.0);
        let right = sine(4096, 31.0, 7000.0);

        let mut encoder =
            FrameEncoder::new(EncodingOptions::default(), 44100, 16, 2).unwrap();
        let frame = encoder.encode_frame(&[&left, &right]).unwrap();

        // sync code up front, CRC-16 folding the frame to zero behind
        assert_eq!(frame[0], 0xFF);
        assert_eq!(frame[1] & 0xFE, 0xF8);
        assert_eq!(crate::crc::crc16(frame), 0);
        assert_eq!(encoder.frames_encoded(), 1);
    }

    #[test]
    fn frame_numbers_advance() {
        let samples = sine(512, 17.0, 2000.0);
        let mut encoder =
            FrameEncoder::new(EncodingOptions::default(), 44100, 16, 1).unwrap();

        let first = encoder.encode_frame(&[&samples]).unwrap().to_vec();
        let second = encoder.encode_frame(&[&samples]).unwrap().to_vec();

        // identical samples, but the frame number differs
        assert_ne!(first, second);
        assert_eq!(encoder.frames_encoded(), 2);
    }

    #[test]
    fn decorrelation_helps_correlated_stereo() {
        let left = sine(2048, 29.0, 12000.0);
        // nearly identical channels make the side channel tiny
        let right = left.iter().map(|s| s + 1).collect::<Vec<i32>>();

        let correlated = FrameEncoder::new(EncodingOptions::default(), 44100, 16, 2)
            .unwrap()
            .encode_frame(&[&left, &right])
            .unwrap()
            .len();

        let independent = FrameEncoder::new(
            EncodingOptions::default().stereo_decorrelation(false),
            44100,
            16,
            2,
        )
        .unwrap()
        .encode_frame(&[&left, &right])
        .unwrap()
        .len();

        assert!(correlated < independent);
    }
}
