//! The frame encoding core of the FLAC lossless audio codec
//!
//! This crate turns blocks of PCM integer samples into bit-exact FLAC
//! frames and can reconstruct the original samples from them.
//! It contains the pieces that do the actual compression work:
//!
//! | Module | Purpose |
//! |-------:|---------|
//! | [`packer`] | bit-level output assembly with running CRC support |
//! | [`lpc`] | linear-predictive analysis, quantization and residuals |
//! | [`rice`] | partitioned-Rice entropy coding of residuals |
//! | [`subframe`] | per-channel subframe assembly |
//! | [`stream`] | frame header encoding |
//! | [`encode`] | whole-frame encoding |
//! | [`decode`] | frame reading, for verifying round trips |
//!
//! Metadata blocks, Ogg encapsulation, MD5 accumulation and file I/O
//! are deliberately not handled here; callers are expected to wrap the
//! packed frames in whatever transport they need.
//!
//! # Example
//!
//! ```
//! use flac_encode::decode::{StreamDefaults, read_frame};
//! use flac_encode::encode::{EncodingOptions, FrameEncoder};
//!
//! let samples = (0..192).map(|i| (i % 64) - 32).collect::<Vec<i32>>();
//!
//! let mut encoder =
//!     FrameEncoder::new(EncodingOptions::default(), 44100, 16, 1).unwrap();
//!
//! let frame = encoder.encode_frame(&[&samples]).unwrap().to_vec();
//!
//! let decoded = read_frame(
//!     &frame,
//!     &StreamDefaults {
//!         sample_rate: 44100,
//!         bits_per_sample: 16,
//!     },
//! )
//! .unwrap();
//!
//! assert_eq!(decoded.channels, vec![samples]);
//! ```

pub mod crc;
pub mod decode;
pub mod encode;
pub mod lpc;
pub mod packer;
pub mod rice;
pub mod stream;
pub mod subframe;

pub use encode::{EncodingOptions, FrameEncoder};
pub use packer::BitPacker;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    BufferFull,
    InvalidWidth,
    NotByteAligned,
    InvalidFrameNumber,
    InvalidBlockSize,
    InvalidSampleRate,
    InvalidBitsPerSample,
    ExcessiveChannels,
    ChannelsMismatch,
    InvalidLpcOrder,
    InvalidPrecision,
    DegenerateCoefficients,
    InfeasibleShift,
    ResidualOverflow,
    InvalidPartitionOrder,
    InvalidSyncCode,
    InvalidChannels,
    InvalidSubframeHeader,
    ExcessiveWastedBits,
    InvalidCodingMethod,
    Crc8Mismatch,
    Crc16Mismatch,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::BufferFull => "output buffer beyond maximum frame size".fmt(f),
            Self::InvalidWidth => "value too large for indicated bit width".fmt(f),
            Self::NotByteAligned => "output buffer not byte-aligned".fmt(f),
            Self::InvalidFrameNumber => "invalid frame number".fmt(f),
            Self::InvalidBlockSize => "invalid block size".fmt(f),
            Self::InvalidSampleRate => "invalid sample rate".fmt(f),
            Self::InvalidBitsPerSample => "invalid bits-per-sample".fmt(f),
            Self::ExcessiveChannels => "excessive number of channels".fmt(f),
            Self::ChannelsMismatch => "channels do not match stream parameters".fmt(f),
            Self::InvalidLpcOrder => "invalid LPC order".fmt(f),
            Self::InvalidPrecision => "invalid coefficient precision".fmt(f),
            Self::DegenerateCoefficients => "degenerate all-zero LPC coefficients".fmt(f),
            Self::InfeasibleShift => "quantization shift not representable".fmt(f),
            Self::ResidualOverflow => "residual too large for 32-bit field".fmt(f),
            Self::InvalidPartitionOrder => "invalid residual partition order".fmt(f),
            Self::InvalidSyncCode => "invalid frame sync code".fmt(f),
            Self::InvalidChannels => "invalid channel assignment".fmt(f),
            Self::InvalidSubframeHeader => "invalid subframe header".fmt(f),
            Self::ExcessiveWastedBits => "excessive wasted bits in subframe".fmt(f),
            Self::InvalidCodingMethod => "reserved residual coding method".fmt(f),
            Self::Crc8Mismatch => "frame header CRC-8 mismatch".fmt(f),
            Self::Crc16Mismatch => "frame CRC-16 mismatch".fmt(f),
        }
    }
}
