// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-channel subframe assembly
//!
//! A subframe stores one channel of one frame as either a constant, a
//! verbatim dump, a fixed-order predictor, or an LPC predictor with
//! its entropy-coded residual.  [`plan_subframe`] tries the candidate
//! types, prices each in exact bits, and keeps the cheapest;
//! [`write_subframe`] lays the winner out on the wire.
//!
//! Low-order zero bits shared by every sample in the channel
//! ("wasted bits") are stripped before prediction and their count
//! recorded in the subframe header.

use crate::Error;
use crate::lpc::{self, QuantizedParameters};
use crate::packer::BitPacker;
use crate::rice::{self, EntropyMethod};

/// The maximum fixed predictor order
pub const MAX_FIXED_ORDER: usize = 4;

// fixed predictors are binomial differences of the previous samples
const FIXED_COEFFICIENTS: [&[i32]; MAX_FIXED_ORDER + 1] =
    [&[], &[1], &[2, -1], &[3, -3, 1], &[4, -6, 4, -1]];

/// Counts low-order zero bits common to every sample in a channel
///
/// Capped below the sample width so at least one bit per
/// sample remains.
pub fn wasted_bits(samples: &[i32], bits_per_sample: u32) -> u32 {
    match samples
        .iter()
        .fold(0u32, |acc, sample| acc | *sample as u32)
        .trailing_zeros()
    {
        32 => 0,
        wasted => wasted.min(bits_per_sample - 1),
    }
}

/// Computes a fixed predictor's residual, failing on 32-bit overflow
///
/// # Errors
///
/// Returns an error if any residual falls outside `i32`'s range,
/// in which case the caller should try another subframe type.
pub fn fixed_residual(samples: &[i32], order: usize, residual: &mut Vec<i32>) -> Result<(), Error> {
    debug_assert!(order <= MAX_FIXED_ORDER);

    let coefficients = FIXED_COEFFICIENTS[order];
    residual.clear();
    for i in order..samples.len() {
        let mut prediction = 0i64;
        for (j, c) in coefficients.iter().enumerate() {
            prediction += i64::from(*c) * i64::from(samples[i - 1 - j]);
        }
        residual.push(
            i32::try_from(i64::from(samples[i]) - prediction)
                .map_err(|_| Error::ResidualOverflow)?,
        );
    }
    Ok(())
}

/// Rebuilds a channel from a fixed predictor's residual
///
/// `samples` must arrive with the `order` warmup samples in place.
pub fn restore_fixed(residual: &[i32], order: usize, samples: &mut [i32]) {
    debug_assert!(order <= MAX_FIXED_ORDER);
    debug_assert_eq!(samples.len(), order + residual.len());

    let coefficients = FIXED_COEFFICIENTS[order];
    for (i, r) in residual.iter().enumerate() {
        let mut prediction = 0i64;
        for (j, c) in coefficients.iter().enumerate() {
            prediction += i64::from(*c) * i64::from(samples[order + i - 1 - j]);
        }
        samples[order + i] = (prediction + i64::from(*r)) as i32;
    }
}

/// Picks the fixed predictor order with the smallest total residual
///
/// Each order's residual is the previous order's first difference,
/// so all five candidates come out of one in-place differencing pass.
pub fn best_fixed_order(samples: &[i32]) -> usize {
    if samples.len() <= MAX_FIXED_ORDER {
        return 0;
    }

    let mut diff = samples
        .iter()
        .map(|s| i64::from(*s))
        .collect::<Vec<i64>>();

    let mut best_order = 0;
    let mut best_total = diff.iter().map(|d| d.unsigned_abs()).sum::<u64>();

    for order in 1..=MAX_FIXED_ORDER {
        for i in (order..diff.len()).rev() {
            diff[i] -= diff[i - 1];
        }
        let total = diff[order..].iter().map(|d| d.unsigned_abs()).sum::<u64>();
        if total < best_total {
            best_order = order;
            best_total = total;
        }
    }
    best_order
}

// libFLAC's rule of thumb for coefficient precision when the
// caller does not pin one
fn default_precision(block_size: usize, bits_per_sample: u32) -> u32 {
    if bits_per_sample < 16 {
        match block_size {
            ..=192 => 7,
            ..=384 => 8,
            ..=576 => 9,
            ..=1152 => 10,
            ..=2304 => 11,
            ..=4608 => 12,
            _ => 13,
        }
    } else {
        match block_size {
            ..=384 => lpc::MAX_QLP_PRECISION - 2,
            ..=1152 => lpc::MAX_QLP_PRECISION - 1,
            _ => lpc::MAX_QLP_PRECISION,
        }
    }
}

enum SubframeKind {
    Constant {
        value: i32,
    },
    Verbatim,
    Fixed {
        order: usize,
        residual: Vec<i32>,
        method: EntropyMethod,
    },
    Lpc {
        parameters: QuantizedParameters,
        residual: Vec<i32>,
        method: EntropyMethod,
    },
}

/// A fully priced subframe, ready to be written
///
/// Holds the chosen type, the wasted-bit-stripped samples, and the
/// exact size the subframe will occupy on the wire.
pub struct SubframePlan {
    kind: SubframeKind,
    wasted: u32,
    sample_bits: u32,
    shifted: Vec<i32>,
    bits: u64,
}

impl SubframePlan {
    /// The exact size of the written subframe, in bits
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// The wasted bits stripped from every sample
    pub fn wasted_bits(&self) -> u32 {
        self.wasted
    }
}

// subframe header: one zero pad bit, six type bits, then the
// wasted-bits flag and optional unary count
fn header_bits(wasted: u32) -> u64 {
    8 + u64::from(wasted)
}

/// Chooses the cheapest subframe type for one channel
///
/// A channel of identical samples becomes a constant subframe.
/// Otherwise the best fixed predictor and (when `max_lpc_order`
/// allows) the best LPC predictor are priced against the verbatim
/// bound and the cheapest wins.  Predictors that fail to quantize or
/// whose residuals overflow simply drop out of the running, which is
/// how degenerate analysis falls back to simpler subframe types.
pub fn plan_subframe(
    samples: &[i32],
    bits_per_sample: u32,
    window: &[f64],
    max_lpc_order: usize,
    qlp_precision: u32,
    max_partition_order: u32,
) -> SubframePlan {
    debug_assert!(!samples.is_empty());
    debug_assert_eq!(window.len(), samples.len());

    if let [first, rest @ ..] = samples {
        if rest.iter().all(|s| s == first) {
            return SubframePlan {
                kind: SubframeKind::Constant { value: *first },
                wasted: 0,
                sample_bits: bits_per_sample,
                shifted: Vec::new(),
                bits: header_bits(0) + u64::from(bits_per_sample),
            };
        }
    }

    let wasted = wasted_bits(samples, bits_per_sample);
    let sample_bits = bits_per_sample - wasted;
    let shifted = match wasted {
        0 => samples.to_vec(),
        wasted => samples.iter().map(|s| s >> wasted).collect(),
    };
    let block_size = shifted.len();

    // the bound any predictor has to beat
    let verbatim_bits = header_bits(wasted) + block_size as u64 * u64::from(sample_bits);
    let mut plan = SubframePlan {
        kind: SubframeKind::Verbatim,
        wasted,
        sample_bits,
        shifted,
        bits: verbatim_bits,
    };

    if block_size > MAX_FIXED_ORDER {
        let order = best_fixed_order(&plan.shifted);
        let mut residual = Vec::new();
        if fixed_residual(&plan.shifted, order, &mut residual).is_ok() {
            let (method, residual_bits) = rice::plan(
                &residual,
                order,
                block_size,
                max_partition_order,
                sample_bits,
            );
            let bits = header_bits(wasted)
                + order as u64 * u64::from(sample_bits)
                + residual_bits;
            if bits < plan.bits {
                plan.kind = SubframeKind::Fixed {
                    order,
                    residual,
                    method,
                };
                plan.bits = bits;
            }
        }
    }

    let max_lpc_order = max_lpc_order.min(block_size.saturating_sub(1));
    if max_lpc_order > 0 {
        let windowed = lpc::apply_window(&plan.shifted, window);
        let candidates = lpc::lp_coefficients(&lpc::autocorrelation(&windowed, max_lpc_order));

        if candidates.max_order() > 0 {
            let precision = match qlp_precision {
                0 => default_precision(block_size, bits_per_sample),
                precision => precision,
            };
            let order =
                candidates.best_order(block_size, sample_bits + precision);

            if let Ok(parameters) =
                QuantizedParameters::quantize(candidates.coefficients(order), precision)
            {
                let mut residual = Vec::new();
                let computed = if parameters.requires_wide(sample_bits) {
                    parameters.compute_residual_checked(&plan.shifted, &mut residual)
                } else {
                    parameters.compute_residual(&plan.shifted, &mut residual);
                    Ok(())
                };

                if computed.is_ok() {
                    let (method, residual_bits) = rice::plan(
                        &residual,
                        order,
                        block_size,
                        max_partition_order,
                        sample_bits,
                    );
                    let bits = header_bits(wasted)
                        + order as u64 * u64::from(sample_bits)
                        + 4
                        + 5
                        + order as u64 * u64::from(parameters.precision())
                        + residual_bits;
                    if bits < plan.bits {
                        plan.kind = SubframeKind::Lpc {
                            parameters,
                            residual,
                            method,
                        };
                        plan.bits = bits;
                    }
                }
            }
        }
    }

    plan
}

fn write_header(packer: &mut BitPacker, type_code: u32, wasted: u32) -> Result<(), Error> {
    packer.write_unsigned(0, 1)?;
    packer.write_unsigned(type_code, 6)?;
    match wasted {
        0 => packer.write_unsigned(0, 1),
        wasted => {
            packer.write_unsigned(1, 1)?;
            packer.write_unary(wasted - 1)
        }
    }
}

/// Writes a planned subframe through the packer
///
/// # Errors
///
/// Returns an error if the packer runs out of room, aborting
/// the frame.
pub fn write_subframe(packer: &mut BitPacker, plan: &SubframePlan) -> Result<(), Error> {
    let before = packer.bit_count();

    match &plan.kind {
        SubframeKind::Constant { value } => {
            write_header(packer, 0b000000, 0)?;
            packer.write_signed(*value, plan.sample_bits)?;
        }
        SubframeKind::Verbatim => {
            write_header(packer, 0b000001, plan.wasted)?;
            for sample in &plan.shifted {
                packer.write_signed(*sample, plan.sample_bits)?;
            }
        }
        SubframeKind::Fixed {
            order,
            residual,
            method,
        } => {
            write_header(packer, 0b001000 | *order as u32, plan.wasted)?;
            for warmup in &plan.shifted[..*order] {
                packer.write_signed(*warmup, plan.sample_bits)?;
            }
            rice::write(packer, residual, *order, plan.shifted.len(), method)?;
        }
        SubframeKind::Lpc {
            parameters,
            residual,
            method,
        } => {
            let order = parameters.order();
            write_header(packer, 0b100000 | (order as u32 - 1), plan.wasted)?;
            for warmup in &plan.shifted[..order] {
                packer.write_signed(*warmup, plan.sample_bits)?;
            }
            packer.write_unsigned(parameters.precision() - 1, 4)?;
            packer.write_signed(parameters.shift(), 5)?;
            for c in parameters.coefficients() {
                packer.write_signed(*c, parameters.precision())?;
            }
            rice::write(packer, residual, order, plan.shifted.len(), method)?;
        }
    }

    debug_assert_eq!(packer.bit_count() - before, plan.bits);
    Ok(())
}
