// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Partitioned-Rice entropy coding of prediction residuals
//!
//! A block's residual is split into `2^order` equal partitions, each
//! Rice-coded with its own parameter so the coding can adapt to local
//! signal statistics.  The first partition is `predictor_order`
//! samples short, since those positions hold warmup samples instead.
//! A partition whose residuals are too large for Rice coding to pay
//! off escapes to raw fixed-width storage instead.
//!
//! The two stored method variants differ only in field widths
//! (4-bit parameters escaping at 15, or 5-bit parameters escaping
//! at 31) and share all of the machinery here.

use crate::Error;
use crate::packer::BitPacker;

/// The maximum residual partition order (a 4-bit field)
pub const MAX_PARTITION_ORDER: u32 = 15;

/// The maximum partition order allowed by the streamable subset
pub const MAX_SUBSET_PARTITION_ORDER: u32 = 8;

/// One partition's coding choice
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Partition {
    /// Rice-coded with the given parameter
    Rice {
        /// The Rice parameter
        parameter: u32,
    },
    /// Stored as raw two's complement values
    Escape {
        /// Width of every raw value, in bits
        bits: u32,
    },
}

/// A partition layout, shared by both method variants
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionedRice {
    /// The partition order; the residual is split into `2^order` parts
    pub order: u32,
    /// One coding choice per partition
    pub partitions: Vec<Partition>,
}

/// A subframe's residual coding method
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EntropyMethod {
    /// 4-bit Rice parameters, escaping at 15
    PartitionedRice(PartitionedRice),
    /// 5-bit Rice parameters, escaping at 31
    PartitionedRice2(PartitionedRice),
}

impl EntropyMethod {
    /// The method's 2-bit code in the subframe header
    pub fn code(&self) -> u32 {
        match self {
            Self::PartitionedRice(_) => 0b00,
            Self::PartitionedRice2(_) => 0b01,
        }
    }

    /// Width of each partition's parameter field
    pub fn parameter_bits(&self) -> u32 {
        match self {
            Self::PartitionedRice(_) => 4,
            Self::PartitionedRice2(_) => 5,
        }
    }

    /// The all-ones parameter reserved to mean "stored raw"
    pub fn escape_code(&self) -> u32 {
        match self {
            Self::PartitionedRice(_) => 0b1111,
            Self::PartitionedRice2(_) => 0b11111,
        }
    }

    /// The largest usable Rice parameter, just below the escape code
    pub fn max_parameter(&self) -> u32 {
        self.escape_code() - 1
    }

    /// The partition layout
    pub fn layout(&self) -> &PartitionedRice {
        match self {
            Self::PartitionedRice(layout) | Self::PartitionedRice2(layout) => layout,
        }
    }
}

/// Zig-zag folds a signed residual to unsigned
///
/// Small negative and positive values both map to small codes:
/// 0, -1, 1, -2, 2, … become 0, 1, 2, 3, 4, …
#[inline]
pub fn fold(value: i32) -> u32 {
    ((value as u32) << 1) ^ ((value >> 31) as u32)
}

/// The exact cost in bits of Rice-coding `values` with one parameter
///
/// This cost is convex in the parameter, which is what makes a
/// simple minimum search over parameters valid.
pub fn rice_bits(values: &[i32], parameter: u32) -> u64 {
    values
        .iter()
        .map(|v| u64::from(fold(*v) >> parameter) + 1 + u64::from(parameter))
        .sum()
}

// estimated cost of one partition from its folded magnitude sum
fn parameter_cost(count: u64, sum: u64, parameter: u32) -> u64 {
    count * (u64::from(parameter) + 1) + (sum >> parameter)
}

// the parameter minimizing the estimated cost, and that cost
fn best_parameter(count: u64, sum: u64, max_parameter: u32) -> (u32, u64) {
    let mut best = (0, parameter_cost(count, sum, 0));
    for parameter in 1..=max_parameter {
        let cost = parameter_cost(count, sum, parameter);
        if cost < best.1 {
            best = (parameter, cost);
        }
    }
    best
}

/// Chooses the best partition order and per-partition parameters
///
/// Partition sums are gathered once at the finest usable order and
/// merged pairwise downward, so every candidate order is priced from
/// the same pass over the residual.  Partitions whose raw fixed-width
/// cost undercuts Rice coding escape instead.
///
/// The 5-bit parameter variant is used for samples wider than 16
/// bits, whose residuals can need parameters the 4-bit fields cannot
/// express; everything else uses the cheaper 4-bit variant.
///
/// Returns the method and its total cost in bits, including the
/// method and partition-order fields.
pub fn plan(
    residual: &[i32],
    predictor_order: usize,
    block_size: usize,
    max_partition_order: u32,
    bits_per_sample: u32,
) -> (EntropyMethod, u64) {
    debug_assert_eq!(residual.len(), block_size - predictor_order);

    let wide = bits_per_sample > 16;
    let (parameter_bits, max_parameter): (u32, u32) = if wide { (5, 30) } else { (4, 14) };

    // the finest order that divides the block and leaves the first
    // partition room for its warmup samples
    let mut max_order = max_partition_order
        .min(MAX_PARTITION_ORDER)
        .min(block_size.trailing_zeros());
    while max_order > 0 && (block_size >> max_order) <= predictor_order {
        max_order -= 1;
    }

    // folded magnitude sums and maxima at the finest order
    let mut sums = vec![0u64; 1 << max_order];
    let mut maxes = vec![0u32; 1 << max_order];
    {
        let mut index = 0;
        for (i, partition) in sums.iter_mut().zip(maxes.iter_mut()).enumerate() {
            let (sum, max) = partition;
            let count = (block_size >> max_order) - if i == 0 { predictor_order } else { 0 };
            for value in &residual[index..index + count] {
                let folded = fold(*value);
                *sum += u64::from(folded);
                *max = (*max).max(folded);
            }
            index += count;
        }
    }

    let mut best_partitions = Vec::new();
    let mut best_order = 0;
    let mut best_bits = u64::MAX;

    for order in (0..=max_order).rev() {
        let mut total = u64::from(2 + 4u32);
        let mut partitions = Vec::with_capacity(1 << order);

        for i in 0..1usize << order {
            let count = ((block_size >> order) - if i == 0 { predictor_order } else { 0 }) as u64;
            let (parameter, rice_cost) = best_parameter(count, sums[i], max_parameter);

            // raw storage must fit the 5-bit width field
            let raw_bits = 32 - maxes[i].leading_zeros();
            let escape_cost = match raw_bits {
                0..=31 => 5 + count * u64::from(raw_bits),
                _ => u64::MAX,
            };

            if escape_cost < rice_cost {
                total += u64::from(parameter_bits) + escape_cost;
                partitions.push(Partition::Escape { bits: raw_bits });
            } else {
                total += u64::from(parameter_bits) + rice_cost;
                partitions.push(Partition::Rice { parameter });
            }
        }

        // ties go to the coarser order
        if total <= best_bits {
            best_partitions = partitions;
            best_order = order;
            best_bits = total;
        }

        // merge partition statistics pairwise for the next order down
        if order > 0 {
            for i in 0..1usize << (order - 1) {
                sums[i] = sums[2 * i] + sums[2 * i + 1];
                maxes[i] = maxes[2 * i].max(maxes[2 * i + 1]);
            }
        }
    }

    // the sums-based costs overshoot the unary runs slightly, so
    // re-price the winning layout exactly before reporting its size
    let mut exact_bits = u64::from(2 + 4u32);
    {
        let mut index = 0;
        for (i, partition) in best_partitions.iter().enumerate() {
            let count = (block_size >> best_order) - if i == 0 { predictor_order } else { 0 };
            let values = &residual[index..index + count];
            index += count;

            exact_bits += u64::from(parameter_bits)
                + match partition {
                    Partition::Rice { parameter } => rice_bits(values, *parameter),
                    Partition::Escape { bits } => 5 + count as u64 * u64::from(*bits),
                };
        }
    }

    let layout = PartitionedRice {
        order: best_order,
        partitions: best_partitions,
    };
    (
        if wide {
            EntropyMethod::PartitionedRice2(layout)
        } else {
            EntropyMethod::PartitionedRice(layout)
        },
        exact_bits,
    )
}

/// Writes a planned residual through the packer
///
/// Emits the 2-bit method code, the 4-bit partition order, and each
/// partition's parameter (or escape and raw width) followed by its
/// coded residuals.
///
/// # Errors
///
/// Returns an error if the packer runs out of room, aborting
/// the frame.
pub fn write(
    packer: &mut BitPacker,
    residual: &[i32],
    predictor_order: usize,
    block_size: usize,
    method: &EntropyMethod,
) -> Result<(), Error> {
    packer.write_unsigned(method.code(), 2)?;

    let layout = method.layout();
    let parameter_bits = method.parameter_bits();
    packer.write_unsigned(layout.order, 4)?;

    let mut index = 0;
    for (i, partition) in layout.partitions.iter().enumerate() {
        let count = (block_size >> layout.order) - if i == 0 { predictor_order } else { 0 };
        let values = &residual[index..index + count];
        index += count;

        match partition {
            Partition::Rice { parameter } => {
                packer.write_unsigned(*parameter, parameter_bits)?;
                packer.write_rice_signed_block(values, *parameter)?;
            }
            Partition::Escape { bits } => {
                packer.write_unsigned(method.escape_code(), parameter_bits)?;
                packer.write_unsigned(*bits, 5)?;
                if *bits > 0 {
                    for value in values {
                        packer.write_signed(*value, *bits)?;
                    }
                }
            }
        }
    }
    Ok(())
}
