// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Linear-predictive analysis of sample blocks
//!
//! The analysis pipeline windows a block of samples, computes its
//! autocorrelation, derives candidate predictor coefficients for every
//! order at once with the Levinson-Durbin recursion, estimates which
//! order will compress best, and quantizes that order's coefficients
//! to the fixed-point form the subframe stores.  The quantized
//! predictor then turns samples into residuals and, on the decode
//! side, residuals back into the original samples bit-for-bit.

use crate::Error;
use arrayvec::ArrayVec;

/// The maximum LPC predictor order (a 5-bit field)
pub const MAX_LPC_ORDER: usize = 32;

/// The minimum quantized coefficient precision, in bits
pub const MIN_QLP_PRECISION: u32 = 5;

/// The maximum quantized coefficient precision, in bits
///
/// The subframe stores `precision - 1` in a 4-bit field
/// whose all-ones pattern is invalid.
pub const MAX_QLP_PRECISION: u32 = 15;

/// The maximum quantization shift (a 5-bit signed field)
pub const MAX_QLP_SHIFT: i32 = 15;

const MIN_QLP_SHIFT: i32 = -16;

/// An analysis window applied to a block before autocorrelation
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Window {
    /// No shaping at all
    Rectangle,
    /// A raised cosine over the whole block
    Hann,
    /// Flat in the middle with cosine tapers
    /// over `alpha / 2` of the block at each end
    Tukey {
        /// Taper proportion, from 0 (rectangular) to 1 (Hann)
        alpha: f64,
    },
}

impl Default for Window {
    fn default() -> Self {
        Self::Tukey { alpha: 0.5 }
    }
}

impl Window {
    /// Generates this window's coefficients for a block of `len` samples
    pub fn coefficients(self, len: usize) -> Vec<f64> {
        use std::f64::consts::PI;

        match self {
            Self::Rectangle => vec![1.0; len],
            Self::Hann => (0..len)
                .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / (len - 1) as f64).cos())
                .collect(),
            Self::Tukey { alpha } if alpha <= 0.0 => Self::Rectangle.coefficients(len),
            Self::Tukey { alpha } if alpha >= 1.0 => Self::Hann.coefficients(len),
            Self::Tukey { alpha } => {
                let taper = (alpha / 2.0 * len as f64) as usize;
                let mut window = vec![1.0; len];
                if taper > 1 {
                    let taper = taper - 1;
                    for n in 0..=taper {
                        let rise = 0.5 - 0.5 * (PI * n as f64 / taper as f64).cos();
                        window[n] = rise;
                        window[len - 1 - n] = rise;
                    }
                }
                window
            }
        }
    }
}

/// Multiplies a sample block elementwise by window coefficients
pub fn apply_window(samples: &[i32], window: &[f64]) -> Vec<f64> {
    samples
        .iter()
        .zip(window)
        .map(|(sample, w)| f64::from(*sample) * w)
        .collect()
}

/// Computes the autocorrelation of a windowed block for lags `0..=max_lag`
///
/// The inner loop runs over lags so that each sample is loaded once,
/// which is just the cache-friendly arrangement of the usual
/// `Σ x[i]·x[i+lag]` sums.
pub fn autocorrelation(windowed: &[f64], max_lag: usize) -> Vec<f64> {
    debug_assert!(max_lag < windowed.len());

    let mut autoc = vec![0.0; max_lag + 1];
    for (i, sample) in windowed.iter().enumerate() {
        for lag in 0..=max_lag.min(i) {
            autoc[lag] += sample * windowed[i - lag];
        }
    }
    autoc
}

/// Candidate predictor coefficients for every order from one analysis pass
///
/// Produced by [`lp_coefficients`]; order `i`'s coefficients and
/// prediction error depend only on order `i - 1`'s, so a single
/// recursion yields them all.
pub struct LpCoefficients {
    // index i holds order i + 1's coefficient set
    coefficients: Vec<Vec<f64>>,
    // index i holds order i + 1's prediction error
    errors: Vec<f64>,
}

/// Runs the Levinson-Durbin recursion over an autocorrelation
///
/// Produces candidate coefficients for every order up to
/// `autoc.len() - 1`.  If the prediction error hits exactly zero the
/// recursion stops early and the order reached is the maximum usable
/// order; that only happens for degenerate input such as silence or a
/// perfectly periodic block.  An all-zero block (`autoc[0] == 0`)
/// yields no usable orders at all and the caller should fall back to
/// a constant or verbatim subframe.
pub fn lp_coefficients(autoc: &[f64]) -> LpCoefficients {
    let max_order = (autoc.len() - 1).min(MAX_LPC_ORDER);
    let mut coefficients = Vec::with_capacity(max_order);
    let mut errors = Vec::with_capacity(max_order);

    if autoc[0] <= 0.0 {
        return LpCoefficients {
            coefficients,
            errors,
        };
    }

    let mut lpc = [0.0f64; MAX_LPC_ORDER];
    let mut err = autoc[0];

    for i in 0..max_order {
        // this order's reflection coefficient
        let mut r = -autoc[i + 1];
        for j in 0..i {
            r -= lpc[j] * autoc[i - j];
        }
        r /= err;

        // symmetric butterfly update of the running filter
        lpc[i] = r;
        for j in 0..i / 2 {
            let tmp = lpc[j];
            lpc[j] += r * lpc[i - 1 - j];
            lpc[i - 1 - j] += r * tmp;
        }
        if i % 2 == 1 {
            lpc[i / 2] += lpc[i / 2] * r;
        }

        err *= 1.0 - r * r;

        // negated to turn the FIR filter form into predictor form
        coefficients.push(lpc[..=i].iter().map(|c| -c).collect());
        errors.push(err);

        if err == 0.0 {
            break;
        }
    }

    LpCoefficients {
        coefficients,
        errors,
    }
}

impl LpCoefficients {
    /// The maximum usable predictor order, possibly 0
    pub fn max_order(&self) -> usize {
        self.errors.len()
    }

    /// The given order's coefficient set
    pub fn coefficients(&self, order: usize) -> &[f64] {
        &self.coefficients[order - 1]
    }

    /// The given order's prediction error
    pub fn error(&self, order: usize) -> f64 {
        self.errors[order - 1]
    }

    /// Estimates the order expected to yield the smallest subframe
    ///
    /// Each candidate order's cost is the expected bits per residual
    /// sample, `0.5·log₂(error_scale·error)`, times the samples left
    /// after its warmup, plus `overhead_bits_per_order` (one warmup
    /// sample and one stored coefficient) per order.  Ties go to the
    /// lowest order.
    pub fn best_order(&self, total_samples: usize, overhead_bits_per_order: u32) -> usize {
        let error_scale = 0.5 / total_samples as f64;

        let mut best_order = 0;
        let mut best_bits = f64::INFINITY;
        for (index, error) in self.errors.iter().enumerate() {
            let order = index + 1;
            let bits = expected_bits_per_residual_sample(*error, error_scale)
                * (total_samples - order) as f64
                + (order as f64) * f64::from(overhead_bits_per_order);
            if bits < best_bits {
                best_order = order;
                best_bits = bits;
            }
        }
        best_order
    }
}

fn expected_bits_per_residual_sample(error: f64, error_scale: f64) -> f64 {
    if error > 0.0 {
        (0.5 * (error_scale * error).log2()).max(0.0)
    } else if error < 0.0 {
        // scaled error can go slightly negative through loss of
        // precision; price it out of consideration rather than
        // treating it as a usable order
        1e32
    } else {
        0.0
    }
}

/// A predictor quantized to the fixed-point form subframes store
#[derive(Debug, Clone)]
pub struct QuantizedParameters {
    coefficients: ArrayVec<i32, MAX_LPC_ORDER>,
    precision: u32,
    shift: i32,
}

impl QuantizedParameters {
    /// Assembles a predictor from already-quantized fields
    ///
    /// This is the decode-side entry point, where the order,
    /// precision, shift and coefficients arrive from a subframe
    /// rather than from analysis.  Decoders accept the full 1-15
    /// bit precision range even though analysis never quantizes
    /// below [`MIN_QLP_PRECISION`].
    ///
    /// # Errors
    ///
    /// Returns an error if the order, precision or shift is outside
    /// the format's representable range, or if a coefficient does
    /// not fit the precision.
    pub fn new(coefficients: &[i32], precision: u32, shift: i32) -> Result<Self, Error> {
        if coefficients.is_empty() || coefficients.len() > MAX_LPC_ORDER {
            return Err(Error::InvalidLpcOrder);
        }
        if !(1..=MAX_QLP_PRECISION).contains(&precision) {
            return Err(Error::InvalidPrecision);
        }
        if !(0..=MAX_QLP_SHIFT).contains(&shift) {
            return Err(Error::InfeasibleShift);
        }

        let limit = 1i64 << (precision - 1);
        if coefficients
            .iter()
            .any(|c| i64::from(*c) >= limit || i64::from(*c) < -limit)
        {
            return Err(Error::InvalidPrecision);
        }

        Ok(Self {
            coefficients: coefficients.iter().copied().collect(),
            precision,
            shift,
        })
    }

    /// Quantizes one order's floating-point coefficients
    ///
    /// One bit of `precision` goes to the sign; the shift is sized so
    /// the largest coefficient magnitude fills the remaining bits.
    /// Rounding error is fed forward from each coefficient into the
    /// next so it cannot accumulate across the set.
    ///
    /// A computed shift below zero cannot be represented by decoders,
    /// so the coefficients are rescaled by `2^|shift|` during
    /// quantization and the stored shift forced to 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the coefficients are all zero (the caller
    /// should have chosen a constant subframe), if the required shift
    /// falls below the representable range, or if `precision` or the
    /// order is outside the format's limits.  All of these are
    /// recoverable by falling back to another subframe type.
    pub fn quantize(coefficients: &[f64], precision: u32) -> Result<Self, Error> {
        if coefficients.is_empty() || coefficients.len() > MAX_LPC_ORDER {
            return Err(Error::InvalidLpcOrder);
        }
        if !(MIN_QLP_PRECISION..=MAX_QLP_PRECISION).contains(&precision) {
            return Err(Error::InvalidPrecision);
        }

        // one bit for the sign
        let magnitude_bits = precision - 1;
        let qmax = (1i64 << magnitude_bits) - 1;
        let qmin = -(1i64 << magnitude_bits);

        let cmax = coefficients.iter().fold(0.0f64, |max, c| max.max(c.abs()));
        if cmax <= 0.0 {
            return Err(Error::DegenerateCoefficients);
        }

        let mut shift = magnitude_bits as i32 - cmax.log2().floor() as i32 - 1;
        if shift > MAX_QLP_SHIFT {
            shift = MAX_QLP_SHIFT;
        } else if shift < MIN_QLP_SHIFT {
            return Err(Error::InfeasibleShift);
        }

        let scale = if shift >= 0 {
            (1i64 << shift) as f64
        } else {
            1.0 / (1i64 << -shift) as f64
        };

        let mut quantized = ArrayVec::new();
        let mut error = 0.0;
        for c in coefficients {
            error += c * scale;
            let q = (error.round() as i64).clamp(qmin, qmax);
            error -= q as f64;
            quantized.push(q as i32);
        }

        Ok(Self {
            coefficients: quantized,
            precision,
            shift: shift.max(0),
        })
    }

    /// The predictor order
    pub fn order(&self) -> usize {
        self.coefficients.len()
    }

    /// Coefficient precision in bits, including the sign
    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// The right-shift applied after prediction
    pub fn shift(&self) -> i32 {
        self.shift
    }

    /// The quantized coefficients
    pub fn coefficients(&self) -> &[i32] {
        &self.coefficients
    }

    /// Whether prediction sums could overflow 32-bit accumulators
    ///
    /// `order` products of a `bits_per_sample`-bit sample and a
    /// `precision`-bit coefficient need up to
    /// `bits_per_sample + precision + log₂(order)` bits; past 32, the
    /// wide variants must be used.
    pub fn requires_wide(&self, bits_per_sample: u32) -> bool {
        bits_per_sample + self.precision + (self.order() as u32).ilog2() > 32
    }

    /// Computes the prediction residual with 32-bit accumulators
    ///
    /// `residual[i] = samples[order + i] - (Σ c[j]·samples[order + i - 1 - j]) >> shift`
    ///
    /// Only usable when [`requires_wide`](Self::requires_wide) is
    /// false for the samples' bit depth.
    pub fn compute_residual(&self, samples: &[i32], residual: &mut Vec<i32>) {
        let order = self.order();
        residual.clear();
        for i in order..samples.len() {
            let mut sum = 0i32;
            for (j, c) in self.coefficients.iter().enumerate() {
                sum = sum.wrapping_add(c.wrapping_mul(samples[i - 1 - j]));
            }
            residual.push(samples[i].wrapping_sub(sum >> self.shift));
        }
    }

    /// Computes the prediction residual with 64-bit accumulators
    pub fn compute_residual_wide(&self, samples: &[i32], residual: &mut Vec<i32>) {
        let order = self.order();
        residual.clear();
        for i in order..samples.len() {
            let mut sum = 0i64;
            for (j, c) in self.coefficients.iter().enumerate() {
                sum += i64::from(*c) * i64::from(samples[i - 1 - j]);
            }
            residual.push((i64::from(samples[i]) - (sum >> self.shift)) as i32);
        }
    }

    /// Computes the prediction residual, failing on 32-bit overflow
    ///
    /// The on-disk residual field is 32 bits, so a residual that
    /// cannot fit must abort this predictor rather than silently
    /// wrap; the caller falls back to another subframe type.
    ///
    /// # Errors
    ///
    /// Returns an error if any residual falls outside `i32`'s range,
    /// leaving `residual`'s contents unspecified.
    pub fn compute_residual_checked(
        &self,
        samples: &[i32],
        residual: &mut Vec<i32>,
    ) -> Result<(), Error> {
        let order = self.order();
        residual.clear();
        for i in order..samples.len() {
            let mut sum = 0i64;
            for (j, c) in self.coefficients.iter().enumerate() {
                sum += i64::from(*c) * i64::from(samples[i - 1 - j]);
            }
            residual.push(
                i32::try_from(i64::from(samples[i]) - (sum >> self.shift))
                    .map_err(|_| Error::ResidualOverflow)?,
            );
        }
        Ok(())
    }

    /// Rebuilds samples from the residual with 32-bit accumulators
    ///
    /// `samples` must arrive with the `order` warmup samples in place
    /// and room for the rest; this is the exact integer inverse of
    /// [`compute_residual`](Self::compute_residual), including the
    /// truncating right shift on negative sums.
    pub fn restore_signal(&self, residual: &[i32], samples: &mut [i32]) {
        let order = self.order();
        debug_assert_eq!(samples.len(), order + residual.len());
        for (i, r) in residual.iter().enumerate() {
            let mut sum = 0i32;
            for (j, c) in self.coefficients.iter().enumerate() {
                sum = sum.wrapping_add(c.wrapping_mul(samples[order + i - 1 - j]));
            }
            samples[order + i] = r.wrapping_add(sum >> self.shift);
        }
    }

    /// Rebuilds samples from the residual with 64-bit accumulators
    pub fn restore_signal_wide(&self, residual: &[i32], samples: &mut [i32]) {
        let order = self.order();
        debug_assert_eq!(samples.len(), order + residual.len());
        for (i, r) in residual.iter().enumerate() {
            let mut sum = 0i64;
            for (j, c) in self.coefficients.iter().enumerate() {
                sum += i64::from(*c) * i64::from(samples[order + i - 1 - j]);
            }
            samples[order + i] = (i64::from(*r) + (sum >> self.shift)) as i32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows() {
        let rectangle = Window::Rectangle.coefficients(16);
        assert!(rectangle.iter().all(|w| *w == 1.0));

        let hann = Window::Hann.coefficients(16);
        assert!(hann[0].abs() < 1e-9);
        assert!(hann[15].abs() < 1e-9);
        assert!((hann[8] - 0.98907).abs() < 1e-4);

        // degenerate tapers collapse to the simpler windows
        assert_eq!(
            Window::Tukey { alpha: 0.0 }.coefficients(16),
            Window::Rectangle.coefficients(16)
        );
        assert_eq!(
            Window::Tukey { alpha: 1.0 }.coefficients(16),
            Window::Hann.coefficients(16)
        );

        // the default window is flat in the middle and symmetric
        let tukey = Window::default().coefficients(64);
        assert_eq!(tukey[20], 1.0);
        assert_eq!(tukey[32], 1.0);
        for n in 0..64 {
            assert!((tukey[n] - tukey[63 - n]).abs() < 1e-12);
        }
        assert!(tukey[0] < tukey[4]);
    }

    #[test]
    fn autocorrelation_sums() {
        let windowed = apply_window(&[1, 2, 3, 2, 1], &[1.0; 5]);
        let autoc = autocorrelation(&windowed, 2);
        assert_eq!(autoc[0], 19.0); // 1 + 4 + 9 + 4 + 1
        assert_eq!(autoc[1], 16.0); // 2 + 6 + 6 + 2
        assert_eq!(autoc[2], 10.0); // 3 + 4 + 3
    }

    #[test]
    fn levinson_durbin_first_order() {
        let candidates = lp_coefficients(&[1.0, 0.5, 0.25]);
        assert_eq!(candidates.max_order(), 2);

        // a first-order AR process with lag-1 correlation 0.5
        assert!((candidates.coefficients(1)[0] - 0.5).abs() < 1e-12);
        assert!((candidates.error(1) - 0.75).abs() < 1e-12);
        assert!(candidates.error(2) <= candidates.error(1));
    }

    #[test]
    fn levinson_durbin_terminates_on_zero_error() {
        // lag-1 correlation of 1.0 predicts perfectly at order 1,
        // making every higher order unusable
        let candidates = lp_coefficients(&[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(candidates.max_order(), 1);
        assert_eq!(candidates.error(1), 0.0);
    }

    #[test]
    fn silence_yields_no_orders() {
        let candidates = lp_coefficients(&[0.0, 0.0, 0.0]);
        assert_eq!(candidates.max_order(), 0);
    }

    #[test]
    fn quantization() {
        let q = QuantizedParameters::quantize(&[0.5, -0.25], 12).unwrap();
        assert_eq!(q.order(), 2);
        assert_eq!(q.precision(), 12);
        assert_eq!(q.shift(), 11);
        assert_eq!(q.coefficients(), &[1024, -512]);
    }

    #[test]
    fn quantization_feeds_error_forward() {
        // each scaled coefficient lands exactly on .5, so rounding
        // them independently would bias the total upward by 4
        let coefficients = [0.71875; 8];
        let q = QuantizedParameters::quantize(&coefficients, 5).unwrap();

        let scale = (1i64 << q.shift()) as f64;
        let total: i64 = q.coefficients().iter().map(|c| i64::from(*c)).sum();
        let ideal: f64 = coefficients.iter().map(|c| c * scale).sum();
        assert!((total as f64 - ideal).abs() < 1.0);
    }

    #[test]
    fn quantization_rescales_negative_shifts() {
        // cmax of 2^12 wants a negative shift at 12-bit precision
        let q = QuantizedParameters::quantize(&[4096.0, -2048.0], 12).unwrap();
        assert_eq!(q.shift(), 0);
        assert_eq!(q.coefficients(), &[1024, -512]);
    }

    #[test]
    fn quantization_rejects_degenerate_input() {
        assert!(matches!(
            QuantizedParameters::quantize(&[0.0, 0.0], 12),
            Err(Error::DegenerateCoefficients)
        ));
        assert!(matches!(
            QuantizedParameters::quantize(&[], 12),
            Err(Error::InvalidLpcOrder)
        ));
        assert!(matches!(
            QuantizedParameters::quantize(&[0.5], 16),
            Err(Error::InvalidPrecision)
        ));
    }

    #[test]
    fn residual_round_trip() {
        let samples = (0..256)
            .map(|i| (1000.0 * (i as f64 / 7.0).sin()) as i32 + i)
            .collect::<Vec<i32>>();

        let windowed = apply_window(&samples, &Window::default().coefficients(samples.len()));
        let candidates = lp_coefficients(&autocorrelation(&windowed, 8));
        let order = candidates.best_order(samples.len(), 16 + 12);
        assert!(order > 0);

        let q = QuantizedParameters::quantize(candidates.coefficients(order), 12).unwrap();
        assert!(!q.requires_wide(16));

        let mut residual = Vec::new();
        q.compute_residual(&samples, &mut residual);
        assert_eq!(residual.len(), samples.len() - q.order());

        // narrow and wide paths agree when both are in range
        let mut wide = Vec::new();
        q.compute_residual_wide(&samples, &mut wide);
        assert_eq!(residual, wide);
        let mut checked = Vec::new();
        q.compute_residual_checked(&samples, &mut checked).unwrap();
        assert_eq!(residual, checked);

        let mut restored = samples.clone();
        restored[q.order()..].fill(0);
        q.restore_signal(&residual, &mut restored);
        assert_eq!(restored, samples);

        restored[q.order()..].fill(0);
        q.restore_signal_wide(&residual, &mut restored);
        assert_eq!(restored, samples);
    }

    #[test]
    fn first_order_difference_by_hand() {
        // a unit coefficient with no shift is plain differencing
        let q = QuantizedParameters::new(&[1], 5, 0).unwrap();

        let samples = [10, 12, 11, 13, 12, 14];
        let mut residual = Vec::new();
        q.compute_residual(&samples, &mut residual);
        assert_eq!(residual, [2, -1, 2, -1, 2]);

        let mut restored = [10, 0, 0, 0, 0, 0];
        q.restore_signal(&residual, &mut restored);
        assert_eq!(restored, samples);
    }

    #[test]
    fn rejects_out_of_range_wire_fields() {
        assert!(matches!(
            QuantizedParameters::new(&[16], 5, 0),
            Err(Error::InvalidPrecision)
        ));
        assert!(matches!(
            QuantizedParameters::new(&[-17, 3], 5, 0),
            Err(Error::InvalidPrecision)
        ));
        assert!(matches!(
            QuantizedParameters::new(&[1], 5, -1),
            Err(Error::InfeasibleShift)
        ));
        assert!(matches!(
            QuantizedParameters::new(&[1], 5, 16),
            Err(Error::InfeasibleShift)
        ));
        assert!(QuantizedParameters::new(&[-16, 15], 5, 15).is_ok());
    }

    #[test]
    fn checked_residual_overflows() {
        let q = QuantizedParameters::quantize(&[16383.0], 15).unwrap();
        assert_eq!(q.coefficients(), &[16383]);
        assert_eq!(q.shift(), 0);
        assert!(q.requires_wide(32));

        let samples = [i32::MIN, i32::MAX];
        let mut residual = Vec::new();
        assert!(matches!(
            q.compute_residual_checked(&samples, &mut residual),
            Err(Error::ResidualOverflow)
        ));
    }
}
