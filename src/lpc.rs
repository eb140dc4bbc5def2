// Copyright 2024-2025 cadenza developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Algorithms for quantized linear-predictive coding (QLPC).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::Deserialize;
use serde::Serialize;

use super::component::QuantizedParameters;
use super::constant::qlpc::MAX_ORDER as MAX_LPC_ORDER;
use super::constant::qlpc::MAX_SHIFT as QLPC_MAX_SHIFT;
use super::constant::qlpc::MIN_SHIFT as QLPC_MIN_SHIFT;

/// Analysis window descriptor.
///
/// This enum is `Serializable` and `Deserializable` because it is
/// directly used in config structs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Window {
    Rectangle,
    Tukey { alpha: f32 },
}

impl Eq for Window {}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        format!("{self:?}").cmp(&format!("{other:?}"))
    }
}

impl Window {
    #[inline]
    pub fn weights(&self, len: usize) -> Vec<f32> {
        match *self {
            Self::Rectangle => vec![1.0f32; len],
            Self::Tukey { alpha } => {
                let max_t = len as f32 - 1.0;
                let alpha_len = alpha * max_t;
                let mut ret = Vec::with_capacity(len);
                for t in 0..len {
                    let t = t as f32;
                    let w = if t < alpha_len / 2.0 {
                        0.5 * (1.0 - (2.0 * std::f32::consts::PI * t / alpha_len).cos())
                    } else if t < max_t - alpha_len / 2.0 {
                        1.0
                    } else {
                        0.5 * (1.0 - (2.0 * std::f32::consts::PI * (max_t - t) / alpha_len).cos())
                    };
                    ret.push(w);
                }
                ret
            }
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::Tukey { alpha: 0.1 }
    }
}

type WindowMap = BTreeMap<(usize, Window), Rc<[f32]>>;
thread_local! {
    static WINDOW_CACHE: RefCell<WindowMap> = RefCell::new(BTreeMap::new());
}

fn get_window(window: &Window, size: usize) -> Rc<[f32]> {
    let key = (size, window.clone());
    WINDOW_CACHE.with(|caches| {
        if caches.borrow().get(&key).is_none() {
            caches
                .borrow_mut()
                .insert(key.clone(), Rc::from(window.weights(size)));
        }
        Rc::clone(
            caches
                .borrow()
                .get(&key)
                .expect("INTERNAL ERROR: window cache was not properly populated"),
        )
    })
}

/// Finds the shift parameter for quantizing the given coefficients.
///
/// Returns `None` when the coefficients are so large that the shift
/// would have to go below [`QLPC_MIN_SHIFT`]; such a predictor cannot be
/// quantized at this precision.
fn find_shift(coefs: &[f32], precision: usize) -> Option<i8> {
    assert!(precision <= 15);
    assert!(!coefs.is_empty());
    let max_abs_coef: f32 = coefs.iter().map(|x| x.abs()).reduce(f32::max).unwrap();
    // location of the MSB in the binary representation of the largest
    // absolute value.
    let abs_log2: i16 = max_abs_coef.log2().ceil().max(f32::from(i16::MIN + 16)) as i16;
    let shift: i16 = (precision as i16 - 1) - abs_log2;
    if shift < i16::from(QLPC_MIN_SHIFT) {
        return None;
    }
    Some(shift.min(i16::from(QLPC_MAX_SHIFT)) as i8)
}

/// Quantizes an LPC parameter with the given shift.
#[inline]
fn quantize_parameter(p: f32, shift: i8) -> i16 {
    let scalefac = 2.0f32.powi(i32::from(shift));
    (p * scalefac)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Quantizes the given coefficients into [`QuantizedParameters`].
///
/// Returns `None` when the coefficients cannot be represented at the
/// given precision with a non-negative shift.
///
/// # Panics
///
/// Panics if `precision` exceeds the supported maximum, or `coefs` is
/// empty or longer than the maximum LPC order.
pub(crate) fn quantize_parameters(coefs: &[f32], precision: usize) -> Option<QuantizedParameters> {
    assert!(!coefs.is_empty());
    assert!(coefs.len() <= MAX_LPC_ORDER);
    let shift = find_shift(coefs, precision)?;
    let mut q_coefs = [0i16; MAX_LPC_ORDER];

    for (n, coef) in coefs.iter().enumerate() {
        // The clamp is actually required because the shift-width
        // estimation in `find_shift` is not perfect: quantization may
        // yield `2^(p-1)` for precision `p`, one above the largest
        // `p`-bit signed integer.
        q_coefs[n] = quantize_parameter(*coef, shift).clamp(
            -(1i16 << (precision - 1)),
            (1i16 << (precision - 1)) - 1,
        );
    }

    let tail_zeros = q_coefs[..coefs.len()]
        .iter()
        .rev()
        .take_while(|&&x| x == 0)
        .count();
    let order = std::cmp::max(1, coefs.len() - tail_zeros);

    Some(QuantizedParameters::from_parts(
        &q_coefs[..order],
        order,
        shift,
        precision,
    ))
}

/// Computes the error signal from [`QuantizedParameters`].
///
/// The first `order` entries of `errors` are zeroed; a 64-bit
/// accumulator keeps the prediction exact for any supported sample
/// width.
///
/// # Panics
///
/// Panics if `errors.len()` is smaller than `signal.len()`.
pub(crate) fn compute_error(qp: &QuantizedParameters, signal: &[i32], errors: &mut [i32]) {
    assert!(errors.len() >= signal.len());
    let order = qp.order();
    let shift = qp.shift() as u32;
    for p in errors.iter_mut().take(order.min(signal.len())) {
        *p = 0;
    }
    for t in order..signal.len() {
        let mut pred = 0i64;
        for (tau, coef) in qp.coefs().iter().enumerate() {
            pred += i64::from(*coef) * i64::from(signal[t - 1 - tau]);
        }
        errors[t] = signal[t] - ((pred >> shift) as i32);
    }
}

/// Computes auto-correlation coefficients.
///
/// `dest[tau]` receives the lagged product sum over `t` in
/// `(order - 1)..len`, so every lag is summed over the same number of
/// terms.
///
/// # Panics
///
/// Panics if `dest` is shorter than `order` or `signal` is shorter than
/// `order - 1`.
fn auto_correlation(order: usize, signal: &[f32], dest: &mut [f64]) {
    assert!(dest.len() >= order);
    for p in &mut dest[..order] {
        *p = 0.0;
    }
    for t in (order - 1)..signal.len() {
        for tau in 0..order {
            dest[tau] += f64::from(signal[t]) * f64::from(signal[t - tau]);
        }
    }
}

/// Per-order LPC coefficients and prediction errors for one signal.
///
/// Row `order - 1` of `coefs` holds the `order` coefficients of the
/// order-`order` predictor; `errors[order - 1]` is the corresponding
/// prediction error energy from the Levinson-Durbin recursion.
pub(crate) struct LpcAnalysis {
    coefs: Vec<f32>,
    errors: Vec<f64>,
    max_order: usize,
}

impl LpcAnalysis {
    /// Returns the coefficients of the order-`order` predictor.
    pub fn coefs(&self, order: usize) -> &[f32] {
        debug_assert!(order >= 1 && order <= self.max_order);
        let row = (order - 1) * self.max_order;
        &self.coefs[row..row + order]
    }

    /// Returns the prediction error energy at `order`.
    pub fn error(&self, order: usize) -> f64 {
        debug_assert!(order >= 1 && order <= self.max_order);
        self.errors[order - 1]
    }

    /// Estimates the expected Rice-coded size in bits per residual
    /// sample from the prediction error energy.
    fn expected_bits_per_residual_sample(lpc_error: f64, samples: usize) -> f64 {
        if lpc_error > 0.0 && samples > 0 {
            let error_scale = 0.5 / samples as f64;
            (0.5 * (error_scale * lpc_error).log2()).max(0.0)
        } else {
            0.0
        }
    }

    /// Picks the order that minimizes the estimated total subframe size.
    ///
    /// `overhead_bits_per_order` is the cost of raising the order by one
    /// (one warm-up sample plus one stored coefficient).
    pub fn estimate_best_order(
        &self,
        block_size: usize,
        overhead_bits_per_order: usize,
    ) -> usize {
        let mut best_order = 1;
        let mut best_bits = f64::MAX;
        for order in 1..=self.max_order {
            let residual_samples = block_size.saturating_sub(order);
            let bps = Self::expected_bits_per_residual_sample(self.error(order), residual_samples);
            let bits = bps * residual_samples as f64 + (order * overhead_bits_per_order) as f64;
            if bits < best_bits {
                best_bits = bits;
                best_order = order;
            }
        }
        best_order
    }
}

/// Working buffer for (unquantized) LPC estimation.
struct LpcEstimator {
    /// Buffer for storing the windowed signal.
    windowed_signal: Vec<f32>,
    /// Buffer for storing auto-correlation coefficients.
    corr_coefs: Vec<f64>,
}

impl LpcEstimator {
    pub fn new() -> Self {
        Self {
            windowed_signal: vec![],
            corr_coefs: vec![],
        }
    }

    fn fill_windowed_signal(&mut self, signal: &[i32], window: &[f32]) {
        debug_assert!(window.len() >= signal.len());
        self.windowed_signal.clear();
        self.windowed_signal
            .extend(signal.iter().zip(window).map(|(&x, &w)| x as f32 * w));
    }

    /// Runs windowing, auto-correlation, and the Levinson-Durbin
    /// recursion over orders `1..=max_order`.
    pub fn analyze(&mut self, signal: &[i32], window: &Window, max_order: usize) -> LpcAnalysis {
        assert!(max_order >= 1 && max_order <= MAX_LPC_ORDER);
        assert!(signal.len() > max_order);
        self.fill_windowed_signal(signal, &get_window(window, signal.len()));
        self.corr_coefs.resize(max_order + 1, 0.0);
        auto_correlation(max_order + 1, &self.windowed_signal, &mut self.corr_coefs);

        let mut analysis = LpcAnalysis {
            coefs: vec![0.0f32; max_order * max_order],
            errors: vec![0.0f64; max_order],
            max_order,
        };

        let autoc = &self.corr_coefs;
        if !(autoc[0] > 0.0) {
            // digital silence; every predictor is trivially exact.
            return analysis;
        }

        let mut lpc = [0.0f64; MAX_LPC_ORDER];
        let mut err = autoc[0];
        for i in 0..max_order {
            if !(err > 0.0) {
                // perfectly predictable already; carry the last row over.
                let prev = (i - 1) * max_order;
                for j in 0..i {
                    analysis.coefs[i * max_order + j] = analysis.coefs[prev + j];
                }
                analysis.errors[i] = 0.0;
                continue;
            }
            let mut r = -autoc[i + 1];
            for j in 0..i {
                r -= lpc[j] * autoc[i - j];
            }
            r /= err;

            lpc[i] = r;
            for j in 0..(i >> 1) {
                let tmp = lpc[j];
                lpc[j] += r * lpc[i - 1 - j];
                lpc[i - 1 - j] += r * tmp;
            }
            if i & 1 == 1 {
                lpc[i >> 1] += lpc[i >> 1] * r;
            }

            err *= 1.0 - r * r;
            analysis.errors[i] = err.max(0.0);
            for j in 0..=i {
                analysis.coefs[i * max_order + j] = (-lpc[j]) as f32;
            }
        }
        analysis
    }
}

thread_local! {
    /// Global (thread-local) working buffer for LPC estimation.
    static LPC_ESTIMATOR: RefCell<LpcEstimator> = RefCell::new(LpcEstimator::new());
}

/// Estimates LPC coefficients for all orders up to `max_order`.
#[allow(clippy::module_name_repetitions)]
pub(crate) fn analyze(signal: &[i32], window: &Window, max_order: usize) -> LpcAnalysis {
    LPC_ESTIMATOR.with(|estimator| estimator.borrow_mut().analyze(signal, window, max_order))
}

#[cfg(test)]
#[allow(clippy::needless_range_loop)]
mod tests {
    use super::*;
    use crate::assert_close;
    use crate::test_helper;

    use rstest::rstest;
    use std::f32::consts::PI;

    #[test]
    fn auto_correlation_computation() {
        let mut signal = [0f32; 128];
        for t in 0..signal.len() {
            signal[t] = (t as f32 / 32.0 * 2.0 * PI).sin() * 1024.0;
        }
        let mut corr = [0f64; 64];
        auto_correlation(32, &signal, &mut corr);

        let mut max_corr: f64 = 0.0;
        let mut min_corr: f64 = 0.0;
        let mut argmax_corr: usize = 0;
        let mut argmin_corr: usize = 0;
        for t in 0..32 {
            if corr[t] > max_corr {
                argmax_corr = t;
                max_corr = corr[t];
            }
            if corr[t] < min_corr {
                argmin_corr = t;
                min_corr = corr[t];
            }
        }
        assert_eq!(argmax_corr, 0);
        assert_eq!(argmin_corr, 16);
    }

    #[test]
    fn shift_finder() {
        // max abs is [0.01] in binary. shifting 9 bits left yields
        // [10000000], hitting the MSB of an 8-bit representation.
        assert_eq!(find_shift(&[0.25, 0.125, 0.000001, 0.0], 8), Some(9));
        // a coefficient of 256 would need a negative shift at 8 bits.
        assert_eq!(find_shift(&[256.0], 8), None);
    }

    #[test]
    fn parameter_quantizer() {
        let qp = quantize_parameters(&[0.0, 0.5, 0.1], 4).expect("should be quantizable");
        assert_eq!(qp.coefs(), &[0i16, 7i16, 2i16]);

        let qp = quantize_parameters(&[1.0, -0.5, 0.5], 2).expect("should be quantizable");
        assert_eq!(qp.coefs(), &[1, -1, 1]);
        assert_eq!(qp.dequantized(), vec![0.5, -0.5, 0.5]);
    }

    #[test]
    fn qlpc_auto_truncation() {
        let coefs = [1.0, 0.5, 0.0, 0.0];
        let qp = quantize_parameters(&coefs, 8).expect("should be quantizable");
        assert_eq!(qp.order(), 2);
    }

    #[rstest]
    fn qlpc_recovery(#[values(2, 12, 24, 32)] lpc_order: usize) {
        let coef_prec: usize = 12;
        let signal = test_helper::sinusoid_plus_noise(1024, 32, 10000.0, 128);

        let analysis = analyze(&signal, &Window::Tukey { alpha: 0.1 }, lpc_order);
        let qlpc =
            quantize_parameters(analysis.coefs(lpc_order), coef_prec).expect("quantization failed");

        // QLPC coefs can be shorter than the specified order because
        // trailing zeros are truncated.
        assert!(qlpc.order() <= lpc_order);
        let mut errors = vec![0i32; signal.len()];
        compute_error(&qlpc, &signal, &mut errors);

        let mut signal_energy = 0.0f64;
        let mut error_energy = 0.0f64;
        for t in lpc_order..signal.len() {
            signal_energy += signal[t] as f64 * signal[t] as f64;
            error_energy += errors[t] as f64 * errors[t] as f64;
        }
        // expect some prediction efficiency.
        assert!(error_energy < signal_energy);

        // the residual must recombine with the prediction exactly.
        for t in qlpc.order()..signal.len() {
            let mut pred: i64 = 0;
            for (tau, ref_qcoef) in qlpc.coefs().iter().enumerate() {
                pred += i64::from(signal[t - tau - 1]) * i64::from(*ref_qcoef);
            }
            pred >>= qlpc.shift();
            assert_eq!(errors[t] + (pred as i32), signal[t], "failed at t={t}");
        }
    }

    #[test]
    fn lpc_with_pure_dc() {
        let signal = [12345, 12345, 12345, 12345, 12345, 12345, 12345];
        let analysis = analyze(&signal, &Window::Rectangle, 1);
        assert_close!(analysis.coefs(1)[0], 1.0f32);

        let qlpc = quantize_parameters(analysis.coefs(1), 15).expect("quantization failed");
        let mut errors = vec![0i32; signal.len()];
        compute_error(&qlpc, &signal, &mut errors);
        for t in 0..errors.len() {
            assert!(errors[t] < 2);
        }
    }

    #[test]
    fn lpc_with_known_coefs() {
        // generated with a [1, -1, 0.5] predictor.
        let lpc_order: usize = 3;
        let signal = vec![
            0, -512, 0, 512, 256, -256, -256, 128, 256, 0, -192, -64, 128, 96, -64, -96, 16, 80,
            16, -56, -32, 32, 36, -12,
        ];

        let analysis = analyze(&signal, &Window::Tukey { alpha: 0.25 }, lpc_order);
        let coefs = analysis.coefs(lpc_order);
        // The actual auto-correlation function is not Toeplitz due to
        // boundaries, so only the signs are stable.
        assert!(coefs[0] > 0.0);
        assert!(coefs[1] < 0.0);
        assert!(coefs[2] > 0.0);
    }

    #[test]
    fn per_order_errors_decrease() {
        let signal = test_helper::sinusoid_plus_noise(2048, 100, 8000.0, 32);
        let analysis = analyze(&signal, &Window::default(), 16);
        for order in 2..=16 {
            assert!(
                analysis.error(order) <= analysis.error(order - 1) * 1.0001,
                "error increased at order {order}"
            );
        }
    }

    #[test]
    fn order_estimator_prefers_predictable_signal() {
        // a sinusoid is nearly perfectly predicted at order 2; the
        // estimator must not pick the maximum order.
        let signal = test_helper::sinusoid_plus_noise(4096, 64, 12000.0, 0);
        let analysis = analyze(&signal, &Window::default(), 16);
        let best = analysis.estimate_best_order(signal.len(), 16 + 12);
        assert!(best < 16);
        assert!(best >= 2);
    }

    #[test]
    fn tukey_window() {
        // reference computed with scipy as `scipy.signal.windows.tukey(32, 0.3)`.
        let reference = [
            0., 0.1098376, 0.39109322, 0.720197, 0.95255725, 1., 1., 1., 1., 1., 1., 1., 1., 1.,
            1., 1., 1., 1., 1., 1., 1., 1., 1., 1., 1., 1., 1., 0.95255725, 0.720197, 0.39109322,
            0.1098376, 0.,
        ];
        let win = Window::Tukey { alpha: 0.3 };
        let win_vec = get_window(&win, reference.len());
        for (t, &expected_w) in reference.iter().enumerate() {
            assert_close!(win_vec[t], expected_w);
        }
    }
}
