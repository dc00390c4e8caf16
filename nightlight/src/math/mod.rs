//! Numeric primitives: elementwise buffer operations, robust order
//! statistics, and compensated summation.
//!
//! Everything operates on `f32` buffers. NaN is the "no data" sentinel
//! throughout the pipeline; the order statistics here assume NaN has already
//! been filtered out by the caller.

pub mod statistics;

use crate::common::parallel;
use rayon::prelude::*;

/// MAD (Median Absolute Deviation) to standard deviation conversion factor.
///
/// For a normal distribution, σ ≈ 1.4826 × MAD, from 1 / Φ⁻¹(3/4).
pub const MAD_TO_SIGMA: f32 = 1.4826022;

// ============================================================================
// Elementwise buffer operations
// ============================================================================

/// `dst[i] -= src[i]`, elementwise.
pub fn subtract(dst: &mut [f32], src: &[f32]) {
    assert_eq!(dst.len(), src.len(), "buffer length mismatch");
    parallel::par_chunks_mut_auto(dst).for_each(|(offset, chunk)| {
        for (i, d) in chunk.iter_mut().enumerate() {
            *d -= src[offset + i];
        }
    });
}

/// `dst[i] = dst[i] * baseline / src[i]`, elementwise.
///
/// `baseline` is typically the flat frame's mean, keeping the output near 1×
/// the input. Zero divisors leave the destination pixel unchanged.
pub fn divide_safe(dst: &mut [f32], src: &[f32], baseline: f32) {
    assert_eq!(dst.len(), src.len(), "buffer length mismatch");
    parallel::par_chunks_mut_auto(dst).for_each(|(offset, chunk)| {
        for (i, d) in chunk.iter_mut().enumerate() {
            let s = src[offset + i];
            if s != 0.0 {
                *d = *d * baseline / s;
            }
        }
    });
}

/// `dst[i] += value`, elementwise.
pub fn scalar_add(dst: &mut [f32], value: f32) {
    parallel::par_chunks_mut_auto(dst).for_each(|(_, chunk)| {
        for d in chunk.iter_mut() {
            *d += value;
        }
    });
}

/// Clamp every element into `[lo, hi]`. NaN passes through unchanged.
pub fn clamp(dst: &mut [f32], lo: f32, hi: f32) {
    debug_assert!(lo <= hi);
    parallel::par_chunks_mut_auto(dst).for_each(|(_, chunk)| {
        for d in chunk.iter_mut() {
            if *d < lo {
                *d = lo;
            } else if *d > hi {
                *d = hi;
            }
        }
    });
}

// ============================================================================
// Compensated summation
// ============================================================================

/// Kahan-compensated sum. Non-finite handling is the caller's business.
pub fn kahan_sum(values: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    let mut c = 0.0f32;
    for &v in values {
        let y = v - c;
        let t = sum + y;
        c = (t - sum) - y;
        sum = t;
    }
    sum
}

/// Arithmetic mean with compensated summation.
pub fn mean_f32(values: &[f32]) -> f32 {
    debug_assert!(!values.is_empty());
    kahan_sum(values) / values.len() as f32
}

/// Weighted mean with compensated summation.
pub fn weighted_mean_f32(values: &[f32], weights: &[f32]) -> f32 {
    debug_assert!(!values.is_empty());
    debug_assert_eq!(values.len(), weights.len());

    let mut sum = 0.0f32;
    let mut c = 0.0f32;
    let mut weight_sum = 0.0f32;
    for (&v, &w) in values.iter().zip(weights.iter()) {
        let y = v * w - c;
        let t = sum + y;
        c = (t - sum) - y;
        sum = t;
        weight_sum += w;
    }
    sum / weight_sum
}

/// Parallel Kahan sum over a large buffer, skipping NaN entries.
/// Returns (sum, count of finite samples).
pub fn nan_aware_sum(values: &[f32]) -> (f64, usize) {
    parallel::par_chunks_auto(values)
        .map(|(_, chunk)| {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for &v in chunk {
                if !v.is_nan() {
                    sum += v as f64;
                    count += 1;
                }
            }
            (sum, count)
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
}

// ============================================================================
// Order statistics
// ============================================================================

/// Median of f32 values in-place (partial sort via quickselect).
pub fn median_f32_mut(data: &mut [f32]) -> f32 {
    debug_assert!(!data.is_empty());

    let len = data.len();
    let mid = len / 2;

    if len & 1 == 1 {
        let (_, median, _) = data.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).unwrap());
        *median
    } else {
        let (left_part, right_median, _) =
            data.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).unwrap());
        let right = *right_median;
        let left = left_part.iter().copied().reduce(f32::max).unwrap();
        (left + right) * 0.5
    }
}

/// MAD = median(|x_i - median|), using a scratch buffer.
pub fn mad_f32_with_scratch(values: &[f32], median: f32, scratch: &mut Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    scratch.clear();
    scratch.extend(values.iter().map(|&v| (v - median).abs()));
    median_f32_mut(scratch)
}

/// Quantile of f32 values in-place, `q` in [0, 1], nearest-rank.
pub fn quantile_f32_mut(data: &mut [f32], q: f32) -> f32 {
    debug_assert!(!data.is_empty());
    debug_assert!((0.0..=1.0).contains(&q));

    let k = ((data.len() - 1) as f32 * q).round() as usize;
    let (_, value, _) = data.select_nth_unstable_by(k, |a, b| a.partial_cmp(b).unwrap());
    *value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtract() {
        let mut a = vec![5.0, 7.0, 9.0];
        subtract(&mut a, &[1.0, 2.0, 3.0]);
        assert_eq!(a, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_divide_safe_baseline() {
        let mut a = vec![100.0, 200.0];
        divide_safe(&mut a, &[0.5, 1.0], 1.0);
        assert_eq!(a, vec![200.0, 200.0]);
    }

    #[test]
    fn test_divide_safe_zero_divisor_keeps_pixel() {
        let mut a = vec![100.0, 200.0];
        divide_safe(&mut a, &[0.0, 2.0], 1.0);
        assert_eq!(a[0], 100.0);
        assert_eq!(a[1], 100.0);
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn test_subtract_length_mismatch() {
        let mut a = vec![1.0, 2.0];
        subtract(&mut a, &[1.0]);
    }

    #[test]
    fn test_scalar_add_and_clamp() {
        let mut a = vec![-0.5, 0.2, 1.4];
        scalar_add(&mut a, 0.1);
        clamp(&mut a, 0.0, 1.0);
        assert_eq!(a, vec![0.0, 0.3, 1.0]);
    }

    #[test]
    fn test_clamp_keeps_nan() {
        let mut a = vec![f32::NAN, 0.5];
        clamp(&mut a, 0.0, 1.0);
        assert!(a[0].is_nan());
        assert_eq!(a[1], 0.5);
    }

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median_f32_mut(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median_f32_mut(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median_f32_mut(&mut [7.0]), 7.0);
    }

    #[test]
    fn test_mad() {
        let values = [1.0, 2.0, 3.0, 4.0, 100.0];
        let mut scratch = Vec::new();
        let median = 3.0;
        // deviations: 2, 1, 0, 1, 97 -> median 1
        assert_eq!(mad_f32_with_scratch(&values, median, &mut scratch), 1.0);
    }

    #[test]
    fn test_kahan_sum_catastrophic_cancellation() {
        // 1.0 followed by many tiny values that a naive f32 sum drops
        let mut values = vec![1.0f32];
        values.extend(std::iter::repeat_n(1e-8f32, 100_000));
        let sum = kahan_sum(&values);
        assert!((sum - (1.0 + 1e-3)).abs() < 1e-5, "got {sum}");
    }

    #[test]
    fn test_weighted_mean_equal_weights_matches_mean() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let weights = [2.5; 4];
        let wm = weighted_mean_f32(&values, &weights);
        let m = mean_f32(&values);
        assert!((wm - m).abs() < 1e-6);
    }

    #[test]
    fn test_nan_aware_sum() {
        let values = [1.0, f32::NAN, 2.0, f32::NAN, 3.0];
        let (sum, count) = nan_aware_sum(&values);
        assert_eq!(count, 3);
        assert!((sum - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantile() {
        let mut data: Vec<f32> = (1..=100).map(|v| v as f32).collect();
        let q25 = quantile_f32_mut(&mut data, 0.25);
        assert!((q25 - 26.0).abs() <= 1.0);
    }
}
