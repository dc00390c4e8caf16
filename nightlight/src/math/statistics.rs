//! Frame statistics: basic moments, robust location/scale estimators, and
//! the noise estimate.
//!
//! Large frames make exact robust statistics expensive, so the robust
//! estimators run on a strided sample of at most [`MAX_STAT_SAMPLES`]
//! finite pixels. Sampling is deterministic: strides for pixel selection,
//! a fixed-seed ChaCha stream for Qn pair selection.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::math::{self, MAD_TO_SIGMA};

/// Cap on the number of pixels fed to the robust estimators.
pub const MAX_STAT_SAMPLES: usize = 400_000;

/// Qn to standard deviation conversion factor for a normal distribution.
const QN_TO_SIGMA: f32 = 2.21914;

/// MAD→σ factor for the 5-point Laplacian residual: the residual of iid
/// noise has variance 1.25σ², so σ = MAD · 1.4826 / √1.25.
const LAPLACIAN_MAD_TO_SIGMA: f32 = MAD_TO_SIGMA / 1.118_034;

/// Maximum random pairs drawn for the sampled Qn estimator.
const MAX_QN_PAIRS: usize = 200_000;

/// Location and scale estimator selection, in CLI flag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LsEstimator {
    /// Mean and standard deviation. Fast, not robust.
    MeanStdDev,
    /// Median and MAD scaled by 1.4826.
    MedianMad,
    /// Iterative K-sigma location/scale on sampled windows.
    Ikss,
    /// Iterative sigma-clipped sampled median with sampled Qn scale.
    #[default]
    SampledMedianQn,
}

impl LsEstimator {
    pub fn from_flag(value: i64) -> Self {
        match value {
            0 => LsEstimator::MeanStdDev,
            1 => LsEstimator::MedianMad,
            2 => LsEstimator::Ikss,
            _ => LsEstimator::SampledMedianQn,
        }
    }
}

/// Statistics of a pixel buffer. NaN pixels are excluded everywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub stddev: f32,
    /// Sum of all finite pixels, accumulated in f64.
    pub sum: f64,
    /// Robust location per the active estimator.
    pub location: f32,
    /// Robust scale per the active estimator.
    pub scale: f32,
    /// Gaussian noise estimate from the Laplacian residual.
    pub noise: f32,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "min {:.4} max {:.4} mean {:.4} stddev {:.4} location {:.4} scale {:.4} noise {:.4}",
            self.min, self.max, self.mean, self.stddev, self.location, self.scale, self.noise
        )
    }
}

// ============================================================================
// Basic statistics
// ============================================================================

/// Min/max/mean/stddev in one pass (Welford), ignoring NaN pixels.
pub fn basic_stats(pixels: &[f32]) -> Stats {
    assert!(!pixels.is_empty(), "cannot compute stats of empty buffer");

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;
    let mut count = 0u64;

    for &v in pixels {
        if v.is_nan() {
            continue;
        }
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
        count += 1;
        let delta = v as f64 - mean;
        mean += delta / count as f64;
        m2 += delta * (v as f64 - mean);
    }

    if count == 0 {
        return Stats {
            min: f32::NAN,
            max: f32::NAN,
            mean: f32::NAN,
            ..Default::default()
        };
    }

    let variance = if count > 1 { m2 / (count - 1) as f64 } else { 0.0 };
    Stats {
        min,
        max,
        mean: mean as f32,
        stddev: variance.sqrt() as f32,
        sum: mean * count as f64,
        ..Default::default()
    }
}

// ============================================================================
// Extended statistics
// ============================================================================

/// Basic stats plus robust location/scale (per `estimator`) and the noise
/// estimate.
pub fn extended_stats(pixels: &[f32], width: usize, estimator: LsEstimator) -> Stats {
    let mut stats = basic_stats(pixels);
    let (location, scale) = location_and_scale(pixels, estimator, &stats);
    stats.location = location;
    stats.scale = scale;
    stats.noise = noise_estimate(pixels, width);
    stats
}

/// Robust location/scale of the luminance plane (plane 2) of a planar
/// 3-channel buffer. Used by the color and tone stages, which keep their
/// working channel in plane 2 for both xyY and HCL layouts.
pub fn luminance_loc_scale(pixels: &[f32], estimator: LsEstimator) -> (f32, f32) {
    assert_eq!(pixels.len() % 3, 0, "expected a planar 3-channel buffer");
    let plane = pixels.len() / 3;
    let lum = &pixels[2 * plane..];
    let stats = basic_stats(lum);
    location_and_scale(lum, estimator, &stats)
}

fn location_and_scale(pixels: &[f32], estimator: LsEstimator, basic: &Stats) -> (f32, f32) {
    match estimator {
        LsEstimator::MeanStdDev => (basic.mean, basic.stddev),
        LsEstimator::MedianMad => {
            let mut sample = sample_finite(pixels, MAX_STAT_SAMPLES);
            if sample.is_empty() {
                return (f32::NAN, 0.0);
            }
            let median = math::median_f32_mut(&mut sample);
            let mut scratch = Vec::new();
            let mad = math::mad_f32_with_scratch(&sample, median, &mut scratch);
            (median, mad * MAD_TO_SIGMA)
        }
        LsEstimator::Ikss => ikss(pixels),
        LsEstimator::SampledMedianQn => sampled_median_qn(pixels),
    }
}

/// Strided sample of at most `max` finite pixels.
fn sample_finite(pixels: &[f32], max: usize) -> Vec<f32> {
    let stride = (pixels.len() / max).max(1);
    pixels
        .iter()
        .step_by(stride)
        .copied()
        .filter(|v| !v.is_nan())
        .collect()
}

/// Iterative K-sigma location/scale: median/MAD, then repeated clipping of
/// samples outside a 4σ window until the scale stabilizes.
fn ikss(pixels: &[f32]) -> (f32, f32) {
    let mut sample = sample_finite(pixels, MAX_STAT_SAMPLES);
    if sample.is_empty() {
        return (f32::NAN, 0.0);
    }

    let mut scratch = Vec::new();
    let mut location = math::median_f32_mut(&mut sample);
    let mut scale = math::mad_f32_with_scratch(&sample, location, &mut scratch) * MAD_TO_SIGMA;

    for _ in 0..20 {
        if scale < f32::EPSILON {
            break;
        }
        let lo = location - 4.0 * scale;
        let hi = location + 4.0 * scale;
        let before = sample.len();
        sample.retain(|&v| v >= lo && v <= hi);
        if sample.len() < 3 || sample.len() == before {
            break;
        }
        location = math::median_f32_mut(&mut sample);
        let new_scale =
            math::mad_f32_with_scratch(&sample, location, &mut scratch) * MAD_TO_SIGMA;
        let converged = (new_scale - scale).abs() <= scale * 1e-4;
        scale = new_scale;
        if converged {
            break;
        }
    }

    (location, scale)
}

/// The default estimator: iterative sigma-clipped median for location,
/// sampled Qn for scale.
fn sampled_median_qn(pixels: &[f32]) -> (f32, f32) {
    let mut sample = sample_finite(pixels, MAX_STAT_SAMPLES);
    if sample.is_empty() {
        return (f32::NAN, 0.0);
    }

    // Iterative 3-sigma clipped median
    let mut scratch = Vec::new();
    let mut location = math::median_f32_mut(&mut sample);
    for _ in 0..10 {
        let mad = math::mad_f32_with_scratch(&sample, location, &mut scratch);
        let sigma = mad * MAD_TO_SIGMA;
        if sigma < f32::EPSILON {
            break;
        }
        let lo = location - 3.0 * sigma;
        let hi = location + 3.0 * sigma;
        let before = sample.len();
        sample.retain(|&v| v >= lo && v <= hi);
        if sample.len() < 3 || sample.len() == before {
            break;
        }
        location = math::median_f32_mut(&mut sample);
    }

    let scale = qn_sampled(&sample);
    (location, scale)
}

/// Sampled Qn scale estimator.
///
/// Qn is the k-th order statistic of pairwise absolute differences with
/// k = C(h,2), h = n/2 + 1, times 2.21914. Exhaustive pair enumeration is
/// quadratic, so pairs are drawn at random (fixed seed) up to
/// [`MAX_QN_PAIRS`] and the matching quantile is taken instead.
pub fn qn_sampled(values: &[f32]) -> f32 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }

    let h = n / 2 + 1;
    let k = (h * (h - 1) / 2).max(1);
    let total_pairs = n * (n - 1) / 2;
    let q = k as f32 / total_pairs as f32;

    let mut rng = ChaCha8Rng::seed_from_u64(0x516e);
    let mut diffs: Vec<f32>;
    if total_pairs <= MAX_QN_PAIRS {
        diffs = Vec::with_capacity(total_pairs);
        for i in 0..n {
            for j in (i + 1)..n {
                diffs.push((values[i] - values[j]).abs());
            }
        }
    } else {
        diffs = Vec::with_capacity(MAX_QN_PAIRS);
        for _ in 0..MAX_QN_PAIRS {
            let i = rng.gen_range(0..n);
            let mut j = rng.gen_range(0..n);
            if i == j {
                j = (j + 1) % n;
            }
            diffs.push((values[i] - values[j]).abs());
        }
    }

    math::quantile_f32_mut(&mut diffs, q) * QN_TO_SIGMA
}

// ============================================================================
// Noise estimation
// ============================================================================

/// Gaussian noise estimate from the 5-point Laplacian residual
/// `p[i,j] − 0.25·(p[i−1,j]+p[i+1,j]+p[i,j−1]+p[i,j+1])`.
///
/// Residuals touching NaN pixels are excluded. The MAD of the residuals is
/// rescaled by the kernel's noise gain to yield σ of the underlying noise.
pub fn noise_estimate(pixels: &[f32], width: usize) -> f32 {
    if width < 3 || pixels.len() / width < 3 {
        return 0.0;
    }
    let height = pixels.len() / width;

    // Strided residual sample, interior pixels only
    let interior = (width - 2) * (height - 2);
    let stride = (interior / MAX_STAT_SAMPLES).max(1);

    let mut residuals = Vec::with_capacity(interior.min(MAX_STAT_SAMPLES) + 1);
    let mut idx = 0usize;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            idx += 1;
            if idx % stride != 0 {
                continue;
            }
            let c = pixels[y * width + x];
            let l = pixels[y * width + x - 1];
            let r = pixels[y * width + x + 1];
            let u = pixels[(y - 1) * width + x];
            let d = pixels[(y + 1) * width + x];
            let residual = c - 0.25 * (l + r + u + d);
            if !residual.is_nan() {
                residuals.push(residual.abs());
            }
        }
    }

    if residuals.is_empty() {
        return 0.0;
    }
    // abs residuals around zero-median noise: median of |r| is the MAD
    math::median_f32_mut(&mut residuals) * LAPLACIAN_MAD_TO_SIGMA
}
