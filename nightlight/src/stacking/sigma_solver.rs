//! Sigma-bound solver: find clipping sigmas that achieve the requested
//! rejection percentages, then stack with them.

use tracing::info;

use crate::error::PipelineError;
use crate::image::FitsImage;

use super::{PixelScratch, StackMode, StackParams, StackResult, combine, stack};

/// Pixel subset size for the empirical rejection curve.
const MAX_SOLVER_SAMPLES: usize = 100_000;

/// Bisection bracket for sigma values.
const SIGMA_MIN: f32 = 0.5;
const SIGMA_MAX: f32 = 10.0;

/// Bisection iterations per bound.
const BISECT_ITERATIONS: usize = 16;

/// Accepted relative deviation from the target clip fraction.
const TARGET_TOLERANCE: f32 = 0.05;

/// Solve sigma bounds from the desired clipping percentages, then stack.
///
/// Bounds that are already non-negative are kept. Discovered values are
/// written back into `params`, so subsequent batches stack directly with
/// them. The search starts from σ = 3 and bisects against the rejection
/// fraction measured on a sampled pixel subset.
pub fn find_sigmas_and_stack(
    frames: &[&FitsImage],
    weights: Option<&[f32]>,
    ref_location: f32,
    params: &mut StackParams,
) -> Result<StackResult, PipelineError> {
    if frames.is_empty() {
        return Err(PipelineError::NoSurvivingFrames);
    }

    let mode = params.mode.resolve(frames.len());
    let mut sigma_low = if params.sigma_low >= 0.0 {
        params.sigma_low
    } else {
        3.0
    };
    let mut sigma_high = if params.sigma_high >= 0.0 {
        params.sigma_high
    } else {
        3.0
    };

    let target_low = params.clip_perc_low / 100.0;
    let target_high = params.clip_perc_high / 100.0;
    let sample_pixels = sample_indices(frames[0].pixels.len());

    // Each bound's rejection fraction falls monotonically as its sigma
    // grows. Bisect them in turn, twice, since the bounds interact weakly
    // through the iterative clipping.
    for _ in 0..2 {
        if params.sigma_low < 0.0 && target_low > 0.0 {
            sigma_low = bisect(|s| {
                measure(frames, mode, &sample_pixels, s, sigma_high, ref_location, params).0
            }, target_low, sigma_low);
        }
        if params.sigma_high < 0.0 && target_high > 0.0 {
            sigma_high = bisect(|s| {
                measure(frames, mode, &sample_pixels, sigma_low, s, ref_location, params).1
            }, target_high, sigma_high);
        }
    }

    info!(
        sigma_low,
        sigma_high, "solved sigma bounds from clipping targets"
    );
    params.sigma_low = sigma_low;
    params.sigma_high = sigma_high;

    stack(frames, weights, ref_location, params)
}

/// Strided subset of pixel indices, at most [`MAX_SOLVER_SAMPLES`].
fn sample_indices(pixel_count: usize) -> Vec<usize> {
    let stride = (pixel_count / MAX_SOLVER_SAMPLES).max(1);
    (0..pixel_count).step_by(stride).collect()
}

/// Measure the achieved (low, high) rejection fractions for a sigma pair
/// over the sampled pixels.
fn measure(
    frames: &[&FitsImage],
    mode: StackMode,
    sample_pixels: &[usize],
    sigma_low: f32,
    sigma_high: f32,
    ref_location: f32,
    params: &StackParams,
) -> (f32, f32) {
    let trial = StackParams {
        sigma_low,
        sigma_high,
        ..params.clone()
    };
    let frame_locations: Vec<f32> = frames
        .iter()
        .map(|f| f.stats.map(|s| s.location).unwrap_or(0.0))
        .collect();

    let mut scratch = PixelScratch::new(frames.len());
    let mut clipped_low = 0u64;
    let mut clipped_high = 0u64;
    let mut samples = 0u64;
    for &pixel in sample_pixels {
        scratch.gather(frames, pixel);
        samples += scratch.values.len() as u64;
        let (_, low, high) = combine(
            mode,
            &mut scratch,
            None,
            &frame_locations,
            ref_location,
            &trial,
        );
        clipped_low += low;
        clipped_high += high;
    }

    if samples == 0 {
        return (0.0, 0.0);
    }
    (
        clipped_low as f32 / samples as f32,
        clipped_high as f32 / samples as f32,
    )
}

/// Bisect sigma so `rejection(sigma)` lands within 5% of `target`.
///
/// Rejection falls as sigma grows, so the bracket orients high-to-low.
fn bisect<F: FnMut(f32) -> f32>(mut rejection: F, target: f32, initial: f32) -> f32 {
    let mut lo = SIGMA_MIN; // high rejection
    let mut hi = SIGMA_MAX; // low rejection
    let mut sigma = initial.clamp(lo, hi);

    for _ in 0..BISECT_ITERATIONS {
        let achieved = rejection(sigma);
        if (achieved - target).abs() <= target * TARGET_TOLERANCE {
            break;
        }
        if achieved > target {
            // clipping too much: raise sigma
            lo = sigma;
        } else {
            hi = sigma;
        }
        sigma = 0.5 * (lo + hi);
    }
    sigma
}
