//! Robust per-pixel stacking of aligned frames.
//!
//! All combiners treat NaN as "no data": missing samples are skipped, and a
//! pixel with no samples at all stacks to NaN. Accumulation uses Kahan
//! compensation so float32 frames stack without drift.

mod incremental;
mod sigma_solver;

pub use incremental::{stack_incremental, stack_incremental_finalize};
pub use sigma_solver::find_sigmas_and_stack;

use rayon::prelude::*;

use crate::common::parallel;
use crate::error::PipelineError;
use crate::image::FitsImage;
use crate::math;

/// Maximum refinement iterations for the clipping combiners.
const MAX_CLIP_ITERATIONS: usize = 10;

/// Stacking mode, in CLI flag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackMode {
    Median,
    Mean,
    SigmaClip,
    WinsorizedSigmaClip,
    LinearFitClip,
    /// Resolved by frame count: linear-fit clip for ≥6 frames, winsorized
    /// for 3–5, mean for 2, pass-through for 1.
    #[default]
    Auto,
}

impl StackMode {
    pub fn from_flag(value: i64) -> Self {
        match value {
            0 => StackMode::Median,
            1 => StackMode::Mean,
            2 => StackMode::SigmaClip,
            3 => StackMode::WinsorizedSigmaClip,
            4 => StackMode::LinearFitClip,
            _ => StackMode::Auto,
        }
    }

    /// Resolve `Auto` against the number of frames being stacked.
    pub fn resolve(self, num_frames: usize) -> StackMode {
        match self {
            StackMode::Auto => match num_frames {
                0..=2 => StackMode::Mean,
                3..=5 => StackMode::WinsorizedSigmaClip,
                _ => StackMode::LinearFitClip,
            },
            other => other,
        }
    }

    /// Whether this mode consumes the sigma_low/sigma_high bounds.
    pub fn uses_sigma_bounds(self) -> bool {
        matches!(
            self,
            StackMode::SigmaClip | StackMode::WinsorizedSigmaClip | StackMode::LinearFitClip
        )
    }
}

/// Stacking parameters.
#[derive(Debug, Clone)]
pub struct StackParams {
    pub mode: StackMode,
    /// 0 = unweighted, 1 = by exposure, 2 = by inverse noise.
    pub weighted: i32,
    /// Clipping bounds in sigmas; negative means "solve from the clipping
    /// percentages". The solver writes discovered values back here so
    /// subsequent batches reuse them.
    pub sigma_low: f32,
    pub sigma_high: f32,
    /// Desired clipping percentages (of all samples) for the solver.
    pub clip_perc_low: f32,
    pub clip_perc_high: f32,
    /// Memory budget in MiB for the batch scheduler.
    pub memory_mib: i64,
    /// printf-style pattern for per-batch outputs; empty disables.
    pub batch_pattern: String,
}

impl Default for StackParams {
    fn default() -> Self {
        Self {
            mode: StackMode::Auto,
            weighted: 0,
            sigma_low: -1.0,
            sigma_high: -1.0,
            clip_perc_low: 0.5,
            clip_perc_high: 0.5,
            memory_mib: 0,
            batch_pattern: String::new(),
        }
    }
}

impl std::fmt::Display for StackParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mode {:?} weighted {} sigmaLow {:.2} sigmaHigh {:.2} clipPercLow {:.2} clipPercHigh {:.2}",
            self.mode,
            self.weighted,
            self.sigma_low,
            self.sigma_high,
            self.clip_perc_low,
            self.clip_perc_high
        )
    }
}

/// Result of one stacking pass.
pub struct StackResult {
    pub image: FitsImage,
    /// Samples rejected (or clamped) below the lower bound.
    pub clipped_low: u64,
    /// Samples rejected (or clamped) above the upper bound.
    pub clipped_high: u64,
    /// Total non-NaN samples seen.
    pub samples: u64,
}

/// Stack aligned frames into one image.
///
/// All frames must share the reference axes. `weights` are per-frame;
/// `ref_location` anchors the linear-fit combiner at the reference frame's
/// background level. `Auto` mode and negative sigma bounds must be resolved
/// before calling (see [`StackMode::resolve`] and [`find_sigmas_and_stack`]).
pub fn stack(
    frames: &[&FitsImage],
    weights: Option<&[f32]>,
    ref_location: f32,
    params: &StackParams,
) -> Result<StackResult, PipelineError> {
    if frames.is_empty() {
        return Err(PipelineError::NoSurvivingFrames);
    }
    let naxisn = &frames[0].naxisn;
    for frame in frames {
        if &frame.naxisn != naxisn {
            return Err(PipelineError::InvalidParameters(format!(
                "frame {} axes {:?} differ from {:?}",
                frame.id, frame.naxisn, naxisn
            )));
        }
    }
    if let Some(w) = weights
        && w.len() != frames.len()
    {
        return Err(PipelineError::InvalidParameters(format!(
            "{} weights for {} frames",
            w.len(),
            frames.len()
        )));
    }

    let mode = params.mode.resolve(frames.len());
    if mode.uses_sigma_bounds() && (params.sigma_low < 0.0 || params.sigma_high < 0.0) {
        return Err(PipelineError::InvalidParameters(
            "sigma bounds must be resolved before stacking".into(),
        ));
    }

    let pixel_count = frames[0].pixels.len();
    let mut out = vec![0.0f32; pixel_count];
    let frame_locations: Vec<f32> = frames
        .iter()
        .map(|f| f.stats.map(|s| s.location).unwrap_or(0.0))
        .collect();

    let (clipped_low, clipped_high, samples) = parallel::par_chunks_mut_auto(&mut out)
        .map(|(offset, chunk)| {
            let mut scratch = PixelScratch::new(frames.len());
            let mut counts = (0u64, 0u64, 0u64);
            for (i, result) in chunk.iter_mut().enumerate() {
                let pixel = offset + i;
                scratch.gather(frames, pixel);
                counts.2 += scratch.values.len() as u64;
                let (value, low, high) = combine(
                    mode,
                    &mut scratch,
                    weights,
                    &frame_locations,
                    ref_location,
                    params,
                );
                *result = value;
                counts.0 += low;
                counts.1 += high;
            }
            counts
        })
        .reduce(
            || (0, 0, 0),
            |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2),
        );

    let mut image = FitsImage::new(frames[0].id, naxisn[0], naxisn[1], out);
    image.naxisn = naxisn.clone();
    image.header = frames[0].header.clone();
    image.exposure = frames.iter().map(|f| f.exposure).sum();

    Ok(StackResult {
        image,
        clipped_low,
        clipped_high,
        samples,
    })
}

/// Per-worker scratch buffers for one output pixel's sample column.
pub(crate) struct PixelScratch {
    /// Non-NaN sample values for the current pixel.
    pub values: Vec<f32>,
    /// Frame index of each sample, for weight lookup after reordering.
    pub frame_idx: Vec<usize>,
    scratch: Vec<f32>,
}

impl PixelScratch {
    pub fn new(num_frames: usize) -> Self {
        Self {
            values: Vec::with_capacity(num_frames),
            frame_idx: Vec::with_capacity(num_frames),
            scratch: Vec::with_capacity(num_frames),
        }
    }

    /// Collect the non-NaN samples of one pixel across all frames.
    pub fn gather(&mut self, frames: &[&FitsImage], pixel: usize) {
        self.values.clear();
        self.frame_idx.clear();
        for (fi, frame) in frames.iter().enumerate() {
            let v = frame.pixels[pixel];
            if !v.is_nan() {
                self.values.push(v);
                self.frame_idx.push(fi);
            }
        }
    }

    /// Borrow the first `len` sample values together with the scratch
    /// buffer, for center/sigma computation without cloning.
    fn split_values(&mut self, len: usize) -> (&[f32], &mut Vec<f32>) {
        (&self.values[..len], &mut self.scratch)
    }
}

/// Combine one pixel's samples. Returns (value, clipped_low, clipped_high).
pub(crate) fn combine(
    mode: StackMode,
    scratch: &mut PixelScratch,
    weights: Option<&[f32]>,
    frame_locations: &[f32],
    ref_location: f32,
    params: &StackParams,
) -> (f32, u64, u64) {
    if scratch.values.is_empty() {
        return (f32::NAN, 0, 0);
    }
    match mode {
        StackMode::Median => {
            let median = math::median_f32_mut(&mut scratch.values);
            (median, 0, 0)
        }
        StackMode::Mean => (mean_of(scratch, weights, scratch.values.len()), 0, 0),
        StackMode::SigmaClip => sigma_clip(scratch, weights, params.sigma_low, params.sigma_high),
        StackMode::WinsorizedSigmaClip => {
            winsorized_clip(scratch, weights, params.sigma_low, params.sigma_high)
        }
        StackMode::LinearFitClip => linear_fit_clip(
            scratch,
            frame_locations,
            ref_location,
            params.sigma_low,
            params.sigma_high,
        ),
        StackMode::Auto => unreachable!("Auto is resolved before combining"),
    }
}

/// Clipping center and spread: the median of the samples, and the square
/// root of the mean squared deviation from it. Centering on the median
/// keeps a single extreme frame from dragging the clip window after itself.
fn median_sigma(values: &[f32], scratch: &mut Vec<f32>) -> (f32, f32) {
    scratch.clear();
    scratch.extend_from_slice(values);
    let center = math::median_f32_mut(scratch);
    let sum_sq: f32 = values
        .iter()
        .map(|&v| {
            let d = v - center;
            d * d
        })
        .sum();
    (center, (sum_sq / values.len() as f32).sqrt())
}

/// Weighted or plain mean of the first `len` samples.
fn mean_of(scratch: &PixelScratch, weights: Option<&[f32]>, len: usize) -> f32 {
    debug_assert!(len > 0);
    match weights {
        Some(w) => {
            let mut sum = 0.0f32;
            let mut c = 0.0f32;
            let mut weight_sum = 0.0f32;
            for i in 0..len {
                let weight = w[scratch.frame_idx[i]];
                let y = scratch.values[i] * weight - c;
                let t = sum + y;
                c = (t - sum) - y;
                sum = t;
                weight_sum += weight;
            }
            sum / weight_sum
        }
        None => math::mean_f32(&scratch.values[..len]),
    }
}

/// Iterative sigma clipping: discard samples outside `[μ−σL·σ, μ+σH·σ]`
/// until stable, then average the survivors.
fn sigma_clip(
    scratch: &mut PixelScratch,
    weights: Option<&[f32]>,
    sigma_low: f32,
    sigma_high: f32,
) -> (f32, u64, u64) {
    let mut len = scratch.values.len();
    let mut clipped_low = 0u64;
    let mut clipped_high = 0u64;

    for _ in 0..MAX_CLIP_ITERATIONS {
        if len <= 2 {
            break;
        }
        let (center, sigma) = {
            let (values, scratch_buf) = scratch.split_values(len);
            median_sigma(values, scratch_buf)
        };
        if sigma < f32::EPSILON {
            break;
        }
        let lo = center - sigma_low * sigma;
        let hi = center + sigma_high * sigma;

        let mut write = 0;
        for read in 0..len {
            let v = scratch.values[read];
            if v < lo {
                clipped_low += 1;
            } else if v > hi {
                clipped_high += 1;
            } else {
                scratch.values[write] = v;
                scratch.frame_idx[write] = scratch.frame_idx[read];
                write += 1;
            }
        }
        if write == len {
            break;
        }
        len = write;
    }

    (mean_of(scratch, weights, len), clipped_low, clipped_high)
}

/// Winsorized sigma clipping: clamp rather than drop out-of-range samples,
/// iterating until the clamped set is stable, then average.
fn winsorized_clip(
    scratch: &mut PixelScratch,
    weights: Option<&[f32]>,
    sigma_low: f32,
    sigma_high: f32,
) -> (f32, u64, u64) {
    let len = scratch.values.len();
    let mut clamped_low = vec![false; len];
    let mut clamped_high = vec![false; len];

    for _ in 0..MAX_CLIP_ITERATIONS {
        if len <= 2 {
            break;
        }
        let (center, sigma) = {
            let (values, scratch_buf) = scratch.split_values(len);
            median_sigma(values, scratch_buf)
        };
        if sigma < f32::EPSILON {
            break;
        }
        let lo = center - sigma_low * sigma;
        let hi = center + sigma_high * sigma;

        let mut changed = false;
        for i in 0..len {
            let v = scratch.values[i];
            if v < lo {
                scratch.values[i] = lo;
                clamped_low[i] = true;
                changed = true;
            } else if v > hi {
                scratch.values[i] = hi;
                clamped_high[i] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let low = clamped_low.iter().filter(|&&c| c).count() as u64;
    let high = clamped_high.iter().filter(|&&c| c).count() as u64;
    (mean_of(scratch, weights, len), low, high)
}

/// Linear-fit clipping: fit `value ≈ a·(frame_location − ref_location) + b`
/// across the samples, reject residual outliers, and output the intercept
/// `b` (the fitted value at the reference's background level).
fn linear_fit_clip(
    scratch: &mut PixelScratch,
    frame_locations: &[f32],
    ref_location: f32,
    sigma_low: f32,
    sigma_high: f32,
) -> (f32, u64, u64) {
    let mut len = scratch.values.len();
    let mut clipped_low = 0u64;
    let mut clipped_high = 0u64;

    let mut fit = (0.0f32, math::mean_f32(&scratch.values[..len]));

    for _ in 0..MAX_CLIP_ITERATIONS {
        if len <= 3 {
            break;
        }

        // Least-squares y = a·x + b with x the frame's location offset
        let n = len as f32;
        let mut sum_x = 0.0f32;
        let mut sum_y = 0.0f32;
        let mut sum_xy = 0.0f32;
        let mut sum_xx = 0.0f32;
        for i in 0..len {
            let x = frame_locations[scratch.frame_idx[i]] - ref_location;
            let y = scratch.values[i];
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_xx += x * x;
        }
        let denom = n * sum_xx - sum_x * sum_x;
        let (a, b) = if denom.abs() < f32::EPSILON {
            (0.0, sum_y / n)
        } else {
            let a = (n * sum_xy - sum_x * sum_y) / denom;
            (a, (sum_y - a * sum_x) / n)
        };
        fit = (a, b);

        // Residual spread
        let mut var = 0.0f32;
        for i in 0..len {
            let x = frame_locations[scratch.frame_idx[i]] - ref_location;
            let r = scratch.values[i] - (a * x + b);
            var += r * r;
        }
        let sigma = (var / n).sqrt();
        if sigma < f32::EPSILON {
            break;
        }

        let mut write = 0;
        for read in 0..len {
            let x = frame_locations[scratch.frame_idx[read]] - ref_location;
            let r = scratch.values[read] - (a * x + b);
            if r < -sigma_low * sigma {
                clipped_low += 1;
            } else if r > sigma_high * sigma {
                clipped_high += 1;
            } else {
                scratch.values[write] = scratch.values[read];
                scratch.frame_idx[write] = scratch.frame_idx[read];
                write += 1;
            }
        }
        if write == len {
            break;
        }
        len = write;
    }

    (fit.1, clipped_low, clipped_high)
}
