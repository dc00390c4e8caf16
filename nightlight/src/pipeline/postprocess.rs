//! Per-frame postprocessing: histogram normalization, alignment onto the
//! reference frame, projection, and optional unsharp masking.

use std::path::PathBuf;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::batch::expand_pattern;
use crate::error::FrameError;
use crate::image::{FitsImage, fits};
use crate::math::statistics::{LsEstimator, Stats};
use crate::normalization::{HistoNormMode, match_location_scale, shift_black_to_location};
use crate::registration::{Aligner, projection::project, transform::Transform2D};

/// Out-of-bounds fill for projected frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OobMode {
    /// NaN: stackers see those pixels as missing.
    #[default]
    Nan,
    /// The reference frame's location. Good for single channels before
    /// stacking.
    RefLocation,
    /// The frame's own location. Good for RGB channels whose backgrounds
    /// differ.
    OwnLocation,
}

/// Postprocessing parameters, flag-compatible with the CLI.
#[derive(Debug, Clone)]
pub struct PostProcessParams {
    pub align: bool,
    /// Use triangles formed from this many brightest stars.
    pub align_k: usize,
    /// Drop frames whose alignment residual exceeds this.
    pub align_threshold: f32,
    pub norm_hist: HistoNormMode,
    pub oob_mode: OobMode,
    /// Unsharp mask sigma (about a third of the radius).
    pub usm_sigma: f32,
    /// Unsharp mask gain; 0 disables.
    pub usm_gain: f32,
    /// Unsharp mask threshold in scales above the location.
    pub usm_threshold: f32,
    pub post_pattern: String,
    pub estimator: LsEstimator,
}

impl Default for PostProcessParams {
    fn default() -> Self {
        Self {
            align: true,
            align_k: 20,
            align_threshold: 1.0,
            norm_hist: HistoNormMode::Auto,
            oob_mode: OobMode::Nan,
            usm_sigma: 1.0,
            usm_gain: 0.0,
            usm_threshold: 1.0,
            post_pattern: String::new(),
            estimator: LsEstimator::SampledMedianQn,
        }
    }
}

impl std::fmt::Display for PostProcessParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "align {} alignK {} alignThresh {:.2} normHist {:?} oobMode {:?} usmSigma {:.2} usmGain {:.2} usmThresh {:.2}",
            self.align,
            self.align_k,
            self.align_threshold,
            self.norm_hist,
            self.oob_mode,
            self.usm_sigma,
            self.usm_gain,
            self.usm_threshold
        )
    }
}

/// Postprocess one frame against the reference.
pub fn post_process_light(
    aligner: Option<&Aligner>,
    histo_ref: Option<&Stats>,
    mut light: FitsImage,
    params: &PostProcessParams,
) -> Result<FitsImage, FrameError> {
    // Histogram normalization against the reference
    match (params.norm_hist, histo_ref) {
        (HistoNormMode::None | HistoNormMode::Auto, _) | (_, None) => {}
        (HistoNormMode::LocScale, Some(reference)) => {
            let stats = match_location_scale(&mut light, reference, params.estimator);
            info!("{}: {}", light.id, stats);
        }
        (HistoNormMode::LocBlack, Some(reference)) => {
            let stats = shift_black_to_location(&mut light, reference, params.estimator);
            info!("{}: {}", light.id, stats);
        }
    }

    // Alignment onto the reference grid
    let Some(aligner) = aligner.filter(|a| a.has_ref_stars()) else {
        light.transform = Transform2D::identity();
        return apply_unsharp(light, params);
    };

    if aligner.is_reference(&light.stars) {
        light.transform = Transform2D::identity();
        return apply_unsharp(light, params);
    }

    if light.stars.len() < 3 {
        warn!("{}: fewer than 3 stars, skipping alignment", light.id);
        light.transform = Transform2D::identity();
        return apply_unsharp(light, params);
    }

    let oob_fill = match params.oob_mode {
        OobMode::Nan => f32::NAN,
        OobMode::RefLocation => histo_ref.map(|s| s.location).unwrap_or(f32::NAN),
        OobMode::OwnLocation => light.stats.map(|s| s.location).unwrap_or(f32::NAN),
    };

    let (transform, residual) = aligner.align(&light.stars, light.id);
    if residual > params.align_threshold {
        return Err(FrameError::ResidualTooHigh {
            id: light.id,
            residual,
            limit: params.align_threshold,
        });
    }
    light.transform = transform;
    light.residual = residual;
    info!(
        "{}: transform {} oob {:.3} residual {:.3}",
        light.id, transform, oob_fill, residual
    );

    let mut projected = project(&light, &aligner.naxisn, transform, oob_fill);
    projected.transform = Transform2D::identity();
    projected.recompute_stats(params.estimator);

    apply_unsharp(projected, params)
}

fn apply_unsharp(
    mut light: FitsImage,
    params: &PostProcessParams,
) -> Result<FitsImage, FrameError> {
    if params.usm_gain <= 0.0 {
        return Ok(light);
    }
    let stats = match light.stats {
        Some(s) => s,
        None => light.recompute_stats(params.estimator),
    };
    let abs_threshold = stats.location + stats.scale * params.usm_threshold;
    info!(
        "{}: unsharp masking sigma {:.3} gain {:.3} absThresh {:.3}",
        light.id, params.usm_sigma, params.usm_gain, abs_threshold
    );
    let width = light.width();
    unsharp_mask(
        &mut light.pixels,
        width,
        params.usm_sigma,
        params.usm_gain,
        stats.min,
        stats.max,
        abs_threshold,
    );
    light.invalidate();
    light.recompute_stats(params.estimator);
    Ok(light)
}

/// Postprocess all frames in parallel; failed slots become None.
/// Returns the number of dropped frames.
pub fn post_process_lights(
    align_ref: Option<&FitsImage>,
    histo_ref: Option<&FitsImage>,
    lights: &mut [Option<FitsImage>],
    params: &PostProcessParams,
    parallelism: usize,
) -> usize {
    let aligner = match (params.align, align_ref) {
        (true, Some(reference)) => Some(Aligner::new(
            &reference.naxisn,
            &reference.stars,
            params.align_k,
        )),
        _ => None,
    };
    let histo_stats = histo_ref.and_then(|r| r.stats);

    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism.max(1))
        .build()
        .expect("failed to build worker pool");

    workers.install(|| {
        lights
            .par_iter_mut()
            .map(|slot| {
                let Some(light) = slot.take() else {
                    return 0usize;
                };
                let id = light.id;
                match post_process_light(aligner.as_ref(), histo_stats.as_ref(), light, params) {
                    Ok(processed) => {
                        if !params.post_pattern.is_empty() {
                            let path: PathBuf = expand_pattern(&params.post_pattern, id as usize);
                            if let Err(err) = fits::write_fits(&processed, &path) {
                                warn!("{}: error writing {}: {:#}", id, path.display(), err);
                            }
                        }
                        *slot = Some(processed);
                        0
                    }
                    Err(err) => {
                        warn!("{}: error: {}", id, err);
                        1
                    }
                }
            })
            .sum()
    })
}

// ============================================================================
// Unsharp masking
// ============================================================================

/// 1D Gaussian kernel, normalized, truncated at ±3 sigma.
fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i32;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let denom = 2.0 * sigma * sigma;
    for i in -radius..=radius {
        kernel.push((-(i * i) as f32 / denom).exp());
    }
    let sum: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// Separable Gaussian unsharp mask.
///
/// Sharpens only pixels above `abs_threshold`, clamping results into
/// `[min, max]` so stars don't ring past the data range.
fn unsharp_mask(
    pixels: &mut [f32],
    width: usize,
    sigma: f32,
    gain: f32,
    min: f32,
    max: f32,
    abs_threshold: f32,
) {
    let height = pixels.len() / width;
    let kernel = gaussian_kernel_1d(sigma);
    let radius = (kernel.len() / 2) as i32;

    // Horizontal pass
    let mut blurred = vec![0.0f32; pixels.len()];
    blurred
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                let mut weight = 0.0f32;
                for (k, &kv) in kernel.iter().enumerate() {
                    let sx = x as i32 + k as i32 - radius;
                    if sx < 0 || sx >= width as i32 {
                        continue;
                    }
                    let v = pixels[y * width + sx as usize];
                    if v.is_nan() {
                        continue;
                    }
                    acc += kv * v;
                    weight += kv;
                }
                *out = if weight > 0.0 { acc / weight } else { f32::NAN };
            }
        });

    // Vertical pass into a second buffer
    let mut blurred2 = vec![0.0f32; pixels.len()];
    blurred2
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                let mut weight = 0.0f32;
                for (k, &kv) in kernel.iter().enumerate() {
                    let sy = y as i32 + k as i32 - radius;
                    if sy < 0 || sy >= height as i32 {
                        continue;
                    }
                    let v = blurred[sy as usize * width + x];
                    if v.is_nan() {
                        continue;
                    }
                    acc += kv * v;
                    weight += kv;
                }
                *out = if weight > 0.0 { acc / weight } else { f32::NAN };
            }
        });

    pixels
        .par_iter_mut()
        .zip(blurred2.par_iter())
        .for_each(|(v, &blur)| {
            if v.is_nan() || blur.is_nan() || *v <= abs_threshold {
                return;
            }
            *v = (*v + gain * (*v - blur)).clamp(min, max);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star_detection::Star;

    fn star(x: f32, y: f32, flux: f32) -> Star {
        Star {
            x,
            y,
            flux,
            hfr: 2.0,
        }
    }

    fn frame_with_stars(id: i32, offset: (f32, f32)) -> FitsImage {
        let width = 64;
        let stars = [
            (10.0, 10.0, 500.0),
            (50.0, 15.0, 400.0),
            (30.0, 45.0, 300.0),
            (15.0, 55.0, 250.0),
            (55.0, 50.0, 200.0),
        ];
        let mut pixels = vec![1.0f32; width * width];
        for &(sx, sy, amp) in &stars {
            let cx = sx + offset.0;
            let cy = sy + offset.1;
            for y in 0..width {
                for x in 0..width {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    pixels[y * width + x] += amp * (-(dx * dx + dy * dy) / 2.0).exp();
                }
            }
        }
        let mut image = FitsImage::new(id, width, width, pixels);
        image.stars = stars
            .iter()
            .map(|&(x, y, f)| star(x + offset.0, y + offset.1, f))
            .collect();
        image.hfr = 2.0;
        image.recompute_stats(LsEstimator::MedianMad);
        image
    }

    #[test]
    fn test_reference_frame_gets_identity_without_resampling() {
        let reference = frame_with_stars(0, (0.0, 0.0));
        let aligner = Aligner::new(&reference.naxisn, &reference.stars, 20);
        let params = PostProcessParams {
            norm_hist: HistoNormMode::None,
            ..Default::default()
        };

        let before = reference.pixels.clone();
        // Moving the frame moves its star Vec, not the heap allocation the
        // aligner remembered, so the identity check still fires.
        let result = post_process_light(Some(&aligner), None, reference, &params).unwrap();
        assert!(result.transform.is_identity());
        assert_eq!(result.residual, 0.0);
        assert_eq!(result.pixels, before, "reference must not be resampled");
    }

    #[test]
    fn test_translated_frame_projected_back() {
        let reference = frame_with_stars(0, (0.0, 0.0));
        let shifted = frame_with_stars(1, (2.0, -1.0));

        let params = PostProcessParams {
            norm_hist: HistoNormMode::None,
            oob_mode: OobMode::Nan,
            ..Default::default()
        };
        let aligner = Aligner::new(&reference.naxisn, &reference.stars, params.align_k);
        let result = post_process_light(Some(&aligner), None, shifted, &params).unwrap();

        assert!(result.transform.is_identity());
        assert!(result.residual < 0.1);
        // After projection the star sits back at the reference position
        let peak = result.pixels[10 * 64 + 10];
        assert!(peak > 100.0, "projected star peak {peak}");
        // Pixels shifted in from outside are NaN along the right edge
        assert!(result.pixels[63].is_nan());
    }

    #[test]
    fn test_residual_above_threshold_drops_frame() {
        let reference = frame_with_stars(0, (0.0, 0.0));
        let mut scrambled = frame_with_stars(1, (0.0, 0.0));
        // Destroy star geometry: collinear stars can't form triangles
        scrambled.stars = (0..5).map(|i| star(i as f32 * 10.0, 5.0, 100.0)).collect();

        let params = PostProcessParams {
            norm_hist: HistoNormMode::None,
            ..Default::default()
        };
        let aligner = Aligner::new(&reference.naxisn, &reference.stars, params.align_k);
        let err = post_process_light(Some(&aligner), None, scrambled, &params).unwrap_err();
        assert!(matches!(err, FrameError::ResidualTooHigh { id: 1, .. }));
    }

    #[test]
    fn test_too_few_stars_passes_through_with_identity() {
        let reference = frame_with_stars(0, (0.0, 0.0));
        let mut sparse = frame_with_stars(1, (3.0, 3.0));
        sparse.stars.truncate(2);

        let params = PostProcessParams {
            norm_hist: HistoNormMode::None,
            ..Default::default()
        };
        let aligner = Aligner::new(&reference.naxisn, &reference.stars, params.align_k);
        let before = sparse.pixels.clone();
        let result = post_process_light(Some(&aligner), None, sparse, &params).unwrap();
        assert!(result.transform.is_identity());
        assert_eq!(result.pixels, before);
    }

    #[test]
    fn test_norm_hist_loc_scale_applied() {
        let reference = frame_with_stars(0, (0.0, 0.0));
        let mut brighter = frame_with_stars(1, (0.0, 0.0));
        for v in brighter.pixels.iter_mut() {
            *v = *v * 2.0 + 0.5;
        }
        brighter.recompute_stats(LsEstimator::MedianMad);
        // keep the same star list (it is not the reference's allocation)

        let params = PostProcessParams {
            align: false,
            norm_hist: HistoNormMode::LocScale,
            estimator: LsEstimator::MedianMad,
            ..Default::default()
        };
        let ref_stats = reference.stats.unwrap();
        let result = post_process_light(None, Some(&ref_stats), brighter, &params).unwrap();
        let stats = result.stats.unwrap();
        assert!((stats.location - ref_stats.location).abs() < 1e-2);
        assert!((stats.scale - ref_stats.scale).abs() < 1e-2);
    }

    #[test]
    fn test_post_process_lights_counts_errors() {
        let reference = frame_with_stars(0, (0.0, 0.0));
        let good = frame_with_stars(1, (1.0, 1.0));
        let mut bad = frame_with_stars(2, (0.0, 0.0));
        bad.stars = (0..5).map(|i| star(i as f32 * 10.0, 5.0, 100.0)).collect();

        let params = PostProcessParams {
            norm_hist: HistoNormMode::None,
            ..Default::default()
        };
        let mut lights = vec![Some(reference.clone()), Some(good), Some(bad), None];
        let errors = post_process_lights(Some(&reference), None, &mut lights, &params, 2);

        assert_eq!(errors, 1);
        assert!(lights[0].is_some());
        assert!(lights[1].is_some());
        assert!(lights[2].is_none(), "bad frame dropped");
        assert!(lights[3].is_none());
    }

    #[test]
    fn test_unsharp_mask_sharpens_star_only() {
        let width = 32;
        let mut pixels = vec![0.1f32; width * width];
        for y in 0..width {
            for x in 0..width {
                let dx = x as f32 - 16.0;
                let dy = y as f32 - 16.0;
                pixels[y * width + x] += 0.8 * (-(dx * dx + dy * dy) / 8.0).exp();
            }
        }
        let before_peak = pixels[16 * width + 16];
        let before_bg = pixels[0];

        unsharp_mask(&mut pixels, width, 1.0, 1.0, 0.0, 1.0, 0.3);

        assert!(
            pixels[16 * width + 16] >= before_peak,
            "peak must not dim: {} -> {}",
            before_peak,
            pixels[16 * width + 16]
        );
        assert_eq!(pixels[0], before_bg, "background below threshold untouched");
        for &v in &pixels {
            assert!((0.0..=1.0).contains(&v), "clamped to range, got {v}");
        }
    }

    #[test]
    fn test_gaussian_kernel_normalized() {
        let kernel = gaussian_kernel_1d(1.5);
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(kernel.len(), 11); // radius ceil(4.5) = 5
        // symmetric
        assert!((kernel[0] - kernel[10]).abs() < 1e-7);
    }
}
