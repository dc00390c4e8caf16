//! Per-frame preprocessing: calibration, debayering, binning, statistics,
//! star detection, background extraction and range normalization.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::background::Background;
use crate::batch::expand_pattern;
use crate::calibration;
use crate::common::pool::BufferPool;
use crate::demosaic::{CfaColor, CfaPattern, debayer_bilinear};
use crate::error::FrameError;
use crate::image::{FitsImage, fits};
use crate::math::statistics::{LsEstimator, basic_stats, noise_estimate};
use crate::star_detection::{find_stars, show_stars, star_mask};

/// Preprocessing parameters, flag-compatible with the CLI.
#[derive(Debug, Clone)]
pub struct PreProcessParams {
    pub dark: Option<PathBuf>,
    pub flat: Option<PathBuf>,
    /// Debayer this channel; None disables debayering.
    pub debayer: Option<CfaColor>,
    pub cfa: CfaPattern,
    /// N×N binning factor; 0 or 1 disables.
    pub binning: usize,
    /// Normalize pixel values to [0, 1] after preprocessing.
    pub norm_range: bool,
    /// Bad-pixel sigmas; both zero disables bad-pixel repair.
    pub bp_sig_low: f32,
    pub bp_sig_high: f32,
    pub star_sig: f32,
    /// Bad-pixel sigma for star detection; negative means auto per command.
    pub star_bp_sig: f32,
    pub star_radius: usize,
    /// Background extraction grid size in pixels; 0 disables.
    pub back_grid: usize,
    pub back_sigma: f32,
    /// Clip this many brightest background cells.
    pub back_clip: usize,
    /// printf-style per-frame output patterns; empty disables.
    pub pre_pattern: String,
    pub star_pattern: String,
    pub back_pattern: String,
    pub estimator: LsEstimator,
}

impl Default for PreProcessParams {
    fn default() -> Self {
        Self {
            dark: None,
            flat: None,
            debayer: None,
            cfa: CfaPattern::Rggb,
            binning: 0,
            norm_range: false,
            bp_sig_low: 3.0,
            bp_sig_high: 5.0,
            star_sig: 10.0,
            star_bp_sig: -1.0,
            star_radius: 16,
            back_grid: 0,
            back_sigma: 1.5,
            back_clip: 0,
            pre_pattern: String::new(),
            star_pattern: String::new(),
            back_pattern: String::new(),
            estimator: LsEstimator::SampledMedianQn,
        }
    }
}

impl std::fmt::Display for PreProcessParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "debayer {:?} binning {} normRange {} bpSigLow {:.2} bpSigHigh {:.2} starSig {:.2} starBpSig {:.2} starRadius {} backGrid {}",
            self.debayer,
            self.binning,
            self.norm_range,
            self.bp_sig_low,
            self.bp_sig_high,
            self.star_sig,
            self.star_bp_sig,
            self.star_radius,
            self.back_grid
        )
    }
}

/// Load a dark frame with statistics, warning about degenerate data.
pub fn load_dark(path: &Path) -> Result<FitsImage> {
    let mut dark = fits::read_fits(path)?;
    dark.id = -1;
    let mut stats = basic_stats(&dark.pixels);
    stats.noise = noise_estimate(&dark.pixels, dark.width());
    info!("dark {} stats: {}", path.display(), stats);
    if stats.stddev < 1e-8 {
        warn!("dark file {} may be degenerate", path.display());
    }
    dark.stats = Some(stats);
    Ok(dark)
}

/// Load a flat frame with statistics, warning about degenerate data.
pub fn load_flat(path: &Path) -> Result<FitsImage> {
    let mut flat = fits::read_fits(path)?;
    flat.id = -2;
    let mut stats = basic_stats(&flat.pixels);
    stats.noise = noise_estimate(&flat.pixels, flat.width());
    info!("flat {} stats: {}", path.display(), stats);
    if (stats.min <= 0.0 && stats.max >= 0.0) || stats.stddev < 1e-8 {
        warn!("flat file {} may be degenerate", path.display());
    }
    flat.stats = Some(stats);
    Ok(flat)
}

/// Load the dark and flat frames named by the parameters, if any.
pub fn load_dark_and_flat(
    params: &PreProcessParams,
) -> Result<(Option<FitsImage>, Option<FitsImage>)> {
    let dark = params.dark.as_deref().map(load_dark).transpose()?;
    let flat = params.flat.as_deref().map(load_flat).transpose()?;
    Ok((dark, flat))
}

/// Preprocess one light frame.
///
/// Order: dark subtraction, flat division, bad-pixel repair (CFA-aware when
/// debayering), debayer, binning, statistics and star detection, background
/// extraction, range normalization.
pub fn pre_process_light(
    id: i32,
    file_name: &Path,
    dark: Option<&FitsImage>,
    flat: Option<&FitsImage>,
    params: &PreProcessParams,
    pool: &BufferPool,
) -> Result<FitsImage, FrameError> {
    let mut light =
        fits::read_fits_pooled(file_name, Some(pool)).map_err(|source| FrameError::Unreadable {
            id,
            message: format!("{source:#}"),
        })?;
    light.id = id;

    if let Some(dark) = dark {
        calibration::subtract_dark(&mut light, dark)?;
    }
    if let Some(flat) = flat {
        calibration::divide_flat(&mut light, flat)?;
    }

    // Bad-pixel repair runs before debayering; on CFA data it compares
    // like-colored neighbors only.
    if params.bp_sig_low != 0.0 && params.bp_sig_high != 0.0 {
        let width = light.width();
        let (bad, _) = if params.debayer.is_some() {
            calibration::bad_pixel_map_bayer(
                &light.pixels,
                width,
                params.bp_sig_low,
                params.bp_sig_high,
            )
        } else {
            calibration::bad_pixel_map(&light.pixels, width, params.bp_sig_low, params.bp_sig_high)
        };
        if params.debayer.is_some() {
            calibration::repair_bad_pixels_bayer(&mut light.pixels, width, &bad);
        } else {
            calibration::repair_bad_pixels(&mut light.pixels, width, &bad);
        }
        info!(
            "{}: removed {} bad pixels ({:.2}%) with sigma low {:.2} high {:.2}",
            id,
            bad.len(),
            100.0 * bad.len() as f32 / light.pixels.len() as f32,
            params.bp_sig_low,
            params.bp_sig_high
        );
        light.invalidate();
    }

    if let Some(channel) = params.debayer {
        let width = light.width();
        let debayered = debayer_bilinear(&light.pixels, width, channel, params.cfa, id)?;
        let old = std::mem::replace(&mut light.pixels, debayered);
        pool.f32s.release(old);
        info!(
            "{}: debayered channel {:?} from cfa {:?}, size {}x{}",
            id,
            channel,
            params.cfa,
            light.width(),
            light.height()
        );
        light.invalidate();
    }

    if params.binning > 1 {
        let binned = calibration::bin_nxn(&light, params.binning);
        let old = std::mem::replace(&mut light, binned);
        old.release_into(pool);
    }

    compute_stats_and_stars(&mut light, params);

    if params.back_grid > 0 {
        info!(
            "{}: automatic background extraction with grid size {}",
            id, params.back_grid
        );
        let mask = star_mask(&light.stars, light.width(), light.height(), 3.0);
        let background = Background::new(
            &light.pixels,
            Some(&mask),
            light.width(),
            params.back_grid,
            params.back_sigma,
            params.back_clip,
        );
        if params.back_pattern.is_empty() {
            background.subtract(&mut light.pixels);
        } else {
            let rendered = background.render();
            let mut bg_image = FitsImage::new(id, light.width(), light.height(), rendered);
            bg_image.header = light.header.clone();
            let path = expand_pattern(&params.back_pattern, id as usize);
            fits::write_fits(&bg_image, &path).map_err(|source| FrameError::Other {
                id,
                message: format!("error writing {}: {:#}", path.display(), source),
            })?;
            crate::math::subtract(&mut light.pixels, &bg_image.pixels);
            bg_image.release_into(pool);
        }
        light.invalidate();
        compute_stats_and_stars(&mut light, params);
    }

    if params.norm_range {
        let stats = light.stats.expect("stats computed above");
        if stats.min == stats.max {
            warn!(
                "{}: image is of uniform intensity {:.4}, skipping normalization",
                id, stats.min
            );
        } else {
            info!(
                "{}: normalizing from [{:.4}, {:.4}] to [0, 1]",
                id, stats.min, stats.max
            );
            light.normalize();
            light.recompute_stats(params.estimator);
            detect_stars(&mut light, params);
        }
    }

    Ok(light)
}

/// Extended statistics followed by star detection, with a log line.
fn compute_stats_and_stars(light: &mut FitsImage, params: &PreProcessParams) {
    light.recompute_stats(params.estimator);
    detect_stars(light, params);
    let stats = light.stats.expect("just computed");
    info!(
        "{}: stars {} hfr {:.3} {}",
        light.id,
        light.stars.len(),
        light.hfr,
        stats
    );
}

fn detect_stars(light: &mut FitsImage, params: &PreProcessParams) {
    let stats = light.stats.expect("stats required for star detection");
    let (stars, hfr) = find_stars(
        &light.pixels,
        light.width(),
        stats.location,
        stats.scale,
        params.star_sig,
        params.star_bp_sig,
        params.star_radius,
    );
    light.stars = stars;
    light.hfr = hfr;
}

/// Preprocess all frames, bounded by the image-level worker pool.
/// Failed frames are logged and returned as None.
pub fn pre_process_lights(
    ids: &[usize],
    file_names: &[PathBuf],
    dark: Option<&FitsImage>,
    flat: Option<&FitsImage>,
    params: &PreProcessParams,
    pool: &BufferPool,
    parallelism: usize,
) -> Vec<Option<FitsImage>> {
    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism.max(1))
        .build()
        .expect("failed to build worker pool");

    workers.install(|| {
        ids.par_iter()
            .zip(file_names.par_iter())
            .map(|(&id, file_name)| {
                match pre_process_light(id as i32, file_name, dark, flat, params, pool) {
                    Ok(light) => {
                        if !params.pre_pattern.is_empty() {
                            let path = expand_pattern(&params.pre_pattern, id);
                            if let Err(err) = fits::write_fits(&light, &path) {
                                warn!("{}: error writing {}: {:#}", id, path.display(), err);
                            }
                        }
                        if !params.star_pattern.is_empty() {
                            let stars_image = show_stars(&light, 2.0);
                            let path = expand_pattern(&params.star_pattern, id);
                            if let Err(err) = fits::write_fits(&stars_image, &path) {
                                warn!("{}: error writing {}: {:#}", id, path.display(), err);
                            }
                        }
                        Some(light)
                    }
                    Err(err) => {
                        warn!("{}: error: {}", id, err);
                        None
                    }
                }
            })
            .collect()
    })
}

/// Pick the reference frame: maximize star count over HFR.
pub fn select_reference_frame(lights: &[Option<FitsImage>]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (slot, light) in lights.iter().enumerate() {
        let Some(light) = light else { continue };
        let score = if light.stars.is_empty() || light.hfr == 0.0 {
            0.0
        } else {
            light.stars.len() as f32 / light.hfr
        };
        if best.is_none() || score > best.unwrap().1 {
            best = Some((slot, score));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_synthetic_light(path: &Path, star_amp: f32) {
        let width = 32;
        let mut pixels = vec![10.0f32; width * width];
        for y in 0..width {
            for x in 0..width {
                let dx = x as f32 - 16.0;
                let dy = y as f32 - 16.0;
                pixels[y * width + x] += star_amp * (-(dx * dx + dy * dy) / 2.0).exp()
                    + 0.01 * ((x + y) % 5) as f32;
            }
        }
        let mut image = FitsImage::new(0, width, width, pixels);
        image.header.set("EXPTIME", "60.0", "");
        fits::write_fits(&image, path).unwrap();
    }

    #[test]
    fn test_preprocess_detects_star() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("light.fits");
        write_synthetic_light(&path, 100.0);

        let pool = BufferPool::new();
        let params = PreProcessParams {
            bp_sig_low: 0.0,
            bp_sig_high: 0.0,
            star_radius: 8,
            ..Default::default()
        };
        let light = pre_process_light(3, &path, None, None, &params, &pool).unwrap();

        assert_eq!(light.id, 3);
        assert_eq!(light.exposure, 60.0);
        assert_eq!(light.stars.len(), 1);
        assert!((light.stars[0].x - 16.0).abs() < 0.2);
        assert!(light.stats.is_some());
    }

    #[test]
    fn test_preprocess_dark_subtraction_and_norm() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("light.fits");
        write_synthetic_light(&path, 50.0);

        let dark = FitsImage::new(-1, 32, 32, vec![5.0; 1024]);
        let pool = BufferPool::new();
        let params = PreProcessParams {
            bp_sig_low: 0.0,
            bp_sig_high: 0.0,
            norm_range: true,
            star_radius: 8,
            ..Default::default()
        };
        let light = pre_process_light(0, &path, Some(&dark), None, &params, &pool).unwrap();

        let stats = light.stats.unwrap();
        assert!(stats.min >= 0.0 && stats.max <= 1.0);
    }

    #[test]
    fn test_preprocess_size_mismatch_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("light.fits");
        write_synthetic_light(&path, 50.0);

        let dark = FitsImage::new(-1, 16, 16, vec![5.0; 256]);
        let pool = BufferPool::new();
        let params = PreProcessParams::default();
        let err = pre_process_light(0, &path, Some(&dark), None, &params, &pool).unwrap_err();
        assert!(matches!(err, FrameError::SizeMismatch { .. }));
    }

    #[test]
    fn test_preprocess_unreadable_file() {
        let pool = BufferPool::new();
        let params = PreProcessParams::default();
        let err = pre_process_light(
            7,
            Path::new("/nonexistent.fits"),
            None,
            None,
            &params,
            &pool,
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::Unreadable { id: 7, .. }));
    }

    #[test]
    fn test_pre_process_lights_mixed_success() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.fits");
        write_synthetic_light(&good, 80.0);
        let missing = dir.path().join("missing.fits");

        let pool = BufferPool::new();
        let params = PreProcessParams {
            bp_sig_low: 0.0,
            bp_sig_high: 0.0,
            star_radius: 8,
            ..Default::default()
        };
        let lights = pre_process_lights(
            &[0, 1],
            &[good, missing],
            None,
            None,
            &params,
            &pool,
            2,
        );
        assert_eq!(lights.len(), 2);
        assert!(lights[0].is_some());
        assert!(lights[1].is_none());
    }

    #[test]
    fn test_select_reference_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("light.fits");
        write_synthetic_light(&path, 100.0);

        let pool = BufferPool::new();
        let params = PreProcessParams {
            bp_sig_low: 0.0,
            bp_sig_high: 0.0,
            star_radius: 8,
            ..Default::default()
        };
        let light = pre_process_light(0, &path, None, None, &params, &pool).unwrap();

        let mut starless = light.clone();
        starless.stars.clear();
        starless.hfr = 0.0;

        let lights = vec![None, Some(starless), Some(light)];
        let (slot, score) = select_reference_frame(&lights).unwrap();
        assert_eq!(slot, 2);
        assert!(score > 0.0);
    }

    #[test]
    fn test_select_reference_frame_all_none() {
        assert!(select_reference_frame(&[None, None]).is_none());
    }

    #[test]
    fn test_background_extraction_flattens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("light.fits");
        // gradient background + star
        let width = 64;
        let mut pixels = vec![0.0f32; width * width];
        for y in 0..width {
            for x in 0..width {
                let dx = x as f32 - 32.0;
                let dy = y as f32 - 32.0;
                pixels[y * width + x] =
                    10.0 + 0.05 * x as f32 + 100.0 * (-(dx * dx + dy * dy) / 2.0).exp();
            }
        }
        fits::write_fits(&FitsImage::new(0, width, width, pixels), &path).unwrap();

        let pool = BufferPool::new();
        let params = PreProcessParams {
            bp_sig_low: 0.0,
            bp_sig_high: 0.0,
            back_grid: 16,
            star_radius: 8,
            ..Default::default()
        };
        let light = pre_process_light(0, &path, None, None, &params, &pool).unwrap();
        let stats = light.stats.unwrap();
        // gradient removed: background location near zero
        assert!(
            stats.location.abs() < 0.5,
            "location {} should be near zero",
            stats.location
        );
        // the star survives background extraction
        assert_eq!(light.stars.len(), 1);
    }
}
