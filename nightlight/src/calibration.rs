//! Frame calibration: dark subtraction, flat division, bad-pixel detection
//! and repair, and N×N binning.

use rayon::prelude::*;

use crate::common::parallel;
use crate::error::FrameError;
use crate::image::FitsImage;
use crate::math::{self, statistics};

/// Subtract a dark frame in place. Axes must match.
pub fn subtract_dark(light: &mut FitsImage, dark: &FitsImage) -> Result<(), FrameError> {
    if light.naxisn != dark.naxisn {
        return Err(FrameError::SizeMismatch {
            id: light.id,
            kind: "dark",
            actual: light.naxisn.clone(),
            expected: dark.naxisn.clone(),
        });
    }
    math::subtract(&mut light.pixels, &dark.pixels);
    light.invalidate();
    Ok(())
}

/// Divide by a flat frame in place, normalized by the flat's mean so output
/// pixels stay near 1× input. Axes must match.
pub fn divide_flat(light: &mut FitsImage, flat: &FitsImage) -> Result<(), FrameError> {
    if light.naxisn != flat.naxisn {
        return Err(FrameError::SizeMismatch {
            id: light.id,
            kind: "flat",
            actual: light.naxisn.clone(),
            expected: flat.naxisn.clone(),
        });
    }
    let baseline = match flat.stats {
        Some(s) => s.mean,
        None => statistics::basic_stats(&flat.pixels).mean,
    };
    math::divide_safe(&mut light.pixels, &flat.pixels, baseline);
    light.invalidate();
    Ok(())
}

// ============================================================================
// Bad pixel detection and repair
// ============================================================================

/// Neighbor offsets within a 1.5 pixel radius (the 8-connected ring).
const NEIGHBORS_8: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Like-colored neighbor offsets on a Bayer mosaic: stepping by two in each
/// axis lands on the same CFA color for any of the four pattern orders.
const NEIGHBORS_BAYER: [(i32, i32); 8] = [
    (-2, -2),
    (0, -2),
    (2, -2),
    (-2, 0),
    (2, 0),
    (-2, 2),
    (0, 2),
    (2, 2),
];

/// Detect bad pixels by deviation from the local neighbor median.
///
/// Returns the flagged pixel indices and the statistics of the
/// pixel-minus-local-median differences (reused by star detection's
/// automatic bad-pixel threshold).
pub fn bad_pixel_map(
    pixels: &[f32],
    width: usize,
    sig_low: f32,
    sig_high: f32,
) -> (Vec<usize>, statistics::Stats) {
    detect_bad_pixels(pixels, width, sig_low, sig_high, &NEIGHBORS_8)
}

/// Bayer-aware variant comparing only like-colored neighbors; used when the
/// frame is still CFA-encoded and will be debayered afterwards.
pub fn bad_pixel_map_bayer(
    pixels: &[f32],
    width: usize,
    sig_low: f32,
    sig_high: f32,
) -> (Vec<usize>, statistics::Stats) {
    detect_bad_pixels(pixels, width, sig_low, sig_high, &NEIGHBORS_BAYER)
}

fn detect_bad_pixels(
    pixels: &[f32],
    width: usize,
    sig_low: f32,
    sig_high: f32,
    neighbors: &[(i32, i32)],
) -> (Vec<usize>, statistics::Stats) {
    let height = pixels.len() / width;
    let margin = neighbors.iter().map(|&(dx, dy)| dx.abs().max(dy.abs())).max().unwrap() as usize;
    if width <= 2 * margin || height <= 2 * margin {
        return (Vec::new(), statistics::Stats::default());
    }

    // Difference of each interior pixel from its neighbor median
    let mut diffs = vec![0.0f32; pixels.len()];
    parallel::par_rows_mut_auto(&mut diffs, width).for_each(|(y_start, chunk)| {
        let mut scratch = Vec::with_capacity(neighbors.len());
        let rows = chunk.len() / width;
        for r in 0..rows {
            let y = y_start + r;
            if y < margin || y >= height - margin {
                continue;
            }
            for x in margin..width - margin {
                scratch.clear();
                for &(dx, dy) in neighbors {
                    let nx = (x as i32 + dx) as usize;
                    let ny = (y as i32 + dy) as usize;
                    scratch.push(pixels[ny * width + nx]);
                }
                let local_median = math::median_f32_mut(&mut scratch);
                chunk[r * width + x] = pixels[y * width + x] - local_median;
            }
        }
    });

    let diff_stats = statistics::basic_stats(&diffs);
    let low = diff_stats.mean - sig_low * diff_stats.stddev;
    let high = diff_stats.mean + sig_high * diff_stats.stddev;

    let bad: Vec<usize> = diffs
        .par_iter()
        .enumerate()
        .filter(|&(i, &d)| {
            let x = i % width;
            let y = i / width;
            x >= margin
                && x < width - margin
                && y >= margin
                && y < height - margin
                && (d < low || d > high)
        })
        .map(|(i, _)| i)
        .collect();

    (bad, diff_stats)
}

/// Repair flagged pixels in place with the median of their 8-neighborhood.
pub fn repair_bad_pixels(pixels: &mut [f32], width: usize, bad: &[usize]) {
    repair_with_neighbors(pixels, width, bad, &NEIGHBORS_8);
}

/// Bayer-aware repair using like-colored neighbors only.
pub fn repair_bad_pixels_bayer(pixels: &mut [f32], width: usize, bad: &[usize]) {
    repair_with_neighbors(pixels, width, bad, &NEIGHBORS_BAYER);
}

fn repair_with_neighbors(
    pixels: &mut [f32],
    width: usize,
    bad: &[usize],
    neighbors: &[(i32, i32)],
) {
    let height = pixels.len() / width;

    // Sparse median filter: compute replacements against the original data,
    // then apply, so repaired pixels don't feed each other.
    let replacements: Vec<(usize, f32)> = bad
        .par_iter()
        .map(|&idx| {
            let x = (idx % width) as i32;
            let y = (idx / width) as i32;
            let mut values = Vec::with_capacity(neighbors.len());
            for &(dx, dy) in neighbors {
                let nx = x + dx;
                let ny = y + dy;
                if nx >= 0 && ny >= 0 && (nx as usize) < width && (ny as usize) < height {
                    values.push(pixels[ny as usize * width + nx as usize]);
                }
            }
            let replacement = if values.is_empty() {
                pixels[idx]
            } else {
                math::median_f32_mut(&mut values)
            };
            (idx, replacement)
        })
        .collect();

    for (idx, value) in replacements {
        pixels[idx] = value;
    }
}

// ============================================================================
// Binning
// ============================================================================

/// Sum N×N pixel blocks into single pixels, producing a ⌊W/N⌋×⌊H/N⌋ image.
/// Partial blocks on the right and bottom edges are discarded.
pub fn bin_nxn(image: &FitsImage, n: usize) -> FitsImage {
    assert!(n >= 1, "binning factor must be at least 1");
    let width = image.width();
    let height = image.height();
    let out_width = width / n;
    let out_height = height / n;
    assert!(out_width > 0 && out_height > 0, "image smaller than bin size");

    let mut out = vec![0.0f32; out_width * out_height];
    parallel::par_rows_mut_auto(&mut out, out_width).for_each(|(y_start, chunk)| {
        let rows = chunk.len() / out_width;
        for r in 0..rows {
            let oy = y_start + r;
            for ox in 0..out_width {
                let mut sum = 0.0f32;
                for dy in 0..n {
                    for dx in 0..n {
                        sum += image.pixels[(oy * n + dy) * width + ox * n + dx];
                    }
                }
                chunk[r * out_width + ox] = sum;
            }
        }
    });

    let mut binned = FitsImage::new(image.id, out_width, out_height, out);
    binned.bitpix = image.bitpix;
    binned.bzero = image.bzero;
    binned.exposure = image.exposure;
    binned.header = image.header.clone();
    binned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtract_dark() {
        let mut light = FitsImage::new(0, 2, 2, vec![100.0, 200.0, 150.0, 250.0]);
        let dark = FitsImage::new(-1, 2, 2, vec![10.0, 20.0, 15.0, 25.0]);
        subtract_dark(&mut light, &dark).unwrap();
        assert_eq!(light.pixels, vec![90.0, 180.0, 135.0, 225.0]);
    }

    #[test]
    fn test_subtract_dark_size_mismatch() {
        let mut light = FitsImage::new(0, 2, 2, vec![0.0; 4]);
        let dark = FitsImage::new(-1, 3, 3, vec![0.0; 9]);
        let err = subtract_dark(&mut light, &dark).unwrap_err();
        assert!(matches!(err, FrameError::SizeMismatch { kind: "dark", .. }));
    }

    #[test]
    fn test_divide_flat_normalized_by_mean() {
        let mut light = FitsImage::new(0, 2, 2, vec![100.0, 200.0, 150.0, 250.0]);
        let flat = FitsImage::new(-2, 2, 2, vec![0.8, 1.0, 1.2, 1.0]);
        divide_flat(&mut light, &flat).unwrap();
        // flat mean = 1.0
        assert!((light.pixels[0] - 125.0).abs() < 0.01);
        assert!((light.pixels[1] - 200.0).abs() < 0.01);
        assert!((light.pixels[2] - 125.0).abs() < 0.01);
        assert!((light.pixels[3] - 250.0).abs() < 0.01);
    }

    #[test]
    fn test_bad_pixel_detected_and_repaired() {
        let width = 9;
        let mut pixels = vec![10.0f32; width * width];
        // mild texture so stddev is nonzero
        for (i, p) in pixels.iter_mut().enumerate() {
            *p += (i % 3) as f32 * 0.1;
        }
        let hot_idx = 4 * width + 4;
        pixels[hot_idx] = 1000.0;

        let (bad, _) = bad_pixel_map(&pixels, width, 3.0, 3.0);
        assert!(bad.contains(&hot_idx), "hot pixel not flagged: {bad:?}");

        let neighborhood_max = NEIGHBORS_8
            .iter()
            .map(|&(dx, dy)| pixels[((4 + dy) * width as i32 + 4 + dx) as usize])
            .fold(f32::MIN, f32::max);

        repair_bad_pixels(&mut pixels, width, &bad);
        assert!(pixels[hot_idx] <= neighborhood_max);
        assert!(pixels[hot_idx] >= 10.0);
    }

    #[test]
    fn test_cold_pixel_detected() {
        let width = 9;
        let mut pixels = vec![100.0f32; width * width];
        for (i, p) in pixels.iter_mut().enumerate() {
            *p += (i % 5) as f32 * 0.1;
        }
        let cold_idx = 3 * width + 5;
        pixels[cold_idx] = 0.0;

        let (bad, _) = bad_pixel_map(&pixels, width, 3.0, 3.0);
        assert!(bad.contains(&cold_idx));
    }

    #[test]
    fn test_uniform_image_has_no_bad_pixels() {
        let width = 8;
        let pixels = vec![5.0f32; width * width];
        let (bad, stats) = bad_pixel_map(&pixels, width, 3.0, 5.0);
        assert!(bad.is_empty());
        assert_eq!(stats.stddev, 0.0);
    }

    #[test]
    fn test_repair_stays_inside_neighborhood_range() {
        // Invariant: repair never moves a pixel outside the min/max of its
        // 3x3 neighborhood.
        let width = 5;
        let pixels_orig: Vec<f32> = (0..25).map(|v| v as f32).collect();
        let mut pixels = pixels_orig.clone();
        let bad = vec![12usize];
        repair_bad_pixels(&mut pixels, width, &bad);

        let neighbors: Vec<f32> = NEIGHBORS_8
            .iter()
            .map(|&(dx, dy)| pixels_orig[((2 + dy) * 5 + 2 + dx) as usize])
            .collect();
        let min = neighbors.iter().copied().fold(f32::MAX, f32::min);
        let max = neighbors.iter().copied().fold(f32::MIN, f32::max);
        assert!(pixels[12] >= min && pixels[12] <= max);
    }

    #[test]
    fn test_bayer_repair_uses_like_colored_neighbors() {
        // 9x9 CFA mosaic: even columns 100, odd columns 10 (two "colors")
        let width = 9;
        let mut pixels = vec![0.0f32; width * width];
        for y in 0..width {
            for x in 0..width {
                pixels[y * width + x] = if x % 2 == 0 { 100.0 } else { 10.0 };
            }
        }
        let idx = 4 * width + 4; // even column, value 100
        pixels[idx] = 5000.0;

        repair_bad_pixels_bayer(&mut pixels, width, &[idx]);
        // Like-colored neighbors are all 100; plain 8-neighborhood would mix in 10s
        assert_eq!(pixels[idx], 100.0);
    }

    #[test]
    fn test_bin_2x2_sums_blocks() {
        let image = FitsImage::new(
            0,
            4,
            4,
            vec![
                1.0, 2.0, 3.0, 4.0, //
                5.0, 6.0, 7.0, 8.0, //
                9.0, 10.0, 11.0, 12.0, //
                13.0, 14.0, 15.0, 16.0,
            ],
        );
        let binned = bin_nxn(&image, 2);
        assert_eq!(binned.naxisn, vec![2, 2]);
        assert_eq!(binned.pixels, vec![14.0, 22.0, 46.0, 54.0]);
    }

    #[test]
    fn test_bin_discards_partial_blocks() {
        let image = FitsImage::new(0, 5, 5, vec![1.0; 25]);
        let binned = bin_nxn(&image, 2);
        assert_eq!(binned.naxisn, vec![2, 2]);
        assert_eq!(binned.pixels, vec![4.0; 4]);
    }

    #[test]
    fn test_bin_1x1_is_identity() {
        let image = FitsImage::new(0, 3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let binned = bin_nxn(&image, 1);
        assert_eq!(binned.pixels, image.pixels);
    }
}
