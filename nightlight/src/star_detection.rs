//! Star detection: local-maximum candidates above a robust threshold,
//! flux-weighted centroids, and half-flux radius measurement.

use glam::Vec2;
use rayon::prelude::*;

use crate::calibration;
use crate::image::FitsImage;

/// A detected star in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    /// Sub-pixel X of the flux centroid.
    pub x: f32,
    /// Sub-pixel Y of the flux centroid.
    pub y: f32,
    /// Integrated flux above background.
    pub flux: f32,
    /// Half-flux radius in pixels.
    pub hfr: f32,
}

impl Star {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

/// Detect stars and measure the mean half-flux radius.
///
/// `location`/`scale` are the frame's robust background statistics; the
/// detection threshold is `location + star_sig·scale`. A positive
/// `star_bp_sig` first masks pixels deviating that many sigmas from their
/// local median, so isolated hot pixels don't masquerade as stars; zero or
/// negative skips the mask.
pub fn find_stars(
    pixels: &[f32],
    width: usize,
    location: f32,
    scale: f32,
    star_sig: f32,
    star_bp_sig: f32,
    star_radius: usize,
) -> (Vec<Star>, f32) {
    let height = pixels.len() / width;
    if width < 3 || height < 3 {
        return (Vec::new(), 0.0);
    }

    // Optional bad-pixel mask
    let mask = if star_bp_sig > 0.0 {
        let (bad, _) = calibration::bad_pixel_map(pixels, width, star_bp_sig, star_bp_sig);
        let mut mask = vec![false; pixels.len()];
        for idx in bad {
            mask[idx] = true;
        }
        Some(mask)
    } else {
        None
    };

    let threshold = location + star_sig * scale;

    // Local-maximum candidates above threshold
    let mut candidates: Vec<(usize, usize, f32)> = (1..height - 1)
        .into_par_iter()
        .flat_map_iter(|y| {
            let mask = &mask;
            (1..width - 1).filter_map(move |x| {
                let idx = y * width + x;
                let v = pixels[idx];
                if v.is_nan() || v < threshold {
                    return None;
                }
                if let Some(mask) = mask
                    && mask[idx]
                {
                    return None;
                }
                let strictly_above = |nx: usize, ny: usize| {
                    let n = pixels[ny * width + nx];
                    n.is_nan() || v > n
                };
                let is_max = strictly_above(x - 1, y - 1)
                    && strictly_above(x, y - 1)
                    && strictly_above(x + 1, y - 1)
                    && strictly_above(x - 1, y)
                    && strictly_above(x + 1, y)
                    && strictly_above(x - 1, y + 1)
                    && strictly_above(x, y + 1)
                    && strictly_above(x + 1, y + 1);
                is_max.then_some((x, y, v))
            })
        })
        .collect();

    // Brightest first, so overlap rejection keeps the dominant peak
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());

    let mut stars: Vec<Star> = Vec::new();
    let min_sep_sq = (star_radius * star_radius) as f32;

    for (cx, cy, _) in candidates {
        let too_close = stars.iter().any(|s| {
            let dx = s.x - cx as f32;
            let dy = s.y - cy as f32;
            dx * dx + dy * dy < min_sep_sq
        });
        if too_close {
            continue;
        }

        // First pass centered on the pixel, second on the refined centroid
        let Some(first) =
            measure_disk(pixels, width, height, cx as f32, cy as f32, star_radius, location)
        else {
            continue;
        };
        let Some(star) =
            measure_disk(pixels, width, height, first.x, first.y, star_radius, location)
        else {
            continue;
        };
        if star.hfr > star_radius as f32 {
            continue;
        }
        stars.push(star);
    }

    let hfr = if stars.is_empty() {
        0.0
    } else {
        stars.iter().map(|s| s.hfr).sum::<f32>() / stars.len() as f32
    };
    (stars, hfr)
}

/// Integrate a disk around (cx, cy): flux-weighted centroid and HFR, with
/// weights equal to the pixel value above background. Returns None when the
/// flux collapses.
fn measure_disk(
    pixels: &[f32],
    width: usize,
    height: usize,
    cx: f32,
    cy: f32,
    radius: usize,
    background: f32,
) -> Option<Star> {
    let r = radius as i32;
    let r_sq = (radius * radius) as f32;
    let x0 = (cx.round() as i32 - r).max(0);
    let x1 = (cx.round() as i32 + r).min(width as i32 - 1);
    let y0 = (cy.round() as i32 - r).max(0);
    let y1 = (cy.round() as i32 + r).min(height as i32 - 1);

    let mut flux = 0.0f32;
    let mut sum_x = 0.0f32;
    let mut sum_y = 0.0f32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy > r_sq {
                continue;
            }
            let v = pixels[y as usize * width + x as usize];
            if v.is_nan() || v <= background {
                continue;
            }
            let w = v - background;
            flux += w;
            sum_x += w * x as f32;
            sum_y += w * y as f32;
        }
    }
    if flux <= 0.0 {
        return None;
    }

    let centroid_x = sum_x / flux;
    let centroid_y = sum_y / flux;

    // HFR: flux-weighted mean distance from the centroid
    let mut weighted_dist = 0.0f32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy > r_sq {
                continue;
            }
            let v = pixels[y as usize * width + x as usize];
            if v.is_nan() || v <= background {
                continue;
            }
            let w = v - background;
            let ddx = x as f32 - centroid_x;
            let ddy = y as f32 - centroid_y;
            weighted_dist += w * (ddx * ddx + ddy * ddy).sqrt();
        }
    }

    Some(Star {
        x: centroid_x,
        y: centroid_y,
        flux,
        hfr: weighted_dist / flux,
    })
}

// ============================================================================
// Star mask rendering
// ============================================================================

/// Boolean mask of pixels inside `factor × hfr` disks around each star.
pub fn star_mask(stars: &[Star], width: usize, height: usize, factor: f32) -> Vec<bool> {
    let mut mask = vec![false; width * height];
    for star in stars {
        let radius = (star.hfr * factor).max(1.0);
        let r_sq = radius * radius;
        let x0 = ((star.x - radius).floor() as i32).max(0);
        let x1 = ((star.x + radius).ceil() as i32).min(width as i32 - 1);
        let y0 = ((star.y - radius).floor() as i32).max(0);
        let y1 = ((star.y + radius).ceil() as i32).min(height as i32 - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let dx = x as f32 - star.x;
                let dy = y as f32 - star.y;
                if dx * dx + dy * dy <= r_sq {
                    mask[y as usize * width + x as usize] = true;
                }
            }
        }
    }
    mask
}

/// Render detected stars as unit-intensity disks of `factor × hfr`,
/// for the `-stars` diagnostic output.
pub fn show_stars(image: &FitsImage, factor: f32) -> FitsImage {
    let width = image.width();
    let height = image.height();
    let mask = star_mask(&image.stars, width, height, factor);
    let pixels = mask.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect();

    let mut out = FitsImage::new(image.id, width, height, pixels);
    out.header = image.header.clone();
    out
}
