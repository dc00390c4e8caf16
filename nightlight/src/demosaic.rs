//! Bilinear debayering of color-filter-array frames.
//!
//! Input is a single channel of CFA-encoded pixels; output is one chosen
//! color plane at full resolution. Values at sites of the requested color
//! are copied exactly; other sites average their nearest same-colored
//! neighbors, which for a Bayer mosaic is the classic bilinear rule
//! (left/right or up/down pairs for R/B at green sites, four diagonals for
//! R at blue sites and vice versa, four axis neighbors for G).

use crate::common::parallel;
use crate::error::FrameError;
use rayon::prelude::*;

/// Bayer color filter array orders, by the color of the top-left 2×2 quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfaPattern {
    #[default]
    Rggb,
    Grbg,
    Gbrg,
    Bggr,
}

impl CfaPattern {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "RGGB" => Some(CfaPattern::Rggb),
            "GRBG" => Some(CfaPattern::Grbg),
            "GBRG" => Some(CfaPattern::Gbrg),
            "BGGR" => Some(CfaPattern::Bggr),
            _ => None,
        }
    }

    /// Filter color at mosaic position (x, y).
    #[inline]
    pub fn color_at(self, x: usize, y: usize) -> CfaColor {
        let quad = match self {
            CfaPattern::Rggb => [CfaColor::R, CfaColor::G, CfaColor::G, CfaColor::B],
            CfaPattern::Grbg => [CfaColor::G, CfaColor::R, CfaColor::B, CfaColor::G],
            CfaPattern::Gbrg => [CfaColor::G, CfaColor::B, CfaColor::R, CfaColor::G],
            CfaPattern::Bggr => [CfaColor::B, CfaColor::G, CfaColor::G, CfaColor::R],
        };
        quad[(y & 1) * 2 + (x & 1)]
    }
}

/// One of the three CFA filter colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaColor {
    R,
    G,
    B,
}

impl CfaColor {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_uppercase().as_str() {
            "R" => Some(CfaColor::R),
            "G" => Some(CfaColor::G),
            "B" => Some(CfaColor::B),
            _ => None,
        }
    }
}

/// Extract one color plane from a CFA mosaic by bilinear interpolation.
///
/// Returns a full-resolution `width × height` plane.
pub fn debayer_bilinear(
    pixels: &[f32],
    width: usize,
    channel: CfaColor,
    cfa: CfaPattern,
    frame_id: i32,
) -> Result<Vec<f32>, FrameError> {
    if width < 2 || pixels.len() % width != 0 || pixels.len() / width < 2 {
        return Err(FrameError::Other {
            id: frame_id,
            message: format!(
                "cannot debayer {}x{} frame",
                width,
                pixels.len().checked_div(width).unwrap_or(0)
            ),
        });
    }
    let height = pixels.len() / width;

    let mut out = vec![0.0f32; pixels.len()];
    parallel::par_rows_mut_auto(&mut out, width).for_each(|(y_start, chunk)| {
        let rows = chunk.len() / width;
        for r in 0..rows {
            let y = y_start + r;
            for x in 0..width {
                chunk[r * width + x] = if cfa.color_at(x, y) == channel {
                    pixels[y * width + x]
                } else {
                    interpolate_site(pixels, width, height, x, y, channel, cfa)
                };
            }
        }
    });

    Ok(out)
}

/// Average the nearest same-colored neighbors of a site.
#[inline]
fn interpolate_site(
    pixels: &[f32],
    width: usize,
    height: usize,
    x: usize,
    y: usize,
    channel: CfaColor,
    cfa: CfaPattern,
) -> f32 {
    const OFFSETS: [(i32, i32); 8] = [
        (0, -1),
        (0, 1),
        (-1, 0),
        (1, 0),
        (-1, -1),
        (1, -1),
        (-1, 1),
        (1, 1),
    ];

    let mut sum = 0.0f32;
    let mut count = 0u32;
    for (dx, dy) in OFFSETS {
        let nx = x as i32 + dx;
        let ny = y as i32 + dy;
        if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
            continue;
        }
        let (nx, ny) = (nx as usize, ny as usize);
        if cfa.color_at(nx, ny) == channel {
            sum += pixels[ny * width + nx];
            count += 1;
        }
    }
    if count == 0 { 0.0 } else { sum / count as f32 }
}
