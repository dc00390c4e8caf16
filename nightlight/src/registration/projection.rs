//! Resampling of a frame onto the reference grid.

use glam::DVec2;

use crate::common::parallel;
use crate::image::FitsImage;
use crate::registration::transform::Transform2D;
use rayon::prelude::*;

/// Sample with bounds checking; out-of-bounds positions yield `border`.
#[inline]
fn sample_pixel(pixels: &[f32], width: usize, height: usize, x: i32, y: i32, border: f32) -> f32 {
    if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 {
        border
    } else {
        pixels[y as usize * width + x as usize]
    }
}

/// Bilinear interpolation at (x, y).
///
/// Integer positions return the pixel value exactly, so an identity
/// projection is pointwise identical to its input, NaN pixels included.
#[inline]
fn interpolate_bilinear(
    pixels: &[f32],
    width: usize,
    height: usize,
    x: f32,
    y: f32,
    border: f32,
) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    if fx == 0.0 && fy == 0.0 {
        return sample_pixel(pixels, width, height, x0, y0, border);
    }

    let p00 = sample_pixel(pixels, width, height, x0, y0, border);
    let p10 = sample_pixel(pixels, width, height, x0 + 1, y0, border);
    let p01 = sample_pixel(pixels, width, height, x0, y0 + 1, border);
    let p11 = sample_pixel(pixels, width, height, x0 + 1, y0 + 1, border);

    let top = p00 + fx * (p10 - p00);
    let bottom = p01 + fx * (p11 - p01);
    top + fy * (bottom - top)
}

/// Project a frame into the reference grid.
///
/// For every destination pixel (x, y) of the reference grid, the source
/// position is `transform.apply((x, y))` in the frame's native coordinates;
/// the sample is taken by bilinear interpolation with `oob_fill` outside the
/// frame. The result carries the reference dimensions and an identity
/// transform; statistics and stars are left for the caller to recompute.
pub fn project(
    image: &FitsImage,
    ref_naxisn: &[usize],
    transform: Transform2D,
    oob_fill: f32,
) -> FitsImage {
    let src_width = image.width();
    let src_height = image.height();
    let dst_width = ref_naxisn[0];
    let dst_height = ref_naxisn[1];

    let mut out = vec![0.0f32; dst_width * dst_height];
    parallel::par_rows_mut_auto(&mut out, dst_width).for_each(|(y_start, chunk)| {
        let rows = chunk.len() / dst_width;
        for r in 0..rows {
            let y = y_start + r;
            for x in 0..dst_width {
                let src = transform.apply(DVec2::new(x as f64, y as f64));
                chunk[r * dst_width + x] = interpolate_bilinear(
                    &image.pixels,
                    src_width,
                    src_height,
                    src.x as f32,
                    src.y as f32,
                    oob_fill,
                );
            }
        }
    });

    let mut projected = FitsImage::new(image.id, dst_width, dst_height, out);
    projected.bitpix = image.bitpix;
    projected.bzero = image.bzero;
    projected.exposure = image.exposure;
    projected.header = image.header.clone();
    projected.residual = image.residual;
    projected
}
