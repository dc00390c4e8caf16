//! Automatic background extraction.
//!
//! The image is partitioned into square cells; each cell gets a robust
//! (sigma-clipped median) background level computed from pixels that belong
//! to neither a star nor a NaN region. Optionally the brightest cells are
//! replaced by their neighbor median to reject lingering nebulosity. The
//! full-resolution background surface is rendered by bicubic (Catmull-Rom)
//! interpolation across the cell grid.

use crate::common::parallel;
use crate::math::{self, MAD_TO_SIGMA};
use rayon::prelude::*;

/// Grid-cell background model of a single frame.
#[derive(Debug, Clone)]
pub struct Background {
    width: usize,
    height: usize,
    grid: usize,
    cells_w: usize,
    cells_h: usize,
    cells: Vec<f32>,
}

impl Background {
    /// Build the cell model.
    ///
    /// `star_mask`, when present, marks pixels to treat as missing (inside
    /// detected stars). `sigma` is the clipping threshold for the per-cell
    /// robust location; `clip_cells` replaces that many brightest cells with
    /// their neighbor median.
    pub fn new(
        pixels: &[f32],
        star_mask: Option<&[bool]>,
        width: usize,
        grid: usize,
        sigma: f32,
        clip_cells: usize,
    ) -> Self {
        assert!(grid > 0, "grid size must be positive");
        assert!(width > 0 && pixels.len() % width == 0);
        if let Some(mask) = star_mask {
            assert_eq!(mask.len(), pixels.len(), "star mask size mismatch");
        }
        let height = pixels.len() / width;
        let cells_w = width.div_ceil(grid);
        let cells_h = height.div_ceil(grid);

        let mut cells = vec![f32::NAN; cells_w * cells_h];
        cells
            .par_iter_mut()
            .enumerate()
            .for_each(|(cell_idx, cell)| {
                let cx = cell_idx % cells_w;
                let cy = cell_idx / cells_w;
                let x0 = cx * grid;
                let y0 = cy * grid;
                let x1 = (x0 + grid).min(width);
                let y1 = (y0 + grid).min(height);

                let mut values = Vec::with_capacity(grid * grid);
                for y in y0..y1 {
                    for x in x0..x1 {
                        let idx = y * width + x;
                        if pixels[idx].is_nan() {
                            continue;
                        }
                        if let Some(mask) = star_mask
                            && mask[idx]
                        {
                            continue;
                        }
                        values.push(pixels[idx]);
                    }
                }
                if !values.is_empty() {
                    *cell = clipped_median(&mut values, sigma);
                }
            });

        // Cells with no usable pixels fall back to the global cell median
        let mut finite: Vec<f32> = cells.iter().copied().filter(|v| !v.is_nan()).collect();
        let fallback = if finite.is_empty() {
            0.0
        } else {
            math::median_f32_mut(&mut finite)
        };
        for cell in cells.iter_mut() {
            if cell.is_nan() {
                *cell = fallback;
            }
        }

        let mut background = Self {
            width,
            height,
            grid,
            cells_w,
            cells_h,
            cells,
        };
        if clip_cells > 0 {
            background.clip_brightest(clip_cells);
        }
        background
    }

    /// Replace the `count` brightest cells with the median of their
    /// neighboring cells.
    fn clip_brightest(&mut self, count: usize) {
        let mut order: Vec<usize> = (0..self.cells.len()).collect();
        order.sort_by(|&a, &b| self.cells[b].partial_cmp(&self.cells[a]).unwrap());

        let original = self.cells.clone();
        for &idx in order.iter().take(count.min(self.cells.len())) {
            let cx = (idx % self.cells_w) as i32;
            let cy = (idx / self.cells_w) as i32;
            let mut neighbors = Vec::with_capacity(8);
            for dy in -1..=1i32 {
                for dx in -1..=1i32 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = cx + dx;
                    let ny = cy + dy;
                    if nx >= 0
                        && ny >= 0
                        && (nx as usize) < self.cells_w
                        && (ny as usize) < self.cells_h
                    {
                        neighbors.push(original[ny as usize * self.cells_w + nx as usize]);
                    }
                }
            }
            if !neighbors.is_empty() {
                self.cells[idx] = math::median_f32_mut(&mut neighbors);
            }
        }
    }

    /// Cell value with clamped indices, for interpolation at the borders.
    #[inline]
    fn cell(&self, cx: i32, cy: i32) -> f32 {
        let cx = cx.clamp(0, self.cells_w as i32 - 1) as usize;
        let cy = cy.clamp(0, self.cells_h as i32 - 1) as usize;
        self.cells[cy * self.cells_w + cx]
    }

    /// Background level at a full-resolution pixel position.
    fn sample(&self, x: usize, y: usize) -> f32 {
        // Cell-space coordinate of the pixel relative to cell centers
        let gx = (x as f32 + 0.5) / self.grid as f32 - 0.5;
        let gy = (y as f32 + 0.5) / self.grid as f32 - 0.5;
        let cx0 = gx.floor() as i32;
        let cy0 = gy.floor() as i32;
        let fx = gx - cx0 as f32;
        let fy = gy - cy0 as f32;

        let wx = [
            bicubic_kernel(fx + 1.0),
            bicubic_kernel(fx),
            bicubic_kernel(fx - 1.0),
            bicubic_kernel(fx - 2.0),
        ];
        let wy = [
            bicubic_kernel(fy + 1.0),
            bicubic_kernel(fy),
            bicubic_kernel(fy - 1.0),
            bicubic_kernel(fy - 2.0),
        ];

        let mut sum = 0.0f32;
        for (j, &wyj) in wy.iter().enumerate() {
            let mut row = 0.0f32;
            for (i, &wxi) in wx.iter().enumerate() {
                row += wxi * self.cell(cx0 - 1 + i as i32, cy0 - 1 + j as i32);
            }
            sum += wyj * row;
        }
        sum
    }

    /// Render the full-resolution background surface.
    pub fn render(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.width * self.height];
        let width = self.width;
        parallel::par_rows_mut_auto(&mut out, width).for_each(|(y_start, chunk)| {
            let rows = chunk.len() / width;
            for r in 0..rows {
                let y = y_start + r;
                for x in 0..width {
                    chunk[r * width + x] = self.sample(x, y);
                }
            }
        });
        out
    }

    /// Subtract the background surface from `pixels` in place.
    pub fn subtract(&self, pixels: &mut [f32]) {
        assert_eq!(pixels.len(), self.width * self.height);
        let width = self.width;
        parallel::par_rows_mut_auto(pixels, width).for_each(|(y_start, chunk)| {
            let rows = chunk.len() / width;
            for r in 0..rows {
                let y = y_start + r;
                for x in 0..width {
                    chunk[r * width + x] -= self.sample(x, y);
                }
            }
        });
    }

    /// Raw cell values, row-major over the cell grid.
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }
}

/// Bicubic kernel (Catmull-Rom spline).
///
/// W(x) = (a+2)|x|³ − (a+3)|x|² + 1       for |x| ≤ 1
/// W(x) = a|x|³ − 5a|x|² + 8a|x| − 4a     for 1 < |x| < 2
/// with a = −0.5.
#[inline]
fn bicubic_kernel(x: f32) -> f32 {
    const A: f32 = -0.5;
    let abs_x = x.abs();
    if abs_x <= 1.0 {
        ((A + 2.0) * abs_x - (A + 3.0)) * abs_x * abs_x + 1.0
    } else if abs_x < 2.0 {
        ((A * abs_x - 5.0 * A) * abs_x + 8.0 * A) * abs_x - 4.0 * A
    } else {
        0.0
    }
}

/// Iterative sigma-clipped median of a cell's pixels.
fn clipped_median(values: &mut Vec<f32>, kappa: f32) -> f32 {
    let mut scratch = Vec::new();
    let mut median = math::median_f32_mut(values);
    if kappa <= 0.0 {
        return median;
    }
    for _ in 0..10 {
        let mad = math::mad_f32_with_scratch(values, median, &mut scratch);
        let sigma = mad * MAD_TO_SIGMA;
        if sigma < f32::EPSILON {
            break;
        }
        let lo = median - kappa * sigma;
        let hi = median + kappa * sigma;
        let before = values.len();
        values.retain(|&v| v >= lo && v <= hi);
        if values.len() < 3 || values.len() == before {
            break;
        }
        median = math::median_f32_mut(values);
    }
    median
}
