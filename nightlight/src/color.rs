//! Color-space conversions and color operations on planar RGB images.
//!
//! Two working spaces, both stored in place in the three planes:
//! linear CIE xyY (planes x, y, Y) for luminance work, and nonlinear CIE
//! HCL (planes H in degrees, C, L in [0,1]) for chroma/hue work. The HCL
//! conversion uses go-colorful's matrices, D65 white point and Lab scaling,
//! including the final RGB clamp, so numerical output matches that library.
//! Per-pixel conversion math runs in f64 for the same reason.

use rayon::prelude::*;
use tracing::info;

use crate::image::FitsImage;
use crate::math::statistics::{self, LsEstimator};

// sRGB linear RGB <-> XYZ (D65) matrices.
const RGB_TO_XYZ: [[f64; 3]; 3] = [
    [0.412_390_799_265_959_34, 0.357_584_339_383_878, 0.180_480_788_401_834_3],
    [0.212_639_005_871_510_27, 0.715_168_678_767_756, 0.072_192_315_360_733_71],
    [0.019_330_818_715_591_82, 0.119_194_779_794_625_98, 0.950_532_152_249_660_7],
];

const XYZ_TO_RGB: [[f64; 3]; 3] = [
    [3.240_969_941_904_521_4, -1.537_383_177_570_093_5, -0.498_610_760_293_003_4],
    [-0.969_243_636_280_879_6, 1.875_967_501_507_720_2, 0.041_555_057_407_175_59],
    [0.055_630_079_696_993_66, -0.203_976_958_888_976_52, 1.056_971_514_242_878_6],
];

/// D65 reference white.
const WHITE: [f64; 3] = [0.95047, 1.0, 1.08883];

/// D65 chromaticity, used for zero-energy pixels in xyY.
const WHITE_XY: (f64, f64) = (0.3127, 0.3290);

#[inline]
fn mat_mul(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// CIE Lab companding function.
#[inline]
fn lab_f(t: f64) -> f64 {
    const DELTA3: f64 = 6.0 * 6.0 * 6.0 / (29.0 * 29.0 * 29.0);
    if t > DELTA3 {
        t.cbrt()
    } else {
        t / (3.0 * (6.0 / 29.0) * (6.0 / 29.0)) + 4.0 / 29.0
    }
}

#[inline]
fn lab_f_inv(t: f64) -> f64 {
    const DELTA: f64 = 6.0 / 29.0;
    if t > DELTA {
        t * t * t
    } else {
        3.0 * DELTA * DELTA * (t - 4.0 / 29.0)
    }
}

/// Apply a per-pixel conversion across the three planes in parallel.
fn convert_planes<F>(image: &mut FitsImage, f: F)
where
    F: Fn([f64; 3]) -> [f64; 3] + Sync,
{
    assert!(image.is_rgb(), "color conversion needs a 3-channel image");
    let plane = image.plane_len();
    let (p0, rest) = image.pixels.split_at_mut(plane);
    let (p1, p2) = rest.split_at_mut(plane);

    p0.par_iter_mut()
        .zip(p1.par_iter_mut())
        .zip(p2.par_iter_mut())
        .for_each(|((a, b), c)| {
            let out = f([*a as f64, *b as f64, *c as f64]);
            *a = out[0] as f32;
            *b = out[1] as f32;
            *c = out[2] as f32;
        });
}

impl FitsImage {
    // ------------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------------

    /// Convert linear RGB planes to linear CIE xyY in place.
    pub fn to_xyy(&mut self) {
        convert_planes(self, |[r, g, b]| {
            let [x, y, z] = mat_mul(&RGB_TO_XYZ, [r, g, b]);
            let sum = x + y + z;
            if sum == 0.0 {
                [WHITE_XY.0, WHITE_XY.1, 0.0]
            } else {
                [x / sum, y / sum, y]
            }
        });
        self.invalidate_keep_stars();
    }

    /// Convert linear CIE xyY planes back to linear RGB in place.
    pub fn xyy_to_rgb(&mut self) {
        convert_planes(self, |[cx, cy, cap_y]| {
            if cy == 0.0 {
                return [0.0, 0.0, 0.0];
            }
            let x = cx * cap_y / cy;
            let z = (1.0 - cx - cy) * cap_y / cy;
            mat_mul(&XYZ_TO_RGB, [x, cap_y, z])
        });
        self.invalidate_keep_stars();
    }

    /// Convert linear RGB planes to nonlinear CIE HCL in place
    /// (H in degrees, C and L in [0, 1]).
    pub fn rgb_to_hcl(&mut self) {
        convert_planes(self, |[r, g, b]| {
            let [x, y, z] = mat_mul(&RGB_TO_XYZ, [r, g, b]);
            let fx = lab_f(x / WHITE[0]);
            let fy = lab_f(y / WHITE[1]);
            let fz = lab_f(z / WHITE[2]);
            let l = 1.16 * fy - 0.16;
            let a = 5.0 * (fx - fy);
            let lab_b = 2.0 * (fy - fz);

            let h = lab_b.atan2(a).to_degrees().rem_euclid(360.0);
            let c = (a * a + lab_b * lab_b).sqrt();
            [h, c, l]
        });
        self.invalidate_keep_stars();
    }

    /// Convert nonlinear CIE HCL planes back to linear RGB in place,
    /// clamping each channel into [0, 1] as the reference space does.
    pub fn hcl_to_rgb(&mut self) {
        convert_planes(self, |[h, c, l]| {
            let h_rad = h.to_radians();
            let a = c * h_rad.cos();
            let lab_b = c * h_rad.sin();

            let fy = (l + 0.16) / 1.16;
            let x = WHITE[0] * lab_f_inv(fy + a / 5.0);
            let y = WHITE[1] * lab_f_inv(fy);
            let z = WHITE[2] * lab_f_inv(fy - lab_b / 2.0);

            let rgb = mat_mul(&XYZ_TO_RGB, [x, y, z]);
            [
                rgb[0].clamp(0.0, 1.0),
                rgb[1].clamp(0.0, 1.0),
                rgb[2].clamp(0.0, 1.0),
            ]
        });
        self.invalidate_keep_stars();
    }

    /// Drop statistics but keep star detections: color conversions move
    /// pixel values, not star positions.
    fn invalidate_keep_stars(&mut self) {
        self.stats = None;
    }

    // ------------------------------------------------------------------------
    // Color operations
    // ------------------------------------------------------------------------

    /// Three rounds of black/white point balancing. Skipped (with a log
    /// line) when no stars are known, since the white point solve needs
    /// star colors.
    pub fn auto_balance_colors(&mut self, estimator: LsEstimator) {
        if self.stars.is_empty() {
            info!("skipping black and white point adjustment, zero stars detected");
            return;
        }
        info!(
            "setting black point so histogram peaks align and white point so median star color becomes neutral"
        );
        for _ in 0..3 {
            self.set_black_white_points(estimator);
        }
    }

    /// Solve one linear map per channel so histogram peaks align on their
    /// mean (black point) and the median star color becomes neutral gray
    /// (white point).
    pub fn set_black_white_points(&mut self, estimator: LsEstimator) {
        assert!(self.is_rgb(), "black/white point balance needs RGB");
        let plane = self.plane_len();
        let width = self.width();

        let mut locations = [0.0f32; 3];
        let mut star_medians = [0.0f32; 3];
        for c in 0..3 {
            let ch = &self.pixels[c * plane..(c + 1) * plane];
            let stats = statistics::extended_stats(ch, width, estimator);
            locations[c] = stats.location;

            let height = plane / width;
            let mut star_values: Vec<f32> = self
                .stars
                .iter()
                .map(|s| {
                    let x = (s.x.round() as usize).min(width - 1);
                    let y = (s.y.round() as usize).min(height - 1);
                    ch[y * width + x]
                })
                .filter(|v| !v.is_nan())
                .collect();
            star_medians[c] = if star_values.is_empty() {
                f32::NAN
            } else {
                crate::math::median_f32_mut(&mut star_values)
            };
        }
        if star_medians.iter().any(|v| v.is_nan()) {
            return;
        }

        let target_loc = (locations[0] + locations[1] + locations[2]) / 3.0;
        let target_star = (star_medians[0] + star_medians[1] + star_medians[2]) / 3.0;

        for c in 0..3 {
            let span = star_medians[c] - locations[c];
            if span.abs() < 1e-6 {
                continue;
            }
            let alpha = (target_star - target_loc) / span;
            let beta = target_loc - alpha * locations[c];
            for v in self.channel_mut(c).iter_mut() {
                *v = alpha * *v + beta;
            }
        }
        self.stats = None;
    }

    /// Replace the Y plane of an xyY image with a luminance frame.
    pub fn apply_luminance(&mut self, lum: &FitsImage) {
        assert!(self.is_rgb());
        assert_eq!(
            lum.pixels.len(),
            self.plane_len(),
            "luminance plane size mismatch"
        );
        self.channel_mut(2).copy_from_slice(&lum.pixels);
        self.stats = None;
    }

    /// On HCL planes: force chroma to zero below `low` luminance and ramp
    /// it linearly up to full strength at `high`.
    pub fn neutralize_background(&mut self, low: f32, high: f32) {
        assert!(self.is_rgb());
        let (_, c_plane, l_plane) = self.rgb_planes_mut();
        c_plane
            .par_iter_mut()
            .zip(l_plane.par_iter())
            .for_each(|(c, &l)| {
                if l < low {
                    *c = 0.0;
                } else if l < high && high > low {
                    *c *= (l - low) / (high - low);
                }
            });
        self.stats = None;
    }

    /// On HCL planes: `C ← C^(1/gamma)` where luminance exceeds `threshold`.
    pub fn adjust_chroma(&mut self, gamma: f32, threshold: f32) {
        assert!(self.is_rgb());
        let inv_gamma = 1.0 / gamma;
        let (_, c_plane, l_plane) = self.rgb_planes_mut();
        c_plane
            .par_iter_mut()
            .zip(l_plane.par_iter())
            .for_each(|(c, &l)| {
                if l > threshold {
                    *c = c.powf(inv_gamma);
                }
            });
        self.stats = None;
    }

    /// On HCL planes: multiply chroma by `by` for hues inside `[from, to]`
    /// (wrapping modulo 360).
    pub fn adjust_chroma_for_hues(&mut self, from: f32, to: f32, by: f32) {
        assert!(self.is_rgb());
        let (h_plane, c_plane, _) = self.rgb_planes_mut();
        c_plane
            .par_iter_mut()
            .zip(h_plane.par_iter())
            .for_each(|(c, &h)| {
                if hue_in_range(h, from, to) {
                    *c *= by;
                }
            });
        self.stats = None;
    }

    /// On HCL planes: rotate hues inside `[from, to]` by `by` degrees.
    pub fn rotate_colors(&mut self, from: f32, to: f32, by: f32) {
        assert!(self.is_rgb());
        let (h_plane, _, _) = self.rgb_planes_mut();
        h_plane.par_iter_mut().for_each(|h| {
            if hue_in_range(*h, from, to) {
                *h = (*h + by).rem_euclid(360.0);
            }
        });
        self.stats = None;
    }

    /// Subtractive chromatic noise reduction of the green channel:
    /// `G ← min(G, amount·(R+B)/2 + (1−amount)·G)`.
    pub fn scnr(&mut self, amount: f32) {
        assert!(self.is_rgb());
        let (r_plane, g_plane, b_plane) = self.rgb_planes_mut();
        g_plane
            .par_iter_mut()
            .zip(r_plane.par_iter().zip(b_plane.par_iter()))
            .for_each(|(g, (&r, &b))| {
                let neutral = amount * 0.5 * (r + b) + (1.0 - amount) * *g;
                if neutral < *g {
                    *g = neutral;
                }
            });
        self.stats = None;
    }
}

// ============================================================================
// Color enhancement stage
// ============================================================================

/// Color enhancement parameters, flag-compatible with the CLI.
#[derive(Debug, Clone)]
pub struct ColorParams {
    /// Neutralize background chroma below this many sigmas; negative
    /// disables.
    pub neut_sigma_low: f32,
    /// Keep chroma above this many sigmas, interpolating in between.
    pub neut_sigma_high: f32,
    /// Chroma gamma for luminances above `chroma_sigma`; 1 disables.
    pub chroma_gamma: f32,
    pub chroma_sigma: f32,
    /// Chroma multiplier for hues in [`chroma_from`, `chroma_to`];
    /// 1 is the multiplicative identity and disables the step.
    pub chroma_by: f32,
    pub chroma_from: f32,
    pub chroma_to: f32,
    /// Hue rotation in degrees for hues in [`rot_from`, `rot_to`];
    /// 0 disables.
    pub rot_by: f32,
    pub rot_from: f32,
    pub rot_to: f32,
    /// SCNR amount in [0, 1]; 0 disables.
    pub scnr: f32,
}

impl Default for ColorParams {
    fn default() -> Self {
        Self {
            neut_sigma_low: -1.0,
            neut_sigma_high: -1.0,
            chroma_gamma: 1.0,
            chroma_sigma: 1.0,
            chroma_by: 1.0,
            chroma_from: 295.0,
            chroma_to: 40.0,
            rot_by: 0.0,
            rot_from: 100.0,
            rot_to: 190.0,
            scnr: 0.0,
        }
    }
}

impl std::fmt::Display for ColorParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "neutSigmaLow {:.2} neutSigmaHigh {:.2} chromaGamma {:.2} chromaSigma {:.2} chromaBy {:.2} chromaFrom {:.2} chromaTo {:.2} rotBy {:.2} rotFrom {:.2} rotTo {:.2} scnr {:.2}",
            self.neut_sigma_low,
            self.neut_sigma_high,
            self.chroma_gamma,
            self.chroma_sigma,
            self.chroma_by,
            self.chroma_from,
            self.chroma_to,
            self.rot_by,
            self.rot_from,
            self.rot_to,
            self.scnr
        )
    }
}

/// Chroma and hue enhancement in nonlinear CIE HCL, followed by SCNR on the
/// reconstructed RGB planes.
pub fn enhance_colors(image: &mut FitsImage, params: &ColorParams, estimator: LsEstimator) {
    let hcl_active = (params.neut_sigma_low >= 0.0 && params.neut_sigma_high >= 0.0)
        || params.chroma_gamma != 1.0
        || params.chroma_by != 1.0
        || params.rot_by != 0.0;

    if hcl_active {
        info!("converting image to nonlinear CIE HCL");
        image.rgb_to_hcl();

        if params.neut_sigma_low >= 0.0 && params.neut_sigma_high >= 0.0 {
            let (loc, scale) = statistics::luminance_loc_scale(&image.pixels, estimator);
            let low = loc + scale * params.neut_sigma_low;
            let high = loc + scale * params.neut_sigma_high;
            info!(
                "neutralizing background below {:.2}%, keeping color above {:.2}%",
                low * 100.0,
                high * 100.0
            );
            image.neutralize_background(low, high);
        }

        if params.chroma_gamma != 1.0 {
            let (loc, scale) = statistics::luminance_loc_scale(&image.pixels, estimator);
            let threshold = loc + scale * params.chroma_sigma;
            info!(
                "applying chroma gamma {:.2} above {:.2}%",
                params.chroma_gamma,
                threshold * 100.0
            );
            image.adjust_chroma(params.chroma_gamma, threshold);
        }

        if params.chroma_by != 1.0 {
            info!(
                "multiplying chroma by {:.4} for hues in [{}, {}]",
                params.chroma_by, params.chroma_from, params.chroma_to
            );
            image.adjust_chroma_for_hues(params.chroma_from, params.chroma_to, params.chroma_by);
        }

        if params.rot_by != 0.0 {
            info!(
                "rotating hues in [{}, {}] by {:.4}",
                params.rot_from, params.rot_to, params.rot_by
            );
            image.rotate_colors(params.rot_from, params.rot_to, params.rot_by);
        }

        info!("converting nonlinear CIE HCL back to linear RGB");
        image.hcl_to_rgb();
    }

    if params.scnr != 0.0 {
        info!("applying SCNR of {:.4}", params.scnr);
        image.scnr(params.scnr);
    }
}

/// Whether hue `h` lies in `[from, to]`, wrapping modulo 360.
fn hue_in_range(h: f32, from: f32, to: f32) -> bool {
    if from <= to {
        h >= from && h <= to
    } else {
        h >= from || h <= to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star_detection::Star;

    fn rgb_image(r: Vec<f32>, g: Vec<f32>, b: Vec<f32>, width: usize) -> FitsImage {
        let height = r.len() / width;
        let mut pixels = r;
        pixels.extend(g);
        pixels.extend(b);
        let mut img = FitsImage::new(0, width, height, vec![0.0; width * height]);
        img.naxisn = vec![width, height, 3];
        img.pixels = pixels;
        img
    }

    fn test_pattern() -> FitsImage {
        // values spread across [0.05, 0.95]
        let n = 64;
        let r: Vec<f32> = (0..n).map(|i| 0.05 + 0.9 * (i as f32 / (n - 1) as f32)).collect();
        let g: Vec<f32> = (0..n).map(|i| 0.95 - 0.9 * (i as f32 / (n - 1) as f32)).collect();
        let b: Vec<f32> = (0..n).map(|i| 0.05 + 0.45 * ((i % 8) as f32 / 7.0)).collect();
        rgb_image(r, g, b, 8)
    }

    #[test]
    fn test_xyy_roundtrip() {
        let original = test_pattern();
        let mut image = original.clone();
        image.to_xyy();
        image.xyy_to_rgb();
        for (a, b) in original.pixels.iter().zip(image.pixels.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_hcl_roundtrip() {
        let original = test_pattern();
        let mut image = original.clone();
        image.rgb_to_hcl();
        image.hcl_to_rgb();
        for (a, b) in original.pixels.iter().zip(image.pixels.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_xyy_luminance_plane_is_y() {
        // Equal-energy gray: Y equals the gray level
        let mut image = rgb_image(vec![0.5; 4], vec![0.5; 4], vec![0.5; 4], 2);
        image.to_xyy();
        let y = image.channel(2);
        for &v in y {
            assert!((v - 0.5).abs() < 1e-5);
        }
        // chromaticity of gray is the white point
        assert!((image.channel(0)[0] - 0.3127).abs() < 1e-3);
        assert!((image.channel(1)[0] - 0.3290).abs() < 1e-3);
    }

    #[test]
    fn test_hcl_gray_has_zero_chroma() {
        let mut image = rgb_image(vec![0.4; 4], vec![0.4; 4], vec![0.4; 4], 2);
        image.rgb_to_hcl();
        for &c in image.channel(1) {
            assert!(c.abs() < 1e-5);
        }
        // L of mid-gray sits between 0 and 1
        for &l in image.channel(2) {
            assert!(l > 0.5 && l < 0.8);
        }
    }

    #[test]
    fn test_hcl_red_hue() {
        let mut image = rgb_image(vec![1.0; 4], vec![0.0; 4], vec![0.0; 4], 2);
        image.rgb_to_hcl();
        // Pure red in Lab has hue near 40 degrees
        let h = image.channel(0)[0];
        assert!((h - 40.0).abs() < 5.0, "hue {h}");
    }

    #[test]
    fn test_apply_luminance_overwrites_y() {
        let mut image = test_pattern();
        image.to_xyy();
        let lum = FitsImage::new(1, 8, 8, vec![0.7; 64]);
        image.apply_luminance(&lum);
        assert_eq!(image.channel(2), &[0.7; 64][..]);
    }

    #[test]
    fn test_neutralize_background() {
        let h = vec![100.0; 4];
        let c = vec![0.2; 4];
        let l = vec![0.05, 0.15, 0.25, 0.5];
        let mut image = rgb_image(h, c, l, 2);
        image.neutralize_background(0.1, 0.3);

        let chroma = image.channel(1);
        assert_eq!(chroma[0], 0.0); // below low
        assert!((chroma[1] - 0.2 * 0.25).abs() < 1e-6); // quarter of the ramp
        assert!((chroma[2] - 0.2 * 0.75).abs() < 1e-6);
        assert_eq!(chroma[3], 0.2); // above high, untouched
    }

    #[test]
    fn test_adjust_chroma_thresholded() {
        let mut image = rgb_image(vec![0.0; 4], vec![0.25; 4], vec![0.1, 0.9, 0.1, 0.9], 2);
        image.adjust_chroma(2.0, 0.5);
        let chroma = image.channel(1);
        assert_eq!(chroma[0], 0.25);
        assert!((chroma[2] - 0.25).abs() < 1e-6);
        // C^(1/2) = 0.5 where L > 0.5
        assert!((chroma[1] - 0.5).abs() < 1e-6);
        assert!((chroma[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_adjust_chroma_for_hues_wrapping() {
        // range [300, 60] wraps through 0
        let h = vec![310.0, 20.0, 180.0, 59.9];
        let c = vec![0.1; 4];
        let mut image = rgb_image(h, c, vec![0.5; 4], 2);
        image.adjust_chroma_for_hues(300.0, 60.0, 2.0);
        let chroma = image.channel(1);
        assert!((chroma[0] - 0.2).abs() < 1e-6);
        assert!((chroma[1] - 0.2).abs() < 1e-6);
        assert!((chroma[2] - 0.1).abs() < 1e-6); // outside range
        assert!((chroma[3] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_rotate_colors() {
        let h = vec![100.0, 150.0, 200.0, 350.0];
        let mut image = rgb_image(h, vec![0.1; 4], vec![0.5; 4], 2);
        image.rotate_colors(100.0, 190.0, 30.0);
        let hues = image.channel(0);
        assert!((hues[0] - 130.0).abs() < 1e-4);
        assert!((hues[1] - 180.0).abs() < 1e-4);
        assert!((hues[2] - 200.0).abs() < 1e-4); // outside
        assert!((hues[3] - 350.0).abs() < 1e-4); // outside
    }

    #[test]
    fn test_scnr_reduces_green_only() {
        let mut image = rgb_image(vec![0.2; 4], vec![0.8; 4], vec![0.4; 4], 2);
        image.scnr(1.0);
        // full-strength SCNR: G = (R+B)/2 = 0.3
        for &g in image.channel(1) {
            assert!((g - 0.3).abs() < 1e-6);
        }
        // R and B untouched
        assert_eq!(image.channel(0), &[0.2; 4][..]);
        assert_eq!(image.channel(2), &[0.4; 4][..]);
    }

    #[test]
    fn test_scnr_never_raises_green() {
        let mut image = rgb_image(vec![0.9; 4], vec![0.1; 4], vec![0.9; 4], 2);
        image.scnr(1.0);
        for &g in image.channel(1) {
            assert!((g - 0.1).abs() < 1e-6, "SCNR must not brighten green");
        }
    }

    #[test]
    fn test_scnr_zero_amount_is_noop() {
        let mut image = test_pattern();
        let before = image.pixels.clone();
        image.scnr(0.0);
        assert_eq!(image.pixels, before);
    }

    #[test]
    fn test_set_black_white_points_aligns_channels() {
        // Three channels with different backgrounds and star levels; one
        // "star" pixel at (1,1) in each channel.
        let width = 16;
        let n = width * width;
        let make_plane = |bg: f32, star: f32| {
            let mut v: Vec<f32> = (0..n).map(|i| bg + 0.001 * ((i % 7) as f32 - 3.0)).collect();
            v[width + 1] = star;
            v
        };
        let mut image = rgb_image(
            make_plane(0.1, 0.8),
            make_plane(0.2, 0.7),
            make_plane(0.3, 0.6),
            width,
        );
        image.stars = vec![Star {
            x: 1.0,
            y: 1.0,
            flux: 1.0,
            hfr: 1.0,
        }];

        image.auto_balance_colors(LsEstimator::MedianMad);

        let width = 16;
        let star_r = image.channel(0)[width + 1];
        let star_g = image.channel(1)[width + 1];
        let star_b = image.channel(2)[width + 1];
        assert!((star_r - star_g).abs() < 0.01, "{star_r} vs {star_g}");
        assert!((star_g - star_b).abs() < 0.01, "{star_g} vs {star_b}");

        let bg_r = image.channel(0)[0];
        let bg_g = image.channel(1)[0];
        let bg_b = image.channel(2)[0];
        assert!((bg_r - bg_g).abs() < 0.02, "{bg_r} vs {bg_g}");
        assert!((bg_g - bg_b).abs() < 0.02, "{bg_g} vs {bg_b}");
    }

    #[test]
    fn test_auto_balance_skipped_without_stars() {
        let mut image = test_pattern();
        let before = image.pixels.clone();
        image.auto_balance_colors(LsEstimator::MedianMad);
        assert_eq!(image.pixels, before);
    }

    #[test]
    fn test_enhance_colors_defaults_are_noop() {
        let mut image = test_pattern();
        let before = image.pixels.clone();
        enhance_colors(&mut image, &ColorParams::default(), LsEstimator::MedianMad);
        assert_eq!(image.pixels, before);
    }

    #[test]
    fn test_enhance_colors_scnr_only_stays_in_rgb() {
        let mut image = rgb_image(vec![0.2; 4], vec![0.8; 4], vec![0.4; 4], 2);
        let params = ColorParams {
            scnr: 1.0,
            ..Default::default()
        };
        enhance_colors(&mut image, &params, LsEstimator::MedianMad);
        for &g in image.channel(1) {
            assert!((g - 0.3).abs() < 1e-6);
        }
        // R and B exactly untouched: no HCL round trip happened
        assert_eq!(image.channel(0), &[0.2; 4][..]);
    }

    #[test]
    fn test_enhance_colors_neutralizes_dim_chroma() {
        // Colorful dim background (with mild texture, so the luminance
        // scale is nonzero) and one bright star region
        let n = 256;
        let mut r: Vec<f32> = (0..n).map(|i| 0.05 + 0.002 * (i % 5) as f32).collect();
        let mut g = vec![0.02f32; n];
        let mut b = vec![0.08f32; n];
        for i in 0..8 {
            r[i] = 0.9;
            g[i] = 0.85;
            b[i] = 0.95;
        }
        let mut image = rgb_image(r, g, b, 16);

        let params = ColorParams {
            neut_sigma_low: 5.0,
            neut_sigma_high: 6.0,
            ..Default::default()
        };
        enhance_colors(&mut image, &params, LsEstimator::MedianMad);

        // Dim background pixels end up gray: R ≈ G ≈ B
        let (r, g, b) = (image.channel(0), image.channel(1), image.channel(2));
        for i in 16..n {
            assert!(
                (r[i] - g[i]).abs() < 0.01 && (g[i] - b[i]).abs() < 0.01,
                "background pixel {i} kept color: {} {} {}",
                r[i],
                g[i],
                b[i]
            );
        }
    }

    #[test]
    fn test_hue_in_range() {
        assert!(hue_in_range(50.0, 40.0, 60.0));
        assert!(!hue_in_range(70.0, 40.0, 60.0));
        assert!(hue_in_range(350.0, 295.0, 40.0));
        assert!(hue_in_range(20.0, 295.0, 40.0));
        assert!(!hue_in_range(180.0, 295.0, 40.0));
    }
}
