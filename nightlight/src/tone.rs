//! Tone curves on the luminance channel of an xyY image.

use rayon::prelude::*;
use tracing::{info, warn};

use crate::image::FitsImage;
use crate::math::statistics::{LsEstimator, luminance_loc_scale};

/// Tone curve parameters, flag-compatible with the CLI.
#[derive(Debug, Clone)]
pub struct ToneCurveParams {
    /// Histogram peak location target in percent for automatic curves;
    /// 0 disables.
    pub auto_loc: f32,
    /// Histogram peak scale target in percent for automatic curves;
    /// 0 disables.
    pub auto_scale: f32,
    /// Midtone value in multiples of scale; 0 disables.
    pub midtone: f32,
    /// Midtone black in multiples of scale below the location.
    pub mid_black: f32,
    /// Output gamma; 1 keeps linear data.
    pub gamma: f32,
    /// Post-peak gamma; 1 disables.
    pub pp_gamma: f32,
    /// Post-peak gamma starts this many scales above the location.
    pub pp_sigma: f32,
    /// Move the histogram peak to this percentage by rescaling black;
    /// 0 disables.
    pub scale_black: f32,
}

impl Default for ToneCurveParams {
    fn default() -> Self {
        Self {
            auto_loc: 10.0,
            auto_scale: 0.4,
            midtone: 0.0,
            mid_black: 2.0,
            gamma: 1.0,
            pp_gamma: 1.0,
            pp_sigma: 1.0,
            scale_black: 0.0,
        }
    }
}

impl std::fmt::Display for ToneCurveParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "autoLoc {:.2} autoScale {:.2} midtone {:.2} midBlack {:.2} gamma {:.2} ppGamma {:.2} ppSigma {:.2} scaleBlack {:.2}",
            self.auto_loc,
            self.auto_scale,
            self.midtone,
            self.mid_black,
            self.gamma,
            self.pp_gamma,
            self.pp_sigma,
            self.scale_black
        )
    }
}

impl FitsImage {
    /// `v ← v^(1/gamma)` on one plane.
    pub fn apply_gamma_to_channel(&mut self, c: usize, gamma: f32) {
        let inv = 1.0 / gamma;
        self.channel_mut(c).par_iter_mut().for_each(|v| {
            *v = v.powf(inv);
        });
        self.stats = None;
    }

    /// Midtone transfer on one plane: the classic midtone-balance curve
    /// `f(x) = (m−1)·(x−b) / ((2m−1)·(x−b) − m·(1−b))` applied on [b, 1],
    /// with everything below the black point `b` mapping to zero.
    pub fn apply_midtones_to_channel(&mut self, c: usize, mid: f32, black: f32) {
        self.channel_mut(c).par_iter_mut().for_each(|v| {
            let x = *v;
            if x.is_nan() {
                return;
            }
            if x <= black {
                *v = 0.0;
            } else {
                let t = x - black;
                *v = ((mid - 1.0) * t) / ((2.0 * mid - 1.0) * t - mid * (1.0 - black));
            }
        });
        self.stats = None;
    }

    /// Gamma on one plane, restricted to values in `[from, to]`.
    pub fn apply_partial_gamma_to_channel(&mut self, c: usize, from: f32, to: f32, gamma: f32) {
        debug_assert!(from < to);
        let inv = 1.0 / gamma;
        let range = to - from;
        self.channel_mut(c).par_iter_mut().for_each(|v| {
            let x = *v;
            if x >= from && x <= to {
                *v = from + range * ((x - from) / range).powf(inv);
            }
        });
        self.stats = None;
    }

    /// Rescale one plane's black point so `loc` moves to `target`:
    /// `x' = (x − b)/(1 − b)` with `b = (loc − target)/(1 − target)`.
    pub fn shift_black_to_move_channel(&mut self, c: usize, loc: f32, target: f32) {
        debug_assert!(target < 1.0);
        let black = (loc - target) / (1.0 - target);
        if !(0.0..1.0).contains(&black) {
            return;
        }
        let inv_span = 1.0 / (1.0 - black);
        self.channel_mut(c).par_iter_mut().for_each(|v| {
            *v = (*v - black) * inv_span;
        });
        self.stats = None;
    }
}

/// Automatic curves: iteratively gamma-stretch and re-anchor the black
/// point until the luminance histogram peak reaches the target location
/// and scale, giving up after 30 iterations.
pub fn auto_curves(
    image: &mut FitsImage,
    target_loc: f32,
    target_scale: f32,
    estimator: LsEstimator,
) {
    info!(
        "automatic curves targeting location {:.2}% and scale {:.2}%",
        target_loc * 100.0,
        target_scale * 100.0
    );

    for iteration in 0..=30 {
        if iteration == 30 {
            warn!("automatic curves did not converge after 30 iterations");
            break;
        }

        let (loc, scale) = luminance_loc_scale(&image.pixels, estimator);
        if loc <= target_loc * 1.01 && scale < target_scale {
            let mut ideal_gamma =
                ((target_loc / target_scale) * scale).ln() / target_loc.ln();
            if ideal_gamma > 1.5 {
                ideal_gamma = 1.5;
            }
            if ideal_gamma <= 1.01 {
                break;
            }
            info!(
                "location {:.2}% scale {:.2}%: applying gamma {:.3}",
                loc * 100.0,
                scale * 100.0,
                ideal_gamma
            );
            image.apply_gamma_to_channel(2, ideal_gamma);
        } else if loc > target_loc * 0.99 && scale < target_scale {
            info!(
                "location {:.2}% scale {:.2}%: scaling black to {:.2}%",
                loc * 100.0,
                scale * 100.0,
                target_loc * 100.0
            );
            image.shift_black_to_move_channel(2, loc, target_loc);
        } else {
            break;
        }
    }
}

/// Full tone-curve stage: convert to xyY, run the configured curve
/// adjustments on the luminance plane, convert back.
pub fn enhance_tone_curve(
    image: &mut FitsImage,
    params: &ToneCurveParams,
    estimator: LsEstimator,
) {
    let active = (params.auto_loc != 0.0 && params.auto_scale != 0.0)
        || params.midtone != 0.0
        || params.gamma != 1.0
        || params.pp_gamma != 1.0
        || params.scale_black != 0.0;
    if !active {
        return;
    }

    image.to_xyy();

    if params.auto_loc != 0.0 && params.auto_scale != 0.0 {
        auto_curves(
            image,
            params.auto_loc / 100.0,
            params.auto_scale / 100.0,
            estimator,
        );
    }

    if params.midtone != 0.0 {
        let (loc, scale) = luminance_loc_scale(&image.pixels, estimator);
        let abs_mid = params.midtone * scale;
        let abs_black = loc - params.mid_black * scale;
        info!(
            "midtone correction: loc {:.2}% scale {:.2}% mid {:.2}% black {:.2}%",
            loc * 100.0,
            scale * 100.0,
            abs_mid * 100.0,
            abs_black * 100.0
        );
        image.apply_midtones_to_channel(2, abs_mid, abs_black);
    }

    if params.gamma != 1.0 {
        info!("applying gamma {:.3}", params.gamma);
        image.apply_gamma_to_channel(2, params.gamma);
    }

    if params.pp_gamma != 1.0 {
        let (loc, scale) = luminance_loc_scale(&image.pixels, estimator);
        let from = loc + params.pp_sigma * scale;
        info!(
            "post-peak gamma {:.3} on [{:.2}%, 100%]",
            params.pp_gamma,
            from * 100.0
        );
        if from < 1.0 {
            image.apply_partial_gamma_to_channel(2, from, 1.0, params.pp_gamma);
        }
    }

    if params.scale_black != 0.0 {
        let target = params.scale_black / 100.0;
        let (loc, scale) = luminance_loc_scale(&image.pixels, estimator);
        if loc > target {
            info!(
                "location {:.2}% scale {:.2}%: scaling black to {:.2}%",
                loc * 100.0,
                scale * 100.0,
                target * 100.0
            );
            image.shift_black_to_move_channel(2, loc, target);
        } else {
            info!(
                "cannot move location {:.2}% to {:.2}% by scaling black",
                loc * 100.0,
                target * 100.0
            );
        }
    }

    image.xyy_to_rgb();
}
