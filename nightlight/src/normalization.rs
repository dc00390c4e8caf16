//! Histogram normalization against a reference frame.

use crate::image::FitsImage;
use crate::math::statistics::{LsEstimator, Stats};

/// Histogram normalization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoNormMode {
    /// Leave the histogram untouched.
    None,
    /// Linear map taking (location, scale) onto the reference's. Good for
    /// stacking lights.
    LocScale,
    /// Shift the black point so location matches the reference's. Good for
    /// RGB channel alignment.
    LocBlack,
    /// Resolved per command: LocScale for stacking, None for (L)RGB.
    #[default]
    Auto,
}

impl HistoNormMode {
    pub fn from_flag(value: i64) -> Self {
        match value {
            0 => HistoNormMode::None,
            1 => HistoNormMode::LocScale,
            2 => HistoNormMode::LocBlack,
            _ => HistoNormMode::Auto,
        }
    }
}

/// Linearly map the frame's histogram so its (location, scale) become the
/// reference's. Statistics are recomputed afterwards.
pub fn match_location_scale(
    image: &mut FitsImage,
    reference: &Stats,
    estimator: LsEstimator,
) -> Stats {
    let own = match image.stats {
        Some(s) => s,
        None => image.recompute_stats(estimator),
    };

    if own.scale > 0.0 && reference.scale > 0.0 {
        let gain = reference.scale / own.scale;
        let offset = reference.location - own.location * gain;
        for v in image.pixels.iter_mut() {
            *v = *v * gain + offset;
        }
    }
    // The map is monotone affine: star positions are unchanged, only the
    // statistics need recomputing.
    image.recompute_stats(estimator)
}

/// Subtract a constant so the frame's location lands on the reference's.
/// Statistics are recomputed afterwards.
pub fn shift_black_to_location(
    image: &mut FitsImage,
    reference: &Stats,
    estimator: LsEstimator,
) -> Stats {
    let own = match image.stats {
        Some(s) => s,
        None => image.recompute_stats(estimator),
    };

    let shift = own.location - reference.location;
    if shift != 0.0 {
        for v in image.pixels.iter_mut() {
            *v -= shift;
        }
    }
    // Star positions are unchanged by the constant shift.
    image.recompute_stats(estimator)
}
