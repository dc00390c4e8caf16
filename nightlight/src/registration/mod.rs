//! Frame registration: triangle matching of star sets, affine fit, and
//! projection onto the reference grid.

pub mod projection;
pub mod transform;
pub mod triangle;

use glam::DVec2;
use tracing::debug;

use crate::star_detection::Star;
use transform::Transform2D;
use triangle::match_stars;

/// Ratio tolerance for triangle invariant agreement.
const RATIO_TOLERANCE: f64 = 0.01;

/// Minimum triangle votes for a star pair to enter conflict resolution.
const MIN_VOTES: usize = 2;

/// Aligns frames onto a shared reference frame.
pub struct Aligner {
    /// Reference frame axis lengths; projection targets this grid.
    pub naxisn: Vec<usize>,
    /// Address of the reference star list. Compared for object identity
    /// only, so the reference frame itself skips alignment.
    ref_stars_addr: usize,
    ref_stars_len: usize,
    /// Top-K brightest reference stars.
    ref_positions: Vec<DVec2>,
    k: usize,
}

impl Aligner {
    /// Build an aligner from the reference frame's detections, keeping the
    /// `k` brightest stars for triangle matching.
    pub fn new(naxisn: &[usize], ref_stars: &[Star], k: usize) -> Self {
        Self {
            naxisn: naxisn.to_vec(),
            ref_stars_addr: ref_stars.as_ptr() as usize,
            ref_stars_len: ref_stars.len(),
            ref_positions: brightest_positions(ref_stars, k),
            k,
        }
    }

    pub fn has_ref_stars(&self) -> bool {
        self.ref_stars_len > 0
    }

    /// Whether `stars` is the reference frame's own star list.
    pub fn is_reference(&self, stars: &[Star]) -> bool {
        stars.len() == self.ref_stars_len && stars.as_ptr() as usize == self.ref_stars_addr
    }

    /// Estimate the affine transform taking reference coordinates into the
    /// frame holding `stars`, and the RMS residual in pixels.
    ///
    /// When matching fails outright the residual is `f32::MAX`, which the
    /// caller's residual threshold turns into a dropped frame.
    pub fn align(&self, stars: &[Star], id: i32) -> (Transform2D, f32) {
        let target_positions = brightest_positions(stars, self.k);
        let matches = match_stars(
            &self.ref_positions,
            &target_positions,
            RATIO_TOLERANCE,
            MIN_VOTES,
        );
        debug!(
            id,
            matches = matches.len(),
            ref_stars = self.ref_positions.len(),
            target_stars = target_positions.len(),
            "triangle matching"
        );
        if matches.len() < 3 {
            return (Transform2D::identity(), f32::MAX);
        }

        let ref_pts: Vec<DVec2> = matches.iter().map(|m| self.ref_positions[m.ref_idx]).collect();
        let target_pts: Vec<DVec2> = matches
            .iter()
            .map(|m| target_positions[m.target_idx])
            .collect();

        match Transform2D::from_least_squares(&ref_pts, &target_pts) {
            Some(transform) => {
                let residual = transform.rms_residual(&ref_pts, &target_pts) as f32;
                (transform, residual)
            }
            None => (Transform2D::identity(), f32::MAX),
        }
    }
}

/// Positions of the `k` brightest stars, by flux.
fn brightest_positions(stars: &[Star], k: usize) -> Vec<DVec2> {
    let mut by_flux: Vec<&Star> = stars.iter().collect();
    by_flux.sort_by(|a, b| b.flux.partial_cmp(&a.flux).unwrap());
    by_flux
        .iter()
        .take(k)
        .map(|s| DVec2::new(s.x as f64, s.y as f64))
        .collect()
}
