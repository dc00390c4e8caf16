pub mod fits;
pub mod preview;

use crate::common::pool::BufferPool;
use crate::math::statistics::{LsEstimator, Stats, extended_stats};
use crate::registration::transform::Transform2D;
use crate::star_detection::Star;

pub use fits::{FitsHeader, HeaderCard};

// ============================================================================
// FitsImage
// ============================================================================

/// The unit of work: one frame's pixels plus everything the pipeline has
/// learned about it.
///
/// Monochrome frames hold `width × height` pixels; color frames hold three
/// planes (R, then G, then B) in one contiguous buffer with plane stride
/// `width × height`. NaN marks "no data" and is ignored by statistics and
/// stackers.
#[derive(Debug, Clone)]
pub struct FitsImage {
    /// Integer tag for logging and ordering. Calibration frames use
    /// negative ids.
    pub id: i32,
    /// Axis lengths: `[width, height]` or `[width, height, 3]`.
    pub naxisn: Vec<usize>,
    /// Original FITS integer encoding, preserved for round-trip.
    pub bitpix: i32,
    pub bzero: f32,
    /// Exposure in seconds, 0 when unknown.
    pub exposure: f32,
    /// Row-major pixel data, planar for color.
    pub pixels: Vec<f32>,
    /// Header cards preserved verbatim through read/modify/write.
    pub header: FitsHeader,
    /// Statistics of the current pixel contents. Any in-place mutation
    /// invalidates them; mutating paths recompute before consumers need them.
    pub stats: Option<Stats>,
    /// Detected stars in this frame's native grid.
    pub stars: Vec<Star>,
    /// Mean half-flux radius over `stars`.
    pub hfr: f32,
    /// Affine transform from reference-frame coordinates to this frame's.
    pub transform: Transform2D,
    /// Alignment residual in pixels RMS.
    pub residual: f32,
}

impl FitsImage {
    /// Create a monochrome image from raw pixels.
    pub fn new(id: i32, width: usize, height: usize, pixels: Vec<f32>) -> Self {
        assert_eq!(pixels.len(), width * height, "pixel count mismatch");
        Self {
            id,
            naxisn: vec![width, height],
            bitpix: -32,
            bzero: 0.0,
            exposure: 0.0,
            pixels,
            header: FitsHeader::new(),
            stats: None,
            stars: Vec::new(),
            hfr: 0.0,
            transform: Transform2D::identity(),
            residual: 0.0,
        }
    }

    /// Combine three aligned monochrome channels into one planar RGB image.
    ///
    /// Stars, HFR and exposure metadata are inherited from the reference
    /// frame, whose grid all channels have been projected onto.
    pub fn combine_rgb(channels: &[&FitsImage], reference: &FitsImage) -> Self {
        assert_eq!(channels.len(), 3, "RGB combination needs three channels");
        let width = reference.width();
        let height = reference.height();
        let plane = width * height;

        let mut pixels = Vec::with_capacity(3 * plane);
        for ch in channels {
            assert_eq!(
                ch.pixels.len(),
                plane,
                "channel {} size differs from reference",
                ch.id
            );
            pixels.extend_from_slice(&ch.pixels);
        }

        Self {
            id: reference.id,
            naxisn: vec![width, height, 3],
            bitpix: -32,
            bzero: 0.0,
            exposure: channels.iter().map(|c| c.exposure).sum(),
            pixels,
            header: reference.header.clone(),
            stats: None,
            stars: reference.stars.clone(),
            hfr: reference.hfr,
            transform: Transform2D::identity(),
            residual: 0.0,
        }
    }

    // ------------------------------------------------------------------------
    // Dimension accessors
    // ------------------------------------------------------------------------

    pub fn width(&self) -> usize {
        self.naxisn[0]
    }

    pub fn height(&self) -> usize {
        self.naxisn.get(1).copied().unwrap_or(1)
    }

    pub fn channels(&self) -> usize {
        self.naxisn.get(2).copied().unwrap_or(1)
    }

    pub fn is_rgb(&self) -> bool {
        self.channels() == 3
    }

    /// Pixels per plane.
    pub fn plane_len(&self) -> usize {
        self.width() * self.height()
    }

    // ------------------------------------------------------------------------
    // Channel access
    // ------------------------------------------------------------------------

    /// Plane `c` of the planar buffer (0 = L or R, 1 = G, 2 = B).
    pub fn channel(&self, c: usize) -> &[f32] {
        assert!(c < self.channels(), "channel {} out of range", c);
        let plane = self.plane_len();
        &self.pixels[c * plane..(c + 1) * plane]
    }

    pub fn channel_mut(&mut self, c: usize) -> &mut [f32] {
        assert!(c < self.channels(), "channel {} out of range", c);
        let plane = self.plane_len();
        &mut self.pixels[c * plane..(c + 1) * plane]
    }

    /// Mutable access to all three planes of a color image at once.
    pub fn rgb_planes_mut(&mut self) -> (&mut [f32], &mut [f32], &mut [f32]) {
        assert!(self.is_rgb(), "expected a 3-channel image");
        let plane = self.plane_len();
        let (r, gb) = self.pixels.split_at_mut(plane);
        let (g, b) = gb.split_at_mut(plane);
        (r, g, b)
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    /// Recompute extended statistics for the current pixel contents.
    pub fn recompute_stats(&mut self, estimator: LsEstimator) -> Stats {
        let stats = extended_stats(&self.pixels, self.width(), estimator);
        self.stats = Some(stats);
        stats
    }

    /// Drop statistics and star detections after an in-place mutation.
    pub fn invalidate(&mut self) {
        self.stats = None;
        self.stars.clear();
        self.hfr = 0.0;
    }

    // ------------------------------------------------------------------------
    // Range normalization
    // ------------------------------------------------------------------------

    /// Rescale pixel values so the data range becomes [0, 1].
    ///
    /// Idempotent: a second call finds min 0 and max 1 and changes nothing.
    /// NaN pixels pass through. Statistics are invalidated; callers that
    /// need them recompute afterwards.
    pub fn normalize(&mut self) {
        let stats = match self.stats {
            Some(s) => s,
            None => crate::math::statistics::basic_stats(&self.pixels),
        };
        let range = stats.max - stats.min;
        if range <= 0.0 || !range.is_finite() {
            return;
        }
        let min = stats.min;
        let inv = 1.0 / range;
        for v in self.pixels.iter_mut() {
            *v = (*v - min) * inv;
        }
        self.invalidate();
    }

    // ------------------------------------------------------------------------
    // Buffer lifecycle
    // ------------------------------------------------------------------------

    /// Consume the image and park its pixel buffer in the pool.
    pub fn release_into(self, pool: &BufferPool) {
        pool.f32s.release(self.pixels);
    }
}
