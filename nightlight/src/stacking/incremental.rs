//! Incremental "stack of stacks" for multi-batch runs.
//!
//! Per-batch means are merged as a running weighted average. Variance across
//! batches is not tracked, so noise estimates after a multi-batch merge are
//! optimistic; this matches the single-pass memory model and is a documented
//! accuracy compromise.

use crate::common::parallel;
use crate::image::FitsImage;
use crate::math::statistics::LsEstimator;
use rayon::prelude::*;

/// Merge a batch result into the running stack:
/// `S ← (S·nS + B·nB) / (nS + nB)`, elementwise. NaN propagates, keeping
/// "no data" pixels missing in the final image.
pub fn stack_incremental(
    stack: &mut FitsImage,
    stack_frames: f32,
    batch: &FitsImage,
    batch_frames: f32,
) {
    assert_eq!(
        stack.naxisn, batch.naxisn,
        "batch axes differ from the running stack"
    );
    assert!(stack_frames > 0.0 && batch_frames > 0.0);

    let total = stack_frames + batch_frames;
    let batch_pixels = &batch.pixels;
    parallel::par_chunks_mut_auto(&mut stack.pixels).for_each(|(offset, chunk)| {
        for (i, s) in chunk.iter_mut().enumerate() {
            *s = (*s * stack_frames + batch_pixels[offset + i] * batch_frames) / total;
        }
    });

    stack.exposure += batch.exposure;
    stack.invalidate();
}

/// Recompute extended statistics once all batches are merged.
pub fn stack_incremental_finalize(stack: &mut FitsImage, estimator: LsEstimator) {
    stack.recompute_stats(estimator);
}
