//! Memory-bounded batch scheduling.
//!
//! Derives how many frames can be resident at once from the memory budget,
//! then trades image-level parallelism against batch size until a viable
//! execution plan exists. Multi-batch runs randomize frames across batches
//! (so drifts don't correlate with batch boundaries) while keeping each
//! batch internally sorted for sequential I/O.

use std::path::PathBuf;

use anyhow::Result;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::error::PipelineError;
use crate::image::{FitsImage, fits};

/// A batch execution plan over the input files.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub num_batches: usize,
    pub batch_size: usize,
    /// Worker count for the per-frame phases.
    pub image_level_parallelism: usize,
    /// Frame ids, one per file, surviving the shuffle.
    pub ids: Vec<usize>,
    /// Input files, shuffled across batches and sorted within each.
    pub file_names: Vec<PathBuf>,
}

impl BatchPlan {
    /// File range of batch `b`.
    pub fn batch_range(&self, b: usize) -> std::ops::Range<usize> {
        let start = b * self.batch_size;
        let end = ((b + 1) * self.batch_size).min(self.file_names.len());
        start..end
    }
}

/// Split the input into randomized batches within the memory budget.
///
/// Frame size is probed from the dark or flat when available, else by
/// reading the first input frame's header.
pub fn prepare_batches(
    file_names: &[PathBuf],
    memory_mib: i64,
    dark: Option<&FitsImage>,
    flat: Option<&FitsImage>,
) -> Result<BatchPlan> {
    let num_frames = file_names.len();
    assert!(num_frames > 0, "no input files");

    let (width, height) = match (dark, flat) {
        (Some(d), _) => (d.width(), d.height()),
        (None, Some(f)) => (f.width(), f.height()),
        (None, None) => {
            info!(
                "estimating memory needs for {} images from {}",
                num_frames,
                file_names[0].display()
            );
            let first = fits::read_fits(&file_names[0])?;
            (first.width(), first.height())
        }
    };

    let bytes_per_frame = (width * height * 4) as i64;
    let available_frames = (memory_mib * 1024 * 1024) / bytes_per_frame;
    let cpus = rayon::current_num_threads().max(1);
    info!(
        "{} images of {}x{} pixels, each {} MiB in memory; budget {} MiB fits {} frames",
        num_frames,
        width,
        height,
        bytes_per_frame / (1024 * 1024),
        memory_mib,
        available_frames
    );

    let mut plan: Option<(usize, usize, usize)> = None;
    for parallelism in (1..=cpus).rev() {
        // Besides the lights of the current batch: one temp frame per
        // worker, the optional dark and flat, and for multi-batch runs the
        // shared reference frame plus the stack of stacks.
        let mut batch_size =
            available_frames - parallelism as i64 - dark.is_some() as i64 - flat.is_some() as i64;
        if batch_size < 2 {
            continue;
        }
        let mut num_batches = (num_frames as i64 + batch_size - 1) / batch_size;
        if num_batches > 1 {
            batch_size -= 2;
        }
        if batch_size < 2 || batch_size < parallelism as i64 {
            continue;
        }
        num_batches = (num_frames as i64 + batch_size - 1) / batch_size;
        plan = Some((parallelism, batch_size as usize, num_batches as usize));
        break;
    }

    let Some((parallelism, mut batch_size, num_batches)) = plan else {
        return Err(PipelineError::NoBatchPlan {
            memory_mib,
            frames: num_frames,
        }
        .into());
    };

    // Even out the size of the last batch
    while batch_size > 1 && (batch_size - 1) * num_batches >= num_frames {
        batch_size -= 1;
    }
    info!(
        "using {} batches of batch size {} with {} images in parallel",
        num_batches, batch_size, parallelism
    );

    let mut ids: Vec<usize> = (0..num_frames).collect();
    if num_batches > 1 {
        info!("randomizing input files across batches");
        let mut rng = ChaCha8Rng::seed_from_u64(num_frames as u64);
        ids.shuffle(&mut rng);
        for b in 0..num_batches {
            let start = b * batch_size;
            let end = ((b + 1) * batch_size).min(num_frames);
            ids[start..end].sort_unstable();
        }
    }
    let file_names = ids.iter().map(|&i| file_names[i].clone()).collect();

    Ok(BatchPlan {
        num_batches,
        batch_size,
        image_level_parallelism: parallelism,
        ids,
        file_names,
    })
}

/// Default stacking memory budget: 70% of physical memory, in MiB.
pub fn default_memory_mib() -> i64 {
    use sysinfo::System;
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.total_memory() as i64 / 1024 / 1024) * 7 / 10
}

/// Expand a printf-style `%d`/`%02d` pattern with a frame id.
pub fn expand_pattern(pattern: &str, id: usize) -> PathBuf {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        // parse %[0][width]d
        let mut pad_zero = false;
        let mut width = 0usize;
        while let Some(&next) = chars.peek() {
            match next {
                '0' if width == 0 => {
                    pad_zero = true;
                    chars.next();
                }
                '1'..='9' => {
                    width = width * 10 + (next as usize - '0' as usize);
                    chars.next();
                }
                'd' => {
                    chars.next();
                    break;
                }
                _ => break,
            }
        }
        let digits = id.to_string();
        if pad_zero && digits.len() < width {
            out.extend(std::iter::repeat_n('0', width - digits.len()));
        }
        out.push_str(&digits);
    }
    PathBuf::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("light{i:04}.fits"))).collect()
    }

    fn probe_frame(width: usize, height: usize) -> FitsImage {
        FitsImage::new(-1, width, height, vec![0.0; width * height])
    }

    #[test]
    fn test_single_batch_when_memory_ample() {
        let dark = probe_frame(100, 100);
        // 100x100x4 = 40KB per frame; 100 MiB fits thousands
        let plan = prepare_batches(&files(10), 100, Some(&dark), None).unwrap();
        assert_eq!(plan.num_batches, 1);
        assert!(plan.batch_size >= 10);
        assert!(plan.image_level_parallelism >= 1);
        // No shuffle for a single batch
        assert_eq!(plan.ids, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_plan_covers_all_frames() {
        let dark = probe_frame(1024, 1024);
        // 4 MiB per frame, 64 MiB budget -> 16 frames resident
        let plan = prepare_batches(&files(100), 64, Some(&dark), None).unwrap();
        assert!(plan.num_batches > 1);
        // Invariant: batch_size * num_batches >= num_frames
        assert!(plan.batch_size * plan.num_batches >= 100);
        // Invariant: batch_size fits the budget with its reserves
        let available = (64 * 1024 * 1024) / (1024 * 1024 * 4);
        assert!(plan.batch_size <= available - plan.image_level_parallelism - 1);
        assert_eq!(plan.file_names.len(), 100);
    }

    #[test]
    fn test_batches_internally_sorted() {
        let dark = probe_frame(1024, 1024);
        let plan = prepare_batches(&files(100), 64, Some(&dark), None).unwrap();
        assert!(plan.num_batches > 1);
        for b in 0..plan.num_batches {
            let range = plan.batch_range(b);
            let ids = &plan.ids[range];
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "batch {b} not sorted");
        }
        // All ids present exactly once
        let mut all = plan.ids.clone();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_last_batch_equalized() {
        let dark = probe_frame(1024, 1024);
        let plan = prepare_batches(&files(100), 64, Some(&dark), None).unwrap();
        // Equalization: shrinking batch_size by one must no longer cover
        assert!((plan.batch_size - 1) * plan.num_batches < 100);
    }

    #[test]
    fn test_impossible_budget_fails() {
        let dark = probe_frame(4096, 4096);
        // 64 MiB per frame; 100 MiB budget fits one frame: no viable plan
        let err = prepare_batches(&files(10), 100, Some(&dark), None).unwrap_err();
        assert!(err.to_string().contains("within"));
    }

    #[test]
    fn test_calibration_frames_reserve_slots() {
        let dark = probe_frame(1024, 1024);
        let flat = probe_frame(1024, 1024);
        let with_both = prepare_batches(&files(100), 64, Some(&dark), Some(&flat)).unwrap();
        let with_dark = prepare_batches(&files(100), 64, Some(&dark), None).unwrap();
        assert!(with_both.batch_size <= with_dark.batch_size);
    }

    #[test]
    fn test_expand_pattern() {
        assert_eq!(expand_pattern("pre%04d.fits", 7), PathBuf::from("pre0007.fits"));
        assert_eq!(expand_pattern("b%d.fits", 12), PathBuf::from("b12.fits"));
        assert_eq!(expand_pattern("back%02d.fits", 3), PathBuf::from("back03.fits"));
        assert_eq!(expand_pattern("plain.fits", 5), PathBuf::from("plain.fits"));
    }

}
