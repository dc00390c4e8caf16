//! Nightlight - astrophotography image-stack pipeline.
//!
//! Turns many noisy raw sub-exposures of one deep-sky target into a single
//! clean, tone-mapped image:
//! - Per-frame calibration (dark, flat, bad pixels, debayer, binning)
//! - Star detection with HFR measurement
//! - Triangle-invariant registration onto a reference frame
//! - Robust statistical stacking under a fixed memory budget
//! - Color calibration and tone curves in perceptual color spaces
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nightlight::prelude::*;
//!
//! let pre = PreProcessParams::default();
//! let post = PostProcessParams::default();
//! let mut stack_params = StackParams {
//!     memory_mib: 4096,
//!     ..Default::default()
//! };
//! let stacked = cmd_stack(&files, &pre, &post, &mut stack_params, "out.fits".as_ref())?;
//! println!("stacked {} stars, HFR {:.2}", stacked.stars.len(), stacked.hfr);
//! ```

pub mod background;
pub mod batch;
pub mod calibration;
pub(crate) mod color;
pub(crate) mod common;
pub mod demosaic;
pub mod error;
pub mod image;
pub(crate) mod math;
pub mod normalization;
pub mod pipeline;
pub mod registration;
pub mod stacking;
pub mod star_detection;
pub(crate) mod tone;

pub mod prelude;

// ============================================================================
// Core image types
// ============================================================================

pub use common::pool::BufferPool;
pub use image::{FitsHeader, FitsImage, HeaderCard};
pub use math::statistics::{LsEstimator, Stats};

// ============================================================================
// Calibration and detection
// ============================================================================

pub use demosaic::{CfaColor, CfaPattern};
pub use star_detection::Star;

// ============================================================================
// Registration
// ============================================================================

pub use registration::{Aligner, transform::Transform2D};

// ============================================================================
// Stacking and scheduling
// ============================================================================

pub use batch::{BatchPlan, default_memory_mib, prepare_batches};
pub use stacking::{StackMode, StackParams};

// ============================================================================
// Color and tone
// ============================================================================

pub use color::{ColorParams, enhance_colors};
pub use tone::{ToneCurveParams, auto_curves, enhance_tone_curve};

// ============================================================================
// Pipeline commands
// ============================================================================

pub use error::{FrameError, PipelineError};
pub use normalization::HistoNormMode;
pub use pipeline::{
    OobMode, PostProcessParams, PreProcessParams, cmd_lrgb, cmd_rgb, cmd_stack, cmd_stats,
};
