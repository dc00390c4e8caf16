//! Convenience re-exports for pipeline consumers.

pub use crate::batch::{BatchPlan, default_memory_mib, prepare_batches};
pub use crate::color::ColorParams;
pub use crate::error::{FrameError, PipelineError};
pub use crate::image::{FitsImage, fits::read_fits, fits::write_fits, preview::write_jpeg};
pub use crate::math::statistics::{LsEstimator, Stats};
pub use crate::normalization::HistoNormMode;
pub use crate::pipeline::{
    OobMode, PostProcessParams, PreProcessParams, cmd_lrgb, cmd_rgb, cmd_stack, cmd_stats,
};
pub use crate::stacking::{StackMode, StackParams};
pub use crate::star_detection::Star;
pub use crate::tone::ToneCurveParams;
