//! Per-command pipeline orchestration.

pub mod commands;
pub mod postprocess;
pub mod preprocess;

pub use commands::{cmd_lrgb, cmd_rgb, cmd_stack, cmd_stats};
pub use postprocess::{OobMode, PostProcessParams};
pub use preprocess::PreProcessParams;
