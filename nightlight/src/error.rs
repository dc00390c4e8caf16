//! Error taxonomy.
//!
//! Two severities with distinct handling: a [`FrameError`] drops one frame
//! and the pipeline continues with the survivors; a [`PipelineError`] fails
//! the whole command. Degenerate-input conditions that affect neither
//! (near-constant darks, uniform lights) are logged as warnings instead.

use thiserror::Error;

/// Per-frame recoverable errors. The owning frame is dropped; the run
/// continues unless every frame fails.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("{id}: failed to read frame: {message}")]
    Unreadable { id: i32, message: String },

    #[error("{id}: light size {actual:?} differs from {kind} size {expected:?}")]
    SizeMismatch {
        id: i32,
        kind: &'static str,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("{id}: alignment residual {residual:.3} exceeds limit {limit:.3}")]
    ResidualTooHigh { id: i32, residual: f32, limit: f32 },

    #[error("{id}: {message}")]
    Other { id: i32, message: String },
}

/// Per-command fatal errors. The command exits non-zero.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("cannot find a stacking execution path within {memory_mib} MiB for {frames} frames")]
    NoBatchPlan { memory_mib: i64, frames: usize },

    #[error("reference frame for alignment and normalization not found")]
    NoReferenceFrame,

    #[error("unable to align without star detections in reference frame")]
    NoReferenceStars,

    #[error("no frames survived preprocessing and alignment")]
    NoSurvivingFrames,

    #[error("failed to write output {path}: {message}")]
    WriteFailed { path: String, message: String },
}
