//! Command-line front end for the nightlight pipeline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use nightlight::prelude::*;
use nightlight::{CfaColor, CfaPattern};

#[derive(Parser, Debug)]
#[command(
    name = "nightlight",
    version,
    about = "Astrophotography image preprocessing and stacking"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Save output to this FITS file
    #[arg(long, default_value = "out.fits", global = true)]
    out: PathBuf,

    /// Save an 8-bit JPEG preview; %auto derives the name from -out
    #[arg(long, default_value = "%auto", global = true)]
    jpg: String,

    /// Save log output to this file; %auto derives the name from -out
    #[arg(long, default_value = "%auto", global = true)]
    log: String,

    /// Save preprocessed frames with this pattern, e.g. pre%04d.fits
    #[arg(long, default_value = "", global = true)]
    pre: String,

    /// Save star detections with this pattern, e.g. stars%04d.fits
    #[arg(long, default_value = "", global = true)]
    stars: String,

    /// Save extracted backgrounds with this pattern, e.g. back%04d.fits
    #[arg(long, default_value = "", global = true)]
    back: String,

    /// Save postprocessed frames with this pattern, e.g. post%04d.fits
    #[arg(long, default_value = "", global = true)]
    post: String,

    /// Save stacked batches with this pattern, e.g. batch%04d.fits
    #[arg(long, default_value = "", global = true)]
    batch: String,

    /// Apply this dark frame
    #[arg(long, global = true)]
    dark: Option<PathBuf>,

    /// Apply this flat frame
    #[arg(long, global = true)]
    flat: Option<PathBuf>,

    /// Debayer this channel (R, G or B); empty disables
    #[arg(long, default_value = "", global = true)]
    debayer: String,

    /// Color filter array order for debayering
    #[arg(long, default_value = "RGGB", global = true)]
    cfa: String,

    /// Apply NxN binning; 0 or 1 disables
    #[arg(long, default_value_t = 0, global = true)]
    binning: usize,

    /// Low sigma for bad pixel removal
    #[arg(long, default_value_t = 3.0, global = true)]
    bp_sig_low: f32,

    /// High sigma for bad pixel removal
    #[arg(long, default_value_t = 5.0, global = true)]
    bp_sig_high: f32,

    /// Sigma for star detection
    #[arg(long, default_value_t = 10.0, global = true)]
    star_sig: f32,

    /// Sigma for star detection bad pixel masking; -1 selects per command
    #[arg(long, default_value_t = -1.0, global = true)]
    star_bp_sig: f32,

    /// Radius for star detection in pixels
    #[arg(long, default_value_t = 16, global = true)]
    star_radius: usize,

    /// Background extraction grid size in pixels; 0 disables
    #[arg(long, default_value_t = 0, global = true)]
    back_grid: usize,

    /// Background extraction sigma for rejecting foreground
    #[arg(long, default_value_t = 1.5, global = true)]
    back_sigma: f32,

    /// Clip this many brightest background cells
    #[arg(long, default_value_t = 0, global = true)]
    back_clip: usize,

    /// Unsharp masking sigma
    #[arg(long, default_value_t = 1.0, global = true)]
    usm_sigma: f32,

    /// Unsharp masking gain; 0 disables
    #[arg(long, default_value_t = 0.0, global = true)]
    usm_gain: f32,

    /// Unsharp masking threshold in scales above the background
    #[arg(long, default_value_t = 1.0, global = true)]
    usm_thresh: f32,

    /// Align frames onto the reference (1) or not (0)
    #[arg(long, default_value_t = 1, global = true)]
    align: i64,

    /// Form alignment triangles from this many brightest stars
    #[arg(long, default_value_t = 20, global = true)]
    align_k: usize,

    /// Drop frames with alignment residual above this
    #[arg(long, default_value_t = 1.0, global = true)]
    align_t: f32,

    /// Location/scale estimator: 0 mean/stddev, 1 median/MAD, 2 IKSS,
    /// 3 sigma-clipped sampled median with sampled Qn
    #[arg(long, default_value_t = 3, global = true)]
    ls_est: i64,

    /// Normalize pixel values to [0,1]
    #[arg(long, default_value_t = 0, global = true)]
    norm_range: i64,

    /// Histogram normalization: 0 off, 1 location/scale, 2 black shift,
    /// 3 auto
    #[arg(long, default_value_t = 3, global = true)]
    norm_hist: i64,

    /// Stacking mode: 0 median, 1 mean, 2 sigma clip, 3 winsorized,
    /// 4 linear fit, 5 auto
    #[arg(long, default_value_t = 5, global = true)]
    st_mode: i64,

    /// Desired low clipping percentage; used when sigmas are negative
    #[arg(long, default_value_t = 0.5, global = true)]
    st_clip_perc_low: f32,

    /// Desired high clipping percentage; used when sigmas are negative
    #[arg(long, default_value_t = 0.5, global = true)]
    st_clip_perc_high: f32,

    /// Low stacking sigma; -1 solves it from the clipping percentage
    #[arg(long, default_value_t = -1.0, global = true)]
    st_sig_low: f32,

    /// High stacking sigma; -1 solves it from the clipping percentage
    #[arg(long, default_value_t = -1.0, global = true)]
    st_sig_high: f32,

    /// Stacking weights: 0 none, 1 by exposure, 2 by inverse noise
    #[arg(long, default_value_t = 0, global = true)]
    st_weight: i32,

    /// Memory budget for stacking in MiB; 0 uses 70% of physical RAM
    #[arg(long, default_value_t = 0, global = true)]
    st_memory: i64,

    /// Neutralize background chroma below this sigma; negative disables
    #[arg(long, default_value_t = -1.0, global = true)]
    neut_sigma_low: f32,

    /// Keep chroma above this sigma, interpolating in between
    #[arg(long, default_value_t = -1.0, global = true)]
    neut_sigma_high: f32,

    /// Chroma gamma for luminances above --chroma-sigma; 1 disables
    #[arg(long, default_value_t = 1.0, global = true)]
    chroma_gamma: f32,

    /// Luminance threshold for chroma gamma, in sigmas
    #[arg(long, default_value_t = 1.0, global = true)]
    chroma_sigma: f32,

    /// Multiply chroma for hues in [--chroma-from, --chroma-to]; 1 disables
    #[arg(long, default_value_t = 1.0, global = true)]
    chroma_by: f32,

    #[arg(long, default_value_t = 295.0, global = true)]
    chroma_from: f32,

    #[arg(long, default_value_t = 40.0, global = true)]
    chroma_to: f32,

    /// Rotate hues in [--rot-from, --rot-to] by this many degrees
    #[arg(long, default_value_t = 0.0, global = true)]
    rot_by: f32,

    #[arg(long, default_value_t = 100.0, global = true)]
    rot_from: f32,

    #[arg(long, default_value_t = 190.0, global = true)]
    rot_to: f32,

    /// SCNR green reduction amount in [0,1]
    #[arg(long, default_value_t = 0.0, global = true)]
    scnr: f32,

    /// Target histogram peak location in percent for automatic curves
    #[arg(long, default_value_t = 10.0, global = true)]
    auto_loc: f32,

    /// Target histogram peak scale in percent for automatic curves
    #[arg(long, default_value_t = 0.4, global = true)]
    auto_scale: f32,

    /// Midtone value in multiples of scale; 0 disables
    #[arg(long, default_value_t = 0.0, global = true)]
    midtone: f32,

    /// Midtone black in multiples of scale below the location
    #[arg(long, default_value_t = 2.0, global = true)]
    mid_black: f32,

    /// Output gamma; 1 keeps linear data
    #[arg(long, default_value_t = 1.0, global = true)]
    gamma: f32,

    /// Post-peak gamma; 1 disables
    #[arg(long, default_value_t = 1.0, global = true)]
    pp_gamma: f32,

    /// Apply post-peak gamma this many scales above the peak
    #[arg(long, default_value_t = 1.0, global = true)]
    pp_sigma: f32,

    /// Move the histogram peak to this percentage by rescaling black
    #[arg(long, default_value_t = 0.0, global = true)]
    scale_black: f32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show statistics for the input images
    Stats { files: Vec<String> },
    /// Stack the input images
    Stack { files: Vec<String> },
    /// Combine three channels as R, G and B
    Rgb { files: Vec<String> },
    /// Combine four channels as L, R, G, B, aligning on luminance
    Argb { files: Vec<String> },
    /// Combine four channels as L, R, G, B, substituting luminance
    Lrgb { files: Vec<String> },
    /// Show license and attribution information
    Legal,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_path = resolve_auto(&args.log, &args.out, "log");
    init_logging(log_path.as_deref())?;

    let start = std::time::Instant::now();
    let jpg_path = resolve_auto(&args.jpg, &args.out, "jpg");

    match &args.command {
        Command::Stats { files } => {
            let files = expand_globs(files)?;
            cmd_stats(&files, &pre_params(&args))?;
        }
        Command::Stack { files } => {
            let files = expand_globs(files)?;
            let mut stack_params = stack_params(&args);
            cmd_stack(
                &files,
                &pre_params(&args),
                &post_params(&args),
                &mut stack_params,
                &args.out,
            )?;
        }
        Command::Rgb { files } => {
            let files = expand_globs(files)?;
            cmd_rgb(
                &files,
                &pre_params(&args),
                &post_params(&args),
                &color_params(&args),
                &tone_params(&args),
                &args.out,
                jpg_path.as_deref(),
            )?;
        }
        Command::Argb { files } => {
            let files = expand_globs(files)?;
            cmd_lrgb(
                &files,
                false,
                &pre_params(&args),
                &post_params(&args),
                &color_params(&args),
                &tone_params(&args),
                &args.out,
                jpg_path.as_deref(),
            )?;
        }
        Command::Lrgb { files } => {
            let files = expand_globs(files)?;
            cmd_lrgb(
                &files,
                true,
                &pre_params(&args),
                &post_params(&args),
                &color_params(&args),
                &tone_params(&args),
                &args.out,
                jpg_path.as_deref(),
            )?;
        }
        Command::Legal => {
            println!(
                "Nightlight is free software, distributed under the GNU GPL v3 or later.\n\
                 It comes with ABSOLUTELY NO WARRANTY; see the license for details."
            );
        }
    }

    info!("done after {:?}", start.elapsed());
    Ok(())
}

/// Initialize tracing to stderr, and additionally to a file when selected.
fn init_logging(log_path: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("unable to open logfile {}", path.display()))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file));
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
    }
    Ok(())
}

/// Resolve the `%auto` convention: derive the path from the output name,
/// or disable when empty.
fn resolve_auto(value: &str, out: &Path, extension: &str) -> Option<PathBuf> {
    match value {
        "" => None,
        "%auto" => Some(out.with_extension(extension)),
        other => Some(PathBuf::from(other)),
    }
}

/// Expand filename wildcards into the list of input frames.
fn expand_globs(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let matches: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("invalid glob pattern {pattern}"))?
            .collect::<std::result::Result<_, _>>()?;
        if matches.is_empty() {
            // Not every shell expands wildcards; a literal path that exists
            // still counts.
            let literal = PathBuf::from(pattern);
            if literal.exists() {
                files.push(literal);
                continue;
            }
        }
        files.extend(matches);
    }
    if files.is_empty() {
        bail!("no input files");
    }
    info!("found {} frames", files.len());
    for (i, file) in files.iter().enumerate() {
        info!("{}: {}", i, file.display());
    }
    Ok(files)
}

fn pre_params(args: &Args) -> PreProcessParams {
    PreProcessParams {
        dark: args.dark.clone(),
        flat: args.flat.clone(),
        debayer: CfaColor::parse(&args.debayer),
        cfa: CfaPattern::parse(&args.cfa).unwrap_or_default(),
        binning: args.binning,
        norm_range: args.norm_range != 0,
        bp_sig_low: args.bp_sig_low,
        bp_sig_high: args.bp_sig_high,
        star_sig: args.star_sig,
        star_bp_sig: args.star_bp_sig,
        star_radius: args.star_radius,
        back_grid: args.back_grid,
        back_sigma: args.back_sigma,
        back_clip: args.back_clip,
        pre_pattern: args.pre.clone(),
        star_pattern: args.stars.clone(),
        back_pattern: args.back.clone(),
        estimator: LsEstimator::from_flag(args.ls_est),
    }
}

fn post_params(args: &Args) -> PostProcessParams {
    PostProcessParams {
        align: args.align != 0,
        align_k: args.align_k,
        align_threshold: args.align_t,
        norm_hist: HistoNormMode::from_flag(args.norm_hist),
        oob_mode: OobMode::Nan,
        usm_sigma: args.usm_sigma,
        usm_gain: args.usm_gain,
        usm_threshold: args.usm_thresh,
        post_pattern: args.post.clone(),
        estimator: LsEstimator::from_flag(args.ls_est),
    }
}

fn stack_params(args: &Args) -> StackParams {
    StackParams {
        mode: StackMode::from_flag(args.st_mode),
        weighted: args.st_weight,
        sigma_low: args.st_sig_low,
        sigma_high: args.st_sig_high,
        clip_perc_low: args.st_clip_perc_low,
        clip_perc_high: args.st_clip_perc_high,
        memory_mib: if args.st_memory > 0 {
            args.st_memory
        } else {
            default_memory_mib()
        },
        batch_pattern: args.batch.clone(),
    }
}

fn color_params(args: &Args) -> ColorParams {
    ColorParams {
        neut_sigma_low: args.neut_sigma_low,
        neut_sigma_high: args.neut_sigma_high,
        chroma_gamma: args.chroma_gamma,
        chroma_sigma: args.chroma_sigma,
        chroma_by: args.chroma_by,
        chroma_from: args.chroma_from,
        chroma_to: args.chroma_to,
        rot_by: args.rot_by,
        rot_from: args.rot_from,
        rot_to: args.rot_to,
        scnr: args.scnr,
    }
}

fn tone_params(args: &Args) -> ToneCurveParams {
    ToneCurveParams {
        auto_loc: args.auto_loc,
        auto_scale: args.auto_scale,
        midtone: args.midtone,
        mid_black: args.mid_black,
        gamma: args.gamma,
        pp_gamma: args.pp_gamma,
        pp_sigma: args.pp_sigma,
        scale_black: args.scale_black,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_auto() {
        let out = PathBuf::from("result.fits");
        assert_eq!(
            resolve_auto("%auto", &out, "jpg"),
            Some(PathBuf::from("result.jpg"))
        );
        assert_eq!(resolve_auto("", &out, "jpg"), None);
        assert_eq!(
            resolve_auto("custom.jpg", &out, "jpg"),
            Some(PathBuf::from("custom.jpg"))
        );
    }

    #[test]
    fn test_args_parse_stack_defaults() {
        let args = Args::parse_from(["nightlight", "stack", "a.fits", "b.fits"]);
        assert!(matches!(args.command, Command::Stack { ref files } if files.len() == 2));
        assert_eq!(args.out, PathBuf::from("out.fits"));
        assert_eq!(args.st_mode, 5);
        assert_eq!(args.align_k, 20);
        assert_eq!(args.ls_est, 3);

        let pre = pre_params(&args);
        assert!(pre.debayer.is_none());
        assert_eq!(pre.star_radius, 16);

        let stack = stack_params(&args);
        assert!(matches!(stack.mode, StackMode::Auto));
        assert_eq!(stack.sigma_low, -1.0);
    }

    #[test]
    fn test_args_parse_color_flags() {
        let args = Args::parse_from([
            "nightlight",
            "--scnr",
            "0.5",
            "--gamma",
            "2.2",
            "--debayer",
            "G",
            "--cfa",
            "BGGR",
            "rgb",
            "r.fits",
            "g.fits",
            "b.fits",
        ]);
        let color = color_params(&args);
        assert_eq!(color.scnr, 0.5);
        let tone = tone_params(&args);
        assert_eq!(tone.gamma, 2.2);
        let pre = pre_params(&args);
        assert_eq!(pre.debayer, Some(CfaColor::G));
        assert_eq!(pre.cfa, CfaPattern::Bggr);
    }
}
