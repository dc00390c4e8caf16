//! 8-bit JPEG preview export.
//!
//! Previews assume tone-mapped data in [0, 1]; values outside that range are
//! clamped and NaN renders as black.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, RgbImage};

use super::FitsImage;

fn to_u8(v: f32) -> u8 {
    if v.is_nan() {
        return 0;
    }
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// Write an 8-bit JPEG preview of the image.
pub fn write_jpeg(image: &FitsImage, path: &Path, quality: u8) -> Result<()> {
    let width = image.width() as u32;
    let height = image.height() as u32;

    let file = File::create(path)
        .with_context(|| format!("failed to create JPEG file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality);

    if image.is_rgb() {
        let (r, g, b) = (image.channel(0), image.channel(1), image.channel(2));
        let mut interleaved = Vec::with_capacity(r.len() * 3);
        for i in 0..r.len() {
            interleaved.push(to_u8(r[i]));
            interleaved.push(to_u8(g[i]));
            interleaved.push(to_u8(b[i]));
        }
        let rgb = RgbImage::from_raw(width, height, interleaved)
            .context("preview buffer size mismatch")?;
        rgb.write_with_encoder(encoder)
            .with_context(|| format!("failed to encode {}", path.display()))?;
    } else {
        let gray: Vec<u8> = image.pixels.iter().map(|&v| to_u8(v)).collect();
        let gray =
            GrayImage::from_raw(width, height, gray).context("preview buffer size mismatch")?;
        gray.write_with_encoder(encoder)
            .with_context(|| format!("failed to encode {}", path.display()))?;
    }
    Ok(())
}
