//! FITS reading and writing.
//!
//! Implements the narrow contract the pipeline needs from the container
//! format: the primary image HDU as float32 physical values (integer types
//! rescaled by BZERO/BSCALE), the axis lengths, the exposure, and the header
//! cards round-tripped in order. Processed output is always written as
//! BITPIX = −32.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::common::pool::BufferPool;

use super::FitsImage;

/// FITS block size; headers and data are padded to multiples of this.
const BLOCK: usize = 2880;
/// Length of one header card.
const CARD: usize = 80;

/// One header card: keyword, value text, comment text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderCard {
    pub keyword: String,
    pub value: String,
    pub comment: String,
}

/// Ordered FITS header, preserved verbatim through read/modify/write.
///
/// Structural cards (SIMPLE, BITPIX, NAXIS*, BZERO, BSCALE, END) are owned
/// by the reader/writer and are not stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FitsHeader {
    cards: Vec<HeaderCard>,
}

/// Keywords the writer regenerates; they never enter the preserved card list.
const STRUCTURAL_KEYWORDS: [&str; 7] =
    ["SIMPLE", "BITPIX", "NAXIS", "BZERO", "BSCALE", "END", "EXTEND"];

impl FitsHeader {
    pub fn new() -> Self {
        Self { cards: Vec::new() }
    }

    pub fn cards(&self) -> &[HeaderCard] {
        &self.cards
    }

    /// Value text of the first card with the given keyword.
    pub fn value(&self, keyword: &str) -> Option<&str> {
        self.cards
            .iter()
            .find(|c| c.keyword == keyword)
            .map(|c| c.value.as_str())
    }

    /// Numeric value of the first card with the given keyword.
    pub fn value_f32(&self, keyword: &str) -> Option<f32> {
        self.value(keyword).and_then(|v| v.trim().parse().ok())
    }

    /// Append or replace a card.
    pub fn set(&mut self, keyword: &str, value: &str, comment: &str) {
        let card = HeaderCard {
            keyword: keyword.to_string(),
            value: value.to_string(),
            comment: comment.to_string(),
        };
        match self.cards.iter_mut().find(|c| c.keyword == keyword) {
            Some(existing) => *existing = card,
            None => self.cards.push(card),
        }
    }

    fn push_parsed(&mut self, keyword: String, value: String, comment: String) {
        self.cards.push(HeaderCard {
            keyword,
            value,
            comment,
        });
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Read the primary HDU of a FITS file.
pub fn read_fits(path: &Path) -> Result<FitsImage> {
    read_fits_pooled(path, None)
}

/// Read the primary HDU, drawing the pixel buffer from a pool when provided.
pub fn read_fits_pooled(path: &Path, pool: Option<&BufferPool>) -> Result<FitsImage> {
    let file =
        File::open(path).with_context(|| format!("failed to open FITS file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let parsed = read_header(&mut reader)
        .with_context(|| format!("failed to parse FITS header of {}", path.display()))?;

    let pixel_count: usize = parsed.naxisn.iter().product();
    if pixel_count == 0 {
        bail!("FITS file {} has no image data", path.display());
    }
    if parsed.naxisn.len() < 2 || parsed.naxisn.len() > 3 {
        bail!(
            "unsupported NAXIS={} in {}",
            parsed.naxisn.len(),
            path.display()
        );
    }

    let bytes_per_pixel = (parsed.bitpix.unsigned_abs() / 8) as usize;
    let mut raw = vec![0u8; pixel_count * bytes_per_pixel];
    reader
        .read_exact(&mut raw)
        .with_context(|| format!("truncated FITS data in {}", path.display()))?;

    let mut pixels = match pool {
        Some(pool) => {
            let mut buf = pool.f32s.acquire(pixel_count);
            buf.clear();
            buf
        }
        None => Vec::with_capacity(pixel_count),
    };
    decode_pixels(&raw, parsed.bitpix, parsed.bzero, parsed.bscale, &mut pixels)?;

    let exposure = parsed.header.value_f32("EXPTIME").unwrap_or(0.0);

    Ok(FitsImage {
        id: 0,
        naxisn: parsed.naxisn,
        bitpix: parsed.bitpix,
        bzero: parsed.bzero,
        exposure,
        pixels,
        header: parsed.header,
        stats: None,
        stars: Vec::new(),
        hfr: 0.0,
        transform: crate::registration::transform::Transform2D::identity(),
        residual: 0.0,
    })
}

struct ParsedHeader {
    bitpix: i32,
    naxisn: Vec<usize>,
    bzero: f32,
    bscale: f32,
    header: FitsHeader,
}

fn read_header<R: Read>(reader: &mut R) -> Result<ParsedHeader> {
    let mut bitpix: Option<i32> = None;
    let mut naxis: Option<usize> = None;
    let mut naxisn: Vec<usize> = Vec::new();
    let mut bzero = 0.0f32;
    let mut bscale = 1.0f32;
    let mut header = FitsHeader::new();
    let mut block = [0u8; BLOCK];
    let mut first_block = true;

    'blocks: loop {
        reader.read_exact(&mut block).context("truncated header")?;
        for card in block.chunks_exact(CARD) {
            let text = std::str::from_utf8(card).context("header card is not ASCII")?;
            let keyword = text[..8].trim_end().to_string();

            if first_block && keyword != "SIMPLE" {
                bail!("not a FITS file: missing SIMPLE card");
            }
            first_block = false;

            if keyword == "END" {
                break 'blocks;
            }
            if keyword.is_empty() {
                continue;
            }

            let (value, comment) = split_value_comment(&text[8..]);

            if keyword == "BITPIX" {
                bitpix = Some(value.trim().parse().context("invalid BITPIX")?);
            } else if keyword == "NAXIS" {
                naxis = Some(value.trim().parse().context("invalid NAXIS")?);
            } else if let Some(axis) = keyword.strip_prefix("NAXIS")
                && let Ok(axis) = axis.parse::<usize>()
            {
                let len: usize = value.trim().parse().context("invalid NAXISn")?;
                if naxisn.len() < axis {
                    naxisn.resize(axis, 0);
                }
                naxisn[axis - 1] = len;
            } else if keyword == "BZERO" {
                bzero = value.trim().parse().unwrap_or(0.0);
            } else if keyword == "BSCALE" {
                bscale = value.trim().parse().unwrap_or(1.0);
            } else if !STRUCTURAL_KEYWORDS.contains(&keyword.as_str()) {
                header.push_parsed(keyword, value, comment);
            }
        }
    }

    let bitpix = bitpix.context("missing BITPIX")?;
    let naxis = naxis.context("missing NAXIS")?;
    if naxisn.len() != naxis || naxisn.iter().any(|&n| n == 0) {
        bail!("inconsistent NAXIS/NAXISn cards");
    }
    match bitpix {
        8 | 16 | 32 | 64 | -32 | -64 => {}
        other => bail!("unsupported BITPIX {}", other),
    }

    Ok(ParsedHeader {
        bitpix,
        naxisn,
        bzero,
        bscale,
        header,
    })
}

/// Split the post-keyword part of a card into value and comment text.
/// The comment separator is the first `/` outside a quoted string.
fn split_value_comment(rest: &str) -> (String, String) {
    let rest = rest.strip_prefix("= ").unwrap_or(rest);
    let mut in_quote = false;
    for (i, ch) in rest.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            '/' if !in_quote => {
                return (
                    rest[..i].trim().to_string(),
                    rest[i + 1..].trim().to_string(),
                );
            }
            _ => {}
        }
    }
    (rest.trim().to_string(), String::new())
}

fn decode_pixels(
    raw: &[u8],
    bitpix: i32,
    bzero: f32,
    bscale: f32,
    out: &mut Vec<f32>,
) -> Result<()> {
    match bitpix {
        8 => out.extend(raw.iter().map(|&b| bzero + bscale * b as f32)),
        16 => out.extend(
            raw.chunks_exact(2)
                .map(|c| bzero + bscale * i16::from_be_bytes([c[0], c[1]]) as f32),
        ),
        32 => out.extend(
            raw.chunks_exact(4)
                .map(|c| bzero + bscale * i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f32),
        ),
        64 => out.extend(raw.chunks_exact(8).map(|c| {
            let v = i64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
            bzero + bscale * v as f32
        })),
        -32 => out.extend(
            raw.chunks_exact(4)
                .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]])),
        ),
        -64 => out.extend(raw.chunks_exact(8).map(|c| {
            f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
        })),
        other => bail!("unsupported BITPIX {}", other),
    }
    Ok(())
}

// ============================================================================
// Writing
// ============================================================================

/// Write an image as a single-HDU FITS file with BITPIX = −32.
///
/// The preserved header cards follow the regenerated structural cards, in
/// their original order.
pub fn write_fits(image: &FitsImage, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create FITS file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut cards: Vec<String> = Vec::new();
    cards.push(format_card("SIMPLE", "T", "file conforms to FITS standard"));
    cards.push(format_card("BITPIX", "-32", "IEEE 754 32-bit float"));
    cards.push(format_card("NAXIS", &image.naxisn.len().to_string(), ""));
    for (i, len) in image.naxisn.iter().enumerate() {
        cards.push(format_card(&format!("NAXIS{}", i + 1), &len.to_string(), ""));
    }
    for card in image.header.cards() {
        if STRUCTURAL_KEYWORDS.contains(&card.keyword.as_str())
            || card.keyword.starts_with("NAXIS")
        {
            continue;
        }
        cards.push(format_card(&card.keyword, &card.value, &card.comment));
    }
    cards.push(format!("{:<80}", "END"));

    let mut header_bytes: Vec<u8> = cards.into_iter().flat_map(String::into_bytes).collect();
    pad_to_block(&mut header_bytes, b' ');
    writer.write_all(&header_bytes)?;

    // Big-endian f32 payload; swap in u32 space, then view as bytes.
    let be_words: Vec<u32> = image.pixels.iter().map(|v| v.to_bits().to_be()).collect();
    let mut data_bytes: Vec<u8> = bytemuck::cast_slice::<u32, u8>(&be_words).to_vec();
    pad_to_block(&mut data_bytes, 0);
    writer.write_all(&data_bytes)?;

    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn pad_to_block(bytes: &mut Vec<u8>, fill: u8) {
    let rem = bytes.len() % BLOCK;
    if rem != 0 {
        bytes.resize(bytes.len() + BLOCK - rem, fill);
    }
}

/// Format one 80-byte header card. COMMENT and HISTORY cards carry free
/// text instead of a value indicator.
fn format_card(keyword: &str, value: &str, comment: &str) -> String {
    let mut card = if keyword == "COMMENT" || keyword == "HISTORY" {
        format!("{:<8}{}{}", keyword, value, comment)
    } else if value.is_empty() {
        format!("{:<8}{}", keyword, comment)
    } else if comment.is_empty() {
        format!("{:<8}= {:>20}", keyword, value)
    } else {
        format!("{:<8}= {:>20} / {}", keyword, value, comment)
    };
    card.truncate(CARD);
    format!("{:<80}", card)
}
