//! Capacity planning, embed, and extract over a set of cover images.
//!
//! The engine owns a list of `(source, destination)` image pairs for one
//! embed pass. `precompute` turns a payload length into a per-image
//! allocation proportional to each image's entropy budget; `embed`
//! writes one piece per planned image; `extract` needs only a single
//! image. The highest-entropy square of each image is reserved as a
//! header square carrying the piece's byte length, so extraction knows
//! how much to read without any side channel.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, LumaA, Rgb, Rgba};
use log::{debug, info};
use thiserror::Error;

use crate::stego::square::{ranked_squares, square_byte_offsets, square_capacity, Square};

#[derive(Debug, Error)]
pub enum StegoError {
    #[error("payload of {data_len} bytes cannot fit the supplied images")]
    OversizedData { data_len: usize },

    #[error("decoded length header {len} outside the valid range {min}..={max}")]
    InvalidLen { len: u64, min: u64, max: u64 },

    #[error("piece {index} is {actual} bytes, expected {expected}")]
    PieceLength {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("{pieces} pieces supplied for a plan of {planned} images")]
    PieceCount { pieces: usize, planned: usize },

    #[error("precompute has not been run")]
    NotPrecomputed,

    #[error("pixel buffer did not match the image dimensions")]
    PixelBuffer,

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StegoError>;

struct CoverImage {
    image: DynamicImage,
    dst: PathBuf,
}

struct ImageStats {
    /// Squares in embed order (descending entropy), entropies dropped.
    ranked: Vec<Square>,
    /// Sum of per-square entropies; drives the proportional allocation.
    entropy_budget: f64,
    /// Payload bytes the image can hold, header square excluded.
    capacity: usize,
}

struct PlanEntry {
    image_idx: usize,
    /// Logical payload length for this image; the caller's piece is
    /// this plus the reserved size.
    length: usize,
    ranked: Vec<Square>,
}

/// Result of `precompute`: which images carry how much.
pub struct Plan {
    entries: Vec<PlanEntry>,
}

impl Plan {
    /// Per-image payload lengths; the distributor chunks with exactly
    /// these.
    pub fn lengths(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.length).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct StegoEngine {
    reserved: usize,
    images: Vec<CoverImage>,
    plan: Option<Plan>,
}

impl StegoEngine {
    /// `reserved` is the fixed per-piece overhead above the logical
    /// payload (the chunk envelope plus the encryption envelope).
    pub fn new(reserved: usize) -> Self {
        Self {
            reserved,
            images: Vec::new(),
            plan: None,
        }
    }

    /// Decode a cover image and register it with its output path.
    /// Invalidates any existing plan.
    pub fn add_image(&mut self, src: impl AsRef<Path>, dst: impl Into<PathBuf>) -> Result<()> {
        let image = normalize(image::open(src)?);
        self.images.push(CoverImage {
            image,
            dst: dst.into(),
        });
        self.plan = None;
        Ok(())
    }

    /// Release all images and any plan.
    pub fn clear(&mut self) {
        self.images.clear();
        self.plan = None;
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Allocate `data_len` payload bytes across the images,
    /// proportionally to entropy budget. Images too small for their
    /// share are dropped and the allocation recomputed until every
    /// remaining image fits; ceiling slack is absorbed by the tail so
    /// the lengths sum to `data_len` exactly.
    pub fn precompute(&mut self, data_len: usize) -> Result<&Plan> {
        if self.plan.is_none() {
            self.plan = Some(self.compute_plan(data_len)?);
        }
        self.plan.as_ref().ok_or(StegoError::NotPrecomputed)
    }

    fn compute_plan(&self, data_len: usize) -> Result<Plan> {
        let stats: Vec<ImageStats> = self.images.iter().map(|c| analyze(&c.image)).collect();
        let mut active: Vec<usize> = (0..self.images.len()).collect();

        let share_of = |idx: usize, entropy_sum: f64| -> usize {
            ((data_len as f64) * stats[idx].entropy_budget / entropy_sum).ceil() as usize
        };

        // drop images that cannot hold their proportional share and
        // reallocate, until every remaining image fits
        let entropy_sum = loop {
            let entropy_sum: f64 = active.iter().map(|&i| stats[i].entropy_budget).sum();
            if active.is_empty() || entropy_sum <= 0.0 {
                return Err(StegoError::OversizedData { data_len });
            }
            let overflowing = active
                .iter()
                .position(|&idx| share_of(idx, entropy_sum) + self.reserved > stats[idx].capacity);
            match overflowing {
                Some(pos) => {
                    debug!("dropping image {}: share exceeds its capacity", active[pos]);
                    active.remove(pos);
                }
                None => break entropy_sum,
            }
        };

        let mut remaining = data_len;
        let mut entries = Vec::with_capacity(active.len());
        for (&idx, stat) in active.iter().map(|i| (i, &stats[*i])) {
            let length = share_of(idx, entropy_sum).min(remaining);
            remaining -= length;
            if length == 0 {
                continue;
            }
            entries.push(PlanEntry {
                image_idx: idx,
                length,
                ranked: stat.ranked.clone(),
            });
        }
        if remaining > 0 || entries.is_empty() {
            return Err(StegoError::OversizedData { data_len });
        }

        debug!(
            "planned {} bytes over {} of {} images",
            data_len,
            entries.len(),
            self.images.len()
        );
        Ok(Plan { entries })
    }

    /// Write one piece per planned image and encode the results to
    /// their destinations. `pieces[i]` must be exactly the plan's
    /// length plus the reserved size.
    pub fn embed(&self, pieces: &[Vec<u8>], format: ImageFormat) -> Result<()> {
        let plan = self.plan.as_ref().ok_or(StegoError::NotPrecomputed)?;
        if pieces.len() != plan.entries.len() {
            return Err(StegoError::PieceCount {
                pieces: pieces.len(),
                planned: plan.entries.len(),
            });
        }
        for (index, (piece, entry)) in pieces.iter().zip(&plan.entries).enumerate() {
            let expected = entry.length + self.reserved;
            if piece.len() != expected {
                return Err(StegoError::PieceLength {
                    index,
                    expected,
                    actual: piece.len(),
                });
            }
        }

        for (piece, entry) in pieces.iter().zip(&plan.entries) {
            let cover = &self.images[entry.image_idx];
            let width = cover.image.width() as usize;
            let channels = cover.image.color().channel_count() as usize;

            let mut pixels = cover.image.as_bytes().to_vec();
            embed_piece(&mut pixels, width, channels, &entry.ranked, piece)?;

            let stamped = rebuild(&cover.image, pixels)?;
            stamped.save_with_format(&cover.dst, format)?;
            info!("embedded {} bytes into {}", piece.len(), cover.dst.display());
        }
        Ok(())
    }

    /// Recover the embedded piece from a single carrier image.
    /// `reserved` bounds the decoded length from below; a piece can
    /// never be shorter than its fixed overhead.
    pub fn extract(src: impl AsRef<Path>, reserved: usize) -> Result<Vec<u8>> {
        let image = normalize(image::open(src)?);
        let width = image.width() as usize;
        let height = image.height() as usize;
        let channels = image.color().channel_count() as usize;
        let pixels = image.as_bytes();

        let ranked: Vec<Square> = ranked_squares(pixels, width, height, channels)
            .into_iter()
            .map(|(square, _)| square)
            .collect();
        let max = (ranked.len().saturating_sub(1) * square_capacity(channels)) as u64;

        let bounds_err = |len: u64| StegoError::InvalidLen {
            len,
            min: reserved as u64,
            max,
        };
        if ranked.is_empty() {
            return Err(bounds_err(0));
        }

        let mut header_offsets = square_byte_offsets(width, channels, ranked[0]);
        let mut header = [0u8; 8];
        for byte in &mut header {
            *byte = read_lsb_byte(pixels, &mut header_offsets).ok_or_else(|| bounds_err(0))?;
        }
        let len = u64::from_le_bytes(header);
        if len < reserved as u64 || len > max {
            return Err(bounds_err(len));
        }

        let mut offsets = ranked[1..]
            .iter()
            .flat_map(move |&square| square_byte_offsets(width, channels, square));
        let mut piece = Vec::with_capacity(len as usize);
        for _ in 0..len {
            piece.push(read_lsb_byte(pixels, &mut offsets).ok_or_else(|| bounds_err(len))?);
        }
        Ok(piece)
    }
}

/// Keep 8-bit layouts as they are; anything else becomes RGBA8.
fn normalize(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_) => image,
        other => DynamicImage::ImageRgba8(other.to_rgba8()),
    }
}

fn analyze(image: &DynamicImage) -> ImageStats {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let channels = image.color().channel_count() as usize;

    let ranked_with_entropy = ranked_squares(image.as_bytes(), width, height, channels);
    let entropy_budget = ranked_with_entropy.iter().map(|(_, e)| e).sum();
    let capacity = ranked_with_entropy.len().saturating_sub(1) * square_capacity(channels);
    let ranked = ranked_with_entropy
        .into_iter()
        .map(|(square, _)| square)
        .collect();
    ImageStats {
        ranked,
        entropy_budget,
        capacity,
    }
}

/// Length header into the top square, payload bits into the rest, in
/// rank order. One bit per byte, most significant bit of each payload
/// byte first.
fn embed_piece(
    pixels: &mut [u8],
    width: usize,
    channels: usize,
    ranked: &[Square],
    piece: &[u8],
) -> Result<()> {
    let payload_capacity = ranked.len().saturating_sub(1) * square_capacity(channels);
    if ranked.is_empty() || piece.len() > payload_capacity {
        return Err(StegoError::OversizedData {
            data_len: piece.len(),
        });
    }

    // 64 header bits always fit: a square has 256·channels positions
    let mut header_offsets = square_byte_offsets(width, channels, ranked[0]);
    for byte in (piece.len() as u64).to_le_bytes() {
        write_lsb_byte(pixels, &mut header_offsets, byte);
    }

    let mut offsets = ranked[1..]
        .iter()
        .flat_map(move |&square| square_byte_offsets(width, channels, square));
    for &byte in piece {
        if !write_lsb_byte(pixels, &mut offsets, byte) {
            return Err(StegoError::OversizedData {
                data_len: piece.len(),
            });
        }
    }
    Ok(())
}

fn write_lsb_byte(
    pixels: &mut [u8],
    offsets: &mut impl Iterator<Item = usize>,
    byte: u8,
) -> bool {
    for bit in (0..8).rev() {
        let Some(position) = offsets.next() else {
            return false;
        };
        pixels[position] = (pixels[position] & !1) | ((byte >> bit) & 1);
    }
    true
}

fn read_lsb_byte(pixels: &[u8], offsets: &mut impl Iterator<Item = usize>) -> Option<u8> {
    let mut byte = 0u8;
    for _ in 0..8 {
        let position = offsets.next()?;
        byte = (byte << 1) | (pixels[position] & 1);
    }
    Some(byte)
}

fn rebuild(original: &DynamicImage, pixels: Vec<u8>) -> Result<DynamicImage> {
    let (width, height) = (original.width(), original.height());
    let rebuilt = match original {
        DynamicImage::ImageLuma8(_) => {
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, pixels)
                .map(DynamicImage::ImageLuma8)
        }
        DynamicImage::ImageLumaA8(_) => {
            ImageBuffer::<LumaA<u8>, _>::from_raw(width, height, pixels)
                .map(DynamicImage::ImageLumaA8)
        }
        DynamicImage::ImageRgb8(_) => ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, pixels)
            .map(DynamicImage::ImageRgb8),
        _ => ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, pixels)
            .map(DynamicImage::ImageRgba8),
    };
    rebuilt.ok_or(StegoError::PixelBuffer)
}
