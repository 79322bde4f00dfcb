//! Content checksums and thumbnail encoding for captured images.

use crate::error::{PipelineError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

const CHECKSUM_CHUNK_SIZE: usize = 8192;

/// Share of the capture quality used for thumbnails.
const THUMBNAIL_QUALITY_RATIO: f64 = 0.9;

/// SHA-256 of a file as lowercase hex, streamed in fixed-size chunks.
pub fn checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| PipelineError::filesystem(path, e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHECKSUM_CHUNK_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| PipelineError::filesystem(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Thumbnail JPEG quality derived from the capture quality.
pub fn thumbnail_quality(jpeg_quality: u8) -> u8 {
    (f64::from(jpeg_quality) * THUMBNAIL_QUALITY_RATIO)
        .round()
        .clamp(1.0, 100.0) as u8
}

/// Decode `src`, shrink it to fit within `max_size` keeping the aspect
/// ratio, and write it to `dest` as a JPEG.
///
/// Images already inside the bounding box are re-encoded at their own size.
pub fn thumbnail(src: &Path, dest: &Path, max_size: (u32, u32), quality: u8) -> Result<()> {
    let img = image::open(src)?;
    let (max_w, max_h) = max_size;

    let thumb = if img.width() > max_w || img.height() > max_h {
        img.resize(max_w, max_h, FilterType::Lanczos3)
    } else {
        img
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::filesystem(parent, e))?;
    }

    let file = File::create(dest).map_err(|e| PipelineError::filesystem(dest, e))?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100));
    // JPEG has no alpha channel
    thumb.to_rgb8().write_with_encoder(encoder)?;
    writer.flush().map_err(|e| PipelineError::filesystem(dest, e))?;

    debug!(
        dest = %dest.display(),
        width = thumb.width(),
        height = thumb.height(),
        quality = quality,
        "Thumbnail written"
    );

    Ok(())
}

/// Best-effort image dimensions; `None` when the header cannot be read.
pub fn probe_dimensions(path: &Path) -> Option<(u32, u32)> {
    image::image_dimensions(path).ok()
}
