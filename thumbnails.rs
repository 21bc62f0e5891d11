use crate::error::{Error, Result};
use crate::exif_reader;
use crate::models::{Format, PhotoMetadata};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;

pub const THUMB_SHORT_SIDE: u32 = 256;
pub const THUMB_LONG_SIDE_MAX: u32 = 512;
pub const JPEG_QUALITY: u8 = 85;

/// Source crop (x, y, w, h) and output size for an image of `width` x `height`:
/// the long side is center-cropped to at most twice the short side, then the
/// short side is scaled to 256.
pub fn thumbnail_geometry(width: u32, height: u32) -> ((u32, u32, u32, u32), (u32, u32)) {
    let max_ratio = THUMB_LONG_SIDE_MAX / THUMB_SHORT_SIDE;
    let (crop_w, crop_h) = if width > height.saturating_mul(max_ratio) {
        (height * max_ratio, height)
    } else if height > width.saturating_mul(max_ratio) {
        (width, width * max_ratio)
    } else {
        (width, height)
    };
    let x = (width - crop_w) / 2;
    let y = (height - crop_h) / 2;

    let short = crop_w.min(crop_h).max(1);
    let scale = THUMB_SHORT_SIDE as f64 / short as f64;
    let out_w = ((crop_w as f64 * scale).round() as u32).clamp(1, THUMB_LONG_SIDE_MAX);
    let out_h = ((crop_h as f64 * scale).round() as u32).clamp(1, THUMB_LONG_SIDE_MAX);
    ((x, y, crop_w, crop_h), (out_w, out_h))
}

pub fn thumbnail_image(img: &DynamicImage) -> DynamicImage {
    let (width, height) = img.dimensions();
    let ((x, y, w, h), (out_w, out_h)) = thumbnail_geometry(width.max(1), height.max(1));
    img.crop_imm(x, y, w, h)
        .resize_exact(out_w, out_h, FilterType::CatmullRom)
}

pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)?;
    Ok(out)
}

/// Decodes the photo itself, or for containers `image` cannot read, the
/// JPEG preview embedded in its EXIF block.
pub fn decode_source(bytes: &[u8], format: Format) -> Result<DynamicImage> {
    if format.is_decodable() {
        return Ok(image::load_from_memory(bytes)?);
    }
    match exif_reader::embedded_preview(bytes) {
        Some(preview) => Ok(image::load_from_memory(&preview)?),
        None => image::load_from_memory(bytes)
            .map_err(|_| Error::Unsupported(format!("no decodable image data in {format} file"))),
    }
}

/// Pure bytes -> JPEG thumbnail bytes. CPU-bound; keep it on worker threads.
pub fn render_thumbnail(bytes: &[u8], format: Format) -> Result<Vec<u8>> {
    let img = decode_source(bytes, format)?;
    encode_jpeg(&thumbnail_image(&img))
}

/// Builds the `.meta` artifact. `fallback_date` is used when no embedded date exists.
pub fn extract_metadata(bytes: &[u8], format: Format, fallback_date: Option<i64>) -> PhotoMetadata {
    let exif = exif_reader::read_metadata_from_bytes(bytes).unwrap_or_default();
    let (mut width, mut height) = (exif.width, exif.height);
    if width.is_none() || height.is_none() {
        if let Ok(reader) = image::io::Reader::new(Cursor::new(bytes)).with_guessed_format() {
            if let Ok((w, h)) = reader.into_dimensions() {
                width = Some(w);
                height = Some(h);
            }
        }
    }
    PhotoMetadata {
        width,
        height,
        capture_date: exif.datetime_original.or(fallback_date),
        make: exif.make,
        model: exif.model,
        lens: exif.lens,
        gps_lat: exif.gps_lat,
        gps_lng: exif.gps_lng,
        format: Some(format),
    }
}
