//! Image normalization ahead of face encoding.
//!
//! Applies the EXIF orientation tag, bounds the longer side to
//! [`MAX_DIMENSION`] pixels and forces 3-channel RGB.

use exif::{In, Reader, Tag};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Longer side limit, in pixels, of a normalized image.
pub const MAX_DIMENSION: u32 = 1200;

/// JPEG quality used when a normalized image is serialized for storage.
const STORAGE_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("image corrupt: {0}")]
    ImageCorrupt(String),
}

impl From<image::ImageError> for NormalizeError {
    fn from(err: image::ImageError) -> Self {
        NormalizeError::ImageCorrupt(err.to_string())
    }
}

/// An upright, size-bounded RGB8 image ready for the encoder.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    rgb: RgbImage,
}

impl NormalizedImage {
    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// Serialize as JPEG; this is the form persisted as a reference image.
    pub fn to_jpeg(&self) -> Result<Vec<u8>, NormalizeError> {
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, STORAGE_JPEG_QUALITY).write_image(
            self.rgb.as_raw(),
            self.rgb.width(),
            self.rgb.height(),
            image::ExtendedColorType::Rgb8,
        )?;
        Ok(buffer)
    }
}

/// Decode, orient, downscale and convert raw capture bytes.
///
/// The input buffer is consumed; only the normalized copy survives.
pub fn normalize(raw: Vec<u8>) -> Result<NormalizedImage, NormalizeError> {
    let decoded = image::load_from_memory(&raw)?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(NormalizeError::ImageCorrupt("image dimensions are zero".into()));
    }

    let orientation = read_orientation(&raw);
    drop(raw);

    let upright = apply_orientation(decoded, orientation);
    let bounded = bound_dimensions(upright, MAX_DIMENSION);

    tracing::debug!(
        orientation,
        width = bounded.width(),
        height = bounded.height(),
        "image normalized"
    );

    Ok(NormalizedImage {
        rgb: bounded.to_rgb8(),
    })
}

/// Read the EXIF orientation code, or 1 when absent or unreadable.
pub fn read_orientation(raw: &[u8]) -> u32 {
    match Reader::new().read_from_container(&mut Cursor::new(raw)) {
        Ok(exif) => exif
            .get_field(Tag::Orientation, In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    }
}

/// Rotate according to the orientation code.
///
/// Angles are counter-clockwise: 3 → 180°, 6 → 270°, 8 → 90°. Other codes,
/// including the mirrored variants, leave the image untouched.
pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        3 => image.rotate180(),
        // 270° counter-clockwise is a quarter turn clockwise.
        6 => image.rotate90(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Downscale proportionally so the longer side is at most `max_dimension`.
fn bound_dimensions(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    if image.width().max(image.height()) <= max_dimension {
        return image;
    }
    image.resize(max_dimension, max_dimension, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbaImage};

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    /// JPEG with an APP1 EXIF segment carrying only the orientation tag.
    fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Vec<u8> {
        let rgb = RgbImage::from_pixel(width, height, Rgb([120, 80, 60]));
        let jpeg = NormalizedImage { rgb }.to_jpeg().unwrap();

        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"MM\0\x2a\0\0\0\x08");
        tiff.extend_from_slice(&1u16.to_be_bytes()); // one IFD entry
        tiff.extend_from_slice(&0x0112u16.to_be_bytes()); // Orientation
        tiff.extend_from_slice(&3u16.to_be_bytes()); // SHORT
        tiff.extend_from_slice(&1u32.to_be_bytes());
        tiff.extend_from_slice(&orientation.to_be_bytes());
        tiff.extend_from_slice(&[0, 0]);
        tiff.extend_from_slice(&0u32.to_be_bytes()); // no next IFD

        let mut payload = b"Exif\0\0".to_vec();
        payload.extend_from_slice(&tiff);

        let mut out = jpeg[..2].to_vec(); // SOI
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    fn marked(width: u32, height: u32) -> DynamicImage {
        // Single red pixel at the top-left corner.
        let mut rgb = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
        rgb.put_pixel(0, 0, Rgb([255, 0, 0]));
        DynamicImage::ImageRgb8(rgb)
    }

    #[test]
    fn test_orientation_3_rotates_180() {
        let out = apply_orientation(marked(4, 2), 3).to_rgb8();
        assert_eq!(out.dimensions(), (4, 2));
        assert_eq!(out.get_pixel(3, 1), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_orientation_6_turns_clockwise() {
        let out = apply_orientation(marked(4, 2), 6).to_rgb8();
        assert_eq!(out.dimensions(), (2, 4));
        assert_eq!(out.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_orientation_8_turns_counter_clockwise() {
        let out = apply_orientation(marked(4, 2), 8).to_rgb8();
        assert_eq!(out.dimensions(), (2, 4));
        assert_eq!(out.get_pixel(0, 3), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_other_orientations_untouched() {
        for code in [0, 1, 2, 4, 5, 7, 9] {
            let out = apply_orientation(marked(4, 2), code).to_rgb8();
            assert_eq!(out.dimensions(), (4, 2), "code {code}");
            assert_eq!(out.get_pixel(0, 0), &Rgb([255, 0, 0]), "code {code}");
        }
    }

    #[test]
    fn test_exif_orientation_read_and_applied() {
        let raw = jpeg_with_orientation(64, 32, 6);
        assert_eq!(read_orientation(&raw), 6);

        let normalized = normalize(raw).unwrap();
        assert_eq!((normalized.width(), normalized.height()), (32, 64));
    }

    #[test]
    fn test_missing_exif_reads_as_upright() {
        let raw = png_bytes(&marked(8, 8));
        assert_eq!(read_orientation(&raw), 1);
    }

    #[test]
    fn test_oversized_capture_downscaled() {
        let raw = png_bytes(&DynamicImage::ImageRgb8(RgbImage::new(2400, 1800)));
        let normalized = normalize(raw).unwrap();
        assert_eq!((normalized.width(), normalized.height()), (1200, 900));
    }

    #[test]
    fn test_small_capture_keeps_size() {
        let raw = png_bytes(&DynamicImage::ImageRgb8(RgbImage::new(1200, 640)));
        let normalized = normalize(raw).unwrap();
        assert_eq!((normalized.width(), normalized.height()), (1200, 640));
    }

    #[test]
    fn test_alpha_dropped_to_rgb() {
        let rgba = RgbaImage::from_pixel(10, 10, image::Rgba([10, 20, 30, 128]));
        let raw = png_bytes(&DynamicImage::ImageRgba8(rgba));
        let normalized = normalize(raw).unwrap();
        assert_eq!(normalized.rgb().as_raw().len(), 10 * 10 * 3);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = normalize(b"definitely not an image".to_vec()).unwrap_err();
        assert!(matches!(err, NormalizeError::ImageCorrupt(_)));
    }

    #[test]
    fn test_jpeg_output_decodes() {
        let normalized = normalize(png_bytes(&marked(16, 12))).unwrap();
        let jpeg = normalized.to_jpeg().unwrap();
        let again = normalize(jpeg).unwrap();
        assert_eq!((again.width(), again.height()), (16, 12));
    }
}
