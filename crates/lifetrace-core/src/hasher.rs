use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use image_hasher::{HashAlg, HasherConfig};

use crate::error::{CoreError, Result};

/// Perceptual image hasher: 8x8 grayscale downscale compared against the
/// mean, yielding a 64-bit hash rendered as 16 hex characters.
///
/// Hashes double as content addresses in the image store and as the basis
/// for near-duplicate detection via hamming distance.
pub struct PerceptualHasher {
    hasher: image_hasher::Hasher,
}

impl PerceptualHasher {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Mean)
            .to_hasher();

        Self { hasher }
    }

    /// Compute the 16-hex perceptual hash of an image.
    pub fn hash_image(&self, image: &DynamicImage) -> String {
        let hash = self.hasher.hash_image(image);
        let bytes = hash.as_bytes();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Decode JPEG bytes and hash. Returns `None` on undecodable input
    /// (callers treat that conservatively, not as an error).
    pub fn hash_jpeg(&self, bytes: &[u8]) -> Option<String> {
        let img = image::load_from_memory(bytes).ok()?;
        Some(self.hash_image(&img))
    }

    /// Hamming distance between two 16-hex hashes (0 = identical,
    /// 64 = maximally different). Malformed input counts as maximal.
    pub fn hamming_distance(hash_a: &str, hash_b: &str) -> u32 {
        match (parse_hash(hash_a), parse_hash(hash_b)) {
            (Some(a), Some(b)) => (a ^ b).count_ones(),
            _ => 64,
        }
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_hash(hex: &str) -> Option<u64> {
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// Encode an image as JPEG at the given quality. Alpha is dropped.
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb: RgbImage = image.to_rgb8();
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)
        .map_err(|e| CoreError::Image(format!("jpeg encode: {e}")))?;
    Ok(buf)
}

/// Decode image bytes (any supported format) into a `DynamicImage`.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| CoreError::Image(format!("decode: {e}")))
}

/// Resize to fit within `max_width` x `max_height`, preserving aspect ratio.
/// Images already inside the bounds are returned unchanged.
pub fn resize_to_fit(image: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if image.width() <= max_width && image.height() <= max_height {
        return image.clone();
    }
    image.resize(max_width, max_height, image::imageops::FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(r: u8, g: u8, b: u8, w: u32, h: u32) -> DynamicImage {
        let mut img = RgbImage::new(w, h);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        DynamicImage::ImageRgb8(img)
    }

    fn gradient(w: u32, h: u32, invert: bool) -> DynamicImage {
        let mut img = RgbImage::new(w, h);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = ((x * 4) as u8).wrapping_add((y * 4) as u8);
            let v = if invert { 255u8.wrapping_sub(v) } else { v };
            *pixel = Rgb([v, v, v]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn hash_is_16_hex() {
        let hasher = PerceptualHasher::new();
        let hash = hasher.hash_image(&gradient(64, 64, false));
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_images_have_zero_distance() {
        let hasher = PerceptualHasher::new();
        let img = gradient(64, 64, false);
        let a = hasher.hash_image(&img);
        let b = hasher.hash_image(&img);
        assert_eq!(PerceptualHasher::hamming_distance(&a, &b), 0);
    }

    #[test]
    fn different_images_have_high_distance() {
        let hasher = PerceptualHasher::new();
        let a = hasher.hash_image(&gradient(64, 64, false));
        let b = hasher.hash_image(&gradient(64, 64, true));
        let dist = PerceptualHasher::hamming_distance(&a, &b);
        assert!(dist > 10, "expected high distance, got {dist}");
    }

    #[test]
    fn malformed_hash_is_maximal_distance() {
        assert_eq!(PerceptualHasher::hamming_distance("zz", "00ff00ff00ff00ff"), 64);
        assert_eq!(PerceptualHasher::hamming_distance("", ""), 64);
    }

    #[test]
    fn jpeg_encode_decode_round_trip() {
        let img = gradient(128, 72, false);
        let bytes = encode_jpeg(&img, 85).unwrap();
        assert!(!bytes.is_empty());

        let back = decode_image(&bytes).unwrap();
        assert_eq!(back.width(), 128);
        assert_eq!(back.height(), 72);
    }

    #[test]
    fn jpeg_round_trip_keeps_phash_close() {
        let hasher = PerceptualHasher::new();
        let img = gradient(320, 180, false);
        let original = hasher.hash_image(&img);

        let bytes = encode_jpeg(&img, 75).unwrap();
        let reloaded = hasher.hash_jpeg(&bytes).unwrap();

        let dist = PerceptualHasher::hamming_distance(&original, &reloaded);
        assert!(dist <= 2, "jpeg artifacts moved hash too far: {dist}");
    }

    #[test]
    fn resize_to_fit_preserves_aspect() {
        let img = solid(10, 20, 30, 1920, 1080);
        let resized = resize_to_fit(&img, 400, 225);
        assert_eq!(resized.width(), 400);
        assert_eq!(resized.height(), 225);
    }

    #[test]
    fn resize_to_fit_does_not_upscale() {
        let img = solid(10, 20, 30, 200, 100);
        let resized = resize_to_fit(&img, 400, 225);
        assert_eq!(resized.width(), 200);
        assert_eq!(resized.height(), 100);
    }
}
