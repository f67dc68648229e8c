use image::{DynamicImage, GenericImageView};
use lifetrace_core::hasher;
use serde::Serialize;
use tracing::{debug, warn};

/// 1 KB of JPEG ≈ 85 tokens in a vision request.
const TOKENS_PER_KB: f64 = 85.0;

const CROP_MARGIN: u32 = 10;
const MIN_CROP_SIDE: u32 = 100;
const MAX_CROP_AREA_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Ultra,
    Aggressive,
    Balanced,
    Quality,
}

impl CompressionLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ultra" => CompressionLevel::Ultra,
            "balanced" => CompressionLevel::Balanced,
            "quality" => CompressionLevel::Quality,
            _ => CompressionLevel::Aggressive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionLevel::Ultra => "ultra",
            CompressionLevel::Aggressive => "aggressive",
            CompressionLevel::Balanced => "balanced",
            CompressionLevel::Quality => "quality",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
    Low,
}

/// `(jpeg quality, max dimensions)` per level and importance.
fn compression_params(level: CompressionLevel, importance: Importance) -> (u8, (u32, u32)) {
    use CompressionLevel::*;
    use Importance::*;
    match (level, importance) {
        (Ultra, High) => (50, (600, 400)),
        (Ultra, Medium) => (40, (480, 320)),
        (Ultra, Low) => (30, (400, 300)),
        (Aggressive, High) => (60, (800, 600)),
        (Aggressive, Medium) => (50, (640, 480)),
        (Aggressive, Low) => (40, (480, 360)),
        (Balanced, High) => (75, (1280, 720)),
        (Balanced, Medium) => (65, (960, 540)),
        (Balanced, Low) => (55, (800, 450)),
        (Quality, High) => (85, (1920, 1080)),
        (Quality, Medium) => (80, (1600, 900)),
        (Quality, Low) => (75, (1280, 720)),
    }
}

// -- Importance scoring --

/// Weighted sum of contrast, complexity, and edge density, each normalized
/// to 0-100. Thresholds: > 60 high, > 30 medium, else low.
pub fn analyze_importance(img: &DynamicImage) -> Importance {
    let contrast = contrast_score(img);
    let complexity = complexity_score(img);
    let edges = edge_density_score(img);
    let score = contrast * 0.4 + complexity * 0.3 + edges * 0.3;

    if score > 60.0 {
        Importance::High
    } else if score > 30.0 {
        Importance::Medium
    } else {
        Importance::Low
    }
}

/// Pixel standard deviation of the grayscale image, scaled to 0-100.
pub fn contrast_score(img: &DynamicImage) -> f64 {
    let gray = img.to_luma8();
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    let n = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = pixels
        .iter()
        .map(|&p| {
            let d = p as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (variance.sqrt() / 2.55).min(100.0)
}

/// Mean first-difference magnitude on a 32x32 downscale, scaled to 0-100.
fn complexity_score(img: &DynamicImage) -> f64 {
    let small = img
        .resize_exact(32, 32, image::imageops::FilterType::Lanczos3)
        .to_rgb8();

    let mut horizontal = 0.0;
    let mut h_count = 0usize;
    let mut vertical = 0.0;
    let mut v_count = 0usize;

    for y in 0..32u32 {
        for x in 0..32u32 {
            let p = small.get_pixel(x, y);
            if y + 1 < 32 {
                let q = small.get_pixel(x, y + 1);
                for c in 0..3 {
                    horizontal += (p[c] as f64 - q[c] as f64).abs();
                    h_count += 1;
                }
            }
            if x + 1 < 32 {
                let q = small.get_pixel(x + 1, y);
                for c in 0..3 {
                    vertical += (p[c] as f64 - q[c] as f64).abs();
                    v_count += 1;
                }
            }
        }
    }

    let diff_h = if h_count > 0 { horizontal / h_count as f64 } else { 0.0 };
    let diff_v = if v_count > 0 { vertical / v_count as f64 } else { 0.0 };
    (((diff_h + diff_v) / 2.0) / 2.55).min(100.0)
}

/// Fraction of pixels whose edge response exceeds 50, scaled to 0-100.
fn edge_density_score(img: &DynamicImage) -> f64 {
    let gray = img.to_luma8();
    // 3x3 edge-finding kernel (8-neighbor Laplacian)
    let kernel = [-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];
    let edges = image::imageops::filter3x3(&gray, &kernel);
    let total = edges.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let strong = edges.as_raw().iter().filter(|&&p| p > 50).count();
    ((strong as f64 / total as f64) * 500.0).min(100.0)
}

// -- Region cropping --

#[derive(Debug, Clone, Serialize)]
pub struct CropOutcome {
    pub is_cropped: bool,
    pub crop_ratio: f64,
    pub reason: &'static str,
}

/// Keeps the previously accepted frame and crops the current one down to
/// the changed region when that region is meaningfully smaller than the
/// full frame.
pub struct RegionCropper {
    diff_threshold: u8,
    last: Option<DynamicImage>,
}

impl RegionCropper {
    pub fn new(diff_threshold: u8) -> Self {
        Self {
            diff_threshold,
            last: None,
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Returns the (possibly cropped) image plus the decision made.
    /// The first frame, oversized changes, and undersized regions all keep
    /// the full frame.
    pub fn crop(&mut self, img: &DynamicImage, force_full: bool) -> (DynamicImage, CropOutcome) {
        if force_full || self.last.is_none() {
            self.last = Some(img.clone());
            return (
                img.clone(),
                CropOutcome {
                    is_cropped: false,
                    crop_ratio: 1.0,
                    reason: "first_frame",
                },
            );
        }

        let prev = self.last.as_ref().unwrap();
        let Some((left, top, right, bottom)) = self.find_diff_bbox(prev, img) else {
            return (
                img.clone(),
                CropOutcome {
                    is_cropped: false,
                    crop_ratio: 1.0,
                    reason: "no_significant_change",
                },
            );
        };

        let crop_area = ((right - left) as f64) * ((bottom - top) as f64);
        let full_area = (img.width() as f64) * (img.height() as f64);
        let crop_ratio = crop_area / full_area;

        if crop_ratio > MAX_CROP_AREA_RATIO {
            self.last = Some(img.clone());
            return (
                img.clone(),
                CropOutcome {
                    is_cropped: false,
                    crop_ratio,
                    reason: "change_too_large",
                },
            );
        }

        let cropped = img.crop_imm(left, top, right - left, bottom - top);
        self.last = Some(img.clone());
        debug!(
            from = format!("{}x{}", img.width(), img.height()),
            to = format!("{}x{}", cropped.width(), cropped.height()),
            "cropped to changed region"
        );
        (
            cropped,
            CropOutcome {
                is_cropped: true,
                crop_ratio,
                reason: "changed_region",
            },
        )
    }

    /// Bounding box of pixels whose mean RGB difference exceeds the
    /// threshold, expanded by a margin. `None` when the images differ in
    /// size, nothing changed, or the region is below the minimum side.
    fn find_diff_bbox(
        &self,
        prev: &DynamicImage,
        curr: &DynamicImage,
    ) -> Option<(u32, u32, u32, u32)> {
        if prev.dimensions() != curr.dimensions() {
            return None;
        }
        let a = prev.to_rgb8();
        let b = curr.to_rgb8();
        let (width, height) = (a.width(), a.height());

        let mut min_x = u32::MAX;
        let mut max_x = 0u32;
        let mut min_y = u32::MAX;
        let mut max_y = 0u32;
        let threshold = self.diff_threshold as f64;

        for y in 0..height {
            for x in 0..width {
                let pa = a.get_pixel(x, y);
                let pb = b.get_pixel(x, y);
                let diff = (0..3)
                    .map(|c| (pa[c] as f64 - pb[c] as f64).abs())
                    .sum::<f64>()
                    / 3.0;
                if diff > threshold {
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }

        if min_x == u32::MAX {
            return None;
        }

        let left = min_x.saturating_sub(CROP_MARGIN);
        let top = min_y.saturating_sub(CROP_MARGIN);
        let right = (max_x + 1 + CROP_MARGIN).min(width);
        let bottom = (max_y + 1 + CROP_MARGIN).min(height);

        if right - left < MIN_CROP_SIDE || bottom - top < MIN_CROP_SIDE {
            return None;
        }
        Some((left, top, right, bottom))
    }
}

// -- The two-stage optimizer --

#[derive(Debug, Clone, Serialize)]
pub struct OptimizeOutcome {
    pub original_size: usize,
    pub final_size: usize,
    pub original_tokens: i64,
    pub optimized_tokens: i64,
    pub tokens_saved: i64,
    pub importance: Importance,
    pub quality: u8,
    pub was_cropped: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizerStats {
    pub images_processed: u64,
    pub total_original_bytes: u64,
    pub total_final_bytes: u64,
    pub total_tokens_saved: i64,
    pub high_importance: u64,
    pub medium_importance: u64,
    pub low_importance: u64,
    pub cropped_frames: u64,
}

/// Stage A: optional change-region cropping. Stage B: importance-driven
/// resize + JPEG re-encode from the level/importance table.
pub struct ImageOptimizer {
    level: CompressionLevel,
    cropper: Option<RegionCropper>,
    stats: OptimizerStats,
}

impl ImageOptimizer {
    pub fn new(level: CompressionLevel, enable_cropping: bool, crop_threshold: u8) -> Self {
        Self {
            level,
            cropper: enable_cropping.then(|| RegionCropper::new(crop_threshold)),
            stats: OptimizerStats::default(),
        }
    }

    /// Optimize one JPEG. Failures are non-fatal: the original bytes come
    /// back untouched.
    pub fn optimize(&mut self, jpeg: &[u8], is_first: bool) -> (Vec<u8>, OptimizeOutcome) {
        let original_size = jpeg.len();
        let original_tokens = estimate_tokens(original_size);

        let img = match hasher::decode_image(jpeg) {
            Ok(img) => img,
            Err(e) => {
                warn!(error = %e, "undecodable frame, passing through");
                let outcome = OptimizeOutcome {
                    original_size,
                    final_size: original_size,
                    original_tokens,
                    optimized_tokens: original_tokens,
                    tokens_saved: 0,
                    importance: Importance::Medium,
                    quality: 0,
                    was_cropped: false,
                };
                return (jpeg.to_vec(), outcome);
            }
        };

        let (staged, crop) = match self.cropper.as_mut() {
            Some(cropper) => cropper.crop(&img, is_first),
            None => (
                img.clone(),
                CropOutcome {
                    is_cropped: false,
                    crop_ratio: 1.0,
                    reason: "cropping_disabled",
                },
            ),
        };

        let importance = analyze_importance(&staged);
        let (quality, (max_w, max_h)) = compression_params(self.level, importance);
        let resized = hasher::resize_to_fit(&staged, max_w, max_h);

        let encoded = match hasher::encode_jpeg(&resized, quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "re-encode failed, passing through");
                jpeg.to_vec()
            }
        };

        let final_size = encoded.len();
        let optimized_tokens = estimate_tokens(final_size);
        let outcome = OptimizeOutcome {
            original_size,
            final_size,
            original_tokens,
            optimized_tokens,
            tokens_saved: original_tokens - optimized_tokens,
            importance,
            quality,
            was_cropped: crop.is_cropped,
        };

        self.stats.images_processed += 1;
        self.stats.total_original_bytes += original_size as u64;
        self.stats.total_final_bytes += final_size as u64;
        self.stats.total_tokens_saved += outcome.tokens_saved;
        match importance {
            Importance::High => self.stats.high_importance += 1,
            Importance::Medium => self.stats.medium_importance += 1,
            Importance::Low => self.stats.low_importance += 1,
        }
        if crop.is_cropped {
            self.stats.cropped_frames += 1;
        }

        (encoded, outcome)
    }

    /// Drop the previous-frame reference at a batch boundary.
    pub fn reset(&mut self) {
        if let Some(cropper) = self.cropper.as_mut() {
            cropper.reset();
        }
    }

    /// Rebuild with new settings (used by the optimization-config surface).
    pub fn reinitialize(&mut self, level: CompressionLevel, enable_cropping: bool, crop_threshold: u8) {
        self.level = level;
        self.cropper = enable_cropping.then(|| RegionCropper::new(crop_threshold));
        self.stats = OptimizerStats::default();
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    pub fn stats(&self) -> &OptimizerStats {
        &self.stats
    }
}

fn estimate_tokens(bytes: usize) -> i64 {
    ((bytes as f64 / 1024.0) * TOKENS_PER_KB) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use lifetrace_core::hasher::encode_jpeg;

    fn solid(v: u8, w: u32, h: u32) -> DynamicImage {
        let mut img = RgbImage::new(w, h);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([v, v, v]);
        }
        DynamicImage::ImageRgb8(img)
    }

    fn checkerboard(w: u32, h: u32, cell: u32) -> DynamicImage {
        let mut img = RgbImage::new(w, h);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = if ((x / cell) + (y / cell)) % 2 == 0 { 255 } else { 0 };
            *pixel = Rgb([v, v, v]);
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn solid_frame_is_low_importance() {
        assert_eq!(analyze_importance(&solid(128, 320, 240)), Importance::Low);
    }

    #[test]
    fn busy_frame_is_high_importance() {
        assert_eq!(
            analyze_importance(&checkerboard(320, 240, 4)),
            Importance::High
        );
    }

    #[test]
    fn table_matches_published_pairs() {
        assert_eq!(
            compression_params(CompressionLevel::Aggressive, Importance::High),
            (60, (800, 600))
        );
        assert_eq!(
            compression_params(CompressionLevel::Aggressive, Importance::Low),
            (40, (480, 360))
        );
        assert_eq!(
            compression_params(CompressionLevel::Quality, Importance::High),
            (85, (1920, 1080))
        );
    }

    #[test]
    fn first_frame_is_never_cropped() {
        let mut cropper = RegionCropper::new(30);
        let img = checkerboard(640, 480, 16);
        let (out, outcome) = cropper.crop(&img, false);
        assert!(!outcome.is_cropped);
        assert_eq!(outcome.reason, "first_frame");
        assert_eq!(out.dimensions(), (640, 480));
    }

    #[test]
    fn localized_change_gets_cropped() {
        let mut cropper = RegionCropper::new(30);
        let base = solid(20, 640, 480);
        cropper.crop(&base, false);

        // Paint a 150x150 block in the corner
        let mut changed = base.to_rgb8();
        for y in 0..150 {
            for x in 0..150 {
                changed.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        let changed = DynamicImage::ImageRgb8(changed);

        let (out, outcome) = cropper.crop(&changed, false);
        assert!(outcome.is_cropped);
        assert!(out.width() < 640 && out.height() < 480);
        assert!(out.width() >= 150);
    }

    #[test]
    fn whole_frame_change_stays_full() {
        let mut cropper = RegionCropper::new(30);
        cropper.crop(&solid(0, 640, 480), false);
        let (out, outcome) = cropper.crop(&solid(255, 640, 480), false);
        assert!(!outcome.is_cropped);
        assert_eq!(outcome.reason, "change_too_large");
        assert_eq!(out.dimensions(), (640, 480));
    }

    #[test]
    fn tiny_change_is_ignored() {
        let mut cropper = RegionCropper::new(30);
        let base = solid(20, 640, 480);
        cropper.crop(&base, false);

        let mut changed = base.to_rgb8();
        for y in 0..20 {
            for x in 0..20 {
                changed.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        let (_, outcome) = cropper.crop(&DynamicImage::ImageRgb8(changed), false);
        assert!(!outcome.is_cropped);
        assert_eq!(outcome.reason, "no_significant_change");
    }

    #[test]
    fn optimizer_shrinks_large_frames() {
        let mut optimizer = ImageOptimizer::new(CompressionLevel::Aggressive, false, 30);
        let jpeg = encode_jpeg(&checkerboard(1920, 1080, 8), 90).unwrap();

        let (out, outcome) = optimizer.optimize(&jpeg, true);
        assert!(out.len() < jpeg.len());
        assert!(outcome.tokens_saved > 0);

        let decoded = lifetrace_core::hasher::decode_image(&out).unwrap();
        assert!(decoded.width() <= 800);
        assert!(decoded.height() <= 600);
    }

    #[test]
    fn garbage_bytes_pass_through() {
        let mut optimizer = ImageOptimizer::new(CompressionLevel::Aggressive, false, 30);
        let (out, outcome) = optimizer.optimize(b"not a jpeg", true);
        assert_eq!(out, b"not a jpeg");
        assert_eq!(outcome.tokens_saved, 0);
    }

    #[test]
    fn stats_accumulate() {
        let mut optimizer = ImageOptimizer::new(CompressionLevel::Balanced, false, 30);
        let jpeg = encode_jpeg(&checkerboard(640, 480, 8), 90).unwrap();
        optimizer.optimize(&jpeg, true);
        optimizer.optimize(&jpeg, false);

        let stats = optimizer.stats();
        assert_eq!(stats.images_processed, 2);
        assert!(stats.total_original_bytes > 0);
    }
}
