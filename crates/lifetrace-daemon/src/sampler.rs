use std::collections::HashMap;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use lifetrace_core::hasher::{self, PerceptualHasher};
use serde::Serialize;
use tracing::debug;

const CONTRAST_KEEP: f64 = 50.0;
const CONTRAST_STATIC: f64 = 20.0;
const MOTION_THRESHOLD: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    /// Fraction of the 64 hash bits that must differ for a frame to count
    /// as a significant change.
    pub phash_threshold: f64,
    /// Minimum seconds between two accepted frames of one event sequence.
    pub min_interval: f64,
    /// Maximum accepted frames per event sequence.
    pub max_images: usize,
    pub enable_content_analysis: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            phash_threshold: 0.15,
            min_interval: 2.0,
            max_images: 8,
            enable_content_analysis: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub accept: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SamplerStats {
    pub total_checked: u64,
    pub accepted: u64,
    pub rejected_duplicate: u64,
    pub rejected_static: u64,
    pub rejected_interval: u64,
    pub rejected_quota: u64,
}

/// Hybrid per-frame decision: first-frame rule, perceptual-hash change
/// detection, optional content check, then the interval + quota gate.
/// Every decision carries a reason string for the optimization stats.
pub struct HybridSampler {
    settings: SamplerSettings,
    hasher: PerceptualHasher,
    last_phash: Option<String>,
    last_accepted_at: HashMap<String, DateTime<Utc>>,
    accepted_count: HashMap<String, usize>,
    stats: SamplerStats,
}

impl HybridSampler {
    pub fn new(settings: SamplerSettings) -> Self {
        Self {
            settings,
            hasher: PerceptualHasher::new(),
            last_phash: None,
            last_accepted_at: HashMap::new(),
            accepted_count: HashMap::new(),
            stats: SamplerStats::default(),
        }
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    /// Decide whether this frame reaches the LLM.
    pub fn should_include(
        &mut self,
        jpeg: &[u8],
        event_id: &str,
        now: DateTime<Utc>,
        is_first: bool,
    ) -> Decision {
        self.stats.total_checked += 1;

        if is_first {
            if self.quota_left(event_id) == 0 {
                return self.reject_quota(event_id);
            }
            // Seed the hash state so later frames dedup against this one.
            if let Ok(img) = hasher::decode_image(jpeg) {
                self.last_phash = Some(self.hasher.hash_image(&img));
            }
            self.mark_accepted(event_id, now);
            return self.accept("first frame");
        }

        let img = hasher::decode_image(jpeg).ok();
        let significant = self.is_significant_change(img.as_ref());

        if !significant && self.settings.enable_content_analysis {
            if let Some(img) = img.as_ref() {
                let contrast = crate::optimizer::contrast_score(img);
                let motion = mean_flat_difference(img) > MOTION_THRESHOLD;
                if contrast <= CONTRAST_KEEP && !motion && contrast < CONTRAST_STATIC {
                    self.stats.rejected_static += 1;
                    return Decision {
                        accept: false,
                        reason: "static content".to_string(),
                    };
                }
            }
        }

        // Interval + quota gate, the final arbiter for every surviving frame
        if self.quota_left(event_id) == 0 {
            return self.reject_quota(event_id);
        }
        if let Some(last) = self.last_accepted_at.get(event_id) {
            let elapsed = (now - *last).num_milliseconds() as f64 / 1000.0;
            if elapsed < self.settings.min_interval {
                self.stats.rejected_interval += 1;
                return Decision {
                    accept: false,
                    reason: format!(
                        "interval {:.1}s < {:.1}s",
                        elapsed, self.settings.min_interval
                    ),
                };
            }
        }

        self.mark_accepted(event_id, now);
        if significant {
            self.accept("significant change")
        } else {
            self.accept("interval elapsed")
        }
    }

    /// Hash the frame against the last seen one; updates `last_phash` when
    /// the change is significant. Undecodable frames count as significant
    /// (conservative).
    fn is_significant_change(&mut self, img: Option<&DynamicImage>) -> bool {
        let Some(img) = img else {
            self.last_phash = None;
            return true;
        };
        let hash = self.hasher.hash_image(img);

        let significant = match &self.last_phash {
            None => true,
            Some(last) => {
                let distance = PerceptualHasher::hamming_distance(last, &hash);
                distance as f64 > self.settings.phash_threshold * 64.0
            }
        };

        if significant {
            self.last_phash = Some(hash);
        } else {
            self.stats.rejected_duplicate += 1;
        }
        significant
    }

    fn quota_left(&self, event_id: &str) -> usize {
        self.settings
            .max_images
            .saturating_sub(*self.accepted_count.get(event_id).unwrap_or(&0))
    }

    fn mark_accepted(&mut self, event_id: &str, now: DateTime<Utc>) {
        self.last_accepted_at.insert(event_id.to_string(), now);
        *self.accepted_count.entry(event_id.to_string()).or_insert(0) += 1;
    }

    fn accept(&mut self, reason: &str) -> Decision {
        self.stats.accepted += 1;
        debug!(reason, "frame accepted");
        Decision {
            accept: true,
            reason: reason.to_string(),
        }
    }

    fn reject_quota(&mut self, event_id: &str) -> Decision {
        self.stats.rejected_quota += 1;
        Decision {
            accept: false,
            reason: format!(
                "quota reached ({}) for {event_id}",
                self.settings.max_images
            ),
        }
    }

    /// Reset per-event state when the pipeline finishes a batch.
    pub fn reset(&mut self) {
        self.last_phash = None;
        self.last_accepted_at.clear();
        self.accepted_count.clear();
    }

    pub fn stats(&self) -> &SamplerStats {
        &self.stats
    }

    pub fn reinitialize(&mut self, settings: SamplerSettings) {
        self.settings = settings;
        self.reset();
        self.stats = SamplerStats::default();
    }
}

/// Mean absolute difference between consecutive grayscale pixels of the
/// flattened image; above ~10 reads as on-screen motion/texture.
fn mean_flat_difference(img: &DynamicImage) -> f64 {
    let gray = img.to_luma8();
    let pixels = gray.as_raw();
    if pixels.len() < 2 {
        return 0.0;
    }
    let sum: f64 = pixels
        .windows(2)
        .map(|w| (w[0] as f64 - w[1] as f64).abs())
        .sum();
    sum / (pixels.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use image::{Rgb, RgbImage};
    use lifetrace_core::hasher::encode_jpeg;

    fn solid_jpeg(v: u8) -> Vec<u8> {
        let mut img = RgbImage::new(160, 120);
        for pixel in img.pixels_mut() {
            *pixel = Rgb([v, v, v]);
        }
        encode_jpeg(&DynamicImage::ImageRgb8(img), 85).unwrap()
    }

    fn busy_jpeg(seed: u32) -> Vec<u8> {
        let mut img = RgbImage::new(160, 120);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = (((x * 7 + y * 13 + seed * 31) % 256) as u8).wrapping_mul(3);
            *pixel = Rgb([v, v.wrapping_add(60), v.wrapping_mul(2)]);
        }
        encode_jpeg(&DynamicImage::ImageRgb8(img), 85).unwrap()
    }

    fn sampler(settings: SamplerSettings) -> HybridSampler {
        HybridSampler::new(settings)
    }

    #[test]
    fn first_frame_accepted() {
        let mut s = sampler(SamplerSettings::default());
        let d = s.should_include(&busy_jpeg(1), "e1", Utc::now(), true);
        assert!(d.accept);
        assert_eq!(d.reason, "first frame");
    }

    #[test]
    fn max_images_zero_rejects_even_first() {
        let mut s = sampler(SamplerSettings {
            max_images: 0,
            ..Default::default()
        });
        let d = s.should_include(&busy_jpeg(1), "e1", Utc::now(), true);
        assert!(!d.accept);
        assert!(d.reason.contains("quota"));
    }

    #[test]
    fn static_duplicates_rejected() {
        let mut s = sampler(SamplerSettings {
            min_interval: 0.0,
            ..Default::default()
        });
        let t = Utc::now();
        let frame = solid_jpeg(15);

        assert!(s.should_include(&frame, "e1", t, true).accept);
        // Same dark static frame again: not significant, static content
        let d = s.should_include(&frame, "e1", t + Duration::seconds(1), false);
        assert!(!d.accept);
        assert_eq!(d.reason, "static content");
    }

    #[test]
    fn quota_limits_accepted_frames() {
        let mut s = sampler(SamplerSettings {
            max_images: 3,
            min_interval: 0.0,
            ..Default::default()
        });
        let t = Utc::now();

        let mut accepted = 0;
        for i in 0..10 {
            let d = s.should_include(
                &busy_jpeg(i),
                "e1",
                t + Duration::seconds(i as i64),
                i == 0,
            );
            if d.accept {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);
    }

    #[test]
    fn interval_gates_distinct_frames() {
        let mut s = sampler(SamplerSettings {
            min_interval: 2.0,
            ..Default::default()
        });
        let t = Utc::now();

        assert!(s.should_include(&busy_jpeg(0), "e1", t, true).accept);
        // Distinct frame 1 s later: blocked by the interval
        let d = s.should_include(&busy_jpeg(9), "e1", t + Duration::seconds(1), false);
        assert!(!d.accept);
        assert!(d.reason.contains("interval"));
        // 3 s later: passes
        let d = s.should_include(&busy_jpeg(17), "e1", t + Duration::seconds(3), false);
        assert!(d.accept);
    }

    #[test]
    fn zero_threshold_makes_every_frame_significant_but_quota_still_binds() {
        let mut s = sampler(SamplerSettings {
            phash_threshold: 0.0,
            min_interval: 0.0,
            max_images: 2,
            ..Default::default()
        });
        let t = Utc::now();

        assert!(s.should_include(&busy_jpeg(0), "e1", t, true).accept);
        assert!(s
            .should_include(&busy_jpeg(1), "e1", t + Duration::seconds(1), false)
            .accept);
        let d = s.should_include(&busy_jpeg(2), "e1", t + Duration::seconds(2), false);
        assert!(!d.accept);
        assert!(d.reason.contains("quota"));
    }

    #[test]
    fn reset_clears_event_state() {
        let mut s = sampler(SamplerSettings {
            max_images: 1,
            min_interval: 0.0,
            ..Default::default()
        });
        let t = Utc::now();

        assert!(s.should_include(&busy_jpeg(0), "e1", t, true).accept);
        assert!(!s
            .should_include(&busy_jpeg(1), "e1", t + Duration::seconds(1), false)
            .accept);

        s.reset();
        assert!(s
            .should_include(&busy_jpeg(2), "e1", t + Duration::seconds(2), true)
            .accept);
    }

    #[test]
    fn stats_track_decisions() {
        let mut s = sampler(SamplerSettings::default());
        let t = Utc::now();
        s.should_include(&busy_jpeg(0), "e1", t, true);
        // Same frame, inside the 2 s interval: duplicate + interval-gated
        s.should_include(&busy_jpeg(0), "e1", t + Duration::seconds(1), false);

        let stats = s.stats();
        assert_eq!(stats.total_checked, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected_duplicate, 1);
        assert_eq!(stats.rejected_interval, 1);
    }
}
