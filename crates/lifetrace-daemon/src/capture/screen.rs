use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use lifetrace_core::hasher::{self, PerceptualHasher};
use lifetrace_core::record::{RawRecord, RecordPayload, ScreenshotPayload};
use lifetrace_core::store::ImageStore;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{CaptureError, CaptureSource, RecordSender};

/// Unchanged frames are still emitted this often, so downstream always has
/// a recent frame per monitor.
const FORCE_SAVE_INTERVAL: Duration = Duration::from_secs(5);

const MAX_WIDTH: u32 = 1920;
const MAX_HEIGHT: u32 = 1080;
const JPEG_QUALITY: u8 = 85;

/// Multi-monitor screen capturer.
///
/// Each tick grabs RGB frames from the enabled monitors, downscales and
/// re-encodes them, and emits a screenshot record when the perceptual hash
/// changed (or the per-monitor force-save interval elapsed). Frame bytes go
/// into the image store before the record is published, so every emitted
/// hash is resolvable.
pub struct ScreenCaptureSource {
    tx: RecordSender,
    store: Arc<ImageStore>,
    /// `None` means "primary monitor only" (nothing configured).
    enabled_monitors: Option<Vec<usize>>,
    interval: Duration,
    running: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
    emitted: Arc<AtomicU64>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ScreenCaptureSource {
    pub fn new(
        tx: RecordSender,
        store: Arc<ImageStore>,
        enabled_monitors: Option<Vec<usize>>,
        interval_secs: f64,
    ) -> Self {
        Self {
            tx,
            store,
            enabled_monitors,
            interval: Duration::from_secs_f64(interval_secs.max(0.1)),
            running: Arc::new(AtomicBool::new(false)),
            captured: Arc::new(AtomicU64::new(0)),
            emitted: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CaptureSource for ScreenCaptureSource {
    fn name(&self) -> &'static str {
        "screen"
    }

    async fn start(&self) -> Result<(), CaptureError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let tx = self.tx.clone();
        let store = self.store.clone();
        let enabled = self.enabled_monitors.clone();
        let interval = self.interval;
        let running = self.running.clone();
        let captured = self.captured.clone();
        let emitted = self.emitted.clone();

        let handle = tokio::spawn(async move {
            let mut dedup = MonitorDedup::default();
            info!(interval_ms = interval.as_millis() as u64, "screen capture started");

            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                // Grab + encode off the cooperative runtime.
                let enabled = enabled.clone();
                let grab = tokio::task::spawn_blocking(move || grab_monitors(&enabled)).await;

                let frames = match grab {
                    Ok(Ok(frames)) => frames,
                    Ok(Err(e)) => {
                        warn!(error = %e, "screen grab failed, will retry");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "screen grab task panicked");
                        continue;
                    }
                };

                for frame in frames {
                    captured.fetch_add(1, Ordering::Relaxed);
                    let now = Utc::now();
                    if !dedup.should_emit(frame.monitor_index, &frame.hash, now) {
                        debug!(monitor = frame.monitor_index, "unchanged frame skipped");
                        continue;
                    }

                    store.cache(&frame.hash, &frame.jpeg);

                    let record = RawRecord::new(
                        now,
                        RecordPayload::Screenshot(ScreenshotPayload {
                            monitor_index: frame.monitor_index,
                            width: frame.width,
                            height: frame.height,
                            format: "JPEG".to_string(),
                            content_hash: frame.hash.clone(),
                            sequence: None,
                        }),
                    );

                    emitted.fetch_add(1, Ordering::Relaxed);
                    if tx.send(record).await.is_err() {
                        debug!("screenshot channel closed, stopping capture loop");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
            info!("screen capture stopped");
        });

        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CaptureError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "is_running": self.running.load(Ordering::SeqCst),
            "frames_captured": self.captured.load(Ordering::Relaxed),
            "frames_emitted": self.emitted.load(Ordering::Relaxed),
            "capture_interval_ms": self.interval.as_millis() as u64,
            "enabled_monitors": self.enabled_monitors.clone(),
        })
    }
}

/// Per-monitor change detection: emit when the hash changed, or when the
/// force-save interval elapsed since the last emission.
#[derive(Default)]
struct MonitorDedup {
    last_hash: HashMap<usize, String>,
    last_emit: HashMap<usize, DateTime<Utc>>,
}

impl MonitorDedup {
    fn should_emit(&mut self, monitor: usize, hash: &str, now: DateTime<Utc>) -> bool {
        let unchanged = self.last_hash.get(&monitor).map(|h| h == hash).unwrap_or(false);
        let force = self
            .last_emit
            .get(&monitor)
            .map(|last| (now - *last).to_std().unwrap_or_default() >= FORCE_SAVE_INTERVAL)
            .unwrap_or(true);

        if unchanged && !force {
            return false;
        }
        self.last_hash.insert(monitor, hash.to_string());
        self.last_emit.insert(monitor, now);
        true
    }
}

struct CapturedFrame {
    monitor_index: usize,
    width: u32,
    height: u32,
    hash: String,
    jpeg: Vec<u8>,
}

/// Enumerate monitors, filter to the enabled set (default: primary only),
/// and grab + downscale + encode one frame per monitor.
fn grab_monitors(enabled: &Option<Vec<usize>>) -> Result<Vec<CapturedFrame>, CaptureError> {
    let monitors =
        xcap::Monitor::all().map_err(|e| CaptureError::Screen(format!("enumerate: {e}")))?;
    let hasher = PerceptualHasher::new();
    let mut frames = Vec::new();

    for (index, monitor) in monitors.iter().enumerate() {
        let capture_this = match enabled {
            Some(indices) => indices.contains(&index),
            None => monitor.is_primary(),
        };
        if !capture_this {
            continue;
        }

        let grabbed = match monitor.capture_image() {
            Ok(img) => img,
            Err(e) => {
                warn!(monitor = index, error = %e, "monitor grab failed");
                continue;
            }
        };

        // Rebuild from raw RGBA so this crate's image version owns the buffer
        let (w, h) = (grabbed.width(), grabbed.height());
        let Some(rgba) = image::RgbaImage::from_raw(w, h, grabbed.into_raw()) else {
            warn!(monitor = index, "invalid frame buffer dimensions");
            continue;
        };
        let img = DynamicImage::ImageRgba8(rgba);
        let img = hasher::resize_to_fit(&img, MAX_WIDTH, MAX_HEIGHT);
        let hash = hasher.hash_image(&img);
        let jpeg = match hasher::encode_jpeg(&img, JPEG_QUALITY) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(monitor = index, error = %e, "frame encode failed");
                continue;
            }
        };

        frames.push(CapturedFrame {
            monitor_index: index,
            width: img.width(),
            height: img.height(),
            hash,
            jpeg,
        });
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn changed_hash_emits() {
        let mut dedup = MonitorDedup::default();
        let now = Utc::now();
        assert!(dedup.should_emit(0, "aaaa", now));
        assert!(dedup.should_emit(0, "bbbb", now + ChronoDuration::seconds(1)));
    }

    #[test]
    fn unchanged_hash_skipped_until_force_interval() {
        let mut dedup = MonitorDedup::default();
        let now = Utc::now();
        assert!(dedup.should_emit(0, "aaaa", now));
        assert!(!dedup.should_emit(0, "aaaa", now + ChronoDuration::seconds(1)));
        assert!(!dedup.should_emit(0, "aaaa", now + ChronoDuration::seconds(4)));
        // Past the 5 s force-save interval
        assert!(dedup.should_emit(0, "aaaa", now + ChronoDuration::seconds(6)));
    }

    #[test]
    fn monitors_tracked_independently() {
        let mut dedup = MonitorDedup::default();
        let now = Utc::now();
        assert!(dedup.should_emit(0, "aaaa", now));
        assert!(dedup.should_emit(1, "aaaa", now));
        assert!(!dedup.should_emit(0, "aaaa", now + ChronoDuration::seconds(1)));
    }
}
