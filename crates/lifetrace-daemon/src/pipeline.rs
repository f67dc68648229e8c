use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use lifetrace_core::db::DatabaseManager;
use lifetrace_core::llm::{ChatMessage, ChatOptions, ContentPart};
use lifetrace_core::prompts::{self, Language};
use lifetrace_core::record::{RawRecord, RecordKind, RecordPayload};
use lifetrace_core::schema::NewEvent;
use lifetrace_core::store::ImageStore;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::ChatApi;
use crate::filter::EventFilter;
use crate::optimizer::ImageOptimizer;
use crate::sampler::HybridSampler;

const MAX_FALLBACK_DESCRIPTORS: usize = 100;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Accumulated screenshots that trigger an extraction.
    pub screenshot_threshold: usize,
    pub language: Language,
    pub enable_screenshot_deduplication: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub processed: usize,
    pub accumulated: usize,
    pub extracted: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineCounters {
    pub total_screenshots: u64,
    pub extractions: u64,
    pub events_created: u64,
    pub knowledge_created: u64,
    pub todos_created: u64,
    pub fallback_events: u64,
    pub last_processing_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PendingState {
    screenshots: Vec<RawRecord>,
    saw_keyboard: bool,
    saw_mouse: bool,
    descriptors: Vec<String>,
}

/// Central state machine: accumulates filtered screenshots to a threshold,
/// then runs optimize → sample per frame, asks the LLM for events /
/// knowledge / todos, and persists the result. An unavailable or
/// unparseable LLM degrades to a single locally synthesized fallback event.
pub struct ProcessingPipeline {
    settings: PipelineSettings,
    filter: EventFilter,
    optimizer: Mutex<ImageOptimizer>,
    sampler: Mutex<HybridSampler>,
    store: Arc<ImageStore>,
    db: Arc<DatabaseManager>,
    chat: Arc<dyn ChatApi>,
    pending: Mutex<PendingState>,
    running: AtomicBool,
    /// Serializes extraction: the pipeline never runs two LLM batches
    /// concurrently, even if the accumulator overshoots the threshold.
    extraction: tokio::sync::Mutex<()>,
    counters: Mutex<PipelineCounters>,
}

impl ProcessingPipeline {
    pub fn new(
        settings: PipelineSettings,
        optimizer: ImageOptimizer,
        sampler: HybridSampler,
        store: Arc<ImageStore>,
        db: Arc<DatabaseManager>,
        chat: Arc<dyn ChatApi>,
    ) -> Arc<Self> {
        let filter = EventFilter::new(settings.enable_screenshot_deduplication);
        Arc::new(Self {
            settings,
            filter,
            optimizer: Mutex::new(optimizer),
            sampler: Mutex::new(sampler),
            store,
            db,
            chat,
            pending: Mutex::new(PendingState::default()),
            running: AtomicBool::new(false),
            extraction: tokio::sync::Mutex::new(()),
            counters: Mutex::new(PipelineCounters::default()),
        })
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!(
                threshold = self.settings.screenshot_threshold,
                "processing pipeline started"
            );
        }
    }

    /// Stop and flush: a residual accumulator goes through one final
    /// extraction before resources are released. Idempotent.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if !batch.screenshots.is_empty() {
            info!(
                residual = batch.screenshots.len(),
                "flushing accumulator on stop"
            );
            self.extract(batch).await;
        }
        info!("processing pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One drain-loop tick worth of raw records.
    pub async fn process_raw_records(self: &Arc<Self>, records: Vec<RawRecord>) -> ProcessOutcome {
        if records.is_empty() {
            let accumulated = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .screenshots
                .len();
            return ProcessOutcome {
                processed: 0,
                accumulated,
                extracted: false,
            };
        }

        let filtered = self.filter.filter_all(records);

        let ready_batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let mut new_screenshots = 0usize;

            for record in filtered {
                match record.kind() {
                    RecordKind::Screenshot => {
                        new_screenshots += 1;
                        pending.screenshots.push(record);
                    }
                    RecordKind::Keyboard => {
                        pending.saw_keyboard = true;
                        push_descriptor(&mut pending.descriptors, &record);
                    }
                    RecordKind::Mouse => {
                        pending.saw_mouse = true;
                        push_descriptor(&mut pending.descriptors, &record);
                    }
                }
            }

            {
                let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
                counters.total_screenshots += new_screenshots as u64;
            }

            debug!(
                accumulated = pending.screenshots.len(),
                threshold = self.settings.screenshot_threshold,
                "batch absorbed"
            );

            if pending.screenshots.len() >= self.settings.screenshot_threshold {
                Some(std::mem::take(&mut *pending))
            } else {
                return ProcessOutcome {
                    processed: new_screenshots,
                    accumulated: pending.screenshots.len(),
                    extracted: false,
                };
            }
        };

        let batch = ready_batch.unwrap();
        let processed = batch.screenshots.len();
        self.extract(batch).await;

        ProcessOutcome {
            processed,
            accumulated: 0,
            extracted: true,
        }
    }

    async fn extract(self: &Arc<Self>, batch: PendingState) {
        let _serial = self.extraction.lock().await;

        let event_timestamp = batch
            .screenshots
            .iter()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or_else(Utc::now);

        let frames = self.prepare_frames(batch.screenshots).await;
        let accepted_hashes: Vec<String> = frames.iter().map(|f| f.hash.clone()).collect();
        info!(
            accepted = frames.len(),
            "extraction batch ready, calling LLM"
        );

        let hint = prompts::input_usage_hint(
            self.settings.language,
            batch.saw_keyboard,
            batch.saw_mouse,
        );
        let mut parts = vec![ContentPart::Text {
            text: prompts::extraction_user_prompt(self.settings.language, &hint),
        }];
        for frame in &frames {
            parts.push(ContentPart::ImageJpeg {
                base64_data: frame.base64_jpeg.clone(),
            });
        }
        let messages = vec![
            ChatMessage::system(prompts::extraction_system_prompt(self.settings.language)),
            ChatMessage::user_parts(parts),
        ];

        let outcome = self
            .chat
            .chat_completion(messages, ChatOptions::for_request("event_extraction"))
            .await;

        match outcome {
            Ok(completion) => match prompts::parse_extraction(&completion.content) {
                Ok(result) => {
                    self.persist_extraction(result, event_timestamp, &accepted_hashes)
                        .await;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        raw = %completion.content.chars().take(200).collect::<String>(),
                        "extraction output unparseable, degrading to fallback"
                    );
                    self.persist_fallback(&batch.descriptors, event_timestamp, &accepted_hashes)
                        .await;
                }
            },
            Err(e) => {
                warn!(error = %e, "LLM unavailable, degrading to fallback");
                self.persist_fallback(&batch.descriptors, event_timestamp, &accepted_hashes)
                    .await;
            }
        }

        // Batch boundary: optimizer and sampler state reset
        self.optimizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        self.sampler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.extractions += 1;
        counters.last_processing_time = Some(Utc::now());
    }

    /// Optimize + sample each accumulated screenshot off the cooperative
    /// runtime. Rejected frames contribute only to stats.
    async fn prepare_frames(self: &Arc<Self>, screenshots: Vec<RawRecord>) -> Vec<AcceptedFrame> {
        let pipeline = self.clone();
        let sequence_id = Uuid::new_v4().to_string();

        let result = tokio::task::spawn_blocking(move || {
            let mut optimizer = pipeline
                .optimizer
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let mut sampler = pipeline.sampler.lock().unwrap_or_else(|e| e.into_inner());

            let mut accepted = Vec::new();
            let mut first = true;
            for record in &screenshots {
                let Some(shot) = record.as_screenshot() else {
                    continue;
                };
                let Some(encoded) = pipeline.store.get(&shot.content_hash) else {
                    debug!(hash = %shot.content_hash, "frame bytes unavailable, skipping");
                    continue;
                };
                let Ok(bytes) = BASE64.decode(encoded.as_bytes()) else {
                    continue;
                };

                let is_first = first;
                first = false;

                let (optimized, _meta) = optimizer.optimize(&bytes, is_first);
                let decision = sampler.should_include(
                    &optimized,
                    &sequence_id,
                    record.timestamp,
                    is_first,
                );
                if !decision.accept {
                    debug!(hash = %shot.content_hash, reason = %decision.reason, "frame rejected");
                    continue;
                }

                // Accepted frames must stay resolvable as thumbnails
                pipeline.store.persist(&shot.content_hash, &bytes, false);

                accepted.push(AcceptedFrame {
                    hash: shot.content_hash.clone(),
                    base64_jpeg: BASE64.encode(&optimized),
                });
            }
            accepted
        })
        .await;

        match result {
            Ok(frames) => frames,
            Err(e) => {
                error!(error = %e, "frame preparation panicked");
                Vec::new()
            }
        }
    }

    async fn persist_extraction(
        &self,
        result: prompts::ExtractionResult,
        event_timestamp: DateTime<Utc>,
        accepted_hashes: &[String],
    ) {
        let db = self.db.clone();
        let hashes = accepted_hashes.to_vec();
        let counts = (
            result.events.len(),
            result.knowledge.len(),
            result.todos.len(),
        );

        let write = tokio::task::spawn_blocking(move || {
            let handle = db.acquire();
            let guard = handle.lock().unwrap_or_else(|e| e.into_inner());

            for item in &result.events {
                let event_id = Uuid::new_v4().to_string();
                if let Err(e) = guard.insert_event(&NewEvent {
                    id: event_id.clone(),
                    title: item.title.clone(),
                    description: item.description.clone(),
                    keywords: item.keywords.clone(),
                    timestamp: event_timestamp,
                }) {
                    error!(error = %e, "event insert failed");
                    continue;
                }
                if let Err(e) = guard.record_event_images(&event_id, &hashes) {
                    warn!(error = %e, "event image bookkeeping failed");
                }
            }

            for item in &result.knowledge {
                let id = Uuid::new_v4().to_string();
                if let Err(e) = guard.insert_knowledge(
                    &id,
                    &item.title,
                    &item.description,
                    &item.keywords,
                    event_timestamp,
                ) {
                    error!(error = %e, "knowledge insert failed");
                }
            }

            for item in &result.todos {
                let id = Uuid::new_v4().to_string();
                if let Err(e) = guard.insert_todo(
                    &id,
                    &item.title,
                    &item.description,
                    &item.keywords,
                    false,
                    event_timestamp,
                ) {
                    error!(error = %e, "todo insert failed");
                }
            }
        })
        .await;

        if let Err(e) = write {
            error!(error = %e, "extraction persistence task panicked");
            return;
        }

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.events_created += counts.0 as u64;
        counters.knowledge_created += counts.1 as u64;
        counters.todos_created += counts.2 as u64;
        info!(
            events = counts.0,
            knowledge = counts.1,
            todos = counts.2,
            "extraction persisted"
        );
    }

    /// Degraded mode: one locally synthesized event from the coalesced
    /// input descriptors; no knowledge or todos.
    async fn persist_fallback(
        &self,
        descriptors: &[String],
        event_timestamp: DateTime<Utc>,
        accepted_hashes: &[String],
    ) {
        let description = if descriptors.is_empty() {
            match self.settings.language {
                Language::Zh => "无输入活动记录".to_string(),
                Language::En => "No input activity recorded".to_string(),
            }
        } else {
            descriptors.join("; ")
        };

        let event = NewEvent {
            id: Uuid::new_v4().to_string(),
            title: prompts::fallback_event_title(self.settings.language).to_string(),
            description,
            keywords: Vec::new(),
            timestamp: event_timestamp,
        };

        let db = self.db.clone();
        let hashes = accepted_hashes.to_vec();
        let event_id = event.id.clone();
        let write = tokio::task::spawn_blocking(move || {
            let handle = db.acquire();
            let guard = handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.insert_event(&event)?;
            guard.record_event_images(&event_id, &hashes)
        })
        .await;

        match write {
            Ok(Ok(())) => {
                let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
                counters.events_created += 1;
                counters.fallback_events += 1;
            }
            Ok(Err(e)) => error!(error = %e, "fallback event insert failed"),
            Err(e) => error!(error = %e, "fallback persistence task panicked"),
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let accumulated = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .screenshots
            .len();
        let optimizer_stats = self
            .optimizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
            .clone();
        let sampler_stats = self
            .sampler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
            .clone();

        serde_json::json!({
            "is_running": self.is_running(),
            "screenshot_threshold": self.settings.screenshot_threshold,
            "accumulated_screenshots": accumulated,
            "counters": counters,
            "optimizer": optimizer_stats,
            "sampler": sampler_stats,
        })
    }

    /// Swap optimizer + sampler settings at runtime (optimization config
    /// surface).
    pub fn reconfigure_optimization(
        &self,
        optimizer: ImageOptimizer,
        sampler: HybridSampler,
    ) {
        *self.optimizer.lock().unwrap_or_else(|e| e.into_inner()) = optimizer;
        *self.sampler.lock().unwrap_or_else(|e| e.into_inner()) = sampler;
    }

    pub fn optimization_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "optimizer": self.optimizer.lock().unwrap_or_else(|e| e.into_inner()).stats().clone(),
            "sampler": self.sampler.lock().unwrap_or_else(|e| e.into_inner()).stats().clone(),
        })
    }
}

struct AcceptedFrame {
    hash: String,
    base64_jpeg: String,
}

fn push_descriptor(descriptors: &mut Vec<String>, record: &RawRecord) {
    if descriptors.len() >= MAX_FALLBACK_DESCRIPTORS {
        return;
    }
    let text = match &record.payload {
        RecordPayload::Keyboard(k) => match &k.sequence {
            Some(seq) => format!("key {}x{}", k.key, seq.count),
            None => format!("key {}", k.key),
        },
        RecordPayload::Mouse(m) => match m.action {
            lifetrace_core::record::MouseAction::Click => format!(
                "click at ({:.0}, {:.0})",
                m.position.0, m.position.1
            ),
            lifetrace_core::record::MouseAction::Scroll => {
                let (dx, dy) = m.scroll_delta.unwrap_or((0.0, 0.0));
                format!("scroll ({dx:.0}, {dy:.0})")
            }
            action => format!("mouse {action:?} at ({:.0}, {:.0})", m.position.0, m.position.1),
        },
        RecordPayload::Screenshot(_) => return,
    };
    descriptors.push(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use image::{Rgb, RgbImage};
    use lifetrace_core::error::LlmError;
    use lifetrace_core::hasher::encode_jpeg;
    use lifetrace_core::llm::{ChatCompletion, MessageContent};
    use lifetrace_core::record::{
        KeyAction, KeyType, KeyboardPayload, ScreenshotPayload,
    };
    use crate::optimizer::CompressionLevel;
    use crate::sampler::SamplerSettings;
    use std::collections::VecDeque;

    struct StubChat {
        responses: Mutex<VecDeque<Result<ChatCompletion, LlmError>>>,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl StubChat {
        fn new(responses: Vec<Result<ChatCompletion, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn completion(content: &str) -> Result<ChatCompletion, LlmError> {
            Ok(ChatCompletion {
                content: content.to_string(),
                model: "stub".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn image_parts_in_call(&self, idx: usize) -> usize {
            let calls = self.calls.lock().unwrap();
            calls[idx]
                .iter()
                .map(|m| match &m.content {
                    MessageContent::Parts(parts) => parts
                        .iter()
                        .filter(|p| matches!(p, ContentPart::ImageJpeg { .. }))
                        .count(),
                    _ => 0,
                })
                .sum()
        }

        fn text_of_call(&self, idx: usize) -> String {
            let calls = self.calls.lock().unwrap();
            calls[idx]
                .iter()
                .map(|m| match &m.content {
                    MessageContent::Text(t) => t.clone(),
                    MessageContent::Parts(parts) => parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => Some(text.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join(" "),
                })
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    #[async_trait]
    impl ChatApi for StubChat {
        async fn chat_completion(
            &self,
            messages: Vec<ChatMessage>,
            _options: ChatOptions,
        ) -> Result<ChatCompletion, LlmError> {
            self.calls.lock().unwrap().push(messages);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| StubChat::completion("{}"))
        }
    }

    struct Harness {
        pipeline: Arc<ProcessingPipeline>,
        chat: Arc<StubChat>,
        db: Arc<DatabaseManager>,
        store: Arc<ImageStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(threshold: usize, chat: Arc<StubChat>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ImageStore::new(dir.path(), 50));
        let db = Arc::new(DatabaseManager::open_in_memory().unwrap());

        let settings = PipelineSettings {
            screenshot_threshold: threshold,
            language: Language::En,
            enable_screenshot_deduplication: true,
        };
        let optimizer = ImageOptimizer::new(CompressionLevel::Aggressive, false, 30);
        let sampler = HybridSampler::new(SamplerSettings {
            min_interval: 0.0,
            max_images: 10,
            ..Default::default()
        });

        let pipeline = ProcessingPipeline::new(
            settings,
            optimizer,
            sampler,
            store.clone(),
            db.clone(),
            chat.clone(),
        );
        pipeline.start();
        Harness {
            pipeline,
            chat,
            db,
            store,
            _dir: dir,
        }
    }

    fn busy_jpeg(seed: u32) -> Vec<u8> {
        let mut img = RgbImage::new(320, 180);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let v = (((x * 7 + y * 13 + seed * 41) % 256) as u8).wrapping_mul(3);
            *pixel = Rgb([v, v.wrapping_add(80), v.wrapping_mul(2)]);
        }
        encode_jpeg(&image::DynamicImage::ImageRgb8(img), 85).unwrap()
    }

    fn screenshot_record(
        harness: &Harness,
        hash: &str,
        jpeg: &[u8],
        ts: DateTime<Utc>,
    ) -> RawRecord {
        harness.store.cache(hash, jpeg);
        RawRecord::new(
            ts,
            RecordPayload::Screenshot(ScreenshotPayload {
                monitor_index: 0,
                width: 320,
                height: 180,
                format: "JPEG".to_string(),
                content_hash: hash.to_string(),
                sequence: None,
            }),
        )
    }

    fn key_record(key: &str, ts: DateTime<Utc>) -> RawRecord {
        RawRecord::new(
            ts,
            RecordPayload::Keyboard(KeyboardPayload {
                key: key.to_string(),
                key_type: KeyType::Char,
                action: KeyAction::Press,
                modifiers: Vec::new(),
                sequence: None,
            }),
        )
    }

    const EXTRACTION_JSON: &str = r#"{"events":[{"title":"T","description":"D","keywords":["k"]}],"knowledge":[],"todos":[]}"#;

    // Hashes chosen pairwise > 5 bits apart so C4 dedup keeps them all.
    const HASHES: [&str; 3] = [
        "0000000000000000",
        "00000000ffffffff",
        "ffffffffffffffff",
    ];

    #[tokio::test]
    async fn happy_path_extraction() {
        let chat = StubChat::new(vec![StubChat::completion(EXTRACTION_JSON)]);
        let h = harness(3, chat);
        let t = Utc::now() - Duration::seconds(8);

        let mut records = Vec::new();
        for (i, hash) in HASHES.iter().enumerate() {
            records.push(screenshot_record(
                &h,
                hash,
                &busy_jpeg(i as u32 * 11),
                t + Duration::seconds(2 * i as i64),
            ));
        }
        records.push(key_record("a", t + Duration::seconds(1)));

        let outcome = h.pipeline.process_raw_records(records).await;
        assert!(outcome.extracted);
        assert_eq!(outcome.accumulated, 0);

        assert_eq!(h.chat.call_count(), 1);
        assert_eq!(h.chat.image_parts_in_call(0), 3);
        assert!(h.chat.text_of_call(0).contains("keyboard activity"));

        let handle = h.db.acquire();
        let guard = handle.lock().unwrap();
        let events = guard.get_events(10, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "T");
        assert_eq!(events[0].description, "D");
        assert_eq!(events[0].keywords, vec!["k"]);

        // Accepted frames are linked and resolvable as thumbnails
        let hashes = guard.get_event_image_hashes(&events[0].id).unwrap();
        assert_eq!(hashes.len(), 3);
        drop(guard);
        for hash in &hashes {
            assert!(h.store.get(hash).is_some());
        }
    }

    #[tokio::test]
    async fn below_threshold_accumulates_without_llm_call() {
        let chat = StubChat::new(vec![]);
        let h = harness(20, chat);
        let t = Utc::now() - Duration::seconds(5);

        let records = vec![screenshot_record(&h, HASHES[0], &busy_jpeg(1), t)];
        let outcome = h.pipeline.process_raw_records(records).await;

        assert!(!outcome.extracted);
        assert_eq!(outcome.accumulated, 1);
        assert_eq!(h.chat.call_count(), 0);
    }

    #[tokio::test]
    async fn identical_frames_collapse_to_one() {
        let chat = StubChat::new(vec![]);
        let h = harness(20, chat);
        let t = Utc::now() - Duration::seconds(9);
        let jpeg = busy_jpeg(7);

        // 10 identical frames over ~2.5s, all same hash
        let records: Vec<RawRecord> = (0..10)
            .map(|i| {
                screenshot_record(&h, HASHES[0], &jpeg, t + Duration::milliseconds(i * 250))
            })
            .collect();

        let outcome = h.pipeline.process_raw_records(records).await;
        assert!(!outcome.extracted);
        // pHash dedup collapses identical hashes to the first
        assert_eq!(outcome.accumulated, 1);
    }

    #[tokio::test]
    async fn llm_failure_produces_fallback_event() {
        let chat = StubChat::new(vec![Err(LlmError::Timeout)]);
        let h = harness(3, chat);
        let t = Utc::now() - Duration::seconds(8);

        let mut records = Vec::new();
        for (i, hash) in HASHES.iter().enumerate() {
            records.push(screenshot_record(
                &h,
                hash,
                &busy_jpeg(i as u32 * 13),
                t + Duration::seconds(2 * i as i64),
            ));
        }
        // Keystrokes far enough apart not to merge into one sequence
        records.push(key_record("a", t));
        records.push(key_record("b", t + Duration::seconds(1)));
        records.push(key_record("c", t + Duration::seconds(2)));

        let outcome = h.pipeline.process_raw_records(records).await;
        assert!(outcome.extracted);

        let handle = h.db.acquire();
        let guard = handle.lock().unwrap();
        let events = guard.get_events(10, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].title.starts_with("[Fallback]"));
        assert!(events[0].description.contains("key a"));
        assert!(events[0].description.contains("key b"));
        assert!(events[0].description.contains("key c"));
        assert!(events[0].keywords.is_empty());

        let (_, knowledge) = guard.get_knowledge_list().unwrap();
        assert!(knowledge.is_empty());
        let (_, todos) = guard.get_todo_list(true).unwrap();
        assert!(todos.is_empty());
    }

    #[tokio::test]
    async fn unparseable_output_degrades_to_fallback() {
        let chat = StubChat::new(vec![StubChat::completion("API 请求失败: timeout")]);
        let h = harness(2, chat);
        let t = Utc::now() - Duration::seconds(5);

        let records = vec![
            screenshot_record(&h, HASHES[0], &busy_jpeg(1), t),
            screenshot_record(&h, HASHES[2], &busy_jpeg(5), t + Duration::seconds(2)),
        ];
        h.pipeline.process_raw_records(records).await;

        let handle = h.db.acquire();
        let guard = handle.lock().unwrap();
        let events = guard.get_events(10, 0).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].title.starts_with("[Fallback]"));
    }

    #[tokio::test]
    async fn stop_flushes_residual_accumulator() {
        let chat = StubChat::new(vec![StubChat::completion(EXTRACTION_JSON)]);
        let h = harness(20, chat);
        let t = Utc::now() - Duration::seconds(8);

        let records: Vec<RawRecord> = HASHES
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                screenshot_record(&h, hash, &busy_jpeg(i as u32), t + Duration::seconds(2 * i as i64))
            })
            .collect();
        let outcome = h.pipeline.process_raw_records(records).await;
        assert!(!outcome.extracted);

        h.pipeline.stop().await;
        assert_eq!(h.chat.call_count(), 1);

        // Second stop is a no-op
        h.pipeline.stop().await;
        assert_eq!(h.chat.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let chat = StubChat::new(vec![]);
        let h = harness(3, chat);
        let outcome = h.pipeline.process_raw_records(Vec::new()).await;
        assert_eq!(outcome.processed, 0);
        assert!(!outcome.extracted);
        assert_eq!(h.chat.call_count(), 0);
    }

    #[tokio::test]
    async fn event_timestamp_is_latest_screenshot() {
        let chat = StubChat::new(vec![StubChat::completion(EXTRACTION_JSON)]);
        let h = harness(2, chat);
        let t = Utc::now() - Duration::seconds(9);
        let latest = t + Duration::seconds(4);

        let records = vec![
            screenshot_record(&h, HASHES[0], &busy_jpeg(0), t),
            screenshot_record(&h, HASHES[2], &busy_jpeg(3), latest),
        ];
        h.pipeline.process_raw_records(records).await;

        let handle = h.db.acquire();
        let guard = handle.lock().unwrap();
        let events = guard.get_events(10, 0).unwrap();
        assert_eq!(events[0].timestamp, latest);
    }
}
