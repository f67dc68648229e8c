use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lifetrace_core::config::AppConfig;
use lifetrace_core::db::DatabaseManager;
use lifetrace_core::llm::LlmManager;
use lifetrace_core::prompts::Language;
use lifetrace_core::schema::LlmModel;
use lifetrace_core::store::ImageStore;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregationScheduler, AggregatorSettings};
use crate::optimizer::{CompressionLevel, ImageOptimizer};
use crate::perception::PerceptionManager;
use crate::pipeline::{PipelineSettings, ProcessingPipeline};
use crate::sampler::{HybridSampler, SamplerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Stopped,
    Starting,
    Running,
    RequiresModel,
    Error,
}

#[derive(Default)]
struct Components {
    perception: Option<Arc<PerceptionManager>>,
    pipeline: Option<Arc<ProcessingPipeline>>,
    aggregator: Option<Arc<AggregationScheduler>>,
}

struct ModeState {
    mode: Mode,
    last_error: Option<String>,
    active_model: Option<LlmModel>,
}

/// Lifecycle owner: validates the active model, constructs and starts the
/// perception manager, pipeline, and aggregation timers, and runs the
/// drain loop that feeds window snapshots into the pipeline.
///
/// `start` and `stop` are idempotent; `stop` always reaches `Stopped`.
pub struct Coordinator {
    config: AppConfig,
    db: Arc<DatabaseManager>,
    store: Arc<ImageStore>,
    llm: Arc<LlmManager>,
    components: Mutex<Components>,
    mode: Mutex<ModeState>,
    drain_shutdown: Mutex<Option<watch::Sender<bool>>>,
    drain_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    processing_cycles: AtomicU64,
    start_time: Mutex<Option<DateTime<Utc>>>,
    last_processing_time: Mutex<Option<DateTime<Utc>>>,
}

impl Coordinator {
    pub fn new(
        config: AppConfig,
        db: Arc<DatabaseManager>,
        store: Arc<ImageStore>,
        llm: Arc<LlmManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            store,
            llm,
            components: Mutex::new(Components::default()),
            mode: Mutex::new(ModeState {
                mode: Mode::Stopped,
                last_error: None,
                active_model: None,
            }),
            drain_shutdown: Mutex::new(None),
            drain_task: Mutex::new(None),
            processing_cycles: AtomicU64::new(0),
            start_time: Mutex::new(None),
            last_processing_time: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode.lock().unwrap_or_else(|e| e.into_inner()).mode
    }

    fn set_mode(&self, mode: Mode, error: Option<String>) {
        let mut state = self.mode.lock().unwrap_or_else(|e| e.into_inner());
        state.mode = mode;
        state.last_error = error;
    }

    /// Start capture + processing. Without a usable active model this
    /// settles in `RequiresModel` and returns Ok; any component failure
    /// rolls back via `stop` and propagates.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.mode() == Mode::Running {
            debug!("coordinator already running");
            return Ok(());
        }
        self.set_mode(Mode::Starting, None);

        // 1. Validate the active model
        let model = match self.load_active_model().await {
            Ok(model) => model,
            Err(e) => {
                self.set_mode(Mode::Error, Some(e.to_string()));
                return Err(e);
            }
        };
        let Some(model) = model else {
            let message =
                "no active LLM model configured; add and activate a model first".to_string();
            warn!("{message}");
            self.set_mode(Mode::RequiresModel, Some(message));
            return Ok(());
        };
        let missing = model.missing_required_fields();
        if !missing.is_empty() {
            let message = format!("active model is missing required fields: {}", missing.join(", "));
            warn!("{message}");
            self.set_mode(Mode::RequiresModel, Some(message));
            return Ok(());
        }
        info!(model = %model.model, provider = %model.provider, "active model validated");
        {
            let mut state = self.mode.lock().unwrap_or_else(|e| e.into_inner());
            state.active_model = Some(model);
        }

        // 2. Construct components if not present
        self.ensure_components();

        // 3. Start perception and pipeline together
        let (perception, pipeline, aggregator) = {
            let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
            (
                components.perception.clone().unwrap(),
                components.pipeline.clone().unwrap(),
                components.aggregator.clone().unwrap(),
            )
        };

        pipeline.start();
        if let Err(e) = perception.start().await {
            error!(error = %e, "perception failed to start, rolling back");
            self.stop().await;
            self.set_mode(Mode::Error, Some(e.to_string()));
            return Err(e.into());
        }
        aggregator.start();

        // 4. Drain loop
        self.spawn_drain_loop(perception, pipeline);

        *self.start_time.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.set_mode(Mode::Running, None);
        info!(
            interval = self.config.monitoring.processing_interval,
            "coordinator running"
        );
        Ok(())
    }

    /// Construct perception, pipeline, and aggregator if absent. Exposed so
    /// the service layer can operate components before a full `start`.
    pub fn ensure_components(self: &Arc<Self>) {
        let mut components = self.components.lock().unwrap_or_else(|e| e.into_inner());

        if components.perception.is_none() {
            components.perception =
                Some(PerceptionManager::new(&self.config, self.store.clone()));
        }
        if components.pipeline.is_none() {
            let opt = &self.config.image_optimization;
            let optimizer = ImageOptimizer::new(
                CompressionLevel::parse(&opt.compression_level),
                opt.enable_region_cropping,
                opt.crop_threshold,
            );
            let sampler = HybridSampler::new(SamplerSettings {
                phash_threshold: opt.phash_threshold,
                min_interval: opt.min_interval,
                max_images: opt.max_images,
                enable_content_analysis: opt.enable_content_analysis,
            });
            components.pipeline = Some(ProcessingPipeline::new(
                PipelineSettings {
                    screenshot_threshold: self.config.processing.event_extraction_threshold,
                    language: Language::parse(&self.config.language.default_language),
                    enable_screenshot_deduplication: self
                        .config
                        .processing
                        .enable_screenshot_deduplication,
                },
                optimizer,
                sampler,
                self.store.clone(),
                self.db.clone(),
                self.llm.clone(),
            ));
        }
        if components.aggregator.is_none() {
            components.aggregator = Some(AggregationScheduler::new(
                AggregatorSettings {
                    activity_summary_interval: self.config.processing.activity_summary_interval,
                    knowledge_merge_interval: self.config.processing.knowledge_merge_interval,
                    todo_merge_interval: self.config.processing.todo_merge_interval,
                    language: Language::parse(&self.config.language.default_language),
                },
                self.db.clone(),
                self.llm.clone(),
            ));
        }
    }

    fn spawn_drain_loop(
        self: &Arc<Self>,
        perception: Arc<PerceptionManager>,
        pipeline: Arc<ProcessingPipeline>,
    ) {
        let (tx, mut rx) = watch::channel(false);
        *self
            .drain_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let coordinator = self.clone();
        let interval = self.config.monitoring.processing_interval;

        let handle = tokio::spawn(async move {
            // Quick first tick, then the configured cadence
            let mut wait = Duration::from_millis(100);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = rx.changed() => {
                        debug!("drain loop cancelled");
                        return;
                    }
                }
                wait = Duration::from_secs(interval);

                let records = perception.records_in_last_seconds(interval);
                if records.is_empty() {
                    continue;
                }

                debug!(count = records.len(), "draining window into pipeline");
                let outcome = pipeline.process_raw_records(records).await;
                coordinator
                    .processing_cycles
                    .fetch_add(1, Ordering::Relaxed);
                *coordinator
                    .last_processing_time
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
                debug!(
                    processed = outcome.processed,
                    accumulated = outcome.accumulated,
                    extracted = outcome.extracted,
                    "drain tick complete"
                );
            }
        });
        *self.drain_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop everything. Always lands in `Stopped`, even partway through a
    /// failed start.
    pub async fn stop(self: &Arc<Self>) {
        let shutdown = self
            .drain_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }
        let task = self.drain_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("drain loop did not stop within 5s, detaching");
            }
        }

        let (perception, pipeline, aggregator) = {
            let components = self.components.lock().unwrap_or_else(|e| e.into_inner());
            (
                components.perception.clone(),
                components.pipeline.clone(),
                components.aggregator.clone(),
            )
        };

        if let Some(pipeline) = pipeline {
            pipeline.stop().await;
        }
        if let Some(aggregator) = aggregator {
            aggregator.stop().await;
        }
        if let Some(perception) = perception {
            perception.stop().await;
        }

        self.set_mode(Mode::Stopped, None);
        info!("coordinator stopped");
    }

    async fn load_active_model(&self) -> anyhow::Result<Option<LlmModel>> {
        let db = self.db.clone();
        let model = tokio::task::spawn_blocking(move || {
            let handle = db.acquire();
            let guard = handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.get_active_model()
        })
        .await??;
        Ok(model)
    }

    pub fn perception(&self) -> Option<Arc<PerceptionManager>> {
        self.components
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .perception
            .clone()
    }

    pub fn pipeline(&self) -> Option<Arc<ProcessingPipeline>> {
        self.components
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pipeline
            .clone()
    }

    pub fn aggregator(&self) -> Option<Arc<AggregationScheduler>> {
        self.components
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .aggregator
            .clone()
    }

    pub fn status(&self) -> serde_json::Value {
        let (mode, last_error, active_model) = {
            let state = self.mode.lock().unwrap_or_else(|e| e.into_inner());
            (
                state.mode,
                state.last_error.clone(),
                state.active_model.as_ref().map(|m| m.redacted()),
            )
        };

        let perception_stats = self
            .perception()
            .map(|p| p.stats())
            .unwrap_or(serde_json::Value::Null);
        let pipeline_stats = self
            .pipeline()
            .map(|p| p.stats())
            .unwrap_or(serde_json::Value::Null);

        serde_json::json!({
            "coordinator": {
                "mode": mode,
                "last_error": last_error,
                "active_model": active_model,
                "processing_interval": self.config.monitoring.processing_interval,
                "window_size": self.config.monitoring.window_size,
                "capture_interval": self.config.monitoring.capture_interval,
                "processing_cycles": self.processing_cycles.load(Ordering::Relaxed),
                "start_time": *self.start_time.lock().unwrap_or_else(|e| e.into_inner()),
                "last_processing_time": *self.last_processing_time.lock().unwrap_or_else(|e| e.into_inner()),
            },
            "perception": perception_stats,
            "processing": pipeline_stats,
        })
    }
}
