use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use lifetrace_core::config::{AppConfig, ImageOptimizationConfig};
use lifetrace_core::db::DatabaseManager;
use lifetrace_core::llm::{LlmClient, LlmManager};
use lifetrace_core::prompts::Language;
use lifetrace_core::record::{RawRecord, RecordKind};
use lifetrace_core::schema::{
    Activity, Diary, Event, IncrementalActivities, LlmModel, LlmModelUpdate, NewLlmModel,
    RedactedModel,
};
use lifetrace_core::store::ImageStore;
use serde_json::json;
use tracing::info;

use crate::aggregator::AggregationScheduler;
use crate::coordinator::Coordinator;
use crate::optimizer::{CompressionLevel, ImageOptimizer};
use crate::perception::PerceptionManager;
use crate::pipeline::ProcessingPipeline;
use crate::sampler::{HybridSampler, SamplerSettings};

/// Transport-agnostic public operations. An HTTP or RPC handler layer wraps
/// each method one-to-one; nothing here knows about the wire.
pub struct SystemService {
    coordinator: Arc<Coordinator>,
    db: Arc<DatabaseManager>,
    store: Arc<ImageStore>,
    llm: Arc<LlmManager>,
    config: Mutex<AppConfig>,
    config_path: Option<PathBuf>,
}

impl SystemService {
    pub fn new(
        coordinator: Arc<Coordinator>,
        db: Arc<DatabaseManager>,
        store: Arc<ImageStore>,
        llm: Arc<LlmManager>,
        config: AppConfig,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            coordinator,
            db,
            store,
            llm,
            config: Mutex::new(config),
            config_path,
        }
    }

    fn perception(&self) -> anyhow::Result<Arc<PerceptionManager>> {
        self.coordinator.ensure_components();
        self.coordinator
            .perception()
            .ok_or_else(|| anyhow!("perception manager unavailable"))
    }

    fn pipeline(&self) -> anyhow::Result<Arc<ProcessingPipeline>> {
        self.coordinator.ensure_components();
        self.coordinator
            .pipeline()
            .ok_or_else(|| anyhow!("processing pipeline unavailable"))
    }

    fn aggregator(&self) -> anyhow::Result<Arc<AggregationScheduler>> {
        self.coordinator.ensure_components();
        self.coordinator
            .aggregator()
            .ok_or_else(|| anyhow!("aggregation scheduler unavailable"))
    }

    async fn with_db<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&lifetrace_core::db::Database) -> lifetrace_core::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || {
            let handle = db.acquire();
            let guard = handle.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await??;
        Ok(result)
    }

    // -- Perception --

    pub async fn perception_start(&self) -> anyhow::Result<()> {
        self.perception()?.start().await.map_err(Into::into)
    }

    pub async fn perception_stop(&self) -> anyhow::Result<()> {
        self.perception()?.stop().await;
        Ok(())
    }

    pub fn perception_stats(&self) -> anyhow::Result<serde_json::Value> {
        Ok(self.perception()?.stats())
    }

    pub fn records(&self, limit: usize) -> anyhow::Result<Vec<RawRecord>> {
        Ok(self.perception()?.records_last(limit))
    }

    pub fn records_by_kind(&self, kind: &str) -> anyhow::Result<Vec<RawRecord>> {
        let kind = RecordKind::parse(kind).ok_or_else(|| anyhow!("unknown record kind {kind}"))?;
        Ok(self.perception()?.records_by_kind(kind))
    }

    pub fn records_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<RawRecord>> {
        Ok(self.perception()?.records_in_range(start, end))
    }

    pub fn buffered_events(&self) -> anyhow::Result<Vec<RawRecord>> {
        Ok(self.perception()?.buffered_events())
    }

    pub fn clear_records(&self) -> anyhow::Result<()> {
        self.perception()?.clear_records();
        Ok(())
    }

    // -- Processing --

    pub async fn processing_start(&self) -> anyhow::Result<()> {
        self.pipeline()?.start();
        self.aggregator()?.start();
        Ok(())
    }

    pub async fn processing_stop(&self) -> anyhow::Result<()> {
        self.pipeline()?.stop().await;
        self.aggregator()?.stop().await;
        Ok(())
    }

    pub fn processing_stats(&self) -> anyhow::Result<serde_json::Value> {
        let pipeline = self.pipeline()?;
        let aggregator = self.aggregator()?;
        Ok(json!({
            "pipeline": pipeline.stats(),
            "aggregation": aggregator.counters(),
        }))
    }

    pub async fn events(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<Event>> {
        self.with_db(move |db| db.get_events(limit, offset)).await
    }

    pub async fn activities(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<Activity>> {
        self.with_db(move |db| db.get_activities(limit, offset))
            .await
    }

    pub async fn activities_incremental(
        &self,
        since_version: i64,
    ) -> anyhow::Result<IncrementalActivities> {
        self.with_db(move |db| db.get_activities_since_version(since_version))
            .await
    }

    pub async fn activity_count_by_date(&self) -> anyhow::Result<Vec<(String, i64)>> {
        self.with_db(|db| db.activity_count_by_date()).await
    }

    pub async fn finalize_current_activity(&self) -> anyhow::Result<()> {
        self.aggregator()?.force_finalize().await;
        Ok(())
    }

    pub async fn cleanup_old_data(&self, days: i64) -> anyhow::Result<u64> {
        let touched = self.with_db(move |db| db.cleanup_old_data(days)).await?;
        info!(days, touched, "old data soft-deleted");
        Ok(touched)
    }

    pub async fn delete_event(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_db(move |db| db.soft_delete_event(&id)).await
    }

    pub async fn delete_activity(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_db(move |db| db.soft_delete_activity(&id)).await
    }

    pub async fn delete_knowledge(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_db(move |db| db.soft_delete_knowledge(&id)).await
    }

    pub async fn delete_todo(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_db(move |db| db.soft_delete_todo(&id)).await
    }

    pub async fn knowledge_list(&self) -> anyhow::Result<serde_json::Value> {
        let (combined, plain) = self.with_db(|db| db.get_knowledge_list()).await?;
        Ok(json!({"combined": combined, "items": plain}))
    }

    pub async fn todo_list(&self, include_completed: bool) -> anyhow::Result<serde_json::Value> {
        let (combined, plain) = self
            .with_db(move |db| db.get_todo_list(include_completed))
            .await?;
        Ok(json!({"combined": combined, "items": plain}))
    }

    pub async fn generate_diary(&self, date: &str) -> anyhow::Result<Option<Diary>> {
        self.aggregator()?.generate_diary(date).await
    }

    pub async fn diaries(&self, limit: i64) -> anyhow::Result<Vec<Diary>> {
        self.with_db(move |db| db.get_diaries(limit)).await
    }

    pub async fn diary_for_date(&self, date: &str) -> anyhow::Result<Option<Diary>> {
        let date = date.to_string();
        self.with_db(move |db| db.get_diary_by_date(&date)).await
    }

    pub async fn delete_diary(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_db(move |db| db.soft_delete_diary(&id)).await
    }

    // -- Image store --

    pub fn image_stats(&self) -> serde_json::Value {
        serde_json::to_value(self.store.stats()).unwrap_or_default()
    }

    pub fn get_cached_images(
        &self,
        hashes: Vec<String>,
    ) -> std::collections::HashMap<String, String> {
        self.store.get_many(&hashes)
    }

    pub fn image_cleanup(&self, max_age_hours: u64) -> usize {
        self.store.gc(Duration::from_secs(max_age_hours * 3600))
    }

    pub fn clear_image_cache(&self) -> usize {
        self.store.clear_cache()
    }

    pub fn optimization_config(&self) -> ImageOptimizationConfig {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .image_optimization
            .clone()
    }

    /// Apply new optimization knobs: persists them to the config file and
    /// rebuilds the pipeline's optimizer and sampler.
    pub fn set_optimization_config(
        &self,
        new: ImageOptimizationConfig,
    ) -> anyhow::Result<ImageOptimizationConfig> {
        {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            config.image_optimization = new.clone();
            if let Some(path) = &self.config_path {
                config
                    .save_to(path)
                    .context("persisting optimization config")?;
            }
        }

        if let Some(pipeline) = self.coordinator.pipeline() {
            let optimizer = ImageOptimizer::new(
                CompressionLevel::parse(&new.compression_level),
                new.enable_region_cropping,
                new.crop_threshold,
            );
            let sampler = HybridSampler::new(SamplerSettings {
                phash_threshold: new.phash_threshold,
                min_interval: new.min_interval,
                max_images: new.max_images,
                enable_content_analysis: new.enable_content_analysis,
            });
            pipeline.reconfigure_optimization(optimizer, sampler);
        }
        info!("image optimization reconfigured");
        Ok(new)
    }

    pub fn optimization_stats(&self) -> anyhow::Result<serde_json::Value> {
        Ok(self.pipeline()?.optimization_stats())
    }

    // -- Model registry --

    pub async fn create_model(&self, new: NewLlmModel) -> anyhow::Result<LlmModel> {
        self.with_db(move |db| db.create_model(&new)).await
    }

    /// Listing masks credentials; `get_model` is the full row for editing.
    pub async fn list_models(&self) -> anyhow::Result<Vec<LlmModel>> {
        let mut models = self.with_db(|db| db.list_models()).await?;
        for model in &mut models {
            model.api_key.clear();
        }
        Ok(models)
    }

    pub async fn get_model(&self, id: &str) -> anyhow::Result<Option<LlmModel>> {
        let id = id.to_string();
        self.with_db(move |db| db.get_model(&id)).await
    }

    pub async fn get_active_model(&self) -> anyhow::Result<Option<RedactedModel>> {
        let model = self.with_db(|db| db.get_active_model()).await?;
        Ok(model.map(|m| m.redacted()))
    }

    /// Activate a model. The LLM binding defers to the next request, so an
    /// in-flight stream finishes against the previous model.
    pub async fn select_model(&self, id: &str) -> anyhow::Result<LlmModel> {
        let id = id.to_string();
        let model = self.with_db(move |db| db.select_model(&id)).await?;
        self.llm.reload_on_next_request().await;
        Ok(model)
    }

    pub async fn update_model(
        &self,
        id: &str,
        update: LlmModelUpdate,
    ) -> anyhow::Result<Option<LlmModel>> {
        let id_owned = id.to_string();
        let updated = self
            .with_db(move |db| db.update_model(&id_owned, &update))
            .await?;
        if updated.as_ref().map(|m| m.is_active).unwrap_or(false) {
            self.llm.reload_on_next_request().await;
        }
        Ok(updated)
    }

    pub async fn delete_model(&self, id: &str) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.with_db(move |db| db.delete_model(&id)).await
    }

    /// Connectivity test against the provider, 15 s budget; the outcome is
    /// stored on the model row.
    pub async fn test_model(&self, id: &str) -> anyhow::Result<(bool, Option<String>)> {
        let model = self
            .get_model(id)
            .await?
            .ok_or_else(|| anyhow!("no model with id {id}"))?;

        let outcome = match LlmClient::from_model(&model, None) {
            Ok(client) => client.probe().await,
            Err(e) => Err(e),
        };
        let (ok, error) = match outcome {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        let id_owned = id.to_string();
        let error_clone = error.clone();
        self.with_db(move |db| db.record_model_test(&id_owned, ok, error_clone.as_deref()))
            .await?;
        Ok((ok, error))
    }

    // -- System --

    pub async fn system_start(&self) -> anyhow::Result<()> {
        self.coordinator.start().await
    }

    pub async fn system_stop(&self) -> anyhow::Result<()> {
        self.coordinator.stop().await;
        Ok(())
    }

    pub fn system_stats(&self) -> serde_json::Value {
        self.coordinator.status()
    }

    pub fn get_settings(&self) -> AppConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply a new configuration. The database path and image store base
    /// rebind immediately (a failed database swap keeps the old handle);
    /// capture/processing cadences take effect on the next system start.
    pub async fn update_settings(&self, new: AppConfig) -> anyhow::Result<AppConfig> {
        let new_db_path = new.db_path()?;
        let new_store_dir = new.screenshot_dir()?;

        if self.db.path().as_deref() != Some(new_db_path.as_path()) {
            self.db.set_path(&new_db_path)?;
        }
        self.store.update_storage_path(&new_store_dir);

        {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            *config = new.clone();
            if let Some(path) = &self.config_path {
                config.save_to(path).context("persisting settings")?;
            }
        }
        info!("settings updated");
        Ok(new)
    }

    pub fn get_database_path(&self) -> Option<PathBuf> {
        self.db.path()
    }

    pub fn language(&self) -> Language {
        Language::parse(
            &self
                .config
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .language
                .default_language,
        )
    }
}
