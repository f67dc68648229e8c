use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use lifetrace_core::db::DatabaseManager;
use lifetrace_core::llm::{ChatMessage, ChatOptions};
use lifetrace_core::prompts::{self, Language};
use lifetrace_core::schema::{Diary, Event, NewActivity};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::ChatApi;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub activity_summary_interval: u64,
    pub knowledge_merge_interval: u64,
    pub todo_merge_interval: u64,
    pub language: Language,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorCounters {
    pub activities_created: u64,
    pub combined_knowledge_created: u64,
    pub combined_todos_created: u64,
    pub diaries_created: u64,
    pub tick_errors: u64,
}

/// Three independent periodic tasks: activity summarization, knowledge
/// merge, and todo merge. Each one sleeps, ticks, and on failure logs and
/// keeps going; cancellation is cooperative at the sleep boundary. Diary
/// generation is on demand.
pub struct AggregationScheduler {
    settings: AggregatorSettings,
    db: Arc<DatabaseManager>,
    chat: Arc<dyn ChatApi>,
    counters: Mutex<AggregatorCounters>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AggregationScheduler {
    pub fn new(
        settings: AggregatorSettings,
        db: Arc<DatabaseManager>,
        chat: Arc<dyn ChatApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            db,
            chat,
            counters: Mutex::new(AggregatorCounters::default()),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        if shutdown.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(self.spawn_timer(
            "activity_summary",
            self.settings.activity_summary_interval,
            rx.clone(),
            |s| Box::pin(async move { s.summarize_activities().await }),
        ));
        tasks.push(self.spawn_timer(
            "knowledge_merge",
            self.settings.knowledge_merge_interval,
            rx.clone(),
            |s| Box::pin(async move { s.merge_knowledge().await }),
        ));
        tasks.push(self.spawn_timer(
            "todo_merge",
            self.settings.todo_merge_interval,
            rx,
            |s| Box::pin(async move { s.merge_todos().await }),
        ));

        info!(
            activity = self.settings.activity_summary_interval,
            knowledge = self.settings.knowledge_merge_interval,
            todo = self.settings.todo_merge_interval,
            "aggregation timers started"
        );
    }

    fn spawn_timer<F>(
        self: &Arc<Self>,
        name: &'static str,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
        tick: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(
                Arc<Self>,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send
            + 'static,
    {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                    _ = shutdown.changed() => {
                        debug!(task = name, "aggregation timer cancelled");
                        return;
                    }
                }

                if let Err(e) = tick(scheduler.clone()).await {
                    error!(task = name, error = %e, "aggregation tick failed");
                    let mut counters = scheduler
                        .counters
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    counters.tick_errors += 1;
                }
            }
        })
    }

    pub async fn stop(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(sender) = sender else {
            return;
        };
        let _ = sender.send(true);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("aggregation task did not stop within 5s");
            }
        }
        info!("aggregation timers stopped");
    }

    /// One pass of all three aggregations, in sequence.
    pub async fn force_finalize(self: &Arc<Self>) {
        if let Err(e) = self.clone().summarize_activities().await {
            error!(error = %e, "forced activity summarization failed");
        }
        if let Err(e) = self.clone().merge_knowledge().await {
            error!(error = %e, "forced knowledge merge failed");
        }
        if let Err(e) = self.clone().merge_todos().await {
            error!(error = %e, "forced todo merge failed");
        }
    }

    // -- Activity summarization --

    async fn summarize_activities(self: Arc<Self>) -> anyhow::Result<()> {
        let events = self
            .with_db(|db| db.get_unassigned_events())
            .await?;
        if events.is_empty() {
            debug!("no unassigned events to summarize");
            return Ok(());
        }

        info!(count = events.len(), "aggregating events into activities");
        let prompt = prompts::activity_aggregation_prompt(self.settings.language, &events);
        let completion = self
            .chat
            .chat_completion(
                vec![ChatMessage::user(prompt)],
                ChatOptions::for_request("activity_summary"),
            )
            .await?;

        let drafts = prompts::parse_activity_drafts(&completion.content)?;
        let valid = validate_activity_drafts(drafts, &events);

        let created = valid.len();
        for (draft, start_time, end_time) in valid {
            let activity = NewActivity {
                id: Uuid::new_v4().to_string(),
                title: draft.title,
                description: draft.description,
                start_time,
                end_time,
                source_event_ids: draft.source_event_ids,
            };
            let version = self
                .with_db(move |db| db.insert_activity(&activity))
                .await?;
            debug!(version, "activity committed");
        }

        if created > 0 {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.activities_created += created as u64;
            info!(created, "activities created");
        }
        Ok(())
    }

    // -- Knowledge merge --

    async fn merge_knowledge(self: Arc<Self>) -> anyhow::Result<()> {
        let unmerged = self.with_db(|db| db.get_unmerged_knowledge()).await?;
        if unmerged.len() < 2 {
            debug!("not enough knowledge to merge");
            return Ok(());
        }

        info!(count = unmerged.len(), "merging knowledge");
        let prompt = prompts::knowledge_merge_prompt(self.settings.language, &unmerged);
        let completion = self
            .chat
            .chat_completion(
                vec![ChatMessage::user(prompt)],
                ChatOptions::for_request("knowledge_merge"),
            )
            .await?;

        let drafts = prompts::parse_merge_drafts(&completion.content)?;
        let valid = validate_merge_drafts(drafts, unmerged.iter().map(|k| k.id.as_str()));

        let created = valid.len();
        for draft in valid {
            let id = Uuid::new_v4().to_string();
            self.with_db(move |db| {
                db.insert_combined_knowledge(
                    &id,
                    &draft.title,
                    &draft.description,
                    &draft.keywords,
                    &draft.merged_from_ids,
                )
            })
            .await?;
        }

        if created > 0 {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.combined_knowledge_created += created as u64;
            info!(created, "combined knowledge created");
        }
        Ok(())
    }

    // -- Todo merge --

    async fn merge_todos(self: Arc<Self>) -> anyhow::Result<()> {
        let unmerged = self.with_db(|db| db.get_unmerged_todos()).await?;
        if unmerged.len() < 2 {
            debug!("not enough todos to merge");
            return Ok(());
        }

        info!(count = unmerged.len(), "merging todos");
        let prompt = prompts::todo_merge_prompt(self.settings.language, &unmerged);
        let completion = self
            .chat
            .chat_completion(
                vec![ChatMessage::user(prompt)],
                ChatOptions::for_request("todo_merge"),
            )
            .await?;

        let drafts = prompts::parse_merge_drafts(&completion.content)?;
        let valid = validate_merge_drafts(drafts, unmerged.iter().map(|t| t.id.as_str()));

        let created = valid.len();
        for draft in valid {
            // Combined todo completes only when every source already has
            let completed = draft
                .merged_from_ids
                .iter()
                .all(|id| unmerged.iter().any(|t| &t.id == id && t.completed));
            let id = Uuid::new_v4().to_string();
            self.with_db(move |db| {
                db.insert_combined_todo(
                    &id,
                    &draft.title,
                    &draft.description,
                    &draft.keywords,
                    &draft.merged_from_ids,
                    completed,
                )
            })
            .await?;
        }

        if created > 0 {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.combined_todos_created += created as u64;
            info!(created, "combined todos created");
        }
        Ok(())
    }

    // -- Diary --

    /// Generate (or regenerate) the diary for a UTC day. `Ok(None)` means
    /// the date has no activities to write about.
    pub async fn generate_diary(&self, date: &str) -> anyhow::Result<Option<Diary>> {
        let date_owned = date.to_string();
        let activities = self
            .with_db(move |db| db.get_activities_for_date(&date_owned))
            .await?;
        if activities.is_empty() {
            return Ok(None);
        }

        let prompt = prompts::diary_prompt(self.settings.language, date, &activities);
        let completion = self
            .chat
            .chat_completion(
                vec![ChatMessage::user(prompt)],
                ChatOptions::for_request("diary"),
            )
            .await?;

        let content = completion.content.trim().to_string();
        let ids: Vec<String> = activities.iter().map(|a| a.id.clone()).collect();
        let date_owned = date.to_string();
        let diary = self
            .with_db(move |db| db.upsert_diary(&date_owned, &content, &ids))
            .await?;

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.diaries_created += 1;
        Ok(Some(diary))
    }

    pub fn counters(&self) -> AggregatorCounters {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
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
}

/// Keep only drafts whose source ids exist, are non-empty, and don't
/// overlap a previously accepted draft — no event may belong to two
/// non-deleted activities. The activity span is computed from its events.
fn validate_activity_drafts(
    drafts: Vec<prompts::ActivityDraft>,
    events: &[Event],
) -> Vec<(
    prompts::ActivityDraft,
    chrono::DateTime<Utc>,
    chrono::DateTime<Utc>,
)> {
    let mut used: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();

    for mut draft in drafts {
        draft.source_event_ids.retain(|id| {
            events.iter().any(|e| &e.id == id) && !used.contains(id.as_str())
        });
        draft.source_event_ids.dedup();
        if draft.source_event_ids.is_empty() {
            continue;
        }

        let referenced: Vec<&Event> = events
            .iter()
            .filter(|e| draft.source_event_ids.contains(&e.id))
            .collect();
        let start = referenced.iter().map(|e| e.timestamp).min().unwrap();
        let end = referenced.iter().map(|e| e.timestamp).max().unwrap();

        for id in &draft.source_event_ids {
            // Borrow from `events`, which outlives this loop
            if let Some(event) = events.iter().find(|e| &e.id == id) {
                used.insert(event.id.as_str());
            }
        }
        out.push((draft, start, end));
    }
    out
}

/// Keep only merge drafts referencing ≥ 2 known, not-yet-claimed source
/// ids.
fn validate_merge_drafts<'a>(
    drafts: Vec<prompts::MergeDraft>,
    known_ids: impl Iterator<Item = &'a str>,
) -> Vec<prompts::MergeDraft> {
    let known: HashSet<&str> = known_ids.collect();
    let mut used: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for mut draft in drafts {
        draft
            .merged_from_ids
            .retain(|id| known.contains(id.as_str()) && !used.contains(id));
        draft.merged_from_ids.dedup();
        if draft.merged_from_ids.len() < 2 {
            continue;
        }
        for id in &draft.merged_from_ids {
            used.insert(id.clone());
        }
        out.push(draft);
    }
    out
}
