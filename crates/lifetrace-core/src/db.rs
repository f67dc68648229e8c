use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::record::RawRecord;
use crate::schema::{
    Activity, CombinedKnowledge, CombinedTodo, Diary, Event, IncrementalActivities, Knowledge,
    LlmModel, LlmModelUpdate, NewActivity, NewEvent, NewLlmModel, Todo, TokenUsage,
};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, apply PRAGMAs and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.apply_pragmas()?;
        db.run_migrations()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn run_migrations(&mut self) -> Result<()> {
        embedded::migrations::runner()
            .run(&mut self.conn)
            .map_err(|e| CoreError::Migration(e.to_string()))?;
        Ok(())
    }

    // -- Events --

    pub fn insert_event(&self, new: &NewEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (id, title, description, keywords, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.id,
                new.title,
                new.description,
                json_array(&new.keywords),
                new.timestamp.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_events(&self, limit: i64, offset: i64) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, keywords, timestamp, created_at
             FROM events
             WHERE deleted = 0
             ORDER BY timestamp DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], event_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_events_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, keywords, timestamp, created_at
             FROM events
             WHERE deleted = 0 AND timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![start.to_rfc3339(), end.to_rfc3339()], event_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// `get_by_id` ignores the deleted flag by design.
    pub fn get_event_by_id(&self, id: &str) -> Result<Option<Event>> {
        self.conn
            .query_row(
                "SELECT id, title, description, keywords, timestamp, created_at
                 FROM events WHERE id = ?1",
                params![id],
                event_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn soft_delete_event(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("UPDATE events SET deleted = 1 WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Events not referenced by any non-deleted activity, oldest first.
    pub fn get_unassigned_events(&self) -> Result<Vec<Event>> {
        let assigned = self.assigned_event_ids()?;
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, keywords, timestamp, created_at
             FROM events
             WHERE deleted = 0
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map([], event_from_row)?;
        let mut events = Vec::new();
        for row in rows {
            let event = row?;
            if !assigned.contains(&event.id) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn assigned_event_ids(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT source_event_ids FROM activities WHERE deleted = 0")?;
        let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;

        let mut ids = HashSet::new();
        for row in rows {
            if let Some(json) = row? {
                if let Ok(list) = serde_json::from_str::<Vec<String>>(&json) {
                    ids.extend(list);
                }
            }
        }
        Ok(ids)
    }

    /// Count of non-deleted events per UTC day, newest day first.
    pub fn event_count_by_date(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT date(timestamp) AS day, COUNT(*) AS cnt
             FROM events
             WHERE deleted = 0
             GROUP BY day
             ORDER BY day DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Count of non-deleted activities per UTC day, newest day first.
    pub fn activity_count_by_date(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT date(start_time) AS day, COUNT(*) AS cnt
             FROM activities
             WHERE deleted = 0
             GROUP BY day
             ORDER BY day DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -- Activities --

    /// Insert an activity with the next version number. Version assignment
    /// and insert happen in one transaction, so versions are unique and
    /// strictly increasing in commit order.
    pub fn insert_activity(&self, new: &NewActivity) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM activities",
            [],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO activities
             (id, title, description, start_time, end_time, source_event_ids, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.id,
                new.title,
                new.description,
                new.start_time.to_rfc3339(),
                new.end_time.to_rfc3339(),
                json_array(&new.source_event_ids),
                version,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(version)
    }

    pub fn get_activities(&self, limit: i64, offset: i64) -> Result<Vec<Activity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, start_time, end_time, source_event_ids,
                    version, created_at, deleted
             FROM activities
             WHERE deleted = 0
             ORDER BY start_time DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], activity_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Activities with `version > since`, version-descending, plus the
    /// current max version for the client's next pull.
    pub fn get_activities_since_version(&self, since: i64) -> Result<IncrementalActivities> {
        let max_version: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM activities WHERE deleted = 0",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, start_time, end_time, source_event_ids,
                    version, created_at, deleted
             FROM activities
             WHERE deleted = 0 AND version > ?1
             ORDER BY version DESC",
        )?;
        let rows = stmt.query_map(params![since], activity_from_row)?;
        let activities = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(IncrementalActivities {
            activities,
            max_version,
        })
    }

    /// Activities whose start_time falls inside the given UTC day
    /// (`YYYY-MM-DD`).
    pub fn get_activities_for_date(&self, date: &str) -> Result<Vec<Activity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, start_time, end_time, source_event_ids,
                    version, created_at, deleted
             FROM activities
             WHERE deleted = 0 AND date(start_time) = ?1
             ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map(params![date], activity_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_activity_by_id(&self, id: &str) -> Result<Option<Activity>> {
        self.conn
            .query_row(
                "SELECT id, title, description, start_time, end_time, source_event_ids,
                        version, created_at, deleted
                 FROM activities WHERE id = ?1",
                params![id],
                activity_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn soft_delete_activity(&self, id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE activities SET deleted = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(n > 0)
    }

    // -- Knowledge --

    pub fn insert_knowledge(&self, id: &str, title: &str, description: &str, keywords: &[String], created_at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO knowledge (id, title, description, keywords, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, title, description, json_array(keywords), created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_combined_knowledge(
        &self,
        id: &str,
        title: &str,
        description: &str,
        keywords: &[String],
        merged_from_ids: &[String],
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO combined_knowledge
             (id, title, description, keywords, merged_from_ids, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                title,
                description,
                json_array(keywords),
                json_array(merged_from_ids),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Knowledge rows not yet subsumed by any non-deleted combined entry.
    pub fn get_unmerged_knowledge(&self) -> Result<Vec<Knowledge>> {
        let merged = self.merged_ids("combined_knowledge")?;
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, keywords, created_at, deleted
             FROM knowledge
             WHERE deleted = 0
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], knowledge_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let k = row?;
            if !merged.contains(&k.id) {
                out.push(k);
            }
        }
        Ok(out)
    }

    fn merged_ids(&self, table: &str) -> Result<HashSet<String>> {
        let sql = format!("SELECT merged_from_ids FROM {table} WHERE deleted = 0");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, Option<String>>(0))?;

        let mut ids = HashSet::new();
        for row in rows {
            if let Some(json) = row? {
                if let Ok(list) = serde_json::from_str::<Vec<String>>(&json) {
                    ids.extend(list);
                }
            }
        }
        Ok(ids)
    }

    /// Knowledge list for display: combined entries when any exist,
    /// otherwise the plain rows.
    pub fn get_knowledge_list(&self) -> Result<(Vec<CombinedKnowledge>, Vec<Knowledge>)> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, keywords, merged_from_ids, created_at, deleted
             FROM combined_knowledge
             WHERE deleted = 0
             ORDER BY created_at DESC",
        )?;
        let combined = stmt
            .query_map([], combined_knowledge_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if !combined.is_empty() {
            return Ok((combined, Vec::new()));
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, keywords, created_at, deleted
             FROM knowledge
             WHERE deleted = 0
             ORDER BY created_at DESC",
        )?;
        let plain = stmt
            .query_map([], knowledge_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((Vec::new(), plain))
    }

    /// Soft delete: tries the combined table first, then the plain one.
    pub fn soft_delete_knowledge(&self, id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE combined_knowledge SET deleted = 1 WHERE id = ?1",
            params![id],
        )?;
        if n > 0 {
            return Ok(true);
        }
        let n = self
            .conn
            .execute("UPDATE knowledge SET deleted = 1 WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // -- Todos --

    pub fn insert_todo(
        &self,
        id: &str,
        title: &str,
        description: &str,
        keywords: &[String],
        completed: bool,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO todos (id, title, description, keywords, completed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                title,
                description,
                json_array(keywords),
                completed as i64,
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_combined_todo(
        &self,
        id: &str,
        title: &str,
        description: &str,
        keywords: &[String],
        merged_from_ids: &[String],
        completed: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO combined_todos
             (id, title, description, keywords, merged_from_ids, completed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                title,
                description,
                json_array(keywords),
                json_array(merged_from_ids),
                completed as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_unmerged_todos(&self) -> Result<Vec<Todo>> {
        let merged = self.merged_ids("combined_todos")?;
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, keywords, completed, created_at, deleted
             FROM todos
             WHERE deleted = 0
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], todo_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let t = row?;
            if !merged.contains(&t.id) {
                out.push(t);
            }
        }
        Ok(out)
    }

    pub fn get_todo_list(&self, include_completed: bool) -> Result<(Vec<CombinedTodo>, Vec<Todo>)> {
        let sql = if include_completed {
            "SELECT id, title, description, keywords, merged_from_ids, completed, created_at, deleted
             FROM combined_todos
             WHERE deleted = 0
             ORDER BY completed ASC, created_at DESC"
        } else {
            "SELECT id, title, description, keywords, merged_from_ids, completed, created_at, deleted
             FROM combined_todos
             WHERE deleted = 0 AND completed = 0
             ORDER BY created_at DESC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let combined = stmt
            .query_map([], combined_todo_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if !combined.is_empty() {
            return Ok((combined, Vec::new()));
        }

        let sql = if include_completed {
            "SELECT id, title, description, keywords, completed, created_at, deleted
             FROM todos WHERE deleted = 0
             ORDER BY completed ASC, created_at DESC"
        } else {
            "SELECT id, title, description, keywords, completed, created_at, deleted
             FROM todos WHERE deleted = 0 AND completed = 0
             ORDER BY created_at DESC"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let plain = stmt
            .query_map([], todo_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((Vec::new(), plain))
    }

    pub fn soft_delete_todo(&self, id: &str) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE combined_todos SET deleted = 1 WHERE id = ?1",
            params![id],
        )?;
        if n > 0 {
            return Ok(true);
        }
        let n = self
            .conn
            .execute("UPDATE todos SET deleted = 1 WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // -- Diaries --

    /// Insert or replace the diary for a date; re-generation revives a
    /// soft-deleted row.
    pub fn upsert_diary(
        &self,
        date: &str,
        content: &str,
        source_activity_ids: &[String],
    ) -> Result<Diary> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO diaries (id, date, content, source_activity_ids, deleted, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)
             ON CONFLICT(date) DO UPDATE SET
                 content = excluded.content,
                 source_activity_ids = excluded.source_activity_ids,
                 deleted = 0",
            params![id, date, content, json_array(source_activity_ids), now],
        )?;
        self.get_diary_by_date(date)?
            .ok_or_else(|| CoreError::Parse(format!("diary upsert for {date} not readable back")))
    }

    pub fn get_diary_by_date(&self, date: &str) -> Result<Option<Diary>> {
        self.conn
            .query_row(
                "SELECT id, date, content, source_activity_ids, created_at, deleted
                 FROM diaries WHERE date = ?1 AND deleted = 0",
                params![date],
                diary_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_diaries(&self, limit: i64) -> Result<Vec<Diary>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, date, content, source_activity_ids, created_at, deleted
             FROM diaries
             WHERE deleted = 0
             ORDER BY date DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], diary_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn soft_delete_diary(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("UPDATE diaries SET deleted = 1 WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // -- Event images --

    pub fn record_event_images(&self, event_id: &str, hashes: &[String]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO event_images (event_id, hash) VALUES (?1, ?2)",
            )?;
            for hash in hashes {
                stmt.execute(params![event_id, hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_event_image_hashes(&self, event_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT hash FROM event_images WHERE event_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![event_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -- Token accounting --

    pub fn record_token_usage(&self, usage: &TokenUsage) -> Result<()> {
        self.conn.execute(
            "INSERT INTO llm_token_usage
             (timestamp, model, prompt_tokens, completion_tokens, total_tokens, cost, request_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                usage.timestamp.to_rfc3339(),
                usage.model,
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                usage.cost,
                usage.request_type,
            ],
        )?;
        Ok(())
    }

    // -- Model registry --

    pub fn create_model(&self, new: &NewLlmModel) -> Result<LlmModel> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO llm_models
             (id, name, provider, api_url, model, api_key,
              input_token_price, output_token_price, currency, is_active,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)",
            params![
                id,
                new.name,
                new.provider,
                new.api_url,
                new.model,
                new.api_key,
                new.input_token_price,
                new.output_token_price,
                new.currency,
                now,
            ],
        )?;
        self.get_model(&id)?
            .ok_or_else(|| CoreError::Parse("created model not readable back".to_string()))
    }

    pub fn get_model(&self, id: &str) -> Result<Option<LlmModel>> {
        self.conn
            .query_row(
                &format!("{MODEL_SELECT} WHERE id = ?1"),
                params![id],
                model_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_models(&self) -> Result<Vec<LlmModel>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{MODEL_SELECT} ORDER BY created_at DESC"))?;
        let rows = stmt.query_map([], model_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// The one row with `is_active = 1`, if any.
    pub fn get_active_model(&self) -> Result<Option<LlmModel>> {
        self.conn
            .query_row(
                &format!("{MODEL_SELECT} WHERE is_active = 1 LIMIT 1"),
                [],
                model_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Activate one model. All rows are deactivated before the target is
    /// activated, inside a single transaction, so at most one row is active
    /// at any time.
    pub fn select_model(&self, id: &str) -> Result<LlmModel> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("UPDATE llm_models SET is_active = 0", [])?;
        let n = tx.execute(
            "UPDATE llm_models SET is_active = 1, updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(CoreError::Parse(format!("no model with id {id}")));
        }
        tx.commit()?;
        self.get_model(id)?
            .ok_or_else(|| CoreError::Parse(format!("no model with id {id}")))
    }

    pub fn update_model(&self, id: &str, update: &LlmModelUpdate) -> Result<Option<LlmModel>> {
        let mut sets = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        macro_rules! push_field {
            ($field:expr, $column:literal) => {
                if let Some(v) = &$field {
                    sets.push(concat!($column, " = ?"));
                    values.push(Box::new(v.clone()));
                }
            };
        }
        push_field!(update.name, "name");
        push_field!(update.provider, "provider");
        push_field!(update.api_url, "api_url");
        push_field!(update.model, "model");
        push_field!(update.api_key, "api_key");
        push_field!(update.input_token_price, "input_token_price");
        push_field!(update.output_token_price, "output_token_price");
        push_field!(update.currency, "currency");

        if sets.is_empty() {
            return self.get_model(id);
        }

        sets.push("updated_at = ?");
        values.push(Box::new(Utc::now().to_rfc3339()));
        values.push(Box::new(id.to_string()));

        let sql = format!(
            "UPDATE llm_models SET {} WHERE id = ?",
            sets.join(", ")
        );
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            values.iter().map(|v| v.as_ref()).collect();
        self.conn.execute(&sql, params_ref.as_slice())?;
        self.get_model(id)
    }

    pub fn delete_model(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM llm_models WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn record_model_test(&self, id: &str, ok: bool, error: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE llm_models
             SET last_test_status = ?2, last_tested_at = ?3, last_test_error = ?4, updated_at = ?3
             WHERE id = ?1",
            params![id, ok as i64, Utc::now().to_rfc3339(), error],
        )?;
        Ok(())
    }

    // -- Diagnostics --

    /// Raw-record journal for debugging. Never on the hot path.
    pub fn insert_raw_record(&self, record: &RawRecord) -> Result<()> {
        let data = serde_json::to_string(record)
            .map_err(|e| CoreError::Parse(format!("serialize raw record: {e}")))?;
        self.conn.execute(
            "INSERT INTO raw_records (timestamp, type, data) VALUES (?1, ?2, ?3)",
            params![record.timestamp.to_rfc3339(), record.kind().as_str(), data],
        )?;
        Ok(())
    }

    // -- Retention --

    /// Bulk soft-delete of rows older than `days`. Returns total rows
    /// touched.
    pub fn cleanup_old_data(&self, days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let mut total = 0usize;

        total += self.conn.execute(
            "UPDATE events SET deleted = 1 WHERE deleted = 0 AND timestamp < ?1",
            params![cutoff],
        )?;
        total += self.conn.execute(
            "UPDATE activities SET deleted = 1 WHERE deleted = 0 AND end_time < ?1",
            params![cutoff],
        )?;
        for table in [
            "knowledge",
            "combined_knowledge",
            "todos",
            "combined_todos",
            "diaries",
        ] {
            let sql =
                format!("UPDATE {table} SET deleted = 1 WHERE deleted = 0 AND created_at < ?1");
            total += self.conn.execute(&sql, params![cutoff])?;
        }
        self.conn
            .execute("DELETE FROM raw_records WHERE timestamp < ?1", params![cutoff])?;

        Ok(total as u64)
    }
}

const MODEL_SELECT: &str = "SELECT id, name, provider, api_url, model, api_key,
        input_token_price, output_token_price, currency, is_active,
        last_test_status, last_tested_at, last_test_error, created_at, updated_at
 FROM llm_models";

// -- Row mappers --

fn json_array(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_keywords(json: Option<String>) -> Vec<String> {
    json.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        keywords: parse_keywords(row.get(3)?),
        timestamp: parse_ts(4, row.get(4)?)?,
        created_at: row.get(5)?,
    })
}

fn activity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Activity> {
    Ok(Activity {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        start_time: parse_ts(3, row.get(3)?)?,
        end_time: parse_ts(4, row.get(4)?)?,
        source_event_ids: parse_keywords(row.get(5)?),
        version: row.get(6)?,
        created_at: row.get(7)?,
        deleted: row.get::<_, i64>(8)? != 0,
    })
}

fn knowledge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Knowledge> {
    Ok(Knowledge {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        keywords: parse_keywords(row.get(3)?),
        created_at: row.get(4)?,
        deleted: row.get::<_, i64>(5)? != 0,
    })
}

fn combined_knowledge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CombinedKnowledge> {
    Ok(CombinedKnowledge {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        keywords: parse_keywords(row.get(3)?),
        merged_from_ids: parse_keywords(row.get(4)?),
        created_at: row.get(5)?,
        deleted: row.get::<_, i64>(6)? != 0,
    })
}

fn todo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        keywords: parse_keywords(row.get(3)?),
        completed: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        deleted: row.get::<_, i64>(6)? != 0,
    })
}

fn combined_todo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CombinedTodo> {
    Ok(CombinedTodo {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        keywords: parse_keywords(row.get(3)?),
        merged_from_ids: parse_keywords(row.get(4)?),
        completed: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        deleted: row.get::<_, i64>(7)? != 0,
    })
}

fn diary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Diary> {
    Ok(Diary {
        id: row.get(0)?,
        date: row.get(1)?,
        content: row.get(2)?,
        source_activity_ids: parse_keywords(row.get(3)?),
        created_at: row.get(4)?,
        deleted: row.get::<_, i64>(5)? != 0,
    })
}

fn model_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LlmModel> {
    Ok(LlmModel {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: row.get(2)?,
        api_url: row.get(3)?,
        model: row.get(4)?,
        api_key: row.get(5)?,
        input_token_price: row.get(6)?,
        output_token_price: row.get(7)?,
        currency: row.get(8)?,
        is_active: row.get::<_, i64>(9)? != 0,
        last_test_status: row.get::<_, i64>(10)? != 0,
        last_tested_at: row.get(11)?,
        last_test_error: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

// -- Runtime-replaceable handle --

/// Holds the currently open database and allows the path to be swapped at
/// runtime. `acquire` hands out the current handle; in-flight holders keep
/// using the old database until their next acquire. A failed swap leaves the
/// previous handle in place.
#[derive(Debug)]
pub struct DatabaseManager {
    current: RwLock<CurrentDb>,
}

#[derive(Debug)]
struct CurrentDb {
    path: Option<PathBuf>,
    db: Arc<Mutex<Database>>,
}

impl DatabaseManager {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self {
            current: RwLock::new(CurrentDb {
                path: Some(path.to_path_buf()),
                db: Arc::new(Mutex::new(db)),
            }),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            current: RwLock::new(CurrentDb {
                path: None,
                db: Arc::new(Mutex::new(db)),
            }),
        })
    }

    pub fn acquire(&self) -> Arc<Mutex<Database>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .db
            .clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .path
            .clone()
    }

    /// Swap to a new database path: open + migrate the new file, then
    /// replace the handle. Setting the current path again is a no-op, and a
    /// failure keeps the old handle.
    pub fn set_path(&self, new_path: &Path) -> Result<()> {
        {
            let current = self.current.read().unwrap_or_else(|e| e.into_inner());
            if current.path.as_deref() == Some(new_path) {
                debug!(path = %new_path.display(), "database path unchanged");
                return Ok(());
            }
        }

        match Database::open(new_path) {
            Ok(db) => {
                let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
                current.path = Some(new_path.to_path_buf());
                current.db = Arc::new(Mutex::new(db));
                info!(path = %new_path.display(), "database path switched");
                Ok(())
            }
            Err(e) => {
                warn!(path = %new_path.display(), error = %e, "database switch failed, keeping previous handle");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_test_db() -> Database {
        Database::open_in_memory().expect("failed to open in-memory db")
    }

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap() + chrono::Duration::seconds(offset_secs)
    }

    fn make_event(n: u32) -> NewEvent {
        NewEvent {
            id: format!("event-{n}"),
            title: format!("Event {n}"),
            description: format!("Description {n}"),
            keywords: vec!["alpha".to_string(), "beta".to_string()],
            timestamp: ts(n as i64 * 60),
        }
    }

    #[test]
    fn test_migrations_run() {
        let _db = make_test_db();
    }

    #[test]
    fn test_insert_and_get_event_round_trip() {
        let db = make_test_db();
        let new = make_event(1);
        db.insert_event(&new).unwrap();

        let got = db.get_event_by_id("event-1").unwrap().unwrap();
        assert_eq!(got.id, new.id);
        assert_eq!(got.title, new.title);
        assert_eq!(got.description, new.description);
        assert_eq!(got.keywords, new.keywords);
        assert_eq!(got.timestamp, new.timestamp);
    }

    #[test]
    fn test_soft_deleted_event_hidden_from_list_readable_by_id() {
        let db = make_test_db();
        db.insert_event(&make_event(1)).unwrap();
        db.insert_event(&make_event(2)).unwrap();

        db.soft_delete_event("event-1").unwrap();

        let list = db.get_events(10, 0).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "event-2");

        // get_by_id ignores the deleted flag
        assert!(db.get_event_by_id("event-1").unwrap().is_some());
    }

    #[test]
    fn test_activity_versions_strictly_increase() {
        let db = make_test_db();

        let mut versions = Vec::new();
        for i in 0..5 {
            let v = db
                .insert_activity(&NewActivity {
                    id: format!("activity-{i}"),
                    title: format!("Activity {i}"),
                    description: "d".to_string(),
                    start_time: ts(0),
                    end_time: ts(600),
                    source_event_ids: vec![format!("event-{i}")],
                })
                .unwrap();
            versions.push(v);
        }

        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_incremental_activity_pull() {
        let db = make_test_db();
        for i in 0..10 {
            db.insert_activity(&NewActivity {
                id: format!("activity-{i}"),
                title: format!("Activity {i}"),
                description: "d".to_string(),
                start_time: ts(i * 100),
                end_time: ts(i * 100 + 50),
                source_event_ids: Vec::new(),
            })
            .unwrap();
        }

        let pull = db.get_activities_since_version(6).unwrap();
        assert_eq!(pull.max_version, 10);
        let versions: Vec<i64> = pull.activities.iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![10, 9, 8, 7]);
    }

    #[test]
    fn test_unassigned_events_excludes_referenced() {
        let db = make_test_db();
        db.insert_event(&make_event(1)).unwrap();
        db.insert_event(&make_event(2)).unwrap();
        db.insert_event(&make_event(3)).unwrap();

        db.insert_activity(&NewActivity {
            id: "activity-1".to_string(),
            title: "A".to_string(),
            description: "d".to_string(),
            start_time: ts(0),
            end_time: ts(120),
            source_event_ids: vec!["event-1".to_string(), "event-2".to_string()],
        })
        .unwrap();

        let unassigned = db.get_unassigned_events().unwrap();
        assert_eq!(unassigned.len(), 1);
        assert_eq!(unassigned[0].id, "event-3");
    }

    #[test]
    fn test_deleting_activity_releases_its_events() {
        let db = make_test_db();
        db.insert_event(&make_event(1)).unwrap();
        db.insert_activity(&NewActivity {
            id: "activity-1".to_string(),
            title: "A".to_string(),
            description: "d".to_string(),
            start_time: ts(0),
            end_time: ts(120),
            source_event_ids: vec!["event-1".to_string()],
        })
        .unwrap();

        assert!(db.get_unassigned_events().unwrap().is_empty());
        db.soft_delete_activity("activity-1").unwrap();
        assert_eq!(db.get_unassigned_events().unwrap().len(), 1);
    }

    #[test]
    fn test_unmerged_knowledge_excludes_combined_sources() {
        let db = make_test_db();
        db.insert_knowledge("k1", "K1", "d", &[], ts(0)).unwrap();
        db.insert_knowledge("k2", "K2", "d", &[], ts(1)).unwrap();
        db.insert_knowledge("k3", "K3", "d", &[], ts(2)).unwrap();

        db.insert_combined_knowledge(
            "ck1",
            "Merged",
            "d",
            &[],
            &["k1".to_string(), "k2".to_string()],
        )
        .unwrap();

        let unmerged = db.get_unmerged_knowledge().unwrap();
        assert_eq!(unmerged.len(), 1);
        assert_eq!(unmerged[0].id, "k3");
    }

    #[test]
    fn test_knowledge_list_prefers_combined() {
        let db = make_test_db();
        db.insert_knowledge("k1", "K1", "d", &[], ts(0)).unwrap();

        let (combined, plain) = db.get_knowledge_list().unwrap();
        assert!(combined.is_empty());
        assert_eq!(plain.len(), 1);

        db.insert_combined_knowledge("ck1", "Merged", "d", &[], &["k1".to_string()])
            .unwrap();
        let (combined, plain) = db.get_knowledge_list().unwrap();
        assert_eq!(combined.len(), 1);
        assert!(plain.is_empty());
    }

    #[test]
    fn test_todo_list_filters_completed() {
        let db = make_test_db();
        db.insert_todo("t1", "T1", "d", &[], false, ts(0)).unwrap();
        db.insert_todo("t2", "T2", "d", &[], true, ts(1)).unwrap();

        let (_, open) = db.get_todo_list(false).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "t1");

        let (_, all) = db.get_todo_list(true).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_diary_unique_per_date_and_regeneration() {
        let db = make_test_db();
        let first = db
            .upsert_diary("2025-03-14", "first draft", &["a1".to_string()])
            .unwrap();
        let second = db
            .upsert_diary("2025-03-14", "rewritten", &["a1".to_string(), "a2".to_string()])
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "rewritten");
        assert_eq!(db.get_diaries(10).unwrap().len(), 1);
    }

    #[test]
    fn test_single_active_model_invariant() {
        let db = make_test_db();
        let m1 = db
            .create_model(&NewLlmModel {
                name: "gpt".to_string(),
                provider: "openai".to_string(),
                api_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
                api_key: "sk-test".to_string(),
                input_token_price: 0.15,
                output_token_price: 0.6,
                currency: "USD".to_string(),
            })
            .unwrap();
        let m2 = db
            .create_model(&NewLlmModel {
                name: "claude".to_string(),
                provider: "anthropic".to_string(),
                api_url: "https://api.anthropic.com".to_string(),
                model: "claude-3-5-haiku".to_string(),
                api_key: "sk-ant-test".to_string(),
                input_token_price: 0.8,
                output_token_price: 4.0,
                currency: "USD".to_string(),
            })
            .unwrap();

        db.select_model(&m1.id).unwrap();
        db.select_model(&m2.id).unwrap();

        let active: Vec<_> = db
            .list_models()
            .unwrap()
            .into_iter()
            .filter(|m| m.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, m2.id);
    }

    #[test]
    fn test_select_unknown_model_fails() {
        let db = make_test_db();
        assert!(db.select_model("nope").is_err());
    }

    #[test]
    fn test_update_model_partial() {
        let db = make_test_db();
        let m = db
            .create_model(&NewLlmModel {
                name: "m".to_string(),
                provider: "openai".to_string(),
                api_url: "https://x".to_string(),
                model: "a".to_string(),
                api_key: "k".to_string(),
                input_token_price: 0.0,
                output_token_price: 0.0,
                currency: "USD".to_string(),
            })
            .unwrap();

        let updated = db
            .update_model(
                &m.id,
                &LlmModelUpdate {
                    model: Some("b".to_string()),
                    input_token_price: Some(1.5),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.model, "b");
        assert_eq!(updated.input_token_price, 1.5);
        assert_eq!(updated.api_url, "https://x");
    }

    #[test]
    fn test_event_images_unique() {
        let db = make_test_db();
        db.insert_event(&make_event(1)).unwrap();
        db.record_event_images(
            "event-1",
            &["aaaa".to_string(), "bbbb".to_string(), "aaaa".to_string()],
        )
        .unwrap();

        let hashes = db.get_event_image_hashes("event-1").unwrap();
        assert_eq!(hashes, vec!["aaaa".to_string(), "bbbb".to_string()]);
    }

    #[test]
    fn test_cleanup_old_data() {
        let db = make_test_db();
        // Old event (well past any retention window)
        db.insert_event(&NewEvent {
            id: "old".to_string(),
            title: "Old".to_string(),
            description: "d".to_string(),
            keywords: Vec::new(),
            timestamp: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        })
        .unwrap();
        db.insert_event(&NewEvent {
            id: "fresh".to_string(),
            title: "Fresh".to_string(),
            description: "d".to_string(),
            keywords: Vec::new(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let touched = db.cleanup_old_data(30).unwrap();
        assert!(touched >= 1);

        let remaining = db.get_events(10, 0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "fresh");
        // still readable by id
        assert!(db.get_event_by_id("old").unwrap().is_some());
    }

    #[test]
    fn test_database_manager_same_path_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.db");
        let manager = DatabaseManager::open(&path).unwrap();

        let before = Arc::as_ptr(&manager.acquire());
        manager.set_path(&path).unwrap();
        let after = Arc::as_ptr(&manager.acquire());
        assert_eq!(before, after, "setting the same path must keep one handle");
    }

    #[test]
    fn test_database_manager_swap_and_revert() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.db");
        let manager = DatabaseManager::open(&path_a).unwrap();

        let path_b = dir.path().join("b.db");
        manager.set_path(&path_b).unwrap();
        assert_eq!(manager.path(), Some(path_b.clone()));

        // A directory is not openable as a database file; handle must stay on b.
        let bad = dir.path().join("sub");
        std::fs::create_dir_all(&bad).unwrap();
        assert!(manager.set_path(&bad).is_err());
        assert_eq!(manager.path(), Some(path_b));
    }

    #[test]
    fn test_raw_record_journal() {
        use crate::record::{KeyAction, KeyType, KeyboardPayload, RawRecord, RecordPayload};
        let db = make_test_db();
        let record = RawRecord::new(
            ts(0),
            RecordPayload::Keyboard(KeyboardPayload {
                key: "a".to_string(),
                key_type: KeyType::Char,
                action: KeyAction::Press,
                modifiers: Vec::new(),
                sequence: None,
            }),
        );
        db.insert_raw_record(&record).unwrap();

        let kind: String = db
            .conn
            .query_row("SELECT type FROM raw_records LIMIT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kind, "keyboard_record");
    }
}
