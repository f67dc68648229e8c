use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- Database model types --

/// Atomic extracted unit from a batch of screenshots (+ input hint).
/// Write-once: never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledge {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub created_at: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedKnowledge {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    /// Ids of the Knowledge rows this entry supersedes.
    pub merged_from_ids: Vec<String>,
    pub created_at: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub created_at: String,
    pub completed: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedTodo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub merged_from_ids: Vec<String>,
    pub created_at: String,
    pub completed: bool,
    pub deleted: bool,
}

/// User-facing cluster of temporally adjacent events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub title: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub source_event_ids: Vec<String>,
    /// Assigned by the database on insert; unique and strictly increasing in
    /// commit order, so clients can do incremental pulls.
    pub version: i64,
    pub created_at: String,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub id: String,
    pub title: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub source_event_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diary {
    pub id: String,
    /// UTC day, `YYYY-MM-DD`. At most one non-deleted row per date.
    pub date: String,
    pub content: String,
    pub source_activity_ids: Vec<String>,
    pub created_at: String,
    pub deleted: bool,
}

// -- LLM model registry --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModel {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub api_url: String,
    pub model: String,
    pub api_key: String,
    /// Price per million prompt tokens.
    pub input_token_price: f64,
    /// Price per million completion tokens.
    pub output_token_price: f64,
    pub currency: String,
    pub is_active: bool,
    pub last_test_status: bool,
    pub last_tested_at: Option<String>,
    pub last_test_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl LlmModel {
    /// Fields required before the coordinator will start with this model.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.is_empty() {
            missing.push("api_key");
        }
        if self.api_url.is_empty() {
            missing.push("api_url");
        }
        if self.model.is_empty() {
            missing.push("model");
        }
        missing
    }

    /// Copy for status reports with credentials removed.
    pub fn redacted(&self) -> RedactedModel {
        RedactedModel {
            id: self.id.clone(),
            name: self.name.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            last_test_status: self.last_test_status,
            last_tested_at: self.last_tested_at.clone(),
            last_test_error: self.last_test_error.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactedModel {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    pub last_test_status: bool,
    pub last_tested_at: Option<String>,
    pub last_test_error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct NewLlmModel {
    pub name: String,
    pub provider: String,
    pub api_url: String,
    pub model: String,
    pub api_key: String,
    pub input_token_price: f64,
    pub output_token_price: f64,
    pub currency: String,
}

/// Partial update for an existing model row; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct LlmModelUpdate {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub input_token_price: Option<f64>,
    pub output_token_price: Option<f64>,
    pub currency: Option<String>,
}

// -- Token accounting --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    pub request_type: String,
}

// -- Incremental pull --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalActivities {
    pub activities: Vec<Activity>,
    #[serde(rename = "maxVersion")]
    pub max_version: i64,
}
