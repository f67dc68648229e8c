use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::DatabaseManager;
use crate::error::LlmError;
use crate::llm::client::{ChatCompletion, ChatMessage, ChatOptions, LlmClient};
use crate::schema::LlmModel;

/// Holds the client bound to the active model.
///
/// The client is built lazily from the active `llm_models` row on first use.
/// `reload_on_next_request` drops the binding without touching handed-out
/// `Arc<LlmClient>`s, so in-flight streams complete against the old client
/// while the next request picks up the new model.
pub struct LlmManager {
    db: Arc<DatabaseManager>,
    client: Mutex<Option<Arc<LlmClient>>>,
}

impl LlmManager {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self {
            db,
            client: Mutex::new(None),
        }
    }

    /// The currently bound client, building one from the active model row
    /// if needed.
    pub async fn client(&self) -> Result<Arc<LlmClient>, LlmError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let model = self.load_active_model().await?;
        let client = Arc::new(LlmClient::from_model(&model, Some(self.db.clone()))?);
        info!(model = %model.model, provider = %model.provider, "LLM client bound to active model");
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn load_active_model(&self) -> Result<LlmModel, LlmError> {
        let db = self.db.clone();
        let model = tokio::task::spawn_blocking(move || {
            let handle = db.acquire();
            let guard = handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.get_active_model()
        })
        .await
        .map_err(|e| LlmError::Network(format!("db task: {e}")))?
        .map_err(|e| LlmError::Network(format!("read active model: {e}")))?;

        model.ok_or(LlmError::NoActiveModel)
    }

    /// Drop the binding; the next request re-reads the active model row.
    /// Safe while streams are in flight.
    pub async fn reload_on_next_request(&self) {
        let mut slot = self.client.lock().await;
        *slot = None;
        debug!("LLM client marked for reload on next request");
    }

    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, LlmError> {
        let client = self.client().await?;
        client.chat_completion(messages, options).await
    }
}
