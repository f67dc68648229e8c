use async_trait::async_trait;
use lifetrace_core::error::LlmError;
use lifetrace_core::llm::{ChatCompletion, ChatMessage, ChatOptions, LlmManager};

/// Seam between the processing stages and the LLM layer. The pipeline and
/// the aggregation scheduler talk to this trait; production wires it to the
/// manager bound to the active model, tests substitute a stub.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<ChatCompletion, LlmError>;
}

#[async_trait]
impl ChatApi for LlmManager {
    async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<ChatCompletion, LlmError> {
        LlmManager::chat_completion(self, &messages, &options).await
    }
}
