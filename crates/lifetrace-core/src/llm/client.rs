use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::db::DatabaseManager;
use crate::error::LlmError;
use crate::llm::sse::{SseFrame, SseParser};
use crate::schema::{LlmModel, TokenUsage};

/// Hard cap on image parts per request; extras are truncated with a log.
pub const MAX_IMAGES_PER_REQUEST: usize = 20;

const DEFAULT_MAX_TOKENS: u32 = 2000;
const DEFAULT_TEMPERATURE: f32 = 0.7;
const NON_RETRY_STATUS: [u16; 5] = [400, 401, 403, 404, 422];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
}

impl Provider {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Provider::Anthropic,
            _ => Provider::OpenAi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ContentPart {
    Text { text: String },
    /// Base64 JPEG, sent as a data URI (OpenAI) or base64 source block
    /// (Anthropic).
    ImageJpeg { base64_data: String },
}

#[derive(Debug, Clone)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Recorded in the usage row to distinguish call sites.
    pub request_type: String,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            request_type: "chat".to_string(),
        }
    }
}

impl ChatOptions {
    pub fn for_request(request_type: &str) -> Self {
        Self {
            request_type: request_type.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// Single-endpoint chat client bound to one model row.
///
/// Transient failures (network, timeout, retryable 5xx) are retried with a
/// linear backoff; terminal failures surface as `LlmError`, which callers
/// treat as "LLM unavailable". Every successful call writes a usage row;
/// accounting failures never propagate.
#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    provider: Provider,
    api_url: String,
    api_key: String,
    model: String,
    input_token_price: f64,
    output_token_price: f64,
    max_retries: u32,
    retry_backoff: f64,
    usage_db: Option<Arc<DatabaseManager>>,
}

impl LlmClient {
    pub fn from_model(
        model: &LlmModel,
        usage_db: Option<Arc<DatabaseManager>>,
    ) -> Result<Self, LlmError> {
        let missing = model.missing_required_fields();
        if !missing.is_empty() {
            return Err(LlmError::IncompleteModel(missing.join(", ")));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;
        let stream_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self {
            http,
            stream_http,
            provider: Provider::parse(&model.provider),
            api_url: model.api_url.trim_end_matches('/').to_string(),
            api_key: model.api_key.clone(),
            model: model.model.clone(),
            input_token_price: model.input_token_price,
            output_token_price: model.output_token_price,
            max_retries: 2,
            retry_backoff: 1.5,
            usage_db,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    fn endpoint_url(&self) -> String {
        match self.provider {
            Provider::OpenAi => format!("{}/chat/completions", self.api_url),
            Provider::Anthropic => format!("{}/v1/messages", self.api_url),
        }
    }

    fn request(&self, client: &reqwest::Client, body: &Value) -> reqwest::RequestBuilder {
        let builder = client.post(self.endpoint_url()).json(body);
        match self.provider {
            Provider::OpenAi => builder.bearer_auth(&self.api_key),
            Provider::Anthropic => builder
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01"),
        }
    }

    /// Non-streaming chat completion with retry.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion, LlmError> {
        let body = self.build_body(messages, options, false);
        let mut last_error = LlmError::Network("no attempt made".to_string());

        for attempt in 1..=self.max_retries + 1 {
            match self.send_once(&body).await {
                Ok(completion) => {
                    self.record_usage(&completion, &options.request_type);
                    return Ok(completion);
                }
                Err(e) => {
                    let final_attempt = attempt > self.max_retries || !is_retryable(&e);
                    if final_attempt {
                        warn!(attempt, error = %e, model = %self.model, "LLM request failed");
                        return Err(e);
                    }
                    warn!(attempt, error = %e, model = %self.model, "LLM request failed, retrying");
                    last_error = e;
                    tokio::time::sleep(Duration::from_secs_f64(
                        self.retry_backoff * attempt as f64,
                    ))
                    .await;
                }
            }
        }
        Err(last_error)
    }

    async fn send_once(&self, body: &Value) -> Result<ChatCompletion, LlmError> {
        let response = self
            .request(&self.http, body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| LlmError::BadResponse(e.to_string()))?;
        self.parse_completion(&value)
    }

    fn parse_completion(&self, value: &Value) -> Result<ChatCompletion, LlmError> {
        match self.provider {
            Provider::OpenAi => {
                let content = value["choices"][0]["message"]["content"]
                    .as_str()
                    .ok_or_else(|| {
                        LlmError::BadResponse(format!(
                            "missing choices[0].message.content: {}",
                            truncate(value)
                        ))
                    })?
                    .to_string();
                let usage = &value["usage"];
                let prompt = usage["prompt_tokens"].as_i64().unwrap_or(0);
                let completion = usage["completion_tokens"].as_i64().unwrap_or(0);
                let total = usage["total_tokens"].as_i64().unwrap_or(prompt + completion);
                Ok(ChatCompletion {
                    content,
                    model: value["model"].as_str().unwrap_or(&self.model).to_string(),
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: total,
                })
            }
            Provider::Anthropic => {
                let content = value["content"]
                    .as_array()
                    .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
                    .and_then(|block| block["text"].as_str())
                    .ok_or_else(|| {
                        LlmError::BadResponse(format!("missing text block: {}", truncate(value)))
                    })?
                    .to_string();
                let usage = &value["usage"];
                let prompt = usage["input_tokens"].as_i64().unwrap_or(0);
                let completion = usage["output_tokens"].as_i64().unwrap_or(0);
                Ok(ChatCompletion {
                    content,
                    model: value["model"].as_str().unwrap_or(&self.model).to_string(),
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                })
            }
        }
    }

    /// Streaming chat completion: yields incremental content deltas.
    /// Network and HTTP errors surface as a terminal `Err` item rather than
    /// a mid-stream panic.
    pub fn chat_completion_stream(
        self: &Arc<Self>,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> impl futures::Stream<Item = Result<String, LlmError>> {
        let client = Arc::clone(self);
        async_stream::stream! {
            let body = client.build_body(&messages, &options, true);
            let response = match client
                .request(&client.stream_http, &body)
                .send()
                .await
                .map_err(map_reqwest_error)
            {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                yield Err(LlmError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(500).collect(),
                });
                return;
            }

            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(LlmError::Network(e.to_string()));
                        return;
                    }
                };
                for frame in parser.push(&bytes) {
                    match frame {
                        SseFrame::Done => return,
                        SseFrame::Data(payload) => {
                            match serde_json::from_str::<Value>(&payload) {
                                Ok(value) => {
                                    if let Some(delta) = extract_stream_delta(&value) {
                                        if !delta.is_empty() {
                                            yield Ok(delta);
                                        }
                                    }
                                    if stream_finished(&value) {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    debug!(error = %e, payload = %payload.chars().take(100).collect::<String>(),
                                           "unparseable stream frame, skipping");
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Connectivity probe used by the model-test endpoint; 15 s total budget.
    pub async fn probe(&self) -> Result<(), LlmError> {
        let messages = [ChatMessage::user("ping")];
        let options = ChatOptions {
            max_tokens: 8,
            temperature: 0.0,
            request_type: "model_test".to_string(),
        };
        let body = self.build_body(&messages, &options, false);

        let fut = self.send_once(&body);
        match tokio::time::timeout(Duration::from_secs(15), fut).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LlmError::Timeout),
        }
    }

    fn build_body(&self, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> Value {
        let messages = cap_images(messages);
        match self.provider {
            Provider::OpenAi => {
                let rendered: Vec<Value> = messages.iter().map(openai_message).collect();
                json!({
                    "model": self.model,
                    "messages": rendered,
                    "max_tokens": options.max_tokens,
                    "temperature": options.temperature,
                    "stream": stream,
                })
            }
            Provider::Anthropic => {
                // Anthropic takes the system prompt out of the message list.
                let system: Vec<&ChatMessage> = messages
                    .iter()
                    .filter(|m| m.role == ChatRole::System)
                    .collect();
                let rendered: Vec<Value> = messages
                    .iter()
                    .filter(|m| m.role != ChatRole::System)
                    .map(anthropic_message)
                    .collect();
                let mut body = json!({
                    "model": self.model,
                    "messages": rendered,
                    "max_tokens": options.max_tokens,
                    "temperature": options.temperature,
                    "stream": stream,
                });
                if let Some(first) = system.first() {
                    if let MessageContent::Text(text) = &first.content {
                        body["system"] = json!(text);
                    }
                }
                body
            }
        }
    }

    fn record_usage(&self, completion: &ChatCompletion, request_type: &str) {
        let Some(db) = self.usage_db.clone() else {
            return;
        };
        let usage = TokenUsage {
            timestamp: Utc::now(),
            model: completion.model.clone(),
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            total_tokens: completion.total_tokens,
            cost: compute_cost(
                completion.prompt_tokens,
                completion.completion_tokens,
                self.input_token_price,
                self.output_token_price,
            ),
            request_type: request_type.to_string(),
        };
        tokio::task::spawn_blocking(move || {
            let handle = db.acquire();
            let guard = handle.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = guard.record_token_usage(&usage) {
                debug!(error = %e, "token usage accounting failed");
            }
        });
    }
}

/// Prices are per million tokens; result rounded to 6 decimal places.
pub fn compute_cost(
    prompt_tokens: i64,
    completion_tokens: i64,
    input_price: f64,
    output_price: f64,
) -> f64 {
    let cost = (prompt_tokens as f64 / 1_000_000.0) * input_price
        + (completion_tokens as f64 / 1_000_000.0) * output_price;
    (cost * 1e6).round() / 1e6
}

/// Enforce `MAX_IMAGES_PER_REQUEST` across all messages, keeping the
/// earliest images.
fn cap_images(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let total: usize = messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::ImageJpeg { .. }))
                .count(),
            MessageContent::Text(_) => 0,
        })
        .sum();

    if total <= MAX_IMAGES_PER_REQUEST {
        return messages.to_vec();
    }
    warn!(
        total,
        cap = MAX_IMAGES_PER_REQUEST,
        "too many image parts, truncating"
    );

    let mut budget = MAX_IMAGES_PER_REQUEST;
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Parts(parts) => {
                let kept: Vec<ContentPart> = parts
                    .iter()
                    .filter(|p| match p {
                        ContentPart::ImageJpeg { .. } => {
                            if budget > 0 {
                                budget -= 1;
                                true
                            } else {
                                false
                            }
                        }
                        ContentPart::Text { .. } => true,
                    })
                    .cloned()
                    .collect();
                ChatMessage {
                    role: m.role,
                    content: MessageContent::Parts(kept),
                }
            }
            MessageContent::Text(_) => m.clone(),
        })
        .collect()
}

fn openai_message(message: &ChatMessage) -> Value {
    let content = match &message.content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => {
            let rendered: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageJpeg { base64_data } => json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:image/jpeg;base64,{base64_data}")}
                    }),
                })
                .collect();
            json!(rendered)
        }
    };
    json!({"role": message.role.as_str(), "content": content})
}

fn anthropic_message(message: &ChatMessage) -> Value {
    let content = match &message.content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => {
            let rendered: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageJpeg { base64_data } => json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/jpeg",
                            "data": base64_data,
                        }
                    }),
                })
                .collect();
            json!(rendered)
        }
    };
    json!({"role": message.role.as_str(), "content": content})
}

fn extract_stream_delta(value: &Value) -> Option<String> {
    // OpenAI delta shape
    if let Some(content) = value["choices"][0]["delta"]["content"].as_str() {
        return Some(content.to_string());
    }
    // Anthropic content_block_delta shape
    if let Some(text) = value["delta"]["text"].as_str() {
        return Some(text.to_string());
    }
    None
}

fn stream_finished(value: &Value) -> bool {
    if value["choices"][0]["finish_reason"].is_string() {
        return true;
    }
    value["type"] == "message_stop"
}

fn is_retryable(error: &LlmError) -> bool {
    match error {
        LlmError::Timeout | LlmError::Network(_) => true,
        LlmError::Status { status, .. } => *status >= 500 && !NON_RETRY_STATUS.contains(status),
        _ => false,
    }
}

fn map_reqwest_error(error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Network(error.to_string())
    }
}

fn truncate(value: &Value) -> String {
    value.to_string().chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model() -> LlmModel {
        LlmModel {
            id: "m1".to_string(),
            name: "test".to_string(),
            provider: "openai".to_string(),
            api_url: "https://api.example.com/v1".to_string(),
            model: "test-model".to_string(),
            api_key: "sk-test".to_string(),
            input_token_price: 1.0,
            output_token_price: 2.0,
            currency: "USD".to_string(),
            is_active: true,
            last_test_status: false,
            last_tested_at: None,
            last_test_error: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn incomplete_model_rejected() {
        let mut model = test_model();
        model.api_key = String::new();
        match LlmClient::from_model(&model, None) {
            Err(LlmError::IncompleteModel(fields)) => assert!(fields.contains("api_key")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn endpoint_per_provider() {
        let client = LlmClient::from_model(&test_model(), None).unwrap();
        assert_eq!(
            client.endpoint_url(),
            "https://api.example.com/v1/chat/completions"
        );

        let mut model = test_model();
        model.provider = "anthropic".to_string();
        model.api_url = "https://api.anthropic.com/".to_string();
        let client = LlmClient::from_model(&model, None).unwrap();
        assert_eq!(client.endpoint_url(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn openai_body_shape_with_images() {
        let client = LlmClient::from_model(&test_model(), None).unwrap();
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user_parts(vec![
                ContentPart::Text {
                    text: "look".to_string(),
                },
                ContentPart::ImageJpeg {
                    base64_data: "QUJD".to_string(),
                },
            ]),
        ];
        let body = client.build_body(&messages, &ChatOptions::default(), false);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["stream"], false);
        let parts = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn anthropic_body_lifts_system_prompt() {
        let mut model = test_model();
        model.provider = "anthropic".to_string();
        let client = LlmClient::from_model(&model, None).unwrap();
        let messages = vec![
            ChatMessage::system("you are terse"),
            ChatMessage::user_parts(vec![ContentPart::ImageJpeg {
                base64_data: "QUJD".to_string(),
            }]),
        ];
        let body = client.build_body(&messages, &ChatOptions::default(), false);

        assert_eq!(body["system"], "you are terse");
        let rendered = body["messages"].as_array().unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0]["content"][0]["type"], "image");
        assert_eq!(rendered[0]["content"][0]["source"]["data"], "QUJD");
    }

    #[test]
    fn image_cap_truncates_later_images() {
        let parts: Vec<ContentPart> = (0..25)
            .map(|i| ContentPart::ImageJpeg {
                base64_data: format!("img{i}"),
            })
            .collect();
        let capped = cap_images(&[ChatMessage::user_parts(parts)]);
        match &capped[0].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), MAX_IMAGES_PER_REQUEST);
                match &parts[0] {
                    ContentPart::ImageJpeg { base64_data } => assert_eq!(base64_data, "img0"),
                    _ => panic!("expected image"),
                }
            }
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn parse_openai_completion() {
        let client = LlmClient::from_model(&test_model(), None).unwrap();
        let value = json!({
            "model": "test-model-0314",
            "choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let completion = client.parse_completion(&value).unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.prompt_tokens, 10);
        assert_eq!(completion.total_tokens, 15);
        assert_eq!(completion.model, "test-model-0314");
    }

    #[test]
    fn parse_anthropic_completion() {
        let mut model = test_model();
        model.provider = "anthropic".to_string();
        let client = LlmClient::from_model(&model, None).unwrap();
        let value = json!({
            "model": "claude-test",
            "content": [{"type": "text", "text": "hi"}],
            "usage": {"input_tokens": 7, "output_tokens": 3}
        });
        let completion = client.parse_completion(&value).unwrap();
        assert_eq!(completion.content, "hi");
        assert_eq!(completion.total_tokens, 10);
    }

    #[test]
    fn malformed_completion_is_bad_response() {
        let client = LlmClient::from_model(&test_model(), None).unwrap();
        let value = json!({"unexpected": true});
        assert!(matches!(
            client.parse_completion(&value),
            Err(LlmError::BadResponse(_))
        ));
    }

    #[test]
    fn retry_classification() {
        assert!(is_retryable(&LlmError::Timeout));
        assert!(is_retryable(&LlmError::Network("reset".to_string())));
        assert!(is_retryable(&LlmError::Status {
            status: 503,
            body: String::new()
        }));
        assert!(!is_retryable(&LlmError::Status {
            status: 401,
            body: String::new()
        }));
        assert!(!is_retryable(&LlmError::Status {
            status: 422,
            body: String::new()
        }));
        assert!(!is_retryable(&LlmError::BadResponse("x".to_string())));
    }

    #[test]
    fn cost_uses_per_million_pricing() {
        let cost = compute_cost(1_000_000, 500_000, 1.0, 2.0);
        assert!((cost - 2.0).abs() < 1e-9);
        assert_eq!(compute_cost(0, 0, 1.0, 2.0), 0.0);
    }

    #[test]
    fn stream_delta_extraction() {
        let openai = json!({"choices": [{"delta": {"content": "ab"}}]});
        assert_eq!(extract_stream_delta(&openai), Some("ab".to_string()));

        let anthropic = json!({"type": "content_block_delta", "delta": {"text": "cd"}});
        assert_eq!(extract_stream_delta(&anthropic), Some("cd".to_string()));

        let finish = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        assert!(stream_finished(&finish));
        assert!(stream_finished(&json!({"type": "message_stop"})));
    }
}
