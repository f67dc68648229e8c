pub mod client;
pub mod manager;
pub mod sse;

pub use client::{
    ChatCompletion, ChatMessage, ChatOptions, ChatRole, ContentPart, LlmClient, MessageContent,
    Provider, MAX_IMAGES_PER_REQUEST,
};
pub use manager::LlmManager;
