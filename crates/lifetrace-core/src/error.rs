use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("image error: {0}")]
    Image(String),

    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Errors from the LLM client. Terminal variants are the "LLM unavailable"
/// sentinel the pipeline reacts to with a fallback event.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no active model configured")]
    NoActiveModel,

    #[error("active model config incomplete: missing {0}")]
    IncompleteModel(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    BadResponse(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
