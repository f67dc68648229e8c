pub mod input;
pub mod screen;
pub mod screen_state;

use async_trait::async_trait;
use lifetrace_core::record::RawRecord;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture backend unavailable: {0}")]
    Unavailable(String),

    #[error("input hook error: {0}")]
    InputHook(String),

    #[error("screen grab error: {0}")]
    Screen(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set shared by every capture source. Implementations emit
/// `RawRecord`s through the bounded channel they were constructed with;
/// `start`/`stop` are idempotent.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<(), CaptureError>;

    async fn stop(&self) -> Result<(), CaptureError>;

    /// Counters for the status report.
    fn stats(&self) -> serde_json::Value;
}

/// Channel capacity per source. Input hooks block briefly when the consumer
/// lags; the window's age bound makes any loss harmless.
pub const SOURCE_CHANNEL_CAPACITY: usize = 512;

pub type RecordSender = mpsc::Sender<RawRecord>;
pub type RecordReceiver = mpsc::Receiver<RawRecord>;
