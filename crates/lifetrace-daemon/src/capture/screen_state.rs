use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use super::{CaptureError, CaptureSource};

/// Lock / sleep collapse to `Lock`; unlock / wake to `Unlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenSignal {
    Lock,
    Unlock,
}

/// Sender half handed to platform glue (session D-Bus listener, Quartz
/// notification observer, Win32 session hook) and to tests.
#[derive(Clone)]
pub struct ScreenStateHandle {
    tx: mpsc::UnboundedSender<ScreenSignal>,
}

impl ScreenStateHandle {
    pub fn signal(&self, signal: ScreenSignal) {
        let _ = self.tx.send(signal);
    }
}

pub fn screen_state_channel() -> (ScreenStateHandle, mpsc::UnboundedReceiver<ScreenSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ScreenStateHandle { tx }, rx)
}

/// Screen-state source for platforms without a wired-up session listener.
/// The handle still works (external shells push lock/unlock through it);
/// this source just has no OS loop of its own.
pub struct ExternalScreenStateSource {
    running: AtomicBool,
}

impl ExternalScreenStateSource {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }
}

impl Default for ExternalScreenStateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureSource for ExternalScreenStateSource {
    fn name(&self) -> &'static str {
        "screen_state"
    }

    async fn start(&self) -> Result<(), CaptureError> {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("screen-state monitor active (externally driven)");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "is_running": self.running.load(Ordering::SeqCst),
            "driver": "external",
        })
    }
}
