use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lifetrace_core::config::AppConfig;
use lifetrace_core::record::{RawRecord, RecordKind};
use lifetrace_core::store::ImageStore;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::buffer::{EventBuffer, SlidingWindow};
use crate::capture::input::InputHook;
use crate::capture::screen::ScreenCaptureSource;
use crate::capture::screen_state::{
    screen_state_channel, ExternalScreenStateSource, ScreenSignal, ScreenStateHandle,
};
use crate::capture::{CaptureError, CaptureSource, RecordSender, SOURCE_CHANNEL_CAPACITY};

const SCREENSHOT_CHANNEL_CAPACITY: usize = 64;
const EVENT_BUFFER_CAPACITY: usize = 1000;

/// Capture supervisor: owns the capture sources, their channels, and the
/// sliding window + event buffer they feed.
///
/// Each source emits into its own bounded channel; one consumer task per
/// channel writes the window and buffer. Lock/sleep signals pause capture
/// (sources stopped, incoming records refused); unlock/wake resumes. Both
/// transitions are idempotent.
pub struct PerceptionManager {
    window: Arc<SlidingWindow>,
    buffer: Arc<EventBuffer>,
    keyboard: Arc<dyn CaptureSource>,
    mouse: Arc<dyn CaptureSource>,
    screen: Arc<dyn CaptureSource>,
    screen_state: Arc<dyn CaptureSource>,
    state_handle: ScreenStateHandle,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    state_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    state_rx: Mutex<Option<mpsc::UnboundedReceiver<ScreenSignal>>>,
    capture_interval: f64,
    window_size: u64,
}

impl PerceptionManager {
    /// Build sources and start the channel consumers. Must be called inside
    /// a tokio runtime; capture itself does not begin until `start`.
    pub fn new(config: &AppConfig, store: Arc<ImageStore>) -> Arc<Self> {
        let window = Arc::new(SlidingWindow::new(config.monitoring.window_size));
        let buffer = Arc::new(EventBuffer::new(EVENT_BUFFER_CAPACITY));

        let (keyboard_tx, keyboard_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let (mouse_tx, mouse_rx) = mpsc::channel(SOURCE_CHANNEL_CAPACITY);
        let (screen_tx, screen_rx): (RecordSender, _) = mpsc::channel(SCREENSHOT_CHANNEL_CAPACITY);

        let hook = InputHook::new(keyboard_tx, mouse_tx);
        let keyboard: Arc<dyn CaptureSource> = Arc::new(hook.keyboard_source());
        let mouse: Arc<dyn CaptureSource> = Arc::new(hook.mouse_source());
        let screen: Arc<dyn CaptureSource> = Arc::new(ScreenCaptureSource::new(
            screen_tx,
            store,
            config.enabled_monitor_indices(),
            config.monitoring.capture_interval,
        ));
        let screen_state: Arc<dyn CaptureSource> = Arc::new(ExternalScreenStateSource::new());

        let (state_handle, state_rx) = screen_state_channel();

        let running = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        let manager = Arc::new(Self {
            window,
            buffer,
            keyboard,
            mouse,
            screen,
            screen_state,
            state_handle,
            running,
            paused,
            state_task: Mutex::new(None),
            state_rx: Mutex::new(Some(state_rx)),
            capture_interval: config.monitoring.capture_interval,
            window_size: config.monitoring.window_size,
        });

        manager.spawn_consumer(keyboard_rx);
        manager.spawn_consumer(mouse_rx);
        manager.spawn_consumer(screen_rx);

        manager
    }

    fn spawn_consumer(self: &Arc<Self>, mut rx: mpsc::Receiver<RawRecord>) {
        let window = self.window.clone();
        let buffer = self.buffer.clone();
        let running = self.running.clone();
        let paused = self.paused.clone();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if !running.load(Ordering::SeqCst) || paused.load(Ordering::SeqCst) {
                    continue;
                }
                window.push(record.clone());
                buffer.push(record);
            }
        });
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), CaptureError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.paused.store(false, Ordering::SeqCst);

        for source in [&self.screen_state, &self.keyboard, &self.mouse, &self.screen] {
            if let Err(e) = source.start().await {
                error!(source = source.name(), error = %e, "capture source failed to start");
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        self.spawn_state_listener();
        info!(
            capture_interval = self.capture_interval,
            window_size = self.window_size,
            "perception started"
        );
        Ok(())
    }

    fn spawn_state_listener(self: &Arc<Self>) {
        let mut rx = match self.state_rx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(rx) => rx,
            None => return, // listener already running from a previous start
        };

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                match signal {
                    ScreenSignal::Lock => manager.pause().await,
                    ScreenSignal::Unlock => manager.resume().await,
                }
            }
        });
        *self.state_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Screen locked or system asleep: stop capture, refuse records.
    /// Safe to call repeatedly.
    pub async fn pause(&self) {
        if !self.running.load(Ordering::SeqCst) || self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("screen locked, pausing perception");
        for source in [&self.keyboard, &self.mouse, &self.screen] {
            if let Err(e) = source.stop().await {
                warn!(source = source.name(), error = %e, "pause failed");
            }
        }
    }

    /// Screen unlocked or system awake: restart capture with fresh state.
    pub async fn resume(&self) {
        if !self.running.load(Ordering::SeqCst) || !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("screen unlocked, resuming perception");
        for source in [&self.keyboard, &self.mouse, &self.screen] {
            if let Err(e) = source.start().await {
                warn!(source = source.name(), error = %e, "resume failed");
            }
        }
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.paused.store(false, Ordering::SeqCst);

        for source in [&self.keyboard, &self.mouse, &self.screen, &self.screen_state] {
            if let Err(e) = source.stop().await {
                warn!(source = source.name(), error = %e, "stop failed");
            }
        }
        info!("perception stopped");
    }

    /// Handle for platform glue and tests to push lock/unlock signals.
    pub fn screen_state_handle(&self) -> ScreenStateHandle {
        self.state_handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // -- Window / buffer access --

    pub fn records_last(&self, n: usize) -> Vec<RawRecord> {
        self.window.snapshot_last(n)
    }

    pub fn records_by_kind(&self, kind: RecordKind) -> Vec<RawRecord> {
        self.window.snapshot_by_kind(kind)
    }

    pub fn records_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<RawRecord> {
        self.window.snapshot_range(start, end)
    }

    /// The coordinator's drain primitive.
    pub fn records_in_last_seconds(&self, seconds: u64) -> Vec<RawRecord> {
        self.window.snapshot_last_seconds(seconds)
    }

    pub fn buffered_events(&self) -> Vec<RawRecord> {
        self.buffer.take_all()
    }

    pub fn clear_records(&self) {
        self.window.clear();
        self.buffer.clear();
    }

    pub fn stats(&self) -> serde_json::Value {
        json!({
            "is_running": self.is_running(),
            "is_paused": self.is_paused(),
            "capture_interval": self.capture_interval,
            "window_size": self.window_size,
            "storage": self.window.stats(),
            "buffer_size": self.buffer.len(),
            "keyboard": self.keyboard.stats(),
            "mouse": self.mouse.stats(),
            "screenshot": self.screen.stats(),
            "screen_state": self.screen_state.stats(),
        })
    }
}
