use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use lifetrace_core::record::{RawRecord, RecordKind};
use serde::Serialize;

/// Hard cap so a stalled consumer cannot grow the window unboundedly.
/// Oldest records are dropped silently; they are re-capturable cheaply.
const MAX_RECORDS: usize = 10_000;

/// Bounded time-ordered buffer of raw records.
///
/// Records older than `window_size` are expired opportunistically on every
/// push and before every read, so no read ever returns a record older than
/// the window. Reads re-sort by timestamp: sources are only loosely ordered
/// relative to each other.
pub struct SlidingWindow {
    window_size: Duration,
    records: Mutex<VecDeque<RawRecord>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowStats {
    pub total_records: usize,
    pub window_size_seconds: i64,
    pub keyboard_records: usize,
    pub mouse_records: usize,
    pub screenshot_records: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(window_size_secs: u64) -> Self {
        Self {
            window_size: Duration::seconds(window_size_secs as i64),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: RawRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push_back(record);
        Self::expire(&mut records, self.window_size);
        while records.len() > MAX_RECORDS {
            records.pop_front();
        }
    }

    fn expire(records: &mut VecDeque<RawRecord>, window: Duration) {
        let cutoff = Utc::now() - window;
        // Insertion is only approximately time-ordered, so scan rather than
        // pop from the front alone.
        records.retain(|r| r.timestamp >= cutoff);
    }

    fn snapshot_filtered<F>(&self, keep: F) -> Vec<RawRecord>
    where
        F: Fn(&RawRecord) -> bool,
    {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Self::expire(&mut records, self.window_size);
        let mut out: Vec<RawRecord> = records.iter().filter(|r| keep(r)).cloned().collect();
        out.sort_by_key(|r| r.timestamp);
        out
    }

    /// The latest `n` records in timestamp order.
    pub fn snapshot_last(&self, n: usize) -> Vec<RawRecord> {
        let all = self.snapshot_filtered(|_| true);
        let skip = all.len().saturating_sub(n);
        all.into_iter().skip(skip).collect()
    }

    pub fn snapshot_by_kind(&self, kind: RecordKind) -> Vec<RawRecord> {
        self.snapshot_filtered(|r| r.kind() == kind)
    }

    pub fn snapshot_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<RawRecord> {
        self.snapshot_filtered(|r| r.timestamp >= start && r.timestamp <= end)
    }

    /// The coordinator's drain primitive: everything from the last `n`
    /// seconds.
    pub fn snapshot_last_seconds(&self, n: u64) -> Vec<RawRecord> {
        let start = Utc::now() - Duration::seconds(n as i64);
        self.snapshot_filtered(|r| r.timestamp >= start)
    }

    pub fn clear(&self) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.clear();
    }

    pub fn stats(&self) -> WindowStats {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Self::expire(&mut records, self.window_size);

        let mut keyboard = 0;
        let mut mouse = 0;
        let mut screenshot = 0;
        for record in records.iter() {
            match record.kind() {
                RecordKind::Keyboard => keyboard += 1,
                RecordKind::Mouse => mouse += 1,
                RecordKind::Screenshot => screenshot += 1,
            }
        }

        let oldest = records.iter().map(|r| r.timestamp).min();
        let newest = records.iter().map(|r| r.timestamp).max();

        WindowStats {
            total_records: records.len(),
            window_size_seconds: self.window_size.num_seconds(),
            keyboard_records: keyboard,
            mouse_records: mouse,
            screenshot_records: screenshot,
            oldest,
            newest,
        }
    }
}

/// Capacity-bounded handoff buffer, drained destructively by `take_all`.
pub struct EventBuffer {
    max_size: usize,
    buffer: Mutex<VecDeque<RawRecord>>,
}

impl EventBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: RawRecord) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_back(record);
        while buffer.len() > self.max_size {
            buffer.pop_front();
        }
    }

    pub fn take_all(&self) -> Vec<RawRecord> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
