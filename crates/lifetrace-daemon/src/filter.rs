use lifetrace_core::hasher::PerceptualHasher;
use lifetrace_core::record::{
    MouseAction, MousePayload, RawRecord, RecordKind, RecordPayload, SequenceMeta,
};
use tracing::debug;

pub const DEFAULT_HASH_THRESHOLD: u32 = 5;
pub const DEFAULT_MAX_SCREENSHOTS_PER_SECOND: usize = 2;

const KEYBOARD_MERGE_MS: i64 = 100;
const CLICK_MERGE_MS: i64 = 500;
const SCROLL_MERGE_MS: i64 = 100;
const SCREENSHOT_MERGE_MS: i64 = 1000;
const SCREENSHOT_BUCKET_MS: i64 = 1000;

/// Filtering and merging over a snapshot of raw records.
///
/// Passes, in order: perceptual-hash screenshot dedup, keyboard retention
/// (all kept), important-mouse retention, per-second screenshot rate limit,
/// then adjacency merging. `last_hash` state resets at the start of every
/// pass, so runs are independent.
pub struct EventFilter {
    enable_screenshot_dedup: bool,
    hash_threshold: u32,
    max_screenshots_per_window: usize,
}

impl EventFilter {
    pub fn new(enable_screenshot_dedup: bool) -> Self {
        Self {
            enable_screenshot_dedup,
            hash_threshold: DEFAULT_HASH_THRESHOLD,
            max_screenshots_per_window: DEFAULT_MAX_SCREENSHOTS_PER_SECOND,
        }
    }

    /// Run every pass. Output is sorted by timestamp and carries merge
    /// provenance on merged records.
    pub fn filter_all(&self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        let before = records.len();
        let records = self.dedup_screenshots(records);

        let mut kept: Vec<RawRecord> = Vec::with_capacity(records.len());
        let mut screenshots: Vec<RawRecord> = Vec::new();
        for record in records {
            match record.kind() {
                RecordKind::Keyboard => kept.push(record),
                RecordKind::Mouse => {
                    if Self::is_important_mouse(&record) {
                        kept.push(record);
                    }
                }
                RecordKind::Screenshot => screenshots.push(record),
            }
        }
        kept.extend(self.rate_limit_screenshots(screenshots));

        kept.sort_by_key(|r| r.timestamp);
        let merged = merge_consecutive(kept);

        debug!(before, after = merged.len(), "filter pass complete");
        merged
    }

    /// Drop screenshots whose hash is within `hash_threshold` of the last
    /// accepted one. Non-screenshots pass through untouched.
    fn dedup_screenshots(&self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        if !self.enable_screenshot_dedup {
            return records;
        }

        let mut last_hash: Option<String> = None;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let Some(shot) = record.as_screenshot() else {
                out.push(record);
                continue;
            };

            if let Some(last) = &last_hash {
                let distance = PerceptualHasher::hamming_distance(last, &shot.content_hash);
                if distance <= self.hash_threshold {
                    debug!(distance, "duplicate screenshot dropped");
                    continue;
                }
            }
            last_hash = Some(shot.content_hash.clone());
            out.push(record);
        }
        out
    }

    fn is_important_mouse(record: &RawRecord) -> bool {
        match &record.payload {
            RecordPayload::Mouse(m) => matches!(
                m.action,
                MouseAction::Press
                    | MouseAction::Release
                    | MouseAction::Click
                    | MouseAction::Drag
                    | MouseAction::DragEnd
                    | MouseAction::Scroll
            ),
            _ => false,
        }
    }

    /// At most `max_screenshots_per_window` screenshots per 1-second bucket.
    fn rate_limit_screenshots(&self, screenshots: Vec<RawRecord>) -> Vec<RawRecord> {
        let mut out = Vec::with_capacity(screenshots.len());
        let mut bucket_start = None;
        let mut in_bucket = 0usize;

        for record in screenshots {
            let start = *bucket_start.get_or_insert(record.timestamp);
            let elapsed = (record.timestamp - start).num_milliseconds();

            if elapsed >= SCREENSHOT_BUCKET_MS {
                bucket_start = Some(record.timestamp);
                in_bucket = 0;
            } else if in_bucket >= self.max_screenshots_per_window {
                debug!("screenshot rate limit hit");
                continue;
            }

            in_bucket += 1;
            out.push(record);
        }
        out
    }
}

// -- Merging pass --

fn merge_consecutive(records: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut out = Vec::with_capacity(records.len());
    let mut group: Vec<RawRecord> = Vec::new();

    for record in records {
        if let Some(last) = group.last() {
            if can_merge(last, &record) {
                group.push(record);
                continue;
            }
            out.push(merge_group(std::mem::take(&mut group)));
        }
        group.push(record);
    }
    if !group.is_empty() {
        out.push(merge_group(group));
    }
    out
}

fn can_merge(prev: &RawRecord, curr: &RawRecord) -> bool {
    if prev.kind() != curr.kind() {
        return false;
    }
    let gap = (curr.timestamp - prev.timestamp).num_milliseconds();

    match (&prev.payload, &curr.payload) {
        (RecordPayload::Keyboard(a), RecordPayload::Keyboard(b)) => {
            gap <= KEYBOARD_MERGE_MS && a.key == b.key
        }
        (RecordPayload::Mouse(a), RecordPayload::Mouse(b)) => match (a.action, b.action) {
            (MouseAction::Scroll, MouseAction::Scroll) => gap <= SCROLL_MERGE_MS,
            (MouseAction::Press, MouseAction::Release) => gap <= CLICK_MERGE_MS,
            _ => false,
        },
        (RecordPayload::Screenshot(_), RecordPayload::Screenshot(_)) => {
            gap <= SCREENSHOT_MERGE_MS
        }
        _ => false,
    }
}

fn merge_group(mut group: Vec<RawRecord>) -> RawRecord {
    if group.len() == 1 {
        return group.pop().unwrap();
    }

    let first = group.first().unwrap().clone();
    let last = group.last().unwrap().clone();
    let sequence = SequenceMeta {
        count: group.len(),
        duration_ms: (last.timestamp - first.timestamp).num_milliseconds(),
        start_time: first.timestamp,
        end_time: last.timestamp,
    };

    let payload = match (first.payload.clone(), last.payload) {
        (RecordPayload::Keyboard(mut a), RecordPayload::Keyboard(_)) => {
            a.sequence = Some(sequence);
            RecordPayload::Keyboard(a)
        }
        (RecordPayload::Mouse(a), RecordPayload::Mouse(b)) => {
            RecordPayload::Mouse(merge_mouse(&group, a, b, &sequence))
        }
        (RecordPayload::Screenshot(mut a), RecordPayload::Screenshot(_)) => {
            // The group keeps the first record's hash; the sequence meta
            // records how many frames it stands for.
            a.sequence = Some(sequence);
            RecordPayload::Screenshot(a)
        }
        (other, _) => other,
    };

    RawRecord::new(first.timestamp, payload)
}

fn merge_mouse(
    group: &[RawRecord],
    first: MousePayload,
    last: MousePayload,
    sequence: &SequenceMeta,
) -> MousePayload {
    match (first.action, last.action) {
        (MouseAction::Scroll, MouseAction::Scroll) => {
            let mut dx = 0.0;
            let mut dy = 0.0;
            let mut count = 0usize;
            for record in group {
                if let RecordPayload::Mouse(m) = &record.payload {
                    let (x, y) = m.scroll_delta.unwrap_or((0.0, 0.0));
                    dx += x;
                    dy += y;
                    count += m.count.unwrap_or(1);
                }
            }
            MousePayload {
                action: MouseAction::Scroll,
                button: None,
                position: last.position,
                start_position: None,
                end_position: None,
                scroll_delta: Some((dx, dy)),
                duration_ms: Some(sequence.duration_ms),
                count: Some(count),
            }
        }
        (MouseAction::Press, MouseAction::Release) => MousePayload {
            action: MouseAction::Click,
            button: first.button,
            position: last.position,
            start_position: Some(first.position),
            end_position: Some(last.position),
            scroll_delta: None,
            duration_ms: Some(sequence.duration_ms),
            count: None,
        },
        _ => first,
    }
}
