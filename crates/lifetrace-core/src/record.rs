use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured input or screen sample, pre-aggregation.
///
/// Timestamps are monotonic within a capture source but only loosely ordered
/// across sources; the sliding window re-sorts on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: RecordPayload,
}

impl RawRecord {
    pub fn new(timestamp: DateTime<Utc>, payload: RecordPayload) -> Self {
        Self { timestamp, payload }
    }

    pub fn kind(&self) -> RecordKind {
        match self.payload {
            RecordPayload::Keyboard(_) => RecordKind::Keyboard,
            RecordPayload::Mouse(_) => RecordKind::Mouse,
            RecordPayload::Screenshot(_) => RecordKind::Screenshot,
        }
    }

    pub fn as_screenshot(&self) -> Option<&ScreenshotPayload> {
        match &self.payload {
            RecordPayload::Screenshot(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Keyboard,
    Mouse,
    Screenshot,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Keyboard => "keyboard_record",
            RecordKind::Mouse => "mouse_record",
            RecordKind::Screenshot => "screenshot_record",
        }
    }

    /// Parse a kind string, tolerating the legacy `*_event` spellings found
    /// in older stored rows.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keyboard_record" | "keyboard_event" => Some(RecordKind::Keyboard),
            "mouse_record" | "mouse_event" => Some(RecordKind::Mouse),
            "screenshot_record" | "screenshot_event" => Some(RecordKind::Screenshot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RecordPayload {
    #[serde(rename = "keyboard_record", alias = "keyboard_event")]
    Keyboard(KeyboardPayload),
    #[serde(rename = "mouse_record", alias = "mouse_event")]
    Mouse(MousePayload),
    #[serde(rename = "screenshot_record", alias = "screenshot_event")]
    Screenshot(ScreenshotPayload),
}

// -- Keyboard --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyboardPayload {
    pub key: String,
    pub key_type: KeyType,
    pub action: KeyAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<Modifier>,
    /// Present on records produced by merging a same-key burst.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceMeta>,
}

impl KeyboardPayload {
    /// Events with modifiers held, special keys, or explicit modifier
    /// presses are flagged "special"; downstream consumers may use this.
    pub fn is_special(&self) -> bool {
        !self.modifiers.is_empty()
            || self.key_type == KeyType::Special
            || self.key_type == KeyType::Modifier
            || self.action == KeyAction::Modifier
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Char,
    Special,
    Modifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Press,
    Release,
    Modifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Cmd,
    Ctrl,
    Alt,
    Shift,
    Super,
}

// -- Mouse --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MousePayload {
    pub action: MouseAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<MouseButton>,
    pub position: (f64, f64),
    /// Set on merged Click records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_position: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_position: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_delta: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Number of source records folded into a merged scroll chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseAction {
    Press,
    Release,
    Click,
    Drag,
    DragEnd,
    Scroll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Other,
}

// -- Screenshot --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotPayload {
    pub monitor_index: usize,
    pub width: u32,
    pub height: u32,
    /// Always "JPEG"; bytes live in the image store, addressed by hash.
    pub format: String,
    /// 16-hex perceptual hash, the image store key.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceMeta>,
}

/// Provenance attached to a record produced by merging adjacent records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceMeta {
    pub count: usize,
    pub duration_ms: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn keyboard_round_trip() {
        let record = RawRecord::new(
            ts(),
            RecordPayload::Keyboard(KeyboardPayload {
                key: "a".to_string(),
                key_type: KeyType::Char,
                action: KeyAction::Press,
                modifiers: vec![Modifier::Ctrl],
                sequence: None,
            }),
        );

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"type\":\"keyboard_record\""));

        let back: RawRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), RecordKind::Keyboard);
        match back.payload {
            RecordPayload::Keyboard(k) => {
                assert_eq!(k.key, "a");
                assert!(k.is_special());
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn legacy_kind_string_accepted() {
        let json = r#"{
            "timestamp": "2025-03-14T09:26:53Z",
            "type": "keyboard_event",
            "key": "enter",
            "key_type": "special",
            "action": "press"
        }"#;
        let record: RawRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind(), RecordKind::Keyboard);
    }

    #[test]
    fn kind_parse_both_spellings() {
        assert_eq!(
            RecordKind::parse("mouse_record"),
            Some(RecordKind::Mouse)
        );
        assert_eq!(RecordKind::parse("mouse_event"), Some(RecordKind::Mouse));
        assert_eq!(RecordKind::parse("bogus"), None);
    }

    #[test]
    fn plain_keypress_is_not_special() {
        let k = KeyboardPayload {
            key: "x".to_string(),
            key_type: KeyType::Char,
            action: KeyAction::Press,
            modifiers: Vec::new(),
            sequence: None,
        };
        assert!(!k.is_special());
    }

    #[test]
    fn screenshot_round_trip_preserves_hash() {
        let record = RawRecord::new(
            ts(),
            RecordPayload::Screenshot(ScreenshotPayload {
                monitor_index: 0,
                width: 1920,
                height: 1080,
                format: "JPEG".to_string(),
                content_hash: "a1b2c3d4e5f60718".to_string(),
                sequence: None,
            }),
        );

        let json = serde_json::to_string(&record).unwrap();
        let back: RawRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.as_screenshot().unwrap().content_hash,
            "a1b2c3d4e5f60718"
        );
    }
}
