use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lifetrace_core::record::{
    KeyAction, KeyType, KeyboardPayload, Modifier, MouseAction, MouseButton, MousePayload,
    RawRecord, RecordPayload,
};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{CaptureError, CaptureSource, RecordSender};

/// Movement past this many pixels with a button held starts a drag.
const DRAG_START_PX: f64 = 5.0;
/// Minimum spacing between emitted Drag records.
const DRAG_EMIT_MS: i64 = 100;
pub const SCROLL_MERGE_MS: i64 = 100;
pub const CLICK_MERGE_MS: i64 = 500;

/// Shared state between the OS hook thread and the two input sources.
///
/// The OS-level hook cannot be torn down once installed, so `stop` gates
/// event forwarding instead of killing the thread; a paused source emits
/// nothing.
struct HookShared {
    keyboard_tx: RecordSender,
    mouse_tx: RecordSender,
    keyboard_enabled: AtomicBool,
    mouse_enabled: AtomicBool,
    keyboard_count: AtomicU64,
    mouse_count: AtomicU64,
    hook_installed: AtomicBool,
    hook_failed: AtomicBool,
}

pub struct InputHook {
    shared: Arc<HookShared>,
}

impl InputHook {
    pub fn new(keyboard_tx: RecordSender, mouse_tx: RecordSender) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(HookShared {
                keyboard_tx,
                mouse_tx,
                keyboard_enabled: AtomicBool::new(false),
                mouse_enabled: AtomicBool::new(false),
                keyboard_count: AtomicU64::new(0),
                mouse_count: AtomicU64::new(0),
                hook_installed: AtomicBool::new(false),
                hook_failed: AtomicBool::new(false),
            }),
        })
    }

    /// Install the global hook thread on first use. The thread runs the
    /// native event loop for the life of the process; a hook failure (e.g.
    /// missing OS permission) is logged once and leaves the sources running
    /// in a degraded, silent state.
    fn ensure_installed(&self) {
        if self.shared.hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        std::thread::Builder::new()
            .name("lifetrace-input-hook".to_string())
            .spawn(move || {
                let mut state = HookState::default();
                let cb_shared = shared.clone();
                info!("installing global input hook");
                if let Err(e) = rdev::listen(move |event| {
                    state.handle(&cb_shared, event);
                }) {
                    warn!(error = ?e, "global input hook unavailable, input capture degraded");
                    shared.hook_failed.store(true, Ordering::SeqCst);
                }
            })
            .ok();
    }

    pub fn keyboard_source(self: &Arc<Self>) -> KeyboardSource {
        KeyboardSource { hook: self.clone() }
    }

    pub fn mouse_source(self: &Arc<Self>) -> MouseSource {
        MouseSource { hook: self.clone() }
    }
}

pub struct KeyboardSource {
    hook: Arc<InputHook>,
}

#[async_trait]
impl CaptureSource for KeyboardSource {
    fn name(&self) -> &'static str {
        "keyboard"
    }

    async fn start(&self) -> Result<(), CaptureError> {
        self.hook.ensure_installed();
        self.hook
            .shared
            .keyboard_enabled
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CaptureError> {
        self.hook
            .shared
            .keyboard_enabled
            .store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "is_running": self.hook.shared.keyboard_enabled.load(Ordering::SeqCst),
            "events_captured": self.hook.shared.keyboard_count.load(Ordering::Relaxed),
            "hook_failed": self.hook.shared.hook_failed.load(Ordering::SeqCst),
        })
    }
}

pub struct MouseSource {
    hook: Arc<InputHook>,
}

#[async_trait]
impl CaptureSource for MouseSource {
    fn name(&self) -> &'static str {
        "mouse"
    }

    async fn start(&self) -> Result<(), CaptureError> {
        self.hook.ensure_installed();
        self.hook.shared.mouse_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), CaptureError> {
        self.hook
            .shared
            .mouse_enabled
            .store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "is_running": self.hook.shared.mouse_enabled.load(Ordering::SeqCst),
            "events_captured": self.hook.shared.mouse_count.load(Ordering::Relaxed),
            "hook_failed": self.hook.shared.hook_failed.load(Ordering::SeqCst),
        })
    }
}

// -- Hook thread state machine --

#[derive(Default)]
struct HookState {
    held_modifiers: Vec<Modifier>,
    position: (f64, f64),
    pressed: Option<PressedButton>,
    dragging: bool,
    last_drag_emit: Option<DateTime<Utc>>,
    coalescer: MouseCoalescer,
}

struct PressedButton {
    button: MouseButton,
    position: (f64, f64),
}

impl HookState {
    fn handle(&mut self, shared: &HookShared, event: rdev::Event) {
        let now = Utc::now();
        match event.event_type {
            rdev::EventType::KeyPress(key) => self.on_key(shared, key, true, now),
            rdev::EventType::KeyRelease(key) => self.on_key(shared, key, false, now),
            rdev::EventType::MouseMove { x, y } => self.on_move(shared, (x, y), now),
            rdev::EventType::ButtonPress(button) => {
                let button = map_button(button);
                self.pressed = Some(PressedButton {
                    button,
                    position: self.position,
                });
                self.dragging = false;
                let payload = MousePayload {
                    action: MouseAction::Press,
                    button: Some(button),
                    position: self.position,
                    start_position: None,
                    end_position: None,
                    scroll_delta: None,
                    duration_ms: None,
                    count: None,
                };
                let out = self.coalescer.push(now, payload);
                self.emit_mouse(shared, out);
            }
            rdev::EventType::ButtonRelease(button) => {
                let button = map_button(button);
                let was_dragging = self.dragging;
                self.pressed = None;
                self.dragging = false;

                let action = if was_dragging {
                    MouseAction::DragEnd
                } else {
                    MouseAction::Release
                };
                let payload = MousePayload {
                    action,
                    button: Some(button),
                    position: self.position,
                    start_position: None,
                    end_position: None,
                    scroll_delta: None,
                    duration_ms: None,
                    count: None,
                };
                let out = self.coalescer.push(now, payload);
                self.emit_mouse(shared, out);
            }
            rdev::EventType::Wheel { delta_x, delta_y } => {
                let payload = MousePayload {
                    action: MouseAction::Scroll,
                    button: None,
                    position: self.position,
                    start_position: None,
                    end_position: None,
                    scroll_delta: Some((delta_x as f64, delta_y as f64)),
                    duration_ms: None,
                    count: None,
                };
                let out = self.coalescer.push(now, payload);
                self.emit_mouse(shared, out);
            }
        }
    }

    fn on_key(&mut self, shared: &HookShared, key: rdev::Key, press: bool, now: DateTime<Utc>) {
        let (name, key_type) = map_key(key);

        if key_type == KeyType::Modifier {
            if let Some(modifier) = modifier_for(&name) {
                if press {
                    if !self.held_modifiers.contains(&modifier) {
                        self.held_modifiers.push(modifier);
                    }
                } else {
                    self.held_modifiers.retain(|m| *m != modifier);
                }
            }
        }

        if !shared.keyboard_enabled.load(Ordering::SeqCst) {
            return;
        }

        let action = if key_type == KeyType::Modifier {
            KeyAction::Modifier
        } else if press {
            KeyAction::Press
        } else {
            KeyAction::Release
        };

        // Modifier state excludes the key itself
        let modifiers: Vec<Modifier> = self
            .held_modifiers
            .iter()
            .copied()
            .filter(|m| key_type != KeyType::Modifier || modifier_for(&name) != Some(*m))
            .collect();

        let record = RawRecord::new(
            now,
            RecordPayload::Keyboard(KeyboardPayload {
                key: name,
                key_type,
                action,
                modifiers,
                sequence: None,
            }),
        );
        if shared.keyboard_tx.blocking_send(record).is_ok() {
            shared.keyboard_count.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("keyboard channel closed");
        }
    }

    fn on_move(&mut self, shared: &HookShared, position: (f64, f64), now: DateTime<Utc>) {
        self.position = position;

        // Pure movement is dropped unless it is part of an in-progress drag.
        let Some(pressed) = &self.pressed else {
            return;
        };
        let dx = position.0 - pressed.position.0;
        let dy = position.1 - pressed.position.1;
        if !self.dragging && (dx * dx + dy * dy).sqrt() >= DRAG_START_PX {
            self.dragging = true;
        }
        if !self.dragging {
            return;
        }

        let throttled = self
            .last_drag_emit
            .map(|last| (now - last).num_milliseconds() < DRAG_EMIT_MS)
            .unwrap_or(false);
        if throttled {
            return;
        }
        self.last_drag_emit = Some(now);

        let payload = MousePayload {
            action: MouseAction::Drag,
            button: Some(pressed.button),
            position,
            start_position: Some(pressed.position),
            end_position: None,
            scroll_delta: None,
            duration_ms: None,
            count: None,
        };
        let out = self.coalescer.push(now, payload);
        self.emit_mouse(shared, out);
    }

    fn emit_mouse(&self, shared: &HookShared, records: Vec<(DateTime<Utc>, MousePayload)>) {
        if !shared.mouse_enabled.load(Ordering::SeqCst) {
            return;
        }
        for (ts, payload) in records {
            let record = RawRecord::new(ts, RecordPayload::Mouse(payload));
            if shared.mouse_tx.blocking_send(record).is_ok() {
                shared.mouse_count.fetch_add(1, Ordering::Relaxed);
            } else {
                debug!("mouse channel closed");
            }
        }
    }
}

// -- Local mouse coalescing --

/// Folds adjacent mouse events before they leave the capture layer:
/// consecutive scrolls within 100 ms accumulate deltas, and a Press followed
/// by a Release within 500 ms collapses into a Click carrying start/end
/// positions and duration. Anything else flushes what is pending.
#[derive(Default)]
pub struct MouseCoalescer {
    pending: Option<Pending>,
}

enum Pending {
    Press {
        time: DateTime<Utc>,
        button: Option<MouseButton>,
        position: (f64, f64),
    },
    Scroll {
        first_time: DateTime<Utc>,
        last_time: DateTime<Utc>,
        position: (f64, f64),
        delta: (f64, f64),
        count: usize,
    },
}

impl MouseCoalescer {
    pub fn push(
        &mut self,
        now: DateTime<Utc>,
        payload: MousePayload,
    ) -> Vec<(DateTime<Utc>, MousePayload)> {
        let mut out = Vec::new();

        match (&mut self.pending, payload.action) {
            (
                Some(Pending::Press {
                    time,
                    button,
                    position,
                }),
                MouseAction::Release,
            ) if (now - *time).num_milliseconds() <= CLICK_MERGE_MS
                && *button == payload.button =>
            {
                let click = MousePayload {
                    action: MouseAction::Click,
                    button: *button,
                    position: payload.position,
                    start_position: Some(*position),
                    end_position: Some(payload.position),
                    scroll_delta: None,
                    duration_ms: Some((now - *time).num_milliseconds()),
                    count: None,
                };
                out.push((*time, click));
                self.pending = None;
                return out;
            }
            (
                Some(Pending::Scroll {
                    last_time,
                    position,
                    delta,
                    count,
                    ..
                }),
                MouseAction::Scroll,
            ) if (now - *last_time).num_milliseconds() <= SCROLL_MERGE_MS => {
                let (dx, dy) = payload.scroll_delta.unwrap_or((0.0, 0.0));
                delta.0 += dx;
                delta.1 += dy;
                *count += 1;
                *last_time = now;
                *position = payload.position;
                return out;
            }
            _ => {}
        }

        out.extend(self.flush());

        match payload.action {
            MouseAction::Press => {
                self.pending = Some(Pending::Press {
                    time: now,
                    button: payload.button,
                    position: payload.position,
                });
            }
            MouseAction::Scroll => {
                self.pending = Some(Pending::Scroll {
                    first_time: now,
                    last_time: now,
                    position: payload.position,
                    delta: payload.scroll_delta.unwrap_or((0.0, 0.0)),
                    count: 1,
                });
            }
            _ => out.push((now, payload)),
        }
        out
    }

    /// Emit whatever is pending (an unpaired Press or an open scroll chain).
    pub fn flush(&mut self) -> Vec<(DateTime<Utc>, MousePayload)> {
        match self.pending.take() {
            None => Vec::new(),
            Some(Pending::Press {
                time,
                button,
                position,
            }) => vec![(
                time,
                MousePayload {
                    action: MouseAction::Press,
                    button,
                    position,
                    start_position: None,
                    end_position: None,
                    scroll_delta: None,
                    duration_ms: None,
                    count: None,
                },
            )],
            Some(Pending::Scroll {
                first_time,
                last_time,
                position,
                delta,
                count,
            }) => vec![(
                first_time,
                MousePayload {
                    action: MouseAction::Scroll,
                    button: None,
                    position,
                    start_position: None,
                    end_position: None,
                    scroll_delta: Some(delta),
                    duration_ms: Some((last_time - first_time).num_milliseconds()),
                    count: Some(count),
                },
            )],
        }
    }
}

// -- rdev mappings --

fn map_button(button: rdev::Button) -> MouseButton {
    match button {
        rdev::Button::Left => MouseButton::Left,
        rdev::Button::Right => MouseButton::Right,
        rdev::Button::Middle => MouseButton::Middle,
        rdev::Button::Unknown(_) => MouseButton::Other,
    }
}

#[cfg(target_os = "macos")]
const META_MODIFIER: (&str, Modifier) = ("cmd", Modifier::Cmd);
#[cfg(not(target_os = "macos"))]
const META_MODIFIER: (&str, Modifier) = ("super", Modifier::Super);

fn modifier_for(name: &str) -> Option<Modifier> {
    match name {
        "shift" => Some(Modifier::Shift),
        "ctrl" => Some(Modifier::Ctrl),
        "alt" => Some(Modifier::Alt),
        "cmd" => Some(Modifier::Cmd),
        "super" => Some(Modifier::Super),
        _ => None,
    }
}

fn map_key(key: rdev::Key) -> (String, KeyType) {
    use rdev::Key::*;

    let special = |name: &str| (name.to_string(), KeyType::Special);
    let modifier = |name: &str| (name.to_string(), KeyType::Modifier);

    match key {
        Return => special("enter"),
        Escape => special("esc"),
        Backspace => special("backspace"),
        Delete => special("delete"),
        Tab => special("tab"),
        Space => special("space"),
        UpArrow => special("up"),
        DownArrow => special("down"),
        LeftArrow => special("left"),
        RightArrow => special("right"),
        Home => special("home"),
        End => special("end"),
        PageUp => special("page_up"),
        PageDown => special("page_down"),
        Insert => special("insert"),
        PrintScreen => special("print_screen"),
        Pause => special("pause"),
        CapsLock => special("caps_lock"),
        NumLock => special("num_lock"),
        ScrollLock => special("scroll_lock"),
        F1 => special("f1"),
        F2 => special("f2"),
        F3 => special("f3"),
        F4 => special("f4"),
        F5 => special("f5"),
        F6 => special("f6"),
        F7 => special("f7"),
        F8 => special("f8"),
        F9 => special("f9"),
        F10 => special("f10"),
        F11 => special("f11"),
        F12 => special("f12"),
        ShiftLeft | ShiftRight => modifier("shift"),
        ControlLeft | ControlRight => modifier("ctrl"),
        Alt | AltGr => modifier("alt"),
        MetaLeft | MetaRight => modifier(META_MODIFIER.0),
        other => {
            // KeyQ -> "q", Num3 -> "3"; anything else keeps its debug name.
            let raw = format!("{other:?}").to_lowercase();
            let name = raw
                .strip_prefix("key")
                .or_else(|| raw.strip_prefix("num"))
                .unwrap_or(&raw)
                .to_string();
            if name.chars().count() == 1 {
                (name, KeyType::Char)
            } else {
                (name, KeyType::Special)
            }
        }
    }
}
