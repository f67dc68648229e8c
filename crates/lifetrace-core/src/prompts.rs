use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{CoreError, Result};
use crate::schema::{Activity, Event, Knowledge, Todo};

/// Prompt template language, selected by `language.default_language`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Zh,
    En,
}

impl Language {
    pub fn parse(s: &str) -> Self {
        match s {
            "en" => Language::En,
            _ => Language::Zh,
        }
    }
}

// -- LLM output shapes --

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionItem {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// The object the extraction call must return:
/// `{"events": [...], "knowledge": [...], "todos": [...]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub events: Vec<ExtractionItem>,
    #[serde(default)]
    pub knowledge: Vec<ExtractionItem>,
    #[serde(default)]
    pub todos: Vec<ExtractionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub source_event_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub merged_from_ids: Vec<String>,
}

// -- Output scrubbing --

/// Strip `<think>…</think>` blocks (reasoning models) and markdown code
/// fences from LLM output before JSON parsing.
pub fn clean_llm_output(raw: &str) -> String {
    let without_think = if let Ok(re) = regex_lite::Regex::new(r"(?s)<think>.*?</think>") {
        re.replace_all(raw, "").to_string()
    } else {
        raw.to_string()
    };

    let trimmed = without_think.trim();
    let trimmed = trimmed.strip_prefix("```json").unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix("```").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim().to_string()
}

fn parse_json_lenient<T: serde::de::DeserializeOwned>(raw: &str, open: char, close: char) -> Result<T> {
    let clean = clean_llm_output(raw);
    if let Ok(value) = serde_json::from_str::<T>(&clean) {
        return Ok(value);
    }
    // Second chance: cut from the first opening to the last closing bracket
    // to drop chatty prose around the JSON.
    if let (Some(start), Some(end)) = (clean.find(open), clean.rfind(close)) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<T>(&clean[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(CoreError::Parse(format!(
        "unparseable LLM output: {}",
        clean.chars().take(200).collect::<String>()
    )))
}

pub fn parse_extraction(raw: &str) -> Result<ExtractionResult> {
    parse_json_lenient(raw, '{', '}')
}

pub fn parse_activity_drafts(raw: &str) -> Result<Vec<ActivityDraft>> {
    parse_json_lenient(raw, '[', ']')
}

pub fn parse_merge_drafts(raw: &str) -> Result<Vec<MergeDraft>> {
    parse_json_lenient(raw, '[', ']')
}

// -- Prompt templates --

pub fn extraction_system_prompt(lang: Language) -> &'static str {
    match lang {
        Language::Zh => {
            "你是一个屏幕活动分析助手。根据按时间顺序排列的屏幕截图和输入活动提示，\
             提取用户正在进行的事件（events）、值得记住的知识点（knowledge）和待办事项（todos）。\
             只输出 JSON 对象（不要 markdown 代码块），格式为：\
             {\"events\":[{\"title\":\"…\",\"description\":\"…\",\"keywords\":[\"…\"]}],\
             \"knowledge\":[…],\"todos\":[…]}。\
             title 简短概括；description 具体说明看到的内容；keywords 为 2-5 个关键词。\
             没有可提取的类别时返回空数组，不要编造。"
        }
        Language::En => {
            "You analyze a user's screen activity. From the screenshots in \
             chronological order plus the input-activity hint, extract the events \
             the user was engaged in, any knowledge worth remembering, and any todos. \
             Output ONLY a JSON object (no markdown fences) shaped as \
             {\"events\":[{\"title\":\"…\",\"description\":\"…\",\"keywords\":[\"…\"]}],\
             \"knowledge\":[…],\"todos\":[…]}. Keep titles short, descriptions \
             concrete about what is visible, and 2-5 keywords per item. Return empty \
             arrays for categories with nothing to extract; never fabricate."
        }
    }
}

/// The text part of the multimodal extraction message.
pub fn extraction_user_prompt(lang: Language, input_usage_hint: &str) -> String {
    match lang {
        Language::Zh => format!(
            "以下是按时间顺序排列的屏幕截图。辅助提示：{input_usage_hint}。\
             请提取 events、knowledge 和 todos。"
        ),
        Language::En => format!(
            "The following screenshots are in chronological order. \
             Hint: {input_usage_hint}. Extract events, knowledge, and todos."
        ),
    }
}

/// Render the keyboard/mouse activity hint in the configured language.
pub fn input_usage_hint(lang: Language, has_keyboard: bool, has_mouse: bool) -> String {
    match lang {
        Language::Zh => {
            let kb = if has_keyboard {
                "用户有在使用键盘"
            } else {
                "用户没有在使用键盘"
            };
            let mouse = if has_mouse {
                "用户有在使用鼠标"
            } else {
                "用户没有在使用鼠标"
            };
            format!("{kb}；{mouse}")
        }
        Language::En => {
            let kb = if has_keyboard {
                "User has keyboard activity"
            } else {
                "User has no keyboard activity"
            };
            let mouse = if has_mouse {
                "User has mouse activity"
            } else {
                "User has no mouse activity"
            };
            format!("{kb}; {mouse}")
        }
    }
}

/// Title prefix of the locally synthesized event written when the LLM is
/// unavailable or unparseable.
pub fn fallback_event_title(lang: Language) -> &'static str {
    match lang {
        Language::Zh => "[Fallback] 屏幕活动记录",
        Language::En => "[Fallback] Screen activity",
    }
}

pub fn activity_aggregation_prompt(lang: Language, events: &[Event]) -> String {
    let mut listing = String::new();
    for event in events {
        listing.push_str(&format!(
            "- id: {} | time: {} | {}: {}\n",
            event.id,
            event.timestamp.to_rfc3339(),
            event.title,
            event.description
        ));
    }

    match lang {
        Language::Zh => format!(
            "以下是最近提取的事件列表：\n{listing}\n\
             请将时间相近、主题连贯的事件聚合为若干个活动（activities）。\
             只输出 JSON 数组（不要 markdown 代码块）：\
             [{{\"title\":\"…\",\"description\":\"…\",\"source_event_ids\":[\"…\"]}}]。\
             每个事件最多归入一个活动；不相关的事件可以不归入任何活动。"
        ),
        Language::En => format!(
            "Recently extracted events:\n{listing}\n\
             Cluster temporally adjacent, thematically coherent events into \
             activities. Output ONLY a JSON array (no markdown fences): \
             [{{\"title\":\"…\",\"description\":\"…\",\"source_event_ids\":[\"…\"]}}]. \
             Assign each event to at most one activity; events that fit nowhere \
             may be left out."
        ),
    }
}

pub fn knowledge_merge_prompt(lang: Language, knowledge: &[Knowledge]) -> String {
    let mut listing = String::new();
    for k in knowledge {
        listing.push_str(&format!(
            "- id: {} | {}: {} | keywords: {}\n",
            k.id,
            k.title,
            k.description,
            k.keywords.join(", ")
        ));
    }

    match lang {
        Language::Zh => format!(
            "以下是尚未整理的知识条目：\n{listing}\n\
             请把内容相关的条目合并为更完整的知识条目。只输出 JSON 数组：\
             [{{\"title\":\"…\",\"description\":\"…\",\"keywords\":[\"…\"],\
             \"merged_from_ids\":[\"…\"]}}]。\
             每个合并条目至少包含两个源 id；无法合并的条目不要输出。"
        ),
        Language::En => format!(
            "Unconsolidated knowledge entries:\n{listing}\n\
             Merge related entries into richer ones. Output ONLY a JSON array: \
             [{{\"title\":\"…\",\"description\":\"…\",\"keywords\":[\"…\"],\
             \"merged_from_ids\":[\"…\"]}}]. Each merged entry must reference at \
             least two source ids; entries that merge with nothing are omitted."
        ),
    }
}

pub fn todo_merge_prompt(lang: Language, todos: &[Todo]) -> String {
    let mut listing = String::new();
    for t in todos {
        listing.push_str(&format!(
            "- id: {} | {}: {} | completed: {}\n",
            t.id, t.title, t.description, t.completed
        ));
    }

    match lang {
        Language::Zh => format!(
            "以下是尚未整理的待办事项：\n{listing}\n\
             请把重复或相关的待办合并。只输出 JSON 数组：\
             [{{\"title\":\"…\",\"description\":\"…\",\"keywords\":[\"…\"],\
             \"merged_from_ids\":[\"…\"]}}]。\
             每个合并条目至少包含两个源 id。"
        ),
        Language::En => format!(
            "Unconsolidated todos:\n{listing}\n\
             Merge duplicate or related todos. Output ONLY a JSON array: \
             [{{\"title\":\"…\",\"description\":\"…\",\"keywords\":[\"…\"],\
             \"merged_from_ids\":[\"…\"]}}]. Each merged entry must reference at \
             least two source ids."
        ),
    }
}

pub fn diary_prompt(lang: Language, date: &str, activities: &[Activity]) -> String {
    let mut listing = String::new();
    for a in activities {
        listing.push_str(&format!(
            "- {} ~ {} | {}: {}\n",
            format_time(a.start_time),
            format_time(a.end_time),
            a.title,
            a.description
        ));
    }

    match lang {
        Language::Zh => format!(
            "以下是 {date} 的活动记录：\n{listing}\n\
             请以第一人称写一篇当天的日记，概括这一天做了什么、有什么收获。\
             直接输出日记正文，不要任何额外说明。"
        ),
        Language::En => format!(
            "Activities on {date}:\n{listing}\n\
             Write a first-person diary entry for the day, summarizing what was \
             done and anything learned. Output the diary body only."
        ),
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extraction_plain() {
        let raw = r#"{"events":[{"title":"T","description":"D","keywords":["k"]}],"knowledge":[],"todos":[]}"#;
        let result = parse_extraction(raw).unwrap();
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].title, "T");
        assert_eq!(result.events[0].keywords, vec!["k"]);
        assert!(result.knowledge.is_empty());
    }

    #[test]
    fn parse_extraction_fenced() {
        let raw = "```json\n{\"events\":[],\"knowledge\":[{\"title\":\"K\",\"description\":\"D\"}],\"todos\":[]}\n```";
        let result = parse_extraction(raw).unwrap();
        assert_eq!(result.knowledge.len(), 1);
        assert!(result.knowledge[0].keywords.is_empty());
    }

    #[test]
    fn parse_extraction_with_think_block() {
        let raw = "<think>reasoning about screens</think>{\"events\":[],\"knowledge\":[],\"todos\":[]}";
        assert!(parse_extraction(raw).is_ok());
    }

    #[test]
    fn parse_extraction_with_surrounding_prose() {
        let raw = "Here is the result:\n{\"events\":[],\"knowledge\":[],\"todos\":[]}\nHope that helps!";
        assert!(parse_extraction(raw).is_ok());
    }

    #[test]
    fn parse_extraction_garbage_fails() {
        assert!(parse_extraction("API 请求失败: timeout").is_err());
        assert!(parse_extraction("").is_err());
    }

    #[test]
    fn parse_extraction_missing_arrays_default_empty() {
        let result = parse_extraction(r#"{"events":[]}"#).unwrap();
        assert!(result.todos.is_empty());
    }

    #[test]
    fn parse_activity_drafts_array() {
        let raw = r#"[{"title":"A","description":"D","source_event_ids":["e1","e2"]}]"#;
        let drafts = parse_activity_drafts(raw).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].source_event_ids, vec!["e1", "e2"]);
    }

    #[test]
    fn hint_languages() {
        assert_eq!(
            input_usage_hint(Language::En, true, false),
            "User has keyboard activity; User has no mouse activity"
        );
        assert!(input_usage_hint(Language::Zh, false, true).contains('；'));
    }

    #[test]
    fn fallback_title_is_tagged() {
        assert!(fallback_event_title(Language::Zh).starts_with("[Fallback]"));
        assert!(fallback_event_title(Language::En).starts_with("[Fallback]"));
    }

    #[test]
    fn language_parse_defaults_zh() {
        assert_eq!(Language::parse("en"), Language::En);
        assert_eq!(Language::parse("zh"), Language::Zh);
        assert_eq!(Language::parse("fr"), Language::Zh);
    }
}
