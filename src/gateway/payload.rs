//! Request bodies and response parsing shared by the backends.
//!
//! Tagging replies are free LLM text that should contain one JSON object
//! `{"tags": [...], "emoji": [...], "code": {...}}`. Models wrap it in
//! prose or code fences and leave trailing commas, so extraction is
//! lenient: parse the whole text, then the outermost `{...}` span, then
//! that span with trailing commas removed.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Ты извлекаешь теги и короткие сигналы из текста поста. \
Верни ТОЛЬКО один JSON-объект вида {\"tags\": [\"...\"], \"emoji\": [\"...\"], \
\"code\": {\"sentiment\": 0.0, \"urgency\": 0.0, \"market\": 0.0, \"macro\": 0.0, \
\"geopolitics\": 0.0, \"company\": 0.0, \"commodities\": 0.0, \"fx\": 0.0, \"rates\": 0.0, \
\"crypto\": 0.0, \"usefulness\": 0.0, \"ad\": 0.0}} без пояснений и без Markdown. \
Теги на русском, 1-3 слова, в именительном падеже, каждое слово с большой буквы, без # и эмодзи. \
Аббревиатуры сохраняй (ЦБ, IMOEX2, USD/RUB) и предпочитай их полным формам. \
Не добавляй отдельные числа, даты, проценты и общие прилагательные. \
Эмодзи только из разрешённого списка, не больше 10. \
sentiment в диапазоне -1..1, остальные коды 0..1; usefulness — полезность, ad — вероятность рекламы.";

/// Signal dimensions returned under `code`.
pub const CODE_KEYS: &[&str] = &[
    "sentiment",
    "urgency",
    "market",
    "macro",
    "geopolitics",
    "company",
    "commodities",
    "fx",
    "rates",
    "crypto",
    "usefulness",
    "ad",
];

pub const MAX_EMOJI: usize = 10;

pub const ALLOWED_EMOJI: &[&str] = &[
    "⚠️", "🔥", "📉", "📈", "💰", "🪙", "💱", "🛢️", "🏦", "🏭", "🧾", "📰", "🧠", "🌍", "🛡️", "🧪",
    "🚀", "🎯", "✅", "❌", "😡", "😢", "😊", "🎉", "🥇", "🥈", "🥉", "🪨", "🪵", "🌾", "🌽", "🍬",
    "🌱", "⛽️", "⚡️", "✈️", "🛰️", "🏠", "🐄", "🐟", "📊", "💹", "☢️", "🚢", "💥", "💣", "🎮", "🕹️",
    "🏆", "⚔️", "🇷🇺", "🇺🇸", "🇨🇳", "🇪🇺", "🇬🇧", "🇩🇪", "🇫🇷", "🇮🇹", "🇯🇵", "🇰🇷", "🇮🇳", "🇧🇷",
    "🇹🇷", "🇺🇦", "🇨🇦", "🇦🇺", "🇸🇦", "🇦🇪", "🇮🇱", "🇮🇷", "🇮🇶", "🇪🇬", "🇵🇱", "🇨🇿", "🇳🇱", "🇧🇪",
    "🇪🇸", "🇵🇹", "🇸🇪", "🇳🇴", "🇫🇮", "🇩🇰", "🇨🇭", "🇦🇹", "🇲🇽", "🇦🇷", "🇨🇱", "🇨🇴", "🇰🇿", "🇧🇾",
    "⬆️", "⬇️",
];

/// Parsed tagging answer before canonicalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagPayload {
    pub tags: Vec<String>,
    pub emoji: Vec<String>,
    /// Empty when the model returned no `code` object.
    pub code: BTreeMap<String, f64>,
}

impl TagPayload {
    /// Emoji joined with single spaces, `None` when there are none.
    pub fn emoji_line(&self) -> Option<String> {
        if self.emoji.is_empty() {
            None
        } else {
            Some(self.emoji.join(" "))
        }
    }
}

// ============ Prompts ============

pub fn tag_prompt(text: &str, candidates: &[String], max_tags: usize) -> String {
    let mut prompt = format!(
        "Выдели до {} тегов. Верни только JSON.\n\n{}",
        max_tags, text
    );
    if !candidates.is_empty() {
        prompt = format!(
            "Возможные кандидаты (используй если релевантно): {}\n\n{}",
            candidates.join(", "),
            prompt
        );
    }
    prompt
}

/// Chat body for an Ollama-compatible `/api/chat`.
pub fn chat_body(model: &str, system: &str, prompt: &str, temperature: f64) -> Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": prompt},
        ],
        "options": {"temperature": temperature},
        "stream": false,
    })
}

// ============ Response parsing ============

/// Pull the generated text out of a job result.
///
/// Looks at `data.response`, `data.message.content`, then
/// `data.choices[0].message.content` and `data.choices[0].text`.
pub fn extract_llm_text(result: &Value) -> Option<String> {
    let data = result.get("data").unwrap_or(result);

    let candidates = [
        data.get("response"),
        data.pointer("/message/content"),
        data.pointer("/choices/0/message/content"),
        data.pointer("/choices/0/text"),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Find the JSON object inside LLM output.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text.trim()) {
        return Some(map);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let blob = &text[start..=end];

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(blob) {
        return Some(map);
    }
    match serde_json::from_str::<Value>(&repair_trailing_commas(blob)) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn repair_trailing_commas(blob: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid regex"));
    re.replace_all(blob, "$1").into_owned()
}

/// Build a [`TagPayload`] from LLM text.
///
/// Unparseable text yields an empty payload; callers decide whether
/// that is an error.
pub fn parse_tag_payload(text: &str, max_tags: usize) -> TagPayload {
    let Some(obj) = extract_json_object(text) else {
        return TagPayload::default();
    };

    let mut tags: Vec<String> = Vec::new();
    if let Some(Value::Array(items)) = obj.get("tags") {
        for item in items.iter().filter_map(Value::as_str) {
            let item = item.trim();
            if !item.is_empty() && !tags.iter().any(|t| t == item) {
                tags.push(item.to_string());
            }
        }
    }
    if max_tags > 0 {
        tags.truncate(max_tags);
    }

    let emoji = match obj.get("emoji") {
        Some(Value::Array(items)) => filter_emoji(items.iter().filter_map(Value::as_str)),
        _ => Vec::new(),
    };

    let code = match obj.get("code") {
        Some(Value::Object(map)) => normalize_code(map),
        _ => BTreeMap::new(),
    };

    TagPayload { tags, emoji, code }
}

/// Keep allowed emoji, de-duplicated, at most [`MAX_EMOJI`].
///
/// Matching ignores the U+FE0F variation selector models often drop.
pub fn filter_emoji<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let bare = |s: &str| s.replace('\u{FE0F}', "");
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let key = bare(item.trim());
        if key.is_empty() {
            continue;
        }
        if let Some(allowed) = ALLOWED_EMOJI.iter().find(|a| bare(a) == key) {
            if !out.iter().any(|o| o == allowed) {
                out.push(allowed.to_string());
            }
        }
        if out.len() == MAX_EMOJI {
            break;
        }
    }
    out
}

/// All [`CODE_KEYS`] present, parsed as floats and clamped.
///
/// `sentiment` is clamped to `[-1, 1]`, every other key to `[0, 1]`.
/// Missing or non-numeric values become `0.0`.
pub fn normalize_code(map: &Map<String, Value>) -> BTreeMap<String, f64> {
    CODE_KEYS
        .iter()
        .map(|key| {
            let raw = match map.get(*key) {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
                _ => 0.0,
            };
            let raw = if raw.is_finite() { raw } else { 0.0 };
            let value = if *key == "sentiment" {
                raw.clamp(-1.0, 1.0)
            } else {
                raw.clamp(0.0, 1.0)
            };
            (key.to_string(), value)
        })
        .collect()
}

/// Read a non-empty numeric vector at `embedding` (or `data.embedding`).
pub fn parse_embedding(value: &Value) -> Option<Vec<f32>> {
    let arr = value
        .get("embedding")
        .or_else(|| value.pointer("/data/embedding"))?
        .as_array()?;

    let vec: Option<Vec<f32>> = arr.iter().map(|v| v.as_f64().map(|f| f as f32)).collect();
    vec.filter(|v| !v.is_empty())
}
