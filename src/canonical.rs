//! Tag canonicalization.
//!
//! [`Canonicalizer::canonicalize`] maps one raw tag string onto the
//! canonical vocabulary. It never fails:
//!
//! 1. **Clean.** Surrounding whitespace, quotes, brackets and trailing
//!    punctuation are trimmed, a leading `#` dropped, dash variants
//!    unified and inner whitespace collapsed.
//! 2. **Alias.** The cleaned string is looked up exactly in the alias
//!    table; with folding enabled a lowercased, transliterated key is
//!    tried next. A hit returns the mapped canonical unchanged.
//! 3. **Normalize.** Otherwise every word is title-cased and returned as
//!    its own canonical. All-caps tokens (`ЦБ`, `IMOEX2`) and configured
//!    abbreviations stay verbatim.
//!
//! A title-cased result that is itself an alias key resolves through the
//! table, so for any string whose canonical is not itself an alias key the
//! function is idempotent.
//!
//! [`Canonicalizer::canonicalize_tags`] applies the tag-set policy on top:
//! it drops noise (too short, numeric, stop words, adjective and verb
//! forms), merges known compounds, drops generic tags from large sets and
//! de-duplicates preserving first occurrence.

use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use crate::aliases::AliasTable;

const TRIM_CHARS: &[char] = &[
    '"', '\'', '`', '(', ')', '[', ']', '{', '}', '<', '>', '«', '»', '.', ',', ';', ':', '!', '?',
];

const DROP_PREFIXES: &[&str] = &[
    "рост ",
    "снижение ",
    "падение ",
    "увеличение ",
    "сокращение ",
    "уменьшение ",
    "повышение ",
];

const STOP_TAGS: &[&str] = &[
    "сфера", "сектор", "услуги", "покупки", "продукции", "активность", "крупные", "крупный",
    "крупная", "крупного", "крупной", "крупным", "частный", "частная", "частные", "частного",
    "частной", "частным", "деловая", "деловой", "деловые", "делового", "экономическая",
    "экономический", "экономические", "экономической", "экономического", "потребительская",
    "продовольственная", "логистические", "транспортные", "туристическая", "общественный",
    "общественная", "общественные", "будний день", "на", "в", "по", "к", "из", "за", "для", "о",
    "об", "обо", "у", "от", "до", "при", "про", "под", "над", "между", "без", "live", "stream",
    "started", "рост",
];

const GENERIC_TAGS: &[&str] = &[
    "рынок", "продукция", "погода", "интернет", "сад", "ремонт", "аккаунты", "поездки",
    "новости", "экспресс", "подкаст", "компания", "компании", "граждане", "бизнес", "операции",
    "платежи", "бюджет", "цена", "стрим", "старт", "вывод",
];

const ADJ_ENDINGS: &[&str] = &[
    "ая", "яя", "ое", "ее", "ый", "ий", "ые", "ие", "ой", "ого", "его", "ему", "ими", "ыми", "ым",
    "ую",
];

const VERB_ENDINGS: &[&str] = &["ся", "лся", "лась", "лись", "лось", "ли", "ло", "ла"];

const ADJ_KEEP: &[&str] = &["первичный", "вторичный", "валютные", "валютный"];

const COMPOUNDS: &[(&str, &str, &str)] = &[
    ("Валютные", "Бумаги", "Валютные Бумаги"),
    ("Первичный", "Рынок", "Первичный Рынок"),
    ("Вторичный", "Рынок", "Вторичный Рынок"),
];

/// Above this many tags, generic ones are dropped.
const GENERIC_FILTER_THRESHOLD: usize = 6;
/// Generic filtering never leaves fewer than this many tags.
const GENERIC_FILTER_FLOOR: usize = 3;

/// Alias-aware canonicalizer bound to one alias table snapshot.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    aliases: Arc<AliasTable>,
    fold: bool,
    abbreviations: HashSet<String>,
}

impl Canonicalizer {
    pub fn new(aliases: Arc<AliasTable>) -> Self {
        Self {
            aliases,
            fold: true,
            abbreviations: HashSet::new(),
        }
    }

    pub fn with_fold(mut self, fold: bool) -> Self {
        self.fold = fold;
        self
    }

    pub fn with_abbreviations<I, S>(mut self, abbreviations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.abbreviations
            .extend(abbreviations.into_iter().map(Into::into));
        self
    }

    /// Map a raw tag to its canonical form.
    pub fn canonicalize(&self, raw: &str) -> String {
        let cleaned = clean_tag(raw);
        if cleaned.is_empty() {
            return cleaned;
        }
        if let Some(canonical) = self.resolve_alias(&cleaned) {
            return canonical.to_string();
        }
        self.normalize(&cleaned)
    }

    /// Title-case a cleaned tag that missed the alias table. A title-cased
    /// form that is itself an alias key resolves through the table, so the
    /// result is stable under repeated canonicalization.
    fn normalize(&self, cleaned: &str) -> String {
        let titled = self.title_case(cleaned);
        match self.resolve_alias(&titled) {
            Some(canonical) => canonical.to_string(),
            None => titled,
        }
    }

    /// Canonicalize a whole tag list with the noise policy applied.
    ///
    /// The result is de-duplicated, compound-merged and capped at
    /// `max_tags`.
    pub fn canonicalize_tags<I, S>(&self, raw_tags: I, max_tags: usize) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut result = Vec::new();

        for raw in raw_tags {
            let Some(tag) = self.accept(raw.as_ref()) else {
                continue;
            };
            if seen.insert(tag.clone()) {
                result.push(tag);
            }
        }

        let mut merged = filter_generic(merge_compounds(result));
        merged.truncate(max_tags);
        merged
    }

    fn resolve_alias(&self, cleaned: &str) -> Option<&str> {
        if let Some(hit) = self.aliases.lookup_exact(cleaned) {
            return Some(hit);
        }
        if self.fold {
            return self.aliases.lookup_folded(cleaned);
        }
        None
    }

    fn accept(&self, raw: &str) -> Option<String> {
        let mut tag = clean_tag(raw);
        if tag.is_empty() {
            return None;
        }
        if tag.chars().count() <= 2 && !is_upper(&tag) {
            return None;
        }

        let lowered = tag.to_lowercase();
        if let Some(prefix) = DROP_PREFIXES.iter().find(|p| lowered.starts_with(*p)) {
            let rest = tag.chars().skip(prefix.chars().count()).collect::<String>();
            tag = rest.trim().to_string();
            if tag.is_empty() {
                return None;
            }
        }

        if !charset_re().is_match(&tag) {
            return None;
        }

        if let Some(canonical) = self.resolve_alias(&tag) {
            return Some(canonical.to_string());
        }

        if tag.chars().any(|c| c.is_ascii_digit())
            && !caps_with_digits_re().is_match(&tag)
            && !ticker_number_re().is_match(&tag)
        {
            return None;
        }
        if number_re().is_match(&tag) {
            return None;
        }
        if tag.chars().any(|c| c.is_ascii_alphabetic()) {
            // Latin survives only as an abbreviation or ticker.
            return latin_caps_re().is_match(&tag).then_some(tag);
        }
        if cyrillic_caps_re().is_match(&tag) {
            return Some(tag);
        }
        if is_stop_tag(&tag) {
            return None;
        }

        Some(self.normalize(&tag))
    }

    fn title_case(&self, text: &str) -> String {
        text.split(' ')
            .filter(|token| !token.is_empty())
            .map(|token| {
                if self.is_verbatim(token) {
                    return token.to_string();
                }
                token
                    .split('-')
                    .filter(|sub| !sub.is_empty())
                    .map(|sub| {
                        if self.is_verbatim(sub) {
                            sub.to_string()
                        } else {
                            capitalize_first(sub)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("-")
            })
            // A lone dash leaves nothing behind.
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn is_verbatim(&self, token: &str) -> bool {
        is_upper(token) || self.abbreviations.contains(token)
    }
}

/// Trim noise around a tag without touching its case.
pub fn clean_tag(raw: &str) -> String {
    let unified: String = raw
        .chars()
        .map(|c| match c {
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' => '-',
            other => other,
        })
        .collect();

    let mut tag = unified.trim();
    loop {
        let next = tag
            .trim_start_matches('#')
            .trim_matches(TRIM_CHARS)
            .trim();
        if next == tag {
            break;
        }
        tag = next;
    }

    tag.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when the text has cased characters and all of them are uppercase.
fn is_upper(text: &str) -> bool {
    let mut cased = false;
    for c in text.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            cased = true;
        }
    }
    cased
}

fn capitalize_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn is_single_word(tag: &str) -> bool {
    !tag.contains(' ') && !tag.contains('-')
}

fn is_stop_tag(tag: &str) -> bool {
    let lowered = tag.to_lowercase();
    if STOP_TAGS.contains(&lowered.as_str()) {
        return true;
    }
    if !is_single_word(tag) || ADJ_KEEP.contains(&lowered.as_str()) {
        return false;
    }
    VERB_ENDINGS.iter().any(|end| lowered.ends_with(end))
        || ADJ_ENDINGS.iter().any(|end| lowered.ends_with(end))
}

fn merge_compounds(tags: Vec<String>) -> Vec<String> {
    let mut present: HashSet<String> = tags.iter().cloned().collect();
    let mut combined = Vec::new();
    for (left, right, joined) in COMPOUNDS {
        if present.contains(*left) && present.contains(*right) {
            present.remove(*left);
            present.remove(*right);
            present.insert(joined.to_string());
            combined.push(joined.to_string());
        }
    }

    let mut merged: Vec<String> = tags.into_iter().filter(|t| present.contains(t)).collect();
    for joined in combined {
        if !merged.contains(&joined) {
            merged.push(joined);
        }
    }
    merged
}

fn filter_generic(tags: Vec<String>) -> Vec<String> {
    if tags.len() <= GENERIC_FILTER_THRESHOLD {
        return tags;
    }
    let filtered: Vec<String> = tags
        .iter()
        .filter(|t| !GENERIC_TAGS.contains(&t.to_lowercase().as_str()))
        .cloned()
        .collect();
    if filtered.len() >= GENERIC_FILTER_FLOOR {
        filtered
    } else {
        tags
    }
}

// ============ Patterns ============

fn charset_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-zА-Яа-яЁё0-9 ./&()+\-]+$").expect("valid regex"))
}

fn caps_with_digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-ZА-ЯЁ0-9./&\-]+$").expect("valid regex"))
}

fn ticker_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-ZА-ЯЁ]{2,}\s?[0-9]+$").expect("valid regex"))
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]+([.,][0-9]+)?$").expect("valid regex"))
}

fn latin_caps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9./&\-]+$").expect("valid regex"))
}

fn cyrillic_caps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[А-ЯЁ0-9./&\-]+$").expect("valid regex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Canonicalizer {
        Canonicalizer::new(Arc::new(AliasTable::with_defaults()))
    }

    #[test]
    fn test_alias_hit_ignores_surrounding_whitespace() {
        let c = engine();
        assert_eq!(c.canonicalize("цб"), "ЦБ");
        assert_eq!(c.canonicalize("  цб\t"), "ЦБ");
        assert_eq!(c.canonicalize("\n центральный банк  "), "ЦБ");
    }

    #[test]
    fn test_alias_hit_beats_normalization() {
        let mut table = AliasTable::new();
        table.insert("Нефть", "Brent");
        let c = Canonicalizer::new(Arc::new(table));
        assert_eq!(c.canonicalize("Нефть"), "Brent");
    }

    #[test]
    fn test_folded_alias_hit() {
        let c = engine();
        assert_eq!(c.canonicalize("Центральный Банк"), "ЦБ");
        assert_eq!(c.canonicalize("Keystavka"), "Ключевая Ставка");
    }

    #[test]
    fn test_fold_disabled_uses_exact_only() {
        let c = engine().with_fold(false);
        assert_eq!(c.canonicalize("Центральный Банк"), "Центральный Банк");
        assert_eq!(c.canonicalize("центральный банк"), "ЦБ");
    }

    #[test]
    fn test_title_case_keeps_caps_tokens() {
        let c = engine();
        assert_eq!(c.canonicalize("ключевая ставка"), "Ключевая Ставка");
        assert_eq!(c.canonicalize("индекс IMOEX2"), "Индекс IMOEX2");
        assert_eq!(c.canonicalize("альфа-банк"), "Альфа-Банк");
    }

    #[test]
    fn test_abbreviation_whitelist_kept_verbatim() {
        let c = engine().with_abbreviations(["iPhone"]);
        assert_eq!(c.canonicalize("продажи iPhone"), "Продажи iPhone");
    }

    #[test]
    fn test_clean_strips_hash_quotes_and_dashes() {
        assert_eq!(clean_tag("  #«нефть»  "), "нефть");
        assert_eq!(clean_tag("Т\u{2011}Технологии"), "Т-Технологии");
        assert_eq!(clean_tag("газ   и   нефть."), "газ и нефть");
        assert_eq!(clean_tag("   "), "");
    }

    #[test]
    fn test_canonicalize_is_total() {
        let c = engine();
        assert_eq!(c.canonicalize(""), "");
        assert_eq!(c.canonicalize("###"), "");
        assert_eq!(c.canonicalize("🔥"), "🔥");
    }

    #[test]
    fn test_idempotent_outside_alias_table() {
        let c = engine();
        for raw in [
            "ключевая ставка",
            "  #нефть и газ ",
            "альфа-банк",
            "USD/RUB",
            "индекс мосбиржи 2024",
            "iphone",
            "ß-street",
            "«инфляция»",
            "нефть – газ",
            "a - b",
            "нефть -- газ",
            "- уран -",
        ] {
            let once = c.canonicalize(raw);
            let twice = c.canonicalize(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_lone_dash_collapses_to_single_space() {
        let c = engine();
        assert_eq!(c.canonicalize("нефть – газ"), "Нефть Газ");
        assert_eq!(c.canonicalize("a - b"), "A B");
    }

    #[test]
    fn test_titled_form_matching_alias_key_is_stable() {
        let mut table = AliasTable::new();
        table.insert("Нефть Газ", "НГ");
        for fold in [true, false] {
            let c = Canonicalizer::new(Arc::new(table.clone())).with_fold(fold);
            let once = c.canonicalize("нефть газ");
            assert_eq!(once, "НГ", "fold = {}", fold);
            assert_eq!(c.canonicalize(&once), once, "fold = {}", fold);
        }
    }

    #[test]
    fn test_tag_policy_drops_noise_and_dedups() {
        let c = engine();
        let tags = c.canonicalize_tags(
            [
                "нефть",
                "Нефть",
                "2024",
                "крупные",
                "на",
                "ок",
                "snowflake",
                "ЦБ",
                "центральный банк",
                "USD/RUB",
            ],
            30,
        );
        assert_eq!(tags, vec!["Нефть", "ЦБ", "USD/RUB"]);
    }

    #[test]
    fn test_tag_policy_drops_growth_prefix() {
        let c = engine();
        let tags = c.canonicalize_tags(["Рост выручки", "снижение ставки"], 30);
        assert_eq!(tags, vec!["Выручки", "Ставки"]);
    }

    #[test]
    fn test_tag_policy_merges_compounds() {
        let c = engine();
        let tags = c.canonicalize_tags(["Первичный", "Нефть", "рынок"], 30);
        assert_eq!(tags, vec!["Нефть", "Первичный Рынок"]);
    }

    #[test]
    fn test_generic_tags_dropped_from_large_sets() {
        let c = engine();
        let raw = [
            "Нефть", "Газ", "Уран", "Новости", "Бизнес", "Сбербанк", "Газпром",
        ];
        let tags = c.canonicalize_tags(raw, 30);
        assert!(!tags.contains(&"Новости".to_string()));
        assert!(!tags.contains(&"Бизнес".to_string()));
        assert_eq!(tags.len(), 5);

        let small = c.canonicalize_tags(["Нефть", "Новости"], 30);
        assert_eq!(small, vec!["Нефть", "Новости"]);
    }

    #[test]
    fn test_tag_policy_caps_count() {
        let c = engine();
        let tags = c.canonicalize_tags(["Нефть", "Газ", "Медь", "Уран"], 2);
        assert_eq!(tags, vec!["Нефть", "Газ"]);
    }
}
