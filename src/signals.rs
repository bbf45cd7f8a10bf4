//! Heuristic signals inferred from the post text and its tags.
//!
//! Models often omit `emoji` or `code`, or answer with weak values. The
//! inferred signals fill those gaps:
//!
//! - [`merge_code`] keeps, per dimension, the stronger of the model's and
//!   the inferred value (`sentiment` by magnitude, the rest by maximum).
//! - [`merge_emoji`] keeps a model emoji only when the heuristics agree or
//!   it is a tone marker, then appends the inferred ones.
//!
//! [`enrich`] applies both to a parsed [`TagPayload`], so every tagged
//! message ends up with a full `code` map and at least one emoji.

use std::collections::BTreeMap;

use crate::gateway::payload::{filter_emoji, CODE_KEYS, MAX_EMOJI};
use crate::gateway::TagPayload;

/// Model emoji kept even when nothing in the text backs them.
const TONE_EMOJI: &[&str] = &["📰", "⚠️", "😡", "😢", "😊", "🎉", "🧠"];

/// Country flags and the words that name them. A trailing `*` matches any
/// word with that prefix; other keys must match whole words.
const FLAGS: &[(&str, &[&str])] = &[
    ("🇷🇺", &["росси*", "рф"]),
    ("🇺🇸", &["сша", "usa", "united states", "америк*"]),
    ("🇨🇳", &["китай*", "кнр", "china"]),
    ("🇪🇺", &["евросоюз", "европа", "eu", "eurozone"]),
    ("🇬🇧", &["великобрит*", "британ*", "uk", "англи*"]),
    ("🇩🇪", &["герман*", "немец*", "deutsch*"]),
    ("🇫🇷", &["франц*", "france"]),
    ("🇮🇹", &["итал*", "italy"]),
    ("🇯🇵", &["япон*", "japan"]),
    ("🇰🇷", &["коре*", "korea"]),
    ("🇮🇳", &["индия", "индийск*", "india"]),
    ("🇧🇷", &["бразил*", "brazil"]),
    ("🇹🇷", &["турц*", "turkey"]),
    ("🇺🇦", &["украин*", "ukraine"]),
    ("🇨🇦", &["канада", "canada"]),
    ("🇦🇺", &["австрал*", "australia"]),
    ("🇸🇦", &["сауд*", "ksa", "saudi"]),
    ("🇦🇪", &["оаэ", "эмират*", "uae"]),
    ("🇮🇱", &["израил*", "israel"]),
    ("🇮🇷", &["иран", "iran"]),
    ("🇮🇶", &["ирак", "iraq"]),
    ("🇪🇬", &["египт*", "egypt"]),
    ("🇵🇱", &["польш*", "poland"]),
    ("🇨🇿", &["чех*", "czech"]),
    ("🇳🇱", &["нидерланд*", "голланд*", "netherlands"]),
    ("🇧🇪", &["бельг*", "belgium"]),
    ("🇪🇸", &["испан*", "spain"]),
    ("🇵🇹", &["португал*", "portugal"]),
    ("🇸🇪", &["швец*", "sweden"]),
    ("🇳🇴", &["норвег*", "norway"]),
    ("🇫🇮", &["финлянд*", "finland"]),
    ("🇩🇰", &["дани*", "датск*", "denmark"]),
    ("🇨🇭", &["швейцар*", "switzerland"]),
    ("🇦🇹", &["австр*", "austria"]),
    ("🇲🇽", &["мексик*", "mexico"]),
    ("🇦🇷", &["аргентин*", "argentina"]),
    ("🇨🇱", &["чили", "chile"]),
    ("🇨🇴", &["колумб*", "colombia"]),
    ("🇰🇿", &["казах*", "kazakhstan"]),
    ("🇧🇾", &["беларус*", "рб", "belarus"]),
];

/// Emoji implied by topic words found in the text or the tags.
const TOPIC_EMOJI: &[(&str, &[&str])] = &[
    ("🥇", &["золот", "gold"]),
    ("🥈", &["серебр", "silver"]),
    ("🥉", &["медь", "copper", "bronze", "бронз"]),
    ("🪙", &["платин", "паллад"]),
    ("🛢️", &["нефт", "brent", "urals"]),
    ("⛽️", &["газ", "lng"]),
    ("🪨", &["уголь", "руда", "желез", "алюмин", "никел", "литий", "кобальт", "уран"]),
    ("🪵", &["лес", "древесин", "пиломат", "лесомат"]),
    ("🌾", &["зерн", "пшениц", "ячмен", "овес"]),
    ("🌽", &["кукуруз"]),
    ("🍬", &["сахар"]),
    ("🌱", &["удобр", "агро", "аграр", "посев"]),
    ("🐄", &["мясо", "говя", "скот", "молок"]),
    ("🐟", &["рыб", "seafood"]),
    ("⚡️", &["электроэнерг", "мощност", "энергосистем"]),
    ("✈️", &["авиа", "самолет", "аэропорт"]),
    ("🛰️", &["космос", "спутник", "space"]),
    ("🏠", &["недвиж", "ипотек", "строительств"]),
    ("☢️", &["ядер", "атом", "радиац"]),
    ("📊", &["рынок", "индекс", "котиров"]),
];

const AD_MARKERS: &[&str] = &[
    "реклам", "промокод", "скидк", "купон", "подпис", "партнер", "спонсор", "купить", "заказать",
    "акция", "розыгрыш", "конкурс", "регистрац", "перейди", "ссылка",
];

/// Lowercased text prepared for substring, word-prefix and phrase matches.
struct Haystack {
    lowered: String,
    words: Vec<String>,
    spaced: String,
}

impl Haystack {
    fn new(text: &str) -> Self {
        let lowered = text.to_lowercase();
        let words: Vec<String> = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        let spaced = format!(" {} ", words.join(" "));
        Self {
            lowered,
            words,
            spaced,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.lowered.contains(key)
    }

    /// Short keys must start a word; longer ones may appear anywhere.
    fn matches(&self, key: &str) -> bool {
        if key.chars().count() <= 4 {
            self.words.iter().any(|w| w.starts_with(key))
        } else {
            self.contains(key)
        }
    }

    fn names(&self, key: &str) -> bool {
        match key.strip_suffix('*') {
            Some(prefix) => self.words.iter().any(|w| w.starts_with(prefix)),
            None => self.spaced.contains(&format!(" {} ", key)),
        }
    }
}

fn zero_code() -> BTreeMap<String, f64> {
    CODE_KEYS.iter().map(|k| (k.to_string(), 0.0)).collect()
}

fn get(code: &BTreeMap<String, f64>, key: &str) -> f64 {
    code.get(key).copied().unwrap_or(0.0)
}

// ============ Code ============

/// Signal values implied by keywords in the text and tags.
pub fn infer_code(tags: &[String], text: &str) -> BTreeMap<String, f64> {
    let text = Haystack::new(text);
    let tags = Haystack::new(&tags.join(" "));
    let any = |keys: &[&str]| keys.iter().any(|k| text.contains(k) || tags.contains(k));

    let mut code = zero_code();
    let mut set = |key: &str, value: f64| {
        code.insert(key.to_string(), value);
    };

    if any(&["срочно", "молния", "breaking", "важно", "urgent"]) {
        set("urgency", 0.8);
    }
    let market = any(&[
        "рынок", "индекс", "акци", "котиров", "s&p", "nasdaq", "dow", "imoex", "ртс",
    ]);
    if market {
        set("market", 0.7);
    }
    if any(&["инфляц", "ввп", "gdp", "безработ", "экономик", "макро"]) {
        set("macro", 0.7);
    }
    if any(&[
        "санкц", "переговор", "конфликт", "обострен", "украин", "сша", "китай", "ес", "геополит",
    ]) {
        set("geopolitics", 0.7);
    }
    if any(&[
        "нефт", "газ", "brent", "urals", "золот", "серебр", "металл", "уголь", "руда", "commod",
    ]) {
        set("commodities", 0.7);
    }
    if any(&["валют", "usd", "eur", "юань", "курс", "fx"]) {
        set("fx", 0.7);
    }
    if any(&["цб", "ставк", "ключев", "rates"]) {
        set("rates", 0.8);
    }
    if any(&["btc", "eth", "биткоин", "крипт", "blockchain", "crypto"]) {
        set("crypto", 0.8);
        set("market", if market { 0.7 } else { 0.6 });
    }

    if any(&["вырос", "рост", "прибав", "подорож", "увелич"]) {
        set("sentiment", 0.4);
    }
    if any(&["упал", "сниз", "обвал", "подешев", "просел"]) {
        set("sentiment", -0.4);
    }

    let ad = any(AD_MARKERS);
    if ad {
        set("ad", 0.85);
    }

    let mut usefulness: f64 = 0.25;
    if get(&code, "urgency") >= 0.7 {
        usefulness = usefulness.max(0.6);
    }
    if any(&["впервые", "рекорд", "аномал", "необыч"]) {
        usefulness = usefulness.max(0.6);
    }
    if any(&["отчет", "результат", "дивиден", "ipo", "ставк", "инфляц"]) {
        usefulness = usefulness.max(0.5);
    }
    if any(&["подкаст", "стрим", "интервью"]) {
        usefulness = usefulness.min(0.25);
    }
    if ad {
        usefulness = usefulness.min(0.15);
    }
    code.insert("usefulness".to_string(), usefulness);

    code
}

/// Combine model and inferred values: `sentiment` by larger magnitude,
/// everything else by maximum.
pub fn merge_code(
    base: &BTreeMap<String, f64>,
    inferred: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let mut merged = base.clone();
    for (key, value) in inferred {
        let current = get(&merged, key);
        let next = if key == "sentiment" {
            if value.abs() > current.abs() {
                *value
            } else {
                current
            }
        } else {
            current.max(*value)
        };
        merged.insert(key.clone(), next);
    }
    merged
}

// ============ Emoji ============

/// Emoji implied by the text, tags and signal values. Never empty.
pub fn infer_emoji(tags: &[String], code: &BTreeMap<String, f64>, text: &str) -> Vec<String> {
    let text = Haystack::new(text);
    let tags = Haystack::new(&tags.join(" "));
    let in_text = |keys: &[&str]| keys.iter().any(|k| text.matches(k));
    let in_any = |keys: &[&str]| keys.iter().any(|k| text.matches(k) || tags.matches(k));

    let mut out: Vec<String> = Vec::new();

    // Incidents
    if in_text(&["танкер", "судно", "корабл", "порт", "мор"]) {
        push_emoji(&mut out, "🚢");
    }
    if in_text(&["взрыв", "взорвал", "взрыво", "удар", "обстрел", "бомб", "взрывчат"]) {
        push_emoji(&mut out, "💣");
    } else if in_text(&["авар", "катастроф", "пожар"]) {
        push_emoji(&mut out, "💥");
    }

    // Direction
    if in_text(&["упал", "сниз", "паден", "обвал", "просел"]) {
        push_emoji(&mut out, "📉");
    } else if in_text(&["вырос", "поднял", "увелич", "прибав", "раст"]) {
        push_emoji(&mut out, "📈");
    } else if get(code, "market") > 0.6 {
        push_emoji(&mut out, if get(code, "sentiment") >= 0.0 { "📈" } else { "📉" });
    }

    // Commodities and sectors
    for (emoji, keys) in TOPIC_EMOJI {
        if in_any(keys) {
            push_emoji(&mut out, emoji);
        }
    }
    if get(code, "commodities") > 0.7 && !["🥇", "🛢️", "🪨"].iter().any(|e| contains_emoji(&out, e)) {
        push_emoji(&mut out, "🪙");
    }

    // Games and esports
    if in_any(&[
        "dota", "dota 2", "cs2", "cs:go", "counter-strike", "киберспорт", "esports", "гейм", "игр",
        "геймер",
    ]) {
        push_emoji(&mut out, "🎮");
    }
    if in_any(&["турнир", "чемпионат", "лига", "season", "финал", "playoff", "плей-офф"]) {
        push_emoji(&mut out, "🏆");
    }
    if in_any(&["матч", "серия", "против", "vs"]) {
        push_emoji(&mut out, "⚔️");
    }
    if in_any(&["приз", "призов", "выиграл", "побед", "миллион", "тыс"]) {
        push_emoji(&mut out, "💰");
    }

    // Geography
    for (flag, keys) in FLAGS {
        if keys.iter().any(|k| text.names(k)) {
            push_emoji(&mut out, flag);
        }
    }

    // Finance, policy, urgency
    if tags.lowered.contains('/') || get(code, "fx") > 0.6 {
        push_emoji(&mut out, "💱");
    }
    if tags.contains("банк") || tags.contains("цб") || get(code, "rates") > 0.7 {
        push_emoji(&mut out, "🏦");
    }
    if get(code, "geopolitics") > 0.6 {
        push_emoji(&mut out, "🌍");
    }
    if get(code, "urgency") > 0.7 {
        push_emoji(&mut out, "⚠️");
    }

    if out.is_empty() {
        push_emoji(&mut out, "📰");
    }
    out.truncate(MAX_EMOJI);
    out
}

/// Append an allowed emoji once, in its allow-list spelling.
fn push_emoji(out: &mut Vec<String>, emoji: &str) {
    for allowed in filter_emoji(std::iter::once(emoji)) {
        if !out.contains(&allowed) {
            out.push(allowed);
        }
    }
}

fn bare(emoji: &str) -> String {
    emoji.replace('\u{FE0F}', "")
}

fn contains_emoji(list: &[String], emoji: &str) -> bool {
    let key = bare(emoji);
    list.iter().any(|e| bare(e) == key)
}

/// Model emoji backed by the heuristics or marking tone come first, then
/// the inferred ones. Without model emoji the inferred list is used as is.
pub fn merge_emoji(model: &[String], inferred: &[String]) -> Vec<String> {
    if model.is_empty() {
        return inferred.to_vec();
    }

    let mut out: Vec<String> = Vec::new();
    for emoji in model {
        let backed = contains_emoji(inferred, emoji)
            || TONE_EMOJI.iter().any(|t| bare(t) == bare(emoji));
        if backed && !contains_emoji(&out, emoji) {
            out.push(emoji.clone());
        }
    }
    for emoji in inferred {
        if !contains_emoji(&out, emoji) {
            out.push(emoji.clone());
        }
    }
    out.truncate(MAX_EMOJI);
    out
}

/// Fill in inferred `code` and `emoji` on a parsed tagging answer.
pub fn enrich(mut payload: TagPayload, text: &str) -> TagPayload {
    let base = if payload.code.is_empty() {
        zero_code()
    } else {
        payload.code.clone()
    };
    let code = merge_code(&base, &infer_code(&payload.tags, text));
    let inferred = infer_emoji(&payload.tags, &code, text);
    payload.emoji = merge_emoji(&payload.emoji, &inferred);
    payload.code = code;
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_infer_code_from_keywords() {
        let code = infer_code(&tags(&["Нефть"]), "Срочно: Brent обвалился на 5%");
        assert_eq!(code["urgency"], 0.8);
        assert_eq!(code["commodities"], 0.7);
        assert_eq!(code["sentiment"], -0.4);
        assert_eq!(code["usefulness"], 0.6);
        assert_eq!(code["ad"], 0.0);
        assert_eq!(code.len(), CODE_KEYS.len());
    }

    #[test]
    fn test_ads_lower_usefulness() {
        let code = infer_code(&[], "Промокод на скидку, переходите по ссылке");
        assert_eq!(code["ad"], 0.85);
        assert_eq!(code["usefulness"], 0.15);
    }

    #[test]
    fn test_merge_code_prefers_stronger_values() {
        let mut base = zero_code();
        base.insert("sentiment".to_string(), 0.2);
        base.insert("market".to_string(), 0.9);
        let mut inferred = zero_code();
        inferred.insert("sentiment".to_string(), -0.4);
        inferred.insert("market".to_string(), 0.7);
        inferred.insert("rates".to_string(), 0.8);

        let merged = merge_code(&base, &inferred);
        assert_eq!(merged["sentiment"], -0.4);
        assert_eq!(merged["market"], 0.9);
        assert_eq!(merged["rates"], 0.8);

        let mut strong = zero_code();
        strong.insert("sentiment".to_string(), 0.9);
        assert_eq!(merge_code(&strong, &inferred)["sentiment"], 0.9);
    }

    #[test]
    fn test_infer_emoji_topics_and_flags() {
        let code = infer_code(&tags(&["Нефть"]), "Нефть подешевела после переговоров США и Китая");
        let emoji = infer_emoji(&tags(&["Нефть"]), &code, "Нефть подешевела после переговоров США и Китая");
        assert!(emoji.contains(&"🛢️".to_string()));
        assert!(emoji.contains(&"🇺🇸".to_string()));
        assert!(emoji.contains(&"🇨🇳".to_string()));
        assert!(emoji.contains(&"🌍".to_string()));
        assert!(emoji.len() <= MAX_EMOJI);
    }

    #[test]
    fn test_short_keys_match_word_starts_only() {
        // "мор" must not fire inside "юмор".
        let emoji = infer_emoji(&[], &zero_code(), "немного юмора");
        assert_eq!(emoji, vec!["📰".to_string()]);

        let emoji = infer_emoji(&[], &zero_code(), "танкер зашёл в морской порт");
        assert_eq!(emoji, vec!["🚢".to_string()]);
    }

    #[test]
    fn test_inferred_emoji_never_empty() {
        assert_eq!(infer_emoji(&[], &zero_code(), ""), vec!["📰".to_string()]);
    }

    #[test]
    fn test_merge_emoji_drops_unbacked_model_emoji() {
        let inferred = tags(&["🛢️", "🏦"]);
        let model = tags(&["🚀", "🏦", "😊"]);
        assert_eq!(merge_emoji(&model, &inferred), tags(&["🏦", "😊", "🛢️"]));
        assert_eq!(merge_emoji(&[], &inferred), inferred);
    }

    #[test]
    fn test_enrich_fills_missing_signals() {
        let payload = TagPayload {
            tags: tags(&["ЦБ", "Ключевая Ставка"]),
            ..Default::default()
        };
        let enriched = enrich(payload, "Банк России сохранил ключевую ставку");
        assert_eq!(enriched.code["rates"], 0.8);
        assert_eq!(enriched.code.len(), CODE_KEYS.len());
        assert!(enriched.emoji.contains(&"🏦".to_string()));
        assert!(enriched.emoji.contains(&"🇷🇺".to_string()));
        assert_eq!(enriched.tags, tags(&["ЦБ", "Ключевая Ставка"]));
    }
}
