//! Alias table: surface strings mapped to canonical tags.
//!
//! The table is layered. Later layers overwrite earlier ones:
//!
//! 1. the built-in synonym list ([`DEFAULT_ALIASES`]),
//! 2. rows in the `tag_aliases` table (added with `chan aliases add`),
//! 3. the JSON file at `tagging.aliases_path`,
//! 4. the `TAG_ALIASES_JSON` environment variable.
//!
//! Each alias resolves to exactly one canonical. When a layer remaps an
//! alias that an earlier layer already mapped elsewhere, the new mapping
//! wins and the remap is recorded as an [`AliasConflict`]. With
//! `tagging.strict_aliases = true` any recorded conflict fails the load.
//!
//! JSON overrides accept three shapes:
//!
//! ```json
//! {"цб": "ЦБ", "банк россии": "ЦБ"}
//! {"ЦБ": ["цб", "банк россии"]}
//! [{"alias": "цб", "canonical": "ЦБ"}]
//! ```
//!
//! [`AliasStore`] holds the active table behind an `Arc` so the tagging
//! loop can swap in a reloaded table between batches without blocking
//! readers.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::canonical::clean_tag;
use crate::config::{Config, TaggingConfig};
use crate::db;

/// Environment variable holding a JSON alias override.
pub const ALIASES_ENV: &str = "TAG_ALIASES_JSON";

/// Built-in synonyms, `(alias, canonical)`.
pub const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("цб", "ЦБ"),
    ("центральный банк", "ЦБ"),
    ("central bank", "ЦБ"),
    ("central bank of russia", "ЦБ"),
    ("банк россии", "ЦБ"),
    ("бпла", "БПЛА"),
    ("аси", "АСИ"),
    ("рф", "РФ"),
    ("урале", "Урал"),
    ("t-technologies", "Т-Технологии"),
    ("alfa investments", "Альфа-Инвестиции"),
    ("alfa-investments", "Альфа-Инвестиции"),
    ("alpha investments", "Альфа-Инвестиции"),
    ("alpha-investments", "Альфа-Инвестиции"),
    ("alfa investment", "Альфа-Инвестиции"),
    ("alpha investment", "Альфа-Инвестиции"),
    ("альфа инвестиции", "Альфа-Инвестиции"),
    ("альфаиндекс", "Альфа-Индекс"),
    ("альфа индекс", "Альфа-Индекс"),
    ("дом.рф", "ДОМ.РФ"),
    ("valutnye", "Валютные"),
    ("valyutnye", "Валютные"),
    ("что купить", "Что Купить"),
    ("чтокупить", "Что Купить"),
    ("сельгдар", "Селигдар"),
    ("аэрофлота", "Аэрофлот"),
    ("сербанк", "Сбербанк"),
    ("соединенные штаты", "США"),
    ("соединённые штаты", "США"),
    ("сша", "США"),
    ("рынк", "Рынок"),
    ("рынки", "Рынок"),
    ("цены", "Цены"),
    ("дефисит", "Дефицит"),
    ("geopolitica", "Геополитика"),
    ("мосбиржи", "Мосбиржа"),
    ("озона", "Озон"),
    ("совкомбанка", "Совкомбанк"),
    ("полюса", "Полюс"),
    ("дзень", "Дзен"),
    ("драгметалы", "Драгметаллы"),
    ("икс 5", "ИКС 5"),
    ("глоракс", "Глоракс"),
    ("мд медикал груп", "МД Медикал Груп"),
    ("ипо", "IPO"),
    ("ipo", "IPO"),
    ("татнефти", "Татнефть"),
    ("ростелекома", "Ростелеком"),
    ("пика", "ПИК"),
    ("банка санкт-петербург", "Банк Санкт-Петербург"),
    ("эн+ груп", "ЭН+ Груп"),
    ("минцифра", "Минцифры"),
    ("keystavka", "Ключевая Ставка"),
];

/// An alias that was remapped while building the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasConflict {
    pub alias: String,
    pub previous: String,
    pub canonical: String,
}

/// Immutable alias lookup table.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    exact: HashMap<String, String>,
    folded: HashMap<String, String>,
    conflicts: Vec<AliasConflict>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with [`DEFAULT_ALIASES`].
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for (alias, canonical) in DEFAULT_ALIASES {
            table.insert(alias, canonical);
        }
        table
    }

    /// Map `alias` to `canonical`, overwriting any earlier mapping.
    ///
    /// Returns `false` when either side is empty after cleaning.
    pub fn insert(&mut self, alias: &str, canonical: &str) -> bool {
        let key = clean_tag(alias);
        let canonical = clean_tag(canonical);
        if key.is_empty() || canonical.is_empty() {
            return false;
        }

        let folded = fold_key(&key);
        if let Some(previous) = self.exact.get(&key) {
            if *previous != canonical {
                tracing::warn!(
                    alias = %key,
                    previous = %previous,
                    canonical = %canonical,
                    "alias remapped"
                );
                self.record_conflict(&key, previous.clone(), &canonical);
            }
        } else if let Some(previous) = self.folded.get(&folded) {
            // A different spelling already owns the folded key.
            if *previous != canonical {
                tracing::warn!(
                    alias = %key,
                    folded = %folded,
                    previous = %previous,
                    canonical = %canonical,
                    "folded alias remapped"
                );
                self.record_conflict(&key, previous.clone(), &canonical);
            }
        }

        self.folded.insert(folded, canonical.clone());
        self.exact.insert(key, canonical);
        true
    }

    fn record_conflict(&mut self, alias: &str, previous: String, canonical: &str) {
        self.conflicts.push(AliasConflict {
            alias: alias.to_string(),
            previous,
            canonical: canonical.to_string(),
        });
    }

    /// Merge a JSON override. Returns the number of aliases added.
    pub fn merge_json(&mut self, raw: &str) -> Result<usize> {
        let data: Value = serde_json::from_str(raw).context("alias JSON is not valid JSON")?;
        let mut added = 0usize;

        match data {
            Value::Object(map) => {
                for (key, value) in map {
                    match value {
                        Value::String(canonical) => {
                            added += usize::from(self.insert(&key, &canonical));
                        }
                        Value::Array(items) => {
                            for item in items.iter().filter_map(Value::as_str) {
                                added += usize::from(self.insert(item, &key));
                            }
                        }
                        _ => {}
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    let alias = item.get("alias").and_then(Value::as_str).unwrap_or("");
                    let canonical = item.get("canonical").and_then(Value::as_str).unwrap_or("");
                    added += usize::from(self.insert(alias, canonical));
                }
            }
            _ => bail!("alias JSON must be an object or an array"),
        }

        Ok(added)
    }

    /// Exact lookup of an already cleaned string.
    pub fn lookup_exact(&self, cleaned: &str) -> Option<&str> {
        self.exact.get(cleaned).map(String::as_str)
    }

    /// Lookup on the lowercased, transliterated key.
    pub fn lookup_folded(&self, cleaned: &str) -> Option<&str> {
        self.folded.get(&fold_key(cleaned)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    pub fn conflicts(&self) -> &[AliasConflict] {
        &self.conflicts
    }

    /// All `(alias, canonical)` pairs sorted by alias.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .exact
            .iter()
            .map(|(a, c)| (a.as_str(), c.as_str()))
            .collect();
        out.sort();
        out
    }
}

/// Lowercase and transliterate Cyrillic to Latin.
pub fn fold_key(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars().flat_map(char::to_lowercase) {
        match ch {
            'а' => out.push('a'),
            'б' => out.push('b'),
            'в' => out.push('v'),
            'г' => out.push('g'),
            'д' => out.push('d'),
            'е' | 'ё' | 'э' => out.push('e'),
            'ж' => out.push_str("zh"),
            'з' => out.push('z'),
            'и' | 'й' => out.push('i'),
            'к' => out.push('k'),
            'л' => out.push('l'),
            'м' => out.push('m'),
            'н' => out.push('n'),
            'о' => out.push('o'),
            'п' => out.push('p'),
            'р' => out.push('r'),
            'с' => out.push('s'),
            'т' => out.push('t'),
            'у' => out.push('u'),
            'ф' => out.push('f'),
            'х' => out.push('h'),
            'ц' => out.push_str("ts"),
            'ч' => out.push_str("ch"),
            'ш' | 'щ' => out.push_str("sh"),
            'ы' => out.push('y'),
            'ю' => out.push_str("yu"),
            'я' => out.push_str("ya"),
            other => out.push(other),
        }
    }
    out
}

// ============ Loading ============

/// Build the layered table from defaults, the database, the alias file
/// and the environment.
pub async fn load_alias_table(
    config: &TaggingConfig,
    pool: Option<&SqlitePool>,
) -> Result<AliasTable> {
    let mut table = AliasTable::with_defaults();

    if let Some(pool) = pool {
        for (alias, canonical) in fetch_stored_aliases(pool).await? {
            table.insert(&alias, &canonical);
        }
    }

    if let Some(path) = &config.aliases_path {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read alias file: {}", path.display()))?;
        let added = table
            .merge_json(&raw)
            .with_context(|| format!("Invalid alias file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), added, "alias file merged");
    }

    if let Ok(raw) = std::env::var(ALIASES_ENV) {
        if !raw.trim().is_empty() {
            let added = table
                .merge_json(&raw)
                .with_context(|| format!("Invalid {}", ALIASES_ENV))?;
            tracing::debug!(added, "alias env override merged");
        }
    }

    if config.strict_aliases && !table.conflicts().is_empty() {
        let first = &table.conflicts()[0];
        bail!(
            "{} alias conflict(s); first: '{}' maps to both '{}' and '{}'",
            table.conflicts().len(),
            first.alias,
            first.previous,
            first.canonical
        );
    }

    Ok(table)
}

async fn fetch_stored_aliases(pool: &SqlitePool) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query("SELECT alias, canonical FROM tag_aliases ORDER BY updated_at, alias")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("alias"), row.get("canonical")))
        .collect())
}

/// Persist an alias row. An existing alias is repointed.
pub async fn store_alias(pool: &SqlitePool, alias: &str, canonical: &str) -> Result<()> {
    let alias = clean_tag(alias);
    let canonical = clean_tag(canonical);
    if alias.is_empty() || canonical.is_empty() {
        bail!("alias and canonical must be non-empty");
    }

    sqlx::query(
        r#"
        INSERT INTO tag_aliases (alias, canonical, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(alias) DO UPDATE SET
            canonical = excluded.canonical,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&alias)
    .bind(&canonical)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(())
}

// ============ Hot-reloadable holder ============

/// Shared, swappable alias table.
#[derive(Debug, Default)]
pub struct AliasStore {
    current: RwLock<Arc<AliasTable>>,
}

impl AliasStore {
    pub fn new(table: AliasTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// The table in effect right now. Callers keep it for a whole batch.
    pub fn snapshot(&self) -> Arc<AliasTable> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, table: AliasTable) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(table);
    }

    /// Rebuild from all layers and swap it in. On error the previous
    /// table stays active.
    pub async fn reload(&self, config: &TaggingConfig, pool: Option<&SqlitePool>) -> Result<usize> {
        let table = load_alias_table(config, pool).await?;
        let len = table.len();
        self.replace(table);
        Ok(len)
    }
}

// ============ CLI ============

pub async fn run_aliases_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let table = load_alias_table(&config.tagging, Some(&pool)).await?;
    pool.close().await;

    for (alias, canonical) in table.entries() {
        println!("{:<32} -> {}", alias, canonical);
    }
    println!();
    println!("{} aliases", table.len());
    Ok(())
}

/// Load every layer and report conflicting aliases. Fails when any exist.
pub async fn run_aliases_check(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let mut lenient = config.tagging.clone();
    lenient.strict_aliases = false;
    let table = load_alias_table(&lenient, Some(&pool)).await?;
    pool.close().await;

    println!("aliases check");
    println!("  entries: {}", table.len());
    println!("  conflicts: {}", table.conflicts().len());
    for c in table.conflicts() {
        println!("    '{}': '{}' -> '{}'", c.alias, c.previous, c.canonical);
    }
    if !table.conflicts().is_empty() {
        bail!("alias table has {} conflict(s)", table.conflicts().len());
    }
    println!("ok");
    Ok(())
}

pub async fn run_aliases_add(config: &Config, alias: &str, canonical: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    store_alias(&pool, alias, canonical).await?;
    pool.close().await;
    println!("alias '{}' -> '{}' stored", clean_tag(alias), clean_tag(canonical));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_alias_file_merges() {
        let mut table = AliasTable::new();
        let added = table
            .merge_json(include_str!("../config/aliases.example.json"))
            .unwrap();
        assert_eq!(added, 8);
        assert_eq!(table.lookup_exact("moex"), Some("Мосбиржа"));
    }

    #[test]
    fn test_defaults_loaded() {
        let table = AliasTable::with_defaults();
        assert_eq!(table.lookup_exact("цб"), Some("ЦБ"));
        assert_eq!(table.lookup_exact("ipo"), Some("IPO"));
        assert!(table.conflicts().is_empty());
    }

    #[test]
    fn test_fold_key_transliterates() {
        assert_eq!(fold_key("ЦБ"), "tsb");
        assert_eq!(fold_key("Ключевая"), "klyuchevaya");
        assert_eq!(fold_key("IPO"), "ipo");
    }

    #[test]
    fn test_folded_lookup_matches_latin_spelling() {
        let table = AliasTable::with_defaults();
        // "valyutnye" is stored; the Cyrillic spelling folds onto it.
        assert_eq!(table.lookup_folded("Валютные"), Some("Валютные"));
        assert_eq!(table.lookup_folded("Банк России"), Some("ЦБ"));
    }

    #[test]
    fn test_merge_alias_to_canonical_object() {
        let mut table = AliasTable::new();
        let added = table.merge_json(r#"{"ии": "ИИ", "нейросети": "ИИ"}"#).unwrap();
        assert_eq!(added, 2);
        assert_eq!(table.lookup_exact("нейросети"), Some("ИИ"));
    }

    #[test]
    fn test_merge_canonical_to_list_object() {
        let mut table = AliasTable::new();
        table
            .merge_json(r#"{"Нефть": ["brent", "urals", 42]}"#)
            .unwrap();
        assert_eq!(table.lookup_exact("brent"), Some("Нефть"));
        assert_eq!(table.lookup_exact("urals"), Some("Нефть"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_merge_pair_list() {
        let mut table = AliasTable::new();
        table
            .merge_json(r#"[{"alias": "опек", "canonical": "ОПЕК"}, {"alias": ""}]"#)
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup_exact("опек"), Some("ОПЕК"));
    }

    #[test]
    fn test_merge_rejects_scalar() {
        let mut table = AliasTable::new();
        assert!(table.merge_json("42").is_err());
        assert!(table.merge_json("{not json").is_err());
    }

    #[test]
    fn test_remap_is_last_write_wins_and_recorded() {
        let mut table = AliasTable::new();
        table.insert("нефть", "Нефть");
        table.insert("нефть", "Brent");
        assert_eq!(table.lookup_exact("нефть"), Some("Brent"));
        assert_eq!(
            table.conflicts(),
            &[AliasConflict {
                alias: "нефть".to_string(),
                previous: "Нефть".to_string(),
                canonical: "Brent".to_string(),
            }]
        );
    }

    #[test]
    fn test_folded_key_collision_is_recorded() {
        let mut table = AliasTable::new();
        table.insert("Газпром", "Газпром");
        table.insert("gazprom", "GAZP");
        assert_eq!(table.lookup_folded("ГАЗПРОМ"), Some("GAZP"));
        assert_eq!(table.conflicts().len(), 1);
        assert_eq!(table.conflicts()[0].alias, "gazprom");
        assert_eq!(table.conflicts()[0].previous, "Газпром");

        // Spellings that fold together onto one canonical do not conflict.
        let mut same = AliasTable::new();
        same.insert("valyutnye", "Валютные");
        same.insert("Валютные", "Валютные");
        assert!(same.conflicts().is_empty());
    }

    #[test]
    fn test_same_mapping_twice_is_not_a_conflict() {
        let mut table = AliasTable::new();
        table.insert("сша", "США");
        table.insert("  сша ", "США");
        assert!(table.conflicts().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_store_swaps_snapshot() {
        let store = AliasStore::new(AliasTable::new());
        let before = store.snapshot();
        let mut next = AliasTable::new();
        next.insert("ии", "ИИ");
        store.replace(next);
        assert!(before.is_empty());
        assert_eq!(store.snapshot().lookup_exact("ии"), Some("ИИ"));
    }
}
