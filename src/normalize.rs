//! Corpus normalization.
//!
//! Turns raw upstream messages into a deduplicated [`Corpus`]:
//!
//! 1. Normalize every timestamp to UTC (naive values are assumed UTC).
//! 2. Sort by timestamp (stable) and keep the last occurrence of each id,
//!    so the record with the latest timestamp survives.
//! 3. Clean text: NFKC normalization, whitespace runs collapsed, trimmed.
//! 4. Count whitespace-delimited tokens and tag entities (best-effort).

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use unicode_normalization::UnicodeNormalization;

use crate::config::{Config, EntitiesConfig};
use crate::models::{Corpus, EntitySpan, RawMessage, Record};
use crate::repository::CorpusRepository;
use crate::source;

/// Best-effort named-entity tagger.
///
/// Failures are swallowed by the normalizer: a failing extractor yields an
/// empty entity list for that record.
pub trait EntityExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Result<Vec<EntitySpan>>;
}

/// Extractor used when no entity source is configured.
pub struct NoEntities;

impl EntityExtractor for NoEntities {
    fn extract(&self, _text: &str) -> Result<Vec<EntitySpan>> {
        Ok(Vec::new())
    }
}

/// Dictionary-based extractor: matches configured surface forms on word
/// boundaries, case-insensitively, and reports them with their label.
pub struct GazetteerExtractor {
    entries: Vec<(String, String, String)>, // (lowercased form, surface form, label)
}

impl GazetteerExtractor {
    pub fn new(config: &EntitiesConfig) -> Self {
        let mut entries = Vec::new();
        for (label, forms) in &config.gazetteer {
            for form in forms {
                let form = form.trim();
                if form.is_empty() {
                    continue;
                }
                entries.push((form.to_lowercase(), form.to_string(), label.clone()));
            }
        }
        // Longest forms first so "New York City" wins over "York".
        entries.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EntityExtractor for GazetteerExtractor {
    fn extract(&self, text: &str) -> Result<Vec<EntitySpan>> {
        let lower = text.to_lowercase();
        let mut taken: Vec<(usize, usize)> = Vec::new();
        let mut found: Vec<(usize, EntitySpan)> = Vec::new();

        for (needle, surface, label) in &self.entries {
            let mut from = 0;
            while let Some(pos) = lower[from..].find(needle.as_str()) {
                let start = from + pos;
                let end = start + needle.len();
                from = end;
                if !is_word_boundary(&lower, start, end) {
                    continue;
                }
                if taken.iter().any(|&(s, e)| start < e && s < end) {
                    continue;
                }
                taken.push((start, end));
                found.push((
                    start,
                    EntitySpan {
                        text: surface.clone(),
                        label: label.clone(),
                    },
                ));
            }
        }

        found.sort_by_key(|(start, _)| *start);
        Ok(found.into_iter().map(|(_, span)| span).collect())
    }
}

fn is_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

/// Builds the configured extractor.
pub fn create_extractor(config: &EntitiesConfig) -> Box<dyn EntityExtractor> {
    let gazetteer = GazetteerExtractor::new(config);
    if gazetteer.is_empty() {
        Box::new(NoEntities)
    } else {
        Box::new(gazetteer)
    }
}

/// Deduplicates, cleans and enriches raw messages.
pub struct Normalizer {
    extractor: Box<dyn EntityExtractor>,
}

impl Normalizer {
    pub fn new(extractor: Box<dyn EntityExtractor>) -> Self {
        Self { extractor }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(create_extractor(&config.entities))
    }

    /// Normalize `messages` into a corpus stamped with `processed_at`.
    pub fn normalize(
        &self,
        messages: &[RawMessage],
        source_total: usize,
        processed_at: DateTime<Utc>,
    ) -> Corpus {
        let deduped = deduplicate(messages);
        let records: Vec<Record> = deduped
            .into_iter()
            .map(|(message, timestamp)| self.transform(message, timestamp))
            .collect();

        tracing::info!(
            processed = records.len(),
            source_total,
            "preprocess.completed"
        );

        Corpus {
            records,
            source_total,
            processed_at,
        }
    }

    fn transform(&self, message: &RawMessage, timestamp: DateTime<Utc>) -> Record {
        let text_clean = clean_text(&message.message);
        let token_count = count_tokens(&text_clean);
        let entities = match self.extractor.extract(&message.message) {
            Ok(entities) => entities,
            Err(e) => {
                tracing::warn!(id = %message.id, error = %e, "preprocess.entities_failed");
                Vec::new()
            }
        };

        Record {
            id: message.id.clone(),
            author_id: message.user_id.clone(),
            author_name: message.user_name.clone(),
            timestamp,
            text_original: message.message.clone(),
            temporal_key: timestamp.date_naive().format("%Y-%m-%d").to_string(),
            text_clean,
            token_count,
            entities,
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Box::new(NoEntities))
    }
}

/// Keep one message per id: the one with the latest UTC timestamp.
///
/// Messages are stably sorted by timestamp and replayed in order, each one
/// overwriting any earlier message with the same id. Output order is the
/// order in which each id was first seen during that replay.
pub fn deduplicate(messages: &[RawMessage]) -> Vec<(&RawMessage, DateTime<Utc>)> {
    let mut ordered: Vec<(&RawMessage, DateTime<Utc>)> = messages
        .iter()
        .map(|m| (m, m.timestamp.to_utc()))
        .collect();
    ordered.sort_by_key(|(_, ts)| *ts);

    let mut slots: HashMap<&str, usize> = HashMap::new();
    let mut deduped: Vec<(&RawMessage, DateTime<Utc>)> = Vec::with_capacity(ordered.len());
    for (message, ts) in ordered {
        match slots.get(message.id.as_str()) {
            Some(&slot) => deduped[slot] = (message, ts),
            None => {
                slots.insert(message.id.as_str(), deduped.len());
                deduped.push((message, ts));
            }
        }
    }

    tracing::info!(
        before = messages.len(),
        after = deduped.len(),
        "preprocess.deduplicate"
    );
    deduped
}

/// NFKC-normalize, collapse whitespace runs to one space, and trim.
pub fn clean_text(content: &str) -> String {
    let normalized: String = content.nfkc().collect();
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Number of non-empty whitespace-delimited tokens.
pub fn count_tokens(content: &str) -> usize {
    content.split_whitespace().count()
}

/// Fetch messages from the configured source and normalize them.
///
/// Unless `force_refresh` is set, a persisted corpus holding at least as many
/// records as the fetched bundle is reused instead of being rebuilt.
pub async fn preprocess(config: &Config, force_refresh: bool) -> Result<Corpus> {
    let repository = CorpusRepository::new(&config.storage);
    let source = source::create_source(config)?;
    let bundle = source.fetch(force_refresh).await?;

    if !force_refresh {
        if let Some(cached) = repository.load() {
            if cached.len() >= bundle.messages.len() {
                tracing::info!(count = cached.len(), "preprocess.cached");
                return Ok(cached);
            }
        }
    }

    let normalizer = Normalizer::from_config(config);
    let corpus = normalizer.normalize(&bundle.messages, bundle.total, Utc::now());
    repository.save(&corpus)?;
    Ok(corpus)
}

/// The persisted corpus if present (and not forced), else [`preprocess`].
pub async fn load_or_build_corpus(config: &Config, force_refresh: bool) -> Result<Corpus> {
    if !force_refresh {
        if let Some(cached) = CorpusRepository::new(&config.storage).load() {
            return Ok(cached);
        }
    }
    preprocess(config, force_refresh).await
}

/// `mqa preprocess` entry point.
pub async fn run_preprocess(config: &Config, force: bool) -> Result<()> {
    let corpus = preprocess(config, force).await?;
    println!("preprocess");
    println!("  source messages: {}", corpus.source_total);
    println!("  records: {}", corpus.len());
    println!(
        "  processed at: {}",
        corpus.processed_at.format("%Y-%m-%dT%H:%M:%SZ")
    );
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawTimestamp;
    use anyhow::bail;
    use std::collections::BTreeMap;

    fn raw(id: &str, ts: &str, text: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            user_id: "u1".to_string(),
            user_name: "Layla".to_string(),
            timestamp: RawTimestamp::parse(ts).unwrap(),
            message: text.to_string(),
        }
    }

    #[test]
    fn test_dedup_keeps_latest_timestamp() {
        let messages = vec![
            raw("a", "2024-03-01T10:00:00Z", "newest"),
            raw("a", "2024-01-01T10:00:00Z", "oldest"),
            raw("b", "2024-02-01T10:00:00", "only"),
            raw("a", "2024-02-01T10:00:00+00:00", "middle"),
        ];
        let corpus = Normalizer::default().normalize(&messages, messages.len(), Utc::now());
        assert_eq!(corpus.len(), 2);
        let a = corpus.records.iter().find(|r| r.id == "a").unwrap();
        assert_eq!(a.text_clean, "newest");
    }

    #[test]
    fn test_dedup_compares_in_utc() {
        // 09:00+00:00 is later than 10:00+02:00 (= 08:00Z).
        let messages = vec![
            raw("a", "2024-01-01T09:00:00Z", "utc nine"),
            raw("a", "2024-01-01T10:00:00+02:00", "cest ten"),
        ];
        let corpus = Normalizer::default().normalize(&messages, 2, Utc::now());
        assert_eq!(corpus.records[0].text_clean, "utc nine");
    }

    #[test]
    fn test_ids_unique_after_normalize() {
        let messages: Vec<RawMessage> = (0..20)
            .map(|i| raw(&format!("m{}", i % 7), "2024-01-01T00:00:00Z", "x"))
            .collect();
        let corpus = Normalizer::default().normalize(&messages, 20, Utc::now());
        let mut ids: Vec<&str> = corpus.records.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), corpus.len());
        assert_eq!(corpus.len(), 7);
    }

    #[test]
    fn test_clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  hello \t\n  world  "), "hello world");
    }

    #[test]
    fn test_clean_text_nfkc() {
        // Fullwidth Latin and the "ﬁ" ligature fold to ASCII.
        assert_eq!(clean_text("Ｌｏｎｄｏｎ ﬁne"), "London fine");
    }

    #[test]
    fn test_token_count() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("Planning my trip to London in June!"), 7);
    }

    #[test]
    fn test_temporal_key_is_utc_date() {
        let messages = vec![raw("a", "2024-01-01T23:30:00-02:00", "late")];
        let corpus = Normalizer::default().normalize(&messages, 1, Utc::now());
        assert_eq!(corpus.records[0].temporal_key, "2024-01-02");
    }

    struct FailingExtractor;

    impl EntityExtractor for FailingExtractor {
        fn extract(&self, _text: &str) -> Result<Vec<EntitySpan>> {
            bail!("model not loaded")
        }
    }

    #[test]
    fn test_failing_extractor_yields_empty_entities() {
        let normalizer = Normalizer::new(Box::new(FailingExtractor));
        let corpus = normalizer.normalize(&[raw("a", "2024-01-01T00:00:00Z", "x")], 1, Utc::now());
        assert_eq!(corpus.len(), 1);
        assert!(corpus.records[0].entities.is_empty());
    }

    #[test]
    fn test_gazetteer_matches_word_boundaries() {
        let mut gazetteer = BTreeMap::new();
        gazetteer.insert(
            "GPE".to_string(),
            vec!["London".to_string(), "New York".to_string(), "York".to_string()],
        );
        let extractor = GazetteerExtractor::new(&EntitiesConfig { gazetteer });
        let spans = extractor
            .extract("From new york to LONDON, not Londonderry")
            .unwrap();
        let texts: Vec<&str> = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["New York", "London"]);
        assert!(spans.iter().all(|s| s.label == "GPE"));
    }
}
