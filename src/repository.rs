//! On-disk persistence for fetched and processed message datasets.
//!
//! Both caches are plain JSON files with a sidecar `.meta.json`. Loading is
//! forgiving: a missing or unreadable cache is reported as `None` (and
//! logged), never as an error, so callers simply fall back to refetching.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::models::{Corpus, MessagesBundle, RawMessage, Record};

#[derive(Debug, Serialize, Deserialize)]
struct RawMeta {
    fetched_at: DateTime<Utc>,
    etag: Option<String>,
    total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcessedMeta {
    processed_at: DateTime<Utc>,
    source_total: usize,
    processed_total: usize,
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(value)
}

/// Cache of the raw upstream bundle, including its `ETag`.
pub struct RawMessageCache {
    path: PathBuf,
}

impl RawMessageCache {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            path: storage.raw_messages_path(),
        }
    }

    pub fn load(&self) -> Option<MessagesBundle> {
        let meta_path = meta_path(&self.path);
        if !self.path.exists() || !meta_path.exists() {
            return None;
        }
        let loaded = read_json::<RawMeta>(&meta_path)
            .and_then(|meta| read_json::<Vec<RawMessage>>(&self.path).map(|m| (meta, m)));
        match loaded {
            Ok((_, messages)) if messages.is_empty() => None,
            Ok((meta, messages)) => {
                tracing::info!(count = messages.len(), etag = ?meta.etag, "cache.load");
                Some(MessagesBundle {
                    total: if meta.total == 0 { messages.len() } else { meta.total },
                    messages,
                    etag: meta.etag,
                    fetched_at: meta.fetched_at,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache.metadata_invalid");
                None
            }
        }
    }

    pub fn save(&self, bundle: &MessagesBundle) -> Result<()> {
        write_json(&self.path, &bundle.messages)?;
        write_json(
            &meta_path(&self.path),
            &RawMeta {
                fetched_at: bundle.fetched_at,
                etag: bundle.etag.clone(),
                total: bundle.total,
            },
        )?;
        tracing::info!(path = %self.path.display(), count = bundle.messages.len(), "cache.save");
        Ok(())
    }
}

/// Persisted, normalized corpus.
pub struct CorpusRepository {
    path: PathBuf,
}

impl CorpusRepository {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            path: storage.processed_messages_path(),
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, corpus: &Corpus) -> Result<()> {
        write_json(&self.path, &corpus.records)?;
        write_json(
            &meta_path(&self.path),
            &ProcessedMeta {
                processed_at: corpus.processed_at,
                source_total: corpus.source_total,
                processed_total: corpus.records.len(),
            },
        )?;
        tracing::info!(
            path = %self.path.display(),
            processed = corpus.records.len(),
            source_total = corpus.source_total,
            "processed.save"
        );
        Ok(())
    }

    pub fn load(&self) -> Option<Corpus> {
        let meta_path = meta_path(&self.path);
        if !self.path.exists() || !meta_path.exists() {
            return None;
        }
        let loaded = read_json::<ProcessedMeta>(&meta_path)
            .and_then(|meta| read_json::<Vec<Record>>(&self.path).map(|r| (meta, r)));
        match loaded {
            Ok((meta, records)) => Some(Corpus {
                source_total: meta.source_total,
                processed_at: meta.processed_at,
                records,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "processed.load_failed");
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        for path in [self.path.clone(), meta_path(&self.path)] {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        tracing::info!("processed.cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawTimestamp;
    use tempfile::TempDir;

    fn storage(tmp: &TempDir) -> StorageConfig {
        StorageConfig {
            data_dir: tmp.path().to_path_buf(),
            index_dir: tmp.path().join("vectorstore"),
            reports_dir: tmp.path().join("reports"),
        }
    }

    fn record(id: &str) -> Record {
        Record {
            id: id.to_string(),
            author_id: "u1".to_string(),
            author_name: "Sam".to_string(),
            timestamp: Utc::now(),
            text_original: "hi there".to_string(),
            text_clean: "hi there".to_string(),
            temporal_key: "2024-01-01".to_string(),
            token_count: 2,
            entities: Vec::new(),
        }
    }

    #[test]
    fn test_corpus_save_load() {
        let tmp = TempDir::new().unwrap();
        let repo = CorpusRepository::new(&storage(&tmp));
        assert!(repo.load().is_none());

        let corpus = Corpus {
            records: vec![record("a"), record("b")],
            source_total: 3,
            processed_at: Utc::now(),
        };
        repo.save(&corpus).unwrap();
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.records, corpus.records);
        assert_eq!(loaded.source_total, 3);

        repo.clear().unwrap();
        assert!(repo.load().is_none());
    }

    #[test]
    fn test_corrupt_corpus_is_none() {
        let tmp = TempDir::new().unwrap();
        let repo = CorpusRepository::new(&storage(&tmp));
        repo.save(&Corpus {
            records: vec![record("a")],
            source_total: 1,
            processed_at: Utc::now(),
        })
        .unwrap();
        std::fs::write(repo.path(), "{not json").unwrap();
        assert!(repo.load().is_none());
    }

    #[test]
    fn test_raw_cache_keeps_etag() {
        let tmp = TempDir::new().unwrap();
        let cache = RawMessageCache::new(&storage(&tmp));
        let bundle = MessagesBundle {
            total: 10,
            messages: vec![RawMessage {
                id: "a".to_string(),
                user_id: "u".to_string(),
                user_name: "N".to_string(),
                timestamp: RawTimestamp::parse("2024-01-01T00:00:00").unwrap(),
                message: "hello".to_string(),
            }],
            etag: Some("\"abc\"".to_string()),
            fetched_at: Utc::now(),
        };
        cache.save(&bundle).unwrap();
        let loaded = cache.load().unwrap();
        assert_eq!(loaded.etag.as_deref(), Some("\"abc\""));
        assert_eq!(loaded.total, 10);
        assert_eq!(loaded.messages.len(), 1);
    }
}
