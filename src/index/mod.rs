//! Dual index over the normalized corpus.
//!
//! An [`IndexSnapshot`] bundles the corpus with a dense ([`DenseIndex`]) and
//! a sparse ([`SparseIndex`]) index built over the same documents. The
//! [`IndexManager`] owns the current snapshot:
//!
//! - the first call loads a persisted snapshot or builds one;
//! - later calls reuse it, so nothing is rebuilt per query;
//! - a forced refresh rebuilds from a freshly fetched corpus and swaps the
//!   snapshot pointer atomically. Readers that arrive during a rebuild keep
//!   the previous snapshot; concurrent forced refreshes share one rebuild.
//!
//! On disk (`storage.index_dir`):
//!
//! ```text
//! dense.json     model, dims, ids, base64 vectors
//! sparse.json    BM25 parameters and postings
//! manifest.json  generated_at, totals, embedding model, corpus fingerprint
//! ```
//!
//! A persisted index is reused only when its fingerprint and embedding model
//! match the current corpus and provider.

pub mod dense;
pub mod sparse;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub use dense::DenseIndex;
pub use sparse::SparseIndex;

use crate::config::Config;
use crate::embedding::{embed_batched, EmbeddingProvider};
use crate::models::{Corpus, Record};
use crate::normalize::load_or_build_corpus;

const DENSE_FILE: &str = "dense.json";
const SPARSE_FILE: &str = "sparse.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Supplies the corpus the indices are built from.
#[async_trait]
pub trait CorpusProvider: Send + Sync {
    async fn corpus(&self, force_refresh: bool) -> Result<Corpus>;
}

/// Corpus from the configured source, via the processed-corpus cache.
pub struct ConfiguredCorpus {
    config: Config,
}

impl ConfiguredCorpus {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CorpusProvider for ConfiguredCorpus {
    async fn corpus(&self, force_refresh: bool) -> Result<Corpus> {
        load_or_build_corpus(&self.config, force_refresh).await
    }
}

/// A fixed, in-memory corpus.
pub struct StaticCorpus(pub Corpus);

#[async_trait]
impl CorpusProvider for StaticCorpus {
    async fn corpus(&self, _force_refresh: bool) -> Result<Corpus> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub generated_at: DateTime<Utc>,
    pub source_total: usize,
    pub processed_total: usize,
    /// `None` when dense retrieval is disabled.
    pub embedding_model: Option<String>,
    pub fingerprint: String,
}

/// SHA-256 over every record's id, timestamp and cleaned text, in corpus
/// order.
pub fn corpus_fingerprint(corpus: &Corpus) -> String {
    let mut hasher = Sha256::new();
    for record in &corpus.records {
        hasher.update(record.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(record.timestamp.to_rfc3339().as_bytes());
        hasher.update([0u8]);
        hasher.update(record.text_clean.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

/// Immutable corpus plus indices. Shared by reference between queries.
#[derive(Debug)]
pub struct IndexSnapshot {
    pub corpus: Corpus,
    pub dense: Option<DenseIndex>,
    pub sparse: SparseIndex,
    pub manifest: IndexManifest,
    /// Incremented on every swap; starts at 1.
    pub generation: u64,
    by_id: HashMap<String, usize>,
}

impl IndexSnapshot {
    fn assemble(
        corpus: Corpus,
        dense: Option<DenseIndex>,
        sparse: SparseIndex,
        manifest: IndexManifest,
        generation: u64,
    ) -> Self {
        let by_id = corpus
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        Self {
            corpus,
            dense,
            sparse,
            manifest,
            generation,
            by_id,
        }
    }

    /// Build both indices from `corpus`. Dense vectors come from `embedder`
    /// unless it is disabled.
    pub async fn build(
        corpus: Corpus,
        embedder: &dyn EmbeddingProvider,
        batch_size: usize,
        generation: u64,
    ) -> Result<Self> {
        let documents = corpus.documents();
        let dense = if embedder.dims() == 0 {
            tracing::warn!("index.dense_disabled");
            None
        } else {
            let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
            let vectors = embed_batched(embedder, &texts, batch_size)
                .await
                .context("index unavailable: embedding provider failed")?;
            Some(DenseIndex::new(
                embedder.model_name(),
                embedder.dims(),
                documents.clone(),
                vectors,
            )?)
        };
        let sparse = SparseIndex::build(documents);
        let manifest = IndexManifest {
            generated_at: Utc::now(),
            source_total: corpus.source_total,
            processed_total: corpus.records.len(),
            embedding_model: dense.as_ref().map(|d| d.model().to_string()),
            fingerprint: corpus_fingerprint(&corpus),
        };
        tracing::info!(
            documents = corpus.records.len(),
            dense = dense.is_some(),
            generation,
            "index.build"
        );
        Ok(Self::assemble(corpus, dense, sparse, manifest, generation))
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.by_id.get(id).map(|&i| &self.corpus.records[i])
    }

    pub fn len(&self) -> usize {
        self.corpus.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corpus.records.is_empty()
    }

    /// Write `dense.json`, `sparse.json` and `manifest.json` into `dir`.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory: {}", dir.display()))?;
        match &self.dense {
            Some(dense) => write_file(&dir.join(DENSE_FILE), &dense.to_json()?)?,
            None => {
                let path = dir.join(DENSE_FILE);
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
            }
        }
        write_file(&dir.join(SPARSE_FILE), &serde_json::to_string(&self.sparse)?)?;
        write_file(
            &dir.join(MANIFEST_FILE),
            &serde_json::to_string_pretty(&self.manifest)?,
        )?;
        tracing::info!(dir = %dir.display(), "index.persisted");
        Ok(())
    }

    /// Load a persisted snapshot for `corpus`.
    ///
    /// Returns `Ok(None)` when nothing usable is on disk: missing files, a
    /// fingerprint or model mismatch. Corrupt files are errors.
    pub fn load(
        dir: &Path,
        corpus: Corpus,
        embedding_model: Option<&str>,
        generation: u64,
    ) -> Result<Option<Self>> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(None);
        }
        let manifest: IndexManifest = serde_json::from_str(&read_file(&manifest_path)?)
            .context("invalid index manifest")?;

        let fingerprint = corpus_fingerprint(&corpus);
        if manifest.fingerprint != fingerprint
            || manifest.embedding_model.as_deref() != embedding_model
        {
            tracing::info!(
                persisted_model = ?manifest.embedding_model,
                current_model = ?embedding_model,
                "index.stale"
            );
            return Ok(None);
        }

        let dense = match embedding_model {
            Some(_) => {
                let path = dir.join(DENSE_FILE);
                if !path.exists() {
                    return Ok(None);
                }
                Some(DenseIndex::from_json(&read_file(&path)?)?)
            }
            None => None,
        };
        let sparse_path = dir.join(SPARSE_FILE);
        if !sparse_path.exists() {
            return Ok(None);
        }
        let sparse = SparseIndex::from_json(&read_file(&sparse_path)?)?;

        tracing::info!(
            documents = corpus.records.len(),
            generated_at = %manifest.generated_at,
            "index.loaded"
        );
        Ok(Some(Self::assemble(
            corpus, dense, sparse, manifest, generation,
        )))
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Owns the current [`IndexSnapshot`] and coordinates rebuilds.
pub struct IndexManager {
    corpus: Arc<dyn CorpusProvider>,
    embedder: Arc<dyn EmbeddingProvider>,
    index_dir: Option<PathBuf>,
    batch_size: usize,
    current: RwLock<Option<Arc<IndexSnapshot>>>,
    rebuild: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl IndexManager {
    /// `index_dir = None` keeps everything in memory.
    pub fn new(
        corpus: Arc<dyn CorpusProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        index_dir: Option<PathBuf>,
        batch_size: usize,
    ) -> Self {
        Self {
            corpus,
            embedder,
            index_dir,
            batch_size,
            current: RwLock::new(None),
            rebuild: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self::new(
            Arc::new(ConfiguredCorpus::new(config.clone())),
            embedder,
            Some(config.storage.index_dir.clone()),
            config.embedding.batch_size,
        )
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    /// The snapshot currently being served, if any.
    pub fn current(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.read().unwrap().clone()
    }

    /// Return a ready snapshot, loading or rebuilding as needed.
    ///
    /// Without `force_refresh` this never rebuilds an existing snapshot and
    /// never waits for an in-flight rebuild.
    pub async fn ensure_ready(&self, force_refresh: bool) -> Result<Arc<IndexSnapshot>> {
        if !force_refresh {
            if let Some(snapshot) = self.current() {
                return Ok(snapshot);
            }
        }

        let observed = self.generation.load(Ordering::SeqCst);
        let _guard = self.rebuild.lock().await;

        if let Some(snapshot) = self.current() {
            let rebuilt_meanwhile = self.generation.load(Ordering::SeqCst) != observed;
            if !force_refresh || rebuilt_meanwhile {
                return Ok(snapshot);
            }
        }

        let snapshot = Arc::new(
            self.load_or_build(force_refresh)
                .await
                .context("index unavailable")?,
        );
        *self.current.write().unwrap() = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn load_or_build(&self, force_refresh: bool) -> Result<IndexSnapshot> {
        let corpus = self.corpus.corpus(force_refresh).await?;
        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let model = (self.embedder.dims() > 0).then(|| self.embedder.model_name().to_string());

        if !force_refresh {
            if let Some(dir) = &self.index_dir {
                match IndexSnapshot::load(dir, corpus.clone(), model.as_deref(), generation) {
                    Ok(Some(snapshot)) => {
                        self.generation.store(generation, Ordering::SeqCst);
                        return Ok(snapshot);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "index.load_failed"),
                }
            }
        }

        let snapshot =
            IndexSnapshot::build(corpus, self.embedder.as_ref(), self.batch_size, generation)
                .await?;
        if let Some(dir) = &self.index_dir {
            snapshot.persist(dir)?;
        }
        self.generation.store(generation, Ordering::SeqCst);
        Ok(snapshot)
    }
}

/// Build (or reuse) the persisted indices and print a summary.
pub async fn run_build_index(config: &Config, force: bool) -> Result<()> {
    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::from(crate::embedding::create_provider(&config.embedding)?);
    let manager = IndexManager::from_config(config, embedder);
    let snapshot = manager.ensure_ready(force).await?;

    println!("Index ready: {}", config.storage.index_dir.display());
    println!("  documents:       {}", snapshot.len());
    println!(
        "  embedding model: {}",
        snapshot
            .manifest
            .embedding_model
            .as_deref()
            .unwrap_or("(dense disabled)")
    );
    println!("  fingerprint:     {}", &snapshot.manifest.fingerprint[..12]);
    println!("ok");
    Ok(())
}
