//! Retrievers and weighted reciprocal-rank fusion.
//!
//! A [`Retriever`] turns a query into a ranked list of documents (rank 1
//! first). [`FusionRetriever`] queries several retrievers and merges their
//! lists:
//!
//! ```text
//! score(d) = Σ_r  w_r / (60 + rank_r(d))
//! ```
//!
//! Documents are identified by [`fusion_key`]. The fused list is sorted by
//! score descending; equal scores keep first-seen order, so the output is
//! fully determined by the input lists and weights. Retrievers with weight
//! zero contribute nothing and are not queried. If any queried retriever
//! fails, the whole retrieval fails.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::index::IndexSnapshot;
use crate::models::{IndexedDocument, RetrievalHit};

/// Reciprocal-rank smoothing constant.
pub const RRF_K: f64 = 60.0;

/// Characters of content used as identity for documents without an id.
pub const FALLBACK_KEY_CHARS: usize = 50;

#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    /// Ranked documents for `text`, most relevant first.
    async fn query(&self, text: &str) -> Result<Vec<IndexedDocument>>;
}

/// Identity of a document during fusion: its id, or else the first
/// [`FALLBACK_KEY_CHARS`] characters of its text.
///
/// The content-prefix fallback collides for documents sharing a prefix.
/// Corpus documents always carry ids; the fallback only applies to ad hoc
/// retrievers.
pub fn fusion_key(doc: &IndexedDocument) -> String {
    match &doc.id {
        Some(id) => format!("id:{}", id),
        None => format!("text:{}", doc.text.chars().take(FALLBACK_KEY_CHARS).collect::<String>()),
    }
}

/// Nearest neighbours in the dense index.
pub struct DenseRetriever {
    snapshot: Arc<IndexSnapshot>,
    embedder: Arc<dyn EmbeddingProvider>,
    k: usize,
}

impl DenseRetriever {
    pub fn new(snapshot: Arc<IndexSnapshot>, embedder: Arc<dyn EmbeddingProvider>, k: usize) -> Self {
        Self {
            snapshot,
            embedder,
            k,
        }
    }
}

#[async_trait]
impl Retriever for DenseRetriever {
    fn name(&self) -> &str {
        "dense"
    }

    async fn query(&self, text: &str) -> Result<Vec<IndexedDocument>> {
        let Some(dense) = &self.snapshot.dense else {
            return Ok(Vec::new());
        };
        if dense.is_empty() {
            return Ok(Vec::new());
        }
        let vector = embed_query(self.embedder.as_ref(), text).await?;
        Ok(dense
            .search(&vector, self.k)
            .into_iter()
            .filter_map(|(pos, _)| dense.document(pos).cloned())
            .collect())
    }
}

/// BM25 matches from the sparse index.
pub struct SparseRetriever {
    snapshot: Arc<IndexSnapshot>,
    k: usize,
}

impl SparseRetriever {
    pub fn new(snapshot: Arc<IndexSnapshot>, k: usize) -> Self {
        Self { snapshot, k }
    }
}

#[async_trait]
impl Retriever for SparseRetriever {
    fn name(&self) -> &str {
        "sparse"
    }

    async fn query(&self, text: &str) -> Result<Vec<IndexedDocument>> {
        let sparse = &self.snapshot.sparse;
        Ok(sparse
            .search(text, self.k)
            .into_iter()
            .filter_map(|(pos, _)| sparse.document(pos).cloned())
            .collect())
    }
}

/// Merge ranked lists with weighted reciprocal-rank fusion.
///
/// Each entry is `(weight, ranked documents)`.
pub fn fuse(lists: &[(f64, Vec<IndexedDocument>)]) -> Vec<RetrievalHit> {
    let mut order: Vec<(IndexedDocument, f64)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (weight, docs) in lists {
        if *weight == 0.0 {
            continue;
        }
        for (i, doc) in docs.iter().enumerate() {
            let contribution = weight / (RRF_K + (i + 1) as f64);
            let key = fusion_key(doc);
            match positions.get(&key) {
                Some(&pos) => order[pos].1 += contribution,
                None => {
                    positions.insert(key, order.len());
                    order.push((doc.clone(), contribution));
                }
            }
        }
    }

    // Stable: equal scores keep first-seen order.
    order.sort_by(|a, b| b.1.total_cmp(&a.1));
    order
        .into_iter()
        .enumerate()
        .map(|(i, (document, score))| RetrievalHit {
            document,
            rank: i + 1,
            score,
        })
        .collect()
}

/// Weighted ensemble of retrievers.
pub struct FusionRetriever {
    members: Vec<(Arc<dyn Retriever>, f64)>,
}

impl FusionRetriever {
    /// # Errors
    ///
    /// Fails for an empty member list or a negative / non-finite weight.
    pub fn new(members: Vec<(Arc<dyn Retriever>, f64)>) -> Result<Self> {
        if members.is_empty() {
            bail!("fusion retriever needs at least one retriever");
        }
        for (retriever, weight) in &members {
            if !weight.is_finite() || *weight < 0.0 {
                bail!(
                    "invalid weight {} for retriever '{}'",
                    weight,
                    retriever.name()
                );
            }
        }
        Ok(Self { members })
    }

    /// Every retriever weighted `1 / n`.
    pub fn uniform(retrievers: Vec<Arc<dyn Retriever>>) -> Result<Self> {
        let weight = 1.0 / retrievers.len().max(1) as f64;
        Self::new(retrievers.into_iter().map(|r| (r, weight)).collect())
    }

    /// Dense + sparse retrievers over `snapshot`, weighted per config.
    /// The dense side is omitted when the snapshot has no dense index.
    pub fn for_snapshot(
        snapshot: Arc<IndexSnapshot>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &RetrievalConfig,
    ) -> Result<Self> {
        let mut members: Vec<(Arc<dyn Retriever>, f64)> = Vec::new();
        if snapshot.dense.is_some() {
            members.push((
                Arc::new(DenseRetriever::new(
                    snapshot.clone(),
                    embedder,
                    config.dense_k,
                )),
                config.dense_weight,
            ));
        }
        members.push((
            Arc::new(SparseRetriever::new(snapshot, config.sparse_k)),
            config.sparse_weight,
        ));
        Self::new(members)
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalHit>> {
        let active: Vec<&(Arc<dyn Retriever>, f64)> =
            self.members.iter().filter(|(_, w)| *w > 0.0).collect();

        let lists = futures::future::try_join_all(active.iter().map(|(retriever, _)| async move {
            let docs = retriever.query(query).await?;
            tracing::debug!(retriever = retriever.name(), hits = docs.len(), "retrieval.query");
            Ok::<_, anyhow::Error>(docs)
        }))
        .await?;

        let weighted: Vec<(f64, Vec<IndexedDocument>)> = active
            .iter()
            .map(|(_, w)| *w)
            .zip(lists)
            .collect();
        let hits = fuse(&weighted);
        tracing::debug!(hits = hits.len(), "retrieval.fused");
        Ok(hits)
    }
}

#[async_trait]
impl Retriever for FusionRetriever {
    fn name(&self) -> &str {
        "fusion"
    }

    async fn query(&self, text: &str) -> Result<Vec<IndexedDocument>> {
        Ok(self
            .retrieve(text)
            .await?
            .into_iter()
            .map(|hit| hit.document)
            .collect())
    }
}
