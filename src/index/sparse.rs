//! Okapi BM25 lexical index.
//!
//! Scoring follows the classic Okapi formulation:
//!
//! ```text
//! idf(t)      = ln(N - n_t + 0.5) - ln(n_t + 0.5)
//! score(d, q) = Σ_t idf(t) · tf·(k1 + 1) / (tf + k1·(1 - b + b·|d|/avgdl))
//! ```
//!
//! Terms whose IDF would be negative (present in more than half the corpus)
//! are floored at `epsilon × mean IDF`. Only documents sharing at least one
//! term with the query are ranked.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::IndexedDocument;

pub const DEFAULT_K1: f64 = 1.5;
pub const DEFAULT_B: f64 = 0.75;
pub const DEFAULT_EPSILON: f64 = 0.25;

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
    pub epsilon: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: DEFAULT_K1,
            b: DEFAULT_B,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

/// One term's occurrences: `(document position, term frequency)`.
type Postings = Vec<(u32, u32)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseIndex {
    params: Bm25Params,
    documents: Vec<IndexedDocument>,
    doc_lens: Vec<u32>,
    avgdl: f64,
    postings: BTreeMap<String, Postings>,
    idf: BTreeMap<String, f64>,
}

impl SparseIndex {
    pub fn build(documents: Vec<IndexedDocument>) -> Self {
        Self::build_with(documents, Bm25Params::default())
    }

    pub fn build_with(documents: Vec<IndexedDocument>, params: Bm25Params) -> Self {
        let mut postings: BTreeMap<String, Postings> = BTreeMap::new();
        let mut doc_lens = Vec::with_capacity(documents.len());

        for (pos, doc) in documents.iter().enumerate() {
            let tokens = tokenize(&doc.text);
            doc_lens.push(tokens.len() as u32);
            let mut tf: BTreeMap<String, u32> = BTreeMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for (term, count) in tf {
                postings.entry(term).or_default().push((pos as u32, count));
            }
        }

        let n = documents.len() as f64;
        let avgdl = if documents.is_empty() {
            0.0
        } else {
            doc_lens.iter().map(|&l| l as f64).sum::<f64>() / n
        };

        let mut idf = BTreeMap::new();
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();
        for (term, list) in &postings {
            let df = list.len() as f64;
            let value = (n - df + 0.5).ln() - (df + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(term.clone());
            }
            idf.insert(term.clone(), value);
        }
        if !idf.is_empty() {
            let floor = params.epsilon * idf_sum / idf.len() as f64;
            for term in negative {
                idf.insert(term, floor);
            }
        }

        tracing::debug!(
            documents = documents.len(),
            terms = postings.len(),
            "index.sparse.build"
        );

        Self {
            params,
            documents,
            doc_lens,
            avgdl,
            postings,
            idf,
        }
    }

    /// Parse a persisted index, rejecting postings that do not fit its
    /// document table.
    pub fn from_json(json: &str) -> Result<Self> {
        let index: Self = serde_json::from_str(json).context("invalid sparse index file")?;
        if index.doc_lens.len() != index.documents.len() {
            bail!(
                "sparse index has {} document lengths for {} documents",
                index.doc_lens.len(),
                index.documents.len()
            );
        }
        for (term, list) in &index.postings {
            if !index.idf.contains_key(term) {
                bail!("sparse index term '{}' has no idf", term);
            }
            let out_of_range = list
                .iter()
                .find(|(pos, _)| *pos as usize >= index.documents.len());
            if let Some(&(pos, _)) = out_of_range {
                bail!(
                    "sparse index term '{}' points at document {} of {}",
                    term,
                    pos,
                    index.documents.len()
                );
            }
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn document(&self, pos: usize) -> Option<&IndexedDocument> {
        self.documents.get(pos)
    }

    /// Top `k` documents for `query` as `(position, score)`, best first.
    /// Equal scores keep corpus order.
    pub fn search(&self, query: &str, k: usize) -> Vec<(usize, f64)> {
        if self.documents.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scores: BTreeMap<usize, f64> = BTreeMap::new();
        for term in tokenize(query) {
            let (Some(list), Some(&idf)) = (self.postings.get(&term), self.idf.get(&term)) else {
                continue;
            };
            for &(pos, tf) in list {
                let pos = pos as usize;
                let Some(&dl) = self.doc_lens.get(pos) else {
                    continue;
                };
                let tf = tf as f64;
                let dl = dl as f64;
                let norm = if self.avgdl > 0.0 { dl / self.avgdl } else { 1.0 };
                let denom = tf + self.params.k1 * (1.0 - self.params.b + self.params.b * norm);
                *scores.entry(pos).or_insert(0.0) += idf * tf * (self.params.k1 + 1.0) / denom;
            }
        }

        let mut ranked: Vec<(usize, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}
