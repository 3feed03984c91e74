//! Brute-force dense vector index.
//!
//! Every document carries one embedding; queries score all of them by
//! cosine similarity. Corpora are memory-resident and small, so no ANN
//! structure is needed.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::IndexedDocument;

#[derive(Debug, Clone)]
pub struct DenseIndex {
    model: String,
    dims: usize,
    documents: Vec<IndexedDocument>,
    vectors: Vec<Vec<f32>>,
}

/// On-disk form: vectors as base64 little-endian `f32`.
#[derive(Debug, Serialize, Deserialize)]
struct DenseFile {
    model: String,
    dims: usize,
    entries: Vec<DenseEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DenseEntry {
    id: Option<String>,
    text: String,
    vector: String,
}

impl DenseIndex {
    pub fn new(
        model: &str,
        dims: usize,
        documents: Vec<IndexedDocument>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if documents.len() != vectors.len() {
            bail!(
                "dense index needs one vector per document ({} documents, {} vectors)",
                documents.len(),
                vectors.len()
            );
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            bail!("dense vector has {} dims, expected {}", bad.len(), dims);
        }
        Ok(Self {
            model: model.to_string(),
            dims,
            documents,
            vectors,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn document(&self, pos: usize) -> Option<&IndexedDocument> {
        self.documents.get(pos)
    }

    /// Top `k` documents by cosine similarity as `(position, similarity)`.
    /// Equal similarities keep corpus order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(pos, v)| (pos, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    pub fn to_json(&self) -> Result<String> {
        let file = DenseFile {
            model: self.model.clone(),
            dims: self.dims,
            entries: self
                .documents
                .iter()
                .zip(&self.vectors)
                .map(|(doc, v)| DenseEntry {
                    id: doc.id.clone(),
                    text: doc.text.clone(),
                    vector: STANDARD.encode(vec_to_blob(v)),
                })
                .collect(),
        };
        Ok(serde_json::to_string(&file)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: DenseFile = serde_json::from_str(json).context("invalid dense index file")?;
        let mut documents = Vec::with_capacity(file.entries.len());
        let mut vectors = Vec::with_capacity(file.entries.len());
        for entry in file.entries {
            let bytes = STANDARD
                .decode(entry.vector.as_bytes())
                .context("invalid base64 vector in dense index")?;
            vectors.push(blob_to_vec(&bytes));
            documents.push(IndexedDocument {
                id: entry.id,
                text: entry.text,
            });
        }
        Self::new(&file.model, file.dims, documents, vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> IndexedDocument {
        IndexedDocument {
            id: Some(id.to_string()),
            text: format!("text of {}", id),
        }
    }

    fn index() -> DenseIndex {
        DenseIndex::new(
            "test",
            2,
            vec![doc("a"), doc("b"), doc("c")],
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]],
        )
        .unwrap()
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let hits = index().search(&[1.0, 0.1], 3);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![0, 2, 1]);
    }

    #[test]
    fn test_search_truncates_to_k() {
        assert_eq!(index().search(&[1.0, 0.0], 1).len(), 1);
    }

    #[test]
    fn test_rejects_mismatched_vectors() {
        assert!(DenseIndex::new("m", 2, vec![doc("a")], vec![]).is_err());
        assert!(DenseIndex::new("m", 2, vec![doc("a")], vec![vec![1.0]]).is_err());
    }

    #[test]
    fn test_json_roundtrip_is_lossless() {
        let original = index();
        let restored = DenseIndex::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(restored.model(), "test");
        assert_eq!(restored.vectors, original.vectors);
        assert_eq!(restored.documents, original.documents);
    }
}
