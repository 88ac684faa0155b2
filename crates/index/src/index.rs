use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};
use crate::persist;

pub type Embedding = Vec<f32>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: String,
    pub section: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ChunkMetadata {
    pub fn new(doc_id: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            section: section.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One stored chunk. `chunk_id` is the row identity and survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub chunk_id: u64,
    pub text: String,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub document: IndexedDocument,
    pub distance: f32,
    pub score: f32,
}

/// Maps a squared L2 distance into `(0, 1]`, 1.0 meaning identical.
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Exhaustive L2 index; vectors are stored row-major in one flat buffer
/// parallel to `documents`.
pub struct VectorIndex {
    dir: PathBuf,
    dimension: usize,
    vectors: Vec<f32>,
    documents: Vec<IndexedDocument>,
    is_trained: bool,
}

impl VectorIndex {
    /// Loads the index persisted in `dir`, or starts an empty one.
    ///
    /// Unreadable or inconsistent files are logged and replaced by a fresh index.
    /// A persisted dimension different from `dimension` is a hard error.
    pub fn open_or_create(dimension: usize, dir: impl AsRef<Path>) -> Result<Self> {
        if dimension == 0 {
            return Err(IndexError::ZeroDimension);
        }
        let dir = dir.as_ref().to_path_buf();
        match persist::load(&dir) {
            Ok(Some(loaded)) => {
                if loaded.dimension != dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: loaded.dimension,
                        actual: dimension,
                    });
                }
                info!(
                    path = %dir.display(),
                    documents = loaded.documents.len(),
                    "loaded vector index"
                );
                Ok(Self {
                    dir,
                    dimension,
                    vectors: loaded.vectors,
                    documents: loaded.documents,
                    is_trained: loaded.is_trained,
                })
            }
            Ok(None) => {
                info!(path = %dir.display(), dimension, "creating empty vector index");
                Ok(Self::empty(dir, dimension))
            }
            Err(IndexError::Corruption(reason)) => {
                warn!(
                    path = %dir.display(),
                    %reason,
                    "persisted index is corrupt, starting fresh"
                );
                Ok(Self::empty(dir, dimension))
            }
            Err(err) => Err(err),
        }
    }

    fn empty(dir: PathBuf, dimension: usize) -> Self {
        Self {
            dir,
            dimension,
            vectors: Vec::new(),
            documents: Vec::new(),
            is_trained: false,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        self.is_trained
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn documents(&self) -> &[IndexedDocument] {
        &self.documents
    }

    /// One-time transition required before the first insertion. The flat
    /// backend has nothing to learn, so this only flips the flag.
    pub fn train(&mut self) {
        if self.is_trained {
            return;
        }
        debug!(dimension = self.dimension, "training vector index");
        self.is_trained = true;
    }

    /// Appends chunks with their embeddings and persists before returning.
    ///
    /// Every embedding is validated up front; on a failed write the in-memory
    /// state is rolled back so memory never runs ahead of disk.
    pub fn add(
        &mut self,
        texts: &[String],
        embeddings: &[Embedding],
        metadata: &ChunkMetadata,
    ) -> Result<Vec<u64>> {
        if texts.len() != embeddings.len() {
            return Err(IndexError::LengthMismatch {
                chunks: texts.len(),
                embeddings: embeddings.len(),
            });
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let was_trained = self.is_trained;
        self.train();
        let first_id = self.next_chunk_id();
        let previous_len = self.documents.len();
        let mut ids = Vec::with_capacity(texts.len());
        for (offset, (text, embedding)) in texts.iter().zip(embeddings).enumerate() {
            let chunk_id = first_id + offset as u64;
            self.vectors.extend_from_slice(embedding);
            self.documents.push(IndexedDocument {
                chunk_id,
                text: text.clone(),
                metadata: metadata.clone(),
            });
            ids.push(chunk_id);
        }

        if let Err(err) = self.flush() {
            self.documents.truncate(previous_len);
            self.vectors.truncate(previous_len * self.dimension);
            self.is_trained = was_trained;
            return Err(err);
        }
        info!(
            doc_id = %metadata.doc_id,
            added = ids.len(),
            total = self.documents.len(),
            "added chunks to vector index"
        );
        Ok(ids)
    }

    /// Up to `top_k` nearest documents, nearest first. Ties keep insertion order.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.documents.is_empty() || top_k == 0 {
            debug!("vector index is empty");
            return Ok(Vec::new());
        }
        let mut distances: Vec<(usize, f32)> = self
            .vectors
            .par_chunks(self.dimension)
            .enumerate()
            .map(|(row, vector)| (row, squared_l2(query, vector)))
            .collect();
        distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        distances.truncate(top_k);
        Ok(distances
            .into_iter()
            .map(|(row, distance)| SearchHit {
                document: self.documents[row].clone(),
                distance,
                score: similarity_from_distance(distance),
            })
            .collect())
    }

    /// Writes the current state to disk.
    pub fn flush(&self) -> Result<()> {
        persist::save(
            &self.dir,
            self.dimension,
            self.is_trained,
            &self.vectors,
            &self.documents,
        )
    }

    fn next_chunk_id(&self) -> u64 {
        self.documents
            .last()
            .map(|doc| doc.chunk_id + 1)
            .unwrap_or(0)
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
