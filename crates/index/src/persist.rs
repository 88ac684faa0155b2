use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{IndexError, Result};
use crate::index::IndexedDocument;

pub const INDEX_FILE: &str = "index.bin";
pub const DOCUMENTS_FILE: &str = "documents.json";

const MAGIC: &[u8; 4] = b"RCVX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 24;

#[derive(Deserialize)]
struct DocumentsFile {
    dimension: usize,
    documents: Vec<IndexedDocument>,
}

pub(crate) struct LoadedIndex {
    pub dimension: usize,
    pub is_trained: bool,
    pub vectors: Vec<f32>,
    pub documents: Vec<IndexedDocument>,
}

/// Writes documents, then vectors. A crash between the two renames leaves more
/// documents than vectors on disk, which `load` repairs by dropping the tail.
pub(crate) fn save(
    dir: &Path,
    dimension: usize,
    is_trained: bool,
    vectors: &[f32],
    documents: &[IndexedDocument],
) -> Result<()> {
    fs::create_dir_all(dir)?;
    let docs = serde_json::to_vec(&DocumentsFileRef {
        dimension,
        documents,
    })?;
    write_atomic(dir, DOCUMENTS_FILE, &docs)?;
    write_atomic(dir, INDEX_FILE, &encode_vectors(dimension, is_trained, vectors))?;
    Ok(())
}

#[derive(Serialize)]
struct DocumentsFileRef<'a> {
    dimension: usize,
    documents: &'a [IndexedDocument],
}

/// `Ok(None)` when nothing was ever persisted in `dir`.
pub(crate) fn load(dir: &Path) -> Result<Option<LoadedIndex>> {
    let index_path = dir.join(INDEX_FILE);
    let docs_path = dir.join(DOCUMENTS_FILE);
    let index_bytes = read_optional(&index_path)?;
    let docs_bytes = read_optional(&docs_path)?;

    let docs_file: Option<DocumentsFile> = match docs_bytes {
        Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(|err| {
            IndexError::Corruption(format!("{}: {err}", docs_path.display()))
        })?),
        None => None,
    };

    match (index_bytes, docs_file) {
        (None, None) => Ok(None),
        (Some(_), None) => Err(IndexError::Corruption(format!(
            "{} exists without {}",
            INDEX_FILE, DOCUMENTS_FILE
        ))),
        (None, Some(docs)) => {
            // The first add died before its vectors landed.
            if !docs.documents.is_empty() {
                warn!(
                    dropped = docs.documents.len(),
                    "discarding documents whose vectors were never written"
                );
            }
            Ok(Some(LoadedIndex {
                dimension: docs.dimension,
                is_trained: false,
                vectors: Vec::new(),
                documents: Vec::new(),
            }))
        }
        (Some(bytes), Some(mut docs)) => {
            let (dimension, is_trained, vectors) = decode_vectors(&bytes)?;
            if docs.dimension != dimension {
                return Err(IndexError::Corruption(format!(
                    "documents were written for dimension {} but vectors have {}",
                    docs.dimension, dimension
                )));
            }
            let count = vectors.len() / dimension;
            if docs.documents.len() < count {
                return Err(IndexError::Corruption(format!(
                    "{} vectors but only {} documents",
                    count,
                    docs.documents.len()
                )));
            }
            if docs.documents.len() > count {
                warn!(
                    dropped = docs.documents.len() - count,
                    "discarding documents from an interrupted add"
                );
                docs.documents.truncate(count);
            }
            if docs
                .documents
                .windows(2)
                .any(|pair| pair[0].chunk_id >= pair[1].chunk_id)
            {
                return Err(IndexError::Corruption(
                    "chunk ids are not strictly increasing".to_string(),
                ));
            }
            Ok(Some(LoadedIndex {
                dimension,
                is_trained,
                vectors,
                documents: docs.documents,
            }))
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(IndexError::Corruption(format!(
            "{} is unreadable: {err}",
            path.display()
        ))),
    }
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|err| err.error)?;
    Ok(())
}

fn encode_vectors(dimension: usize, is_trained: bool, vectors: &[f32]) -> Vec<u8> {
    let count = (vectors.len() / dimension.max(1)) as u64;
    let mut out = Vec::with_capacity(HEADER_LEN + vectors.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(dimension as u32).to_le_bytes());
    out.push(u8::from(is_trained));
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(&count.to_le_bytes());
    for value in vectors {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

fn decode_vectors(bytes: &[u8]) -> Result<(usize, bool, Vec<f32>)> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(IndexError::Corruption("bad index header".to_string()));
    }
    let version = u32::from_le_bytes(word(&bytes[4..8]));
    if version != FORMAT_VERSION {
        return Err(IndexError::Corruption(format!(
            "unsupported index format version {version}"
        )));
    }
    let dimension = u32::from_le_bytes(word(&bytes[8..12])) as usize;
    if dimension == 0 {
        return Err(IndexError::Corruption("index dimension is zero".to_string()));
    }
    let is_trained = bytes[12] != 0;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[16..24]);
    let count = u64::from_le_bytes(count_bytes) as usize;
    let body = &bytes[HEADER_LEN..];
    let expected = count
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| IndexError::Corruption("vector count overflows".to_string()))?;
    if body.len() != expected {
        return Err(IndexError::Corruption(format!(
            "expected {expected} bytes of vectors, found {}",
            body.len()
        )));
    }
    let vectors = body
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes(word(raw)))
        .collect();
    Ok((dimension, is_trained, vectors))
}

fn word(raw: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&raw[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_encode_and_decode() {
        let bytes = encode_vectors(2, true, &[1.0, 2.0, 3.0, 4.0]);
        let (dimension, trained, vectors) = decode_vectors(&bytes).unwrap();
        assert_eq!(dimension, 2);
        assert!(trained);
        assert_eq!(vectors, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn truncated_body_is_corruption() {
        let mut bytes = encode_vectors(2, true, &[1.0, 2.0]);
        bytes.pop();
        assert!(matches!(
            decode_vectors(&bytes),
            Err(IndexError::Corruption(_))
        ));
    }

    #[test]
    fn empty_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }
}
